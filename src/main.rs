//! Backhaul CLI
//!
//! Runs either the broker (`backhaul server`) or the agent (`backhaul agent`).

use anyhow::{Context, Result};
use backhaul_agent::{AgentConfig, ClientSet};
use backhaul_metrics::{AgentMetrics, ServerMetrics};
use backhaul_server::{ProxyServer, ServerConfig, StrategyKind};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Backhaul - reach isolated networks through agent-held tunnels
#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ", built ", env!("BUILD_TIME"), ")"))]
struct Cli {
    /// Log level or filter directive (overridden by RUST_LOG)
    #[arg(long, global = true, env = "BACKHAUL_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// YAML configuration file; flags override its values
    #[arg(long, global = true, env = "BACKHAUL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the broker
    #[command(long_about = r#"
Run the broker. Agents connect to the agent listener; clients reach
destinations behind them through the tunnel listener or the HTTP CONNECT
listener.

EXAMPLES:
  backhaul server --agent-bind 0.0.0.0:8091 --http-connect-bind 0.0.0.0:8090
  backhaul server --config broker.yaml --server-count 3
    "#)]
    Server {
        /// Listener for agent links
        #[arg(long, env = "BACKHAUL_AGENT_BIND")]
        agent_bind: Option<String>,

        /// Listener for tunnel client sessions
        #[arg(long, env = "BACKHAUL_TUNNEL_BIND")]
        tunnel_bind: Option<String>,

        /// Listener for HTTP CONNECT clients
        #[arg(long, env = "BACKHAUL_HTTP_CONNECT_BIND")]
        http_connect_bind: Option<String>,

        /// Identity of this broker replica (random if unset)
        #[arg(long, env = "BACKHAUL_SERVER_ID")]
        server_id: Option<String>,

        /// Number of broker replicas agents should link to
        #[arg(long, env = "BACKHAUL_SERVER_COUNT")]
        server_count: Option<u32>,

        /// Backend selection strategies, tried in order (default, dest-host)
        #[arg(long, env = "BACKHAUL_PROXY_STRATEGIES", value_delimiter = ',')]
        proxy_strategies: Option<Vec<StrategyKind>>,

        /// Close tunnel sessions idle for this many milliseconds (0 disables)
        #[arg(long, env = "BACKHAUL_FRONTEND_IDLE_TIMEOUT_MS")]
        frontend_idle_timeout_ms: Option<u64>,
    },

    /// Run an agent inside the isolated network
    #[command(long_about = r#"
Run an agent. The agent links to every broker replica and dials
destinations on the brokers' behalf.

EXAMPLES:
  backhaul agent --broker-address broker.example.com:8091 --agent-id dc1
  backhaul agent --broker-address 10.0.0.2:8091 --agent-identifiers db.internal,cache.internal
    "#)]
    Agent {
        /// Broker agent listener
        #[arg(long, env = "BACKHAUL_BROKER_ADDRESS")]
        broker_address: Option<String>,

        /// Agent identity (random if unset)
        #[arg(long, env = "BACKHAUL_AGENT_ID")]
        agent_id: Option<String>,

        /// Destination hosts this agent serves
        #[arg(long, env = "BACKHAUL_AGENT_IDENTIFIERS", value_delimiter = ',')]
        agent_identifiers: Option<Vec<String>>,

        /// Links to keep, overriding the count the broker announces
        #[arg(long, env = "BACKHAUL_SERVER_COUNT")]
        server_count: Option<u32>,

        /// Sync interval in milliseconds
        #[arg(long, env = "BACKHAUL_SYNC_INTERVAL_MS")]
        sync_interval_ms: Option<u64>,

        /// Probe interval in milliseconds
        #[arg(long, env = "BACKHAUL_PROBE_INTERVAL_MS")]
        probe_interval_ms: Option<u64>,

        /// Destination dial timeout in milliseconds
        #[arg(long, env = "BACKHAUL_DIAL_TIMEOUT_MS")]
        dial_timeout_ms: Option<u64>,
    },
}

fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Config from the YAML file, or defaults when none was given
fn load_config<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

async fn run_server(config: ServerConfig) -> Result<()> {
    info!(
        version = env!("GIT_TAG"),
        commit = env!("GIT_HASH"),
        "Backhaul server starting"
    );
    let mut server =
        ProxyServer::new(config, ServerMetrics::new()).context("Invalid server configuration")?;
    let bound = server.start().await.context("Failed to start server")?;
    info!(server_id = %server.config().server_id, ?bound, "Backhaul server running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    server.shutdown().await;
    Ok(())
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    info!(
        version = env!("GIT_TAG"),
        agent_id = %config.agent_id,
        broker = %config.broker_address,
        "Backhaul agent starting"
    );
    let set = ClientSet::new(config, AgentMetrics::new()).context("Invalid agent configuration")?;
    set.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    set.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    match cli.command {
        Commands::Server {
            agent_bind,
            tunnel_bind,
            http_connect_bind,
            server_id,
            server_count,
            proxy_strategies,
            frontend_idle_timeout_ms,
        } => {
            let mut config: ServerConfig = load_config(cli.config.as_deref())?;
            if let Some(addr) = agent_bind {
                config = config.with_agent_bind(addr);
            }
            if let Some(addr) = tunnel_bind {
                config = config.with_tunnel_bind(addr);
            }
            if let Some(addr) = http_connect_bind {
                config = config.with_http_connect_bind(addr);
            }
            if let Some(id) = server_id {
                config = config.with_server_id(id);
            }
            if let Some(count) = server_count {
                config = config.with_server_count(count);
            }
            if let Some(strategies) = proxy_strategies {
                config = config.with_strategies(strategies);
            }
            if let Some(ms) = frontend_idle_timeout_ms {
                config = config.with_frontend_idle_timeout(Duration::from_millis(ms));
            }
            run_server(config).await
        }
        Commands::Agent {
            broker_address,
            agent_id,
            agent_identifiers,
            server_count,
            sync_interval_ms,
            probe_interval_ms,
            dial_timeout_ms,
        } => {
            let mut config: AgentConfig = load_config(cli.config.as_deref())?;
            if let Some(addr) = broker_address {
                config.broker_address = addr;
            }
            if let Some(id) = agent_id {
                config = config.with_agent_id(id);
            }
            if let Some(identifiers) = agent_identifiers {
                config = config.with_agent_identifiers(identifiers);
            }
            if let Some(count) = server_count {
                config = config.with_server_count(count);
            }
            if let Some(ms) = sync_interval_ms {
                config = config.with_sync_interval(Duration::from_millis(ms));
            }
            if let Some(ms) = probe_interval_ms {
                config = config.with_probe_interval(Duration::from_millis(ms));
            }
            if let Some(ms) = dial_timeout_ms {
                config = config.with_dial_timeout(Duration::from_millis(ms));
            }
            run_agent(config).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_parses_server_flags() {
        let cli = Cli::try_parse_from([
            "backhaul",
            "server",
            "--agent-bind",
            "127.0.0.1:8091",
            "--proxy-strategies",
            "dest-host,default",
        ])
        .unwrap();
        match cli.command {
            Commands::Server {
                agent_bind,
                proxy_strategies,
                ..
            } => {
                assert_eq!(agent_bind.as_deref(), Some("127.0.0.1:8091"));
                assert_eq!(
                    proxy_strategies,
                    Some(vec![StrategyKind::DestHost, StrategyKind::Default])
                );
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_load_config_from_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "agent_bind: \"127.0.0.1:8091\"\nhttp_connect_bind: \"127.0.0.1:8090\"\nserver_count: 3\nstrategies: [dest-host, default]"
        )
        .unwrap();

        let config: ServerConfig = load_config(Some(file.path())).unwrap();
        assert_eq!(config.agent_bind.as_deref(), Some("127.0.0.1:8091"));
        assert_eq!(config.server_count, 3);
        assert_eq!(
            config.strategies,
            vec![StrategyKind::DestHost, StrategyKind::Default]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_without_file_uses_defaults() {
        let config: AgentConfig = load_config(None).unwrap();
        assert_eq!(config.dial_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_config_missing_file() {
        let result: Result<AgentConfig> = load_config(Some(Path::new("/nonexistent/backhaul.yaml")));
        assert!(result.is_err());
    }
}
