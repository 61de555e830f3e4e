//! Dials real destinations on behalf of the broker

use backhaul_metrics::AgentDialFailure;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};

/// A failed dial, with the category the agent counts it under
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DialFailure {
    pub reason: AgentDialFailure,
    pub message: String,
}

impl DialFailure {
    fn unknown(message: String) -> Self {
        Self {
            reason: AgentDialFailure::Unknown,
            message,
        }
    }
}

impl fmt::Display for DialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Connect to `address` (`host:port`), giving up after `timeout`.
///
/// Resolution and connection attempts share the same deadline.
pub(crate) async fn dial_tcp(address: &str, timeout: Duration) -> Result<TcpStream, DialFailure> {
    match tokio::time::timeout(timeout, connect(address)).await {
        Ok(result) => result,
        Err(_) => Err(DialFailure {
            reason: AgentDialFailure::Timeout,
            message: format!("dial tcp {}: i/o timeout", address),
        }),
    }
}

async fn connect(address: &str) -> Result<TcpStream, DialFailure> {
    let addrs = lookup_host(address)
        .await
        .map_err(|e| DialFailure::unknown(lookup_error(address, &e)))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => last_error = Some(connect_error(&addr.to_string(), &e)),
        }
    }

    Err(DialFailure::unknown(last_error.unwrap_or_else(|| {
        format!("dial tcp: lookup {}: no such host", host_of(address))
    })))
}

fn lookup_error(address: &str, err: &io::Error) -> String {
    if err.kind() == io::ErrorKind::InvalidInput {
        return format!("dial tcp: address {}: {}", address, err);
    }
    format!("dial tcp: lookup {}: no such host", host_of(address))
}

fn connect_error(addr: &str, err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => {
            format!("dial tcp {}: connect: connection refused", addr)
        }
        io::ErrorKind::TimedOut => format!("dial tcp {}: i/o timeout", addr),
        _ => format!("dial tcp {}: connect: {}", addr, err),
    }
}

fn host_of(address: &str) -> &str {
    address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address)
        .trim_start_matches('[')
        .trim_end_matches(']')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let stream = dial_tcp(&addr, Duration::from_secs(5)).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().to_string(), addr);
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = dial_tcp(&addr, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.reason, AgentDialFailure::Unknown);
        assert_eq!(
            err.message,
            format!("dial tcp {}: connect: connection refused", addr)
        );
    }

    #[tokio::test]
    async fn test_dial_unresolvable_host() {
        let err = dial_tcp("does-not-exist.invalid:80", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.reason, AgentDialFailure::Unknown);
        assert!(err.message.contains("no such host"), "{}", err.message);
    }

    #[tokio::test]
    async fn test_dial_missing_port() {
        let err = dial_tcp("localhost", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.reason, AgentDialFailure::Unknown);
        assert!(err.message.starts_with("dial tcp: address localhost"));
    }

    /// Loopback listener whose accept queue is full, so new SYNs are dropped
    async fn saturated_listener() -> (TcpListener, String, Vec<TcpStream>) {
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut held = Vec::new();
        for _ in 0..16 {
            match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => held.push(stream),
                _ => return (listener, addr, held),
            }
        }
        panic!("accept queue never filled");
    }

    #[tokio::test]
    async fn test_dial_timeout() {
        let (_listener, addr, _held) = saturated_listener().await;

        let err = dial_tcp(&addr, Duration::from_millis(300)).await.unwrap_err();
        assert_eq!(err.reason, AgentDialFailure::Timeout);
        assert_eq!(err.message, format!("dial tcp {}: i/o timeout", addr));
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("example.com:80"), "example.com");
        assert_eq!(host_of("[::1]:443"), "::1");
        assert_eq!(host_of("example.com"), "example.com");
    }
}
