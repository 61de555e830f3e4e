//! HTTP CONNECT frontend
//!
//! Accepts plain TCP, reads exactly one `CONNECT host:port HTTP/1.1` request
//! and relays raw bytes once the agent has dialed. Nothing past the header
//! terminator is consumed as part of the handshake; bytes the client sent
//! early are forwarded to the destination.

use crate::connection::{ConnectionReader, ConnectionWriter};
use crate::error::DialError;
use crate::multiplexer::{DialTarget, Multiplexer};
use backhaul_proto::RequestContext;
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const MAX_HEADER_SIZE: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;

/// How long a failed tunnel waits for the client's first bytes before closing
const UNREAD_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum HttpConnectError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("request header too large")]
    HeaderTooLarge,

    #[error("method {0} not allowed")]
    MethodNotAllowed(String),

    #[error("client closed before sending a request")]
    ClientClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct HttpConnectConfig {
    /// Bound on the wait for the agent's dial answer
    pub dial_timeout: Option<Duration>,
}

pub struct HttpConnectService {
    mux: Arc<Multiplexer>,
    config: HttpConnectConfig,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    active: Arc<AtomicUsize>,
}

/// Keeps the active count accurate on every exit path
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(active.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl HttpConnectService {
    pub fn new(mux: Arc<Multiplexer>, config: HttpConnectConfig, shutdown: CancellationToken) -> Self {
        Self {
            mux,
            config,
            shutdown,
            tasks: TaskTracker::new(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Client connections accepted and not yet finished
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("HTTP CONNECT service listening on {}", addr);
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let guard = ActiveGuard::new(&self.active);
                        let service = self.clone();
                        self.tasks.spawn(async move {
                            service.handle(stream, peer_addr).await;
                            drop(guard);
                        });
                    }
                    Err(e) => error!("Failed to accept HTTP CONNECT connection: {}", e),
                },
            }
        }

        drop(listener);
        self.tasks.close();
        self.tasks.wait().await;
        debug!("HTTP CONNECT service stopped");
    }

    async fn handle(&self, mut stream: TcpStream, peer_addr: SocketAddr) {
        let ctx = RequestContext::from_token(self.shutdown.child_token());

        let (address, leftover) = match read_request(&mut stream).await {
            Ok(request) => request,
            Err(HttpConnectError::ClientClosed) => return,
            Err(HttpConnectError::MethodNotAllowed(method)) => {
                debug!(peer = %peer_addr, method = %method, "Rejecting non-CONNECT request");
                let _ = write_response(
                    &mut stream,
                    "405 Method Not Allowed",
                    "this proxy only supports CONNECT passthrough",
                )
                .await;
                return;
            }
            Err(e) => {
                warn!(peer = %peer_addr, "Bad CONNECT request: {}", e);
                let _ = write_response(&mut stream, "400 Bad Request", &e.to_string()).await;
                return;
            }
        };

        let target = DialTarget::new("tcp", address.clone()).with_timeout(self.config.dial_timeout);
        let pending = match self.mux.start_dial(&ctx, target) {
            Ok(pending) => pending,
            Err(e) => {
                warn!(peer = %peer_addr, address = %address, "CONNECT dial failed: {}", e);
                let _ = write_response(
                    &mut stream,
                    "503 Service Unavailable",
                    &format!("currently no tunnels available: {}", e),
                )
                .await;
                return;
            }
        };

        if let Err(e) = stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
        {
            debug!(peer = %peer_addr, "Client went away during CONNECT: {}", e);
            return;
        }

        let conn = match pending.wait().await {
            Ok(conn) => conn,
            Err(e) => {
                self.fail_in_band(stream, peer_addr, &address, e).await;
                return;
            }
        };

        info!(
            peer = %peer_addr,
            address = %address,
            connect_id = conn.connect_id(),
            "CONNECT tunnel established"
        );
        let (reader, writer) = conn.split();
        let (client_read, client_write) = stream.into_split();
        relay(client_read, client_write, reader, writer, leftover, ctx).await;
        debug!(peer = %peer_addr, address = %address, "CONNECT tunnel finished");
    }

    /// The 200 is already out; report the failure inside the tunnel, then close.
    ///
    /// A client that is already sending through the tunnel sees the close as
    /// a reset, since its bytes are left unread.
    async fn fail_in_band(&self, mut stream: TcpStream, peer_addr: SocketAddr, address: &str, err: DialError) {
        warn!(peer = %peer_addr, address = %address, "CONNECT dial failed: {}", err);
        if write_response(&mut stream, "503 Service Unavailable", &err.to_string())
            .await
            .is_err()
        {
            return;
        }
        // Let a request already in flight arrive, without consuming it
        let mut first = [0u8; 1];
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::timeout(UNREAD_GRACE, stream.peek(&mut first)) => {}
        }
    }
}

/// Read until the end of the request header. Returns the CONNECT authority and
/// whatever the client sent after the header.
async fn read_request<S>(stream: &mut S) -> Result<(String, BytesMut), HttpConnectError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            if buf.is_empty() {
                return Err(HttpConnectError::ClientClosed);
            }
            return Err(HttpConnectError::Malformed("unexpected end of request".into()));
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buf) {
            Ok(httparse::Status::Complete(header_len)) => {
                let method = request.method.unwrap_or_default();
                if !method.eq_ignore_ascii_case("CONNECT") {
                    return Err(HttpConnectError::MethodNotAllowed(method.to_string()));
                }
                let address = request
                    .path
                    .filter(|path| !path.is_empty())
                    .ok_or_else(|| HttpConnectError::Malformed("missing authority".into()))?
                    .to_string();
                if !address.contains(':') {
                    return Err(HttpConnectError::Malformed(format!(
                        "authority {} has no port",
                        address
                    )));
                }
                buf.advance(header_len);
                return Ok((address, buf));
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() >= MAX_HEADER_SIZE {
                    return Err(HttpConnectError::HeaderTooLarge);
                }
            }
            Err(e) => return Err(HttpConnectError::Malformed(e.to_string())),
        }
    }
}

async fn write_response<S>(stream: &mut S, status: &str, body: &str) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain; charset=utf-8\r\nConnection: close\r\n\r\n{}",
        status, body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

/// Copy bytes both ways until the destination side finishes.
///
/// Client EOF half-closes towards the agent; destination EOF or error ends
/// the whole relay.
async fn relay<R, W>(
    mut client_read: R,
    mut client_write: W,
    mut reader: ConnectionReader,
    mut writer: ConnectionWriter,
    leftover: BytesMut,
    ctx: RequestContext,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let done = ctx.child();
    let upstream_done = done.clone();
    let upstream = tokio::spawn(async move {
        let copy = async {
            if !leftover.is_empty() {
                writer.write_all(&leftover).await?;
            }
            tokio::io::copy(&mut client_read, &mut writer).await?;
            writer.shutdown().await
        };
        tokio::select! {
            _ = upstream_done.done() => {}
            result = copy => {
                if let Err(e) = result {
                    debug!("Client to agent copy ended: {}", e);
                    upstream_done.cancel();
                }
            }
        }
        writer
    });

    let downstream_done = done.clone();
    let downstream = tokio::spawn(async move {
        tokio::select! {
            _ = downstream_done.done() => {}
            result = tokio::io::copy(&mut reader, &mut client_write) => {
                if let Err(e) = result {
                    debug!("Agent to client copy ended: {}", e);
                }
                let _ = client_write.shutdown().await;
            }
        }
        downstream_done.cancel();
        reader
    });

    // Both halves come back so the connection closes only after both copies stop
    let (_writer, _reader) = tokio::join!(upstream, downstream);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_request_keeps_bytes_after_header() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n\r\nhello")
            .await
            .unwrap();

        let (address, leftover) = read_request(&mut server).await.unwrap();
        assert_eq!(address, "example.com:443");
        assert_eq!(&leftover[..], b"hello");
    }

    #[tokio::test]
    async fn test_read_request_across_reads() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let writer = tokio::spawn(async move {
            client.write_all(b"CONNECT 10.0.0.1:80 HT").await.unwrap();
            tokio::task::yield_now().await;
            client.write_all(b"TP/1.1\r\n\r\n").await.unwrap();
            client
        });

        let (address, leftover) = read_request(&mut server).await.unwrap();
        assert_eq!(address, "10.0.0.1:80");
        assert!(leftover.is_empty());
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_request_rejects_other_methods() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        match read_request(&mut server).await {
            Err(HttpConnectError::MethodNotAllowed(method)) => assert_eq!(method, "GET"),
            other => panic!("unexpected result: {:?}", other.map(|(a, _)| a)),
        }
    }

    #[tokio::test]
    async fn test_read_request_requires_port() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"CONNECT example.com HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        assert!(matches!(
            read_request(&mut server).await,
            Err(HttpConnectError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_read_request_client_closed() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);

        assert!(matches!(
            read_request(&mut server).await,
            Err(HttpConnectError::ClientClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_request_header_too_large() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let mut request = b"CONNECT example.com:443 HTTP/1.1\r\n".to_vec();
        request.extend(std::iter::repeat(b'a').take(MAX_HEADER_SIZE + 10));
        client.write_all(&request).await.unwrap();

        assert!(matches!(
            read_request(&mut server).await,
            Err(HttpConnectError::HeaderTooLarge) | Err(HttpConnectError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_write_response_format() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_response(&mut server, "503 Service Unavailable", "no such host")
            .await
            .unwrap();
        drop(server);

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(out.ends_with("\r\n\r\nno such host"));
    }

    fn service() -> HttpConnectService {
        use crate::registry::BackendRegistry;
        use crate::strategy::DefaultStrategy;
        use backhaul_metrics::ServerMetrics;

        let metrics = ServerMetrics::new();
        let registry = Arc::new(BackendRegistry::new(vec![Arc::new(DefaultStrategy)], metrics.clone()));
        let mux = Arc::new(Multiplexer::new(registry, metrics, 1024));
        HttpConnectService::new(mux, HttpConnectConfig { dial_timeout: None }, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_failed_tunnel_resets_client_with_unread_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer_addr) = listener.accept().await.unwrap();

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        service()
            .fail_in_band(stream, peer_addr, "x:80", DialError::Endpoint("connection refused".into()))
            .await;

        let mut out = Vec::new();
        let err = client.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(text.ends_with("connection refused"));
    }

    #[tokio::test]
    async fn test_failed_tunnel_closes_quiet_client_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer_addr) = listener.accept().await.unwrap();

        service()
            .fail_in_band(stream, peer_addr, "x:80", DialError::Endpoint("no such host".into()))
            .await;

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert!(out.ends_with("\r\n\r\nno such host"));
    }
}
