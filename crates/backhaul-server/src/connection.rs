//! Handle to an established logical connection
//!
//! The handle splits into a [`ConnectionReader`] and a [`ConnectionWriter`] so
//! each relay direction can run in its own task. Shutting the writer down
//! sends an ordered `CloseRequest` and keeps reading until the agent confirms;
//! dropping both halves, or canceling the dial context, closes abortively.

use crate::backend::Backend;
use backhaul_proto::{ConnectId, ContextError, Frame, Packet, RequestContext};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::debug;

/// Delivered by the backend reader to a connection handle
#[derive(Debug)]
pub(crate) enum Inbound {
    Data(Bytes),
    /// The connection ended; `Some` carries an error to surface to the reader
    Closed(Option<String>),
}

/// Lifecycle of an established connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Established,
    /// `CloseRequest` sent, waiting for the agent's `CloseResponse`
    Closing,
    Closed,
}

struct Shared {
    connect_id: ConnectId,
    address: String,
    backend: Arc<Backend>,
    state: Mutex<ConnectionState>,
    /// Canceled once the connection reaches `Closed`
    closed: CancellationToken,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// Abortive close: release the slot and send `CloseRequest` out of band
    fn close_now(&self, error: Option<String>) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ConnectionState::Closed => return,
                ConnectionState::Established => {
                    self.backend.abort_connection(self.connect_id, error);
                }
                ConnectionState::Closing => {
                    // CloseRequest already sent in order
                    self.backend.release(self.connect_id);
                }
            }
            *state = ConnectionState::Closed;
        }
        self.closed.cancel();
    }

    /// Move to `Closing`; false if the connection already left `Established`
    fn begin_close(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state != ConnectionState::Established {
            return false;
        }
        *state = ConnectionState::Closing;
        true
    }

    /// The agent confirmed or the backend ended the connection
    fn finish(&self) {
        *self.state.lock().unwrap() = ConnectionState::Closed;
        self.backend.release(self.connect_id);
        self.closed.cancel();
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.close_now(None);
    }
}

/// An established connection through an agent
pub struct ProxyConnection {
    reader: ConnectionReader,
    writer: ConnectionWriter,
}

impl std::fmt::Debug for ProxyConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConnection")
            .field("connect_id", &self.connect_id())
            .field("address", &self.address())
            .field("state", &self.state())
            .finish()
    }
}

impl ProxyConnection {
    pub(crate) fn new(
        backend: Arc<Backend>,
        connect_id: ConnectId,
        address: String,
        inbound: mpsc::Receiver<Inbound>,
        ctx: RequestContext,
        chunk_size: usize,
    ) -> Self {
        let outbound = backend.outbound();
        let shared = Arc::new(Shared {
            connect_id,
            address,
            backend: backend.clone(),
            state: Mutex::new(ConnectionState::Established),
            closed: CancellationToken::new(),
        });

        // Close the connection when the dial context ends after establishment
        let watched = Arc::downgrade(&shared);
        let closed = shared.closed.clone();
        let backend_closed = backend.shutdown_token().clone();
        backend.spawn(async move {
            tokio::select! {
                err = ctx.done() => {
                    if let Some(shared) = watched.upgrade() {
                        debug!(connect_id, "Dial context ended: {}", err);
                        shared.close_now(Some(err.to_string()));
                    }
                }
                _ = closed.cancelled() => {}
                _ = backend_closed.cancelled() => {}
            }
        });

        let closed = shared.closed.clone();
        Self {
            reader: ConnectionReader {
                shared: shared.clone(),
                inbound,
                buffer: Bytes::new(),
                eof: false,
            },
            writer: ConnectionWriter {
                shared,
                sender: PollSender::new(outbound),
                closed: closed.cancelled_owned().boxed(),
                chunk_size,
            },
        }
    }

    pub fn connect_id(&self) -> ConnectId {
        self.reader.shared.connect_id
    }

    /// Destination the agent dialed
    pub fn address(&self) -> &str {
        &self.reader.shared.address
    }

    pub fn state(&self) -> ConnectionState {
        self.reader.shared.state()
    }

    pub fn split(self) -> (ConnectionReader, ConnectionWriter) {
        (self.reader, self.writer)
    }

    /// Close immediately and release the connection token. Idempotent.
    pub fn close(&self) {
        self.reader.shared.close_now(None);
    }

    /// Next chunk sent by the destination, `None` at end of stream
    pub async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        self.reader.recv().await
    }
}

impl AsyncRead for ProxyConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProxyConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

/// Receiving half: bytes the destination sent
pub struct ConnectionReader {
    shared: Arc<Shared>,
    inbound: mpsc::Receiver<Inbound>,
    buffer: Bytes,
    eof: bool,
}

impl ConnectionReader {
    pub fn connect_id(&self) -> ConnectId {
        self.shared.connect_id
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Option<Bytes>>> {
        if !self.buffer.is_empty() {
            return Poll::Ready(Ok(Some(std::mem::take(&mut self.buffer))));
        }
        if self.eof {
            return Poll::Ready(Ok(None));
        }

        match ready!(self.inbound.poll_recv(cx)) {
            Some(Inbound::Data(data)) => Poll::Ready(Ok(Some(data))),
            Some(Inbound::Closed(None)) | None => {
                self.eof = true;
                self.shared.finish();
                Poll::Ready(Ok(None))
            }
            Some(Inbound::Closed(Some(error))) => {
                self.eof = true;
                self.shared.finish();
                Poll::Ready(Err(closed_error(&error)))
            }
        }
    }

    /// Next chunk sent by the destination, `None` at end of stream
    pub async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        futures::future::poll_fn(|cx| self.poll_recv(cx)).await
    }
}

impl AsyncRead for ConnectionReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.buffer.is_empty() {
                let n = self.buffer.len().min(buf.remaining());
                buf.put_slice(&self.buffer.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match ready!(self.poll_recv(cx))? {
                Some(data) => self.buffer = data,
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

/// Sending half: bytes for the destination
pub struct ConnectionWriter {
    shared: Arc<Shared>,
    sender: PollSender<Frame>,
    closed: BoxFuture<'static, ()>,
    chunk_size: usize,
}

impl ConnectionWriter {
    pub fn connect_id(&self) -> ConnectId {
        self.shared.connect_id
    }

    /// Close the whole connection now, failing any write in progress
    pub fn abort(&self, error: impl Into<String>) {
        self.shared.close_now(Some(error.into()));
    }

    fn poll_ready_to_send(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.shared.state() != ConnectionState::Established
            || self.closed.poll_unpin(cx).is_ready()
        {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed",
            )));
        }
        ready!(self.sender.poll_reserve(cx)).map_err(|_| backend_gone())?;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ConnectionWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(self.poll_ready_to_send(cx))?;

        let n = buf.len().min(self.chunk_size);
        let frame = Frame::from(Packet::Data {
            connect_id: self.shared.connect_id,
            data: buf[..n].to_vec(),
        });
        self.sender.send_item(frame).map_err(|_| backend_gone())?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.shared.state() != ConnectionState::Established {
            return Poll::Ready(Ok(()));
        }
        ready!(self.sender.poll_reserve(cx)).map_err(|_| backend_gone())?;

        if !self.shared.begin_close() {
            self.sender.abort_send();
            return Poll::Ready(Ok(()));
        }
        let frame = Frame::from(Packet::CloseRequest {
            connect_id: self.shared.connect_id,
            error: None,
        });
        self.sender.send_item(frame).map_err(|_| backend_gone())?;
        debug!(connect_id = self.shared.connect_id, "Sent CloseRequest");
        Poll::Ready(Ok(()))
    }
}

fn backend_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "backend stream closed")
}

fn closed_error(error: &str) -> io::Error {
    let kind = if error == ContextError::Canceled.to_string()
        || error == ContextError::DeadlineExceeded.to_string()
    {
        io::ErrorKind::Interrupted
    } else {
        io::ErrorKind::ConnectionReset
    };
    io::Error::new(kind, error.to_string())
}
