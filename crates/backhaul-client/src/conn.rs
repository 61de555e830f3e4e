//! A connection carried by a tunnel session

use crate::tunnel::Session;
use backhaul_proto::{ConnectId, Frame, Packet};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use tracing::debug;

#[derive(Debug)]
pub(crate) enum ConnInbound {
    Data(Bytes),
    Closed(Option<String>),
}

/// Byte stream to a destination behind an agent.
///
/// Shutting down the write side sends a close request; reads continue until
/// the far side confirms. Dropping the connection closes it.
pub struct TunnelConn {
    session: Arc<Session>,
    connect_id: ConnectId,
    inbound: mpsc::Receiver<ConnInbound>,
    buffer: Bytes,
    eof: bool,
    sender: PollSender<Frame>,
    write_closed: bool,
    session_done: BoxFuture<'static, ()>,
}

impl std::fmt::Debug for TunnelConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConn")
            .field("connect_id", &self.connect_id)
            .field("eof", &self.eof)
            .field("write_closed", &self.write_closed)
            .finish()
    }
}

impl TunnelConn {
    pub(crate) fn new(
        session: Arc<Session>,
        connect_id: ConnectId,
        inbound: mpsc::Receiver<ConnInbound>,
    ) -> Self {
        let sender = PollSender::new(session.inner.outbound.clone());
        let session_done = session.inner.done.clone().cancelled_owned().boxed();
        Self {
            session,
            connect_id,
            inbound,
            buffer: Bytes::new(),
            eof: false,
            sender,
            write_closed: false,
            session_done,
        }
    }

    pub fn connect_id(&self) -> ConnectId {
        self.connect_id
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Option<Bytes>>> {
        if !self.buffer.is_empty() {
            return Poll::Ready(Ok(Some(std::mem::take(&mut self.buffer))));
        }
        if self.eof {
            return Poll::Ready(Ok(None));
        }

        let next = ready!(self.inbound.poll_recv(cx));
        match next {
            Some(ConnInbound::Data(data)) => Poll::Ready(Ok(Some(data))),
            Some(ConnInbound::Closed(None)) | None => {
                self.finish();
                Poll::Ready(Ok(None))
            }
            Some(ConnInbound::Closed(Some(error))) => {
                self.finish();
                Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, error)))
            }
        }
    }

    fn finish(&mut self) {
        self.eof = true;
        if self.session.inner.single_use {
            self.session.inner.close();
        }
    }

    /// Next chunk from the destination, `None` at end of stream
    pub async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        futures::future::poll_fn(|cx| self.poll_recv(cx)).await
    }

    fn poll_ready_to_send(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.write_closed || self.session_done.poll_unpin(cx).is_ready() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed",
            )));
        }
        ready!(self.sender.poll_reserve(cx)).map_err(|_| tunnel_gone())?;
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for TunnelConn {
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

impl AsyncWrite for TunnelConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(self.poll_ready_to_send(cx))?;

        let n = buf.len().min(self.session.inner.chunk_size);
        let frame = Frame::from(Packet::Data {
            connect_id: self.connect_id,
            data: buf[..n].to_vec(),
        });
        self.sender.send_item(frame).map_err(|_| tunnel_gone())?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.write_closed || self.eof {
            return Poll::Ready(Ok(()));
        }
        ready!(self.sender.poll_reserve(cx)).map_err(|_| tunnel_gone())?;

        let frame = Frame::from(Packet::CloseRequest {
            connect_id: self.connect_id,
            error: None,
        });
        self.sender.send_item(frame).map_err(|_| tunnel_gone())?;
        self.write_closed = true;
        debug!(connect_id = self.connect_id, "Sent CloseRequest");
        Poll::Ready(Ok(()))
    }
}

impl Drop for TunnelConn {
    fn drop(&mut self) {
        let inner = &self.session.inner;
        let live = inner.conns.remove(&self.connect_id).is_some();
        if live && !self.write_closed {
            inner.send_control(Packet::CloseRequest {
                connect_id: self.connect_id,
                error: None,
            });
        }
        if inner.single_use {
            inner.close();
        }
    }
}

fn tunnel_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "tunnel closed")
}
