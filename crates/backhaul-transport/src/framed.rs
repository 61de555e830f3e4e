//! [`FrameSink`]/[`FrameSource`] over any byte stream using [`FrameCodec`]

use crate::{FrameSink, FrameSource, TransportResult};
use async_trait::async_trait;
use backhaul_proto::{Frame, FrameCodec};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

/// A byte stream speaking the frame protocol
pub struct FramedStream<T> {
    framed: Framed<T, FrameCodec>,
}

impl<T> FramedStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(io: T) -> Self {
        Self {
            framed: Framed::new(io, FrameCodec::new()),
        }
    }

    pub async fn send_frame(&mut self, frame: Frame) -> TransportResult<()> {
        self.framed.send(frame).await?;
        Ok(())
    }

    pub async fn recv_frame(&mut self) -> TransportResult<Option<Frame>> {
        match self.framed.next().await {
            Some(frame) => Ok(Some(frame?)),
            None => Ok(None),
        }
    }

    /// Split into independently owned halves
    pub fn split(self) -> (FramedSink<T>, FramedSource<T>) {
        let (sink, stream) = self.framed.split();
        (FramedSink { inner: sink }, FramedSource { inner: stream })
    }
}

impl<T> fmt::Debug for FramedStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedStream").finish_non_exhaustive()
    }
}

pub struct FramedSink<T> {
    inner: SplitSink<Framed<T, FrameCodec>, Frame>,
}

impl<T> fmt::Debug for FramedSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T> FrameSink for FramedSink<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, frame: Frame) -> TransportResult<()> {
        self.inner.send(frame).await?;
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.inner.close().await?;
        Ok(())
    }
}

pub struct FramedSource<T> {
    inner: SplitStream<Framed<T, FrameCodec>>,
}

impl<T> fmt::Debug for FramedSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T> FrameSource for FramedSource<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv_frame(&mut self) -> TransportResult<Option<Frame>> {
        match self.inner.next().await {
            Some(frame) => Ok(Some(frame?)),
            None => Ok(None),
        }
    }
}
