use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, DuplexStream, ReadBuf},
    task::JoinHandle,
};

use crate::error::FlacError;

/// Size of the in-memory pipe between a pump task and its reader.
pub(crate) const PIPE_CAPACITY: usize = 256 * 1024;

/// Async reader fed by a spawned pump task, whose result is collected by
/// [`ManagedAsyncReader::wait`].
///
/// Dropping the reader aborts the pump task.
pub struct ManagedAsyncReader<T> {
    inner: Option<DuplexStream>,
    join: Option<JoinHandle<Result<T, FlacError>>>,
    role: &'static str,
}

impl<T> ManagedAsyncReader<T> {
    pub(crate) fn new(
        role: &'static str,
        inner: DuplexStream,
        join: JoinHandle<Result<T, FlacError>>,
    ) -> Self {
        Self {
            inner: Some(inner),
            join: Some(join),
            role,
        }
    }

    /// Waits for the pump task and returns its result.
    ///
    /// Unread output is discarded: the read half is closed first so a pump
    /// blocked on a full pipe fails instead of hanging.
    pub async fn wait(mut self) -> Result<T, FlacError> {
        self.inner.take();
        match self.join.take() {
            Some(handle) => match handle.await {
                Ok(res) => res,
                Err(err) => Err(FlacError::TaskJoin {
                    role: self.role,
                    details: err.to_string(),
                }),
            },
            None => Err(FlacError::ChannelClosed),
        }
    }

    fn poll_read_inner(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "reader dropped"))?;
        Pin::new(inner).poll_read(cx, buf)
    }
}

impl<T> AsyncRead for ManagedAsyncReader<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.poll_read_inner(cx, buf)
    }
}

impl<T> Drop for ManagedAsyncReader<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.join.take() {
            handle.abort();
        }
        self.inner.take();
    }
}
