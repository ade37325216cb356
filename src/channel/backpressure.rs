use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::core::{Error, Result};

/// Resolves once a pushed value has been consumed.
///
/// Returned by [`Sender::push`](super::Sender::push). The handle resolves
/// `Ok(())` when the value is consumed or admitted by the channel's buffer,
/// the producer's error when the channel is failed while the value is still
/// buffered, and [`Error::Disposed`] when the consumer abandons the channel.
#[must_use = "backpressure handles do nothing unless awaited"]
#[derive(Debug)]
pub struct Backpressure {
    inner: Inner,
}

#[derive(Debug)]
enum Inner {
    Ready(Option<Result<()>>),
    Pending(oneshot::Receiver<Result<()>>),
}

impl Backpressure {
    pub(crate) fn ready(result: Result<()>) -> Self {
        Self {
            inner: Inner::Ready(Some(result)),
        }
    }

    pub(crate) fn pending(receiver: oneshot::Receiver<Result<()>>) -> Self {
        Self {
            inner: Inner::Pending(receiver),
        }
    }

    /// True if the handle resolved at push time without waiting for a consumer.
    pub fn is_immediate(&self) -> bool {
        matches!(self.inner, Inner::Ready(_))
    }
}

impl Future for Backpressure {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            Inner::Ready(result) => Poll::Ready(result.take().unwrap_or(Ok(()))),
            // the channel itself went away: nobody will ever consume the value
            Inner::Pending(receiver) => Pin::new(receiver)
                .poll(cx)
                .map(|outcome| outcome.unwrap_or(Err(Error::Disposed))),
        }
    }
}
