//! Utility functions and helper types.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;

use crate::core::{Error, Processor, PullIterator, Result, SharedIterator};
use crate::sources::{from_fn, FnSource};

/// Run `future` unless `cancel` fires first.
///
/// When both are ready the future's output wins, so a value that already
/// arrived is never reported as a cancellation.
pub async fn cancellable<F: Future>(
    future: F,
    cancel: Option<&CancellationToken>,
) -> Result<F::Output> {
    match cancel {
        None => Ok(future.await),
        Some(token) => tokio::select! {
            biased;
            output = future => Ok(output),
            _ = token.cancelled() => Err(Error::Cancelled),
        },
    }
}

/// Helper function to create a simple processor from a function
pub fn processor_from_fn<F, Fut, T, U>(f: F) -> FnProcessor<F, T>
where
    F: FnMut(T) -> Fut + Send,
    Fut: Future<Output = Result<Vec<U>>> + Send,
    T: Send + 'static,
    U: Send + 'static,
{
    FnProcessor {
        f,
        _phantom: std::marker::PhantomData,
    }
}

/// A processor created from a function
pub struct FnProcessor<F, T> {
    f: F,
    _phantom: std::marker::PhantomData<fn(T)>,
}

#[async_trait]
impl<F, Fut, T, U> Processor for FnProcessor<F, T>
where
    F: FnMut(T) -> Fut + Send,
    Fut: Future<Output = Result<Vec<U>>> + Send,
    T: Send + 'static,
    U: Send + 'static,
{
    type Input = T;
    type Output = U;

    async fn process(&mut self, item: Self::Input) -> Result<Vec<Self::Output>> {
        (self.f)(item).await
    }
}

/// Adapt a shared iterator into a [`Stream`] of its values.
///
/// The stream ends after the first error. Dropping the stream releases its
/// handle on the iterator.
pub fn into_stream<T: Send + 'static>(source: SharedIterator<T>) -> BoxStream<'static, Result<T>> {
    stream::unfold(Some(source), |source| async move {
        let source = source?;
        match source.pull(None).await {
            Ok(Some(pulled)) => Some((Ok(pulled.value), Some(source))),
            Ok(None) => None,
            Err(error) => Some((Err(error), None)),
        }
    })
    .boxed()
}

/// Adapt a [`Stream`] into a pull iterator that many tasks can share.
pub fn from_stream<S, T>(stream: S) -> FnSource<T>
where
    S: Stream<Item = Result<T>> + Send + Unpin + 'static,
    T: Send + 'static,
{
    let stream = Arc::new(TokioMutex::new(stream));
    from_fn(move || {
        let stream = stream.clone();
        async move { stream.lock().await.next().await.transpose() }
    })
}

/// Drain an iterator into a vector
pub async fn collect<I: PullIterator + ?Sized>(source: &I) -> Result<Vec<I::Item>> {
    let mut items = Vec::new();
    while let Some(pulled) = source.pull(None).await? {
        items.push(pulled.value);
    }
    Ok(items)
}
