//! Core traits for the pipeline primitives.
//!
//! [`PullIterator`] is the consumption protocol shared by every stream in the
//! crate: channels, fixed sequences, closure-driven suppliers and
//! concatenations. [`Processor`] is the per-worker transformation contract
//! driven by the concurrent operators.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::error::Result;

/// A value pulled from a [`PullIterator`] together with its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pulled<T> {
    /// Emission order of the value, starting at zero
    pub position: u64,
    /// The value itself
    pub value: T,
}

impl<T> Pulled<T> {
    pub fn new(position: u64, value: T) -> Self {
        Self { position, value }
    }
}

/// A pull-based stream that may be drained by many tasks at once.
///
/// Every call to [`pull`](PullIterator::pull) hands its result to the calling
/// task alone, so one iterator can be shared (usually as an
/// [`SharedIterator`]) by any number of concurrently running consumers. Use a
/// [`Cursor`](crate::sources::Cursor) when the `advance`/`value`/`position`
/// accessor style is more convenient.
///
/// # Examples
///
/// ```rust
/// use pipeweld::prelude::*;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> pipeweld::Result<()> {
/// let source = VecSource::new(vec!["a", "b"]);
///
/// let first = source.pull(None).await?.unwrap();
/// assert_eq!((first.position, first.value), (0, "a"));
/// let second = source.pull(None).await?.unwrap();
/// assert_eq!((second.position, second.value), (1, "b"));
/// assert!(source.pull(None).await?.is_none());
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait PullIterator: Send + Sync {
    /// The type of items this iterator yields
    type Item: Send + 'static;

    /// Pull the next value, or `None` once the stream is exhausted.
    ///
    /// If `cancel` fires before a value is available the call returns
    /// [`Error::Cancelled`](crate::Error::Cancelled). Cancelling (or dropping
    /// the returned future) never loses a value: the position this call was
    /// waiting on is handed to the next caller.
    async fn pull(&self, cancel: Option<&CancellationToken>) -> Result<Option<Pulled<Self::Item>>>;

    /// Abandon the stream. Pending and future pulls fail with
    /// [`Error::Disposed`](crate::Error::Disposed). Calling this more than once
    /// has no further effect.
    fn dispose(&self);
}

/// A type-erased iterator shared between tasks.
pub type SharedIterator<T> = Arc<dyn PullIterator<Item = T>>;

#[async_trait]
impl<I> PullIterator for Arc<I>
where
    I: PullIterator + ?Sized,
{
    type Item = I::Item;

    async fn pull(&self, cancel: Option<&CancellationToken>) -> Result<Option<Pulled<Self::Item>>> {
        (**self).pull(cancel).await
    }

    fn dispose(&self) {
        (**self).dispose()
    }
}

#[async_trait]
impl<I> PullIterator for Box<I>
where
    I: PullIterator + ?Sized,
{
    type Item = I::Item;

    async fn pull(&self, cancel: Option<&CancellationToken>) -> Result<Option<Pulled<Self::Item>>> {
        (**self).pull(cancel).await
    }

    fn dispose(&self) {
        (**self).dispose()
    }
}

/// A processor transforms items, one private instance per worker.
///
/// The concurrent operators create a fresh processor chain for every worker
/// and feed it the items that worker pulled. `process` may emit zero or more
/// outputs per input; `finish` flushes whatever the chain still holds once
/// upstream is exhausted.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use pipeweld::core::{Processor, Result};
///
/// struct DoubleProcessor;
///
/// #[async_trait]
/// impl Processor for DoubleProcessor {
///     type Input = i32;
///     type Output = i32;
///
///     async fn process(&mut self, item: Self::Input) -> Result<Vec<Self::Output>> {
///         Ok(vec![item * 2])
///     }
/// }
/// ```
#[async_trait]
pub trait Processor {
    /// The type of items this processor accepts
    type Input: Send + 'static;
    /// The type of items this processor produces
    type Output: Send + 'static;

    /// Process an input item and produce zero or more output items.
    ///
    /// Returning an empty Vec means the item was consumed but produced no output.
    async fn process(&mut self, item: Self::Input) -> Result<Vec<Self::Output>>;

    /// Called when upstream is exhausted, allowing final output generation.
    async fn finish(&mut self) -> Result<Vec<Self::Output>> {
        Ok(vec![])
    }
}

/// Extension trait for composing processors
pub trait ProcessorExt: Processor + Sized {
    /// Feed every output of this processor into `next`
    fn then<P>(self, next: P) -> crate::processors::combinators::Then<Self, P>
    where
        P: Processor<Input = Self::Output>,
    {
        crate::processors::combinators::Then::new(self, next)
    }
}

impl<P: Processor> ProcessorExt for P {}
