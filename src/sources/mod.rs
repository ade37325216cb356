//! Pull iterator implementations.
//!
//! Besides the channel [`Receiver`](crate::channel::Receiver), a stream can be
//! backed by a fixed sequence ([`VecSource`]), a closure invoked once per pull
//! ([`FnSource`]) or a concatenation of other iterators ([`ChainSource`]).
//! All of them may be pulled by many tasks at once.

mod cursor;
mod fn_source;

pub use cursor::Cursor;
pub use fn_source::{from_fn, FnSource};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::core::{Error, PullIterator, Pulled, Result, SharedIterator};
use crate::util::cancellable;

/// Extension methods available on every sized iterator
pub trait PullIteratorExt: PullIterator + Sized + 'static {
    /// Erase the iterator's type so it can be shared by many tasks
    fn into_shared(self) -> SharedIterator<Self::Item> {
        Arc::new(self)
    }

    /// Wrap the iterator in a per-task consumer context
    fn cursor(self) -> Cursor<Self::Item> {
        Cursor::new(self.into_shared())
    }

    /// Yield every value of `self`, then every value of `next`
    fn chain<I>(self, next: I) -> ChainSource<Self::Item>
    where
        I: PullIterator<Item = Self::Item> + 'static,
    {
        ChainSource::new(vec![self.into_shared(), next.into_shared()])
    }
}

impl<I: PullIterator + Sized + 'static> PullIteratorExt for I {}

struct VecState<T> {
    items: VecDeque<T>,
    position: u64,
    disposed: bool,
}

/// A source that yields items from a vector
pub struct VecSource<T> {
    state: Mutex<VecState<T>>,
}

impl<T> VecSource<T> {
    /// Create a new vector source
    pub fn new(items: Vec<T>) -> Self {
        Self {
            state: Mutex::new(VecState {
                items: items.into(),
                position: 0,
                disposed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get the number of remaining items
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Check if the source has more items
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}

impl<T> FromIterator<T> for VecSource<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<T> From<Vec<T>> for VecSource<T> {
    fn from(items: Vec<T>) -> Self {
        Self::new(items)
    }
}

#[async_trait]
impl<T: Send + 'static> PullIterator for VecSource<T> {
    type Item = T;

    // nothing suspends between taking the item and bumping the position
    async fn pull(&self, _cancel: Option<&CancellationToken>) -> Result<Option<Pulled<T>>> {
        let mut state = self.lock();
        if state.disposed {
            return Err(Error::Disposed);
        }
        Ok(state.items.pop_front().map(|value| {
            let position = state.position;
            state.position += 1;
            Pulled::new(position, value)
        }))
    }

    fn dispose(&self) {
        let mut state = self.lock();
        state.disposed = true;
        state.items.clear();
    }
}

struct ChainState {
    index: usize,
    position: u64,
}

/// Concatenates iterators, exhausting each before moving to the next.
///
/// Positions continue across the boundary. Pulls are taken one at a time,
/// so positions follow the order in which the inner iterators handed their
/// values out, and exactly one caller moves the chain past an exhausted
/// iterator.
pub struct ChainSource<T: Send + 'static> {
    sources: Vec<SharedIterator<T>>,
    state: TokioMutex<ChainState>,
    disposed: AtomicBool,
}

impl<T: Send + 'static> ChainSource<T> {
    pub fn new(sources: Vec<SharedIterator<T>>) -> Self {
        Self {
            sources,
            state: TokioMutex::new(ChainState {
                index: 0,
                position: 0,
            }),
            disposed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> PullIterator for ChainSource<T> {
    type Item = T;

    async fn pull(&self, cancel: Option<&CancellationToken>) -> Result<Option<Pulled<T>>> {
        let mut state = cancellable(self.state.lock(), cancel).await?;
        loop {
            if self.disposed.load(AtomicOrdering::Acquire) {
                return Err(Error::Disposed);
            }
            let Some(source) = self.sources.get(state.index) else {
                return Ok(None);
            };

            match source.pull(cancel).await? {
                Some(pulled) => {
                    let position = state.position;
                    state.position += 1;
                    return Ok(Some(Pulled::new(position, pulled.value)));
                }
                None => {
                    trace!(index = state.index, "chained iterator exhausted");
                    state.index += 1;
                }
            }
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        for source in &self.sources {
            source.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{channel, ChannelConfig};

    async fn drain<I: PullIterator>(source: &I) -> Vec<(u64, I::Item)> {
        let mut values = Vec::new();
        while let Some(pulled) = source.pull(None).await.unwrap() {
            values.push((pulled.position, pulled.value));
        }
        values
    }

    #[tokio::test]
    async fn test_vec_source() {
        let source: VecSource<_> = (1..=3).collect();
        assert_eq!(source.len(), 3);
        assert_eq!(drain(&source).await, vec![(0, 1), (1, 2), (2, 3)]);
        assert!(source.is_empty());
    }

    #[tokio::test]
    async fn test_vec_source_dispose() {
        let source = VecSource::new(vec![1, 2]);
        source.dispose();
        assert!(matches!(source.pull(None).await, Err(Error::Disposed)));
    }

    #[tokio::test]
    async fn test_vec_source_shared_between_tasks() {
        let source = VecSource::new((0..100).collect()).into_shared();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let source = source.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(pulled) = source.pull(None).await.unwrap() {
                    assert_eq!(pulled.position, pulled.value as u64);
                    seen.push(pulled.value);
                    tokio::task::yield_now().await;
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_chain_continues_positions() {
        let chained = VecSource::new(vec![1, 2, 3]).chain(VecSource::new(vec![4, 5, 6]));
        assert_eq!(
            drain(&chained).await,
            vec![(0, 1), (1, 2), (2, 3), (3, 4), (4, 5), (5, 6)]
        );
    }

    #[tokio::test]
    async fn test_chain_skips_empty_sources() {
        let chained = ChainSource::new(vec![
            VecSource::<i32>::new(vec![]).into_shared(),
            VecSource::new(vec![7]).into_shared(),
            VecSource::new(vec![]).into_shared(),
        ]);
        assert_eq!(drain(&chained).await, vec![(0, 7)]);
        assert!(chained.pull(None).await.unwrap().is_none());
    }

    async fn parked<T: Send + 'static>(
        chained: &Arc<ChainSource<T>>,
    ) -> tokio::task::JoinHandle<Result<Option<Pulled<T>>>> {
        let handle = tokio::spawn({
            let chained = chained.clone();
            async move { chained.pull(None).await }
        });
        tokio::task::yield_now().await;
        handle
    }

    #[tokio::test]
    async fn test_concurrent_callers_cross_boundary_once() {
        let (tx, rx) = channel::<i32>(ChannelConfig::default().buffer_size(1));
        let chained = Arc::new(rx.chain(VecSource::new(vec![20, 21])));

        // two callers park on the channel; completing it routes the second onward
        let first = parked(&chained).await;
        let second = parked(&chained).await;
        tx.push(10).unwrap().await.unwrap();
        tx.complete().unwrap();

        let mut pulled: Vec<_> = [first.await, second.await]
            .into_iter()
            .map(|joined| {
                let pulled = joined.unwrap().unwrap().unwrap();
                (pulled.position, pulled.value)
            })
            .collect();
        pulled.sort();
        assert_eq!(pulled, vec![(0, 10), (1, 20)]);

        assert_eq!(drain(&*chained).await, vec![(2, 21)]);
        assert!(chained.pull(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chain_positions_follow_emission_order() {
        let (tx, rx) = channel::<i32>(ChannelConfig::default().buffer_size(2));
        let chained = Arc::new(rx.chain(VecSource::new(vec![30])));

        let first = parked(&chained).await;
        let second = parked(&chained).await;
        let _ten = tx.push(10).unwrap();
        let _twenty = tx.push(20).unwrap();
        tx.complete().unwrap();

        let mut pulled: Vec<_> = [second.await, first.await]
            .into_iter()
            .map(|joined| {
                let pulled = joined.unwrap().unwrap().unwrap();
                (pulled.value, pulled.position)
            })
            .collect();
        pulled.sort();
        assert_eq!(pulled, vec![(10, 0), (20, 1)]);
        assert_eq!(drain(&*chained).await, vec![(2, 30)]);
    }

    #[tokio::test]
    async fn test_cancelled_chain_pull_keeps_its_value() {
        let (tx, rx) = channel::<i32>(ChannelConfig::default().buffer_size(1));
        let chained = rx.chain(VecSource::new(vec![]));
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(chained.pull(Some(&token)).await, Err(Error::Cancelled)));

        let _buffered = tx.push(5).unwrap();
        tx.complete().unwrap();
        assert_eq!(drain(&chained).await, vec![(0, 5)]);
    }

    #[tokio::test]
    async fn test_chain_dispose_reaches_every_source() {
        let (tx, rx) = channel::<i32>(ChannelConfig::default());
        let chained = rx.chain(VecSource::new(vec![1]));
        chained.dispose();
        assert!(tx.is_disposed());
        assert!(matches!(chained.pull(None).await, Err(Error::Disposed)));
    }
}
