use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::barrier::Barrier;
use crate::core::{Error, PullIterator, Pulled, Result};
use crate::util::cancellable;

type Supplier<T> = Box<dyn FnMut() -> BoxFuture<'static, Result<Option<T>>> + Send>;

#[derive(Clone)]
enum Terminal {
    Exhausted,
    Failed(Error),
}

struct FnState {
    produced: u64,
    terminal: Option<Terminal>,
}

/// Create a source that calls `f` once per pull.
///
/// `f` returns `Ok(Some(item))` for the next item, `Ok(None)` at the end of
/// the stream, or an error that fails the source for every caller.
pub fn from_fn<F, Fut, T>(mut f: F) -> FnSource<T>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    T: Send + 'static,
{
    let supplier: Supplier<T> = Box::new(move || f().boxed());
    FnSource {
        supplier: Mutex::new(supplier),
        turns: Barrier::new(),
        tickets: AtomicU64::new(0),
        state: Mutex::new(FnState {
            produced: 0,
            terminal: None,
        }),
    }
}

/// A source driven by a supplier closure.
///
/// Concurrent callers take a ticket and invoke the supplier strictly in
/// ticket order, one at a time, even when an invocation suspends. The end of
/// the stream and supplier errors are sticky: every later caller sees them.
/// Cancelling a pull only gives up its place in line; an invocation already
/// running is allowed to finish so its value is not lost.
pub struct FnSource<T> {
    supplier: Mutex<Supplier<T>>,
    turns: Barrier,
    tickets: AtomicU64,
    state: Mutex<FnState>,
}

impl<T> FnSource<T> {
    fn lock(&self) -> MutexGuard<'_, FnState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn terminal(&self) -> Option<Result<Option<Pulled<T>>>> {
        match &self.lock().terminal {
            Some(Terminal::Exhausted) => Some(Ok(None)),
            Some(Terminal::Failed(error)) => Some(Err(error.clone())),
            None => None,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> PullIterator for FnSource<T> {
    type Item = T;

    async fn pull(&self, cancel: Option<&CancellationToken>) -> Result<Option<Pulled<T>>> {
        if let Some(terminal) = self.terminal() {
            return terminal;
        }

        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let mut turn = Turn {
            turns: &self.turns,
            ticket,
            admitted: false,
        };
        cancellable(self.turns.wait(ticket), cancel).await??;
        turn.admitted = true;

        if let Some(terminal) = self.terminal() {
            return terminal;
        }

        let invocation = {
            let mut supplier = self
                .supplier
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            (supplier)()
        };
        let outcome = invocation.await;

        let mut state = self.lock();
        match outcome {
            Ok(Some(value)) => {
                let position = state.produced;
                state.produced += 1;
                Ok(Some(Pulled::new(position, value)))
            }
            Ok(None) => {
                state.terminal = Some(Terminal::Exhausted);
                Ok(None)
            }
            Err(error) => {
                debug!(%error, "supplier failed; source is now terminal");
                state.terminal = Some(Terminal::Failed(error.clone()));
                Err(error)
            }
        }
    }

    fn dispose(&self) {
        let mut state = self.lock();
        if state.terminal.is_none() {
            state.terminal = Some(Terminal::Failed(Error::Disposed));
        }
        drop(state);
        self.turns.abort(Error::Disposed);
    }
}

/// Passes the turn on when a pull finishes, is cancelled or is dropped.
struct Turn<'a> {
    turns: &'a Barrier,
    ticket: u64,
    admitted: bool,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        if self.admitted {
            let _ = self.turns.release(self.ticket);
        } else {
            self.turns.forfeit(self.ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::PullIteratorExt;
    use std::sync::Arc;
    use std::time::Duration;

    fn counter(limit: u32) -> FnSource<u32> {
        let next = Arc::new(AtomicU64::new(0));
        from_fn(move || {
            let next = next.clone();
            async move {
                let value = next.fetch_add(1, Ordering::SeqCst) as u32;
                Ok((value < limit).then_some(value))
            }
        })
    }

    #[tokio::test]
    async fn test_yields_until_exhausted() {
        let source = counter(3);
        let mut values = Vec::new();
        while let Some(pulled) = source.pull(None).await.unwrap() {
            values.push((pulled.position, pulled.value));
        }
        assert_eq!(values, vec![(0, 0), (1, 1), (2, 2)]);
        assert!(source.pull(None).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invocations_follow_call_order() {
        // later calls finish their sleep first but must still come out in order
        let delays = Arc::new(Mutex::new(vec![30u64, 20, 10].into_iter()));
        let source = from_fn(move || {
            let delay = delays.lock().unwrap().next();
            async move {
                match delay {
                    Some(ms) => {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        Ok(Some(ms))
                    }
                    None => Ok(None),
                }
            }
        })
        .into_shared();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let source = source.clone();
            handles.push(tokio::spawn(async move { source.pull(None).await }));
        }
        let mut results = Vec::new();
        for handle in handles {
            let pulled = handle.await.unwrap().unwrap().unwrap();
            results.push((pulled.position, pulled.value));
        }
        results.sort();
        assert_eq!(results, vec![(0, 30), (1, 20), (2, 10)]);
    }

    #[tokio::test]
    async fn test_error_is_sticky() {
        let calls = Arc::new(AtomicU64::new(0));
        let seen = calls.clone();
        let source = from_fn(move || {
            let calls = calls.clone();
            async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Ok(Some("first")),
                    _ => Err(Error::custom("supplier broke")),
                }
            }
        });

        assert_eq!(source.pull(None).await.unwrap().unwrap().value, "first");
        for _ in 0..3 {
            let err = source.pull(None).await.unwrap_err();
            assert_eq!(err.to_string(), "supplier broke");
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_caller_gives_up_its_turn() {
        let source = Arc::new(counter(10));
        let token = CancellationToken::new();

        // hold ticket 0 so ticket 1 has to wait
        let blocker = source.turns.wait(0);
        let held = Turn {
            turns: &source.turns,
            ticket: source.tickets.fetch_add(1, Ordering::Relaxed),
            admitted: true,
        };
        blocker.await.unwrap();

        let waiting = {
            let source = source.clone();
            let token = token.clone();
            tokio::spawn(async move { source.pull(Some(&token)).await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        assert!(matches!(waiting.await.unwrap(), Err(Error::Cancelled)));

        drop(held);
        let pulled = source.pull(None).await.unwrap().unwrap();
        assert_eq!((pulled.position, pulled.value), (0, 0));
    }

    #[tokio::test]
    async fn test_dispose_fails_later_pulls() {
        let source = counter(10);
        source.dispose();
        assert!(matches!(source.pull(None).await, Err(Error::Disposed)));
    }
}
