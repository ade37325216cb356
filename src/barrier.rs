//! Position-gated resumption used to re-establish order between workers.
//!
//! A [`Barrier`] admits callers strictly in increasing position order: a task
//! calling [`wait(n)`](Barrier::wait) is suspended until every position below
//! `n` has been [released](Barrier::release).

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::core::{Error, Result};

#[derive(Default)]
struct BarrierState {
    current: u64,
    blocked: HashMap<u64, oneshot::Sender<Result<()>>>,
    forfeited: BTreeSet<u64>,
    aborted: Option<Error>,
}

impl BarrierState {
    /// Move past `position` and any forfeited positions that follow it,
    /// returning the waiter that now holds the turn.
    fn advance_past(&mut self, position: u64) -> Option<oneshot::Sender<Result<()>>> {
        self.current = position + 1;
        while self.forfeited.remove(&self.current) {
            self.current += 1;
        }
        self.blocked.remove(&self.current)
    }
}

/// Ordering primitive admitting callers in strictly increasing position order.
#[derive(Default)]
pub struct Barrier {
    state: Mutex<BarrierState>,
}

impl Barrier {
    /// Create a barrier whose first admitted position is zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a barrier whose first admitted position is `start`
    pub fn starting_at(start: u64) -> Self {
        Self {
            state: Mutex::new(BarrierState {
                current: start,
                ..BarrierState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The position currently allowed to proceed.
    pub fn current(&self) -> u64 {
        self.lock().current
    }

    /// Suspend until `position` is the current position.
    ///
    /// Returns immediately for the current position or any position below
    /// it. Fails with the abort error if the barrier has been aborted.
    pub async fn wait(&self, position: u64) -> Result<()> {
        let receiver = {
            let mut state = self.lock();
            if let Some(error) = &state.aborted {
                return Err(error.clone());
            }
            if position <= state.current {
                return Ok(());
            }
            if state.blocked.contains_key(&position) {
                return Err(Error::usage(format!(
                    "barrier position {} already has a waiter",
                    position
                )));
            }
            let (tx, rx) = oneshot::channel();
            state.blocked.insert(position, tx);
            rx
        };

        let mut guard = WaitGuard {
            barrier: self,
            position,
            armed: true,
        };
        let outcome = receiver.await;
        guard.armed = false;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::Disposed),
        }
    }

    /// Mark `position` done and wake the waiter on the next position.
    ///
    /// Positions must be released exactly once, in increasing order.
    pub fn release(&self, position: u64) -> Result<()> {
        let next = {
            let mut state = self.lock();
            if state.aborted.is_some() {
                return Ok(());
            }
            if position != state.current {
                debug_assert!(
                    position > state.current,
                    "barrier position {} released twice",
                    position
                );
                return Err(Error::usage(format!(
                    "barrier released position {} while position {} is current",
                    position, state.current
                )));
            }
            state.advance_past(position)
        };
        if let Some(next) = next {
            let _ = next.send(Ok(()));
        }
        Ok(())
    }

    /// Give up the turn at `position` without waiting for it.
    ///
    /// If `position` is current the barrier moves on immediately, otherwise
    /// the position is skipped once the barrier reaches it.
    pub fn forfeit(&self, position: u64) {
        let next = {
            let mut state = self.lock();
            if position < state.current || state.aborted.is_some() {
                return;
            }
            if position == state.current {
                state.advance_past(position)
            } else {
                state.forfeited.insert(position);
                None
            }
        };
        if let Some(next) = next {
            let _ = next.send(Ok(()));
        }
    }

    /// Fail every current and future waiter with `error`.
    pub fn abort(&self, error: Error) {
        let blocked: Vec<_> = {
            let mut state = self.lock();
            if state.aborted.is_some() {
                return;
            }
            state.aborted = Some(error.clone());
            state.blocked.drain().map(|(_, tx)| tx).collect()
        };
        for tx in blocked {
            let _ = tx.send(Err(error.clone()));
        }
    }

    /// True once [`abort`](Barrier::abort) has been called.
    pub fn is_aborted(&self) -> bool {
        self.lock().aborted.is_some()
    }
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Barrier")
            .field("current", &state.current)
            .field("blocked", &state.blocked.len())
            .field("aborted", &state.aborted.is_some())
            .finish()
    }
}

/// Removes a waiter that was dropped before its turn came.
struct WaitGuard<'a> {
    barrier: &'a Barrier,
    position: u64,
    armed: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.barrier.lock().blocked.remove(&self.position);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready, assert_ready_ok, task};

    #[tokio::test]
    async fn test_current_position_passes() {
        let barrier = Barrier::new();
        barrier.wait(0).await.unwrap();
        barrier.release(0).unwrap();
        barrier.wait(1).await.unwrap();
        // positions below current return immediately
        barrier.wait(0).await.unwrap();
    }

    #[test]
    fn test_wait_blocks_until_release() {
        let barrier = Barrier::new();
        let mut waiter = task::spawn(barrier.wait(2));
        assert_pending!(waiter.poll());

        barrier.release(0).unwrap();
        assert_pending!(waiter.poll());

        barrier.release(1).unwrap();
        assert!(waiter.is_woken());
        assert_ready_ok!(waiter.poll());
    }

    #[test]
    fn test_out_of_order_release_is_usage_error() {
        let barrier = Barrier::new();
        let err = barrier.release(3).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
        assert_eq!(barrier.current(), 0);
    }

    #[test]
    fn test_forfeit_skips_position() {
        let barrier = Barrier::new();
        let mut waiter = task::spawn(barrier.wait(2));
        assert_pending!(waiter.poll());

        barrier.forfeit(1);
        barrier.release(0).unwrap();
        assert_ready_ok!(waiter.poll());
        assert_eq!(barrier.current(), 2);
    }

    #[test]
    fn test_abort_wakes_waiters() {
        let barrier = Barrier::new();
        let mut waiter = task::spawn(barrier.wait(5));
        assert_pending!(waiter.poll());

        barrier.abort(Error::Disposed);
        let result = assert_ready!(waiter.poll());
        assert!(matches!(result, Err(Error::Disposed)));
        assert!(barrier.is_aborted());
    }

    #[tokio::test]
    async fn test_admits_in_order() {
        let barrier = Arc::new(Barrier::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for position in (0..5u64).rev() {
            let barrier = barrier.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait(position).await.unwrap();
                order.lock().unwrap().push(position);
                barrier.release(position).unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
