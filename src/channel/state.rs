//! Shared state behind a channel's sender and receiver halves.
//!
//! Every value is assigned an emit position. Consumers claim consume
//! positions in increasing order; a consumer whose position has no value yet
//! parks a waiter keyed by that position and the producer hands the value
//! straight to it. A claimed position is never lost: if the waiting call is
//! cancelled the position goes to `reclaimed` and the next caller takes it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::Location;
use std::sync::atomic::AtomicUsize;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::backpressure::Backpressure;
use super::ChannelConfig;
use crate::core::{Error, Pulled, Result};

pub(crate) type DisposeCallback = Box<dyn FnOnce(Error) + Send + 'static>;

type Delivery<T> = Result<Option<Slot<T>>>;

enum Phase {
    Open,
    Completed(Option<Error>),
    Disposed(Error),
}

struct Slot<T> {
    value: T,
    ack: Option<oneshot::Sender<Result<()>>>,
}

impl<T> Slot<T> {
    /// Hand the value to its consumer and resolve the producer's handle.
    fn consume(self) -> T {
        if let Some(ack) = self.ack {
            let _ = ack.send(Ok(()));
        }
        self.value
    }
}

struct State<T> {
    emit_position: u64,
    consume_position: u64,
    reclaimed: BTreeSet<u64>,
    slots: BTreeMap<u64, Slot<T>>,
    waiting: HashMap<u64, oneshot::Sender<Delivery<T>>>,
    phase: Phase,
    completed: bool,
    completed_at: Option<&'static Location<'static>>,
    on_dispose: Vec<DisposeCallback>,
}

impl<T> State<T> {
    /// Pre-acknowledge the values that fit in the read-ahead buffer.
    fn admit_buffered(&mut self, buffer_size: usize) {
        for slot in self.slots.values_mut().take(buffer_size) {
            if let Some(ack) = slot.ack.take() {
                let _ = ack.send(Ok(()));
            }
        }
    }

    fn already_completed(&self) -> Error {
        Error::AlreadyCompleted {
            site: self.completed_at.map(|site| site.to_string()),
        }
    }
}

pub(crate) struct Shared<T> {
    state: Mutex<State<T>>,
    config: ChannelConfig,
    pub(crate) senders: AtomicUsize,
}

impl<T: Send + 'static> Shared<T> {
    pub(crate) fn new(config: ChannelConfig) -> Self {
        Self {
            state: Mutex::new(State {
                emit_position: 0,
                consume_position: 0,
                reclaimed: BTreeSet::new(),
                slots: BTreeMap::new(),
                waiting: HashMap::new(),
                phase: Phase::Open,
                completed: false,
                completed_at: None,
                on_dispose: Vec::new(),
            }),
            config,
            senders: AtomicUsize::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn push(&self, value: T) -> Result<Backpressure> {
        let mut state = self.lock();
        if state.completed {
            return Err(state.already_completed());
        }
        if let Phase::Disposed(error) = &state.phase {
            return Ok(Backpressure::ready(Err(error.clone())));
        }

        let position = state.emit_position;
        state.emit_position += 1;

        #[cfg(feature = "metrics")]
        crate::metrics::channel_pushed();

        let admitted = state.slots.len() < self.config.buffer_size;
        let (ack, backpressure) = if admitted {
            (None, Backpressure::ready(Ok(())))
        } else {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Backpressure::pending(rx))
        };

        let mut slot = Slot { value, ack };
        if let Some(waiter) = state.waiting.remove(&position) {
            match waiter.send(Ok(Some(slot))) {
                Ok(()) => {
                    trace!(position, "value handed to waiting consumer");
                    return Ok(backpressure);
                }
                // the waiting call is being torn down; keep the value for the next caller
                Err(Ok(Some(returned))) => slot = returned,
                Err(_) => return Ok(Backpressure::ready(Ok(()))),
            }
        }

        // emit_position only grows, so the new slot is always the last one
        state.slots.insert(position, slot);
        trace!(position, admitted, "value buffered");
        Ok(backpressure)
    }

    pub(crate) async fn pull(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Pulled<T>>> {
        let (position, receiver) = {
            let mut state = self.lock();
            if let Phase::Disposed(error) = &state.phase {
                return Err(error.clone());
            }

            let position = match state.reclaimed.pop_first() {
                Some(position) => position,
                None => {
                    let position = state.consume_position;
                    state.consume_position += 1;
                    position
                }
            };

            if let Some(slot) = state.slots.remove(&position) {
                let value = slot.consume();
                state.admit_buffered(self.config.buffer_size);
                #[cfg(feature = "metrics")]
                crate::metrics::channel_consumed();
                return Ok(Some(Pulled::new(position, value)));
            }

            if let Phase::Completed(error) = &state.phase {
                return match error {
                    Some(error) => Err(error.clone()),
                    None => Ok(None),
                };
            }

            let (tx, rx) = oneshot::channel();
            state.waiting.insert(position, tx);
            (position, rx)
        };

        let mut guard = PullGuard {
            shared: self,
            position,
            receiver,
            settled: false,
        };
        let outcome = match cancel {
            Some(token) => tokio::select! {
                biased;
                outcome = &mut guard.receiver => outcome,
                _ = token.cancelled() => {
                    trace!(position, "pull cancelled; position kept for the next caller");
                    return Err(Error::Cancelled);
                }
            },
            None => (&mut guard.receiver).await,
        };
        guard.settled = true;

        match outcome {
            Ok(Ok(Some(slot))) => {
                #[cfg(feature = "metrics")]
                crate::metrics::channel_consumed();
                Ok(Some(Pulled::new(position, slot.consume())))
            }
            Ok(Ok(None)) => Ok(None),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(Error::Disposed),
        }
    }

    pub(crate) fn complete(
        &self,
        error: Option<Error>,
        site: &'static Location<'static>,
    ) -> Result<()> {
        let (acks, waiters) = {
            let mut state = self.lock();
            if state.completed {
                return Err(state.already_completed());
            }
            state.completed = true;
            if self.config.track_call_sites {
                state.completed_at = Some(site);
            }
            if !matches!(state.phase, Phase::Open) {
                // disposal already won
                return Ok(());
            }

            debug!(failed = error.is_some(), emitted = state.emit_position, "channel completed");
            state.phase = Phase::Completed(error.clone());
            state.on_dispose.clear();
            let acks: Vec<_> = state
                .slots
                .values_mut()
                .filter_map(|slot| slot.ack.take())
                .collect();
            let waiters: Vec<_> = state.waiting.drain().map(|(_, waiter)| waiter).collect();
            (acks, waiters)
        };

        for ack in acks {
            let _ = ack.send(match &error {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            });
        }
        for waiter in waiters {
            let _ = waiter.send(match &error {
                Some(error) => Err(error.clone()),
                None => Ok(None),
            });
        }
        Ok(())
    }

    pub(crate) fn dispose(&self) {
        let error = Error::Disposed;
        let (slots, waiters, callbacks) = {
            let mut state = self.lock();
            if !matches!(state.phase, Phase::Open) {
                return;
            }
            debug!(
                emitted = state.emit_position,
                pending = state.waiting.len(),
                "channel disposed"
            );
            state.phase = Phase::Disposed(error.clone());
            state.reclaimed.clear();
            let slots = std::mem::take(&mut state.slots);
            let waiters: Vec<_> = state.waiting.drain().map(|(_, waiter)| waiter).collect();
            (slots, waiters, std::mem::take(&mut state.on_dispose))
        };

        #[cfg(feature = "metrics")]
        crate::metrics::channel_disposed();

        for (_, slot) in slots {
            if let Some(ack) = slot.ack {
                let _ = ack.send(Err(error.clone()));
            }
        }
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
        schedule_callbacks(callbacks, error);
    }

    pub(crate) fn on_dispose(&self, callback: DisposeCallback) {
        let mut state = self.lock();
        match &state.phase {
            Phase::Open => state.on_dispose.push(callback),
            Phase::Disposed(error) => {
                let error = error.clone();
                drop(state);
                schedule_callbacks(vec![callback], error);
            }
            Phase::Completed(_) => {}
        }
    }

    /// Called when the last sender goes away.
    pub(crate) fn abandon(&self) {
        let completed = self.lock().completed;
        if !completed {
            debug!("last sender dropped without completing the channel");
            let _ = self.complete(Some(Error::SenderDropped), Location::caller());
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.lock().completed
    }

    pub(crate) fn is_disposed(&self) -> bool {
        matches!(self.lock().phase, Phase::Disposed(_))
    }

    pub(crate) fn buffered(&self) -> usize {
        self.lock().slots.len()
    }
}

/// Hands back the position of a pull that stopped waiting early.
struct PullGuard<'a, T: Send + 'static> {
    shared: &'a Shared<T>,
    position: u64,
    receiver: oneshot::Receiver<Delivery<T>>,
    settled: bool,
}

impl<T: Send + 'static> Drop for PullGuard<'_, T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.shared.lock();
        if state.waiting.remove(&self.position).is_some() {
            state.reclaimed.insert(self.position);
            return;
        }
        // the producer got there first: put the value back in line, still
        // unacknowledged until someone actually consumes it
        if let Ok(Ok(Some(mut slot))) = self.receiver.try_recv() {
            let settled = match &state.phase {
                Phase::Open => None,
                Phase::Completed(error) => Some(error.clone().map_or(Ok(()), Err)),
                Phase::Disposed(error) => Some(Err(error.clone())),
            };
            if let (Some(result), Some(ack)) = (settled, slot.ack.take()) {
                let _ = ack.send(result);
            }
            if !matches!(state.phase, Phase::Disposed(_)) {
                state.slots.insert(self.position, slot);
                state.reclaimed.insert(self.position);
                state.admit_buffered(self.shared.config.buffer_size);
            }
        }
    }
}

/// Run dispose callbacks off the caller's stack.
fn schedule_callbacks(callbacks: Vec<DisposeCallback>, error: Error) {
    if callbacks.is_empty() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                for callback in callbacks {
                    callback(error.clone());
                }
            });
        }
        Err(_) => {
            for callback in callbacks {
                callback(error.clone());
            }
        }
    }
}
