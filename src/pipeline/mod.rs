//! Bounded-concurrency operators.
//!
//! [`concurrent`] runs K worker tasks that pull from one shared upstream
//! iterator, push each item through a private [`Processor`] chain and merge
//! the results into a single destination channel. [`concurrent_flat_map`]
//! does the same for one-to-many expansion.
//!
//! Workers balance load by pulling: a worker that finishes early immediately
//! pulls the next item. In [`Ordering::Ordered`] mode pulls are numbered by
//! the stage in the order they return, and a [`Barrier`] keyed by that number
//! holds each worker back until every earlier item has been emitted, so
//! results leave in the order items were pulled. An upstream that was already
//! partly consumed is fine: numbering starts at zero for every stage.
//!
//! The first failure wins: it fails the destination, disposes the upstream
//! iterator and aborts the barriers so every other worker stops promptly.
//! Disposing the destination stops the stage the same way.
//!
//! # Example
//!
//! ```rust
//! use pipeweld::prelude::*;
//! use pipeweld::processors::MapProcessor;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> pipeweld::Result<()> {
//! let upstream = VecSource::new((1..=5).collect()).into_shared();
//! let config = ConcurrencyConfig::default().concurrency(3);
//! let doubled = concurrent(upstream, config, || MapProcessor::new(|x: i32| x * 2))?;
//!
//! let mut cursor = doubled.cursor();
//! let mut seen = Vec::new();
//! while cursor.advance().await? {
//!     seen.push(cursor.take()?);
//! }
//! assert_eq!(seen, vec![2, 4, 6, 8, 10]);
//! # Ok(())
//! # }
//! ```

mod flat_map;

pub use flat_map::concurrent_flat_map;

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::barrier::Barrier;
use crate::channel::{channel, ChannelConfig, Receiver, Sender};
use crate::core::{Error, Processor, Pulled, Result, SharedIterator};

/// Whether a concurrent stage preserves upstream order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Ordering {
    /// Results are emitted in the order items were pulled
    #[default]
    Ordered,
    /// Results are emitted as soon as a worker produces them
    Unordered,
}

/// Configuration for a concurrent stage
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConcurrencyConfig {
    /// Number of worker tasks
    pub concurrency: usize,
    /// Whether results keep upstream order
    pub ordering: Ordering,
    /// Buffer size of the destination channel
    pub buffer_size: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            ordering: Ordering::Ordered,
            buffer_size: 0,
        }
    }
}

impl ConcurrencyConfig {
    /// Set the number of workers
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the ordering mode
    pub fn ordering(mut self, ordering: Ordering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Shorthand for `ordering(Ordering::Unordered)`
    pub fn unordered(self) -> Self {
        self.ordering(Ordering::Unordered)
    }

    /// Set the destination buffer size
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Check the configuration
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::usage("concurrency must be at least 1"));
        }
        Ok(())
    }

    fn is_ordered(&self) -> bool {
        self.ordering == Ordering::Ordered
    }

    fn destination<U: Send + 'static>(&self) -> (Sender<U>, Receiver<U>) {
        channel(ChannelConfig::default().buffer_size(self.buffer_size))
    }
}

/// State shared by the workers of one stage.
pub(crate) struct Stage<T: Send + 'static> {
    pub(crate) upstream: SharedIterator<T>,
    /// Orders the start of per-item work (flat-map only)
    pub(crate) pull_gate: Option<Barrier>,
    /// Orders emission into the destination
    pub(crate) emit_gate: Option<Barrier>,
    /// Next stage-local sequence number, held across each pull when gated
    sequence: Option<TokioMutex<u64>>,
}

impl<T: Send + 'static> Stage<T> {
    pub(crate) fn new(upstream: SharedIterator<T>, pull_gate: bool, emit_gate: bool) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            pull_gate: pull_gate.then(Barrier::new),
            emit_gate: emit_gate.then(Barrier::new),
            sequence: (pull_gate || emit_gate).then(|| TokioMutex::new(0)),
        })
    }

    /// Pull the next upstream item along with its sequence number.
    ///
    /// Gated stages pull one at a time so sequence numbers match the order
    /// items left upstream. Ungated stages reuse the upstream position.
    pub(crate) async fn next(&self) -> Result<Option<(u64, Pulled<T>)>> {
        let Some(sequence) = &self.sequence else {
            let pulled = self.upstream.pull(None).await?;
            return Ok(pulled.map(|pulled| (pulled.position, pulled)));
        };
        let mut next = sequence.lock().await;
        let Some(pulled) = self.upstream.pull(None).await? else {
            return Ok(None);
        };
        let ticket = *next;
        *next += 1;
        Ok(Some((ticket, pulled)))
    }

    /// Stop every worker: no more pulls, no more barrier turns.
    pub(crate) fn halt(&self) {
        self.upstream.dispose();
        for gate in self.pull_gate.iter().chain(self.emit_gate.iter()) {
            gate.abort(Error::Disposed);
        }
    }

    /// Report a worker failure. Only the first one reaches the destination.
    pub(crate) fn fail<U: Send + 'static>(&self, dest: &Sender<U>, error: Error) {
        match dest.fail(error.clone()) {
            Ok(()) if !dest.is_disposed() => {
                debug!(%error, "worker failed, stopping stage");
                #[cfg(feature = "metrics")]
                crate::metrics::worker_failed();
            }
            Ok(()) => trace!("worker stopped after the destination was disposed"),
            Err(_) if error.is_disposed() || matches!(error, Error::AlreadyCompleted { .. }) => {
                trace!("worker stopped after the stage halted")
            }
            Err(_) => warn!(%error, "dropping worker failure, destination already completed"),
        }
        self.halt();
    }

    /// Register the destination's dispose callback so abandoning the output
    /// stops the stage.
    pub(crate) fn watch<U: Send + 'static>(self: &Arc<Self>, dest: &Sender<U>) {
        let stage = self.clone();
        dest.on_dispose(move |_| {
            debug!("destination disposed, stopping stage");
            stage.halt();
        });
    }

    /// Wait for every worker. Returns their outputs only if all succeeded.
    pub(crate) async fn join<U, R>(
        &self,
        dest: &Sender<U>,
        handles: Vec<JoinHandle<Result<R>>>,
    ) -> Option<Vec<R>>
    where
        U: Send + 'static,
    {
        let mut outputs = Vec::with_capacity(handles.len());
        let mut succeeded = true;
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(output)) => outputs.push(output),
                // already reported by the worker
                Ok(Err(_)) => succeeded = false,
                Err(join_error) => {
                    self.fail(dest, Error::custom(format!("worker task failed: {}", join_error)));
                    succeeded = false;
                }
            }
        }
        succeeded.then_some(outputs)
    }
}

/// Send every output, waiting for each to be consumed.
pub(crate) async fn emit<U: Send + 'static>(dest: &Sender<U>, outputs: Vec<U>) -> Result<()> {
    for output in outputs {
        dest.send(output).await?;
    }
    Ok(())
}

/// Complete the destination once every worker is done.
pub(crate) fn finish<U: Send + 'static>(dest: &Sender<U>) {
    if let Err(error) = dest.complete() {
        trace!(%error, "destination already completed");
    }
}

/// Run `factory()`-built processor chains on `concurrency` workers.
///
/// Returns the destination receiver immediately; the workers run as tokio
/// tasks, so this must be called from within a runtime. The destination
/// completes after every worker has exhausted upstream and flushed its chain
/// with [`Processor::finish`]. In ordered mode the flushed outputs follow all
/// item outputs, in worker index order.
pub fn concurrent<T, P, F>(
    upstream: SharedIterator<T>,
    config: ConcurrencyConfig,
    mut factory: F,
) -> Result<Receiver<P::Output>>
where
    T: Send + 'static,
    P: Processor<Input = T> + Send + 'static,
    F: FnMut() -> P,
{
    config.validate()?;
    let ordered = config.is_ordered();
    let (dest, receiver) = config.destination::<P::Output>();
    let stage = Stage::new(upstream, false, ordered);
    stage.watch(&dest);

    debug!(
        workers = config.concurrency,
        ordering = ?config.ordering,
        "starting concurrent stage"
    );

    let handles: Vec<_> = (0..config.concurrency)
        .map(|index| {
            let stage = stage.clone();
            let dest = dest.clone();
            let processor = factory();
            tokio::spawn(async move {
                let outcome = work(&stage, &dest, processor, ordered).await;
                match &outcome {
                    Ok(_) => debug!(worker = index, "worker finished"),
                    Err(error) => stage.fail(&dest, error.clone()),
                }
                outcome
            })
        })
        .collect();

    tokio::spawn(async move {
        let Some(flushes) = stage.join(&dest, handles).await else {
            return;
        };
        for processor in flushes.into_iter().flatten() {
            if let Err(error) = flush(&dest, processor).await {
                stage.fail(&dest, error);
                return;
            }
        }
        finish(&dest);
    });

    Ok(receiver)
}

/// One worker's loop. In ordered mode the processor is handed back unflushed.
async fn work<T, P>(
    stage: &Stage<T>,
    dest: &Sender<P::Output>,
    mut processor: P,
    ordered: bool,
) -> Result<Option<P>>
where
    T: Send + 'static,
    P: Processor<Input = T> + Send,
{
    while let Some((ticket, Pulled { position, value })) = stage.next().await? {
        trace!(position, ticket, "processing item");
        let outputs = processor.process(value).await?;

        let Some(gate) = &stage.emit_gate else {
            emit(dest, outputs).await?;
            continue;
        };
        if outputs.is_empty() {
            gate.forfeit(ticket);
            continue;
        }
        gate.wait(ticket).await?;
        let emitted = emit(dest, outputs).await;
        gate.release(ticket)?;
        emitted?;
    }

    if ordered {
        Ok(Some(processor))
    } else {
        flush(dest, processor).await?;
        Ok(None)
    }
}

async fn flush<P: Processor + Send>(dest: &Sender<P::Output>, mut processor: P) -> Result<()> {
    let outputs = processor.finish().await?;
    emit(dest, outputs).await
}
