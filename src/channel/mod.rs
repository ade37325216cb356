//! The backpressured channel at the bottom of every pipeline.
//!
//! A channel couples one logical producer ([`Sender`]) to pull-based
//! consumption ([`Receiver`]). It has two terminal states:
//!
//! - **completion**, requested by the producer with [`Sender::complete`] or
//!   [`Sender::fail`]. Values already pushed are still delivered, then
//!   consumers observe end-of-stream or the producer's error.
//! - **disposal**, requested by the consumer with [`Receiver::dispose`] or by
//!   dropping the receiver. Every pending and future producer or consumer
//!   call fails with [`Error::Disposed`](crate::Error::Disposed) and the
//!   dispose callbacks run exactly once.
//!
//! The first terminal transition wins. Disposing a completed channel is a
//! no-op; completing a disposed channel is a no-op; completing twice is a
//! usage error.
//!
//! # Example
//!
//! ```rust
//! use pipeweld::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> pipeweld::Result<()> {
//! let (tx, rx) = channel::<u32>(ChannelConfig::default().buffer_size(2));
//!
//! tx.push(1)?.await?; // admitted by the buffer
//! tx.push(2)?.await?;
//! tx.complete()?;
//!
//! let mut cursor = rx.cursor();
//! let mut seen = Vec::new();
//! while cursor.advance().await? {
//!     seen.push(*cursor.value()?);
//! }
//! assert_eq!(seen, vec![1, 2]);
//! # Ok(())
//! # }
//! ```

mod backpressure;
mod state;

use std::panic::Location;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use backpressure::Backpressure;

use crate::core::{Error, PullIterator, Pulled, Result, SharedIterator};
use crate::sources::Cursor;
use state::Shared;

/// Configuration for a channel
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelConfig {
    /// Number of unconsumed values whose backpressure handles resolve
    /// without waiting for a consumer. Zero means every push waits.
    pub buffer_size: usize,
    /// Record where a channel was first completed, for double-completion
    /// diagnostics
    pub track_call_sites: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            buffer_size: 0,
            track_call_sites: cfg!(debug_assertions),
        }
    }
}

impl ChannelConfig {
    /// Set the buffer size
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set whether completion call sites are recorded
    pub fn track_call_sites(mut self, track: bool) -> Self {
        self.track_call_sites = track;
        self
    }
}

/// Create a channel, returning its producer and consumer halves.
pub fn channel<T: Send + 'static>(config: ChannelConfig) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared::new(config));
    (
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    )
}

/// The producer half of a channel.
///
/// Clones share the same channel so several workers can emit into one
/// destination. Dropping the last sender without completing fails the
/// channel with [`Error::SenderDropped`].
pub struct Sender<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Sender<T> {
    /// Emit a value, returning a handle that resolves once it is consumed.
    ///
    /// Fails with [`Error::AlreadyCompleted`] when called after
    /// [`complete`](Sender::complete) or [`fail`](Sender::fail). On a
    /// disposed channel the value is dropped and the handle resolves with
    /// [`Error::Disposed`].
    pub fn push(&self, value: T) -> Result<Backpressure> {
        self.shared.push(value)
    }

    /// Emit a value and wait until it is consumed.
    pub async fn send(&self, value: T) -> Result<()> {
        self.push(value)?.await
    }

    /// Complete the channel successfully.
    ///
    /// Values already pushed are still delivered; afterwards consumers see
    /// end-of-stream.
    #[track_caller]
    pub fn complete(&self) -> Result<()> {
        self.shared.complete(None, Location::caller())
    }

    /// Complete the channel with an error that every consumer will observe
    /// once the buffered values are drained.
    #[track_caller]
    pub fn fail(&self, error: Error) -> Result<()> {
        self.shared.complete(Some(error), Location::caller())
    }

    /// Register a callback invoked once, off the caller's stack, when the
    /// consumer disposes the channel.
    ///
    /// On an already disposed channel the callback is scheduled right away;
    /// on a completed channel it is never called.
    pub fn on_dispose<F>(&self, callback: F)
    where
        F: FnOnce(Error) + Send + 'static,
    {
        self.shared.on_dispose(Box::new(callback));
    }

    /// True once `complete` or `fail` has been called
    pub fn is_completed(&self) -> bool {
        self.shared.is_completed()
    }

    /// True once the consumer has disposed the channel
    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }
}

impl<T: Send + 'static> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.abandon();
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("completed", &self.is_completed())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// The consumer half of a channel.
///
/// Safe to share between tasks (wrap it in an `Arc` or convert it with
/// [`into_shared`](Receiver::into_shared)); each pull belongs to the task
/// that made it. Dropping the receiver disposes the channel.
pub struct Receiver<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Receiver<T> {
    /// Abandon the channel. Idempotent.
    pub fn dispose(&self) {
        self.shared.dispose();
    }

    /// See [`Sender::on_dispose`]
    pub fn on_dispose<F>(&self, callback: F)
    where
        F: FnOnce(Error) + Send + 'static,
    {
        self.shared.on_dispose(Box::new(callback));
    }

    /// True once the channel has been disposed
    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// True once the producer has completed or failed the channel
    pub fn is_completed(&self) -> bool {
        self.shared.is_completed()
    }

    /// Number of values pushed but not yet consumed
    pub fn buffered(&self) -> usize {
        self.shared.buffered()
    }

    /// Wrap the receiver in a per-task consumer context
    pub fn cursor(self) -> Cursor<T> {
        Cursor::new(self.into_shared())
    }

    /// Erase the receiver's type so it can be shared by many tasks
    pub fn into_shared(self) -> SharedIterator<T> {
        Arc::new(self)
    }
}

#[async_trait]
impl<T: Send + 'static> PullIterator for Receiver<T> {
    type Item = T;

    async fn pull(&self, cancel: Option<&CancellationToken>) -> Result<Option<Pulled<T>>> {
        self.shared.pull(cancel).await
    }

    fn dispose(&self) {
        self.shared.dispose();
    }
}

impl<T: Send + 'static> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

impl<T: Send + 'static> std::fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("buffered", &self.buffered())
            .field("completed", &self.is_completed())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
