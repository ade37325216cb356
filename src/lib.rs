//! # Ordered, backpressured async pipelines
//!
//! This crate provides the primitives for connecting producers and consumers
//! that run as independent tokio tasks without unbounded buffering.
//!
//! ## Core Concepts
//!
//! - **Channel**: couples one producer to pull-based consumers with
//!   backpressure, graceful completion and early disposal
//! - **PullIterator**: the consumption protocol shared by channels, fixed
//!   sequences, closure-driven suppliers and concatenations; safe to drain
//!   from many tasks at once
//! - **Barrier**: admits callers in strictly increasing position order
//! - **Concurrent operators**: K workers draining one upstream through
//!   private processor chains, in order or not
//! - **Multicast**: one upstream replicated to independently paced branches
//!
//! ## Example
//!
//! ```rust
//! use pipeweld::prelude::*;
//! use pipeweld::processors::MapProcessor;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (tx, rx) = channel::<u64>(ChannelConfig::default().buffer_size(8));
//!
//!     tokio::spawn(async move {
//!         for i in 1..=100 {
//!             if tx.send(i).await.is_err() {
//!                 return;
//!             }
//!         }
//!         let _ = tx.complete();
//!     });
//!
//!     let config = ConcurrencyConfig::default().concurrency(4);
//!     let squares = concurrent(rx.into_shared(), config, || MapProcessor::new(|x: u64| x * x))?;
//!
//!     let mut cursor = squares.cursor();
//!     let mut expected = 1;
//!     while cursor.advance().await? {
//!         assert_eq!(*cursor.value()?, expected * expected);
//!         expected += 1;
//!     }
//!     Ok(())
//! }
//! ```

pub mod barrier;
pub mod channel;
pub mod core;
pub mod multicast;
pub mod pipeline;
pub mod processors;
pub mod sources;
pub mod util;

// Re-export commonly used items
pub mod prelude {
    pub use crate::barrier::Barrier;
    pub use crate::channel::{channel, Backpressure, ChannelConfig, Receiver, Sender};
    pub use crate::core::{
        Error, ErrorKind, Processor, ProcessorExt, PullIterator, Pulled, Result, SharedIterator,
    };
    pub use crate::multicast::Multicast;
    pub use crate::pipeline::{concurrent, concurrent_flat_map, ConcurrencyConfig, Ordering};
    pub use crate::sources::{from_fn, ChainSource, Cursor, FnSource, PullIteratorExt, VecSource};
}

// Re-export main error type
pub use crate::core::{Error, ErrorKind, Result};

#[cfg(feature = "metrics")]
mod metrics;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
