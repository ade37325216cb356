//! Core traits and types for the pipeweld library.
//!
//! This module contains the fundamental traits and error types shared by
//! every pipeline primitive.

pub mod error;
pub mod traits;

// Re-export core items
pub use error::{Error, ErrorKind, Result};
pub use traits::{Processor, ProcessorExt, PullIterator, Pulled, SharedIterator};
