//! Processor implementations run by the concurrent operators.
//!
//! Each worker of [`concurrent`](crate::pipeline::concurrent) owns a private
//! processor chain built from these pieces, so processors may keep mutable
//! state without any synchronization.

pub mod combinators;

use async_trait::async_trait;

use crate::core::{Processor, Result};

pub use combinators::Then;

/// A processor that maps items using a function.
pub struct MapProcessor<F, T, U> {
    f: F,
    _phantom: std::marker::PhantomData<fn(T) -> U>,
}

impl<F, T, U> MapProcessor<F, T, U> {
    /// Create a new map processor
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<F, T, U> Processor for MapProcessor<F, T, U>
where
    F: FnMut(T) -> U + Send,
    T: Send + 'static,
    U: Send + 'static,
{
    type Input = T;
    type Output = U;

    async fn process(&mut self, item: Self::Input) -> Result<Vec<Self::Output>> {
        Ok(vec![(self.f)(item)])
    }
}

/// A processor that only passes items satisfying the predicate.
pub struct FilterProcessor<F, T> {
    predicate: F,
    _phantom: std::marker::PhantomData<fn(T)>,
}

impl<F, T> FilterProcessor<F, T> {
    /// Create a new filter processor
    pub fn new(predicate: F) -> Self {
        Self {
            predicate,
            _phantom: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<F, T> Processor for FilterProcessor<F, T>
where
    F: FnMut(&T) -> bool + Send,
    T: Send + 'static,
{
    type Input = T;
    type Output = T;

    async fn process(&mut self, item: Self::Input) -> Result<Vec<Self::Output>> {
        if (self.predicate)(&item) {
            Ok(vec![item])
        } else {
            Ok(vec![])
        }
    }
}

/// A processor that observes every item and passes it through unchanged.
pub struct TapProcessor<F, T> {
    f: F,
    _phantom: std::marker::PhantomData<fn(T)>,
}

impl<F, T> TapProcessor<F, T> {
    /// Create a new tap processor
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<F, T> Processor for TapProcessor<F, T>
where
    F: FnMut(&T) + Send,
    T: Send + 'static,
{
    type Input = T;
    type Output = T;

    async fn process(&mut self, item: Self::Input) -> Result<Vec<Self::Output>> {
        (self.f)(&item);
        Ok(vec![item])
    }
}

/// A processor that collects items into batches.
///
/// The last, possibly short, batch is emitted by `finish`.
pub struct BatchProcessor<T> {
    batch_size: usize,
    batch: Vec<T>,
}

impl<T> BatchProcessor<T> {
    /// Create a new batch processor. A size of zero is treated as one.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            batch: Vec::new(),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Processor for BatchProcessor<T> {
    type Input = T;
    type Output = Vec<T>;

    async fn process(&mut self, item: Self::Input) -> Result<Vec<Self::Output>> {
        self.batch.push(item);

        if self.batch.len() >= self.batch_size {
            Ok(vec![std::mem::take(&mut self.batch)])
        } else {
            Ok(vec![])
        }
    }

    async fn finish(&mut self) -> Result<Vec<Self::Output>> {
        if self.batch.is_empty() {
            Ok(vec![])
        } else {
            Ok(vec![std::mem::take(&mut self.batch)])
        }
    }
}

/// A processor that passes through items unchanged
pub struct NoOpProcessor<T> {
    _phantom: std::marker::PhantomData<fn(T)>,
}

impl<T> NoOpProcessor<T> {
    /// Create a new no-op processor
    pub fn new() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Processor for NoOpProcessor<T> {
    type Input = T;
    type Output = T;

    async fn process(&mut self, item: Self::Input) -> Result<Vec<Self::Output>> {
        Ok(vec![item])
    }
}

impl<T> Default for NoOpProcessor<T> {
    fn default() -> Self {
        Self::new()
    }
}
