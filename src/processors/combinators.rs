//! Composition of processors.

use async_trait::async_trait;

use crate::core::{Processor, Result};

/// Feeds every output of `first` into `second`.
///
/// Built with [`ProcessorExt::then`](crate::core::ProcessorExt::then).
/// On `finish`, whatever `first` still holds is pushed through `second`
/// before `second` is flushed itself.
pub struct Then<A, B> {
    first: A,
    second: B,
}

impl<A, B> Then<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A, B> Then<A, B>
where
    A: Processor + Send,
    B: Processor<Input = A::Output> + Send,
{
    async fn feed(&mut self, items: Vec<A::Output>) -> Result<Vec<B::Output>> {
        let mut outputs = Vec::new();
        for item in items {
            outputs.extend(self.second.process(item).await?);
        }
        Ok(outputs)
    }
}

#[async_trait]
impl<A, B> Processor for Then<A, B>
where
    A: Processor + Send,
    B: Processor<Input = A::Output> + Send,
{
    type Input = A::Input;
    type Output = B::Output;

    async fn process(&mut self, item: Self::Input) -> Result<Vec<Self::Output>> {
        let intermediate = self.first.process(item).await?;
        self.feed(intermediate).await
    }

    async fn finish(&mut self) -> Result<Vec<Self::Output>> {
        let remaining = self.first.finish().await?;
        let mut outputs = self.feed(remaining).await?;
        outputs.extend(self.second.finish().await?);
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Error, ProcessorExt};
    use crate::processors::{BatchProcessor, FilterProcessor, MapProcessor};

    #[tokio::test]
    async fn test_then_chains_outputs() {
        let mut chain = FilterProcessor::new(|x: &i32| *x > 1)
            .then(MapProcessor::new(|x: i32| x * 10));
        assert!(chain.process(1).await.unwrap().is_empty());
        assert_eq!(chain.process(2).await.unwrap(), vec![20]);
    }

    #[tokio::test]
    async fn test_finish_flushes_through_the_chain() {
        let mut chain = BatchProcessor::new(2).then(MapProcessor::new(|batch: Vec<i32>| batch.len()));
        assert!(chain.process(1).await.unwrap().is_empty());
        assert_eq!(chain.process(2).await.unwrap(), vec![2]);
        assert!(chain.process(3).await.unwrap().is_empty());
        assert_eq!(chain.finish().await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_error_stops_the_chain() {
        struct Reject;

        #[async_trait]
        impl Processor for Reject {
            type Input = i32;
            type Output = i32;

            async fn process(&mut self, _item: i32) -> Result<Vec<i32>> {
                Err(Error::custom("rejected"))
            }
        }

        let mut chain = MapProcessor::new(|x: i32| x + 1).then(Reject);
        assert_eq!(chain.process(1).await.unwrap_err().to_string(), "rejected");
    }
}
