//! Per-task consumer context over a shared [`PullIterator`].

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::{Error, PullIterator, Pulled, Result, SharedIterator};

enum Current<T> {
    Fresh,
    At(Pulled<T>),
    Taken(u64),
    Finished,
}

/// The `advance` / `value` / `position` view of a stream for one task.
///
/// A cursor owns the "current value" of its task, so any number of cursors
/// (one per task, see [`fork`](Cursor::fork)) can drain the same iterator
/// concurrently without observing each other's values.
///
/// ```rust
/// use pipeweld::prelude::*;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> pipeweld::Result<()> {
/// let mut cursor = Cursor::new(VecSource::new(vec![3, 4]).into_shared());
/// assert!(cursor.value().is_err()); // nothing pulled yet
///
/// assert!(cursor.advance().await?);
/// assert_eq!((*cursor.value()?, cursor.position()?), (3, 0));
/// assert!(cursor.advance().await?);
/// assert!(!cursor.advance().await?);
/// # Ok(())
/// # }
/// ```
pub struct Cursor<T: Send + 'static> {
    source: SharedIterator<T>,
    current: Current<T>,
}

impl<T: Send + 'static> Cursor<T> {
    pub fn new(source: SharedIterator<T>) -> Self {
        Self {
            source,
            current: Current::Fresh,
        }
    }

    /// A new cursor over the same iterator, for use by another task.
    pub fn fork(&self) -> Self {
        Self::new(self.source.clone())
    }

    /// The iterator this cursor reads from
    pub fn source(&self) -> &SharedIterator<T> {
        &self.source
    }

    /// Pull the next value. Returns `false` at end-of-stream.
    pub async fn advance(&mut self) -> Result<bool> {
        let outcome = self.source.pull(None).await;
        self.settle(outcome)
    }

    /// Pull the next value, giving up with [`Error::Cancelled`] if `cancel`
    /// fires first. The abandoned position is served to the next caller.
    pub async fn advance_with(&mut self, cancel: &CancellationToken) -> Result<bool> {
        let outcome = self.source.pull(Some(cancel)).await;
        self.settle(outcome)
    }

    /// Pull the next value, giving up with [`Error::Timeout`] after `timeout`.
    pub async fn advance_timeout(&mut self, timeout: Duration) -> Result<bool> {
        let outcome = match tokio::time::timeout(timeout, self.source.pull(None)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::timeout(saturating_millis(timeout))),
        };
        self.settle(outcome)
    }

    fn settle(&mut self, outcome: Result<Option<Pulled<T>>>) -> Result<bool> {
        match outcome {
            Ok(Some(pulled)) => {
                self.current = Current::At(pulled);
                Ok(true)
            }
            Ok(None) => {
                self.current = Current::Finished;
                Ok(false)
            }
            Err(error) => {
                self.current = if error.is_cancelled() {
                    Current::Fresh
                } else {
                    Current::Finished
                };
                Err(error)
            }
        }
    }

    /// The value of the last successful advance.
    pub fn value(&self) -> Result<&T> {
        match &self.current {
            Current::At(pulled) => Ok(&pulled.value),
            Current::Taken(_) => Err(already_taken()),
            _ => Err(not_positioned()),
        }
    }

    /// The position of the last successful advance.
    pub fn position(&self) -> Result<u64> {
        match &self.current {
            Current::At(pulled) => Ok(pulled.position),
            Current::Taken(position) => Ok(*position),
            _ => Err(not_positioned()),
        }
    }

    /// Move the current value out of the cursor. The position stays readable.
    pub fn take(&mut self) -> Result<T> {
        match std::mem::replace(&mut self.current, Current::Fresh) {
            Current::At(pulled) => {
                self.current = Current::Taken(pulled.position);
                Ok(pulled.value)
            }
            other => {
                let error = match &other {
                    Current::Taken(_) => already_taken(),
                    _ => not_positioned(),
                };
                self.current = other;
                Err(error)
            }
        }
    }

    /// Dispose the underlying iterator for every task sharing it.
    pub fn dispose(&self) {
        self.source.dispose();
    }
}

fn not_positioned() -> Error {
    Error::usage("value() or position() called without a successful advance()")
}

fn already_taken() -> Error {
    Error::usage("the current value was already taken")
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{channel, ChannelConfig};
    use crate::sources::{PullIteratorExt, VecSource};

    #[tokio::test]
    async fn test_accessors_before_advance_are_usage_errors() {
        let mut cursor = Cursor::new(VecSource::new(vec![1]).into_shared());
        assert!(matches!(cursor.value(), Err(Error::Usage(_))));
        assert!(matches!(cursor.position(), Err(Error::Usage(_))));
        assert!(matches!(cursor.take(), Err(Error::Usage(_))));

        assert!(cursor.advance().await.unwrap());
        assert_eq!(cursor.take().unwrap(), 1);
        assert_eq!(cursor.position().unwrap(), 0);
        assert!(matches!(cursor.value(), Err(Error::Usage(_))));

        assert!(!cursor.advance().await.unwrap());
        assert!(matches!(cursor.value(), Err(Error::Usage(_))));
    }

    #[tokio::test]
    async fn test_forked_cursors_keep_their_own_values() {
        let (tx, rx) = channel::<&str>(ChannelConfig::default().buffer_size(2));
        let mut first = rx.cursor();
        let mut second = first.fork();

        tx.push("a").unwrap().await.unwrap();
        tx.push("b").unwrap().await.unwrap();

        assert!(first.advance().await.unwrap());
        assert!(second.advance().await.unwrap());
        assert_eq!(*first.value().unwrap(), "a");
        assert_eq!(*second.value().unwrap(), "b");
        assert_eq!(second.position().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_cancellation() {
        let (tx, rx) = channel::<u8>(ChannelConfig::default());
        let mut cursor = rx.cursor();

        let err = cursor
            .advance_timeout(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { duration_ms: 50 }));
        assert!(cursor.value().is_err());

        // the timed out position is served to the next advance
        let _handle = tx.push(9).unwrap();
        assert!(cursor.advance().await.unwrap());
        assert_eq!((*cursor.value().unwrap(), cursor.position().unwrap()), (9, 0));
    }

    #[test]
    fn test_timeout_millis_saturate() {
        assert_eq!(saturating_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(saturating_millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_cancelled_advance_leaves_cursor_fresh() {
        let (_tx, rx) = channel::<u8>(ChannelConfig::default());
        let mut cursor = rx.cursor();
        let token = CancellationToken::new();
        token.cancel();

        assert!(matches!(
            cursor.advance_with(&token).await,
            Err(Error::Cancelled)
        ));
        assert!(matches!(cursor.position(), Err(Error::Usage(_))));
    }
}
