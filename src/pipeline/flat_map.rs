//! Concurrent one-to-many expansion.

use std::sync::Arc;

use tracing::{debug, trace};

use super::{finish, ConcurrencyConfig, Stage};
use crate::channel::{Receiver, Sender};
use crate::core::{PullIterator, Pulled, Result, SharedIterator};

/// Expand every upstream item into an iterator of outputs, on
/// `config.concurrency` workers.
///
/// `expand` receives the item and its upstream position. Expansions are
/// pulled lazily, one output at a time, so a slow consumer paces how far
/// each expansion runs ahead.
///
/// In ordered mode two barriers keyed by the stage's pull order are used:
/// the pull gate makes `expand` run in upstream order, and the emit gate
/// makes all outputs of item N precede all outputs of item N+1. Disposing
/// the destination mid-expansion disposes the expansion in progress and
/// stops further upstream pulls.
///
/// ```rust
/// use pipeweld::prelude::*;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> pipeweld::Result<()> {
/// let upstream = VecSource::new(vec![1, 2]).into_shared();
/// let config = ConcurrencyConfig::default().concurrency(2);
/// let expanded = concurrent_flat_map(upstream, config, |x: i32, _position| {
///     Ok(VecSource::new(vec![x * 10, x * 10 + 1]))
/// })?;
///
/// assert_eq!(pipeweld::util::collect(&expanded).await?, vec![10, 11, 20, 21]);
/// # Ok(())
/// # }
/// ```
pub fn concurrent_flat_map<T, U, I, F>(
    upstream: SharedIterator<T>,
    config: ConcurrencyConfig,
    expand: F,
) -> Result<Receiver<U>>
where
    T: Send + 'static,
    U: Send + 'static,
    I: PullIterator<Item = U> + 'static,
    F: Fn(T, u64) -> Result<I> + Send + Sync + 'static,
{
    config.validate()?;
    let ordered = config.is_ordered();
    let (dest, receiver) = config.destination::<U>();
    let stage = Stage::new(upstream, ordered, ordered);
    stage.watch(&dest);
    let expand = Arc::new(expand);

    debug!(
        workers = config.concurrency,
        ordering = ?config.ordering,
        "starting flat-map stage"
    );

    let handles: Vec<_> = (0..config.concurrency)
        .map(|index| {
            let stage = stage.clone();
            let dest = dest.clone();
            let expand = expand.clone();
            tokio::spawn(async move {
                let outcome = expand_items(&stage, &dest, &*expand).await;
                match &outcome {
                    Ok(()) => debug!(worker = index, "worker finished"),
                    Err(error) => stage.fail(&dest, error.clone()),
                }
                outcome
            })
        })
        .collect();

    tokio::spawn(async move {
        if stage.join(&dest, handles).await.is_some() {
            finish(&dest);
        }
    });

    Ok(receiver)
}

async fn expand_items<T, U, I, F>(stage: &Stage<T>, dest: &Sender<U>, expand: &F) -> Result<()>
where
    T: Send + 'static,
    U: Send + 'static,
    I: PullIterator<Item = U>,
    F: Fn(T, u64) -> Result<I>,
{
    while let Some((ticket, Pulled { position, value })) = stage.next().await? {
        if let Some(gate) = &stage.pull_gate {
            gate.wait(ticket).await?;
        }
        let expanded = expand(value, position);
        if let Some(gate) = &stage.pull_gate {
            gate.release(ticket)?;
        }
        let expansion = expanded?;

        let drained = match &stage.emit_gate {
            Some(gate) => match gate.wait(ticket).await {
                Ok(()) => {
                    let drained = drain(&expansion, dest).await;
                    gate.release(ticket)?;
                    drained
                }
                Err(error) => Err(error),
            },
            None => drain(&expansion, dest).await,
        };
        if let Err(error) = drained {
            expansion.dispose();
            return Err(error);
        }
        trace!(position, "item expanded");
    }
    Ok(())
}

async fn drain<I, U>(expansion: &I, dest: &Sender<U>) -> Result<()>
where
    I: PullIterator<Item = U>,
    U: Send + 'static,
{
    while let Some(pulled) = expansion.pull(None).await? {
        dest.send(pulled.value).await?;
    }
    Ok(())
}
