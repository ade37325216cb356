//! Fan one upstream iterator out to several independently paced branches.
//!
//! A single dispersal task pulls one upstream item at a time, pushes a clone
//! into every active branch and waits until every branch has consumed it
//! before pulling the next one. The slowest active branch therefore paces
//! the whole multicast.
//!
//! ```rust
//! use pipeweld::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> pipeweld::Result<()> {
//! let multicast = Multicast::new(VecSource::new(vec![1, 2, 3]).into_shared());
//! let left = multicast.branch();
//! let right = multicast.branch();
//!
//! let (left, right) = tokio::join!(
//!     pipeweld::util::collect(&left),
//!     pipeweld::util::collect(&right),
//! );
//! assert_eq!(left?, vec![1, 2, 3]);
//! assert_eq!(right?, vec![1, 2, 3]);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::join_all;
use tracing::{debug, trace};

use crate::channel::{channel, ChannelConfig, Receiver, Sender};
use crate::core::{Error, Pulled, SharedIterator};

/// Unique identifier for branches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchId(pub u64);

#[derive(Clone)]
enum Terminal {
    Completed(Option<Error>),
    Disposed,
}

struct Branches<T: Send + 'static> {
    next_id: u64,
    active: HashMap<BranchId, Sender<T>>,
    terminal: Option<Terminal>,
    dispersing: bool,
}

struct Inner<T: Send + 'static> {
    upstream: SharedIterator<T>,
    config: ChannelConfig,
    branches: Mutex<Branches<T>>,
}

/// One upstream stream replicated to a dynamic set of branches.
pub struct Multicast<T: Clone + Send + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone + Send + 'static> Multicast<T> {
    /// Create a multicast whose branches are unbuffered channels
    pub fn new(upstream: SharedIterator<T>) -> Self {
        Self::with_config(upstream, ChannelConfig::default())
    }

    /// Create a multicast whose branches use `config`
    pub fn with_config(upstream: SharedIterator<T>, config: ChannelConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                upstream,
                config,
                branches: Mutex::new(Branches {
                    next_id: 0,
                    active: HashMap::new(),
                    terminal: None,
                    dispersing: false,
                }),
            }),
        }
    }

    /// Add a branch receiving every item pulled from now on.
    ///
    /// The first branch starts the dispersal task, so this must be called
    /// from within a tokio runtime. A branch added after upstream has ended
    /// observes that terminal state right away. Disposing (or dropping) the
    /// returned receiver removes the branch; removing the last branch
    /// disposes upstream.
    pub fn branch(&self) -> Receiver<T> {
        let (tx, rx) = channel(self.inner.config.clone());
        let mut branches = self.inner.lock();

        if let Some(terminal) = branches.terminal.clone() {
            drop(branches);
            trace!("branch added after upstream ended");
            match terminal {
                Terminal::Completed(None) => {
                    let _ = tx.complete();
                }
                Terminal::Completed(Some(error)) => {
                    let _ = tx.fail(error);
                }
                Terminal::Disposed => rx.dispose(),
            }
            return rx;
        }

        let id = BranchId(branches.next_id);
        branches.next_id += 1;
        let weak = Arc::downgrade(&self.inner);
        tx.on_dispose(move |_| remove_branch(&weak, id));
        branches.active.insert(id, tx);
        debug!(branch = id.0, active = branches.active.len(), "branch added");

        if !branches.dispersing {
            branches.dispersing = true;
            tokio::spawn(disperse(self.inner.clone()));
        }
        rx
    }

    /// Number of active branches
    pub fn branch_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// True once upstream has completed, failed or been disposed
    pub fn is_terminated(&self) -> bool {
        self.inner.lock().terminal.is_some()
    }
}

impl<T: Clone + Send + 'static> std::fmt::Debug for Multicast<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multicast")
            .field("branches", &self.branch_count())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl<T: Send + 'static> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, Branches<T>> {
        self.branches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, id: BranchId) {
        let emptied = {
            let mut branches = self.lock();
            if branches.active.remove(&id).is_none() {
                return;
            }
            debug!(branch = id.0, active = branches.active.len(), "branch removed");
            if branches.active.is_empty() && branches.terminal.is_none() {
                branches.terminal = Some(Terminal::Disposed);
                true
            } else {
                false
            }
        };
        if emptied {
            debug!("last branch removed, disposing upstream");
            self.upstream.dispose();
        }
    }

    /// Record the upstream's terminal state and pass it to every branch.
    fn terminate(&self, terminal: Terminal) {
        let active: Vec<_> = {
            let mut branches = self.lock();
            if branches.terminal.is_some() {
                return;
            }
            branches.terminal = Some(terminal.clone());
            branches.active.drain().map(|(_, tx)| tx).collect()
        };
        for tx in active {
            let _ = match &terminal {
                Terminal::Completed(None) => tx.complete(),
                Terminal::Completed(Some(error)) => tx.fail(error.clone()),
                Terminal::Disposed => tx.fail(Error::Disposed),
            };
        }
    }

    fn snapshot(&self) -> Vec<(BranchId, Sender<T>)> {
        self.lock()
            .active
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect()
    }
}

fn remove_branch<T: Send + 'static>(inner: &Weak<Inner<T>>, id: BranchId) {
    if let Some(inner) = inner.upgrade() {
        inner.remove(id);
    }
}

async fn disperse<T: Clone + Send + 'static>(inner: Arc<Inner<T>>) {
    loop {
        let value = match inner.upstream.pull(None).await {
            Ok(Some(Pulled { value, .. })) => value,
            Ok(None) => {
                debug!("upstream exhausted, completing branches");
                inner.terminate(Terminal::Completed(None));
                return;
            }
            Err(error) if error.is_disposed() => {
                inner.terminate(Terminal::Disposed);
                return;
            }
            Err(error) => {
                debug!(%error, "upstream failed, failing branches");
                inner.terminate(Terminal::Completed(Some(error)));
                return;
            }
        };

        let branches = inner.snapshot();
        let deliveries = branches.iter().map(|(id, tx)| {
            let value = value.clone();
            async move { (*id, tx.send(value).await) }
        });
        for (id, delivered) in join_all(deliveries).await {
            if let Err(error) = delivered {
                trace!(branch = id.0, %error, "branch stopped accepting items");
                inner.remove(id);
            }
        }
    }
}
