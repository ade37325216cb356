//! Counters reported through the `metrics` facade.
//!
//! Nothing is recorded unless the application installs a recorder.

use ::metrics::counter;

pub(crate) const CHANNEL_PUSHED: &str = "pipeweld.channel.pushed";
pub(crate) const CHANNEL_CONSUMED: &str = "pipeweld.channel.consumed";
pub(crate) const CHANNEL_DISPOSED: &str = "pipeweld.channel.disposed";
pub(crate) const WORKER_FAILED: &str = "pipeweld.worker.failed";

pub(crate) fn channel_pushed() {
    counter!(CHANNEL_PUSHED).increment(1);
}

pub(crate) fn channel_consumed() {
    counter!(CHANNEL_CONSUMED).increment(1);
}

pub(crate) fn channel_disposed() {
    counter!(CHANNEL_DISPOSED).increment(1);
}

pub(crate) fn worker_failed() {
    counter!(WORKER_FAILED).increment(1);
}
