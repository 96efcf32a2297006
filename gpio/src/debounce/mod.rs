//! Deferred work used to debounce noisy inputs: instead of sampling right away, the reaction to
//! an edge is scheduled to run once the contacts had time to settle.
mod timed;

use std::fmt::Debug;
use std::time::Duration;
pub use timed::*;

/// The `DeferredWork` trait schedules a piece of work to run later, in a context that may block.
pub trait DeferredWork: Debug + Send + Sync {
    /// Schedules the work to run after `delay`.
    ///
    /// Returns `false` if the work was already pending; it keeps its original deadline then.
    fn schedule(&self, delay: Duration) -> bool;

    /// Cancels the work if it is pending. A run already in progress is not interrupted.
    fn cancel(&self);
}
