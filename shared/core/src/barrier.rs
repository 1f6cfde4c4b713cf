use std::fmt::Debug;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("barrier cancelled")]
pub struct CancelledBarrier;

/// A reusable synchronization fence shared by all participants of one run.
///
/// `wait` blocks until every participant has arrived or the barrier is
/// cancelled, in which case every current and future waiter gets
/// [`CancelledBarrier`] until `reset`.
pub trait Barrier: Send + Sync + Debug {
    fn wait(&self) -> Result<(), CancelledBarrier>;
    fn cancel(&self);
    fn reset(&self);
    fn is_cancelled(&self) -> bool;
}

/// Fence for single-participant runs.
#[derive(Debug, Default)]
pub struct NopBarrier;

impl Barrier for NopBarrier {
    fn wait(&self) -> Result<(), CancelledBarrier> {
        Ok(())
    }

    fn cancel(&self) {}

    fn reset(&self) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}
