mod barrier;

pub use barrier::{Barrier, CancelledBarrier, NopBarrier};
