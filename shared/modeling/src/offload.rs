use std::fmt;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, RwLock,
};
use tch::{Device, Tensor};
use tracing::trace;

/// The activation-offload entry point: moves a saved tensor to host memory.
/// The `pin` flag requests page-locked host memory where the backend supports
/// it; the default hook records it and performs a plain host copy.
pub type OffloadFn = Arc<dyn Fn(&Tensor, bool) -> Tensor + Send + Sync>;

/// Swappable home of the offload entry point.
///
/// One instance per rank or test case, handed to offload-capable wrappers at
/// construction. Cloning shares the slot, so a replacement installed through
/// any handle is seen by every wrapper built from the same instance.
#[derive(Clone)]
pub struct OffloadHooks {
    slot: Arc<RwLock<OffloadFn>>,
}

impl fmt::Debug for OffloadHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffloadHooks").finish_non_exhaustive()
    }
}

impl Default for OffloadHooks {
    fn default() -> Self {
        Self {
            slot: Arc::new(RwLock::new(Arc::new(default_offload) as OffloadFn)),
        }
    }
}

fn default_offload(tensor: &Tensor, pin: bool) -> Tensor {
    if pin {
        trace!("offloading with pinned host memory requested");
    }
    tensor.to_device(Device::Cpu)
}

impl OffloadHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swaps in `replacement`; the returned guard restores the previous hook
    /// exactly once when dropped, on both normal and panic exits.
    pub fn install(&self, replacement: OffloadFn) -> HookGuard {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        let original = std::mem::replace(&mut *slot, replacement);
        trace!("offload hook replaced");
        HookGuard {
            slot: self.slot.clone(),
            original: Some(original),
        }
    }

    pub fn current(&self) -> OffloadFn {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn offload(&self, tensor: &Tensor, pin: bool) -> Tensor {
        (self.current())(tensor, pin)
    }
}

/// Restores the hook that was installed before [`OffloadHooks::install`].
#[must_use = "dropping the guard is what restores the original hook"]
pub struct HookGuard {
    slot: Arc<RwLock<OffloadFn>>,
    original: Option<OffloadFn>,
}

impl fmt::Debug for HookGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookGuard").finish_non_exhaustive()
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        if let Some(original) = self.original.take() {
            let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
            *slot = original;
            trace!("offload hook restored");
        }
    }
}

/// Counts offload-hook invocations for one rank's run.
///
/// An explicit handle rather than process-wide state: the driver resets and
/// reads it around each forward pass, and separate ranks or test cases never
/// share one.
#[derive(Debug, Clone, Default)]
pub struct OffloadProbe {
    fired: Arc<AtomicUsize>,
}

impl OffloadProbe {
    /// Wraps whatever hook is currently installed with one that bumps the
    /// counter and then delegates with identical arguments and return value.
    pub fn instrument(hooks: &OffloadHooks) -> (Self, HookGuard) {
        let probe = Self::default();
        let inner = hooks.current();
        let counter = probe.fired.clone();
        let guard = hooks.install(Arc::new(move |tensor, pin| {
            counter.fetch_add(1, Ordering::SeqCst);
            inner(tensor, pin)
        }));
        (probe, guard)
    }

    pub fn count(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn fired(&self) -> bool {
        self.count() > 0
    }

    pub fn reset(&self) {
        self.fired.store(0, Ordering::SeqCst);
    }
}
