// Native-backed resources
//
// Anything a manager can own implements `Resource`. Release is idempotent:
// the first call performs the native free, later calls are no-ops.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use ndscope_error::{EngineError, ManagerResult};
use parking_lot::Mutex;

/// An object backed by memory outside Rust's ownership, requiring explicit release
pub trait Resource: Send + Sync + fmt::Debug {
    /// Release the native memory. Calling this more than once is a no-op.
    fn release(&self) -> ManagerResult<()>;

    /// Whether `release` has already run
    fn is_released(&self) -> bool;
}

/// One-shot `Live -> Released` transition shared by resource implementations
#[derive(Debug, Default)]
pub struct ReleaseGuard {
    released: AtomicBool,
}

impl ReleaseGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for exactly one caller, the one that must free the memory
    pub fn begin_release(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

type ReleaseFn = Box<dyn FnOnce() -> Result<(), EngineError> + Send>;

/// A resource whose release runs a caller-supplied closure.
///
/// Used to put foreign allocations that are not arrays (staging buffers,
/// engine-side caches) under a manager's lifetime.
pub struct ReleaseHook {
    label: String,
    hook: Mutex<Option<ReleaseFn>>,
}

impl ReleaseHook {
    pub fn new<F>(label: impl Into<String>, hook: F) -> Self
    where
        F: FnOnce() -> Result<(), EngineError> + Send + 'static,
    {
        ReleaseHook {
            label: label.into(),
            hook: Mutex::new(Some(Box::new(hook))),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for ReleaseHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseHook")
            .field("label", &self.label)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Resource for ReleaseHook {
    fn release(&self) -> ManagerResult<()> {
        // Take the closure out before running it so a re-entrant release
        // from inside the hook sees `None`.
        let hook = self.hook.lock().take();
        match hook {
            Some(hook) => hook().map_err(Into::into),
            None => Ok(()),
        }
    }

    fn is_released(&self) -> bool {
        self.hook.lock().is_none()
    }
}
