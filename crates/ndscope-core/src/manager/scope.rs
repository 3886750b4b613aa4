// Scoped sub-managers
//
// Short-lived intermediates are allocated in a sub-manager that is closed on
// every exit path, releasing them before the enclosing manager closes.

use std::ops::Deref;

use ndscope_error::{ManagerError, ManagerResult};
use tracing::warn;

use super::NDManager;
use crate::types::Device;

/// A sub-manager that is closed when the guard goes out of scope.
///
/// Dropping the guard closes the manager and logs any release failures;
/// call [`ScopedManager::close`] to observe them instead.
#[derive(Debug)]
pub struct ScopedManager {
    manager: Option<NDManager>,
}

impl ScopedManager {
    fn new(manager: NDManager) -> Self {
        ScopedManager {
            manager: Some(manager),
        }
    }

    /// Close now and report release failures
    pub fn close(mut self) -> ManagerResult<()> {
        match self.manager.take() {
            Some(manager) => manager.close(),
            None => Ok(()),
        }
    }

    /// Give up the guard without closing; the manager stays tracked by its parent
    pub fn into_inner(mut self) -> NDManager {
        // `manager` is only taken by `close`, `into_inner` and `drop`, all of
        // which consume the guard
        self.manager
            .take()
            .unwrap_or_else(|| unreachable!("scoped manager already taken"))
    }
}

impl Deref for ScopedManager {
    type Target = NDManager;

    fn deref(&self) -> &NDManager {
        self.manager
            .as_ref()
            .unwrap_or_else(|| unreachable!("scoped manager already taken"))
    }
}

impl Drop for ScopedManager {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.take() {
            if let Err(err) = manager.close() {
                warn!(manager = %manager.id(), error = %err, "scoped manager closed with errors");
            }
        }
    }
}

impl NDManager {
    /// Sub-manager closed when the returned guard is dropped
    pub fn scoped(&self) -> ManagerResult<ScopedManager> {
        self.new_sub_manager().map(ScopedManager::new)
    }

    pub fn scoped_on(&self, device: Device) -> ManagerResult<ScopedManager> {
        self.new_sub_manager_on(device).map(ScopedManager::new)
    }

    /// Run `f` with a fresh sub-manager and close it afterwards, whether `f`
    /// returns `Ok`, returns `Err` or panics.
    ///
    /// An error from `f` takes precedence over a close failure, which is then
    /// only logged.
    pub fn with_scope<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&NDManager) -> Result<T, E>,
        E: From<ManagerError>,
    {
        self.with_scope_on(self.inner.device, f)
    }

    pub fn with_scope_on<T, E, F>(&self, device: Device, f: F) -> Result<T, E>
    where
        F: FnOnce(&NDManager) -> Result<T, E>,
        E: From<ManagerError>,
    {
        let guard = self.scoped_on(device)?;
        let manager: &NDManager = &guard;
        match f(manager) {
            Ok(value) => {
                guard.close()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(close_err) = guard.close() {
                    warn!(error = %close_err, "scope closed with errors after a failed body");
                }
                Err(err)
            }
        }
    }
}
