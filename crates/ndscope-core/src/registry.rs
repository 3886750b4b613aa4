// Root manager registry
//
// Tracks every open base manager so an embedding application can close
// whatever is still alive at shutdown. Roots unregister themselves when
// they close.

use std::collections::HashMap;
use std::sync::Arc;

use ndscope_error::{ManagerResult, ReleaseFailures};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::ManagerConfig;
use crate::engine::NativeEngine;
use crate::manager::{ManagerId, NDManager};
use crate::snapshot::RegistrySnapshot;
use crate::types::Device;

pub(crate) struct RegistryInner {
    engine: Arc<dyn NativeEngine>,
    config: Arc<ManagerConfig>,
    roots: RwLock<HashMap<ManagerId, NDManager>>,
}

impl RegistryInner {
    fn register(&self, manager: &NDManager) {
        self.roots.write().insert(manager.id(), manager.clone());
    }

    pub(crate) fn unregister(&self, id: ManagerId) {
        if self.roots.write().remove(&id).is_some() {
            debug!(manager = %id, "root manager unregistered");
        }
    }
}

/// Owner of the base managers for one engine.
///
/// Cloning the registry shares it.
#[derive(Clone)]
pub struct ManagerRegistry {
    inner: Arc<RegistryInner>,
}

impl ManagerRegistry {
    pub fn new(engine: Arc<dyn NativeEngine>) -> Self {
        Self::with_config(engine, ManagerConfig::default())
    }

    pub fn with_config(engine: Arc<dyn NativeEngine>, config: ManagerConfig) -> Self {
        ManagerRegistry {
            inner: Arc::new(RegistryInner {
                engine,
                config: Arc::new(config),
                roots: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Create a root manager on the configured default device
    pub fn new_base_manager(&self) -> ManagerResult<NDManager> {
        self.new_base_manager_on(self.inner.config.default_device)
    }

    /// Create a root manager on `device`
    pub fn new_base_manager_on(&self, device: Device) -> ManagerResult<NDManager> {
        let manager = NDManager::new_root(
            Arc::downgrade(&self.inner),
            device,
            self.inner.engine.clone(),
            self.inner.config.clone(),
        );
        self.inner.register(&manager);
        info!(
            manager = %manager.id(),
            device = %device,
            engine = self.inner.engine.name(),
            "root manager registered"
        );
        Ok(manager)
    }

    pub fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.inner.engine
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// The open roots, sorted by id
    pub fn roots(&self) -> Vec<NDManager> {
        let mut roots: Vec<NDManager> = self.inner.roots.read().values().cloned().collect();
        roots.sort_by_key(|root| root.id());
        roots
    }

    pub fn len(&self) -> usize {
        self.inner.roots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.roots.read().is_empty()
    }

    pub fn contains(&self, id: ManagerId) -> bool {
        self.inner.roots.read().contains_key(&id)
    }

    /// Close every open root.
    ///
    /// All roots are closed even if some fail; the failures are returned
    /// together, keyed by the resources that failed.
    pub fn shutdown(&self) -> ManagerResult<()> {
        // Closing a root unregisters it, so never hold the lock across close
        let roots = self.roots();
        info!(roots = roots.len(), "shutting down manager registry");

        let mut failures = ReleaseFailures::new();
        for root in roots {
            if let Err(err) = root.close() {
                failures.record(root.id().to_string(), err);
            }
        }
        failures.into_result()
    }

    /// Point-in-time view of every open tree
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            roots: self.roots().iter().map(NDManager::snapshot).collect(),
        }
    }
}

impl std::fmt::Debug for ManagerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerRegistry")
            .field("engine", &self.inner.engine.name())
            .field("roots", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HostEngine;
    use crate::manager::ManagerState;
    use crate::resource::ReleaseHook;
    use ndscope_error::{EngineError, ManagerError};

    #[test]
    fn test_roots_register_and_unregister() {
        let registry = ManagerRegistry::new(Arc::new(HostEngine::with_seed(1)));
        assert!(registry.is_empty());

        let a = registry.new_base_manager().unwrap();
        let b = registry.new_base_manager_on(Device::Gpu(0)).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(a.id()));
        assert!(a.is_root());

        a.close().unwrap();
        assert!(!registry.contains(a.id()));
        assert_eq!(registry.roots(), vec![b]);
    }

    #[test]
    fn test_default_device_from_config() {
        let config = ManagerConfig::default().with_default_device(Device::Gpu(3));
        let registry = ManagerRegistry::with_config(Arc::new(HostEngine::with_seed(1)), config);
        let root = registry.new_base_manager().unwrap();
        assert_eq!(root.device(), Device::Gpu(3));
        assert_eq!(root.new_sub_manager().unwrap().config().default_device, Device::Gpu(3));
    }

    #[test]
    fn test_shutdown_closes_everything_and_aggregates() {
        let engine = Arc::new(HostEngine::with_seed(1));
        let registry = ManagerRegistry::new(engine.clone());
        let a = registry.new_base_manager().unwrap();
        let b = registry.new_base_manager().unwrap();
        a.new_sub_manager().unwrap().zeros([4]).unwrap();
        b.ones([2]).unwrap();
        b.attach(
            "broken",
            Arc::new(ReleaseHook::new("broken", || {
                Err(EngineError::OperationFailed("device lost".into()))
            })),
        )
        .unwrap();

        let err = registry.shutdown().unwrap_err();
        let failures = err.release_failures().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures.keys(), vec!["broken"]);

        assert_eq!(a.state(), ManagerState::Closed);
        assert_eq!(b.state(), ManagerState::Closed);
        assert!(registry.is_empty());
        assert_eq!(engine.live_handles(), 0);

        // Nothing left to close
        registry.shutdown().unwrap();
    }

    #[test]
    fn test_root_outlives_registry() {
        let root = {
            let registry = ManagerRegistry::new(Arc::new(HostEngine::with_seed(1)));
            registry.new_base_manager().unwrap()
        };
        root.zeros([1]).unwrap();
        root.close().unwrap();
        assert!(matches!(root.zeros([1]), Err(ManagerError::ClosedManager { .. })));
    }
}
