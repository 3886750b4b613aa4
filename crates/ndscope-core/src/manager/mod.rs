// Manager tree
//
// An `NDManager` is a scope that owns native resources and child managers.
// Closing it closes every child first, then releases its own resources,
// exactly once, no matter how often or from how many threads close is called.
//
// Close protocol: Open -> Closing (snapshot + clear) -> close children ->
// release resources -> Closed -> unlink from parent or registry.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use ndscope_error::{ManagerError, ManagerResult, ReleaseFailures};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::{DuplicateKeyPolicy, ManagerConfig};
use crate::engine::NativeEngine;
use crate::registry::RegistryInner;
use crate::resource::Resource;
use crate::types::Device;

mod creation;
mod invoke;
mod scope;

pub use creation::{ArangeSpec, ArrayDescriptor, CsrSpec, EyeSpec, LinspaceSpec, RowSparseSpec};
pub use scope::ScopedManager;

/// Identity of a manager node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManagerId(Uuid);

impl ManagerId {
    fn new() -> Self {
        ManagerId(Uuid::new_v4())
    }
}

impl fmt::Display for ManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Observable lifecycle state of a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerState {
    /// Accepting attachments, allocations and sub-managers
    Open,
    /// A close cascade is running
    Closing,
    /// Terminal; everything it owned has been released
    Closed,
}

#[derive(Debug, Clone, Copy)]
enum Lifecycle {
    Open,
    /// The cascade is running on this thread
    Closing(ThreadId),
    Closed,
}

impl Lifecycle {
    fn state(&self) -> ManagerState {
        match self {
            Lifecycle::Open => ManagerState::Open,
            Lifecycle::Closing(_) => ManagerState::Closing,
            Lifecycle::Closed => ManagerState::Closed,
        }
    }
}

/// Mutable state of a node, guarded by the node's own lock
struct Scope {
    lifecycle: Lifecycle,
    resources: HashMap<String, Arc<dyn Resource>>,
    children: HashMap<ManagerId, NDManager>,
}

/// Who tracks this node. Never an owning reference.
enum Owner {
    Registry(Weak<RegistryInner>),
    Parent(Weak<ManagerInner>),
}

pub(crate) struct ManagerInner {
    id: ManagerId,
    device: Device,
    owner: Owner,
    engine: Arc<dyn NativeEngine>,
    config: Arc<ManagerConfig>,
    scope: Mutex<Scope>,
    closed: Condvar,
}

/// A node in the ownership tree.
///
/// `NDManager` is a cheap handle; clones refer to the same node. A node owns
/// its children and attached resources and only references its parent.
#[derive(Clone)]
pub struct NDManager {
    inner: Arc<ManagerInner>,
}

impl NDManager {
    pub(crate) fn new_root(
        registry: Weak<RegistryInner>,
        device: Device,
        engine: Arc<dyn NativeEngine>,
        config: Arc<ManagerConfig>,
    ) -> Self {
        Self::with_owner(Owner::Registry(registry), device, engine, config)
    }

    fn with_owner(
        owner: Owner,
        device: Device,
        engine: Arc<dyn NativeEngine>,
        config: Arc<ManagerConfig>,
    ) -> Self {
        NDManager {
            inner: Arc::new(ManagerInner {
                id: ManagerId::new(),
                device,
                owner,
                engine,
                config,
                scope: Mutex::new(Scope {
                    lifecycle: Lifecycle::Open,
                    resources: HashMap::new(),
                    children: HashMap::new(),
                }),
                closed: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> ManagerId {
        self.inner.id
    }

    /// Default device for arrays allocated by this manager
    pub fn device(&self) -> Device {
        self.inner.device
    }

    pub fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.inner.engine
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// The parent manager; `None` for a root, or once the parent is gone
    pub fn parent(&self) -> Option<NDManager> {
        match &self.inner.owner {
            Owner::Parent(parent) => parent.upgrade().map(|inner| NDManager { inner }),
            Owner::Registry(_) => None,
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self.inner.owner, Owner::Registry(_))
    }

    pub fn state(&self) -> ManagerState {
        self.lock().lifecycle.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ManagerState::Open
    }

    /// Number of directly attached resources
    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    /// Number of open child managers
    pub fn child_count(&self) -> usize {
        self.lock().children.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().resources.contains_key(key)
    }

    /// Keys of the directly attached resources, sorted
    pub fn resource_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().resources.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// The current children, sorted by id
    pub fn children(&self) -> Vec<NDManager> {
        let mut children: Vec<NDManager> = self.lock().children.values().cloned().collect();
        children.sort_by_key(|child| child.id());
        children
    }

    /// Create a child manager on this manager's device
    pub fn new_sub_manager(&self) -> ManagerResult<NDManager> {
        self.new_sub_manager_on(self.inner.device)
    }

    /// Create a child manager with its own default device
    pub fn new_sub_manager_on(&self, device: Device) -> ManagerResult<NDManager> {
        let mut scope = self.lock();
        self.ensure_open(&scope)?;

        let child = Self::with_owner(
            Owner::Parent(Arc::downgrade(&self.inner)),
            device,
            self.inner.engine.clone(),
            self.inner.config.clone(),
        );
        scope.children.insert(child.id(), child.clone());
        debug!(parent = %self.inner.id, child = %child.id(), device = %device, "sub-manager created");
        Ok(child)
    }

    /// Track `resource` under `key` so it is released when this manager closes.
    ///
    /// On a key collision the new resource replaces the old one, which is
    /// returned to the caller and is *not* released. Under
    /// `DuplicateKeyPolicy::Reject` the collision is an error instead.
    ///
    /// A manager can be attached as a resource. Detach it from its parent with
    /// [`NDManager::detach_sub_manager`] first; otherwise both owners will try
    /// to close it and the second close is a no-op.
    pub fn attach(
        &self,
        key: impl Into<String>,
        resource: Arc<dyn Resource>,
    ) -> ManagerResult<Option<Arc<dyn Resource>>> {
        let key = key.into();
        let mut scope = self.lock();
        self.ensure_open(&scope)?;

        if scope.resources.contains_key(&key) {
            match self.inner.config.duplicate_keys {
                DuplicateKeyPolicy::Reject => {
                    return Err(ManagerError::DuplicateKey {
                        key,
                        manager: self.inner.id.to_string(),
                    });
                }
                DuplicateKeyPolicy::Warn => {
                    warn!(
                        manager = %self.inner.id,
                        key = %key,
                        "attach replaced an existing resource; the previous one is no longer tracked"
                    );
                }
            }
        }

        let previous = scope.resources.insert(key, resource);
        Ok(previous)
    }

    /// Stop tracking the resource under `key` without releasing it.
    ///
    /// The caller becomes responsible for releasing it. Returns `None` when
    /// the key is absent or the manager is no longer open.
    pub fn detach(&self, key: &str) -> Option<Arc<dyn Resource>> {
        let mut scope = self.lock();
        if !matches!(scope.lifecycle, Lifecycle::Open) {
            return None;
        }
        let detached = scope.resources.remove(key);
        if detached.is_some() {
            debug!(manager = %self.inner.id, key = %key, "resource detached");
        }
        detached
    }

    /// Stop tracking a child manager without closing it
    pub fn detach_sub_manager(&self, id: ManagerId) -> Option<NDManager> {
        let mut scope = self.lock();
        if !matches!(scope.lifecycle, Lifecycle::Open) {
            return None;
        }
        scope.children.remove(&id)
    }

    /// Close this manager and everything beneath it.
    ///
    /// Children are closed before this manager's own resources are released.
    /// Every resource is attempted even if some fail or panic; the failures
    /// are returned together once the cascade is complete. Closing an already
    /// closed manager is a no-op. A concurrent close blocks until the running
    /// cascade has finished.
    pub fn close(&self) -> ManagerResult<()> {
        let (children, resources) = {
            let mut scope = self.lock();
            loop {
                let lifecycle = scope.lifecycle;
                match lifecycle {
                    Lifecycle::Open => break,
                    Lifecycle::Closed => return Ok(()),
                    // Re-entered from a release running on this thread
                    Lifecycle::Closing(owner) if owner == thread::current().id() => return Ok(()),
                    Lifecycle::Closing(_) => self.inner.closed.wait(&mut scope),
                }
            }
            scope.lifecycle = Lifecycle::Closing(thread::current().id());
            (
                mem::take(&mut scope.children),
                mem::take(&mut scope.resources),
            )
        };

        // Publishes Closed even if the cascade below unwinds
        let finish = FinishClose { manager: self };

        debug!(
            manager = %self.inner.id,
            children = children.len(),
            resources = resources.len(),
            "closing manager"
        );

        let mut failures = ReleaseFailures::new();
        for (id, child) in children {
            if let Err(err) = guarded(|| child.close()) {
                failures.record(id.to_string(), err);
            }
        }
        for (key, resource) in resources {
            match guarded(|| resource.release()) {
                Ok(()) if self.inner.config.log_releases => {
                    debug!(manager = %self.inner.id, key = %key, "resource released");
                }
                Ok(()) => {}
                Err(err) => {
                    warn!(manager = %self.inner.id, key = %key, error = %err, "resource failed to release");
                    failures.record(key, err);
                }
            }
        }

        drop(finish);

        if !failures.is_empty() {
            error!(
                manager = %self.inner.id,
                failed = failures.len(),
                "manager closed with release failures"
            );
        }
        failures.into_result()
    }

    fn finish_close(&self) {
        self.lock().lifecycle = Lifecycle::Closed;
        self.inner.closed.notify_all();
        self.unlink();
    }

    fn unlink(&self) {
        match &self.inner.owner {
            Owner::Parent(parent) => {
                if let Some(parent) = parent.upgrade() {
                    let mut scope = parent.scope.lock();
                    if matches!(scope.lifecycle, Lifecycle::Open) {
                        scope.children.remove(&self.inner.id);
                    }
                }
            }
            Owner::Registry(registry) => {
                if let Some(registry) = registry.upgrade() {
                    registry.unregister(self.inner.id);
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Scope> {
        self.inner.scope.lock()
    }

    fn ensure_open(&self, scope: &Scope) -> ManagerResult<()> {
        match scope.lifecycle {
            Lifecycle::Open => Ok(()),
            _ => Err(ManagerError::closed(self.inner.id)),
        }
    }
}

/// A manager attached to another manager is closed by that manager's cascade
impl Resource for NDManager {
    fn release(&self) -> ManagerResult<()> {
        self.close()
    }

    fn is_released(&self) -> bool {
        self.state() == ManagerState::Closed
    }
}

impl PartialEq for NDManager {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for NDManager {}

impl fmt::Debug for NDManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NDManager")
            .field("id", &self.inner.id)
            .field("device", &self.inner.device)
            .field("engine", &self.inner.engine.name())
            .field("root", &self.is_root())
            .finish()
    }
}

/// Ends a cascade on every exit path, unwinding included
struct FinishClose<'a> {
    manager: &'a NDManager,
}

impl Drop for FinishClose<'_> {
    fn drop(&mut self) {
        self.manager.finish_close();
    }
}

/// Run one release step, turning a panic into a recorded failure
fn guarded(step: impl FnOnce() -> ManagerResult<()>) -> ManagerResult<()> {
    panic::catch_unwind(AssertUnwindSafe(step))
        .unwrap_or_else(|payload| Err(ManagerError::release_panicked(payload.as_ref())))
}
