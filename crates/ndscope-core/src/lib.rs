// ndscope Core Library
//
// Hierarchical lifetime management for native-backed n-dimensional arrays.
// Managers form a tree rooted in a `ManagerRegistry`; closing a manager
// releases everything allocated in it and beneath it, exactly once.

// Re-export the error crate
pub use ndscope_error as error;

// Element types, devices and shapes
pub mod types;

// Native engine boundary and the in-process host engine
pub mod engine;

// Releasable resources and release-once bookkeeping
pub mod resource;

// Native-backed arrays
pub mod array;

// Manager tree, allocation surface and scoped sub-managers
pub mod manager;

// Root manager tracking and shutdown
pub mod registry;

// Settings shared by a manager tree
pub mod config;

// Diagnostic tree dumps
pub mod snapshot;

// Tracing subscriber setup
pub mod telemetry;

pub use array::{ArrayId, NDArray, NDList};
pub use config::{DuplicateKeyPolicy, ManagerConfig};
pub use engine::{Fill, HostEngine, NativeEngine, NativeHandle, ParamBag, ParamValue};
pub use error::{ManagerError, ManagerResult};
pub use manager::{
    ArangeSpec, ArrayDescriptor, CsrSpec, EyeSpec, LinspaceSpec, ManagerId, ManagerState,
    NDManager, RowSparseSpec, ScopedManager,
};
pub use registry::ManagerRegistry;
pub use resource::{ReleaseGuard, ReleaseHook, Resource};
pub use snapshot::{ManagerSnapshot, RegistrySnapshot};
pub use types::{DataType, Device, Element, Shape};
