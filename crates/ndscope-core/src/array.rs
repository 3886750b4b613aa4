// Native-backed n-dimensional arrays

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use ndscope_error::{ManagerError, ManagerResult};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::engine::{NativeArray, NativeEngine, NativeHandle};
use crate::resource::{ReleaseGuard, Resource};
use crate::types::{decode_elements, DataType, Device, Element, Shape};

/// Process-unique array identity, also the key it is attached under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrayId(Uuid);

impl ArrayId {
    pub(crate) fn new() -> Self {
        ArrayId(Uuid::new_v4())
    }
}

impl fmt::Display for ArrayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct ArrayInner {
    uid: ArrayId,
    handle: NativeHandle,
    shape: Shape,
    data_type: DataType,
    device: Device,
    engine: Arc<dyn NativeEngine>,
    guard: ReleaseGuard,
}

/// Handle to an array living in engine memory.
///
/// Clones share the same native memory. Dropping a handle never frees it;
/// the owning manager does, or `close` for a detached array.
#[derive(Clone)]
pub struct NDArray {
    inner: Arc<ArrayInner>,
}

impl NDArray {
    pub(crate) fn from_native(native: NativeArray, engine: Arc<dyn NativeEngine>) -> Self {
        NDArray {
            inner: Arc::new(ArrayInner {
                uid: ArrayId::new(),
                handle: native.handle,
                shape: native.shape,
                data_type: native.data_type,
                device: native.device,
                engine,
                guard: ReleaseGuard::new(),
            }),
        }
    }

    pub fn uid(&self) -> ArrayId {
        self.inner.uid
    }

    pub fn handle(&self) -> NativeHandle {
        self.inner.handle
    }

    pub fn shape(&self) -> &Shape {
        &self.inner.shape
    }

    pub fn data_type(&self) -> DataType {
        self.inner.data_type
    }

    pub fn device(&self) -> Device {
        self.inner.device
    }

    pub fn size(&self) -> usize {
        self.inner.shape.size()
    }

    /// Release the native memory now. Meant for arrays detached from their
    /// manager; safe to call on attached arrays since release is idempotent.
    pub fn close(&self) -> ManagerResult<()> {
        self.release()
    }

    /// Copy the contents to the host as little-endian bytes
    pub fn to_bytes(&self) -> ManagerResult<Vec<u8>> {
        self.ensure_live()?;
        Ok(self.inner.engine.read(self.inner.handle)?)
    }

    /// Copy the contents to the host as `T`, which must match the data type
    pub fn to_vec<T: Element>(&self) -> ManagerResult<Vec<T>> {
        if T::DATA_TYPE != self.inner.data_type {
            return Err(ManagerError::DataTypeMismatch {
                expected: self.inner.data_type.to_string(),
                found: T::DATA_TYPE.to_string(),
            });
        }
        Ok(decode_elements(&self.to_bytes()?))
    }

    pub(crate) fn ensure_live(&self) -> ManagerResult<()> {
        if self.inner.guard.is_released() {
            Err(ManagerError::Released(self.inner.uid.to_string()))
        } else {
            Ok(())
        }
    }
}

impl Resource for NDArray {
    fn release(&self) -> ManagerResult<()> {
        if !self.inner.guard.begin_release() {
            return Ok(());
        }
        debug!(array = %self.inner.uid, handle = %self.inner.handle, "releasing array");
        self.inner
            .engine
            .release(self.inner.handle)
            .map_err(ManagerError::from)
    }

    fn is_released(&self) -> bool {
        self.inner.guard.is_released()
    }
}

impl PartialEq for NDArray {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for NDArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NDArray")
            .field("uid", &self.inner.uid)
            .field("handle", &self.inner.handle)
            .field("shape", &self.inner.shape)
            .field("data_type", &self.inner.data_type)
            .field("device", &self.inner.device)
            .field("released", &self.inner.guard.is_released())
            .finish()
    }
}

impl fmt::Display for NDArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ND: {} {} {}",
            self.inner.shape, self.inner.device, self.inner.data_type
        )
    }
}

/// An ordered list of arrays, as produced by `invoke`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NDList(Vec<NDArray>);

impl NDList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, array: NDArray) {
        self.0.push(array);
    }

    pub fn head(&self) -> Option<&NDArray> {
        self.0.first()
    }

    pub fn into_vec(self) -> Vec<NDArray> {
        self.0
    }
}

impl Deref for NDList {
    type Target = [NDArray];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<NDArray>> for NDList {
    fn from(arrays: Vec<NDArray>) -> Self {
        NDList(arrays)
    }
}

impl FromIterator<NDArray> for NDList {
    fn from_iter<I: IntoIterator<Item = NDArray>>(iter: I) -> Self {
        NDList(iter.into_iter().collect())
    }
}

impl IntoIterator for NDList {
    type Item = NDArray;
    type IntoIter = std::vec::IntoIter<NDArray>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
