// Allocation surface
//
// Every helper funnels into `NDManager::create`, which attaches the new
// array to the manager before returning it.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::BytesMut;
use ndscope_error::{ManagerError, ManagerResult};
use tracing::{debug, warn};

use super::NDManager;
use crate::array::NDArray;
use crate::engine::{AllocationRequest, Fill, NativeArray};
use crate::resource::Resource;
use crate::types::{encode_elements, DataType, Device, Element, Shape};

/// Description of an array to allocate.
///
/// Data type and device default to the allocating manager's settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayDescriptor {
    shape: Shape,
    data_type: Option<DataType>,
    device: Option<Device>,
    fill: Fill,
}

impl ArrayDescriptor {
    pub fn new(shape: impl Into<Shape>) -> Self {
        ArrayDescriptor {
            shape: shape.into(),
            data_type: None,
            device: None,
            fill: Fill::Uninit,
        }
    }

    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.data_type = Some(data_type);
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    pub fn fill(mut self, fill: Fill) -> Self {
        self.fill = fill;
        self
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    fn resolve(self, device: Device, data_type: DataType) -> AllocationRequest {
        AllocationRequest {
            shape: self.shape,
            data_type: self.data_type.unwrap_or(data_type),
            device: self.device.unwrap_or(device),
            fill: self.fill,
        }
    }
}

/// Evenly spaced values in `[start, stop)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArangeSpec {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
    pub data_type: Option<DataType>,
}

impl ArangeSpec {
    /// `0, 1, ..` up to but excluding `stop`
    pub fn new(stop: f64) -> Self {
        ArangeSpec {
            start: 0.0,
            stop,
            step: 1.0,
            data_type: None,
        }
    }

    pub fn range(start: f64, stop: f64) -> Self {
        ArangeSpec {
            start,
            ..Self::new(stop)
        }
    }

    pub fn step(mut self, step: f64) -> Self {
        self.step = step;
        self
    }

    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.data_type = Some(data_type);
        self
    }

    fn len(&self) -> ManagerResult<usize> {
        if self.step == 0.0 || !self.step.is_finite() {
            return Err(ManagerError::invalid_argument("arange step must be finite and non-zero"));
        }
        let count = ((self.stop - self.start) / self.step).ceil();
        if !count.is_finite() || count >= usize::MAX as f64 {
            return Err(ManagerError::invalid_argument(format!(
                "arange [{}, {}) by {} does not have a representable length",
                self.start, self.stop, self.step
            )));
        }
        Ok(if count > 0.0 { count as usize } else { 0 })
    }
}

/// A 2-D array with ones on diagonal `k`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeSpec {
    pub rows: usize,
    pub cols: Option<usize>,
    pub k: i64,
    pub data_type: Option<DataType>,
}

impl EyeSpec {
    /// Square identity matrix
    pub fn new(rows: usize) -> Self {
        EyeSpec {
            rows,
            cols: None,
            k: 0,
            data_type: None,
        }
    }

    pub fn cols(mut self, cols: usize) -> Self {
        self.cols = Some(cols);
        self
    }

    pub fn k(mut self, k: i64) -> Self {
        self.k = k;
        self
    }

    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.data_type = Some(data_type);
        self
    }
}

/// `num` evenly spaced samples over `[start, stop]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinspaceSpec {
    pub start: f64,
    pub stop: f64,
    pub num: usize,
    pub endpoint: bool,
}

impl LinspaceSpec {
    pub fn new(start: f64, stop: f64, num: usize) -> Self {
        LinspaceSpec {
            start,
            stop,
            num,
            endpoint: true,
        }
    }

    /// Exclude `stop` from the samples
    pub fn exclusive(mut self) -> Self {
        self.endpoint = false;
        self
    }
}

/// Compressed sparse row input for a dense 2-D array
#[derive(Debug, Clone, PartialEq)]
pub struct CsrSpec {
    data: Vec<u8>,
    data_type: DataType,
    nnz: usize,
    indptr: Vec<i64>,
    indices: Vec<i64>,
    shape: Shape,
}

impl CsrSpec {
    pub fn new<T: Element>(data: &[T], indptr: Vec<i64>, indices: Vec<i64>, shape: impl Into<Shape>) -> Self {
        CsrSpec {
            data: encode_elements(data),
            data_type: T::DATA_TYPE,
            nnz: data.len(),
            indptr,
            indices,
            shape: shape.into(),
        }
    }
}

/// Row-sparse input: row `indices[i]` of the result is row `i` of `data`
#[derive(Debug, Clone, PartialEq)]
pub struct RowSparseSpec {
    data: Vec<u8>,
    data_type: DataType,
    data_shape: Shape,
    indices: Vec<i64>,
    shape: Shape,
}

impl RowSparseSpec {
    pub fn new<T: Element>(
        data: &[T],
        data_shape: impl Into<Shape>,
        indices: Vec<i64>,
        shape: impl Into<Shape>,
    ) -> Self {
        RowSparseSpec {
            data: encode_elements(data),
            data_type: T::DATA_TYPE,
            data_shape: data_shape.into(),
            indices,
            shape: shape.into(),
        }
    }
}

impl NDManager {
    /// Allocate an array and attach it to this manager.
    ///
    /// The returned array is already tracked under its uid; it is released
    /// when this manager closes unless it is detached first.
    pub fn create(&self, descriptor: ArrayDescriptor) -> ManagerResult<NDArray> {
        self.ensure_open(&self.lock())?;

        let request = descriptor.resolve(self.inner.device, self.inner.config.default_data_type);
        if request.shape.byte_len(request.data_type).is_none() {
            return Err(ManagerError::invalid_argument(format!(
                "shape {} of {} is too large to allocate",
                request.shape, request.data_type
            )));
        }
        let handle = self.inner.engine.create(&request)?;
        let native = NativeArray {
            handle,
            shape: request.shape,
            data_type: request.data_type,
            device: request.device,
        };
        self.track(NDArray::from_native(native, self.inner.engine.clone()))
    }

    /// Attach a freshly produced array, or release it if this manager closed
    /// in the meantime.
    pub(super) fn track(&self, array: NDArray) -> ManagerResult<NDArray> {
        let mut scope = self.lock();
        if let Err(err) = self.ensure_open(&scope) {
            drop(scope);
            if let Err(release_err) = array.release() {
                warn!(array = %array.uid(), error = %release_err, "failed to release array allocated during close");
            }
            return Err(err);
        }
        scope
            .resources
            .insert(array.uid().to_string(), Arc::new(array.clone()));
        debug!(manager = %self.inner.id, array = %array.uid(), shape = %array.shape(), "array attached");
        Ok(array)
    }

    /// Attach an existing array under its uid
    pub fn attach_array(&self, array: &NDArray) -> ManagerResult<()> {
        self.attach(array.uid().to_string(), Arc::new(array.clone()))
            .map(|_| ())
    }

    /// Detach an array previously attached under its uid
    pub fn detach_array(&self, array: &NDArray) -> bool {
        self.detach(&array.uid().to_string()).is_some()
    }

    /// Array with unspecified contents
    pub fn create_uninit(&self, shape: impl Into<Shape>, data_type: DataType) -> ManagerResult<NDArray> {
        self.create(ArrayDescriptor::new(shape).data_type(data_type))
    }

    /// Array holding a copy of `data`
    pub fn from_slice<T: Element>(&self, data: &[T], shape: impl Into<Shape>) -> ManagerResult<NDArray> {
        let shape = shape.into();
        if shape.checked_size() != Some(data.len()) {
            return Err(ManagerError::invalid_argument(format!(
                "{} elements cannot fill shape {}",
                data.len(),
                shape
            )));
        }
        self.create(
            ArrayDescriptor::new(shape)
                .data_type(T::DATA_TYPE)
                .fill(Fill::Data(encode_elements(data))),
        )
    }

    /// 1-D array holding a copy of `data`
    pub fn vector<T: Element>(&self, data: &[T]) -> ManagerResult<NDArray> {
        self.from_slice(data, [data.len()])
    }

    /// Rank-0 array
    pub fn scalar<T: Element>(&self, value: T) -> ManagerResult<NDArray> {
        self.from_slice(&[value], Shape::scalar())
    }

    pub fn zeros(&self, shape: impl Into<Shape>) -> ManagerResult<NDArray> {
        self.create(ArrayDescriptor::new(shape).fill(Fill::Zeros))
    }

    pub fn zeros_as(&self, shape: impl Into<Shape>, data_type: DataType) -> ManagerResult<NDArray> {
        self.create(ArrayDescriptor::new(shape).data_type(data_type).fill(Fill::Zeros))
    }

    pub fn ones(&self, shape: impl Into<Shape>) -> ManagerResult<NDArray> {
        self.create(ArrayDescriptor::new(shape).fill(Fill::Ones))
    }

    pub fn ones_as(&self, shape: impl Into<Shape>, data_type: DataType) -> ManagerResult<NDArray> {
        self.create(ArrayDescriptor::new(shape).data_type(data_type).fill(Fill::Ones))
    }

    /// Array with every element set to `value`
    pub fn full(&self, shape: impl Into<Shape>, value: f64) -> ManagerResult<NDArray> {
        self.create(ArrayDescriptor::new(shape).fill(Fill::Value(value)))
    }

    pub fn arange(&self, spec: ArangeSpec) -> ManagerResult<NDArray> {
        let mut descriptor = ArrayDescriptor::new([spec.len()?]).fill(Fill::Arange {
            start: spec.start,
            step: spec.step,
        });
        if let Some(data_type) = spec.data_type {
            descriptor = descriptor.data_type(data_type);
        }
        self.create(descriptor)
    }

    pub fn eye(&self, spec: EyeSpec) -> ManagerResult<NDArray> {
        let cols = spec.cols.unwrap_or(spec.rows);
        let mut descriptor = ArrayDescriptor::new([spec.rows, cols]).fill(Fill::Eye { k: spec.k });
        if let Some(data_type) = spec.data_type {
            descriptor = descriptor.data_type(data_type);
        }
        self.create(descriptor)
    }

    pub fn linspace(&self, spec: LinspaceSpec) -> ManagerResult<NDArray> {
        self.create(ArrayDescriptor::new([spec.num]).fill(Fill::Linspace {
            start: spec.start,
            stop: spec.stop,
            endpoint: spec.endpoint,
        }))
    }

    /// Samples drawn uniformly from `[low, high)`
    pub fn random_uniform(&self, low: f64, high: f64, shape: impl Into<Shape>) -> ManagerResult<NDArray> {
        if low.partial_cmp(&high) != Some(Ordering::Less) {
            return Err(ManagerError::invalid_argument(format!(
                "random_uniform needs low < high, got [{}, {})",
                low, high
            )));
        }
        self.create(ArrayDescriptor::new(shape).fill(Fill::RandomUniform { low, high }))
    }

    /// Samples drawn from a normal distribution
    pub fn random_normal(&self, loc: f64, scale: f64, shape: impl Into<Shape>) -> ManagerResult<NDArray> {
        if scale < 0.0 {
            return Err(ManagerError::invalid_argument("random_normal scale must be >= 0"));
        }
        self.create(ArrayDescriptor::new(shape).fill(Fill::RandomNormal { loc, scale }))
    }

    /// Counts of `trials` draws over `probabilities.len()` categories, as Int64.
    ///
    /// The last probability is implied: it takes whatever the others leave,
    /// so only the leading ones need to sum to at most 1.
    pub fn random_multinomial(&self, trials: u64, probabilities: &[f64]) -> ManagerResult<NDArray> {
        self.random_multinomial_shaped(trials, probabilities, Shape::scalar())
    }

    /// One independent set of counts per element of `batch`; the result has
    /// shape `batch + [categories]`
    pub fn random_multinomial_shaped(
        &self,
        trials: u64,
        probabilities: &[f64],
        batch: impl Into<Shape>,
    ) -> ManagerResult<NDArray> {
        let Some((_, leading)) = probabilities.split_last() else {
            return Err(ManagerError::invalid_argument("random_multinomial needs at least one category"));
        };
        if let Some(p) = probabilities.iter().find(|p| !(0.0..=1.0).contains(*p)) {
            return Err(ManagerError::invalid_argument(format!(
                "probability {} is outside [0, 1]",
                p
            )));
        }
        let total: f64 = leading.iter().sum();
        if total > 1.0 + 1e-6 {
            return Err(ManagerError::invalid_argument(format!(
                "probabilities sum to {} before the last category",
                total
            )));
        }

        let mut dims = batch.into().dims().to_vec();
        dims.push(probabilities.len());
        self.create(
            ArrayDescriptor::new(dims)
                .data_type(DataType::Int64)
                .fill(Fill::RandomMultinomial {
                    trials,
                    probabilities: probabilities.to_vec(),
                }),
        )
    }

    /// Dense array built from compressed sparse row input
    pub fn create_csr(&self, spec: CsrSpec) -> ManagerResult<NDArray> {
        if spec.shape.rank() != 2 {
            return Err(ManagerError::invalid_argument(format!(
                "csr arrays are 2-D, got shape {}",
                spec.shape
            )));
        }
        if spec.indices.len() != spec.nnz {
            return Err(ManagerError::invalid_argument(format!(
                "{} values but {} column indices",
                spec.nnz,
                spec.indices.len()
            )));
        }
        self.create(
            ArrayDescriptor::new(spec.shape)
                .data_type(spec.data_type)
                .fill(Fill::Csr {
                    data: spec.data,
                    indptr: spec.indptr,
                    indices: spec.indices,
                }),
        )
    }

    /// Dense array built from row-sparse input
    pub fn create_row_sparse(&self, spec: RowSparseSpec) -> ManagerResult<NDArray> {
        let data_dims = spec.data_shape.dims();
        let dims = spec.shape.dims();
        if data_dims.is_empty() || dims.is_empty() || data_dims[1..] != dims[1..] {
            return Err(ManagerError::invalid_argument(format!(
                "row data of shape {} does not fit rows of {}",
                spec.data_shape, spec.shape
            )));
        }
        if data_dims[0] != spec.indices.len() {
            return Err(ManagerError::invalid_argument(format!(
                "{} data rows but {} row indices",
                data_dims[0],
                spec.indices.len()
            )));
        }
        self.create(
            ArrayDescriptor::new(spec.shape)
                .data_type(spec.data_type)
                .fill(Fill::RowSparse {
                    data: spec.data,
                    indices: spec.indices,
                }),
        )
    }

    /// Zeroed host staging buffer; not native memory and not tracked
    pub fn allocate_direct(&self, capacity: usize) -> BytesMut {
        BytesMut::zeroed(capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HostEngine;
    use crate::registry::ManagerRegistry;

    fn manager() -> (Arc<HostEngine>, NDManager) {
        let engine = Arc::new(HostEngine::with_seed(3));
        let registry = ManagerRegistry::new(engine.clone());
        let manager = registry.new_base_manager().unwrap();
        (engine, manager)
    }

    #[test]
    fn test_created_arrays_are_attached() {
        let (engine, manager) = manager();
        let a = manager.zeros([2, 3]).unwrap();
        let b = manager.vector(&[1i64, 2, 3]).unwrap();

        assert!(manager.contains(&a.uid().to_string()));
        assert!(manager.contains(&b.uid().to_string()));
        assert_eq!(a.data_type(), DataType::Float32);
        assert_eq!(b.data_type(), DataType::Int64);
        assert_eq!(engine.live_handles(), 2);

        manager.close().unwrap();
        assert!(a.is_released() && b.is_released());
        assert_eq!(engine.live_handles(), 0);
    }

    #[test]
    fn test_helpers_fill_contents() {
        let (_engine, manager) = manager();

        assert_eq!(manager.ones([3]).unwrap().to_vec::<f32>().unwrap(), vec![1.0; 3]);
        assert_eq!(manager.full([2], 2.5).unwrap().to_vec::<f32>().unwrap(), vec![2.5; 2]);
        assert_eq!(manager.scalar(9i32).unwrap().shape(), &Shape::scalar());

        let range = manager
            .arange(ArangeSpec::range(1.0, 4.0).data_type(DataType::Int32))
            .unwrap();
        assert_eq!(range.to_vec::<i32>().unwrap(), vec![1, 2, 3]);

        let stepped = manager.arange(ArangeSpec::new(1.0).step(0.25)).unwrap();
        assert_eq!(stepped.to_vec::<f32>().unwrap(), vec![0.0, 0.25, 0.5, 0.75]);

        let eye = manager.eye(EyeSpec::new(2)).unwrap();
        assert_eq!(eye.to_vec::<f32>().unwrap(), vec![1.0, 0.0, 0.0, 1.0]);

        let lin = manager.linspace(LinspaceSpec::new(0.0, 10.0, 3)).unwrap();
        assert_eq!(lin.to_vec::<f32>().unwrap(), vec![0.0, 5.0, 10.0]);
    }

    #[test]
    fn test_device_and_type_defaults() {
        let engine = Arc::new(HostEngine::with_seed(3));
        let config = crate::config::ManagerConfig::default().with_default_data_type(DataType::Float64);
        let registry = ManagerRegistry::with_config(engine, config);
        let manager = registry.new_base_manager_on(Device::Gpu(2)).unwrap();

        let a = manager.zeros([1]).unwrap();
        assert_eq!(a.device(), Device::Gpu(2));
        assert_eq!(a.data_type(), DataType::Float64);

        let b = manager
            .create(ArrayDescriptor::new([1]).device(Device::Cpu).data_type(DataType::Uint8))
            .unwrap();
        assert_eq!(b.device(), Device::Cpu);
        assert_eq!(b.data_type(), DataType::Uint8);
    }

    #[test]
    fn test_argument_checks_happen_before_allocation() {
        let (engine, manager) = manager();

        assert!(manager.from_slice(&[1.0f32, 2.0], [3]).is_err());
        assert!(manager.arange(ArangeSpec::new(3.0).step(0.0)).is_err());
        assert!(manager.random_uniform(1.0, 1.0, [2]).is_err());
        assert!(manager.random_normal(0.0, -1.0, [2]).is_err());
        assert!(manager
            .create_csr(CsrSpec::new(&[1.0f32], vec![0, 1], vec![0, 1], [1, 2]))
            .is_err());
        assert_eq!(engine.allocated_count(), 0);
    }

    #[test]
    fn test_oversized_shapes_are_rejected_up_front() {
        let (engine, manager) = manager();

        let err = manager.zeros([usize::MAX, 2]).unwrap_err();
        assert!(matches!(err, ManagerError::InvalidArgument(_)));
        let err = manager.eye(EyeSpec::new(usize::MAX / 2)).unwrap_err();
        assert!(matches!(err, ManagerError::InvalidArgument(_)));
        let err = manager.arange(ArangeSpec::new(1e300)).unwrap_err();
        assert!(matches!(err, ManagerError::InvalidArgument(_)));
        assert!(manager.arange(ArangeSpec::new(f64::NAN)).is_err());
        assert!(manager.from_slice(&[1.0f32], [usize::MAX, 2]).is_err());
        assert!(manager.random_uniform(f64::NAN, 1.0, [2]).is_err());

        assert_eq!(engine.allocated_count(), 0);
        assert!(manager.is_open());
        assert_eq!(manager.resource_count(), 0);
    }

    #[test]
    fn test_engine_failure_leaves_nothing_attached() {
        let (engine, manager) = manager();
        let err = manager
            .create(ArrayDescriptor::new([2]).fill(Fill::Data(vec![0u8; 3])))
            .unwrap_err();
        assert!(matches!(err, ManagerError::Engine(_)));
        assert_eq!(manager.resource_count(), 0);
        assert_eq!(engine.live_handles(), 0);
    }

    #[test]
    fn test_multinomial_counts() {
        let (_engine, manager) = manager();

        let counts = manager.random_multinomial(20, &[0.2, 0.3, 0.5]).unwrap();
        assert_eq!(counts.shape(), &Shape::from([3]));
        assert_eq!(counts.data_type(), DataType::Int64);
        assert_eq!(counts.to_vec::<i64>().unwrap().iter().sum::<i64>(), 20);

        // The implied last category takes the remainder
        let certain = manager.random_multinomial(7, &[0.0, 0.0]).unwrap();
        assert_eq!(certain.to_vec::<i64>().unwrap(), vec![0, 7]);
        let first = manager.random_multinomial(5, &[1.0, 0.0, 0.0]).unwrap();
        assert_eq!(first.to_vec::<i64>().unwrap(), vec![5, 0, 0]);

        let batched = manager
            .random_multinomial_shaped(10, &[0.5, 0.5], [2, 3])
            .unwrap();
        assert_eq!(batched.shape(), &Shape::from([2, 3, 2]));
        let values = batched.to_vec::<i64>().unwrap();
        assert!(values.chunks(2).all(|pair| pair[0] + pair[1] == 10));
    }

    #[test]
    fn test_multinomial_rejects_bad_probabilities() {
        let (engine, manager) = manager();

        for probabilities in [
            &[][..],
            &[0.5, -0.1][..],
            &[0.7, 0.6, 0.0][..],
            &[f64::NAN, 0.5][..],
            &[0.5, 1.5][..],
        ] {
            let err = manager.random_multinomial(3, probabilities).unwrap_err();
            assert!(matches!(err, ManagerError::InvalidArgument(_)));
        }
        assert_eq!(engine.allocated_count(), 0);
    }

    #[test]
    fn test_sparse_helpers() {
        let (_engine, manager) = manager();

        let csr = manager
            .create_csr(CsrSpec::new(&[5.0f32, 6.0], vec![0, 1, 2], vec![1, 0], [2, 2]))
            .unwrap();
        assert_eq!(csr.to_vec::<f32>().unwrap(), vec![0.0, 5.0, 6.0, 0.0]);

        let rows = manager
            .create_row_sparse(RowSparseSpec::new(&[1i32, 2], [1, 2], vec![1], [3, 2]))
            .unwrap();
        assert_eq!(rows.to_vec::<i32>().unwrap(), vec![0, 0, 1, 2, 0, 0]);
    }

    #[test]
    fn test_allocate_direct_is_untracked() {
        let (_engine, manager) = manager();
        let buffer = manager.allocate_direct(16);
        assert_eq!(buffer.len(), 16);
        assert_eq!(manager.resource_count(), 0);
    }

    #[test]
    fn test_closed_manager_does_not_reach_engine() {
        let (engine, manager) = manager();
        manager.close().unwrap();

        assert!(manager.zeros([4]).unwrap_err().is_closed_manager());
        assert_eq!(engine.allocated_count(), 0);
    }
}
