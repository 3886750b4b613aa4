// Host memory engine
//
// Reference `NativeEngine` that keeps every array in a host-side buffer
// table. It implements all `Fill` variants and a few element-wise operators
// so the lifetime core can run without an accelerator runtime.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};

use ndscope_error::{EngineError, EngineResult};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use super::{AllocationRequest, Fill, NativeArray, NativeEngine, NativeHandle, ParamBag};
use crate::types::{DataType, Device, Shape};

const SUPPORTED_OPERATIONS: &[&str] = &["copy", "reshape", "add", "mul_scalar"];

#[derive(Debug, Clone)]
struct HostBuffer {
    bytes: Vec<u8>,
    shape: Shape,
    data_type: DataType,
    device: Device,
}

impl HostBuffer {
    fn values(&self) -> impl Iterator<Item = f64> + '_ {
        let width = self.data_type.num_bytes();
        self.bytes
            .chunks_exact(width)
            .map(move |chunk| self.data_type.read_scalar(chunk))
    }
}

/// Engine backed by host memory
#[derive(Debug)]
pub struct HostEngine {
    buffers: Mutex<HashMap<NativeHandle, HostBuffer>>,
    next_handle: AtomicU64,
    rng: Mutex<StdRng>,
    allocated: AtomicU64,
    released: AtomicU64,
}

impl HostEngine {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Engine whose random fills are reproducible
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        HostEngine {
            buffers: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            rng: Mutex::new(rng),
            allocated: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// Number of handles currently allocated
    pub fn live_handles(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn contains(&self, handle: NativeHandle) -> bool {
        self.buffers.lock().contains_key(&handle)
    }

    /// Total handles ever allocated
    pub fn allocated_count(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Total handles ever released
    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }

    fn insert(&self, buffer: HostBuffer) -> NativeArray {
        let handle = NativeHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let array = NativeArray {
            handle,
            shape: buffer.shape.clone(),
            data_type: buffer.data_type,
            device: buffer.device,
        };
        self.buffers.lock().insert(handle, buffer);
        self.allocated.fetch_add(1, Ordering::AcqRel);
        trace!(handle = %handle, shape = %array.shape, "host buffer allocated");
        array
    }

    fn fill(&self, request: &AllocationRequest) -> EngineResult<Vec<u8>> {
        let dtype = request.data_type;
        let width = dtype.num_bytes();
        let (count, len) = request
            .shape
            .byte_len(dtype)
            .map(|len| (len / width, len))
            .ok_or_else(|| {
                EngineError::allocation(format!("shape {} of {} exceeds host memory", request.shape, dtype))
            })?;

        let mut out = Vec::new();
        out.try_reserve_exact(len).map_err(|err| {
            EngineError::allocation(format!("{} bytes for shape {}: {}", len, request.shape, err))
        })?;
        match &request.fill {
            Fill::Uninit | Fill::Zeros => out.resize(len, 0),
            Fill::Ones => fill_with(&mut out, dtype, count, |_| 1.0),
            Fill::Value(value) => fill_with(&mut out, dtype, count, |_| *value),
            Fill::Data(bytes) => {
                if bytes.len() != len {
                    return Err(EngineError::invalid_argument(format!(
                        "expected {} bytes of {} for shape {}, got {}",
                        len,
                        dtype,
                        request.shape,
                        bytes.len()
                    )));
                }
                out.extend_from_slice(bytes);
            }
            Fill::Arange { start, step } => {
                fill_with(&mut out, dtype, count, |i| start + i as f64 * step)
            }
            Fill::Eye { k } => {
                let (_, cols) = matrix_dims(&request.shape)?;
                fill_with(&mut out, dtype, count, |i| {
                    let (row, col) = ((i / cols) as i64, (i % cols) as i64);
                    if col - row == *k {
                        1.0
                    } else {
                        0.0
                    }
                })
            }
            Fill::Linspace {
                start,
                stop,
                endpoint,
            } => {
                let divisions = if *endpoint { count.saturating_sub(1) } else { count };
                let step = if divisions > 0 {
                    (stop - start) / divisions as f64
                } else {
                    0.0
                };
                fill_with(&mut out, dtype, count, |i| {
                    if *endpoint && i + 1 == count && count > 1 {
                        *stop
                    } else {
                        start + i as f64 * step
                    }
                })
            }
            Fill::RandomUniform { low, high } => {
                let mut rng = self.rng.lock();
                fill_with(&mut out, dtype, count, |_| {
                    low + (high - low) * rng.gen::<f64>()
                })
            }
            Fill::RandomNormal { loc, scale } => {
                let mut rng = self.rng.lock();
                fill_with(&mut out, dtype, count, |_| {
                    // Box-Muller; u1 is drawn from (0, 1] so ln() stays finite
                    let u1 = 1.0 - rng.gen::<f64>();
                    let u2 = rng.gen::<f64>();
                    loc + scale * (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
                })
            }
            Fill::RandomMultinomial {
                trials,
                probabilities,
            } => {
                let categories = probabilities.len();
                if categories == 0 || request.shape.dims().last() != Some(&categories) {
                    return Err(EngineError::invalid_argument(format!(
                        "{} categories cannot fill shape {}",
                        categories, request.shape
                    )));
                }
                let mut rng = self.rng.lock();
                let mut counts = vec![0u64; categories];
                for _ in 0..count / categories {
                    counts.iter_mut().for_each(|c| *c = 0);
                    for _ in 0..*trials {
                        counts[category(probabilities, rng.gen::<f64>())] += 1;
                    }
                    for c in &counts {
                        dtype.write_scalar(*c as f64, &mut out);
                    }
                }
            }
            Fill::Csr {
                data,
                indptr,
                indices,
            } => {
                let (rows, cols) = matrix_dims(&request.shape)?;
                out.resize(len, 0);
                densify_csr(&mut out, width, rows, cols, data, indptr, indices)?;
            }
            Fill::RowSparse { data, indices } => {
                let rows = request.shape.get(0).ok_or_else(|| {
                    EngineError::invalid_argument("row-sparse arrays need rank >= 1")
                })?;
                let row_bytes = if rows == 0 { 0 } else { count / rows * width };
                if data.len() != indices.len() * row_bytes {
                    return Err(EngineError::invalid_argument(format!(
                        "row-sparse data holds {} bytes, expected {}",
                        data.len(),
                        indices.len() * row_bytes
                    )));
                }
                out.resize(len, 0);
                for (i, row) in indices.iter().enumerate() {
                    let row = checked_index(*row, rows, "row index")?;
                    out[row * row_bytes..(row + 1) * row_bytes]
                        .copy_from_slice(&data[i * row_bytes..(i + 1) * row_bytes]);
                }
            }
        }
        Ok(out)
    }

    fn lookup<'a>(
        buffers: &'a HashMap<NativeHandle, HostBuffer>,
        inputs: &[NativeHandle],
        position: usize,
    ) -> EngineResult<&'a HostBuffer> {
        let handle = inputs.get(position).ok_or_else(|| {
            EngineError::invalid_argument(format!("missing input {}", position))
        })?;
        buffers
            .get(handle)
            .ok_or(EngineError::InvalidHandle(handle.0))
    }

    fn compute(
        &self,
        operation: &str,
        buffers: &HashMap<NativeHandle, HostBuffer>,
        inputs: &[NativeHandle],
        params: &ParamBag,
    ) -> EngineResult<HostBuffer> {
        match operation {
            "copy" => Ok(Self::lookup(buffers, inputs, 0)?.clone()),
            "reshape" => {
                let src = Self::lookup(buffers, inputs, 0)?;
                let shape = params
                    .get_shape("shape")
                    .ok_or_else(|| EngineError::invalid_argument("reshape needs a 'shape' parameter"))?;
                if shape.checked_size() != src.shape.checked_size() {
                    return Err(EngineError::invalid_argument(format!(
                        "cannot reshape {} into {}",
                        src.shape, shape
                    )));
                }
                Ok(HostBuffer {
                    shape,
                    ..src.clone()
                })
            }
            "add" => {
                let lhs = Self::lookup(buffers, inputs, 0)?;
                let rhs = Self::lookup(buffers, inputs, 1)?;
                if lhs.shape != rhs.shape || lhs.data_type != rhs.data_type {
                    return Err(EngineError::invalid_argument(format!(
                        "add operands differ: {} {} vs {} {}",
                        lhs.shape, lhs.data_type, rhs.shape, rhs.data_type
                    )));
                }
                let mut bytes = Vec::with_capacity(lhs.bytes.len());
                for (a, b) in lhs.values().zip(rhs.values()) {
                    lhs.data_type.write_scalar(a + b, &mut bytes);
                }
                Ok(HostBuffer {
                    bytes,
                    ..lhs.clone()
                })
            }
            "mul_scalar" => {
                let src = Self::lookup(buffers, inputs, 0)?;
                let scalar = params.get_float("scalar").ok_or_else(|| {
                    EngineError::invalid_argument("mul_scalar needs a 'scalar' parameter")
                })?;
                let mut bytes = Vec::with_capacity(src.bytes.len());
                for value in src.values() {
                    src.data_type.write_scalar(value * scalar, &mut bytes);
                }
                Ok(HostBuffer {
                    bytes,
                    ..src.clone()
                })
            }
            other => Err(EngineError::Unsupported(other.to_string())),
        }
    }
}

impl Default for HostEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeEngine for HostEngine {
    fn name(&self) -> &str {
        "host"
    }

    fn create(&self, request: &AllocationRequest) -> EngineResult<NativeHandle> {
        let bytes = self.fill(request)?;
        let array = self.insert(HostBuffer {
            bytes,
            shape: request.shape.clone(),
            data_type: request.data_type,
            device: request.device,
        });
        Ok(array.handle)
    }

    fn release(&self, handle: NativeHandle) -> EngineResult<()> {
        match self.buffers.lock().remove(&handle) {
            Some(_) => {
                self.released.fetch_add(1, Ordering::AcqRel);
                trace!(handle = %handle, "host buffer freed");
                Ok(())
            }
            None => Err(EngineError::InvalidHandle(handle.0)),
        }
    }

    fn read(&self, handle: NativeHandle) -> EngineResult<Vec<u8>> {
        self.buffers
            .lock()
            .get(&handle)
            .map(|buffer| buffer.bytes.clone())
            .ok_or(EngineError::InvalidHandle(handle.0))
    }

    fn supports(&self, operation: &str) -> bool {
        SUPPORTED_OPERATIONS.contains(&operation)
    }

    fn invoke(
        &self,
        operation: &str,
        inputs: &[NativeHandle],
        params: &ParamBag,
    ) -> EngineResult<Vec<NativeArray>> {
        let output = {
            let buffers = self.buffers.lock();
            self.compute(operation, &buffers, inputs, params)?
        };
        Ok(vec![self.insert(output)])
    }

    fn invoke_into(
        &self,
        operation: &str,
        inputs: &[NativeHandle],
        outputs: &[NativeHandle],
        params: &ParamBag,
    ) -> EngineResult<()> {
        let target = outputs
            .first()
            .ok_or_else(|| EngineError::invalid_argument("invoke_into needs an output"))?;

        let mut buffers = self.buffers.lock();
        let result = self.compute(operation, &buffers, inputs, params)?;
        let dest = buffers
            .get_mut(target)
            .ok_or(EngineError::InvalidHandle(target.0))?;
        if dest.bytes.len() != result.bytes.len() || dest.data_type != result.data_type {
            return Err(EngineError::invalid_argument(format!(
                "output {} {} cannot hold result {} {}",
                dest.shape, dest.data_type, result.shape, result.data_type
            )));
        }
        dest.bytes = result.bytes;
        Ok(())
    }
}

fn fill_with(out: &mut Vec<u8>, dtype: DataType, count: usize, mut value: impl FnMut(usize) -> f64) {
    for i in 0..count {
        dtype.write_scalar(value(i), out);
    }
}

/// Category hit by a uniform draw `u` in `[0, 1)`
fn category(probabilities: &[f64], u: f64) -> usize {
    let last = probabilities.len() - 1;
    let mut cumulative = 0.0;
    for (i, p) in probabilities[..last].iter().enumerate() {
        cumulative += p;
        if u < cumulative {
            return i;
        }
    }
    last
}

fn matrix_dims(shape: &Shape) -> EngineResult<(usize, usize)> {
    match shape.dims() {
        [rows, cols] => Ok((*rows, *cols)),
        _ => Err(EngineError::invalid_argument(format!(
            "expected a rank-2 shape, got {}",
            shape
        ))),
    }
}

fn checked_index(index: i64, bound: usize, what: &str) -> EngineResult<usize> {
    usize::try_from(index)
        .ok()
        .filter(|i| *i < bound)
        .ok_or_else(|| EngineError::invalid_argument(format!("{} {} out of range 0..{}", what, index, bound)))
}

fn densify_csr(
    out: &mut [u8],
    width: usize,
    rows: usize,
    cols: usize,
    data: &[u8],
    indptr: &[i64],
    indices: &[i64],
) -> EngineResult<()> {
    if indptr.len() != rows + 1 {
        return Err(EngineError::invalid_argument(format!(
            "indptr has {} entries, expected {}",
            indptr.len(),
            rows + 1
        )));
    }
    if data.len() != indices.len() * width {
        return Err(EngineError::invalid_argument(format!(
            "csr data holds {} bytes for {} indices",
            data.len(),
            indices.len()
        )));
    }
    for row in 0..rows {
        let begin = checked_index(indptr[row], indices.len() + 1, "indptr")?;
        let end = checked_index(indptr[row + 1], indices.len() + 1, "indptr")?;
        for j in begin..end {
            let col = checked_index(indices[j], cols, "column index")?;
            let at = (row * cols + col) * width;
            out[at..at + width].copy_from_slice(&data[j * width..(j + 1) * width]);
        }
    }
    Ok(())
}
