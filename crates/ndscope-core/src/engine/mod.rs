// Native engine boundary
//
// The lifetime core never touches native memory directly. It asks a
// `NativeEngine` for handles and hands them back exactly once.

use std::fmt;

use ndscope_error::EngineResult;
use serde::{Deserialize, Serialize};

use crate::types::{DataType, Device, Shape};

pub mod host;
pub mod params;

pub use host::HostEngine;
pub use params::{ParamBag, ParamValue};

/// Opaque handle to engine-owned memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NativeHandle(pub u64);

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// How the engine should initialize a new array
#[derive(Debug, Clone, PartialEq)]
pub enum Fill {
    /// Contents are unspecified
    Uninit,
    Zeros,
    Ones,
    /// Every element set to the same value
    Value(f64),
    /// Little-endian element bytes in the requested data type
    Data(Vec<u8>),
    /// `start + i * step` for each flat index `i`
    Arange { start: f64, step: f64 },
    /// Ones on diagonal `k` of a rank-2 array, zeros elsewhere
    Eye { k: i64 },
    /// Evenly spaced values over `[start, stop]` (or `[start, stop)`)
    Linspace { start: f64, stop: f64, endpoint: bool },
    RandomUniform { low: f64, high: f64 },
    RandomNormal { loc: f64, scale: f64 },
    /// Category counts of `trials` draws, one distribution per trailing row.
    /// The last category takes the probability the others leave.
    RandomMultinomial { trials: u64, probabilities: Vec<f64> },
    /// Compressed sparse row input densified into a rank-2 array
    Csr {
        data: Vec<u8>,
        indptr: Vec<i64>,
        indices: Vec<i64>,
    },
    /// Row-sparse input: row `indices[i]` of the result is row `i` of `data`
    RowSparse { data: Vec<u8>, indices: Vec<i64> },
}

/// A fully resolved allocation handed to the engine
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationRequest {
    pub shape: Shape,
    pub data_type: DataType,
    pub device: Device,
    pub fill: Fill,
}

/// Metadata of an array produced by the engine during `invoke`
#[derive(Debug, Clone, PartialEq)]
pub struct NativeArray {
    pub handle: NativeHandle,
    pub shape: Shape,
    pub data_type: DataType,
    pub device: Device,
}

/// The native tensor engine consumed by managers.
///
/// Implementations own the memory behind every handle they return.
/// Managers guarantee `release` is called at most once per handle.
pub trait NativeEngine: Send + Sync + fmt::Debug {
    /// Engine name used in diagnostics and errors
    fn name(&self) -> &str;

    /// Allocate and initialize native memory
    fn create(&self, request: &AllocationRequest) -> EngineResult<NativeHandle>;

    /// Free the memory behind `handle`
    fn release(&self, handle: NativeHandle) -> EngineResult<()>;

    /// Copy the contents of `handle` to the host as little-endian bytes
    fn read(&self, handle: NativeHandle) -> EngineResult<Vec<u8>>;

    /// Capability check for `invoke` / `invoke_into`
    fn supports(&self, _operation: &str) -> bool {
        false
    }

    /// Run a named operation producing new native arrays
    fn invoke(
        &self,
        operation: &str,
        _inputs: &[NativeHandle],
        _params: &ParamBag,
    ) -> EngineResult<Vec<NativeArray>> {
        Err(ndscope_error::EngineError::Unsupported(operation.to_string()))
    }

    /// Run a named operation writing into existing arrays
    fn invoke_into(
        &self,
        operation: &str,
        _inputs: &[NativeHandle],
        _outputs: &[NativeHandle],
        _params: &ParamBag,
    ) -> EngineResult<()> {
        Err(ndscope_error::EngineError::Unsupported(operation.to_string()))
    }
}
