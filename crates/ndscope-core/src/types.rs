// Array metadata types
//
// Devices, data types, shapes and the host element types that can be
// copied in and out of native arrays.

use std::fmt;
use std::str::FromStr;

use ndscope_error::ManagerError;
use serde::{Deserialize, Serialize};

/// Placement of native memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Gpu(u32),
}

impl Device {
    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Gpu(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu()"),
            Device::Gpu(id) => write!(f, "gpu({})", id),
        }
    }
}

impl FromStr for Device {
    type Err = ManagerError;

    /// Accepts `cpu`, `gpu` (device 0) and `gpu(N)`, with or without `()`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let (name, index) = match s.find('(') {
            Some(open) if s.ends_with(')') => (&s[..open], Some(&s[open + 1..s.len() - 1])),
            Some(_) => return Err(ManagerError::invalid_argument(format!("malformed device '{}'", s))),
            None => (s.as_str(), None),
        };
        match (name, index) {
            ("cpu", None) | ("cpu", Some("")) => Ok(Device::Cpu),
            ("gpu", None) | ("gpu", Some("")) => Ok(Device::Gpu(0)),
            ("gpu", Some(index)) => index
                .parse()
                .map(Device::Gpu)
                .map_err(|_| ManagerError::invalid_argument(format!("bad gpu index '{}'", index))),
            _ => Err(ManagerError::invalid_argument(format!("unknown device '{}'", s))),
        }
    }
}

/// Element type of a native array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    Float32,
    Float64,
    Int8,
    Uint8,
    Int32,
    Int64,
    Boolean,
}

impl DataType {
    /// Width of one element in bytes
    pub fn num_bytes(&self) -> usize {
        match self {
            DataType::Int8 | DataType::Uint8 | DataType::Boolean => 1,
            DataType::Int32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::Float64 => 8,
        }
    }

    pub fn is_floating(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    /// Append `value` converted to this type as little-endian bytes.
    pub(crate) fn write_scalar(&self, value: f64, out: &mut Vec<u8>) {
        match self {
            DataType::Float32 => out.extend_from_slice(&(value as f32).to_le_bytes()),
            DataType::Float64 => out.extend_from_slice(&value.to_le_bytes()),
            DataType::Int8 => out.extend_from_slice(&(value as i8).to_le_bytes()),
            DataType::Uint8 => out.push(value as u8),
            DataType::Int32 => out.extend_from_slice(&(value as i32).to_le_bytes()),
            DataType::Int64 => out.extend_from_slice(&(value as i64).to_le_bytes()),
            DataType::Boolean => out.push(u8::from(value != 0.0)),
        }
    }

    /// Decode one element; `bytes` must be exactly `num_bytes` long.
    pub(crate) fn read_scalar(&self, bytes: &[u8]) -> f64 {
        match self {
            DataType::Float32 => f32::from_le_bytes(le_array(bytes)) as f64,
            DataType::Float64 => f64::from_le_bytes(le_array(bytes)),
            DataType::Int8 => i8::from_le_bytes(le_array(bytes)) as f64,
            DataType::Uint8 => bytes[0] as f64,
            DataType::Int32 => i32::from_le_bytes(le_array(bytes)) as f64,
            DataType::Int64 => i64::from_le_bytes(le_array(bytes)) as f64,
            DataType::Boolean => f64::from(u8::from(bytes[0] != 0)),
        }
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::Int8 => "int8",
            DataType::Uint8 => "uint8",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

/// Dimensions of an array. The empty shape is a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Shape(dims.into())
    }

    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Number of elements, saturating at `usize::MAX`
    pub fn size(&self) -> usize {
        self.checked_size().unwrap_or(usize::MAX)
    }

    /// Number of elements, or `None` if it does not fit in a `usize`
    pub fn checked_size(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
    }

    /// Bytes needed to hold this shape in `data_type`, or `None` past
    /// `isize::MAX`, the largest buffer Rust can allocate
    pub fn byte_len(&self, data_type: DataType) -> Option<usize> {
        self.checked_size()
            .and_then(|count| count.checked_mul(data_type.num_bytes()))
            .filter(|bytes| *bytes <= isize::MAX as usize)
    }

    pub fn get(&self, axis: usize) -> Option<usize> {
        self.0.get(axis).copied()
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, dim) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", dim)?;
        }
        write!(f, ")")
    }
}

/// Host scalar types that map onto a `DataType`
pub trait Element: Copy + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    fn write_le(&self, out: &mut Vec<u8>);

    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! numeric_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DATA_TYPE: DataType = $dtype;

            fn write_le(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                <$ty>::from_le_bytes(le_array(bytes))
            }
        }
    };
}

numeric_element!(f32, DataType::Float32);
numeric_element!(f64, DataType::Float64);
numeric_element!(i8, DataType::Int8);
numeric_element!(u8, DataType::Uint8);
numeric_element!(i32, DataType::Int32);
numeric_element!(i64, DataType::Int64);

impl Element for bool {
    const DATA_TYPE: DataType = DataType::Boolean;

    fn write_le(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Encode a slice of host elements as little-endian bytes
pub fn encode_elements<T: Element>(data: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * T::DATA_TYPE.num_bytes());
    for value in data {
        value.write_le(&mut out);
    }
    out
}

/// Decode little-endian bytes into host elements
pub fn decode_elements<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(T::DATA_TYPE.num_bytes())
        .map(T::read_le)
        .collect()
}
