// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::{
    collections::{HashMap, HashSet},
    fmt,
    str::FromStr,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the mandatory elapsed time field of every composite record.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Returns the name of the per-stream elapsed time field.
pub fn stream_timestamp_field(stream: &str) -> String {
    format!("{}_timestamp", stream)
}

/// The element type of a sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
}

impl DType {
    /// Every supported dtype.
    pub const ALL: [DType; 10] = [
        DType::F32,
        DType::F64,
        DType::I8,
        DType::I16,
        DType::I32,
        DType::I64,
        DType::U8,
        DType::U16,
        DType::U32,
        DType::U64,
    ];

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::I8 | DType::U8 => 1,
            DType::I16 | DType::U16 => 2,
            DType::F32 | DType::I32 | DType::U32 => 4,
            DType::F64 | DType::I64 | DType::U64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I8 => "i8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
            DType::U16 => "u16",
            DType::U32 => "u32",
            DType::U64 => "u64",
        };
        f.write_str(name)
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DType::ALL
            .into_iter()
            .find(|dtype| dtype.to_string() == s.to_lowercase())
            .ok_or_else(|| Error::Other(format!("unknown dtype {}", s)))
    }
}

/// A single typed value.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    F32(f32),
    F64(f64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
}

impl Value {
    pub fn dtype(&self) -> DType {
        match self {
            Value::F32(_) => DType::F32,
            Value::F64(_) => DType::F64,
            Value::I8(_) => DType::I8,
            Value::I16(_) => DType::I16,
            Value::I32(_) => DType::I32,
            Value::I64(_) => DType::I64,
            Value::U8(_) => DType::U8,
            Value::U16(_) => DType::U16,
            Value::U32(_) => DType::U32,
            Value::U64(_) => DType::U64,
        }
    }

    /// Returns the value widened (or for 64 bit integers, rounded) to an f64.
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::F32(v) => v.into(),
            Value::F64(v) => v,
            Value::I8(v) => v.into(),
            Value::I16(v) => v.into(),
            Value::I32(v) => v.into(),
            Value::I64(v) => v as f64,
            Value::U8(v) => v.into(),
            Value::U16(v) => v.into(),
            Value::U32(v) => v.into(),
            Value::U64(v) => v as f64,
        }
    }

    /// Converts an f64 into a value of the given dtype. Integer dtypes round and saturate.
    pub fn from_f64(dtype: DType, v: f64) -> Value {
        match dtype {
            DType::F32 => Value::F32(v as f32),
            DType::F64 => Value::F64(v),
            DType::I8 => Value::I8(v.round() as i8),
            DType::I16 => Value::I16(v.round() as i16),
            DType::I32 => Value::I32(v.round() as i32),
            DType::I64 => Value::I64(v.round() as i64),
            DType::U8 => Value::U8(v.round() as u8),
            DType::U16 => Value::U16(v.round() as u16),
            DType::U32 => Value::U32(v.round() as u32),
            DType::U64 => Value::U64(v.round() as u64),
        }
    }

    /// The raw bit pattern of the value, zero extended to 64 bits.
    pub fn to_bits(self) -> u64 {
        match self {
            Value::F32(v) => v.to_bits().into(),
            Value::F64(v) => v.to_bits(),
            Value::I8(v) => (v as u8).into(),
            Value::I16(v) => (v as u16).into(),
            Value::I32(v) => (v as u32).into(),
            Value::I64(v) => v as u64,
            Value::U8(v) => v.into(),
            Value::U16(v) => v.into(),
            Value::U32(v) => v.into(),
            Value::U64(v) => v,
        }
    }

    /// Rebuilds a value from a bit pattern produced by [Value::to_bits].
    pub fn from_bits(dtype: DType, bits: u64) -> Value {
        match dtype {
            DType::F32 => Value::F32(f32::from_bits(bits as u32)),
            DType::F64 => Value::F64(f64::from_bits(bits)),
            DType::I8 => Value::I8(bits as u8 as i8),
            DType::I16 => Value::I16(bits as u16 as i16),
            DType::I32 => Value::I32(bits as u32 as i32),
            DType::I64 => Value::I64(bits as i64),
            DType::U8 => Value::U8(bits as u8),
            DType::U16 => Value::U16(bits as u16),
            DType::U32 => Value::U32(bits as u32),
            DType::U64 => Value::U64(bits),
        }
    }

    /// Writes the native endian bytes of the value. `buf` must be `dtype().size()` long.
    pub fn write_ne(self, buf: &mut [u8]) {
        match self {
            Value::F32(v) => buf.copy_from_slice(&v.to_ne_bytes()),
            Value::F64(v) => buf.copy_from_slice(&v.to_ne_bytes()),
            Value::I8(v) => buf.copy_from_slice(&v.to_ne_bytes()),
            Value::I16(v) => buf.copy_from_slice(&v.to_ne_bytes()),
            Value::I32(v) => buf.copy_from_slice(&v.to_ne_bytes()),
            Value::I64(v) => buf.copy_from_slice(&v.to_ne_bytes()),
            Value::U8(v) => buf.copy_from_slice(&v.to_ne_bytes()),
            Value::U16(v) => buf.copy_from_slice(&v.to_ne_bytes()),
            Value::U32(v) => buf.copy_from_slice(&v.to_ne_bytes()),
            Value::U64(v) => buf.copy_from_slice(&v.to_ne_bytes()),
        }
    }

    /// Reads a value from native endian bytes. `buf` must be `dtype.size()` long.
    pub fn read_ne(dtype: DType, buf: &[u8]) -> Value {
        let mut bytes = [0u8; 8];
        bytes[..dtype.size()].copy_from_slice(&buf[..dtype.size()]);
        match dtype {
            DType::F32 => Value::F32(f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            DType::F64 => Value::F64(f64::from_ne_bytes(bytes)),
            DType::I8 => Value::I8(i8::from_ne_bytes([bytes[0]])),
            DType::I16 => Value::I16(i16::from_ne_bytes([bytes[0], bytes[1]])),
            DType::I32 => Value::I32(i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            DType::I64 => Value::I64(i64::from_ne_bytes(bytes)),
            DType::U8 => Value::U8(bytes[0]),
            DType::U16 => Value::U16(u16::from_ne_bytes([bytes[0], bytes[1]])),
            DType::U32 => Value::U32(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            DType::U64 => Value::U64(u64::from_ne_bytes(bytes)),
        }
    }

    /// Parses a textual value into the given dtype.
    pub fn parse(dtype: DType, field: &str, text: &str) -> Result<Value> {
        let text = text.trim();
        let err = || Error::Parse {
            field: field.to_string(),
            value: text.to_string(),
        };
        Ok(match dtype {
            DType::F32 => Value::F32(text.parse().map_err(|_| err())?),
            DType::F64 => Value::F64(text.parse().map_err(|_| err())?),
            DType::I8 => Value::I8(text.parse().map_err(|_| err())?),
            DType::I16 => Value::I16(text.parse().map_err(|_| err())?),
            DType::I32 => Value::I32(text.parse().map_err(|_| err())?),
            DType::I64 => Value::I64(text.parse().map_err(|_| err())?),
            DType::U8 => Value::U8(text.parse().map_err(|_| err())?),
            DType::U16 => Value::U16(text.parse().map_err(|_| err())?),
            DType::U32 => Value::U32(text.parse().map_err(|_| err())?),
            DType::U64 => Value::U64(text.parse().map_err(|_| err())?),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::F32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::I8(v) => write!(f, "{}", v),
            Value::I16(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::U8(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
        }
    }
}

/// A fixed-dtype array of values, positionally aligned to a stream header.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    dtype: DType,
    values: Vec<Value>,
}

impl Sample {
    /// Creates a sample from values that must all share the given dtype.
    pub fn new(dtype: DType, values: Vec<Value>) -> Result<Sample> {
        if let Some(value) = values.iter().find(|value| value.dtype() != dtype) {
            return Err(Error::SampleDType {
                stream: "<sample>".to_string(),
                expected: dtype,
                actual: value.dtype(),
            });
        }
        Ok(Sample { dtype, values })
    }

    /// Creates a sample by converting every f64 into the given dtype.
    pub fn from_f64(dtype: DType, values: &[f64]) -> Sample {
        Sample {
            dtype,
            values: values.iter().map(|v| Value::from_f64(dtype, *v)).collect(),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Values may be replaced, but only with values of the same dtype.
    pub fn set(&mut self, index: usize, value: f64) {
        self.values[index] = Value::from_f64(self.dtype, value);
    }

    /// Mutable access for preprocessors. Callers must keep every value's dtype.
    pub fn values_mut(&mut self) -> &mut [Value] {
        &mut self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

macro_rules! sample_from_vec {
    ($($t:ty => $variant:ident),*) => {
        $(
            impl From<Vec<$t>> for Sample {
                fn from(values: Vec<$t>) -> Sample {
                    Sample {
                        dtype: DType::$variant,
                        values: values.into_iter().map(Value::$variant).collect(),
                    }
                }
            }
        )*
    };
}

sample_from_vec!(
    f32 => F32, f64 => F64, i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    u8 => U8, u16 => U16, u32 => U32, u64 => U64
);

/// The shape every sample of one stream run must keep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleShape {
    pub len: usize,
    pub dtype: DType,
}

impl SampleShape {
    /// Takes the shape of the first sample of a run.
    pub fn of(sample: &Sample) -> SampleShape {
        SampleShape {
            len: sample.len(),
            dtype: sample.dtype(),
        }
    }

    /// Validates a later sample against this shape.
    pub fn check(&self, stream: &str, sample: &Sample) -> Result<()> {
        if sample.len() != self.len {
            return Err(Error::SampleLength {
                stream: stream.to_string(),
                expected: self.len,
                actual: sample.len(),
            });
        }
        if sample.dtype() != self.dtype {
            return Err(Error::SampleDType {
                stream: stream.to_string(),
                expected: self.dtype,
                actual: sample.dtype(),
            });
        }
        Ok(())
    }
}

/// An ordered list of unique field names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    names: Vec<String>,
    positions: HashMap<String, usize>,
}

impl Header {
    /// Creates a header, failing if any name appears more than once.
    pub fn new<S: Into<String>>(context: &str, names: impl IntoIterator<Item = S>) -> Result<Header> {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let mut seen = HashSet::new();
        let mut duplicates: Vec<String> = Vec::new();
        for name in names.iter() {
            if !seen.insert(name.as_str()) && !duplicates.contains(name) {
                duplicates.push(name.clone());
            }
        }
        if !duplicates.is_empty() {
            return Err(Error::DuplicateFields {
                context: context.to_string(),
                names: duplicates,
            });
        }
        let positions = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Ok(Header { names, positions })
    }

    /// Concatenates headers in order, checking that the result is still unique.
    pub fn concat<'a>(context: &str, headers: impl IntoIterator<Item = &'a Header>) -> Result<Header> {
        Header::new(
            context,
            headers
                .into_iter()
                .flat_map(|header| header.names.iter().cloned()),
        )
    }

    /// Returns a copy of this header with a field inserted at the head.
    pub fn with_leading(&self, context: &str, name: &str) -> Result<Header> {
        Header::new(
            context,
            std::iter::once(name.to_string()).chain(self.names.iter().cloned()),
        )
    }

    /// Returns a copy of this header with a field appended, if not already present.
    pub fn with_trailing(&self, name: &str) -> Header {
        if self.positions.contains_key(name) {
            return self.clone();
        }
        let mut header = self.clone();
        header.positions.insert(name.to_string(), header.names.len());
        header.names.push(name.to_string());
        header
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }
}

/// One dispatched row: field values aligned to a shared header.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    header: Arc<Header>,
    values: Vec<Value>,
}

impl Record {
    pub fn new(header: Arc<Header>, values: Vec<Value>) -> Record {
        debug_assert_eq!(header.len(), values.len());
        Record { header, values }
    }

    pub fn header(&self) -> &Arc<Header> {
        &self.header
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [Value] {
        &mut self.values
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.header.position(name).map(|i| self.values[i])
    }

    /// Sets an existing field, keeping the value's own dtype.
    pub fn set(&mut self, name: &str, value: Value) -> bool {
        match self.header.position(name) {
            Some(i) => {
                self.values[i] = value;
                true
            }
            None => false,
        }
    }

    /// Returns the record values as f64s.
    pub fn to_f64(&self) -> Vec<f64> {
        self.values.iter().map(Value::as_f64).collect()
    }
}
