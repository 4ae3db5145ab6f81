//! The record value model.
//!
//! A [`Record`] is an insertion-ordered map from field name to [`Value`].
//! Values are scalars, opaque byte blobs, N-dimensional numeric arrays
//! ([`TypedArray`]), or nested records/lists thereof. Records have no fixed
//! schema; each instance may transcode its fields differently.
//!
//! Arrays serialize to the NPY v1.0 container format so shards interoperate
//! with numeric tooling: magic, version, a padded header dict carrying
//! `descr`/`fortran_order`/`shape`, then the little-endian element buffer.

use crate::error::{Result, ShardsetError};
use indexmap::IndexMap;

/// An insertion-ordered field-name-to-value mapping.
pub type Record = IndexMap<String, Value>;

/// A single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent/null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Double-precision float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Opaque byte blob.
    Bytes(Vec<u8>),
    /// N-dimensional numeric array.
    Array(TypedArray),
    /// List of values.
    List(Vec<Value>),
    /// Nested record.
    Map(Record),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<TypedArray> for Value {
    fn from(v: TypedArray) -> Self {
        Self::Array(v)
    }
}

/// Element type of a [`TypedArray`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Dtype {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl Dtype {
    /// Element size in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    /// The NPY `descr` string (little-endian).
    pub fn descr(&self) -> &'static str {
        match self {
            Self::I8 => "|i1",
            Self::I16 => "<i2",
            Self::I32 => "<i4",
            Self::I64 => "<i8",
            Self::U8 => "|u1",
            Self::U16 => "<u2",
            Self::U32 => "<u4",
            Self::U64 => "<u8",
            Self::F32 => "<f4",
            Self::F64 => "<f8",
        }
    }

    /// Parses an NPY `descr` string. Big-endian descriptors are rejected.
    pub fn from_descr(descr: &str) -> Result<Self> {
        let normalized = descr.strip_prefix(['<', '|', '=']).unwrap_or(descr);
        match normalized {
            "i1" => Ok(Self::I8),
            "i2" => Ok(Self::I16),
            "i4" => Ok(Self::I32),
            "i8" => Ok(Self::I64),
            "u1" => Ok(Self::U8),
            "u2" => Ok(Self::U16),
            "u4" => Ok(Self::U32),
            "u8" => Ok(Self::U64),
            "f4" => Ok(Self::F32),
            "f8" => Ok(Self::F64),
            _ => Err(ShardsetError::Format(format!(
                "unsupported array descr '{descr}'"
            ))),
        }
    }
}

/// A native numeric element of a [`TypedArray`].
pub trait ArrayElement: Copy {
    /// The dtype tag for this element type.
    const DTYPE: Dtype;

    /// Appends the little-endian representation to `out`.
    fn write_le(&self, out: &mut Vec<u8>);

    /// Reads one element from a little-endian byte slice of exactly
    /// `DTYPE.size()` bytes.
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_array_element {
    ($($t:ty => $dtype:expr),* $(,)?) => {
        $(
            impl ArrayElement for $t {
                const DTYPE: Dtype = $dtype;

                fn write_le(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; size_of::<$t>()];
                    buf.copy_from_slice(bytes);
                    Self::from_le_bytes(buf)
                }
            }
        )*
    };
}

impl_array_element!(
    i8 => Dtype::I8,
    i16 => Dtype::I16,
    i32 => Dtype::I32,
    i64 => Dtype::I64,
    u8 => Dtype::U8,
    u16 => Dtype::U16,
    u32 => Dtype::U32,
    u64 => Dtype::U64,
    f32 => Dtype::F32,
    f64 => Dtype::F64,
);

/// An N-dimensional numeric array: dtype, shape, and a contiguous
/// little-endian element buffer in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedArray {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl TypedArray {
    /// Creates an array from raw parts, validating the buffer length.
    pub fn new(dtype: Dtype, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let elems: usize = shape.iter().product();
        if elems * dtype.size() != data.len() {
            return Err(ShardsetError::Format(format!(
                "array buffer of {} bytes does not match shape {:?} of dtype {}",
                data.len(),
                shape,
                dtype.descr()
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    /// Creates a one-dimensional array from native elements.
    pub fn from_vec<T: ArrayElement>(values: Vec<T>) -> Self {
        let mut data = Vec::with_capacity(values.len() * T::DTYPE.size());
        for v in &values {
            v.write_le(&mut data);
        }
        Self {
            dtype: T::DTYPE,
            shape: vec![values.len()],
            data,
        }
    }

    /// Reinterprets the array under a new shape with the same element count.
    pub fn reshape(mut self, shape: Vec<usize>) -> Result<Self> {
        let elems: usize = shape.iter().product();
        if elems != self.len() {
            return Err(ShardsetError::Format(format!(
                "cannot reshape {} elements into {:?}",
                self.len(),
                shape
            )));
        }
        self.shape = shape;
        Ok(self)
    }

    /// Extracts the elements as a flat vector of `T`.
    ///
    /// # Errors
    /// Returns [`ShardsetError::Format`] if `T` does not match the stored
    /// dtype.
    pub fn to_vec<T: ArrayElement>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(ShardsetError::Format(format!(
                "array has dtype {}, requested {}",
                self.dtype.descr(),
                T::DTYPE.descr()
            )));
        }
        Ok(self
            .data
            .chunks_exact(self.dtype.size())
            .map(T::read_le)
            .collect())
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// True if the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element dtype.
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Dimension sizes, row-major.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Raw little-endian element buffer.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Serializes to the NPY v1.0 container format.
    pub fn to_npy(&self) -> Vec<u8> {
        let shape_repr = match self.shape.len() {
            0 => "()".to_owned(),
            1 => format!("({},)", self.shape[0]),
            _ => format!(
                "({})",
                self.shape
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };
        let mut header = format!(
            "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
            self.dtype.descr(),
            shape_repr
        );
        // Magic(6) + version(2) + header-len(2) + header + '\n', padded to 64.
        let unpadded = 10 + header.len() + 1;
        header.extend(std::iter::repeat_n(' ', unpadded.next_multiple_of(64) - unpadded));
        header.push('\n');

        let mut out = Vec::with_capacity(10 + header.len() + self.data.len());
        out.extend_from_slice(b"\x93NUMPY\x01\x00");
        out.extend_from_slice(&(header.len() as u16).to_le_bytes());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Parses an NPY v1.0 container.
    ///
    /// # Errors
    /// Returns [`ShardsetError::Format`] for a bad magic, an unsupported
    /// version or dtype, Fortran element order, or a truncated buffer.
    pub fn from_npy(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 10 || &bytes[..6] != b"\x93NUMPY" {
            return Err(ShardsetError::Format("not an NPY payload".into()));
        }
        if bytes[6] != 1 {
            return Err(ShardsetError::Format(format!(
                "unsupported NPY version {}.{}",
                bytes[6], bytes[7]
            )));
        }
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        let body_start = 10 + header_len;
        if bytes.len() < body_start {
            return Err(ShardsetError::Format("truncated NPY header".into()));
        }
        let header = std::str::from_utf8(&bytes[10..body_start])
            .map_err(|_| ShardsetError::Format("non-ASCII NPY header".into()))?;

        let descr = header_field(header, "'descr':")
            .and_then(|rest| quoted(rest))
            .ok_or_else(|| ShardsetError::Format("NPY header missing descr".into()))?;
        let dtype = Dtype::from_descr(descr)?;

        let fortran = header_field(header, "'fortran_order':")
            .ok_or_else(|| ShardsetError::Format("NPY header missing fortran_order".into()))?;
        if fortran.starts_with("True") {
            return Err(ShardsetError::Format(
                "Fortran-ordered NPY arrays are not supported".into(),
            ));
        }

        let shape_src = header_field(header, "'shape':")
            .and_then(|rest| rest.strip_prefix('('))
            .and_then(|rest| rest.split_once(')'))
            .map(|(inner, _)| inner)
            .ok_or_else(|| ShardsetError::Format("NPY header missing shape".into()))?;
        let mut shape = Vec::new();
        for dim in shape_src.split(',') {
            let dim = dim.trim();
            if dim.is_empty() {
                continue;
            }
            shape.push(dim.parse::<usize>().map_err(|_| {
                ShardsetError::Format(format!("invalid NPY shape dimension '{dim}'"))
            })?);
        }

        Self::new(dtype, shape, bytes[body_start..].to_vec())
    }
}

fn header_field<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    header.find(key).map(|i| header[i + key.len()..].trim_start())
}

fn quoted(rest: &str) -> Option<&str> {
    let rest = rest.strip_prefix('\'')?;
    rest.split_once('\'').map(|(inner, _)| inner)
}
