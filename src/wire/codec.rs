//! Payload codecs.
//!
//! Every payload part on the wire is one of six types, each identified by a one-character
//! type code. Each type has a pure encoder and a pure decoder; decoding never panics and
//! reports malformed input as a [`CodecError`].
//!
//! | Type    | Code | Encoding                                               |
//! |---------|------|--------------------------------------------------------|
//! | bool    | `b`  | one byte, `0` or `1`                                   |
//! | int     | `i`  | `i64` little-endian                                    |
//! | float   | `f`  | `f64` little-endian                                    |
//! | string  | `s`  | UTF-8 bytes                                            |
//! | mapping | `d`  | JSON object                                            |
//! | buffer  | `a`  | dtype byte, `u32` ndim, `ndim x u32` dims, raw bytes   |

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// JSON object used for mapping payloads.
pub type Mapping = Map<String, Value>;

/// Errors raised while decoding (or, rarely, encoding) wire data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// A fixed-size part has the wrong length.
    #[error("{what} must be {expected} bytes, got {actual}")]
    InvalidLength {
        /// Part being decoded
        what: &'static str,
        /// Required byte count
        expected: usize,
        /// Byte count found
        actual: usize,
    },

    /// A bool part is neither 0 nor 1.
    #[error("invalid bool byte {0:#04x}")]
    InvalidBool(u8),

    /// A string part is not UTF-8.
    #[error("invalid UTF-8 in string part: {0}")]
    Utf8(String),

    /// A mapping part is not a JSON object.
    #[error("invalid mapping: {0}")]
    Mapping(String),

    /// A buffer names an unknown element type.
    #[error("unknown buffer dtype {0}")]
    UnknownDType(u8),

    /// Buffer bytes do not match its shape and element type.
    #[error("buffer of shape {shape:?} needs {expected} bytes, got {actual}")]
    BufferSize {
        /// Declared shape
        shape: Vec<u32>,
        /// Required byte count
        expected: usize,
        /// Byte count found
        actual: usize,
    },

    /// A buffer part ends inside its header.
    #[error("buffer header truncated")]
    TruncatedBuffer,

    /// The header carries an unknown topic tag.
    #[error("unknown topic tag '{0}'")]
    UnknownTopic(String),

    /// The flags do not fit the topic.
    #[error("unknown flags '{flags}' for topic '{topic}'")]
    UnknownShape {
        /// Topic tag
        topic: String,
        /// Header flags
        flags: String,
    },

    /// The message ends before a required part.
    #[error("message is missing part {0}")]
    MissingPart(usize),

    /// The message has parts after the last expected one.
    #[error("message has {0} unexpected trailing parts")]
    TrailingParts(usize),

    /// A link handshake frame is malformed.
    #[error("invalid handshake frame: {0}")]
    Hello(String),
}

/// One-character type codes used in message flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCode {
    /// `b`
    Bool,
    /// `i`
    Int,
    /// `f`
    Float,
    /// `s`
    Str,
    /// `d`
    Mapping,
    /// `a`
    Buffer,
}

impl TypeCode {
    /// The flag character for this type.
    pub fn as_char(self) -> char {
        match self {
            TypeCode::Bool => 'b',
            TypeCode::Int => 'i',
            TypeCode::Float => 'f',
            TypeCode::Str => 's',
            TypeCode::Mapping => 'd',
            TypeCode::Buffer => 'a',
        }
    }

    /// Parses a flag character.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'b' => Some(TypeCode::Bool),
            'i' => Some(TypeCode::Int),
            'f' => Some(TypeCode::Float),
            's' => Some(TypeCode::Str),
            'd' => Some(TypeCode::Mapping),
            'a' => Some(TypeCode::Buffer),
            _ => None,
        }
    }
}

/// Element type of a [`Buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DType {
    /// 8-bit unsigned
    U8 = 0,
    /// 16-bit unsigned
    U16 = 1,
    /// 32-bit float
    F32 = 2,
    /// 64-bit float
    F64 = 3,
}

impl DType {
    /// Inverse of the discriminant.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DType::U8),
            1 => Some(DType::U16),
            2 => Some(DType::F32),
            3 => Some(DType::F64),
            _ => None,
        }
    }

    /// Size of one element in bytes.
    pub fn element_size(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::U16 => 2,
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }
}

/// Numeric array payload: element type, shape and raw little-endian element bytes.
///
/// The data length always equals `product(shape) * dtype.element_size()`; the constructor
/// and the decoder both enforce it.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    dtype: DType,
    shape: Vec<u32>,
    data: Bytes,
}

impl Buffer {
    /// Builds a buffer, checking that `data` matches `shape` and `dtype`.
    pub fn new(dtype: DType, shape: Vec<u32>, data: impl Into<Bytes>) -> Result<Self, CodecError> {
        let data = data.into();
        let expected = expected_len(dtype, &shape);
        if expected != data.len() {
            return Err(CodecError::BufferSize {
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    /// Builds a `u8` buffer.
    pub fn from_u8(shape: Vec<u32>, data: Vec<u8>) -> Result<Self, CodecError> {
        Self::new(DType::U8, shape, data)
    }

    /// Builds an `f64` buffer from native values.
    pub fn from_f64(shape: Vec<u32>, values: &[f64]) -> Result<Self, CodecError> {
        let mut data = BytesMut::with_capacity(values.len() * 8);
        for v in values {
            data.put_f64_le(*v);
        }
        Self::new(DType::F64, shape, data.freeze())
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Dimensions, outermost first.
    pub fn shape(&self) -> &[u32] {
        &self.shape
    }

    /// Raw element bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().map(|d| *d as usize).product()
    }

    /// Whether the buffer has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn expected_len(dtype: DType, shape: &[u32]) -> usize {
    shape
        .iter()
        .map(|d| *d as usize)
        .product::<usize>()
        .saturating_mul(dtype.element_size())
}

fn fixed<const N: usize>(what: &'static str, data: &[u8]) -> Result<[u8; N], CodecError> {
    data.try_into().map_err(|_| CodecError::InvalidLength {
        what,
        expected: N,
        actual: data.len(),
    })
}

/// One byte, 0 or 1.
pub fn encode_bool(value: bool) -> Bytes {
    Bytes::copy_from_slice(&[u8::from(value)])
}

/// Inverse of [`encode_bool`].
pub fn decode_bool(data: &[u8]) -> Result<bool, CodecError> {
    match fixed::<1>("bool", data)? {
        [0] => Ok(false),
        [1] => Ok(true),
        [other] => Err(CodecError::InvalidBool(other)),
    }
}

/// Eight bytes, little-endian.
pub fn encode_int(value: i64) -> Bytes {
    Bytes::copy_from_slice(&value.to_le_bytes())
}

/// Inverse of [`encode_int`].
pub fn decode_int(data: &[u8]) -> Result<i64, CodecError> {
    Ok(i64::from_le_bytes(fixed::<8>("int", data)?))
}

/// Eight bytes, little-endian IEEE 754.
pub fn encode_float(value: f64) -> Bytes {
    Bytes::copy_from_slice(&value.to_le_bytes())
}

/// Inverse of [`encode_float`].
pub fn decode_float(data: &[u8]) -> Result<f64, CodecError> {
    Ok(f64::from_le_bytes(fixed::<8>("float", data)?))
}

/// UTF-8 bytes.
pub fn encode_str(value: &str) -> Bytes {
    Bytes::copy_from_slice(value.as_bytes())
}

/// Inverse of [`encode_str`].
pub fn decode_str(data: &[u8]) -> Result<String, CodecError> {
    String::from_utf8(data.to_vec()).map_err(|e| CodecError::Utf8(e.to_string()))
}

/// A JSON object.
pub fn encode_mapping(value: &Mapping) -> Result<Bytes, CodecError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| CodecError::Mapping(e.to_string()))
}

/// Inverse of [`encode_mapping`]; anything but an object is rejected.
pub fn decode_mapping(data: &[u8]) -> Result<Mapping, CodecError> {
    match serde_json::from_slice::<Value>(data) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(CodecError::Mapping(format!(
            "expected an object, got {}",
            json_type_name(&other)
        ))),
        Err(e) => Err(CodecError::Mapping(e.to_string())),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Header (dtype, rank, dims) followed by the raw element bytes.
pub fn encode_buffer(value: &Buffer) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + value.shape.len() * 4 + value.data.len());
    buf.put_u8(value.dtype as u8);
    buf.put_u32_le(value.shape.len() as u32);
    for dim in &value.shape {
        buf.put_u32_le(*dim);
    }
    buf.put_slice(&value.data);
    buf.freeze()
}

/// Inverse of [`encode_buffer`].
pub fn decode_buffer(data: &[u8]) -> Result<Buffer, CodecError> {
    if data.len() < 5 {
        return Err(CodecError::TruncatedBuffer);
    }
    let dtype = DType::from_u8(data[0]).ok_or(CodecError::UnknownDType(data[0]))?;
    let ndim = u32::from_le_bytes(fixed::<4>("buffer ndim", &data[1..5])?) as usize;
    let header_len = ndim
        .checked_mul(4)
        .and_then(|dims| dims.checked_add(5))
        .ok_or(CodecError::TruncatedBuffer)?;
    if data.len() < header_len {
        return Err(CodecError::TruncatedBuffer);
    }
    let shape = data[5..header_len]
        .chunks_exact(4)
        .map(|chunk| fixed::<4>("buffer dim", chunk).map(u32::from_le_bytes))
        .collect::<Result<Vec<_>, _>>()?;
    Buffer::new(dtype, shape, Bytes::copy_from_slice(&data[header_len..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bool_roundtrip_and_rejects_other_bytes() {
        assert!(decode_bool(&encode_bool(true)).unwrap());
        assert!(!decode_bool(&encode_bool(false)).unwrap());
        assert_eq!(decode_bool(&[2]), Err(CodecError::InvalidBool(2)));
        assert!(decode_bool(&[]).is_err());
        assert!(decode_bool(&[1, 0]).is_err());
    }

    #[test]
    fn test_int_boundaries() {
        for v in [0, -1, 1, i64::MIN, i64::MAX] {
            assert_eq!(decode_int(&encode_int(v)).unwrap(), v);
        }
        assert!(matches!(
            decode_int(&[1, 2, 3]),
            Err(CodecError::InvalidLength { expected: 8, actual: 3, .. })
        ));
    }

    #[test]
    fn test_float_boundaries() {
        for v in [0.0, -0.0, -1.5, f64::MIN_POSITIVE, f64::MAX, f64::INFINITY] {
            assert_eq!(decode_float(&encode_float(v)).unwrap().to_bits(), v.to_bits());
        }
        assert!(decode_float(&encode_float(f64::NAN)).unwrap().is_nan());
    }

    #[test]
    fn test_string_roundtrip_including_empty() {
        assert_eq!(decode_str(&encode_str("")).unwrap(), "");
        assert_eq!(decode_str(&encode_str("µs élan")).unwrap(), "µs élan");
        assert!(matches!(decode_str(&[0xff, 0xfe]), Err(CodecError::Utf8(_))));
    }

    #[test]
    fn test_mapping_roundtrip_and_rejects_non_objects() {
        let empty = Mapping::new();
        assert_eq!(decode_mapping(&encode_mapping(&empty).unwrap()).unwrap(), empty);

        let value = json!({"exposure": 0.01, "label": "a", "nested": {"n": [1, 2]}});
        let map = value.as_object().unwrap().clone();
        assert_eq!(decode_mapping(&encode_mapping(&map).unwrap()).unwrap(), map);

        assert!(matches!(decode_mapping(b"[1,2]"), Err(CodecError::Mapping(_))));
        assert!(matches!(decode_mapping(b"{not json"), Err(CodecError::Mapping(_))));
    }

    #[test]
    fn test_buffer_roundtrip() {
        let frame = Buffer::from_u8(vec![2, 3], vec![0, 1, 2, 3, 4, 255]).unwrap();
        assert_eq!(decode_buffer(&encode_buffer(&frame)).unwrap(), frame);

        let series = Buffer::from_f64(vec![3], &[-1.0, 0.0, 1.0e9]).unwrap();
        let decoded = decode_buffer(&encode_buffer(&series)).unwrap();
        assert_eq!(decoded.dtype(), DType::F64);
        assert_eq!(decoded, series);
    }

    #[test]
    fn test_zero_length_buffer() {
        let empty = Buffer::new(DType::F32, vec![0, 4], Bytes::new()).unwrap();
        assert!(empty.is_empty());
        assert_eq!(decode_buffer(&encode_buffer(&empty)).unwrap(), empty);
    }

    #[test]
    fn test_buffer_length_mismatch_is_rejected() {
        assert!(matches!(
            Buffer::new(DType::U16, vec![2, 2], vec![0u8; 7]),
            Err(CodecError::BufferSize { expected: 8, actual: 7, .. })
        ));

        let mut wire = encode_buffer(&Buffer::from_u8(vec![4], vec![1, 2, 3, 4]).unwrap()).to_vec();
        wire.pop();
        assert!(matches!(decode_buffer(&wire), Err(CodecError::BufferSize { .. })));
    }

    #[test]
    fn test_buffer_header_errors() {
        assert_eq!(decode_buffer(&[0, 1]), Err(CodecError::TruncatedBuffer));
        assert_eq!(decode_buffer(&[9, 0, 0, 0, 0]), Err(CodecError::UnknownDType(9)));
        // claims two dims but carries one
        assert_eq!(
            decode_buffer(&[0, 2, 0, 0, 0, 1, 0, 0, 0]),
            Err(CodecError::TruncatedBuffer)
        );
    }

    #[test]
    fn test_type_codes() {
        for c in ['b', 'i', 'f', 's', 'd', 'a'] {
            assert_eq!(TypeCode::from_char(c).unwrap().as_char(), c);
        }
        assert!(TypeCode::from_char('x').is_none());
    }
}
