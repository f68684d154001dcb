//! Binary serializer framework.
//!
//! Every value stored in a bucket goes through a [`BinarySerializer`]: a
//! stateless codec that writes a value straight into a caller-owned buffer at a
//! given offset, and reads it back from the same place. Several values share
//! one buffer (a page), so codecs never allocate a carrier buffer of their own.
//!
//! # Format
//!
//! - Integers are big-endian, sign-preserving.
//! - Variable-length values carry their own length prefix, so the encoded size
//!   can be recomputed from the bytes alone ([`BinarySerializer::object_size_in_buffer`]).
//! - Each codec has a one-byte type tag ([`SerializerId`]) persisted in bucket
//!   headers and composite keys.
//!
//! # Invariants
//!
//! - `object_size(v) == object_size_in_buffer(serialize(v), 0)` for every value.
//! - `deserialize(serialize(v)) == preprocess(v)` for every value.
//! - Reading past the end of a buffer panics; callers size buffers with
//!   `object_size` first.

mod binary;
mod composite;
mod decimal;
mod null;
mod numeric;
mod string;
mod temporal;
mod uuid;

pub use binary::BinaryTypeSerializer;
pub use composite::CompositeKeySerializer;
pub use decimal::{Decimal, DecimalSerializer};
pub use null::NullSerializer;
pub use numeric::{
    BooleanSerializer, ByteSerializer, CharSerializer, DoubleSerializer, FloatSerializer,
    IntegerSerializer, LinkSerializer, LongSerializer, ShortSerializer,
};
pub use string::{StringSerializer, Utf8Serializer};
pub use temporal::{DateSerializer, DateTimeSerializer};
pub use self::uuid::UuidSerializer;

/// Codec contract shared by every serializable type.
///
/// Implementations are zero-sized or otherwise stateless and can be used from
/// any number of threads at once.
pub trait BinarySerializer: Send + Sync {
    /// The in-memory type this codec encodes.
    type Value;

    /// One-byte type tag identifying this codec on disk.
    fn id(&self) -> SerializerId;

    /// Encoded length of a live value.
    fn object_size(&self, value: &Self::Value) -> usize;

    /// Encoded length of a value already written at `offset`.
    fn object_size_in_buffer(&self, buffer: &[u8], offset: usize) -> usize;

    /// Write `value` into `buffer` starting at `offset`.
    ///
    /// The buffer must have at least `object_size(value)` bytes after `offset`.
    fn serialize(&self, value: &Self::Value, buffer: &mut [u8], offset: usize);

    /// Read a value previously written at `offset`.
    fn deserialize(&self, buffer: &[u8], offset: usize) -> Self::Value;

    /// The constant encoded length, or `None` for variable-length codecs.
    fn fixed_length(&self) -> Option<usize>;

    /// Whether every value of this type encodes to the same length.
    fn is_fixed_length(&self) -> bool {
        self.fixed_length().is_some()
    }

    /// Normalize a value once before it is stored or used as a search key.
    fn preprocess(&self, value: Self::Value) -> Self::Value {
        value
    }

    /// Encode a value into a freshly allocated, exactly sized vector.
    fn serialize_to_vec(&self, value: &Self::Value) -> Vec<u8> {
        let mut buffer = vec![0u8; self.object_size(value)];
        self.serialize(value, &mut buffer, 0);
        buffer
    }
}

/// Type tags of the built-in codecs.
///
/// The numeric values are part of the on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SerializerId {
    Boolean = 1,
    Byte = 2,
    Char = 3,
    Date = 4,
    DateTime = 5,
    Double = 6,
    Float = 7,
    Integer = 8,
    Link = 9,
    Long = 10,
    Null = 11,
    Short = 12,
    String = 13,
    CompositeKey = 14,
    Binary = 17,
    Decimal = 18,
    Utf8 = 25,
    Uuid = 26,
}

impl SerializerId {
    /// Raw tag byte.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Encoded length for fixed-length codecs, `None` otherwise.
    #[must_use]
    pub const fn fixed_length(self) -> Option<usize> {
        match self {
            Self::Boolean | Self::Byte => Some(1),
            Self::Char | Self::Short => Some(2),
            Self::Integer | Self::Float => Some(4),
            Self::Date | Self::DateTime | Self::Double | Self::Link | Self::Long => Some(8),
            Self::Uuid => Some(16),
            Self::Null => Some(0),
            Self::String
            | Self::CompositeKey
            | Self::Binary
            | Self::Decimal
            | Self::Utf8 => None,
        }
    }
}

impl TryFrom<u8> for SerializerId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Boolean),
            2 => Ok(Self::Byte),
            3 => Ok(Self::Char),
            4 => Ok(Self::Date),
            5 => Ok(Self::DateTime),
            6 => Ok(Self::Double),
            7 => Ok(Self::Float),
            8 => Ok(Self::Integer),
            9 => Ok(Self::Link),
            10 => Ok(Self::Long),
            11 => Ok(Self::Null),
            12 => Ok(Self::Short),
            13 => Ok(Self::String),
            14 => Ok(Self::CompositeKey),
            17 => Ok(Self::Binary),
            18 => Ok(Self::Decimal),
            25 => Ok(Self::Utf8),
            26 => Ok(Self::Uuid),
            _ => Err(value),
        }
    }
}

impl std::fmt::Display for SerializerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}({})", self.as_u8())
    }
}

/// Read `N` bytes at `offset` into an array.
#[inline]
pub(crate) fn read_array<const N: usize>(buffer: &[u8], offset: usize) -> [u8; N] {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(&buffer[offset..offset + N]);
    bytes
}

/// Read a big-endian length prefix written as a signed 32-bit integer.
///
/// Negative prefixes never come out of a well-formed buffer and are read as zero.
#[inline]
pub(crate) fn read_len_prefix(buffer: &[u8], offset: usize) -> usize {
    usize::try_from(i32::from_be_bytes(read_array(buffer, offset))).unwrap_or(0)
}

/// Write a big-endian signed 32-bit length prefix.
#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)] // lengths are bounded by page size
pub(crate) fn write_len_prefix(buffer: &mut [u8], offset: usize, len: usize) {
    buffer[offset..offset + 4].copy_from_slice(&(len as i32).to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializer_id_conversion() {
        for id in [
            SerializerId::Boolean,
            SerializerId::Integer,
            SerializerId::CompositeKey,
            SerializerId::Utf8,
            SerializerId::Uuid,
        ] {
            assert_eq!(SerializerId::try_from(id.as_u8()), Ok(id));
        }
        assert_eq!(SerializerId::try_from(0), Err(0));
        assert_eq!(SerializerId::try_from(15), Err(15));
    }

    #[test]
    fn test_serializer_id_fixed_lengths_match_codecs() {
        assert_eq!(
            SerializerId::Integer.fixed_length(),
            IntegerSerializer.fixed_length()
        );
        assert_eq!(SerializerId::Long.fixed_length(), LongSerializer.fixed_length());
        assert_eq!(SerializerId::Uuid.fixed_length(), UuidSerializer.fixed_length());
        assert_eq!(
            SerializerId::String.fixed_length(),
            StringSerializer.fixed_length()
        );
        assert_eq!(SerializerId::Null.fixed_length(), NullSerializer.fixed_length());
    }

    #[test]
    fn test_shared_buffer_holds_several_values() {
        let mut buffer = vec![0u8; 64];
        let mut offset = 0;

        IntegerSerializer.serialize(&-7, &mut buffer, offset);
        offset += IntegerSerializer.object_size(&-7);
        let text = "shared".to_string();
        StringSerializer.serialize(&text, &mut buffer, offset);
        let text_offset = offset;
        offset += StringSerializer.object_size(&text);
        LongSerializer.serialize(&i64::MAX, &mut buffer, offset);

        assert_eq!(IntegerSerializer.deserialize(&buffer, 0), -7);
        assert_eq!(StringSerializer.deserialize(&buffer, text_offset), "shared");
        assert_eq!(LongSerializer.deserialize(&buffer, offset), i64::MAX);
    }
}
