//! Fixed-length codecs for booleans, integers, floats and characters.

use super::{BinarySerializer, SerializerId, read_array};

/// Implements [`BinarySerializer`] for a fixed-width primitive with a
/// big-endian byte representation.
macro_rules! fixed_width_serializer {
    ($(#[$meta:meta])* $name:ident, $value:ty, $id:expr, $width:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name;

        impl $name {
            /// Encoded length in bytes.
            pub const SIZE: usize = $width;
        }

        impl BinarySerializer for $name {
            type Value = $value;

            fn id(&self) -> SerializerId {
                $id
            }

            fn object_size(&self, _value: &Self::Value) -> usize {
                Self::SIZE
            }

            fn object_size_in_buffer(&self, _buffer: &[u8], _offset: usize) -> usize {
                Self::SIZE
            }

            fn serialize(&self, value: &Self::Value, buffer: &mut [u8], offset: usize) {
                buffer[offset..offset + Self::SIZE].copy_from_slice(&value.to_be_bytes());
            }

            fn deserialize(&self, buffer: &[u8], offset: usize) -> Self::Value {
                <$value>::from_be_bytes(read_array(buffer, offset))
            }

            fn fixed_length(&self) -> Option<usize> {
                Some(Self::SIZE)
            }
        }
    };
}

fixed_width_serializer!(
    /// Signed 8-bit integer.
    ByteSerializer,
    i8,
    SerializerId::Byte,
    1
);
fixed_width_serializer!(
    /// Signed 16-bit integer.
    ShortSerializer,
    i16,
    SerializerId::Short,
    2
);
fixed_width_serializer!(
    /// Signed 32-bit integer, four bytes most significant first.
    IntegerSerializer,
    i32,
    SerializerId::Integer,
    4
);
fixed_width_serializer!(
    /// Signed 64-bit integer, eight bytes most significant first.
    LongSerializer,
    i64,
    SerializerId::Long,
    8
);
fixed_width_serializer!(
    /// IEEE-754 single precision, encoded through its bit pattern.
    FloatSerializer,
    f32,
    SerializerId::Float,
    4
);
fixed_width_serializer!(
    /// IEEE-754 double precision, encoded through its bit pattern.
    DoubleSerializer,
    f64,
    SerializerId::Double,
    8
);
fixed_width_serializer!(
    /// Page link: an unsigned page index stored in eight bytes.
    LinkSerializer,
    u64,
    SerializerId::Link,
    8
);

/// Single-byte boolean: `1` for true, `0` for false.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BooleanSerializer;

impl BinarySerializer for BooleanSerializer {
    type Value = bool;

    fn id(&self) -> SerializerId {
        SerializerId::Boolean
    }

    fn object_size(&self, _value: &bool) -> usize {
        1
    }

    fn object_size_in_buffer(&self, _buffer: &[u8], _offset: usize) -> usize {
        1
    }

    fn serialize(&self, value: &bool, buffer: &mut [u8], offset: usize) {
        buffer[offset] = u8::from(*value);
    }

    fn deserialize(&self, buffer: &[u8], offset: usize) -> bool {
        buffer[offset] > 0
    }

    fn fixed_length(&self) -> Option<usize> {
        Some(1)
    }
}

/// A character stored as one UTF-16 code unit.
///
/// Characters outside the Basic Multilingual Plane have no single-unit
/// encoding; `preprocess` replaces them with U+FFFD.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharSerializer;

impl BinarySerializer for CharSerializer {
    type Value = char;

    fn id(&self) -> SerializerId {
        SerializerId::Char
    }

    fn object_size(&self, _value: &char) -> usize {
        2
    }

    fn object_size_in_buffer(&self, _buffer: &[u8], _offset: usize) -> usize {
        2
    }

    fn serialize(&self, value: &char, buffer: &mut [u8], offset: usize) {
        let unit = u16::try_from(u32::from(*value)).unwrap_or(0xFFFD);
        buffer[offset..offset + 2].copy_from_slice(&unit.to_be_bytes());
    }

    fn deserialize(&self, buffer: &[u8], offset: usize) -> char {
        let unit = u16::from_be_bytes(read_array(buffer, offset));
        char::from_u32(u32::from(unit)).unwrap_or(char::REPLACEMENT_CHARACTER)
    }

    fn fixed_length(&self) -> Option<usize> {
        Some(2)
    }

    fn preprocess(&self, value: char) -> char {
        if u32::from(value) > 0xFFFF {
            char::REPLACEMENT_CHARACTER
        } else {
            value
        }
    }
}
