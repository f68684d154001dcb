//! UUID codec.

use ::uuid::Uuid;

use super::{BinarySerializer, SerializerId, read_array};

/// 128-bit UUID as its 16 big-endian bytes (most significant half first).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UuidSerializer;

impl UuidSerializer {
    /// Encoded length in bytes.
    pub const SIZE: usize = 16;
}

impl BinarySerializer for UuidSerializer {
    type Value = Uuid;

    fn id(&self) -> SerializerId {
        SerializerId::Uuid
    }

    fn object_size(&self, _value: &Uuid) -> usize {
        Self::SIZE
    }

    fn object_size_in_buffer(&self, _buffer: &[u8], _offset: usize) -> usize {
        Self::SIZE
    }

    fn serialize(&self, value: &Uuid, buffer: &mut [u8], offset: usize) {
        buffer[offset..offset + Self::SIZE].copy_from_slice(value.as_bytes());
    }

    fn deserialize(&self, buffer: &[u8], offset: usize) -> Uuid {
        Uuid::from_bytes(read_array(buffer, offset))
    }

    fn fixed_length(&self) -> Option<usize> {
        Some(Self::SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_roundtrip() {
        for value in [Uuid::nil(), Uuid::from_u128(u128::MAX), Uuid::from_u128(0x0123_4567_89AB_CDEF)] {
            let bytes = UuidSerializer.serialize_to_vec(&value);
            assert_eq!(UuidSerializer.deserialize(&bytes, 0), value);
        }
    }

    #[test]
    fn test_uuid_most_significant_first() {
        let bytes = UuidSerializer.serialize_to_vec(&Uuid::from_u128(1));
        assert_eq!(bytes[15], 1);
        assert!(bytes[..15].iter().all(|b| *b == 0));
    }
}
