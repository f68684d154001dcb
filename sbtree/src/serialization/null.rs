//! The void codec.

use super::{BinarySerializer, SerializerId};

/// Encodes `()` in zero bytes.
///
/// Used for indexes that only record key presence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NullSerializer;

impl BinarySerializer for NullSerializer {
    type Value = ();

    fn id(&self) -> SerializerId {
        SerializerId::Null
    }

    fn object_size(&self, _value: &()) -> usize {
        0
    }

    fn object_size_in_buffer(&self, _buffer: &[u8], _offset: usize) -> usize {
        0
    }

    fn serialize(&self, _value: &(), _buffer: &mut [u8], _offset: usize) {}

    fn deserialize(&self, _buffer: &[u8], _offset: usize) {}

    fn fixed_length(&self) -> Option<usize> {
        Some(0)
    }
}
