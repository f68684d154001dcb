//! Opaque byte blobs.

use super::{BinarySerializer, SerializerId, read_len_prefix, write_len_prefix};

/// Byte array with a 4-byte big-endian length prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinaryTypeSerializer;

impl BinarySerializer for BinaryTypeSerializer {
    type Value = Vec<u8>;

    fn id(&self) -> SerializerId {
        SerializerId::Binary
    }

    fn object_size(&self, value: &Vec<u8>) -> usize {
        4 + value.len()
    }

    fn object_size_in_buffer(&self, buffer: &[u8], offset: usize) -> usize {
        4 + read_len_prefix(buffer, offset)
    }

    fn serialize(&self, value: &Vec<u8>, buffer: &mut [u8], offset: usize) {
        write_len_prefix(buffer, offset, value.len());
        buffer[offset + 4..offset + 4 + value.len()].copy_from_slice(value);
    }

    fn deserialize(&self, buffer: &[u8], offset: usize) -> Vec<u8> {
        let len = read_len_prefix(buffer, offset);
        buffer[offset + 4..offset + 4 + len].to_vec()
    }

    fn fixed_length(&self) -> Option<usize> {
        None
    }
}
