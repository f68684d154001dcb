//! String codecs.
//!
//! Two encodings exist:
//!
//! ```text
//! StringSerializer:  | len: i32 (code units) | len x u16 UTF-16 code units |
//! Utf8Serializer:    | len: u16 (bytes)      | len bytes of UTF-8          |
//! ```
//!
//! All integers are big-endian.

use super::{BinarySerializer, SerializerId, read_array, read_len_prefix, write_len_prefix};

/// Length-prefixed UTF-16 string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StringSerializer;

impl StringSerializer {
    /// Size of the code unit count prefix.
    const PREFIX_SIZE: usize = 4;
}

impl BinarySerializer for StringSerializer {
    type Value = String;

    fn id(&self) -> SerializerId {
        SerializerId::String
    }

    fn object_size(&self, value: &String) -> usize {
        Self::PREFIX_SIZE + value.encode_utf16().count() * 2
    }

    fn object_size_in_buffer(&self, buffer: &[u8], offset: usize) -> usize {
        Self::PREFIX_SIZE + read_len_prefix(buffer, offset) * 2
    }

    fn serialize(&self, value: &String, buffer: &mut [u8], offset: usize) {
        let mut position = offset + Self::PREFIX_SIZE;
        for unit in value.encode_utf16() {
            buffer[position..position + 2].copy_from_slice(&unit.to_be_bytes());
            position += 2;
        }
        write_len_prefix(buffer, offset, (position - offset - Self::PREFIX_SIZE) / 2);
    }

    fn deserialize(&self, buffer: &[u8], offset: usize) -> String {
        let len = read_len_prefix(buffer, offset);
        let start = offset + Self::PREFIX_SIZE;
        let units: Vec<u16> = (0..len)
            .map(|i| u16::from_be_bytes(read_array(buffer, start + i * 2)))
            .collect();
        String::from_utf16_lossy(&units)
    }

    fn fixed_length(&self) -> Option<usize> {
        None
    }
}

/// Length-prefixed UTF-8 string, at most [`Utf8Serializer::MAX_LENGTH`] bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Utf8Serializer;

impl Utf8Serializer {
    /// Largest encodable string, in bytes.
    pub const MAX_LENGTH: usize = u16::MAX as usize;

    /// Size of the byte count prefix.
    const PREFIX_SIZE: usize = 2;
}

impl BinarySerializer for Utf8Serializer {
    type Value = String;

    fn id(&self) -> SerializerId {
        SerializerId::Utf8
    }

    fn object_size(&self, value: &String) -> usize {
        Self::PREFIX_SIZE + value.len()
    }

    fn object_size_in_buffer(&self, buffer: &[u8], offset: usize) -> usize {
        Self::PREFIX_SIZE + usize::from(u16::from_be_bytes(read_array(buffer, offset)))
    }

    fn serialize(&self, value: &String, buffer: &mut [u8], offset: usize) {
        let len = u16::try_from(value.len()).unwrap_or_else(|_| {
            panic!(
                "UTF-8 string of {} bytes exceeds the {} byte limit",
                value.len(),
                Self::MAX_LENGTH
            )
        });
        buffer[offset..offset + Self::PREFIX_SIZE].copy_from_slice(&len.to_be_bytes());
        let start = offset + Self::PREFIX_SIZE;
        buffer[start..start + value.len()].copy_from_slice(value.as_bytes());
    }

    fn deserialize(&self, buffer: &[u8], offset: usize) -> String {
        let len = usize::from(u16::from_be_bytes(read_array(buffer, offset)));
        let start = offset + Self::PREFIX_SIZE;
        String::from_utf8_lossy(&buffer[start..start + len]).into_owned()
    }

    fn fixed_length(&self) -> Option<usize> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip<S: BinarySerializer<Value = String>>(serializer: &S, value: &str) -> String {
        let value = value.to_string();
        let bytes = serializer.serialize_to_vec(&value);
        assert_eq!(serializer.object_size_in_buffer(&bytes, 0), bytes.len());
        serializer.deserialize(&bytes, 0)
    }

    #[test]
    fn test_utf16_layout() {
        let bytes = StringSerializer.serialize_to_vec(&"ab".to_string());
        assert_eq!(bytes, vec![0, 0, 0, 2, 0, b'a', 0, b'b']);
    }

    #[test]
    fn test_utf16_boundaries() {
        for value in ["", "\0", "a\0b", "héllo", "中文字符", "emoji 😀 pair"] {
            assert_eq!(roundtrip(&StringSerializer, value), value);
        }
        // A surrogate pair takes two code units.
        assert_eq!(StringSerializer.object_size(&"😀".to_string()), 4 + 4);
    }

    #[test]
    fn test_utf8_layout() {
        let bytes = Utf8Serializer.serialize_to_vec(&"é".to_string());
        assert_eq!(bytes, vec![0, 2, 0xC3, 0xA9]);
    }

    #[test]
    fn test_utf8_boundaries() {
        for value in ["", "\0", "héllo", "中文字符", "😀"] {
            assert_eq!(roundtrip(&Utf8Serializer, value), value);
        }
        let longest = "x".repeat(Utf8Serializer::MAX_LENGTH);
        assert_eq!(roundtrip(&Utf8Serializer, &longest), longest);
    }

    #[test]
    #[should_panic(expected = "exceeds the 65535 byte limit")]
    fn test_utf8_too_long_panics() {
        let value = "x".repeat(Utf8Serializer::MAX_LENGTH + 1);
        let mut buffer = vec![0u8; value.len() + 2];
        Utf8Serializer.serialize(&value, &mut buffer, 0);
    }

    proptest! {
        #[test]
        fn prop_utf16_roundtrip(value in any::<String>()) {
            prop_assert_eq!(roundtrip(&StringSerializer, &value), value.clone());
            prop_assert_eq!(
                StringSerializer.object_size(&value),
                StringSerializer.object_size_in_buffer(&StringSerializer.serialize_to_vec(&value), 0)
            );
        }

        #[test]
        fn prop_utf8_roundtrip(value in "\\PC{0,64}") {
            prop_assert_eq!(roundtrip(&Utf8Serializer, &value), value);
        }
    }
}
