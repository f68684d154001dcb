//! Composite key codec.
//!
//! ```text
//! | total size: i32 | item count: i32 | (type tag: u8, item bytes)* |
//! ```
//!
//! The total size covers the whole encoding including both prefixes. Each item
//! is written by the codec its type tag names.

use crate::key::{CompositeKey, KeyItem};

use super::{
    BinarySerializer, BinaryTypeSerializer, BooleanSerializer, ByteSerializer, CharSerializer,
    DateSerializer, DateTimeSerializer, DecimalSerializer, DoubleSerializer, FloatSerializer,
    IntegerSerializer, LinkSerializer, LongSerializer, SerializerId, ShortSerializer,
    StringSerializer, UuidSerializer, read_len_prefix, write_len_prefix,
};

/// Size of the two 4-byte prefixes.
const HEADER_SIZE: usize = 8;

/// Codec for [`CompositeKey`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompositeKeySerializer;

fn item_size(item: &KeyItem) -> usize {
    match item {
        KeyItem::Boolean(v) => BooleanSerializer.object_size(v),
        KeyItem::Byte(v) => ByteSerializer.object_size(v),
        KeyItem::Short(v) => ShortSerializer.object_size(v),
        KeyItem::Integer(v) => IntegerSerializer.object_size(v),
        KeyItem::Long(v) => LongSerializer.object_size(v),
        KeyItem::Float(v) => FloatSerializer.object_size(v),
        KeyItem::Double(v) => DoubleSerializer.object_size(v),
        KeyItem::Char(v) => CharSerializer.object_size(v),
        KeyItem::Date(v) => DateSerializer.object_size(v),
        KeyItem::DateTime(v) => DateTimeSerializer.object_size(v),
        KeyItem::Decimal(v) => DecimalSerializer.object_size(v),
        KeyItem::Uuid(v) => UuidSerializer.object_size(v),
        KeyItem::Binary(v) => BinaryTypeSerializer.object_size(v),
        KeyItem::String(v) => StringSerializer.object_size(v),
        KeyItem::Link(v) => LinkSerializer.object_size(v),
        KeyItem::AlwaysLess | KeyItem::AlwaysGreater => {
            panic!("search sentinel {item:?} cannot be serialized")
        }
    }
}

fn write_item(item: &KeyItem, buffer: &mut [u8], offset: usize) {
    match item {
        KeyItem::Boolean(v) => BooleanSerializer.serialize(v, buffer, offset),
        KeyItem::Byte(v) => ByteSerializer.serialize(v, buffer, offset),
        KeyItem::Short(v) => ShortSerializer.serialize(v, buffer, offset),
        KeyItem::Integer(v) => IntegerSerializer.serialize(v, buffer, offset),
        KeyItem::Long(v) => LongSerializer.serialize(v, buffer, offset),
        KeyItem::Float(v) => FloatSerializer.serialize(v, buffer, offset),
        KeyItem::Double(v) => DoubleSerializer.serialize(v, buffer, offset),
        KeyItem::Char(v) => CharSerializer.serialize(v, buffer, offset),
        KeyItem::Date(v) => DateSerializer.serialize(v, buffer, offset),
        KeyItem::DateTime(v) => DateTimeSerializer.serialize(v, buffer, offset),
        KeyItem::Decimal(v) => DecimalSerializer.serialize(v, buffer, offset),
        KeyItem::Uuid(v) => UuidSerializer.serialize(v, buffer, offset),
        KeyItem::Binary(v) => BinaryTypeSerializer.serialize(v, buffer, offset),
        KeyItem::String(v) => StringSerializer.serialize(v, buffer, offset),
        KeyItem::Link(v) => LinkSerializer.serialize(v, buffer, offset),
        KeyItem::AlwaysLess | KeyItem::AlwaysGreater => {
            panic!("search sentinel {item:?} cannot be serialized")
        }
    }
}

/// Decode one item, returning it with its encoded length.
fn read_item(id: SerializerId, buffer: &[u8], offset: usize) -> (KeyItem, usize) {
    fn read<S: BinarySerializer>(
        serializer: &S,
        buffer: &[u8],
        offset: usize,
        wrap: fn(S::Value) -> KeyItem,
    ) -> (KeyItem, usize) {
        (
            wrap(serializer.deserialize(buffer, offset)),
            serializer.object_size_in_buffer(buffer, offset),
        )
    }

    match id {
        SerializerId::Boolean => read(&BooleanSerializer, buffer, offset, KeyItem::Boolean),
        SerializerId::Byte => read(&ByteSerializer, buffer, offset, KeyItem::Byte),
        SerializerId::Short => read(&ShortSerializer, buffer, offset, KeyItem::Short),
        SerializerId::Integer => read(&IntegerSerializer, buffer, offset, KeyItem::Integer),
        SerializerId::Long => read(&LongSerializer, buffer, offset, KeyItem::Long),
        SerializerId::Float => read(&FloatSerializer, buffer, offset, KeyItem::Float),
        SerializerId::Double => read(&DoubleSerializer, buffer, offset, KeyItem::Double),
        SerializerId::Char => read(&CharSerializer, buffer, offset, KeyItem::Char),
        SerializerId::Date => read(&DateSerializer, buffer, offset, KeyItem::Date),
        SerializerId::DateTime => read(&DateTimeSerializer, buffer, offset, KeyItem::DateTime),
        SerializerId::Decimal => read(&DecimalSerializer, buffer, offset, KeyItem::Decimal),
        SerializerId::Uuid => read(&UuidSerializer, buffer, offset, KeyItem::Uuid),
        SerializerId::Binary => read(&BinaryTypeSerializer, buffer, offset, KeyItem::Binary),
        SerializerId::String => read(&StringSerializer, buffer, offset, KeyItem::String),
        SerializerId::Link => read(&LinkSerializer, buffer, offset, KeyItem::Link),
        SerializerId::Utf8 | SerializerId::Null | SerializerId::CompositeKey => {
            panic!("{id} is not a valid composite key item type")
        }
    }
}

impl BinarySerializer for CompositeKeySerializer {
    type Value = CompositeKey;

    fn id(&self) -> SerializerId {
        SerializerId::CompositeKey
    }

    fn object_size(&self, value: &CompositeKey) -> usize {
        HEADER_SIZE + value.items().iter().map(|item| 1 + item_size(item)).sum::<usize>()
    }

    fn object_size_in_buffer(&self, buffer: &[u8], offset: usize) -> usize {
        read_len_prefix(buffer, offset)
    }

    fn serialize(&self, value: &CompositeKey, buffer: &mut [u8], offset: usize) {
        let mut position = offset + HEADER_SIZE;
        for item in value.items() {
            let Some(id) = item.serializer_id() else {
                panic!("search sentinel {item:?} cannot be serialized")
            };
            buffer[position] = id.as_u8();
            position += 1;
            write_item(item, buffer, position);
            position += item_size(item);
        }
        write_len_prefix(buffer, offset, position - offset);
        write_len_prefix(buffer, offset + 4, value.len());
    }

    fn deserialize(&self, buffer: &[u8], offset: usize) -> CompositeKey {
        let count = read_len_prefix(buffer, offset + 4);
        let mut items = Vec::with_capacity(count);
        let mut position = offset + HEADER_SIZE;
        for _ in 0..count {
            let tag = buffer[position];
            let id = SerializerId::try_from(tag)
                .unwrap_or_else(|tag| panic!("unknown composite key item type tag {tag}"));
            let (item, len) = read_item(id, buffer, position + 1);
            items.push(item);
            position += 1 + len;
        }
        CompositeKey::new(items)
    }

    fn fixed_length(&self) -> Option<usize> {
        None
    }

    fn preprocess(&self, value: CompositeKey) -> CompositeKey {
        let items = value
            .items()
            .iter()
            .map(|item| match item {
                KeyItem::Date(v) => KeyItem::Date(DateSerializer.preprocess(*v)),
                KeyItem::Char(v) => KeyItem::Char(CharSerializer.preprocess(*v)),
                other => other.clone(),
            })
            .collect();
        CompositeKey::new(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::Decimal;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn roundtrip(key: &CompositeKey) -> CompositeKey {
        let bytes = CompositeKeySerializer.serialize_to_vec(key);
        assert_eq!(CompositeKeySerializer.object_size_in_buffer(&bytes, 0), bytes.len());
        CompositeKeySerializer.deserialize(&bytes, 0)
    }

    #[test]
    fn test_layout() {
        let key = CompositeKey::default().with(1i32).with(true);
        let bytes = CompositeKeySerializer.serialize_to_vec(&key);
        assert_eq!(
            bytes,
            vec![0, 0, 0, 15, 0, 0, 0, 2, 8, 0, 0, 0, 1, 1, 1]
        );
    }

    #[test]
    fn test_mixed_items_roundtrip() {
        let key = CompositeKey::default()
            .with("name")
            .with(42i64)
            .with(-3i16)
            .with(Decimal::new(-12345, 3))
            .with(Uuid::from_u128(99))
            .with(vec![1u8, 2, 3])
            .with(2.5f64)
            .with('q');
        let restored = roundtrip(&key);
        assert_eq!(restored, key);
        assert!(matches!(restored.items()[1], KeyItem::Long(42)));
    }

    #[test]
    fn test_empty_key() {
        let key = CompositeKey::default();
        assert_eq!(CompositeKeySerializer.object_size(&key), HEADER_SIZE);
        assert_eq!(roundtrip(&key), key);
    }

    #[test]
    #[should_panic(expected = "cannot be serialized")]
    fn test_sentinel_is_rejected() {
        let key = CompositeKey::new(vec![KeyItem::Integer(1), KeyItem::AlwaysGreater]);
        let _ = CompositeKeySerializer.serialize_to_vec(&key);
    }

    proptest! {
        #[test]
        fn prop_composite_roundtrip(a in any::<i32>(), b in "\\PC{0,16}", c in any::<i64>()) {
            let key = CompositeKey::default().with(a).with(b).with(c);
            let bytes = CompositeKeySerializer.serialize_to_vec(&key);
            prop_assert_eq!(CompositeKeySerializer.object_size(&key), bytes.len());
            prop_assert_eq!(CompositeKeySerializer.deserialize(&bytes, 0), key);
        }
    }
}
