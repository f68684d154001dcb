//! Date and date-time codecs.
//!
//! Both store milliseconds since the Unix epoch as a big-endian `i64`. The
//! date codec additionally truncates values to UTC midnight in `preprocess`,
//! so two date-times on the same day map to the same date key.

use chrono::{DateTime, NaiveTime, Utc};

use super::{BinarySerializer, SerializerId, read_array};

/// Encoded length of both temporal codecs.
const SIZE: usize = 8;

fn write_millis(value: &DateTime<Utc>, buffer: &mut [u8], offset: usize) {
    buffer[offset..offset + SIZE].copy_from_slice(&value.timestamp_millis().to_be_bytes());
}

fn read_millis(buffer: &[u8], offset: usize) -> DateTime<Utc> {
    let millis = i64::from_be_bytes(read_array(buffer, offset));
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Instant with millisecond precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateTimeSerializer;

impl BinarySerializer for DateTimeSerializer {
    type Value = DateTime<Utc>;

    fn id(&self) -> SerializerId {
        SerializerId::DateTime
    }

    fn object_size(&self, _value: &DateTime<Utc>) -> usize {
        SIZE
    }

    fn object_size_in_buffer(&self, _buffer: &[u8], _offset: usize) -> usize {
        SIZE
    }

    fn serialize(&self, value: &DateTime<Utc>, buffer: &mut [u8], offset: usize) {
        write_millis(value, buffer, offset);
    }

    fn deserialize(&self, buffer: &[u8], offset: usize) -> DateTime<Utc> {
        read_millis(buffer, offset)
    }

    fn fixed_length(&self) -> Option<usize> {
        Some(SIZE)
    }
}

/// Calendar day, stored as the instant of its UTC midnight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateSerializer;

impl BinarySerializer for DateSerializer {
    type Value = DateTime<Utc>;

    fn id(&self) -> SerializerId {
        SerializerId::Date
    }

    fn object_size(&self, _value: &DateTime<Utc>) -> usize {
        SIZE
    }

    fn object_size_in_buffer(&self, _buffer: &[u8], _offset: usize) -> usize {
        SIZE
    }

    fn serialize(&self, value: &DateTime<Utc>, buffer: &mut [u8], offset: usize) {
        write_millis(&self.preprocess(*value), buffer, offset);
    }

    fn deserialize(&self, buffer: &[u8], offset: usize) -> DateTime<Utc> {
        read_millis(buffer, offset)
    }

    fn fixed_length(&self) -> Option<usize> {
        Some(SIZE)
    }

    fn preprocess(&self, value: DateTime<Utc>) -> DateTime<Utc> {
        value
            .date_naive()
            .and_time(NaiveTime::MIN)
            .and_utc()
    }
}
