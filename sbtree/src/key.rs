//! Key ordering for the tree.
//!
//! Keys are compared with their `Ord` implementation. Single-valued keys use
//! the natural order of the Rust type. Composite keys ([`CompositeKey`]) compare
//! item by item, and may contain the [`KeyItem::AlwaysLess`] and
//! [`KeyItem::AlwaysGreater`] sentinels, which sort below and above every
//! real value. A partial composite key padded with sentinels brackets the
//! contiguous range of full keys that share its prefix.
//!
//! # Invariants
//!
//! - `KeyItem` equality is defined through `cmp`, so `Integer(1) == Long(1)`.
//! - Sentinels are search-only values; they are never serialized.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveTime, Utc};
use uuid::Uuid;

use crate::serialization::{Decimal, SerializerId};

/// How missing trailing fields of a partial composite key are filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialSearchMode {
    /// Leave the key as given.
    None,
    /// Pad with [`KeyItem::AlwaysGreater`], placing the key after every match.
    HighestBoundary,
    /// Pad with [`KeyItem::AlwaysLess`], placing the key before every match.
    LowestBoundary,
}

/// Declared type of one composite key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Boolean,
    Byte,
    Short,
    Integer,
    Long,
    Float,
    Double,
    Char,
    Date,
    DateTime,
    Decimal,
    Uuid,
    Binary,
    String,
    Link,
}

/// Ordering contract for keys stored in a tree.
pub trait TreeKey: Ord + Clone + std::fmt::Debug + Send + Sync {
    /// Pad a partial key up to `arity` fields for a range bound.
    ///
    /// Only composite keys have fields to pad.
    #[must_use]
    fn enhance(&self, _arity: usize, _mode: PartialSearchMode) -> Self {
        self.clone()
    }

    /// Coerce fields to the declared key types.
    #[must_use]
    fn coerce(self, _types: &[KeyType]) -> Self {
        self
    }

    /// Whether the key holds a search sentinel and so can only bound a range.
    fn has_sentinel(&self) -> bool {
        false
    }
}

macro_rules! plain_tree_key {
    ($($ty:ty),* $(,)?) => {
        $(impl TreeKey for $ty {})*
    };
}

plain_tree_key!(
    bool,
    i8,
    i16,
    i32,
    i64,
    u64,
    char,
    String,
    Vec<u8>,
    Uuid,
    DateTime<Utc>,
    Decimal,
);

/// One field of a composite key.
#[derive(Debug, Clone)]
pub enum KeyItem {
    /// Sorts before every other item.
    AlwaysLess,
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    Date(DateTime<Utc>),
    DateTime(DateTime<Utc>),
    Decimal(Decimal),
    Uuid(Uuid),
    Binary(Vec<u8>),
    String(String),
    Link(u64),
    /// Sorts after every other item.
    AlwaysGreater,
}

/// Comparison class: items of different classes order by class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Class {
    Least,
    Boolean,
    Number,
    Char,
    Temporal,
    String,
    Binary,
    Uuid,
    Link,
    Greatest,
}

impl KeyItem {
    /// Type tag of the codec used for this item inside a composite key.
    ///
    /// `None` for the sentinels.
    #[must_use]
    pub const fn serializer_id(&self) -> Option<SerializerId> {
        Some(match self {
            Self::AlwaysLess | Self::AlwaysGreater => return None,
            Self::Boolean(_) => SerializerId::Boolean,
            Self::Byte(_) => SerializerId::Byte,
            Self::Short(_) => SerializerId::Short,
            Self::Integer(_) => SerializerId::Integer,
            Self::Long(_) => SerializerId::Long,
            Self::Float(_) => SerializerId::Float,
            Self::Double(_) => SerializerId::Double,
            Self::Char(_) => SerializerId::Char,
            Self::Date(_) => SerializerId::Date,
            Self::DateTime(_) => SerializerId::DateTime,
            Self::Decimal(_) => SerializerId::Decimal,
            Self::Uuid(_) => SerializerId::Uuid,
            Self::Binary(_) => SerializerId::Binary,
            Self::String(_) => SerializerId::String,
            Self::Link(_) => SerializerId::Link,
        })
    }

    /// Whether this item is one of the search sentinels.
    #[must_use]
    pub const fn is_sentinel(&self) -> bool {
        matches!(self, Self::AlwaysLess | Self::AlwaysGreater)
    }

    const fn class(&self) -> Class {
        match self {
            Self::AlwaysLess => Class::Least,
            Self::Boolean(_) => Class::Boolean,
            Self::Byte(_)
            | Self::Short(_)
            | Self::Integer(_)
            | Self::Long(_)
            | Self::Float(_)
            | Self::Double(_)
            | Self::Decimal(_) => Class::Number,
            Self::Char(_) => Class::Char,
            Self::Date(_) | Self::DateTime(_) => Class::Temporal,
            Self::String(_) => Class::String,
            Self::Binary(_) => Class::Binary,
            Self::Uuid(_) => Class::Uuid,
            Self::Link(_) => Class::Link,
            Self::AlwaysGreater => Class::Greatest,
        }
    }

    fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Byte(v) => Some(i64::from(*v)),
            Self::Short(v) => Some(i64::from(*v)),
            Self::Integer(v) => Some(i64::from(*v)),
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    #[allow(clippy::cast_precision_loss)] // mixed float comparisons are approximate
    fn as_float(&self) -> f64 {
        match self {
            Self::Float(v) => f64::from(*v),
            Self::Double(v) => *v,
            Self::Decimal(d) => d.unscaled() as f64 / 10f64.powi(d.scale()),
            other => other.as_integer().map_or(0.0, |v| v as f64),
        }
    }

    fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Decimal(d) => Some(*d),
            other => other.as_integer().map(|v| Decimal::new(i128::from(v), 0)),
        }
    }

    fn compare_numbers(&self, other: &Self) -> Ordering {
        if let (Some(a), Some(b)) = (self.as_integer(), other.as_integer()) {
            return a.cmp(&b);
        }
        if let (Some(a), Some(b)) = (self.as_decimal(), other.as_decimal()) {
            return a.cmp(&b);
        }
        self.as_float().total_cmp(&other.as_float())
    }

    /// Convert this item to `ty` when the value fits the target type.
    ///
    /// Date-times narrow to their day. Items that cannot be converted are
    /// returned unchanged.
    #[must_use]
    pub fn convert(self, ty: KeyType) -> Self {
        let converted = match (&self, ty) {
            (Self::DateTime(v), KeyType::Date) => Some(Self::Date(
                v.date_naive().and_time(NaiveTime::MIN).and_utc(),
            )),
            (Self::Date(v), KeyType::DateTime) => Some(Self::DateTime(*v)),
            (Self::Float(v), KeyType::Double) => Some(Self::Double(f64::from(*v))),
            (item, KeyType::Byte) => item
                .as_integer()
                .and_then(|v| i8::try_from(v).ok())
                .map(Self::Byte),
            (item, KeyType::Short) => item
                .as_integer()
                .and_then(|v| i16::try_from(v).ok())
                .map(Self::Short),
            (item, KeyType::Integer) => item
                .as_integer()
                .and_then(|v| i32::try_from(v).ok())
                .map(Self::Integer),
            (item, KeyType::Long) => item.as_integer().map(Self::Long),
            (item, KeyType::Decimal) => item.as_decimal().map(Self::Decimal),
            (Self::Long(v), KeyType::Link) => u64::try_from(*v).ok().map(Self::Link),
            _ => None,
        };
        converted.unwrap_or(self)
    }
}

impl PartialEq for KeyItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyItem {}

impl PartialOrd for KeyItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyItem {
    fn cmp(&self, other: &Self) -> Ordering {
        let (left, right) = (self.class(), other.class());
        if left != right {
            return left.cmp(&right);
        }
        match (self, other) {
            (Self::Boolean(a), Self::Boolean(b)) => a.cmp(b),
            (Self::Char(a), Self::Char(b)) => a.cmp(b),
            (Self::Date(a) | Self::DateTime(a), Self::Date(b) | Self::DateTime(b)) => a.cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Binary(a), Self::Binary(b)) => a.cmp(b),
            (Self::Uuid(a), Self::Uuid(b)) => a.cmp(b),
            (Self::Link(a), Self::Link(b)) => a.cmp(b),
            _ if left == Class::Number => self.compare_numbers(other),
            // Same sentinel on both sides.
            _ => Ordering::Equal,
        }
    }
}

macro_rules! key_item_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for KeyItem {
            fn from(value: $ty) -> Self {
                Self::$variant(value)
            }
        })*
    };
}

key_item_from!(
    bool => Boolean,
    i8 => Byte,
    i16 => Short,
    i32 => Integer,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    char => Char,
    DateTime<Utc> => DateTime,
    Decimal => Decimal,
    Uuid => Uuid,
    Vec<u8> => Binary,
    String => String,
);

impl From<&str> for KeyItem {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

/// An ordered tuple of key items.
///
/// Ordering is lexicographic; a strict prefix sorts before its extensions.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct CompositeKey {
    items: Vec<KeyItem>,
}

impl CompositeKey {
    /// Create a composite key from its items.
    #[must_use]
    pub const fn new(items: Vec<KeyItem>) -> Self {
        Self { items }
    }

    /// Append an item.
    pub fn push(&mut self, item: impl Into<KeyItem>) {
        self.items.push(item.into());
    }

    /// Builder-style [`CompositeKey::push`].
    #[must_use]
    pub fn with(mut self, item: impl Into<KeyItem>) -> Self {
        self.push(item);
        self
    }

    /// The key items in order.
    #[must_use]
    pub fn items(&self) -> &[KeyItem] {
        &self.items
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the key has no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl From<Vec<KeyItem>> for CompositeKey {
    fn from(items: Vec<KeyItem>) -> Self {
        Self::new(items)
    }
}

impl TreeKey for CompositeKey {
    fn enhance(&self, arity: usize, mode: PartialSearchMode) -> Self {
        let mut enhanced = self.clone();
        let filler = match mode {
            PartialSearchMode::None => return enhanced,
            PartialSearchMode::HighestBoundary => KeyItem::AlwaysGreater,
            PartialSearchMode::LowestBoundary => KeyItem::AlwaysLess,
        };
        while enhanced.items.len() < arity {
            enhanced.items.push(filler.clone());
        }
        enhanced
    }

    fn coerce(self, types: &[KeyType]) -> Self {
        let items = self
            .items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match types.get(i) {
                Some(ty) => item.convert(*ty),
                None => item,
            })
            .collect();
        Self { items }
    }

    fn has_sentinel(&self) -> bool {
        self.items.iter().any(KeyItem::is_sentinel)
    }
}
