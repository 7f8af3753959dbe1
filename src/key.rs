//! Query keys and key matching.
//!
//! A [`QueryKey`] is both the identity of a cached query and a path that can be
//! matched by prefix. Segments compare structurally by value, so two keys built
//! independently from the same values are the same key.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// One segment of a [`QueryKey`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeySegment {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// String.
    Str(Arc<str>),
    /// Nested ordered sequence.
    List(Vec<KeySegment>),
    /// Nested record. Field order does not affect equality.
    Map(BTreeMap<String, KeySegment>),
}

impl fmt::Debug for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySegment::Null => write!(f, "null"),
            KeySegment::Bool(b) => write!(f, "{}", b),
            KeySegment::Int(i) => write!(f, "{}", i),
            KeySegment::Str(s) => write!(f, "{:?}", s),
            KeySegment::List(items) => f.debug_list().entries(items).finish(),
            KeySegment::Map(fields) => f.debug_map().entries(fields).finish(),
        }
    }
}

impl From<&str> for KeySegment {
    fn from(value: &str) -> Self {
        KeySegment::Str(value.into())
    }
}

impl From<String> for KeySegment {
    fn from(value: String) -> Self {
        KeySegment::Str(value.into())
    }
}

impl From<&String> for KeySegment {
    fn from(value: &String) -> Self {
        KeySegment::Str(value.as_str().into())
    }
}

impl From<Arc<str>> for KeySegment {
    fn from(value: Arc<str>) -> Self {
        KeySegment::Str(value)
    }
}

impl From<bool> for KeySegment {
    fn from(value: bool) -> Self {
        KeySegment::Bool(value)
    }
}

impl From<()> for KeySegment {
    fn from((): ()) -> Self {
        KeySegment::Null
    }
}

macro_rules! impl_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for KeySegment {
                fn from(value: $ty) -> Self {
                    KeySegment::Int(i64::from(value))
                }
            }
        )*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl<T: Into<KeySegment>> From<Option<T>> for KeySegment {
    fn from(value: Option<T>) -> Self {
        value.map_or(KeySegment::Null, Into::into)
    }
}

impl<T: Into<KeySegment>> From<Vec<T>> for KeySegment {
    fn from(value: Vec<T>) -> Self {
        KeySegment::List(value.into_iter().map(Into::into).collect())
    }
}

impl<K: Into<String>, V: Into<KeySegment>> FromIterator<(K, V)> for KeySegment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        KeySegment::Map(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<BTreeMap<String, KeySegment>> for KeySegment {
    fn from(value: BTreeMap<String, KeySegment>) -> Self {
        KeySegment::Map(value)
    }
}

/// Ordered, immutable sequence of segments identifying a query.
///
/// Cloning is cheap; the segments are shared.
///
/// # Example
///
/// ```
/// use query_cache::{query_key, QueryKey};
///
/// let key = query_key!["users", 1];
/// assert_eq!(key, QueryKey::new(["users"]).child(1));
/// assert!(key.starts_with(&query_key!["users"]));
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Arc<[KeySegment]>);

impl QueryKey {
    /// Create a key from its segments.
    pub fn new<I>(segments: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<KeySegment>,
    {
        QueryKey(segments.into_iter().map(Into::into).collect())
    }

    /// The key with no segments. As a filter it matches every key.
    pub fn empty() -> Self {
        QueryKey(Arc::from(Vec::new()))
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the key has no segments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The segments in order.
    pub fn segments(&self) -> &[KeySegment] {
        &self.0
    }

    /// Iterate over the segments.
    pub fn iter(&self) -> impl Iterator<Item = &KeySegment> + '_ {
        self.0.iter()
    }

    /// A new key with `segment` appended.
    #[must_use]
    pub fn child(&self, segment: impl Into<KeySegment>) -> Self {
        let mut segments = self.0.to_vec();
        segments.push(segment.into());
        QueryKey(segments.into())
    }

    /// Returns true if `prefix` matches the leading segments of this key.
    ///
    /// A prefix longer than the key never matches.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Default for QueryKey {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Into<KeySegment>, const N: usize> From<[T; N]> for QueryKey {
    fn from(segments: [T; N]) -> Self {
        QueryKey::new(segments)
    }
}

impl<T: Into<KeySegment>> From<Vec<T>> for QueryKey {
    fn from(segments: Vec<T>) -> Self {
        QueryKey::new(segments)
    }
}

impl<T: Into<KeySegment>> FromIterator<T> for QueryKey {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        QueryKey::new(iter)
    }
}

/// Build a [`QueryKey`] from a list of segment values.
///
/// ```
/// use query_cache::query_key;
///
/// let key = query_key!["todos", 3, true];
/// assert_eq!(key.len(), 3);
/// ```
#[macro_export]
macro_rules! query_key {
    () => {
        $crate::QueryKey::empty()
    };
    ($($segment:expr),+ $(,)?) => {
        $crate::QueryKey::new([$($crate::KeySegment::from($segment)),+])
    };
}

/// Match `candidate` against `filter`.
///
/// With `exact`, the keys must be identical. Otherwise `filter` must be a
/// prefix of `candidate`; an empty filter matches every key.
pub fn matches_key(candidate: &QueryKey, filter: &QueryKey, exact: bool) -> bool {
    if exact {
        candidate == filter
    } else {
        candidate.starts_with(filter)
    }
}

/// Evaluate `predicate` once against `query`.
pub fn matches_where<Q: ?Sized>(query: &Q, predicate: impl FnOnce(&Q) -> bool) -> bool {
    predicate(query)
}
