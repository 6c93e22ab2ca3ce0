use std::cmp::Ordering;

/// Compares two fixed-width binary keys.
pub type KeyComparator = fn(&[u8], &[u8]) -> Ordering;

/// Lexicographic byte order. Numeric keys keep their natural order when
/// encoded big-endian.
pub fn default_comparator(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}
