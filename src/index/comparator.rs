//! Key comparators for B+Tree indexes. An index stores the name of its
//! comparator in the meta page and resolves it through a
//! [`ComparatorRegistry`] when it is opened.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{QuillStoreError, QuillStoreResult};

pub trait FieldComparator: Debug + Send + Sync {
    /// Name persisted in index meta pages.
    fn name(&self) -> &str;

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Rejects keys this comparator cannot order.
    fn validate(&self, _key: &[u8]) -> QuillStoreResult<()> {
        Ok(())
    }
}

pub type ComparatorRef = Arc<dyn FieldComparator>;

/// Lexicographic byte order.
#[derive(Debug, Default)]
pub struct BytesComparator;

impl FieldComparator for BytesComparator {
    fn name(&self) -> &str {
        "bytes"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Reverse lexicographic byte order.
#[derive(Debug, Default)]
pub struct BytesDescComparator;

impl FieldComparator for BytesDescComparator {
    fn name(&self) -> &str {
        "bytes-desc"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        b.cmp(a)
    }
}

fn fixed_width<const N: usize>(name: &str, key: &[u8]) -> QuillStoreResult<[u8; N]> {
    key.try_into().map_err(|_| {
        QuillStoreError::IndexOperation(format!(
            "{} keys are {} bytes, got {}",
            name,
            N,
            key.len()
        ))
    })
}

/// Big-endian unsigned 64-bit integers.
#[derive(Debug, Default)]
pub struct U64Comparator;

impl FieldComparator for U64Comparator {
    fn name(&self) -> &str {
        "u64"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match (fixed_width::<8>("u64", a), fixed_width::<8>("u64", b)) {
            (Ok(a), Ok(b)) => u64::from_be_bytes(a).cmp(&u64::from_be_bytes(b)),
            _ => a.cmp(b),
        }
    }

    fn validate(&self, key: &[u8]) -> QuillStoreResult<()> {
        fixed_width::<8>("u64", key).map(|_| ())
    }
}

/// Big-endian two's complement 64-bit integers.
#[derive(Debug, Default)]
pub struct I64Comparator;

impl FieldComparator for I64Comparator {
    fn name(&self) -> &str {
        "i64"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match (fixed_width::<8>("i64", a), fixed_width::<8>("i64", b)) {
            (Ok(a), Ok(b)) => i64::from_be_bytes(a).cmp(&i64::from_be_bytes(b)),
            _ => a.cmp(b),
        }
    }

    fn validate(&self, key: &[u8]) -> QuillStoreResult<()> {
        fixed_width::<8>("i64", key).map(|_| ())
    }
}

/// Comparators known to a database, passed explicitly to every index open.
#[derive(Debug, Clone)]
pub struct ComparatorRegistry {
    comparators: BTreeMap<String, ComparatorRef>,
}

impl Default for ComparatorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(BytesComparator));
        registry.register(Arc::new(BytesDescComparator));
        registry.register(Arc::new(U64Comparator));
        registry.register(Arc::new(I64Comparator));
        registry
    }
}

impl ComparatorRegistry {
    pub fn empty() -> Self {
        Self {
            comparators: BTreeMap::new(),
        }
    }

    /// Adds or replaces the comparator registered under its name.
    pub fn register(&mut self, comparator: ComparatorRef) {
        self.comparators
            .insert(comparator.name().to_string(), comparator);
    }

    pub fn get(&self, name: &str) -> Option<ComparatorRef> {
        self.comparators.get(name).cloned()
    }

    pub fn resolve(&self, name: &str) -> QuillStoreResult<ComparatorRef> {
        self.get(name).ok_or_else(|| {
            QuillStoreError::IndexAccess(format!("unknown comparator '{}'", name))
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.comparators.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_orders() {
        let registry = ComparatorRegistry::default();
        assert_eq!(registry.names(), vec!["bytes", "bytes-desc", "i64", "u64"]);

        let desc = registry.resolve("bytes-desc").unwrap();
        assert_eq!(desc.compare(b"a", b"b"), Ordering::Greater);

        let signed = registry.resolve("i64").unwrap();
        let minus_one = (-1i64).to_be_bytes();
        let one = 1i64.to_be_bytes();
        assert_eq!(signed.compare(&minus_one, &one), Ordering::Less);

        let unsigned = registry.resolve("u64").unwrap();
        assert_eq!(
            unsigned.compare(&256u64.to_be_bytes(), &3u64.to_be_bytes()),
            Ordering::Greater
        );
        assert!(unsigned.validate(b"short").is_err());
    }

    #[test]
    fn unknown_comparator_is_an_access_error() {
        let registry = ComparatorRegistry::empty();
        assert!(matches!(
            registry.resolve("bytes"),
            Err(QuillStoreError::IndexAccess(_))
        ));
    }
}
