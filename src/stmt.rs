//! Statements, comparison definitions, and read views.
//!
//! A statement is a single versioned write: a key, an optional value and the
//! LSN it was committed at. A missing value is a DELETE tombstone. Every
//! structure the scheduler moves around (memtables, runs, slices) is a
//! sorted collection of statements ordered by key ascending, then LSN
//! descending, so the newest version of a key always comes first.

use std::cmp::Ordering;
use std::sync::RwLock;

use itertools::Itertools;

/// A single versioned write. `value == None` is a DELETE tombstone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Statement {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub lsn: i64,
}

impl Statement {
    pub fn replace(key: Vec<u8>, value: Vec<u8>, lsn: i64) -> Self {
        Self {
            key,
            value: Some(value),
            lsn,
        }
    }

    pub fn delete(key: Vec<u8>, lsn: i64) -> Self {
        Self {
            key,
            value: None,
            lsn,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }

    /// Approximate in-memory footprint, used for accounting.
    pub fn size(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, |v| v.len()) + 8
    }
}

/// Build the surrogate DELETE that propagates the removal of `old` to
/// secondary indexes: a tombstone carrying the primary-key part of the old
/// statement's key, stamped with the LSN of the statement that shadowed it.
pub fn surrogate_delete(key_def: &KeyDef, old: &Statement, lsn: i64) -> Statement {
    Statement::delete(key_def.extract(&old.key).to_vec(), lsn)
}

/// Comparison/key definition of an index.
///
/// `cmp_def` compares full statement keys; `key_def` extracts the
/// primary-key part used when building surrogate deletes. Both are cheap to
/// clone, and every task clones them at construction so a concurrent schema
/// alter cannot change the ordering under a running worker.
#[derive(Clone, Debug, Default)]
pub struct KeyDef {
    prefix: Option<usize>,
}

impl KeyDef {
    /// Definition covering the whole key.
    pub fn new() -> Self {
        Self { prefix: None }
    }

    /// Definition covering only the first `len` bytes of the key.
    pub fn with_prefix(len: usize) -> Self {
        Self { prefix: Some(len) }
    }

    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.extract(a).cmp(self.extract(b))
    }

    pub fn extract<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        match self.prefix {
            Some(n) if n < key.len() => &key[..n],
            _ => key,
        }
    }
}

/// The set of active read views.
///
/// A read view is the LSN snapshot a long-running reader holds; statement
/// versions visible to any active read view must survive dump and
/// compaction. The write iterator snapshots this set when it starts.
#[derive(Debug, Default)]
pub struct ReadViewSet {
    views: RwLock<Vec<i64>>,
}

impl ReadViewSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, lsn: i64) {
        self.views.write().unwrap().push(lsn);
    }

    pub fn close(&self, lsn: i64) {
        let mut views = self.views.write().unwrap();
        if let Some(pos) = views.iter().position(|&v| v == lsn) {
            views.swap_remove(pos);
        }
    }

    /// Sorted snapshot of the active read-view LSNs, oldest first.
    pub fn snapshot(&self) -> Vec<i64> {
        self.views
            .read()
            .unwrap()
            .iter()
            .copied()
            .sorted()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_kinds() {
        let put = Statement::replace(b"a".to_vec(), b"1".to_vec(), 5);
        let del = Statement::delete(b"a".to_vec(), 6);
        assert!(!put.is_delete());
        assert!(del.is_delete());
        assert!(put.size() > del.size());
    }

    #[test]
    fn test_key_def_prefix() {
        let full = KeyDef::new();
        let pk = KeyDef::with_prefix(2);

        assert_eq!(full.compare(b"abc", b"abd"), Ordering::Less);
        assert_eq!(pk.compare(b"abc", b"abd"), Ordering::Equal);
        assert_eq!(pk.extract(b"abcd"), b"ab");
        assert_eq!(pk.extract(b"a"), b"a");
    }

    #[test]
    fn test_surrogate_delete() {
        let key_def = KeyDef::with_prefix(1);
        let old = Statement::replace(b"k-rest".to_vec(), b"v".to_vec(), 10);
        let surrogate = surrogate_delete(&key_def, &old, 42);
        assert_eq!(surrogate, Statement::delete(b"k".to_vec(), 42));
    }

    #[test]
    fn test_read_view_snapshot_sorted() {
        let views = ReadViewSet::new();
        views.open(30);
        views.open(10);
        views.open(20);
        assert_eq!(views.snapshot(), vec![10, 20, 30]);

        views.close(20);
        assert_eq!(views.snapshot(), vec![10, 30]);
    }
}
