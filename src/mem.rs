//! In-memory trees (memtables).
//!
//! A memtable is a sorted in-memory collection of statements built on a
//! concurrent skip list, so transactions can insert while background code
//! iterates. Each memtable carries the *generation* it was created at: the
//! scheduler dumps all sealed memtables of a generation in one round and
//! only then advances to the next.
//!
//! Lifecycle: Active (accepts writes) → Sealed (rotated out, immutable,
//! queued on the LSM tree) → Destroyed (after the dump covering its
//! generation commits). Only the coordinator seals and destroys memtables.
//!
//! Writers pin the memtable for the duration of an insert; the dump task
//! constructor waits for those pins to drain before handing the memtable to
//! a worker, which is what makes the contents immutable for the worker's
//! lifetime.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;
use tokio::sync::Notify;

use crate::error::Result;
use crate::stmt::Statement;
use crate::Error;

/// Composite skip-list key: statements sort by key ascending, then LSN
/// descending, so the newest version of a key is encountered first.
#[derive(Clone, Debug, PartialEq, Eq)]
struct MemKey {
    key: Vec<u8>,
    lsn: i64,
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.lsn.cmp(&self.lsn))
    }
}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
pub struct Memtable {
    data: SkipMap<MemKey, Option<Vec<u8>>>,
    generation: i64,
    dump_lsn: AtomicI64,
    count: AtomicUsize,
    sealed: AtomicBool,
    pins: AtomicUsize,
    unpinned: Notify,
}

impl Memtable {
    pub fn new(generation: i64) -> Self {
        Self {
            data: SkipMap::new(),
            generation,
            dump_lsn: AtomicI64::new(-1),
            count: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
            pins: AtomicUsize::new(0),
            unpinned: Notify::new(),
        }
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    /// Max LSN of any statement inserted, or -1 when empty. Recorded on the
    /// run produced by the dump covering this memtable.
    pub fn dump_lsn(&self) -> i64 {
        self.dump_lsn.load(Ordering::SeqCst)
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn insert(&self, stmt: Statement) -> Result<()> {
        if self.sealed.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        self.dump_lsn.fetch_max(stmt.lsn, Ordering::SeqCst);
        self.data.insert(
            MemKey {
                key: stmt.key,
                lsn: stmt.lsn,
            },
            stmt.value,
        );
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Seal the memtable, rejecting further writes.
    pub fn seal(&self) -> Result<()> {
        if self.sealed.swap(true, Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Writer pin, held across an insert.
    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unpin(&self) {
        if self.pins.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.unpinned.notify_waiters();
        }
    }

    pub fn pin_count(&self) -> usize {
        self.pins.load(Ordering::SeqCst)
    }

    /// Wait until all writer pins are released.
    pub async fn wait_pinned(&self) {
        loop {
            let notified = self.unpinned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pins.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Lazily iterate all statements in (key asc, lsn desc) order.
    pub fn iter(self: &Arc<Self>) -> MemIterator {
        MemIterator {
            mem: Arc::clone(self),
            last: None,
            done: false,
        }
    }
}

/// Cursor-style iterator that re-queries the skip list for each step, so it
/// does not borrow the map and can be sent to a worker.
pub struct MemIterator {
    mem: Arc<Memtable>,
    last: Option<MemKey>,
    done: bool,
}

impl Iterator for MemIterator {
    type Item = Result<Statement>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        use std::ops::Bound;
        let range = match &self.last {
            Some(key) => (Bound::Excluded(key.clone()), Bound::Unbounded),
            None => (Bound::Unbounded, Bound::Unbounded),
        };
        match self.mem.data.range(range).next() {
            Some(entry) => {
                let key = entry.key().clone();
                let stmt = Statement {
                    key: key.key.clone(),
                    value: entry.value().clone(),
                    lsn: key.lsn,
                };
                self.last = Some(key);
                Some(Ok(stmt))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmts(mem: &Arc<Memtable>) -> Vec<Statement> {
        mem.iter().collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn test_insert_and_iterate_sorted() {
        let mem = Arc::new(Memtable::new(0));
        mem.insert(Statement::replace(b"b".to_vec(), b"2".to_vec(), 2))
            .unwrap();
        mem.insert(Statement::replace(b"a".to_vec(), b"1".to_vec(), 1))
            .unwrap();
        mem.insert(Statement::delete(b"a".to_vec(), 3)).unwrap();

        let out = stmts(&mem);
        assert_eq!(out.len(), 3);
        // Key "a" first, newest version (lsn 3) before older (lsn 1).
        assert_eq!(out[0], Statement::delete(b"a".to_vec(), 3));
        assert_eq!(out[1], Statement::replace(b"a".to_vec(), b"1".to_vec(), 1));
        assert_eq!(out[2], Statement::replace(b"b".to_vec(), b"2".to_vec(), 2));
        assert_eq!(mem.dump_lsn(), 3);
    }

    #[test]
    fn test_seal_rejects_writes() {
        let mem = Memtable::new(0);
        mem.seal().unwrap();
        assert!(matches!(mem.seal(), Err(Error::ReadOnly)));
        assert!(matches!(
            mem.insert(Statement::delete(b"k".to_vec(), 1)),
            Err(Error::ReadOnly)
        ));
    }

    #[tokio::test]
    async fn test_wait_pinned() {
        let mem = Arc::new(Memtable::new(0));
        mem.pin();

        let waiter = {
            let mem = Arc::clone(&mem);
            tokio::spawn(async move {
                mem.wait_pinned().await;
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        mem.unpin();
        waiter.await.unwrap();
        assert_eq!(mem.pin_count(), 0);
    }

    #[test]
    fn test_empty_memtable() {
        let mem = Arc::new(Memtable::new(7));
        assert!(mem.is_empty());
        assert_eq!(mem.dump_lsn(), -1);
        assert_eq!(mem.generation(), 7);
        assert!(stmts(&mem).is_empty());
    }
}
