//! Scheduler priority heaps.
//!
//! The coordinator keeps two heaps over all registered LSM trees. The
//! *dump heap* orders trees so that the one whose dump makes the most
//! forward progress is on top; the *compact heap* orders trees by how much
//! read amplification a compaction would shave off. Each tree records its
//! position inside both heaps so delete and update-in-place are O(log n)
//! without a lookup table. Both heaps are owned by the coordinator and
//! mutated only on its task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::lsm::LsmTree;

pub const NOT_IN_HEAP: usize = usize::MAX;

/// Position of an item inside one heap, stored on the item itself.
#[derive(Debug)]
pub struct HeapPos(AtomicUsize);

impl HeapPos {
    pub fn new() -> Self {
        Self(AtomicUsize::new(NOT_IN_HEAP))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, pos: usize) {
        self.0.store(pos, Ordering::SeqCst);
    }

    pub fn in_heap(&self) -> bool {
        self.get() != NOT_IN_HEAP
    }
}

impl Default for HeapPos {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapKind {
    Dump,
    Compact,
}

pub struct LsmHeap {
    kind: HeapKind,
    items: Vec<Arc<LsmTree>>,
}

impl LsmHeap {
    pub fn new(kind: HeapKind) -> Self {
        Self {
            kind,
            items: Vec::new(),
        }
    }

    fn pos_of<'a>(&self, lsm: &'a LsmTree) -> &'a HeapPos {
        match self.kind {
            HeapKind::Dump => &lsm.in_dump,
            HeapKind::Compact => &lsm.in_compact,
        }
    }

    fn less(&self, a: &LsmTree, b: &LsmTree) -> bool {
        match self.kind {
            HeapKind::Dump => dump_less(a, b),
            HeapKind::Compact => compact_less(a, b),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn top(&self) -> Option<Arc<LsmTree>> {
        self.items.first().cloned()
    }

    pub fn insert(&mut self, lsm: Arc<LsmTree>) {
        debug_assert!(!self.pos_of(&lsm).in_heap());
        let pos = self.items.len();
        self.pos_of(&lsm).set(pos);
        self.items.push(lsm);
        self.sift_up(pos);
    }

    pub fn delete(&mut self, lsm: &LsmTree) {
        let pos = self.pos_of(lsm).get();
        if pos == NOT_IN_HEAP {
            return;
        }
        self.pos_of(lsm).set(NOT_IN_HEAP);
        let last = self.items.len() - 1;
        self.items.swap(pos, last);
        self.items.pop();
        if pos < self.items.len() {
            self.pos_of(&self.items[pos].clone()).set(pos);
            let pos = self.sift_up(pos);
            self.sift_down(pos);
        }
    }

    /// Restore heap order after the item's ordering keys changed.
    pub fn update(&mut self, lsm: &LsmTree) {
        let pos = self.pos_of(lsm).get();
        if pos == NOT_IN_HEAP {
            return;
        }
        let pos = self.sift_up(pos);
        self.sift_down(pos);
    }

    fn sift_up(&mut self, mut pos: usize) -> usize {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.less(&self.items[pos], &self.items[parent]) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
        pos
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = 2 * pos + 2;
            let mut best = pos;
            if left < self.items.len() && self.less(&self.items[left], &self.items[best]) {
                best = left;
            }
            if right < self.items.len() && self.less(&self.items[right], &self.items[best]) {
                best = right;
            }
            if best == pos {
                return;
            }
            self.swap(pos, best);
            pos = best;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.items.swap(a, b);
        self.pos_of(&self.items[a].clone()).set(a);
        self.pos_of(&self.items[b].clone()).set(b);
    }
}

/// Dump order, in precedence: trees not currently dumping first, then lower
/// pin count, then older generation, then secondary indexes before the
/// primary of the same space. A space with more than one index must replay
/// its primary last on recovery, so the primary is always dumped after the
/// secondaries of the same generation.
fn dump_less(a: &LsmTree, b: &LsmTree) -> bool {
    if a.is_dumping() != b.is_dumping() {
        return !a.is_dumping();
    }
    if a.pin_count() != b.pin_count() {
        return a.pin_count() < b.pin_count();
    }
    let a_generation = a.generation();
    let b_generation = b.generation();
    if a_generation != b_generation {
        return a_generation < b_generation;
    }
    a.index_id() > b.index_id()
}

/// Compact order: decreasing compaction priority.
fn compact_less(a: &LsmTree, b: &LsmTree) -> bool {
    a.compact_priority() > b.compact_priority()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LsmOpts;
    use crate::metalog::MetaLog;
    use crate::run::{Run, RunWriter, Slice};
    use crate::stmt::{KeyDef, Statement};
    use crate::tmpfs::TempDir;

    fn tree(log: &MetaLog, space_id: u32, index_id: u32, generation: i64) -> Arc<LsmTree> {
        LsmTree::new(
            log,
            space_id,
            index_id,
            LsmOpts::default(),
            KeyDef::new(),
            KeyDef::new(),
            generation,
        )
    }

    /// Attach `n` one-statement slices to the tree's single range.
    fn add_slices(dir: &TempDir, log: &MetaLog, lsm: &Arc<LsmTree>, n: usize) {
        let range = lsm.ranges()[0].clone();
        for _ in 0..n {
            let run_id = log.next_id();
            let path = dir.path().join(format!("{:016}.run", run_id));
            let mut writer = RunWriter::create(&path, 4096, 0.05).unwrap();
            writer
                .append_stmt(&Statement::replace(b"k".to_vec(), b"v".to_vec(), 1))
                .unwrap();
            let info = writer.commit().unwrap();
            let run = Arc::new(Run::new(run_id, path));
            run.commit_info(info);
            range.add_slice(Slice::new(log.next_id(), run, None, None));
        }
    }

    #[test]
    fn test_dump_heap_orders_by_generation() {
        let dir = TempDir::new().unwrap();
        let log = MetaLog::open(dir.path().join("META")).unwrap();
        let old = tree(&log, 1, 0, 0);
        let new = tree(&log, 2, 0, 5);

        let mut heap = LsmHeap::new(HeapKind::Dump);
        heap.insert(new.clone());
        heap.insert(old.clone());
        assert_eq!(heap.top().unwrap().id(), old.id());

        heap.delete(&old);
        assert_eq!(heap.top().unwrap().id(), new.id());
        assert!(!old.in_dump.in_heap());
    }

    #[test]
    fn test_dump_heap_secondary_before_primary() {
        let dir = TempDir::new().unwrap();
        let log = MetaLog::open(dir.path().join("META")).unwrap();
        let pk = tree(&log, 1, 0, 0);
        let sk = tree(&log, 1, 1, 0);

        let mut heap = LsmHeap::new(HeapKind::Dump);
        heap.insert(pk.clone());
        heap.insert(sk.clone());
        assert_eq!(heap.top().unwrap().id(), sk.id());

        // A pinned primary sinks below everything unpinned.
        pk.pin();
        heap.update(&pk);
        assert_eq!(heap.top().unwrap().id(), sk.id());

        // Once the secondary is dumping it moves off the top.
        sk.set_dumping(true);
        heap.update(&sk);
        pk.unpin();
        heap.update(&pk);
        assert_eq!(heap.top().unwrap().id(), pk.id());
    }

    #[test]
    fn test_compact_heap_orders_by_priority() {
        let dir = TempDir::new().unwrap();
        let log = MetaLog::open(dir.path().join("META")).unwrap();
        let quiet = tree(&log, 1, 0, 0);
        let busy = tree(&log, 2, 0, 0);
        add_slices(&dir, &log, &busy, 2);
        busy.force_compaction();
        assert_eq!(busy.compact_priority(), 2);

        let mut heap = LsmHeap::new(HeapKind::Compact);
        heap.insert(quiet.clone());
        heap.insert(busy.clone());
        assert_eq!(heap.top().unwrap().id(), busy.id());
    }

    #[test]
    fn test_update_in_place() {
        let dir = TempDir::new().unwrap();
        let log = MetaLog::open(dir.path().join("META")).unwrap();
        let a = tree(&log, 1, 0, 0);
        let b = tree(&log, 2, 0, 1);

        let mut heap = LsmHeap::new(HeapKind::Dump);
        heap.insert(a.clone());
        heap.insert(b.clone());
        assert_eq!(heap.top().unwrap().id(), a.id());

        // Dumping trees are moved off the top of the heap.
        a.set_dumping(true);
        heap.update(&a);
        assert_eq!(heap.top().unwrap().id(), b.id());

        a.set_dumping(false);
        heap.update(&a);
        assert_eq!(heap.top().unwrap().id(), a.id());
    }
}
