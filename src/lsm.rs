//! Per-index LSM tree state.
//!
//! One `LsmTree` exists per index: an active memtable, a queue of sealed
//! memtables awaiting dump, the set of on-disk runs, and an ordered map of
//! ranges partitioning the key space. All of it is mutated only by the
//! coordinator; workers see only the task-copied key definitions and the
//! immutable memtables and slices they were handed.
//!
//! A tree with `is_dropped` set holds no heap positions and receives no new
//! tasks; `is_dumping` is true iff exactly one dump task for the tree is
//! outstanding.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::LsmOpts;
use crate::error::Result;
use crate::heap::HeapPos;
use crate::mem::Memtable;
use crate::metalog::{LogRecord, MetaLog};
use crate::range::Range;
use crate::run::{Run, Slice};
use crate::stmt::{KeyDef, Statement};

pub struct LsmTree {
    id: i64,
    space_id: u32,
    index_id: u32,
    name: String,
    opts: LsmOpts,
    cmp_def: RwLock<KeyDef>,
    key_def: RwLock<KeyDef>,

    mem: RwLock<Arc<Memtable>>,
    /// Sealed memtables, newest first.
    sealed: RwLock<VecDeque<Arc<Memtable>>>,
    runs: Mutex<Vec<Arc<Run>>>,
    /// Ranges keyed by begin key; `None` is the unbounded left edge.
    ranges: Mutex<BTreeMap<Option<Vec<u8>>, Arc<Range>>>,

    dump_lsn: AtomicI64,
    is_dropped: AtomicBool,
    is_dumping: AtomicBool,
    pin_count: AtomicUsize,
    compact_priority: AtomicUsize,
    /// Primary index of the same space; set on secondary indexes only.
    pk: RwLock<Option<Arc<LsmTree>>>,

    pub(crate) in_dump: HeapPos,
    pub(crate) in_compact: HeapPos,
}

impl LsmTree {
    /// Create a tree with a single range spanning the whole key space and
    /// an empty active memtable at `generation`. Ids come from the metadata
    /// log sequence.
    pub fn new(
        log: &MetaLog,
        space_id: u32,
        index_id: u32,
        opts: LsmOpts,
        cmp_def: KeyDef,
        key_def: KeyDef,
        generation: i64,
    ) -> Arc<Self> {
        let id = log.next_id();
        let range = Range::new(log.next_id(), None, None);
        let mut ranges = BTreeMap::new();
        ranges.insert(None, range);
        Arc::new(Self {
            id,
            space_id,
            index_id,
            name: format!("{}/{}", space_id, index_id),
            opts,
            cmp_def: RwLock::new(cmp_def),
            key_def: RwLock::new(key_def),
            mem: RwLock::new(Arc::new(Memtable::new(generation))),
            sealed: RwLock::new(VecDeque::new()),
            runs: Mutex::new(Vec::new()),
            ranges: Mutex::new(ranges),
            dump_lsn: AtomicI64::new(-1),
            is_dropped: AtomicBool::new(false),
            is_dumping: AtomicBool::new(false),
            pin_count: AtomicUsize::new(0),
            compact_priority: AtomicUsize::new(1),
            pk: RwLock::new(None),
            in_dump: HeapPos::new(),
            in_compact: HeapPos::new(),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn space_id(&self) -> u32 {
        self.space_id
    }

    pub fn index_id(&self) -> u32 {
        self.index_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn opts(&self) -> &LsmOpts {
        &self.opts
    }

    pub fn cmp_def(&self) -> KeyDef {
        self.cmp_def.read().unwrap().clone()
    }

    pub fn key_def(&self) -> KeyDef {
        self.key_def.read().unwrap().clone()
    }

    /// Swap the key definitions on schema alter. Running tasks keep the
    /// copies they took at construction.
    pub fn set_key_defs(&self, cmp_def: KeyDef, key_def: KeyDef) {
        *self.cmp_def.write().unwrap() = cmp_def;
        *self.key_def.write().unwrap() = key_def;
    }

    pub fn set_pk(&self, pk: Arc<LsmTree>) {
        *self.pk.write().unwrap() = Some(pk);
    }

    pub fn pk(&self) -> Option<Arc<LsmTree>> {
        self.pk.read().unwrap().clone()
    }

    /// Generation of the oldest in-memory tree.
    pub fn generation(&self) -> i64 {
        let sealed = self.sealed.read().unwrap();
        match sealed.back() {
            Some(oldest) => oldest.generation(),
            None => self.mem.read().unwrap().generation(),
        }
    }

    pub fn active_generation(&self) -> i64 {
        self.mem.read().unwrap().generation()
    }

    pub fn active_mem(&self) -> Arc<Memtable> {
        self.mem.read().unwrap().clone()
    }

    /// Insert a statement into the active memtable. This is the seam the
    /// transactional engine writes through.
    pub fn insert(&self, stmt: Statement) -> Result<()> {
        let mem = self.active_mem();
        mem.insert(stmt)
    }

    /// Seal the active memtable and start a fresh one at `generation`.
    pub fn rotate_mem(&self, generation: i64) {
        let mut mem = self.mem.write().unwrap();
        let old = std::mem::replace(&mut *mem, Arc::new(Memtable::new(generation)));
        drop(mem);
        let _ = old.seal();
        self.sealed.write().unwrap().push_front(old);
    }

    /// Sealed memtables, newest first.
    pub fn sealed_mems(&self) -> Vec<Arc<Memtable>> {
        self.sealed.read().unwrap().iter().cloned().collect()
    }

    pub fn delete_mem(&self, mem: &Arc<Memtable>) {
        self.sealed
            .write()
            .unwrap()
            .retain(|m| !Arc::ptr_eq(m, mem));
    }

    pub fn add_run(&self, run: Arc<Run>) {
        self.runs.lock().unwrap().push(run);
    }

    pub fn remove_run(&self, run: &Arc<Run>) {
        self.runs.lock().unwrap().retain(|r| !Arc::ptr_eq(r, run));
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }

    pub fn runs(&self) -> Vec<Arc<Run>> {
        self.runs.lock().unwrap().clone()
    }

    pub fn dump_lsn(&self) -> i64 {
        self.dump_lsn.load(Ordering::SeqCst)
    }

    pub fn set_dump_lsn(&self, lsn: i64) {
        self.dump_lsn.fetch_max(lsn, Ordering::SeqCst);
    }

    pub fn is_dropped(&self) -> bool {
        self.is_dropped.load(Ordering::SeqCst)
    }

    pub fn mark_dropped(&self) {
        self.is_dropped.store(true, Ordering::SeqCst);
    }

    pub fn is_dumping(&self) -> bool {
        self.is_dumping.load(Ordering::SeqCst)
    }

    pub fn set_dumping(&self, dumping: bool) {
        self.is_dumping.store(dumping, Ordering::SeqCst);
    }

    pub fn pin(&self) -> usize {
        self.pin_count.fetch_add(1, Ordering::SeqCst)
    }

    pub fn unpin(&self) -> usize {
        self.pin_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn pin_count(&self) -> usize {
        self.pin_count.load(Ordering::SeqCst)
    }

    pub fn ranges(&self) -> Vec<Arc<Range>> {
        self.ranges.lock().unwrap().values().cloned().collect()
    }

    pub fn range_count(&self) -> usize {
        self.ranges.lock().unwrap().len()
    }

    /// The range containing `key`. The ranges partition the key space, so
    /// this is total as long as the tree has any range.
    pub fn find_range(&self, key: &[u8]) -> Option<Arc<Range>> {
        let ranges = self.ranges.lock().unwrap();
        ranges
            .range(..=Some(key.to_vec()))
            .next_back()
            .map(|(_, r)| r.clone())
    }

    /// Ranges whose interval intersects `[min, max]`, in key order.
    pub fn ranges_overlapping(&self, min: &[u8], max: &[u8]) -> Vec<Arc<Range>> {
        let ranges = self.ranges.lock().unwrap();
        let mut out = Vec::new();
        for range in ranges.values() {
            if let Some(end) = range.end() {
                if end.as_slice() <= min {
                    continue;
                }
            }
            if let Some(begin) = range.begin() {
                if begin.as_slice() > max {
                    break;
                }
            }
            out.push(range.clone());
        }
        out
    }

    /// Best compaction candidate: the highest-priority range not already
    /// owned by a task.
    pub fn max_priority_range(&self) -> Option<Arc<Range>> {
        self.ranges
            .lock()
            .unwrap()
            .values()
            .filter(|r| !r.is_scheduled())
            .max_by_key(|r| r.compact_priority())
            .cloned()
    }

    /// Cached maximum compaction priority over schedulable ranges. This is
    /// what the scheduler's compact heap orders trees by.
    pub fn compact_priority(&self) -> usize {
        self.compact_priority.load(Ordering::SeqCst)
    }

    pub fn update_compact_priority(&self) {
        let max = self
            .ranges
            .lock()
            .unwrap()
            .values()
            .filter(|r| !r.is_scheduled())
            .map(|r| r.compact_priority())
            .max()
            .unwrap_or(1);
        self.compact_priority.store(max.max(1), Ordering::SeqCst);
    }

    /// Mark every range as requiring compaction regardless of its layout.
    pub fn force_compaction(&self) {
        for range in self.ranges() {
            range.set_needs_compaction(true);
            range.update_compact_priority(&self.opts);
        }
        self.update_compact_priority();
    }

    /// Split an oversized range in two at a key taken from the block index
    /// of its largest slice. Returns false when the range is not worth
    /// splitting or no usable split key exists.
    pub fn split_range(&self, log: &MetaLog, range: &Arc<Range>) -> bool {
        if range.is_scheduled() {
            return false;
        }
        if range.stmt_count() < self.opts.range_size.saturating_mul(2) {
            return false;
        }
        let slices = range.slices();
        let Some(largest) = slices.iter().max_by_key(|s| s.count()) else {
            return false;
        };
        let Some(info) = largest.run().info() else {
            return false;
        };
        if info.blocks.len() < 2 {
            return false;
        }
        let mid = info.blocks[info.blocks.len() / 2].first_key.clone();
        if !range.contains(&mid) || range.begin().map(|b| b.as_slice()) == Some(mid.as_slice()) {
            return false;
        }

        let left = Range::new(log.next_id(), range.begin().cloned(), Some(mid.clone()));
        let right = Range::new(log.next_id(), Some(mid.clone()), range.end().cloned());

        log.tx_begin();
        for slice in &slices {
            log.append(LogRecord::DeleteSlice {
                slice_id: slice.id(),
            });
        }
        let mut halves: Vec<(Arc<Range>, Vec<Arc<Slice>>)> = Vec::new();
        for part in [left, right] {
            let mut part_slices = Vec::new();
            for slice in &slices {
                let Some((begin, end)) = clip_interval(
                    slice.begin().map(|b| b.as_slice()),
                    slice.end().map(|e| e.as_slice()),
                    part.begin().map(|b| b.as_slice()),
                    part.end().map(|e| e.as_slice()),
                ) else {
                    continue;
                };
                let slice_id = log.next_id();
                log.append(LogRecord::InsertSlice {
                    range_id: part.id(),
                    run_id: slice.run().id(),
                    slice_id,
                    begin: begin.clone(),
                    end: end.clone(),
                });
                part_slices.push(Slice::new(slice_id, slice.run().clone(), begin, end));
            }
            halves.push((part, part_slices));
        }
        if let Err(e) = log.tx_commit() {
            tracing::warn!(lsm = %self.name, range = %range, error = %e, "range split not logged");
            return false;
        }

        let mut ranges = self.ranges.lock().unwrap();
        ranges.remove(&range.begin().cloned());
        for (part, part_slices) in halves {
            part.set_slices(part_slices);
            part.update_compact_priority(&self.opts);
            part.bump_version();
            ranges.insert(part.begin().cloned(), part);
        }
        drop(ranges);
        self.update_compact_priority();
        tracing::info!(lsm = %self.name, range = %range, "split range in two");
        true
    }

    /// Merge an undersized range with its successor. Returns false when the
    /// pair is still large enough or the successor is busy.
    pub fn coalesce_range(&self, log: &MetaLog, range: &Arc<Range>) -> bool {
        if range.is_scheduled() {
            return false;
        }
        let Some(end) = range.end().cloned() else {
            return false;
        };
        let next = match self.ranges.lock().unwrap().get(&Some(end.clone())) {
            Some(next) => next.clone(),
            None => return false,
        };
        if next.is_scheduled() {
            return false;
        }
        if (range.stmt_count() + next.stmt_count()).saturating_mul(2) >= self.opts.range_size {
            return false;
        }

        let merged = Range::new(log.next_id(), range.begin().cloned(), next.end().cloned());
        // Slice ids are monotone, so id order is age order: newest first.
        let mut slices = range.slices();
        slices.extend(next.slices());
        slices.sort_by_key(|s| std::cmp::Reverse(s.id()));

        log.tx_begin();
        for slice in &slices {
            log.append(LogRecord::DeleteSlice {
                slice_id: slice.id(),
            });
            log.append(LogRecord::InsertSlice {
                range_id: merged.id(),
                run_id: slice.run().id(),
                slice_id: slice.id(),
                begin: slice.begin().cloned(),
                end: slice.end().cloned(),
            });
        }
        if let Err(e) = log.tx_commit() {
            tracing::warn!(lsm = %self.name, range = %range, error = %e, "range coalesce not logged");
            return false;
        }

        let mut ranges = self.ranges.lock().unwrap();
        ranges.remove(&range.begin().cloned());
        ranges.remove(&Some(end));
        merged.set_slices(slices);
        merged.update_compact_priority(&self.opts);
        merged.bump_version();
        ranges.insert(merged.begin().cloned(), merged.clone());
        drop(ranges);
        self.update_compact_priority();
        tracing::info!(lsm = %self.name, range = %merged, "coalesced range with successor");
        true
    }
}

/// Intersection of two half-open intervals, `None` bounds being infinite.
/// Returns `None` when the intersection is empty.
#[allow(clippy::type_complexity)]
fn clip_interval(
    a_begin: Option<&[u8]>,
    a_end: Option<&[u8]>,
    b_begin: Option<&[u8]>,
    b_end: Option<&[u8]>,
) -> Option<(Option<Vec<u8>>, Option<Vec<u8>>)> {
    let begin = match (a_begin, b_begin) {
        (Some(a), Some(b)) => Some(std::cmp::max(a, b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };
    let end = match (a_end, b_end) {
        (Some(a), Some(b)) => Some(std::cmp::min(a, b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };
    if let (Some(begin), Some(end)) = (begin, end) {
        if begin >= end {
            return None;
        }
    }
    Some((begin.map(|b| b.to_vec()), end.map(|e| e.to_vec())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunWriter;
    use crate::tmpfs::TempDir;

    fn new_tree(dir: &TempDir, opts: LsmOpts) -> (MetaLog, Arc<LsmTree>) {
        let log = MetaLog::open(dir.path().join("META")).unwrap();
        let tree = LsmTree::new(&log, 512, 0, opts, KeyDef::new(), KeyDef::new(), 0);
        (log, tree)
    }

    fn slice_from_stmts(
        dir: &TempDir,
        log: &MetaLog,
        keys: std::ops::Range<usize>,
        page_size: usize,
    ) -> Arc<Slice> {
        let run_id = log.next_id();
        let path = dir.path().join(format!("{:016}.run", run_id));
        let mut writer = RunWriter::create(&path, page_size, 0.05).unwrap();
        for i in keys {
            writer
                .append_stmt(&Statement::replace(
                    format!("key_{:06}", i).into_bytes(),
                    b"v".to_vec(),
                    i as i64 + 1,
                ))
                .unwrap();
        }
        let info = writer.commit().unwrap();
        let run = Arc::new(Run::new(run_id, path));
        run.commit_info(info);
        Slice::new(log.next_id(), run, None, None)
    }

    #[test]
    fn test_generation_tracks_oldest_mem() {
        let dir = TempDir::new().unwrap();
        let (_log, tree) = new_tree(&dir, LsmOpts::default());
        assert_eq!(tree.generation(), 0);

        tree.insert(Statement::replace(b"a".to_vec(), b"1".to_vec(), 1))
            .unwrap();
        tree.rotate_mem(1);
        assert_eq!(tree.generation(), 0, "sealed memtable holds the floor");
        assert_eq!(tree.active_generation(), 1);

        let sealed = tree.sealed_mems();
        assert_eq!(sealed.len(), 1);
        tree.delete_mem(&sealed[0]);
        assert_eq!(tree.generation(), 1);
    }

    #[test]
    fn test_find_range_after_split() {
        let dir = TempDir::new().unwrap();
        let (log, tree) = new_tree(&dir, LsmOpts::default().range_size(10));

        let range = tree.find_range(b"key_000050").unwrap();
        // A slice big enough to trip the 2x range_size threshold, written
        // with a small page size so the block index has a usable mid key.
        let slice = slice_from_stmts(&dir, &log, 0..100, 256);
        range.add_slice(slice);

        assert!(tree.split_range(&log, &range));
        assert_eq!(tree.range_count(), 2);

        let ranges = tree.ranges();
        assert_eq!(ranges[0].begin(), None);
        assert!(ranges[0].end().is_some());
        assert_eq!(ranges[1].begin(), ranges[0].end());
        assert_eq!(ranges[1].end(), None);

        // Lookups land in the right half.
        let mid = ranges[0].end().unwrap().clone();
        let left = tree.find_range(b"key_000000").unwrap();
        assert_eq!(left.id(), ranges[0].id());
        let right = tree.find_range(&mid).unwrap();
        assert_eq!(right.id(), ranges[1].id());

        // Both halves kept their share of the data.
        assert!(ranges[0].stmt_count() > 0);
        assert!(ranges[1].stmt_count() > 0);
    }

    #[test]
    fn test_split_refuses_small_range() {
        let dir = TempDir::new().unwrap();
        let (log, tree) = new_tree(&dir, LsmOpts::default().range_size(1000));
        let range = tree.find_range(b"x").unwrap();
        range.add_slice(slice_from_stmts(&dir, &log, 0..10, 256));
        assert!(!tree.split_range(&log, &range));
        assert_eq!(tree.range_count(), 1);
    }

    #[test]
    fn test_coalesce_merges_small_neighbours() {
        let dir = TempDir::new().unwrap();
        let (log, tree) = new_tree(&dir, LsmOpts::default().range_size(10));

        // Split first so there are two ranges to merge back.
        let range = tree.find_range(b"k").unwrap();
        range.add_slice(slice_from_stmts(&dir, &log, 0..100, 256));
        assert!(tree.split_range(&log, &range));
        assert_eq!(tree.range_count(), 2);

        // Shrink both halves below the coalesce threshold.
        for half in tree.ranges() {
            half.set_slices(Vec::new());
        }
        let left = tree.ranges()[0].clone();
        assert!(tree.coalesce_range(&log, &left));
        assert_eq!(tree.range_count(), 1);
        let merged = tree.ranges()[0].clone();
        assert_eq!(merged.begin(), None);
        assert_eq!(merged.end(), None);
    }

    #[test]
    fn test_ranges_overlapping() {
        let dir = TempDir::new().unwrap();
        let (log, tree) = new_tree(&dir, LsmOpts::default().range_size(10));
        let range = tree.find_range(b"k").unwrap();
        range.add_slice(slice_from_stmts(&dir, &log, 0..100, 256));
        assert!(tree.split_range(&log, &range));

        let all = tree.ranges_overlapping(b"key_000000", b"key_000099");
        assert_eq!(all.len(), 2);

        let ranges = tree.ranges();
        let mid = ranges[0].end().unwrap().clone();
        let left_only = tree.ranges_overlapping(b"key_000000", b"key_000001");
        assert_eq!(left_only.len(), 1);
        let right_only = tree.ranges_overlapping(&mid, b"key_999999");
        assert_eq!(right_only.len(), 1);
    }

    #[test]
    fn test_force_compaction_priority() {
        let dir = TempDir::new().unwrap();
        let (log, tree) = new_tree(&dir, LsmOpts::default());
        let range = tree.find_range(b"k").unwrap();
        range.add_slice(slice_from_stmts(&dir, &log, 0..10, 4096));
        range.add_slice(slice_from_stmts(&dir, &log, 10..20, 4096));

        range.update_compact_priority(tree.opts());
        tree.update_compact_priority();
        assert_eq!(tree.compact_priority(), 1);

        tree.force_compaction();
        assert_eq!(tree.compact_priority(), 2);
        assert_eq!(tree.max_priority_range().unwrap().id(), range.id());
    }

    #[test]
    fn test_secondary_pk_link_and_pins() {
        let dir = TempDir::new().unwrap();
        let log = MetaLog::open(dir.path().join("META")).unwrap();
        let pk = LsmTree::new(
            &log,
            512,
            0,
            LsmOpts::default(),
            KeyDef::new(),
            KeyDef::new(),
            0,
        );
        let sk = LsmTree::new(
            &log,
            512,
            1,
            LsmOpts::default(),
            KeyDef::new(),
            KeyDef::new(),
            0,
        );
        sk.set_pk(pk.clone());
        assert_eq!(sk.pk().unwrap().id(), pk.id());

        pk.pin();
        assert_eq!(pk.pin_count(), 1);
        pk.unpin();
        assert_eq!(pk.pin_count(), 0);
    }
}
