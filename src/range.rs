//! Key ranges.
//!
//! Each LSM tree partitions its key space into half-open ranges. A range
//! owns the slices that overlap it, ordered newest first, a compaction
//! priority derived from the slice layout, and a version counter bumped on
//! every structural edit so concurrent readers can detect changes.
//!
//! Slice mutation happens only on the coordinator and must not be
//! interleaved with suspension points; `replace_slices` performs the whole
//! compaction swap in one call, inserting the new slice at the position of
//! the removed ones so slices added by a concurrent dump survive in place.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::LsmOpts;
use crate::run::Slice;

pub struct Range {
    id: i64,
    begin: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    /// Overlapping slices, newest first.
    slices: Mutex<Vec<Arc<Slice>>>,
    compact_priority: AtomicUsize,
    needs_compaction: AtomicBool,
    version: AtomicU64,
    /// Set while a compaction task owns this range; such a range is not
    /// eligible for selection again until the task completes or aborts.
    scheduled: AtomicBool,
    n_compactions: AtomicUsize,
}

impl Range {
    pub fn new(id: i64, begin: Option<Vec<u8>>, end: Option<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            id,
            begin,
            end,
            slices: Mutex::new(Vec::new()),
            compact_priority: AtomicUsize::new(1),
            needs_compaction: AtomicBool::new(false),
            version: AtomicU64::new(0),
            scheduled: AtomicBool::new(false),
            n_compactions: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn begin(&self) -> Option<&Vec<u8>> {
        self.begin.as_ref()
    }

    pub fn end(&self) -> Option<&Vec<u8>> {
        self.end.as_ref()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        if let Some(begin) = &self.begin {
            if key < begin.as_slice() {
                return false;
            }
        }
        if let Some(end) = &self.end {
            if key >= end.as_slice() {
                return false;
            }
        }
        true
    }

    pub fn slices(&self) -> Vec<Arc<Slice>> {
        self.slices.lock().unwrap().clone()
    }

    pub fn slice_count(&self) -> usize {
        self.slices.lock().unwrap().len()
    }

    /// Total statement count estimate over all slices.
    pub fn stmt_count(&self) -> u64 {
        self.slices.lock().unwrap().iter().map(|s| s.count()).sum()
    }

    /// Add a freshly dumped slice in front (newest).
    pub fn add_slice(&self, slice: Arc<Slice>) {
        self.slices.lock().unwrap().insert(0, slice);
    }

    /// Seed the slice list at range construction, newest first.
    pub fn set_slices(&self, slices: Vec<Arc<Slice>>) {
        *self.slices.lock().unwrap() = slices;
    }

    /// The contiguous segment `[first_id ..= last_id]` of the slice list.
    pub fn slice_segment(&self, first_id: i64, last_id: i64) -> Vec<Arc<Slice>> {
        let slices = self.slices.lock().unwrap();
        let Some(first) = slices.iter().position(|s| s.id() == first_id) else {
            return Vec::new();
        };
        let Some(last) = slices.iter().position(|s| s.id() == last_id) else {
            return Vec::new();
        };
        slices[first..=last].to_vec()
    }

    /// Replace the compacted segment with the new slice, preserving the
    /// positional insertion point: the new slice lands exactly where the
    /// segment began, leaving slices a concurrent dump prepended untouched.
    /// Returns the removed slices, oldest last.
    pub fn replace_slices(
        &self,
        first_id: i64,
        last_id: i64,
        new_slice: Option<Arc<Slice>>,
    ) -> Vec<Arc<Slice>> {
        let mut slices = self.slices.lock().unwrap();
        let Some(mut first) = slices.iter().position(|s| s.id() == first_id) else {
            return Vec::new();
        };
        let Some(mut last) = slices.iter().position(|s| s.id() == last_id) else {
            return Vec::new();
        };
        if let Some(slice) = new_slice {
            slices.insert(first, slice);
            first += 1;
            last += 1;
        }
        slices.drain(first..=last).collect()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::SeqCst)
    }

    pub fn set_scheduled(&self, scheduled: bool) {
        self.scheduled.store(scheduled, Ordering::SeqCst);
    }

    pub fn needs_compaction(&self) -> bool {
        self.needs_compaction.load(Ordering::SeqCst)
    }

    pub fn set_needs_compaction(&self, needs: bool) {
        self.needs_compaction.store(needs, Ordering::SeqCst);
    }

    pub fn n_compactions(&self) -> usize {
        self.n_compactions.load(Ordering::SeqCst)
    }

    pub fn account_compaction(&self) {
        self.n_compactions.fetch_add(1, Ordering::SeqCst);
    }

    pub fn compact_priority(&self) -> usize {
        self.compact_priority.load(Ordering::SeqCst)
    }

    /// Recompute how many of the newest slices should be merged to reduce
    /// read amplification most.
    ///
    /// Slices are grouped into size-tiered levels: a slice more than
    /// `run_size_ratio` times larger than the first slice of the current
    /// level starts a deeper level. When a level holds more than
    /// `run_count_per_level` slices, everything from the newest slice
    /// through that level is worth compacting. A priority of 1 means the
    /// range has nothing to gain from compaction.
    pub fn update_compact_priority(&self, opts: &LsmOpts) {
        let slices = self.slices.lock().unwrap();
        if self.needs_compaction() {
            self.compact_priority
                .store(slices.len().max(1), Ordering::SeqCst);
            return;
        }
        let mut priority = 1usize;
        let mut level_size = 0u64;
        let mut level_count = 0usize;
        for (n, slice) in slices.iter().enumerate() {
            let size = slice.count().max(1);
            if level_size == 0 || size > level_size.saturating_mul(opts.run_size_ratio) {
                level_size = size;
                level_count = 1;
            } else {
                level_count += 1;
            }
            if level_count > opts.run_count_per_level {
                priority = n + 1;
            }
        }
        self.compact_priority.store(priority, Ordering::SeqCst);
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = |key: &Option<Vec<u8>>, inf: &str| match key {
            Some(key) => String::from_utf8_lossy(key).into_owned(),
            None => inf.to_string(),
        };
        write!(
            f,
            "[{}..{})",
            bound(&self.begin, "-inf"),
            bound(&self.end, "inf")
        )
    }
}

impl fmt::Debug for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Range")
            .field("id", &self.id)
            .field("interval", &format!("{}", self))
            .field("slices", &self.slice_count())
            .field("compact_priority", &self.compact_priority())
            .finish()
    }
}
