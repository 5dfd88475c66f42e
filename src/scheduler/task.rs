//! Background task lifecycle.
//!
//! A task is built on the coordinator, executed on a worker, and completed
//! back on the coordinator. `execute` does the heavy lifting (merging
//! sources and writing the run file); `complete` applies the metadata-log
//! transaction and the in-memory state changes; `abort` undoes the
//! preparation when either step fails or the tree was dropped mid-flight.
//!
//! The task carries copies of the tree's key definitions and policy knobs
//! so a concurrent schema alter cannot race the worker.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::deferred::TaskDeferredDelete;
use super::worker::Worker;
use super::Scheduler;
use crate::errinj::Injection;
use crate::error::Result;
use crate::lsm::LsmTree;
use crate::metalog::LogRecord;
use crate::range::Range;
use crate::run::{Run, RunWriter, Slice};
use crate::stmt::KeyDef;
use crate::witer::WriteIterator;
use crate::Error;

/// Cooperative yield interval while appending statements to a run.
const YIELD_LOOPS: usize = 32;

/// Shared control block of a task: cancellation and failures reported from
/// outside the worker (shutdown, deferred-delete processing).
#[derive(Debug, Default)]
pub(crate) struct TaskCtl {
    cancelled: AtomicBool,
    failed: AtomicBool,
    error: Mutex<Option<Error>>,
    notify: Notify,
}

impl TaskCtl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Wait until the task is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    pub fn fail(&self, error: Error) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
        self.failed.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn take_error(&self) -> Option<Error> {
        self.error.lock().unwrap().take()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TaskKind {
    Dump,
    Compact,
}

pub(crate) struct Task {
    pub kind: TaskKind,
    pub lsm: Arc<LsmTree>,
    /// Copies of the tree's definitions, safe against concurrent alter.
    pub cmp_def: KeyDef,
    #[allow(dead_code)]
    pub key_def: KeyDef,
    pub new_run: Arc<Run>,
    pub wi: WriteIterator,
    /// Policy snapshot taken at construction.
    pub bloom_fpr: f64,
    pub page_size: usize,
    /// Compaction only: the target range and the id bounds of the slice
    /// segment being compacted. A concurrent dump may prepend new slices,
    /// so the segment is remembered by id, not by position.
    pub range: Option<Arc<Range>>,
    pub first_slice: i64,
    pub last_slice: i64,
    pub is_failed: bool,
    pub error: Option<Error>,
    pub ctl: Arc<TaskCtl>,
    pub worker: Option<Worker>,
    pub injection: Arc<Injection>,
}

impl Task {
    /// Worker entry point: execute and fold any failure into the task.
    pub async fn run_execute(&mut self) {
        if let Err(e) = self.execute().await {
            if !self.is_failed {
                self.is_failed = true;
                self.error = Some(e);
            }
        }
        // A deferred-delete batch may have failed on the coordinator while
        // we were writing; its error wins over a bare cancellation.
        if self.ctl.is_failed() {
            self.is_failed = true;
            if let Some(e) = self.ctl.take_error() {
                self.error = Some(e);
            }
        }
    }

    /// Pump the write iterator into a new run file. Runs on a worker.
    async fn execute(&mut self) -> Result<()> {
        if Injection::fire(&self.injection.run_write_fail) {
            return Err(Error::Injected("run write".to_string()));
        }
        while self
            .injection
            .compaction_delay
            .load(std::sync::atomic::Ordering::SeqCst)
            && self.kind == TaskKind::Compact
            && !self.ctl.is_cancelled()
        {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let mut writer = RunWriter::create(self.new_run.path(), self.page_size, self.bloom_fpr)?;
        if let Err(e) = self.wi.start().await {
            writer.abort();
            return Err(e);
        }
        let mut loops = 0;
        let mut last_key: Option<Vec<u8>> = None;
        loop {
            let stmt = match self.wi.next().await {
                Ok(Some(stmt)) => stmt,
                Ok(None) => break,
                Err(e) => {
                    let _ = self.wi.stop().await;
                    writer.abort();
                    return Err(e);
                }
            };
            // The merge must feed the writer in key order.
            debug_assert!(last_key
                .as_ref()
                .map_or(true, |last| self.cmp_def.compare(last, &stmt.key).is_le()));
            last_key = Some(stmt.key.clone());
            if let Err(e) = writer.append_stmt(&stmt) {
                let _ = self.wi.stop().await;
                writer.abort();
                return Err(e);
            }
            loops += 1;
            if loops % YIELD_LOOPS == 0 {
                tokio::task::yield_now().await;
            }
            if self.ctl.is_cancelled() {
                let _ = self.wi.stop().await;
                writer.abort();
                return Err(Error::Cancelled);
            }
        }
        if let Err(e) = self.wi.stop().await {
            writer.abort();
            return Err(e);
        }
        let info = writer.commit()?;
        self.new_run.commit_info(info);
        Ok(())
    }
}

impl Scheduler {
    /// Allocate a new run and log it as prepared, so a crashed write leaves
    /// a discoverable orphan instead of a leak.
    pub(crate) fn run_prepare(&self, lsm: &LsmTree) -> Result<Arc<Run>> {
        let run_id = self.metalog.next_id();
        let path = self
            .run_env
            .run_path(lsm.space_id(), lsm.index_id(), run_id);
        let run = Arc::new(Run::new(run_id, path));
        self.metalog.tx_begin();
        self.metalog.append(LogRecord::PrepareRun {
            lsm_id: lsm.id(),
            run_id,
        });
        self.metalog.tx_commit()?;
        Ok(run)
    }

    /// Log that an incomplete run is no longer needed. Best effort: if the
    /// record is lost, recovery finds the orphan and deletes it.
    pub(crate) fn run_discard(&self, run: &Run) {
        if self
            .cfg
            .injection
            .run_discard_skip
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            tracing::error!(run_id = run.id(), "error injection: run not discarded");
            return;
        }
        // The run was never referenced, so no checkpoint retains it; a
        // gc-LSN below any signature keeps it sweepable at all times.
        self.metalog.tx_begin();
        self.metalog.append(LogRecord::DropRun {
            run_id: run.id(),
            gc_lsn: -1,
        });
        self.metalog.tx_try_commit();
    }

    fn task_shell(&self, kind: TaskKind, lsm: &Arc<LsmTree>, new_run: Arc<Run>, wi: WriteIterator, ctl: Arc<TaskCtl>) -> Box<Task> {
        Box::new(Task {
            kind,
            lsm: Arc::clone(lsm),
            cmp_def: lsm.cmp_def(),
            key_def: lsm.key_def(),
            new_run,
            wi,
            bloom_fpr: lsm.opts().bloom_fpr,
            page_size: lsm.opts().page_size,
            range: None,
            first_slice: -1,
            last_slice: -1,
            is_failed: false,
            error: None,
            ctl,
            worker: None,
            injection: Arc::clone(&self.cfg.injection),
        })
    }

    /// Build a dump task covering every sealed memtable at or below the
    /// current dump generation. Returns `Ok(None)` when all eligible
    /// memtables turned out empty and were destroyed on the spot.
    pub(crate) async fn task_dump_new(&self, lsm: &Arc<LsmTree>) -> Result<Option<Box<Task>>> {
        debug_assert!(!lsm.is_dropped());
        debug_assert!(!lsm.is_dumping());
        debug_assert_eq!(lsm.pin_count(), 0);
        let dump_generation = self.dump_generation();
        debug_assert_eq!(lsm.generation(), dump_generation);

        // Rotate the active tree if it needs to be dumped.
        if lsm.active_generation() == dump_generation {
            lsm.rotate_mem(self.generation());
        }

        // Wait until all active writes to eligible memtables are over.
        // Empty memtables are destroyed right away, without a worker.
        let mut dump_lsn = -1;
        for mem in lsm.sealed_mems() {
            if mem.generation() > dump_generation {
                continue;
            }
            mem.wait_pinned().await;
            if mem.is_empty() {
                lsm.delete_mem(&mem);
                continue;
            }
            dump_lsn = dump_lsn.max(mem.dump_lsn());
        }

        if dump_lsn < 0 {
            // Nothing to dump for this tree; the round may be over.
            self.update_lsm(lsm);
            self.complete_dump_round();
            return Ok(None);
        }

        let new_run = self.run_prepare(lsm)?;
        new_run.set_dump_lsn(dump_lsn);

        // Deferred DELETEs arise only on compaction: an overwrite found in
        // memory is resolved on commit, so dumps get no handler.
        let is_last_level = lsm.run_count() == 0;
        let mut wi = WriteIterator::new(
            lsm.cmp_def(),
            lsm.index_id() == 0,
            is_last_level,
            Arc::clone(&self.read_views),
            None,
        );
        for mem in lsm.sealed_mems() {
            if mem.generation() <= dump_generation {
                wi.add_mem(mem);
            }
        }

        let ctl = Arc::new(TaskCtl::new());
        let task = self.task_shell(TaskKind::Dump, lsm, new_run, wi, ctl);

        lsm.set_dumping(true);
        self.update_lsm(lsm);

        if lsm.index_id() != 0 {
            // The primary must be dumped after all secondaries of the same
            // space; pinning takes it off the top of the dump heap until
            // this secondary completes.
            if let Some(pk) = lsm.pk() {
                self.pin_lsm(&pk);
            }
        }
        self.dump_task_count
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        tracing::info!(lsm = %lsm.name(), "dump started");
        Ok(Some(task))
    }

    /// Apply a finished dump: log the new run and its slices, attach them,
    /// destroy the dumped memtables, and close the round if this was the
    /// last tree.
    pub(crate) async fn complete_dump(&self, task: &mut Task) -> Result<()> {
        let lsm = Arc::clone(&task.lsm);
        let run = Arc::clone(&task.new_run);
        let dump_lsn = run.dump_lsn();
        let log = &self.metalog;

        debug_assert!(lsm.is_dumping());

        if run.is_empty() {
            // Discard the run and free the memtables, but the dump itself
            // must still be logged.
            log.tx_begin();
            log.append(LogRecord::DumpLsm {
                lsm_id: lsm.id(),
                dump_lsn,
            });
            log.tx_commit()?;
            self.run_discard(&run);
        } else {
            let info = run
                .info()
                .ok_or_else(|| Error::InvalidOperation("dumped run has no info".to_string()))?;

            // One slice per range the new run intersects.
            let ranges = lsm.ranges_overlapping(&info.min_key, &info.max_key);
            let mut new_slices = Vec::with_capacity(ranges.len());
            for range in &ranges {
                new_slices.push(Slice::new(
                    log.next_id(),
                    Arc::clone(&run),
                    range.begin().cloned(),
                    range.end().cloned(),
                ));
            }

            log.tx_begin();
            log.append(LogRecord::CreateRun {
                lsm_id: lsm.id(),
                run_id: run.id(),
                dump_lsn,
            });
            for (range, slice) in ranges.iter().zip(&new_slices) {
                log.append(LogRecord::InsertSlice {
                    range_id: range.id(),
                    run_id: run.id(),
                    slice_id: slice.id(),
                    begin: slice.begin().cloned(),
                    end: slice.end().cloned(),
                });
            }
            log.append(LogRecord::DumpLsm {
                lsm_id: lsm.id(),
                dump_lsn,
            });
            log.tx_commit()?;

            lsm.add_run(Arc::clone(&run));

            // No suspension from here until the slices are in place: a
            // reader must never see the same statement in memory and on
            // disk at once.
            for (range, slice) in ranges.iter().zip(new_slices) {
                range.add_slice(slice);
                range.update_compact_priority(lsm.opts());
                range.bump_version();
            }
            lsm.update_compact_priority();
        }

        // Destroy the dumped in-memory trees.
        let dump_generation = self.dump_generation();
        for mem in lsm.sealed_mems() {
            if mem.generation() <= dump_generation {
                lsm.delete_mem(&mem);
            }
        }
        lsm.set_dump_lsn(dump_lsn);

        task.wi.close();

        lsm.set_dumping(false);
        self.update_lsm(&lsm);
        if lsm.index_id() != 0 {
            if let Some(pk) = lsm.pk() {
                self.unpin_lsm(&pk);
            }
        }
        self.dump_task_count
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);

        tracing::info!(lsm = %lsm.name(), "dump completed");
        self.complete_dump_round();
        Ok(())
    }

    pub(crate) fn abort_dump(&self, task: &mut Task) {
        let lsm = &task.lsm;
        debug_assert!(lsm.is_dumping());

        task.wi.close();

        // No point alerting the user about a tree that is gone.
        if !lsm.is_dropped() {
            if let Some(error) = &task.error {
                tracing::error!(lsm = %lsm.name(), error = %error, "dump failed");
            }
        }

        self.run_discard(&task.new_run);

        lsm.set_dumping(false);
        self.update_lsm(lsm);
        if lsm.index_id() != 0 {
            if let Some(pk) = lsm.pk() {
                self.unpin_lsm(&pk);
            }
        }
        self.dump_task_count
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);

        // If the tree was dropped mid-dump the round still has to close,
        // or the generation would stall and memory never be released.
        if lsm.is_dropped() {
            self.complete_dump_round();
        }
    }

    /// Build a compaction task for the tree's best range. Returns
    /// `Ok(None)` when the range was split or coalesced instead; the
    /// structure changed, so selection starts over.
    pub(crate) fn task_compact_new(&self, lsm: &Arc<LsmTree>) -> Result<Option<Box<Task>>> {
        debug_assert!(!lsm.is_dropped());

        let Some(range) = lsm.max_priority_range() else {
            return Ok(None);
        };
        debug_assert!(range.compact_priority() > 1);

        if self.lsm_split_or_coalesce(lsm, &range) {
            self.update_lsm(lsm);
            return Ok(None);
        }

        let new_run = self.run_prepare(lsm)?;

        let ctl = Arc::new(TaskCtl::new());
        let is_primary = lsm.index_id() == 0;
        let is_last_level = range.compact_priority() == range.slice_count();
        let handler = if is_primary {
            Some(Box::new(TaskDeferredDelete::new(
                self.deferred_tx.clone(),
                Arc::clone(lsm),
                lsm.key_def(),
                Arc::clone(&ctl),
            )) as Box<dyn crate::witer::DeferredDeleteHandler>)
        } else {
            None
        };
        let mut wi = WriteIterator::new(
            lsm.cmp_def(),
            is_primary,
            is_last_level,
            Arc::clone(&self.read_views),
            handler,
        );

        // The top-priority-many newest slices, in range order.
        let slices = range.slices();
        let n = range.compact_priority().min(slices.len());
        let mut first_slice = -1;
        let mut last_slice = -1;
        let mut dump_lsn = -1;
        for slice in slices.iter().take(n) {
            wi.add_slice(Arc::clone(slice));
            dump_lsn = dump_lsn.max(slice.run().dump_lsn());
            if first_slice < 0 {
                first_slice = slice.id();
            }
            last_slice = slice.id();
        }
        new_run.set_dump_lsn(dump_lsn);
        range.set_needs_compaction(false);

        let mut task = self.task_shell(TaskKind::Compact, lsm, new_run, wi, ctl);
        task.range = Some(Arc::clone(&range));
        task.first_slice = first_slice;
        task.last_slice = last_slice;

        // Take the range out of selection so it is not compacted twice.
        range.set_scheduled(true);
        lsm.update_compact_priority();
        self.update_lsm(lsm);

        tracing::info!(
            lsm = %lsm.name(),
            range = %range,
            runs = n,
            total = slices.len(),
            "started compacting range"
        );
        Ok(Some(task))
    }

    fn lsm_split_or_coalesce(&self, lsm: &Arc<LsmTree>, range: &Arc<Range>) -> bool {
        lsm.split_range(&self.metalog, range) || lsm.coalesce_range(&self.metalog, range)
    }

    /// Apply a finished compaction: one atomic metadata transaction swaps
    /// the source slices for the output slice, then the in-memory range is
    /// updated without yielding.
    pub(crate) async fn complete_compact(&self, task: &mut Task) -> Result<()> {
        let lsm = Arc::clone(&task.lsm);
        let run = Arc::clone(&task.new_run);
        let range = task
            .range
            .clone()
            .ok_or_else(|| Error::InvalidOperation("compaction task without a range".to_string()))?;
        let log = &self.metalog;

        // If the output is empty there is no new slice to insert, but the
        // compacted runs still have to go.
        let new_slice = if !run.is_empty() {
            Some(Slice::new(log.next_id(), Arc::clone(&run), None, None))
        } else {
            None
        };

        let segment = range.slice_segment(task.first_slice, task.last_slice);
        if segment.is_empty() {
            return Err(Error::InvalidOperation(
                "compacted slices missing from range".to_string(),
            ));
        }

        // Runs whose every slice was compacted become unused.
        for slice in &segment {
            slice.run().mark_slice_compacted();
        }
        let mut unused_runs: Vec<Arc<Run>> = Vec::new();
        for slice in &segment {
            let source = slice.run();
            if source.compacted_slice_count() == source.slice_count()
                && !unused_runs.iter().any(|r| Arc::ptr_eq(r, source))
            {
                unused_runs.push(Arc::clone(source));
            }
        }
        for slice in &segment {
            slice.run().reset_compacted_slices();
        }

        let gc_lsn = log.signature();
        log.tx_begin();
        for slice in &segment {
            log.append(LogRecord::DeleteSlice {
                slice_id: slice.id(),
            });
        }
        for source in &unused_runs {
            log.append(LogRecord::DropRun {
                run_id: source.id(),
                gc_lsn,
            });
        }
        if let Some(slice) = &new_slice {
            log.append(LogRecord::CreateRun {
                lsm_id: lsm.id(),
                run_id: run.id(),
                dump_lsn: run.dump_lsn(),
            });
            log.append(LogRecord::InsertSlice {
                range_id: range.id(),
                run_id: run.id(),
                slice_id: slice.id(),
                begin: None,
                end: None,
            });
        }
        log.tx_commit()?;

        // Unused runs dumped after the last checkpoint are not referenced
        // by any checkpoint; reclaim their files right away. Best effort.
        log.tx_begin();
        for source in &unused_runs {
            if source.dump_lsn() > gc_lsn {
                match source.remove_files() {
                    Ok(()) => log.append(LogRecord::ForgetRun {
                        run_id: source.id(),
                    }),
                    Err(e) => {
                        tracing::warn!(run_id = source.id(), error = %e, "failed to remove compacted run files")
                    }
                }
            }
        }
        log.tx_try_commit();

        if new_slice.is_some() {
            lsm.add_run(Arc::clone(&run));
        } else {
            self.run_discard(&run);
        }

        // Swap the slices without suspension, inserting the output at the
        // position of the removed segment so slices a concurrent dump
        // prepended stay in range order.
        let removed = range.replace_slices(task.first_slice, task.last_slice, new_slice);
        range.account_compaction();
        range.bump_version();
        range.update_compact_priority(lsm.opts());
        for source in &unused_runs {
            lsm.remove_run(source);
        }

        // Release the iterator's own pins, then let readers still pinning
        // the compacted slices drain before the slices are destroyed.
        task.wi.close();
        for slice in &removed {
            slice.wait_pinned().await;
        }
        drop(removed);

        range.set_scheduled(false);
        lsm.update_compact_priority();
        self.update_lsm(&lsm);

        tracing::info!(lsm = %lsm.name(), range = %range, "completed compacting range");
        Ok(())
    }

    pub(crate) fn abort_compact(&self, task: &mut Task) {
        let lsm = &task.lsm;

        task.wi.close();

        if !lsm.is_dropped() {
            if let Some(error) = &task.error {
                let range = task
                    .range
                    .as_ref()
                    .map(|r| r.to_string())
                    .unwrap_or_default();
                tracing::error!(lsm = %lsm.name(), range = %range, error = %error, "range compaction failed");
            }
        }

        self.run_discard(&task.new_run);

        if let Some(range) = &task.range {
            range.set_scheduled(false);
            range.update_compact_priority(lsm.opts());
        }
        lsm.update_compact_priority();
        self.update_lsm(lsm);
    }

    pub(crate) async fn task_complete(&self, task: &mut Task) -> Result<()> {
        match task.kind {
            TaskKind::Dump => self.complete_dump(task).await,
            TaskKind::Compact => self.complete_compact(task).await,
        }
    }

    pub(crate) fn task_abort(&self, task: &mut Task) {
        match task.kind {
            TaskKind::Dump => self.abort_dump(task),
            TaskKind::Compact => self.abort_compact(task),
        }
    }
}
