//! The background maintenance coordinator.
//!
//! One coordinator task owns all LSM state mutation. It watches two
//! priority heaps, builds dump and compaction tasks, ships them to the
//! worker pools over per-worker pipes, and applies the results: metadata
//! log first (the durability linearisation point), in-memory state second.
//!
//! Dumps are organised in *rounds*. `trigger_dump` advances the target
//! generation; the round dumps every tree whose data is older and completes
//! when the oldest in-memory generation moves past the round's generation,
//! at which point the dump condition is signalled and the completion
//! callback runs. Checkpoints ride on the same mechanism: they bump the
//! generation and wait for the round, deferring any dump triggered in the
//! meantime so nothing written after the WAL rotation sneaks into the
//! snapshot.
//!
//! Failures throttle the scheduler: the retry timeout doubles on every
//! consecutive failure (clamped to the configured bounds) and resets on the
//! next success.

pub mod deferred;
pub(crate) mod task;
pub(crate) mod worker;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;
use crate::errinj::Injection;
use crate::error::Result;
use crate::heap::{HeapKind, LsmHeap};
use crate::lsm::LsmTree;
use crate::metalog::MetaLog;
use crate::run::RunEnv;
use crate::stmt::ReadViewSet;
use crate::Error;

use deferred::{DeferredDeleteBatch, DeferredDeleteSink};
use task::Task;
use worker::{PoolKind, Worker, WorkerPool};

/// Invoked when a dump round completes, with the generation the round made
/// durable and the round duration in seconds.
pub type DumpCompleteCallback = Box<dyn Fn(i64, f64) + Send + Sync>;

struct Heaps {
    dump: LsmHeap,
    compact: LsmHeap,
}

struct Pools {
    dump: WorkerPool,
    compact: WorkerPool,
}

impl Pools {
    fn put(&mut self, worker: Worker) {
        match worker.kind {
            PoolKind::Dump => self.dump.put(worker),
            PoolKind::Compact => self.compact.put(worker),
        }
    }

    fn dispatch(&self, task: Box<Task>) {
        match task.worker.as_ref().map(|w| w.kind) {
            Some(PoolKind::Dump) => self.dump.send(task),
            Some(PoolKind::Compact) => self.compact.send(task),
            None => {}
        }
    }

    async fn stop(&mut self) {
        self.dump.stop().await;
        self.compact.stop().await;
    }
}

struct LoopState {
    complete_rx: mpsc::UnboundedReceiver<Box<Task>>,
    deferred_rx: mpsc::UnboundedReceiver<DeferredDeleteBatch>,
}

pub struct Scheduler {
    pub(crate) cfg: SchedulerConfig,
    pub(crate) run_env: RunEnv,
    pub(crate) metalog: Arc<MetaLog>,
    pub(crate) read_views: Arc<ReadViewSet>,
    dump_complete_cb: DumpCompleteCallback,
    sink: Arc<dyn DeferredDeleteSink>,

    heaps: Mutex<Heaps>,

    /// Target generation: incremented to trigger a new dump round.
    generation: AtomicI64,
    /// Generation of the round currently being dumped. A round is in
    /// progress iff `dump_generation < generation`.
    dump_generation: AtomicI64,
    pub(crate) dump_task_count: AtomicUsize,
    dump_start: Mutex<Instant>,

    checkpoint_in_progress: AtomicBool,
    /// A dump was requested while a checkpoint was running and deferred to
    /// `end_checkpoint`.
    dump_pending: AtomicBool,

    is_throttled: AtomicBool,
    timeout: Mutex<f64>,
    pub(crate) last_error: Mutex<Option<Error>>,

    /// Wakes the coordinator when there may be work.
    scheduler_cond: Notify,
    /// Signalled when a dump round completes or fails; checkpoint and dump
    /// waiters sleep on this.
    dump_cond: Notify,
    /// Interrupts a throttle sleep on shutdown.
    stop_cond: Notify,
    /// Stops the deferred-delete loop once the pools are down.
    deferred_stop: Arc<Notify>,

    complete_tx: mpsc::UnboundedSender<Box<Task>>,
    pub(crate) deferred_tx: mpsc::UnboundedSender<DeferredDeleteBatch>,

    stopping: AtomicBool,
    loop_state: Mutex<Option<LoopState>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        cfg: SchedulerConfig,
        dump_complete_cb: DumpCompleteCallback,
        run_env: RunEnv,
        metalog: Arc<MetaLog>,
        read_views: Arc<ReadViewSet>,
        sink: Arc<dyn DeferredDeleteSink>,
    ) -> Arc<Self> {
        assert!(cfg.write_threads > 1, "at least two write threads required");
        let (complete_tx, complete_rx) = mpsc::unbounded_channel();
        let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            cfg,
            run_env,
            metalog,
            read_views,
            dump_complete_cb,
            sink,
            heaps: Mutex::new(Heaps {
                dump: LsmHeap::new(HeapKind::Dump),
                compact: LsmHeap::new(HeapKind::Compact),
            }),
            generation: AtomicI64::new(0),
            dump_generation: AtomicI64::new(0),
            dump_task_count: AtomicUsize::new(0),
            dump_start: Mutex::new(Instant::now()),
            checkpoint_in_progress: AtomicBool::new(false),
            dump_pending: AtomicBool::new(false),
            is_throttled: AtomicBool::new(false),
            timeout: Mutex::new(0.0),
            last_error: Mutex::new(None),
            scheduler_cond: Notify::new(),
            dump_cond: Notify::new(),
            stop_cond: Notify::new(),
            deferred_stop: Arc::new(Notify::new()),
            complete_tx,
            deferred_tx,
            stopping: AtomicBool::new(false),
            loop_state: Mutex::new(Some(LoopState {
                complete_rx,
                deferred_rx,
            })),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the coordinator loop and the deferred-delete processing loop.
    pub fn start(self: &Arc<Self>) {
        let Some(state) = self.loop_state.lock().unwrap().take() else {
            return;
        };
        let mut handles = self.handles.lock().unwrap();
        handles.push(tokio::spawn(Arc::clone(self).run_loop(state.complete_rx)));
        handles.push(tokio::spawn(deferred::deferred_loop(
            state.deferred_rx,
            Arc::clone(&self.sink),
            Arc::clone(&self.deferred_stop),
        )));
    }

    /// Stop the loops, cancel in-flight tasks and join everything.
    pub async fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.scheduler_cond.notify_one();
        self.stop_cond.notify_one();
        self.dump_cond.notify_waiters();
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "scheduler loop join failed");
            }
        }
    }

    /// Register an LSM tree with both heaps.
    pub fn add_lsm(&self, lsm: &Arc<LsmTree>) {
        let mut heaps = self.heaps.lock().unwrap();
        heaps.dump.insert(Arc::clone(lsm));
        heaps.compact.insert(Arc::clone(lsm));
    }

    /// Unregister a tree. Dropped trees hold no heap positions and receive
    /// no new tasks.
    pub fn remove_lsm(&self, lsm: &Arc<LsmTree>) {
        {
            let mut heaps = self.heaps.lock().unwrap();
            heaps.dump.delete(lsm);
            heaps.compact.delete(lsm);
        }
        // The removed tree may have been the last one holding the current
        // dump round open; let the coordinator re-evaluate.
        self.scheduler_cond.notify_one();
    }

    pub(crate) fn update_lsm(&self, lsm: &Arc<LsmTree>) {
        if lsm.is_dropped() {
            // Dropped trees are exempt from scheduling.
            debug_assert!(!lsm.in_dump.in_heap() && !lsm.in_compact.in_heap());
            return;
        }
        let mut heaps = self.heaps.lock().unwrap();
        heaps.dump.update(lsm);
        heaps.compact.update(lsm);
    }

    pub(crate) fn pin_lsm(&self, lsm: &Arc<LsmTree>) {
        debug_assert!(!lsm.is_dumping());
        if lsm.pin() == 0 {
            self.update_lsm(lsm);
        }
    }

    pub(crate) fn unpin_lsm(&self, lsm: &Arc<LsmTree>) {
        debug_assert!(!lsm.is_dumping());
        if lsm.unpin() == 0 {
            self.update_lsm(lsm);
        }
    }

    pub fn generation(&self) -> i64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn dump_generation(&self) -> i64 {
        self.dump_generation.load(Ordering::SeqCst)
    }

    pub fn dump_in_progress(&self) -> bool {
        self.dump_generation() < self.generation()
    }

    pub fn is_throttled(&self) -> bool {
        self.is_throttled.load(Ordering::SeqCst)
    }

    /// Current throttle timeout in seconds; 0 after a success.
    pub fn throttle_timeout(&self) -> f64 {
        *self.timeout.lock().unwrap()
    }

    /// The last error the scheduler saw.
    pub fn last_error(&self) -> Option<Error> {
        self.last_error.lock().unwrap().clone()
    }

    fn throttled_error(&self) -> Error {
        self.last_error()
            .unwrap_or_else(|| Error::Throttled("background task failed".to_string()))
    }

    /// Request that in-memory data be dumped to disk. Idempotent while a
    /// round is in progress; deferred while a checkpoint runs so nothing
    /// written after the WAL rotation reaches the snapshot.
    pub fn trigger_dump(&self) {
        if self.dump_in_progress() {
            return;
        }
        if self.checkpoint_in_progress.load(Ordering::SeqCst) {
            self.dump_pending.store(true, Ordering::SeqCst);
            return;
        }
        *self.dump_start.lock().unwrap() = Instant::now();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.dump_pending.store(false, Ordering::SeqCst);
        self.scheduler_cond.notify_one();
    }

    /// Trigger a dump round and wait for it to complete.
    pub async fn dump(&self) -> Result<()> {
        // A dump must not start while a checkpoint is in progress.
        loop {
            let notified = self.dump_cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.checkpoint_in_progress.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }

        if !self.dump_in_progress() {
            *self.dump_start.lock().unwrap() = Instant::now();
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.scheduler_cond.notify_one();

        loop {
            let notified = self.dump_cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.dump_in_progress() {
                return Ok(());
            }
            if self.is_throttled() {
                return Err(self.throttled_error());
            }
            notified.await;
        }
    }

    /// Force compaction of every range of the tree, regardless of layout.
    pub fn force_compaction(&self, lsm: &Arc<LsmTree>) {
        lsm.force_compaction();
        self.update_lsm(lsm);
        self.scheduler_cond.notify_one();
    }

    /// Start a checkpoint: trigger a dump round covering everything written
    /// so far. Fails fast when the scheduler is throttled, waking it up
    /// could take up to the full throttle timeout.
    pub fn begin_checkpoint(&self) -> Result<()> {
        debug_assert!(!self.checkpoint_in_progress.load(Ordering::SeqCst));
        if self.is_throttled() {
            let error = self.throttled_error();
            tracing::error!(error = %error, "cannot checkpoint, scheduler is throttled");
            return Err(error);
        }
        if !self.dump_in_progress() {
            *self.dump_start.lock().unwrap() = Instant::now();
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.checkpoint_in_progress.store(true, Ordering::SeqCst);
        self.scheduler_cond.notify_one();
        tracing::info!("checkpoint started");
        Ok(())
    }

    /// Wait until every memtable created before the checkpoint has been
    /// dumped.
    pub async fn wait_checkpoint(&self) -> Result<()> {
        if !self.checkpoint_in_progress.load(Ordering::SeqCst) {
            return Ok(());
        }
        loop {
            let notified = self.dump_cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.dump_in_progress() {
                tracing::info!("checkpoint completed");
                return Ok(());
            }
            if self.is_throttled() {
                let error = self.throttled_error();
                tracing::error!(error = %error, "checkpoint failed");
                return Err(error);
            }
            notified.await;
        }
    }

    /// Finish the checkpoint and release any dump deferred during it.
    pub fn end_checkpoint(&self) {
        if !self
            .checkpoint_in_progress
            .swap(false, Ordering::SeqCst)
        {
            return;
        }
        // The snapshot now covers everything the checkpoint round dumped;
        // advance the gc horizon so compaction and the recovery sweep keep
        // the run files it references. Skipped when the round did not
        // finish (throttled checkpoint): the old horizon stays in force.
        if !self.dump_in_progress() {
            let horizon = self.metalog.max_dump_lsn();
            if horizon > self.metalog.signature() {
                if let Err(e) = self.metalog.set_signature(horizon) {
                    tracing::warn!(error = %e, "checkpoint signature not recorded");
                }
            }
        }
        if self.dump_pending.load(Ordering::SeqCst) {
            self.trigger_dump();
        }
        // Wake anyone who deferred a dump to the end of the checkpoint.
        self.dump_cond.notify_waiters();
    }

    /// Close the current dump round if every tree has moved past it:
    /// advance the dump generation, report the round and wake waiters.
    pub(crate) fn complete_dump_round(&self) {
        if self.dump_task_count.load(Ordering::SeqCst) > 0 {
            return;
        }
        let mut min_generation = self.generation();
        if let Some(lsm) = self.heaps.lock().unwrap().dump.top() {
            min_generation = lsm.generation();
        }
        if min_generation == self.dump_generation() {
            // Some tree still holds data for the current round.
            return;
        }

        let now = Instant::now();
        let duration = {
            let mut start = self.dump_start.lock().unwrap();
            let duration = now - *start;
            *start = now;
            duration
        };
        self.dump_generation.store(min_generation, Ordering::SeqCst);
        (self.dump_complete_cb)(min_generation - 1, duration.as_secs_f64());
        self.dump_cond.notify_waiters();
    }

    /// One pass of task selection: dumps before compactions.
    async fn schedule(&self, pools: &mut Pools) -> Result<Option<Box<Task>>> {
        if let Some(task) = self.peek_dump(&mut pools.dump).await? {
            return Ok(Some(task));
        }
        self.peek_compact(&mut pools.compact)
    }

    /// Pick the most urgent tree to dump, if a round is in progress and a
    /// dump worker is free.
    async fn peek_dump(&self, pool: &mut WorkerPool) -> Result<Option<Box<Task>>> {
        let mut worker: Option<Worker> = None;
        let out = loop {
            if !self.dump_in_progress() {
                break Ok(None);
            }
            let top = self.heaps.lock().unwrap().dump.top();
            let Some(lsm) = top else {
                // No trees at all; the round is trivially over.
                self.complete_dump_round();
                break Ok(None);
            };
            if lsm.is_dumping()
                || lsm.pin_count() > 0
                || lsm.generation() != self.dump_generation()
            {
                // Everything at the round's generation is already being
                // dumped, or every tree has moved past the round (a dirty
                // tree may have been dropped); either way there is nothing
                // left to build and the round may be over.
                self.complete_dump_round();
                break Ok(None);
            }
            if worker.is_none() {
                worker = pool.get();
                if worker.is_none() {
                    break Ok(None);
                }
            }
            match self.task_dump_new(&lsm).await {
                Ok(Some(mut task)) => {
                    task.worker = worker.take();
                    break Ok(Some(task));
                }
                // The tree's eligible memtables were all empty; try the
                // next tree.
                Ok(None) => continue,
                Err(e) => break Err(e),
            }
        };
        if let Some(worker) = worker.take() {
            pool.put(worker);
        }
        out
    }

    /// Pick the tree whose compaction reduces read amplification most, if
    /// it is worth compacting and a compact worker is free.
    fn peek_compact(&self, pool: &mut WorkerPool) -> Result<Option<Box<Task>>> {
        let mut worker: Option<Worker> = None;
        let out = loop {
            let top = self.heaps.lock().unwrap().compact.top();
            let Some(lsm) = top else {
                break Ok(None);
            };
            if lsm.compact_priority() <= 1 {
                break Ok(None);
            }
            if worker.is_none() {
                worker = pool.get();
                if worker.is_none() {
                    break Ok(None);
                }
            }
            match self.task_compact_new(&lsm) {
                Ok(Some(mut task)) => {
                    task.worker = worker.take();
                    break Ok(Some(task));
                }
                // The range was split or coalesced; selection starts over.
                Ok(None) => continue,
                Err(e) => break Err(e),
            }
        };
        if let Some(worker) = worker.take() {
            pool.put(worker);
        }
        out
    }

    /// Handle one completed task back on the coordinator. Returns the
    /// task's worker and whether the completion counts as a success.
    async fn process_task(&self, mut task: Box<Task>) -> (Option<Worker>, bool) {
        let worker = task.worker.take();
        let mut ok = true;
        if task.lsm.is_dropped() {
            // The tree is gone; undo quietly, this is not a failure.
            self.task_abort(&mut task);
        } else if task.is_failed {
            ok = false;
        } else if Injection::fire(&self.cfg.injection.task_complete_fail) {
            task.error = Some(Error::Injected("task completion".to_string()));
            ok = false;
        } else if let Err(e) = self.task_complete(&mut task).await {
            task.error = Some(e);
            ok = false;
        }
        if !ok {
            *self.last_error.lock().unwrap() = task.error.clone();
            self.task_abort(&mut task);
        }
        (worker, ok)
    }

    async fn run_loop(self: Arc<Self>, mut complete_rx: mpsc::UnboundedReceiver<Box<Task>>) {
        let mut pools = Pools {
            dump: WorkerPool::new(PoolKind::Dump, self.cfg.dump_threads(), self.complete_tx.clone()),
            compact: WorkerPool::new(
                PoolKind::Compact,
                self.cfg.compact_threads(),
                self.complete_tx.clone(),
            ),
        };
        let mut pending: VecDeque<Box<Task>> = VecDeque::new();

        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }

            // Complete everything the workers sent back.
            let mut done = 0usize;
            let mut failed = 0usize;
            loop {
                let task = match pending.pop_front() {
                    Some(task) => task,
                    None => match complete_rx.try_recv() {
                        Ok(task) => task,
                        Err(_) => break,
                    },
                };
                let (worker, ok) = self.process_task(task).await;
                if let Some(worker) = worker {
                    pools.put(worker);
                }
                if ok {
                    done += 1;
                } else {
                    failed += 1;
                }
            }
            if done > 0 {
                // Completion may suspend, so new completions may already be
                // queued; reset the failure timeout and recheck.
                *self.timeout.lock().unwrap() = 0.0;
                continue;
            }
            if failed == 0 {
                match self.schedule(&mut pools).await {
                    Ok(Some(task)) => {
                        pools.dispatch(task);
                        tokio::task::yield_now().await;
                        continue;
                    }
                    Ok(None) => {
                        // Nothing to do or all workers busy; wait for news.
                        tokio::select! {
                            _ = self.scheduler_cond.notified() => {}
                            task = complete_rx.recv() => {
                                if let Some(task) = task {
                                    pending.push_back(task);
                                }
                            }
                        }
                        continue;
                    }
                    Err(e) => {
                        *self.last_error.lock().unwrap() = Some(e);
                    }
                }
            }

            // A task failed, either executing or completing. Whatever broke
            // (disk, memory) will likely break again immediately, so back
            // off, and kick any checkpoint waiter so it can fail fast. The
            // throttle flag must be visible before the waiters wake.
            let timeout = {
                let mut timeout = self.timeout.lock().unwrap();
                *timeout = (*timeout * 2.0).clamp(self.cfg.timeout_min, self.cfg.timeout_max);
                *timeout
            };
            tracing::warn!(seconds = timeout, "throttling scheduler after task failure");
            self.is_throttled.store(true, Ordering::SeqCst);
            self.dump_cond.notify_waiters();
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(timeout)) => {}
                _ = self.stop_cond.notified() => {}
            }
            self.is_throttled.store(false, Ordering::SeqCst);
        }

        pools.stop().await;
        // Only now may the deferred loop go: cancelled workers still drain
        // their in-flight batches through it.
        self.deferred_stop.notify_one();
    }
}
