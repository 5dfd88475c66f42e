//! Deferred DELETE routing.
//!
//! A primary-index compaction discovers overwrites that secondary indexes
//! never observed. The worker accumulates the (old, new) pairs in bounded
//! batches and ships them to the coordinator, which turns each pair into a
//! surrogate DELETE and hands it to the host's DML sink; the sink's replace
//! into the deferred-delete system table carries a trigger that propagates
//! the delete to every secondary index, making it WAL-durable without the
//! LSM engine materialising it.
//!
//! Backpressure: a worker blocks in `process` while `MAX_IN_PROGRESS`
//! batches are in flight, and `destroy` sleeps until the last batch comes
//! home. A coordinator-side failure travels back through the task control
//! block and cancels the producing task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use super::task::TaskCtl;
use crate::error::Result;
use crate::lsm::LsmTree;
use crate::stmt::{surrogate_delete, KeyDef, Statement};
use crate::witer::DeferredDeleteHandler;
use crate::Error;

/// Max number of statements in one batch of deferred DELETEs.
pub const DEFERRED_DELETE_BATCH_MAX: usize = 100;

/// Max number of batches in flight per task before the worker blocks.
pub const MAX_IN_PROGRESS: usize = 10;

/// One surrogate DELETE bound for the deferred-delete system table:
/// `(space_id, lsn, delete)` with the LSN of the overwriting statement.
#[derive(Clone, Debug, PartialEq)]
pub struct DeferredDeleteRecord {
    pub lsn: i64,
    pub delete: Statement,
}

/// The host's DML engine: executes one transaction replacing the given
/// records into the deferred-delete system table.
#[async_trait]
pub trait DeferredDeleteSink: Send + Sync {
    async fn apply(&self, space_id: u32, records: &[DeferredDeleteRecord]) -> Result<()>;
}

/// Count of batches a task has in flight, shared between the worker-side
/// handler and the coordinator-side processing loop.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn remove(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
        self.drained.notify_waiters();
    }

    /// Wait until fewer than `limit` batches are in flight.
    async fn wait_below(&self, limit: usize) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count() < limit {
                return;
            }
            notified.await;
        }
    }
}

/// A batch of deferred DELETEs travelling from a worker to the coordinator.
pub(crate) struct DeferredDeleteBatch {
    /// The primary-index tree whose compaction produced the batch.
    pub lsm: Arc<LsmTree>,
    pub key_def: KeyDef,
    /// (overwritten, overwriting) statement pairs.
    pub stmts: Vec<(Statement, Statement)>,
    pub ctl: Arc<TaskCtl>,
    pub in_flight: Arc<InFlight>,
}

/// Worker-side handler installed into the write iterator of a primary-index
/// compaction task.
pub(crate) struct TaskDeferredDelete {
    tx: mpsc::UnboundedSender<DeferredDeleteBatch>,
    lsm: Arc<LsmTree>,
    key_def: KeyDef,
    ctl: Arc<TaskCtl>,
    in_flight: Arc<InFlight>,
    batch: Vec<(Statement, Statement)>,
}

impl TaskDeferredDelete {
    pub fn new(
        tx: mpsc::UnboundedSender<DeferredDeleteBatch>,
        lsm: Arc<LsmTree>,
        key_def: KeyDef,
        ctl: Arc<TaskCtl>,
    ) -> Self {
        Self {
            tx,
            lsm,
            key_def,
            ctl,
            in_flight: Arc::new(InFlight::new()),
            batch: Vec::new(),
        }
    }

    fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let batch = DeferredDeleteBatch {
            lsm: Arc::clone(&self.lsm),
            key_def: self.key_def.clone(),
            stmts: std::mem::take(&mut self.batch),
            ctl: Arc::clone(&self.ctl),
            in_flight: Arc::clone(&self.in_flight),
        };
        self.in_flight.add();
        if self.tx.send(batch).is_err() {
            // Coordinator is gone; nothing will ack the batch.
            self.in_flight.remove();
        }
    }
}

#[async_trait]
impl DeferredDeleteHandler for TaskDeferredDelete {
    async fn process(&mut self, old: &Statement, new: &Statement) -> Result<()> {
        // Throttle the compaction if the coordinator cannot keep up, so the
        // number of batches in memory stays bounded.
        while self.in_flight.count() >= MAX_IN_PROGRESS {
            if self.ctl.is_cancelled() {
                return Err(Error::Cancelled);
            }
            tokio::select! {
                _ = self.in_flight.wait_below(MAX_IN_PROGRESS) => {}
                _ = self.ctl.cancelled() => return Err(Error::Cancelled),
            }
        }

        self.batch.push((old.clone(), new.clone()));
        if self.batch.len() == DEFERRED_DELETE_BATCH_MAX {
            self.flush();
        }
        Ok(())
    }

    async fn destroy(&mut self) -> Result<()> {
        self.flush();
        // Sleep until every batch comes home; cancellation wakes the sleep.
        // An outstanding batch keeps its own counter alive, so returning
        // early on cancel leaves nothing dangling.
        tokio::select! {
            _ = self.in_flight.wait_below(1) => Ok(()),
            _ = self.ctl.cancelled() => Err(Error::Cancelled),
        }
    }
}

/// Coordinator-side loop: applies each batch through the sink, acks it, and
/// fails the producing task if the DML goes wrong. Dropped trees are
/// skipped silently, the space may legitimately disappear mid-compaction.
pub(crate) async fn deferred_loop(
    mut rx: mpsc::UnboundedReceiver<DeferredDeleteBatch>,
    sink: Arc<dyn DeferredDeleteSink>,
    stop: Arc<Notify>,
) {
    loop {
        tokio::select! {
            batch = rx.recv() => match batch {
                Some(batch) => process_batch(batch, sink.as_ref()).await,
                None => break,
            },
            _ = stop.notified() => break,
        }
    }
}

async fn process_batch(batch: DeferredDeleteBatch, sink: &dyn DeferredDeleteSink) {
    if !batch.lsm.is_dropped() {
        let records: Vec<DeferredDeleteRecord> = batch
            .stmts
            .iter()
            .map(|(old, new)| DeferredDeleteRecord {
                lsn: new.lsn,
                delete: surrogate_delete(&batch.key_def, old, new.lsn),
            })
            .collect();
        if let Err(e) = sink.apply(batch.lsm.space_id(), &records).await {
            tracing::error!(lsm = %batch.lsm.name(), error = %e, "deferred delete batch failed");
            batch.ctl.fail(Error::DeferredDelete(e.to_string()));
            batch.ctl.cancel();
        }
    }
    batch.in_flight.remove();
}
