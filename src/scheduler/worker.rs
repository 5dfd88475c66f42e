//! Worker pools.
//!
//! Background work runs in two fixed-size pools, one for dumps and one for
//! compactions, so a pile of long compactions can never starve the dumps
//! that release memory. A pool starts its workers lazily on first demand;
//! each worker owns one in-bound pipe from the coordinator and sends
//! finished tasks back on the shared completion pipe. One task executes
//! per worker at a time.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::task::{Task, TaskCtl};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PoolKind {
    Dump,
    Compact,
}

impl PoolKind {
    fn name(self) -> &'static str {
        match self {
            PoolKind::Dump => "dump",
            PoolKind::Compact => "compact",
        }
    }
}

/// A leased worker: the handle the coordinator holds between `get` and `put`.
/// The worker's pipe stays with the pool; tasks are shipped through
/// [`WorkerPool::send`] so a completed task in flight never keeps its own
/// worker's pipe open across shutdown.
pub(crate) struct Worker {
    pub(crate) kind: PoolKind,
    pub(crate) index: usize,
}

struct WorkerSlot {
    pipe: mpsc::UnboundedSender<Box<Task>>,
    handle: JoinHandle<()>,
    /// Control block of the task currently executing on this worker.
    current: Arc<Mutex<Option<Arc<TaskCtl>>>>,
}

pub(crate) struct WorkerPool {
    kind: PoolKind,
    size: usize,
    slots: Option<Vec<WorkerSlot>>,
    idle: Vec<usize>,
    complete_tx: mpsc::UnboundedSender<Box<Task>>,
}

impl WorkerPool {
    pub fn new(kind: PoolKind, size: usize, complete_tx: mpsc::UnboundedSender<Box<Task>>) -> Self {
        Self {
            kind,
            size,
            slots: None,
            idle: Vec::new(),
            complete_tx,
        }
    }

    /// Start worker tasks. Deferred to the first `get` so idle pools cost
    /// nothing.
    fn start(&mut self) {
        debug_assert!(self.slots.is_none());
        let mut slots = Vec::with_capacity(self.size);
        for index in 0..self.size {
            let (tx, rx) = mpsc::unbounded_channel();
            let current = Arc::new(Mutex::new(None));
            let handle = tokio::spawn(worker_loop(
                self.kind,
                index,
                rx,
                self.complete_tx.clone(),
                Arc::clone(&current),
            ));
            slots.push(WorkerSlot {
                pipe: tx,
                handle,
                current,
            });
            self.idle.push(index);
        }
        self.slots = Some(slots);
        tracing::debug!(pool = self.kind.name(), size = self.size, "worker pool started");
    }

    /// Lease an idle worker, or `None` when all are busy.
    pub fn get(&mut self) -> Option<Worker> {
        if self.slots.is_none() {
            self.start();
        }
        let index = self.idle.pop()?;
        Some(Worker {
            kind: self.kind,
            index,
        })
    }

    /// Return a worker to the idle list.
    pub fn put(&mut self, worker: Worker) {
        debug_assert_eq!(worker.kind, self.kind);
        self.idle.push(worker.index);
    }

    /// Ship a task to the worker leased for it.
    pub fn send(&self, task: Box<Task>) {
        let Some(index) = task.worker.as_ref().map(|w| w.index) else {
            return;
        };
        if let Some(slots) = self.slots.as_ref() {
            let _ = slots[index].pipe.send(task);
        }
    }

    /// Cancel whatever is running, close the pipes and join the workers.
    pub async fn stop(&mut self) {
        let Some(slots) = self.slots.take() else {
            return;
        };
        for slot in &slots {
            if let Some(ctl) = slot.current.lock().unwrap().as_ref() {
                ctl.cancel();
            }
        }
        for slot in slots {
            drop(slot.pipe);
            if let Err(e) = slot.handle.await {
                tracing::warn!(pool = self.kind.name(), error = %e, "worker join failed");
            }
        }
        self.idle.clear();
    }
}

async fn worker_loop(
    kind: PoolKind,
    index: usize,
    mut rx: mpsc::UnboundedReceiver<Box<Task>>,
    complete_tx: mpsc::UnboundedSender<Box<Task>>,
    current: Arc<Mutex<Option<Arc<TaskCtl>>>>,
) {
    while let Some(mut task) = rx.recv().await {
        *current.lock().unwrap() = Some(Arc::clone(&task.ctl));
        task.run_execute().await;
        *current.lock().unwrap() = None;
        if complete_tx.send(task).is_err() {
            break;
        }
    }
    tracing::debug!(pool = kind.name(), index, "worker stopped");
}
