//! emberdb: background maintenance scheduler for an LSM-tree storage
//! engine.
//!
//! The crate implements the subsystem that keeps an LSM engine healthy
//! while transactions run: dumping sealed memtables to immutable on-disk
//! runs, compacting runs to bound read amplification, coordinating
//! checkpoints, and forwarding the deletes a primary-index compaction
//! uncovers to secondary indexes.
//!
//! # Architecture
//!
//! ```text
//!            trigger_dump / checkpoint / force_compaction
//!                              │
//!                              ▼
//!                    ┌──────────────────┐
//!      dump heap ───►│   Coordinator    │◄─── compact heap
//!                    │  (single task)   │
//!                    └──────────────────┘
//!                      │ tasks      ▲ completions
//!                      ▼            │
//!          ┌───────────────┐  ┌───────────────┐
//!          │  dump pool    │  │ compact pool  │
//!          │  (workers)    │  │  (workers)    │
//!          └───────────────┘  └───────────────┘
//!                      │
//!                      ▼
//!          runs on disk + metadata log
//! ```
//!
//! The coordinator is the only mutator of LSM state (trees, ranges, runs,
//! slices, memtables). Workers perform the heavy I/O: merging sources
//! through a read-view-respecting write iterator into a new run file.
//! Every structural change becomes visible through a transaction of the
//! append-only metadata log, which is also what recovery replays.

pub mod config;
pub mod errinj;
pub mod error;
pub mod heap;
pub mod lsm;
pub mod mem;
pub mod metalog;
pub mod range;
pub mod run;
pub mod scheduler;
pub mod stmt;
pub mod tmpfs;
pub mod witer;

pub use config::{LsmOpts, SchedulerConfig};
pub use error::{Error, Result};
pub use lsm::LsmTree;
pub use scheduler::deferred::{DeferredDeleteRecord, DeferredDeleteSink};
pub use scheduler::{DumpCompleteCallback, Scheduler};
pub use stmt::{KeyDef, ReadViewSet, Statement};
