//! Write iterator: the sorted, read-view-respecting merge feeding a run.
//!
//! A dump merges sealed memtables; a compaction merges range slices. Either
//! way the sources are individually sorted by (key asc, LSN desc) and the
//! merge must stay lazy: sources can be far larger than memory.
//!
//! # Merge Strategy
//!
//! A min-heap holds the head statement of every source:
//!
//! ```text
//! Sources:  [a@9, c@4, ...]  [a@3, b@7, ...]  [d@2, ...]
//!               ↓                ↓                ↓
//! Heap:     [  a@9,            a@3,             d@2  ]
//!               ↓ (pop minimum: key, then newest LSN)
//! Output:       a@9
//! ```
//!
//! All versions of one key surface consecutively, newest first, and are
//! filtered as a group against the active read views: the newest version
//! always survives, one version survives per read view that can still see
//! it, and history below the oldest read view collapses to a single
//! version. On the last level a surviving tombstone with nothing underneath
//! is dropped entirely.
//!
//! # Deferred DELETEs
//!
//! When a primary-index compaction discards an older REPLACE shadowed by a
//! newer statement, secondary indexes never get to see the overwrite. With
//! a deferred-delete handler installed, the iterator reports each such
//! (old, new) pair so the coordinator can propagate the delete.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::mem::Memtable;
use crate::run::Slice;
use crate::stmt::{KeyDef, ReadViewSet, Statement};
use crate::Error;

/// Receives the (old, new) pairs a primary-index compaction shadows.
/// `process` may block on backpressure; `destroy` flushes and waits for all
/// in-flight batches to come home.
#[async_trait]
pub trait DeferredDeleteHandler: Send {
    async fn process(&mut self, old: &Statement, new: &Statement) -> Result<()>;
    async fn destroy(&mut self) -> Result<()>;
}

enum Source {
    Mem(Arc<Memtable>),
    Slice(Arc<Slice>),
}

type SourceIter = Box<dyn Iterator<Item = Result<Statement>> + Send>;

struct HeapEntry {
    stmt: Statement,
    source_index: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Key ascending, then LSN descending, then source index; reversed
        // for min-heap behavior.
        self.stmt
            .key
            .cmp(&other.stmt.key)
            .then_with(|| other.stmt.lsn.cmp(&self.stmt.lsn))
            .then_with(|| self.source_index.cmp(&other.source_index))
            .reverse()
    }
}

pub struct WriteIterator {
    cmp_def: KeyDef,
    is_primary: bool,
    is_last_level: bool,
    read_views: Arc<ReadViewSet>,
    /// Snapshot taken at `start`, ascending.
    views: Vec<i64>,
    sources: Vec<Source>,
    iters: Vec<SourceIter>,
    heap: BinaryHeap<HeapEntry>,
    pending: VecDeque<Statement>,
    handler: Option<Box<dyn DeferredDeleteHandler>>,
    started: bool,
}

impl WriteIterator {
    pub fn new(
        cmp_def: KeyDef,
        is_primary: bool,
        is_last_level: bool,
        read_views: Arc<ReadViewSet>,
        handler: Option<Box<dyn DeferredDeleteHandler>>,
    ) -> Self {
        Self {
            cmp_def,
            is_primary,
            is_last_level,
            read_views,
            views: Vec::new(),
            sources: Vec::new(),
            iters: Vec::new(),
            heap: BinaryHeap::new(),
            pending: VecDeque::new(),
            handler,
            started: false,
        }
    }

    /// Add a sealed memtable source. Sources must be added newest first.
    pub fn add_mem(&mut self, mem: Arc<Memtable>) {
        debug_assert!(!self.started);
        self.sources.push(Source::Mem(mem));
    }

    /// Add a slice source. Sources must be added newest first.
    pub fn add_slice(&mut self, slice: Arc<Slice>) {
        debug_assert!(!self.started);
        slice.pin();
        self.sources.push(Source::Slice(slice));
    }

    /// Open the sources and prime the merge heap.
    pub async fn start(&mut self) -> Result<()> {
        debug_assert!(!self.started);
        self.started = true;
        self.views = self.read_views.snapshot();
        for source in &self.sources {
            let iter: SourceIter = match source {
                Source::Mem(mem) => Box::new(mem.iter()),
                Source::Slice(slice) => Box::new(slice.iter()?),
            };
            self.iters.push(iter);
        }
        for index in 0..self.iters.len() {
            self.advance(index)?;
        }
        Ok(())
    }

    fn advance(&mut self, source_index: usize) -> Result<()> {
        if let Some(stmt) = self.iters[source_index].next() {
            let stmt = stmt.map_err(|e| Error::WriteIterator(e.to_string()))?;
            self.heap.push(HeapEntry { stmt, source_index });
        }
        Ok(())
    }

    /// Next statement for the output run, or `None` at the end.
    pub async fn next(&mut self) -> Result<Option<Statement>> {
        debug_assert!(self.started);
        loop {
            if let Some(stmt) = self.pending.pop_front() {
                return Ok(Some(stmt));
            }

            // Gather every version of the next key, newest first.
            let Some(first) = self.heap.pop() else {
                return Ok(None);
            };
            let key = first.stmt.key.clone();
            let mut versions = vec![first.stmt];
            self.advance(first.source_index)?;
            while let Some(entry) = self.heap.peek() {
                if self.cmp_def.compare(&entry.stmt.key, &key) != Ordering::Equal {
                    break;
                }
                let entry = match self.heap.pop() {
                    Some(entry) => entry,
                    None => break,
                };
                // The same statement may be present in two sources when a
                // dump raced a compaction; keep the copy from the newer one.
                if versions.last().map(|s: &Statement| s.lsn) != Some(entry.stmt.lsn) {
                    versions.push(entry.stmt);
                }
                self.advance(entry.source_index)?;
            }

            let emitted = self.filter_versions(versions).await?;
            self.pending = emitted.into();
        }
    }

    /// Decide which versions of one key survive, newest first on input and
    /// output.
    async fn filter_versions(&mut self, versions: Vec<Statement>) -> Result<Vec<Statement>> {
        let mut keep = vec![false; versions.len()];
        // The newest version is the current state and always survives.
        keep[0] = true;
        // One version survives per read view that can still see it.
        for &view in &self.views {
            if let Some(i) = versions.iter().position(|s| s.lsn <= view) {
                keep[i] = true;
            }
        }

        // Report shadowed REPLACE statements that are about to disappear
        // from the primary index.
        if self.is_primary && self.handler.is_some() {
            for i in 1..versions.len() {
                if keep[i] || versions[i].is_delete() {
                    continue;
                }
                let (newer, older) = {
                    let (head, tail) = versions.split_at(i);
                    (&head[i - 1], &tail[0])
                };
                if let Some(handler) = self.handler.as_mut() {
                    handler.process(older, newer).await?;
                }
            }
        }

        let mut emitted: Vec<Statement> = versions
            .into_iter()
            .zip(keep)
            .filter(|(_, keep)| *keep)
            .map(|(stmt, _)| stmt)
            .collect();

        // At the last level there is nothing underneath: a tombstone at the
        // bottom of the surviving history carries no information.
        if self.is_last_level {
            let below_views = |lsn: i64| self.views.first().map_or(true, |&oldest| lsn <= oldest);
            if let Some(last) = emitted.last() {
                if last.is_delete() && (emitted.len() > 1 || below_views(last.lsn)) {
                    emitted.pop();
                }
            }
        }
        Ok(emitted)
    }

    /// Worker-side teardown: flush and drain the deferred-delete handler.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(mut handler) = self.handler.take() {
            handler.destroy().await?;
        }
        Ok(())
    }

    /// Coordinator-side teardown: release sources.
    pub fn close(&mut self) {
        self.iters.clear();
        self.heap.clear();
        for source in self.sources.drain(..) {
            if let Source::Slice(slice) = source {
                slice.unpin();
            }
        }
    }
}

impl Drop for WriteIterator {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{Run, RunWriter};
    use crate::tmpfs::TempDir;
    use std::sync::Mutex;

    async fn collect(wi: &mut WriteIterator) -> Vec<Statement> {
        let mut out = Vec::new();
        wi.start().await.unwrap();
        while let Some(stmt) = wi.next().await.unwrap() {
            out.push(stmt);
        }
        wi.stop().await.unwrap();
        out
    }

    fn mem_with(stmts: &[Statement]) -> Arc<Memtable> {
        let mem = Arc::new(Memtable::new(0));
        for stmt in stmts {
            mem.insert(stmt.clone()).unwrap();
        }
        mem
    }

    fn slice_with(dir: &TempDir, id: i64, stmts: &[Statement]) -> Arc<Slice> {
        let path = dir.path().join(format!("{:016}.run", id));
        let mut writer = RunWriter::create(&path, 4096, 0.05).unwrap();
        for stmt in stmts {
            writer.append_stmt(stmt).unwrap();
        }
        let info = writer.commit().unwrap();
        let run = Arc::new(Run::new(id, path));
        run.commit_info(info);
        Slice::new(id + 1000, run, None, None)
    }

    fn wi(is_last_level: bool, views: &[i64]) -> WriteIterator {
        let read_views = Arc::new(ReadViewSet::new());
        for &view in views {
            read_views.open(view);
        }
        WriteIterator::new(KeyDef::new(), true, is_last_level, read_views, None)
    }

    #[tokio::test]
    async fn test_merge_two_mems() {
        let newer = mem_with(&[Statement::replace(b"a".to_vec(), b"2".to_vec(), 2)]);
        let older = mem_with(&[
            Statement::replace(b"a".to_vec(), b"1".to_vec(), 1),
            Statement::replace(b"b".to_vec(), b"1".to_vec(), 1),
        ]);

        let mut it = wi(false, &[]);
        it.add_mem(newer);
        it.add_mem(older);
        let out = collect(&mut it).await;

        // No read views: history collapses to the newest version per key.
        assert_eq!(
            out,
            vec![
                Statement::replace(b"a".to_vec(), b"2".to_vec(), 2),
                Statement::replace(b"b".to_vec(), b"1".to_vec(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_read_view_preserves_old_version() {
        let mem = mem_with(&[
            Statement::replace(b"a".to_vec(), b"1".to_vec(), 1),
            Statement::replace(b"a".to_vec(), b"2".to_vec(), 5),
        ]);

        let mut it = wi(false, &[3]);
        it.add_mem(mem);
        let out = collect(&mut it).await;

        // A reader at LSN 3 still needs a@1.
        assert_eq!(
            out,
            vec![
                Statement::replace(b"a".to_vec(), b"2".to_vec(), 5),
                Statement::replace(b"a".to_vec(), b"1".to_vec(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_last_level_drops_tombstone() {
        let mem = mem_with(&[
            Statement::replace(b"a".to_vec(), b"1".to_vec(), 1),
            Statement::delete(b"a".to_vec(), 2),
            Statement::replace(b"b".to_vec(), b"1".to_vec(), 1),
        ]);

        let mut it = wi(true, &[]);
        it.add_mem(mem);
        let out = collect(&mut it).await;
        assert_eq!(out, vec![Statement::replace(b"b".to_vec(), b"1".to_vec(), 1)]);

        // On an intermediate level the tombstone must survive to shadow
        // older runs.
        let mem = mem_with(&[
            Statement::replace(b"a".to_vec(), b"1".to_vec(), 1),
            Statement::delete(b"a".to_vec(), 2),
        ]);
        let mut it = wi(false, &[]);
        it.add_mem(mem);
        let out = collect(&mut it).await;
        assert_eq!(out, vec![Statement::delete(b"a".to_vec(), 2)]);
    }

    #[tokio::test]
    async fn test_merge_mem_and_slice() {
        let dir = TempDir::new().unwrap();
        let slice = slice_with(
            &dir,
            1,
            &[
                Statement::replace(b"a".to_vec(), b"old".to_vec(), 1),
                Statement::replace(b"c".to_vec(), b"keep".to_vec(), 2),
            ],
        );
        let mem = mem_with(&[Statement::replace(b"a".to_vec(), b"new".to_vec(), 9)]);

        let mut it = wi(false, &[]);
        it.add_mem(mem);
        it.add_slice(slice.clone());
        assert_eq!(slice.pin_count(), 1, "sources are pinned while merging");

        let out = collect(&mut it).await;
        assert_eq!(
            out,
            vec![
                Statement::replace(b"a".to_vec(), b"new".to_vec(), 9),
                Statement::replace(b"c".to_vec(), b"keep".to_vec(), 2),
            ]
        );
        it.close();
        assert_eq!(slice.pin_count(), 0);
    }

    struct RecordingHandler {
        pairs: Arc<Mutex<Vec<(Statement, Statement)>>>,
    }

    #[async_trait]
    impl DeferredDeleteHandler for RecordingHandler {
        async fn process(&mut self, old: &Statement, new: &Statement) -> Result<()> {
            self.pairs.lock().unwrap().push((old.clone(), new.clone()));
            Ok(())
        }

        async fn destroy(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_deferred_delete_emission() {
        let pairs = Arc::new(Mutex::new(Vec::new()));
        let handler = Box::new(RecordingHandler {
            pairs: Arc::clone(&pairs),
        });

        let mem = mem_with(&[
            Statement::replace(b"a".to_vec(), b"old".to_vec(), 1),
            Statement::replace(b"a".to_vec(), b"new".to_vec(), 42),
            // A discarded tombstone does not need propagation.
            Statement::delete(b"b".to_vec(), 2),
            Statement::replace(b"b".to_vec(), b"x".to_vec(), 3),
        ]);

        let mut it = WriteIterator::new(
            KeyDef::new(),
            true,
            false,
            Arc::new(ReadViewSet::new()),
            Some(handler),
        );
        it.add_mem(mem);
        let out = collect(&mut it).await;

        assert_eq!(out.len(), 2);
        let pairs = pairs.lock().unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(
            pairs[0],
            (
                Statement::replace(b"a".to_vec(), b"old".to_vec(), 1),
                Statement::replace(b"a".to_vec(), b"new".to_vec(), 42),
            )
        );
    }

    #[tokio::test]
    async fn test_no_deferred_on_secondary() {
        let pairs = Arc::new(Mutex::new(Vec::new()));
        let handler = Box::new(RecordingHandler {
            pairs: Arc::clone(&pairs),
        });
        let mem = mem_with(&[
            Statement::replace(b"a".to_vec(), b"old".to_vec(), 1),
            Statement::replace(b"a".to_vec(), b"new".to_vec(), 2),
        ]);

        let mut it = WriteIterator::new(
            KeyDef::new(),
            false,
            false,
            Arc::new(ReadViewSet::new()),
            Some(handler),
        );
        it.add_mem(mem);
        let _ = collect(&mut it).await;
        assert!(pairs.lock().unwrap().is_empty());
    }
}
