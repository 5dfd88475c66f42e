//! On-disk runs, the run writer, and slices.
//!
//! A run is an immutable sorted file of statements produced by a dump or a
//! compaction. Runs never participate in reads directly: a *slice* pins a
//! contiguous sub-interval of a run into one range, and a run may be deleted
//! only when no slice references it and no checkpoint retains it.
//!
//! ## Run File Layout
//!
//! ```text
//! +-------------------+
//! | Data Block 1      |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | Data Block N      |
//! +-------------------+
//! | Index Block       |
//! +-------------------+
//! | Index Offset (u64)|
//! +-------------------+
//! ```
//!
//! Each data block is `count:u32 | statements | crc32:u32`, cut at the
//! per-LSM page size. The index block records the first key, offset, size
//! and statement count of every data block, the run's min/max keys and max
//! LSN, and a bloom filter over keys sized from the per-LSM false-positive
//! rate. Big-endian encoding, CRC32 checksums.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::Crc;
use tokio::sync::Notify;

use crate::error::Result;
use crate::stmt::Statement;
use crate::Error;

const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);
const CRC64_A: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_ECMA_182);
const CRC64_B: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_XZ);

/// Directory layout for run files: one directory per index, one file per run.
#[derive(Debug, Clone)]
pub struct RunEnv {
    dir: PathBuf,
}

impl RunEnv {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index_dir(&self, space_id: u32, index_id: u32) -> PathBuf {
        self.dir.join(format!("{}.{}", space_id, index_id))
    }

    pub fn run_path(&self, space_id: u32, index_id: u32, run_id: i64) -> PathBuf {
        self.index_dir(space_id, index_id)
            .join(format!("{:016}.run", run_id))
    }
}

/// Sparse index entry: one per data block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockMeta {
    pub first_key: Vec<u8>,
    pub offset: u64,
    pub size: u64,
    pub count: u32,
}

/// Everything recorded about a run when its writer commits.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub count: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub max_lsn: i64,
    pub blocks: Vec<BlockMeta>,
    pub bloom: Bloom,
}

impl RunInfo {
    fn empty() -> Self {
        Self {
            count: 0,
            min_key: Vec::new(),
            max_key: Vec::new(),
            max_lsn: -1,
            blocks: Vec::new(),
            bloom: Bloom::build(&[], 0.05),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(self.blocks.len() as u32).unwrap();
        for block in &self.blocks {
            write_bytes(&mut buf, &block.first_key);
            buf.write_u64::<BigEndian>(block.offset).unwrap();
            buf.write_u64::<BigEndian>(block.size).unwrap();
            buf.write_u32::<BigEndian>(block.count).unwrap();
        }
        write_bytes(&mut buf, &self.min_key);
        write_bytes(&mut buf, &self.max_key);
        buf.write_u64::<BigEndian>(self.count).unwrap();
        buf.write_i64::<BigEndian>(self.max_lsn).unwrap();
        self.bloom.encode_into(&mut buf);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let block_count = cursor.read_u32::<BigEndian>()? as usize;
        let mut blocks = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            let first_key = read_bytes(&mut cursor)?;
            let offset = cursor.read_u64::<BigEndian>()?;
            let size = cursor.read_u64::<BigEndian>()?;
            let count = cursor.read_u32::<BigEndian>()?;
            blocks.push(BlockMeta {
                first_key,
                offset,
                size,
                count,
            });
        }
        let min_key = read_bytes(&mut cursor)?;
        let max_key = read_bytes(&mut cursor)?;
        let count = cursor.read_u64::<BigEndian>()?;
        let max_lsn = cursor.read_i64::<BigEndian>()?;
        let bloom = Bloom::decode_from(&mut cursor)?;
        Ok(Self {
            count,
            min_key,
            max_key,
            max_lsn,
            blocks,
            bloom,
        })
    }
}

/// An immutable on-disk run.
///
/// `info` is set exactly once, by the worker that commits the run writer;
/// until then the run is in the Prepared state (logged, no file).
/// `compacted_slice_count` is coordinator-only scratch used while computing
/// the unused-run set during compaction completion.
#[derive(Debug)]
pub struct Run {
    id: i64,
    path: PathBuf,
    dump_lsn: AtomicI64,
    info: OnceLock<RunInfo>,
    slice_count: AtomicUsize,
    compacted_slice_count: AtomicUsize,
}

impl Run {
    pub fn new(id: i64, path: PathBuf) -> Self {
        Self {
            id,
            path,
            dump_lsn: AtomicI64::new(-1),
            info: OnceLock::new(),
            slice_count: AtomicUsize::new(0),
            compacted_slice_count: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dump_lsn(&self) -> i64 {
        self.dump_lsn.load(Ordering::SeqCst)
    }

    pub fn set_dump_lsn(&self, lsn: i64) {
        self.dump_lsn.store(lsn, Ordering::SeqCst);
    }

    pub fn info(&self) -> Option<&RunInfo> {
        self.info.get()
    }

    pub fn commit_info(&self, info: RunInfo) {
        let _ = self.info.set(info);
    }

    pub fn is_empty(&self) -> bool {
        self.info.get().map_or(true, |info| info.count == 0)
    }

    pub fn slice_count(&self) -> usize {
        self.slice_count.load(Ordering::SeqCst)
    }

    pub fn compacted_slice_count(&self) -> usize {
        self.compacted_slice_count.load(Ordering::SeqCst)
    }

    pub fn mark_slice_compacted(&self) {
        self.compacted_slice_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn reset_compacted_slices(&self) {
        self.compacted_slice_count.store(0, Ordering::SeqCst);
    }

    /// Open an existing run file and read back its index.
    pub fn open(id: i64, path: PathBuf) -> Result<Arc<Self>> {
        let mut file = File::open(&path)?;
        let len = file.metadata()?.len();
        if len < 8 {
            return Err(Error::InvalidData(format!(
                "run file too short: {}",
                path.display()
            )));
        }
        file.seek(SeekFrom::End(-8))?;
        let index_offset = file.read_u64::<BigEndian>()?;
        file.seek(SeekFrom::Start(index_offset))?;
        let index_len = file.read_u32::<BigEndian>()? as usize;
        let mut payload = vec![0u8; index_len];
        file.read_exact(&mut payload)?;
        let stored_crc = file.read_u32::<BigEndian>()?;
        if CRC32.checksum(&payload) != stored_crc {
            return Err(Error::InvalidData("run index checksum mismatch".to_string()));
        }
        let info = RunInfo::decode(&payload)?;

        let run = Run::new(id, path);
        run.set_dump_lsn(info.max_lsn);
        run.commit_info(info);
        Ok(Arc::new(run))
    }

    /// Remove the run's file from disk. Missing files are fine: the file may
    /// have never been written (empty run) or already removed by recovery.
    pub fn remove_files(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Streams a sorted sequence of statements into a new run file.
///
/// Contract: `create`, repeated `append_stmt` in key order, then either
/// `commit` (durability achieved, info returned) or `abort` (partial file
/// removed). Committing with no appended statements removes the file and
/// returns empty info.
pub struct RunWriter {
    file: BufWriter<File>,
    path: PathBuf,
    page_size: usize,
    bloom_fpr: f64,
    block: Vec<u8>,
    block_count: u32,
    block_first_key: Option<Vec<u8>>,
    blocks: Vec<BlockMeta>,
    offset: u64,
    count: u64,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    max_lsn: i64,
    key_hashes: Vec<(u64, u64)>,
}

impl RunWriter {
    pub fn create(path: &Path, page_size: usize, bloom_fpr: f64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = BufWriter::new(File::create(path)?);
        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size: page_size.max(64),
            bloom_fpr,
            block: Vec::new(),
            block_count: 0,
            block_first_key: None,
            blocks: Vec::new(),
            offset: 0,
            count: 0,
            min_key: Vec::new(),
            max_key: Vec::new(),
            max_lsn: -1,
            key_hashes: Vec::new(),
        })
    }

    pub fn append_stmt(&mut self, stmt: &Statement) -> Result<()> {
        if self.count == 0 {
            self.min_key = stmt.key.clone();
        }
        self.max_key = stmt.key.clone();
        self.max_lsn = self.max_lsn.max(stmt.lsn);
        self.count += 1;
        self.key_hashes
            .push((CRC64_A.checksum(&stmt.key), CRC64_B.checksum(&stmt.key)));

        if self.block_first_key.is_none() {
            self.block_first_key = Some(stmt.key.clone());
        }
        encode_stmt(&mut self.block, stmt);
        self.block_count += 1;

        if self.block.len() >= self.page_size {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        let first_key = match self.block_first_key.take() {
            Some(key) => key,
            None => return Ok(()),
        };
        let crc = CRC32.checksum(&self.block);
        self.file.write_u32::<BigEndian>(self.block_count)?;
        self.file.write_all(&self.block)?;
        self.file.write_u32::<BigEndian>(crc)?;

        let size = 4 + self.block.len() as u64 + 4;
        self.blocks.push(BlockMeta {
            first_key,
            offset: self.offset,
            size,
            count: self.block_count,
        });
        self.offset += size;
        self.block.clear();
        self.block_count = 0;
        Ok(())
    }

    /// Finish the run: flush the last block, write the index and footer, and
    /// sync to disk. An empty run leaves no file behind.
    pub fn commit(mut self) -> Result<RunInfo> {
        if self.count == 0 {
            drop(self.file);
            let _ = fs::remove_file(&self.path);
            return Ok(RunInfo::empty());
        }
        self.flush_block()?;

        let info = RunInfo {
            count: self.count,
            min_key: std::mem::take(&mut self.min_key),
            max_key: std::mem::take(&mut self.max_key),
            max_lsn: self.max_lsn,
            blocks: std::mem::take(&mut self.blocks),
            bloom: Bloom::build(&self.key_hashes, self.bloom_fpr),
        };

        let payload = info.encode();
        let index_offset = self.offset;
        self.file.write_u32::<BigEndian>(payload.len() as u32)?;
        self.file.write_all(&payload)?;
        self.file.write_u32::<BigEndian>(CRC32.checksum(&payload))?;
        self.file.write_u64::<BigEndian>(index_offset)?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(info)
    }

    /// Drop the writer and remove the partial file.
    pub fn abort(self) {
        let path = self.path.clone();
        drop(self.file);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove aborted run file");
            }
        }
    }
}

/// A reference to a contiguous sub-interval of a run within one range.
///
/// Slices are the only way a run participates in reads. Readers pin a slice
/// while iterating it; compaction completion waits for those pins to drain
/// before letting the slice go.
#[derive(Debug)]
pub struct Slice {
    id: i64,
    run: Arc<Run>,
    begin: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    count: u64,
    pins: AtomicUsize,
    unpinned: Notify,
}

impl Slice {
    pub fn new(id: i64, run: Arc<Run>, begin: Option<Vec<u8>>, end: Option<Vec<u8>>) -> Arc<Self> {
        let count = estimate_count(&run, begin.as_deref(), end.as_deref());
        run.slice_count.fetch_add(1, Ordering::SeqCst);
        Arc::new(Self {
            id,
            run,
            begin,
            end,
            count,
            pins: AtomicUsize::new(0),
            unpinned: Notify::new(),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn run(&self) -> &Arc<Run> {
        &self.run
    }

    pub fn begin(&self) -> Option<&Vec<u8>> {
        self.begin.as_ref()
    }

    pub fn end(&self) -> Option<&Vec<u8>> {
        self.end.as_ref()
    }

    /// Statement count estimate for this slice, from the run's block index.
    pub fn count(&self) -> u64 {
        self.count
    }

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

    /// Wait until all reader pins are released.
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

    /// Open a statement iterator over this slice's interval of the run.
    pub fn iter(&self) -> Result<SliceIterator> {
        let info = self
            .run
            .info()
            .ok_or_else(|| Error::InvalidOperation("slice over uncommitted run".to_string()))?;
        let file = BufReader::new(File::open(self.run.path())?);
        let start = start_block(&info.blocks, self.begin.as_deref());
        Ok(SliceIterator {
            file,
            blocks: info.blocks.clone(),
            next_block: start,
            buffered: std::collections::VecDeque::new(),
            begin: self.begin.clone(),
            end: self.end.clone(),
            done: false,
        })
    }
}

impl Drop for Slice {
    fn drop(&mut self) {
        self.run.slice_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Sequential reader over one slice's key interval.
pub struct SliceIterator {
    file: BufReader<File>,
    blocks: Vec<BlockMeta>,
    next_block: usize,
    buffered: std::collections::VecDeque<Statement>,
    begin: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    done: bool,
}

impl SliceIterator {
    fn load_block(&mut self) -> Result<bool> {
        let Some(meta) = self.blocks.get(self.next_block).cloned() else {
            return Ok(false);
        };
        self.next_block += 1;
        if let Some(end) = &self.end {
            if meta.first_key.as_slice() >= end.as_slice() {
                return Ok(false);
            }
        }

        self.file.seek(SeekFrom::Start(meta.offset))?;
        let count = self.file.read_u32::<BigEndian>()?;
        let payload_len = meta.size as usize - 8;
        let mut payload = vec![0u8; payload_len];
        self.file.read_exact(&mut payload)?;
        let stored_crc = self.file.read_u32::<BigEndian>()?;
        if CRC32.checksum(&payload) != stored_crc {
            return Err(Error::InvalidData("run block checksum mismatch".to_string()));
        }

        let mut cursor = Cursor::new(payload.as_slice());
        for _ in 0..count {
            let stmt = decode_stmt(&mut cursor)?;
            if let Some(begin) = &self.begin {
                if stmt.key.as_slice() < begin.as_slice() {
                    continue;
                }
            }
            if let Some(end) = &self.end {
                if stmt.key.as_slice() >= end.as_slice() {
                    return Ok(!self.buffered.is_empty());
                }
            }
            self.buffered.push_back(stmt);
        }
        Ok(true)
    }
}

impl Iterator for SliceIterator {
    type Item = Result<Statement>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(stmt) = self.buffered.pop_front() {
                return Some(Ok(stmt));
            }
            if self.done {
                return None;
            }
            match self.load_block() {
                Ok(true) => continue,
                Ok(false) => {
                    self.done = true;
                    if self.buffered.is_empty() {
                        return None;
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Bloom filter over run keys, double-hashed from two CRC64 checksums.
#[derive(Debug, Clone)]
pub struct Bloom {
    k: u32,
    nbits: u64,
    words: Vec<u64>,
}

impl Bloom {
    /// Build a filter sized for `hashes.len()` keys at the given
    /// false-positive rate.
    pub fn build(hashes: &[(u64, u64)], fpr: f64) -> Self {
        let n = hashes.len().max(1) as f64;
        let fpr = fpr.clamp(0.0001, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let nbits = ((-n * fpr.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let k = (((nbits as f64 / n) * ln2).round() as u32).max(1);
        let mut filter = Self {
            k,
            nbits,
            words: vec![0u64; nbits.div_ceil(64) as usize],
        };
        for &(h1, h2) in hashes {
            filter.set(h1, h2);
        }
        filter
    }

    fn set(&mut self, h1: u64, h2: u64) {
        for i in 0..self.k as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.nbits;
            self.words[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    pub fn may_contain(&self, key: &[u8]) -> bool {
        let h1 = CRC64_A.checksum(key);
        let h2 = CRC64_B.checksum(key);
        for i in 0..self.k as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.nbits;
            if self.words[(bit / 64) as usize] & (1 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<BigEndian>(self.k).unwrap();
        buf.write_u64::<BigEndian>(self.nbits).unwrap();
        buf.write_u32::<BigEndian>(self.words.len() as u32).unwrap();
        for word in &self.words {
            buf.write_u64::<BigEndian>(*word).unwrap();
        }
    }

    fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let k = cursor.read_u32::<BigEndian>()?;
        let nbits = cursor.read_u64::<BigEndian>()?;
        let word_count = cursor.read_u32::<BigEndian>()? as usize;
        let mut words = Vec::with_capacity(word_count);
        for _ in 0..word_count {
            words.push(cursor.read_u64::<BigEndian>()?);
        }
        if nbits == 0 || words.len() != nbits.div_ceil(64) as usize {
            return Err(Error::InvalidData("corrupt bloom filter".to_string()));
        }
        Ok(Self { k, nbits, words })
    }
}

fn encode_stmt(buf: &mut Vec<u8>, stmt: &Statement) {
    write_bytes(buf, &stmt.key);
    buf.write_i64::<BigEndian>(stmt.lsn).unwrap();
    match &stmt.value {
        Some(value) => {
            buf.write_u8(1).unwrap();
            write_bytes(buf, value);
        }
        None => buf.write_u8(0).unwrap(),
    }
}

fn decode_stmt(cursor: &mut Cursor<&[u8]>) -> Result<Statement> {
    let key = read_bytes(cursor)?;
    let lsn = cursor.read_i64::<BigEndian>()?;
    let value = match cursor.read_u8()? {
        0 => None,
        1 => Some(read_bytes(cursor)?),
        tag => {
            return Err(Error::InvalidData(format!(
                "invalid statement value tag: {}",
                tag
            )))
        }
    };
    Ok(Statement { key, value, lsn })
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.write_u32::<BigEndian>(bytes.len() as u32).unwrap();
    buf.extend_from_slice(bytes);
}

fn read_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor.read_u32::<BigEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Index of the first block that may hold keys at or after `begin`.
fn start_block(blocks: &[BlockMeta], begin: Option<&[u8]>) -> usize {
    let Some(begin) = begin else { return 0 };
    match blocks.binary_search_by(|meta| meta.first_key.as_slice().cmp(begin)) {
        Ok(i) => i,
        Err(0) => 0,
        // The previous block's interval may still contain `begin`.
        Err(i) => i - 1,
    }
}

/// Estimated statement count of a slice, from the block index.
fn estimate_count(run: &Run, begin: Option<&[u8]>, end: Option<&[u8]>) -> u64 {
    let Some(info) = run.info() else { return 0 };
    if begin.is_none() && end.is_none() {
        return info.count;
    }
    let mut total = 0u64;
    let start = start_block(&info.blocks, begin);
    for meta in &info.blocks[start..] {
        if let Some(end) = end {
            if meta.first_key.as_slice() >= end {
                break;
            }
        }
        total += meta.count as u64;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn write_run(dir: &TempDir, id: i64, stmts: &[Statement], page_size: usize) -> Arc<Run> {
        let path = dir.path().join(format!("{:016}.run", id));
        let mut writer = RunWriter::create(&path, page_size, 0.05).expect("create writer");
        for stmt in stmts {
            writer.append_stmt(stmt).expect("append");
        }
        let info = writer.commit().expect("commit");
        let run = Arc::new(Run::new(id, path));
        run.set_dump_lsn(info.max_lsn);
        run.commit_info(info);
        run
    }

    fn sample_stmts(n: usize) -> Vec<Statement> {
        (0..n)
            .map(|i| {
                Statement::replace(
                    format!("key_{:04}", i).into_bytes(),
                    format!("value_{}", i).into_bytes(),
                    i as i64 + 1,
                )
            })
            .collect()
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let stmts = sample_stmts(100);
        let run = write_run(&dir, 1, &stmts, 256);

        let info = run.info().unwrap();
        assert_eq!(info.count, 100);
        assert_eq!(info.min_key, b"key_0000");
        assert_eq!(info.max_key, b"key_0099");
        assert_eq!(info.max_lsn, 100);
        assert!(info.blocks.len() > 1, "small page size must cut blocks");

        let slice = Slice::new(10, Arc::clone(&run), None, None);
        let out: Vec<_> = slice.iter().unwrap().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(out, stmts);
        assert_eq!(slice.count(), 100);
    }

    #[test]
    fn test_slice_bounds() {
        let dir = TempDir::new().unwrap();
        let stmts = sample_stmts(50);
        let run = write_run(&dir, 2, &stmts, 128);

        let slice = Slice::new(
            11,
            Arc::clone(&run),
            Some(b"key_0010".to_vec()),
            Some(b"key_0020".to_vec()),
        );
        let out: Vec<_> = slice.iter().unwrap().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(out.len(), 10);
        assert_eq!(out[0].key, b"key_0010");
        assert_eq!(out[9].key, b"key_0019");
    }

    #[test]
    fn test_empty_commit_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.run");
        let writer = RunWriter::create(&path, 4096, 0.05).unwrap();
        let info = writer.commit().unwrap();
        assert_eq!(info.count, 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_abort_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aborted.run");
        let mut writer = RunWriter::create(&path, 4096, 0.05).unwrap();
        writer
            .append_stmt(&Statement::replace(b"k".to_vec(), b"v".to_vec(), 1))
            .unwrap();
        writer.abort();
        assert!(!path.exists());
    }

    #[test]
    fn test_reopen_run() {
        let dir = TempDir::new().unwrap();
        let stmts = sample_stmts(30);
        let run = write_run(&dir, 3, &stmts, 128);
        let path = run.path().to_path_buf();

        let reopened = Run::open(3, path).unwrap();
        let info = reopened.info().unwrap();
        assert_eq!(info.count, 30);
        assert_eq!(info.max_lsn, 30);
        assert_eq!(reopened.dump_lsn(), 30);
    }

    #[test]
    fn test_bloom() {
        let dir = TempDir::new().unwrap();
        let stmts = sample_stmts(200);
        let run = write_run(&dir, 4, &stmts, 1024);
        let bloom = &run.info().unwrap().bloom;

        for stmt in &stmts {
            assert!(bloom.may_contain(&stmt.key));
        }
        let misses = (0..1000)
            .filter(|i| !bloom.may_contain(format!("absent_{}", i).as_bytes()))
            .count();
        assert!(misses > 800, "bloom should reject most absent keys");
    }

    #[test]
    fn test_slice_count_tracking() {
        let dir = TempDir::new().unwrap();
        let run = write_run(&dir, 5, &sample_stmts(10), 4096);
        assert_eq!(run.slice_count(), 0);
        let a = Slice::new(20, Arc::clone(&run), None, None);
        let b = Slice::new(21, Arc::clone(&run), None, None);
        assert_eq!(run.slice_count(), 2);
        drop(a);
        drop(b);
        assert_eq!(run.slice_count(), 0);
    }

    #[test]
    fn test_tombstones_roundtrip() {
        let dir = TempDir::new().unwrap();
        let stmts = vec![
            Statement::replace(b"a".to_vec(), b"1".to_vec(), 1),
            Statement::delete(b"b".to_vec(), 2),
        ];
        let run = write_run(&dir, 6, &stmts, 4096);
        let slice = Slice::new(30, run, None, None);
        let out: Vec<_> = slice.iter().unwrap().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(out, stmts);
    }
}
