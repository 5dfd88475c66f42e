//! Append-only metadata log.
//!
//! The metadata log is a WAL for the engine's structure rather than its
//! data: it records which runs and slices exist and which dump LSN each LSM
//! tree has reached. A structural change becomes visible (and survives a
//! crash) exactly when its log transaction commits; everything the
//! coordinator mutates in memory afterwards is a replayable consequence of
//! the committed records.
//!
//! # File Format
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|
//! +------------------+
//! | Transaction 1    |
//! +------------------+
//! | Transaction 2    |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! Each transaction is one frame:
//!
//! ```text
//! +-----------+-------------------------+-----------+
//! |length:u32 | count:u32 | records...  |crc32:u32  |
//! +-----------+-------------------------+-----------+
//! ```
//!
//! A frame is written and fsynced as a unit, which is what makes a group of
//! records atomic: a torn tail frame fails its checksum and is ignored on
//! replay, so records not committed before a crash are simply absent.
//!
//! The header carries the id sequence shared by runs, slices, ranges and
//! LSM trees, and the *signature*: the LSN of the last checkpoint, used as
//! the gc-LSN when compaction drops runs.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, RwLock};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::Crc;

use crate::error::Result;
use crate::run::RunEnv;
use crate::Error;

const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

pub const HEADER_SIZE: usize = 64;
const MAGIC: &[u8; 8] = b"EMBER\0ML";
const VERSION: u32 = 1;

const PREPARE_RUN: u8 = 0x01;
const CREATE_RUN: u8 = 0x02;
const DROP_RUN: u8 = 0x03;
const FORGET_RUN: u8 = 0x04;
const INSERT_SLICE: u8 = 0x05;
const DELETE_SLICE: u8 = 0x06;
const DUMP_LSM: u8 = 0x07;

/// A single metadata record.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// A new run was allocated and is about to be written. If the write
    /// fails or the server crashes, recovery finds the prepared run without
    /// a matching `CreateRun` and deletes its file.
    PrepareRun { lsm_id: i64, run_id: i64 },
    /// The run file is durable and referenced by slices.
    CreateRun {
        lsm_id: i64,
        run_id: i64,
        dump_lsn: i64,
    },
    /// The run is no longer referenced by any slice. It is kept on disk for
    /// checkpoints taken at or after `gc_lsn` and garbage-collected later.
    DropRun { run_id: i64, gc_lsn: i64 },
    /// The run's files are gone; forget it entirely.
    ForgetRun { run_id: i64 },
    InsertSlice {
        range_id: i64,
        run_id: i64,
        slice_id: i64,
        begin: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
    },
    DeleteSlice { slice_id: i64 },
    /// The LSM tree has dumped everything up to `dump_lsn`.
    DumpLsm { lsm_id: i64, dump_lsn: i64 },
}

impl LogRecord {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            LogRecord::PrepareRun { lsm_id, run_id } => {
                buf.write_u8(PREPARE_RUN).unwrap();
                buf.write_i64::<BigEndian>(*lsm_id).unwrap();
                buf.write_i64::<BigEndian>(*run_id).unwrap();
            }
            LogRecord::CreateRun {
                lsm_id,
                run_id,
                dump_lsn,
            } => {
                buf.write_u8(CREATE_RUN).unwrap();
                buf.write_i64::<BigEndian>(*lsm_id).unwrap();
                buf.write_i64::<BigEndian>(*run_id).unwrap();
                buf.write_i64::<BigEndian>(*dump_lsn).unwrap();
            }
            LogRecord::DropRun { run_id, gc_lsn } => {
                buf.write_u8(DROP_RUN).unwrap();
                buf.write_i64::<BigEndian>(*run_id).unwrap();
                buf.write_i64::<BigEndian>(*gc_lsn).unwrap();
            }
            LogRecord::ForgetRun { run_id } => {
                buf.write_u8(FORGET_RUN).unwrap();
                buf.write_i64::<BigEndian>(*run_id).unwrap();
            }
            LogRecord::InsertSlice {
                range_id,
                run_id,
                slice_id,
                begin,
                end,
            } => {
                buf.write_u8(INSERT_SLICE).unwrap();
                buf.write_i64::<BigEndian>(*range_id).unwrap();
                buf.write_i64::<BigEndian>(*run_id).unwrap();
                buf.write_i64::<BigEndian>(*slice_id).unwrap();
                write_opt_bytes(buf, begin.as_deref());
                write_opt_bytes(buf, end.as_deref());
            }
            LogRecord::DeleteSlice { slice_id } => {
                buf.write_u8(DELETE_SLICE).unwrap();
                buf.write_i64::<BigEndian>(*slice_id).unwrap();
            }
            LogRecord::DumpLsm { lsm_id, dump_lsn } => {
                buf.write_u8(DUMP_LSM).unwrap();
                buf.write_i64::<BigEndian>(*lsm_id).unwrap();
                buf.write_i64::<BigEndian>(*dump_lsn).unwrap();
            }
        }
    }

    fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let tag = cursor.read_u8()?;
        match tag {
            PREPARE_RUN => Ok(LogRecord::PrepareRun {
                lsm_id: cursor.read_i64::<BigEndian>()?,
                run_id: cursor.read_i64::<BigEndian>()?,
            }),
            CREATE_RUN => Ok(LogRecord::CreateRun {
                lsm_id: cursor.read_i64::<BigEndian>()?,
                run_id: cursor.read_i64::<BigEndian>()?,
                dump_lsn: cursor.read_i64::<BigEndian>()?,
            }),
            DROP_RUN => Ok(LogRecord::DropRun {
                run_id: cursor.read_i64::<BigEndian>()?,
                gc_lsn: cursor.read_i64::<BigEndian>()?,
            }),
            FORGET_RUN => Ok(LogRecord::ForgetRun {
                run_id: cursor.read_i64::<BigEndian>()?,
            }),
            INSERT_SLICE => Ok(LogRecord::InsertSlice {
                range_id: cursor.read_i64::<BigEndian>()?,
                run_id: cursor.read_i64::<BigEndian>()?,
                slice_id: cursor.read_i64::<BigEndian>()?,
                begin: read_opt_bytes(cursor)?,
                end: read_opt_bytes(cursor)?,
            }),
            DELETE_SLICE => Ok(LogRecord::DeleteSlice {
                slice_id: cursor.read_i64::<BigEndian>()?,
            }),
            DUMP_LSM => Ok(LogRecord::DumpLsm {
                lsm_id: cursor.read_i64::<BigEndian>()?,
                dump_lsn: cursor.read_i64::<BigEndian>()?,
            }),
            _ => Err(Error::InvalidData(format!("invalid record tag: {}", tag))),
        }
    }
}

#[derive(Debug, Clone)]
struct LogHeader {
    next_id: i64,
    signature: i64,
}

impl LogHeader {
    fn new() -> Self {
        Self {
            next_id: 1,
            signature: 0,
        }
    }

    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(MAGIC);
        (&mut buf[8..12]).write_u32::<BigEndian>(VERSION).unwrap();
        (&mut buf[12..20])
            .write_i64::<BigEndian>(self.next_id)
            .unwrap();
        (&mut buf[20..28])
            .write_i64::<BigEndian>(self.signature)
            .unwrap();
        buf
    }

    fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let mut cursor = Cursor::new(&buf[..]);
        let mut magic = [0u8; 8];
        cursor.read_exact(&mut magic)?;
        if magic != *MAGIC {
            return Err(Error::InvalidData("invalid metadata log magic".to_string()));
        }
        let version = cursor.read_u32::<BigEndian>()?;
        if version != VERSION {
            return Err(Error::InvalidData(format!(
                "unsupported metadata log version: {}",
                version
            )));
        }
        let next_id = cursor.read_i64::<BigEndian>()?;
        let signature = cursor.read_i64::<BigEndian>()?;
        Ok(Self { next_id, signature })
    }
}

pub struct MetaLog {
    file: File,
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    header: RwLock<LogHeader>,
    tx_buf: Mutex<Vec<LogRecord>>,
    /// Newest dump LSN among committed `dump_lsm` records; promoted into
    /// the header signature when a checkpoint completes.
    dump_lsn_max: AtomicI64,
}

impl MetaLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let header = if file.metadata()?.len() == 0 {
            let header = LogHeader::new();
            file.write_all(&header.encode())?;
            file.sync_all()?;
            header
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            file.read_exact(&mut buf)?;
            LogHeader::decode(&buf)?
        };

        let mut write_file = file.try_clone()?;
        write_file.seek(SeekFrom::End(0))?;
        let writer = BufWriter::new(write_file);

        let log = Self {
            file,
            path,
            writer: Mutex::new(writer),
            header: RwLock::new(header),
            tx_buf: Mutex::new(Vec::new()),
            dump_lsn_max: AtomicI64::new(-1),
        };

        // Rebuild the committed dump horizon, so signature promotion picks
        // up where it left off after a reopen.
        for tx in log.iter()? {
            let records = match tx {
                Ok(records) => records,
                Err(Error::InvalidData(msg)) if msg.contains("torn") => break,
                Err(e) => return Err(e),
            };
            for record in records {
                if let LogRecord::DumpLsm { dump_lsn, .. } = record {
                    log.dump_lsn_max.fetch_max(dump_lsn, Ordering::SeqCst);
                }
            }
        }
        Ok(log)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Allocate a fresh id. One sequence numbers runs, slices, ranges and
    /// LSM trees, so the sequence uniquely orders all structural changes.
    pub fn next_id(&self) -> i64 {
        let mut header = self.header.write().unwrap();
        let id = header.next_id;
        header.next_id += 1;
        id
    }

    /// The LSN of the last checkpoint. Runs dumped after this are not
    /// referenced by any checkpoint and may be deleted as soon as they
    /// become unused.
    pub fn signature(&self) -> i64 {
        self.header.read().unwrap().signature
    }

    /// Record the checkpoint LSN used as the gc horizon. Called when a
    /// checkpoint completes.
    pub fn set_signature(&self, lsn: i64) -> Result<()> {
        self.header.write().unwrap().signature = lsn;
        self.sync_header()
    }

    /// Newest dump LSN among committed `dump_lsm` records, or -1 when
    /// nothing was ever dumped.
    pub fn max_dump_lsn(&self) -> i64 {
        self.dump_lsn_max.load(Ordering::SeqCst)
    }

    /// Start buffering a group of records.
    pub fn tx_begin(&self) {
        let mut buf = self.tx_buf.lock().unwrap();
        debug_assert!(buf.is_empty(), "previous metadata transaction not closed");
        buf.clear();
    }

    /// Add a record to the current transaction.
    pub fn append(&self, record: LogRecord) {
        self.tx_buf.lock().unwrap().push(record);
    }

    /// Commit the buffered group atomically. On failure nothing from the
    /// group is visible on replay.
    pub fn tx_commit(&self) -> Result<()> {
        let records = std::mem::take(&mut *self.tx_buf.lock().unwrap());
        if records.is_empty() {
            return Ok(());
        }
        self.write_frame(&records)
            .map_err(|e| Error::LogCommitFailed(e.to_string()))
    }

    /// Best-effort commit for follow-up records whose loss is tolerable
    /// (recovery re-discovers the orphan and deletes it).
    pub fn tx_try_commit(&self) {
        let records = std::mem::take(&mut *self.tx_buf.lock().unwrap());
        if records.is_empty() {
            return;
        }
        if let Err(e) = self.write_frame(&records) {
            tracing::warn!(error = %e, "best-effort metadata log commit failed");
        }
    }

    fn write_frame(&self, records: &[LogRecord]) -> Result<()> {
        let mut payload = Vec::new();
        payload
            .write_u32::<BigEndian>(records.len() as u32)
            .unwrap();
        for record in records {
            record.encode_into(&mut payload);
        }
        let checksum = CRC32.checksum(&payload);

        let mut writer = self.writer.lock().unwrap();
        // Cloned handles share one cursor and the header rewrite moves it;
        // frames always go at the end.
        writer.seek(SeekFrom::End(0))?;
        writer.write_u32::<BigEndian>(payload.len() as u32)?;
        writer.write_all(&payload)?;
        writer.write_u32::<BigEndian>(checksum)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        // The frame is durable; its dump records move the horizon.
        for record in records {
            if let LogRecord::DumpLsm { dump_lsn, .. } = record {
                self.dump_lsn_max.fetch_max(*dump_lsn, Ordering::SeqCst);
            }
        }
        self.sync_header()
    }

    fn sync_header(&self) -> Result<()> {
        let header_bytes = self.header.read().unwrap().encode();
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header_bytes)?;
        file.sync_all()?;
        Ok(())
    }

    /// Iterate committed transactions in order.
    pub fn iter(&self) -> Result<LogIterator> {
        let mut reader = BufReader::new(self.file.try_clone()?);
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        Ok(LogIterator { reader })
    }

    /// Rebuild the logical topology from the log. A torn tail frame ends
    /// the replay; checksum failures elsewhere are corruption.
    pub fn replay(&self) -> Result<MetaLogState> {
        let mut state = MetaLogState::new();
        for tx in self.iter()? {
            let records = match tx {
                Ok(records) => records,
                Err(Error::InvalidData(msg)) if msg.contains("torn") => {
                    tracing::warn!("metadata log ends with a torn transaction, ignoring it");
                    break;
                }
                Err(e) => return Err(e),
            };
            for record in records {
                state.apply(record);
            }
        }
        Ok(state)
    }

    /// Delete run files that the log no longer accounts for: runs that were
    /// prepared but never created (a crashed write), files with no record
    /// at all, and dropped runs whose retaining checkpoint has been
    /// superseded by the current signature. A dropped run whose `gc_lsn`
    /// still matches the signature is read by that checkpoint and stays.
    /// Called on recovery.
    pub fn sweep_orphans(&self, env: &RunEnv) -> Result<usize> {
        let state = self.replay()?;
        let mut removed = 0;

        let dirs = match std::fs::read_dir(env.dir()) {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        for dir in dirs {
            let dir = dir?;
            if !dir.file_type()?.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(dir.path())? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(run_id) = parse_run_id(&name.to_string_lossy()) else {
                    continue;
                };
                let deletable = match state.runs.get(&run_id) {
                    None => true,
                    Some(run) => match &run.state {
                        RunState::Prepared => true,
                        RunState::Committed { .. } => false,
                        RunState::Dropped { gc_lsn } => *gc_lsn < self.signature(),
                    },
                };
                if deletable {
                    std::fs::remove_file(entry.path())?;
                    self.tx_begin();
                    self.append(LogRecord::ForgetRun { run_id });
                    self.tx_try_commit();
                    removed += 1;
                    tracing::info!(run_id, "removed orphan run file");
                }
            }
        }
        Ok(removed)
    }
}

fn parse_run_id(name: &str) -> Option<i64> {
    name.strip_suffix(".run")?.parse().ok()
}

fn write_opt_bytes(buf: &mut Vec<u8>, bytes: Option<&[u8]>) {
    match bytes {
        Some(bytes) => {
            buf.write_u8(1).unwrap();
            buf.write_u32::<BigEndian>(bytes.len() as u32).unwrap();
            buf.extend_from_slice(bytes);
        }
        None => buf.write_u8(0).unwrap(),
    }
}

fn read_opt_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Option<Vec<u8>>> {
    match cursor.read_u8()? {
        0 => Ok(None),
        1 => {
            let len = cursor.read_u32::<BigEndian>()? as usize;
            let mut bytes = vec![0u8; len];
            cursor.read_exact(&mut bytes)?;
            Ok(Some(bytes))
        }
        tag => Err(Error::InvalidData(format!(
            "invalid optional bytes tag: {}",
            tag
        ))),
    }
}

pub struct LogIterator {
    reader: BufReader<File>,
}

impl Iterator for LogIterator {
    type Item = Result<Vec<LogRecord>>;

    fn next(&mut self) -> Option<Self::Item> {
        let payload_len = match self.reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return None,
            Err(e) => return Some(Err(e.into())),
        };

        let mut payload = vec![0u8; payload_len];
        if let Err(e) = self.reader.read_exact(&mut payload) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Some(Err(Error::InvalidData(
                    "torn transaction at log tail".to_string(),
                )));
            }
            return Some(Err(e.into()));
        }

        let stored_checksum = match self.reader.read_u32::<BigEndian>() {
            Ok(checksum) => checksum,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Some(Err(Error::InvalidData(
                    "torn transaction at log tail".to_string(),
                )))
            }
            Err(e) => return Some(Err(e.into())),
        };
        if CRC32.checksum(&payload) != stored_checksum {
            return Some(Err(Error::InvalidData(
                "transaction checksum mismatch".to_string(),
            )));
        }

        let mut cursor = Cursor::new(payload.as_slice());
        let count = match cursor.read_u32::<BigEndian>() {
            Ok(count) => count,
            Err(e) => return Some(Err(e.into())),
        };
        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match LogRecord::decode_from(&mut cursor) {
                Ok(record) => records.push(record),
                Err(e) => return Some(Err(e)),
            }
        }
        Some(Ok(records))
    }
}

/// Lifecycle of a run as seen by the log.
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    /// Logged before the file was written; a crash leaves it deletable.
    Prepared,
    Committed { dump_lsn: i64 },
    /// Unreferenced, retained for checkpoints at or after `gc_lsn`.
    Dropped { gc_lsn: i64 },
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub lsm_id: i64,
    pub state: RunState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SliceRecord {
    pub range_id: i64,
    pub run_id: i64,
    pub begin: Option<Vec<u8>>,
    pub end: Option<Vec<u8>>,
}

/// Logical topology reconstructed by [`MetaLog::replay`].
#[derive(Debug, Default)]
pub struct MetaLogState {
    pub runs: HashMap<i64, RunRecord>,
    pub slices: HashMap<i64, SliceRecord>,
    pub dump_lsn: HashMap<i64, i64>,
}

impl MetaLogState {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&mut self, record: LogRecord) {
        match record {
            LogRecord::PrepareRun { lsm_id, run_id } => {
                self.runs.insert(
                    run_id,
                    RunRecord {
                        lsm_id,
                        state: RunState::Prepared,
                    },
                );
            }
            LogRecord::CreateRun {
                lsm_id,
                run_id,
                dump_lsn,
            } => {
                self.runs.insert(
                    run_id,
                    RunRecord {
                        lsm_id,
                        state: RunState::Committed { dump_lsn },
                    },
                );
            }
            LogRecord::DropRun { run_id, gc_lsn } => {
                if let Some(run) = self.runs.get_mut(&run_id) {
                    run.state = RunState::Dropped { gc_lsn };
                }
            }
            LogRecord::ForgetRun { run_id } => {
                self.runs.remove(&run_id);
            }
            LogRecord::InsertSlice {
                range_id,
                run_id,
                slice_id,
                begin,
                end,
            } => {
                self.slices.insert(
                    slice_id,
                    SliceRecord {
                        range_id,
                        run_id,
                        begin,
                        end,
                    },
                );
            }
            LogRecord::DeleteSlice { slice_id } => {
                self.slices.remove(&slice_id);
            }
            LogRecord::DumpLsm { lsm_id, dump_lsn } => {
                self.dump_lsn.insert(lsm_id, dump_lsn);
            }
        }
    }

    /// Slices of one run, any order.
    pub fn slices_of_run(&self, run_id: i64) -> Vec<i64> {
        self.slices
            .iter()
            .filter(|(_, slice)| slice.run_id == run_id)
            .map(|(&id, _)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn open_log(dir: &TempDir) -> MetaLog {
        MetaLog::open(dir.path().join("META")).expect("open metalog")
    }

    #[test]
    fn test_next_id_monotone() -> Result<()> {
        let dir = TempDir::new()?;
        let log = open_log(&dir);
        let a = log.next_id();
        let b = log.next_id();
        assert!(b > a);
        Ok(())
    }

    #[test]
    fn test_commit_and_iterate() -> Result<()> {
        let dir = TempDir::new()?;
        let log = open_log(&dir);

        log.tx_begin();
        log.append(LogRecord::PrepareRun {
            lsm_id: 1,
            run_id: 2,
        });
        log.tx_commit()?;

        log.tx_begin();
        log.append(LogRecord::CreateRun {
            lsm_id: 1,
            run_id: 2,
            dump_lsn: 10,
        });
        log.append(LogRecord::InsertSlice {
            range_id: 3,
            run_id: 2,
            slice_id: 4,
            begin: None,
            end: Some(b"m".to_vec()),
        });
        log.append(LogRecord::DumpLsm {
            lsm_id: 1,
            dump_lsn: 10,
        });
        log.tx_commit()?;

        let txs: Vec<_> = log.iter()?.collect::<Result<Vec<_>>>()?;
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].len(), 1);
        assert_eq!(txs[1].len(), 3);
        assert_eq!(
            txs[1][1],
            LogRecord::InsertSlice {
                range_id: 3,
                run_id: 2,
                slice_id: 4,
                begin: None,
                end: Some(b"m".to_vec()),
            }
        );
        Ok(())
    }

    #[test]
    fn test_replay_topology() -> Result<()> {
        let dir = TempDir::new()?;
        let log = open_log(&dir);

        log.tx_begin();
        log.append(LogRecord::PrepareRun {
            lsm_id: 1,
            run_id: 10,
        });
        log.tx_commit()?;

        log.tx_begin();
        log.append(LogRecord::CreateRun {
            lsm_id: 1,
            run_id: 10,
            dump_lsn: 5,
        });
        log.append(LogRecord::InsertSlice {
            range_id: 2,
            run_id: 10,
            slice_id: 11,
            begin: None,
            end: None,
        });
        log.append(LogRecord::DumpLsm {
            lsm_id: 1,
            dump_lsn: 5,
        });
        log.tx_commit()?;

        let state = log.replay()?;
        assert_eq!(
            state.runs.get(&10).map(|r| r.state.clone()),
            Some(RunState::Committed { dump_lsn: 5 })
        );
        assert_eq!(state.slices_of_run(10), vec![11]);
        assert_eq!(state.dump_lsn.get(&1), Some(&5));

        // Compaction: delete the slice, drop the run, forget it.
        log.tx_begin();
        log.append(LogRecord::DeleteSlice { slice_id: 11 });
        log.append(LogRecord::DropRun {
            run_id: 10,
            gc_lsn: 0,
        });
        log.tx_commit()?;
        log.tx_begin();
        log.append(LogRecord::ForgetRun { run_id: 10 });
        log.tx_try_commit();

        let state = log.replay()?;
        assert!(state.runs.is_empty());
        assert!(state.slices.is_empty());
        Ok(())
    }

    #[test]
    fn test_replay_survives_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("META");
        let first_id;
        {
            let log = MetaLog::open(&path)?;
            first_id = log.next_id();
            log.tx_begin();
            log.append(LogRecord::PrepareRun {
                lsm_id: 1,
                run_id: first_id,
            });
            log.tx_commit()?;
        }
        let log = MetaLog::open(&path)?;
        assert!(log.next_id() > first_id);
        let state = log.replay()?;
        assert_eq!(state.runs.len(), 1);
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_ignored() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("META");
        {
            let log = MetaLog::open(&path)?;
            log.tx_begin();
            log.append(LogRecord::DumpLsm {
                lsm_id: 1,
                dump_lsn: 7,
            });
            log.tx_commit()?;
        }

        // Simulate a crash mid-frame: a length prefix with no payload.
        {
            let mut file = OpenOptions::new().append(true).open(&path)?;
            file.write_u32::<BigEndian>(1000)?;
            file.write_all(&[0xAB, 0xCD])?;
        }

        let log = MetaLog::open(&path)?;
        let state = log.replay()?;
        assert_eq!(state.dump_lsn.get(&1), Some(&7));
        Ok(())
    }

    #[test]
    fn test_uncommitted_records_absent() -> Result<()> {
        let dir = TempDir::new()?;
        let log = open_log(&dir);
        log.tx_begin();
        log.append(LogRecord::DumpLsm {
            lsm_id: 1,
            dump_lsn: 3,
        });
        // No commit: the group must not be visible.
        let state = log.replay()?;
        assert!(state.dump_lsn.is_empty());
        Ok(())
    }

    #[test]
    fn test_signature() -> Result<()> {
        let dir = TempDir::new()?;
        let log = open_log(&dir);
        assert_eq!(log.signature(), 0);
        log.set_signature(42)?;
        assert_eq!(log.signature(), 42);
        Ok(())
    }

    #[test]
    fn test_max_dump_lsn_tracks_commits() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("META");
        {
            let log = MetaLog::open(&path)?;
            assert_eq!(log.max_dump_lsn(), -1);
            log.tx_begin();
            log.append(LogRecord::DumpLsm {
                lsm_id: 1,
                dump_lsn: 7,
            });
            log.tx_commit()?;
            assert_eq!(log.max_dump_lsn(), 7);

            // Uncommitted records do not move the horizon.
            log.tx_begin();
            log.append(LogRecord::DumpLsm {
                lsm_id: 1,
                dump_lsn: 9,
            });
            assert_eq!(log.max_dump_lsn(), 7);
        }
        // The horizon is rebuilt from the committed records on reopen.
        let log = MetaLog::open(&path)?;
        assert_eq!(log.max_dump_lsn(), 7);
        Ok(())
    }

    #[test]
    fn test_sweep_orphans() -> Result<()> {
        let dir = TempDir::new()?;
        let log = open_log(&dir);
        let env = RunEnv::new(dir.path().join("runs"));

        // Run 1: committed, keep. Run 2: prepared only, delete.
        log.tx_begin();
        log.append(LogRecord::PrepareRun {
            lsm_id: 1,
            run_id: 1,
        });
        log.append(LogRecord::CreateRun {
            lsm_id: 1,
            run_id: 1,
            dump_lsn: 5,
        });
        log.append(LogRecord::PrepareRun {
            lsm_id: 1,
            run_id: 2,
        });
        log.tx_commit()?;

        let index_dir = env.index_dir(512, 0);
        std::fs::create_dir_all(&index_dir)?;
        std::fs::write(env.run_path(512, 0, 1), b"live")?;
        std::fs::write(env.run_path(512, 0, 2), b"orphan")?;
        // A file with no log record at all is an orphan too.
        std::fs::write(env.run_path(512, 0, 99), b"unknown")?;

        let removed = log.sweep_orphans(&env)?;
        assert_eq!(removed, 2);
        assert!(env.run_path(512, 0, 1).exists());
        assert!(!env.run_path(512, 0, 2).exists());
        assert!(!env.run_path(512, 0, 99).exists());
        Ok(())
    }

    #[test]
    fn test_sweep_keeps_checkpoint_retained_drops() -> Result<()> {
        let dir = TempDir::new()?;
        let log = open_log(&dir);
        let env = RunEnv::new(dir.path().join("runs"));

        log.tx_begin();
        log.append(LogRecord::PrepareRun {
            lsm_id: 1,
            run_id: 1,
        });
        log.append(LogRecord::CreateRun {
            lsm_id: 1,
            run_id: 1,
            dump_lsn: 5,
        });
        log.tx_commit()?;
        log.set_signature(5)?;

        // Compacted away, but the checkpoint at LSN 5 still reads it.
        log.tx_begin();
        log.append(LogRecord::DropRun {
            run_id: 1,
            gc_lsn: 5,
        });
        log.tx_commit()?;

        std::fs::create_dir_all(env.index_dir(512, 0))?;
        std::fs::write(env.run_path(512, 0, 1), b"retained")?;

        assert_eq!(log.sweep_orphans(&env)?, 0);
        assert!(env.run_path(512, 0, 1).exists());

        // A newer checkpoint supersedes it and releases the file.
        log.set_signature(9)?;
        assert_eq!(log.sweep_orphans(&env)?, 1);
        assert!(!env.run_path(512, 0, 1).exists());
        Ok(())
    }
}
