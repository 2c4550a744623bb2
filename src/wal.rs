//! Durable write-ahead log (spec §4.4).
//!
//! Grounded on `examples/original_source/libtidesdb.h`'s `Wal` class: a
//! background thread drains an in-memory queue and writes each operation as
//! one Pager record, so callers never block on disk I/O inside `append`.
//! Two constructors mirror the original's two: one that starts the
//! background thread for live use, one path-only constructor used solely by
//! recovery.

use crate::codec::{decode_op, encode_op, Operation};
use crate::error::{LsmError, Result};
use crate::pager::Pager;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::debug;

/// Name of the WAL file for a fresh engine with no generation scheme
/// (used by callers that don't need per-generation file names).
pub const WAL_FILE_NAME: &str = "wal.wal";

struct Queue {
    ops: Mutex<VecDeque<Operation>>,
    cond: Condvar,
}

/// Durable append-only operation log, backed by a [`Pager`].
pub struct Wal {
    path: PathBuf,
    queue: Arc<Queue>,
    stop: Arc<AtomicBool>,
    appender: Option<JoinHandle<()>>,
}

impl Wal {
    /// Opens (or creates) the WAL file at `path` and starts the background
    /// appender thread.
    pub fn open(path: &Path, page_size: usize) -> Result<Self> {
        let pager = Arc::new(Pager::open(path, page_size)?);
        Ok(Self::from_pager(path.to_path_buf(), pager))
    }

    fn from_pager(path: PathBuf, pager: Arc<Pager>) -> Self {
        let queue = Arc::new(Queue {
            ops: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        });
        let stop = Arc::new(AtomicBool::new(false));

        let worker_queue = Arc::clone(&queue);
        let worker_stop = Arc::clone(&stop);
        let appender =
            std::thread::spawn(move || Self::appender_loop(pager, worker_queue, worker_stop));

        Self {
            path,
            queue,
            stop,
            appender: Some(appender),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens a WAL purely for [`recover`](RecoveryWal::recover) and
    /// [`truncate`](RecoveryWal::truncate) — no background thread is
    /// started.
    pub fn for_recovery(path: &Path, page_size: usize) -> Result<RecoveryWal> {
        let pager = Pager::open(path, page_size)?;
        Ok(RecoveryWal { pager })
    }

    /// Enqueues `op` for the background thread to persist. Returns once the
    /// operation is in the queue, not once it is durable — see
    /// [`close`](Wal::close) for the durability contract.
    pub fn append(&self, op: Operation) -> Result<()> {
        let mut ops = self
            .queue
            .ops
            .lock()
            .map_err(|_| LsmError::LockPoisoned("wal queue"))?;
        ops.push_back(op);
        self.queue.cond.notify_one();
        Ok(())
    }

    fn appender_loop(pager: Arc<Pager>, queue: Arc<Queue>, stop: Arc<AtomicBool>) {
        loop {
            let op = {
                let mut ops = match queue.ops.lock() {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
                loop {
                    if let Some(op) = ops.pop_front() {
                        break Some(op);
                    }
                    if stop.load(Ordering::SeqCst) {
                        break None;
                    }
                    ops = match queue.cond.wait(ops) {
                        Ok(guard) => guard,
                        Err(_) => return,
                    };
                }
            };

            match op {
                Some(op) => match encode_op(&op) {
                    Ok(bytes) => {
                        if let Err(e) = pager.write(&bytes) {
                            tracing::error!("WAL append failed: {e}");
                        } else {
                            debug!("WAL persisted op for key len={}", op.key.len());
                        }
                    }
                    Err(e) => {
                        tracing::warn!("WAL dropped unencodable operation: {e}");
                    }
                },
                None => return,
            }
        }
    }

    /// Signals the appender thread to stop, waits for the queue to drain,
    /// and joins it. After this returns, every `append` issued before the
    /// call has been flushed to disk (spec §4.4's durability contract).
    pub fn close(mut self) -> Result<()> {
        self.close_mut()
    }

    fn close_mut(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        self.queue.cond.notify_all();
        if let Some(handle) = self.appender.take() {
            handle
                .join()
                .map_err(|_| LsmError::CorruptData("WAL appender thread panicked".to_string()))?;
        }
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if self.appender.is_some() {
            let _ = self.close_mut();
        }
    }
}

/// A WAL opened purely for recovery (spec §4.4): no background thread, just
/// direct `Pager` access for replay and post-flush truncation.
pub struct RecoveryWal {
    pager: Pager,
}

impl RecoveryWal {
    /// Replays every operation in this WAL in append order. Recovery is
    /// idempotent because the memtable is empty when replay begins and
    /// every later SSTable merge is deterministic (spec §4.4).
    ///
    /// A torn write at the tail (the last thing appended before an unclean
    /// shutdown) breaks the Pager's page framing itself, not just the
    /// operation's encoding; that is stop-and-keep-what-we-have, the same as
    /// any other truncated tail, rather than a reason to fail recovery
    /// outright.
    pub fn recover(&self) -> Result<Vec<Operation>> {
        let mut ops = Vec::new();
        for entry in self.pager.cursor() {
            let (head, bytes) = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("stopping WAL replay at a torn tail record: {e}");
                    break;
                }
            };
            match decode_op(&bytes) {
                Ok(op) => ops.push(op),
                Err(e) => tracing::warn!("skipping corrupt WAL record at page {head}: {e}"),
            }
        }
        Ok(ops)
    }

    /// Truncates the WAL file to empty — its contents are redundant once the
    /// memtable they describe has been flushed (spec §4.7 step 7).
    pub fn truncate(&self) -> Result<()> {
        self.pager.truncate(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Operation;
    use tempfile::tempdir;

    #[test]
    fn append_then_close_then_recover_replays_in_order() {
        let dir = tempdir().unwrap();
        {
            let wal = Wal::open(&dir.path().join(WAL_FILE_NAME), 256).unwrap();
            wal.append(Operation::put(b"a".to_vec(), b"1".to_vec()))
                .unwrap();
            wal.append(Operation::put(b"b".to_vec(), b"2".to_vec()))
                .unwrap();
            wal.append(Operation::delete(b"a".to_vec())).unwrap();
            wal.close().unwrap();
        }

        let recovery = Wal::for_recovery(&dir.path().join(WAL_FILE_NAME), 256).unwrap();
        let ops = recovery.recover().unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].key, b"a");
        assert_eq!(ops[1].key, b"b");
        assert_eq!(ops[2].key, b"a");
        assert!(ops[2].value == crate::codec::TOMBSTONE);
    }

    #[test]
    fn truncate_empties_the_log() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(&dir.path().join(WAL_FILE_NAME), 256).unwrap();
        wal.append(Operation::put(b"a".to_vec(), b"1".to_vec()))
            .unwrap();
        wal.close().unwrap();

        let recovery = Wal::for_recovery(&dir.path().join(WAL_FILE_NAME), 256).unwrap();
        recovery.truncate().unwrap();
        assert!(recovery.recover().unwrap().is_empty());
    }
}
