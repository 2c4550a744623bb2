//! The storage engine (spec §4.6, §4.7 / Component 7).
//!
//! Grounded on the teacher's `LsmEngine`/`core::engine::LsmEngine` (the
//! `set`/`delete`/`get`/`scan` shape) and `examples/original_source/
//! libtidesdb.h`'s `LSMT` class: a memtable + WAL pair ("generation") that
//! is atomically swapped out to a background flush queue once it grows
//! past `memtable_flush_size` live entries, plus the full range-query
//! family the original names (`NGet`, `LessThan`, `GreaterThan`, `Range`,
//! `NRange`, `LessThanEq`, `GreaterThanEq`) generalized here into one
//! merge-sweep helper.

use crate::codec::{Operation, OpKind};
use crate::compaction::Compactor;
use crate::config::LsmConfig;
use crate::error::{LsmError, Result};
use crate::memtable::{Memtable, MemtableValue};
use crate::sstable::SSTable;
use crate::wal::Wal;
use std::collections::{BTreeMap, VecDeque};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// A memtable paired with the WAL durably backing it. Swapped out as a unit
/// once the memtable is full (spec §4.7).
struct Generation {
    id: u64,
    memtable: Memtable,
    wal: Wal,
}

/// Shared, lock-protected list of on-disk tables, newest first — the order
/// point lookups must consult them in (spec §4.6: "newest-wins").
pub(crate) struct SstableSet {
    tables: RwLock<Vec<Arc<SSTable>>>,
}

impl SstableSet {
    fn new(mut tables: Vec<Arc<SSTable>>) -> Self {
        tables.sort_by(|a, b| mtime(b.path()).cmp(&mtime(a.path())));
        Self {
            tables: RwLock::new(tables),
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<SSTable>> {
        self.tables.read().unwrap().clone()
    }

    fn push_newest(&self, table: Arc<SSTable>) {
        let mut tables = self.tables.write().unwrap();
        tables.insert(0, table);
    }

    pub(crate) fn count(&self) -> usize {
        self.tables.read().unwrap().len()
    }

    /// Atomically replaces `old` tables with `replacement`, preserving
    /// newest-first order. Used by the compactor once a merge completes.
    pub(crate) fn replace(&self, old: &[Arc<SSTable>], replacement: Vec<Arc<SSTable>>) {
        let old_paths: Vec<PathBuf> = old.iter().map(|t| t.path().to_path_buf()).collect();
        let mut tables = self.tables.write().unwrap();
        tables.retain(|t| !old_paths.contains(&t.path().to_path_buf()));
        for table in replacement {
            tables.push(table);
        }
        tables.sort_by(|a, b| mtime(b.path()).cmp(&mtime(a.path())));
    }
}

fn mtime(path: &std::path::Path) -> std::time::SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(std::time::UNIX_EPOCH)
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

struct FlushQueue {
    pending: Mutex<VecDeque<Generation>>,
    cond: Condvar,
    /// Count of generations pushed but not yet fully flushed. Tracked
    /// separately from `is_flushing` (which only covers active work) so
    /// `flush()` can block without racing the window between a pop and the
    /// worker marking itself busy.
    outstanding: AtomicU64,
}

/// The embedded LSM-tree storage engine.
pub struct LsmEngine {
    config: LsmConfig,
    current: RwLock<Option<Generation>>,
    sstables: Arc<SstableSet>,
    flush_queue: Arc<FlushQueue>,
    next_gen: AtomicU64,
    is_flushing: Arc<AtomicBool>,
    is_compacting: Arc<AtomicBool>,
    /// Process-wide commit lock serializing transaction commits (spec
    /// §4.9): only one transaction may be mid-commit at a time.
    pub(crate) commit_mutex: Mutex<()>,
    stop: Arc<AtomicBool>,
    flush_thread: Option<JoinHandle<()>>,
    compactor: Option<Compactor>,
}

impl LsmEngine {
    /// Opens an engine rooted at `config.dir_path`, creating it if absent
    /// and replaying any WAL generations left behind by an unclean
    /// shutdown (spec §4.4).
    pub fn open(config: LsmConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.dir_path)?;
        std::fs::set_permissions(
            &config.dir_path,
            std::fs::Permissions::from_mode(config.dir_perms),
        )?;

        let mut sstables = Vec::new();
        let mut stale_wals: Vec<PathBuf> = Vec::new();
        for entry in std::fs::read_dir(&config.dir_path)? {
            let path = entry?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("sst") => match SSTable::open(&path, config.page_size) {
                    Ok(table) => sstables.push(Arc::new(table)),
                    Err(e) => warn!("failed to load SSTable {}: {e}", path.display()),
                },
                Some("wal") => stale_wals.push(path),
                _ => {}
            }
        }
        stale_wals.sort();

        let recovered = Memtable::new();
        for wal_path in &stale_wals {
            let recovery = Wal::for_recovery(wal_path, config.page_size)?;
            for op in recovery.recover()? {
                apply_to_memtable(&recovered, op);
            }
        }

        if !recovered.is_empty() {
            let records = memtable_to_sorted_records(&recovered);
            let timestamp = now_nanos();
            let table = SSTable::create(&config.dir_path, timestamp, config.page_size, &records)?;
            info!(
                "recovered {} live keys from {} stale WAL(s) into a new SSTable",
                records.len(),
                stale_wals.len()
            );
            sstables.insert(0, Arc::new(table));
        }
        for wal_path in &stale_wals {
            std::fs::remove_file(wal_path)?;
        }

        let sstables = Arc::new(SstableSet::new(sstables));
        let first_gen = 0u64;
        let wal = Wal::open(&wal_path_for(&config.dir_path, first_gen), config.page_size)?;
        let current = Generation {
            id: first_gen,
            memtable: Memtable::new(),
            wal,
        };

        let flush_queue = Arc::new(FlushQueue {
            pending: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            outstanding: AtomicU64::new(0),
        });
        let stop = Arc::new(AtomicBool::new(false));
        let is_flushing = Arc::new(AtomicBool::new(false));
        let is_compacting = Arc::new(AtomicBool::new(false));

        let flush_thread = {
            let queue = Arc::clone(&flush_queue);
            let sstables = Arc::clone(&sstables);
            let dir_path = config.dir_path.clone();
            let page_size = config.page_size;
            let stop = Arc::clone(&stop);
            let is_flushing = Arc::clone(&is_flushing);
            std::thread::spawn(move || {
                flush_loop(queue, sstables, dir_path, page_size, stop, is_flushing)
            })
        };

        let compactor = Compactor::spawn(
            Arc::clone(&sstables),
            config.dir_path.clone(),
            config.page_size,
            config.compaction_interval,
            config.resolved_compaction_threads()?,
            Arc::clone(&is_compacting),
            Arc::clone(&stop),
        );

        Ok(Self {
            config,
            current: RwLock::new(Some(current)),
            sstables,
            flush_queue,
            next_gen: AtomicU64::new(first_gen + 1),
            is_flushing,
            is_compacting,
            commit_mutex: Mutex::new(()),
            stop,
            flush_thread: Some(flush_thread),
            compactor: Some(compactor),
        })
    }

    /// Inserts or overwrites `key` with `value` (spec §4.7).
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.apply(Operation::put(key, value))
    }

    /// Marks `key` as deleted via a tombstone (spec §4.7).
    pub fn delete(&self, key: Vec<u8>) -> Result<()> {
        self.apply(Operation::delete(key))
    }

    fn apply(&self, op: Operation) -> Result<()> {
        let current = self
            .current
            .read()
            .map_err(|_| LsmError::LockPoisoned("engine current generation"))?;
        let generation = current.as_ref().ok_or(LsmError::Closed)?;

        generation.wal.append(op.clone())?;
        let value = match op.kind {
            OpKind::Put => MemtableValue::put(op.value),
            OpKind::Delete => MemtableValue::tombstone(),
        };
        generation.memtable.insert(op.key, value);
        let should_flush = generation.memtable.size() >= self.config.memtable_flush_size;
        drop(current);

        if should_flush {
            self.rotate_generation()?;
        }
        Ok(())
    }

    /// Atomically swaps the current generation for a fresh one and hands
    /// the old generation to the background flush worker (spec §4.7).
    fn rotate_generation(&self) -> Result<()> {
        let mut current = self
            .current
            .write()
            .map_err(|_| LsmError::LockPoisoned("engine current generation"))?;
        let Some(old) = current.take() else {
            return Ok(());
        };
        if old.memtable.size() < self.config.memtable_flush_size {
            // Another writer already rotated this generation out.
            *current = Some(old);
            return Ok(());
        }

        let new_id = self.next_gen.fetch_add(1, Ordering::SeqCst);
        let new_wal = Wal::open(
            &wal_path_for(&self.config.dir_path, new_id),
            self.config.page_size,
        )?;
        *current = Some(Generation {
            id: new_id,
            memtable: Memtable::new(),
            wal: new_wal,
        });
        drop(current);

        let mut pending = self
            .flush_queue
            .pending
            .lock()
            .map_err(|_| LsmError::LockPoisoned("flush queue"))?;
        pending.push_back(old);
        self.flush_queue.outstanding.fetch_add(1, Ordering::SeqCst);
        self.flush_queue.cond.notify_one();
        Ok(())
    }

    /// Point lookup: memtable first, then SSTables newest to oldest (spec
    /// §4.6).
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        {
            let current = self
                .current
                .read()
                .map_err(|_| LsmError::LockPoisoned("engine current generation"))?;
            if let Some(generation) = current.as_ref() {
                if let Some(value) = generation.memtable.get(key) {
                    return Ok(if value.is_tombstone {
                        None
                    } else {
                        Some(value.value)
                    });
                }
            }
        }

        for table in self.sstables.snapshot() {
            if let Some(record) = table.get(key)? {
                return Ok(if record.is_tombstone() {
                    None
                } else {
                    Some(record.value)
                });
            }
        }
        Ok(None)
    }

    /// Merge-sweeps the memtable and every SSTable, resolves newest-wins,
    /// drops tombstones, and keeps only keys matching `predicate` (spec
    /// §4.6). Backs every range-query method below.
    fn query_by_predicate(
        &self,
        predicate: impl Fn(&[u8]) -> bool,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();

        {
            let current = self
                .current
                .read()
                .map_err(|_| LsmError::LockPoisoned("engine current generation"))?;
            if let Some(generation) = current.as_ref() {
                generation.memtable.traverse(|k, v| {
                    if predicate(k) {
                        merged.insert(
                            k.to_vec(),
                            if v.is_tombstone { None } else { Some(v.value.clone()) },
                        );
                    }
                });
            }
        }

        for table in self.sstables.snapshot() {
            for record in table.iter() {
                let record = record?;
                if !predicate(&record.key) {
                    continue;
                }
                merged.entry(record.key).or_insert_with(|| {
                    if record.is_tombstone() {
                        None
                    } else {
                        Some(record.value)
                    }
                });
            }
        }

        Ok(merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect())
    }

    pub fn nget(&self, key: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.query_by_predicate(|k| k != key)
    }

    pub fn less_than(&self, key: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.query_by_predicate(|k| k < key)
    }

    pub fn less_than_eq(&self, key: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.query_by_predicate(|k| k <= key)
    }

    pub fn greater_than(&self, key: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.query_by_predicate(|k| k > key)
    }

    pub fn greater_than_eq(&self, key: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.query_by_predicate(|k| k >= key)
    }

    pub fn range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.query_by_predicate(|k| k >= start && k <= end)
    }

    pub fn nrange(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.query_by_predicate(|k| k < start || k > end)
    }

    pub fn is_flushing(&self) -> bool {
        self.is_flushing.load(Ordering::SeqCst)
    }

    pub fn is_compacting(&self) -> bool {
        self.is_compacting.load(Ordering::SeqCst)
    }

    pub fn sstable_count(&self) -> usize {
        self.sstables.count()
    }

    /// Number of live entries in the current memtable (spec §6's
    /// `memtable` accessor).
    pub fn memtable_size(&self) -> usize {
        self.current
            .read()
            .ok()
            .and_then(|g| g.as_ref().map(|g| g.memtable.size()))
            .unwrap_or(0)
    }

    /// Forces an out-of-band compaction pass, blocking until it completes.
    pub fn compact(&self) -> Result<()> {
        match &self.compactor {
            Some(compactor) => compactor.run_once(),
            None => Ok(()),
        }
    }

    /// Flushes the current memtable immediately, even if under the
    /// configured threshold, and waits for the flush to complete.
    pub fn flush(&self) -> Result<()> {
        {
            let mut current = self
                .current
                .write()
                .map_err(|_| LsmError::LockPoisoned("engine current generation"))?;
            if let Some(old) = current.take() {
                if old.memtable.is_empty() {
                    *current = Some(old);
                    return Ok(());
                }
                let new_id = self.next_gen.fetch_add(1, Ordering::SeqCst);
                let new_wal = Wal::open(
                    &wal_path_for(&self.config.dir_path, new_id),
                    self.config.page_size,
                )?;
                *current = Some(Generation {
                    id: new_id,
                    memtable: Memtable::new(),
                    wal: new_wal,
                });
                drop(current);

                let mut pending = self
                    .flush_queue
                    .pending
                    .lock()
                    .map_err(|_| LsmError::LockPoisoned("flush queue"))?;
                pending.push_back(old);
                self.flush_queue.outstanding.fetch_add(1, Ordering::SeqCst);
                self.flush_queue.cond.notify_one();
            }
        }

        while self.flush_queue.outstanding.load(Ordering::SeqCst) > 0 {
            std::thread::yield_now();
        }
        Ok(())
    }

    /// Stops background threads and waits for the current generation's
    /// WAL to finish draining, so every acknowledged write is durable
    /// before the engine is dropped (spec §4.4).
    pub fn close(mut self) -> Result<()> {
        self.close_mut()
    }

    fn close_mut(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        self.flush_queue.cond.notify_all();
        if let Some(handle) = self.flush_thread.take() {
            let _ = handle.join();
        }
        if let Some(compactor) = self.compactor.take() {
            compactor.join();
        }
        if let Ok(mut current) = self.current.write() {
            if let Some(generation) = current.take() {
                generation.wal.close()?;
            }
        }
        Ok(())
    }
}

impl Drop for LsmEngine {
    fn drop(&mut self) {
        let _ = self.close_mut();
    }
}

fn wal_path_for(dir_path: &std::path::Path, generation_id: u64) -> PathBuf {
    dir_path.join(format!("{generation_id:020}.wal"))
}

fn apply_to_memtable(memtable: &Memtable, op: Operation) {
    match op.kind {
        OpKind::Put => {
            memtable.insert(op.key, MemtableValue::put(op.value));
        }
        OpKind::Delete => {
            memtable.insert(op.key, MemtableValue::tombstone());
        }
    }
}

fn memtable_to_sorted_records(memtable: &Memtable) -> Vec<crate::codec::Record> {
    let mut records = Vec::new();
    memtable.traverse(|k, v| {
        records.push(crate::codec::Record::new(k.to_vec(), v.value.clone()));
    });
    records
}

fn flush_loop(
    queue: Arc<FlushQueue>,
    sstables: Arc<SstableSet>,
    dir_path: PathBuf,
    page_size: usize,
    stop: Arc<AtomicBool>,
    is_flushing: Arc<AtomicBool>,
) {
    loop {
        let generation = {
            let mut pending = match queue.pending.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            loop {
                if let Some(generation) = pending.pop_front() {
                    break Some(generation);
                }
                if stop.load(Ordering::SeqCst) {
                    break None;
                }
                pending = match queue.cond.wait(pending) {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
            }
        };

        let Some(generation) = generation else { return };
        is_flushing.store(true, Ordering::SeqCst);

        let records = memtable_to_sorted_records(&generation.memtable);
        if !records.is_empty() {
            let timestamp = now_nanos();
            match SSTable::create(&dir_path, timestamp, page_size, &records) {
                Ok(table) => {
                    sstables.push_newest(Arc::new(table));
                    debug!(
                        "flushed generation {} ({} records) to a new SSTable",
                        generation.id,
                        records.len()
                    );
                }
                Err(e) => {
                    warn!("flush of generation {} failed: {e}", generation.id);
                    is_flushing.store(false, Ordering::SeqCst);
                    queue.outstanding.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }
            }
        }

        let wal_path = generation.wal.path().to_path_buf();
        if let Err(e) = generation.wal.close() {
            warn!("error closing flushed WAL: {e}");
        }
        if let Err(e) = std::fs::remove_file(&wal_path) {
            warn!("failed to remove flushed WAL file: {e}");
        }
        is_flushing.store(false, Ordering::SeqCst);
        queue.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> LsmConfig {
        LsmConfig::builder()
            .dir_path(dir.to_path_buf())
            .memtable_flush_size(4)
            .page_size(256)
            .max_compaction_threads(1)
            .build()
            .unwrap()
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let engine = LsmEngine::open(test_config(dir.path())).unwrap();
        engine.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn put_overwrites_previous_value() {
        let dir = tempdir().unwrap();
        let engine = LsmEngine::open(test_config(dir.path())).unwrap();
        engine.put(b"k".to_vec(), b"v1".to_vec()).unwrap();
        engine.put(b"k".to_vec(), b"v2".to_vec()).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn delete_then_get_is_absent() {
        let dir = tempdir().unwrap();
        let engine = LsmEngine::open(test_config(dir.path())).unwrap();
        engine.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        engine.delete(b"k".to_vec()).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), None);
    }

    #[test]
    fn memtable_rotation_flushes_to_sstable() {
        let dir = tempdir().unwrap();
        let engine = LsmEngine::open(test_config(dir.path())).unwrap();
        for i in 0..10 {
            engine
                .put(format!("k{i}").into_bytes(), format!("v{i}").into_bytes())
                .unwrap();
        }
        engine.flush().unwrap();
        assert!(engine.sstable_count() >= 1);
        for i in 0..10 {
            assert_eq!(
                engine.get(format!("k{i}").as_bytes()).unwrap(),
                Some(format!("v{i}").into_bytes())
            );
        }
    }

    #[test]
    fn range_queries_merge_memtable_and_sstables() {
        let dir = tempdir().unwrap();
        let engine = LsmEngine::open(test_config(dir.path())).unwrap();
        for key in ["a", "b", "c", "d", "e"] {
            engine.put(key.as_bytes().to_vec(), b"1".to_vec()).unwrap();
        }
        engine.flush().unwrap();
        engine.put(b"f".to_vec(), b"1".to_vec()).unwrap();

        let range = engine.range(b"b", b"d").unwrap();
        assert_eq!(
            range,
            vec![
                (b"b".to_vec(), b"1".to_vec()),
                (b"c".to_vec(), b"1".to_vec()),
                (b"d".to_vec(), b"1".to_vec()),
            ]
        );

        let less = engine.less_than(b"c").unwrap();
        assert_eq!(less, vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"1".to_vec())]);
    }

    #[test]
    fn recovery_replays_uncheckpointed_writes_after_restart() {
        let dir = tempdir().unwrap();
        {
            let engine = LsmEngine::open(test_config(dir.path())).unwrap();
            engine.put(b"k".to_vec(), b"v".to_vec()).unwrap();
            engine.close().unwrap();
        }
        let engine = LsmEngine::open(test_config(dir.path())).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn put_delete_compact_drops_tombstoned_key_from_range() {
        let dir = tempdir().unwrap();
        let engine = LsmEngine::open(test_config(dir.path())).unwrap();
        engine.put(b"x".to_vec(), b"v".to_vec()).unwrap();
        engine.flush().unwrap();
        engine.delete(b"x".to_vec()).unwrap();
        engine.flush().unwrap();
        engine.compact().unwrap();

        assert_eq!(engine.get(b"x").unwrap(), None);
        assert!(!engine
            .range(b"a".to_vec().as_slice(), b"z".to_vec().as_slice())
            .unwrap()
            .iter()
            .any(|(k, _)| k == b"x"));
    }
}
