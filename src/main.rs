//! Interactive shell for the LSM storage engine.
//!
//! Reads commands from stdin and executes them against an [`LsmEngine`],
//! modeled on a REPL-style storage CLI: one command per line, plain-text
//! replies, scriptable via a piped stdin.
//!
//! ```text
//! PUT key value        Insert or update a key
//! GET key              Look up a key (prints value or "(nil)")
//! DEL key              Delete a key (writes a tombstone)
//! RANGE start end      Inclusive range scan
//! FLUSH                Force the current memtable to an SSTable
//! COMPACT              Trigger a compaction pass
//! STATS                Print engine debug info
//! EXIT / QUIT          Shut down gracefully
//! ```
//!
//! Configuration is read from the environment:
//!
//! ```text
//! LSM_DATA_DIR           storage directory          (default: "./.lsm_data")
//! LSM_FLUSH_ENTRIES      memtable flush threshold    (default: 10000)
//! LSM_PAGE_SIZE          Pager page size in bytes    (default: 4096)
//! LSM_COMPACTION_SECS    compaction interval seconds (default: 60)
//! ```

use lsm_kv_store::{LsmConfig, LsmEngine, Result};
use std::io::{self, BufRead, Write};
use std::time::Duration;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let data_dir = env_or("LSM_DATA_DIR", "./.lsm_data");
    let flush_entries: usize = env_or("LSM_FLUSH_ENTRIES", "10000").parse().unwrap_or(10_000);
    let page_size: usize = env_or("LSM_PAGE_SIZE", "4096").parse().unwrap_or(4096);
    let compaction_secs: u64 = env_or("LSM_COMPACTION_SECS", "60").parse().unwrap_or(60);

    let config = LsmConfig::builder()
        .dir_path(data_dir.clone())
        .memtable_flush_size(flush_entries)
        .page_size(page_size)
        .compaction_interval(Duration::from_secs(compaction_secs))
        .build()?;

    let engine = LsmEngine::open(config)?;

    println!(
        "lsm-kv-store started (dir={data_dir}, flush_entries={flush_entries}, page_size={page_size})"
    );
    println!("Commands: PUT key value | GET key | DEL key | RANGE start end");
    println!("          COMPACT | FLUSH | STATS | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    for line in io::stdin().lock().lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        if let Some(cmd) = parts.next() {
            match cmd.to_uppercase().as_str() {
                "PUT" => match (parts.next(), parts.collect::<Vec<&str>>().join(" ")) {
                    (Some(k), v) if !v.is_empty() => {
                        match engine.put(k.as_bytes().to_vec(), v.into_bytes()) {
                            Ok(()) => println!("OK"),
                            Err(e) => println!("ERR put failed: {e}"),
                        }
                    }
                    _ => println!("ERR usage: PUT key value"),
                },
                "GET" => match parts.next() {
                    Some(k) => match engine.get(k.as_bytes()) {
                        Ok(Some(v)) => println!("{}", String::from_utf8_lossy(&v)),
                        Ok(None) => println!("(nil)"),
                        Err(e) => println!("ERR get failed: {e}"),
                    },
                    None => println!("ERR usage: GET key"),
                },
                "DEL" => match parts.next() {
                    Some(k) => match engine.delete(k.as_bytes().to_vec()) {
                        Ok(()) => println!("OK"),
                        Err(e) => println!("ERR del failed: {e}"),
                    },
                    None => println!("ERR usage: DEL key"),
                },
                "RANGE" => match (parts.next(), parts.next()) {
                    (Some(start), Some(end)) => {
                        match engine.range(start.as_bytes(), end.as_bytes()) {
                            Ok(results) if results.is_empty() => println!("(empty)"),
                            Ok(results) => {
                                for (k, v) in &results {
                                    println!(
                                        "{} -> {}",
                                        String::from_utf8_lossy(k),
                                        String::from_utf8_lossy(v)
                                    );
                                }
                                println!("({} entries)", results.len());
                            }
                            Err(e) => println!("ERR range failed: {e}"),
                        }
                    }
                    _ => println!("ERR usage: RANGE start end"),
                },
                "COMPACT" => match engine.compact() {
                    Ok(()) => println!("OK (sstables={})", engine.sstable_count()),
                    Err(e) => println!("ERR compact failed: {e}"),
                },
                "FLUSH" => match engine.flush() {
                    Ok(()) => println!("OK (sstables={})", engine.sstable_count()),
                    Err(e) => println!("ERR flush failed: {e}"),
                },
                "STATS" => println!(
                    "memtable={} sstables={} flushing={} compacting={}",
                    engine.memtable_size(),
                    engine.sstable_count(),
                    engine.is_flushing(),
                    engine.is_compacting()
                ),
                "EXIT" | "QUIT" => {
                    println!("bye");
                    break;
                }
                other => println!("unknown command: {other}"),
            }
        }

        print!("> ");
        io::stdout().flush().ok();
    }

    Ok(())
}
