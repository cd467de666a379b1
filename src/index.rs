use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Default modification-buffer size before a `set`/`delete` forces a
/// commit+reopen (§4.2).
pub const DEFAULT_MAX_MODIFICATIONS: usize = 10_000;

const MIN_COMPACT_LINES: u64 = 256;

/// Rough per-entry footprint used to turn `SEQSTORE_INDEX_CACHE_BYTES` into
/// an initial `HashMap` capacity hint.
const APPROX_BYTES_PER_ENTRY: usize = 64;

#[derive(Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    Set { id: String, key: u64 },
    Tombstone { id: String },
}

#[derive(Clone, Copy)]
enum BufferedEntry {
    Set(u64),
    Tombstone,
}

struct Snapshot {
    by_identifier: HashMap<String, u64>,
    by_key: BTreeMap<u64, String>,
}

/// Durable identifier → key mapping.
///
/// Writes land in an in-memory modification buffer and an append-only
/// journal; reads consult the buffer first, falling back to an immutable
/// snapshot that is only rebuilt on an explicit or threshold-triggered
/// commit+reopen. The snapshot is held behind an `Arc` so an iterator can
/// outlive a borrow of `self` and independently detect invalidation via a
/// shared generation counter.
pub struct IdentifierIndex {
    dir: PathBuf,
    journal_path: PathBuf,
    writer: BufWriter<File>,
    snapshot: Arc<Snapshot>,
    generation: Arc<AtomicU64>,
    buffer: HashMap<String, BufferedEntry>,
    journal_lines: u64,
    max_modifications: usize,
}

impl IdentifierIndex {
    pub fn open(store_dir: &Path, max_modifications: usize) -> Result<Self> {
        Self::open_with_cache_hint(store_dir, max_modifications, 0)
    }

    /// Like `open`, but pre-reserves `HashMap` capacity for roughly
    /// `cache_hint_bytes / APPROX_BYTES_PER_ENTRY` entries, the
    /// `SEQSTORE_INDEX_CACHE_BYTES` knob's effect (§6). `0` skips the
    /// reservation.
    pub fn open_with_cache_hint(
        store_dir: &Path,
        max_modifications: usize,
        cache_hint_bytes: usize,
    ) -> Result<Self> {
        let dir = store_dir.join("index");
        std::fs::create_dir_all(&dir)?;
        let journal_path = dir.join("journal.log");
        let (mut by_identifier, by_key, lines) = Self::replay(&journal_path)?;
        if cache_hint_bytes > 0 {
            let estimated_entries = cache_hint_bytes / APPROX_BYTES_PER_ENTRY;
            by_identifier.reserve(estimated_entries.saturating_sub(by_identifier.len()));
        }
        let writer = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&journal_path)?,
        );
        Ok(IdentifierIndex {
            dir,
            journal_path,
            writer,
            snapshot: Arc::new(Snapshot {
                by_identifier,
                by_key,
            }),
            generation: Arc::new(AtomicU64::new(0)),
            buffer: HashMap::new(),
            journal_lines: lines,
            max_modifications,
        })
    }

    fn replay(path: &Path) -> Result<(HashMap<String, u64>, BTreeMap<u64, String>, u64)> {
        let mut latest: HashMap<String, Option<u64>> = HashMap::new();
        let mut lines = 0u64;
        match File::open(path) {
            Ok(file) => {
                for line in BufReader::new(file).lines() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    lines += 1;
                    let entry: JournalEntry = serde_json::from_str(&line)?;
                    match entry {
                        JournalEntry::Set { id, key } => {
                            latest.insert(id, Some(key));
                        }
                        JournalEntry::Tombstone { id } => {
                            latest.insert(id, None);
                        }
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut by_identifier = HashMap::new();
        let mut by_key = BTreeMap::new();
        for (id, state) in latest {
            if let Some(key) = state {
                by_identifier.insert(id.clone(), key);
                by_key.insert(key, id);
            }
        }
        Ok((by_identifier, by_key, lines))
    }

    /// `key > 0`, identifier nonempty with no embedded newline.
    pub fn set(&mut self, identifier: &str, key: u64) -> Result<()> {
        validate_identifier(identifier)?;
        if key == 0 {
            return Err(StoreError::InvalidArgument(
                "key must be greater than zero".into(),
            ));
        }
        self.buffer
            .insert(identifier.to_string(), BufferedEntry::Set(key));
        self.reopen_if_over_threshold()
    }

    pub fn delete(&mut self, identifier: &str) -> Result<()> {
        validate_identifier(identifier)?;
        self.buffer
            .insert(identifier.to_string(), BufferedEntry::Tombstone);
        self.reopen_if_over_threshold()
    }

    fn reopen_if_over_threshold(&mut self) -> Result<()> {
        if self.buffer.len() > self.max_modifications {
            self.commit()?;
            self.reopen()?;
        }
        Ok(())
    }

    pub fn get(&self, identifier: &str) -> Result<u64> {
        match self.buffer.get(identifier) {
            Some(BufferedEntry::Set(key)) => Ok(*key),
            Some(BufferedEntry::Tombstone) => Err(StoreError::NotFound),
            None => self
                .snapshot
                .by_identifier
                .get(identifier)
                .copied()
                .ok_or(StoreError::NotFound),
        }
    }

    /// Persists buffered modifications to the journal. Does not itself
    /// refresh the reader snapshot or clear the buffer.
    pub fn commit(&mut self) -> Result<()> {
        for (id, entry) in self.buffer.iter() {
            let record = match entry {
                BufferedEntry::Set(key) => JournalEntry::Set {
                    id: id.clone(),
                    key: *key,
                },
                BufferedEntry::Tombstone => JournalEntry::Tombstone { id: id.clone() },
            };
            serde_json::to_writer(&mut self.writer, &record)?;
            self.writer.write_all(b"\n")?;
            self.journal_lines += 1;
        }
        self.writer.flush()?;
        Ok(())
    }

    /// Rebuilds the snapshot from the journal, bumps the generation counter,
    /// and clears the modification buffer.
    pub fn reopen(&mut self) -> Result<()> {
        let (by_identifier, by_key, lines) = Self::replay(&self.journal_path)?;
        self.journal_lines = lines;
        self.snapshot = Arc::new(Snapshot {
            by_identifier,
            by_key,
        });
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.buffer.clear();
        self.maybe_compact()?;
        Ok(())
    }

    fn maybe_compact(&mut self) -> Result<()> {
        let live = self.snapshot.by_identifier.len() as u64;
        let threshold = (4 * live).max(MIN_COMPACT_LINES);
        if self.journal_lines <= threshold {
            return Ok(());
        }
        let tmp_path = self.dir.join("journal.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for (key, id) in self.snapshot.by_key.iter() {
                let record = JournalEntry::Set {
                    id: id.clone(),
                    key: *key,
                };
                serde_json::to_writer(&mut tmp, &record)?;
                tmp.write_all(b"\n")?;
            }
            tmp.flush()?;
        }
        std::fs::rename(&tmp_path, &self.journal_path)?;
        self.writer = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.journal_path)?,
        );
        self.journal_lines = live;
        Ok(())
    }

    /// Number of live identifiers, after a commit+reopen to reflect the
    /// fully committed state.
    pub fn length(&mut self) -> Result<usize> {
        self.commit()?;
        self.reopen()?;
        Ok(self.snapshot.by_identifier.len())
    }

    /// Key-ascending iteration over `(identifier, key)`, which is also
    /// insertion-order-of-most-recent-write order since keys only grow.
    /// Forces a commit+reopen first so the iteration sees a consistent
    /// snapshot; each step re-checks the generation counter and surfaces
    /// `ConcurrentModification` if another reopen happened mid-iteration.
    pub fn iter(&mut self) -> Result<IdentifierIter> {
        self.commit()?;
        self.reopen()?;
        let captured = self.generation.load(Ordering::SeqCst);
        let entries: Vec<(u64, String)> = self
            .snapshot
            .by_key
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        Ok(IdentifierIter {
            generation: Arc::clone(&self.generation),
            captured,
            entries: entries.into_iter(),
        })
    }

    pub fn close(&mut self) -> Result<()> {
        self.commit()?;
        self.writer.flush()?;
        Ok(())
    }
}

pub struct IdentifierIter {
    generation: Arc<AtomicU64>,
    captured: u64,
    entries: std::vec::IntoIter<(u64, String)>,
}

impl Iterator for IdentifierIter {
    type Item = Result<(String, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.generation.load(Ordering::SeqCst) != self.captured {
            return Some(Err(StoreError::ConcurrentModification));
        }
        self.entries.next().map(|(key, id)| Ok((id, key)))
    }
}

fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty() {
        return Err(StoreError::InvalidArgument(
            "identifier must not be empty".into(),
        ));
    }
    if identifier.contains('\n') {
        return Err(StoreError::InvalidArgument(
            "identifier must not contain a newline".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn set_get_roundtrip() {
        let dir = tempdir().unwrap();
        let mut idx = IdentifierIndex::open(dir.path(), DEFAULT_MAX_MODIFICATIONS).unwrap();
        idx.set("abc", 1).unwrap();
        assert_eq!(idx.get("abc").unwrap(), 1);
    }

    #[test]
    fn delete_before_commit_masks_buffer() {
        let dir = tempdir().unwrap();
        let mut idx = IdentifierIndex::open(dir.path(), DEFAULT_MAX_MODIFICATIONS).unwrap();
        idx.set("abc", 1).unwrap();
        idx.delete("abc").unwrap();
        assert!(matches!(idx.get("abc"), Err(StoreError::NotFound)));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut idx = IdentifierIndex::open(dir.path(), DEFAULT_MAX_MODIFICATIONS).unwrap();
            idx.set("abc", 1).unwrap();
            idx.set("def", 2).unwrap();
            idx.delete("abc").unwrap();
            idx.close().unwrap();
        }
        let mut idx = IdentifierIndex::open(dir.path(), DEFAULT_MAX_MODIFICATIONS).unwrap();
        assert!(matches!(idx.get("abc"), Err(StoreError::NotFound)));
        assert_eq!(idx.get("def").unwrap(), 2);
        assert_eq!(idx.length().unwrap(), 1);
    }

    #[test]
    fn iteration_order_follows_last_write_key() {
        let dir = tempdir().unwrap();
        let mut idx = IdentifierIndex::open(dir.path(), DEFAULT_MAX_MODIFICATIONS).unwrap();
        idx.set("a", 1).unwrap();
        idx.set("b", 2).unwrap();
        idx.set("c", 3).unwrap();
        idx.set("a", 4).unwrap();
        let ids: Vec<String> = idx.iter().unwrap().map(|r| r.unwrap().0).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn rejects_empty_identifier() {
        let dir = tempdir().unwrap();
        let mut idx = IdentifierIndex::open(dir.path(), DEFAULT_MAX_MODIFICATIONS).unwrap();
        assert!(matches!(
            idx.set("", 1),
            Err(StoreError::InvalidArgument(_))
        ));
    }
}
