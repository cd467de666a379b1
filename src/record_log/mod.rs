mod block_index;
mod frame;
mod posio;

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};

use block_index::BlockIndex;
use frame::{decompress, scan, write_frame, Scanned, Target};
use posio::{PosReader, PosWriter};

pub(crate) use frame::compress;

/// Default block size for the sparse block index, matching the original
/// store's 8 KiB default.
pub const DEFAULT_BLOCK_SIZE: u64 = 8192;

/// Append-only log of `(key, compressed payload)` frames.
///
/// Keys must be supplied in strictly increasing order; the log itself never
/// renumbers or moves a key once it has been written (compaction rewrites
/// the file but keeps every surviving key's identity).
pub struct RecordLog {
    path: PathBuf,
    writer: PosWriter<File>,
    reader: PosReader<File>,
    block_index: BlockIndex,
    last_key: Option<u64>,
}

impl RecordLog {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_block_size(path, DEFAULT_BLOCK_SIZE)
    }

    pub fn open_with_block_size(path: &Path, block_size: u64) -> Result<Self> {
        let append_handle = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        let size = append_handle.metadata()?.len();
        let writer = PosWriter::new(append_handle)?;
        let mut reader = PosReader::new(File::open(path)?)?;
        let mut block_index = BlockIndex::new(block_size, size);

        let last_key = Self::recover_last_key(path, &mut reader, &mut block_index, size)?;

        Ok(RecordLog {
            path: path.to_path_buf(),
            writer,
            reader,
            block_index,
            last_key,
        })
    }

    fn recover_last_key(
        path: &Path,
        reader: &mut PosReader<File>,
        block_index: &mut BlockIndex,
        size: u64,
    ) -> Result<Option<u64>> {
        if size == 0 {
            return Ok(None);
        }
        let last_blk = block_index.search(reader, u64::MAX, 0)?;
        reader.seek(SeekFrom::Start(block_index.offset(last_blk)))?;
        if let Scanned::Key(key) = scan(reader, Target::Last, false)? {
            return Ok(Some(key));
        }
        // Bisection landed on a block with no reconcilable tail frame. Fall
        // back to a full scan from the start before refusing to open: a
        // partial frame at the very end must be ignored, never mistaken for
        // total corruption.
        reader.seek(SeekFrom::Start(0))?;
        if let Scanned::Key(key) = scan(reader, Target::Last, false)? {
            return Ok(Some(key));
        }
        Err(StoreError::CorruptLog(format!(
            "no valid frame found in non-empty record log at {}",
            path.display()
        )))
    }

    pub fn last_key(&self) -> Option<u64> {
        self.last_key
    }

    pub fn size_on_disk(&self) -> u64 {
        self.block_index.size()
    }

    /// Appends `(key, payload)`. `payload` is compressed unless
    /// `already_compressed` is set (used by `copy_to` during compaction,
    /// which re-writes existing compressed bytes verbatim).
    pub fn add(&mut self, key: u64, payload: &[u8], already_compressed: bool) -> Result<()> {
        if let Some(last) = self.last_key {
            if key <= last {
                return Err(StoreError::MonotonicityViolation {
                    key,
                    last_key: last,
                });
            }
        }
        let compressed = if already_compressed {
            payload.to_vec()
        } else {
            compress(payload)?
        };
        let before = self.writer.pos();
        write_frame(&mut self.writer, key, &compressed)?;
        self.writer.flush()?;
        self.block_index.adjust_size(self.writer.pos() - before);
        self.last_key = Some(key);
        Ok(())
    }

    pub fn get(&mut self, key: u64) -> Result<Vec<u8>> {
        let blk = self.block_index.search(&mut self.reader, key, 0)?;
        self.reader
            .seek(SeekFrom::Start(self.block_index.offset(blk)))?;
        match scan(
            &mut self.reader,
            Target::At {
                target: key,
                exact: true,
            },
            false,
        )? {
            Scanned::Frame { data, .. } => Ok(data),
            _ => Err(StoreError::NotFound),
        }
    }

    /// Lazy, key-ordered scan over `[start, stop)` (or `[start, stop]` when
    /// `inclusive`). Not safe to interleave with another positional read on
    /// the same log without repositioning first.
    pub fn range(
        &mut self,
        start: u64,
        stop: Option<u64>,
        inclusive: bool,
    ) -> Result<RangeIter<'_>> {
        let blk = self.block_index.search(&mut self.reader, start, 0)?;
        self.reader
            .seek(SeekFrom::Start(self.block_index.offset(blk)))?;
        Ok(RangeIter {
            log: self,
            start,
            stop: stop.unwrap_or(u64::MAX),
            inclusive,
            first: true,
            exhausted: false,
        })
    }

    /// Lazy fetch of a *sorted, strictly increasing* list of keys, reusing
    /// the current file position when the next key's block lies ahead of
    /// where the last read left off, to avoid a reseek.
    pub fn get_multiple(&mut self, keys: Vec<u64>, ignore_missing: bool) -> GetMultipleIter<'_> {
        GetMultipleIter {
            log: self,
            keys: keys.into_iter(),
            ignore_missing,
            offset: None,
            prev_blk: 0,
            last_key_seen: None,
            errored: false,
        }
    }

    /// Streams the frame for every key in `keys` (sorted ascending) into
    /// `target`, preserving compression. Used by garbage collection.
    pub fn copy_to(
        &mut self,
        target: &mut RecordLog,
        keys: &[u64],
        skip_data_check: bool,
    ) -> Result<()> {
        let mut offset: Option<u64> = None;
        let mut prev_blk: u64 = 0;
        let mut prev_key: Option<u64> = None;

        for &key in keys {
            if let Some(prev) = prev_key {
                if !(prev < key) {
                    return Err(StoreError::InvalidOrder);
                }
            }

            let blk = self.block_index.search(&mut self.reader, key, prev_blk)?;
            if offset.map_or(true, |off| self.block_index.offset(blk) > off) {
                self.reader
                    .seek(SeekFrom::Start(self.block_index.offset(blk)))?;
            } else if let Some(off) = offset {
                self.reader.seek(SeekFrom::Start(off))?;
            }

            match scan(
                &mut self.reader,
                Target::At {
                    target: key,
                    exact: true,
                },
                true,
            )? {
                Scanned::Frame { key: found, data } => {
                    if !skip_data_check {
                        decompress(&data).map_err(|_| {
                            StoreError::CorruptLog(format!(
                                "frame for live key {} failed to decompress during gc",
                                found
                            ))
                        })?;
                    }
                    target.add(found, &data, true)?;
                    offset = Some(self.reader.pos());
                }
                _ => return Err(StoreError::NotFound),
            }
            prev_blk = blk;
            prev_key = Some(key);
        }
        Ok(())
    }

    /// Restartable full scan from the start of the log.
    pub fn iter(&mut self) -> Result<RecordIter<'_>> {
        self.reader.seek(SeekFrom::Start(0))?;
        Ok(RecordIter {
            log: self,
            exhausted: false,
        })
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.flush()
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

pub struct RangeIter<'a> {
    log: &'a mut RecordLog,
    start: u64,
    stop: u64,
    inclusive: bool,
    first: bool,
    exhausted: bool,
}

impl<'a> Iterator for RangeIter<'a> {
    type Item = Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let target = if self.first {
            self.first = false;
            Target::At {
                target: self.start,
                exact: false,
            }
        } else {
            Target::Next
        };
        match scan(&mut self.log.reader, target, false) {
            Ok(Scanned::Frame { key, data }) => {
                let within = if self.inclusive {
                    key <= self.stop
                } else {
                    key < self.stop
                };
                if !within {
                    self.exhausted = true;
                    return None;
                }
                Some(Ok((key, data)))
            }
            Ok(_) => {
                self.exhausted = true;
                None
            }
            Err(e) => {
                self.exhausted = true;
                Some(Err(e.into()))
            }
        }
    }
}

pub struct GetMultipleIter<'a> {
    log: &'a mut RecordLog,
    keys: std::vec::IntoIter<u64>,
    ignore_missing: bool,
    offset: Option<u64>,
    prev_blk: u64,
    last_key_seen: Option<u64>,
    errored: bool,
}

impl<'a> Iterator for GetMultipleIter<'a> {
    type Item = Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.errored {
                return None;
            }
            let key = self.keys.next()?;
            if let Some(prev) = self.last_key_seen {
                if !(prev < key) {
                    self.errored = true;
                    return Some(Err(StoreError::InvalidOrder));
                }
            }
            self.last_key_seen = Some(key);

            let blk = match self.log.block_index.search(&mut self.log.reader, key, self.prev_blk)
            {
                Ok(b) => b,
                Err(e) => {
                    self.errored = true;
                    return Some(Err(e.into()));
                }
            };
            let seek_result = if self.offset.map_or(true, |off| self.log.block_index.offset(blk) > off) {
                self.log
                    .reader
                    .seek(SeekFrom::Start(self.log.block_index.offset(blk)))
            } else {
                self.log.reader.seek(SeekFrom::Start(self.offset.unwrap()))
            };
            if let Err(e) = seek_result {
                self.errored = true;
                return Some(Err(e.into()));
            }

            match scan(
                &mut self.log.reader,
                Target::At {
                    target: key,
                    exact: true,
                },
                false,
            ) {
                Ok(Scanned::Frame { key: found, data }) => {
                    self.offset = Some(self.log.reader.pos());
                    self.prev_blk = blk;
                    return Some(Ok((found, data)));
                }
                Ok(_) => {
                    if self.ignore_missing {
                        continue;
                    }
                    self.errored = true;
                    return Some(Err(StoreError::NotFound));
                }
                Err(e) => {
                    self.errored = true;
                    return Some(Err(e.into()));
                }
            }
        }
    }
}

pub struct RecordIter<'a> {
    log: &'a mut RecordLog,
    exhausted: bool,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        match scan(&mut self.log.reader, Target::Next, false) {
            Ok(Scanned::Frame { key, data }) => Some(Ok((key, data))),
            Ok(_) => {
                self.exhausted = true;
                None
            }
            Err(e) => {
                self.exhausted = true;
                Some(Err(e.into()))
            }
        }
    }
}
