use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Seek, SeekFrom};

use super::frame::{scan, Scanned, Target};
use super::posio::PosReader;

/// Sparse, lazily-filled, in-memory map from block number to the first key
/// found at or after that block's start offset. Used only to bisect the key
/// space down to a single ~block-sized region before a forward frame scan;
/// never persisted, always safe to rebuild by clearing the cache.
pub(crate) struct BlockIndex {
    block_size: u64,
    cache: HashMap<u64, u64>,
    size: u64,
}

impl BlockIndex {
    pub(crate) fn new(block_size: u64, size: u64) -> Self {
        BlockIndex {
            block_size,
            cache: HashMap::new(),
            size,
        }
    }

    pub(crate) fn offset(&self, block: u64) -> u64 {
        block * self.block_size
    }

    pub(crate) fn adjust_size(&mut self, added: u64) {
        self.size += added;
    }

    /// Number of blocks spanning the current file size.
    pub(crate) fn len(&self) -> u64 {
        if self.size == 0 {
            0
        } else {
            (self.size + self.block_size - 1) / self.block_size
        }
    }

    /// Returns the lowest block whose first key is `> key`, minus one,
    /// floored at zero — the block to start a forward scan from when
    /// looking for `key`.
    pub(crate) fn search(
        &mut self,
        reader: &mut PosReader<File>,
        key: u64,
        lo: u64,
    ) -> io::Result<u64> {
        let idx = self.bisect_left(reader, key, lo)?;
        Ok(idx.saturating_sub(1))
    }

    fn first_key(&mut self, reader: &mut PosReader<File>, block: u64) -> io::Result<Option<u64>> {
        if let Some(&key) = self.cache.get(&block) {
            return Ok(Some(key));
        }
        reader.seek(SeekFrom::Start(self.offset(block)))?;
        let found = match scan(reader, Target::KeyOnly, true)? {
            Scanned::Key(key) => {
                self.cache.insert(block, key);
                Some(key)
            }
            _ => None,
        };
        Ok(found)
    }

    /// Leftmost block index `i` in `[lo, len)` such that every block before
    /// `i` has a first key `< key` and every block from `i` on has a first
    /// key `>= key`. A block with no discoverable first key (past EOF, or no
    /// valid frame at/after its offset) is treated as `>= key` — the same
    /// way the original's `IndexError`-on-missing-block is folded into its
    /// bisection.
    fn bisect_left(&mut self, reader: &mut PosReader<File>, key: u64, lo: u64) -> io::Result<u64> {
        let mut lo = lo;
        let mut hi = self.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.first_key(reader, mid)? {
                Some(first) if first < key => lo = mid + 1,
                _ => hi = mid,
            }
        }
        Ok(lo)
    }
}
