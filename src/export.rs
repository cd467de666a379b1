use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::{Result, StoreError};

const FORMAT_LINE: &str = "Export format version: 1";

/// Fixed multi-byte separator between records in the compressed body.
/// Distinct from the Record Log's `SENTINEL`; writers refuse to emit an
/// identifier or payload that contains it.
pub const BOUNDARY_SENTINEL: &[u8] = b"\n=>> [{]} SequentialStore export record boundary {[}] <<=\n";

/// Write-only handle for an export stream.
pub struct ExportWriter {
    encoder: DeflateEncoder<File>,
}

impl ExportWriter {
    pub fn create(path: &Path, count: usize) -> Result<Self> {
        let mut file = File::create(path)?;
        writeln!(file, "{}", FORMAT_LINE)?;
        writeln!(file, "{}", count)?;
        let encoder = DeflateEncoder::new(file, Compression::default());
        Ok(ExportWriter { encoder })
    }

    pub fn write_item(&mut self, identifier: &str, payload: &[u8]) -> Result<()> {
        if identifier.contains('\n') {
            return Err(StoreError::EncodingViolation);
        }
        if contains_sentinel(identifier.as_bytes()) || contains_sentinel(payload) {
            return Err(StoreError::EncodingViolation);
        }
        self.encoder.write_all(identifier.as_bytes())?;
        self.encoder.write_all(b"\n")?;
        self.encoder.write_all(payload)?;
        self.encoder.write_all(BOUNDARY_SENTINEL)?;
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        self.encoder.finish()?;
        Ok(())
    }
}

fn contains_sentinel(data: &[u8]) -> bool {
    if data.len() < BOUNDARY_SENTINEL.len() {
        return false;
    }
    data.windows(BOUNDARY_SENTINEL.len())
        .any(|w| w == BOUNDARY_SENTINEL)
}

/// Read-only handle for an export stream; yields `(identifier, payload)`
/// pairs in the order they were written.
pub struct ExportReader {
    count: usize,
    items: std::vec::IntoIter<(String, Vec<u8>)>,
}

impl ExportReader {
    pub fn open(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;

        let first_nl = find_byte(&raw, b'\n').ok_or_else(|| version_error(path, None))?;
        let version_line = std::str::from_utf8(&raw[..first_nl]).unwrap_or("");
        if version_line != FORMAT_LINE {
            return Err(version_error(path, Some(version_line.to_string())));
        }

        let rest = &raw[first_nl + 1..];
        let second_nl = find_byte(rest, b'\n').ok_or_else(|| count_line_error(path, None))?;
        let count_line = std::str::from_utf8(&rest[..second_nl]).unwrap_or("").trim();
        let count: usize = count_line
            .parse()
            .map_err(|_| count_line_error(path, Some(count_line.to_string())))?;

        let compressed = &rest[second_nl + 1..];
        let mut decoder = DeflateDecoder::new(compressed);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;

        let mut items = Vec::with_capacity(count);
        let mut cursor = 0usize;
        while cursor < decompressed.len() {
            let nl = find_byte(&decompressed[cursor..], b'\n')
                .ok_or(StoreError::EncodingViolation)?
                + cursor;
            let identifier = std::str::from_utf8(&decompressed[cursor..nl])
                .map_err(|_| StoreError::Codec("invalid utf-8 identifier in export stream".into()))?
                .to_string();
            let payload_start = nl + 1;
            let sentinel_at = find_subslice(&decompressed[payload_start..], BOUNDARY_SENTINEL)
                .ok_or(StoreError::EncodingViolation)?
                + payload_start;
            let payload = decompressed[payload_start..sentinel_at].to_vec();
            items.push((identifier, payload));
            cursor = sentinel_at + BOUNDARY_SENTINEL.len();
        }

        Ok(ExportReader {
            count,
            items: items.into_iter(),
        })
    }

    /// Record count declared in the header; does not necessarily equal the
    /// number of items actually readable from a truncated file.
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Iterator for ExportReader {
    type Item = Result<(String, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next().map(Ok)
    }
}

fn version_error(path: &Path, found: Option<String>) -> StoreError {
    StoreError::VersionMismatch {
        path: path.display().to_string(),
        expected: FORMAT_LINE.to_string(),
        found,
    }
}

fn count_line_error(path: &Path, found: Option<String>) -> StoreError {
    StoreError::VersionMismatch {
        path: path.display().to_string(),
        expected: "<decimal record count>".to_string(),
        found,
    }
}

fn find_byte(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_items() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.export");

        let mut writer = ExportWriter::create(&path, 2).unwrap();
        writer.write_item("abc", b"hello").unwrap();
        writer.write_item("def", b"world").unwrap();
        writer.finish().unwrap();

        let reader = ExportReader::open(&path).unwrap();
        assert_eq!(reader.count(), 2);
        let items: Vec<_> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(
            items,
            vec![
                ("abc".to_string(), b"hello".to_vec()),
                ("def".to_string(), b"world".to_vec()),
            ]
        );
    }

    #[test]
    fn rejects_payload_containing_sentinel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.export");
        let mut writer = ExportWriter::create(&path, 1).unwrap();
        let mut payload = b"before".to_vec();
        payload.extend_from_slice(BOUNDARY_SENTINEL);
        payload.extend_from_slice(b"after");
        assert!(matches!(
            writer.write_item("x", &payload),
            Err(StoreError::EncodingViolation)
        ));
    }

    #[test]
    fn rejects_identifier_containing_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.export");
        let mut writer = ExportWriter::create(&path, 1).unwrap();
        assert!(matches!(
            writer.write_item("x\ny", b"payload"),
            Err(StoreError::EncodingViolation)
        ));
    }

    #[test]
    fn rejects_wrong_version_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.export");
        std::fs::write(&path, b"Export format version: 9\n0\n").unwrap();
        assert!(matches!(
            ExportReader::open(&path),
            Err(StoreError::VersionMismatch { .. })
        ));
    }
}
