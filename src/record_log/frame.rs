use std::fs::File;
use std::io::{self, BufRead, Read, Seek, SeekFrom, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use super::posio::PosReader;

/// Marker bytes that open every frame. Its appearance inside a payload is
/// tolerated: the scanner only treats a line ending in `SENTINEL` as a real
/// frame boundary once the following two lines parse as a key and a length.
pub(crate) const SENTINEL: &[u8] = b"----";

pub(crate) fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub(crate) fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Serialize one frame: `SENTINEL "\n" key "\n" length "\n" payload "\n"`.
/// `payload` must already be compressed; the trailing newline is written but
/// its absence at read time is tolerated (see `scan`).
pub(crate) fn write_frame<W: Write>(w: &mut W, key: u64, compressed: &[u8]) -> io::Result<()> {
    w.write_all(SENTINEL)?;
    w.write_all(b"\n")?;
    write!(w, "{}\n", key)?;
    write!(w, "{}\n", compressed.len())?;
    w.write_all(compressed)?;
    w.write_all(b"\n")?;
    Ok(())
}

/// What a scan is looking for.
#[derive(Clone, Copy)]
pub(crate) enum Target {
    /// Return the very next syntactically valid frame, whatever its key.
    Next,
    /// Return only the key of the next valid frame (used by the block index
    /// to probe a block's first key; payload bytes are left unconsumed).
    KeyOnly,
    /// Return the first valid frame with `key == target` (`exact`) or the
    /// first with `key >= target` (`!exact`, the "greater" mode).
    At { target: u64, exact: bool },
    /// Scan to EOF and return the key of the last valid frame seen.
    Last,
}

pub(crate) enum Scanned {
    Frame { key: u64, data: Vec<u8> },
    Key(u64),
    NotFound,
}

/// Resilient frame scanner.
///
/// Reads lines until one ends with `SENTINEL "\n"`, then attempts to parse
/// the next two lines as a decimal key and length. A failed parse, or a
/// failed decompression of the payload (unless `keep_compressed` is set, in
/// which case payload bytes are trusted verbatim), rewinds to just past the
/// sentinel candidate and resumes scanning — the "sentinel" was either
/// corruption or a coincidental match inside a payload. EOF mid-frame simply
/// ends the scan with no match; it is never reported as an error here.
pub(crate) fn scan(
    reader: &mut PosReader<File>,
    target: Target,
    keep_compressed: bool,
) -> io::Result<Scanned> {
    let mut last_seen: Option<u64> = None;
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break; // EOF: no (more) sentinel candidates.
        }
        let retry_position = reader.pos();
        if !ends_with_sentinel_line(&line) {
            continue;
        }

        let key = match read_decimal_line(reader)? {
            Some(v) => v,
            None => {
                reader.seek(SeekFrom::Start(retry_position))?;
                continue;
            }
        };
        let length = match read_decimal_line(reader)? {
            Some(v) => v,
            None => {
                reader.seek(SeekFrom::Start(retry_position))?;
                continue;
            }
        };

        if matches!(target, Target::KeyOnly) {
            return Ok(Scanned::Key(key));
        }

        if let Target::At { target, exact } = target {
            if key < target {
                // Not there yet: keep scanning forward from right here,
                // treating the skipped payload bytes as further candidate
                // lines rather than seeking past `length` bytes.
                continue;
            }
            if exact && key != target {
                return Ok(Scanned::NotFound);
            }
        }

        let raw = read_exact_vec(reader, length)?;
        let data = if keep_compressed {
            raw
        } else {
            match decompress(&raw) {
                Ok(d) => d,
                Err(_) => {
                    reader.seek(SeekFrom::Start(retry_position))?;
                    continue;
                }
            }
        };

        let after_payload = reader.pos();
        let mut maybe_newline = [0u8; 1];
        let read = reader.read(&mut maybe_newline)?;
        if read == 0 || maybe_newline[0] != b'\n' {
            // Tolerate a missing trailing newline at the tail of the log.
            reader.seek(SeekFrom::Start(after_payload))?;
        }

        if matches!(target, Target::Last) {
            last_seen = Some(key);
            continue;
        }
        return Ok(Scanned::Frame { key, data });
    }

    if matches!(target, Target::Last) {
        if let Some(key) = last_seen {
            return Ok(Scanned::Key(key));
        }
    }
    Ok(Scanned::NotFound)
}

fn ends_with_sentinel_line(line: &[u8]) -> bool {
    let mut needle = Vec::with_capacity(SENTINEL.len() + 1);
    needle.extend_from_slice(SENTINEL);
    needle.push(b'\n');
    line.ends_with(&needle)
}

fn read_decimal_line(reader: &mut PosReader<File>) -> io::Result<Option<u64>> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    let text = match std::str::from_utf8(&buf) {
        Ok(t) => t.trim(),
        Err(_) => return Ok(None),
    };
    Ok(text.parse::<u64>().ok())
}

/// Reads up to `length` bytes, stopping early (short of `length`) at EOF
/// rather than erroring — a truncated read here is a corruption symptom the
/// caller discovers via a failed decompression, not an I/O error.
fn read_exact_vec(reader: &mut PosReader<File>, length: u64) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; length as usize];
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            buf.truncate(filled);
            break;
        }
        filled += n;
    }
    Ok(buf)
}
