use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};

/// A buffered reader that tracks its logical stream position, so callers can
/// capture a position, scan ahead speculatively, and seek back to it without
/// an extra `stream_position` round-trip.
pub(crate) struct PosReader<R> {
    reader: BufReader<R>,
    pos: u64,
}

impl<R: Read + Seek> PosReader<R> {
    pub(crate) fn new(mut inner: R) -> io::Result<Self> {
        let pos = inner.seek(SeekFrom::Current(0))?;
        Ok(PosReader {
            reader: BufReader::new(inner),
            pos,
        })
    }

    pub(crate) fn pos(&self) -> u64 {
        self.pos
    }
}

impl<R: Read + Seek> Read for PosReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.reader.read(buf)?;
        self.pos += len as u64;
        Ok(len)
    }
}

impl<R: Read + Seek> BufRead for PosReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.reader.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.reader.consume(amt);
        self.pos += amt as u64;
    }
}

impl<R: Read + Seek> Seek for PosReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = self.reader.seek(pos)?;
        Ok(self.pos)
    }
}

/// A buffered writer that tracks its logical stream position, mirroring
/// `PosReader`, so the record log can report frame offsets without a
/// separate `stream_position` call after every write.
pub(crate) struct PosWriter<W: Write + Seek> {
    writer: BufWriter<W>,
    pos: u64,
}

impl<W: Write + Seek> PosWriter<W> {
    pub(crate) fn new(mut inner: W) -> io::Result<Self> {
        let pos = inner.seek(SeekFrom::Current(0))?;
        Ok(PosWriter {
            writer: BufWriter::new(inner),
            pos,
        })
    }

    pub(crate) fn pos(&self) -> u64 {
        self.pos
    }
}

impl<W: Write + Seek> Write for PosWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.writer.write(buf)?;
        self.pos += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
