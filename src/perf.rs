//! Write-buffer batching for block output.
//!
//! [`WriteBuffer`] accumulates small writes into a fixed-capacity buffer and
//! flushes to the underlying writer in large chunks.  Containers are written
//! as a stream of payloads that are usually a few KiB each, so batching keeps
//! the number of `write` syscalls proportional to the output size instead of
//! the block count.

use std::io::{self, Write};

/// Default flush threshold for container and image output.
pub const WRITE_BUFFER_SIZE: usize = 1 << 20;

const ZEROS: [u8; 4096] = [0u8; 4096];

/// Buffered writer with configurable flush threshold.
///
/// Unlike `std::io::BufWriter`, this exposes `bytes_written` (the logical
/// stream position, including bytes still in the buffer) and can pad the
/// stream to an alignment boundary.
pub struct WriteBuffer<W: Write> {
    inner:     W,
    buf:       Vec<u8>,
    capacity:  usize,
    pub bytes_written: u64,
}

impl<W: Write> WriteBuffer<W> {
    /// Create a new `WriteBuffer` with the given capacity in bytes.
    pub fn new(inner: W, capacity: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(capacity),
            capacity,
            bytes_written: 0,
        }
    }

    /// Flush if buffer exceeds capacity.
    fn flush_if_full(&mut self) -> io::Result<()> {
        if self.buf.len() >= self.capacity {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    /// Append `count` zero bytes.
    pub fn write_zeros(&mut self, mut count: u64) -> io::Result<()> {
        while count > 0 {
            let n = count.min(ZEROS.len() as u64) as usize;
            self.write_all(&ZEROS[..n])?;
            count -= n as u64;
        }
        Ok(())
    }

    /// Zero-pad up to the next multiple of `alignment` (a power of two) and
    /// return the new position.
    pub fn pad_to(&mut self, alignment: u64) -> io::Result<u64> {
        let mask = alignment - 1;
        let target = (self.bytes_written + mask) & !mask;
        self.write_zeros(target - self.bytes_written)?;
        Ok(target)
    }

    /// Flush everything and hand back the underlying writer.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for WriteBuffer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // For large writes that exceed remaining capacity, bypass the buffer.
        if buf.len() >= self.capacity {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
            self.inner.write_all(buf)?;
        } else {
            self.buf.extend_from_slice(buf);
            self.flush_if_full()?;
        }
        self.bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
        }
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_buffer_flushes() {
        let mut buf: Vec<u8> = Vec::new();
        {
            let mut wb = WriteBuffer::new(&mut buf, 8);
            wb.write_all(b"hello").unwrap();
            wb.write_all(b" world!").unwrap();
            wb.flush().unwrap();
        }
        assert_eq!(&buf, b"hello world!");
    }

    #[test]
    fn bytes_written_counts_buffered_data() {
        let mut wb = WriteBuffer::new(Vec::new(), 64);
        wb.write_all(b"abc").unwrap();
        assert_eq!(wb.bytes_written, 3);
        wb.write_all(&[1u8; 100]).unwrap();
        assert_eq!(wb.bytes_written, 103);
        assert_eq!(wb.into_inner().unwrap().len(), 103);
    }

    #[test]
    fn pad_to_aligns_with_zeros() {
        let mut wb = WriteBuffer::new(Vec::new(), 16);
        wb.write_all(b"xyz").unwrap();
        assert_eq!(wb.pad_to(8).unwrap(), 8);
        assert_eq!(wb.pad_to(8).unwrap(), 8);
        wb.write_zeros(10_000).unwrap();
        let out = wb.into_inner().unwrap();
        assert_eq!(out.len(), 10_008);
        assert_eq!(&out[..8], b"xyz\0\0\0\0\0");
        assert!(out[8..].iter().all(|&b| b == 0));
    }
}
