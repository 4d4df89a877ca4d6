//! Sequential container writer.
//!
//! The header and index region is reserved (zero-filled) first, payloads are
//! appended in block order, and the real table is written over the reserved
//! region by [`ContainerWriter::finish`].  A container abandoned before
//! `finish` therefore never carries a valid index.

use std::io::{Seek, SeekFrom, Write};
use tracing::debug;

use crate::block::BlockResult;
use crate::format::{ContainerFormat, FormatError, Geometry, IndexEntry};
use crate::perf::{WriteBuffer, WRITE_BUFFER_SIZE};

pub struct ContainerWriter<W: Write + Seek> {
    out:      WriteBuffer<W>,
    format:   &'static dyn ContainerFormat,
    geometry: Geometry,
    reserved: u64,
    entries:  Vec<IndexEntry>,
}

impl<W: Write + Seek> ContainerWriter<W> {
    pub fn new(
        mut inner: W,
        format:    &'static dyn ContainerFormat,
        geometry:  Geometry,
    ) -> Result<Self, FormatError> {
        inner.seek(SeekFrom::Start(0))?;
        let reserved = format.table_len(&geometry);
        let mut out = WriteBuffer::new(inner, WRITE_BUFFER_SIZE);
        out.write_zeros(reserved)?;
        Ok(Self {
            out,
            format,
            geometry,
            reserved,
            entries: Vec::with_capacity(geometry.block_count() as usize),
        })
    }

    /// Bytes written so far, including the reserved table region.
    pub fn position(&self) -> u64 {
        self.out.bytes_written
    }

    /// Append the next block.  Blocks must arrive in index order.
    pub fn push(&mut self, block: &BlockResult) -> Result<(), FormatError> {
        let expected = self.entries.len() as u64;
        if block.index != expected {
            return Err(FormatError::EntryCount { expected, actual: block.index });
        }
        let family = block.family();
        if !self.format.supports(family) {
            return Err(FormatError::IllegalFamily { variant: self.format.variant(), family });
        }

        let offset = self.out.pad_to(self.geometry.alignment())?;
        self.out.write_all(&block.payload)?;
        self.entries.push(IndexEntry {
            offset,
            stored_len: block.payload.len() as u32,
            family,
        });
        Ok(())
    }

    /// Pad the tail, write the index over the reserved region and return the
    /// writer together with the final container size.
    pub fn finish(mut self) -> Result<(W, u64), FormatError> {
        let end = self.out.pad_to(self.geometry.alignment())?;
        let table = self.format.encode_table(&self.geometry, &self.entries, end)?;
        debug_assert!(table.len() as u64 <= self.reserved);

        let mut inner = self.out.into_inner()?;
        inner.seek(SeekFrom::Start(0))?;
        inner.write_all(&table)?;
        inner.seek(SeekFrom::Start(end))?;
        inner.flush()?;
        debug!(
            variant = %self.format.variant(),
            blocks  = self.entries.len(),
            size    = end,
            "container index written"
        );
        Ok((inner, end))
    }
}
