//! DAX containers.
//!
//! ```text
//! offset  size  field
//!      0     4  magic        "DAX\0"
//!      4     4  raw_size     uncompressed image size (32-bit)
//!      8     4  version      1
//!     12     4  nc_areas     number of non-compressed runs
//!     16    16  reserved
//!     32   4N   frame offsets
//!      …   2N   frame lengths
//!      …   8M   non-compressed runs {u32 first_frame, u32 frame_count}
//! ```
//! Frames are 8 KiB.  Compressed frames are complete zlib streams; frames
//! inside a non-compressed run are stored verbatim.  Writers reserve room for
//! the largest possible run table, so a zero gap may follow the runs.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::codec::{Family, Framing};
use super::{read_table, ContainerFormat, ContainerIndex, FormatError, FormatVariant, Geometry, IndexEntry};

pub const DAX_MAGIC: &[u8; 4] = b"DAX\0";
pub const DAX_HEADER_SIZE: usize = 32;
pub const DAX_BLOCK_SIZE: u32 = 0x2000;
const DAX_VERSION: u32 = 1;
const NC_AREA_SIZE: u64 = 8;

pub struct DaxFormat;

impl DaxFormat {
    /// Worst case: raw and compressed frames alternate.
    fn max_nc_areas(count: u64) -> u64 {
        count.div_ceil(2)
    }

    fn index_len(count: u64, nc_areas: u64) -> u64 {
        DAX_HEADER_SIZE as u64 + count * 6 + nc_areas * NC_AREA_SIZE
    }
}

/// Collapse consecutive raw frames into `(first_frame, frame_count)` runs.
fn raw_runs(entries: &[IndexEntry]) -> Vec<(u32, u32)> {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for (i, e) in entries.iter().enumerate() {
        if e.family != Family::Raw {
            continue;
        }
        match runs.last_mut() {
            Some((first, count)) if (*first + *count) as usize == i => *count += 1,
            _ => runs.push((i as u32, 1)),
        }
    }
    runs
}

impl ContainerFormat for DaxFormat {
    fn variant(&self) -> FormatVariant {
        FormatVariant::Dax
    }

    fn entry_width(&self) -> usize {
        6
    }

    fn fixed_block_size(&self) -> Option<u32> {
        Some(DAX_BLOCK_SIZE)
    }

    fn supports(&self, family: Family) -> bool {
        matches!(family, Family::Raw | Family::Deflate)
    }

    fn framing(&self) -> Framing {
        Framing::Zlib
    }

    fn alignment_shift(&self, raw_size: u64, block_size: u32) -> Option<u8> {
        if block_size != DAX_BLOCK_SIZE || raw_size > u32::MAX as u64 {
            return None;
        }
        let g = Geometry::new(raw_size, block_size, 0);
        let worst = self.table_len(&g) + g.block_count() * block_size as u64;
        (worst <= u32::MAX as u64).then_some(0)
    }

    fn table_len(&self, geometry: &Geometry) -> u64 {
        let count = geometry.block_count();
        Self::index_len(count, Self::max_nc_areas(count))
    }

    fn accepts(&self, family: Family, len: usize, geometry: &Geometry) -> bool {
        self.supports(family) && len < geometry.block_size as usize && len <= u16::MAX as usize
    }

    fn encode_table(
        &self,
        geometry: &Geometry,
        entries:  &[IndexEntry],
        _end:     u64,
    ) -> Result<Vec<u8>, FormatError> {
        let count = geometry.block_count();
        if entries.len() as u64 != count {
            return Err(FormatError::EntryCount { expected: count, actual: entries.len() as u64 });
        }
        let raw_size = u32::try_from(geometry.raw_size).map_err(|_| FormatError::OffsetOverflow {
            variant: FormatVariant::Dax,
            offset:  geometry.raw_size,
        })?;
        let runs = raw_runs(entries);

        let mut buf = Vec::with_capacity(Self::index_len(count, runs.len() as u64) as usize);
        buf.extend_from_slice(DAX_MAGIC);
        buf.write_u32::<LittleEndian>(raw_size)?;
        buf.write_u32::<LittleEndian>(DAX_VERSION)?;
        buf.write_u32::<LittleEndian>(runs.len() as u32)?;
        buf.extend_from_slice(&[0u8; 16]);

        for e in entries {
            if !self.supports(e.family) {
                return Err(FormatError::IllegalFamily { variant: FormatVariant::Dax, family: e.family });
            }
            let offset = u32::try_from(e.offset).map_err(|_| FormatError::OffsetOverflow {
                variant: FormatVariant::Dax,
                offset:  e.offset,
            })?;
            buf.write_u32::<LittleEndian>(offset)?;
        }
        for e in entries {
            let len = u16::try_from(e.stored_len).map_err(|_| FormatError::OffsetOverflow {
                variant: FormatVariant::Dax,
                offset:  e.offset + e.stored_len as u64,
            })?;
            buf.write_u16::<LittleEndian>(len)?;
        }
        for (first, frames) in runs {
            buf.write_u32::<LittleEndian>(first)?;
            buf.write_u32::<LittleEndian>(frames)?;
        }
        Ok(buf)
    }

    fn read_index(&self, reader: &mut dyn Read, file_len: u64) -> Result<ContainerIndex, FormatError> {
        let head = read_table(reader, DAX_HEADER_SIZE as u64, "header")?;
        let mut cur = Cursor::new(&head);

        let mut magic = [0u8; 4];
        cur.read_exact(&mut magic)?;
        if &magic != DAX_MAGIC {
            return Err(FormatError::Unrecognized("bad dax tag".into()));
        }
        let raw_size = cur.read_u32::<LittleEndian>()? as u64;
        let version  = cur.read_u32::<LittleEndian>()?;
        let nc_areas = cur.read_u32::<LittleEndian>()? as u64;
        if version > DAX_VERSION {
            return Err(FormatError::Unrecognized(format!("unsupported dax version {version}")));
        }
        // Version 0 files have no run table.
        let nc_areas = if version == 0 { 0 } else { nc_areas };

        let geometry = Geometry::new(raw_size, DAX_BLOCK_SIZE, 0);
        let count = geometry.block_count();
        let index_len = Self::index_len(count, nc_areas);
        if index_len > file_len {
            return Err(FormatError::Truncated(format!(
                "header declares {count} frames and {nc_areas} raw runs but the file is only {file_len} bytes"
            )));
        }

        let table = read_table(reader, index_len - DAX_HEADER_SIZE as u64, "index table")?;
        let mut cur = Cursor::new(&table);
        let mut offsets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            offsets.push(cur.read_u32::<LittleEndian>()? as u64);
        }
        let mut lengths = Vec::with_capacity(count as usize);
        for _ in 0..count {
            lengths.push(cur.read_u16::<LittleEndian>()? as u32);
        }
        let mut raw = vec![false; count as usize];
        for _ in 0..nc_areas {
            let first  = cur.read_u32::<LittleEndian>()? as u64;
            let frames = cur.read_u32::<LittleEndian>()? as u64;
            if first + frames > count {
                return Err(FormatError::Unrecognized(format!(
                    "raw run {first}+{frames} exceeds {count} frames"
                )));
            }
            raw[first as usize..(first + frames) as usize].fill(true);
        }

        let mut entries = Vec::with_capacity(count as usize);
        for index in 0..count as usize {
            let (offset, len) = (offsets[index], lengths[index]);
            if offset < index_len || offset + len as u64 > file_len {
                return Err(FormatError::EntryOutOfRange {
                    index: index as u64,
                    offset,
                    len: len as u64,
                    file_len,
                });
            }
            entries.push(IndexEntry {
                offset,
                stored_len: len,
                family: if raw[index] { Family::Raw } else { Family::Deflate },
            });
        }

        let end = entries
            .iter()
            .map(|e| e.offset + e.stored_len as u64)
            .max()
            .unwrap_or_else(|| self.table_len(&geometry));
        if end != file_len {
            return Err(FormatError::Unrecognized(format!(
                "last frame ends at {end} but the file is {file_len} bytes"
            )));
        }

        Ok(ContainerIndex { variant: FormatVariant::Dax, geometry, entries })
    }
}
