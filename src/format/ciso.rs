//! CISO-style containers: CSO v1, CSO v2 and ZSO.
//!
//! ```text
//! offset  size  field
//!      0     4  magic           "CISO" or "ZISO"
//!      4     4  header_size     always 24
//!      8     8  raw_size        uncompressed image size
//!     16     4  block_size
//!     20     1  version         1 (CSO v1, ZSO) or 2 (CSO v2)
//!     21     1  shift           payload alignment, 1 << shift bytes
//!     22     2  reserved
//!     24  4(N+1) index          (offset >> shift) | flag << 31
//! ```
//! The last index entry marks the end of block N-1.  Bit 31 means "stored
//! raw" for CSO v1 and ZSO and "LZ4 payload" for CSO v2, where raw blocks are
//! instead recognised by a stored span of at least one block.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::codec::Family;
use super::{
    check_block_size, read_table, ContainerFormat, ContainerIndex, FormatError, FormatVariant,
    Geometry, IndexEntry,
};

pub const CISO_MAGIC: &[u8; 4] = b"CISO";
pub const ZISO_MAGIC: &[u8; 4] = b"ZISO";
pub const CISO_HEADER_SIZE: usize = 24;

const FLAG_BIT: u32 = 0x8000_0000;
const OFFSET_MASK: u32 = 0x7FFF_FFFF;

pub struct CisoFormat {
    variant: FormatVariant,
}

impl CisoFormat {
    pub const fn new(variant: FormatVariant) -> Self {
        Self { variant }
    }

    fn magic(&self) -> &'static [u8; 4] {
        match self.variant {
            FormatVariant::Zso => ZISO_MAGIC,
            _                  => CISO_MAGIC,
        }
    }

    fn version(&self) -> u8 {
        match self.variant {
            FormatVariant::Cso2 => 2,
            _                   => 1,
        }
    }

    /// Family marked by bit 31.
    fn flagged_family(&self) -> Family {
        match self.variant {
            FormatVariant::Cso2 => Family::Lz4,
            _                   => Family::Raw,
        }
    }

    fn entry_family(&self, word: u32, span: u64, block_size: u32) -> Family {
        let flagged = word & FLAG_BIT != 0;
        match self.variant {
            FormatVariant::Zso => if flagged { Family::Raw } else { Family::Lz4 },
            FormatVariant::Cso2 => {
                if span >= block_size as u64 {
                    Family::Raw
                } else if flagged {
                    Family::Lz4
                } else {
                    Family::Deflate
                }
            }
            _ => if flagged { Family::Raw } else { Family::Deflate },
        }
    }

    fn encode_offset(&self, offset: u64, geometry: &Geometry) -> Result<u32, FormatError> {
        let overflow = || FormatError::OffsetOverflow { variant: self.variant, offset };
        if offset % geometry.alignment() != 0 {
            return Err(overflow());
        }
        let word = offset >> geometry.shift;
        if word > OFFSET_MASK as u64 {
            return Err(overflow());
        }
        Ok(word as u32)
    }
}

impl ContainerFormat for CisoFormat {
    fn variant(&self) -> FormatVariant {
        self.variant
    }

    fn entry_width(&self) -> usize {
        4
    }

    fn supports(&self, family: Family) -> bool {
        match (self.variant, family) {
            (_, Family::Raw)                     => true,
            (FormatVariant::Cso1, Family::Deflate) => true,
            (FormatVariant::Cso2, _)             => true,
            (FormatVariant::Zso, Family::Lz4)    => true,
            _                                    => false,
        }
    }

    fn alignment_shift(&self, raw_size: u64, block_size: u32) -> Option<u8> {
        let max_shift = block_size.trailing_zeros() as u8;
        (0..=max_shift).find(|&shift| {
            let g = Geometry::new(raw_size, block_size, shift);
            let worst = self.table_len(&g) + g.alignment() + g.block_count() * block_size as u64;
            worst >> shift <= OFFSET_MASK as u64
        })
    }

    fn table_len(&self, geometry: &Geometry) -> u64 {
        CISO_HEADER_SIZE as u64 + (geometry.block_count() + 1) * self.entry_width() as u64
    }

    fn accepts(&self, family: Family, len: usize, geometry: &Geometry) -> bool {
        if !self.supports(family) {
            return false;
        }
        match self.variant {
            // The padded span must stay below one block or it would read back as raw.
            FormatVariant::Cso2 => geometry.align_up(len as u64) < geometry.block_size as u64,
            _                   => len < geometry.block_size as usize,
        }
    }

    fn encode_table(
        &self,
        geometry: &Geometry,
        entries:  &[IndexEntry],
        end:      u64,
    ) -> Result<Vec<u8>, FormatError> {
        let expected = geometry.block_count();
        if entries.len() as u64 != expected {
            return Err(FormatError::EntryCount { expected, actual: entries.len() as u64 });
        }

        let mut buf = Vec::with_capacity(self.table_len(geometry) as usize);
        buf.extend_from_slice(self.magic());
        buf.write_u32::<LittleEndian>(CISO_HEADER_SIZE as u32)?;
        buf.write_u64::<LittleEndian>(geometry.raw_size)?;
        buf.write_u32::<LittleEndian>(geometry.block_size)?;
        buf.write_u8(self.version())?;
        buf.write_u8(geometry.shift)?;
        buf.write_u16::<LittleEndian>(0)?;

        for entry in entries {
            if !self.supports(entry.family) {
                return Err(FormatError::IllegalFamily { variant: self.variant, family: entry.family });
            }
            let mut word = self.encode_offset(entry.offset, geometry)?;
            if entry.family == self.flagged_family() {
                word |= FLAG_BIT;
            }
            buf.write_u32::<LittleEndian>(word)?;
        }
        buf.write_u32::<LittleEndian>(self.encode_offset(end, geometry)?)?;
        Ok(buf)
    }

    fn read_index(&self, reader: &mut dyn Read, file_len: u64) -> Result<ContainerIndex, FormatError> {
        let head = read_table(reader, CISO_HEADER_SIZE as u64, "header")?;
        let mut cur = Cursor::new(&head);

        let mut magic = [0u8; 4];
        cur.read_exact(&mut magic)?;
        if &magic != self.magic() {
            return Err(FormatError::Unrecognized(format!("bad {} tag", self.variant)));
        }
        let _header_size = cur.read_u32::<LittleEndian>()?;
        let raw_size     = cur.read_u64::<LittleEndian>()?;
        let block_size   = cur.read_u32::<LittleEndian>()?;
        let version      = cur.read_u8()?;
        let shift        = cur.read_u8()?;

        // Some older CSO v1 writers leave the version at 0.
        let version_ok = match self.variant {
            FormatVariant::Cso1 => version <= 1,
            _                   => version == self.version(),
        };
        if !version_ok {
            return Err(FormatError::Unrecognized(format!(
                "unsupported {} version {version}",
                self.variant
            )));
        }
        check_block_size(block_size)?;
        if shift > 31 {
            return Err(FormatError::Unrecognized(format!("invalid alignment shift {shift}")));
        }

        let geometry = Geometry::new(raw_size, block_size, shift);
        let count = geometry.block_count();
        let table_len = self.table_len(&geometry);
        if table_len > file_len {
            let room = (file_len.saturating_sub(CISO_HEADER_SIZE as u64) / 4).saturating_sub(1);
            return Err(FormatError::Truncated(format!(
                "header declares {count} blocks but the file holds an index for at most {room}"
            )));
        }

        let table = read_table(reader, table_len - CISO_HEADER_SIZE as u64, "index table")?;
        let words: Vec<u32> = table
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let mut entries = Vec::with_capacity(count as usize);
        for (index, pair) in words.windows(2).enumerate() {
            let offset = ((pair[0] & OFFSET_MASK) as u64) << shift;
            let next   = ((pair[1] & OFFSET_MASK) as u64) << shift;
            let out_of_range = FormatError::EntryOutOfRange {
                index: index as u64,
                offset,
                len: next.saturating_sub(offset),
                file_len,
            };
            if offset < table_len || next < offset || next > file_len {
                return Err(out_of_range);
            }
            let span = next - offset;
            let stored_len = u32::try_from(span).map_err(|_| out_of_range)?;
            entries.push(IndexEntry {
                offset,
                stored_len,
                family: self.entry_family(pair[0], span, block_size),
            });
        }

        let end = words.last().map_or(0, |w| ((w & OFFSET_MASK) as u64) << shift);
        if end != file_len {
            return Err(FormatError::Unrecognized(format!(
                "index ends at {end} but the file is {file_len} bytes"
            )));
        }

        Ok(ContainerIndex { variant: self.variant, geometry, entries })
    }
}
