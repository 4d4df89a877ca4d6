//! Container format descriptors.
//!
//! Every supported container variant is described by one [`ContainerFormat`]
//! implementation.  A descriptor owns everything that differs between the
//! variants: header layout, index entry encoding, alignment policy, DEFLATE
//! framing and which payload families may be stored.  Pipeline code only ever
//! talks to the trait, so adding a variant never touches block selection or
//! scheduling.
//!
//! # Layout shared by all variants
//! ```text
//! [HEADER] [INDEX TABLE] [zero gap, DAX only] [BLOCK 0] [BLOCK 1] ... [BLOCK N-1]
//! ```
//! The header and index table occupy a region of [`ContainerFormat::table_len`]
//! bytes at offset 0.  Writers reserve that region up front and fill it once
//! the last block has been written.
//!
//! # Endianness
//! All header and index fields are little-endian.

use std::io::{self, Read, Seek, SeekFrom};
use thiserror::Error;

use crate::codec::{DecodeError, Family, Framing};

mod ciso;
mod dax;

pub use ciso::{CisoFormat, CISO_HEADER_SIZE, CISO_MAGIC, ZISO_MAGIC};
pub use dax::{DaxFormat, DAX_BLOCK_SIZE, DAX_HEADER_SIZE, DAX_MAGIC};

// ── Variants ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FormatVariant {
    #[default]
    Cso1,
    Cso2,
    Zso,
    Dax,
}

static CSO1: CisoFormat = CisoFormat::new(FormatVariant::Cso1);
static CSO2: CisoFormat = CisoFormat::new(FormatVariant::Cso2);
static ZSO:  CisoFormat = CisoFormat::new(FormatVariant::Zso);
static DAX:  DaxFormat  = DaxFormat;

impl FormatVariant {
    pub const ALL: [FormatVariant; 4] = [
        FormatVariant::Cso1,
        FormatVariant::Cso2,
        FormatVariant::Zso,
        FormatVariant::Dax,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FormatVariant::Cso1 => "cso1",
            FormatVariant::Cso2 => "cso2",
            FormatVariant::Zso  => "zso",
            FormatVariant::Dax  => "dax",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        FormatVariant::ALL.into_iter().find(|v| v.name() == s.to_lowercase())
    }

    /// Conventional file extension, including the dot.
    pub fn extension(self) -> &'static str {
        match self {
            FormatVariant::Cso1 | FormatVariant::Cso2 => ".cso",
            FormatVariant::Zso                        => ".zso",
            FormatVariant::Dax                        => ".dax",
        }
    }

    pub fn descriptor(self) -> &'static dyn ContainerFormat {
        match self {
            FormatVariant::Cso1 => &CSO1,
            FormatVariant::Cso2 => &CSO2,
            FormatVariant::Zso  => &ZSO,
            FormatVariant::Dax  => &DAX,
        }
    }

    /// Identify a container from its leading bytes.  Returns `None` for
    /// anything that is not a known container tag (e.g. a raw image).
    pub fn detect(head: &[u8]) -> Option<Self> {
        match head.get(..4)? {
            m if m == CISO_MAGIC => match head.get(20) {
                Some(2) => Some(FormatVariant::Cso2),
                _       => Some(FormatVariant::Cso1),
            },
            m if m == ZISO_MAGIC => Some(FormatVariant::Zso),
            m if m == DAX_MAGIC  => Some(FormatVariant::Dax),
            _                    => None,
        }
    }
}

impl std::fmt::Display for FormatVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Geometry and index entries ───────────────────────────────────────────────

/// Block layout of an image: raw size, block size and payload alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub raw_size:   u64,
    pub block_size: u32,
    /// Payloads start at multiples of `1 << shift` bytes.
    pub shift:      u8,
}

impl Geometry {
    pub fn new(raw_size: u64, block_size: u32, shift: u8) -> Self {
        Self { raw_size, block_size, shift }
    }

    pub fn block_count(&self) -> u64 {
        self.raw_size.div_ceil(self.block_size as u64)
    }

    /// Number of real image bytes in block `index`; only the last block can
    /// be short.
    pub fn payload_len(&self, index: u64) -> usize {
        let start = index * self.block_size as u64;
        self.raw_size.saturating_sub(start).min(self.block_size as u64) as usize
    }

    pub fn alignment(&self) -> u64 {
        1u64 << self.shift
    }

    pub fn align_up(&self, offset: u64) -> u64 {
        let mask = self.alignment() - 1;
        (offset + mask) & !mask
    }
}

/// Where one block lives in a container and how it was encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset:     u64,
    /// Stored span in bytes.  May include alignment padding on read.
    pub stored_len: u32,
    pub family:     Family,
}

/// Header plus decoded index of an existing container.
#[derive(Debug, Clone)]
pub struct ContainerIndex {
    pub variant:  FormatVariant,
    pub geometry: Geometry,
    pub entries:  Vec<IndexEntry>,
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("unrecognized container: {0}")]
    Unrecognized(String),
    #[error("truncated container: {0}")]
    Truncated(String),
    #[error("block {index} stored at {offset}+{len} lies outside the container ({file_len} bytes)")]
    EntryOutOfRange { index: u64, offset: u64, len: u64, file_len: u64 },
    #[error("offset {offset} cannot be encoded in a {variant} index")]
    OffsetOverflow { variant: FormatVariant, offset: u64 },
    #[error("{variant} cannot store {} payloads", family.name())]
    IllegalFamily { variant: FormatVariant, family: Family },
    #[error("expected {expected} index entries, got {actual}")]
    EntryCount { expected: u64, actual: u64 },
    #[error("block {index}: {source}")]
    Block { index: u64, #[source] source: DecodeError },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Descriptor trait ─────────────────────────────────────────────────────────

pub trait ContainerFormat: Send + Sync {
    fn variant(&self) -> FormatVariant;

    /// Byte width of one index entry.
    fn entry_width(&self) -> usize;

    /// Block size mandated by the variant, if any.
    fn fixed_block_size(&self) -> Option<u32> {
        None
    }

    /// Whether payloads of `family` may be stored at all.
    fn supports(&self, family: Family) -> bool;

    /// Framing the DEFLATE encoders must produce for this variant.
    fn framing(&self) -> Framing {
        Framing::Raw
    }

    /// Alignment shift for a new container, or `None` when the image cannot
    /// be represented with this block size.
    fn alignment_shift(&self, raw_size: u64, block_size: u32) -> Option<u8>;

    /// Bytes reserved at offset 0 for header and index table.
    fn table_len(&self, geometry: &Geometry) -> u64;

    /// Whether a compressed payload of `len` bytes may be stored for one block.
    fn accepts(&self, family: Family, len: usize, geometry: &Geometry) -> bool {
        self.supports(family) && len < geometry.block_size as usize
    }

    /// Serialize header and index.  `end` is the aligned end of the last
    /// payload.  The result is at most `table_len` bytes long.
    fn encode_table(
        &self,
        geometry: &Geometry,
        entries:  &[IndexEntry],
        end:      u64,
    ) -> Result<Vec<u8>, FormatError>;

    /// Parse header and index from `reader`, positioned at offset 0.
    /// `file_len` bounds every declared size and offset.
    fn read_index(&self, reader: &mut dyn Read, file_len: u64) -> Result<ContainerIndex, FormatError>;
}

/// Detect the variant of an open container and read its index.
pub fn open_index<R: Read + Seek>(reader: &mut R) -> Result<ContainerIndex, FormatError> {
    let file_len = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(0))?;
    let mut head = [0u8; CISO_HEADER_SIZE];
    let n = read_up_to(reader, &mut head)?;
    let variant = FormatVariant::detect(&head[..n]).ok_or_else(|| {
        FormatError::Unrecognized(format!("unknown tag {:02x?}", &head[..n.min(4)]))
    })?;
    reader.seek(SeekFrom::Start(0))?;
    variant.descriptor().read_index(reader, file_len)
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// `read_exact` that reports a short file as [`FormatError::Truncated`].
pub(crate) fn read_table(reader: &mut dyn Read, len: u64, what: &str) -> Result<Vec<u8>, FormatError> {
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => FormatError::Truncated(format!("file ends inside the {what}")),
        _ => FormatError::Io(e),
    })?;
    Ok(buf)
}

pub(crate) fn check_block_size(block_size: u32) -> Result<(), FormatError> {
    if block_size.is_power_of_two() && block_size >= 512 {
        Ok(())
    } else {
        Err(FormatError::Unrecognized(format!("invalid block size {block_size}")))
    }
}
