//! Image sources.
//!
//! An input is either a raw image or a container; both are read as a
//! sequence of blocks.  Reading a block only fetches bytes, decoding happens
//! in [`BlockDecoder`] so that it can run on a worker thread.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

use crate::codec::{self, DecodeError, Family, Framing};
use crate::format::{open_index, ContainerIndex, FormatError, FormatVariant, Geometry, CISO_HEADER_SIZE};

/// Bytes fetched for one block, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceBlock {
    /// Image bytes, already the block's true payload.
    Plain(Vec<u8>),
    /// A stored container payload.
    Stored { family: Family, payload: Vec<u8> },
}

/// Turns [`SourceBlock`]s of one source into image bytes.
#[derive(Debug, Clone, Copy)]
pub struct BlockDecoder {
    geometry: Geometry,
    framing:  Framing,
}

impl BlockDecoder {
    pub fn new(geometry: Geometry, framing: Framing) -> Self {
        Self { geometry, framing }
    }

    /// Decode block `index`, truncated to its true length.
    ///
    /// A raw span must cover the block's image bytes and may not run past
    /// one block; the last block may be stored with or without its padding.
    pub fn decode(&self, index: u64, block: SourceBlock) -> Result<Vec<u8>, FormatError> {
        let len = self.geometry.payload_len(index);
        let block_size = self.geometry.block_size as usize;
        let mut raw = match block {
            SourceBlock::Plain(data) => data,
            SourceBlock::Stored { family: Family::Raw, payload } => {
                if !(len..=block_size).contains(&payload.len()) {
                    let source = DecodeError::LengthMismatch { expected: len, actual: payload.len() };
                    return Err(FormatError::Block { index, source });
                }
                payload
            }
            SourceBlock::Stored { family, payload } => {
                codec::decode(family, &payload, self.framing, block_size)
                    .map_err(|source| FormatError::Block { index, source })?
            }
        };
        raw.truncate(len);
        Ok(raw)
    }
}

pub trait ImageSource: Send {
    /// `None` for a raw image.
    fn variant(&self) -> Option<FormatVariant>;
    fn geometry(&self) -> Geometry;
    fn decoder(&self) -> BlockDecoder;
    fn read_block(&mut self, index: u64) -> Result<SourceBlock, FormatError>;
}

// ── Raw images ───────────────────────────────────────────────────────────────

pub struct RawImage<R: Read + Seek + Send> {
    reader:   R,
    geometry: Geometry,
    position: u64,
}

impl<R: Read + Seek + Send> RawImage<R> {
    /// `block_size` only sets the read granularity.
    pub fn new(reader: R, raw_size: u64, block_size: u32) -> Self {
        Self { reader, geometry: Geometry::new(raw_size, block_size, 0), position: 0 }
    }
}

impl<R: Read + Seek + Send> ImageSource for RawImage<R> {
    fn variant(&self) -> Option<FormatVariant> {
        None
    }

    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn decoder(&self) -> BlockDecoder {
        BlockDecoder::new(self.geometry, Framing::Raw)
    }

    fn read_block(&mut self, index: u64) -> Result<SourceBlock, FormatError> {
        let offset = index * self.geometry.block_size as u64;
        if offset != self.position {
            self.reader.seek(SeekFrom::Start(offset))?;
        }
        let mut buf = vec![0u8; self.geometry.payload_len(index)];
        self.reader.read_exact(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                FormatError::Truncated(format!("image ends inside block {index}"))
            }
            _ => FormatError::Io(e),
        })?;
        self.position = offset + buf.len() as u64;
        Ok(SourceBlock::Plain(buf))
    }
}

// ── Containers ───────────────────────────────────────────────────────────────

pub struct ContainerImage<R: Read + Seek + Send> {
    reader: R,
    index:  ContainerIndex,
}

impl<R: Read + Seek + Send> ContainerImage<R> {
    pub fn open(mut reader: R) -> Result<Self, FormatError> {
        let index = open_index(&mut reader)?;
        Ok(Self { reader, index })
    }

    pub fn index(&self) -> &ContainerIndex {
        &self.index
    }
}

impl<R: Read + Seek + Send> ImageSource for ContainerImage<R> {
    fn variant(&self) -> Option<FormatVariant> {
        Some(self.index.variant)
    }

    fn geometry(&self) -> Geometry {
        self.index.geometry
    }

    fn decoder(&self) -> BlockDecoder {
        BlockDecoder::new(self.index.geometry, self.index.variant.descriptor().framing())
    }

    fn read_block(&mut self, index: u64) -> Result<SourceBlock, FormatError> {
        let entry = self.index.entries.get(index as usize).copied().ok_or_else(|| {
            FormatError::EntryCount { expected: self.index.entries.len() as u64, actual: index + 1 }
        })?;
        self.reader.seek(SeekFrom::Start(entry.offset))?;
        let mut payload = vec![0u8; entry.stored_len as usize];
        self.reader.read_exact(&mut payload)?;
        Ok(SourceBlock::Stored { family: entry.family, payload })
    }
}

/// Open `path` as a container when it carries a known tag, otherwise as a
/// raw image read in `raw_block_size` pieces.
pub fn open_image(path: &Path, raw_block_size: u32) -> Result<Box<dyn ImageSource>, FormatError> {
    let mut file = File::open(path)?;
    let raw_size = file.metadata()?.len();

    let mut head = [0u8; CISO_HEADER_SIZE];
    let n = (&mut file).take(head.len() as u64).read(&mut head)?;
    file.seek(SeekFrom::Start(0))?;

    match FormatVariant::detect(&head[..n]) {
        Some(variant) => {
            let image = ContainerImage::open(BufReader::new(file))?;
            debug!(
                path     = %path.display(),
                %variant,
                raw_size = image.index().geometry.raw_size,
                blocks   = image.index().entries.len(),
                "opened container"
            );
            Ok(Box::new(image))
        }
        None => {
            debug!(path = %path.display(), raw_size, "opened raw image");
            Ok(Box::new(RawImage::new(BufReader::new(file), raw_size, raw_block_size)))
        }
    }
}

// ── Sequential raw stream ────────────────────────────────────────────────────

/// Image bytes of any source, in order.
pub struct RawStream {
    source:  Box<dyn ImageSource>,
    decoder: BlockDecoder,
    next:    u64,
    pending: Vec<u8>,
    pos:     usize,
}

impl RawStream {
    pub fn new(source: Box<dyn ImageSource>) -> Self {
        let decoder = source.decoder();
        Self { source, decoder, next: 0, pending: Vec::new(), pos: 0 }
    }

    pub fn raw_size(&self) -> u64 {
        self.source.geometry().raw_size
    }

    /// Fill `buf` from the stream.  Returns fewer bytes than `buf.len()`
    /// only at the end of the image.
    pub fn fill(&mut self, buf: &mut [u8]) -> Result<usize, FormatError> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.pos == self.pending.len() {
                if self.next == self.source.geometry().block_count() {
                    break;
                }
                let block = self.source.read_block(self.next)?;
                self.pending = self.decoder.decode(self.next, block)?;
                self.pos = 0;
                self.next += 1;
                continue;
            }
            let n = (self.pending.len() - self.pos).min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
            self.pos += n;
            filled += n;
        }
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ContainerFormat, IndexEntry};
    use std::io::Cursor;

    #[test]
    fn raw_image_reads_short_tail() {
        let data: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        let mut image = RawImage::new(Cursor::new(data.clone()), 5000, 2048);
        assert_eq!(image.geometry().block_count(), 3);
        let tail = image.read_block(2).unwrap();
        assert_eq!(tail, SourceBlock::Plain(data[4096..].to_vec()));
        let first = image.read_block(0).unwrap();
        assert_eq!(first, SourceBlock::Plain(data[..2048].to_vec()));
    }

    #[test]
    fn raw_image_reports_shrunken_file() {
        let mut image = RawImage::new(Cursor::new(vec![0u8; 3000]), 4096, 2048);
        assert!(matches!(image.read_block(1), Err(FormatError::Truncated(_))));
    }

    #[test]
    fn stream_regroups_blocks() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let image = RawImage::new(Cursor::new(data.clone()), 10_000, 512);
        let mut stream = RawStream::new(Box::new(image));
        let mut out = Vec::new();
        let mut buf = vec![0u8; 3000];
        loop {
            let n = stream.fill(&mut buf).unwrap();
            out.extend_from_slice(&buf[..n]);
            if n < buf.len() {
                break;
            }
        }
        assert_eq!(out, data);
    }

    #[test]
    fn decoder_truncates_last_block() {
        let decoder = BlockDecoder::new(Geometry::new(3000, 2048, 0), Framing::Raw);
        let stored = SourceBlock::Stored { family: Family::Raw, payload: vec![5u8; 2048] };
        assert_eq!(decoder.decode(1, stored).unwrap().len(), 952);
    }

    #[test]
    fn decoder_accepts_unpadded_raw_tail() {
        let decoder = BlockDecoder::new(Geometry::new(3000, 2048, 0), Framing::Raw);
        let stored = SourceBlock::Stored { family: Family::Raw, payload: vec![5u8; 952] };
        assert_eq!(decoder.decode(1, stored).unwrap(), vec![5u8; 952]);
        let short = SourceBlock::Stored { family: Family::Raw, payload: vec![5u8; 951] };
        assert!(matches!(decoder.decode(1, short), Err(FormatError::Block { index: 1, .. })));
    }

    #[test]
    fn oversized_raw_span_is_rejected() {
        let fmt = FormatVariant::Cso1.descriptor();
        let g = Geometry::new(2048, 2048, 0);
        let table_len = fmt.table_len(&g);
        let entry = IndexEntry { offset: table_len, stored_len: 4096, family: Family::Raw };
        let mut file = fmt.encode_table(&g, &[entry], table_len + 4096).unwrap();
        file.resize((table_len + 4096) as usize, 0xAA);

        let mut image = ContainerImage::open(Cursor::new(file)).unwrap();
        assert_eq!(image.index().entries[0].stored_len, 4096);
        let block = image.read_block(0).unwrap();
        let err = image.decoder().decode(0, block).unwrap_err();
        assert!(
            matches!(
                err,
                FormatError::Block {
                    index:  0,
                    source: DecodeError::LengthMismatch { expected: 2048, actual: 4096 },
                }
            ),
            "{err}"
        );
    }

    #[test]
    fn decoder_reports_block_index() {
        let decoder = BlockDecoder::new(Geometry::new(4096, 2048, 0), Framing::Raw);
        let stored = SourceBlock::Stored { family: Family::Deflate, payload: vec![0xFF; 10] };
        assert!(matches!(decoder.decode(1, stored), Err(FormatError::Block { index: 1, .. })));
    }
}
