//! Codec registry: trial methods, on-disk families, and the encode/decode table.
//!
//! # Identity rules
//! A [`Method`] is one compression trial the block selector may run: an
//! engine plus a quality tier.  Methods are an *in-process* notion only.
//! Containers never record the method, only its [`Family`] (raw, DEFLATE or
//! LZ4), because every tier of a family decodes with the same decoder.
//!
//! # Determinism
//! Every encoder here is deterministic for identical input and tier.  Brute
//! tiers try a fixed list of settings in a fixed order and keep the first
//! smallest result.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

mod deflate;
mod lz4;

pub use deflate::{ZlibBruteCodec, ZlibCodec, ZopfliCodec};
#[cfg(feature = "libdeflate")]
pub use deflate::LibdeflateCodec;
pub use lz4::{Lz4Codec, Lz4HcBruteCodec, Lz4HcCodec};

// ── Families ─────────────────────────────────────────────────────────────────

/// Payload encoding recorded per block in a container index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Raw,
    Deflate,
    Lz4,
}

impl Family {
    pub fn name(self) -> &'static str {
        match self {
            Family::Raw     => "raw",
            Family::Deflate => "deflate",
            Family::Lz4     => "lz4",
        }
    }
}

/// Stream framing applied to DEFLATE output.  CSO stores bare DEFLATE; DAX
/// stores complete zlib streams (header + Adler-32 trailer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    #[default]
    Raw,
    Zlib,
}

// ── Methods ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    /// flate2 at its best level.
    Zlib,
    /// flate2 at every level, smallest wins.
    ZlibBrute,
    /// Zopfli exhaustive DEFLATE.
    Zopfli,
    /// libdeflate at level 12 (feature `libdeflate`).
    Deflate7z,
    /// lz4_flex block encoder.
    Lz4,
    /// liblz4 high-compression mode.
    Lz4Hc,
    /// liblz4 HC at every level from 4 to 12, smallest wins.
    Lz4HcBrute,
}

impl Method {
    pub const ALL: [Method; 7] = [
        Method::Zlib,
        Method::ZlibBrute,
        Method::Zopfli,
        Method::Deflate7z,
        Method::Lz4,
        Method::Lz4Hc,
        Method::Lz4HcBrute,
    ];

    const fn bit(self) -> u16 {
        1 << self as u16
    }

    pub fn family(self) -> Family {
        match self {
            Method::Zlib | Method::ZlibBrute | Method::Zopfli | Method::Deflate7z => Family::Deflate,
            Method::Lz4 | Method::Lz4Hc | Method::Lz4HcBrute                     => Family::Lz4,
        }
    }

    /// Human-readable name, also accepted by [`Method::from_name`].
    pub fn name(self) -> &'static str {
        match self {
            Method::Zlib       => "zlib",
            Method::ZlibBrute  => "zlib-brute",
            Method::Zopfli     => "zopfli",
            Method::Deflate7z  => "7zdeflate",
            Method::Lz4        => "lz4",
            Method::Lz4Hc      => "lz4hc",
            Method::Lz4HcBrute => "lz4hc-brute",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Method::ALL.into_iter().find(|m| m.name() == s.to_lowercase())
    }

    /// False when the engine was excluded at compile time.
    pub fn is_available(self) -> bool {
        match self {
            Method::Deflate7z => cfg!(feature = "libdeflate"),
            _                 => true,
        }
    }

    /// Relative decode cost used to break exact size ties.  LZ4 decodes
    /// faster than DEFLATE; within a family the cheaper tiers come first and
    /// the exhaustive tiers last.
    pub fn decode_rank(self) -> u8 {
        match self {
            Method::Lz4        => 1,
            Method::Lz4Hc      => 2,
            Method::Lz4HcBrute => 3,
            Method::Zlib       => 4,
            Method::Zopfli     => 5,
            Method::Deflate7z  => 6,
            Method::ZlibBrute  => 7,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Representation chosen for one block: stored verbatim or produced by a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockMethod {
    Raw,
    Coded(Method),
}

impl BlockMethod {
    pub fn family(self) -> Family {
        match self {
            BlockMethod::Raw      => Family::Raw,
            BlockMethod::Coded(m) => m.family(),
        }
    }

    pub fn decode_rank(self) -> u8 {
        match self {
            BlockMethod::Raw      => 0,
            BlockMethod::Coded(m) => m.decode_rank(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BlockMethod::Raw      => "raw",
            BlockMethod::Coded(m) => m.name(),
        }
    }
}

// ── Method sets ──────────────────────────────────────────────────────────────

/// Compact set of [`Method`]s.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MethodSet(u16);

impl MethodSet {
    pub const EMPTY: MethodSet = MethodSet(0);
    pub const ALL: MethodSet = MethodSet(
        Method::Zlib.bit()
            | Method::ZlibBrute.bit()
            | Method::Zopfli.bit()
            | Method::Deflate7z.bit()
            | Method::Lz4.bit()
            | Method::Lz4Hc.bit()
            | Method::Lz4HcBrute.bit(),
    );
    pub const DEFLATE: MethodSet = MethodSet(
        Method::Zlib.bit() | Method::ZlibBrute.bit() | Method::Zopfli.bit() | Method::Deflate7z.bit(),
    );
    pub const LZ4: MethodSet = MethodSet(
        Method::Lz4.bit() | Method::Lz4Hc.bit() | Method::Lz4HcBrute.bit(),
    );

    pub const fn single(method: Method) -> Self {
        MethodSet(method.bit())
    }

    pub fn contains(self, method: Method) -> bool {
        self.0 & method.bit() != 0
    }

    pub fn insert(&mut self, method: Method) {
        self.0 |= method.bit();
    }

    pub fn remove(&mut self, method: Method) {
        self.0 &= !method.bit();
    }

    pub fn union(self, other: MethodSet) -> Self {
        MethodSet(self.0 | other.0)
    }

    pub fn difference(self, other: MethodSet) -> Self {
        MethodSet(self.0 & !other.0)
    }

    pub fn intersection(self, other: MethodSet) -> Self {
        MethodSet(self.0 & other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Members in [`Method::ALL`] order.
    pub fn iter(self) -> impl Iterator<Item = Method> {
        Method::ALL.into_iter().filter(move |m| self.contains(*m))
    }

    /// Members whose engine is compiled into this build.
    pub fn available() -> Self {
        Method::ALL.into_iter().filter(|m| m.is_available()).collect()
    }
}

impl FromIterator<Method> for MethodSet {
    fn from_iter<I: IntoIterator<Item = Method>>(iter: I) -> Self {
        let mut set = MethodSet::EMPTY;
        for m in iter {
            set.insert(m);
        }
        set
    }
}

impl fmt::Debug for MethodSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(Method::name)).finish()
    }
}

// ── Error types ──────────────────────────────────────────────────────────────

/// An encoder failed outright (as opposed to merely not shrinking the block).
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("{method} compression failed: {reason}")]
    Compression { method: Method, reason: String },
    #[error("{method} encoder panicked")]
    Panicked { method: Method },
    #[error("{0} is not available in this build")]
    Unavailable(Method),
}

/// A stored payload could not be turned back into exactly one block.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("corrupt {} payload: {reason}", family.name())]
    Corrupt { family: Family, reason: String },
    #[error("decoded {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn method(&self) -> Method;
    fn compress(&self, data: &[u8], framing: Framing) -> Result<Vec<u8>, CodecError>;
}

// ── Factory ──────────────────────────────────────────────────────────────────

static ZLIB:         ZlibCodec       = ZlibCodec;
static ZLIB_BRUTE:   ZlibBruteCodec  = ZlibBruteCodec;
static ZOPFLI:       ZopfliCodec     = ZopfliCodec;
#[cfg(feature = "libdeflate")]
static LIBDEFLATE:   LibdeflateCodec = LibdeflateCodec;
static LZ4:          Lz4Codec        = Lz4Codec;
static LZ4_HC:       Lz4HcCodec      = Lz4HcCodec;
static LZ4_HC_BRUTE: Lz4HcBruteCodec = Lz4HcBruteCodec;

/// Resolve a method to its built-in encoder.
pub fn get_codec(method: Method) -> Result<&'static dyn Codec, CodecError> {
    match method {
        Method::Zlib       => Ok(&ZLIB),
        Method::ZlibBrute  => Ok(&ZLIB_BRUTE),
        Method::Zopfli     => Ok(&ZOPFLI),
        #[cfg(feature = "libdeflate")]
        Method::Deflate7z  => Ok(&LIBDEFLATE),
        #[cfg(not(feature = "libdeflate"))]
        Method::Deflate7z  => Err(CodecError::Unavailable(method)),
        Method::Lz4        => Ok(&LZ4),
        Method::Lz4Hc      => Ok(&LZ4_HC),
        Method::Lz4HcBrute => Ok(&LZ4_HC_BRUTE),
    }
}

/// Run one trial.  `Ok(None)` means the output was not smaller than `data`.
///
/// A panicking encoder is reported as [`CodecError::Panicked`] so that one
/// misbehaving engine only loses its own trial.
pub fn encode(method: Method, data: &[u8], framing: Framing) -> Result<Option<Vec<u8>>, CodecError> {
    let codec = get_codec(method)?;
    let out = panic::catch_unwind(AssertUnwindSafe(|| codec.compress(data, framing)))
        .map_err(|_| CodecError::Panicked { method })??;
    if out.len() >= data.len() {
        return Ok(None);
    }
    Ok(Some(out))
}

/// Decode one stored payload back into exactly `expected` bytes.
///
/// Compressed payloads may carry trailing alignment padding; a raw payload
/// must be exactly `expected` bytes.
pub fn decode(
    family:   Family,
    payload:  &[u8],
    framing:  Framing,
    expected: usize,
) -> Result<Vec<u8>, DecodeError> {
    let out = match family {
        Family::Raw     => payload.to_vec(),
        Family::Deflate => deflate::inflate(payload, framing, expected)?,
        Family::Lz4     => lz4::decompress(payload, expected)?,
    };
    if out.len() != expected {
        return Err(DecodeError::LengthMismatch { expected, actual: out.len() });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Vec<u8> {
        let mut data = Vec::with_capacity(2048);
        for i in 0..2048u32 {
            data.push(((i * 7) % 61) as u8);
        }
        data
    }

    #[test]
    fn method_names_roundtrip() {
        for m in Method::ALL {
            assert_eq!(Method::from_name(m.name()), Some(m));
        }
        assert_eq!(Method::from_name("LZ4HC"), Some(Method::Lz4Hc));
        assert_eq!(Method::from_name("bzip2"), None);
    }

    #[test]
    fn method_set_operations() {
        let mut set = MethodSet::DEFLATE;
        assert_eq!(set.len(), 4);
        assert!(set.contains(Method::Zopfli));
        assert!(!set.contains(Method::Lz4));

        set.remove(Method::Zopfli);
        set.insert(Method::Lz4);
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![Method::Zlib, Method::ZlibBrute, Method::Deflate7z, Method::Lz4]
        );
        assert_eq!(MethodSet::DEFLATE.union(MethodSet::LZ4), MethodSet::ALL);
        assert!(MethodSet::ALL.difference(MethodSet::ALL).is_empty());
    }

    #[test]
    fn every_available_method_roundtrips() {
        let data = sample_block();
        for method in MethodSet::available().iter() {
            for framing in [Framing::Raw, Framing::Zlib] {
                let packed = encode(method, &data, framing)
                    .unwrap()
                    .unwrap_or_else(|| panic!("{method} did not shrink a repetitive block"));
                let unpacked = decode(method.family(), &packed, framing, data.len()).unwrap();
                assert_eq!(unpacked, data, "{method} with {framing:?}");
            }
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        let data = sample_block();
        for method in MethodSet::available().iter() {
            let a = encode(method, &data, Framing::Raw).unwrap();
            let b = encode(method, &data, Framing::Raw).unwrap();
            assert_eq!(a, b, "{method} is not deterministic");
        }
    }

    #[test]
    fn incompressible_block_is_not_smaller() {
        // xorshift noise does not compress.
        let mut state = 0x9E37_79B9u32;
        let data: Vec<u8> = (0..2048)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();
        assert!(encode(Method::Zlib, &data, Framing::Raw).unwrap().is_none());
        assert!(encode(Method::Lz4, &data, Framing::Raw).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let data = sample_block();
        let packed = encode(Method::Zlib, &data, Framing::Raw).unwrap().unwrap();
        let err = decode(Family::Deflate, &packed, Framing::Raw, data.len() + 1).unwrap_err();
        assert!(matches!(err, DecodeError::LengthMismatch { .. }));

        let err = decode(Family::Raw, &data[..100], Framing::Raw, data.len()).unwrap_err();
        assert!(matches!(err, DecodeError::LengthMismatch { expected: 2048, actual: 100 }));

        let mut long = data.clone();
        long.extend_from_slice(&[0xAA; 16]);
        let err = decode(Family::Raw, &long, Framing::Raw, data.len()).unwrap_err();
        assert!(matches!(err, DecodeError::LengthMismatch { expected: 2048, actual: 2064 }));
    }

    #[test]
    fn lz4_payload_tolerates_alignment_padding() {
        let data = sample_block();
        let mut packed = encode(Method::Lz4Hc, &data, Framing::Raw).unwrap().unwrap();
        packed.extend_from_slice(&[0u8; 13]);
        assert_eq!(decode(Family::Lz4, &packed, Framing::Raw, data.len()).unwrap(), data);
    }

    #[test]
    fn tie_ranks_prefer_cheaper_decode() {
        assert!(BlockMethod::Raw.decode_rank() < BlockMethod::Coded(Method::Lz4).decode_rank());
        assert!(Method::Lz4HcBrute.decode_rank() < Method::Zlib.decode_rank());
        assert!(Method::Zlib.decode_rank() < Method::Zopfli.decode_rank());
        assert!(Method::Deflate7z.decode_rank() < Method::ZlibBrute.decode_rank());
    }
}
