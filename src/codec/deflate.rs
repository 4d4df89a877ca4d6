use std::io::{self, Read, Write};

use flate2::read::{DeflateDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, ZlibEncoder};
use flate2::Compression;

use super::{Codec, CodecError, DecodeError, Family, Framing, Method};

fn flate(data: &[u8], framing: Framing, level: u32) -> io::Result<Vec<u8>> {
    let out = Vec::with_capacity(data.len());
    match framing {
        Framing::Raw => {
            let mut enc = DeflateEncoder::new(out, Compression::new(level));
            enc.write_all(data)?;
            enc.finish()
        }
        Framing::Zlib => {
            let mut enc = ZlibEncoder::new(out, Compression::new(level));
            enc.write_all(data)?;
            enc.finish()
        }
    }
}

fn failed(method: Method, e: impl ToString) -> CodecError {
    CodecError::Compression { method, reason: e.to_string() }
}

pub struct ZlibCodec;
impl Codec for ZlibCodec {
    fn method(&self) -> Method { Method::Zlib }
    fn compress(&self, data: &[u8], framing: Framing) -> Result<Vec<u8>, CodecError> {
        flate(data, framing, Compression::best().level()).map_err(|e| failed(Method::Zlib, e))
    }
}

pub struct ZlibBruteCodec;
impl Codec for ZlibBruteCodec {
    fn method(&self) -> Method { Method::ZlibBrute }
    fn compress(&self, data: &[u8], framing: Framing) -> Result<Vec<u8>, CodecError> {
        let mut best: Option<Vec<u8>> = None;
        for level in 1..=9 {
            let out = flate(data, framing, level).map_err(|e| failed(Method::ZlibBrute, e))?;
            if best.as_ref().map_or(true, |b| out.len() < b.len()) {
                best = Some(out);
            }
        }
        best.ok_or_else(|| failed(Method::ZlibBrute, "no level produced output"))
    }
}

pub struct ZopfliCodec;
impl Codec for ZopfliCodec {
    fn method(&self) -> Method { Method::Zopfli }
    fn compress(&self, data: &[u8], framing: Framing) -> Result<Vec<u8>, CodecError> {
        let format = match framing {
            Framing::Raw  => zopfli::Format::Deflate,
            Framing::Zlib => zopfli::Format::Zlib,
        };
        let mut out = Vec::with_capacity(data.len());
        zopfli::compress(zopfli::Options::default(), format, data, &mut out)
            .map_err(|e| failed(Method::Zopfli, e))?;
        Ok(out)
    }
}

#[cfg(feature = "libdeflate")]
pub struct LibdeflateCodec;
#[cfg(feature = "libdeflate")]
impl Codec for LibdeflateCodec {
    fn method(&self) -> Method { Method::Deflate7z }
    fn compress(&self, data: &[u8], framing: Framing) -> Result<Vec<u8>, CodecError> {
        use libdeflater::{CompressionLvl, Compressor};

        let mut compressor = Compressor::new(CompressionLvl::best());
        let (mut out, written) = match framing {
            Framing::Raw => {
                let mut out = vec![0u8; compressor.deflate_compress_bound(data.len())];
                let n = compressor.deflate_compress(data, &mut out);
                (out, n)
            }
            Framing::Zlib => {
                let mut out = vec![0u8; compressor.zlib_compress_bound(data.len())];
                let n = compressor.zlib_compress(data, &mut out);
                (out, n)
            }
        };
        let n = written.map_err(|e| failed(Method::Deflate7z, format!("{e:?}")))?;
        out.truncate(n);
        Ok(out)
    }
}

/// Inflate at most `expected + 1` bytes so an oversized stream is caught
/// without decoding all of it.  Trailing bytes after the end of the stream
/// (alignment padding) are ignored.
pub(super) fn inflate(payload: &[u8], framing: Framing, expected: usize) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::with_capacity(expected);
    let limit = expected as u64 + 1;
    let res = match framing {
        Framing::Raw  => DeflateDecoder::new(payload).take(limit).read_to_end(&mut out),
        Framing::Zlib => ZlibDecoder::new(payload).take(limit).read_to_end(&mut out),
    };
    res.map_err(|e| DecodeError::Corrupt { family: Family::Deflate, reason: e.to_string() })?;
    Ok(out)
}
