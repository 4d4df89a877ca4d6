use lz4::block::CompressionMode;

use super::{Codec, CodecError, DecodeError, Family, Framing, Method};

/// liblz4 HC level used by the `lz4hc` tier.
const HC_LEVEL: i32 = 9;
/// Levels tried by the `lz4hc-brute` tier.
const HC_BRUTE_LEVELS: std::ops::RangeInclusive<i32> = 4..=12;

fn hc(data: &[u8], level: i32, method: Method) -> Result<Vec<u8>, CodecError> {
    lz4::block::compress(data, Some(CompressionMode::HIGHCOMPRESSION(level)), false)
        .map_err(|e| CodecError::Compression { method, reason: e.to_string() })
}

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn method(&self) -> Method { Method::Lz4 }
    fn compress(&self, data: &[u8], _: Framing) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::block::compress(data))
    }
}

pub struct Lz4HcCodec;
impl Codec for Lz4HcCodec {
    fn method(&self) -> Method { Method::Lz4Hc }
    fn compress(&self, data: &[u8], _: Framing) -> Result<Vec<u8>, CodecError> {
        hc(data, HC_LEVEL, Method::Lz4Hc)
    }
}

pub struct Lz4HcBruteCodec;
impl Codec for Lz4HcBruteCodec {
    fn method(&self) -> Method { Method::Lz4HcBrute }
    fn compress(&self, data: &[u8], _: Framing) -> Result<Vec<u8>, CodecError> {
        let mut best: Option<Vec<u8>> = None;
        for level in HC_BRUTE_LEVELS {
            let out = hc(data, level, Method::Lz4HcBrute)?;
            if best.as_ref().map_or(true, |b| out.len() < b.len()) {
                best = Some(out);
            }
        }
        best.ok_or_else(|| CodecError::Compression {
            method: Method::Lz4HcBrute,
            reason: "no level produced output".into(),
        })
    }
}

pub(super) fn decompress(payload: &[u8], expected: usize) -> Result<Vec<u8>, DecodeError> {
    let len = block_len(payload, expected).ok_or_else(|| DecodeError::Corrupt {
        family: Family::Lz4,
        reason: format!("sequences do not produce {expected} bytes"),
    })?;
    lz4_flex::block::decompress(&payload[..len], expected)
        .map_err(|e| DecodeError::Corrupt { family: Family::Lz4, reason: e.to_string() })
}

/// Length of the LZ4 block at the start of `data` that decodes to exactly
/// `expected` bytes.  LZ4 blocks carry no length of their own, and stored
/// payloads may be followed by alignment padding.
fn block_len(data: &[u8], expected: usize) -> Option<usize> {
    let mut pos = 0usize;
    let mut produced = 0usize;
    loop {
        let token = *data.get(pos)?;
        pos += 1;

        let mut literals = (token >> 4) as usize;
        if literals == 15 {
            literals += extended_len(data, &mut pos)?;
        }
        pos = pos.checked_add(literals)?;
        if pos > data.len() {
            return None;
        }
        produced += literals;
        if produced >= expected {
            return (produced == expected).then_some(pos);
        }

        // 2-byte match offset, then the match length.
        pos += 2;
        if pos > data.len() {
            return None;
        }
        let mut match_len = (token & 0x0F) as usize + 4;
        if token & 0x0F == 15 {
            match_len += extended_len(data, &mut pos)?;
        }
        produced += match_len;
        if produced > expected {
            return None;
        }
    }
}

fn extended_len(data: &[u8], pos: &mut usize) -> Option<usize> {
    let mut total = 0usize;
    loop {
        let b = *data.get(*pos)?;
        *pos += 1;
        total += b as usize;
        if b != 255 {
            return Some(total);
        }
    }
}
