//! Codec primitives: the XOR obfuscation byte and the deflate compressor
//! used for both payload blocks and the index region.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::error::GmPackError;

/// Constant obfuscation byte. Self-inverse: XOR-ing twice is a no-op.
pub const OBFUSCATION_BYTE: u8 = 0x62;

/// Largest payload the format will attempt to compress. Larger buffers are
/// written raw with `compressFlag = 0`, matching the original's 32-bit
/// length-field bypass.
pub const MAX_COMPRESSIBLE_LEN: i64 = 0x7FFF_FFFF;

pub fn obfuscate(buf: &mut [u8]) {
    for byte in buf.iter_mut() {
        *byte ^= OBFUSCATION_BYTE;
    }
}

/// Clamp a `-1..=9` compression level the way `qCompress` does; any other
/// value also falls back to the default.
fn clamp_level(level: i32) -> Compression {
    match level {
        -1 => Compression::default(),
        0..=9 => Compression::new(level as u32),
        _ => Compression::default(),
    }
}

pub fn compress(data: &[u8], level: i32) -> Result<Vec<u8>, GmPackError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), clamp_level(level));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompresses without a known target length; used for the index region,
/// whose decompressed size isn't known until every record has been parsed.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, GmPackError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|_| GmPackError::CodecDecompress(data.len()))?;
    Ok(out)
}

/// Decompresses a payload block and checks the result against the record's
/// declared original length.
pub fn decompress_expect(data: &[u8], expected_len: i64) -> Result<Vec<u8>, GmPackError> {
    let out = decompress(data)?;
    if out.len() as i64 != expected_len {
        return Err(GmPackError::CodecSizeMismatch {
            expected: expected_len,
            actual: out.len() as i64,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obfuscation_is_self_inverse() {
        let original = b"the quick brown fox".to_vec();
        let mut buf = original.clone();
        obfuscate(&mut buf);
        assert_ne!(buf, original);
        obfuscate(&mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn compress_round_trip() {
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbbbbbbb".to_vec();
        let compressed = compress(&data, 9).unwrap();
        let back = decompress_expect(&compressed, data.len() as i64).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn decompress_expect_rejects_mismatch() {
        let data = b"some data to compress that is reasonably long for deflate".to_vec();
        let compressed = compress(&data, 6).unwrap();
        let err = decompress_expect(&compressed, (data.len() - 1) as i64).unwrap_err();
        assert!(matches!(err, GmPackError::CodecSizeMismatch { .. }));
    }
}
