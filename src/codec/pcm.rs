//! s16le sample conversions

use bytes::{BufMut, Bytes, BytesMut};

/// Interleaved little-endian bytes to samples; a trailing odd byte is ignored
pub fn samples_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

pub fn samples_to_le_bytes(samples: &[i16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        buf.put_i16_le(sample);
    }
    buf.freeze()
}
