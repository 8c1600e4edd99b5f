//! Deflate helpers shared by the WebSocket egress path and the edge caches.

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};

/// Compresses payloads above a size threshold at a fixed level.
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    level: u32,
    threshold: usize,
}

impl Compressor {
    pub fn new(level: u32, threshold: usize) -> Self {
        Self {
            level: level.min(9),
            threshold,
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn should_compress(&self, len: usize) -> bool {
        self.level > 0 && len > self.threshold
    }

    pub fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(self.level));
        encoder.write_all(data)?;
        encoder.finish()
    }

    /// Compressed bytes if `data` is above the threshold and actually shrinks.
    pub fn maybe_compress(&self, data: &[u8]) -> Option<Vec<u8>> {
        if !self.should_compress(data.len()) {
            return None;
        }
        match self.compress(data) {
            Ok(out) if out.len() < data.len() => Some(out),
            _ => None,
        }
    }
}

/// Inflate, refusing output larger than `limit` bytes.
pub fn decompress(data: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = decoder.read(&mut buf)?;
        if n == 0 {
            break;
        }
        if out.len() + n > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "decompressed payload exceeds limit",
            ));
        }
        out.extend_from_slice(&buf[..n]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payloads_pass_through() {
        let c = Compressor::new(6, 1024);
        assert!(c.maybe_compress(&[b'a'; 512]).is_none());
        let big = vec![b'a'; 4096];
        let packed = c.maybe_compress(&big).unwrap();
        assert!(packed.len() < big.len());
        assert_eq!(decompress(&packed, 1 << 20).unwrap(), big);
    }

    #[test]
    fn test_decompress_limit() {
        let c = Compressor::new(9, 0);
        let packed = c.compress(&vec![0u8; 100_000]).unwrap();
        assert!(decompress(&packed, 10_000).is_err());
    }

    #[test]
    fn test_level_zero_disables() {
        let c = Compressor::new(0, 0);
        assert!(!c.should_compress(1 << 20));
    }
}
