//! gzip compression for stored payloads plus the memory-headroom probe that
//! gates it.

use bytes::Bytes;
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use std::{
    io::{self, Read, Write},
    sync::Mutex,
};
use sysinfo::System;

/// Reports how much memory is currently usable for transient buffers.
pub trait ResourceProbe: Send + Sync {
    fn available_memory(&self) -> u64;
}

/// Probe backed by the operating system's available-memory figure,
/// optionally capped by a configured ceiling.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
    ceiling: Option<u64>,
}

impl SystemMemoryProbe {
    pub fn new(ceiling: Option<u64>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            ceiling,
        }
    }
}

impl ResourceProbe for SystemMemoryProbe {
    fn available_memory(&self) -> u64 {
        let available = match self.system.lock() {
            Ok(mut system) => {
                system.refresh_memory();
                system.available_memory()
            }
            Err(_) => 0,
        };
        match self.ceiling {
            Some(ceiling) => available.min(ceiling),
            None => available,
        }
    }
}

/// Probe that always reports the same figure.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub u64);

impl ResourceProbe for FixedProbe {
    fn available_memory(&self) -> u64 {
        self.0
    }
}

/// Stateless gzip transform.
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    level: u32,
}

impl Compressor {
    pub fn new(level: u32) -> Self {
        Self {
            level: level.clamp(1, 9),
        }
    }

    pub fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(
            Vec::with_capacity(data.len() / 2),
            Compression::new(self.level),
        );
        encoder.write_all(data)?;
        encoder.finish()
    }

    /// Compressed bytes when they are smaller than the input, `None` otherwise.
    pub fn compress_if_smaller(&self, data: &[u8]) -> io::Result<Option<Vec<u8>>> {
        let compressed = self.compress(data)?;
        if compressed.len() < data.len() {
            Ok(Some(compressed))
        } else {
            Ok(None)
        }
    }

    pub fn decompress(&self, data: &[u8]) -> io::Result<Bytes> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::with_capacity(data.len() * 2);
        decoder.read_to_end(&mut out)?;
        Ok(Bytes::from(out))
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressible_payload_shrinks_and_restores() {
        let compressor = Compressor::new(9);
        let data = b"abcabcabc".repeat(500);
        let packed = compressor.compress_if_smaller(&data).unwrap().unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(compressor.decompress(&packed).unwrap().as_ref(), data.as_slice());
    }

    #[test]
    fn test_tiny_payload_is_not_worth_compressing() {
        let compressor = Compressor::default();
        assert!(compressor.compress_if_smaller(b"x").unwrap().is_none());
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(Compressor::default().decompress(b"not gzip").is_err());
    }

    #[test]
    fn test_level_is_clamped() {
        let compressor = Compressor::new(42);
        let data = vec![0u8; 4096];
        assert!(compressor.compress(&data).is_ok());
    }

    #[test]
    fn test_probe_ceiling_caps_system_figure() {
        let probe = SystemMemoryProbe::new(Some(1));
        assert!(probe.available_memory() <= 1);
        assert_eq!(FixedProbe(7).available_memory(), 7);
    }
}
