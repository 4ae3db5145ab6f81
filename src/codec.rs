//! Pluggable compression backend.
//!
//! This module defines the [`Codec`] trait and a registry mapping extension
//! tags (the same tags that appear in transcoded keys and footer policy
//! fields) to codec implementations. The core owns only the *policy* of when
//! compression is applied; the byte transforms themselves are delegated to
//! existing codec crates.

use crate::error::{Result, ShardsetError};
use std::io::{Read, Write};

/// Interface for compression algorithms.
///
/// Implementors provide the logic to compress and decompress byte buffers.
/// Each codec is identified by the extension tag stored in transcoded keys
/// (e.g. the `zst` in `embedding.npy.zst`).
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// The extension tag identifying this codec in keys and footers.
    fn ext(&self) -> &'static str;

    /// Compresses the data.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompresses the data.
    ///
    /// # Errors
    /// Returns [`ShardsetError::Codec`] if the payload is corrupt.
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Zstandard at level 1, the general-purpose default.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec;

impl Codec for ZstdCodec {
    fn ext(&self) -> &'static str {
        "zst"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::encode_all(data, 1)
            .map_err(|e| ShardsetError::Codec(format!("zst compression failed: {e}")))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::decode_all(data)
            .map_err(|e| ShardsetError::Codec(format!("corrupt zst payload: {e}")))
    }
}

/// LZ4 block format with a length prefix, the fast option.
#[derive(Debug, Clone, Copy)]
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn ext(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| ShardsetError::Codec(format!("corrupt lz4 payload: {e}")))
    }
}

/// Gzip, kept for compatibility with tooling that predates the other codecs.
#[derive(Debug, Clone, Copy)]
pub struct GzipCodec;

impl Codec for GzipCodec {
    fn ext(&self) -> &'static str {
        "gz"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish())
            .map_err(|e| ShardsetError::Codec(format!("gz compression failed: {e}")))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| ShardsetError::Codec(format!("corrupt gz payload: {e}")))?;
        Ok(out)
    }
}

/// A codec that performs no compression (pass-through).
#[derive(Debug, Clone, Copy)]
pub struct NoCodec;

impl Codec for NoCodec {
    fn ext(&self) -> &'static str {
        "none"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Centralized registry for compression codecs.
///
/// Maps extension tags (stored in keys and footers) to [`Codec`]
/// implementations. Readers and writers construct the default registry;
/// embedding applications may register additional codecs under new tags.
#[derive(Debug)]
pub struct CodecRegistry {
    codecs: Vec<Box<dyn Codec>>,
}

impl CodecRegistry {
    /// Creates a registry with the built-in codecs: `zst`, `lz4`, `gz`,
    /// `none`.
    pub fn new() -> Self {
        let mut reg = Self { codecs: Vec::new() };
        reg.register(Box::new(ZstdCodec));
        reg.register(Box::new(Lz4Codec));
        reg.register(Box::new(GzipCodec));
        reg.register(Box::new(NoCodec));
        reg
    }

    /// Registers a codec. A codec with the same extension tag is replaced.
    pub fn register(&mut self, codec: Box<dyn Codec>) {
        if let Some(slot) = self.codecs.iter_mut().find(|c| c.ext() == codec.ext()) {
            *slot = codec;
        } else {
            self.codecs.push(codec);
        }
    }

    /// Retrieves a codec by its extension tag.
    ///
    /// # Errors
    /// Returns [`ShardsetError::Codec`] if the tag is not registered.
    pub fn get(&self, ext: &str) -> Result<&dyn Codec> {
        self.codecs
            .iter()
            .find(|c| c.ext() == ext)
            .map(|c| c.as_ref())
            .ok_or_else(|| ShardsetError::Codec(format!("codec '{ext}' is not registered")))
    }

    /// Whether `ext` names a registered codec.
    pub fn contains(&self, ext: &str) -> bool {
        self.codecs.iter().any(|c| c.ext() == ext)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog "
            .repeat(32)
            .to_vec()
    }

    #[test]
    fn round_trips_every_registered_codec() {
        let reg = CodecRegistry::new();
        let data = sample();
        for ext in ["zst", "lz4", "gz", "none"] {
            let codec = reg.get(ext).unwrap();
            let compressed = codec.compress(&data).unwrap();
            let restored = codec.decompress(&compressed).unwrap();
            assert_eq!(restored, data, "{ext} round-trip");
        }
    }

    #[test]
    fn compressible_input_actually_shrinks() {
        let reg = CodecRegistry::new();
        let data = sample();
        for ext in ["zst", "lz4", "gz"] {
            let compressed = reg.get(ext).unwrap().compress(&data).unwrap();
            assert!(compressed.len() < data.len(), "{ext} should shrink");
        }
    }

    #[test]
    fn corrupt_payload_is_a_codec_error() {
        let reg = CodecRegistry::new();
        for ext in ["zst", "lz4", "gz"] {
            let err = reg
                .get(ext)
                .unwrap()
                .decompress(b"definitely not compressed")
                .unwrap_err();
            assert!(matches!(err, ShardsetError::Codec(_)), "{ext}");
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let reg = CodecRegistry::new();
        assert!(matches!(
            reg.get("snappy").unwrap_err(),
            ShardsetError::Codec(_)
        ));
        assert!(!reg.contains("snappy"));
    }
}
