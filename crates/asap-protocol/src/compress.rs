// SPDX-License-Identifier: MIT OR Apache-2.0
//! Body compression for request and response payloads.
//!
//! Supports `identity`, `gzip`, and (behind the `brotli` feature) `br`.
//! Senders compress only when the serialized body reaches
//! [`COMPRESSION_THRESHOLD`]; receivers decode per `Content-Encoding` and
//! enforce a post-decompression size ceiling to stop decompression bombs.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use thiserror::Error;

/// Bodies below this many bytes are sent uncompressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Errors from encoding or decoding a compressed body.
#[derive(Debug, Error)]
pub enum CompressError {
    /// `Content-Encoding` names an algorithm this build does not support.
    #[error("unsupported content encoding: {0:?}")]
    UnsupportedEncoding(String),

    /// The compressed stream is corrupt.
    #[error("corrupt compressed data: {0}")]
    Corrupt(#[from] std::io::Error),

    /// The decompressed body exceeds the configured ceiling.
    #[error("decompressed body exceeds limit of {limit} bytes")]
    TooLarge {
        /// The configured maximum decompressed size.
        limit: usize,
    },
}

/// Supported content codings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// No transformation.
    Identity,
    /// RFC 1952 gzip.
    Gzip,
    /// Brotli (`br`), when compiled in.
    #[cfg(feature = "brotli")]
    Brotli,
}

impl CompressionAlgorithm {
    /// The `Content-Encoding` token for this algorithm.
    #[must_use]
    pub fn content_encoding(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
            #[cfg(feature = "brotli")]
            Self::Brotli => "br",
        }
    }

    /// Parse a `Content-Encoding` token (case-insensitive). `None` means
    /// the encoding is not supported by this build.
    #[must_use]
    pub fn from_content_encoding(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Some(Self::Identity),
            "gzip" => Some(Self::Gzip),
            #[cfg(feature = "brotli")]
            "br" => Some(Self::Brotli),
            _ => None,
        }
    }

    /// The preferred algorithm for outbound compression in this build.
    #[must_use]
    pub fn preferred() -> Self {
        #[cfg(feature = "brotli")]
        {
            Self::Brotli
        }
        #[cfg(not(feature = "brotli"))]
        {
            Self::Gzip
        }
    }
}

/// `Accept-Encoding` value covering every algorithm this build decodes.
#[must_use]
pub fn accept_encoding_header() -> &'static str {
    #[cfg(feature = "brotli")]
    {
        "br, gzip"
    }
    #[cfg(not(feature = "brotli"))]
    {
        "gzip"
    }
}

/// Compress `body` when it is at least `threshold` bytes; a body one
/// byte below the threshold goes out untouched.
///
/// Returns the (possibly untouched) bytes and the algorithm that was
/// applied; [`CompressionAlgorithm::Identity`] means the body went out
/// as-is.
///
/// # Errors
///
/// Returns [`CompressError::Corrupt`] if the encoder fails mid-stream.
pub fn compress_payload(
    body: &[u8],
    threshold: usize,
) -> Result<(Vec<u8>, CompressionAlgorithm), CompressError> {
    if body.len() < threshold {
        return Ok((body.to_vec(), CompressionAlgorithm::Identity));
    }
    let algorithm = CompressionAlgorithm::preferred();
    Ok((encode(algorithm, body)?, algorithm))
}

/// Compress with an explicit algorithm, regardless of size.
///
/// # Errors
///
/// Returns [`CompressError::Corrupt`] on encoder I/O failure.
pub fn encode(algorithm: CompressionAlgorithm, body: &[u8]) -> Result<Vec<u8>, CompressError> {
    match algorithm {
        CompressionAlgorithm::Identity => Ok(body.to_vec()),
        CompressionAlgorithm::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            Ok(encoder.finish()?)
        }
        #[cfg(feature = "brotli")]
        CompressionAlgorithm::Brotli => {
            let mut out = Vec::new();
            let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            writer.write_all(body)?;
            drop(writer);
            Ok(out)
        }
    }
}

/// Decompress `body` per `algorithm`, refusing output beyond `max_size`.
///
/// The decoder reads at most `max_size + 1` bytes so an oversized stream
/// fails without being fully inflated.
///
/// # Errors
///
/// [`CompressError::Corrupt`] for malformed streams,
/// [`CompressError::TooLarge`] when the ceiling is exceeded.
pub fn decompress(
    algorithm: CompressionAlgorithm,
    body: &[u8],
    max_size: usize,
) -> Result<Vec<u8>, CompressError> {
    let out = match algorithm {
        CompressionAlgorithm::Identity => {
            if body.len() > max_size {
                return Err(CompressError::TooLarge { limit: max_size });
            }
            body.to_vec()
        }
        CompressionAlgorithm::Gzip => read_capped(GzDecoder::new(body), max_size)?,
        #[cfg(feature = "brotli")]
        CompressionAlgorithm::Brotli => {
            read_capped(brotli::Decompressor::new(body, 4096), max_size)?
        }
    };
    Ok(out)
}

fn read_capped(mut reader: impl Read, max_size: usize) -> Result<Vec<u8>, CompressError> {
    let mut out = Vec::new();
    let read = reader
        .by_ref()
        .take(max_size as u64 + 1)
        .read_to_end(&mut out)?;
    if read > max_size {
        return Err(CompressError::TooLarge { limit: max_size });
    }
    Ok(out)
}
