//! Chunk codecs — LZX and XPRESS.
//!
//! Both codecs operate on a single chunk of at most 32,768 uncompressed
//! bytes and keep no state between chunks: every chunk is an independent
//! compressed stream, which is what makes O(1) random access at chunk
//! granularity possible.
//!
//! `compress` returns `None` when it cannot produce output strictly smaller
//! than the input; the resource layer then stores the chunk verbatim with
//! stored size == uncompressed size, and the codec is never invoked when
//! reading such a chunk back.

pub mod bitstream;
pub mod huffman;
pub mod lzx;
pub mod matchfinder;
pub mod xpress;

use thiserror::Error;

use crate::header::WIM_CHUNK_SIZE;

/// Maximum uncompressed bytes per chunk.
pub const MAX_CHUNK: usize = WIM_CHUNK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    /// No compression; resources are stored verbatim.
    None,
    /// XPRESS — fast, moderate ratio.
    Xpress,
    /// LZX — slower, better ratio (default for capture).
    Lzx,
}

impl CodecKind {
    pub fn name(self) -> &'static str {
        match self {
            CodecKind::None => "none",
            CodecKind::Xpress => "xpress",
            CodecKind::Lzx => "lzx",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(CodecKind::None),
            "xpress" | "fast" => Some(CodecKind::Xpress),
            "lzx" | "maximum" => Some(CodecKind::Lzx),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The compressed bitstream is not decodable. Fatal for the chunk.
    #[error("corrupt compressed data: {0}")]
    Corrupt(&'static str),
    /// Decoded output did not fill the declared uncompressed length.
    #[error("decompressed {got} bytes, expected {expected}")]
    WrongLength { expected: usize, got: usize },
}

/// A chunk codec. Implementations are pure: no global tables, no state
/// carried between chunks.
pub trait Codec: Send + Sync {
    fn kind(&self) -> CodecKind;

    /// Compress `src` (≤ 32,768 bytes) into `dst` (cleared first).
    /// Returns the compressed length, or `None` when the result would not be
    /// strictly smaller than `src` — the caller must then store the raw
    /// bytes.
    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> Option<usize>;

    /// Decompress `src` into `dst`, whose length is the exact expected
    /// uncompressed size. Any mismatch or undecodable input is an error;
    /// partial output is never surfaced.
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<(), CodecError>;
}

static XPRESS: xpress::Xpress = xpress::Xpress;
static LZX: lzx::Lzx = lzx::Lzx;

/// Resolve a codec. `CodecKind::None` has no codec: uncompressed resources
/// never reach the chunk layer.
pub fn get_codec(kind: CodecKind) -> Option<&'static dyn Codec> {
    match kind {
        CodecKind::None => None,
        CodecKind::Xpress => Some(&XPRESS),
        CodecKind::Lzx => Some(&LZX),
    }
}
