//! XPRESS — LZ77 with a 512-symbol Huffman code and 4-bit code lengths.
//!
//! # Compressed chunk layout
//!
//! ```text
//! [ 256 bytes ]  code lengths for 512 symbols, two per byte
//!                (symbol 2i in the low nibble, 2i+1 in the high nibble)
//! [ bitstream ]  16-bit LE words, bits most-significant-first
//! ```
//!
//! Symbols 0–255 are literals. Symbol `256 + (slot << 4) + lh` is a match:
//!
//! - `lh` (0–15) is the length header: length = `lh + 3` for `lh < 15`;
//!   `lh == 15` is followed by an 8-bit extension `e` (length = `18 + e`),
//!   and `e == 255` escapes to a raw 16-bit length.
//! - `slot` (0–14) is the offset slot: offset = `(1 << slot) + extra`,
//!   where `extra` is `slot` further bits. Slot 0 encodes offset 1.
//!
//! The decoder stops when the declared uncompressed length is reached; no
//! end-of-stream symbol exists. Minimum match length 3; offsets are bounded
//! by the chunk size, so state never crosses a chunk boundary.

use super::bitstream::{BitReader, BitWriter};
use super::huffman::{build_lengths, HuffmanDecoder, HuffmanEncoder};
use super::matchfinder::{MatchFinder, MIN_MATCH};
use super::{Codec, CodecError, CodecKind, MAX_CHUNK};

const NUM_SYMS: usize = 512;
const TABLE_BYTES: usize = 256;
const MAX_CODE_LEN: u8 = 15;
const MIN_MATCH_LEN: usize = MIN_MATCH;

pub struct Xpress;

enum Token {
    Literal(u8),
    Match { len: usize, dist: usize },
}

#[inline]
fn offset_slot(dist: usize) -> usize {
    debug_assert!(dist >= 1);
    (usize::BITS - 1 - dist.leading_zeros()) as usize
}

#[inline]
fn match_symbol(len: usize, dist: usize) -> usize {
    let lh = (len - MIN_MATCH_LEN).min(15);
    256 + (offset_slot(dist) << 4) + lh
}

impl Codec for Xpress {
    fn kind(&self) -> CodecKind {
        CodecKind::Xpress
    }

    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> Option<usize> {
        debug_assert!(src.len() <= MAX_CHUNK);
        dst.clear();
        if src.len() <= TABLE_BYTES + 2 {
            return None; // the code-length table alone would not fit
        }

        // Pass 1: greedy tokenization + symbol frequencies.
        let mut tokens = Vec::with_capacity(src.len() / 2);
        let mut freqs = vec![0u32; NUM_SYMS];
        let mut mf = MatchFinder::new(src.len());
        let mut pos = 0;
        while pos < src.len() {
            match mf.longest_match(src, pos, src.len() - pos, pos) {
                Some((len, dist)) => {
                    freqs[match_symbol(len, dist)] += 1;
                    for p in pos..pos + len {
                        mf.insert(src, p);
                    }
                    tokens.push(Token::Match { len, dist });
                    pos += len;
                }
                None => {
                    freqs[src[pos] as usize] += 1;
                    mf.insert(src, pos);
                    tokens.push(Token::Literal(src[pos]));
                    pos += 1;
                }
            }
        }

        // Pass 2: canonical code + emission.
        let lengths = build_lengths(&freqs, MAX_CODE_LEN);
        let enc = HuffmanEncoder::from_lengths(&lengths);

        dst.reserve(TABLE_BYTES + src.len() / 2);
        for i in 0..TABLE_BYTES {
            dst.push(lengths[2 * i] | (lengths[2 * i + 1] << 4));
        }

        let mut w = BitWriter::new();
        for token in &tokens {
            match *token {
                Token::Literal(b) => enc.write_symbol(&mut w, b as usize),
                Token::Match { len, dist } => {
                    enc.write_symbol(&mut w, match_symbol(len, dist));
                    let lh = len - MIN_MATCH_LEN;
                    if lh >= 15 {
                        if len < 273 {
                            w.write_bits((len - 18) as u32, 8);
                        } else {
                            w.write_bits(255, 8);
                            w.write_bits(len as u32, 16);
                        }
                    }
                    let slot = offset_slot(dist);
                    w.write_bits((dist - (1 << slot)) as u32, slot as u8);
                }
            }
            if dst.len() + w.len() >= src.len() {
                return None; // not compressible
            }
        }

        dst.extend_from_slice(&w.finish());
        if dst.len() < src.len() {
            Some(dst.len())
        } else {
            None
        }
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<(), CodecError> {
        if src.len() < TABLE_BYTES {
            return Err(CodecError::Corrupt("xpress chunk shorter than its code table"));
        }
        let mut lengths = vec![0u8; NUM_SYMS];
        for (i, &b) in src[..TABLE_BYTES].iter().enumerate() {
            lengths[2 * i] = b & 0x0f;
            lengths[2 * i + 1] = b >> 4;
        }
        let dec = HuffmanDecoder::new(&lengths, MAX_CODE_LEN)?;
        let mut r = BitReader::new(&src[TABLE_BYTES..]);

        let mut pos = 0;
        while pos < dst.len() {
            let sym = dec.decode(&mut r)? as usize;
            if sym < 256 {
                dst[pos] = sym as u8;
                pos += 1;
                continue;
            }
            let m = sym - 256;
            let slot = m >> 4;
            let lh = m & 0x0f;

            let len = if lh == 15 {
                let e = r.read_bits(8)?;
                if e == 255 {
                    r.read_bits(16)? as usize
                } else {
                    18 + e as usize
                }
            } else {
                lh + MIN_MATCH_LEN
            };
            let dist = (1usize << slot) + r.read_bits(slot as u8)? as usize;

            if len < MIN_MATCH_LEN || len > dst.len() - pos {
                return Err(CodecError::Corrupt("match length out of range"));
            }
            if dist > pos {
                return Err(CodecError::Corrupt("match offset before start of chunk"));
            }
            // Overlapping copy: forward, byte by byte.
            for i in 0..len {
                dst[pos + i] = dst[pos + i - dist];
            }
            pos += len;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(src: &[u8]) -> bool {
        let mut compressed = Vec::new();
        match Xpress.compress(src, &mut compressed) {
            Some(n) => {
                assert!(n < src.len());
                let mut out = vec![0u8; src.len()];
                Xpress.decompress(&compressed[..n], &mut out).unwrap();
                assert_eq!(out, src);
                true
            }
            None => false,
        }
    }

    #[test]
    fn compresses_repetitive_data() {
        let src: Vec<u8> = b"the quick brown fox jumps over the lazy dog. "
            .iter()
            .copied()
            .cycle()
            .take(8000)
            .collect();
        assert!(roundtrip(&src));
    }

    #[test]
    fn long_matches_use_extended_lengths() {
        // A single byte repeated: matches of length 273+ exercise the u16
        // length escape.
        let src = vec![0xA5u8; MAX_CHUNK];
        assert!(roundtrip(&src));
    }

    #[test]
    fn tiny_and_incompressible_inputs_decline() {
        let mut dst = Vec::new();
        assert!(Xpress.compress(b"hi", &mut dst).is_none());

        // A pseudo-random page has no 3-byte repeats worth the table cost.
        let mut x = 0x12345678u32;
        let src: Vec<u8> = (0..4096)
            .map(|_| {
                x = x.wrapping_mul(1103515245).wrapping_add(12345);
                (x >> 16) as u8
            })
            .collect();
        let _ = roundtrip(&src); // either outcome is fine; must not panic
    }

    #[test]
    fn mixed_content_roundtrip() {
        let mut src = Vec::new();
        for i in 0..400u32 {
            src.extend_from_slice(format!("record-{:06}|", i % 37).as_bytes());
        }
        src.extend_from_slice(&[0u8; 1000]);
        assert!(roundtrip(&src));
    }

    #[test]
    fn corrupt_input_errors_cleanly() {
        let src: Vec<u8> = b"abcabcabc".iter().copied().cycle().take(5000).collect();
        let mut compressed = Vec::new();
        let n = Xpress.compress(&src, &mut compressed).unwrap();
        let mut out = vec![0u8; src.len()];

        // Truncated stream.
        assert!(Xpress.decompress(&compressed[..n / 2], &mut out).is_err());
        // Wrong expected size: either decodes short (error) or hits a bad
        // match; must never panic.
        let mut small = vec![0u8; 10];
        let _ = Xpress.decompress(&compressed[..n], &mut small);
    }
}
