//! LZX with a 32 KiB window — the format's high-ratio codec.
//!
//! Each chunk is an independent LZX stream of one or more blocks. A block
//! begins with a 3-bit type and a 24-bit uncompressed size:
//!
//! - **Verbatim (1)** — Huffman-coded literals and matches; offsets carry
//!   their extra bits raw.
//! - **Aligned offset (2)** — identical, except an 8-element aligned tree
//!   (3-bit lengths) precedes the other trees and codes the low three bits
//!   of large offsets.
//! - **Uncompressed (3)** — after realigning to 16 bits: the three repeat
//!   offsets as LE u32, then the raw bytes (plus one pad byte if the size
//!   is odd).
//!
//! The main tree has 256 literal elements plus 8 per position slot; the
//! length tree has 249 elements. Tree path lengths are delta-coded mod 17
//! against the previous block's lengths (zero for the first block of a
//! chunk) and transmitted through a 20-element pretree whose own 4-bit
//! lengths precede it. Codes 17/18 run-length zeros, 19 repeats a value.
//!
//! Match lengths are 2..=257: a 3-bit header, 7 escaping to the length
//! tree. Offsets are delta-coded through the three-entry repeat queue
//! (initial state 1, 1, 1); real offsets are `formatted - 2` where
//! `formatted = base[slot] + extra`. With a 15-bit window there are 30
//! position slots and footer widths cap at 13 bits.

use super::bitstream::{BitReader, BitWriter};
use super::huffman::{build_lengths, HuffmanDecoder, HuffmanEncoder};
use super::matchfinder::{common_prefix, MatchFinder};
use super::{Codec, CodecError, CodecKind, MAX_CHUNK};

const NUM_SLOTS: usize = 30;
const MAIN_SYMS: usize = 256 + 8 * NUM_SLOTS;
const LEN_SYMS: usize = 249;
const ALIGNED_SYMS: usize = 8;
const PRETREE_SYMS: usize = 20;

const MAX_TREE_LEN: u8 = 16;
const MAX_PRETREE_LEN: u8 = 15;
const MAX_ALIGNED_LEN: u8 = 7;

const BLOCK_VERBATIM: u16 = 1;
const BLOCK_ALIGNED: u16 = 2;
const BLOCK_UNCOMPRESSED: u16 = 3;

const MIN_MATCH: usize = 2;
const MAX_MATCH: usize = 257;

#[rustfmt::skip]
const FOOTER_BITS: [u8; NUM_SLOTS] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6,
    6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13, 13,
];

#[rustfmt::skip]
const BASE_POSITION: [u32; NUM_SLOTS] = [
    0, 1, 2, 3, 4, 6, 8, 12, 16, 24, 32, 48, 64, 96, 128,
    192, 256, 384, 512, 768, 1024, 1536, 2048, 3072, 4096,
    6144, 8192, 12288, 16384, 24576,
];

/// Largest encodable real match offset: the top slot's base plus its full
/// footer, minus the formatted-offset bias.
const MAX_OFFSET: usize = 24576 + (1 << 13) - 1 - 2;

pub struct Lzx;

// ── Decoder ──────────────────────────────────────────────────────────────────

/// Apply one pretree-coded delta run to `lengths[..count]`.
fn read_tree_lengths(
    r: &mut BitReader,
    lengths: &mut [u8],
    count: usize,
) -> Result<(), CodecError> {
    let mut pretree_lengths = [0u8; PRETREE_SYMS];
    for l in pretree_lengths.iter_mut() {
        *l = r.read_bits(4)? as u8;
    }
    let pretree = HuffmanDecoder::new(&pretree_lengths, MAX_PRETREE_LEN)?;

    let mut i = 0;
    while i < count {
        let code = pretree.decode(r)?;
        match code {
            0..=16 => {
                lengths[i] = ((17 + lengths[i] as u16 - code) % 17) as u8;
                i += 1;
            }
            17 => {
                let zeros = r.read_bits(4)? as usize + 4;
                if i + zeros > count {
                    return Err(CodecError::Corrupt("zero run past end of tree"));
                }
                lengths[i..i + zeros].fill(0);
                i += zeros;
            }
            18 => {
                let zeros = r.read_bits(5)? as usize + 20;
                if i + zeros > count {
                    return Err(CodecError::Corrupt("zero run past end of tree"));
                }
                lengths[i..i + zeros].fill(0);
                i += zeros;
            }
            19 => {
                let same = r.read_bits(1)? as usize + 4;
                if i + same > count {
                    return Err(CodecError::Corrupt("repeat run past end of tree"));
                }
                let code = pretree.decode(r)?;
                if code > 16 {
                    return Err(CodecError::Corrupt("nested pretree run code"));
                }
                let value = ((17 + lengths[i] as u16 - code) % 17) as u8;
                lengths[i..i + same].fill(value);
                i += same;
            }
            _ => return Err(CodecError::Corrupt("invalid pretree code")),
        }
    }
    Ok(())
}

impl Codec for Lzx {
    fn kind(&self) -> CodecKind {
        CodecKind::Lzx
    }

    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> Option<usize> {
        compress_chunk(src, dst)
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<(), CodecError> {
        let mut r = BitReader::new(src);
        let mut rq: [u32; 3] = [1, 1, 1];
        // Tree state persists across blocks within the chunk, never beyond.
        let mut main_lengths = vec![0u8; MAIN_SYMS];
        let mut len_lengths = vec![0u8; LEN_SYMS];
        let mut pos = 0usize;

        while pos < dst.len() {
            let block_type = r.read_bits(3)?;
            let block_size = r.read_bits32(24)? as usize;
            if block_size == 0 || block_size > dst.len() - pos {
                return Err(CodecError::Corrupt("block size exceeds chunk"));
            }

            if block_type == BLOCK_UNCOMPRESSED {
                r.align();
                let mut raw = [0u8; 12];
                r.read_raw_bytes(&mut raw)?;
                for (i, q) in rq.iter_mut().enumerate() {
                    *q = u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());
                }
                r.read_raw_bytes(&mut dst[pos..pos + block_size])?;
                if block_size % 2 == 1 {
                    r.skip_byte()?;
                }
                pos += block_size;
                continue;
            }

            let aligned = match block_type {
                BLOCK_VERBATIM => None,
                BLOCK_ALIGNED => {
                    let mut al = [0u8; ALIGNED_SYMS];
                    for l in al.iter_mut() {
                        *l = r.read_bits(3)? as u8;
                    }
                    Some(HuffmanDecoder::new(&al, MAX_ALIGNED_LEN)?)
                }
                _ => return Err(CodecError::Corrupt("invalid block type")),
            };

            read_tree_lengths(&mut r, &mut main_lengths, 256)?;
            read_tree_lengths(&mut r, &mut main_lengths[256..], MAIN_SYMS - 256)?;
            read_tree_lengths(&mut r, &mut len_lengths, LEN_SYMS)?;
            let main_tree = HuffmanDecoder::new(&main_lengths, MAX_TREE_LEN)?;
            let len_tree = HuffmanDecoder::new(&len_lengths, MAX_TREE_LEN)?;

            let mut remaining = block_size;
            while remaining > 0 {
                let element = main_tree.decode(&mut r)? as usize;
                if element < 256 {
                    dst[pos] = element as u8;
                    pos += 1;
                    remaining -= 1;
                    continue;
                }

                let m = element - 256;
                let length_header = m & 7;
                let length = if length_header == 7 {
                    len_tree.decode(&mut r)? as usize + 9
                } else {
                    length_header + 2
                };

                let slot = m >> 3;
                let offset = match slot {
                    0 => rq[0],
                    1 => {
                        rq.swap(0, 1);
                        rq[0]
                    }
                    2 => {
                        rq.swap(0, 2);
                        rq[0]
                    }
                    _ => {
                        if slot >= NUM_SLOTS {
                            return Err(CodecError::Corrupt("position slot out of range"));
                        }
                        let footer = FOOTER_BITS[slot];
                        let formatted = match &aligned {
                            Some(tree) if footer >= 3 => {
                                let verbatim = (r.read_bits(footer - 3)? as u32) << 3;
                                BASE_POSITION[slot] + verbatim + tree.decode(&mut r)? as u32
                            }
                            _ => BASE_POSITION[slot] + r.read_bits32(footer)?,
                        };
                        let offset = formatted - 2;
                        rq[2] = rq[1];
                        rq[1] = rq[0];
                        rq[0] = offset;
                        offset
                    }
                };

                let offset = offset as usize;
                if offset == 0 || offset > pos {
                    return Err(CodecError::Corrupt("match offset before start of chunk"));
                }
                if length > remaining {
                    return Err(CodecError::Corrupt("match length exceeds block"));
                }
                for i in 0..length {
                    dst[pos + i] = dst[pos + i - offset];
                }
                pos += length;
                remaining -= length;
            }
            r.align();
        }
        Ok(())
    }
}

// ── Encoder ──────────────────────────────────────────────────────────────────

enum Token {
    Literal(u8),
    /// `slot` 0–2 selects the repeat queue; otherwise a real offset whose
    /// formatted extra bits are stored alongside.
    Match { length: u16, slot: u8, extra: u32 },
}

#[inline]
fn position_slot(formatted: u32) -> usize {
    // Slots 0-2 are the repeat queue; real formatted offsets start at 3.
    debug_assert!(formatted >= 3);
    match BASE_POSITION.binary_search(&formatted) {
        Ok(s) => s,
        Err(s) => s - 1,
    }
}

fn compress_chunk(src: &[u8], dst: &mut Vec<u8>) -> Option<usize> {
    debug_assert!(src.len() <= MAX_CHUNK);
    dst.clear();
    if src.len() < 16 {
        return None;
    }

    // Tokenize greedily, simulating the repeat-offset queue exactly as the
    // decoder will replay it.
    let mut tokens = Vec::with_capacity(src.len() / 2);
    let mut main_freqs = vec![0u32; MAIN_SYMS];
    let mut len_freqs = vec![0u32; LEN_SYMS];
    let mut aligned_freqs = vec![0u32; ALIGNED_SYMS];
    let mut aligned_matches = 0usize;

    let mut mf = MatchFinder::new(src.len());
    let mut rq: [u32; 3] = [1, 1, 1];
    let mut pos = 0usize;
    while pos < src.len() {
        // Repeat offsets first: they cost no footer bits.
        let mut rep: Option<(usize, usize)> = None; // (len, queue index)
        for (qi, &q) in rq.iter().enumerate() {
            let dist = q as usize;
            if dist == 0 || dist > pos {
                continue;
            }
            let len = common_prefix(src, pos - dist, pos, MAX_MATCH);
            if len >= MIN_MATCH && rep.map_or(true, |(best, _)| len > best) {
                rep = Some((len, qi));
            }
        }
        let normal = mf.longest_match(src, pos, MAX_MATCH, pos.min(MAX_OFFSET));

        let (length, slot, extra, dist) = match (rep, normal) {
            (Some((rlen, qi)), Some((nlen, _))) if rlen + 1 >= nlen => {
                let dist = rq[qi] as usize;
                (rlen, qi, 0u32, dist)
            }
            (Some((rlen, qi)), None) => {
                let dist = rq[qi] as usize;
                (rlen, qi, 0u32, dist)
            }
            (_, Some((nlen, ndist))) => {
                let formatted = ndist as u32 + 2;
                let slot = position_slot(formatted);
                (nlen, slot, formatted - BASE_POSITION[slot], ndist)
            }
            (None, None) => {
                main_freqs[src[pos] as usize] += 1;
                tokens.push(Token::Literal(src[pos]));
                mf.insert(src, pos);
                pos += 1;
                continue;
            }
        };

        // Replay the decoder's queue update.
        match slot {
            0 => {}
            1 => rq.swap(0, 1),
            2 => rq.swap(0, 2),
            _ => {
                rq[2] = rq[1];
                rq[1] = rq[0];
                rq[0] = dist as u32;
            }
        }

        let length_header = (length - MIN_MATCH).min(7);
        main_freqs[256 + (slot << 3) + length_header] += 1;
        if length_header == 7 {
            len_freqs[length - 9] += 1;
        }
        if slot >= 3 && FOOTER_BITS[slot] >= 3 {
            aligned_matches += 1;
            aligned_freqs[(extra & 7) as usize] += 1;
        }

        for p in pos..pos + length {
            mf.insert(src, p);
        }
        tokens.push(Token::Match {
            length: length as u16,
            slot: slot as u8,
            extra,
        });
        pos += length;
    }

    let use_aligned = aligned_matches > 0;
    let main_lengths = build_lengths(&main_freqs, MAX_TREE_LEN);
    let len_lengths = build_lengths(&len_freqs, MAX_TREE_LEN);
    let aligned_lengths = build_lengths(&aligned_freqs, MAX_ALIGNED_LEN);
    let main_enc = HuffmanEncoder::from_lengths(&main_lengths);
    let len_enc = HuffmanEncoder::from_lengths(&len_lengths);
    let aligned_enc = HuffmanEncoder::from_lengths(&aligned_lengths);

    let mut w = BitWriter::new();
    let block_type = if use_aligned { BLOCK_ALIGNED } else { BLOCK_VERBATIM };
    w.write_bits(block_type as u32, 3);
    w.write_bits32(src.len() as u32, 24);
    if use_aligned {
        for &l in &aligned_lengths {
            w.write_bits(l as u32, 3);
        }
    }
    write_tree_lengths(&mut w, &main_lengths[..256]);
    write_tree_lengths(&mut w, &main_lengths[256..]);
    write_tree_lengths(&mut w, &len_lengths);

    for token in &tokens {
        match *token {
            Token::Literal(b) => main_enc.write_symbol(&mut w, b as usize),
            Token::Match { length, slot, extra } => {
                let length = length as usize;
                let slot = slot as usize;
                let length_header = (length - MIN_MATCH).min(7);
                main_enc.write_symbol(&mut w, 256 + (slot << 3) + length_header);
                if length_header == 7 {
                    len_enc.write_symbol(&mut w, length - 9);
                }
                if slot >= 3 {
                    let footer = FOOTER_BITS[slot];
                    if use_aligned && footer >= 3 {
                        w.write_bits(extra >> 3, footer - 3);
                        aligned_enc.write_symbol(&mut w, (extra & 7) as usize);
                    } else {
                        w.write_bits32(extra, footer);
                    }
                }
            }
        }
        if w.len() >= src.len() {
            return None;
        }
    }

    let out = w.finish();
    if out.len() < src.len() {
        dst.extend_from_slice(&out);
        Some(out.len())
    } else {
        None
    }
}

/// Pretree-encode one run of tree lengths (previous lengths are all zero at
/// the start of a chunk, so deltas reduce to `(17 - len) % 17`).
fn write_tree_lengths(w: &mut BitWriter, lengths: &[u8]) {
    // Build the pretree symbol stream with zero-run coding.
    let mut stream: Vec<(u16, u8, u8)> = Vec::new(); // (sym, extra, extra_bits)
    let mut freqs = vec![0u32; PRETREE_SYMS];
    let mut i = 0;
    while i < lengths.len() {
        if lengths[i] == 0 {
            let mut run = 1;
            while i + run < lengths.len() && lengths[i + run] == 0 {
                run += 1;
            }
            let mut left = run;
            while left >= 20 {
                let take = left.min(51);
                stream.push((18, (take - 20) as u8, 5));
                left -= take;
            }
            while left >= 4 {
                // Code 17 carries a 4-bit count biased by 4: runs of 4-19.
                let take = left.min(19);
                stream.push((17, (take - 4) as u8, 4));
                left -= take;
            }
            for _ in 0..left {
                stream.push((0, 0, 0));
            }
            i += run;
        } else {
            let code = (17 - lengths[i] as u16) % 17;
            stream.push((code, 0, 0));
            i += 1;
        }
    }
    for &(sym, _, _) in &stream {
        freqs[sym as usize] += 1;
    }

    let pre_lengths = build_lengths(&freqs, MAX_PRETREE_LEN);
    let pre_enc = HuffmanEncoder::from_lengths(&pre_lengths);
    for &l in &pre_lengths {
        w.write_bits(l as u32, 4);
    }
    for &(sym, extra, extra_bits) in &stream {
        pre_enc.write_symbol(w, sym as usize);
        if extra_bits > 0 {
            w.write_bits(extra as u32, extra_bits);
        }
    }
}
