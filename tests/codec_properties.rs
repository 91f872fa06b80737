//! Round-trip laws for the chunk codecs, driven by proptest.
//!
//! For any byte sequence up to one chunk: either `compress` shrinks it and
//! `decompress` restores it bit-exactly, or `compress` declines and the
//! caller stores the bytes verbatim. Both outcomes are legal; corruption of
//! a compressed stream must fail cleanly, never panic.

use proptest::prelude::*;

use wimcore::codec::{get_codec, Codec, CodecKind, MAX_CHUNK};

fn roundtrip(codec: &dyn Codec, src: &[u8]) {
    let mut compressed = Vec::new();
    match codec.compress(src, &mut compressed) {
        Some(n) => {
            assert!(n < src.len(), "compressed output must be strictly smaller");
            let mut out = vec![0u8; src.len()];
            codec
                .decompress(&compressed[..n], &mut out)
                .unwrap_or_else(|e| panic!("decompress failed on own output: {e}"));
            assert_eq!(out, src);
        }
        None => { /* stored verbatim by the resource layer */ }
    }
}

fn both_codecs() -> Vec<&'static dyn Codec> {
    vec![
        get_codec(CodecKind::Xpress).unwrap(),
        get_codec(CodecKind::Lzx).unwrap(),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn arbitrary_bytes_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..MAX_CHUNK)) {
        for codec in both_codecs() {
            roundtrip(codec, &data);
        }
    }

    #[test]
    fn repetitive_bytes_compress_and_roundtrip(
        seed in proptest::collection::vec(any::<u8>(), 1..64),
        reps in 64usize..512,
    ) {
        let data: Vec<u8> = seed.iter().copied().cycle().take(seed.len() * reps).collect();
        prop_assume!(data.len() <= MAX_CHUNK);
        for codec in both_codecs() {
            let mut compressed = Vec::new();
            // Highly repetitive input must actually compress.
            let n = codec.compress(&data, &mut compressed);
            if data.len() >= 2048 {
                prop_assert!(n.is_some(), "{:?} declined repetitive input", codec.kind());
            }
            roundtrip(codec, &data);
        }
    }

    #[test]
    fn corrupted_streams_never_panic(
        data in proptest::collection::vec(any::<u8>(), 512..8192),
        flip in any::<(usize, u8)>(),
    ) {
        let text: Vec<u8> = data
            .iter()
            .map(|&b| b % 32 + b'a') // compressible alphabet
            .collect();
        for codec in both_codecs() {
            let mut compressed = Vec::new();
            if let Some(n) = codec.compress(&text, &mut compressed) {
                let mut broken = compressed[..n].to_vec();
                let pos = flip.0 % broken.len();
                broken[pos] ^= flip.1 | 1;
                let mut out = vec![0u8; text.len()];
                // Either a clean error or a wrong buffer; never a panic.
                let _ = codec.decompress(&broken, &mut out);
            }
        }
    }

    #[test]
    fn truncated_streams_error(
        data in proptest::collection::vec(any::<u8>(), 2048..8192),
    ) {
        let text: Vec<u8> = data.iter().map(|&b| b % 16 + b'0').collect();
        for codec in both_codecs() {
            let mut compressed = Vec::new();
            if let Some(n) = codec.compress(&text, &mut compressed) {
                let mut out = vec![0u8; text.len()];
                prop_assert!(codec.decompress(&compressed[..n / 2], &mut out).is_err());
            }
        }
    }
}

#[test]
fn full_chunk_of_zeros_roundtrips() {
    for codec in both_codecs() {
        let data = vec![0u8; MAX_CHUNK];
        let mut compressed = Vec::new();
        let n = codec.compress(&data, &mut compressed).expect("zeros compress");
        assert!(n < 1024, "{:?}: zeros should compress drastically, got {n}", codec.kind());
        let mut out = vec![0u8; MAX_CHUNK];
        codec.decompress(&compressed[..n], &mut out).unwrap();
        assert_eq!(out, data);
    }
}
