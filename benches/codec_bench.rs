use criterion::{black_box, criterion_group, criterion_main, Criterion};

use wimcore::codec::{get_codec, CodecKind, MAX_CHUNK};

fn chunk_of_text() -> Vec<u8> {
    b"A capture pipeline streams source bytes through SHA-1 and the chunk codecs. "
        .iter()
        .copied()
        .cycle()
        .take(MAX_CHUNK)
        .collect()
}

fn bench_codecs(c: &mut Criterion) {
    let data = chunk_of_text();
    for kind in [CodecKind::Xpress, CodecKind::Lzx] {
        let codec = get_codec(kind).unwrap();
        let mut compressed = Vec::new();
        let n = codec.compress(&data, &mut compressed).expect("text compresses");

        c.bench_function(&format!("{}_compress_32k", kind.name()), |b| {
            let mut out = Vec::new();
            b.iter(|| codec.compress(black_box(&data), &mut out))
        });
        c.bench_function(&format!("{}_decompress_32k", kind.name()), |b| {
            let mut out = vec![0u8; MAX_CHUNK];
            b.iter(|| codec.decompress(black_box(&compressed[..n]), &mut out))
        });
    }
}

criterion_group!(benches, bench_codecs);
criterion_main!(benches);
