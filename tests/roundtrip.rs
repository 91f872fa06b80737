//! End-to-end capture → write → open → apply round trips on real
//! directories, exercising the whole stack through the public API.

use std::fs;
use std::path::Path;

use wimcore::backend::posix::{PosixSource, PosixTarget};
use wimcore::{
    sha1_of, ApplyOptions, CaptureConfig, CodecKind, ErrorKind, OpenOptions, WimFile,
};

fn capture_to_wim(src: &Path, wim: &Path, codec: CodecKind, name: &str) -> WimFile {
    let mut archive = WimFile::create(wim, codec).unwrap();
    let mut source = PosixSource::new();
    archive
        .add_image(&mut source, src, name, &CaptureConfig::new())
        .unwrap();
    archive.write().unwrap();
    archive
}

fn assert_trees_equal(a: &Path, b: &Path) {
    let mut names_a: Vec<_> = fs::read_dir(a).unwrap().map(|e| e.unwrap().file_name()).collect();
    let mut names_b: Vec<_> = fs::read_dir(b).unwrap().map(|e| e.unwrap().file_name()).collect();
    names_a.sort();
    names_b.sort();
    assert_eq!(names_a, names_b, "directory listing differs at {a:?}");
    for name in names_a {
        let pa = a.join(&name);
        let pb = b.join(&name);
        let ma = fs::symlink_metadata(&pa).unwrap();
        let mb = fs::symlink_metadata(&pb).unwrap();
        assert_eq!(ma.file_type().is_dir(), mb.file_type().is_dir(), "{pa:?}");
        assert_eq!(
            ma.file_type().is_symlink(),
            mb.file_type().is_symlink(),
            "{pa:?}"
        );
        if ma.file_type().is_dir() {
            assert_trees_equal(&pa, &pb);
        } else if ma.file_type().is_symlink() {
            assert_eq!(fs::read_link(&pa).unwrap(), fs::read_link(&pb).unwrap());
        } else {
            assert_eq!(fs::read(&pa).unwrap(), fs::read(&pb).unwrap(), "{pa:?}");
        }
    }
}

#[test]
fn single_tiny_file() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir(&src).unwrap();
    fs::write(src.join("hello.txt"), b"hello").unwrap();

    let wim = tmp.path().join("t.wim");
    let mut archive = capture_to_wim(&src, &wim, CodecKind::Lzx, "tiny");
    assert_eq!(archive.image_count(), 1);
    assert_eq!(archive.blob_table().len(), 1);
    let hash = sha1_of(b"hello");
    assert_eq!(archive.read_blob(&hash).unwrap(), b"hello");

    let out = tmp.path().join("out");
    let mut target = PosixTarget::new(&out);
    archive
        .apply_image(1, &mut target, &ApplyOptions::default())
        .unwrap();
    assert_eq!(fs::read(out.join("hello.txt")).unwrap(), b"hello");
}

#[test]
fn deduplication_of_identical_files() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir(&src).unwrap();
    let payload = vec![0x5au8; 10 * 1024];
    for i in 0..1000 {
        fs::write(src.join(format!("copy{i:04}")), &payload).unwrap();
    }

    let wim = tmp.path().join("d.wim");
    let archive = capture_to_wim(&src, &wim, CodecKind::Xpress, "dedup");
    assert_eq!(archive.blob_table().len(), 1);
    let blob = archive.blob_table().iter().next().unwrap();
    assert_eq!(blob.refcount, 1000);

    // Dedup + compression keep the archive within 110% of one stored copy
    // plus metadata, nowhere near 1000 copies.
    let size = fs::metadata(&wim).unwrap().len();
    assert!(size < 512 * 1024, "archive unexpectedly large: {size}");
}

#[test]
fn hard_links_restore_as_one_inode() {
    use std::os::unix::fs::MetadataExt;

    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir_all(src.join("a")).unwrap();
    fs::write(src.join("a/x"), b"linked contents").unwrap();
    fs::hard_link(src.join("a/x"), src.join("a/y")).unwrap();

    let wim = tmp.path().join("h.wim");
    let mut archive = capture_to_wim(&src, &wim, CodecKind::Lzx, "links");
    assert_eq!(archive.blob_table().len(), 1);
    {
        let tree = &archive.image(1).unwrap().tree;
        let x = tree.lookup_path("/a/x").unwrap();
        let y = tree.lookup_path("/a/y").unwrap();
        assert_eq!(tree.dentries[x].inode, tree.dentries[y].inode);
    }

    let out = tmp.path().join("out");
    let mut target = PosixTarget::new(&out);
    let stats = archive
        .apply_image(1, &mut target, &ApplyOptions::default())
        .unwrap();
    assert_eq!(stats.link_count, 1);
    let mx = fs::metadata(out.join("a/x")).unwrap();
    let my = fs::metadata(out.join("a/y")).unwrap();
    assert_eq!(mx.ino(), my.ino());
}

#[test]
fn mixed_tree_roundtrip_with_symlinks_and_empty_files() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir_all(src.join("nested/deeper")).unwrap();
    fs::write(src.join("empty"), b"").unwrap();
    fs::write(src.join("nested/data.bin"), vec![3u8; 100_000]).unwrap();
    fs::write(
        src.join("nested/deeper/text.txt"),
        b"some text that compresses",
    )
    .unwrap();
    std::os::unix::fs::symlink("../data.bin", src.join("nested/deeper/link")).unwrap();

    for codec in [CodecKind::None, CodecKind::Xpress, CodecKind::Lzx] {
        let wim = tmp.path().join(format!("m-{}.wim", codec.name()));
        let mut archive = capture_to_wim(&src, &wim, codec, "mixed");
        let out = tmp.path().join(format!("out-{}", codec.name()));
        let mut target = PosixTarget::new(&out);
        archive
            .apply_image(1, &mut target, &ApplyOptions::default())
            .unwrap();
        assert_trees_equal(&src, &out);
    }
}

#[test]
fn chunk_boundary_file_sizes() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir(&src).unwrap();
    let exact: Vec<u8> = (0..32768u32).map(|i| (i % 251) as u8).collect();
    let over: Vec<u8> = (0..32769u32).map(|i| (i % 241) as u8).collect();
    fs::write(src.join("exact"), &exact).unwrap();
    fs::write(src.join("over"), &over).unwrap();

    let wim = tmp.path().join("b.wim");
    let mut archive = capture_to_wim(&src, &wim, CodecKind::Lzx, "boundaries");

    let exact_blob = archive.blob_table().lookup(&sha1_of(&exact)).unwrap();
    assert_eq!(exact_blob.entry.chunk_count(), 1);
    assert_eq!(exact_blob.entry.chunk_table_size(), 0);
    let over_blob = archive.blob_table().lookup(&sha1_of(&over)).unwrap();
    assert_eq!(over_blob.entry.chunk_count(), 2);
    assert_eq!(over_blob.entry.chunk_table_size(), 4);
    assert_eq!(over_blob.entry.chunk_original_size(1), 1);

    assert_eq!(archive.read_blob(&sha1_of(&exact)).unwrap(), exact);
    assert_eq!(archive.read_blob(&sha1_of(&over)).unwrap(), over);
}

#[test]
fn concurrent_shared_reads_through_the_handle_pool() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir(&src).unwrap();
    let payloads: Vec<Vec<u8>> = (0..8u8)
        .map(|i| format!("payload number {i} ").repeat(4000).into_bytes())
        .collect();
    for (i, p) in payloads.iter().enumerate() {
        fs::write(src.join(format!("f{i}")), p).unwrap();
    }

    let wim = tmp.path().join("p.wim");
    let archive = capture_to_wim(&src, &wim, CodecKind::Lzx, "pooled");

    std::thread::scope(|s| {
        for p in &payloads {
            let archive = &archive;
            s.spawn(move || {
                let got = archive.read_blob_shared(&sha1_of(p)).unwrap();
                assert_eq!(&got, p);
            });
        }
    });
}

#[test]
fn corrupt_chunk_fails_blob_reads() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir(&src).unwrap();
    let data: Vec<u8> = b"compressible compressible compressible "
        .iter()
        .copied()
        .cycle()
        .take(120_000)
        .collect();
    fs::write(src.join("victim"), &data).unwrap();

    let wim = tmp.path().join("c.wim");
    let archive = capture_to_wim(&src, &wim, CodecKind::Lzx, "corrupt");
    let entry = archive.blob_table().lookup(&sha1_of(&data)).unwrap().entry;
    drop(archive);

    // Flip one byte inside the first compressed chunk's body.
    let mut raw = fs::read(&wim).unwrap();
    let victim = (entry.offset + entry.chunk_table_size() + 4) as usize;
    raw[victim] ^= 0x20;
    fs::write(&wim, &raw).unwrap();

    let mut archive = WimFile::open(&wim).unwrap();
    let err = archive.read_blob(&sha1_of(&data)).unwrap_err();
    assert!(
        matches!(
            err.kind(),
            ErrorKind::DecompressionFailed | ErrorKind::InvalidResourceHash
        ),
        "unexpected error: {err}"
    );

    // Strict verify must also notice.
    assert!(WimFile::open_with(&wim, OpenOptions::strict())
        .and_then(|mut a| a.verify().map(|_| ()))
        .is_err());
}

#[test]
fn random_access_into_incompressible_blob() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir(&src).unwrap();
    let mut x = 0x9E3779B97F4A7C15u64;
    let data: Vec<u8> = (0..2 * 1024 * 1024)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            (x >> 56) as u8
        })
        .collect();
    fs::write(src.join("blob.bin"), &data).unwrap();

    let wim = tmp.path().join("r.wim");
    let archive = capture_to_wim(&src, &wim, CodecKind::Xpress, "random");
    let entry = archive.blob_table().lookup(&sha1_of(&data)).unwrap().entry;
    // Incompressible content: stored size is table + raw chunks.
    assert_eq!(
        entry.size_in_wim,
        entry.chunk_table_size() + data.len() as u64
    );
    drop(archive);

    let mut file = fs::File::open(&wim).unwrap();
    let codec = wimcore::codec::get_codec(CodecKind::Xpress).unwrap();
    let mut out = vec![0u8; 1024];
    let offset = 1_500_000u64;
    wimcore::resource::read_compressed(&mut file, &wim, &entry, codec, offset, &mut out).unwrap();
    assert_eq!(out, data[offset as usize..offset as usize + 1024]);
}

#[test]
fn append_delete_and_refcounts() {
    let tmp = tempfile::tempdir().unwrap();
    let src1 = tmp.path().join("one");
    let src2 = tmp.path().join("two");
    fs::create_dir(&src1).unwrap();
    fs::create_dir(&src2).unwrap();
    fs::write(src1.join("shared"), b"shared bytes").unwrap();
    fs::write(src2.join("shared"), b"shared bytes").unwrap();
    fs::write(src2.join("only2"), b"unique to two").unwrap();

    let wim = tmp.path().join("a.wim");
    let mut archive = capture_to_wim(&src1, &wim, CodecKind::Lzx, "one");
    let mut source = PosixSource::new();
    archive
        .add_image(&mut source, &src2, "two", &CaptureConfig::new())
        .unwrap();
    archive.write().unwrap();

    let mut archive = WimFile::open(&wim).unwrap();
    assert_eq!(archive.image_count(), 2);
    let shared = sha1_of(b"shared bytes");
    assert_eq!(archive.blob_table().lookup(&shared).unwrap().refcount, 2);

    // Images resolve by name, and name collisions are rejected.
    assert_eq!(archive.resolve_image("two").unwrap(), 2);
    let mut source = PosixSource::new();
    let err = archive
        .add_image(&mut source, &src1, "two", &CaptureConfig::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ImageNameCollision);

    // Deleting image 1 drops one reference; the orphaned unique blob of a
    // deleted image disappears after the next write.
    archive.delete_image(1).unwrap();
    archive.write().unwrap();
    let mut archive = WimFile::open(&wim).unwrap();
    assert_eq!(archive.image_count(), 1);
    assert_eq!(archive.blob_table().lookup(&shared).unwrap().refcount, 1);
    assert_eq!(archive.read_blob(&shared).unwrap(), b"shared bytes");
    assert!(archive.blob_table().lookup(&sha1_of(b"unique to two")).is_some());
}

#[test]
fn export_is_blob_identical_and_optimize_reclaims() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir(&src).unwrap();
    fs::write(src.join("a"), vec![1u8; 50_000]).unwrap();
    fs::write(src.join("b"), b"small").unwrap();

    let wim1 = tmp.path().join("src.wim");
    let mut archive = capture_to_wim(&src, &wim1, CodecKind::Lzx, "orig");

    // Export into a second archive.
    let wim2 = tmp.path().join("dst.wim");
    let mut dest = WimFile::create(&wim2, CodecKind::Xpress).unwrap();
    archive.export_image(1, &mut dest).unwrap();
    dest.write().unwrap();

    let mut dest = WimFile::open(&wim2).unwrap();
    let hashes: Vec<_> = archive.blob_table().iter().map(|b| b.hash).collect();
    for hash in hashes {
        let from_src = archive.read_blob(&hash).unwrap();
        let from_dst = dest.read_blob(&hash).unwrap();
        assert_eq!(from_src, from_dst, "blob bytes differ after export");
    }

    // Deleting the image then optimizing shrinks the file.
    let before = fs::metadata(&wim1).unwrap().len();
    archive.delete_image(1).unwrap();
    archive.write().unwrap();
    let saved = archive.optimize().unwrap();
    let after = fs::metadata(&wim1).unwrap().len();
    assert!(after < before, "optimize did not shrink {before} -> {after}");
    assert!(saved > 0);
    assert_eq!(archive.image_count(), 0);
}

#[test]
fn integrity_table_roundtrip_and_violation() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir(&src).unwrap();
    fs::write(src.join("f"), b"guarded by the integrity table").unwrap();

    let wim = tmp.path().join("i.wim");
    let mut archive = WimFile::create(&wim, CodecKind::Lzx).unwrap();
    archive.set_integrity(true);
    let mut source = PosixSource::new();
    archive
        .add_image(&mut source, &src, "guarded", &CaptureConfig::new())
        .unwrap();
    archive.write().unwrap();
    drop(archive);

    // Clean open with verification enabled passes.
    let opts = OpenOptions {
        check_integrity: true,
        ..OpenOptions::default()
    };
    WimFile::open_with(&wim, opts.clone()).unwrap();

    // Any flipped bit in the body fails the open.
    let mut raw = fs::read(&wim).unwrap();
    let mid = 300 + raw.len() / 2;
    let idx = mid.min(raw.len() - 30);
    raw[idx] ^= 0x01;
    fs::write(&wim, &raw).unwrap();
    assert!(WimFile::open_with(&wim, opts).is_err());
}

#[test]
fn split_produces_spanned_parts() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir(&src).unwrap();
    // Several incompressible blobs so the size cap forces multiple parts.
    let mut x = 77u64;
    for i in 0..6 {
        let data: Vec<u8> = (0..200_000)
            .map(|_| {
                x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (x >> 33) as u8
            })
            .collect();
        fs::write(src.join(format!("blob{i}")), &data).unwrap();
    }

    let wim = tmp.path().join("s.wim");
    let mut archive = capture_to_wim(&src, &wim, CodecKind::Lzx, "spanned");
    let parts = archive.split(400_000).unwrap();
    assert!(parts.len() >= 2, "expected multiple parts, got {parts:?}");
    for p in &parts {
        assert!(p.exists());
    }

    // Part 1 carries the image metadata and the full content map.
    let part1 = WimFile::open(&parts[0]).unwrap();
    assert_eq!(part1.image_count(), 1);
    assert_eq!(part1.blob_table().len(), archive.blob_table().len());
}
