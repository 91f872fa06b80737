//! Archive-level tests for features the POSIX back-end cannot produce:
//! alternate data streams, short names, and security descriptors are built
//! synthetically and pushed through serialization, reopen, and apply.

use std::collections::BTreeMap;

use wimcore::tree::{
    ATTR_DIRECTORY, ATTR_HIDDEN, ATTR_NORMAL,
};
use wimcore::{
    ApplyOptions, CodecKind, ErrorKind, FileTree, ImageInfo, Inode, OpenOptions, SecurityTable,
    Stream, StreamKind, WimFile,
};
use wimcore::backend::posix::PosixTarget;
use wimcore::tree::FileTimes;

/// A file with unnamed stream "U" and a named ADS "meta" -> "M", plus a
/// short name and a security descriptor.
fn build_image(archive: &mut WimFile) -> u32 {
    let mut tree = FileTree::new(FileTimes::now());
    let mut security = SecurityTable::new();

    let sd = {
        let mut d = vec![0u8; 20];
        d[0] = 1;
        d
    };
    let sid = security.intern(&sd);

    let u = archive.intern_blob(b"U");
    let m = archive.intern_blob(b"M");

    let mut inode = Inode::new(ATTR_NORMAL | ATTR_HIDDEN, FileTimes::now());
    inode.security_id = sid;
    inode.streams.push(Stream {
        kind: StreamKind::Data,
        hash: Some(u),
    });
    inode.streams.push(Stream {
        kind: StreamKind::Named("meta".into()),
        hash: Some(m),
    });
    let i = tree.add_inode(inode);
    let d = tree.add_child(FileTree::ROOT, "payload.dat".into(), i).unwrap();
    tree.dentries[d].short_name = Some("PAYLOA~1.DAT".into());

    let dir = tree.add_inode(Inode::new(ATTR_DIRECTORY, FileTimes::now()));
    tree.add_child(FileTree::ROOT, "docs".into(), dir).unwrap();

    let info = ImageInfo {
        name: "synthetic".into(),
        description: Some("built in memory".into()),
        file_count: 1,
        dir_count: 2,
        total_bytes: 2,
        creation_time: FileTimes::now().creation,
        extra: BTreeMap::new(),
    };
    archive.add_image_parts(tree, security, info).unwrap()
}

#[test]
fn ads_image_survives_write_and_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let wim = tmp.path().join("ads.wim");

    let mut archive = WimFile::create(&wim, CodecKind::Lzx).unwrap();
    build_image(&mut archive);
    archive.write().unwrap();

    let archive = WimFile::open_with(&wim, OpenOptions::strict()).unwrap();
    assert_eq!(archive.image_count(), 1);
    assert_eq!(archive.blob_table().len(), 2);

    let image = archive.image(1).unwrap();
    assert_eq!(image.info.name, "synthetic");
    assert_eq!(image.info.description.as_deref(), Some("built in memory"));

    let tree = &image.tree;
    let d = tree.lookup_path("/payload.dat").unwrap();
    let inode = &tree.inodes[tree.dentries[d].inode];
    assert_eq!(inode.named_streams().count(), 1);
    assert!(inode.attributes & ATTR_HIDDEN != 0);
    assert!(inode.security_id >= 0);
    assert_eq!(tree.dentries[d].short_name.as_deref(), Some("PAYLOA~1.DAT"));
    assert_eq!(
        image.security.get(inode.security_id).map(|s| s[0]),
        Some(1)
    );
}

#[test]
fn strict_apply_fails_on_missing_features_lenient_drops() {
    let tmp = tempfile::tempdir().unwrap();
    let wim = tmp.path().join("ads2.wim");

    let mut archive = WimFile::create(&wim, CodecKind::Xpress).unwrap();
    build_image(&mut archive);
    archive.write().unwrap();
    let mut archive = WimFile::open(&wim).unwrap();

    // Strict mode: POSIX targets lack named streams, short names, security,
    // and DOS attribute bits.
    let out = tmp.path().join("strict-out");
    let mut target = PosixTarget::new(&out);
    let err = archive
        .apply_image(
            1,
            &mut target,
            &ApplyOptions {
                strict: true,
                cancel: None,
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    // Lenient mode: the unnamed stream lands, the rest is dropped and
    // reported in the stats.
    let out = tmp.path().join("lenient-out");
    let mut target = PosixTarget::new(&out);
    let stats = archive
        .apply_image(1, &mut target, &ApplyOptions::default())
        .unwrap();
    assert_ne!(stats.dropped_features, 0);
    assert_eq!(std::fs::read(out.join("payload.dat")).unwrap(), b"U");
    assert!(out.join("docs").is_dir());
}

#[test]
fn boot_index_tracks_deletions() {
    let tmp = tempfile::tempdir().unwrap();
    let wim = tmp.path().join("boot.wim");

    let mut archive = WimFile::create(&wim, CodecKind::None).unwrap();
    // Two minimal images.
    for name in ["first", "second"] {
        let tree = FileTree::new(FileTimes::now());
        let info = ImageInfo {
            name: name.into(),
            ..ImageInfo::default()
        };
        archive
            .add_image_parts(tree, SecurityTable::new(), info)
            .unwrap();
    }
    archive.set_boot_index(2).unwrap();
    assert!(archive.set_boot_index(5).is_err());
    archive.write().unwrap();

    let mut archive = WimFile::open(&wim).unwrap();
    assert_eq!(archive.boot_index(), 2);
    archive.delete_image(1).unwrap();
    assert_eq!(archive.boot_index(), 1);
    archive.delete_image(1).unwrap();
    assert_eq!(archive.boot_index(), 0);
}

#[test]
fn cancellation_surfaces_cleanly() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir(&src).unwrap();
    std::fs::write(src.join("f"), vec![9u8; 200_000]).unwrap();

    let wim = tmp.path().join("cancel.wim");
    let mut archive = WimFile::create(&wim, CodecKind::Lzx).unwrap();
    let mut source = wimcore::backend::posix::PosixSource::new();
    archive
        .add_image(&mut source, &src, "img", &wimcore::CaptureConfig::new())
        .unwrap();
    archive.write().unwrap();

    let token = wimcore::CancelToken::new();
    token.cancel(); // pre-cancelled: the first chunk boundary returns
    let out = tmp.path().join("out");
    let mut target = PosixTarget::new(&out);
    let err = archive
        .apply_image(
            1,
            &mut target,
            &ApplyOptions {
                strict: false,
                cancel: Some(token),
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}
