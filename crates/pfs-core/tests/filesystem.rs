//! End-to-end scenarios over a formatted filesystem.

use pfs_block::{FileBlockDevice, MemBlockDevice};
use pfs_core::{Filesystem, ROOT_INO};
use pfs_error::PfsError;
use pfs_types::{FileKind, BLOCK_SIZE, DEVICE_SIZE, DIRENTRY_SIZE};

fn fresh_fs() -> Filesystem {
    let dev = MemBlockDevice::new((DEVICE_SIZE / u64::from(BLOCK_SIZE)) as u32, BLOCK_SIZE);
    Filesystem::format(Box::new(dev)).unwrap()
}

#[test]
fn format_produces_expected_geometry() {
    let fs = fresh_fs();
    let sb = fs.superblock();

    assert_eq!(sb.data_blocks, 921);
    assert_eq!(sb.num_groups, 1);
    assert_eq!(sb.used_inodes, 1);
    // one group bitmap plus the root's first data block
    assert_eq!(sb.used_blocks, 2);

    assert_eq!(fs.lookup("/").unwrap(), ROOT_INO);
    let root = fs.stat("/").unwrap();
    assert_eq!(root.kind, FileKind::Directory);
    assert_eq!(root.links, 2);
    assert_eq!(root.size, 2 * DIRENTRY_SIZE as u64);
    assert_eq!(root.perms, 0o755);

    let entries = fs.readdir("/").unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, [".", ".."]);
    assert!(entries.iter().all(|e| e.ino == ROOT_INO));
}

#[test]
fn write_and_read_back_pattern() {
    let mut fs = fresh_fs();
    fs.create("/a").unwrap();

    let data = vec![0x5Au8; 5000];
    assert_eq!(fs.write("/a", &data, 0).unwrap(), 5000);
    assert_eq!(fs.stat("/a").unwrap().size, 5000);

    let mut back = vec![0u8; 5000];
    assert_eq!(fs.read("/a", &mut back, 0).unwrap(), 5000);
    assert_eq!(back, data);

    // a short read past end-of-file
    let mut tail = vec![0u8; 100];
    assert_eq!(fs.read("/a", &mut tail, 4990).unwrap(), 10);
}

#[test]
fn create_unlink_restores_counters() {
    let mut fs = fresh_fs();
    let inodes_before = fs.superblock().used_inodes;
    let blocks_before = fs.superblock().used_blocks;

    let first = fs.create("/x").unwrap();
    fs.write("/x", &[1u8; 9000], 0).unwrap();
    fs.unlink("/x").unwrap();

    assert_eq!(fs.superblock().used_inodes, inodes_before);
    assert_eq!(fs.superblock().used_blocks, blocks_before);
    assert!(matches!(fs.lookup("/x"), Err(PfsError::NotFound(_))));

    // the freed number is the next one handed out
    assert_eq!(fs.create("/y").unwrap(), first);
}

#[test]
fn rmdir_frees_nested_tree() {
    let mut fs = fresh_fs();
    let inodes_before = fs.superblock().used_inodes;
    let blocks_before = fs.superblock().used_blocks;

    fs.mkdir("/d").unwrap();
    fs.create("/d/x").unwrap();
    fs.mkdir("/d/e").unwrap();
    fs.create("/d/e/y").unwrap();
    fs.write("/d/e/y", &[7u8; 5000], 0).unwrap();

    fs.rmdir("/d").unwrap();
    assert!(matches!(fs.lookup("/d"), Err(PfsError::NotFound(_))));
    assert!(matches!(fs.lookup("/d/x"), Err(PfsError::NotFound(_))));
    assert_eq!(fs.superblock().used_inodes, inodes_before);
    assert_eq!(fs.superblock().used_blocks, blocks_before);
    assert_eq!(fs.stat("/").unwrap().links, 2);
}

#[test]
fn hard_links_share_an_inode() {
    let mut fs = fresh_fs();
    fs.create("/a").unwrap();
    fs.write("/a", b"shared bytes", 0).unwrap();

    fs.link("/a", "/b").unwrap();
    assert_eq!(fs.stat("/a").unwrap().links, 2);
    assert_eq!(fs.stat("/a").unwrap().ino, fs.stat("/b").unwrap().ino);

    fs.unlink("/a").unwrap();
    let survivor = fs.stat("/b").unwrap();
    assert_eq!(survivor.links, 1);

    let mut buf = vec![0u8; 12];
    assert_eq!(fs.read("/b", &mut buf, 0).unwrap(), 12);
    assert_eq!(&buf, b"shared bytes");

    let inodes_before = fs.superblock().used_inodes;
    fs.unlink("/b").unwrap();
    assert_eq!(fs.superblock().used_inodes, inodes_before - 1);
}

#[test]
fn truncate_shrinks_and_grows() {
    let mut fs = fresh_fs();
    fs.create("/f").unwrap();
    fs.write("/f", &vec![0xEEu8; 10000], 0).unwrap();

    fs.truncate("/f", 3000).unwrap();
    assert_eq!(fs.stat("/f").unwrap().size, 3000);

    fs.truncate("/f", 8000).unwrap();
    assert_eq!(fs.stat("/f").unwrap().size, 8000);

    let mut back = vec![0u8; 8000];
    fs.read("/f", &mut back, 0).unwrap();
    assert!(back[..3000].iter().all(|&b| b == 0xEE));
    assert!(back[3000..].iter().all(|&b| b == 0));
}

#[test]
fn rename_moves_between_directories() {
    let mut fs = fresh_fs();
    fs.mkdir("/src").unwrap();
    fs.mkdir("/dst").unwrap();
    fs.create("/src/f").unwrap();
    fs.write("/src/f", b"cargo", 0).unwrap();

    fs.rename("/src/f", "/dst/g").unwrap();
    assert!(matches!(fs.lookup("/src/f"), Err(PfsError::NotFound(_))));
    let mut buf = vec![0u8; 5];
    assert_eq!(fs.read("/dst/g", &mut buf, 0).unwrap(), 5);
    assert_eq!(&buf, b"cargo");
}

#[test]
fn rename_directory_keeps_contents() {
    let mut fs = fresh_fs();
    fs.mkdir("/a").unwrap();
    fs.mkdir("/b").unwrap();
    fs.mkdir("/a/sub").unwrap();
    fs.create("/a/sub/file").unwrap();

    fs.rename("/a/sub", "/b/moved").unwrap();
    assert!(fs.lookup("/b/moved/file").is_ok());
    assert_eq!(fs.stat("/a").unwrap().links, 2);
    assert_eq!(fs.stat("/b").unwrap().links, 3);
}

#[test]
fn symlink_roundtrip() {
    let mut fs = fresh_fs();
    fs.create("/target").unwrap();
    fs.symlink("/target", "/alias").unwrap();

    assert_eq!(fs.stat("/alias").unwrap().kind, FileKind::Symlink);
    assert_eq!(fs.read_link("/alias").unwrap(), "/target");
    assert!(fs.read_link("/target").is_err());
}

#[test]
fn chmod_chown_utimens() {
    let mut fs = fresh_fs();
    fs.create("/f").unwrap();

    fs.chmod("/f", 0o640).unwrap();
    let stat = fs.stat("/f").unwrap();
    assert_eq!(stat.perms, 0o640);
    assert_eq!(stat.kind, FileKind::Regular);

    fs.chown("/f", 1000, 100).unwrap();
    let stat = fs.stat("/f").unwrap();
    assert_eq!((stat.uid, stat.gid), (1000, 100));

    fs.utimens("/f", 11, 22).unwrap();
    let stat = fs.stat("/f").unwrap();
    assert_eq!((stat.atime, stat.mtime), (11, 22));
}

#[test]
fn statfs_tracks_usage() {
    let mut fs = fresh_fs();
    let before = fs.statfs();
    assert_eq!(before.total_blocks, 921);
    assert_eq!(before.used_inodes, 1);

    fs.create("/f").unwrap();
    fs.write("/f", &vec![1u8; 4096 * 3], 0).unwrap();
    let after = fs.statfs();
    assert_eq!(after.used_inodes, 2);
    assert_eq!(after.used_blocks, before.used_blocks + 3);
    assert_eq!(after.free_blocks + after.used_blocks, after.total_blocks);
}

#[test]
fn io_on_directories_is_rejected() {
    let mut fs = fresh_fs();
    fs.mkdir("/d").unwrap();
    let mut buf = vec![0u8; 10];
    assert!(matches!(
        fs.read("/d", &mut buf, 0),
        Err(PfsError::IsDirectory)
    ));
    assert!(matches!(
        fs.write("/d", &buf, 0),
        Err(PfsError::IsDirectory)
    ));
    assert!(matches!(
        fs.truncate("/d", 0),
        Err(PfsError::IsDirectory)
    ));
}

#[test]
fn format_open_cycle_preserves_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pocket.img");

    {
        let dev = FileBlockDevice::create(&path, DEVICE_SIZE, BLOCK_SIZE).unwrap();
        let mut fs = Filesystem::format(Box::new(dev)).unwrap();
        fs.mkdir("/docs").unwrap();
        fs.create("/docs/readme").unwrap();
        fs.write("/docs/readme", b"persisted across mounts", 0).unwrap();
        fs.sync().unwrap();
    }

    let dev = FileBlockDevice::open(&path, BLOCK_SIZE).unwrap();
    let fs = Filesystem::open(Box::new(dev)).unwrap();
    assert_eq!(fs.superblock().used_inodes, 3);

    let mut buf = vec![0u8; 23];
    assert_eq!(fs.read("/docs/readme", &mut buf, 0).unwrap(), 23);
    assert_eq!(&buf, b"persisted across mounts");
}

#[test]
fn open_rejects_unformatted_device() {
    let dev = MemBlockDevice::new(1024, BLOCK_SIZE);
    assert!(matches!(
        Filesystem::open(Box::new(dev)),
        Err(PfsError::Corruption { block: 0, .. })
    ));
}

#[test]
fn device_fills_up_with_no_space() {
    // tiny device: 64 blocks of 512 B => 57 data blocks, 1 bitmap
    let dev = MemBlockDevice::new(64, 512);
    let mut fs = Filesystem::format(Box::new(dev)).unwrap();
    fs.create("/big").unwrap();

    let free = u64::from(fs.statfs().free_blocks);
    let chunk = vec![0xABu8; 512];
    for i in 0..free {
        fs.write("/big", &chunk, i * 512).unwrap();
    }
    assert!(matches!(
        fs.write("/big", &chunk, free * 512),
        Err(PfsError::NoSpace)
    ));
}
