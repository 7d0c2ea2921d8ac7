//! Whole-filesystem tests: a fresh image is created in memory, mounted, and
//! driven through the public operations while the on-disk invariants
//! (bitmap popcounts vs. counters, record layouts, state flags) are checked
//! against raw device bytes.

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::bitmap;
use super::dir::RENAME_NOREPLACE;
use super::inode::EXT2_NDIR_BLOCKS;
use super::mkfs::{mkfs, MkfsOptions};
use super::{Ext2Directory, Ext2File, Ext2Fs, MountFlags};
use crate::errors::FsError;
use crate::fs::{FixedClock, FsFile, Seek, SetAttr};
use crate::io::{BlockDevice, MemDisk};

const TEST_TIME: u32 = 1_000_000;

/// 8 MiB image, 1024-byte blocks, one group, 2048 inodes.
fn fresh_image() -> Arc<dyn BlockDevice> {
    let dev: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(8192 * 1024));
    let opts = MkfsOptions {
        block_size: 1024,
        inodes_per_group: 2048,
        uuid: *b"0123456789abcdef",
        ..Default::default()
    };
    mkfs(&dev, &opts, &FixedClock(TEST_TIME)).unwrap();
    dev
}

fn mount(dev: &Arc<dyn BlockDevice>) -> Arc<Ext2Fs> {
    Ext2Fs::mount(
        dev.clone(),
        "",
        MountFlags::EMPTY,
        Arc::new(FixedClock(TEST_TIME)),
    )
    .unwrap()
}

fn fresh_fs() -> (Arc<dyn BlockDevice>, Arc<Ext2Fs>) {
    let dev = fresh_image();
    let fs = mount(&dev);
    (dev, fs)
}

/// Asserts that every bitmap popcount agrees with its descriptor counter
/// and that the descriptor sums match the global counters.
fn assert_counters_consistent(fs: &Arc<Ext2Fs>) {
    let sbi = &fs.sbi;
    let mut free_blocks = 0u64;
    let mut free_inodes = 0u64;

    for group in 0..sbi.groups_count {
        let desc = *fs.groups.get(group).unwrap().lock();

        let bh = fs.read_block_bitmap(group).unwrap();
        let zeros = bitmap::count_zeros(&bh.read(), sbi.group_block_span(group));
        assert_eq!(
            zeros,
            u32::from(desc.free_blocks_count()),
            "block bitmap of group {group} disagrees with its descriptor"
        );
        free_blocks += u64::from(zeros);

        let bh = fs.read_inode_bitmap(group).unwrap();
        let zeros = bitmap::count_zeros(&bh.read(), sbi.inodes_per_group);
        assert_eq!(
            zeros,
            u32::from(desc.free_inodes_count()),
            "inode bitmap of group {group} disagrees with its descriptor"
        );
        free_inodes += u64::from(zeros);
    }

    assert_eq!(free_blocks, fs.count_free_blocks());
    assert_eq!(free_inodes, fs.count_free_inodes());
    assert_eq!(free_blocks as i64, fs.free_blocks.sum());
    assert_eq!(free_inodes as i64, fs.free_inodes.sum());
}

fn read_bytes(dev: &Arc<dyn BlockDevice>, offset: u64, len: usize) -> Vec<u8> {
    let mut buf = alloc::vec![0u8; len];
    dev.read_at(offset, &mut buf).unwrap();
    buf
}

#[test]
fn fresh_image_mounts_with_expected_geometry() {
    let (dev, fs) = fresh_fs();

    let root = fs.root().unwrap();
    {
        let root = root.read();
        assert_eq!(root.ino, 2);
        assert_eq!(root.size, 1024);
        assert_eq!(root.links_count, 2);
    }

    // Layout: boot-pad + superblock + gdt + 2 bitmaps + 256 inode-table
    // blocks = 261 blocks of overhead, plus the root directory block.
    let stat = fs.statfs();
    assert_eq!(stat.block_size, 1024);
    assert_eq!(stat.blocks, 8192 - 261);
    assert_eq!(stat.bfree, 8192 - 261 - 1);
    assert_eq!(stat.files, 2048);
    assert_eq!(stat.ffree, 2048 - 10);

    // The root chunk holds `.` (rec_len 12) and `..` spanning the rest.
    let root_block = 261u64;
    let chunk = read_bytes(&dev, root_block * 1024, 24);
    assert_eq!(u32::from_le_bytes(chunk[0..4].try_into().unwrap()), 2);
    assert_eq!(u16::from_le_bytes(chunk[4..6].try_into().unwrap()), 12);
    assert_eq!(chunk[6], 1);
    assert_eq!(chunk[8], b'.');
    assert_eq!(u32::from_le_bytes(chunk[12..16].try_into().unwrap()), 2);
    assert_eq!(u16::from_le_bytes(chunk[16..18].try_into().unwrap()), 1012);
    assert_eq!(&chunk[20..22], b"..");

    assert_counters_consistent(&fs);
}

#[test]
fn first_create_takes_the_first_unreserved_inode() {
    let (_dev, fs) = fresh_fs();
    let root = fs.root().unwrap();
    let before = fs.statfs();

    let inode = fs.create(&root, b"hello", 0o644, 0, 0).unwrap();
    assert_eq!(inode.read().ino, 11);

    let mut file = Ext2File::open(fs.clone(), inode.clone()).unwrap();
    assert_eq!(file.write(&[0xAA; 1024]).unwrap(), 1024);

    {
        let inode = inode.read();
        assert_eq!(inode.size, 1024);
        // One 1024-byte block is two 512-byte units.
        assert_eq!(inode.blocks, 2);
        assert_ne!(inode.direct(0), 0);
        for slot in 1..EXT2_NDIR_BLOCKS {
            assert_eq!(inode.direct(slot), 0);
        }
    }

    file.seek(Seek::Backward(1024));
    let mut buf = [0u8; 1024];
    assert_eq!(file.read(&mut buf).unwrap(), 1024);
    assert_eq!(buf, [0xAA; 1024]);

    let after = fs.statfs();
    assert_eq!(after.bfree, before.bfree - 1);
    assert_eq!(after.ffree, before.ffree - 1);
    assert_counters_consistent(&fs);
}

#[test]
fn reads_and_writes_round_trip_at_odd_offsets() {
    let (_dev, fs) = fresh_fs();
    let root = fs.root().unwrap();
    let inode = fs.create(&root, b"data", 0o644, 0, 0).unwrap();
    let mut file = Ext2File::open(fs.clone(), inode).unwrap();

    let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
    assert_eq!(file.write(&payload).unwrap(), 3000);

    file.seek(Seek::Backward(3000));
    file.seek(Seek::Forward(100));
    let mut buf = alloc::vec![0u8; 200];
    assert_eq!(file.read(&mut buf).unwrap(), 200);
    assert_eq!(&buf[..], &payload[100..300]);

    // Reading past end-of-file is truncated to the file size.
    file.seek(Seek::Forward(usize::MAX));
    assert_eq!(file.read(&mut buf).unwrap(), 0);
}

#[test]
fn deleted_entries_merge_into_their_predecessor() {
    let (dev, fs) = fresh_fs();
    let root = fs.root().unwrap();

    let d = fs.mkdir(&root, b"d", 0o755, 0, 0).unwrap();
    fs.create(&d, b"a", 0o644, 0, 0).unwrap();
    fs.create(&d, b"b", 0o644, 0, 0).unwrap();

    let before = fs.statfs();
    fs.unlink(&d, b"a").unwrap();
    let after = fs.statfs();
    // `a` owned no blocks: only an inode goes back.
    assert_eq!(before.bfree, after.bfree);
    assert_eq!(after.ffree, before.ffree + 1);

    let (d_block, d_size) = {
        let d = d.read();
        (u64::from(d.direct(0)), d.size)
    };
    assert_eq!(d_size, 1024);

    fs.sync_fs(true).unwrap();
    let chunk = read_bytes(&dev, d_block * 1024, 48);
    // `.` keeps its minimal record.
    assert_eq!(u16::from_le_bytes(chunk[4..6].try_into().unwrap()), 12);
    assert_eq!(chunk[8], b'.');
    // `..` swallowed `a`'s slot.
    assert_eq!(u16::from_le_bytes(chunk[16..18].try_into().unwrap()), 24);
    // `b` still sits right after the merged span and runs to the chunk end.
    assert_eq!(u16::from_le_bytes(chunk[40..42].try_into().unwrap()), 988);
    assert_eq!(chunk[44], b'b');

    // The tombstoned name is gone from lookups.
    assert!(fs.lookup(&d, b"a").unwrap().is_none());
    assert!(fs.lookup(&d, b"b").unwrap().is_some());
    assert_counters_consistent(&fs);
}

#[test]
fn writes_stop_at_the_direct_block_limit() {
    let (_dev, fs) = fresh_fs();
    let root = fs.root().unwrap();
    let inode = fs.create(&root, b"big", 0o644, 0, 0).unwrap();
    let mut file = Ext2File::open(fs.clone(), inode.clone()).unwrap();

    let payload = alloc::vec![0x55u8; 12 * 1024];
    assert_eq!(file.write(&payload).unwrap(), 12 * 1024);
    assert_eq!(inode.read().blocks, 24);

    let before = fs.statfs();
    // The 13th block does not exist; nothing must be allocated.
    assert_eq!(file.write(&[0u8]).unwrap_err(), FsError::Invalid);
    let after = fs.statfs();
    assert_eq!(before.bfree, after.bfree);
    assert_eq!(inode.read().blocks, 24);
    assert_counters_consistent(&fs);
}

#[test]
fn truncate_is_idempotent() {
    let (_dev, fs) = fresh_fs();
    let root = fs.root().unwrap();
    let inode = fs.create(&root, b"t", 0o644, 0, 0).unwrap();
    let mut file = Ext2File::open(fs.clone(), inode.clone()).unwrap();
    file.write(&alloc::vec![1u8; 12 * 1024]).unwrap();

    file.truncate(5000).unwrap();
    let stat_once = fs.statfs();
    let blocks_once = inode.read().blocks;
    // 5000 bytes keep 5 blocks.
    assert_eq!(blocks_once, 10);

    file.truncate(5000).unwrap();
    assert_eq!(fs.statfs(), stat_once);
    assert_eq!(inode.read().blocks, blocks_once);

    // The tail of the kept range reads back as zeros after re-extension.
    file.extend(8000).unwrap();
    file.seek(Seek::Backward(usize::MAX));
    file.seek(Seek::Forward(4096));
    let mut buf = alloc::vec![0xFFu8; 1000];
    assert_eq!(file.read(&mut buf).unwrap(), 1000);
    assert!(buf.iter().take(904).all(|&b| b == 1));
    assert!(buf.iter().skip(904).all(|&b| b == 0));
    assert_counters_consistent(&fs);
}

#[test]
fn extending_leaves_readable_holes() {
    let (_dev, fs) = fresh_fs();
    let root = fs.root().unwrap();
    let inode = fs.create(&root, b"holey", 0o644, 0, 0).unwrap();
    let mut file = Ext2File::open(fs.clone(), inode.clone()).unwrap();

    file.extend(5000).unwrap();
    assert_eq!(inode.read().blocks, 0);

    file.seek(Seek::Forward(4096));
    file.write(b"data").unwrap();
    // Only the written block was allocated.
    assert_eq!(inode.read().blocks, 2);

    file.seek(Seek::Backward(usize::MAX));
    let mut buf = alloc::vec![0xFFu8; 256];
    file.read(&mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));

    file.seek(Seek::Backward(usize::MAX));
    file.seek(Seek::Forward(4096));
    let mut buf = [0u8; 4];
    file.read(&mut buf).unwrap();
    assert_eq!(&buf, b"data");
}

#[test]
fn inode_exhaustion_reports_no_space_and_leaves_files_intact() {
    let (_dev, fs) = fresh_fs();
    let root = fs.root().unwrap();
    let initial_free = fs.statfs().ffree;

    let mut created = 0u64;
    'outer: for d in 0..16 {
        let dir = match fs.mkdir(&root, format!("dir{d}").as_bytes(), 0o755, 0, 0) {
            Ok(dir) => dir,
            Err(FsError::NoSpace) => break,
            Err(err) => panic!("mkdir failed: {err:?}"),
        };
        created += 1;
        for i in 0..255 {
            match fs.create(&dir, format!("f{i}").as_bytes(), 0o644, 0, 0) {
                Ok(_) => created += 1,
                Err(FsError::NoSpace) => break 'outer,
                Err(err) => panic!("create failed: {err:?}"),
            }
        }
    }

    assert_eq!(created, initial_free);
    assert_eq!(fs.statfs().ffree, 0);
    assert_eq!(
        fs.create(&root, b"one-too-many", 0o644, 0, 0).unwrap_err(),
        FsError::NoSpace
    );

    // Every inode bit is taken.
    let bh = fs.read_inode_bitmap(0).unwrap();
    assert_eq!(bitmap::count_zeros(&bh.read(), fs.sbi.inodes_per_group), 0);

    // Earlier files are still reachable.
    let dir0 = fs.lookup(&root, b"dir0").unwrap().unwrap();
    assert!(fs.lookup(&dir0, b"f0").unwrap().is_some());
    assert_counters_consistent(&fs);
}

#[test]
fn duplicate_names_are_rejected_and_the_inode_recovered() {
    let (_dev, fs) = fresh_fs();
    let root = fs.root().unwrap();

    fs.create(&root, b"dup", 0o644, 0, 0).unwrap();
    let before = fs.statfs();
    assert_eq!(
        fs.create(&root, b"dup", 0o644, 0, 0).unwrap_err(),
        FsError::Exists
    );
    assert_eq!(fs.statfs(), before);
    assert_counters_consistent(&fs);
}

#[test]
fn mkdir_rmdir_leaves_counters_unchanged() {
    let (_dev, fs) = fresh_fs();
    let root = fs.root().unwrap();
    let before = fs.statfs();
    let root_links = root.read().links_count;

    let p = fs.mkdir(&root, b"p", 0o755, 0, 0).unwrap();
    assert_eq!(root.read().links_count, root_links + 1);
    assert_eq!(p.read().links_count, 2);
    fs.release(p).unwrap();

    fs.rmdir(&root, b"p").unwrap();
    assert_eq!(root.read().links_count, root_links);
    assert_eq!(fs.statfs(), before);
    assert!(fs.lookup(&root, b"p").unwrap().is_none());
    assert_counters_consistent(&fs);
}

#[test]
fn rmdir_refuses_populated_directories() {
    let (_dev, fs) = fresh_fs();
    let root = fs.root().unwrap();

    let d = fs.mkdir(&root, b"full", 0o755, 0, 0).unwrap();
    fs.create(&d, b"kid", 0o644, 0, 0).unwrap();

    assert_eq!(fs.rmdir(&root, b"full").unwrap_err(), FsError::NotEmpty);
    fs.unlink(&d, b"kid").unwrap();
    fs.rmdir(&root, b"full").unwrap();
}

#[test]
fn renaming_a_directory_rewires_its_parent_link() {
    let (_dev, fs) = fresh_fs();
    let root = fs.root().unwrap();

    let a = fs.mkdir(&root, b"a", 0o755, 0, 0).unwrap();
    let b = fs.mkdir(&root, b"b", 0o755, 0, 0).unwrap();
    let root_links = root.read().links_count;
    let b_links = b.read().links_count;
    let a_links = a.read().links_count;
    let (a_ino, b_ino) = (a.read().ino, b.read().ino);

    fs.rename(&root, b"a", &b, b"a", 0).unwrap();

    assert_eq!(root.read().links_count, root_links - 1);
    assert_eq!(b.read().links_count, b_links + 1);
    assert_eq!(a.read().links_count, a_links);

    assert!(fs.lookup(&root, b"a").unwrap().is_none());
    let moved = fs.lookup(&b, b"a").unwrap().unwrap();
    assert_eq!(moved.read().ino, a_ino);

    // `..` inside the moved directory now names the new parent.
    let entries: Vec<_> = Ext2Directory::open(fs.clone(), moved)
        .unwrap()
        .map(|e| e.unwrap())
        .collect();
    let dotdot = entries.iter().find(|e| e.name == b"..").unwrap();
    assert_eq!(dotdot.inode, b_ino);
    assert_counters_consistent(&fs);
}

#[test]
fn rename_replaces_and_releases_the_displaced_inode() {
    let (_dev, fs) = fresh_fs();
    let root = fs.root().unwrap();

    let x = fs.create(&root, b"x", 0o644, 0, 0).unwrap();
    let x_ino = x.read().ino;
    fs.release(x).unwrap();
    fs.create(&root, b"y", 0o644, 0, 0)
        .map(|inode| fs.release(inode).unwrap())
        .unwrap();
    let before = fs.statfs();

    fs.rename(&root, b"x", &root, b"y", 0).unwrap();

    assert!(fs.lookup(&root, b"x").unwrap().is_none());
    let y = fs.lookup(&root, b"y").unwrap().unwrap();
    assert_eq!(y.read().ino, x_ino);

    // The displaced inode went back to the allocator.
    assert_eq!(fs.statfs().ffree, before.ffree + 1);
    assert_counters_consistent(&fs);
}

#[test]
fn rename_noreplace_refuses_existing_targets() {
    let (_dev, fs) = fresh_fs();
    let root = fs.root().unwrap();

    fs.create(&root, b"src", 0o644, 0, 0).unwrap();
    fs.create(&root, b"dst", 0o644, 0, 0).unwrap();
    assert_eq!(
        fs.rename(&root, b"src", &root, b"dst", RENAME_NOREPLACE)
            .unwrap_err(),
        FsError::Exists
    );
    // Both names survive the refused rename.
    assert!(fs.lookup(&root, b"src").unwrap().is_some());
    assert!(fs.lookup(&root, b"dst").unwrap().is_some());
}

#[test]
fn rename_back_and_forth_restores_the_directory_bytes() {
    let (dev, fs) = fresh_fs();
    let root = fs.root().unwrap();

    fs.create(&root, b"aaa", 0o644, 0, 0).unwrap();
    fs.create(&root, b"zzz", 0o644, 0, 0).unwrap();
    fs.sync_fs(true).unwrap();

    let root_block = u64::from(root.read().direct(0));
    let before = read_bytes(&dev, root_block * 1024, 1024);

    fs.rename(&root, b"aaa", &root, b"ccc", 0).unwrap();
    fs.rename(&root, b"ccc", &root, b"aaa", 0).unwrap();
    fs.sync_fs(true).unwrap();

    // The live records (`.`, `..`, `aaa`, `zzz` and their lengths) are
    // restored exactly. Bytes past the last live header may keep the ghost
    // of the transient name, as merged tails are never scrubbed.
    let after = read_bytes(&dev, root_block * 1024, 1024);
    assert_eq!(before[..48], after[..48]);
    assert!(fs.lookup(&root, b"aaa").unwrap().is_some());
    assert!(fs.lookup(&root, b"ccc").unwrap().is_none());
    assert!(fs.lookup(&root, b"zzz").unwrap().is_some());
}

#[test]
fn symlink_storage_switches_on_target_length() {
    let (_dev, fs) = fresh_fs();
    let root = fs.root().unwrap();
    let before = fs.statfs();

    // Up to 60 bytes the target lives in the inode itself.
    let short = [b's'; 60];
    let link = fs.symlink(&root, b"short", &short, 0, 0).unwrap();
    assert_eq!(link.read().blocks, 0);
    assert!(link.read().is_fast_symlink());
    assert_eq!(fs.readlink(&link).unwrap(), short);
    assert_eq!(fs.statfs().bfree, before.bfree);

    // Longer targets take a data block.
    let long = [b'l'; 61];
    let link = fs.symlink(&root, b"long", &long, 0, 0).unwrap();
    assert_eq!(link.read().blocks, 2);
    assert!(!link.read().is_fast_symlink());
    assert_eq!(fs.readlink(&link).unwrap(), long);
    assert_eq!(fs.statfs().bfree, before.bfree - 1);

    // A full block still fits, one byte more does not.
    let max = [b'm'; 1024];
    fs.symlink(&root, b"max", &max, 0, 0).unwrap();
    assert_eq!(
        fs.symlink(&root, b"over", &[b'o'; 1025], 0, 0).unwrap_err(),
        FsError::NameTooLong
    );
    assert_counters_consistent(&fs);
}

#[test]
fn hard_links_share_an_inode() {
    let (_dev, fs) = fresh_fs();
    let root = fs.root().unwrap();

    let target = fs.create(&root, b"orig", 0o644, 0, 0).unwrap();
    fs.link(&root, b"alias", &target).unwrap();
    assert_eq!(target.read().links_count, 2);

    let alias = fs.lookup(&root, b"alias").unwrap().unwrap();
    assert!(Arc::ptr_eq(&alias, &target));

    fs.unlink(&root, b"orig").unwrap();
    assert_eq!(target.read().links_count, 1);
    assert!(fs.lookup(&root, b"alias").unwrap().is_some());
}

#[test]
fn unlinked_inodes_are_destroyed_on_last_release() {
    let (dev, fs) = fresh_fs();
    let root = fs.root().unwrap();
    let before = fs.statfs();

    let inode = fs.create(&root, b"doomed", 0o644, 0, 0).unwrap();
    let mut file = Ext2File::open(fs.clone(), inode.clone()).unwrap();
    file.write(&[9u8; 2048]).unwrap();
    drop(file);

    fs.unlink(&root, b"doomed").unwrap();
    // Still alive: the handle keeps it open.
    assert_eq!(fs.statfs().bfree, before.bfree - 2);

    fs.release(inode).unwrap();
    assert_eq!(fs.statfs(), before);
    fs.sync_fs(true).unwrap();

    // The on-disk record carries a deletion timestamp and its bitmap bit
    // is clear again (inode 11 is bit 10).
    let slot = read_bytes(&dev, 5 * 1024 + 10 * 128, 128);
    let dtime = u32::from_le_bytes(slot[20..24].try_into().unwrap());
    assert_eq!(dtime, TEST_TIME);
    let ibitmap = read_bytes(&dev, 4 * 1024, 2);
    assert_eq!(ibitmap[1] & 0b0000_0100, 0);
    assert_counters_consistent(&fs);
}

#[test]
fn contents_survive_a_remount() {
    let dev = fresh_image();
    let fs = mount(&dev);
    let root = fs.root().unwrap();

    let inode = fs.create(&root, b"persist", 0o640, 7, 42).unwrap();
    let mut file = Ext2File::open(fs.clone(), inode).unwrap();
    file.write(b"still here after remount").unwrap();
    drop(file);

    fs.sync_fs(true).unwrap();
    // A mounted journal-less filesystem is dirty by definition.
    let state = read_bytes(&dev, 1024 + 58, 2);
    assert_eq!(u16::from_le_bytes(state.try_into().unwrap()), 0);

    fs.unmount().unwrap();
    let state = read_bytes(&dev, 1024 + 58, 2);
    assert_eq!(u16::from_le_bytes(state.try_into().unwrap()), 1);
    drop(fs);

    let fs = mount(&dev);
    let root = fs.root().unwrap();
    let inode = fs.lookup(&root, b"persist").unwrap().unwrap();
    {
        let inode = inode.read();
        assert_eq!(inode.uid, 7);
        assert_eq!(inode.gid, 42);
    }
    let mut file = Ext2File::open(fs.clone(), inode).unwrap();
    let mut buf = [0u8; 24];
    assert_eq!(file.read(&mut buf).unwrap(), 24);
    assert_eq!(&buf, b"still here after remount");
    assert_counters_consistent(&fs);
}

#[test]
fn sync_fs_is_idempotent() {
    let (dev, fs) = fresh_fs();
    let root = fs.root().unwrap();
    fs.create(&root, b"file", 0o644, 0, 0).unwrap();

    fs.sync_fs(true).unwrap();
    let first = read_bytes(&dev, 0, 512 * 1024);
    fs.sync_fs(true).unwrap();
    let second = read_bytes(&dev, 0, 512 * 1024);
    assert_eq!(first, second);
}

#[test]
fn read_only_mounts_refuse_mutation() {
    let dev = fresh_image();
    let fs = Ext2Fs::mount(
        dev.clone(),
        "errors=continue",
        MountFlags::RDONLY,
        Arc::new(FixedClock(TEST_TIME)),
    )
    .unwrap();
    let root = fs.root().unwrap();

    assert_eq!(
        fs.create(&root, b"nope", 0o644, 0, 0).unwrap_err(),
        FsError::ReadOnly
    );
    assert_eq!(fs.unlink(&root, b"nope").unwrap_err(), FsError::ReadOnly);
    assert_eq!(fs.show_options(), ",errors=continue");

    // Remounting read-write lifts the restriction.
    fs.remount(MountFlags::EMPTY, "").unwrap();
    assert!(fs.create(&root, b"yes", 0o644, 0, 0).is_ok());
}

#[test]
fn readdir_keeps_its_footing_across_mutations() {
    let (_dev, fs) = fresh_fs();
    let root = fs.root().unwrap();
    for i in 0..6 {
        fs.create(&root, format!("c{i}").as_bytes(), 0o644, 0, 0)
            .unwrap();
    }

    let mut iter = Ext2Directory::open(fs.clone(), root.clone()).unwrap();
    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(iter.next().unwrap().unwrap());
    }

    // Mutate the directory mid-iteration; the cursor revalidates.
    fs.create(&root, b"late", 0o644, 0, 0).unwrap();
    fs.unlink(&root, b"c4").unwrap();
    for entry in iter {
        seen.push(entry.unwrap());
    }

    assert!(seen.iter().all(|e| e.inode != 0));
    assert!(seen.iter().any(|e| e.name == b"."));
    assert!(seen.iter().any(|e| e.name == b"c0"));
    assert!(!seen.iter().any(|e| e.name == b"c4"));
}

#[test]
fn setattr_updates_metadata_and_size() {
    let (_dev, fs) = fresh_fs();
    let root = fs.root().unwrap();
    let inode = fs.create(&root, b"attrs", 0o644, 0, 0).unwrap();
    let mut file = Ext2File::open(fs.clone(), inode.clone()).unwrap();
    file.write(&[3u8; 3000]).unwrap();

    fs.setattr(
        &inode,
        &SetAttr {
            mode: Some(0o600),
            uid: Some(100),
            size: Some(1000),
            ..Default::default()
        },
    )
    .unwrap();

    let stat = fs.getattr(&inode);
    assert_eq!(stat.mode & 0o7777, 0o600);
    assert_eq!(stat.uid, 100);
    assert_eq!(stat.size, 1000);
    assert_eq!(stat.blocks, 2);
    assert_counters_consistent(&fs);
}

#[test]
fn mknod_stores_device_numbers() {
    let (_dev, fs) = fresh_fs();
    let root = fs.root().unwrap();

    let rdev = (8u32 << 20) | 1;
    let node = fs
        .mknod(
            &root,
            b"disk0",
            super::inode::FileMode(super::inode::FileMode::S_IFBLK | 0o660),
            rdev,
            0,
            0,
        )
        .unwrap();
    assert_eq!(node.read().device(), rdev);

    // Special files carry no data blocks.
    assert_eq!(node.read().blocks, 0);
}
