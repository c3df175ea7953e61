//! End-to-end scenarios exercising the engine through the VFS, the way a caller actually would:
//! format a device, mount it, and drive `open`/`read`/`write`/`mkdir`/`unlink` against it.

use std::sync::Arc;

use ext2fs::block::mem::MemBlockDevice;
use ext2fs::errno::Errno;
use ext2fs::file::fd::OpenFlags;
use ext2fs::file::fs::ext2::{self, FormatOptions};
use ext2fs::file::path::Path;
use ext2fs::file::perm::AccessProfile;
use ext2fs::file::vfs::Vfs;
use ext2fs::file::FileType;

fn mounted(block_count: u64) -> Vfs {
	let device = Arc::new(MemBlockDevice::new(512, block_count));
	let fs = ext2::format(device, FormatOptions::default(), ext2::Ext2Config::default()).unwrap();
	let vfs = Vfs::new();
	vfs.mount_root(Arc::new(fs));
	vfs
}

#[test]
fn round_trips_a_small_file_through_open_write_read() {
	let vfs = mounted(2048);
	let profile = AccessProfile::ROOT;
	let path = Path::new("/greeting.txt").unwrap();

	let id = vfs
		.open(&path, None, &profile, OpenFlags::CREAT | OpenFlags::WRONLY, 0o644)
		.unwrap();
	let inode = vfs.inode(id).unwrap();
	inode.write_bytes(0, b"hello from ext2").unwrap();

	let mut buf = [0u8; 15];
	let n = inode.read_bytes(0, &mut buf).unwrap();
	assert_eq!(n, 15);
	assert_eq!(&buf, b"hello from ext2");
	assert_eq!(vfs.stat(&path, None, &profile).unwrap().size, 15);
}

#[test]
fn directory_create_and_remove_round_trips() {
	let vfs = mounted(2048);
	let profile = AccessProfile::ROOT;
	let dir = Path::new("/work").unwrap();

	vfs.mkdir(&dir, None, &profile, 0o755).unwrap();
	assert_eq!(
		vfs.stat(&dir, None, &profile).unwrap().mode & ext2fs::file::S_IFMT,
		ext2fs::file::S_IFDIR
	);

	let file = Path::new("/work/a.txt").unwrap();
	vfs.open(&file, None, &profile, OpenFlags::CREAT | OpenFlags::WRONLY, 0o600)
		.unwrap();

	// A non-empty directory refuses rmdir.
	assert_eq!(vfs.rmdir(&dir, None, &profile).unwrap_err(), Errno::NotEmpty);

	vfs.unlink(&file, None, &profile).unwrap();
	vfs.rmdir(&dir, None, &profile).unwrap();
	assert_eq!(vfs.stat(&dir, None, &profile).unwrap_err(), Errno::NotFound);
}

#[test]
fn a_write_spanning_a_block_boundary_reads_back_intact() {
	let vfs = mounted(2048);
	let profile = AccessProfile::ROOT;
	let path = Path::new("/spanning").unwrap();
	let id = vfs
		.open(&path, None, &profile, OpenFlags::CREAT | OpenFlags::WRONLY, 0o644)
		.unwrap();
	let inode = vfs.inode(id).unwrap();

	// The default format uses a 1024-byte block; start 4 bytes before the boundary so the
	// write straddles it.
	let data: Vec<u8> = (0..16u8).collect();
	inode.write_bytes(1020, &data).unwrap();

	let mut out = vec![0u8; data.len()];
	inode.read_bytes(1020, &mut out).unwrap();
	assert_eq!(out, data);
	assert_eq!(inode.stat().unwrap().size, 1020 + 16);
}

#[test]
fn a_file_growing_past_the_direct_blocks_uses_the_indirect_pointer() {
	let vfs = mounted(8192);
	let profile = AccessProfile::ROOT;
	let path = Path::new("/grows").unwrap();
	let id = vfs
		.open(&path, None, &profile, OpenFlags::CREAT | OpenFlags::WRONLY, 0o644)
		.unwrap();
	let inode = vfs.inode(id).unwrap();

	// 12 direct blocks of 1024 bytes each end at offset 12288; write past it.
	let offset = 13 * 1024u64;
	let data = vec![0x5au8; 64];
	inode.write_bytes(offset, &data).unwrap();

	let mut out = vec![0u8; data.len()];
	inode.read_bytes(offset, &mut out).unwrap();
	assert_eq!(out, data);
	assert_eq!(inode.stat().unwrap().size, offset + data.len() as u64);
}

#[test]
fn symlink_resolution_honors_nofollow_variants() {
	let vfs = mounted(2048);
	let profile = AccessProfile::ROOT;
	let target_path = Path::new("/real.txt").unwrap();
	vfs.open(&target_path, None, &profile, OpenFlags::CREAT | OpenFlags::WRONLY, 0o644)
		.unwrap();
	vfs.symlink(&Path::new("/alias").unwrap(), None, "real.txt", &profile)
		.unwrap();

	let alias = Path::new("/alias").unwrap();

	// Following resolution reaches the regular file.
	let followed = vfs.lookup(&alias, None, &profile, OpenFlags::empty()).unwrap();
	assert_eq!(
		vfs.inode(followed).unwrap().file_type().unwrap(),
		FileType::Regular
	);

	// O_NOFOLLOW_NOERROR returns the link itself.
	let unresolved = vfs
		.lookup(&alias, None, &profile, OpenFlags::NOFOLLOW_NOERROR)
		.unwrap();
	assert_eq!(
		vfs.inode(unresolved).unwrap().file_type().unwrap(),
		FileType::Link
	);

	// O_NOFOLLOW fails outright.
	assert_eq!(
		vfs.lookup(&alias, None, &profile, OpenFlags::NOFOLLOW).unwrap_err(),
		Errno::Loop
	);
}

#[test]
fn running_out_of_space_leaves_free_counts_unchanged() {
	// A tiny device: one group, few free blocks left after formatting.
	let vfs = mounted(64);
	let profile = AccessProfile::ROOT;
	let path = Path::new("/big").unwrap();
	let id = vfs
		.open(&path, None, &profile, OpenFlags::CREAT | OpenFlags::WRONLY, 0o644)
		.unwrap();
	let inode = vfs.inode(id).unwrap();

	// Try to write far more than the tiny device could ever hold.
	let huge = vec![0u8; 16 * 1024 * 1024];
	let err = inode.write_bytes(0, &huge).unwrap_err();
	assert_eq!(err, Errno::NoSpace);

	// The file must not have been left partially grown: a fresh lookup reports size 0 still,
	// since the engine never commits a size update before the backing blocks exist.
	assert_eq!(vfs.stat(&path, None, &profile).unwrap().size, 0);
}
