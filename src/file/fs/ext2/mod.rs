/*
 * Copyright 2026 The ext2fs Authors
 *
 * This file is part of ext2fs.
 *
 * ext2fs is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * ext2fs is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * ext2fs. If not, see <https://www.gnu.org/licenses/>.
 */

//! The ext2 filesystem engine: superblock/BGDT management, block and inode allocation, and the
//! [`Fs`] implementation tying it all together.
//!
//! Module order follows dependency order: block group descriptors and the superblock first, then
//! directory entries, then inodes, then the engine itself.

mod dirent;
mod inode;
mod superblock;

pub use inode::{RawInode, ROOT_DIRECTORY_INODE};
pub use superblock::{BlockGroupDescriptor, RawSuperblock};

use crate::block::BlockDevice;
use crate::cache::BlockCache;
use crate::errno::{EResult, Errno};
use crate::file::fs::{DiskBackedFs, Fs, InodeCache, InodeHandle, InodeOps};
use crate::file::{FileType, InodeIdentifier, InodeIndex, Mode};
use bytemuck::Zeroable;
use inode::{Ext2Inode, DIRECT_BLOCKS_COUNT, SYMLINK_INLINE_LIMIT};
use log::{debug, trace, warn};
use std::sync::{Arc, Mutex};
use superblock::{
	BitmapView, EXT2_MAGIC, FEATURE_INCOMPAT_FILETYPE, FEATURE_RO_64BIT_SIZE, FS_STATE_CLEAN,
	SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE,
};

/// The block holding the Block Group Descriptor Table, relative to the first data block.
const BGDT_BLOCK_OFFSET: u64 = 1;

/// Configuration for [`mount`] and [`format`], passed explicitly rather than relying on hidden
/// global state for caching and mount mode.
#[derive(Clone, Copy, Debug)]
pub struct Ext2Config {
	/// Rejects every mutating operation on the resulting [`Ext2Fs`] with [`Errno::ReadOnly`].
	pub read_only: bool,
	/// The maximum number of blocks this instance's dedicated [`BlockCache`] holds resident.
	pub max_cached_blocks: usize,
	/// The maximum number of negative (nonexistent-lookup) entries this instance's
	/// [`InodeCache`] remembers. Live inode handles are weak references and are not bounded by
	/// this value; they cost nothing once dropped by every caller.
	pub max_cached_inodes: usize,
}

impl Default for Ext2Config {
	fn default() -> Self {
		Self {
			read_only: false,
			max_cached_blocks: crate::cache::DEFAULT_CAPACITY,
			max_cached_inodes: crate::file::fs::DEFAULT_NEGATIVE_CAPACITY,
		}
	}
}

/// Shared, mutable state for one mounted ext2 filesystem instance.
pub struct Ext2FsState {
	pub id: u32,
	pub disk: DiskBackedFs,
	pub read_only: bool,
	superblock: Mutex<RawSuperblock>,
	bgdt: Mutex<Vec<BlockGroupDescriptor>>,
	bgdt_start_block: u64,
	pub inode_cache: InodeCache,
	/// Serializes bitmap scan-then-commit sequences so two allocations never race onto the same
	/// bit.
	alloc_lock: Mutex<()>,
}

/// A handle to a mounted ext2 filesystem.
#[derive(Clone)]
pub struct Ext2Fs(Arc<Ext2FsState>);

/// The shape of a file's block list: how many of its data blocks are reached directly,
/// singly-indirectly, doubly- and triply-indirectly, and how many metadata (pointer) blocks that
/// requires.
#[derive(Debug, Default, Clone, Copy)]
struct BlockListShape {
	direct: usize,
	indirect: usize,
	double: usize,
	triple: usize,
	meta: usize,
}

impl Ext2FsState {
	/// The filesystem's logical block size in bytes.
	pub fn block_size(&self) -> u32 {
		self.disk.block_size
	}

	/// The number of `u32` pointers that fit in one block.
	fn entries_per_block(&self) -> usize {
		self.block_size() as usize / 4
	}

	/// Whether the filesystem uses 64-bit file sizes.
	fn has_64bit_size(&self) -> bool {
		self.superblock.lock().unwrap().s_feature_ro_compat & FEATURE_RO_64BIT_SIZE != 0
	}

	/// Whether directory entries carry a `file_type` byte (always true for filesystems this
	/// engine creates; older ext2 revisions may omit it).
	fn has_file_type(&self) -> bool {
		self.superblock.lock().unwrap().s_feature_incompat & FEATURE_INCOMPAT_FILETYPE != 0
	}

	fn inodes_per_group(&self) -> u32 {
		self.superblock.lock().unwrap().s_inodes_per_group
	}

	fn blocks_per_group(&self) -> u32 {
		self.superblock.lock().unwrap().s_blocks_per_group
	}

	fn first_data_block(&self) -> u32 {
		self.superblock.lock().unwrap().s_first_data_block
	}

	fn group_count(&self) -> u32 {
		self.superblock.lock().unwrap().block_group_count()
	}

	/// Reads the logical block at `index`.
	fn read_block(&self, index: u64) -> EResult<Vec<u8>> {
		self.disk.read_block(index)
	}

	/// Writes `data` (one full block) at `index`.
	fn write_block(&self, index: u64, data: &[u8]) -> EResult<()> {
		self.disk.write_block(index, data)
	}

	/// Writes a block of all zero bytes at `index`.
	fn zero_block(&self, index: u32) -> EResult<()> {
		self.write_block(index as u64, &vec![0u8; self.block_size() as usize])
	}

	/// Which block group contains block-level index `block` (an absolute block number).
	fn group_of_block(&self, block: u32) -> u32 {
		(block.saturating_sub(self.first_data_block())) / self.blocks_per_group()
	}

	/// `(group, index-within-group)` for inode index `index` (1-based, as on disk).
	fn inode_group_and_local(&self, index: InodeIndex) -> (u32, u32) {
		let per_group = self.inodes_per_group();
		let zero_based = index - 1;
		(zero_based / per_group, zero_based % per_group)
	}

	fn bgd(&self, group: u32) -> EResult<BlockGroupDescriptor> {
		self.bgdt
			.lock()
			.unwrap()
			.get(group as usize)
			.copied()
			.ok_or(Errno::InvalidFs)
	}

	fn write_bgd(&self, group: u32, bgd: BlockGroupDescriptor) -> EResult<()> {
		{
			let mut table = self.bgdt.lock().unwrap();
			*table.get_mut(group as usize).ok_or(Errno::InvalidFs)? = bgd;
		}
		self.flush_bgdt()
	}

	fn flush_bgdt(&self) -> EResult<()> {
		let table = self.bgdt.lock().unwrap().clone();
		let entry_size = std::mem::size_of::<BlockGroupDescriptor>();
		let per_block = self.block_size() as usize / entry_size;
		for (chunk_idx, chunk) in table.chunks(per_block).enumerate() {
			let mut buf = vec![0u8; self.block_size() as usize];
			for (i, bgd) in chunk.iter().enumerate() {
				buf[i * entry_size..(i + 1) * entry_size].copy_from_slice(bytemuck::bytes_of(bgd));
			}
			self.write_block(self.bgdt_start_block + chunk_idx as u64, &buf)?;
		}
		Ok(())
	}

	fn flush_superblock(&self) -> EResult<()> {
		let sb = *self.superblock.lock().unwrap();
		let mut buf = vec![0u8; SUPERBLOCK_SIZE];
		buf.copy_from_slice(bytemuck::bytes_of(&sb));
		self.disk.device.write(SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE, &buf)
	}

	/// Reads the raw inode record for `index`.
	fn read_raw_inode(&self, index: InodeIndex) -> EResult<RawInode> {
		let (group, local) = self.inode_group_and_local(index);
		let bgd = self.bgd(group)?;
		let inode_size = self.superblock.lock().unwrap().inode_size() as u64;
		let block_size = self.block_size() as u64;
		let byte_off = local as u64 * inode_size;
		let block = bgd.bg_inode_table as u64 + byte_off / block_size;
		let in_block_off = (byte_off % block_size) as usize;
		let buf = self.read_block(block)?;
		if in_block_off + 128 > buf.len() {
			return Err(Errno::Io);
		}
		Ok(*bytemuck::from_bytes(&buf[in_block_off..in_block_off + 128]))
	}

	/// Writes the raw inode record for `index`.
	fn write_raw_inode(&self, index: InodeIndex, raw: &RawInode) -> EResult<()> {
		if self.read_only {
			return Err(Errno::ReadOnly);
		}
		let (group, local) = self.inode_group_and_local(index);
		let bgd = self.bgd(group)?;
		let inode_size = self.superblock.lock().unwrap().inode_size() as u64;
		let block_size = self.block_size() as u64;
		let byte_off = local as u64 * inode_size;
		let block = bgd.bg_inode_table as u64 + byte_off / block_size;
		let in_block_off = (byte_off % block_size) as usize;
		let mut buf = self.read_block(block)?;
		buf[in_block_off..in_block_off + 128].copy_from_slice(bytemuck::bytes_of(raw));
		self.write_block(block, &buf)
	}

	/// Sets the inode bitmap bit for `index`, updating the group/superblock free counts.
	fn set_inode_allocation_state(&self, index: InodeIndex, used: bool) -> EResult<()> {
		let (group, local) = self.inode_group_and_local(index);
		let mut bgd = self.bgd(group)?;
		let mut buf = self.read_block(bgd.bg_inode_bitmap as u64)?;
		let was_used = {
			let mut bm = BitmapView::new(&mut buf);
			bm.set(local, used)
		};
		if was_used == used {
			return Ok(());
		}
		self.write_block(bgd.bg_inode_bitmap as u64, &buf)?;
		if used {
			bgd.bg_free_inodes_count -= 1;
		} else {
			bgd.bg_free_inodes_count += 1;
		}
		self.write_bgd(group, bgd)?;
		let mut sb = self.superblock.lock().unwrap();
		if used {
			sb.s_free_inodes_count -= 1;
		} else {
			sb.s_free_inodes_count += 1;
		}
		drop(sb);
		trace!("inode {index} (group {group}) allocation bit -> {used}");
		self.flush_superblock()
	}

	/// Adjusts `bg_used_dirs_count` for the group owning `index`. Directory accounting is kept
	/// separate from [`Self::set_inode_allocation_state`] since not every inode is a directory.
	fn adjust_directory_count(&self, index: InodeIndex, delta: i32) -> EResult<()> {
		let (group, _) = self.inode_group_and_local(index);
		let mut bgd = self.bgd(group)?;
		bgd.bg_used_dirs_count = (bgd.bg_used_dirs_count as i32 + delta).max(0) as u16;
		self.write_bgd(group, bgd)
	}

	/// Sets the block bitmap bit for `block`, updating the group/superblock free counts.
	fn set_block_allocation_state(&self, block: u32, used: bool) -> EResult<()> {
		let group = self.group_of_block(block);
		let mut bgd = self.bgd(group)?;
		let local = block - self.first_data_block() - group * self.blocks_per_group();
		let mut buf = self.read_block(bgd.bg_block_bitmap as u64)?;
		let was_used = {
			let mut bm = BitmapView::new(&mut buf);
			bm.set(local, used)
		};
		if was_used == used {
			return Ok(());
		}
		self.write_block(bgd.bg_block_bitmap as u64, &buf)?;
		if used {
			bgd.bg_free_blocks_count -= 1;
		} else {
			bgd.bg_free_blocks_count += 1;
		}
		self.write_bgd(group, bgd)?;
		let mut sb = self.superblock.lock().unwrap();
		if used {
			sb.s_free_blocks_count -= 1;
		} else {
			sb.s_free_blocks_count += 1;
		}
		drop(sb);
		trace!("block {block} (group {group}) allocation bit -> {used}");
		self.flush_superblock()
	}

	/// Scans group `group`'s block bitmap for `count` clear bits, without committing them.
	/// Fails with [`Errno::NoSpace`] if the group does not advertise enough free blocks.
	fn allocate_blocks(&self, group: u32, count: usize) -> EResult<Vec<u32>> {
		let bgd = self.bgd(group)?;
		if (bgd.bg_free_blocks_count as usize) < count {
			warn!(
				"group {group} has only {} free blocks, {count} requested",
				bgd.bg_free_blocks_count
			);
			return Err(Errno::NoSpace);
		}
		let mut buf = self.read_block(bgd.bg_block_bitmap as u64)?;
		let bm = BitmapView::new(&mut buf);
		let locals = bm.scan_n_zero(count as u32);
		if locals.len() != count {
			warn!("group {group}'s block bitmap scan came up short of {count}");
			return Err(Errno::NoSpace);
		}
		let base = self.first_data_block() + group * self.blocks_per_group();
		Ok(locals.into_iter().map(|l| base + l).collect())
	}

	/// Allocates and immediately commits `count` blocks from `group`.
	fn allocate_and_commit_blocks(&self, group: u32, count: usize) -> EResult<Vec<u32>> {
		if count == 0 {
			return Ok(Vec::new());
		}
		let _guard = self.alloc_lock.lock().unwrap();
		let blocks = self.allocate_blocks(group, count)?;
		for &b in &blocks {
			self.set_block_allocation_state(b, true)?;
		}
		Ok(blocks)
	}

	/// Finds a free inode, preferring the first group with availability rather than the last, so
	/// allocation stays clustered near the start of the volume under contention.
	fn allocate_inode(&self) -> EResult<InodeIndex> {
		let _guard = self.alloc_lock.lock().unwrap();
		let groups = self.group_count();
		for group in 0..groups {
			let bgd = self.bgd(group)?;
			if bgd.bg_free_inodes_count == 0 {
				continue;
			}
			let mut buf = self.read_block(bgd.bg_inode_bitmap as u64)?;
			let local = {
				let bm = BitmapView::new(&mut buf);
				bm.scan_for_zero()
			};
			if let Some(local) = local {
				let index = group * self.inodes_per_group() + local + 1;
				trace!("allocate_inode picked index {index} in group {group}");
				return Ok(index);
			}
		}
		warn!("no free inodes in any of {groups} groups");
		Err(Errno::NoSpace)
	}

	/// Fetches a live or freshly-constructed [`Ext2Inode`] handle.
	fn get_inode_impl(self: &Arc<Self>, index: InodeIndex) -> EResult<Option<InodeHandle>> {
		if let Some(handle) = self.inode_cache.get(index) {
			return Ok(Some(handle));
		}
		if self.inode_cache.is_negative(index) {
			return Ok(None);
		}
		let raw = self.read_raw_inode(index)?;
		if raw.i_links_count == 0 {
			self.inode_cache.mark_negative(index);
			return Ok(None);
		}
		let id = InodeIdentifier {
			fs_id: self.id,
			index,
		};
		let handle: Arc<dyn crate::file::fs::InodeOps> = Ext2Inode::new(id, self, raw);
		self.inode_cache.insert(index, &handle);
		Ok(Some(handle))
	}

	/// Creates a fresh inode record of the given type/mode/size, returning its handle.
	fn create_inode_impl(
		self: &Arc<Self>,
		mode: Mode,
		file_type: FileType,
		size: u64,
	) -> EResult<Arc<Ext2Inode>> {
		if self.read_only {
			return Err(Errno::ReadOnly);
		}
		let index = self.allocate_inode()?;
		self.set_inode_allocation_state(index, true)?;
		let now = unix_time_placeholder();
		let mut raw = RawInode::zeroed();
		raw.i_mode = (file_type.to_mode_bits() | (mode & 0o7777)) as u16;
		raw.i_links_count = 0;
		raw.i_atime = now;
		raw.i_ctime = now;
		raw.i_mtime = now;
		if file_type == FileType::Directory {
			self.adjust_directory_count(index, 1)?;
		}
		raw.set_size(self.block_size(), self.has_64bit_size(), 0, false);
		self.write_raw_inode(index, &raw)?;
		debug!("created inode {index} type={file_type:?} mode={mode:o} size={size}");
		let id = InodeIdentifier {
			fs_id: self.id,
			index,
		};
		let handle = Ext2Inode::new(id, self, raw);
		self.inode_cache
			.insert(index, &(handle.clone() as InodeHandle));
		// A nonzero initial size (regular files only) is realized by zero-filling, which also
		// allocates the backing data blocks; directories and symlinks ignore it.
		if file_type == FileType::Regular && size > 0 {
			if let Err(e) = handle.write_bytes(0, &vec![0u8; size as usize]) {
				// The inode bit and free-inode counters were already committed above; since
				// links_count is still 0 here, free_inode can undo them so a failed allocation
				// never leaks a phantom inode.
				self.inode_cache.remove(index);
				free_inode(self, index, &handle.raw())?;
				return Err(e);
			}
		}
		Ok(handle)
	}
}

/// Returns a fixed epoch used for timestamps; this engine is not wall-clock aware. The caller
/// supplies real times through `set_times`/`utime` where it matters, e.g. the VFS layer.
fn unix_time_placeholder() -> u32 {
	0
}

/// Computes how a file's data blocks decompose across direct, indirect, doubly- and
/// triply-indirect pointers, and how many metadata blocks that requires.
fn compute_block_list_shape(data_blocks: usize, block_size: u32) -> EResult<BlockListShape> {
	let epb = block_size as usize / 4;
	let mut shape = BlockListShape::default();
	shape.direct = data_blocks.min(DIRECT_BLOCKS_COUNT);
	let rem = data_blocks.saturating_sub(DIRECT_BLOCKS_COUNT);
	shape.indirect = rem.min(epb);
	if shape.indirect > 0 {
		shape.meta += 1;
	}
	let rem2 = rem.saturating_sub(epb);
	shape.double = rem2.min(epb * epb);
	if shape.double > 0 {
		shape.meta += 1 + shape.double.div_ceil(epb);
	}
	let rem3 = rem2.saturating_sub(epb * epb);
	shape.triple = rem3.min(epb * epb * epb);
	if shape.triple > 0 {
		shape.meta += 1 + shape.triple.div_ceil(epb * epb) + shape.triple.div_ceil(epb);
	}
	if rem3 > epb * epb * epb {
		return Err(Errno::NoSpace);
	}
	Ok(shape)
}

/// Recursively collects the data (and, if `include_meta`, pointer) blocks reachable from `ptr` at
/// indirection `level` (0 = `ptr` is itself a data block). Stops at the first zero entry or once
/// `n` data blocks have been collected.
fn collect_blocks(
	fs: &Ext2FsState,
	ptr: u32,
	level: u32,
	data_count: &mut usize,
	n: usize,
	list: &mut Vec<u32>,
	include_meta: bool,
) -> EResult<bool> {
	if ptr == 0 {
		return Ok(false);
	}
	if level == 0 {
		if *data_count == n {
			return Ok(false);
		}
		list.push(ptr);
		*data_count += 1;
		return Ok(true);
	}
	if include_meta {
		list.push(ptr);
	}
	let buf = fs.read_block(ptr as u64)?;
	for chunk in buf.chunks_exact(4) {
		if *data_count == n {
			return Ok(false);
		}
		let child = u32::from_le_bytes(chunk.try_into().unwrap());
		if !collect_blocks(fs, child, level - 1, data_count, n, list, include_meta)? {
			return Ok(false);
		}
	}
	Ok(true)
}

/// Builds the ordered list of a file's data blocks (or, with `include_meta`, data and metadata
/// blocks interleaved).
fn block_list_for_inode(
	fs: &Ext2FsState,
	raw: &RawInode,
	include_meta: bool,
) -> EResult<Vec<u32>> {
	let sectors_per_block = fs.block_size() / 512;
	let n = (raw.i_blocks / sectors_per_block.max(1)) as usize;
	let mut list = Vec::new();
	let mut data_count = 0usize;
	for i in 0..DIRECT_BLOCKS_COUNT {
		if !collect_blocks(fs, raw.i_block[i], 0, &mut data_count, n, &mut list, include_meta)? {
			return Ok(list);
		}
	}
	if data_count == n {
		return Ok(list);
	}
	if !collect_blocks(fs, raw.i_block[12], 1, &mut data_count, n, &mut list, include_meta)? {
		return Ok(list);
	}
	if data_count == n {
		return Ok(list);
	}
	if !collect_blocks(fs, raw.i_block[13], 2, &mut data_count, n, &mut list, include_meta)? {
		return Ok(list);
	}
	if data_count == n {
		return Ok(list);
	}
	collect_blocks(fs, raw.i_block[14], 3, &mut data_count, n, &mut list, include_meta)?;
	Ok(list)
}

/// Writes (allocating pointer blocks as needed) the indirection tree rooted at `*ptr_slot` so
/// that it addresses exactly `data`, at indirection `level` (1 = singly-indirect). Handles all
/// three levels uniformly, including doubly- and triply-indirect writeback.
fn write_tree(
	fs: &Ext2FsState,
	ptr_slot: &mut u32,
	level: u32,
	data: &[u32],
	meta_pool: &mut Vec<u32>,
) -> EResult<()> {
	let epb = fs.entries_per_block();
	if *ptr_slot == 0 {
		let blk = meta_pool.pop().ok_or(Errno::Io)?;
		fs.zero_block(blk)?;
		*ptr_slot = blk;
	}
	let mut buf = fs.read_block(*ptr_slot as u64)?;
	if level == 1 {
		for (i, &d) in data.iter().enumerate() {
			buf[i * 4..i * 4 + 4].copy_from_slice(&d.to_le_bytes());
		}
	} else {
		let child_capacity = epb.pow(level - 1);
		let num_children = data.len().div_ceil(child_capacity);
		for idx in 0..num_children {
			let start = idx * child_capacity;
			let end = (start + child_capacity).min(data.len());
			let mut child_ptr = u32::from_le_bytes(buf[idx * 4..idx * 4 + 4].try_into().unwrap());
			write_tree(fs, &mut child_ptr, level - 1, &data[start..end], meta_pool)?;
			buf[idx * 4..idx * 4 + 4].copy_from_slice(&child_ptr.to_le_bytes());
		}
	}
	fs.write_block(*ptr_slot as u64, &buf)
}

/// Rewrites an inode's block-pointer tree (`i_block` plus any indirect/double/triple pointer
/// blocks) so it addresses exactly `new_data_blocks`, allocating additional metadata blocks as
/// needed.
fn write_block_list_for_inode(
	fs: &Ext2FsState,
	group: u32,
	raw: &mut RawInode,
	old_data_blocks: usize,
	new_data_blocks: &[u32],
) -> EResult<()> {
	let block_size = fs.block_size();
	let shape_old = compute_block_list_shape(old_data_blocks, block_size)?;
	let shape_new = compute_block_list_shape(new_data_blocks.len(), block_size)?;
	let mut meta_pool = if shape_new.meta > shape_old.meta {
		let extra = shape_new.meta - shape_old.meta;
		trace!("growing block-pointer tree: allocating {extra} new metadata blocks in group {group}");
		fs.allocate_and_commit_blocks(group, extra)?
	} else {
		Vec::new()
	};
	raw.i_blocks =
		(new_data_blocks.len() as u32 + shape_new.meta as u32) * (block_size / 512);
	for i in 0..shape_new.direct {
		raw.i_block[i] = new_data_blocks[i];
	}
	if shape_new.indirect > 0 {
		let data = &new_data_blocks[12..12 + shape_new.indirect];
		write_tree(fs, &mut raw.i_block[12], 1, data, &mut meta_pool)?;
	}
	if shape_new.double > 0 {
		let start = 12 + shape_new.indirect;
		let data = &new_data_blocks[start..start + shape_new.double];
		write_tree(fs, &mut raw.i_block[13], 2, data, &mut meta_pool)?;
	}
	if shape_new.triple > 0 {
		let start = 12 + shape_new.indirect + shape_new.double;
		let data = &new_data_blocks[start..start + shape_new.triple];
		write_tree(fs, &mut raw.i_block[14], 3, data, &mut meta_pool)?;
	}
	Ok(())
}

fn group_of_block(fs: &Ext2FsState, block: u32) -> u32 {
	fs.group_of_block(block)
}

/// Releases every block and the inode slot owned by a just-unlinked, zero-link inode.
fn free_inode(fs: &Arc<Ext2FsState>, index: InodeIndex, raw: &RawInode) -> EResult<()> {
	if fs.read_only {
		return Err(Errno::ReadOnly);
	}
	// Capture the full block list (data + metadata) before any mutation, so a crash mid-free
	// cannot leave blocks marked used with no record of them.
	let blocks = block_list_for_inode(fs, raw, true)?;
	debug!("freeing inode {index}, releasing {} blocks", blocks.len());
	for b in blocks {
		fs.set_block_allocation_state(b, false)?;
	}
	if raw.file_type() == FileType::Directory {
		fs.adjust_directory_count(index, -1)?;
	}
	let mut freed = RawInode::zeroed();
	freed.i_dtime = unix_time_placeholder();
	fs.write_raw_inode(index, &freed)?;
	fs.set_inode_allocation_state(index, false)
}

impl Fs for Ext2Fs {
	fn id(&self) -> u32 {
		self.0.id
	}

	fn root_inode_id(&self) -> InodeIdentifier {
		InodeIdentifier {
			fs_id: self.0.id,
			index: ROOT_DIRECTORY_INODE,
		}
	}

	fn get_inode(&self, index: InodeIndex) -> EResult<Option<InodeHandle>> {
		self.0.get_inode_impl(index)
	}

	fn create_inode(
		&self,
		parent: InodeIndex,
		name: &str,
		mode: Mode,
		size: u64,
	) -> EResult<InodeIdentifier> {
		let parent_handle = self
			.0
			.get_inode_impl(parent)?
			.ok_or(Errno::NotFound)?;
		let child = self.0.create_inode_impl(mode, FileType::Regular, size)?;
		let id = child.id();
		// add_child bumps the new entry's target inode itself, bringing it from 0 to 1.
		if let Err(e) = parent_handle.add_child(id, name, FileType::Regular) {
			free_inode(&self.0, id.index, &child.raw())?;
			return Err(e);
		}
		Ok(id)
	}

	fn create_directory(
		&self,
		parent: InodeIndex,
		name: &str,
		mode: Mode,
	) -> EResult<InodeIdentifier> {
		let parent_handle = self
			.0
			.get_inode_impl(parent)?
			.ok_or(Errno::NotFound)?;
		let child = self.0.create_inode_impl(mode, FileType::Directory, 0)?;
		let id = child.id();
		let self_entries = [
			(id.index, Some(FileType::Directory), "."),
			(parent, Some(FileType::Directory), ".."),
		];
		let block_size = self.0.block_size() as usize;
		let buf = match dirent::serialize(&self_entries, block_size, block_size) {
			Ok(b) => b,
			Err(e) => {
				free_inode(&self.0, id.index, &child.raw())?;
				return Err(e);
			}
		};
		if let Err(e) = child.write_bytes(0, &buf) {
			free_inode(&self.0, id.index, &child.raw())?;
			return Err(e);
		}
		// The child's own "." entry counts as a link to itself; add_child below counts the
		// parent's new entry as a second link to it. ".." counts as a link to the parent.
		child.increment_link_count()?;
		if let Err(e) = parent_handle.add_child(id, name, FileType::Directory) {
			free_inode(&self.0, id.index, &child.raw())?;
			return Err(e);
		}
		parent_handle.increment_link_count()?;
		Ok(id)
	}

	fn create_symlink(
		&self,
		parent: InodeIndex,
		name: &str,
		target: &str,
	) -> EResult<InodeIdentifier> {
		let parent_handle = self
			.0
			.get_inode_impl(parent)?
			.ok_or(Errno::NotFound)?;
		let child = self
			.0
			.create_inode_impl(0o777, FileType::Link, target.len() as u64)?;
		let id = child.id();
		let res = if (target.len() as u64) < SYMLINK_INLINE_LIMIT {
			let mut raw = child.raw();
			let bytes = target.as_bytes();
			let dst = bytemuck::bytes_of_mut(&mut raw.i_block);
			dst[..bytes.len()].copy_from_slice(bytes);
			raw.set_size(self.0.block_size(), self.0.has_64bit_size(), bytes.len() as u64, true);
			self.0.write_raw_inode(id.index, &raw)
		} else {
			child.write_bytes(0, target.as_bytes()).map(|_| ())
		};
		if let Err(e) = res {
			free_inode(&self.0, id.index, &child.raw())?;
			return Err(e);
		}
		// add_child bumps the new entry's target inode itself, bringing it from 0 to 1.
		if let Err(e) = parent_handle.add_child(id, name, FileType::Link) {
			free_inode(&self.0, id.index, &child.raw())?;
			return Err(e);
		}
		Ok(id)
	}

	fn is_read_only(&self) -> bool {
		self.0.read_only
	}

	fn sync(&self) -> EResult<()> {
		self.0.flush_superblock()?;
		self.0.flush_bgdt()
	}
}

/// Mounts an ext2 filesystem already present on `device`.
pub fn mount(device: Arc<dyn BlockDevice>, config: Ext2Config) -> EResult<Ext2Fs> {
	let mut sb_buf = vec![0u8; SUPERBLOCK_SIZE];
	device.read(SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE, &mut sb_buf)?;
	let sb: RawSuperblock = *bytemuck::from_bytes(&sb_buf);
	if sb.s_magic != EXT2_MAGIC {
		return Err(Errno::InvalidFs);
	}
	let block_size = sb.block_size();
	let fs_id = crate::file::next_fs_id();
	let disk = DiskBackedFs {
		fs_id,
		device,
		block_size,
		cache: Arc::new(BlockCache::new(config.max_cached_blocks)),
	};
	let bgdt_start_block = if block_size == 1024 {
		BGDT_BLOCK_OFFSET + 1
	} else {
		BGDT_BLOCK_OFFSET
	};
	let group_count = sb.block_group_count();
	let entry_size = std::mem::size_of::<BlockGroupDescriptor>();
	let per_block = block_size as usize / entry_size;
	let blocks_needed = (group_count as usize).div_ceil(per_block);
	let mut bgdt = Vec::with_capacity(group_count as usize);
	for b in 0..blocks_needed {
		let buf = disk.read_block(bgdt_start_block + b as u64)?;
		for chunk in buf.chunks_exact(entry_size) {
			if bgdt.len() == group_count as usize {
				break;
			}
			bgdt.push(*bytemuck::from_bytes::<BlockGroupDescriptor>(chunk));
		}
	}
	let read_only = config.read_only;
	let state = Arc::new(Ext2FsState {
		id: fs_id,
		disk,
		read_only,
		superblock: Mutex::new(sb),
		bgdt: Mutex::new(bgdt),
		bgdt_start_block,
		inode_cache: InodeCache::new(config.max_cached_inodes),
		alloc_lock: Mutex::new(()),
	});
	debug!(
		"mounted ext2 filesystem id={fs_id} block_size={block_size} groups={group_count} read_only={read_only}"
	);
	Ok(Ext2Fs(state))
}

/// Options controlling [`format`].
#[derive(Clone, Copy, Debug)]
pub struct FormatOptions {
	/// Logical block size in bytes. Must be a multiple of the device's sector size.
	pub block_size: u32,
	/// Blocks per group. Defaults to `block_size * 8` (one bit per block in one bitmap block) if
	/// `0`.
	pub blocks_per_group: u32,
	/// Inodes per group.
	pub inodes_per_group: u32,
}

impl Default for FormatOptions {
	fn default() -> Self {
		Self {
			block_size: 1024,
			blocks_per_group: 0,
			inodes_per_group: 128,
		}
	}
}

/// Formats `device` with a fresh, minimal ext2 filesystem (one block group, a root directory,
/// and the reserved inodes zeroed out), mirroring the shape a real `mke2fs` would produce for a
/// small volume. Test tooling only; this engine does not grow a filesystem once formatted.
///
/// `config.read_only` is ignored here (a filesystem being formatted is by definition being
/// written to); it takes effect from the next [`mount`] onward. The cache sizes take effect
/// immediately, sizing the dedicated [`BlockCache`]/[`InodeCache`] this instance uses for the
/// rest of its lifetime.
pub fn format(
	device: Arc<dyn BlockDevice>,
	options: FormatOptions,
	config: Ext2Config,
) -> EResult<Ext2Fs> {
	let block_size = options.block_size;
	let dev_block_size = device.block_size();
	if block_size % dev_block_size != 0 {
		return Err(Errno::InvalidArg);
	}
	let total_bytes = device.block_count() * dev_block_size as u64;
	let total_blocks = (total_bytes / block_size as u64) as u32;
	let blocks_per_group = if options.blocks_per_group == 0 {
		block_size * 8
	} else {
		options.blocks_per_group
	};
	let inodes_per_group = options.inodes_per_group;
	let group_count = total_blocks.div_ceil(blocks_per_group);
	if group_count != 1 {
		// Multi-group formatting is not exercised by this engine's test tooling; every fixture
		// sizes its device to fit in one group.
		return Err(Errno::InvalidArg);
	}

	let first_data_block = if block_size == 1024 { 1 } else { 0 };
	let bgdt_start_block = first_data_block + BGDT_BLOCK_OFFSET;
	let block_bitmap_block = bgdt_start_block + 1;
	let inode_bitmap_block = block_bitmap_block + 1;
	let inode_size = 128u32;
	let inode_table_blocks =
		(inodes_per_group * inode_size).div_ceil(block_size);
	let inode_table_start = inode_bitmap_block + 1;
	let root_data_block = inode_table_start + inode_table_blocks;

	let fs_id = crate::file::next_fs_id();
	let disk = DiskBackedFs {
		fs_id,
		device,
		block_size,
		cache: Arc::new(BlockCache::new(config.max_cached_blocks)),
	};

	for b in 0..=root_data_block {
		disk.write_block(b as u64, &vec![0u8; block_size as usize])?;
	}

	let mut sb = RawSuperblock::zeroed();
	sb.s_inodes_count = inodes_per_group;
	sb.s_blocks_count = total_blocks;
	sb.s_free_blocks_count = total_blocks - root_data_block - 1;
	sb.s_free_inodes_count = inodes_per_group - ROOT_DIRECTORY_INODE;
	sb.s_first_data_block = first_data_block;
	sb.s_log_block_size = (block_size / 1024).trailing_zeros();
	sb.s_blocks_per_group = blocks_per_group;
	sb.s_frags_per_group = blocks_per_group;
	sb.s_inodes_per_group = inodes_per_group;
	sb.s_magic = EXT2_MAGIC;
	sb.s_state = FS_STATE_CLEAN;
	sb.s_rev_level = 1;
	sb.s_first_ino = ROOT_DIRECTORY_INODE + 9;
	sb.s_inode_size = inode_size as u16;
	sb.s_feature_incompat = FEATURE_INCOMPAT_FILETYPE;
	sb.s_feature_ro_compat = FEATURE_RO_64BIT_SIZE;

	let mut sb_buf = vec![0u8; SUPERBLOCK_SIZE];
	sb_buf.copy_from_slice(bytemuck::bytes_of(&sb));
	disk.device.write(SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE, &sb_buf)?;

	let bgd = BlockGroupDescriptor {
		bg_block_bitmap: block_bitmap_block,
		bg_inode_bitmap: inode_bitmap_block,
		bg_inode_table: inode_table_start,
		bg_free_blocks_count: (total_blocks - root_data_block - 1) as u16,
		bg_free_inodes_count: (inodes_per_group - ROOT_DIRECTORY_INODE) as u16,
		bg_used_dirs_count: 1,
		bg_pad: [0; 14],
	};
	let mut bgdt_buf = vec![0u8; block_size as usize];
	bgdt_buf[..32].copy_from_slice(bytemuck::bytes_of(&bgd));
	disk.write_block(bgdt_start_block as u64, &bgdt_buf)?;

	// Block bitmap: every block up to and including the root's data block is used.
	{
		let mut buf = vec![0u8; block_size as usize];
		let used = root_data_block - first_data_block + 1;
		{
			let mut bm = BitmapView::new(&mut buf);
			for i in 0..used {
				bm.set(i, true);
			}
		}
		disk.write_block(block_bitmap_block as u64, &buf)?;
	}
	// Inode bitmap: reserved inodes 1..=ROOT_DIRECTORY_INODE are used.
	{
		let mut buf = vec![0u8; block_size as usize];
		{
			let mut bm = BitmapView::new(&mut buf);
			for i in 0..ROOT_DIRECTORY_INODE {
				bm.set(i, true);
			}
		}
		disk.write_block(inode_bitmap_block as u64, &buf)?;
	}

	let state = Arc::new(Ext2FsState {
		id: fs_id,
		disk,
		read_only: false,
		superblock: Mutex::new(sb),
		bgdt: Mutex::new(vec![bgd]),
		bgdt_start_block: bgdt_start_block as u64,
		inode_cache: InodeCache::new(config.max_cached_inodes),
		alloc_lock: Mutex::new(()),
	});

	let mut root_raw = RawInode::zeroed();
	root_raw.i_mode = (FileType::Directory.to_mode_bits() | 0o755) as u16;
	root_raw.i_links_count = 2;
	root_raw.i_block[0] = root_data_block;
	root_raw.set_size(block_size, true, block_size as u64, false);
	state.write_raw_inode(ROOT_DIRECTORY_INODE, &root_raw)?;

	let root_entries = [
		(ROOT_DIRECTORY_INODE, Some(FileType::Directory), "."),
		(ROOT_DIRECTORY_INODE, Some(FileType::Directory), ".."),
	];
	let root_buf = dirent::serialize(&root_entries, block_size as usize, block_size as usize)?;
	state.write_block(root_data_block as u64, &root_buf)?;

	debug!(
		"formatted ext2 filesystem id={fs_id} block_size={block_size} total_blocks={total_blocks} inodes_per_group={inodes_per_group}"
	);
	Ok(Ext2Fs(state))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::block::mem::MemBlockDevice;

	fn fixture() -> Ext2Fs {
		let device = Arc::new(MemBlockDevice::new(512, 2048));
		format(device, FormatOptions::default(), Ext2Config::default()).unwrap()
	}

	#[test]
	fn format_produces_a_readable_root_directory() {
		let fs = fixture();
		let root = fs.get_inode(ROOT_DIRECTORY_INODE).unwrap().unwrap();
		assert_eq!(root.file_type().unwrap(), FileType::Directory);
		let mut names = Vec::new();
		root.traverse(&mut |name, _, _| {
			names.push(name.to_string());
			true
		})
		.unwrap();
		assert!(names.contains(&".".to_string()));
		assert!(names.contains(&"..".to_string()));
	}

	#[test]
	fn create_and_read_back_a_small_file() {
		let fs = fixture();
		let id = fs
			.create_inode(ROOT_DIRECTORY_INODE, "hello.txt", 0o644, 0)
			.unwrap();
		let inode = fs.get_inode(id.index).unwrap().unwrap();
		inode.write_bytes(0, b"hello, ext2").unwrap();
		let mut buf = [0u8; 11];
		let n = inode.read_bytes(0, &mut buf).unwrap();
		assert_eq!(n, 11);
		assert_eq!(&buf, b"hello, ext2");
	}

	#[test]
	fn create_directory_links_parent_and_child() {
		let fs = fixture();
		let id = fs.create_directory(ROOT_DIRECTORY_INODE, "sub", 0o755).unwrap();
		let root = fs.get_inode(ROOT_DIRECTORY_INODE).unwrap().unwrap();
		assert_eq!(root.lookup("sub").unwrap(), Some(id));
		let child = fs.get_inode(id.index).unwrap().unwrap();
		assert_eq!(child.stat().unwrap().nlink, 2);
	}

	#[test]
	fn unlink_frees_the_inode_once_links_reach_zero() {
		let fs = fixture();
		let id = fs.create_inode(ROOT_DIRECTORY_INODE, "f", 0o644, 0).unwrap();
		let root = fs.get_inode(ROOT_DIRECTORY_INODE).unwrap().unwrap();
		root.remove_child("f").unwrap();
		assert!(fs.get_inode(id.index).unwrap().is_none());
	}

	#[test]
	fn symlink_round_trip_inline() {
		let fs = fixture();
		let id = fs
			.create_symlink(ROOT_DIRECTORY_INODE, "link", "target.txt")
			.unwrap();
		let inode = fs.get_inode(id.index).unwrap().unwrap();
		assert_eq!(inode.read_link().unwrap(), "target.txt");
	}

	#[test]
	fn write_spanning_a_block_boundary_round_trips() {
		let fs = fixture();
		let id = fs.create_inode(ROOT_DIRECTORY_INODE, "big", 0o644, 0).unwrap();
		let inode = fs.get_inode(id.index).unwrap().unwrap();
		let data = vec![0xab; 1024 + 16];
		inode.write_bytes(1020 - 8, &data).unwrap();
		let mut out = vec![0u8; data.len()];
		inode.read_bytes(1020 - 8, &mut out).unwrap();
		assert_eq!(out, data);
	}

	#[test]
	fn mount_reopens_a_formatted_device_and_sees_its_contents() {
		let device = Arc::new(MemBlockDevice::new(512, 2048));
		{
			let fs = format(device.clone(), FormatOptions::default(), Ext2Config::default()).unwrap();
			fs.create_inode(ROOT_DIRECTORY_INODE, "persisted.txt", 0o644, 0)
				.unwrap();
		}
		let fs = mount(device, Ext2Config::default()).unwrap();
		let root = fs.get_inode(ROOT_DIRECTORY_INODE).unwrap().unwrap();
		assert_eq!(
			root.lookup("persisted.txt").unwrap().map(|id| id.index),
			Some(ROOT_DIRECTORY_INODE + 1)
		);
	}

	#[test]
	fn mount_read_only_rejects_writes() {
		let device = Arc::new(MemBlockDevice::new(512, 2048));
		format(device.clone(), FormatOptions::default(), Ext2Config::default()).unwrap();
		let fs = mount(
			device,
			Ext2Config {
				read_only: true,
				..Ext2Config::default()
			},
		)
		.unwrap();
		assert!(fs.is_read_only());
		let err = fs
			.create_inode(ROOT_DIRECTORY_INODE, "nope.txt", 0o644, 0)
			.unwrap_err();
		assert_eq!(err, Errno::ReadOnly);
	}

	#[test]
	fn a_dedicated_cache_does_not_leak_into_another_instance() {
		let device_a = Arc::new(MemBlockDevice::new(512, 2048));
		let device_b = Arc::new(MemBlockDevice::new(512, 2048));
		let fs_a = format(device_a, FormatOptions::default(), Ext2Config::default()).unwrap();
		let fs_b = format(device_b, FormatOptions::default(), Ext2Config::default()).unwrap();
		fs_a.create_inode(ROOT_DIRECTORY_INODE, "only-in-a.txt", 0o644, 0)
			.unwrap();
		let root_b = fs_b.get_inode(ROOT_DIRECTORY_INODE).unwrap().unwrap();
		assert_eq!(root_b.lookup("only-in-a.txt").unwrap(), None);
	}

	#[test]
	fn create_inode_with_an_unmeetable_initial_size_leaks_nothing() {
		// A tiny device: formatting alone consumes nearly every block.
		let device = Arc::new(MemBlockDevice::new(512, 64));
		let fs = format(device, FormatOptions::default(), Ext2Config::default()).unwrap();
		let free_inodes_before = fs.0.superblock.lock().unwrap().s_free_inodes_count;
		let free_blocks_before = fs.0.bgdt.lock().unwrap()[0].bg_free_blocks_count;

		let err = fs
			.create_inode(ROOT_DIRECTORY_INODE, "big", 0o644, 64 * 1024)
			.unwrap_err();
		assert_eq!(err, Errno::NoSpace);

		// The candidate inode allocated before the block shortfall was discovered must have been
		// freed again: the root directory never gained the entry, and the free counters are back
		// to what they were before the failed call.
		let root = fs.get_inode(ROOT_DIRECTORY_INODE).unwrap().unwrap();
		assert_eq!(root.lookup("big").unwrap(), None);
		assert_eq!(
			fs.0.superblock.lock().unwrap().s_free_inodes_count,
			free_inodes_before
		);
		assert_eq!(
			fs.0.bgdt.lock().unwrap()[0].bg_free_blocks_count,
			free_blocks_before
		);
	}
}
