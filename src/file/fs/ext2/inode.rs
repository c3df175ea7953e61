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

//! The in-memory mirror of an on-disk `ext2_inode`, and the [`InodeOps`] implementation over it.

use super::dirent;
use super::{group_of_block, Ext2FsState};
use crate::errno::{EResult, Errno};
use crate::file::fs::InodeOps;
use crate::file::{FileType, InodeIdentifier, InodeIndex, Mode, Stat};
use bytemuck::{Pod, Zeroable};
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// The maximum number of direct block pointers in an inode.
pub const DIRECT_BLOCKS_COUNT: usize = 12;
/// The maximum length, in bytes, for a symlink target stored inline in `i_block`.
pub const SYMLINK_INLINE_LIMIT: u64 = 60;
/// The inode index of the filesystem root directory.
pub const ROOT_DIRECTORY_INODE: u32 = 2;
/// The size of a disk sector used for `i_blocks` accounting, in bytes.
const SECTOR_SIZE: u32 = 512;

/// INode type bits, as stored in `i_mode`.
const INODE_TYPE_FIFO: u16 = 0x1000;
const INODE_TYPE_CHAR_DEVICE: u16 = 0x2000;
const INODE_TYPE_DIRECTORY: u16 = 0x4000;
const INODE_TYPE_BLOCK_DEVICE: u16 = 0x6000;
const INODE_TYPE_REGULAR: u16 = 0x8000;
const INODE_TYPE_SYMLINK: u16 = 0xa000;
const INODE_TYPE_SOCKET: u16 = 0xc000;

/// The on-disk inode record, `ext2_inode` in standard nomenclature (the revision-0, 128-byte
/// form; filesystems with a larger `s_inode_size` simply leave the extra bytes per slot unused
/// by this engine, as xattrs are out of scope).
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct RawInode {
	pub i_mode: u16,
	pub i_uid: u16,
	pub i_size: u32,
	pub i_atime: u32,
	pub i_ctime: u32,
	pub i_mtime: u32,
	pub i_dtime: u32,
	pub i_gid: u16,
	pub i_links_count: u16,
	pub i_blocks: u32,
	pub i_flags: u32,
	pub i_osd1: u32,
	pub i_block: [u32; 15],
	pub i_generation: u32,
	pub i_file_acl: u32,
	pub i_dir_acl: u32,
	pub i_faddr: u32,
	pub i_osd2: [u8; 12],
}

const _: () = assert!(std::mem::size_of::<RawInode>() == 128);

impl RawInode {
	/// Returns the file type encoded in `i_mode`'s type bits.
	pub fn file_type(&self) -> FileType {
		match self.i_mode & 0xf000 {
			INODE_TYPE_FIFO => FileType::Fifo,
			INODE_TYPE_CHAR_DEVICE => FileType::CharDevice,
			INODE_TYPE_DIRECTORY => FileType::Directory,
			INODE_TYPE_BLOCK_DEVICE => FileType::BlockDevice,
			INODE_TYPE_SYMLINK => FileType::Link,
			INODE_TYPE_SOCKET => FileType::Socket,
			_ => FileType::Regular,
		}
	}

	/// The file's size in bytes. 64-bit sizes (`i_dir_acl` high bits) are honored when the
	/// filesystem advertises the feature.
	pub fn size(&self, has_64bit_size: bool) -> u64 {
		if has_64bit_size {
			((self.i_dir_acl as u64) << 32) | self.i_size as u64
		} else {
			self.i_size as u64
		}
	}

	/// Sets the file's size and updates `i_blocks` to match, in sectors.
	///
	/// `inline` must be `true` for a symlink whose target is stored inline (no data block).
	pub fn set_size(&mut self, block_size: u32, has_64bit_size: bool, size: u64, inline: bool) {
		if has_64bit_size {
			self.i_dir_acl = (size >> 32) as u32;
		}
		self.i_size = size as u32;
		if !inline {
			let sector_per_blk = block_size / SECTOR_SIZE;
			self.i_blocks = (size.div_ceil(block_size as u64) as u32) * sector_per_blk;
		} else {
			self.i_blocks = 0;
		}
	}

	/// The number of data+metadata blocks currently allocated to the file.
	pub fn blocks_count(&self, block_size: u32) -> u32 {
		self.i_blocks / (block_size / SECTOR_SIZE)
	}

	/// The device major/minor encoded in `i_block[0]`, Linux-style packed layout.
	pub fn device(&self) -> (u32, u32) {
		let dev = self.i_block[0];
		(((dev >> 8) & 0xff) as u32, (dev & 0xff) as u32)
	}

	/// Packs `(major, minor)` into `i_block[0]`.
	pub fn set_device(&mut self, major: u32, minor: u32) {
		self.i_block[0] = ((major & 0xff) << 8) | (minor & 0xff);
	}
}

/// Mutable, lazily-populated state cached alongside the raw inode record.
struct Ext2InodeInner {
	raw: RawInode,
	/// Logical block index -> physical block index, populated on first need.
	block_list: Option<Vec<u32>>,
	/// Directory name -> child inode index, populated on first need (directories only).
	lookup_cache: Option<HashMap<String, InodeIndex>>,
	/// Whether `raw` has diverged from the on-disk copy.
	dirty: bool,
}

/// The in-memory mirror of one ext2 inode.
pub struct Ext2Inode {
	id: InodeIdentifier,
	fs: Weak<Ext2FsState>,
	inner: Mutex<Ext2InodeInner>,
}

impl Ext2Inode {
	/// Wraps a freshly-read raw inode record as a cached handle.
	pub fn new(id: InodeIdentifier, fs: &Arc<Ext2FsState>, raw: RawInode) -> Arc<Self> {
		Arc::new(Self {
			id,
			fs: Arc::downgrade(fs),
			inner: Mutex::new(Ext2InodeInner {
				raw,
				block_list: None,
				lookup_cache: None,
				dirty: false,
			}),
		})
	}

	fn fs(&self) -> EResult<Arc<Ext2FsState>> {
		self.fs.upgrade().ok_or(Errno::Io)
	}

	/// A copy of the current raw record.
	pub fn raw(&self) -> RawInode {
		self.inner.lock().unwrap().raw
	}

	/// Whether the inode is a directory.
	fn require_directory(&self) -> EResult<()> {
		if self.raw().file_type() != FileType::Directory {
			return Err(Errno::NotDirectory);
		}
		Ok(())
	}

	/// Ensures the block list is populated, returning a clone of it.
	fn block_list(&self, fs: &Ext2FsState) -> EResult<Vec<u32>> {
		let mut inner = self.inner.lock().unwrap();
		if let Some(list) = &inner.block_list {
			return Ok(list.clone());
		}
		let list = super::block_list_for_inode(fs, &inner.raw, false)?;
		inner.block_list = Some(list.clone());
		Ok(list)
	}

	/// Ensures the directory-lookup cache is populated, returning a clone of it.
	fn lookup_cache(&self, fs: &Ext2FsState) -> EResult<HashMap<String, InodeIndex>> {
		self.require_directory()?;
		{
			let inner = self.inner.lock().unwrap();
			if let Some(cache) = &inner.lookup_cache {
				return Ok(cache.clone());
			}
		}
		let buf = self.read_all_content(fs)?;
		let mut map = HashMap::new();
		dirent::traverse(&buf, |_, ent| {
			map.insert(ent.name.clone(), ent.inode);
			true
		})?;
		self.inner.lock().unwrap().lookup_cache = Some(map.clone());
		Ok(map)
	}

	/// Reads the inode's entire content (used for directory enumeration).
	fn read_all_content(&self, fs: &Ext2FsState) -> EResult<Vec<u8>> {
		let size = self.raw().size(fs.has_64bit_size());
		let mut buf = vec![0u8; size as usize];
		if size > 0 {
			self.read_bytes_impl(fs, 0, &mut buf)?;
		}
		Ok(buf)
	}

	fn read_bytes_impl(&self, fs: &Ext2FsState, offset: u64, out: &mut [u8]) -> EResult<usize> {
		let raw = self.raw();
		let size = raw.size(fs.has_64bit_size());
		if offset >= size {
			return Ok(0);
		}
		// Inline symlinks: content lives directly in `i_block`, no data block allocated.
		if raw.file_type() == FileType::Link && size < SYMLINK_INLINE_LIMIT {
			let bytes = bytemuck::bytes_of(&raw.i_block);
			let n = ((size - offset) as usize).min(out.len());
			out[..n].copy_from_slice(&bytes[offset as usize..offset as usize + n]);
			return Ok(n);
		}
		let block_size = fs.block_size() as u64;
		let list = self.block_list(fs)?;
		let n = ((size - offset) as usize).min(out.len());
		let mut copied = 0usize;
		while copied < n {
			let file_off = offset + copied as u64;
			let block_idx = (file_off / block_size) as usize;
			let in_block_off = (file_off % block_size) as usize;
			let Some(&phys) = list.get(block_idx) else {
				break;
			};
			let block = fs.disk.read_block(phys as u64)?;
			let take = (block_size as usize - in_block_off).min(n - copied);
			out[copied..copied + take].copy_from_slice(&block[in_block_off..in_block_off + take]);
			copied += take;
		}
		Ok(copied)
	}

	fn write_bytes_impl(&self, fs: &Ext2FsState, offset: u64, data: &[u8]) -> EResult<usize> {
		if fs.read_only {
			return Err(Errno::ReadOnly);
		}
		let mut inner = self.inner.lock().unwrap();
		if inner.raw.file_type() == FileType::Link {
			return Err(Errno::InvalidArg);
		}
		let block_size = fs.block_size() as u64;
		let old_size = inner.raw.size(fs.has_64bit_size());
		let new_size = (offset + data.len() as u64).max(old_size);
		let blocks_before = old_size.div_ceil(block_size) as usize;
		let blocks_after = new_size.div_ceil(block_size) as usize;
		let group = group_of_block(fs, inner.raw.i_block[0].max(1));
		let mut list = match &inner.block_list {
			Some(l) => l.clone(),
			None => super::block_list_for_inode(fs, &inner.raw, false)?,
		};
		if blocks_after > blocks_before {
			let needed = blocks_after - blocks_before;
			trace!(
				"inode {:?} growing from {blocks_before} to {blocks_after} blocks ({needed} new)",
				self.id
			);
			let new_blocks = fs.allocate_and_commit_blocks(group, needed)?;
			list.extend(new_blocks);
		}
		let n = data.len();
		let mut written = 0usize;
		while written < n {
			let file_off = offset + written as u64;
			let block_idx = (file_off / block_size) as usize;
			let in_block_off = (file_off % block_size) as usize;
			let phys = *list.get(block_idx).ok_or(Errno::Io)?;
			let take = (block_size as usize - in_block_off).min(n - written);
			let mut block = if in_block_off == 0 && take == block_size as usize {
				vec![0u8; block_size as usize]
			} else {
				fs.disk.read_block(phys as u64)?
			};
			block[in_block_off..in_block_off + take]
				.copy_from_slice(&data[written..written + take]);
			fs.disk.write_block(phys as u64, &block)?;
			written += take;
		}
		inner.raw.set_size(fs.block_size(), fs.has_64bit_size(), new_size, false);
		super::write_block_list_for_inode(fs, group, &mut inner.raw, blocks_before, &list)?;
		inner.block_list = Some(list);
		inner.dirty = true;
		drop(inner);
		self.flush_metadata()?;
		Ok(written)
	}
}

impl InodeOps for Ext2Inode {
	fn id(&self) -> InodeIdentifier {
		self.id
	}

	fn stat(&self) -> EResult<Stat> {
		let fs = self.fs()?;
		let raw = self.raw();
		let (dev_major, dev_minor) = raw.device();
		Ok(Stat {
			mode: raw.i_mode as Mode,
			nlink: raw.i_links_count as u32,
			uid: raw.i_uid as u32,
			gid: raw.i_gid as u32,
			size: raw.size(fs.has_64bit_size()),
			blocks: raw.blocks_count(fs.block_size()) as u64,
			dev_major,
			dev_minor,
			atime: raw.i_atime,
			ctime: raw.i_ctime,
			mtime: raw.i_mtime,
		})
	}

	fn file_type(&self) -> EResult<FileType> {
		Ok(self.raw().file_type())
	}

	fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> EResult<usize> {
		let fs = self.fs()?;
		self.read_bytes_impl(&fs, offset, buf)
	}

	fn write_bytes(&self, offset: u64, buf: &[u8]) -> EResult<usize> {
		let fs = self.fs()?;
		self.write_bytes_impl(&fs, offset, buf)
	}

	fn lookup(&self, name: &str) -> EResult<Option<InodeIdentifier>> {
		let fs = self.fs()?;
		let cache = self.lookup_cache(&fs)?;
		Ok(cache.get(name).map(|&index| InodeIdentifier {
			fs_id: fs.id,
			index,
		}))
	}

	fn traverse(&self, f: &mut dyn FnMut(&str, InodeIdentifier, FileType) -> bool) -> EResult<()> {
		let fs = self.fs()?;
		self.require_directory()?;
		let buf = self.read_all_content(&fs)?;
		dirent::traverse(&buf, |_, ent| {
			let id = InodeIdentifier {
				fs_id: fs.id,
				index: ent.inode,
			};
			let ty = ent.file_type.unwrap_or(FileType::Regular);
			f(&ent.name, id, ty)
		})
	}

	fn add_child(
		&self,
		child: InodeIdentifier,
		name: &str,
		file_type: FileType,
	) -> EResult<()> {
		let fs = self.fs()?;
		if fs.read_only {
			return Err(Errno::ReadOnly);
		}
		self.require_directory()?;
		let mut entries = {
			let buf = self.read_all_content(&fs)?;
			dirent::parse_all(&buf)?
		};
		if entries.iter().any(|(_, e)| e.name == name) {
			return Err(Errno::AlreadyExists);
		}
		if let Some(child_inode) = fs.get_inode(child.index)? {
			child_inode.increment_link_count()?;
		}
		entries.push((
			0,
			dirent::DirEntry {
				inode: child.index,
				file_type: Some(file_type),
				name: name.to_string(),
			},
		));
		self.rewrite_directory(&fs, &entries)?;
		let mut inner = self.inner.lock().unwrap();
		if let Some(cache) = &mut inner.lookup_cache {
			cache.insert(name.to_string(), child.index);
		}
		debug!("added child {name:?} -> {child:?} in directory {:?}", self.id);
		Ok(())
	}

	fn remove_child(&self, name: &str) -> EResult<InodeIdentifier> {
		let fs = self.fs()?;
		if fs.read_only {
			return Err(Errno::ReadOnly);
		}
		self.require_directory()?;
		let cache = self.lookup_cache(&fs)?;
		let Some(&child_index) = cache.get(name) else {
			return Err(Errno::NotFound);
		};
		let entries = {
			let buf = self.read_all_content(&fs)?;
			dirent::parse_all(&buf)?
				.into_iter()
				.filter(|(_, e)| e.name != name)
				.collect::<Vec<_>>()
		};
		self.rewrite_directory(&fs, &entries)?;
		{
			let mut inner = self.inner.lock().unwrap();
			if let Some(cache) = &mut inner.lookup_cache {
				cache.remove(name);
			}
		}
		let child_id = InodeIdentifier {
			fs_id: fs.id,
			index: child_index,
		};
		if let Some(child_inode) = fs.get_inode(child_index)? {
			child_inode.decrement_link_count()?;
		}
		debug!("removed child {name:?} -> {child_id:?} from directory {:?}", self.id);
		Ok(child_id)
	}

	fn increment_link_count(&self) -> EResult<()> {
		let fs = self.fs()?;
		if fs.read_only {
			return Err(Errno::ReadOnly);
		}
		let mut inner = self.inner.lock().unwrap();
		inner.raw.i_links_count += 1;
		inner.dirty = true;
		drop(inner);
		self.flush_metadata()
	}

	fn decrement_link_count(&self) -> EResult<bool> {
		let fs = self.fs()?;
		if fs.read_only {
			return Err(Errno::ReadOnly);
		}
		let freed = {
			let mut inner = self.inner.lock().unwrap();
			inner.raw.i_links_count = inner.raw.i_links_count.saturating_sub(1);
			inner.dirty = true;
			inner.raw.i_links_count == 0
		};
		self.flush_metadata()?;
		if freed {
			debug!("inode {:?} reached zero links, freeing", self.id);
			super::free_inode(&fs, self.id.index, &self.raw())?;
			fs.inode_cache.remove(self.id.index);
		}
		Ok(freed)
	}

	fn chmod(&self, mode: Mode) -> EResult<()> {
		let fs = self.fs()?;
		if fs.read_only {
			return Err(Errno::ReadOnly);
		}
		let mut inner = self.inner.lock().unwrap();
		inner.raw.i_mode = (inner.raw.i_mode & !0o7777) | (mode & 0o7777) as u16;
		inner.dirty = true;
		drop(inner);
		self.flush_metadata()
	}

	fn chown(&self, uid: u32, gid: u32) -> EResult<()> {
		let fs = self.fs()?;
		if fs.read_only {
			return Err(Errno::ReadOnly);
		}
		let mut inner = self.inner.lock().unwrap();
		inner.raw.i_uid = uid as u16;
		inner.raw.i_gid = gid as u16;
		inner.dirty = true;
		drop(inner);
		self.flush_metadata()
	}

	fn set_times(&self, atime: Option<u32>, mtime: Option<u32>) -> EResult<()> {
		let fs = self.fs()?;
		if fs.read_only {
			return Err(Errno::ReadOnly);
		}
		let mut inner = self.inner.lock().unwrap();
		if let Some(a) = atime {
			inner.raw.i_atime = a;
		}
		if let Some(m) = mtime {
			inner.raw.i_mtime = m;
		}
		inner.dirty = true;
		drop(inner);
		self.flush_metadata()
	}

	fn read_link(&self) -> EResult<String> {
		let fs = self.fs()?;
		if self.raw().file_type() != FileType::Link {
			return Err(Errno::InvalidArg);
		}
		let buf = self.read_all_content(&fs)?;
		Ok(String::from_utf8_lossy(&buf).into_owned())
	}

	fn flush_metadata(&self) -> EResult<()> {
		let fs = self.fs()?;
		let raw = {
			let mut inner = self.inner.lock().unwrap();
			if !inner.dirty {
				return Ok(());
			}
			inner.dirty = false;
			inner.raw
		};
		trace!("flushing metadata for inode {:?}", self.id);
		fs.write_raw_inode(self.id.index, &raw)
	}
}

impl Ext2Inode {
	/// Serializes `entries` and writes them as this directory's content, growing the inode as
	/// needed.
	fn rewrite_directory(
		&self,
		fs: &Ext2FsState,
		entries: &[(u64, dirent::DirEntry)],
	) -> EResult<()> {
		let block_size = fs.block_size() as usize;
		let directory_size: usize = entries
			.iter()
			.map(|(_, e)| dirent::dir_rec_len(e.name.len()))
			.sum();
		let occupied_size = directory_size.max(block_size).div_ceil(block_size) * block_size;
		let flat: Vec<(u32, Option<FileType>, &str)> = entries
			.iter()
			.map(|(_, e)| (e.inode, e.file_type, e.name.as_str()))
			.collect();
		let buf = dirent::serialize(&flat, occupied_size, block_size)?;
		self.write_bytes_impl(fs, 0, &buf)?;
		Ok(())
	}
}
