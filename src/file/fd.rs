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

//! File descriptors: a per-open-file position and flags, forwarding to an [`Inode`].

use crate::errno::{EResult, Errno};
use crate::file::fs::InodeHandle;
use crate::file::{FileType, InodeIdentifier};
use bitflags::bitflags;

bitflags! {
	/// Flags recognized by `open`.
	#[derive(Copy, Clone, Debug, Eq, PartialEq)]
	pub struct OpenFlags: u32 {
		/// Open for writing only.
		const WRONLY = 0b0000_0000_0000_0001;
		/// Open for both reading and writing.
		const RDWR = 0b0000_0000_0000_0010;
		/// Create the file if it does not exist.
		const CREAT = 0b0000_0000_0100_0000;
		/// With `CREAT`, fail if the target exists.
		const EXCL = 0b0000_0000_1000_0000;
		/// Truncate on open. Reserved: not implemented by the ext2 engine.
		const TRUNC = 0b0000_0010_0000_0000;
		/// Writes append to the end of the file.
		const APPEND = 0b0000_0100_0000_0000;
		/// Fail unless the target is a directory.
		const DIRECTORY = 0b0001_0000_0000_0000_0000;
		/// Do not follow a final-component symlink; `ELOOP` instead.
		const NOFOLLOW = 0b0010_0000_0000_0000_0000;
		/// Do not follow a final-component symlink; return it without error instead.
		const NOFOLLOW_NOERROR = 0b0100_0000_0000_0000_0000;
		/// Recorded but does not affect resolution.
		const NONBLOCK = 0b0000_0000_0000_1000_0000_0000;
		/// Recorded but does not affect resolution.
		const CLOEXEC = 0b0000_0000_0001_0000_0000_0000_0000;
	}
}

impl OpenFlags {
	/// Whether this set of flags requests write access.
	pub fn wants_write(&self) -> bool {
		self.contains(Self::WRONLY) || self.contains(Self::RDWR)
	}
}

/// The origin a [`FileDescriptor::seek`] offset is relative to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SeekFrom {
	/// Relative to the start of the file.
	Start(u64),
	/// Relative to the current position.
	Current(i64),
	/// Relative to the end of the file.
	End(i64),
}

/// A per-open-file cursor over an inode.
pub struct FileDescriptor {
	/// The inode this descriptor is open against.
	pub id: InodeIdentifier,
	inode: InodeHandle,
	flags: OpenFlags,
	pos: u64,
}

impl FileDescriptor {
	/// Creates a new descriptor positioned at the start of `inode`.
	pub fn new(id: InodeIdentifier, inode: InodeHandle, flags: OpenFlags) -> Self {
		Self {
			id,
			inode,
			flags,
			pos: 0,
		}
	}

	/// The descriptor's flags.
	pub fn flags(&self) -> OpenFlags {
		self.flags
	}

	/// The descriptor's current position.
	pub fn pos(&self) -> u64 {
		self.pos
	}

	/// Reads at the current position, advancing it by the number of bytes read.
	pub fn read(&mut self, buf: &mut [u8]) -> EResult<usize> {
		let n = self.inode.read_bytes(self.pos, buf)?;
		self.pos += n as u64;
		Ok(n)
	}

	/// Writes at the current position (or at the end of file, under `O_APPEND`), advancing the
	/// position by the number of bytes written.
	pub fn write(&mut self, buf: &[u8]) -> EResult<usize> {
		if !self.flags.wants_write() {
			return Err(Errno::BadFd);
		}
		let off = if self.flags.contains(OpenFlags::APPEND) {
			self.inode.stat()?.size
		} else {
			self.pos
		};
		let n = self.inode.write_bytes(off, buf)?;
		self.pos = off + n as u64;
		Ok(n)
	}

	/// Repositions the descriptor per `whence`. Seeking past EOF is permitted; seeking to a
	/// negative offset fails with [`Errno::InvalidArg`].
	pub fn seek(&mut self, whence: SeekFrom) -> EResult<u64> {
		let size = self.inode.stat()?.size;
		let new_pos = match whence {
			SeekFrom::Start(off) => off as i64,
			SeekFrom::Current(delta) => self.pos as i64 + delta,
			SeekFrom::End(delta) => size as i64 + delta,
		};
		if new_pos < 0 {
			return Err(Errno::InvalidArg);
		}
		self.pos = new_pos as u64;
		Ok(self.pos)
	}

	/// Returns the underlying inode handle.
	pub fn inode(&self) -> &InodeHandle {
		&self.inode
	}

	/// Fills `buf` with as many directory entries as fit, each packed as
	/// `{inode: u32, file_type: u8, name_len: u32, name: bytes}` in native byte order, and
	/// returns the number of bytes written. Entries already returned by a previous call are
	/// skipped, the same way repeated `read` calls advance past already-read bytes; `seek` to
	/// `0` to restart the listing. Returns `0` once every entry has been delivered, or if the
	/// very first entry considered does not fit in `buf`.
	pub fn get_dir_entries(&mut self, buf: &mut [u8]) -> EResult<usize> {
		if self.inode.file_type()? != FileType::Directory {
			return Err(Errno::NotDirectory);
		}
		let skip = self.pos;
		let mut seen = 0u64;
		let mut off = 0usize;
		self.inode.traverse(&mut |name, id, file_type| {
			if seen < skip {
				seen += 1;
				return true;
			}
			let name_bytes = name.as_bytes();
			let entry_len = 4 + 1 + 4 + name_bytes.len();
			if off + entry_len > buf.len() {
				return false;
			}
			buf[off..off + 4].copy_from_slice(&id.index.to_ne_bytes());
			buf[off + 4] = file_type.to_dirent_type();
			buf[off + 5..off + 9].copy_from_slice(&(name_bytes.len() as u32).to_ne_bytes());
			buf[off + 9..off + 9 + name_bytes.len()].copy_from_slice(name_bytes);
			off += entry_len;
			seen += 1;
			true
		})?;
		self.pos = seen;
		Ok(off)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::block::mem::MemBlockDevice;
	use crate::file::fs::ext2::{self, ROOT_DIRECTORY_INODE};
	use crate::file::fs::Fs;
	use crate::file::InodeIdentifier;
	use std::sync::Arc;

	fn root_fd(fs: &ext2::Ext2Fs) -> FileDescriptor {
		let inode = fs.get_inode(ROOT_DIRECTORY_INODE).unwrap().unwrap();
		let id = InodeIdentifier {
			fs_id: fs.id(),
			index: ROOT_DIRECTORY_INODE,
		};
		FileDescriptor::new(id, inode, OpenFlags::empty())
	}

	fn parse_entries(buf: &[u8]) -> Vec<(u32, u8, String)> {
		let mut out = Vec::new();
		let mut off = 0;
		while off < buf.len() {
			let inode = u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap());
			let file_type = buf[off + 4];
			let name_len =
				u32::from_ne_bytes(buf[off + 5..off + 9].try_into().unwrap()) as usize;
			let name = String::from_utf8(buf[off + 9..off + 9 + name_len].to_vec()).unwrap();
			out.push((inode, file_type, name));
			off += 9 + name_len;
		}
		out
	}

	#[test]
	fn lists_dot_and_dotdot_on_a_fresh_root() {
		let device = Arc::new(MemBlockDevice::new(512, 2048));
		let fs = ext2::format(device, ext2::FormatOptions::default(), ext2::Ext2Config::default())
			.unwrap();
		let mut fd = root_fd(&fs);
		let mut buf = [0u8; 4096];
		let n = fd.get_dir_entries(&mut buf).unwrap();
		let entries = parse_entries(&buf[..n]);
		let names: Vec<&str> = entries.iter().map(|(_, _, n)| n.as_str()).collect();
		assert_eq!(names, vec![".", ".."]);
		// A second call with no reset returns nothing further: the listing is exhausted.
		let n2 = fd.get_dir_entries(&mut buf).unwrap();
		assert_eq!(n2, 0);
	}

	#[test]
	fn a_buffer_too_small_for_even_one_entry_yields_nothing() {
		let device = Arc::new(MemBlockDevice::new(512, 2048));
		let fs = ext2::format(device, ext2::FormatOptions::default(), ext2::Ext2Config::default())
			.unwrap();
		let mut fd = root_fd(&fs);
		let mut buf = [0u8; 2];
		assert_eq!(fd.get_dir_entries(&mut buf).unwrap(), 0);
	}

	#[test]
	fn rejects_a_non_directory() {
		let device = Arc::new(MemBlockDevice::new(512, 2048));
		let fs = ext2::format(device, ext2::FormatOptions::default(), ext2::Ext2Config::default())
			.unwrap();
		let id = fs.create_inode(ROOT_DIRECTORY_INODE, "f.txt", 0o644, 0).unwrap();
		let inode = fs.get_inode(id.index).unwrap().unwrap();
		let mut fd = FileDescriptor::new(id, inode, OpenFlags::empty());
		let mut buf = [0u8; 64];
		assert_eq!(fd.get_dir_entries(&mut buf).unwrap_err(), Errno::NotDirectory);
	}
}
