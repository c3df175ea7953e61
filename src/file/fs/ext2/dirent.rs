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

//! Directory entries: `ext2_dir_entry_2` parsing, iteration and (re)serialization.
//!
//! A directory's content is a tightly packed sequence of entries where `rec_len` chains one
//! entry to the next; the last entry in each block has its `rec_len` stretched to reach the
//! block's end. `inode == 0` marks a tombstone. This engine does not compact tombstones in
//! place: every mutation rewrites the whole directory from a fresh entry list, which is simple
//! and correct at the cost of O(size) per mutation.

use crate::errno::{EResult, Errno};
use crate::file::path::NAME_MAX;
use crate::file::FileType;

/// The fixed-size header preceding an entry's name.
pub const NAME_OFF: usize = 8;
/// The alignment every `rec_len` must respect.
pub const ALIGN: usize = 4;

/// `EXT2_DIR_REC_LEN(n)`: the minimum record length to hold a name of `n` bytes.
pub fn dir_rec_len(name_len: usize) -> usize {
	(NAME_OFF + name_len).next_multiple_of(ALIGN)
}

/// One decoded directory entry.
#[derive(Clone, Debug)]
pub struct DirEntry {
	/// The inode this entry refers to. `0` denotes a tombstone.
	pub inode: u32,
	/// The entry's file-type hint.
	pub file_type: Option<FileType>,
	/// The entry's name.
	pub name: String,
}

/// Parses every entry (including tombstones) out of a full directory content buffer.
///
/// `buf`'s length must be the directory's occupied, block-aligned size.
pub fn parse_all(buf: &[u8]) -> EResult<Vec<(u64, DirEntry)>> {
	let mut out = Vec::new();
	let mut off = 0usize;
	while off + NAME_OFF <= buf.len() {
		let inode = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
		let rec_len = u16::from_le_bytes(buf[off + 4..off + 6].try_into().unwrap()) as usize;
		let name_len = buf[off + 6] as usize;
		let file_type_raw = buf[off + 7];
		if rec_len < NAME_OFF || off + rec_len > buf.len() {
			return Err(Errno::Io);
		}
		if inode != 0 {
			if off + NAME_OFF + name_len > buf.len() {
				return Err(Errno::Io);
			}
			let name_bytes = &buf[off + NAME_OFF..off + NAME_OFF + name_len];
			let name = String::from_utf8_lossy(name_bytes).into_owned();
			out.push((
				off as u64,
				DirEntry {
					inode,
					file_type: FileType::from_dirent_type(file_type_raw),
					name,
				},
			));
		}
		off += rec_len;
	}
	Ok(out)
}

/// Walks every live entry of a directory buffer, invoking `callback(offset, entry)` for each,
/// stopping early if the callback returns `false`.
pub fn traverse(buf: &[u8], mut callback: impl FnMut(u64, &DirEntry) -> bool) -> EResult<()> {
	for (off, ent) in parse_all(buf)? {
		if !callback(off, &ent) {
			break;
		}
	}
	Ok(())
}

/// Serializes `entries` into a directory content buffer occupying `occupied_size` bytes
/// (already rounded up to a multiple of `block_size`).
///
/// The last entry's `rec_len` is stretched to reach `occupied_size`. Fails with
/// [`Errno::NameTooLong`] if any single entry does not fit within one block.
pub fn serialize(
	entries: &[(u32, Option<FileType>, &str)],
	occupied_size: usize,
	block_size: usize,
) -> EResult<Vec<u8>> {
	let mut buf = vec![0u8; occupied_size];
	if entries.is_empty() {
		return Ok(buf);
	}
	let mut off = 0usize;
	for (i, (inode, file_type, name)) in entries.iter().enumerate() {
		if name.len() > NAME_MAX {
			return Err(Errno::NameTooLong);
		}
		let mut rec_len = dir_rec_len(name.len());
		if rec_len > block_size {
			return Err(Errno::NameTooLong);
		}
		let is_last = i + 1 == entries.len();
		if is_last {
			// Stretch to the end of the occupied span, but never cross a block boundary that a
			// following entry would need; since this is the last entry, reaching the buffer's
			// end is always correct.
			rec_len = occupied_size - off;
		} else {
			// Never let an entry straddle a block boundary.
			let block_end = (off / block_size + 1) * block_size;
			if off + rec_len > block_end {
				return Err(Errno::Io);
			}
		}
		write_entry(&mut buf[off..off + rec_len], *inode, rec_len as u16, *file_type, name)?;
		off += rec_len;
	}
	Ok(buf)
}

/// Writes a single entry's raw bytes into `slice`, which must be exactly `rec_len` bytes long.
pub fn write_entry(
	slice: &mut [u8],
	inode: u32,
	rec_len: u16,
	file_type: Option<FileType>,
	name: &str,
) -> EResult<()> {
	if slice.len() != rec_len as usize || (rec_len as usize) < NAME_OFF + name.len() {
		return Err(Errno::InvalidArg);
	}
	if name.len() > NAME_MAX {
		return Err(Errno::NameTooLong);
	}
	slice[0..4].copy_from_slice(&inode.to_le_bytes());
	slice[4..6].copy_from_slice(&rec_len.to_le_bytes());
	slice[6] = name.len() as u8;
	slice[7] = file_type.map(FileType::to_dirent_type).unwrap_or(0);
	slice[NAME_OFF..NAME_OFF + name.len()].copy_from_slice(name.as_bytes());
	for b in &mut slice[NAME_OFF + name.len()..] {
		*b = 0;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dir_rec_len_rounds_to_four() {
		assert_eq!(dir_rec_len(1), 12);
		assert_eq!(dir_rec_len(4), 12);
		assert_eq!(dir_rec_len(5), 16);
	}

	#[test]
	fn round_trip_single_block() {
		let entries = [
			(2u32, Some(FileType::Directory), "."),
			(2u32, Some(FileType::Directory), ".."),
			(5u32, Some(FileType::Regular), "a.txt"),
		];
		let buf = serialize(&entries, 1024, 1024).unwrap();
		let parsed = parse_all(&buf).unwrap();
		assert_eq!(parsed.len(), 3);
		assert_eq!(parsed[0].1.name, ".");
		assert_eq!(parsed[1].1.name, "..");
		assert_eq!(parsed[2].1.name, "a.txt");
		assert_eq!(parsed[2].1.inode, 5);
		// The last entry's rec_len must reach the end of the buffer.
		let last_off = parsed[2].0 as usize;
		let rec_len = u16::from_le_bytes(buf[last_off + 4..last_off + 6].try_into().unwrap());
		assert_eq!(last_off + rec_len as usize, 1024);
	}

	#[test]
	fn tombstones_are_skipped_by_traverse() {
		let mut buf = serialize(&[(2, Some(FileType::Directory), "a")], 1024, 1024).unwrap();
		// Manually tombstone the entry.
		buf[0..4].copy_from_slice(&0u32.to_le_bytes());
		let mut seen = 0;
		traverse(&buf, |_, _| {
			seen += 1;
			true
		})
		.unwrap();
		assert_eq!(seen, 0);
	}

	#[test]
	fn name_too_long_rejected() {
		let long_name = "x".repeat(NAME_MAX + 1);
		let entries = [(1u32, Some(FileType::Regular), long_name.as_str())];
		assert_eq!(
			serialize(&entries, 1024, 1024).unwrap_err(),
			Errno::NameTooLong
		);
	}
}
