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

//! An in-memory block device, standing in for a real disk or ramdisk.
//!
//! Used by the test suite and by [`crate::file::fs::ext2::format`] to build fixtures without
//! real hardware.

use crate::block::BlockDevice;
use crate::errno::{EResult, Errno};
use std::sync::Mutex;

/// A block device backed by a `Vec<u8>` held behind a mutex.
pub struct MemBlockDevice {
	block_size: u32,
	data: Mutex<Vec<u8>>,
}

impl MemBlockDevice {
	/// Creates a new device of `block_count` sectors of `block_size` bytes each, zero-filled.
	pub fn new(block_size: u32, block_count: u64) -> Self {
		let len = block_size as u64 * block_count;
		Self {
			block_size,
			data: Mutex::new(vec![0u8; len as usize]),
		}
	}
}

impl BlockDevice for MemBlockDevice {
	fn block_size(&self) -> u32 {
		self.block_size
	}

	fn block_count(&self) -> u64 {
		let data = self.data.lock().unwrap();
		data.len() as u64 / self.block_size as u64
	}

	fn read_block(&self, index: u64, out: &mut [u8]) -> EResult<()> {
		if out.len() != self.block_size as usize {
			return Err(Errno::InvalidArg);
		}
		let data = self.data.lock().unwrap();
		let off = index as usize * self.block_size as usize;
		let end = off + self.block_size as usize;
		let Some(src) = data.get(off..end) else {
			return Err(Errno::Io);
		};
		out.copy_from_slice(src);
		Ok(())
	}

	fn write_block(&self, index: u64, data: &[u8]) -> EResult<()> {
		if data.len() != self.block_size as usize {
			return Err(Errno::InvalidArg);
		}
		let mut buf = self.data.lock().unwrap();
		let off = index as usize * self.block_size as usize;
		let end = off + self.block_size as usize;
		let Some(dst) = buf.get_mut(off..end) else {
			return Err(Errno::Io);
		};
		dst.copy_from_slice(data);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trip() {
		let dev = MemBlockDevice::new(512, 4);
		let data = [0xaau8; 512];
		dev.write_block(1, &data).unwrap();
		let mut out = [0u8; 512];
		dev.read_block(1, &mut out).unwrap();
		assert_eq!(out, data);
	}

	#[test]
	fn out_of_range() {
		let dev = MemBlockDevice::new(512, 2);
		let mut out = [0u8; 512];
		assert_eq!(dev.read_block(5, &mut out), Err(Errno::Io));
	}
}
