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

//! A read/write ext2-compatible filesystem engine over a generic block device.
//!
//! This crate implements the on-disk structures and algorithms of the ext2 filesystem behind a
//! generic [`file::fs::Fs`]/
//! [`file::fs::InodeOps`] capability set, mounted through a small [`file::vfs::Vfs`] that performs
//! path resolution, permission checks and symlink expansion. A [`block::BlockDevice`] is the only
//! thing a caller must supply; [`block::mem::MemBlockDevice`] and [`file::fs::ext2::format`] are
//! provided for building fixtures without a real disk.
//!
//! ```
//! use std::sync::Arc;
//! use ext2fs::block::mem::MemBlockDevice;
//! use ext2fs::file::fd::OpenFlags;
//! use ext2fs::file::fs::ext2::{self, FormatOptions};
//! use ext2fs::file::path::Path;
//! use ext2fs::file::perm::AccessProfile;
//! use ext2fs::file::vfs::Vfs;
//!
//! let device = Arc::new(MemBlockDevice::new(512, 2048));
//! let fs = ext2::format(device, FormatOptions::default(), ext2::Ext2Config::default()).unwrap();
//! let vfs = Vfs::new();
//! vfs.mount_root(Arc::new(fs));
//!
//! let profile = AccessProfile::ROOT;
//! let path = Path::new("/hello.txt").unwrap();
//! let id = vfs
//!     .open(&path, None, &profile, OpenFlags::CREAT | OpenFlags::WRONLY, 0o644)
//!     .unwrap();
//! vfs.inode(id).unwrap().write_bytes(0, b"hi").unwrap();
//! ```

pub mod block;
pub mod cache;
pub mod errno;
pub mod file;

pub use errno::{EResult, Errno};
