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

//! Error handling for the engine.
//!
//! The filesystem never panics on an inconsistency it can detect at runtime: every fallible path
//! returns an [`Errno`], mirroring the POSIX `errno` values a VFS caller would expect to see at
//! the syscall boundary.

use std::fmt;
use std::io;

/// The error type returned by every fallible operation in this crate.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Errno {
	/// A path component does not exist.
	NotFound,
	/// A non-terminal path component is not a directory.
	NotDirectory,
	/// The operation is disallowed on a directory.
	IsDirectory,
	/// The create/link/mkdir target already exists.
	AlreadyExists,
	/// `rmdir` was called on a directory with entries other than `.`/`..`.
	NotEmpty,
	/// The bitmap scan found insufficient free inodes or blocks.
	NoSpace,
	/// The call mutates a filesystem mounted read-only.
	ReadOnly,
	/// The descriptor has no inode and no device backing it.
	BadFd,
	/// Underlying device I/O failure, or an inconsistency in on-disk structures.
	Io,
	/// Symlink resolution depth exceeded.
	TooManyLinks,
	/// `O_NOFOLLOW` hit a final-component symlink.
	Loop,
	/// Bad offset/whence/empty path/non-block-aligned I/O request.
	InvalidArg,
	/// `seek` on a FIFO/socket descriptor.
	Pipe,
	/// Permission denied.
	Access,
	/// A name exceeds `NAME_MAX`.
	NameTooLong,
	/// The filesystem's on-disk structures failed validation (bad magic, inconsistent counts).
	InvalidFs,
}

impl fmt::Display for Errno {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::NotFound => "no such file or directory",
			Self::NotDirectory => "not a directory",
			Self::IsDirectory => "is a directory",
			Self::AlreadyExists => "file already exists",
			Self::NotEmpty => "directory not empty",
			Self::NoSpace => "no space left on device",
			Self::ReadOnly => "read-only filesystem",
			Self::BadFd => "bad file descriptor",
			Self::Io => "input/output error",
			Self::TooManyLinks => "too many levels of symbolic links",
			Self::Loop => "symbolic link loop encountered",
			Self::InvalidArg => "invalid argument",
			Self::Pipe => "illegal seek",
			Self::Access => "permission denied",
			Self::NameTooLong => "file name too long",
			Self::InvalidFs => "invalid filesystem",
		};
		f.write_str(s)
	}
}

impl std::error::Error for Errno {}

impl From<io::Error> for Errno {
	fn from(_: io::Error) -> Self {
		Self::Io
	}
}

/// Shorthand result type used throughout the engine.
pub type EResult<T> = Result<T, Errno>;
