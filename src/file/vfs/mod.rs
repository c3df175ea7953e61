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

//! The virtual filesystem: a mount table over [`Fs`] instances, path resolution, and the
//! syscall-shaped operations built on top of it.

use crate::errno::{EResult, Errno};
use crate::file::fd::OpenFlags;
use crate::file::fs::{Fs, InodeHandle};
use crate::file::path::Path;
use crate::file::perm::{self, AccessProfile};
use crate::file::{FileType, InodeIdentifier, Mode, Stat};
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// The maximum number of symlinks resolved while resolving a single path, after which resolution
/// fails with [`Errno::TooManyLinks`] (matches Linux's `SYMLOOP_MAX`).
pub const SYMLOOP_MAX: u32 = 40;

/// The set of mounted filesystems and the path-resolution logic that walks across them.
pub struct Vfs {
	/// Mounts keyed by the host inode they are grafted onto. The root mount has no host inode
	/// and is stored separately.
	mounts: RwLock<HashMap<InodeIdentifier, Arc<dyn Fs>>>,
	/// The inverse of `mounts`: a mounted filesystem's root inode id -> the host inode it is
	/// grafted onto. Used to cross back out of a mount when `..` is resolved against a guest
	/// root.
	reverse_mounts: RwLock<HashMap<InodeIdentifier, InodeIdentifier>>,
	root: RwLock<Option<Arc<dyn Fs>>>,
}

impl Default for Vfs {
	fn default() -> Self {
		Self::new()
	}
}

impl Vfs {
	/// Creates an empty VFS with nothing mounted.
	pub fn new() -> Self {
		Self {
			mounts: RwLock::new(HashMap::new()),
			reverse_mounts: RwLock::new(HashMap::new()),
			root: RwLock::new(None),
		}
	}

	/// Mounts `fs` as the root of the whole namespace.
	pub fn mount_root(&self, fs: Arc<dyn Fs>) {
		debug!("mounting fs id={} as the namespace root", fs.id());
		*self.root.write().unwrap() = Some(fs);
	}

	/// Grafts `fs`'s root onto the directory identified by `host`.
	pub fn mount(&self, host: InodeIdentifier, fs: Arc<dyn Fs>) {
		debug!("mounting fs id={} on host inode {host:?}", fs.id());
		let guest_root = fs.root_inode_id();
		self.reverse_mounts.write().unwrap().insert(guest_root, host);
		self.mounts.write().unwrap().insert(host, fs);
	}

	/// Removes whatever filesystem is mounted at `host`, if any.
	pub fn unmount(&self, host: InodeIdentifier) {
		if let Some(fs) = self.mounts.write().unwrap().remove(&host) {
			debug!("unmounting fs id={} from host inode {host:?}", fs.id());
			self.reverse_mounts.write().unwrap().remove(&fs.root_inode_id());
		}
	}

	fn root_fs(&self) -> EResult<Arc<dyn Fs>> {
		self.root.read().unwrap().clone().ok_or(Errno::InvalidFs)
	}

	fn fs_for(&self, fs_id: u32) -> EResult<Arc<dyn Fs>> {
		if let Some(root) = self.root.read().unwrap().as_ref() {
			if root.id() == fs_id {
				return Ok(root.clone());
			}
		}
		self.mounts
			.read()
			.unwrap()
			.values()
			.find(|fs| fs.id() == fs_id)
			.cloned()
			.ok_or(Errno::InvalidFs)
	}

	fn get_inode(&self, id: InodeIdentifier) -> EResult<InodeHandle> {
		self.fs_for(id.fs_id)?
			.get_inode(id.index)?
			.ok_or(Errno::NotFound)
	}

	/// If a filesystem is mounted on `id`, returns that filesystem's root inode identifier;
	/// otherwise returns `id` unchanged. Crossing a mount point always lands on the guest's root.
	fn cross_mount(&self, id: InodeIdentifier) -> InodeIdentifier {
		if let Some(fs) = self.mounts.read().unwrap().get(&id) {
			return fs.root_inode_id();
		}
		id
	}

	/// Resolves `path` to an inode, following symlinks per `follow_final`.
	///
	/// `base` anchors a relative path: if `path` does not start with `/`, resolution starts from
	/// `base` (or the namespace root if `base` is `None` or [`InodeIdentifier::INVALID`]).
	/// Absolute paths always start at the namespace root regardless of `base`.
	///
	/// `follow_final` controls only the last component: intermediate components are always
	/// followed (a symlink standing in for a directory along the way is transparent). Passing
	/// `false` paired with `error_on_symlink = true` returns [`Errno::Loop`] if the final
	/// component is a symlink (`O_NOFOLLOW`); `false` paired with `false` returns the symlink
	/// inode itself without error (`O_NOFOLLOW_NOERROR`).
	pub fn resolve(
		&self,
		path: &Path,
		base: Option<InodeIdentifier>,
		profile: &AccessProfile,
		follow_final: bool,
		error_on_symlink: bool,
	) -> EResult<InodeIdentifier> {
		if path.as_str().is_empty() {
			return Err(Errno::InvalidArg);
		}
		let root_fs = self.root_fs()?;
		let mut current = if path.is_absolute() {
			self.cross_mount(root_fs.root_inode_id())
		} else {
			match base {
				Some(b) if b.is_valid() => b,
				_ => self.cross_mount(root_fs.root_inode_id()),
			}
		};
		let mut depth = 0u32;
		let components: Vec<&str> = path.components().collect();
		self.resolve_components(
			&components,
			&mut current,
			profile,
			follow_final,
			error_on_symlink,
			&mut depth,
		)?;
		Ok(current)
	}

	fn resolve_components(
		&self,
		components: &[&str],
		current: &mut InodeIdentifier,
		profile: &AccessProfile,
		follow_final: bool,
		error_on_symlink: bool,
		depth: &mut u32,
	) -> EResult<()> {
		for (i, name) in components.iter().enumerate() {
			let is_last = i + 1 == components.len();
			if *name == ".." {
				if let Some(host) = self.reverse_mounts.read().unwrap().get(current).copied() {
					trace!("crossing back out of mount at {current:?} via host {host:?}");
					let host_inode = self.get_inode(host)?;
					let up = host_inode.lookup("..")?.ok_or(Errno::NotFound)?;
					*current = self.cross_mount(up);
					continue;
				}
			}
			let dir = self.get_inode(*current)?;
			if dir.file_type()? != FileType::Directory {
				return Err(Errno::NotDirectory);
			}
			if !profile.can_search(&dir.stat()?) {
				return Err(Errno::Access);
			}
			let child_id = dir.lookup(name)?.ok_or(Errno::NotFound)?;
			let child = self.get_inode(child_id)?;
			if child.file_type()? == FileType::Link && (!is_last || follow_final) {
				if is_last && !follow_final && !error_on_symlink {
					*current = child_id;
					return Ok(());
				}
				if is_last && !follow_final && error_on_symlink {
					return Err(Errno::Loop);
				}
				*depth += 1;
				if *depth > SYMLOOP_MAX {
					warn!("symlink resolution exceeded SYMLOOP_MAX ({SYMLOOP_MAX})");
					return Err(Errno::TooManyLinks);
				}
				trace!("expanding symlink {child_id:?} (depth {depth})");
				let target = child.read_link()?;
				let target_path = Path::new(&target)?;
				if target_path.is_absolute() {
					let root_fs = self.root_fs()?;
					*current = self.cross_mount(root_fs.root_inode_id());
				}
				let target_components: Vec<&str> = target_path.components().collect();
				self.resolve_components(
					&target_components,
					current,
					profile,
					follow_final,
					error_on_symlink,
					depth,
				)?;
				if !is_last {
					continue;
				}
				return Ok(());
			}
			*current = self.cross_mount(child_id);
		}
		Ok(())
	}

	/// Splits `path` into its parent directory and final component name, resolved relative to
	/// `base` exactly as [`Self::resolve`] would.
	fn split_parent<'p>(
		&self,
		path: &Path<'p>,
		base: Option<InodeIdentifier>,
	) -> EResult<(InodeIdentifier, &'p str)> {
		let mut components: Vec<&str> = path.components().collect();
		let name = components.pop().ok_or(Errno::InvalidArg)?;
		let parent_components = components;
		let root_fs = self.root_fs()?;
		let mut current = if path.is_absolute() {
			self.cross_mount(root_fs.root_inode_id())
		} else {
			match base {
				Some(b) if b.is_valid() => b,
				_ => self.cross_mount(root_fs.root_inode_id()),
			}
		};
		let profile = AccessProfile::ROOT;
		let mut depth = 0;
		self.resolve_components(
			&parent_components,
			&mut current,
			&profile,
			true,
			false,
			&mut depth,
		)?;
		Ok((current, name))
	}

	/// Looks up `path`, returning its inode handle. Equivalent to `stat` plus inode retrieval.
	pub fn lookup(
		&self,
		path: &Path,
		base: Option<InodeIdentifier>,
		profile: &AccessProfile,
		flags: OpenFlags,
	) -> EResult<InodeIdentifier> {
		let follow_final = !flags.contains(OpenFlags::NOFOLLOW)
			&& !flags.contains(OpenFlags::NOFOLLOW_NOERROR);
		let error_on_symlink = flags.contains(OpenFlags::NOFOLLOW);
		let id = self.resolve(path, base, profile, follow_final, error_on_symlink)?;
		if flags.contains(OpenFlags::DIRECTORY) {
			let inode = self.get_inode(id)?;
			if inode.file_type()? != FileType::Directory {
				return Err(Errno::NotDirectory);
			}
		}
		Ok(id)
	}

	/// `open()`: resolves `path` (relative to `base` if not absolute), optionally creating it if
	/// `O_CREAT` is set.
	pub fn open(
		&self,
		path: &Path,
		base: Option<InodeIdentifier>,
		profile: &AccessProfile,
		flags: OpenFlags,
		mode: Mode,
	) -> EResult<InodeIdentifier> {
		match self.lookup(path, base, profile, flags) {
			Ok(id) => {
				if flags.contains(OpenFlags::CREAT) && flags.contains(OpenFlags::EXCL) {
					return Err(Errno::AlreadyExists);
				}
				Ok(id)
			}
			Err(Errno::NotFound) if flags.contains(OpenFlags::CREAT) => {
				let (parent, name) = self.split_parent(path, base)?;
				self.create(parent, name, profile, mode)
			}
			Err(e) => Err(e),
		}
	}

	fn create(
		&self,
		parent: InodeIdentifier,
		name: &str,
		profile: &AccessProfile,
		mode: Mode,
	) -> EResult<InodeIdentifier> {
		let parent_inode = self.get_inode(parent)?;
		if !profile.can_access(&parent_inode.stat()?, perm::W_OK) {
			return Err(Errno::Access);
		}
		let fs = self.fs_for(parent.fs_id)?;
		fs.create_inode(parent.index, name, mode, 0)
	}

	/// `mkdir()`.
	pub fn mkdir(
		&self,
		path: &Path,
		base: Option<InodeIdentifier>,
		profile: &AccessProfile,
		mode: Mode,
	) -> EResult<InodeIdentifier> {
		let (parent, name) = self.split_parent(path, base)?;
		let parent_inode = self.get_inode(parent)?;
		if !profile.can_access(&parent_inode.stat()?, perm::W_OK) {
			return Err(Errno::Access);
		}
		let fs = self.fs_for(parent.fs_id)?;
		fs.create_directory(parent.index, name, mode)
	}

	/// `symlink()`.
	pub fn symlink(
		&self,
		path: &Path,
		base: Option<InodeIdentifier>,
		target: &str,
		profile: &AccessProfile,
	) -> EResult<InodeIdentifier> {
		let (parent, name) = self.split_parent(path, base)?;
		let parent_inode = self.get_inode(parent)?;
		if !profile.can_access(&parent_inode.stat()?, perm::W_OK) {
			return Err(Errno::Access);
		}
		let fs = self.fs_for(parent.fs_id)?;
		fs.create_symlink(parent.index, name, target)
	}

	/// `link()`: adds a new name for an existing inode (hard link). Refuses to link directories
	/// and to cross filesystems.
	pub fn link(
		&self,
		existing: &Path,
		new_path: &Path,
		base: Option<InodeIdentifier>,
		profile: &AccessProfile,
	) -> EResult<()> {
		let existing_id = self.resolve(existing, base, profile, true, false)?;
		let existing_inode = self.get_inode(existing_id)?;
		if existing_inode.file_type()? == FileType::Directory {
			return Err(Errno::IsDirectory);
		}
		let (parent, name) = self.split_parent(new_path, base)?;
		if parent.fs_id != existing_id.fs_id {
			return Err(Errno::InvalidArg);
		}
		let parent_inode = self.get_inode(parent)?;
		if !profile.can_access(&parent_inode.stat()?, perm::W_OK) {
			return Err(Errno::Access);
		}
		parent_inode.add_child(existing_id, name, existing_inode.file_type()?)
	}

	/// `unlink()`. Refuses non-empty directories: use [`Self::rmdir`] for those.
	pub fn unlink(
		&self,
		path: &Path,
		base: Option<InodeIdentifier>,
		profile: &AccessProfile,
	) -> EResult<()> {
		let (parent, name) = self.split_parent(path, base)?;
		let parent_inode = self.get_inode(parent)?;
		if !profile.can_access(&parent_inode.stat()?, perm::W_OK) {
			return Err(Errno::Access);
		}
		let id = parent_inode.lookup(name)?.ok_or(Errno::NotFound)?;
		let inode = self.get_inode(id)?;
		if inode.file_type()? == FileType::Directory {
			return Err(Errno::IsDirectory);
		}
		parent_inode.remove_child(name)?;
		Ok(())
	}

	/// `rmdir()`. Refuses directories containing anything beyond `.`/`..`.
	pub fn rmdir(
		&self,
		path: &Path,
		base: Option<InodeIdentifier>,
		profile: &AccessProfile,
	) -> EResult<()> {
		let (parent, name) = self.split_parent(path, base)?;
		let parent_inode = self.get_inode(parent)?;
		if !profile.can_access(&parent_inode.stat()?, perm::W_OK) {
			return Err(Errno::Access);
		}
		let id = parent_inode.lookup(name)?.ok_or(Errno::NotFound)?;
		let inode = self.get_inode(id)?;
		if inode.file_type()? != FileType::Directory {
			return Err(Errno::NotDirectory);
		}
		let mut entry_count = 0;
		inode.traverse(&mut |entry_name, _, _| {
			if entry_name != "." && entry_name != ".." {
				entry_count += 1;
				return false;
			}
			true
		})?;
		if entry_count > 0 {
			return Err(Errno::NotEmpty);
		}
		parent_inode.remove_child(name)?;
		Ok(())
	}

	/// `stat()`.
	pub fn stat(
		&self,
		path: &Path,
		base: Option<InodeIdentifier>,
		profile: &AccessProfile,
	) -> EResult<Stat> {
		let id = self.resolve(path, base, profile, true, false)?;
		self.get_inode(id)?.stat()
	}

	/// `lstat()`: like [`Self::stat`] but does not follow a final-component symlink.
	pub fn lstat(
		&self,
		path: &Path,
		base: Option<InodeIdentifier>,
		profile: &AccessProfile,
	) -> EResult<Stat> {
		let id = self.resolve(path, base, profile, false, false)?;
		self.get_inode(id)?.stat()
	}

	/// `chmod()`.
	pub fn chmod(
		&self,
		path: &Path,
		base: Option<InodeIdentifier>,
		profile: &AccessProfile,
		mode: Mode,
	) -> EResult<()> {
		let id = self.resolve(path, base, profile, true, false)?;
		let inode = self.get_inode(id)?;
		let stat = inode.stat()?;
		if profile.uid != 0 && profile.uid != stat.uid {
			return Err(Errno::Access);
		}
		inode.chmod(mode)
	}

	/// `chown()`. Only root may change ownership.
	pub fn chown(
		&self,
		path: &Path,
		base: Option<InodeIdentifier>,
		profile: &AccessProfile,
		uid: u32,
		gid: u32,
	) -> EResult<()> {
		if profile.uid != 0 {
			return Err(Errno::Access);
		}
		let id = self.resolve(path, base, profile, true, false)?;
		self.get_inode(id)?.chown(uid, gid)
	}

	/// `utime()`.
	pub fn utime(
		&self,
		path: &Path,
		base: Option<InodeIdentifier>,
		profile: &AccessProfile,
		atime: Option<u32>,
		mtime: Option<u32>,
	) -> EResult<()> {
		let id = self.resolve(path, base, profile, true, false)?;
		let inode = self.get_inode(id)?;
		let stat = inode.stat()?;
		if profile.uid != 0 && profile.uid != stat.uid {
			return Err(Errno::Access);
		}
		inode.set_times(atime, mtime)
	}

	/// `access()`: checks `mask` (a combination of [`perm::R_OK`]/[`perm::W_OK`]/[`perm::X_OK`])
	/// against `path` without opening it.
	pub fn access(
		&self,
		path: &Path,
		base: Option<InodeIdentifier>,
		profile: &AccessProfile,
		mask: u8,
	) -> EResult<()> {
		let id = self.resolve(path, base, profile, true, false)?;
		let stat = self.get_inode(id)?.stat()?;
		if profile.can_access(&stat, mask) {
			Ok(())
		} else {
			Err(Errno::Access)
		}
	}

	/// Fetches an inode handle directly by identifier, bypassing path resolution. Used by
	/// [`crate::file::fd::FileDescriptor`] once a path has already been resolved at `open` time.
	pub fn inode(&self, id: InodeIdentifier) -> EResult<InodeHandle> {
		self.get_inode(id)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::block::mem::MemBlockDevice;
	use crate::file::fs::ext2;
	use std::sync::Arc;

	fn fixture() -> Vfs {
		let device = Arc::new(MemBlockDevice::new(512, 2048));
		let fs = ext2::format(device, ext2::FormatOptions::default(), ext2::Ext2Config::default()).unwrap();
		let vfs = Vfs::new();
		vfs.mount_root(Arc::new(fs));
		vfs
	}

	#[test]
	fn root_resolves() {
		let vfs = fixture();
		let profile = AccessProfile::ROOT;
		let id = vfs
			.resolve(&Path::new("/").unwrap(), None, &profile, true, false)
			.unwrap();
		assert_eq!(vfs.inode(id).unwrap().file_type().unwrap(), FileType::Directory);
	}

	#[test]
	fn create_lookup_and_remove_a_file() {
		let vfs = fixture();
		let profile = AccessProfile::ROOT;
		let path = Path::new("/a.txt").unwrap();
		vfs.open(
			&path,
			None,
			&profile,
			OpenFlags::CREAT | OpenFlags::WRONLY,
			0o644,
		)
		.unwrap();
		assert!(vfs.stat(&path, None, &profile).is_ok());
		vfs.unlink(&path, None, &profile).unwrap();
		assert_eq!(vfs.stat(&path, None, &profile).unwrap_err(), Errno::NotFound);
	}

	#[test]
	fn mkdir_then_rmdir() {
		let vfs = fixture();
		let profile = AccessProfile::ROOT;
		let path = Path::new("/sub").unwrap();
		vfs.mkdir(&path, None, &profile, 0o755).unwrap();
		let stat = vfs.stat(&path, None, &profile).unwrap();
		assert_eq!(stat.mode & 0o170000, crate::file::S_IFDIR);
		vfs.rmdir(&path, None, &profile).unwrap();
		assert_eq!(vfs.stat(&path, None, &profile).unwrap_err(), Errno::NotFound);
	}

	#[test]
	fn nofollow_returns_the_symlink_itself() {
		let vfs = fixture();
		let profile = AccessProfile::ROOT;
		vfs.symlink(&Path::new("/link").unwrap(), None, "missing-target", &profile)
			.unwrap();
		let id = vfs
			.lookup(
				&Path::new("/link").unwrap(),
				None,
				&profile,
				OpenFlags::NOFOLLOW_NOERROR,
			)
			.unwrap();
		assert_eq!(vfs.inode(id).unwrap().file_type().unwrap(), FileType::Link);
	}

	#[test]
	fn nofollow_with_error_rejects_a_final_symlink() {
		let vfs = fixture();
		let profile = AccessProfile::ROOT;
		vfs.symlink(&Path::new("/link2").unwrap(), None, "missing-target", &profile)
			.unwrap();
		let err = vfs
			.lookup(
				&Path::new("/link2").unwrap(),
				None,
				&profile,
				OpenFlags::NOFOLLOW,
			)
			.unwrap_err();
		assert_eq!(err, Errno::Loop);
	}

	#[test]
	fn relative_lookup_via_base() {
		let vfs = fixture();
		let profile = AccessProfile::ROOT;
		let sub = vfs
			.mkdir(&Path::new("/sub").unwrap(), None, &profile, 0o755)
			.unwrap();
		vfs.open(
			&Path::new("inner.txt").unwrap(),
			Some(sub),
			&profile,
			OpenFlags::CREAT | OpenFlags::WRONLY,
			0o644,
		)
		.unwrap();
		let stat = vfs
			.stat(&Path::new("inner.txt").unwrap(), Some(sub), &profile)
			.unwrap();
		assert_eq!(stat.mode & 0o170000, crate::file::S_IFREG);
	}

	#[test]
	fn dotdot_crosses_back_out_of_a_mount() {
		let vfs = fixture();
		let profile = AccessProfile::ROOT;
		let host_dir = vfs
			.mkdir(&Path::new("/mnt").unwrap(), None, &profile, 0o755)
			.unwrap();
		let device = Arc::new(MemBlockDevice::new(512, 2048));
		let inner_fs = ext2::format(device, ext2::FormatOptions::default(), ext2::Ext2Config::default()).unwrap();
		vfs.mount(host_dir, Arc::new(inner_fs));
		let up = vfs
			.resolve(
				&Path::new("..").unwrap(),
				Some(vfs.cross_mount(host_dir)),
				&profile,
				true,
				false,
			)
			.unwrap();
		let root = vfs
			.resolve(&Path::new("/").unwrap(), None, &profile, true, false)
			.unwrap();
		assert_eq!(up, root);
	}
}
