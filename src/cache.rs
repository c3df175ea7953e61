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

//! The process-wide block cache.
//!
//! Entries are keyed by `(fs_id, block_index)` so that distinct filesystem instances never
//! collide, even though the cache itself is a single, global structure shared across all mounted
//! filesystems. Eviction is least-recently-used; capacity is fixed at construction rather than
//! being a hidden global.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, OnceLock};

/// A cache key: filesystem id plus logical block index within that filesystem.
pub type CacheKey = (u32, u64);

struct Inner {
	capacity: usize,
	map: HashMap<CacheKey, Vec<u8>>,
	/// Recency order, oldest first. Kept in sync with `map` by `touch`.
	order: VecDeque<CacheKey>,
}

impl Inner {
	fn touch(&mut self, key: CacheKey) {
		if let Some(pos) = self.order.iter().position(|k| *k == key) {
			self.order.remove(pos);
		}
		self.order.push_back(key);
	}

	fn evict_if_needed(&mut self) {
		while self.map.len() > self.capacity {
			if let Some(oldest) = self.order.pop_front() {
				self.map.remove(&oldest);
			} else {
				break;
			}
		}
	}
}

/// A process-wide, LRU-evicted cache of filesystem blocks.
pub struct BlockCache {
	inner: Mutex<Inner>,
}

/// The default number of blocks kept resident by the global cache.
pub const DEFAULT_CAPACITY: usize = 4096;

impl BlockCache {
	/// Creates a new cache holding at most `capacity` blocks.
	pub fn new(capacity: usize) -> Self {
		Self {
			inner: Mutex::new(Inner {
				capacity,
				map: HashMap::new(),
				order: VecDeque::new(),
			}),
		}
	}

	/// Returns the process-wide instance, created on first use with [`DEFAULT_CAPACITY`].
	pub fn global() -> &'static Self {
		static GLOBAL: OnceLock<BlockCache> = OnceLock::new();
		GLOBAL.get_or_init(|| BlockCache::new(DEFAULT_CAPACITY))
	}

	/// Returns a copy of the cached bytes for `(fs_id, index)`, if present, marking the entry
	/// most-recently-used.
	pub fn get(&self, fs_id: u32, index: u64) -> Option<Vec<u8>> {
		let mut inner = self.inner.lock().unwrap();
		let key = (fs_id, index);
		let hit = inner.map.get(&key).cloned();
		if hit.is_some() {
			inner.touch(key);
		}
		hit
	}

	/// Installs or overwrites the cached bytes for `(fs_id, index)`.
	pub fn insert(&self, fs_id: u32, index: u64, data: Vec<u8>) {
		let mut inner = self.inner.lock().unwrap();
		let key = (fs_id, index);
		inner.map.insert(key, data);
		inner.touch(key);
		inner.evict_if_needed();
	}

	/// Removes every entry belonging to `fs_id`, e.g. on unmount.
	pub fn invalidate_fs(&self, fs_id: u32) {
		let mut inner = self.inner.lock().unwrap();
		inner.map.retain(|k, _| k.0 != fs_id);
		inner.order.retain(|k| k.0 != fs_id);
	}

	/// The number of blocks currently resident, across every filesystem.
	pub fn len(&self) -> usize {
		self.inner.lock().unwrap().map.len()
	}

	/// Whether the cache currently holds no blocks.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hit_and_miss() {
		let cache = BlockCache::new(4);
		assert!(cache.get(1, 0).is_none());
		cache.insert(1, 0, vec![1, 2, 3]);
		assert_eq!(cache.get(1, 0), Some(vec![1, 2, 3]));
	}

	#[test]
	fn fs_ids_do_not_collide() {
		let cache = BlockCache::new(4);
		cache.insert(1, 0, vec![0xAA]);
		cache.insert(2, 0, vec![0xBB]);
		assert_eq!(cache.get(1, 0), Some(vec![0xAA]));
		assert_eq!(cache.get(2, 0), Some(vec![0xBB]));
	}

	#[test]
	fn lru_eviction() {
		let cache = BlockCache::new(2);
		cache.insert(1, 0, vec![0]);
		cache.insert(1, 1, vec![1]);
		// touch block 0 so block 1 becomes the least recently used
		cache.get(1, 0);
		cache.insert(1, 2, vec![2]);
		assert!(cache.get(1, 1).is_none());
		assert!(cache.get(1, 0).is_some());
		assert!(cache.get(1, 2).is_some());
	}

	#[test]
	fn invalidate_fs_removes_only_that_fs() {
		let cache = BlockCache::new(4);
		cache.insert(1, 0, vec![0]);
		cache.insert(2, 0, vec![1]);
		cache.invalidate_fs(1);
		assert!(cache.get(1, 0).is_none());
		assert!(cache.get(2, 0).is_some());
	}
}
