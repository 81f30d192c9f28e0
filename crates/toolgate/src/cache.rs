// Bounded, thread-safe map with approximate least-recently-used eviction.
//
// Used for rate-limit buckets and the per-endpoint HTTP client pool. The
// cache favours short critical sections over exact LRU order: recency is a
// relaxed atomic tick updated under the read lock, so concurrent touches can
// reorder, and eviction picks the entry with the lowest observed tick.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

struct CacheSlot<V> {
	value: V,
	touched: AtomicU64,
}

/// Thread-safe `K -> V` map bounded at `max_size` entries.
///
/// `get_or_add` gives a publication guarantee, not an execution guarantee:
/// all concurrent callers for the same key observe the same eventual value,
/// but the factory may run more than once under contention, with losing
/// results discarded. The map may transiently exceed `max_size` by a small
/// constant before eviction converges.
pub struct LruCache<K, V> {
	max_size: usize,
	tick: AtomicU64,
	inner: RwLock<HashMap<K, CacheSlot<V>>>,
}

impl<K, V> LruCache<K, V>
where
	K: Eq + Hash + Clone,
	V: Clone,
{
	pub fn new(max_size: usize) -> Self {
		assert!(max_size > 0, "cache max_size must be positive");
		Self {
			max_size,
			tick: AtomicU64::new(0),
			inner: RwLock::new(HashMap::new()),
		}
	}

	fn next_tick(&self) -> u64 {
		self.tick.fetch_add(1, Ordering::Relaxed)
	}

	/// Return the value for `key`, inserting the factory's result if absent.
	/// The first insert wins; a racing factory's value is dropped.
	pub fn get_or_add(&self, key: K, factory: impl FnOnce() -> V) -> V {
		{
			let map = self.inner.read();
			if let Some(slot) = map.get(&key) {
				slot.touched.store(self.next_tick(), Ordering::Relaxed);
				return slot.value.clone();
			}
		}

		// Built outside the lock; may race with other callers.
		let candidate = factory();

		let mut map = self.inner.write();
		let slot = map.entry(key).or_insert_with(|| CacheSlot {
			value: candidate,
			touched: AtomicU64::new(0),
		});
		slot.touched.store(self.next_tick(), Ordering::Relaxed);
		let value = slot.value.clone();
		if map.len() > self.max_size {
			Self::evict(&mut map, self.max_size);
		}
		value
	}

	/// Look up a value, updating its recency on hit.
	pub fn try_get(&self, key: &K) -> Option<V> {
		let map = self.inner.read();
		map.get(key).map(|slot| {
			slot.touched.store(self.next_tick(), Ordering::Relaxed);
			slot.value.clone()
		})
	}

	pub fn try_remove(&self, key: &K) -> Option<V> {
		self.inner.write().remove(key).map(|slot| slot.value)
	}

	pub fn clear(&self) {
		self.inner.write().clear();
	}

	pub fn len(&self) -> usize {
		self.inner.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.read().is_empty()
	}

	/// Keep only the entries the predicate accepts. Does not touch recency.
	pub fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) {
		self.inner.write().retain(|k, slot| keep(k, &slot.value));
	}

	fn evict(map: &mut HashMap<K, CacheSlot<V>>, max_size: usize) {
		while map.len() > max_size {
			let victim = map
				.iter()
				.min_by_key(|(_, slot)| slot.touched.load(Ordering::Relaxed))
				.map(|(k, _)| k.clone());
			match victim {
				Some(k) => {
					map.remove(&k);
				},
				None => break,
			}
		}
	}
}
