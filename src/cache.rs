//! The per-URL fragment cache.
//!
//! The cache has two access methods:
//! - by order of arrival, used when forwarding datagrams at relays;
//! - by `(group_id, object_id, offset)`, used when sending on streams.
//!
//! Arrival order is a doubly linked list threaded through an arena of
//! fragment slots; key order is a map from fragment key to arena index. A
//! fragment belongs to both at once, so readers with independent cursors can
//! traverse either way while the consumer keeps merging new data in.

use std::collections::BTreeMap;

use bytes::Bytes;

/// Cache-wide ordering key for a fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FragmentKey {
	pub group_id: u64,
	pub object_id: u64,
	pub offset: u64,
}

impl FragmentKey {
	pub fn new(group_id: u64, object_id: u64, offset: u64) -> Self {
		Self {
			group_id,
			object_id,
			offset,
		}
	}

	/// The `(group, object)` pair, for object-level comparisons.
	pub fn object(&self) -> (u64, u64) {
		(self.group_id, self.object_id)
	}
}

/// A cached fragment and its transport metadata.
#[derive(Debug)]
pub struct CachedFragment {
	pub group_id: u64,
	pub object_id: u64,
	pub offset: u64,
	pub data: Bytes,
	pub queue_delay: u64,
	pub flags: u8,
	/// Declares the object count of the previous group; meaningful only when
	/// `object_id == 0 && offset == 0`.
	pub nb_objects_previous_group: u64,
	pub is_last_fragment: bool,
	/// Local monotonic time at which the fragment entered this cache.
	pub cache_time: u64,

	next_in_order: Option<usize>,
	previous_in_order: Option<usize>,
}

impl CachedFragment {
	pub fn key(&self) -> FragmentKey {
		FragmentKey::new(self.group_id, self.object_id, self.offset)
	}
}

/// The fragment cache of one media source.
#[derive(Debug, Default)]
pub struct FragmentCache {
	slots: Vec<Option<CachedFragment>>,
	free: Vec<usize>,
	by_key: BTreeMap<FragmentKey, usize>,
	head: Option<usize>,
	tail: Option<usize>,

	first_group_id: u64,
	first_object_id: u64,
	next_group_id: u64,
	next_object_id: u64,
	next_offset: u64,
	final_point: Option<(u64, u64)>,

	pub(crate) is_closed: bool,
	pub(crate) is_real_time: bool,
	pub(crate) delete_time: Option<u64>,
	pub(crate) nb_object_received: u64,
}

impl FragmentCache {
	pub fn new() -> Self {
		Self::default()
	}

	/// The earliest addressable `(group, object)`.
	pub fn first(&self) -> (u64, u64) {
		(self.first_group_id, self.first_object_id)
	}

	/// The contiguous-receive frontier: everything below exists in the cache.
	pub fn next(&self) -> (u64, u64, u64) {
		(self.next_group_id, self.next_object_id, self.next_offset)
	}

	/// The end of the media, once learned. No object at or past this point exists.
	pub fn final_point(&self) -> Option<(u64, u64)> {
		self.final_point
	}

	pub fn is_closed(&self) -> bool {
		self.is_closed
	}

	pub fn is_real_time(&self) -> bool {
		self.is_real_time
	}

	/// The number of objects known to be completely received.
	pub fn nb_object_received(&self) -> u64 {
		self.nb_object_received
	}

	pub fn is_empty(&self) -> bool {
		self.by_key.is_empty()
	}

	pub fn len(&self) -> usize {
		self.by_key.len()
	}

	/// Whether the frontier has reached the learned end.
	pub fn is_finished(&self) -> bool {
		match self.final_point {
			Some((group, object)) => (self.next_group_id, self.next_object_id) >= (group, object),
			None => false,
		}
	}

	/// Point query.
	pub fn get(&self, group_id: u64, object_id: u64, offset: u64) -> Option<&CachedFragment> {
		let index = *self.by_key.get(&FragmentKey::new(group_id, object_id, offset))?;
		self.slots[index].as_ref()
	}

	/// The largest fragment whose key is at or below `(group_id, object_id, MAX)`.
	pub fn last_before(&self, group_id: u64, object_id: u64) -> Option<&CachedFragment> {
		let key = FragmentKey::new(group_id, object_id, u64::MAX);
		let (_, &index) = self.by_key.range(..=key).next_back()?;
		self.slots[index].as_ref()
	}

	/// The oldest fragment in arrival order.
	pub fn arrival_head(&self) -> Option<usize> {
		self.head
	}

	/// The fragment that arrived right after the given one.
	pub fn arrival_next(&self, index: usize) -> Option<usize> {
		self.slots.get(index)?.as_ref()?.next_in_order
	}

	/// Access a fragment by arena index.
	pub fn fragment(&self, index: usize) -> Option<&CachedFragment> {
		self.slots.get(index)?.as_ref()
	}

	/// Whether the slot still holds the fragment the caller remembered.
	///
	/// A cursor held across a purge may point at a recycled slot; the key
	/// comparison detects that.
	pub fn fragment_matches(&self, index: usize, key: FragmentKey) -> bool {
		self.fragment(index).map(|f| f.key() == key).unwrap_or(false)
	}

	/// Merge a fragment into the cache. Idempotent: only byte ranges not
	/// already present are inserted, split into as many records as needed.
	///
	/// Returns true when any data was added.
	#[allow(clippy::too_many_arguments)]
	pub fn propose(
		&mut self,
		data: Bytes,
		group_id: u64,
		object_id: u64,
		offset: u64,
		queue_delay: u64,
		flags: u8,
		nb_objects_previous_group: u64,
		is_last_fragment: bool,
		now: u64,
	) -> bool {
		// Too old to be considered.
		if (group_id, object_id) < (self.first_group_id, self.first_object_id) {
			return false;
		}

		if data.is_empty() {
			// A zero-length fragment is a placeholder for a skipped or empty
			// object. Keep it only if nothing covers that point yet.
			let covered = self
				.last_before(group_id, object_id)
				.map(|f| {
					f.group_id == group_id
						&& f.object_id == object_id
						&& f.offset + f.data.len() as u64 >= offset
				})
				.unwrap_or(false);
			if covered {
				return false;
			}
			self.insert(
				data,
				group_id,
				object_id,
				offset,
				queue_delay,
				flags,
				nb_objects_previous_group,
				is_last_fragment,
				now,
			);
			self.advance_frontier();
			self.check_object_complete(group_id, object_id);
			return true;
		}

		let lo = offset;
		let hi = offset + data.len() as u64;

		// Subranges of [lo, hi) not covered by existing fragments of this object.
		let mut pieces: Vec<(u64, u64)> = Vec::new();
		let mut cursor = lo;
		let range = FragmentKey::new(group_id, object_id, 0)..=FragmentKey::new(group_id, object_id, u64::MAX);
		for (key, &index) in self.by_key.range(range) {
			let end = key.offset + self.slots[index].as_ref().map(|f| f.data.len() as u64).unwrap_or(0);
			if end <= cursor {
				continue;
			}
			if key.offset >= hi {
				break;
			}
			if key.offset > cursor {
				pieces.push((cursor, key.offset.min(hi)));
			}
			cursor = cursor.max(end);
			if cursor >= hi {
				break;
			}
		}
		if cursor < hi {
			pieces.push((cursor, hi));
		}

		if pieces.is_empty() {
			return false;
		}

		for &(start, end) in &pieces {
			let piece = data.slice((start - lo) as usize..(end - lo) as usize);
			// The previous-group count only rides on the fragment at offset 0;
			// the last-fragment mark only on the piece that reaches the tail.
			let nb_prev = if start == 0 { nb_objects_previous_group } else { 0 };
			let is_last = is_last_fragment && end == hi;
			self.insert(
				piece,
				group_id,
				object_id,
				start,
				queue_delay,
				flags,
				nb_prev,
				is_last,
				now,
			);
		}

		self.advance_frontier();
		self.check_object_complete(group_id, object_id);

		true
	}

	/// Advance `(next_group, next_object, next_offset)` over contiguously
	/// present fragments.
	///
	/// A group boundary is crossed only when the cache holds `(g+1, 0, 0)`,
	/// the frontier sits at the start of an object, and the fragment's
	/// previous-group count matches the number of objects completed in `g`.
	fn advance_frontier(&mut self) {
		loop {
			let expected = self
				.get(self.next_group_id, self.next_object_id, self.next_offset)
				.map(|f| (f.is_last_fragment, f.data.len() as u64));
			if let Some((is_last, len)) = expected {
				if is_last {
					self.next_object_id += 1;
					self.next_offset = 0;
				} else {
					self.next_offset += len;
				}
				continue;
			}

			let crossed = match self.get(self.next_group_id + 1, 0, 0) {
				Some(boundary) => {
					self.next_object_id > 0
						&& self.next_offset == 0
						&& boundary.nb_objects_previous_group == self.next_object_id
				}
				None => false,
			};
			if !crossed {
				break;
			}

			self.next_group_id += 1;
			self.next_object_id = 0;
			self.next_offset = 0;
		}
	}

	/// After an insert for `(group, object)`, check whether the object just
	/// became complete: a terminal fragment exists and its predecessors are
	/// contiguous back to offset 0.
	fn check_object_complete(&mut self, group_id: u64, object_id: u64) {
		let mut cursor = match self.last_before(group_id, object_id) {
			Some(f) if f.group_id == group_id && f.object_id == object_id => f.key(),
			_ => return,
		};

		let mut complete = self.get(group_id, object_id, cursor.offset).map(|f| f.is_last_fragment).unwrap_or(false);

		while complete && cursor.offset > 0 {
			let previous = self.by_key.range(..cursor).next_back();
			match previous {
				Some((key, &index)) if key.group_id == group_id && key.object_id == object_id => {
					let len = self.slots[index].as_ref().map(|f| f.data.len() as u64).unwrap_or(0);
					if key.offset + len < cursor.offset {
						complete = false;
					} else {
						cursor = *key;
					}
				}
				_ => complete = false,
			}
		}

		if complete {
			self.nb_object_received += 1;
		}
	}

	/// Set the earliest addressable point, snapping the frontier forward and
	/// deleting anything older. The source layer relays the new start point
	/// to every attached reader stream.
	pub fn learn_start(&mut self, group_id: u64, object_id: u64) {
		self.first_group_id = group_id;
		self.first_object_id = object_id;

		if (self.next_group_id, self.next_object_id) < (group_id, object_id) {
			self.next_group_id = group_id;
			self.next_object_id = object_id;
			self.next_offset = 0;
		}

		let cut = FragmentKey::new(group_id, object_id, 0);
		let doomed: Vec<FragmentKey> = self.by_key.range(..cut).map(|(k, _)| *k).collect();
		for key in doomed {
			self.remove(key);
		}

		// Fragments at the new start may have arrived before it was learned.
		self.advance_frontier();
	}

	/// Record the end of the media stream.
	pub fn learn_end(&mut self, final_group_id: u64, final_object_id: u64) {
		self.final_point = Some((final_group_id, final_object_id));
	}

	/// Delete objects whose fragments have all aged out of `max_age`.
	///
	/// An object is deleted only when known complete (or when the cache is
	/// closed and nothing more will arrive), and never at or past
	/// `min_kept_object`. `first_object_id` advances by one object at a time.
	pub fn purge_archival(&mut self, now: u64, max_age: u64, min_kept_object: u64) {
		loop {
			let (key, aged, is_last) = match self.first_fragment() {
				Some(f) => (
					f.key(),
					f.cache_time + max_age <= now,
					f.is_last_fragment,
				),
				None => return,
			};

			if key.object_id >= min_kept_object || !aged {
				return;
			}

			let mut should_delete = true;
			if !self.is_closed {
				// Verify the whole object is present, aged, and terminated.
				should_delete = key.object_id != self.first_object_id && key.offset == 0;
				let mut last_found = is_last;
				let mut next_offset = self.fragment_len(key);
				let mut cursor = key;

				while should_delete && !last_found {
					match self.by_key.range(cursor.after()..).next() {
						Some((next, &index)) => {
							let fragment = self.slots[index].as_ref();
							let aged = fragment.map(|f| f.cache_time + max_age <= now).unwrap_or(false);
							if next.object_id != key.object_id || next.group_id != key.group_id || !aged || next.offset != next_offset {
								break;
							}
							next_offset += fragment.map(|f| f.data.len() as u64).unwrap_or(0);
							if fragment.map(|f| f.is_last_fragment).unwrap_or(false) {
								last_found = true;
							}
							cursor = *next;
						}
						None => break,
					}
				}
				should_delete = should_delete && last_found;
			}

			if !should_delete {
				return;
			}

			self.first_object_id = key.object_id + 1;
			while let Some(first) = self.first_fragment() {
				if first.object_id >= self.first_object_id {
					break;
				}
				let key = first.key();
				self.remove(key);
			}
		}
	}

	/// Delete every fragment of a group below `kept_group`. The caller
	/// computes `kept_group` as the minimum of the frontier group and every
	/// active reader's current group.
	pub fn purge_realtime(&mut self, kept_group: u64) {
		while let Some(first) = self.first_fragment() {
			if first.group_id >= kept_group {
				let group_id = first.group_id;
				let object_id = first.object_id;
				self.first_group_id = group_id;
				self.first_object_id = object_id;
				break;
			}
			let key = first.key();
			self.remove(key);
		}
	}

	fn first_fragment(&self) -> Option<&CachedFragment> {
		let (_, &index) = self.by_key.iter().next()?;
		self.slots[index].as_ref()
	}

	fn fragment_len(&self, key: FragmentKey) -> u64 {
		self.by_key
			.get(&key)
			.and_then(|&i| self.slots[i].as_ref())
			.map(|f| f.data.len() as u64)
			.unwrap_or(0)
	}

	/// Concatenate the fragments of a complete object, in offset order.
	pub fn assemble(&self, group_id: u64, object_id: u64) -> Bytes {
		let range = FragmentKey::new(group_id, object_id, 0)..=FragmentKey::new(group_id, object_id, u64::MAX);
		let mut out = bytes::BytesMut::new();
		for (_, &index) in self.by_key.range(range) {
			if let Some(fragment) = self.slots[index].as_ref() {
				out.extend_from_slice(&fragment.data);
			}
		}
		out.freeze()
	}

	#[allow(clippy::too_many_arguments)]
	fn insert(
		&mut self,
		data: Bytes,
		group_id: u64,
		object_id: u64,
		offset: u64,
		queue_delay: u64,
		flags: u8,
		nb_objects_previous_group: u64,
		is_last_fragment: bool,
		now: u64,
	) {
		let key = FragmentKey::new(group_id, object_id, offset);
		if self.by_key.contains_key(&key) {
			return;
		}

		let fragment = CachedFragment {
			group_id,
			object_id,
			offset,
			data,
			queue_delay,
			flags,
			nb_objects_previous_group,
			is_last_fragment,
			cache_time: now,
			next_in_order: None,
			previous_in_order: self.tail,
		};

		let index = match self.free.pop() {
			Some(index) => {
				self.slots[index] = Some(fragment);
				index
			}
			None => {
				self.slots.push(Some(fragment));
				self.slots.len() - 1
			}
		};

		if let Some(tail) = self.tail {
			if let Some(previous) = self.slots[tail].as_mut() {
				previous.next_in_order = Some(index);
			}
		} else {
			self.head = Some(index);
		}
		self.tail = Some(index);

		self.by_key.insert(key, index);
	}

	fn remove(&mut self, key: FragmentKey) {
		let index = match self.by_key.remove(&key) {
			Some(index) => index,
			None => return,
		};

		let (previous, next) = match self.slots[index].as_ref() {
			Some(f) => (f.previous_in_order, f.next_in_order),
			None => return,
		};

		match previous {
			Some(p) => {
				if let Some(fragment) = self.slots[p].as_mut() {
					fragment.next_in_order = next;
				}
			}
			None => self.head = next,
		}
		match next {
			Some(n) => {
				if let Some(fragment) = self.slots[n].as_mut() {
					fragment.previous_in_order = previous;
				}
			}
			None => self.tail = previous,
		}

		self.slots[index] = None;
		self.free.push(index);
	}
}

impl FragmentKey {
	/// An exclusive range start just past this key.
	fn after(&self) -> FragmentKey {
		FragmentKey::new(self.group_id, self.object_id, self.offset + 1)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn propose(cache: &mut FragmentCache, g: u64, o: u64, off: u64, data: &[u8], last: bool) -> bool {
		cache.propose(Bytes::copy_from_slice(data), g, o, off, 0, 0, 0, last, 0)
	}

	fn propose_boundary(cache: &mut FragmentCache, g: u64, nb_prev: u64, data: &[u8], last: bool) -> bool {
		cache.propose(Bytes::copy_from_slice(data), g, 0, 0, 0, 0, nb_prev, last, 0)
	}

	#[test]
	fn test_frontier_advances_in_order() {
		let mut cache = FragmentCache::new();
		assert!(propose(&mut cache, 0, 0, 0, b"aaa", false));
		assert_eq!(cache.next(), (0, 0, 3));
		assert!(propose(&mut cache, 0, 0, 3, b"bb", true));
		assert_eq!(cache.next(), (0, 1, 0));
		assert_eq!(cache.nb_object_received(), 1);
	}

	#[test]
	fn test_frontier_stalls_on_gap() {
		let mut cache = FragmentCache::new();
		assert!(propose(&mut cache, 0, 0, 3, b"bb", true));
		assert_eq!(cache.next(), (0, 0, 0));
		assert!(propose(&mut cache, 0, 0, 0, b"aaa", false));
		assert_eq!(cache.next(), (0, 1, 0));
	}

	#[test]
	fn test_merge_is_idempotent() {
		let mut cache = FragmentCache::new();
		assert!(propose(&mut cache, 0, 0, 0, b"abcdef", false));
		assert!(!propose(&mut cache, 0, 0, 0, b"abcdef", false));
		assert!(!propose(&mut cache, 0, 0, 2, b"cd", false));
		assert_eq!(cache.len(), 1);
		assert_eq!(cache.assemble(0, 0), Bytes::from_static(b"abcdef"));
	}

	#[test]
	fn test_merge_splits_overlap() {
		let mut cache = FragmentCache::new();
		// Middle arrives first, then a fragment straddling it on both sides.
		assert!(propose(&mut cache, 0, 0, 4, b"4567", false));
		assert!(propose(&mut cache, 0, 0, 0, b"0123456789ab", true));

		assert_eq!(cache.assemble(0, 0), Bytes::from_static(b"0123456789ab"));
		assert_eq!(cache.next(), (0, 1, 0));

		// No two fragments overlap.
		let mut covered = 0u64;
		let mut offset = 0;
		while let Some(f) = cache.get(0, 0, offset) {
			assert_eq!(f.offset, covered);
			covered += f.data.len() as u64;
			offset = covered;
		}
		assert_eq!(covered, 12);
	}

	#[test]
	fn test_group_crossing_requires_object_count() {
		let mut cache = FragmentCache::new();
		for o in 0..4 {
			assert!(propose(&mut cache, 0, o, 0, b"x", true));
		}
		assert_eq!(cache.next(), (0, 4, 0));

		// Group 1 starts, declaring 5 objects in group 0; object 4 is missing.
		assert!(propose_boundary(&mut cache, 1, 5, b"y", true));
		assert_eq!(cache.next(), (0, 4, 0), "frontier must stall on the missing object");

		assert!(propose(&mut cache, 0, 4, 0, b"z", true));
		assert_eq!(cache.next(), (1, 1, 0));
	}

	#[test]
	fn test_group_crossing_rejected_on_wrong_count() {
		let mut cache = FragmentCache::new();
		for o in 0..3 {
			assert!(propose(&mut cache, 0, o, 0, b"x", true));
		}
		// The boundary claims only 2 objects existed; the frontier must not cross.
		assert!(propose_boundary(&mut cache, 1, 2, b"y", true));
		assert_eq!(cache.next(), (0, 3, 0));
	}

	#[test]
	fn test_zero_length_placeholder_completes_object() {
		let mut cache = FragmentCache::new();
		assert!(propose(&mut cache, 0, 0, 0, b"", true));
		assert_eq!(cache.next(), (0, 1, 0));
		assert_eq!(cache.nb_object_received(), 1);
		assert_eq!(cache.assemble(0, 0), Bytes::new());

		// The placeholder is deduplicated.
		assert!(!propose(&mut cache, 0, 0, 0, b"", true));
		assert_eq!(cache.len(), 1);
	}

	#[test]
	fn test_learn_start_drops_older_fragments() {
		let mut cache = FragmentCache::new();
		for o in 0..6 {
			assert!(propose(&mut cache, 0, o, 0, b"x", true));
		}
		cache.learn_start(0, 4);

		assert_eq!(cache.first(), (0, 4));
		assert!(cache.get(0, 3, 0).is_none());
		assert!(cache.get(0, 4, 0).is_some());

		// Anything older than the start point is refused from now on.
		assert!(!propose(&mut cache, 0, 2, 0, b"x", true));
	}

	#[test]
	fn test_learn_start_snaps_frontier() {
		let mut cache = FragmentCache::new();
		cache.learn_start(2, 10);
		assert_eq!(cache.next(), (2, 10, 0));

		assert!(propose(&mut cache, 2, 10, 0, b"x", true));
		assert_eq!(cache.next(), (2, 11, 0));
	}

	#[test]
	fn test_frontier_monotonic_under_random_order() {
		// Insert every fragment of a 3-object group in a few shuffled orders
		// and check the frontier never goes backwards.
		let fragments: Vec<(u64, u64, &[u8], bool)> = vec![
			(0, 0, b"aa", false),
			(0, 2, b"bb", true),
			(1, 0, b"cc", false),
			(1, 2, b"dd", true),
			(2, 0, b"ee", true),
		];
		let orders = [[0, 1, 2, 3, 4], [4, 3, 2, 1, 0], [2, 4, 0, 3, 1], [1, 3, 0, 4, 2]];

		for order in orders {
			let mut cache = FragmentCache::new();
			let mut last = (0, 0, 0);
			for i in order {
				let (object, offset, data, is_last) = fragments[i];
				propose(&mut cache, 0, object, offset, data, is_last);
				let next = cache.next();
				assert!(next >= last, "frontier went backwards: {:?} -> {:?}", last, next);
				last = next;
			}
			assert_eq!(cache.next(), (0, 3, 0));
			assert_eq!(cache.nb_object_received(), 3);
		}
	}

	#[test]
	fn test_merge_random_overlaps() {
		// Shower one object with overlapping slices in pseudo-random order;
		// whatever the order, the addressable bytes equal the union and no
		// two fragments overlap.
		let body: Vec<u8> = (0..200u16).map(|i| (i * 7 + 3) as u8).collect();
		let mut seed = 0x2545f491u64;
		let mut rng = move || {
			seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
			(seed >> 33) as usize
		};

		for _ in 0..20 {
			let mut cache = FragmentCache::new();
			// The terminal fragment first, so the tail is always marked.
			assert!(propose(&mut cache, 0, 0, 180, &body[180..], true));

			for _ in 0..40 {
				let start = rng() % 190;
				let len = 1 + rng() % (200 - start);
				propose(&mut cache, 0, 0, start as u64, &body[start..start + len], start + len == 200);
			}
			// Fill whatever the random slices missed.
			propose(&mut cache, 0, 0, 0, &body, true);

			assert_eq!(cache.assemble(0, 0), Bytes::copy_from_slice(&body));
			assert_eq!(cache.next(), (0, 1, 0));

			let mut covered = 0u64;
			while let Some(fragment) = cache.get(0, 0, covered) {
				assert!(!fragment.data.is_empty() || fragment.is_last_fragment);
				covered += fragment.data.len() as u64;
			}
			assert_eq!(covered, 200, "fragments must tile the object exactly");
		}
	}

	#[test]
	fn test_purge_realtime_keeps_reader_group() {
		let mut cache = FragmentCache::new();
		for g in 0..3 {
			let nb_prev = if g == 0 { 0 } else { 1 };
			assert!(cache.propose(Bytes::from_static(b"x"), g, 0, 0, 0, 0, nb_prev, true, 0));
		}
		assert_eq!(cache.next(), (2, 1, 0));

		cache.purge_realtime(1);
		assert!(cache.get(0, 0, 0).is_none());
		assert!(cache.get(1, 0, 0).is_some());
		assert_eq!(cache.first(), (1, 0));
	}

	#[test]
	fn test_purge_archival_by_age() {
		let mut cache = FragmentCache::new();
		cache.propose(Bytes::from_static(b"old"), 0, 0, 0, 0, 0, 0, true, 1_000);
		cache.propose(Bytes::from_static(b"old"), 0, 1, 0, 0, 0, 0, true, 2_000);
		cache.propose(Bytes::from_static(b"new"), 0, 2, 0, 0, 0, 0, true, 9_000_000);

		// Object 0 is never deleted while it is the cache start and the cache
		// is still open.
		cache.purge_archival(10_000_000, 5_000_000, u64::MAX);
		assert!(cache.get(0, 0, 0).is_some());

		cache.is_closed = true;
		cache.purge_archival(10_000_000, 5_000_000, u64::MAX);
		assert!(cache.get(0, 0, 0).is_none());
		assert!(cache.get(0, 1, 0).is_none());
		assert!(cache.get(0, 2, 0).is_some());
		assert_eq!(cache.first(), (0, 2));
	}

	#[test]
	fn test_purge_archival_respects_kept_object() {
		let mut cache = FragmentCache::new();
		for o in 0..4 {
			cache.propose(Bytes::from_static(b"x"), 0, o, 0, 0, 0, 0, true, 0);
		}
		cache.is_closed = true;

		// A reader still sits at object 2.
		cache.purge_archival(10_000_000, 1_000, 2);
		assert!(cache.get(0, 1, 0).is_none());
		assert!(cache.get(0, 2, 0).is_some());
		assert!(cache.get(0, 3, 0).is_some());
	}

	#[test]
	fn test_arrival_order_survives_purge() {
		let mut cache = FragmentCache::new();
		// Arrival order differs from key order.
		propose(&mut cache, 0, 1, 0, b"b", true);
		propose(&mut cache, 0, 0, 0, b"a", true);
		propose(&mut cache, 0, 2, 0, b"c", true);

		let mut seen = Vec::new();
		let mut cursor = cache.arrival_head();
		while let Some(index) = cursor {
			seen.push(cache.fragment(index).unwrap().object_id);
			cursor = cache.arrival_next(index);
		}
		assert_eq!(seen, vec![1, 0, 2]);

		cache.learn_start(0, 1);
		let mut seen = Vec::new();
		let mut cursor = cache.arrival_head();
		while let Some(index) = cursor {
			seen.push(cache.fragment(index).unwrap().object_id);
			cursor = cache.arrival_next(index);
		}
		assert_eq!(seen, vec![1, 2]);
	}

	#[test]
	fn test_finished_after_learn_end() {
		let mut cache = FragmentCache::new();
		propose(&mut cache, 0, 0, 0, b"x", true);
		cache.learn_end(0, 1);
		assert!(cache.is_finished());

		cache.learn_end(0, 2);
		assert!(!cache.is_finished());
	}
}
