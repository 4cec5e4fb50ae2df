//! The consumer side of a cache: merging received fragments, learning the
//! final object, and deriving it when the feeding stream closes early.

use bytes::Bytes;

use crate::cache::FragmentCache;
use crate::datagram::DatagramHeader;

/// How long a closed cache lingers before it may be reclaimed.
const CACHE_LINGER: u64 = 30_000_000;

/// The shorter linger when the end of the media was already known at close.
const CACHE_LINGER_FINISHED: u64 = 3_000_000;

/// Outcome of feeding the consumer: whether the media is now fully received.
///
/// `Finished` asks the transport to close the stream; it is a signal, not an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
	Continue,
	Finished,
}

impl FragmentCache {
	/// Merge a fragment received as a datagram into the cache.
	///
	/// Returns whether data was added and whether the media is now complete.
	pub fn receive_fragment(&mut self, header: &DatagramHeader, data: Bytes, now: u64) -> (bool, Feed) {
		let added = self.propose(
			data,
			header.group_id,
			header.object_id,
			header.offset,
			header.queue_delay,
			header.flags,
			header.nb_objects_previous_group,
			header.is_last_fragment,
			now,
		);

		(added, self.feed_state())
	}

	/// Merge a fragment received in order on a stream.
	///
	/// Stream transport renumbers objects flatly and carries no group, class
	/// or delay information; everything lands in group 0.
	pub fn receive_stream_fragment(
		&mut self,
		object_id: u64,
		offset: u64,
		is_last_fragment: bool,
		data: Bytes,
		now: u64,
	) -> (bool, Feed) {
		let added = self.propose(data, 0, object_id, offset, 0, 0, 0, is_last_fragment, now);
		(added, self.feed_state())
	}

	/// Record the final object id announced by the sender.
	pub fn learn_final_object(&mut self, final_group_id: u64, final_object_id: u64) -> Feed {
		self.learn_end(final_group_id, final_object_id);
		self.feed_state()
	}

	fn feed_state(&self) -> Feed {
		if self.is_finished() {
			Feed::Finished
		} else {
			Feed::Continue
		}
	}

	/// The feeding stream is gone; no more fragments will arrive.
	///
	/// If the end was never announced, derive it from the frontier so that
	/// readers can drain what exists and then finish.
	pub fn close(&mut self, now: u64) {
		if self.is_closed {
			return;
		}

		let end_was_known = self.final_point().is_some();
		if !end_was_known {
			let (next_group, next_object, next_offset) = self.next();
			let derived = if next_offset == 0 {
				(next_group, next_object)
			} else if next_object > 1 {
				(next_group, next_object - 1)
			} else {
				// Mid-object at the start of a group: the last object of the
				// previous group, if the cache still holds any.
				let previous = match next_group {
					0 => None,
					g => self.last_before(g - 1, u64::MAX),
				};
				match previous {
					Some(fragment) => (fragment.group_id, fragment.object_id),
					None => self.first(),
				}
			};
			self.learn_end(derived.0, derived.1);
		}

		self.delete_time = Some(now + if end_was_known { CACHE_LINGER_FINISHED } else { CACHE_LINGER });
		self.is_closed = true;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn header(group_id: u64, object_id: u64, offset: u64, is_last: bool) -> DatagramHeader {
		DatagramHeader {
			datagram_stream_id: 0,
			group_id,
			object_id,
			offset,
			queue_delay: 0,
			flags: 0,
			nb_objects_previous_group: 0,
			is_last_fragment: is_last,
		}
	}

	#[test]
	fn test_finished_when_final_reached() {
		let mut cache = FragmentCache::new();

		let (added, feed) = cache.receive_fragment(&header(0, 0, 0, true), Bytes::from_static(b"x"), 0);
		assert!(added);
		assert_eq!(feed, Feed::Continue);

		assert_eq!(cache.learn_final_object(0, 2), Feed::Continue);

		let (_, feed) = cache.receive_fragment(&header(0, 1, 0, true), Bytes::from_static(b"y"), 0);
		assert_eq!(feed, Feed::Finished);
	}

	#[test]
	fn test_close_derives_final_at_object_boundary() {
		let mut cache = FragmentCache::new();
		cache.receive_fragment(&header(0, 0, 0, true), Bytes::from_static(b"x"), 0);
		cache.receive_fragment(&header(0, 1, 0, true), Bytes::from_static(b"y"), 0);

		cache.close(1_000);
		assert_eq!(cache.final_point(), Some((0, 2)));
		assert!(cache.is_closed());
		assert_eq!(cache.delete_time, Some(1_000 + 30_000_000));
	}

	#[test]
	fn test_close_mid_object_steps_back() {
		let mut cache = FragmentCache::new();
		cache.receive_fragment(&header(0, 0, 0, true), Bytes::from_static(b"a"), 0);
		cache.receive_fragment(&header(0, 1, 0, true), Bytes::from_static(b"b"), 0);
		// Object 2 is only partially received.
		cache.receive_fragment(&header(0, 2, 0, false), Bytes::from_static(b"c"), 0);

		cache.close(0);
		assert_eq!(cache.final_point(), Some((0, 1)));
	}

	#[test]
	fn test_close_with_known_end_uses_short_linger() {
		let mut cache = FragmentCache::new();
		cache.receive_fragment(&header(0, 0, 0, true), Bytes::from_static(b"x"), 0);
		cache.learn_final_object(0, 1);

		cache.close(500);
		assert_eq!(cache.delete_time, Some(500 + 3_000_000));
		assert_eq!(cache.final_point(), Some((0, 1)));
	}

	#[test]
	fn test_close_is_idempotent() {
		let mut cache = FragmentCache::new();
		cache.close(100);
		let first = cache.delete_time;
		cache.close(50_000_000);
		assert_eq!(cache.delete_time, first);
	}

	#[test]
	fn test_stream_fragments_land_in_group_zero() {
		let mut cache = FragmentCache::new();
		let (added, _) = cache.receive_stream_fragment(3, 0, true, Bytes::from_static(b"z"), 0);
		assert!(added);
		assert!(cache.get(0, 3, 0).is_some());
	}
}
