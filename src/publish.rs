//! Per-reader publisher state: an independent cursor over one cache.
//!
//! Stream mode reads in key order and never skips. Datagram mode follows the
//! cache's arrival order so a relay can forward out-of-order, consulting the
//! congestion oracle at each new object and keeping a per-object accounting
//! tree to detect completion and prune.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::cache::{FragmentCache, FragmentKey};
use crate::congestion::CongestionController;
use crate::datagram::DatagramHeader;

/// A fragment older than one frame interval at 30 fps counts as backlogged.
const BACKLOG_AGE: u64 = 33_333;

/// Class byte of the placeholder sent in place of a skipped object.
pub const SKIP_FLAGS: u8 = 0xff;

/// Send accounting for one object, kept until all its bytes are confirmed sent.
#[derive(Debug, Default)]
pub(crate) struct PublisherObject {
	pub bytes_sent: u64,
	/// Total object length, known once the last fragment was observed.
	pub final_offset: u64,
	pub is_dropped: bool,
	pub is_sent: bool,
	pub nb_objects_previous_group: u64,
}

/// What the stream-mode cursor produced.
#[derive(Debug)]
pub(crate) enum StreamPoll {
	/// The cursor reached the final object; send the FIN message.
	Finished,
	/// Nothing available at the cursor; wait for a wakeup.
	NotReady,
	Chunk {
		data: Bytes,
		is_last_fragment: bool,
		has_backlog: bool,
	},
}

/// What the datagram scheduler decided for this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DatagramCheck {
	NotReady,
	Ready { should_skip: bool },
}

/// A datagram built from the current fragment.
#[derive(Debug)]
pub(crate) enum DatagramSend {
	/// The budget cannot even fit the header; try again with more space.
	NoSpace,
	NotReady,
	Datagram { bytes: Bytes, sent: SentFragment },
}

/// What actually went on the wire, for the ack tracker.
#[derive(Debug, Clone)]
pub(crate) struct SentFragment {
	pub group_id: u64,
	pub object_id: u64,
	pub offset: u64,
	pub payload_len: usize,
	pub is_last_fragment: bool,
}

/// The state of one reader stream attached to a cache.
#[derive(Debug)]
pub(crate) struct PublisherState {
	pub start_group_id: u64,
	pub start_object_id: u64,

	// Stream-mode cursor, in key order.
	pub current_group_id: u64,
	pub current_object_id: u64,
	pub current_offset: u64,
	pub is_current_object_skipped: bool,
	pub has_backlog: bool,

	// Datagram-mode cursor, in arrival order.
	current: Option<usize>,
	current_key: FragmentKey,
	length_sent: usize,
	pub is_current_fragment_sent: bool,

	objects: BTreeMap<(u64, u64), PublisherObject>,
}

impl PublisherState {
	pub fn new(start_group_id: u64, start_object_id: u64) -> Self {
		Self {
			start_group_id,
			start_object_id,
			current_group_id: start_group_id,
			current_object_id: start_object_id,
			current_offset: 0,
			is_current_object_skipped: false,
			has_backlog: false,
			current: None,
			current_key: FragmentKey::new(0, 0, 0),
			length_sent: 0,
			is_current_fragment_sent: false,
			objects: BTreeMap::new(),
		}
	}

	/// Mark the current stream-mode object to be replaced by nothing; the
	/// cursor advances to the next available object on the next poll.
	pub fn skip_current_object(&mut self) {
		self.is_current_object_skipped = true;
	}

	/// Read the next chunk in key order, up to `max` bytes.
	pub fn next_stream_chunk(&mut self, cache: &FragmentCache, max: usize) -> StreamPoll {
		if let Some(end) = cache.final_point() {
			if (self.current_group_id, self.current_object_id) >= end {
				return StreamPoll::Finished;
			}
		}

		if self.is_current_object_skipped && !self.advance_past_skipped(cache) {
			return StreamPoll::NotReady;
		}

		// Locate the fragment under the cursor; at an object start, the next
		// group's first fragment may take over when the count matches.
		let mut fragment = cache.get(self.current_group_id, self.current_object_id, self.current_offset);
		if fragment.is_none() && self.current_offset == 0 {
			if let Some(boundary) = cache.get(self.current_group_id + 1, 0, 0) {
				if self.current_object_id >= boundary.nb_objects_previous_group {
					self.current_group_id += 1;
					self.current_object_id = 0;
					self.length_sent = 0;
					fragment = Some(boundary);
				}
			}
		}

		let fragment = match fragment {
			Some(fragment) => fragment,
			None => return StreamPoll::NotReady,
		};

		let available = fragment.data.len() - self.length_sent;
		let copied = max.min(available);
		let end_of_fragment = copied == available;
		let is_last_fragment = end_of_fragment && fragment.is_last_fragment;
		let data = fragment.data.slice(self.length_sent..self.length_sent + copied);

		// The backlog flag is sticky within an object so a partially sent
		// object reports consistently.
		let has_backlog = if self.current_offset > 0 || self.length_sent > 0 {
			self.has_backlog
		} else {
			let (next_group, next_object, _) = cache.next();
			let behind = self.current_group_id < next_group
				|| (self.current_group_id == next_group && self.current_object_id + 1 < next_object);
			self.has_backlog = behind;
			behind
		};

		let fragment_is_last = fragment.is_last_fragment;
		let fragment_len = fragment.data.len() as u64;

		if end_of_fragment {
			if fragment_is_last {
				self.current_object_id += 1;
				self.current_offset = 0;
			} else {
				self.current_offset += fragment_len;
			}
			self.length_sent = 0;
		} else {
			self.length_sent += copied;
		}

		StreamPoll::Chunk {
			data,
			is_last_fragment,
			has_backlog,
		}
	}

	/// After a skip, move to the next object in the same group or across the
	/// boundary; returns false while neither is available yet.
	fn advance_past_skipped(&mut self, cache: &FragmentCache) -> bool {
		if cache.get(self.current_group_id, self.current_object_id + 1, 0).is_some() {
			self.current_object_id += 1;
		} else {
			match cache.get(self.current_group_id + 1, 0, 0) {
				Some(boundary) if self.current_object_id + 1 >= boundary.nb_objects_previous_group => {
					self.current_group_id += 1;
					self.current_object_id = 0;
				}
				_ => return false,
			}
		}

		self.current_offset = 0;
		self.length_sent = 0;
		self.is_current_object_skipped = false;
		true
	}

	/// Advance the arrival-order cursor and decide whether the object it
	/// landed on should be skipped.
	pub fn check_fragment(
		&mut self,
		cache: &FragmentCache,
		congestion: &mut CongestionController,
		now: u64,
	) -> DatagramCheck {
		if let Some(index) = self.current {
			// A cursor held across a purge may point at a recycled slot; the
			// purge rules keep live cursors valid, so treat a mismatch as
			// already sent and let the walk resynchronize from the head.
			if !cache.fragment_matches(index, self.current_key) {
				self.current = cache.arrival_head();
				self.is_current_fragment_sent = true;
				if let Some(head) = self.current {
					self.current_key = cache.fragment(head).map(|f| f.key()).unwrap_or(self.current_key);
				}
			}
		}

		if self.current.is_none() {
			let head = match cache.arrival_head() {
				Some(head) => head,
				None => return DatagramCheck::NotReady,
			};
			self.set_current(cache, head);

			let fragment = match cache.fragment(head) {
				Some(fragment) => fragment,
				None => return DatagramCheck::NotReady,
			};
			if (fragment.group_id, fragment.object_id) < (self.start_group_id, self.start_object_id) {
				self.is_current_fragment_sent = true;
			} else {
				return DatagramCheck::Ready { should_skip: false };
			}
		}

		if !self.is_current_fragment_sent {
			// A partially sent fragment is never reconsidered for skipping.
			return DatagramCheck::Ready { should_skip: false };
		}

		while let Some(next) = self.current.and_then(|index| cache.arrival_next(index)) {
			self.set_current(cache, next);

			let fragment = match cache.fragment(next) {
				Some(fragment) => fragment,
				None => return DatagramCheck::NotReady,
			};
			let object = (fragment.group_id, fragment.object_id);

			if object < (self.start_group_id, self.start_object_id) {
				self.is_current_fragment_sent = true;
				continue;
			}

			match self.objects.get(&object) {
				None => {
					// An object below the accounting window was pruned after
					// being fully sent; nothing left to do for it.
					if let Some((&first, _)) = self.objects.iter().next() {
						if first > object {
							self.is_current_fragment_sent = true;
							continue;
						}
					}

					let mut should_skip = false;
					if fragment.object_id != 0 && !fragment.data.is_empty() {
						let has_backlog = now.saturating_sub(fragment.cache_time) > BACKLOG_AGE;
						should_skip = congestion.should_skip(fragment.flags, has_backlog, now);
					}
					return DatagramCheck::Ready { should_skip };
				}
				Some(object_state) if object_state.is_dropped => {
					self.is_current_fragment_sent = true;
				}
				Some(_) => return DatagramCheck::Ready { should_skip: false },
			}
		}

		DatagramCheck::NotReady
	}

	fn set_current(&mut self, cache: &FragmentCache, index: usize) {
		self.current = Some(index);
		self.length_sent = 0;
		self.is_current_fragment_sent = false;
		if let Some(fragment) = cache.fragment(index) {
			self.current_key = fragment.key();
		}
	}

	/// Build one datagram from the current fragment, or a zero-length
	/// placeholder when the object is skipped.
	pub fn prepare_datagram(
		&mut self,
		cache: &FragmentCache,
		datagram_stream_id: u64,
		space: usize,
		should_skip: bool,
	) -> DatagramSend {
		let index = match self.current {
			Some(index) => index,
			None => return DatagramSend::NotReady,
		};
		let fragment = match cache.fragment(index) {
			Some(fragment) => fragment,
			None => return DatagramSend::NotReady,
		};

		let offset = if should_skip {
			0
		} else {
			fragment.offset + self.length_sent as u64
		};

		let mut header = DatagramHeader {
			datagram_stream_id,
			group_id: fragment.group_id,
			object_id: fragment.object_id,
			offset,
			queue_delay: fragment.queue_delay,
			flags: if should_skip { SKIP_FLAGS } else { fragment.flags },
			nb_objects_previous_group: fragment.nb_objects_previous_group,
			is_last_fragment: if should_skip { true } else { fragment.is_last_fragment },
		};

		let header_len = header.len();
		if header_len > space {
			return DatagramSend::NoSpace;
		}

		let mut copied = 0;
		if !should_skip && !fragment.data.is_empty() {
			let available = fragment.data.len() - self.length_sent;
			copied = (space - header_len).min(available);
			if copied == 0 {
				return DatagramSend::NoSpace;
			}
			if copied < available && header.is_last_fragment {
				// The budget truncates the last fragment; the remainder goes
				// out later with the mark.
				header.is_last_fragment = false;
			}
		}

		let payload = fragment.data.slice(self.length_sent..self.length_sent + copied);
		let bytes = header.with_payload(&payload);

		self.length_sent += copied;
		self.is_current_fragment_sent = should_skip || self.length_sent >= fragment.data.len();

		let sent = SentFragment {
			group_id: header.group_id,
			object_id: header.object_id,
			offset,
			payload_len: copied,
			is_last_fragment: header.is_last_fragment,
		};

		let nb_objects_previous_group = fragment.nb_objects_previous_group;
		self.note_sent(&sent, should_skip, offset + copied as u64, nb_objects_previous_group);

		DatagramSend::Datagram { bytes, sent }
	}

	/// Account for a sent fragment; mark the object fully sent when all its
	/// bytes went out, then prune the leading run of sent objects.
	fn note_sent(&mut self, sent: &SentFragment, should_skip: bool, next_offset: u64, nb_objects_previous_group: u64) {
		let done = {
			let object = self
				.objects
				.entry((sent.group_id, sent.object_id))
				.or_default();
			object.bytes_sent += sent.payload_len as u64;
			if sent.is_last_fragment {
				object.final_offset = next_offset;
			}
			object.is_dropped = should_skip;
			if nb_objects_previous_group > 0 {
				object.nb_objects_previous_group = nb_objects_previous_group;
			}

			// The zero-length case covers objects skipped at a previous node.
			(sent.is_last_fragment && sent.payload_len as u64 >= next_offset)
				|| (object.final_offset > 0 && object.bytes_sent >= object.final_offset)
		};

		if done {
			if let Some(object) = self.objects.get_mut(&(sent.group_id, sent.object_id)) {
				object.is_sent = true;
			}
			self.prune_objects();
		}
	}

	/// Remove leading tree entries whose objects are sent and in sequence,
	/// so long-lived readers do not accumulate state.
	fn prune_objects(&mut self) {
		loop {
			let doomed = {
				let mut iter = self.objects.iter();
				let (&first_key, first) = match iter.next() {
					Some(entry) => entry,
					None => return,
				};
				if !first.is_sent {
					return;
				}
				let (&next_key, next) = match iter.next() {
					Some(entry) => entry,
					None => return,
				};

				let in_sequence = (next_key.0 == first_key.0 && next_key.1 == first_key.1 + 1)
					|| (next_key.0 == first_key.0 + 1
						&& next_key.1 == 0
						&& next.nb_objects_previous_group == first_key.1 + 1);
				if !in_sequence {
					return;
				}
				first_key
			};
			self.objects.remove(&doomed);
		}
	}

	/// Whether every cached fragment was sent and the end of the media is known.
	pub fn datagram_finished(&self, cache: &FragmentCache) -> bool {
		cache.final_point().is_some()
			&& self.is_current_fragment_sent
			&& self
				.current
				.map(|index| cache.arrival_next(index).is_none())
				.unwrap_or(false)
	}

	/// The lowest `(group, object)` this reader still needs, bounding what a
	/// purge may evict.
	pub fn purge_floor(&self, is_datagram: bool) -> Option<(u64, u64)> {
		if is_datagram {
			if let Some((&first, _)) = self.objects.iter().next() {
				return Some(first);
			}
			if self.current.is_some() && !self.is_current_fragment_sent {
				return Some(self.current_key.object());
			}
			None
		} else {
			Some((self.current_group_id, self.current_object_id))
		}
	}

	#[cfg(test)]
	pub fn object_state(&self, group_id: u64, object_id: u64) -> Option<&PublisherObject> {
		self.objects.get(&(group_id, object_id))
	}

	/// The objects this reader dropped, for diagnostics.
	pub fn dropped_objects(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
		self.objects
			.iter()
			.filter(|(_, object)| object.is_dropped)
			.map(|(&key, _)| key)
	}
}
