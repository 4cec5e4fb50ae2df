//! Per-stream tracking of datagrams in flight: which fragments were
//! acknowledged, which need a repeat, and the acknowledged horizon below
//! which nothing is tracked anymore.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::datagram::DatagramHeader;

/// A repeated fragment is considered already covered when the record was
/// retransmitted more than this long after the lost copy left.
const REPEAT_GRACE: u64 = 1_000;

/// Ordering key of an outstanding fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct AckKey {
	pub group_id: u64,
	pub object_id: u64,
	pub offset: u64,
}

impl AckKey {
	pub fn new(group_id: u64, object_id: u64, offset: u64) -> Self {
		Self {
			group_id,
			object_id,
			offset,
		}
	}
}

#[derive(Debug, Default)]
pub(crate) struct AckRecord {
	pub length: usize,
	pub is_last_fragment: bool,
	pub is_acked: bool,
	pub fec_needed: bool,
	pub last_sent_time: u64,
	pub nb_extra_sent: u32,
}

/// What [AckTracker::record_sent] found.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SendRecord {
	Created,
	AlreadyPresent,
	BelowHorizon,
}

/// The splay of outstanding fragments for one sending datagram stream.
///
/// Contiguously acknowledged records collapse into the horizon: the point up
/// to which everything sent was confirmed. The horizon only moves forward,
/// and a fragment below it is never re-created.
#[derive(Debug, Default)]
pub(crate) struct AckTracker {
	records: BTreeMap<AckKey, AckRecord>,
	/// One past the last collapsed byte, and whether it ended an object.
	horizon: Option<(AckKey, bool)>,
	nb_horizon_events: u64,
}

impl AckTracker {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn horizon(&self) -> Option<AckKey> {
		self.horizon.map(|(key, _)| key)
	}

	pub fn len(&self) -> usize {
		self.records.len()
	}

	fn below_horizon(&self, key: AckKey) -> bool {
		match self.horizon {
			Some((horizon, _)) => key < horizon,
			None => false,
		}
	}

	/// Track a fragment that just went on the wire.
	pub fn record_sent(&mut self, key: AckKey, length: usize, is_last_fragment: bool, now: u64) -> SendRecord {
		if self.below_horizon(key) {
			// A pure advance of already confirmed data; count it only.
			self.nb_horizon_events += 1;
			return SendRecord::BelowHorizon;
		}

		if self.records.contains_key(&key) {
			return SendRecord::AlreadyPresent;
		}

		self.records.insert(
			key,
			AckRecord {
				length,
				is_last_fragment,
				last_sent_time: now,
				..Default::default()
			},
		);
		SendRecord::Created
	}

	/// The peer confirmed receipt of a fragment.
	pub fn handle_ack(&mut self, key: AckKey) {
		if let Some(record) = self.records.get_mut(&key) {
			record.is_acked = true;
		}
		self.collapse_horizon();
	}

	/// Collapse the contiguous acknowledged prefix into the horizon.
	///
	/// Whether the next record continues the current object or starts the
	/// following one depends on the last collapsed fragment's terminal mark.
	fn collapse_horizon(&mut self) {
		loop {
			let (&key, record) = match self.records.iter().next() {
				Some(entry) => entry,
				None => return,
			};
			if !record.is_acked {
				return;
			}

			let just_after = match self.horizon {
				None => key.offset == 0,
				Some((horizon, true)) => {
					key.offset == 0
						&& ((key.group_id == horizon.group_id && key.object_id == horizon.object_id + 1)
							|| (key.group_id == horizon.group_id + 1 && key.object_id == 0))
				}
				Some((horizon, false)) => key == horizon,
			};
			if !just_after {
				return;
			}

			let end = AckKey::new(key.group_id, key.object_id, key.offset + record.length as u64);
			self.horizon = Some((end, record.is_last_fragment));
			self.records.remove(&key);
		}
	}

	/// The transport thinks a datagram was lost: queue one or more repeat
	/// datagrams, splitting both the payload and the tracked record when the
	/// repeat would exceed the maximum queued-datagram size.
	///
	/// `payload` is the lost datagram's media bytes, after its header.
	pub fn handle_lost(
		&mut self,
		header: &DatagramHeader,
		payload: &[u8],
		sent_time: u64,
		max_datagram: usize,
		now: u64,
	) -> Vec<Bytes> {
		let key = AckKey::new(header.group_id, header.object_id, header.offset);
		let record = match self.records.get_mut(&key) {
			Some(record) => record,
			// Absent: already acknowledged and collapsed below the horizon.
			None => return Vec::new(),
		};
		if record.is_acked {
			return Vec::new();
		}
		if record.last_sent_time > sent_time + REPEAT_GRACE {
			// The record was already retransmitted after this copy was sent.
			return Vec::new();
		}
		record.fec_needed = true;

		self.build_repeats(header, key, payload, max_datagram, now)
	}

	/// A loss that turned out spurious counts as an acknowledgement.
	pub fn handle_spurious(&mut self, key: AckKey) {
		self.handle_ack(key);
	}

	fn build_repeats(
		&mut self,
		lost: &DatagramHeader,
		mut key: AckKey,
		payload: &[u8],
		max_datagram: usize,
		now: u64,
	) -> Vec<Bytes> {
		let mut datagrams = Vec::new();
		let mut remaining = payload;

		loop {
			let (record_len, record_is_last) = match self.records.get(&key) {
				Some(record) => (record.length, record.is_last_fragment),
				None => break,
			};
			debug_assert!(record_len == remaining.len());

			let mut header = DatagramHeader {
				offset: key.offset,
				is_last_fragment: record_is_last,
				..lost.clone()
			};
			let header_len = header.len();

			if header_len + remaining.len() <= max_datagram {
				if let Some(record) = self.records.get_mut(&key) {
					record.last_sent_time = now;
				}
				datagrams.push(header.with_payload(remaining));
				break;
			}

			// Split: the first half loses the terminal mark, and the tracked
			// record splits with it.
			header.is_last_fragment = false;
			let fragment_len = max_datagram - header_len;
			datagrams.push(header.with_payload(&remaining[..fragment_len]));

			let next_key = AckKey::new(key.group_id, key.object_id, key.offset + fragment_len as u64);
			if let Some(record) = self.records.get_mut(&key) {
				record.is_last_fragment = false;
				record.length = fragment_len;
				record.last_sent_time = now;
			}
			self.records.insert(
				next_key,
				AckRecord {
					length: remaining.len() - fragment_len,
					is_last_fragment: record_is_last,
					fec_needed: true,
					last_sent_time: now,
					..Default::default()
				},
			);

			remaining = &remaining[fragment_len..];
			key = next_key;
		}

		datagrams
	}

	/// The oldest unacknowledged record due for a proactive repeat.
	pub fn extra_repeat_due(&mut self, delay: u64, max_count: u32, now: u64) -> Option<AckKey> {
		for (&key, record) in self.records.iter_mut() {
			if record.is_acked {
				continue;
			}
			if record.nb_extra_sent >= max_count {
				continue;
			}
			if record.last_sent_time + delay > now {
				// Records further in were sent even later.
				return None;
			}
			record.nb_extra_sent += 1;
			record.last_sent_time = now;
			return Some(key);
		}
		None
	}

	pub fn record(&self, key: AckKey) -> Option<&AckRecord> {
		self.records.get(&key)
	}

	/// Log the fate of the remaining records when the stream goes away.
	pub fn release(&self, stream_id: u64) {
		if self.records.is_empty() {
			return;
		}

		let mut acked = 0;
		let mut nacked = 0;
		let mut alone = 0;
		for record in self.records.values() {
			if record.is_acked {
				acked += 1;
			} else if record.fec_needed {
				nacked += 1;
			} else {
				alone += 1;
			}
		}
		tracing::debug!(
			stream = stream_id,
			outstanding = self.records.len(),
			acked,
			nacked,
			alone,
			horizon = ?self.horizon(),
			horizon_events = self.nb_horizon_events,
			"datagram stream released"
		);
	}
}
