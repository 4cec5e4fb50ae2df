//! The per-URL media source: a fragment cache plus the reader streams
//! currently attached to it.

use bytes::Bytes;

use crate::cache::FragmentCache;

/// Identifies a source within its [crate::Context].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SourceId(pub(crate) usize);

/// How the cache behind a source is fed; the read side is the same for all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SourceKind {
	/// Fed locally through [crate::Context::publish_object].
	Local,
	/// Fed by a network consumer stream (a relay or origin cache, or the
	/// receiving half of a post).
	Cache,
	/// The delivery sink of a local subscription; not served to peers and
	/// reclaimed only when the application unsubscribes.
	Sink,
}

/// A reader stream attached to a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ReaderRef {
	pub connection: u64,
	pub stream_id: u64,
}

/// A complete object drained from a subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaObject {
	pub group_id: u64,
	pub object_id: u64,
	pub flags: u8,
	pub data: Bytes,
}

#[derive(Debug)]
pub(crate) struct MediaSource {
	pub url: Bytes,
	pub kind: SourceKind,
	pub cache: FragmentCache,
	pub readers: Vec<ReaderRef>,

	// Local publish cursor.
	pub publish_group_id: u64,
	pub publish_object_id: u64,

	// In-order delivery cursor of a subscription sink.
	pub delivery_group_id: u64,
	pub delivery_object_id: u64,
}

impl MediaSource {
	pub fn new(url: Bytes, kind: SourceKind, is_real_time: bool) -> Self {
		let mut cache = FragmentCache::new();
		cache.is_real_time = is_real_time;

		Self {
			url,
			kind,
			cache,
			readers: Vec::new(),
			publish_group_id: 0,
			publish_object_id: 0,
			delivery_group_id: 0,
			delivery_object_id: 0,
		}
	}

	pub fn attach(&mut self, reader: ReaderRef) {
		if !self.readers.contains(&reader) {
			self.readers.push(reader);
		}
	}

	pub fn detach(&mut self, reader: ReaderRef) {
		self.readers.retain(|r| *r != reader);
	}

	/// Whether the source may be reclaimed: closed, unread, and either
	/// drained or past its linger time. Subscription sinks are reclaimed
	/// explicitly by the application instead.
	pub fn reclaimable(&self, now: u64) -> bool {
		self.kind != SourceKind::Sink
			&& self.cache.is_closed()
			&& self.readers.is_empty()
			&& (self.cache.is_empty() || self.cache.delete_time.map(|t| now >= t).unwrap_or(false))
	}

	/// Drain the next complete object in `(group, object)` order.
	pub fn poll_object(&mut self) -> Option<MediaObject> {
		let (group_id, object_id) = (self.delivery_group_id, self.delivery_object_id);
		let (next_group, next_object, _) = self.cache.next();
		if (group_id, object_id) >= (next_group, next_object) {
			return None;
		}

		let data = self.cache.assemble(group_id, object_id);
		let flags = self
			.cache
			.get(group_id, object_id, 0)
			.map(|f| f.flags)
			.unwrap_or_default();

		// Step to the next object, crossing the boundary when this object
		// was its group's last.
		let crossed = group_id < next_group
			&& self
				.cache
				.get(group_id + 1, 0, 0)
				.map(|f| f.nb_objects_previous_group == object_id + 1)
				.unwrap_or(false);
		if crossed {
			self.delivery_group_id = group_id + 1;
			self.delivery_object_id = 0;
		} else {
			self.delivery_object_id = object_id + 1;
		}

		Some(MediaObject {
			group_id,
			object_id,
			flags,
			data,
		})
	}

	/// Move the delivery cursor forward to a learned start point.
	pub fn skip_delivery_to(&mut self, group_id: u64, object_id: u64) {
		if (self.delivery_group_id, self.delivery_object_id) < (group_id, object_id) {
			self.delivery_group_id = group_id;
			self.delivery_object_id = object_id;
		}
	}
}
