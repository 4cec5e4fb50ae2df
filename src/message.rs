//! Control messages exchanged on the bidirectional stream that opens a media
//! transfer.
//!
//! Every message is prefixed by a 16-bit big-endian length. The payload starts
//! with a single-byte tag followed by varint-encoded fields.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::coding::{Decode, DecodeError, Encode};

/// Where a subscriber wants the media to start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeIntent {
	/// From the beginning of the group currently being received, when the cache
	/// still holds it; otherwise from the next group boundary.
	CurrentGroup,
	/// From the next group boundary.
	NextGroup,
	/// From a specific point, clamped to what the cache still holds.
	StartPoint { group_id: u64, object_id: u64 },
}

impl Decode for SubscribeIntent {
	fn decode<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		match u64::decode(r)? {
			0 => Ok(Self::CurrentGroup),
			1 => Ok(Self::NextGroup),
			2 => {
				let group_id = u64::decode(r)?;
				let object_id = u64::decode(r)?;
				Ok(Self::StartPoint { group_id, object_id })
			}
			_ => Err(DecodeError::InvalidValue),
		}
	}
}

impl Encode for SubscribeIntent {
	fn encode<W: BufMut>(&self, w: &mut W) {
		match self {
			Self::CurrentGroup => 0u64.encode(w),
			Self::NextGroup => 1u64.encode(w),
			Self::StartPoint { group_id, object_id } => {
				2u64.encode(w);
				group_id.encode(w);
				object_id.encode(w);
			}
		}
	}
}

/// A control message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
	/// Subscribe to a URL, content delivered in order on this stream.
	OpenStream { url: Bytes, intent: SubscribeIntent },

	/// Subscribe to a URL, content delivered as datagrams tagged with the given id.
	OpenDatagram {
		url: Bytes,
		datagram_stream_id: u64,
		intent: SubscribeIntent,
	},

	/// All content has been sent; no object at or past this point exists.
	FinDatagram { final_group_id: u64, final_object_id: u64 },

	/// Ask the sender to retransmit an object. Not handled on receive.
	RequestRepair { final_object_id: u64, object_id: u64 },

	/// A fragment of an object, sent in order on this stream.
	///
	/// The last-fragment flag rides in the low bit of the length varint.
	Repair {
		object_id: u64,
		offset: u64,
		is_last_fragment: bool,
		data: Bytes,
	},

	/// Offer to publish a URL towards the receiver.
	Post { url: Bytes, use_datagrams: bool },

	/// Accept a [Message::Post]; the receiver allocated the datagram stream id.
	Accept { datagram_stream_id: u64 },

	/// The earliest point the peer can expect to receive.
	StartPoint { group_id: u64, object_id: u64 },

	/// The eviction mode of the cache feeding this stream.
	CachePolicy { is_real_time: bool },
}

const TAG_OPEN_STREAM: u8 = 1;
const TAG_OPEN_DATAGRAM: u8 = 2;
const TAG_FIN_DATAGRAM: u8 = 3;
const TAG_REQUEST_REPAIR: u8 = 4;
const TAG_REPAIR: u8 = 5;
const TAG_POST: u8 = 6;
const TAG_ACCEPT: u8 = 7;
const TAG_START_POINT: u8 = 8;
const TAG_CACHE_POLICY: u8 = 9;

impl Decode for Message {
	fn decode<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		let tag = u8::decode(r)?;
		match tag {
			TAG_OPEN_STREAM => {
				let url = Bytes::decode(r)?;
				let intent = SubscribeIntent::decode(r)?;
				Ok(Self::OpenStream { url, intent })
			}
			TAG_OPEN_DATAGRAM => {
				let url = Bytes::decode(r)?;
				let datagram_stream_id = u64::decode(r)?;
				let intent = SubscribeIntent::decode(r)?;
				Ok(Self::OpenDatagram {
					url,
					datagram_stream_id,
					intent,
				})
			}
			TAG_FIN_DATAGRAM => {
				let final_group_id = u64::decode(r)?;
				let final_object_id = u64::decode(r)?;
				Ok(Self::FinDatagram {
					final_group_id,
					final_object_id,
				})
			}
			TAG_REQUEST_REPAIR => {
				let final_object_id = u64::decode(r)?;
				let object_id = u64::decode(r)?;
				Ok(Self::RequestRepair {
					final_object_id,
					object_id,
				})
			}
			TAG_REPAIR => {
				let object_id = u64::decode(r)?;
				let offset = u64::decode(r)?;
				let length = u64::decode(r)?;
				let is_last_fragment = (length & 1) != 0;
				let length: usize = (length >> 1).try_into().map_err(|_| DecodeError::BoundsExceeded)?;
				if r.remaining() < length {
					return Err(DecodeError::Short);
				}
				let data = r.copy_to_bytes(length);
				Ok(Self::Repair {
					object_id,
					offset,
					is_last_fragment,
					data,
				})
			}
			TAG_POST => {
				let url = Bytes::decode(r)?;
				let use_datagrams = bool::decode(r)?;
				Ok(Self::Post { url, use_datagrams })
			}
			TAG_ACCEPT => {
				let datagram_stream_id = u64::decode(r)?;
				Ok(Self::Accept { datagram_stream_id })
			}
			TAG_START_POINT => {
				let group_id = u64::decode(r)?;
				let object_id = u64::decode(r)?;
				Ok(Self::StartPoint { group_id, object_id })
			}
			TAG_CACHE_POLICY => {
				let is_real_time = bool::decode(r)?;
				Ok(Self::CachePolicy { is_real_time })
			}
			_ => Err(DecodeError::InvalidMessage(tag as u64)),
		}
	}
}

impl Encode for Message {
	fn encode<W: BufMut>(&self, w: &mut W) {
		match self {
			Self::OpenStream { url, intent } => {
				TAG_OPEN_STREAM.encode(w);
				url.encode(w);
				intent.encode(w);
			}
			Self::OpenDatagram {
				url,
				datagram_stream_id,
				intent,
			} => {
				TAG_OPEN_DATAGRAM.encode(w);
				url.encode(w);
				datagram_stream_id.encode(w);
				intent.encode(w);
			}
			Self::FinDatagram {
				final_group_id,
				final_object_id,
			} => {
				TAG_FIN_DATAGRAM.encode(w);
				final_group_id.encode(w);
				final_object_id.encode(w);
			}
			Self::RequestRepair {
				final_object_id,
				object_id,
			} => {
				TAG_REQUEST_REPAIR.encode(w);
				final_object_id.encode(w);
				object_id.encode(w);
			}
			Self::Repair {
				object_id,
				offset,
				is_last_fragment,
				data,
			} => {
				TAG_REPAIR.encode(w);
				object_id.encode(w);
				offset.encode(w);
				((data.len() as u64) << 1 | *is_last_fragment as u64).encode(w);
				w.put_slice(data);
			}
			Self::Post { url, use_datagrams } => {
				TAG_POST.encode(w);
				url.encode(w);
				use_datagrams.encode(w);
			}
			Self::Accept { datagram_stream_id } => {
				TAG_ACCEPT.encode(w);
				datagram_stream_id.encode(w);
			}
			Self::StartPoint { group_id, object_id } => {
				TAG_START_POINT.encode(w);
				group_id.encode(w);
				object_id.encode(w);
			}
			Self::CachePolicy { is_real_time } => {
				TAG_CACHE_POLICY.encode(w);
				is_real_time.encode(w);
			}
		}
	}
}

impl Message {
	/// Encode with the 16-bit length prefix, ready to put on the stream.
	pub fn frame(&self) -> Bytes {
		let payload = self.encode_bytes();
		debug_assert!(payload.len() <= u16::MAX as usize);

		let mut framed = BytesMut::with_capacity(2 + payload.len());
		framed.put_u16(payload.len() as u16);
		framed.put_slice(&payload);
		framed.freeze()
	}
}

/// Accumulates stream bytes into complete framed messages.
///
/// Messages may arrive split across any number of read callbacks, or several
/// back to back inside one; [MessageBuffer::absorb] hands them back one at a
/// time.
#[derive(Default, Debug)]
pub struct MessageBuffer {
	header: [u8; 2],
	header_len: usize,
	payload: BytesMut,
}

impl MessageBuffer {
	/// Consume bytes from `data` until one message payload completes.
	///
	/// Returns the raw payload of the next complete message, or None when more
	/// data is needed. Call in a loop until it returns None.
	pub fn absorb(&mut self, data: &mut &[u8]) -> Option<Bytes> {
		while self.header_len < 2 && !data.is_empty() {
			self.header[self.header_len] = data[0];
			self.header_len += 1;
			*data = &data[1..];
		}

		if self.header_len < 2 {
			return None;
		}

		let expected = u16::from_be_bytes(self.header) as usize;
		let missing = expected - self.payload.len();
		let take = missing.min(data.len());
		self.payload.extend_from_slice(&data[..take]);
		*data = &data[take..];

		if self.payload.len() < expected {
			return None;
		}

		self.header_len = 0;
		Some(self.payload.split().freeze())
	}
}

/// An outgoing framed message, drained in budget-sized pieces.
#[derive(Debug)]
pub struct SendBuffer {
	data: Bytes,
}

impl SendBuffer {
	pub fn new(message: &Message) -> Self {
		Self { data: message.frame() }
	}

	/// Take up to `space` bytes of the staged message.
	pub fn take(&mut self, space: usize) -> Bytes {
		self.data.split_to(space.min(self.data.len()))
	}

	pub fn is_done(&self) -> bool {
		self.data.is_empty()
	}
}
