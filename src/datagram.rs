//! The header prepended to every media datagram.

use bytes::{Buf, BufMut, Bytes};

use crate::coding::{varint_len, Decode, DecodeError, Encode};

/// Identifies the fragment carried by a datagram.
///
/// Encoded as a plain concatenation of varints, with `flags` and
/// `is_last_fragment` each taking one byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatagramHeader {
	/// The per-connection id negotiated when the transfer was opened.
	pub datagram_stream_id: u64,
	pub group_id: u64,
	pub object_id: u64,
	pub offset: u64,
	/// Publisher-assigned age hint, transported opaquely.
	pub queue_delay: u64,
	/// Opaque priority/class byte. `0xff` marks a skipped-object placeholder.
	pub flags: u8,
	/// The object count of `group_id - 1`; nonzero only on a group's first fragment.
	pub nb_objects_previous_group: u64,
	pub is_last_fragment: bool,
}

impl Decode for DatagramHeader {
	fn decode<R: Buf>(r: &mut R) -> Result<Self, DecodeError> {
		let datagram_stream_id = u64::decode(r)?;
		let group_id = u64::decode(r)?;
		let object_id = u64::decode(r)?;
		let offset = u64::decode(r)?;
		let queue_delay = u64::decode(r)?;
		let flags = u8::decode(r)?;
		let nb_objects_previous_group = u64::decode(r)?;
		let is_last_fragment = bool::decode(r)?;

		Ok(Self {
			datagram_stream_id,
			group_id,
			object_id,
			offset,
			queue_delay,
			flags,
			nb_objects_previous_group,
			is_last_fragment,
		})
	}
}

impl Encode for DatagramHeader {
	fn encode<W: BufMut>(&self, w: &mut W) {
		self.datagram_stream_id.encode(w);
		self.group_id.encode(w);
		self.object_id.encode(w);
		self.offset.encode(w);
		self.queue_delay.encode(w);
		self.flags.encode(w);
		self.nb_objects_previous_group.encode(w);
		self.is_last_fragment.encode(w);
	}
}

impl DatagramHeader {
	/// The number of bytes the header takes on the wire.
	pub fn len(&self) -> usize {
		varint_len(self.datagram_stream_id)
			+ varint_len(self.group_id)
			+ varint_len(self.object_id)
			+ varint_len(self.offset)
			+ varint_len(self.queue_delay)
			+ 1 + varint_len(self.nb_objects_previous_group)
			+ 1
	}

	/// Encode the header followed by the payload.
	pub fn with_payload(&self, payload: &[u8]) -> Bytes {
		let mut buf = bytes::BytesMut::with_capacity(self.len() + payload.len());
		self.encode(&mut buf);
		buf.put_slice(payload);
		buf.freeze()
	}
}
