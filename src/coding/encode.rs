use bytes::{Bytes, BytesMut};

/// Write the value to the buffer.
pub trait Encode: Sized {
	/// Encode the value to the given writer.
	///
	/// This will panic if the [bytes::BufMut] does not have enough capacity.
	fn encode<W: bytes::BufMut>(&self, w: &mut W);

	/// Encode the value into a [Bytes] buffer.
	///
	/// NOTE: This will allocate.
	fn encode_bytes(&self) -> Bytes {
		let mut buf = BytesMut::new();
		self.encode(&mut buf);
		buf.freeze()
	}
}

impl Encode for bool {
	fn encode<W: bytes::BufMut>(&self, w: &mut W) {
		w.put_u8(*self as u8);
	}
}

impl Encode for u8 {
	fn encode<W: bytes::BufMut>(&self, w: &mut W) {
		w.put_u8(*self);
	}
}

impl Encode for u16 {
	fn encode<W: bytes::BufMut>(&self, w: &mut W) {
		w.put_u16(*self);
	}
}

impl Encode for u64 {
	/// Encode a QUIC variable-length integer.
	///
	/// This will panic if the value does not fit in 62 bits.
	fn encode<W: bytes::BufMut>(&self, w: &mut W) {
		let v = *self;
		if v < 1 << 6 {
			w.put_u8(v as u8);
		} else if v < 1 << 14 {
			w.put_u16(0b01 << 14 | v as u16);
		} else if v < 1 << 30 {
			w.put_u32(0b10 << 30 | v as u32);
		} else if v < 1 << 62 {
			w.put_u64(0b11 << 62 | v);
		} else {
			panic!("varint too large");
		}
	}
}

impl Encode for usize {
	fn encode<W: bytes::BufMut>(&self, w: &mut W) {
		(*self as u64).encode(w)
	}
}

impl Encode for String {
	fn encode<W: bytes::BufMut>(&self, w: &mut W) {
		self.as_str().encode(w)
	}
}

impl Encode for &str {
	fn encode<W: bytes::BufMut>(&self, w: &mut W) {
		self.len().encode(w);
		w.put(self.as_bytes());
	}
}

impl Encode for Vec<u8> {
	fn encode<W: bytes::BufMut>(&self, w: &mut W) {
		self.len().encode(w);
		w.put_slice(self);
	}
}

impl Encode for bytes::Bytes {
	fn encode<W: bytes::BufMut>(&self, w: &mut W) {
		self.len().encode(w);
		w.put_slice(self);
	}
}

/// The number of bytes a varint takes on the wire.
pub fn varint_len(v: u64) -> usize {
	if v < 1 << 6 {
		1
	} else if v < 1 << 14 {
		2
	} else if v < 1 << 30 {
		4
	} else {
		8
	}
}
