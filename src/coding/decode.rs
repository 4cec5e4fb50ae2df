use std::string::FromUtf8Error;
use thiserror::Error;

/// Read a value from the buffer.
///
/// If [DecodeError::Short] is returned, the caller should try again with more data.
pub trait Decode: Sized {
	/// Decode the value from the given buffer.
	fn decode<B: bytes::Buf>(buf: &mut B) -> Result<Self, DecodeError>;
}

/// A decode error.
#[derive(Error, Debug, Clone)]
pub enum DecodeError {
	#[error("short buffer")]
	Short,

	#[error("invalid string")]
	InvalidString(#[from] FromUtf8Error),

	#[error("invalid message: {0:?}")]
	InvalidMessage(u64),

	#[error("invalid value")]
	InvalidValue,

	#[error("bounds exceeded")]
	BoundsExceeded,
}

impl Decode for bool {
	fn decode<R: bytes::Buf>(r: &mut R) -> Result<Self, DecodeError> {
		match u8::decode(r)? {
			0 => Ok(false),
			1 => Ok(true),
			_ => Err(DecodeError::InvalidValue),
		}
	}
}

impl Decode for u8 {
	fn decode<R: bytes::Buf>(r: &mut R) -> Result<Self, DecodeError> {
		match r.has_remaining() {
			true => Ok(r.get_u8()),
			false => Err(DecodeError::Short),
		}
	}
}

impl Decode for u16 {
	fn decode<R: bytes::Buf>(r: &mut R) -> Result<Self, DecodeError> {
		match r.remaining() >= 2 {
			true => Ok(r.get_u16()),
			false => Err(DecodeError::Short),
		}
	}
}

impl Decode for u64 {
	/// Decode a QUIC variable-length integer.
	///
	/// The first two bits of the first byte name the length class: 1, 2, 4 or 8 bytes.
	fn decode<R: bytes::Buf>(r: &mut R) -> Result<Self, DecodeError> {
		if !r.has_remaining() {
			return Err(DecodeError::Short);
		}

		let first = r.get_u8();
		let extra = (1usize << (first >> 6)) - 1;
		let mut value = (first & 0x3f) as u64;

		if r.remaining() < extra {
			return Err(DecodeError::Short);
		}

		for _ in 0..extra {
			value = (value << 8) | r.get_u8() as u64;
		}

		Ok(value)
	}
}

impl Decode for usize {
	fn decode<R: bytes::Buf>(r: &mut R) -> Result<Self, DecodeError> {
		let value = u64::decode(r)?;
		value.try_into().map_err(|_| DecodeError::BoundsExceeded)
	}
}

impl Decode for String {
	/// Decode a string with a varint length prefix.
	fn decode<R: bytes::Buf>(r: &mut R) -> Result<Self, DecodeError> {
		let v = Vec::<u8>::decode(r)?;
		let str = String::from_utf8(v)?;

		Ok(str)
	}
}

impl Decode for Vec<u8> {
	fn decode<B: bytes::Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		let size = usize::decode(buf)?;

		if buf.remaining() < size {
			return Err(DecodeError::Short);
		}

		let bytes = buf.copy_to_bytes(size);
		Ok(bytes.to_vec())
	}
}

impl Decode for bytes::Bytes {
	fn decode<R: bytes::Buf>(r: &mut R) -> Result<Self, DecodeError> {
		let len = usize::decode(r)?;
		if r.remaining() < len {
			return Err(DecodeError::Short);
		}
		let bytes = r.copy_to_bytes(len);
		Ok(bytes)
	}
}
