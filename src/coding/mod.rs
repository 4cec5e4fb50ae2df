//! Low-level wire encoding: QUIC varints and length-prefixed byte strings.

mod decode;
mod encode;

pub use decode::*;
pub use encode::*;

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::{Bytes, BytesMut};

	fn round_trip(v: u64) {
		let mut buf = BytesMut::new();
		v.encode(&mut buf);
		assert_eq!(buf.len(), varint_len(v));
		let decoded = u64::decode(&mut buf).unwrap();
		assert_eq!(decoded, v);
		assert!(buf.is_empty());
	}

	#[test]
	fn test_varint_classes() {
		for v in [0, 1, 63, 64, 16383, 16384, (1 << 30) - 1, 1 << 30, (1 << 62) - 1] {
			round_trip(v);
		}
	}

	#[test]
	fn test_varint_short() {
		let mut buf = BytesMut::new();
		((1u64 << 30) + 5).encode(&mut buf);

		// Every truncation must fail with Short.
		for len in 0..buf.len() {
			let mut partial = Bytes::copy_from_slice(&buf[..len]);
			assert!(matches!(u64::decode(&mut partial), Err(DecodeError::Short)));
		}
	}

	#[test]
	#[should_panic(expected = "varint too large")]
	fn test_varint_too_large() {
		let mut buf = BytesMut::new();
		(1u64 << 62).encode(&mut buf);
	}

	#[test]
	fn test_bytes_prefix() {
		let data = Bytes::from_static(b"some media payload");
		let mut buf = BytesMut::new();
		data.encode(&mut buf);

		let decoded = Bytes::decode(&mut buf).unwrap();
		assert_eq!(decoded, data);
	}

	#[test]
	fn test_bytes_prefix_overruns_buffer() {
		// A length prefix larger than the remaining buffer must not decode.
		let mut buf = BytesMut::new();
		100usize.encode(&mut buf);
		buf.extend_from_slice(b"short");

		assert!(matches!(Bytes::decode(&mut buf), Err(DecodeError::Short)));
	}
}
