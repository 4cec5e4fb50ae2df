use crate::coding;

/// A list of possible errors that can occur during a session.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
	#[error("decode error")]
	Decode,

	/// An unexpected message for the current stream state.
	#[error("protocol violation")]
	ProtocolViolation,

	#[error("unexpected message")]
	UnexpectedMessage,

	/// Some varint was too large for the receiving field.
	#[error("varint bounds exceeded")]
	BoundsExceeded,

	#[error("not found")]
	NotFound,

	/// A duplicate URL or stream id was used.
	#[error("duplicate")]
	Duplicate,

	/// The stream or source is already closed.
	#[error("closed")]
	Closed,

	/// A condition the code proves impossible.
	#[error("internal error")]
	Internal,
}

impl Error {
	/// An integer code that is sent over the wire on connection or stream close.
	pub fn to_code(&self) -> u32 {
		match self {
			Self::Internal => 0x01,
			Self::ProtocolViolation => 0x02,
			Self::Decode => 0x03,
			Self::UnexpectedMessage => 0x04,
			Self::BoundsExceeded => 0x05,
			Self::NotFound => 0x06,
			Self::Duplicate => 0x07,
			Self::Closed => 0x08,
		}
	}

	/// Decode an error from a wire code.
	pub fn from_code(code: u32) -> Self {
		match code {
			0x01 => Self::Internal,
			0x02 => Self::ProtocolViolation,
			0x03 => Self::Decode,
			0x04 => Self::UnexpectedMessage,
			0x05 => Self::BoundsExceeded,
			0x06 => Self::NotFound,
			0x07 => Self::Duplicate,
			0x08 => Self::Closed,
			_ => Self::ProtocolViolation,
		}
	}
}

impl From<coding::DecodeError> for Error {
	fn from(err: coding::DecodeError) -> Self {
		tracing::warn!(%err, "decode error");
		match err {
			coding::DecodeError::BoundsExceeded => Error::BoundsExceeded,
			_ => Error::Decode,
		}
	}
}

pub type Result<T> = std::result::Result<T, Error>;
