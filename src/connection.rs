//! Per-connection state: the stream contexts and the id spaces they share.

use std::collections::{BTreeMap, VecDeque};

use crate::ack::AckTracker;
use crate::congestion::CongestionController;
use crate::message::{Message, MessageBuffer, SendBuffer};
use crate::publish::PublisherState;
use crate::source::SourceId;

/// What the send side of a control stream is doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SendState {
	/// Nothing but queued control messages.
	Ready,
	/// Reading media from the cache onto this stream.
	Streaming,
	/// Respond to the peer's FIN, then go quiet.
	Fin,
	NoMore,
}

/// What the receive side of a control stream expects next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReceiveState {
	/// A server stream that has not seen its opening message yet.
	Initial,
	/// A client waiting for the answer to its post.
	Confirmation,
	/// Media, repairs, or the final object notification.
	Fragments,
	Done,
}

/// One bidirectional stream and the media transfer bound to it.
#[derive(Debug)]
pub(crate) struct StreamCtx {
	pub stream_id: u64,
	pub source: Option<SourceId>,

	pub is_sender: bool,
	pub is_datagram: bool,
	pub datagram_stream_id: u64,
	pub is_active_datagram: bool,

	/// Reader state when this stream serves media from a cache.
	pub publisher: Option<PublisherState>,
	/// Outstanding datagrams sent for this stream.
	pub ack: AckTracker,

	pub receive: MessageBuffer,
	pub receive_state: ReceiveState,

	pub send_state: SendState,
	pub send_queue: VecDeque<Message>,
	pub sending: Option<SendBuffer>,
	/// Finish the stream once the staged message and queue drain.
	pub fin_after_send: bool,

	// Stream-mode senders renumber objects flatly per stream.
	pub next_object_id: u64,
	pub next_object_offset: u64,

	pub is_final_sent: bool,
	pub is_local_finished: bool,
	pub is_peer_finished: bool,
}

impl StreamCtx {
	pub fn new(stream_id: u64) -> Self {
		Self {
			stream_id,
			source: None,
			is_sender: false,
			is_datagram: false,
			datagram_stream_id: 0,
			is_active_datagram: false,
			publisher: None,
			ack: AckTracker::new(),
			receive: MessageBuffer::default(),
			receive_state: ReceiveState::Initial,
			send_state: SendState::Ready,
			send_queue: VecDeque::new(),
			sending: None,
			fin_after_send: false,
			next_object_id: 0,
			next_object_offset: 0,
			is_final_sent: false,
			is_local_finished: false,
			is_peer_finished: false,
		}
	}
}

/// The QUICR state of one transport connection.
#[derive(Debug)]
pub(crate) struct Connection {
	pub streams: BTreeMap<u64, StreamCtx>,

	next_stream_id: u64,
	pub next_datagram_stream_id: u64,
	/// Datagrams below this id arriving after a local abandon are dropped
	/// silently instead of being errors.
	pub next_abandon_datagram_id: u64,

	pub congestion: CongestionController,
}

impl Connection {
	pub fn new(is_server: bool, congestion_control: bool) -> Self {
		Self {
			streams: BTreeMap::new(),
			// Locally initiated bidirectional stream ids.
			next_stream_id: if is_server { 1 } else { 0 },
			next_datagram_stream_id: 0,
			next_abandon_datagram_id: 0,
			congestion: CongestionController::new(congestion_control),
		}
	}

	/// Open a locally initiated stream.
	pub fn open_stream(&mut self) -> u64 {
		let stream_id = self.next_stream_id;
		self.next_stream_id += 4;
		self.streams.insert(stream_id, StreamCtx::new(stream_id));
		stream_id
	}

	/// Find the stream bound to a datagram stream id, by direction.
	pub fn find_datagram_stream(&self, datagram_stream_id: u64, is_sender: bool) -> Option<u64> {
		self.streams
			.values()
			.find(|s| s.is_datagram && s.is_sender == is_sender && s.datagram_stream_id == datagram_stream_id)
			.map(|s| s.stream_id)
	}

	pub fn allocate_datagram_stream_id(&mut self) -> u64 {
		let id = self.next_datagram_stream_id;
		self.next_datagram_stream_id += 1;
		id
	}
}
