//! The per-process QUICR context: the source registry, the open connections,
//! and the dispatch of transport events into the core.
//!
//! The context is sans-io: the embedding run-loop feeds it events
//! (`on_stream_data`, `on_datagram`, ack and loss callbacks), polls it for
//! bytes to send, and drains [TransportAction]s telling the transport which
//! streams are active. Nothing in here suspends or blocks.

use bytes::Bytes;

use crate::ack::{AckKey, SendRecord};
use crate::cache::FragmentCache;
use crate::coding::{varint_len, Decode};
use crate::config::Config;
use crate::connection::{Connection, ReceiveState, SendState, StreamCtx};
use crate::consumer::Feed;
use crate::datagram::DatagramHeader;
use crate::error::{Error, Result};
use crate::message::{Message, SubscribeIntent};
use crate::publish::{DatagramCheck, DatagramSend, PublisherState, StreamPoll};
use crate::relay::RelayState;
use crate::source::{MediaObject, MediaSource, ReaderRef, SourceId, SourceKind};

/// Something the core wants from the transport. Drained with
/// [Context::poll_action] after every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAction {
	/// Mark a stream active or inactive for `prepare to send` callbacks.
	StreamActive {
		connection: u64,
		stream_id: u64,
		active: bool,
	},
	/// Mark the connection ready (or not) to send datagrams.
	DatagramsReady { connection: u64, ready: bool },
	/// Queue a datagram immediately, outside the normal send poll. Used for
	/// loss-driven repeats.
	SendDatagram { connection: u64, payload: Bytes },
	/// Open a client connection for the pre-allocated id; used by the relay
	/// to reach its upstream.
	Connect { connection: u64, sni: String },
	/// Reset a stream after a protocol violation local to it.
	ResetStream {
		connection: u64,
		stream_id: u64,
		code: u32,
	},
}

/// Bytes to write on a stream, with the FIN mark.
#[derive(Debug, Default)]
pub struct StreamSend {
	pub data: Bytes,
	pub fin: bool,
}

/// The per-process QUICR context.
pub struct Context {
	config: Config,
	sources: Vec<Option<MediaSource>>,
	connections: std::collections::BTreeMap<u64, Connection>,
	next_connection_id: u64,
	pub(crate) relay: Option<RelayState>,
	actions: std::collections::VecDeque<TransportAction>,
}

impl Context {
	pub fn new(config: Config) -> Self {
		Self {
			config,
			sources: Vec::new(),
			connections: std::collections::BTreeMap::new(),
			next_connection_id: 1,
			relay: None,
			actions: std::collections::VecDeque::new(),
		}
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Drain the next pending transport action.
	pub fn poll_action(&mut self) -> Option<TransportAction> {
		self.actions.pop_front()
	}

	pub(crate) fn push_action(&mut self, action: TransportAction) {
		self.actions.push_back(action);
	}

	// --- connections -----------------------------------------------------

	/// The transport established a connection; register it and get its id.
	pub fn connection_created(&mut self, is_server: bool) -> u64 {
		let id = self.next_connection_id;
		self.next_connection_id += 1;
		self.connections
			.insert(id, Connection::new(is_server, self.config.congestion_control));
		tracing::debug!(connection = id, server = is_server, "connection registered");
		id
	}

	/// Allocate a connection id the transport will open later, on
	/// [TransportAction::Connect].
	pub(crate) fn connection_pending(&mut self) -> u64 {
		self.connection_created(false)
	}

	/// The transport reports the connection gone; cascade teardown.
	pub fn on_connection_closed(&mut self, connection: u64, now: u64) {
		let stream_ids: Vec<u64> = match self.connections.get(&connection) {
			Some(conn) => conn.streams.keys().copied().collect(),
			None => return,
		};
		for stream_id in stream_ids {
			self.remove_stream(connection, stream_id, now);
		}
		self.connections.remove(&connection);

		if let Some(relay) = self.relay.as_mut() {
			if relay.upstream == Some(connection) {
				relay.upstream = None;
			}
		}
	}

	// --- publishing ------------------------------------------------------

	/// Register a local media source under a URL.
	pub fn publish(&mut self, url: &[u8], real_time: bool) -> Result<SourceId> {
		if self.find_source_by_url(url).is_some() {
			return Err(Error::Duplicate);
		}
		Ok(self.create_source(
			Bytes::copy_from_slice(url),
			SourceKind::Local,
			real_time || self.config.real_time_cache,
		))
	}

	/// Append a complete object to a published source.
	///
	/// `new_group` closes the current group first; the next group's first
	/// fragment carries the closed group's object count.
	pub fn publish_object(
		&mut self,
		source: SourceId,
		data: Bytes,
		flags: u8,
		queue_delay: u64,
		new_group: bool,
		now: u64,
	) -> Result<()> {
		let entry = self.source_mut(source)?;
		if entry.cache.is_closed() {
			return Err(Error::Closed);
		}

		let mut nb_objects_previous_group = 0;
		if new_group && entry.publish_object_id > 0 {
			nb_objects_previous_group = entry.publish_object_id;
			entry.publish_group_id += 1;
			entry.publish_object_id = 0;
		}

		let (group_id, object_id) = (entry.publish_group_id, entry.publish_object_id);
		entry.cache.propose(
			data,
			group_id,
			object_id,
			0,
			queue_delay,
			flags,
			nb_objects_previous_group,
			true,
			now,
		);
		entry.publish_object_id += 1;

		self.wake_readers(source);
		Ok(())
	}

	/// Declare that a published source starts at the given point; older
	/// numbers will never be published.
	pub fn set_publish_start(&mut self, source: SourceId, group_id: u64, object_id: u64) -> Result<()> {
		{
			let entry = self.source_mut(source)?;
			entry.publish_group_id = group_id;
			entry.publish_object_id = object_id;
		}
		self.source_learn_start(source, group_id, object_id);
		Ok(())
	}

	/// Close a published source: its end becomes the last object published.
	pub fn close_source(&mut self, source: SourceId, now: u64) -> Result<()> {
		{
			let entry = self.source_mut(source)?;
			let (group_id, object_id) = (entry.publish_group_id, entry.publish_object_id);
			entry.cache.learn_end(group_id, object_id);
			entry.cache.close(now);
		}
		self.wake_readers(source);
		Ok(())
	}

	/// The number of live registered sources (delivery sinks excluded).
	pub fn source_count(&self) -> usize {
		self.sources
			.iter()
			.flatten()
			.filter(|s| s.kind != SourceKind::Sink)
			.count()
	}

	// --- subscribing -----------------------------------------------------

	/// Subscribe to a URL over a connection. The returned id is the local
	/// delivery sink; drain it with [Context::poll_object].
	pub fn subscribe(
		&mut self,
		connection: u64,
		url: &[u8],
		use_datagrams: bool,
		intent: SubscribeIntent,
	) -> Result<SourceId> {
		let sink = self.create_source(Bytes::copy_from_slice(url), SourceKind::Sink, false);
		self.subscribe_into(connection, url, use_datagrams, intent, sink)?;
		Ok(sink)
	}

	/// Open a subscription whose fragments feed an existing source; used
	/// both by [Context::subscribe] and by the relay's upstream fetch.
	pub(crate) fn subscribe_into(
		&mut self,
		connection: u64,
		url: &[u8],
		use_datagrams: bool,
		intent: SubscribeIntent,
		source: SourceId,
	) -> Result<u64> {
		let conn = self.connections.get_mut(&connection).ok_or(Error::NotFound)?;
		let stream_id = conn.open_stream();
		let message = if use_datagrams {
			let datagram_stream_id = conn.allocate_datagram_stream_id();
			let stream = conn.streams.get_mut(&stream_id).ok_or(Error::Internal)?;
			stream.is_datagram = true;
			stream.datagram_stream_id = datagram_stream_id;
			Message::OpenDatagram {
				url: Bytes::copy_from_slice(url),
				datagram_stream_id,
				intent,
			}
		} else {
			Message::OpenStream {
				url: Bytes::copy_from_slice(url),
				intent,
			}
		};

		let stream = conn.streams.get_mut(&stream_id).ok_or(Error::Internal)?;
		stream.source = Some(source);
		stream.receive_state = ReceiveState::Fragments;
		stream.send_queue.push_back(message);

		tracing::debug!(connection, stream = stream_id, datagram = use_datagrams, "subscribe");
		self.push_action(TransportAction::StreamActive {
			connection,
			stream_id,
			active: true,
		});
		Ok(stream_id)
	}

	/// Drain the next complete object of a subscription, in order.
	pub fn poll_object(&mut self, subscription: SourceId) -> Option<MediaObject> {
		self.sources
			.get_mut(subscription.0)
			.and_then(|s| s.as_mut())
			.and_then(|s| s.poll_object())
	}

	/// Whether a subscription received everything up to the announced end.
	pub fn is_subscription_finished(&self, subscription: SourceId) -> bool {
		self.sources
			.get(subscription.0)
			.and_then(|s| s.as_ref())
			.map(|s| s.cache.is_finished())
			.unwrap_or(false)
	}

	/// Look up a registered source by URL.
	pub fn find_source(&self, url: &[u8]) -> Option<SourceId> {
		self.find_source_by_url(url)
	}

	/// Inspect the cache behind a source or subscription.
	pub fn source_cache(&self, source: SourceId) -> Option<&FragmentCache> {
		self.sources
			.get(source.0)
			.and_then(|s| s.as_ref())
			.map(|s| &s.cache)
	}

	/// The objects a connection's readers dropped under congestion, with the
	/// class byte each was published with.
	pub fn dropped_objects(&self, connection: u64) -> Vec<(u64, u64)> {
		let mut dropped = Vec::new();
		if let Some(conn) = self.connections.get(&connection) {
			for stream in conn.streams.values() {
				if let Some(publisher) = stream.publisher.as_ref() {
					dropped.extend(publisher.dropped_objects());
				}
			}
		}
		dropped
	}

	/// Drop a subscription sink once the application is done with it.
	pub fn unsubscribe(&mut self, subscription: SourceId) {
		if let Some(slot) = self.sources.get_mut(subscription.0) {
			if slot.as_ref().map(|s| s.kind == SourceKind::Sink).unwrap_or(false) {
				*slot = None;
			}
		}
	}

	/// Offer to publish a source towards the peer. Media flows once the
	/// peer accepts.
	pub fn post(&mut self, connection: u64, source: SourceId, use_datagrams: bool) -> Result<u64> {
		let url = self.source_mut(source)?.url.clone();
		let conn = self.connections.get_mut(&connection).ok_or(Error::NotFound)?;
		let stream_id = conn.open_stream();
		let stream = conn.streams.get_mut(&stream_id).ok_or(Error::Internal)?;
		stream.source = Some(source);
		stream.is_sender = true;
		stream.is_datagram = use_datagrams;
		stream.receive_state = ReceiveState::Confirmation;
		stream.send_queue.push_back(Message::Post {
			url,
			use_datagrams,
		});

		tracing::debug!(connection, stream = stream_id, datagram = use_datagrams, "post");
		self.push_action(TransportAction::StreamActive {
			connection,
			stream_id,
			active: true,
		});
		Ok(stream_id)
	}

	// --- stream events ---------------------------------------------------

	/// Stream data arrived, possibly carrying several messages, possibly
	/// with the FIN mark.
	pub fn on_stream_data(&mut self, connection: u64, stream_id: u64, data: &[u8], fin: bool, now: u64) -> Result<()> {
		let mut cursor = data;
		loop {
			let payload = {
				let conn = self.connections.get_mut(&connection).ok_or(Error::NotFound)?;
				let stream = conn
					.streams
					.entry(stream_id)
					.or_insert_with(|| StreamCtx::new(stream_id));
				if stream.receive_state == ReceiveState::Done && !cursor.is_empty() {
					tracing::warn!(connection, stream = stream_id, "data after the last expected message");
					return Err(Error::ProtocolViolation);
				}
				match stream.receive.absorb(&mut cursor) {
					Some(payload) => payload,
					None => break,
				}
			};

			let mut buf = payload;
			let message = Message::decode(&mut buf)?;
			self.handle_message(connection, stream_id, message, now)?;
		}

		if fin {
			self.on_peer_finished(connection, stream_id, now);
		}
		Ok(())
	}

	fn on_peer_finished(&mut self, connection: u64, stream_id: u64, now: u64) {
		let local_finished = {
			let stream = match self
				.connections
				.get_mut(&connection)
				.and_then(|c| c.streams.get_mut(&stream_id))
			{
				Some(stream) => stream,
				None => return,
			};
			stream.is_peer_finished = true;
			stream.is_local_finished
		};

		if local_finished {
			self.remove_stream(connection, stream_id, now);
		} else {
			if let Some(stream) = self
				.connections
				.get_mut(&connection)
				.and_then(|c| c.streams.get_mut(&stream_id))
			{
				stream.send_state = SendState::Fin;
			}
			self.push_action(TransportAction::StreamActive {
				connection,
				stream_id,
				active: true,
			});
		}
	}

	fn handle_message(&mut self, connection: u64, stream_id: u64, message: Message, now: u64) -> Result<()> {
		let receive_state = self
			.connections
			.get(&connection)
			.and_then(|c| c.streams.get(&stream_id))
			.map(|s| s.receive_state)
			.ok_or(Error::NotFound)?;

		match message {
			Message::OpenStream { url, intent } => {
				if receive_state != ReceiveState::Initial {
					return Err(Error::ProtocolViolation);
				}
				self.accept_subscribe(connection, stream_id, &url, false, 0, intent)
			}
			Message::OpenDatagram {
				url,
				datagram_stream_id,
				intent,
			} => {
				if receive_state != ReceiveState::Initial {
					return Err(Error::ProtocolViolation);
				}
				self.accept_subscribe(connection, stream_id, &url, true, datagram_stream_id, intent)
			}
			Message::Post { url, use_datagrams } => {
				if receive_state != ReceiveState::Initial {
					return Err(Error::ProtocolViolation);
				}
				self.accept_post(connection, stream_id, &url, use_datagrams, now)
			}
			Message::Accept { datagram_stream_id } => {
				if receive_state != ReceiveState::Confirmation {
					return Err(Error::ProtocolViolation);
				}
				self.post_accepted(connection, stream_id, datagram_stream_id)
			}
			Message::FinDatagram {
				final_group_id,
				final_object_id,
			} => {
				if receive_state != ReceiveState::Fragments {
					return Err(Error::ProtocolViolation);
				}
				tracing::debug!(
					connection,
					stream = stream_id,
					group = final_group_id,
					object = final_object_id,
					"final object notified"
				);
				let source = self.stream_source(connection, stream_id)?;
				let feed = match self.source_cache_mut(source) {
					Some(cache) => cache.learn_final_object(final_group_id, final_object_id),
					None => return Ok(()),
				};
				self.wake_readers(source);
				if feed == Feed::Finished {
					self.finish_consumer(connection, stream_id);
				}
				Ok(())
			}
			Message::Repair {
				object_id,
				offset,
				is_last_fragment,
				data,
			} => {
				if receive_state != ReceiveState::Fragments {
					return Err(Error::ProtocolViolation);
				}
				let source = self.stream_source(connection, stream_id)?;
				let (added, feed) = match self.source_cache_mut(source) {
					Some(cache) => cache.receive_stream_fragment(object_id, offset, is_last_fragment, data, now),
					None => return Ok(()),
				};
				if added {
					self.wake_readers(source);
				}
				if feed == Feed::Finished {
					self.finish_consumer(connection, stream_id);
				}
				Ok(())
			}
			Message::StartPoint { group_id, object_id } => {
				if receive_state != ReceiveState::Fragments {
					return Err(Error::ProtocolViolation);
				}
				let source = self.stream_source(connection, stream_id)?;
				self.source_learn_start(source, group_id, object_id);
				Ok(())
			}
			Message::CachePolicy { is_real_time } => {
				if receive_state != ReceiveState::Fragments {
					return Err(Error::ProtocolViolation);
				}
				let source = self.stream_source(connection, stream_id)?;
				self.source_learn_policy(source, is_real_time);
				Ok(())
			}
			Message::RequestRepair { .. } => {
				// Defined on the wire but not handled on receive.
				tracing::warn!(connection, stream = stream_id, "repair request not supported");
				self.push_action(TransportAction::ResetStream {
					connection,
					stream_id,
					code: Error::ProtocolViolation.to_code(),
				});
				Err(Error::ProtocolViolation)
			}
		}
	}

	/// A peer subscribed to a URL on this stream; bind a reader to the
	/// source and answer with its start point.
	fn accept_subscribe(
		&mut self,
		connection: u64,
		stream_id: u64,
		url: &[u8],
		use_datagrams: bool,
		datagram_stream_id: u64,
		intent: SubscribeIntent,
	) -> Result<()> {
		tracing::debug!(
			connection,
			stream = stream_id,
			url = %String::from_utf8_lossy(url),
			datagram = use_datagrams,
			"subscribe received"
		);

		let source = match self.find_source_by_url(url) {
			Some(source) => source,
			None => self.default_source(url).ok_or(Error::NotFound)?,
		};

		let (start, is_real_time) = {
			let entry = self.source_mut(source)?;
			(resolve_intent(&entry.cache, intent), entry.cache.is_real_time())
		};

		{
			let entry = self.source_mut(source)?;
			entry.attach(ReaderRef {
				connection,
				stream_id,
			});
		}

		let conn = self.connections.get_mut(&connection).ok_or(Error::NotFound)?;
		let stream = conn
			.streams
			.get_mut(&stream_id)
			.ok_or(Error::NotFound)?;
		stream.source = Some(source);
		stream.is_sender = true;
		stream.is_datagram = use_datagrams;
		stream.datagram_stream_id = datagram_stream_id;
		stream.publisher = Some(PublisherState::new(start.0, start.1));
		stream.receive_state = ReceiveState::Done;

		// Stream mode renumbers objects flatly on the wire, so only datagram
		// readers learn group-addressed start points.
		if use_datagrams && start != (0, 0) {
			stream.send_queue.push_back(Message::StartPoint {
				group_id: start.0,
				object_id: start.1,
			});
		}
		if is_real_time {
			stream.send_queue.push_back(Message::CachePolicy { is_real_time });
		}
		if use_datagrams {
			stream.is_active_datagram = true;
			self.push_action(TransportAction::DatagramsReady {
				connection,
				ready: true,
			});
		} else {
			stream.send_state = SendState::Streaming;
		}
		self.push_action(TransportAction::StreamActive {
			connection,
			stream_id,
			active: true,
		});
		Ok(())
	}

	/// A peer posts a URL: receive it into a cache-backed source, and on a
	/// relay, propagate the post towards the origin.
	fn accept_post(&mut self, connection: u64, stream_id: u64, url: &[u8], use_datagrams: bool, _now: u64) -> Result<()> {
		tracing::debug!(
			connection,
			stream = stream_id,
			url = %String::from_utf8_lossy(url),
			datagram = use_datagrams,
			"post received"
		);

		if self.find_source_by_url(url).is_some() {
			return Err(Error::Duplicate);
		}
		let source = self.create_source(
			Bytes::copy_from_slice(url),
			SourceKind::Cache,
			self.config.real_time_cache,
		);

		let conn = self.connections.get_mut(&connection).ok_or(Error::NotFound)?;
		let datagram_stream_id = if use_datagrams {
			conn.allocate_datagram_stream_id()
		} else {
			0
		};
		let stream = conn.streams.get_mut(&stream_id).ok_or(Error::NotFound)?;
		stream.source = Some(source);
		stream.is_datagram = use_datagrams;
		stream.datagram_stream_id = datagram_stream_id;
		stream.receive_state = ReceiveState::Fragments;
		stream.send_queue.push_back(Message::Accept { datagram_stream_id });

		self.push_action(TransportAction::StreamActive {
			connection,
			stream_id,
			active: true,
		});

		// Post-propagation: a relay pushes received media further up.
		let propagate = self
			.relay
			.as_ref()
			.map(|relay| !relay.is_origin)
			.unwrap_or(false);
		if propagate {
			let use_datagrams = self.relay.as_ref().map(|r| r.use_datagrams).unwrap_or(use_datagrams);
			let upstream = self.ensure_upstream()?;
			self.post(upstream, source, use_datagrams)?;
		}
		Ok(())
	}

	/// The peer accepted our post; start reading the source onto this stream.
	fn post_accepted(&mut self, connection: u64, stream_id: u64, datagram_stream_id: u64) -> Result<()> {
		let source = self.stream_source(connection, stream_id)?;
		let start = {
			let entry = self.source_mut(source)?;
			entry.attach(ReaderRef {
				connection,
				stream_id,
			});
			entry.cache.first()
		};

		let conn = self.connections.get_mut(&connection).ok_or(Error::NotFound)?;
		let stream = conn.streams.get_mut(&stream_id).ok_or(Error::NotFound)?;
		stream.datagram_stream_id = datagram_stream_id;
		stream.publisher = Some(PublisherState::new(start.0, start.1));
		stream.receive_state = ReceiveState::Done;

		tracing::debug!(connection, stream = stream_id, datagram_stream_id, "post accepted");

		if stream.is_datagram {
			stream.is_active_datagram = true;
			self.push_action(TransportAction::DatagramsReady {
				connection,
				ready: true,
			});
		} else {
			stream.send_state = SendState::Streaming;
			self.push_action(TransportAction::StreamActive {
				connection,
				stream_id,
				active: true,
			});
		}
		Ok(())
	}

	/// The consumer received everything: answer the sender with FIN.
	fn finish_consumer(&mut self, connection: u64, stream_id: u64) {
		if let Some(stream) = self
			.connections
			.get_mut(&connection)
			.and_then(|c| c.streams.get_mut(&stream_id))
		{
			if stream.send_state == SendState::Ready {
				stream.send_state = SendState::Fin;
			}
		}
		self.push_action(TransportAction::StreamActive {
			connection,
			stream_id,
			active: true,
		});
	}

	/// Produce up to `space` bytes for a stream the transport marked active.
	pub fn poll_stream_send(&mut self, connection: u64, stream_id: u64, space: usize, now: u64) -> Result<StreamSend> {
		// Continue or stage a control message first.
		{
			let conn = self.connections.get_mut(&connection).ok_or(Error::NotFound)?;
			let stream = conn.streams.get_mut(&stream_id).ok_or(Error::NotFound)?;

			if stream.sending.is_none() {
				if let Some(message) = stream.send_queue.pop_front() {
					if let Message::FinDatagram { .. } = message {
						stream.is_final_sent = true;
						if !stream.is_datagram {
							stream.fin_after_send = true;
						}
					}
					stream.sending = Some(crate::message::SendBuffer::new(&message));
				}
			}

			if let Some(sending) = stream.sending.as_mut() {
				let data = sending.take(space);
				let done = sending.is_done();
				if done {
					stream.sending = None;
				}
				let fin = done && stream.send_queue.is_empty() && stream.fin_after_send;
				if fin {
					stream.is_local_finished = true;
				}
				return Ok(StreamSend { data, fin });
			}
		}

		// No control message pending: send media or wind down.
		let send_state = self
			.connections
			.get(&connection)
			.and_then(|c| c.streams.get(&stream_id))
			.map(|s| s.send_state)
			.ok_or(Error::NotFound)?;

		match send_state {
			SendState::Streaming => self.poll_stream_media(connection, stream_id, space, now),
			SendState::Fin => {
				let peer_finished = {
					let stream = self
						.connections
						.get_mut(&connection)
						.and_then(|c| c.streams.get_mut(&stream_id))
						.ok_or(Error::NotFound)?;
					stream.send_state = SendState::NoMore;
					stream.is_local_finished = true;
					stream.is_peer_finished
				};
				if peer_finished {
					self.remove_stream(connection, stream_id, now);
				}
				Ok(StreamSend {
					data: Bytes::new(),
					fin: true,
				})
			}
			SendState::Ready | SendState::NoMore => {
				self.push_action(TransportAction::StreamActive {
					connection,
					stream_id,
					active: false,
				});
				Ok(StreamSend::default())
			}
		}
	}

	/// Read the next chunk of media from the cache onto the stream, framed
	/// as a repair message carrying the stream's flat object numbering.
	fn poll_stream_media(&mut self, connection: u64, stream_id: u64, space: usize, now: u64) -> Result<StreamSend> {
		let conn = self.connections.get_mut(&connection).ok_or(Error::NotFound)?;
		let stream = conn.streams.get_mut(&stream_id).ok_or(Error::NotFound)?;
		let source = stream.source.ok_or(Error::Internal)?;
		let cache = match self.sources.get(source.0).and_then(|s| s.as_ref()) {
			Some(entry) => &entry.cache,
			None => return Err(Error::NotFound),
		};
		let publisher = stream.publisher.as_mut().ok_or(Error::Internal)?;

		// Worst-case framing around the chunk: length prefix, tag, cursor
		// varints, and the shifted length.
		let overhead = 2 + 1 + varint_len(stream.next_object_id) + varint_len(stream.next_object_offset) + 9;
		if space <= overhead {
			return Ok(StreamSend::default());
		}

		match publisher.next_stream_chunk(cache, space - overhead) {
			StreamPoll::Finished => {
				let final_object_id = stream.next_object_id;
				tracing::debug!(connection, stream = stream_id, final_object_id, "media finished");
				stream.send_queue.push_back(Message::FinDatagram {
					final_group_id: 0,
					final_object_id,
				});
				stream.send_state = SendState::Ready;
				// Deliver the first piece of the FIN message right away; an
				// empty response would not earn another callback.
				self.poll_stream_send(connection, stream_id, space, now)
			}
			StreamPoll::NotReady => {
				self.actions.push_back(TransportAction::StreamActive {
					connection,
					stream_id,
					active: false,
				});
				Ok(StreamSend::default())
			}
			StreamPoll::Chunk {
				data,
				is_last_fragment,
				..
			} => {
				let length = data.len() as u64;
				let message = Message::Repair {
					object_id: stream.next_object_id,
					offset: stream.next_object_offset,
					is_last_fragment,
					data,
				};
				if is_last_fragment {
					stream.next_object_id += 1;
					stream.next_object_offset = 0;
				} else {
					stream.next_object_offset += length;
				}
				Ok(StreamSend {
					data: message.frame(),
					fin: false,
				})
			}
		}
	}

	// --- datagram events -------------------------------------------------

	/// A datagram arrived; route it to the consumer it belongs to.
	pub fn on_datagram(&mut self, connection: u64, payload: &[u8], now: u64) -> Result<()> {
		let mut buf = payload;
		let header = DatagramHeader::decode(&mut buf)?;
		let data = Bytes::copy_from_slice(buf);

		let conn = self.connections.get(&connection).ok_or(Error::NotFound)?;
		let stream_id = match conn.find_datagram_stream(header.datagram_stream_id, false) {
			Some(stream_id) => stream_id,
			None => {
				if header.datagram_stream_id >= conn.next_abandon_datagram_id {
					tracing::warn!(
						connection,
						datagram_stream_id = header.datagram_stream_id,
						"unexpected datagram"
					);
					return Err(Error::ProtocolViolation);
				}
				// Late datagrams for an abandoned transfer are expected.
				return Ok(());
			}
		};

		let source = self.stream_source(connection, stream_id)?;
		let (added, feed) = match self.source_cache_mut(source) {
			Some(cache) => cache.receive_fragment(&header, data, now),
			None => return Ok(()),
		};
		if added {
			self.wake_readers(source);
		}
		if feed == Feed::Finished {
			self.finish_consumer(connection, stream_id);
		}
		Ok(())
	}

	/// Build the next outgoing datagram within `space` bytes, or None when
	/// every datagram stream is drained.
	pub fn poll_datagram_send(&mut self, connection: u64, space: usize, now: u64) -> Option<Bytes> {
		let conn = self.connections.get_mut(&connection)?;
		let stream_ids: Vec<u64> = conn
			.streams
			.values()
			.filter(|s| s.is_sender && s.is_datagram && s.is_active_datagram)
			.map(|s| s.stream_id)
			.collect();

		for stream_id in stream_ids {
			let conn = match self.connections.get_mut(&connection) {
				Some(conn) => conn,
				None => return None,
			};
			let congestion = &mut conn.congestion;
			let stream = match conn.streams.get_mut(&stream_id) {
				Some(stream) => stream,
				None => continue,
			};
			let cache = match stream
				.source
				.and_then(|source| self.sources.get(source.0))
				.and_then(|slot| slot.as_ref())
			{
				Some(entry) => &entry.cache,
				None => continue,
			};

			// Proactive repeats take priority over fresh data.
			if self.config.extra_repeat {
				if let Some(key) =
					stream
						.ack
						.extra_repeat_due(self.config.extra_repeat_delay, self.config.extra_repeat_count, now)
				{
					if let Some(datagram) = build_extra_repeat(cache, &stream.ack, stream.datagram_stream_id, key) {
						if datagram.len() <= space {
							return Some(datagram);
						}
					}
				}
			}

			let publisher = match stream.publisher.as_mut() {
				Some(publisher) => publisher,
				None => continue,
			};
			match publisher.check_fragment(cache, congestion, now) {
				DatagramCheck::NotReady => {
					if publisher.datagram_finished(cache) && !stream.is_final_sent {
						if let Some((final_group_id, final_object_id)) = cache.final_point() {
							stream.is_final_sent = true;
							stream.is_active_datagram = false;
							stream.send_queue.push_back(Message::FinDatagram {
								final_group_id,
								final_object_id,
							});
							self.actions.push_back(TransportAction::StreamActive {
								connection,
								stream_id,
								active: true,
							});
						}
					}
				}
				DatagramCheck::Ready { should_skip } => {
					match publisher.prepare_datagram(cache, stream.datagram_stream_id, space, should_skip) {
						DatagramSend::Datagram { bytes, sent } => {
							let key = AckKey::new(sent.group_id, sent.object_id, sent.offset);
							match stream.ack.record_sent(key, sent.payload_len, sent.is_last_fragment, now) {
								SendRecord::AlreadyPresent => {
									tracing::trace!(connection, stream = stream_id, ?key, "fragment re-sent");
								}
								SendRecord::Created | SendRecord::BelowHorizon => {}
							}
							return Some(bytes);
						}
						DatagramSend::NoSpace | DatagramSend::NotReady => {}
					}
				}
			}
		}

		None
	}

	/// The transport confirmed a datagram; the payload is the original.
	pub fn on_datagram_acked(&mut self, connection: u64, payload: &[u8], _sent_time: u64) -> Result<()> {
		let (stream_id, header) = match self.sender_for_datagram(connection, payload)? {
			Some(found) => found,
			None => return Ok(()),
		};
		if let Some(stream) = self
			.connections
			.get_mut(&connection)
			.and_then(|c| c.streams.get_mut(&stream_id))
		{
			stream
				.ack
				.handle_ack(AckKey::new(header.group_id, header.object_id, header.offset));
		}
		Ok(())
	}

	/// The transport suspects a datagram was lost; queue repeats.
	pub fn on_datagram_lost(&mut self, connection: u64, payload: &[u8], sent_time: u64, now: u64) -> Result<()> {
		let (stream_id, header) = match self.sender_for_datagram(connection, payload)? {
			Some(found) => found,
			None => return Ok(()),
		};
		let media = &payload[header.len()..];

		let max_datagram = self.config.max_queued_datagram;
		let repeats = match self
			.connections
			.get_mut(&connection)
			.and_then(|c| c.streams.get_mut(&stream_id))
		{
			Some(stream) => stream.ack.handle_lost(&header, media, sent_time, max_datagram, now),
			None => Vec::new(),
		};
		for payload in repeats {
			self.push_action(TransportAction::SendDatagram {
				connection,
				payload,
			});
		}
		Ok(())
	}

	/// A loss report that turned out to be wrong counts as an ack.
	pub fn on_datagram_spurious(&mut self, connection: u64, payload: &[u8], _sent_time: u64) -> Result<()> {
		let (stream_id, header) = match self.sender_for_datagram(connection, payload)? {
			Some(found) => found,
			None => return Ok(()),
		};
		if let Some(stream) = self
			.connections
			.get_mut(&connection)
			.and_then(|c| c.streams.get_mut(&stream_id))
		{
			stream
				.ack
				.handle_spurious(AckKey::new(header.group_id, header.object_id, header.offset));
		}
		Ok(())
	}

	/// The sender stream a datagram callback refers to. The stream may
	/// already be gone; that is not an error.
	fn sender_for_datagram(&self, connection: u64, payload: &[u8]) -> Result<Option<(u64, DatagramHeader)>> {
		let mut buf = payload;
		let header = DatagramHeader::decode(&mut buf)?;
		let found = self
			.connections
			.get(&connection)
			.and_then(|conn| conn.find_datagram_stream(header.datagram_stream_id, true))
			.map(|stream_id| (stream_id, header));
		Ok(found)
	}

	// --- stream teardown -------------------------------------------------

	/// The transport closed a stream (reset, stop-sending, or full close).
	pub fn on_stream_closed(&mut self, connection: u64, stream_id: u64, now: u64) {
		self.remove_stream(connection, stream_id, now);
	}

	fn remove_stream(&mut self, connection: u64, stream_id: u64, now: u64) {
		let removed = match self.connections.get_mut(&connection) {
			Some(conn) => match conn.streams.remove(&stream_id) {
				Some(stream) => {
					// Datagrams still in flight for an abandoned transfer
					// must not count as errors when they trickle in.
					if stream.is_datagram && !stream.is_sender {
						conn.next_abandon_datagram_id =
							conn.next_abandon_datagram_id.max(stream.datagram_stream_id + 1);
					}
					stream
				}
				None => return,
			},
			None => return,
		};
		removed.ack.release(stream_id);

		if let Some(source) = removed.source {
			if removed.is_sender {
				if let Ok(entry) = self.source_mut(source) {
					entry.detach(ReaderRef {
						connection,
						stream_id,
					});
				}
			} else {
				// The feeding stream is gone; close the cache so readers can
				// drain and finish.
				if let Some(cache) = self.source_cache_mut(source) {
					cache.close(now);
				}
				self.wake_readers(source);
			}
		}
	}

	// --- maintenance -----------------------------------------------------

	/// Periodic upkeep: purge caches and reclaim finished sources.
	pub fn on_timer(&mut self, now: u64) {
		let source_ids: Vec<usize> = (0..self.sources.len()).collect();
		for index in source_ids {
			let (is_real_time, next_group) = match self.sources.get(index).and_then(|s| s.as_ref()) {
				Some(entry) => (entry.cache.is_real_time(), entry.cache.next().0),
				None => continue,
			};

			let floor = self.reader_floor(SourceId(index));

			if is_real_time {
				let kept_group = floor.map(|f| f.0).unwrap_or(next_group).min(next_group);
				if let Some(entry) = self.sources.get_mut(index).and_then(|s| s.as_mut()) {
					entry.cache.purge_realtime(kept_group);
				}
			} else if let Some(max_age) = self.config.cache_duration {
				let min_kept_object = floor.map(|f| f.1).unwrap_or(u64::MAX);
				if let Some(entry) = self.sources.get_mut(index).and_then(|s| s.as_mut()) {
					entry.cache.purge_archival(now, max_age, min_kept_object);
				}
			}

			let reclaim = self
				.sources
				.get(index)
				.and_then(|s| s.as_ref())
				.map(|entry| entry.reclaimable(now))
				.unwrap_or(false);
			if reclaim {
				if let Some(entry) = self.sources.get(index).and_then(|s| s.as_ref()) {
					tracing::debug!(url = %String::from_utf8_lossy(&entry.url), "reclaiming source");
				}
				self.sources[index] = None;
			}
		}
	}

	/// The lowest `(group, object)` any attached reader still needs.
	fn reader_floor(&self, source: SourceId) -> Option<(u64, u64)> {
		let entry = self.sources.get(source.0).and_then(|s| s.as_ref())?;
		let mut floor: Option<(u64, u64)> = None;
		for reader in &entry.readers {
			let stream = self
				.connections
				.get(&reader.connection)
				.and_then(|c| c.streams.get(&reader.stream_id));
			if let Some(stream) = stream {
				if let Some(publisher) = stream.publisher.as_ref() {
					if let Some(position) = publisher.purge_floor(stream.is_datagram) {
						floor = Some(match floor {
							Some(current) => current.min(position),
							None => position,
						});
					}
				}
			}
		}
		floor
	}

	// --- sources ---------------------------------------------------------

	pub(crate) fn create_source(&mut self, url: Bytes, kind: SourceKind, real_time: bool) -> SourceId {
		let source = MediaSource::new(url, kind, real_time);
		for (index, slot) in self.sources.iter_mut().enumerate() {
			if slot.is_none() {
				*slot = Some(source);
				return SourceId(index);
			}
		}
		self.sources.push(Some(source));
		SourceId(self.sources.len() - 1)
	}

	pub(crate) fn find_source_by_url(&self, url: &[u8]) -> Option<SourceId> {
		self.sources.iter().enumerate().find_map(|(index, slot)| {
			slot.as_ref()
				.filter(|s| s.kind != SourceKind::Sink && s.url == url)
				.map(|_| SourceId(index))
		})
	}

	pub(crate) fn source_mut(&mut self, source: SourceId) -> Result<&mut MediaSource> {
		self.sources
			.get_mut(source.0)
			.and_then(|s| s.as_mut())
			.ok_or(Error::NotFound)
	}

	fn source_cache_mut(&mut self, source: SourceId) -> Option<&mut FragmentCache> {
		self.sources
			.get_mut(source.0)
			.and_then(|s| s.as_mut())
			.map(|s| &mut s.cache)
	}

	fn stream_source(&self, connection: u64, stream_id: u64) -> Result<SourceId> {
		self.connections
			.get(&connection)
			.and_then(|c| c.streams.get(&stream_id))
			.and_then(|s| s.source)
			.ok_or(Error::NotFound)
	}

	/// New data is available: re-arm every reader attached to the source.
	pub(crate) fn wake_readers(&mut self, source: SourceId) {
		let readers = match self.sources.get(source.0).and_then(|s| s.as_ref()) {
			Some(entry) => entry.readers.clone(),
			None => return,
		};

		for reader in readers {
			let conn = match self.connections.get_mut(&reader.connection) {
				Some(conn) => conn,
				None => continue,
			};
			let stream = match conn.streams.get_mut(&reader.stream_id) {
				Some(stream) => stream,
				None => continue,
			};

			if stream.is_datagram {
				stream.is_active_datagram = true;
				self.actions.push_back(TransportAction::DatagramsReady {
					connection: reader.connection,
					ready: true,
				});
			} else {
				self.actions.push_back(TransportAction::StreamActive {
					connection: reader.connection,
					stream_id: reader.stream_id,
					active: true,
				});
			}
		}
	}

	/// The start of a source moved: trim the cache, snap local cursors, and
	/// relay the new start to every attached reader stream.
	pub(crate) fn source_learn_start(&mut self, source: SourceId, group_id: u64, object_id: u64) {
		let readers = match self.sources.get_mut(source.0).and_then(|s| s.as_mut()) {
			Some(entry) => {
				entry.cache.learn_start(group_id, object_id);
				entry.skip_delivery_to(group_id, object_id);
				entry.readers.clone()
			}
			None => return,
		};

		for reader in readers {
			let stream = match self
				.connections
				.get_mut(&reader.connection)
				.and_then(|c| c.streams.get_mut(&reader.stream_id))
			{
				Some(stream) => stream,
				None => continue,
			};
			if let Some(publisher) = stream.publisher.as_mut() {
				publisher.start_group_id = group_id;
				publisher.start_object_id = object_id;
				if (publisher.current_group_id, publisher.current_object_id) < (group_id, object_id) {
					publisher.current_group_id = group_id;
					publisher.current_object_id = object_id;
					publisher.current_offset = 0;
				}
			}
			if stream.is_datagram {
				stream.send_queue.push_back(Message::StartPoint { group_id, object_id });
			}
			self.actions.push_back(TransportAction::StreamActive {
				connection: reader.connection,
				stream_id: reader.stream_id,
				active: true,
			});
		}
	}

	/// The eviction policy of a source changed: apply and relay downstream.
	pub(crate) fn source_learn_policy(&mut self, source: SourceId, is_real_time: bool) {
		let readers = match self.sources.get_mut(source.0).and_then(|s| s.as_mut()) {
			Some(entry) => {
				entry.cache.is_real_time = is_real_time;
				entry.readers.clone()
			}
			None => return,
		};

		for reader in readers {
			let stream = match self
				.connections
				.get_mut(&reader.connection)
				.and_then(|c| c.streams.get_mut(&reader.stream_id))
			{
				Some(stream) => stream,
				None => continue,
			};
			stream.send_queue.push_back(Message::CachePolicy { is_real_time });
			self.actions.push_back(TransportAction::StreamActive {
				connection: reader.connection,
				stream_id: reader.stream_id,
				active: true,
			});
		}
	}
}

/// Where a new reader starts, given what the cache still holds.
fn resolve_intent(cache: &FragmentCache, intent: SubscribeIntent) -> (u64, u64) {
	let (first_group, first_object) = cache.first();
	let (next_group, _, _) = cache.next();

	match intent {
		SubscribeIntent::CurrentGroup => {
			// Serve from the start of the group in progress when the cache
			// still holds it; otherwise wait for the next boundary.
			let have_group_start = first_group < next_group || (first_group == next_group && first_object == 0);
			if have_group_start {
				(next_group, 0)
			} else {
				(next_group + 1, 0)
			}
		}
		SubscribeIntent::NextGroup => (next_group + 1, 0),
		SubscribeIntent::StartPoint { group_id, object_id } => {
			(group_id, object_id).max((first_group, first_object))
		}
	}
}

/// Rebuild a datagram for a proactive repeat from the cached bytes.
fn build_extra_repeat(
	cache: &FragmentCache,
	ack: &crate::ack::AckTracker,
	datagram_stream_id: u64,
	key: AckKey,
) -> Option<Bytes> {
	let record = ack.record(key)?;
	let object = cache.assemble(key.group_id, key.object_id);
	let start = key.offset as usize;
	let end = start + record.length;
	if object.len() < end {
		return None;
	}

	let first = cache.get(key.group_id, key.object_id, 0);
	let header = DatagramHeader {
		datagram_stream_id,
		group_id: key.group_id,
		object_id: key.object_id,
		offset: key.offset,
		queue_delay: first.map(|f| f.queue_delay).unwrap_or(0),
		flags: first.map(|f| f.flags).unwrap_or(0),
		nb_objects_previous_group: if key.offset == 0 {
			first.map(|f| f.nb_objects_previous_group).unwrap_or(0)
		} else {
			0
		},
		is_last_fragment: record.is_last_fragment,
	};
	Some(header.with_payload(&object[start..end]))
}
