//! A deterministic simulated network for driving QUICR contexts end to end:
//! reliable ordered streams, lossy rate-limited datagrams with ack and loss
//! callbacks, and a microsecond clock.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use quicrq::bytes::Bytes;
use quicrq::{Context, TransportAction};

/// One-way latency of every link.
pub const LATENCY: u64 = 10_000;

/// Cadence of the maintenance timer.
const TICK: u64 = 100_000;

const STREAM_BUDGET: usize = 1024;
const DATAGRAM_BUDGET: usize = 1280;

#[derive(Clone, Copy, Debug, Default)]
pub struct LinkOptions {
	/// Rotating 64-bit loss mask for datagrams flowing server to client.
	pub down_loss_mask: u64,
	/// Rate limit for datagrams flowing server to client, bits per second.
	pub down_rate_bps: Option<u64>,
}

#[derive(Debug)]
struct DirState {
	active_streams: BTreeSet<u64>,
	datagrams_ready: bool,
	loss_mask: u64,
	rate_bps: Option<u64>,
	busy_until: u64,
}

impl DirState {
	fn new(loss_mask: u64, rate_bps: Option<u64>) -> Self {
		Self {
			active_streams: BTreeSet::new(),
			datagrams_ready: false,
			loss_mask,
			rate_bps,
			busy_until: 0,
		}
	}
}

#[derive(Debug)]
struct Link {
	/// `ends[0]` is the client side; `dirs[i]` governs traffic sent by `ends[i]`.
	ends: [(usize, u64); 2],
	dirs: [DirState; 2],
	alive: bool,
}

#[derive(Debug)]
enum EventKind {
	StreamData { stream_id: u64, data: Bytes, fin: bool },
	Datagram { payload: Bytes },
	Ack { payload: Bytes, sent_time: u64 },
	Lost { payload: Bytes, sent_time: u64 },
	/// Re-run the send pumps, e.g. when a rate limiter frees up.
	Wake,
}

#[derive(Debug)]
struct Event {
	due: u64,
	seq: u64,
	link: usize,
	/// The sending side of the link.
	dir: usize,
	kind: EventKind,
}

impl PartialEq for Event {
	fn eq(&self, other: &Self) -> bool {
		(self.due, self.seq) == (other.due, other.seq)
	}
}
impl Eq for Event {}
impl PartialOrd for Event {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}
impl Ord for Event {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		(self.due, self.seq).cmp(&(other.due, other.seq))
	}
}

pub struct SimNet {
	pub nodes: Vec<Context>,
	pub time: u64,
	links: Vec<Link>,
	endpoints: BTreeMap<(usize, u64), (usize, usize)>,
	upstreams: BTreeMap<usize, usize>,
	events: BinaryHeap<Reverse<Event>>,
	seq: u64,
	next_timer: u64,
}

impl SimNet {
	pub fn new(nodes: Vec<Context>) -> Self {
		Self {
			nodes,
			time: 0,
			links: Vec::new(),
			endpoints: BTreeMap::new(),
			upstreams: BTreeMap::new(),
			events: BinaryHeap::new(),
			seq: 0,
			next_timer: TICK,
		}
	}

	/// Which node a relay's `Connect` action reaches.
	pub fn set_upstream(&mut self, node: usize, target: usize) {
		self.upstreams.insert(node, target);
	}

	pub fn connect(&mut self, client: usize, server: usize) -> (u64, u64) {
		self.connect_with(client, server, LinkOptions::default())
	}

	pub fn connect_with(&mut self, client: usize, server: usize, options: LinkOptions) -> (u64, u64) {
		let client_conn = self.nodes[client].connection_created(false);
		let server_conn = self.nodes[server].connection_created(true);
		self.add_link(client, client_conn, server, server_conn, options);
		(client_conn, server_conn)
	}

	fn add_link(&mut self, client: usize, client_conn: u64, server: usize, server_conn: u64, options: LinkOptions) {
		let index = self.links.len();
		self.links.push(Link {
			ends: [(client, client_conn), (server, server_conn)],
			dirs: [
				DirState::new(0, None),
				DirState::new(options.down_loss_mask, options.down_rate_bps),
			],
			alive: true,
		});
		self.endpoints.insert((client, client_conn), (index, 0));
		self.endpoints.insert((server, server_conn), (index, 1));
	}

	/// Tear a connection down, delivering the close to both ends.
	pub fn disconnect(&mut self, node: usize, connection: u64) {
		let (index, _) = match self.endpoints.get(&(node, connection)) {
			Some(&found) => found,
			None => return,
		};
		let ends = self.links[index].ends;
		self.links[index].alive = false;
		for (end_node, end_conn) in ends {
			self.endpoints.remove(&(end_node, end_conn));
			let now = self.time;
			self.nodes[end_node].on_connection_closed(end_conn, now);
		}
	}

	/// Run the simulation forward to the given time.
	pub fn run_until(&mut self, deadline: u64) {
		loop {
			self.settle();

			let next_event = self.events.peek().map(|Reverse(event)| event.due);
			let next = match next_event {
				Some(due) => due.min(self.next_timer),
				None => self.next_timer,
			};
			if next > deadline {
				self.time = deadline;
				return;
			}
			self.time = next;

			if self.time >= self.next_timer {
				for node in &mut self.nodes {
					node.on_timer(next);
				}
				self.next_timer += TICK;
			}

			while let Some(Reverse(event)) = self.events.peek() {
				if event.due > self.time {
					break;
				}
				let Reverse(event) = self.events.pop().unwrap();
				self.deliver(event);
			}
		}
	}

	/// Drain actions and pump sends until nothing changes.
	fn settle(&mut self) {
		for _ in 0..16 {
			let mut progressed = false;
			for node in 0..self.nodes.len() {
				progressed |= self.drain_actions(node);
				progressed |= self.pump_node(node);
			}
			if !progressed {
				break;
			}
		}
	}

	fn drain_actions(&mut self, node: usize) -> bool {
		let mut progressed = false;
		while let Some(action) = self.nodes[node].poll_action() {
			progressed = true;
			match action {
				TransportAction::StreamActive {
					connection,
					stream_id,
					active,
				} => {
					if let Some(&(link, dir)) = self.endpoints.get(&(node, connection)) {
						if active {
							self.links[link].dirs[dir].active_streams.insert(stream_id);
						} else {
							self.links[link].dirs[dir].active_streams.remove(&stream_id);
						}
					}
				}
				TransportAction::DatagramsReady { connection, ready } => {
					if let Some(&(link, dir)) = self.endpoints.get(&(node, connection)) {
						self.links[link].dirs[dir].datagrams_ready = ready;
					}
				}
				TransportAction::SendDatagram { connection, payload } => {
					if let Some(&(link, dir)) = self.endpoints.get(&(node, connection)) {
						let now = self.time;
						self.transmit_datagram(link, dir, payload, now);
					}
				}
				TransportAction::Connect { connection, .. } => {
					let target = *self
						.upstreams
						.get(&node)
						.expect("no upstream configured for Connect");
					let server_conn = self.nodes[target].connection_created(true);
					self.add_link(node, connection, target, server_conn, LinkOptions::default());
				}
				TransportAction::ResetStream {
					connection,
					stream_id,
					..
				} => {
					if let Some(&(link, dir)) = self.endpoints.get(&(node, connection)) {
						let (peer_node, peer_conn) = self.links[link].ends[1 - dir];
						let now = self.time;
						self.nodes[node].on_stream_closed(connection, stream_id, now);
						self.nodes[peer_node].on_stream_closed(peer_conn, stream_id, now);
					}
				}
			}
		}
		progressed
	}

	fn pump_node(&mut self, node: usize) -> bool {
		let now = self.time;
		let mut progressed = false;

		for link in 0..self.links.len() {
			if !self.links[link].alive {
				continue;
			}
			for dir in 0..2 {
				if self.links[link].ends[dir].0 != node {
					continue;
				}
				let connection = self.links[link].ends[dir].1;

				let streams: Vec<u64> = self.links[link].dirs[dir].active_streams.iter().copied().collect();
				for stream_id in streams {
					for _ in 0..256 {
						match self.nodes[node].poll_stream_send(connection, stream_id, STREAM_BUDGET, now) {
							Ok(send) => {
								if send.data.is_empty() && !send.fin {
									break;
								}
								progressed = true;
								let fin = send.fin;
								self.schedule(
									link,
									dir,
									now + LATENCY,
									EventKind::StreamData {
										stream_id,
										data: send.data,
										fin,
									},
								);
								if fin {
									self.links[link].dirs[dir].active_streams.remove(&stream_id);
									break;
								}
							}
							Err(_) => {
								self.links[link].dirs[dir].active_streams.remove(&stream_id);
								break;
							}
						}
					}
				}

				if self.links[link].dirs[dir].datagrams_ready {
					loop {
						let busy_until = self.links[link].dirs[dir].busy_until;
						if busy_until > now {
							self.schedule(link, dir, busy_until, EventKind::Wake);
							break;
						}
						match self.nodes[node].poll_datagram_send(connection, DATAGRAM_BUDGET, now) {
							Some(payload) => {
								progressed = true;
								self.transmit_datagram(link, dir, payload, now);
							}
							None => break,
						}
					}
				}
			}
		}

		progressed
	}

	/// Put a datagram on the wire: consume link capacity, roll the loss
	/// mask, and schedule delivery plus the matching ack or loss callback.
	fn transmit_datagram(&mut self, link: usize, dir: usize, payload: Bytes, now: u64) {
		let state = &mut self.links[link].dirs[dir];
		let lost = state.loss_mask & 1 == 1;
		state.loss_mask = state.loss_mask.rotate_right(1);

		if let Some(rate) = state.rate_bps {
			let duration = payload.len() as u64 * 8 * 1_000_000 / rate;
			state.busy_until = state.busy_until.max(now) + duration;
		}

		if lost {
			self.schedule(
				link,
				dir,
				now + 3 * LATENCY,
				EventKind::Lost {
					payload,
					sent_time: now,
				},
			);
		} else {
			self.schedule(
				link,
				dir,
				now + LATENCY,
				EventKind::Datagram {
					payload: payload.clone(),
				},
			);
			self.schedule(
				link,
				dir,
				now + 2 * LATENCY,
				EventKind::Ack {
					payload,
					sent_time: now,
				},
			);
		}
	}

	fn schedule(&mut self, link: usize, dir: usize, due: u64, kind: EventKind) {
		let seq = self.seq;
		self.seq += 1;
		self.events.push(Reverse(Event {
			due,
			seq,
			link,
			dir,
			kind,
		}));
	}

	fn deliver(&mut self, event: Event) {
		if !self.links[event.link].alive {
			return;
		}
		let now = self.time;
		let (sender_node, sender_conn) = self.links[event.link].ends[event.dir];
		let (receiver_node, receiver_conn) = self.links[event.link].ends[1 - event.dir];

		match event.kind {
			EventKind::StreamData { stream_id, data, fin } => {
				self.nodes[receiver_node]
					.on_stream_data(receiver_conn, stream_id, &data, fin, now)
					.unwrap_or_else(|err| panic!("stream data rejected: {err}"));
			}
			EventKind::Datagram { payload } => {
				if let Err(err) = self.nodes[receiver_node].on_datagram(receiver_conn, &payload, now) {
					// Late datagrams for a finished transfer are tolerated.
					eprintln!("datagram dropped by receiver: {err}");
				}
			}
			EventKind::Ack { payload, sent_time } => {
				let _ = self.nodes[sender_node].on_datagram_acked(sender_conn, &payload, sent_time);
			}
			EventKind::Lost { payload, sent_time } => {
				let _ = self.nodes[sender_node].on_datagram_lost(sender_conn, &payload, sent_time, now);
			}
			EventKind::Wake => {}
		}
	}
}
