//! Relay and origin roles.
//!
//! A relay acts as a client towards its upstream and as a server towards its
//! own subscribers. The first subscribe for an unknown URL creates the
//! cache-backed source and an upstream subscription feeding it; posts are
//! propagated towards the origin the same way. An origin is a relay with no
//! upstream: unknown URLs get an empty cache that a later post fills.

use bytes::Bytes;

use crate::context::{Context, TransportAction};
use crate::error::{Error, Result};
use crate::message::SubscribeIntent;
use crate::source::{SourceId, SourceKind};

/// The role descriptor of a relay or origin node.
#[derive(Debug)]
pub(crate) struct RelayState {
	pub sni: String,
	pub use_datagrams: bool,
	pub is_origin: bool,
	/// The connection towards the upstream node, opened on demand.
	pub upstream: Option<u64>,
}

impl Context {
	/// Act as an origin: serve every URL from a local cache, with no
	/// upstream to forward to.
	pub fn enable_origin(&mut self, use_datagrams: bool) {
		self.relay = Some(RelayState {
			sni: String::new(),
			use_datagrams,
			is_origin: true,
			upstream: None,
		});
	}

	/// Act as a relay, forwarding towards the named upstream.
	pub fn enable_relay(&mut self, sni: &str, use_datagrams: bool) {
		self.relay = Some(RelayState {
			sni: sni.to_string(),
			use_datagrams,
			is_origin: false,
			upstream: None,
		});
	}

	/// A subscribe arrived for a URL with no source. On an origin, create
	/// the cache a future post will fill; on a relay, create it and start
	/// fetching upstream.
	pub(crate) fn default_source(&mut self, url: &[u8]) -> Option<SourceId> {
		let (is_origin, use_datagrams) = match self.relay.as_ref() {
			Some(relay) => (relay.is_origin, relay.use_datagrams),
			None => return None,
		};

		let real_time = self.config().real_time_cache;
		let source = self.create_source(Bytes::copy_from_slice(url), SourceKind::Cache, real_time);

		if !is_origin {
			let fetched = match self.ensure_upstream() {
				Ok(upstream) => {
					self.subscribe_into(upstream, url, use_datagrams, SubscribeIntent::CurrentGroup, source)
				}
				Err(err) => Err(err),
			};
			if let Err(err) = fetched {
				tracing::warn!(%err, url = %String::from_utf8_lossy(url), "upstream subscribe failed");
			}
		}

		Some(source)
	}

	/// The relay's connection towards its upstream, created on demand. The
	/// transport opens it when it drains [TransportAction::Connect].
	pub(crate) fn ensure_upstream(&mut self) -> Result<u64> {
		let relay = self.relay.as_ref().ok_or(Error::NotFound)?;
		if relay.is_origin {
			return Err(Error::NotFound);
		}
		if let Some(upstream) = relay.upstream {
			return Ok(upstream);
		}

		let sni = relay.sni.clone();
		let connection = self.connection_pending();
		if let Some(relay) = self.relay.as_mut() {
			relay.upstream = Some(connection);
		}
		tracing::debug!(connection, sni = %sni, "connecting upstream");
		self.push_action(TransportAction::Connect { connection, sni });
		Ok(connection)
	}
}
