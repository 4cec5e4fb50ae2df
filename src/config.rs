//! Recognized options for a [crate::Context].

use std::path::PathBuf;

/// The ALPN token of this protocol.
pub const ALPN: &str = "quicr-h00";

/// The default port, as registered for the experiment.
pub const PORT: u16 = 853;

/// Context-wide configuration.
///
/// The TLS material is recorded verbatim and handed to the transport; the
/// core never reads it.
#[derive(Clone, Debug)]
pub struct Config {
	pub alpn: String,
	pub cert_file: Option<PathBuf>,
	pub key_file: Option<PathBuf>,
	pub cert_root_store: Option<PathBuf>,
	pub ticket_encryption_key: Option<Vec<u8>>,

	/// Monotonic clock override for tests, handed to the transport.
	pub simulated_time: Option<u64>,

	/// Age after which archival caches purge complete objects, in µs.
	pub cache_duration: Option<u64>,

	/// Newly published sources default to real-time eviction.
	pub real_time_cache: bool,

	/// Skip droppable objects when a reader falls behind.
	pub congestion_control: bool,

	/// Proactively retransmit unacknowledged datagrams.
	pub extra_repeat: bool,
	pub extra_repeat_count: u32,
	/// How long a datagram stays unacknowledged before an extra repeat, in µs.
	pub extra_repeat_delay: u64,

	/// The transport's maximum queued-datagram size; repeats above it split.
	pub max_queued_datagram: usize,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			alpn: ALPN.to_string(),
			cert_file: None,
			key_file: None,
			cert_root_store: None,
			ticket_encryption_key: None,
			simulated_time: None,
			cache_duration: None,
			real_time_cache: false,
			congestion_control: false,
			extra_repeat: false,
			extra_repeat_count: 2,
			extra_repeat_delay: 50_000,
			max_queued_datagram: 1280,
		}
	}
}

impl Config {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_cache_duration(mut self, micros: u64) -> Self {
		self.cache_duration = Some(micros);
		self
	}

	pub fn set_real_time_cache(mut self) -> Self {
		self.real_time_cache = true;
		self
	}

	pub fn enable_congestion_control(mut self, enabled: bool) -> Self {
		self.congestion_control = enabled;
		self
	}

	pub fn set_extra_repeat(mut self, enabled: bool, count: u32) -> Self {
		self.extra_repeat = enabled;
		self.extra_repeat_count = count;
		self
	}

	pub fn set_extra_repeat_delay(mut self, micros: u64) -> Self {
		self.extra_repeat_delay = micros;
		self
	}
}
