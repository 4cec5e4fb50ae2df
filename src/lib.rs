//! # quicrq: real-time media distribution over a QUIC-style transport
//!
//! A publisher sends a sequence of timestamped objects, organized into
//! groups and identified by a URL; subscribers receive that sequence with
//! freshness-appropriate reliability. Relay nodes cache objects so that
//! additional subscribers pull from the nearest cache; an origin is a relay
//! with no upstream.
//!
//! The heart of the crate is the per-URL [FragmentCache] and the publisher
//! state machine reading it:
//! - **stream mode** delivers reliably and in order;
//! - **datagram mode** delivers in arrival order, skipping droppable
//!   objects under congestion and repeating lost fragments.
//!
//! The transport substrate (connections, streams, datagrams, acks, pacing)
//! stays outside: a [Context] is sans-io, fed with transport events and
//! polled for bytes and [TransportAction]s by the embedding run-loop.

mod ack;
mod cache;
mod coding;
mod config;
mod congestion;
mod connection;
mod consumer;
mod context;
mod datagram;
mod error;
mod message;
mod publish;
mod relay;
mod source;

pub use cache::{CachedFragment, FragmentCache, FragmentKey};
pub use config::*;
pub use congestion::CongestionController;
pub use consumer::Feed;
pub use context::*;
pub use datagram::DatagramHeader;
pub use error::*;
pub use message::{Message, SubscribeIntent};
pub use source::{MediaObject, SourceId};

// Re-export the bytes crate.
pub use bytes;
