//! H-UDP: a hybrid reliability transport over a single datagram socket.
//!
//! Two channels share one peer: an **unreliable** channel with no
//! ordering or delivery guarantees, and a **reliable** channel built on a
//! Selective-Repeat ARQ engine ([`sender`]/[`receiver`]) with adaptive
//! RTO, fast retransmit, congestion control, pacing, and a bounded
//! skip-after-threshold policy for stalled holes. [`mux::Channel`] is the
//! thin shell that owns the socket and demultiplexes by the leading tag
//! byte; see [`wire`] for the on-the-wire layout.

pub mod callbacks;
pub mod config;
pub mod error;
pub mod mux;
pub mod receiver;
pub mod sender;
pub mod seq;
pub mod wire;

pub use callbacks::{Clock, FakeClock, SystemClock};
pub use config::{ConfigError, HudpConfig};
pub use error::HudpError;
pub use mux::Channel;
