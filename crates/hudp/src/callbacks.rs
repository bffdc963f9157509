//! Host-supplied seams. The core never touches a socket or a wall clock
//! directly; it calls out through these instead, always outside its own
//! locks.

use bytes::Bytes;
use log::error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Invokes a host-supplied callback with its panics caught at the boundary,
/// per spec.md §7's `CallbackFailure` policy: isolated, logged, and never
/// allowed to unwind into the engine's own control flow or poison its locks.
/// Callers must invoke this with the relevant mutex already released.
pub fn invoke_callback<F: FnOnce()>(name: &str, f: F) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("host callback '{}' panicked; isolated, protocol state unaffected", name);
    }
}

/// Millisecond wall-clock source, injectable so tests can control time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Real monotonic-since-construction clock, in milliseconds.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// A manually-advanced clock for deterministic tests.
pub struct FakeClock {
    ms: AtomicU64,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            ms: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.ms.store(ms, Ordering::SeqCst);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.ms.load(Ordering::SeqCst)
    }
}

/// Callback seams exposed by the SR sender.
pub struct SenderCallbacks {
    /// `(seq, payload)`: host wraps with a header (current timestamp) and
    /// writes to the socket. Called on first send and on every retransmit.
    pub send_raw: Box<dyn Fn(u16, Bytes) + Send + Sync>,
    /// `(seq)`: a sequence was permanently dropped after `max_retries`.
    pub on_drop: Box<dyn Fn(u16) + Send + Sync>,
    /// `(seq, rtt_ms)`: observability only, never drives protocol state.
    pub on_rtt: Box<dyn Fn(u16, u64) + Send + Sync>,
}

/// Callback seams exposed by the SR receiver.
pub struct ReceiverCallbacks {
    /// `(seq, payload)`: hand a reliably-delivered, in-order payload to the
    /// application.
    pub deliver_in_order: Box<dyn Fn(u16, Bytes) + Send + Sync>,
    /// `(ack_seq, recv_window)`: host packs an ACK and writes to the socket.
    /// Called on every `on_data`, including for duplicates.
    pub send_ack: Box<dyn Fn(u16, u16) + Send + Sync>,
}
