//! Selective-Repeat receiver: in-order delivery, out-of-order buffering,
//! per-packet ACK with an advertised flow-control window, and the
//! skip-after-threshold policy for stalled holes.

use crate::callbacks::{invoke_callback, Clock, ReceiverCallbacks};
use crate::config::HudpConfig;
use crate::seq::{in_window, precedes};
use bytes::Bytes;
use log::{debug, trace, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct ReceiverState {
    expected: u16,
    buffer: BTreeMap<u16, (Bytes, u64)>,
    hole_since_ms: Option<u64>,
}

/// Selective-Repeat receiver for the reliable channel. One instance per peer.
pub struct SrReceiver {
    cfg: HudpConfig,
    clock: Arc<dyn Clock>,
    callbacks: ReceiverCallbacks,
    state: Mutex<ReceiverState>,
    running: AtomicBool,
    stopped: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SrReceiver {
    pub fn new(cfg: HudpConfig, clock: Arc<dyn Clock>, callbacks: ReceiverCallbacks) -> Self {
        Self {
            state: Mutex::new(ReceiverState {
                expected: 0,
                buffer: BTreeMap::new(),
                hole_since_ms: None,
            }),
            cfg,
            clock,
            callbacks,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    /// Starts the skip-timer worker. A no-op if `skip_threshold_ms == 0`.
    /// Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stopped.store(false, Ordering::SeqCst);
        if self.cfg.skip_threshold_ms == 0 {
            return;
        }
        let mut worker = self.worker.lock().unwrap();
        let self_clone = Arc::clone(self);
        *worker = Some(
            thread::Builder::new()
                .name("hudp-receiver-skip".into())
                .spawn(move || self_clone.run_skip_timer())
                .expect("failed to spawn skip-timer thread"),
        );
    }

    /// Stops the skip-timer worker and joins it. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Processes one reliable-data arrival. Always emits an ACK — even for
    /// duplicates, old, or out-of-band sequences — so a lost ACK never
    /// stalls the sender.
    pub fn on_data(&self, seq: u16, payload: Bytes) {
        let mut state = self.state.lock().unwrap();
        let now = self.clock.now_ms();
        let window_size = self.cfg.window_size;

        let mut delivered = Vec::new();

        if in_window(seq, state.expected, window_size) {
            if seq == state.expected {
                delivered.push((seq, payload));
                state.expected = state.expected.wrapping_add(1);
                while let Some((buffered_payload, _)) = state.buffer.remove(&state.expected) {
                    delivered.push((state.expected, buffered_payload));
                    state.expected = state.expected.wrapping_add(1);
                }
                // A further hole may still be stuck behind whatever was just
                // drained (e.g. expected advanced past a delivered run but
                // buffer still holds later, non-contiguous sequences) — only
                // clear the timer when there's truly nothing left buffered.
                state.hole_since_ms = if state.buffer.is_empty() { None } else { Some(now) };
                debug_assert!(
                    delivered.windows(2).all(|w| precedes(w[0].0, w[1].0)),
                    "drained run must deliver in strictly increasing sequence order"
                );
            } else if !state.buffer.contains_key(&seq) {
                if state.buffer.len() < self.cfg.receiver_max_buffer {
                    state.buffer.insert(seq, (payload, now));
                    if state.hole_since_ms.is_none() {
                        state.hole_since_ms = Some(now);
                    }
                } else {
                    warn!(
                        "receiver buffer full ({}), dropping seq {}",
                        self.cfg.receiver_max_buffer, seq
                    );
                }
            }
            // else: duplicate of an already-buffered sequence, no-op.
        } else if in_window(seq, state.expected.wrapping_sub(window_size), window_size) {
            trace!(
                "old/duplicate seq {} behind expected {}, re-acking only",
                seq, state.expected
            );
        } else {
            trace!(
                "out-of-band seq {} (expected {}), discarding",
                seq, state.expected
            );
        }

        let recv_window = (self.cfg.receiver_max_buffer - state.buffer.len()) as u16;
        drop(state);

        for (dseq, dpayload) in delivered {
            invoke_callback("deliver_in_order", || {
                (self.callbacks.deliver_in_order)(dseq, dpayload)
            });
        }
        invoke_callback("send_ack", || (self.callbacks.send_ack)(seq, recv_window));
    }

    /// Skip-timer tick: if the current hole has outlived `skip_threshold_ms`,
    /// declares `expected` permanently lost, advances past it, and drains
    /// whatever that unblocks. Exposed directly so tests can drive it
    /// without waiting on the background worker's real-time sleep.
    pub fn tick(&self) {
        if self.cfg.skip_threshold_ms == 0 {
            return;
        }
        let now = self.clock.now_ms();
        let mut state = self.state.lock().unwrap();

        let Some(hole_since) = state.hole_since_ms else {
            return;
        };
        if now.saturating_sub(hole_since) < self.cfg.skip_threshold_ms {
            return;
        }

        debug!(
            "skip threshold exceeded, declaring seq {} permanently lost",
            state.expected
        );
        state.expected = state.expected.wrapping_add(1);

        let mut delivered = Vec::new();
        while let Some((payload, _)) = state.buffer.remove(&state.expected) {
            delivered.push((state.expected, payload));
            state.expected = state.expected.wrapping_add(1);
        }

        state.hole_since_ms = if state.buffer.is_empty() { None } else { Some(now) };
        debug_assert!(
            delivered.windows(2).all(|w| precedes(w[0].0, w[1].0)),
            "skip-unblocked run must deliver in strictly increasing sequence order"
        );

        drop(state);
        for (seq, payload) in delivered {
            invoke_callback("deliver_in_order", || {
                (self.callbacks.deliver_in_order)(seq, payload)
            });
        }
    }

    fn run_skip_timer(self: Arc<Self>) {
        let tick_ms = (self.cfg.skip_threshold_ms / 4).max(10);
        while !self.stopped.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(tick_ms));
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            self.tick();
        }
    }

    pub fn expected(&self) -> u16 {
        self.state.lock().unwrap().expected
    }

    pub fn buffer_len(&self) -> usize {
        self.state.lock().unwrap().buffer.len()
    }
}
