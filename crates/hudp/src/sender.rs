//! Selective-Repeat sender: window control, per-packet timers, RTO
//! estimation, fast retransmit, congestion window, and a pacer.

use crate::callbacks::{invoke_callback, Clock, SenderCallbacks};
use crate::config::HudpConfig;
use crate::error::HudpError;
use bytes::Bytes;
use log::{debug, trace, warn};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const RTT_ALPHA: f64 = 0.125;
const RTT_BETA: f64 = 0.25;

struct InFlightEntry {
    payload: Bytes,
    first_send_ms: u64,
    last_send_ms: u64,
    retries: u32,
    retransmitted: bool,
}

struct EmitJob {
    seq: u16,
    payload: Bytes,
}

struct SenderState {
    base: u16,
    next_seq: u16,
    in_flight: BTreeMap<u16, InFlightEntry>,
    emit_queue: VecDeque<EmitJob>,
    srtt_ms: Option<f64>,
    rttvar_ms: Option<f64>,
    rto_ms: u64,
    cwnd: f64,
    ssthresh: f64,
    dupack_count: u32,
    peer_rwnd: u16,
}

/// Selective-Repeat sender for the reliable channel. One instance per peer.
pub struct SrSender {
    cfg: HudpConfig,
    clock: Arc<dyn Clock>,
    callbacks: SenderCallbacks,
    state: Mutex<SenderState>,
    cv: Condvar,
    running: AtomicBool,
    stopped: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SrSender {
    pub fn new(cfg: HudpConfig, clock: Arc<dyn Clock>, callbacks: SenderCallbacks) -> Self {
        let initial_cwnd = cfg.initial_cwnd;
        let peer_rwnd = cfg.window_size;
        let rto_ms = cfg.initial_rto_ms;
        Self {
            state: Mutex::new(SenderState {
                base: 0,
                next_seq: 0,
                in_flight: BTreeMap::new(),
                emit_queue: VecDeque::new(),
                srtt_ms: None,
                rttvar_ms: None,
                rto_ms,
                cwnd: initial_cwnd,
                ssthresh: f64::MAX,
                dupack_count: 0,
                peer_rwnd,
            }),
            cv: Condvar::new(),
            cfg,
            clock,
            callbacks,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    fn effective_window(state: &SenderState, cfg: &HudpConfig) -> usize {
        let cfg_w = cfg.window_size as usize;
        let peer_w = state.peer_rwnd as usize;
        let cwnd_w = state.cwnd.floor().max(0.0) as usize;
        cfg_w.min(peer_w).min(cwnd_w)
    }

    /// Starts the timer and pacer workers. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stopped.store(false, Ordering::SeqCst);
        let mut workers = self.workers.lock().unwrap();

        let timer_self = Arc::clone(self);
        workers.push(
            thread::Builder::new()
                .name("hudp-sender-timer".into())
                .spawn(move || timer_self.run_timer())
                .expect("failed to spawn sender timer thread"),
        );

        let pacer_self = Arc::clone(self);
        workers.push(
            thread::Builder::new()
                .name("hudp-sender-pacer".into())
                .spawn(move || pacer_self.run_pacer())
                .expect("failed to spawn sender pacer thread"),
        );
    }

    /// Stops both workers and joins them. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.cv.notify_all();
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// Assigns a sequence, enqueues the payload for emission, and returns
    /// the assigned sequence. Blocks up to `send_block_timeout_ms` while the
    /// effective window is full; returns promptly once `stop()` has been
    /// called instead of waiting out the rest of the timeout.
    pub fn send(&self, payload: Bytes) -> Result<u16, HudpError> {
        let mut state = self.state.lock().unwrap();
        let timeout = Duration::from_millis(self.cfg.send_block_timeout_ms);
        let start = Instant::now();

        loop {
            let eff = Self::effective_window(&state, &self.cfg);
            if state.in_flight.len() < eff {
                break;
            }
            if self.stopped.load(Ordering::SeqCst) {
                return Err(HudpError::WouldBlock);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(HudpError::WouldBlock);
            }
            let (guard, result) = self.cv.wait_timeout(state, timeout - elapsed).unwrap();
            state = guard;
            if result.timed_out() && Self::effective_window(&state, &self.cfg) == 0 {
                // still exhausted, loop will re-check elapsed and bail if due
            }
        }

        let seq = state.next_seq;
        state.next_seq = state.next_seq.wrapping_add(1);
        let now = self.clock.now_ms();
        state.in_flight.insert(
            seq,
            InFlightEntry {
                payload: payload.clone(),
                first_send_ms: now,
                last_send_ms: now,
                retries: 0,
                retransmitted: false,
            },
        );
        state.emit_queue.push_back(EmitJob { seq, payload });
        drop(state);
        self.cv.notify_all();
        Ok(seq)
    }

    /// Processes an acknowledgment. Returns `true` iff this ACK acknowledged
    /// a previously in-flight sequence (a "new" ACK, as opposed to a
    /// duplicate that merely counts toward fast retransmit).
    pub fn ack(&self, ack_seq: u16, peer_rwnd: u16) -> bool {
        let mut state = self.state.lock().unwrap();
        state.peer_rwnd = peer_rwnd;

        if !state.in_flight.contains_key(&ack_seq) {
            state.dupack_count += 1;
            let mut resend = None;
            if state.dupack_count >= self.cfg.dupack_threshold {
                state.dupack_count = 0;
                let base = state.base;
                if state.in_flight.contains_key(&base) {
                    state.ssthresh = (state.cwnd / 2.0).max(self.cfg.ssthresh_floor);
                    state.cwnd = state.ssthresh;
                    let now = self.clock.now_ms();
                    let entry = state.in_flight.get_mut(&base).unwrap();
                    entry.retransmitted = true;
                    entry.last_send_ms = now;
                    resend = Some((base, entry.payload.clone()));
                    debug!("fast retransmit of base seq {}", base);
                }
            }
            if let Some((seq, payload)) = resend {
                state.emit_queue.push_front(EmitJob { seq, payload });
            }
            drop(state);
            self.cv.notify_all();
            return false;
        }

        state.dupack_count = 0;
        let entry = state.in_flight.remove(&ack_seq).unwrap();
        let now = self.clock.now_ms();
        let mut rtt_sample = None;
        if !entry.retransmitted {
            let rtt = now.saturating_sub(entry.first_send_ms);
            self.update_rto(&mut state, rtt);
            rtt_sample = Some(rtt);
        }

        if state.cwnd < state.ssthresh {
            state.cwnd += 1.0;
        } else {
            state.cwnd += 1.0 / state.cwnd;
        }

        while state.base != state.next_seq && !state.in_flight.contains_key(&state.base) {
            state.base = state.base.wrapping_add(1);
        }

        drop(state);
        self.cv.notify_all();
        if let Some(rtt) = rtt_sample {
            invoke_callback("on_rtt", || (self.callbacks.on_rtt)(ack_seq, rtt));
        }
        true
    }

    /// Jacobson/Karels RTO update. `rtt_ms` must never come from a
    /// retransmitted entry (Karn's rule) — callers enforce this.
    fn update_rto(&self, state: &mut SenderState, rtt_ms: u64) {
        let r = rtt_ms as f64;
        match (state.srtt_ms, state.rttvar_ms) {
            (Some(srtt), Some(rttvar)) => {
                let new_rttvar = (1.0 - RTT_BETA) * rttvar + RTT_BETA * (srtt - r).abs();
                let new_srtt = (1.0 - RTT_ALPHA) * srtt + RTT_ALPHA * r;
                state.srtt_ms = Some(new_srtt);
                state.rttvar_ms = Some(new_rttvar);
            }
            _ => {
                state.srtt_ms = Some(r);
                state.rttvar_ms = Some(r / 2.0);
            }
        }
        let srtt = state.srtt_ms.unwrap();
        let candidate = (2.0 * srtt).max(self.cfg.initial_rto_ms as f64);
        let clamped = candidate.clamp(self.cfg.min_rto_ms as f64, self.cfg.max_rto_ms as f64);
        state.rto_ms = clamped.round() as u64;
    }

    /// Retransmission-timer tick: scans the in-flight table for entries past
    /// their RTO, retransmits or permanently drops them, and applies the
    /// timeout congestion response. Exposed directly so tests can drive it
    /// without waiting on the background worker's real-time sleep.
    pub fn tick(&self) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().unwrap();

        let timed_out: Vec<u16> = state
            .in_flight
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.last_send_ms) >= state.rto_ms)
            .map(|(&seq, _)| seq)
            .collect();

        if timed_out.is_empty() {
            drop(state);
            return;
        }

        let mut drops = Vec::new();
        let mut resends = Vec::new();
        for seq in timed_out {
            let entry = state.in_flight.get_mut(&seq).unwrap();
            if entry.retries < self.cfg.max_retries {
                entry.retries += 1;
                entry.retransmitted = true;
                entry.last_send_ms = now;
                resends.push((seq, entry.payload.clone()));
                trace!("retransmission timeout for seq {}, rto={}ms", seq, state.rto_ms);
            } else {
                drops.push(seq);
            }
        }
        for seq in &drops {
            state.in_flight.remove(seq);
        }

        state.rto_ms = (state.rto_ms * 2).min(self.cfg.max_rto_ms);
        state.ssthresh = (state.cwnd / 2.0).max(self.cfg.ssthresh_floor);
        state.cwnd = self.cfg.initial_cwnd;

        while state.base != state.next_seq && !state.in_flight.contains_key(&state.base) {
            state.base = state.base.wrapping_add(1);
        }

        for (seq, payload) in resends.into_iter().rev() {
            state.emit_queue.push_front(EmitJob { seq, payload });
        }

        drop(state);
        self.cv.notify_all();
        for seq in drops {
            warn!("seq {} permanently dropped after max_retries", seq);
            invoke_callback("on_drop", || (self.callbacks.on_drop)(seq));
        }
    }

    fn run_timer(self: Arc<Self>) {
        while !self.stopped.load(Ordering::SeqCst) {
            let tick_ms = {
                let state = self.state.lock().unwrap();
                (state.rto_ms / 4).max(10)
            };
            thread::sleep(Duration::from_millis(tick_ms));
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            self.tick();
        }
    }

    fn run_pacer(self: Arc<Self>) {
        while !self.stopped.load(Ordering::SeqCst) {
            let mut state = self.state.lock().unwrap();
            let job = state.emit_queue.pop_front();
            let eff = Self::effective_window(&state, &self.cfg);

            match job {
                None => {
                    drop(state);
                    thread::sleep(Duration::from_millis(5));
                }
                Some(job) if eff < 1 => {
                    state.emit_queue.push_front(job);
                    drop(state);
                    thread::sleep(Duration::from_millis(5));
                }
                Some(job) => {
                    let srtt = state.srtt_ms;
                    let cwnd = state.cwnd.max(1.0);
                    drop(state);
                    let EmitJob { seq, payload } = job;
                    invoke_callback("send_raw", || (self.callbacks.send_raw)(seq, payload));
                    let gap_ms = srtt.unwrap_or(self.cfg.initial_rto_ms as f64) / cwnd;
                    if gap_ms > 0.0 {
                        thread::sleep(Duration::from_secs_f64(gap_ms / 1000.0));
                    }
                }
            }
        }
    }

    /// Number of sequences currently in flight (unacknowledged).
    pub fn in_flight_count(&self) -> usize {
        self.state.lock().unwrap().in_flight.len()
    }

    pub fn base(&self) -> u16 {
        self.state.lock().unwrap().base
    }

    pub fn next_seq(&self) -> u16 {
        self.state.lock().unwrap().next_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::FakeClock;
    use std::sync::Mutex as StdMutex;

    fn noop_callbacks() -> SenderCallbacks {
        SenderCallbacks {
            send_raw: Box::new(|_, _| {}),
            on_drop: Box::new(|_| {}),
            on_rtt: Box::new(|_, _| {}),
        }
    }

    #[test]
    fn send_assigns_sequential_sequences() {
        let cfg = HudpConfig::default();
        let clock = Arc::new(FakeClock::new());
        let sender = SrSender::new(cfg, clock, noop_callbacks());
        assert_eq!(sender.send(Bytes::from_static(b"a")).unwrap(), 0);
        assert_eq!(sender.send(Bytes::from_static(b"b")).unwrap(), 1);
        assert_eq!(sender.next_seq(), 2);
        assert_eq!(sender.in_flight_count(), 2);
    }

    #[test]
    fn new_ack_slides_base_and_removes_in_flight() {
        let cfg = HudpConfig::default();
        let clock = Arc::new(FakeClock::new());
        let sender = SrSender::new(cfg, clock.clone(), noop_callbacks());
        sender.send(Bytes::from_static(b"a")).unwrap();
        sender.send(Bytes::from_static(b"b")).unwrap();
        clock.advance(10);

        assert!(sender.ack(0, 64));
        assert_eq!(sender.base(), 1);
        assert_eq!(sender.in_flight_count(), 1);
    }

    #[test]
    fn duplicate_ack_does_not_remove_entries() {
        let cfg = HudpConfig::default();
        let clock = Arc::new(FakeClock::new());
        let sender = SrSender::new(cfg, clock, noop_callbacks());
        sender.send(Bytes::from_static(b"a")).unwrap();
        // seq 5 was never sent, so this is a duplicate/unknown ack.
        assert!(!sender.ack(5, 64));
        assert_eq!(sender.in_flight_count(), 1);
    }

    #[test]
    fn third_duplicate_ack_triggers_fast_retransmit() {
        let retransmitted = Arc::new(StdMutex::new(Vec::new()));
        let retransmitted_cb = retransmitted.clone();
        let callbacks = SenderCallbacks {
            send_raw: Box::new(move |seq, _| retransmitted_cb.lock().unwrap().push(seq)),
            on_drop: Box::new(|_| {}),
            on_rtt: Box::new(|_, _| {}),
        };
        let cfg = HudpConfig::default();
        let clock = Arc::new(FakeClock::new());
        let sender = Arc::new(SrSender::new(cfg, clock, callbacks));
        sender.send(Bytes::from_static(b"a")).unwrap();
        sender.send(Bytes::from_static(b"b")).unwrap();
        sender.send(Bytes::from_static(b"c")).unwrap();
        sender.start();

        assert!(!sender.ack(1, 64));
        assert!(!sender.ack(1, 64));
        assert!(!sender.ack(1, 64));

        // give the pacer a moment to drain the priority-queued resend
        thread::sleep(Duration::from_millis(50));
        sender.stop();
        assert!(retransmitted.lock().unwrap().contains(&0));
    }

    #[test]
    fn rto_only_updates_from_non_retransmitted_entries() {
        let cfg = HudpConfig::default();
        let clock = Arc::new(FakeClock::new());
        let sender = SrSender::new(cfg, clock.clone(), noop_callbacks());
        sender.send(Bytes::from_static(b"a")).unwrap();
        clock.advance(500);
        // force a timeout-driven retransmission, marking seq 0 as retransmitted
        sender.tick();
        clock.advance(5);
        // acking it now must not feed a (wrong) RTT sample via seq 0's history
        let state_rto_before = sender.state.lock().unwrap().rto_ms;
        sender.ack(0, 64);
        let state_rto_after = sender.state.lock().unwrap().rto_ms;
        assert_eq!(state_rto_before, state_rto_after);
    }

    #[test]
    fn window_full_send_eventually_would_block() {
        let mut cfg = HudpConfig::default();
        cfg.window_size = 1;
        cfg.initial_cwnd = 1.0;
        cfg.send_block_timeout_ms = 20;
        let clock = Arc::new(FakeClock::new());
        let sender = SrSender::new(cfg, clock, noop_callbacks());
        assert!(sender.send(Bytes::from_static(b"a")).is_ok());
        let result = sender.send(Bytes::from_static(b"b"));
        assert!(matches!(result, Err(HudpError::WouldBlock)));
    }

    #[test]
    fn blocked_send_returns_promptly_after_stop() {
        let mut cfg = HudpConfig::default();
        cfg.window_size = 1;
        cfg.initial_cwnd = 1.0;
        cfg.send_block_timeout_ms = 10_000;
        let clock = Arc::new(FakeClock::new());
        let sender = Arc::new(SrSender::new(cfg, clock, noop_callbacks()));
        sender.start();
        assert!(sender.send(Bytes::from_static(b"a")).is_ok());

        let blocked = Arc::clone(&sender);
        let handle = thread::spawn(move || blocked.send(Bytes::from_static(b"b")));

        // give the second send a moment to actually start blocking on the
        // condition variable before we stop the sender out from under it.
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        sender.stop();
        let result = handle.join().unwrap();

        assert!(matches!(result, Err(HudpError::WouldBlock)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn panicking_callback_does_not_kill_pacer_or_poison_state() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let sent_cb = sent.clone();
        let callbacks = SenderCallbacks {
            send_raw: Box::new(move |seq, _| {
                if seq == 0 {
                    panic!("simulated host callback failure");
                }
                sent_cb.lock().unwrap().push(seq);
            }),
            on_drop: Box::new(|_| {}),
            on_rtt: Box::new(|_, _| {}),
        };
        let cfg = HudpConfig::default();
        let clock = Arc::new(FakeClock::new());
        let sender = Arc::new(SrSender::new(cfg, clock, callbacks));
        sender.start();
        sender.send(Bytes::from_static(b"a")).unwrap();
        sender.send(Bytes::from_static(b"b")).unwrap();

        thread::sleep(Duration::from_millis(100));
        sender.stop();

        // seq 0's send_raw panicked, but the pacer thread survived instead
        // of dying on the unwind, went on to emit seq 1, and the sender's
        // own state is still usable (no poisoned mutex).
        assert_eq!(*sent.lock().unwrap(), vec![1]);
        assert_eq!(sender.in_flight_count(), 2);
        assert!(sender.ack(1, 64));
    }
}
