//! Thin channel multiplexer: owns the datagram socket, demultiplexes
//! inbound datagrams by tag to the SR sender (ACKs), the SR receiver
//! (reliable data), or the unreliable delivery queue, and exposes the
//! application-facing send/recv API.

use crate::callbacks::{Clock, ReceiverCallbacks, SenderCallbacks, SystemClock};
use crate::config::HudpConfig;
use crate::error::HudpError;
use crate::receiver::SrReceiver;
use crate::sender::SrSender;
use crate::wire::{self, Packet};
use bytes::Bytes;
use log::{error, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// `(channel_tag, seq, header_timestamp_ms, payload)` — the shape handed
/// back to the application by `recv`.
pub type Delivered = (u8, u16, u32, Bytes);

fn send_datagram(socket: &UdpSocket, peer: &Mutex<Option<SocketAddr>>, data: &[u8]) {
    let target = *peer.lock().unwrap();
    match target {
        Some(addr) => {
            if let Err(e) = socket.send_to(data, addr) {
                error!("failed to write outbound datagram: {}", e);
            }
        }
        None => warn!("dropping outbound datagram, no peer address set"),
    }
}

/// Owns the socket and the reliable/unreliable channel pair for a single
/// remote peer.
pub struct Channel {
    socket: Arc<UdpSocket>,
    peer: Arc<Mutex<Option<SocketAddr>>>,
    sender: Arc<SrSender>,
    receiver: Arc<SrReceiver>,
    unreliable_seq: AtomicU16,
    clock: Arc<dyn Clock>,
    rx_timestamps: Arc<Mutex<HashMap<u16, u32>>>,
    recv_queue: Arc<Mutex<VecDeque<Delivered>>>,
    recv_cv: Arc<Condvar>,
    running: AtomicBool,
    stopped: AtomicBool,
    recv_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Binds a socket and wires up the sender/receiver pair. No peer is set
    /// yet and no workers are running until `start()`.
    pub fn bind(bind_addr: SocketAddr, cfg: HudpConfig) -> Result<Arc<Self>, HudpError> {
        cfg.validate()?;
        let socket = UdpSocket::bind(bind_addr)?;
        Ok(Self::from_socket(socket, cfg))
    }

    fn from_socket(socket: UdpSocket, cfg: HudpConfig) -> Arc<Self> {
        let socket = Arc::new(socket);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let peer: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
        let rx_timestamps: Arc<Mutex<HashMap<u16, u32>>> = Arc::new(Mutex::new(HashMap::new()));
        let recv_queue: Arc<Mutex<VecDeque<Delivered>>> = Arc::new(Mutex::new(VecDeque::new()));
        let recv_cv = Arc::new(Condvar::new());

        let sender_callbacks = {
            let socket = socket.clone();
            let peer = peer.clone();
            let clock = clock.clone();
            SenderCallbacks {
                send_raw: Box::new(move |seq, payload| {
                    let ts = clock.now_ms() as u32;
                    let datagram = wire::encode_reliable(seq, ts, &payload);
                    send_datagram(&socket, &peer, &datagram);
                }),
                on_drop: Box::new(|seq| {
                    warn!("reliable seq {} permanently dropped", seq);
                }),
                on_rtt: Box::new(|seq, rtt_ms| {
                    trace!("seq {} rtt={}ms", seq, rtt_ms);
                }),
            }
        };
        let sender = Arc::new(SrSender::new(cfg.clone(), clock.clone(), sender_callbacks));

        let receiver_callbacks = {
            let socket = socket.clone();
            let peer = peer.clone();
            let rx_timestamps = rx_timestamps.clone();
            let recv_queue = recv_queue.clone();
            let recv_cv = recv_cv.clone();
            ReceiverCallbacks {
                deliver_in_order: Box::new(move |seq, payload| {
                    let header_ts = rx_timestamps.lock().unwrap().remove(&seq).unwrap_or(0);
                    recv_queue
                        .lock()
                        .unwrap()
                        .push_back((wire::TAG_RELIABLE, seq, header_ts, payload));
                    recv_cv.notify_all();
                }),
                send_ack: Box::new(move |ack_seq, recv_window| {
                    let ack = wire::encode_ack(ack_seq, recv_window);
                    send_datagram(&socket, &peer, &ack);
                }),
            }
        };
        let receiver = Arc::new(SrReceiver::new(cfg, clock.clone(), receiver_callbacks));

        Arc::new(Self {
            socket,
            peer,
            sender,
            receiver,
            unreliable_seq: AtomicU16::new(0),
            clock,
            rx_timestamps,
            recv_queue,
            recv_cv,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            recv_thread: Mutex::new(None),
        })
    }

    pub fn set_peer(&self, addr: SocketAddr) {
        *self.peer.lock().unwrap() = Some(addr);
    }

    /// Starts the SR sender/receiver workers and the receive loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stopped.store(false, Ordering::SeqCst);
        self.sender.start();
        self.receiver.start();

        // A bounded read timeout lets the receive loop notice `stop()`
        // without the platform support UDP sockets lack for cancelling a
        // blocking read from another thread.
        let _ = self.socket.set_read_timeout(Some(Duration::from_millis(200)));

        let socket = self.socket.clone();
        let this = Arc::clone(self);
        let mut recv_thread = self.recv_thread.lock().unwrap();
        *recv_thread = Some(
            thread::Builder::new()
                .name("hudp-mux-recv".into())
                .spawn(move || this.run_recv_loop(socket))
                .expect("failed to spawn receive loop thread"),
        );
    }

    /// Stops all workers, joins them, and wakes any blocked `recv`. No
    /// guarantees are made about datagrams already in flight. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.sender.stop();
        self.receiver.stop();
        self.recv_cv.notify_all();
        if let Some(handle) = self.recv_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn run_recv_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = [0u8; 65535];
        while !self.stopped.load(Ordering::SeqCst) {
            match socket.recv_from(&mut buf) {
                Ok((len, _src)) => {
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    self.handle_inbound(data);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    error!("receive loop socket error, stopping: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_inbound(&self, data: Bytes) {
        match wire::decode(data) {
            Some(Packet::Ack {
                ack_seq,
                recv_window,
            }) => {
                self.sender.ack(ack_seq, recv_window);
            }
            Some(Packet::UnreliableData {
                seq,
                timestamp_ms,
                payload,
            }) => {
                self.recv_queue
                    .lock()
                    .unwrap()
                    .push_back((wire::TAG_UNRELIABLE, seq, timestamp_ms, payload));
                self.recv_cv.notify_all();
            }
            Some(Packet::ReliableData {
                seq,
                timestamp_ms,
                payload,
            }) => {
                self.rx_timestamps.lock().unwrap().insert(seq, timestamp_ms);
                self.receiver.on_data(seq, payload);
            }
            None => {
                trace!("discarding malformed or unrecognized datagram");
            }
        }
    }

    /// Sends a payload. For the unreliable channel this writes immediately
    /// under its own sequence counter; for the reliable channel this
    /// delegates to the SR sender, which may block per
    /// `send_block_timeout_ms`.
    pub fn send(&self, payload: Bytes, reliable: bool) -> Result<u16, HudpError> {
        if self.peer.lock().unwrap().is_none() {
            return Err(HudpError::NoPeer);
        }
        if reliable {
            self.sender.send(payload)
        } else {
            let seq = self.unreliable_seq.fetch_add(1, Ordering::SeqCst);
            let ts = self.clock.now_ms() as u32;
            let datagram = wire::encode_unreliable(seq, ts, &payload);
            send_datagram(&self.socket, &self.peer, &datagram);
            Ok(seq)
        }
    }

    /// Drains one delivered item. With `blocking`, waits up to `timeout`
    /// (or indefinitely if `None`) for an item to arrive or the endpoint to
    /// stop.
    pub fn recv(&self, blocking: bool, timeout: Option<Duration>) -> Option<Delivered> {
        let mut queue = self.recv_queue.lock().unwrap();
        if !blocking {
            return queue.pop_front();
        }
        loop {
            if let Some(item) = queue.pop_front() {
                return Some(item);
            }
            if self.stopped.load(Ordering::SeqCst) {
                return None;
            }
            match timeout {
                Some(d) => {
                    let (guard, result) = self.recv_cv.wait_timeout(queue, d).unwrap();
                    queue = guard;
                    if result.timed_out() {
                        return queue.pop_front();
                    }
                }
                None => {
                    queue = self.recv_cv.wait(queue).unwrap();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_without_peer_errors() {
        let cfg = HudpConfig::default();
        let channel = Channel::bind("127.0.0.1:0".parse().unwrap(), cfg).unwrap();
        let result = channel.send(Bytes::from_static(b"hi"), false);
        assert!(matches!(result, Err(HudpError::NoPeer)));
    }

    #[test]
    fn non_blocking_recv_on_empty_queue_returns_none() {
        let cfg = HudpConfig::default();
        let channel = Channel::bind("127.0.0.1:0".parse().unwrap(), cfg).unwrap();
        assert!(channel.recv(false, None).is_none());
    }

    #[test]
    fn unreliable_send_assigns_independent_sequence_counter() {
        let cfg = HudpConfig::default();
        let channel = Channel::bind("127.0.0.1:0".parse().unwrap(), cfg).unwrap();
        channel.set_peer("127.0.0.1:1".parse().unwrap());
        assert_eq!(channel.send(Bytes::from_static(b"a"), false).unwrap(), 0);
        assert_eq!(channel.send(Bytes::from_static(b"b"), false).unwrap(), 1);
    }

    /// End-to-end over real loopback sockets: both channels exchange a
    /// reliable and an unreliable payload and each side receives both.
    #[test]
    fn loopback_round_trip_delivers_both_channels() {
        let cfg = HudpConfig::default();
        let a = Channel::bind("127.0.0.1:0".parse().unwrap(), cfg.clone()).unwrap();
        let b = Channel::bind("127.0.0.1:0".parse().unwrap(), cfg).unwrap();

        let addr_a = a.socket.local_addr().unwrap();
        let addr_b = b.socket.local_addr().unwrap();
        a.set_peer(addr_b);
        b.set_peer(addr_a);

        a.start();
        b.start();

        a.send(Bytes::from_static(b"reliable-hello"), true).unwrap();
        a.send(Bytes::from_static(b"unreliable-hello"), false)
            .unwrap();

        let timeout = Duration::from_secs(5);
        let mut seen_reliable = false;
        let mut seen_unreliable = false;
        let deadline = std::time::Instant::now() + timeout;
        while (!seen_reliable || !seen_unreliable) && std::time::Instant::now() < deadline {
            if let Some((tag, _seq, _ts, payload)) = b.recv(true, Some(Duration::from_millis(500)))
            {
                match tag {
                    wire::TAG_RELIABLE => {
                        assert_eq!(&payload[..], b"reliable-hello");
                        seen_reliable = true;
                    }
                    wire::TAG_UNRELIABLE => {
                        assert_eq!(&payload[..], b"unreliable-hello");
                        seen_unreliable = true;
                    }
                    _ => panic!("unexpected tag {}", tag),
                }
            }
        }

        a.stop();
        b.stop();

        assert!(seen_reliable, "reliable payload was never delivered");
        assert!(seen_unreliable, "unreliable payload was never delivered");
    }
}
