//! Fixed-layout packet header and ACK packing/unpacking, all big-endian.
//!
//! `decode` never returns an error type: a datagram below header size or
//! carrying an unknown tag byte is reported as `None` and discarded
//! silently by the multiplexer, exactly as the malformed-datagram policy
//! requires.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const TAG_RELIABLE: u8 = 0;
pub const TAG_UNRELIABLE: u8 = 1;
pub const TAG_ACK: u8 = 2;

/// `tag:u8 | seq:u16 | timestamp_ms:u32`
pub const DATA_HEADER_LEN: usize = 7;
/// `tag:u8 | ack_seq:u16 | recv_window:u16`
pub const ACK_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReliableData {
        seq: u16,
        timestamp_ms: u32,
        payload: Bytes,
    },
    UnreliableData {
        seq: u16,
        timestamp_ms: u32,
        payload: Bytes,
    },
    Ack {
        ack_seq: u16,
        recv_window: u16,
    },
}

/// Decodes a received datagram. Returns `None` for anything shorter than
/// its tag's fixed header or carrying an unrecognized tag byte.
pub fn decode(mut buf: Bytes) -> Option<Packet> {
    if buf.is_empty() {
        return None;
    }
    let tag = buf[0];
    match tag {
        TAG_RELIABLE | TAG_UNRELIABLE => {
            if buf.len() < DATA_HEADER_LEN {
                return None;
            }
            buf.advance(1);
            let seq = buf.get_u16();
            let timestamp_ms = buf.get_u32();
            let payload = buf;
            Some(if tag == TAG_RELIABLE {
                Packet::ReliableData {
                    seq,
                    timestamp_ms,
                    payload,
                }
            } else {
                Packet::UnreliableData {
                    seq,
                    timestamp_ms,
                    payload,
                }
            })
        }
        TAG_ACK => {
            if buf.len() < ACK_LEN {
                return None;
            }
            buf.advance(1);
            let ack_seq = buf.get_u16();
            let recv_window = buf.get_u16();
            Some(Packet::Ack {
                ack_seq,
                recv_window,
            })
        }
        _ => None,
    }
}

fn encode_data(tag: u8, seq: u16, timestamp_ms: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(DATA_HEADER_LEN + payload.len());
    buf.put_u8(tag);
    buf.put_u16(seq);
    buf.put_u32(timestamp_ms);
    buf.put_slice(payload);
    buf.freeze()
}

pub fn encode_reliable(seq: u16, timestamp_ms: u32, payload: &[u8]) -> Bytes {
    encode_data(TAG_RELIABLE, seq, timestamp_ms, payload)
}

pub fn encode_unreliable(seq: u16, timestamp_ms: u32, payload: &[u8]) -> Bytes {
    encode_data(TAG_UNRELIABLE, seq, timestamp_ms, payload)
}

pub fn encode_ack(ack_seq: u16, recv_window: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(ACK_LEN);
    buf.put_u8(TAG_ACK);
    buf.put_u16(ack_seq);
    buf.put_u16(recv_window);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_reliable_header() {
        let encoded = encode_reliable(42, 1_234_567, b"hello");
        match decode(encoded) {
            Some(Packet::ReliableData {
                seq,
                timestamp_ms,
                payload,
            }) => {
                assert_eq!(seq, 42);
                assert_eq!(timestamp_ms, 1_234_567);
                assert_eq!(&payload[..], b"hello");
            }
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn round_trips_unreliable_header() {
        let encoded = encode_unreliable(7, 99, b"x");
        assert!(matches!(
            decode(encoded),
            Some(Packet::UnreliableData { seq: 7, .. })
        ));
    }

    #[test]
    fn round_trips_ack() {
        let encoded = encode_ack(1000, 12);
        assert_eq!(
            decode(encoded),
            Some(Packet::Ack {
                ack_seq: 1000,
                recv_window: 12
            })
        );
    }

    #[test]
    fn empty_payload_is_valid() {
        let encoded = encode_reliable(0, 0, &[]);
        match decode(encoded) {
            Some(Packet::ReliableData { payload, .. }) => assert!(payload.is_empty()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn short_data_datagram_is_discarded() {
        let short = Bytes::from_static(&[TAG_RELIABLE, 0, 1]);
        assert_eq!(decode(short), None);
    }

    #[test]
    fn short_ack_is_discarded() {
        let short = Bytes::from_static(&[TAG_ACK, 0]);
        assert_eq!(decode(short), None);
    }

    #[test]
    fn unknown_tag_is_discarded() {
        let unknown = Bytes::from_static(&[0xff, 0, 0, 0, 0, 0, 0]);
        assert_eq!(decode(unknown), None);
    }

    #[test]
    fn empty_datagram_is_discarded() {
        assert_eq!(decode(Bytes::new()), None);
    }
}
