//! Builders for wire frames in the shape [crate::codec::frame::FrameCodec]
//!  understands, for tests that drive the gateway over a real socket.

use bytes::{BufMut, BytesMut};

pub fn heartbeat() -> Vec<u8> {
    vec![0xff]
}

/// An AVL data frame claiming the given IMEI and record count, with a small
///  filler payload per record.
pub fn avl_frame(packet_id: u8, avl_packet_id: u8, imei: &str, record_count: u8) -> Vec<u8> {
    avl_frame_padded(packet_id, avl_packet_id, imei, record_count, 0)
}

/// Same as [avl_frame] but padded with `padding` extra payload bytes, so
///  tests can pin the exact datagram size.
pub fn avl_frame_padded(
    packet_id: u8,
    avl_packet_id: u8,
    imei: &str,
    record_count: u8,
    padding: usize,
) -> Vec<u8> {
    assert_eq!(imei.len(), 15);

    let mut payload = BytesMut::new();
    payload.put_slice(&[0xca, 0xfe]);
    payload.put_u8(packet_id);
    payload.put_u8(avl_packet_id);
    payload.put_u16(imei.len() as u16);
    payload.put_slice(imei.as_bytes());
    payload.put_u8(0x08); // codec id
    payload.put_u8(record_count);
    for _ in 0..record_count {
        payload.put_slice(&[0x00; 4]);
    }
    payload.put_bytes(0x00, padding);
    payload.put_u8(record_count);

    let mut frame = BytesMut::with_capacity(payload.len() + 2);
    frame.put_u16(payload.len() as u16);
    frame.put_slice(&payload);
    frame.to_vec()
}

/// The ack [crate::codec::frame::FrameCodec] computes for a matching
///  [avl_frame].
pub fn expected_ack(packet_id: u8, avl_packet_id: u8, record_count: u8) -> Vec<u8> {
    vec![0x00, 0x05, 0xca, 0xfe, packet_id, avl_packet_id, record_count]
}

pub fn command_response_frame(packet_id: u8, response: &str) -> Vec<u8> {
    let mut payload = BytesMut::new();
    payload.put_slice(&[0xca, 0xfe]);
    payload.put_u8(packet_id);
    payload.put_u8(0x0c);
    payload.put_slice(response.as_bytes());

    let mut frame = BytesMut::with_capacity(payload.len() + 2);
    frame.put_u16(payload.len() as u16);
    frame.put_slice(&payload);
    frame.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::frame::FrameCodec;
    use crate::codec::{PacketCodec, PduKind};

    #[test]
    fn test_built_avl_frame_classifies() {
        let frame = avl_frame(0x01, 0x28, "352094089397464", 4);

        match FrameCodec.classify(&frame) {
            PduKind::AvlData(packet) => {
                assert_eq!(packet.device_id, "352094089397464");
                assert_eq!(packet.records.len(), 4);
                assert_eq!(packet.ack.as_ref(), expected_ack(0x01, 0x28, 4).as_slice());
            }
            other => panic!("expected AVL data, got {:?}", other),
        }
    }

    #[test]
    fn test_built_response_frame_classifies() {
        let frame = command_response_frame(0x01, "getinfo-response");
        assert_eq!(
            FrameCodec.classify(&frame),
            PduKind::CommandResponse {
                response: "getinfo-response".to_string()
            }
        );
    }

    #[test]
    fn test_padded_frame_has_exact_size() {
        let frame = avl_frame_padded(0x01, 0x28, "352094089397464", 2, 100);
        assert_eq!(frame.len(), 2 + 23 + 2 * 4 + 100 + 1);
    }
}
