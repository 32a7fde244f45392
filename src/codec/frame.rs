use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{AvlPacket, AvlRecord, PacketCodec, PduKind, HEARTBEAT_BYTE};

/// The UDP channel framing of the Teltonika protocol family: a big-endian
///  length prefix counting the bytes after itself, the `0xcafe` channel
///  marker, a packet id and an AVL packet id, then the payload.
///
/// This codec discriminates the three PDU kinds, validates the channel
///  header and the IMEI field, and computes the exact ack bytes for an AVL
///  packet. Per-record field decoding is not its job: record payloads are
///  surfaced as placeholder records carrying only the record count, and a
///  full codec implementing [PacketCodec] is expected to replace this one
///  wherever decoded positions matter.
pub struct FrameCodec;

const CHANNEL_MARKER: [u8; 2] = [0xca, 0xfe];
const COMMAND_TYPE: u8 = 0x0c;
const IMEI_LEN: usize = 15;

/// channel header (len + marker + packet id + avl id) plus imei length field,
///  imei digits, codec id and record count
const MIN_AVL_LEN: usize = 8 + IMEI_LEN + 2;
const MIN_COMMAND_LEN: usize = 7;

impl PacketCodec for FrameCodec {
    fn classify(&self, datagram: &[u8]) -> PduKind {
        if datagram.len() == 1 && datagram[0] == HEARTBEAT_BYTE {
            return PduKind::HeartbeatPing;
        }

        if !Self::has_channel_header(datagram) {
            return PduKind::Malformed;
        }

        if let Some(packet) = Self::try_decode_avl(datagram) {
            return PduKind::AvlData(packet);
        }
        if let Some(response) = Self::try_decode_command_response(datagram) {
            return PduKind::CommandResponse { response };
        }

        PduKind::Malformed
    }

    fn encode_command(&self, command: &str) -> anyhow::Result<Bytes> {
        if command.is_empty() {
            return Err(anyhow!("refusing to encode an empty command"));
        }
        if !command.is_ascii() {
            return Err(anyhow!("command contains non-ASCII characters: {:?}", command));
        }

        let mut buf = BytesMut::with_capacity(6 + command.len());
        buf.put_u16((4 + command.len()) as u16);
        buf.put_slice(&CHANNEL_MARKER);
        buf.put_u8(0x01);
        buf.put_u8(COMMAND_TYPE);
        buf.put_slice(command.as_bytes());
        Ok(buf.freeze())
    }
}

impl FrameCodec {
    /// length prefix matches the remainder, and the channel marker is present
    fn has_channel_header(datagram: &[u8]) -> bool {
        if datagram.len() < 6 {
            return false;
        }
        let declared = u16::from_be_bytes([datagram[0], datagram[1]]) as usize;
        declared == datagram.len() - 2 && datagram[2..4] == CHANNEL_MARKER
    }

    fn try_decode_avl(datagram: &[u8]) -> Option<AvlPacket> {
        if datagram.len() < MIN_AVL_LEN {
            return None;
        }

        let packet_id = datagram[4];
        let avl_packet_id = datagram[5];

        let imei_len = u16::from_be_bytes([datagram[6], datagram[7]]) as usize;
        if imei_len != IMEI_LEN {
            return None;
        }
        let imei_bytes = &datagram[8..8 + IMEI_LEN];
        if !imei_bytes.iter().all(u8::is_ascii_digit) {
            return None;
        }
        let device_id = String::from_utf8(imei_bytes.to_vec()).ok()?;

        let record_count = datagram[8 + IMEI_LEN + 1];
        // the record count is repeated as the last byte of the packet
        if *datagram.last()? != record_count {
            return None;
        }

        let records = (0..record_count)
            .map(|_| AvlRecord::default())
            .collect();

        let mut ack = BytesMut::with_capacity(7);
        ack.put_u16(5);
        ack.put_slice(&CHANNEL_MARKER);
        ack.put_u8(packet_id);
        ack.put_u8(avl_packet_id);
        ack.put_u8(record_count);

        Some(AvlPacket {
            device_id,
            records,
            ack: ack.freeze(),
        })
    }

    fn try_decode_command_response(datagram: &[u8]) -> Option<String> {
        if datagram.len() < MIN_COMMAND_LEN || datagram[5] != COMMAND_TYPE {
            return None;
        }
        String::from_utf8(datagram[6..].to_vec()).ok()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::util::hex::to_hex;

    /// captured from a live FMB920, IMEI 352094089397464, four records
    const AVL_FRAME: &str = "01e4cafe0128000f333532303934303839333937343634080400000163c803eb02010a2524c01d4a377d00d3012f130032421b0a4503f00150051503ef01510052005900be00c1000ab50008b60006426fd8cd3d1ece605a5400005500007300005a0000c0000007c70000000df1000059d910002d33c65300000000570000000064000000f7bf000000000000000163c803e6e8010a2530781d4a316f00d40131130031421b0a4503f00150051503ef01510052005900be00c1000ab50008b60005426fcbcd3d1ece605a5400005500007300005a0000c0000007c70000000ef1000059d910002d33b95300000000570000000064000000f7bf000000000000000163c803df18010a2536961d4a2e4f00d50134130033421b0a4503f00150051503ef01510052005900be00c1000ab50008b6000542702bcd3d1ece605a5400005500007300005a0000c0000007c70000001ef1000059d910002d33aa5300000000570000000064000000f7bf000000000000000163c8039ce2010a25d8d41d49f42c00dc0123120058421b0a4503f00150051503ef01510052005900be00c1000ab50009b60005427031cd79d8ce605a5400005500007300005a0000c0000007c700000019f1000059d910002d32505300000000570000000064000000f7bf000000000004";

    fn unhex(s: &str) -> Vec<u8> {
        assert!(s.len() % 2 == 0);
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn test_classify_avl_frame() {
        let datagram = unhex(AVL_FRAME);

        match FrameCodec.classify(&datagram) {
            PduKind::AvlData(packet) => {
                assert_eq!(packet.device_id, "352094089397464");
                assert_eq!(packet.records.len(), 4);
                assert_eq!(to_hex(&packet.ack), "0005cafe012804");
            }
            other => panic!("expected AVL data, got {:?}", other),
        }
    }

    #[rstest]
    #[case::traccar_1("0067cafe016b000f3335303432343036333831373336338e01000001839ecd8a70000b5629e81c5451d0000000000000000000000b000500500000150400c800004502001d00000500422e970018000000cd13f000ce005d00430fd3000100f10000547e0000000001", "0005cafe016b01", "350424063817363", 1)]
    #[case::traccar_2("0067cafe0169000f3335303432343036333831373336338e01000001839ecca010000b5629e81c5451d0000000000000000000000b000500500000150400c800004502001d00000500422e920018000000cd13ef00ce005d00430fd3000100f10000547e0000000001", "0005cafe016901", "350424063817363", 1)]
    fn test_classify_avl_ack(
        #[case] frame: &str,
        #[case] expected_ack: &str,
        #[case] expected_imei: &str,
        #[case] expected_records: usize,
    ) {
        let datagram = unhex(frame);
        match FrameCodec.classify(&datagram) {
            PduKind::AvlData(packet) => {
                assert_eq!(packet.device_id, expected_imei);
                assert_eq!(packet.records.len(), expected_records);
                assert_eq!(to_hex(&packet.ack), expected_ack);
            }
            other => panic!("expected AVL data, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_heartbeat() {
        assert_eq!(FrameCodec.classify(&[0xff]), PduKind::HeartbeatPing);
    }

    #[rstest]
    #[case::empty(&[][..])]
    #[case::single_non_ff(&[0x00][..])]
    #[case::two_heartbeat_bytes(&[0xff, 0xff][..])]
    #[case::garbage(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07][..])]
    #[case::wrong_length_prefix(&[0x00, 0x99, 0xca, 0xfe, 0x01, 0x0c, 0x41][..])]
    fn test_classify_malformed(#[case] datagram: &[u8]) {
        assert_eq!(FrameCodec.classify(datagram), PduKind::Malformed);
    }

    #[test]
    fn test_classify_command_response() {
        let mut datagram = vec![0x00, 0x14, 0xca, 0xfe, 0x01, 0x0c];
        datagram.extend_from_slice(b"getinfo-response");
        assert_eq!(datagram.len() - 2, 0x14);

        assert_eq!(
            FrameCodec.classify(&datagram),
            PduKind::CommandResponse {
                response: "getinfo-response".to_string()
            }
        );
    }

    #[test]
    fn test_encode_command_roundtrip() {
        let frame = FrameCodec.encode_command("getinfo").unwrap();
        assert_eq!(&frame[..2], &[0x00, 0x0b][..]);
        assert_eq!(&frame[2..4], &CHANNEL_MARKER[..]);
        assert_eq!(frame[5], COMMAND_TYPE);
        assert_eq!(&frame[6..], &b"getinfo"[..]);
    }

    #[rstest]
    #[case::empty("")]
    #[case::non_ascii("getinfö")]
    fn test_encode_command_rejects(#[case] command: &str) {
        assert!(FrameCodec.encode_command(command).is_err());
    }
}
