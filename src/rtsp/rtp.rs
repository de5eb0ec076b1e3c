//! RTP packet parsing (RFC 3550 §5.1).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Ingested packets are parsed for their header fields (stream counters,
//! depacketization) and forwarded to readers verbatim, so only parsing is
//! needed here; serialization stays with the publisher.

use crate::error::RtspError;
use bytes::Bytes;

const HEADER_LEN: usize = 12;

/// A parsed RTP packet. `raw` keeps the wire bytes for fan-out.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub version: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Bytes,
    pub raw: Bytes,
}

impl RtpPacket {
    pub fn parse(raw: Bytes) -> Result<Self, RtspError> {
        let malformed = |details: String| RtspError::Rtp { details };

        if raw.len() < HEADER_LEN {
            return Err(malformed(format!("{} bytes is too short", raw.len())));
        }

        let version = raw[0] >> 6;
        if version != 2 {
            return Err(malformed(format!("version {} is not 2", version)));
        }

        let has_padding = raw[0] & 0x20 != 0;
        let has_extension = raw[0] & 0x10 != 0;
        let csrc_count = (raw[0] & 0x0F) as usize;

        let marker = raw[1] & 0x80 != 0;
        let payload_type = raw[1] & 0x7F;
        let sequence_number = u16::from_be_bytes([raw[2], raw[3]]);
        let timestamp = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let ssrc = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);

        let mut offset = HEADER_LEN + csrc_count * 4;
        if raw.len() < offset {
            return Err(malformed("truncated CSRC list".to_string()));
        }

        if has_extension {
            if raw.len() < offset + 4 {
                return Err(malformed("truncated extension header".to_string()));
            }
            let words = u16::from_be_bytes([raw[offset + 2], raw[offset + 3]]) as usize;
            offset += 4 + words * 4;
            if raw.len() < offset {
                return Err(malformed("truncated extension".to_string()));
            }
        }

        let mut end = raw.len();
        if has_padding {
            let pad = raw[end - 1] as usize;
            if pad == 0 || pad > end - offset {
                return Err(malformed(format!("bad padding length {}", pad)));
            }
            end -= pad;
        }

        Ok(Self {
            version,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            payload: raw.slice(offset..end),
            raw,
        })
    }
}

/// Whether a packet on an RTCP channel looks like RTCP (RFC 3550 §6):
/// version 2 and a packet type in the 200..=204 range. RTCP is forwarded
/// opaquely, so a full parse is not needed.
pub fn is_rtcp(raw: &[u8]) -> bool {
    raw.len() >= 4 && raw[0] >> 6 == 2 && (200..=204).contains(&raw[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_bytes(seq: u16, ts: u32, marker: bool) -> Vec<u8> {
        let mut raw = vec![0u8; 12];
        raw[0] = 2 << 6;
        raw[1] = 96 | if marker { 0x80 } else { 0 };
        raw[2..4].copy_from_slice(&seq.to_be_bytes());
        raw[4..8].copy_from_slice(&ts.to_be_bytes());
        raw[8..12].copy_from_slice(&0xAABBCCDDu32.to_be_bytes());
        raw.extend_from_slice(&[1, 2, 3]);
        raw
    }

    #[test]
    fn test_parse_basic_packet() {
        let pkt = RtpPacket::parse(Bytes::from(packet_bytes(7, 90000, true))).unwrap();
        assert_eq!(pkt.version, 2);
        assert_eq!(pkt.payload_type, 96);
        assert_eq!(pkt.sequence_number, 7);
        assert_eq!(pkt.timestamp, 90000);
        assert_eq!(pkt.ssrc, 0xAABBCCDD);
        assert!(pkt.marker);
        assert_eq!(&pkt.payload[..], &[1, 2, 3]);
    }

    #[test]
    fn test_parse_with_padding() {
        let mut raw = packet_bytes(1, 0, false);
        raw[0] |= 0x20;
        raw.extend_from_slice(&[0, 0, 3]); // 3 bytes of padding
        let pkt = RtpPacket::parse(Bytes::from(raw)).unwrap();
        assert_eq!(&pkt.payload[..], &[1, 2, 3]);
    }

    #[test]
    fn test_parse_with_extension() {
        let mut raw = vec![0u8; 12];
        raw[0] = (2 << 6) | 0x10;
        raw[1] = 96;
        // extension: profile 0, length 1 word
        raw.extend_from_slice(&[0, 0, 0, 1, 0xDE, 0xAD, 0xBE, 0xEF]);
        raw.extend_from_slice(&[9, 9]);
        let pkt = RtpPacket::parse(Bytes::from(raw)).unwrap();
        assert_eq!(&pkt.payload[..], &[9, 9]);
    }

    #[test]
    fn test_parse_rejects_short_and_bad_version() {
        assert!(RtpPacket::parse(Bytes::from_static(&[0; 4])).is_err());

        let mut raw = packet_bytes(0, 0, false);
        raw[0] = 1 << 6;
        assert!(RtpPacket::parse(Bytes::from(raw)).is_err());
    }

    #[test]
    fn test_rtcp_detection() {
        // Sender report, PT 200
        assert!(is_rtcp(&[2 << 6, 200, 0, 6]));
        assert!(!is_rtcp(&[2 << 6, 96, 0, 6]));
        assert!(!is_rtcp(&[0x80]));
    }
}
