//! H.264 RTP depacketization (RFC 6184).
//!
//! Reassembles RTP payloads into access units for the segmenter. Three
//! packetization modes cover what cameras send: single NAL unit packets,
//! STAP-A aggregates and FU-A fragments. An access unit is complete when
//! the marker bit is set or the RTP timestamp changes.

use crate::error::HlsError;
use crate::rtsp::rtp::RtpPacket;
use bytes::{BufMut, Bytes, BytesMut};

const NAL_TYPE_IDR: u8 = 5;
const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;
const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;

/// One reassembled access unit
#[derive(Debug, Clone)]
pub struct AccessUnit {
    /// RTP timestamp (90 kHz clock)
    pub timestamp: u32,
    pub nals: Vec<Bytes>,
}

impl AccessUnit {
    /// An access unit carrying an IDR slice starts a new segment
    pub fn is_keyframe(&self) -> bool {
        self.nals
            .iter()
            .any(|nal| !nal.is_empty() && nal[0] & 0x1F == NAL_TYPE_IDR)
    }

    pub fn has_parameter_sets(&self) -> bool {
        self.nals.iter().any(|nal| {
            !nal.is_empty() && matches!(nal[0] & 0x1F, NAL_TYPE_SPS | NAL_TYPE_PPS)
        })
    }

    /// Annex B byte stream with 4-byte start codes
    pub fn annex_b(&self) -> Bytes {
        let mut out = BytesMut::new();
        for nal in &self.nals {
            out.put_slice(&[0, 0, 0, 1]);
            out.put_slice(nal);
        }
        out.freeze()
    }
}

#[derive(Debug, Default)]
pub struct H264Depacketizer {
    nals: Vec<Bytes>,
    timestamp: Option<u32>,
    fragment: BytesMut,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one RTP packet; returns completed access units (usually zero
    /// or one, two when a timestamp change and a marker coincide).
    pub fn push(&mut self, packet: &RtpPacket) -> Result<Vec<AccessUnit>, HlsError> {
        let payload = &packet.payload;
        if payload.is_empty() {
            return Err(HlsError::UnsupportedPayload {
                details: "empty H264 payload".to_string(),
            });
        }

        let mut complete = Vec::new();

        // A timestamp change closes the previous access unit even when the
        // marker was lost.
        if let Some(current) = self.timestamp {
            if current != packet.timestamp && !self.nals.is_empty() {
                complete.push(self.flush(current));
            }
        }
        self.timestamp = Some(packet.timestamp);

        let nal_type = payload[0] & 0x1F;
        match nal_type {
            1..=23 => self.nals.push(payload.clone()),
            NAL_TYPE_STAP_A => self.push_stap_a(payload)?,
            NAL_TYPE_FU_A => self.push_fu_a(payload)?,
            other => {
                return Err(HlsError::UnsupportedPayload {
                    details: format!("NAL type {}", other),
                })
            }
        }

        if packet.marker && !self.nals.is_empty() {
            complete.push(self.flush(packet.timestamp));
        }

        Ok(complete)
    }

    fn flush(&mut self, timestamp: u32) -> AccessUnit {
        AccessUnit {
            timestamp,
            nals: std::mem::take(&mut self.nals),
        }
    }

    /// STAP-A: one byte header, then length-prefixed NAL units
    fn push_stap_a(&mut self, payload: &Bytes) -> Result<(), HlsError> {
        let mut offset = 1;
        while offset < payload.len() {
            if offset + 2 > payload.len() {
                return Err(HlsError::UnsupportedPayload {
                    details: "truncated STAP-A length".to_string(),
                });
            }
            let len = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
            offset += 2;
            if len == 0 || offset + len > payload.len() {
                return Err(HlsError::UnsupportedPayload {
                    details: "truncated STAP-A unit".to_string(),
                });
            }
            self.nals.push(payload.slice(offset..offset + len));
            offset += len;
        }
        Ok(())
    }

    /// FU-A: indicator + header bytes, fragments reassembled between the
    /// start and end bits
    fn push_fu_a(&mut self, payload: &Bytes) -> Result<(), HlsError> {
        if payload.len() < 2 {
            return Err(HlsError::UnsupportedPayload {
                details: "truncated FU-A".to_string(),
            });
        }
        let indicator = payload[0];
        let header = payload[1];
        let start = header & 0x80 != 0;
        let end = header & 0x40 != 0;

        if start {
            self.fragment.clear();
            // Reconstructed NAL header: F/NRI from the indicator, type
            // from the FU header.
            self.fragment.put_u8((indicator & 0xE0) | (header & 0x1F));
        } else if self.fragment.is_empty() {
            // Fragment without a start, packet loss; drop it.
            return Ok(());
        }

        self.fragment.put_slice(&payload[2..]);

        if end {
            self.nals.push(self.fragment.split().freeze());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(payload: Vec<u8>, timestamp: u32, marker: bool) -> RtpPacket {
        let mut raw = vec![0u8; 12];
        raw[0] = 2 << 6;
        raw[1] = 96 | if marker { 0x80 } else { 0 };
        raw[4..8].copy_from_slice(&timestamp.to_be_bytes());
        raw.extend_from_slice(&payload);
        RtpPacket::parse(Bytes::from(raw)).unwrap()
    }

    #[test]
    fn test_single_nal_with_marker() {
        let mut depack = H264Depacketizer::new();
        let units = depack
            .push(&packet(vec![0x65, 1, 2, 3], 1000, true))
            .unwrap();

        assert_eq!(units.len(), 1);
        assert_eq!(units[0].timestamp, 1000);
        assert!(units[0].is_keyframe());
        assert_eq!(&units[0].nals[0][..], &[0x65, 1, 2, 3]);
    }

    #[test]
    fn test_stap_a_aggregate() {
        // SPS (len 2) + PPS (len 2) in one STAP-A
        let payload = vec![NAL_TYPE_STAP_A, 0, 2, 0x67, 0xAA, 0, 2, 0x68, 0xBB];
        let mut depack = H264Depacketizer::new();
        let units = depack.push(&packet(payload, 2000, true)).unwrap();

        assert_eq!(units.len(), 1);
        assert_eq!(units[0].nals.len(), 2);
        assert!(units[0].has_parameter_sets());
        assert!(!units[0].is_keyframe());
    }

    #[test]
    fn test_fu_a_reassembly() {
        let mut depack = H264Depacketizer::new();

        // Start fragment: indicator NRI=3, FU header start + IDR type
        assert!(depack
            .push(&packet(vec![0x7C, 0x85, 1, 2], 3000, false))
            .unwrap()
            .is_empty());
        // Middle
        assert!(depack
            .push(&packet(vec![0x7C, 0x05, 3, 4], 3000, false))
            .unwrap()
            .is_empty());
        // End, with marker
        let units = depack
            .push(&packet(vec![0x7C, 0x45, 5, 6], 3000, true))
            .unwrap();

        assert_eq!(units.len(), 1);
        let nal = &units[0].nals[0];
        // Header rebuilt from indicator NRI + fragment type
        assert_eq!(nal[0], 0x65);
        assert_eq!(&nal[1..], &[1, 2, 3, 4, 5, 6]);
        assert!(units[0].is_keyframe());
    }

    #[test]
    fn test_timestamp_change_flushes() {
        let mut depack = H264Depacketizer::new();

        // Lost marker on the first unit
        assert!(depack
            .push(&packet(vec![0x41, 1], 1000, false))
            .unwrap()
            .is_empty());

        let units = depack.push(&packet(vec![0x41, 2], 2000, true)).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].timestamp, 1000);
        assert_eq!(units[1].timestamp, 2000);
    }

    #[test]
    fn test_fragment_without_start_dropped() {
        let mut depack = H264Depacketizer::new();
        let units = depack
            .push(&packet(vec![0x7C, 0x45, 9, 9], 1000, true))
            .unwrap();
        assert!(units.is_empty());
    }

    #[test]
    fn test_annex_b_output() {
        let unit = AccessUnit {
            timestamp: 0,
            nals: vec![Bytes::from_static(&[0x67, 1]), Bytes::from_static(&[0x65, 2])],
        };
        assert_eq!(
            &unit.annex_b()[..],
            &[0, 0, 0, 1, 0x67, 1, 0, 0, 0, 1, 0x65, 2]
        );
    }

    #[test]
    fn test_unsupported_nal_type() {
        let mut depack = H264Depacketizer::new();
        assert!(depack.push(&packet(vec![29, 0], 0, true)).is_err());
    }
}
