//! AAC RTP depacketization (RFC 3640, mpeg4-generic) and ADTS framing.
//!
//! Audio access units arrive with a bit-length-prefixed AU-header section
//! describing the size of each unit. For the transport stream each raw
//! unit is wrapped in a 7-byte ADTS header built from the
//! AudioSpecificConfig carried in the track's fmtp `config=` parameter.

use crate::error::HlsError;
use crate::rtsp::rtp::RtpPacket;
use bytes::{BufMut, Bytes, BytesMut};

/// Decoder configuration from the fmtp line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AacConfig {
    pub object_type: u8,
    pub frequency_index: u8,
    pub channels: u8,
    pub size_length: u8,
    pub index_length: u8,
}

impl AacConfig {
    /// Parse `config=<hex>;sizelength=13;indexlength=3;...` parameters
    pub fn parse(fmtp: &str) -> Result<Self, HlsError> {
        let malformed = |details: String| HlsError::UnsupportedPayload { details };

        let mut config_bytes: Option<Vec<u8>> = None;
        let mut size_length = 13u8;
        let mut index_length = 3u8;

        for param in fmtp.split(';') {
            let Some((key, value)) = param.trim().split_once('=') else {
                continue;
            };
            match key.to_ascii_lowercase().as_str() {
                "config" => config_bytes = Some(parse_hex(value)?),
                "sizelength" => {
                    size_length = value
                        .parse()
                        .map_err(|_| malformed(format!("bad sizelength: {:?}", value)))?
                }
                "indexlength" => {
                    index_length = value
                        .parse()
                        .map_err(|_| malformed(format!("bad indexlength: {:?}", value)))?
                }
                _ => {}
            }
        }

        let config = config_bytes.ok_or_else(|| malformed("missing config=".to_string()))?;
        if config.len() < 2 {
            return Err(malformed("config too short".to_string()));
        }

        // AudioSpecificConfig: 5 bits object type, 4 bits frequency index,
        // 4 bits channel configuration.
        let object_type = config[0] >> 3;
        let frequency_index = ((config[0] & 0x07) << 1) | (config[1] >> 7);
        let channels = (config[1] >> 3) & 0x0F;

        Ok(Self {
            object_type,
            frequency_index,
            channels,
            size_length,
            index_length,
        })
    }

    /// 7-byte ADTS header for one raw AAC unit
    fn adts_header(&self, unit_len: usize) -> [u8; 7] {
        let frame_len = (unit_len + 7) as u16;
        [
            0xFF,
            0xF1, // MPEG-4, layer 0, no CRC
            ((self.object_type - 1) << 6)
                | (self.frequency_index << 2)
                | ((self.channels >> 2) & 0x01),
            ((self.channels & 0x03) << 6) | ((frame_len >> 11) as u8 & 0x03),
            (frame_len >> 3) as u8,
            ((frame_len as u8 & 0x07) << 5) | 0x1F,
            0xFC,
        ]
    }
}

/// Reassembled audio units for one RTP packet
#[derive(Debug)]
pub struct AudioUnits {
    /// RTP timestamp of the first unit, in the track's clock rate
    pub timestamp: u32,
    /// ADTS-framed AAC units
    pub frames: Vec<Bytes>,
}

#[derive(Debug)]
pub struct AacDepacketizer {
    config: AacConfig,
}

impl AacDepacketizer {
    pub fn new(config: AacConfig) -> Self {
        Self { config }
    }

    pub fn push(&mut self, packet: &RtpPacket) -> Result<AudioUnits, HlsError> {
        let malformed = |details: String| HlsError::UnsupportedPayload { details };
        let payload = &packet.payload;

        if payload.len() < 2 {
            return Err(malformed("AAC payload too short".to_string()));
        }

        let headers_bits = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        let header_bits_per_au = (self.config.size_length + self.config.index_length) as usize;
        if header_bits_per_au == 0 || headers_bits % header_bits_per_au != 0 {
            return Err(malformed(format!("bad AU headers length {}", headers_bits)));
        }
        let au_count = headers_bits / header_bits_per_au;
        let headers_len = headers_bits.div_ceil(8);
        if payload.len() < 2 + headers_len {
            return Err(malformed("truncated AU headers".to_string()));
        }

        let mut sizes = Vec::with_capacity(au_count);
        let mut reader = BitReader::new(&payload[2..2 + headers_len]);
        for _ in 0..au_count {
            let size = reader.read(self.config.size_length as usize);
            reader.skip(self.config.index_length as usize);
            sizes.push(size as usize);
        }

        let mut frames = Vec::with_capacity(au_count);
        let mut offset = 2 + headers_len;
        for size in sizes {
            if offset + size > payload.len() {
                return Err(malformed("truncated AU data".to_string()));
            }
            let mut frame = BytesMut::with_capacity(size + 7);
            frame.put_slice(&self.config.adts_header(size));
            frame.put_slice(&payload[offset..offset + size]);
            frames.push(frame.freeze());
            offset += size;
        }

        Ok(AudioUnits {
            timestamp: packet.timestamp,
            frames,
        })
    }
}

fn parse_hex(value: &str) -> Result<Vec<u8>, HlsError> {
    let value = value.trim();
    if value.len() % 2 != 0 {
        return Err(HlsError::UnsupportedPayload {
            details: format!("odd hex config: {:?}", value),
        });
    }
    (0..value.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&value[i..i + 2], 16).map_err(|_| HlsError::UnsupportedPayload {
                details: format!("bad hex config: {:?}", value),
            })
        })
        .collect()
}

struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn read(&mut self, bits: usize) -> u32 {
        let mut value = 0u32;
        for _ in 0..bits {
            let byte = self.position / 8;
            let bit = 7 - self.position % 8;
            let flag = if byte < self.data.len() {
                (self.data[byte] >> bit) & 1
            } else {
                0
            };
            value = (value << 1) | flag as u32;
            self.position += 1;
        }
        value
    }

    fn skip(&mut self, bits: usize) {
        self.position += bits;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FMTP: &str =
        "profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config=1190";

    fn packet(payload: Vec<u8>, timestamp: u32) -> RtpPacket {
        let mut raw = vec![0u8; 12];
        raw[0] = 2 << 6;
        raw[1] = 97 | 0x80;
        raw[4..8].copy_from_slice(&timestamp.to_be_bytes());
        raw.extend_from_slice(&payload);
        RtpPacket::parse(Bytes::from(raw)).unwrap()
    }

    #[test]
    fn test_parse_config() {
        let config = AacConfig::parse(FMTP).unwrap();
        assert_eq!(config.object_type, 2); // AAC LC
        assert_eq!(config.frequency_index, 3); // 48 kHz
        assert_eq!(config.channels, 2);
        assert_eq!(config.size_length, 13);
        assert_eq!(config.index_length, 3);
    }

    #[test]
    fn test_parse_config_requires_config_param() {
        assert!(AacConfig::parse("sizelength=13").is_err());
        assert!(AacConfig::parse("config=zz").is_err());
    }

    #[test]
    fn test_depacketize_single_unit() {
        let config = AacConfig::parse(FMTP).unwrap();
        let mut depack = AacDepacketizer::new(config);

        // One AU of 4 bytes: headers length 16 bits, size 4 << 3 bits index
        let payload = vec![0x00, 0x10, 0x00, 0x20, 0xDE, 0xAD, 0xBE, 0xEF];
        let units = depack.push(&packet(payload, 48000)).unwrap();

        assert_eq!(units.timestamp, 48000);
        assert_eq!(units.frames.len(), 1);

        let frame = &units.frames[0];
        assert_eq!(frame.len(), 11);
        assert_eq!(frame[0], 0xFF);
        assert_eq!(frame[1], 0xF1);
        // frame length field = 11
        let len = ((frame[3] as usize & 0x03) << 11) | ((frame[4] as usize) << 3)
            | ((frame[5] as usize) >> 5);
        assert_eq!(len, 11);
        assert_eq!(&frame[7..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_depacketize_two_units() {
        let config = AacConfig::parse(FMTP).unwrap();
        let mut depack = AacDepacketizer::new(config);

        // Two AUs of 2 bytes each: headers length 32 bits
        let payload = vec![0x00, 0x20, 0x00, 0x10, 0x00, 0x10, 0xAA, 0xBB, 0xCC, 0xDD];
        let units = depack.push(&packet(payload, 0)).unwrap();

        assert_eq!(units.frames.len(), 2);
        assert_eq!(&units.frames[0][7..], &[0xAA, 0xBB]);
        assert_eq!(&units.frames[1][7..], &[0xCC, 0xDD]);
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let config = AacConfig::parse(FMTP).unwrap();
        let mut depack = AacDepacketizer::new(config);

        let payload = vec![0x00, 0x10, 0x00, 0x20, 0xDE];
        assert!(depack.push(&packet(payload, 0)).is_err());
    }
}
