//! MPEG-TS segment writing (ISO 13818-1 subset).
//!
//! Segments are self-contained: every one starts with PAT and PMT so a
//! player can join at any media sequence. One program, H.264 video on PID
//! 256 (also the PCR PID) and optional ADTS audio on PID 257. PES packets
//! carry PTS only; the transcoder upstream emits no B-frames, so no DTS
//! reordering is needed.

use bytes::{BufMut, BytesMut};

pub const VIDEO_PID: u16 = 256;
pub const AUDIO_PID: u16 = 257;
const PMT_PID: u16 = 4096;
const PROGRAM_NUMBER: u16 = 1;

const PACKET_LEN: usize = 188;
const SYNC_BYTE: u8 = 0x47;

const STREAM_TYPE_H264: u8 = 0x1B;
const STREAM_TYPE_ADTS: u8 = 0x0F;

const STREAM_ID_VIDEO: u8 = 0xE0;
const STREAM_ID_AUDIO: u8 = 0xC0;

#[derive(Debug)]
pub struct TsWriter {
    has_audio: bool,
    pat_cc: u8,
    pmt_cc: u8,
    video_cc: u8,
    audio_cc: u8,
}

impl TsWriter {
    pub fn new(has_audio: bool) -> Self {
        Self {
            has_audio,
            pat_cc: 0,
            pmt_cc: 0,
            video_cc: 0,
            audio_cc: 0,
        }
    }

    /// PAT + PMT, emitted at the head of every segment
    pub fn write_tables(&mut self, out: &mut BytesMut) {
        // PAT: program 1 -> PMT PID
        let mut pat = BytesMut::new();
        pat.put_u16(PROGRAM_NUMBER);
        pat.put_u16(0xE000 | PMT_PID);
        let pat = psi_section(0x00, 0x0001, &pat);
        write_section(out, 0x0000, &mut self.pat_cc, &pat);

        // PMT: PCR on the video PID, one or two elementary streams
        let mut pmt = BytesMut::new();
        pmt.put_u16(0xE000 | VIDEO_PID);
        pmt.put_u16(0xF000); // program_info_length 0
        pmt.put_u8(STREAM_TYPE_H264);
        pmt.put_u16(0xE000 | VIDEO_PID);
        pmt.put_u16(0xF000); // ES_info_length 0
        if self.has_audio {
            pmt.put_u8(STREAM_TYPE_ADTS);
            pmt.put_u16(0xE000 | AUDIO_PID);
            pmt.put_u16(0xF000);
        }
        let pmt = psi_section(0x02, PROGRAM_NUMBER, &pmt);
        write_section(out, PMT_PID, &mut self.pmt_cc, &pmt);
    }

    /// One video access unit as a PES packet. The keyframe flag sets the
    /// random-access indicator and a PCR rides along.
    pub fn write_video(&mut self, out: &mut BytesMut, pts: u64, keyframe: bool, es: &[u8]) {
        let pes = pes_packet(STREAM_ID_VIDEO, pts, es);
        let mut cc = self.video_cc;
        write_pes_packets(out, VIDEO_PID, &mut cc, Some(pts * 300), keyframe, &pes);
        self.video_cc = cc;
    }

    /// One or more ADTS frames as a PES packet
    pub fn write_audio(&mut self, out: &mut BytesMut, pts: u64, es: &[u8]) {
        let pes = pes_packet(STREAM_ID_AUDIO, pts, es);
        let mut cc = self.audio_cc;
        write_pes_packets(out, AUDIO_PID, &mut cc, None, false, &pes);
        self.audio_cc = cc;
    }
}

/// Wrap a table body into a section with header and CRC, table_id_extension
/// carries transport_stream_id (PAT) or program_number (PMT)
fn psi_section(table_id: u8, table_id_extension: u16, body: &[u8]) -> BytesMut {
    let mut section = BytesMut::new();
    section.put_u8(table_id);
    // section_syntax_indicator, length = extension..crc inclusive
    section.put_u16(0xB000 | (body.len() as u16 + 9));
    section.put_u16(table_id_extension);
    section.put_u8(0xC1); // version 0, current_next 1
    section.put_u8(0x00); // section_number
    section.put_u8(0x00); // last_section_number
    section.put_slice(body);
    let crc = crc32_mpeg2(&section);
    section.put_u32(crc);
    section
}

/// A PSI section in a single TS packet with a pointer field
fn write_section(out: &mut BytesMut, pid: u16, cc: &mut u8, section: &[u8]) {
    debug_assert!(section.len() + 1 <= PACKET_LEN - 4);

    out.put_u8(SYNC_BYTE);
    out.put_u16(0x4000 | pid); // payload_unit_start
    out.put_u8(0x10 | *cc); // payload only
    *cc = (*cc + 1) & 0x0F;

    out.put_u8(0x00); // pointer_field
    out.put_slice(section);

    let stuffing = PACKET_LEN - 4 - 1 - section.len();
    out.put_bytes(0xFF, stuffing);
}

/// PES header + elementary stream payload
fn pes_packet(stream_id: u8, pts: u64, es: &[u8]) -> BytesMut {
    let mut pes = BytesMut::with_capacity(es.len() + 14);
    pes.put_slice(&[0x00, 0x00, 0x01, stream_id]);

    // 8 bytes of header follow the length field; zero means unbounded,
    // which only video may use.
    let remaining = es.len() + 8;
    if remaining <= u16::MAX as usize {
        pes.put_u16(remaining as u16);
    } else {
        pes.put_u16(0);
    }

    pes.put_u8(0x80); // marker bits
    pes.put_u8(0x80); // PTS present
    pes.put_u8(0x05); // header data length

    // 33-bit PTS split 3/15/15 with marker bits
    pes.put_u8(0x21 | (((pts >> 30) as u8 & 0x07) << 1));
    pes.put_u8((pts >> 22) as u8);
    pes.put_u8(((pts >> 14) as u8 & 0xFE) | 0x01);
    pes.put_u8((pts >> 7) as u8);
    pes.put_u8(((pts << 1) as u8 & 0xFE) | 0x01);

    pes.put_slice(es);
    pes
}

/// Split one PES packet across TS packets, stuffing the tail through the
/// adaptation field
fn write_pes_packets(
    out: &mut BytesMut,
    pid: u16,
    cc: &mut u8,
    pcr: Option<u64>,
    random_access: bool,
    pes: &[u8],
) {
    let mut remaining = pes;
    let mut first = true;

    while first || !remaining.is_empty() {
        out.put_u8(SYNC_BYTE);
        let pusi = if first { 0x4000 } else { 0 };
        out.put_u16(pusi | pid);

        // Adaptation carries PCR/RAI on the first packet and absorbs the
        // shortfall when the payload cannot fill the packet.
        let mut adaptation = BytesMut::new();
        if first && (pcr.is_some() || random_access) {
            let mut flags = 0u8;
            if random_access {
                flags |= 0x40;
            }
            if pcr.is_some() {
                flags |= 0x10;
            }
            adaptation.put_u8(flags);
            if let Some(pcr) = pcr {
                let base = pcr / 300;
                let extension = pcr % 300;
                out_pcr(&mut adaptation, base, extension as u16);
            }
        }

        let mut adaptation_total = if adaptation.is_empty() {
            0
        } else {
            1 + adaptation.len()
        };
        let mut payload_space = PACKET_LEN - 4 - adaptation_total;

        if remaining.len() < payload_space {
            // Grow the adaptation field to push the payload to the end.
            let shortfall = payload_space - remaining.len();
            if adaptation.is_empty() {
                adaptation_total = shortfall;
                if shortfall >= 2 {
                    adaptation.put_u8(0x00);
                    adaptation.put_bytes(0xFF, shortfall - 2);
                }
            } else {
                adaptation.put_bytes(0xFF, shortfall);
                adaptation_total += shortfall;
            }
            payload_space = PACKET_LEN - 4 - adaptation_total;
        }

        let has_adaptation = adaptation_total > 0;
        let control = if has_adaptation { 0x30 } else { 0x10 };
        out.put_u8(control | *cc);
        *cc = (*cc + 1) & 0x0F;

        if has_adaptation {
            out.put_u8((adaptation_total - 1) as u8);
            out.put_slice(&adaptation);
        }

        let take = remaining.len().min(payload_space);
        out.put_slice(&remaining[..take]);
        remaining = &remaining[take..];
        first = false;
    }
}

fn out_pcr(out: &mut BytesMut, base: u64, extension: u16) {
    out.put_u8((base >> 25) as u8);
    out.put_u8((base >> 17) as u8);
    out.put_u8((base >> 9) as u8);
    out.put_u8((base >> 1) as u8);
    out.put_u8(((base as u8 & 0x01) << 7) | 0x7E | ((extension >> 8) as u8 & 0x01));
    out.put_u8(extension as u8);
}

/// CRC-32/MPEG-2: poly 0x04C11DB7, init all-ones, no reflection
fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Walk TS packets for one PID and reassemble the payload
    fn extract_payload(ts: &[u8], want_pid: u16) -> Vec<u8> {
        assert_eq!(ts.len() % PACKET_LEN, 0, "stream not packet aligned");
        let mut out = Vec::new();

        for packet in ts.chunks(PACKET_LEN) {
            assert_eq!(packet[0], SYNC_BYTE);
            let pid = u16::from_be_bytes([packet[1], packet[2]]) & 0x1FFF;
            if pid != want_pid {
                continue;
            }
            let control = (packet[3] >> 4) & 0x03;
            let mut offset = 4;
            if control & 0x02 != 0 {
                offset += 1 + packet[4] as usize;
            }
            if control & 0x01 != 0 {
                out.extend_from_slice(&packet[offset..]);
            }
        }
        out
    }

    #[test]
    fn test_tables_are_single_packets() {
        let mut writer = TsWriter::new(true);
        let mut out = BytesMut::new();
        writer.write_tables(&mut out);

        assert_eq!(out.len(), 2 * PACKET_LEN);
        assert_eq!(out[0], SYNC_BYTE);
        assert_eq!(out[PACKET_LEN], SYNC_BYTE);

        // PAT on PID 0 with PUSI
        assert_eq!(u16::from_be_bytes([out[1], out[2]]), 0x4000);
        // PMT PID
        let pmt_pid = u16::from_be_bytes([out[PACKET_LEN + 1], out[PACKET_LEN + 2]]) & 0x1FFF;
        assert_eq!(pmt_pid, PMT_PID);
    }

    #[test]
    fn test_pmt_lists_streams() {
        let mut writer = TsWriter::new(true);
        let mut out = BytesMut::new();
        writer.write_tables(&mut out);

        let pmt = extract_payload(&out, PMT_PID);
        // Skip pointer field, check stream types appear
        assert!(pmt.windows(1).any(|w| w[0] == STREAM_TYPE_H264));
        assert!(pmt.windows(1).any(|w| w[0] == STREAM_TYPE_ADTS));

        // Video-only PMT omits audio
        let mut writer = TsWriter::new(false);
        let mut out = BytesMut::new();
        writer.write_tables(&mut out);
        let pmt = extract_payload(&out, PMT_PID);
        assert!(!pmt.contains(&STREAM_TYPE_ADTS));
    }

    #[test]
    fn test_video_pes_round_trip() {
        let es: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();

        let mut writer = TsWriter::new(false);
        let mut out = BytesMut::new();
        writer.write_video(&mut out, 90_000, true, &es);

        let payload = extract_payload(&out, VIDEO_PID);
        assert_eq!(&payload[0..4], &[0x00, 0x00, 0x01, STREAM_ID_VIDEO]);

        // Header data length at offset 8, ES follows
        let header_len = payload[8] as usize;
        let es_start = 9 + header_len;
        assert_eq!(&payload[es_start..es_start + es.len()], &es[..]);

        // PTS decodes back
        let pts_bytes = &payload[9..14];
        let pts = (((pts_bytes[0] as u64 >> 1) & 0x07) << 30)
            | ((pts_bytes[1] as u64) << 22)
            | (((pts_bytes[2] as u64 >> 1) & 0x7F) << 15)
            | ((pts_bytes[3] as u64) << 7)
            | ((pts_bytes[4] as u64 >> 1) & 0x7F);
        assert_eq!(pts, 90_000);
    }

    #[test]
    fn test_short_payload_is_stuffed_to_packet_boundary() {
        let mut writer = TsWriter::new(false);
        let mut out = BytesMut::new();
        writer.write_video(&mut out, 0, false, &[0xAB; 10]);

        assert_eq!(out.len(), PACKET_LEN);
        let payload = extract_payload(&out, VIDEO_PID);
        assert_eq!(&payload[payload.len() - 10..], &[0xAB; 10]);
    }

    #[test]
    fn test_continuity_counters_increment() {
        let mut writer = TsWriter::new(false);
        let mut out = BytesMut::new();
        let es = vec![0u8; 600];
        writer.write_video(&mut out, 0, false, &es);
        writer.write_video(&mut out, 3000, false, &es);

        let mut counters = Vec::new();
        for packet in out.chunks(PACKET_LEN) {
            let pid = u16::from_be_bytes([packet[1], packet[2]]) & 0x1FFF;
            if pid == VIDEO_PID {
                counters.push(packet[3] & 0x0F);
            }
        }
        for pair in counters.windows(2) {
            assert_eq!(pair[1], (pair[0] + 1) & 0x0F);
        }
    }

    #[test]
    fn test_keyframe_sets_random_access() {
        let mut writer = TsWriter::new(false);
        let mut out = BytesMut::new();
        writer.write_video(&mut out, 0, true, &[0; 32]);

        // First packet has adaptation with RAI and PCR flags
        assert_eq!((out[3] >> 4) & 0x03, 0x03);
        let flags = out[5];
        assert!(flags & 0x40 != 0, "random access indicator");
        assert!(flags & 0x10 != 0, "PCR flag");
    }

    #[test]
    fn test_crc32_mpeg2_vector() {
        // Known vector: CRC-32/MPEG-2 of "123456789"
        assert_eq!(crc32_mpeg2(b"123456789"), 0x0376_E6E7);
    }

    #[test]
    fn test_audio_pes_uses_audio_pid() {
        let mut writer = TsWriter::new(true);
        let mut out = BytesMut::new();
        writer.write_audio(&mut out, 1234, &[1, 2, 3, 4]);

        let payload = extract_payload(&out, AUDIO_PID);
        assert_eq!(&payload[0..4], &[0x00, 0x00, 0x01, STREAM_ID_AUDIO]);
        assert!(extract_payload(&out, VIDEO_PID).is_empty());
    }
}
