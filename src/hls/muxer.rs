//! Per-path HLS muxer.
//!
//! Consumes the RTP fan-out of one path, reassembles access units and
//! produces MPEG-TS segments in a bounded ring. Segment boundaries sit on
//! video keyframes once the minimum segment duration has elapsed; audio is
//! written into the same segment on the shared 90 kHz timeline. When the
//! ring is full the oldest segment is evicted, so memory stays bounded no
//! matter how long the path lives.

use crate::error::HlsError;
use crate::hls::aac::{AacConfig, AacDepacketizer};
use crate::hls::h264::{AccessUnit, H264Depacketizer};
use crate::hls::mpegts::TsWriter;
use crate::hls::playlist::{self, SegmentInfo};
use crate::rtsp::rtp::RtpPacket;
use crate::rtsp::sdp::Track;
use crate::rtsp::stream::{SharedStream, StreamData};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Keeps PTS positive regardless of small reordering at stream start
const PTS_OFFSET_90K: u64 = 90_000;

#[derive(Debug, Clone)]
pub struct MuxerConfig {
    pub segment_count: usize,
    pub min_segment_duration: Duration,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            segment_count: 5,
            min_segment_duration: Duration::from_secs(1),
        }
    }
}

/// One finished segment in the ring
#[derive(Debug, Clone)]
pub struct Segment {
    pub sequence: u64,
    pub duration: Duration,
    pub data: Bytes,
}

struct Ring {
    segments: VecDeque<Segment>,
    next_sequence: u64,
}

struct Pipeline {
    video_track: usize,
    video_depack: H264Depacketizer,
    audio: Option<(usize, AacDepacketizer, u32)>,
    segmenter: Segmenter,
}

pub struct HlsMuxer {
    path_name: String,
    config: MuxerConfig,
    pipeline: Mutex<Pipeline>,
    ring: RwLock<Ring>,
    /// Number of segments ever produced, for first-segment waiters
    produced: watch::Sender<u64>,
}

impl HlsMuxer {
    /// Build a muxer for a track set. Requires one H.264 video track;
    /// the first AAC audio track with a parseable config is multiplexed
    /// alongside it.
    pub fn new(path_name: &str, tracks: &[Track], config: MuxerConfig) -> Result<Arc<Self>, HlsError> {
        let video_track = tracks
            .iter()
            .position(|t| t.is_video() && t.is_h264())
            .ok_or_else(|| HlsError::UnsupportedPayload {
                details: format!("path {:?} has no H264 video track", path_name),
            })?;

        let audio = tracks.iter().enumerate().find_map(|(id, track)| {
            if track.is_video() {
                return None;
            }
            let fmtp = track.fmtp.as_deref()?;
            match AacConfig::parse(fmtp) {
                Ok(aac) => Some((id, AacDepacketizer::new(aac), track.clock_rate)),
                Err(err) => {
                    debug!(path = path_name, %err, "skipping audio track");
                    None
                }
            }
        });

        let has_audio = audio.is_some();
        let (produced, _) = watch::channel(0);

        Ok(Arc::new(Self {
            path_name: path_name.to_string(),
            pipeline: Mutex::new(Pipeline {
                video_track,
                video_depack: H264Depacketizer::new(),
                audio,
                segmenter: Segmenter::new(has_audio, &config),
            }),
            config,
            ring: RwLock::new(Ring {
                segments: VecDeque::new(),
                next_sequence: 0,
            }),
            produced,
        }))
    }

    /// Subscribe to the stream and mux until it closes or the token fires
    pub async fn run(self: Arc<Self>, stream: Arc<SharedStream>, token: CancellationToken) {
        let reader_id = format!("hls:{}", self.path_name);
        let mut receiver = stream.reader_add(&reader_id);
        stream.reader_set_active(&reader_id);
        info!(path = %self.path_name, "muxer started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                data = receiver.recv() => {
                    let Some(data) = data else { break };
                    self.handle_data(&data);
                }
            }
        }

        stream.reader_remove(&reader_id);
        info!(path = %self.path_name, "muxer stopped");
    }

    /// Feed one fanned-out RTP packet
    pub fn handle_data(&self, data: &StreamData) {
        let packet = match RtpPacket::parse(data.payload.clone()) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(path = %self.path_name, %err, "dropping packet");
                return;
            }
        };

        let mut pipeline = self.pipeline.lock();

        if data.track_id == pipeline.video_track {
            let units = match pipeline.video_depack.push(&packet) {
                Ok(units) => units,
                Err(err) => {
                    warn!(path = %self.path_name, %err, "video depacketization failed");
                    return;
                }
            };
            for unit in units {
                if let Some(segment) = pipeline.segmenter.push_video(&unit) {
                    drop(pipeline);
                    self.publish(segment);
                    pipeline = self.pipeline.lock();
                }
            }
        } else {
            let Some((audio_track, clock_rate)) =
                pipeline.audio.as_ref().map(|(track, _, clock)| (*track, *clock))
            else {
                return;
            };
            if data.track_id != audio_track {
                return;
            }

            let result = match pipeline.audio.as_mut() {
                Some((_, depack, _)) => depack.push(&packet),
                None => return,
            };
            match result {
                Ok(units) => {
                    pipeline
                        .segmenter
                        .push_audio(units.timestamp, clock_rate, &units.frames)
                }
                Err(err) => debug!(path = %self.path_name, %err, "audio depacketization failed"),
            }
        }
    }

    fn publish(&self, finished: FinishedSegment) {
        let mut ring = self.ring.write();
        let sequence = ring.next_sequence;
        ring.next_sequence += 1;

        ring.segments.push_back(Segment {
            sequence,
            duration: finished.duration,
            data: finished.data,
        });
        while ring.segments.len() > self.config.segment_count {
            let evicted = ring.segments.pop_front();
            if let Some(evicted) = evicted {
                debug!(path = %self.path_name, sequence = evicted.sequence, "segment evicted");
            }
        }
        drop(ring);

        self.produced.send_replace(sequence + 1);
        debug!(path = %self.path_name, sequence, "segment published");
    }

    /// Current playlist text, `None` until the first segment exists
    pub fn playlist(&self) -> Option<String> {
        let ring = self.ring.read();
        if ring.segments.is_empty() {
            return None;
        }
        let infos: Vec<SegmentInfo> = ring
            .segments
            .iter()
            .map(|s| SegmentInfo {
                sequence: s.sequence,
                duration: s.duration,
            })
            .collect();
        Some(playlist::render(&infos))
    }

    /// Segment bytes by media sequence, `None` once evicted
    pub fn segment(&self, sequence: u64) -> Option<Bytes> {
        self.ring
            .read()
            .segments
            .iter()
            .find(|s| s.sequence == sequence)
            .map(|s| s.data.clone())
    }

    pub fn segment_sequences(&self) -> Vec<u64> {
        self.ring.read().segments.iter().map(|s| s.sequence).collect()
    }

    /// Wait until at least one segment has been produced
    pub async fn wait_for_segment(&self, timeout: Duration) -> Result<(), HlsError> {
        let mut receiver = self.produced.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        while *receiver.borrow_and_update() == 0 {
            let changed = tokio::time::timeout_at(deadline, receiver.changed()).await;
            match changed {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => {
                    return Err(HlsError::MuxerTimeout {
                        path: self.path_name.clone(),
                        timeout,
                    })
                }
            }
        }
        Ok(())
    }
}

struct FinishedSegment {
    duration: Duration,
    data: Bytes,
}

/// Accumulates access units into one TS segment at a time
struct Segmenter {
    has_audio: bool,
    min_duration_90k: u64,
    writer: TsWriter,
    buf: BytesMut,
    /// 90 kHz timestamp of the first access unit overall (PTS epoch)
    epoch: Option<u32>,
    /// 90 kHz timestamp the open segment started at
    segment_start: Option<u32>,
    /// Epoch of the audio track in its own clock rate
    audio_epoch: Option<u32>,
    /// Cached parameter sets, prepended to keyframes that lack them
    sps_pps: Vec<Bytes>,
}

impl Segmenter {
    fn new(has_audio: bool, config: &MuxerConfig) -> Self {
        Self {
            has_audio,
            min_duration_90k: config.min_segment_duration.as_millis() as u64 * 90,
            writer: TsWriter::new(has_audio),
            buf: BytesMut::new(),
            epoch: None,
            segment_start: None,
            audio_epoch: None,
            sps_pps: Vec::new(),
        }
    }

    /// Feed one video access unit; returns a finished segment when the
    /// unit closes one.
    fn push_video(&mut self, unit: &AccessUnit) -> Option<FinishedSegment> {
        for nal in &unit.nals {
            if !nal.is_empty() && matches!(nal[0] & 0x1F, 7 | 8) {
                self.cache_parameter_set(nal.clone());
            }
        }

        let mut finished = None;

        if let Some(start) = self.segment_start {
            let elapsed = unit.timestamp.wrapping_sub(start) as u64;
            if unit.is_keyframe() && elapsed >= self.min_duration_90k {
                finished = Some(FinishedSegment {
                    duration: Duration::from_millis(elapsed / 90),
                    data: self.buf.split().freeze(),
                });
                self.segment_start = None;
            }
        }

        if self.segment_start.is_none() {
            // Segments must open on a keyframe; leading delta frames are
            // dropped.
            if !unit.is_keyframe() {
                return finished;
            }
            self.segment_start = Some(unit.timestamp);
            self.epoch.get_or_insert(unit.timestamp);
            self.writer = TsWriter::new(self.has_audio);
            self.writer.write_tables(&mut self.buf);
        }

        let pts = self.video_pts(unit.timestamp);
        let keyframe = unit.is_keyframe();
        let es = if keyframe && !unit.has_parameter_sets() && !self.sps_pps.is_empty() {
            let mut with_params = AccessUnit {
                timestamp: unit.timestamp,
                nals: self.sps_pps.clone(),
            };
            with_params.nals.extend(unit.nals.iter().cloned());
            with_params.annex_b()
        } else {
            unit.annex_b()
        };
        self.writer.write_video(&mut self.buf, pts, keyframe, &es);

        finished
    }

    /// Feed audio units; silently dropped until a segment is open
    fn push_audio(&mut self, timestamp: u32, clock_rate: u32, frames: &[Bytes]) {
        if self.segment_start.is_none() || clock_rate == 0 {
            return;
        }
        let epoch = *self.audio_epoch.get_or_insert(timestamp);
        let elapsed = timestamp.wrapping_sub(epoch) as u64;
        let pts = elapsed * 90_000 / clock_rate as u64 + PTS_OFFSET_90K;

        let mut es = BytesMut::new();
        for frame in frames {
            es.extend_from_slice(frame);
        }
        self.writer.write_audio(&mut self.buf, pts, &es);
    }

    fn video_pts(&self, timestamp: u32) -> u64 {
        let epoch = self.epoch.unwrap_or(timestamp);
        timestamp.wrapping_sub(epoch) as u64 + PTS_OFFSET_90K
    }

    fn cache_parameter_set(&mut self, nal: Bytes) {
        let nal_type = nal[0] & 0x1F;
        self.sps_pps
            .retain(|cached| cached[0] & 0x1F != nal_type);
        self.sps_pps.push(nal);
        self.sps_pps.sort_by_key(|nal| nal[0] & 0x1F);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtsp::sdp::parse_tracks;

    const CLOCK: u32 = 90_000;

    fn tracks() -> Vec<Track> {
        parse_tracks("v=0\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n").unwrap()
    }

    fn muxer(segment_count: usize) -> Arc<HlsMuxer> {
        HlsMuxer::new(
            "cam1",
            &tracks(),
            MuxerConfig {
                segment_count,
                min_segment_duration: Duration::from_secs(1),
            },
        )
        .unwrap()
    }

    fn video_packet(timestamp: u32, keyframe: bool) -> StreamData {
        let nal: u8 = if keyframe { 0x65 } else { 0x41 };
        let mut raw = vec![0u8; 12];
        raw[0] = 2 << 6;
        raw[1] = 96 | 0x80;
        raw[4..8].copy_from_slice(&timestamp.to_be_bytes());
        raw.extend_from_slice(&[nal, 0xAA, 0xBB]);
        StreamData {
            track_id: 0,
            payload: Bytes::from(raw),
        }
    }

    /// Two-second GOPs: each keyframe closes the previous segment
    fn feed_gops(muxer: &HlsMuxer, gops: u32) {
        for gop in 0..=gops {
            let base = gop * 2 * CLOCK;
            muxer.handle_data(&video_packet(base, true));
            muxer.handle_data(&video_packet(base + CLOCK / 2, false));
            muxer.handle_data(&video_packet(base + CLOCK, false));
        }
    }

    #[test]
    fn test_muxer_requires_h264() {
        let audio_only =
            parse_tracks("v=0\r\nm=audio 0 RTP/AVP 97\r\na=rtpmap:97 MPEG4-GENERIC/48000/2\r\n")
                .unwrap();
        assert!(HlsMuxer::new("x", &audio_only, MuxerConfig::default()).is_err());
    }

    #[test]
    fn test_segments_close_on_keyframes() {
        let muxer = muxer(5);
        feed_gops(&muxer, 2);

        let sequences = muxer.segment_sequences();
        assert_eq!(sequences, vec![0, 1]);

        let playlist = muxer.playlist().unwrap();
        assert!(playlist.contains("#EXTM3U"));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:0"));
        assert!(playlist.contains("#EXTINF:2.000000,\n0.ts"));

        // Segment data is TS-aligned and starts with a sync byte
        let segment = muxer.segment(0).unwrap();
        assert_eq!(segment.len() % 188, 0);
        assert_eq!(segment[0], 0x47);
    }

    #[test]
    fn test_ring_eviction() {
        let muxer = muxer(3);
        feed_gops(&muxer, 6);

        let sequences = muxer.segment_sequences();
        assert_eq!(sequences.len(), 3);
        assert_eq!(sequences, vec![3, 4, 5]);

        // Evicted segment is gone, playlist references only the ring
        assert!(muxer.segment(0).is_none());
        assert!(muxer.segment(3).is_some());
        let playlist = muxer.playlist().unwrap();
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:3"));
        assert!(!playlist.contains("\n0.ts"));
    }

    #[test]
    fn test_no_playlist_before_first_segment() {
        let muxer = muxer(5);
        assert!(muxer.playlist().is_none());

        // Delta frames before the first keyframe are dropped
        muxer.handle_data(&video_packet(0, false));
        muxer.handle_data(&video_packet(CLOCK, false));
        assert!(muxer.playlist().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_segment_times_out() {
        let muxer = muxer(5);
        let result = muxer.wait_for_segment(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(HlsError::MuxerTimeout { .. })));
    }

    #[tokio::test]
    async fn test_wait_for_segment_wakes() {
        let muxer = muxer(5);

        let waiter = {
            let muxer = Arc::clone(&muxer);
            tokio::spawn(async move { muxer.wait_for_segment(Duration::from_secs(5)).await })
        };

        feed_gops(&muxer, 1);
        waiter.await.unwrap().unwrap();
    }

    #[test]
    fn test_short_gop_does_not_split() {
        let muxer = muxer(5);

        // Keyframes 500 ms apart stay in one segment until the minimum
        // duration is reached.
        muxer.handle_data(&video_packet(0, true));
        muxer.handle_data(&video_packet(CLOCK / 2, true));
        assert!(muxer.segment_sequences().is_empty());

        muxer.handle_data(&video_packet(CLOCK, true));
        assert_eq!(muxer.segment_sequences(), vec![0]);
    }
}
