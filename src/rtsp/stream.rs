//! In-memory fan-out of one publisher's RTP packets.
//!
//! A [`SharedStream`] distributes packets to every active reader of a path
//! and tracks per-track counters used for SSRC and RTP-Info reporting.
//! Fan-out takes the read lock; reader-set mutation takes the write lock.
//! The counters are lock-free atomics so readers never stall the publisher.

use crate::error::RtspError;
use crate::rtsp::rtp::RtpPacket;
use crate::rtsp::sdp::Track;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Packets a slow reader may queue before its session is closed
const READER_QUEUE_LEN: usize = 256;

/// One fanned-out media frame
#[derive(Debug, Clone)]
pub struct StreamData {
    pub track_id: usize,
    /// Raw RTP packet bytes, forwarded verbatim
    pub payload: Bytes,
}

#[derive(Debug, Default)]
struct TrackState {
    last_sequence_number: AtomicU32,
    last_time_rtp: AtomicU32,
    last_time_ntp: AtomicI64,
    last_ssrc: AtomicU32,
}

#[derive(Debug)]
struct ReaderHandle {
    sender: mpsc::Sender<StreamData>,
    active: bool,
}

/// The fan-out object for one source.
///
/// Tracks are immutable after creation. Readers are keyed by session id;
/// cross-references to sessions are never stored.
#[derive(Debug)]
pub struct SharedStream {
    tracks: Vec<Track>,
    track_states: Vec<TrackState>,
    readers: RwLock<HashMap<String, ReaderHandle>>,
}

impl SharedStream {
    pub fn new(tracks: Vec<Track>) -> Self {
        let track_states = tracks.iter().map(|_| TrackState::default()).collect();
        Self {
            tracks,
            track_states,
            readers: RwLock::new(HashMap::new()),
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Attach a reader. Readers start inactive and receive packets only
    /// after [`set_active`](Self::set_active).
    pub fn reader_add(&self, reader_id: &str) -> mpsc::Receiver<StreamData> {
        let (sender, receiver) = mpsc::channel(READER_QUEUE_LEN);
        let mut readers = self.readers.write();
        readers.insert(
            reader_id.to_string(),
            ReaderHandle {
                sender,
                active: false,
            },
        );
        debug!(reader_id, total = readers.len(), "reader attached");
        receiver
    }

    pub fn reader_remove(&self, reader_id: &str) {
        self.readers.write().remove(reader_id);
    }

    /// Start delivering packets to a reader (PLAY)
    pub fn reader_set_active(&self, reader_id: &str) {
        if let Some(handle) = self.readers.write().get_mut(reader_id) {
            handle.active = true;
        }
    }

    /// Stop delivering packets to a reader (PAUSE)
    pub fn reader_set_inactive(&self, reader_id: &str) {
        if let Some(handle) = self.readers.write().get_mut(reader_id) {
            handle.active = false;
        }
    }

    /// Drop every reader. Their receivers see end-of-stream and the owning
    /// sessions tear themselves down.
    pub fn close(&self) {
        let mut readers = self.readers.write();
        debug!(dropped = readers.len(), "stream closed");
        readers.clear();
    }

    pub fn reader_count(&self) -> usize {
        self.readers.read().len()
    }

    /// Distribute one RTP packet to all active readers.
    ///
    /// Counters are updated before fan-out. A reader whose queue is full is
    /// removed; dropping its sender ends its session with
    /// [`RtspError::ReaderOverflow`] on the reader side.
    pub fn write_rtp(&self, track_id: usize, packet: &RtpPacket) -> Result<(), RtspError> {
        let state = self
            .track_states
            .get(track_id)
            .ok_or(RtspError::TrackOutOfRange(track_id))?;

        state
            .last_sequence_number
            .store(packet.sequence_number as u32, Ordering::Relaxed);
        state
            .last_time_rtp
            .store(packet.timestamp, Ordering::Relaxed);
        state.last_time_ntp.store(unix_now(), Ordering::Relaxed);
        state.last_ssrc.store(packet.ssrc, Ordering::Relaxed);

        let data = StreamData {
            track_id,
            payload: packet.raw.clone(),
        };

        let mut overflowed: Vec<String> = Vec::new();
        {
            let readers = self.readers.read();
            for (id, handle) in readers.iter() {
                if !handle.active {
                    continue;
                }
                match handle.sender.try_send(data.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => overflowed.push(id.clone()),
                    // Receiver already gone, cleanup happens on teardown
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }

        if !overflowed.is_empty() {
            let mut readers = self.readers.write();
            for id in overflowed {
                warn!(reader_id = %id, "reader queue overflow, dropping reader");
                readers.remove(&id);
            }
        }

        Ok(())
    }

    pub fn ssrc(&self, track_id: usize) -> u32 {
        self.track_states[track_id].last_ssrc.load(Ordering::Relaxed)
    }

    pub fn last_sequence_number(&self, track_id: usize) -> u16 {
        self.track_states[track_id]
            .last_sequence_number
            .load(Ordering::Relaxed) as u16
    }

    /// Extrapolated RTP timestamp for RTP-Info: the last observed timestamp
    /// advanced by the wall-clock time since it was seen.
    pub fn timestamp(&self, track_id: usize) -> u32 {
        let state = &self.track_states[track_id];
        let last_rtp = state.last_time_rtp.load(Ordering::Relaxed);
        let last_ntp = state.last_time_ntp.load(Ordering::Relaxed);
        if last_rtp == 0 || last_ntp == 0 {
            return 0;
        }

        let elapsed = (unix_now() - last_ntp).max(0) as u64;
        let clock_rate = self.tracks[track_id].clock_rate as u64;
        (last_rtp as u64).wrapping_add(elapsed * clock_rate) as u32
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
