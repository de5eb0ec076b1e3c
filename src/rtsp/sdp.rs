//! SDP parsing and generation (RFC 4566).
//!
//! ANNOUNCE bodies from publishers are parsed into [`Track`]s; DESCRIBE
//! responses are generated from a stream's track list:
//!
//! ```text
//! v=0                                ← protocol version
//! o=- 0 0 IN IP4 <addr>              ← origin
//! s=<path>                           ← session name
//! c=IN IP4 <addr>                    ← connection address
//! t=0 0                              ← timing (live stream)
//! m=video 0 RTP/AVP 96               ← media description
//! a=rtpmap:96 H264/90000             ← codec/clock rate
//! a=fmtp:96 packetization-mode=1     ← codec parameters
//! a=control:trackID=0                ← track control suffix
//! ```

use crate::error::RtspError;

/// Media kind of one `m=` section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Application,
}

impl MediaKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "video" => Some(MediaKind::Video),
            "audio" => Some(MediaKind::Audio),
            "application" => Some(MediaKind::Application),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Application => "application",
        }
    }
}

/// One negotiated media track. Immutable after SDP negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub kind: MediaKind,
    pub payload_type: u8,
    /// RTP clock rate in Hz (90000 for video)
    pub clock_rate: u32,
    /// Encoding name from rtpmap, e.g. "H264"
    pub encoding: String,
    /// fmtp parameters, verbatim
    pub fmtp: Option<String>,
    /// Control suffix appended to the path URI, `trackID=<n>`
    pub control: String,
}

impl Track {
    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    pub fn is_h264(&self) -> bool {
        self.encoding.eq_ignore_ascii_case("H264")
    }
}

/// Parse an ANNOUNCE body into tracks.
///
/// Session-level lines are skipped; each `m=` section yields one track.
/// Control attributes from the publisher are discarded and replaced with
/// `trackID=<index>` so the server's URIs stay uniform.
pub fn parse_tracks(body: &str) -> Result<Vec<Track>, RtspError> {
    let malformed = |details: String| RtspError::Sdp { details };

    if !body.starts_with("v=0") {
        return Err(malformed("missing v=0".to_string()));
    }

    let mut tracks: Vec<Track> = Vec::new();
    let mut current: Option<Track> = None;

    for line in body.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        match key {
            "m" => {
                if let Some(track) = current.take() {
                    tracks.push(track);
                }

                // m=<media> <port> <proto> <fmt>
                let mut fields = value.split_whitespace();
                let kind = fields
                    .next()
                    .and_then(MediaKind::parse)
                    .ok_or_else(|| malformed(format!("bad media line: {:?}", line)))?;
                let payload_type = fields
                    .nth(2)
                    .and_then(|pt| pt.parse::<u8>().ok())
                    .ok_or_else(|| malformed(format!("bad payload type: {:?}", line)))?;

                current = Some(Track {
                    kind,
                    payload_type,
                    clock_rate: 0,
                    encoding: String::new(),
                    fmtp: None,
                    control: format!("trackID={}", tracks.len()),
                });
            }
            "a" => {
                let Some(track) = current.as_mut() else {
                    continue;
                };

                if let Some(rtpmap) = value.strip_prefix("rtpmap:") {
                    // rtpmap:<pt> <encoding>/<clock>[/<channels>]
                    let mut fields = rtpmap.split_whitespace();
                    let pt = fields.next().and_then(|pt| pt.parse::<u8>().ok());
                    if pt != Some(track.payload_type) {
                        continue;
                    }
                    let codec = fields
                        .next()
                        .ok_or_else(|| malformed(format!("bad rtpmap: {:?}", line)))?;
                    let mut codec_fields = codec.split('/');
                    track.encoding = codec_fields
                        .next()
                        .unwrap_or_default()
                        .to_string();
                    track.clock_rate = codec_fields
                        .next()
                        .and_then(|c| c.parse().ok())
                        .ok_or_else(|| malformed(format!("bad clock rate: {:?}", line)))?;
                } else if let Some(fmtp) = value.strip_prefix("fmtp:") {
                    if let Some((pt, params)) = fmtp.split_once(' ') {
                        if pt.parse::<u8>().ok() == Some(track.payload_type) {
                            track.fmtp = Some(params.to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(track) = current.take() {
        tracks.push(track);
    }

    if tracks.is_empty() {
        return Err(malformed("no media sections".to_string()));
    }
    for track in &tracks {
        if track.clock_rate == 0 {
            return Err(malformed(format!(
                "track {:?} has no rtpmap",
                track.control
            )));
        }
    }

    Ok(tracks)
}

/// Generate the DESCRIBE body for a track list
pub fn marshal_tracks(tracks: &[Track], host: &str, name: &str) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!("o=- 0 0 IN IP4 {}", host));
    sdp.push(format!("s={}", name));
    sdp.push(format!("c=IN IP4 {}", host));
    sdp.push("t=0 0".to_string());

    for track in tracks {
        sdp.push(format!(
            "m={} 0 RTP/AVP {}",
            track.kind.as_str(),
            track.payload_type
        ));
        sdp.push(format!(
            "a=rtpmap:{} {}/{}",
            track.payload_type, track.encoding, track.clock_rate
        ));
        if let Some(fmtp) = &track.fmtp {
            sdp.push(format!("a=fmtp:{} {}", track.payload_type, fmtp));
        }
        sdp.push(format!("a=control:{}", track.control));
    }

    format!("{}\r\n", sdp.join("\r\n"))
}
