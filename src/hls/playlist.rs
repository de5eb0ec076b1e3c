//! Media playlist rendering and parsing.
//!
//! Rendering covers the sliding-window live playlist served at
//! `index.m3u8`. Parsing covers the one query the recorder needs: the
//! duration of the most recent keyframe interval, read from the
//! penultimate `#EXTINF` line.

use crate::error::HlsError;
use std::time::Duration;

/// Playlist entry for one segment in the ring
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentInfo {
    pub sequence: u64,
    pub duration: Duration,
}

/// Render the live playlist.
///
/// Target duration is the maximum observed segment duration rounded up to
/// whole seconds; the media sequence is the oldest segment still in the
/// ring.
pub fn render(segments: &[SegmentInfo]) -> String {
    let target = segments
        .iter()
        .map(|s| s.duration.as_secs_f64())
        .fold(0.0f64, f64::max)
        .ceil() as u64;
    let media_sequence = segments.first().map(|s| s.sequence).unwrap_or(0);

    let mut playlist = String::new();
    playlist.push_str("#EXTM3U\n");
    playlist.push_str("#EXT-X-VERSION:3\n");
    playlist.push_str("#EXT-X-ALLOW-CACHE:NO\n");
    playlist.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", target));
    playlist.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", media_sequence));

    for segment in segments {
        playlist.push_str(&format!("#EXTINF:{:.6},\n", segment.duration.as_secs_f64()));
        playlist.push_str(&format!("{}.ts\n", segment.sequence));
    }

    playlist
}

/// Duration of the newest complete keyframe interval in a playlist.
///
/// The penultimate line is the `#EXTINF` of the last listed segment:
///
/// ```text
/// #EXTINF:3.500000,
/// 11.ts
/// ```
///
/// yields 3500 ms. Used to align recording start times.
pub fn keyframe_duration(playlist: &str) -> Result<Duration, HlsError> {
    let malformed = |details: String| HlsError::PlaylistParse { details };

    let lines: Vec<&str> = playlist.trim().lines().collect();
    if lines.len() < 2 {
        return Err(malformed(format!("too few lines: {}", lines.len())));
    }

    let line = lines[lines.len() - 2];
    let value = line
        .strip_prefix("#EXTINF:")
        .ok_or_else(|| malformed(format!("not an EXTINF line: {:?}", line)))?
        .trim_end_matches(',');

    let seconds: f64 = value
        .parse()
        .map_err(|_| malformed(format!("bad duration: {:?}", value)))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(malformed(format!("bad duration: {:?}", value)));
    }

    Ok(Duration::from_millis((seconds * 1000.0).round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_playlist() {
        let segments = vec![
            SegmentInfo {
                sequence: 251,
                duration: Duration::from_millis(4250),
            },
            SegmentInfo {
                sequence: 252,
                duration: Duration::from_millis(3500),
            },
        ];

        let playlist = render(&segments);
        assert!(playlist.starts_with("#EXTM3U\n"));
        assert!(playlist.contains("#EXT-X-VERSION:3\n"));
        assert!(playlist.contains("#EXT-X-TARGETDURATION:5\n"));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:251\n"));
        assert!(playlist.contains("#EXTINF:4.250000,\n251.ts\n"));
        assert!(playlist.contains("#EXTINF:3.500000,\n252.ts\n"));
    }

    #[test]
    fn test_render_empty() {
        let playlist = render(&[]);
        assert!(playlist.contains("#EXT-X-TARGETDURATION:0\n"));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:0\n"));
    }

    #[test]
    fn test_keyframe_duration() {
        let playlist = "#EXTM3U\n\
            #EXT-X-VERSION:3\n\
            #EXT-X-ALLOW-CACHE:NO\n\
            #EXT-X-TARGETDURATION:2\n\
            #EXT-X-MEDIA-SEQUENCE:251\n\
            #EXTINF:4.250000,\n\
            10.ts\n\
            #EXTINF:3.500000,\n\
            11.ts\n";

        assert_eq!(
            keyframe_duration(playlist).unwrap(),
            Duration::from_millis(3500)
        );
    }

    #[test]
    fn test_keyframe_duration_spec_value() {
        let playlist = "#EXTINF:4.250000,\n10.ts\n";
        assert_eq!(
            keyframe_duration(playlist).unwrap(),
            Duration::from_millis(4250)
        );
    }

    #[test]
    fn test_keyframe_duration_too_few_lines() {
        assert!(keyframe_duration("").is_err());
        assert!(keyframe_duration("10.ts\n").is_err());
    }

    #[test]
    fn test_keyframe_duration_malformed() {
        assert!(keyframe_duration("#EXTINF:abc,\n10.ts\n").is_err());
        assert!(keyframe_duration("not-extinf\n10.ts\n").is_err());
    }

    #[test]
    fn test_render_parse_round_trip() {
        let segments = vec![SegmentInfo {
            sequence: 7,
            duration: Duration::from_millis(1234),
        }];
        let playlist = render(&segments);
        assert_eq!(
            keyframe_duration(&playlist).unwrap(),
            Duration::from_millis(1234)
        );
    }
}
