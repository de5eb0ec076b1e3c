//! RTSP session state machine (RFC 2326 subset).
//!
//! One session per control connection, created lazily and addressed by an
//! 8-char id after the first SETUP:
//!
//! ```text
//! ANNOUNCE      Initial   -> Initial   (tracks recorded, slot reserved)
//! SETUP         Initial   -> Prepared
//! PLAY          Prepared  -> Playing
//! RECORD        Prepared  -> Recording (publishers only)
//! PAUSE         Playing   -> Prepared
//! TEARDOWN      any       -> Closed
//! ```
//!
//! The session stores its path by name; every cross-component call goes
//! through the [`PathManager`].

use crate::auth::{AuthDecision, Authenticator};
use crate::error::{PathError, RtspError};
use crate::path::PathManager;
use crate::rtsp::message::{Method, Request, Response, StatusCode};
use crate::rtsp::rtp::{is_rtcp, RtpPacket};
use crate::rtsp::sdp;
use crate::rtsp::stream::{SharedStream, StreamData};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    Prepared,
    Playing,
    Recording,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Initial => "Initial",
            SessionState::Prepared => "Prepared",
            SessionState::Playing => "Playing",
            SessionState::Recording => "Recording",
            SessionState::Closed => "Closed",
        }
    }
}

/// Negotiated transport for one track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackTransport {
    Interleaved { rtp: u8, rtcp: u8 },
    Udp { rtp: SocketAddr, rtcp: SocketAddr },
}

/// Side-effect the connection loop must carry out after a request
#[derive(Debug)]
pub enum SessionAction {
    /// PLAY accepted: consume this receiver and forward to the client
    StartForwarding(mpsc::Receiver<StreamData>),
    /// TEARDOWN accepted: close the connection after responding
    Teardown,
}

/// Server-wide session id registry. Ids are unique per server for the
/// lifetime of their session.
pub struct SessionRegistry {
    ids: Mutex<HashSet<String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            ids: Mutex::new(HashSet::new()),
        }
    }

    fn new_id(&self) -> String {
        let mut ids = self.ids.lock();
        loop {
            let id = format!("{:08x}", rand::rng().random::<u32>());
            if ids.insert(id.clone()) {
                return id;
            }
        }
    }

    fn release(&self, id: &str) {
        self.ids.lock().remove(id);
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Session {
    manager: Arc<PathManager>,
    auth: Arc<dyn Authenticator>,
    registry: Arc<SessionRegistry>,
    peer: SocketAddr,
    timeout_secs: u64,
    /// Local UDP (rtp, rtcp) ports advertised to UDP readers
    udp_server_ports: Option<(u16, u16)>,

    state: SessionState,
    id: Option<String>,
    path_name: Option<String>,
    /// Tracks announced by a publisher, before RECORD
    announced: Option<Vec<sdp::Track>>,
    stream: Option<Arc<SharedStream>>,
    transports: HashMap<usize, TrackTransport>,
    /// Publisher ingest: interleaved RTP channel → track
    channel_to_track: HashMap<u8, usize>,
    /// Reader receiver, parked between SETUP and PLAY
    pending_receiver: Option<mpsc::Receiver<StreamData>>,
}

impl Session {
    pub fn new(
        manager: Arc<PathManager>,
        auth: Arc<dyn Authenticator>,
        registry: Arc<SessionRegistry>,
        peer: SocketAddr,
        timeout_secs: u64,
        udp_server_ports: Option<(u16, u16)>,
    ) -> Self {
        Self {
            manager,
            auth,
            registry,
            peer,
            timeout_secs,
            udp_server_ports,
            state: SessionState::Initial,
            id: None,
            path_name: None,
            announced: None,
            stream: None,
            transports: HashMap::new(),
            channel_to_track: HashMap::new(),
            pending_receiver: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn is_publisher(&self) -> bool {
        self.announced.is_some()
    }

    /// Negotiated transports, snapshotted by the connection loop when
    /// forwarding starts
    pub fn transports(&self) -> HashMap<usize, TrackTransport> {
        self.transports.clone()
    }

    /// Handle one request, producing the response and an optional action
    /// for the connection loop.
    pub fn handle_request(&mut self, req: &Request) -> (Response, Option<SessionAction>) {
        let cseq = match req.cseq() {
            Some(cseq) => cseq.to_string(),
            None => {
                return (
                    Response::new(StatusCode::BadRequest).header("CSeq", "0"),
                    None,
                )
            }
        };

        // Session id, once assigned, must match on every request.
        if let (Some(own), Some(sent)) = (self.id.as_deref(), req.session_id()) {
            if own != sent {
                return (
                    Response::new(StatusCode::SessionNotFound).header("CSeq", &cseq),
                    None,
                );
            }
        }

        if let Some(denied) = self.check_auth(req) {
            return (denied.header("CSeq", &cseq), None);
        }

        let (response, action) = match req.method {
            Method::Options => (
                Response::ok().header("Public", Method::public_header()),
                None,
            ),
            Method::Describe => (self.on_describe(req), None),
            Method::Announce => (self.on_announce(req), None),
            Method::Setup => (self.on_setup(req), None),
            Method::Play => self.on_play(req),
            Method::Record => (self.on_record(req), None),
            Method::Pause => (self.on_pause(), None),
            Method::Teardown => {
                self.teardown();
                (Response::ok(), Some(SessionAction::Teardown))
            }
            // Keep-alive; parameters themselves are not supported
            Method::GetParameter | Method::SetParameter => (Response::ok(), None),
        };

        let mut response = response.header("CSeq", &cseq);
        if let Some(id) = &self.id {
            response = response.header("Session", &format!("{};timeout={}", id, self.timeout_secs));
        }
        (response, action)
    }

    /// Feed one interleaved media frame from a publisher into the path
    pub fn handle_data(&mut self, channel: u8, payload: Bytes) -> Result<(), RtspError> {
        if self.state != SessionState::Recording {
            return Ok(());
        }

        let Some(&track_id) = self.channel_to_track.get(&channel) else {
            // RTCP arrives on channel+1 and is not redistributed
            if is_rtcp(&payload) {
                return Ok(());
            }
            return Err(RtspError::UnknownChannel { channel });
        };

        let stream = self.stream.as_ref().ok_or_else(|| RtspError::Parse {
            details: "recording without a stream".to_string(),
        })?;

        match RtpPacket::parse(payload) {
            Ok(packet) => stream.write_rtp(track_id, &packet),
            Err(err) => {
                // One bad packet does not end the session
                debug!(channel, %err, "dropping malformed RTP packet");
                Ok(())
            }
        }
    }

    /// Release everything the session holds. Safe to call twice; the
    /// connection loop also calls it on socket errors.
    pub fn teardown(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;

        if let (Some(path), Some(id)) = (self.path_name.as_deref(), self.id.as_deref()) {
            if self.is_publisher() {
                self.manager.publisher_remove(path, id);
            } else if let Some(stream) = &self.stream {
                stream.reader_remove(id);
            }
        }
        if let Some(id) = self.id.take() {
            self.registry.release(&id);
        }
        self.stream = None;
        self.pending_receiver = None;
        debug!(peer = %self.peer, "session closed");
    }

    fn check_auth(&self, req: &Request) -> Option<Response> {
        let path = req.path()?;
        let (path, _) = split_track_suffix(path);
        if path.is_empty() {
            return None;
        }

        match self
            .auth
            .validate(path, req.method.as_str(), req.credentials().as_ref())
        {
            AuthDecision::Allow => None,
            AuthDecision::Unauthenticated => Some(Response::new(StatusCode::Unauthorized)),
            AuthDecision::Forbidden => Some(Response::new(StatusCode::Forbidden)),
        }
    }

    fn on_describe(&mut self, req: &Request) -> Response {
        let Some(path) = req.path().filter(|p| !p.is_empty()) else {
            return Response::new(StatusCode::BadRequest);
        };

        match self.manager.on_describe(path) {
            Ok(stream) => {
                let body = sdp::marshal_tracks(stream.tracks(), &self.peer.ip().to_string(), path);
                Response::ok()
                    .header("Content-Base", &format!("{}/", req.uri))
                    .body("application/sdp", Bytes::from(body))
            }
            Err(PathError::NotExist) | Err(PathError::NoOnePublishing) => {
                Response::new(StatusCode::NotFound)
            }
            Err(_) => Response::new(StatusCode::BadRequest),
        }
    }

    fn on_announce(&mut self, req: &Request) -> Response {
        if self.state != SessionState::Initial || self.announced.is_some() {
            return self.invalid_state(Method::Announce);
        }
        let Some(path) = req.path().filter(|p| !p.is_empty()) else {
            return Response::new(StatusCode::BadRequest);
        };

        let body = match std::str::from_utf8(&req.body) {
            Ok(body) => body,
            Err(_) => return Response::new(StatusCode::BadRequest),
        };
        let tracks = match sdp::parse_tracks(body) {
            Ok(tracks) => tracks,
            Err(err) => {
                debug!(%err, "rejecting ANNOUNCE");
                return Response::new(StatusCode::BadRequest);
            }
        };

        // The slot is reserved now so a second publisher fails fast, but
        // the stream goes live only on RECORD.
        let id = self.ensure_id();
        match self.manager.publisher_add(path, &id) {
            Ok(_) => {}
            Err(PathError::NotExist) => return Response::new(StatusCode::NotFound),
            Err(_) => return Response::new(StatusCode::BadRequest),
        }

        info!(path, tracks = tracks.len(), "publisher announced");
        self.path_name = Some(path.to_string());
        self.announced = Some(tracks);
        Response::ok()
    }

    fn on_setup(&mut self, req: &Request) -> Response {
        if !matches!(self.state, SessionState::Initial | SessionState::Prepared) {
            return self.invalid_state(Method::Setup);
        }

        let Some(full_path) = req.path().filter(|p| !p.is_empty()) else {
            return Response::new(StatusCode::BadRequest);
        };
        let (path, track_id) = split_track_suffix(full_path);
        let track_id = track_id.unwrap_or(0);

        if let Some(existing) = self.path_name.as_deref() {
            if existing != path {
                return Response::new(StatusCode::BadRequest);
            }
        }

        let Some(transport_header) = req.header("Transport") else {
            return Response::new(StatusCode::BadRequest);
        };
        let transport = match parse_transport(transport_header, self.peer) {
            Ok(transport) => transport,
            Err(err) => {
                debug!(%err, "rejecting Transport header");
                return Response::new(StatusCode::UnsupportedTransport);
            }
        };

        // Publishers may only record over the control connection.
        if self.is_publisher() && !matches!(transport, TrackTransport::Interleaved { .. }) {
            return Response::new(StatusCode::UnsupportedTransport);
        }

        let announced_count = self.announced.as_ref().map(|tracks| tracks.len());
        let track_count = if let Some(count) = announced_count {
            count
        } else {
            // Reader: bind to the live stream on first SETUP.
            if self.stream.is_none() {
                let id = self.ensure_id();
                match self.manager.reader_add(path, &id) {
                    Ok(stream) => {
                        self.pending_receiver = Some(stream.reader_add(&id));
                        self.stream = Some(stream);
                        self.path_name = Some(path.to_string());
                    }
                    Err(PathError::NotExist) | Err(PathError::NoOnePublishing) => {
                        return Response::new(StatusCode::NotFound)
                    }
                    Err(_) => return Response::new(StatusCode::BadRequest),
                }
            }
            self.stream.as_ref().map(|s| s.tracks().len()).unwrap_or(0)
        };

        if track_id >= track_count {
            return Response::new(StatusCode::BadRequest);
        }

        if let TrackTransport::Interleaved { rtp, rtcp } = transport {
            self.channel_to_track.insert(rtp, track_id);
            // rtcp channel maps to no track; handle_data ignores it
            let _ = rtcp;
        }
        self.transports.insert(track_id, transport);
        self.ensure_id();
        self.state = SessionState::Prepared;

        Response::ok().header(
            "Transport",
            &transport_reply(transport, self.udp_server_ports),
        )
    }

    fn on_play(&mut self, req: &Request) -> (Response, Option<SessionAction>) {
        if self.state != SessionState::Prepared || self.is_publisher() {
            return (self.invalid_state(Method::Play), None);
        }
        let (Some(stream), Some(id)) = (self.stream.clone(), self.id.clone()) else {
            return (self.invalid_state(Method::Play), None);
        };
        let Some(receiver) = self.pending_receiver.take() else {
            return (self.invalid_state(Method::Play), None);
        };

        stream.reader_set_active(&id);
        self.state = SessionState::Playing;

        let rtp_info = self
            .transports
            .keys()
            .map(|&track_id| {
                format!(
                    "url={}/trackID={};seq={};rtptime={}",
                    req.uri.trim_end_matches('/'),
                    track_id,
                    stream.last_sequence_number(track_id).wrapping_add(1),
                    stream.timestamp(track_id),
                )
            })
            .collect::<Vec<_>>()
            .join(",");

        info!(path = self.path_name.as_deref().unwrap_or(""), session_id = %id, "reader playing");
        (
            Response::ok().header("RTP-Info", &rtp_info),
            Some(SessionAction::StartForwarding(receiver)),
        )
    }

    fn on_record(&mut self, req: &Request) -> Response {
        let _ = req;
        if self.state != SessionState::Prepared || !self.is_publisher() {
            return self.invalid_state(Method::Record);
        }
        let (Some(path), Some(id)) = (self.path_name.clone(), self.id.clone()) else {
            return self.invalid_state(Method::Record);
        };
        let tracks = self.announced.clone().unwrap_or_default();

        match self.manager.publisher_start(&path, &id, tracks) {
            Ok(stream) => {
                self.stream = Some(stream);
                self.state = SessionState::Recording;
                info!(path = %path, session_id = %id, "publisher recording");
                Response::ok()
            }
            Err(PathError::NotExist) => Response::new(StatusCode::NotFound),
            Err(_) => Response::new(StatusCode::BadRequest),
        }
    }

    fn on_pause(&mut self) -> Response {
        if self.state != SessionState::Playing {
            return self.invalid_state(Method::Pause);
        }
        if let (Some(stream), Some(id)) = (&self.stream, self.id.as_deref()) {
            stream.reader_set_inactive(id);
        }
        self.state = SessionState::Prepared;
        Response::ok()
    }

    fn invalid_state(&self, method: Method) -> Response {
        warn!(
            method = %method,
            state = self.state.as_str(),
            "method not valid in state"
        );
        Response::new(StatusCode::BadRequest)
    }

    fn ensure_id(&mut self) -> String {
        if let Some(id) = &self.id {
            return id.clone();
        }
        let id = self.registry.new_id();
        self.id = Some(id.clone());
        id
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Split `<path>/trackID=N` into path and track id
fn split_track_suffix(full: &str) -> (&str, Option<usize>) {
    match full.rsplit_once('/') {
        Some((path, suffix)) => match suffix.strip_prefix("trackID=") {
            Some(n) => (path, n.parse().ok()),
            None => (full, None),
        },
        None => (full, None),
    }
}

/// Parse a Transport header into a negotiated transport.
///
/// Accepted forms: `RTP/AVP/TCP;...;interleaved=i-j` and
/// `RTP/AVP;unicast;client_port=p1-p2`.
fn parse_transport(header: &str, peer: SocketAddr) -> Result<TrackTransport, RtspError> {
    let rejected = |details: String| RtspError::Transport { details };

    let mut fields = header.split(';');
    let protocol = fields.next().unwrap_or_default().trim();

    let parse_pair = |value: &str| -> Option<(u16, u16)> {
        let (a, b) = value.split_once('-')?;
        Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
    };

    match protocol {
        "RTP/AVP/TCP" => {
            for field in fields {
                if let Some(value) = field.trim().strip_prefix("interleaved=") {
                    let (rtp, rtcp) =
                        parse_pair(value).ok_or_else(|| rejected(format!("bad interleaved: {:?}", value)))?;
                    if rtcp != rtp + 1 || rtp > u8::MAX as u16 {
                        return Err(rejected(format!("bad channel pair {}-{}", rtp, rtcp)));
                    }
                    return Ok(TrackTransport::Interleaved {
                        rtp: rtp as u8,
                        rtcp: rtcp as u8,
                    });
                }
            }
            Err(rejected("missing interleaved channels".to_string()))
        }
        "RTP/AVP" | "RTP/AVP/UDP" => {
            for field in fields {
                if let Some(value) = field.trim().strip_prefix("client_port=") {
                    let (rtp, rtcp) =
                        parse_pair(value).ok_or_else(|| rejected(format!("bad client_port: {:?}", value)))?;
                    return Ok(TrackTransport::Udp {
                        rtp: SocketAddr::new(peer.ip(), rtp),
                        rtcp: SocketAddr::new(peer.ip(), rtcp),
                    });
                }
            }
            Err(rejected("missing client_port".to_string()))
        }
        other => Err(rejected(format!("unsupported protocol: {:?}", other))),
    }
}

/// Transport header echoed in the SETUP response
fn transport_reply(transport: TrackTransport, server_ports: Option<(u16, u16)>) -> String {
    match transport {
        TrackTransport::Interleaved { rtp, rtcp } => {
            format!("RTP/AVP/TCP;unicast;interleaved={}-{}", rtp, rtcp)
        }
        TrackTransport::Udp { rtp, rtcp } => {
            let mut reply = format!(
                "RTP/AVP;unicast;client_port={}-{}",
                rtp.port(),
                rtcp.port()
            );
            if let Some((server_rtp, server_rtcp)) = server_ports {
                reply.push_str(&format!(";server_port={}-{}", server_rtp, server_rtcp));
            }
            reply
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::path::{NullObserver, PathConfig, PathManager};
    use crate::rtsp::message::{Codec, Incoming};
    use tokio_util::codec::Decoder;
    use tokio_util::sync::CancellationToken;

    const SDP: &str = "v=0\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n";

    fn peer() -> SocketAddr {
        "192.168.1.20:51000".parse().unwrap()
    }

    fn new_manager() -> Arc<PathManager> {
        Arc::new(PathManager::new(
            "127.0.0.1",
            8554,
            8888,
            Arc::new(NullObserver),
        ))
    }

    fn new_session(manager: &Arc<PathManager>) -> Session {
        Session::new(
            Arc::clone(manager),
            Arc::new(AllowAll),
            Arc::new(SessionRegistry::new()),
            peer(),
            60,
            None,
        )
    }

    fn request(raw: &str) -> Request {
        let mut codec = Codec;
        let mut buf = bytes::BytesMut::from(raw.as_bytes());
        match codec.decode(&mut buf).unwrap().unwrap() {
            Incoming::Request(req) => req,
            _ => panic!("expected request"),
        }
    }

    fn announce(path: &str) -> Request {
        request(&format!(
            "ANNOUNCE rtsp://127.0.0.1:8554/{} RTSP/1.0\r\nCSeq: 1\r\n\
             Content-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{}",
            path,
            SDP.len(),
            SDP
        ))
    }

    fn setup(path: &str, session: Option<&str>) -> Request {
        let session_header = session
            .map(|id| format!("Session: {}\r\n", id))
            .unwrap_or_default();
        request(&format!(
            "SETUP rtsp://127.0.0.1:8554/{}/trackID=0 RTSP/1.0\r\nCSeq: 2\r\n{}\
             Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
            path, session_header
        ))
    }

    /// ANNOUNCE → SETUP → RECORD, returns the publishing session
    fn start_publisher(manager: &Arc<PathManager>, path: &str) -> Session {
        let mut publisher = new_session(manager);
        let (resp, _) = publisher.handle_request(&announce(path));
        assert_eq!(resp.status, StatusCode::Ok);
        let (resp, _) = publisher.handle_request(&setup(path, None));
        assert_eq!(resp.status, StatusCode::Ok);
        let (resp, _) = publisher.handle_request(&request(&format!(
            "RECORD rtsp://127.0.0.1:8554/{} RTSP/1.0\r\nCSeq: 3\r\n\r\n",
            path
        )));
        assert_eq!(resp.status, StatusCode::Ok);
        assert_eq!(publisher.state(), SessionState::Recording);
        publisher
    }

    fn rtp_frame(seq: u16) -> Bytes {
        let mut raw = vec![0u8; 12];
        raw[0] = 2 << 6;
        raw[1] = 96;
        raw[2..4].copy_from_slice(&seq.to_be_bytes());
        raw[8..12].copy_from_slice(&7u32.to_be_bytes());
        Bytes::from(raw)
    }

    #[tokio::test]
    async fn test_publish_subscribe_flow() {
        let manager = new_manager();
        manager
            .add_path(CancellationToken::new(), "p1", PathConfig::default())
            .unwrap();

        let mut publisher = start_publisher(&manager, "p1");

        // Reader sees the publisher's SDP
        let mut reader = new_session(&manager);
        let (resp, _) = reader.handle_request(&request(
            "DESCRIBE rtsp://127.0.0.1:8554/p1 RTSP/1.0\r\nCSeq: 1\r\n\r\n",
        ));
        assert_eq!(resp.status, StatusCode::Ok);
        assert!(std::str::from_utf8(&resp.body)
            .unwrap()
            .contains("a=rtpmap:96 H264/90000"));

        // Reader SETUP + PLAY, then receives the next published packet
        let (resp, _) = reader.handle_request(&setup("p1", None));
        assert_eq!(resp.status, StatusCode::Ok);
        let (resp, action) = reader.handle_request(&request(
            "PLAY rtsp://127.0.0.1:8554/p1 RTSP/1.0\r\nCSeq: 3\r\n\r\n",
        ));
        assert_eq!(resp.status, StatusCode::Ok);
        let Some(SessionAction::StartForwarding(mut receiver)) = action else {
            panic!("expected forwarding action");
        };

        publisher.handle_data(0, rtp_frame(77)).unwrap();
        let data = receiver.recv().await.unwrap();
        assert_eq!(
            RtpPacket::parse(data.payload).unwrap().sequence_number,
            77
        );

        // Publisher teardown → next DESCRIBE is 404
        publisher.teardown();
        let mut reader2 = new_session(&manager);
        let (resp, _) = reader2.handle_request(&request(
            "DESCRIBE rtsp://127.0.0.1:8554/p1 RTSP/1.0\r\nCSeq: 1\r\n\r\n",
        ));
        assert_eq!(resp.status, StatusCode::NotFound);
    }

    #[tokio::test]
    async fn test_duplicate_publisher_rejected() {
        let manager = new_manager();
        manager
            .add_path(CancellationToken::new(), "p1", PathConfig::default())
            .unwrap();

        let _publisher = start_publisher(&manager, "p1");

        let mut second = new_session(&manager);
        let (resp, _) = second.handle_request(&announce("p1"));
        assert_eq!(resp.status, StatusCode::BadRequest);
    }

    #[tokio::test]
    async fn test_describe_unknown_path() {
        let manager = new_manager();
        let mut session = new_session(&manager);
        let (resp, _) = session.handle_request(&request(
            "DESCRIBE rtsp://127.0.0.1:8554/ghost RTSP/1.0\r\nCSeq: 1\r\n\r\n",
        ));
        assert_eq!(resp.status, StatusCode::NotFound);
    }

    #[tokio::test]
    async fn test_session_id_mismatch() {
        let manager = new_manager();
        manager
            .add_path(CancellationToken::new(), "p1", PathConfig::default())
            .unwrap();
        let _publisher = start_publisher(&manager, "p1");

        let mut reader = new_session(&manager);
        let (resp, _) = reader.handle_request(&setup("p1", None));
        assert_eq!(resp.status, StatusCode::Ok);

        let (resp, _) = reader.handle_request(&request(
            "PLAY rtsp://127.0.0.1:8554/p1 RTSP/1.0\r\nCSeq: 3\r\nSession: deadbeef\r\n\r\n",
        ));
        assert_eq!(resp.status, StatusCode::SessionNotFound);
        // Prior state is preserved
        assert_eq!(reader.state(), SessionState::Prepared);
    }

    #[tokio::test]
    async fn test_play_in_initial_state_rejected() {
        let manager = new_manager();
        let mut session = new_session(&manager);
        let (resp, _) = session.handle_request(&request(
            "PLAY rtsp://127.0.0.1:8554/p1 RTSP/1.0\r\nCSeq: 1\r\n\r\n",
        ));
        assert_eq!(resp.status, StatusCode::BadRequest);
        assert_eq!(session.state(), SessionState::Initial);
    }

    #[tokio::test]
    async fn test_udp_record_rejected() {
        let manager = new_manager();
        manager
            .add_path(CancellationToken::new(), "p1", PathConfig::default())
            .unwrap();

        let mut publisher = new_session(&manager);
        let (resp, _) = publisher.handle_request(&announce("p1"));
        assert_eq!(resp.status, StatusCode::Ok);

        let (resp, _) = publisher.handle_request(&request(
            "SETUP rtsp://127.0.0.1:8554/p1/trackID=0 RTSP/1.0\r\nCSeq: 2\r\n\
             Transport: RTP/AVP;unicast;client_port=8000-8001\r\n\r\n",
        ));
        assert_eq!(resp.status, StatusCode::UnsupportedTransport);
    }

    #[tokio::test]
    async fn test_teardown_releases_session_id() {
        let manager = new_manager();
        manager
            .add_path(CancellationToken::new(), "p1", PathConfig::default())
            .unwrap();

        let registry = Arc::new(SessionRegistry::new());
        let mut publisher = Session::new(
            Arc::clone(&manager),
            Arc::new(AllowAll),
            Arc::clone(&registry),
            peer(),
            60,
            None,
        );
        let (resp, _) = publisher.handle_request(&announce("p1"));
        assert_eq!(resp.status, StatusCode::Ok);
        assert_eq!(registry.len(), 1);

        let (_, action) = publisher.handle_request(&request(
            "TEARDOWN rtsp://127.0.0.1:8554/p1 RTSP/1.0\r\nCSeq: 2\r\n\r\n",
        ));
        assert!(matches!(action, Some(SessionAction::Teardown)));
        assert!(registry.is_empty());

        // Path is free for a new publisher
        assert!(manager.publisher_add("p1", "other").is_ok());
    }

    #[test]
    fn test_parse_transport_forms() {
        let peer = peer();

        assert_eq!(
            parse_transport("RTP/AVP/TCP;unicast;interleaved=2-3", peer).unwrap(),
            TrackTransport::Interleaved { rtp: 2, rtcp: 3 }
        );
        assert_eq!(
            parse_transport("RTP/AVP;unicast;client_port=8000-8001", peer).unwrap(),
            TrackTransport::Udp {
                rtp: "192.168.1.20:8000".parse().unwrap(),
                rtcp: "192.168.1.20:8001".parse().unwrap(),
            }
        );
        assert!(parse_transport("RTP/AVP/TCP;unicast", peer).is_err());
        assert!(parse_transport("RTP/AVP/TCP;interleaved=0-2", peer).is_err());
        assert!(parse_transport("HTTP/1.1", peer).is_err());
    }

    #[test]
    fn test_split_track_suffix() {
        assert_eq!(split_track_suffix("cam1/trackID=2"), ("cam1", Some(2)));
        assert_eq!(split_track_suffix("cam1"), ("cam1", None));
        assert_eq!(split_track_suffix("a/b"), ("a/b", None));
    }
}
