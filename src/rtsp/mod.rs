//! Embedded RTSP 1.0 server.
//!
//! Cameras publish here and readers (HLS muxer feeds, external pullers)
//! subscribe. Each accepted connection runs a read loop and a writer task;
//! media for TCP-interleaved readers shares the control socket, UDP
//! readers get packets from a per-connection socket pair.

pub mod message;
pub mod rtp;
pub mod sdp;
pub mod session;
pub mod stream;

use crate::auth::Authenticator;
use crate::error::{NvrError, Result};
use crate::path::PathManager;
use futures::{SinkExt, StreamExt};
use message::{Codec, Incoming, Outgoing};
use session::{Session, SessionAction, SessionRegistry, TrackTransport};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Writer queue depth per connection. Slow readers are already bounded at
/// the stream fan-out, this only absorbs response/data interleaving.
const WRITER_QUEUE_LEN: usize = 64;

pub struct RtspServer {
    listener: TcpListener,
    manager: Arc<PathManager>,
    auth: Arc<dyn Authenticator>,
    registry: Arc<SessionRegistry>,
    session_timeout: Duration,
}

impl RtspServer {
    /// Bind the listener. Serving starts with [`run`](Self::run).
    pub async fn bind(
        port: u16,
        manager: Arc<PathManager>,
        auth: Arc<dyn Authenticator>,
        session_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(NvrError::Io)?;
        info!(addr = %listener.local_addr().map_err(NvrError::Io)?, "RTSP server listening");

        Ok(Self {
            listener,
            manager,
            auth,
            registry: Arc::new(SessionRegistry::new()),
            session_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(NvrError::Io)
    }

    /// Accept connections until the token fires
    pub async fn run(self, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(%err, "accept failed");
                            continue;
                        }
                    };
                    debug!(%peer, "connection accepted");

                    let conn = Connection {
                        manager: Arc::clone(&self.manager),
                        auth: Arc::clone(&self.auth),
                        registry: Arc::clone(&self.registry),
                        session_timeout: self.session_timeout,
                    };
                    let token = token.child_token();
                    tokio::spawn(async move {
                        conn.serve(socket, peer, token).await;
                    });
                }
            }
        }
        info!("RTSP server stopped");
    }
}

struct Connection {
    manager: Arc<PathManager>,
    auth: Arc<dyn Authenticator>,
    registry: Arc<SessionRegistry>,
    session_timeout: Duration,
}

impl Connection {
    async fn serve(self, socket: TcpStream, peer: SocketAddr, token: CancellationToken) {
        let (udp_rtp, udp_rtcp) = match bind_udp_pair().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%peer, %err, "could not bind UDP pair");
                return;
            }
        };
        let udp_ports = udp_rtp
            .local_addr()
            .ok()
            .zip(udp_rtcp.local_addr().ok())
            .map(|(a, b)| (a.port(), b.port()));

        let mut session = Session::new(
            self.manager,
            self.auth,
            self.registry,
            peer,
            self.session_timeout.as_secs(),
            udp_ports,
        );

        let framed = Framed::new(socket, Codec);
        let (mut sink, mut frames) = framed.split();

        // One writer serializes responses and interleaved data.
        let (out_tx, mut out_rx) = mpsc::channel::<Outgoing>(WRITER_QUEUE_LEN);
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(err) = sink.send(msg).await {
                    debug!(%err, "writer stopped");
                    break;
                }
            }
        });

        let udp_rtp = Arc::new(udp_rtp);

        // Forwarders cancel this when their stream ends, so readers of a
        // closed path disconnect instead of idling out.
        let conn_token = token.child_token();

        loop {
            let frame = tokio::select! {
                _ = conn_token.cancelled() => break,
                frame = tokio::time::timeout(self.session_timeout, frames.next()) => frame,
            };

            let frame = match frame {
                Err(_) => {
                    info!(%peer, "session idle timeout");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    // Framing is unrecoverable after a parse error.
                    warn!(%peer, %err, "closing connection");
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                Incoming::Request(req) => {
                    debug!(%peer, method = %req.method, "request");
                    let (response, action) = session.handle_request(&req);
                    if out_tx.send(Outgoing::Response(response)).await.is_err() {
                        break;
                    }

                    match action {
                        Some(SessionAction::StartForwarding(receiver)) => {
                            spawn_forwarder(
                                receiver,
                                session.transports(),
                                out_tx.clone(),
                                Arc::clone(&udp_rtp),
                                conn_token.clone(),
                            );
                        }
                        Some(SessionAction::Teardown) => break,
                        None => {}
                    }
                }
                Incoming::Data { channel, payload } => {
                    if let Err(err) = session.handle_data(channel, payload) {
                        warn!(%peer, %err, "dropping media frame");
                    }
                }
            }
        }

        session.teardown();
        drop(out_tx);
        let _ = writer.await;
        debug!(%peer, "connection finished");
    }
}

/// Forward fanned-out packets to one reader over its negotiated transports.
/// When the stream ends (path closed, publisher gone, or the reader was
/// dropped for falling behind) the whole connection is cancelled.
fn spawn_forwarder(
    mut receiver: mpsc::Receiver<stream::StreamData>,
    transports: HashMap<usize, TrackTransport>,
    out_tx: mpsc::Sender<Outgoing>,
    udp_rtp: Arc<UdpSocket>,
    conn_token: CancellationToken,
) {
    tokio::spawn(async move {
        while let Some(data) = receiver.recv().await {
            match transports.get(&data.track_id) {
                Some(TrackTransport::Interleaved { rtp, .. }) => {
                    if out_tx
                        .send(Outgoing::Data {
                            channel: *rtp,
                            payload: data.payload,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(TrackTransport::Udp { rtp, .. }) => {
                    if let Err(err) = udp_rtp.send_to(&data.payload, rtp).await {
                        debug!(%err, "UDP forward failed");
                        break;
                    }
                }
                None => {}
            }
        }
        conn_token.cancel();
        debug!("forwarder finished");
    });
}

async fn bind_udp_pair() -> std::io::Result<(UdpSocket, UdpSocket)> {
    let rtp = UdpSocket::bind(("0.0.0.0", 0)).await?;
    let rtcp = UdpSocket::bind(("0.0.0.0", 0)).await?;
    Ok((rtp, rtcp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::path::{NullObserver, PathConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const SDP: &str = "v=0\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n";

    async fn start_server() -> (SocketAddr, Arc<PathManager>, CancellationToken) {
        let manager = Arc::new(PathManager::new(
            "127.0.0.1",
            0,
            0,
            Arc::new(NullObserver),
        ));
        let server = RtspServer::bind(
            0,
            Arc::clone(&manager),
            Arc::new(AllowAll),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let token = CancellationToken::new();
        let run_token = token.clone();
        tokio::spawn(async move { server.run(run_token).await });
        (addr, manager, token)
    }

    async fn read_response(socket: &mut TcpStream) -> String {
        let mut buf = vec![0u8; 4096];
        let n = socket.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    #[tokio::test]
    async fn test_options_over_tcp() {
        let (addr, _manager, token) = start_server().await;

        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket
            .write_all(b"OPTIONS rtsp://127.0.0.1/ RTSP/1.0\r\nCSeq: 1\r\n\r\n")
            .await
            .unwrap();

        let response = read_response(&mut socket).await;
        assert!(response.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(response.contains("Public:"));
        assert!(response.contains("CSeq: 1\r\n"));

        token.cancel();
    }

    #[tokio::test]
    async fn test_publish_then_describe_over_tcp() {
        let (addr, manager, token) = start_server().await;
        manager
            .add_path(token.clone(), "cam1", PathConfig::default())
            .unwrap();

        // Publisher announces, sets up, records.
        let mut publisher = TcpStream::connect(addr).await.unwrap();
        publisher
            .write_all(
                format!(
                    "ANNOUNCE rtsp://127.0.0.1/cam1 RTSP/1.0\r\nCSeq: 1\r\n\
                     Content-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{}",
                    SDP.len(),
                    SDP
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        assert!(read_response(&mut publisher).await.starts_with("RTSP/1.0 200"));

        publisher
            .write_all(
                b"SETUP rtsp://127.0.0.1/cam1/trackID=0 RTSP/1.0\r\nCSeq: 2\r\n\
                  Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
            )
            .await
            .unwrap();
        let setup_response = read_response(&mut publisher).await;
        assert!(setup_response.contains("interleaved=0-1"));

        publisher
            .write_all(b"RECORD rtsp://127.0.0.1/cam1 RTSP/1.0\r\nCSeq: 3\r\n\r\n")
            .await
            .unwrap();
        assert!(read_response(&mut publisher).await.starts_with("RTSP/1.0 200"));

        // Reader gets the SDP back.
        let mut reader = TcpStream::connect(addr).await.unwrap();
        reader
            .write_all(b"DESCRIBE rtsp://127.0.0.1/cam1 RTSP/1.0\r\nCSeq: 1\r\n\r\n")
            .await
            .unwrap();
        let describe = read_response(&mut reader).await;
        assert!(describe.starts_with("RTSP/1.0 200"));
        assert!(describe.contains("a=rtpmap:96 H264/90000"));

        // Publisher disconnect → 404 on the next DESCRIBE.
        drop(publisher);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut reader2 = TcpStream::connect(addr).await.unwrap();
        reader2
            .write_all(b"DESCRIBE rtsp://127.0.0.1/cam1 RTSP/1.0\r\nCSeq: 1\r\n\r\n")
            .await
            .unwrap();
        assert!(read_response(&mut reader2).await.starts_with("RTSP/1.0 404"));

        token.cancel();
    }
}
