//! WebRTC transport adapter
//!
//! Websocket signaling on a TCP listener plus a receive-only peer
//! connection. The endpoint is additionally advertised over mDNS so senders
//! on the same network can discover it without typing an address. Incoming
//! track payloads are handed to the frame source as depacketized samples.

use crate::config::{Config, Protocol};
use crate::error::CamlinkError;
use crate::net::Advertisement;
use crate::protocols::{AdapterEvents, MediaOutput, PresenceGate, ProtocolAdapter};
use async_trait::async_trait;
use async_tungstenite::WebSocketStream;
use async_tungstenite::tokio::{TokioAdapter, accept_async};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

const SAMPLE_QUEUE: usize = 256;

const INSTRUCTIONS: &str = "Open a WebRTC-capable sender app on your phone.\n\
It should discover this receiver automatically on the local network,\n\
or you can enter one of the signaling URLs shown above manually.\n\
WebRTC gives the lowest latency of the available protocols.";

#[derive(Serialize, Deserialize, Debug)]
struct SignalMessage {
    sdp: Option<RTCSessionDescription>,
    candidate: Option<String>,
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
    advertisement: Option<Advertisement>,
    peer: Arc<Mutex<Option<Arc<RTCPeerConnection>>>>,
}

pub struct WebRtcAdapter {
    gate: Arc<PresenceGate>,
    api: Arc<API>,
    running: Mutex<Option<Running>>,
    samples: std::sync::Mutex<Option<mpsc::Receiver<Bytes>>>,
    port: std::sync::Mutex<Option<u16>>,
}

impl WebRtcAdapter {
    pub fn new(events: AdapterEvents, _config: &Config) -> Result<Self, CamlinkError> {
        Ok(WebRtcAdapter {
            gate: PresenceGate::new(Protocol::WebRtc, events),
            api: build_api()?,
            running: Mutex::new(None),
            samples: std::sync::Mutex::new(None),
            port: std::sync::Mutex::new(None),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        api: Arc<API>,
        gate: Arc<PresenceGate>,
        samples: mpsc::Sender<Bytes>,
        peer_slot: Arc<Mutex<Option<Arc<RTCPeerConnection>>>>,
        token: CancellationToken,
    ) {
        loop {
            let stream = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("signaling connection from {}", addr);
                        stream
                    }
                    Err(e) => {
                        warn!("signaling accept failed: {}", e);
                        continue;
                    }
                },
            };

            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("websocket handshake failed: {}", e);
                    continue;
                }
            };

            let peer = match new_peer(&api, &gate, samples.clone(), &token).await {
                Ok(peer) => peer,
                Err(e) => {
                    warn!("failed to create peer connection: {}", e);
                    continue;
                }
            };

            // one sender at a time; a new signaling session replaces any
            // previous peer
            if let Some(old) = peer_slot.lock().await.replace(Arc::clone(&peer)) {
                let _ = old.close().await;
            }

            if let Err(e) = handle_signaling(&peer, ws_stream, &token).await {
                warn!("signaling session ended with error: {}", e);
            }
        }
    }
}

#[async_trait]
impl ProtocolAdapter for WebRtcAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::WebRtc
    }

    async fn start(&self, port: u16, _path: &str) -> Result<(), CamlinkError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| CamlinkError::Bind {
                protocol: Protocol::WebRtc,
                port,
                source,
            })?;
        info!("WebRTC signaling listening on ws://0.0.0.0:{}/webrtc", port);

        let advertisement = match Advertisement::register("camlink", port) {
            Ok(ad) => Some(ad),
            Err(e) => {
                // discovery is best effort; manual URLs still work
                warn!("mDNS advertisement unavailable: {}", e);
                None
            }
        };

        let (tx, rx) = mpsc::channel(SAMPLE_QUEUE);
        *self.samples.lock().unwrap() = Some(rx);

        let token = CancellationToken::new();
        let peer_slot = Arc::new(Mutex::new(None));
        let handle = tokio::spawn(Self::accept_loop(
            listener,
            Arc::clone(&self.api),
            Arc::clone(&self.gate),
            tx,
            Arc::clone(&peer_slot),
            token.clone(),
        ));

        *running = Some(Running {
            token,
            handle,
            advertisement,
            peer: peer_slot,
        });
        *self.port.lock().unwrap() = Some(port);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        running.token.cancel();
        let _ = running.handle.await;

        if let Some(peer) = running.peer.lock().await.take() {
            let _ = peer.close().await;
        }
        if let Some(ad) = running.advertisement {
            ad.shutdown();
        }

        self.gate.mark_disconnected();
        *self.samples.lock().unwrap() = None;
        *self.port.lock().unwrap() = None;
        info!("WebRTC adapter stopped");
        Ok(())
    }

    fn get_connection_urls(&self, local_addresses: &[IpAddr]) -> Vec<String> {
        match *self.port.lock().unwrap() {
            Some(port) => local_addresses
                .iter()
                .map(|ip| format!("ws://{}:{}/webrtc", ip, port))
                .collect(),
            None => Vec::new(),
        }
    }

    fn get_connection_instructions(&self) -> &'static str {
        INSTRUCTIONS
    }

    fn is_connected(&self) -> bool {
        self.gate.is_connected()
    }

    async fn media_output(&self) -> Option<MediaOutput> {
        self.samples
            .lock()
            .unwrap()
            .take()
            .map(MediaOutput::RtpSamples)
    }
}

fn build_api() -> Result<Arc<API>, CamlinkError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| CamlinkError::Signaling(format!("codec registration: {e}")))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| CamlinkError::Signaling(format!("interceptor registry: {e}")))?;

    Ok(Arc::new(
        APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build(),
    ))
}

async fn new_peer(
    api: &Arc<API>,
    gate: &Arc<PresenceGate>,
    samples: mpsc::Sender<Bytes>,
    token: &CancellationToken,
) -> Result<Arc<RTCPeerConnection>, CamlinkError> {
    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            ..Default::default()
        }],
        ..Default::default()
    };

    let peer = Arc::new(
        api.new_peer_connection(config)
            .await
            .map_err(|e| CamlinkError::Signaling(format!("peer connection: {e}")))?,
    );

    peer.add_transceiver_from_kind(
        RTPCodecType::Video,
        Some(RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: Vec::new(),
        }),
    )
    .await
    .map_err(|e| CamlinkError::Signaling(format!("video transceiver: {e}")))?;

    let gate_state = Arc::clone(gate);
    peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        match state {
            RTCPeerConnectionState::Connected => gate_state.mark_connected(),
            RTCPeerConnectionState::Failed
            | RTCPeerConnectionState::Disconnected
            | RTCPeerConnectionState::Closed => gate_state.mark_disconnected(),
            _ => {}
        }
        Box::pin(async {})
    }));

    let track_token = token.clone();
    peer.on_track(Box::new(move |track, _receiver, _transceiver| {
        let samples = samples.clone();
        let token = track_token.clone();
        Box::pin(async move {
            info!("remote track attached");
            loop {
                let read = tokio::select! {
                    _ = token.cancelled() => break,
                    read = track.read_rtp() => read,
                };
                match read {
                    Ok((packet, _)) => {
                        if samples.send(packet.payload).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        info!("remote track closed: {}", e);
                        break;
                    }
                }
            }
        })
    }));

    Ok(peer)
}

async fn handle_signaling(
    peer: &Arc<RTCPeerConnection>,
    ws_stream: WebSocketStream<TokioAdapter<TcpStream>>,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => break,
            msg = ws_receiver.next() => match msg {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(e.into()),
                None => break,
            },
        };

        let Ok(text) = msg.into_text() else { continue };
        let Ok(signal) = serde_json::from_str::<SignalMessage>(&text) else {
            warn!("unparseable signaling message");
            continue;
        };

        if let Some(sdp) = signal.sdp {
            if sdp.sdp_type == RTCSdpType::Offer {
                peer.set_remote_description(sdp).await?;

                let answer = peer.create_answer(None).await?;
                peer.set_local_description(answer).await?;

                // wait for ICE gathering so the answer carries all candidates
                let mut gather_complete = peer.gathering_complete_promise().await;
                gather_complete.recv().await;

                if let Some(local_desc) = peer.local_description().await {
                    let reply = serde_json::json!({
                        "sdp": local_desc,
                        "candidate": None::<String>,
                    });
                    ws_sender.send(reply.to_string().into()).await?;
                }
            } else {
                peer.set_remote_description(sdp).await?;
            }
        }

        if let Some(candidate) = signal.candidate {
            let init = RTCIceCandidateInit {
                candidate,
                ..Default::default()
            };
            if let Err(e) = peer.add_ice_candidate(init).await {
                warn!("rejected ICE candidate: {}", e);
            }
        }
    }

    Ok(())
}
