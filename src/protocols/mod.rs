//! Transport adapters
//!
//! One adapter per streaming protocol (RTMP, SRT, WebRTC), each driving its
//! own listening resources and reporting sender presence through the same
//! pair of connect/disconnect callbacks. The rest of the pipeline only ever
//! sees the [`ProtocolAdapter`] trait; which variant is behind it is decided
//! once, at construction, by the factory.

pub mod factory;
mod ffmpeg;
pub mod rtmp;
pub mod srt;
pub mod webrtc;

pub use factory::AdapterFactory;
pub use rtmp::RtmpAdapter;
pub use srt::SrtAdapter;
pub use webrtc::WebRtcAdapter;

use crate::config::Protocol;
use crate::error::CamlinkError;
use async_trait::async_trait;
use bytes::Bytes;
use log::info;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

/// Sender-presence hooks supplied by the pipeline. Each fires exactly once
/// per actual transition; adapters never emit duplicate connect events while
/// a sender is already attached.
#[derive(Clone, Default)]
pub struct AdapterEvents {
    pub on_connect: Option<EventCallback>,
    pub on_disconnect: Option<EventCallback>,
}

/// Where the frame source reads media from once the adapter is started.
///
/// A closed set so neither the decoder nor the pipeline ever branches on
/// the concrete adapter type.
pub enum MediaOutput {
    /// Raw RGB24 frames on the media collaborator's stdout.
    RawVideoPipe(tokio::process::ChildStdout),
    /// Depacketized media samples delivered by the WebRTC peer; decoding
    /// happens downstream.
    RtpSamples(mpsc::Receiver<Bytes>),
}

/// Uniform contract over one specific streaming protocol.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Acquire the listening resources and return once ready to accept a
    /// sender. Does not wait for a sender to actually connect. Fails with
    /// [`CamlinkError::Bind`] when the port cannot be acquired.
    async fn start(&self, port: u16, path: &str) -> Result<(), CamlinkError>;

    /// Release everything `start` acquired. Idempotent; safe to call when
    /// start was never called or already failed.
    async fn stop(&self) -> anyhow::Result<()>;

    /// User-facing endpoint URLs for the given local addresses. Pure; no
    /// I/O. Empty until `start` succeeded.
    fn get_connection_urls(&self, local_addresses: &[IpAddr]) -> Vec<String>;

    /// Human guidance for connecting a sender to this transport.
    fn get_connection_instructions(&self) -> &'static str;

    /// Whether a sender is currently attached.
    fn is_connected(&self) -> bool;

    /// Take the media output for the frame source; yields `Some` once per
    /// successful `start`.
    async fn media_output(&self) -> Option<MediaOutput>;
}

/// Edge-triggered presence latch shared by all adapter variants: turns the
/// noisy signals underneath (log lines, peer states, process exits) into
/// exactly one callback per actual transition.
pub(crate) struct PresenceGate {
    protocol: Protocol,
    connected: AtomicBool,
    events: AdapterEvents,
}

impl PresenceGate {
    pub(crate) fn new(protocol: Protocol, events: AdapterEvents) -> Arc<Self> {
        Arc::new(PresenceGate {
            protocol,
            connected: AtomicBool::new(false),
            events,
        })
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_connected(&self) {
        if self
            .connected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("{} sender connected", self.protocol);
            if let Some(cb) = &self.events.on_connect {
                cb();
            }
        }
    }

    pub(crate) fn mark_disconnected(&self) {
        if self
            .connected
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("{} sender disconnected", self.protocol);
            if let Some(cb) = &self.events.on_disconnect {
                cb();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_events() -> (AdapterEvents, Arc<AtomicU32>, Arc<AtomicU32>) {
        let connects = Arc::new(AtomicU32::new(0));
        let disconnects = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&connects);
        let d = Arc::clone(&disconnects);
        let events = AdapterEvents {
            on_connect: Some(Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })),
            on_disconnect: Some(Arc::new(move || {
                d.fetch_add(1, Ordering::SeqCst);
            })),
        };
        (events, connects, disconnects)
    }

    #[test]
    fn gate_fires_once_per_edge() {
        let (events, connects, disconnects) = counting_events();
        let gate = PresenceGate::new(Protocol::Rtmp, events);

        gate.mark_connected();
        gate.mark_connected();
        gate.mark_connected();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert!(gate.is_connected());

        gate.mark_disconnected();
        gate.mark_disconnected();
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(!gate.is_connected());

        gate.mark_connected();
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn disconnect_before_connect_is_swallowed() {
        let (events, _, disconnects) = counting_events();
        let gate = PresenceGate::new(Protocol::Srt, events);

        gate.mark_disconnected();
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    }
}
