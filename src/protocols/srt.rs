//! SRT transport adapter
//!
//! Listener-mode SRT over UDP. Lower latency than RTMP on lossy wireless
//! links thanks to selective retransmission; default port 9000.

use crate::config::{Config, Protocol};
use crate::error::CamlinkError;
use crate::protocols::ffmpeg::{Collaborator, probe_udp_port};
use crate::protocols::{AdapterEvents, MediaOutput, PresenceGate, ProtocolAdapter};
use async_trait::async_trait;
use log::info;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

const INSTRUCTIONS: &str = "Use Larix Broadcaster or another SRT-capable app on your phone.\n\
Select 'SRT' as the connection type and enter one of the SRT URLs shown above.\n\
SRT provides lower latency than RTMP and recovers well from packet loss.";

pub struct SrtAdapter {
    gate: Arc<PresenceGate>,
    collaborator: Collaborator,
    width: u32,
    height: u32,
    fps: u32,
    port: Mutex<Option<u16>>,
}

impl SrtAdapter {
    pub fn new(events: AdapterEvents, config: &Config) -> Self {
        let gate = PresenceGate::new(Protocol::Srt, events);
        SrtAdapter {
            collaborator: Collaborator::new(config.ffmpeg(), Arc::clone(&gate)),
            gate,
            width: config.width,
            height: config.height,
            fps: config.fps,
            port: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ProtocolAdapter for SrtAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Srt
    }

    async fn start(&self, port: u16, _path: &str) -> Result<(), CamlinkError> {
        if self.collaborator.is_running().await {
            return Ok(());
        }

        probe_udp_port(port).map_err(|source| CamlinkError::Bind {
            protocol: Protocol::Srt,
            port,
            source,
        })?;

        let input = format!("srt://0.0.0.0:{}?mode=listener", port);
        info!("starting SRT listener on srt://0.0.0.0:{}", port);
        self.collaborator
            .spawn(&input, self.width, self.height, self.fps)
            .await?;

        *self.port.lock().unwrap() = Some(port);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.collaborator.stop().await?;
        *self.port.lock().unwrap() = None;
        Ok(())
    }

    fn get_connection_urls(&self, local_addresses: &[IpAddr]) -> Vec<String> {
        match *self.port.lock().unwrap() {
            Some(port) => local_addresses
                .iter()
                .map(|ip| format!("srt://{}:{}", ip, port))
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
        self.collaborator
            .take_stdout()
            .await
            .map(MediaOutput::RawVideoPipe)
    }
}
