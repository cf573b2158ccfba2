//! RTMP transport adapter
//!
//! Runs the media collaborator in RTMP listen mode. Broadly compatible with
//! phone streaming apps (PRISM Live Studio, Larix Broadcaster); the default
//! port is 2935 and the stream path defaults to `live/stream`.

use crate::config::{Config, Protocol};
use crate::error::CamlinkError;
use crate::protocols::ffmpeg::{Collaborator, probe_tcp_port};
use crate::protocols::{AdapterEvents, MediaOutput, PresenceGate, ProtocolAdapter};
use async_trait::async_trait;
use log::info;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

const INSTRUCTIONS: &str = "Use PRISM Live Studio or Larix Broadcaster on your phone.\n\
Select 'Custom RTMP' and enter one of the RTMP URLs shown above.\n\
RTMP provides reliable, high-quality streaming with broad compatibility.";

pub struct RtmpAdapter {
    gate: Arc<PresenceGate>,
    collaborator: Collaborator,
    width: u32,
    height: u32,
    fps: u32,
    default_path: String,
    endpoint: Mutex<Option<(u16, String)>>,
}

impl RtmpAdapter {
    pub fn new(events: AdapterEvents, config: &Config) -> Self {
        let gate = PresenceGate::new(Protocol::Rtmp, events);
        RtmpAdapter {
            collaborator: Collaborator::new(config.ffmpeg(), Arc::clone(&gate)),
            gate,
            width: config.width,
            height: config.height,
            fps: config.fps,
            default_path: config.path.clone(),
            endpoint: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ProtocolAdapter for RtmpAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Rtmp
    }

    async fn start(&self, port: u16, path: &str) -> Result<(), CamlinkError> {
        if self.collaborator.is_running().await {
            return Ok(());
        }

        probe_tcp_port(port).map_err(|source| CamlinkError::Bind {
            protocol: Protocol::Rtmp,
            port,
            source,
        })?;

        let path = if path.is_empty() {
            self.default_path.clone()
        } else {
            path.trim_start_matches('/').to_string()
        };

        // ?listen=1 as a URL parameter sidesteps the ffmpeg 7.x
        // listen_timeout bug with -rtmp_listen
        let input = format!("rtmp://0.0.0.0:{}/{}?listen=1", port, path);
        info!("starting RTMP listener on rtmp://0.0.0.0:{}/{}", port, path);
        self.collaborator
            .spawn(&input, self.width, self.height, self.fps)
            .await?;

        *self.endpoint.lock().unwrap() = Some((port, path));
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.collaborator.stop().await?;
        *self.endpoint.lock().unwrap() = None;
        Ok(())
    }

    fn get_connection_urls(&self, local_addresses: &[IpAddr]) -> Vec<String> {
        match self.endpoint.lock().unwrap().as_ref() {
            Some((port, path)) => local_addresses
                .iter()
                .map(|ip| format!("rtmp://{}:{}/{}", ip, port, path))
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
