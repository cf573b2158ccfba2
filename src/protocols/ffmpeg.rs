//! Media collaborator process shared by the RTMP and SRT adapters.
//!
//! Both transports delegate protocol termination and decoding to an external
//! ffmpeg process started in listen mode, emitting raw RGB24 frames on
//! stdout. Sender presence is derived from the collaborator's stderr, which
//! is the only observable signal it offers.

use crate::error::CamlinkError;
use crate::protocols::PresenceGate;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// stderr markers that mean a sender went away. Checked before the connect
/// markers because "Connection closed" would otherwise match "connect".
const DISCONNECT_MARKERS: [&str; 4] = ["connection closed", "broken pipe", "disconnected", "eof"];
const CONNECT_MARKERS: [&str; 2] = ["handshake performed", "connect"];

struct Running {
    child: Child,
    stdout: Option<ChildStdout>,
    monitor_token: CancellationToken,
    monitor: JoinHandle<()>,
}

/// One ffmpeg listener process plus its stderr watcher.
pub(crate) struct Collaborator {
    binary: Option<PathBuf>,
    gate: Arc<PresenceGate>,
    running: Mutex<Option<Running>>,
}

impl Collaborator {
    pub(crate) fn new(binary: Option<PathBuf>, gate: Arc<PresenceGate>) -> Self {
        Collaborator {
            binary,
            gate,
            running: Mutex::new(None),
        }
    }

    /// Launch ffmpeg listening on `input_url`, decoding to raw RGB24 frames
    /// of the given geometry on stdout.
    pub(crate) async fn spawn(
        &self,
        input_url: &str,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<(), CamlinkError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("media collaborator already running");
            return Ok(());
        }

        let binary = self.binary.as_ref().ok_or_else(|| CamlinkError::Spawn {
            binary: "ffmpeg".to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "ffmpeg not found on PATH; install it or set ffmpeg_bin",
            ),
        })?;

        info!("starting media collaborator for {}", input_url);
        let mut child = Command::new(binary)
            .args([
                "-loglevel",
                "info",
                "-i",
                input_url,
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgb24",
                "-s",
                &format!("{}x{}", width, height),
                "-r",
                &fps.to_string(),
                "-flags",
                "low_delay",
                "-fflags",
                "nobuffer",
                "-an",
                "-sn",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CamlinkError::Spawn {
                binary: binary.display().to_string(),
                source: e,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let monitor_token = CancellationToken::new();
        let token = monitor_token.clone();
        let gate = Arc::clone(&self.gate);
        let monitor = tokio::spawn(async move {
            let Some(stderr) = stderr else { return };
            let mut lines = BufReader::new(stderr).lines();
            loop {
                let line = tokio::select! {
                    _ = token.cancelled() => return,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => watch_line(&gate, &line),
                    Ok(None) => {
                        // Collaborator exited
                        debug!("media collaborator stderr closed");
                        gate.mark_disconnected();
                        return;
                    }
                    Err(e) => {
                        warn!("error reading collaborator stderr: {}", e);
                        gate.mark_disconnected();
                        return;
                    }
                }
            }
        });

        *running = Some(Running {
            child,
            stdout,
            monitor_token,
            monitor,
        });
        Ok(())
    }

    pub(crate) async fn take_stdout(&self) -> Option<ChildStdout> {
        self.running.lock().await.as_mut()?.stdout.take()
    }

    /// Terminate the collaborator and its watcher. Idempotent.
    pub(crate) async fn stop(&self) -> anyhow::Result<()> {
        let Some(mut running) = self.running.lock().await.take() else {
            return Ok(());
        };

        running.monitor_token.cancel();
        let _ = running.monitor.await;

        if let Err(e) = running.child.kill().await {
            warn!("error terminating media collaborator: {}", e);
        }
        let _ = running.child.wait().await;

        // A sender attached to a dead listener is gone by definition.
        self.gate.mark_disconnected();
        info!("media collaborator stopped");
        Ok(())
    }

    pub(crate) async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

/// Classify one collaborator stderr line into presence edges and log noise.
fn watch_line(gate: &PresenceGate, line: &str) {
    let lower = line.to_lowercase();

    if DISCONNECT_MARKERS.iter().any(|m| lower.contains(m)) {
        gate.mark_disconnected();
    } else if CONNECT_MARKERS.iter().any(|m| lower.contains(m)) {
        gate.mark_connected();
    }

    if lower.contains("error") {
        error!("ffmpeg: {}", line);
    } else if lower.contains("warning") {
        warn!("ffmpeg: {}", line);
    } else {
        debug!("ffmpeg: {}", line);
    }
}

/// Synchronous availability probe for a TCP listening port, so a taken port
/// is reported from `start()` instead of a collaborator log line later.
pub(crate) fn probe_tcp_port(port: u16) -> Result<(), std::io::Error> {
    std::net::TcpListener::bind(("0.0.0.0", port)).map(|_| ())
}

/// Same probe for UDP-based transports.
pub(crate) fn probe_udp_port(port: u16) -> Result<(), std::io::Error> {
    std::net::UdpSocket::bind(("0.0.0.0", port)).map(|_| ())
}
