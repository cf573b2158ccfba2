//! Pipeline orchestration
//!
//! Owns one adapter, one frame source and one connection manager, and wires
//! their callbacks together: adapter presence feeds the manager, decoded
//! frames feed both the manager and the sink, and the manager's reconnect
//! ladder feeds back into adapter restarts. Restarts run on a dedicated
//! task so no manager callback ever blocks on adapter teardown.

use crate::config::Config;
use crate::connection::{
    ConnectionCallbacks, ConnectionHealth, ConnectionInfo, ConnectionManager, ConnectionState,
    ReconnectPolicy,
};
use crate::decoder::FrameDecoder;
use crate::error::CamlinkError;
use crate::net::local_ipv4_addresses;
use crate::protocols::{AdapterEvents, AdapterFactory, ProtocolAdapter};
use crate::sink::VideoSink;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pause between tearing the listener down and bringing it back up, giving
/// the OS time to release the port.
const RESTART_SETTLE: Duration = Duration::from_millis(500);

/// Optional hooks for a UI or status reporter, forwarded verbatim from the
/// connection manager.
#[derive(Default)]
pub struct PipelineObservers {
    pub on_state_change: Option<Arc<dyn Fn(ConnectionState) + Send + Sync>>,
    pub on_health_change: Option<Arc<dyn Fn(ConnectionHealth) + Send + Sync>>,
    pub on_reconnect: Option<Arc<dyn Fn(u32) + Send + Sync>>,
    pub on_retries_exhausted: Option<Arc<dyn Fn(u32) + Send + Sync>>,
}

struct Task {
    token: CancellationToken,
    /// Yields the request receiver back on exit so a later start can
    /// spawn a fresh worker.
    handle: JoinHandle<mpsc::UnboundedReceiver<u32>>,
}

pub struct StreamingPipeline {
    config: Config,
    manager: Arc<ConnectionManager>,
    adapter: Arc<dyn ProtocolAdapter>,
    decoder: Arc<FrameDecoder>,
    restart_task: tokio::sync::Mutex<Option<Task>>,
    restart_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<u32>>>,
}

impl StreamingPipeline {
    pub fn new(
        config: Config,
        sink: Arc<dyn VideoSink>,
        observers: PipelineObservers,
    ) -> Result<Arc<Self>, CamlinkError> {
        config.validate()?;

        let (restart_tx, restart_rx) = mpsc::unbounded_channel();

        let forwarded_reconnect = observers.on_reconnect;
        let callbacks = ConnectionCallbacks {
            on_state_change: observers.on_state_change,
            on_health_change: observers.on_health_change,
            on_reconnect: Some(Arc::new(move |attempt| {
                let _ = restart_tx.send(attempt);
                if let Some(cb) = &forwarded_reconnect {
                    cb(attempt);
                }
            })),
            on_retries_exhausted: observers.on_retries_exhausted,
        };

        let policy = ReconnectPolicy {
            auto_reconnect: config.auto_reconnect,
            max_attempts: config.max_reconnect_attempts,
            stale_frame_timeout: config.stale_frame_timeout(),
        };
        let manager = Arc::new(ConnectionManager::new(config.protocol, policy, callbacks));

        let events_manager = Arc::clone(&manager);
        let lost_manager = Arc::clone(&manager);
        let events = AdapterEvents {
            on_connect: Some(Arc::new(move || {
                events_manager.report_connection_established();
            })),
            on_disconnect: Some(Arc::new(move || {
                lost_manager.report_connection_lost();
            })),
        };
        let adapter = AdapterFactory::create(config.protocol, events, &config)?;

        let decoder = Arc::new(FrameDecoder::new(config.width, config.height));
        let frame_manager = Arc::clone(&manager);
        decoder.set_frame_callback(Arc::new(move |frame| {
            frame_manager.report_frame_received();
            sink.push_frame(frame);
        }));
        // decode failures are counted and logged only; a dead media source
        // shows up as stale frames and the staleness timeout drives
        // reconnection
        let drop_manager = Arc::clone(&manager);
        decoder.set_error_callback(Arc::new(move |err| {
            warn!("frame source error: {}", err);
            drop_manager.report_frame_dropped();
        }));

        Ok(Arc::new(StreamingPipeline {
            config,
            manager,
            adapter,
            decoder,
            restart_task: tokio::sync::Mutex::new(None),
            restart_rx: std::sync::Mutex::new(Some(restart_rx)),
        }))
    }

    /// Bring the whole pipeline up: monitoring first, then the listener,
    /// then the frame source. Returns once a sender could connect.
    pub async fn start(&self) -> Result<(), CamlinkError> {
        let port = self.config.effective_port();
        let path = self.config.path.clone();

        self.manager.report_connecting();
        self.manager.start_monitoring();
        self.spawn_restart_worker(port, path.clone()).await;

        if let Err(e) = self.adapter.start(port, &path).await {
            // Nothing may keep running after a failed start; undo the
            // partial bring-up before handing the error back.
            self.stop_restart_worker().await;
            self.manager.stop().await;
            return Err(e);
        }
        if let Some(output) = self.adapter.media_output().await {
            self.decoder.start(output).await;
        }

        info!(
            "pipeline up: {} listener on port {}",
            self.config.protocol, port
        );
        Ok(())
    }

    /// Tear everything down in reverse dependency order. Each stage is
    /// attempted even if an earlier one fails.
    pub async fn stop(&self) {
        self.stop_restart_worker().await;

        if let Err(e) = self.adapter.stop().await {
            error!("adapter shutdown failed: {}", e);
        }
        self.decoder.stop().await;
        self.manager.stop().await;
        info!("pipeline stopped");
    }

    /// Force an immediate reconnection attempt regardless of backoff.
    pub fn trigger_reconnect(&self) {
        self.manager.trigger_reconnect();
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.manager.set_auto_reconnect(enabled);
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.manager.connection_info()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.current_state()
    }

    /// URLs a sender on the local network can use to reach this pipeline.
    pub fn connection_urls(&self) -> Vec<String> {
        self.adapter.get_connection_urls(&local_ipv4_addresses())
    }

    pub fn connection_instructions(&self) -> &'static str {
        self.adapter.get_connection_instructions()
    }

    async fn spawn_restart_worker(&self, port: u16, path: String) {
        let mut task = self.restart_task.lock().await;
        if task.is_some() {
            return;
        }
        let Some(mut rx) = self.restart_rx.lock().unwrap().take() else {
            return;
        };

        let adapter = Arc::clone(&self.adapter);
        let decoder = Arc::clone(&self.decoder);
        let token = CancellationToken::new();
        let worker_token = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                let attempt = tokio::select! {
                    _ = worker_token.cancelled() => break,
                    attempt = rx.recv() => match attempt {
                        Some(attempt) => attempt,
                        None => break,
                    },
                };
                restart_adapter(&adapter, &decoder, port, &path, attempt).await;
            }
            rx
        });

        *task = Some(Task { token, handle });
    }

    async fn stop_restart_worker(&self) {
        if let Some(task) = self.restart_task.lock().await.take() {
            task.token.cancel();
            if let Ok(rx) = task.handle.await {
                *self.restart_rx.lock().unwrap() = Some(rx);
            }
        }
    }
}

/// One reconnection cycle: stop the frame source and the listener, let the
/// port settle, then bring both back. A failed restart is only logged; the
/// backoff ladder decides whether another attempt follows.
async fn restart_adapter(
    adapter: &Arc<dyn ProtocolAdapter>,
    decoder: &Arc<FrameDecoder>,
    port: u16,
    path: &str,
    attempt: u32,
) {
    info!(
        "reconnect attempt {}: restarting {} listener",
        attempt,
        adapter.protocol()
    );

    decoder.stop().await;
    if let Err(e) = adapter.stop().await {
        warn!("listener teardown failed: {}", e);
    }
    tokio::time::sleep(RESTART_SETTLE).await;

    match adapter.start(port, path).await {
        Ok(()) => {
            if let Some(output) = adapter.media_output().await {
                decoder.start(output).await;
            }
            info!("listener restarted, waiting for the sender to return");
        }
        Err(e) => warn!("reconnect attempt {} failed: {}", attempt, e),
    }
}
