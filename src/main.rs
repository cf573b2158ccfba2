use crate::config::{Config, Protocol};
use crate::pipeline::{PipelineObservers, StreamingPipeline};
use crate::sink::NullSink;
use clap::{Arg, ArgAction, Command};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use std::{panic, process};
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod connection;
pub mod decoder;
pub mod error;
pub mod net;
pub mod pipeline;
pub mod protocols;
pub mod sink;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let matches = Command::new(config::app_name())
        .version(config::version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("protocol")
                .short('P')
                .long("protocol")
                .value_name("PROTOCOL")
                .help("Streaming protocol to listen with (rtmp, srt, webrtc).")
                .ignore_case(true),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Listening port. Defaults to the protocol's own port.")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("path")
                .long("path")
                .value_name("PATH")
                .help("Stream path for RTMP, e.g. live/stream."),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file. Created with defaults when missing.")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("no-reconnect")
                .long("no-reconnect")
                .help("Disable automatic reconnection after a sender is lost.")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) if path.exists() => Config::load(path)?,
        Some(path) => {
            let config = Config::default();
            config.save(path)?;
            info!("wrote default configuration to {}", path.display());
            config
        }
        None => Config::default(),
    };

    if let Some(protocol) = matches.get_one::<String>("protocol") {
        config.protocol = protocol.parse::<Protocol>()?;
        config.port = 0;
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.port = *port;
    }
    if let Some(path) = matches.get_one::<String>("path") {
        config.path = path.trim_start_matches('/').to_string();
    }
    if matches.get_flag("no-reconnect") {
        config.auto_reconnect = false;
    }

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    let shutdown = CancellationToken::new();
    let ctrlc_shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        ctrlc_shutdown.cancel();
    })
    .expect("Error setting Ctrl-C handler");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(config, shutdown))
}

async fn run(config: Config, shutdown: CancellationToken) -> anyhow::Result<()> {
    if config.ffmpeg().is_none() && config.protocol != Protocol::WebRtc {
        warn!("ffmpeg not found on PATH; {} ingest will not start", config.protocol);
    }

    let sink = Arc::new(NullSink::new(config.width, config.height));
    let exhausted = Arc::new(AtomicU32::new(0));
    let exhausted_flag = Arc::clone(&exhausted);
    let exhausted_shutdown = shutdown.clone();
    let observers = PipelineObservers {
        on_state_change: Some(Arc::new(|state| info!("connection is now {}", state))),
        on_health_change: Some(Arc::new(|health| info!("stream health: {}", health))),
        on_reconnect: Some(Arc::new(|attempt| {
            info!("reconnection attempt {} starting", attempt)
        })),
        on_retries_exhausted: Some(Arc::new(move |attempts| {
            error!("giving up after {} reconnection attempts", attempts);
            exhausted_flag.store(attempts, Ordering::SeqCst);
            exhausted_shutdown.cancel();
        })),
    };

    let pipeline = StreamingPipeline::new(config, sink.clone(), observers)?;
    pipeline.start().await?;

    println!("Connect your phone to one of:");
    for url in pipeline.connection_urls() {
        println!("  {}", url);
    }
    println!("\n{}", pipeline.connection_instructions());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(10)) => {
                let info = pipeline.connection_info();
                info!(
                    "{} | {} | frames {} (dropped {}, delivered {}) | attempts {}",
                    info.state, info.health, info.total_frames,
                    info.dropped_frames, sink.frames_received(),
                    info.reconnect_attempts
                );
            }
        }
    }

    pipeline.stop().await;

    let attempts = exhausted.load(Ordering::SeqCst);
    if attempts > 0 {
        return Err(crate::error::CamlinkError::MaxRetriesExceeded { attempts }.into());
    }
    Ok(())
}
