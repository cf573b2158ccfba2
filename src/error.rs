//! Error taxonomy for the streaming core.
//!
//! Resource-acquisition failures surface synchronously from `start()`;
//! everything after that flows through the state/health callback path and
//! never crosses a callback boundary as an error.

use thiserror::Error;

use crate::config::Protocol;

#[derive(Debug, Error)]
pub enum CamlinkError {
    /// The adapter could not acquire its listening resource. Not retried
    /// automatically; the caller picks a different port or gives up.
    #[error("failed to bind {protocol} listener on port {port}: {source}")]
    Bind {
        protocol: Protocol,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The external media collaborator (ffmpeg) could not be launched.
    #[error("failed to spawn media collaborator `{binary}`: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// Terminal failure of the reconnection policy, distinct from an
    /// ordinary disconnect so observers can tell "gave up" from "never
    /// connected".
    #[error("gave up reconnecting after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32 },

    /// Factory-time configuration error, fatal to pipeline construction.
    #[error("unsupported protocol `{0}` (expected rtmp, srt or webrtc)")]
    UnsupportedProtocol(String),

    /// A frame could not be decoded. Logged and skipped, never promoted to
    /// a connection-level failure.
    #[error("decode error: {0}")]
    Decode(String),

    /// WebRTC signaling or peer negotiation failed.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// Invalid configuration rejected before the pipeline is built.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
