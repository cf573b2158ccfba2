//! Connection lifecycle tracking
//!
//! Protocol-agnostic state machine, frame-rate health estimation and the
//! exponential-backoff reconnection policy. Nothing in here performs I/O;
//! transports report events in and observers get state/health events out.

pub mod health;
pub mod manager;
pub mod state;

pub use health::FrameRateTracker;
pub use manager::{ConnectionCallbacks, ConnectionInfo, ConnectionManager, ReconnectPolicy};
pub use state::{ConnectionHealth, ConnectionState};
