//! Connection state and health definitions

/// Connection state machine
///
/// Exactly one value at any instant, owned by the connection manager and
/// mutated only through its transition function. There is no terminal
/// state; the machine cycles for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No sender attached and no attempt in progress
    Disconnected,

    /// Start was requested, waiting for the first sender
    Connecting,

    /// A sender is attached and frames are expected
    Connected,

    /// Connection dropped, backoff timer armed for the next attempt
    Reconnecting,
}

impl ConnectionState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, target) {
            (Disconnected, Connecting) => true,
            // A sender can attach while we never asked to connect, e.g.
            // right after a manual stop raced with an incoming handshake.
            (Disconnected, Connected) => true,

            (Connecting, Connected) => true,
            (Connecting, Reconnecting) => true,
            (Connecting, Disconnected) => true,

            (Connected, Reconnecting) => true,
            (Connected, Disconnected) => true,

            (Reconnecting, Connected) => true,
            (Reconnecting, Disconnected) => true,

            // Self-transitions
            (a, b) if a == b => true,

            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// True while the machine is actively trying to reach Connected
    pub fn is_trying(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Coarse classification of the recent frame-arrival rate.
///
/// Derived, never set directly; only meaningful while the state is
/// `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionHealth {
    /// < 10 fps
    Critical,
    /// 10-20 fps
    Poor,
    /// 20-28 fps
    Good,
    /// > 28 fps
    Excellent,
}

impl ConnectionHealth {
    /// Classify an observed frame rate against the fixed thresholds.
    pub fn from_fps(fps: f64) -> Self {
        if fps > 28.0 {
            ConnectionHealth::Excellent
        } else if fps >= 20.0 {
            ConnectionHealth::Good
        } else if fps >= 10.0 {
            ConnectionHealth::Poor
        } else {
            ConnectionHealth::Critical
        }
    }
}

impl std::fmt::Display for ConnectionHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionHealth::Excellent => "Excellent",
            ConnectionHealth::Good => "Good",
            ConnectionHealth::Poor => "Poor",
            ConnectionHealth::Critical => "Critical",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        use ConnectionState::*;

        assert!(Disconnected.can_transition_to(&Connecting));
        assert!(Connecting.can_transition_to(&Connected));
        assert!(Connected.can_transition_to(&Reconnecting));
        assert!(Reconnecting.can_transition_to(&Connected));
        assert!(Reconnecting.can_transition_to(&Disconnected));
        assert!(Connecting.can_transition_to(&Reconnecting));

        // Self-transitions
        assert!(Connected.can_transition_to(&Connected));
        assert!(Disconnected.can_transition_to(&Disconnected));
    }

    #[test]
    fn test_invalid_transitions() {
        use ConnectionState::*;

        // Reconnecting never goes back to Connecting; a fresh start
        // request tears the pipeline down first.
        assert!(!Reconnecting.can_transition_to(&Connecting));
        assert!(!Connected.can_transition_to(&Connecting));
    }

    #[test]
    fn test_state_checks() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Reconnecting.is_connected());
        assert!(ConnectionState::Connecting.is_trying());
        assert!(ConnectionState::Reconnecting.is_trying());
        assert!(!ConnectionState::Disconnected.is_trying());
    }

    #[test]
    fn health_thresholds() {
        assert_eq!(ConnectionHealth::from_fps(30.0), ConnectionHealth::Excellent);
        assert_eq!(ConnectionHealth::from_fps(28.0), ConnectionHealth::Good);
        assert_eq!(ConnectionHealth::from_fps(20.0), ConnectionHealth::Good);
        assert_eq!(ConnectionHealth::from_fps(15.0), ConnectionHealth::Poor);
        assert_eq!(ConnectionHealth::from_fps(10.0), ConnectionHealth::Poor);
        assert_eq!(ConnectionHealth::from_fps(5.0), ConnectionHealth::Critical);
        assert_eq!(ConnectionHealth::from_fps(0.0), ConnectionHealth::Critical);
    }

    #[test]
    fn health_orders_from_worst_to_best() {
        assert!(ConnectionHealth::Critical < ConnectionHealth::Poor);
        assert!(ConnectionHealth::Good < ConnectionHealth::Excellent);
    }
}
