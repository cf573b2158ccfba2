//! Connection manager
//!
//! Single source of truth for connection lifecycle and quality. Consumes
//! reports from whichever transport adapter is active, owns the backoff
//! reconnection policy and the periodic health tick, and pushes state and
//! health changes to the callbacks supplied at construction. The manager
//! performs no I/O of its own.
//!
//! All mutation goes through one mutex, and every notification is emitted
//! under a second `notify` lock acquired first, so observers see events in
//! the exact order the transitions happened even when reports arrive from
//! the network and the timers at once. Callbacks must therefore not call
//! back into the manager synchronously; the pipeline wiring never does.

use crate::config::Protocol;
use crate::connection::health::FrameRateTracker;
use crate::connection::state::{ConnectionHealth, ConnectionState};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Delay ladder between reconnection attempts, clamped at the last value.
pub const BACKOFF_SEQUENCE: [u64; 6] = [1, 2, 4, 8, 16, 30];

/// Health tick cadence while monitoring is active.
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;
pub type HealthCallback = Arc<dyn Fn(ConnectionHealth) + Send + Sync>;
pub type ReconnectCallback = Arc<dyn Fn(u32) + Send + Sync>;
pub type ExhaustedCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Callbacks the manager pushes events into. All optional; unset hooks are
/// simply skipped.
#[derive(Default, Clone)]
pub struct ConnectionCallbacks {
    pub on_state_change: Option<StateCallback>,
    pub on_health_change: Option<HealthCallback>,
    /// Invoked with the attempt number each time a reconnect attempt is due.
    pub on_reconnect: Option<ReconnectCallback>,
    /// Invoked once when the reconnection policy gives up. Distinct from the
    /// plain Disconnected state change that accompanies it.
    pub on_retries_exhausted: Option<ExhaustedCallback>,
}

/// Reconnection and staleness policy, fixed at construction except for the
/// auto-reconnect switch.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub auto_reconnect: bool,
    pub max_attempts: u32,
    pub stale_frame_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            auto_reconnect: true,
            max_attempts: 10,
            stale_frame_timeout: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Delay preceding attempt `attempt` (1-based): 1, 2, 4, 8, 16 then
    /// 30 seconds for everything beyond the ladder.
    pub fn delay_for_attempt(attempt: u32) -> Duration {
        let index = (attempt.saturating_sub(1) as usize).min(BACKOFF_SEQUENCE.len() - 1);
        Duration::from_secs(BACKOFF_SEQUENCE[index])
    }
}

/// Read-only snapshot of the manager's internals, rebuilt on demand.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub health: ConnectionHealth,
    pub protocol: Protocol,
    pub connected_since: Option<Instant>,
    pub last_frame_time: Option<Instant>,
    pub total_frames: u64,
    pub dropped_frames: u64,
    pub reconnect_attempts: u32,
}

struct ManagerState {
    state: ConnectionState,
    health: ConnectionHealth,
    tracker: FrameRateTracker,
    reconnect_attempts: u32,
    connected_since: Option<Instant>,
    total_frames: u64,
    dropped_frames: u64,
    auto_reconnect: bool,
}

impl ManagerState {
    fn new(auto_reconnect: bool) -> Self {
        ManagerState {
            state: ConnectionState::Disconnected,
            health: ConnectionHealth::Critical,
            tracker: FrameRateTracker::new(),
            reconnect_attempts: 0,
            connected_since: None,
            total_frames: 0,
            dropped_frames: 0,
            auto_reconnect,
        }
    }
}

struct Task {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Task {
    /// Cancel without waiting; the task exits at its next checkpoint.
    fn cancel(self) {
        self.token.cancel();
    }

    /// Cancel and wait until the task has fully stopped, so no callback can
    /// fire after this returns.
    async fn join(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

/// What a connection-lost report turned into.
enum LossOutcome {
    Noop,
    Reconnecting { first_delay: Duration },
    GaveUp { attempts: u32 },
}

struct Inner {
    protocol: Protocol,
    max_attempts: u32,
    stale_frame_timeout: Duration,
    /// Serializes transition + notification; acquired before `state`.
    notify: Mutex<()>,
    state: Mutex<ManagerState>,
    callbacks: ConnectionCallbacks,
    monitor: Mutex<Option<Task>>,
    reconnect: Mutex<Option<Task>>,
}

impl Inner {
    // Dispatch helpers; only called while the notify lock is held.

    fn dispatch_state(&self, state: ConnectionState) {
        info!("connection state changed: {}", state);
        if let Some(cb) = &self.callbacks.on_state_change {
            cb(state);
        }
    }

    fn dispatch_health(&self, health: ConnectionHealth) {
        if let Some(cb) = &self.callbacks.on_health_change {
            cb(health);
        }
    }

    fn dispatch_reconnect(&self, attempt: u32) {
        if let Some(cb) = &self.callbacks.on_reconnect {
            cb(attempt);
        }
    }

    fn dispatch_exhausted(&self, attempts: u32) {
        if let Some(cb) = &self.callbacks.on_retries_exhausted {
            cb(attempts);
        }
    }

    /// Apply a connection-lost transition. Caller holds the notify lock.
    fn loss_transition(&self, s: &mut ManagerState) -> LossOutcome {
        match s.state {
            // Duplicate or late report; nothing to do. A loss while a
            // reconnect timer is already armed is equally ignored, the
            // pending attempt covers it.
            ConnectionState::Disconnected | ConnectionState::Reconnecting => LossOutcome::Noop,
            ConnectionState::Connected | ConnectionState::Connecting => {
                s.connected_since = None;
                s.tracker.reset();
                s.health = ConnectionHealth::Critical;

                if s.auto_reconnect && s.reconnect_attempts < self.max_attempts {
                    s.state = ConnectionState::Reconnecting;
                    LossOutcome::Reconnecting {
                        first_delay: ReconnectPolicy::delay_for_attempt(s.reconnect_attempts + 1),
                    }
                } else {
                    s.state = ConnectionState::Disconnected;
                    LossOutcome::GaveUp {
                        attempts: s.reconnect_attempts,
                    }
                }
            }
        }
    }

    /// Arm the deferred-reconnect ladder. Caller holds the notify lock, so
    /// at most one timer is ever pending.
    fn schedule_reconnect(self: &Arc<Self>, first_delay: Duration) {
        let mut slot = self.reconnect.lock().unwrap();
        if let Some(task) = slot.take() {
            task.cancel();
        }

        let inner = Arc::clone(self);
        let token = CancellationToken::new();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut delay = first_delay;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                enum Step {
                    Abort,
                    Exhausted(u32),
                    Attempt(u32),
                }

                let next = {
                    let _n = inner.notify.lock().unwrap();
                    if task_token.is_cancelled() {
                        return;
                    }

                    let step = {
                        let mut s = inner.state.lock().unwrap();
                        if s.state != ConnectionState::Reconnecting {
                            Step::Abort
                        } else if s.reconnect_attempts >= inner.max_attempts {
                            // The previous attempt was the last allowed one
                            // and it never produced a connection.
                            s.state = ConnectionState::Disconnected;
                            Step::Exhausted(s.reconnect_attempts)
                        } else {
                            s.reconnect_attempts += 1;
                            Step::Attempt(s.reconnect_attempts)
                        }
                    };

                    match step {
                        Step::Abort => None,
                        Step::Exhausted(attempts) => {
                            warn!(
                                "max reconnection attempts ({}) reached, giving up",
                                attempts
                            );
                            inner.dispatch_state(ConnectionState::Disconnected);
                            inner.dispatch_exhausted(attempts);
                            None
                        }
                        Step::Attempt(attempt) => {
                            info!(
                                "reconnection attempt {}/{}",
                                attempt, inner.max_attempts
                            );
                            inner.dispatch_reconnect(attempt);
                            Some(ReconnectPolicy::delay_for_attempt(attempt + 1))
                        }
                    }
                };

                match next {
                    Some(d) => delay = d,
                    None => return,
                }
            }
        });

        *slot = Some(Task { token, handle });
    }

    /// Arm a one-shot fallback for a manual attempt made while
    /// auto-reconnect is off: with no ladder to continue on, an attempt
    /// that produces no connection within its window settles the machine
    /// back in Disconnected instead of stranding it in Reconnecting.
    fn schedule_disconnect_fallback(self: &Arc<Self>, delay: Duration) {
        let mut slot = self.reconnect.lock().unwrap();
        if let Some(task) = slot.take() {
            task.cancel();
        }

        let inner = Arc::clone(self);
        let token = CancellationToken::new();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let _n = inner.notify.lock().unwrap();
            if task_token.is_cancelled() {
                return;
            }
            let changed = {
                let mut s = inner.state.lock().unwrap();
                if s.state == ConnectionState::Reconnecting {
                    s.state = ConnectionState::Disconnected;
                    true
                } else {
                    false
                }
            };
            if changed {
                info!("manual reconnection attempt went unanswered");
                inner.dispatch_state(ConnectionState::Disconnected);
            }
        });

        *slot = Some(Task { token, handle });
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = self.reconnect.lock().unwrap().take() {
            task.cancel();
        }
    }
}

/// Handle to the connection manager; cheap to clone, all clones share the
/// same state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(protocol: Protocol, policy: ReconnectPolicy, callbacks: ConnectionCallbacks) -> Self {
        ConnectionManager {
            inner: Arc::new(Inner {
                protocol,
                max_attempts: policy.max_attempts,
                stale_frame_timeout: policy.stale_frame_timeout,
                notify: Mutex::new(()),
                state: Mutex::new(ManagerState::new(policy.auto_reconnect)),
                callbacks,
                monitor: Mutex::new(None),
                reconnect: Mutex::new(None),
            }),
        }
    }

    pub fn current_state(&self) -> ConnectionState {
        self.inner.state.lock().unwrap().state
    }

    pub fn current_health(&self) -> ConnectionHealth {
        self.inner.state.lock().unwrap().health
    }

    pub fn protocol(&self) -> Protocol {
        self.inner.protocol
    }

    /// Snapshot of state and counters, rebuilt on demand.
    pub fn connection_info(&self) -> ConnectionInfo {
        let s = self.inner.state.lock().unwrap();
        ConnectionInfo {
            state: s.state,
            health: s.health,
            protocol: self.inner.protocol,
            connected_since: s.connected_since,
            last_frame_time: s.tracker.last_frame(),
            total_frames: s.total_frames,
            dropped_frames: s.dropped_frames,
            reconnect_attempts: s.reconnect_attempts,
        }
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.inner.state.lock().unwrap().auto_reconnect = enabled;
        info!(
            "auto-reconnect {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    /// A start was requested; Disconnected becomes Connecting.
    pub fn report_connecting(&self) {
        let _n = self.inner.notify.lock().unwrap();
        let changed = {
            let mut s = self.inner.state.lock().unwrap();
            if s.state == ConnectionState::Disconnected {
                s.state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        };
        if changed {
            self.inner.dispatch_state(ConnectionState::Connecting);
        }
    }

    /// Called by the active adapter when a sender attached. Idempotent when
    /// already Connected; cancels any pending reconnect timer and resets the
    /// attempt counter.
    pub fn report_connection_established(&self) {
        let _n = self.inner.notify.lock().unwrap();
        let changed = {
            let mut s = self.inner.state.lock().unwrap();
            let was = s.state;
            s.state = ConnectionState::Connected;
            s.reconnect_attempts = 0;
            if was != ConnectionState::Connected {
                s.connected_since = Some(now());
                s.tracker.reset();
            }
            was != ConnectionState::Connected
        };
        self.inner.cancel_reconnect();
        if changed {
            self.inner.dispatch_state(ConnectionState::Connected);
        }
    }

    /// Called by the active adapter when the sender went away. A no-op when
    /// already Disconnected or while a reconnect timer is pending.
    pub fn report_connection_lost(&self) {
        let _n = self.inner.notify.lock().unwrap();
        let outcome = {
            let mut s = self.inner.state.lock().unwrap();
            self.inner.loss_transition(&mut s)
        };
        self.apply_loss_outcome(outcome);
    }

    /// Called by the frame source per decoded frame. Health accounting only;
    /// no state transition happens here.
    pub fn report_frame_received(&self) {
        let mut s = self.inner.state.lock().unwrap();
        s.tracker.record_frame(now());
        s.total_frames += 1;
    }

    /// Called by the frame source per decode failure.
    pub fn report_frame_dropped(&self) {
        let mut s = self.inner.state.lock().unwrap();
        s.dropped_frames += 1;
    }

    /// User-initiated retry: cancels any pending timer, resets the attempt
    /// counter and issues an immediate attempt.
    pub fn trigger_reconnect(&self) {
        let _n = self.inner.notify.lock().unwrap();
        self.inner.cancel_reconnect();

        let (changed, resume) = {
            let mut s = self.inner.state.lock().unwrap();
            let was = s.state;
            s.state = ConnectionState::Reconnecting;
            s.reconnect_attempts = 1;
            (was != ConnectionState::Reconnecting, s.auto_reconnect)
        };

        if changed {
            self.inner.dispatch_state(ConnectionState::Reconnecting);
        }
        info!("manual reconnection triggered");
        self.inner.dispatch_reconnect(1);

        // Fall back onto the backoff ladder if this attempt fails too;
        // without auto-reconnect the machine instead settles back in
        // Disconnected once the attempt window passes.
        if resume {
            self.inner
                .schedule_reconnect(ReconnectPolicy::delay_for_attempt(2));
        } else {
            self.inner
                .schedule_disconnect_fallback(ReconnectPolicy::delay_for_attempt(2));
        }
    }

    /// Begin the periodic health tick. Idempotent while already running.
    pub fn start_monitoring(&self) {
        let mut slot = self.inner.monitor.lock().unwrap();
        if slot.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let token = CancellationToken::new();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(MONITOR_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => return,
                    _ = interval.tick() => {}
                }
                if task_token.is_cancelled() {
                    return;
                }
                Inner::health_tick(&inner);
            }
        });

        *slot = Some(Task { token, handle });
        info!("connection monitoring started");
    }

    /// Stop the health tick. When this returns the tick task is gone and no
    /// further health callback will fire.
    pub async fn stop_monitoring(&self) {
        let task = self.inner.monitor.lock().unwrap().take();
        if let Some(task) = task {
            task.join().await;
            info!("connection monitoring stopped");
        }
    }

    /// Explicit stop: cancels both timers, waits them out, resets counters
    /// and settles in Disconnected. No callback fires after this returns.
    pub async fn stop(&self) {
        let reconnect = self.inner.reconnect.lock().unwrap().take();
        if let Some(task) = reconnect {
            task.join().await;
        }
        self.stop_monitoring().await;

        let _n = self.inner.notify.lock().unwrap();
        let changed = {
            let mut s = self.inner.state.lock().unwrap();
            let was = s.state;
            let auto = s.auto_reconnect;
            *s = ManagerState::new(auto);
            was != ConnectionState::Disconnected
        };
        if changed {
            self.inner.dispatch_state(ConnectionState::Disconnected);
        }
    }

    fn apply_loss_outcome(&self, outcome: LossOutcome) {
        match outcome {
            LossOutcome::Noop => {
                debug!("connection-lost report ignored in current state");
            }
            LossOutcome::Reconnecting { first_delay } => {
                info!("connection lost, retrying in {:?}", first_delay);
                self.inner.dispatch_state(ConnectionState::Reconnecting);
                self.inner.schedule_reconnect(first_delay);
            }
            LossOutcome::GaveUp { attempts } => {
                info!("connection lost, not reconnecting");
                self.inner.dispatch_state(ConnectionState::Disconnected);
                if attempts >= self.inner.max_attempts {
                    self.inner.dispatch_exhausted(attempts);
                }
            }
        }
    }
}

impl Inner {
    /// One health-tick iteration: stale-frame detection and health
    /// reclassification, both only while Connected.
    fn health_tick(inner: &Arc<Inner>) {
        let _n = inner.notify.lock().unwrap();

        enum TickOutcome {
            Nothing,
            HealthChanged(ConnectionHealth),
            Stale(LossOutcome),
        }

        let outcome = {
            let mut s = inner.state.lock().unwrap();
            if s.state != ConnectionState::Connected {
                // Health is meaningless off-connection; park it at Critical
                // without notifying anyone.
                s.health = ConnectionHealth::Critical;
                TickOutcome::Nothing
            } else {
                let at = now();
                let reference = s.tracker.last_frame().or(s.connected_since);
                let stale = match reference {
                    Some(t) => at.duration_since(t) > inner.stale_frame_timeout,
                    None => false,
                };

                if stale {
                    warn!(
                        "no frame for more than {:?}, treating as connection loss",
                        inner.stale_frame_timeout
                    );
                    TickOutcome::Stale(inner.loss_transition(&mut s))
                } else {
                    let health = s.tracker.classify(at);
                    if health != s.health {
                        debug!("connection health changed: {} -> {}", s.health, health);
                        s.health = health;
                        TickOutcome::HealthChanged(health)
                    } else {
                        TickOutcome::Nothing
                    }
                }
            }
        };

        match outcome {
            TickOutcome::Nothing => {}
            TickOutcome::HealthChanged(health) => inner.dispatch_health(health),
            TickOutcome::Stale(outcome) => match outcome {
                LossOutcome::Noop => {}
                LossOutcome::Reconnecting { first_delay } => {
                    inner.dispatch_state(ConnectionState::Reconnecting);
                    inner.schedule_reconnect(first_delay);
                }
                LossOutcome::GaveUp { attempts } => {
                    inner.dispatch_state(ConnectionState::Disconnected);
                    if attempts >= inner.max_attempts {
                        inner.dispatch_exhausted(attempts);
                    }
                }
            },
        }
    }
}

/// Current instant, routed through the tokio clock so paused-time tests can
/// drive staleness and health deterministically.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Recorder {
        states: Mutex<Vec<ConnectionState>>,
        healths: Mutex<Vec<ConnectionHealth>>,
        reconnects: Mutex<Vec<u32>>,
        exhausted: AtomicU32,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Recorder {
                states: Mutex::new(Vec::new()),
                healths: Mutex::new(Vec::new()),
                reconnects: Mutex::new(Vec::new()),
                exhausted: AtomicU32::new(0),
            })
        }

        fn callbacks(self: &Arc<Self>) -> ConnectionCallbacks {
            let a = Arc::clone(self);
            let b = Arc::clone(self);
            let c = Arc::clone(self);
            let d = Arc::clone(self);
            ConnectionCallbacks {
                on_state_change: Some(Arc::new(move |s| a.states.lock().unwrap().push(s))),
                on_health_change: Some(Arc::new(move |h| b.healths.lock().unwrap().push(h))),
                on_reconnect: Some(Arc::new(move |n| c.reconnects.lock().unwrap().push(n))),
                on_retries_exhausted: Some(Arc::new(move |n| {
                    d.exhausted.store(n, Ordering::SeqCst)
                })),
            }
        }

        fn states(&self) -> Vec<ConnectionState> {
            self.states.lock().unwrap().clone()
        }

        fn reconnects(&self) -> Vec<u32> {
            self.reconnects.lock().unwrap().clone()
        }
    }

    fn manager(recorder: &Arc<Recorder>, policy: ReconnectPolicy) -> ConnectionManager {
        ConnectionManager::new(Protocol::Rtmp, policy, recorder.callbacks())
    }

    #[test]
    fn backoff_ladder_matches_min_pow2_30() {
        let expected = [1u64, 2, 4, 8, 16, 30, 30, 30, 30, 30];
        for (i, secs) in expected.iter().enumerate() {
            assert_eq!(
                ReconnectPolicy::delay_for_attempt(i as u32 + 1),
                Duration::from_secs(*secs),
                "attempt {}",
                i + 1
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_then_connect_yields_connecting_connected() {
        let recorder = Recorder::new();
        let m = manager(&recorder, ReconnectPolicy::default());

        m.report_connecting();
        m.report_connection_established();

        assert_eq!(
            recorder.states(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert_eq!(m.current_state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn established_is_idempotent() {
        let recorder = Recorder::new();
        let m = manager(&recorder, ReconnectPolicy::default());

        m.report_connection_established();
        m.report_connection_established();
        m.report_connection_established();

        assert_eq!(recorder.states(), vec![ConnectionState::Connected]);
    }

    #[tokio::test(start_paused = true)]
    async fn loss_schedules_attempts_on_the_backoff_ladder() {
        let recorder = Recorder::new();
        let m = manager(&recorder, ReconnectPolicy::default());

        m.report_connection_established();
        m.report_connection_lost();
        assert_eq!(m.current_state(), ConnectionState::Reconnecting);

        // First attempt fires at 1s, not earlier
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(recorder.reconnects().is_empty());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(recorder.reconnects(), vec![1]);

        // Second attempt 2s later
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(recorder.reconnects(), vec![1, 2]);

        // Success resets the counter and lands in Connected
        m.report_connection_established();
        assert_eq!(m.current_state(), ConnectionState::Connected);
        assert_eq!(m.connection_info().reconnect_attempts, 0);

        assert_eq!(
            recorder.states(),
            vec![
                ConnectionState::Connected,
                ConnectionState::Reconnecting,
                ConnectionState::Connected
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn success_cancels_the_pending_timer() {
        let recorder = Recorder::new();
        let m = manager(&recorder, ReconnectPolicy::default());

        m.report_connection_established();
        m.report_connection_lost();
        m.report_connection_established();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(recorder.reconnects().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_is_a_distinct_notification() {
        let recorder = Recorder::new();
        let m = manager(
            &recorder,
            ReconnectPolicy {
                max_attempts: 3,
                ..Default::default()
            },
        );

        m.report_connection_established();
        m.report_connection_lost();

        // Attempts at 1s, +2s, +4s; exhaustion declared 8s after the third
        // attempt went unanswered.
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(recorder.reconnects(), vec![1, 2, 3]);
        assert_eq!(recorder.exhausted.load(Ordering::SeqCst), 3);
        assert_eq!(m.current_state(), ConnectionState::Disconnected);

        // And nothing further is ever scheduled
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(recorder.reconnects(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn loss_with_auto_reconnect_disabled_goes_disconnected() {
        let recorder = Recorder::new();
        let m = manager(
            &recorder,
            ReconnectPolicy {
                auto_reconnect: false,
                ..Default::default()
            },
        );

        m.report_connection_established();
        m.report_connection_lost();

        assert_eq!(m.current_state(), ConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(recorder.reconnects().is_empty());
        assert_eq!(recorder.exhausted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_loss_while_disconnected_is_noop() {
        let recorder = Recorder::new();
        let m = manager(&recorder, ReconnectPolicy::default());

        m.report_connection_lost();
        m.report_connection_lost();

        assert_eq!(m.current_state(), ConnectionState::Disconnected);
        assert!(recorder.states().is_empty());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(recorder.reconnects().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn loss_while_reconnecting_does_not_stack_timers() {
        let recorder = Recorder::new();
        let m = manager(&recorder, ReconnectPolicy::default());

        m.report_connection_established();
        m.report_connection_lost();
        // A late duplicate from the adapter must not arm a second timer
        m.report_connection_lost();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(recorder.reconnects(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_a_pending_reconnect() {
        let recorder = Recorder::new();
        let m = manager(&recorder, ReconnectPolicy::default());

        m.report_connection_established();
        m.report_connection_lost();
        m.stop().await;

        assert_eq!(m.current_state(), ConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(recorder.reconnects().is_empty());
        assert_eq!(m.connection_info().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_reconnect_resets_and_fires_immediately() {
        let recorder = Recorder::new();
        let m = manager(
            &recorder,
            ReconnectPolicy {
                max_attempts: 2,
                ..Default::default()
            },
        );

        m.report_connection_established();
        m.report_connection_lost();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(recorder.exhausted.load(Ordering::SeqCst), 2);

        // Manual retry after exhaustion: immediate attempt, counter back at 1
        m.trigger_reconnect();
        assert_eq!(*recorder.reconnects().last().unwrap(), 1);
        assert_eq!(m.current_state(), ConnectionState::Reconnecting);
        assert_eq!(m.connection_info().reconnect_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_retry_without_auto_reconnect_settles_disconnected() {
        let recorder = Recorder::new();
        let m = manager(
            &recorder,
            ReconnectPolicy {
                auto_reconnect: false,
                ..Default::default()
            },
        );

        m.report_connection_established();
        m.report_connection_lost();
        assert_eq!(m.current_state(), ConnectionState::Disconnected);

        m.trigger_reconnect();
        assert_eq!(m.current_state(), ConnectionState::Reconnecting);
        assert_eq!(recorder.reconnects(), vec![1]);

        // No ladder to continue on; the unanswered attempt falls back to
        // Disconnected after its window instead of sticking forever.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(m.current_state(), ConnectionState::Disconnected);
        assert_eq!(recorder.reconnects(), vec![1]);

        // A success arriving within the window still wins.
        m.trigger_reconnect();
        m.report_connection_established();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(m.current_state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn replayed_reports_are_protocol_independent() {
        let mut runs = Vec::new();

        for protocol in [Protocol::Rtmp, Protocol::Srt, Protocol::WebRtc] {
            let recorder = Recorder::new();
            let m = ConnectionManager::new(
                protocol,
                ReconnectPolicy::default(),
                recorder.callbacks(),
            );

            m.start_monitoring();
            m.report_connecting();
            m.report_connection_established();
            for _ in 0..60 {
                m.report_frame_received();
                tokio::time::sleep(Duration::from_millis(33)).await;
            }
            m.report_connection_lost();
            tokio::time::sleep(Duration::from_millis(1100)).await;
            m.report_connection_established();
            m.stop().await;

            runs.push((
                recorder.states(),
                recorder.healths.lock().unwrap().clone(),
                recorder.reconnects(),
            ));
        }

        assert_eq!(runs[0], runs[1]);
        assert_eq!(runs[1], runs[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_monitoring_silences_health_callbacks() {
        let recorder = Recorder::new();
        let m = manager(&recorder, ReconnectPolicy::default());

        m.start_monitoring();
        m.report_connection_established();
        for _ in 0..60 {
            m.report_frame_received();
            tokio::time::sleep(Duration::from_millis(33)).await;
        }
        let seen = recorder.healths.lock().unwrap().len();
        assert!(seen > 0, "expected at least one health change");
        assert_eq!(m.current_health(), ConnectionHealth::Excellent);

        m.stop_monitoring().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(recorder.healths.lock().unwrap().len(), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_frames_classify_critical() {
        let recorder = Recorder::new();
        let m = manager(&recorder, ReconnectPolicy::default());

        m.start_monitoring();
        m.report_connection_established();
        for _ in 0..10 {
            m.report_frame_received();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        assert_eq!(m.current_health(), ConnectionHealth::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_frames_count_as_connection_loss() {
        let recorder = Recorder::new();
        let m = manager(&recorder, ReconnectPolicy::default());

        m.start_monitoring();
        m.report_connection_established();
        m.report_frame_received();

        // Frames stop; after the stale timeout the tick converts this into
        // the same transition an explicit loss report would have caused.
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(m.current_state(), ConnectionState::Reconnecting);

        m.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn info_snapshot_tracks_counters() {
        let recorder = Recorder::new();
        let m = manager(&recorder, ReconnectPolicy::default());

        m.report_connection_established();
        m.report_frame_received();
        m.report_frame_received();
        m.report_frame_dropped();

        let info = m.connection_info();
        assert_eq!(info.state, ConnectionState::Connected);
        assert_eq!(info.total_frames, 2);
        assert_eq!(info.dropped_frames, 1);
        assert!(info.connected_since.is_some());
        assert!(info.last_frame_time.is_some());
        assert_eq!(info.protocol, Protocol::Rtmp);
    }
}
