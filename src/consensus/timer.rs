use std::pin::Pin;

use rand::Rng;
use tokio::time::{Duration, Instant, Sleep, sleep_until};

use crate::config::Config;

/// Events that can be emitted when a timer expires.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum TimerType {
    /// Election timer expired.
    Election,
    /// Heartbeat timer expired.
    Heartbeat,
}

/// The single owned alarm driving a node.
///
/// Exactly one timer is armed at a time: the heartbeat ticker while the node
/// is Leader, the randomized election timer otherwise. Re-arming on every
/// role transition guarantees the old alarm is cancelled.
#[derive(Debug)]
pub struct NodeTimer {
    config: Config,
    /// The currently active timer and its type.
    active_timer: (TimerType, Pin<Box<Sleep>>),
}

impl NodeTimer {
    /// Create a timer with the election alarm armed, as for a fresh Follower.
    pub fn new(config: Config) -> Self {
        let deadline = Instant::now() + Self::random_election_timeout(&config);
        Self { config, active_timer: (TimerType::Election, Box::pin(sleep_until(deadline))) }
    }

    /// Random duration within the configured election-timeout range. The
    /// jitter is what makes split votes improbable.
    fn random_election_timeout(config: &Config) -> Duration {
        rand::rng().random_range(config.election_timeout_min..=config.election_timeout_max)
    }

    fn set_timer(&mut self, timer_type: TimerType) {
        let duration = match timer_type {
            TimerType::Election => Self::random_election_timeout(&self.config),
            TimerType::Heartbeat => self.config.heartbeat_interval,
        };
        let deadline = Instant::now() + duration;
        self.active_timer = (timer_type, Box::pin(sleep_until(deadline)));
    }

    /// Arm a fresh randomized election timer, cancelling whatever was armed.
    pub fn reset_election_timer(&mut self) {
        self.set_timer(TimerType::Election);
    }

    /// Arm the heartbeat ticker, cancelling whatever was armed.
    pub fn reset_heartbeat_timer(&mut self) {
        self.set_timer(TimerType::Heartbeat);
    }

    /// Wait for the active timer to expire and report which one fired. The
    /// expired timer is re-armed with a fresh deadline of the same type.
    pub async fn wait_for_timer_and_emit_event(&mut self) -> TimerType {
        let (timer_type, future) = &mut self.active_timer;
        future.await;
        let expired_timer_type = *timer_type;

        match expired_timer_type {
            TimerType::Election => self.reset_election_timer(),
            TimerType::Heartbeat => self.reset_heartbeat_timer(),
        }

        expired_timer_type
    }
}
