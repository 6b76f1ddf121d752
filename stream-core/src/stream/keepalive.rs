// =================================================================
// stream/keepalive.rs - Ping/Pong Keepalive Watchdog
// =================================================================

use std::time::Duration;
use tokio::time::Instant;

/// What the connection owner should do when the watchdog deadline fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Nothing due yet
    Wait,
    /// Send a ping now, a pong is expected within the pong timeout
    SendPing,
    /// No liveness signal in time; raised once per episode
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchdogState {
    Disarmed,
    Idle { next_ping: Instant },
    AwaitingPong { deadline: Instant },
    Tripped,
}

/// Timer-driven ping emission and pong-timeout detection.
///
/// The watchdog owns no timer itself: the caller sleeps until
/// [`Watchdog::next_deadline`] and then calls [`Watchdog::poll`]. This keeps
/// it deterministic and lets one task multiplex it with other events.
#[derive(Debug, Clone)]
pub struct Watchdog {
    ping_interval: Duration,
    pong_timeout: Duration,
    state: WatchdogState,
}

impl Watchdog {
    pub fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
            state: WatchdogState::Disarmed,
        }
    }

    /// A zero interval disables keepalive entirely
    pub fn is_enabled(&self) -> bool {
        !self.ping_interval.is_zero() && !self.pong_timeout.is_zero()
    }

    pub fn is_armed(&self) -> bool {
        !matches!(self.state, WatchdogState::Disarmed)
    }

    /// Start a fresh episode, first ping one interval from `now`
    pub fn arm(&mut self, now: Instant) {
        if !self.is_enabled() {
            self.state = WatchdogState::Disarmed;
            return;
        }
        self.state = WatchdogState::Idle {
            next_ping: now + self.ping_interval,
        };
    }

    pub fn disarm(&mut self) {
        self.state = WatchdogState::Disarmed;
    }

    /// Record a pong or any other inbound frame proving the link is alive
    pub fn on_liveness(&mut self, now: Instant) {
        match self.state {
            WatchdogState::AwaitingPong { .. } | WatchdogState::Idle { .. } => {
                self.state = WatchdogState::Idle {
                    next_ping: now + self.ping_interval,
                };
            }
            // A late pong does not revive a tripped episode
            WatchdogState::Tripped | WatchdogState::Disarmed => {}
        }
    }

    /// Instant at which [`Watchdog::poll`] has something to do
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            WatchdogState::Idle { next_ping } => Some(next_ping),
            WatchdogState::AwaitingPong { deadline } => Some(deadline),
            WatchdogState::Disarmed | WatchdogState::Tripped => None,
        }
    }

    pub fn poll(&mut self, now: Instant) -> WatchdogAction {
        match self.state {
            WatchdogState::Idle { next_ping } if now >= next_ping => {
                self.state = WatchdogState::AwaitingPong {
                    deadline: now + self.pong_timeout,
                };
                WatchdogAction::SendPing
            }
            WatchdogState::AwaitingPong { deadline } if now >= deadline => {
                self.state = WatchdogState::Tripped;
                WatchdogAction::Unhealthy
            }
            _ => WatchdogAction::Wait,
        }
    }
}
