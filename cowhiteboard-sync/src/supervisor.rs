//! Reconnection state machine.
//!
//! ```text
//!            activate            opened(id)
//!   Idle ─────────────► Connecting ─────────► Open
//!                          ▲   │                │
//!            retry elapsed │   │ closed(id)     │ closed(id)
//!                          │   ▼                │
//!                        Retrying ◄─────────────┘
//!
//!   any ── dispose ──► TornDown
//! ```
//!
//! The machine performs no I/O. Each transition returns the [`Directive`]s
//! the driver must carry out (open a socket, arm the retry timer, report a
//! status), which keeps every transition testable without a socket.
//! Retries are unbounded; only the delay is pluggable through [`Backoff`].

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::transport::ConnectionId;

/// Default delay between a close and the next connection attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(2000);

/// Connection status as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
        })
    }
}

/// Delay policy between connection attempts.
pub trait Backoff: Send + 'static {
    /// Delay before retry number `attempt` (1-based, reset after every
    /// successful open).
    fn delay(&self, attempt: u32) -> Duration;
}

/// The same delay before every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay(pub Duration);

impl Default for FixedDelay {
    fn default() -> Self {
        Self(DEFAULT_RECONNECT_DELAY)
    }
}

impl Backoff for FixedDelay {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Connecting(ConnectionId),
    Open(ConnectionId),
    Retrying,
    TornDown,
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Open a new connection with this id.
    Open(ConnectionId),
    /// Close the connection with this id.
    Close(ConnectionId),
    /// Arm the single retry timer.
    ScheduleRetry(Duration),
    /// Disarm the retry timer.
    CancelRetry,
    /// Publish a new status.
    Report(ConnectionStatus),
}

/// Reconnect state machine. Owns no sockets or timers; every transition
/// returns the [`Directive`]s for the driver to carry out.
pub struct Supervisor {
    state: SupervisorState,
    backoff: Box<dyn Backoff>,
    status: ConnectionStatus,
    next_id: ConnectionId,
    ever_connected: bool,
    retry_pending: bool,
    /// Consecutive failed attempts since the last successful open.
    attempt: u32,
    retries_scheduled: u64,
}

impl Supervisor {
    pub fn new(backoff: Box<dyn Backoff>) -> Self {
        Self {
            state: SupervisorState::Idle,
            backoff,
            status: ConnectionStatus::Disconnected,
            next_id: 1,
            ever_connected: false,
            retry_pending: false,
            attempt: 0,
            retries_scheduled: 0,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self::new(Box::new(FixedDelay(delay)))
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    pub fn retries_scheduled(&self) -> u64 {
        self.retries_scheduled
    }

    pub fn is_torn_down(&self) -> bool {
        self.state == SupervisorState::TornDown
    }

    /// Whether `id` is the connection the machine is currently tracking.
    pub fn is_current(&self, id: ConnectionId) -> bool {
        matches!(
            self.state,
            SupervisorState::Connecting(cur) | SupervisorState::Open(cur) if cur == id
        )
    }

    fn begin_attempt(&mut self) -> Directive {
        let id = self.next_id;
        self.next_id += 1;
        self.state = SupervisorState::Connecting(id);
        Directive::Open(id)
    }

    fn report(&mut self, status: ConnectionStatus) -> Option<Directive> {
        if self.status == status {
            return None;
        }
        self.status = status;
        Some(Directive::Report(status))
    }

    /// First activation (mount).
    pub fn activate(&mut self) -> Vec<Directive> {
        match self.state {
            SupervisorState::Idle => vec![self.begin_attempt()],
            other => {
                log::debug!("Supervisor already active ({other:?})");
                Vec::new()
            }
        }
    }

    pub fn on_opened(&mut self, id: ConnectionId) -> Vec<Directive> {
        match self.state {
            SupervisorState::Connecting(cur) if cur == id => {
                self.state = SupervisorState::Open(id);
                self.ever_connected = true;
                self.attempt = 0;
                self.report(ConnectionStatus::Connected).into_iter().collect()
            }
            _ => {
                log::debug!("Ignoring open of stale connection {id}");
                Vec::new()
            }
        }
    }

    pub fn on_closed(&mut self, id: ConnectionId) -> Vec<Directive> {
        if !self.is_current(id) {
            log::debug!("Ignoring close of stale connection {id}");
            return Vec::new();
        }

        self.state = SupervisorState::Retrying;
        let mut directives = Vec::with_capacity(2);
        // Never go straight from disconnected to reconnecting: a first attempt
        // that fails keeps reporting disconnected while it retries.
        if self.ever_connected {
            directives.extend(self.report(ConnectionStatus::Reconnecting));
        }

        self.attempt = self.attempt.saturating_add(1);
        let delay = self.backoff.delay(self.attempt);
        self.retry_pending = true;
        self.retries_scheduled += 1;
        log::info!(
            "Connection {id} closed, retry #{} in {}ms",
            self.attempt,
            delay.as_millis()
        );
        directives.push(Directive::ScheduleRetry(delay));
        directives
    }

    pub fn on_retry_elapsed(&mut self) -> Vec<Directive> {
        match self.state {
            SupervisorState::Retrying => {
                self.retry_pending = false;
                vec![self.begin_attempt()]
            }
            _ => Vec::new(),
        }
    }

    /// Tear down: cancel any pending retry and close any live connection.
    pub fn dispose(&mut self) -> Vec<Directive> {
        let mut directives = Vec::with_capacity(2);
        if self.retry_pending {
            self.retry_pending = false;
            directives.push(Directive::CancelRetry);
        }
        if let SupervisorState::Connecting(id) | SupervisorState::Open(id) = self.state {
            directives.push(Directive::Close(id));
        }
        self.state = SupervisorState::TornDown;
        directives
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(Box::new(FixedDelay::default()))
    }
}
