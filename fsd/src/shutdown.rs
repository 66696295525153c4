//! Shutdown disposition and the idle governor: tracks how the daemon was asked to stop, merges
//! concurrent requests monotonically (an `Immediate` request always wins over a `Patient` one
//! already in flight), and runs the periodic checks that can themselves request a shutdown.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Error;

/// How urgently the daemon should stop. Ordered so a later-arriving request can only raise the
/// disposition already in effect, never lower it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Disposition {
    /// Wait for every mount and connection to drain on its own.
    Patient = 1,
    /// Give mounts and connections a fixed deadline, then proceed regardless.
    Short = 2,
    /// Cancel everything at once.
    Immediate = 3,
}

/// Deadline a `Short` shutdown gives outstanding work before proceeding anyway.
pub const SHORT_DEADLINE: Duration = Duration::from_secs(10);

/// How often the idle and emptiness checkers run.
pub const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const EMPTY_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

impl Disposition {
    /// Decodes the single-byte disposition value written to the shutdown channel file.
    pub fn from_byte(b: u8) -> Result<Self, Error> {
        match b {
            1 => Ok(Self::Patient),
            2 => Ok(Self::Short),
            3 => Ok(Self::Immediate),
            other => Err(Error::InvalidDisposition(other)),
        }
    }
}

/// Coordinates the daemon's shutdown: the current disposition (if any shutdown has been
/// requested yet), a [`CancellationToken`] that fires the moment an `Immediate` shutdown is
/// requested, and a notifier so callers can wait on "some shutdown was requested" without
/// polling.
pub struct ShutdownGovernor {
    level: AtomicU8,
    token: CancellationToken,
    notify: tokio::sync::Notify,
}

impl ShutdownGovernor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            level: AtomicU8::new(0),
            token: CancellationToken::new(),
            notify: tokio::sync::Notify::new(),
        })
    }

    /// Requests a shutdown at `disposition`, raising the effective disposition if a less urgent
    /// one is already in effect. Returns the disposition now in effect.
    pub fn trigger(&self, disposition: Disposition) -> Disposition {
        let requested = disposition as u8;
        let mut current = self.level.load(Ordering::SeqCst);
        while requested > current {
            match self.level.compare_exchange_weak(current, requested, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        let effective = self.current().expect("just set a disposition");
        info!(?effective, "shutdown requested");
        if effective == Disposition::Immediate {
            self.token.cancel();
        }
        self.notify.notify_waiters();
        effective
    }

    pub fn current(&self) -> Option<Disposition> {
        match self.level.load(Ordering::SeqCst) {
            0 => None,
            1 => Some(Disposition::Patient),
            2 => Some(Disposition::Short),
            _ => Some(Disposition::Immediate),
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.current().is_some()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Resolves once any disposition has been requested.
    pub async fn wait_for_trigger(&self) {
        if self.is_triggered() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for ShutdownGovernor {
    fn default() -> Self {
        Self {
            level: AtomicU8::new(0),
            token: CancellationToken::new(),
            notify: tokio::sync::Notify::new(),
        }
    }
}

/// Periodically checks whether every mount has been idle past `idle_timeout` and, if so,
/// requests a patient shutdown. Runs for the life of the process; exits once a shutdown has
/// already been requested by something else.
pub async fn run_idle_checker(
    governor: Arc<ShutdownGovernor>,
    last_activity: Arc<std::sync::Mutex<std::time::Instant>>,
    idle_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(IDLE_CHECK_INTERVAL);
    loop {
        ticker.tick().await;
        if governor.is_triggered() {
            return;
        }
        let idle_for = last_activity.lock().unwrap().elapsed();
        if idle_for >= idle_timeout {
            governor.trigger(Disposition::Patient);
            return;
        }
    }
}

/// Periodically checks whether the control-plane tree has no live mounts and no bound
/// listeners and, if so, requests a patient shutdown. This runs far less often than the idle
/// checker since an empty daemon is a steady state most deployments are happy to leave running.
pub async fn run_empty_checker(
    governor: Arc<ShutdownGovernor>,
    mounts: Arc<crate::mount::MountTable>,
    listeners: Arc<crate::listener::ListenerTable>,
) {
    let mut ticker = tokio::time::interval(EMPTY_CHECK_INTERVAL);
    loop {
        ticker.tick().await;
        if governor.is_triggered() {
            return;
        }
        if mounts.is_empty() && listeners.is_empty().await {
            governor.trigger(Disposition::Patient);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_ordering_is_monotone() {
        assert!(Disposition::Patient < Disposition::Short);
        assert!(Disposition::Short < Disposition::Immediate);
    }

    #[test]
    fn from_byte_rejects_unknown_values() {
        assert!(matches!(Disposition::from_byte(0), Err(Error::InvalidDisposition(0))));
        assert!(matches!(Disposition::from_byte(4), Err(Error::InvalidDisposition(4))));
    }

    #[test]
    fn trigger_never_lowers_the_effective_disposition() {
        let governor = ShutdownGovernor::new();
        assert_eq!(governor.trigger(Disposition::Short), Disposition::Short);
        assert_eq!(governor.trigger(Disposition::Patient), Disposition::Short);
        assert_eq!(governor.trigger(Disposition::Immediate), Disposition::Immediate);
    }

    #[tokio::test]
    async fn immediate_trigger_cancels_the_token() {
        let governor = ShutdownGovernor::new();
        let token = governor.cancellation_token();
        governor.trigger(Disposition::Immediate);
        assert!(token.is_cancelled());
    }
}
