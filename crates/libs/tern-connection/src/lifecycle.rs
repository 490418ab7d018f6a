//! App-lifecycle boundary.
//!
//! Mirrors the reachability boundary: the host reports foreground/background
//! transitions and the engine suspends reconnection while backgrounded (when
//! the policy says so), resuming on return to foreground.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppPhase {
    Foreground,
    Background,
}

pub trait AppLifecycleSource: Send + Sync {
    fn phase(&self) -> AppPhase;
    fn subscribe(&self) -> watch::Receiver<AppPhase>;
}

/// Lifecycle source for hosts without background transitions (servers, CLIs).
pub struct AlwaysForeground {
    tx: watch::Sender<AppPhase>,
}

impl Default for AlwaysForeground {
    fn default() -> Self {
        let (tx, _) = watch::channel(AppPhase::Foreground);
        Self { tx }
    }
}

impl AppLifecycleSource for AlwaysForeground {
    fn phase(&self) -> AppPhase {
        AppPhase::Foreground
    }

    fn subscribe(&self) -> watch::Receiver<AppPhase> {
        self.tx.subscribe()
    }
}

/// Hand-driven lifecycle source for tests and embedders bridging an OS
/// application object.
pub struct ManualLifecycle {
    tx: watch::Sender<AppPhase>,
}

impl ManualLifecycle {
    pub fn new(initial: AppPhase) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, phase: AppPhase) {
        self.tx.send_replace(phase);
    }
}

impl AppLifecycleSource for ManualLifecycle {
    fn phase(&self) -> AppPhase {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<AppPhase> {
        self.tx.subscribe()
    }
}
