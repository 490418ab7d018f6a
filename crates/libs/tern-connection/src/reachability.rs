//! Network reachability boundary.
//!
//! The engine does not probe the network itself; the host application feeds
//! reachability through this trait. Reconnection attempts are suspended while
//! unreachable and resume immediately when reachability returns.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityStatus {
    Reachable,
    Unreachable,
}

pub trait ReachabilitySource: Send + Sync {
    fn status(&self) -> ReachabilityStatus;
    fn subscribe(&self) -> watch::Receiver<ReachabilityStatus>;
}

/// Reachability source that never reports loss. The default for hosts without
/// an OS reachability feed.
pub struct AlwaysReachable {
    tx: watch::Sender<ReachabilityStatus>,
}

impl Default for AlwaysReachable {
    fn default() -> Self {
        let (tx, _) = watch::channel(ReachabilityStatus::Reachable);
        Self { tx }
    }
}

impl ReachabilitySource for AlwaysReachable {
    fn status(&self) -> ReachabilityStatus {
        ReachabilityStatus::Reachable
    }

    fn subscribe(&self) -> watch::Receiver<ReachabilityStatus> {
        self.tx.subscribe()
    }
}

/// Hand-driven reachability source for tests and embedders that bridge an OS
/// monitor themselves.
pub struct ManualReachability {
    tx: watch::Sender<ReachabilityStatus>,
}

impl ManualReachability {
    pub fn new(initial: ReachabilityStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, status: ReachabilityStatus) {
        self.tx.send_replace(status);
    }
}

impl ReachabilitySource for ManualReachability {
    fn status(&self) -> ReachabilityStatus {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<ReachabilityStatus> {
        self.tx.subscribe()
    }
}
