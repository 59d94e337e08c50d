//! Leadership signal consumed by the scheduler.

use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

/// Source of leader election transitions.
///
/// `subscribe` yields `true` while this process holds leadership and `false`
/// otherwise. A closed channel means the gate is gone for good.
pub trait LeaderGate: Send + Sync {
    fn identity(&self) -> &str;

    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Single-process gate driven by explicit `acquire`/`relinquish` calls.
pub struct LocalLeaderGate {
    identity: String,
    leading: watch::Sender<bool>,
}

impl LocalLeaderGate {
    pub fn new() -> Self {
        Self::with_identity(Uuid::new_v4().to_string())
    }

    pub fn with_identity(identity: impl Into<String>) -> Self {
        let (leading, _) = watch::channel(false);
        Self {
            identity: identity.into(),
            leading,
        }
    }

    pub fn acquire(&self) {
        if !self.leading.send_replace(true) {
            info!(identity = %self.identity, "Leadership acquired");
        }
    }

    pub fn relinquish(&self) {
        if self.leading.send_replace(false) {
            info!(identity = %self.identity, "Leadership relinquished");
        }
    }

    pub fn is_leader(&self) -> bool {
        *self.leading.borrow()
    }
}

impl Default for LocalLeaderGate {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaderGate for LocalLeaderGate {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.leading.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transitions_reach_subscribers() {
        let gate = LocalLeaderGate::new();
        let mut rx = gate.subscribe();
        assert!(!*rx.borrow());

        gate.acquire();
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert!(gate.is_leader());

        gate.relinquish();
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
    }

    #[test]
    fn test_identities_are_unique() {
        assert_ne!(LocalLeaderGate::new().identity(), LocalLeaderGate::new().identity());
        assert_eq!(LocalLeaderGate::with_identity("pod-a").identity(), "pod-a");
    }
}
