use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use super::types::{MembershipEvent, MembershipView};

/// A subscription to membership changes.
///
/// Nothing is buffered for a subscriber until it is created, and it never
/// ends while the service is alive. A subscriber that falls too far behind
/// gets a single [`MembershipEvent::Resync`] with the current view instead of
/// the events it missed. Dropping it and calling `subscribe()` again starts a
/// fresh sequence.
pub struct MembershipEvents {
    rx: broadcast::Receiver<MembershipEvent>,
    view: watch::Receiver<Arc<MembershipView>>,
}

impl MembershipEvents {
    pub(crate) fn new(
        rx: broadcast::Receiver<MembershipEvent>,
        view: watch::Receiver<Arc<MembershipView>>,
    ) -> Self {
        Self { rx, view }
    }

    /// Waits for the next event. Returns `None` only once the membership
    /// service has been dropped.
    pub async fn next(&mut self) -> Option<MembershipEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("Membership subscriber lagged by {} events, resyncing", missed);
                Some(MembershipEvent::Resync(self.view.borrow().clone()))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Latest snapshot, without waiting.
    pub fn current(&self) -> Arc<MembershipView> {
        self.view.borrow().clone()
    }
}
