//! Network connectivity state machine.
//!
//! Tracks radio association state from link events; it does not itself
//! implement reconnect backoff (the radio driver owns that). Provisioning
//! (push-button pairing) is entered only by explicit user action and always
//! exits back to `Disconnected`, after which a normal connect is attempted.
//!
//! Transitions:
//!   Disconnected -> Provisioning -> Disconnected -> Connected
//!   Disconnected -> Connected
//!   any -> Disconnected on link loss
//!   Disconnected -> Failed on association failure (retries like Disconnected)

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    #[default]
    Disconnected,
    Provisioning,
    Connected,
    Failed,
}

impl ConnectivityState {
    /// Short label for the status display.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectivityState::Disconnected => "disc",
            ConnectivityState::Provisioning => "WPS",
            ConnectivityState::Connected => "conn",
            ConnectivityState::Failed => "fail",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectivityState::Connected)
    }
}

/// Events from the link driver and the provisioning runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    LinkUp,
    LinkDown,
    AssociationFailed,
    ProvisioningStarted,
    ProvisioningSucceeded,
    ProvisioningFailed,
    ProvisioningTimedOut,
}

/// Transition edges for subscribers. Consumers react to edges, not levels,
/// so a reconnect triggers exactly one catch-up action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    CameUp,
    WentDown,
    /// Provisioning ended (success, failure, or timeout); a normal connect
    /// attempt should follow.
    ProvisioningEnded,
}

#[derive(Debug, Default)]
pub struct ConnectivityTracker {
    state: ConnectivityState,
}

impl ConnectivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    /// Apply a link event, returning the edge it produced, if any.
    pub fn apply(&mut self, event: LinkEvent) -> Option<Edge> {
        use ConnectivityState as S;
        use LinkEvent as E;

        let (next, edge) = match (self.state, event) {
            (S::Connected, E::LinkUp) => (S::Connected, None),
            (_, E::LinkUp) => (S::Connected, Some(Edge::CameUp)),

            (S::Connected, E::LinkDown) => (S::Disconnected, Some(Edge::WentDown)),
            // Link loss during provisioning is expected churn; stay in WPS.
            (S::Provisioning, E::LinkDown) => (S::Provisioning, None),
            (_, E::LinkDown) => (S::Disconnected, None),

            (S::Provisioning, E::AssociationFailed) => (S::Provisioning, None),
            (S::Connected, E::AssociationFailed) => (S::Failed, Some(Edge::WentDown)),
            (_, E::AssociationFailed) => (S::Failed, None),

            (_, E::ProvisioningStarted) => (S::Provisioning, None),

            (
                S::Provisioning,
                E::ProvisioningSucceeded | E::ProvisioningFailed | E::ProvisioningTimedOut,
            ) => (S::Disconnected, Some(Edge::ProvisioningEnded)),
            // Stale provisioning outcome after the flow already ended.
            (_, E::ProvisioningSucceeded | E::ProvisioningFailed | E::ProvisioningTimedOut) => {
                (self.state, None)
            }
        };

        if next != self.state {
            tracing::info!(from = self.state.label(), to = next.label(), "link state");
        }
        self.state = next;
        edge
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_connect() {
        let mut t = ConnectivityTracker::new();
        assert_eq!(t.apply(LinkEvent::LinkUp), Some(Edge::CameUp));
        assert_eq!(t.state(), ConnectivityState::Connected);
    }

    #[test]
    fn test_link_up_is_edge_not_level() {
        let mut t = ConnectivityTracker::new();
        assert_eq!(t.apply(LinkEvent::LinkUp), Some(Edge::CameUp));
        // Repeated level reports produce no further edges.
        assert_eq!(t.apply(LinkEvent::LinkUp), None);
        assert_eq!(t.apply(LinkEvent::LinkUp), None);
    }

    #[test]
    fn test_flap_produces_one_edge_per_transition() {
        let mut t = ConnectivityTracker::new();
        t.apply(LinkEvent::LinkUp);
        assert_eq!(t.apply(LinkEvent::LinkDown), Some(Edge::WentDown));
        assert_eq!(t.apply(LinkEvent::LinkUp), Some(Edge::CameUp));
        assert_eq!(t.apply(LinkEvent::LinkDown), Some(Edge::WentDown));
        assert_eq!(t.state(), ConnectivityState::Disconnected);
    }

    #[test]
    fn test_provisioning_round_trip() {
        let mut t = ConnectivityTracker::new();
        assert_eq!(t.apply(LinkEvent::ProvisioningStarted), None);
        assert_eq!(t.state(), ConnectivityState::Provisioning);

        // Supplicant churn while pairing does not leave the state.
        assert_eq!(t.apply(LinkEvent::LinkDown), None);
        assert_eq!(t.state(), ConnectivityState::Provisioning);

        assert_eq!(
            t.apply(LinkEvent::ProvisioningSucceeded),
            Some(Edge::ProvisioningEnded)
        );
        assert_eq!(t.state(), ConnectivityState::Disconnected);

        // The follow-up normal connect then brings the link up.
        assert_eq!(t.apply(LinkEvent::LinkUp), Some(Edge::CameUp));
    }

    #[test]
    fn test_provisioning_timeout_exits_to_disconnected() {
        let mut t = ConnectivityTracker::new();
        t.apply(LinkEvent::ProvisioningStarted);
        assert_eq!(
            t.apply(LinkEvent::ProvisioningTimedOut),
            Some(Edge::ProvisioningEnded)
        );
        assert_eq!(t.state(), ConnectivityState::Disconnected);
    }

    #[test]
    fn test_failed_retries_like_disconnected() {
        let mut t = ConnectivityTracker::new();
        assert_eq!(t.apply(LinkEvent::AssociationFailed), None);
        assert_eq!(t.state(), ConnectivityState::Failed);
        assert_eq!(t.apply(LinkEvent::LinkUp), Some(Edge::CameUp));
        assert_eq!(t.state(), ConnectivityState::Connected);
    }

    #[test]
    fn test_stale_provisioning_outcome_ignored() {
        let mut t = ConnectivityTracker::new();
        t.apply(LinkEvent::LinkUp);
        assert_eq!(t.apply(LinkEvent::ProvisioningSucceeded), None);
        assert_eq!(t.state(), ConnectivityState::Connected);
    }
}
