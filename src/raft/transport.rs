use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::raft::message::{Input, RaftMessage};
use crate::raft::types::PeerId;

/// Delivers messages between nodes and clients.
///
/// Delivery is fire-and-forget: a message to an unreachable peer is dropped
/// and the protocol's timers take care of retrying.
pub trait Transport: Send + Sync {
    fn deliver(&self, from: PeerId, to: PeerId, message: RaftMessage);
}

#[derive(Default)]
struct Links {
    endpoints: HashMap<PeerId, mpsc::Sender<Input>>,
    /// Directed links that currently drop traffic.
    severed: HashSet<(PeerId, PeerId)>,
}

/// In-process network connecting every registered endpoint's inbox.
///
/// Supports partitions so tests can cut and restore links at runtime.
#[derive(Default)]
pub struct LocalNetwork {
    links: Mutex<Links>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn links(&self) -> MutexGuard<'_, Links> {
        self.links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach an endpoint's inbox. Re-registering replaces the old inbox.
    pub fn register(&self, peer: PeerId, inbox: mpsc::Sender<Input>) {
        self.links().endpoints.insert(peer, inbox);
    }

    pub fn unregister(&self, peer: PeerId) {
        self.links().endpoints.remove(&peer);
    }

    /// Drop traffic between `a` and `b` in both directions.
    pub fn disconnect(&self, a: PeerId, b: PeerId) {
        let mut links = self.links();
        links.severed.insert((a, b));
        links.severed.insert((b, a));
    }

    pub fn reconnect(&self, a: PeerId, b: PeerId) {
        let mut links = self.links();
        links.severed.remove(&(a, b));
        links.severed.remove(&(b, a));
    }

    pub fn is_connected(&self, a: PeerId, b: PeerId) -> bool {
        !self.links().severed.contains(&(a, b))
    }
}

impl Transport for LocalNetwork {
    fn deliver(&self, from: PeerId, to: PeerId, message: RaftMessage) {
        let inbox = {
            let links = self.links();
            if links.severed.contains(&(from, to)) {
                tracing::trace!(from = %from, to = %to, message = message.name(), "Link down, dropping message");
                return;
            }
            match links.endpoints.get(&to) {
                Some(inbox) => inbox.clone(),
                None => {
                    tracing::trace!(from = %from, to = %to, message = message.name(), "Unknown peer, dropping message");
                    return;
                }
            }
        };
        let name = message.name();
        if let Err(e) = inbox.try_send(Input::Message { from, message }) {
            tracing::trace!(from = %from, to = %to, message = name, error = %e, "Inbox unavailable, dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivers_to_registered_inbox() {
        let network = LocalNetwork::new();
        let (tx, mut rx) = mpsc::channel(4);
        network.register(PeerId(2), tx);

        network.deliver(PeerId(1), PeerId(2), RaftMessage::AskForState);
        assert_eq!(
            rx.recv().await,
            Some(Input::message(PeerId(1), RaftMessage::AskForState))
        );

        // Unknown peers are silently dropped.
        network.deliver(PeerId(1), PeerId(3), RaftMessage::AskForState);
    }

    #[tokio::test]
    async fn test_severed_link_drops_both_directions() {
        let network = LocalNetwork::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        network.register(PeerId(1), tx1);
        network.register(PeerId(2), tx2);

        network.disconnect(PeerId(1), PeerId(2));
        assert!(!network.is_connected(PeerId(2), PeerId(1)));
        network.deliver(PeerId(1), PeerId(2), RaftMessage::WhoIsTheLeader);
        network.deliver(PeerId(2), PeerId(1), RaftMessage::WhoIsTheLeader);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());

        network.reconnect(PeerId(1), PeerId(2));
        network.deliver(PeerId(1), PeerId(2), RaftMessage::WhoIsTheLeader);
        assert!(rx2.try_recv().is_ok());
    }
}
