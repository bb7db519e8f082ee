use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::error::{RaftError, Result};
use crate::raft::cluster::ClusterConfiguration;
use crate::raft::log::Command;
use crate::raft::message::{ClientRequest, Input, RaftMessage};
use crate::raft::state::Role;
use crate::raft::transport::{LocalNetwork, Transport};
use crate::raft::types::{LogIndex, PeerId};

/// A network endpoint that talks to the cluster on behalf of an application.
///
/// Requests are answered asynchronously through the client's own inbox, so
/// one request is in flight at a time.
pub struct RaftClient {
    id: PeerId,
    transport: Arc<dyn Transport>,
    inbox: Mutex<mpsc::Receiver<Input>>,
    timeout: Duration,
}

impl RaftClient {
    pub fn new(
        id: PeerId,
        transport: Arc<dyn Transport>,
        inbox: mpsc::Receiver<Input>,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            transport,
            inbox: Mutex::new(inbox),
            timeout,
        }
    }

    /// Register a fresh endpoint on `network` and return a client for it.
    pub fn attach(id: PeerId, network: Arc<LocalNetwork>, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(64);
        network.register(id, tx);
        Self::new(id, network, rx, timeout)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Submit an application command through `via`, following redirects
    /// until the leader commits it. Returns the log index and the state
    /// machine's reply.
    pub async fn submit(&self, via: PeerId, command: Vec<u8>) -> Result<(LogIndex, Vec<u8>)> {
        let mut inbox = self.inbox.lock().await;
        let deadline = Instant::now() + self.timeout;
        let request = ClientRequest {
            client: self.id,
            command: Command::Application(command),
        };
        let mut target = via;
        self.transport
            .deliver(self.id, target, RaftMessage::ClientMessage(request));

        loop {
            match self.next_message(&mut inbox, deadline).await? {
                (_, RaftMessage::ClientResponse { index, result }) => return Ok((index, result)),
                (
                    _,
                    RaftMessage::LeaderIs {
                        leader: Some(leader),
                        pending: Some(pending),
                    },
                ) if leader != target => {
                    tracing::debug!(client = %self.id, from = %target, to = %leader, "Redirected to leader");
                    target = leader;
                    self.transport
                        .deliver(self.id, target, RaftMessage::ClientMessage(pending));
                }
                (_, RaftMessage::LeaderIs { leader, .. }) => {
                    return Err(RaftError::NotLeader(leader));
                }
                (from, other) => {
                    tracing::debug!(client = %self.id, from = %from, message = other.name(), "Ignoring unexpected reply");
                }
            }
        }
    }

    /// Ask `via` who leads the cluster. Followers forward the question to
    /// the leader they know about.
    pub async fn who_is_the_leader(&self, via: PeerId) -> Result<Option<PeerId>> {
        let mut inbox = self.inbox.lock().await;
        let deadline = Instant::now() + self.timeout;
        self.transport
            .deliver(self.id, via, RaftMessage::WhoIsTheLeader);
        loop {
            if let (_, RaftMessage::LeaderIs { leader, .. }) =
                self.next_message(&mut inbox, deadline).await?
            {
                return Ok(leader);
            }
        }
    }

    pub async fn ask_for_state(&self, node: PeerId) -> Result<Role> {
        let mut inbox = self.inbox.lock().await;
        let deadline = Instant::now() + self.timeout;
        self.transport.deliver(self.id, node, RaftMessage::AskForState);
        loop {
            if let (from, RaftMessage::IAmInState { state }) =
                self.next_message(&mut inbox, deadline).await?
            {
                if from == node {
                    return Ok(state);
                }
            }
        }
    }

    /// Request a membership change. Non-leaders forward it to the leader;
    /// progress is observable through the members' configurations.
    pub fn change_configuration(&self, via: PeerId, members: impl IntoIterator<Item = PeerId>) {
        let new_config = ClusterConfiguration::stable(0, members);
        tracing::info!(client = %self.id, via = %via, config = %new_config, "Requesting configuration change");
        self.transport
            .deliver(self.id, via, RaftMessage::ChangeConfiguration { new_config });
    }

    async fn next_message(
        &self,
        inbox: &mut mpsc::Receiver<Input>,
        deadline: Instant,
    ) -> Result<(PeerId, RaftMessage)> {
        loop {
            let input = tokio::time::timeout_at(deadline, inbox.recv())
                .await
                .map_err(|_| RaftError::Timeout(format!("{} got no reply in time", self.id)))?
                .ok_or_else(|| RaftError::ChannelClosed(format!("inbox of {} closed", self.id)))?;
            if let Input::Message { from, message } = input {
                return Ok((from, message));
            }
        }
    }
}
