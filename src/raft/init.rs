//! Init role: discovering peers and waiting for a configuration.

use crate::error::Result;
use crate::raft::cluster::ClusterConfiguration;
use crate::raft::machine::Machine;
use crate::raft::message::{RaftMessage, Timer};
use crate::raft::metadata::DomainEvent;
use crate::raft::state::Role;
use crate::raft::types::PeerId;

impl Machine {
    pub(super) fn on_init(&mut self, from: PeerId, message: RaftMessage) -> Result<()> {
        match message {
            RaftMessage::ChangeConfiguration { new_config } => {
                tracing::info!(
                    node_id = %self.state.id,
                    config = %new_config,
                    "Received configuration, becoming follower"
                );
                self.apply(DomainEvent::WithNewConfig {
                    term: None,
                    config: new_config,
                })?;
                self.goto(Role::Follower);
                Ok(())
            }
            RaftMessage::AppendEntries { member, .. } => {
                // A leader already exists; fetch its configuration and wait
                // for the next heartbeat as a candidate-in-waiting.
                tracing::info!(
                    node_id = %self.state.id,
                    leader = %member,
                    "Contacted by leader while initializing, requesting configuration"
                );
                self.send(member, RaftMessage::RequestConfiguration);
                self.state.config_requested_from = Some(member);
                self.goto(Role::Candidate);
                Ok(())
            }
            RaftMessage::RaftMemberAdded {
                member,
                keep_init_until,
            } => {
                let mut members = self.state.metadata.members();
                members.insert(self.state.id);
                members.insert(member);
                let found = members.len();
                self.apply(DomainEvent::WithNewConfig {
                    term: None,
                    config: ClusterConfiguration::stable(0, members),
                })?;
                tracing::info!(
                    node_id = %self.state.id,
                    member = %member,
                    found,
                    required = keep_init_until,
                    "Raft member added"
                );
                if keep_init_until <= found {
                    self.goto(Role::Follower);
                }
                Ok(())
            }
            other => self.on_common(from, other),
        }
    }

    pub(super) fn on_discovery_timeout(&mut self) {
        let seeds: Vec<PeerId> = self
            .state
            .settings
            .seeds
            .iter()
            .copied()
            .filter(|&seed| seed != self.state.id)
            .collect();
        tracing::debug!(node_id = %self.state.id, seeds = seeds.len(), "Discovering raft members");
        if seeds.is_empty() {
            // Nobody to discover; count ourselves so a lone node can start.
            let me = self.state.id;
            let keep_init_until = self.state.settings.keep_init_until_found;
            self.enqueue(
                me,
                RaftMessage::RaftMemberAdded {
                    member: me,
                    keep_init_until,
                },
            );
        }
        for seed in seeds {
            self.send(seed, RaftMessage::RaftMembersDiscoveryRequest);
        }
        self.arm(Timer::Discovery);
    }
}
