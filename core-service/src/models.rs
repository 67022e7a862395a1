//! Owner-facing snapshot models.
//!
//! Both models are rebuilt from scratch on every refresh and published as a
//! whole, so an observer always sees one consistent state.

use bridge_traits::transport::NodeId;
use core_library::{LibraryRoot, RecentServer, TrustedNode};
use core_runtime::config::TranscodePolicy;
use core_runtime::events::ConnectionDirection;
use core_sync::{ConnectionState, ConnectionView, JobState, TranscodeCounters};
use serde::{Deserialize, Serialize};

/// Connections of one direction, split by admission state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionGroup {
    pub pending: Vec<ConnectionView>,
    pub accepted: Vec<ConnectionView>,
}

impl ConnectionGroup {
    fn push(&mut self, view: ConnectionView) {
        match view.state {
            ConnectionState::Pending => self.pending.push(view),
            ConnectionState::Accepted => self.accepted.push(view),
            // Refused or closed connections leave the registry right away
            ConnectionState::Denied | ConnectionState::Closed => {}
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Totals over every job of every live connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStats {
    pub active_jobs: u64,
    pub finished_jobs: u64,
    pub failed_jobs: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeModel {
    pub node_id: NodeId,
    pub display_name: String,
    /// Peers downloading from this node
    pub incoming: ConnectionGroup,
    /// Nodes this node downloads from
    pub outgoing: ConnectionGroup,
    pub stats: NodeStats,
    pub recent_servers: Vec<RecentServer>,
    pub trusted: Vec<TrustedNode>,
}

impl NodeModel {
    pub fn empty(node_id: NodeId, display_name: String) -> Self {
        Self {
            node_id,
            display_name,
            incoming: ConnectionGroup::default(),
            outgoing: ConnectionGroup::default(),
            stats: NodeStats::default(),
            recent_servers: Vec::new(),
            trusted: Vec::new(),
        }
    }

    pub(crate) fn build(
        node_id: NodeId,
        display_name: String,
        connections: Vec<ConnectionView>,
        recent_servers: Vec<RecentServer>,
        trusted: Vec<TrustedNode>,
    ) -> Self {
        let mut model = Self::empty(node_id, display_name);
        model.recent_servers = recent_servers;
        model.trusted = trusted;

        for view in connections {
            for job in &view.jobs {
                match job.state {
                    JobState::Finished { .. } => model.stats.finished_jobs += 1,
                    JobState::Failed { .. } => model.stats.failed_jobs += 1,
                    _ => model.stats.active_jobs += 1,
                }
                match view.direction {
                    ConnectionDirection::Incoming => model.stats.bytes_sent += job.bytes,
                    ConnectionDirection::Outgoing => model.stats.bytes_received += job.bytes,
                }
            }
            match view.direction {
                ConnectionDirection::Incoming => model.incoming.push(view),
                ConnectionDirection::Outgoing => model.outgoing.push(view),
            }
        }
        model
    }

    /// Look up a live connection.
    pub fn connection(&self, node_id: &NodeId, direction: ConnectionDirection) -> Option<&ConnectionView> {
        let group = match direction {
            ConnectionDirection::Incoming => &self.incoming,
            ConnectionDirection::Outgoing => &self.outgoing,
        };
        group
            .pending
            .iter()
            .chain(group.accepted.iter())
            .find(|view| &view.node_id == node_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryModel {
    pub roots: Vec<LibraryRoot>,
    pub total_files: u64,
    pub transcode_policy: TranscodePolicy,
    pub transcode: TranscodeCounters,
}

impl LibraryModel {
    pub(crate) fn build(
        roots: Vec<LibraryRoot>,
        transcode_policy: TranscodePolicy,
        transcode: TranscodeCounters,
    ) -> Self {
        let total_files = roots.iter().map(|root| root.file_count).sum();
        Self {
            roots,
            total_files,
            transcode_policy,
            transcode,
        }
    }
}
