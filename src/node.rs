//! Static cluster topology: node types and nodes.
//!
//! `NodeType` configuration is loaded once and treated as immutable for the
//! life of the process; `Node` identity is `(id, birth_time)` so that a
//! restarted node is a distinct logical participant even if the OS-level
//! process id is reused.

use std::{collections::HashSet, net::SocketAddr};

use chrono::Utc;

/// Identifies a [`NodeType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeTypeId(pub u64);

/// Identifies a [`Node`]. Not unique across restarts on its own -- combine
/// with `birth_time` for that (see [`Node::is_same_incarnation`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

/// A deployment-defined class of cluster nodes sharing election priority
/// and a static peer list. Loaded at startup and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct NodeType {
    pub id: NodeTypeId,
    pub name: String,
    pub is_light: bool,
    pub peers: HashSet<NodeId>,
    /// Election priority: higher wins. Ties within a node type are broken
    /// by smaller `NodeId` (`spec.md` §4.4).
    pub priority: u32,
    /// Per-node-type election quorum policy, resolving `spec.md` §9 Open
    /// Question (a): the quorum policy is configurable per node type rather
    /// than being a single crate-wide guess.
    pub quorum: QuorumPolicy,
}

/// How many live peers must have been heard from recently before a node may
/// declare itself elected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumPolicy {
    /// Every currently-known peer must have announced within the last three
    /// announcement periods. This is the literal rule given in `spec.md`
    /// §4.4 and is the default.
    AllKnownPeers,
    /// A strict majority of currently-known peers must have announced
    /// within the last three announcement periods.
    Majority,
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        QuorumPolicy::AllKnownPeers
    }
}

/// A single cluster participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub node_type: NodeTypeId,
    pub control_addr: SocketAddr,
    pub data_addr: SocketAddr,
    /// Millisecond epoch timestamp at which this incarnation of the node
    /// started. Distinguishes a restarted node from its previous
    /// incarnation even though `id` is unchanged.
    pub birth_time: u64,
}

impl Node {
    /// Birth time for "now", used when constructing the local node at
    /// startup.
    pub fn now_millis() -> u64 {
        Utc::now().timestamp_millis() as u64
    }

    /// Two `Node` values refer to the same running process iff both `id`
    /// and `birth_time` agree.
    pub fn is_same_incarnation(&self, other: &Node) -> bool {
        self.id == other.id && self.birth_time == other.birth_time
    }
}
