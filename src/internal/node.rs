//! Node identity, node/group id arithmetic, and server key ranges.

use serde::{Deserialize, Serialize};

use crate::Key;

/// Sentinel for "not yet assigned" ids and timestamps.
pub const EMPTY: i32 = -1;

/// The scheduler's fixed node id; also its singleton group id.
pub const SCHEDULER_ID: i32 = 1;

/// Group id addressing all server nodes.
pub const SERVER_GROUP: i32 = 2;

/// Group id addressing all worker nodes.
pub const WORKER_GROUP: i32 = 4;

/// Group id addressing every node in the system.
pub const ALL_NODES: i32 = SCHEDULER_ID + SERVER_GROUP + WORKER_GROUP;

/// Node id of the server with the given rank.
pub fn server_rank_to_id(rank: usize) -> i32 {
    (rank * 2 + 8) as i32
}

/// Node id of the worker with the given rank.
pub fn worker_rank_to_id(rank: usize) -> i32 {
    (rank * 2 + 9) as i32
}

/// Role-local rank of a node id.
pub fn id_to_rank(id: i32) -> usize {
    std::cmp::max((id - 8) / 2, 0) as usize
}

/// Functional role of a node.
#[derive(
    Debug, PartialEq, Eq, Copy, Clone, Hash, Serialize, Deserialize,
)]
pub enum NodeRole {
    Scheduler,
    Server,
    Worker,
}

/// Information identifying one node of the system.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Functional role.
    pub role: NodeRole,

    /// Node id; `EMPTY` until the scheduler assigns one.
    pub id: i32,

    /// Customer id of the app that registered this node.
    pub customer_id: i32,

    /// Hostname or IP address.
    pub hostname: String,

    /// Bound port.
    pub port: u16,

    /// True if this node re-joined in place of a dead one.
    pub is_recovered: bool,
}

impl Node {
    /// Creates an unassigned node of the given role.
    pub fn new(role: NodeRole) -> Self {
        Node {
            role,
            id: EMPTY,
            customer_id: 0,
            hostname: String::new(),
            port: 0,
            is_recovered: false,
        }
    }

    /// `host:port` string of this node.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Compact one-line form for logs.
    pub fn short_debug(&self) -> String {
        let tag = match self.role {
            NodeRole::Scheduler => "H",
            NodeRole::Server => "S",
            NodeRole::Worker => "W",
        };
        format!("{}[{}]", tag, self.id)
    }
}

/// A half-open key interval `[begin, end)`.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Default)]
pub struct Range {
    pub begin: Key,
    pub end: Key,
}

impl Range {
    pub fn new(begin: Key, end: Key) -> Self {
        Range { begin, end }
    }

    /// Interval length.
    pub fn size(&self) -> Key {
        self.end - self.begin
    }
}
