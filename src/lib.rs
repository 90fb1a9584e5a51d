//! Core runtime of a parameter-server training framework: node membership
//! under a single scheduler, reliable framed message transport, per-app
//! request dispatching, and a sharded key-value layer on top.
//!
//! A process becomes a node by building a [`PostOffice`] from its
//! configuration and calling [`PostOffice::start`]; worker processes then
//! construct a [`KVWorker`] to push and pull sharded key-value data against
//! the [`KVServer`]s, with the scheduler relaying membership and barriers.

#[macro_use]
mod utils;

mod app;
mod internal;

pub use app::kv::{
    default_slicer, Callback, KVMeta, KVPairs, KVServer,
    KVServerDefaultHandle, KVWorker, ReqHandle, SlicedKVs, Slicer,
};
pub use app::simple::{SimpleApp, SimpleData, SimpleHandle};
pub use internal::customer::{Customer, ReceiveHandle};
pub use internal::env::Environment;
pub use internal::message::{
    Command, Control, DataType, Message, Meta, Scalar,
};
pub use internal::node::{
    id_to_rank, server_rank_to_id, worker_rank_to_id, Node, NodeRole, Range,
    ALL_NODES, EMPTY, SCHEDULER_ID, SERVER_GROUP, WORKER_GROUP,
};
pub use internal::postoffice::{ExitCallback, PostOffice};
pub use internal::van::{Van, VanKind};
pub use utils::{PsError, SArray};

/// Keys of the sharded key-value store.
pub type Key = u64;

/// Largest representable key; the last server's range is closed at it.
pub const MAX_KEY: Key = Key::MAX;
