//! Database Engine
//!
//! The execution core of the server, layered like this:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   StandaloneServer                          │
//! │   SELECT / AUTH / PING / pub-sub / BGREWRITEAOF dispatch    │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐        ┌───────────┐  │
//! │  │  DB 0   │ │  DB 1   │ │  DB N   │ ──────>│ AOF sink  │  │
//! │  └────┬────┘ └─────────┘ └─────────┘        └───────────┘  │
//! │       │ registry lookup → lock keys → execute → version++   │
//! │  ┌────▼──────────────────────────────────┐                 │
//! │  │ data / ttl / version ConcurrentDicts  │                 │
//! │  └───────────────────────────────────────┘                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Command implementations are plug-ins: each module registers descriptors
//! into the [`registry::CommandTable`] and the engine never special-cases an
//! individual data command.

pub mod db;
pub mod entity;
pub mod facade;
pub mod keyspace;
pub mod lists;
pub mod pubsub;
pub mod registry;
pub mod strings;

pub use db::{AofSink, DataGroup, Db, KeyEventCallback};
pub use entity::{entity_to_cmd, expire_at_cmd, from_unix_millis, unix_millis, DataEntity};
pub use facade::StandaloneServer;
pub use pubsub::PubSubHub;
pub use registry::{Command, CommandTable};

use bytes::Bytes;

/// Decodes an argument as a key or option string.
pub(crate) fn arg_str(arg: &Bytes) -> String {
    String::from_utf8_lossy(arg).into_owned()
}

/// The lowercased command name of a command line.
pub(crate) fn cmd_name(line: &[Bytes]) -> String {
    String::from_utf8_lossy(&line[0]).to_lowercase()
}

/// Parses an integer argument.
pub(crate) fn parse_i64(arg: &Bytes) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}
