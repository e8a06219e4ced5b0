//! # EmberKV - An In-Memory, Redis-Compatible Key-Value Server
//!
//! EmberKV speaks the RESP wire protocol over TCP and supports multiple
//! logical databases, per-key TTLs, optimistic MULTI/EXEC/WATCH
//! transactions, and append-only-file persistence.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              EmberKV                                 │
//! │                                                                      │
//! │  ┌────────────┐   ┌────────────┐   ┌──────────────────────────────┐  │
//! │  │ TCP Server │──>│  Protocol  │──>│      StandaloneServer        │  │
//! │  │ (accept)   │   │  Handler   │   │  SELECT / AUTH / pub-sub     │  │
//! │  └────────────┘   └─────┬──────┘   └──────────────┬───────────────┘  │
//! │                         │                         │                  │
//! │                   ┌─────▼──────┐       ┌──────────▼───────────────┐  │
//! │                   │    RESP    │       │   DB 0..N  (sharded      │  │
//! │                   │   Parser   │       │   dict, ttl, versions)   │  │
//! │                   └────────────┘       └───────┬─────────┬────────┘  │
//! │                                                │         │           │
//! │                                      ┌─────────▼──┐  ┌───▼────────┐  │
//! │                                      │ Time Wheel │  │ AOF Writer │  │
//! │                                      └────────────┘  └────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Bytes arrive on a socket and are parsed into multi-bulk arrays; the
//! handler routes each array through the standalone facade to the selected
//! database, which consults the command registry, takes ordered shard
//! locks, enforces TTLs lazily, tracks per-key versions for optimistic
//! transactions, and hands every successful write to the AOF persister.
//!
//! ## Module Overview
//!
//! - [`dict`]: sharded concurrent dictionary with ordered multi-key locking
//! - [`timewheel`]: hashed wheel scheduling deferred key expirations
//! - [`protocol`]: RESP reply taxonomy and streaming parser
//! - [`connection`]: per-client state, write draining, the fake connection
//! - [`database`]: per-database engine, command plug-ins, standalone facade
//! - [`aof`]: append-only-file persister, loader and rewrite
//! - [`server`]: TCP accept loop and graceful shutdown
//! - [`config`]: `key value` configuration files
//! - [`sync`]: wait group with timeout

pub mod aof;
pub mod config;
pub mod connection;
pub mod database;
pub mod dict;
pub mod protocol;
pub mod server;
pub mod sync;
pub mod timewheel;

// Re-export commonly used types for convenience
pub use aof::Persister;
pub use config::{FsyncPolicy, ServerConfig};
pub use connection::Connection;
pub use database::{DataEntity, Db, StandaloneServer};
pub use dict::ConcurrentDict;
pub use protocol::Reply;
pub use server::Handler;
pub use timewheel::TimeWheel;

/// The default port EmberKV listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// Version of EmberKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
