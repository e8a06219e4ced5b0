//! Stored Values
//!
//! A [`DataEntity`] is an opaque value tagged by type. Strings cover the
//! bulk of the workload; lists exist so the type tag actually earns its
//! keep (WRONGTYPE replies, TYPE introspection). New kinds extend the enum.
//!
//! This module also knows how to serialize an entity back into the command
//! that recreates it, which is the heart of AOF rewrite and of
//! rollback-command synthesis.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::protocol::CmdLine;

/// A value stored under a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataEntity {
    /// A binary-safe string.
    Bytes(Bytes),
    /// A double-ended list.
    List(VecDeque<Bytes>),
}

impl DataEntity {
    /// The name reported by the TYPE command.
    pub fn type_name(&self) -> &'static str {
        match self {
            DataEntity::Bytes(_) => "string",
            DataEntity::List(_) => "list",
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            DataEntity::Bytes(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&VecDeque<Bytes>> {
        match self {
            DataEntity::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Serializes the minimal command that recreates `entity` under `key`.
///
/// Returns `None` for entities with nothing to restore (an empty list).
pub fn entity_to_cmd(key: &str, entity: &DataEntity) -> Option<CmdLine> {
    match entity {
        DataEntity::Bytes(data) => Some(vec![
            Bytes::from_static(b"SET"),
            Bytes::copy_from_slice(key.as_bytes()),
            data.clone(),
        ]),
        DataEntity::List(items) => {
            if items.is_empty() {
                return None;
            }
            let mut line = Vec::with_capacity(items.len() + 2);
            line.push(Bytes::from_static(b"RPUSH"));
            line.push(Bytes::copy_from_slice(key.as_bytes()));
            line.extend(items.iter().cloned());
            Some(line)
        }
    }
}

/// Serializes `PEXPIREAT key <unix-ms>` for the given expiration instant.
pub fn expire_at_cmd(key: &str, at: SystemTime) -> CmdLine {
    vec![
        Bytes::from_static(b"PEXPIREAT"),
        Bytes::copy_from_slice(key.as_bytes()),
        Bytes::from(unix_millis(at).to_string()),
    ]
}

/// Milliseconds since the Unix epoch (instants before the epoch clamp to 0).
pub fn unix_millis(at: SystemTime) -> u128 {
    at.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_millis()
}

/// The wall-clock instant `ms` milliseconds after the Unix epoch.
pub fn from_unix_millis(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}
