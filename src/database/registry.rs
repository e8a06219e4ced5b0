//! Command Registry
//!
//! Maps a command name to everything the engine needs to run it: arity,
//! flags, a `prepare` function that extracts the read/write key sets from
//! the argument list, the executor itself, and an optional undo-log
//! generator. The table is built once at startup and shared immutably.
//!
//! Positive arity means an exact argument count (command name included);
//! negative arity means "at least that many". `GET` is 2, `MGET` is -2.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::database::db::{DataGroup, Db};
use crate::database::{arg_str, keyspace, lists, strings};
use crate::protocol::{CmdLine, Reply};

/// Default flag set: a write command.
pub const FLAG_WRITE: u32 = 0;
/// The command never mutates the keyspace.
pub const FLAG_READONLY: u32 = 1 << 0;
/// Dispatched outside the normal path; cannot be queued in MULTI.
pub const FLAG_SPECIAL: u32 = 1 << 1;

/// Extracts `(write_keys, read_keys)` from a command's arguments.
pub type PrepareFn = fn(&[Bytes]) -> (Vec<String>, Vec<String>);

/// Runs a command against a database under an already-locked key group.
pub type ExecFn = fn(&Arc<Db>, &mut DataGroup<'_>, &[Bytes]) -> Reply;

/// Produces the command lines that would undo a command, read before it runs.
pub type UndoFn = fn(&Db, &mut DataGroup<'_>, &[Bytes]) -> Vec<CmdLine>;

/// Key-range metadata in the shape of Redis `COMMAND` output.
#[derive(Debug, Clone, Copy)]
pub struct CommandExtra {
    pub signs: &'static [&'static str],
    pub first_key: i32,
    pub last_key: i32,
    pub key_step: i32,
}

/// An immutable command descriptor.
pub struct Command {
    pub name: &'static str,
    pub arity: i32,
    pub flags: u32,
    pub prepare: Option<PrepareFn>,
    pub executor: Option<ExecFn>,
    pub undo: Option<UndoFn>,
    pub extra: Option<CommandExtra>,
}

impl Command {
    pub fn is_readonly(&self) -> bool {
        self.flags & FLAG_READONLY != 0
    }

    pub fn is_special(&self) -> bool {
        self.flags & FLAG_SPECIAL != 0
    }

    /// Checks an actual argument count (command name included) against the
    /// declared arity.
    pub fn accepts_arity(&self, arg_count: usize) -> bool {
        validate_arity(self.arity, arg_count)
    }

    /// Entry of the COMMAND reply for this descriptor.
    pub fn desc_reply(&self) -> Reply {
        let mut parts = vec![
            Reply::bulk(Bytes::copy_from_slice(self.name.as_bytes())),
            Reply::integer(i64::from(self.arity)),
        ];
        if let Some(extra) = &self.extra {
            let signs = extra
                .signs
                .iter()
                .map(|sign| Bytes::copy_from_slice(sign.as_bytes()))
                .collect();
            parts.push(Reply::MultiBulk(signs));
            parts.push(Reply::integer(i64::from(extra.first_key)));
            parts.push(Reply::integer(i64::from(extra.last_key)));
            parts.push(Reply::integer(i64::from(extra.key_step)));
        }
        Reply::Raw(parts)
    }
}

/// Validates an argument count against an arity declaration.
pub fn validate_arity(arity: i32, arg_count: usize) -> bool {
    if arity >= 0 {
        arg_count == arity as usize
    } else {
        arg_count >= arity.unsigned_abs() as usize
    }
}

/// The process-wide command table, populated at startup and then read-only.
pub struct CommandTable {
    commands: HashMap<&'static str, Command>,
}

impl CommandTable {
    /// Builds the table with every built-in command registered.
    pub fn standard() -> Arc<Self> {
        let mut table = Self { commands: HashMap::new() };
        strings::register(&mut table);
        keyspace::register(&mut table);
        lists::register(&mut table);

        // Control commands dispatched outside the normal path. Registered
        // for arity checks and COMMAND introspection only.
        for (name, arity) in [
            ("select", 2),
            ("auth", 2),
            ("ping", -1),
            ("echo", 2),
            ("subscribe", -2),
            ("unsubscribe", -1),
            ("publish", 3),
            ("flushall", -1),
            ("bgrewriteaof", 1),
            ("command", -1),
        ] {
            table.register_special(name, arity);
        }
        Arc::new(table)
    }

    /// Registers a normal command. `name` must be lowercase.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &mut self,
        name: &'static str,
        arity: i32,
        flags: u32,
        prepare: PrepareFn,
        executor: ExecFn,
        undo: Option<UndoFn>,
        extra: Option<CommandExtra>,
    ) {
        debug_assert!(name.chars().all(|c| !c.is_ascii_uppercase()));
        self.commands.insert(
            name,
            Command {
                name,
                arity,
                flags,
                prepare: Some(prepare),
                executor: Some(executor),
                undo,
                extra,
            },
        );
    }

    /// Registers a command handled above the database layer (SELECT, AUTH,
    /// PUBLISH, ...). Such commands have no prepare/executor and cannot be
    /// queued inside MULTI.
    pub fn register_special(&mut self, name: &'static str, arity: i32) {
        self.commands.insert(
            name,
            Command {
                name,
                arity,
                flags: FLAG_SPECIAL,
                prepare: None,
                executor: None,
                undo: None,
                extra: None,
            },
        );
    }

    /// Looks up a descriptor; `name` must already be lowercase.
    pub fn lookup(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.values()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/* ---- prepare helpers ---- */

/// The first argument is the only key, read-only.
pub fn read_first_key(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), vec![arg_str(&args[0])])
}

/// The first argument is the only key, written.
pub fn write_first_key(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (vec![arg_str(&args[0])], Vec::new())
}

/// Every argument is a key, read-only (MGET, EXISTS).
pub fn read_all_keys(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), args.iter().map(arg_str).collect())
}

/// Every argument is a key, written (DEL).
pub fn write_all_keys(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (args.iter().map(arg_str).collect(), Vec::new())
}

/// Keys at even positions, written (MSET: key value key value ...).
pub fn write_alternate_keys(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (args.iter().step_by(2).map(arg_str).collect(), Vec::new())
}

/// The command touches no individual keys (KEYS, FLUSHDB, DBSIZE).
pub fn no_keys(_args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), Vec::new())
}

/* ---- undo helpers ---- */

/// Snapshot-undo for commands whose only key is the first argument.
pub fn undo_first_key(db: &Db, group: &mut DataGroup<'_>, args: &[Bytes]) -> Vec<CmdLine> {
    db.rollback_given_keys(group, &[arg_str(&args[0])])
}

/// Snapshot-undo for commands where every argument is a key.
pub fn undo_all_keys(db: &Db, group: &mut DataGroup<'_>, args: &[Bytes]) -> Vec<CmdLine> {
    let keys: Vec<String> = args.iter().map(arg_str).collect();
    db.rollback_given_keys(group, &keys)
}

/// Snapshot-undo for MSET-shaped argument lists.
pub fn undo_alternate_keys(db: &Db, group: &mut DataGroup<'_>, args: &[Bytes]) -> Vec<CmdLine> {
    let keys: Vec<String> = args.iter().step_by(2).map(arg_str).collect();
    db.rollback_given_keys(group, &keys)
}
