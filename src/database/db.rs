//! Per-Database Execution Engine
//!
//! One [`Db`] per logical database index. It owns three sharded
//! dictionaries (values, expirations, per-key versions) and realizes the
//! Redis execution contract on top of them:
//!
//! 1. Route the command: MULTI/EXEC/DISCARD/WATCH are control flow, a
//!    client inside MULTI gets its command queued, everything else runs
//!    immediately.
//! 2. Ask the registry which keys the command reads and writes, and lock
//!    exactly those shards in the deadlock-free order.
//! 3. Run the executor under the locks; on a successful write, bump the
//!    touched versions and hand the command line to the AOF sink.
//!
//! Expiration is enforced lazily on access; the time wheel task that fires
//! later is an optimization that reclaims memory for keys nobody touches.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use bytes::Bytes;
use tracing::trace;

use crate::connection::Connection;
use crate::database::entity::DataEntity;
use crate::database::registry::{validate_arity, CommandTable};
use crate::database::{arg_str, cmd_name, entity_to_cmd, expire_at_cmd};
use crate::dict::{ConcurrentDict, KeyGroup};
use crate::protocol::{cmd_line, CmdLine, Reply};
use crate::timewheel::TimeWheel;

/// Shard counts for the three dictionaries of a database.
const DATA_DICT_CAPACITY: usize = 256;
const TTL_DICT_CAPACITY: usize = 64;
const VERSION_DICT_CAPACITY: usize = 256;

/// A lock group over the data dictionary.
pub type DataGroup<'d> = KeyGroup<'d, DataEntity>;

/// Receives the command line of every successful write.
pub type AofSink = Arc<dyn Fn(CmdLine) + Send + Sync>;

/// Invoked after a key is inserted or deleted.
pub type KeyEventCallback = Arc<dyn Fn(usize, &str, &DataEntity) + Send + Sync>;

fn expire_task_key(index: usize, key: &str) -> String {
    // The wheel is shared by all databases, so the task key carries the
    // database index.
    format!("expire:{}:{}", index, key)
}

/// A single logical database.
pub struct Db {
    index: usize,
    data: ConcurrentDict<DataEntity>,
    // key -> absolute expiration instant; absence means no expiry
    ttl: ConcurrentDict<SystemTime>,
    // key -> version counter, bumped on every successful write
    version: ConcurrentDict<u32>,
    registry: Arc<CommandTable>,
    wheel: Arc<TimeWheel>,
    add_aof: RwLock<AofSink>,
    insert_callback: RwLock<Option<KeyEventCallback>>,
    delete_callback: RwLock<Option<KeyEventCallback>>,
}

impl Db {
    pub fn new(index: usize, registry: Arc<CommandTable>, wheel: Arc<TimeWheel>) -> Arc<Self> {
        Arc::new(Self {
            index,
            data: ConcurrentDict::with_capacity(DATA_DICT_CAPACITY),
            ttl: ConcurrentDict::with_capacity(TTL_DICT_CAPACITY),
            version: ConcurrentDict::with_capacity(VERSION_DICT_CAPACITY),
            registry,
            wheel,
            add_aof: RwLock::new(Arc::new(|_| {})),
            insert_callback: RwLock::new(None),
            delete_callback: RwLock::new(None),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Replaces the AOF sink. Installed by the standalone server once the
    /// persister is up.
    pub fn set_add_aof(&self, sink: AofSink) {
        *self.add_aof.write().unwrap() = sink;
    }

    pub fn set_insert_callback(&self, callback: Option<KeyEventCallback>) {
        *self.insert_callback.write().unwrap() = callback;
    }

    pub fn set_delete_callback(&self, callback: Option<KeyEventCallback>) {
        *self.delete_callback.write().unwrap() = callback;
    }

    /* ---- routing ---- */

    /// The single entry point realizing Redis execution semantics.
    pub fn exec(self: &Arc<Self>, conn: &Connection, line: &[Bytes]) -> Reply {
        if line.is_empty() {
            return Reply::error("ERR empty command");
        }
        let name = cmd_name(line);
        match name.as_str() {
            "multi" => {
                if line.len() != 1 {
                    return Reply::arg_num_err(&name);
                }
                start_multi(conn)
            }
            "discard" => {
                if line.len() != 1 {
                    return Reply::arg_num_err(&name);
                }
                discard_multi(conn)
            }
            "exec" => {
                if line.len() != 1 {
                    return Reply::arg_num_err(&name);
                }
                self.exec_multi(conn)
            }
            "watch" => {
                if !validate_arity(-2, line.len()) {
                    return Reply::arg_num_err(&name);
                }
                self.watch(conn, &line[1..])
            }
            "unwatch" => {
                if line.len() != 1 {
                    return Reply::arg_num_err(&name);
                }
                conn.unwatch_all();
                Reply::ok()
            }
            _ => {
                if conn.in_multi() {
                    return self.enqueue(conn, line);
                }
                self.exec_normal(line)
            }
        }
    }

    /// Runs one command outside any transaction.
    pub fn exec_normal(self: &Arc<Self>, line: &[Bytes]) -> Reply {
        let name = cmd_name(line);
        let Some(cmd) = self.registry.lookup(&name) else {
            return Reply::unknown_command_err(&name);
        };
        if !cmd.accepts_arity(line.len()) {
            return Reply::arg_num_err(&name);
        }
        let (Some(prepare), Some(executor)) = (cmd.prepare, cmd.executor) else {
            return Reply::error(format!("ERR command '{}' is not valid here", name));
        };
        let (write_keys, read_keys) = prepare(&line[1..]);
        let mut group = self.data.lock_keys(&write_keys, &read_keys);
        let reply = executor(self, &mut group, &line[1..]);
        if !cmd.is_readonly() && !reply.is_error() {
            self.after_write(&write_keys, line);
        }
        reply
    }

    /// Runs one command assuming its shards are already locked by `group`.
    fn exec_with_lock(self: &Arc<Self>, group: &mut DataGroup<'_>, line: &[Bytes]) -> Reply {
        let name = cmd_name(line);
        let Some(cmd) = self.registry.lookup(&name) else {
            return Reply::unknown_command_err(&name);
        };
        if !cmd.accepts_arity(line.len()) {
            return Reply::arg_num_err(&name);
        }
        let Some(executor) = cmd.executor else {
            return Reply::error(format!("ERR command '{}' is not valid here", name));
        };
        executor(self, group, &line[1..])
    }

    /// Bumps the version of each written key and feeds the AOF.
    fn after_write(&self, write_keys: &[String], line: &[Bytes]) {
        for key in write_keys {
            let next = self.version_of(key).wrapping_add(1);
            self.version.put(key.clone(), next);
        }
        let sink = self.add_aof.read().unwrap().clone();
        sink(line.to_vec());
    }

    /* ---- transactions ---- */

    /// Validates and queues a command sent while the connection is in MULTI.
    fn enqueue(&self, conn: &Connection, line: &[Bytes]) -> Reply {
        let name = cmd_name(line);
        let reply = match self.registry.lookup(&name) {
            None => Reply::unknown_command_err(&name),
            Some(cmd) if cmd.prepare.is_none() => {
                Reply::error(format!("ERR command '{}' cannot be used in MULTI", name))
            }
            Some(cmd) if !cmd.accepts_arity(line.len()) => Reply::arg_num_err(&name),
            Some(_) => {
                conn.enqueue_cmd(line.to_vec());
                return Reply::queued();
            }
        };
        // A bad command poisons the queue: EXEC will abort.
        if let Reply::Error(message) = &reply {
            conn.add_tx_error(message.clone());
        }
        reply
    }

    /// Commits the queued commands of `conn` atomically.
    fn exec_multi(self: &Arc<Self>, conn: &Connection) -> Reply {
        if !conn.in_multi() {
            return Reply::error("ERR EXEC without MULTI");
        }
        let queued = conn.queued_cmd_lines();
        let watching = conn.watching();
        let poisoned = conn.has_tx_errors();
        // Clearing the flag is atomic with execution from the client's
        // point of view: this connection processes commands serially.
        conn.set_multi(false);
        if poisoned {
            return Reply::exec_abort_err();
        }
        self.exec_queued(&queued, &watching)
    }

    /// Executes prepared command lines under one lock acquisition,
    /// aborting when any watched key's version moved.
    pub fn exec_queued(
        self: &Arc<Self>,
        cmd_lines: &[CmdLine],
        watching: &HashMap<String, u32>,
    ) -> Reply {
        let mut write_keys = Vec::new();
        let mut read_keys = Vec::new();
        for line in cmd_lines {
            if let Some(cmd) = self.registry.lookup(&cmd_name(line)) {
                if let Some(prepare) = cmd.prepare {
                    let (w, r) = prepare(&line[1..]);
                    write_keys.extend(w);
                    read_keys.extend(r);
                }
            }
        }
        read_keys.extend(watching.keys().cloned());

        let mut group = self.data.lock_keys(&write_keys, &read_keys);

        for (key, recorded) in watching {
            if self.version_of(key) != *recorded {
                trace!(db = self.index, key = %key, "watched key changed, aborting EXEC");
                return Reply::NullArray;
            }
        }

        let mut results = Vec::with_capacity(cmd_lines.len());
        for line in cmd_lines {
            let reply = self.exec_with_lock(&mut group, line);
            if !reply.is_error() {
                if let Some(cmd) = self.registry.lookup(&cmd_name(line)) {
                    if !cmd.is_readonly() {
                        if let Some(prepare) = cmd.prepare {
                            let (w, _) = prepare(&line[1..]);
                            self.after_write(&w, line);
                        }
                    }
                }
            }
            // Failures do not roll back earlier commands; the client sees
            // the per-command error in its slot.
            results.push(reply);
        }
        Reply::Raw(results)
    }

    /// Records the current version of each key on the connection.
    fn watch(&self, conn: &Connection, keys: &[Bytes]) -> Reply {
        if conn.in_multi() {
            return Reply::error("ERR WATCH inside MULTI is not allowed");
        }
        for key in keys {
            let key = arg_str(key);
            let version = self.version_of(&key);
            conn.watch_key(&key, version);
        }
        Reply::ok()
    }

    /// Generates the undo command lines for `line` without running it.
    ///
    /// Callers that want rollback material must collect it before
    /// executing; nothing in the engine applies these automatically.
    pub fn undo_logs(&self, group: &mut DataGroup<'_>, line: &[Bytes]) -> Vec<CmdLine> {
        match self.registry.lookup(&cmd_name(line)) {
            Some(cmd) => match cmd.undo {
                Some(undo) => undo(self, group, &line[1..]),
                None => Vec::new(),
            },
            None => Vec::new(),
        }
    }

    /// Synthesizes the commands that restore the current state of `keys`.
    pub fn rollback_given_keys(&self, group: &mut DataGroup<'_>, keys: &[String]) -> Vec<CmdLine> {
        let mut undo = Vec::new();
        for key in keys {
            let entity = if self.is_expired_now(key) { None } else { group.get(key) };
            match entity {
                None => undo.push(cmd_line(&["DEL", key.as_str()])),
                Some(entity) => {
                    if let Some(restore) = entity_to_cmd(key, entity) {
                        undo.push(restore);
                    }
                    match self.ttl.get(key) {
                        Some(at) => undo.push(expire_at_cmd(key, at)),
                        None => undo.push(cmd_line(&["PERSIST", key.as_str()])),
                    }
                }
            }
        }
        undo
    }

    /* ---- data access ---- */

    /// Reads an entity, honoring expiration.
    pub fn get_entity<'g>(&self, group: &'g DataGroup<'_>, key: &str) -> Option<&'g DataEntity> {
        if self.is_expired_now(key) {
            return None;
        }
        group.get(key)
    }

    /// Mutable read for write commands. An expired entry is removed first,
    /// which is why this requires the key's shard to be write-locked.
    pub fn get_entity_mut<'g>(
        &self,
        group: &'g mut DataGroup<'_>,
        key: &str,
    ) -> Option<&'g mut DataEntity> {
        if self.is_expired_now(key) {
            self.remove_entity(group, key);
            return None;
        }
        group.get_mut(key)
    }

    /// Removes an expired entry under a held write lock.
    pub fn prune_expired(&self, group: &mut DataGroup<'_>, key: &str) {
        if self.is_expired_now(key) {
            self.remove_entity(group, key);
        }
    }

    /// Inserts or replaces. Returns 1 on insert, 0 on replace.
    pub fn put_entity(&self, group: &mut DataGroup<'_>, key: &str, entity: DataEntity) -> usize {
        let inserted = group.put(key, entity);
        if inserted > 0 {
            self.fire_insert_callback(group, key);
        }
        inserted
    }

    pub fn put_entity_if_absent(
        &self,
        group: &mut DataGroup<'_>,
        key: &str,
        entity: DataEntity,
    ) -> usize {
        let inserted = group.put_if_absent(key, entity);
        if inserted > 0 {
            self.fire_insert_callback(group, key);
        }
        inserted
    }

    pub fn put_entity_if_exists(
        &self,
        group: &mut DataGroup<'_>,
        key: &str,
        entity: DataEntity,
    ) -> usize {
        group.put_if_exists(key, entity)
    }

    /// Removes a key together with its expiration and pending wheel task.
    pub fn remove_entity(&self, group: &mut DataGroup<'_>, key: &str) -> Option<DataEntity> {
        let removed = group.remove(key);
        self.ttl.remove(key);
        self.wheel.remove_job(expire_task_key(self.index, key));
        if let Some(entity) = &removed {
            let callback = self.delete_callback.read().unwrap().clone();
            if let Some(callback) = callback {
                callback(self.index, key, entity);
            }
        }
        removed
    }

    fn fire_insert_callback(&self, group: &DataGroup<'_>, key: &str) {
        let callback = self.insert_callback.read().unwrap().clone();
        if let Some(callback) = callback {
            if let Some(entity) = group.get(key) {
                callback(self.index, key, entity);
            }
        }
    }

    /// Drops every key, expiration and pending expire task state.
    pub fn flush(&self) {
        self.data.clear();
        self.ttl.clear();
        // Stale wheel tasks re-check the ttl dictionary before acting, so
        // they degrade to no-ops.
    }

    pub fn key_count(&self) -> usize {
        self.data.len()
    }

    /// Visits every live entry with its expiration instant.
    pub fn for_each_entity(
        &self,
        mut consumer: impl FnMut(&str, &DataEntity, Option<SystemTime>) -> bool,
    ) {
        self.data.for_each(|key, entity| consumer(key, entity, self.ttl.get(key)));
    }

    /// Direct handle to the data dictionary, for iteration-style commands.
    pub(crate) fn data(&self) -> &ConcurrentDict<DataEntity> {
        &self.data
    }

    /* ---- expiration ---- */

    fn is_expired_now(&self, key: &str) -> bool {
        matches!(self.ttl.get(key), Some(at) if SystemTime::now() > at)
    }

    /// The recorded expiration instant, if any.
    pub fn expiration_of(&self, key: &str) -> Option<SystemTime> {
        self.ttl.get(key)
    }

    /// Attaches an absolute expiration to `key` and schedules the deferred
    /// removal task.
    pub fn expire(self: &Arc<Self>, key: &str, at: SystemTime) {
        self.ttl.put(key.to_string(), at);
        let db = Arc::clone(self);
        let key = key.to_string();
        self.wheel.at(at, expire_task_key(self.index, &key), move || {
            let keys = vec![key.clone()];
            let mut group = db.data.lock_keys(&keys, &[]);
            // check-lock-check: the ttl may have been replaced or removed
            // while this task waited for the lock
            let Some(at) = db.ttl.get(&key) else { return };
            if SystemTime::now() > at {
                trace!(db = db.index, key = %key, "expired by wheel");
                db.remove_entity(&mut group, &key);
            }
        });
    }

    /// Drops the expiration of `key`. Returns true when one existed.
    pub fn persist_key(&self, key: &str) -> bool {
        let removed = self.ttl.remove(key).is_some();
        if removed {
            self.wheel.remove_job(expire_task_key(self.index, key));
        }
        removed
    }

    /* ---- versions ---- */

    /// Current version of `key`; absent keys report 0.
    pub fn version_of(&self, key: &str) -> u32 {
        self.version.get(key).unwrap_or(0)
    }
}

fn start_multi(conn: &Connection) -> Reply {
    if conn.in_multi() {
        return Reply::error("ERR MULTI calls can not be nested");
    }
    conn.set_multi(true);
    Reply::ok()
}

fn discard_multi(conn: &Connection) -> Reply {
    if !conn.in_multi() {
        return Reply::error("ERR DISCARD without MULTI");
    }
    conn.set_multi(false);
    Reply::ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cmd_line;
    use std::time::Duration;

    fn test_db() -> Arc<Db> {
        let wheel = Arc::new(TimeWheel::new(Duration::from_millis(20), 16));
        Db::new(0, CommandTable::standard(), wheel)
    }

    fn exec(db: &Arc<Db>, conn: &Connection, parts: &[&str]) -> Reply {
        db.exec(conn, &cmd_line(parts))
    }

    #[test]
    fn test_set_then_get() {
        let db = test_db();
        let (conn, _) = Connection::fake();
        assert_eq!(exec(&db, &conn, &["SET", "k", "v"]), Reply::ok());
        assert_eq!(
            exec(&db, &conn, &["GET", "k"]),
            Reply::bulk(Bytes::from_static(b"v"))
        );
        assert_eq!(exec(&db, &conn, &["GET", "missing"]), Reply::Null);
    }

    #[test]
    fn test_unknown_command_and_arity() {
        let db = test_db();
        let (conn, _) = Connection::fake();
        assert_eq!(
            exec(&db, &conn, &["NOPE"]),
            Reply::unknown_command_err("nope")
        );
        assert_eq!(exec(&db, &conn, &["SET"]), Reply::arg_num_err("set"));
        assert_eq!(exec(&db, &conn, &["GET", "a", "b"]), Reply::arg_num_err("get"));
    }

    #[test]
    fn test_versions_bump_on_write_only() {
        let db = test_db();
        let (conn, _) = Connection::fake();
        assert_eq!(db.version_of("k"), 0);
        exec(&db, &conn, &["SET", "k", "1"]);
        assert_eq!(db.version_of("k"), 1);
        exec(&db, &conn, &["GET", "k"]);
        assert_eq!(db.version_of("k"), 1);
        exec(&db, &conn, &["SET", "k", "2"]);
        assert_eq!(db.version_of("k"), 2);
        exec(&db, &conn, &["DEL", "k"]);
        assert_eq!(db.version_of("k"), 3);
    }

    #[test]
    fn test_failed_write_does_not_log_or_bump() {
        let db = test_db();
        let (conn, _) = Connection::fake();
        let logged = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&logged);
        db.set_add_aof(Arc::new(move |line| sink.lock().unwrap().push(line)));

        exec(&db, &conn, &["SET", "k", "abc"]);
        let before = db.version_of("k");
        let reply = exec(&db, &conn, &["INCR", "k"]);
        assert!(reply.is_error());
        assert_eq!(db.version_of("k"), before);
        assert_eq!(logged.lock().unwrap().len(), 1, "only the SET is logged");
    }

    #[test]
    fn test_lazy_expiration_without_resurrection() {
        let db = test_db();
        let (conn, _) = Connection::fake();
        exec(&db, &conn, &["SET", "k", "v"]);
        db.expire("k", SystemTime::now() - Duration::from_millis(1));

        assert_eq!(exec(&db, &conn, &["GET", "k"]), Reply::Null);
        assert_eq!(exec(&db, &conn, &["GET", "k"]), Reply::Null);
        assert_eq!(exec(&db, &conn, &["EXISTS", "k"]), Reply::integer(0));
    }

    #[test]
    fn test_wheel_removes_expired_key() {
        let db = test_db();
        let (conn, _) = Connection::fake();
        exec(&db, &conn, &["SET", "k", "v"]);
        db.expire("k", SystemTime::now() + Duration::from_millis(30));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while db.data().contains_key("k") && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!db.data().contains_key("k"), "wheel task should remove the key");
        assert_eq!(db.expiration_of("k"), None);
    }

    #[test]
    fn test_expire_then_persist_cancels() {
        let db = test_db();
        let (conn, _) = Connection::fake();
        exec(&db, &conn, &["SET", "k", "v"]);
        db.expire("k", SystemTime::now() + Duration::from_millis(40));
        assert!(db.persist_key("k"));
        assert!(!db.persist_key("k"));

        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(
            exec(&db, &conn, &["GET", "k"]),
            Reply::bulk(Bytes::from_static(b"v"))
        );
    }

    #[test]
    fn test_transaction_happy_path() {
        let db = test_db();
        let (conn, _) = Connection::fake();
        assert_eq!(exec(&db, &conn, &["MULTI"]), Reply::ok());
        assert_eq!(exec(&db, &conn, &["SET", "a", "1"]), Reply::queued());
        assert_eq!(exec(&db, &conn, &["SET", "b", "2"]), Reply::queued());
        assert_eq!(
            exec(&db, &conn, &["EXEC"]),
            Reply::Raw(vec![Reply::ok(), Reply::ok()])
        );
        assert!(!conn.in_multi());
        assert_eq!(
            exec(&db, &conn, &["GET", "a"]),
            Reply::bulk(Bytes::from_static(b"1"))
        );
    }

    #[test]
    fn test_multi_control_errors() {
        let db = test_db();
        let (conn, _) = Connection::fake();
        assert_eq!(
            exec(&db, &conn, &["EXEC"]),
            Reply::error("ERR EXEC without MULTI")
        );
        assert_eq!(
            exec(&db, &conn, &["DISCARD"]),
            Reply::error("ERR DISCARD without MULTI")
        );
        exec(&db, &conn, &["MULTI"]);
        assert!(exec(&db, &conn, &["MULTI"]).is_error());
        exec(&db, &conn, &["DISCARD"]);
        assert!(!conn.in_multi());
    }

    #[test]
    fn test_discard_drops_queued_commands() {
        let db = test_db();
        let (conn, _) = Connection::fake();
        exec(&db, &conn, &["MULTI"]);
        exec(&db, &conn, &["SET", "a", "1"]);
        exec(&db, &conn, &["DISCARD"]);
        assert_eq!(exec(&db, &conn, &["GET", "a"]), Reply::Null);
    }

    #[test]
    fn test_queued_syntax_error_aborts_exec() {
        let db = test_db();
        let (conn, _) = Connection::fake();
        exec(&db, &conn, &["MULTI"]);
        assert_eq!(exec(&db, &conn, &["SET", "a", "1"]), Reply::queued());
        assert!(exec(&db, &conn, &["NOPE", "x"]).is_error());
        assert_eq!(exec(&db, &conn, &["EXEC"]), Reply::exec_abort_err());
        // Nothing from the poisoned queue ran.
        assert_eq!(exec(&db, &conn, &["GET", "a"]), Reply::Null);
    }

    #[test]
    fn test_watch_miss_aborts_exec() {
        let db = test_db();
        let (watcher, _) = Connection::fake();
        let (writer, _) = Connection::fake();

        assert_eq!(exec(&db, &watcher, &["WATCH", "k"]), Reply::ok());
        exec(&db, &watcher, &["MULTI"]);
        assert_eq!(exec(&db, &watcher, &["SET", "k", "x"]), Reply::queued());

        assert_eq!(exec(&db, &writer, &["SET", "k", "y"]), Reply::ok());

        assert_eq!(exec(&db, &watcher, &["EXEC"]), Reply::NullArray);
        assert_eq!(
            exec(&db, &watcher, &["GET", "k"]),
            Reply::bulk(Bytes::from_static(b"y"))
        );
    }

    #[test]
    fn test_watch_clean_commits() {
        let db = test_db();
        let (conn, _) = Connection::fake();
        exec(&db, &conn, &["SET", "k", "0"]);
        exec(&db, &conn, &["WATCH", "k"]);
        exec(&db, &conn, &["MULTI"]);
        exec(&db, &conn, &["SET", "k", "1"]);
        assert_eq!(exec(&db, &conn, &["EXEC"]), Reply::Raw(vec![Reply::ok()]));
        assert_eq!(
            exec(&db, &conn, &["GET", "k"]),
            Reply::bulk(Bytes::from_static(b"1"))
        );
    }

    #[test]
    fn test_watch_inside_multi_rejected() {
        let db = test_db();
        let (conn, _) = Connection::fake();
        exec(&db, &conn, &["MULTI"]);
        assert!(exec(&db, &conn, &["WATCH", "k"]).is_error());
    }

    #[test]
    fn test_partial_failure_does_not_roll_back() {
        let db = test_db();
        let (conn, _) = Connection::fake();
        exec(&db, &conn, &["SET", "s", "abc"]);
        exec(&db, &conn, &["MULTI"]);
        exec(&db, &conn, &["SET", "a", "1"]);
        exec(&db, &conn, &["INCR", "s"]); // fails: not an integer
        exec(&db, &conn, &["SET", "b", "2"]);
        let reply = exec(&db, &conn, &["EXEC"]);
        match reply {
            Reply::Raw(results) => {
                assert_eq!(results.len(), 3);
                assert!(!results[0].is_error());
                assert!(results[1].is_error());
                assert!(!results[2].is_error());
            }
            other => panic!("expected raw reply, got {:?}", other),
        }
        // Both successful writes stuck.
        assert_eq!(
            exec(&db, &conn, &["GET", "a"]),
            Reply::bulk(Bytes::from_static(b"1"))
        );
        assert_eq!(
            exec(&db, &conn, &["GET", "b"]),
            Reply::bulk(Bytes::from_static(b"2"))
        );
    }

    #[test]
    fn test_undo_logs_snapshot_state() {
        let db = test_db();
        let (conn, _) = Connection::fake();
        exec(&db, &conn, &["SET", "k", "old"]);

        let keys = vec!["k".to_string(), "missing".to_string()];
        let mut group = db.data().lock_keys(&keys, &[]);
        let undo = db.undo_logs(&mut group, &cmd_line(&["SET", "k", "new"]));
        assert_eq!(undo[0], cmd_line(&["SET", "k", "old"]));
        assert_eq!(undo[1], cmd_line(&["PERSIST", "k"]));

        let undo_missing = db.undo_logs(&mut group, &cmd_line(&["SET", "missing", "x"]));
        assert_eq!(undo_missing, vec![cmd_line(&["DEL", "missing"])]);
    }

    #[test]
    fn test_aof_sink_receives_writes() {
        let db = test_db();
        let (conn, _) = Connection::fake();
        let logged = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&logged);
        db.set_add_aof(Arc::new(move |line| sink.lock().unwrap().push(line)));

        exec(&db, &conn, &["SET", "k", "v"]);
        exec(&db, &conn, &["GET", "k"]);
        exec(&db, &conn, &["DEL", "k"]);

        let lines = logged.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], cmd_line(&["SET", "k", "v"]));
        assert_eq!(lines[1], cmd_line(&["DEL", "k"]));
    }

    #[test]
    fn test_insert_and_delete_callbacks() {
        let db = test_db();
        let (conn, _) = Connection::fake();
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));

        let log = Arc::clone(&events);
        db.set_insert_callback(Some(Arc::new(move |index, key, _| {
            log.lock().unwrap().push(format!("insert:{}:{}", index, key));
        })));
        let log = Arc::clone(&events);
        db.set_delete_callback(Some(Arc::new(move |index, key, _| {
            log.lock().unwrap().push(format!("delete:{}:{}", index, key));
        })));

        exec(&db, &conn, &["SET", "k", "v"]);
        exec(&db, &conn, &["SET", "k", "w"]); // replace: no insert event
        exec(&db, &conn, &["DEL", "k"]);

        assert_eq!(*events.lock().unwrap(), vec!["insert:0:k", "delete:0:k"]);
    }
}
