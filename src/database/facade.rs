//! Standalone Server Facade
//!
//! The multiplexer over `DB[0..databases-1]`. Control commands that live
//! above a single keyspace (AUTH, PING/ECHO, SELECT, the pub/sub trio,
//! FLUSHALL, BGREWRITEAOF, COMMAND) are dispatched here; everything else
//! is routed to the database the connection has selected.
//!
//! The facade owns the AOF persister and the shared time wheel, wires each
//! database's write sink into the persister, and is the panic-recovery
//! boundary: an executor panic is answered with `-ERR unknown` while the
//! server keeps running.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tracing::{error, info, warn};

use crate::aof::Persister;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::database::db::Db;
use crate::database::entity::DataEntity;
use crate::database::pubsub::PubSubHub;
use crate::database::registry::CommandTable;
use crate::database::{arg_str, cmd_name};
use crate::protocol::Reply;
use crate::timewheel::TimeWheel;

/// Tick geometry of the shared expiration wheel.
const WHEEL_INTERVAL: Duration = Duration::from_millis(100);
const WHEEL_SLOTS: usize = 600;

pub struct StandaloneServer {
    dbs: Vec<Arc<Db>>,
    registry: Arc<CommandTable>,
    wheel: Arc<TimeWheel>,
    hub: Arc<PubSubHub>,
    require_pass: Option<String>,
    persister: Mutex<Option<Arc<Persister>>>,
}

impl StandaloneServer {
    /// Builds the server from configuration, replaying and enabling the AOF
    /// when `appendonly` is on.
    pub async fn new(config: &ServerConfig) -> std::io::Result<Arc<Self>> {
        let server = Self::bare(config.databases, config.requirepass.clone());
        if config.appendonly {
            let persister = Arc::new(Persister::new(&config.appendfilename, config.appendfsync)?);
            persister.load(&server, 0).await;
            persister.start();
            for db in &server.dbs {
                let sink = Arc::clone(&persister);
                let index = db.index();
                db.set_add_aof(Arc::new(move |line| {
                    if let Err(err) = sink.save_cmd_line(index, line) {
                        warn!(db = index, error = %err, "aof write failed");
                    }
                }));
            }
            *server.persister.lock().unwrap() = Some(persister);
            info!(file = %config.appendfilename, policy = ?config.appendfsync, "aof enabled");
        }
        Ok(server)
    }

    /// Builds an in-memory server with no persistence attached.
    pub fn bare(databases: usize, require_pass: Option<String>) -> Arc<Self> {
        let registry = CommandTable::standard();
        let wheel = Arc::new(TimeWheel::new(WHEEL_INTERVAL, WHEEL_SLOTS));
        let dbs = (0..databases.max(1))
            .map(|index| Db::new(index, Arc::clone(&registry), Arc::clone(&wheel)))
            .collect();
        Arc::new(Self {
            dbs,
            registry,
            wheel,
            hub: PubSubHub::new(),
            require_pass,
            persister: Mutex::new(None),
        })
    }

    /// A shadow server with the same shape, used as the AOF rewrite target.
    pub fn make_tmp(&self) -> Arc<Self> {
        Self::bare(self.dbs.len(), None)
    }

    pub fn databases(&self) -> usize {
        self.dbs.len()
    }

    pub fn db_at(&self, index: usize) -> Option<&Arc<Db>> {
        self.dbs.get(index)
    }

    fn db_for(&self, conn: &Connection) -> &Arc<Db> {
        // SELECT validates the index, so this stays in range.
        &self.dbs[conn.selected_db().min(self.dbs.len() - 1)]
    }

    /// Visits every live entry of one database with its expiration.
    pub fn for_each_entity(
        &self,
        index: usize,
        consumer: impl FnMut(&str, &DataEntity, Option<SystemTime>) -> bool,
    ) {
        if let Some(db) = self.dbs.get(index) {
            db.for_each_entity(consumer);
        }
    }

    /// Executes one command line on behalf of `conn`.
    ///
    /// This is the recovery boundary: a panicking executor yields
    /// `-ERR unknown` instead of tearing the server down.
    pub fn exec(self: &Arc<Self>, conn: &Arc<Connection>, line: &[Bytes]) -> Reply {
        match catch_unwind(AssertUnwindSafe(|| self.exec_inner(conn, line))) {
            Ok(reply) => reply,
            Err(_) => {
                error!(client = %conn.remote_addr(), "executor panicked");
                Reply::unknown_err()
            }
        }
    }

    fn exec_inner(self: &Arc<Self>, conn: &Arc<Connection>, line: &[Bytes]) -> Reply {
        if line.is_empty() {
            return Reply::error("ERR empty command");
        }
        let name = cmd_name(line);
        if name == "auth" {
            return self.auth(conn, line);
        }
        if !self.is_authenticated(conn) {
            return Reply::error("NOAUTH Authentication required.");
        }
        match name.as_str() {
            "ping" => match line.len() {
                1 => Reply::pong(),
                2 => Reply::Bulk(line[1].clone()),
                _ => Reply::arg_num_err(&name),
            },
            "echo" => {
                if line.len() != 2 {
                    return Reply::arg_num_err(&name);
                }
                Reply::Bulk(line[1].clone())
            }
            "select" => self.select(conn, line),
            "subscribe" => {
                if line.len() < 2 {
                    return Reply::arg_num_err(&name);
                }
                self.hub.subscribe(conn, &line[1..])
            }
            "unsubscribe" => self.hub.unsubscribe(conn, &line[1..]),
            "publish" => {
                if line.len() != 3 {
                    return Reply::arg_num_err(&name);
                }
                self.hub.publish(&line[1], &line[2])
            }
            "flushall" => self.flush_all(line),
            "bgrewriteaof" => self.bg_rewrite_aof(),
            "command" => self.command_docs(),
            _ => self.db_for(conn).exec(conn, line),
        }
    }

    fn auth(&self, conn: &Connection, line: &[Bytes]) -> Reply {
        if line.len() != 2 {
            return Reply::arg_num_err("auth");
        }
        let Some(expected) = &self.require_pass else {
            return Reply::error("ERR Client sent AUTH, but no password is set");
        };
        let given = arg_str(&line[1]);
        conn.set_password(given.clone());
        if &given == expected {
            Reply::ok()
        } else {
            Reply::error("ERR invalid password")
        }
    }

    fn is_authenticated(&self, conn: &Connection) -> bool {
        match &self.require_pass {
            None => true,
            Some(expected) => conn.password().as_deref() == Some(expected.as_str()),
        }
    }

    fn select(&self, conn: &Connection, line: &[Bytes]) -> Reply {
        if conn.in_multi() {
            return Reply::error("ERR SELECT is not allowed in transactions");
        }
        if line.len() != 2 {
            return Reply::arg_num_err("select");
        }
        let Some(index) = arg_str(&line[1]).parse::<usize>().ok() else {
            return Reply::error("ERR invalid DB index");
        };
        if index >= self.dbs.len() {
            return Reply::error("ERR DB index is out of range");
        }
        conn.select_db(index);
        Reply::ok()
    }

    fn flush_all(self: &Arc<Self>, line: &[Bytes]) -> Reply {
        for db in &self.dbs {
            db.flush();
        }
        if let Some(persister) = self.persister.lock().unwrap().clone() {
            if let Err(err) = persister.save_cmd_line(0, line.to_vec()) {
                warn!(error = %err, "aof write failed");
            }
        }
        Reply::ok()
    }

    fn bg_rewrite_aof(self: &Arc<Self>) -> Reply {
        let Some(persister) = self.persister.lock().unwrap().clone() else {
            return Reply::error("ERR AOF persistence is not enabled");
        };
        let server = Arc::clone(self);
        tokio::spawn(async move {
            match persister.rewrite(&server).await {
                Ok(()) => info!("aof rewrite finished"),
                Err(err) => error!(error = %err, "aof rewrite failed"),
            }
        });
        Reply::status("Background append only file rewriting started")
    }

    fn command_docs(&self) -> Reply {
        Reply::Raw(self.registry.iter().map(|cmd| cmd.desc_reply()).collect())
    }

    /// Drops per-connection server state when a client goes away.
    pub fn after_client_close(&self, conn: &Connection) {
        self.hub.drop_conn(conn);
    }

    /// Flushes and stops persistence, then the expiration wheel.
    pub fn close(&self) {
        if let Some(persister) = self.persister.lock().unwrap().take() {
            persister.close();
        }
        self.wheel.stop();
    }
}
