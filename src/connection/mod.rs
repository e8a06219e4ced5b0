//! Client Connection State
//!
//! One [`Connection`] per client, shared behind an `Arc` between the
//! connection's handler task and anything else that may write to it (pub/sub
//! fan-out). It carries everything the engine needs to know about a client:
//!
//! - the selected database index
//! - the subscription set
//! - the transaction flag, queued command lines, watched-key versions and
//!   queued syntax errors
//! - the password presented by AUTH and the master/slave role flags
//!
//! Writes are serialized by an async mutex and counted by a [`Wait`] group
//! so that [`Connection::close`] can drain in-flight sends, bounded by a
//! 10 second timeout. Closed connections return their state struct to a
//! free-list pool for reuse.
//!
//! [`Connection::fake`] builds a connection whose sink is an in-memory
//! buffer; the AOF loader replays history through one, and tests use it to
//! observe written bytes.

pub mod fake;

pub use fake::FakeSink;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tracing::trace;

use crate::protocol::CmdLine;
use crate::sync::Wait;

/// How long [`Connection::close`] waits for pending writes to drain.
pub const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const FLAG_SLAVE: u8 = 1 << 0;
const FLAG_MASTER: u8 = 1 << 1;
const FLAG_MULTI: u8 = 1 << 2;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Where reply bytes go.
enum Sink {
    Tcp(OwnedWriteHalf),
    Fake(FakeSink),
    Closed,
}

/// Per-client mutable state, recycled through [`ConnPool`].
#[derive(Debug, Default)]
pub struct ConnState {
    selected_db: usize,
    password: Option<String>,
    flags: u8,
    subs: HashSet<String>,
    queue: Vec<CmdLine>,
    watching: HashMap<String, u32>,
    tx_errors: Vec<String>,
}

impl ConnState {
    fn reset(&mut self) {
        self.selected_db = 0;
        self.password = None;
        self.flags = 0;
        self.subs.clear();
        self.queue.clear();
        self.watching.clear();
        self.tx_errors.clear();
    }
}

/// A connected client.
pub struct Connection {
    id: u64,
    addr: String,
    sink: Mutex<Sink>,
    sending: Wait,
    state: StdMutex<ConnState>,
    pool: Option<Arc<ConnPool>>,
    closed: AtomicBool,
}

impl Connection {
    /// Wraps the write half of an accepted socket.
    pub fn from_tcp(writer: OwnedWriteHalf, addr: String, pool: &Arc<ConnPool>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            sink: Mutex::new(Sink::Tcp(writer)),
            sending: Wait::new(),
            state: StdMutex::new(pool.checkout()),
            pool: Some(Arc::clone(pool)),
            closed: AtomicBool::new(false),
        })
    }

    /// Builds an in-memory connection. The returned [`FakeSink`] observes
    /// every byte written.
    pub fn fake() -> (Arc<Self>, FakeSink) {
        let sink = FakeSink::new();
        let conn = Arc::new(Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            addr: "fake:0".to_string(),
            sink: Mutex::new(Sink::Fake(sink.clone())),
            sending: Wait::new(),
            state: StdMutex::new(ConnState::default()),
            pool: None,
            closed: AtomicBool::new(false),
        });
        (conn, sink)
    }

    /// Stable identifier for active-set and subscriber bookkeeping.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The remote network address.
    pub fn remote_addr(&self) -> &str {
        &self.addr
    }

    /// Sends reply bytes to the client.
    ///
    /// Writes are counted so that [`close`](Self::close) can drain them, and
    /// serialized so concurrent pub/sub deliveries cannot interleave.
    pub async fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.sending.add(1);
        let result = async {
            let mut sink = self.sink.lock().await;
            match &mut *sink {
                Sink::Tcp(writer) => {
                    writer.write_all(bytes).await?;
                    writer.flush().await
                }
                Sink::Fake(fake) => {
                    fake.push(bytes);
                    Ok(())
                }
                Sink::Closed => Err(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "connection closed",
                )),
            }
        }
        .await;
        self.sending.done();
        result
    }

    /// Drains pending writes (up to [`CLOSE_DRAIN_TIMEOUT`]), shuts the
    /// socket down, and recycles the state struct into the pool.
    ///
    /// Idempotent: the handler task and a server-wide shutdown may race to
    /// close the same connection.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.sending.wait_timeout(CLOSE_DRAIN_TIMEOUT).await {
            trace!(client = %self.addr, "closing with writes still pending");
        }
        let mut sink = self.sink.lock().await;
        if let Sink::Tcp(writer) = &mut *sink {
            let _ = writer.shutdown().await;
        }
        *sink = Sink::Closed;
        drop(sink);

        let mut state = self.state.lock().unwrap();
        let recycled = std::mem::take(&mut *state);
        drop(state);
        if let Some(pool) = &self.pool {
            pool.put(recycled);
        }
    }

    /* ---- selected database ---- */

    pub fn selected_db(&self) -> usize {
        self.state.lock().unwrap().selected_db
    }

    pub fn select_db(&self, index: usize) {
        self.state.lock().unwrap().selected_db = index;
    }

    /* ---- authentication ---- */

    pub fn set_password(&self, password: impl Into<String>) {
        self.state.lock().unwrap().password = Some(password.into());
    }

    pub fn password(&self) -> Option<String> {
        self.state.lock().unwrap().password.clone()
    }

    /* ---- role flags ---- */

    pub fn set_slave(&self) {
        self.state.lock().unwrap().flags |= FLAG_SLAVE;
    }

    pub fn is_slave(&self) -> bool {
        self.state.lock().unwrap().flags & FLAG_SLAVE != 0
    }

    pub fn set_master(&self) {
        self.state.lock().unwrap().flags |= FLAG_MASTER;
    }

    pub fn is_master(&self) -> bool {
        self.state.lock().unwrap().flags & FLAG_MASTER != 0
    }

    /* ---- transaction state ---- */

    /// True while the client is inside an uncommitted MULTI.
    pub fn in_multi(&self) -> bool {
        self.state.lock().unwrap().flags & FLAG_MULTI != 0
    }

    /// Raises or clears the transaction flag; clearing also drops the queue,
    /// the watch set and any recorded errors.
    pub fn set_multi(&self, state: bool) {
        let mut guard = self.state.lock().unwrap();
        if state {
            guard.flags |= FLAG_MULTI;
        } else {
            guard.flags &= !FLAG_MULTI;
            guard.queue.clear();
            guard.watching.clear();
            guard.tx_errors.clear();
        }
    }

    pub fn enqueue_cmd(&self, cmd_line: CmdLine) {
        self.state.lock().unwrap().queue.push(cmd_line);
    }

    /// Snapshot of the queued command lines.
    pub fn queued_cmd_lines(&self) -> Vec<CmdLine> {
        self.state.lock().unwrap().queue.clone()
    }

    pub fn add_tx_error(&self, message: impl Into<String>) {
        self.state.lock().unwrap().tx_errors.push(message.into());
    }

    pub fn has_tx_errors(&self) -> bool {
        !self.state.lock().unwrap().tx_errors.is_empty()
    }

    /// Records the version of `key` as seen at WATCH time.
    pub fn watch_key(&self, key: &str, version: u32) {
        self.state.lock().unwrap().watching.insert(key.to_string(), version);
    }

    pub fn unwatch_all(&self) {
        self.state.lock().unwrap().watching.clear();
    }

    /// Snapshot of the watched keys and their recorded versions.
    pub fn watching(&self) -> HashMap<String, u32> {
        self.state.lock().unwrap().watching.clone()
    }

    /* ---- subscriptions ---- */

    /// Adds a channel subscription; returns the subscription count after.
    pub fn subscribe(&self, channel: &str) -> usize {
        let mut state = self.state.lock().unwrap();
        state.subs.insert(channel.to_string());
        state.subs.len()
    }

    /// Drops a channel subscription; returns the subscription count after.
    pub fn unsubscribe(&self, channel: &str) -> usize {
        let mut state = self.state.lock().unwrap();
        state.subs.remove(channel);
        state.subs.len()
    }

    pub fn subs_count(&self) -> usize {
        self.state.lock().unwrap().subs.len()
    }

    pub fn channels(&self) -> Vec<String> {
        self.state.lock().unwrap().subs.iter().cloned().collect()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish()
    }
}

/// Free-list of [`ConnState`] structs, reused across connections to keep
/// accept-heavy workloads off the allocator.
#[derive(Debug, Default)]
pub struct ConnPool {
    free: StdMutex<Vec<ConnState>>,
}

impl ConnPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn checkout(&self) -> ConnState {
        self.free.lock().unwrap().pop().unwrap_or_default()
    }

    fn put(&self, mut state: ConnState) {
        state.reset();
        self.free.lock().unwrap().push(state);
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}
