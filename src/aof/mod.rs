//! Append-Only-File Persistence
//!
//! Every successful write command is logged to disk as a RESP multi-bulk
//! array, so replaying the file through the engine reconstructs the
//! database. Three durability policies are supported:
//!
//! - `always`: write and fsync on the command path, errors surface to the
//!   caller
//! - `everysec`: commands are queued to a dedicated writer thread and a
//!   ticker fsyncs once per second
//! - `no`: queued writes, flushing left to the operating system
//!
//! ```text
//!  command path ──► save_cmd_line ──► bounded queue ──► writer thread ──► file
//!                        │ (always: direct)                 ▲
//!                        └────────────────────────── fsync ─┘
//! ```
//!
//! The queue is the ownership boundary: only the writer thread touches the
//! file during normal operation, and the same mutex that guards the file
//! pauses writers while a rewrite swaps files underneath them. The writer
//! tracks which database the file "is in" and interposes a `SELECT n`
//! whenever a payload comes from a different one.

pub mod rewrite;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};

use crate::config::FsyncPolicy;
use crate::connection::Connection;
use crate::database::{cmd_name, StandaloneServer};
use crate::protocol::{cmd_line, parse_stream, CmdLine, Reply};

/// Capacity of the payload queue feeding the writer thread.
pub const AOF_QUEUE_SIZE: usize = 1 << 20;

/// One logged write: which database it ran in, and the full command line.
#[derive(Debug, Clone)]
pub struct AofPayload {
    pub db_index: usize,
    pub cmd_line: CmdLine,
}

/// Observes every batch committed to the file, in commit order. The hook
/// replication would use to fan writes out to peers.
pub trait AofListener: Send + Sync {
    fn callback(&self, batch: &[CmdLine]);
}

struct AofState {
    file: Option<File>,
    // database the last committed command ran in
    current_db: usize,
}

/// The AOF engine: loader, writer and rewrite live here.
pub struct Persister {
    filename: PathBuf,
    policy: FsyncPolicy,
    // Guards the file and the SELECT bookkeeping; doubles as the pause
    // latch during rewrite file swaps.
    state: Mutex<AofState>,
    tx: Mutex<Option<SyncSender<AofPayload>>>,
    writer_done: Mutex<Option<Receiver<()>>>,
    ticker_stop: Mutex<Option<SyncSender<()>>>,
    listeners: Mutex<Vec<Arc<dyn AofListener>>>,
    loading: AtomicBool,
}

impl Persister {
    /// Opens (creating if needed) the append file.
    pub fn new(filename: impl AsRef<Path>, policy: FsyncPolicy) -> std::io::Result<Self> {
        let filename = filename.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).read(true).open(&filename)?;
        Ok(Self {
            filename,
            policy,
            state: Mutex::new(AofState { file: Some(file), current_db: 0 }),
            tx: Mutex::new(None),
            writer_done: Mutex::new(None),
            ticker_stop: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            loading: AtomicBool::new(false),
        })
    }

    /// A persister that only replays an existing file and never writes.
    /// Used as the loader half of a rewrite.
    fn detached(filename: impl AsRef<Path>) -> Self {
        Self {
            filename: filename.as_ref().to_path_buf(),
            policy: FsyncPolicy::No,
            state: Mutex::new(AofState { file: None, current_db: 0 }),
            tx: Mutex::new(None),
            writer_done: Mutex::new(None),
            ticker_stop: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            loading: AtomicBool::new(false),
        }
    }

    /// Spawns the writer thread (and the fsync ticker under `everysec`).
    ///
    /// Must come after [`load`](Self::load): replayed commands would
    /// otherwise race the writer.
    pub fn start(self: &Arc<Self>) {
        let (tx, rx) = sync_channel(AOF_QUEUE_SIZE);
        let (done_tx, done_rx) = sync_channel(1);
        *self.tx.lock().unwrap() = Some(tx);
        *self.writer_done.lock().unwrap() = Some(done_rx);

        let persister = Arc::clone(self);
        std::thread::Builder::new()
            .name("aof-writer".into())
            .spawn(move || {
                for payload in rx {
                    if let Err(err) = persister.write_payload(payload) {
                        warn!(error = %err, "aof write failed");
                    }
                }
                let _ = done_tx.send(());
            })
            .expect("failed to spawn aof writer");

        if self.policy == FsyncPolicy::EverySec {
            let (stop_tx, stop_rx) = sync_channel(0);
            *self.ticker_stop.lock().unwrap() = Some(stop_tx);
            let persister = Arc::clone(self);
            std::thread::Builder::new()
                .name("aof-fsync".into())
                .spawn(move || loop {
                    match stop_rx.recv_timeout(Duration::from_secs(1)) {
                        Err(RecvTimeoutError::Timeout) => persister.fsync(),
                        _ => return,
                    }
                })
                .expect("failed to spawn aof fsync ticker");
        }
    }

    /// Logs one write command. The hot-path entry point.
    ///
    /// Under `always` the write and fsync happen before this returns and
    /// any error surfaces here. Other policies enqueue, blocking only when
    /// the queue is full, which back-pressures the command path.
    pub fn save_cmd_line(&self, db_index: usize, cmd_line: CmdLine) -> std::io::Result<()> {
        if self.loading.load(Ordering::Acquire) {
            // Replayed commands must not be re-logged.
            return Ok(());
        }
        let payload = AofPayload { db_index, cmd_line };
        if self.policy == FsyncPolicy::Always {
            return self.write_payload(payload);
        }
        let tx = self.tx.lock().unwrap();
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(payload);
        }
        Ok(())
    }

    fn write_payload(&self, payload: AofPayload) -> std::io::Result<()> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let Some(file) = state.file.as_mut() else {
            return Ok(());
        };

        let mut batch = Vec::with_capacity(2);
        if payload.db_index != state.current_db {
            let select = cmd_line(&["SELECT", &payload.db_index.to_string()]);
            file.write_all(&Reply::MultiBulk(select.clone()).to_bytes())?;
            batch.push(select);
            state.current_db = payload.db_index;
        }
        file.write_all(&Reply::MultiBulk(payload.cmd_line.clone()).to_bytes())?;
        batch.push(payload.cmd_line);

        if self.policy == FsyncPolicy::Always {
            file.sync_all()?;
        }
        drop(guard);

        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.callback(&batch);
        }
        Ok(())
    }

    /// Forces the file contents to stable storage.
    pub fn fsync(&self) {
        let state = self.state.lock().unwrap();
        if let Some(file) = state.file.as_ref() {
            if let Err(err) = file.sync_all() {
                error!(error = %err, "aof fsync failed");
            }
        }
    }

    /// Replays the append file through `server`.
    ///
    /// Must run before [`start`](Self::start). `max_bytes` of 0 means the
    /// whole file; a positive value bounds the read (used by rewrite to
    /// replay exactly the snapshot prefix).
    pub async fn load(&self, server: &Arc<StandaloneServer>, max_bytes: u64) {
        self.loading.store(true, Ordering::Release);

        let file = match tokio::fs::File::open(&self.filename).await {
            Ok(file) => file,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %err, "failed to open aof file");
                }
                self.loading.store(false, Ordering::Release);
                return;
            }
        };
        let reader: Box<dyn tokio::io::AsyncRead + Unpin + Send> = if max_bytes > 0 {
            Box::new(file.take(max_bytes))
        } else {
            Box::new(file)
        };

        let mut replayed = 0usize;
        let mut stream = parse_stream(reader);
        let (fake_conn, _sink) = Connection::fake();
        while let Some(payload) = stream.recv().await {
            match payload {
                Err(err) if err.is_disconnect() => break,
                Err(err) => {
                    warn!(error = %err, "aof load: parse error");
                }
                Ok(Reply::MultiBulk(args)) => {
                    if args.is_empty() {
                        continue;
                    }
                    let reply = server.exec(&fake_conn, &args);
                    if reply.is_error() {
                        warn!(reply = %reply, "aof load: command failed");
                    }
                    if cmd_name(&args) == "select" && args.len() == 2 {
                        if let Some(index) =
                            std::str::from_utf8(&args[1]).ok().and_then(|s| s.parse().ok())
                        {
                            self.state.lock().unwrap().current_db = index;
                        }
                    }
                    replayed += 1;
                }
                Ok(_) => warn!("aof load: expected multi bulk"),
            }
        }
        info!(commands = replayed, file = %self.filename.display(), "aof replay finished");
        self.loading.store(false, Ordering::Release);
    }

    /// Registers a commit observer.
    pub fn add_listener(&self, listener: Arc<dyn AofListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Removes a previously registered observer, identified by address.
    pub fn remove_listener(&self, listener: &Arc<dyn AofListener>) {
        let target = Arc::as_ptr(listener) as *const ();
        self.listeners
            .lock()
            .unwrap()
            .retain(|other| Arc::as_ptr(other) as *const () != target);
    }

    /// Stops the writer, drains the queue, fsyncs and closes the file.
    pub fn close(&self) {
        // Dropping the sender ends the writer's receive loop once it has
        // drained everything already queued.
        drop(self.tx.lock().unwrap().take());
        if let Some(done) = self.writer_done.lock().unwrap().take() {
            if done.recv_timeout(Duration::from_secs(5)).is_err() {
                warn!("aof writer did not drain in time");
            }
        }
        drop(self.ticker_stop.lock().unwrap().take());

        let mut state = self.state.lock().unwrap();
        if let Some(file) = state.file.take() {
            let _ = file.sync_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::protocol::cmd_line;
    use bytes::Bytes;

    fn aof_config(dir: &tempfile::TempDir, policy: FsyncPolicy) -> ServerConfig {
        ServerConfig {
            appendonly: true,
            appendfilename: dir.path().join("appendonly.aof").to_string_lossy().into_owned(),
            appendfsync: policy,
            databases: 4,
            ..ServerConfig::default()
        }
    }

    async fn exec(server: &Arc<StandaloneServer>, parts: &[&str]) -> Reply {
        let (conn, _) = Connection::fake();
        server.exec(&conn, &cmd_line(parts))
    }

    #[tokio::test]
    async fn test_round_trip_always_policy() {
        let dir = tempfile::tempdir().unwrap();
        let config = aof_config(&dir, FsyncPolicy::Always);

        let server = StandaloneServer::new(&config).await.unwrap();
        exec(&server, &["SET", "a", "1"]).await;
        exec(&server, &["SET", "b", "2"]).await;
        exec(&server, &["DEL", "a"]).await;
        server.close();

        let restored = StandaloneServer::new(&config).await.unwrap();
        assert_eq!(exec(&restored, &["GET", "a"]).await, Reply::Null);
        assert_eq!(
            exec(&restored, &["GET", "b"]).await,
            Reply::bulk(Bytes::from_static(b"2"))
        );
        restored.close();
    }

    #[tokio::test]
    async fn test_everysec_drains_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let config = aof_config(&dir, FsyncPolicy::EverySec);

        let server = StandaloneServer::new(&config).await.unwrap();
        for i in 0..50 {
            exec(&server, &["SET", &format!("key-{}", i), "v"]).await;
        }
        server.close();

        let restored = StandaloneServer::new(&config).await.unwrap();
        assert_eq!(exec(&restored, &["DBSIZE"]).await, Reply::integer(50));
        restored.close();
    }

    #[tokio::test]
    async fn test_select_interposition_across_databases() {
        let dir = tempfile::tempdir().unwrap();
        let config = aof_config(&dir, FsyncPolicy::Always);

        let server = StandaloneServer::new(&config).await.unwrap();
        let (conn, _) = Connection::fake();
        server.exec(&conn, &cmd_line(&["SET", "k", "zero"]));
        server.exec(&conn, &cmd_line(&["SELECT", "2"]));
        server.exec(&conn, &cmd_line(&["SET", "k", "two"]));
        server.close();

        let raw = std::fs::read(&config.appendfilename).unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(text.contains("SELECT"), "aof must carry a SELECT: {}", text);

        let restored = StandaloneServer::new(&config).await.unwrap();
        let (conn, _) = Connection::fake();
        assert_eq!(
            restored.exec(&conn, &cmd_line(&["GET", "k"])),
            Reply::bulk(Bytes::from_static(b"zero"))
        );
        restored.exec(&conn, &cmd_line(&["SELECT", "2"]));
        assert_eq!(
            restored.exec(&conn, &cmd_line(&["GET", "k"])),
            Reply::bulk(Bytes::from_static(b"two"))
        );
        restored.close();
    }

    #[tokio::test]
    async fn test_expire_survives_replay_as_absolute_time() {
        let dir = tempfile::tempdir().unwrap();
        let config = aof_config(&dir, FsyncPolicy::Always);

        let server = StandaloneServer::new(&config).await.unwrap();
        exec(&server, &["SET", "k", "v"]).await;
        exec(&server, &["PEXPIREAT", "k", "1"]).await; // long past
        server.close();

        let restored = StandaloneServer::new(&config).await.unwrap();
        assert_eq!(exec(&restored, &["GET", "k"]).await, Reply::Null);
        restored.close();
    }

    #[tokio::test]
    async fn test_listener_sees_committed_batches() {
        struct Recorder(Mutex<Vec<CmdLine>>);
        impl AofListener for Recorder {
            fn callback(&self, batch: &[CmdLine]) {
                self.0.lock().unwrap().extend_from_slice(batch);
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let persister =
            Arc::new(Persister::new(dir.path().join("a.aof"), FsyncPolicy::Always).unwrap());
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let listener: Arc<dyn AofListener> = recorder.clone();
        persister.add_listener(listener);

        persister.save_cmd_line(0, cmd_line(&["SET", "k", "v"])).unwrap();
        persister.save_cmd_line(1, cmd_line(&["SET", "j", "w"])).unwrap();

        let seen = recorder.0.lock().unwrap().clone();
        assert_eq!(seen[0], cmd_line(&["SET", "k", "v"]));
        // The db switch shows up as an interposed SELECT.
        assert_eq!(seen[1], cmd_line(&["SELECT", "1"]));
        assert_eq!(seen[2], cmd_line(&["SET", "j", "w"]));

        let listener: Arc<dyn AofListener> = recorder.clone();
        persister.remove_listener(&listener);
        persister.save_cmd_line(1, cmd_line(&["SET", "k2", "v"])).unwrap();
        assert_eq!(recorder.0.lock().unwrap().len(), 3, "removed listener stays silent");
        persister.close();
    }

    #[tokio::test]
    async fn test_load_missing_file_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let persister = Persister::detached(dir.path().join("absent.aof"));
        let server = StandaloneServer::bare(2, None);
        persister.load(&server, 0).await;
        assert_eq!(exec(&server, &["DBSIZE"]).await, Reply::integer(0));
        server.close();
    }
}
