//! Protocol Handler
//!
//! Binds one accepted socket to the database engine: the read half feeds
//! the streaming RESP parser, the write half becomes a pooled
//! [`Connection`], and every parsed multi-bulk array is executed against
//! the standalone facade.
//!
//! Error handling per payload:
//! - disconnect-class errors (EOF, reset, closed socket) tear the
//!   connection down quietly
//! - recoverable protocol errors are echoed back as `-ERR ...` and the
//!   stream continues
//! - anything that is not a multi-bulk array is logged and skipped

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::connection::{ConnPool, Connection};
use crate::database::StandaloneServer;
use crate::protocol::{parse_stream, ParseError, Reply};

/// Accepts sockets and runs their request loops until closed.
pub struct Handler {
    facade: Arc<StandaloneServer>,
    pool: Arc<ConnPool>,
    active: Mutex<HashMap<u64, Arc<Connection>>>,
    closing: AtomicBool,
}

impl Handler {
    pub fn new(facade: Arc<StandaloneServer>) -> Arc<Self> {
        Arc::new(Self {
            facade,
            pool: ConnPool::new(),
            active: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
        })
    }

    /// Runs the request loop of one client until it disconnects.
    pub async fn handle(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        if self.closing.load(Ordering::Acquire) {
            // Shutting down: refuse new clients by dropping the socket.
            return;
        }
        let (read_half, write_half) = stream.into_split();
        let conn = Connection::from_tcp(write_half, addr.to_string(), &self.pool);
        self.active.lock().unwrap().insert(conn.id(), Arc::clone(&conn));
        info!(client = %addr, "client connected");

        let mut payloads = parse_stream(read_half);
        while let Some(payload) = payloads.recv().await {
            match payload {
                Err(err) if err.is_disconnect() => {
                    debug!(client = %addr, "client disconnected");
                    break;
                }
                Err(ParseError::Protocol(message)) => {
                    warn!(client = %addr, error = %message, "protocol error");
                    let reply = Reply::protocol_err(&message);
                    if conn.write(&reply.to_bytes()).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(client = %addr, error = %err, "read error");
                    break;
                }
                Ok(Reply::MultiBulk(args)) => {
                    if args.is_empty() {
                        continue;
                    }
                    let reply = self.facade.exec(&conn, &args);
                    if conn.write(&reply.to_bytes()).await.is_err() {
                        break;
                    }
                }
                Ok(other) => {
                    warn!(client = %addr, payload = %other, "expected a multi bulk request");
                }
            }
        }

        self.close_client(&conn).await;
        info!(client = %addr, "connection closed");
    }

    async fn close_client(&self, conn: &Arc<Connection>) {
        self.active.lock().unwrap().remove(&conn.id());
        conn.close().await;
        self.facade.after_client_close(conn);
    }

    /// Stops accepting work, closes every active connection, then shuts the
    /// engine down (flushing the AOF).
    pub async fn close(&self) {
        self.closing.store(true, Ordering::Release);
        let active: Vec<Arc<Connection>> = {
            let mut map = self.active.lock().unwrap();
            map.drain().map(|(_, conn)| conn).collect()
        };
        for conn in active {
            conn.close().await;
            self.facade.after_client_close(&conn);
        }
        self.facade.close();
    }
}
