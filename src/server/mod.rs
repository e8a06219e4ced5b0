//! TCP Server
//!
//! The accept loop and its graceful shutdown. Each accepted socket gets its
//! own task running the protocol handler; live tasks are counted by a
//! [`Wait`] group so shutdown can drain them.
//!
//! Shutdown is driven by a closed signal future: on SIGHUP, SIGQUIT,
//! SIGTERM or SIGINT the loop stops accepting, the listener drops (which
//! refuses new peers at the OS level), every active connection is closed,
//! and the loop waits for the per-connection tasks to finish, each bounded
//! by the connection's own close timeout.

pub mod handler;

pub use handler::Handler;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::sync::Wait;

/// Counters over the lifetime of the accept loop.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_accepted: AtomicU64,
    pub active_connections: AtomicU64,
}

impl ServerStats {
    fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Binds `address` and serves until a termination signal arrives.
///
/// A bind failure is returned to the caller (the binary exits non-zero);
/// everything after a successful bind is handled internally.
pub async fn listen_and_serve_with_signal(
    address: &str,
    handler: Arc<Handler>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(address).await?;
    info!(%address, "listening");
    listen_and_serve(listener, handler, shutdown_signal()).await;
    Ok(())
}

/// The accept loop, parameterized over the shutdown trigger so tests can
/// drive it without signals.
pub async fn listen_and_serve(
    listener: TcpListener,
    handler: Arc<Handler>,
    shutdown: impl Future<Output = ()>,
) {
    let stats = Arc::new(ServerStats::default());
    let client_tasks = Arc::new(Wait::new());
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        stats.connection_opened();
                        client_tasks.add(1);
                        let handler = Arc::clone(&handler);
                        let stats = Arc::clone(&stats);
                        let tasks = Arc::clone(&client_tasks);
                        tokio::spawn(async move {
                            handler.handle(stream, addr).await;
                            stats.connection_closed();
                            tasks.done();
                        });
                    }
                    Err(err) => {
                        error!(error = %err, "accept failed");
                        break;
                    }
                }
            }
        }
    }

    // Refuse new peers, close the active ones, then wait for their tasks.
    drop(listener);
    handler.close().await;
    client_tasks.wait().await;
    info!(
        served = stats.connections_accepted.load(Ordering::Relaxed),
        "server shutdown complete"
    );
}

/// Resolves when a termination signal arrives.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut hangup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
    let mut quit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = hangup.recv() => {}
        _ = quit.recv() => {}
        _ = terminate.recv() => {}
        _ = interrupt.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::StandaloneServer;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::Notify;

    struct TestServer {
        addr: SocketAddr,
        stop: Arc<Notify>,
    }

    impl TestServer {
        async fn start() -> Self {
            let facade = StandaloneServer::bare(16, None);
            Self::start_with(facade).await
        }

        async fn start_with(facade: Arc<StandaloneServer>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let handler = Handler::new(facade);
            let stop = Arc::new(Notify::new());
            let trigger = Arc::clone(&stop);
            tokio::spawn(async move {
                listen_and_serve(listener, handler, async move {
                    trigger.notified().await;
                })
                .await;
            });
            Self { addr, stop }
        }

        async fn connect(&self) -> TcpStream {
            TcpStream::connect(self.addr).await.unwrap()
        }

        fn stop(&self) {
            self.stop.notify_waiters();
        }
    }

    /// Sends raw bytes and reads exactly `expected` bytes of reply.
    async fn roundtrip(client: &mut TcpStream, request: &[u8], expected: usize) -> Vec<u8> {
        client.write_all(request).await.unwrap();
        read_exactly(client, expected).await
    }

    async fn read_exactly(client: &mut TcpStream, expected: usize) -> Vec<u8> {
        let mut buf = vec![0u8; expected];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .expect("reply timed out")
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_ping() {
        let server = TestServer::start().await;
        let mut client = server.connect().await;
        let reply = roundtrip(&mut client, b"*1\r\n$4\r\nPING\r\n", 7).await;
        assert_eq!(reply, b"+PONG\r\n");
        server.stop();
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let server = TestServer::start().await;
        let mut client = server.connect().await;

        let reply = roundtrip(&mut client, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n", 5).await;
        assert_eq!(reply, b"+OK\r\n");

        let reply = roundtrip(&mut client, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n", 7).await;
        assert_eq!(reply, b"$1\r\nv\r\n");
        server.stop();
    }

    #[tokio::test]
    async fn test_wrong_arity_reply() {
        let server = TestServer::start().await;
        let mut client = server.connect().await;
        let expected = b"-ERR wrong number of arguments for 'set' command\r\n";
        let reply = roundtrip(&mut client, b"*1\r\n$3\r\nSET\r\n", expected.len()).await;
        assert_eq!(reply, expected);
        server.stop();
    }

    #[tokio::test]
    async fn test_ttl_expiry_without_resurrection() {
        let server = TestServer::start().await;
        let mut client = server.connect().await;

        roundtrip(&mut client, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n", 5).await;
        let reply =
            roundtrip(&mut client, b"*3\r\n$7\r\nPEXPIRE\r\n$1\r\nk\r\n$3\r\n100\r\n", 4).await;
        assert_eq!(reply, b":1\r\n");

        tokio::time::sleep(Duration::from_millis(200)).await;
        let reply = roundtrip(&mut client, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n", 5).await;
        assert_eq!(reply, b"$-1\r\n");
        let reply = roundtrip(&mut client, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n", 5).await;
        assert_eq!(reply, b"$-1\r\n", "expired key must not resurrect");
        server.stop();
    }

    #[tokio::test]
    async fn test_transaction_happy_path() {
        let server = TestServer::start().await;
        let mut client = server.connect().await;

        let reply = roundtrip(&mut client, b"*1\r\n$5\r\nMULTI\r\n", 5).await;
        assert_eq!(reply, b"+OK\r\n");
        let reply = roundtrip(&mut client, b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n", 9).await;
        assert_eq!(reply, b"+QUEUED\r\n");
        let reply = roundtrip(&mut client, b"*3\r\n$3\r\nSET\r\n$1\r\nb\r\n$1\r\n2\r\n", 9).await;
        assert_eq!(reply, b"+QUEUED\r\n");
        let reply = roundtrip(&mut client, b"*1\r\n$4\r\nEXEC\r\n", 14).await;
        assert_eq!(reply, b"*2\r\n+OK\r\n+OK\r\n");
        let reply = roundtrip(&mut client, b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n", 7).await;
        assert_eq!(reply, b"$1\r\n1\r\n");
        server.stop();
    }

    #[tokio::test]
    async fn test_watch_miss_aborts() {
        let server = TestServer::start().await;
        let mut watcher = server.connect().await;
        let mut writer = server.connect().await;

        let reply = roundtrip(&mut watcher, b"*2\r\n$5\r\nWATCH\r\n$1\r\nk\r\n", 5).await;
        assert_eq!(reply, b"+OK\r\n");
        roundtrip(&mut watcher, b"*1\r\n$5\r\nMULTI\r\n", 5).await;
        let reply = roundtrip(&mut watcher, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nx\r\n", 9).await;
        assert_eq!(reply, b"+QUEUED\r\n");

        let reply = roundtrip(&mut writer, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\ny\r\n", 5).await;
        assert_eq!(reply, b"+OK\r\n");

        let reply = roundtrip(&mut watcher, b"*1\r\n$4\r\nEXEC\r\n", 5).await;
        assert_eq!(reply, b"*-1\r\n");
        let reply = roundtrip(&mut writer, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n", 7).await;
        assert_eq!(reply, b"$1\r\ny\r\n");
        server.stop();
    }

    #[tokio::test]
    async fn test_pipelined_commands() {
        let server = TestServer::start().await;
        let mut client = server.connect().await;

        let batch = b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$2\r\nv1\r\n\
                      *3\r\n$3\r\nSET\r\n$2\r\nk2\r\n$2\r\nv2\r\n\
                      *2\r\n$3\r\nGET\r\n$2\r\nk1\r\n";
        client.write_all(batch).await.unwrap();
        let reply = read_exactly(&mut client, 5 + 5 + 8).await;
        assert_eq!(reply, b"+OK\r\n+OK\r\n$2\r\nv1\r\n");
        server.stop();
    }

    #[tokio::test]
    async fn test_inline_command() {
        let server = TestServer::start().await;
        let mut client = server.connect().await;
        let reply = roundtrip(&mut client, b"PING\r\n", 7).await;
        assert_eq!(reply, b"+PONG\r\n");
        server.stop();
    }

    #[tokio::test]
    async fn test_select_isolates_clients() {
        let server = TestServer::start().await;
        let mut first = server.connect().await;
        let mut second = server.connect().await;

        roundtrip(&mut first, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n", 5).await;
        let reply = roundtrip(&mut second, b"*2\r\n$6\r\nSELECT\r\n$1\r\n1\r\n", 5).await;
        assert_eq!(reply, b"+OK\r\n");
        let reply = roundtrip(&mut second, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n", 5).await;
        assert_eq!(reply, b"$-1\r\n", "db 1 must not see db 0 keys");
        server.stop();
    }

    #[tokio::test]
    async fn test_protocol_error_is_answered() {
        let server = TestServer::start().await;
        let mut client = server.connect().await;
        client.write_all(b":not-a-number\r\n").await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("reply timed out")
            .unwrap();
        let reply = String::from_utf8_lossy(&buf[..n]);
        assert!(reply.starts_with("-ERR Protocol error"), "got {}", reply);
        server.stop();
    }

    #[tokio::test]
    async fn test_shutdown_closes_active_connections() {
        let server = TestServer::start().await;
        let mut client = server.connect().await;
        roundtrip(&mut client, b"*1\r\n$4\r\nPING\r\n", 7).await;

        server.stop();
        // The server closes its half; the client read observes EOF.
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("close timed out")
            .unwrap();
        assert_eq!(n, 0);
    }
}
