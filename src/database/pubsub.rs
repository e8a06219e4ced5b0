//! Publish / Subscribe Hub
//!
//! Channel-name to subscriber fan-out. Subscription bookkeeping lives in
//! two places: the hub maps channels to connections for PUBLISH, and
//! each connection tracks its own channel set for the per-frame counters and
//! for cleanup when the client disconnects.
//!
//! Message delivery is fire-and-forget: PUBLISH spawns one send task per
//! subscriber so a slow receiver cannot stall the publisher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::connection::Connection;
use crate::database::arg_str;
use crate::protocol::Reply;

#[derive(Default)]
pub struct PubSubHub {
    channels: Mutex<HashMap<String, HashMap<u64, Arc<Connection>>>>,
}

impl PubSubHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribes `conn` to each channel, answering one frame per channel.
    pub fn subscribe(&self, conn: &Arc<Connection>, channels: &[Bytes]) -> Reply {
        let mut frames = Vec::with_capacity(channels.len());
        let mut table = self.channels.lock().unwrap();
        for channel in channels {
            let name = arg_str(channel);
            table
                .entry(name.clone())
                .or_default()
                .insert(conn.id(), Arc::clone(conn));
            let count = conn.subscribe(&name);
            frames.push(subscription_frame("subscribe", &name, count));
        }
        Reply::Batch(frames)
    }

    /// Unsubscribes from the given channels, or from all of them when the
    /// list is empty.
    pub fn unsubscribe(&self, conn: &Arc<Connection>, channels: &[Bytes]) -> Reply {
        let names: Vec<String> = if channels.is_empty() {
            conn.channels()
        } else {
            channels.iter().map(arg_str).collect()
        };
        if names.is_empty() {
            // Redis still answers one frame with a nil channel.
            return Reply::Batch(vec![Reply::Raw(vec![
                Reply::bulk(&b"unsubscribe"[..]),
                Reply::Null,
                Reply::integer(0),
            ])]);
        }

        let mut frames = Vec::with_capacity(names.len());
        let mut table = self.channels.lock().unwrap();
        for name in names {
            if let Some(subscribers) = table.get_mut(&name) {
                subscribers.remove(&conn.id());
                if subscribers.is_empty() {
                    table.remove(&name);
                }
            }
            let count = conn.unsubscribe(&name);
            frames.push(subscription_frame("unsubscribe", &name, count));
        }
        Reply::Batch(frames)
    }

    /// Delivers `message` to every subscriber of `channel`; replies with the
    /// receiver count.
    pub fn publish(&self, channel: &Bytes, message: &Bytes) -> Reply {
        let name = arg_str(channel);
        let subscribers: Vec<Arc<Connection>> = self
            .channels
            .lock()
            .unwrap()
            .get(&name)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default();

        let frame = Reply::Raw(vec![
            Reply::bulk(&b"message"[..]),
            Reply::bulk(Bytes::copy_from_slice(name.as_bytes())),
            Reply::Bulk(message.clone()),
        ])
        .to_bytes();

        let count = subscribers.len();
        for subscriber in subscribers {
            let bytes = frame.clone();
            tokio::spawn(async move {
                let _ = subscriber.write(&bytes).await;
            });
        }
        Reply::integer(count as i64)
    }

    /// Forgets every subscription of a closing connection.
    pub fn drop_conn(&self, conn: &Connection) {
        let mut table = self.channels.lock().unwrap();
        for name in conn.channels() {
            if let Some(subscribers) = table.get_mut(&name) {
                subscribers.remove(&conn.id());
                if subscribers.is_empty() {
                    table.remove(&name);
                }
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .unwrap()
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

fn subscription_frame(kind: &'static str, channel: &str, count: usize) -> Reply {
    Reply::Raw(vec![
        Reply::bulk(Bytes::from_static(kind.as_bytes())),
        Reply::bulk(Bytes::copy_from_slice(channel.as_bytes())),
        Reply::integer(count as i64),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cmd_line;
    use std::time::Duration;

    #[tokio::test]
    async fn test_subscribe_publish_roundtrip() {
        let hub = PubSubHub::new();
        let (subscriber, sink) = Connection::fake();

        let reply = hub.subscribe(&subscriber, &cmd_line(&["news"]));
        assert_eq!(
            reply.to_bytes(),
            b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n"
        );

        let receivers = hub.publish(&Bytes::from_static(b"news"), &Bytes::from_static(b"hi"));
        assert_eq!(receivers, Reply::integer(1));

        // Delivery is async; wait for the frame to land.
        tokio::time::timeout(Duration::from_secs(1), sink.notified())
            .await
            .expect("message should be delivered");
        assert_eq!(
            sink.contents(),
            b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$2\r\nhi\r\n"
        );
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let hub = PubSubHub::new();
        assert_eq!(
            hub.publish(&Bytes::from_static(b"void"), &Bytes::from_static(b"x")),
            Reply::integer(0)
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_and_drop() {
        let hub = PubSubHub::new();
        let (conn, _) = Connection::fake();
        hub.subscribe(&conn, &cmd_line(&["a", "b"]));
        assert_eq!(hub.subscriber_count("a"), 1);

        hub.unsubscribe(&conn, &cmd_line(&["a"]));
        assert_eq!(hub.subscriber_count("a"), 0);
        assert_eq!(conn.subs_count(), 1);

        hub.drop_conn(&conn);
        assert_eq!(hub.subscriber_count("b"), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_all_with_no_subs() {
        let hub = PubSubHub::new();
        let (conn, _) = Connection::fake();
        let reply = hub.unsubscribe(&conn, &[]);
        assert_eq!(reply.to_bytes(), b"*3\r\n$11\r\nunsubscribe\r\n$-1\r\n:0\r\n");
    }
}
