//! ZMQ block announcement transport
//!
//! Subscribes to the node's `rawblock` publisher and reports every message as
//! an [`Announcement::Block`]. Connection failures and dropped connections
//! are reported as [`Announcement::Retrying`] and retried after a fixed delay.
//!
//! The socket's own connect keeps retrying a refused connection indefinitely,
//! so every connect attempt is bounded by [`CONNECT_TIMEOUT`].

use super::Announcement;
use crate::{Error, Result};
use futures::Stream;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use zeromq::{Socket, SocketRecv, SubSocket};

/// Topic carrying raw serialized blocks
pub const RAW_BLOCK_TOPIC: &str = "rawblock";

/// Upper bound for one connect attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Announcements buffered while a refresh is in progress
const ANNOUNCEMENT_BUFFER: usize = 64;

/// Start a background subscription and return its announcements
pub fn block_announcements(
    endpoint: String,
    reconnect_delay: Duration,
) -> impl Stream<Item = Announcement> + Send {
    announcements_with_timeout(endpoint, CONNECT_TIMEOUT, reconnect_delay)
}

fn announcements_with_timeout(
    endpoint: String,
    connect_timeout: Duration,
    reconnect_delay: Duration,
) -> impl Stream<Item = Announcement> + Send {
    let (tx, rx) = mpsc::channel(ANNOUNCEMENT_BUFFER);
    tokio::spawn(subscription_loop(endpoint, connect_timeout, reconnect_delay, tx));

    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|announcement| (announcement, rx))
    })
}

async fn connect(endpoint: &str, connect_timeout: Duration) -> Result<SubSocket> {
    let mut socket = SubSocket::new();
    timeout(connect_timeout, socket.connect(endpoint))
        .await
        .map_err(|_| {
            Error::subscription(format!(
                "connect to {} timed out after {:?}",
                endpoint, connect_timeout
            ))
        })?
        .map_err(|e| Error::subscription(format!("connect to {} failed: {}", endpoint, e)))?;
    socket
        .subscribe(RAW_BLOCK_TOPIC)
        .await
        .map_err(|e| Error::subscription(format!("subscribe to {} failed: {}", RAW_BLOCK_TOPIC, e)))?;
    Ok(socket)
}

/// Keep a subscription alive until the receiving side goes away
async fn subscription_loop(
    endpoint: String,
    connect_timeout: Duration,
    reconnect_delay: Duration,
    tx: mpsc::Sender<Announcement>,
) {
    loop {
        let outcome = match connect(&endpoint, connect_timeout).await {
            Ok(mut socket) => {
                if tx.send(Announcement::Connected).await.is_err() {
                    return;
                }
                loop {
                    match socket.recv().await {
                        Ok(_message) => {
                            debug!("{} announcement received", RAW_BLOCK_TOPIC);
                            if tx.send(Announcement::Block).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("ZMQ receive failed: {}", e);
                            break Announcement::Retrying {
                                error: format!("connection lost: {}", e),
                            };
                        }
                    }
                }
            }
            Err(e) => Announcement::Retrying {
                error: e.to_string(),
            },
        };

        if tx.send(outcome).await.is_err() {
            return;
        }
        sleep(reconnect_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn first_two(endpoint: &str) -> Vec<Announcement> {
        let announcements = announcements_with_timeout(
            endpoint.to_string(),
            Duration::from_millis(100),
            Duration::from_millis(10),
        );
        tokio::time::timeout(Duration::from_secs(5), announcements.take(2).collect())
            .await
            .expect("no announcements")
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_keeps_retrying() {
        let announcements = first_two("tcp://127.0.0.1:1").await;

        assert_eq!(announcements.len(), 2);
        for announcement in announcements {
            assert!(matches!(announcement, Announcement::Retrying { .. }));
        }
    }

    #[tokio::test]
    async fn test_malformed_endpoint_reported_as_retrying() {
        let announcements = first_two("not-an-endpoint").await;

        match &announcements[0] {
            Announcement::Retrying { error } => assert!(error.contains("not-an-endpoint")),
            other => panic!("unexpected announcement: {:?}", other),
        }
    }
}
