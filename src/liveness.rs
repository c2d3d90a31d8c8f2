//! Liveness supervisor
//!
//! A ticker task posts [`ServerCommand::Heartbeat`] every interval. On each
//! tick the actor closes connections that have been silent for longer than
//! the timeout, running the same teardown as a transport close, and pings
//! everyone left.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::broadcast;
use crate::message::ServerMessage;
use crate::server::{ChatServer, ServerCommand};

/// Close reason for evicted connections
pub const TIMEOUT_REASON: &str = "Connection timeout";

/// Spawn the heartbeat ticker
///
/// The first tick fires one full period after start. The task ends on its
/// own once the server is gone.
pub fn spawn_heartbeat(
    period: Duration,
    server: mpsc::WeakSender<ServerCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(tx) = server.upgrade() else {
                break;
            };
            if tx.send(ServerCommand::Heartbeat).await.is_err() {
                break;
            }
        }
        debug!("Heartbeat task stopped");
    })
}

impl ChatServer {
    pub(crate) fn handle_heartbeat(&mut self) {
        let stale = self
            .registry
            .stale_connections(Instant::now(), self.config.heartbeat_timeout());

        for conn_id in stale {
            info!("Evicting idle connection {}", conn_id);
            if !self.registry.close(conn_id, TIMEOUT_REASON) {
                debug!("Writer of {} already gone", conn_id);
            }
            self.handle_disconnect(conn_id);
        }

        let pinged = broadcast::to_all(&self.registry, &ServerMessage::Ping {});
        debug!("Heartbeat: pinged {} connections", pinged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticker_posts_heartbeats() {
        let (tx, mut rx) = mpsc::channel(8);
        let task = spawn_heartbeat(Duration::from_secs(30), tx.downgrade());

        time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(rx.recv().await, Some(ServerCommand::Heartbeat)));

        time::sleep(Duration::from_secs(30)).await;
        assert!(matches!(rx.recv().await, Some(ServerCommand::Heartbeat)));

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_stops_without_server() {
        let (tx, rx) = mpsc::channel::<ServerCommand>(8);
        let task = spawn_heartbeat(Duration::from_secs(1), tx.downgrade());
        drop(tx);
        drop(rx);

        time::sleep(Duration::from_secs(2)).await;
        assert!(task.await.is_ok());
    }
}
