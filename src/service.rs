//! Relay task hosting one [`LocationRelay`]
//!
//! The relay itself is not synchronized. It is owned by a single tokio task
//! and every transport talks to it through a cloneable [`RelayHandle`], so
//! updates are applied one at a time in arrival order.

use std::collections::VecDeque;

use serde::Serialize;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc, oneshot,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    errors::RelayError,
    models::{OperatorId, OperatorLocation, OperatorUpdate},
    relay::{LocationRelay, Subscription},
};

enum RelayCommand {
    Apply {
        update: OperatorUpdate,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<OperatorLocation>>,
    },
    Get {
        id: OperatorId,
        reply: oneshot::Sender<Option<OperatorLocation>>,
    },
    Subscribe {
        buffer: usize,
        reply: oneshot::Sender<Feed>,
    },
    Stats {
        reply: oneshot::Sender<RelayStats>,
    },
}

/// Counters reported by the health endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub operators: usize,
    /// Feeds and other handlers still receiving updates
    pub subscribers: usize,
}

/// Cloneable handle to the relay task
#[derive(Clone, Debug)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayCommand>,
}

/// Incremental updates for one consumer
///
/// The queue holds at most `buffer` records. When the consumer falls behind
/// the oldest queued records are overwritten, and the next [`Feed::recv`]
/// first replays a fresh snapshot so that no operator is left stale.
///
/// Dropping the feed deregisters it from the relay.
#[derive(Debug)]
pub struct Feed {
    rx: broadcast::Receiver<OperatorLocation>,
    relay: mpsc::WeakSender<RelayCommand>,
    resync: VecDeque<OperatorLocation>,
    lagged: bool,
    _subscription: Subscription,
}

impl Feed {
    /// Next changed record, None once the relay has shut down
    ///
    /// Cancel safe: a resynchronization interrupted by cancellation is
    /// retried on the next call.
    pub async fn recv(&mut self) -> Option<OperatorLocation> {
        loop {
            if self.lagged {
                self.resync = self.catch_up().await.into();
                self.lagged = false;
            }
            if let Some(record) = self.resync.pop_front() {
                return Some(record);
            }

            match self.rx.recv().await {
                Ok(record) => return Some(record),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Feed lagging, {} updates overwritten, resynchronizing", skipped);
                    self.lagged = true;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Current relay state, empty if the relay is gone
    ///
    /// Records still queued behind the snapshot are at most as new as it, and
    /// every operator's last queued record matches the snapshot, so replaying
    /// them afterwards ends in the relay's state.
    async fn catch_up(&self) -> Vec<OperatorLocation> {
        let Some(tx) = self.relay.upgrade() else {
            return Vec::new();
        };
        match (RelayHandle { tx }).snapshot().await {
            Ok(records) => records,
            Err(e) => {
                debug!("Cannot resynchronize feed: {}", e);
                Vec::new()
            }
        }
    }
}

/// Start the relay task.
///
/// `capacity` bounds the command queue. The task stops once every
/// [`RelayHandle`] has been dropped.
pub fn spawn_relay(relay: LocationRelay, capacity: usize) -> (RelayHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(run_relay(relay, rx, tx.downgrade()));
    (RelayHandle { tx }, handle)
}

async fn run_relay(
    mut relay: LocationRelay,
    mut rx: mpsc::Receiver<RelayCommand>,
    weak: mpsc::WeakSender<RelayCommand>,
) {
    info!(
        "Location relay started: trail_limit={}",
        relay.trail_limit()
    );

    while let Some(command) = rx.recv().await {
        match command {
            RelayCommand::Apply { update, reply } => {
                let applied = relay.apply_update(&update);
                let _ = reply.send(applied);
            }
            RelayCommand::Snapshot { reply } => {
                let _ = reply.send(relay.snapshot());
            }
            RelayCommand::Get { id, reply } => {
                let _ = reply.send(relay.get(&id).cloned());
            }
            RelayCommand::Subscribe { buffer, reply } => {
                let (tx, rx) = broadcast::channel(buffer.max(1));
                let subscription = relay.subscribe(move |record: OperatorLocation| {
                    // Only fails once the feed is gone, pruned on next fan-out
                    let _ = tx.send(record);
                });
                debug!("Feed opened, {} active", relay.subscriber_count());
                let _ = reply.send(Feed {
                    rx,
                    relay: weak.clone(),
                    resync: VecDeque::new(),
                    lagged: false,
                    _subscription: subscription,
                });
            }
            RelayCommand::Stats { reply } => {
                let _ = reply.send(RelayStats {
                    operators: relay.len(),
                    subscribers: relay.subscriber_count(),
                });
            }
        }
    }

    info!("Location relay stopped with {} operators", relay.len());
}

impl RelayHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RelayCommand,
    ) -> Result<T, RelayError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| RelayError::RelayClosed)?;
        response.await.map_err(|_| RelayError::RelayClosed)
    }

    /// Apply an update, returning whether it was accepted
    pub async fn apply(&self, update: OperatorUpdate) -> Result<bool, RelayError> {
        self.request(|reply| RelayCommand::Apply { update, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<Vec<OperatorLocation>, RelayError> {
        self.request(|reply| RelayCommand::Snapshot { reply }).await
    }

    pub async fn get(&self, id: OperatorId) -> Result<Option<OperatorLocation>, RelayError> {
        self.request(|reply| RelayCommand::Get { id, reply }).await
    }

    pub async fn stats(&self) -> Result<RelayStats, RelayError> {
        self.request(|reply| RelayCommand::Stats { reply }).await
    }

    /// Subscribe with a per-consumer buffer of `buffer` records. When the
    /// buffer is full the oldest queued record for this consumer is dropped.
    pub async fn subscribe(&self, buffer: usize) -> Result<Feed, RelayError> {
        self.request(|reply| RelayCommand::Subscribe { buffer, reply })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::models::OperatorStatus;

    #[tokio::test]
    async fn apply_and_snapshot() {
        let (relay, _task) = spawn_relay(LocationRelay::new(), 16);

        assert!(relay
            .apply(OperatorUpdate::for_operator("OP-1").with_position(43.65, -79.38))
            .await
            .unwrap());
        assert!(!relay.apply(OperatorUpdate::default()).await.unwrap());

        let snapshot = relay.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);

        let id = OperatorId::try_from("OP-1").unwrap();
        assert!(relay.get(id).await.unwrap().is_some());
        let missing = OperatorId::try_from("OP-404").unwrap();
        assert!(relay.get(missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn feed_receives_updates_until_dropped() {
        let (relay, _task) = spawn_relay(LocationRelay::new(), 16);
        relay
            .apply(OperatorUpdate::for_operator("OP-1"))
            .await
            .unwrap();

        let mut feed = relay.subscribe(8).await.unwrap();
        relay
            .apply(OperatorUpdate::for_operator("OP-1").with_status(OperatorStatus::Online))
            .await
            .unwrap();

        let record = feed.recv().await.unwrap();
        assert_eq!(record.status, OperatorStatus::Online);
        assert_eq!(relay.stats().await.unwrap().subscribers, 1);
        drop(feed);
        assert_eq!(
            relay.stats().await.unwrap(),
            RelayStats {
                operators: 1,
                subscribers: 0
            }
        );

        // Relay keeps working with the consumer gone
        assert!(relay
            .apply(OperatorUpdate::for_operator("OP-2"))
            .await
            .unwrap());
    }

    /// Drain everything currently deliverable without waiting for new updates
    async fn drain(feed: &mut Feed) -> Vec<OperatorLocation> {
        let mut records = Vec::new();
        while let Ok(Some(record)) = timeout(Duration::from_millis(50), feed.recv()).await {
            records.push(record);
        }
        records
    }

    #[tokio::test]
    async fn full_feed_keeps_newest_updates() {
        let (relay, _task) = spawn_relay(LocationRelay::new(), 16);
        let mut feed = relay.subscribe(2).await.unwrap();

        for i in 0..5 {
            relay
                .apply(OperatorUpdate::for_operator(format!("OP-{i}")))
                .await
                .unwrap();
        }

        let records = drain(&mut feed).await;
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        // Snapshot replay first, then the two newest queued records
        assert_eq!(ids.len(), 7);
        assert_eq!(&ids[5..], ["OP-3", "OP-4"]);

        let mut replayed = ids[..5].to_vec();
        replayed.sort();
        assert_eq!(replayed, ["OP-0", "OP-1", "OP-2", "OP-3", "OP-4"]);
    }

    #[tokio::test]
    async fn lagging_feed_ends_in_relay_state() {
        let (relay, _task) = spawn_relay(LocationRelay::new(), 16);
        let mut feed = relay.subscribe(2).await.unwrap();

        relay
            .apply(OperatorUpdate::for_operator("OP-2").with_status(OperatorStatus::Busy))
            .await
            .unwrap();
        for lat in 40..45 {
            relay
                .apply(OperatorUpdate::for_operator("OP-1").with_position(lat as f64, -79.0))
                .await
                .unwrap();
        }

        let mut latest = HashMap::new();
        for record in drain(&mut feed).await {
            latest.insert(record.id.clone(), record);
        }

        let snapshot = relay.snapshot().await.unwrap();
        assert_eq!(latest.len(), snapshot.len());
        for record in snapshot {
            assert_eq!(latest.get(&record.id), Some(&record));
        }
        let op1 = OperatorId::try_from("OP-1").unwrap();
        assert_eq!(latest[&op1].position.unwrap().lat, 44.0);
    }

    #[tokio::test]
    async fn feed_ends_with_relay() {
        let (relay, task) = spawn_relay(LocationRelay::new(), 4);
        let mut feed = relay.subscribe(4).await.unwrap();

        drop(relay);
        task.await.unwrap();

        assert!(feed.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_relay_reports_error() {
        let (relay, task) = spawn_relay(LocationRelay::new(), 1);
        task.abort();
        let _ = task.await;

        assert!(matches!(
            relay.snapshot().await,
            Err(RelayError::RelayClosed)
        ));
    }
}
