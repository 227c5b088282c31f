//! Event bus: persisted, ordered, live event stream per deployment.
//!
//! `append` assigns the next seq under a per-deployment lock, persists the
//! event, and only then broadcasts it. Subscribers join the broadcast before
//! replaying history so nothing falls between the two; the stream drops
//! duplicates by seq and re-reads the log whenever it sees a gap or lags.

use std::sync::Arc;

use async_stream::try_stream;
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{BoxStream, Stream};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use agentship_state::{DeploymentId, EventLog, EventRecord, StorageResult};

use crate::domain::DeploymentEvent;
use crate::metrics::METRICS;
use crate::obs;

/// Stream of events for one deployment, in seq order.
pub type EventStream = BoxStream<'static, StorageResult<EventRecord>>;

pub struct EventBus {
    log: Arc<dyn EventLog>,
    sender: broadcast::Sender<EventRecord>,
    /// Last seq written per deployment; `None` until read from the log
    seqs: DashMap<DeploymentId, Arc<Mutex<Option<u64>>>>,
}

impl EventBus {
    pub fn new(log: Arc<dyn EventLog>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            log,
            sender,
            seqs: DashMap::new(),
        }
    }

    /// Persist and broadcast the next event of a deployment.
    pub async fn append(
        &self,
        deployment_id: &DeploymentId,
        event: &DeploymentEvent,
    ) -> StorageResult<EventRecord> {
        let slot = self.seqs.entry(deployment_id.clone()).or_default().clone();
        let mut last = slot.lock().await;

        let prev = match *last {
            Some(seq) => seq,
            None => self.log.last_seq(deployment_id).await?,
        };
        let record = EventRecord {
            deployment_id: deployment_id.clone(),
            seq: prev + 1,
            kind: event.kind().to_string(),
            payload: event.payload(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.log.append(&record).await {
            // Re-read from the log next time; another writer may own the seq.
            *last = None;
            return Err(e);
        }
        *last = Some(record.seq);

        // Still under the lock, so broadcast order matches seq order.
        let _ = self.sender.send(record.clone());
        drop(last);

        METRICS.inc_events_appended();
        obs::emit_event_appended(deployment_id.as_str(), &record.kind, record.seq);
        Ok(record)
    }

    /// Persisted events with `seq >= from_seq`.
    pub async fn history(
        &self,
        deployment_id: &DeploymentId,
        from_seq: u64,
    ) -> StorageResult<Vec<EventRecord>> {
        self.log.history(deployment_id, from_seq).await
    }

    pub async fn last_seq(&self, deployment_id: &DeploymentId) -> StorageResult<u64> {
        if let Some(slot) = self.seqs.get(deployment_id).map(|s| s.value().clone()) {
            if let Some(seq) = *slot.lock().await {
                return Ok(seq);
            }
        }
        self.log.last_seq(deployment_id).await
    }

    /// History from `from_seq`, then live events as they are appended.
    ///
    /// The stream does not end on its own while the bus is alive; callers
    /// stop once they have seen what they need (see `ends_deployment`).
    pub fn subscribe(&self, deployment_id: &DeploymentId, from_seq: u64) -> EventStream {
        let rx = self.sender.subscribe();
        Box::pin(follow(rx, self.log.clone(), deployment_id.clone(), from_seq))
    }
}

fn follow(
    mut rx: broadcast::Receiver<EventRecord>,
    log: Arc<dyn EventLog>,
    id: DeploymentId,
    from_seq: u64,
) -> impl Stream<Item = StorageResult<EventRecord>> + Send {
    try_stream! {
        let mut next = from_seq.max(1);
        for record in log.history(&id, next).await? {
            if record.seq >= next {
                next = record.seq + 1;
                yield record;
            }
        }

        loop {
            let catch_up = match rx.recv().await {
                Ok(record) if record.deployment_id != id || record.seq < next => false,
                Ok(record) if record.seq == next => {
                    next += 1;
                    yield record;
                    false
                }
                Ok(_) => true,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(deployment_id = %id, skipped, "event subscriber lagged, re-reading log");
                    true
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if catch_up {
                for record in log.history(&id, next).await? {
                    if record.seq >= next {
                        next = record.seq + 1;
                        yield record;
                    }
                }
            }
        }
    }
}
