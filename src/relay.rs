//! In-memory registry of last known operator state with fan-out to subscribers

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::models::{OperatorId, OperatorLocation, OperatorUpdate, TRAIL_LIMIT};

type Handler = Box<dyn FnMut(OperatorLocation) + Send>;

struct Subscriber {
    active: Arc<AtomicBool>,
    handler: Handler,
}

/// Location relay
///
/// Holds one merged record per operator and pushes every changed record to
/// all registered subscribers. Not durable: state lives as long as the value.
/// All methods take `&self`/`&mut self` without internal locking, the owner
/// is expected to drive it from a single task.
pub struct LocationRelay {
    operators: HashMap<OperatorId, OperatorLocation>,
    subscribers: Vec<Subscriber>,
    trail_limit: usize,
}

impl Default for LocationRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationRelay {
    pub fn new() -> Self {
        Self::with_trail_limit(TRAIL_LIMIT)
    }

    /// Relay keeping at most `trail_limit` past positions per operator
    pub fn with_trail_limit(trail_limit: usize) -> Self {
        Self {
            operators: HashMap::new(),
            subscribers: Vec::new(),
            trail_limit: trail_limit.max(1),
        }
    }

    pub fn trail_limit(&self) -> usize {
        self.trail_limit
    }

    /// Merge an update into the stored record and fan it out.
    ///
    /// Returns false when the update carries no usable operator id, in which
    /// case nothing is stored and no subscriber is called.
    pub fn apply_update(&mut self, update: &OperatorUpdate) -> bool {
        self.apply_update_at(update, Utc::now())
    }

    pub(crate) fn apply_update_at(&mut self, update: &OperatorUpdate, now: DateTime<Utc>) -> bool {
        let Some(id) = update.operator_id() else {
            debug!("Ignoring operator update without id");
            return false;
        };

        let record = self.operators.entry(id).or_insert_with_key(|id| {
            info!("Tracking new operator {}", id);
            OperatorLocation::new(id.clone(), now)
        });
        record.merge(update, self.trail_limit, now);

        let record = record.clone();
        self.fan_out(record);
        true
    }

    fn fan_out(&mut self, record: OperatorLocation) {
        self.subscribers
            .retain(|subscriber| subscriber.active.load(Ordering::Acquire));

        for subscriber in self.subscribers.iter_mut() {
            (subscriber.handler)(record.clone());
        }
    }

    /// Copy of every tracked record, in no particular order
    pub fn snapshot(&self) -> Vec<OperatorLocation> {
        self.operators.values().cloned().collect()
    }

    pub fn get(&self, id: &OperatorId) -> Option<&OperatorLocation> {
        self.operators.get(id)
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Register a handler called once per applied update with the changed
    /// record. Delivery stops once the returned handle is unsubscribed or
    /// dropped.
    pub fn subscribe<F>(&mut self, handler: F) -> Subscription
    where
        F: FnMut(OperatorLocation) + Send + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        self.subscribers.push(Subscriber {
            active: active.clone(),
            handler: Box::new(handler),
        });
        debug!("Subscriber registered");
        Subscription { active }
    }

    /// Number of subscribers that still receive updates
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .iter()
            .filter(|subscriber| subscriber.active.load(Ordering::Acquire))
            .count()
    }
}

/// Deregistration handle returned by [`LocationRelay::subscribe`]
#[must_use = "dropping a Subscription deregisters its handler"]
#[derive(Debug)]
pub struct Subscription {
    active: Arc<AtomicBool>,
}

impl Subscription {
    /// Stop further deliveries to the handler
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}
