//! Lifecycle event stream
//!
//! Every instance and job transition is published as a [`SimEvent`]. Events
//! are emitted while the owning instance's critical section is held, so the
//! events of one instance (and its jobs) arrive in causal order.

use crate::types::{InstanceId, InstanceState, JobId, JobState, SimTime, TenantId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// What changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum EventKind {
    Instance {
        instance_id: InstanceId,
        tenant_id: TenantId,
        /// `None` for the initial `requested` entry
        from: Option<InstanceState>,
        to: InstanceState,
    },
    Job {
        job_id: JobId,
        instance_id: InstanceId,
        tenant_id: TenantId,
        /// `None` for the initial `queued` entry
        from: Option<JobState>,
        to: JobState,
    },
}

/// Timestamped transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimEvent {
    pub at: SimTime,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl SimEvent {
    /// Instance the event belongs to (jobs report their owner)
    pub fn instance_id(&self) -> &InstanceId {
        match &self.kind {
            EventKind::Instance { instance_id, .. } | EventKind::Job { instance_id, .. } => instance_id,
        }
    }
}

/// Broadcast channel plus a bounded replay buffer
pub struct EventBus {
    tx: broadcast::Sender<SimEvent>,
    history: Mutex<VecDeque<SimEvent>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Receive events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SimEvent> {
        self.tx.subscribe()
    }

    /// Stream of events published from now on
    ///
    /// Ends once the bus is dropped. A consumer that falls more than the
    /// buffer capacity behind skips the missed events.
    pub fn stream(&self) -> Pin<Box<dyn futures::Stream<Item = SimEvent> + Send>> {
        let mut rx = self.subscribe();

        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn publish(&self, event: SimEvent) {
        trace!(?event, "Publishing event");
        {
            let mut history = self.history.lock();
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn instance_transition(
        &self,
        at: SimTime,
        instance_id: &InstanceId,
        tenant_id: &TenantId,
        from: Option<InstanceState>,
        to: InstanceState,
    ) {
        self.publish(SimEvent {
            at,
            kind: EventKind::Instance {
                instance_id: instance_id.clone(),
                tenant_id: tenant_id.clone(),
                from,
                to,
            },
        });
    }

    pub fn job_transition(
        &self,
        at: SimTime,
        job_id: &JobId,
        instance_id: &InstanceId,
        tenant_id: &TenantId,
        from: Option<JobState>,
        to: JobState,
    ) {
        self.publish(SimEvent {
            at,
            kind: EventKind::Job {
                job_id: job_id.clone(),
                instance_id: instance_id.clone(),
                tenant_id: tenant_id.clone(),
                from,
                to,
            },
        });
    }

    /// Most recent events, oldest first
    pub fn history(&self) -> Vec<SimEvent> {
        self.history.lock().iter().cloned().collect()
    }
}
