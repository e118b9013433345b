//! Shared engine context
//!
//! Lock order, outermost first: one instance slot, then any of the job
//! index, the capacity books, the clock's timer table or the event history.
//! The instance map lock is never held while waiting on a slot.

use crate::capacity::CapacityManager;
use crate::clock::SimClock;
use crate::config::SimConfig;
use crate::events::EventBus;
use crate::seeded::{Draw, Seeded};
use crate::types::{InstanceId, JobId};
use std::sync::atomic::{AtomicU64, Ordering};

/// Collaborators every component needs
pub(crate) struct SimContext {
    pub config: SimConfig,
    pub clock: SimClock,
    pub capacity: CapacityManager,
    pub events: EventBus,
    pub seeded: Seeded,
    instance_seq: AtomicU64,
    job_seq: AtomicU64,
}

impl SimContext {
    pub fn new(config: SimConfig, clock: SimClock) -> Self {
        Self {
            capacity: CapacityManager::new(&config),
            events: EventBus::new(config.event_buffer),
            seeded: Seeded::new(config.seed),
            instance_seq: AtomicU64::new(0),
            job_seq: AtomicU64::new(0),
            clock,
            config,
        }
    }

    /// Next instance id; the same seed and call order give the same ids
    pub fn next_instance_id(&self) -> InstanceId {
        let n = self.instance_seq.fetch_add(1, Ordering::Relaxed) + 1;
        InstanceId::from_uuid(self.seeded.uuid("inst", Draw::EntityId, n))
    }

    pub fn next_job_id(&self) -> JobId {
        let n = self.job_seq.fetch_add(1, Ordering::Relaxed) + 1;
        JobId::from_uuid(self.seeded.uuid("job", Draw::EntityId, n))
    }
}
