//! `GpuCloud`: the engine facade handed to the transport layer
//!
//! Wires the capacity books, instance registry, job scheduler and metrics
//! generator around one clock and one event bus. Every call takes the
//! caller's [`CallContext`]; entities of other tenants are invisible.

use crate::capacity::PoolUsage;
use crate::clock::SimClock;
use crate::config::SimConfig;
use crate::context::SimContext;
use crate::error::{Result, SimError};
use crate::events::SimEvent;
use crate::metrics::{MetricSeries, MetricsGenerator};
use crate::registry::InstanceRegistry;
use crate::scheduler::JobScheduler;
use crate::seeded::Seeded;
use crate::types::{
    CallContext, Instance, InstanceFilter, InstanceId, InstanceListing, InstanceRequest, Job,
    JobFilter, JobId, JobScope, JobSpec, SimTime, Tenant,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// Aggregate counters across all tenants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub now: SimTime,
    pub tenants: usize,
    pub instances: usize,
    pub jobs: usize,
    pub instances_by_state: BTreeMap<String, usize>,
    pub jobs_by_state: BTreeMap<String, usize>,
    pub pools: Vec<PoolUsage>,
    pub pending_timers: usize,
}

/// Full export of engine state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub taken_at: SimTime,
    pub tenants: Vec<Tenant>,
    pub instances: Vec<Instance>,
    pub jobs: Vec<Job>,
}

/// Simulated multi-tenant GPU cloud
pub struct GpuCloud {
    ctx: Arc<SimContext>,
    registry: InstanceRegistry,
    scheduler: JobScheduler,
    metrics: MetricsGenerator,
}

impl GpuCloud {
    /// Validate `config` and build an engine driven by `clock`
    pub fn new(config: SimConfig, clock: SimClock) -> Result<Self> {
        config.validate()?;

        let metrics = MetricsGenerator::new(config.metrics, Seeded::new(config.seed));
        info!(
            seed = config.seed,
            pools = config.pools.len(),
            manual_clock = clock.is_manual(),
            "Starting GPU cloud simulator"
        );

        let ctx = Arc::new(SimContext::new(config, clock));
        let registry = InstanceRegistry::new(Arc::clone(&ctx));
        let scheduler = JobScheduler::new(Arc::clone(&ctx), registry.clone());

        Ok(Self {
            ctx,
            registry,
            scheduler,
            metrics,
        })
    }

    /// Engine on a manual clock, advanced only by the caller
    pub fn manual(config: SimConfig) -> Result<Self> {
        Self::new(config, SimClock::manual())
    }

    pub fn clock(&self) -> &SimClock {
        &self.ctx.clock
    }

    pub fn config(&self) -> &SimConfig {
        &self.ctx.config
    }

    pub fn now(&self) -> SimTime {
        self.ctx.clock.now()
    }

    pub fn create_instance(&self, call: &CallContext, request: InstanceRequest) -> Result<Instance> {
        self.registry.create(call, request)
    }

    pub fn get_instance(&self, call: &CallContext, id: &InstanceId) -> Result<Instance> {
        self.registry.get(call, id)
    }

    pub fn list_instances(&self, call: &CallContext, filter: &InstanceFilter) -> InstanceListing {
        self.registry.list(call, filter).into()
    }

    pub fn delete_instance(&self, call: &CallContext, id: &InstanceId) -> Result<Instance> {
        self.registry.delete(call, id)
    }

    pub fn submit_job(&self, call: &CallContext, instance_id: &InstanceId, spec: JobSpec) -> Result<Job> {
        self.scheduler.submit(call, instance_id, spec)
    }

    pub fn get_job(&self, call: &CallContext, id: &JobId) -> Result<Job> {
        self.scheduler.get(call, id)
    }

    pub fn list_jobs(&self, call: &CallContext, scope: &JobScope, filter: &JobFilter) -> Result<Vec<Job>> {
        self.scheduler.list(call, scope, filter)
    }

    pub fn cancel_job(&self, call: &CallContext, id: &JobId) -> Result<Job> {
        self.scheduler.cancel(call, id)
    }

    /// Metric samples for one instance over `range`, one per `interval`
    /// (defaults to the configured sample interval). The range end is
    /// clamped to the current time.
    pub fn query_metrics(
        &self,
        call: &CallContext,
        id: &InstanceId,
        range: Range<SimTime>,
        interval: Option<Duration>,
    ) -> Result<MetricSeries> {
        let interval = interval.unwrap_or_else(|| self.metrics.default_interval());
        if interval < Duration::from_millis(1) {
            return Err(SimError::validation("metric interval must be at least 1ms"));
        }

        // Snapshot under the instance lock, then generate without it
        let (instance, jobs) = {
            let slot = self.registry.owned_slot(call, id)?;
            let guard = slot.lock();
            (guard.instance.clone(), guard.jobs.jobs().to_vec())
        };
        Ok(self
            .metrics
            .series(instance, jobs, range.start, range.end, interval, self.now()))
    }

    /// Receive every transition from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SimEvent> {
        self.ctx.events.subscribe()
    }

    /// Async stream of every transition from now on
    pub fn event_stream(&self) -> Pin<Box<dyn futures::Stream<Item = SimEvent> + Send>> {
        self.ctx.events.stream()
    }

    /// Most recent transitions, bounded by `event_buffer`
    pub fn recent_events(&self) -> Vec<SimEvent> {
        self.ctx.events.history()
    }

    /// The caller's tenant record, created on first sight
    pub fn tenant(&self, call: &CallContext) -> Tenant {
        self.ctx.capacity.ensure_tenant(&call.tenant_id, self.now())
    }

    pub fn pool_usage(&self) -> Vec<PoolUsage> {
        self.ctx.capacity.pool_usage()
    }

    pub fn stats(&self) -> EngineStats {
        let instances = self.registry.all_instances();
        let jobs = self.scheduler.all_jobs();

        let mut instances_by_state = BTreeMap::new();
        for instance in &instances {
            *instances_by_state
                .entry(instance.state.as_str().to_string())
                .or_insert(0) += 1;
        }
        let mut jobs_by_state = BTreeMap::new();
        for job in &jobs {
            *jobs_by_state.entry(job.state.as_str().to_string()).or_insert(0) += 1;
        }

        EngineStats {
            now: self.now(),
            tenants: self.ctx.capacity.tenant_count(),
            instances: instances.len(),
            jobs: jobs.len(),
            instances_by_state,
            jobs_by_state,
            pools: self.pool_usage(),
            pending_timers: self.ctx.clock.pending(),
        }
    }

    /// Export every tenant, instance and job
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            taken_at: self.now(),
            tenants: self.ctx.capacity.tenants(),
            instances: self.registry.all_instances(),
            jobs: self.scheduler.all_jobs(),
        }
    }
}
