//! Instance registry and lifecycle state machine
//!
//! ```text
//! requested ──► provisioning ──► running ──► terminating ──► terminated
//!     │              │  │                        ▲
//!     └──► failed ◄──┘  └────────────────────────┘ (delete while provisioning)
//! ```
//!
//! Every instance lives in its own slot behind its own lock; that lock also
//! covers the instance's jobs, so a delete racing a job-completion or
//! provisioning timer always sees a consistent view. Timer callbacks re-check
//! the state under the lock and do nothing if the instance has moved on.

use crate::capacity::ReservationToken;
use crate::clock::TimerId;
use crate::context::SimContext;
use crate::error::{Result, SimError};
use crate::scheduler::JobBook;
use crate::seeded::Draw;
use crate::types::{
    CallContext, GpuSku, Instance, InstanceFailure, InstanceFilter, InstanceId, InstanceRequest,
    InstanceState, JobFailure, Region, SimTime, StateTransition,
};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Everything guarded by one instance's critical section
pub(crate) struct InstanceSlot {
    pub instance: Instance,
    pub reservation: Option<ReservationToken>,
    /// Pending provisioning or teardown timer
    pub timer: Option<TimerId>,
    pub jobs: JobBook,
}

impl InstanceSlot {
    /// Record entry into `to` and publish it. Illegal edges are refused.
    pub fn transition(&mut self, ctx: &SimContext, to: InstanceState, now: SimTime) -> bool {
        let from = self.instance.state;
        if !from.can_transition_to(to) {
            error!(
                instance_id = %self.instance.id,
                from = %from, to = %to,
                "Refusing illegal lifecycle transition"
            );
            return false;
        }

        // Timestamps never go backwards within one instance
        let at = self
            .instance
            .transitions
            .last()
            .map_or(now, |last| last.at.max(now));

        self.instance.state = to;
        self.instance.transitions.push(StateTransition { state: to, at });
        ctx.events
            .instance_transition(at, &self.instance.id, &self.instance.tenant_id, Some(from), to);
        true
    }

    fn release_reservation(&mut self, ctx: &SimContext) {
        if let Some(token) = self.reservation.take() {
            ctx.capacity.release(&token);
        }
    }

    fn cancel_timer(&mut self, ctx: &SimContext) {
        if let Some(timer) = self.timer.take() {
            ctx.clock.cancel(timer);
        }
    }
}

pub(crate) type SlotRef = Arc<Mutex<InstanceSlot>>;

struct RegistryInner {
    ctx: Arc<SimContext>,
    slots: RwLock<HashMap<InstanceId, SlotRef>>,
}

/// Owns every instance and drives its lifecycle
#[derive(Clone)]
pub struct InstanceRegistry {
    inner: Arc<RegistryInner>,
}

impl InstanceRegistry {
    pub(crate) fn new(ctx: Arc<SimContext>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                ctx,
                slots: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Validate, reserve capacity and start the provisioning chain.
    ///
    /// A request that fails validation leaves no trace. A request that is
    /// valid but cannot be reserved is recorded as `requested -> failed` and
    /// the reservation error is returned.
    pub fn create(&self, call: &CallContext, request: InstanceRequest) -> Result<Instance> {
        let ctx = &self.inner.ctx;
        let (sku, region) = self.validate(&request)?;

        let now = ctx.clock.now();
        let tenant = call.tenant_id.clone();
        ctx.capacity.ensure_tenant(&tenant, now);

        let job_slots = request
            .job_slots
            .unwrap_or(request.count.saturating_mul(ctx.config.job_slots_per_gpu));
        let mut instance = Instance {
            id: ctx.next_instance_id(),
            tenant_id: tenant.clone(),
            name: request
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("{}-instance", sku)),
            sku,
            gpu_count: request.count,
            region,
            state: InstanceState::Requested,
            job_slots,
            hourly_rate: sku.hourly_rate() * f64::from(request.count),
            ip_address: None,
            created_at: now,
            transitions: vec![StateTransition {
                state: InstanceState::Requested,
                at: now,
            }],
            job_ids: Vec::new(),
            failure: None,
        };
        let id = instance.id.clone();

        let reservation = match ctx.capacity.reserve(&tenant, region, sku, request.count, now) {
            Ok(token) => Ok(token),
            Err(e @ SimError::CapacityExceeded { .. }) => {
                instance.failure = Some(InstanceFailure::CapacityExceeded);
                Err(e)
            }
            Err(e @ SimError::QuotaExceeded { .. }) => {
                instance.failure = Some(InstanceFailure::QuotaExceeded);
                Err(e)
            }
            // Anything else is a rejection with nothing recorded
            Err(e) => return Err(e),
        };

        let slot: SlotRef = Arc::new(Mutex::new(InstanceSlot {
            instance,
            reservation: None,
            timer: None,
            jobs: JobBook::default(),
        }));

        let mut guard = slot.lock();
        self.inner.slots.write().insert(id.clone(), Arc::clone(&slot));
        ctx.events
            .instance_transition(now, &id, &tenant, None, InstanceState::Requested);

        match reservation {
            Ok(token) => {
                guard.reservation = Some(token);
                guard.transition(ctx, InstanceState::Provisioning, now);

                let delay = ctx.seeded.duration_between(
                    id.as_str(),
                    Draw::ProvisionDelay,
                    ctx.config.provisioning_delay.min(),
                    ctx.config.provisioning_delay.max(),
                );
                let weak = Arc::downgrade(&self.inner);
                let timer_id = id.clone();
                guard.timer = Some(ctx.clock.schedule(delay, move || {
                    on_provisioned(&weak, &timer_id);
                }));

                info!(
                    instance_id = %id, tenant_id = %tenant, %sku, %region,
                    count = guard.instance.gpu_count,
                    delay_secs = delay.as_secs_f64(),
                    "Provisioning instance"
                );
                Ok(guard.instance.clone())
            }
            Err(e) => {
                guard.transition(ctx, InstanceState::Failed, now);
                warn!(instance_id = %id, tenant_id = %tenant, error = %e, "Instance request rejected");
                Err(e)
            }
        }
    }

    fn validate(&self, request: &InstanceRequest) -> Result<(GpuSku, Region)> {
        let ctx = &self.inner.ctx;
        let sku: GpuSku = request.gpu_type.parse()?;
        let region: Region = request.region.parse()?;

        if request.count == 0 {
            return Err(SimError::validation("GPU count must be positive"));
        }
        if request.count > ctx.config.max_gpus_per_instance {
            return Err(SimError::validation(format!(
                "GPU count {} exceeds per-instance limit {}",
                request.count, ctx.config.max_gpus_per_instance
            )));
        }
        if request.job_slots == Some(0) {
            return Err(SimError::validation("job slot override must be positive"));
        }
        ctx.capacity.check_offered(region, sku)?;
        Ok((sku, region))
    }

    /// Fetch one of the caller's instances
    pub fn get(&self, call: &CallContext, id: &InstanceId) -> Result<Instance> {
        let slot = self.owned_slot(call, id)?;
        let instance = slot.lock().instance.clone();
        Ok(instance)
    }

    /// The caller's instances matching `filter`, oldest first
    pub fn list(&self, call: &CallContext, filter: &InstanceFilter) -> Vec<Instance> {
        let mut out: Vec<Instance> = self
            .all_slots()
            .into_iter()
            .filter_map(|slot| {
                let guard = slot.lock();
                (guard.instance.tenant_id == call.tenant_id && filter.matches(&guard.instance))
                    .then(|| guard.instance.clone())
            })
            .collect();
        sort_instances(&mut out);
        out
    }

    /// Begin teardown. Idempotent: deleting an instance that is already
    /// terminating, terminated or failed succeeds without effect.
    pub fn delete(&self, call: &CallContext, id: &InstanceId) -> Result<Instance> {
        let ctx = &self.inner.ctx;
        let slot = self.owned_slot(call, id)?;
        let mut guard = slot.lock();

        match guard.instance.state {
            InstanceState::Provisioning | InstanceState::Running => {}
            state => {
                debug!(instance_id = %id, %state, "Delete is a no-op");
                return Ok(guard.instance.clone());
            }
        }

        let now = ctx.clock.now();
        guard.cancel_timer(ctx);

        let failed = guard.jobs.fail_all(ctx, JobFailure::InstanceTerminated, now);
        if failed > 0 {
            info!(instance_id = %id, jobs = failed, "Failed outstanding jobs for deleted instance");
        }

        guard.transition(ctx, InstanceState::Terminating, now);

        let delay = ctx.seeded.duration_between(
            id.as_str(),
            Draw::TeardownDelay,
            ctx.config.teardown_delay.min(),
            ctx.config.teardown_delay.max(),
        );
        let weak = Arc::downgrade(&self.inner);
        let timer_id = id.clone();
        guard.timer = Some(ctx.clock.schedule(delay, move || {
            on_torn_down(&weak, &timer_id);
        }));

        info!(instance_id = %id, delay_secs = delay.as_secs_f64(), "Terminating instance");
        Ok(guard.instance.clone())
    }

    /// Slot for `id` if it exists and belongs to the caller
    pub(crate) fn owned_slot(&self, call: &CallContext, id: &InstanceId) -> Result<SlotRef> {
        let slot = self
            .slot(id)
            .ok_or_else(|| SimError::InstanceNotFound(id.clone()))?;
        if slot.lock().instance.tenant_id != call.tenant_id {
            return Err(SimError::InstanceNotFound(id.clone()));
        }
        Ok(slot)
    }

    pub(crate) fn slot(&self, id: &InstanceId) -> Option<SlotRef> {
        self.inner.slots.read().get(id).cloned()
    }

    pub(crate) fn all_slots(&self) -> Vec<SlotRef> {
        self.inner.slots.read().values().cloned().collect()
    }

    /// Every instance of every tenant, oldest first
    pub fn all_instances(&self) -> Vec<Instance> {
        let mut out: Vec<Instance> = self
            .all_slots()
            .into_iter()
            .map(|slot| slot.lock().instance.clone())
            .collect();
        sort_instances(&mut out);
        out
    }

    pub fn len(&self) -> usize {
        self.inner.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sort_instances(instances: &mut [Instance]) {
    instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// Deterministic private address for a running instance
fn synthetic_ip(ctx: &SimContext, id: &InstanceId) -> String {
    let mut rng = ctx.seeded.rng(id.as_str(), Draw::IpAddress, 0);
    format!(
        "10.{}.{}.{}",
        rng.gen_range(0..=255u8),
        rng.gen_range(0..=255u8),
        rng.gen_range(1..=254u8)
    )
}

/// `provisioning -> running | failed`
fn on_provisioned(registry: &Weak<RegistryInner>, id: &InstanceId) {
    let Some(inner) = registry.upgrade() else {
        return;
    };
    let ctx = &inner.ctx;
    let Some(slot) = inner.slots.read().get(id).cloned() else {
        return;
    };
    let mut guard = slot.lock();

    if guard.instance.state != InstanceState::Provisioning {
        debug!(instance_id = %id, state = %guard.instance.state, "Provisioning timer superseded");
        return;
    }
    guard.timer = None;
    let now = ctx.clock.now();

    if ctx.seeded.chance(
        id.as_str(),
        Draw::ProvisionFailure,
        ctx.config.provisioning_failure_probability,
    ) {
        let code = ctx.seeded.error_code(id.as_str(), Draw::FailureCode);
        guard.release_reservation(ctx);
        guard.instance.failure = Some(InstanceFailure::ProvisioningFailed { code });
        guard.transition(ctx, InstanceState::Failed, now);
        warn!(instance_id = %id, code, "Provisioning failed");
        return;
    }

    guard.instance.ip_address = Some(synthetic_ip(ctx, id));
    guard.transition(ctx, InstanceState::Running, now);
    info!(
        instance_id = %id,
        ip = guard.instance.ip_address.as_deref().unwrap_or_default(),
        "Instance running"
    );
}

/// `terminating -> terminated`
fn on_torn_down(registry: &Weak<RegistryInner>, id: &InstanceId) {
    let Some(inner) = registry.upgrade() else {
        return;
    };
    let ctx = &inner.ctx;
    let Some(slot) = inner.slots.read().get(id).cloned() else {
        return;
    };
    let mut guard = slot.lock();

    if guard.instance.state != InstanceState::Terminating {
        debug!(instance_id = %id, state = %guard.instance.state, "Teardown timer superseded");
        return;
    }
    guard.timer = None;
    guard.release_reservation(ctx);
    guard.transition(ctx, InstanceState::Terminated, ctx.clock.now());
    info!(instance_id = %id, "Instance terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;
    use crate::config::{DelayRange, PoolSpec, SimConfig};
    use std::time::Duration;

    fn registry(config: SimConfig) -> (InstanceRegistry, Arc<SimContext>) {
        let ctx = Arc::new(SimContext::new(config, SimClock::manual()));
        (InstanceRegistry::new(Arc::clone(&ctx)), ctx)
    }

    fn small_pool() -> SimConfig {
        SimConfig::deterministic().with_pools(vec![PoolSpec::new(Region::UsEast1, GpuSku::A100, 2)])
    }

    fn states(instance: &Instance) -> Vec<InstanceState> {
        instance.transitions.iter().map(|t| t.state).collect()
    }

    #[test]
    fn test_create_runs_after_delay() {
        let (reg, ctx) = registry(small_pool());
        let call = CallContext::new("usr_001");

        let inst = reg.create(&call, InstanceRequest::new("A100", 2, "us-east-1")).unwrap();
        assert_eq!(inst.state, InstanceState::Provisioning);
        assert_eq!(inst.name, "A100-instance");
        assert_eq!(inst.job_slots, 2);

        ctx.clock.advance(Duration::from_secs(4));
        assert_eq!(reg.get(&call, &inst.id).unwrap().state, InstanceState::Provisioning);

        ctx.clock.advance(Duration::from_secs(1));
        let inst = reg.get(&call, &inst.id).unwrap();
        assert_eq!(inst.state, InstanceState::Running);
        assert!(inst.ip_address.is_some());
        assert_eq!(inst.entered_at(InstanceState::Running), Some(SimTime::from_secs(5)));
    }

    #[test]
    fn test_validation_leaves_no_record() {
        let (reg, _ctx) = registry(small_pool());
        let call = CallContext::new("usr_001");

        assert!(matches!(
            reg.create(&call, InstanceRequest::new("B200", 1, "us-east-1")),
            Err(SimError::InvalidSku(_))
        ));
        assert!(matches!(
            reg.create(&call, InstanceRequest::new("A100", 0, "us-east-1")),
            Err(SimError::Validation(_))
        ));
        assert!(matches!(
            reg.create(&call, InstanceRequest::new("A100", 1, "eu-west-1")),
            Err(SimError::Validation(_))
        ));
        assert!(matches!(
            reg.create(&call, InstanceRequest::new("A100", 9, "us-east-1")),
            Err(SimError::Validation(_))
        ));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_capacity_failure_recorded() {
        let (reg, _ctx) = registry(small_pool());
        let call = CallContext::new("usr_001");

        reg.create(&call, InstanceRequest::new("A100", 2, "us-east-1")).unwrap();
        let err = reg
            .create(&call, InstanceRequest::new("A100", 1, "us-east-1"))
            .unwrap_err();
        assert!(matches!(err, SimError::CapacityExceeded { .. }));

        let failed = reg.list(&call, &InstanceFilter::default().with_state(InstanceState::Failed));
        assert_eq!(failed.len(), 1);
        assert_eq!(states(&failed[0]), vec![InstanceState::Requested, InstanceState::Failed]);
        assert_eq!(failed[0].failure, Some(InstanceFailure::CapacityExceeded));
    }

    #[test]
    fn test_delete_during_provisioning_wins() {
        let (reg, ctx) = registry(small_pool());
        let call = CallContext::new("usr_001");
        let inst = reg.create(&call, InstanceRequest::new("A100", 2, "us-east-1")).unwrap();

        ctx.clock.advance(Duration::from_secs(1));
        reg.delete(&call, &inst.id).unwrap();

        ctx.clock.advance(Duration::from_secs(30));
        let inst = reg.get(&call, &inst.id).unwrap();
        assert_eq!(
            states(&inst),
            vec![
                InstanceState::Requested,
                InstanceState::Provisioning,
                InstanceState::Terminating,
                InstanceState::Terminated
            ]
        );
        assert_eq!(ctx.capacity.active_reservations(), 0);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (reg, ctx) = registry(small_pool());
        let call = CallContext::new("usr_001");
        let inst = reg.create(&call, InstanceRequest::new("A100", 1, "us-east-1")).unwrap();
        ctx.clock.advance(Duration::from_secs(5));

        reg.delete(&call, &inst.id).unwrap();
        reg.delete(&call, &inst.id).unwrap();
        ctx.clock.advance(Duration::from_secs(2));
        let after = reg.delete(&call, &inst.id).unwrap();
        assert_eq!(after.state, InstanceState::Terminated);

        let terminating = after
            .transitions
            .iter()
            .filter(|t| t.state == InstanceState::Terminating)
            .count();
        assert_eq!(terminating, 1);
    }

    #[test]
    fn test_provisioning_failure_releases_capacity() {
        let (reg, ctx) = registry(small_pool().with_provisioning_failure(1.0));
        let call = CallContext::new("usr_001");
        let inst = reg.create(&call, InstanceRequest::new("A100", 2, "us-east-1")).unwrap();

        ctx.clock.advance(Duration::from_secs(5));
        let inst = reg.get(&call, &inst.id).unwrap();
        assert_eq!(inst.state, InstanceState::Failed);
        assert!(matches!(inst.failure, Some(InstanceFailure::ProvisioningFailed { .. })));
        assert_eq!(ctx.capacity.active_reservations(), 0);

        // Capacity is back
        reg.create(&call, InstanceRequest::new("A100", 2, "us-east-1")).unwrap();
    }

    #[test]
    fn test_other_tenant_sees_not_found() {
        let (reg, _ctx) = registry(small_pool());
        let owner = CallContext::new("usr_001");
        let other = CallContext::new("usr_002");
        let inst = reg.create(&owner, InstanceRequest::new("A100", 1, "us-east-1")).unwrap();

        assert!(matches!(reg.get(&other, &inst.id), Err(SimError::InstanceNotFound(_))));
        assert!(matches!(reg.delete(&other, &inst.id), Err(SimError::InstanceNotFound(_))));
        assert!(reg.list(&other, &InstanceFilter::default()).is_empty());
    }

    #[test]
    fn test_delay_range_respected() {
        let config = small_pool().with_provisioning_delay(DelayRange::new(2.0, 8.0));
        let (reg, ctx) = registry(config);
        let call = CallContext::new("usr_001");
        let inst = reg.create(&call, InstanceRequest::new("A100", 1, "us-east-1")).unwrap();

        ctx.clock.advance(Duration::from_millis(1999));
        assert_eq!(reg.get(&call, &inst.id).unwrap().state, InstanceState::Provisioning);
        ctx.clock.advance(Duration::from_secs(7));
        assert_eq!(reg.get(&call, &inst.id).unwrap().state, InstanceState::Running);
    }
}
