//! Per-instance FIFO job scheduling
//!
//! Each running instance owns a [`JobBook`]: the jobs submitted to it, a FIFO
//! queue and the slots in use. The queue head is admitted only when its slots
//! fit; a large job at the head blocks smaller ones behind it, so start order
//! always equals submission order.
//!
//! Run outcomes are decided when a job starts, from the seeded source keyed on
//! the job id, and applied when its completion timer fires.

use crate::clock::TimerId;
use crate::context::SimContext;
use crate::error::{Result, SimError};
use crate::registry::{InstanceRegistry, InstanceSlot, SlotRef};
use crate::seeded::Draw;
use crate::types::{
    CallContext, InstanceId, InstanceState, Job, JobFailure, JobFilter, JobId, JobOutputs,
    JobResult, JobScope, JobSpec, JobState, SimTime,
};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A started job waiting for its completion timer
#[derive(Debug)]
struct RunningJob {
    timer: TimerId,
    outcome: JobResult,
}

/// Jobs of one instance, guarded by the instance's lock
#[derive(Debug, Default)]
pub(crate) struct JobBook {
    jobs: Vec<Job>,
    positions: HashMap<JobId, usize>,
    queue: VecDeque<JobId>,
    running: HashMap<JobId, RunningJob>,
    used_slots: u32,
}

impl JobBook {
    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.positions.get(id).map(|&pos| &self.jobs[pos])
    }

    fn get_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.positions.get(id).map(|&pos| &mut self.jobs[pos])
    }

    /// All jobs in submission order
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn push(&mut self, job: Job) {
        self.positions.insert(job.id.clone(), self.jobs.len());
        self.queue.push_back(job.id.clone());
        self.jobs.push(job);
    }

    /// Move a queued or running job to its terminal state. Frees its slots,
    /// cancels its timer and returns its quota. No-op on terminal jobs.
    fn finish(&mut self, ctx: &SimContext, id: &JobId, result: JobResult, now: SimTime) -> bool {
        let Some((from, slots)) = self.get(id).map(|j| (j.state, j.slots)) else {
            return false;
        };
        if from.is_terminal() {
            return false;
        }

        match from {
            JobState::Queued => self.queue.retain(|queued| queued != id),
            JobState::Running => self.used_slots = self.used_slots.saturating_sub(slots),
            _ => {}
        }
        if let Some(run) = self.running.remove(id) {
            ctx.clock.cancel(run.timer);
        }

        let Some(job) = self.get_mut(id) else {
            return false;
        };
        job.state = match result {
            JobResult::Succeeded { .. } => JobState::Succeeded,
            JobResult::Failed { .. } => JobState::Failed,
        };
        job.ended_at = Some(now);
        job.result = Some(result);

        ctx.capacity.release_job(&job.tenant_id);
        ctx.events
            .job_transition(now, &job.id, &job.instance_id, &job.tenant_id, Some(from), job.state);
        true
    }

    /// Fail every non-terminal job, in submission order
    pub fn fail_all(&mut self, ctx: &SimContext, failure: JobFailure, now: SimTime) -> usize {
        let open: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|j| !j.state.is_terminal())
            .map(|j| j.id.clone())
            .collect();

        let mut failed = 0;
        for id in &open {
            let result = JobResult::Failed {
                failure: failure.clone(),
            };
            if self.finish(ctx, id, result, now) {
                failed += 1;
            }
        }
        failed
    }
}

struct SchedulerInner {
    ctx: Arc<SimContext>,
    registry: InstanceRegistry,
    /// Which instance owns each job
    owners: RwLock<HashMap<JobId, InstanceId>>,
}

/// Accepts jobs for running instances and runs them in FIFO order
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    pub(crate) fn new(ctx: Arc<SimContext>, registry: InstanceRegistry) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                ctx,
                registry,
                owners: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Queue a job on a running instance and start it if its slots are free
    pub fn submit(&self, call: &CallContext, instance_id: &InstanceId, spec: JobSpec) -> Result<Job> {
        let ctx = &self.inner.ctx;
        let slot = self.inner.registry.owned_slot(call, instance_id)?;
        let mut guard = slot.lock();

        let state = guard.instance.state;
        if state != InstanceState::Running {
            return Err(SimError::InstanceNotRunning {
                id: instance_id.clone(),
                state,
            });
        }
        validate_spec(&spec)?;

        let instance_slots = guard.instance.job_slots;
        if spec.slots > instance_slots {
            return Err(SimError::CapacityExceeded {
                resource: format!("job slots on {}", instance_id),
                requested: spec.slots,
                available: instance_slots,
            });
        }
        if guard.jobs.queue_len() >= ctx.config.max_queue_depth {
            return Err(SimError::CapacityExceeded {
                resource: format!("job queue on {}", instance_id),
                requested: 1,
                available: 0,
            });
        }

        let now = ctx.clock.now();
        ctx.capacity.acquire_job(&call.tenant_id, now)?;

        let job = Job {
            id: ctx.next_job_id(),
            instance_id: instance_id.clone(),
            tenant_id: call.tenant_id.clone(),
            job_type: spec.job_type,
            script_path: spec.script_path,
            parameters: spec.parameters,
            slots: spec.slots,
            duration: spec.duration,
            state: JobState::Queued,
            submitted_at: now,
            started_at: None,
            ended_at: None,
            result: None,
        };
        let job_id = job.id.clone();

        self.inner
            .owners
            .write()
            .insert(job_id.clone(), instance_id.clone());
        guard.instance.job_ids.push(job_id.clone());
        ctx.events
            .job_transition(now, &job_id, instance_id, &call.tenant_id, None, JobState::Queued);
        info!(
            job_id = %job_id, instance_id = %instance_id,
            job_type = ?job.job_type, slots = job.slots,
            "Job queued"
        );
        guard.jobs.push(job);

        admit_ready(&self.inner, &mut guard, now);

        guard
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(SimError::JobNotFound(job_id))
    }

    /// Fetch one of the caller's jobs
    pub fn get(&self, call: &CallContext, id: &JobId) -> Result<Job> {
        let slot = self.owner_slot(id)?;
        let guard = slot.lock();
        guard
            .jobs
            .get(id)
            .filter(|job| job.tenant_id == call.tenant_id)
            .cloned()
            .ok_or_else(|| SimError::JobNotFound(id.clone()))
    }

    /// The caller's jobs in `scope` matching `filter`
    pub fn list(&self, call: &CallContext, scope: &JobScope, filter: &JobFilter) -> Result<Vec<Job>> {
        match scope {
            JobScope::Instance(instance_id) => {
                let slot = self.inner.registry.owned_slot(call, instance_id)?;
                let guard = slot.lock();
                Ok(guard
                    .jobs
                    .jobs()
                    .iter()
                    .filter(|job| filter.matches(job))
                    .cloned()
                    .collect())
            }
            JobScope::Tenant => {
                let mut out = Vec::new();
                for slot in self.inner.registry.all_slots() {
                    let guard = slot.lock();
                    if guard.instance.tenant_id != call.tenant_id {
                        continue;
                    }
                    out.extend(guard.jobs.jobs().iter().filter(|job| filter.matches(job)).cloned());
                }
                out.sort_by(|a, b| {
                    a.submitted_at
                        .cmp(&b.submitted_at)
                        .then_with(|| a.instance_id.cmp(&b.instance_id))
                });
                Ok(out)
            }
        }
    }

    /// Cancel a queued job. Running and finished jobs cannot be cancelled.
    pub fn cancel(&self, call: &CallContext, id: &JobId) -> Result<Job> {
        let ctx = &self.inner.ctx;
        let slot = self.owner_slot(id)?;
        let mut guard = slot.lock();

        let state = match guard.jobs.get(id) {
            Some(job) if job.tenant_id == call.tenant_id => job.state,
            _ => return Err(SimError::JobNotFound(id.clone())),
        };
        if state != JobState::Queued {
            return Err(SimError::NotCancellable {
                id: id.clone(),
                state,
            });
        }

        let now = ctx.clock.now();
        guard.jobs.finish(
            ctx,
            id,
            JobResult::Failed {
                failure: JobFailure::Cancelled,
            },
            now,
        );
        info!(job_id = %id, instance_id = %guard.instance.id, "Job cancelled");

        // The cancelled job may have been blocking the head of the queue
        admit_ready(&self.inner, &mut guard, now);

        guard
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| SimError::JobNotFound(id.clone()))
    }

    /// Number of jobs ever submitted
    pub fn len(&self) -> usize {
        self.inner.owners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every job of every tenant
    pub fn all_jobs(&self) -> Vec<Job> {
        let mut out: Vec<Job> = self
            .inner
            .registry
            .all_slots()
            .into_iter()
            .flat_map(|slot| slot.lock().jobs.jobs().to_vec())
            .collect();
        out.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        out
    }

    fn owner_slot(&self, id: &JobId) -> Result<SlotRef> {
        let owner = self
            .inner
            .owners
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SimError::JobNotFound(id.clone()))?;
        self.inner
            .registry
            .slot(&owner)
            .ok_or_else(|| SimError::JobNotFound(id.clone()))
    }
}

fn validate_spec(spec: &JobSpec) -> Result<()> {
    if spec.script_path.trim().is_empty() {
        return Err(SimError::validation("script_path must not be empty"));
    }
    if spec.slots == 0 {
        return Err(SimError::validation("job must require at least one slot"));
    }
    if spec.duration.is_zero() {
        return Err(SimError::validation("job duration must be positive"));
    }
    Ok(())
}

/// Start queued jobs from the head while their slots fit
fn admit_ready(inner: &Arc<SchedulerInner>, slot: &mut InstanceSlot, now: SimTime) {
    if slot.instance.state != InstanceState::Running {
        return;
    }
    let capacity = slot.instance.job_slots;

    while let Some(head) = slot.jobs.queue.front().cloned() {
        let Some(need) = slot.jobs.get(&head).map(|j| j.slots) else {
            slot.jobs.queue.pop_front();
            continue;
        };
        if slot.jobs.used_slots + need > capacity {
            debug!(
                job_id = %head, need,
                used = slot.jobs.used_slots, capacity,
                "Queue head waiting for slots"
            );
            break;
        }
        slot.jobs.queue.pop_front();
        start_job(inner, slot, &head, now);
    }
}

fn start_job(inner: &Arc<SchedulerInner>, slot: &mut InstanceSlot, id: &JobId, now: SimTime) {
    let ctx = &inner.ctx;
    let Some(job) = slot.jobs.get_mut(id) else {
        return;
    };

    let (run_for, outcome) = plan_run(ctx, job);
    job.state = JobState::Running;
    job.started_at = Some(now);
    let (slots, instance_id, tenant_id) = (job.slots, job.instance_id.clone(), job.tenant_id.clone());

    slot.jobs.used_slots += slots;
    ctx.events.job_transition(
        now,
        id,
        &instance_id,
        &tenant_id,
        Some(JobState::Queued),
        JobState::Running,
    );

    let weak = Arc::downgrade(inner);
    let (timer_instance, timer_job) = (instance_id.clone(), id.clone());
    let timer = ctx.clock.schedule(run_for, move || {
        on_job_done(&weak, &timer_instance, &timer_job);
    });
    slot.jobs.running.insert(id.clone(), RunningJob { timer, outcome });

    info!(
        job_id = %id, instance_id = %instance_id,
        run_secs = run_for.as_secs_f64(),
        "Job started"
    );
}

/// How long the job runs and how it ends
fn plan_run(ctx: &SimContext, job: &Job) -> (Duration, JobResult) {
    let key = job.id.as_str();
    if ctx
        .seeded
        .chance(key, Draw::JobFailure, ctx.config.job_failure_probability)
    {
        let point = 0.1 + 0.8 * ctx.seeded.unit(key, Draw::JobFailurePoint);
        let code = ctx.seeded.error_code(key, Draw::FailureCode);
        return (
            job.duration.mul_f64(point),
            JobResult::Failed {
                failure: JobFailure::Simulated { code },
            },
        );
    }

    let mut rng = ctx.seeded.rng(key, Draw::JobOutputs, 0);
    let outputs = JobOutputs {
        accuracy: round2(rng.gen_range(0.85..0.98)),
        loss: round2(rng.gen_range(0.05..0.30)),
        training_time_secs: job.duration.as_secs(),
    };
    (job.duration, JobResult::Succeeded { outputs })
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Completion timer for a running job
fn on_job_done(scheduler: &Weak<SchedulerInner>, instance_id: &InstanceId, job_id: &JobId) {
    let Some(inner) = scheduler.upgrade() else {
        return;
    };
    let ctx = &inner.ctx;
    let Some(slot) = inner.registry.slot(instance_id) else {
        return;
    };
    let mut guard = slot.lock();

    // A delete may have failed the job already
    let Some(run) = guard.jobs.running.remove(job_id) else {
        debug!(job_id = %job_id, "Completion timer superseded");
        return;
    };

    let now = ctx.clock.now();
    let failed = matches!(run.outcome, JobResult::Failed { .. });
    guard.jobs.finish(ctx, job_id, run.outcome, now);
    if failed {
        warn!(job_id = %job_id, instance_id = %instance_id, "Job failed");
    } else {
        info!(job_id = %job_id, instance_id = %instance_id, "Job succeeded");
    }

    admit_ready(&inner, &mut guard, now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;
    use crate::config::{PoolSpec, SimConfig};
    use crate::types::{GpuSku, InstanceRequest, Quota, Region};

    struct Harness {
        ctx: Arc<SimContext>,
        registry: InstanceRegistry,
        scheduler: JobScheduler,
        call: CallContext,
    }

    fn harness(config: SimConfig) -> Harness {
        let ctx = Arc::new(SimContext::new(config, SimClock::manual()));
        let registry = InstanceRegistry::new(Arc::clone(&ctx));
        let scheduler = JobScheduler::new(Arc::clone(&ctx), registry.clone());
        Harness {
            ctx,
            registry,
            scheduler,
            call: CallContext::new("usr_001"),
        }
    }

    fn config() -> SimConfig {
        SimConfig::deterministic().with_pools(vec![PoolSpec::new(Region::UsEast1, GpuSku::A100, 8)])
    }

    impl Harness {
        fn running_instance(&self, request: InstanceRequest) -> InstanceId {
            let inst = self.registry.create(&self.call, request).unwrap();
            self.ctx.clock.advance(Duration::from_secs(5));
            assert_eq!(
                self.registry.get(&self.call, &inst.id).unwrap().state,
                InstanceState::Running
            );
            inst.id
        }

        fn submit(&self, instance: &InstanceId, secs: u64) -> Job {
            self.scheduler
                .submit(
                    &self.call,
                    instance,
                    JobSpec::new("train.py", Duration::from_secs(secs)),
                )
                .unwrap()
        }

        fn job(&self, id: &JobId) -> Job {
            self.scheduler.get(&self.call, id).unwrap()
        }
    }

    #[test]
    fn test_fifo_with_single_slot() {
        let h = harness(config());
        let inst = h.running_instance(InstanceRequest::new("A100", 1, "us-east-1"));

        let a = h.submit(&inst, 10);
        let b = h.submit(&inst, 10);
        let c = h.submit(&inst, 10);
        assert_eq!(a.state, JobState::Running);
        assert_eq!(b.state, JobState::Queued);
        assert_eq!(c.state, JobState::Queued);

        h.ctx.clock.advance(Duration::from_secs(10));
        assert_eq!(h.job(&a.id).state, JobState::Succeeded);
        assert_eq!(h.job(&b.id).state, JobState::Running);
        assert_eq!(h.job(&c.id).state, JobState::Queued);

        h.ctx.clock.advance(Duration::from_secs(20));
        let (a, b, c) = (h.job(&a.id), h.job(&b.id), h.job(&c.id));
        assert_eq!(c.state, JobState::Succeeded);
        assert!(a.started_at < b.started_at && b.started_at < c.started_at);
        assert_eq!(b.started_at, a.ended_at);
        assert_eq!(h.ctx.capacity.tenant(&h.call.tenant_id).unwrap().usage.active_jobs, 0);
    }

    #[test]
    fn test_large_head_blocks_queue() {
        let h = harness(config());
        let inst = h.running_instance(InstanceRequest::new("A100", 2, "us-east-1"));

        let small = h.submit(&inst, 10);
        let big = h
            .scheduler
            .submit(&h.call, &inst, JobSpec::new("big.py", Duration::from_secs(10)).with_slots(2))
            .unwrap();
        let behind = h.submit(&inst, 10);

        assert_eq!(small.state, JobState::Running);
        assert_eq!(big.state, JobState::Queued);
        // A free slot exists but the head needs two
        assert_eq!(behind.state, JobState::Queued);

        h.ctx.clock.advance(Duration::from_secs(10));
        assert_eq!(h.job(&big.id).state, JobState::Running);
        assert_eq!(h.job(&behind.id).state, JobState::Queued);
    }

    #[test]
    fn test_cancel_only_while_queued() {
        let h = harness(config());
        let inst = h.running_instance(InstanceRequest::new("A100", 1, "us-east-1"));
        let running = h.submit(&inst, 10);
        let queued = h.submit(&inst, 10);

        let err = h.scheduler.cancel(&h.call, &running.id).unwrap_err();
        assert!(matches!(
            err,
            SimError::NotCancellable {
                state: JobState::Running,
                ..
            }
        ));

        let cancelled = h.scheduler.cancel(&h.call, &queued.id).unwrap();
        assert_eq!(cancelled.state, JobState::Failed);
        assert_eq!(cancelled.failure(), Some(&JobFailure::Cancelled));

        h.ctx.clock.advance(Duration::from_secs(10));
        assert!(matches!(
            h.scheduler.cancel(&h.call, &running.id),
            Err(SimError::NotCancellable {
                state: JobState::Succeeded,
                ..
            })
        ));
        // The cancelled job never started
        assert!(h.job(&queued.id).started_at.is_none());
    }

    #[test]
    fn test_submit_rejections() {
        let h = harness(config().with_max_queue_depth(1));
        let inst = h.registry.create(&h.call, InstanceRequest::new("A100", 1, "us-east-1")).unwrap();

        let err = h
            .scheduler
            .submit(&h.call, &inst.id, JobSpec::new("train.py", Duration::from_secs(1)))
            .unwrap_err();
        assert!(matches!(
            err,
            SimError::InstanceNotRunning {
                state: InstanceState::Provisioning,
                ..
            }
        ));

        h.ctx.clock.advance(Duration::from_secs(5));
        let too_wide = JobSpec::new("train.py", Duration::from_secs(1)).with_slots(2);
        assert!(matches!(
            h.scheduler.submit(&h.call, &inst.id, too_wide),
            Err(SimError::CapacityExceeded { .. })
        ));
        assert!(matches!(
            h.scheduler
                .submit(&h.call, &inst.id, JobSpec::new("", Duration::from_secs(1))),
            Err(SimError::Validation(_))
        ));
        assert!(matches!(
            h.scheduler
                .submit(&h.call, &inst.id, JobSpec::new("train.py", Duration::ZERO)),
            Err(SimError::Validation(_))
        ));

        h.submit(&inst.id, 10);
        h.submit(&inst.id, 10);
        assert!(matches!(
            h.scheduler
                .submit(&h.call, &inst.id, JobSpec::new("train.py", Duration::from_secs(1))),
            Err(SimError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn test_job_quota() {
        let quota = Quota {
            max_instances: 4,
            max_gpus: 8,
            max_active_jobs: 1,
        };
        let h = harness(config().with_default_quota(quota));
        let inst = h.running_instance(InstanceRequest::new("A100", 1, "us-east-1"));

        let first = h.submit(&inst, 10);
        assert!(matches!(
            h.scheduler
                .submit(&h.call, &inst, JobSpec::new("train.py", Duration::from_secs(1))),
            Err(SimError::QuotaExceeded { .. })
        ));

        h.ctx.clock.advance(Duration::from_secs(10));
        assert_eq!(h.job(&first.id).state, JobState::Succeeded);
        h.submit(&inst, 10);
    }

    #[test]
    fn test_injected_failure_ends_early() {
        let h = harness(config().with_job_failure(1.0));
        let inst = h.running_instance(InstanceRequest::new("A100", 1, "us-east-1"));
        let job = h.submit(&inst, 100);

        h.ctx.clock.advance(Duration::from_secs(100));
        let job = h.job(&job.id);
        assert_eq!(job.state, JobState::Failed);
        assert!(matches!(job.failure(), Some(JobFailure::Simulated { code }) if (1000..=9999).contains(code)));

        let ran = job.ended_at.unwrap().saturating_since(job.started_at.unwrap());
        assert!(ran >= Duration::from_secs(9) && ran <= Duration::from_secs(90));
    }

    #[test]
    fn test_delete_fails_outstanding_jobs() {
        let h = harness(config());
        let inst = h.running_instance(InstanceRequest::new("A100", 1, "us-east-1"));
        let running = h.submit(&inst, 60);
        let queued = h.submit(&inst, 60);

        h.ctx.clock.advance(Duration::from_secs(5));
        h.registry.delete(&h.call, &inst).unwrap();

        for id in [&running.id, &queued.id] {
            let job = h.job(id);
            assert_eq!(job.state, JobState::Failed);
            assert_eq!(job.failure(), Some(&JobFailure::InstanceTerminated));
        }

        // The stale completion timer must not resurrect anything
        h.ctx.clock.advance(Duration::from_secs(120));
        assert_eq!(h.job(&running.id).state, JobState::Failed);
        assert_eq!(
            h.registry.get(&h.call, &inst).unwrap().state,
            InstanceState::Terminated
        );
        assert_eq!(h.ctx.capacity.tenant(&h.call.tenant_id).unwrap().usage.active_jobs, 0);
    }

    #[test]
    fn test_foreign_job_not_found() {
        let h = harness(config());
        let inst = h.running_instance(InstanceRequest::new("A100", 1, "us-east-1"));
        let job = h.submit(&inst, 10);
        let other = CallContext::new("usr_002");

        assert!(matches!(h.scheduler.get(&other, &job.id), Err(SimError::JobNotFound(_))));
        assert!(matches!(h.scheduler.cancel(&other, &job.id), Err(SimError::JobNotFound(_))));
        assert!(matches!(
            h.scheduler.list(&other, &JobScope::Instance(inst.clone()), &JobFilter::default()),
            Err(SimError::InstanceNotFound(_))
        ));
        assert!(h.scheduler.list(&other, &JobScope::Tenant, &JobFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_outputs_are_reproducible() {
        let h = harness(config());
        let inst = h.running_instance(InstanceRequest::new("A100", 1, "us-east-1"));
        let job = h.submit(&inst, 10);
        h.ctx.clock.advance(Duration::from_secs(10));

        let done = h.job(&job.id);
        let (_, planned) = plan_run(&h.ctx, &done);
        assert_eq!(done.result, Some(planned));
        assert_eq!(done.progress(h.ctx.clock.now()), 100.0);
    }
}
