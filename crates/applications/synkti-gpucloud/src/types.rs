//! Core entity types for the GPU cloud simulator
//!
//! Tenants, instances and jobs, plus the value types (SKUs, regions, states,
//! simulated timestamps) shared by every component.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Add;
use std::str::FromStr;
use std::time::Duration;

use crate::error::SimError;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Build an id from a uuid, e.g. one drawn by [`crate::seeded::Seeded::uuid`]
            pub fn from_uuid(uuid: uuid::Uuid) -> Self {
                Self(format!("{}_{}", $prefix, uuid.simple()))
            }

            /// Borrow the id as a string slice
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Opaque instance identifier (`inst_<uuid>`)
    InstanceId,
    "inst"
);
string_id!(
    /// Opaque job identifier (`job_<uuid>`)
    JobId,
    "job"
);
string_id!(
    /// Tenant identity as supplied by the auth layer
    TenantId,
    "tenant"
);

/// Authenticated call context handed over by the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub tenant_id: TenantId,
}

impl CallContext {
    /// Create a context for the given tenant
    pub fn new(tenant_id: impl Into<TenantId>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
        }
    }
}

/// Point in simulated time, in milliseconds since the clock epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimTime(u64);

impl SimTime {
    /// The clock epoch
    pub const ZERO: SimTime = SimTime(0);

    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1000.0
    }

    /// Offset since the epoch
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.0)
    }

    /// Time elapsed since `earlier` (zero if `earlier` is later)
    pub fn saturating_since(&self, earlier: SimTime) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Duration) -> SimTime {
        let ms = u64::try_from(rhs.as_millis()).unwrap_or(u64::MAX);
        SimTime(self.0.saturating_add(ms))
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t+{:.3}s", self.as_secs_f64())
    }
}

/// GPU class used as the unit of capacity accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GpuSku {
    A100,
    H100,
    V100,
    #[serde(rename = "RTX4090")]
    Rtx4090,
}

impl GpuSku {
    /// Every SKU in the catalog
    pub const ALL: [GpuSku; 4] = [GpuSku::A100, GpuSku::H100, GpuSku::V100, GpuSku::Rtx4090];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A100 => "A100",
            Self::H100 => "H100",
            Self::V100 => "V100",
            Self::Rtx4090 => "RTX4090",
        }
    }

    /// On-board memory per GPU (GB)
    pub fn memory_gb(&self) -> f64 {
        match self {
            Self::A100 => 80.0,
            Self::H100 => 80.0,
            Self::V100 => 32.0,
            Self::Rtx4090 => 24.0,
        }
    }

    /// Power draw per GPU at idle (W)
    pub fn idle_watts(&self) -> f64 {
        match self {
            Self::A100 => 55.0,
            Self::H100 => 70.0,
            Self::V100 => 40.0,
            Self::Rtx4090 => 25.0,
        }
    }

    /// Power draw per GPU at full load (W)
    pub fn peak_watts(&self) -> f64 {
        match self {
            Self::A100 => 400.0,
            Self::H100 => 700.0,
            Self::V100 => 300.0,
            Self::Rtx4090 => 450.0,
        }
    }

    /// Price per GPU-hour (USD)
    pub fn hourly_rate(&self) -> f64 {
        match self {
            Self::A100 => 3.50,
            Self::H100 => 4.50,
            Self::V100 => 2.50,
            Self::Rtx4090 => 1.10,
        }
    }
}

impl fmt::Display for GpuSku {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GpuSku {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GpuSku::ALL
            .into_iter()
            .find(|sku| sku.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SimError::InvalidSku(s.to_string()))
    }
}

/// Simulated datacenter region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Region {
    #[serde(rename = "us-east-1")]
    UsEast1,
    #[serde(rename = "eu-west-1")]
    EuWest1,
    #[serde(rename = "ap-south-1")]
    ApSouth1,
}

impl Region {
    pub const ALL: [Region; 3] = [Region::UsEast1, Region::EuWest1, Region::ApSouth1];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UsEast1 => "us-east-1",
            Self::EuWest1 => "eu-west-1",
            Self::ApSouth1 => "ap-south-1",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Region::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SimError::validation(format!("unsupported region: {}", s)))
    }
}

/// Instance lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Requested,
    Provisioning,
    Running,
    Terminating,
    Terminated,
    Failed,
}

impl InstanceState {
    /// Terminal states are never left
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// Whether the instance holds a pool reservation in this state
    pub fn holds_reservation(&self) -> bool {
        matches!(self, Self::Provisioning | Self::Running | Self::Terminating)
    }

    /// Legal edges of the lifecycle state machine
    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Requested, Provisioning)
                | (Requested, Failed)
                | (Provisioning, Running)
                | (Provisioning, Failed)
                | (Provisioning, Terminating)
                | (Running, Terminating)
                | (Terminating, Terminated)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workload category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    #[default]
    Training,
    Inference,
    FineTuning,
}

impl FromStr for JobType {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "training" => Ok(Self::Training),
            "inference" => Ok(Self::Inference),
            "fine-tuning" | "fine_tuning" => Ok(Self::FineTuning),
            other => Err(SimError::validation(format!("unknown job type: {}", other))),
        }
    }
}

/// Why an instance ended in `failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum InstanceFailure {
    /// Pool had no room at reservation time
    CapacityExceeded,
    /// Tenant quota was exhausted at reservation time
    QuotaExceeded,
    /// Injected provisioning failure
    ProvisioningFailed { code: u32 },
}

/// Why a job ended in `failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum JobFailure {
    /// Cancelled while queued
    Cancelled,
    /// Owning instance was deleted
    InstanceTerminated,
    /// Injected runtime failure
    Simulated { code: u32 },
}

/// Synthetic outputs of a successful job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutputs {
    pub accuracy: f64,
    pub loss: f64,
    pub training_time_secs: u64,
}

/// Terminal result of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobResult {
    Succeeded { outputs: JobOutputs },
    Failed { failure: JobFailure },
}

/// Resource quota for a tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// Instances holding a reservation at once
    pub max_instances: u32,
    /// GPUs held across those instances
    pub max_gpus: u32,
    /// Queued plus running jobs
    pub max_active_jobs: u32,
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            max_instances: 8,
            max_gpus: 16,
            max_active_jobs: 64,
        }
    }
}

/// Tenant consumption counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantUsage {
    pub instances: u32,
    pub gpus: u32,
    pub active_jobs: u32,
}

/// A tenant, created on its first request and never deleted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub quota: Quota,
    pub usage: TenantUsage,
    pub created_at: SimTime,
}

/// Timestamped entry into a state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition<S> {
    pub state: S,
    pub at: SimTime,
}

/// Provisioning request as received from the transport layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRequest {
    /// GPU SKU name, e.g. "A100"
    pub gpu_type: String,

    /// Number of GPUs
    pub count: u32,

    /// Region name, e.g. "us-east-1"
    pub region: String,

    /// Display name
    #[serde(default)]
    pub name: Option<String>,

    /// Concurrent job slots, overriding `count * job_slots_per_gpu`
    #[serde(default)]
    pub job_slots: Option<u32>,
}

impl InstanceRequest {
    /// Create a request for `count` GPUs of `gpu_type` in `region`
    pub fn new(gpu_type: impl Into<String>, count: u32, region: impl Into<String>) -> Self {
        Self {
            gpu_type: gpu_type.into(),
            count,
            region: region.into(),
            name: None,
            job_slots: None,
        }
    }

    /// Set display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Override the job slot limit
    pub fn with_job_slots(mut self, slots: u32) -> Self {
        self.job_slots = Some(slots);
        self
    }
}

/// A simulated GPU instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub tenant_id: TenantId,
    pub name: String,
    pub sku: GpuSku,
    pub gpu_count: u32,
    pub region: Region,
    pub state: InstanceState,

    /// Concurrent job slots
    pub job_slots: u32,

    /// USD per hour for the whole instance
    pub hourly_rate: f64,

    /// Assigned on entering `running`
    pub ip_address: Option<String>,

    pub created_at: SimTime,

    /// Every state entered, in order, starting with `requested`
    pub transitions: Vec<StateTransition<InstanceState>>,

    /// Jobs in submission order
    pub job_ids: Vec<JobId>,

    pub failure: Option<InstanceFailure>,
}

impl Instance {
    /// When the instance entered `state`, if it ever did
    pub fn entered_at(&self, state: InstanceState) -> Option<SimTime> {
        self.transitions
            .iter()
            .find(|t| t.state == state)
            .map(|t| t.at)
    }

    /// State the instance was in at time `t` (`None` before creation)
    pub fn state_at(&self, t: SimTime) -> Option<InstanceState> {
        self.transitions
            .iter()
            .take_while(|tr| tr.at <= t)
            .last()
            .map(|tr| tr.state)
    }

    /// Whether the hardware was up (running or tearing down) at `t`
    pub fn is_powered_at(&self, t: SimTime) -> bool {
        matches!(
            self.state_at(t),
            Some(InstanceState::Running | InstanceState::Terminating)
        )
    }

    /// Time spent since entering `running`, stopping at teardown
    pub fn uptime(&self, now: SimTime) -> std::time::Duration {
        match self.entered_at(InstanceState::Running) {
            Some(started) => {
                let end = self.entered_at(InstanceState::Terminated).unwrap_or(now);
                end.saturating_since(started)
            }
            None => std::time::Duration::ZERO,
        }
    }

    /// Cost accrued while powered, in USD
    pub fn accrued_cost(&self, now: SimTime) -> f64 {
        self.uptime(now).as_secs_f64() / 3600.0 * self.hourly_rate
    }
}

/// Job submission payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub job_type: JobType,

    /// Entry point to execute on the instance
    pub script_path: String,

    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,

    /// Job slots required while running
    #[serde(default = "default_job_slots")]
    pub slots: u32,

    /// Simulated run time
    pub duration: Duration,
}

fn default_job_slots() -> u32 {
    1
}

impl JobSpec {
    /// Create a single-slot job spec
    pub fn new(script_path: impl Into<String>, duration: Duration) -> Self {
        Self {
            job_type: JobType::default(),
            script_path: script_path.into(),
            parameters: BTreeMap::new(),
            slots: default_job_slots(),
            duration,
        }
    }

    /// Set job type
    pub fn with_job_type(mut self, job_type: JobType) -> Self {
        self.job_type = job_type;
        self
    }

    /// Set required slots
    pub fn with_slots(mut self, slots: u32) -> Self {
        self.slots = slots;
        self
    }

    /// Add a parameter
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// A compute job bound to one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub instance_id: InstanceId,
    pub tenant_id: TenantId,
    pub job_type: JobType,
    pub script_path: String,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub slots: u32,
    pub duration: Duration,
    pub state: JobState,
    pub submitted_at: SimTime,
    pub started_at: Option<SimTime>,
    pub ended_at: Option<SimTime>,
    pub result: Option<JobResult>,
}

impl Job {
    /// Completion percentage; 100 once succeeded
    pub fn progress(&self, now: SimTime) -> f64 {
        match (self.state, self.started_at) {
            (JobState::Succeeded, _) => 100.0,
            (JobState::Running, Some(started)) => {
                let total = self.duration.as_secs_f64();
                if total <= 0.0 {
                    return 0.0;
                }
                (now.saturating_since(started).as_secs_f64() / total * 100.0).min(100.0)
            }
            (JobState::Failed, Some(started)) => {
                let end = self.ended_at.unwrap_or(now);
                let total = self.duration.as_secs_f64();
                if total <= 0.0 {
                    return 0.0;
                }
                (end.saturating_since(started).as_secs_f64() / total * 100.0).min(100.0)
            }
            _ => 0.0,
        }
    }

    /// Whether the job occupied its slots at time `t`
    pub fn was_running_at(&self, t: SimTime) -> bool {
        match self.started_at {
            Some(start) if start <= t => self.ended_at.is_none_or(|end| t < end),
            _ => false,
        }
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        match &self.result {
            Some(JobResult::Failed { failure }) => Some(failure),
            _ => None,
        }
    }
}

/// Instance listing filters
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub state: Option<InstanceState>,
    pub region: Option<Region>,
    pub sku: Option<GpuSku>,
}

impl InstanceFilter {
    pub fn with_state(mut self, state: InstanceState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_region(mut self, region: Region) -> Self {
        self.region = Some(region);
        self
    }

    pub fn with_sku(mut self, sku: GpuSku) -> Self {
        self.sku = Some(sku);
        self
    }

    pub fn matches(&self, instance: &Instance) -> bool {
        self.state.is_none_or(|s| s == instance.state)
            && self.region.is_none_or(|r| r == instance.region)
            && self.sku.is_none_or(|s| s == instance.sku)
    }
}

/// Result of listing instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceListing {
    pub count: usize,
    pub total_gpus: u32,
    pub instances: Vec<Instance>,
}

impl From<Vec<Instance>> for InstanceListing {
    fn from(instances: Vec<Instance>) -> Self {
        Self {
            count: instances.len(),
            total_gpus: instances.iter().map(|i| i.gpu_count).sum(),
            instances,
        }
    }
}

/// Which jobs to list
#[derive(Debug, Clone)]
pub enum JobScope {
    /// Jobs of one instance
    Instance(InstanceId),
    /// Every job of the calling tenant
    Tenant,
}

/// Job listing filters
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub job_type: Option<JobType>,
}

impl JobFilter {
    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.state.is_none_or(|s| s == job.state) && self.job_type.is_none_or(|t| t == job.job_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance_with(transitions: &[(InstanceState, u64)]) -> Instance {
        Instance {
            id: InstanceId::from("inst_test"),
            tenant_id: TenantId::from("usr_001"),
            name: "A100-instance".to_string(),
            sku: GpuSku::A100,
            gpu_count: 2,
            region: Region::UsEast1,
            state: transitions.last().map(|t| t.0).unwrap_or(InstanceState::Requested),
            job_slots: 2,
            hourly_rate: 7.0,
            ip_address: None,
            created_at: SimTime::ZERO,
            transitions: transitions
                .iter()
                .map(|&(state, secs)| StateTransition {
                    state,
                    at: SimTime::from_secs(secs),
                })
                .collect(),
            job_ids: vec![],
            failure: None,
        }
    }

    #[test]
    fn test_sku_parse_case_insensitive() {
        assert_eq!("a100".parse::<GpuSku>().unwrap(), GpuSku::A100);
        assert_eq!("RTX4090".parse::<GpuSku>().unwrap(), GpuSku::Rtx4090);
        assert!(matches!("B200".parse::<GpuSku>(), Err(SimError::InvalidSku(_))));
    }

    #[test]
    fn test_region_parse() {
        assert_eq!("eu-west-1".parse::<Region>().unwrap(), Region::EuWest1);
        assert!(matches!("mars-1".parse::<Region>(), Err(SimError::Validation(_))));
    }

    #[test]
    fn test_sku_serialization() {
        let json = serde_json::to_string(&GpuSku::Rtx4090).unwrap();
        assert_eq!(json, "\"RTX4090\"");
        let region: Region = serde_json::from_str("\"ap-south-1\"").unwrap();
        assert_eq!(region, Region::ApSouth1);
    }

    #[test]
    fn test_lifecycle_edges() {
        use InstanceState::*;
        assert!(Requested.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Running));
        assert!(Provisioning.can_transition_to(Terminating));
        assert!(Running.can_transition_to(Terminating));
        assert!(Terminating.can_transition_to(Terminated));
        assert!(!Running.can_transition_to(Failed));
        assert!(!Terminated.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Provisioning));
        assert!(!Requested.can_transition_to(Running));
    }

    #[test]
    fn test_state_at_and_uptime() {
        use InstanceState::*;
        let inst = instance_with(&[
            (Requested, 0),
            (Provisioning, 0),
            (Running, 5),
            (Terminating, 3605),
            (Terminated, 3607),
        ]);

        assert_eq!(inst.state_at(SimTime::from_secs(3)), Some(Provisioning));
        assert_eq!(inst.state_at(SimTime::from_secs(5)), Some(Running));
        assert!(inst.is_powered_at(SimTime::from_secs(3606)));
        assert!(!inst.is_powered_at(SimTime::from_secs(3607)));

        let uptime = inst.uptime(SimTime::from_secs(10_000));
        assert_eq!(uptime, Duration::from_secs(3602));
        assert!((inst.accrued_cost(SimTime::from_secs(10_000)) - 7.0 * 3602.0 / 3600.0).abs() < 1e-9);
    }

    #[test]
    fn test_job_progress() {
        let mut job = Job {
            id: JobId::from("job_1"),
            instance_id: InstanceId::from("inst_1"),
            tenant_id: TenantId::from("usr_001"),
            job_type: JobType::Training,
            script_path: "train.py".to_string(),
            parameters: BTreeMap::new(),
            slots: 1,
            duration: Duration::from_secs(100),
            state: JobState::Running,
            submitted_at: SimTime::ZERO,
            started_at: Some(SimTime::from_secs(10)),
            ended_at: None,
            result: None,
        };

        assert_eq!(job.progress(SimTime::from_secs(60)), 50.0);
        assert!(job.was_running_at(SimTime::from_secs(10)));
        assert!(!job.was_running_at(SimTime::from_secs(9)));

        job.state = JobState::Succeeded;
        job.ended_at = Some(SimTime::from_secs(110));
        assert_eq!(job.progress(SimTime::from_secs(500)), 100.0);
        assert!(!job.was_running_at(SimTime::from_secs(110)));
    }

    #[test]
    fn test_job_type_parse() {
        assert_eq!("fine-tuning".parse::<JobType>().unwrap(), JobType::FineTuning);
        assert!("rendering".parse::<JobType>().is_err());
        assert_eq!(serde_json::to_string(&JobType::FineTuning).unwrap(), "\"fine-tuning\"");
    }

    #[test]
    fn test_listing_totals() {
        let listing = InstanceListing::from(vec![
            instance_with(&[(InstanceState::Requested, 0)]),
            instance_with(&[(InstanceState::Requested, 0)]),
        ]);
        assert_eq!(listing.count, 2);
        assert_eq!(listing.total_gpus, 4);
    }
}
