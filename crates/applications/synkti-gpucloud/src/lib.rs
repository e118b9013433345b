//! # Synkti GPU Cloud Simulator
//!
//! In-memory simulation engine for a multi-tenant GPU cloud control plane.
//!
//! ## Architecture
//!
//! ```text
//! transport layer (external)
//!        │ CallContext { tenant_id }
//!        ▼
//!     GpuCloud ──────────────► MetricsGenerator (pure, seeded)
//!     ├── InstanceRegistry ──┐
//!     ├── JobScheduler ──────┤  per-instance critical section
//!     │                      ▼
//!     ├── CapacityManager    ResourcePool + TenantLedger (one global lock)
//!     ├── EventBus           broadcast of every transition
//!     └── SimClock           manual (tests) or realtime (tokio timers)
//! ```
//!
//! Instances move `requested → provisioning → running → terminating →
//! terminated` (or `failed`); jobs move `queued → running → succeeded |
//! failed`, admitted FIFO per instance. Delays, injected failures and
//! metric jitter are pure functions of the configured seed and entity ids,
//! and the ids themselves are drawn from the seed in creation order, so the
//! same sequence of calls on the manual clock replays exactly.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use synkti_gpucloud::{CallContext, GpuCloud, InstanceRequest, JobSpec, SimConfig};
//!
//! # fn main() -> synkti_gpucloud::Result<()> {
//! let cloud = GpuCloud::manual(SimConfig::deterministic())?;
//! let call = CallContext::new("usr_001");
//!
//! let inst = cloud.create_instance(&call, InstanceRequest::new("A100", 2, "us-east-1"))?;
//! cloud.clock().advance(Duration::from_secs(5));
//!
//! let job = cloud.submit_job(&call, &inst.id, JobSpec::new("train.py", Duration::from_secs(60)))?;
//! cloud.clock().advance(Duration::from_secs(60));
//! println!("{:?}", cloud.get_job(&call, &job.id)?.state);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod capacity;
pub mod clock;
pub mod config;
mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod seeded;
pub mod types;

// ============================================================================
// Public exports
// ============================================================================

// Engine facade
pub use engine::{EngineSnapshot, EngineStats, GpuCloud};

// Error handling
pub use error::{Result, SimError};

// Configuration
pub use config::{DelayRange, MetricsConfig, PoolSpec, SimConfig};

// Time
pub use clock::{SimClock, TimerId};

// Capacity accounting
pub use capacity::{CapacityManager, PoolUsage, ReservationToken, ResourcePool, TenantLedger};

// Lifecycle components
pub use registry::InstanceRegistry;
pub use scheduler::JobScheduler;

// Telemetry and events
pub use events::{EventKind, SimEvent};
pub use metrics::{MetricSample, MetricSeries, MetricsGenerator};

// Entities
pub use types::{
    CallContext, GpuSku, Instance, InstanceFailure, InstanceFilter, InstanceId, InstanceListing,
    InstanceRequest, InstanceState, Job, JobFailure, JobFilter, JobId, JobOutputs, JobResult,
    JobScope, JobSpec, JobState, JobType, Quota, Region, SimTime, Tenant, TenantId, TenantUsage,
};
