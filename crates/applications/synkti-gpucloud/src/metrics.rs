//! Synthetic GPU telemetry
//!
//! A sample is a pure function of an instance's lifecycle history, its jobs'
//! start and end times, and a seeded jitter keyed on `(instance id, bucket)`.
//! Nothing here holds mutable state: querying the same range twice yields the
//! same samples, and concurrent queries need no coordination.
//!
//! Utilization per job follows a ramp-up/decay envelope:
//!
//! ```text
//!  load
//!   1 ┤        ┌──────────┐
//!     │       ╱            ╲
//!     │      ╱              ╲
//!   0 ┼─────┘                └─────
//!          start  +ramp     end  +decay
//! ```

use crate::config::MetricsConfig;
use crate::seeded::{Draw, Seeded};
use crate::types::{Instance, InstanceId, Job, JobType, SimTime};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One telemetry point for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub instance_id: InstanceId,
    /// Bucket start
    pub timestamp: SimTime,
    pub utilization_pct: f64,
    pub memory_pct: f64,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub temperature_c: f64,
    pub power_draw_w: f64,
}

/// Stateless sample generator
#[derive(Debug, Clone, Copy)]
pub struct MetricsGenerator {
    config: MetricsConfig,
    seeded: Seeded,
}

impl MetricsGenerator {
    pub fn new(config: MetricsConfig, seeded: Seeded) -> Self {
        Self { config, seeded }
    }

    pub fn default_interval(&self) -> Duration {
        self.config.sample_interval()
    }

    /// Sample `instance` at `t`; `None` while the hardware is not powered
    pub fn sample(&self, instance: &Instance, jobs: &[Job], t: SimTime, interval: Duration) -> Option<MetricSample> {
        if !instance.is_powered_at(t) {
            return None;
        }

        let key = instance.id.as_str();
        let bucket = t.as_millis() / interval_millis(interval);
        let slots = f64::from(instance.job_slots.max(1));

        let load: f64 = jobs
            .iter()
            .map(|job| self.envelope(job, t) * f64::from(job.slots) / slots * intensity(job.job_type))
            .sum::<f64>()
            .min(1.0);

        let idle = self.config.idle_utilization_pct;
        let amplitude = self.config.jitter_pct;
        let utilization = if load > 0.0 {
            idle + (100.0 - idle) * load + self.seeded.jitter(key, Draw::Utilization, bucket, amplitude)
        } else {
            // Idle noise stays small and never goes negative
            idle + self
                .seeded
                .jitter(key, Draw::Utilization, bucket, amplitude / 3.0)
                .abs()
        };
        let utilization = utilization.clamp(0.0, 100.0);

        let memory_pct = (2.0 + 0.85 * utilization
            + self.seeded.jitter(key, Draw::Memory, bucket, amplitude / 2.0))
        .clamp(0.0, 100.0);
        let memory_total_mb = instance.sku.memory_gb() * 1024.0 * f64::from(instance.gpu_count);

        let temperature_c = self.config.ambient_temp_c
            + 0.45 * utilization
            + self.seeded.jitter(key, Draw::Temperature, bucket, 1.5);

        let idle_w = instance.sku.idle_watts();
        let peak_w = instance.sku.peak_watts();
        let per_gpu_w = idle_w
            + (peak_w - idle_w) * utilization / 100.0
            + self.seeded.jitter(key, Draw::Power, bucket, 0.02 * peak_w);
        let power_draw_w = per_gpu_w.max(0.0) * f64::from(instance.gpu_count);

        Some(MetricSample {
            instance_id: instance.id.clone(),
            timestamp: t,
            utilization_pct: round2(utilization),
            memory_pct: round2(memory_pct),
            memory_used_mb: round2(memory_total_mb * memory_pct / 100.0),
            memory_total_mb,
            temperature_c: round2(temperature_c),
            power_draw_w: round2(power_draw_w),
        })
    }

    /// Share of full load a job contributes at `t`, in `[0, 1]`
    fn envelope(&self, job: &Job, t: SimTime) -> f64 {
        let Some(start) = job.started_at else {
            return 0.0;
        };
        if t < start {
            return 0.0;
        }
        let ramp_at = |at: SimTime| ramp(at.saturating_since(start), self.config.ramp_up_secs);

        match job.ended_at {
            Some(end) if t >= end => {
                let peak = ramp_at(end);
                let since = t.saturating_since(end).as_secs_f64();
                if self.config.decay_secs <= 0.0 {
                    return 0.0;
                }
                peak * (1.0 - since / self.config.decay_secs).max(0.0)
            }
            _ => ramp_at(t),
        }
    }

    /// Lazy sample sequence over `[start, end)`, with `end` clamped to `now`
    pub fn series(
        &self,
        instance: Instance,
        jobs: Vec<Job>,
        start: SimTime,
        end: SimTime,
        interval: Duration,
        now: SimTime,
    ) -> MetricSeries {
        let step = interval_millis(interval);
        // A first bucket past u64::MAX leaves the series empty
        let first = start
            .as_millis()
            .div_ceil(step)
            .checked_mul(step)
            .unwrap_or(u64::MAX);
        MetricSeries {
            generator: *self,
            instance,
            jobs,
            interval,
            first,
            next: first,
            end: end.min(now).as_millis(),
        }
    }
}

fn interval_millis(interval: Duration) -> u64 {
    u64::try_from(interval.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn ramp(elapsed: Duration, ramp_secs: f64) -> f64 {
    if ramp_secs <= 0.0 {
        return 1.0;
    }
    (elapsed.as_secs_f64() / ramp_secs).min(1.0)
}

/// Steady-state load of a workload type relative to training
fn intensity(job_type: JobType) -> f64 {
    match job_type {
        JobType::Training => 0.95,
        JobType::FineTuning => 0.88,
        JobType::Inference => 0.70,
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Finite, restartable sequence of samples for one instance
///
/// Holds a snapshot of the instance and its jobs taken at query time, so
/// iterating never touches engine state.
#[derive(Debug, Clone)]
pub struct MetricSeries {
    generator: MetricsGenerator,
    instance: Instance,
    jobs: Vec<Job>,
    interval: Duration,
    first: u64,
    next: u64,
    end: u64,
}

impl MetricSeries {
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance.id
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Rewind to the first bucket
    pub fn restart(&mut self) {
        self.next = self.first;
    }
}

impl Iterator for MetricSeries {
    type Item = MetricSample;

    fn next(&mut self) -> Option<MetricSample> {
        let step = interval_millis(self.interval);
        while self.next < self.end {
            let t = SimTime::from_millis(self.next);
            self.next = self.next.saturating_add(step);
            if let Some(sample) = self.generator.sample(&self.instance, &self.jobs, t, self.interval) {
                return Some(sample);
            }
        }
        None
    }
}
