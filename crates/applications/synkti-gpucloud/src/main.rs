//! synkti-gpucloud - drive the GPU cloud simulator from the command line
//!
//! ## Usage
//!
//! ```bash
//! # Scripted multi-tenant workload on the manual clock
//! synkti-gpucloud simulate --tenants 3 --duration-secs 600
//!
//! # Same workload against the realtime clock, 60x faster than wall time,
//! # streaming events to stderr as they happen
//! synkti-gpucloud simulate --speedup 60 --follow
//!
//! # Effective configuration
//! synkti-gpucloud config --config sim.json
//!
//! # Telemetry of a single instance running a short job
//! synkti-gpucloud metrics --sku H100 --count 4
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use synkti_gpucloud::{
    CallContext, GpuCloud, GpuSku, InstanceFilter, InstanceId, InstanceRequest, InstanceState,
    JobSpec, JobType, Region, SimClock, SimConfig, SimTime,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Simulated multi-tenant GPU cloud control plane
#[derive(Parser)]
#[command(name = "synkti-gpucloud")]
#[command(about = "Simulated multi-tenant GPU cloud control plane", long_about = None)]
struct Cli {
    /// JSON configuration file (defaults apply when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured seed
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted workload and print the event log and final stats
    Simulate {
        /// Number of tenants
        #[arg(long, default_value_t = 3)]
        tenants: usize,

        /// Instances requested per tenant
        #[arg(long, default_value_t = 2)]
        instances: usize,

        /// Jobs submitted per running instance
        #[arg(long, default_value_t = 3)]
        jobs: usize,

        /// Simulated seconds to run
        #[arg(long, default_value_t = 600)]
        duration_secs: u64,

        /// Use the realtime clock at this speedup instead of the manual clock
        #[arg(long)]
        speedup: Option<f64>,

        /// Include the full event log
        #[arg(long)]
        events: bool,

        /// Stream events to stderr as they happen
        #[arg(long)]
        follow: bool,
    },

    /// Print the effective configuration
    Config,

    /// Run one job on one instance and print its metric samples
    Metrics {
        /// GPU SKU
        #[arg(long, default_value = "A100")]
        sku: String,

        /// Region
        #[arg(long, default_value = "us-east-1")]
        region: String,

        /// GPUs on the instance
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Simulated job duration (seconds)
        #[arg(long, default_value_t = 120)]
        job_secs: u64,

        /// Sample interval (seconds); defaults to the configured interval
        #[arg(long)]
        interval_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "synkti_gpucloud=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => SimConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SimConfig::default(),
    };
    if let Some(seed) = cli.seed {
        config = config.with_seed(seed);
    }

    match cli.command {
        Commands::Simulate {
            tenants,
            instances,
            jobs,
            duration_secs,
            speedup,
            events,
            follow,
        } => {
            let clock = match speedup {
                Some(speedup) => SimClock::realtime(speedup)?,
                None => SimClock::manual(),
            };
            let cloud = GpuCloud::new(config, clock)?;

            let follower = follow.then(|| {
                let mut stream = cloud.event_stream();
                tokio::spawn(async move {
                    while let Some(event) = stream.next().await {
                        match serde_json::to_string(&event) {
                            Ok(line) => eprintln!("{}", line),
                            Err(e) => warn!(error = %e, "Failed to encode event"),
                        }
                    }
                })
            });

            simulate(&cloud, tenants, instances, jobs, Duration::from_secs(duration_secs), speedup).await?;

            let mut report = json!({ "stats": cloud.stats() });
            if events {
                report["events"] = serde_json::to_value(cloud.recent_events())?;
            }
            println!("{}", serde_json::to_string_pretty(&report)?);

            // Dropping the engine closes the stream once it has drained
            drop(cloud);
            if let Some(follower) = follower {
                follower.await?;
            }
        }

        Commands::Config => {
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Metrics {
            sku,
            region,
            count,
            job_secs,
            interval_secs,
        } => {
            let cloud = GpuCloud::manual(config)?;
            let call = CallContext::new("usr_metrics");
            let inst = cloud.create_instance(&call, InstanceRequest::new(sku, count, region))?;

            // Wait out provisioning, then idle briefly before the job
            run_until_settled(&cloud, &inst.id, &call);
            cloud.clock().advance(Duration::from_secs(30));
            let job = cloud.submit_job(&call, &inst.id, JobSpec::new("train.py", Duration::from_secs(job_secs)))?;
            cloud.clock().advance(Duration::from_secs(job_secs + 90));

            let samples: Vec<_> = cloud
                .query_metrics(
                    &call,
                    &inst.id,
                    SimTime::ZERO..cloud.now(),
                    interval_secs.map(Duration::from_secs),
                )?
                .collect();
            let report = json!({
                "instance": cloud.get_instance(&call, &inst.id)?,
                "job": cloud.get_job(&call, &job.id)?,
                "samples": samples,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

/// Advance the manual clock until the instance leaves `provisioning`
fn run_until_settled(cloud: &GpuCloud, id: &InstanceId, call: &CallContext) {
    while let Some(next) = cloud.clock().next_fire_time() {
        cloud.clock().advance_to(next);
        match cloud.get_instance(call, id).map(|i| i.state) {
            Ok(InstanceState::Provisioning) => continue,
            _ => break,
        }
    }
}

async fn advance(cloud: &GpuCloud, by: Duration, speedup: Option<f64>) {
    match speedup {
        Some(speedup) => tokio::time::sleep(by.div_f64(speedup)).await,
        None => {
            cloud.clock().advance(by);
        }
    }
}

async fn simulate(
    cloud: &GpuCloud,
    tenants: usize,
    instances: usize,
    jobs: usize,
    duration: Duration,
    speedup: Option<f64>,
) -> anyhow::Result<()> {
    let calls: Vec<CallContext> = (0..tenants)
        .map(|t| CallContext::new(format!("usr_{:03}", t + 1)))
        .collect();

    for (t, call) in calls.iter().enumerate() {
        for i in 0..instances {
            let sku = GpuSku::ALL[(t + i) % GpuSku::ALL.len()];
            let region = Region::ALL[i % Region::ALL.len()];
            let request = InstanceRequest::new(sku.as_str(), 1 + (i as u32 % 2), region.as_str())
                .with_name(format!("{}-{}", call.tenant_id, i));
            if let Err(e) = cloud.create_instance(call, request) {
                warn!(tenant_id = %call.tenant_id, error = %e, "Create rejected");
            }
        }
    }

    // Longest provisioning delay
    let settle = Duration::from_secs_f64(cloud.config().provisioning_delay.max_secs.ceil() + 1.0);
    advance(cloud, settle, speedup).await;

    let job_types = [JobType::Training, JobType::Inference, JobType::FineTuning];
    for call in &calls {
        let running = cloud.list_instances(call, &InstanceFilter::default().with_state(InstanceState::Running));
        for inst in &running.instances {
            for j in 0..jobs {
                let spec = JobSpec::new(format!("jobs/{}.py", j), Duration::from_secs(30 + 15 * j as u64))
                    .with_job_type(job_types[j % job_types.len()]);
                if let Err(e) = cloud.submit_job(call, &inst.id, spec) {
                    warn!(instance_id = %inst.id, error = %e, "Submit rejected");
                }
            }
        }
    }

    let half = duration.saturating_sub(settle) / 2;
    advance(cloud, half, speedup).await;

    // Each tenant gives back its oldest instance halfway through
    for call in &calls {
        let listing = cloud.list_instances(call, &InstanceFilter::default());
        if let Some(inst) = listing.instances.first() {
            cloud.delete_instance(call, &inst.id)?;
        }
    }

    advance(cloud, half, speedup).await;
    info!(now = %cloud.now(), "Simulation finished");
    Ok(())
}
