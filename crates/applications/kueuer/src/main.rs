//! Kueuer - Kubernetes Job and Kueue Workload tracker
//!
//! ## Usage
//!
//! ```bash
//! # Track jobs to completion (through `kubectl proxy` by default)
//! kueuer track jobs -n skaha-workload -p kueuer-job
//!
//! # Follow workload evictions from a revision, with server timestamps
//! kueuer track evictions -n skaha-workload --revision 123456 --server-timestamps
//!
//! # Launch and delete stress jobs
//! kueuer launch run -n skaha-workload -p kueuer-job -j 16 -k skaha-local-queue --priority high
//! kueuer launch delete -n skaha-workload -p kueuer-job
//!
//! # Benchmarks
//! kueuer benchmark performance -n skaha-workload -k skaha-local-queue --priority high
//! kueuer benchmark evictions -n skaha-workload -k skaha-local-queue
//!
//! # Size the ClusterQueue from 80% of the workers' allocatable resources
//! kueuer resources -p 'worker-.*' --field allocatable --scale 0.8
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use kueuer::{
    BenchmarkRunner, ClusterConfig, CompletionTracker, DEFAULT_SESSION_DEADLINE_SECS,
    DEFAULT_TERMINAL_CONDITION, EvictionConfig, EvictionTracker, JobTemplate, KubeClient,
    KubeEventSource, LaunchSpec, PerformanceConfig, SessionConfig, SessionContext, TimestampSource,
    analyze_priority_violations, compute_statistics, delete_jobs_with_prefix, launch_jobs,
    preflight,
};
use kueuer::benchmark::{DEFAULT_EVICTION_PREFIX, DEFAULT_WAIT_SECS};
use kueuer::launch::{DEFAULT_JOB_PREFIX, DEFAULT_PARALLELISM};
use kueuer::resources::{NodeField, cluster_resources};
use kueuer_core::{EventSource, Revision};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Kueuer: track and benchmark Kubernetes Jobs and Kueue Workloads
#[derive(Parser)]
#[command(name = "kueuer")]
#[command(about = "Track and benchmark Kubernetes Jobs and Kueue Workloads", long_about = None)]
struct Cli {
    /// API server URL (default: KUEUER_API_SERVER, in-cluster, or kubectl proxy)
    #[arg(long, global = true)]
    server: Option<String>,

    /// Bearer token (default: KUEUER_TOKEN or the service account token)
    #[arg(long, global = true)]
    token: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long, global = true)]
    insecure: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track jobs or workloads
    Track {
        #[command(subcommand)]
        action: TrackAction,
    },

    /// Launch, delete and check stress jobs
    Launch {
        #[command(subcommand)]
        action: LaunchAction,
    },

    /// Run benchmarks against the cluster
    Benchmark {
        #[command(subcommand)]
        action: BenchmarkAction,
    },

    /// Sum node resources, to size a ClusterQueue for `benchmark evictions`
    Resources {
        /// Regex for node names; repeatable. Every node matches if omitted
        #[arg(short, long = "pattern", value_name = "PATTERN")]
        patterns: Vec<String>,

        /// Node status field to sum
        #[arg(short, long, value_enum, default_value_t = NodeField::Capacity)]
        field: NodeField,

        /// Fraction of the totals to report, in (0, 1]
        #[arg(short, long, default_value_t = 1.0)]
        scale: f64,
    },
}

#[derive(Subcommand)]
enum TrackAction {
    /// Track jobs with a name prefix until they reach a terminal condition
    Jobs {
        /// Namespace of the jobs
        #[arg(short, long)]
        namespace: String,

        /// Job name prefix
        #[arg(short, long)]
        prefix: String,

        /// Terminal condition type
        #[arg(long, default_value = DEFAULT_TERMINAL_CONDITION)]
        state: String,

        /// Session deadline (seconds)
        #[arg(long, default_value_t = DEFAULT_SESSION_DEADLINE_SECS)]
        deadline: u64,
    },

    /// Track workload admissions, evictions and completions
    Evictions {
        /// Namespace of the workloads
        #[arg(short, long)]
        namespace: String,

        /// Resource revision to start watching from
        #[arg(long)]
        revision: String,

        /// Session deadline (seconds)
        #[arg(long, default_value_t = DEFAULT_SESSION_DEADLINE_SECS)]
        deadline: u64,

        /// Use the API server's condition transition times
        #[arg(long)]
        server_timestamps: bool,
    },
}

#[derive(clap::Args)]
struct JobArgs {
    /// Job template (YAML or JSON); the built-in stress-ng template if omitted
    #[arg(short = 'f', long)]
    template: Option<PathBuf>,

    /// Namespace to launch jobs in
    #[arg(short, long, default_value = "default")]
    namespace: String,

    /// Duration of each job (seconds)
    #[arg(short, long, default_value_t = 60)]
    duration: u64,

    /// CPU cores per job
    #[arg(short, long, default_value_t = 1)]
    cores: u32,

    /// RAM per job (GiB)
    #[arg(short, long, default_value_t = 1)]
    ram: u32,

    /// Ephemeral storage per job (GiB)
    #[arg(short, long, default_value_t = 1)]
    storage: u32,
}

#[derive(Subcommand)]
enum LaunchAction {
    /// Launch a cohort of stress jobs
    Run {
        #[command(flatten)]
        job: JobArgs,

        /// Job name prefix
        #[arg(short, long, default_value = DEFAULT_JOB_PREFIX)]
        prefix: String,

        /// Number of jobs
        #[arg(short, long, default_value_t = 1)]
        jobs: usize,

        /// Kueue LocalQueue (jobs bypass Kueue if omitted)
        #[arg(short, long)]
        kueue: Option<String>,

        /// Kueue WorkloadPriorityClass
        #[arg(long)]
        priority: Option<String>,

        /// Concurrent submissions
        #[arg(long, default_value_t = DEFAULT_PARALLELISM)]
        parallelism: usize,
    },

    /// Delete jobs with a name prefix
    Delete {
        #[arg(short, long, default_value = "default")]
        namespace: String,

        #[arg(short, long, default_value = DEFAULT_JOB_PREFIX)]
        prefix: String,
    },

    /// Check that the namespace, LocalQueue and priority class exist
    Check {
        #[arg(short, long)]
        namespace: String,

        #[arg(short, long)]
        kueue: String,

        #[arg(long)]
        priority: String,
    },
}

#[derive(Subcommand)]
enum BenchmarkAction {
    /// Compare direct and Kueue scheduling for growing cohorts
    Performance {
        #[command(flatten)]
        job: JobArgs,

        /// Kueue LocalQueue
        #[arg(short, long)]
        kueue: String,

        /// Kueue WorkloadPriorityClass
        #[arg(long)]
        priority: String,

        /// Smallest cohort is 2^e0 jobs
        #[arg(long, default_value_t = 4)]
        e0: u32,

        /// Largest cohort is 2^e jobs
        #[arg(short, long, default_value_t = 10)]
        exponent: u32,

        /// Results file (CSV, appended)
        #[arg(short, long, default_value = "results.csv")]
        output: PathBuf,

        /// Wait between experiments (seconds)
        #[arg(short, long, default_value_t = DEFAULT_WAIT_SECS)]
        wait: u64,

        /// Tracking deadline per experiment (seconds)
        #[arg(long, default_value_t = DEFAULT_SESSION_DEADLINE_SECS)]
        deadline: u64,
    },

    /// Pack a ClusterQueue with prioritized cohorts and verify preemptions
    Evictions {
        /// Job template (YAML or JSON)
        #[arg(short = 'f', long)]
        template: Option<PathBuf>,

        #[arg(short, long)]
        namespace: String,

        /// Kueue LocalQueue
        #[arg(short, long)]
        kueue: String,

        /// Priority classes, lowest first
        #[arg(short, long, value_delimiter = ',', default_value = "low,medium,high")]
        priorities: Vec<String>,

        /// Jobs per priority level
        #[arg(short, long, default_value_t = 8)]
        jobs: usize,

        /// Total CPU cores of the ClusterQueue
        #[arg(short, long, default_value_t = 8)]
        cores: u32,

        /// Total RAM of the ClusterQueue (GiB)
        #[arg(short, long, default_value_t = 8)]
        ram: u32,

        /// Total storage of the ClusterQueue (GiB)
        #[arg(short, long, default_value_t = 8)]
        storage: u32,

        /// Duration of the lowest priority jobs (seconds)
        #[arg(short, long, default_value_t = 120)]
        duration: u64,

        /// Summary file (JSON); per-cohort statistics go to `{stem}-cohorts.csv`
        #[arg(short, long, default_value = "evictions.json")]
        output: PathBuf,

        /// Tracking deadline (seconds)
        #[arg(long, default_value_t = DEFAULT_SESSION_DEADLINE_SECS)]
        deadline: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _log_guard = init_tracing(cli.log_file.as_deref())?;

    let mut config = ClusterConfig::from_env().context("resolving the API server")?;
    if let Some(server) = cli.server {
        config.server = server;
    }
    if let Some(token) = cli.token {
        config = config.with_token(token);
    }
    let insecure = cli.insecure || config.accept_invalid_certs;
    let config = config.with_insecure(insecure);

    info!(server = %config.server, "Using API server");
    let client = KubeClient::new(config).context("building the API client")?;

    match cli.command {
        Commands::Track { action } => handle_track(client, action).await,
        Commands::Launch { action } => handle_launch(client, action).await,
        Commands::Benchmark { action } => handle_benchmark(client, action).await,
        Commands::Resources {
            patterns,
            field,
            scale,
        } => handle_resources(client, patterns, field, scale).await,
    }
}

/// Console logging, plus plain-text logging to `log_file` when given.
///
/// The returned guard flushes the file writer on drop and must outlive `main`'s work.
fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_file {
        Some(path) => {
            let (dir, file_name) = split_log_path(path)?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kueuer=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Directory and file name of `--log-file`; a bare name logs to the working directory
fn split_log_path(path: &Path) -> anyhow::Result<(&Path, &OsStr)> {
    let file_name = path
        .file_name()
        .with_context(|| format!("log file {} has no file name", path.display()))?;
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok((dir, file_name))
}

fn session_config(deadline: u64) -> SessionConfig {
    SessionConfig::default().with_deadline(Duration::from_secs(deadline))
}

fn load_template(path: Option<&Path>) -> anyhow::Result<JobTemplate> {
    match path {
        Some(path) => JobTemplate::load(path)
            .with_context(|| format!("loading job template {}", path.display())),
        None => Ok(JobTemplate::builtin()?),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn handle_track(client: KubeClient, action: TrackAction) -> anyhow::Result<()> {
    let source: Arc<dyn EventSource> = Arc::new(KubeEventSource::new(client));

    match action {
        TrackAction::Jobs {
            namespace,
            prefix,
            state,
            deadline,
        } => {
            let context = SessionContext::new(&prefix, session_config(deadline));
            let report = CompletionTracker::new(source, context)
                .track(&namespace, &prefix, &state)
                .await;
            let statistics = compute_statistics(&report.done);

            print_json(&serde_json::json!({
                "jobs": report.done,
                "pending": report.pending,
                "outcome": report.outcome,
                "statistics": statistics,
            }))?;

            if !report.outcome.is_completed() {
                anyhow::bail!("tracking ended early: {:?}", report.outcome);
            }
            Ok(())
        }

        TrackAction::Evictions {
            namespace,
            revision,
            deadline,
            server_timestamps,
        } => {
            let timestamps = if server_timestamps {
                TimestampSource::Server
            } else {
                TimestampSource::Observed
            };
            let config = session_config(deadline).with_timestamp_source(timestamps);
            let context = SessionContext::new("evictions", config);
            let report = EvictionTracker::new(source, context)
                .track(&namespace, Revision::new(revision))
                .await;
            let analysis = analyze_priority_violations(&report.workloads);

            print_json(&serde_json::json!({
                "workloads": report.workloads,
                "outcome": report.outcome,
                "malformed": report.malformed,
                "analysis": analysis,
            }))?;

            if analysis.has_violations {
                anyhow::bail!("{} preemption priority violations", analysis.counts.violation);
            }
            Ok(())
        }
    }
}

async fn handle_launch(client: KubeClient, action: LaunchAction) -> anyhow::Result<()> {
    match action {
        LaunchAction::Run {
            job,
            prefix,
            jobs,
            kueue,
            priority,
            parallelism,
        } => {
            let template = load_template(job.template.as_deref())?;
            let spec = LaunchSpec::new(job.namespace, prefix, jobs)
                .with_duration(job.duration)
                .with_resources(job.cores, job.ram, job.storage)
                .with_kueue(kueue)
                .with_priority(priority)
                .with_parallelism(parallelism);

            let summary = launch_jobs(&client, &template, &spec).await?;
            if summary.failed > 0 {
                anyhow::bail!("{} of {} jobs failed to submit", summary.failed, spec.count);
            }
            Ok(())
        }

        LaunchAction::Delete { namespace, prefix } => {
            let deleted = delete_jobs_with_prefix(&client, &namespace, &prefix).await?;
            info!(deleted, "Done");
            Ok(())
        }

        LaunchAction::Check {
            namespace,
            kueue,
            priority,
        } => {
            let report = preflight(&client, &namespace, &kueue, &priority).await?;
            if !report.passed() {
                error!(?report, "Not all checks passed");
                anyhow::bail!("preflight checks failed");
            }
            Ok(())
        }
    }
}

async fn handle_benchmark(client: KubeClient, action: BenchmarkAction) -> anyhow::Result<()> {
    let source: Arc<dyn EventSource> = Arc::new(KubeEventSource::new(client.clone()));

    match action {
        BenchmarkAction::Performance {
            job,
            kueue,
            priority,
            e0,
            exponent,
            output,
            wait,
            deadline,
        } => {
            if e0 > exponent {
                anyhow::bail!("--e0 ({}) must not exceed --exponent ({})", e0, exponent);
            }
            let template = load_template(job.template.as_deref())?;
            let runner = BenchmarkRunner::new(client, source, template, session_config(deadline));
            let config = PerformanceConfig {
                namespace: job.namespace,
                kueue,
                priority,
                min_exponent: e0,
                max_exponent: exponent,
                duration_secs: job.duration,
                cores: job.cores,
                ram_gb: job.ram,
                storage_gb: job.storage,
                output,
                wait: Duration::from_secs(wait),
            };

            runner.run_performance(&config).await?;
            info!(output = %config.output.display(), "Benchmark completed");
            Ok(())
        }

        BenchmarkAction::Evictions {
            template,
            namespace,
            kueue,
            priorities,
            jobs,
            cores,
            ram,
            storage,
            duration,
            output,
            deadline,
        } => {
            let template = load_template(template.as_deref())?;
            let runner = BenchmarkRunner::new(client, source, template, session_config(deadline));
            let config = EvictionConfig {
                namespace,
                kueue,
                priorities,
                jobs,
                total_cores: cores,
                total_ram_gb: ram,
                total_storage_gb: storage,
                duration_secs: duration,
                prefix: DEFAULT_EVICTION_PREFIX.to_string(),
                output,
            };

            let summary = runner.run_evictions(&config).await?;
            if summary.analysis.has_violations {
                anyhow::bail!(
                    "{} preemption priority violations",
                    summary.analysis.counts.violation
                );
            }
            Ok(())
        }
    }
}

async fn handle_resources(
    client: KubeClient,
    patterns: Vec<String>,
    field: NodeField,
    scale: f64,
) -> anyhow::Result<()> {
    let totals = cluster_resources(&client, &patterns, field)
        .await
        .context("summing node resources")?;
    let totals = totals.scaled(scale)?;

    info!(
        scale,
        cores = totals.whole_cores(),
        ram = totals.memory_gib(),
        storage = totals.storage_gib(),
        "Totals for benchmark evictions --cores/--ram/--storage"
    );
    print_json(&totals)
}
