//! Benchmark runner
//!
//! Two experiments against a live cluster:
//!
//! - **performance**: for job counts `2^e0 ..= 2^e`, run the same cohort
//!   once directly and once through Kueue, and record how long the cohort
//!   takes from first creation to last completion.
//! - **evictions**: pack a Kueue ClusterQueue with one cohort per priority
//!   level (lowest first, durations halved per level), follow every cohort
//!   and every workload eviction in parallel sessions, then check that each
//!   preemption respected priority.
//!
//! Performance results are appended to a CSV file, one row per experiment,
//! with a header row when the file is new. An eviction run writes a JSON
//! summary plus a CSV of per-cohort statistics next to it.

use crate::analyze::{PriorityReport, analyze_priority_violations};
use crate::client::KubeClient;
use crate::completion::{CompletionReport, CompletionTracker, DEFAULT_TERMINAL_CONDITION};
use crate::error::{KueuerError, Result};
use crate::eviction::{EvictionReport, EvictionTracker};
use crate::launch::{JobTemplate, LaunchSpec, LaunchSummary, delete_jobs_with_prefix, launch_jobs};
use crate::session::{SessionConfig, SessionContext, SessionOutcome};
use crate::stats::{TimingStatistics, compute_statistics};
use chrono::{DateTime, Utc};
use kueuer_core::{EventSource, Selector};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Job name prefix of eviction cohorts
pub const DEFAULT_EVICTION_PREFIX: &str = "kueue-eviction";

/// Wait between performance experiments
pub const DEFAULT_WAIT_SECS: u64 = 60;

/// Result of one launch → track → cleanup cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    /// Experiment start, `%Y%m%d-%H%M%S`
    pub timestamp: String,
    /// Job name prefix of the cohort
    pub prefix: String,
    /// Jobs requested
    pub job_count: usize,
    /// Whether the cohort went through Kueue
    pub use_kueue: bool,
    /// LocalQueue of a queued cohort
    pub kueue: Option<String>,
    /// WorkloadPriorityClass of a queued cohort
    pub priority: Option<String>,
    /// stress-ng run time per job
    pub duration_secs: u64,
    /// CPU cores per job
    pub cores: u32,
    /// Memory per job in GiB
    pub ram_gb: u32,
    /// Ephemeral storage per job in GiB
    pub storage_gb: u32,
    /// Namespace the jobs ran in
    pub namespace: String,
    /// Jobs the API server accepted
    pub submitted: usize,
    /// Wall time from launch to the end of tracking
    pub total_execution_secs: f64,
    /// Unset when no job completed
    pub statistics: Option<TimingStatistics>,
    /// Jobs still pending when tracking ended
    pub untracked: usize,
    /// How the tracking session ended
    pub outcome: SessionOutcome,
}

/// Parameters of a performance sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Namespace to run in
    pub namespace: String,
    /// LocalQueue for the queued runs
    pub kueue: String,
    /// WorkloadPriorityClass for the queued runs
    pub priority: String,
    /// Smallest cohort is `2^min_exponent` jobs
    pub min_exponent: u32,
    /// Largest cohort is `2^max_exponent` jobs
    pub max_exponent: u32,
    /// stress-ng run time per job
    pub duration_secs: u64,
    /// CPU cores per job
    pub cores: u32,
    /// Memory per job in GiB
    pub ram_gb: u32,
    /// Ephemeral storage per job in GiB
    pub storage_gb: u32,
    /// CSV file results are appended to
    pub output: PathBuf,
    /// Pause between experiments
    pub wait: Duration,
}

impl PerformanceConfig {
    /// Cohort sizes, ascending
    pub fn counts(&self) -> Vec<usize> {
        (self.min_exponent..=self.max_exponent)
            .map(|e| 1usize << e)
            .collect()
    }
}

/// Parameters of an eviction run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Namespace to run in
    pub namespace: String,
    /// LocalQueue feeding the ClusterQueue
    pub kueue: String,
    /// Priority classes, lowest first
    pub priorities: Vec<String>,
    /// Jobs per priority level
    pub jobs: usize,
    /// ClusterQueue capacity to pack
    pub total_cores: u32,
    /// ClusterQueue memory in GiB
    pub total_ram_gb: u32,
    /// ClusterQueue ephemeral storage in GiB
    pub total_storage_gb: u32,
    /// Duration of the lowest priority cohort; halved per level
    pub duration_secs: u64,
    /// Job name prefix; cohorts are `{prefix}-{priority}-job`
    pub prefix: String,
    /// JSON summary path
    pub output: PathBuf,
}

impl EvictionConfig {
    /// Cohort for the `level`-th priority
    pub fn cohort(&self, level: usize, priority: &str) -> LaunchSpec {
        let jobs = self.jobs.max(1) as u32;
        let duration = (self.duration_secs >> level.min(63)).max(1);
        LaunchSpec::new(
            &self.namespace,
            format!("{}-{}-job", self.prefix, priority),
            self.jobs,
        )
        .with_duration(duration)
        .with_resources(
            self.total_cores.div_ceil(jobs),
            self.total_ram_gb.div_ceil(jobs),
            self.total_storage_gb.div_ceil(jobs),
        )
        .with_kueue(Some(self.kueue.clone()))
        .with_priority(Some(priority.to_string()))
    }
}

/// Per-priority results of an eviction run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortResult {
    /// WorkloadPriorityClass of the cohort
    pub priority: String,
    /// Job name prefix of the cohort
    pub prefix: String,
    /// Jobs requested
    pub job_count: usize,
    /// stress-ng run time per job
    pub duration_secs: u64,
    /// CPU cores per job
    pub cores: u32,
    /// Memory per job in GiB
    pub ram_gb: u32,
    /// Ephemeral storage per job in GiB
    pub storage_gb: u32,
    /// Submission outcome
    pub launch: LaunchSummary,
    /// Unset when no job completed
    pub statistics: Option<TimingStatistics>,
    /// Jobs still pending when tracking ended
    pub untracked: usize,
    /// How the cohort's tracking session ended
    pub outcome: SessionOutcome,
}

/// Everything an eviction run produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvictionSummary {
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Run parameters
    pub config: EvictionConfig,
    /// Per-priority results, lowest priority first
    pub cohorts: Vec<CohortResult>,
    /// Workload admissions, evictions and completions
    pub evictions: EvictionReport,
    /// Priority check of every recorded preemption
    pub analysis: PriorityReport,
}

/// One flat results row, shared by performance experiments and eviction cohorts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    /// Run start, `%Y%m%d-%H%M%S`
    pub timestamp: String,
    /// Job name prefix
    pub prefix: String,
    /// Namespace the jobs ran in
    pub namespace: String,
    /// Jobs requested
    pub job_count: usize,
    /// Whether the jobs went through Kueue
    pub use_kueue: bool,
    /// LocalQueue, if queued
    pub kueue: Option<String>,
    /// WorkloadPriorityClass, if any
    pub priority: Option<String>,
    /// stress-ng run time per job
    pub duration_secs: u64,
    /// CPU cores per job
    pub cores: u32,
    /// Memory per job in GiB
    pub ram_gb: u32,
    /// Ephemeral storage per job in GiB
    pub storage_gb: u32,
    /// Jobs the API server accepted
    pub submitted: usize,
    /// Launch to cleanup; unset for eviction cohorts
    pub total_execution_secs: Option<f64>,
    /// Jobs still pending when tracking ended
    pub untracked: usize,
    /// Session outcome label
    pub outcome: String,
    /// Jobs with complete timings
    pub samples: Option<usize>,
    /// Earliest job creation
    pub first_creation: Option<DateTime<Utc>>,
    /// Latest job creation
    pub last_creation: Option<DateTime<Utc>>,
    /// Earliest job completion
    pub first_completion: Option<DateTime<Utc>>,
    /// Latest job completion
    pub last_completion: Option<DateTime<Utc>>,
    /// Mean creation-to-completion time
    pub mean_duration_secs: Option<f64>,
    /// Median creation-to-completion time
    pub median_duration_secs: Option<f64>,
    /// Sample standard deviation of job durations
    pub std_dev_duration_secs: Option<f64>,
    /// First creation to last completion
    pub total_span_secs: Option<f64>,
}

impl ResultRow {
    fn with_statistics(mut self, statistics: Option<&TimingStatistics>) -> Self {
        if let Some(stats) = statistics {
            self.samples = Some(stats.samples);
            self.first_creation = Some(stats.first_creation);
            self.last_creation = Some(stats.last_creation);
            self.first_completion = Some(stats.first_completion);
            self.last_completion = Some(stats.last_completion);
            self.mean_duration_secs = Some(stats.mean_duration_secs);
            self.median_duration_secs = Some(stats.median_duration_secs);
            self.std_dev_duration_secs = Some(stats.std_dev_duration_secs);
            self.total_span_secs = Some(stats.total_span_secs);
        }
        self
    }

    /// Row for one cohort of an eviction run
    pub fn from_cohort(cohort: &CohortResult, config: &EvictionConfig, timestamp: &str) -> Self {
        Self {
            timestamp: timestamp.to_string(),
            prefix: cohort.prefix.clone(),
            namespace: config.namespace.clone(),
            job_count: cohort.job_count,
            use_kueue: true,
            kueue: Some(config.kueue.clone()),
            priority: Some(cohort.priority.clone()),
            duration_secs: cohort.duration_secs,
            cores: cohort.cores,
            ram_gb: cohort.ram_gb,
            storage_gb: cohort.storage_gb,
            submitted: cohort.launch.submitted,
            total_execution_secs: None,
            untracked: cohort.untracked,
            outcome: cohort.outcome.label().to_string(),
            samples: None,
            first_creation: None,
            last_creation: None,
            first_completion: None,
            last_completion: None,
            mean_duration_secs: None,
            median_duration_secs: None,
            std_dev_duration_secs: None,
            total_span_secs: None,
        }
        .with_statistics(cohort.statistics.as_ref())
    }
}

impl From<&ExperimentResult> for ResultRow {
    fn from(result: &ExperimentResult) -> Self {
        Self {
            timestamp: result.timestamp.clone(),
            prefix: result.prefix.clone(),
            namespace: result.namespace.clone(),
            job_count: result.job_count,
            use_kueue: result.use_kueue,
            kueue: result.kueue.clone(),
            priority: result.priority.clone(),
            duration_secs: result.duration_secs,
            cores: result.cores,
            ram_gb: result.ram_gb,
            storage_gb: result.storage_gb,
            submitted: result.submitted,
            total_execution_secs: Some(result.total_execution_secs),
            untracked: result.untracked,
            outcome: result.outcome.label().to_string(),
            samples: None,
            first_creation: None,
            last_creation: None,
            first_completion: None,
            last_completion: None,
            mean_duration_secs: None,
            median_duration_secs: None,
            std_dev_duration_secs: None,
            total_span_secs: None,
        }
        .with_statistics(result.statistics.as_ref())
    }
}

/// Append `rows` to the CSV file at `path`. The header row is only written
/// when the file is new or empty.
pub fn append_csv_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let has_content = std::fs::metadata(path).is_ok_and(|m| m.len() > 0);
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(!has_content)
        .from_writer(file);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// `{dir}/{stem}-cohorts.csv` next to an eviction summary
pub fn cohort_csv_path(summary: &Path) -> PathBuf {
    let stem = summary
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("evictions");
    summary.with_file_name(format!("{}-cohorts.csv", stem))
}

/// Runs experiments against one cluster
pub struct BenchmarkRunner {
    client: KubeClient,
    source: Arc<dyn EventSource>,
    template: JobTemplate,
    session: SessionConfig,
}

impl BenchmarkRunner {
    /// Runner that launches from `template` and tracks through `source`
    pub fn new(
        client: KubeClient,
        source: Arc<dyn EventSource>,
        template: JobTemplate,
        session: SessionConfig,
    ) -> Self {
        Self {
            client,
            source,
            template,
            session,
        }
    }

    fn completion_tracker(&self, label: &str) -> CompletionTracker {
        CompletionTracker::new(
            self.source.clone(),
            SessionContext::new(label, self.session.clone()),
        )
    }

    /// Launch `spec`, track it to completion, compute statistics and clean up.
    ///
    /// The prefix is replaced by `{direct|kueue}-{timestamp}-{count}`.
    pub async fn run_experiment(&self, spec: LaunchSpec) -> Result<ExperimentResult> {
        let use_kueue = spec.kueue.is_some();
        let timestamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let spec = LaunchSpec {
            prefix: format!(
                "{}-{}-{}",
                if use_kueue { "kueue" } else { "direct" },
                timestamp,
                spec.count
            ),
            ..spec
        };

        info!(
            prefix = %spec.prefix,
            jobs = spec.count,
            duration_secs = spec.duration_secs,
            use_kueue,
            kueue = ?spec.kueue,
            priority = ?spec.priority,
            cores = spec.cores,
            ram_gb = spec.ram_gb,
            storage_gb = spec.storage_gb,
            "Starting experiment"
        );

        let started = Instant::now();
        let launched = launch_jobs(&self.client, &self.template, &spec).await?;
        if launched.submitted == 0 {
            return Err(KueuerError::launch(format!(
                "no job with prefix {} could be submitted",
                spec.prefix
            )));
        }

        let report = self
            .completion_tracker(&spec.prefix)
            .track(&spec.namespace, &spec.prefix, DEFAULT_TERMINAL_CONDITION)
            .await;
        let statistics = compute_statistics(&report.done);
        let total_execution_secs = started.elapsed().as_secs_f64();

        match statistics {
            Some(ref stats) => info!(
                total_execution_secs,
                total_span_secs = stats.total_span_secs,
                mean_duration_secs = stats.mean_duration_secs,
                "Experiment completed"
            ),
            None => warn!(total_execution_secs, "Experiment produced no timings"),
        }

        if let Err(e) =
            delete_jobs_with_prefix(&self.client, &spec.namespace, &spec.prefix).await
        {
            warn!(prefix = %spec.prefix, error = %e, "Cleanup failed");
        }

        Ok(ExperimentResult {
            timestamp,
            prefix: spec.prefix,
            job_count: spec.count,
            use_kueue,
            kueue: spec.kueue,
            priority: spec.priority,
            duration_secs: spec.duration_secs,
            cores: spec.cores,
            ram_gb: spec.ram_gb,
            storage_gb: spec.storage_gb,
            namespace: spec.namespace,
            submitted: launched.submitted,
            total_execution_secs,
            statistics,
            untracked: report.pending.len(),
            outcome: report.outcome,
        })
    }

    /// Run direct and queued cohorts for every count, appending each result
    /// to `config.output` as soon as it is available.
    pub async fn run_performance(
        &self,
        config: &PerformanceConfig,
    ) -> Result<Vec<ExperimentResult>> {
        let counts = config.counts();
        info!(
            counts = ?counts,
            namespace = %config.namespace,
            kueue = %config.kueue,
            priority = %config.priority,
            output = %config.output.display(),
            wait_secs = config.wait.as_secs(),
            "Starting performance benchmark"
        );

        let mut results = Vec::with_capacity(counts.len() * 2);
        let runs: Vec<(usize, bool)> = counts
            .iter()
            .flat_map(|&count| [(count, false), (count, true)])
            .collect();

        for (i, &(count, use_kueue)) in runs.iter().enumerate() {
            let mut spec = LaunchSpec::new(&config.namespace, "", count)
                .with_duration(config.duration_secs)
                .with_resources(config.cores, config.ram_gb, config.storage_gb);
            if use_kueue {
                spec = spec
                    .with_kueue(Some(config.kueue.clone()))
                    .with_priority(Some(config.priority.clone()));
            }

            let result = self.run_experiment(spec).await?;
            append_csv_rows(&config.output, &[ResultRow::from(&result)])?;
            results.push(result);

            if i + 1 < runs.len() {
                info!(wait_secs = config.wait.as_secs(), "Waiting before next experiment");
                tokio::time::sleep(config.wait).await;
            }
        }

        info!(
            experiments = results.len(),
            output = %config.output.display(),
            "Performance benchmark completed"
        );
        Ok(results)
    }

    /// Pack the ClusterQueue with one cohort per priority and follow evictions
    pub async fn run_evictions(&self, config: &EvictionConfig) -> Result<EvictionSummary> {
        let started_at = Utc::now();
        info!(
            namespace = %config.namespace,
            kueue = %config.kueue,
            priorities = ?config.priorities,
            jobs = config.jobs,
            total_cores = config.total_cores,
            total_ram_gb = config.total_ram_gb,
            total_storage_gb = config.total_storage_gb,
            "Starting eviction benchmark"
        );

        // Workloads are created by Kueue as jobs land; start the watch before any of them
        let baseline = self
            .source
            .snapshot(&Selector::workloads(&config.namespace))
            .await?;
        info!(revision = %baseline.revision, "Captured workload revision");

        let mut cohorts = Vec::with_capacity(config.priorities.len());
        for (level, priority) in config.priorities.iter().enumerate() {
            let spec = config.cohort(level, priority);
            info!(
                priority = %priority,
                jobs = spec.count,
                duration_secs = spec.duration_secs,
                cores = spec.cores,
                ram_gb = spec.ram_gb,
                storage_gb = spec.storage_gb,
                "Launching cohort"
            );
            let launched = launch_jobs(&self.client, &self.template, &spec).await?;
            cohorts.push((priority.clone(), spec, launched));
        }
        info!("All cohorts launched, tracking");

        let eviction_task = {
            let tracker = EvictionTracker::new(
                self.source.clone(),
                SessionContext::new("evictions", self.session.clone()),
            );
            let namespace = config.namespace.clone();
            let revision = baseline.revision.clone();
            tokio::spawn(async move { tracker.track(&namespace, revision).await })
        };

        let cohort_tasks: Vec<_> = cohorts
            .iter()
            .map(|(_, spec, _)| {
                let tracker = self.completion_tracker(&spec.prefix);
                let namespace = spec.namespace.clone();
                let prefix = spec.prefix.clone();
                tokio::spawn(async move {
                    tracker
                        .track(&namespace, &prefix, DEFAULT_TERMINAL_CONDITION)
                        .await
                })
            })
            .collect();

        let reports: Vec<CompletionReport> = futures::future::join_all(cohort_tasks)
            .await
            .into_iter()
            .collect::<std::result::Result<_, _>>()?;
        let evictions = eviction_task.await?;

        let cohorts: Vec<CohortResult> = cohorts
            .into_iter()
            .zip(reports)
            .map(|((priority, spec, launch), report)| {
                let statistics = compute_statistics(&report.done);
                if let Some(ref stats) = statistics {
                    info!(
                        priority = %priority,
                        mean_duration_secs = stats.mean_duration_secs,
                        total_span_secs = stats.total_span_secs,
                        "Cohort statistics"
                    );
                }
                CohortResult {
                    priority,
                    prefix: spec.prefix,
                    job_count: spec.count,
                    duration_secs: spec.duration_secs,
                    cores: spec.cores,
                    ram_gb: spec.ram_gb,
                    storage_gb: spec.storage_gb,
                    launch,
                    statistics,
                    untracked: report.pending.len(),
                    outcome: report.outcome,
                }
            })
            .collect();

        info!(
            workloads = evictions.workloads.len(),
            evictions = evictions.evictions(),
            completed = evictions.completed(),
            "Eviction tracking finished"
        );
        let analysis = analyze_priority_violations(&evictions.workloads);

        for cohort in &cohorts {
            if let Err(e) =
                delete_jobs_with_prefix(&self.client, &config.namespace, &cohort.prefix).await
            {
                warn!(prefix = %cohort.prefix, error = %e, "Cleanup failed");
            }
        }

        let summary = EvictionSummary {
            started_at,
            config: config.clone(),
            cohorts,
            evictions,
            analysis,
        };
        std::fs::write(&config.output, serde_json::to_vec_pretty(&summary)?)?;

        let timestamp = started_at.format("%Y%m%d-%H%M%S").to_string();
        let rows: Vec<ResultRow> = summary
            .cohorts
            .iter()
            .map(|cohort| ResultRow::from_cohort(cohort, config, &timestamp))
            .collect();
        let cohort_csv = cohort_csv_path(&config.output);
        append_csv_rows(&cohort_csv, &rows)?;
        info!(
            output = %config.output.display(),
            cohorts = %cohort_csv.display(),
            "Eviction summary written"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eviction_config() -> EvictionConfig {
        EvictionConfig {
            namespace: "skaha-workload".to_string(),
            kueue: "skaha-local-queue".to_string(),
            priorities: vec!["low".into(), "medium".into(), "high".into()],
            jobs: 3,
            total_cores: 8,
            total_ram_gb: 8,
            total_storage_gb: 8,
            duration_secs: 120,
            prefix: DEFAULT_EVICTION_PREFIX.to_string(),
            output: PathBuf::from("evictions.json"),
        }
    }

    #[test]
    fn test_performance_counts() {
        let config = PerformanceConfig {
            namespace: "default".to_string(),
            kueue: "q".to_string(),
            priority: "high".to_string(),
            min_exponent: 2,
            max_exponent: 5,
            duration_secs: 1,
            cores: 1,
            ram_gb: 1,
            storage_gb: 1,
            output: PathBuf::from("results.jsonl"),
            wait: Duration::from_secs(DEFAULT_WAIT_SECS),
        };
        assert_eq!(config.counts(), vec![4, 8, 16, 32]);
    }

    #[test]
    fn test_eviction_cohorts_pack_the_queue() {
        let config = eviction_config();

        let low = config.cohort(0, "low");
        assert_eq!(low.prefix, "kueue-eviction-low-job");
        assert_eq!(low.count, 3);
        assert_eq!(low.duration_secs, 120);
        // ceil(8 / 3)
        assert_eq!((low.cores, low.ram_gb, low.storage_gb), (3, 3, 3));
        assert_eq!(low.kueue.as_deref(), Some("skaha-local-queue"));
        assert_eq!(low.priority.as_deref(), Some("low"));

        assert_eq!(config.cohort(1, "medium").duration_secs, 60);
        assert_eq!(config.cohort(2, "high").duration_secs, 30);
        assert_eq!(config.cohort(10, "urgent").duration_secs, 1);
    }

    fn experiment(count: usize, use_kueue: bool) -> ExperimentResult {
        let first = chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 1, 17, 10, 30, 0).unwrap();
        ExperimentResult {
            timestamp: "20240117-103000".to_string(),
            prefix: format!("direct-20240117-103000-{}", count),
            job_count: count,
            use_kueue,
            kueue: use_kueue.then(|| "skaha-local-queue".to_string()),
            priority: None,
            duration_secs: 30,
            cores: 1,
            ram_gb: 1,
            storage_gb: 1,
            namespace: "default".to_string(),
            submitted: count,
            total_execution_secs: 42.5,
            statistics: Some(TimingStatistics {
                samples: count,
                first_creation: first,
                last_creation: first,
                first_completion: first + chrono::Duration::seconds(30),
                last_completion: first + chrono::Duration::seconds(40),
                mean_duration_secs: 35.0,
                median_duration_secs: 35.0,
                std_dev_duration_secs: 5.0,
                total_span_secs: 40.0,
            }),
            untracked: 0,
            outcome: SessionOutcome::Completed,
        }
    }

    #[test]
    fn test_append_csv_rows_writes_header_once() {
        let path =
            std::env::temp_dir().join(format!("kueuer-results-{}.csv", std::process::id()));
        let _ = std::fs::remove_file(&path);

        append_csv_rows(&path, &[ResultRow::from(&experiment(4, false))]).unwrap();
        let queued = ExperimentResult {
            statistics: None,
            ..experiment(4, true)
        };
        append_csv_rows(&path, &[ResultRow::from(&queued)]).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "timestamp");
        assert!(headers.iter().any(|h| h == "total_span_secs"));

        let rows: Vec<ResultRow> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert!(!rows[0].use_kueue);
        assert_eq!(rows[0].total_span_secs, Some(40.0));
        assert_eq!(rows[0].outcome, "completed");
        assert_eq!(rows[1].kueue.as_deref(), Some("skaha-local-queue"));
        assert_eq!(rows[1].mean_duration_secs, None);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_cohort_rows() {
        let config = eviction_config();
        let cohort = CohortResult {
            priority: "low".to_string(),
            prefix: "kueue-eviction-low-job".to_string(),
            job_count: 3,
            duration_secs: 120,
            cores: 3,
            ram_gb: 3,
            storage_gb: 3,
            launch: LaunchSummary {
                submitted: 3,
                failed: 0,
                elapsed_secs: 0.4,
            },
            statistics: None,
            untracked: 2,
            outcome: SessionOutcome::DeadlineExceeded { untracked: 2 },
        };

        let row = ResultRow::from_cohort(&cohort, &config, "20240117-103000");
        assert_eq!(row.priority.as_deref(), Some("low"));
        assert_eq!(row.kueue.as_deref(), Some("skaha-local-queue"));
        assert_eq!(row.outcome, "deadline_exceeded");
        assert_eq!(row.total_execution_secs, None);
        assert_eq!(row.samples, None);

        assert_eq!(
            cohort_csv_path(Path::new("/tmp/run/evictions.json")),
            PathBuf::from("/tmp/run/evictions-cohorts.csv")
        );
    }
}
