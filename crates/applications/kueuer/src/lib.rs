//! # Kueuer
//!
//! Workload lifecycle tracking and benchmarking for Kubernetes Jobs and
//! Kueue Workloads.
//!
//! ## Architecture
//!
//! ```text
//! API server ──list/watch──► KubeEventSource ──► session driver ──┬─► CompletionTracker ──► stats
//!      ▲                                        (deadline, retry,  └─► EvictionTracker ───► analyze
//!      │                                         resync on 410)
//!      ├──── launch / delete jobs ◄── BenchmarkRunner
//!      └──── node capacity ──► resources (ClusterQueue sizing)
//! ```
//!
//! Trackers never fail: a session ends with [`SessionOutcome::Completed`],
//! or returns partial results together with
//! [`SessionOutcome::DeadlineExceeded`] or [`SessionOutcome::Disconnected`].
//!
//! See [`completion`] and [`eviction`] for the tracking algorithms.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod analyze;
pub mod benchmark;
pub mod client;
pub mod completion;
pub mod error;
pub mod eviction;
pub mod launch;
pub mod resources;
pub mod session;
pub mod source;
pub mod stats;

#[cfg(test)]
mod testing;

// ============================================================================
// Public exports - Tracking
// ============================================================================

// Sessions
pub use session::{
    DEFAULT_MAX_CONSECUTIVE_FAILURES, DEFAULT_RETRY_BACKOFF_MS, DEFAULT_SESSION_DEADLINE_SECS,
    DEFAULT_WATCH_TIMEOUT_SECS, SessionConfig, SessionContext, SessionOutcome, TimestampSource,
};

// Trackers
pub use completion::{CompletionReport, CompletionTracker, DEFAULT_TERMINAL_CONDITION};
pub use eviction::{EvictionReport, EvictionTracker, parse_preemptor};

// Analysis
pub use analyze::{PreemptionVerdict, PriorityReport, Verdict, analyze_priority_violations};
pub use stats::{TimingStatistics, compute_statistics};

// ============================================================================
// Public exports - Cluster access
// ============================================================================

// Error handling
pub use error::{KueuerError, Result};

// API client and event source
pub use client::{ClusterConfig, DEFAULT_PROXY_URL, KubeClient};
pub use source::KubeEventSource;

// Job launcher
pub use launch::{
    JobTemplate, LaunchSpec, LaunchSummary, PreflightReport, delete_jobs_with_prefix, launch_jobs,
    preflight,
};

// Node resource totals
pub use resources::{NodeField, ResourceTotals, cluster_resources, parse_quantity};

// Benchmarks
pub use benchmark::{
    BenchmarkRunner, CohortResult, EvictionConfig, EvictionSummary, ExperimentResult,
    PerformanceConfig, ResultRow, append_csv_rows,
};
