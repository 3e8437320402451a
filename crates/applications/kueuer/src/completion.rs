//! Job completion tracking
//!
//! Tracks a fixed set of Jobs, selected by name prefix, until each reaches a
//! terminal condition (`Complete` by default).
//!
//! ## Algorithm
//!
//! 1. Snapshot the namespace once. Every matching job becomes pending; jobs
//!    that are already terminal (they finished before tracking began) move
//!    straight to done using their own timestamps.
//! 2. Watch from the snapshot revision. A pending job whose terminal
//!    condition turns `True` moves to done with
//!    `duration = completionTime - creationTimestamp`.
//! 3. Exhausted watches are re-issued from the last revision; an expired
//!    revision triggers a re-snapshot that merges jobs which finished in the
//!    gap. All of it is bounded by the session deadline.
//!
//! A job is in exactly one of {pending, done}; done entries never change.

use crate::session::{
    DriveEnd, SessionContext, SessionHandler, SessionOutcome, drive, snapshot_with_retry,
};
use kueuer_core::{EventSource, JobTiming, ResourceObject, Selector, Snapshot, WatchEvent};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{Instrument, debug, error, info, warn};

/// Condition type that marks a successful Job
pub const DEFAULT_TERMINAL_CONDITION: &str = "Complete";

/// Result of a completion tracking session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    /// Jobs that reached the terminal condition, by name
    pub done: BTreeMap<String, JobTiming>,

    /// Jobs still pending when the session ended
    pub pending: BTreeSet<String>,

    /// How the session ended
    pub outcome: SessionOutcome,
}

impl CompletionReport {
    fn empty(outcome: SessionOutcome) -> Self {
        Self {
            done: BTreeMap::new(),
            pending: BTreeSet::new(),
            outcome,
        }
    }
}

/// Pending/done bookkeeping for one session
#[derive(Debug)]
struct CompletionState {
    terminal: String,
    pending: BTreeSet<String>,
    done: BTreeMap<String, JobTiming>,
}

impl CompletionState {
    /// Seed the tracked set from the first snapshot
    fn seed(terminal: &str, snapshot: &Snapshot) -> Self {
        let mut state = Self {
            terminal: terminal.to_string(),
            pending: snapshot.items.iter().map(|o| o.name.clone()).collect(),
            done: BTreeMap::new(),
        };
        for item in &snapshot.items {
            state.try_complete(item);
        }
        state
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.done.is_empty()
    }

    /// Move a pending job to done if its terminal condition is satisfied
    fn try_complete(&mut self, object: &ResourceObject) -> bool {
        if !self.pending.contains(&object.name) || !object.has_condition(&self.terminal) {
            return false;
        }

        let completion = object.completion_time.or_else(|| {
            object
                .condition(&self.terminal)
                .and_then(|c| c.last_transition_time)
        });
        let timing = JobTiming::new(object.creation_timestamp, completion);

        match timing.duration_secs {
            Some(duration_secs) => info!(
                job = %object.name,
                state = %self.terminal,
                duration_secs,
                "Job reached terminal state"
            ),
            None => warn!(
                job = %object.name,
                state = %self.terminal,
                "Job reached terminal state without usable timestamps"
            ),
        }

        self.pending.remove(&object.name);
        self.done.insert(object.name.clone(), timing);
        debug!(pending = self.pending.len(), "Pending jobs left");
        true
    }

    fn into_report(self, outcome: SessionOutcome) -> CompletionReport {
        CompletionReport {
            done: self.done,
            pending: self.pending,
            outcome,
        }
    }
}

impl SessionHandler for CompletionState {
    fn apply_event(&mut self, event: WatchEvent) {
        if let Some(ref object) = event.object {
            self.try_complete(object);
        }
    }

    fn apply_snapshot(&mut self, snapshot: &Snapshot) {
        let merged = snapshot
            .items
            .iter()
            .filter(|item| self.try_complete(item))
            .count();
        if merged > 0 {
            info!(merged, "Merged jobs that finished while the watch was down");
        }
    }

    fn is_done(&self) -> bool {
        self.pending.is_empty()
    }

    fn remaining(&self) -> usize {
        self.pending.len()
    }
}

/// Tracks jobs by name prefix until they reach a terminal condition
pub struct CompletionTracker {
    source: Arc<dyn EventSource>,
    context: SessionContext,
}

impl CompletionTracker {
    /// Tracker reading from `source` within `context`'s session
    pub fn new(source: Arc<dyn EventSource>, context: SessionContext) -> Self {
        Self { source, context }
    }

    /// Session this tracker runs in
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Track every job in `namespace` whose name starts with `prefix`
    /// until it has condition `terminal` set to `True`.
    ///
    /// Never fails: deadline expiry and connectivity loss are reported in
    /// [`CompletionReport::outcome`] alongside the partial results.
    pub async fn track(&self, namespace: &str, prefix: &str, terminal: &str) -> CompletionReport {
        self.run(namespace, prefix, terminal)
            .instrument(self.context.span().clone())
            .await
    }

    async fn run(&self, namespace: &str, prefix: &str, terminal: &str) -> CompletionReport {
        let selector = Selector::jobs(namespace).with_prefix(prefix);
        let config = self.context.config();
        let deadline = self.context.deadline_from_now();

        info!(namespace, prefix, state = terminal, "Tracking jobs");

        let snapshot =
            match snapshot_with_retry(self.source.as_ref(), &selector, config, deadline).await {
                Ok(snapshot) => snapshot,
                Err(end) => {
                    error!(namespace, prefix, "Could not take the initial snapshot");
                    return CompletionReport::empty(end.into_outcome(0));
                }
            };

        let mut state = CompletionState::seed(terminal, &snapshot);
        if state.is_empty() {
            info!(namespace, prefix, "No jobs found with prefix");
            return state.into_report(SessionOutcome::Completed);
        }

        info!(
            pending = state.pending.len(),
            already_done = state.done.len(),
            revision = %snapshot.revision,
            "Starting to track jobs"
        );

        let end = if state.is_done() {
            DriveEnd::Done
        } else {
            drive(
                self.source.as_ref(),
                &selector,
                snapshot.revision,
                config,
                deadline,
                &mut state,
            )
            .await
        };

        let outcome = end.into_outcome(state.remaining());
        match outcome {
            SessionOutcome::Completed => {
                info!(prefix, state = terminal, "All jobs reached terminal state")
            }
            SessionOutcome::DeadlineExceeded { untracked } => {
                warn!(prefix, untracked, "Deadline reached, returning partial results")
            }
            SessionOutcome::Disconnected { ref reason } => {
                error!(prefix, reason = %reason, "Lost the event source, returning partial results")
            }
        }

        state.into_report(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use crate::testing::{ScriptedSource, at, job};
    use kueuer_core::{Condition, Revision, SourceError};
    use std::time::Duration;

    fn snapshot(items: Vec<ResourceObject>, revision: &str) -> Snapshot {
        Snapshot {
            items,
            revision: Revision::from(revision),
        }
    }

    fn tracker(source: Arc<ScriptedSource>, deadline: Duration) -> CompletionTracker {
        let config = SessionConfig::default()
            .with_deadline(deadline)
            .with_retry_backoff(Duration::from_millis(10));
        CompletionTracker::new(source, SessionContext::new("test", config))
    }

    #[tokio::test]
    async fn test_partial_results_at_deadline() {
        let source = Arc::new(ScriptedSource::new());
        source.push_snapshot(snapshot(
            vec![
                job("job-a", 0, None, "90"),
                job("job-b", 0, Some(2), "91"),
                job("job-c", 0, None, "92"),
            ],
            "100",
        ));
        source.push_watch(vec![WatchEvent::modified(job("job-a", 0, Some(5), "101"))]);

        let report = tracker(source.clone(), Duration::from_millis(300))
            .track("default", "job-", DEFAULT_TERMINAL_CONDITION)
            .await;

        assert_eq!(report.done.len(), 2);
        assert_eq!(report.done["job-a"].duration_secs, Some(5.0));
        assert_eq!(report.done["job-b"].duration_secs, Some(2.0));
        assert!(!report.done.contains_key("job-c"));
        assert_eq!(report.pending, BTreeSet::from(["job-c".to_string()]));
        assert_eq!(report.outcome, SessionOutcome::DeadlineExceeded { untracked: 1 });
    }

    #[tokio::test]
    async fn test_already_terminal_jobs_need_no_watch() {
        let source = Arc::new(ScriptedSource::new());
        source.push_snapshot(snapshot(vec![job("job-b", 10, Some(12), "5")], "6"));

        let report = tracker(source.clone(), Duration::from_secs(5))
            .track("default", "job-", DEFAULT_TERMINAL_CONDITION)
            .await;

        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert_eq!(report.done["job-b"].creation, Some(at(10)));
        assert_eq!(report.done["job-b"].completion, Some(at(12)));
        assert_eq!(report.done["job-b"].duration_secs, Some(2.0));
        assert!(source.watched_from().is_empty());
    }

    #[tokio::test]
    async fn test_stale_revision_merges_jobs_finished_in_gap() {
        let source = Arc::new(ScriptedSource::new());
        source.push_snapshot(snapshot(
            vec![
                job("job-a", 0, None, "1"),
                job("job-b", 0, None, "2"),
                job("job-c", 0, None, "3"),
            ],
            "100",
        ));
        source.push_watch_items(vec![
            Ok(WatchEvent::modified(job("job-a", 0, Some(5), "101"))),
            Err(SourceError::stale("101")),
        ]);
        source.push_snapshot(snapshot(
            vec![
                // a re-listed with a different completion must not overwrite the done entry
                job("job-a", 0, Some(50), "150"),
                job("job-b", 0, Some(7), "160"),
                job("job-c", 0, None, "170"),
            ],
            "200",
        ));
        source.push_watch(vec![WatchEvent::modified(job("job-c", 0, Some(9), "201"))]);

        let report = tracker(source.clone(), Duration::from_secs(5))
            .track("default", "job-", DEFAULT_TERMINAL_CONDITION)
            .await;

        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert_eq!(report.done["job-a"].duration_secs, Some(5.0));
        assert_eq!(report.done["job-b"].duration_secs, Some(7.0));
        assert_eq!(report.done["job-c"].duration_secs, Some(9.0));
        assert!(report.pending.is_empty());
        assert_eq!(source.snapshot_calls(), 2);
        assert_eq!(
            source.watched_from(),
            vec![Revision::from("100"), Revision::from("200")]
        );
    }

    #[tokio::test]
    async fn test_no_matching_jobs_returns_empty() {
        let source = Arc::new(ScriptedSource::new());
        source.push_snapshot(snapshot(vec![], "1"));

        let report = tracker(source.clone(), Duration::from_secs(5))
            .track("default", "job-", DEFAULT_TERMINAL_CONDITION)
            .await;

        assert_eq!(report, CompletionReport::empty(SessionOutcome::Completed));
        assert!(source.watched_from().is_empty());
    }

    #[tokio::test]
    async fn test_jobs_outside_tracked_set_are_ignored() {
        let source = Arc::new(ScriptedSource::new());
        source.push_snapshot(snapshot(vec![job("job-a", 0, None, "1")], "10"));
        source.push_watch(vec![
            WatchEvent::added(job("job-late", 3, Some(4), "11")),
            WatchEvent::modified(job("job-a", 0, Some(6), "12")),
        ]);

        let report = tracker(source, Duration::from_secs(5))
            .track("default", "job-", DEFAULT_TERMINAL_CONDITION)
            .await;

        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert_eq!(report.done.keys().collect::<Vec<_>>(), vec!["job-a"]);
    }

    #[tokio::test]
    async fn test_terminal_condition_without_completion_time() {
        let failed = ResourceObject::new("job-f", "uid-f")
            .with_revision("12")
            .with_creation(at(0))
            .with_condition(Condition::satisfied("Failed").with_transition_time(at(8)));

        let source = Arc::new(ScriptedSource::new());
        source.push_snapshot(snapshot(vec![job("job-f", 0, None, "1")], "10"));
        source.push_watch(vec![WatchEvent::modified(failed)]);

        let report = tracker(source, Duration::from_secs(5))
            .track("default", "job-", "Failed")
            .await;

        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert_eq!(report.done["job-f"].completion, Some(at(8)));
        assert_eq!(report.done["job-f"].duration_secs, Some(8.0));
    }

    #[tokio::test]
    async fn test_initial_snapshot_failure_is_disconnected() {
        let source = Arc::new(ScriptedSource::new());
        source.push_snapshot_error(SourceError::connectivity("refused"));
        source.push_snapshot_error(SourceError::connectivity("refused"));

        let config = SessionConfig::default()
            .with_retry_backoff(Duration::from_millis(1))
            .with_max_consecutive_failures(2);
        let report = CompletionTracker::new(source, SessionContext::new("test", config))
            .track("default", "job-", DEFAULT_TERMINAL_CONDITION)
            .await;

        assert!(report.done.is_empty());
        assert!(matches!(report.outcome, SessionOutcome::Disconnected { .. }));
    }
}
