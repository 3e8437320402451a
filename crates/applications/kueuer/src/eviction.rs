//! Workload eviction tracking
//!
//! Follows Kueue `Workload` objects from a caller-supplied revision and
//! records, per workload UID, its admission, every preemption (attributed to
//! the preempting workload) and its completion.
//!
//! Each workload moves through
//! `Unseen → Admitted → {Evicted | Requeued}* → Finished`. `Admitted`,
//! `Requeued` and `Finished` are edge-triggered: they fire when the condition
//! becomes `True`, or stays `True` with a new `lastTransitionTime`. Watch
//! events re-list every condition on every change, so level-triggered
//! handling would count the same requeue or completion many times.
//!
//! `Evicted` is level-triggered. Every `Evicted=True` observation is parsed,
//! and its preemptor is recorded unless the workload already lists it.

use crate::session::{SessionContext, SessionHandler, SessionOutcome, TimestampSource, drive};
use chrono::{DateTime, Utc};
use kueuer_core::{
    Condition, EventSource, ResourceObject, Revision, Selector, Snapshot, SourceError,
    TrackedWorkload, WatchEvent,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{Instrument, debug, error, info, warn};

/// Workload admitted by a ClusterQueue
pub const ADMITTED: &str = "Admitted";
/// Workload evicted, usually by preemption
pub const EVICTED: &str = "Evicted";
/// Workload ran to completion
pub const FINISHED: &str = "Finished";
/// Workload put back in its queue
pub const REQUEUED: &str = "Requeued";

/// Extract the preempting workload's UID from an `Evicted` condition message.
///
/// Kueue writes either
/// `Preempted to accommodate a higher priority Workload (UID: <uid>)` or,
/// in newer releases, `... (UID: <uid>, JobUID: <job-uid>)`. The workload
/// UID is the one wanted; the JobUID is ignored.
pub fn parse_preemptor(message: &str) -> Result<String, SourceError> {
    const MARKER: &str = "UID: ";

    let start = message
        .match_indices(MARKER)
        .find(|(i, _)| {
            !message[..*i]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_ascii_alphanumeric())
        })
        .map(|(i, _)| i + MARKER.len())
        .ok_or_else(|| SourceError::MalformedCondition(message.to_string()))?;

    let uid: String = message[start..]
        .chars()
        .take_while(|c| !matches!(c, ',' | ')') && !c.is_whitespace())
        .collect();

    if uid.is_empty() {
        return Err(SourceError::MalformedCondition(message.to_string()));
    }
    Ok(uid)
}

/// Result of an eviction tracking session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvictionReport {
    /// Tracked workloads by UID
    pub workloads: BTreeMap<String, TrackedWorkload>,

    /// How the session ended
    pub outcome: SessionOutcome,

    /// Eviction notices whose message carried no preemptor UID
    pub malformed: usize,
}

impl EvictionReport {
    /// Workloads that finished
    pub fn completed(&self) -> usize {
        self.workloads.values().filter(|w| w.is_finished()).count()
    }

    /// Distinct preemptions across all workloads
    pub fn evictions(&self) -> usize {
        self.workloads.values().map(|w| w.preemptors.len()).sum()
    }
}

#[derive(Debug)]
struct EvictionState {
    timestamps: TimestampSource,
    workloads: BTreeMap<String, TrackedWorkload>,
    /// Last `True` transition seen per (uid, condition type)
    edges: HashMap<(String, String), Option<DateTime<Utc>>>,
    malformed: usize,
}

impl EvictionState {
    fn new(timestamps: TimestampSource) -> Self {
        Self {
            timestamps,
            workloads: BTreeMap::new(),
            edges: HashMap::new(),
            malformed: 0,
        }
    }

    /// Whether `condition` is a new rising edge for `uid`
    fn rising_edge(&mut self, uid: &str, condition: &Condition) -> bool {
        let key = (uid.to_string(), condition.type_.clone());
        if !condition.is_satisfied() {
            self.edges.remove(&key);
            return false;
        }
        match self.edges.insert(key, condition.last_transition_time) {
            None => true,
            Some(previous) => previous != condition.last_transition_time,
        }
    }

    fn stamp(&self, condition: &Condition) -> DateTime<Utc> {
        let now = Utc::now();
        match self.timestamps {
            TimestampSource::Observed => now,
            TimestampSource::Server => condition.last_transition_time.unwrap_or(now),
        }
    }

    fn apply_object(&mut self, object: &ResourceObject) {
        // admission first, so conditions listed alongside it are not dropped
        if let Some(admitted) = object.condition(ADMITTED) {
            if self.rising_edge(&object.uid, admitted) {
                self.admit(object, admitted);
            }
        }

        for condition in &object.conditions {
            if condition.type_ == ADMITTED {
                continue;
            }
            if !self.workloads.contains_key(&object.uid) {
                debug!(
                    workload = %object.name,
                    condition = %condition.type_,
                    "Ignoring condition of a workload that was never admitted"
                );
                continue;
            }
            let edge = self.rising_edge(&object.uid, condition);
            match condition.type_.as_str() {
                // level-triggered: a standing eviction may name a new preemptor
                EVICTED if condition.is_satisfied() => self.evict(object, condition, edge),
                FINISHED if edge => self.finish(object, condition),
                REQUEUED if edge => self.requeue(object),
                _ => {}
            }
        }
    }

    fn admit(&mut self, object: &ResourceObject, condition: &Condition) {
        let at = self.stamp(condition);
        let priority = object.priority.unwrap_or_else(|| {
            warn!(workload = %object.name, "Admitted workload has no priority, assuming 0");
            0
        });

        match self.workloads.get_mut(&object.uid) {
            Some(workload) => {
                workload.name = object.name.clone();
                workload.priority = priority;
                workload.admitted_at = at;
                info!(workload = %object.name, priority, "Workload re-admitted");
            }
            None => {
                self.workloads.insert(
                    object.uid.clone(),
                    TrackedWorkload::new(&object.uid, &object.name, priority, at),
                );
                info!(workload = %object.name, priority, "Workload admitted");
            }
        }
    }

    /// Record the preemptor named by an `Evicted=True` condition. Malformed
    /// notices are only counted on their rising edge.
    fn evict(&mut self, object: &ResourceObject, condition: &Condition, edge: bool) {
        let message = condition.message.as_deref().unwrap_or_default();
        let preemptor = match parse_preemptor(message) {
            Ok(preemptor) => preemptor,
            Err(e) => {
                if edge {
                    self.malformed += 1;
                    warn!(workload = %object.name, error = %e, "Skipping eviction notice");
                }
                return;
            }
        };

        let at = self.stamp(condition);
        if let Some(workload) = self.workloads.get_mut(&object.uid) {
            if workload.record_preemption(&preemptor, at) {
                info!(workload = %object.name, preemptor = %preemptor, "Workload evicted");
            } else {
                debug!(workload = %object.name, preemptor = %preemptor, "Duplicate eviction notice");
            }
        }
    }

    fn finish(&mut self, object: &ResourceObject, condition: &Condition) {
        let at = self.stamp(condition);
        if let Some(workload) = self.workloads.get_mut(&object.uid) {
            if workload.finished_at.is_none() {
                workload.finished_at = Some(at);
                info!(workload = %object.name, "Workload finished");
            }
        }
    }

    fn requeue(&mut self, object: &ResourceObject) {
        if let Some(workload) = self.workloads.get_mut(&object.uid) {
            workload.requeues += 1;
            info!(workload = %object.name, requeues = workload.requeues, "Workload requeued");
        }
    }

    fn into_report(self, outcome: SessionOutcome) -> EvictionReport {
        EvictionReport {
            workloads: self.workloads,
            outcome,
            malformed: self.malformed,
        }
    }
}

impl SessionHandler for EvictionState {
    fn apply_event(&mut self, event: WatchEvent) {
        if let Some(ref object) = event.object {
            self.apply_object(object);
        }
    }

    fn apply_snapshot(&mut self, snapshot: &Snapshot) {
        for item in &snapshot.items {
            self.apply_object(item);
        }
    }

    fn is_done(&self) -> bool {
        !self.workloads.is_empty() && self.workloads.values().all(|w| w.is_finished())
    }

    fn remaining(&self) -> usize {
        self.workloads.values().filter(|w| !w.is_finished()).count()
    }
}

/// Follows workload admissions, evictions and completions in a namespace
pub struct EvictionTracker {
    source: Arc<dyn EventSource>,
    context: SessionContext,
}

impl EvictionTracker {
    /// Tracker reading from `source` within `context`'s session
    pub fn new(source: Arc<dyn EventSource>, context: SessionContext) -> Self {
        Self { source, context }
    }

    /// Session this tracker runs in
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Track workloads in `namespace` starting at revision `from` until every
    /// admitted workload has finished or the session deadline passes.
    pub async fn track(&self, namespace: &str, from: Revision) -> EvictionReport {
        self.run(namespace, from)
            .instrument(self.context.span().clone())
            .await
    }

    async fn run(&self, namespace: &str, from: Revision) -> EvictionReport {
        let selector = Selector::workloads(namespace);
        let config = self.context.config();
        let deadline = self.context.deadline_from_now();

        info!(namespace, revision = %from, "Tracking evictions");

        let mut state = EvictionState::new(config.timestamp_source);
        let end = drive(
            self.source.as_ref(),
            &selector,
            from,
            config,
            deadline,
            &mut state,
        )
        .await;

        let outcome = end.into_outcome(state.remaining());
        match outcome {
            SessionOutcome::Completed => info!(
                workloads = state.workloads.len(),
                "All workloads finished"
            ),
            SessionOutcome::DeadlineExceeded { untracked } => warn!(
                workloads = state.workloads.len(),
                untracked,
                "Deadline reached, returning partial results"
            ),
            SessionOutcome::Disconnected { ref reason } => {
                error!(reason = %reason, "Lost the event source, returning partial results")
            }
        }
        if state.malformed > 0 {
            warn!(malformed = state.malformed, "Some eviction notices had no preemptor");
        }

        state.into_report(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use crate::testing::{ScriptedSource, at};
    use std::time::Duration;

    const PREEMPTED: &str = "Preempted to accommodate a higher priority Workload";

    fn workload(uid: &str, priority: i32, revision: &str) -> ResourceObject {
        ResourceObject::new(format!("wl-{}", uid), uid)
            .with_revision(revision)
            .with_priority(priority)
    }

    fn admitted(secs: i64) -> Condition {
        Condition::satisfied(ADMITTED).with_transition_time(at(secs))
    }

    fn evicted_by(preemptor: &str, secs: i64) -> Condition {
        Condition::satisfied(EVICTED)
            .with_reason("Preempted")
            .with_message(format!(
                "{} (UID: {}, JobUID: job-{})",
                PREEMPTED, preemptor, preemptor
            ))
            .with_transition_time(at(secs))
    }

    fn tracker(source: Arc<ScriptedSource>, config: SessionConfig) -> EvictionTracker {
        EvictionTracker::new(source, SessionContext::new("evictions", config))
    }

    fn fast_config() -> SessionConfig {
        SessionConfig::default()
            .with_deadline(Duration::from_secs(5))
            .with_retry_backoff(Duration::from_millis(10))
    }

    #[test]
    fn test_parse_preemptor_current_format() {
        let message = format!("{} (UID: 0a1b-2c3d, JobUID: 9f8e-7d6c)", PREEMPTED);
        assert_eq!(parse_preemptor(&message).unwrap(), "0a1b-2c3d");
    }

    #[test]
    fn test_parse_preemptor_legacy_format() {
        let message = format!("{} (UID: 0a1b-2c3d)", PREEMPTED);
        assert_eq!(parse_preemptor(&message).unwrap(), "0a1b-2c3d");
    }

    #[test]
    fn test_parse_preemptor_skips_job_uid_only() {
        let message = format!("{} (JobUID: 9f8e)", PREEMPTED);
        assert!(matches!(
            parse_preemptor(&message),
            Err(SourceError::MalformedCondition(_))
        ));
    }

    #[test]
    fn test_parse_preemptor_malformed() {
        for message in ["", "Exceeded the PodsReady timeout", "Preempted (UID: )"] {
            tokio_test::assert_err!(parse_preemptor(message));
        }
    }

    #[tokio::test]
    async fn test_duplicate_eviction_notices_are_deduplicated() {
        let source = Arc::new(ScriptedSource::new());
        let victim = workload("w1", 10000, "1").with_condition(admitted(0));
        source.push_watch(vec![
            WatchEvent::added(victim.clone()),
            WatchEvent::modified(victim.clone().with_condition(evicted_by("w2", 3))),
            // same notice re-sent with a fresh transition
            WatchEvent::modified(victim.clone().with_condition(evicted_by("w2", 4))),
            WatchEvent::modified(
                victim
                    .with_condition(evicted_by("w2", 4))
                    .with_condition(Condition::satisfied(FINISHED).with_transition_time(at(9))),
            ),
        ]);

        let report = tracker(source, fast_config()).track("default", Revision::from("1")).await;

        assert_eq!(report.outcome, SessionOutcome::Completed);
        let w1 = &report.workloads["w1"];
        assert_eq!(w1.preemptors.len(), 1);
        assert_eq!(w1.preemptors[0].preemptor, "w2");
        assert_eq!(report.completed(), 1);
    }

    #[tokio::test]
    async fn test_standing_eviction_records_each_new_preemptor() {
        let source = Arc::new(ScriptedSource::new());
        let victim = workload("w1", 100, "1").with_condition(admitted(0));
        let evicted = |preemptor: &str| {
            Condition::satisfied(EVICTED)
                .with_reason("Preempted")
                .with_message(format!("{} (UID: {})", PREEMPTED, preemptor))
        };
        source.push_watch(vec![
            WatchEvent::added(victim.clone()),
            WatchEvent::modified(victim.clone().with_condition(evicted("w2"))),
            WatchEvent::modified(victim.clone().with_condition(evicted("w3"))),
            WatchEvent::modified(victim.with_condition(evicted("w3"))),
        ]);

        let config = fast_config().with_deadline(Duration::from_millis(300));
        let report = tracker(source, config).track("default", Revision::from("1")).await;

        let preemptors: Vec<_> = report.workloads["w1"]
            .preemptors
            .iter()
            .map(|p| p.preemptor.as_str())
            .collect();
        assert_eq!(preemptors, vec!["w2", "w3"]);
        assert_eq!(report.evictions(), 2);
        assert_eq!(report.malformed, 0);
    }

    #[tokio::test]
    async fn test_standing_malformed_notice_is_counted_once() {
        let source = Arc::new(ScriptedSource::new());
        let base = workload("w1", 100, "1").with_condition(admitted(0));
        let timeout = Condition::satisfied(EVICTED)
            .with_reason("PodsReadyTimeout")
            .with_message("Exceeded the PodsReady timeout default/w1");
        source.push_watch(vec![
            WatchEvent::added(base.clone()),
            WatchEvent::modified(base.clone().with_condition(timeout.clone())),
            WatchEvent::modified(base.with_condition(timeout)),
        ]);

        let config = fast_config().with_deadline(Duration::from_millis(300));
        let report = tracker(source, config).track("default", Revision::from("1")).await;

        assert_eq!(report.malformed, 1);
        assert!(report.workloads["w1"].preemptors.is_empty());
    }

    #[tokio::test]
    async fn test_requeues_are_edge_triggered() {
        let source = Arc::new(ScriptedSource::new());
        let base = workload("w1", 100, "1").with_condition(admitted(0));
        let requeued = |secs| Condition::satisfied(REQUEUED).with_transition_time(at(secs));
        let not_requeued = Condition::new(REQUEUED, "False").with_transition_time(at(6));

        source.push_watch(vec![
            WatchEvent::added(base.clone()),
            WatchEvent::modified(base.clone().with_condition(requeued(5))),
            // unchanged condition re-listed on an unrelated update
            WatchEvent::modified(base.clone().with_condition(requeued(5))),
            WatchEvent::modified(base.clone().with_condition(not_requeued)),
            WatchEvent::modified(base.clone().with_condition(requeued(7))),
            WatchEvent::modified(
                base.with_condition(requeued(7))
                    .with_condition(Condition::satisfied(FINISHED).with_transition_time(at(9))),
            ),
        ]);

        let report = tracker(source, fast_config()).track("default", Revision::from("1")).await;

        assert_eq!(report.workloads["w1"].requeues, 2);
        assert!(report.workloads["w1"].is_finished());
    }

    #[tokio::test]
    async fn test_readmission_keeps_history() {
        let source = Arc::new(ScriptedSource::new());
        let base = workload("w1", 100, "1");
        source.push_watch(vec![
            WatchEvent::added(base.clone().with_condition(admitted(0))),
            WatchEvent::modified(
                base.clone()
                    .with_condition(Condition::new(ADMITTED, "False"))
                    .with_condition(evicted_by("w9", 2)),
            ),
            WatchEvent::modified(
                base.clone()
                    .with_condition(admitted(4))
                    .with_condition(evicted_by("w9", 2)),
            ),
        ]);

        let config = fast_config()
            .with_deadline(Duration::from_millis(300))
            .with_timestamp_source(TimestampSource::Server);
        let report = tracker(source, config).track("default", Revision::from("1")).await;

        let w1 = &report.workloads["w1"];
        assert_eq!(w1.admitted_at, at(4));
        assert_eq!(w1.preemptors.len(), 1);
        assert_eq!(report.outcome, SessionOutcome::DeadlineExceeded { untracked: 1 });
    }

    #[tokio::test]
    async fn test_server_timestamps_use_transition_time() {
        let source = Arc::new(ScriptedSource::new());
        let base = workload("w1", 100, "1").with_condition(admitted(10));
        source.push_watch(vec![
            WatchEvent::added(base.clone()),
            WatchEvent::modified(base.clone().with_condition(evicted_by("w2", 12))),
            WatchEvent::modified(
                base.with_condition(Condition::satisfied(FINISHED).with_transition_time(at(20))),
            ),
        ]);

        let config = fast_config().with_timestamp_source(TimestampSource::Server);
        let report = tracker(source, config).track("default", Revision::from("1")).await;

        let w1 = &report.workloads["w1"];
        assert_eq!(w1.admitted_at, at(10));
        assert_eq!(w1.preemptors[0].observed_at, at(12));
        assert_eq!(w1.finished_at, Some(at(20)));
    }

    #[tokio::test]
    async fn test_malformed_notice_is_counted_and_skipped() {
        let source = Arc::new(ScriptedSource::new());
        let base = workload("w1", 100, "1").with_condition(admitted(0));
        let timeout = Condition::satisfied(EVICTED)
            .with_reason("PodsReadyTimeout")
            .with_message("Exceeded the PodsReady timeout default/w1")
            .with_transition_time(at(3));
        source.push_watch(vec![
            WatchEvent::added(base.clone()),
            WatchEvent::modified(base.clone().with_condition(timeout)),
            WatchEvent::modified(
                base.with_condition(Condition::satisfied(FINISHED).with_transition_time(at(5))),
            ),
        ]);

        let report = tracker(source, fast_config()).track("default", Revision::from("1")).await;

        assert_eq!(report.malformed, 1);
        assert!(report.workloads["w1"].preemptors.is_empty());
        assert_eq!(report.outcome, SessionOutcome::Completed);
    }

    #[tokio::test]
    async fn test_unadmitted_conditions_are_ignored() {
        let source = Arc::new(ScriptedSource::new());
        source.push_watch(vec![
            WatchEvent::added(
                workload("w1", 100, "2")
                    .with_condition(Condition::satisfied(FINISHED).with_transition_time(at(1))),
            ),
            WatchEvent::added(
                workload("w2", 100, "3")
                    .with_condition(admitted(0))
                    .with_condition(Condition::satisfied(FINISHED).with_transition_time(at(2))),
            ),
        ]);

        let report = tracker(source, fast_config()).track("default", Revision::from("1")).await;

        assert!(!report.workloads.contains_key("w1"));
        assert!(report.workloads["w2"].is_finished());
        assert_eq!(report.outcome, SessionOutcome::Completed);
    }

    #[tokio::test]
    async fn test_stale_revision_replays_snapshot() {
        let source = Arc::new(ScriptedSource::new());
        let w1 = workload("w1", 100, "2").with_condition(admitted(0));
        let w2 = workload("w2", 1000, "3").with_condition(admitted(1));
        let finished = Condition::satisfied(FINISHED).with_transition_time(at(8));

        source.push_watch_items(vec![
            Ok(WatchEvent::added(w1.clone())),
            Ok(WatchEvent::added(w2.clone())),
            Err(SourceError::stale("3")),
        ]);
        source.push_snapshot(Snapshot {
            items: vec![
                w1.clone().with_condition(finished.clone()),
                w2.clone(),
            ],
            revision: Revision::from("40"),
        });
        source.push_watch(vec![WatchEvent::modified(w2.with_condition(finished))]);

        let report = tracker(source.clone(), fast_config())
            .track("default", Revision::from("1"))
            .await;

        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert_eq!(report.completed(), 2);
        assert_eq!(
            source.watched_from(),
            vec![Revision::from("1"), Revision::from("40")]
        );
    }
}
