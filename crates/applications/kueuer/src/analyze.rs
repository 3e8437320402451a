//! Preemption priority analysis
//!
//! A preemption is correct only when the preempting workload has a strictly
//! higher priority than its victim. Preemptors that were never seen admitted
//! cannot be judged and are reported as unverifiable.

use kueuer_core::TrackedWorkload;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{error, info, warn};

/// Outcome of judging one preemption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Preemptor priority strictly above the victim's
    Correct,
    /// Preemptor priority at or below the victim's
    Violation,
    /// Preemptor was never seen admitted
    Unverifiable,
}

/// Verdict for one preemption event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreemptionVerdict {
    /// Victim workload UID
    pub victim: String,
    /// Victim workload name
    pub victim_name: String,
    /// Victim priority at admission
    pub victim_priority: i32,
    /// Preemptor workload UID
    pub preemptor: String,
    /// Unset when the preemptor was never tracked
    pub preemptor_priority: Option<i32>,
    /// Judgement for this preemption
    pub verdict: Verdict,
}

/// Number of verdicts of each kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictCounts {
    /// Correct preemptions
    pub correct: usize,
    /// Priority violations
    pub violation: usize,
    /// Preemptions with an unknown preemptor
    pub unverifiable: usize,
}

/// Result of a priority analysis
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityReport {
    /// Whether any preemption violated priority
    pub has_violations: bool,
    /// One entry per recorded preemption
    pub verdicts: Vec<PreemptionVerdict>,
    /// Totals per verdict
    pub counts: VerdictCounts,
}

/// Judge every recorded preemption against the tracked priorities
pub fn analyze_priority_violations(workloads: &BTreeMap<String, TrackedWorkload>) -> PriorityReport {
    info!(workloads = workloads.len(), "Starting preemption priority analysis");

    let mut report = PriorityReport::default();

    for (uid, victim) in workloads {
        for event in &victim.preemptors {
            let preemptor = workloads.get(&event.preemptor);
            let preemptor_priority = preemptor.map(|p| p.priority);
            let preemptor_name = preemptor.map_or(event.preemptor.as_str(), |p| p.name.as_str());

            let verdict = match preemptor_priority {
                None => {
                    report.counts.unverifiable += 1;
                    warn!(
                        victim = %victim.name,
                        victim_priority = victim.priority,
                        preemptor = %event.preemptor,
                        "Preemptor was never tracked, cannot verify"
                    );
                    Verdict::Unverifiable
                }
                Some(priority) if priority > victim.priority => {
                    report.counts.correct += 1;
                    info!(
                        victim = %victim.name,
                        victim_priority = victim.priority,
                        preemptor = %preemptor_name,
                        preemptor_priority = priority,
                        "Preemption respected priority"
                    );
                    Verdict::Correct
                }
                Some(priority) => {
                    report.counts.violation += 1;
                    error!(
                        victim = %victim.name,
                        victim_priority = victim.priority,
                        preemptor = %preemptor_name,
                        preemptor_priority = priority,
                        "Priority violation"
                    );
                    Verdict::Violation
                }
            };

            report.verdicts.push(PreemptionVerdict {
                victim: uid.clone(),
                victim_name: victim.name.clone(),
                victim_priority: victim.priority,
                preemptor: event.preemptor.clone(),
                preemptor_priority,
                verdict,
            });
        }
    }

    report.has_violations = report.counts.violation > 0;
    if report.has_violations {
        error!(
            violations = report.counts.violation,
            correct = report.counts.correct,
            unverifiable = report.counts.unverifiable,
            "Found preemption priority violations"
        );
    } else {
        info!(
            correct = report.counts.correct,
            unverifiable = report.counts.unverifiable,
            "No preemption priority violations"
        );
    }

    report
}
