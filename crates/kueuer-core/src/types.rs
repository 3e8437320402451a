//! Core types shared across Kueuer components

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Condition status value that marks a condition as satisfied
pub const CONDITION_TRUE: &str = "True";

/// Opaque revision token used to resume a watch (Kubernetes `resourceVersion`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision(pub String);

impl Revision {
    pub fn new(revision: impl Into<String>) -> Self {
        Self(revision.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Revision {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Revision {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource kinds the trackers observe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// batch/v1 Job
    Job,
    /// kueue.x-k8s.io/v1beta1 Workload
    Workload,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Job => write!(f, "jobs"),
            ResourceKind::Workload => write!(f, "workloads"),
        }
    }
}

/// Selects the resources a snapshot or watch covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name_prefix: Option<String>,
}

impl Selector {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name_prefix: None,
        }
    }

    pub fn jobs(namespace: impl Into<String>) -> Self {
        Self::new(ResourceKind::Job, namespace)
    }

    pub fn workloads(namespace: impl Into<String>) -> Self {
        Self::new(ResourceKind::Workload, namespace)
    }

    /// Restrict the selector to names starting with `prefix`
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    pub fn matches(&self, name: &str) -> bool {
        self.name_prefix
            .as_deref()
            .is_none_or(|prefix| name.starts_with(prefix))
    }
}

/// Status condition as reported on a Job or Workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(type_: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status: status.into(),
            reason: None,
            message: None,
            last_transition_time: None,
        }
    }

    /// Shorthand for a condition with status `True`
    pub fn satisfied(type_: impl Into<String>) -> Self {
        Self::new(type_, CONDITION_TRUE)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_transition_time(mut self, at: DateTime<Utc>) -> Self {
        self.last_transition_time = Some(at);
        self
    }

    pub fn is_satisfied(&self) -> bool {
        self.status == CONDITION_TRUE
    }
}

/// The subset of a cluster object the trackers need
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceObject {
    pub name: String,
    pub uid: String,
    pub namespace: Option<String>,
    pub resource_version: Option<Revision>,
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Job `status.completionTime`
    pub completion_time: Option<DateTime<Utc>>,
    /// Workload `spec.priority`
    pub priority: Option<i32>,
    pub conditions: Vec<Condition>,
}

impl ResourceObject {
    pub fn new(name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: uid.into(),
            namespace: None,
            resource_version: None,
            creation_timestamp: None,
            completion_time: None,
            priority: None,
            conditions: Vec::new(),
        }
    }

    pub fn with_revision(mut self, revision: impl Into<Revision>) -> Self {
        self.resource_version = Some(revision.into());
        self
    }

    pub fn with_creation(mut self, at: DateTime<Utc>) -> Self {
        self.creation_timestamp = Some(at);
        self
    }

    pub fn with_completion(mut self, at: DateTime<Utc>) -> Self {
        self.completion_time = Some(at);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// First condition of the given type, if any
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Whether a condition of the given type is present with status `True`
    pub fn has_condition(&self, type_: &str) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == type_ && c.is_satisfied())
    }
}

/// Kind of change carried by a watch event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    /// Revision checkpoint without an object of interest
    Bookmark,
}

impl ChangeKind {
    /// Parse from the watch frame `type` field
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ADDED" => Some(Self::Added),
            "MODIFIED" => Some(Self::Modified),
            "DELETED" => Some(Self::Deleted),
            "BOOKMARK" => Some(Self::Bookmark),
            _ => None,
        }
    }
}

/// One change observed on a watch
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub kind: ChangeKind,
    pub revision: Revision,
    /// Absent only for bookmarks
    pub object: Option<ResourceObject>,
}

impl WatchEvent {
    /// Build an event for `object`, taking the revision from the object itself
    pub fn new(kind: ChangeKind, object: ResourceObject) -> Self {
        let revision = object.resource_version.clone().unwrap_or_default();
        Self {
            kind,
            revision,
            object: Some(object),
        }
    }

    pub fn added(object: ResourceObject) -> Self {
        Self::new(ChangeKind::Added, object)
    }

    pub fn modified(object: ResourceObject) -> Self {
        Self::new(ChangeKind::Modified, object)
    }

    pub fn bookmark(revision: impl Into<Revision>) -> Self {
        Self {
            kind: ChangeKind::Bookmark,
            revision: revision.into(),
            object: None,
        }
    }
}

/// Point-in-time listing of resources plus the revision it was taken at
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub items: Vec<ResourceObject>,
    pub revision: Revision,
}

/// Creation/completion timing of a tracked job
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobTiming {
    pub creation: Option<DateTime<Utc>>,
    pub completion: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
}

impl JobTiming {
    /// Derive the duration when both timestamps are known
    pub fn new(creation: Option<DateTime<Utc>>, completion: Option<DateTime<Utc>>) -> Self {
        let duration_secs = match (creation, completion) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        };
        Self {
            creation,
            completion,
            duration_secs,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.creation.is_some() && self.completion.is_some() && self.duration_secs.is_some()
    }
}

/// An eviction of a workload, attributed to the workload that preempted it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreemptionEvent {
    /// UID of the preempting workload
    pub preemptor: String,
    pub observed_at: DateTime<Utc>,
}

/// Lifecycle record of a Kueue workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedWorkload {
    pub uid: String,
    pub name: String,
    pub priority: i32,
    pub admitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub requeues: u32,
    pub preemptors: Vec<PreemptionEvent>,
}

impl TrackedWorkload {
    pub fn new(
        uid: impl Into<String>,
        name: impl Into<String>,
        priority: i32,
        admitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
            priority,
            admitted_at,
            finished_at: None,
            requeues: 0,
            preemptors: Vec::new(),
        }
    }

    /// Record an eviction; returns false if this preemptor was already recorded
    pub fn record_preemption(&mut self, preemptor: &str, observed_at: DateTime<Utc>) -> bool {
        if self.preemptors.iter().any(|p| p.preemptor == preemptor) {
            return false;
        }
        self.preemptors.push(PreemptionEvent {
            preemptor: preemptor.to_string(),
            observed_at,
        });
        true
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}
