//! Tracking sessions
//!
//! A session owns one tracker's state for its whole lifetime and drives a
//! restartable watch against a single deadline:
//!
//! ```text
//! watch(revision) ──► events ──► handler
//!     ▲    │
//!     │    ├── exhausted (stream timeout) ──► re-issue from last revision
//!     │    ├── StaleRevision ──► snapshot ──► handler resync ──► new revision
//!     │    └── transient error ──► backoff ──► retry (N consecutive = disconnected)
//!     │
//!     └── until handler is done, or the deadline passes (partial results)
//! ```
//!
//! Every wait, including the wait for the next event on a stream that has
//! gone silent, is raced against the session deadline.

use futures::StreamExt;
use kueuer_core::{ChangeKind, EventSource, Revision, Selector, Snapshot, SourceError, WatchEvent};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tracing::{Span, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Default overall session deadline
pub const DEFAULT_SESSION_DEADLINE_SECS: u64 = 600;

/// Default server-side timeout of a single watch request
pub const DEFAULT_WATCH_TIMEOUT_SECS: u64 = 60;

/// Default pause between failed source calls
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 2000;

/// Consecutive source failures before the session reports a disconnect
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Where admission/eviction/finish timestamps come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TimestampSource {
    /// Time the event was processed by the tracker
    #[default]
    Observed,

    /// The condition's `lastTransitionTime`, falling back to observation time
    Server,
}

/// Configuration of a tracking session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Overall deadline; partial results are returned when it passes
    pub deadline: Duration,

    /// Server-side timeout of each watch request
    pub watch_timeout: Duration,

    /// Pause between failed source calls
    pub retry_backoff: Duration,

    /// Consecutive failures before giving up with `Disconnected`
    pub max_consecutive_failures: u32,

    /// Timestamp source for workload lifecycle events
    pub timestamp_source: TimestampSource,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(DEFAULT_SESSION_DEADLINE_SECS),
            watch_timeout: Duration::from_secs(DEFAULT_WATCH_TIMEOUT_SECS),
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            timestamp_source: TimestampSource::Observed,
        }
    }
}

impl SessionConfig {
    /// Set the overall deadline
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Set the per-request watch timeout
    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout;
        self
    }

    /// Set the retry backoff
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the failure budget
    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures.max(1);
        self
    }

    /// Set the timestamp source
    pub fn with_timestamp_source(mut self, source: TimestampSource) -> Self {
        self.timestamp_source = source;
        self
    }
}

/// How a tracking session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Every tracked entity reached its terminal state
    Completed,

    /// The deadline passed; `untracked` entities never reached a terminal state
    DeadlineExceeded { untracked: usize },

    /// The event source kept failing
    Disconnected { reason: String },
}

impl SessionOutcome {
    /// Whether every tracked entity reached its terminal state
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Short state name, as serialized in the `state` tag
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::Disconnected { .. } => "disconnected",
        }
    }
}

/// Per-session context: configuration plus the span all session logs go to
#[derive(Debug, Clone)]
pub struct SessionContext {
    id: Uuid,
    label: String,
    config: SessionConfig,
    span: Span,
}

impl SessionContext {
    /// Context with a fresh session id and span
    pub fn new(label: impl Into<String>, config: SessionConfig) -> Self {
        let id = Uuid::new_v4();
        let label = label.into();
        let span = info_span!("session", id = %id, label = %label);
        Self {
            id,
            label,
            config,
            span,
        }
    }

    /// Session id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Human-readable session label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Span all session logs are recorded in
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Deadline for a session starting now
    pub fn deadline_from_now(&self) -> Instant {
        Instant::now() + self.config.deadline
    }
}

/// State machine driven by [`drive`]
pub(crate) trait SessionHandler {
    /// Apply one non-bookmark watch event
    fn apply_event(&mut self, event: WatchEvent);

    /// Re-synchronize from a fresh snapshot after a stale revision
    fn apply_snapshot(&mut self, snapshot: &Snapshot);

    /// Whether tracking can stop
    fn is_done(&self) -> bool;

    /// Entities that have not reached a terminal state
    fn remaining(&self) -> usize;
}

/// Why [`drive`] returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DriveEnd {
    Done,
    DeadlineExceeded,
    Disconnected(String),
}

impl DriveEnd {
    pub(crate) fn into_outcome(self, untracked: usize) -> SessionOutcome {
        match self {
            DriveEnd::Done => SessionOutcome::Completed,
            DriveEnd::DeadlineExceeded => SessionOutcome::DeadlineExceeded { untracked },
            DriveEnd::Disconnected(reason) => SessionOutcome::Disconnected { reason },
        }
    }
}

/// Record a failure and wait out the backoff.
///
/// Returns `Some` when the session must end instead of retrying.
async fn back_off(
    failures: &mut u32,
    err: &SourceError,
    config: &SessionConfig,
    deadline: Instant,
) -> Option<DriveEnd> {
    *failures += 1;
    if *failures >= config.max_consecutive_failures {
        error!(failures = *failures, error = %err, "Event source unreachable, giving up");
        return Some(DriveEnd::Disconnected(err.to_string()));
    }

    warn!(attempt = *failures, error = %err, "Event source failure, retrying");
    let resume = (Instant::now() + config.retry_backoff).min(deadline);
    tokio::time::sleep_until(resume).await;
    if Instant::now() >= deadline {
        return Some(DriveEnd::DeadlineExceeded);
    }
    None
}

/// Take a snapshot, retrying transient failures within the deadline
pub(crate) async fn snapshot_with_retry<S>(
    source: &S,
    selector: &Selector,
    config: &SessionConfig,
    deadline: Instant,
) -> std::result::Result<Snapshot, DriveEnd>
where
    S: EventSource + ?Sized,
{
    let mut failures = 0;
    loop {
        match timeout_at(deadline, source.snapshot(selector)).await {
            Err(_) => return Err(DriveEnd::DeadlineExceeded),
            Ok(Ok(snapshot)) => return Ok(snapshot),
            Ok(Err(e)) => {
                if let Some(end) = back_off(&mut failures, &e, config, deadline).await {
                    return Err(end);
                }
            }
        }
    }
}

/// Drive `handler` from `revision` until it is done or the deadline passes
pub(crate) async fn drive<S, H>(
    source: &S,
    selector: &Selector,
    mut revision: Revision,
    config: &SessionConfig,
    deadline: Instant,
    handler: &mut H,
) -> DriveEnd
where
    S: EventSource + ?Sized,
    H: SessionHandler,
{
    let mut failures: u32 = 0;
    let mut resync = false;

    while !handler.is_done() {
        let now = Instant::now();
        if now >= deadline {
            return DriveEnd::DeadlineExceeded;
        }

        if resync {
            let snapshot = match snapshot_with_retry(source, selector, config, deadline).await {
                Ok(snapshot) => snapshot,
                Err(end) => return end,
            };
            info!(
                revision = %snapshot.revision,
                items = snapshot.items.len(),
                "Re-synchronized from snapshot"
            );
            handler.apply_snapshot(&snapshot);
            revision = snapshot.revision;
            resync = false;
            continue;
        }

        let watch_timeout = config
            .watch_timeout
            .min(deadline - now)
            .max(Duration::from_secs(1));

        let mut stream = match timeout_at(deadline, source.watch(selector, &revision, watch_timeout))
            .await
        {
            Err(_) => return DriveEnd::DeadlineExceeded,
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.is_stale() => {
                warn!(revision = %revision, "Revision expired, re-snapshotting");
                resync = true;
                continue;
            }
            Ok(Err(e)) => {
                if let Some(end) = back_off(&mut failures, &e, config, deadline).await {
                    return end;
                }
                continue;
            }
        };

        let mut seen = 0usize;
        loop {
            match timeout_at(deadline, stream.next()).await {
                Err(_) => {
                    warn!(
                        remaining = handler.remaining(),
                        "Deadline reached while waiting for events"
                    );
                    return DriveEnd::DeadlineExceeded;
                }
                Ok(None) | Ok(Some(Err(SourceError::StreamTimeout))) => {
                    debug!(revision = %revision, events = seen, "Watch exhausted, re-issuing");
                    if seen == 0 {
                        let resume = (Instant::now() + config.retry_backoff).min(deadline);
                        tokio::time::sleep_until(resume).await;
                    }
                    break;
                }
                Ok(Some(Err(e))) if e.is_stale() => {
                    warn!(revision = %revision, "Revision expired mid-stream, re-snapshotting");
                    resync = true;
                    break;
                }
                Ok(Some(Err(e))) => {
                    if let Some(end) = back_off(&mut failures, &e, config, deadline).await {
                        return end;
                    }
                    break;
                }
                Ok(Some(Ok(event))) => {
                    seen += 1;
                    failures = 0;
                    if !event.revision.is_empty() {
                        revision = event.revision.clone();
                    }
                    if event.kind != ChangeKind::Bookmark {
                        handler.apply_event(event);
                    }
                    if handler.is_done() {
                        return DriveEnd::Done;
                    }
                }
            }
        }
    }

    DriveEnd::Done
}
