//! Scripted event source for tracker tests

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use kueuer_core::{
    Condition, EventSource, EventStream, ResourceObject, Result, Revision, Selector, Snapshot,
    SourceError, WatchEvent,
};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

enum WatchScript {
    Items(Vec<Result<WatchEvent>>),
    Fail(SourceError),
    Stall,
}

/// Replays queued snapshots and watch streams in order.
///
/// Once the watch script runs out every further watch stalls forever,
/// which is how a silent cluster watch behaves.
#[derive(Default)]
pub(crate) struct ScriptedSource {
    snapshots: Mutex<VecDeque<Result<Snapshot>>>,
    watches: Mutex<VecDeque<WatchScript>>,
    watched_from: Mutex<Vec<Revision>>,
    snapshot_calls: Mutex<usize>,
}

impl ScriptedSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_snapshot(&self, snapshot: Snapshot) {
        self.snapshots.lock().unwrap().push_back(Ok(snapshot));
    }

    pub(crate) fn push_snapshot_error(&self, err: SourceError) {
        self.snapshots.lock().unwrap().push_back(Err(err));
    }

    pub(crate) fn push_watch(&self, events: Vec<WatchEvent>) {
        self.push_watch_items(events.into_iter().map(Ok).collect());
    }

    pub(crate) fn push_watch_items(&self, items: Vec<Result<WatchEvent>>) {
        self.watches
            .lock()
            .unwrap()
            .push_back(WatchScript::Items(items));
    }

    pub(crate) fn push_watch_error(&self, err: SourceError) {
        self.watches.lock().unwrap().push_back(WatchScript::Fail(err));
    }

    pub(crate) fn push_stall(&self) {
        self.watches.lock().unwrap().push_back(WatchScript::Stall);
    }

    /// Revisions each watch call started from
    pub(crate) fn watched_from(&self) -> Vec<Revision> {
        self.watched_from.lock().unwrap().clone()
    }

    pub(crate) fn snapshot_calls(&self) -> usize {
        *self.snapshot_calls.lock().unwrap()
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn snapshot(&self, _selector: &Selector) -> Result<Snapshot> {
        *self.snapshot_calls.lock().unwrap() += 1;
        self.snapshots
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SourceError::connectivity("no snapshot scripted")))
    }

    async fn watch(
        &self,
        _selector: &Selector,
        from: &Revision,
        _timeout: Duration,
    ) -> Result<EventStream> {
        self.watched_from.lock().unwrap().push(from.clone());
        let script = self.watches.lock().unwrap().pop_front();
        match script {
            Some(WatchScript::Items(items)) => Ok(Box::pin(futures::stream::iter(items))),
            Some(WatchScript::Fail(err)) => Err(err),
            Some(WatchScript::Stall) | None => {
                Ok(Box::pin(futures::stream::pending::<Result<WatchEvent>>()))
            }
        }
    }
}

/// Fixed instant `secs` seconds after the test epoch
pub(crate) fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Job created at `created`; terminal with `Complete` when `completed` is set
pub(crate) fn job(name: &str, created: i64, completed: Option<i64>, revision: &str) -> ResourceObject {
    let object = ResourceObject::new(name, format!("uid-{}", name))
        .with_revision(revision)
        .with_creation(at(created));
    match completed {
        Some(done) => object
            .with_completion(at(done))
            .with_condition(Condition::satisfied("Complete").with_transition_time(at(done))),
        None => object,
    }
}
