//! Kubernetes list/watch event source
//!
//! Implements [`EventSource`] over the API server's REST interface.
//!
//! ## Watch protocol
//!
//! ```text
//! GET /apis/batch/v1/namespaces/{ns}/jobs?watch=1&resourceVersion=R&timeoutSeconds=T
//! ```
//!
//! The response body is a sequence of newline-delimited JSON frames:
//!
//! ```json
//! {"type": "MODIFIED", "object": { "metadata": { ... }, "status": { ... } }}
//! ```
//!
//! A revision that is too old to replay is reported either as HTTP 410 on
//! the request or as an in-stream `ERROR` frame whose status code is 410.
//! Both surface as [`SourceError::StaleRevision`].

use crate::client::KubeClient;
use crate::error::KueuerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use kueuer_core::{
    ChangeKind, Condition, EventSource, EventStream, ResourceKind, ResourceObject, Result, Revision,
    Selector, Snapshot, SourceError, WatchEvent,
};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, trace};

/// Extra time allowed past the server-side watch timeout before the client gives up
const WATCH_GRACE_SECS: u64 = 5;

/// HTTP status used by the API server for expired revisions
const HTTP_GONE: u16 = 410;

/// REST path of a namespaced resource collection
pub fn collection_path(kind: ResourceKind, namespace: &str) -> String {
    match kind {
        ResourceKind::Job => format!("/apis/batch/v1/namespaces/{}/jobs", namespace),
        ResourceKind::Workload => {
            format!("/apis/kueue.x-k8s.io/v1beta1/namespaces/{}/workloads", namespace)
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawList {
    #[serde(default)]
    metadata: RawListMeta,
    #[serde(default)]
    items: Vec<RawObject>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawListMeta {
    #[serde(default)]
    resource_version: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMeta {
    name: String,
    #[serde(default)]
    uid: String,
    namespace: Option<String>,
    resource_version: Option<String>,
    creation_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSpec {
    priority: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStatus {
    completion_time: Option<DateTime<Utc>>,
    conditions: Option<Vec<Condition>>,
}

#[derive(Debug, Deserialize)]
struct RawObject {
    metadata: RawMeta,
    spec: Option<RawSpec>,
    status: Option<RawStatus>,
}

impl From<RawObject> for ResourceObject {
    fn from(raw: RawObject) -> Self {
        let status = raw.status.unwrap_or_default();
        Self {
            name: raw.metadata.name,
            uid: raw.metadata.uid,
            namespace: raw.metadata.namespace,
            resource_version: raw.metadata.resource_version.map(Revision::from),
            creation_timestamp: raw.metadata.creation_timestamp,
            completion_time: status.completion_time,
            priority: raw.spec.and_then(|s| s.priority),
            conditions: status.conditions.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    type_: String,
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawErrorStatus {
    code: Option<u16>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawBookmark {
    metadata: RawListMeta,
}

/// Decode one watch frame.
///
/// Returns `Ok(None)` for blank lines. Objects outside the selector are
/// turned into bookmarks so the caller still advances its revision.
pub(crate) fn decode_frame(
    line: &[u8],
    selector: &Selector,
    from: &Revision,
) -> Result<Option<WatchEvent>> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    let frame: RawFrame =
        serde_json::from_slice(line).map_err(|e| SourceError::decode(e.to_string()))?;

    if frame.type_ == "ERROR" {
        let status: RawErrorStatus = serde_json::from_value(frame.object)
            .map_err(|e| SourceError::decode(e.to_string()))?;
        return Err(match status.code {
            Some(HTTP_GONE) => SourceError::stale(from.clone()),
            code => SourceError::Api {
                status: code.unwrap_or_default(),
                message: status.message,
            },
        });
    }

    let kind = ChangeKind::parse(&frame.type_)
        .ok_or_else(|| SourceError::decode(format!("unknown watch event type {}", frame.type_)))?;

    if kind == ChangeKind::Bookmark {
        let bookmark: RawBookmark = serde_json::from_value(frame.object)
            .map_err(|e| SourceError::decode(e.to_string()))?;
        return Ok(Some(WatchEvent::bookmark(bookmark.metadata.resource_version)));
    }

    let raw: RawObject =
        serde_json::from_value(frame.object).map_err(|e| SourceError::decode(e.to_string()))?;
    let object = ResourceObject::from(raw);

    if !selector.matches(&object.name) {
        let revision = object.resource_version.unwrap_or_default();
        return Ok(Some(WatchEvent::bookmark(revision)));
    }

    Ok(Some(WatchEvent::new(kind, object)))
}

/// Event source backed by the Kubernetes API server
#[derive(Debug, Clone)]
pub struct KubeEventSource {
    client: KubeClient,
}

impl KubeEventSource {
    /// Event source over `client`
    pub fn new(client: KubeClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventSource for KubeEventSource {
    async fn snapshot(&self, selector: &Selector) -> Result<Snapshot> {
        let path = collection_path(selector.kind, &selector.namespace);
        let list: RawList = self
            .client
            .get_json(&path, &[])
            .await
            .map_err(KueuerError::into_source)?;

        let items: Vec<ResourceObject> = list
            .items
            .into_iter()
            .map(ResourceObject::from)
            .filter(|o| selector.matches(&o.name))
            .collect();

        debug!(
            kind = %selector.kind,
            namespace = %selector.namespace,
            items = items.len(),
            revision = %list.metadata.resource_version,
            "Snapshot taken"
        );

        Ok(Snapshot {
            items,
            revision: Revision::new(list.metadata.resource_version),
        })
    }

    async fn watch(
        &self,
        selector: &Selector,
        from: &Revision,
        timeout: Duration,
    ) -> Result<EventStream> {
        let path = collection_path(selector.kind, &selector.namespace);
        let query = [
            ("watch", "1".to_string()),
            ("resourceVersion", from.to_string()),
            ("timeoutSeconds", timeout.as_secs().max(1).to_string()),
            ("allowWatchBookmarks", "true".to_string()),
        ];

        let response = self
            .client
            .get_stream(&path, &query)
            .await
            .map_err(|e| match e.into_source() {
                SourceError::Api { status, .. } if status == HTTP_GONE => {
                    SourceError::stale(from.clone())
                }
                other => other,
            })?;

        debug!(kind = %selector.kind, revision = %from, "Watch started");

        let selector = selector.clone();
        let from = from.clone();
        let bound = tokio::time::Instant::now() + timeout + Duration::from_secs(WATCH_GRACE_SECS);

        Ok(Box::pin(async_stream::stream! {
            let mut body = response.bytes_stream();
            let mut frames = FrameBuffer::default();
            let mut truncated = false;

            loop {
                let chunk = match tokio::time::timeout_at(bound, body.next()).await {
                    Err(_) => {
                        debug!(revision = %from, "Watch exceeded client-side bound, closing");
                        truncated = true;
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        yield Err(SourceError::connectivity(e.to_string()));
                        break;
                    }
                    Ok(Some(Ok(chunk))) => chunk,
                };

                for line in frames.push(&chunk) {
                    trace!(bytes = line.len(), "Watch frame");
                    match decode_frame(&line, &selector, &from) {
                        Ok(Some(event)) => yield Ok(event),
                        Ok(None) => {}
                        Err(e) => {
                            let stale = e.is_stale();
                            yield Err(e);
                            if stale {
                                return;
                            }
                        }
                    }
                }
            }

            if let Some(tail) = frames.finish(truncated) {
                match decode_frame(&tail, &selector, &from) {
                    Ok(Some(event)) => yield Ok(event),
                    Ok(None) => {}
                    Err(e) => yield Err(e),
                }
            }
        }))
    }
}

/// Splits a watch body into newline-terminated frames
#[derive(Debug, Default)]
struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            lines.push(self.pending.drain(..=pos).collect());
        }
        lines
    }

    /// Unterminated tail of a body that ended on its own. A body cut off by
    /// the client-side bound ends mid-frame, so its tail is dropped.
    fn finish(self, truncated: bool) -> Option<Vec<u8>> {
        if truncated || self.pending.iter().all(u8::is_ascii_whitespace) {
            if truncated && !self.pending.is_empty() {
                debug!(bytes = self.pending.len(), "Dropping partial watch frame");
            }
            return None;
        }
        Some(self.pending)
    }
}
