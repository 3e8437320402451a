//! Core traits for Kueuer
//!
//! The EventSource trait is the only way the trackers see the cluster.
//! Trackers are written against this interface, never a concrete client.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;

use crate::error::SourceError;
use crate::types::{Revision, Selector, Snapshot, WatchEvent};

/// Result type for event source operations
pub type Result<T> = std::result::Result<T, SourceError>;

/// Lazy, finite sequence of watch events.
///
/// The stream ends when the watch timeout elapses. A `StaleRevision` item
/// means the caller must re-snapshot before watching again.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<WatchEvent>> + Send>>;

/// List and watch access to one cluster resource collection
#[async_trait]
pub trait EventSource: Send + Sync {
    /// All resources matching `selector`, plus the revision they were read at
    async fn snapshot(&self, selector: &Selector) -> Result<Snapshot>;

    /// Changes strictly after `from`, ending once `timeout` has elapsed
    async fn watch(
        &self,
        selector: &Selector,
        from: &Revision,
        timeout: Duration,
    ) -> Result<EventStream>;
}
