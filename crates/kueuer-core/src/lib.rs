//! Kueuer Core - Shared types and traits
//!
//! This crate defines the core abstractions used across:
//! - the completion and eviction trackers
//! - the job launcher and benchmark runner
//! - the kueuer CLI
//!
//! Key types:
//! - EventSource trait (list + watch over a resource collection)
//! - Cluster objects, conditions, revisions and watch events
//! - Job timings and tracked workloads
//! - Error types

pub mod types;
pub mod traits;
pub mod error;

pub use types::*;
pub use traits::*;
pub use error::*;
