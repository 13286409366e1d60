//! # mesos-proto
//!
//! Wire-protocol data model for the Mesos v1 executor and agent APIs, as
//! consumed by the default task-group executor.
//!
//! ## Design Principles
//!
//! - Scheduler-supplied identifiers are opaque strings; the executor never
//!   interprets them beyond equality
//! - Generated identifiers (status-update UUIDs, container ids) are
//!   ULID-based 128-bit random tokens
//! - Every protocol "optional" is an `Option<T>`: an absent kill policy is
//!   meaningfully different from a zero grace period
//! - Events and calls are tagged sum types whose JSON rendering matches the
//!   protocol's self-describing form (`{"type": "SUBSCRIBED", ...}`)
//!
//! ## Modules
//!
//! - `ids`: typed identifiers
//! - `task`: task, task-group, container, and check descriptions
//! - `status`: task status updates and check/health results
//! - `executor`: events and calls on the executor subscription channel
//! - `agent`: agent-API calls (nested-container lifecycle)
//! - `recordio`: length-prefixed framing for the event stream

mod error;

pub mod agent;
pub mod executor;
pub mod ids;
pub mod recordio;
pub mod status;
pub mod task;

pub use error::ProtoError;
pub use ids::{ContainerId, ExecutorId, FrameworkId, TaskId, UpdateId};

/// Content type used for every agent and executor API exchange.
pub const CONTENT_TYPE: &str = "application/json";

/// Re-export ulid for consumers that need raw token operations.
pub use ulid::Ulid;
