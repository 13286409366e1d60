//! Default task-group executor.
//!
//! Started by the agent inside the executor's container, this process
//! launches one task group as a set of nested child containers, reports
//! task lifecycle back over the agent's executor API, runs check and
//! health-check probes against the tasks, and drives graceful-then-forceful
//! termination on kill or shutdown.
//!
//! ## Architecture
//!
//! A single mailbox actor owns all state; network I/O, timers, and probe
//! engines post messages into it:
//!
//! ```text
//! Executor (actor)
//! ├── EventStream          (subscription stream, reconnect w/ backoff)
//! ├── wait long-polls      (one dedicated connection per child container)
//! ├── Checker(task)        (general check probes)
//! └── HealthChecker(task)  (health probes, may request a kill)
//! ```
//!
//! ## Modules
//!
//! - `actor`: mailbox event loop
//! - `client`: agent HTTP plumbing and test doubles
//! - `executor`: the lifecycle engine
//! - `checks`: check / health-check probe engines
//! - `config`: environment intake and flags
//! - `sandbox`: per-task sandbox symlinks
//! - `exit`: wait-status decoding

pub mod actor;
pub mod checks;
pub mod client;
pub mod config;
pub mod executor;
pub mod exit;
pub mod sandbox;

pub use executor::{Executor, ExecutorMessage, ExecutorSettings, MailboxSink};
