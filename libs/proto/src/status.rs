//! Task status updates and check/health results.

use serde::{Deserialize, Serialize};

use crate::ids::{ContainerId, ExecutorId, TaskId, UpdateId};
use crate::task::CheckKind;

/// Lifecycle state of a task as reported to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    TaskRunning,
    TaskKilling,
    TaskFinished,
    TaskFailed,
    TaskKilled,
}

impl TaskState {
    /// Whether this state ends the task's update sequence.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::TaskFinished | TaskState::TaskFailed | TaskState::TaskKilled
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::TaskRunning => "TASK_RUNNING",
            TaskState::TaskKilling => "TASK_KILLING",
            TaskState::TaskFinished => "TASK_FINISHED",
            TaskState::TaskFailed => "TASK_FAILED",
            TaskState::TaskKilled => "TASK_KILLED",
        };
        write!(f, "{}", s)
    }
}

/// Reason qualifying a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusReason {
    ReasonTaskCheckStatusUpdated,
    ReasonTaskHealthCheckStatusUpdated,
}

/// Originator of a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusSource {
    SourceExecutor,
    SourceAgent,
    SourceMaster,
}

/// A status update for a single task. Identified by `uuid`, which the
/// scheduler must acknowledge before the update is dropped from the
/// executor's replay buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,

    pub state: TaskState,

    pub uuid: UpdateId,

    /// Wall-clock seconds since the epoch.
    pub timestamp: f64,

    pub executor_id: ExecutorId,

    pub source: StatusSource,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<StatusReason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_status: Option<CheckStatusInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_status: Option<ContainerStatus>,
}

/// Container placement information attached to a status update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub container_id: ContainerId,
}

/// Result of a general check, attached to status updates for checked tasks.
///
/// For a checked task every update carries a `CheckStatusInfo` with the
/// correct variant, even before the first result is available; the inner
/// fields are then absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckStatusInfo {
    #[serde(rename = "type")]
    pub kind: CheckKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandCheckStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpCheckStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpCheckStatus>,
}

impl CheckStatusInfo {
    /// The empty placeholder carried before any check result exists.
    #[must_use]
    pub fn placeholder(kind: CheckKind) -> Self {
        match kind {
            CheckKind::Command => Self {
                kind,
                command: Some(CommandCheckStatus { exit_code: None }),
                http: None,
                tcp: None,
            },
            CheckKind::Http => Self {
                kind,
                command: None,
                http: Some(HttpCheckStatus { status_code: None }),
                tcp: None,
            },
            CheckKind::Tcp => Self {
                kind,
                command: None,
                http: None,
                tcp: Some(TcpCheckStatus { succeeded: None }),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandCheckStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpCheckStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpCheckStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub succeeded: Option<bool>,
}

/// Health-check verdict delivered by a health-check engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHealthStatus {
    pub task_id: TaskId,

    pub healthy: bool,

    /// When set the executor must kill the task in response.
    #[serde(default)]
    pub kill_task: bool,
}
