//! Task, task-group, container, and check descriptions.
//!
//! These mirror the scheduler-facing protocol messages the executor consumes
//! when launching a task group. Fields the default executor never reads are
//! not modeled.

use serde::{Deserialize, Serialize};

use crate::ids::TaskId;

/// Description of a single task within a task group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerInfo>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_policy: Option<KillPolicy>,
}

/// A set of tasks launched atomically and subject to shared fate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroupInfo {
    pub tasks: Vec<TaskInfo>,
}

impl TaskGroupInfo {
    /// Task ids of the group, in launch order.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.task_id.clone()).collect()
    }
}

/// Command to run inside a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,

    /// When true `value` is interpreted by a shell; when false `value` is
    /// the executable and `arguments` the argv.
    #[serde(default = "default_shell")]
    pub shell: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
}

fn default_shell() -> bool {
    true
}

impl Default for CommandInfo {
    fn default() -> Self {
        Self {
            value: None,
            arguments: Vec::new(),
            shell: true,
            environment: None,
        }
    }
}

/// Environment variables attached to a command.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub variables: Vec<EnvironmentVariable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

/// Containerizer configuration for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    #[serde(rename = "type")]
    pub kind: ContainerKind,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

impl ContainerInfo {
    /// A containerizer-native container with no volumes.
    #[must_use]
    pub fn mesos() -> Self {
        Self {
            kind: ContainerKind::Mesos,
            volumes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerKind {
    Mesos,
    Docker,
}

/// A volume mounted into a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub mode: VolumeMode,

    pub container_path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<VolumeSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeMode {
    Ro,
    Rw,
}

/// Where a volume's data comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeSource {
    /// A path inside a sandbox, either the container's own or its parent's.
    SandboxPath { sandbox_path: SandboxPath },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxPath {
    #[serde(rename = "type")]
    pub kind: SandboxPathKind,

    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxPathKind {
    #[serde(rename = "SELF")]
    OwnSandbox,
    Parent,
}

/// A resource assigned to a task. Only the fields the executor inspects
/// (disk volumes) are modeled beyond name and quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalar: Option<Scalar>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scalar {
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Volume>,
}

/// Parameters governing task termination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period: Option<DurationInfo>,
}

/// A protocol duration, carried as nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationInfo {
    pub nanoseconds: i64,
}

impl DurationInfo {
    #[must_use]
    pub fn from_secs(secs: u64) -> Self {
        Self {
            nanoseconds: (secs as i64) * 1_000_000_000,
        }
    }

    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_nanos(self.nanoseconds.max(0) as u64)
    }
}

/// A general check on a task, surfaced to the scheduler as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckInfo {
    #[serde(rename = "type")]
    pub kind: CheckKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandCheck>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpCheck>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpCheck>,

    #[serde(default = "default_check_delay")]
    pub delay_seconds: f64,

    #[serde(default = "default_check_interval")]
    pub interval_seconds: f64,

    #[serde(default = "default_check_timeout")]
    pub timeout_seconds: f64,
}

fn default_check_delay() -> f64 {
    15.0
}

fn default_check_interval() -> f64 {
    10.0
}

fn default_check_timeout() -> f64 {
    20.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckKind {
    Command,
    Http,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandCheck {
    pub command: CommandInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpCheck {
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpCheck {
    pub port: u16,
}

/// A health check on a task. Unlike a general check, a failing health check
/// can ask the executor to kill the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckInfo {
    #[serde(rename = "type")]
    pub kind: CheckKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandCheck>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpCheck>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpCheck>,

    #[serde(default)]
    pub delay_seconds: f64,

    #[serde(default = "default_check_interval")]
    pub interval_seconds: f64,

    #[serde(default = "default_check_timeout")]
    pub timeout_seconds: f64,

    /// Consecutive failures after which the task is deemed unhealthy and
    /// killed.
    #[serde(default = "default_consecutive_failures")]
    pub consecutive_failures: u32,

    /// Failures within the grace period do not count against the task.
    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: f64,
}

fn default_consecutive_failures() -> u32 {
    3
}

fn default_grace_period() -> f64 {
    10.0
}

/// Framework description received with the subscription confirmation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameworkInfo {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<FrameworkCapability>,
}

impl FrameworkInfo {
    /// Whether the framework advertises the given capability.
    #[must_use]
    pub fn has_capability(&self, kind: CapabilityKind) -> bool {
        self.capabilities.iter().any(|c| c.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkCapability {
    #[serde(rename = "type")]
    pub kind: CapabilityKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapabilityKind {
    TaskKillingState,
    PartitionAware,
    #[serde(other)]
    Unknown,
}
