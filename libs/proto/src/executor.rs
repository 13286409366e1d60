//! Events and calls exchanged on the executor subscription channel.
//!
//! Inbound `Event`s arrive on the agent's event stream; outbound `Call`s are
//! posted by the executor. Both are internally tagged so the JSON form is the
//! protocol's self-describing shape, e.g.
//! `{"type": "SUBSCRIBED", "subscribed": {...}}`.

use serde::{Deserialize, Serialize};

use crate::ids::{ContainerId, ExecutorId, FrameworkId, TaskId, UpdateId};
use crate::status::TaskStatus;
use crate::task::{FrameworkInfo, KillPolicy, TaskGroupInfo, TaskInfo};

/// An event delivered by the agent on the subscription stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Subscribed { subscribed: Subscribed },
    Launch { launch: Launch },
    LaunchGroup { launch_group: LaunchGroup },
    Kill { kill: Kill },
    Acknowledged { acknowledged: Acknowledged },
    Shutdown,
    Message { message: Message },
    Error { error: ErrorEvent },
    #[serde(other)]
    Unknown,
}

impl Event {
    /// Protocol name of the event kind, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Subscribed { .. } => "SUBSCRIBED",
            Event::Launch { .. } => "LAUNCH",
            Event::LaunchGroup { .. } => "LAUNCH_GROUP",
            Event::Kill { .. } => "KILL",
            Event::Acknowledged { .. } => "ACKNOWLEDGED",
            Event::Shutdown => "SHUTDOWN",
            Event::Message { .. } => "MESSAGE",
            Event::Error { .. } => "ERROR",
            Event::Unknown => "UNKNOWN",
        }
    }
}

/// Subscription confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribed {
    pub framework_info: FrameworkInfo,

    /// The executor's own container; parent of every child container it
    /// launches.
    pub container_id: ContainerId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_info: Option<AgentInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub hostname: String,
}

/// Single-task launch. Not supported by the task-group executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Launch {
    pub task: TaskInfo,
}

/// Atomic launch of a task group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchGroup {
    pub task_group: TaskGroupInfo,
}

/// Request to kill a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kill {
    pub task_id: TaskId,

    /// Overrides the task's own kill policy when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_policy: Option<KillPolicy>,
}

/// Acknowledgement of a previously forwarded status update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledged {
    pub task_id: TaskId,
    pub uuid: UpdateId,
}

/// Opaque framework-to-executor message. The default executor ignores these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
}

/// A call posted by the executor on the subscription channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub framework_id: FrameworkId,

    pub executor_id: ExecutorId,

    #[serde(flatten)]
    pub kind: CallKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallKind {
    Subscribe { subscribe: Subscribe },
    Update { update: Update },
}

/// Subscription request, carrying replay state so the agent can re-deliver
/// acknowledgements and learn about tasks it may have lost.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Subscribe {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unacknowledged_updates: Vec<Update>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unacknowledged_tasks: Vec<TaskInfo>,
}

/// A forwarded status update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub status: TaskStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{CapabilityKind, FrameworkCapability};

    #[test]
    fn test_subscribed_event_wire_form() {
        let json = r#"{
            "type": "SUBSCRIBED",
            "subscribed": {
                "framework_info": {
                    "name": "marathon",
                    "capabilities": [{"type": "TASK_KILLING_STATE"}]
                },
                "container_id": {"value": "executor-container"},
                "agent_info": {"hostname": "worker-1"}
            }
        }"#;

        let event: Event = serde_json::from_str(json).unwrap();
        let Event::Subscribed { subscribed } = event else {
            panic!("expected SUBSCRIBED, got {:?}", event);
        };

        assert_eq!(subscribed.container_id.value, "executor-container");
        assert!(subscribed
            .framework_info
            .has_capability(CapabilityKind::TaskKillingState));
    }

    #[test]
    fn test_shutdown_event_wire_form() {
        let event: Event = serde_json::from_str(r#"{"type": "SHUTDOWN"}"#).unwrap();
        assert_eq!(event, Event::Shutdown);
    }

    #[test]
    fn test_unknown_event_kind_tolerated() {
        let event: Event = serde_json::from_str(r#"{"type": "HEARTBEAT"}"#).unwrap();
        assert_eq!(event, Event::Unknown);
        assert_eq!(event.kind(), "UNKNOWN");
    }

    #[test]
    fn test_kill_without_policy_is_absent() {
        let json = r#"{"type": "KILL", "kill": {"task_id": "t1"}}"#;
        let event: Event = serde_json::from_str(json).unwrap();
        let Event::Kill { kill } = event else {
            panic!("expected KILL");
        };
        assert!(kill.kill_policy.is_none());
    }

    #[test]
    fn test_subscribe_call_flattens_kind() {
        let call = Call {
            framework_id: FrameworkId::from("fw"),
            executor_id: ExecutorId::from("exec"),
            kind: CallKind::Subscribe {
                subscribe: Subscribe::default(),
            },
        };

        let json = serde_json::to_string(&call).unwrap();
        assert!(json.contains("\"type\":\"SUBSCRIBE\""));
        assert!(json.contains("\"framework_id\":\"fw\""));

        let parsed: Call = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, call);
    }

    #[test]
    fn test_framework_capability_list() {
        let info = FrameworkInfo {
            name: String::new(),
            capabilities: vec![FrameworkCapability {
                kind: CapabilityKind::PartitionAware,
            }],
        };
        assert!(!info.has_capability(CapabilityKind::TaskKillingState));
    }
}
