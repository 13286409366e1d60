//! Agent-API calls for the nested-container lifecycle.
//!
//! These are posted as separate HTTP requests against the agent endpoint,
//! outside the subscription stream: `LAUNCH_NESTED_CONTAINER` (pipelined at
//! group launch), `WAIT_NESTED_CONTAINER` (long-poll, one per child), and
//! `KILL_NESTED_CONTAINER` (signal delivery).

use serde::{Deserialize, Serialize};

use crate::ids::ContainerId;
use crate::task::{CommandInfo, ContainerInfo};

/// A call against the agent API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Call {
    LaunchNestedContainer {
        launch_nested_container: LaunchNestedContainer,
    },
    WaitNestedContainer {
        wait_nested_container: WaitNestedContainer,
    },
    KillNestedContainer {
        kill_nested_container: KillNestedContainer,
    },
}

impl Call {
    /// Protocol name of the call kind, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Call::LaunchNestedContainer { .. } => "LAUNCH_NESTED_CONTAINER",
            Call::WaitNestedContainer { .. } => "WAIT_NESTED_CONTAINER",
            Call::KillNestedContainer { .. } => "KILL_NESTED_CONTAINER",
        }
    }

    #[must_use]
    pub fn wait(container_id: ContainerId) -> Self {
        Call::WaitNestedContainer {
            wait_nested_container: WaitNestedContainer { container_id },
        }
    }

    #[must_use]
    pub fn kill(container_id: ContainerId, signal: i32) -> Self {
        Call::KillNestedContainer {
            kill_nested_container: KillNestedContainer {
                container_id,
                signal,
            },
        }
    }
}

/// Launch a child container nested under the executor's own container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchNestedContainer {
    pub container_id: ContainerId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerInfo>,
}

/// Long-poll that completes when the child container exits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitNestedContainer {
    pub container_id: ContainerId,
}

/// Deliver a signal to a child container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillNestedContainer {
    pub container_id: ContainerId,
    pub signal: i32,
}

/// A response body from the agent API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Response {
    WaitNestedContainer {
        wait_nested_container: WaitNestedContainerResponse,
    },
}

impl Response {
    /// The wait result, if this is a wait response.
    #[must_use]
    pub fn wait_nested_container(&self) -> &WaitNestedContainerResponse {
        match self {
            Response::WaitNestedContainer {
                wait_nested_container,
            } => wait_nested_container,
        }
    }
}

/// Wait result. `exit_status` is a raw POSIX wait status; it is absent when
/// the agent could not observe the container's exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitNestedContainerResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_call_wire_form() {
        let call = Call::kill(ContainerId::new("c1"), 15);
        let json = serde_json::to_string(&call).unwrap();

        assert!(json.contains("\"type\":\"KILL_NESTED_CONTAINER\""));
        assert!(json.contains("\"signal\":15"));
    }

    #[test]
    fn test_wait_response_roundtrip() {
        let json = r#"{
            "type": "WAIT_NESTED_CONTAINER",
            "wait_nested_container": {"exit_status": 0}
        }"#;

        let response: Response = serde_json::from_str(json).unwrap();
        assert_eq!(response.wait_nested_container().exit_status, Some(0));
    }

    #[test]
    fn test_wait_response_absent_exit_status() {
        let json = r#"{
            "type": "WAIT_NESTED_CONTAINER",
            "wait_nested_container": {}
        }"#;

        let response: Response = serde_json::from_str(json).unwrap();
        assert_eq!(response.wait_nested_container().exit_status, None);
    }

    #[test]
    fn test_launch_call_omits_absent_fields() {
        let call = Call::LaunchNestedContainer {
            launch_nested_container: LaunchNestedContainer {
                container_id: ContainerId::new("c1"),
                command: None,
                container: None,
            },
        };

        let json = serde_json::to_string(&call).unwrap();
        assert!(!json.contains("\"command\""));
        assert!(!json.contains("\"container\":"));
    }
}
