//! Atomic task-group launch.
//!
//! A `LAUNCH_GROUP` opens one dedicated connection, pipelines a
//! `LAUNCH_NESTED_CONTAINER` call per task over it, and awaits all responses
//! together. Any partial failure shuts the executor down; no partial group
//! ever runs. On success every task gets its container record, its checkers,
//! its sandbox symlink, and a `TASK_RUNNING` update, and the reaper starts
//! waiting on every child.

use std::sync::Arc;

use tracing::{error, info, warn};

use mesos_proto::agent;
use mesos_proto::status::TaskState;
use mesos_proto::task::{
    ContainerInfo, Environment, EnvironmentVariable, SandboxPath, SandboxPathKind, TaskGroupInfo,
    TaskInfo, Volume, VolumeSource,
};
use mesos_proto::ContainerId;

use crate::actor::ActorError;
use crate::checks::{Checker, HealthChecker};
use crate::client::{CallResponse, Connection};
use crate::sandbox;

use super::{
    ConnectionState, ContainerRecord, Executor, ExecutorMessage, MESOS_CONTAINER_IP,
};

impl Executor {
    pub(super) async fn launch_group(&mut self, task_group: TaskGroupInfo) {
        if self.launched {
            // The agent hands a task-group executor exactly one group; a
            // second launch would break the fate-sharing accounting.
            error!("Received a LAUNCH_GROUP event but a task group is already running");
            self.shutdown().await;
            return;
        }

        debug_assert_eq!(self.state, ConnectionState::Subscribed);
        self.launched = true;

        let api = Arc::clone(&self.api);
        let handle = self.handle.clone();

        tokio::spawn(async move {
            let connection = api.connect().await;
            let _ = handle
                .send(ExecutorMessage::LaunchConnected {
                    task_group,
                    connection,
                })
                .await;
        });
    }

    pub(super) async fn launch_connected(
        &mut self,
        task_group: TaskGroupInfo,
        connection: anyhow::Result<Connection>,
    ) {
        if self.shutting_down {
            // The shutdown raced the launch before any container existed;
            // there is nothing to kill, so finish terminating here.
            warn!("Abandoning the launch operation as the executor is shutting down");
            self.terminate().await;
            return;
        }

        let connection = match connection {
            Ok(connection) => connection,
            Err(e) => {
                error!(error = %e, "Unable to establish connection with the agent");
                self.terminate().await;
                return;
            }
        };

        // The agent may have failed after the connection was established.
        if self.state != ConnectionState::Subscribed {
            error!(
                state = ?self.state,
                "Unable to complete the launch operation in the current state"
            );
            self.terminate().await;
            return;
        }

        let parent = self
            .executor_container_id
            .clone()
            .expect("subscribed state implies an executor container id");

        // Tasks learn their address from the IP this host uses toward the
        // agent, which shares the container's network namespace.
        let container_ip = EnvironmentVariable {
            name: MESOS_CONTAINER_IP.to_string(),
            value: self.settings.container_ip.to_string(),
        };

        info!(ip = %container_ip.value, "Setting 'MESOS_CONTAINER_IP'");

        let mut container_ids = Vec::with_capacity(task_group.tasks.len());
        let mut calls = Vec::with_capacity(task_group.tasks.len());

        for task in &task_group.tasks {
            let container_id = ContainerId::child_of(&parent);
            calls.push(agent::Call::LaunchNestedContainer {
                launch_nested_container: build_launch_call(
                    task,
                    container_id.clone(),
                    &container_ip,
                ),
            });
            container_ids.push(container_id);
        }

        let handle = self.handle.clone();

        tokio::spawn(async move {
            // Pipelined over the one connection; responses are collected
            // together so the group launch stays all-or-nothing.
            let responses = futures::future::try_join_all(calls.into_iter().map(|call| {
                let connection = Arc::clone(&connection);
                async move { connection.call(call).await }
            }))
            .await;

            let _ = handle
                .send(ExecutorMessage::LaunchResponses {
                    task_group,
                    container_ids,
                    responses,
                })
                .await;
        });
    }

    pub(super) async fn launch_responses(
        &mut self,
        task_group: TaskGroupInfo,
        container_ids: Vec<ContainerId>,
        responses: anyhow::Result<Vec<CallResponse>>,
    ) -> Result<(), ActorError> {
        if self.shutting_down {
            // As above: no container record was ever created for the group,
            // so the shutdown path has nothing to wait for.
            warn!("Abandoning the launch operation as the executor is shutting down");
            self.terminate().await;
            return Ok(());
        }

        let responses = match responses {
            Ok(responses) => responses,
            Err(e) => {
                error!(
                    error = %e,
                    "Unable to receive a response from the agent for the \
                     LAUNCH_NESTED_CONTAINER calls"
                );
                self.terminate().await;
                return Ok(());
            }
        };

        if let Some(failure) = responses.iter().find(|response| !response.is_ok()) {
            error!(
                status = failure.code,
                body = %String::from_utf8_lossy(&failure.body),
                "Received failure while launching child container"
            );
            self.terminate().await;
            return Ok(());
        }

        // The agent may have failed after the children were launched.
        if self.state != ConnectionState::Subscribed {
            error!(
                state = ?self.state,
                "Unable to complete the launch of child containers in the current state"
            );
            self.terminate().await;
            return Ok(());
        }

        debug_assert_eq!(container_ids.len(), task_group.tasks.len());

        for (task, container_id) in task_group.tasks.iter().zip(&container_ids) {
            let task_id = task.task_id.clone();

            let mut record = ContainerRecord {
                container_id: container_id.clone(),
                task_info: task.clone(),
                task_group: task_group.clone(),
                last_task_status: None,
                checker: None,
                health_checker: None,
                waiting: None,
                acknowledged: false,
                killing: false,
                killing_task_group: false,
            };

            if let Some(check) = &task.check {
                let handle = self.handle.clone();
                let callback_task_id = task_id.clone();

                let checker = Checker::spawn(
                    check.clone(),
                    &self.settings.launcher_dir,
                    move |status| {
                        let _ = handle.try_send(ExecutorMessage::CheckUpdated {
                            task_id: callback_task_id.clone(),
                            status,
                        });
                    },
                );

                match checker {
                    Ok(checker) => record.checker = Some(checker),
                    Err(e) => {
                        error!(task_id = %task_id, error = %e, "Failed to create checker");
                        self.terminate().await;
                        return Ok(());
                    }
                }
            }

            if let Some(health_check) = &task.health_check {
                let handle = self.handle.clone();

                let health_checker = HealthChecker::spawn(
                    health_check.clone(),
                    &self.settings.launcher_dir,
                    task_id.clone(),
                    move |health| {
                        let _ = handle.try_send(ExecutorMessage::HealthUpdated { health });
                    },
                );

                match health_checker {
                    Ok(health_checker) => record.health_checker = Some(health_checker),
                    Err(e) => {
                        error!(task_id = %task_id, error = %e, "Failed to create health checker");
                        self.terminate().await;
                        return Ok(());
                    }
                }
            }

            if let Err(e) = sandbox::link_task_sandbox(
                &self.settings.sandbox_directory,
                &task_id,
                container_id,
            ) {
                error!(
                    task_id = %task_id,
                    container_id = %container_id,
                    error = %e,
                    "Unable to create symbolic link into the container sandbox"
                );
                return Err(ActorError::Permanent(format!(
                    "sandbox setup failed for task '{task_id}': {e}"
                )));
            }

            self.containers.insert(task_id, record);
        }

        // The whole group is up; report every task running and start
        // reaping.
        for task in &task_group.tasks {
            let status = self.create_task_status(&task.task_id, TaskState::TaskRunning, None, None);
            self.forward(status);
        }

        info!(
            tasks = ?task_group.task_ids(),
            containers = ?container_ids.iter().map(|c| &c.value).collect::<Vec<_>>(),
            "Successfully launched tasks in child containers"
        );

        self.wait_on(task_group.task_ids());

        Ok(())
    }
}

/// Builds the launch call for one task: its command and container are
/// copied when present, each disk resource with a volume is re-exposed to
/// the child as a `SANDBOX_PATH` volume of the parent, and the container IP
/// is appended to the command environment.
fn build_launch_call(
    task: &TaskInfo,
    container_id: ContainerId,
    container_ip: &EnvironmentVariable,
) -> agent::LaunchNestedContainer {
    let mut command = task.command.clone().unwrap_or_default();
    let mut container = task.container.clone();

    for resource in &task.resources {
        let Some(volume) = resource.disk.as_ref().and_then(|disk| disk.volume.as_ref()) else {
            continue;
        };

        // Nested containers cannot carry their own disk resources; share
        // the parent sandbox volume into the child instead.
        let container = container.get_or_insert_with(ContainerInfo::mesos);
        container.volumes.push(Volume {
            mode: volume.mode,
            container_path: volume.container_path.clone(),
            source: Some(VolumeSource::SandboxPath {
                sandbox_path: SandboxPath {
                    kind: SandboxPathKind::Parent,
                    path: volume.container_path.clone(),
                },
            }),
        });
    }

    command
        .environment
        .get_or_insert_with(Environment::default)
        .variables
        .push(container_ip.clone());

    agent::LaunchNestedContainer {
        container_id,
        command: Some(command),
        container,
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{harness, subscribed_event};
    use super::*;
    use mesos_proto::task::{DiskInfo, Resource, VolumeMode};
    use mesos_proto::TaskId;

    fn ip_var() -> EnvironmentVariable {
        EnvironmentVariable {
            name: MESOS_CONTAINER_IP.to_string(),
            value: "10.0.0.7".to_string(),
        }
    }

    fn plain_task(id: &str) -> TaskInfo {
        TaskInfo {
            task_id: TaskId::from(id),
            name: id.to_string(),
            command: None,
            container: None,
            resources: Vec::new(),
            check: None,
            health_check: None,
            kill_policy: None,
        }
    }

    #[test]
    fn test_build_launch_always_exports_container_ip() {
        let task = plain_task("t1");
        let launch = build_launch_call(&task, ContainerId::new("c1"), &ip_var());

        let command = launch.command.unwrap();
        let variables = command.environment.unwrap().variables;
        assert_eq!(variables.len(), 1);
        assert_eq!(variables[0].name, MESOS_CONTAINER_IP);
        assert_eq!(variables[0].value, "10.0.0.7");

        // No volumes and no task container: the launch carries none either.
        assert!(launch.container.is_none());
    }

    #[test]
    fn test_build_launch_shares_parent_sandbox_volume() {
        let mut task = plain_task("t1");
        task.resources = vec![Resource {
            name: "disk".to_string(),
            scalar: None,
            disk: Some(DiskInfo {
                volume: Some(Volume {
                    mode: VolumeMode::Rw,
                    container_path: "data".to_string(),
                    source: None,
                }),
            }),
        }];

        let launch = build_launch_call(&task, ContainerId::new("c1"), &ip_var());

        // The task had no container, so an implicit MESOS one is created.
        let container = launch.container.unwrap();
        assert_eq!(container.kind, mesos_proto::task::ContainerKind::Mesos);
        assert_eq!(container.volumes.len(), 1);

        let volume = &container.volumes[0];
        assert_eq!(volume.container_path, "data");
        match volume.source.as_ref().unwrap() {
            VolumeSource::SandboxPath { sandbox_path } => {
                assert_eq!(sandbox_path.kind, SandboxPathKind::Parent);
                assert_eq!(sandbox_path.path, "data");
            }
        }
    }

    #[test]
    fn test_build_launch_ignores_resources_without_volumes() {
        let mut task = plain_task("t1");
        task.resources = vec![
            Resource {
                name: "cpus".to_string(),
                scalar: Some(mesos_proto::task::Scalar { value: 1.0 }),
                disk: None,
            },
            Resource {
                name: "disk".to_string(),
                scalar: Some(mesos_proto::task::Scalar { value: 64.0 }),
                disk: Some(DiskInfo { volume: None }),
            },
        ];

        let launch = build_launch_call(&task, ContainerId::new("c1"), &ip_var());
        assert!(launch.container.is_none());
    }

    #[tokio::test]
    async fn test_second_launch_group_shuts_down() {
        let mut h = harness();

        h.executor.connected();
        h.executor.received(subscribed_event(vec![])).await;

        h.executor.launched = true;
        h.executor
            .launch_group(TaskGroupInfo {
                tasks: vec![plain_task("t1")],
            })
            .await;

        assert!(h.executor.shutting_down);
    }

    #[tokio::test]
    async fn test_launch_aborts_when_shutting_down() {
        let mut h = harness();

        h.executor.connected();
        h.executor.received(subscribed_event(vec![])).await;
        h.executor.shutting_down = true;

        h.executor
            .launch_connected(
                TaskGroupInfo {
                    tasks: vec![plain_task("t1")],
                },
                Err(anyhow::anyhow!("unused")),
            )
            .await;

        // No container ever existed, so the launch path finishes the
        // shutdown itself.
        assert!(h.executor.terminating);
        assert!(h.executor.containers.is_empty());
    }

    #[tokio::test]
    async fn test_launch_response_failure_terminates() {
        let mut h = harness();

        h.executor.connected();
        h.executor.received(subscribed_event(vec![])).await;

        h.executor
            .launch_responses(
                TaskGroupInfo {
                    tasks: vec![plain_task("t1")],
                },
                vec![ContainerId::new("c1")],
                Ok(vec![CallResponse::empty(500)]),
            )
            .await
            .unwrap();

        assert!(h.executor.terminating);
        assert!(h.executor.containers.is_empty());
        assert!(h.channel.statuses().is_empty());
    }
}
