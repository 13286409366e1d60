//! Long-poll waits on child containers, terminal status translation, and
//! task-group fate sharing.
//!
//! Each live child has one dedicated connection carrying a
//! `WAIT_NESTED_CONTAINER` long-poll that completes when the child exits.
//! Transient failures and 503s re-enter a delayed retry ladder (1 s before
//! reconnecting, 1 s more before reissuing the wait) so a recovering agent
//! is not hammered; any other failure is fatal. Results from a previous
//! connection epoch are dropped on arrival.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use mesos_proto::agent;
use mesos_proto::status::TaskState;
use mesos_proto::TaskId;

use crate::client::{CallResponse, Connection};
use crate::exit::ExitReason;

use super::{ConnectionId, ConnectionState, Executor, ExecutorMessage, Waiting, WAIT_RETRY_DELAY};

impl Executor {
    /// Opens a dedicated connection per task and starts the long-poll wait
    /// on each. Used after a successful group launch and again after every
    /// resubscription.
    pub(super) fn wait_on(&mut self, task_ids: Vec<TaskId>) {
        debug_assert_eq!(self.state, ConnectionState::Subscribed);
        debug_assert!(self.launched);

        let Some(connection_id) = self.connection_id else {
            return;
        };

        for task_id in task_ids {
            let api = Arc::clone(&self.api);
            let handle = self.handle.clone();

            tokio::spawn(async move {
                let connection = api.connect().await;
                let _ = handle
                    .send(ExecutorMessage::WaitConnected {
                        connection_id,
                        task_id,
                        connection,
                    })
                    .await;
            });
        }
    }

    pub(super) async fn wait_connected(
        &mut self,
        connection_id: ConnectionId,
        task_id: TaskId,
        connection: anyhow::Result<Connection>,
    ) {
        // The agent may have failed in the interim; waiting resumes once we
        // subscribe again.
        if self.is_stale(connection_id) {
            debug!("Ignoring the wait operation from a stale connection");
            return;
        }

        match connection {
            Ok(connection) => self.begin_wait(connection_id, task_id, connection),
            Err(e) => {
                error!(error = %e, "Unable to establish connection with the agent");
                self.terminate().await;
            }
        }
    }

    /// Stashes the connection and issues the long-poll.
    pub(super) fn begin_wait(
        &mut self,
        connection_id: ConnectionId,
        task_id: TaskId,
        connection: Connection,
    ) {
        if self.is_stale(connection_id) {
            debug!("Ignoring the wait operation from a stale connection");
            return;
        }

        let Some(container) = self.containers.get_mut(&task_id) else {
            debug!(task_id = %task_id, "Ignoring wait for a task that is no longer active");
            return;
        };

        info!(
            container_id = %container.container_id,
            task_id = %task_id,
            "Waiting for child container"
        );

        debug_assert!(container.waiting.is_none());

        let call = agent::Call::wait(container.container_id.clone());
        let handle = self.handle.clone();
        let request_task_id = task_id.clone();

        let request = tokio::spawn(async move {
            let outcome = connection.call(call).await;
            let _ = handle
                .send(ExecutorMessage::Waited {
                    connection_id,
                    task_id: request_task_id,
                    outcome,
                })
                .await;
        });

        let container = self
            .containers
            .get_mut(&task_id)
            .expect("checked above; the actor holds the map");
        container.waiting = Some(Waiting(request));
    }

    pub(super) async fn waited(
        &mut self,
        connection_id: ConnectionId,
        task_id: TaskId,
        outcome: anyhow::Result<CallResponse>,
    ) {
        if self.is_stale(connection_id) {
            debug!("Ignoring the waited callback from a stale connection");
            return;
        }

        let Some(container) = self.containers.get_mut(&task_id) else {
            debug!(task_id = %task_id, "Ignoring wait result for a task that is no longer active");
            return;
        };
        let container_id = container.container_id.clone();

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                // A network blip rather than an agent failure; reestablish
                // the connection.
                error!(
                    container_id = %container_id,
                    task_id = %task_id,
                    error = %e,
                    "Connection for waiting on child container interrupted"
                );
                self.retry_later(connection_id, task_id);
                return;
            }
        };

        if response.is_service_unavailable() {
            // The agent can still be recovering after a restart.
            warn!(
                container_id = %container_id,
                task_id = %task_id,
                "Agent unavailable while waiting on child container"
            );
            self.retry_later(connection_id, task_id);
            return;
        }

        if !response.is_ok() {
            error!(
                container_id = %container_id,
                task_id = %task_id,
                status = response.code,
                body = %String::from_utf8_lossy(&response.body),
                "Unexpected response waiting on child container"
            );
            self.terminate().await;
            return;
        }

        let wait = match response.parse() {
            Ok(parsed) => parsed,
            Err(e) => panic!("malformed WAIT_NESTED_CONTAINER response: {e}"),
        };
        let exit_status = wait.wait_nested_container().exit_status;

        let container = self
            .containers
            .get_mut(&task_id)
            .expect("checked above; the actor holds the map");

        // Stop the check engines before the terminal update so no check
        // result can trail it.
        if let Some(checker) = container.checker.take() {
            checker.pause();
        }
        if let Some(health_checker) = container.health_checker.take() {
            health_checker.pause();
        }
        container.waiting = None;

        let (task_state, message) = match exit_status {
            None => (TaskState::TaskFailed, None),
            Some(raw) => {
                let reason = ExitReason::from_raw(raw);
                let state = if reason.is_success() {
                    TaskState::TaskFinished
                } else if container.killing {
                    // Killed as a result of `killTask()` or `shutdown()`.
                    TaskState::TaskKilled
                } else {
                    TaskState::TaskFailed
                };
                (state, Some(format!("Command {reason}")))
            }
        };

        let killing_task_group = container.killing_task_group;
        let task_group = container.task_group.clone();

        let mut status = self.create_task_status(&task_id, task_state, None, message);
        if self.unhealthy {
            // The task group is going down because a health check failed.
            status.healthy = Some(false);
        }
        self.forward(status);

        self.containers.remove(&task_id);

        info!(
            container_id = %container_id,
            task_id = %task_id,
            state = %task_state,
            "Child container terminated"
        );

        // All children reaped: nothing left to supervise.
        if self.containers.is_empty() {
            self.terminate().await;
            return;
        }

        if self.shutting_down {
            return;
        }

        if killing_task_group {
            return;
        }

        // Fate sharing: a failed or killed sibling takes the rest of the
        // group down with it. Successful completion does not cascade.
        if matches!(task_state, TaskState::TaskFailed | TaskState::TaskKilled) {
            info!(
                tasks = ?task_group.task_ids(),
                "Killing task group"
            );

            for sibling in &task_group.tasks {
                let sibling_id = &sibling.task_id;
                if *sibling_id == task_id || !self.containers.contains_key(sibling_id) {
                    continue;
                }

                let sibling_container = self
                    .containers
                    .get_mut(sibling_id)
                    .expect("checked above; the actor holds the map");
                sibling_container.killing_task_group = true;

                if !sibling_container.killing {
                    let call = self.kill_container(sibling_id.clone(), None);
                    self.post_kill(call);
                }
            }
        }
    }

    /// Schedules the retry ladder: after the delay the connection is
    /// reestablished, then the wait is reissued after one more delay.
    fn retry_later(&mut self, connection_id: ConnectionId, task_id: TaskId) {
        if let Some(container) = self.containers.get_mut(&task_id) {
            if let Some(waiting) = container.waiting.take() {
                waiting.close();
            }
        }

        self.handle.send_after(
            WAIT_RETRY_DELAY,
            ExecutorMessage::RetryWait {
                connection_id,
                task_id,
            },
        );
    }

    pub(super) fn retry_wait(&mut self, connection_id: ConnectionId, task_id: TaskId) {
        if self.is_stale(connection_id) {
            debug!("Ignoring retry attempt from a stale connection");
            return;
        }

        let api = Arc::clone(&self.api);
        let handle = self.handle.clone();

        tokio::spawn(async move {
            let connection = api.connect().await;
            let _ = handle
                .send(ExecutorMessage::RetryConnected {
                    connection_id,
                    task_id,
                    connection,
                })
                .await;
        });
    }

    pub(super) fn retry_connected(
        &mut self,
        connection_id: ConnectionId,
        task_id: TaskId,
        connection: anyhow::Result<Connection>,
    ) {
        if self.is_stale(connection_id) {
            debug!("Ignoring retry attempt from a stale connection");
            return;
        }

        match connection {
            Ok(connection) => {
                let Some(container) = self.containers.get(&task_id) else {
                    debug!(task_id = %task_id, "Dropping retry for a task that is no longer active");
                    return;
                };

                info!(
                    container_id = %container.container_id,
                    task_id = %task_id,
                    delay = ?WAIT_RETRY_DELAY,
                    "Established connection; retrying the wait after a delay"
                );

                // The agent might still be recovering; waiting before the
                // call avoids a tight 503 loop.
                self.handle.send_after(
                    WAIT_RETRY_DELAY,
                    ExecutorMessage::BeginWait {
                        connection_id,
                        task_id,
                        connection,
                    },
                );
            }
            Err(e) => {
                error!(
                    task_id = %task_id,
                    error = %e,
                    delay = ?WAIT_RETRY_DELAY,
                    "Unable to establish connection for waiting on child container; retrying"
                );

                self.handle.send_after(
                    WAIT_RETRY_DELAY,
                    ExecutorMessage::RetryWait {
                        connection_id,
                        task_id,
                    },
                );
            }
        }
    }
}
