//! Task and task-group termination.
//!
//! A kill delivers SIGTERM, then escalates to SIGKILL once the grace period
//! expires without the child exiting. The grace period comes from the kill
//! event when it carries one, else from the task's own kill policy, else a
//! 3 s default. Shutdown kills every container concurrently and fails fast
//! to termination when the agent cannot be reached.

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tracing::{debug, error, info, warn};

use mesos_proto::agent;
use mesos_proto::status::TaskState;
use mesos_proto::task::{CapabilityKind, KillPolicy, TaskInfo};
use mesos_proto::{ContainerId, TaskId};

use super::{ConnectionState, Executor, ExecutorMessage, DEFAULT_KILL_GRACE};

impl Executor {
    /// Handles a `KILL` event from the scheduler.
    pub(super) fn kill_task(&mut self, task_id: TaskId, kill_policy: Option<KillPolicy>) {
        if self.shutting_down {
            warn!(
                task_id = %task_id,
                "Ignoring kill for task since the executor is shutting down"
            );
            return;
        }

        info!(task_id = %task_id, "Received kill for task");

        if !self.containers.contains_key(&task_id) {
            warn!(task_id = %task_id, "Ignoring kill for task as it is no longer active");
            return;
        }

        if self.containers[&task_id].killing {
            // The first kill's grace period keeps running; it is not reset.
            warn!(
                task_id = %task_id,
                "Ignoring kill for task as it is in the process of getting killed"
            );
            return;
        }

        let call = self.kill_container(task_id, kill_policy);
        self.post_kill(call);
    }

    /// Marks a container as being killed, silences its check engines,
    /// schedules the SIGKILL escalation, and returns the SIGTERM call for
    /// the caller to deliver.
    ///
    /// The caller must ensure the task is live and not already `killing`.
    pub(super) fn kill_container(
        &mut self,
        task_id: TaskId,
        kill_policy: Option<KillPolicy>,
    ) -> agent::Call {
        debug_assert_eq!(self.state, ConnectionState::Subscribed);

        let container = self
            .containers
            .get_mut(&task_id)
            .expect("kill_container requires a live task");

        debug_assert!(!container.killing);
        container.killing = true;

        // No check or health updates once the task is being killed.
        if let Some(checker) = container.checker.take() {
            checker.pause();
        }
        if let Some(health_checker) = container.health_checker.take() {
            health_checker.pause();
        }

        let grace = grace_period(kill_policy.as_ref(), &container.task_info);
        let container_id = container.container_id.clone();

        info!(
            task_id = %task_id,
            container_id = %container_id,
            "Killing task running in child container with SIGTERM signal"
        );
        info!(grace = ?grace, "Scheduling escalation to SIGKILL");

        if let Some(connection_id) = self.connection_id {
            self.handle.send_after(
                grace,
                ExecutorMessage::Escalated {
                    connection_id,
                    container_id: container_id.clone(),
                    task_id: task_id.clone(),
                    grace,
                },
            );
        }

        // Frameworks that understand the transient state get told the kill
        // has started.
        if self
            .framework_info
            .as_ref()
            .is_some_and(|info| info.has_capability(CapabilityKind::TaskKillingState))
        {
            let status = self.create_task_status(&task_id, TaskState::TaskKilling, None, None);
            self.forward(status);
        }

        agent::Call::kill(container_id, Signal::SIGTERM as i32)
    }

    /// Delivers a signal call in the background; only transport failures
    /// are worth noting, the agent owns the container's fate from here.
    pub(super) fn post_kill(&self, call: agent::Call) {
        let api = Arc::clone(&self.api);
        tokio::spawn(async move {
            if let Err(e) = api.call(call).await {
                warn!(error = %e, "Failed to deliver signal to child container");
            }
        });
    }

    /// Grace period expired without the child exiting.
    pub(super) fn escalated(
        &mut self,
        connection_id: super::ConnectionId,
        container_id: ContainerId,
        task_id: TaskId,
        grace: Duration,
    ) {
        if self.is_stale(connection_id) {
            debug!("Ignoring signal escalation timeout from a stale connection");
            return;
        }

        // The container may have terminated while the timer was pending.
        if !self.containers.contains_key(&task_id) {
            warn!(
                task_id = %task_id,
                container_id = %container_id,
                "Ignoring escalation to SIGKILL since the task has already terminated"
            );
            return;
        }

        info!(
            task_id = %task_id,
            container_id = %container_id,
            grace = ?grace,
            "Task did not terminate within the grace period, sending SIGKILL to the container"
        );

        self.post_kill(agent::Call::kill(container_id, Signal::SIGKILL as i32));
    }

    /// Handles a `SHUTDOWN` event, `LAUNCH` misdelivery, or an illegal
    /// second launch: kill everything, then terminate.
    pub(super) async fn shutdown(&mut self) {
        if self.shutting_down {
            warn!("Ignoring shutdown since it is in progress");
            return;
        }

        info!("Shutting down");
        self.shutting_down = true;

        if !self.launched {
            self.terminate().await;
            return;
        }

        // The agent may have asked us to shut down before we resubscribed;
        // without a subscription there is nothing left to kill through.
        if self.state != ConnectionState::Subscribed {
            self.terminate().await;
            return;
        }

        let task_ids: Vec<TaskId> = self
            .containers
            .iter()
            .filter(|(_, container)| !container.killing)
            .map(|(task_id, _)| task_id.clone())
            .collect();

        let mut calls = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            calls.push(self.kill_container(task_id, None));
        }

        // Deliver all SIGTERMs concurrently; if the agent is down we fail
        // fast instead of waiting out every grace period.
        let api = Arc::clone(&self.api);
        let handle = self.handle.clone();

        tokio::spawn(async move {
            let results = futures::future::join_all(calls.into_iter().map(|call| {
                let api = Arc::clone(&api);
                async move { api.call(call).await }
            }))
            .await;

            if let Some(error) = results.into_iter().find_map(|result| result.err()) {
                let _ = handle
                    .send(ExecutorMessage::GroupKillFailed {
                        error: error.to_string(),
                    })
                    .await;
            }
        });
    }

    pub(super) async fn group_kill_failed(&mut self, error: String) {
        error!(
            error = %error,
            "Unable to complete the operation of killing child containers"
        );
        self.terminate().await;
    }
}

/// Kill-policy precedence: the kill event's policy overrides the task's,
/// which overrides the default.
fn grace_period(kill_policy: Option<&KillPolicy>, task: &TaskInfo) -> Duration {
    kill_policy
        .and_then(|policy| policy.grace_period)
        .or_else(|| task.kill_policy.as_ref().and_then(|policy| policy.grace_period))
        .map(|grace| grace.as_duration())
        .unwrap_or(DEFAULT_KILL_GRACE)
}

#[cfg(test)]
mod tests {
    use super::super::tests::{harness, subscribed_event};
    use super::*;
    use mesos_proto::task::DurationInfo;

    fn task_with_policy(id: &str, grace_secs: Option<u64>) -> TaskInfo {
        TaskInfo {
            task_id: id.into(),
            name: id.to_string(),
            command: None,
            container: None,
            resources: Vec::new(),
            check: None,
            health_check: None,
            kill_policy: grace_secs.map(|secs| KillPolicy {
                grace_period: Some(DurationInfo::from_secs(secs)),
            }),
        }
    }

    #[test]
    fn test_grace_period_default() {
        let task = task_with_policy("t1", None);
        assert_eq!(grace_period(None, &task), DEFAULT_KILL_GRACE);
    }

    #[test]
    fn test_grace_period_from_task_policy() {
        let task = task_with_policy("t1", Some(5));
        assert_eq!(grace_period(None, &task), Duration::from_secs(5));
    }

    #[test]
    fn test_grace_period_event_overrides_task_policy() {
        let task = task_with_policy("t1", Some(5));
        let event_policy = KillPolicy {
            grace_period: Some(DurationInfo::from_secs(10)),
        };
        assert_eq!(
            grace_period(Some(&event_policy), &task),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_grace_period_event_without_grace_falls_back() {
        let task = task_with_policy("t1", Some(5));
        let event_policy = KillPolicy { grace_period: None };
        assert_eq!(
            grace_period(Some(&event_policy), &task),
            Duration::from_secs(5)
        );
    }

    #[tokio::test]
    async fn test_kill_unknown_task_is_noop() {
        let mut h = harness();
        h.executor.connected();
        h.executor.received(subscribed_event(vec![])).await;

        h.executor.kill_task("ghost".into(), None);
        assert!(h.mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_kill_while_shutting_down_is_noop() {
        let mut h = harness();
        h.executor.connected();
        h.executor.received(subscribed_event(vec![])).await;
        h.executor.shutting_down = true;

        h.executor.kill_task("t1".into(), None);
        assert!(h.mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_before_launch_terminates() {
        let mut h = harness();
        h.executor.connected();
        h.executor.received(subscribed_event(vec![])).await;

        h.executor.shutdown().await;

        assert!(h.executor.shutting_down);
        assert!(h.executor.terminating);
    }

    #[tokio::test]
    async fn test_shutdown_while_unsubscribed_terminates() {
        let mut h = harness();
        h.executor.launched = true;

        h.executor.shutdown().await;

        assert!(h.executor.terminating);
    }

    async fn launch_single(h: &mut super::super::tests::Harness) -> String {
        h.executor.connected();
        h.executor.received(subscribed_event(vec![])).await;

        h.executor.launched = true;
        h.executor
            .launch_responses(
                mesos_proto::task::TaskGroupInfo {
                    tasks: vec![task_with_policy("t1", None)],
                },
                vec![mesos_proto::ContainerId::new("c1")],
                Ok(vec![crate::client::CallResponse::empty(200)]),
            )
            .await
            .unwrap();

        "c1".to_string()
    }

    #[tokio::test]
    async fn test_second_kill_does_not_reset_grace() {
        let mut h = harness();
        let container = launch_single(&mut h).await;

        h.executor.kill_task("t1".into(), None);
        assert!(h.executor.containers[&TaskId::from("t1")].killing);

        // A repeated kill is ignored outright; the first grace period keeps
        // running and no second SIGTERM goes out.
        h.executor.kill_task("t1".into(), None);

        h.pump().await;
        assert_eq!(
            h.mock.kill_signals(&container),
            vec![Signal::SIGTERM as i32]
        );
    }

    #[tokio::test]
    async fn test_shutdown_kill_failure_fast_fails() {
        let mut h = harness();
        let _container = launch_single(&mut h).await;
        h.mock.fail_kills(true);

        h.executor.shutdown().await;
        assert!(!h.executor.terminating);

        // The collective SIGTERM delivery fails; the executor terminates
        // instead of waiting out the grace periods.
        h.pump().await;
        assert!(h.executor.terminating);
    }

    #[tokio::test]
    async fn test_second_shutdown_is_ignored() {
        let mut h = harness();
        h.executor.connected();
        h.executor.received(subscribed_event(vec![])).await;

        h.executor.shutdown().await;
        let terminating = h.executor.terminating;

        h.executor.shutdown().await;
        assert_eq!(h.executor.terminating, terminating);
    }
}
