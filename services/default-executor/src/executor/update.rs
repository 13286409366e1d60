//! Status-update construction, buffering, and the check/health adapters.
//!
//! Every outbound update gets a fresh UUID and is buffered until the
//! scheduler acknowledges it; the buffer is replayed on every resubscribe.
//! Check and health results are layered onto the task's last forwarded
//! status so attachments survive, with only the UUID, timestamp, reason,
//! and the new result replaced.

use tracing::{debug, info};

use mesos_proto::executor::{CallKind, Update};
use mesos_proto::status::{
    CheckStatusInfo, ContainerStatus, StatusReason, StatusSource, TaskHealthStatus, TaskState,
    TaskStatus,
};
use mesos_proto::{TaskId, UpdateId};

use super::{ConnectionState, Executor};

impl Executor {
    /// Builds a status update from scratch for a live task. For checked
    /// tasks the `check_status` field is always populated with the right
    /// variant, even before the first check result exists.
    pub(crate) fn create_task_status(
        &self,
        task_id: &TaskId,
        state: TaskState,
        reason: Option<StatusReason>,
        message: Option<String>,
    ) -> TaskStatus {
        let container = self
            .containers
            .get(task_id)
            .expect("status updates are only created for live tasks");

        TaskStatus {
            task_id: task_id.clone(),
            state,
            uuid: UpdateId::new(),
            timestamp: now_secs(),
            executor_id: self.settings.executor_id.clone(),
            source: StatusSource::SourceExecutor,
            reason,
            message,
            healthy: None,
            check_status: container
                .task_info
                .check
                .as_ref()
                .map(|check| CheckStatusInfo::placeholder(check.kind)),
            container_status: Some(ContainerStatus {
                container_id: container.container_id.clone(),
            }),
        }
    }

    /// Buffers the update for replay-until-acknowledged, records it as the
    /// task's latest status, and sends it to the agent.
    pub(crate) fn forward(&mut self, status: TaskStatus) {
        let update = Update {
            status: status.clone(),
        };

        self.unacknowledged_updates.push((status.uuid, update.clone()));

        let container = self
            .containers
            .get_mut(&status.task_id)
            .expect("status updates are only forwarded for live tasks");
        container.last_task_status = Some(status);

        let call = self.executor_call(CallKind::Update { update });
        self.channel.send(call);
    }

    // -------------------------------------------------------------------------
    // Check adapter
    // -------------------------------------------------------------------------

    pub(super) fn task_check_updated(&mut self, task_id: TaskId, check_status: CheckStatusInfo) {
        // A result may race the reaping of its container; nothing may
        // follow a terminal update.
        let Some(container) = self.containers.get(&task_id) else {
            debug!(task_id = %task_id, "Received check update for terminated task; ignoring");
            return;
        };

        // The checker is dropped when the kill starts; a queued result
        // behind the kill must not escape either.
        if container.checker.is_none() {
            debug!(task_id = %task_id, "Received check update for terminating task; ignoring");
            return;
        }

        info!(task_id = %task_id, "Received check update");

        let base = container
            .last_task_status
            .clone()
            .expect("TASK_RUNNING precedes any check update");

        let mut status = layered(base, StatusReason::ReasonTaskCheckStatusUpdated);
        status.check_status = Some(check_status);

        self.forward(status);
    }

    pub(super) fn task_health_updated(&mut self, health: TaskHealthStatus) {
        if self.state == ConnectionState::Disconnected {
            debug!(
                task_id = %health.task_id,
                "Ignoring task health update while disconnected from the agent"
            );
            return;
        }

        let Some(container) = self.containers.get(&health.task_id) else {
            debug!(
                task_id = %health.task_id,
                "Received task health update for terminated task; ignoring"
            );
            return;
        };

        if container.health_checker.is_none() {
            debug!(
                task_id = %health.task_id,
                "Received task health update for terminating task; ignoring"
            );
            return;
        }

        info!(
            task_id = %health.task_id,
            healthy = health.healthy,
            "Received task health update"
        );

        let base = container
            .last_task_status
            .clone()
            .expect("TASK_RUNNING precedes any health update");

        let mut status = layered(base, StatusReason::ReasonTaskHealthCheckStatusUpdated);
        status.healthy = Some(health.healthy);

        self.forward(status);

        if health.kill_task {
            self.unhealthy = true;
            self.kill_task(health.task_id, None);
        }
    }
}

/// Re-stamps a previous status as a new update, preserving its attachments.
fn layered(mut base: TaskStatus, reason: StatusReason) -> TaskStatus {
    base.uuid = UpdateId::new();
    base.timestamp = now_secs();
    base.reason = Some(reason);
    base
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::super::tests::{harness, subscribed_event, Harness};
    use super::*;
    use mesos_proto::executor::{Event, LaunchGroup};
    use mesos_proto::status::TcpCheckStatus;
    use mesos_proto::task::{
        CheckInfo, CheckKind, TaskGroupInfo, TaskInfo, TcpCheck,
    };
    use nix::sys::signal::Signal;

    fn checked_task(id: &str) -> TaskInfo {
        TaskInfo {
            task_id: id.into(),
            name: id.to_string(),
            command: None,
            container: None,
            resources: Vec::new(),
            check: Some(CheckInfo {
                kind: CheckKind::Tcp,
                command: None,
                http: None,
                // A port with nothing behind it: probes fail but stay quiet
                // long enough for the assertions below.
                tcp: Some(TcpCheck { port: 59993 }),
                delay_seconds: 3600.0,
                interval_seconds: 3600.0,
                timeout_seconds: 1.0,
            }),
            health_check: None,
            kill_policy: None,
        }
    }

    async fn launch_checked(h: &mut Harness) {
        h.executor.connected();
        h.executor.received(subscribed_event(vec![])).await;
        h.executor
            .received(Event::LaunchGroup {
                launch_group: LaunchGroup {
                    task_group: TaskGroupInfo {
                        tasks: vec![checked_task("t1")],
                    },
                },
            })
            .await;
        h.pump().await;
        assert_eq!(h.executor.live_tasks().len(), 1);
    }

    fn tcp_result(succeeded: bool) -> CheckStatusInfo {
        let mut status = CheckStatusInfo::placeholder(CheckKind::Tcp);
        status.tcp = Some(TcpCheckStatus {
            succeeded: Some(succeeded),
        });
        status
    }

    #[tokio::test]
    async fn test_running_update_carries_check_placeholder() {
        let mut h = harness();
        launch_checked(&mut h).await;

        let statuses = h.channel.statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, TaskState::TaskRunning);

        let check_status = statuses[0].check_status.as_ref().unwrap();
        assert_eq!(check_status.kind, CheckKind::Tcp);
        assert_eq!(check_status.tcp, Some(TcpCheckStatus { succeeded: None }));
    }

    #[tokio::test]
    async fn test_forwarded_updates_buffer_until_acknowledged() {
        let mut h = harness();
        launch_checked(&mut h).await;

        assert_eq!(h.executor.unacknowledged_updates.len(), 1);
        let uuid = h.executor.unacknowledged_updates[0].0;

        h.executor.acknowledge("t1".into(), uuid);
        assert!(h.executor.unacknowledged_updates.is_empty());
        assert!(h.executor.containers[&TaskId::from("t1")].acknowledged);
    }

    #[tokio::test]
    async fn test_check_update_layers_on_last_status() {
        let mut h = harness();
        launch_checked(&mut h).await;

        let running_uuid = h.channel.statuses()[0].uuid;

        h.executor.task_check_updated("t1".into(), tcp_result(true));

        let statuses = h.channel.statuses();
        assert_eq!(statuses.len(), 2);

        let layered = &statuses[1];
        assert_eq!(layered.state, TaskState::TaskRunning);
        assert_ne!(layered.uuid, running_uuid);
        assert_eq!(
            layered.reason,
            Some(StatusReason::ReasonTaskCheckStatusUpdated)
        );
        assert_eq!(
            layered.check_status.as_ref().unwrap().tcp,
            Some(TcpCheckStatus {
                succeeded: Some(true)
            })
        );
    }

    #[tokio::test]
    async fn test_check_update_for_unknown_task_is_dropped() {
        let mut h = harness();
        h.executor.connected();
        h.executor.received(subscribed_event(vec![])).await;

        h.executor.task_check_updated("ghost".into(), tcp_result(true));
        assert!(h.channel.statuses().is_empty());
    }

    #[tokio::test]
    async fn test_check_update_after_kill_is_dropped() {
        let mut h = harness();
        launch_checked(&mut h).await;

        // The kill drops the checker; a straggler result must not escape.
        let call = h.executor.kill_container(TaskId::from("t1"), None);
        h.executor.post_kill(call);

        let before = h.channel.statuses().len();
        h.executor.task_check_updated("t1".into(), tcp_result(false));
        assert_eq!(h.channel.statuses().len(), before);
    }

    #[tokio::test]
    async fn test_health_update_forwards_and_kills() {
        let mut h = harness();

        h.executor.connected();
        h.executor.received(subscribed_event(vec![])).await;

        let mut task = checked_task("t1");
        task.check = None;
        task.health_check = Some(mesos_proto::task::HealthCheckInfo {
            kind: CheckKind::Tcp,
            command: None,
            http: None,
            tcp: Some(TcpCheck { port: 59992 }),
            delay_seconds: 3600.0,
            interval_seconds: 3600.0,
            timeout_seconds: 1.0,
            consecutive_failures: 3,
            grace_period_seconds: 0.0,
        });

        h.executor
            .received(Event::LaunchGroup {
                launch_group: LaunchGroup {
                    task_group: TaskGroupInfo { tasks: vec![task] },
                },
            })
            .await;
        h.pump().await;

        let containers = h.mock.launched_containers();
        assert_eq!(containers.len(), 1);

        h.executor.task_health_updated(TaskHealthStatus {
            task_id: "t1".into(),
            healthy: false,
            kill_task: true,
        });

        // The health update is forwarded before the kill begins.
        let statuses = h.channel.statuses();
        let health_update = statuses
            .iter()
            .find(|s| s.reason == Some(StatusReason::ReasonTaskHealthCheckStatusUpdated))
            .unwrap();
        assert_eq!(health_update.healthy, Some(false));

        assert!(h.executor.unhealthy);
        assert!(h.executor.containers[&TaskId::from("t1")].killing);

        h.pump().await;
        let signals = h.mock.kill_signals(&containers[0].value);
        assert_eq!(signals, vec![Signal::SIGTERM as i32]);
    }

    #[tokio::test]
    async fn test_health_update_while_disconnected_is_dropped() {
        let mut h = harness();
        launch_checked(&mut h).await;
        h.executor.disconnected();

        let before = h.channel.statuses().len();
        h.executor.task_health_updated(TaskHealthStatus {
            task_id: "t1".into(),
            healthy: false,
            kill_task: false,
        });
        assert_eq!(h.channel.statuses().len(), before);
    }
}
