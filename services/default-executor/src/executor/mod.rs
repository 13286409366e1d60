//! The task-group lifecycle engine.
//!
//! One actor owns all executor state. Stimuli arrive as messages: decoded
//! agent events, connection transitions, timer expirations, HTTP
//! completions, and check results. Each handler runs to completion before
//! the next message is dequeued, so no handler ever observes partial state.
//!
//! ## Connection epochs
//!
//! Every `connected` transition assigns a fresh `connection_id`. Callbacks
//! spawned against the agent capture the epoch they were issued under and
//! are dropped on arrival if the executor has reconnected since; results of
//! pre-reconnect calls can never mutate post-reconnect state.
//!
//! ## Submodules
//!
//! - `launch`: atomic task-group launch (`LAUNCH_GROUP`)
//! - `reap`: long-poll waits, terminal statuses, fate sharing
//! - `kill`: SIGTERM, grace period, SIGKILL escalation, and shutdown
//! - `update`: status-update construction, buffering, and check adapters

mod kill;
mod launch;
mod reap;
mod update;

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use mesos_proto::define_token;
use mesos_proto::executor::{Call, CallKind, Event, Subscribe, Update};
use mesos_proto::status::{CheckStatusInfo, TaskHealthStatus, TaskStatus};
use mesos_proto::task::{FrameworkInfo, TaskGroupInfo, TaskInfo};
use mesos_proto::{ContainerId, ExecutorId, FrameworkId, TaskId, UpdateId};

use crate::actor::{Actor, ActorContext, ActorError, ActorHandle};
use crate::checks::{Checker, HealthChecker};
use crate::client::{AgentApi, CallResponse, Connection, EventSink, ExecutorChannel};

define_token!(ConnectionId);

/// Environment variable exporting the container IP to each task.
pub const MESOS_CONTAINER_IP: &str = "MESOS_CONTAINER_IP";

/// Interval between `SUBSCRIBE` attempts while connected but unsubscribed.
const SUBSCRIPTION_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Delay before reconnecting a failed wait, and again before reissuing the
/// wait call on the fresh connection.
const WAIT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Grace given to in-flight terminal updates before the process exits.
const TERMINATION_GRACE: Duration = Duration::from_secs(1);

/// Signal escalation default when neither the kill event nor the task
/// carries a kill policy.
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(3);

/// Connection state toward the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No subscription stream.
    Disconnected,
    /// Stream open, subscription not yet confirmed.
    Connected,
    /// Subscription confirmed.
    Subscribed,
}

/// Immutable executor identity and paths.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub framework_id: FrameworkId,
    pub executor_id: ExecutorId,
    pub sandbox_directory: PathBuf,
    pub launcher_dir: PathBuf,

    /// IP address this host uses toward the agent; exported to tasks as
    /// `MESOS_CONTAINER_IP`.
    pub container_ip: IpAddr,
}

/// Messages handled by the executor actor.
pub enum ExecutorMessage {
    /// Subscription transport established.
    Connected,

    /// Subscription transport lost.
    Disconnected,

    /// Decoded event from the subscription stream.
    Event(Event),

    /// Periodic `SUBSCRIBE` retry while connected but unsubscribed.
    SubscribeTick,

    /// Dedicated launch connection attempt finished.
    LaunchConnected {
        task_group: TaskGroupInfo,
        connection: anyhow::Result<Connection>,
    },

    /// All pipelined `LAUNCH_NESTED_CONTAINER` calls finished.
    LaunchResponses {
        task_group: TaskGroupInfo,
        container_ids: Vec<ContainerId>,
        responses: anyhow::Result<Vec<CallResponse>>,
    },

    /// Dedicated wait connection attempt finished (initial wait path).
    WaitConnected {
        connection_id: ConnectionId,
        task_id: TaskId,
        connection: anyhow::Result<Connection>,
    },

    /// Delayed retry entry point after a transient wait failure.
    RetryWait {
        connection_id: ConnectionId,
        task_id: TaskId,
    },

    /// Reconnection attempt for a retried wait finished.
    RetryConnected {
        connection_id: ConnectionId,
        task_id: TaskId,
        connection: anyhow::Result<Connection>,
    },

    /// Issue the `WAIT_NESTED_CONTAINER` long-poll on a fresh connection.
    BeginWait {
        connection_id: ConnectionId,
        task_id: TaskId,
        connection: Connection,
    },

    /// A long-poll wait completed (or failed).
    Waited {
        connection_id: ConnectionId,
        task_id: TaskId,
        outcome: anyhow::Result<CallResponse>,
    },

    /// Kill grace period expired; escalate to SIGKILL.
    Escalated {
        connection_id: ConnectionId,
        container_id: ContainerId,
        task_id: TaskId,
        grace: Duration,
    },

    /// The collective SIGTERM delivery during shutdown failed.
    GroupKillFailed { error: String },

    /// Result change reported by a task's checker.
    CheckUpdated {
        task_id: TaskId,
        status: CheckStatusInfo,
    },

    /// Verdict reported by a task's health checker.
    HealthUpdated { health: TaskHealthStatus },
}

impl fmt::Debug for ExecutorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorMessage::Connected => write!(f, "Connected"),
            ExecutorMessage::Disconnected => write!(f, "Disconnected"),
            ExecutorMessage::Event(event) => write!(f, "Event({})", event.kind()),
            ExecutorMessage::SubscribeTick => write!(f, "SubscribeTick"),
            ExecutorMessage::LaunchConnected {
                task_group,
                connection,
            } => f
                .debug_struct("LaunchConnected")
                .field("tasks", &task_group.tasks.len())
                .field("connected", &connection.is_ok())
                .finish(),
            ExecutorMessage::LaunchResponses {
                container_ids,
                responses,
                ..
            } => f
                .debug_struct("LaunchResponses")
                .field("containers", &container_ids.len())
                .field("ready", &responses.is_ok())
                .finish(),
            ExecutorMessage::WaitConnected {
                task_id,
                connection,
                ..
            } => f
                .debug_struct("WaitConnected")
                .field("task_id", task_id)
                .field("connected", &connection.is_ok())
                .finish(),
            ExecutorMessage::RetryWait { task_id, .. } => {
                f.debug_struct("RetryWait").field("task_id", task_id).finish()
            }
            ExecutorMessage::RetryConnected {
                task_id,
                connection,
                ..
            } => f
                .debug_struct("RetryConnected")
                .field("task_id", task_id)
                .field("connected", &connection.is_ok())
                .finish(),
            ExecutorMessage::BeginWait { task_id, .. } => {
                f.debug_struct("BeginWait").field("task_id", task_id).finish()
            }
            ExecutorMessage::Waited {
                task_id, outcome, ..
            } => f
                .debug_struct("Waited")
                .field("task_id", task_id)
                .field("ready", &outcome.is_ok())
                .finish(),
            ExecutorMessage::Escalated {
                task_id, grace, ..
            } => f
                .debug_struct("Escalated")
                .field("task_id", task_id)
                .field("grace", grace)
                .finish(),
            ExecutorMessage::GroupKillFailed { error } => f
                .debug_struct("GroupKillFailed")
                .field("error", error)
                .finish(),
            ExecutorMessage::CheckUpdated { task_id, .. } => f
                .debug_struct("CheckUpdated")
                .field("task_id", task_id)
                .finish(),
            ExecutorMessage::HealthUpdated { health } => f
                .debug_struct("HealthUpdated")
                .field("task_id", &health.task_id)
                .field("healthy", &health.healthy)
                .finish(),
        }
    }
}

/// One launched task and its child container.
pub(crate) struct ContainerRecord {
    pub(crate) container_id: ContainerId,
    pub(crate) task_info: TaskInfo,

    /// Full group the task belongs to, for fate sharing.
    pub(crate) task_group: TaskGroupInfo,

    /// Template for layered check/health updates.
    pub(crate) last_task_status: Option<TaskStatus>,

    pub(crate) checker: Option<Checker>,
    pub(crate) health_checker: Option<HealthChecker>,

    /// In-flight `WAIT_NESTED_CONTAINER` long-poll; present only while
    /// subscribed.
    pub(crate) waiting: Option<Waiting>,

    /// Whether any status update for this task has been acknowledged.
    pub(crate) acknowledged: bool,

    pub(crate) killing: bool,
    pub(crate) killing_task_group: bool,
}

/// An in-flight long-poll request. The spawned request task owns its
/// dedicated connection; closing aborts the request and drops the
/// connection with it.
pub(crate) struct Waiting(JoinHandle<()>);

impl Waiting {
    pub(crate) fn close(self) {
        self.0.abort();
    }
}

/// The executor actor.
pub struct Executor {
    pub(crate) settings: ExecutorSettings,
    pub(crate) api: Arc<dyn AgentApi>,
    pub(crate) channel: Arc<dyn ExecutorChannel>,
    pub(crate) handle: ActorHandle<ExecutorMessage>,

    pub(crate) state: ConnectionState,
    pub(crate) connection_id: Option<ConnectionId>,

    pub(crate) framework_info: Option<FrameworkInfo>,
    pub(crate) executor_container_id: Option<ContainerId>,

    pub(crate) launched: bool,
    pub(crate) shutting_down: bool,

    /// Latched when any task is killed by a failing health check; terminal
    /// updates then carry `healthy = false`.
    pub(crate) unhealthy: bool,

    /// Set once the actor has decided to stop; flips the run loop off after
    /// the current message.
    pub(crate) terminating: bool,

    /// Status updates awaiting acknowledgement, in forwarding order.
    pub(crate) unacknowledged_updates: Vec<(UpdateId, Update)>,

    /// Live child containers by task id.
    pub(crate) containers: BTreeMap<TaskId, ContainerRecord>,
}

impl Executor {
    pub fn new(
        settings: ExecutorSettings,
        api: Arc<dyn AgentApi>,
        channel: Arc<dyn ExecutorChannel>,
        handle: ActorHandle<ExecutorMessage>,
    ) -> Self {
        Self {
            settings,
            api,
            channel,
            handle,
            state: ConnectionState::Disconnected,
            connection_id: None,
            framework_info: None,
            executor_container_id: None,
            launched: false,
            shutting_down: false,
            unhealthy: false,
            terminating: false,
            unacknowledged_updates: Vec::new(),
            containers: BTreeMap::new(),
        }
    }

    /// Current connection state, for tests and introspection.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    /// Task ids with live child containers.
    #[must_use]
    pub fn live_tasks(&self) -> Vec<TaskId> {
        self.containers.keys().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Connection manager
    // -------------------------------------------------------------------------

    fn connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.connection_id = Some(ConnectionId::new());

        self.subscribe_tick();
    }

    fn disconnected(&mut self) {
        info!("Disconnected from agent");

        self.state = ConnectionState::Disconnected;
        self.connection_id = None;

        // Close every wait long-poll; they are reissued after resubscription.
        for container in self.containers.values_mut() {
            if let Some(waiting) = container.waiting.take() {
                waiting.close();
            }
        }

        // Pause all checks and health checks.
        for container in self.containers.values() {
            if let Some(checker) = &container.checker {
                checker.pause();
            }
            if let Some(health_checker) = &container.health_checker {
                health_checker.pause();
            }
        }
    }

    /// Returns true when a captured epoch no longer matches, i.e. the
    /// callback belongs to a previous connection and must be dropped.
    pub(crate) fn is_stale(&self, connection_id: ConnectionId) -> bool {
        self.connection_id != Some(connection_id)
    }

    // -------------------------------------------------------------------------
    // Subscription loop
    // -------------------------------------------------------------------------

    fn subscribe_tick(&mut self) {
        // Stop once subscribed; while disconnected the stream-level
        // reconnect takes over and a fresh `Connected` restarts the loop.
        if self.state != ConnectionState::Connected {
            return;
        }

        let subscribe = Subscribe {
            unacknowledged_updates: self
                .unacknowledged_updates
                .iter()
                .map(|(_, update)| update.clone())
                .collect(),
            // Terminated-and-reaped tasks are not replayed: their wait call
            // succeeded, so the agent already knows about them.
            unacknowledged_tasks: self
                .containers
                .values()
                .filter(|container| !container.acknowledged)
                .map(|container| container.task_info.clone())
                .collect(),
        };

        self.channel.send(self.executor_call(CallKind::Subscribe { subscribe }));

        self.handle
            .send_after(SUBSCRIPTION_RETRY_INTERVAL, ExecutorMessage::SubscribeTick);
    }

    pub(crate) fn executor_call(&self, kind: CallKind) -> Call {
        Call {
            framework_id: self.settings.framework_id.clone(),
            executor_id: self.settings.executor_id.clone(),
            kind,
        }
    }

    // -------------------------------------------------------------------------
    // Event dispatcher
    // -------------------------------------------------------------------------

    async fn received(&mut self, event: Event) {
        info!(kind = event.kind(), "Received event");

        match event {
            Event::Subscribed { subscribed } => {
                if let Some(agent_info) = &subscribed.agent_info {
                    info!(hostname = %agent_info.hostname, "Subscribed executor");
                }

                self.framework_info = Some(subscribed.framework_info);
                self.executor_container_id = Some(subscribed.container_id);
                self.state = ConnectionState::Subscribed;

                // The agent may have failed after the children were
                // launched; resume waiting on them.
                if self.launched {
                    let task_ids = self.live_tasks();
                    self.wait_on(task_ids);
                }

                for container in self.containers.values() {
                    if let Some(checker) = &container.checker {
                        checker.resume();
                    }
                    if let Some(health_checker) = &container.health_checker {
                        health_checker.resume();
                    }
                }
            }

            Event::Launch { .. } => {
                // A single-task launch never goes to the task-group executor.
                error!("LAUNCH event is not supported");
                self.shutdown().await;
            }

            Event::LaunchGroup { launch_group } => {
                self.launch_group(launch_group.task_group).await;
            }

            Event::Kill { kill } => {
                self.kill_task(kill.task_id, kill.kill_policy);
            }

            Event::Acknowledged { acknowledged } => {
                self.acknowledge(acknowledged.task_id, acknowledged.uuid);
            }

            Event::Shutdown => {
                self.shutdown().await;
            }

            Event::Message { .. } => {}

            Event::Error { error } => {
                error!(message = %error.message, "Error from agent");
            }

            Event::Unknown => {
                warn!("Received an UNKNOWN event and ignored");
            }
        }
    }

    fn acknowledge(&mut self, task_id: TaskId, uuid: UpdateId) {
        let before = self.unacknowledged_updates.len();
        self.unacknowledged_updates.retain(|(id, _)| *id != uuid);

        if self.unacknowledged_updates.len() == before {
            warn!(%uuid, "Received acknowledgement for unknown status update");
            return;
        }

        // An acknowledgement may arrive after the task has been reaped;
        // only live tasks carry the replay bit.
        if let Some(container) = self.containers.get_mut(&task_id) {
            container.acknowledged = true;
        }
    }

    // -------------------------------------------------------------------------
    // Termination
    // -------------------------------------------------------------------------

    /// Final exit: give in-flight terminal updates a moment on the wire,
    /// then stop the actor.
    ///
    /// TODO(reap): replace the fixed drain with an explicit wait for the
    /// acknowledgement of the last terminal update.
    pub(crate) async fn terminate(&mut self) {
        if self.terminating {
            return;
        }

        info!(grace = ?TERMINATION_GRACE, "Terminating");

        tokio::time::sleep(TERMINATION_GRACE).await;
        self.terminating = true;
    }
}

#[async_trait]
impl Actor for Executor {
    type Message = ExecutorMessage;

    fn name(&self) -> &str {
        "default-executor"
    }

    async fn handle(
        &mut self,
        msg: ExecutorMessage,
        _ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        match msg {
            ExecutorMessage::Connected => self.connected(),
            ExecutorMessage::Disconnected => self.disconnected(),
            ExecutorMessage::Event(event) => self.received(event).await,
            ExecutorMessage::SubscribeTick => self.subscribe_tick(),

            ExecutorMessage::LaunchConnected {
                task_group,
                connection,
            } => self.launch_connected(task_group, connection).await,

            ExecutorMessage::LaunchResponses {
                task_group,
                container_ids,
                responses,
            } => {
                self.launch_responses(task_group, container_ids, responses)
                    .await?
            }

            ExecutorMessage::WaitConnected {
                connection_id,
                task_id,
                connection,
            } => self.wait_connected(connection_id, task_id, connection).await,

            ExecutorMessage::RetryWait {
                connection_id,
                task_id,
            } => self.retry_wait(connection_id, task_id),

            ExecutorMessage::RetryConnected {
                connection_id,
                task_id,
                connection,
            } => self.retry_connected(connection_id, task_id, connection),

            ExecutorMessage::BeginWait {
                connection_id,
                task_id,
                connection,
            } => self.begin_wait(connection_id, task_id, connection),

            ExecutorMessage::Waited {
                connection_id,
                task_id,
                outcome,
            } => self.waited(connection_id, task_id, outcome).await,

            ExecutorMessage::Escalated {
                connection_id,
                container_id,
                task_id,
                grace,
            } => self.escalated(connection_id, container_id, task_id, grace),

            ExecutorMessage::GroupKillFailed { error } => {
                self.group_kill_failed(error).await;
            }

            ExecutorMessage::CheckUpdated { task_id, status } => {
                self.task_check_updated(task_id, status);
            }

            ExecutorMessage::HealthUpdated { health } => {
                self.task_health_updated(health);
            }
        }

        Ok(!self.terminating)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        info!(
            live_tasks = self.containers.len(),
            unacknowledged = self.unacknowledged_updates.len(),
            "Executor stopping"
        );
    }
}

/// Bridges the event stream into the executor mailbox.
pub struct MailboxSink(pub ActorHandle<ExecutorMessage>);

impl EventSink for MailboxSink {
    fn connected(&self) {
        if self.0.try_send(ExecutorMessage::Connected).is_err() {
            warn!("Dropping connected transition: executor mailbox unavailable");
        }
    }

    fn disconnected(&self) {
        if self.0.try_send(ExecutorMessage::Disconnected).is_err() {
            warn!("Dropping disconnected transition: executor mailbox unavailable");
        }
    }

    fn event(&self, event: Event) {
        debug!(kind = event.kind(), "Queueing event");
        if self.0.try_send(ExecutorMessage::Event(event)).is_err() {
            warn!("Dropping event: executor mailbox unavailable");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::{MockAgent, RecordingChannel, SharedMockAgent};
    use mesos_proto::executor::Subscribed;
    use mesos_proto::task::{CapabilityKind, FrameworkCapability};

    pub(crate) struct Harness {
        pub(crate) executor: Executor,
        pub(crate) mock: Arc<MockAgent>,
        pub(crate) channel: Arc<RecordingChannel>,
        mailbox: crate::actor::Mailbox<ExecutorMessage>,
        _sandbox: tempfile::TempDir,
    }

    impl Harness {
        /// Feeds queued mailbox messages through the handler until the
        /// mailbox stays quiet, driving spawned I/O round trips to
        /// completion.
        pub(crate) async fn pump(&mut self) {
            let mut ctx = ActorContext {
                actor_id: "default-executor".to_string(),
                messages_processed: 0,
                last_message_at: None,
            };

            while let Ok(Some(msg)) = tokio::time::timeout(
                Duration::from_millis(100),
                self.mailbox.recv(),
            )
            .await
            {
                let _ = self.executor.handle(msg, &mut ctx).await;
            }
        }
    }

    pub(crate) fn harness() -> Harness {
        let mock = MockAgent::new();
        let channel = RecordingChannel::new();
        let (handle, mailbox) = crate::actor::channel(1024);
        let sandbox = tempfile::tempdir().expect("temp sandbox");

        let settings = ExecutorSettings {
            framework_id: "framework".into(),
            executor_id: "default".into(),
            sandbox_directory: sandbox.path().to_path_buf(),
            launcher_dir: PathBuf::from("/tmp"),
            container_ip: "127.0.0.1".parse().unwrap(),
        };

        let executor = Executor::new(
            settings,
            Arc::new(SharedMockAgent(Arc::clone(&mock))),
            Arc::clone(&channel) as Arc<dyn ExecutorChannel>,
            handle,
        );

        Harness {
            executor,
            mock,
            channel,
            mailbox,
            _sandbox: sandbox,
        }
    }

    pub(crate) fn subscribed_event(capabilities: Vec<CapabilityKind>) -> Event {
        Event::Subscribed {
            subscribed: Subscribed {
                framework_info: FrameworkInfo {
                    name: "framework".to_string(),
                    capabilities: capabilities
                        .into_iter()
                        .map(|kind| FrameworkCapability { kind })
                        .collect(),
                },
                container_id: ContainerId::new("executor-container"),
                agent_info: None,
            },
        }
    }

    #[tokio::test]
    async fn test_connected_assigns_fresh_epoch() {
        let mut h = harness();

        h.executor.connected();
        let first = h.executor.connection_id.unwrap();
        assert_eq!(h.executor.connection_state(), ConnectionState::Connected);

        h.executor.disconnected();
        assert!(h.executor.connection_id.is_none());
        assert_eq!(
            h.executor.connection_state(),
            ConnectionState::Disconnected
        );

        h.executor.connected();
        let second = h.executor.connection_id.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_subscribe_sent_while_connected() {
        let mut h = harness();

        h.executor.connected();

        let subscribes = h.channel.subscribes();
        assert_eq!(subscribes.len(), 1);
        assert!(subscribes[0].unacknowledged_updates.is_empty());
        assert!(subscribes[0].unacknowledged_tasks.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_stops_once_subscribed() {
        let mut h = harness();

        h.executor.connected();
        h.executor.received(subscribed_event(vec![])).await;
        assert_eq!(h.executor.connection_state(), ConnectionState::Subscribed);

        let before = h.channel.subscribes().len();
        h.executor.subscribe_tick();
        assert_eq!(h.channel.subscribes().len(), before);
    }

    #[tokio::test]
    async fn test_subscribed_populates_identity() {
        let mut h = harness();

        h.executor.connected();
        h.executor
            .received(subscribed_event(vec![CapabilityKind::TaskKillingState]))
            .await;

        assert_eq!(
            h.executor.executor_container_id.as_ref().unwrap().value,
            "executor-container"
        );
        assert!(h
            .executor
            .framework_info
            .as_ref()
            .unwrap()
            .has_capability(CapabilityKind::TaskKillingState));
    }

    #[tokio::test]
    async fn test_ack_for_unknown_uuid_is_ignored() {
        let mut h = harness();

        h.executor.acknowledge("t1".into(), UpdateId::new());
        assert!(h.executor.unacknowledged_updates.is_empty());
    }

    #[tokio::test]
    async fn test_stale_epoch_detection() {
        let mut h = harness();

        h.executor.connected();
        let epoch = h.executor.connection_id.unwrap();
        assert!(!h.executor.is_stale(epoch));

        h.executor.disconnected();
        h.executor.connected();
        assert!(h.executor.is_stale(epoch));
    }

    #[tokio::test]
    async fn test_message_event_is_noop() {
        let mut h = harness();

        h.executor.connected();
        h.executor
            .received(Event::Message {
                message: mesos_proto::executor::Message {
                    data: "opaque".to_string(),
                },
            })
            .await;

        assert!(!h.executor.shutting_down);
        assert!(h.channel.statuses().is_empty());
    }
}
