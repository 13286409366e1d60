//! Agent HTTP plumbing.
//!
//! Three channels connect the executor to its agent:
//!
//! - the subscription stream (`EventStream`): a long-lived streaming POST
//!   carrying `SUBSCRIBE` calls out and framed `Event` records back, with
//!   reconnection and backoff;
//! - dedicated connections (`AgentApi::connect`): one per purpose, namely
//!   the pipelined group launch and one long-poll `WAIT_NESTED_CONTAINER`
//!   per child container;
//! - one-shot calls (`AgentApi::call`): signal delivery and anything else
//!   that does not need a pinned connection.
//!
//! The seam traits keep the lifecycle engine independent of HTTP so tests
//! can drive it against the in-process mocks at the bottom of this module.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use mesos_proto::{agent, executor, recordio, CONTENT_TYPE};

/// HTTP status used by the agent while it is still recovering.
pub const SERVICE_UNAVAILABLE: u16 = 503;

/// Response to an agent call: the HTTP status and the raw body.
#[derive(Debug, Clone)]
pub struct CallResponse {
    pub code: u16,
    pub body: Bytes,
}

impl CallResponse {
    /// A body-less response with the given status.
    #[must_use]
    pub fn empty(code: u16) -> Self {
        Self {
            code,
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == 200
    }

    #[must_use]
    pub fn is_service_unavailable(&self) -> bool {
        self.code == SERVICE_UNAVAILABLE
    }

    /// Parses the body as an agent API response.
    pub fn parse(&self) -> Result<agent::Response> {
        serde_json::from_slice(&self.body).context("malformed agent response body")
    }
}

/// A dedicated connection to the agent API.
#[async_trait]
pub trait AgentConnection: Send + Sync {
    async fn call(&self, call: agent::Call) -> Result<CallResponse>;
}

/// Shared handle to a dedicated agent connection.
pub type Connection = Arc<dyn AgentConnection>;

/// Client-side view of the agent API.
#[async_trait]
pub trait AgentApi: Send + Sync {
    /// Opens a dedicated connection, surfacing connectivity errors eagerly.
    async fn connect(&self) -> Result<Connection>;

    /// Posts a call without a pinned connection.
    async fn call(&self, call: agent::Call) -> Result<CallResponse>;
}

/// Outbound half of the subscription channel.
pub trait ExecutorChannel: Send + Sync {
    /// Sends a call on the subscription channel. `SUBSCRIBE` (re)opens the
    /// event stream; `UPDATE` is posted alongside it. Delivery failures
    /// surface as a stream disconnect, not here.
    fn send(&self, call: executor::Call);
}

/// Sink for connection lifecycle transitions and decoded events.
pub trait EventSink: Send + Sync + 'static {
    fn connected(&self);
    fn disconnected(&self);
    fn event(&self, event: executor::Event);
}

/// Agent endpoint plus the credentials attached to every call.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: reqwest::Url,
    pub authorization: Option<String>,
}

impl Endpoint {
    #[must_use]
    pub fn new(url: reqwest::Url, authorization: Option<String>) -> Self {
        Self { url, authorization }
    }

    fn host_port(&self) -> Result<(String, u16)> {
        let host = self
            .url
            .host_str()
            .context("agent URL has no host")?
            .to_string();
        let port = self
            .url
            .port_or_known_default()
            .context("agent URL has no port")?;
        Ok((host, port))
    }
}

/// Determines the local IP address this host uses to reach the agent. The
/// executor exports it to tasks as their container IP.
pub fn local_ip_toward(endpoint: &Endpoint) -> Result<IpAddr> {
    let (host, port) = endpoint.host_port()?;

    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0))
        .or_else(|_| std::net::UdpSocket::bind(("::", 0)))
        .context("failed to bind probe socket")?;
    socket
        .connect((host.as_str(), port))
        .context("failed to route toward agent")?;

    Ok(socket.local_addr()?.ip())
}

// =============================================================================
// HTTP implementation
// =============================================================================

/// Agent API over HTTP.
pub struct HttpAgent {
    endpoint: Endpoint,
    client: reqwest::Client,
}

impl HttpAgent {
    pub fn new(endpoint: Endpoint) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { endpoint, client })
    }
}

#[async_trait]
impl AgentApi for HttpAgent {
    async fn connect(&self) -> Result<Connection> {
        let (host, port) = self.endpoint.host_port()?;

        // Surface unreachability now rather than on the first call; the
        // pooled client below only connects lazily.
        tokio::time::timeout(
            Duration::from_secs(10),
            tokio::net::TcpStream::connect((host.as_str(), port)),
        )
        .await
        .context("timed out connecting to agent")?
        .context("unable to establish connection with the agent")?;

        // Long-poll calls ride this connection, so no request timeout.
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(1)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Arc::new(HttpConnection {
            endpoint: self.endpoint.clone(),
            client,
        }))
    }

    async fn call(&self, call: agent::Call) -> Result<CallResponse> {
        post(&self.client, &self.endpoint, &call).await
    }
}

struct HttpConnection {
    endpoint: Endpoint,
    client: reqwest::Client,
}

#[async_trait]
impl AgentConnection for HttpConnection {
    async fn call(&self, call: agent::Call) -> Result<CallResponse> {
        post(&self.client, &self.endpoint, &call).await
    }
}

async fn post(
    client: &reqwest::Client,
    endpoint: &Endpoint,
    call: &agent::Call,
) -> Result<CallResponse> {
    let mut request = client
        .post(endpoint.url.clone())
        .header(reqwest::header::ACCEPT, CONTENT_TYPE)
        .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
        .json(call);

    if let Some(authorization) = &endpoint.authorization {
        request = request.header(reqwest::header::AUTHORIZATION, authorization);
    }

    let response = request
        .send()
        .await
        .with_context(|| format!("{} call failed", call.kind()))?;

    let code = response.status().as_u16();
    let body = response.bytes().await.context("failed to read body")?;

    Ok(CallResponse { code, body })
}

// =============================================================================
// Event stream
// =============================================================================

/// Owns the subscription stream to the agent.
///
/// A supervisor task establishes transport (with exponential backoff),
/// reports `connected`, then turns every outbound `SUBSCRIBE` into a fresh
/// streaming POST whose framed records are decoded and fed to the sink.
/// When the active stream breaks the supervisor reports `disconnected` and
/// starts over.
pub struct EventStream {
    endpoint: Endpoint,
    client: reqwest::Client,
    subscribe_tx: mpsc::UnboundedSender<executor::Call>,
}

impl EventStream {
    /// Spawns the stream supervisor and returns the outbound handle.
    pub fn spawn(endpoint: Endpoint, sink: Arc<dyn EventSink>) -> Arc<EventStream> {
        let (subscribe_tx, subscribe_rx) = mpsc::unbounded_channel();

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("default reqwest client");

        let stream = Arc::new(EventStream {
            endpoint: endpoint.clone(),
            client: client.clone(),
            subscribe_tx,
        });

        tokio::spawn(run_stream_supervisor(endpoint, client, sink, subscribe_rx));

        stream
    }
}

impl ExecutorChannel for EventStream {
    fn send(&self, call: executor::Call) {
        match call.kind {
            executor::CallKind::Subscribe { .. } => {
                // The supervisor turns this into a new streaming request.
                let _ = self.subscribe_tx.send(call);
            }
            executor::CallKind::Update { .. } => {
                let client = self.client.clone();
                let endpoint = self.endpoint.clone();
                tokio::spawn(async move {
                    if let Err(e) = post_executor_call(&client, &endpoint, &call).await {
                        warn!(error = %e, "Failed to post status update");
                    }
                });
            }
        }
    }
}

async fn post_executor_call(
    client: &reqwest::Client,
    endpoint: &Endpoint,
    call: &executor::Call,
) -> Result<()> {
    let mut request = client
        .post(endpoint.url.clone())
        .header(reqwest::header::ACCEPT, CONTENT_TYPE)
        .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
        .json(call);

    if let Some(authorization) = &endpoint.authorization {
        request = request.header(reqwest::header::AUTHORIZATION, authorization);
    }

    let response = request.send().await.context("executor call failed")?;
    if !response.status().is_success() {
        anyhow::bail!("executor call rejected with status {}", response.status());
    }

    Ok(())
}

async fn run_stream_supervisor(
    endpoint: Endpoint,
    client: reqwest::Client,
    sink: Arc<dyn EventSink>,
    mut subscribe_rx: mpsc::UnboundedReceiver<executor::Call>,
) {
    let backoff = crate::actor::BackoffPolicy::default();
    let mut attempt = 0u32;

    loop {
        // Establish transport before reporting connectivity.
        if let Err(e) = preflight(&endpoint).await {
            warn!(attempt, error = %e, "Unable to reach agent");
            tokio::time::sleep(backoff.delay(attempt)).await;
            attempt = attempt.saturating_add(1);
            continue;
        }

        attempt = 0;
        info!(url = %endpoint.url, "Connected to agent");
        sink.connected();

        let (failure_tx, mut failure_rx) = mpsc::channel::<String>(1);
        let mut active: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                maybe_call = subscribe_rx.recv() => {
                    match maybe_call {
                        Some(call) => {
                            // A new SUBSCRIBE supersedes the previous stream.
                            if let Some(task) = active.take() {
                                task.abort();
                            }
                            active = Some(tokio::spawn(stream_events(
                                client.clone(),
                                endpoint.clone(),
                                call,
                                Arc::clone(&sink),
                                failure_tx.clone(),
                            )));
                        }
                        None => {
                            // Executor dropped the channel; nothing left to do.
                            if let Some(task) = active.take() {
                                task.abort();
                            }
                            return;
                        }
                    }
                }
                Some(reason) = failure_rx.recv() => {
                    if let Some(task) = active.take() {
                        task.abort();
                    }
                    warn!(reason = %reason, "Subscription stream interrupted");
                    break;
                }
            }
        }

        sink.disconnected();
    }
}

async fn preflight(endpoint: &Endpoint) -> Result<()> {
    let (host, port) = endpoint.host_port()?;
    tokio::time::timeout(
        Duration::from_secs(10),
        tokio::net::TcpStream::connect((host.as_str(), port)),
    )
    .await
    .context("connect timed out")?
    .context("connect failed")?;
    Ok(())
}

async fn stream_events(
    client: reqwest::Client,
    endpoint: Endpoint,
    call: executor::Call,
    sink: Arc<dyn EventSink>,
    failure_tx: mpsc::Sender<String>,
) {
    let fail = |reason: String| {
        let failure_tx = failure_tx.clone();
        async move {
            let _ = failure_tx.send(reason).await;
        }
    };

    let mut request = client
        .post(endpoint.url.clone())
        .header(reqwest::header::ACCEPT, CONTENT_TYPE)
        .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
        .json(&call);

    if let Some(authorization) = &endpoint.authorization {
        request = request.header(reqwest::header::AUTHORIZATION, authorization);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            fail(format!("subscribe request failed: {e}")).await;
            return;
        }
    };

    if !response.status().is_success() {
        fail(format!("subscribe rejected with status {}", response.status())).await;
        return;
    }

    let mut decoder = recordio::Decoder::new();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                fail(format!("stream read failed: {e}")).await;
                return;
            }
        };

        decoder.feed(&chunk);

        loop {
            match decoder.next_record() {
                Ok(Some(record)) => match serde_json::from_slice::<executor::Event>(&record) {
                    Ok(event) => {
                        debug!(kind = event.kind(), "Decoded event");
                        sink.event(event);
                    }
                    Err(e) => {
                        error!(error = %e, "Undecodable event record");
                        fail(format!("undecodable event: {e}")).await;
                        return;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    fail(format!("corrupt event stream: {e}")).await;
                    return;
                }
            }
        }
    }

    fail("stream closed by agent".to_string()).await;
}

// =============================================================================
// Mocks
// =============================================================================

/// Scripted reply to a `WAIT_NESTED_CONTAINER` long-poll.
#[derive(Debug, Clone)]
pub enum WaitReply {
    Response { code: u16, exit_status: Option<i32> },
    TransportError,
}

#[derive(Default)]
struct MockState {
    calls: Vec<agent::Call>,
    connect_failures: u32,
    launch_code: Option<u16>,
    fail_kills: bool,
    wait_ready: std::collections::HashMap<String, std::collections::VecDeque<WaitReply>>,
    wait_waiters:
        std::collections::HashMap<String, std::collections::VecDeque<tokio::sync::oneshot::Sender<WaitReply>>>,
}

/// In-process agent for tests: records every call, lets tests script launch
/// responses, connect failures, and wait completions.
#[derive(Default)]
pub struct MockAgent {
    state: std::sync::Mutex<MockState>,
}

impl MockAgent {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the next `count` `connect()` attempts fail.
    pub fn fail_connects(&self, count: u32) {
        self.state.lock().unwrap().connect_failures = count;
    }

    /// Status code returned to `LAUNCH_NESTED_CONTAINER` calls (default 200).
    pub fn respond_to_launches(&self, code: u16) {
        self.state.lock().unwrap().launch_code = Some(code);
    }

    /// Makes `KILL_NESTED_CONTAINER` calls fail at the transport level.
    pub fn fail_kills(&self, fail: bool) {
        self.state.lock().unwrap().fail_kills = fail;
    }

    /// Completes (or scripts) the long-poll for a container. Waiters whose
    /// request was aborted (connection closed) are skipped.
    pub fn complete_wait(&self, container: &str, reply: WaitReply) {
        let mut state = self.state.lock().unwrap();
        if let Some(waiters) = state.wait_waiters.get_mut(container) {
            while let Some(waiter) = waiters.pop_front() {
                if waiter.send(reply.clone()).is_ok() {
                    return;
                }
            }
        }
        state
            .wait_ready
            .entry(container.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Reports a container exit with a raw wait status.
    pub fn exit(&self, container: &str, wait_status: i32) {
        self.complete_wait(
            container,
            WaitReply::Response {
                code: 200,
                exit_status: Some(wait_status),
            },
        );
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<agent::Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Container ids from `LAUNCH_NESTED_CONTAINER` calls, in launch order.
    pub fn launched_containers(&self) -> Vec<mesos_proto::ContainerId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                agent::Call::LaunchNestedContainer {
                    launch_nested_container,
                } => Some(launch_nested_container.container_id),
                _ => None,
            })
            .collect()
    }

    /// Signals delivered to a container, in order.
    pub fn kill_signals(&self, container: &str) -> Vec<i32> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                agent::Call::KillNestedContainer {
                    kill_nested_container,
                } if kill_nested_container.container_id.value == container => {
                    Some(kill_nested_container.signal)
                }
                _ => None,
            })
            .collect()
    }

    /// Containers with a parked long-poll waiter.
    pub fn waiting_containers(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .wait_waiters
            .iter()
            .filter(|(_, waiters)| !waiters.is_empty())
            .map(|(container, _)| container.clone())
            .collect()
    }

    async fn handle_call(&self, call: agent::Call) -> Result<CallResponse> {
        let waiter = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call.clone());

            match &call {
                agent::Call::LaunchNestedContainer { .. } => {
                    let code = state.launch_code.unwrap_or(200);
                    return Ok(CallResponse::empty(code));
                }
                agent::Call::KillNestedContainer { .. } => {
                    if state.fail_kills {
                        anyhow::bail!("kill transport failure");
                    }
                    return Ok(CallResponse::empty(200));
                }
                agent::Call::WaitNestedContainer {
                    wait_nested_container,
                } => {
                    let container = wait_nested_container.container_id.value.clone();
                    if let Some(reply) = state
                        .wait_ready
                        .get_mut(&container)
                        .and_then(|queue| queue.pop_front())
                    {
                        return wait_reply_to_response(reply);
                    }

                    let (tx, rx) = tokio::sync::oneshot::channel();
                    state
                        .wait_waiters
                        .entry(container)
                        .or_default()
                        .push_back(tx);
                    rx
                }
            }
        };

        match waiter.await {
            Ok(reply) => wait_reply_to_response(reply),
            // The mock was dropped; behave like a broken connection.
            Err(_) => anyhow::bail!("wait connection closed"),
        }
    }
}

fn wait_reply_to_response(reply: WaitReply) -> Result<CallResponse> {
    match reply {
        WaitReply::Response { code, exit_status } => {
            let body = serde_json::to_vec(&agent::Response::WaitNestedContainer {
                wait_nested_container: agent::WaitNestedContainerResponse { exit_status },
            })
            .expect("serializable response");
            Ok(CallResponse {
                code,
                body: Bytes::from(body),
            })
        }
        WaitReply::TransportError => anyhow::bail!("wait transport failure"),
    }
}

/// The mock is shared between the "api" and every "connection" it hands
/// out, so the `AgentApi` implementation lives on this wrapper.
pub struct SharedMockAgent(pub Arc<MockAgent>);

#[async_trait]
impl AgentApi for SharedMockAgent {
    async fn connect(&self) -> Result<Connection> {
        {
            let mut state = self.0.state.lock().unwrap();
            if state.connect_failures > 0 {
                state.connect_failures -= 1;
                anyhow::bail!("mock connect failure");
            }
        }
        Ok(Arc::new(MockConnection(Arc::clone(&self.0))))
    }

    async fn call(&self, call: agent::Call) -> Result<CallResponse> {
        self.0.handle_call(call).await
    }
}

struct MockConnection(Arc<MockAgent>);

#[async_trait]
impl AgentConnection for MockConnection {
    async fn call(&self, call: agent::Call) -> Result<CallResponse> {
        self.0.handle_call(call).await
    }
}

/// Captures outbound executor calls for assertions.
#[derive(Default)]
pub struct RecordingChannel {
    calls: std::sync::Mutex<Vec<executor::Call>>,
}

impl RecordingChannel {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<executor::Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Status updates sent so far, in order.
    pub fn statuses(&self) -> Vec<mesos_proto::status::TaskStatus> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call.kind {
                executor::CallKind::Update { update } => Some(update.status),
                _ => None,
            })
            .collect()
    }

    /// Subscription payloads sent so far, in order.
    pub fn subscribes(&self) -> Vec<executor::Subscribe> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call.kind {
                executor::CallKind::Subscribe { subscribe } => Some(subscribe),
                _ => None,
            })
            .collect()
    }
}

impl ExecutorChannel for RecordingChannel {
    fn send(&self, call: executor::Call) {
        self.calls.lock().unwrap().push(call);
    }
}
