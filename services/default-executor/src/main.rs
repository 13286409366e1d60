//! Default task-group executor entry point.
//!
//! The agent prepares the environment (`MESOS_*`) and starts this binary
//! inside the executor's container. It exits zero on clean termination
//! (shutdown requested, or every child container reaped) and non-zero on a
//! configuration or fatal runtime error.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mesos_default_executor::actor;
use mesos_default_executor::client::{Endpoint, EventStream, ExecutorChannel, HttpAgent};
use mesos_default_executor::config::{Config, Flags};
use mesos_default_executor::{Executor, ExecutorSettings, MailboxSink};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let flags = Flags::parse();
    let config = Config::from_env(flags).context("invalid executor environment")?;

    info!(
        framework_id = %config.framework_id,
        executor_id = %config.executor_id,
        agent = %config.agent,
        "Starting default executor"
    );

    let endpoint = Endpoint::new(config.agent.clone(), config.authorization_header.clone());

    let container_ip = mesos_default_executor::client::local_ip_toward(&endpoint)
        .context("failed to determine container IP")?;

    let settings = ExecutorSettings {
        framework_id: config.framework_id,
        executor_id: config.executor_id,
        sandbox_directory: config.sandbox_directory,
        launcher_dir: config.launcher_dir,
        container_ip,
    };

    let api = Arc::new(HttpAgent::new(endpoint.clone())?);

    let (handle, mailbox) = actor::channel(1024);

    // The stream feeds connection transitions and decoded events into the
    // actor's mailbox; the actor sends SUBSCRIBE/UPDATE back through it.
    let channel = EventStream::spawn(endpoint, Arc::new(MailboxSink(handle.clone())));

    let executor = Executor::new(
        settings,
        api,
        Arc::clone(&channel) as Arc<dyn ExecutorChannel>,
        handle,
    );

    actor::spawn(executor, mailbox)
        .await
        .context("executor actor panicked")?
        .context("executor failed")?;

    info!("Executor terminated");
    Ok(())
}
