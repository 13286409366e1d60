//! Check and health-check probe engines.
//!
//! Each engine owns a background probe loop for one task. The executor holds
//! an opaque handle exposing `pause()` / `resume()`; dropping the handle
//! aborts the loop, so no callback can fire after the executor lets go of a
//! checker. Results are delivered through a callback that the executor wires
//! to its own mailbox, capturing only the task id.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use mesos_proto::status::{
    CheckStatusInfo, CommandCheckStatus, HttpCheckStatus, TaskHealthStatus, TcpCheckStatus,
};
use mesos_proto::task::{CheckInfo, CheckKind, CommandInfo, HealthCheckInfo};
use mesos_proto::TaskId;

/// Errors raised while constructing a probe engine.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("{kind:?} check is missing its {kind:?} definition")]
    MissingDefinition { kind: CheckKind },

    #[error("command check has no command value")]
    MissingCommand,
}

/// Probe engine for a general check. Results surface to the scheduler as
/// `CheckStatusInfo` attachments; they never affect the task's fate.
pub struct Checker {
    paused: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Checker {
    /// Validates the check definition and spawns the probe loop.
    pub fn spawn<F>(
        info: CheckInfo,
        launcher_dir: &Path,
        callback: F,
    ) -> Result<Self, CheckError>
    where
        F: Fn(CheckStatusInfo) + Send + Sync + 'static,
    {
        let probe = Probe::new(
            info.kind,
            info.command.as_ref().map(|c| c.command.clone()),
            info.http.as_ref().map(|h| (h.port, h.path.clone())),
            info.tcp.as_ref().map(|t| t.port),
            launcher_dir,
        )?;

        let (paused, paused_rx) = watch::channel(false);
        let kind = info.kind;
        let delay = secs(info.delay_seconds);
        let interval = secs(info.interval_seconds);
        let timeout = secs(info.timeout_seconds);

        let task = tokio::spawn(async move {
            run_check_loop(probe, kind, delay, interval, timeout, paused_rx, callback).await;
        });

        Ok(Self { paused, task })
    }

    /// Stops probing until `resume()` is called.
    pub fn pause(&self) {
        let _ = self.paused.send(true);
    }

    /// Resumes probing after a `pause()`.
    pub fn resume(&self) {
        let _ = self.paused.send(false);
    }
}

impl Drop for Checker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Probe engine for a health check. A failing health check past its
/// threshold asks the executor to kill the task.
pub struct HealthChecker {
    paused: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HealthChecker {
    /// Validates the health-check definition and spawns the probe loop.
    pub fn spawn<F>(
        info: HealthCheckInfo,
        launcher_dir: &Path,
        task_id: TaskId,
        callback: F,
    ) -> Result<Self, CheckError>
    where
        F: Fn(TaskHealthStatus) + Send + Sync + 'static,
    {
        let probe = Probe::new(
            info.kind,
            info.command.as_ref().map(|c| c.command.clone()),
            info.http.as_ref().map(|h| (h.port, h.path.clone())),
            info.tcp.as_ref().map(|t| t.port),
            launcher_dir,
        )?;

        let (paused, paused_rx) = watch::channel(false);
        let settings = HealthSettings {
            delay: secs(info.delay_seconds),
            interval: secs(info.interval_seconds),
            timeout: secs(info.timeout_seconds),
            consecutive_failures: info.consecutive_failures.max(1),
            grace_period: secs(info.grace_period_seconds),
        };

        let task = tokio::spawn(async move {
            run_health_loop(probe, settings, task_id, paused_rx, callback).await;
        });

        Ok(Self { paused, task })
    }

    /// Stops probing until `resume()` is called.
    pub fn pause(&self) {
        let _ = self.paused.send(true);
    }

    /// Resumes probing after a `pause()`.
    pub fn resume(&self) {
        let _ = self.paused.send(false);
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

// =============================================================================
// Probes
// =============================================================================

enum Probe {
    Command { command: CommandInfo, launcher_dir: PathBuf },
    Http { port: u16, path: Option<String> },
    Tcp { port: u16 },
}

enum ProbeOutcome {
    Command(Option<i32>),
    Http(Option<u16>),
    Tcp(bool),
}

impl Probe {
    fn new(
        kind: CheckKind,
        command: Option<CommandInfo>,
        http: Option<(u16, Option<String>)>,
        tcp: Option<u16>,
        launcher_dir: &Path,
    ) -> Result<Self, CheckError> {
        match kind {
            CheckKind::Command => {
                let command = command.ok_or(CheckError::MissingDefinition { kind })?;
                if command.value.is_none() {
                    return Err(CheckError::MissingCommand);
                }
                Ok(Probe::Command {
                    command,
                    launcher_dir: launcher_dir.to_path_buf(),
                })
            }
            CheckKind::Http => {
                let (port, path) = http.ok_or(CheckError::MissingDefinition { kind })?;
                Ok(Probe::Http { port, path })
            }
            CheckKind::Tcp => {
                let port = tcp.ok_or(CheckError::MissingDefinition { kind })?;
                Ok(Probe::Tcp { port })
            }
        }
    }

    async fn run(&self, timeout: Duration) -> ProbeOutcome {
        match self {
            Probe::Command {
                command,
                launcher_dir,
            } => ProbeOutcome::Command(run_command(command, launcher_dir, timeout).await),
            Probe::Http { port, path } => {
                ProbeOutcome::Http(probe_http(*port, path.as_deref(), timeout).await)
            }
            Probe::Tcp { port } => ProbeOutcome::Tcp(probe_tcp(*port, timeout).await),
        }
    }
}

impl ProbeOutcome {
    fn healthy(&self) -> bool {
        match self {
            ProbeOutcome::Command(exit_code) => *exit_code == Some(0),
            ProbeOutcome::Http(status) => {
                status.is_some_and(|code| (200u16..400).contains(&code))
            }
            ProbeOutcome::Tcp(succeeded) => *succeeded,
        }
    }

    fn into_check_status(self, kind: CheckKind) -> CheckStatusInfo {
        let mut status = CheckStatusInfo::placeholder(kind);
        match self {
            ProbeOutcome::Command(exit_code) => {
                status.command = Some(CommandCheckStatus { exit_code });
            }
            ProbeOutcome::Http(status_code) => {
                status.http = Some(HttpCheckStatus { status_code });
            }
            ProbeOutcome::Tcp(succeeded) => {
                status.tcp = Some(TcpCheckStatus {
                    succeeded: Some(succeeded),
                });
            }
        }
        status
    }
}

/// Runs a command probe; returns the exit code, or `None` on timeout, spawn
/// failure, or death by signal.
async fn run_command(
    command: &CommandInfo,
    launcher_dir: &Path,
    timeout: Duration,
) -> Option<i32> {
    let mut cmd = if command.shell {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command.value.as_deref().unwrap_or_default());
        cmd
    } else {
        let value = command.value.as_deref().unwrap_or_default();
        // Relative helper binaries resolve against the launcher directory.
        let program = if Path::new(value).is_absolute() {
            PathBuf::from(value)
        } else {
            launcher_dir.join(value)
        };
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(&command.arguments);
        cmd
    };

    cmd.stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(error = %e, "Failed to spawn check command");
            return None;
        }
    };

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            warn!(error = %e, "Failed to wait on check command");
            None
        }
        Err(_) => {
            debug!("Check command timed out");
            let _ = child.kill().await;
            None
        }
    }
}

async fn probe_http(port: u16, path: Option<&str>, timeout: Duration) -> Option<u16> {
    let path = path.unwrap_or("/");
    let url = format!("http://127.0.0.1:{}{}", port, path);

    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Failed to build HTTP probe client");
            return None;
        }
    };

    match client.get(&url).send().await {
        Ok(response) => Some(response.status().as_u16()),
        Err(e) => {
            debug!(url = %url, error = %e, "HTTP probe failed");
            None
        }
    }
}

async fn probe_tcp(port: u16, timeout: Duration) -> bool {
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(port, error = %e, "TCP probe failed");
            false
        }
        Err(_) => {
            debug!(port, "TCP probe timed out");
            false
        }
    }
}

// =============================================================================
// Probe Loops
// =============================================================================

async fn run_check_loop<F>(
    probe: Probe,
    kind: CheckKind,
    delay: Duration,
    interval: Duration,
    timeout: Duration,
    mut paused: watch::Receiver<bool>,
    callback: F,
) where
    F: Fn(CheckStatusInfo) + Send + Sync + 'static,
{
    tokio::time::sleep(delay).await;

    let mut last: Option<CheckStatusInfo> = None;

    loop {
        wait_while_paused(&mut paused).await;

        let status = probe.run(timeout).await.into_check_status(kind);

        // Only changes in the observed result are reported.
        if last.as_ref() != Some(&status) {
            callback(status.clone());
            last = Some(status);
        }

        tokio::time::sleep(interval).await;
    }
}

struct HealthSettings {
    delay: Duration,
    interval: Duration,
    timeout: Duration,
    consecutive_failures: u32,
    grace_period: Duration,
}

async fn run_health_loop<F>(
    probe: Probe,
    settings: HealthSettings,
    task_id: TaskId,
    mut paused: watch::Receiver<bool>,
    callback: F,
) where
    F: Fn(TaskHealthStatus) + Send + Sync + 'static,
{
    tokio::time::sleep(settings.delay).await;

    let started = Instant::now();
    let mut failures = 0u32;
    let mut seen_success = false;
    let mut last_healthy: Option<bool> = None;

    loop {
        wait_while_paused(&mut paused).await;

        if probe.run(settings.timeout).await.healthy() {
            failures = 0;
            seen_success = true;

            if last_healthy != Some(true) {
                callback(TaskHealthStatus {
                    task_id: task_id.clone(),
                    healthy: true,
                    kill_task: false,
                });
            }
            last_healthy = Some(true);
        } else if !seen_success && started.elapsed() < settings.grace_period {
            // Failures within the grace period do not count, and are not
            // reported, until the task has been healthy at least once.
            debug!(task_id = %task_id, "Ignoring health probe failure within grace period");
        } else {
            failures += 1;
            let kill_task = failures == settings.consecutive_failures;

            if last_healthy != Some(false) || kill_task {
                callback(TaskHealthStatus {
                    task_id: task_id.clone(),
                    healthy: false,
                    kill_task,
                });
            }
            last_healthy = Some(false);
        }

        tokio::time::sleep(settings.interval).await;
    }
}

async fn wait_while_paused(paused: &mut watch::Receiver<bool>) {
    while *paused.borrow() {
        if paused.changed().await.is_err() {
            // Controlling handle dropped; the loop is about to be aborted.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use mesos_proto::task::{CommandCheck, HttpCheck, TcpCheck};

    fn tcp_check(port: u16, interval: f64) -> CheckInfo {
        CheckInfo {
            kind: CheckKind::Tcp,
            command: None,
            http: None,
            tcp: Some(TcpCheck { port }),
            delay_seconds: 0.0,
            interval_seconds: interval,
            timeout_seconds: 0.25,
        }
    }

    #[test]
    fn test_probe_rejects_missing_definition() {
        let result = Probe::new(CheckKind::Tcp, None, None, None, Path::new("/tmp"));
        assert!(matches!(
            result,
            Err(CheckError::MissingDefinition { .. })
        ));
    }

    #[test]
    fn test_probe_rejects_empty_command() {
        let result = Probe::new(
            CheckKind::Command,
            Some(CommandInfo::default()),
            None,
            None,
            Path::new("/tmp"),
        );
        assert!(matches!(result, Err(CheckError::MissingCommand)));
    }

    #[test]
    fn test_checker_spawn_rejects_mismatched_kind() {
        let info = CheckInfo {
            kind: CheckKind::Http,
            command: Some(CommandCheck {
                command: CommandInfo {
                    value: Some("true".to_string()),
                    ..CommandInfo::default()
                },
            }),
            http: None,
            tcp: None,
            delay_seconds: 0.0,
            interval_seconds: 1.0,
            timeout_seconds: 1.0,
        };

        // Can't build a runtime-free Checker, so just validate the probe.
        let result = Probe::new(
            info.kind,
            info.command.as_ref().map(|c| c.command.clone()),
            None,
            None,
            Path::new("/tmp"),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_command_probe_exit_codes() {
        let ok = CommandInfo {
            value: Some("exit 0".to_string()),
            ..CommandInfo::default()
        };
        assert_eq!(run_command(&ok, Path::new("/tmp"), secs(5.0)).await, Some(0));

        let failing = CommandInfo {
            value: Some("exit 7".to_string()),
            ..CommandInfo::default()
        };
        assert_eq!(
            run_command(&failing, Path::new("/tmp"), secs(5.0)).await,
            Some(7)
        );
    }

    #[tokio::test]
    async fn test_command_probe_timeout() {
        let slow = CommandInfo {
            value: Some("sleep 10".to_string()),
            ..CommandInfo::default()
        };
        assert_eq!(
            run_command(&slow, Path::new("/tmp"), Duration::from_millis(50)).await,
            None
        );
    }

    #[tokio::test]
    async fn test_tcp_probe_no_listener() {
        assert!(!probe_tcp(59998, Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_tcp_probe_with_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(probe_tcp(port, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_checker_reports_result_changes_only() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let results: Arc<Mutex<Vec<CheckStatusInfo>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);

        let checker = Checker::spawn(tcp_check(port, 0.02), Path::new("/tmp"), move |status| {
            sink.lock().unwrap().push(status);
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(checker);

        let results = results.lock().unwrap();
        // The listener stays up, so the result never changes after the
        // first report.
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].tcp,
            Some(TcpCheckStatus {
                succeeded: Some(true)
            })
        );
    }

    #[tokio::test]
    async fn test_checker_pause_and_resume() {
        let reports = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&reports);

        let checker = Checker::spawn(
            tcp_check(59997, 0.02),
            Path::new("/tmp"),
            move |_status| {
                counted.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        // Paused before the first probe runs: no result is ever reported.
        checker.pause();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(reports.load(Ordering::SeqCst), 0);

        checker.resume();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(reports.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_health_checker_reports_kill_at_threshold() {
        let info = HealthCheckInfo {
            kind: CheckKind::Tcp,
            command: None,
            http: None,
            tcp: Some(TcpCheck { port: 59996 }),
            delay_seconds: 0.0,
            interval_seconds: 0.02,
            timeout_seconds: 0.1,
            consecutive_failures: 2,
            grace_period_seconds: 0.0,
        };

        let reports: Arc<Mutex<Vec<TaskHealthStatus>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);

        let _checker = HealthChecker::spawn(
            info,
            Path::new("/tmp"),
            TaskId::from("t1"),
            move |status| {
                sink.lock().unwrap().push(status);
            },
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;

        let reports = reports.lock().unwrap();
        assert!(!reports.is_empty());
        // First report: unhealthy without a kill; the threshold report asks
        // for the kill exactly once.
        assert!(!reports[0].kill_task);
        assert!(!reports[0].healthy);
        assert_eq!(reports.iter().filter(|r| r.kill_task).count(), 1);
    }

    #[tokio::test]
    async fn test_health_checker_grace_period_suppresses_failures() {
        let info = HealthCheckInfo {
            kind: CheckKind::Tcp,
            command: None,
            http: None,
            tcp: Some(TcpCheck { port: 59995 }),
            delay_seconds: 0.0,
            interval_seconds: 0.02,
            timeout_seconds: 0.1,
            consecutive_failures: 1,
            grace_period_seconds: 60.0,
        };

        let reports: Arc<Mutex<Vec<TaskHealthStatus>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);

        let _checker = HealthChecker::spawn(
            info,
            Path::new("/tmp"),
            TaskId::from("t1"),
            move |status| {
                sink.lock().unwrap().push(status);
            },
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_http_check_kind_requires_http_definition() {
        let info = HealthCheckInfo {
            kind: CheckKind::Http,
            command: None,
            http: Some(HttpCheck {
                port: 59994,
                path: Some("/health".to_string()),
            }),
            tcp: None,
            delay_seconds: 0.0,
            interval_seconds: 10.0,
            timeout_seconds: 0.1,
            consecutive_failures: 3,
            grace_period_seconds: 0.0,
        };

        let checker = HealthChecker::spawn(
            info,
            Path::new("/tmp"),
            TaskId::from("t1"),
            |_status| {},
        );
        assert!(checker.is_ok());
    }
}
