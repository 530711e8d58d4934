//! Supervision of standalone driver processes.
//!
//! A standalone driver is any executable that reads newline-terminated
//! commands from stdin and writes output to stdout; no further wire
//! format is imposed. The [`StandaloneSupervisor`] spawns the driver
//! with both streams piped, then runs a background task that:
//!
//! - polls liveness every ~100 ms and restarts the driver with the same
//!   command when it exits;
//! - when listening is enabled, reads up to 1024 bytes from the
//!   driver's stdout per tick and hands them to the
//!   [`DriverOutputHandler`].
//!
//! Faults inside the supervision task are logged, never propagated: a
//! failed restart re-enters the monitoring loop on the next tick.
//!
//! # Startup probation
//!
//! `spawn` reports a missing or non-executable driver synchronously.
//! Beyond that, the driver gets a short probation window (default 1 s):
//! exiting within it is reported as [`SupervisorError::StartFailed`]
//! and the child is reaped instead of restarted.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use vega_types::ErrorCode;

/// Monitoring cadence of the supervision task.
const MONITOR_TICK: Duration = Duration::from_millis(100);

/// Default startup probation window.
const DEFAULT_STARTUP_PROBATION: Duration = Duration::from_secs(1);

/// Per-tick stdout read limit while listening.
const LISTEN_BUFFER: usize = 1024;

/// Supervisor errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The driver executable could not be spawned.
    #[error("failed to spawn driver {name}: {source}")]
    SpawnFailed {
        /// Driver name.
        name: String,
        /// OS error.
        #[source]
        source: std::io::Error,
    },

    /// The driver exited during the startup probation window.
    #[error("driver {name} failed to start: {detail}")]
    StartFailed {
        /// Driver name.
        name: String,
        /// Exit status or failure description.
        detail: String,
    },

    /// The driver is not running.
    #[error("driver {0} is not running")]
    NotRunning(String),

    /// The driver is already running.
    #[error("driver {0} is already running")]
    AlreadyRunning(String),

    /// Writing to the driver's stdin failed.
    #[error("failed to send to driver {name}: {source}")]
    SendFailed {
        /// Driver name.
        name: String,
        /// OS error.
        #[source]
        source: std::io::Error,
    },
}

impl ErrorCode for SupervisorError {
    fn code(&self) -> &'static str {
        match self {
            Self::SpawnFailed { .. } => "SUPERVISOR_SPAWN_FAILED",
            Self::StartFailed { .. } => "SUPERVISOR_START_FAILED",
            Self::NotRunning(_) => "SUPERVISOR_NOT_RUNNING",
            Self::AlreadyRunning(_) => "SUPERVISOR_ALREADY_RUNNING",
            Self::SendFailed { .. } => "SUPERVISOR_SEND_FAILED",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::StartFailed { .. } | Self::SendFailed { .. } | Self::SpawnFailed { .. }
        )
    }
}

/// Receiver for bytes the driver writes to stdout while listening.
#[async_trait]
pub trait DriverOutputHandler: Send + Sync {
    /// Called with each chunk read from the driver's stdout.
    async fn on_output(&self, driver: &str, bytes: &[u8]);

    /// Called after the supervisor restarted a dead driver.
    async fn on_restart(&self, driver: &str) {
        let _ = driver;
    }
}

/// Default handler: logs driver output.
pub struct LogOutputHandler;

#[async_trait]
impl DriverOutputHandler for LogOutputHandler {
    async fn on_output(&self, driver: &str, bytes: &[u8]) {
        info!(driver = %driver, output = %String::from_utf8_lossy(bytes), "Driver output");
    }
}

/// Shared state between the supervisor handle and its background task.
struct DriverState {
    name: String,
    listening: AtomicBool,
    should_exit: AtomicBool,
    stop_notify: Notify,
    stdin: Mutex<Option<ChildStdin>>,
    pid: Mutex<Option<u32>>,
}

/// Spawns, monitors, restarts and terminates one external driver.
pub struct StandaloneSupervisor {
    program: String,
    args: Vec<String>,
    startup_probation: Duration,
    handler: Arc<dyn DriverOutputHandler>,
    state: Arc<DriverState>,
    task: Option<JoinHandle<()>>,
}

impl StandaloneSupervisor {
    /// Creates a supervisor for `program args...` under the given
    /// driver name. The driver is not started yet.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        program: impl Into<String>,
        args: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
            startup_probation: DEFAULT_STARTUP_PROBATION,
            handler: Arc::new(LogOutputHandler),
            state: Arc::new(DriverState {
                name: name.into(),
                listening: AtomicBool::new(false),
                should_exit: AtomicBool::new(false),
                stop_notify: Notify::new(),
                stdin: Mutex::new(None),
                pid: Mutex::new(None),
            }),
            task: None,
        }
    }

    /// Replaces the output handler.
    #[must_use]
    pub fn with_output_handler(mut self, handler: Arc<dyn DriverOutputHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Overrides the startup probation window.
    #[must_use]
    pub fn with_startup_probation(mut self, probation: Duration) -> Self {
        self.startup_probation = probation;
        self
    }

    /// Driver name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Starts the driver and the supervision task.
    ///
    /// # Errors
    ///
    /// Fails when already running, when the executable cannot be
    /// spawned, or when the child exits during the probation window.
    pub async fn start(&mut self) -> Result<(), SupervisorError> {
        if self.task.is_some() {
            return Err(SupervisorError::AlreadyRunning(self.state.name.clone()));
        }
        self.state.should_exit.store(false, Ordering::Release);

        let (mut child, stdout) = spawn_driver(&self.state, &self.program, &self.args).await?;

        // Probation: a child that dies this early failed to start.
        let deadline = tokio::time::Instant::now() + self.startup_probation;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    self.state.stdin.lock().await.take();
                    *self.state.pid.lock().await = None;
                    return Err(SupervisorError::StartFailed {
                        name: self.state.name.clone(),
                        detail: status.to_string(),
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(driver = %self.state.name, error = %e, "Liveness probe failed");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(MONITOR_TICK.min(self.startup_probation)).await;
        }

        info!(driver = %self.state.name, program = %self.program, "Driver started");
        let state = Arc::clone(&self.state);
        let handler = Arc::clone(&self.handler);
        let program = self.program.clone();
        let args = self.args.clone();
        self.task = Some(tokio::spawn(async move {
            supervise(state, handler, program, args, child, stdout).await;
        }));
        Ok(())
    }

    /// Stops the driver: sets the exit flag, terminates the child,
    /// waits for the supervision task to finish and reaps.
    ///
    /// # Errors
    ///
    /// Fails with [`SupervisorError::NotRunning`] when not started.
    pub async fn stop(&mut self) -> Result<(), SupervisorError> {
        let Some(task) = self.task.take() else {
            return Err(SupervisorError::NotRunning(self.state.name.clone()));
        };
        self.state.should_exit.store(true, Ordering::Release);
        self.state.stop_notify.notify_waiters();
        self.state.stop_notify.notify_one();
        self.state.stdin.lock().await.take();
        if let Err(e) = task.await {
            error!(driver = %self.state.name, error = %e, "Supervision task panicked");
        }
        // A restart may have replaced the pipe while we were joining.
        self.state.stdin.lock().await.take();
        *self.state.pid.lock().await = None;
        info!(driver = %self.state.name, "Driver stopped");
        Ok(())
    }

    /// Writes bytes to the driver's stdin.
    ///
    /// # Errors
    ///
    /// Fails when the driver is not running or the pipe is broken.
    pub async fn send(&self, message: &[u8]) -> Result<(), SupervisorError> {
        let mut stdin = self.state.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(SupervisorError::NotRunning(self.state.name.clone()));
        };
        let write = async {
            pipe.write_all(message).await?;
            pipe.flush().await
        };
        write.await.map_err(|source| SupervisorError::SendFailed {
            name: self.state.name.clone(),
            source,
        })
    }

    /// Flips the listening flag; returns the new value.
    pub fn toggle_listening(&self) -> bool {
        let listening = !self.state.listening.load(Ordering::Acquire);
        self.state.listening.store(listening, Ordering::Release);
        info!(driver = %self.state.name, listening, "Driver listening toggled");
        listening
    }

    /// Current listening flag.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.state.listening.load(Ordering::Acquire)
    }

    /// Whether the supervision task is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Current child pid, when running.
    pub async fn pid(&self) -> Option<u32> {
        *self.state.pid.lock().await
    }

    /// One-line diagnostic: name, pid, listening flag.
    pub async fn describe(&self) -> String {
        let pid = self.pid().await;
        format!(
            "{} (PID: {}){}",
            self.state.name,
            pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
            if self.is_listening() { " [Listening]" } else { "" }
        )
    }
}

async fn spawn_driver(
    state: &DriverState,
    program: &str,
    args: &[String],
) -> Result<(Child, ChildStdout), SupervisorError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SupervisorError::SpawnFailed {
            name: state.name.clone(),
            source,
        })?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take().ok_or_else(|| SupervisorError::StartFailed {
        name: state.name.clone(),
        detail: "stdout pipe missing".to_string(),
    })?;

    *state.stdin.lock().await = stdin;
    *state.pid.lock().await = child.id();
    Ok((child, stdout))
}

async fn supervise(
    state: Arc<DriverState>,
    handler: Arc<dyn DriverOutputHandler>,
    program: String,
    args: Vec<String>,
    mut child: Child,
    mut stdout: ChildStdout,
) {
    let mut buffer = [0u8; LISTEN_BUFFER];
    loop {
        if state.should_exit.load(Ordering::Acquire) {
            if let Err(e) = child.start_kill() {
                warn!(driver = %state.name, error = %e, "Failed to terminate driver");
            }
            if let Err(e) = child.wait().await {
                warn!(driver = %state.name, error = %e, "Failed to reap driver");
            }
            break;
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                info!(driver = %state.name, status = %status, "Driver exited, restarting");
                match spawn_driver(&state, &program, &args).await {
                    Ok((new_child, new_stdout)) => {
                        child = new_child;
                        stdout = new_stdout;
                        handler.on_restart(&state.name).await;
                    }
                    Err(e) => {
                        error!(driver = %state.name, error = %e, "Driver restart failed");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(driver = %state.name, error = %e, "Liveness probe failed");
            }
        }

        if state.listening.load(Ordering::Acquire) {
            match tokio::time::timeout(Duration::from_millis(10), stdout.read(&mut buffer)).await
            {
                Ok(Ok(n)) if n > 0 => handler.on_output(&state.name, &buffer[..n]).await,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(driver = %state.name, error = %e, "Driver read failed"),
                Err(_) => {}
            }
        }

        tokio::select! {
            () = tokio::time::sleep(MONITOR_TICK) => {}
            () = state.stop_notify.notified() => {}
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    struct CaptureHandler {
        output: SyncMutex<Vec<u8>>,
        restarts: AtomicBool,
    }

    impl CaptureHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                output: SyncMutex::new(Vec::new()),
                restarts: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl DriverOutputHandler for CaptureHandler {
        async fn on_output(&self, _driver: &str, bytes: &[u8]) {
            self.output.lock().extend_from_slice(bytes);
        }

        async fn on_restart(&self, _driver: &str) {
            self.restarts.store(true, Ordering::Release);
        }
    }

    fn shell(name: &str, script: &str) -> StandaloneSupervisor {
        StandaloneSupervisor::new(
            name,
            "/bin/sh",
            ["-c".to_string(), script.to_string()],
        )
        .with_startup_probation(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn start_and_stop_leaves_no_child() {
        let mut supervisor = shell("cat", "cat");
        supervisor.start().await.expect("start should succeed");
        assert!(supervisor.is_running());
        assert!(supervisor.pid().await.is_some());

        supervisor.stop().await.expect("stop should succeed");
        assert!(!supervisor.is_running());
        assert!(supervisor.pid().await.is_none());
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_failure() {
        let mut supervisor = StandaloneSupervisor::new(
            "ghost",
            "/nonexistent/driver",
            Vec::new(),
        );
        let err = supervisor.start().await.expect_err("spawn should fail");
        assert!(matches!(err, SupervisorError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn early_exit_is_start_failure() {
        let mut supervisor = shell("flaky", "exit 3");
        let err = supervisor.start().await.expect_err("early exit should fail");
        assert!(matches!(err, SupervisorError::StartFailed { .. }));
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn send_and_listen_round_trip() {
        let handler = CaptureHandler::new();
        let mut supervisor = shell("cat", "cat")
            .with_output_handler(Arc::clone(&handler) as Arc<dyn DriverOutputHandler>);
        supervisor.start().await.expect("start should succeed");
        supervisor.toggle_listening();

        supervisor
            .send(b"hello driver\n")
            .await
            .expect("send should succeed");
        tokio::time::sleep(Duration::from_millis(500)).await;
        supervisor.stop().await.expect("stop should succeed");

        let output = handler.output.lock().clone();
        assert!(
            String::from_utf8_lossy(&output).contains("hello driver"),
            "captured: {output:?}"
        );
    }

    #[tokio::test]
    async fn dead_driver_restarts_with_same_name() {
        let handler = CaptureHandler::new();
        let mut supervisor = shell("blinker", "sleep 0.3")
            .with_output_handler(Arc::clone(&handler) as Arc<dyn DriverOutputHandler>);
        supervisor.start().await.expect("start should succeed");
        let first_pid = supervisor.pid().await.expect("pid should exist");

        // Wait past the child's lifetime plus a few monitor ticks.
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(handler.restarts.load(Ordering::Acquire));
        let second_pid = supervisor.pid().await.expect("pid should exist");
        assert_ne!(first_pid, second_pid);
        assert_eq!(supervisor.name(), "blinker");

        supervisor.stop().await.expect("stop should succeed");
    }

    #[tokio::test]
    async fn send_without_start_fails() {
        let supervisor = shell("idle", "cat");
        let err = supervisor.send(b"x").await.expect_err("send should fail");
        assert!(matches!(err, SupervisorError::NotRunning(_)));
    }

    #[tokio::test]
    async fn double_start_rejected() {
        let mut supervisor = shell("cat", "cat");
        supervisor.start().await.expect("start should succeed");
        let err = supervisor.start().await.expect_err("second start should fail");
        assert!(matches!(err, SupervisorError::AlreadyRunning(_)));
        supervisor.stop().await.expect("stop should succeed");
    }

    #[test]
    fn error_codes_valid() {
        use vega_types::assert_error_codes;
        assert_error_codes(
            &[
                SupervisorError::StartFailed {
                    name: "d".into(),
                    detail: "x".into(),
                },
                SupervisorError::NotRunning("d".into()),
                SupervisorError::AlreadyRunning("d".into()),
            ],
            "SUPERVISOR_",
        );
    }
}
