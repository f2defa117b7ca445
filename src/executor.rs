//! Running commands inside a tenant's runtime.
//!
//! Blocking exec captures output under a hard deadline. Streaming exec
//! yields output line by line and always ends with exactly one
//! [`ExecEvent::Exit`], whether the process finished, timed out, failed to
//! start or was cancelled. A non-zero exit status is reported as data.

use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::pin::Pin;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::{with_timeout, RuntimeDriver, RuntimeHandle, SpawnRequest, Spawned};
use crate::error::{Result, RunboxError};
use crate::files::normalize_rel_path;
use crate::registry::{RuntimeRegistry, RuntimeStatus};

/// How long pipes may stay open after the process itself is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);
const STREAM_BUFFER: usize = 256;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOptions {
    /// Blocking exec falls back to the configured default; streaming exec
    /// runs unbounded when unset.
    #[serde(default, rename = "timeoutMs", with = "opt_millis")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub duration_ms: u64,
    pub truncated: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExitReason {
    Completed,
    TimedOut,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub reason: ExitReason,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.reason == ExitReason::Completed && self.code == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ExecEvent {
    Stdout(String),
    Stderr(String),
    Exit(ExitInfo),
}

/// Cancels a streaming command. Cloneable; any clone cancels.
#[derive(Debug, Clone, Default)]
pub struct ExecHandle {
    cancel: CancellationToken,
}

impl ExecHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Output of a streaming command. Dropping the stream cancels the command.
#[derive(Debug)]
pub struct ExecStream {
    rx: mpsc::Receiver<ExecEvent>,
    handle: ExecHandle,
}

impl ExecStream {
    pub fn handle(&self) -> ExecHandle {
        self.handle.clone()
    }
}

impl Stream for ExecStream {
    type Item = ExecEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ExecStream {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

async fn capture<R>(mut pipe: R, sink: Arc<Mutex<Captured>>, cap: usize)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        let n = match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut captured = sink.lock().unwrap_or_else(|p| p.into_inner());
        let room = cap.saturating_sub(captured.bytes.len());
        if n > room {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&buf[..n.min(room)]);
    }
}

fn take_captured(sink: &Arc<Mutex<Captured>>) -> (String, bool) {
    let mut captured = sink.lock().unwrap_or_else(|p| p.into_inner());
    let mut text = String::from_utf8_lossy(&captured.bytes).into_owned();
    if captured.truncated {
        text.push_str("\n... [output truncated]");
    }
    let truncated = captured.truncated;
    captured.bytes.clear();
    (text, truncated)
}

async fn forward_lines<R>(pipe: R, tx: mpsc::Sender<ExecEvent>, wrap: fn(String) -> ExecEvent)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(wrap(text)).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Wait for pipe readers, giving up after the drain grace period.
async fn drain(readers: Vec<JoinHandle<()>>) {
    let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
    for mut reader in readers {
        if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
            reader.abort();
            let _ = reader.await;
        }
    }
}

/// Kill a spawned command and reap it.
async fn terminate(
    driver: &dyn RuntimeDriver,
    handle: &RuntimeHandle,
    spawned: &mut Spawned,
) -> Option<ExitStatus> {
    if let Err(e) = driver.kill(handle, spawned).await {
        warn!(runtime = %handle.id, exec_id = %spawned.exec_id, error = %e, "kill failed");
    }
    match tokio::time::timeout(DRAIN_GRACE, spawned.child.wait()).await {
        Ok(Ok(status)) => Some(status),
        _ => None,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u64::MAX as u128) as u64
}

#[derive(Clone)]
pub struct CommandExecutor {
    registry: Arc<RuntimeRegistry>,
    driver: Arc<dyn RuntimeDriver>,
    default_timeout: Duration,
    driver_timeout: Duration,
    max_output_bytes: usize,
}

impl CommandExecutor {
    pub fn new(
        registry: Arc<RuntimeRegistry>,
        driver: Arc<dyn RuntimeDriver>,
        default_timeout: Duration,
        driver_timeout: Duration,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            registry,
            driver,
            default_timeout,
            driver_timeout,
            max_output_bytes,
        }
    }

    /// Handle of the tenant's runtime, provided it is running. Counts as activity.
    async fn running_handle(&self, tenant_id: &str) -> Result<RuntimeHandle> {
        let record = self
            .registry
            .get(tenant_id)
            .await
            .ok_or_else(|| RunboxError::RuntimeNotFound(tenant_id.to_string()))?;
        let not_running = || RunboxError::RuntimeNotRunning {
            tenant: tenant_id.to_string(),
            status: record.status,
        };
        if record.status != RuntimeStatus::Running {
            return Err(not_running());
        }
        let handle = record.handle.clone().ok_or_else(not_running)?;
        self.registry.touch(tenant_id, Instant::now()).await;
        Ok(handle)
    }

    fn spawn_request(command: &str, options: &ExecOptions) -> Result<SpawnRequest> {
        let cwd = match options.cwd.as_deref() {
            None | Some("") | Some(".") => None,
            Some(rel) => Some(normalize_rel_path(rel)?.to_string_lossy().into_owned()),
        };
        Ok(SpawnRequest {
            command: command.to_string(),
            env: options.env.clone(),
            cwd,
        })
    }

    /// Run a command to completion and capture its output.
    pub async fn exec(
        &self,
        tenant_id: &str,
        command: &str,
        options: ExecOptions,
    ) -> Result<ExecOutput> {
        let request = Self::spawn_request(command, &options)?;
        let handle = self.running_handle(tenant_id).await?;
        let timeout = options.timeout.unwrap_or(self.default_timeout);

        debug!(tenant = %tenant_id, command, ?timeout, "exec");
        let started = Instant::now();
        let mut spawned = with_timeout(
            "spawn",
            self.driver_timeout,
            self.driver.spawn(&handle, &request),
        )
        .await?;

        let out = Arc::new(Mutex::new(Captured::default()));
        let err = Arc::new(Mutex::new(Captured::default()));
        let mut readers = Vec::new();
        if let Some(pipe) = spawned.child.stdout.take() {
            readers.push(tokio::spawn(capture(pipe, out.clone(), self.max_output_bytes)));
        }
        if let Some(pipe) = spawned.child.stderr.take() {
            readers.push(tokio::spawn(capture(pipe, err.clone(), self.max_output_bytes)));
        }

        let status = match tokio::time::timeout(timeout, spawned.child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                terminate(self.driver.as_ref(), &handle, &mut spawned).await;
                drain(readers).await;
                return Err(RunboxError::Driver {
                    op: "exec",
                    message: format!("wait for {command:?}: {e}"),
                });
            }
            Err(_) => {
                warn!(tenant = %tenant_id, command, ?timeout, "command timed out, killing");
                terminate(self.driver.as_ref(), &handle, &mut spawned).await;
                drain(readers).await;
                return Err(RunboxError::CommandTimeout {
                    command: command.to_string(),
                    timeout,
                });
            }
        };
        drain(readers).await;

        let (stdout, out_truncated) = take_captured(&out);
        let (stderr, err_truncated) = take_captured(&err);
        let output = ExecOutput {
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
            signal: status.signal(),
            duration_ms: elapsed_ms(started),
            truncated: out_truncated || err_truncated,
        };
        info!(
            tenant = %tenant_id,
            command,
            exit_code = output.exit_code,
            duration_ms = output.duration_ms,
            "exec finished"
        );
        Ok(output)
    }

    /// Start a command and stream its output.
    pub async fn exec_stream(
        &self,
        tenant_id: &str,
        command: &str,
        options: ExecOptions,
    ) -> Result<ExecStream> {
        let request = Self::spawn_request(command, &options)?;
        let handle = self.running_handle(tenant_id).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let exec_handle = ExecHandle::default();
        let job = StreamJob {
            driver: self.driver.clone(),
            handle,
            request,
            timeout: options.timeout,
            driver_timeout: self.driver_timeout,
            cancel: exec_handle.cancel.clone(),
        };
        debug!(tenant = %tenant_id, command, "exec stream");
        tokio::spawn(job.run(tx));

        Ok(ExecStream {
            rx,
            handle: exec_handle,
        })
    }
}

struct StreamJob {
    driver: Arc<dyn RuntimeDriver>,
    handle: RuntimeHandle,
    request: SpawnRequest,
    timeout: Option<Duration>,
    driver_timeout: Duration,
    cancel: CancellationToken,
}

impl StreamJob {
    async fn run(self, tx: mpsc::Sender<ExecEvent>) {
        let started = Instant::now();
        let spawned = with_timeout(
            "spawn",
            self.driver_timeout,
            self.driver.spawn(&self.handle, &self.request),
        )
        .await;

        let exit = match spawned {
            Ok(mut spawned) => self.drive(&mut spawned, &tx, started).await,
            Err(e) => {
                let message = RunboxError::from(e).to_string();
                // Surface the failure on stderr as well as on the exit event.
                let _ = tx.send(ExecEvent::Stderr(message.clone())).await;
                ExitInfo {
                    code: None,
                    signal: None,
                    reason: ExitReason::Failed,
                    error: Some(message),
                    duration_ms: elapsed_ms(started),
                }
            }
        };
        debug!(runtime = %self.handle.id, reason = ?exit.reason, code = ?exit.code, "exec stream finished");
        let _ = tx.send(ExecEvent::Exit(exit)).await;
    }

    async fn drive(
        &self,
        spawned: &mut Spawned,
        tx: &mpsc::Sender<ExecEvent>,
        started: Instant,
    ) -> ExitInfo {
        let mut readers = Vec::new();
        if let Some(pipe) = spawned.child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(pipe, tx.clone(), ExecEvent::Stdout)));
        }
        if let Some(pipe) = spawned.child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(pipe, tx.clone(), ExecEvent::Stderr)));
        }

        let timeout = self.timeout;
        let deadline = async move {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let (reason, mut status, mut error) = tokio::select! {
            res = spawned.child.wait() => match res {
                Ok(status) => (ExitReason::Completed, Some(status), None),
                Err(e) => (ExitReason::Failed, None, Some(format!("wait: {e}"))),
            },
            _ = self.cancel.cancelled() => (ExitReason::Cancelled, None, None),
            _ = &mut deadline => (ExitReason::TimedOut, None, None),
        };

        if status.is_none() {
            status = terminate(self.driver.as_ref(), &self.handle, spawned).await;
            if reason == ExitReason::TimedOut {
                if let Some(t) = timeout {
                    error = Some(format!("timed out after {}ms", t.as_millis()));
                }
            }
        }
        drain(readers).await;

        ExitInfo {
            code: status.and_then(|s| s.code()),
            signal: status.and_then(|s| s.signal()),
            reason,
            error,
            duration_ms: elapsed_ms(started),
        }
    }
}
