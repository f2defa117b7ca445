//! Bringing a fresh runtime's project up: install, dev server, readiness.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::{LogStream, StatusBroadcaster, StatusEvent};
use crate::config::Config;
use crate::error::RunboxError;
use crate::executor::{CommandExecutor, ExecEvent, ExecOptions, ExecStream, ExitInfo, ExitReason};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const READY_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

pub struct BootSequence {
    executor: CommandExecutor,
    broadcaster: Arc<StatusBroadcaster>,
    install_command: String,
    dev_command: String,
    ready_timeout: Duration,
    client: reqwest::Client,
}

impl BootSequence {
    pub fn new(
        executor: CommandExecutor,
        broadcaster: Arc<StatusBroadcaster>,
        config: &Config,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(READY_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            executor,
            broadcaster,
            install_command: config.install_command.clone(),
            dev_command: config.dev_command.clone(),
            ready_timeout: config.ready_timeout,
            client,
        }
    }

    /// Run until the dev server exits or `cancel` fires. Cancelling drops the
    /// dev server stream, which kills it.
    pub async fn run(self, tenant_id: String, port: u16, url: String, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => debug!(tenant = %tenant_id, "boot cancelled"),
            _ = self.boot(&tenant_id, port, &url) => {}
        }
    }

    async fn boot(&self, tenant_id: &str, port: u16, url: &str) {
        if !self.install_command.trim().is_empty() {
            match self.start(tenant_id, &self.install_command).await {
                Some(stream) => {
                    let exit = self.forward_until_exit(tenant_id, stream).await;
                    if !exit.success() {
                        self.report_exit(tenant_id, &self.install_command, &exit);
                        return;
                    }
                }
                None => return,
            }
        }

        if self.dev_command.trim().is_empty() {
            return;
        }
        let Some(mut dev) = self.start(tenant_id, &self.dev_command).await else {
            return;
        };

        let ready = self.wait_ready(port);
        tokio::pin!(ready);
        let mut settled = false;
        loop {
            tokio::select! {
                is_ready = &mut ready, if !settled => {
                    settled = true;
                    if is_ready {
                        info!(tenant = %tenant_id, port, url, "dev server ready");
                        self.broadcaster.publish(StatusEvent::url_change(tenant_id, url));
                    } else {
                        warn!(tenant = %tenant_id, port, "dev server not ready in time");
                        self.broadcaster.publish(StatusEvent::error(
                            tenant_id,
                            "dev_server_not_ready",
                            format!(
                                "dev server did not answer on port {port} within {}s",
                                self.ready_timeout.as_secs()
                            ),
                        ));
                    }
                }
                event = dev.next() => match event {
                    Some(ExecEvent::Exit(exit)) => {
                        if exit.reason != ExitReason::Cancelled {
                            self.report_exit(tenant_id, &self.dev_command, &exit);
                        }
                        return;
                    }
                    Some(event) => self.forward(tenant_id, event),
                    None => return,
                },
            }
        }
    }

    async fn start(&self, tenant_id: &str, command: &str) -> Option<ExecStream> {
        self.broadcaster
            .publish_log(tenant_id, LogStream::System, format!("$ {command}"));
        match self
            .executor
            .exec_stream(tenant_id, command, ExecOptions::default())
            .await
        {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(tenant = %tenant_id, command, error = %e, "boot step could not start");
                self.broadcaster
                    .publish(StatusEvent::error(tenant_id, e.code(), e.to_string()));
                None
            }
        }
    }

    async fn forward_until_exit(&self, tenant_id: &str, mut stream: ExecStream) -> ExitInfo {
        while let Some(event) = stream.next().await {
            match event {
                ExecEvent::Exit(exit) => return exit,
                other => self.forward(tenant_id, other),
            }
        }
        // The executor always ends with an exit event; a closed stream means
        // the job was torn down underneath us.
        ExitInfo {
            code: None,
            signal: None,
            reason: ExitReason::Cancelled,
            error: None,
            duration_ms: 0,
        }
    }

    fn forward(&self, tenant_id: &str, event: ExecEvent) {
        match event {
            ExecEvent::Stdout(line) => self
                .broadcaster
                .publish_log(tenant_id, LogStream::Stdout, line),
            ExecEvent::Stderr(line) => self
                .broadcaster
                .publish_log(tenant_id, LogStream::Stderr, line),
            ExecEvent::Exit(_) => {}
        }
    }

    fn report_exit(&self, tenant_id: &str, command: &str, exit: &ExitInfo) {
        warn!(
            tenant = %tenant_id,
            command,
            code = ?exit.code,
            reason = ?exit.reason,
            "boot command did not succeed"
        );
        let err = RunboxError::CommandFailed {
            command: command.to_string(),
            exit_code: exit.code.unwrap_or(-1),
        };
        let message = match &exit.error {
            Some(detail) => format!("{err} ({detail})"),
            None => err.to_string(),
        };
        self.broadcaster
            .publish(StatusEvent::error(tenant_id, err.code(), message));
    }

    /// Poll the dev server until it answers any HTTP response.
    async fn wait_ready(&self, port: u16) -> bool {
        let ready_url = format!("http://127.0.0.1:{port}/");
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            match self.client.get(&ready_url).send().await {
                Ok(resp) => {
                    debug!(port, status = %resp.status(), "dev server answered");
                    return true;
                }
                Err(e) => debug!(port, error = %e, "dev server not answering yet"),
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}
