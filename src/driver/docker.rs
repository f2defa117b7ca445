//! Docker driver: one container per runtime, driven through the docker CLI.

use std::io::ErrorKind;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    runtime_name, CreateSpec, DriverError, DriverResult, RuntimeDriver, RuntimeHandle,
    RuntimeStats, SpawnRequest, Spawned,
};
use crate::files::{normalize_rel_path, FileMap};

const WORKDIR: &str = "/app";
const EXEC_ID_VAR: &str = "RUNBOX_EXEC_ID";
const STOP_GRACE_SECS: &str = "5";

/// Kills every process whose environment carries the given exec id.
const KILL_BY_EXEC_ID: &str = r#"for d in /proc/[0-9]*; do
  if grep -qa "RUNBOX_EXEC_ID=$1" "$d/environ" 2>/dev/null; then kill -9 "${d#/proc/}" 2>/dev/null; fi
done; true"#;

#[derive(Debug, Clone)]
pub struct DockerDriver {
    image: String,
    container_port: u16,
}

impl DockerDriver {
    pub fn new(image: String, container_port: u16) -> Self {
        Self {
            image,
            container_port,
        }
    }

    fn create_args(&self, name: &str, spec: &CreateSpec) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--label".to_string(),
            format!("runbox.tenant={}", spec.tenant_id),
            "--label".to_string(),
            format!("runbox.runtime={}", spec.runtime_id),
            "-p".to_string(),
            format!("{}:{}", spec.port, self.container_port),
            "-w".to_string(),
            WORKDIR.to_string(),
            "-e".to_string(),
            format!("PORT={}", self.container_port),
            "-e".to_string(),
            "HOST=0.0.0.0".to_string(),
        ];
        if let Some(mem) = spec.resources.memory_mb {
            args.extend(["--memory".to_string(), format!("{mem}m")]);
        }
        if let Some(cpus) = spec.resources.cpus {
            args.extend(["--cpus".to_string(), format!("{cpus}")]);
        }
        args.push(self.image.clone());
        args.extend(["sleep".to_string(), "infinity".to_string()]);
        args
    }

    fn container_path(rel: &str, op: &'static str) -> DriverResult<String> {
        let rel = normalize_rel_path(rel).map_err(|e| DriverError::failed(op, e.to_string()))?;
        Ok(format!("{WORKDIR}/{}", rel.to_string_lossy()))
    }
}

fn spawn_error(op: &'static str, e: std::io::Error) -> DriverError {
    if e.kind() == ErrorKind::NotFound {
        DriverError::Unavailable("docker CLI not found on PATH".to_string())
    } else {
        DriverError::failed(op, format!("spawn docker: {e}"))
    }
}

fn daemon_down(stderr: &str) -> bool {
    stderr.contains("Cannot connect to the Docker daemon")
        || stderr.contains("error during connect")
}

fn missing_container(stderr: &str) -> bool {
    stderr.contains("No such container")
}

async fn docker(op: &'static str, args: &[String]) -> DriverResult<Output> {
    debug!(op, ?args, "docker");
    let output = Command::new("docker")
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| spawn_error(op, e))?;
    check(op, output)
}

fn check(op: &'static str, output: Output) -> DriverResult<Output> {
    if output.status.success() {
        return Ok(output);
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if daemon_down(&stderr) {
        return Err(DriverError::Unavailable(stderr));
    }
    Err(DriverError::failed(op, stderr))
}

/// Idempotent variant: a missing container counts as success.
async fn docker_tolerant(op: &'static str, args: &[String]) -> DriverResult<()> {
    match docker(op, args).await {
        Ok(_) => Ok(()),
        Err(DriverError::Failed { message, .. }) if missing_container(&message) => Ok(()),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    #[serde(rename = "MemUsage")]
    mem_usage: String,
}

/// Parse docker's human-readable sizes ("12.5MiB", "1.2GB", "512B").
fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (num, unit) = raw.split_at(split);
    let value: f64 = num.parse().ok()?;
    let mult: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * mult).round() as u64)
}

fn parse_stats(line: &str) -> DriverResult<RuntimeStats> {
    let parsed: StatsLine = serde_json::from_str(line.trim())
        .map_err(|e| DriverError::failed("stats", format!("unexpected docker stats output: {e}")))?;
    let cpu_percent = parsed
        .cpu_perc
        .trim()
        .trim_end_matches('%')
        .parse::<f64>()
        .map_err(|e| DriverError::failed("stats", format!("cpu {:?}: {e}", parsed.cpu_perc)))?;
    let mut mem = parsed.mem_usage.split('/');
    let memory_bytes = mem
        .next()
        .and_then(parse_size)
        .ok_or_else(|| DriverError::failed("stats", format!("memory {:?}", parsed.mem_usage)))?;
    let memory_limit_bytes = mem.next().and_then(parse_size);
    Ok(RuntimeStats {
        cpu_percent,
        memory_bytes,
        memory_limit_bytes,
    })
}

#[async_trait]
impl RuntimeDriver for DockerDriver {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> DriverResult<()> {
        let args = ["version", "--format", "{{.Server.Version}}"].map(String::from);
        match docker("ping", &args).await {
            Ok(_) => Ok(()),
            Err(DriverError::Failed { message, .. }) => Err(DriverError::Unavailable(message)),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, spec: &CreateSpec) -> DriverResult<RuntimeHandle> {
        let name = runtime_name(spec);
        docker("create", &self.create_args(&name, spec)).await?;
        info!(container = %name, port = spec.port, image = %self.image, "created container");
        Ok(RuntimeHandle {
            id: name,
            port: spec.port,
        })
    }

    async fn start(&self, handle: &RuntimeHandle) -> DriverResult<()> {
        docker("start", &["start".to_string(), handle.id.clone()]).await?;
        Ok(())
    }

    async fn stop(&self, handle: &RuntimeHandle) -> DriverResult<()> {
        let args = ["stop", "-t", STOP_GRACE_SECS, handle.id.as_str()].map(String::from);
        docker_tolerant("stop", &args).await
    }

    async fn remove(&self, handle: &RuntimeHandle) -> DriverResult<()> {
        let args = ["rm", "-f", handle.id.as_str()].map(String::from);
        docker_tolerant("remove", &args).await?;
        info!(container = %handle.id, "removed container");
        Ok(())
    }

    async fn write_files(&self, handle: &RuntimeHandle, files: &FileMap) -> DriverResult<()> {
        for (rel, content) in files {
            let path = Self::container_path(rel, "write_files")?;
            let mut child = Command::new("docker")
                .args([
                    "exec",
                    "-i",
                    handle.id.as_str(),
                    "sh",
                    "-c",
                    r#"mkdir -p "$(dirname "$1")" && cat > "$1""#,
                    "sh",
                    path.as_str(),
                ])
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| spawn_error("write_files", e))?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(content.as_bytes()).await.map_err(|e| {
                    DriverError::failed("write_files", format!("{rel}: stdin: {e}"))
                })?;
                // Dropping stdin closes it so `cat` sees EOF.
            }
            let output = child
                .wait_with_output()
                .await
                .map_err(|e| DriverError::failed("write_files", format!("{rel}: {e}")))?;
            check("write_files", output)?;
        }
        Ok(())
    }

    async fn read_file(&self, handle: &RuntimeHandle, path: &str) -> DriverResult<String> {
        let full = Self::container_path(path, "read_file")?;
        let args = ["exec", handle.id.as_str(), "cat", full.as_str()].map(String::from);
        let output = docker("read_file", &args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn spawn(
        &self,
        handle: &RuntimeHandle,
        request: &SpawnRequest,
    ) -> DriverResult<Spawned> {
        let exec_id = Uuid::new_v4().to_string();
        let workdir = match request.cwd.as_deref() {
            Some(rel) if !rel.is_empty() && rel != "." => Self::container_path(rel, "spawn")?,
            _ => WORKDIR.to_string(),
        };

        let mut args = vec![
            "exec".to_string(),
            "-w".to_string(),
            workdir,
            "-e".to_string(),
            format!("{EXEC_ID_VAR}={exec_id}"),
        ];
        for (k, v) in &request.env {
            args.extend(["-e".to_string(), format!("{k}={v}")]);
        }
        args.push(handle.id.clone());
        args.extend(["sh".to_string(), "-c".to_string(), request.command.clone()]);

        let child = Command::new("docker")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error("spawn", e))?;

        Ok(Spawned { exec_id, child })
    }

    async fn kill(&self, handle: &RuntimeHandle, spawned: &mut Spawned) -> DriverResult<()> {
        // Killing the CLI client alone leaves the process running in the container.
        let args = [
            "exec",
            handle.id.as_str(),
            "sh",
            "-c",
            KILL_BY_EXEC_ID,
            "sh",
            spawned.exec_id.as_str(),
        ]
        .map(String::from);
        let result = docker_tolerant("kill", &args).await;
        let _ = spawned.child.start_kill();
        result
    }

    async fn stats(&self, handle: &RuntimeHandle) -> DriverResult<RuntimeStats> {
        let args = [
            "stats",
            "--no-stream",
            "--format",
            "{{json .}}",
            handle.id.as_str(),
        ]
        .map(String::from);
        let output = docker("stats", &args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| DriverError::failed("stats", "empty docker stats output"))?;
        parse_stats(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceSpec;

    #[test]
    fn parses_sizes() {
        assert_eq!(parse_size("512B"), Some(512));
        assert_eq!(parse_size("1.5KiB"), Some(1536));
        assert_eq!(parse_size(" 12MiB "), Some(12 * 1024 * 1024));
        assert_eq!(parse_size("2GB"), Some(2_000_000_000));
        assert_eq!(parse_size("lots"), None);
    }

    #[test]
    fn parses_stats_line() {
        let line = r#"{"BlockIO":"0B / 0B","CPUPerc":"3.25%","Container":"runbox-u1","MemPerc":"2.00%","MemUsage":"10MiB / 512MiB","Name":"runbox-u1"}"#;
        let stats = parse_stats(line).unwrap();
        assert_eq!(stats.cpu_percent, 3.25);
        assert_eq!(stats.memory_bytes, 10 * 1024 * 1024);
        assert_eq!(stats.memory_limit_bytes, Some(512 * 1024 * 1024));
    }

    #[test]
    fn create_args_publish_port_and_limits() {
        let driver = DockerDriver::new("node:20-alpine".into(), 3000);
        let spec = CreateSpec {
            tenant_id: "u1".into(),
            runtime_id: Uuid::nil(),
            port: 4000,
            resources: ResourceSpec {
                cpus: Some(1.5),
                memory_mb: Some(512),
            },
        };
        let args = driver.create_args("runbox-u1-00000000", &spec);
        let joined = args.join(" ");
        assert!(joined.starts_with("create --name runbox-u1-00000000"));
        assert!(joined.contains("-p 4000:3000"));
        assert!(joined.contains("--memory 512m"));
        assert!(joined.contains("--cpus 1.5"));
        assert!(joined.ends_with("node:20-alpine sleep infinity"));
    }

    #[test]
    fn daemon_errors_are_unavailable() {
        let output = Output {
            status: std::os::unix::process::ExitStatusExt::from_raw(1 << 8),
            stdout: Vec::new(),
            stderr: b"Cannot connect to the Docker daemon at unix:///var/run/docker.sock".to_vec(),
        };
        assert!(matches!(check("create", output), Err(DriverError::Unavailable(_))));
    }

    #[test]
    fn container_paths_stay_under_workdir() {
        assert_eq!(
            DockerDriver::container_path("src/a.js", "write_files").unwrap(),
            "/app/src/a.js"
        );
        assert!(DockerDriver::container_path("../../etc/passwd", "write_files").is_err());
    }
}
