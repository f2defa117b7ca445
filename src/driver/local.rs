//! Host-local driver: a runtime is a workspace directory, every command runs
//! as its own process group inside it.
//!
//! CPU and memory caps are recorded but not enforced here; the docker driver
//! is the isolating backend.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    runtime_name, CreateSpec, DriverError, DriverResult, RuntimeDriver, RuntimeHandle,
    RuntimeStats, SpawnRequest, Spawned,
};
use crate::files::{normalize_rel_path, FileMap};

const STOP_GRACE: Duration = Duration::from_secs(2);
const STATS_WINDOW: Duration = Duration::from_millis(250);
const MAX_OPEN_FILES: u64 = 4096;

#[derive(Debug)]
pub struct LocalDriver {
    work_root: PathBuf,
    /// Runtime id -> process groups spawned in it.
    groups: Mutex<HashMap<String, HashSet<i32>>>,
}

impl LocalDriver {
    pub fn new(work_root: PathBuf) -> Self {
        Self {
            work_root,
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn workspace(&self, handle: &RuntimeHandle) -> PathBuf {
        self.work_root.join(&handle.id)
    }

    fn groups(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashSet<i32>>> {
        self.groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Tracked groups that still have members. Finished groups are forgotten
    /// so their ids are never signalled after the kernel reuses them.
    fn group_ids(&self, handle: &RuntimeHandle) -> Vec<i32> {
        let mut groups = self.groups();
        let Some(set) = groups.get_mut(&handle.id) else {
            return Vec::new();
        };
        set.retain(|pgid| group_alive(*pgid));
        set.iter().copied().collect()
    }

    async fn existing_workspace(
        &self,
        handle: &RuntimeHandle,
        op: &'static str,
    ) -> DriverResult<PathBuf> {
        let dir = self.workspace(handle);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            Ok(_) => Err(DriverError::failed(op, format!("{} is not a directory", dir.display()))),
            Err(e) => Err(DriverError::failed(op, format!("{}: {e}", dir.display()))),
        }
    }

    fn scoped(&self, handle: &RuntimeHandle, rel: &str, op: &'static str) -> DriverResult<PathBuf> {
        let rel = normalize_rel_path(rel).map_err(|e| DriverError::failed(op, e.to_string()))?;
        Ok(self.workspace(handle).join(rel))
    }
}

/// Signal a whole process group. A group that is already gone is not an error.
fn signal_group(pgid: i32, signal: Option<Signal>) -> bool {
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pgid, error = %e, "failed to signal process group");
            false
        }
    }
}

fn group_alive(pgid: i32) -> bool {
    signal_group(pgid, None)
}

async fn stop_groups(pgids: &[i32]) {
    let live: Vec<i32> = pgids
        .iter()
        .copied()
        .filter(|pgid| signal_group(*pgid, Some(Signal::SIGTERM)))
        .collect();
    if live.is_empty() {
        return;
    }

    let deadline = tokio::time::Instant::now() + STOP_GRACE;
    while tokio::time::Instant::now() < deadline {
        if !live.iter().any(|pgid| group_alive(*pgid)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    for pgid in live {
        if signal_group(pgid, Some(Signal::SIGKILL)) {
            debug!(pgid, "process group killed after grace period");
        }
    }
}

async fn remove_dir(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[async_trait]
impl RuntimeDriver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn ping(&self) -> DriverResult<()> {
        tokio::fs::create_dir_all(&self.work_root)
            .await
            .map_err(|e| {
                DriverError::Unavailable(format!(
                    "work root {} is not usable: {e}",
                    self.work_root.display()
                ))
            })
    }

    async fn create(&self, spec: &CreateSpec) -> DriverResult<RuntimeHandle> {
        let handle = RuntimeHandle {
            id: runtime_name(spec),
            port: spec.port,
        };
        let dir = self.workspace(&handle);

        // A leftover directory from a crashed process is not reused.
        remove_dir(&dir)
            .await
            .map_err(|e| DriverError::failed("create", format!("clean {}: {e}", dir.display())))?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DriverError::failed("create", format!("mkdir {}: {e}", dir.display())))?;

        self.groups().insert(handle.id.clone(), HashSet::new());
        info!(runtime = %handle.id, dir = %dir.display(), "created local workspace");
        Ok(handle)
    }

    async fn start(&self, handle: &RuntimeHandle) -> DriverResult<()> {
        self.existing_workspace(handle, "start").await.map(|_| ())
    }

    async fn stop(&self, handle: &RuntimeHandle) -> DriverResult<()> {
        let pgids = self.group_ids(handle);
        stop_groups(&pgids).await;
        if let Some(set) = self.groups().get_mut(&handle.id) {
            set.clear();
        }
        debug!(runtime = %handle.id, groups = pgids.len(), "stopped local runtime");
        Ok(())
    }

    async fn remove(&self, handle: &RuntimeHandle) -> DriverResult<()> {
        self.stop(handle).await?;
        let dir = self.workspace(handle);
        remove_dir(&dir)
            .await
            .map_err(|e| DriverError::failed("remove", format!("{}: {e}", dir.display())))?;
        self.groups().remove(&handle.id);
        info!(runtime = %handle.id, "removed local workspace");
        Ok(())
    }

    async fn write_files(&self, handle: &RuntimeHandle, files: &FileMap) -> DriverResult<()> {
        // A removed workspace must not be brought back by a late write.
        self.existing_workspace(handle, "write_files").await?;
        for (rel, content) in files {
            let path = self.scoped(handle, rel, "write_files")?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    DriverError::failed("write_files", format!("mkdir {}: {e}", parent.display()))
                })?;
            }
            tokio::fs::write(&path, content).await.map_err(|e| {
                DriverError::failed("write_files", format!("write {}: {e}", path.display()))
            })?;
        }
        Ok(())
    }

    async fn read_file(&self, handle: &RuntimeHandle, path: &str) -> DriverResult<String> {
        let full = self.scoped(handle, path, "read_file")?;
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| DriverError::failed("read_file", format!("{path}: {e}")))
    }

    async fn spawn(
        &self,
        handle: &RuntimeHandle,
        request: &SpawnRequest,
    ) -> DriverResult<Spawned> {
        let cwd = match request.cwd.as_deref() {
            Some(rel) if !rel.is_empty() && rel != "." => self.scoped(handle, rel, "spawn")?,
            _ => self.workspace(handle),
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(&cwd)
            .env("PORT", handle.port.to_string())
            .env("HOST", "127.0.0.1")
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        // SAFETY: only async-signal-safe setrlimit calls run between fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
                // Raising above an existing lower hard limit is not allowed.
                let _ = setrlimit(Resource::RLIMIT_NOFILE, MAX_OPEN_FILES, MAX_OPEN_FILES);
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| DriverError::failed("spawn", format!("sh -c {:?}: {e}", request.command)))?;

        if let Some(pid) = child.id() {
            let mut groups = self.groups();
            let set = groups.entry(handle.id.clone()).or_default();
            set.retain(|pgid| group_alive(*pgid));
            set.insert(pid as i32);
        }

        Ok(Spawned {
            exec_id: Uuid::new_v4().to_string(),
            child,
        })
    }

    async fn kill(&self, handle: &RuntimeHandle, spawned: &mut Spawned) -> DriverResult<()> {
        if let Some(pid) = spawned.child.id() {
            signal_group(pid as i32, Some(Signal::SIGKILL));
            if let Some(set) = self.groups().get_mut(&handle.id) {
                set.remove(&(pid as i32));
            }
        }
        // Already reaped children report an error here; nothing left to kill.
        let _ = spawned.child.start_kill();
        Ok(())
    }

    async fn stats(&self, handle: &RuntimeHandle) -> DriverResult<RuntimeStats> {
        let pgids: HashSet<i32> = self.group_ids(handle).into_iter().collect();
        proc_stats::sample(&pgids).await
    }
}

#[cfg(target_os = "linux")]
mod proc_stats {
    use std::collections::HashSet;
    use std::sync::OnceLock;

    use super::{DriverError, DriverResult, RuntimeStats, STATS_WINDOW};

    fn ticks_per_sec() -> u64 {
        static TICKS: OnceLock<u64> = OnceLock::new();
        *TICKS.get_or_init(|| {
            // SAFETY: sysconf has no preconditions.
            let v = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
            if v <= 0 {
                100
            } else {
                v as u64
            }
        })
    }

    fn page_size() -> u64 {
        static PAGE: OnceLock<u64> = OnceLock::new();
        *PAGE.get_or_init(|| {
            // SAFETY: sysconf has no preconditions.
            let v = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if v <= 0 {
                4096
            } else {
                v as u64
            }
        })
    }

    /// `(pgrp, utime + stime, rss pages)` from the contents of `/proc/<pid>/stat`.
    pub(super) fn parse_stat(s: &str) -> Option<(i32, u64, u64)> {
        let end = s.rfind(')')?;
        let rest = s.get((end + 2)..)?;
        let parts: Vec<&str> = rest.split_whitespace().collect();
        let pgrp: i32 = parts.get(2)?.parse().ok()?;
        let utime: u64 = parts.get(11)?.parse().ok()?;
        let stime: u64 = parts.get(12)?.parse().ok()?;
        let rss: i64 = parts.get(21)?.parse().ok()?;
        Some((pgrp, utime.saturating_add(stime), rss.max(0) as u64))
    }

    async fn totals(pgids: &HashSet<i32>) -> DriverResult<(u64, u64)> {
        let mut dir = tokio::fs::read_dir("/proc")
            .await
            .map_err(|e| DriverError::failed("stats", format!("read /proc: {e}")))?;
        let mut ticks = 0u64;
        let mut rss_pages = 0u64;
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name();
            let Some(pid) = name.to_str().filter(|n| n.bytes().all(|b| b.is_ascii_digit())) else {
                continue;
            };
            let Ok(stat) = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await else {
                continue;
            };
            if let Some((pgrp, t, rss)) = parse_stat(&stat) {
                if pgids.contains(&pgrp) {
                    ticks = ticks.saturating_add(t);
                    rss_pages = rss_pages.saturating_add(rss);
                }
            }
        }
        Ok((ticks, rss_pages))
    }

    pub(super) async fn sample(pgids: &HashSet<i32>) -> DriverResult<RuntimeStats> {
        if pgids.is_empty() {
            return Ok(RuntimeStats {
                cpu_percent: 0.0,
                memory_bytes: 0,
                memory_limit_bytes: None,
            });
        }
        let started = tokio::time::Instant::now();
        let (t0, _) = totals(pgids).await?;
        tokio::time::sleep(STATS_WINDOW).await;
        let (t1, rss_pages) = totals(pgids).await?;
        let dt = started.elapsed().as_secs_f64();

        let cpu_percent = if dt > 0.0 {
            (t1.saturating_sub(t0) as f64 / ticks_per_sec() as f64) / dt * 100.0
        } else {
            0.0
        };
        Ok(RuntimeStats {
            cpu_percent: (cpu_percent * 100.0).round() / 100.0,
            memory_bytes: rss_pages.saturating_mul(page_size()),
            memory_limit_bytes: None,
        })
    }
}

#[cfg(not(target_os = "linux"))]
mod proc_stats {
    use std::collections::HashSet;

    use super::{DriverError, DriverResult, RuntimeStats};

    pub(super) async fn sample(_pgids: &HashSet<i32>) -> DriverResult<RuntimeStats> {
        Err(DriverError::failed("stats", "process sampling needs /proc"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceSpec;

    fn spec(tenant: &str, port: u16) -> CreateSpec {
        CreateSpec {
            tenant_id: tenant.into(),
            runtime_id: Uuid::new_v4(),
            port,
            resources: ResourceSpec::default(),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn parses_proc_stat_with_spaces_in_comm() {
        let line = "1234 (node server) S 1 1234 1234 0 -1 4194560 100 0 0 0 \
                    150 50 0 0 20 0 11 0 5000 100000000 2500 18446744073709551615";
        let (pgrp, ticks, rss) = proc_stats::parse_stat(line).unwrap();
        assert_eq!(pgrp, 1234);
        assert_eq!(ticks, 200);
        assert_eq!(rss, 2500);
    }

    #[tokio::test]
    async fn workspace_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        let driver = LocalDriver::new(root.path().to_path_buf());
        driver.ping().await.unwrap();

        let handle = driver.create(&spec("u1", 4100)).await.unwrap();
        driver.start(&handle).await.unwrap();

        let mut files = FileMap::new();
        files.insert("src/index.js".into(), "console.log(1)".into());
        driver.write_files(&handle, &files).await.unwrap();
        assert_eq!(
            driver.read_file(&handle, "src/index.js").await.unwrap(),
            "console.log(1)"
        );
        assert!(driver.read_file(&handle, "../escape").await.is_err());

        driver.remove(&handle).await.unwrap();
        assert!(!driver.workspace(&handle).exists());
        // Removing twice is fine.
        driver.remove(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn spawned_commands_see_port_and_workspace() {
        let root = tempfile::tempdir().unwrap();
        let driver = LocalDriver::new(root.path().to_path_buf());
        let handle = driver.create(&spec("u2", 4101)).await.unwrap();

        let request = SpawnRequest {
            command: "echo $PORT; pwd".into(),
            ..SpawnRequest::default()
        };
        let spawned = driver.spawn(&handle, &request).await.unwrap();
        let output = spawned.child.wait_with_output().await.unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines();
        assert_eq!(lines.next(), Some("4101"));
        assert!(lines.next().unwrap().ends_with(&handle.id));

        driver.remove(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn finished_process_groups_are_forgotten() {
        let root = tempfile::tempdir().unwrap();
        let driver = LocalDriver::new(root.path().to_path_buf());
        let handle = driver.create(&spec("u4", 4103)).await.unwrap();

        let request = SpawnRequest {
            command: "true".into(),
            ..SpawnRequest::default()
        };
        for _ in 0..5 {
            let mut spawned = driver.spawn(&handle, &request).await.unwrap();
            assert!(spawned.child.wait().await.unwrap().success());
        }
        assert!(driver.group_ids(&handle).is_empty());

        let background = SpawnRequest {
            command: "sleep 60".into(),
            ..SpawnRequest::default()
        };
        let spawned = driver.spawn(&handle, &background).await.unwrap();
        let pgid = spawned.child.id().unwrap() as i32;
        assert_eq!(driver.group_ids(&handle), vec![pgid]);

        driver.remove(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn writes_after_remove_do_not_recreate_the_workspace() {
        let root = tempfile::tempdir().unwrap();
        let driver = LocalDriver::new(root.path().to_path_buf());
        let handle = driver.create(&spec("u5", 4104)).await.unwrap();
        driver.remove(&handle).await.unwrap();

        let mut files = FileMap::new();
        files.insert("src/late.js".into(), "x".into());
        let err = driver.write_files(&handle, &files).await.unwrap_err();
        assert!(matches!(err, DriverError::Failed { op: "write_files", .. }));
        assert!(!driver.workspace(&handle).exists());
    }

    #[tokio::test]
    async fn stop_kills_background_processes() {
        let root = tempfile::tempdir().unwrap();
        let driver = LocalDriver::new(root.path().to_path_buf());
        let handle = driver.create(&spec("u3", 4102)).await.unwrap();

        let request = SpawnRequest {
            command: "sleep 60".into(),
            ..SpawnRequest::default()
        };
        let mut spawned = driver.spawn(&handle, &request).await.unwrap();
        driver.stop(&handle).await.unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), spawned.child.wait())
            .await
            .expect("process should die on stop")
            .unwrap();
        assert!(!status.success());
        driver.remove(&handle).await.unwrap();
    }
}
