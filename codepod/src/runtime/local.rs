//! Host-process runtime.
//!
//! Each "instance" is a host directory (the cache directory mounted at the
//! working directory) and every exec is a child process started in it. There
//! is no isolation, no pseudo-terminal and no resource enforcement: resize is
//! a no-op and memory usage is the summed RSS of live children. Used for
//! development hosts without a container daemon and by the test suite.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::{
    ContainerRuntime, ExecChannel, ExecControl, ExecRequest, InstanceSpec, InstanceStats,
    RuntimeHandle, TerminalSize,
};

struct LocalInstance {
    root: PathBuf,
    workdir: String,
    env: Vec<String>,
    running: bool,
    children: Arc<Mutex<HashSet<u32>>>,
}

#[derive(Default)]
pub struct LocalRuntime {
    instances: Mutex<HashMap<String, LocalInstance>>,
}

impl LocalRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map an in-instance path onto the host directory.
    fn host_dir(root: &Path, workdir: &str, requested: Option<&str>) -> PathBuf {
        match requested.and_then(|r| r.strip_prefix(workdir)) {
            Some(rest) => root.join(rest.trim_start_matches('/')),
            None => root.to_path_buf(),
        }
    }

    fn kill_children(children: &Mutex<HashSet<u32>>) {
        let pids: Vec<u32> = match children.lock() {
            Ok(mut set) => set.drain().collect(),
            Err(_) => return,
        };
        for pid in pids {
            signal(pid, libc::SIGKILL);
        }
    }
}

fn signal(pid: u32, sig: libc::c_int) {
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc != 0 {
        debug!(pid, error = %io::Error::last_os_error(), "signal delivery failed");
    }
}

/// Resident set size of a process from `/proc/<pid>/status`.
fn read_rss_bytes(pid: u32) -> u64 {
    let status = match std::fs::read_to_string(format!("/proc/{}/status", pid)) {
        Ok(s) => s,
        Err(_) => return 0,
    };
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

fn lock_err<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("local runtime state lock poisoned")
}

#[async_trait]
impl ContainerRuntime for LocalRuntime {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<RuntimeHandle> {
        let root = spec
            .working_dir_source()
            .cloned()
            .with_context(|| format!("no host directory mounted at {}", spec.working_dir))?;
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating {}", root.display()))?;

        let handle = RuntimeHandle {
            id: uuid::Uuid::new_v4().to_string(),
            name: spec.name.clone(),
        };
        let mut instances = self.instances.lock().map_err(lock_err)?;
        if instances.values().any(|i| i.root == root) {
            bail!("an instance already uses {}", root.display());
        }
        instances.insert(
            handle.id.clone(),
            LocalInstance {
                root,
                workdir: spec.working_dir.clone(),
                env: spec.env.clone(),
                running: false,
                children: Arc::new(Mutex::new(HashSet::new())),
            },
        );
        info!(name = %handle.name, "local instance created");
        Ok(handle)
    }

    async fn start(&self, handle: &RuntimeHandle) -> Result<()> {
        let mut instances = self.instances.lock().map_err(lock_err)?;
        let instance = instances
            .get_mut(&handle.id)
            .with_context(|| format!("unknown instance {}", handle.name))?;
        instance.running = true;
        Ok(())
    }

    async fn exec(&self, handle: &RuntimeHandle, request: ExecRequest) -> Result<ExecChannel> {
        let (cwd, env, children) = {
            let instances = self.instances.lock().map_err(lock_err)?;
            let instance = instances
                .get(&handle.id)
                .with_context(|| format!("unknown instance {}", handle.name))?;
            if !instance.running {
                bail!("instance {} is not running", handle.name);
            }
            (
                Self::host_dir(&instance.root, &instance.workdir, request.working_dir.as_deref()),
                instance.env.clone(),
                Arc::clone(&instance.children),
            )
        };

        let (program, args) = request
            .command
            .split_first()
            .context("exec command is empty")?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for pair in env.iter().chain(request.env.iter()) {
            if let Some((key, value)) = pair.split_once('=') {
                cmd.env(key, value);
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {:?} in {}", program, cwd.display()))?;
        let pid = child.id().context("child exited before it could be tracked")?;
        let stdin = child.stdin.take().context("child stdin not piped")?;
        let stdout = child.stdout.take().context("child stdout not piped")?;
        let stderr = child.stderr.take().context("child stderr not piped")?;

        if let Ok(mut set) = children.lock() {
            set.insert(pid);
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let reaper_children = Arc::clone(&children);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().map(i64::from).unwrap_or(-1),
                Err(e) => {
                    warn!(pid, error = %e, "waiting on child failed");
                    -1
                }
            };
            if let Ok(mut set) = reaper_children.lock() {
                set.remove(&pid);
            }
            let _ = exit_tx.send(Some(code));
        });

        let output = futures::stream::select(ReaderStream::new(stdout), ReaderStream::new(stderr));

        Ok(ExecChannel {
            input: Box::pin(stdin),
            output: output.boxed(),
            control: Arc::new(LocalExecControl { pid, exit: exit_rx }),
        })
    }

    async fn inspect(&self, handle: &RuntimeHandle) -> Result<InstanceStats> {
        let (running, pids) = {
            let instances = self.instances.lock().map_err(lock_err)?;
            let instance = instances
                .get(&handle.id)
                .with_context(|| format!("unknown instance {}", handle.name))?;
            let pids: Vec<u32> = instance
                .children
                .lock()
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            (instance.running, pids)
        };
        let memory_usage = pids.into_iter().map(read_rss_bytes).sum();
        Ok(InstanceStats {
            running,
            memory_usage,
            cpu_percent: 0.0,
        })
    }

    async fn restart(&self, handle: &RuntimeHandle) -> Result<()> {
        let children = {
            let mut instances = self.instances.lock().map_err(lock_err)?;
            let instance = instances
                .get_mut(&handle.id)
                .with_context(|| format!("unknown instance {}", handle.name))?;
            instance.running = true;
            Arc::clone(&instance.children)
        };
        Self::kill_children(&children);
        info!(name = %handle.name, "local instance restarted");
        Ok(())
    }

    async fn remove(&self, handle: &RuntimeHandle, force: bool) -> Result<()> {
        let removed = self.instances.lock().map_err(lock_err)?.remove(&handle.id);
        match removed {
            Some(instance) => {
                Self::kill_children(&instance.children);
                info!(name = %handle.name, "local instance removed");
                Ok(())
            }
            None if force => Ok(()),
            None => bail!("unknown instance {}", handle.name),
        }
    }
}

struct LocalExecControl {
    pid: u32,
    exit: watch::Receiver<Option<i64>>,
}

#[async_trait]
impl ExecControl for LocalExecControl {
    async fn resize(&self, size: TerminalSize) -> Result<()> {
        debug!(pid = self.pid, cols = size.cols, rows = size.rows, "resize ignored without a pty");
        Ok(())
    }

    async fn exit_code(&self) -> Result<Option<i64>> {
        let mut exit = self.exit.clone();
        let code = match exit.wait_for(|code| code.is_some()).await {
            Ok(code) => *code,
            Err(_) => None,
        };
        Ok(code)
    }

    async fn kill(&self) -> Result<()> {
        if self.exit.borrow().is_none() {
            signal(self.pid, libc::SIGKILL);
        }
        Ok(())
    }
}
