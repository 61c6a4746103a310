use std::collections::HashMap;
use std::io;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, Stats, StatsOptions,
};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{
    HostConfig, PortBinding as DockerPortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info, instrument, warn};

use super::{
    ContainerRuntime, ExecChannel, ExecControl, ExecRequest, InstanceSpec, InstanceStats,
    MountSource, RuntimeHandle, TerminalSize,
};

/// Seconds docker waits for a graceful stop during restart.
const RESTART_GRACE_SECS: isize = 5;

/// Workspace instances as Docker containers.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local daemon and verify it answers.
    pub async fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("connecting to docker daemon")?;
        docker.ping().await.context("pinging docker daemon")?;
        Ok(Self { docker })
    }

    /// Daemon version string, for `codepod check`.
    pub async fn server_version(&self) -> Result<String> {
        let version = self
            .docker
            .version()
            .await
            .context("querying docker version")?;
        Ok(version.version.unwrap_or_else(|| "unknown".into()))
    }

    /// Whether `image` is already pulled.
    pub async fn image_present(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("inspecting image {}", image)),
        }
    }

    fn container_config(spec: &InstanceSpec) -> ContainerConfig<String> {
        let binds = spec
            .mounts
            .iter()
            .map(|m| match &m.source {
                MountSource::HostPath(path) => format!("{}:{}", path.display(), m.target),
                MountSource::Volume(name) => format!("{}:{}", name, m.target),
            })
            .collect();

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/tcp", port.container_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![DockerPortBinding {
                    host_ip: None,
                    host_port: port.host_port.map(|p| p.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            memory: Some(spec.ceiling.memory_bytes as i64),
            cpu_shares: Some(spec.ceiling.cpu_shares as i64),
            binds: Some(binds),
            port_bindings: Some(port_bindings),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::ON_FAILURE),
                maximum_retry_count: Some(spec.restart_max_attempts as i64),
            }),
            ..Default::default()
        };

        ContainerConfig {
            image: Some(spec.image.clone()),
            // Keep the container alive; all work happens through exec.
            cmd: Some(vec!["sleep".into(), "infinity".into()]),
            working_dir: Some(spec.working_dir.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

/// CPU percent of one core from a two-sample stats reading.
fn cpu_percent(stats: &Stats) -> f64 {
    let cpu_delta = stats
        .cpu_stats
        .cpu_usage
        .total_usage
        .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
    let system_delta = stats
        .cpu_stats
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
    if cpu_delta == 0 || system_delta == 0 {
        return 0.0;
    }
    let cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;
    cpu_delta as f64 / system_delta as f64 * cpus * 100.0
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<RuntimeHandle> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), Self::container_config(spec))
            .await
            .with_context(|| format!("creating container {}", spec.name))?;
        for warning in &response.warnings {
            warn!(name = %spec.name, warning = %warning, "docker create warning");
        }
        info!(name = %spec.name, id = %response.id, "container created");
        Ok(RuntimeHandle {
            id: response.id,
            name: spec.name.clone(),
        })
    }

    async fn start(&self, handle: &RuntimeHandle) -> Result<()> {
        self.docker
            .start_container(&handle.id, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("starting container {}", handle.name))?;
        Ok(())
    }

    async fn exec(&self, handle: &RuntimeHandle, request: ExecRequest) -> Result<ExecChannel> {
        let pid_file = format!("/tmp/.codepod-exec-{}.pid", uuid::Uuid::new_v4().simple());
        let created = self
            .docker
            .create_exec(
                &handle.id,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(request.tty),
                    cmd: Some(pid_tracked(&request.command, &pid_file)),
                    env: Some(request.env.clone()),
                    working_dir: request.working_dir.clone(),
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("creating exec in {}", handle.name))?;

        let started = self
            .docker
            .start_exec(
                &created.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: request.tty,
                    output_capacity: None,
                }),
            )
            .await
            .with_context(|| format!("starting exec in {}", handle.name))?;

        let (output, input) = match started {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => bail!("exec in {} started detached", handle.name),
        };

        let control = DockerExecControl {
            docker: self.docker.clone(),
            container_id: handle.id.clone(),
            exec_id: created.id,
            pid_file,
        };
        if let Some(size) = request.size {
            // The process may not have a tty yet; a failed initial resize is harmless.
            if let Err(e) = control.resize(size).await {
                debug!(container = %handle.name, error = %e, "initial exec resize failed");
            }
        }

        let output = output
            .map_ok(|chunk| chunk.into_bytes())
            .map_err(io::Error::other)
            .boxed();

        Ok(ExecChannel {
            input,
            output,
            control: std::sync::Arc::new(control),
        })
    }

    async fn inspect(&self, handle: &RuntimeHandle) -> Result<InstanceStats> {
        let details = self
            .docker
            .inspect_container(&handle.id, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("inspecting container {}", handle.name))?;
        let running = details
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            return Ok(InstanceStats {
                running,
                memory_usage: 0,
                cpu_percent: 0.0,
            });
        }

        let stats = self
            .docker
            .stats(
                &handle.id,
                Some(StatsOptions {
                    stream: false,
                    one_shot: false,
                }),
            )
            .next()
            .await
            .context("docker returned no stats sample")?
            .with_context(|| format!("reading stats for {}", handle.name))?;

        Ok(InstanceStats {
            running,
            memory_usage: stats.memory_stats.usage.unwrap_or(0),
            cpu_percent: cpu_percent(&stats),
        })
    }

    async fn restart(&self, handle: &RuntimeHandle) -> Result<()> {
        self.docker
            .restart_container(
                &handle.id,
                Some(RestartContainerOptions {
                    t: RESTART_GRACE_SECS,
                }),
            )
            .await
            .with_context(|| format!("restarting container {}", handle.name))?;
        Ok(())
    }

    async fn remove(&self, handle: &RuntimeHandle, force: bool) -> Result<()> {
        self.docker
            .remove_container(
                &handle.id,
                Some(RemoveContainerOptions {
                    force,
                    v: false,
                    link: false,
                }),
            )
            .await
            .with_context(|| format!("removing container {}", handle.name))?;
        info!(name = %handle.name, "container removed");
        Ok(())
    }
}

/// Wrap `command` so its pid, as seen inside the container, lands in
/// `pid_file`. `exec` keeps the pid, so the file names the command itself.
fn pid_tracked(command: &[String], pid_file: &str) -> Vec<String> {
    let mut cmd = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!("echo $$ > {} && exec \"$@\"", pid_file),
        "sh".to_string(),
    ];
    cmd.extend(command.iter().cloned());
    cmd
}

/// One-shot command that signals the process recorded in `pid_file`.
fn signal_command(pid_file: &str, signal: &str) -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!(
            "[ -f {f} ] && kill -{s} \"$(cat {f})\" 2>/dev/null; rm -f {f}",
            f = pid_file,
            s = signal
        ),
    ]
}

struct DockerExecControl {
    docker: Docker,
    container_id: String,
    exec_id: String,
    pid_file: String,
}

#[async_trait]
impl ExecControl for DockerExecControl {
    async fn resize(&self, size: TerminalSize) -> Result<()> {
        self.docker
            .resize_exec(
                &self.exec_id,
                ResizeExecOptions {
                    width: size.cols,
                    height: size.rows,
                },
            )
            .await
            .context("resizing exec")?;
        Ok(())
    }

    async fn exit_code(&self) -> Result<Option<i64>> {
        // The attach stream can close slightly before docker records the exit.
        for _ in 0..20 {
            let info = self
                .docker
                .inspect_exec(&self.exec_id)
                .await
                .context("inspecting exec")?;
            if info.running != Some(true) {
                return Ok(info.exit_code);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(None)
    }

    async fn kill(&self) -> Result<()> {
        let info = self
            .docker
            .inspect_exec(&self.exec_id)
            .await
            .context("inspecting exec")?;
        if info.running != Some(true) {
            return Ok(());
        }
        // Docker has no exec kill and the pid it reports belongs to the
        // daemon's namespace, so signal from inside the container.
        let killer = self
            .docker
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    cmd: Some(signal_command(&self.pid_file, "HUP")),
                    ..Default::default()
                },
            )
            .await
            .context("creating kill exec")?;
        let started = self
            .docker
            .start_exec(
                &killer.id,
                Some(StartExecOptions {
                    detach: true,
                    tty: false,
                    output_capacity: None,
                }),
            )
            .await
            .context("starting kill exec")?;
        if let StartExecResults::Attached { .. } = started {
            warn!(exec_id = %self.exec_id, "kill exec attached unexpectedly");
        }
        Ok(())
    }
}
