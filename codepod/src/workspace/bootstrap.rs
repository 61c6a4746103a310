//! Environment setup run once inside a freshly started instance.

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::BootstrapConfig;
use crate::error::RuntimeError;
use crate::runtime::{run_to_completion, ContainerRuntime, ExecRequest, RuntimeHandle};

/// Output kept in an [`RuntimeError::EnvironmentSetup`] message.
const ERROR_TAIL_BYTES: usize = 2048;

/// Commands to run, in order. The dependency install is only planned when
/// the manifest exists in the project's cache directory.
pub fn plan(config: &BootstrapConfig, cache_dir: &Path) -> Vec<String> {
    let mut steps: Vec<String> = config
        .global_tools
        .iter()
        .filter(|c| !c.trim().is_empty())
        .cloned()
        .collect();
    if !config.dependency_install.trim().is_empty()
        && !config.dependency_manifest.is_empty()
        && cache_dir.join(&config.dependency_manifest).is_file()
    {
        steps.push(config.dependency_install.clone());
    }
    steps
}

/// Run `steps` sequentially in `working_dir`. The first failing step aborts
/// the sequence.
pub async fn run(
    runtime: &dyn ContainerRuntime,
    handle: &RuntimeHandle,
    project_id: &str,
    working_dir: &str,
    steps: &[String],
    step_timeout: Duration,
) -> Result<(), RuntimeError> {
    for command in steps {
        let request = ExecRequest {
            working_dir: Some(working_dir.to_string()),
            ..ExecRequest::shell(command)
        };
        let output = run_to_completion(runtime, handle, request, step_timeout)
            .await
            .map_err(|e| match RuntimeError::provisioning(project_id, e) {
                RuntimeError::Provisioning { message, .. } => RuntimeError::EnvironmentSetup {
                    project_id: project_id.to_string(),
                    command: command.clone(),
                    message,
                },
                known => known,
            })?;

        if !output.success() {
            let code = output
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".into());
            warn!(
                project_id = %project_id,
                command = %command,
                exit_code = %code,
                "bootstrap step failed"
            );
            return Err(RuntimeError::EnvironmentSetup {
                project_id: project_id.to_string(),
                command: command.clone(),
                message: format!("exit code {}: {}", code, output.tail(ERROR_TAIL_BYTES)),
            });
        }
        info!(project_id = %project_id, command = %command, "bootstrap step complete");
    }
    Ok(())
}
