/// Docker sandbox backend
///
/// **Core Responsibility:**
/// Run one submission against one stdin inside a throwaway container and
/// report raw status, streams and timing through the engine's `Sandbox`
/// contract. Correctness is judged by the harness, never here.
///
/// **Container Rules:**
/// - Network disabled, memory and CPU limited per language
/// - Source and stdin injected base64-encoded through the environment
/// - Hard timeout enforced locally; the container is killed on expiry
/// - Removal guaranteed by a drop guard, even when the caller is cancelled
use crate::config::LanguageConfig;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use gradebox_engine::sandbox::{RuntimeErrorKind, SandboxStatus};
use gradebox_engine::{Sandbox, SandboxError, SandboxRequest, SandboxResponse};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Guarantees container removal on drop
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        // Drop cannot await; removal happens in the background
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to remove container");
            }
        });
    }
}

pub struct DockerSandbox {
    docker: Docker,
    language: LanguageConfig,
    /// Set once the image is known to be local, so later submits skip the check
    image_ready: AtomicBool,
}

impl DockerSandbox {
    pub fn new(language: LanguageConfig) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Transport(format!("failed to connect to Docker daemon: {}", e)))?;
        Ok(Self {
            docker,
            language,
            image_ready: AtomicBool::new(false),
        })
    }

    /// Pull the image if it is not cached locally
    pub async fn ensure_image(&self) -> Result<(), SandboxError> {
        if self.image_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let image = self.language.image.as_str();
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            self.image_ready.store(true, Ordering::Release);
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::Transport(format!("failed to pull image '{}': {}", image, e)))?;
        }

        info!(image = %image, "Image pulled");
        self.image_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Stream logs to completion, then read the exit code
    async fn collect(&self, container_id: &str) -> (String, String, Option<i64>) {
        let mut stdout = String::new();
        let mut stderr = String::new();

        let logs_options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            ..Default::default()
        });
        let mut logs = self.docker.logs(container_id, logs_options);
        while let Some(output) = logs.next().await {
            match output {
                Ok(LogOutput::StdOut { message }) => stdout.push_str(&String::from_utf8_lossy(&message)),
                Ok(LogOutput::StdErr { message }) => stderr.push_str(&String::from_utf8_lossy(&message)),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Error reading container logs");
                    break;
                }
            }
        }

        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait = self.docker.wait_container(container_id, Some(wait_options));
        let exit_code = match wait.next().await {
            Some(Ok(response)) => Some(response.status_code),
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Some(code),
            Some(Err(e)) => {
                warn!(error = %e, "Failed to read container exit code");
                None
            }
            None => None,
        };

        (stdout, stderr, exit_code)
    }
}

/// Map a container exit code onto a sandbox status, annotating stderr for
/// the kills a learner cannot diagnose from their own output
fn status_for_exit(exit_code: Option<i64>, stderr: &mut String) -> SandboxStatus {
    match exit_code {
        Some(0) => SandboxStatus::Accepted,
        Some(137) => {
            stderr.push_str("\n[Container killed: likely exceeded memory limit]");
            SandboxStatus::RuntimeError(RuntimeErrorKind::Other)
        }
        Some(139) => {
            stderr.push_str("\n[Container killed: segmentation fault]");
            SandboxStatus::RuntimeError(RuntimeErrorKind::Segfault)
        }
        Some(_) => SandboxStatus::RuntimeError(RuntimeErrorKind::NonZeroExit),
        None => SandboxStatus::InternalError,
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    #[tracing::instrument(skip(self, request), fields(image = %self.language.image, timeout_ms = request.timeout_ms))]
    async fn submit(&self, request: SandboxRequest) -> Result<SandboxResponse, SandboxError> {
        request.validate()?;
        self.ensure_image().await?;

        let env = vec![
            format!("SOURCE_CODE={}", general_purpose::STANDARD.encode(&request.source)),
            format!("TEST_INPUT={}", general_purpose::STANDARD.encode(&request.stdin)),
        ];

        let config = Config {
            image: Some(self.language.image.clone()),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), self.language.shell_command()]),
            env: Some(env),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(self.language.memory_limit_bytes()),
                nano_cpus: Some(self.language.nano_cpus()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container_name = format!("gradebox-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| SandboxError::Transport(format!("failed to create container: {}", e)))?;

        let container_id = container.id;
        let _guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: container_id.clone(),
        };

        let started = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Transport(format!("failed to start container: {}", e)))?;

        let limit = Duration::from_millis(request.timeout_ms);
        let response = match tokio::time::timeout(limit, self.collect(&container_id)).await {
            Ok((stdout, mut stderr, exit_code)) => {
                debug!(exit_code = ?exit_code, "Container exited");
                let status = status_for_exit(exit_code, &mut stderr);
                SandboxResponse {
                    status,
                    stdout,
                    stderr,
                    time_ms: Some(started.elapsed().as_millis() as u64),
                }
            }
            Err(_) => {
                warn!(timeout_ms = request.timeout_ms, "Execution timed out, killing container");
                if let Err(e) = self
                    .docker
                    .kill_container(&container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(error = %e, "Failed to kill timed-out container");
                }
                SandboxResponse {
                    status: SandboxStatus::TimeLimitExceeded,
                    stdout: String::new(),
                    stderr: "[Execution timed out]".to_string(),
                    time_ms: Some(request.timeout_ms),
                }
            }
        };

        Ok(response)
    }

    fn program_file(&self) -> &str {
        &self.language.file_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LanguageConfigManager;
    use gradebox_engine::sandbox::EchoMode;
    use gradebox_engine::ExecutionOutcome;

    #[test]
    fn test_exit_code_mapping() {
        let mut stderr = String::new();
        assert_eq!(status_for_exit(Some(0), &mut stderr), SandboxStatus::Accepted);
        assert!(stderr.is_empty());

        assert_eq!(
            status_for_exit(Some(1), &mut stderr).outcome(),
            ExecutionOutcome::RuntimeError
        );

        let status = status_for_exit(Some(137), &mut stderr);
        assert_eq!(status.outcome(), ExecutionOutcome::RuntimeError);
        assert!(stderr.contains("memory limit"));

        let mut stderr = String::new();
        assert_eq!(
            status_for_exit(Some(139), &mut stderr),
            SandboxStatus::RuntimeError(RuntimeErrorKind::Segfault)
        );
        assert!(stderr.contains("segmentation fault"));

        assert_eq!(
            status_for_exit(None, &mut String::new()).outcome(),
            ExecutionOutcome::InfraError
        );
    }

    #[tokio::test]
    #[ignore] // Requires a Docker daemon
    async fn test_docker_round_trip() {
        let content = include_str!("../../../config/languages.json");
        let manager = LanguageConfigManager::from_json(content).unwrap();
        let sandbox = DockerSandbox::new(manager.get_config("python").unwrap().clone()).unwrap();

        let response = sandbox
            .submit(SandboxRequest {
                source: "print(int(input()) * 2)".to_string(),
                stdin: "21\n".to_string(),
                expected_output: Some("42".to_string()),
                timeout_ms: 10_000,
                echo_mode: EchoMode::Plain,
            })
            .await
            .unwrap();

        assert_eq!(response.status, SandboxStatus::Accepted);
        assert_eq!(response.stdout.trim(), "42");
    }
}
