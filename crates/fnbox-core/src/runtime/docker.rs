// src/runtime/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
#[allow(deprecated)]
use bollard::exec::{StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, ContainerSummaryStateEnum, ExecConfig, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
    InspectContainerOptions as BollardInspectContainerOptionsQuery,
    ListContainersOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions as BollardStartContainerOptionsQuery, StatsOptionsBuilder,
    StopContainerOptionsBuilder, UploadToContainerOptionsBuilder,
};
use bollard::Docker;
use futures_util::stream::{StreamExt, TryStreamExt};
use serde_json::Value;
use std::collections::HashMap;

use super::{ExecOutput, SandboxInfo, SandboxRuntime, SandboxSpec};
use crate::config::EngineConfig;
use crate::errors::SandboxRuntimeError;

/// `SandboxRuntime` backed by the local Docker daemon (or `DOCKER_HOST`).
pub struct DockerRuntime {
    docker: Docker,
    pull_images: bool,
    stop_timeout_secs: i32,
}

impl DockerRuntime {
    pub fn connect(pull_images: bool, stop_timeout_secs: i32) -> Result<Self, SandboxRuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            pull_images,
            stop_timeout_secs,
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, SandboxRuntimeError> {
        Self::connect(config.pull_images, config.stop_timeout_secs)
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxRuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }

        log::info!("Pulling sandbox image {}", image);
        self.docker
            .create_image(
                Some(CreateImageOptionsBuilder::new().from_image(image).build()),
                None,
                None,
            )
            .try_for_each(|info| async move {
                log::debug!("Pulling image: {:?}", info.status);
                Ok(())
            })
            .await?;
        Ok(())
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == 404
    )
}

fn is_not_modified(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == 304
    )
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), SandboxRuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<String, SandboxRuntimeError> {
        if self.pull_images {
            self.ensure_image(&spec.image).await?;
        }

        let options = CreateContainerOptionsBuilder::new().name(&spec.name).build();
        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.keepalive_command.clone()),
            labels: Some(spec.labels.clone()),
            network_disabled: Some(spec.network_disabled),
            host_config: Some(HostConfig {
                memory: Some(spec.limits.memory_bytes),
                cpu_period: Some(spec.limits.cpu_period),
                cpu_quota: Some(spec.limits.cpu_quota),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = self.docker.create_container(Some(options), config).await?;
        if let Err(e) = self
            .docker
            .start_container(&container.id, None::<BollardStartContainerOptionsQuery>)
            .await
        {
            // A created-but-never-started container would block the name.
            let _ = self.remove(&container.id).await;
            return Err(e.into());
        }

        log::debug!("Started sandbox {} ({})", spec.name, container.id);
        Ok(container.id)
    }

    async fn get(&self, name_or_id: &str) -> Result<Option<SandboxInfo>, SandboxRuntimeError> {
        match self
            .docker
            .inspect_container(name_or_id, None::<BollardInspectContainerOptionsQuery>)
            .await
        {
            Ok(details) => Ok(Some(SandboxInfo {
                id: details.id.unwrap_or_else(|| name_or_id.to_string()),
                name: details
                    .name
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                running: details.state.and_then(|s| s.running).unwrap_or(false),
                labels: details.config.and_then(|c| c.labels).unwrap_or_default(),
            })),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, label: &str, value: &str) -> Result<Vec<SandboxInfo>, SandboxRuntimeError> {
        let filters = HashMap::from([("label", vec![format!("{}={}", label, value)])]);
        let options = ListContainersOptionsBuilder::new()
            .all(true)
            .filters(&filters)
            .build();
        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                Some(SandboxInfo {
                    id: summary.id?,
                    name: summary
                        .names
                        .and_then(|names| names.into_iter().next())
                        .map(|n| n.trim_start_matches('/').to_string())
                        .unwrap_or_default(),
                    running: matches!(summary.state, Some(ContainerSummaryStateEnum::RUNNING)),
                    labels: summary.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn stop(&self, id: &str) -> Result<(), SandboxRuntimeError> {
        let options = StopContainerOptionsBuilder::new()
            .t(self.stop_timeout_secs)
            .build();
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) || is_not_modified(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxRuntimeError> {
        let options = RemoveContainerOptionsBuilder::new()
            .force(true)
            .v(true)
            .build();
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_archive(
        &self,
        id: &str,
        target_dir: &str,
        archive: Vec<u8>,
    ) -> Result<(), SandboxRuntimeError> {
        let options = UploadToContainerOptionsBuilder::new().path(target_dir).build();
        self.docker
            .upload_to_container(id, Some(options), bollard::body_full(archive.into()))
            .await?;
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        command: &[String],
        env: &[(String, String)],
    ) -> Result<ExecOutput, SandboxRuntimeError> {
        let config = ExecConfig {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(command.to_vec()),
            env: Some(env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
            ..Default::default()
        };
        let exec = self.docker.create_exec(id, config).await?;

        #[allow(deprecated)]
        let start_options = StartExecOptions {
            detach: false,
            ..Default::default()
        };
        let mut output = String::new();
        match self.docker.start_exec(&exec.id, Some(start_options)).await? {
            StartExecResults::Attached {
                output: mut stream, ..
            } => {
                while let Some(chunk) = stream.next().await {
                    match chunk? {
                        LogOutput::StdOut { message }
                        | LogOutput::StdErr { message }
                        | LogOutput::Console { message } => {
                            output.push_str(&String::from_utf8_lossy(&message))
                        }
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(SandboxRuntimeError::Rejected(
                    "exec started detached; no output to collect".to_string(),
                ))
            }
        }

        let inspected = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecOutput {
            exit_code: inspected.exit_code,
            output,
        })
    }

    async fn kill_running(&self, id: &str) -> Result<(), SandboxRuntimeError> {
        // kill(-1) signals everything but PID 1 (the keepalive) and the caller.
        let command = vec!["sh".to_string(), "-c".to_string(), "kill -9 -1".to_string()];
        let result = self.exec(id, &command, &[]).await?;
        log::debug!(
            "Killed running commands in sandbox {} (exit code {:?})",
            id,
            result.exit_code
        );
        Ok(())
    }

    async fn stats(&self, id: &str) -> Result<Value, SandboxRuntimeError> {
        let options = StatsOptionsBuilder::new().stream(false).one_shot(false).build();
        let mut stream = Box::pin(self.docker.stats(id, Some(options)));
        match stream.next().await {
            Some(stats) => Ok(serde_json::to_value(stats?)?),
            None => Err(SandboxRuntimeError::NotFound(id.to_string())),
        }
    }
}
