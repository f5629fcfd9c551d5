//! `ContainerEngine` backed by the Docker daemon through bollard.

use crate::bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, NetworkingConfig, RemoveContainerOptions,
    StartContainerOptions, TopOptions,
};
use crate::bollard::exec::{CreateExecOptions, StartExecResults};
use crate::bollard::image::{
    BuildImageOptions, CommitContainerOptions, ListImagesOptions, RemoveImageOptions,
    TagImageOptions,
};
use crate::bollard::errors::Error as BollardError;
use crate::bollard::models::{BuildInfo, EventMessageTypeEnum, MountPointTypeEnum};
use crate::bollard::system::EventsOptions;
use crate::bollard::Docker;
use crate::EngineError;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use snapdock_common::{
    BuildRequest, ContainerDetails, ContainerEngine, ContainerSummary, EngineEvent, EventKind,
    ExecOutput, ImageConfig, ImageRecord, MountInfo, MountKind, Result, SnapError,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, instrument};

#[derive(Clone)]
pub struct DockerEngine {
    docker: Arc<Docker>,
}

impl DockerEngine {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }

    /// Connect using the local defaults (`DOCKER_HOST` or the platform socket).
    pub fn connect() -> std::result::Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults().map_err(EngineError::Connect)?;
        Ok(Self::new(Arc::new(docker)))
    }

    async fn tag_extra(&self, image: &str, tag: &str) -> std::result::Result<(), EngineError> {
        let (repo, tag) = split_tag(tag);
        self.docker
            .tag_image(
                image,
                Some(TagImageOptions {
                    repo: repo.to_string(),
                    tag: tag.to_string(),
                }),
            )
            .await
            .map_err(EngineError::Build)
    }
}

/// Split `repo[:tag]` into its parts. A colon that belongs to a registry
/// port (`host:5000/app`) is not a tag separator.
fn split_tag(reference: &str) -> (&str, &str) {
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (reference, "latest"),
    }
}

/// Consume a build progress stream to the end. Error frames fail the build
/// even when the RPC itself succeeded.
async fn drain_build(
    stream: impl Stream<Item = std::result::Result<BuildInfo, BollardError>>,
) -> Result<Option<String>> {
    let mut stream = Box::pin(stream);
    let mut image_id = None;
    while let Some(frame) = stream.next().await {
        let info = frame.map_err(EngineError::Build)?;
        if let Some(error) = info.error {
            return Err(SnapError::Build(error));
        }
        if let Some(line) = info.stream {
            let line = line.trim_end();
            if !line.is_empty() {
                debug!("{}", line);
            }
        }
        if let Some(id) = info.aux.and_then(|aux| aux.id) {
            image_id = Some(id);
        }
    }
    Ok(image_id)
}

fn mount_kind(kind: Option<&MountPointTypeEnum>) -> MountKind {
    match kind {
        Some(MountPointTypeEnum::BIND) => MountKind::Bind,
        Some(MountPointTypeEnum::VOLUME) => MountKind::Volume,
        Some(MountPointTypeEnum::TMPFS) => MountKind::Tmpfs,
        _ => MountKind::Other,
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(EngineError::DockerApi)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    image: c.image.unwrap_or_default(),
                    names: c.names.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(EngineError::Inspect)?;

        let image_id = info.image.unwrap_or_default();
        let config = info.config.unwrap_or_default();
        let mounts = info
            .mounts
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| {
                Some(MountInfo {
                    kind: mount_kind(m.typ.as_ref()),
                    source: m.source,
                    destination: m.destination?,
                })
            })
            .collect();

        Ok(ContainerDetails {
            id: info.id.unwrap_or_else(|| id.to_string()),
            name: info
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            image_ref: config.image.unwrap_or_else(|| image_id.clone()),
            image_id,
            env: config.env.unwrap_or_default(),
            mounts,
            running: info.state.and_then(|s| s.running).unwrap_or(false),
        })
    }

    async fn process_names(&self, id: &str) -> Result<Vec<String>> {
        let top = self
            .docker
            .top_processes(id, Some(TopOptions { ps_args: "-eo pid,comm" }))
            .await
            .map_err(EngineError::Top)?;

        // `comm` is the last requested column
        Ok(top
            .processes
            .unwrap_or_default()
            .into_iter()
            .filter_map(|process| process.last().cloned())
            .collect())
    }

    #[instrument(skip(self), fields(container = %id))]
    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(EngineError::Exec)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(EngineError::Exec)?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(frame) = output.next().await {
                    match frame.map_err(EngineError::Exec)? {
                        LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(EngineError::Unexpected("exec started detached".to_string()).into());
            }
        }

        let status = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(EngineError::Exec)?;
        let exit_code = status.exit_code.ok_or_else(|| {
            EngineError::Unexpected(format!("exec {} reported no exit code", exec.id))
        })?;

        debug!(exit_code, stdout_bytes = stdout.len(), "Exec finished");
        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        let mut stream = Box::pin(self.docker.download_from_container(
            id,
            Some(DownloadFromContainerOptions {
                path: path.to_string(),
            }),
        ));

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            archive.extend_from_slice(&chunk.map_err(EngineError::Copy)?);
        }
        Ok(archive)
    }

    #[instrument(skip(self), fields(container = %id))]
    async fn commit_container(&self, id: &str) -> Result<String> {
        let options = CommitContainerOptions {
            container: id.to_string(),
            pause: true, // Pause container during commit for consistency
            ..Default::default()
        };

        let commit = self
            .docker
            .commit_container(options, Config::<String>::default())
            .await
            .map_err(EngineError::Commit)?;

        let image_id = commit
            .id
            .ok_or_else(|| EngineError::Unexpected("commit returned no image id".to_string()))?;
        info!(%image_id, "Committed container filesystem");
        Ok(image_id)
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageConfig> {
        let image = self
            .docker
            .inspect_image(reference)
            .await
            .map_err(EngineError::DockerApi)?;
        let config = image.config.unwrap_or_default();

        Ok(ImageConfig {
            id: image.id.unwrap_or_else(|| reference.to_string()),
            entrypoint: config.entrypoint.unwrap_or_default(),
            cmd: config.cmd.unwrap_or_default(),
            labels: config.labels.unwrap_or_default(),
        })
    }

    async fn list_images(&self) -> Result<Vec<ImageRecord>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(EngineError::DockerApi)?;

        Ok(images
            .into_iter()
            .map(|img| ImageRecord {
                id: img.id,
                repo_tags: img.repo_tags,
                labels: img.labels,
            })
            .collect())
    }

    async fn image_history(&self, id: &str) -> Result<Vec<String>> {
        let history = self
            .docker
            .image_history(id)
            .await
            .map_err(EngineError::DockerApi)?;
        Ok(history.into_iter().map(|layer| layer.id).collect())
    }

    #[instrument(skip(self, request), fields(tags = ?request.tags))]
    async fn build_image(&self, request: BuildRequest) -> Result<Option<String>> {
        let mut tags = request.tags.iter();
        let primary = tags
            .next()
            .ok_or_else(|| SnapError::InvalidInput("build needs at least one tag".to_string()))?;

        let options = BuildImageOptions {
            dockerfile: request.dockerfile.clone(),
            t: primary.clone(),
            rm: true,
            ..Default::default()
        };

        let stream = self
            .docker
            .build_image(options, None, Some(request.context.into()));
        let image_id = drain_build(stream).await?;

        for tag in tags {
            self.tag_extra(primary, tag).await?;
        }
        Ok(image_id)
    }

    async fn create_container(&self, image: &str) -> Result<String> {
        let created = self
            .docker
            .create_container(
                None::<CreateContainerOptions<String>>,
                Config {
                    image: Some(image.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(EngineError::CreationFailed)?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(EngineError::StartFailed)?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(EngineError::RemovalFailed)?;
        Ok(())
    }

    #[instrument(skip(self), fields(container = %old_id))]
    async fn recreate_container(&self, old_id: &str, image: &str) -> Result<String> {
        let old = self
            .docker
            .inspect_container(old_id, None::<InspectContainerOptions>)
            .await
            .map_err(EngineError::Inspect)?;

        self.docker
            .remove_container(
                old_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(EngineError::RemovalFailed)?;

        let name = old
            .name
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();
        let old_config = old.config.unwrap_or_default();
        let networking_config = old
            .network_settings
            .and_then(|settings| settings.networks)
            .map(|networks| NetworkingConfig {
                endpoints_config: networks,
            });

        // The entrypoint and command are left to the image so the snapshot's
        // boot sequence runs.
        let config = Config {
            image: Some(image.to_string()),
            env: old_config.env,
            user: old_config.user,
            working_dir: old_config.working_dir,
            labels: old_config.labels,
            host_config: old.host_config,
            networking_config,
            ..Default::default()
        };

        let options = (!name.is_empty()).then(|| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });
        let created = self
            .docker
            .create_container(options, config)
            .await
            .map_err(EngineError::CreationFailed)?;

        self.start_container(&created.id).await?;
        info!(new_container = %created.id, %name, "Replaced container");
        Ok(created.id)
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        self.docker
            .remove_image(
                reference,
                Some(RemoveImageOptions {
                    force: true,
                    ..Default::default()
                }),
                None,
            )
            .await
            .map_err(EngineError::DockerApi)?;
        Ok(())
    }

    async fn watch_events(
        &self,
        kinds: &[EventKind],
        sink: UnboundedSender<EngineEvent>,
    ) -> Result<()> {
        let mut filters = HashMap::new();
        filters.insert(
            "type".to_string(),
            kinds.iter().map(|k| k.as_str().to_string()).collect(),
        );

        let mut events = Box::pin(self.docker.events(Some(EventsOptions::<String> {
            filters,
            ..Default::default()
        })));

        while let Some(message) = events.next().await {
            let message = message.map_err(EngineError::Events)?;
            let kind = match message.typ {
                Some(EventMessageTypeEnum::CONTAINER) => EventKind::Container,
                Some(EventMessageTypeEnum::IMAGE) => EventKind::Image,
                _ => continue,
            };
            let event = EngineEvent {
                kind,
                action: message.action.unwrap_or_default(),
                actor: message.actor.and_then(|actor| actor.id),
            };
            if sink.send(event).is_err() {
                // Receiver gone, nobody is listening anymore
                break;
            }
        }
        Ok(())
    }
}
