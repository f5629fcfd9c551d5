use std::sync::Arc;

use async_trait::async_trait;
use snapdock_common::{ContainerDetails, ContainerEngine, MountKind, Result, ResultExt};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::Snapshotter;
use crate::build::{build, shell_quote, BuildSpec, StagingDir};
use crate::config::SnapdockConfig;

pub const VOLUMES_ROOT: &str = "/snapdock/volumes";

/// Filesystem capture for containers without a recognised database: the
/// container is committed and every non-bind volume is archived into the
/// image, to be copied back over its mount point on first boot.
pub struct GenericSnapshotter {
    engine: Arc<dyn ContainerEngine>,
    config: SnapdockConfig,
}

impl GenericSnapshotter {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: SnapdockConfig) -> Self {
        Self { engine, config }
    }
}

/// Boot snippet restoring one volume. The copied archive holds the mount
/// point's own directory, so it is copied into the parent.
fn volume_restore_command(destination: &str, staged: &str) -> String {
    let target = shell_quote(destination);
    let staged = shell_quote(staged);
    // Keeps the comment on one line whatever the mount path holds
    let label = destination.escape_debug();
    format!(
        r#"# Restore {label}
if [ ! -e {staged}.restored ]; then
  mkdir -p {target}
  find {target} -mindepth 1 -delete
  cp -R {staged}/. {target}/..
  touch {staged}.restored 2>/dev/null || true
fi"#
    )
}

#[async_trait]
impl Snapshotter for GenericSnapshotter {
    fn name(&self) -> &'static str {
        "generic"
    }

    #[instrument(skip_all, fields(container = %container.id, image = %image_name))]
    async fn create(
        &self,
        container: &ContainerDetails,
        title: &str,
        image_name: &str,
    ) -> Result<()> {
        let staging = StagingDir::new(&self.config)?;
        let capture = Uuid::new_v4().simple().to_string();

        let mut instructions = Vec::new();
        let mut boot_commands = Vec::new();
        for (i, mount) in container.mounts.iter().enumerate() {
            // Host paths are not ours to overwrite on restore
            if mount.kind == MountKind::Bind {
                debug!(destination = %mount.destination, "Skipping bind mount");
                continue;
            }

            let archive = self
                .engine
                .copy_from_container(&container.id, &mount.destination)
                .await
                .stage("dump volume")?;
            let file = format!("volume-{i}.tar");
            staging
                .write(&file, &archive, 0o644)
                .await
                .stage("write volume dump")?;
            debug!(destination = %mount.destination, bytes = archive.len(), "Staged volume");

            let staged = format!("{VOLUMES_ROOT}/{capture}/{i}");
            instructions.push(format!("ADD {file} {staged}"));
            boot_commands.push(volume_restore_command(&mount.destination, &staged));
        }

        let base = self
            .engine
            .commit_container(&container.id)
            .await
            .stage("commit container")?;
        info!(%base, volumes = boot_commands.len(), "Committed filesystem");

        let mut spec = BuildSpec::new(base, staging, title, vec![image_name.to_string()]);
        for line in instructions {
            spec.instruction(line);
        }
        for command in boot_commands {
            spec.boot_command(command);
        }

        build(&*self.engine, spec).await.stage("build image")?;
        Ok(())
    }
}
