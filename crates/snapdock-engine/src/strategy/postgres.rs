use std::sync::Arc;

use async_trait::async_trait;
use snapdock_common::{ContainerDetails, ContainerEngine, Result, ResultExt};
use tracing::{info, instrument};

use super::{argv, run_dump, Snapshotter};
use crate::build::{build, BuildSpec, StagingDir};
use crate::config::SnapdockConfig;

pub const DUMP_PATH: &str = "/snapdock/dump.sql";
pub const RESTORE_SCRIPT_PATH: &str = "/docker-entrypoint-initdb.d/snapdock-restore.sh";

// Lives inside the data directory, so it survives exactly as long as the
// restored cluster does.
const RESTORED_MARKER: &str = ".snapdock-restored";

/// Dumps the whole cluster with `pg_dumpall`. The image restores it through
/// the base image's init-script hook on first boot.
pub struct PostgresSnapshotter {
    engine: Arc<dyn ContainerEngine>,
    config: SnapdockConfig,
}

impl PostgresSnapshotter {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: SnapdockConfig) -> Self {
        Self { engine, config }
    }

    /// Configured override, then the container's `POSTGRES_USER`, then `postgres`.
    pub fn database_user(&self, container: &ContainerDetails) -> String {
        self.config
            .postgres_user
            .clone()
            .or_else(|| {
                container
                    .env_var("POSTGRES_USER")
                    .filter(|user| !user.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "postgres".to_string())
    }
}

fn restore_script() -> String {
    format!(
        r#"#!/bin/sh
# Errors such as "role already exists" must not stop the boot.
psql --username "${{POSTGRES_USER:-postgres}}" \
  --dbname "${{POSTGRES_DB:-${{POSTGRES_USER:-postgres}}}}" \
  --file {DUMP_PATH} || true
touch "${{PGDATA:-/var/lib/postgresql/data}}/{RESTORED_MARKER}"
"#
    )
}

fn wipe_command() -> String {
    format!(
        r#"# Start from an empty cluster so the init scripts load the dump.
pgdata="${{PGDATA:-/var/lib/postgresql/data}}"
if [ ! -e "${{pgdata}}/{RESTORED_MARKER}" ]; then
  rm -rf "${{pgdata:?}}"/*
fi"#
    )
}

#[async_trait]
impl Snapshotter for PostgresSnapshotter {
    fn name(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip_all, fields(container = %container.id, image = %image_name))]
    async fn create(
        &self,
        container: &ContainerDetails,
        title: &str,
        image_name: &str,
    ) -> Result<()> {
        let staging = StagingDir::new(&self.config)?;
        let user = self.database_user(container);

        let dump = run_dump(
            &*self.engine,
            &container.id,
            &argv(&["pg_dumpall", "--username", &user]),
        )
        .await
        .stage("dump")?;
        info!(%user, bytes = dump.len(), "Dumped postgres cluster");

        staging.write("dump.sql", &dump, 0o644).await.stage("write dump")?;
        staging
            .write("snapdock-restore.sh", restore_script().as_bytes(), 0o755)
            .await
            .stage("write restore script")?;

        let mut spec = BuildSpec::new(
            &container.image_id,
            staging,
            title,
            vec![image_name.to_string()],
        )
        .with_dump_path(DUMP_PATH);
        spec.instruction(format!("COPY dump.sql {DUMP_PATH}"));
        spec.instruction(format!("COPY snapdock-restore.sh {RESTORE_SCRIPT_PATH}"));
        spec.boot_command(wipe_command());

        build(&*self.engine, spec).await.stage("build image")?;
        Ok(())
    }
}
