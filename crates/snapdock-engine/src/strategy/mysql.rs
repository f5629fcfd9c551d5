use std::sync::Arc;

use async_trait::async_trait;
use snapdock_common::{ContainerDetails, ContainerEngine, Result, ResultExt};
use tracing::{info, instrument};

use super::{run_dump, Snapshotter};
use crate::build::{build, BuildSpec, StagingDir};
use crate::config::SnapdockConfig;

/// The base image's init hook loads this file on first boot, so no boot
/// script is needed.
pub const DUMP_PATH: &str = "/docker-entrypoint-initdb.d/snapdock-dump.sql";

/// Dumps every database with `mysqldump --all-databases`.
pub struct MySqlSnapshotter {
    engine: Arc<dyn ContainerEngine>,
    config: SnapdockConfig,
}

impl MySqlSnapshotter {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: SnapdockConfig) -> Self {
        Self { engine, config }
    }
}

fn dump_command(container: &ContainerDetails) -> Vec<String> {
    let mut cmd = vec!["mysqldump".to_string(), "--all-databases".to_string()];
    if let Some(password) = container
        .env_var("MYSQL_ROOT_PASSWORD")
        .filter(|p| !p.is_empty())
    {
        cmd.push("--user=root".to_string());
        cmd.push(format!("--password={password}"));
    }
    cmd
}

#[async_trait]
impl Snapshotter for MySqlSnapshotter {
    fn name(&self) -> &'static str {
        "mysql"
    }

    #[instrument(skip_all, fields(container = %container.id, image = %image_name))]
    async fn create(
        &self,
        container: &ContainerDetails,
        title: &str,
        image_name: &str,
    ) -> Result<()> {
        let staging = StagingDir::new(&self.config)?;

        let dump = run_dump(&*self.engine, &container.id, &dump_command(container))
            .await
            .stage("dump")?;
        info!(bytes = dump.len(), "Dumped mysql databases");
        staging.write("dump.sql", &dump, 0o644).await.stage("write dump")?;

        let mut spec = BuildSpec::new(
            &container.image_id,
            staging,
            title,
            vec![image_name.to_string()],
        )
        .with_dump_path(DUMP_PATH);
        spec.instruction(format!("COPY dump.sql {DUMP_PATH}"));

        build(&*self.engine, spec).await.stage("build image")?;
        Ok(())
    }
}
