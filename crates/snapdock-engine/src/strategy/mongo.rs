use std::sync::Arc;

use async_trait::async_trait;
use snapdock_common::{ContainerDetails, ContainerEngine, Result, ResultExt};
use tracing::{info, instrument};

use super::{run_dump, Snapshotter};
use crate::build::{build, BuildSpec, StagingDir};
use crate::config::SnapdockConfig;

pub const DUMP_PATH: &str = "/snapdock/dump.archive";
pub const RESTORE_SCRIPT_PATH: &str = "/docker-entrypoint-initdb.d/snapdock-restore.sh";

/// Dumps with `mongodump --archive` and restores through an init script.
pub struct MongoSnapshotter {
    engine: Arc<dyn ContainerEngine>,
    config: SnapdockConfig,
}

impl MongoSnapshotter {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: SnapdockConfig) -> Self {
        Self { engine, config }
    }
}

fn dump_command(container: &ContainerDetails) -> Vec<String> {
    let mut cmd = vec!["mongodump".to_string(), "--archive".to_string()];
    let user = container.env_var("MONGO_INITDB_ROOT_USERNAME");
    let password = container.env_var("MONGO_INITDB_ROOT_PASSWORD");
    if let (Some(user), Some(password)) = (user, password) {
        if !user.is_empty() {
            cmd.extend([
                format!("--username={user}"),
                format!("--password={password}"),
                "--authenticationDatabase=admin".to_string(),
            ]);
        }
    }
    cmd
}

fn restore_script() -> String {
    format!("#!/bin/sh\nmongorestore --drop --archive={DUMP_PATH}\n")
}

#[async_trait]
impl Snapshotter for MongoSnapshotter {
    fn name(&self) -> &'static str {
        "mongo"
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
        info!(bytes = dump.len(), "Dumped mongo archive");

        staging.write("dump.archive", &dump, 0o644).await.stage("write dump")?;
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
        spec.instruction(format!("COPY dump.archive {DUMP_PATH}"));
        spec.instruction(format!("COPY snapdock-restore.sh {RESTORE_SCRIPT_PATH}"));

        build(&*self.engine, spec).await.stage("build image")?;
        Ok(())
    }
}
