//! Capture strategies: one per database engine plus the filesystem fallback.

mod generic;
mod mongo;
mod mysql;
mod postgres;

pub use generic::GenericSnapshotter;
pub use mongo::MongoSnapshotter;
pub use mysql::MySqlSnapshotter;
pub use postgres::PostgresSnapshotter;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snapdock_common::{ContainerDetails, ContainerEngine, Result, SnapError};
use tracing::{debug, warn};

use crate::config::SnapdockConfig;

/// Database engines with a dump-aware strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Postgres,
    MySql,
    Mongo,
}

impl DatabaseKind {
    /// Classify a container from its process command names. Processes are
    /// tested in listing order and the first recognised one decides.
    pub fn detect<S: AsRef<str>>(process_names: &[S]) -> Option<Self> {
        process_names
            .iter()
            .find_map(|name| Self::classify(name.as_ref()))
    }

    fn classify(process: &str) -> Option<Self> {
        let process = process.to_ascii_lowercase();
        if process.contains("postgres") {
            Some(DatabaseKind::Postgres)
        } else if process.contains("mysql") || process.contains("mariadb") {
            Some(DatabaseKind::MySql)
        } else if process.contains("mongo") {
            Some(DatabaseKind::Mongo)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::Postgres => "postgres",
            DatabaseKind::MySql => "mysql",
            DatabaseKind::Mongo => "mongo",
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One way of turning a running container into a snapshot image.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Capture `container` and build an image tagged `image_name`. Nothing
    /// is tagged when any step fails.
    async fn create(&self, container: &ContainerDetails, title: &str, image_name: &str)
        -> Result<()>;
}

/// Strategy for a detected database, or the generic fallback for `None`.
pub fn snapshotter_for(
    kind: Option<DatabaseKind>,
    engine: Arc<dyn ContainerEngine>,
    config: &SnapdockConfig,
) -> Box<dyn Snapshotter> {
    let config = config.clone();
    match kind {
        Some(DatabaseKind::Postgres) => Box::new(PostgresSnapshotter::new(engine, config)),
        Some(DatabaseKind::MySql) => Box::new(MySqlSnapshotter::new(engine, config)),
        Some(DatabaseKind::Mongo) => Box::new(MongoSnapshotter::new(engine, config)),
        None => Box::new(GenericSnapshotter::new(engine, config)),
    }
}

/// Detect the database running in a container. A failed process listing
/// counts as "no database".
pub async fn detect_database(engine: &dyn ContainerEngine, container_id: &str) -> Option<DatabaseKind> {
    match engine.process_names(container_id).await {
        Ok(processes) => {
            let kind = DatabaseKind::detect(&processes);
            debug!(container = %container_id, ?kind, "Detected database");
            kind
        }
        Err(e) => {
            warn!(container = %container_id, error = %e, "Process listing failed, assuming no database");
            None
        }
    }
}

/// Run a dump command and return its stdout. A non-zero exit is a
/// `CommandFailed` carrying the command's stderr.
pub(crate) async fn run_dump(
    engine: &dyn ContainerEngine,
    container_id: &str,
    cmd: &[String],
) -> Result<Vec<u8>> {
    let output = engine.exec(container_id, cmd).await?;
    if output.exit_code != 0 {
        // Only the program name: arguments may carry credentials
        return Err(SnapError::CommandFailed {
            command: cmd.first().cloned().unwrap_or_default(),
            code: output.exit_code,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

fn argv(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}
