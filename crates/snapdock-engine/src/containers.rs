use snapdock_common::{ContainerDetails, ContainerEngine, Result, ResultExt};
use tracing::debug;

use crate::catalog::Catalog;
use crate::strategy::{detect_database, DatabaseKind};

/// A running container that can be snapshotted.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub details: ContainerDetails,
    pub database: Option<DatabaseKind>,
    /// Image id of the snapshot the container was booted from, if any.
    pub from_snapshot: Option<String>,
}

/// Running containers with their detected database and snapshot origin.
pub async fn list_containers(
    engine: &dyn ContainerEngine,
    catalog: &Catalog,
) -> Result<Vec<ContainerInfo>> {
    let summaries = engine.list_containers().await.stage("list containers")?;

    let mut containers = Vec::with_capacity(summaries.len());
    for summary in summaries {
        // Stopped or removed since the listing
        let details = match engine.inspect_container(&summary.id).await {
            Ok(details) if details.running => details,
            Ok(_) => continue,
            Err(e) => {
                debug!(container = %summary.id, error = %e, "Skipping container");
                continue;
            }
        };

        let database = detect_database(engine, &details.id).await;
        let from_snapshot = catalog
            .get(&details.image_id)
            .filter(|snapshot| !snapshot.base_image)
            .map(|snapshot| snapshot.image_id.clone());

        containers.push(ContainerInfo {
            details,
            database,
            from_snapshot,
        });
    }
    Ok(containers)
}
