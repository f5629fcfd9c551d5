//! Operations on existing snapshots: boot, swap and delete.

use snapdock_common::{ContainerEngine, Result, ResultExt, Snapshot};
use tracing::{info, instrument, warn};

/// Create and start a new container from `snapshot`.
#[instrument(skip_all, fields(snapshot = %snapshot.image_id))]
pub async fn boot(engine: &dyn ContainerEngine, snapshot: &Snapshot) -> Result<String> {
    let id = engine
        .create_container(snapshot.image_ref())
        .await
        .stage("create container")?;

    if let Err(e) = engine.start_container(&id).await {
        if let Err(cleanup) = engine.remove_container(&id).await {
            warn!(container = %id, error = %cleanup, "Failed to remove unstarted container");
        }
        return Err(e.at("start container"));
    }

    info!(container = %id, "Booted snapshot");
    Ok(id)
}

/// Replace a running container with one booted from `snapshot`, keeping its
/// name, environment, host config and networks.
#[instrument(skip_all, fields(container = %container_id, snapshot = %snapshot.image_id))]
pub async fn swap(
    engine: &dyn ContainerEngine,
    container_id: &str,
    snapshot: &Snapshot,
) -> Result<String> {
    let id = engine
        .recreate_container(container_id, snapshot.image_ref())
        .await
        .stage("replace container")?;
    info!(new_container = %id, "Swapped container onto snapshot");
    Ok(id)
}

/// Remove every tag of `snapshot`, or the bare image when it has none.
#[instrument(skip_all, fields(snapshot = %snapshot.image_id))]
pub async fn delete(engine: &dyn ContainerEngine, snapshot: &Snapshot) -> Result<()> {
    if snapshot.image_names.is_empty() {
        engine
            .remove_image(&snapshot.image_id)
            .await
            .stage("remove image")?;
    }
    for name in &snapshot.image_names {
        engine.remove_image(name).await.stage("remove image")?;
        info!(image = %name, "Removed snapshot tag");
    }
    Ok(())
}
