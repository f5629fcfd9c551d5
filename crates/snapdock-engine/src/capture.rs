//! Snapshot creation with the database-aware first attempt and the
//! generic fallback.

use std::sync::Arc;

use snapdock_common::{ContainerDetails, ContainerEngine, Result, SnapError};
use tracing::{error, info, instrument, warn};

use crate::config::SnapdockConfig;
use crate::strategy::{detect_database, snapshotter_for, DatabaseKind, GenericSnapshotter, Snapshotter};

/// Outcome of a successful capture.
#[derive(Debug)]
pub struct CaptureReport {
    /// Name of the strategy that produced the image.
    pub strategy: &'static str,
    pub database: Option<DatabaseKind>,
    /// Failure of the database-aware attempt when the generic fallback ran.
    pub fallback_error: Option<SnapError>,
}

/// Capture `container` as an image tagged `tag`.
///
/// A detected database is dumped with its own strategy first. If that fails
/// the filesystem strategy runs once; if it fails too, its error is
/// returned and the first failure is logged.
#[instrument(skip_all, fields(container = %container.id, %tag))]
pub async fn create_snapshot(
    engine: Arc<dyn ContainerEngine>,
    config: &SnapdockConfig,
    container: &ContainerDetails,
    title: &str,
    tag: &str,
) -> Result<CaptureReport> {
    if title.trim().is_empty() {
        return Err(SnapError::InvalidInput(
            "snapshot title must not be empty".to_string(),
        ));
    }
    if tag.trim().is_empty() {
        return Err(SnapError::InvalidInput(
            "image tag must not be empty".to_string(),
        ));
    }

    let database = if config.force_generic {
        None
    } else {
        detect_database(&*engine, &container.id).await
    };

    let generic = GenericSnapshotter::new(engine.clone(), config.clone());
    let Some(kind) = database else {
        generic.create(container, title, tag).await?;
        info!(strategy = generic.name(), "Snapshot created");
        return Ok(CaptureReport {
            strategy: generic.name(),
            database: None,
            fallback_error: None,
        });
    };

    let specialised = snapshotter_for(Some(kind), engine, config);
    let first_error = match specialised.create(container, title, tag).await {
        Ok(()) => {
            info!(strategy = specialised.name(), "Snapshot created");
            return Ok(CaptureReport {
                strategy: specialised.name(),
                database: Some(kind),
                fallback_error: None,
            });
        }
        Err(e) => e,
    };

    warn!(
        strategy = specialised.name(),
        error = %first_error,
        "Database-aware snapshot failed, falling back to generic"
    );
    match generic.create(container, title, tag).await {
        Ok(()) => {
            info!(strategy = generic.name(), "Snapshot created");
            Ok(CaptureReport {
                strategy: generic.name(),
                database: Some(kind),
                fallback_error: Some(first_error),
            })
        }
        Err(e) => {
            error!(
                strategy = specialised.name(),
                error = %first_error,
                "Database-aware snapshot failed before the generic fallback"
            );
            Err(e)
        }
    }
}
