//! Unified diff between the dump artifacts of two snapshots.

use std::sync::Arc;

use similar::TextDiff;
use snapdock_common::{ContainerEngine, Result, ResultExt, SnapError, Snapshot};
use tracing::{debug, instrument, warn};

use crate::archive::extract_file;

const CONTEXT_LINES: usize = 3;

/// Diff the dumps of `a` and `b`, labeled by their titles.
///
/// The same snapshot on both sides yields an empty diff without touching
/// the engine. Snapshots without a dump cannot be diffed.
#[instrument(skip_all, fields(a = %a.image_id, b = %b.image_id))]
pub async fn diff(engine: &Arc<dyn ContainerEngine>, a: &Snapshot, b: &Snapshot) -> Result<String> {
    if a.image_id == b.image_id {
        return Ok(String::new());
    }

    let (Some(a_path), Some(b_path)) = (a.dump_path.as_deref(), b.dump_path.as_deref()) else {
        return Err(SnapError::Unsupported(
            "can't diff generic snapshots".to_string(),
        ));
    };

    // Both fetches run to completion so each releases its own container
    let (a_dump, b_dump) = tokio::join!(
        fetch_dump(engine, &a.image_id, a_path),
        fetch_dump(engine, &b.image_id, b_path),
    );
    let (a_dump, b_dump) = (a_dump?, b_dump?);

    Ok(unified_diff(
        &a.title,
        &String::from_utf8_lossy(&a_dump),
        &b.title,
        &String::from_utf8_lossy(&b_dump),
    ))
}

pub fn unified_diff(a_title: &str, a: &str, b_title: &str, b: &str) -> String {
    TextDiff::from_lines(a, b)
        .unified_diff()
        .context_radius(CONTEXT_LINES)
        .header(a_title, b_title)
        .to_string()
}

/// Render diff lines with ANSI colours.
pub fn colorize(diff: &str) -> String {
    let mut out = String::with_capacity(diff.len());
    for line in diff.split_inclusive('\n') {
        let (body, newline) = match line.strip_suffix('\n') {
            Some(body) => (body, "\n"),
            None => (line, ""),
        };
        let colour = if body.starts_with("+++") || body.starts_with("---") {
            "\x1b[1m"
        } else if body.starts_with('+') {
            "\x1b[32m"
        } else if body.starts_with('-') {
            "\x1b[31m"
        } else if body.starts_with("@@") {
            "\x1b[36m"
        } else {
            out.push_str(line);
            continue;
        };
        out.push_str(colour);
        out.push_str(body);
        out.push_str("\x1b[0m");
        out.push_str(newline);
    }
    out
}

async fn fetch_dump(engine: &Arc<dyn ContainerEngine>, image: &str, path: &str) -> Result<Vec<u8>> {
    let scratch = ScratchContainer::create(engine, image)
        .await
        .stage("create scratch container")?;

    let dump = async {
        let archive = engine
            .copy_from_container(scratch.id(), path)
            .await
            .stage("copy dump")?;
        extract_file(&archive, path).stage("extract dump")
    }
    .await;

    scratch.release().await;
    dump
}

/// A never-started container used only to read files out of an image.
/// Removed by `release`, or in the background if dropped first.
struct ScratchContainer {
    engine: Arc<dyn ContainerEngine>,
    id: String,
    armed: bool,
}

impl ScratchContainer {
    async fn create(engine: &Arc<dyn ContainerEngine>, image: &str) -> Result<Self> {
        let id = engine.create_container(image).await?;
        debug!(container = %id, %image, "Created scratch container");
        Ok(Self {
            engine: engine.clone(),
            id,
            armed: true,
        })
    }

    fn id(&self) -> &str {
        &self.id
    }

    /// Stays armed until removal returns, so a cancelled release still
    /// falls back to the drop cleanup.
    async fn release(mut self) {
        if let Err(e) = self.engine.remove_container(&self.id).await {
            warn!(container = %self.id, error = %e, "Failed to remove scratch container");
        }
        self.armed = false;
    }
}

impl Drop for ScratchContainer {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let engine = self.engine.clone();
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = engine.remove_container(&id).await {
                        warn!(container = %id, error = %e, "Failed to remove scratch container");
                    }
                });
            }
            Err(_) => warn!(container = %id, "No runtime to remove scratch container"),
        }
    }
}
