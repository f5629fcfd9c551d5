//! Snapshot model and the image labels it is persisted in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ImageRecord, Result, SnapError};

/// Label keys written on every snapshot image. The labels are the only
/// durable state: an image is a snapshot exactly when it carries `CREATED`.
pub mod labels {
    pub const TITLE: &str = "snapdock.title";
    pub const CREATED: &str = "snapdock.created";
    pub const DUMP_PATH: &str = "snapdock.dump-path";
    /// JSON array holding the entrypoint of the first non-snapshot ancestor.
    pub const ORIGINAL_ENTRYPOINT: &str = "snapdock.original-entrypoint";
}

/// One catalog entry: a committed image carrying snapshot labels, or a
/// plain image adopted as a lineage root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub title: String,
    pub image_id: String,
    pub image_names: Vec<String>,
    /// Capture time from the label; `None` for base images.
    pub created: Option<DateTime<Utc>>,
    /// In-image path of the diffable dump, if the capture produced one.
    pub dump_path: Option<String>,
    pub base_image: bool,
    /// Arena index of the nearest known ancestor in the owning catalog.
    pub parent: Option<usize>,
    /// Arena indices of entries whose parent is this one.
    pub children: Vec<usize>,
}

impl Snapshot {
    /// Parse an image listing entry. Images without the `created` label
    /// become base-image roots.
    pub fn from_image(image: &ImageRecord) -> Result<Self> {
        let Some(created_raw) = image.labels.get(labels::CREATED) else {
            return Ok(Snapshot {
                title: String::new(),
                image_id: image.id.clone(),
                image_names: image.repo_tags.clone(),
                created: None,
                dump_path: None,
                base_image: true,
                parent: None,
                children: Vec::new(),
            });
        };

        let created = DateTime::parse_from_rfc3339(created_raw)
            .map_err(|e| SnapError::MalformedLabel {
                label: labels::CREATED.to_string(),
                value: created_raw.clone(),
                reason: e.to_string(),
            })?
            .with_timezone(&Utc);

        let title = match image.labels.get(labels::TITLE) {
            Some(title) if !title.is_empty() => title.clone(),
            _ => image
                .repo_tags
                .first()
                .cloned()
                .unwrap_or_else(|| short_id(&image.id).to_string()),
        };

        let dump_path = image
            .labels
            .get(labels::DUMP_PATH)
            .filter(|path| !path.is_empty())
            .cloned();

        Ok(Snapshot {
            title,
            image_id: image.id.clone(),
            image_names: image.repo_tags.clone(),
            created: Some(created),
            dump_path,
            base_image: false,
            parent: None,
            children: Vec::new(),
        })
    }

    /// Name used when showing the entry: the title for snapshots, the first
    /// tag for base images.
    pub fn display_name(&self) -> &str {
        if !self.base_image {
            return &self.title;
        }
        self.image_names
            .first()
            .map(String::as_str)
            .unwrap_or_else(|| short_id(&self.image_id))
    }

    /// Reference to hand to the engine: the first tag, else the image id.
    pub fn image_ref(&self) -> &str {
        self.image_names
            .first()
            .map(String::as_str)
            .unwrap_or(&self.image_id)
    }
}

/// First 12 hex characters of an image id, with the digest prefix removed.
pub fn short_id(id: &str) -> &str {
    let hex = id.strip_prefix("sha256:").unwrap_or(id);
    hex.get(..12).unwrap_or(hex)
}
