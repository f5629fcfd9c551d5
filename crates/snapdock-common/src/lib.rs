// Shared types for the snapshot engine and its callers

use std::collections::HashMap;

use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

pub mod snapshot;

pub use snapshot::{labels, Snapshot};

#[derive(Error, Debug)]
pub enum SnapError {
    #[error("container engine error: {0}")]
    Engine(String),

    #[error("`{command}` exited with status {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i64,
        stderr: String,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("build failed: {0}")]
    Build(String),

    #[error("{0}")]
    Artifact(String),

    #[error("malformed label {label}={value}: {reason}")]
    MalformedLabel {
        label: String,
        value: String,
        reason: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<SnapError>,
    },
}

impl SnapError {
    /// Wrap the error with the pipeline stage it occurred in.
    pub fn at(self, stage: &'static str) -> Self {
        SnapError::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// The innermost error, with every stage annotation peeled off.
    pub fn root(&self) -> &SnapError {
        match self {
            SnapError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for expected "operation not applicable" conditions, such as
    /// diffing a snapshot that carries no dump.
    pub fn is_unsupported(&self) -> bool {
        matches!(self.root(), SnapError::Unsupported(_))
    }
}

// Define the primary Result type for snapshot operations
pub type Result<T> = std::result::Result<T, SnapError>;

/// Attach a stage name to the error of a fallible step.
pub trait ResultExt<T> {
    fn stage(self, stage: &'static str) -> Result<T>;
}

impl<T, E: Into<SnapError>> ResultExt<T> for std::result::Result<T, E> {
    fn stage(self, stage: &'static str) -> Result<T> {
        self.map_err(|e| e.into().at(stage))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Bind,
    Volume,
    Tmpfs,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    pub kind: MountKind,
    pub source: Option<String>,
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub image: String,
    pub names: Vec<String>,
}

/// Inspected state of a container that is a candidate for capture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDetails {
    pub id: String,
    /// Container name without the leading slash.
    pub name: String,
    /// Content-addressed id of the image the container runs.
    pub image_id: String,
    /// The image reference the container was created from, e.g. `postgres:13`.
    pub image_ref: String,
    pub env: Vec<String>,
    pub mounts: Vec<MountInfo>,
    pub running: bool,
}

impl ContainerDetails {
    /// Look up a `KEY=value` entry of the container environment.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            (k == key).then_some(v)
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub id: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Tar archive of the build context.
    pub context: Vec<u8>,
    /// Name of the build instruction file inside the context.
    pub dockerfile: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Container,
    Image,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Container => "container",
            EventKind::Image => "image",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEvent {
    pub kind: EventKind,
    pub action: String,
    pub actor: Option<String>,
}

/// The container engine operations the snapshot engine relies on. The
/// engine is treated as a plain RPC transport: no retries, no caching.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails>;

    /// Command names of the processes running inside the container.
    async fn process_names(&self, id: &str) -> Result<Vec<String>>;

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput>;

    /// Tar archive of `path` inside the container.
    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>>;

    /// Commit the container filesystem to a new untagged image.
    async fn commit_container(&self, id: &str) -> Result<String>;

    async fn inspect_image(&self, reference: &str) -> Result<ImageConfig>;

    async fn list_images(&self) -> Result<Vec<ImageRecord>>;

    /// Ancestor layer ids of the image, nearest first.
    async fn image_history(&self, id: &str) -> Result<Vec<String>>;

    /// Build and tag an image, returning its id when the engine reports one.
    /// Returns only after the progress stream has been fully consumed.
    async fn build_image(&self, request: BuildRequest) -> Result<Option<String>>;

    /// Create a container from `image` without starting it.
    async fn create_container(&self, image: &str) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Replace `old_id` with a started container running `image` that keeps
    /// the old container's name, environment, host config and networks.
    async fn recreate_container(&self, old_id: &str, image: &str) -> Result<String>;

    async fn remove_image(&self, reference: &str) -> Result<()>;

    /// Forward events of the given kinds into `sink` until the engine stream
    /// ends or the receiving side is dropped.
    async fn watch_events(&self, kinds: &[EventKind], sink: UnboundedSender<EngineEvent>)
        -> Result<()>;
}
