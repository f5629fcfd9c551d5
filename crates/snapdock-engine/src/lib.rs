use bollard::errors::Error as BollardError; // Alias bollard error
use snapdock_common::SnapError;
use thiserror::Error;

// Re-export dependencies potentially needed by consumers (like the CLI)
pub use bollard;
pub use snapdock_common as common;

pub mod actions;
pub mod archive;
pub mod build;
pub mod capture;
pub mod catalog;
pub mod config;
pub mod containers;
pub mod diff;
pub mod docker;
pub mod events;
pub mod strategy;

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Docker connection failed: {0}")]
    Connect(#[source] BollardError),
    #[error("Container inspection failed: {0}")]
    Inspect(#[source] BollardError),
    #[error("Process listing failed: {0}")]
    Top(#[source] BollardError),
    #[error("Exec failed: {0}")]
    Exec(#[source] BollardError),
    #[error("Copy from container failed: {0}")]
    Copy(#[source] BollardError),
    #[error("Container commit failed: {0}")]
    Commit(#[source] BollardError),
    #[error("Image build failed: {0}")]
    Build(#[source] BollardError),
    #[error("Container creation failed: {0}")]
    CreationFailed(#[source] BollardError),
    #[error("Container start failed: {0}")]
    StartFailed(#[source] BollardError),
    #[error("Container removal failed: {0}")]
    RemovalFailed(#[source] BollardError),
    #[error("Event stream failed: {0}")]
    Events(#[source] BollardError),
    #[error("Docker API error: {0}")]
    DockerApi(#[from] BollardError), // Catch-all for other bollard errors
    #[error("Unexpected engine response: {0}")]
    Unexpected(String),
}

// Engine failures surface as the shared engine-call error kind
impl From<EngineError> for SnapError {
    fn from(err: EngineError) -> Self {
        SnapError::Engine(err.to_string())
    }
}

pub use capture::{create_snapshot, CaptureReport};
pub use catalog::{Catalog, CatalogHandle};
pub use config::SnapdockConfig;
pub use diff::diff;
pub use docker::DockerEngine;
pub use strategy::{DatabaseKind, Snapshotter};
