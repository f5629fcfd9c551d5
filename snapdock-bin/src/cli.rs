use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "snapdock")]
#[command(about = "Snapshot running containers into bootable, restorable images")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List running containers and the database each one runs
    Containers,

    /// Capture a snapshot of a running container
    Create(CreateArgs),

    /// List snapshots and base images, newest first
    List,

    /// Show the lineage tree a snapshot belongs to
    History {
        /// Snapshot tag, id, id prefix or title
        snapshot: String,
    },

    /// Diff the dumps of two snapshots
    Diff {
        from: String,
        to: String,
    },

    /// Start a new container from a snapshot
    Boot { snapshot: String },

    /// Replace a running container with one booted from a snapshot
    Swap {
        snapshot: String,
        /// Container id or name to replace
        container: String,
    },

    /// Remove a snapshot image and all of its tags
    Delete { snapshot: String },

    /// Re-print the catalog whenever images change
    Watch,
}

#[derive(Parser)]
pub struct CreateArgs {
    /// Container id or name
    pub container: String,

    /// Human readable snapshot title
    #[arg(long)]
    pub title: String,

    /// Image name to tag the snapshot with (defaults to a slug of the title)
    #[arg(long)]
    pub tag: Option<String>,

    /// Capture the filesystem only, skipping database dumps
    #[arg(long, default_value_t = false)]
    pub force_generic: bool,

    /// Database user for Postgres dumps
    #[arg(long)]
    pub db_user: Option<String>,
}

impl CreateArgs {
    pub fn image_name(&self) -> String {
        self.tag.clone().unwrap_or_else(|| slug(&self.title))
    }
}

/// Image name derived from a title: lowercase, spaces become `-`, and
/// anything outside word characters, `.` and `-` is dropped.
pub fn slug(title: &str) -> String {
    title
        .to_lowercase()
        .replace(' ', "-")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect()
}
