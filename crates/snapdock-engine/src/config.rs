use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Runtime settings for capture and staging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapdockConfig {
    /// Skip database-aware strategies and always capture the filesystem.
    pub force_generic: bool,
    /// User to run `pg_dumpall` as. Falls back to the container's
    /// `POSTGRES_USER`, then `postgres`.
    pub postgres_user: Option<String>,
    /// Parent directory for build-context staging directories.
    pub staging_dir: Option<PathBuf>,
}

impl SnapdockConfig {
    /// Read `SNAPDOCK_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let force_generic = match lookup("SNAPDOCK_FORCE_GENERIC") {
            Some(raw) => parse_bool(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "Ignoring unparseable SNAPDOCK_FORCE_GENERIC");
                false
            }),
            None => false,
        };

        Self {
            force_generic,
            postgres_user: lookup("SNAPDOCK_POSTGRES_USER").filter(|u| !u.is_empty()),
            staging_dir: lookup("SNAPDOCK_STAGING_DIR")
                .filter(|d| !d.is_empty())
                .map(PathBuf::from),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
