//! Tar helpers for build contexts and files copied out of containers.

use std::io::Read;
use std::path::Path;

use snapdock_common::{Result, SnapError};
use tar::{Archive, Builder, EntryType};

/// Pack the top-level files of a staging directory into a tar archive,
/// keeping their permission bits. Staging directories are flat.
pub fn context_archive(dir: &Path) -> Result<Vec<u8>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();

    let mut builder = Builder::new(Vec::new());
    for path in &files {
        let Some(name) = path.file_name() else {
            continue;
        };
        builder.append_path_with_name(path, name)?;
    }
    Ok(builder.into_inner()?)
}

/// Read the single regular file that a copy of `path` produced.
pub fn extract_file(archive: &[u8], path: &str) -> Result<Vec<u8>> {
    let wanted = Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| SnapError::Artifact(format!("not a file path: {path}")))?;

    let mut archive = Archive::new(archive);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().trim_end_matches('/').to_string();
        if name != wanted {
            continue;
        }

        return match entry.header().entry_type() {
            EntryType::Regular | EntryType::Continuous => {
                let mut contents = Vec::new();
                entry.read_to_end(&mut contents)?;
                Ok(contents)
            }
            other => Err(SnapError::Artifact(format!(
                "unexpected file type {other:?} at {path}"
            ))),
        };
    }
    Err(SnapError::Artifact(format!("missing file {path}")))
}
