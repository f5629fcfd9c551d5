//! Image build pipeline: turns a staged capture into a tagged, labeled image.
//!
//! The pipeline resolves the ultimate original entrypoint of the base image,
//! optionally wraps it in a boot script that runs restore commands first,
//! writes the build instructions and labels, and hands the staged context
//! to the engine. The staging directory is removed when the `BuildSpec`
//! is dropped, whichever way the build ends.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use snapdock_common::{
    labels, BuildRequest, ContainerEngine, ImageConfig, Result, ResultExt, SnapError,
};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument};

use crate::archive::context_archive;
use crate::config::SnapdockConfig;

pub const DOCKERFILE: &str = "Dockerfile";
pub const BOOT_SCRIPT: &str = "entrypoint.sh";
pub const BOOT_SCRIPT_PATH: &str = "/snapdock/entrypoint.sh";

/// Temporary build-context directory, deleted on drop.
#[derive(Debug)]
pub struct StagingDir {
    dir: TempDir,
}

impl StagingDir {
    pub fn new(config: &SnapdockConfig) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("snapdock-context");
        let dir = match &config.staging_dir {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .stage("make build context dir")?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file at the top of the context with the given permission bits.
    pub async fn write(&self, name: &str, contents: &[u8], mode: u32) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(self.dir.path().join(name))
            .await?;
        file.write_all(contents).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Everything one image build needs. Instructions and boot commands are
/// append-only and keep registration order.
#[derive(Debug)]
pub struct BuildSpec {
    pub base_image: String,
    pub staging: StagingDir,
    pub title: String,
    pub tags: Vec<String>,
    pub dump_path: Option<String>,
    instructions: Vec<String>,
    boot_commands: Vec<String>,
}

impl BuildSpec {
    pub fn new(
        base_image: impl Into<String>,
        staging: StagingDir,
        title: impl Into<String>,
        tags: Vec<String>,
    ) -> Self {
        Self {
            base_image: base_image.into(),
            staging,
            title: title.into(),
            tags,
            dump_path: None,
            instructions: Vec::new(),
            boot_commands: Vec::new(),
        }
    }

    pub fn with_dump_path(mut self, path: impl Into<String>) -> Self {
        self.dump_path = Some(path.into());
        self
    }

    pub fn instruction(&mut self, line: impl Into<String>) {
        self.instructions.push(line.into());
    }

    /// Register a shell snippet to run at container boot, before the
    /// original entrypoint.
    pub fn boot_command(&mut self, command: impl Into<String>) {
        self.boot_commands.push(command.into());
    }

    pub fn instructions(&self) -> &[String] {
        &self.instructions
    }

    pub fn boot_commands(&self) -> &[String] {
        &self.boot_commands
    }
}

/// The entrypoint of the first non-snapshot ancestor: the preserved label
/// when the base is itself a snapshot, else the image's own entrypoint.
pub fn resolve_entrypoint(image: &ImageConfig) -> Result<Vec<String>> {
    match image.labels.get(labels::ORIGINAL_ENTRYPOINT) {
        Some(raw) => serde_json::from_str(raw).map_err(|e| SnapError::MalformedLabel {
            label: labels::ORIGINAL_ENTRYPOINT.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(image.entrypoint.clone()),
    }
}

/// Quote a word for POSIX sh.
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_./:=@%+-,".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Script that runs `commands` in order, then replaces itself with the
/// original entrypoint so the application keeps PID 1 and its arguments.
pub fn boot_script(commands: &[String], entrypoint: &[String]) -> String {
    let mut exec_line = String::from("exec");
    for word in entrypoint {
        exec_line.push(' ');
        exec_line.push_str(&shell_quote(word));
    }
    exec_line.push_str(" \"$@\"");

    format!(
        "#!/bin/sh\n{}\n\n{}\n",
        commands
            .iter()
            .map(|c| c.trim_matches('\n'))
            .collect::<Vec<_>>()
            .join("\n\n"),
        exec_line
    )
}

/// Double-quoted Dockerfile word. `LABEL` expands variables and unescapes
/// backslashes inside double quotes, so `\`, `"` and `$` are escaped.
/// Control characters cannot be carried on an instruction line and become
/// spaces.
pub fn dockerfile_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '\\' | '"' | '$' => {
                quoted.push('\\');
                quoted.push(c);
            }
            c if c.is_control() => quoted.push(' '),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

/// `LABEL` instructions for the snapshot metadata.
pub fn label_instructions(
    title: &str,
    dump_path: Option<&str>,
    created: DateTime<Utc>,
    entrypoint: &[String],
) -> Result<Vec<String>> {
    let entrypoint_json = serde_json::to_string(entrypoint)?;
    let created = created.to_rfc3339_opts(SecondsFormat::Secs, true);
    // Labels are inherited from the base image; an empty dump path masks
    // the one a snapshot base carries
    let lines: Vec<String> = [
        (labels::TITLE, title),
        (labels::DUMP_PATH, dump_path.unwrap_or("")),
        (labels::CREATED, created.as_str()),
        (labels::ORIGINAL_ENTRYPOINT, entrypoint_json.as_str()),
    ]
    .into_iter()
    .map(|(key, value)| format!("LABEL {}={}", dockerfile_quote(key), dockerfile_quote(value)))
    .collect();
    Ok(lines)
}

pub fn dockerfile(base_image: &str, instructions: &[String]) -> String {
    format!("FROM {}\n{}\n", base_image, instructions.join("\n"))
}

/// Run the whole pipeline. Nothing is tagged unless the engine build
/// succeeds; the staging directory goes away with `spec`.
#[instrument(skip_all, fields(base = %spec.base_image, tags = ?spec.tags))]
pub async fn build(engine: &dyn ContainerEngine, spec: BuildSpec) -> Result<Option<String>> {
    let BuildSpec {
        base_image,
        staging,
        title,
        tags,
        dump_path,
        mut instructions,
        boot_commands,
    } = spec;

    let base = engine
        .inspect_image(&base_image)
        .await
        .stage("get base image info")?;
    let entrypoint = resolve_entrypoint(&base).stage("resolve entrypoint")?;

    if !boot_commands.is_empty() {
        let script = boot_script(&boot_commands, &entrypoint);
        staging
            .write(BOOT_SCRIPT, script.as_bytes(), 0o755)
            .await
            .stage("write entrypoint")?;

        instructions.push(format!("COPY {BOOT_SCRIPT} {BOOT_SCRIPT_PATH}"));
        instructions.push(format!(r#"ENTRYPOINT ["{BOOT_SCRIPT_PATH}"]"#));
        // Changing the entrypoint drops the inherited CMD, restate it
        let cmd = serde_json::to_string(&base.cmd).stage("marshal cmd")?;
        instructions.push(format!("CMD {cmd}"));
    } else if base.entrypoint != entrypoint {
        // A snapshot base would otherwise rerun its own restore script
        let entrypoint_json = serde_json::to_string(&entrypoint).stage("marshal entrypoint")?;
        let cmd = serde_json::to_string(&base.cmd).stage("marshal cmd")?;
        instructions.push(format!("ENTRYPOINT {entrypoint_json}"));
        instructions.push(format!("CMD {cmd}"));
    }

    instructions.extend(
        label_instructions(&title, dump_path.as_deref(), Utc::now(), &entrypoint)
            .stage("marshal labels")?,
    );

    staging
        .write(DOCKERFILE, dockerfile(&base_image, &instructions).as_bytes(), 0o644)
        .await
        .stage("write Dockerfile")?;

    // Packing reads every staged payload back from disk
    let dir = staging.path().to_path_buf();
    let context = tokio::task::spawn_blocking(move || context_archive(&dir))
        .await
        .map_err(|e| SnapError::Artifact(format!("context packing task failed: {e}")))
        .and_then(|packed| packed)
        .stage("tar build context")?;

    let image_id = engine
        .build_image(BuildRequest {
            context,
            dockerfile: DOCKERFILE.to_string(),
            tags: tags.clone(),
        })
        .await
        .stage("run build")?;

    info!(image = ?image_id, ?tags, %title, "Built snapshot image");
    Ok(image_id)
}
