//! In-memory container engine for driving the snapshot engine in tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use snapdock_common::{
    BuildRequest, ContainerDetails, ContainerEngine, ContainerSummary, EngineEvent, EventKind,
    ExecOutput, ImageConfig, ImageRecord, MountInfo, MountKind, Result, SnapError,
};
use tokio::sync::mpsc::UnboundedSender;

/// A finished build as the engine saw it.
#[derive(Debug, Clone)]
pub struct RecordedBuild {
    pub image_id: String,
    pub tags: Vec<String>,
    pub dockerfile: String,
    /// Context files with their permission bits.
    pub files: HashMap<String, (Vec<u8>, u32)>,
    pub labels: HashMap<String, String>,
}

impl RecordedBuild {
    pub fn file(&self, name: &str) -> &[u8] {
        &self.files[name].0
    }

    pub fn text(&self, name: &str) -> String {
        String::from_utf8_lossy(self.file(name)).into_owned()
    }
}

#[derive(Debug, Default)]
pub struct MockState {
    pub containers: Vec<ContainerDetails>,
    pub processes: HashMap<String, Vec<String>>,
    /// Exec results keyed by program name.
    pub exec_results: HashMap<String, ExecOutput>,
    /// Tar archives keyed by (container or image id, path).
    pub files: HashMap<(String, String), Vec<u8>>,
    pub images: Vec<ImageRecord>,
    pub configs: HashMap<String, ImageConfig>,
    pub histories: HashMap<String, Vec<String>>,
    pub events: Vec<EngineEvent>,

    pub calls: usize,
    pub execs: Vec<(String, Vec<String>)>,
    pub commits: Vec<String>,
    pub builds: Vec<RecordedBuild>,
    /// Containers created from images: (id, image).
    pub created: Vec<(String, String)>,
    pub started: Vec<String>,
    pub removed_containers: Vec<String>,
    pub removed_images: Vec<String>,
    pub recreated: Vec<(String, String)>,

    pub fail_top: bool,
    pub fail_commit: bool,
    pub fail_start: bool,
    pub fail_history: bool,
    pub fail_build: Option<String>,
    next_id: usize,
}

impl MockState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }

    fn resolve_config(&self, reference: &str) -> Option<ImageConfig> {
        self.configs.get(reference).cloned()
    }

    fn history_of(&self, image_id: &str) -> Vec<String> {
        self.histories
            .get(image_id)
            .cloned()
            .unwrap_or_else(|| vec![image_id.to_string()])
    }

    fn register_image(&mut self, config: ImageConfig, tags: Vec<String>, history: Vec<String>) {
        for tag in &tags {
            // Moving a tag takes it off its previous image
            for image in &mut self.images {
                image.repo_tags.retain(|t| t != tag);
            }
            self.configs.insert(tag.clone(), config.clone());
        }
        self.images.push(ImageRecord {
            id: config.id.clone(),
            repo_tags: tags,
            labels: config.labels.clone(),
        });
        self.histories.insert(config.id.clone(), history);
        self.configs.insert(config.id.clone(), config);
    }
}

#[derive(Clone, Default)]
pub struct MockEngine {
    pub state: Arc<Mutex<MockState>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn as_engine(&self) -> Arc<dyn ContainerEngine> {
        Arc::new(self.clone())
    }

    /// Register an image with its configuration, listing entry and history.
    pub fn with_image(
        self,
        id: &str,
        tags: &[&str],
        entrypoint: &[&str],
        cmd: &[&str],
        labels: &[(&str, &str)],
        history: &[&str],
    ) -> Self {
        let config = ImageConfig {
            id: id.to_string(),
            entrypoint: strings(entrypoint),
            cmd: strings(cmd),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        let history = if history.is_empty() {
            vec![id.to_string()]
        } else {
            strings(history)
        };
        self.state().register_image(config, strings(tags), history);
        self
    }

    pub fn with_container(self, details: ContainerDetails, processes: &[&str]) -> Self {
        self.state()
            .processes
            .insert(details.id.clone(), strings(processes));
        self.state().containers.push(details);
        self
    }

    pub fn with_exec(self, program: &str, exit_code: i64, stdout: &[u8], stderr: &[u8]) -> Self {
        self.state().exec_results.insert(
            program.to_string(),
            ExecOutput {
                exit_code,
                stdout: stdout.to_vec(),
                stderr: stderr.to_vec(),
            },
        );
        self
    }

    pub fn with_file(self, owner: &str, path: &str, archive: Vec<u8>) -> Self {
        self.state()
            .files
            .insert((owner.to_string(), path.to_string()), archive);
        self
    }

    pub fn with_events(self, events: Vec<EngineEvent>) -> Self {
        self.state().events = events;
        self
    }

    pub fn builds(&self) -> Vec<RecordedBuild> {
        self.state().builds.clone()
    }

    pub fn calls(&self) -> usize {
        self.state().calls
    }

    fn enter(&self) -> MutexGuard<'_, MockState> {
        let mut state = self.state();
        state.calls += 1;
        state
    }
}

pub fn strings(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

pub fn container(id: &str, image_id: &str, image_ref: &str, env: &[&str]) -> ContainerDetails {
    ContainerDetails {
        id: id.to_string(),
        name: format!("{id}-name"),
        image_id: image_id.to_string(),
        image_ref: image_ref.to_string(),
        env: strings(env),
        mounts: Vec::new(),
        running: true,
    }
}

pub fn mount(kind: MountKind, destination: &str) -> MountInfo {
    MountInfo {
        kind,
        source: Some(format!("/host{destination}")),
        destination: destination.to_string(),
    }
}

pub fn image_event(action: &str) -> EngineEvent {
    EngineEvent {
        kind: EventKind::Image,
        action: action.to_string(),
        actor: Some("sha256:abc".to_string()),
    }
}

/// Tar archive as the engine returns it for a copy of `name`.
pub fn tar_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn untar(context: &[u8]) -> HashMap<String, (Vec<u8>, u32)> {
    let mut files = HashMap::new();
    let mut archive = tar::Archive::new(context);
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let mode = entry.header().mode().unwrap();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        files.insert(name, (data, mode));
    }
    files
}

// `LABEL "key"="value"`, unquoted the way the Dockerfile parser does:
// inside double quotes a backslash escapes `"`, `$` and itself.
fn parse_label(rest: &str) -> Option<(String, String)> {
    let (key, rest) = unquote(rest)?;
    let (value, rest) = unquote(rest.strip_prefix('=')?)?;
    rest.is_empty().then_some((key, value))
}

fn unquote(input: &str) -> Option<(String, &str)> {
    let body = input.strip_prefix('"')?;
    let mut out = String::new();
    let mut chars = body.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Some((out, &body[i + 1..])),
            '\\' => match chars.clone().next() {
                Some((_, next @ ('"' | '$' | '\\'))) => {
                    chars.next();
                    out.push(next);
                }
                _ => out.push('\\'),
            },
            // The daemon would expand this against the build environment
            '$' => panic!("unescaped variable reference in LABEL: {input}"),
            c => out.push(c),
        }
    }
    None
}

fn json_list(rest: &str) -> Option<Vec<String>> {
    serde_json::from_str(rest).ok()
}

fn not_found(what: &str) -> SnapError {
    SnapError::Engine(format!("No such object: {what}"))
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let state = self.enter();
        Ok(state
            .containers
            .iter()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                image: c.image_ref.clone(),
                names: vec![format!("/{}", c.name)],
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        let state = self.enter();
        state
            .containers
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    async fn process_names(&self, id: &str) -> Result<Vec<String>> {
        let state = self.enter();
        if state.fail_top {
            return Err(SnapError::Engine(format!("container {id} is not running")));
        }
        Ok(state.processes.get(id).cloned().unwrap_or_default())
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let mut state = self.enter();
        state.execs.push((id.to_string(), cmd.to_vec()));
        let program = cmd.first().cloned().unwrap_or_default();
        state
            .exec_results
            .get(&program)
            .cloned()
            .ok_or_else(|| SnapError::Engine(format!("exec: {program}: not found")))
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        let state = self.enter();
        // Scratch containers read from the image they were created from
        let owner = state
            .created
            .iter()
            .find(|(created, _)| created == id)
            .map(|(_, image)| image.clone())
            .unwrap_or_else(|| id.to_string());
        state
            .files
            .get(&(owner, path.to_string()))
            .cloned()
            .ok_or_else(|| not_found(path))
    }

    async fn commit_container(&self, id: &str) -> Result<String> {
        let mut state = self.enter();
        if state.fail_commit {
            return Err(SnapError::Engine("commit refused".to_string()));
        }
        let container = state
            .containers
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| not_found(id))?;
        let mut config = state
            .resolve_config(&container.image_id)
            .unwrap_or_default();
        let image_id = state.next("sha256:commit");
        config.id = image_id.clone();

        let mut history = vec![image_id.clone()];
        history.extend(state.history_of(&container.image_id));
        state.histories.insert(image_id.clone(), history);
        state.configs.insert(image_id.clone(), config);
        state.commits.push(id.to_string());
        Ok(image_id)
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageConfig> {
        let state = self.enter();
        state
            .resolve_config(reference)
            .ok_or_else(|| not_found(reference))
    }

    async fn list_images(&self) -> Result<Vec<ImageRecord>> {
        Ok(self.enter().images.clone())
    }

    async fn image_history(&self, id: &str) -> Result<Vec<String>> {
        let state = self.enter();
        if state.fail_history {
            return Err(SnapError::Engine("history unavailable".to_string()));
        }
        Ok(state.history_of(id))
    }

    async fn build_image(&self, request: BuildRequest) -> Result<Option<String>> {
        let mut state = self.enter();
        if let Some(error) = state.fail_build.clone() {
            return Err(SnapError::Build(error));
        }

        let files = untar(&request.context);
        let dockerfile = String::from_utf8_lossy(&files[&request.dockerfile].0).into_owned();

        let mut base = None;
        let mut entrypoint = None;
        let mut cmd = None;
        let mut labels = HashMap::new();
        for line in dockerfile.lines() {
            if let Some(rest) = line.strip_prefix("FROM ") {
                base = Some(rest.to_string());
            } else if let Some(rest) = line.strip_prefix("ENTRYPOINT ") {
                entrypoint = json_list(rest);
            } else if let Some(rest) = line.strip_prefix("CMD ") {
                cmd = json_list(rest);
            } else if let Some(rest) = line.strip_prefix("LABEL ") {
                let (key, value) = parse_label(rest).expect("malformed LABEL");
                labels.insert(key, value);
            }
        }

        let base = base.expect("Dockerfile without FROM");
        let base_config = state
            .resolve_config(&base)
            .ok_or_else(|| SnapError::Build(format!("pull access denied for {base}")))?;

        let mut merged = base_config.labels.clone();
        merged.extend(labels.clone());
        let image_id = state.next("sha256:built");
        let config = ImageConfig {
            id: image_id.clone(),
            entrypoint: entrypoint.unwrap_or_else(|| base_config.entrypoint.clone()),
            cmd: cmd.unwrap_or_else(|| base_config.cmd.clone()),
            labels: merged.clone(),
        };

        let mut history = vec![image_id.clone()];
        history.extend(state.history_of(&base_config.id));
        state.register_image(config, request.tags.clone(), history);
        state.builds.push(RecordedBuild {
            image_id: image_id.clone(),
            tags: request.tags,
            dockerfile,
            files,
            labels: merged,
        });
        Ok(Some(image_id))
    }

    async fn create_container(&self, image: &str) -> Result<String> {
        let mut state = self.enter();
        if state.resolve_config(image).is_none() {
            return Err(not_found(image));
        }
        let id = state.next("scratch");
        state.created.push((id.clone(), image.to_string()));
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.enter();
        if state.fail_start {
            return Err(SnapError::Engine(format!("cannot start {id}")));
        }
        state.started.push(id.to_string());
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.enter().removed_containers.push(id.to_string());
        Ok(())
    }

    async fn recreate_container(&self, old_id: &str, image: &str) -> Result<String> {
        let mut state = self.enter();
        if !state.containers.iter().any(|c| c.id == old_id) {
            return Err(not_found(old_id));
        }
        let id = state.next("recreated");
        state.recreated.push((old_id.to_string(), image.to_string()));
        Ok(id)
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        let mut state = self.enter();
        state.removed_images.push(reference.to_string());
        for image in &mut state.images {
            image.repo_tags.retain(|tag| tag != reference);
        }
        state
            .images
            .retain(|image| image.id != reference && !image.repo_tags.is_empty());
        Ok(())
    }

    async fn watch_events(
        &self,
        kinds: &[EventKind],
        sink: UnboundedSender<EngineEvent>,
    ) -> Result<()> {
        let events = self.enter().events.clone();
        for event in events.into_iter().filter(|e| kinds.contains(&e.kind)) {
            if sink.send(event).is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// True when a Docker daemon answers on this machine.
pub fn has_docker() -> bool {
    std::process::Command::new("docker")
        .arg("info")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}
