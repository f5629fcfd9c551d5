//! Snapshot catalog: the forest of snapshot images, rebuilt from the image
//! store on every refresh.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::try_join_all;
use snapdock_common::snapshot::short_id;
use snapdock_common::{ContainerEngine, Result, ResultExt, Snapshot};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

const UNTAGGED: &str = "<none>:<none>";

/// Arena of catalog entries, newest capture first. Parent and child links
/// are indices into `entries`.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<Snapshot>,
    index: HashMap<String, usize>,
}

impl Catalog {
    /// List the image store and derive the snapshot graph.
    #[instrument(skip_all)]
    pub async fn list(engine: &dyn ContainerEngine) -> Result<Self> {
        let images = engine.list_images().await.stage("list images")?;

        let mut seen = HashSet::new();
        let mut snapshots = Vec::new();
        for mut image in images {
            image.repo_tags.retain(|tag| tag != UNTAGGED);
            if image.repo_tags.is_empty() || !seen.insert(image.id.clone()) {
                continue;
            }
            match Snapshot::from_image(&image) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(image = %image.id, error = %e, "Skipping image with bad labels"),
            }
        }

        // Only snapshots look for parents; base images are roots
        let histories = try_join_all(snapshots.iter().map(|snapshot| async move {
            if snapshot.base_image {
                Ok(Vec::new())
            } else {
                engine.image_history(&snapshot.image_id).await
            }
        }))
        .await
        .stage("image history")?;

        let catalog = Self::assemble(snapshots.into_iter().zip(histories).collect());
        debug!(entries = catalog.len(), "Catalog rebuilt");
        Ok(catalog)
    }

    /// Build the arena from entries paired with their ancestor layer ids,
    /// nearest first. Duplicate image ids keep the first occurrence.
    pub fn assemble(listing: Vec<(Snapshot, Vec<String>)>) -> Self {
        let mut seen = HashSet::new();
        let mut listing: Vec<_> = listing
            .into_iter()
            .filter(|(snapshot, _)| seen.insert(snapshot.image_id.clone()))
            .map(|(mut snapshot, history)| {
                snapshot.parent = None;
                snapshot.children.clear();
                (snapshot, history)
            })
            .collect();

        // Newest first; base images have no capture time and trail
        listing.sort_by(|(a, _), (b, _)| b.created.cmp(&a.created));

        let (mut entries, histories): (Vec<Snapshot>, Vec<Vec<String>>) =
            listing.into_iter().unzip();
        let index: HashMap<String, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, snapshot)| (snapshot.image_id.clone(), i))
            .collect();

        for (child, history) in histories.iter().enumerate() {
            if entries[child].base_image {
                continue;
            }
            let parent = history.iter().find_map(|layer| {
                let &candidate = index.get(layer)?;
                (candidate != child && !Self::descends_from(&entries, candidate, child))
                    .then_some(candidate)
            });
            if let Some(parent) = parent {
                entries[child].parent = Some(parent);
                entries[parent].children.push(child);
            }
        }

        Self { entries, index }
    }

    // True when `ancestor` is reachable from `node` through parent links.
    fn descends_from(entries: &[Snapshot], node: usize, ancestor: usize) -> bool {
        let mut cursor = Some(node);
        let mut steps = 0;
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            steps += 1;
            if steps > entries.len() {
                return true;
            }
            cursor = entries[current].parent;
        }
        false
    }

    pub fn entries(&self) -> &[Snapshot] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, image_id: &str) -> Option<&Snapshot> {
        self.index.get(image_id).map(|&i| &self.entries[i])
    }

    pub fn index_of(&self, image_id: &str) -> Option<usize> {
        self.index.get(image_id).copied()
    }

    /// Resolve a user reference: exact image id, tag, unique id prefix, then
    /// title. Tags win over titles.
    pub fn find(&self, reference: &str) -> Option<&Snapshot> {
        if let Some(snapshot) = self.get(reference) {
            return Some(snapshot);
        }

        let with_latest = format!("{reference}:latest");
        if let Some(snapshot) = self.entries.iter().find(|s| {
            s.image_names
                .iter()
                .any(|name| name == reference || *name == with_latest)
        }) {
            return Some(snapshot);
        }

        let prefix = reference.strip_prefix("sha256:").unwrap_or(reference);
        if prefix.len() >= 4 && prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            let mut matches = self.entries.iter().filter(|s| {
                s.image_id
                    .strip_prefix("sha256:")
                    .unwrap_or(&s.image_id)
                    .starts_with(prefix)
            });
            if let (Some(only), None) = (matches.next(), matches.next()) {
                return Some(only);
            }
        }

        self.entries
            .iter()
            .find(|s| !s.base_image && s.title == reference)
    }

    /// Links are read from this catalog's entry for the same image, so a
    /// snapshot kept from an older catalog resolves against this one.
    pub fn parent(&self, snapshot: &Snapshot) -> Option<&Snapshot> {
        self.get(&snapshot.image_id)?
            .parent
            .and_then(|i| self.entries.get(i))
    }

    pub fn children<'a>(&'a self, snapshot: &Snapshot) -> impl Iterator<Item = &'a Snapshot> + 'a {
        self.get(&snapshot.image_id)
            .into_iter()
            .flat_map(move |own| own.children.iter().filter_map(move |&i| self.entries.get(i)))
    }

    /// Topmost ancestor of `snapshot`.
    pub fn root<'a>(&'a self, snapshot: &'a Snapshot) -> &'a Snapshot {
        let mut current = self.get(&snapshot.image_id).unwrap_or(snapshot);
        while let Some(parent) = self.parent(current) {
            current = parent;
        }
        current
    }

    /// Entries without a parent, in catalog order.
    pub fn roots(&self) -> impl Iterator<Item = &Snapshot> {
        self.entries.iter().filter(|s| s.parent.is_none())
    }

    /// Short human label for an entry.
    pub fn label(snapshot: &Snapshot) -> String {
        if snapshot.base_image {
            snapshot.display_name().to_string()
        } else {
            format!("{} ({})", snapshot.title, short_id(&snapshot.image_id))
        }
    }
}

/// Shared, swappable view of the latest catalog. Readers get an immutable
/// `Arc<Catalog>`; refreshes replace it wholesale.
#[derive(Clone)]
pub struct CatalogHandle {
    engine: Arc<dyn ContainerEngine>,
    current: Arc<RwLock<Arc<Catalog>>>,
}

impl CatalogHandle {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            current: Arc::new(RwLock::new(Arc::new(Catalog::default()))),
        }
    }

    pub async fn current(&self) -> Arc<Catalog> {
        self.current.read().await.clone()
    }

    /// Rebuild the catalog. On failure the previous catalog stays current.
    pub async fn refresh(&self) -> Result<Arc<Catalog>> {
        let catalog = Arc::new(Catalog::list(&*self.engine).await?);
        *self.current.write().await = catalog.clone();
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn base(id: &str, tag: &str) -> Snapshot {
        Snapshot {
            title: String::new(),
            image_id: id.to_string(),
            image_names: vec![tag.to_string()],
            created: None,
            dump_path: None,
            base_image: true,
            parent: None,
            children: Vec::new(),
        }
    }

    fn snap(id: &str, title: &str, hour: u32) -> Snapshot {
        Snapshot {
            title: title.to_string(),
            image_id: id.to_string(),
            image_names: vec![format!("demo:{title}")],
            created: Some(Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()),
            dump_path: Some("/snapdock/dump.sql".to_string()),
            base_image: false,
            parent: None,
            children: Vec::new(),
        }
    }

    fn history(layers: &[&str]) -> Vec<String> {
        layers.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn nearest_known_ancestor_is_parent() {
        let catalog = Catalog::assemble(vec![
            (base("sha256:a", "postgres:13"), vec![]),
            (snap("sha256:b", "v1", 10), history(&["sha256:b", "<missing>", "sha256:a"])),
            (
                snap("sha256:c", "v2", 11),
                history(&["sha256:c", "sha256:x", "sha256:b", "sha256:a"]),
            ),
        ]);

        let a = catalog.get("sha256:a").unwrap();
        let b = catalog.get("sha256:b").unwrap();
        let c = catalog.get("sha256:c").unwrap();
        assert_eq!(catalog.parent(b).unwrap().image_id, "sha256:a");
        assert_eq!(catalog.parent(c).unwrap().image_id, "sha256:b");
        let a_children: Vec<_> = catalog.children(a).map(|s| s.image_id.as_str()).collect();
        assert_eq!(a_children, vec!["sha256:b"]);
        assert_eq!(catalog.root(c).image_id, "sha256:a");
    }

    #[test]
    fn snapshot_from_older_catalog_resolves_against_current_links() {
        let older = Catalog::assemble(vec![
            (base("sha256:a", "postgres:13"), vec![]),
            (snap("sha256:b", "v1", 10), history(&["sha256:b", "sha256:a"])),
            (snap("sha256:c", "v2", 11), history(&["sha256:c", "sha256:b"])),
            (snap("sha256:d", "v3", 13), history(&["sha256:d", "sha256:c"])),
        ]);
        let current = Catalog::assemble(vec![
            (base("sha256:a", "postgres:13"), vec![]),
            (snap("sha256:b", "v1", 10), history(&["sha256:b", "sha256:a"])),
        ]);

        let stale_b = older.get("sha256:b").unwrap().clone();
        assert_eq!(stale_b.parent, Some(3));
        assert_eq!(current.parent(&stale_b).unwrap().image_id, "sha256:a");
        assert_eq!(current.children(&stale_b).count(), 0);
        assert_eq!(current.root(&stale_b).image_id, "sha256:a");

        let gone = older.get("sha256:d").unwrap().clone();
        assert!(current.parent(&gone).is_none());
        assert_eq!(current.children(&gone).count(), 0);
        assert_eq!(current.root(&gone).image_id, "sha256:d");
    }

    #[test]
    fn sorted_newest_first_with_bases_last() {
        let catalog = Catalog::assemble(vec![
            (base("sha256:a", "postgres:13"), vec![]),
            (snap("sha256:b", "v1", 10), vec![]),
            (snap("sha256:c", "v2", 12), vec![]),
        ]);
        let ids: Vec<_> = catalog.entries().iter().map(|s| s.image_id.as_str()).collect();
        assert_eq!(ids, vec!["sha256:c", "sha256:b", "sha256:a"]);
    }

    #[test]
    fn self_and_cyclic_candidates_are_skipped() {
        // Inconsistent lineage: each lists the other as an ancestor
        let catalog = Catalog::assemble(vec![
            (snap("sha256:b", "v1", 10), history(&["sha256:b", "sha256:c"])),
            (snap("sha256:c", "v2", 11), history(&["sha256:c", "sha256:b"])),
        ]);
        let linked = catalog
            .entries()
            .iter()
            .filter(|s| s.parent.is_some())
            .count();
        assert_eq!(linked, 1);
        for entry in catalog.entries() {
            assert_ne!(entry.parent, catalog.index_of(&entry.image_id));
        }
    }

    #[test]
    fn duplicates_are_merged() {
        let catalog = Catalog::assemble(vec![
            (snap("sha256:b", "v1", 10), vec![]),
            (snap("sha256:b", "v1", 10), vec![]),
        ]);
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn find_prefers_tags_over_titles() {
        let mut titled = snap("sha256:1111aaaa", "demo:v2", 10);
        titled.image_names = vec!["other:tag".to_string()];
        let tagged = snap("sha256:2222bbbb", "v2", 11);
        let catalog = Catalog::assemble(vec![(titled, vec![]), (tagged, vec![])]);

        assert_eq!(catalog.find("demo:v2").unwrap().image_id, "sha256:2222bbbb");
        assert_eq!(catalog.find("1111").unwrap().image_id, "sha256:1111aaaa");
        assert_eq!(catalog.find("sha256:2222bbbb").unwrap().title, "v2");
        assert!(catalog.find("nothing").is_none());
    }

    #[test]
    fn find_accepts_implicit_latest_tag() {
        let catalog = Catalog::assemble(vec![(base("sha256:a", "postgres:latest"), vec![])]);
        assert_eq!(catalog.find("postgres").unwrap().image_id, "sha256:a");
    }
}
