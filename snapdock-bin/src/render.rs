//! Plain-text views of the catalog and containers.

use std::fmt::Write;

use chrono::SecondsFormat;
use snapdock_common::snapshot::short_id;
use snapdock_common::Snapshot;
use snapdock_engine::containers::ContainerInfo;
use snapdock_engine::Catalog;

pub fn catalog_table(catalog: &Catalog) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<24} {:<12} {:<20} {:<24} PARENT",
        "TITLE", "ID", "CREATED", "TAGS"
    );
    for snapshot in catalog.entries() {
        let created = snapshot
            .created
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_else(|| "base image".to_string());
        let parent = catalog
            .parent(snapshot)
            .map(|parent| parent.display_name().to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{:<24} {:<12} {:<20} {:<24} {}",
            snapshot.display_name(),
            short_id(&snapshot.image_id),
            created,
            snapshot.image_names.join(", "),
            parent
        );
    }
    out
}

/// Lineage tree of `selected`'s root, one entry per line, children
/// indented under their parent. The selected entry is marked with `*`.
pub fn history_tree(catalog: &Catalog, selected: &Snapshot) -> String {
    let mut out = String::new();
    write_node(catalog, catalog.root(selected), selected, 0, &mut out);
    out
}

fn write_node(catalog: &Catalog, node: &Snapshot, selected: &Snapshot, depth: usize, out: &mut String) {
    let marker = if node.image_id == selected.image_id { '*' } else { ' ' };
    let _ = writeln!(out, "{marker} {}{}", "  ".repeat(depth), Catalog::label(node));
    for child in catalog.children(node) {
        write_node(catalog, child, selected, depth + 1, out);
    }
}

pub fn containers_table(containers: &[ContainerInfo]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<12} {:<24} {:<28} {:<10} SNAPSHOT",
        "ID", "NAME", "IMAGE", "DATABASE"
    );
    for info in containers {
        let details = &info.details;
        let _ = writeln!(
            out,
            "{:<12} {:<24} {:<28} {:<10} {}",
            short_id(&details.id),
            details.name,
            details.image_ref,
            info.database.map(|kind| kind.as_str()).unwrap_or("-"),
            info.from_snapshot.as_deref().map(short_id).unwrap_or("-"),
        );
    }
    out
}
