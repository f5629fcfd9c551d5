//! Event-driven refresh: bursts of engine events collapse into single
//! refresh signals.

use std::sync::Arc;

use snapdock_common::{ContainerEngine, EventKind};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, CatalogHandle};

/// Container actions that change the set of running containers.
pub const CONTAINER_ACTIONS: &[&str] = &["start", "die"];
/// Image actions that change the snapshot catalog.
pub const IMAGE_ACTIONS: &[&str] = &["tag", "delete", "untag"];

/// Subscribe to `kind` events and signal on every matching action. The
/// signal channel holds one pending refresh, so events arriving before the
/// consumer catches up are folded into it. Yields `None` once the engine
/// stream ends.
pub fn refresh_trigger(
    engine: Arc<dyn ContainerEngine>,
    kind: EventKind,
    actions: &'static [&'static str],
) -> mpsc::Receiver<()> {
    let (trigger_tx, trigger_rx) = mpsc::channel(1);
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        if let Err(e) = engine.watch_events(&[kind], event_tx).await {
            warn!(kind = kind.as_str(), error = %e, "Event stream failed");
        }
        debug!(kind = kind.as_str(), "Event stream ended");
    });

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if !actions.contains(&event.action.as_str()) {
                continue;
            }
            match trigger_tx.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Closed(())) => break,
            }
        }
    });

    trigger_rx
}

/// Refresh `handle` on image events and publish each new catalog. A failed
/// refresh keeps the previous catalog and is only logged.
pub fn watch_catalog(
    engine: Arc<dyn ContainerEngine>,
    handle: CatalogHandle,
) -> mpsc::Receiver<Arc<Catalog>> {
    let mut trigger = refresh_trigger(engine, EventKind::Image, IMAGE_ACTIONS);
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        while trigger.recv().await.is_some() {
            match handle.refresh().await {
                Ok(catalog) => {
                    info!(entries = catalog.len(), "Catalog refreshed");
                    if tx.send(catalog).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Catalog refresh failed, keeping previous catalog"),
            }
        }
    });

    rx
}
