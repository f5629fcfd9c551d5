use std::io::IsTerminal;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{self, eyre, WrapErr};
use snapdock_common::{ContainerEngine, EventKind, Snapshot};
use snapdock_engine::containers::list_containers;
use snapdock_engine::diff::colorize;
use snapdock_engine::events::{refresh_trigger, watch_catalog, CONTAINER_ACTIONS};
use snapdock_engine::{
    actions, create_snapshot, diff, Catalog, CatalogHandle, DockerEngine, SnapdockConfig,
};
use tracing::{info, warn};

mod cli;
mod render;

use cli::{Cli, Command, CreateArgs};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SnapdockConfig::from_env();
    let engine: Arc<dyn ContainerEngine> =
        Arc::new(DockerEngine::connect().wrap_err("Failed to connect to Docker")?);

    match cli.command {
        Command::Containers => {
            let catalog = Catalog::list(&*engine).await?;
            let containers = list_containers(&*engine, &catalog).await?;
            print!("{}", render::containers_table(&containers));
        }
        Command::Create(args) => create(engine, config, args).await?,
        Command::List => {
            let catalog = Catalog::list(&*engine).await?;
            print!("{}", render::catalog_table(&catalog));
        }
        Command::History { snapshot } => {
            let catalog = Catalog::list(&*engine).await?;
            let selected = find(&catalog, &snapshot)?;
            print!("{}", render::history_tree(&catalog, selected));
        }
        Command::Diff { from, to } => {
            let catalog = Catalog::list(&*engine).await?;
            let (a, b) = (find(&catalog, &from)?, find(&catalog, &to)?);
            let text = diff(&engine, a, b).await?;
            if text.is_empty() {
                println!("No differences.");
            } else if std::io::stdout().is_terminal() {
                print!("{}", colorize(&text));
            } else {
                print!("{text}");
            }
        }
        Command::Boot { snapshot } => {
            let catalog = Catalog::list(&*engine).await?;
            let id = actions::boot(&*engine, find(&catalog, &snapshot)?).await?;
            println!("{id}");
        }
        Command::Swap {
            snapshot,
            container,
        } => {
            let catalog = Catalog::list(&*engine).await?;
            let id = actions::swap(&*engine, &container, find(&catalog, &snapshot)?).await?;
            println!("{id}");
        }
        Command::Delete { snapshot } => {
            let catalog = Catalog::list(&*engine).await?;
            let target = find(&catalog, &snapshot)?;
            actions::delete(&*engine, target).await?;
            info!(image = %target.image_id, "Snapshot deleted");
        }
        Command::Watch => watch(engine).await?,
    }

    Ok(())
}

fn find<'a>(catalog: &'a Catalog, reference: &str) -> eyre::Result<&'a Snapshot> {
    catalog
        .find(reference)
        .ok_or_else(|| eyre!("No snapshot matches '{reference}'"))
}

async fn create(
    engine: Arc<dyn ContainerEngine>,
    mut config: SnapdockConfig,
    args: CreateArgs,
) -> eyre::Result<()> {
    config.force_generic |= args.force_generic;
    if let Some(user) = args.db_user.clone() {
        config.postgres_user = Some(user);
    }

    let image_name = args.image_name();
    let container = engine
        .inspect_container(&args.container)
        .await
        .wrap_err_with(|| format!("Failed to inspect container '{}'", args.container))?;

    let report = create_snapshot(engine, &config, &container, &args.title, &image_name).await?;
    if let Some(e) = &report.fallback_error {
        warn!(error = %e, "Database dump failed; captured the filesystem instead");
    }
    println!("{image_name} ({} snapshot)", report.strategy);
    Ok(())
}

async fn watch(engine: Arc<dyn ContainerEngine>) -> eyre::Result<()> {
    let handle = CatalogHandle::new(engine.clone());
    let catalog = handle.refresh().await?;
    print!("{}", render::catalog_table(&catalog));

    let mut catalogs = watch_catalog(engine.clone(), handle.clone());
    let mut container_changes =
        refresh_trigger(engine.clone(), EventKind::Container, CONTAINER_ACTIONS);

    loop {
        tokio::select! {
            Some(catalog) = catalogs.recv() => {
                println!();
                print!("{}", render::catalog_table(&catalog));
            }
            Some(()) = container_changes.recv() => {
                let catalog = handle.current().await;
                match list_containers(&*engine, &catalog).await {
                    Ok(containers) => {
                        println!();
                        print!("{}", render::containers_table(&containers));
                    }
                    Err(e) => warn!(error = %e, "Container refresh failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
            else => break,
        }
    }

    info!("Stopped watching");
    Ok(())
}
