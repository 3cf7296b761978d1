use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use petdocs::config::{BroadcastBacking, Config};
use petdocs::remote::{
    build_client, DocumentCategory, DocumentId, DocumentPatch, DocumentRecord, DocumentStore,
    RestDocumentStore,
};
use petdocs::sync::{
    Broadcast, BulkAction, DisplayState, DocumentCoordinator, EventSink, LocalBroadcast,
    RefreshOptions, RefreshOutcome, Scope, SharedKeyBroadcast, SyncEvent,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Get the config directory path (~/.config/petdocs/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    let config_dir = PathBuf::from(home).join(".config").join("petdocs");
    Ok(config_dir)
}

/// Create `dir` if needed and restrict it to the current user (Unix only).
fn ensure_private_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory '{}'", dir.display()))?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(dir, perms) {
                    tracing::warn!(
                        path = %dir.display(),
                        error = %e,
                        "Failed to set directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %dir.display(),
                    error = %e,
                    "Failed to read directory metadata"
                );
            }
        }
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(name = "petdocs", about = "Keep pet-record documents in sync with the hosted backend")]
struct Cli {
    /// Config file (default: ~/.config/petdocs/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the documents in a scope (active, bookmarked, archived, pet:<id>)
    List {
        #[arg(default_value = "active")]
        scope: Scope,
    },
    /// Keep scopes in sync and print every change until interrupted
    Watch {
        #[arg(default_value = "active")]
        scopes: Vec<Scope>,
    },
    /// Set or clear the bookmark flag
    Bookmark {
        id: String,
        /// Remove the bookmark instead of setting it
        #[arg(long)]
        off: bool,
    },
    /// Create a time-limited public link
    Share {
        id: String,
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
    /// Revoke a document's public link
    Unshare { id: String },
    /// Archive one or more documents
    Archive {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Restore one or more archived documents
    Restore {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Edit document fields
    Edit(EditArgs),
}

#[derive(Args, Debug)]
struct EditArgs {
    id: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    category: Option<DocumentCategory>,
    /// Attach the document to a pet
    #[arg(long, conflicts_with = "detach_pet")]
    pet: Option<String>,
    /// Detach the document from its pet
    #[arg(long)]
    detach_pet: bool,
}

impl EditArgs {
    fn patch(&self) -> DocumentPatch {
        DocumentPatch {
            name: self.name.clone(),
            category: self.category,
            pet_id: if self.detach_pet {
                Some(None)
            } else {
                self.pet.clone().map(Some)
            },
            ..DocumentPatch::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for debug logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config_dir = get_config_dir()?;
    ensure_private_dir(&config_dir)?;

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from '{}'", config_path.display()))?
        .with_env_overrides();

    let (event_tx, event_rx) = mpsc::channel::<SyncEvent>(64);
    let coordinator = build_coordinator(&config, &config_dir, EventSink::new(event_tx))?;

    match cli.command {
        Command::List { scope } => list(&coordinator, &scope).await,
        Command::Watch { scopes } => watch(&coordinator, scopes, event_rx).await,
        Command::Bookmark { id, off } => {
            let id = DocumentId::from(id);
            load_lists(&coordinator).await;
            coordinator
                .set_bookmark(&id, !off)
                .await
                .into_result()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Failed to update bookmark on {}", id))?;
            println!("{} {}", if off { "Unbookmarked" } else { "Bookmarked" }, id);
            Ok(())
        }
        Command::Share { id, hours } => {
            let id = DocumentId::from(id);
            let link = coordinator
                .generate_share_link(&id, hours)
                .await
                .into_result()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Failed to create share link for {}", id))?;
            println!("{}", link.url);
            println!("Expires: {}", link.expires_at.format("%Y-%m-%d %H:%M UTC"));
            Ok(())
        }
        Command::Unshare { id } => {
            let id = DocumentId::from(id);
            coordinator
                .remove_share_link(&id)
                .await
                .into_result()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Failed to remove share link from {}", id))?;
            println!("Share link removed from {}", id);
            Ok(())
        }
        Command::Archive { ids } => bulk(&coordinator, Scope::Active, BulkAction::Archive, ids).await,
        Command::Restore { ids } => {
            bulk(&coordinator, Scope::Archived, BulkAction::Restore, ids).await
        }
        Command::Edit(args) => {
            let patch = args.patch();
            if patch.is_empty() {
                anyhow::bail!("Nothing to change: pass --name, --category, --pet or --detach-pet");
            }
            let id = DocumentId::from(args.id);
            load_lists(&coordinator).await;
            coordinator
                .update_fields(&id, patch)
                .await
                .into_result()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Failed to edit {}", id))?;
            println!("Updated {}", id);
            Ok(())
        }
    }
}

fn build_coordinator(config: &Config, data_dir: &Path, events: EventSink) -> Result<DocumentCoordinator> {
    if config.backend_url.trim().is_empty() {
        anyhow::bail!("backend_url is not set; add it to the config file");
    }
    let api_key = config.api_key().ok_or_else(|| {
        anyhow::anyhow!("No API key configured (set api_key or PETDOCS_API_KEY)")
    })?;

    let client = build_client().context("Failed to build HTTP client")?;
    let store = RestDocumentStore::new(
        client,
        &config.backend_url,
        api_key,
        config.access_token(),
        config.request_timeout(),
    )
    .context("Invalid backend configuration")?;
    tracing::debug!(store = ?store, "Document store ready");

    let broadcast: Arc<dyn Broadcast> = match config.sync.broadcast {
        BroadcastBacking::SharedKey => Arc::new(
            SharedKeyBroadcast::open(data_dir, config.shared_key_poll())
                .context("Failed to open shared sync key")?,
        ),
        BroadcastBacking::Local => Arc::new(LocalBroadcast::new()),
    };

    let store: Arc<dyn DocumentStore> = Arc::new(store);
    Ok(DocumentCoordinator::new(
        store,
        broadcast,
        config.coordinator(),
        events,
    ))
}

/// Load the three list scopes so mutations can be applied optimistically.
async fn load_lists(coordinator: &DocumentCoordinator) {
    for scope in Scope::LISTS {
        coordinator.load(&scope, RefreshOptions::default()).await;
    }
}

async fn list(coordinator: &DocumentCoordinator, scope: &Scope) -> Result<()> {
    match coordinator
        .load(scope, RefreshOptions::forced().with_feedback())
        .await
    {
        RefreshOutcome::Failed { attempts, error } => {
            anyhow::bail!("Failed to load {} after {} attempt(s): {}", scope, attempts, error)
        }
        outcome => tracing::debug!(scope = %scope, ?outcome, "Loaded scope"),
    }

    let view = coordinator.read(scope);
    if view.records().is_empty() {
        println!("No documents in {}", scope);
        return Ok(());
    }
    for record in view.records() {
        println!("{}", format_record(record));
    }
    Ok(())
}

async fn bulk(
    coordinator: &DocumentCoordinator,
    scope: Scope,
    action: BulkAction,
    ids: Vec<String>,
) -> Result<()> {
    load_lists(coordinator).await;

    for id in ids {
        let id = DocumentId::from(id);
        if !coordinator.select(&scope, &id) {
            eprintln!("Skipping {}: not in {}", id, scope);
        }
    }
    if coordinator.selected(&scope).is_empty() {
        anyhow::bail!("No matching documents to {}", action);
    }

    let report = coordinator.bulk(&scope, action).await;
    for id in &report.succeeded {
        println!("{}: {}", action, id);
    }
    for (id, error) in &report.failed {
        eprintln!("Failed to {} {}: {}", action, id, error);
    }
    if !report.all_succeeded() {
        anyhow::bail!("{} of {} document(s) failed", report.failed.len(), report.total());
    }
    Ok(())
}

async fn watch(
    coordinator: &DocumentCoordinator,
    scopes: Vec<Scope>,
    mut events: mpsc::Receiver<SyncEvent>,
) -> Result<()> {
    for scope in &scopes {
        coordinator.read(scope);
    }

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let runner = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .run(async {
                    let _ = stop_rx.await;
                })
                .await
        })
    };

    // Poll so stale scopes revalidate and settled empty states get reported
    let mut tick_interval = tokio::time::interval(Duration::from_secs(1));
    let mut last_display: Vec<Option<DisplayState>> = vec![None; scopes.len()];

    // Signal handlers for graceful shutdown (Unix only)
    // On non-Unix platforms, these become pending futures that never complete
    #[cfg(unix)]
    let mut sigterm = signal(SignalKind::terminate())?;
    #[cfg(unix)]
    let mut sigint = signal(SignalKind::interrupt())?;

    println!("Watching {} scope(s); Ctrl+C to stop", scopes.len());

    loop {
        #[cfg(unix)]
        let sigterm_fut = sigterm.recv();
        #[cfg(not(unix))]
        let sigterm_fut = std::future::pending::<Option<()>>();

        #[cfg(unix)]
        let sigint_fut = sigint.recv();
        #[cfg(not(unix))]
        let sigint_fut = std::future::pending::<Option<()>>();

        tokio::select! {
            biased;

            _ = sigterm_fut => {
                tracing::info!("Received SIGTERM, shutting down gracefully");
                break;
            }

            _ = sigint_fut => {
                tracing::info!("Received SIGINT, shutting down gracefully");
                break;
            }

            Some(event) = events.recv() => print_event(&event),

            _ = tick_interval.tick() => {
                for (scope, last) in scopes.iter().zip(last_display.iter_mut()) {
                    let view = coordinator.read(scope);
                    if *last != Some(view.display) {
                        match view.display {
                            DisplayState::Loading => {}
                            DisplayState::Empty => println!("[{}] no documents", scope),
                            DisplayState::Populated(count) => {
                                println!("[{}] {} document(s)", scope, count);
                                for record in view.records() {
                                    println!("  {}", format_record(record));
                                }
                            }
                        }
                        *last = Some(view.display);
                    }
                }
            }
        }
    }

    let _ = stop_tx.send(());
    if let Err(e) = runner.await {
        tracing::warn!(error = %e, "Sync loop task failed");
    }
    println!("Goodbye!");
    Ok(())
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::CacheUpdated { .. } => {}
        SyncEvent::RefreshFailed {
            scope,
            attempts,
            error,
        } => eprintln!("[{}] refresh failed after {} attempt(s): {}", scope, attempts, error),
        SyncEvent::MutationFailed {
            document,
            action,
            error,
        } => eprintln!("{} failed for {}: {}", action, document, error),
        SyncEvent::BulkCompleted {
            scope,
            succeeded,
            failed,
        } => println!("[{}] bulk action: {} ok, {} failed", scope, succeeded, failed),
        SyncEvent::TaskPanicked { task, error } => {
            eprintln!("internal error in {}: {}", task, error)
        }
    }
}

fn format_record(record: &DocumentRecord) -> String {
    let mut flags = String::new();
    if record.is_favorite {
        flags.push('*');
    }
    if record.share.is_some() {
        flags.push('@');
    }
    format!(
        "{:<36} {:<2} {:<12} {} ({})",
        record.id.as_str(),
        flags,
        record.category.to_string(),
        record.name,
        record.created_at.format("%Y-%m-%d")
    )
}
