//! template-daemon: keeps a vault's notes in sync with their metadata templates.
//!
//! Watches the vault directory, coalesces bursts of changes per note and feeds
//! each settled note into the template engine.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use template_core::{
    ChangeCoalescer, Settings, Subscription, SyncError, SyncReport, SyncState, TemplateSync,
};
use template_daemon::native_store::NativeStore;
use template_daemon::prompt::{ConfirmMode, StdinConfirm};
use template_daemon::watcher::{FileEvent, FileEventKind, FileWatcher};

/// Settings file looked up in the vault when `--settings` is not given.
const SETTINGS_FILE: &str = ".template-sync.json";

#[derive(Parser, Debug)]
#[command(name = "template-daemon")]
#[command(about = "Propagates frontmatter templates to the notes that reference them")]
struct Args {
    /// Path to the vault directory
    #[arg(short, long)]
    vault: PathBuf,

    /// JSON settings file (defaults to <vault>/.template-sync.json)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Tag marking templates; notes reference them with <tag>/<name>
    #[arg(long)]
    base_tag: Option<String>,

    /// Treat every note under this vault folder as a template
    #[arg(long)]
    template_folder: Option<String>,

    /// Remove empty template properties when a note drops a reference
    #[arg(long)]
    prune: bool,

    /// How to confirm template edits that delete properties from notes
    #[arg(long, value_enum, default_value_t = ConfirmMode::Ask)]
    confirm: ConfirmMode,

    /// Apply every referenced template to one note, then exit
    #[arg(long, value_name = "NOTE", conflicts_with = "propagate")]
    apply: Option<String>,

    /// Copy every property of one template into the notes referencing it, then exit
    #[arg(long, value_name = "TEMPLATE")]
    propagate: Option<String>,

    /// Print engine events to stdout as JSON lines
    #[arg(long)]
    print_events: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

type Engine = TemplateSync<NativeStore, StdinConfirm>;

struct Daemon {
    engine: Arc<Engine>,
    watcher: FileWatcher,
    coalescer: ChangeCoalescer,
}

impl Daemon {
    fn on_file_event(&self, event: FileEvent) {
        match event.kind {
            FileEventKind::Modified => self.coalescer.notify(&event.path),
            FileEventKind::Deleted => self.engine.on_document_deleted(&event.path),
        }
    }

    /// Process a note whose burst of changes has settled.
    fn on_note_settled(&self, path: String) {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            let result = engine.handle_change(&path).await;
            log_outcome(&path, result);
        });
    }
}

fn log_outcome(path: &str, result: std::result::Result<SyncReport, SyncError>) {
    match result {
        Ok(report) if report.changed.is_empty() => debug!("No changes for {}", path),
        Ok(report) => info!(
            "{}: updated {} note(s){}",
            path,
            report.changed.len(),
            if report.declined { ", template reverted" } else { "" }
        ),
        Err(e) => error!("Failed to process {}: {}", path, e),
    }
}

fn load_settings(args: &Args) -> Result<Settings> {
    let path = args
        .settings
        .clone()
        .unwrap_or_else(|| args.vault.join(SETTINGS_FILE));
    let mut settings = Settings::load(&path)?.with_env();

    if let Some(tag) = &args.base_tag {
        settings.base_tag = tag.clone();
    }
    if let Some(folder) = &args.template_folder {
        settings.template_folder = Some(folder.clone());
    }
    if args.prune {
        settings.prune_on_reference_removed = true;
    }
    Ok(settings.normalized())
}

fn print_events(engine: &Engine) -> Subscription {
    engine.events().subscribe(|event| match serde_json::to_string(&event) {
        Ok(line) => println!("{}", line),
        Err(e) => error!("Failed to serialize event: {}", e),
    })
}

/// Vault-relative note path as given on the command line.
fn note_path(arg: &str) -> String {
    arg.replace('\\', "/").trim_start_matches("./").to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info (or debug with --verbose)
    let default_filter = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let settings = load_settings(&args)?;
    info!("Vault path: {:?}", args.vault);
    info!(
        "Base tag: {}, template folder: {:?}, prune: {}",
        settings.base_tag, settings.template_folder, settings.prune_on_reference_removed
    );

    let store = NativeStore::new(args.vault.clone());
    let confirm = StdinConfirm::new(args.confirm);

    if let Some(note) = &args.apply {
        let engine = TemplateSync::new(store, confirm, settings);
        let _events = args.print_events.then(|| print_events(&engine));
        let path = note_path(note);
        let result = engine.on_document_opened(&path).await;
        log_outcome(&path, result);
        return Ok(());
    }

    if let Some(template) = &args.propagate {
        // An empty snapshot makes every template property count as added.
        let path = note_path(template);
        let mut state = SyncState::default();
        state.templates.record(&path, Default::default());
        let engine = TemplateSync::with_state(store, confirm, settings, state);
        let _events = args.print_events.then(|| print_events(&engine));
        let result = engine.propagate_template_change(&path).await;
        log_outcome(&path, result);
        return Ok(());
    }

    let engine = Arc::new(TemplateSync::new(store, confirm, settings));
    let _events = args.print_events.then(|| print_events(&engine));
    let scan = engine.initialize().await?;
    info!(
        "Indexed {} notes and {} templates",
        scan.documents, scan.templates
    );

    let watcher = FileWatcher::new(args.vault.clone())?;
    info!("Watching {:?}", watcher.vault_path());

    let (coalescer, mut ready_rx) = ChangeCoalescer::new(engine.settings().quiet_period());
    let mut daemon = Daemon {
        engine,
        watcher,
        coalescer,
    };

    info!("Daemon running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            Some(event) = daemon.watcher.event_rx().recv() => {
                daemon.on_file_event(event);
            }

            Some(path) = ready_rx.recv() => {
                daemon.on_note_settled(path);
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    Ok(())
}
