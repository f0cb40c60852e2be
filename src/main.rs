use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use owo_colors::OwoColorize;
use tracing::{info, warn};

use imagelock::config::{Config, RunConfig};
use imagelock::display::{self, Progress, ProgressLine};
use imagelock::{ActionRegistry, Ledger, Reconciler, Result, WatchCoordinator, WatchEvent};

#[derive(Parser)]
#[command(name = "image-lock")]
#[command(about = "Apply an action to every new or changed image, once")]
#[command(version)]
struct Cli {
    /// Action to apply (a configured command, `webp`, or any name to only register files)
    #[arg(short, long)]
    action: String,

    /// Directory to process (default: ./images)
    #[arg(short, long)]
    path: Option<PathBuf>,

    /// Verbose per-file logging instead of the progress line
    #[arg(short, long)]
    debug: bool,

    /// Keep running and process changes as they happen
    #[arg(short, long)]
    watch: bool,

    /// Ledger file (default: ./image-lock.json)
    #[arg(long)]
    ledger: Option<PathBuf>,

    /// Discard an unreadable ledger and start over
    #[arg(long)]
    fresh: bool,

    /// Config file (default: ./image-lock.yaml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn into_run_config(self) -> Result<RunConfig> {
        let mut settings = Config::load(self.config.as_deref())?;
        if let Some(path) = self.path {
            settings.root = path;
        }
        if let Some(ledger) = self.ledger {
            settings.ledger = ledger;
        }
        let mut config = RunConfig::new(self.action, settings)?;
        config.debug = self.debug;
        config.watch = self.watch;
        config.fresh = self.fresh;
        config.json = self.json;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    imagelock::logging::init(cli.debug);

    let result = match cli.into_run_config() {
        Ok(config) if config.watch => cmd_watch(config).await,
        Ok(config) => cmd_scan(config).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", "error:".red());
            ExitCode::FAILURE
        }
    }
}

async fn cmd_scan(config: RunConfig) -> Result<()> {
    let started = Instant::now();
    let mut ledger = Ledger::load_or_fresh(&config.settings.ledger, config.fresh).await?;
    let runner = ActionRegistry::resolve(&config.action, &config.settings);

    let progress = (!config.debug && !config.json)
        .then(ProgressLine::for_terminal)
        .flatten()
        .map(Arc::new);
    let mut reconciler = Reconciler::from_config(&config, runner);
    if let Some(progress) = &progress {
        reconciler = reconciler.with_progress(Arc::clone(progress) as Arc<dyn Progress>);
    }

    let outcome = reconciler.reconcile(&mut ledger).await;
    if let Some(progress) = &progress {
        progress.finish();
    }
    let stats = outcome?;
    reconciler.persist(&ledger).await?;

    if config.json {
        display::print_json(&stats)?;
    } else {
        display::print_summary(&stats, ledger.path(), started.elapsed());
    }
    Ok(())
}

async fn cmd_watch(config: RunConfig) -> Result<()> {
    let ledger = Ledger::load_or_fresh(&config.settings.ledger, config.fresh).await?;
    let runner = ActionRegistry::resolve(&config.action, &config.settings);
    let reconciler = Reconciler::from_config(&config, runner);

    let (coordinator, mut events) =
        WatchCoordinator::start(reconciler, ledger, config.settings.debounce())?;

    let ledger_path = config.settings.ledger.clone();
    let json = config.json;
    let reporter = tokio::spawn(async move {
        let mut started = Instant::now();
        while let Ok(event) = events.recv().await {
            match event {
                WatchEvent::PassCompleted(stats) => {
                    if json {
                        let _ = display::print_json(&stats);
                    } else {
                        display::print_summary(&stats, &ledger_path, started.elapsed());
                    }
                }
                WatchEvent::PersistFailed { message, .. } | WatchEvent::PassFailed(message) => {
                    eprintln!("{} {message}", "error:".red());
                }
            }
            started = Instant::now();
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
    }
    info!("stopping watch");
    let ledger = coordinator.stop().await?;
    reporter.abort();
    info!(files = ledger.len(), "watch stopped");
    Ok(())
}
