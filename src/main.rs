mod cli;
mod progress;
mod runner;
mod settings;
mod shutdown;

use anyhow::{Context, Result};
use browser::{Browser, FeedTab};
use chrono::Utc;
use queue::{QueueStore, TaskKind};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::{Cli, Commands, RunArgs};
use progress::TaskProgress;
use runner::{run_queue, Harvester, RunOptions};
use settings::Settings;
use shutdown::ShutdownFlag;

fn init_logging(cli: &Cli, log_file: Option<&Path>) -> Result<()> {
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Cannot open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // settings may name a log file, so peek at the queue before logging starts
    let loaded = QueueStore::load(&cli.config);
    let log_file = loaded
        .as_ref()
        .ok()
        .and_then(|queue| Settings::from_map(queue.settings()).ok())
        .and_then(|settings| settings.log_file);
    init_logging(&cli, log_file.as_deref())?;

    match cli.command_or_run()? {
        Commands::Run(args) => {
            let queue = loaded.with_context(|| format!("Cannot load queue file {}", cli.config.display()))?;
            run(queue, &args, cli.quiet)
        }
        Commands::Add { kind, queries } => add(&cli, kind.into(), &queries),
        Commands::Status => status(&cli),
        Commands::Retry { queries } => retry(&cli, &queries),
    }
}

fn run(mut queue: QueueStore, args: &RunArgs, quiet: bool) -> Result<()> {
    let mut settings = Settings::from_map(queue.settings())?;
    if args.headless {
        settings.headless = true;
    }
    if args.username.is_some() {
        settings.username = args.username.clone();
    }
    if args.password.is_some() {
        settings.password = args.password.clone();
    }

    let harvester = Harvester::from_settings(&settings).context("Invalid crawl settings")?;
    let pending = queue.pending().len();
    if pending == 0 {
        info!("No pending tasks in {}", queue.path().display());
        return Ok(());
    }
    let [search_dir, user_dir] = harvester.output_dirs();
    info!(
        "{} pending tasks, writing to {} and {}",
        pending,
        search_dir.display(),
        user_dir.display()
    );

    let shutdown = ShutdownFlag::new();
    shutdown.install()?;

    let browser = Browser::launch(&settings.launch_config())?;
    let mut tab = browser.open_tab(settings.navigation_settle(), settings.element_timeout())?;

    if args.skip_login {
        info!("Skipping login");
    } else if let Some(credentials) = settings.credentials() {
        if let Err(e) = tab.login(&credentials) {
            error!("{}", e);
            save_failure_screenshot(&tab, &settings.screenshot_dir, "login");
            return Err(e.into());
        }
    } else {
        warn!("No credentials configured, continuing without login");
    }

    let planned = args.limit.map_or(pending, |limit| limit.min(pending));
    let progress = TaskProgress::new(planned as u64, !args.no_progress && !quiet);
    let options = RunOptions { limit: args.limit };

    let summary = run_queue(
        &harvester,
        &mut tab,
        &mut queue,
        &options,
        shutdown.as_atomic(),
        &progress,
    )?;

    progress.finish(format!("{} completed", summary.completed));
    info!(
        "Run finished: {} completed, {} left pending, {} failed, {} still queued",
        summary.completed,
        summary.left_pending,
        summary.failed,
        queue.pending().len()
    );
    if summary.stopped_early {
        info!("Run stopped before the queue was drained");
    }
    Ok(())
}

fn save_failure_screenshot(tab: &FeedTab, dir: &Path, label: &str) {
    let path = dir.join(format!("{}_{}.png", label, Utc::now().format("%Y%m%d_%H%M%S")));
    if let Err(e) = tab.save_screenshot(&path) {
        warn!("Could not save screenshot: {}", e);
    }
}

fn add(cli: &Cli, kind: TaskKind, queries: &[String]) -> Result<()> {
    let mut queue = QueueStore::load_or_default(&cli.config)?;
    for query in queries {
        let query = query.trim();
        if query.is_empty() {
            continue;
        }
        queue.enqueue(query, kind.clone())?;
        println!("Queued {} ({})", query, kind);
    }
    Ok(())
}

fn status(cli: &Cli) -> Result<()> {
    let queue = QueueStore::load_or_default(&cli.config)?;
    let state = queue.state();

    println!("Pending ({}):", state.pending_tasks.len());
    for (task_id, kind) in &state.pending_tasks {
        println!("  {:<30} {}", task_id, kind);
    }

    println!("Completed ({}):", state.completed_tasks.len());
    for (task_id, entry) in &state.completed_tasks {
        let kind = entry
            .kind()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!("  {:<30} {:<10} {}", task_id, kind, entry.status_text());
    }
    Ok(())
}

fn retry(cli: &Cli, queries: &[String]) -> Result<()> {
    let mut queue = QueueStore::load(&cli.config)?;
    for query in queries {
        match queue.requeue(query) {
            Ok(kind) => println!("Requeued {} ({})", query, kind),
            Err(e) => warn!("{}", e),
        }
    }
    Ok(())
}
