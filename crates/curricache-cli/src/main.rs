//! curricache - a command-line view of the curriculum dashboard.
//!
//! Reads go through the two-tier cache, so a dashboard that loaded once
//! keeps working when the API is unreachable.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use curricache_core::proxy::{self, ProxyHandle};
use curricache_core::utils::{format_age, progress_bar, truncate};
use curricache_core::{
    CacheCoordinator, Config, CurriculumPatch, Dashboard, DashboardView, EntityKey, HttpBackend,
    HttpNetwork, InterceptedNetwork, InvalidationChannel, OwnerKey, Preferences, SystemClock,
};

// ============================================================================
// Constants
// ============================================================================

/// How long to wait for the proxy to finish activating before going direct.
const PROXY_STARTUP_TIMEOUT_MS: u64 = 2000;

/// Poll interval while waiting for the proxy.
const PROXY_POLL_INTERVAL_MS: u64 = 20;

/// Width of the title column in the dashboard listing.
const TITLE_WIDTH: usize = 40;

const USAGE: &str = "\
Usage: curricache [--json] <command>

Commands:
  dashboard [owner]            Show an owner's curricula (defaults to the last owner)
  show <id>                    Show one curriculum
  rename <owner> <id> <title>  Rename a curriculum
  dismiss-banner               Hide the onboarding banner

Environment:
  CURRICACHE_API_URL   API base URL
  CURRICACHE_OWNER     Default owner
  RUST_LOG             Log filter (default: warn)";

type Session = Dashboard<HttpBackend<InterceptedNetwork<HttpNetwork>>>;

#[derive(Debug, PartialEq)]
enum Command {
    Dashboard { owner: Option<String> },
    Show { id: String },
    Rename { owner: String, id: String, title: String },
    DismissBanner,
    Help,
}

fn parse_args(args: &[String]) -> Result<(Command, bool)> {
    let json = args.iter().any(|a| a == "--json");
    let args: Vec<&str> = args
        .iter()
        .map(String::as_str)
        .filter(|a| *a != "--json")
        .collect();
    if args.iter().any(|a| a.trim().is_empty()) {
        bail!("Arguments must not be empty\n\n{}", USAGE);
    }

    let command = match args.as_slice() {
        [] | ["dashboard"] => Command::Dashboard { owner: None },
        ["dashboard", owner] => Command::Dashboard {
            owner: Some(owner.to_string()),
        },
        ["show", id] => Command::Show { id: id.to_string() },
        ["rename", owner, id, title @ ..] if !title.is_empty() => Command::Rename {
            owner: owner.to_string(),
            id: id.to_string(),
            title: title.join(" "),
        },
        ["dismiss-banner"] => Command::DismissBanner,
        ["help"] | ["--help"] | ["-h"] => Command::Help,
        _ => bail!("Unrecognized arguments: {}\n\n{}", args.join(" "), USAGE),
    };
    Ok((command, json))
}

/// Initialize the tracing subscriber: stderr plus a daily log file.
fn init_tracing(cache_dir: &Path) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::fs::create_dir_all(cache_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(cache_dir, "curricache.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

/// Start the proxy and give it a moment to activate. Requests made before
/// it is active go straight to the network.
async fn start_proxy(
    config: &Config,
    cache_dir: &Path,
    network: Arc<HttpNetwork>,
) -> (ProxyHandle, tokio::task::JoinHandle<()>) {
    let (handle, task) = proxy::install(
        config.proxy_config(cache_dir),
        network,
        Arc::new(SystemClock),
    );

    let ready = tokio::time::timeout(Duration::from_millis(PROXY_STARTUP_TIMEOUT_MS), async {
        while !handle.is_active() {
            tokio::time::sleep(Duration::from_millis(PROXY_POLL_INTERVAL_MS)).await;
        }
    })
    .await;
    if ready.is_err() {
        warn!("Proxy still activating, continuing without it");
    }
    (handle, task)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (command, json) = parse_args(&args)?;
    if command == Command::Help {
        println!("{}", USAGE);
        return Ok(());
    }

    let mut config = Config::load().context("Failed to load config")?;
    config.apply_env();
    let cache_dir = config
        .cache_dir()
        .unwrap_or_else(|_| PathBuf::from("./cache"));

    let _log_guard = init_tracing(&cache_dir);
    info!(api = %config.api_base_url, "curricache starting");

    let direct = Arc::new(HttpNetwork::new(&config.api_base_url)?);
    let proxy = if config.offline_mode {
        None
    } else {
        Some(start_proxy(&config, &cache_dir, direct.clone()).await)
    };
    let proxy_handle = proxy.as_ref().map(|(handle, _)| handle.clone());

    let network = Arc::new(InterceptedNetwork::new(proxy_handle.clone(), direct));
    let backend = Arc::new(HttpBackend::new(network));
    let coordinator =
        Arc::new(CacheCoordinator::new(backend.clone()).with_policies(config.policies()));
    let channel = match proxy_handle {
        Some(handle) => InvalidationChannel::new(handle),
        None => InvalidationChannel::disconnected(),
    };
    let prefs = Preferences::load(cache_dir.clone()).context("Failed to load preferences")?;
    let mut session = Dashboard::new(coordinator, backend, channel, prefs);

    let result = run(&mut session, &mut config, command, json).await;

    if let Some((handle, task)) = proxy {
        handle.shutdown().await;
        let _ = task.await;
    }
    info!("curricache shutting down");
    result
}

async fn run(session: &mut Session, config: &mut Config, command: Command, json: bool) -> Result<()> {
    match command {
        Command::Dashboard { owner } => {
            let Some(owner) = owner.or_else(|| config.last_owner.clone()) else {
                bail!("No owner given and no previous owner saved.\n\n{}", USAGE);
            };
            if config.last_owner.as_deref() != Some(owner.as_str()) {
                config.last_owner = Some(owner.clone());
                if let Err(e) = config.save() {
                    warn!(error = %e, "Failed to save config");
                }
            }
            let view = session.load(&OwnerKey::new(owner)).await?;
            if json {
                print_json(&serde_json::json!({
                    "owner": view.owner,
                    "curricula": view.curricula,
                    "aggregate": view.aggregate,
                    "stale": view.notice.as_ref().map(|n| n.message()),
                }))?;
            } else {
                print_dashboard(&view);
            }
        }

        Command::Show { id } => {
            let view = session.open(&EntityKey::new(id)).await?;
            if json {
                print_json(&serde_json::to_value(&view.curriculum)?)?;
                return Ok(());
            }
            if let Some(notice) = &view.notice {
                println!("({})\n", notice.message());
            }
            let c = &view.curriculum;
            println!("{}  [{}]", c.title, c.id);
            if let Some(description) = c.description.as_deref().filter(|d| !d.is_empty()) {
                println!("{}", description);
            }
            println!("Updated {}\n", c.updated_at.format("%b %d, %Y %H:%M"));
            for resource in &c.resources {
                let mark = if resource.completed { "x" } else { " " };
                println!("  [{}] {:<8} {}", mark, resource.kind.label(), resource.title);
            }
        }

        Command::Rename { owner, id, title } => {
            let updated = session
                .update_curriculum(&OwnerKey::new(owner), &EntityKey::new(id), &CurriculumPatch::title(title))
                .await?;
            println!("Renamed {} to \"{}\"", updated.id, updated.title);
        }

        Command::DismissBanner => {
            session.dismiss_onboarding_banner()?;
            println!("Onboarding banner dismissed.");
        }

        Command::Help => println!("{}", USAGE),
    }
    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_dashboard(view: &DashboardView) {
    if view.show_onboarding_banner {
        println!("Welcome! Track books, papers and videos in curricula.");
        println!("(hide this with `curricache dismiss-banner`)\n");
    }
    if let Some(notice) = &view.notice {
        println!("({})\n", notice.message());
    }

    let aggregate = &view.aggregate;
    println!(
        "{}: {} curricula, {}/{} resources done {}",
        view.owner,
        aggregate.curriculum_count,
        aggregate.completed_count,
        aggregate.resource_count,
        progress_bar(aggregate.completion_ratio(), 20)
    );
    println!();

    if view.curricula.is_empty() {
        println!("No curricula yet.");
        return;
    }
    let now = chrono::Utc::now();
    for c in &view.curricula {
        println!(
            "  {:<12} {:<width$} {:>3}%  {}",
            c.id.as_str(),
            truncate(&c.title, TITLE_WIDTH),
            c.progress_percent(),
            format_age(c.updated_at, now),
            width = TITLE_WIDTH
        );
    }
}
