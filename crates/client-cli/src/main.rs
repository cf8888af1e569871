use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod engine;
mod poller;
mod session;
mod snapshots;

use api::{ApiClient, ApiError};
use config::Config;
use engine::{CommandOutcome, Engine};
use poller::{Poller, TickOutcome};
use session::SessionStore;
use shared::{Download, DownloadCommand, DownloadStatus, FriendPresence, PresenceState};
use snapshots::PausedProgressStore;

// Default relay server URL
const DEFAULT_SERVER: &str = "https://relay.downlink.app";

#[derive(Parser)]
#[command(name = "downlink")]
#[command(about = "Remote companion for the desktop download manager - pair with a code, then monitor and control downloads")]
#[command(version)]
struct Cli {
    /// Server URL (overrides config)
    #[arg(long)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pair this device using a 6-digit code shown in the desktop app
    Connect {
        /// The pairing code
        code: String,
    },
    /// Live dashboard: poll downloads and friend presence until Ctrl+C
    Watch,
    /// List downloads once
    Downloads,
    /// List friends and their presence once
    Friends,
    /// Pause a download
    Pause { id: String },
    /// Resume a paused download
    Resume { id: String },
    /// Cancel a download
    Kill { id: String },
    /// Revoke this device's session
    Disconnect,
    /// Show pairing status
    Whoami,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Set a configuration value
    Set {
        /// Configuration key (server, theme)
        key: String,
        /// Configuration value
        value: String,
    },
    /// Get a configuration value
    Get {
        /// Configuration key
        key: String,
    },
    /// Show all configuration
    Show,
    /// Get the config file path
    Path,
}

/// Everything the subcommands need, constructed once at startup.
struct Services {
    config: Config,
    api: Arc<ApiClient>,
    engine: Arc<Engine>,
}

fn build_services(server_override: Option<String>) -> Result<Services> {
    let config = Config::load().unwrap_or_default();
    let server = server_override
        .or_else(|| config.remote.server.clone())
        .unwrap_or_else(|| DEFAULT_SERVER.to_string());

    let data_dir = Config::data_dir();
    if data_dir.is_none() {
        tracing::warn!("No data directory available; session and snapshots will not survive restarts");
    }

    let session = Arc::new(SessionStore::new(
        data_dir.as_ref().map(|d| d.join("session.json")),
    ));
    let api = Arc::new(ApiClient::new(server, session));
    let snapshots = PausedProgressStore::new(data_dir.as_ref().map(|d| d.join("snapshots.json")));
    let engine = Arc::new(Engine::new(
        api.clone(),
        snapshots,
        config.cache_window(),
        config.placeholder_ttl(),
    ));

    Ok(Services {
        config,
        api,
        engine,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "downlink=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        // Config never needs a server or session.
        Commands::Config { action } => handle_config_command(action),
        command => {
            let services = build_services(cli.server)?;
            match command {
                Commands::Connect { code } => connect(&services, &code).await,
                Commands::Watch => watch(&services).await,
                Commands::Downloads => downloads_once(&services).await,
                Commands::Friends => friends_once(&services).await,
                Commands::Pause { id } => command_once(&services, DownloadCommand::Pause, &id).await,
                Commands::Resume { id } => {
                    command_once(&services, DownloadCommand::Resume, &id).await
                }
                Commands::Kill { id } => command_once(&services, DownloadCommand::Kill, &id).await,
                Commands::Disconnect => disconnect(&services).await,
                Commands::Whoami => whoami(&services).await,
                Commands::Config { .. } => unreachable!("handled above"),
            }
        }
    }
}

async fn connect(services: &Services, code: &str) -> Result<()> {
    match services.api.verify_code(code).await {
        Ok(conn) => {
            println!("\x1b[1;32mConnected!\x1b[0m Paired with {}'s library.", conn.display_name);
            println!("Run '\x1b[1mdownlink watch\x1b[0m' to monitor downloads.");
            Ok(())
        }
        Err(ApiError::InvalidCode(msg)) => {
            eprintln!("\x1b[31mPairing code rejected:\x1b[0m {}", msg);
            eprintln!("Codes expire quickly - generate a fresh one in the desktop app.");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn watch(services: &Services) -> Result<()> {
    if services.api.session().get().is_none() {
        print_not_connected();
        return Ok(());
    }

    let engine = services.engine.clone();
    let mut view_rx = engine.subscribe();

    // Display name fetched once; downloads and presence on their own loops.
    let _ = engine.refresh_user_name(false).await;

    let downloads_poller = Arc::new(Poller::start(services.config.poll_interval(), {
        let engine = engine.clone();
        move || {
            let engine = engine.clone();
            async move { downloads_tick(&engine).await }
        }
    }));
    // Lightweight new-download probe between full list polls; a hit wakes
    // the downloads poller early.
    let notifications_poller = Poller::start(services.config.poll_interval() / 2, {
        let engine = engine.clone();
        let api = services.api.clone();
        let downloads_poller = downloads_poller.clone();
        move || {
            let engine = engine.clone();
            let api = api.clone();
            let downloads_poller = downloads_poller.clone();
            async move {
                if engine.session_is_invalid() {
                    return TickOutcome::Stop;
                }
                match api.check_notifications().await {
                    Ok(n) if n.has_new_downloads => {
                        engine.invalidate_downloads();
                        downloads_poller.refresh_now();
                        TickOutcome::Continue
                    }
                    Ok(_) => TickOutcome::Continue,
                    Err(e) if e.invalidates_session() => {
                        engine.mark_session_invalid();
                        TickOutcome::Stop
                    }
                    Err(e) => {
                        tracing::debug!("Notification check failed: {}", e);
                        TickOutcome::Continue
                    }
                }
            }
        }
    });
    let friends_poller = Poller::start(services.config.poll_interval() * 3, {
        let engine = engine.clone();
        move || {
            let engine = engine.clone();
            async move {
                if engine.session_is_invalid() {
                    return TickOutcome::Stop;
                }
                match engine.refresh_friends(false).await {
                    Err(e) if e.invalidates_session() => TickOutcome::Stop,
                    _ => TickOutcome::Continue,
                }
            }
        }
    });

    println!("Watching downloads (Ctrl+C to quit)...\n");

    loop {
        tokio::select! {
            changed = view_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = view_rx.borrow_and_update().clone();
                if view.session_invalid {
                    // Exactly one reconnect prompt no matter how many
                    // pollers saw the invalidation.
                    print_session_expired(services);
                    break;
                }
                render_dashboard(&view);
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping.");
                break;
            }
        }
    }

    downloads_poller.shutdown().await;
    notifications_poller.shutdown().await;
    friends_poller.shutdown().await;
    Ok(())
}

async fn downloads_tick(engine: &Engine) -> TickOutcome {
    if engine.session_is_invalid() {
        return TickOutcome::Stop;
    }
    match engine.refresh_downloads(false).await {
        Err(e) if e.invalidates_session() => TickOutcome::Stop,
        // Transient failures were logged by the engine; retry next tick.
        _ => TickOutcome::Continue,
    }
}

async fn downloads_once(services: &Services) -> Result<()> {
    match services.engine.refresh_downloads(true).await {
        Ok(()) => {
            let view = services.engine.view();
            if view.downloads.is_empty() {
                println!("No active downloads. Start one in the desktop app to monitor it here.");
            } else {
                for d in &view.downloads {
                    println!("{}", format_download(d));
                }
            }
            Ok(())
        }
        Err(e) => report_fetch_error(services, e),
    }
}

async fn friends_once(services: &Services) -> Result<()> {
    match services.engine.refresh_friends(true).await {
        Ok(()) => {
            let view = services.engine.view();
            if view.friends.is_empty() {
                println!("No friends yet.");
            } else {
                for f in &view.friends {
                    println!("{}", format_friend(f));
                }
            }
            Ok(())
        }
        Err(e) => report_fetch_error(services, e),
    }
}

async fn command_once(services: &Services, command: DownloadCommand, id: &str) -> Result<()> {
    let verb = match command {
        DownloadCommand::Pause => "Paused",
        DownloadCommand::Resume => "Resumed",
        DownloadCommand::Kill => "Cancelled",
    };

    let outcome = services
        .engine
        .dispatch_command(
            command,
            id,
            services.config.confirm_interval(),
            services.config.poll.confirm_attempts,
        )
        .await;

    match outcome {
        Ok(CommandOutcome::Confirmed) => {
            println!("\x1b[32m{}\x1b[0m download {}", verb, id);
            Ok(())
        }
        Ok(CommandOutcome::Unconfirmed) => {
            println!(
                "Command sent, but the change was not confirmed yet. \
                 It may still land - check again shortly."
            );
            Ok(())
        }
        Err(e) => report_fetch_error(services, e),
    }
}

async fn disconnect(services: &Services) -> Result<()> {
    match services.api.disconnect().await {
        Ok(ack) => {
            let msg = if ack.message.is_empty() {
                "Device removed from the account".to_string()
            } else {
                ack.message
            };
            println!("Disconnected. {}", msg);
        }
        Err(ApiError::NoSession) => {
            println!("Not connected.");
        }
        Err(e) => {
            // Local session is cleared regardless of the server outcome.
            tracing::warn!("Server-side disconnect failed: {}", e);
            println!("Disconnected locally. Session cleared from this device.");
        }
    }
    Ok(())
}

async fn whoami(services: &Services) -> Result<()> {
    match services.api.session().get() {
        Some(session) => {
            println!("\x1b[32m✓ Connected\x1b[0m (user {})", session.user_id);
            match services.engine.refresh_user_name(true).await {
                Ok(()) => {
                    let name = services.engine.view().user_name;
                    if !name.is_empty() {
                        println!("Library owner: {}", name);
                    }
                }
                Err(e) => tracing::debug!("Could not fetch display name: {}", e),
            }
        }
        None => print_not_connected(),
    }
    Ok(())
}

fn handle_config_command(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            let mut config = Config::load().unwrap_or_default();
            match key.as_str() {
                "server" => config.remote.server = Some(value),
                "theme" => config.ui.theme = Some(value),
                _ => anyhow::bail!("Unknown config key: {}. Valid keys: server, theme", key),
            }
            config.save()?;
            println!("Configuration saved");
        }
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = match key.as_str() {
                "server" => config.remote.server.unwrap_or_default(),
                "theme" => config.ui.theme.unwrap_or_default(),
                _ => anyhow::bail!("Unknown config key: {}", key),
            };
            println!("{}", value);
        }
        ConfigAction::Show => {
            let config = Config::load()?;
            println!("server: {}", config.remote.server.unwrap_or_default());
            println!("theme: {}", config.ui.theme.unwrap_or_default());
            println!("poll interval: {}ms", config.poll.interval_ms);
            println!("cache window: {}ms", config.poll.cache_window_ms);
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

// ============================================================================
// Presentation helpers
// ============================================================================

fn render_dashboard(view: &engine::View) {
    let owner = if view.user_name.is_empty() {
        String::new()
    } else {
        format!(" - {}'s library", view.user_name)
    };
    let updated = view
        .last_updated
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());

    println!("\x1b[1mDownloads{}\x1b[0m (updated {})", owner, updated);
    if let Some(err) = &view.last_error {
        println!("  \x1b[33m! {}\x1b[0m", err);
    }
    if view.downloads.is_empty() {
        println!("  (none)");
    }
    for d in &view.downloads {
        println!("  {}", format_download(d));
    }
    if !view.friends.is_empty() {
        let online = view
            .friends
            .iter()
            .filter(|f| f.status != PresenceState::Offline)
            .count();
        println!("Friends: {}/{} online", online, view.friends.len());
    }
    println!();
}

fn format_download(d: &Download) -> String {
    let status = match d.status {
        DownloadStatus::Queued => "\x1b[90mqueued\x1b[0m",
        DownloadStatus::Downloading => "\x1b[36mdownloading\x1b[0m",
        DownloadStatus::Paused => "\x1b[33mpaused\x1b[0m",
        DownloadStatus::Stopped => "\x1b[33mstopped\x1b[0m",
        DownloadStatus::Extracting => "\x1b[35mextracting\x1b[0m",
        DownloadStatus::Completed => "\x1b[32mcompleted\x1b[0m",
        DownloadStatus::Error => "\x1b[31merror\x1b[0m",
    };

    let mut line = format!(
        "[{:>5.1}%] {} ({}) {} / {}",
        d.progress, d.name, status, d.downloaded, d.size
    );
    if d.status == DownloadStatus::Downloading && !d.speed.is_empty() {
        line.push_str(&format!("  {} ETA {}", d.speed, d.eta));
    }
    if let Some(err) = &d.error {
        line.push_str(&format!("  \x1b[31m{}\x1b[0m", err));
    }
    line
}

fn format_friend(f: &FriendPresence) -> String {
    let status = match f.status {
        PresenceState::Online => "\x1b[32monline\x1b[0m",
        PresenceState::Away => "\x1b[33maway\x1b[0m",
        PresenceState::Busy => "\x1b[31mbusy\x1b[0m",
        PresenceState::DoNotDisturb => "\x1b[31mdo not disturb\x1b[0m",
        PresenceState::Offline => "\x1b[90moffline\x1b[0m",
    };
    let mut line = format!("{} ({})", f.display_name, status);
    if !f.custom_message.is_empty() {
        line.push_str(&format!(" - {}", f.custom_message));
    }
    line
}

fn print_not_connected() {
    eprintln!("\x1b[33mNot connected.\x1b[0m");
    eprintln!("Run '\x1b[1mdownlink connect <code>\x1b[0m' with a code from the desktop app.");
}

fn print_session_expired(services: &Services) {
    eprintln!();
    eprintln!("\x1b[1;31mSession expired\x1b[0m");
    eprintln!("Your session was revoked or expired:");
    eprintln!("  - disconnected from another device, or");
    eprintln!("  - the session timed out.");
    eprintln!("Reconnect with a new code: \x1b[1mdownlink connect <code>\x1b[0m");
    services.api.session().clear();
}

fn report_fetch_error(services: &Services, error: ApiError) -> Result<()> {
    if error.invalidates_session() {
        print_session_expired(services);
        return Ok(());
    }
    if error.is_transient() {
        eprintln!("\x1b[33mTemporary failure; try again in a moment.\x1b[0m");
    }
    Err(error.into())
}
