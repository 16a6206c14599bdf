use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use livewatch::auth::{CredentialCache, OAuthClient, TokenManager};
use livewatch::client::{ClientError, SnapshotClient};
use livewatch::config::Config;
use livewatch::follows::FollowsResolver;
use livewatch::poller::{LiveListener, LiveSetPoller, PollerConfig, PollerState, Providers};
use livewatch::service::{self, ServiceState, SHUTDOWN_GRACE};
use livewatch::streams::{FollowedFeed, LiveSet, PublicFeed, Snapshot, StreamRecord};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Pause between `fetch` attempts.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Get the config directory path (~/.config/livewatch/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("livewatch"))
}

#[derive(Parser, Debug)]
#[command(
    name = "livewatch",
    about = "Watch followed and public live streams and serve who is live"
)]
struct Args {
    /// Config file (default: ~/.config/livewatch/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the poller and the snapshot service
    Serve,

    /// Fetch the snapshot from a running service and print who is live
    Fetch {
        /// URL of the service's /stream-data endpoint
        #[arg(default_value = "http://localhost:8080/stream-data")]
        address: String,

        /// Ask the service to poll before fetching
        #[arg(long)]
        force: bool,

        /// Give up after this many attempts
        #[arg(long, default_value_t = 100)]
        attempts: u32,
    },
}

/// Logs transitions; the binary has no other consumer.
struct LogListener;

impl LiveListener for LogListener {
    fn on_live(&self, record: &StreamRecord) {
        tracing::info!(
            channel = %record.name(),
            service = %record.service(),
            viewers = record.viewers(),
            title = %record.title(),
            "LIVE"
        );
    }

    fn on_offline(&self, record: &StreamRecord) {
        tracing::info!(channel = %record.name(), service = %record.service(), "OFFLINE");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    match args.command {
        Command::Serve => serve(config, config_dir).await,
        Command::Fetch {
            address,
            force,
            attempts,
        } => fetch(&address, force, attempts).await,
    }
}

async fn serve(config: Config, config_dir: PathBuf) -> Result<()> {
    let interval = config.poll_interval()?;
    let client_id = config.require_client_id()?.to_string();
    let client_secret = config.client_secret()?;
    let endpoints = config.endpoints.parse()?;

    let http = reqwest::Client::builder()
        .user_agent(concat!("livewatch/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let oauth = OAuthClient::new(
        http.clone(),
        endpoints.auth,
        endpoints.api.clone(),
        client_id.clone(),
        client_secret,
    );

    let cache_dir = config.cache_dir_or(&config_dir);
    let mut tokens = TokenManager::new(
        oauth.clone(),
        Some(CredentialCache::new(cache_dir)),
        interval,
    );
    tokens.load_cached();
    if let Some(user_id) = config.user_id.as_deref().filter(|id| !id.trim().is_empty()) {
        tokens.set_user_id(user_id);
    }
    if tokens.user_id().is_none() {
        config.require_follower()?;
    }
    if !tokens.has_user_credential() {
        tracing::warn!(
            url = %oauth.authorize_url(&config.redirect_uri),
            "No user authorization yet, followed channels are unavailable until it is granted"
        );
    }

    let providers = Providers {
        follows: FollowsResolver::new(http.clone(), endpoints.api.clone(), client_id.clone()),
        followed: FollowedFeed::new(http.clone(), endpoints.api, client_id),
        public: PublicFeed::new(http, endpoints.public),
    };

    let mut poller_config = PollerConfig::new(interval);
    poller_config.user_name = config.user_name.clone();

    let state = PollerState::new(tokens, interval).shared();
    let listener: Arc<dyn LiveListener> = Arc::new(LogListener);
    let (poller, force) =
        LiveSetPoller::new(state.clone(), poller_config, providers, Some(listener));

    let tcp = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    let service = service::spawn(
        tcp,
        ServiceState::new(state, oauth, config.redirect_uri.clone(), force),
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let mut poll_task = tokio::spawn(poller.run(shutdown_rx));

    let result = tokio::select! {
        signal = shutdown_signal() => {
            signal?;
            tracing::info!("Shutdown signal received, stopping poller");
            let _ = shutdown_tx.send(());
            (&mut poll_task).await
        }
        finished = &mut poll_task => finished,
    };

    service.shutdown(SHUTDOWN_GRACE).await;

    result
        .context("Poller task panicked")?
        .context("Poller stopped on a fatal error")?;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;
    Ok(())
}

async fn fetch(address: &str, force: bool, attempts: u32) -> Result<()> {
    let client = SnapshotClient::new().context("Failed to build HTTP client")?;

    if force {
        if let Err(e) = client.request_check(address).await {
            tracing::warn!(error = %e, "Force check not accepted");
        }
    }

    let mut browser_opened = false;
    for attempt in 1..=attempts {
        match client.fetch_snapshot(address).await {
            Ok(snapshot) => {
                print_snapshot(&snapshot);
                return Ok(());
            }
            Err(ClientError::AuthorizationRequired { url }) => {
                if !browser_opened {
                    println!("Authorization required, opening {}", url);
                    if let Err(e) = open::that(&url) {
                        tracing::warn!(
                            error = %e,
                            "Failed to open browser, visit the URL manually"
                        );
                    }
                    browser_opened = true;
                }
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(attempt, attempts, error = %e, "Fetch failed, retrying");
            }
            Err(e) => return Err(e).context("Failed to fetch snapshot"),
        }
        tokio::time::sleep(RETRY_DELAY).await;
    }

    anyhow::bail!("Gave up after {} attempts", attempts)
}

fn print_snapshot(snapshot: &Snapshot) {
    let live = LiveSet::from_snapshot(snapshot);
    println!(
        "{} live (fetched {}, refresh every {}s)",
        live.len(),
        snapshot.last_fetched.format("%Y-%m-%d %H:%M:%S UTC"),
        snapshot.refresh_interval.as_secs()
    );
    for name in live.names() {
        let Some(record) = live.get(name) else {
            continue;
        };
        let marker = if record.is_followed() { "*" } else { " " };
        println!(
            "{} {:<24} {:<16} {:>7}  {}",
            marker,
            record.name(),
            record.service(),
            record.viewers(),
            record.title()
        );
    }
}
