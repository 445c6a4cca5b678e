use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use axum::{Router, extract::FromRef};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity, log::LevelFilter};
use figment::{Figment, providers::Format as _};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub use super::error::Error;
use super::{
    config::AppConfig,
    ingest,
    storage::ViolationStore,
    validate::{DEFAULT_BLOCKED_URI_PREFIXES, Validator},
};

/// The application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Serialize, Debug, Clone)]
/// Command line arguments.
///
/// Any setting given here overrides both the configuration file and the environment.
pub struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "default.toml")]
    #[serde(skip)]
    pub config: PathBuf,
    /// The verbosity level.
    #[command(flatten)]
    #[serde(skip)]
    pub verbosity: Verbosity<InfoLevel>,
    /// Host to listen on
    #[arg(long = "host")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_host: Option<String>,
    /// Port to listen on
    #[arg(long = "port")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
    /// HTTP path to listen on
    #[arg(long = "uri")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_path: Option<String>,
    /// Health checker path
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_path: Option<String>,
    /// SQLite database to store violations in
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db: Option<String>,
    /// A comma-separated list of whitelisted top domains
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whitelist: Option<String>,
}

#[derive(Clone, FromRef)]
/// The application state, shared across all routes.
pub struct AppState {
    /// Filters reports before they are stored.
    pub validator: Arc<Validator>,
    /// The violation store.
    pub store: ViolationStore,
}

/// Build the application router for the given configuration.
pub fn app(config: &AppConfig, store: ViolationStore) -> Router {
    let validator = match &config.blocked_uri_prefixes {
        Some(prefixes) => Validator::new(prefixes.iter().map(String::as_str), config.whitelist()),
        None => Validator::new(
            DEFAULT_BLOCKED_URI_PREFIXES.iter().copied(),
            config.whitelist(),
        ),
    };

    ingest::routes(config)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState {
            validator: Arc::new(validator),
            store,
        })
}

/// The main application entry point.
pub async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    // Set up trace logging to console and account for the user-provided verbosity flag.
    if args.verbosity.log_level_filter() != LevelFilter::Off {
        let lvl = match args.verbosity.log_level_filter() {
            LevelFilter::Error => tracing::Level::ERROR,
            LevelFilter::Warn => tracing::Level::WARN,
            LevelFilter::Info | LevelFilter::Off => tracing::Level::INFO,
            LevelFilter::Debug => tracing::Level::DEBUG,
            LevelFilter::Trace => tracing::Level::TRACE,
        };
        tracing_subscriber::fmt().with_max_level(lvl).init();
    }

    if !args.config.exists() {
        // Not fatal: every setting has a default and may also come from the
        // environment or the command line.
        warn!(
            "configuration file {} does not exist",
            args.config.display()
        );
    }

    // Read and parse the user-provided configuration.
    let config: AppConfig = Figment::new()
        .admerge(figment::providers::Toml::file(&args.config))
        .admerge(figment::providers::Env::prefixed("CSP_COLLECTOR_"))
        .merge(figment::providers::Serialized::defaults(&args))
        .extract()
        .context("failed to load configuration")?;
    config.check_paths().context("invalid configuration")?;

    // Initialize metrics reporting.
    super::metrics::setup(config.metrics.as_ref()).context("failed to set up metrics exporter")?;

    debug!(db = %config.db, "opening database");
    let store = ViolationStore::open(&config.db)
        .await
        .context("could not open database")?;

    debug!("initializing database");
    store
        .initialize()
        .await
        .context("could not initialize database")?;

    let whitelist = config.whitelist();
    if !whitelist.is_empty() {
        info!(?whitelist, "only accepting reports from whitelisted documents");
    }

    let app = app(&config, store.clone());

    let addr = format!("{}:{}", config.listen_host, config.listen_port);
    let listener = TcpListener::bind(&addr)
        .await
        .context("failed to bind address")?;

    info!(
        "listening on {addr} for reports at {}, health checks at {}",
        config.listen_path, config.health_check_path
    );

    let result = axum::serve(listener, app.into_make_service())
        .await
        .context("failed to serve app");

    store.close().await;
    debug!("closed connection to database");

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_configuration() {
        let args = Args::parse_from([
            "csp-collector",
            "--port",
            "9999",
            "--whitelist",
            "Example.com",
            "--uri",
            "/csp",
        ]);

        let config: AppConfig = Figment::new()
            .admerge(figment::providers::Toml::string(
                r#"
                listen_port = 8000
                listen_host = "0.0.0.0"
                "#,
            ))
            .merge(figment::providers::Serialized::defaults(&args))
            .extract()
            .expect("config should parse");

        assert_eq!(config.listen_port, 9999);
        assert_eq!(config.listen_host, "0.0.0.0");
        assert_eq!(config.listen_path, "/csp");
        assert_eq!(config.whitelist(), ["example.com"]);
    }
}
