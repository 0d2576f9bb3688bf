//! Resd - capture proxy for media resources.
//!
//! This is the main binary. With no subcommand it runs the capture proxy:
//! - Root CA loaded or generated on first run
//! - Registry and event hub wired to the extractor
//! - Proxy stopped cleanly on Ctrl-C
//!
//! Subcommands export the root certificate and decode local cache files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use resd_core::config::{default_config_path, project_dirs};
use resd_core::provider::CHANNELS;
use resd_core::{
    EventHub, HttpFetcher, ProviderSet, Registry, RegistrySettings, ResdConfig, ResourceEvent,
};
use resd_proxy::{
    CaManager, Extractor, ExtractorSettings, InterceptPolicy, ProxyConfig, ProxyServer,
};
use tokio::sync::mpsc;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Resd - capture proxy for media resources
#[derive(Parser, Debug)]
#[command(name = "resd", version, about)]
struct Args {
    /// Proxy listen host
    #[arg(long)]
    host: Option<String>,

    /// Proxy listen port
    #[arg(long)]
    port: Option<u16>,

    /// Directory downloads are saved to
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root CA directory (defaults to the platform data directory)
    #[arg(long)]
    ca_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the root CA certificate (PEM) for installation in a trust store
    ExportCert {
        /// Destination file
        path: PathBuf,
    },
    /// Decode a cache file obtained outside the proxy
    Decode {
        /// Input file
        file: PathBuf,

        /// Decode parameter
        #[arg(long)]
        param: Option<String>,

        /// Provider whose transform applies
        #[arg(long, default_value = CHANNELS)]
        provider: String,
    },
}

impl Args {
    /// Applies command-line overrides on top of the configuration file.
    fn apply(&self, config: &mut ResdConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(dir) = &self.save_dir {
            config.save_directory = dir.clone();
        }
    }

    fn ca_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.ca_dir {
            Some(dir) => Ok(dir.clone()),
            None => CaManager::default_dir().context("no CA directory available"),
        }
    }
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    project_dirs()
        .ok()
        .map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("resd={},warn", log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("resd")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

fn export_cert(ca_dir: &Path, path: &Path) -> anyhow::Result<()> {
    let ca = CaManager::ensure(ca_dir).context("root CA unavailable")?;
    ca.export_root(path)
        .with_context(|| format!("failed to write {:?}", path))?;
    println!("{}", path.display());
    Ok(())
}

fn decode_file(file: &Path, provider: &str, param: Option<&str>) -> anyhow::Result<()> {
    let providers = ProviderSet::with_defaults();
    let transform = providers
        .transform(provider, param)
        .with_context(|| format!("cannot decode with provider {}", provider))?;
    let output = resd_core::decode_local_file(file, transform.as_ref())
        .with_context(|| format!("failed to decode {:?}", file))?;
    println!("{}", output.display());
    Ok(())
}

/// Logs registry changes, one JSON envelope per event.
async fn log_events(mut events: mpsc::Receiver<ResourceEvent>) {
    while let Some(event) = events.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(target: "resd::events", "{}", json),
            Err(e) => tracing::warn!("Failed to serialize event: {}", e),
        }
    }
}

async fn run(config: ResdConfig, ca_dir: PathBuf) -> anyhow::Result<()> {
    // A missing or corrupt root is the one fatal startup condition.
    let ca = Arc::new(CaManager::ensure(&ca_dir).context("root CA unavailable")?);
    tracing::info!("Root CA: {:?}", ca.cert_path());

    let hub = Arc::new(EventHub::default());
    let event_task = tokio::spawn(log_events(hub.subscribe()));

    let fetcher = HttpFetcher::from_config(&config).context("invalid download settings")?;
    let registry = Arc::new(Registry::new(
        RegistrySettings::from_config(&config),
        Arc::new(ProviderSet::with_defaults()),
        Arc::new(fetcher),
        hub,
    ));
    registry.set_type_filter(config.type_filter.iter().copied());

    let extractor = Arc::new(Extractor::new(
        Arc::clone(&registry),
        ExtractorSettings::from_config(&config),
    ));
    let policy = Arc::new(InterceptPolicy::new(&config.intercept));

    let server = ProxyServer::new(ProxyConfig::from_config(&config)?, ca, extractor, policy);
    let handle = server.start().context("failed to start proxy")?;
    tracing::info!("Resd listening on {}", handle.addr());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");

    handle.stop().await;
    event_task.abort();
    tracing::info!("Captured {} resources this session", registry.len());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_logging(&args);

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => default_config_path().context("no configuration directory available")?,
    };
    let mut config = ResdConfig::load_or_default(&config_path)
        .with_context(|| format!("failed to load {:?}", config_path))?;
    args.apply(&mut config);
    tracing::debug!("Configuration: {:?}", config);

    match &args.command {
        Some(Command::ExportCert { path }) => export_cert(&args.ca_dir()?, path),
        Some(Command::Decode {
            file,
            param,
            provider,
        }) => decode_file(file, provider, param.as_deref()),
        None => run(config, args.ca_dir()?).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resd_core::ResourceType;
    use tempfile::TempDir;

    #[test]
    fn cli_overrides_config() {
        let args = Args::parse_from([
            "resd",
            "--port",
            "9100",
            "--save-dir",
            "/tmp/media",
        ]);
        let mut config = ResdConfig::default();
        args.apply(&mut config);
        assert_eq!(config.port, 9100);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.save_directory, PathBuf::from("/tmp/media"));
    }

    #[test]
    fn decode_subcommand_parses() {
        let args = Args::parse_from(["resd", "decode", "cache.bin", "--param", "Zm9v"]);
        match args.command {
            Some(Command::Decode {
                file,
                param,
                provider,
            }) => {
                assert_eq!(file, PathBuf::from("cache.bin"));
                assert_eq!(param.as_deref(), Some("Zm9v"));
                assert_eq!(provider, CHANNELS);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn export_cert_writes_pem() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out").join("resd.crt");
        export_cert(&dir.path().join("ca"), &out).unwrap();
        let pem = std::fs::read_to_string(out).unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn decode_file_writes_decoded_copy() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("thumb.jpg");
        let plain = [0xFFu8, 0xD8, 0xFF, 0xE0, 1, 2, 3];
        let encoded: Vec<u8> = plain.iter().map(|b| b ^ 0x5A).collect();
        std::fs::write(&input, encoded).unwrap();

        decode_file(&input, "xorbyte", Some("5a")).unwrap();
        let output = dir.path().join("thumb_decoded.jpg");
        assert_eq!(std::fs::read(output).unwrap(), plain);
    }

    #[test]
    fn config_type_filter_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut config = ResdConfig::default();
        config.type_filter.insert(ResourceType::Video);
        config.save(&path).unwrap();
        let loaded = ResdConfig::load_or_default(&path).unwrap();
        assert!(loaded.type_filter.contains(&ResourceType::Video));
    }
}
