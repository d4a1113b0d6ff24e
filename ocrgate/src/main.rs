use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ocrgate::api::{create_router, AppState};
use ocrgate::{Config, OcrRequest, OcrResult, OcrService};

#[derive(Parser)]
#[command(name = "ocrgate")]
#[command(about = "Multi-provider OCR dispatch with health-aware fail-over")]
struct Cli {
    /// TOML configuration file; falls back to OCRGATE_CONFIG, then the environment
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API (default)
    Serve,
    /// OCR one or more local files
    Process {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long)]
        language: Option<String>,
        #[arg(long)]
        handwriting: bool,
        #[arg(long)]
        tables: bool,
        #[arg(long)]
        forms: bool,
        /// Print full results as JSON instead of plain text
        #[arg(long)]
        json: bool,
    },
    /// Probe every configured provider
    Health,
    /// List configured providers and their capabilities
    Providers,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    dotenvy::dotenv().ok();
    init_tracing();

    let config_path = cli
        .config
        .or_else(|| std::env::var_os("OCRGATE_CONFIG").map(PathBuf::from));
    let config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Process {
            files,
            language,
            handwriting,
            tables,
            forms,
            json,
        } => {
            let service = OcrService::from_config(&config)?;
            let mut requests = Vec::with_capacity(files.len());
            for file in &files {
                let mut request = read_request(file).await?
                    .requiring_handwriting(handwriting)
                    .requiring_table_detection(tables)
                    .requiring_form_detection(forms);
                if let Some(language) = &language {
                    request = request.with_language(language.clone());
                }
                requests.push(request);
            }

            let cancel = CancellationToken::new();
            let results = tokio::select! {
                results = service.process_batch(&requests, &cancel) => results,
                _ = tokio::signal::ctrl_c() => {
                    cancel.cancel();
                    anyhow::bail!("Interrupted");
                }
            };
            print_results(&files, &results, json)?;

            let failed = results.iter().filter(|r| !r.is_success()).count();
            if failed > 0 {
                anyhow::bail!("{failed} of {} file(s) failed", results.len());
            }
            Ok(())
        }
        Command::Health => {
            let service = OcrService::from_config(&config)?;
            let report = service.check_all_health().await;
            let report: Vec<_> = report
                .into_iter()
                .map(|(name, health)| serde_json::json!({ "name": name, "health": health }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Providers => {
            let service = OcrService::from_config(&config)?;
            println!("{}", serde_json::to_string_pretty(&service.providers())?);
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ocrgate=info,tower_http=debug".into());

    let json = std::env::var("OCRGATE_LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn read_request(path: &Path) -> anyhow::Result<OcrRequest> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut request = OcrRequest::new(bytes);
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        request = request.with_file_name(name);
    }
    Ok(request)
}

fn print_results(files: &[PathBuf], results: &[OcrResult], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
        return Ok(());
    }

    for (file, result) in files.iter().zip(results) {
        match result.error() {
            Some(error) => eprintln!("{}: error: {error}", file.display()),
            None => {
                if files.len() > 1 {
                    println!(
                        "==> {} ({}, confidence {:.2})",
                        file.display(),
                        result.provider(),
                        result.confidence()
                    );
                }
                println!("{}", result.text());
            }
        }
    }
    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    if config.server.api_keys.is_empty() {
        tracing::warn!("OCRGATE_API_KEYS is not set; OCR endpoints accept unauthenticated requests");
    }

    let cancel_token = CancellationToken::new();
    let state = AppState::from_config(config.clone(), cancel_token.clone())?;

    let registry = state.service.registry();
    if registry.is_empty() {
        tracing::warn!("No OCR providers configured; every request will fail");
    }
    for provider in registry.providers() {
        if provider.is_configured() {
            tracing::info!(provider = provider.name(), "OCR provider registered");
        } else {
            tracing::warn!(provider = provider.name(), "OCR provider registered without usable configuration");
        }
    }

    let refresh_interval = Duration::from_secs(config.health.refresh_interval_secs);
    if !refresh_interval.is_zero() {
        tracing::info!(
            "Starting health refresh loop... (interval={}s)",
            config.health.refresh_interval_secs
        );
        let monitor = state.service.health_monitor().clone();
        let token = cancel_token.child_token();
        tokio::spawn(async move {
            monitor.run_refresh_loop(refresh_interval, token).await;
        });
    }

    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("ocrgate starting on http://{}", addr);
    tracing::info!("  Health check: http://{}/api/v1/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel_token))
        .await?;

    Ok(())
}

async fn shutdown_signal(cancel_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, cancelling in-flight requests...");
    cancel_token.cancel();
}
