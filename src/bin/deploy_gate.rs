use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use deploy_gate::api::sandbox::{self, Sandbox};
use deploy_gate::prelude::*;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
#[cfg(feature = "otel")]
use tracing_subscriber::layer::SubscriberExt;
#[cfg(feature = "otel")]
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "deploy-gate")]
#[command(about = "Approval gates for pipeline deployments", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the gate API over in-memory runs
    Serve {
        /// Path to the gate config YAML file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,
    },

    /// Validate a gate config file
    CheckConfig {
        /// Path to the gate config YAML file
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },
}

fn filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("deploy_gate=debug,tower_http=debug")
    } else {
        EnvFilter::new("deploy_gate=info")
    }
}

#[cfg(feature = "otel")]
fn init_otel_tracing(verbose: bool) {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::runtime::Tokio;
    use opentelemetry_sdk::trace::TracerProvider;

    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp_endpoint)
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            init_tracing(verbose);
            tracing::warn!("OTLP exporter unavailable, tracing locally: {}", e);
            return;
        }
    };

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .build();

    let tracer = provider.tracer("deploy-gate");
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(filter(verbose))
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
        .init();

    opentelemetry::global::set_tracer_provider(provider);
}

fn init_tracing(verbose: bool) {
    tracing_subscriber::fmt().with_env_filter(filter(verbose)).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    #[cfg(feature = "otel")]
    init_otel_tracing(cli.verbose);

    #[cfg(not(feature = "otel"))]
    init_tracing(cli.verbose);

    let result = run(cli).await;

    #[cfg(feature = "otel")]
    opentelemetry::global::shutdown_tracer_provider();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = format!("{:#}", e), "deploy-gate failed");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve { config, bind } => serve(config.as_deref(), bind).await,
        Commands::CheckConfig { config } => check_config(&config),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<GateConfig> {
    let config = match path {
        Some(path) => GateConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => GateConfig::default(),
    };
    Ok(config.with_env_overrides())
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = load_config(Some(path))?;

    if config.deploy_callback.is_empty() {
        tracing::warn!("deploy_callback is empty: every deploy request will be refused");
    }
    if config.notice_callback.is_empty() {
        tracing::info!("notice_callback is empty: lifecycle notices are disabled");
    }
    println!("{}: OK", path.display());
    Ok(())
}

async fn serve(config: Option<&Path>, bind: SocketAddr) -> anyhow::Result<()> {
    let config = load_config(config)?;

    let store: Arc<dyn RunStore> = match &config.state_dir {
        Some(dir) => {
            tracing::info!("Persisting gate ids under {}", dir.display());
            Arc::new(JsonRunStore::new(dir))
        }
        None => MemoryRunStore::new(),
    };

    let services = Arc::new(
        GateServices::from_config(config, tokio::runtime::Handle::current())
            .context("creating callback client")?,
    );
    let runs = RunTable::new();
    let sandbox = Arc::new(Sandbox::new(services, store, Arc::clone(&runs)));

    let app = router(ApiState::new(runs))
        .merge(sandbox::router(sandbox))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    tracing::info!("Listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}
