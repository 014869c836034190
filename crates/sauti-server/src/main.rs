//! Sauti Gateway - provider-agnostic HTTP and gRPC front end for
//! llama.cpp, whisper.cpp, and piper child engines.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use sauti_core::backend::llama::LlamaBackend;
use sauti_core::backend::piper::PiperBackend;
use sauti_core::backend::whisper::WhisperBackend;
use sauti_core::{config, BackendRegistry, Config, Env, ModelManager, ServerSupervisor};
use sauti_proto::inference::v1::inference_service_server::InferenceServiceServer;

mod api;
mod dispatch;
mod error;
mod grpc;
mod logger;
mod state;
#[cfg(test)]
mod testutil;

use dispatch::Dispatcher;
use state::AppState;

#[derive(Parser)]
#[command(
    name = "sauti",
    about = "Local inference gateway fronting llama.cpp, whisper.cpp, and piper",
    version
)]
struct Cli {
    /// HTTP port to listen on
    #[arg(long, default_value_t = config::default_http_port())]
    http_port: u16,

    /// gRPC port to listen on
    #[arg(long, default_value_t = config::default_grpc_port())]
    grpc_port: u16,

    /// Path to the config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Path to the config schema file (validated upstream)
    #[arg(long, value_name = "PATH")]
    schema: Option<PathBuf>,

    /// Path to the llama-server binary
    #[arg(long, default_value = "./bin/llama-server", value_name = "PATH")]
    llama_bin: PathBuf,

    /// Path to the whisper-server binary
    #[arg(long, default_value = "./bin/whisper-server", value_name = "PATH")]
    whisper_bin: PathBuf,

    /// Path to the piper binary
    #[arg(long, default_value = "./bin/piper", value_name = "PATH")]
    piper_bin: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let environment = Env::from_env();
    logger::init(environment);

    info!(%environment, "starting sauti gateway");
    if let Some(schema) = &cli.schema {
        debug!(schema = %schema.display(), "schema path accepted; validation happens upstream");
    }

    let config_path = cli
        .config
        .unwrap_or_else(|| config::default_config_dir().join("config.yaml"));
    let cfg = Config::from_file(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    info!(config = %config_path.display(), "config loaded");

    let shutdown = CancellationToken::new();

    let models = Arc::new(ModelManager::new());
    models
        .load_models_from_config(&shutdown, &cfg)
        .await
        .context("loading models from config")?;
    info!(models = models.registry().await.len(), "model registry ready");

    let supervisor = Arc::new(ServerSupervisor::new());
    let backends = Arc::new(BackendRegistry::new());

    backends
        .register(Arc::new(LlamaBackend::new(
            cli.llama_bin.clone(),
            supervisor.clone(),
        )))
        .context("registering llama backend")?;
    backends
        .register(Arc::new(WhisperBackend::new(
            cli.whisper_bin.clone(),
            supervisor.clone(),
        )))
        .context("registering whisper backend")?;
    match PiperBackend::new(cli.piper_bin.clone()) {
        Ok(piper) => backends
            .register(Arc::new(piper))
            .context("registering piper backend")?,
        Err(err) => error!(error = %err, "piper backend unavailable"),
    }

    let dispatcher = Arc::new(Dispatcher::new(backends.clone(), models.clone()));
    let app = api::router(AppState {
        dispatcher: dispatcher.clone(),
    });
    let grpc_service = InferenceServiceServer::new(grpc::InferenceGrpc::new(dispatcher));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let http_addr = SocketAddr::from(([0, 0, 0, 0], cli.http_port));
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding HTTP listener on {http_addr}"))?;
    info!(address = %format!("http://{http_addr}"), "HTTP server listening");

    let http = {
        let shutdown = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
    };

    let grpc_addr = SocketAddr::from(([0, 0, 0, 0], cli.grpc_port));
    info!(address = %format!("grpc://{grpc_addr}"), "gRPC server listening");
    let grpc = {
        let shutdown = shutdown.clone();
        tonic::transport::Server::builder()
            .add_service(grpc_service)
            .serve_with_shutdown(grpc_addr, async move { shutdown.cancelled().await })
    };

    let (http_result, grpc_result) = tokio::join!(http, grpc);
    http_result.context("HTTP server error")?;
    grpc_result.context("gRPC server error")?;

    info!("shutting down");
    supervisor.stop_all().await;
    if let Err(err) = backends.close_all().await {
        error!(error = %err, "failed to close backends");
    }
    info!("shutdown complete");

    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
