use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Request, State};
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use clap::Parser;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use meshgate::config::Config;
#[cfg(not(feature = "redis"))]
use meshgate::directory::MemoryDirectory;
#[cfg(feature = "redis")]
use meshgate::directory::RedisDirectory;
use meshgate::metrics::App as MetricsApp;
use meshgate::router::RouteResolver;
use meshgate::Runtime;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a JSON or YAML config file.
    #[arg(short, long, value_name = "file")]
    file: Option<PathBuf>,

    /// Inline config contents, mutually exclusive with --file.
    #[arg(short, long, value_name = "config")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    let config = match (args.file, args.config) {
        (Some(path), None) => Config::from_file(&path).context("loading config file")?,
        (None, Some(inline)) => {
            Config::from_str_sniffed(&inline, None).context("parsing inline config")?
        }
        (Some(_), Some(_)) => {
            eprintln!("config error: both --file and --config cannot be provided, exiting");
            std::process::exit(2);
        }
        (None, None) => {
            eprintln!("error: either --file or --config must be provided, exiting");
            std::process::exit(2);
        }
    };
    config.validate().context("invalid config")?;

    let routes = RouteResolver::new();
    let listen_addr: SocketAddr = config.listen_addr.parse().context("invalid listen_addr")?;

    #[cfg(feature = "redis")]
    let directory: Arc<dyn meshgate::directory::Directory> = Arc::new(
        RedisDirectory::connect(&config.registry, &config.registry_prefix)
            .await
            .context("connecting to directory backend")?,
    );
    #[cfg(not(feature = "redis"))]
    let directory: Arc<dyn meshgate::directory::Directory> = {
        tracing::warn!("redis feature disabled, falling back to an in-process directory");
        Arc::new(MemoryDirectory::new())
    };

    let runtime = Arc::new(Runtime::build(config, directory, routes).await?);

    let mut run_set = JoinSet::new();

    let dispatch_runtime = runtime.clone();
    let dispatch_router = Router::new()
        .fallback(any(handle))
        .with_state(dispatch_runtime);
    let dispatch_listener = tokio::net::TcpListener::bind(listen_addr).await?;
    run_set.spawn(async move {
        axum::serve(dispatch_listener, dispatch_router).await.ok();
    });

    let metrics_app = MetricsApp::new(runtime.registry.clone());
    let metrics_listener = tokio::net::TcpListener::bind("0.0.0.0:19090").await?;
    run_set.spawn(async move {
        axum::serve(metrics_listener, metrics_app.router()).await.ok();
    });

    let shutdown_runtime = runtime.clone();
    run_set.spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, draining in-flight work");
        shutdown_runtime.shutdown().await;
    });

    while let Some(result) = run_set.join_next().await {
        result?;
    }
    Ok(())
}

async fn handle(State(runtime): State<Arc<Runtime>>, req: Request) -> impl IntoResponse {
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return axum::http::StatusCode::BAD_REQUEST.into_response(),
    };
    let req = http::Request::from_parts(parts, bytes);
    match runtime.dispatcher.dispatch(req).await {
        Ok(response) => response.map(axum::body::Body::from).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "dispatch failed");
            axum::http::StatusCode::BAD_GATEWAY.into_response()
        }
    }
}
