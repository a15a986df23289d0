use crate::{ai::caption_model_loader, config::Config, routes::get_routes, AppState};
use analytics_tracing::TracingConfig;
use dotenvy::dotenv;
use std::net::SocketAddr;

const SERVICE_NAME: &str = "caption-server";
const DEFAULT_LOG_FILTER: &str = "caption_server=info,ai=info,file_downloader=info,tower_http=info";

pub async fn start_server() -> anyhow::Result<()> {
    match dotenv() {
        Ok(path) => println!(".env read successfully from {}", path.display()),
        Err(e) => println!("Could not load .env file: {e}"),
    };

    analytics_tracing::init_tracing_to_stdout(&TracingConfig::new(
        SERVICE_NAME,
        DEFAULT_LOG_FILTER,
    ));

    let config = Config::from_env()?;
    tracing::info!(?config, "configuration loaded");

    let loader = caption_model_loader(&config)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = AppState::new(config, loader)?;

    // load in the background so the first request does not pay for it
    state.loader.warmup_in_background();

    let app = get_routes(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl-C received, shutting down...");
        },
        _ = terminate => {
            tracing::info!("Terminate signal received, shutting down...");
        },
    }
}
