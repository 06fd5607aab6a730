use std::{env, net::SocketAddr, sync::Arc};

use braess_planner::planner::{
    PlannerService, config::PlannerConfig, reqwest_integration::ReqwestCaller,
};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE_NAME: &str = "braess_bff.log";
const CONFIG_ENV_VAR: &str = "BRAESS_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "braess.json";
const BIND_ENV_VAR: &str = "BRAESS_BIND";
const DEFAULT_BIND: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> Result<(), braess_planner::Error> {
    // Loaded first so RUST_LOG from .env reaches the filter.
    dotenvy::dotenv().ok();

    let file_appender = tracing_appender::rolling::daily(".", LOG_FILE_NAME);
    let (non_blocking_appender, _guard) = tracing_appender::non_blocking(file_appender);

    let default_filter = "info,braess_planner=debug";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_target(true)
        .with_level(true);
    let file_layer = fmt::layer()
        .with_writer(non_blocking_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    let config_path =
        env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = PlannerConfig::from_path(&config_path)?;
    config.apply_env_override();
    info!(
        target: "config",
        path = %config_path,
        enabled = config.enabled,
        routes = config.routes.len(),
        "Planner configuration loaded"
    );

    let service = Arc::new(PlannerService::from_config(config)?);
    let app = braess_bff::router(service, ReqwestCaller::new());

    let bind: SocketAddr = env::var(BIND_ENV_VAR)
        .unwrap_or_else(|_| DEFAULT_BIND.to_string())
        .parse()?;
    let listener = TcpListener::bind(bind).await?;
    info!("BFF listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
