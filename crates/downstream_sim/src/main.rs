use std::{env, net::SocketAddr, sync::Arc};

use downstream_sim::{SimSettings, SimState, router};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

const BIND_ENV_VAR: &str = "BIND";
const DEFAULT_BIND: &str = "0.0.0.0:8081";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    dotenvy::dotenv().ok();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()?;

    let settings = SimSettings::from_env();
    info!(
        target: "config",
        service = %settings.service_name,
        role = ?settings.role,
        base_delay_ms = settings.base_delay_ms(),
        jitter_ms = settings.jitter_ms,
        error_rate = settings.error_rate,
        "Simulated downstream configured"
    );
    let app = router(Arc::new(SimState::new(settings)));

    let bind: SocketAddr = env::var(BIND_ENV_VAR)
        .unwrap_or_else(|_| DEFAULT_BIND.to_string())
        .parse()?;
    let listener = TcpListener::bind(bind).await?;
    info!("Downstream listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
