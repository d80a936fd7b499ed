use eyre::WrapErr;
use metrics_exporter_prometheus::PrometheusBuilder;
use rehoming_api::{
    api::{AppState, router},
    backend::HttpBackend,
    security::AuthState,
    uploads::{ImgbbConfig, ImgbbUploader},
};
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();
    if let Err(err) = run().await {
        error!(target: "rehoming.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    let openapi: serde_json::Value = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or(serde_json::json!({"openapi": "3.0.3"}));
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|url| redis::Client::open(url).ok());

    let backend = Arc::new(HttpBackend::from_env());
    let uploader = Arc::new(ImgbbUploader::new(ImgbbConfig::from_env()));
    let (state, _worker) = AppState::new(backend, uploader);
    let mut state = state.with_openapi(openapi).with_redis(redis);
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => state = state.with_prometheus(handle),
        Err(err) => warn!(target: "rehoming.api", error = %err, "prometheus_recorder_unavailable"),
    }

    let app = router(state, AuthState::from_env());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target: "rehoming.api", "listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
