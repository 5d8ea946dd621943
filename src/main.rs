//! Marketwatch backend — crypto market-data ingestion and price-alert
//! service. The real-time kline subscription manager, price alert engine,
//! and push fabric are the crate's core; the HTTP surface here is just
//! enough to expose the push-fabric websocket and a health check.

mod alerts;
mod app;
mod auth;
mod candle;
mod config;
mod error;
mod exchange;
mod kline;
mod middleware;
mod push;
mod resolver;
mod symbol;
mod tokens;

use anyhow::{Context, Result};
use app::Application;
use axum::{response::IntoResponse, routing::get, Router};
use config::Config;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;
    info!(port = config.port, "marketwatch backend starting");

    let app_state = Application::init(config.clone())
        .await
        .context("failed to initialize application")?;

    let cors_config = config.clone();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            origin
                .to_str()
                .map(|o| cors_config.origin_is_allowed(o))
                .unwrap_or(false)
        }))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    let rate_limiter = middleware::RateLimitLayer::new(middleware::RateLimitConfig::default());

    let router = Router::new()
        .route("/health", get(health))
        .route("/ws", get(push::socket::websocket_handler))
        .layer(cors)
        .layer(axum::middleware::from_fn(
            middleware::logging::request_logging_simple,
        ))
        .layer(axum::middleware::from_fn_with_state(
            rate_limiter,
            middleware::rate_limit::rate_limit_middleware,
        ))
        .with_state(app_state.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "push fabric listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(app_state))
    .await
    .context("server error")?;

    Ok(())
}

async fn health() -> impl IntoResponse {
    "ok"
}

async fn shutdown_signal(app: Arc<Application>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining");
    app.shutdown().await;
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marketwatch_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_route_returns_ok() {
        let router = Router::new().route("/health", get(health));
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
