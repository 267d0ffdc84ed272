//! Web服务器

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::handlers::{self, AppState};

pub struct WebServer {
    addr: SocketAddr,
    app: Router,
}

impl WebServer {
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self {
            addr,
            app: router(state),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!("Starting web server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.app)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start web server: {}", e))?;

        Ok(())
    }
}

/// 完整路由
pub fn router(state: AppState) -> Router {
    Router::new()
        // 根路径
        .route("/", get(handlers::api_root))
        // 健康检查与指标
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // API路由
        .nest("/api/v1", api_routes())
        .with_state(state)
        // 全局中间件
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
}

/// API v1 路由
fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::api_root))
        .route("/tokens", post(handlers::admit_token))
        .route("/events", get(handlers::stream_events))
        .route("/stages/:stage/queue", get(handlers::list_stage_queue))
        .route(
            "/stages/:stage/stations",
            get(handlers::list_stations).post(handlers::add_station),
        )
        .route(
            "/stages/:stage/stations/:id",
            axum::routing::delete(handlers::remove_station),
        )
        .route(
            "/stages/:stage/stations/:id/queue",
            get(handlers::station_queue),
        )
        .route(
            "/stages/:stage/stations/:id/report",
            post(handlers::report_at_station),
        )
        .route(
            "/stages/:stage/stations/:id/finish",
            post(handlers::finish_at_station),
        )
        .route(
            "/stages/:stage/stations/:id/enable",
            post(handlers::enable_station),
        )
        .route(
            "/stages/:stage/stations/:id/disable",
            post(handlers::disable_station),
        )
        .route("/doctors", get(handlers::list_doctors))
        .route("/doctors/:id/enable", post(handlers::enable_doctor))
        .route("/doctors/:id/disable", post(handlers::disable_doctor))
        .route("/patients", get(handlers::list_patients))
        .route("/patients/:uhid", get(handlers::get_patient))
}
