use anyhow::Result;
use axum::{
    extract::Extension,
    middleware,
    routing::{delete, get, patch, post},
    Router,
};
use chrono::{DateTime, Utc};
use outreach_approval::{AutoApprovalScheduler, QueueService};
use outreach_core::{ChannelAdapter, OutreachContext};
use outreach_dispatch::Dispatcher;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing;

use crate::auth;
use crate::handlers;

/// Shared handler state, installed as a request extension.
#[derive(Clone)]
pub struct ApiState {
    pub ctx: OutreachContext,
    pub queue: Arc<QueueService>,
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: Arc<AutoApprovalScheduler>,
    clock: fn() -> DateTime<Utc>,
}

impl ApiState {
    pub fn new(ctx: OutreachContext, channel: Arc<dyn ChannelAdapter>) -> Self {
        ApiState {
            queue: Arc::new(QueueService::new(ctx.clone())),
            dispatcher: Arc::new(Dispatcher::new(&ctx, channel)),
            scheduler: Arc::new(AutoApprovalScheduler::new(&ctx)),
            ctx,
            clock: Utc::now,
        }
    }

    /// Replaces the wall clock handlers evaluate compliance against.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

fn cors_layer(origins: Option<&str>) -> CorsLayer {
    match origins {
        Some(origins) => {
            let mut cors = CorsLayer::new();
            for origin in origins.split(',').map(str::trim) {
                if let Ok(parsed) = origin.parse::<axum::http::HeaderValue>() {
                    cors = cors.allow_origin(parsed);
                }
            }
            cors.allow_methods(Any).allow_headers(Any)
        }
        None => {
            tracing::warn!("CORS_ORIGINS not set, using permissive CORS. Set CORS_ORIGINS for production!");
            CorsLayer::permissive()
        }
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = cors_layer(state.ctx.config.server.cors_origins.as_deref());

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/jobs/dispatch", post(handlers::run_dispatch))
        .route("/api/v1/jobs/auto-approve", post(handlers::run_auto_approval))
        .route("/api/v1/messages/bulk-approve", post(handlers::bulk_approve))
        .route("/api/v1/messages/:id/approve", post(handlers::approve_message))
        .route("/api/v1/messages/:id", patch(handlers::edit_message))
        .route(
            "/api/v1/messages/:id/auto-approval",
            delete(handlers::cancel_auto_approval),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(Extension(state))
                .layer(middleware::from_fn(auth::auth_middleware)),
        )
}

pub async fn run(ctx: OutreachContext, channel: Arc<dyn ChannelAdapter>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", ctx.config.server.host, ctx.config.server.api_port).parse()?;
    let app = router(ApiState::new(ctx, channel));

    tracing::info!("Starting API server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
