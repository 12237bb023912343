use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, routing::get};
use octofhir_core::IdGenerator;
use octofhir_core::events::HookRegistry;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::handlers;
use crate::resource_store::ResourceStore;
use crate::subscriptions::SubscriptionState;

/// Shared state for the resource write path.
#[derive(Clone)]
pub struct AppState {
    pub resources: Arc<ResourceStore>,
    /// Absent when subscriptions are disabled
    pub subscriptions: Option<SubscriptionState>,
}

pub struct OctofhirServer {
    addr: SocketAddr,
    app: Router,
    hooks: Arc<HookRegistry>,
}

/// Build the router and the state behind it.
pub async fn build_app(cfg: &AppConfig) -> anyhow::Result<(Router, AppState)> {
    cfg.validate().map_err(anyhow::Error::msg)?;

    let ids = Arc::new(IdGenerator::new(cfg.subscriptions.id_strategy));
    let hooks = Arc::new(HookRegistry::new());

    let subscriptions = if cfg.subscriptions.enabled {
        let state =
            SubscriptionState::from_config(&cfg.subscriptions, ids.clone(), Some(cfg.base_url()))
                .await?;
        hooks.register(Arc::new(state.hook())).await;
        Some(state)
    } else {
        tracing::info!("Subscriptions disabled");
        None
    };

    let state = AppState {
        resources: Arc::new(ResourceStore::new(ids, hooks)),
        subscriptions: subscriptions.clone(),
    };

    let mut app = Router::new()
        // Health and info endpoints
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        // Resource write path
        .route(
            "/fhir/{resource_type}",
            axum::routing::post(handlers::create_resource),
        )
        .route(
            "/fhir/{resource_type}/{id}",
            get(handlers::read_resource).put(handlers::update_resource),
        )
        .with_state(state.clone());

    if let Some(subscriptions) = subscriptions {
        app = app.merge(subscriptions.router());
    }

    let app = app
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(axum::extract::DefaultBodyLimit::max(
            cfg.server.body_limit_bytes,
        ));

    Ok((app, state))
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    pub async fn build(self) -> anyhow::Result<OctofhirServer> {
        let (app, state) = build_app(&self.config).await?;
        Ok(OctofhirServer {
            addr: self.addr,
            app,
            hooks: state.resources.hooks().clone(),
        })
    }
}

impl OctofhirServer {
    pub async fn run(self) -> anyhow::Result<()> {
        if let Err(e) = self.hooks.on_start().await {
            tracing::warn!(error = %e, "Resource hook failed to start");
        }

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        if let Err(e) = self.hooks.on_shutdown().await {
            tracing::warn!(error = %e, "Resource hook failed to shut down");
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
