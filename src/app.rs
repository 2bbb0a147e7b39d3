use crate::admission::AdmissionService;
use crate::config::Config;
use crate::handler::console::ConsoleRegistry;
use crate::handler::middleware::request_log::log_requests;
use crate::signaling::{CallService, CallStarter, ExpirySweeper};
use crate::store::Backends;
use anyhow::Result;
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

pub struct AppStateInner {
    pub config: Arc<Config>,
    pub backends: Backends,
    pub calls: Arc<CallService>,
    pub admission: Arc<AdmissionService>,
    pub starter: Arc<CallStarter>,
    pub consoles: ConsoleRegistry,
    pub token: CancellationToken,
}

pub type AppState = Arc<AppStateInner>;

#[derive(Default)]
pub struct AppStateBuilder {
    pub config: Option<Config>,
    pub backends: Option<Backends>,
    pub token: Option<CancellationToken>,
}

impl AppStateInner {
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Overrides the store described by the config, e.g. a shared
    /// `MemoryStore` in tests.
    pub fn with_backends(mut self, backends: Backends) -> Self {
        self.backends = Some(backends);
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub async fn build(self) -> Result<AppState> {
        let mut config = self.config.unwrap_or_default();
        config.media = config.media.with_env_fallback();
        let config = Arc::new(config);
        let token = self.token.unwrap_or_default();

        let backends = match self.backends {
            Some(backends) => backends,
            None => Backends::from_config(&config.store)?,
        };
        let calls = Arc::new(CallService::new(&backends));
        let admission = Arc::new(AdmissionService::new(
            backends.directory.clone(),
            &config.media,
        ));
        let starter = Arc::new(
            CallStarter::probe(config.external_start_url.as_deref(), calls.clone()).await,
        );

        Ok(Arc::new(AppStateInner {
            config,
            backends,
            calls,
            admission,
            starter,
            consoles: ConsoleRegistry::default(),
            token,
        }))
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            axum::http::header::ACCEPT,
            axum::http::header::ORIGIN,
        ]);

    let skip_paths = Arc::new(vec!["/api/health".to_string()]);
    crate::handler::router()
        .with_state(state)
        .layer(middleware::from_fn_with_state(skip_paths, log_requests))
        .layer(cors)
}

pub async fn run(state: AppState, router: Router) -> Result<()> {
    let token = state.token.clone();
    let addr: SocketAddr = state.config.http_addr.parse()?;
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            return Err(anyhow::anyhow!("Failed to bind to {}: {}", addr, e));
        }
    };
    info!("listening on {}", addr);

    if let Some(interval) = state.config.signaling.sweep_interval() {
        let sweeper = ExpirySweeper::new(
            state.backends.calls.clone(),
            state.config.signaling.staleness(),
            interval,
        );
        tokio::spawn(sweeper.run(token.child_token()));
    } else {
        info!("expiry sweeper disabled");
    }

    let http_task = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    );

    select! {
        http_result = http_task => {
            match http_result {
                Ok(_) => info!("Server shut down gracefully"),
                Err(e) => {
                    tracing::error!("Server error: {}", e);
                    return Err(anyhow::anyhow!("Server error: {}", e));
                }
            }
        }
        _ = token.cancelled() => {
            info!("Application shutting down due to cancellation");
        }
    }
    token.cancel();
    Ok(())
}
