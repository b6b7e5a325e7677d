use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use parley_core::agents::AgentCatalog;
use parley_llm::CompletionClient;
use parley_store::events::EventRepo;
use parley_store::sessions::SessionRepo;
use parley_store::Database;

use crate::auth::Authenticator;
use crate::handlers;
use crate::reply::ReplyPipeline;

/// Server configuration.
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 3000,
            request_timeout_secs: 120,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRepo>,
    pub events: Arc<EventRepo>,
    pub catalog: Arc<AgentCatalog>,
    pub auth: Arc<dyn Authenticator>,
    pub pipeline: Arc<ReplyPipeline>,
}

impl AppState {
    pub fn new(
        db: Database,
        catalog: AgentCatalog,
        auth: Arc<dyn Authenticator>,
        completion: Arc<dyn CompletionClient>,
    ) -> Self {
        let sessions = Arc::new(SessionRepo::new(db.clone()));
        let events = Arc::new(EventRepo::new(db));
        let catalog = Arc::new(catalog);
        let pipeline = Arc::new(ReplyPipeline::new(
            Arc::clone(&sessions),
            Arc::clone(&events),
            Arc::clone(&catalog),
            completion,
        ));

        Self {
            sessions,
            events,
            catalog,
            auth,
            pipeline,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/chat/agents", get(handlers::list_agents))
        .route(
            "/api/chat/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route(
            "/api/chat/sessions/{id}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route(
            "/api/chat/sessions/{id}/messages",
            post(handlers::send_message),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle whose drop does not stop
/// the server; hold it for the address.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(state).layer(TimeoutLayer::new(Duration::from_secs(
        config.request_timeout_secs,
    )));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "parley server started");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        addr: local_addr,
        port: local_addr.port(),
        _server: server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub addr: std::net::SocketAddr,
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}

/// GET /health
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
