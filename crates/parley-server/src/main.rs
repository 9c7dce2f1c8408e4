use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_api::auth::{self, AppState, AppStateInner};
use parley_api::middleware::{require_auth, verify_token};
use parley_api::{admin, messages, users};
use parley_gateway::connection;
use parley_gateway::dispatcher::Dispatcher;
use parley_gateway::error::RelayError;
use parley_gateway::registry::ConnectionRegistry;

#[derive(Clone)]
struct ServerState {
    app: AppState,
    dispatcher: Dispatcher,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("PARLEY_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("PARLEY_DB_PATH").unwrap_or_else(|_| "parley.db".into());
    let host = std::env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PARLEY_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database
    let db = Arc::new(parley_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state: the registry is built here and handed to the dispatcher;
    // every relay session sees the same instance through it.
    let registry = ConnectionRegistry::new();
    let dispatcher = Dispatcher::new(registry);
    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        jwt_secret,
    });

    let state = ServerState {
        app: app_state.clone(),
        dispatcher,
    };

    // Routes
    let public_routes = Router::new()
        .route("/api/auth/login", post(auth::login))
        .route("/api/users/create", post(auth::create_user))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/api/users/me", get(users::me))
        .route("/api/users/change-password", post(users::change_password))
        .route("/api/users", get(users::list_users))
        .route("/api/messages/{user_id}", get(messages::get_messages))
        .route("/api/messages/read", post(messages::mark_read))
        .route("/api/admin/create", post(admin::create_customer))
        .route("/api/admin/users", get(admin::list_customers))
        .route("/api/admin/stats", get(admin::stats))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state);

    let ws_route = Router::new().route("/ws", get(ws_upgrade)).with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
}

/// Authenticate before upgrading: an unresolvable identity is rejected here
/// and never reaches the connection registry.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let claims = verify_token(&query.token, &state.app.jwt_secret).map_err(|e| {
        warn!("{}", RelayError::AuthFailure(e.to_string()));
        StatusCode::UNAUTHORIZED
    })?;

    let dispatcher = state.dispatcher.clone();
    let db = state.app.db.clone();

    Ok(ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, dispatcher, db, claims.sub)
    }))
}
