use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

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
use tracing::info;
use uuid::Uuid;

use tandem_api::middleware::{require_auth, verify_token};
use tandem_api::{AppState, AppStateInner, couples, moments, notifications};
use tandem_core::{
    BlobStore, CoordinatorConfig, ExpirationScheduler, FusionConfig, MomentCoordinator,
    PhotoFusionEngine, TransitionPublisher,
};
use tandem_db::Database;
use tandem_gateway::{Dispatcher, NotificationDispatcher, PushGateway, connection};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("TANDEM_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("TANDEM_DB_PATH").unwrap_or_else(|_| "tandem.db".into());
    let blob_dir = std::env::var("TANDEM_BLOB_DIR").unwrap_or_else(|_| "./blobs".into());
    let host = std::env::var("TANDEM_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("TANDEM_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let sweep_secs: u64 = std::env::var("TANDEM_SWEEP_INTERVAL_SECS")
        .unwrap_or_else(|_| "30".into())
        .parse()?;
    let push_endpoint = std::env::var("TANDEM_PUSH_ENDPOINT").ok();

    // Storage
    let db = Arc::new(Database::open(&PathBuf::from(&db_path))?);
    let blobs = Arc::new(BlobStore::new(PathBuf::from(&blob_dir)).await?);

    // Event fan-out
    let dispatcher = Dispatcher::new();
    let push = Arc::new(PushGateway::new(push_endpoint));
    let notifier =
        NotificationDispatcher::new(Arc::clone(&db), dispatcher.clone(), push);

    // Protocol core
    let engine = Arc::new(PhotoFusionEngine::new(FusionConfig::default()));
    let coordinator = Arc::new(MomentCoordinator::new(
        Arc::clone(&db),
        Arc::clone(&blobs),
        engine,
        Arc::new(notifier) as Arc<dyn TransitionPublisher>,
        CoordinatorConfig::default(),
    ));

    // Expiry sweep
    let scheduler = ExpirationScheduler::new(
        Arc::clone(&db),
        Arc::clone(&coordinator),
        Duration::from_secs(sweep_secs),
    );
    tokio::spawn(scheduler.run());

    // Shared state
    let app_state: AppState = Arc::new(AppStateInner {
        db,
        blobs,
        coordinator,
        dispatcher: dispatcher.clone(),
        jwt_secret,
    });

    // Routes
    let protected_routes = Router::new()
        .route("/couples", post(couples::create_couple))
        .route("/couples/{couple_id}", get(couples::get_couple))
        .route(
            "/couples/{couple_id}/moments/active",
            get(moments::active_moments),
        )
        .route("/moments", post(moments::initiate))
        .route("/moments/{moment_id}", get(moments::get_moment))
        .route("/moments/{moment_id}/capture", post(moments::capture))
        .route("/moments/{moment_id}/image", get(moments::get_combined_image))
        .route("/moments/{moment_id}/thumbnail", get(moments::get_thumbnail))
        .route("/notifications", get(notifications::list_notifications))
        .route(
            "/notifications/{notification_id}/read",
            post(notifications::mark_read),
        )
        .layer(middleware::from_fn(require_auth))
        .with_state(app_state.clone());

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(app_state);

    let app = Router::new()
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Tandem server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: String,
    couple_id: Uuid,
}

/// WebSocket upgrade for the couple event stream. Token and couple
/// membership are checked here so the connection loop can stay forward-only.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let claims =
        verify_token(&query.token, &state.jwt_secret).ok_or(StatusCode::UNAUTHORIZED)?;

    let db = Arc::clone(&state.db);
    let couple_id = query.couple_id;
    let couple = tokio::task::spawn_blocking(move || db.get_couple(couple_id))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    if !couple.is_member(claims.sub) {
        return Err(StatusCode::FORBIDDEN);
    }

    let dispatcher = state.dispatcher.clone();
    Ok(ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, dispatcher, couple_id, claims.sub)
    }))
}
