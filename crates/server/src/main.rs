use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use storage::Storage;
use tracing::{error, info};

mod config;
mod hub;
mod relay;
mod session;

use config::{load_settings, prepare_database_url};
use hub::Hub;
use relay::RelayContext;

#[derive(Clone)]
struct AppState {
    relay: RelayContext,
    auth_grace: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|err| {
        error!(
            %database_url,
            error = %err,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        err
    })?;
    storage.health_check().await?;

    let relay = RelayContext::new(storage, Arc::new(Hub::new()), settings.history_limit);
    let state = AppState {
        relay,
        auth_grace: Duration::from_secs(settings.auth_grace_seconds),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "relay listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        session::handle_socket(state.relay.clone(), state.auth_grace, socket)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let relay = RelayContext::new(storage, Arc::new(Hub::new()), 50);
        build_router(Arc::new(AppState {
            relay,
            auth_grace: Duration::from_secs(5),
        }))
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::get("/healthz")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ws_route_requires_upgrade() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::get("/ws").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_ne!(response.status(), StatusCode::OK);
    }
}
