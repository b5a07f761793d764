//! HTTP / WebSocket server

use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::info;

use super::{handlers, websocket};
use crate::error::{NetworkError, Result};
use crate::relay::Relay;

/// Build the router: WebSocket at `/`, JSON API under `/api`
pub fn create_router(relay: Arc<Relay>) -> Router {
    let mut app = Router::new()
        .route("/", get(websocket::ws_handler))
        .route("/health", get(handlers::health))
        .route("/api/status", get(handlers::get_status))
        .route("/api/clients", get(handlers::get_clients))
        .route("/api/recording/start", post(handlers::start_recording))
        .route("/api/recording/stop", post(handlers::stop_recording));

    if let Some(dir) = &relay.config().server.static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
    .with_state(relay)
}

/// Web server bound to the configured address
pub struct RelayServer {
    relay: Arc<Relay>,
}

impl RelayServer {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }

    /// Bind the listener without serving yet
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.relay.config().server.bind;
        TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)).into())
    }

    /// Serve until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local = listener.local_addr()?;
        info!("WebSocket server listening on ws://{}", local);

        let app = create_router(self.relay);
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("WebSocket server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_relay() -> Arc<Relay> {
        let mut config = AppConfig::default();
        config.mic.enabled = false;
        Arc::new(Relay::new(config))
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_body(create_router(test_relay()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let relay = test_relay();
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        relay.registry().register(tx, None);

        let (status, body) = get_body(create_router(relay), "/api/status").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["clients"], 1);
        assert_eq!(json["data"]["opus_clients"], 1);
        assert_eq!(json["data"]["recording"], false);
        assert_eq!(json["data"]["mode"], "dual");
    }

    #[tokio::test]
    async fn test_clients_endpoint() {
        let relay = test_relay();
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let id = relay.registry().register(tx, None);

        let (status, body) = get_body(create_router(relay), "/api/clients").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        let clients = json["data"].as_array().unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0]["id"], serde_json::to_value(id).unwrap());
    }

    #[tokio::test]
    async fn test_stop_recording_when_idle_conflicts() {
        let response = create_router(test_relay())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/recording/stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({"success": false, "error": "not_recording"}));
    }

    #[tokio::test]
    async fn test_static_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>client</html>").unwrap();

        let mut config = AppConfig::default();
        config.mic.enabled = false;
        config.server.static_dir = Some(dir.path().to_path_buf());
        let app = create_router(Arc::new(Relay::new(config)));

        let (status, body) = get_body(app.clone(), "/index.html").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("client"));

        let (status, _) = get_body(app, "/missing.js").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_until_shutdown() {
        let mut config = AppConfig::default();
        config.mic.enabled = false;
        config.server.bind = "127.0.0.1:0".parse().unwrap();
        let server = RelayServer::new(Arc::new(Relay::new(config)));

        let listener = server.bind().await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(listener, async {
            let _ = rx.await;
        }));

        tx.send(()).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
