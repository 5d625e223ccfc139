//! HTTP server: the WebSocket endpoint, markdown downloads, health and metrics.
//!
//! Each socket gets a writer task draining the connection's event channel and a
//! reader loop that handles frames one at a time, so a connection observes its
//! commands complete in the order it sent them.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc::unbounded_channel;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::is_not_found;
use crate::orchestrator::{ViewEvent, ViewKind};
use crate::shared_state::AppState;

pub const SESSION_COOKIE: &str = "sid";

#[derive(Debug, Deserialize)]
pub struct SocketParams {
    #[serde(default)]
    pub view: ViewKind,
    pub session: Option<String>,
}

pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    let addr = cfg.api_addr()?;
    let state = AppState::new(cfg)?;

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET])
        .allow_headers(Any);

    Router::new()
        .route("/socket", get(socket))
        .route("/documents/:id/download", get(download))
        .route("/healthz", get(|| async { "OK" }))
        .route("/metrics", get(crate::metrics::get_metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(state)
}

/// GET /socket?view=projects|chat: upgrades and binds the socket to a session.
///
/// The session comes from the `sid` cookie, then the `session` query parameter.
/// Without either a new session is issued and returned as a cookie.
async fn socket(
    State(state): State<AppState>,
    Query(params): Query<SocketParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let known = session_from_cookie(&headers).or(params.session);
    let issued = known.is_none();
    let session_id = known.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let view = params.view;

    let socket_session = session_id.clone();
    let mut response = ws.on_upgrade(move |socket| serve_socket(state, socket, socket_session, view));

    if issued {
        let cookie = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", SESSION_COOKIE, session_id);
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                response.headers_mut().insert(header::SET_COOKIE, value);
            }
            Err(e) => warn!("Could not set session cookie: {}", e),
        }
    }
    response
}

/// GET /documents/:id/download: the session user's document as a markdown attachment.
async fn download(State(state): State<AppState>, Path(document_id): Path<String>, headers: HeaderMap) -> Response {
    let Some(session_id) = session_from_cookie(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    match state.orchestrator.export_document(&session_id, &document_id).await {
        Ok(export) => (
            [
                (header::CONTENT_TYPE, "text/markdown; charset=utf-8".to_string()),
                (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", export.file_name)),
            ],
            export.content,
        )
            .into_response(),
        Err(e) if is_not_found(&e) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!("Download of document {} failed: {:#}", document_id, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn serve_socket(state: AppState, socket: WebSocket, session_id: String, view: ViewKind) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = unbounded_channel::<ViewEvent>();
    let conn = state.registry.register(&session_id, view, tx);
    info!("Connection {} opened ({:?} view)", conn.id, view);

    let connection_id = conn.id;
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Failed to encode event for connection {}: {}", connection_id, e);
                    continue;
                }
            };
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    state.orchestrator.initialize(&conn).await;

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(frame)) => state.orchestrator.handle_frame(&conn, &frame).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Connection {} read error: {}", conn.id, e);
                break;
            }
        }
    }

    state.registry.remove(&conn);
    info!("Connection {} closed", conn.id);
    // The writer ends once the last sender is gone.
    drop(conn);
    let _ = writer.await;
}

fn session_from_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(cookies: &[&str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for cookie in cookies {
            headers.append(header::COOKIE, HeaderValue::from_str(cookie).unwrap());
        }
        headers
    }

    #[test]
    fn test_session_cookie_is_found_among_others() {
        assert_eq!(
            session_from_cookie(&headers(&["theme=dark; sid=abc-123; lang=en"])),
            Some("abc-123".to_string())
        );
        assert_eq!(session_from_cookie(&headers(&["theme=dark", "sid=xyz"])), Some("xyz".to_string()));
    }

    #[test]
    fn test_missing_or_empty_session_cookie() {
        assert_eq!(session_from_cookie(&headers(&[])), None);
        assert_eq!(session_from_cookie(&headers(&["sidebar=open"])), None);
        assert_eq!(session_from_cookie(&headers(&["sid="])), None);
    }

    #[test]
    fn test_socket_params_default_to_projects() {
        let params: SocketParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.view, ViewKind::Projects);
        assert!(params.session.is_none());

        let params: SocketParams = serde_json::from_str(r#"{"view": "chat", "session": "s1"}"#).unwrap();
        assert_eq!(params.view, ViewKind::Chat);
        assert_eq!(params.session.as_deref(), Some("s1"));
    }
}
