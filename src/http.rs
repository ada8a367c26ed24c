//! Transport plumbing: the WebSocket upgrade endpoint, the NIP-11
//! relay-information document, and the health endpoint (spec §6). TLS
//! termination and the listening socket itself are the caller's concern
//! (`main.rs`); this module only builds the `axum::Router`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::orchestrator::{ConnectionRefused, RelayOrchestrator};
use crate::rate_limit::client_ip;
use crate::session::{self, InboundHandler};

pub fn router(orchestrator: Arc<RelayOrchestrator>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

fn wants_relay_info(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/nostr+json"))
        .unwrap_or(false)
}

async fn root_handler(
    State(orchestrator): State<Arc<RelayOrchestrator>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if wants_relay_info(&headers) {
        return Json(orchestrator.relay_info()).into_response();
    }

    let Some(ws) = ws else {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };

    let ip = client_ip(
        headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok()),
        headers.get("x-real-ip").and_then(|v| v.to_str().ok()),
        addr,
    );

    if let Err(refusal) = orchestrator.try_register_connection(ip) {
        let reason = match refusal {
            ConnectionRefused::PerIpLimit => "too many connections from this address",
            ConnectionRefused::GlobalLimit => "relay has reached its connection limit",
        };
        return (StatusCode::TOO_MANY_REQUESTS, reason).into_response();
    }

    ws.on_upgrade(move |socket| async move {
        let id = orchestrator.next_session_id();
        let (session, outbound_rx) = session::new_session(id, addr.to_string(), ip);
        orchestrator.register_session(session.clone()).await;
        let handler: Arc<dyn InboundHandler> = orchestrator;
        session::handle_socket(socket, session, outbound_rx, handler).await;
    })
}

async fn health_handler(State(orchestrator): State<Arc<RelayOrchestrator>>) -> Response {
    let doc = orchestrator.health_with_active_connections().await;
    let status =
        StatusCode::from_u16(doc.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(doc)).into_response()
}
