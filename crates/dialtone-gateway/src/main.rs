//! Dialtone Gateway — Twilio voice webhook and media-stream bridge.
//! One `CallSession` per media-stream WebSocket; provider clients are built once and shared.

mod config;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Router,
};
use crate::config::GatewayConfig;
use dialtone_voice::{CallServices, CallSession, OutboundEvent, TelephonyInput};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Queue depth between the socket tasks and the session
const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
struct AppState {
    services: Arc<CallServices>,
    public_host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[dialtone-gateway] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::load()?;
    let state = AppState {
        services: Arc::new(config.build_services()?),
        public_host: config.public_host.clone(),
    };

    let app = router(state);
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "Dialtone gateway listening");

    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/twiml", post(twiml))
        .route("/media-stream", get(media_stream))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html("<h1>Nexus Voice Agent is Running</h1>")
}

async fn health() -> &'static str {
    "OK"
}

/// Voice webhook: tell Twilio to open a bidirectional media stream back to us.
async fn twiml(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let host = state.public_host.clone().or_else(|| {
        headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
    });

    match host {
        Some(host) => {
            info!(%host, "Incoming call, connecting media stream");
            ([(header::CONTENT_TYPE, "application/xml")], twiml_body(&host)).into_response()
        }
        None => (StatusCode::BAD_REQUEST, "missing Host header").into_response(),
    }
}

fn twiml_body(host: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><Response><Connect><Stream url="wss://{}/media-stream" /></Connect></Response>"#,
        host
    )
}

async fn media_stream(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_call(socket, state.services))
}

/// Bridge one socket to one session. The socket closes once the session ends,
/// including when transcription could not be started.
async fn handle_call(socket: WebSocket, services: Arc<CallServices>) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundEvent>(CHANNEL_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel::<TelephonyInput>(CHANNEL_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let text = match event.to_wire() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Could not serialize outbound event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if inbound_tx.send(TelephonyInput::Frame(text)).await.is_err() {
                        return;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Media stream read failed");
                    break;
                }
            }
        }
        let _ = inbound_tx.send(TelephonyInput::Disconnected).await;
    });

    let session = CallSession::new(services, outbound_tx);
    match session.run(inbound_rx).await {
        Ok(summary) => debug!(
            summary = %serde_json::to_string(&summary).unwrap_or_default(),
            "Call summary"
        ),
        Err(e) => warn!(error = %e, fatal = e.is_fatal(), "Dropping call"),
    }

    reader.abort();
    // Session is gone, so the outbound queue drains and the writer closes the socket
    let _ = writer.await;
}
