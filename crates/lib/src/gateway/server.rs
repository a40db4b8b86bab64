//! Gateway HTTP server: health plus webhook ingress in front of the channel manager.

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path as UrlPath, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::channels::{
    ChannelAdapter, ChannelError, ChannelManager, SessionHandleStore, SocketChannel,
    TelegramChannel, TelegramUpdate, WebhookChannel, WebhookMessage, WEBHOOK_CHANNEL_ID,
};
use crate::config::{self, Config};
use crate::pipeline::{EchoPipeline, HttpPipeline, Pipeline};

const TELEGRAM_SECRET_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub manager: Arc<ChannelManager>,
    /// Present when Telegram runs in webhook mode; `/telegram/webhook` feeds it.
    pub telegram: Option<Arc<TelegramChannel>>,
    pub webhook: Option<Arc<WebhookChannel>>,
}

fn build_pipeline(config: &Config) -> Arc<dyn Pipeline> {
    match config.pipeline.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => {
            log::info!("gateway: pipeline at {}", url);
            Arc::new(HttpPipeline::new(url))
        }
        None => {
            log::info!("gateway: no pipeline url configured, echoing messages back");
            Arc::new(EchoPipeline)
        }
    }
}

/// Build the manager and register every adapter the config enables. Nothing is started yet.
pub async fn build_state(config: Config, config_path: &Path) -> GatewayState {
    let manager = Arc::new(ChannelManager::new(
        config.dispatch.settings(),
        build_pipeline(&config),
    ));

    let mut telegram_webhook = None;
    if let Some(token) = config::resolve_telegram_token(&config) {
        let mut telegram = TelegramChannel::new(Some(token));
        if let Some(ref url) = config.channels.telegram.webhook_url {
            telegram = telegram.with_webhook(url.clone(), config.channels.telegram.webhook_secret.clone());
        }
        let telegram = Arc::new(telegram);
        if telegram.is_webhook_mode() {
            telegram_webhook = Some(Arc::clone(&telegram));
        }
        manager.register(telegram);
    }

    let mut webhook = None;
    if config.channels.webhook.enabled {
        let path = config::resolve_handle_store_path(&config, config_path);
        let store = Arc::new(SessionHandleStore::load(&path).await);
        log::info!("gateway: webhook handles stored at {}", path.display());
        let channel = Arc::new(WebhookChannel::new(store));
        webhook = Some(Arc::clone(&channel));
        manager.register(channel);
    }

    if let Some(ref url) = config.channels.socket.url {
        let socket = SocketChannel::new(
            url.clone(),
            config::resolve_socket_token(&config),
            config.channels.socket.reconnect.policy(),
        );
        manager.register(Arc::new(socket));
    }

    GatewayState {
        config: Arc::new(config),
        manager,
        telegram: telegram_webhook,
        webhook,
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/telegram/webhook", post(telegram_webhook))
        .route("/webhook/:channel", post(webhook_ingress))
        .with_state(state)
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
/// Starts every configured channel, serves until SIGINT/SIGTERM, then stops the channels.
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        log::warn!(
            "gateway: binding to {} exposes unauthenticated webhook ingress beyond this host",
            bind
        );
    }
    let port = config.gateway.port;

    let state = build_state(config, &config_path).await;
    let manager = Arc::clone(&state.manager);
    manager.start_all().await;
    log::info!("gateway: channels started: {:?}", manager.channel_ids());

    let bind_addr = format!("{}:{}", bind, port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            manager.stop_all().await;
            return Err(e).with_context(|| format!("binding to {}", bind_addr));
        }
    };
    log::info!("gateway listening on {}", bind_addr);

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited");
    manager.stop_all().await;
    log::info!("gateway stopped");
    served
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("gateway: failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("gateway: failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining channels");
}

/// GET / returns health JSON with per-channel queue state.
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "port": state.config.gateway.port,
        "channels": state.manager.snapshots(),
    }))
}

/// POST /telegram/webhook: verifies the optional secret and hands the update to the channel.
async fn telegram_webhook(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(ref telegram) = state.telegram else {
        return StatusCode::NOT_FOUND;
    };
    if let Some(expected) = telegram.webhook_secret() {
        let provided = headers
            .get(TELEGRAM_SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != expected {
            return StatusCode::FORBIDDEN;
        }
    }
    let update: TelegramUpdate = match serde_json::from_slice(&body) {
        Ok(u) => u,
        Err(e) => {
            log::debug!("telegram: rejecting malformed update: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };
    if telegram.accept_update(&update) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

fn error_response(status: StatusCode, err: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

/// POST /webhook/:channel: accepts one message for the webhook channel.
async fn webhook_ingress(
    State(state): State<GatewayState>,
    UrlPath(channel): UrlPath<String>,
    body: Bytes,
) -> Response {
    let webhook = match state.webhook {
        Some(ref w) if w.id() == channel => Arc::clone(w),
        _ => return error_response(StatusCode::NOT_FOUND, ChannelError::UnknownChannel(channel)),
    };
    let msg: WebhookMessage = match serde_json::from_slice(&body) {
        Ok(m) => m,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    match webhook.accept(msg).await {
        Ok(accepted) => (StatusCode::ACCEPTED, Json(accepted)).into_response(),
        Err(e @ ChannelError::Protocol { .. }) => error_response(StatusCode::BAD_REQUEST, e),
        Err(e @ ChannelError::Transient { .. }) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, e)
        }
        Err(e) => {
            log::warn!("{}: ingress failed: {}", WEBHOOK_CHANNEL_ID, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}
