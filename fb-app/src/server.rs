//! Feedback bridge server and one-shot commands.
//!
//! Wires the Telegram channel, the bridge and the feedback relay together,
//! then mounts the HTTP surface (and the webhook receiver in webhook mode).

use crate::config::{FeedbackBridgeConfig, TelegramMode};
use crate::feedback::{FeedbackOutcome, FeedbackRelay, ReplyWaiters};
use crate::routes;
use crate::state::FileCursorStore;
use anyhow::Result;
use axum::Extension;
use axum::Router;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use fb_bridge::Bridge;
use fb_channels::{ChatId, RemoteChannel, TelegramChannel, webhook_router};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const WEBHOOK_QUEUE_CAPACITY: usize = 256;
/// Headroom kept between a feedback wait and the HTTP request timeout.
const FEEDBACK_TIMEOUT_HEADROOM: Duration = Duration::from_secs(5);

pub struct AppState {
    pub relay: Arc<FeedbackRelay>,
    pub started_at: Instant,
    pub default_feedback_timeout_secs: u64,
    pub request_timeout: Duration,
    pub max_in_flight: usize,
}

impl AppState {
    /// Requested timeout, defaulted and kept under the HTTP request timeout.
    pub fn feedback_timeout(&self, requested: Option<u64>) -> Duration {
        let requested =
            Duration::from_secs(requested.unwrap_or(self.default_feedback_timeout_secs));
        let ceiling = self
            .request_timeout
            .saturating_sub(FEEDBACK_TIMEOUT_HEADROOM)
            .max(Duration::from_secs(1));
        requested.min(ceiling)
    }
}

/// The bridge plus the pieces needed to drive and shut it down.
struct BridgeRuntime {
    relay: Arc<FeedbackRelay>,
    telegram: Option<Arc<TelegramChannel>>,
}

fn build_runtime(cfg: &FeedbackBridgeConfig) -> Result<BridgeRuntime> {
    if !cfg.telegram.enabled {
        tracing::info!("telegram disabled; feedback requests will report unavailable");
        return Ok(BridgeRuntime {
            relay: Arc::new(FeedbackRelay::disabled()),
            telegram: None,
        });
    }

    let mut telegram = TelegramChannel::new(&cfg.telegram.bot_token)?;
    if let Some(api_base) = cfg.telegram.api_base.as_deref() {
        telegram = telegram.with_api_base(api_base);
    }
    let telegram = Arc::new(telegram);
    let waiters = Arc::new(ReplyWaiters::default());
    let cursor_store = Arc::new(FileCursorStore::new(&cfg.runtime.data_dir()));
    let bridge = Bridge::new(
        cfg.bridge.clone(),
        ChatId::new(cfg.telegram.chat_id.trim()),
        telegram.clone(),
        waiters.clone(),
    )?
    .with_cursor_store(cursor_store);

    Ok(BridgeRuntime {
        relay: Arc::new(FeedbackRelay::new(Arc::new(bridge), waiters)),
        telegram: Some(telegram),
    })
}

/// Start the inbound side of the bridge. Returns the webhook router when
/// updates are pushed rather than polled.
async fn start_inbound(
    cfg: &FeedbackBridgeConfig,
    runtime: &BridgeRuntime,
    shutdown: CancellationToken,
) -> Result<(Option<JoinHandle<()>>, Option<Router>)> {
    let (Some(bridge), Some(telegram)) = (runtime.relay.bridge(), runtime.telegram.as_ref())
    else {
        return Ok((None, None));
    };

    match cfg.telegram.mode {
        TelegramMode::Poll => {
            // getUpdates is refused while a webhook is registered.
            if let Err(error) = telegram.delete_webhook().await {
                tracing::warn!(%error, "failed to clear telegram webhook before polling");
            }
            let handle = bridge.clone().start_polling(shutdown);
            Ok((Some(handle), None))
        }
        TelegramMode::Webhook => {
            let url = cfg
                .telegram
                .webhook_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("telegram.webhook_url is required in webhook mode"))?;
            telegram
                .set_webhook(url, cfg.telegram.webhook_secret.as_deref())
                .await?;
            tracing::info!(%url, "telegram webhook registered");

            let (tx, rx) = mpsc::channel(WEBHOOK_QUEUE_CAPACITY);
            let handle = bridge.clone().start_webhook(rx, shutdown);
            let router = webhook_router(cfg.telegram.webhook_secret.clone(), tx);
            Ok((Some(handle), Some(router)))
        }
    }
}

pub fn app_router(state: Arc<AppState>, webhook: Option<Router>) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let mut app = routes::router().layer(Extension(state.clone()));
    if let Some(webhook) = webhook {
        app = app.merge(webhook);
    }
    app.layer(GlobalConcurrencyLimitLayer::new(state.max_in_flight.max(1)))
    .layer(TimeoutLayer::with_status_code(
        StatusCode::REQUEST_TIMEOUT,
        state.request_timeout,
    ))
    .layer(trace_layer)
    .layer(PropagateRequestIdLayer::x_request_id())
    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = FeedbackBridgeConfig::load(config_path).await?;
    let addr: SocketAddr = format!("{}:{}", cfg.server.bind, cfg.server.port)
        .parse()
        .map_err(|e| {
            anyhow::anyhow!(
                "invalid server address {}:{}: {e}",
                cfg.server.bind,
                cfg.server.port
            )
        })?;
    tracing::info!(
        bind_addr = %addr,
        telegram_enabled = cfg.telegram.enabled,
        telegram_mode = ?cfg.telegram.mode,
        max_message_length = cfg.bridge.max_message_length,
        rate_limit_max_requests = cfg.bridge.rate_limit.max_requests,
        rate_limit_window_secs = cfg.bridge.rate_limit.window_secs,
        data_dir = %cfg.runtime.data_dir().display(),
        "server configuration loaded"
    );

    let listener = preflight_bind_listener(addr).await?;
    let runtime = build_runtime(&cfg)?;
    let shutdown = CancellationToken::new();
    let (inbound_handle, webhook) = start_inbound(&cfg, &runtime, shutdown.child_token()).await?;

    let state = Arc::new(AppState {
        relay: runtime.relay.clone(),
        started_at: Instant::now(),
        default_feedback_timeout_secs: cfg.server.default_feedback_timeout_secs,
        request_timeout: Duration::from_secs(cfg.server.request_timeout_secs),
        max_in_flight: cfg.server.max_in_flight,
    });
    let app = app_router(state, webhook);

    tracing::info!(%addr, "feedback-bridge serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    if let Some(handle) = inbound_handle {
        match handle.await {
            Ok(()) => tracing::info!("bridge inbound loop shutdown completed"),
            Err(e) => tracing::error!(error = %e, "bridge inbound task join failed during shutdown"),
        }
    }
    if cfg.telegram.mode == TelegramMode::Webhook {
        if let Some(telegram) = runtime.telegram.as_ref() {
            if let Err(error) = telegram.delete_webhook().await {
                tracing::warn!(%error, "failed to remove telegram webhook on shutdown");
            }
        }
    }
    Ok(())
}

/// Ask a single question over the bridge and print the outcome as JSON.
pub async fn ask(config_path: Option<PathBuf>, summary: &str, timeout: Duration) -> Result<()> {
    let cfg = FeedbackBridgeConfig::load(config_path).await?;
    if cfg.telegram.enabled && cfg.telegram.mode == TelegramMode::Webhook {
        return Err(anyhow::anyhow!(
            "ask polls for the reply; it cannot run while telegram.mode = \"webhook\""
        ));
    }
    let runtime = build_runtime(&cfg)?;
    let shutdown = CancellationToken::new();
    let (inbound_handle, _) = start_inbound(&cfg, &runtime, shutdown.clone()).await?;

    let outcome = runtime.relay.request_feedback(summary, timeout).await;
    shutdown.cancel();
    if let Some(handle) = inbound_handle {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "bridge poll task join failed");
        }
    }

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    match outcome {
        FeedbackOutcome::Unavailable { reason, .. } => Err(anyhow::anyhow!(reason)),
        FeedbackOutcome::Reply { .. }
        | FeedbackOutcome::TimedOut { .. }
        | FeedbackOutcome::Expired { .. } => Ok(()),
    }
}

/// Deliver one message to the configured chat without waiting for a reply.
pub async fn send_one_shot(config_path: Option<PathBuf>, text: &str) -> Result<()> {
    let cfg = FeedbackBridgeConfig::load(config_path).await?;
    let runtime = build_runtime(&cfg)?;
    let report = runtime.relay.notify(text).await?;
    tracing::info!(
        session_id = %report.session_id,
        chunks = report.total_chunks,
        "message sent"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = FeedbackBridgeConfig::load(config_path.clone()).await?;
    let path = config_path.unwrap_or_else(crate::config::default_config_path);
    tracing::info!(
        config_path = %path.display(),
        telegram_enabled = cfg.telegram.enabled,
        telegram_mode = ?cfg.telegram.mode,
        data_dir = %cfg.runtime.data_dir().display(),
        "config ok"
    );

    let runtime = build_runtime(&cfg)?;
    let Some(telegram) = runtime.telegram else {
        println!("config ok: {} (telegram disabled)", path.display());
        return Ok(());
    };
    let identity = telegram
        .identity()
        .await
        .map_err(|e| anyhow::anyhow!("telegram getMe failed: {e}"))?;
    tracing::info!(
        bot_id = identity.id,
        bot_username = ?identity.username,
        channel = telegram.channel_id(),
        "telegram credentials ok"
    );
    println!(
        "config ok: {}\ntelegram bot: {} (id {})",
        path.display(),
        identity.username.as_deref().unwrap_or("<no username>"),
        identity.id
    );
    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::{BridgeRuntime, build_runtime};
    use crate::config::FeedbackBridgeConfig;

    fn runtime_for(cfg: &FeedbackBridgeConfig) -> BridgeRuntime {
        build_runtime(cfg).expect("runtime")
    }

    #[tokio::test]
    async fn disabled_telegram_builds_disabled_relay() {
        let runtime = runtime_for(&FeedbackBridgeConfig::default());
        assert!(runtime.relay.bridge().is_none());
        assert!(runtime.telegram.is_none());
    }

    #[tokio::test]
    async fn enabled_telegram_builds_bridge_for_chat() {
        let mut cfg = FeedbackBridgeConfig::default();
        cfg.telegram.enabled = true;
        cfg.telegram.bot_token = "123:abc".to_string();
        cfg.telegram.chat_id = " -1001 ".to_string();

        let runtime = runtime_for(&cfg);
        let bridge = runtime.relay.bridge().expect("bridge");
        assert_eq!(bridge.chat_id().as_str(), "-1001");
        assert_eq!(bridge.status().channel, "telegram");
        assert!(runtime.telegram.is_some());
    }
}
