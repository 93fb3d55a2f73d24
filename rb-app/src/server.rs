//! Process wiring for `relaybot serve`, plus the `doctor` and `status` checks.

use crate::commands::CommandHandler;
use crate::config::{RelayConfig, default_config_path};
use crate::config_control::ConfigControl;
use crate::dispatcher::{Dispatcher, StatusSnapshot};
use crate::synthesis;
use anyhow::Result;
use axum::Extension;
use axum::Json;
use axum::http::Request;
use axum::response::Response;
use axum::routing::get;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rb_channels::{ChatTransport, TelegramTransport};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::trace::TraceLayer;

const INBOUND_QUEUE_CAPACITY: usize = 1024;

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let path = config_path.unwrap_or_else(default_config_path);
    let cfg = RelayConfig::load(Some(path.clone())).await?;
    cfg.validate_for_serve()?;
    tracing::info!(
        config_path = %path.display(),
        routes = cfg.routes.len(),
        operator_configured = cfg.telegram.operator_id.is_some(),
        reply_enabled = cfg.reply.enabled,
        reply_chats = cfg.reply.chats.len(),
        model = %cfg.llm.model,
        base_url = %cfg.llm.base_url,
        api_key_configured = cfg.llm.api_key().is_some(),
        status_enabled = cfg.status.enabled,
        "config ok"
    );
    if cfg.telegram.operator_id.is_none() {
        tracing::warn!("telegram.operator_id is not set; operator commands are disabled");
    }
    if cfg.reply.enabled && cfg.llm.api_key().is_none() {
        tracing::warn!("reply.enabled is on but no llm api key is configured");
    }
    Ok(())
}

pub async fn status(config_path: Option<PathBuf>) -> Result<()> {
    let path = config_path.unwrap_or_else(default_config_path);
    let cfg = RelayConfig::load(Some(path.clone())).await?;
    println!("config: {}", path.display());
    println!("routes: {}", cfg.routes.len());
    for route in &cfg.routes {
        println!("  {} -> {}", route.source_chat, route.target);
    }
    let reply = &cfg.reply;
    println!(
        "ai replies: {} (chats={} probability={}% cooldown={}s min_length={} context={})",
        if reply.enabled { "on" } else { "off" },
        reply.chats.len(),
        reply.probability,
        reply.cooldown_secs,
        reply.min_length,
        reply.context_window
    );
    println!(
        "generator: {} via {} (api key {})",
        cfg.llm.model,
        cfg.llm.base_url,
        if cfg.llm.api_key().is_some() {
            "set"
        } else {
            "missing"
        }
    );
    tracing::info!(config_path = %path.display(), "status ok");
    Ok(())
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let path = config_path.unwrap_or_else(default_config_path);
    let cfg = RelayConfig::load(Some(path.clone())).await?;
    cfg.validate_for_serve()?;
    let file_cfg = RelayConfig::load_file(&path).await?;
    tracing::info!(config_path = %path.display(), "config loaded");

    let transport: Arc<dyn ChatTransport> =
        Arc::new(TelegramTransport::new(&cfg.telegram.bot_token)?);
    let me = transport
        .me()
        .await
        .map_err(|e| anyhow::anyhow!("telegram getMe failed: {e}"))?;
    tracing::info!(account = ?me.handle(), account_id = %me.id, "signed in");
    if cfg.telegram.operator_id.is_none() {
        tracing::warn!("telegram.operator_id is not set; operator commands are disabled");
    }

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&transport),
        me,
        cfg.telegram.operator_id,
        cfg.reply.clone(),
        StdRng::from_entropy(),
    ));
    match synthesis::generator_from_config(&cfg.llm) {
        Ok(Some(generator)) => dispatcher.set_generator(Some(generator)),
        Ok(None) => tracing::warn!("no llm api key configured; AI replies are skipped"),
        Err(error) => tracing::warn!(%error, "text generator unavailable; AI replies are skipped"),
    }

    let report = dispatcher.rebuild_routes(&cfg.routes).await;
    tracing::info!(
        resolved = report.resolved,
        failed = report.failed.len(),
        "route table built"
    );

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    transport.start(inbound_tx).await?;

    let commands = CommandHandler::new(Arc::clone(&dispatcher), ConfigControl::new(path, file_cfg)?);
    let shutdown = CancellationToken::new();

    let status_handle = if cfg.status.enabled {
        let addr: SocketAddr = cfg
            .status
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid status.bind {:?}: {e}", cfg.status.bind))?;
        let listener = preflight_bind_listener(addr).await?;
        let app = status_router(Arc::clone(&dispatcher));
        let token = shutdown.child_token();
        tracing::info!(%addr, "status endpoint serving");
        Some(tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "status endpoint failed");
            }
        }))
    } else {
        None
    };

    let dispatch_handle = tokio::spawn(Arc::clone(&dispatcher).run_loop(
        inbound_rx,
        commands,
        shutdown.child_token(),
    ));
    tracing::info!("relaybot running");

    shutdown_signal(shutdown.clone()).await;

    match dispatch_handle.await {
        Ok(()) => tracing::info!("dispatcher shutdown completed"),
        Err(e) => tracing::error!(error = %e, "dispatcher task join failed during shutdown"),
    }
    if let Some(handle) = status_handle {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "status endpoint join failed during shutdown");
        }
    }
    Ok(())
}

/// `GET /api/v1/status`: the dispatcher's status snapshot as JSON.
pub fn status_router(dispatcher: Arc<Dispatcher>) -> axum::Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
            )
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

    axum::Router::new()
        .route("/api/v1/status", get(get_status))
        .layer(Extension(dispatcher))
        .layer(trace_layer)
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_status(Extension(dispatcher): Extension<Arc<Dispatcher>>) -> Json<StatusSnapshot> {
    Json(dispatcher.status().await)
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
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
    use super::*;
    use crate::config::ReplyPolicy;
    use crate::testing::{RecordingTransport, self_identity};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
        let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.expect("write request");
        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .await
            .expect("read response");
        response
    }

    #[tokio::test]
    async fn status_endpoint_serves_snapshot_json() {
        let transport = RecordingTransport::new();
        let dispatcher = Arc::new(Dispatcher::new(
            transport as Arc<dyn ChatTransport>,
            self_identity(),
            None,
            ReplyPolicy::default(),
            StdRng::seed_from_u64(3),
        ));
        dispatcher.pause();

        let listener = preflight_bind_listener("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let token = CancellationToken::new();
        let child = token.child_token();
        let app = status_router(Arc::clone(&dispatcher));
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { child.cancelled().await })
                .await
        });

        let ok = http_get(addr, "/api/v1/status").await;
        assert!(ok.starts_with("HTTP/1.1 200"), "{ok}");
        let body = ok.split("\r\n\r\n").nth(1).expect("body");
        let json: serde_json::Value = serde_json::from_str(body.trim()).expect("json body");
        assert_eq!(json["paused"], true);
        assert_eq!(json["route_count"], 0);
        assert_eq!(json["reply"]["probability"], 30);
        assert_eq!(json["account"], "@relay_me");

        let missing = http_get(addr, "/api/v1/nope").await;
        assert!(missing.starts_with("HTTP/1.1 404"), "{missing}");

        token.cancel();
        server.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn doctor_rejects_missing_token() {
        let path = std::env::temp_dir().join(format!("relaybot-doctor-{}.toml", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, "[reply]\nprobability = 40\n")
            .await
            .expect("write config");
        let result = doctor(Some(path.clone())).await;
        if std::env::var("TELEGRAM_BOT_TOKEN").is_err() {
            assert!(result.is_err());
        }
        status(Some(path.clone())).await.expect("status reads config");
        let _ = std::fs::remove_file(path);
    }
}
