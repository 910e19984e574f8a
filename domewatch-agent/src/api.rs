/**
 * API HTTP DOMEWATCH - Surface de consultation du watchdog
 *
 * RÔLE :
 * Exposer l'état courant du moniteur, les métriques de latence et
 * l'historique des redémarrages pour un dashboard ou un script.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, activé par `[api] enabled`
 * - Lecture seule, sauf POST /restart qui lève le flag de déclenchement manuel
 *   (même effet que `domewatch-trigger`)
 * - Header x-api-key exigé sur toutes les routes sauf /health quand
 *   `api_key` est configurée
 */

use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::WatchdogContext;
use crate::history::RestartHistoryEntry;
use crate::metrics::{LatencyDataPoint, LatencyStats};
use crate::monitor::HealthStatus;
use crate::signals::NamedFlag;
use crate::switch_cache::CachedSwitchState;

const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub ctx: WatchdogContext,
    pub status: watch::Receiver<HealthStatus>,
    pub manual_trigger: NamedFlag,
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(ctx: WatchdogContext, status: watch::Receiver<HealthStatus>) -> Self {
        let signals = &ctx.config.signals;
        Self {
            manual_trigger: NamedFlag::at(&signals.dir, &signals.manual_trigger),
            api_key: ctx.config.api.api_key.clone().filter(|k| !k.is_empty()),
            status,
            ctx,
        }
    }
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    // /health toujours accessible
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }
    let Some(expected) = app.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!("🔒 rejected {} {}: bad or missing x-api-key", req.method(), req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(serde_json::json!({ "status": "ok" })) }))
        .route("/status", get(get_status))
        .route("/metrics/latency", get(get_latency))
        .route("/history", get(get_history))
        .route("/switches", get(get_switches))
        .route("/restart", post(post_restart))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

// GET /status
async fn get_status(State(app): State<AppState>) -> Json<HealthStatus> {
    Json(app.status.borrow().clone())
}

#[derive(Debug, Serialize)]
struct LatencyView {
    stats: LatencyStats,
    success_rate: f64,
    points: Vec<LatencyDataPoint>,
}

// GET /metrics/latency
async fn get_latency(State(app): State<AppState>) -> Json<LatencyView> {
    let metrics = &app.ctx.metrics;
    Json(LatencyView {
        stats: metrics.stats(),
        success_rate: metrics.success_rate(),
        points: metrics.history(),
    })
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct HistoryView {
    total: usize,
    succeeded: usize,
    success_rate: f64,
    entries: Vec<RestartHistoryEntry>,
}

// GET /history?limit=n (plus récentes d'abord)
async fn get_history(State(app): State<AppState>, Query(params): Query<HistoryParams>) -> Json<HistoryView> {
    let history = &app.ctx.history;
    Json(HistoryView {
        total: history.total_count(),
        succeeded: history.success_count(),
        success_rate: history.success_rate(),
        entries: history.recent(params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT)),
    })
}

// GET /switches
async fn get_switches(State(app): State<AppState>) -> Json<Vec<CachedSwitchState>> {
    Json(app.ctx.switch_cache.current_snapshot())
}

// POST /restart
async fn post_restart(State(app): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    match app.manual_trigger.set() {
        Ok(()) => {
            info!("🔘 manual restart requested over HTTP");
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "ok": true, "msg": "manual trigger set" })),
            )
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "ok": false, "msg": e.to_string() })),
        ),
    }
}

/// Serve until `cancel` fires.
pub async fn serve(app_state: AppState, cancel: CancellationToken) -> anyhow::Result<()> {
    let listen = app_state.ctx.config.api.listen.clone();
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!("🌐 status API on http://{}", listen);
    axum::serve(listener, build_router(app_state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchdogConfig;
    use crate::monitor::HealthMonitor;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(dir: &TempDir, api_key: Option<&str>) -> (AppState, WatchdogContext) {
        let mut config = WatchdogConfig::default();
        config.signals.dir = dir.path().join("signals");
        config.storage.data_dir = dir.path().join("data");
        config.api.api_key = api_key.map(str::to_string);
        let ctx = WatchdogContext::new(config).unwrap();
        let monitor = HealthMonitor::new(ctx.clone(), None).unwrap();
        (AppState::new(ctx.clone(), monitor.subscribe()), ctx)
    }

    fn get(uri: &str) -> Request {
        HttpRequest::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_open_even_with_a_key() {
        let dir = TempDir::new().unwrap();
        let (state, _ctx) = app(&dir, Some("secret"));
        let response = build_router(state).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_key_required_when_configured() {
        let dir = TempDir::new().unwrap();
        let (state, _ctx) = app(&dir, Some("secret"));
        let router = build_router(state);

        let denied = router.clone().oneshot(get("/status")).await.unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let request = HttpRequest::builder()
            .uri("/status")
            .header("x-api-key", "secret")
            .body(Body::empty())
            .unwrap();
        let allowed = router.oneshot(request).await.unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
        assert_eq!(body_json(allowed).await["consecutive_failures"], 0);
    }

    #[tokio::test]
    async fn test_history_limit_and_totals() {
        let dir = TempDir::new().unwrap();
        let (state, ctx) = app(&dir, None);
        for i in 0..3 {
            ctx.history.begin_attempt(Some(&format!("run {i}")));
            ctx.history.end_attempt(i != 1, None);
        }

        let response = build_router(state).oneshot(get("/history?limit=2")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["total"], 3);
        assert_eq!(body["succeeded"], 2);
        assert_eq!(body["entries"].as_array().unwrap().len(), 2);
        assert_eq!(body["entries"][0]["triggerReason"], "run 2");
    }

    #[tokio::test]
    async fn test_restart_sets_manual_trigger() {
        let dir = TempDir::new().unwrap();
        let (state, _ctx) = app(&dir, None);
        let flag = state.manual_trigger.clone();
        assert!(!flag.is_set());

        let request = HttpRequest::builder().method("POST").uri("/restart").body(Body::empty()).unwrap();
        let response = build_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(flag.is_set());
    }

    #[tokio::test]
    async fn test_latency_view() {
        let dir = TempDir::new().unwrap();
        let (state, ctx) = app(&dir, None);
        ctx.metrics.record(Some(10), true);
        ctx.metrics.record(None, false);

        let body = body_json(build_router(state).oneshot(get("/metrics/latency")).await.unwrap()).await;
        assert_eq!(body["points"].as_array().unwrap().len(), 2);
        assert_eq!(body["success_rate"], 0.5);
    }
}
