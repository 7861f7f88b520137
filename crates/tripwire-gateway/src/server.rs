use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

use tripwire_core::config::GatewayConfig;
use tripwire_engine::Engine;

use crate::routes;
use crate::state::AppState;

/// HTTP gateway over the engine's authoring, ingestion, approval and run APIs.
pub struct GatewayServer {
    config: GatewayConfig,
    engine: Arc<Engine>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, engine: Arc<Engine>) -> Self {
        Self { config, engine }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            engine: self.engine.clone(),
        });
        let app = router(state);

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}

/// Build the API router.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        .route("/api/health", get(routes::health))
        // Flows
        .route("/api/flows", get(routes::list_flows).post(routes::submit_flow))
        .route("/api/flows/authoring", post(routes::submit_authoring))
        .route("/api/flows/{id}", get(routes::get_flow))
        .route("/api/flows/{id}/retire", post(routes::retire_flow))
        .route("/api/flows/{id}/runs", get(routes::list_runs))
        .route(
            "/api/flows/{id}/triggers/{trigger}/fire",
            post(routes::fire_trigger),
        )
        // Ingestion
        .route("/api/metrics/{source}", post(routes::push_metrics))
        .route("/api/events/{source}", post(routes::emit_event))
        // Approvals
        .route("/api/approvals", get(routes::list_approvals))
        .route("/api/approvals/{run_id}/approve", post(routes::approve))
        .route("/api/approvals/{run_id}/reject", post(routes::reject))
        // Runs
        .route("/api/runs/{id}", get(routes::get_run))
        .route("/api/runs/{id}/cancel", post(routes::cancel_run))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(config: &GatewayConfig) -> CorsLayer {
    if config.cors_origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use tripwire_core::config::AppConfig;
    use tripwire_core::event::EventBus;
    use tripwire_engine::{ExecutorRegistry, SqliteRunStore};

    fn app() -> Router {
        let config = AppConfig::default();
        let store = Arc::new(SqliteRunStore::in_memory().unwrap());
        let engine = Engine::new(
            &config,
            store,
            ExecutorRegistry::with_builtins(&config),
            Arc::new(EventBus::default()),
        );
        router(Arc::new(AppState {
            config: GatewayConfig::default(),
            engine,
        }))
    }

    fn notify_flow() -> serde_json::Value {
        serde_json::json!({
            "id": "notify",
            "name": "Notify on deploy",
            "status": "active",
            "nodes": [
                {"id": "deploy", "kind": "trigger", "trigger": {"type": "event", "source": "deploy"}},
                {"id": "page", "kind": "action", "action": "notification", "channel": "ops", "message": "deployed"},
                {"id": "done", "kind": "outcome", "outcome": "success"}
            ],
            "edges": [
                {"from": "deploy", "to": "page"},
                {"from": "page", "to": "done"}
            ]
        })
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn health_is_open() {
        let (status, body) = call(&app(), "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn submit_list_and_retire_flow() {
        let app = app();
        let (status, body) = call(&app, "POST", "/api/flows", Some(notify_flow())).await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        assert_eq!(body["active_version"], 1);

        let (_, body) = call(&app, "GET", "/api/flows", None).await;
        assert_eq!(body["flows"].as_array().unwrap().len(), 1);

        let (status, body) = call(&app, "GET", "/api/flows/notify", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["nodes"].as_array().unwrap().len(), 3);

        let (status, body) = call(&app, "POST", "/api/flows/notify/retire", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["retired_version"], 1);

        let (status, _) = call(&app, "POST", "/api/flows/notify/retire", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn invalid_flow_lists_violations() {
        let mut flow = notify_flow();
        flow["nodes"].as_array_mut().unwrap().remove(0);
        flow["edges"] = serde_json::json!([{"from": "page", "to": "done"}]);

        let (status, body) = call(&app(), "POST", "/api/flows", Some(flow)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(!body["violations"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn event_fires_and_run_is_queryable() {
        let app = app();
        call(&app, "POST", "/api/flows", Some(notify_flow())).await;

        let (status, body) = call(&app, "POST", "/api/events/deploy", None).await;
        assert_eq!(status, StatusCode::OK);
        let results = body["results"].as_array().unwrap();
        assert_eq!(results[0]["result"], "started");
        let run_id = results[0]["run_id"].as_str().unwrap().to_string();

        let (status, body) = call(&app, "GET", &format!("/api/runs/{}", run_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["flow_id"], "notify");
    }

    #[tokio::test]
    async fn unknown_resources_are_not_found() {
        let app = app();
        let (status, _) = call(&app, "GET", "/api/runs/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "POST", "/api/flows/nope/triggers/manual/fire", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "POST", "/api/approvals/nope/approve", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn metric_batches_are_accepted() {
        let app = app();
        let samples = serde_json::json!([
            {"timestamp": "2026-03-01T10:00:00Z", "latency_ms": 20.0},
            {"timestamp": "2026-03-01T10:00:05Z", "latency_ms": 25.0}
        ]);
        let (status, body) = call(&app, "POST", "/api/metrics/probe-eu", Some(samples)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], 2);
        assert!(body["results"].as_array().unwrap().is_empty());
    }
}
