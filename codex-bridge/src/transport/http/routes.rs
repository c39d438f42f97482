//! HTTP route handlers.
//!
//! Every `/api/*` endpoint forwards its typed body as the params of the
//! app-server method with the same name. Errors map to status codes here, not
//! in the core: app-server errors are 400, local timeouts 504, the rest 500.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde::Serialize;
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};

use super::models::{
    SkillsConfigWriteParams, SkillsListParams, ThreadForkParams, ThreadReadParams,
    ThreadResumeParams, ThreadStartParams, TurnStartParams,
};
use crate::error::BridgeError;
use crate::health::{Health, SetupResult};
use crate::service::{BridgeService, HealthSnapshot};
use crate::tracker::OperationSpec;
use crate::version::VersionInfo;

const ENDPOINTS: &[(&str, &str)] = &[
    ("thread/start", "POST /api/thread/start"),
    ("thread/resume", "POST /api/thread/resume"),
    ("thread/fork", "POST /api/thread/fork"),
    ("thread/read", "POST /api/thread/read"),
    ("turn/start", "POST /api/turn/start"),
    ("skills/list", "POST /api/skills/list"),
    ("skills/config/write", "POST /api/skills/config/write"),
];

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    /// "healthy" or "unhealthy"
    pub status: &'static str,
    pub codex_alive: bool,
    pub state: Health,
    pub initialized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub pending_calls: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup: Option<SetupResult>,
    pub version: VersionInfo,
}

impl HealthCheckResponse {
    pub fn from_snapshot(snapshot: HealthSnapshot) -> Self {
        let status = if snapshot.is_healthy() {
            "healthy"
        } else {
            "unhealthy"
        };
        Self {
            status,
            codex_alive: snapshot.codex_alive,
            state: snapshot.state,
            initialized: snapshot.initialized,
            pid: snapshot.pid,
            pending_calls: snapshot.pending_calls,
            started_at: snapshot.started_at,
            setup: snapshot.setup_result,
            version: snapshot.version,
        }
    }
}

/// The tracked `turn/start` operation: items arrive as `item/completed`.
fn turn_operation() -> OperationSpec {
    OperationSpec::new("turn/start", "turn/completed").with_interim("item/completed")
}

fn respond(method: &str, result: Result<Value, BridgeError>) -> (StatusCode, Json<Value>) {
    match result {
        Ok(value) => (StatusCode::OK, Json(value)),
        Err(BridgeError::Rpc(e)) => {
            tracing::error!(method, code = e.code, error = %e.message, "app-server returned error");
            (StatusCode::BAD_REQUEST, Json(json!({ "detail": e })))
        }
        Err(e) if e.is_timeout() => {
            tracing::error!(method, error = %e, "app-server timed out");
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({ "detail": e.to_string() })),
            )
        }
        Err(e) => {
            tracing::error!(method, error = %e, "Bridge call failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": e.to_string() })),
            )
        }
    }
}

fn to_params<P: Serialize>(params: &P) -> Result<Value, (StatusCode, Json<Value>)> {
    serde_json::to_value(params).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": format!("Failed to encode params: {}", e) })),
        )
    })
}

async fn forward<P: Serialize>(
    service: &BridgeService,
    method: &str,
    params: &P,
) -> (StatusCode, Json<Value>) {
    let params = match to_params(params) {
        Ok(params) => params,
        Err(response) => return response,
    };
    respond(method, service.call(method, params).await)
}

async fn root(State(service): State<Arc<BridgeService>>) -> Json<Value> {
    let endpoints: serde_json::Map<String, Value> = ENDPOINTS
        .iter()
        .map(|(method, route)| (method.to_string(), Value::from(*route)))
        .collect();
    let version = service.version().await;
    let mut body = json!({
        "name": "Codex Bridge Server",
        "version": version.bridge,
        "endpoints": endpoints,
    });
    if let Some(codex) = version.codex {
        body["codex_version"] = Value::from(codex);
    }
    Json(body)
}

async fn health_check(State(service): State<Arc<BridgeService>>) -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse::from_snapshot(service.health().await))
}

async fn thread_start(
    State(service): State<Arc<BridgeService>>,
    Json(params): Json<ThreadStartParams>,
) -> (StatusCode, Json<Value>) {
    forward(&service, "thread/start", &params).await
}

async fn thread_resume(
    State(service): State<Arc<BridgeService>>,
    Json(params): Json<ThreadResumeParams>,
) -> (StatusCode, Json<Value>) {
    forward(&service, "thread/resume", &params).await
}

async fn thread_fork(
    State(service): State<Arc<BridgeService>>,
    Json(params): Json<ThreadForkParams>,
) -> (StatusCode, Json<Value>) {
    forward(&service, "thread/fork", &params).await
}

async fn thread_read(
    State(service): State<Arc<BridgeService>>,
    Json(params): Json<ThreadReadParams>,
) -> (StatusCode, Json<Value>) {
    forward(&service, "thread/read", &params).await
}

/// Waits for `turn/completed`, not just the immediate reply.
async fn turn_start(
    State(service): State<Arc<BridgeService>>,
    Json(params): Json<TurnStartParams>,
) -> (StatusCode, Json<Value>) {
    let params = match to_params(&params) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let result = service.start_and_await(&turn_operation(), params).await;
    respond("turn/start", result)
}

async fn skills_list(
    State(service): State<Arc<BridgeService>>,
    Json(params): Json<SkillsListParams>,
) -> (StatusCode, Json<Value>) {
    forward(&service, "skills/list", &params).await
}

async fn skills_config_write(
    State(service): State<Arc<BridgeService>>,
    Json(params): Json<SkillsConfigWriteParams>,
) -> (StatusCode, Json<Value>) {
    forward(&service, "skills/config/write", &params).await
}

pub fn routes(service: Arc<BridgeService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/api/thread/start", post(thread_start))
        .route("/api/thread/resume", post(thread_resume))
        .route("/api/thread/fork", post(thread_fork))
        .route("/api/thread/read", post(thread_read))
        .route("/api/turn/start", post(turn_start))
        .route("/api/skills/list", post(skills_list))
        .route("/api/skills/config/write", post(skills_config_write))
        .layer(cors)
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::RpcError;
    use crate::supervisor::SupervisorConfig;
    use crate::test_support::{FakeAppServer, fake_app_server};
    use crate::version::BRIDGE_VERSION;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn idle_service() -> Arc<BridgeService> {
        Arc::new(
            BridgeService::new(SupervisorConfig::default(), Duration::from_secs(300))
                .with_health_check_interval(None),
        )
    }

    async fn connected_service(request_timeout: Duration) -> (Arc<BridgeService>, FakeAppServer) {
        let service = Arc::new(
            BridgeService::new(SupervisorConfig::default(), request_timeout)
                .with_health_check_interval(None),
        );
        let (transport, fake) = fake_app_server();
        service.start_with_transport(transport).await;
        (service, fake)
    }

    fn spawn_request(
        service: &Arc<BridgeService>,
        request: Request<Body>,
    ) -> tokio::task::JoinHandle<axum::response::Response> {
        let app = routes(Arc::clone(service));
        tokio::spawn(async move { app.oneshot(request).await.unwrap() })
    }

    #[tokio::test]
    async fn root_lists_endpoints() {
        let app = routes(idle_service());
        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["name"], "Codex Bridge Server");
        assert_eq!(json["version"], BRIDGE_VERSION);
        assert_eq!(json["endpoints"]["turn/start"], "POST /api/turn/start");
        assert_eq!(json["endpoints"].as_object().unwrap().len(), ENDPOINTS.len());
        assert!(json.get("codex_version").is_none());
    }

    #[tokio::test]
    async fn health_unhealthy_before_start() {
        let app = routes(idle_service());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["codex_alive"], false);
        assert_eq!(json["state"], "UNKNOWN");
        assert!(json["version"]["bridge"].is_string());
        assert!(json.get("pid").is_none());
    }

    #[tokio::test]
    async fn thread_start_forwards_params_and_result() {
        let (service, mut fake) = connected_service(Duration::from_secs(300)).await;
        let response = spawn_request(
            &service,
            post_json("/api/thread/start", json!({"model": "gpt-5", "cwd": "/work"})),
        );

        let req = fake.recv_request().await;
        assert_eq!(req.method, "thread/start");
        assert_eq!(req.params, json!({"model": "gpt-5", "cwd": "/work"}));
        fake.reply(req.id, json!({"thread": {"id": "t1", "preview": ""}}))
            .await;

        let response = response.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response_json(response).await,
            json!({"thread": {"id": "t1", "preview": ""}})
        );
    }

    #[tokio::test]
    async fn rpc_error_maps_to_400_with_structured_detail() {
        let (service, mut fake) = connected_service(Duration::from_secs(300)).await;
        let response = spawn_request(
            &service,
            post_json("/api/thread/resume", json!({"threadId": "missing"})),
        );

        let req = fake.recv_request().await;
        assert_eq!(req.params, json!({"threadId": "missing"}));
        fake.reply_error(
            req.id,
            RpcError {
                code: -32600,
                message: "thread not found".to_string(),
                data: None,
            },
        )
        .await;

        let response = response.await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response_json(response).await,
            json!({"detail": {"code": -32600, "message": "thread not found"}})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_maps_to_504() {
        let (service, mut fake) = connected_service(Duration::from_secs(2)).await;
        let response = spawn_request(
            &service,
            post_json("/api/skills/list", json!({"cwds": ["/work"]})),
        );

        let req = fake.recv_request().await;
        assert_eq!(req.params, json!({"cwds": ["/work"], "forceReload": false}));

        let response = response.await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let json = response_json(response).await;
        assert!(json["detail"].as_str().unwrap().contains("skills/list"));
    }

    #[tokio::test]
    async fn not_running_maps_to_500() {
        let app = routes(idle_service());
        let response = app
            .oneshot(post_json("/api/thread/fork", json!({"threadId": "t1"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response_json(response).await,
            json!({"detail": "app-server process is not running"})
        );
    }

    #[tokio::test]
    async fn invalid_body_is_rejected_before_forwarding() {
        let app = routes(idle_service());
        let response = app
            .oneshot(post_json("/api/skills/config/write", json!({"path": "/s"})))
            .await
            .unwrap();
        assert!(response.status().is_client_error());

        let app = routes(idle_service());
        let response = app
            .oneshot(
                Request::post("/api/thread/read")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn turn_start_waits_for_completion() {
        let (service, mut fake) = connected_service(Duration::from_secs(300)).await;
        let response = spawn_request(
            &service,
            post_json(
                "/api/turn/start",
                json!({"threadId": "t1", "input": [{"type": "text", "text": "hi"}]}),
            ),
        );

        let req = fake.recv_request().await;
        assert_eq!(req.method, "turn/start");
        assert_eq!(
            req.params,
            json!({"threadId": "t1", "input": [{"type": "text", "text": "hi"}]})
        );
        fake.reply(req.id, json!({"turn": {"id": "turn1", "status": "inProgress"}}))
            .await;
        fake.notify("item/completed", json!({"item": {"type": "agentMessage", "text": "hello"}}))
            .await;
        fake.notify(
            "turn/completed",
            json!({"turn": {"id": "turn1", "status": "completed", "items": []}}),
        )
        .await;

        let response = response.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response_json(response).await,
            json!({"turn": {
                "id": "turn1",
                "status": "completed",
                "items": [{"type": "agentMessage", "text": "hello"}],
            }})
        );
    }

    #[tokio::test]
    async fn cors_allows_any_origin() {
        let app = routes(idle_service());
        let response = app
            .oneshot(
                Request::get("/health")
                    .header("origin", "http://example.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "*"
        );
    }
}
