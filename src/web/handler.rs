use crate::config::Config;
use crate::error::AppError;
use crate::events::{ChannelSink, StreamEvent};
use crate::tools::{
    deliberation_tool::{DeliberationManager, RunBatchParams},
    filestore_tool::{ArtifactStore, Category, FileStore, UploadBatchParams},
    process_tool::{ProcessRegistry, ProcessRunner},
    terminal_tool::{SendInputParams, SessionManager, StartSessionParams},
};
use crate::web::schemas::*;

use async_stream::stream;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};

const BATCH_EVENT_CAPACITY: usize = 256;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub struct AppManagers {
    pub config: Arc<Config>,
    pub file_store: Arc<FileStore>,
    pub process_runner: ProcessRunner,
    pub deliberation_manager: Arc<DeliberationManager>,
    pub session_manager: Arc<SessionManager>,
}

impl AppManagers {
    pub fn new(config: Arc<Config>) -> Result<Self, AppError> {
        let file_store = Arc::new(FileStore::new(config.clone())?);
        let store: Arc<dyn ArtifactStore> = file_store.clone();
        let process_runner = ProcessRunner::new(Arc::new(ProcessRegistry::new()), config.terminate_grace);
        let deliberation_manager = Arc::new(DeliberationManager::new(
            config.clone(),
            store.clone(),
            process_runner.clone(),
        ));
        let session_manager = Arc::new(SessionManager::new(config.clone(), store));

        Ok(Self {
            config,
            file_store,
            process_runner,
            deliberation_manager,
            session_manager,
        })
    }

    /// Stops every batch run and interactive session.
    pub async fn shutdown(&self) {
        let runs = self.process_runner.cancel_all().await;
        let sessions = self.session_manager.cleanup_all().await;
        info!(runs, sessions, "Stopped all running work");
    }
}

#[derive(Clone)]
pub struct AppState {
    managers: Arc<AppManagers>,
}

impl AppState {
    pub fn new(managers: Arc<AppManagers>) -> Self {
        Self { managers }
    }
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.managers.config.max_upload_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/upload", post(upload))
        .route("/artifacts/:category", get(list_artifacts))
        .route("/run", post(run_batch))
        .route("/stop", post(stop_all))
        .route("/sessions", post(start_session).get(list_sessions))
        .route("/sessions/:key", axum::routing::delete(delete_session))
        .route("/sessions/:key/events", get(session_events))
        .route("/sessions/:key/input", post(session_input))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn to_sse(event: &StreamEvent) -> SseEvent {
    let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default().data(payload)
}

fn keep_alive() -> KeepAlive {
    KeepAlive::new().interval(KEEP_ALIVE_INTERVAL).text("keepalive")
}

async fn health(State(state): State<AppState>) -> Json<HealthResult> {
    Json(HealthResult {
        status: "ok",
        active_runs: state.managers.process_runner.registry().active_count(),
        sessions: state.managers.session_manager.list_sessions().await.len(),
    })
}

#[instrument(skip(state, params))]
async fn upload(
    State(state): State<AppState>,
    Json(params): Json<UploadBatchParams>,
) -> Result<Json<crate::tools::filestore_tool::UploadBatchResult>, AppError> {
    let result = state.managers.file_store.replace_batch(&params).await?;
    Ok(Json(result))
}

async fn list_artifacts(
    State(state): State<AppState>,
    Path(category): Path<String>,
) -> Result<Json<ArtifactListResult>, AppError> {
    let category = Category::from_str(&category)?;
    let artifacts = state.managers.file_store.list_artifacts(category).await?;
    Ok(Json(ArtifactListResult { category, artifacts }))
}

#[instrument(skip(state, params), fields(mode = ?params.mode, total_rounds = params.total_rounds))]
async fn run_batch(
    State(state): State<AppState>,
    Json(params): Json<RunBatchParams>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (sink, mut rx) = ChannelSink::new(BATCH_EVENT_CAPACITY);
    let manager = state.managers.deliberation_manager.clone();
    tokio::spawn(async move {
        match manager.run_batch(&params, &sink).await {
            Ok(summary) => debug!(?summary, "Batch stream finished"),
            Err(e) => warn!(error = %e, "Batch ended with an error"),
        }
    });

    let event_stream = stream! {
        while let Some(event) = rx.recv().await {
            yield Ok(to_sse(&event));
        }
    };
    Sse::new(event_stream).keep_alive(keep_alive())
}

async fn stop_all(State(state): State<AppState>) -> Json<StopResult> {
    let stopped = state.managers.process_runner.cancel_all().await;
    Json(StopResult {
        success: true,
        stopped,
        message: format!("Stopped {} running process(es)", stopped),
    })
}

async fn start_session(
    State(state): State<AppState>,
    params: Option<Json<StartSessionParams>>,
) -> Result<Json<crate::tools::terminal_tool::StartSessionResult>, AppError> {
    let params = params
        .map(|Json(p)| p)
        .unwrap_or(StartSessionParams { session_key: None });
    let result = state.managers.session_manager.start_session(&params).await?;
    Ok(Json(result))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<crate::tools::terminal_tool::SessionInfo>> {
    Json(state.managers.session_manager.list_sessions().await)
}

async fn delete_session(State(state): State<AppState>, Path(key): Path<String>) -> Json<CleanupResult> {
    let removed = state.managers.session_manager.cleanup(&key).await;
    Json(CleanupResult { session_key: key, removed })
}

async fn session_input(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(params): Json<SendInputParams>,
) -> Result<Json<InputResult>, AppError> {
    state.managers.session_manager.send_input(&key, &params).await?;
    Ok(Json(InputResult {
        success: true,
        bytes: params.data.len(),
    }))
}

/// Cleans the session up once its event stream is dropped, whether it ended or the client went away.
struct DisconnectGuard {
    key: String,
    manager: Arc<SessionManager>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let key = std::mem::take(&mut self.key);
        let manager = self.manager.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if manager.cleanup(&key).await {
                        info!(session_key = %key, "Event stream closed; session cleaned up");
                    }
                });
            }
            Err(_) => warn!(session_key = %key, "No runtime available to clean up session"),
        }
    }
}

fn session_stream(
    mut rx: mpsc::Receiver<StreamEvent>,
    guard: DisconnectGuard,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    stream! {
        let _guard = guard;
        while let Some(event) = rx.recv().await {
            yield Ok(to_sse(&event));
        }
    }
}

async fn session_events(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, AppError> {
    let manager = state.managers.session_manager.clone();
    let rx = manager.take_events(&key).await?;
    let guard = DisconnectGuard { key, manager };
    Ok(Sse::new(session_stream(rx, guard)).keep_alive(keep_alive()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::config_for;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    fn router_for(dir: &std::path::Path, overrides: &[(&str, &str)]) -> (Router, Arc<AppManagers>) {
        let config = Arc::new(config_for(&dir.join("uploads"), overrides));
        let managers = Arc::new(AppManagers::new(config).unwrap());
        (build_router(AppState::new(managers.clone())), managers)
    }

    fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn sse_payloads(text: &str) -> Vec<Value> {
        text.lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .filter_map(|data| serde_json::from_str(data).ok())
            .collect()
    }

    #[tokio::test]
    async fn upload_then_list_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _) = router_for(dir.path(), &[]);

        let upload = json_request(
            Method::POST,
            "/upload",
            json!({ "files": [
                { "filename": "anna.txt", "category": "juror", "weight": 30, "content": "Anna" },
                { "filename": "theft.txt", "category": "case", "content": "Case" }
            ]}),
        );
        let response = router.clone().oneshot(upload).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let list = Request::builder().uri("/artifacts/jurors").body(Body::empty()).unwrap();
        let response = router.oneshot(list).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["category"], "juror");
        assert_eq!(body["artifacts"][0]["name"], "anna.txt");
        assert_eq!(body["artifacts"][0]["weight"], 30);
    }

    #[tokio::test]
    async fn unknown_category_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _) = router_for(dir.path(), &[]);
        let request = Request::builder().uri("/artifacts/witnesses").body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn run_streams_batch_events() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("verdict.sh"), "echo \"verdict for $1\"\n").unwrap();
        let workdir = dir.path().display().to_string();
        let (router, _) = router_for(
            dir.path(),
            &[
                ("DELIBERATION_PROGRAM", "/bin/sh"),
                ("DELIBERATION_ARGS", "verdict.sh {juror_name}"),
                ("DELIBERATION_WORKDIR", workdir.as_str()),
            ],
        );
        let upload = json_request(
            Method::POST,
            "/upload",
            json!({ "files": [
                { "filename": "j.txt", "category": "juror", "content": "J" },
                { "filename": "c.txt", "category": "case", "content": "C" }
            ]}),
        );
        router.clone().oneshot(upload).await.unwrap();

        let run = json_request(Method::POST, "/run", json!({ "mode": "individual" }));
        let response = router.oneshot(run).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let events = sse_payloads(&body_text(response).await);
        assert!(events
            .iter()
            .any(|e| e["status"] == "output" && e["message"].as_str().unwrap_or("").contains("verdict for")));
        assert_eq!(events.last().unwrap()["status"], "completed");
    }

    #[tokio::test]
    async fn stop_without_runs_reports_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _) = router_for(dir.path(), &[]);
        let response = router
            .oneshot(json_request(Method::POST, "/stop", json!({})))
            .await
            .unwrap();
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["stopped"], 0);
    }

    #[tokio::test]
    async fn session_routes_report_missing_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _) = router_for(dir.path(), &[]);

        let input = json_request(Method::POST, "/sessions/ghost/input", json!({ "data": "y\n" }));
        let response = router.clone().oneshot(input).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let events = Request::builder().uri("/sessions/ghost/events").body(Body::empty()).unwrap();
        let response = router.clone().oneshot(events).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let delete = Request::builder()
            .method(Method::DELETE)
            .uri("/sessions/ghost")
            .body(Body::empty())
            .unwrap();
        let body: Value = serde_json::from_str(&body_text(router.oneshot(delete).await.unwrap()).await).unwrap();
        assert_eq!(body["removed"], false);
    }

    #[tokio::test]
    async fn finished_session_stream_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("p1.sh"), "echo phase-one\n").unwrap();
        std::fs::write(dir.path().join("p2.sh"), "echo Juror > juror.txt\n").unwrap();
        let workdir = dir.path().display().to_string();
        let (router, managers) = router_for(
            dir.path(),
            &[
                ("GENERATOR_PROGRAM", "/bin/sh"),
                ("GENERATOR_PHASE1_ARGS", "p1.sh"),
                ("GENERATOR_PHASE2_ARGS", "p2.sh"),
                ("GENERATOR_WORKDIR", workdir.as_str()),
                ("PTY_POLL_MS", "20"),
            ],
        );

        let start = json_request(Method::POST, "/sessions", json!({ "session_key": "tab-1" }));
        let response = router.clone().oneshot(start).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let events = Request::builder().uri("/sessions/tab-1/events").body(Body::empty()).unwrap();
        let response = router.oneshot(events).await.unwrap();
        let text = tokio::time::timeout(Duration::from_secs(20), body_text(response))
            .await
            .unwrap();
        let payloads = sse_payloads(&text);
        assert_eq!(payloads.last().unwrap()["status"], "completed");

        for _ in 0..50 {
            if managers.session_manager.list_sessions().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session was not cleaned up after its stream ended");
    }
}
