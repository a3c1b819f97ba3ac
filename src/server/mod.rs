//! HTTP API surface (axum): run control, narration streaming, collection
//! listings, external ingestion, and static evidence serving.
//!
//! Every JSON response uses the `{success, data?, error?}` envelope.
//! Stack traces never leak to clients; errors surface as messages.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::context::NoemaContext;
use crate::narration::NarrationEvent;
use crate::runner::{
    stop_run, BrowserRolloutDriver, CognitiveRunController, RunHandle, RunOptions,
    validate_target_url,
};
use crate::sensing::SensoryInput;

const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
struct Envelope {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn ok(data: impl Serialize) -> (StatusCode, Json<Envelope>) {
    (
        StatusCode::OK,
        Json(Envelope {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
        }),
    )
}

fn fail(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Envelope>) {
    (
        status,
        Json(Envelope {
            success: false,
            data: None,
            error: Some(message.into()),
        }),
    )
}

pub fn router(ctx: Arc<NoemaContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/identity", get(identity))
        .route("/qa/run", post(start_run))
        .route("/run/{id}/stop", post(stop_run_handler))
        .route("/run/{id}/optimize", post(optimize_run))
        .route("/run/{id}/state", get(run_state))
        .route("/run/{id}/stream", get(run_stream))
        .route("/run/{id}/events", get(run_events))
        .route("/run/{id}/report", get(run_report))
        .route("/runs", get(list_runs))
        .route("/metrics", get(list_metrics))
        .route("/models", get(list_models))
        .route("/experiences", get(list_experiences))
        .route("/improvement", get(list_improvement))
        .route("/ingest", post(ingest))
        .route("/evidence/screenshots/{file}", get(serve_screenshot))
        .route("/evidence/videos/{file}", get(serve_video))
        .route("/evidence/videos/{run}/{file}", get(serve_video_frame))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Bind and serve until the process is terminated.
pub async fn serve(ctx: Arc<NoemaContext>) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", ctx.config.api_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "API listening");
    axum::serve(listener, router(ctx)).await?;
    Ok(())
}

async fn health() -> (StatusCode, Json<Envelope>) {
    ok(json!({ "status": "ok" }))
}

async fn identity(State(ctx): State<Arc<NoemaContext>>) -> (StatusCode, Json<Envelope>) {
    match ctx.identity.view().await {
        Ok(view) => ok(view),
        Err(err) => fail(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct StartRunRequest {
    goal: String,
    url: String,
    #[serde(default)]
    enable_optimization: bool,
    #[serde(default)]
    max_total_actions: Option<u32>,
    #[serde(default)]
    max_cycles_per_step: Option<u32>,
}

async fn start_run(
    State(ctx): State<Arc<NoemaContext>>,
    Json(request): Json<StartRunRequest>,
) -> (StatusCode, Json<Envelope>) {
    if request.goal.trim().is_empty() {
        return fail(StatusCode::BAD_REQUEST, "goal must not be empty");
    }
    if let Err(message) = validate_target_url(&request.url) {
        return fail(StatusCode::BAD_REQUEST, message);
    }

    let mut budgets = ctx.config.budgets.clone();
    if let Some(max_total) = request.max_total_actions {
        budgets.max_total_actions = max_total;
    }
    if let Some(max_cycles) = request.max_cycles_per_step {
        budgets.max_cycles_per_step = max_cycles;
    }

    let run_id = crate::store::new_id();
    let handle = RunHandle::new(&run_id, &request.goal, &request.url);
    ctx.runs.insert(handle.clone());

    let controller = CognitiveRunController::new(
        ctx.clone(),
        handle,
        RunOptions {
            goal: request.goal,
            url: request.url,
            enable_optimization: request.enable_optimization,
            budgets,
        },
    );
    tokio::spawn(async move {
        let _ = controller.run().await;
    });

    ok(json!({ "run_id": run_id, "status": "started" }))
}

async fn stop_run_handler(
    State(ctx): State<Arc<NoemaContext>>,
    Path(run_id): Path<String>,
) -> (StatusCode, Json<Envelope>) {
    if stop_run(&ctx, &run_id).await {
        ok(json!({ "run_id": run_id, "status": "stopped" }))
    } else {
        fail(StatusCode::NOT_FOUND, format!("run not found: {run_id}"))
    }
}

async fn optimize_run(
    State(ctx): State<Arc<NoemaContext>>,
    Path(run_id): Path<String>,
) -> (StatusCode, Json<Envelope>) {
    let Some(handle) = ctx.runs.get(&run_id) else {
        return fail(StatusCode::NOT_FOUND, format!("run not found: {run_id}"));
    };
    let status = handle.status();
    let ctx_bg = ctx.clone();
    tokio::spawn(async move {
        let driver = BrowserRolloutDriver::new(ctx_bg.clone());
        if let Err(err) = ctx_bg
            .optimizer
            .optimize(&run_id, &status.goal, &status.url, &driver)
            .await
        {
            tracing::warn!(error = %err, "triggered optimization failed");
        }
    });
    ok(json!({
        "run_id": handle.run_id,
        "message": "deep learning started in the background",
    }))
}

async fn run_state(
    State(ctx): State<Arc<NoemaContext>>,
    Path(run_id): Path<String>,
) -> (StatusCode, Json<Envelope>) {
    match ctx.runs.get(&run_id) {
        Some(handle) => ok(handle.status()),
        None => fail(StatusCode::NOT_FOUND, format!("run not found: {run_id}")),
    }
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    #[serde(default)]
    since: Option<u64>,
}

async fn run_stream(
    State(ctx): State<Arc<NoemaContext>>,
    Path(run_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let since = query.since.unwrap_or(0);

    // subscribe before snapshotting history so no event can slip between
    let live_rx = ctx.narration.subscribe();
    let backlog = ctx.narration.events_since(since, Some(&run_id));
    let last_seq = backlog.last().map(|e| e.seq).unwrap_or(since);

    let backlog_stream = futures_util::stream::iter(
        backlog.into_iter().map(|event| Ok(to_sse_event(&event))),
    );
    let live_stream = BroadcastStream::new(live_rx).filter_map(move |result| {
        let run_id = run_id.clone();
        async move {
            match result {
                Ok(event)
                    if event.run_id.as_deref() == Some(run_id.as_str())
                        && event.seq > last_seq =>
                {
                    Some(Ok(to_sse_event(&event)))
                }
                _ => None,
            }
        }
    });

    Sse::new(backlog_stream.chain(live_stream))
        .keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE).text("keepalive"))
}

fn to_sse_event(event: &NarrationEvent) -> Event {
    Event::default().data(serde_json::to_string(event).unwrap_or_default())
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    since: Option<u64>,
}

async fn run_events(
    State(ctx): State<Arc<NoemaContext>>,
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> (StatusCode, Json<Envelope>) {
    let events = match query.since {
        Some(since) => ctx.narration.events_since(since, Some(&run_id)),
        None => ctx.narration.history(Some(&run_id)),
    };
    ok(events)
}

async fn run_report(
    State(ctx): State<Arc<NoemaContext>>,
    Path(run_id): Path<String>,
) -> (StatusCode, Json<Envelope>) {
    match ctx.runs.get(&run_id) {
        Some(handle) => match handle.report() {
            Some(report) => ok(report),
            None => fail(
                StatusCode::NOT_FOUND,
                format!("run {run_id} has no report yet"),
            ),
        },
        None => fail(StatusCode::NOT_FOUND, format!("run not found: {run_id}")),
    }
}

async fn list_runs(State(ctx): State<Arc<NoemaContext>>) -> (StatusCode, Json<Envelope>) {
    let mut statuses: Vec<_> = ctx.runs.list().iter().map(|h| h.status()).collect();
    statuses.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    ok(statuses)
}

async fn list_metrics(State(ctx): State<Arc<NoemaContext>>) -> (StatusCode, Json<Envelope>) {
    match ctx.store.metrics.list_all().await {
        Ok(mut metrics) => {
            metrics.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            ok(metrics)
        }
        Err(err) => fail(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn list_models(State(ctx): State<Arc<NoemaContext>>) -> (StatusCode, Json<Envelope>) {
    match ctx.store.models.list_all().await {
        Ok(mut models) => {
            models.sort_by(|a, b| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            ok(models)
        }
        Err(err) => fail(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn list_experiences(State(ctx): State<Arc<NoemaContext>>) -> (StatusCode, Json<Envelope>) {
    match ctx.store.experiences.list_all().await {
        Ok(mut experiences) => {
            experiences.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            ok(experiences)
        }
        Err(err) => fail(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// Improvement analysis of the most recent run of each task type.
async fn list_improvement(State(ctx): State<Arc<NoemaContext>>) -> (StatusCode, Json<Envelope>) {
    let metrics = match ctx.store.metrics.list_all().await {
        Ok(metrics) => metrics,
        Err(err) => return fail(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };

    let mut latest_per_type: std::collections::HashMap<String, crate::store::RunMetrics> =
        std::collections::HashMap::new();
    for m in metrics {
        let entry = latest_per_type.entry(m.task_type.clone());
        match entry {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                if m.created_at > slot.get().created_at {
                    slot.insert(m);
                }
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(m);
            }
        }
    }

    let mut summaries = Vec::new();
    for current in latest_per_type.values() {
        if let Ok(summary) = ctx.improvement.analyze(current).await {
            summaries.push(summary);
        }
    }
    summaries.sort_by(|a, b| a.task_type.cmp(&b.task_type));
    ok(summaries)
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    base64: Option<String>,
    #[serde(default)]
    file_path: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    run_id: Option<String>,
}

async fn ingest(
    State(ctx): State<Arc<NoemaContext>>,
    Json(request): Json<IngestRequest>,
) -> (StatusCode, Json<Envelope>) {
    let source = request.source.unwrap_or_else(|| "external".to_string());
    let input = match request.kind.as_str() {
        "text" => match request.content {
            Some(content) => SensoryInput::Text { content, source },
            None => return fail(StatusCode::BAD_REQUEST, "text ingestion requires content"),
        },
        "log" => match request.content {
            Some(content) => SensoryInput::Log { content, source },
            None => return fail(StatusCode::BAD_REQUEST, "log ingestion requires content"),
        },
        "screenshot" => {
            if request.base64.is_none() && request.file_path.is_none() {
                return fail(
                    StatusCode::BAD_REQUEST,
                    "screenshot ingestion requires base64 or file_path",
                );
            }
            SensoryInput::Screenshot {
                base64: request.base64,
                file_path: request.file_path,
                description: request.description,
                source,
            }
        }
        other => {
            return fail(
                StatusCode::BAD_REQUEST,
                format!("unsupported ingestion type: {other}"),
            )
        }
    };

    match ctx.sensing.ingest(input, request.run_id.as_deref()).await {
        Ok(receipt) => ok(receipt),
        Err(err) => fail(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// Strip everything outside `[A-Za-z0-9._-]` and reject traversal.
fn sanitise_filename(raw: &str) -> Option<String> {
    if raw.contains("..") {
        return None;
    }
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn content_type_for(name: &str) -> &'static str {
    if name.ends_with(".png") {
        "image/png"
    } else if name.ends_with(".jpg") || name.ends_with(".jpeg") {
        "image/jpeg"
    } else if name.ends_with(".json") {
        "application/json"
    } else {
        "application/octet-stream"
    }
}

async fn serve_file(path: std::path::PathBuf) -> axum::response::Response {
    let name = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type_for(&name))],
            bytes,
        )
            .into_response(),
        Err(_) => fail(StatusCode::NOT_FOUND, format!("no such artifact: {name}")).into_response(),
    }
}

async fn serve_screenshot(
    State(ctx): State<Arc<NoemaContext>>,
    Path(file): Path<String>,
) -> axum::response::Response {
    match sanitise_filename(&file) {
        Some(name) => serve_file(ctx.store.screenshots_dir().join(name)).await,
        None => fail(StatusCode::BAD_REQUEST, "invalid filename").into_response(),
    }
}

async fn serve_video(
    State(ctx): State<Arc<NoemaContext>>,
    Path(file): Path<String>,
) -> axum::response::Response {
    match sanitise_filename(&file) {
        Some(name) => serve_file(ctx.store.videos_dir().join(name)).await,
        None => fail(StatusCode::BAD_REQUEST, "invalid filename").into_response(),
    }
}

async fn serve_video_frame(
    State(ctx): State<Arc<NoemaContext>>,
    Path((run, file)): Path<(String, String)>,
) -> axum::response::Response {
    match (sanitise_filename(&run), sanitise_filename(&file)) {
        (Some(run), Some(name)) => serve_file(ctx.store.videos_dir().join(run).join(name)).await,
        _ => fail(StatusCode::BAD_REQUEST, "invalid filename").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_are_sanitised() {
        assert_eq!(sanitise_filename("run-1_0001.png").as_deref(), Some("run-1_0001.png"));
        assert_eq!(sanitise_filename("../etc/passwd"), None);
        assert_eq!(sanitise_filename("a/b.png").as_deref(), Some("ab.png"));
        assert_eq!(sanitise_filename("###"), None);
    }

    #[test]
    fn content_types_match_extensions() {
        assert_eq!(content_type_for("a.png"), "image/png");
        assert_eq!(content_type_for("a.json"), "application/json");
        assert_eq!(content_type_for("a.bin"), "application/octet-stream");
    }
}
