//! HTTP Surface
//!
//! Thin axum layer over the core runtime: JSON endpoints for every exposed
//! operation plus the per-run Server-Sent Events stream.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::sse::{Event, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::codeloop::LoopMode;
use crate::config::Strategy;
use crate::error::{EngineError, EngineResult};
use crate::runner::StartRunRequest;
use crate::runtime::CoreRuntime;
use crate::store::analytics::AnalyticsWindow;

pub fn router(runtime: Arc<CoreRuntime>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/meta/run", post(start_run))
        .route("/api/meta/runs", get(list_runs))
        .route("/api/meta/run/{run_id}", get(get_run))
        .route("/api/meta/run/{run_id}/cancel", post(cancel_run))
        .route("/api/meta/run/{run_id}/events", get(run_events))
        .route("/api/meta/variant/{variant_id}", get(get_variant))
        .route("/api/meta/variant/{variant_id}/rate", post(rate_variant))
        .route("/api/meta/operators", get(operator_stats))
        .route("/api/meta/operators/reset", post(reset_operator_stats))
        .route("/api/meta/recipes", get(list_recipes))
        .route("/api/meta/recipes/{recipe_id}/approve", post(approve_recipe))
        .route("/api/golden/run", post(run_golden))
        .route("/api/code-loop/run", post(run_code_loop))
        .route("/api/analytics/snapshot", get(analytics_snapshot))
        .layer(TraceLayer::new_for_http())
        .with_state(runtime)
}

pub async fn serve(runtime: Arc<CoreRuntime>) -> anyhow::Result<()> {
    let addr = runtime.config().bind_addr.clone();
    let app = router(Arc::clone(&runtime));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("engine listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            runtime.shutdown().await;
        })
        .await?;
    Ok(())
}

fn client_id(headers: &HeaderMap, session_id: Option<&str>) -> String {
    headers
        .get("x-client-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| session_id.map(|s| s.to_string()))
        .unwrap_or_else(|| "anonymous".to_string())
}

async fn health(State(runtime): State<Arc<CoreRuntime>>) -> impl IntoResponse {
    Json(runtime.health().await)
}

#[derive(Deserialize)]
struct StartRunBody {
    session_id: Option<String>,
    task_class: String,
    task: String,
    n: Option<u32>,
    strategy: Option<String>,
    epsilon: Option<f64>,
    memory_k: Option<u32>,
    rag_k: Option<u32>,
    framework_mask: Option<Vec<String>>,
    seed: Option<u64>,
}

async fn start_run(
    State(runtime): State<Arc<CoreRuntime>>,
    headers: HeaderMap,
    Json(body): Json<StartRunBody>,
) -> EngineResult<impl IntoResponse> {
    let strategy = body
        .strategy
        .as_deref()
        .map(|raw| {
            Strategy::parse(raw)
                .ok_or_else(|| EngineError::Config(format!("unknown strategy '{}'", raw)))
        })
        .transpose()?;

    let client = client_id(&headers, body.session_id.as_deref());
    let request = StartRunRequest {
        session_id: body.session_id,
        task_class: body.task_class,
        task: body.task,
        n: body.n,
        strategy,
        epsilon: body.epsilon,
        memory_k: body.memory_k,
        rag_k: body.rag_k,
        framework_mask: body.framework_mask,
        seed: body.seed,
    };

    let run_id = runtime.start_run(request, &client).await?;
    Ok(Json(serde_json::json!({ "run_id": run_id })))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<u32>,
}

async fn list_runs(
    State(runtime): State<Arc<CoreRuntime>>,
    Query(query): Query<LimitQuery>,
) -> EngineResult<impl IntoResponse> {
    let runs = runtime.list_runs(query.limit.unwrap_or(50)).await?;
    Ok(Json(serde_json::json!({ "runs": runs })))
}

async fn get_run(
    State(runtime): State<Arc<CoreRuntime>>,
    Path(run_id): Path<i64>,
) -> EngineResult<impl IntoResponse> {
    let run = runtime.get_run(run_id).await?;
    let variants = runtime.list_variants(run_id).await?;
    Ok(Json(serde_json::json!({ "run": run, "variants": variants })))
}

async fn cancel_run(
    State(runtime): State<Arc<CoreRuntime>>,
    Path(run_id): Path<i64>,
) -> EngineResult<impl IntoResponse> {
    runtime.cancel_run(run_id)?;
    Ok(Json(serde_json::json!({ "cancelled": run_id })))
}

async fn run_events(
    State(runtime): State<Arc<CoreRuntime>>,
    Path(run_id): Path<i64>,
) -> EngineResult<impl IntoResponse> {
    let mut subscription = runtime.subscribe_events(run_id)?;

    let (sse_tx, sse_rx) = tokio::sync::mpsc::unbounded_channel::<Result<Event, Infallible>>();
    tokio::spawn(async move {
        while let Some(event) = subscription.next().await {
            let sse = Event::default()
                .json_data(&event)
                .unwrap_or_else(|_| Event::default().data("{}"));
            if sse_tx.send(Ok(sse)).is_err() {
                break;
            }
        }
    });

    Ok(Sse::new(tokio_stream::wrappers::UnboundedReceiverStream::new(sse_rx)))
}

async fn get_variant(
    State(runtime): State<Arc<CoreRuntime>>,
    Path(variant_id): Path<i64>,
) -> EngineResult<impl IntoResponse> {
    let variant = runtime.get_variant(variant_id).await?;
    Ok(Json(variant))
}

#[derive(Deserialize)]
struct RateBody {
    score: u8,
    feedback: Option<String>,
}

async fn rate_variant(
    State(runtime): State<Arc<CoreRuntime>>,
    Path(variant_id): Path<i64>,
    Json(body): Json<RateBody>,
) -> EngineResult<impl IntoResponse> {
    runtime.rate(variant_id, body.score, body.feedback).await?;
    Ok(Json(serde_json::json!({ "rated": variant_id })))
}

#[derive(Deserialize)]
struct TaskClassQuery {
    task_class: Option<String>,
}

async fn operator_stats(
    State(runtime): State<Arc<CoreRuntime>>,
    Query(query): Query<TaskClassQuery>,
) -> EngineResult<impl IntoResponse> {
    let stats = runtime
        .list_operator_stats(query.task_class.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "operators": stats })))
}

#[derive(Deserialize)]
struct TaskClassBody {
    task_class: String,
}

async fn reset_operator_stats(
    State(runtime): State<Arc<CoreRuntime>>,
    Json(body): Json<TaskClassBody>,
) -> EngineResult<impl IntoResponse> {
    let deleted = runtime.reset_operator_stats(&body.task_class).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

async fn list_recipes(
    State(runtime): State<Arc<CoreRuntime>>,
    Query(query): Query<TaskClassQuery>,
) -> EngineResult<impl IntoResponse> {
    let task_class = query
        .task_class
        .ok_or_else(|| EngineError::Config("task_class query parameter required".into()))?;
    let recipes = runtime.list_recipes(&task_class).await?;
    Ok(Json(serde_json::json!({ "recipes": recipes })))
}

async fn approve_recipe(
    State(runtime): State<Arc<CoreRuntime>>,
    Path(recipe_id): Path<i64>,
) -> EngineResult<impl IntoResponse> {
    runtime.approve_recipe(recipe_id).await?;
    Ok(Json(serde_json::json!({ "approved": recipe_id })))
}

#[derive(Deserialize)]
struct GoldenBody {
    subset: Option<Vec<String>>,
}

async fn run_golden(
    State(runtime): State<Arc<CoreRuntime>>,
    Json(body): Json<GoldenBody>,
) -> EngineResult<impl IntoResponse> {
    let kpi = runtime.run_golden(body.subset.as_deref()).await?;
    Ok(Json(kpi))
}

#[derive(Deserialize)]
struct CodeLoopBody {
    source_run_id: i64,
    mode: Option<String>,
}

async fn run_code_loop(
    State(runtime): State<Arc<CoreRuntime>>,
    Json(body): Json<CodeLoopBody>,
) -> EngineResult<impl IntoResponse> {
    let mode = match body.mode.as_deref() {
        Some(raw) => LoopMode::parse(raw)
            .ok_or_else(|| EngineError::Config(format!("unknown mode '{}'", raw)))?,
        None => LoopMode::DryRun,
    };
    let artifact = runtime.run_code_loop(body.source_run_id, mode).await?;
    Ok(Json(artifact))
}

#[derive(Deserialize)]
struct WindowQuery {
    window: Option<String>,
}

async fn analytics_snapshot(
    State(runtime): State<Arc<CoreRuntime>>,
    Query(query): Query<WindowQuery>,
) -> EngineResult<impl IntoResponse> {
    let window = match query.window.as_deref() {
        Some(raw) => AnalyticsWindow::parse(raw)
            .ok_or_else(|| EngineError::Config(format!("unknown window '{}'", raw)))?,
        None => AnalyticsWindow::Days7,
    };
    let snapshot = runtime.analytics_snapshot(window).await?;
    Ok(Json(snapshot))
}
