use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::{
    aggregator::LoadAggregator,
    chart::{ChartSnapshot, ChartSummary, ChartView, load_all},
};

#[derive(Clone)]
pub struct AppState {
    pub charts: Arc<IndexMap<String, Arc<ChartView>>>,
    pub aggregator: LoadAggregator,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

fn bad_request<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, e.to_string())
}

fn find_chart(st: &AppState, id: &str) -> Result<Arc<ChartView>, (StatusCode, String)> {
    st.charts
        .get(id)
        .cloned()
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no chart `{}`", id)))
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/charts", get(list_charts))
        .route("/api/charts/{id}", get(get_chart))
        .route("/api/charts/{id}/reload", post(reload_chart))
        .route("/api/charts/{id}/time_range", post(set_time_range))
        .route("/api/charts/{id}/page", post(page_chart))
        .route("/api/charts/{id}/popup", post(set_popup))
        .route("/api/aggregator", get(aggregator_status))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: AppState, bind: SocketAddr, refresh: Duration) -> anyhow::Result<()> {
    let refresher = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(refresh);
        loop {
            ticker.tick().await;
            load_all(&refresher.charts, &refresher.aggregator);
        }
    });

    let charts = state.charts.clone();
    let app = router(state);

    info!(%bind, "listening");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // late responses must not touch charts after shutdown
    for chart in charts.values() {
        chart.destroy();
    }
    info!("stopped");
    Ok(())
}

async fn list_charts(State(st): State<AppState>) -> Json<Vec<ChartSummary>> {
    Json(st.charts.values().map(|c| c.summary()).collect())
}

async fn get_chart(State(st): State<AppState>, Path(id): Path<String>) -> ApiResult<ChartSnapshot> {
    let chart = find_chart(&st, &id)?;
    Ok(Json(chart.snapshot()))
}

async fn reload_chart(State(st): State<AppState>, Path(id): Path<String>) -> ApiResult<ChartSummary> {
    let chart = find_chart(&st, &id)?;
    chart.load(&st.aggregator).map_err(bad_request)?;
    Ok(Json(chart.summary()))
}

#[derive(Debug, Deserialize)]
struct TimeRangeParams {
    index: usize,
}

async fn set_time_range(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<TimeRangeParams>,
) -> ApiResult<ChartSummary> {
    let chart = find_chart(&st, &id)?;
    chart.set_time_index(q.index, &st.aggregator).map_err(bad_request)?;
    Ok(Json(chart.summary()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Direction {
    Back,
    Forward,
}

#[derive(Debug, Deserialize)]
struct PageParams {
    direction: Direction,
}

async fn page_chart(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<PageParams>,
) -> ApiResult<ChartSummary> {
    let chart = find_chart(&st, &id)?;
    let moved = match q.direction {
        Direction::Back => chart.page_back(&st.aggregator),
        Direction::Forward => chart.page_forward(&st.aggregator),
    }
    .map_err(bad_request)?;
    if !moved {
        return Err((StatusCode::CONFLICT, "already at the edge of the time range".into()));
    }
    Ok(Json(chart.summary()))
}

#[derive(Debug, Deserialize)]
struct PopupParams {
    open: bool,
}

async fn set_popup(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<PopupParams>,
) -> ApiResult<ChartSummary> {
    let chart = find_chart(&st, &id)?;
    chart.set_popup(q.open);
    Ok(Json(chart.summary()))
}

async fn aggregator_status(State(st): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "pending": st.aggregator.pending_len(),
        "collecting": st.aggregator.is_collecting(),
    }))
}
