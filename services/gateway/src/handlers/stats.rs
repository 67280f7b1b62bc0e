use crate::state::AppState;
use axum::{Json, extract::State};
use price_feed::MetricsSnapshot;

pub async fn get_stats(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}
