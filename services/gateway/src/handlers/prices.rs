use crate::error::AppError;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Query, State, rejection::QueryRejection},
};
use chrono::{DateTime, Utc};
use persistence::RangeQuery;
use serde::Deserialize;
use types::point::PriceMessage;

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct RangeParams {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl RangeParams {
    fn into_query(self) -> RangeQuery {
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        RangeQuery::new(self.start, self.end).with_page(limit, self.offset.unwrap_or(0))
    }
}

pub async fn latest_price(State(state): State<AppState>) -> Result<Json<PriceMessage>, AppError> {
    let store = state.store.clone();
    let latest = tokio::task::spawn_blocking(move || store.latest())
        .await
        .map_err(anyhow::Error::from)??;

    latest
        .map(|point| Json(point.to_message()))
        .ok_or_else(|| AppError::NotFound("No prices recorded yet".into()))
}

pub async fn price_range(
    State(state): State<AppState>,
    params: Result<Query<RangeParams>, QueryRejection>,
) -> Result<Json<Vec<PriceMessage>>, AppError> {
    let Query(params) = params?;
    let query = params.into_query();
    query.validate()?;

    let store = state.store.clone();
    let points = tokio::task::spawn_blocking(move || store.range(&query))
        .await
        .map_err(anyhow::Error::from)??;

    Ok(Json(points.iter().map(|p| p.to_message()).collect()))
}
