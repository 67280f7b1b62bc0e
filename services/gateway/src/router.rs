use crate::handlers::{prices, root, stats, ws};
use crate::state::AppState;
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/prices", get(prices::price_range))
        .route("/prices/latest", get(prices::latest_price))
        .route("/stats", get(stats::get_stats));

    Router::new()
        .route("/", get(root::welcome))
        .nest("/v1", api_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
