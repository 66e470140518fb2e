use axum::{
    http::{header, HeaderName, Method},
    middleware::from_fn_with_state,
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod error;
pub mod metrics;
pub mod middleware;
pub mod orders;
pub mod state;
pub mod timeline;
pub mod wallet;
pub mod worker;

pub use state::AppState;

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::IF_MATCH,
            HeaderName::from_static("idempotency-key"),
        ])
        .expose_headers([header::ETAG]);

    let authenticated = Router::new()
        .merge(orders::routes())
        .merge(timeline::routes())
        .merge(wallet::routes())
        .route_layer(from_fn_with_state(state.clone(), middleware::auth_middleware));

    Router::new()
        .merge(authenticated)
        .route("/metrics", get(metrics::metrics_handler))
        // Route layer so the matched path is known when labelling.
        .route_layer(from_fn_with_state(state.clone(), metrics::track_metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(from_fn_with_state(state.clone(), middleware::rate_limit_middleware))
        .with_state(state)
}
