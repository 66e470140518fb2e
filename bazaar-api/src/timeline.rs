use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Extension, Json, Router,
};
use bazaar_order::{Note, TimelineEntry};
use bazaar_shared::OrderId;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::Claims;
use crate::orders::visible_order;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct NoteRequest {
    pub body: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/orders/{id}/timeline", get(get_timeline))
        .route("/v1/orders/{id}/timeline/stream", get(stream_timeline))
        .route("/v1/orders/{id}/notes", post(add_note))
}

/// Events and notes merged in time order.
pub async fn get_timeline(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Vec<TimelineEntry>>, AppError> {
    let order_id = OrderId(order_id);
    visible_order(&state, &claims, order_id).await?;
    Ok(Json(state.timeline.merged(order_id).await?))
}

/// Live tail of one order's timeline as server-sent events.
pub async fn stream_timeline(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(order_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let order_id = OrderId(order_id);
    visible_order(&state, &claims, order_id).await?;

    let rx = state.timeline.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |result| async move {
        match result {
            Ok(entry) if entry.order_id() == order_id => {
                let name = match &entry {
                    TimelineEntry::Event(event) => event.kind.as_str(),
                    TimelineEntry::Note(_) => "note",
                };
                Event::default().event(name).json_data(&entry).ok().map(Ok)
            }
            // Lagged receivers skip what they missed; clients re-read the merged view.
            _ => None,
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn add_note(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<NoteRequest>,
) -> Result<(StatusCode, Json<Note>), AppError> {
    let order_id = OrderId(order_id);
    visible_order(&state, &claims, order_id).await?;
    let note = state.timeline.add_note(order_id, claims.actor(), &req.body).await?;
    Ok((StatusCode::CREATED, Json(note)))
}
