//! HTTP surface: SSE attach plus subscribe/unsubscribe (§6 "External
//! Interfaces"). Authentication and the rest of the host's HTTP router are
//! explicitly out of scope (§1) — `router` is meant to be nested under a
//! host application's own axum `Router`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use hub_core::Hub;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::sse_sink::SseSink;

/// Mount the hub's streaming endpoints under a path prefix, e.g.
/// `Router::new().nest("/hub", hub_axum::router(hub))`.
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/stream", get(stream))
        .route("/subscribe", post(subscribe))
        .route("/unsubscribe", post(unsubscribe))
        .with_state(hub)
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    user_id: String,
}

async fn stream(
    State(hub): State<Arc<Hub>>,
    Query(params): Query<StreamParams>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let (sink, rx) = SseSink::channel();
    // Grace-window restoration (swapping the old connection id for this one
    // in each topic's subscriber set) happens inside `attach` itself via the
    // Connection Manager's `GraceObserver` callback — no resubscribe needed
    // here, and calling `subscribe` again would double-count the new id.
    let (_id, _restored) = hub.connections.attach(params.user_id, sink).await;

    let stream = ReceiverStream::new(rx).map(Ok);
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

#[derive(Debug, Deserialize)]
struct TopicRequest {
    connection_id: Uuid,
    topic: String,
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

async fn subscribe(State(hub): State<Arc<Hub>>, Json(req): Json<TopicRequest>) -> impl IntoResponse {
    match hub.subscriptions.subscribe(req.connection_id, &req.topic).await {
        Ok(()) => axum::http::StatusCode::NO_CONTENT.into_response(),
        Err(err) => (
            axum::http::StatusCode::BAD_REQUEST,
            Json(ApiError { error: err.to_string() }),
        )
            .into_response(),
    }
}

async fn unsubscribe(State(hub): State<Arc<Hub>>, Json(req): Json<TopicRequest>) -> impl IntoResponse {
    hub.subscriptions.unsubscribe(req.connection_id, &req.topic).await;
    axum::http::StatusCode::NO_CONTENT
}
