//! Push API for stored data events.
//!
//! `POST` with a [`Save`] body publishes a save, `DELETE` with an [`Invalidation`] body
//! publishes an invalidation. Both answer `200` once the event is queued, without
//! waiting for it to be applied, and `400` if the body isn't valid. Every request must
//! carry `Authorization: Bearer <api key>`.

use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
};
use serde::de::DeserializeOwned;

use super::{EventSenders, Invalidation, Save};

#[derive(Debug, Clone)]
struct ApiState {
    api_key: Arc<str>,
    senders: EventSenders,
}

/// A router serving the push API at `/`. Nest it under the path of your choice.
pub fn router(api_key: &str, senders: EventSenders) -> Router {
    let state = ApiState { api_key: Arc::from(api_key), senders };
    Router::new()
        .route("/", post(save).delete(invalidate))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

async fn require_api_key(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|key| key == state.api_key.as_ref());
    if !authorized {
        tracing::warn!(
            method = %request.method(),
            "Rejected stored data event without a valid API key"
        );
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(request).await
}

fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|err| {
        tracing::debug!(error = %err, "Invalid stored data event body");
        (StatusCode::BAD_REQUEST, format!("invalid event body: {err}")).into_response()
    })
}

async fn save(State(state): State<ApiState>, body: Bytes) -> Response {
    match decode::<Save>(&body) {
        Ok(event) => {
            state.senders.save(event);
            StatusCode::OK.into_response()
        }
        Err(response) => response,
    }
}

async fn invalidate(State(state): State<ApiState>, body: Bytes) -> Response {
    match decode::<Invalidation>(&body) {
        Ok(event) => {
            state.senders.invalidate(event);
            StatusCode::OK.into_response()
        }
        Err(response) => response,
    }
}
