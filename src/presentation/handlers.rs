// HTTP request handlers
use crate::application::session::SyncSession;
use crate::application::subscription_registry::SubscriptionId;
use crate::application::widget_repository::PersistenceError;
use crate::application::widget_store::{StoreError, WidgetCommand};
use crate::domain::envelope::{Envelope, Topic};
use crate::domain::widget::WidgetSpec;
use crate::infrastructure::chunked_stream::stream_from_receiver;
use crate::infrastructure::http_response::{accepts_brotli, json_response};
use crate::presentation::app_state::AppState;
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Deserialize)]
pub struct EventsQuery {
    pub topics: Option<String>,
}

/// Unsubscribes the stream's registrations when the response body is dropped.
struct EventStreamGuard {
    session: Arc<SyncSession>,
    ids: Vec<SubscriptionId>,
}

impl Drop for EventStreamGuard {
    fn drop(&mut self) {
        for id in &self.ids {
            self.session.unsubscribe(*id);
        }
        tracing::debug!("Event stream closed, released {} subscriptions", self.ids.len());
    }
}

fn error_response(status: StatusCode, message: impl ToString) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

fn parse_topics(raw: Option<&str>) -> Result<Vec<Topic>, String> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(Topic::ALL.to_vec());
    };
    let mut topics = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        let topic: Topic = name.parse().map_err(|_| format!("unknown topic {:?}", name))?;
        if !topics.contains(&topic) {
            topics.push(topic);
        }
    }
    Ok(topics)
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "ok"
}

/// Current live channel state
pub async fn get_session(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.session.state())
}

/// Local dashboard snapshot
pub async fn list_widgets(headers: HeaderMap, State(state): State<Arc<AppState>>) -> Response {
    let dashboard = state.session.dashboard();
    match json_response(StatusCode::OK, &dashboard, accepts_brotli(&headers)).await {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}

/// Persist a new widget
pub async fn create_widget(
    State(state): State<Arc<AppState>>,
    body: Result<Json<WidgetSpec>, JsonRejection>,
) -> Response {
    let Json(spec) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    match state.session.create_widget(spec).await {
        Ok(widget) => (StatusCode::CREATED, Json(widget)).into_response(),
        Err(e @ PersistenceError::Validation(_)) => error_response(StatusCode::BAD_REQUEST, e),
        Err(e @ PersistenceError::SessionClosed) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
        Err(e) => {
            tracing::warn!("Widget create failed: {}", e);
            error_response(StatusCode::BAD_GATEWAY, e)
        }
    }
}

/// Apply one store command
pub async fn apply_command(
    State(state): State<Arc<AppState>>,
    body: Result<Json<WidgetCommand>, JsonRejection>,
) -> Response {
    let Json(command) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    match state.session.apply(command) {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e @ StoreError::Validation(_)) => error_response(StatusCode::BAD_REQUEST, e),
        Err(e @ StoreError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, e),
    }
}

/// Stream envelopes for the requested topics (all topics when none are given)
pub async fn stream_events(
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let topics = match parse_topics(query.topics.as_deref()) {
        Ok(topics) => topics,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };

    let (tx, rx) = mpsc::unbounded_channel::<Arc<Envelope>>();
    let ids = topics
        .into_iter()
        .map(|topic| {
            let tx = tx.clone();
            state.session.subscribe(topic, move |envelope| {
                tx.send(Arc::new(envelope.clone()))
                    .map_err(|_| anyhow::anyhow!("event stream receiver dropped"))
            })
        })
        .collect();
    drop(tx);

    let guard = EventStreamGuard {
        session: Arc::clone(&state.session),
        ids,
    };
    stream_from_receiver(rx, guard, accepts_brotli(&headers))
        .await
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_topics() {
        assert_eq!(parse_topics(None).unwrap(), Topic::ALL.to_vec());
        assert_eq!(parse_topics(Some("  ")).unwrap(), Topic::ALL.to_vec());
        assert_eq!(
            parse_topics(Some("asset_update, market_data,asset_update")).unwrap(),
            vec![Topic::AssetUpdate, Topic::MarketData]
        );
        assert!(parse_topics(Some("asset_update,weather")).is_err());
    }
}
