//! HTTP endpoint handlers.
//!
//! Validation precedence is observable through status codes: missing name →
//! 404, unknown type → 400, unparseable value → 400, backend failure → 500.
//! JSON routes report errors as `{"error": "<msg>"}`.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};

use harvest_core::{HarvestError, Metric, MetricKind, MetricQuery, MetricValue};

use super::AppState;

pub async fn ping(State(state): State<AppState>) -> Response {
    match state.storage.ping().await {
        Ok(()) => ([(header::CONTENT_TYPE, "text/plain")], "").into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

pub async fn list_html(State(state): State<AppState>) -> Response {
    let mut list = match state.storage.list().await {
        Ok(list) => list,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };
    list.sort_by(|a, b| a.id.cmp(&b.id));

    let items: Vec<String> = list
        .iter()
        .map(|m| format!("    <li>{}: {}</li>", m.id, m.value.render()))
        .collect();

    let html = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <title>Metrics list</title>
</head>
<body>
  <ol>
{}
  </ol>
</body>
</html>
"#,
        items.join("\n")
    );

    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], html).into_response()
}

/// `POST /update/{type}/{name}/{value}`: legacy plain-text single write.
pub async fn update_plain(
    State(state): State<AppState>,
    Path((kind, name, value)): Path<(String, String, String)>,
) -> Response {
    if name.is_empty() {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }

    let Ok(kind) = kind.parse::<MetricKind>() else {
        return (StatusCode::BAD_REQUEST, "bad request (type)").into_response();
    };

    let Ok(value) = MetricValue::parse(kind, &value) else {
        return (StatusCode::BAD_REQUEST, "bad request (value)").into_response();
    };

    match state.storage.set(Metric { id: name, value }).await {
        Ok(()) => {
            state.flusher.flush_if_sync().await;
            ([(header::CONTENT_TYPE, "text/plain")], "").into_response()
        }
        Err(err) => plain_storage_error(err),
    }
}

/// `POST /update/`: JSON single write; responds with the accumulated record.
pub async fn update_json(State(state): State<AppState>, body: Bytes) -> Response {
    let metric: Metric = match serde_json::from_slice(&body) {
        Ok(m) => m,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, e.to_string()),
    };

    if metric.id.is_empty() {
        return json_error(StatusCode::NOT_FOUND, "not found");
    }

    let id = metric.id.clone();
    if let Err(err) = state.storage.set(metric).await {
        return json_storage_error(err);
    }

    let updated = match state.storage.get(&id).await {
        Ok(Some(m)) => m,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "not found"),
        Err(err) => return json_storage_error(err),
    };

    state.flusher.flush_if_sync().await;
    (StatusCode::OK, Json(updated)).into_response()
}

/// `POST /updates/`: JSON batch write, all-or-nothing.
pub async fn update_batch(State(state): State<AppState>, body: Bytes) -> Response {
    let batch: Vec<Metric> = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, e.to_string()),
    };

    if batch.iter().any(|m| m.id.is_empty()) {
        return json_error(StatusCode::NOT_FOUND, "not found");
    }

    if let Err(err) = state.storage.update(batch).await {
        return json_storage_error(err);
    }

    state.flusher.flush_if_sync().await;
    (StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], "").into_response()
}

/// `POST /value/`: JSON read by `{id, type}`.
pub async fn value_json(State(state): State<AppState>, body: Bytes) -> Response {
    let query: MetricQuery = match serde_json::from_slice(&body) {
        Ok(q) => q,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, e.to_string()),
    };

    match state.storage.get(&query.id).await {
        Ok(Some(m)) if m.kind() == query.kind => (StatusCode::OK, Json(m)).into_response(),
        Ok(_) => json_error(StatusCode::NOT_FOUND, "not found"),
        Err(err) => json_storage_error(err),
    }
}

/// `GET /value/{type}/{name}`: plain-text read.
pub async fn value_plain(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Response {
    let Ok(kind) = kind.parse::<MetricKind>() else {
        return (StatusCode::BAD_REQUEST, "bad request (type)").into_response();
    };

    match state.storage.get(&name).await {
        Ok(Some(m)) if m.kind() == kind => {
            ([(header::CONTENT_TYPE, "text/plain")], m.value.render()).into_response()
        }
        Ok(_) => (StatusCode::NOT_FOUND, "not found").into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn json_error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": msg.into() }))).into_response()
}

fn json_storage_error(err: HarvestError) -> Response {
    match err {
        HarvestError::Conflict { .. } | HarvestError::Malformed { .. } => {
            json_error(StatusCode::BAD_REQUEST, err.to_string())
        }
        HarvestError::NotFound => json_error(StatusCode::NOT_FOUND, "not found"),
        other => json_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

fn plain_storage_error(err: HarvestError) -> Response {
    match err {
        HarvestError::Conflict { .. } | HarvestError::Malformed { .. } => {
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        HarvestError::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
        _ => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
