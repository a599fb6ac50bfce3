use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};
use tracing::info;

use super::{current_session, ok, paris_today, parse_body, query_i64, require_csrf, with_db, AppState};
use crate::error::{invalid, Result, TirelireError};
use crate::ocr::{self, ReceiptInput};
use crate::ocr_feedback::{self, FeedbackInput};

const ADMIN_HEADER: &str = "x-admin-token";

pub async fn analyze(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let input: ReceiptInput = serde_json::from_value(data).map_err(|_| invalid("Données OCR invalides"))?;
    if input.text.trim().is_empty() && input.words.is_empty() {
        return Err(invalid("Texte manquant"));
    }
    let today = paris_today();
    let analysis = with_db(&state, move |conn| ocr::analyze_for_user(conn, ctx.user_id, &input, today)).await?;
    ok(analysis)
}

pub async fn feedback(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let input = FeedbackInput::from_json(&data)?;
    let id = with_db(&state, move |conn| ocr_feedback::store_feedback(conn, Some(ctx.user_id), &input)).await?;
    ok(json!({"id": id}))
}

/// Redacted feedback as JSON lines, for the configured admin only.
pub async fn export(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse> {
    let user_id = current_session(&state, &headers).await?.and_then(|s| s.user_id);
    let token = headers.get(ADMIN_HEADER).and_then(|v| v.to_str().ok());
    if !ocr_feedback::is_admin(&state.settings, user_id, token) {
        return Err(if user_id.is_some() || token.is_some() {
            TirelireError::Forbidden
        } else {
            TirelireError::Unauthenticated
        });
    }

    let since = ocr_feedback::export_since(
        params.get("since").map(String::as_str),
        query_i64(&params, "days"),
        chrono::Utc::now().naive_utc(),
    )?;
    let include_merchant = params.get("include_merchant").is_some_and(|v| v == "1" || v == "true");
    let entries = with_db(&state, move |conn| ocr_feedback::export(conn, since, include_merchant)).await?;

    let mut out = Vec::new();
    ocr_feedback::write_jsonl(&mut out, &entries)?;
    info!(count = entries.len(), "ocr feedback exported");
    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], out))
}
