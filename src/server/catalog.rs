use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};

use super::{delete_outcome, ok, opt_text, parse_body, query_i64, require_auth, require_csrf, text, with_db, AppState};
use crate::error::Result;
use crate::{categories, types, validate};

const DEFAULT_SEARCH_LIMIT: i64 = 10;

/// `Some(None)` when the key is present but blank, so the budget can be cleared.
fn budget_update(data: &Value, key: &str) -> Result<Option<Option<f64>>> {
    if data.get(key).is_none() {
        return Ok(None);
    }
    Ok(Some(validate::float(data.get(key), key, true)?))
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

pub async fn list_types(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>> {
    require_auth(&state, &headers).await?;
    let list = with_db(&state, |conn| types::list_types(conn)).await?;
    ok(json!({"types": list}))
}

pub async fn add_type(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    require_csrf(&state, &headers, &data).await?;
    let code = text(&data, "code");
    let label = text(&data, "label");
    let id = with_db(&state, move |conn| types::add_type(conn, &code, &label)).await?;
    ok(json!({"id_type": id}))
}

pub async fn update_type(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    require_csrf(&state, &headers, &data).await?;
    let id = validate::required_int(data.get("id_type"), "id_type")?;
    let code = opt_text(&data, "code");
    let label = text(&data, "label");
    with_db(&state, move |conn| types::update_type(conn, id, code.as_deref(), &label)).await?;
    ok(json!({"id_type": id}))
}

pub async fn delete_type(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    require_csrf(&state, &headers, &data).await?;
    let id = validate::required_int(data.get("id_type"), "id_type")?;
    let reassign = validate::int(data.get("reassign_to_type_id"), "reassign_to_type_id", true)?;
    let outcome = with_db(&state, move |conn| types::delete_type(conn, id, reassign)).await?;
    Ok(delete_outcome(outcome))
}

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

pub async fn list_categories(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>> {
    require_auth(&state, &headers).await?;
    let type_id = query_i64(&params, "id_type");
    let list = with_db(&state, move |conn| categories::list_categories(conn, type_id)).await?;
    ok(json!({"categories": list}))
}

pub async fn add_category(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    require_csrf(&state, &headers, &data).await?;
    let type_id = validate::required_int(data.get("id_type"), "id_type")?;
    let name = text(&data, "name");
    let budget = validate::float(data.get("manual_budget"), "manual_budget", true)?;
    let id = with_db(&state, move |conn| categories::add_category(conn, type_id, &name, budget)).await?;
    ok(json!({"id_category": id}))
}

pub async fn update_category(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    require_csrf(&state, &headers, &data).await?;
    let id = validate::required_int(data.get("id_category"), "id_category")?;
    let name = text(&data, "name");
    let type_id = validate::int(data.get("id_type"), "id_type", true)?;
    let budget = budget_update(&data, "manual_budget")?;
    with_db(&state, move |conn| categories::update_category(conn, id, &name, type_id, budget)).await?;
    ok(json!({"id_category": id}))
}

pub async fn delete_category(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let id = validate::required_int(data.get("id_category"), "id_category")?;
    let reassign = validate::int(data.get("reassign_to"), "reassign_to", true)?;
    let outcome = with_db(&state, move |conn| categories::delete_category(conn, ctx.user_id, id, reassign)).await?;
    Ok(delete_outcome(outcome))
}

pub async fn search_categories(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>> {
    require_auth(&state, &headers).await?;
    let q = params.get("q").cloned().unwrap_or_default();
    let limit = query_i64(&params, "limit").unwrap_or(DEFAULT_SEARCH_LIMIT);
    let results = with_db(&state, move |conn| categories::search_categories(conn, &q, limit)).await?;
    ok(json!({"results": results}))
}

// ---------------------------------------------------------------------------
// Subcategories
// ---------------------------------------------------------------------------

pub async fn list_subcategories(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>> {
    require_auth(&state, &headers).await?;
    let category_id = query_i64(&params, "category_id");
    let list = with_db(&state, move |conn| categories::list_subcategories(conn, category_id)).await?;
    ok(json!({"subcategories": list}))
}

pub async fn add_subcategory(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    require_csrf(&state, &headers, &data).await?;
    let category_id = validate::required_int(data.get("category_id"), "category_id")?;
    let name = text(&data, "name");
    let icon = opt_text(&data, "icon");
    let budget = validate::float(data.get("manual_budget"), "manual_budget", true)?;
    let id = with_db(&state, move |conn| {
        categories::add_subcategory(conn, category_id, &name, icon.as_deref(), budget)
    })
    .await?;
    ok(json!({"id_subcategory": id}))
}

pub async fn update_subcategory(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    require_csrf(&state, &headers, &data).await?;
    let id = validate::required_int(data.get("id_subcategory"), "id_subcategory")?;
    let name = text(&data, "name");
    let category_id = validate::int(data.get("category_id"), "category_id", true)?;
    let icon = opt_text(&data, "icon");
    let budget = budget_update(&data, "manual_budget")?;
    with_db(&state, move |conn| {
        categories::update_subcategory(conn, id, &name, category_id, icon.as_deref(), budget)
    })
    .await?;
    ok(json!({"id_subcategory": id}))
}

pub async fn delete_subcategory(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let id = validate::required_int(data.get("id_subcategory"), "id_subcategory")?;
    let reassign = validate::int(data.get("reassign_to"), "reassign_to", true)?;
    let outcome =
        with_db(&state, move |conn| categories::delete_subcategory(conn, ctx.user_id, id, reassign)).await?;
    Ok(delete_outcome(outcome))
}
