use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};
use tracing::info;

use super::{
    csrf_from, current_session, ok, opt_text, parse_body, require_auth, require_csrf, text, with_db, AppState,
};
use crate::error::{Result, TirelireError};
use crate::goal_plans::{self, PlanType, PlanUpdate};
use crate::goals::{self, GoalUpdate};
use crate::recurring::{self, Frequency, RecurringInput, RecurringUpdate};
use crate::{session, validate};

const CRON_HEADER: &str = "x-cron-secret";

fn now() -> chrono::NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

fn optional_bool(data: &Value, key: &str) -> Option<bool> {
    data.get(key).filter(|v| !v.is_null()).map(|v| validate::boolean(Some(v)))
}

// ---------------------------------------------------------------------------
// Goals
// ---------------------------------------------------------------------------

pub async fn list_goals(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>> {
    let ctx = require_auth(&state, &headers).await?;
    let list = with_db(&state, move |conn| goals::list_goals(conn, ctx.user_id)).await?;
    ok(json!({"goals": list}))
}

pub async fn create_goal(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let name = text(&data, "nom");
    let target = validate::required_float(data.get("montant_objectif"), "montant_objectif")?;
    let automatic = validate::boolean(data.get("automatique"));
    let goal = with_db(&state, move |conn| goals::create_goal(conn, ctx.user_id, &name, target, automatic)).await?;
    ok(json!({"goal": goal}))
}

pub async fn update_goal(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let goal_id = validate::required_int(data.get("id_objectif"), "id_objectif")?;
    let update = GoalUpdate {
        amount: validate::float(data.get("montant"), "montant", true)?,
        subcategory_id: validate::int(data.get("id_subcategory"), "id_subcategory", true)?,
        automatic: optional_bool(&data, "automatique"),
    };
    with_db(&state, move |conn| goals::update_goal(conn, ctx.user_id, goal_id, &update)).await?;
    ok(json!({"id_objectif": goal_id}))
}

pub async fn deposit(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let goal_id = validate::required_int(data.get("goal_id"), "goal_id")?;
    let amount = validate::required_float(data.get("montant"), "montant")?;
    let date = validate::date(data.get("date"), "date", true)?;
    let notes = validate::string(data.get("notes"), "notes", 0, 1000, true)?;
    let id = with_db(&state, move |conn| {
        goals::deposit(conn, ctx.user_id, goal_id, amount, date.as_deref(), notes.as_deref())
    })
    .await?;
    ok(json!({"id_transaction": id}))
}

pub async fn withdraw(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let goal_id = validate::required_int(data.get("goal_id"), "goal_id")?;
    let amount = validate::required_float(data.get("montant"), "montant")?;
    let date = validate::date(data.get("date"), "date", true)?;
    let notes = validate::string(data.get("notes"), "notes", 0, 1000, true)?;
    let id = with_db(&state, move |conn| {
        goals::withdraw(conn, ctx.user_id, goal_id, amount, date.as_deref(), notes.as_deref())
    })
    .await?;
    ok(json!({"id_transaction": id}))
}

pub async fn goal_transactions(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_auth(&state, &headers).await?;
    let goal_id = validate::required_int(data.get("projet_id"), "projet_id")?;
    let list = with_db(&state, move |conn| goals::goal_transactions(conn, ctx.user_id, goal_id)).await?;
    ok(json!({"transactions": list}))
}

pub async fn reached_goals(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>> {
    let ctx = require_auth(&state, &headers).await?;
    let list = with_db(&state, move |conn| goals::list_reached(conn, ctx.user_id)).await?;
    ok(json!({"goals": list}))
}

pub async fn delete_goal() -> TirelireError {
    TirelireError::Gone("La suppression d'objectif n'est plus disponible".to_string())
}

// ---------------------------------------------------------------------------
// Goal plans
// ---------------------------------------------------------------------------

pub async fn list_plans(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>> {
    let ctx = require_auth(&state, &headers).await?;
    let list = with_db(&state, move |conn| goal_plans::list_active(conn, ctx.user_id)).await?;
    ok(json!({"plans": list}))
}

pub async fn add_plan(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let goal_id = validate::required_int(data.get("goal_id"), "goal_id")?;
    let plan_type: PlanType = text(&data, "type").parse()?;
    let amount = validate::float(data.get("amount"), "amount", true)?;
    let percent = validate::float(data.get("percent"), "percent", true)?;
    let schedule_day = validate::int(data.get("schedule_day"), "schedule_day", true)?;
    let id = with_db(&state, move |conn| {
        goal_plans::add_plan(conn, ctx.user_id, goal_id, plan_type, amount, percent, schedule_day)
    })
    .await?;
    ok(json!({"id": id}))
}

pub async fn update_plan(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let plan_id = validate::required_int(data.get("id"), "id")?;
    let update = PlanUpdate {
        plan_type: opt_text(&data, "type").map(|t| t.parse()).transpose()?,
        amount: validate::float(data.get("amount"), "amount", true)?,
        percent: validate::float(data.get("percent"), "percent", true)?,
        schedule_day: validate::int(data.get("schedule_day"), "schedule_day", true)?,
        active: optional_bool(&data, "active"),
    };
    with_db(&state, move |conn| goal_plans::update_plan(conn, ctx.user_id, plan_id, &update)).await?;
    ok(json!({"id": plan_id}))
}

pub async fn delete_plan(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let plan_id = validate::required_int(data.get("id"), "id")?;
    with_db(&state, move |conn| goal_plans::delete_plan(conn, ctx.user_id, plan_id)).await?;
    ok(json!({"id": plan_id}))
}

pub async fn run_plans(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let runs = with_db(&state, move |conn| goal_plans::run_plans(conn, ctx.user_id, now())).await?;
    ok(json!({"runs": runs}))
}

// ---------------------------------------------------------------------------
// Recurring plans
// ---------------------------------------------------------------------------

pub async fn list_recurring(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>> {
    let ctx = require_auth(&state, &headers).await?;
    let list = with_db(&state, move |conn| recurring::list_recurring(conn, ctx.user_id)).await?;
    ok(json!({"plans": list}))
}

pub async fn add_recurring(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let input = RecurringInput::from_json(&data)?;
    let id = with_db(&state, move |conn| recurring::add_recurring(conn, ctx.user_id, &input, now())).await?;
    ok(json!({"id": id}))
}

pub async fn update_recurring(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let plan_id = validate::required_int(data.get("id"), "id")?;
    let end_date = match data.get("end_date") {
        None => None,
        Some(v) => Some(validate::date(Some(v), "end_date", true)?),
    };
    let update = RecurringUpdate {
        active: optional_bool(&data, "active"),
        amount: validate::float(data.get("amount"), "amount", true)?,
        notes: validate::string(data.get("notes"), "notes", 0, 1000, true)?,
        end_date,
        frequency: opt_text(&data, "frequency").map(|f| Frequency::parse_lenient(&f)),
        interval: validate::int(data.get("interval"), "interval", true)?,
    };
    with_db(&state, move |conn| recurring::update_recurring(conn, ctx.user_id, plan_id, &update)).await?;
    ok(json!({"id": plan_id}))
}

pub async fn delete_recurring(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let plan_id = validate::required_int(data.get("id"), "id")?;
    with_db(&state, move |conn| recurring::delete_recurring(conn, ctx.user_id, plan_id)).await?;
    ok(json!({"id": plan_id}))
}

/// Cron callers run every user; a logged-in user may force a run for
/// themselves.
pub async fn run_recurring(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>> {
    let provided = params.get("cron_secret").cloned().or_else(|| {
        headers
            .get(CRON_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });
    let cron_ok = match (provided, state.settings.effective_cron_secret()) {
        (Some(given), Some(expected)) => session::constant_time_eq(given.as_bytes(), expected.as_bytes()),
        _ => false,
    };

    if cron_ok {
        let results = with_db(&state, |conn| recurring::process_all(conn, now())).await?;
        let created: usize = results.iter().map(|(_, occ)| occ.len()).sum();
        info!(users = results.len(), created, "cron recurring run");
        let per_user: Vec<Value> = results
            .into_iter()
            .map(|(user_id, occurrences)| json!({"user_id": user_id, "created": occurrences}))
            .collect();
        return ok(json!({"mode": "cron", "created_count": created, "results": per_user}));
    }

    let Some(session) = current_session(&state, &headers).await? else {
        return Err(TirelireError::Unauthenticated);
    };
    let Some(user_id) = session.user_id else {
        return Err(TirelireError::Unauthenticated);
    };
    if params.get("force").map(String::as_str) != Some("1") {
        return Ok(Json(json!({"success": false, "error": "runner_disabled"})));
    }
    session::verify_csrf(&session, csrf_from(&headers, None).as_deref())?;
    let created = with_db(&state, move |conn| recurring::process_for_user(conn, user_id, now())).await?;
    ok(json!({"mode": "user", "created_count": created.len(), "created": created}))
}
