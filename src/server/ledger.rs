use std::collections::HashMap;
use std::path::PathBuf;

use axum::{
    body::Bytes,
    extract::{Multipart, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Datelike;
use serde_json::{json, Value};

use super::{
    ok, paris_today, parse_body, query_i64, read_upload, require_auth, require_csrf, text, with_db, AppState,
};
use crate::budgets::{self, BudgetQuery};
use crate::convert::{self, Target};
use crate::error::{invalid, Result};
use crate::transactions::{self, TransactionInput};
use crate::{stats, uploads, validate};

const DEFAULT_TOP_CATEGORIES: i64 = 5;
const DEFAULT_PROJECTION_MONTHS: i64 = 6;

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

pub async fn list_transactions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>> {
    let ctx = require_auth(&state, &headers).await?;
    let q = params.get("q").map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let list = with_db(&state, move |conn| {
        transactions::list_transactions(conn, ctx.user_id, q.as_deref())
    })
    .await?;
    ok(json!({"transactions": list}))
}

pub async fn add_transaction(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let input = TransactionInput::from_json(&data)?;
    let id = with_db(&state, move |conn| transactions::add_transaction(conn, ctx.user_id, &input)).await?;
    ok(json!({"id_transaction": id}))
}

pub async fn update_transaction(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let id = validate::required_int(data.get("id_transaction"), "id_transaction")?;
    let input = TransactionInput::from_json(&data)?;
    with_db(&state, move |conn| transactions::update_transaction(conn, ctx.user_id, id, &input)).await?;
    ok(json!({"id_transaction": id}))
}

pub async fn delete_transaction(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let id = validate::required_int(data.get("id_transaction"), "id_transaction")?;
    let paths = with_db(&state, move |conn| transactions::delete_transaction(conn, ctx.user_id, id)).await?;
    let removed = uploads::remove_files(&PathBuf::from(&state.settings.data_dir), &paths);
    ok(json!({"files_removed": removed}))
}

pub async fn delete_all(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let (deleted, paths) = with_db(&state, move |conn| transactions::delete_all(conn, ctx.user_id)).await?;
    let removed = uploads::remove_files(&PathBuf::from(&state.settings.data_dir), &paths);
    ok(json!({"deleted": deleted, "files_removed": removed}))
}

pub async fn recurring_occurrences(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>> {
    let ctx = require_auth(&state, &headers).await?;
    let list = with_db(&state, move |conn| transactions::list_recurring_occurrences(conn, ctx.user_id)).await?;
    ok(json!({"transactions": list}))
}

pub async fn upload_invoice(State(state): State<AppState>, headers: HeaderMap, multipart: Multipart) -> Result<Json<Value>> {
    let upload = read_upload(multipart).await?;
    let ctx = require_csrf(&state, &headers, &upload.fields).await?;
    let transaction_id = validate::required_int(upload.fields.get("transaction_id"), "transaction_id")?;
    let (name, bytes) = upload.file.ok_or_else(|| invalid("Fichier manquant"))?;
    let data_dir = PathBuf::from(&state.settings.data_dir);
    let max = state.settings.max_invoice_bytes;

    let stored = with_db(&state, move |conn| {
        uploads::attach_invoice(conn, &data_dir, ctx.user_id, transaction_id, &name, &bytes, max)
    })
    .await?;
    ok(json!({"file": stored}))
}

// ---------------------------------------------------------------------------
// Budgets
// ---------------------------------------------------------------------------

pub async fn budgets(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_auth(&state, &headers).await?;
    let query = BudgetQuery::from_json(&data);
    let today = paris_today();
    let report = with_db(&state, move |conn| budgets::compute_budgets(conn, ctx.user_id, &query, today)).await?;
    ok(report)
}

pub async fn set_category_budget(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let category_id = validate::required_int(data.get("category_id"), "category_id")?;
    let subcategory_id = validate::int(data.get("subcategory_id"), "subcategory_id", true)?;
    let year = validate::required_int(data.get("year"), "year")?;
    let month = validate::required_int(data.get("month"), "month")?;
    let amount = validate::required_float(data.get("amount"), "amount")?;
    let id = with_db(&state, move |conn| {
        budgets::upsert_category_budget(conn, ctx.user_id, category_id, subcategory_id, year, month, amount)
    })
    .await?;
    ok(json!({"id": id}))
}

pub async fn get_category_budget(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_auth(&state, &headers).await?;
    let category_id = validate::required_int(data.get("category_id"), "category_id")?;
    let subcategory_id = validate::int(data.get("subcategory_id"), "subcategory_id", true)?;
    let year = validate::required_int(data.get("year"), "year")?;
    let month = validate::required_int(data.get("month"), "month")?;
    let amount = with_db(&state, move |conn| {
        budgets::get_category_budget(conn, ctx.user_id, category_id, year, month, subcategory_id)
    })
    .await?;
    ok(json!({"amount": amount}))
}

pub async fn set_monthly_goal(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let year = validate::required_int(data.get("period_year"), "period_year")?;
    let month = validate::required_int(data.get("period_month"), "period_month")?;
    let target = validate::required_float(data.get("target_amount"), "target_amount")?;
    let rollover = validate::boolean(data.get("rollover_enabled"));
    let goal = with_db(&state, move |conn| {
        budgets::set_monthly_goal(conn, ctx.user_id, year, month, target, rollover)
    })
    .await?;
    ok(json!({"goal": goal}))
}

pub async fn current_monthly_goal(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_auth(&state, &headers).await?;
    let today = paris_today();
    let year = validate::int(data.get("year"), "year", true)?.unwrap_or(i64::from(today.year()));
    let month = validate::int(data.get("month"), "month", true)?.unwrap_or(i64::from(today.month()));
    let goal = with_db(&state, move |conn| budgets::monthly_goal(conn, ctx.user_id, year, month)).await?;
    ok(json!({"goal": goal}))
}

// ---------------------------------------------------------------------------
// Currency conversion
// ---------------------------------------------------------------------------

pub async fn convert_currency(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    if !validate::boolean(data.get("confirm")) {
        return Err(invalid("Confirmation requise"));
    }
    let target = Target::parse(&text(&data, "target"))?;
    let report = with_db(&state, move |conn| convert::convert_user(conn, ctx.user_id, target)).await?;
    ok(report)
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

pub async fn stats_evolution(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>> {
    let ctx = require_auth(&state, &headers).await?;
    let list = with_db(&state, move |conn| transactions::list_transactions(conn, ctx.user_id, None)).await?;
    ok(json!({"points": stats::monthly_evolution(&list, paris_today())}))
}

pub async fn stats_categories(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>> {
    let ctx = require_auth(&state, &headers).await?;
    let top = query_i64(&params, "top").unwrap_or(DEFAULT_TOP_CATEGORIES).clamp(1, 50) as usize;
    let list = with_db(&state, move |conn| transactions::list_transactions(conn, ctx.user_id, None)).await?;
    ok(json!({"categories": stats::category_breakdown(&list, top)}))
}

pub async fn stats_savings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>> {
    let ctx = require_auth(&state, &headers).await?;
    let months = query_i64(&params, "months").unwrap_or(DEFAULT_PROJECTION_MONTHS).clamp(0, 36) as u32;
    let list = with_db(&state, move |conn| transactions::list_transactions(conn, ctx.user_id, None)).await?;
    ok(json!({"points": stats::monthly_savings(&list, paris_today(), months)}))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;

    use crate::server::test_support::*;

    const PDF: &[u8] = b"%PDF-1.4\n%test";

    fn tx(date: &str, ty: &str, amount: f64) -> serde_json::Value {
        json!({"Date": date, "Type": ty, "Montant": amount, "category_id": 1})
    }

    #[tokio::test]
    async fn test_transaction_lifecycle() {
        let app = app();
        let client = app.login_as("l@exemple.fr").await;

        let (status, _) = app.post(&client, "/api/transactions", json!({"Type": "expense"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = app
            .post(
                &client,
                "/api/transactions",
                json!({"Date": "2024-03-01", "Type": "dépense", "Montant": -42.5, "Notes": "Loyer mars", "category_id": 1}),
            )
            .await;
        assert_eq!(body["success"], true);
        let id = body["id_transaction"].as_i64().unwrap();

        let (_, body) = app.get(&client, "/api/transactions?q=loyer").await;
        let list = body["transactions"].as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["amount"], 42.5);
        assert_eq!(list[0]["type_code"], "expense");

        let (status, _) = app
            .post(
                &client,
                "/api/transactions/update",
                json!({"id_transaction": id, "Date": "2024-03-02", "Type": "expense", "Montant": 40.0}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let other = app.login_as("intrus@exemple.fr").await;
        let (status, _) = app
            .post(&other, "/api/transactions/delete", json!({"id_transaction": id}))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app
            .post(&client, "/api/transactions/delete", json!({"id_transaction": id}))
            .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = app
            .post(&client, "/api/transactions/delete", json!({"id_transaction": id}))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invoice_upload() {
        let app = app();
        let client = app.login_as("f@exemple.fr").await;
        let (_, body) = app
            .post(&client, "/api/transactions", tx("2024-03-01", "expense", 12.0))
            .await;
        let id = body["id_transaction"].as_i64().unwrap();

        let boundary = "XBOUNDARY";
        let mut payload = Vec::new();
        payload.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"transaction_id\"\r\n\r\n{id}\r\n\
                 --{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"ticket.pdf\"\r\n\
                 Content-Type: application/pdf\r\n\r\n"
            )
            .as_bytes(),
        );
        payload.extend_from_slice(PDF);
        payload.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let req = Request::builder()
            .method("POST")
            .uri("/api/transactions/invoice")
            .header("content-type", format!("multipart/form-data; boundary={boundary}"))
            .header("cookie", client.cookie.clone().unwrap())
            .header("x-csrf-token", client.csrf.clone().unwrap())
            .body(Body::from(payload))
            .unwrap();
        let (status, body, _) = app.send(req).await;
        assert_eq!(status, StatusCode::OK);
        let path = body["file"]["path"].as_str().unwrap().to_string();
        assert!(path.starts_with("uploads/invoices/"));

        let (_, body) = app.get(&client, "/api/transactions").await;
        assert_eq!(body["transactions"][0]["invoices"], path.as_str());
    }

    #[tokio::test]
    async fn test_budget_and_monthly_goal_endpoints() {
        let app = app();
        let client = app.login_as("g@exemple.fr").await;
        let (_, body) = app
            .post(
                &client,
                "/api/budgets/category",
                json!({"category_id": 2, "year": 2024, "month": 5, "amount": 300}),
            )
            .await;
        assert_eq!(body["success"], true);
        let (_, body) = app
            .post(&client, "/api/budgets/category/get", json!({"category_id": 2, "year": 2024, "month": 5}))
            .await;
        assert_eq!(body["amount"], 300.0);

        let (_, body) = app
            .post(&client, "/api/budgets", json!({"annee": 2024, "mois": 5, "filtreType": "income"}))
            .await;
        assert_eq!(body["success"], true);
        assert!(body["subcategories"].as_array().unwrap().is_empty());

        app.post(
            &client,
            "/api/monthly-goals",
            json!({"period_year": 2024, "period_month": 5, "target_amount": 150, "rollover_enabled": true}),
        )
        .await;
        let (_, body) = app
            .post(&client, "/api/monthly-goals/current", json!({"year": 2024, "month": 5}))
            .await;
        assert_eq!(body["goal"]["target_amount"], 150.0);
        assert_eq!(body["goal"]["rollover_enabled"], true);
    }

    #[tokio::test]
    async fn test_convert_requires_confirmation() {
        let app = app();
        let client = app.login_as("h@exemple.fr").await;
        app.post(&client, "/api/transactions", tx("2024-03-01", "expense", 10.0)).await;

        let (status, _) = app.post(&client, "/api/convert-currency", json!({"target": "XOF"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = app
            .post(&client, "/api/convert-currency", json!({"target": "XOF", "confirm": true}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["converted_to"], "XOF");
        assert_eq!(body["converted_rows"], 1);

        let (_, body) = app.get(&client, "/api/transactions").await;
        assert_eq!(body["transactions"][0]["amount"], 6559.57);
    }

    #[tokio::test]
    async fn test_stats_endpoints() {
        let app = app();
        let client = app.login_as("s@exemple.fr").await;
        app.post(&client, "/api/transactions", tx("2024-01-10", "expense", 100.0)).await;
        app.post(
            &client,
            "/api/transactions",
            json!({"Date": "2024-01-05", "Type": "income", "Montant": 1500, "category_id": 9}),
        )
        .await;

        let (_, body) = app.get(&client, "/api/stats/evolution").await;
        let points = body["points"].as_array().unwrap();
        assert_eq!(points[0]["month"], "2024-01");
        assert_eq!(points[0]["income"], 1500.0);

        let (_, body) = app.get(&client, "/api/stats/categories?top=3").await;
        assert_eq!(body["categories"][0]["amount"], 100.0);

        let (_, body) = app.get(&client, "/api/stats/savings?months=2").await;
        let points = body["points"].as_array().unwrap();
        assert_eq!(points[0]["real"], 1400.0);
        assert_eq!(points.iter().filter(|p| p["real"].is_null()).count(), 2);
    }
}
