//! JSON API under `/api`. Handlers open a connection per request on the
//! blocking pool; sessions and CSRF tokens live in SQLite.

mod account;
mod catalog;
mod ledger;
mod receipts;
pub mod runner;
mod savings;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::{dates, db};
use crate::error::{invalid, Result, TirelireError};
use crate::models::DeleteOutcome;
use crate::session::{self, Session, COOKIE_NAME};
use crate::settings::Settings;

const CSRF_HEADER: &str = "x-csrf-token";
const SERVER_ERROR: &str = "Erreur serveur";
/// Room for multipart framing on top of the largest allowed file.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

impl TirelireError {
    fn status(&self) -> StatusCode {
        match self {
            TirelireError::Validation(_) | TirelireError::InsufficientFunds { .. } => StatusCode::BAD_REQUEST,
            TirelireError::Unauthenticated | TirelireError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            TirelireError::Csrf | TirelireError::Forbidden => StatusCode::FORBIDDEN,
            TirelireError::NotFound(_) | TirelireError::UnknownUser(_) => StatusCode::NOT_FOUND,
            TirelireError::Conflict(_) => StatusCode::CONFLICT,
            TirelireError::Duplicate(_) => StatusCode::OK,
            TirelireError::Gone(_) => StatusCode::GONE,
            TirelireError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            TirelireError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            TirelireError::Db(_)
            | TirelireError::Io(_)
            | TirelireError::Csv(_)
            | TirelireError::Json(_)
            | TirelireError::Settings(_)
            | TirelireError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TirelireError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            _ if status == StatusCode::INTERNAL_SERVER_ERROR => {
                error!(error = %self, "request failed");
                json!({"success": false, "error": SERVER_ERROR})
            }
            TirelireError::InsufficientFunds { available } => {
                json!({"success": false, "error": self.to_string(), "available": available})
            }
            _ => json!({"success": false, "error": self.to_string()}),
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

/// Run `f` against a fresh connection on the blocking pool.
pub(crate) async fn with_db<T, F>(state: &AppState, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
{
    let settings = state.settings.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = db::open_from_settings(&settings)?;
        f(&mut conn)
    })
    .await
    .map_err(|e| TirelireError::Other(format!("blocking task failed: {e}")))?
}

/// Request body as JSON. An empty body reads as `{}`.
pub(crate) fn parse_body(body: &Bytes) -> Result<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(v) if v.is_object() => Ok(v),
        _ => Err(invalid("JSON invalide")),
    }
}

/// `{"success": true}` merged with the fields of `payload`.
pub(crate) fn ok<T: Serialize>(payload: T) -> Result<Json<Value>> {
    let mut value = serde_json::to_value(payload)?;
    match value.as_object_mut() {
        Some(map) => {
            map.insert("success".to_string(), Value::Bool(true));
        }
        None => value = json!({"success": true, "data": value}),
    }
    Ok(Json(value))
}

pub(crate) fn delete_outcome(outcome: DeleteOutcome) -> Json<Value> {
    match outcome {
        DeleteOutcome::Deleted { reassigned } => Json(json!({"success": true, "reassigned": reassigned})),
        DeleteOutcome::ContainsRelated(counts) => {
            Json(json!({"success": false, "error": "contains_related", "counts": counts}))
        }
    }
}

pub(crate) fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == COOKIE_NAME && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

pub(crate) fn session_cookie(id: &str) -> String {
    format!("{COOKIE_NAME}={id}; Path=/; HttpOnly; SameSite=Lax")
}

pub(crate) fn expired_cookie() -> String {
    format!("{COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}

pub(crate) async fn current_session(state: &AppState, headers: &HeaderMap) -> Result<Option<Session>> {
    let Some(id) = session_id(headers) else {
        return Ok(None);
    };
    with_db(state, move |conn| session::load_session(conn, &id)).await
}

/// Token from the `X-CSRF-Token` header, else the `csrf_token` body field.
pub(crate) fn csrf_from(headers: &HeaderMap, body: Option<&Value>) -> Option<String> {
    headers
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            body.and_then(|b| b.get("csrf_token"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
}

/// String field, trimmed, empty when absent.
pub(crate) fn text(data: &Value, key: &str) -> String {
    match data.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

pub(crate) fn opt_text(data: &Value, key: &str) -> Option<String> {
    Some(text(data, key)).filter(|s| !s.is_empty())
}

pub(crate) fn query_i64(params: &HashMap<String, String>, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.trim().parse().ok())
}

pub(crate) fn paris_today() -> NaiveDate {
    dates::utc_to_paris(chrono::Utc::now().naive_utc()).date()
}

/// Multipart form: text fields as a JSON object plus the `file` part.
pub(crate) struct Upload {
    pub fields: Value,
    pub file: Option<(String, Bytes)>,
}

pub(crate) async fn read_upload(mut multipart: Multipart) -> Result<Upload> {
    let mut fields = serde_json::Map::new();
    let mut file = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let file_name = field.file_name().unwrap_or("upload").to_string();
            let bytes = field.bytes().await.map_err(multipart_error)?;
            file = Some((file_name, bytes));
        } else {
            let value = field.text().await.map_err(multipart_error)?;
            fields.insert(name, Value::String(value));
        }
    }
    Ok(Upload {
        fields: Value::Object(fields),
        file,
    })
}

fn multipart_error(e: MultipartError) -> TirelireError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        TirelireError::PayloadTooLarge
    } else {
        invalid(format!("Formulaire invalide: {}", e.body_text()))
    }
}

/// An authenticated caller.
pub(crate) struct Ctx {
    pub session: Session,
    pub user_id: i64,
}

pub(crate) async fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<Ctx> {
    match current_session(state, headers).await? {
        Some(session) => match session.user_id {
            Some(user_id) => Ok(Ctx { session, user_id }),
            None => Err(TirelireError::Unauthenticated),
        },
        None => Err(TirelireError::Unauthenticated),
    }
}

/// Authenticated caller whose request carries the session's CSRF token.
pub(crate) async fn require_csrf(state: &AppState, headers: &HeaderMap, body: &Value) -> Result<Ctx> {
    let ctx = require_auth(state, headers).await?;
    session::verify_csrf(&ctx.session, csrf_from(headers, Some(body)).as_deref())?;
    Ok(ctx)
}

/// CSRF check for requests made before login.
pub(crate) async fn require_anonymous_csrf(state: &AppState, headers: &HeaderMap, body: &Value) -> Result<Session> {
    let session = current_session(state, headers).await?.ok_or(TirelireError::Csrf)?;
    session::verify_csrf(&session, csrf_from(headers, Some(body)).as_deref())?;
    Ok(session)
}

// ---------------------------------------------------------------------------
// CORS
// ---------------------------------------------------------------------------

async fn cors(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .filter(|o| state.settings.allowed_origins.iter().any(|a| a == o))
        .and_then(|o| HeaderValue::from_str(o).ok());

    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };

    if let Some(origin) = origin {
        let h = response.headers_mut();
        h.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        h.insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        h.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        h.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, X-CSRF-Token, X-Admin-Token, Authorization"),
        );
        h.insert(header::VARY, HeaderValue::from_static("Origin"));
    }
    response
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({"success": true, "status": "ok"}))
}

async fn vault_gone() -> TirelireError {
    TirelireError::Gone("Les projets coffre ont été remplacés par les objectifs: utilisez /api/goals".to_string())
}

pub fn build_router(state: AppState) -> Router {
    let upload_limit = state.settings.max_invoice_bytes.max(state.settings.max_avatar_bytes) as usize + MULTIPART_OVERHEAD;

    Router::new()
        .route("/api/health", get(health))
        // account
        .route("/api/csrf-token", get(account::csrf_token))
        .route("/api/register", post(account::register))
        .route("/api/login", post(account::login))
        .route("/api/logout", post(account::logout))
        .route("/api/session", get(account::session_info))
        .route("/api/user", get(account::profile))
        .route("/api/user/password", post(account::change_password))
        .route("/api/user/preferences", post(account::preferences))
        .route("/api/user/profile", post(account::update_profile))
        .route("/api/user/avatar", post(account::avatar))
        // types and categories
        .route("/api/types", get(catalog::list_types).post(catalog::add_type))
        .route("/api/types/update", post(catalog::update_type))
        .route("/api/types/delete", post(catalog::delete_type))
        .route("/api/categories", get(catalog::list_categories).post(catalog::add_category))
        .route("/api/categories/update", post(catalog::update_category))
        .route("/api/categories/delete", post(catalog::delete_category))
        .route("/api/categories/search", get(catalog::search_categories))
        .route("/api/subcategories", get(catalog::list_subcategories).post(catalog::add_subcategory))
        .route("/api/subcategories/update", post(catalog::update_subcategory))
        .route("/api/subcategories/delete", post(catalog::delete_subcategory))
        // transactions, budgets, conversion, stats
        .route("/api/transactions", get(ledger::list_transactions).post(ledger::add_transaction))
        .route("/api/transactions/update", post(ledger::update_transaction))
        .route("/api/transactions/delete", post(ledger::delete_transaction))
        .route("/api/transactions/delete-all", post(ledger::delete_all))
        .route("/api/transactions/recurring", get(ledger::recurring_occurrences))
        .route("/api/transactions/invoice", post(ledger::upload_invoice))
        .route("/api/budgets", post(ledger::budgets))
        .route("/api/budgets/category", post(ledger::set_category_budget))
        .route("/api/budgets/category/get", post(ledger::get_category_budget))
        .route("/api/monthly-goals", post(ledger::set_monthly_goal))
        .route("/api/monthly-goals/current", post(ledger::current_monthly_goal))
        .route("/api/convert-currency", post(ledger::convert_currency))
        .route("/api/stats/evolution", get(ledger::stats_evolution))
        .route("/api/stats/categories", get(ledger::stats_categories))
        .route("/api/stats/savings", get(ledger::stats_savings))
        // goals, plans, recurring
        .route("/api/goals", get(savings::list_goals).post(savings::create_goal))
        .route("/api/goals/update", post(savings::update_goal))
        .route("/api/goals/deposit", post(savings::deposit))
        .route("/api/goals/withdraw", post(savings::withdraw))
        .route("/api/goals/transactions", post(savings::goal_transactions))
        .route("/api/goals/reached", get(savings::reached_goals))
        .route("/api/goals/delete", post(savings::delete_goal))
        .route("/api/goal-plans", get(savings::list_plans).post(savings::add_plan))
        .route("/api/goal-plans/update", post(savings::update_plan))
        .route("/api/goal-plans/delete", post(savings::delete_plan))
        .route("/api/goal-plans/run", post(savings::run_plans))
        .route("/api/recurring", get(savings::list_recurring).post(savings::add_recurring))
        .route("/api/recurring/update", post(savings::update_recurring))
        .route("/api/recurring/delete", post(savings::delete_recurring))
        .route("/api/recurring/run", get(savings::run_recurring).post(savings::run_recurring))
        // receipts
        .route("/api/ocr/analyze", post(receipts::analyze))
        .route("/api/ocr/feedback", post(receipts::feedback))
        .route("/api/ocr/feedback/export", get(receipts::export))
        // retired
        .route("/api/vault", any(vault_gone))
        .route("/api/vault/*rest", any(vault_gone))
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(middleware::from_fn_with_state(state.clone(), cors))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Serve
// ---------------------------------------------------------------------------

pub async fn run(settings: Settings) -> Result<()> {
    run_with_shutdown(settings, shutdown_signal()).await
}

pub async fn run_with_shutdown<F>(settings: Settings, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    std::fs::create_dir_all(&settings.data_dir)?;
    std::fs::create_dir_all(settings.uploads_dir())?;
    {
        let conn = db::open_from_settings(&settings)?;
        db::init_db(&conn)?;
    }

    let addr = format!("{}:{}", settings.host, settings.port);
    let state = AppState::new(settings);
    let runner = runner::spawn(state.clone());
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "tirelire listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            if let Some(handle) = runner {
                handle.abort();
            }
            info!("shutting down");
        })
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    pub struct TestApp {
        pub _dir: tempfile::TempDir,
        pub state: AppState,
        pub router: Router,
    }

    pub fn app() -> TestApp {
        app_with(|_| {})
    }

    pub fn app_with(configure: impl FnOnce(&mut Settings)) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings {
            data_dir: dir.path().to_string_lossy().to_string(),
            recurring_interval_secs: 0,
            ..Settings::default()
        };
        configure(&mut settings);
        let conn = db::open_from_settings(&settings).unwrap();
        db::init_db(&conn).unwrap();
        let state = AppState::new(settings);
        TestApp {
            _dir: dir,
            router: build_router(state.clone()),
            state,
        }
    }

    /// Cookie and CSRF token of a session.
    #[derive(Clone, Default)]
    pub struct Client {
        pub cookie: Option<String>,
        pub csrf: Option<String>,
    }

    impl TestApp {
        pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value, HeaderMap) {
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let headers = response.headers().clone();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, body, headers)
        }

        pub async fn get(&self, client: &Client, uri: &str) -> (StatusCode, Value) {
            let mut req = Request::builder().method("GET").uri(uri);
            if let Some(c) = &client.cookie {
                req = req.header("cookie", c);
            }
            let (status, body, _) = self.send(req.body(Body::empty()).unwrap()).await;
            (status, body)
        }

        pub async fn post(&self, client: &Client, uri: &str, body: Value) -> (StatusCode, Value) {
            let mut req = Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json");
            if let Some(c) = &client.cookie {
                req = req.header("cookie", c);
            }
            if let Some(t) = &client.csrf {
                req = req.header("x-csrf-token", t);
            }
            let (status, body, _) = self.send(req.body(Body::from(body.to_string())).unwrap()).await;
            (status, body)
        }

        /// Anonymous session with a CSRF token.
        pub async fn anonymous(&self) -> Client {
            let req = Request::builder().uri("/api/csrf-token").body(Body::empty()).unwrap();
            let (_, body, headers) = self.send(req).await;
            let cookie = headers
                .get("set-cookie")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(';').next())
                .map(str::to_string);
            Client {
                cookie,
                csrf: body["csrf_token"].as_str().map(str::to_string),
            }
        }

        /// Register and log in a user, returning the logged-in client.
        pub async fn login_as(&self, email: &str) -> Client {
            let anon = self.anonymous().await;
            let creds = serde_json::json!({"email": email, "password": "motdepasse1"});
            let (status, _) = self.post(&anon, "/api/register", creds.clone()).await;
            assert_eq!(status, StatusCode::OK);

            let mut req = Request::builder()
                .method("POST")
                .uri("/api/login")
                .header("content-type", "application/json");
            if let Some(c) = &anon.cookie {
                req = req.header("cookie", c);
            }
            if let Some(t) = &anon.csrf {
                req = req.header("x-csrf-token", t);
            }
            let (status, body, headers) = self.send(req.body(Body::from(creds.to_string())).unwrap()).await;
            assert_eq!(status, StatusCode::OK);
            Client {
                cookie: headers
                    .get("set-cookie")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.split(';').next())
                    .map(str::to_string),
                csrf: body["csrf_token"].as_str().map(str::to_string),
            }
        }

        pub fn conn(&self) -> Connection {
            db::open_from_settings(&self.state.settings).unwrap()
        }
    }
}
