use std::path::PathBuf;

use axum::{
    body::Bytes,
    extract::{Multipart, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};
use tracing::info;

use super::{
    current_session, expired_cookie, ok, parse_body, read_upload, require_anonymous_csrf, require_auth,
    require_csrf, runner, session_cookie, text, with_db, AppState,
};
use crate::error::{invalid, Result};
use crate::{auth, session, uploads, validate};

pub async fn csrf_token(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse> {
    if let Some(existing) = current_session(&state, &headers).await? {
        let body = Json(json!({"success": true, "csrf_token": existing.csrf_token}));
        return Ok(body.into_response());
    }
    let fresh = with_db(&state, |conn| session::create_session(conn, None)).await?;
    Ok((
        [(header::SET_COOKIE, session_cookie(&fresh.id))],
        Json(json!({"success": true, "csrf_token": fresh.csrf_token})),
    )
        .into_response())
}

pub async fn register(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    require_anonymous_csrf(&state, &headers, &data).await?;
    let email = text(&data, "email");
    let password = data.get("password").and_then(Value::as_str).unwrap_or_default().to_string();
    let first_name = text(&data, "first_name");
    let last_name = text(&data, "last_name");

    let user = with_db(&state, move |conn| {
        auth::register(conn, &email, &password, &first_name, &last_name)
    })
    .await?;
    info!(user_id = user.id, "user registered");
    ok(json!({"user": user}))
}

pub async fn login(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<impl IntoResponse> {
    let data = parse_body(&body)?;
    let anonymous = require_anonymous_csrf(&state, &headers, &data).await?;
    let email = text(&data, "email");
    let password = data.get("password").and_then(Value::as_str).unwrap_or_default().to_string();
    if email.is_empty() || password.is_empty() {
        return Err(invalid("Champs manquants"));
    }

    let (user, fresh) = with_db(&state, move |conn| {
        let user = auth::login(conn, &email, &password)?;
        let fresh = session::regenerate(conn, Some(&anonymous.id), user.id)?;
        Ok((user, fresh))
    })
    .await?;
    info!(user_id = user.id, "user logged in");
    if state.settings.recurring_interval_secs > 0 {
        runner::schedule_user(state.clone(), user.id);
    }

    Ok((
        [(header::SET_COOKIE, session_cookie(&fresh.id))],
        Json(json!({"success": true, "user": user, "csrf_token": fresh.csrf_token})),
    ))
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<impl IntoResponse> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let id = ctx.session.id.clone();
    with_db(&state, move |conn| session::destroy(conn, &id)).await?;
    Ok(([(header::SET_COOKIE, expired_cookie())], Json(json!({"success": true}))))
}

pub async fn session_info(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>> {
    let user_id = current_session(&state, &headers).await?.and_then(|s| s.user_id);
    let user = match user_id {
        Some(id) => with_db(&state, move |conn| auth::get_user(conn, id)).await.ok(),
        None => None,
    };
    Ok(Json(match user {
        Some(user) => json!({"success": true, "authenticated": true, "user": user}),
        None => json!({"success": true, "authenticated": false}),
    }))
}

pub async fn profile(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>> {
    let ctx = require_auth(&state, &headers).await?;
    let user = with_db(&state, move |conn| auth::get_user(conn, ctx.user_id)).await?;
    ok(json!({"user": user}))
}

pub async fn change_password(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let current = data.get("current_password").and_then(Value::as_str).unwrap_or_default().to_string();
    let new = data.get("new_password").and_then(Value::as_str).unwrap_or_default().to_string();
    if current.is_empty() || new.is_empty() {
        return Err(invalid("Champs manquants"));
    }
    with_db(&state, move |conn| auth::change_password(conn, ctx.user_id, &current, &new)).await?;
    ok(json!({}))
}

pub async fn preferences(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    if text(&data, "currency").is_empty() {
        return Err(invalid("Champs manquants"));
    }
    let currency = validate::currency(data.get("currency"))?;
    let saved = currency.clone();
    with_db(&state, move |conn| auth::set_currency(conn, ctx.user_id, &saved)).await?;
    ok(json!({"currency": currency}))
}

pub async fn update_profile(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
    let data = parse_body(&body)?;
    let ctx = require_csrf(&state, &headers, &data).await?;
    let name = text(&data, "name");
    let email = text(&data, "email");
    let user = with_db(&state, move |conn| auth::update_profile(conn, ctx.user_id, &name, &email)).await?;
    ok(json!({"user": user}))
}

pub async fn avatar(State(state): State<AppState>, headers: HeaderMap, multipart: Multipart) -> Result<Json<Value>> {
    let upload = read_upload(multipart).await?;
    let ctx = require_csrf(&state, &headers, &upload.fields).await?;
    let (name, bytes) = upload.file.ok_or_else(|| invalid("Fichier manquant"))?;
    let data_dir = PathBuf::from(&state.settings.data_dir);
    let max = state.settings.max_avatar_bytes;

    let stored = with_db(&state, move |conn| {
        uploads::replace_avatar(conn, &data_dir, ctx.user_id, &name, &bytes, max)
    })
    .await?;
    ok(json!({"photo": stored.path, "file": stored}))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::server::test_support::*;

    #[tokio::test]
    async fn test_register_login_session_flow() {
        let app = app();
        let anon = app.anonymous().await;
        assert!(anon.cookie.is_some());
        assert_eq!(anon.csrf.as_ref().map(String::len), Some(64));

        let (status, body) = app.get(&anon, "/api/session").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["authenticated"], false);

        let client = app.login_as("marie@exemple.fr").await;
        assert_ne!(client.cookie, anon.cookie);
        assert_ne!(client.csrf, anon.csrf);

        let (_, body) = app.get(&client, "/api/session").await;
        assert_eq!(body["authenticated"], true);
        assert_eq!(body["user"]["email"], "marie@exemple.fr");

        // the pre-login session is gone
        let (_, body) = app.get(&anon, "/api/session").await;
        assert_eq!(body["authenticated"], false);
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_and_weak_password() {
        let app = app();
        let anon = app.anonymous().await;
        let (status, _) = app
            .post(&anon, "/api/register", json!({"email": "a@exemple.fr", "password": "court"}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let creds = json!({"email": "a@exemple.fr", "password": "motdepasse1"});
        let (status, _) = app.post(&anon, "/api/register", creds.clone()).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = app.post(&anon, "/api/register", creds).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_login_with_wrong_password() {
        let app = app();
        app.login_as("b@exemple.fr").await;
        let anon = app.anonymous().await;
        let (status, body) = app
            .post(&anon, "/api/login", json!({"email": "b@exemple.fr", "password": "mauvais000"}))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_mutations_require_csrf() {
        let app = app();
        let client = app.login_as("c@exemple.fr").await;
        let no_token = Client {
            cookie: client.cookie.clone(),
            csrf: None,
        };
        let (status, body) = app
            .post(&no_token, "/api/user/preferences", json!({"currency": "XOF"}))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "CSRF token invalid or missing");

        // token in the body is accepted too
        let (status, body) = app
            .post(
                &no_token,
                "/api/user/preferences",
                json!({"currency": "xof", "csrf_token": client.csrf.clone().unwrap()}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["currency"], "XOF");

        let (_, body) = app.get(&client, "/api/user").await;
        assert_eq!(body["user"]["currency"], "XOF");
    }

    #[tokio::test]
    async fn test_profile_and_password_change() {
        let app = app();
        let client = app.login_as("d@exemple.fr").await;
        let (status, body) = app
            .post(&client, "/api/user/profile", json!({"name": "Awa Diop Ndiaye", "email": "awa@exemple.fr"}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["first_name"], "Awa");
        assert_eq!(body["user"]["last_name"], "Diop Ndiaye");

        let (status, _) = app
            .post(
                &client,
                "/api/user/password",
                json!({"current_password": "faux-faux", "new_password": "nouveau-mdp"}),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = app
            .post(
                &client,
                "/api/user/password",
                json!({"current_password": "motdepasse1", "new_password": "nouveau-mdp"}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_logout_ends_session() {
        let app = app();
        let client = app.login_as("e@exemple.fr").await;
        let (status, _) = app.post(&client, "/api/logout", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = app.get(&client, "/api/user").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
