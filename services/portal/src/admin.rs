//! Operator routes, nested under `/admin`

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::{
    AppState,
    error::{ApiError, ApiResult},
    middleware::{ADMIN_COOKIE, AdminActor, require_admin},
    models::{FinalizeHint, SessionFilter, SessionState},
};

const MAX_PAGE: u32 = 500;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    pub state: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub include_deleted: Option<bool>,
}

impl SessionQuery {
    fn into_filter(self) -> ApiResult<SessionFilter> {
        let defaults = SessionFilter::default();
        let state = match self.state.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(raw.parse::<SessionState>().map_err(ApiError::BadRequest)?),
        };
        Ok(SessionFilter {
            state,
            limit: self.limit.unwrap_or(defaults.limit).clamp(1, MAX_PAGE),
            offset: self.offset.unwrap_or(0),
            include_deleted: self.include_deleted.unwrap_or(false),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct NoteRequest {
    pub note: String,
}

#[derive(Debug, Deserialize)]
pub struct CaptureRequest {
    pub amount_cents: i64,
}

/// Create the admin router; every route but login and logout needs credentials
pub fn create_router(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/:token", get(get_session))
        .route("/sessions/:token/note", post(set_note))
        .route("/sessions/:token/soft_delete", post(soft_delete))
        .route("/sessions/:token/void", post(void_session))
        .route("/sessions/:token/capture", post(capture_session))
        .route_layer(middleware::from_fn_with_state(state, require_admin));

    Router::new()
        .route("/login", post(login))
        .route("/logout", post(logout))
        .merge(protected)
}

fn session_cookie(value: String) -> Cookie<'static> {
    Cookie::build((ADMIN_COOKIE, value))
        .path("/admin")
        .http_only(true)
        .same_site(SameSite::Strict)
        .build()
}

/// Exchange credentials for a session cookie
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let auth = state.admin.as_ref().ok_or(ApiError::Unauthorized)?;
    if !auth.check_credentials(&payload.username, &payload.password) {
        warn!("Failed admin login");
        return Err(ApiError::Unauthorized);
    }

    let token = auth.issue()?;
    info!(username = %payload.username, "Admin logged in");
    Ok((jar.add(session_cookie(token)), Json(json!({"status": "ok"}))))
}

pub async fn logout(jar: CookieJar) -> impl IntoResponse {
    (
        jar.remove(Cookie::build(ADMIN_COOKIE).path("/admin")),
        Json(json!({"status": "ok"})),
    )
}

/// List sessions, newest first
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> ApiResult<impl IntoResponse> {
    let filter = query.into_filter()?;
    let sessions = state.engine.list(&filter).await?;
    Ok(Json(json!({
        "sessions": sessions,
        "limit": filter.limit,
        "offset": filter.offset,
    })))
}

/// A session with its audit trail
pub async fn get_session(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session = state.engine.get(&token).await?;
    let audit = state.engine.audit_trail(&token).await?;
    Ok(Json(json!({
        "session": session,
        "audit": audit,
    })))
}

pub async fn set_note(
    State(state): State<AppState>,
    Extension(AdminActor(actor)): Extension<AdminActor>,
    Path(token): Path<String>,
    Json(payload): Json<NoteRequest>,
) -> ApiResult<impl IntoResponse> {
    let session = state.engine.annotate(&token, &payload.note, &actor).await?;
    Ok(Json(session))
}

pub async fn soft_delete(
    State(state): State<AppState>,
    Extension(AdminActor(actor)): Extension<AdminActor>,
    Path(token): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session = state.engine.soft_delete(&token, &actor).await?;
    Ok(Json(session))
}

/// Release the hold without charging
pub async fn void_session(
    State(state): State<AppState>,
    Extension(AdminActor(actor)): Extension<AdminActor>,
    Path(token): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session = state
        .engine
        .finalize(&token, FinalizeHint::Cancelled, &actor)
        .await?;
    Ok(Json(session))
}

/// Settle the hold for the given amount
pub async fn capture_session(
    State(state): State<AppState>,
    Extension(AdminActor(actor)): Extension<AdminActor>,
    Path(token): Path<String>,
    Json(payload): Json<CaptureRequest>,
) -> ApiResult<impl IntoResponse> {
    let session = state
        .engine
        .finalize(&token, FinalizeHint::from_final_amount(payload.amount_cents), &actor)
        .await?;
    Ok(Json(session))
}
