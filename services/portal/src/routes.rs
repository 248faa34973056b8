//! Guest-facing routes

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
    AppState, admin,
    error::{ApiError, ApiResult},
    lifecycle::AuthorizeOutcome,
    models::{NewSession, Session, SessionState, SessionView},
    payment::{PaymentMethod, PaymentSource},
};

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub charger_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeRequest {
    pub source_id: String,
    #[serde(default)]
    pub given_name: String,
    #[serde(default)]
    pub family_name: String,
    #[serde(default)]
    pub payment_method: Option<String>,
}

/// Create the router for the portal
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/start", post(start_session))
        .route("/sessions/:token", get(get_session))
        .route("/sessions/:token/authorize", post(authorize_session));

    if state.admin.is_some() {
        router = router.nest("/admin", admin::create_router(state.clone()));
    }

    router.with_state(state)
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "ev-portal",
        "mqtt_connected": state.bus.is_connected(),
    }))
}

fn start_response(state: &AppState, session: &Session) -> serde_json::Value {
    json!({
        "session_token": session.token,
        "booking_id": session.booking_id,
        "amount_cents": session.amount_cents,
        "state": session.state,
        "square": {
            "app_id": state.square.app_id,
            "location_id": state.square.location_id,
            "sdk_url": state.square.sdk_url,
        },
    })
}

/// Book the charger and open a session
pub async fn start_session(
    State(state): State<AppState>,
    body: Option<Json<StartRequest>>,
) -> ApiResult<impl IntoResponse> {
    if !state.bus.is_connected() {
        return Err(ApiError::Unavailable(
            "Charger control is offline, please try again shortly".to_string(),
        ));
    }

    let request = body.map(|Json(r)| r).unwrap_or_default();
    let charger_id = request
        .charger_id
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| state.charger_id.clone());
    if charger_id.is_empty() {
        return Err(ApiError::BadRequest("charger_id is required".to_string()));
    }

    let offer = state.booking.request(&state.home_id, &charger_id).await?;

    // The automation layer answers a repeated request with the same booking
    if let Some(existing) = state.engine.find_by_booking(&offer.booking_id).await? {
        info!(session = existing.log_id(), "Resuming session for existing booking");
        return Ok((StatusCode::OK, Json(start_response(&state, &existing))));
    }

    let session = state
        .engine
        .create_session(NewSession {
            home_id: state.home_id.clone(),
            charger_id,
            amount_cents: offer.amount_cents,
            booking_id: Some(offer.booking_id),
        })
        .await?;

    Ok((StatusCode::CREATED, Json(start_response(&state, &session))))
}

/// Get the guest view of a session
pub async fn get_session(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session = state.engine.get(&token).await?;
    Ok(Json(SessionView::from(&session)))
}

/// The charger has answered and any void it asked for has run
fn settled(state: SessionState) -> bool {
    matches!(state, SessionState::Active | SessionState::SettleFailed) || state.is_terminal()
}

/// Place the hold, notify the charger and wait briefly for it to start
pub async fn authorize_session(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(payload): Json<AuthorizeRequest>,
) -> ApiResult<impl IntoResponse> {
    let source = PaymentSource {
        source_id: payload.source_id,
        given_name: payload.given_name,
        family_name: payload.family_name,
        method: PaymentMethod::parse(payload.payment_method.as_deref().unwrap_or("CARD")),
    };

    // Subscribe first so an immediate acceptance is not missed
    let mut events = state.engine.subscribe();

    let session = match state.engine.authorize(&token, source).await? {
        AuthorizeOutcome::Authorized(session) => session,
        AuthorizeOutcome::Declined { reason } => return Err(ApiError::PaymentDeclined(reason)),
    };

    if session.state == SessionState::Authorized {
        state.engine.request_activation(&token).await?;

        let deadline = Instant::now() + state.response_timeout;
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(event)) if event.token == token && settled(event.state) => break,
                Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Err(RecvError::Closed)) | Err(_) => {
                    warn!(session = session.log_id(), "Charger did not confirm within {:?}", state.response_timeout);
                    break;
                }
            }
        }
    }

    let session = state.engine.get(&token).await?;
    let status = match session.state {
        SessionState::Authorized => "pending",
        SessionState::Active | SessionState::Captured => "active",
        SessionState::Voided => {
            return Err(ApiError::BadGateway(
                "The charger could not be started; your card was not charged".to_string(),
            ));
        }
        // The hold may still be captured, so promise nothing about the card
        SessionState::Finalizing | SessionState::SettleFailed => {
            return Err(ApiError::BadGateway(
                "The charger could not be started; the payment is still being settled".to_string(),
            ));
        }
        other => {
            return Err(ApiError::Conflict(format!("Session is {}", other)));
        }
    };

    Ok(Json(json!({
        "status": status,
        "session": SessionView::from(&session),
    })))
}
