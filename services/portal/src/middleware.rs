//! Admin authentication
//!
//! Operators sign in once and receive an HS256 session cookie keyed on the
//! admin password, so changing the password logs everyone out. HTTP Basic
//! credentials are accepted on every admin route as well.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::{
    TypedHeader,
    extract::cookie::CookieJar,
    headers::{Authorization, authorization::Basic},
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{error, warn};

use crate::{error::ApiError, state::AppState};

pub const ADMIN_COOKIE: &str = "ev_admin_session";
const SESSION_TTL: Duration = Duration::from_secs(8 * 60 * 60);

/// Admin session claims
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Username
    pub sub: String,
    /// Issued at time
    pub iat: u64,
    /// Expiration time
    pub exp: u64,
}

/// Authenticated operator, inserted into request extensions
#[derive(Debug, Clone)]
pub struct AdminActor(pub String);

#[derive(Clone)]
pub struct AdminAuth {
    username: String,
    password: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

fn secure_eq(a: &str, b: &str) -> bool {
    bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

impl AdminAuth {
    pub fn new(username: &str, password: &str) -> Self {
        let secret = format!("ev-portal-admin:{}", password);
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;

        Self {
            username: username.to_string(),
            password: password.to_string(),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn check_credentials(&self, username: &str, password: &str) -> bool {
        // Evaluate both so timing does not reveal which one matched
        let user_ok = secure_eq(username, &self.username);
        let pass_ok = secure_eq(password, &self.password);
        user_ok & pass_ok
    }

    /// Sign a session token for the configured operator
    pub fn issue(&self) -> Result<String, ApiError> {
        let now = Utc::now().timestamp().max(0) as u64;
        let claims = Claims {
            sub: self.username.clone(),
            iat: now,
            exp: now + SESSION_TTL.as_secs(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key).map_err(|e| {
            error!("Failed to sign admin session: {}", e);
            ApiError::InternalServerError
        })
    }

    /// Username of a valid, unexpired session token
    pub fn verify(&self, token: &str) -> Option<String> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).ok()?;
        secure_eq(&data.claims.sub, &self.username).then_some(data.claims.sub)
    }
}

/// Require an admin session cookie or Basic credentials
pub async fn require_admin(
    State(state): State<AppState>,
    jar: CookieJar,
    basic: Option<TypedHeader<Authorization<Basic>>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth = state.admin.as_ref().ok_or(ApiError::Unauthorized)?;

    let from_cookie = jar
        .get(ADMIN_COOKIE)
        .and_then(|cookie| auth.verify(cookie.value()));
    let username = match from_cookie {
        Some(username) => username,
        None => match basic {
            Some(TypedHeader(Authorization(creds)))
                if auth.check_credentials(creds.username(), creds.password()) =>
            {
                creds.username().to_string()
            }
            Some(_) => {
                warn!(path = %req.uri().path(), "Rejected admin credentials");
                return Err(ApiError::Unauthorized);
            }
            None => return Err(ApiError::Unauthorized),
        },
    };

    req.extensions_mut().insert(AdminActor(format!("admin:{}", username)));
    Ok(next.run(req).await)
}
