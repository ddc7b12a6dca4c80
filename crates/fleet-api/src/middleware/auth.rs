//! Bearer token middleware for the protected dashboard endpoints
//!
//! Validates the `Authorization: Bearer <token>` session token and makes the
//! operator available to handlers through an `Extension<AuthUser>`.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use fleet_auth::{JwtError, JwtValidator};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::ErrorResponse;

/// Operator behind a validated session token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub username: String,
    pub session_id: String,
}

/// JWT validation state shared across middleware instances
#[derive(Clone)]
pub struct JwtState {
    pub validator: Arc<JwtValidator>,
}

impl JwtState {
    pub fn new(validator: Arc<JwtValidator>) -> Self {
        Self { validator }
    }
}

fn unauthorized(error: impl Into<String>, code: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::new(error, code)),
    )
}

pub async fn require_auth(
    State(state): State<Arc<JwtState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| unauthorized("Missing Authorization header", "MISSING_AUTH"))?;

    let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
        unauthorized(
            "Invalid Authorization header format. Expected 'Bearer <token>'",
            "INVALID_AUTH_FORMAT",
        )
    })?;

    let claims = state.validator.validate(token.trim()).map_err(|e| match e {
        JwtError::TokenExpired => unauthorized("Session expired, log in again", "TOKEN_EXPIRED"),
        other => unauthorized(format!("Invalid token: {}", other), "INVALID_TOKEN"),
    })?;

    request.extensions_mut().insert(AuthUser {
        username: claims.sub,
        session_id: claims.jti,
    });

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, middleware, routing::get, Router};
    use chrono::{Duration, Utc};
    use fleet_auth::OperatorClaims;
    use tower::ServiceExt;

    const SECRET: &[u8] = b"test-secret-key";

    async fn whoami(axum::Extension(user): axum::Extension<AuthUser>) -> Json<AuthUser> {
        Json(user)
    }

    fn app() -> Router {
        let state = Arc::new(JwtState::new(Arc::new(JwtValidator::new(SECRET))));
        Router::new()
            .route("/protected", get(whoami))
            .layer(middleware::from_fn_with_state(state, require_auth))
    }

    async fn call(authorization: Option<String>) -> (StatusCode, Vec<u8>) {
        let mut builder = Request::builder().uri("/protected");
        if let Some(value) = authorization {
            builder = builder.header("Authorization", value);
        }
        let response = app()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_valid_session_token_passes() {
        let claims = OperatorClaims::new("admin", Duration::hours(1));
        let token = JwtValidator::new(SECRET).encode(&claims).unwrap();

        let (status, body) = call(Some(format!("Bearer {}", token))).await;
        assert_eq!(status, StatusCode::OK);

        let user: AuthUser = serde_json::from_slice(&body).unwrap();
        assert_eq!(user.username, "admin");
        assert_eq!(user.session_id, claims.jti);
    }

    #[tokio::test]
    async fn test_missing_header() {
        let (status, body) = call(None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code.as_deref(), Some("MISSING_AUTH"));
    }

    #[tokio::test]
    async fn test_wrong_scheme() {
        let (status, body) = call(Some("Basic YWRtaW46YWRtaW4=".to_string())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code.as_deref(), Some("INVALID_AUTH_FORMAT"));
    }

    #[tokio::test]
    async fn test_expired_token() {
        let claims =
            OperatorClaims::issued_at("admin", Utc::now() - Duration::hours(2), Duration::hours(1));
        let token = JwtValidator::new(SECRET).encode(&claims).unwrap();

        let (status, body) = call(Some(format!("Bearer {}", token))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code.as_deref(), Some("TOKEN_EXPIRED"));
    }

    #[tokio::test]
    async fn test_token_signed_with_other_secret() {
        let claims = OperatorClaims::new("admin", Duration::hours(1));
        let token = JwtValidator::new(b"another-secret").encode(&claims).unwrap();

        let (status, body) = call(Some(format!("Bearer {}", token))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code.as_deref(), Some("INVALID_TOKEN"));
    }
}
