//! Session tokens handed to dashboard operators after login

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Issuer stamped on every panel session token
pub const SESSION_ISSUER: &str = "fleet-panel";
/// Audience stamped on every panel session token
pub const SESSION_AUDIENCE: &str = "fleet-dashboard";

const SESSION_TOKEN_TYPE: &str = "session";

/// Claims carried by an operator session token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperatorClaims {
    /// Operator username
    pub sub: String,
    /// Unique session id
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
    /// Always "session"; guards against other HS256 tokens signed with the same secret
    pub token_type: String,
}

impl OperatorClaims {
    pub fn new(username: impl Into<String>, validity: Duration) -> Self {
        Self::issued_at(username, Utc::now(), validity)
    }

    pub fn issued_at(username: impl Into<String>, now: DateTime<Utc>, validity: Duration) -> Self {
        Self {
            sub: username.into(),
            jti: uuid::Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: (now + validity).timestamp(),
            iss: SESSION_ISSUER.to_string(),
            aud: SESSION_AUDIENCE.to_string(),
            token_type: SESSION_TOKEN_TYPE.to_string(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now)
    }
}

/// JWT errors
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(#[source] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    InvalidToken,
}

impl From<jsonwebtoken::errors::Error> for JwtError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => JwtError::TokenExpired,
            ErrorKind::InvalidToken
            | ErrorKind::InvalidSignature
            | ErrorKind::InvalidIssuer
            | ErrorKind::InvalidAudience
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::ImmatureSignature
            | ErrorKind::MissingRequiredClaim(_)
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => JwtError::InvalidToken,
            _ => JwtError::EncodingError(err),
        }
    }
}

/// Signs and checks operator session tokens (HMAC-SHA256)
#[derive(Clone)]
pub struct JwtValidator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.leeway = 0;
        validation.set_issuer(&[SESSION_ISSUER]);
        validation.set_audience(&[SESSION_AUDIENCE]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn encode(&self, claims: &OperatorClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        encode(&header, claims, &self.encoding_key).map_err(JwtError::EncodingError)
    }

    pub fn validate(&self, token: &str) -> Result<OperatorClaims, JwtError> {
        let token_data = decode::<OperatorClaims>(token, &self.decoding_key, &self.validation)?;

        if token_data.claims.token_type != SESSION_TOKEN_TYPE {
            return Err(JwtError::InvalidToken);
        }
        if token_data.claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }

        Ok(token_data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"panel-test-secret";

    #[test]
    fn test_session_token_round_trip() {
        let validator = JwtValidator::new(SECRET);
        let claims = OperatorClaims::new("admin", Duration::hours(12));
        let token = validator.encode(&claims).unwrap();

        let decoded = validator.validate(&token).unwrap();
        assert_eq!(decoded.sub, "admin");
        assert_eq!(decoded.jti, claims.jti);
        assert_eq!(decoded.iss, SESSION_ISSUER);
    }

    #[test]
    fn test_expired_session_is_rejected() {
        let validator = JwtValidator::new(SECRET);
        let claims = OperatorClaims::issued_at(
            "admin",
            Utc::now() - Duration::hours(3),
            Duration::hours(1),
        );
        let token = validator.encode(&claims).unwrap();

        assert!(matches!(
            validator.validate(&token),
            Err(JwtError::TokenExpired)
        ));
    }

    #[test]
    fn test_token_from_other_secret_is_invalid() {
        let issuer = JwtValidator::new(b"some-other-secret");
        let token = issuer
            .encode(&OperatorClaims::new("admin", Duration::hours(1)))
            .unwrap();

        let validator = JwtValidator::new(SECRET);
        assert!(matches!(
            validator.validate(&token),
            Err(JwtError::InvalidToken)
        ));
    }

    #[test]
    fn test_foreign_token_type_is_invalid() {
        let validator = JwtValidator::new(SECRET);
        let mut claims = OperatorClaims::new("admin", Duration::hours(1));
        claims.token_type = "refresh".to_string();
        let token = validator.encode(&claims).unwrap();

        assert!(matches!(
            validator.validate(&token),
            Err(JwtError::InvalidToken)
        ));
    }

    #[test]
    fn test_garbage_is_invalid() {
        let validator = JwtValidator::new(SECRET);
        assert!(matches!(
            validator.validate("not.a.jwt"),
            Err(JwtError::InvalidToken)
        ));
    }
}
