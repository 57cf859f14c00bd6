//! Token verification for the two authenticated surfaces: producer control
//! channels (Bearer token) and browser users (session cookie). Issuance
//! lives with the identity service; the `generate_*` helpers exist so tests
//! can mint tokens against the same keys.

use crate::config::settings::AuthConfig;
use crate::error::AppError;
use crate::models::{AuthenticatedUser, Owner};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{debug, error};

// Issuer name for relay tokens
pub const TOKEN_ISSUER: &str = "termlink";

// Default token duration in days
pub const DEFAULT_TOKEN_DURATION_DAYS: i64 = 30;

/// Claims carried by a producer control token.
#[derive(Debug, Serialize, Deserialize)]
pub struct ControlClaims {
    pub sub: String,
    pub username: String,
    pub exp: usize,
    pub iat: usize,
    pub iss: Option<String>,
}

/// Claims carried by a browser session cookie.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub login: String,
    pub exp: usize,
    pub iat: usize,
    pub iss: Option<String>,
}

struct KeyPair {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

static CONTROL_KEYS: OnceLock<KeyPair> = OnceLock::new();
static SESSION_KEYS: OnceLock<KeyPair> = OnceLock::new();

/// Initialize the token keys from the configured secrets.
/// Safe to call more than once; later calls keep the first keys.
pub fn init_token_keys(auth: &AuthConfig) {
    let _ = CONTROL_KEYS.set(KeyPair {
        encoding: EncodingKey::from_secret(auth.control_token_secret.as_bytes()),
        decoding: DecodingKey::from_secret(auth.control_token_secret.as_bytes()),
    });
    let _ = SESSION_KEYS.set(KeyPair {
        encoding: EncodingKey::from_secret(auth.session_cookie_secret.as_bytes()),
        decoding: DecodingKey::from_secret(auth.session_cookie_secret.as_bytes()),
    });
}

fn control_keys() -> Result<&'static KeyPair, AppError> {
    CONTROL_KEYS
        .get()
        .ok_or_else(|| AppError::Configuration("control token keys not initialized".to_string()))
}

fn session_keys() -> Result<&'static KeyPair, AppError> {
    SESSION_KEYS
        .get()
        .ok_or_else(|| AppError::Configuration("session cookie keys not initialized".to_string()))
}

fn validation() -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[TOKEN_ISSUER]);
    validation
}

fn timestamps(duration_days: i64) -> Result<(usize, usize), AppError> {
    let iat = Utc::now();
    let exp = iat
        .checked_add_signed(
            Duration::try_days(duration_days)
                .unwrap_or_else(|| Duration::days(DEFAULT_TOKEN_DURATION_DAYS)),
        )
        .ok_or_else(|| AppError::Internal("failed to calculate token expiration".to_string()))?;
    Ok((iat.timestamp() as usize, exp.timestamp() as usize))
}

/// Generate a producer control token.
pub fn generate_control_token(
    subject: &str,
    username: &str,
    duration_days: i64,
) -> Result<String, AppError> {
    let (iat, exp) = timestamps(duration_days)?;
    let claims = ControlClaims {
        sub: subject.to_string(),
        username: username.to_string(),
        exp,
        iat,
        iss: Some(TOKEN_ISSUER.to_string()),
    };
    encode(&Header::new(Algorithm::HS256), &claims, &control_keys()?.encoding).map_err(|e| {
        error!(error = %e, "Failed to generate control token");
        AppError::Internal(format!("Token generation failed: {}", e))
    })
}

/// Verify a producer control token; yields the producer's identity.
pub fn verify_control_token(token: &str) -> Result<Owner, AppError> {
    let data = decode::<ControlClaims>(token, &control_keys()?.decoding, &validation())
        .map_err(|err| {
            debug!(error = %err, "Control token validation failed");
            AppError::Auth(format!("Invalid control token: {}", err))
        })?;
    Ok(Owner::new(data.claims.sub, data.claims.username))
}

/// Generate a browser session token.
pub fn generate_session_token(
    id: &str,
    login: &str,
    duration_days: i64,
) -> Result<String, AppError> {
    let (iat, exp) = timestamps(duration_days)?;
    let claims = SessionClaims {
        sub: id.to_string(),
        login: login.to_string(),
        exp,
        iat,
        iss: Some(TOKEN_ISSUER.to_string()),
    };
    encode(&Header::new(Algorithm::HS256), &claims, &session_keys()?.encoding).map_err(|e| {
        error!(error = %e, "Failed to generate session token");
        AppError::Internal(format!("Token generation failed: {}", e))
    })
}

/// Verify a browser session token; yields the user record.
pub fn verify_session_token(token: &str) -> Result<AuthenticatedUser, AppError> {
    let data = decode::<SessionClaims>(token, &session_keys()?.decoding, &validation())
        .map_err(|err| {
            debug!(error = %err, "Session token validation failed");
            AppError::Auth(format!("Invalid session token: {}", err))
        })?;
    Ok(AuthenticatedUser {
        id: data.claims.sub,
        login: data.claims.login,
    })
}

#[cfg(test)]
pub(crate) fn init_test_keys() {
    init_token_keys(&AuthConfig {
        control_token_secret: "test-control-secret".to_string(),
        session_cookie_secret: "test-session-secret".to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn control_token_round_trip() {
        init_test_keys();
        let token = generate_control_token("u-42", "ada", 1).unwrap();
        let owner = verify_control_token(&token).unwrap();
        assert_eq!(owner, Owner::new("u-42", "ada"));
    }

    #[test]
    fn session_token_round_trip() {
        init_test_keys();
        let token = generate_session_token("u-7", "grace", 1).unwrap();
        let user = verify_session_token(&token).unwrap();
        assert_eq!(
            user,
            AuthenticatedUser {
                id: "u-7".to_string(),
                login: "grace".to_string(),
            }
        );
    }

    #[test]
    fn garbage_token_is_rejected() {
        init_test_keys();
        assert!(verify_control_token("not-a-token").is_err());
        assert!(verify_session_token("not-a-token").is_err());
    }

    #[test]
    fn session_token_does_not_verify_as_control_token() {
        init_test_keys();
        let token = generate_session_token("u-7", "grace", 1).unwrap();
        assert!(verify_control_token(&token).is_err());
    }
}
