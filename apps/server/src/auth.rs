use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use uuid::Uuid;

use call_proto::Role;

// JWT secret loaded from environment variable
static JWT_SECRET: LazyLock<Vec<u8>> = LazyLock::new(|| match std::env::var("JWT_SECRET") {
    Ok(secret) => {
        tracing::info!("JWT_SECRET loaded from environment");
        secret.into_bytes()
    }
    Err(_) => {
        tracing::warn!(
            "⚠️  JWT_SECRET not set! Using insecure default. Set JWT_SECRET env var in production!"
        );
        b"dev-only-insecure-default-key-change-me".to_vec()
    }
});

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub name: String,
    pub role: Role,
    pub tenant: String,
    pub exp: i64,
    pub iat: i64,
}

/// Authenticated identity bound to a live connection after `register`.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: Uuid,
    pub display_name: String,
    pub role: Role,
    pub tenant_id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid token")]
    InvalidToken,
    #[error("Malformed claims")]
    MalformedClaims,
}

/// Generate a signaling token for a principal. Token issuance normally lives
/// in the login service; this is kept for tooling and tests.
pub fn generate_token(principal: &Principal) -> Result<String, AuthError> {
    let now = Utc::now();
    let exp = now + Duration::hours(24);

    let claims = Claims {
        sub: principal.user_id.to_string(),
        name: principal.display_name.clone(),
        role: principal.role,
        tenant: principal.tenant_id.to_string(),
        exp: exp.timestamp(),
        iat: now.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(&JWT_SECRET),
    )
    .map_err(|_| AuthError::InvalidToken)
}

/// Validate a signaling token and resolve the principal it names. Consumed
/// once per connection at register time, never on the signaling hot path.
pub fn verify_token(token: &str) -> Result<Principal, AuthError> {
    let claims = decode::<Claims>(
        token,
        &DecodingKey::from_secret(&JWT_SECRET),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| AuthError::InvalidToken)?;

    let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthError::MalformedClaims)?;
    let tenant_id = Uuid::parse_str(&claims.tenant).map_err(|_| AuthError::MalformedClaims)?;

    Ok(Principal {
        user_id,
        display_name: claims.name,
        role: claims.role,
        tenant_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_principal() {
        let principal = Principal {
            user_id: Uuid::new_v4(),
            display_name: "Alice".to_string(),
            role: Role::Admin,
            tenant_id: Uuid::new_v4(),
        };

        let token = generate_token(&principal).unwrap();
        let verified = verify_token(&token).unwrap();

        assert_eq!(verified.user_id, principal.user_id);
        assert_eq!(verified.display_name, "Alice");
        assert_eq!(verified.role, Role::Admin);
        assert_eq!(verified.tenant_id, principal.tenant_id);
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert!(verify_token("not-a-jwt").is_err());
    }
}
