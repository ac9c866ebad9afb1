//! Bearer-token identity. Tokens are issued by the external identity provider;
//! this service only verifies them.

use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::config::AppConfig;
use crate::errors::ServiceError;

pub const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub jti: Option<String>,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

/// Authenticated caller extracted from the `Authorization: Bearer` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub roles: Vec<String>,
}

impl AuthUser {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }

    pub fn require_admin(&self) -> Result<(), ServiceError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ServiceError::Forbidden("admin role required".to_string()))
        }
    }
}

impl From<Claims> for AuthUser {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            name: claims.name,
            email: claims.email,
            roles: claims.roles,
        }
    }
}

/// HS256 verifier bound to the configured issuer and audience.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier").finish_non_exhaustive()
    }
}

impl JwtVerifier {
    pub fn new(secret: &str, issuer: &str, audience: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.jwt_secret, &config.auth_issuer, &config.auth_audience)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, ServiceError> {
        let claims = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| {
                debug!(error = %e, "rejected bearer token");
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                        ServiceError::Unauthorized("token expired".to_string())
                    }
                    _ => ServiceError::Unauthorized("invalid token".to_string()),
                }
            })?
            .claims;

        if claims.sub.trim().is_empty() {
            return Err(ServiceError::Unauthorized("token has no subject".to_string()));
        }
        Ok(claims)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    Arc<JwtVerifier>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let verifier = Arc::<JwtVerifier>::from_ref(state);

        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ServiceError::Unauthorized("missing bearer token".to_string()))?;

        verifier.verify(token).map(AuthUser::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "unit_test_secret_that_is_long_enough_for_hs256";

    fn token(iss: &str, exp_offset: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: "user-1".into(),
            name: None,
            email: Some("u@example.com".into()),
            roles: vec!["admin".into()],
            jti: None,
            iat: now,
            exp: now + exp_offset,
            iss: iss.into(),
            aud: "storefront-api".into(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_yields_user() {
        let verifier = JwtVerifier::new(SECRET, "storefront-auth", "storefront-api");
        let user: AuthUser = verifier.verify(&token("storefront-auth", 3600)).unwrap().into();
        assert_eq!(user.user_id, "user-1");
        assert!(user.is_admin());
    }

    #[test]
    fn wrong_issuer_and_expired_tokens_are_rejected() {
        let verifier = JwtVerifier::new(SECRET, "storefront-auth", "storefront-api");
        assert!(verifier.verify(&token("someone-else", 3600)).is_err());
        assert!(verifier.verify(&token("storefront-auth", -3600)).is_err());
    }

    #[test]
    fn non_admin_is_forbidden() {
        let user = AuthUser {
            user_id: "u".into(),
            name: None,
            email: None,
            roles: vec![],
        };
        assert!(matches!(user.require_admin(), Err(ServiceError::Forbidden(_))));
    }
}
