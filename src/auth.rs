use std::sync::Arc;

use axum::{
    RequestPartsExt,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

use crate::{
    error::{Error, Result},
    server::Server,
    utils::now,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Learner,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

/// Signs and checks short-lived capability tokens (HS256).
pub struct CapabilityKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl CapabilityKeys {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn issue(&self, user_id: &str, role: Role, ttl: time::Duration) -> Result<String> {
        if user_id.trim().is_empty() {
            return Err(Error::validation("user id is required"));
        }
        let iat = now();
        let claims = Claims {
            sub: user_id.to_string(),
            role,
            iat: iat.unix_timestamp(),
            exp: (iat + ttl).unix_timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Fatal(anyhow::anyhow!("failed to sign capability: {e}")))
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!("rejected capability: {}", e);
                Error::unauthorized("invalid or expired capability")
            })
    }
}

async fn bearer_claims<S>(parts: &mut Parts, state: &S) -> Result<Claims>
where
    Arc<Server>: FromRef<S>,
    S: Send + Sync,
{
    let TypedHeader(Authorization(bearer)) = parts
        .extract::<TypedHeader<Authorization<Bearer>>>()
        .await
        .map_err(|_| Error::unauthorized("missing bearer capability"))?;
    let server = Arc::<Server>::from_ref(state);
    server.capabilities.verify(bearer.token())
}

/// Any verified caller; `sub` is the learner the request acts for.
#[derive(Debug, Clone)]
pub struct Learner(pub Claims);

impl Learner {
    pub fn user_id(&self) -> &str {
        &self.0.sub
    }
}

impl<S> FromRequestParts<S> for Learner
where
    Arc<Server>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        bearer_claims(parts, state).await.map(Learner)
    }
}

/// A caller holding the admin capability, checked on every request.
#[derive(Debug, Clone)]
pub struct Admin(pub Claims);

impl<S> FromRequestParts<S> for Admin
where
    Arc<Server>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let claims = bearer_claims(parts, state).await?;
        if claims.role != Role::Admin {
            return Err(Error::unauthorized("admin capability required"));
        }
        Ok(Admin(claims))
    }
}
