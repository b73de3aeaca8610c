// HS256 access tokens minted by the account service. The `organisation_id`
// claim scopes a token to one tenant; the subject is the numeric user id.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context};
use callboard_common::types::{OrganisationId, UserId};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;
pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    organisation_id: OrganisationId,
    iat: i64,
    exp: i64,
}

/// The caller identity behind a verified token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: UserId,
    pub organisation_id: OrganisationId,
}

#[derive(Debug, Error)]
pub enum AccessTokenError {
    #[error("access token has expired")]
    Expired,
    #[error("access token is malformed or badly signed")]
    Invalid(#[source] jsonwebtoken::errors::Error),
    #[error("access token subject '{0}' is not a user id")]
    Subject(String),
    #[error("access token carries no organisation scope")]
    Scope,
}

impl AccessTokenError {
    /// Stable label for logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Invalid(_) => "invalid",
            Self::Subject(_) => "subject",
            Self::Scope => "scope",
        }
    }
}

#[derive(Clone)]
pub struct JwtAccessTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAccessTokenService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            bail!("jwt secret must be at least {MIN_SECRET_LEN} characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn validate_organisation_token(
        &self,
        token: &str,
    ) -> Result<AuthenticatedUser, AccessTokenError> {
        let claims = decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|error| match error.kind() {
                ErrorKind::ExpiredSignature => AccessTokenError::Expired,
                _ => AccessTokenError::Invalid(error),
            })?
            .claims;

        let user_id = match claims.sub.parse::<UserId>() {
            Ok(user_id) if user_id > 0 => user_id,
            _ => return Err(AccessTokenError::Subject(claims.sub)),
        };
        if claims.organisation_id <= 0 {
            return Err(AccessTokenError::Scope);
        }

        Ok(AuthenticatedUser { user_id, organisation_id: claims.organisation_id })
    }

    /// Mints a token the way the account service does. The relay itself only
    /// verifies; this exists for local tooling and tests.
    pub fn issue_organisation_token(
        &self,
        user_id: UserId,
        organisation_id: OrganisationId,
    ) -> anyhow::Result<String> {
        self.issue_organisation_token_at(user_id, organisation_id, unix_now()?)
    }

    fn issue_organisation_token_at(
        &self,
        user_id: UserId,
        organisation_id: OrganisationId,
        issued_at: i64,
    ) -> anyhow::Result<String> {
        let claims = AccessTokenClaims {
            sub: user_id.to_string(),
            organisation_id,
            iat: issued_at,
            exp: issued_at + ACCESS_TOKEN_TTL_SECONDS,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }
}

fn unix_now() -> anyhow::Result<i64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;
    i64::try_from(elapsed.as_secs()).context("unix timestamp overflow")
}
