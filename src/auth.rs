use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use warp::{Filter, Rejection};

use crate::error::AuthError;
use crate::messages::Role;
use crate::store::Account;

/// Identity carried by a validated bearer token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub account_id: String,
    pub name: String,
    pub role: Role,
}

impl From<&Account> for Claims {
    fn from(account: &Account) -> Self {
        Claims {
            account_id: account.id.clone(),
            name: account.name.clone(),
            role: account.role,
        }
    }
}

#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Claims, AuthError>;
}

/// One line of the accounts file: the account plus the digest of its token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountEntry {
    #[serde(flatten)]
    pub account: Account,
    pub token_sha256: String,
}

pub fn token_digest(token: &str) -> String {
    BASE64.encode(Sha256::digest(token.as_bytes()))
}

/// Validates tokens against a fixed set of SHA-256 digests, so the
/// accounts file never holds a usable token.
#[derive(Default)]
pub struct StaticTokens {
    by_digest: HashMap<String, Claims>,
}

impl StaticTokens {
    pub fn new(entries: &[AccountEntry]) -> Self {
        let by_digest = entries
            .iter()
            .map(|entry| (entry.token_sha256.clone(), Claims::from(&entry.account)))
            .collect();
        StaticTokens { by_digest }
    }

    pub fn insert(&mut self, token: &str, claims: Claims) {
        self.by_digest.insert(token_digest(token), claims);
    }
}

#[async_trait]
impl TokenValidator for StaticTokens {
    async fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        self.by_digest
            .get(&token_digest(token))
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let header = header.ok_or(AuthError::MissingToken)?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or(AuthError::BadFormat)?
        .trim();
    if token.is_empty() {
        return Err(AuthError::BadFormat);
    }
    Ok(token)
}

/// Extracts the claims of the request's bearer token, rejecting with
/// `AuthError` otherwise.
pub fn with_claims(
    validator: Arc<dyn TokenValidator>,
) -> impl Filter<Extract = (Claims,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization").and_then(move |header: Option<String>| {
        let validator = validator.clone();
        async move {
            let token = bearer_token(header.as_deref()).map_err(warp::reject::custom)?;
            validator.validate(token).await.map_err(warp::reject::custom)
        }
    })
}
