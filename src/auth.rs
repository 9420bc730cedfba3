//! Authentication seam for the upload API
//!
//! Token minting and verification live outside this service; the core
//! consumes them through the `TokenVerifier` trait (`verify(token) ->
//! Principal`). A shared-secret implementation backed by `JWT_SECRET` is
//! provided for deployment wiring; tests inject static verifiers.

use crate::error::{Error, Result};
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Authenticated identity owning sessions and receiving events.
/// Immutable for the lifetime of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub role: String,
}

/// External verification seam: `verify(token) -> Principal`.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Principal>;
}

/// Shared-secret verifier.
///
/// Token format: `<id>.<role>.<sig>` with
/// `sig = hex(sha256("<id>.<role>.<secret>"))`. The companion `mint` is
/// exposed for tests and local tooling; production mints tokens elsewhere.
pub struct SharedSecretVerifier {
    secret: String,
}

impl SharedSecretVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn signature(&self, id: &str, role: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}.{}.{}", id, role, self.secret).as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Mint a token for a principal (test/tooling helper).
    pub fn mint(&self, id: &str, role: &str) -> String {
        format!("{}.{}.{}", id, role, self.signature(id, role))
    }
}

impl TokenVerifier for SharedSecretVerifier {
    fn verify(&self, token: &str) -> Result<Principal> {
        let mut parts = token.splitn(3, '.');
        let (id, role, sig) = match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(role), Some(sig)) if !id.is_empty() && !role.is_empty() => {
                (id, role, sig)
            }
            _ => return Err(Error::Unauthorized("malformed token".into())),
        };
        if self.signature(id, role) != sig {
            return Err(Error::Unauthorized("bad token signature".into()));
        }
        Ok(Principal {
            id: id.to_string(),
            role: role.to_string(),
        })
    }
}

/// Axum middleware: extract the bearer token, verify it, and stash the
/// `Principal` in request extensions for handlers to consume.
pub async fn auth_middleware(
    State(state): State<crate::AppState>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, Response> {
    let token = bearer_token(&request)
        .ok_or_else(|| Error::Unauthorized("missing bearer token".into()).into_response())?;

    let principal = state
        .verifier
        .verify(&token)
        .map_err(|e| e.into_response())?;

    debug!(principal = %principal.id, "request authenticated");
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_then_verify_roundtrip() {
        let verifier = SharedSecretVerifier::new("s3cret");
        let token = verifier.mint("alice", "user");
        let principal = verifier.verify(&token).unwrap();
        assert_eq!(principal.id, "alice");
        assert_eq!(principal.role, "user");
    }

    #[test]
    fn tampered_token_is_rejected() {
        let verifier = SharedSecretVerifier::new("s3cret");
        let token = verifier.mint("alice", "user");
        let forged = token.replace("alice", "mallory");
        assert!(verifier.verify(&forged).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let minter = SharedSecretVerifier::new("secret-a");
        let verifier = SharedSecretVerifier::new("secret-b");
        assert!(verifier.verify(&minter.mint("alice", "user")).is_err());
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let verifier = SharedSecretVerifier::new("s3cret");
        assert!(verifier.verify("").is_err());
        assert!(verifier.verify("no-dots").is_err());
        assert!(verifier.verify("a.b").is_err());
        assert!(verifier.verify(".role.sig").is_err());
    }
}
