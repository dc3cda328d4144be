//! Credential verification for relay connections.
//!
//! Two credential sources are accepted. API keys are RS256-signed JWTs issued
//! by the dashboard backend; the relay verifies them locally against the
//! configured public key and derives a SHA-256 hash used to scope sessions to
//! the creating key. Bearer access tokens belong to browser users and are
//! resolved through the external identity service, with a short in-process
//! cache so rapid polling does not hammer it.
//!
//! Failures never leak detail to the wire: endpoints send
//! [`AuthError::wire_message`] and keep the cause in the log.

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Token-cache time to live.
const TOKEN_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
/// Token-cache capacity; the whole cache is cleared on overflow.
const TOKEN_CACHE_MAX: usize = 2048;

/// Authenticated identity for one relay connection.
///
/// `api_key_hash` is `Some` only for API-key credentials; bearer-token
/// viewers carry `None` and may attach to any session of the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub owner_id: String,
    pub api_key_hash: Option<String>,
}

/// Credential validation failure.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing authentication credentials")]
    MissingCredentials,
    #[error("invalid API key: {0}")]
    InvalidApiKey(String),
    #[error("invalid access token: {0}")]
    InvalidToken(String),
    #[error("verifier not configured: {0}")]
    Unconfigured(&'static str),
}

impl AuthError {
    /// The only message ever sent to the wire for this error.
    pub fn wire_message(&self) -> &'static str {
        match self {
            AuthError::MissingCredentials => "Missing authentication credentials",
            _ => "Invalid credentials",
        }
    }
}

/// Lowercase hex SHA-256 of a raw API key, so raw keys are never stored.
pub fn hash_api_key(api_key: &str) -> String {
    let digest = Sha256::digest(api_key.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[derive(Deserialize)]
struct ApiKeyClaims {
    sub: Option<String>,
}

/// Validates API-key JWTs against the backend's RS256 public key.
///
/// API keys are long-lived: the signature and subject claim are required,
/// expiry is not (revocation happens server-side).
pub struct ApiKeyVerifier {
    decoding_key: jsonwebtoken::DecodingKey,
    validation: jsonwebtoken::Validation,
}

impl ApiKeyVerifier {
    pub fn from_rsa_pem(pem: &str) -> Result<Self, AuthError> {
        let decoding_key = jsonwebtoken::DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|_| AuthError::Unconfigured("JWT public key is not a valid RSA PEM"))?;
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::RS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        Ok(Self {
            decoding_key,
            validation,
        })
    }

    pub fn verify(&self, api_key: &str) -> Result<Credentials, AuthError> {
        if api_key.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        let token = jsonwebtoken::decode::<ApiKeyClaims>(api_key, &self.decoding_key, &self.validation)
            .map_err(|e| AuthError::InvalidApiKey(e.to_string()))?;
        let owner_id = match token.claims.sub {
            Some(sub) if !sub.is_empty() => sub,
            _ => return Err(AuthError::InvalidApiKey("missing subject claim".into())),
        };
        Ok(Credentials {
            owner_id,
            api_key_hash: Some(hash_api_key(api_key)),
        })
    }
}

/// Resolves a bearer access token to the owning subject.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn resolve_subject(&self, access_token: &str) -> Result<String, AuthError>;
}

/// Identity service backed by the hosted auth provider's `/auth/v1/user`
/// endpoint, matching the tokens the web dashboard issues.
pub struct HttpIdentityService {
    client: reqwest::Client,
    user_url: String,
}

impl HttpIdentityService {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            user_url: format!("{}/auth/v1/user", base_url.trim_end_matches('/')),
        }
    }
}

#[derive(Deserialize)]
struct IdentityUser {
    id: Option<String>,
}

#[async_trait]
impl IdentityService for HttpIdentityService {
    async fn resolve_subject(&self, access_token: &str) -> Result<String, AuthError> {
        let response = self
            .client
            .get(&self.user_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| AuthError::InvalidToken(format!("identity service unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(AuthError::InvalidToken(format!(
                "identity service returned {}",
                response.status()
            )));
        }
        let user: IdentityUser = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidToken(format!("malformed identity response: {e}")))?;
        match user.id {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(AuthError::InvalidToken("token missing valid subject".into())),
        }
    }
}

/// Verifies bearer access tokens, caching positive results for
/// [`TOKEN_CACHE_TTL`].
pub struct BearerVerifier {
    service: Arc<dyn IdentityService>,
    cache: Mutex<HashMap<String, (String, Instant)>>,
    ttl: Duration,
}

impl BearerVerifier {
    pub fn new(service: Arc<dyn IdentityService>) -> Self {
        Self::with_ttl(service, TOKEN_CACHE_TTL)
    }

    pub fn with_ttl(service: Arc<dyn IdentityService>, ttl: Duration) -> Self {
        Self {
            service,
            cache: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn verify(&self, access_token: &str) -> Result<Credentials, AuthError> {
        if access_token.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        if let Some(owner_id) = self.cached_owner(access_token) {
            return Ok(Credentials {
                owner_id,
                api_key_hash: None,
            });
        }

        let owner_id = self.service.resolve_subject(access_token).await?;

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(access_token.to_string(), (owner_id.clone(), Instant::now() + self.ttl));
        if cache.len() > TOKEN_CACHE_MAX {
            cache.clear();
        }

        Ok(Credentials {
            owner_id,
            api_key_hash: None,
        })
    }

    fn cached_owner(&self, access_token: &str) -> Option<String> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        match cache.get(access_token) {
            Some((owner, expires_at)) if Instant::now() < *expires_at => Some(owner.clone()),
            Some(_) => {
                cache.remove(access_token);
                None
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticIdentity {
        subject: Result<String, ()>,
        calls: AtomicUsize,
    }

    impl StaticIdentity {
        fn ok(subject: &str) -> Self {
            Self {
                subject: Ok(subject.to_string()),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                subject: Err(()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl IdentityService for StaticIdentity {
        async fn resolve_subject(&self, _access_token: &str) -> Result<String, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.subject
                .clone()
                .map_err(|()| AuthError::InvalidToken("no subject".into()))
        }
    }

    #[test]
    fn test_hash_api_key_is_deterministic_hex() {
        let a = hash_api_key("some-key");
        let b = hash_api_key("some-key");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, hash_api_key("other-key"));
    }

    #[test]
    fn test_api_key_verifier_rejects_bad_pem() {
        assert!(ApiKeyVerifier::from_rsa_pem("not a pem").is_err());
    }

    #[test]
    fn test_wire_messages_stay_generic() {
        assert_eq!(
            AuthError::MissingCredentials.wire_message(),
            "Missing authentication credentials"
        );
        assert_eq!(
            AuthError::InvalidApiKey("signature mismatch at byte 3".into()).wire_message(),
            "Invalid credentials"
        );
        assert_eq!(
            AuthError::InvalidToken("expired".into()).wire_message(),
            "Invalid credentials"
        );
    }

    #[tokio::test]
    async fn test_bearer_empty_token_skips_service() {
        let service = Arc::new(StaticIdentity::ok("user-1"));
        let verifier = BearerVerifier::new(service.clone());
        let err = verifier.verify("").await.unwrap_err();
        assert!(matches!(err, AuthError::MissingCredentials));
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bearer_caches_positive_result() {
        let service = Arc::new(StaticIdentity::ok("user-1"));
        let verifier = BearerVerifier::new(service.clone());
        let first = verifier.verify("tok").await.unwrap();
        let second = verifier.verify("tok").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.owner_id, "user-1");
        assert_eq!(first.api_key_hash, None);
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bearer_cache_expires() {
        let service = Arc::new(StaticIdentity::ok("user-1"));
        let verifier = BearerVerifier::with_ttl(service.clone(), Duration::from_millis(0));
        verifier.verify("tok").await.unwrap();
        verifier.verify("tok").await.unwrap();
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_bearer_failure_is_not_cached() {
        let service = Arc::new(StaticIdentity::failing());
        let verifier = BearerVerifier::new(service.clone());
        assert!(verifier.verify("tok").await.is_err());
        assert!(verifier.verify("tok").await.is_err());
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }
}
