//! Axum HTTP + WebSocket server: upstream agents at `/agent`, viewers at
//! `/terminal`, REST session list at `/api/v1/sessions`, plus a service
//! banner and health probe.
//!
//! Credentials arrive as an `X-API-Key` header, an `Authorization: Bearer`
//! header, or a `Sec-WebSocket-Protocol` entry prefixed `omnara-key.` /
//! `omnara-supabase.` for browsers that cannot set headers. A subprotocol
//! credential is echoed back on accept, as the browser WebSocket spec
//! requires.

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

use common::auth::{
    ApiKeyVerifier, AuthError, BearerVerifier, Credentials, HttpIdentityService,
};
use common::config::RelayConfig;
use common::session::SessionManager;

use crate::{reaper, upstream, viewer};

pub(crate) const API_KEY_PROTOCOL_PREFIX: &str = "omnara-key.";
pub(crate) const SUPABASE_PROTOCOL_PREFIX: &str = "omnara-supabase.";

/// Parsed credentials plus the subprotocol to echo on accept, if any.
#[derive(Debug)]
pub(crate) struct CredentialBundle {
    pub credentials: Credentials,
    pub negotiated_protocol: Option<String>,
}

/// Maps incoming request headers to an authenticated identity.
pub struct CredentialVerifier {
    api_keys: Option<ApiKeyVerifier>,
    bearer: Option<BearerVerifier>,
}

impl CredentialVerifier {
    pub fn from_config(config: &RelayConfig) -> Self {
        let api_keys = config.jwt_public_key.as_deref().and_then(|pem| {
            match ApiKeyVerifier::from_rsa_pem(pem) {
                Ok(verifier) => Some(verifier),
                Err(err) => {
                    log::error!("ignoring configured JWT public key: {err}");
                    None
                }
            }
        });
        let bearer = config
            .identity_url
            .as_deref()
            .map(|url| BearerVerifier::new(Arc::new(HttpIdentityService::new(url))));
        Self { api_keys, bearer }
    }

    pub(crate) fn new(api_keys: Option<ApiKeyVerifier>, bearer: Option<BearerVerifier>) -> Self {
        Self { api_keys, bearer }
    }

    /// Parse headers/subprotocols in the same precedence order the viewers
    /// and wrappers use: explicit API-key header, bearer header, then
    /// subprotocol negotiation.
    pub(crate) async fn extract(&self, headers: &HeaderMap) -> Result<CredentialBundle, AuthError> {
        if let Some(api_key) = header_str(headers, "x-api-key") {
            return Ok(CredentialBundle {
                credentials: self.verify_api_key(api_key)?,
                negotiated_protocol: None,
            });
        }

        if let Some(authorization) = header_str(headers, "authorization") {
            if let Some(token) = strip_bearer(authorization) {
                return Ok(CredentialBundle {
                    credentials: self.verify_bearer(token).await?,
                    negotiated_protocol: None,
                });
            }
        }

        if let Some(protocols) = header_str(headers, "sec-websocket-protocol") {
            for candidate in protocols.split(',').map(str::trim) {
                if let Some(api_key) = candidate.strip_prefix(API_KEY_PROTOCOL_PREFIX) {
                    return Ok(CredentialBundle {
                        credentials: self.verify_api_key(api_key)?,
                        negotiated_protocol: Some(candidate.to_string()),
                    });
                }
                if let Some(token) = candidate.strip_prefix(SUPABASE_PROTOCOL_PREFIX) {
                    return Ok(CredentialBundle {
                        credentials: self.verify_bearer(token).await?,
                        negotiated_protocol: Some(candidate.to_string()),
                    });
                }
            }
        }

        Err(AuthError::MissingCredentials)
    }

    fn verify_api_key(&self, api_key: &str) -> Result<Credentials, AuthError> {
        self.api_keys
            .as_ref()
            .ok_or(AuthError::Unconfigured("API key verification"))?
            .verify(api_key)
    }

    async fn verify_bearer(&self, token: &str) -> Result<Credentials, AuthError> {
        self.bearer
            .as_ref()
            .ok_or(AuthError::Unconfigured("bearer token verification"))?
            .verify(token)
            .await
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

fn strip_bearer(authorization: &str) -> Option<&str> {
    let (scheme, token) = authorization.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Shared handler state: the session registry and the credential verifier.
#[derive(Clone)]
pub struct RelayState {
    pub manager: Arc<SessionManager>,
    pub verifier: Arc<CredentialVerifier>,
}

#[derive(serde::Deserialize)]
struct AgentQuery {
    session_id: Option<String>,
}

pub(crate) fn router(state: RelayState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/api/v1/sessions", get(list_sessions_handler))
        .route("/agent", get(agent_ws_handler))
        .route("/terminal", get(terminal_ws_handler))
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-api-key"),
        ])
        .allow_credentials(true)
}

/// Runs the relay server: binds the listener, starts the reaper, serves until
/// shutdown. Call from a binary via `Runtime::block_on`.
pub async fn run_relay_server(config: RelayConfig) -> anyhow::Result<()> {
    common::config::ensure_rustls_provider();

    let manager = Arc::new(SessionManager::new(
        config.history_bytes,
        config.ended_retention_secs,
    ));
    let verifier = Arc::new(CredentialVerifier::from_config(&config));
    let state = RelayState {
        manager: Arc::clone(&manager),
        verifier,
    };

    let _reaper = reaper::spawn(manager, Duration::from_secs(config.heartbeat_interval_secs));

    let app = router(state, &config.allowed_origins);
    let addr = format!("{}:{}", config.ws_host, config.ws_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))?;
    log::info!("relay listening on {addr} (agents: /agent, viewers: /terminal)");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({
        "message": "Omnara Terminal Relay",
        "endpoints": {
            "agent": "/agent (WebSocket for agent connections)",
            "viewer": "/terminal (WebSocket for terminal viewers)",
            "sessions": "/api/v1/sessions (List active sessions)",
        },
    }))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy", "server": "relay"}))
}

async fn list_sessions_handler(State(state): State<RelayState>, headers: HeaderMap) -> Response {
    let bundle = match state.verifier.extract(&headers).await {
        Ok(bundle) => bundle,
        Err(err) => {
            log::debug!("session list auth failed: {err}");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": err.wire_message()})),
            )
                .into_response();
        }
    };
    let credentials = bundle.credentials;
    let sessions: Vec<_> = state
        .manager
        .sessions_for(&credentials.owner_id, credentials.api_key_hash.as_deref())
        .iter()
        .map(|session| session.descriptor())
        .collect();
    Json(json!({"sessions": sessions})).into_response()
}

async fn agent_ws_handler(
    State(state): State<RelayState>,
    Query(query): Query<AgentQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let auth = state.verifier.extract(&headers).await;
    let ws = echo_subprotocol(ws, &auth);
    ws.on_upgrade(move |socket| upstream::handle_agent(socket, state, auth, query.session_id))
}

async fn terminal_ws_handler(
    State(state): State<RelayState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let auth = state.verifier.extract(&headers).await;
    let ws = echo_subprotocol(ws, &auth);
    ws.on_upgrade(move |socket| viewer::handle_terminal(socket, state, auth))
}

fn echo_subprotocol(
    ws: WebSocketUpgrade,
    auth: &Result<CredentialBundle, AuthError>,
) -> WebSocketUpgrade {
    match auth {
        Ok(CredentialBundle {
            negotiated_protocol: Some(protocol),
            ..
        }) => ws.protocols([protocol.clone()]),
        _ => ws,
    }
}
