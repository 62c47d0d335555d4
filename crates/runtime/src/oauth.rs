//! OAuth 2.0 authorization-code flow (PKCE) for HTTP MCP servers.
//!
//! A session binds a loopback callback listener, discovers the server's
//! authorization endpoints (RFC 8414, with conventional fallbacks), and
//! registers a client dynamically (RFC 7591) when the server supports it.
//! The browser opens lazily: only when the orchestrator actually waits for
//! an authorization code, so connects that ride on cached tokens stay
//! silent.
//!
//! Token lifecycle:
//! - Tokens persist at `<token_cache_dir>/tokens.json`, written
//!   temp-then-rename with `0o600` permissions on Unix.
//! - The token provider refreshes proactively when less than
//!   [`REFRESH_WINDOW_SECS`] of validity remains.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use mcporter_client::TokenProvider;
use mcporter_domain::{CommandSpec, Error, Result, ServerDefinition};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Proactive refresh window: refresh when less than a minute remains.
const REFRESH_WINDOW_SECS: i64 = 60;

/// Default `expires_in` when the token response omits it.
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

const TOKENS_FILE: &str = "tokens.json";
const CLIENT_FILE: &str = "client.json";

const CALLBACK_PAGE: &str =
    "<html><body><p>Authorization complete. You can close this window and return to mcporter.</p></body></html>";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persisted shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stored OAuth tokens for one server.
///
/// `Debug` is manually implemented to redact secrets.
#[derive(Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    /// Unix timestamp (seconds) when the access token expires.
    pub expires_at: i64,
}

impl OAuthTokens {
    fn remaining_secs(&self) -> i64 {
        self.expires_at - chrono::Utc::now().timestamp()
    }
}

impl std::fmt::Debug for OAuthTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthTokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Response from the token endpoint (initial grant and refresh).
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Cached dynamic client registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClientRegistration {
    client_id: String,
}

/// RFC 8414 authorization server metadata (the fields we use).
#[derive(Debug, Clone, Deserialize)]
pub struct AuthServerMetadata {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory view of the persisted tokens, shared between the session and
/// its token provider.
struct TokenCell {
    cache_dir: PathBuf,
    tokens: parking_lot::Mutex<Option<OAuthTokens>>,
}

impl TokenCell {
    fn load(cache_dir: PathBuf) -> Self {
        let tokens = read_tokens(&cache_dir.join(TOKENS_FILE));
        Self {
            cache_dir,
            tokens: parking_lot::Mutex::new(tokens),
        }
    }

    fn get(&self) -> Option<OAuthTokens> {
        self.tokens.lock().clone()
    }

    fn store(&self, tokens: OAuthTokens) -> Result<()> {
        let json = serde_json::to_string_pretty(&tokens)?;
        write_atomic(&self.cache_dir.join(TOKENS_FILE), &json)?;
        *self.tokens.lock() = Some(tokens);
        Ok(())
    }
}

fn read_tokens(path: &Path) -> Option<OAuthTokens> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(tokens) => Some(tokens),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt token cache");
            None
        }
    }
}

/// Write a file atomically: temp file in the same directory, `0o600` on
/// Unix, then rename over the target.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Auth(format!("no parent directory for {}", path.display())))?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    use std::io::Write;
    tmp.write_all(contents.as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))?;
    }

    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loopback callback listener
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CallbackParams {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

async fn callback_handler(
    State(tx): State<mpsc::Sender<CallbackParams>>,
    Query(params): Query<CallbackParams>,
) -> Html<&'static str> {
    let _ = tx.send(params).await;
    Html(CALLBACK_PAGE)
}

/// Bind the loopback listener and serve the callback route in a task.
pub(crate) async fn spawn_callback_listener(
    port_hint: u16,
) -> Result<(u16, mpsc::Receiver<CallbackParams>, tokio::task::JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port_hint))
        .await
        .map_err(|e| Error::Auth(format!("binding OAuth callback listener: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::Auth(format!("reading callback listener address: {e}")))?
        .port();

    let (tx, rx) = mpsc::channel(4);
    let app = axum::Router::new()
        .route("/callback", get(callback_handler))
        .with_state(tx);
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::debug!(error = %e, "OAuth callback listener stopped");
        }
    });

    Ok((port, rx, task))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One interactive authorization session for one server. Lives no longer
/// than the pooled connection that owns it; tokens outlive the process in
/// the token cache directory.
pub struct OauthSession {
    server_name: String,
    http: reqwest::Client,
    metadata: AuthServerMetadata,
    client_id: String,
    redirect_url: String,
    authorize_url: String,
    pkce_verifier: String,
    state: String,
    browser_opened: AtomicBool,
    code_rx: tokio::sync::Mutex<mpsc::Receiver<CallbackParams>>,
    listener: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    tokens: Arc<TokenCell>,
}

impl OauthSession {
    /// Prepare a session: bind the listener, discover endpoints, ensure a
    /// client registration, and prime cached tokens. Does not open a
    /// browser; that happens on the first [`wait_for_authorization_code`].
    ///
    /// [`wait_for_authorization_code`]: OauthSession::wait_for_authorization_code
    pub async fn start(def: &ServerDefinition, http: reqwest::Client) -> Result<Self> {
        let CommandSpec::Http { url, .. } = &def.command else {
            return Err(Error::OAuthUnsupported(format!(
                "server '{}' uses a stdio transport",
                def.name
            )));
        };

        let cache_dir = def.token_cache_dir();
        let origin = origin_of(url)?;
        let metadata = discover_metadata(&http, &origin).await;

        let port_hint = def
            .oauth_redirect_url
            .as_deref()
            .and_then(|u| reqwest::Url::parse(u).ok())
            .and_then(|u| u.port())
            .unwrap_or(0);
        let (port, code_rx, listener) = spawn_callback_listener(port_hint).await?;
        let redirect_url = format!("http://127.0.0.1:{port}/callback");

        let client_name = def.client_name.clone().unwrap_or_else(|| "mcporter".into());
        let client_id =
            ensure_client_id(&http, &metadata, &cache_dir, &client_name, &redirect_url).await?;

        let (pkce_verifier, pkce_challenge) = pkce_pair();
        let state = random_token();
        let authorize_url = build_authorize_url(
            &metadata.authorization_endpoint,
            &client_id,
            &redirect_url,
            &state,
            &pkce_challenge,
        )?;

        Ok(Self {
            server_name: def.name.clone(),
            http,
            metadata,
            client_id,
            redirect_url,
            authorize_url,
            pkce_verifier,
            state,
            browser_opened: AtomicBool::new(false),
            code_rx: tokio::sync::Mutex::new(code_rx),
            listener: parking_lot::Mutex::new(Some(listener)),
            tokens: Arc::new(TokenCell::load(cache_dir)),
        })
    }

    /// Open the browser (first call only; later calls just print the URL)
    /// and block until the loopback callback delivers an authorization
    /// code. Cancel by dropping the future; the listener stays usable.
    pub async fn wait_for_authorization_code(&self) -> Result<String> {
        if !self.browser_opened.swap(true, Ordering::SeqCst) {
            match open::that(&self.authorize_url) {
                Ok(()) => {
                    tracing::info!(server = %self.server_name, "opened browser for authorization")
                }
                Err(e) => tracing::info!(
                    server = %self.server_name,
                    error = %e,
                    "could not open a browser; visit {} to authorize",
                    self.authorize_url
                ),
            }
        } else {
            tracing::info!(
                server = %self.server_name,
                "waiting for authorization; visit {} if no browser opened",
                self.authorize_url
            );
        }

        let mut rx = self.code_rx.lock().await;
        loop {
            let params = rx.recv().await.ok_or_else(|| {
                Error::Auth("OAuth callback listener closed before a code arrived".into())
            })?;

            if let Some(error) = params.error {
                let detail = params.error_description.unwrap_or_default();
                return Err(Error::Auth(format!(
                    "authorization failed: {error} {detail}"
                )));
            }
            if params.state.as_deref() != Some(self.state.as_str()) {
                tracing::warn!(server = %self.server_name, "ignoring OAuth callback with wrong state");
                continue;
            }
            match params.code {
                Some(code) => return Ok(code),
                None => {
                    tracing::warn!(server = %self.server_name, "ignoring OAuth callback without a code")
                }
            }
        }
    }

    /// Exchange an authorization code for tokens and persist them.
    pub async fn finish_auth(&self, code: &str) -> Result<()> {
        let response = self
            .http
            .post(&self.metadata.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", &self.redirect_url),
                ("client_id", &self.client_id),
                ("code_verifier", &self.pkce_verifier),
            ])
            .send()
            .await
            .map_err(|e| Error::Auth(format!("token exchange request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Auth(format!("reading token response: {e}")))?;
        if !status.is_success() {
            return Err(Error::Auth(format!(
                "token exchange returned HTTP {}: {body}",
                status.as_u16()
            )));
        }

        let token_resp: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Auth(format!("parsing token response: {e}")))?;
        self.tokens.store(into_tokens(token_resp, None))?;
        tracing::info!(server = %self.server_name, "authorization complete, tokens cached");
        Ok(())
    }

    /// The capability HTTP transports consume to attach bearer tokens.
    pub fn token_provider(&self) -> Arc<dyn TokenProvider> {
        Arc::new(OauthTokenProvider {
            http: self.http.clone(),
            token_endpoint: self.metadata.token_endpoint.clone(),
            client_id: self.client_id.clone(),
            tokens: self.tokens.clone(),
        })
    }

    /// Tear down the callback listener.
    pub fn close(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }
}

impl Drop for OauthSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn into_tokens(resp: TokenResponse, previous_refresh: Option<String>) -> OAuthTokens {
    let expires_in = resp.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
    OAuthTokens {
        access_token: resp.access_token,
        refresh_token: resp
            .refresh_token
            .or(previous_refresh)
            .unwrap_or_default(),
        expires_at: chrono::Utc::now().timestamp() + expires_in as i64,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct OauthTokenProvider {
    http: reqwest::Client,
    token_endpoint: String,
    client_id: String,
    tokens: Arc<TokenCell>,
}

#[async_trait]
impl TokenProvider for OauthTokenProvider {
    async fn bearer_token(&self) -> Result<Option<String>> {
        let Some(tokens) = self.tokens.get() else {
            return Ok(None);
        };

        if tokens.remaining_secs() > REFRESH_WINDOW_SECS {
            return Ok(Some(tokens.access_token));
        }
        if tokens.refresh_token.is_empty() {
            // Nothing to refresh with; let the server decide.
            return Ok(Some(tokens.access_token));
        }

        tracing::debug!(remaining_secs = tokens.remaining_secs(), "refreshing OAuth access token");
        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", &tokens.refresh_token),
                ("client_id", &self.client_id),
            ])
            .send()
            .await
            .map_err(|e| Error::Auth(format!("token refresh request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Auth(format!("reading refresh response: {e}")))?;
        if !status.is_success() {
            return Err(Error::Auth(format!(
                "token refresh returned HTTP {}: {body}",
                status.as_u16()
            )));
        }

        let token_resp: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Auth(format!("parsing refresh response: {e}")))?;
        let refreshed = into_tokens(token_resp, Some(tokens.refresh_token));
        let access = refreshed.access_token.clone();
        if let Err(e) = self.tokens.store(refreshed) {
            tracing::warn!(error = %e, "failed to persist refreshed token, using it in memory");
        }
        Ok(Some(access))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Discovery, registration, PKCE
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn origin_of(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| Error::Auth(format!("bad server url '{url}': {e}")))?;
    let origin = parsed.origin().ascii_serialization();
    if origin == "null" {
        return Err(Error::Auth(format!("server url '{url}' has no origin")));
    }
    Ok(origin)
}

/// RFC 8414 discovery with conventional fallbacks for servers that do not
/// publish metadata.
async fn discover_metadata(http: &reqwest::Client, origin: &str) -> AuthServerMetadata {
    let well_known = format!("{origin}/.well-known/oauth-authorization-server");
    match http.get(&well_known).send().await {
        Ok(resp) if resp.status().is_success() => match resp.json::<AuthServerMetadata>().await {
            Ok(metadata) => return metadata,
            Err(e) => {
                tracing::debug!(url = %well_known, error = %e, "bad authorization server metadata")
            }
        },
        Ok(resp) => {
            tracing::debug!(url = %well_known, status = %resp.status(), "no authorization server metadata")
        }
        Err(e) => tracing::debug!(url = %well_known, error = %e, "metadata discovery failed"),
    }

    AuthServerMetadata {
        authorization_endpoint: format!("{origin}/authorize"),
        token_endpoint: format!("{origin}/token"),
        registration_endpoint: Some(format!("{origin}/register")),
    }
}

/// Use the cached client registration, or register dynamically, or fall
/// back to the configured client name as a public client id.
async fn ensure_client_id(
    http: &reqwest::Client,
    metadata: &AuthServerMetadata,
    cache_dir: &Path,
    client_name: &str,
    redirect_url: &str,
) -> Result<String> {
    let client_path = cache_dir.join(CLIENT_FILE);
    if let Ok(raw) = std::fs::read_to_string(&client_path) {
        if let Ok(cached) = serde_json::from_str::<ClientRegistration>(&raw) {
            return Ok(cached.client_id);
        }
        tracing::warn!(path = %client_path.display(), "ignoring corrupt client registration cache");
    }

    let Some(registration_endpoint) = &metadata.registration_endpoint else {
        return Ok(client_name.to_string());
    };

    let request = serde_json::json!({
        "client_name": client_name,
        "redirect_uris": [redirect_url],
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
        "token_endpoint_auth_method": "none",
    });

    match http.post(registration_endpoint).json(&request).send().await {
        Ok(resp) if resp.status().is_success() => {
            let registration: ClientRegistration = resp
                .json()
                .await
                .map_err(|e| Error::Auth(format!("parsing registration response: {e}")))?;
            let json = serde_json::to_string_pretty(&registration)?;
            if let Err(e) = write_atomic(&client_path, &json) {
                tracing::warn!(error = %e, "failed to cache client registration");
            }
            Ok(registration.client_id)
        }
        Ok(resp) => {
            tracing::debug!(
                endpoint = %registration_endpoint,
                status = %resp.status(),
                "dynamic registration rejected, using client name as id"
            );
            Ok(client_name.to_string())
        }
        Err(e) => {
            tracing::debug!(
                endpoint = %registration_endpoint,
                error = %e,
                "dynamic registration unreachable, using client name as id"
            );
            Ok(client_name.to_string())
        }
    }
}

fn build_authorize_url(
    endpoint: &str,
    client_id: &str,
    redirect_url: &str,
    state: &str,
    challenge: &str,
) -> Result<String> {
    let mut url = reqwest::Url::parse(endpoint)
        .map_err(|e| Error::Auth(format!("bad authorization endpoint '{endpoint}': {e}")))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_url)
        .append_pair("state", state)
        .append_pair("code_challenge", challenge)
        .append_pair("code_challenge_method", "S256");
    Ok(url.into())
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// PKCE S256 pair: `(verifier, challenge)`.
fn pkce_pair() -> (String, String) {
    let verifier = random_token();
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    (verifier, challenge)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
