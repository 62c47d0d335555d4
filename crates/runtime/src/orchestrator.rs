//! The connect state machine.
//!
//! Stdio definitions spawn and connect directly. HTTP definitions try
//! streamable HTTP first and fall back to SSE on non-auth failures. An
//! unauthorized response triggers the OAuth machinery: ad-hoc anonymous
//! definitions are promoted to `auth = oauth` (at most once per connect)
//! and, with a session in hand, each unauthorized connect attempt waits
//! for a browser authorization code before retrying, up to the attempt
//! budget.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;

use mcporter_client::{McpClient, McpTransport, SseTransport, StdioTransport, StreamableHttpTransport};
use mcporter_domain::{expand, CommandSpec, Error, Result, ServerDefinition};

use crate::oauth::OauthSession;
use crate::pool::Connection;
use crate::runtime::Registry;

/// Default budget for interactive OAuth retries within one connect call.
pub const DEFAULT_MAX_OAUTH_ATTEMPTS: u32 = 3;

/// Everything a connect attempt needs from the runtime.
#[derive(Clone)]
pub(crate) struct ConnectContext {
    pub registry: Arc<Registry>,
    pub http: reqwest::Client,
    pub client_name: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Unauthorized classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Single predicate for "this failure means we are not authorized".
///
/// Accepts the typed [`Error::Unauthorized`] or a stringified message that
/// looks like one. The tolerant match is deliberate: upstream servers
/// return wildly different error shapes.
pub fn is_unauthorized(err: &Error) -> bool {
    if matches!(err.root(), Error::Unauthorized(_)) {
        return true;
    }
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(401|403)\b|unauthorized|invalid[_-]?token|forbidden")
            .expect("unauthorized pattern is valid")
    });
    pattern.is_match(&err.root().to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Establish a connection to `name`, consulting the registry for the
/// active definition on every pass so OAuth promotion survives retries.
pub(crate) async fn establish(
    ctx: &ConnectContext,
    name: &str,
    max_oauth_attempts: u32,
) -> Result<Arc<Connection>> {
    // Promotion happens at most once per logical connect call.
    let mut promoted = false;

    loop {
        let def = ctx.registry.get(name)?;
        let result = match &def.command {
            CommandSpec::Stdio { .. } => connect_stdio(ctx, &def).await,
            CommandSpec::Http { .. } => connect_http(ctx, &def, max_oauth_attempts).await,
        };

        match result {
            Ok(connection) => return Ok(connection),
            Err(err)
                if !promoted
                    && max_oauth_attempts > 0
                    && is_unauthorized(&err)
                    && def.source.is_adhoc()
                    && !def.uses_oauth() =>
            {
                promoted = true;
                let successor = def.promoted_to_oauth();
                tracing::info!(
                    server = name,
                    cache_dir = ?successor.token_cache_dir,
                    "unauthorized response, promoting server to OAuth"
                );
                // The successor persists even if the retry below fails, so
                // later connects already know to use OAuth.
                ctx.registry.replace(successor);
            }
            Err(err) => return Err(err),
        }
    }
}

async fn connect_stdio(ctx: &ConnectContext, def: &ServerDefinition) -> Result<Arc<Connection>> {
    if def.uses_oauth() {
        return Err(Error::OAuthUnsupported(format!(
            "server '{}' is configured for OAuth but speaks stdio",
            def.name
        )));
    }
    let CommandSpec::Stdio { command, args, cwd } = &def.command else {
        unreachable!("connect_stdio called for a non-stdio definition");
    };

    // Resolve env templates now, not at load time, so environment changes
    // between calls take effect. Entries resolving to empty are dropped.
    let mut env = BTreeMap::new();
    if let Some(templates) = &def.env {
        for (key, template) in templates {
            let value = expand::resolve(template)?;
            if value.is_empty() {
                tracing::debug!(server = %def.name, var = %key, "dropping empty env entry");
                continue;
            }
            env.insert(key.clone(), value);
        }
    }

    let transport = StdioTransport::spawn(command, args, cwd, env)?;
    let client = McpClient::new(Box::new(transport), &ctx.client_name);
    match client.connect().await {
        Ok(_) => Ok(Arc::new(Connection {
            name: def.name.clone(),
            client,
            oauth: None,
        })),
        Err(err) => {
            client.close().await;
            Err(err)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum HttpFlavor {
    Streamable,
    Sse,
}

async fn connect_http(
    ctx: &ConnectContext,
    def: &ServerDefinition,
    max_oauth_attempts: u32,
) -> Result<Arc<Connection>> {
    let session = if def.uses_oauth() {
        Some(OauthSession::start(def, ctx.http.clone()).await?)
    } else {
        None
    };

    let streamable =
        attempt(ctx, def, HttpFlavor::Streamable, session.as_ref(), max_oauth_attempts).await;
    let client = match streamable {
        Ok(client) => client,
        Err(err) if is_unauthorized(&err) => {
            // Auth problems go back to the promotion path, not to SSE.
            close_session(session);
            return Err(err);
        }
        Err(streamable_err) => {
            tracing::debug!(
                server = %def.name,
                error = %streamable_err,
                "streamable HTTP failed, falling back to SSE"
            );
            match attempt(ctx, def, HttpFlavor::Sse, session.as_ref(), max_oauth_attempts).await {
                Ok(client) => client,
                Err(err) => {
                    close_session(session);
                    return Err(err);
                }
            }
        }
    };

    Ok(Arc::new(Connection {
        name: def.name.clone(),
        client,
        oauth: session,
    }))
}

fn close_session(session: Option<OauthSession>) {
    if let Some(session) = session {
        session.close();
    }
}

/// One transport flavor, with the bounded interactive-auth retry loop.
async fn attempt(
    ctx: &ConnectContext,
    def: &ServerDefinition,
    flavor: HttpFlavor,
    session: Option<&OauthSession>,
    max_oauth_attempts: u32,
) -> Result<McpClient> {
    let CommandSpec::Http { url, headers } = &def.command else {
        unreachable!("attempt called for a non-http definition");
    };

    let mut auth_attempts = 0u32;
    loop {
        // Headers resolve at materialization time (late binding).
        let mut resolved = BTreeMap::new();
        for (name, template) in headers {
            resolved.insert(name.clone(), expand::resolve(template)?);
        }
        let token = session.map(OauthSession::token_provider);

        let connected = async {
            let transport: Box<dyn McpTransport> = match flavor {
                HttpFlavor::Streamable => Box::new(StreamableHttpTransport::new(
                    ctx.http.clone(),
                    url,
                    resolved,
                    token,
                )),
                HttpFlavor::Sse => Box::new(
                    SseTransport::connect(ctx.http.clone(), url, resolved, token).await?,
                ),
            };
            let client = McpClient::new(transport, &ctx.client_name);
            match client.connect().await {
                Ok(_) => Ok(client),
                Err(err) => {
                    client.close().await;
                    Err(err)
                }
            }
        }
        .await;

        match connected {
            Ok(client) => return Ok(client),
            Err(err) if is_unauthorized(&err) && auth_attempts < max_oauth_attempts => {
                let Some(session) = session else {
                    return Err(err);
                };
                auth_attempts += 1;
                tracing::info!(
                    server = %def.name,
                    attempt = auth_attempts,
                    "unauthorized, waiting for browser authorization"
                );
                let code = session.wait_for_authorization_code().await?;
                session.finish_auth(&code).await?;
            }
            Err(err) => return Err(err),
        }
    }
}
