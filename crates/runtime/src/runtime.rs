//! The `Runtime` façade: definition registry, pooled connects, and the
//! public operation surface.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;

use mcporter_client::protocol::ToolCallResult;
use mcporter_domain::{
    normalize, DefinitionSource, Error, RawEntry, Result, ServerDefinition,
};

use crate::imports::ImportRoots;
use crate::loader::Loader;
use crate::orchestrator::{self, ConnectContext, DEFAULT_MAX_OAUTH_ATTEMPTS};
use crate::pool::{Connection, ConnectionPool};

/// Millisecond overrides for the façade timeouts.
pub const LIST_TIMEOUT_ENV: &str = "MCPORTER_LIST_TIMEOUT";
pub const CALL_TIMEOUT_ENV: &str = "MCPORTER_CALL_TIMEOUT";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The single mutable map of definitions. `register_definition` and the
/// OAuth promotion path both write through this lock.
pub struct Registry {
    inner: RwLock<HashMap<String, ServerDefinition>>,
}

impl Registry {
    fn new(definitions: Vec<ServerDefinition>) -> Self {
        let inner = definitions
            .into_iter()
            .map(|def| (def.name.clone(), def))
            .collect();
        Self {
            inner: RwLock::new(inner),
        }
    }

    pub(crate) fn get(&self, name: &str) -> Result<ServerDefinition> {
        self.inner
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownServer(name.to_string()))
    }

    fn insert(&self, def: ServerDefinition, overwrite: bool) -> Result<()> {
        let mut inner = self.inner.write();
        if !overwrite && inner.contains_key(&def.name) {
            return Err(Error::DuplicateServer(def.name));
        }
        inner.insert(def.name.clone(), def);
        Ok(())
    }

    /// Unconditional swap used by OAuth promotion.
    pub(crate) fn replace(&self, def: ServerDefinition) {
        self.inner.write().insert(def.name.clone(), def);
    }

    fn names_sorted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn snapshot(&self) -> Vec<ServerDefinition> {
        let mut defs: Vec<ServerDefinition> = self.inner.read().values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Build a fresh connection and never store it in the pool.
    pub skip_cache: bool,
    /// Interactive OAuth budget; 0 disables browser flows entirely.
    pub max_oauth_attempts: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            skip_cache: false,
            max_oauth_attempts: DEFAULT_MAX_OAUTH_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListToolsOptions {
    /// Include each tool's JSON schema in the result.
    pub include_schema: bool,
    /// When false, the listing runs on an ephemeral connection with no
    /// interactive auth and disposes it before returning.
    pub auto_authorize: bool,
    pub timeout: Option<Duration>,
}

impl Default for ListToolsOptions {
    fn default() -> Self {
        Self {
            include_schema: false,
            auto_authorize: true,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
}

/// One tool as reported by `list_tools`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerToolInfo {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RuntimeBuilder {
    config_path: Option<PathBuf>,
    root: Option<PathBuf>,
    import_roots: Option<ImportRoots>,
    client_name: String,
    list_timeout: Option<Duration>,
    call_timeout: Option<Duration>,
}

impl RuntimeBuilder {
    fn new() -> Self {
        Self {
            config_path: None,
            root: None,
            import_roots: None,
            client_name: "mcporter".into(),
            list_timeout: None,
            call_timeout: None,
        }
    }

    /// Explicit config file; parse failures become fatal.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Project root for config and import discovery (default: the process
    /// working directory).
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Full control over the probed directories (used by tests).
    pub fn import_roots(mut self, roots: ImportRoots) -> Self {
        self.import_roots = Some(roots);
        self
    }

    /// Name reported to servers during the MCP handshake.
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn list_timeout(mut self, timeout: Duration) -> Self {
        self.list_timeout = Some(timeout);
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Load definitions and construct the runtime.
    pub fn load(self) -> Result<Runtime> {
        let roots = match self.import_roots {
            Some(roots) => roots,
            None => {
                let root = match self.root {
                    Some(root) => root,
                    None => std::env::current_dir()?,
                };
                ImportRoots::discover(root)
            }
        };

        let loader = Loader::new(self.config_path, roots);
        let definitions = loader.load()?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Transport(format!("building HTTP client: {e}")))?;

        Ok(Runtime {
            registry: Arc::new(Registry::new(definitions)),
            pool: ConnectionPool::new(),
            http,
            client_name: self.client_name,
            list_timeout: self
                .list_timeout
                .unwrap_or_else(|| env_timeout(LIST_TIMEOUT_ENV)),
            call_timeout: self
                .call_timeout
                .unwrap_or_else(|| env_timeout(CALL_TIMEOUT_ENV)),
        })
    }
}

fn env_timeout(var: &str) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_TIMEOUT)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The long-lived MCP runtime: merged definitions plus a pool of live
/// connections.
pub struct Runtime {
    registry: Arc<Registry>,
    pool: ConnectionPool,
    http: reqwest::Client,
    client_name: String,
    list_timeout: Duration,
    call_timeout: Duration,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Sorted server names.
    pub fn list_servers(&self) -> Vec<String> {
        self.registry.names_sorted()
    }

    /// Snapshot of every definition, sorted by name.
    pub fn definitions(&self) -> Vec<ServerDefinition> {
        self.registry.snapshot()
    }

    pub fn definition(&self, name: &str) -> Result<ServerDefinition> {
        self.registry.get(name)
    }

    /// Add a definition. Without `overwrite`, a name collision is a
    /// [`Error::DuplicateServer`].
    pub fn register_definition(&self, def: ServerDefinition, overwrite: bool) -> Result<()> {
        self.registry.insert(def, overwrite)
    }

    /// Synthesize and register an ad-hoc HTTP definition. Ad-hoc servers
    /// are the only ones eligible for automatic OAuth promotion.
    pub fn register_adhoc(&self, name: &str, url: &str) -> Result<ServerDefinition> {
        let raw = RawEntry {
            url: Some(url.to_string()),
            ..RawEntry::default()
        };
        let cwd = std::env::current_dir()?;
        let def = normalize(name, &raw, &cwd, DefinitionSource::adhoc())?;
        self.registry.insert(def.clone(), false)?;
        Ok(def)
    }

    fn context(&self) -> ConnectContext {
        ConnectContext {
            registry: self.registry.clone(),
            http: self.http.clone(),
            client_name: self.client_name.clone(),
        }
    }

    /// Connect to a server, through the pool unless `skip_cache` is set.
    pub async fn connect(&self, name: &str, opts: ConnectOptions) -> Result<Arc<Connection>> {
        let ctx = self.context();
        if opts.skip_cache {
            return orchestrator::establish(&ctx, name, opts.max_oauth_attempts).await;
        }
        let name_owned = name.to_string();
        let attempts = opts.max_oauth_attempts;
        self.pool
            .get_or_connect(name, async move {
                orchestrator::establish(&ctx, &name_owned, attempts).await
            })
            .await
    }

    /// List a server's tools.
    ///
    /// With `auto_authorize = false` the listing uses a fresh, uncached
    /// connection with no interactive auth, and always disposes it.
    pub async fn list_tools(
        &self,
        name: &str,
        opts: ListToolsOptions,
    ) -> Result<Vec<ServerToolInfo>> {
        let deadline = opts.timeout.unwrap_or(self.list_timeout);

        let tools = if opts.auto_authorize {
            self.race(name, deadline, async {
                let connection = self.connect(name, ConnectOptions::default()).await?;
                connection.client.list_tools().await
            })
            .await?
        } else {
            // Ephemeral path: fresh connection, no interactive auth, and
            // finally-style disposal regardless of how the listing went.
            let connection = match tokio::time::timeout(
                deadline,
                self.connect(
                    name,
                    ConnectOptions {
                        skip_cache: true,
                        max_oauth_attempts: 0,
                    },
                ),
            )
            .await
            {
                Ok(connection) => connection?,
                Err(_) => return Err(Error::Timeout(deadline)),
            };
            let result =
                tokio::time::timeout(deadline, connection.client.list_tools()).await;
            connection.close().await;
            match result {
                Ok(tools) => tools?,
                Err(_) => return Err(Error::Timeout(deadline)),
            }
        };

        Ok(tools
            .into_iter()
            .map(|tool| ServerToolInfo {
                name: tool.name,
                description: tool.description,
                input_schema: opts.include_schema.then_some(tool.input_schema),
            })
            .collect())
    }

    /// Call a tool. Tool-level faults are reported inside the returned
    /// envelope, not as an `Err`.
    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        args: Option<Value>,
        opts: CallOptions,
    ) -> Result<ToolCallResult> {
        let deadline = opts.timeout.unwrap_or(self.call_timeout);
        self.race(name, deadline, async {
            let connection = self.connect(name, ConnectOptions::default()).await?;
            connection.client.call_tool(tool, args).await
        })
        .await
    }

    /// List a server's resources (raw passthrough).
    pub async fn list_resources(
        &self,
        name: &str,
        params: Option<Value>,
        opts: CallOptions,
    ) -> Result<Value> {
        let deadline = opts.timeout.unwrap_or(self.list_timeout);
        self.race(name, deadline, async {
            let connection = self.connect(name, ConnectOptions::default()).await?;
            connection.client.list_resources(params).await
        })
        .await
    }

    /// Close one pooled connection.
    pub async fn close(&self, name: &str) {
        self.pool.close(name).await;
    }

    /// Close every pooled connection.
    pub async fn close_all(&self) {
        self.pool.close_all().await;
    }

    /// Race an operation against the façade deadline. On timeout the
    /// server's pooled entry is closed so a wedged transport cannot leak
    /// into the next call.
    async fn race<T>(
        &self,
        name: &str,
        deadline: Duration,
        operation: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(deadline, operation).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(server = name, ?deadline, "operation timed out, closing connection");
                self.close(name).await;
                Err(Error::Timeout(deadline))
            }
        }
    }
}
