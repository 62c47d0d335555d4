//! Normalized server definitions.
//!
//! A [`ServerDefinition`] is the canonical, immutable description of one MCP
//! server: how to reach it (HTTP URL or stdio command), which environment and
//! headers to apply at connect time, and where it came from. Definitions are
//! produced by the loader (or registered ad hoc) and live in the runtime's
//! registry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Sentinel `source.path` for definitions synthesized outside any config file.
///
/// Only ad-hoc definitions are eligible for automatic OAuth promotion after
/// an unauthorized connect.
pub const ADHOC_PATH: &str = "<adhoc>";

/// Authorization scheme for a server. Only OAuth is recognized; unknown
/// values in raw entries are discarded during normalization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    Oauth,
}

/// How to reach the server: an HTTP(S) endpoint or a local child process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CommandSpec {
    Http {
        url: String,
        /// Header values may contain `${VAR}` placeholders; they are resolved
        /// at transport materialization, never at load time.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        cwd: PathBuf,
    },
}

impl CommandSpec {
    pub fn is_http(&self) -> bool {
        matches!(self, CommandSpec::Http { .. })
    }

    pub fn is_stdio(&self) -> bool {
        matches!(self, CommandSpec::Stdio { .. })
    }
}

/// Which file contributed a definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DefinitionSource {
    /// The primary mcporter config, or the [`ADHOC_PATH`] sentinel.
    Local { path: PathBuf },
    /// A foreign editor config discovered via the import readers.
    Import { path: PathBuf },
}

impl DefinitionSource {
    /// Source for a definition synthesized at the API boundary.
    pub fn adhoc() -> Self {
        DefinitionSource::Local {
            path: PathBuf::from(ADHOC_PATH),
        }
    }

    pub fn is_adhoc(&self) -> bool {
        matches!(self, DefinitionSource::Local { path } if path == Path::new(ADHOC_PATH))
    }

    pub fn path(&self) -> &Path {
        match self {
            DefinitionSource::Local { path } | DefinitionSource::Import { path } => path,
        }
    }
}

/// A normalized MCP server definition. Immutable after load; the OAuth
/// promotion path replaces the whole definition rather than mutating it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub command: CommandSpec,
    /// Environment template strings, resolved at spawn time so that process
    /// environment changes between calls take effect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthScheme>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_cache_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_redirect_url: Option<String>,
    pub source: DefinitionSource,
}

impl ServerDefinition {
    /// Default token cache directory for a server: `<home>/.mcporter/<name>`.
    pub fn default_token_cache_dir(name: &str) -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mcporter")
            .join(name)
    }

    /// Effective token cache directory (configured or default).
    pub fn token_cache_dir(&self) -> PathBuf {
        self.token_cache_dir
            .clone()
            .unwrap_or_else(|| Self::default_token_cache_dir(&self.name))
    }

    pub fn uses_oauth(&self) -> bool {
        self.auth == Some(AuthScheme::Oauth)
    }

    /// The successor definition produced by OAuth promotion: `auth = oauth`
    /// and an assigned token cache directory, all other fields unchanged.
    pub fn promoted_to_oauth(&self) -> ServerDefinition {
        let mut def = self.clone();
        def.auth = Some(AuthScheme::Oauth);
        if def.token_cache_dir.is_none() {
            def.token_cache_dir = Some(Self::default_token_cache_dir(&def.name));
        }
        def
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_def(name: &str) -> ServerDefinition {
        ServerDefinition {
            name: name.into(),
            description: None,
            command: CommandSpec::Http {
                url: "https://example.com/mcp".into(),
                headers: BTreeMap::new(),
            },
            env: None,
            auth: None,
            token_cache_dir: None,
            client_name: None,
            oauth_redirect_url: None,
            source: DefinitionSource::adhoc(),
        }
    }

    #[test]
    fn adhoc_source_uses_sentinel_path() {
        let source = DefinitionSource::adhoc();
        assert!(source.is_adhoc());
        assert_eq!(source.path(), Path::new(ADHOC_PATH));
    }

    #[test]
    fn import_source_is_not_adhoc() {
        let source = DefinitionSource::Import {
            path: PathBuf::from("/home/u/.codex/config.toml"),
        };
        assert!(!source.is_adhoc());
    }

    #[test]
    fn promotion_sets_oauth_and_cache_dir_only() {
        let def = http_def("X");
        let promoted = def.promoted_to_oauth();
        assert_eq!(promoted.auth, Some(AuthScheme::Oauth));
        assert!(promoted
            .token_cache_dir
            .as_ref()
            .is_some_and(|p| p.ends_with(".mcporter/X")));

        // Nothing else changed.
        assert_eq!(promoted.name, def.name);
        assert_eq!(promoted.command, def.command);
        assert_eq!(promoted.env, def.env);
        assert_eq!(promoted.source, def.source);
    }

    #[test]
    fn promotion_keeps_configured_cache_dir() {
        let mut def = http_def("X");
        def.token_cache_dir = Some(PathBuf::from("/custom/cache"));
        let promoted = def.promoted_to_oauth();
        assert_eq!(promoted.token_cache_dir.as_deref(), Some(Path::new("/custom/cache")));
    }

    #[test]
    fn promotion_is_idempotent() {
        let def = http_def("X").promoted_to_oauth();
        assert_eq!(def.promoted_to_oauth(), def);
    }

    #[test]
    fn definition_serde_roundtrip() {
        let def = ServerDefinition {
            name: "local".into(),
            description: Some("a local tool server".into()),
            command: CommandSpec::Stdio {
                command: "npx".into(),
                args: vec!["-y".into(), "@modelcontextprotocol/server-filesystem".into()],
                cwd: PathBuf::from("/work"),
            },
            env: Some(BTreeMap::from([("TOKEN".into(), "${TOKEN}".into())])),
            auth: None,
            token_cache_dir: None,
            client_name: None,
            oauth_redirect_url: None,
            source: DefinitionSource::Local {
                path: PathBuf::from("/work/config/mcporter.json"),
            },
        };
        let json = serde_json::to_string(&def).unwrap();
        let parsed: ServerDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, def);
    }
}
