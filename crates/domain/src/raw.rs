//! Raw config entries and normalization.
//!
//! [`RawEntry`] is the union of every recognized editor config shape: the
//! primary mcporter file, Cursor/Claude/VS Code/Windsurf JSON, and codex
//! TOML tables. Unknown keys are ignored. [`normalize`] turns a raw entry
//! into a [`ServerDefinition`] under fixed rules; normalization is
//! idempotent.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::definition::{AuthScheme, CommandSpec, DefinitionSource, ServerDefinition};
use crate::error::{Error, Result};

/// `Accept` value required by streamable HTTP servers.
pub const DEFAULT_ACCEPT: &str = "application/json, text/event-stream";

/// `args` accepts either an array of strings or a single string that is
/// split with shell quoting rules during normalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ArgList {
    Many(Vec<String>),
    One(String),
}

/// A pre-normalization server entry as found in config files.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RawEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    // Any of these makes the entry HTTP; first present wins in this order.
    #[serde(alias = "base_url", skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(alias = "server_url", skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<ArgList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    /// Codex TOML shorthand; becomes an `Authorization: Bearer …` header.
    #[serde(alias = "bearer_token", skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(alias = "token_cache_dir", skip_serializing_if = "Option::is_none")]
    pub token_cache_dir: Option<PathBuf>,
    #[serde(alias = "client_name", skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(alias = "oauth_redirect_url", skip_serializing_if = "Option::is_none")]
    pub oauth_redirect_url: Option<String>,

    /// Recognized but carries no core semantics (`"keep-alive"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<String>,
}

impl RawEntry {
    fn http_url(&self) -> Option<&str> {
        self.base_url
            .as_deref()
            .or(self.url.as_deref())
            .or(self.server_url.as_deref())
    }
}

/// Normalize a raw entry into a [`ServerDefinition`].
///
/// `base_dir` is the directory of the file that contributed the entry; it
/// becomes the default `cwd` for stdio servers so imports resolve relative
/// paths against their own location.
pub fn normalize(
    name: &str,
    raw: &RawEntry,
    base_dir: &Path,
    source: DefinitionSource,
) -> Result<ServerDefinition> {
    if name.is_empty() {
        return Err(Error::ConfigParse {
            path: source.path().to_path_buf(),
            message: "server name must not be empty".into(),
        });
    }

    let command = if let Some(url) = raw.http_url() {
        let mut headers = raw.headers.clone().unwrap_or_default();
        if let Some(token) = &raw.bearer_token {
            headers
                .entry("Authorization".into())
                .or_insert_with(|| format!("Bearer {token}"));
        }
        if !headers.contains_key("Accept") {
            headers.insert("Accept".into(), DEFAULT_ACCEPT.into());
        }
        CommandSpec::Http {
            url: url.to_string(),
            headers,
        }
    } else if let Some(command) = raw.command.as_deref().or(raw.executable.as_deref()) {
        let args = match &raw.args {
            None => Vec::new(),
            Some(ArgList::Many(args)) => args.clone(),
            Some(ArgList::One(line)) => {
                shell_words::split(line).map_err(|e| Error::ConfigParse {
                    path: source.path().to_path_buf(),
                    message: format!("server '{name}': bad args string: {e}"),
                })?
            }
        };
        CommandSpec::Stdio {
            command: command.to_string(),
            args,
            cwd: raw.cwd.clone().unwrap_or_else(|| base_dir.to_path_buf()),
        }
    } else {
        return Err(Error::ConfigParse {
            path: source.path().to_path_buf(),
            message: format!("server '{name}': needs either a url or a command"),
        });
    };

    // Only "oauth" is recognized; anything else is dropped.
    let auth = match raw.auth.as_deref() {
        Some("oauth") => Some(AuthScheme::Oauth),
        _ => None,
    };

    let token_cache_dir = raw.token_cache_dir.clone().or_else(|| {
        auth.map(|_| ServerDefinition::default_token_cache_dir(name))
    });

    Ok(ServerDefinition {
        name: name.to_string(),
        description: raw.description.clone(),
        command,
        env: raw.env.clone().filter(|m| !m.is_empty()),
        auth,
        token_cache_dir,
        client_name: raw.client_name.clone(),
        oauth_redirect_url: raw.oauth_redirect_url.clone(),
        source,
    })
}

/// Serialize a definition back into the raw shape. `load → to_raw → load`
/// round-trips to an equal definition set.
pub fn to_raw(def: &ServerDefinition) -> RawEntry {
    let mut raw = RawEntry {
        description: def.description.clone(),
        env: def.env.clone(),
        auth: def.auth.map(|_| "oauth".to_string()),
        token_cache_dir: def.token_cache_dir.clone(),
        client_name: def.client_name.clone(),
        oauth_redirect_url: def.oauth_redirect_url.clone(),
        ..RawEntry::default()
    };
    match &def.command {
        CommandSpec::Http { url, headers } => {
            raw.url = Some(url.clone());
            raw.headers = Some(headers.clone()).filter(|h| !h.is_empty());
        }
        CommandSpec::Stdio { command, args, cwd } => {
            raw.command = Some(command.clone());
            raw.args = Some(ArgList::Many(args.clone()));
            raw.cwd = Some(cwd.clone());
        }
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_source() -> DefinitionSource {
        DefinitionSource::Local {
            path: PathBuf::from("/work/config/mcporter.json"),
        }
    }

    fn base() -> PathBuf {
        PathBuf::from("/work/config")
    }

    #[test]
    fn url_key_makes_entry_http() {
        let raw: RawEntry =
            serde_json::from_str(r#"{ "url": "https://example.com/mcp" }"#).unwrap();
        let def = normalize("x", &raw, &base(), local_source()).unwrap();
        assert!(def.command.is_http());
    }

    #[test]
    fn base_url_takes_precedence_over_url() {
        let raw: RawEntry = serde_json::from_str(
            r#"{ "baseUrl": "https://a/mcp", "url": "https://b/mcp" }"#,
        )
        .unwrap();
        let def = normalize("x", &raw, &base(), local_source()).unwrap();
        match def.command {
            CommandSpec::Http { url, .. } => assert_eq!(url, "https://a/mcp"),
            other => panic!("expected http, got {other:?}"),
        }
    }

    #[test]
    fn snake_case_url_aliases_are_accepted() {
        for key in ["base_url", "serverUrl", "server_url"] {
            let raw: RawEntry =
                serde_json::from_str(&format!(r#"{{ "{key}": "https://a/mcp" }}"#)).unwrap();
            let def = normalize("x", &raw, &base(), local_source()).unwrap();
            assert!(def.command.is_http(), "{key} should make the entry http");
        }
    }

    #[test]
    fn accept_header_added_when_absent() {
        let raw: RawEntry =
            serde_json::from_str(r#"{ "url": "https://example.com/mcp" }"#).unwrap();
        let def = normalize("x", &raw, &base(), local_source()).unwrap();
        match def.command {
            CommandSpec::Http { headers, .. } => {
                assert_eq!(headers.get("Accept").map(String::as_str), Some(DEFAULT_ACCEPT));
            }
            other => panic!("expected http, got {other:?}"),
        }
    }

    #[test]
    fn existing_accept_header_preserved() {
        let raw: RawEntry = serde_json::from_str(
            r#"{ "url": "https://example.com/mcp", "headers": { "Accept": "application/json" } }"#,
        )
        .unwrap();
        let def = normalize("x", &raw, &base(), local_source()).unwrap();
        match def.command {
            CommandSpec::Http { headers, .. } => {
                assert_eq!(headers.get("Accept").map(String::as_str), Some("application/json"));
            }
            other => panic!("expected http, got {other:?}"),
        }
    }

    #[test]
    fn bearer_token_becomes_authorization_header() {
        let raw: RawEntry = serde_json::from_str(
            r#"{ "url": "https://example.com/mcp", "bearerToken": "s3cret" }"#,
        )
        .unwrap();
        let def = normalize("x", &raw, &base(), local_source()).unwrap();
        match def.command {
            CommandSpec::Http { headers, .. } => {
                assert_eq!(
                    headers.get("Authorization").map(String::as_str),
                    Some("Bearer s3cret")
                );
            }
            other => panic!("expected http, got {other:?}"),
        }
    }

    #[test]
    fn stdio_cwd_defaults_to_contributing_dir() {
        let raw: RawEntry =
            serde_json::from_str(r#"{ "command": "echo", "args": ["hi"] }"#).unwrap();
        let def = normalize("local", &raw, &base(), local_source()).unwrap();
        match def.command {
            CommandSpec::Stdio { command, args, cwd } => {
                assert_eq!(command, "echo");
                assert_eq!(args, vec!["hi"]);
                assert_eq!(cwd, base());
            }
            other => panic!("expected stdio, got {other:?}"),
        }
    }

    #[test]
    fn executable_is_an_alias_for_command() {
        let raw: RawEntry = serde_json::from_str(r#"{ "executable": "deno" }"#).unwrap();
        let def = normalize("x", &raw, &base(), local_source()).unwrap();
        match def.command {
            CommandSpec::Stdio { command, args, .. } => {
                assert_eq!(command, "deno");
                assert!(args.is_empty());
            }
            other => panic!("expected stdio, got {other:?}"),
        }
    }

    #[test]
    fn string_args_are_shell_split() {
        let raw: RawEntry = serde_json::from_str(
            r#"{ "command": "npx", "args": "-y 'my server' --flag" }"#,
        )
        .unwrap();
        let def = normalize("x", &raw, &base(), local_source()).unwrap();
        match def.command {
            CommandSpec::Stdio { args, .. } => {
                assert_eq!(args, vec!["-y", "my server", "--flag"]);
            }
            other => panic!("expected stdio, got {other:?}"),
        }
    }

    #[test]
    fn unterminated_quote_in_args_is_a_config_error() {
        let raw: RawEntry =
            serde_json::from_str(r#"{ "command": "npx", "args": "-y 'oops" }"#).unwrap();
        let err = normalize("x", &raw, &base(), local_source()).unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }

    #[test]
    fn entry_without_url_or_command_is_rejected() {
        let raw = RawEntry::default();
        let err = normalize("x", &raw, &base(), local_source()).unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }

    #[test]
    fn empty_name_is_rejected() {
        let raw: RawEntry = serde_json::from_str(r#"{ "command": "echo" }"#).unwrap();
        assert!(normalize("", &raw, &base(), local_source()).is_err());
    }

    #[test]
    fn unknown_auth_value_is_discarded() {
        let raw: RawEntry = serde_json::from_str(
            r#"{ "url": "https://example.com/mcp", "auth": "basic" }"#,
        )
        .unwrap();
        let def = normalize("x", &raw, &base(), local_source()).unwrap();
        assert_eq!(def.auth, None);
        assert_eq!(def.token_cache_dir, None);
    }

    #[test]
    fn oauth_auth_gets_default_token_cache_dir() {
        let raw: RawEntry = serde_json::from_str(
            r#"{ "url": "https://example.com/mcp", "auth": "oauth" }"#,
        )
        .unwrap();
        let def = normalize("linear", &raw, &base(), local_source()).unwrap();
        assert_eq!(def.auth, Some(AuthScheme::Oauth));
        assert!(def
            .token_cache_dir
            .as_ref()
            .is_some_and(|p| p.ends_with(".mcporter/linear")));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let raw: RawEntry = serde_json::from_str(
            r#"{ "command": "echo", "totally": "unknown", "disabled": true }"#,
        )
        .unwrap();
        assert!(normalize("x", &raw, &base(), local_source()).is_ok());
    }

    #[test]
    fn normalization_is_idempotent() {
        let raw: RawEntry = serde_json::from_str(
            r#"{
                "url": "https://example.com/mcp",
                "headers": { "X-Key": "${KEY}" },
                "auth": "oauth",
                "description": "example"
            }"#,
        )
        .unwrap();
        let once = normalize("x", &raw, &base(), local_source()).unwrap();
        let twice = normalize("x", &to_raw(&once), &base(), local_source()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn normalization_is_idempotent_for_stdio() {
        let raw: RawEntry = serde_json::from_str(
            r#"{ "command": "node", "args": "server.js --port 0", "env": { "A": "${A:-1}" } }"#,
        )
        .unwrap();
        let once = normalize("x", &raw, &base(), local_source()).unwrap();
        let twice = normalize("x", &to_raw(&once), &base(), local_source()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn toml_shaped_entry_parses() {
        // Codex import tables arrive through the same RawEntry shape.
        let raw: RawEntry = toml::from_str(
            r#"
            url = "https://linear.app/mcp"
            bearerToken = "abc"
            "#,
        )
        .unwrap();
        let def = normalize("linear", &raw, &base(), local_source()).unwrap();
        match def.command {
            CommandSpec::Http { headers, .. } => {
                assert_eq!(headers.get("Authorization").map(String::as_str), Some("Bearer abc"));
            }
            other => panic!("expected http, got {other:?}"),
        }
    }
}
