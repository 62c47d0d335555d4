//! Import readers for foreign editor configs.
//!
//! Each import kind names an editor whose MCP server list can be merged
//! into the runtime: an ordered list of candidate paths is probed and the
//! first file that exists wins; later candidates for the same kind are
//! ignored. A missing file yields no entries and no error; a file that
//! exists but fails to parse surfaces an import parse error (which the
//! loader downgrades to a warning, since imports are never explicit).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use mcporter_domain::{Error, RawEntry, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Import kinds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A recognized foreign config source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportKind {
    Cursor,
    ClaudeCode,
    ClaudeDesktop,
    Codex,
    Windsurf,
    Vscode,
}

/// The default import walk order.
pub const DEFAULT_IMPORT_ORDER: [ImportKind; 6] = [
    ImportKind::Cursor,
    ImportKind::ClaudeCode,
    ImportKind::ClaudeDesktop,
    ImportKind::Codex,
    ImportKind::Windsurf,
    ImportKind::Vscode,
];

impl ImportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportKind::Cursor => "cursor",
            ImportKind::ClaudeCode => "claude-code",
            ImportKind::ClaudeDesktop => "claude-desktop",
            ImportKind::Codex => "codex",
            ImportKind::Windsurf => "windsurf",
            ImportKind::Vscode => "vscode",
        }
    }
}

impl fmt::Display for ImportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cursor" => Ok(ImportKind::Cursor),
            "claude-code" => Ok(ImportKind::ClaudeCode),
            "claude-desktop" => Ok(ImportKind::ClaudeDesktop),
            "codex" => Ok(ImportKind::Codex),
            "windsurf" => Ok(ImportKind::Windsurf),
            "vscode" => Ok(ImportKind::Vscode),
            other => Err(Error::Other(format!("unknown import kind: {other}"))),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Search roots
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The directories import candidates are probed under. Tests point all
/// three into a temp tree; production uses [`ImportRoots::discover`].
#[derive(Debug, Clone)]
pub struct ImportRoots {
    /// Project root (defaults to the process working directory).
    pub root: PathBuf,
    pub home: Option<PathBuf>,
    /// Per-OS user config directory (`~/.config`, `%APPDATA%`, …).
    pub config_dir: Option<PathBuf>,
}

impl ImportRoots {
    pub fn discover(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            home: dirs::home_dir(),
            config_dir: dirs::config_dir(),
        }
    }
}

/// Candidate files for one import kind, in probe order.
pub fn candidates(kind: ImportKind, roots: &ImportRoots) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let home = roots.home.as_deref();
    let config = roots.config_dir.as_deref();

    match kind {
        ImportKind::Cursor => {
            paths.push(roots.root.join(".cursor/mcp.json"));
            if let Some(config) = config {
                paths.push(config.join("Cursor/User/mcp.json"));
            }
        }
        ImportKind::ClaudeCode => {
            paths.push(roots.root.join(".claude/mcp.json"));
            if let Some(home) = home {
                paths.push(home.join(".claude/mcp.json"));
                paths.push(home.join(".claude.json"));
            }
        }
        ImportKind::ClaudeDesktop => {
            if let Some(config) = config {
                paths.push(config.join("Claude/claude_desktop_config.json"));
            }
        }
        ImportKind::Codex => {
            paths.push(roots.root.join(".codex/config.toml"));
            if let Some(home) = home {
                paths.push(home.join(".codex/config.toml"));
            }
        }
        ImportKind::Windsurf => {
            if let Some(config) = config {
                paths.push(config.join("Codeium/windsurf/mcp_config.json"));
            }
            if let Some(home) = home {
                paths.push(home.join(".codeium/windsurf/mcp_config.json"));
            }
        }
        ImportKind::Vscode => {
            if let Some(config) = config {
                paths.push(config.join("Code/User/mcp.json"));
                paths.push(config.join("Code - Insiders/User/mcp.json"));
            }
        }
    }

    paths
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Readers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One server entry contributed by an import file.
#[derive(Debug, Clone)]
pub struct ImportedEntry {
    pub name: String,
    pub raw: RawEntry,
    /// The file that contributed the entry; its directory becomes the
    /// default `cwd` for stdio servers.
    pub path: PathBuf,
}

/// Read all entries for one import kind. The first candidate that exists
/// is parsed; the rest are ignored.
pub fn read_kind(kind: ImportKind, roots: &ImportRoots) -> Result<Vec<ImportedEntry>> {
    for path in candidates(kind, roots) {
        if !path.is_file() {
            continue;
        }
        tracing::debug!(kind = %kind, path = %path.display(), "reading import file");
        return match kind {
            ImportKind::Codex => read_codex_toml(&path),
            _ => read_json_entries(&path),
        };
    }
    Ok(Vec::new())
}

/// JSON shape shared by Cursor, Claude, Windsurf, and VS Code:
/// `{"mcpServers": {...}}` preferred, `{"servers": {...}}` legacy.
fn read_json_entries(path: &Path) -> Result<Vec<ImportedEntry>> {
    let text = std::fs::read_to_string(path)?;
    let value: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| Error::ImportParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    let servers = value
        .get("mcpServers")
        .or_else(|| value.get("servers"))
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));
    let map = match servers {
        serde_json::Value::Object(map) => map,
        other => {
            return Err(Error::ImportParse {
                path: path.to_path_buf(),
                message: format!("expected an object of servers, got {other}"),
            })
        }
    };

    let mut entries = Vec::with_capacity(map.len());
    for (name, entry) in map {
        let raw: RawEntry =
            serde_json::from_value(entry).map_err(|e| Error::ImportParse {
                path: path.to_path_buf(),
                message: format!("server '{name}': {e}"),
            })?;
        entries.push(ImportedEntry {
            name,
            raw,
            path: path.to_path_buf(),
        });
    }
    Ok(entries)
}

/// Codex keeps its servers in TOML: `[mcp_servers.<name>]` tables.
fn read_codex_toml(path: &Path) -> Result<Vec<ImportedEntry>> {
    let text = std::fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&text).map_err(|e| Error::ImportParse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let Some(tables) = value.get("mcp_servers") else {
        return Ok(Vec::new());
    };
    let Some(tables) = tables.as_table() else {
        return Err(Error::ImportParse {
            path: path.to_path_buf(),
            message: "mcp_servers must be a table".into(),
        });
    };

    let mut entries = Vec::with_capacity(tables.len());
    for (name, table) in tables {
        let raw: RawEntry = table.clone().try_into().map_err(|e| Error::ImportParse {
            path: path.to_path_buf(),
            message: format!("server '{name}': {e}"),
        })?;
        entries.push(ImportedEntry {
            name: name.clone(),
            raw,
            path: path.to_path_buf(),
        });
    }
    Ok(entries)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
