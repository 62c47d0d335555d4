//! Definition loading: primary config resolution, import walking, and
//! first-wins merging into normalized definitions.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use parking_lot::Mutex;

use mcporter_domain::{normalize, DefinitionSource, Error, RawEntry, Result, ServerDefinition};

use crate::config::{strip_jsonc, PrimaryConfig};
use crate::imports::{self, ImportKind, ImportRoots, DEFAULT_IMPORT_ORDER};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "MCPORTER_CONFIG";

/// Loads definitions for one runtime instance.
///
/// The warn-once set is scoped to the loader (and therefore the runtime):
/// repeated loads of the same broken implicit file warn a single time, and
/// two runtimes in one process do not share state.
pub struct Loader {
    explicit_config: Option<PathBuf>,
    roots: ImportRoots,
    warned: Mutex<HashSet<PathBuf>>,
}

impl Loader {
    /// `explicit_config` comes from the embedding caller; `roots` carries
    /// the project root plus the user's home and config directories.
    pub fn new(explicit_config: Option<PathBuf>, roots: ImportRoots) -> Self {
        Self {
            explicit_config,
            roots,
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// Load and merge everything into normalized definitions.
    ///
    /// Order is deterministic: local entries first (config file order),
    /// then import entries in walk order, first-wins across imports.
    pub fn load(&self) -> Result<Vec<ServerDefinition>> {
        let (config_path, explicit) = self.resolve_primary_path();
        let config = self.read_primary(config_path.as_deref(), explicit)?;

        // Walk imports, first-wins per name.
        let mut imported: Vec<(String, RawEntry, PathBuf)> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for kind in self.import_order(&config) {
            let entries = match imports::read_kind(kind, &self.roots) {
                Ok(entries) => entries,
                // Imports are never explicit, so parse failures degrade to
                // a warning instead of failing the whole load.
                Err(err) => {
                    self.warn_once(kind, &err);
                    continue;
                }
            };
            for entry in entries {
                if seen.insert(entry.name.clone()) {
                    imported.push((entry.name, entry.raw, entry.path));
                } else {
                    tracing::debug!(
                        name = %entry.name,
                        path = %entry.path.display(),
                        "skipping import entry shadowed by an earlier source"
                    );
                }
            }
        }

        // Local entries overlay imports: same name replaces, origin local.
        let mut definitions: Vec<ServerDefinition> = Vec::new();
        let local_path = config_path.unwrap_or_else(|| PathBuf::from("<none>"));
        let local_dir = parent_or_root(&local_path, &self.roots.root);
        let mut local_names: HashSet<String> = HashSet::new();
        for (name, raw) in &config.mcp_servers {
            let source = DefinitionSource::Local {
                path: local_path.clone(),
            };
            match normalize(name, raw, &local_dir, source) {
                Ok(def) => {
                    local_names.insert(name.clone());
                    definitions.push(def);
                }
                Err(err) if explicit => return Err(err),
                Err(err) => tracing::warn!(name = %name, error = %err, "skipping bad local entry"),
            }
        }

        for (name, raw, path) in imported {
            if local_names.contains(&name) {
                continue;
            }
            let base_dir = parent_or_root(&path, &self.roots.root);
            let source = DefinitionSource::Import { path: path.clone() };
            match normalize(&name, &raw, &base_dir, source) {
                Ok(def) => definitions.push(def),
                Err(err) => {
                    tracing::warn!(name = %name, path = %path.display(), error = %err, "skipping bad import entry")
                }
            }
        }

        tracing::debug!(count = definitions.len(), "definitions loaded");
        Ok(definitions)
    }

    /// Primary config precedence: explicit path → `MCPORTER_CONFIG` →
    /// `<root>/config/mcporter.json` → `<home>/.mcporter/mcporter.{json,jsonc}`.
    fn resolve_primary_path(&self) -> (Option<PathBuf>, bool) {
        if let Some(path) = &self.explicit_config {
            return (Some(path.clone()), true);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.is_empty() {
                return (Some(PathBuf::from(path)), true);
            }
        }

        let mut candidates = vec![self.roots.root.join("config/mcporter.json")];
        if let Some(home) = &self.roots.home {
            candidates.push(home.join(".mcporter/mcporter.json"));
            candidates.push(home.join(".mcporter/mcporter.jsonc"));
        }
        for candidate in candidates {
            if candidate.is_file() {
                return (Some(candidate), false);
            }
        }
        (None, false)
    }

    fn read_primary(&self, path: Option<&Path>, explicit: bool) -> Result<PrimaryConfig> {
        let Some(path) = path else {
            return Ok(PrimaryConfig::default());
        };

        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if explicit => {
                return Err(Error::ConfigParse {
                    path: path.to_path_buf(),
                    message: err.to_string(),
                })
            }
            Err(_) => return Ok(PrimaryConfig::default()),
        };

        match serde_json::from_str::<PrimaryConfig>(&strip_jsonc(&text)) {
            Ok(config) => Ok(config),
            Err(err) if explicit => Err(Error::ConfigParse {
                path: path.to_path_buf(),
                message: err.to_string(),
            }),
            Err(err) => {
                // Implicit file with bad contents: exactly one warning per
                // path per loader, then proceed with an empty config.
                if self.warned.lock().insert(path.to_path_buf()) {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "ignoring unparseable config file"
                    );
                }
                Ok(PrimaryConfig::default())
            }
        }
    }

    /// Import order: absent → defaults; present-empty → disabled; otherwise
    /// the declared order with unmentioned default kinds appended.
    fn import_order(&self, config: &PrimaryConfig) -> Vec<ImportKind> {
        let Some(declared) = &config.imports else {
            return DEFAULT_IMPORT_ORDER.to_vec();
        };
        if declared.is_empty() {
            return Vec::new();
        }

        let mut order = Vec::new();
        for name in declared {
            match ImportKind::from_str(name) {
                Ok(kind) if !order.contains(&kind) => order.push(kind),
                Ok(_) => {}
                Err(_) => tracing::warn!(name = %name, "skipping unknown import kind"),
            }
        }
        for kind in DEFAULT_IMPORT_ORDER {
            if !order.contains(&kind) {
                order.push(kind);
            }
        }
        order
    }

    fn warn_once(&self, kind: ImportKind, err: &Error) {
        let key = PathBuf::from(format!("<import:{kind}>"));
        if self.warned.lock().insert(key) {
            tracing::warn!(kind = %kind, error = %err, "skipping unreadable import");
        }
    }
}

fn parent_or_root(path: &Path, root: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.to_path_buf())
}
