//! Server configuration loading.
//!
//! An ordered list of [`ServerConfig`] records, loaded from a project-scoped
//! JSON file (`.toolbridge/servers.json`, falling back to the same path under
//! the home directory). The set is immutable once loaded.
//!
//! The loader is defensive about its inputs: the resolved config path must
//! stay inside the project root, and the parsed document must not assign to
//! prototype-pollution-sensitive key names, since the file may be shared with
//! non-Rust consumers of the same configuration.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

const CONFIG_FILE: &str = ".toolbridge/servers.json";
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Key names that must never appear in the config document.
const FORBIDDEN_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    None,
    Bearer,
}

/// Which transport a [`ServerConfig`] selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
}

/// Configuration for one upstream server. Exactly one transport kind:
/// `command` (+ `args`) for a spawned process, or `url` for HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub auth: AuthMode,
    /// Name of the environment variable holding the bearer token. The token
    /// itself is never embedded in configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl ServerConfig {
    /// Minimal stdio config, mostly for tests and embedding.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            name: name.into(),
            command: Some(command.into()),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            url: None,
            auth: AuthMode::None,
            token_env: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Minimal HTTP config.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url.into()),
            auth: AuthMode::None,
            token_env: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn transport_kind(&self) -> Result<TransportKind> {
        match (&self.command, &self.url) {
            (Some(_), None) => Ok(TransportKind::Stdio),
            (None, Some(_)) => Ok(TransportKind::Http),
            (Some(_), Some(_)) => Err(BridgeError::Config(format!(
                "server '{}' names both a command and a url",
                self.name
            ))),
            (None, None) => Err(BridgeError::Config(format!(
                "server '{}' names neither a command nor a url",
                self.name
            ))),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BridgeError::Config("server name must not be empty".into()));
        }
        if FORBIDDEN_KEYS.contains(&self.name.as_str()) {
            return Err(BridgeError::Config(format!(
                "server name '{}' is not allowed",
                self.name
            )));
        }
        self.transport_kind()?;
        if self.auth == AuthMode::Bearer && self.token_env.is_none() {
            return Err(BridgeError::Config(format!(
                "server '{}' uses bearer auth but names no token_env",
                self.name
            )));
        }
        Ok(())
    }
}

/// The full server set. Order is preserved; discovery merges tool names in
/// this order, so earlier servers win name ties.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl BridgeConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(content)
            .map_err(|e| BridgeError::Config(format!("malformed config: {}", e)))?;
        reject_forbidden_keys(&raw)?;
        let config: BridgeConfig = serde_json::from_value(raw)
            .map_err(|e| BridgeError::Config(format!("malformed config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !seen.insert(server.name.as_str()) {
                return Err(BridgeError::Config(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
        }
        Ok(())
    }

    /// Load from the project-scoped file under `project_root`, falling back
    /// to the home directory, then to an empty set. The resolved path must
    /// stay inside the directory it was anchored to.
    pub fn load(project_root: &Path) -> Result<Self> {
        let local = project_root.join(CONFIG_FILE);
        if local.exists() {
            ensure_contained(project_root, &local)?;
            return Self::load_from_file(&local);
        }
        if let Some(home) = dirs::home_dir() {
            let global = home.join(CONFIG_FILE);
            if global.exists() {
                ensure_contained(&home, &global)?;
                return Self::load_from_file(&global);
            }
        }
        Ok(Self::default())
    }
}

/// Reject a resolved path that escapes its anchor directory (symlinks and
/// `..` components included).
fn ensure_contained(root: &Path, path: &Path) -> Result<()> {
    let canon_root = root
        .canonicalize()
        .map_err(|e| BridgeError::Config(format!("cannot resolve {}: {}", root.display(), e)))?;
    let canon_path = path
        .canonicalize()
        .map_err(|e| BridgeError::Config(format!("cannot resolve {}: {}", path.display(), e)))?;
    if !canon_path.starts_with(&canon_root) {
        return Err(BridgeError::Config(format!(
            "config path {} escapes {}",
            canon_path.display(),
            canon_root.display()
        )));
    }
    Ok(())
}

fn reject_forbidden_keys(value: &Value) -> Result<()> {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if FORBIDDEN_KEYS.contains(&key.as_str()) {
                    return Err(BridgeError::Config(format!(
                        "config assigns to forbidden key '{}'",
                        key
                    )));
                }
                reject_forbidden_keys(nested)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                reject_forbidden_keys(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stdio_and_http_servers() {
        let config = BridgeConfig::parse(
            r#"{
                "servers": [
                    {"name": "files", "command": "/usr/bin/files-server", "args": ["--root", "."]},
                    {"name": "search", "url": "http://127.0.0.1:9200/rpc", "auth": "bearer", "token_env": "SEARCH_TOKEN"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(
            config.servers[0].transport_kind().unwrap(),
            TransportKind::Stdio
        );
        assert_eq!(
            config.servers[1].transport_kind().unwrap(),
            TransportKind::Http
        );
        assert_eq!(config.servers[1].auth, AuthMode::Bearer);
        assert_eq!(config.servers[0].timeout(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_both_transports() {
        let err = BridgeConfig::parse(
            r#"{"servers": [{"name": "x", "command": "a", "url": "http://b"}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("both"));
    }

    #[test]
    fn rejects_neither_transport() {
        let err = BridgeConfig::parse(r#"{"servers": [{"name": "x"}]}"#).unwrap_err();
        assert!(err.to_string().contains("neither"));
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = BridgeConfig::parse(
            r#"{"servers": [{"name": "x", "command": "a"}, {"name": "x", "command": "b"}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_pollution_sensitive_keys() {
        for key in ["__proto__", "constructor", "prototype"] {
            let doc = format!(
                r#"{{"servers": [{{"name": "x", "command": "a", "env": {{"{}": "v"}}}}]}}"#,
                key
            );
            let err = BridgeConfig::parse(&doc).unwrap_err();
            assert!(err.to_string().contains("forbidden key"), "key: {}", key);
        }
    }

    #[test]
    fn rejects_bearer_without_token_env() {
        let err = BridgeConfig::parse(
            r#"{"servers": [{"name": "x", "url": "http://b", "auth": "bearer"}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("token_env"));
    }

    #[test]
    fn empty_document_is_empty_set() {
        let config = BridgeConfig::parse("{}").unwrap();
        assert!(config.servers.is_empty());
    }

    #[test]
    fn load_missing_file_is_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::load(dir.path()).unwrap();
        assert!(config.servers.is_empty());
    }

    #[test]
    fn load_reads_project_scoped_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join(".toolbridge");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("servers.json"),
            r#"{"servers": [{"name": "files", "command": "srv"}]}"#,
        )
        .unwrap();
        let config = BridgeConfig::load(dir.path()).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].name, "files");
    }

    #[cfg(unix)]
    #[test]
    fn load_rejects_path_escaping_root() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("servers.json"), r#"{"servers": []}"#).unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".toolbridge")).unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("servers.json"),
            dir.path().join(".toolbridge/servers.json"),
        )
        .unwrap();

        let err = BridgeConfig::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("escapes"));
    }
}
