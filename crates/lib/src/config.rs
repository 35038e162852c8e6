//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.chatfuse/config.json`) and environment.
//! Environment variables win over the file; blank values count as unset.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::catalog;
use crate::llm::DEFAULT_LOCAL_BASE_URL;
use crate::model::DEFAULT_TITLE_MAX_CHARS;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Where persisted collections live.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Chat behaviour (title length, system prompt).
    #[serde(default)]
    pub chats: ChatsConfig,

    /// Per-provider overrides, keyed by provider id.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Local inference engine settings.
    #[serde(default)]
    pub local: LocalConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Data directory. Relative paths are resolved against the config file's parent.
    /// Omit to use the `data` subdirectory next to the config file.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatsConfig {
    /// Characters of the first user message kept as the chat title (default 30).
    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,

    /// Optional system message sent ahead of every conversation. Never stored in the chat.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_title_max_chars() -> usize {
    DEFAULT_TITLE_MAX_CHARS
}

impl Default for ChatsConfig {
    fn default() -> Self {
        Self {
            title_max_chars: default_title_max_chars(),
            system_prompt: None,
        }
    }
}

/// Provider override. Only OpenAI-compatible endpoints are supported.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Base URL of the provider's OpenAI-compatible API (e.g. a proxy). Overridden by
    /// `CHATFUSE_<PROVIDER>_BASE_URL`.
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalConfig {
    /// Local engine endpoint (default http://127.0.0.1:11434). Overridden by
    /// `CHATFUSE_LOCAL_BASE_URL`.
    pub base_url: Option<String>,
}

fn non_blank(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

fn env_non_blank(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| non_blank(&s))
}

/// Environment variable holding the base URL override for `provider_id`.
pub fn provider_base_url_env(provider_id: &str) -> String {
    let id: String = provider_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("CHATFUSE_{}_BASE_URL", id)
}

/// Resolve a provider's base URL override: env overrides config. None means "use the catalog default".
pub fn resolve_provider_base_url(config: &Config, provider_id: &str) -> Option<String> {
    env_non_blank(&provider_base_url_env(provider_id)).or_else(|| {
        config
            .providers
            .get(provider_id)
            .and_then(|p| p.base_url.as_deref())
            .and_then(non_blank)
    })
}

/// Base URL overrides for every catalog provider and every configured provider.
pub fn resolve_provider_base_urls(config: &Config) -> HashMap<String, String> {
    let mut ids: Vec<String> = catalog::providers()
        .iter()
        .filter(|p| !p.is_local)
        .map(|p| p.id.to_string())
        .collect();
    ids.extend(config.providers.keys().cloned());
    ids.into_iter()
        .filter_map(|id| resolve_provider_base_url(config, &id).map(|url| (id, url)))
        .collect()
}

/// Resolve the local engine URL: env CHATFUSE_LOCAL_BASE_URL overrides config, then the default.
pub fn resolve_local_base_url(config: &Config) -> String {
    env_non_blank("CHATFUSE_LOCAL_BASE_URL")
        .or_else(|| config.local.base_url.as_deref().and_then(non_blank))
        .unwrap_or_else(|| DEFAULT_LOCAL_BASE_URL.to_string())
}

/// The system prompt, if one is configured and not blank.
pub fn resolve_system_prompt(config: &Config) -> Option<String> {
    config.chats.system_prompt.as_deref().and_then(non_blank)
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CHATFUSE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".chatfuse").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the default path (or CHATFUSE_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used (for resolving the config directory).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

fn config_parent(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Default data directory when no override is set: `data` subdirectory of the config file's parent.
pub fn data_dir(config_path: &Path) -> PathBuf {
    config_parent(config_path).join("data")
}

/// Resolve the data directory: `config.storage.directory` if set (relative paths resolved
/// against the config file's parent), otherwise the default `data` subdirectory.
pub fn resolve_data_dir(config: &Config, config_path: &Path) -> PathBuf {
    match &config.storage.directory {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                config_parent(config_path).join(d)
            }
        }
        _ => data_dir(config_path),
    }
}
