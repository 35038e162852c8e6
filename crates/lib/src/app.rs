//! Application context: every long-lived service wired together once and passed around
//! explicitly.

use std::path::Path;
use std::sync::Arc;

use crate::config::{self, Config};
use crate::connectivity::Connectivity;
use crate::credentials::CredentialStore;
use crate::llm::{LocalEngine, OllamaEngine, OpenAiCompatibleClient, RemoteCompletion};
use crate::local::LocalModelManager;
use crate::pipeline::SendPipeline;
use crate::preferences::Preferences;
use crate::session::ChatRegistry;
use crate::store::{FileBackend, StorageBackend};

pub struct AppContext {
    pub registry: Arc<ChatRegistry>,
    pub credentials: Arc<CredentialStore>,
    pub preferences: Arc<Preferences>,
    pub connectivity: Connectivity,
    pub local: Arc<LocalModelManager>,
    pub pipeline: Arc<SendPipeline>,
}

/// Pieces [`AppContext::with_parts`] builds the context from.
pub struct AppParts {
    pub backend: Arc<dyn StorageBackend>,
    pub remote: Arc<dyn RemoteCompletion>,
    pub engine: Arc<dyn LocalEngine>,
    pub connectivity: Connectivity,
    pub title_max_chars: usize,
    pub system_prompt: Option<String>,
}

impl AppContext {
    /// Open the file-backed context described by `config` (loaded from `config_path`).
    pub async fn open(config: &Config, config_path: &Path) -> Self {
        let data_dir = config::resolve_data_dir(config, config_path);
        log::debug!("app: data directory {}", data_dir.display());
        let remote = OpenAiCompatibleClient::new(config::resolve_provider_base_urls(config));
        let engine = OllamaEngine::new(Some(config::resolve_local_base_url(config)));
        Self::with_parts(AppParts {
            backend: Arc::new(FileBackend::new(data_dir)),
            remote: Arc::new(remote),
            engine: Arc::new(engine),
            connectivity: Connectivity::default(),
            title_max_chars: config.chats.title_max_chars,
            system_prompt: config::resolve_system_prompt(config),
        })
        .await
    }

    pub async fn with_parts(parts: AppParts) -> Self {
        let registry = Arc::new(ChatRegistry::load(parts.backend.clone(), parts.title_max_chars).await);
        let credentials = Arc::new(CredentialStore::load(parts.backend.clone()).await);
        let preferences = Arc::new(Preferences::load(parts.backend).await);
        let local = Arc::new(LocalModelManager::new(parts.engine));
        let pipeline = SendPipeline::new(
            registry.clone(),
            credentials.clone(),
            parts.connectivity.clone(),
            local.clone(),
            parts.remote,
        )
        .with_system_prompt(parts.system_prompt);
        Self {
            registry,
            credentials,
            preferences,
            connectivity: parts.connectivity,
            local,
            pipeline: Arc::new(pipeline),
        }
    }
}
