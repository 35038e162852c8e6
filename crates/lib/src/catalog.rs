//! Static provider/model catalog and the binding that decides where a chat's turns are sent.
//!
//! The catalog is reference data only. Chats keep plain ids, so a chat may point at a provider
//! or model that no longer exists here; lookups return `None` and labels fall back to
//! "Unknown provider" / "Unknown model".

/// Id of the provider whose models run on-device.
pub const LOCAL_PROVIDER_ID: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    /// Approximate download size, only for on-device models.
    pub size: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    /// Default OpenAI-compatible endpoint. `None` for the local provider.
    pub base_url: Option<&'static str>,
    pub api_key_placeholder: &'static str,
    pub is_local: bool,
    pub models: &'static [ModelInfo],
}

impl ProviderInfo {
    pub fn model(&self, model_id: &str) -> Option<&'static ModelInfo> {
        self.models.iter().find(|m| m.id == model_id)
    }
}

const fn remote_model(id: &'static str, name: &'static str, description: &'static str) -> ModelInfo {
    ModelInfo {
        id,
        name,
        description,
        size: None,
    }
}

const fn local_model(
    id: &'static str,
    name: &'static str,
    description: &'static str,
    size: &'static str,
) -> ModelInfo {
    ModelInfo {
        id,
        name,
        description,
        size: Some(size),
    }
}

static PROVIDERS: &[ProviderInfo] = &[
    ProviderInfo {
        id: LOCAL_PROVIDER_ID,
        name: "Local Models",
        description: "AI models running locally on your device",
        base_url: None,
        api_key_placeholder: "",
        is_local: true,
        models: &[
            local_model(
                "llama3.2:3b",
                "Llama 3.2 3B",
                "Fast and efficient model for general conversations",
                "2.0 GB",
            ),
            local_model(
                "phi3.5:3.8b",
                "Phi 3.5 Mini",
                "Microsoft's compact model optimized for mobile",
                "2.2 GB",
            ),
            local_model(
                "qwen2.5:1.5b",
                "Qwen 2.5 1.5B",
                "Lightweight model for basic conversations",
                "1.0 GB",
            ),
            local_model(
                "gemma2:2b",
                "Gemma 2 2B",
                "Google's efficient model for mobile devices",
                "1.4 GB",
            ),
        ],
    },
    ProviderInfo {
        id: "openai",
        name: "OpenAI",
        description: "Get your API key from platform.openai.com",
        base_url: Some("https://api.openai.com/v1"),
        api_key_placeholder: "sk-...",
        is_local: false,
        models: &[
            remote_model("gpt-4o", "GPT-4o", "Most capable model"),
            remote_model("gpt-4o-mini", "GPT-4o Mini", "Fast and efficient"),
            remote_model("gpt-4-turbo", "GPT-4 Turbo", "Previous generation flagship"),
            remote_model("gpt-3.5-turbo", "GPT-3.5 Turbo", "Fast and cost-effective"),
        ],
    },
    ProviderInfo {
        id: "anthropic",
        name: "Anthropic",
        description: "Get your API key from console.anthropic.com",
        base_url: Some("https://api.anthropic.com/v1"),
        api_key_placeholder: "sk-ant-...",
        is_local: false,
        models: &[
            remote_model("claude-3-5-sonnet-20241022", "Claude 3.5 Sonnet", "Most capable model"),
            remote_model("claude-3-5-haiku-20241022", "Claude 3.5 Haiku", "Fast and efficient"),
            remote_model("claude-3-opus-20240229", "Claude 3 Opus", "Most powerful model"),
        ],
    },
    ProviderInfo {
        id: "google",
        name: "Google",
        description: "Get your API key from aistudio.google.com",
        base_url: Some("https://generativelanguage.googleapis.com/v1beta/openai"),
        api_key_placeholder: "AIza...",
        is_local: false,
        models: &[
            remote_model("gemini-1.5-pro", "Gemini 1.5 Pro", "Most capable model"),
            remote_model("gemini-1.5-flash", "Gemini 1.5 Flash", "Fast and efficient"),
            remote_model("gemini-pro", "Gemini Pro", "Balanced performance"),
        ],
    },
    ProviderInfo {
        id: "xai",
        name: "xAI",
        description: "Get your API key from console.x.ai",
        base_url: Some("https://api.x.ai/v1"),
        api_key_placeholder: "xai-...",
        is_local: false,
        models: &[
            remote_model("grok-3", "Grok 3", "Latest and most capable"),
            remote_model("grok-2", "Grok 2", "Previous generation"),
        ],
    },
    ProviderInfo {
        id: "groq",
        name: "Groq",
        description: "Get your API key from console.groq.com",
        base_url: Some("https://api.groq.com/openai/v1"),
        api_key_placeholder: "gsk_...",
        is_local: false,
        models: &[
            remote_model("llama-3.3-70b-versatile", "Llama 3.3 70B", "Most capable open model"),
            remote_model("llama-3.1-8b-instant", "Llama 3.1 8B", "Fast and efficient"),
            remote_model("mixtral-8x7b-32768", "Mixtral 8x7B", "Mixture of experts model"),
        ],
    },
    ProviderInfo {
        id: "mistral",
        name: "Mistral AI",
        description: "Get your API key from console.mistral.ai",
        base_url: Some("https://api.mistral.ai/v1"),
        api_key_placeholder: "YOUR_MISTRAL_API_KEY",
        is_local: false,
        models: &[
            remote_model("mistral-large-latest", "Mistral Large", "Most capable Mistral model"),
            remote_model("mistral-medium-latest", "Mistral Medium", "Balanced performance"),
            remote_model("mistral-small-latest", "Mistral Small", "Fast and efficient"),
        ],
    },
    ProviderInfo {
        id: "cohere",
        name: "Cohere",
        description: "Get your API key from dashboard.cohere.com",
        base_url: Some("https://api.cohere.ai/compatibility/v1"),
        api_key_placeholder: "YOUR_COHERE_API_KEY",
        is_local: false,
        models: &[
            remote_model("command-r-plus", "Command R+", "Most capable Cohere model"),
            remote_model("command-r", "Command R", "Balanced performance"),
        ],
    },
];

/// All providers in display order (local first).
pub fn providers() -> &'static [ProviderInfo] {
    PROVIDERS
}

pub fn provider(provider_id: &str) -> Option<&'static ProviderInfo> {
    PROVIDERS.iter().find(|p| p.id == provider_id)
}

pub fn model(provider_id: &str, model_id: &str) -> Option<&'static ModelInfo> {
    provider(provider_id).and_then(|p| p.model(model_id))
}

/// Models of the local provider.
pub fn local_models() -> &'static [ModelInfo] {
    provider(LOCAL_PROVIDER_ID).map(|p| p.models).unwrap_or(&[])
}

/// Human-readable provider name, or "Unknown provider" for a dangling id.
pub fn provider_name(provider_id: &str) -> String {
    provider(provider_id)
        .map(|p| p.name.to_string())
        .unwrap_or_else(|| "Unknown provider".to_string())
}

/// "Provider · Model" label for a chat; dangling ids degrade instead of failing.
pub fn display_label(provider_id: &str, model_id: &str) -> String {
    let provider_label = provider_name(provider_id);
    let model_label = model(provider_id, model_id)
        .map(|m| m.name.to_string())
        .unwrap_or_else(|| "Unknown model".to_string());
    format!("{} · {}", provider_label, model_label)
}

/// Where a chat's completions come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderBinding {
    Remote { provider_id: String, model_id: String },
    Local { model_id: String },
}

impl ProviderBinding {
    /// Unknown provider ids bind as remote; the remote client rejects them at send time.
    pub fn resolve(provider_id: &str, model_id: &str) -> Self {
        let is_local = provider_id == LOCAL_PROVIDER_ID
            || provider(provider_id).map(|p| p.is_local).unwrap_or(false);
        if is_local {
            ProviderBinding::Local {
                model_id: model_id.to_string(),
            }
        } else {
            ProviderBinding::Remote {
                provider_id: provider_id.to_string(),
                model_id: model_id.to_string(),
            }
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, ProviderBinding::Local { .. })
    }
}
