use anyhow::Result;

/// Placeholder credential recorded for providers that run on the local
/// machine and need no real API key.
pub const LOCAL_API_KEY: &str = "local";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModelKind {
    Llm,
    Stt,
}

impl ModelKind {
    pub const ALL: [ModelKind; 2] = [ModelKind::Llm, ModelKind::Stt];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Llm => "llm",
            ModelKind::Stt => "stt",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: &'static str,
    pub name: &'static str,
}

#[derive(Clone, Copy, Debug)]
pub struct ProviderInfo {
    pub id: &'static str,
    pub name: &'static str,
    /// Local inference runtimes need no real credential and lose the
    /// auto-selection tie-break against API providers.
    pub is_local: bool,
    pub llm_models: &'static [ModelInfo],
    pub stt_models: &'static [ModelInfo],
}

impl ProviderInfo {
    pub fn models(&self, kind: ModelKind) -> &'static [ModelInfo] {
        match kind {
            ModelKind::Llm => self.llm_models,
            ModelKind::Stt => self.stt_models,
        }
    }
}

/// Rejected inputs that never reach a backend: bad credentials, unknown
/// providers, unavailable models.
#[derive(Debug)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ValidationError {}

pub(crate) fn validation_error(message: impl Into<String>) -> anyhow::Error {
    ValidationError {
        message: message.into(),
    }
    .into()
}

// Kept in lexicographic id order; enumeration order is the documented
// auto-selection tie-break.
static CATALOG: [ProviderInfo; 5] = [
    ProviderInfo {
        id: "anthropic",
        name: "Anthropic",
        is_local: false,
        llm_models: &[
            ModelInfo {
                id: "claude-sonnet-4",
                name: "Claude Sonnet 4",
            },
            ModelInfo {
                id: "claude-3-5-haiku",
                name: "Claude 3.5 Haiku",
            },
        ],
        stt_models: &[],
    },
    ProviderInfo {
        id: "gemini",
        name: "Google Gemini",
        is_local: false,
        llm_models: &[
            ModelInfo {
                id: "gemini-2.5-flash",
                name: "Gemini 2.5 Flash",
            },
            ModelInfo {
                id: "gemini-2.5-pro",
                name: "Gemini 2.5 Pro",
            },
        ],
        stt_models: &[ModelInfo {
            id: "gemini-live-2.5-flash",
            name: "Gemini Live 2.5 Flash",
        }],
    },
    ProviderInfo {
        id: "ollama",
        name: "Ollama",
        is_local: true,
        llm_models: &[
            ModelInfo {
                id: "llama3.2:latest",
                name: "Llama 3.2",
            },
            ModelInfo {
                id: "qwen2.5:7b",
                name: "Qwen 2.5 7B",
            },
        ],
        stt_models: &[],
    },
    ProviderInfo {
        id: "openai",
        name: "OpenAI",
        is_local: false,
        llm_models: &[
            ModelInfo {
                id: "gpt-4.1",
                name: "GPT-4.1",
            },
            ModelInfo {
                id: "gpt-4o-mini",
                name: "GPT-4o mini",
            },
        ],
        stt_models: &[ModelInfo {
            id: "gpt-4o-mini-transcribe",
            name: "GPT-4o mini Transcribe",
        }],
    },
    ProviderInfo {
        id: "whisper",
        name: "Whisper",
        is_local: true,
        llm_models: &[],
        stt_models: &[
            ModelInfo {
                id: "whisper-base",
                name: "Whisper Base",
            },
            ModelInfo {
                id: "whisper-small",
                name: "Whisper Small",
            },
            ModelInfo {
                id: "whisper-medium",
                name: "Whisper Medium",
            },
        ],
    },
];

pub fn catalog() -> &'static [ProviderInfo] {
    &CATALOG
}

pub fn provider_by_id(id: &str) -> Option<&'static ProviderInfo> {
    CATALOG.iter().find(|p| p.id == id)
}

/// Catalog-only lookup of the provider offering a model id.
pub fn provider_for_model(kind: ModelKind, model_id: &str) -> Option<&'static ProviderInfo> {
    CATALOG
        .iter()
        .find(|p| p.models(kind).iter().any(|m| m.id == model_id))
}

/// Pure format validation; no network round-trip. Local runtimes accept the
/// `local` placeholder, everything else requires a non-empty key.
pub fn validate_api_key(provider: &ProviderInfo, key: &str) -> Result<()> {
    let key = key.trim();

    if provider.is_local {
        return Ok(());
    }
    if key.is_empty() {
        return Err(validation_error("API key cannot be empty."));
    }

    match provider.id {
        "openai" if !key.starts_with("sk-") => {
            Err(validation_error("OpenAI API keys start with sk-."))
        }
        "anthropic" if !key.starts_with("sk-ant-") => {
            Err(validation_error("Anthropic API keys start with sk-ant-."))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_sorted_by_provider_id() {
        let ids: Vec<&str> = catalog().iter().map(|p| p.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn key_format_checks_per_provider() {
        let openai = provider_by_id("openai").unwrap();
        assert!(validate_api_key(openai, "sk-test").is_ok());
        assert!(validate_api_key(openai, "bad").is_err());
        assert!(validate_api_key(openai, "").is_err());

        let anthropic = provider_by_id("anthropic").unwrap();
        assert!(validate_api_key(anthropic, "sk-ant-test").is_ok());
        assert!(validate_api_key(anthropic, "sk-test").is_err());

        let ollama = provider_by_id("ollama").unwrap();
        assert!(validate_api_key(ollama, LOCAL_API_KEY).is_ok());
    }

    #[test]
    fn model_lookup_resolves_owning_provider() {
        let provider = provider_for_model(ModelKind::Llm, "gpt-4o-mini").unwrap();
        assert_eq!(provider.id, "openai");
        assert!(provider_for_model(ModelKind::Stt, "gpt-4o-mini").is_none());
    }
}
