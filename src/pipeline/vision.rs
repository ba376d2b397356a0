//! Vision-inference service: one image plus instructions in, raw text out.
//!
//! ## Why a trait of our own?
//!
//! The orchestrator only needs "send this image with these instructions to
//! this tier". Narrowing `LLMProvider` down to [`VisionService`] lets tests
//! script responses and count calls without a network, and keeps provider
//! resolution in one place ([`LlmVisionService::from_config`]).
//!
//! ## Two tiers
//!
//! Classification is a yes/no-and-count question and runs on a cheap model;
//! extraction runs on the main model. Both tiers may share one provider.

use crate::config::ExtractionConfig;
use crate::error::{Pdf2TablesError, ServiceError};
use crate::pipeline::encode::encode_image;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use image::DynamicImage;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Default model when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Which model answers a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Classifier,
    Extraction,
}

/// One inference request.
#[derive(Debug, Clone, Copy)]
pub struct VisionRequest<'a> {
    pub tier: ModelTier,
    pub image: &'a DynamicImage,
    /// System framing (JSON-only output contract).
    pub system: &'a str,
    /// Task-specific instructions.
    pub prompt: &'a str,
    pub temperature: f32,
    pub max_tokens: usize,
}

/// The inference contract used by the pipeline.
///
/// Implementations return the raw response text; decoding and schema checks
/// happen in [`crate::payload`]. Transport failures are [`ServiceError`]s.
#[async_trait]
pub trait VisionService: Send + Sync {
    async fn infer(&self, request: VisionRequest<'_>) -> Result<String, ServiceError>;
}

/// [`VisionService`] backed by `edgequake-llm` providers.
pub struct LlmVisionService {
    extraction: Arc<dyn LLMProvider>,
    classifier: Arc<dyn LLMProvider>,
    timeout_secs: u64,
}

impl fmt::Debug for LlmVisionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmVisionService")
            .field("extraction", &"<dyn LLMProvider>")
            .field("classifier", &"<dyn LLMProvider>")
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl LlmVisionService {
    pub fn new(
        extraction: Arc<dyn LLMProvider>,
        classifier: Arc<dyn LLMProvider>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            extraction,
            classifier,
            timeout_secs,
        }
    }

    /// Resolve both tiers from the configuration and environment.
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, Pdf2TablesError> {
        let extraction = resolve_provider(config)?;
        let classifier = resolve_classifier(config, &extraction)?;
        Ok(Self::new(extraction, classifier, config.api_timeout_secs))
    }

    fn provider(&self, tier: ModelTier) -> &Arc<dyn LLMProvider> {
        match tier {
            ModelTier::Classifier => &self.classifier,
            ModelTier::Extraction => &self.extraction,
        }
    }
}

#[async_trait]
impl VisionService for LlmVisionService {
    async fn infer(&self, request: VisionRequest<'_>) -> Result<String, ServiceError> {
        let start = Instant::now();
        let image = encode_image(request.image)
            .map_err(|e| ServiceError::Transport(format!("image encoding failed: {e}")))?;

        let messages = vec![
            ChatMessage::system(request.system),
            ChatMessage::user_with_images(request.prompt, vec![image]),
        ];
        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };

        match self.provider(request.tier).chat(&messages, Some(&options)).await {
            Ok(response) => {
                debug!(
                    "{:?} call: {} input tokens, {} output tokens, {:?}",
                    request.tier,
                    response.prompt_tokens,
                    response.completion_tokens,
                    start.elapsed()
                );
                Ok(response.content)
            }
            Err(e) => Err(ServiceError::classify(&e.to_string(), self.timeout_secs)),
        }
    }
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, Pdf2TablesError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        Pdf2TablesError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the extraction provider, from most-specific to least-specific:
///
/// 1. pre-built provider (`config.provider`)
/// 2. named provider + model (`config.provider_name`)
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`
/// 4. `OPENAI_API_KEY` present → OpenAI
/// 5. `ProviderFactory::from_env()` auto-detection
fn resolve_provider(config: &ExtractionConfig) -> Result<Arc<dyn LLMProvider>, Pdf2TablesError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, config.model.as_deref().unwrap_or(&model));
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_vision_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| Pdf2TablesError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

/// The classifier tier gets its own provider only when asked for one;
/// otherwise it shares the extraction provider.
fn resolve_classifier(
    config: &ExtractionConfig,
    extraction: &Arc<dyn LLMProvider>,
) -> Result<Arc<dyn LLMProvider>, Pdf2TablesError> {
    if let Some(ref provider) = config.classifier_provider {
        return Ok(Arc::clone(provider));
    }

    let Some(model) = config.classifier_model.as_deref() else {
        if let Some(ref name) = config.classifier_provider_name {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_vision_provider(name, model);
        }
        return Ok(Arc::clone(extraction));
    };

    let name = config
        .classifier_provider_name
        .clone()
        .or_else(|| config.provider_name.clone())
        .or_else(|| std::env::var("EDGEQUAKE_LLM_PROVIDER").ok().filter(|p| !p.is_empty()))
        .or_else(|| {
            std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|k| !k.is_empty())
                .map(|_| "openai".to_string())
        });

    match name {
        Some(name) => create_vision_provider(&name, model),
        None => {
            debug!("No provider name for classifier model '{}'; sharing extraction provider", model);
            Ok(Arc::clone(extraction))
        }
    }
}
