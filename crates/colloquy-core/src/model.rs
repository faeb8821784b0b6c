//! Model descriptors and capability flags.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use colloquy_config::ProviderKind;

/// A named feature a specific model supports. Open-ended across providers
/// but enumerable for the ones the client understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Temperature,
    Tools,
    ToolChoice,
    VisionImage,
    VisionVideo,
    Audio,
    Document,
    MultipleChoices,
    JsonSchema,
    StructuredOutput,
    Completion,
}

/// A model offered by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    /// Provider-scoped model id, e.g. "claude-sonnet-4-20250514".
    pub id: String,
    /// Owning provider.
    pub provider: ProviderKind,
    /// Display name.
    pub name: String,
    /// Features this model supports.
    pub capabilities: BTreeSet<Capability>,
    /// Context window in tokens.
    pub context_length: u32,
    /// Output token ceiling, when the provider reports one.
    pub max_output_tokens: Option<u32>,
}

impl Model {
    pub fn new(id: impl Into<String>, provider: ProviderKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            provider,
            capabilities: BTreeSet::new(),
            context_length: 8192,
            max_output_tokens: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities.extend(caps);
        self
    }

    pub fn with_context_length(mut self, tokens: u32) -> Self {
        self.context_length = tokens;
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_builder() {
        let model = Model::new("claude-sonnet-4-20250514", ProviderKind::Anthropic)
            .with_name("Claude Sonnet 4")
            .with_capabilities([Capability::Tools, Capability::VisionImage])
            .with_context_length(200_000)
            .with_max_output_tokens(64_000);

        assert_eq!(model.name, "Claude Sonnet 4");
        assert!(model.supports(Capability::Tools));
        assert!(!model.supports(Capability::Audio));
        assert_eq!(model.context_length, 200_000);
        assert_eq!(model.max_output_tokens, Some(64_000));
    }

    #[test]
    fn test_model_default_name_is_id() {
        let model = Model::new("llama3", ProviderKind::Ollama);
        assert_eq!(model.name, "llama3");
    }
}
