//! Model Registry & Capability Mapper
//!
//! Read-only catalogue of known models, shared by reference across the
//! engine. Maps a model on one provider to an equivalent model on another
//! for fallback.
//!
//! ## Mapping precedence
//!
//! 1. Same provider: the source model is returned unchanged
//! 2. Direct equivalence table: the first group containing the source model
//!    wins; inside that group, the first member served by the target
//!    provider is chosen
//! 3. Capability overlap: the target-provider model sharing the most
//!    capabilities with the source; ties go to declaration order and an
//!    overlap of zero is no match

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{ModelTarget, Result, UltraError};

/// Declared model capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Reasoning,
    Code,
    Vision,
    LongContext,
    FunctionCalling,
    JsonMode,
    Multilingual,
    Fast,
    Local,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Chat => "chat",
            Self::Reasoning => "reasoning",
            Self::Code => "code",
            Self::Vision => "vision",
            Self::LongContext => "long_context",
            Self::FunctionCalling => "function_calling",
            Self::JsonMode => "json_mode",
            Self::Multilingual => "multilingual",
            Self::Fast => "fast",
            Self::Local => "local",
        };
        f.write_str(label)
    }
}

pub(crate) fn default_priority() -> u32 {
    100
}

/// Static metadata for one model on one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    #[serde(default)]
    pub context_window: u32,
    /// USD per 1k tokens
    #[serde(default)]
    pub cost_per_1k: f64,
    #[serde(default)]
    pub is_thinking_model: bool,
    /// Lower sorts first when choosing a synthesis lead
    #[serde(default = "default_priority")]
    pub priority: u32,
}

impl ModelDefinition {
    pub fn new(
        provider: impl Into<String>,
        model_id: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
            capabilities: capabilities.into_iter().collect(),
            context_window: 0,
            cost_per_1k: 0.0,
            is_thinking_model: false,
            priority: default_priority(),
        }
    }

    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = tokens;
        self
    }

    pub fn with_cost(mut self, cost_per_1k: f64) -> Self {
        self.cost_per_1k = cost_per_1k;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn thinking(mut self) -> Self {
        self.is_thinking_model = true;
        self
    }

    pub fn target(&self) -> ModelTarget {
        ModelTarget::new(&self.provider, &self.model_id)
    }

    /// Qualified `provider/model_id` name
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.provider, self.model_id)
    }

    pub fn capability_overlap(&self, other: &ModelDefinition) -> usize {
        self.capabilities.intersection(&other.capabilities).count()
    }

    /// Equivalence-table entries may be bare ids or `provider/model_id`
    fn matches_name(&self, name: &str) -> bool {
        match name.split_once('/') {
            Some((provider, model)) if provider == self.provider => model == self.model_id,
            _ => name == self.model_id,
        }
    }
}

/// On-disk registry layout (YAML or TOML)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub models: Vec<ModelDefinition>,
    #[serde(default)]
    pub equivalences: Vec<Vec<String>>,
}

/// Validated, read-only model catalogue
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Vec<ModelDefinition>,
    equivalences: Vec<Vec<String>>,
}

impl ModelRegistry {
    /// Build and validate a registry. Declaration order is preserved and is
    /// the tie-breaker for capability matching.
    pub fn new(models: Vec<ModelDefinition>, equivalences: Vec<Vec<String>>) -> Result<Self> {
        let registry = Self {
            models,
            equivalences,
        };
        registry.validate()?;
        Ok(registry)
    }

    pub fn from_file_contents(file: RegistryFile) -> Result<Self> {
        Self::new(file.models, file.equivalences)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: RegistryFile = serde_yaml::from_str(yaml)?;
        Self::from_file_contents(file)
    }

    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let file: RegistryFile = toml::from_str(toml_str)
            .map_err(|e| UltraError::Config(format!("Invalid registry TOML: {}", e)))?;
        Self::from_file_contents(file)
    }

    /// Load a registry file; format chosen by extension (`.toml`, else YAML)
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let registry = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content)?,
            _ => Self::from_yaml_str(&content)?,
        };
        debug!(
            path = %path.display(),
            models = registry.models.len(),
            groups = registry.equivalences.len(),
            "Model registry loaded"
        );
        Ok(registry)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for model in &self.models {
            if model.provider.is_empty() || model.model_id.is_empty() {
                return Err(UltraError::Config(
                    "Model registry entries need both provider and model_id".to_string(),
                ));
            }
            if !seen.insert((model.provider.as_str(), model.model_id.as_str())) {
                return Err(UltraError::Config(format!(
                    "Duplicate model registry entry: {}",
                    model.qualified_name()
                )));
            }
        }

        for group in &self.equivalences {
            for member in group {
                if !self.models.iter().any(|m| m.matches_name(member)) {
                    return Err(UltraError::Config(format!(
                        "Equivalence group member '{}' is not a registered model",
                        member
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn models(&self) -> &[ModelDefinition] {
        &self.models
    }

    pub fn equivalences(&self) -> &[Vec<String>] {
        &self.equivalences
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn get(&self, provider: &str, model_id: &str) -> Option<&ModelDefinition> {
        self.models
            .iter()
            .find(|m| m.provider == provider && m.model_id == model_id)
    }

    /// Resolve a requested name: `provider/model_id`, or a bare model id
    /// (first declaration wins)
    pub fn resolve(&self, name: &str) -> Option<&ModelDefinition> {
        if let Some((provider, model)) = name.split_once('/')
            && let Some(found) = self.get(provider, model)
        {
            return Some(found);
        }
        self.models.iter().find(|m| m.model_id == name)
    }

    pub fn models_for<'a>(&'a self, provider: &str) -> impl Iterator<Item = &'a ModelDefinition> {
        self.models.iter().filter(move |m| m.provider == provider)
    }

    pub fn providers(&self) -> BTreeSet<&str> {
        self.models.iter().map(|m| m.provider.as_str()).collect()
    }

    /// Map `source_model` on `source_provider` to a model on `target_provider`
    pub fn map_model(
        &self,
        source_provider: &str,
        source_model: &str,
        target_provider: &str,
    ) -> Option<String> {
        if source_provider == target_provider {
            return Some(source_model.to_string());
        }

        if let Some(direct) = self.direct_equivalent(source_provider, source_model, target_provider)
        {
            return Some(direct.model_id.clone());
        }

        self.capability_match(source_provider, source_model, target_provider)
            .map(|m| m.model_id.clone())
    }

    /// Lookup in the hand-curated equivalence table only
    pub fn direct_equivalent(
        &self,
        source_provider: &str,
        source_model: &str,
        target_provider: &str,
    ) -> Option<&ModelDefinition> {
        let source = self.get(source_provider, source_model);
        let in_group = |member: &String| match source {
            Some(def) => def.matches_name(member),
            None => member == source_model,
        };

        let group = self.equivalences.iter().find(|g| g.iter().any(|member| in_group(member)))?;

        group.iter().find_map(|member| {
            self.models_for(target_provider)
                .find(|candidate| candidate.matches_name(member))
        })
    }

    /// Capability-overlap heuristic only
    pub fn capability_match(
        &self,
        source_provider: &str,
        source_model: &str,
        target_provider: &str,
    ) -> Option<&ModelDefinition> {
        let source = self.get(source_provider, source_model)?;

        let mut best: Option<(&ModelDefinition, usize)> = None;
        for candidate in self.models_for(target_provider) {
            let overlap = source.capability_overlap(candidate);
            // Strict comparison keeps the earliest declaration on ties
            if overlap > 0 && best.is_none_or(|(_, score)| overlap > score) {
                best = Some((candidate, overlap));
            }
        }
        best.map(|(model, _)| model)
    }

    /// Built-in catalogue used when no registry is configured
    pub fn builtin() -> Self {
        use Capability::*;

        let models = vec![
            ModelDefinition::new(
                "openai",
                "gpt-4o",
                [Chat, Reasoning, Code, Vision, LongContext, FunctionCalling, JsonMode, Multilingual],
            )
            .with_context_window(128_000)
            .with_cost(0.005)
            .with_priority(10),
            ModelDefinition::new(
                "openai",
                "gpt-4o-mini",
                [Chat, Code, Vision, LongContext, FunctionCalling, JsonMode, Fast],
            )
            .with_context_window(128_000)
            .with_cost(0.000_15)
            .with_priority(40),
            ModelDefinition::new("openai", "o1", [Chat, Reasoning, Code, LongContext])
                .with_context_window(200_000)
                .with_cost(0.015)
                .with_priority(20)
                .thinking(),
            ModelDefinition::new(
                "anthropic",
                "claude-3-opus-20240229",
                [Chat, Reasoning, Code, Vision, LongContext, FunctionCalling, Multilingual],
            )
            .with_context_window(200_000)
            .with_cost(0.015)
            .with_priority(10),
            ModelDefinition::new(
                "anthropic",
                "claude-3-5-sonnet-20241022",
                [Chat, Reasoning, Code, Vision, LongContext, FunctionCalling, Multilingual],
            )
            .with_context_window(200_000)
            .with_cost(0.003)
            .with_priority(15),
            ModelDefinition::new(
                "anthropic",
                "claude-3-haiku-20240307",
                [Chat, Code, Vision, LongContext, FunctionCalling, Fast],
            )
            .with_context_window(200_000)
            .with_cost(0.000_25)
            .with_priority(40),
            ModelDefinition::new(
                "google",
                "gemini-1.5-pro",
                [Chat, Reasoning, Code, Vision, LongContext, FunctionCalling, JsonMode, Multilingual],
            )
            .with_context_window(2_000_000)
            .with_cost(0.001_25)
            .with_priority(10),
            ModelDefinition::new(
                "google",
                "gemini-1.5-flash",
                [Chat, Code, Vision, LongContext, FunctionCalling, JsonMode, Fast],
            )
            .with_context_window(1_000_000)
            .with_cost(0.000_075)
            .with_priority(40),
            ModelDefinition::new(
                "google",
                "gemini-2.0-flash-thinking-exp",
                [Chat, Reasoning, Code, LongContext],
            )
            .with_context_window(32_000)
            .with_priority(20)
            .thinking(),
            ModelDefinition::new("ollama", "llama3:latest", [Chat, Code, Fast, Local])
                .with_context_window(8_192)
                .with_priority(60),
            ModelDefinition::new("ollama", "mistral:latest", [Chat, Code, Fast, Local, Multilingual])
                .with_context_window(32_768)
                .with_priority(60),
        ];

        let equivalences = vec![
            vec![
                "gpt-4o".to_string(),
                "claude-3-opus-20240229".to_string(),
                "gemini-1.5-pro".to_string(),
            ],
            vec![
                "gpt-4o-mini".to_string(),
                "claude-3-haiku-20240307".to_string(),
                "gemini-1.5-flash".to_string(),
                "llama3:latest".to_string(),
            ],
            vec![
                "o1".to_string(),
                "gemini-2.0-flash-thinking-exp".to_string(),
            ],
        ];

        Self {
            models,
            equivalences,
        }
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_is_valid() {
        let registry = ModelRegistry::builtin();
        assert!(registry.validate().is_ok());
        assert_eq!(
            registry.providers().into_iter().collect::<Vec<_>>(),
            vec!["anthropic", "google", "ollama", "openai"]
        );
    }

    #[test]
    fn test_same_provider_is_identity() {
        let registry = ModelRegistry::builtin();
        assert_eq!(
            registry.map_model("openai", "gpt-4o", "openai").as_deref(),
            Some("gpt-4o")
        );
    }

    #[test]
    fn test_direct_table_wins() {
        let registry = ModelRegistry::builtin();
        assert_eq!(
            registry.map_model("openai", "gpt-4o", "anthropic").as_deref(),
            Some("claude-3-opus-20240229")
        );
        assert_eq!(
            registry.map_model("anthropic", "claude-3-opus-20240229", "google").as_deref(),
            Some("gemini-1.5-pro")
        );
        assert_eq!(
            registry.map_model("google", "gemini-1.5-flash", "ollama").as_deref(),
            Some("llama3:latest")
        );
    }

    #[test]
    fn test_direct_table_overrides_better_heuristic_score() {
        // Sonnet has the same capability set as opus, but gpt-4o's group names opus
        let registry = ModelRegistry::builtin();
        let via_table = registry.direct_equivalent("openai", "gpt-4o", "anthropic");
        assert_eq!(via_table.map(|m| m.model_id.as_str()), Some("claude-3-opus-20240229"));
    }

    #[test]
    fn test_lookups_borrow_only_the_registry() {
        let registry = ModelRegistry::builtin();
        let (direct, heuristic) = {
            let target = String::from("anthropic");
            (
                registry.direct_equivalent("openai", "gpt-4o", &target),
                registry.capability_match("openai", "gpt-4o", &target),
            )
        };
        assert!(direct.is_some());
        assert!(heuristic.is_some());
    }

    #[test]
    fn test_heuristic_fallback_when_not_in_table() {
        let registry = ModelRegistry::builtin();
        // Sonnet is in no group: best overlap on openai is gpt-4o (7 shared)
        assert_eq!(
            registry
                .map_model("anthropic", "claude-3-5-sonnet-20241022", "openai")
                .as_deref(),
            Some("gpt-4o")
        );
        // o1's group has no ollama member: heuristic picks the first best overlap
        assert_eq!(
            registry.map_model("openai", "o1", "ollama").as_deref(),
            Some("llama3:latest")
        );
    }

    #[test]
    fn test_heuristic_ties_use_declaration_order() {
        use Capability::*;
        let registry = ModelRegistry::new(
            vec![
                ModelDefinition::new("a", "src", [Chat, Code]),
                ModelDefinition::new("b", "first", [Chat]),
                ModelDefinition::new("b", "second", [Code]),
            ],
            vec![],
        )
        .unwrap();

        assert_eq!(registry.map_model("a", "src", "b").as_deref(), Some("first"));
    }

    #[test]
    fn test_no_overlap_means_no_mapping() {
        use Capability::*;
        let registry = ModelRegistry::new(
            vec![
                ModelDefinition::new("a", "vision-only", [Vision]),
                ModelDefinition::new("b", "local", [Local]),
            ],
            vec![],
        )
        .unwrap();

        assert_eq!(registry.map_model("a", "vision-only", "b"), None);
        assert_eq!(registry.map_model("a", "unknown-model", "b"), None);
        assert_eq!(registry.map_model("a", "vision-only", "missing-provider"), None);
    }

    #[test]
    fn test_qualified_group_members() {
        use Capability::*;
        let registry = ModelRegistry::new(
            vec![
                ModelDefinition::new("ollama-a", "llama3", [Chat]),
                ModelDefinition::new("ollama-b", "llama3", [Chat]),
                ModelDefinition::new("ollama-b", "qwen", [Chat]),
            ],
            vec![vec!["ollama-a/llama3".into(), "ollama-b/qwen".into()]],
        )
        .unwrap();

        assert_eq!(
            registry.map_model("ollama-a", "llama3", "ollama-b").as_deref(),
            Some("qwen")
        );
    }

    #[test]
    fn test_resolve_names() {
        let registry = ModelRegistry::builtin();
        assert_eq!(
            registry.resolve("anthropic/claude-3-haiku-20240307").map(|m| m.provider.as_str()),
            Some("anthropic")
        );
        assert_eq!(
            registry.resolve("gpt-4o").map(|m| m.provider.as_str()),
            Some("openai")
        );
        assert!(registry.resolve("gpt-5-turbo-ultra").is_none());
    }

    #[test]
    fn test_validation_rejects_duplicates_and_unknown_members() {
        let dup = ModelRegistry::new(
            vec![
                ModelDefinition::new("openai", "gpt-4o", []),
                ModelDefinition::new("openai", "gpt-4o", []),
            ],
            vec![],
        );
        assert!(matches!(dup, Err(UltraError::Config(_))));

        let unknown = ModelRegistry::new(
            vec![ModelDefinition::new("openai", "gpt-4o", [])],
            vec![vec!["gpt-4o".into(), "nonexistent".into()]],
        );
        assert!(matches!(unknown, Err(UltraError::Config(_))));
    }

    #[test]
    fn test_from_yaml_str() {
        let yaml = r#"
models:
  - provider: openai
    model_id: gpt-4o
    capabilities: [chat, code, vision]
    context_window: 128000
    cost_per_1k: 0.005
  - provider: anthropic
    model_id: claude-3-opus-20240229
    capabilities: [chat, code]
    priority: 5
  - provider: google
    model_id: gemini-2.0-flash-thinking-exp
    capabilities: [chat, reasoning]
    is_thinking_model: true
equivalences:
  - [gpt-4o, claude-3-opus-20240229]
"#;
        let registry = ModelRegistry::from_yaml_str(yaml).unwrap();
        assert_eq!(registry.len(), 3);

        let opus = registry.get("anthropic", "claude-3-opus-20240229").unwrap();
        assert_eq!(opus.priority, 5);
        assert_eq!(registry.get("openai", "gpt-4o").unwrap().priority, 100);
        assert!(registry.resolve("gemini-2.0-flash-thinking-exp").unwrap().is_thinking_model);

        assert_eq!(
            registry.map_model("anthropic", "claude-3-opus-20240229", "openai").as_deref(),
            Some("gpt-4o")
        );
    }

    #[test]
    fn test_from_toml_str() {
        let toml_str = r#"
equivalences = [["gpt-4o", "gemini-1.5-pro"]]

[[models]]
provider = "openai"
model_id = "gpt-4o"
capabilities = ["chat"]

[[models]]
provider = "google"
model_id = "gemini-1.5-pro"
capabilities = ["chat"]
"#;
        let registry = ModelRegistry::from_toml_str(toml_str).unwrap();
        assert_eq!(
            registry.map_model("openai", "gpt-4o", "google").as_deref(),
            Some("gemini-1.5-pro")
        );
    }
}
