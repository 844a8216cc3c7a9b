//! Cost-aware model choice for `model_id = "auto"`.
//!
//! Queries are rated low/medium/high from their inputs; the rating (and
//! whether a manual is available as context) picks a tier of models, and
//! the cheapest model of that tier from a configured provider wins.

use serde::Serialize;

use crate::llm::{Provider, DEFAULT_MODEL_ID};

/// Models ordered by cost, cheapest first.
const MODEL_PRIORITY: &[(&str, Provider)] = &[
    ("gemini-2.5-flash", Provider::Google),
    ("gpt-4o-mini", Provider::OpenAi),
    ("claude-haiku-4-5", Provider::Anthropic),
    ("gemini-2.5-pro", Provider::Google),
    ("gpt-4o", Provider::OpenAi),
    ("claude-sonnet-4-5", Provider::Anthropic),
];

const FLASH_TIER: &[&str] = &["gemini-2.5-flash", "gpt-4o-mini", "claude-haiku-4-5"];
const BALANCED_TIER: &[&str] = &["gemini-2.5-pro", "gpt-4o"];
const CAPABLE_TIER: &[&str] = &["claude-sonnet-4-5", "gemini-2.5-pro", "gpt-4o"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelChoice {
    pub model_id: String,
    pub provider: Provider,
    pub reason: String,
    pub auto_selected: bool,
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub fn estimate_complexity(error_code: Option<&str>, symptom: Option<&str>) -> Complexity {
    match (present(error_code), present(symptom)) {
        (None, None) => Complexity::Medium,
        (Some(_), None) => Complexity::Low,
        (_, Some(symptom)) => match symptom.chars().count() {
            0..=49 => Complexity::Low,
            50..=199 => Complexity::Medium,
            _ => Complexity::High,
        },
    }
}

/// Pick a model for the given context. When no model of the tier belongs to
/// a preferred provider, the cheapest model of the tier is returned anyway.
pub fn suggest_model(
    has_manual: bool,
    complexity: Complexity,
    preferred_providers: &[Provider],
) -> ModelChoice {
    let (tier, reason) = match complexity {
        Complexity::Low => (FLASH_TIER, "Simple query - using fast, affordable model"),
        Complexity::Medium if has_manual => {
            (FLASH_TIER, "Simple query - using fast, affordable model")
        }
        Complexity::Medium => (BALANCED_TIER, "Medium complexity - using balanced model"),
        Complexity::High => (CAPABLE_TIER, "Complex query - using most capable model"),
    };

    let in_tier = |(id, _): &&(&str, Provider)| tier.contains(id);

    let chosen = MODEL_PRIORITY
        .iter()
        .filter(in_tier)
        .find(|(_, provider)| preferred_providers.contains(provider))
        .or_else(|| MODEL_PRIORITY.iter().find(in_tier));

    match chosen {
        Some((id, provider)) => ModelChoice {
            model_id: id.to_string(),
            provider: *provider,
            reason: reason.to_string(),
            auto_selected: true,
        },
        None => ModelChoice {
            model_id: DEFAULT_MODEL_ID.to_string(),
            provider: Provider::Anthropic,
            reason: "Default selection".to_string(),
            auto_selected: true,
        },
    }
}
