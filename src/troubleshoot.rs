//! AI troubleshooting with a per-model response cache.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

use crate::cache::{self, CacheKey, NewEntry};
use crate::error::{bad_request, ServiceError, ServiceResult};
use crate::llm::{calculate_cost, extract_json, model_spec, CompletionRequest};
use crate::manuals;
use crate::model_select::{estimate_complexity, suggest_model};
use crate::state::AppState;
use crate::usage::{self, UsageRecord};

const ENDPOINT: &str = "/troubleshoot";
pub const AUTO_MODEL: &str = "auto";

const MAX_EQUIPMENT_CHARS: usize = 100;
const MAX_ERROR_CODE_CHARS: usize = 50;

const SYSTEM_PROMPT: &str = "You are a commercial equipment service technician assistant. \
Provide detailed, practical troubleshooting guidance. Always respond in valid JSON format only.";

const RESPONSE_FORMAT: &str = r#"{
  "error_definition": "Clear definition of the error",
  "severity": "critical/high/medium/low",
  "troubleshooting_steps": [
    {"step": 1, "title": "Short step title", "instruction": "Detailed instruction",
     "expected_result": "What should happen", "safety_warning": "Warning if applicable or null"}
  ],
  "parts_to_check": [
    {"name": "Part name", "part_number": "P/N if available or null", "description": "What it does",
     "location": "Where to find it", "common_failure_modes": ["mode1", "mode2"]}
  ],
  "common_causes": ["cause1", "cause2"],
  "estimated_repair_time_minutes": 30,
  "difficulty": "beginner/intermediate/advanced",
  "citations": [{"source": "Manual section name", "page": 22, "section": "Section title"}]
}"#;

#[derive(Debug, Clone, Deserialize)]
pub struct EquipmentInfo {
    pub manufacturer: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TroubleshootRequest {
    pub equipment: EquipmentInfo,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub symptom: Option<String>,
    #[serde(default)]
    pub additional_context: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TroubleshootOutcome {
    pub cache_hit: bool,
    pub response_time_ms: i64,
    pub troubleshooting: Value,
    pub model_id: String,
    pub auto_selected: bool,
    pub cache_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub times_served: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_available: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackRequest {
    pub cache_id: i64,
    pub helpful: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn equipment_field<'a>(name: &str, value: &'a str) -> ServiceResult<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(bad_request(format!("equipment.{} is required", name)));
    }
    if value.chars().count() > MAX_EQUIPMENT_CHARS {
        return Err(bad_request(format!(
            "equipment.{} must be at most {} characters",
            name, MAX_EQUIPMENT_CHARS
        )));
    }
    Ok(value)
}

pub async fn troubleshoot(
    state: &AppState,
    req: &TroubleshootRequest,
    user_id: Option<i64>,
) -> ServiceResult<TroubleshootOutcome> {
    let started = Instant::now();
    let manufacturer = equipment_field("manufacturer", &req.equipment.manufacturer)?;
    let model = equipment_field("model", &req.equipment.model)?;
    let error_code = non_blank(&req.error_code);
    let symptom = non_blank(&req.symptom);
    if error_code.is_none() && symptom.is_none() {
        return Err(bad_request("Provide an error_code or a symptom"));
    }
    if error_code.is_some_and(|c| c.chars().count() > MAX_ERROR_CODE_CHARS) {
        return Err(bad_request(format!(
            "error_code must be at most {} characters",
            MAX_ERROR_CODE_CHARS
        )));
    }

    let library_manual = manuals::find_library_manual(&state.pool, manufacturer, model).await?;

    let requested = non_blank(&req.model_id).unwrap_or(AUTO_MODEL);
    let (model_id, auto_selected) = if requested.eq_ignore_ascii_case(AUTO_MODEL) {
        let complexity = estimate_complexity(error_code, symptom);
        let choice = suggest_model(
            library_manual.is_some(),
            complexity,
            &state.llm.configured_providers(),
        );
        tracing::debug!(model_id = %choice.model_id, ?complexity, reason = %choice.reason, "auto-selected model");
        (choice.model_id, true)
    } else {
        (requested.to_string(), false)
    };
    // Cache and log under the model that will actually answer. With no
    // provider configured, cached answers are still served.
    let model_id = match state.llm.resolve(&model_id) {
        Ok(spec) => spec.id.to_string(),
        Err(_) => model_id,
    };

    let key = CacheKey {
        manufacturer,
        model,
        error_code,
        symptom,
        model_id: &model_id,
    };

    if let Some(hit) = cache::check(&state.pool, &key).await? {
        let response_time_ms = started.elapsed().as_millis() as i64;
        usage::log_quietly(
            &state.pool,
            &UsageRecord {
                endpoint: ENDPOINT,
                user_id,
                provider: Some(model_spec(&model_id).provider.as_str()),
                model_id: Some(&model_id),
                response_time_ms,
                cache_hit: true,
                ..Default::default()
            },
        )
        .await;
        tracing::info!(cache_id = hit.cache_id, model_id = %model_id, "troubleshooting cache hit");

        return Ok(TroubleshootOutcome {
            cache_hit: true,
            response_time_ms,
            troubleshooting: hit.response,
            model_id,
            auto_selected,
            cache_id: Some(hit.cache_id),
            cached_at: Some(hit.cached_at),
            times_served: Some(hit.times_served),
            manual_available: None,
            manual_id: None,
            cost_usd: None,
        });
    }

    let manual_text = match &library_manual {
        Some(manual) => {
            manuals::record_access(&state.pool, &manual.id).await?;
            manuals::extracted_text(&state.pool, &manual.id).await?
        }
        None => None,
    };

    let prompt = build_prompt(
        manufacturer,
        model,
        error_code,
        symptom,
        non_blank(&req.additional_context),
        manual_text.as_deref(),
        state.config.llm.max_manual_chars,
    );

    let generated = async {
        let completion = state
            .llm
            .complete(&model_id, &CompletionRequest::new(SYSTEM_PROMPT, prompt))
            .await?;
        let response = extract_json(&completion.text)
            .map_err(|e| ServiceError::Upstream(format!("AI response was not valid JSON: {}", e)))?;
        if !response.is_object() {
            return Err(ServiceError::Upstream(
                "AI response was not a JSON object".to_string(),
            ));
        }
        Ok::<_, ServiceError>((completion, response))
    }
    .await;

    let response_time_ms = started.elapsed().as_millis() as i64;
    let (completion, response) = match generated {
        Ok(generated) => generated,
        Err(e) => {
            usage::log_quietly(
                &state.pool,
                &UsageRecord {
                    endpoint: ENDPOINT,
                    user_id,
                    provider: Some(model_spec(&model_id).provider.as_str()),
                    model_id: Some(&model_id),
                    response_time_ms,
                    status_code: 502,
                    error_message: Some(&e.to_string()),
                    ..Default::default()
                },
            )
            .await;
            tracing::warn!(model_id = %model_id, error = %e, "troubleshooting request failed");
            return Err(match e {
                ServiceError::Upstream(message) => ServiceError::Upstream(format!(
                    "Failed to generate troubleshooting response: {}",
                    message
                )),
                other => other,
            });
        }
    };

    let cost_usd = calculate_cost(&completion.model, completion.input_tokens, completion.output_tokens);
    usage::log_quietly(
        &state.pool,
        &UsageRecord {
            endpoint: ENDPOINT,
            user_id,
            provider: Some(completion.provider.as_str()),
            model_id: Some(&completion.model),
            prompt_tokens: completion.input_tokens,
            completion_tokens: completion.output_tokens,
            cost_usd,
            response_time_ms,
            ..Default::default()
        },
    )
    .await;

    let manual_id = library_manual.as_ref().map(|m| m.id.clone());
    let manual_ids: Vec<String> = manual_id.iter().cloned().collect();
    let cache_id = cache::save(
        &state.pool,
        &NewEntry {
            key,
            response: &response,
            manual_ids: &manual_ids,
            response_time_ms,
            prompt_tokens: completion.input_tokens,
            completion_tokens: completion.output_tokens,
            cost_usd,
        },
        state.config.cache.ttl_days,
    )
    .await?;

    Ok(TroubleshootOutcome {
        cache_hit: false,
        response_time_ms,
        troubleshooting: response,
        model_id,
        auto_selected,
        cache_id: Some(cache_id),
        cached_at: None,
        times_served: None,
        manual_available: Some(library_manual.is_some()),
        manual_id,
        cost_usd: Some(cost_usd),
    })
}

pub async fn feedback(state: &AppState, req: &FeedbackRequest) -> ServiceResult<()> {
    cache::feedback(&state.pool, req.cache_id, req.helpful, req.notes.as_deref()).await
}

fn build_prompt(
    manufacturer: &str,
    model: &str,
    error_code: Option<&str>,
    symptom: Option<&str>,
    additional_context: Option<&str>,
    manual_text: Option<&str>,
    max_manual_chars: usize,
) -> String {
    let manual_context = manual_text
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| t.chars().take(max_manual_chars).collect::<String>())
        .unwrap_or_else(|| "No manual available - use your knowledge.".to_string());

    let mut prompt = format!(
        "Troubleshoot this issue:\n\nEquipment: {} {}\nError Code: {}\nSymptom: {}\n",
        manufacturer,
        model,
        error_code.unwrap_or("None specified"),
        symptom.unwrap_or("None specified"),
    );
    if let Some(context) = additional_context {
        prompt.push_str(&format!("Additional Context: {}\n", context));
    }
    prompt.push_str(&format!(
        "\nSERVICE MANUAL CONTEXT:\n{}\n\nProvide troubleshooting guidance in this JSON format:\n{}\n\n\
         CRITICAL: Return ONLY valid JSON. If manual content was provided, cite specific page numbers.",
        manual_context, RESPONSE_FORMAT
    ));
    prompt
}
