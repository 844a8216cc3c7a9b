//! Retrieval-augmented question answering over indexed manuals.
//!
//! The question is embedded, every chunk of the matching indexed manuals is
//! scored by cosine similarity, and the best `top_k` excerpts become the
//! context of a single completion. Whenever retrieval cannot help (no
//! manual, embedding failure, nothing relevant) a best-effort answer is
//! still returned with a note explaining why.

use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::cmp::Ordering;

use crate::embedding::{blob_to_vec, cosine_similarity, embed_query};
use crate::error::{bad_request, ServiceResult};
use crate::llm::{calculate_cost, Completion, CompletionRequest};
use crate::manuals::{self, Manual, STATUS_COMPLETE};
use crate::state::AppState;
use crate::usage::{self, UsageRecord};

const ENDPOINT: &str = "/query/rag";
const RAG_MAX_TOKENS: u32 = 900;
const FALLBACK_MAX_TOKENS: u32 = 500;

pub const NOTE_NO_MANUAL: &str = "Note: No indexed manual was found for this model.";
pub const NOTE_RETRIEVAL_UNAVAILABLE: &str =
    "Note: Manual is indexed but semantic retrieval was unavailable for this request.";
pub const NOTE_NO_EXCERPTS: &str =
    "Note: Manual is indexed but no sufficiently relevant excerpts were found for this question.";

const SYSTEM_PROMPT: &str = "You are a field service assistant for commercial kitchen equipment repair.";

#[derive(Debug, Clone, Deserialize)]
pub struct RagQuery {
    pub question: String,
    pub equipment_model: String,
    pub brand: String,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RagSource {
    pub page: Option<i64>,
    pub section: Option<String>,
    pub excerpt: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualUsed {
    pub id: String,
    pub filename: String,
    pub brand: String,
    pub model: String,
}

impl From<&Manual> for ManualUsed {
    fn from(m: &Manual) -> Self {
        Self {
            id: m.id.clone(),
            filename: m.filename.clone(),
            brand: m.brand.clone(),
            model: m.model.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RagAnswer {
    pub answer: String,
    pub sources: Vec<RagSource>,
    pub manual_used: Option<ManualUsed>,
    pub manual_available: bool,
}

/// A chunk scored against the question.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub page_number: Option<i64>,
    pub section: Option<String>,
    pub text: String,
    pub score: f32,
}

impl RagQuery {
    fn validate(&self, default_top_k: usize) -> ServiceResult<usize> {
        if self.question.trim().chars().count() < 3 {
            return Err(bad_request("question must be at least 3 characters"));
        }
        if self.equipment_model.trim().is_empty() {
            return Err(bad_request("equipment_model is required"));
        }
        if self.brand.trim().is_empty() {
            return Err(bad_request("brand is required"));
        }
        let top_k = self.top_k.unwrap_or(default_top_k);
        if !(1..=10).contains(&top_k) {
            return Err(bad_request("top_k must be between 1 and 10"));
        }
        Ok(top_k)
    }
}

pub async fn answer(state: &AppState, query: &RagQuery, user_id: Option<i64>) -> ServiceResult<RagAnswer> {
    let top_k = query.validate(state.config.retrieval.top_k)?;

    let Some(manual) =
        manuals::find_indexed_manual(&state.pool, &query.brand, &query.equipment_model).await?
    else {
        return fallback(state, query, user_id, None, NOTE_NO_MANUAL).await;
    };

    let question_vec = match embed_query(state.embedder.as_ref(), query.question.trim()).await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "question embedding failed, answering without excerpts");
            return fallback(state, query, user_id, Some(&manual), NOTE_RETRIEVAL_UNAVAILABLE).await;
        }
    };

    let excerpts = similarity_search(state, &question_vec, &query.brand, &query.equipment_model, top_k).await?;
    if excerpts.is_empty() {
        return fallback(state, query, user_id, Some(&manual), NOTE_NO_EXCERPTS).await;
    }

    let prompt = format!(
        "Answer ONLY based on the manual excerpts provided below.\n\
         If the answer is not in the excerpts, say so clearly - do not guess.\n\
         Be concise and practical - the technician is standing in front of the equipment.\n\
         Always cite which page or section your answer comes from.\n\n\
         Manual excerpts:\n{}\n\nQuestion: {}\n",
        build_context(&excerpts),
        query.question.trim()
    );
    let mut request = CompletionRequest::new(SYSTEM_PROMPT, prompt);
    request.max_tokens = RAG_MAX_TOKENS;
    let completion = complete_logged(state, &request, user_id).await?;

    let excerpt_chars = state.config.retrieval.excerpt_chars;
    let sources = excerpts
        .iter()
        .map(|c| RagSource {
            page: c.page_number,
            section: c.section.clone(),
            excerpt: c.text.chars().take(excerpt_chars).collect(),
        })
        .collect();

    Ok(RagAnswer {
        answer: completion.text.trim().to_string(),
        sources,
        manual_used: Some(ManualUsed::from(&manual)),
        manual_available: true,
    })
}

/// Best `top_k` chunks of the complete manuals matching brand and model.
pub async fn similarity_search(
    state: &AppState,
    question_vec: &[f32],
    brand: &str,
    model: &str,
    top_k: usize,
) -> ServiceResult<Vec<ScoredChunk>> {
    let rows = sqlx::query(
        r#"
        SELECT c.page_number, c.section, c.chunk_text, c.embedding
        FROM manual_chunks c
        JOIN manuals m ON m.id = c.manual_id
        WHERE lower(trim(m.model)) = ? AND lower(trim(m.brand)) = ?
          AND m.indexing_status = ? AND m.indexed_at IS NOT NULL
        "#,
    )
    .bind(model.trim().to_lowercase())
    .bind(brand.trim().to_lowercase())
    .bind(STATUS_COMPLETE)
    .fetch_all(&state.pool)
    .await?;

    let mut scored: Vec<ScoredChunk> = rows
        .iter()
        .filter_map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let score = cosine_similarity(question_vec, &blob_to_vec(&blob));
            // zero means orthogonal or a dimension mismatch
            (score > 0.0).then(|| ScoredChunk {
                page_number: row.get("page_number"),
                section: row.get("section"),
                text: row.get("chunk_text"),
                score,
            })
        })
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    scored.truncate(top_k);
    Ok(scored)
}

/// Excerpt blocks in the form `[Excerpt i] Page p, Section: s` + text.
pub fn build_context(chunks: &[ScoredChunk]) -> String {
    chunks
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let page = c
                .page_number
                .map(|p| p.to_string())
                .unwrap_or_else(|| "?".to_string());
            let section = c.section.as_deref().filter(|s| !s.is_empty()).unwrap_or("Unknown");
            format!("[Excerpt {}] Page {}, Section: {}\n{}", i + 1, page, section, c.text.trim())
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

async fn fallback(
    state: &AppState,
    query: &RagQuery,
    user_id: Option<i64>,
    manual: Option<&Manual>,
    note: &str,
) -> ServiceResult<RagAnswer> {
    let prompt = format!(
        "No indexed manual excerpts are available for this equipment in the system.\n\
         Give a concise best-effort answer and clearly say that no manual is currently indexed.\n\n\
         Equipment: {} {}\nQuestion: {}\n",
        query.brand.trim(),
        query.equipment_model.trim(),
        query.question.trim()
    );
    let mut request = CompletionRequest::new(SYSTEM_PROMPT, prompt);
    request.max_tokens = FALLBACK_MAX_TOKENS;
    let completion = complete_logged(state, &request, user_id).await?;

    Ok(RagAnswer {
        answer: format!("{}\n\n{}", completion.text.trim(), note),
        sources: Vec::new(),
        manual_used: manual.map(ManualUsed::from),
        manual_available: manual.is_some(),
    })
}

async fn complete_logged(
    state: &AppState,
    request: &CompletionRequest,
    user_id: Option<i64>,
) -> ServiceResult<Completion> {
    let started = std::time::Instant::now();
    let model_id = state.config.llm.default_model.as_str();
    let result = state.llm.complete(model_id, request).await;
    let elapsed = started.elapsed().as_millis() as i64;

    match &result {
        Ok(c) => {
            usage::log_quietly(
                &state.pool,
                &UsageRecord {
                    endpoint: ENDPOINT,
                    user_id,
                    provider: Some(c.provider.as_str()),
                    model_id: Some(&c.model),
                    prompt_tokens: c.input_tokens,
                    completion_tokens: c.output_tokens,
                    cost_usd: calculate_cost(&c.model, c.input_tokens, c.output_tokens),
                    response_time_ms: elapsed,
                    ..Default::default()
                },
            )
            .await
        }
        Err(e) => {
            usage::log_quietly(
                &state.pool,
                &UsageRecord {
                    endpoint: ENDPOINT,
                    user_id,
                    model_id: Some(model_id),
                    response_time_ms: elapsed,
                    status_code: 502,
                    error_message: Some(&e.to_string()),
                    ..Default::default()
                },
            )
            .await
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(page: Option<i64>, section: Option<&str>, text: &str) -> ScoredChunk {
        ScoredChunk {
            page_number: page,
            section: section.map(str::to_string),
            text: text.to_string(),
            score: 1.0,
        }
    }

    #[test]
    fn context_blocks_are_numbered() {
        let ctx = build_context(&[
            chunk(Some(3), Some("ERROR CODES"), " E1 means low water "),
            chunk(None, None, "Check the fuse."),
        ]);
        assert_eq!(
            ctx,
            "[Excerpt 1] Page 3, Section: ERROR CODES\nE1 means low water\n\n\
             [Excerpt 2] Page ?, Section: Unknown\nCheck the fuse."
        );
    }

    #[test]
    fn query_validation() {
        let q = |question: &str, top_k: Option<usize>| RagQuery {
            question: question.to_string(),
            equipment_model: "HL600".to_string(),
            brand: "Hobart".to_string(),
            top_k,
        };
        assert_eq!(q("Why no heat?", None).validate(5).unwrap(), 5);
        assert_eq!(q("Why no heat?", Some(2)).validate(5).unwrap(), 2);
        assert!(q("hi", None).validate(5).is_err());
        assert!(q("Why no heat?", Some(11)).validate(5).is_err());
        assert!(q("Why no heat?", Some(0)).validate(5).is_err());
    }
}
