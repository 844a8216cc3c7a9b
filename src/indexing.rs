//! Manual indexing pipeline.
//!
//! ```text
//! read PDF → extract pages → analyze (sections, scan check) → chunk
//!          → embed (batched) → replace chunks in one transaction → complete
//! ```
//!
//! Status moves `pending → indexing → complete | failed`. Failures are
//! persisted on the manual row (message truncated to 2000 characters) so
//! background jobs never need to propagate them.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

use crate::chunk::{chunk_pages, ManualChunk};
use crate::db::now_ts;
use crate::embedding::{embed_batched, vec_to_blob};
use crate::extract::{analyze_pages, extract_pages, render_document_text, ManualPage};
use crate::llm::{calculate_cost, extract_json, model_spec, CompletionRequest};
use crate::manuals::{self, Manual, STATUS_COMPLETE, STATUS_FAILED, STATUS_INDEXING};
use crate::state::AppState;
use crate::usage::{self, UsageRecord};

const MAX_ERROR_CHARS: usize = 2000;

#[derive(Debug, Clone, Serialize)]
pub struct IndexOutcome {
    pub manual_id: String,
    pub pages: usize,
    pub chunks: usize,
}

/// Index a stored manual from its PDF file.
pub async fn index_manual(state: &AppState, manual_id: &str) -> Result<IndexOutcome> {
    let manual = manuals::find(&state.pool, manual_id).await?;
    set_status(state, manual_id, STATUS_INDEXING).await?;

    let result = async {
        let bytes = state.store.read(Path::new(&manual.file_path)).await?;
        let raw = tokio::task::spawn_blocking(move || extract_pages(&bytes))
            .await
            .context("PDF extraction task failed")??;
        process(state, &manual, raw).await
    }
    .await;

    finish(state, manual_id, result).await
}

/// Index a manual from already-extracted page text.
pub async fn index_pages(
    state: &AppState,
    manual_id: &str,
    raw_pages: Vec<String>,
) -> Result<IndexOutcome> {
    let manual = manuals::find(&state.pool, manual_id).await?;
    set_status(state, manual_id, STATUS_INDEXING).await?;
    let result = process(state, &manual, raw_pages).await;
    finish(state, manual_id, result).await
}

/// Run [`index_manual`] on a background task. The outcome is only logged;
/// failures are already recorded on the manual.
pub fn spawn_indexing(state: AppState, manual_id: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match index_manual(&state, &manual_id).await {
            Ok(outcome) => tracing::info!(
                manual_id = %outcome.manual_id,
                pages = outcome.pages,
                chunks = outcome.chunks,
                "manual indexed"
            ),
            Err(e) => tracing::warn!(manual_id = %manual_id, error = %format!("{:#}", e), "manual indexing failed"),
        }
    })
}

async fn process(state: &AppState, manual: &Manual, raw_pages: Vec<String>) -> Result<IndexOutcome> {
    let pages = analyze_pages(raw_pages)?;
    let chunking = &state.config.chunking;
    let chunks = chunk_pages(&pages, chunking.target_tokens, chunking.overlap_tokens);
    if chunks.is_empty() {
        bail!("No text chunks were generated from this PDF");
    }
    tracing::debug!(manual_id = %manual.id, pages = pages.len(), chunks = chunks.len(), "chunked manual");

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = embed_batched(
        state.embedder.as_ref(),
        &texts,
        state.config.embedding.batch_size,
    )
    .await
    .context("Embedding failed")?;

    let document_text = render_document_text(&pages);
    let sections = if state.config.llm.structure_sections {
        structure_sections(state, manual, &document_text).await
    } else {
        None
    };

    replace_chunks(state, manual, &pages, &document_text, &chunks, &vectors, sections).await?;

    Ok(IndexOutcome {
        manual_id: manual.id.clone(),
        pages: pages.len(),
        chunks: chunks.len(),
    })
}

/// Swap the manual's chunks and mark it complete atomically.
async fn replace_chunks(
    state: &AppState,
    manual: &Manual,
    pages: &[ManualPage],
    document_text: &str,
    chunks: &[ManualChunk],
    vectors: &[Vec<f32>],
    sections: Option<Value>,
) -> Result<()> {
    let now = now_ts();
    let model = state.embedder.model_name().to_string();
    let mut tx = state.pool.begin().await?;

    sqlx::query("DELETE FROM manual_chunks WHERE manual_id = ?")
        .bind(&manual.id)
        .execute(&mut *tx)
        .await?;

    for (chunk, vector) in chunks.iter().zip(vectors) {
        sqlx::query(
            r#"
            INSERT INTO manual_chunks (
                id, manual_id, chunk_index, page_number, section, chunk_text, text_hash,
                embedding, embedding_model, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&manual.id)
        .bind(chunk.chunk_index)
        .bind(chunk.page_number)
        .bind(&chunk.section)
        .bind(&chunk.text)
        .bind(&chunk.text_hash)
        .bind(vec_to_blob(vector))
        .bind(&model)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    let sections_json = sections.map(|s| s.to_string());
    sqlx::query(
        r#"
        UPDATE manuals
        SET page_count = ?, extracted_text = ?,
            extracted_sections = COALESCE(?, extracted_sections),
            indexing_status = ?, indexing_error = NULL, indexed_at = ?
        WHERE id = ?
        "#,
    )
    .bind(pages.len() as i64)
    .bind(document_text)
    .bind(sections_json)
    .bind(STATUS_COMPLETE)
    .bind(now)
    .bind(&manual.id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

async fn set_status(state: &AppState, manual_id: &str, status: &str) -> Result<()> {
    sqlx::query("UPDATE manuals SET indexing_status = ? WHERE id = ?")
        .bind(status)
        .bind(manual_id)
        .execute(&state.pool)
        .await?;
    Ok(())
}

async fn finish(
    state: &AppState,
    manual_id: &str,
    result: Result<IndexOutcome>,
) -> Result<IndexOutcome> {
    let err = match result {
        Ok(outcome) => return Ok(outcome),
        Err(e) => e,
    };

    let message: String = format!("{:#}", err).chars().take(MAX_ERROR_CHARS).collect();
    sqlx::query(
        "UPDATE manuals SET indexing_status = ?, indexing_error = ?, indexed_at = NULL WHERE id = ?",
    )
    .bind(STATUS_FAILED)
    .bind(&message)
    .bind(manual_id)
    .execute(&state.pool)
    .await?;

    Err(err)
}

/// Usage log endpoint for section structuring, which runs inside upload and reindex.
const STRUCTURE_ENDPOINT: &str = "/manuals/index";

/// Ask the language model for a structured outline of the manual. Failures
/// are logged and leave the sections empty.
async fn structure_sections(state: &AppState, manual: &Manual, document_text: &str) -> Option<Value> {
    let sample: String = document_text.chars().take(state.config.llm.max_manual_chars).collect();
    let system = format!(
        "You are a technical documentation analyst for commercial equipment service manuals.\n\nSERVICE MANUAL CONTENT:\n{}",
        sample
    );
    let prompt = format!(
        r#"Analyze this service manual for {} {}.

Return a JSON object with these sections when present:
{{
  "overview": {{"text": "summary", "page_range": [start, end]}},
  "specifications": {{"text": "specs", "data": {{}}}},
  "error_codes": {{"text": "error definitions", "page_range": [start, end], "codes": {{"F1": "description"}}}},
  "troubleshooting": {{"text": "procedures", "page_range": [start, end], "procedures": []}},
  "wiring_diagrams": {{"text": "wiring info", "page_range": [start, end]}},
  "parts_list": {{"text": "parts", "categories": []}}
}}"#,
        manual.brand, manual.model
    );

    let model_id = state.config.llm.default_model.as_str();
    let started = std::time::Instant::now();
    let completion = match state
        .llm
        .complete(model_id, &CompletionRequest::new(system, prompt))
        .await
    {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(manual_id = %manual.id, error = %e, "section structuring failed");
            usage::log_quietly(
                &state.pool,
                &UsageRecord {
                    endpoint: STRUCTURE_ENDPOINT,
                    provider: Some(model_spec(model_id).provider.as_str()),
                    model_id: Some(model_id),
                    response_time_ms: started.elapsed().as_millis() as i64,
                    status_code: 502,
                    error_message: Some(&e.to_string()),
                    ..Default::default()
                },
            )
            .await;
            return None;
        }
    };

    usage::log_quietly(
        &state.pool,
        &UsageRecord {
            endpoint: STRUCTURE_ENDPOINT,
            provider: Some(completion.provider.as_str()),
            model_id: Some(&completion.model),
            prompt_tokens: completion.input_tokens,
            completion_tokens: completion.output_tokens,
            cost_usd: calculate_cost(
                &completion.model,
                completion.input_tokens,
                completion.output_tokens,
            ),
            response_time_ms: started.elapsed().as_millis() as i64,
            ..Default::default()
        },
    )
    .await;

    match extract_json(&completion.text) {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(manual_id = %manual.id, error = %e, "section structuring reply was not JSON");
            None
        }
    }
}
