//! Manual library: upload, listing, retrieval, deletion, and web search.
//!
//! A manual row is created in `pending` state as soon as its PDF is stored;
//! text extraction, chunking and embedding happen afterwards in
//! [`crate::indexing`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::db::{contains_pattern, format_ts_iso, now_ts};
use crate::error::{bad_request, not_found, ServiceError, ServiceResult};
use crate::indexing::spawn_indexing;
use crate::llm::{extract_json, model_spec, CompletionRequest};
use crate::state::AppState;
use crate::storage::{file_hash, is_pdf, sanitize_filename};
use crate::usage::{self, UsageRecord};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_INDEXING: &str = "indexing";
pub const STATUS_COMPLETE: &str = "complete";
pub const STATUS_FAILED: &str = "failed";

pub const SOURCE_UPLOAD: &str = "user_upload";
pub const SOURCE_WEB_SEARCH: &str = "web_search";

pub const MANUAL_TYPES: &[&str] = &["service", "parts", "installation", "user", "wiring"];

const MAX_FIELD_CHARS: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct Manual {
    pub id: String,
    pub filename: String,
    pub brand: String,
    pub model: String,
    pub equipment_type: Option<String>,
    pub manual_type: String,
    pub file_path: String,
    pub file_hash: String,
    pub file_size_bytes: i64,
    pub page_count: Option<i64>,
    pub source: String,
    pub source_url: Option<String>,
    pub indexing_status: String,
    pub indexing_error: Option<String>,
    pub indexed_at: Option<String>,
    pub times_accessed: i64,
    pub last_accessed: Option<String>,
    pub created_at: String,
}

/// A manual plus its AI-structured sections.
#[derive(Debug, Clone, Serialize)]
pub struct ManualDetail {
    #[serde(flatten)]
    pub manual: Manual,
    pub extracted_sections: Option<Value>,
    pub extracted_text_chars: i64,
}

const MANUAL_COLUMNS: &str = "id, filename, brand, model, equipment_type, manual_type, file_path, \
     file_hash, file_size_bytes, page_count, source, source_url, indexing_status, indexing_error, \
     indexed_at, times_accessed, last_accessed, created_at";

fn manual_from_row(row: &SqliteRow) -> Manual {
    Manual {
        id: row.get("id"),
        filename: row.get("filename"),
        brand: row.get("brand"),
        model: row.get("model"),
        equipment_type: row.get("equipment_type"),
        manual_type: row.get("manual_type"),
        file_path: row.get("file_path"),
        file_hash: row.get("file_hash"),
        file_size_bytes: row.get("file_size_bytes"),
        page_count: row.get("page_count"),
        source: row.get("source"),
        source_url: row.get("source_url"),
        indexing_status: row.get("indexing_status"),
        indexing_error: row.get("indexing_error"),
        indexed_at: row.get::<Option<i64>, _>("indexed_at").map(format_ts_iso),
        times_accessed: row.get("times_accessed"),
        last_accessed: row.get::<Option<i64>, _>("last_accessed").map(format_ts_iso),
        created_at: format_ts_iso(row.get("created_at")),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManualFilter {
    pub brand: Option<String>,
    pub model: Option<String>,
    pub equipment_type: Option<String>,
    pub status: Option<String>,
}

fn like_pattern(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(contains_pattern)
}

/// Manuals matching the filter, newest first.
pub async fn list(pool: &SqlitePool, filter: &ManualFilter) -> ServiceResult<Vec<Manual>> {
    let sql = format!(
        "SELECT {} FROM manuals
         WHERE (?1 IS NULL OR lower(brand) LIKE ?1 ESCAPE '\\')
           AND (?2 IS NULL OR lower(model) LIKE ?2 ESCAPE '\\')
           AND (?3 IS NULL OR lower(equipment_type) LIKE ?3 ESCAPE '\\')
           AND (?4 IS NULL OR indexing_status = ?4)
         ORDER BY created_at DESC, rowid DESC",
        MANUAL_COLUMNS
    );
    let status = filter.status.as_deref().map(str::trim).filter(|s| !s.is_empty());

    let rows = sqlx::query(&sql)
        .bind(like_pattern(&filter.brand))
        .bind(like_pattern(&filter.model))
        .bind(like_pattern(&filter.equipment_type))
        .bind(status)
        .fetch_all(pool)
        .await?;

    Ok(rows.iter().map(manual_from_row).collect())
}

pub async fn find(pool: &SqlitePool, manual_id: &str) -> ServiceResult<Manual> {
    let sql = format!("SELECT {} FROM manuals WHERE id = ?", MANUAL_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(manual_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| not_found("Manual not found"))?;
    Ok(manual_from_row(&row))
}

pub async fn record_access(pool: &SqlitePool, manual_id: &str) -> ServiceResult<()> {
    sqlx::query(
        "UPDATE manuals SET times_accessed = times_accessed + 1, last_accessed = ? WHERE id = ?",
    )
    .bind(now_ts())
    .bind(manual_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch a manual with its structured sections and count the access.
pub async fn get_detail(pool: &SqlitePool, manual_id: &str) -> ServiceResult<ManualDetail> {
    record_access(pool, manual_id).await?;
    let manual = find(pool, manual_id).await?;

    let row = sqlx::query(
        "SELECT extracted_sections, COALESCE(length(extracted_text), 0) AS text_chars
         FROM manuals WHERE id = ?",
    )
    .bind(manual_id)
    .fetch_one(pool)
    .await?;

    let sections: Option<String> = row.get("extracted_sections");
    let extracted_sections = match sections {
        Some(json) => Some(serde_json::from_str(&json)?),
        None => None,
    };

    Ok(ManualDetail {
        manual,
        extracted_sections,
        extracted_text_chars: row.get("text_chars"),
    })
}

/// Library manual for troubleshooting: brand and model match by substring,
/// indexed manuals preferred, newest first.
pub async fn find_library_manual(
    pool: &SqlitePool,
    manufacturer: &str,
    model: &str,
) -> ServiceResult<Option<Manual>> {
    let sql = format!(
        "SELECT {} FROM manuals
         WHERE lower(brand) LIKE ? ESCAPE '\\' AND lower(model) LIKE ? ESCAPE '\\'
         ORDER BY (indexing_status = 'complete') DESC, created_at DESC, rowid DESC
         LIMIT 1",
        MANUAL_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(contains_pattern(manufacturer.trim()))
        .bind(contains_pattern(model.trim()))
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(manual_from_row))
}

/// Newest fully indexed manual whose brand and model match exactly,
/// ignoring case and surrounding whitespace.
pub async fn find_indexed_manual(
    pool: &SqlitePool,
    brand: &str,
    model: &str,
) -> ServiceResult<Option<Manual>> {
    let sql = format!(
        "SELECT {} FROM manuals
         WHERE lower(trim(brand)) = ? AND lower(trim(model)) = ? AND indexing_status = ?
         ORDER BY created_at DESC, rowid DESC
         LIMIT 1",
        MANUAL_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(brand.trim().to_lowercase())
        .bind(model.trim().to_lowercase())
        .bind(STATUS_COMPLETE)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(manual_from_row))
}

/// Stored text of a manual, if extraction has run.
pub async fn extracted_text(pool: &SqlitePool, manual_id: &str) -> ServiceResult<Option<String>> {
    let text: Option<Option<String>> =
        sqlx::query_scalar("SELECT extracted_text FROM manuals WHERE id = ?")
            .bind(manual_id)
            .fetch_optional(pool)
            .await?;
    Ok(text.flatten())
}

/// Distinct manual brands, sorted case-insensitively.
pub async fn brands(pool: &SqlitePool) -> ServiceResult<Vec<String>> {
    let brands = sqlx::query_scalar(
        "SELECT DISTINCT brand FROM manuals ORDER BY lower(brand), brand",
    )
    .fetch_all(pool)
    .await?;
    Ok(brands)
}

// ============ Upload ============

/// A PDF about to enter the library.
#[derive(Debug, Clone)]
pub struct NewManual {
    pub filename: String,
    pub brand: String,
    pub model: String,
    pub equipment_type: Option<String>,
    pub manual_type: Option<String>,
    pub source: &'static str,
    pub source_url: Option<String>,
    pub bytes: Vec<u8>,
}

fn required_field(name: &str, value: &str) -> ServiceResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(bad_request(format!("{} is required", name)));
    }
    if value.chars().count() > MAX_FIELD_CHARS {
        return Err(bad_request(format!(
            "{} must be at most {} characters",
            name, MAX_FIELD_CHARS
        )));
    }
    Ok(value.to_string())
}

/// Validate, deduplicate, store the file, and insert a `pending` row.
pub async fn create(state: &AppState, upload: NewManual) -> ServiceResult<Manual> {
    if !upload.filename.to_lowercase().ends_with(".pdf") {
        return Err(bad_request("Only PDF files are allowed"));
    }
    let max_bytes = state.config.upload.max_bytes;
    if upload.bytes.len() > max_bytes {
        return Err(bad_request(format!(
            "File size exceeds {}MB limit",
            max_bytes / (1024 * 1024)
        )));
    }
    if !is_pdf(&upload.bytes) {
        return Err(bad_request("File is not a valid PDF"));
    }

    let brand = required_field("brand", &upload.brand)?;
    let model = required_field("model", &upload.model)?;
    let manual_type = upload
        .manual_type
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("service")
        .to_lowercase();
    if !MANUAL_TYPES.contains(&manual_type.as_str()) {
        return Err(bad_request(format!(
            "manual_type must be one of: {}",
            MANUAL_TYPES.join(", ")
        )));
    }
    let equipment_type = upload
        .equipment_type
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    let hash = file_hash(&upload.bytes);
    let duplicate: Option<String> = sqlx::query_scalar(
        "SELECT id FROM manuals
         WHERE file_hash = ? AND lower(brand) = lower(?) AND lower(model) = lower(?)
         LIMIT 1",
    )
    .bind(&hash)
    .bind(&brand)
    .bind(&model)
    .fetch_optional(&state.pool)
    .await?;
    if let Some(existing) = duplicate {
        return Err(ServiceError::Conflict(format!(
            "This manual has already been uploaded (id {})",
            existing
        )));
    }

    let id = Uuid::new_v4().to_string();
    let filename = sanitize_filename(&upload.filename);
    let path = state.store.save(&id, &filename, &upload.bytes).await?;
    let path_str = path.to_string_lossy().to_string();

    let inserted = sqlx::query(
        r#"
        INSERT INTO manuals (
            id, filename, brand, model, equipment_type, manual_type, file_path, file_hash,
            file_size_bytes, source, source_url, indexing_status, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&filename)
    .bind(&brand)
    .bind(&model)
    .bind(&equipment_type)
    .bind(&manual_type)
    .bind(&path_str)
    .bind(&hash)
    .bind(upload.bytes.len() as i64)
    .bind(upload.source)
    .bind(&upload.source_url)
    .bind(STATUS_PENDING)
    .bind(now_ts())
    .execute(&state.pool)
    .await;

    if let Err(e) = inserted {
        state.store.delete(&path).await?;
        return Err(e.into());
    }

    tracing::info!(manual_id = %id, %brand, %model, bytes = upload.bytes.len(), "manual stored");
    find(&state.pool, &id).await
}

/// Remove a manual, its chunks (by cascade), and its file.
pub async fn delete(state: &AppState, manual_id: &str) -> ServiceResult<()> {
    let manual = find(&state.pool, manual_id).await?;
    sqlx::query("DELETE FROM manuals WHERE id = ?")
        .bind(manual_id)
        .execute(&state.pool)
        .await?;

    // The row is gone either way; a stale file is only logged.
    if let Err(e) = state.store.delete(std::path::Path::new(&manual.file_path)).await {
        tracing::warn!(manual_id, error = %e, "failed to delete manual file");
    }
    tracing::info!(manual_id, "manual deleted");
    Ok(())
}

/// The stored PDF bytes of a manual.
pub async fn read_pdf(state: &AppState, manual_id: &str) -> ServiceResult<(Manual, Vec<u8>)> {
    let manual = find(&state.pool, manual_id).await?;
    let path = std::path::Path::new(&manual.file_path);
    if !state.store.exists(path).await {
        return Err(not_found("PDF file not found on server"));
    }
    let bytes = state.store.read(path).await?;
    record_access(&state.pool, manual_id).await?;
    Ok((manual, bytes))
}

// ============ Chunks ============

#[derive(Debug, Clone, Serialize)]
pub struct ChunkView {
    pub id: String,
    pub manual_id: String,
    pub chunk_index: i64,
    pub page_number: Option<i64>,
    pub section: Option<String>,
    pub chunk_text: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkPage {
    pub chunks: Vec<ChunkView>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

pub async fn list_chunks(
    pool: &SqlitePool,
    manual_id: &str,
    limit: i64,
    offset: i64,
) -> ServiceResult<ChunkPage> {
    find(pool, manual_id).await?;
    let limit = limit.clamp(1, 500);
    let offset = offset.max(0);

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM manual_chunks WHERE manual_id = ?")
        .bind(manual_id)
        .fetch_one(pool)
        .await?;

    let rows = sqlx::query(
        "SELECT id, manual_id, chunk_index, page_number, section, chunk_text, created_at
         FROM manual_chunks WHERE manual_id = ?
         ORDER BY page_number ASC, chunk_index ASC
         LIMIT ? OFFSET ?",
    )
    .bind(manual_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let chunks = rows
        .iter()
        .map(|row| ChunkView {
            id: row.get("id"),
            manual_id: row.get("manual_id"),
            chunk_index: row.get("chunk_index"),
            page_number: row.get("page_number"),
            section: row.get("section"),
            chunk_text: row.get("chunk_text"),
            created_at: format_ts_iso(row.get("created_at")),
        })
        .collect();

    Ok(ChunkPage {
        chunks,
        total,
        limit,
        offset,
    })
}

// ============ Web search ============

#[derive(Debug, Clone, Deserialize)]
pub struct ManualSearchRequest {
    pub manufacturer: String,
    pub model: String,
    #[serde(default = "default_manual_type")]
    pub manual_type: String,
    #[serde(default = "default_true")]
    pub auto_download: bool,
}

fn default_manual_type() -> String {
    "service".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ManualSearchOutcome {
    pub found: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub already_in_library: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_downloaded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_error: Option<String>,
    pub message: String,
}

fn web_search_prompt(manufacturer: &str, model: &str) -> String {
    format!(
        r#"Use web search to find a PDF service manual for: {m} {n}

Search query to use: "{m} {n} service manual PDF filetype:pdf"

When you find a result with a PDF link, return this JSON:
{{"found": true, "url": "the PDF URL", "source": "website name"}}

If no PDF manual found after searching:
{{"found": false}}"#,
        m = manufacturer,
        n = model
    )
}

/// Look for a manual online and, when asked, download it into the library.
pub async fn search_web(
    state: &AppState,
    req: &ManualSearchRequest,
    user_id: Option<i64>,
) -> ServiceResult<ManualSearchOutcome> {
    let manufacturer = required_field("manufacturer", &req.manufacturer)?;
    let model = required_field("model", &req.model)?;

    if let Some(existing) = find_library_manual(&state.pool, &manufacturer, &model).await? {
        return Ok(ManualSearchOutcome {
            found: true,
            already_in_library: true,
            manual_id: Some(existing.id),
            message: "Manual already exists in library".to_string(),
            ..Default::default()
        });
    }

    let started = std::time::Instant::now();
    let mut request = CompletionRequest::new(
        "You locate publicly available equipment service manuals.",
        web_search_prompt(&manufacturer, &model),
    );
    request.max_tokens = 2048;
    request.web_search = true;

    let model_id = state.config.llm.default_model.as_str();
    let completion = match state.llm.complete(model_id, &request).await {
        Ok(c) => c,
        Err(e) => {
            usage::log_quietly(
                &state.pool,
                &UsageRecord {
                    endpoint: "/manuals/search",
                    user_id,
                    provider: Some(model_spec(model_id).provider.as_str()),
                    model_id: Some(model_id),
                    response_time_ms: started.elapsed().as_millis() as i64,
                    status_code: 502,
                    error_message: Some(&e.to_string()),
                    ..Default::default()
                },
            )
            .await;
            return Err(e);
        }
    };

    usage::log_quietly(
        &state.pool,
        &UsageRecord {
            endpoint: "/manuals/search",
            user_id,
            provider: Some(completion.provider.as_str()),
            model_id: Some(&completion.model),
            prompt_tokens: completion.input_tokens,
            completion_tokens: completion.output_tokens,
            cost_usd: crate::llm::calculate_cost(
                &completion.model,
                completion.input_tokens,
                completion.output_tokens,
            ),
            response_time_ms: started.elapsed().as_millis() as i64,
            ..Default::default()
        },
    )
    .await;

    let reply = match extract_json(&completion.text) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable web search reply");
            return Ok(ManualSearchOutcome {
                message: "Could not parse search response".to_string(),
                ..Default::default()
            });
        }
    };

    let url = reply
        .get("url")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|u| u.starts_with("http"))
        .map(str::to_string);
    let source = reply.get("source").and_then(Value::as_str).map(str::to_string);

    let found = reply.get("found").and_then(Value::as_bool).unwrap_or(false);
    let Some(url) = url.filter(|_| found) else {
        return Ok(ManualSearchOutcome {
            message: format!("No public manual found for {} {}", manufacturer, model),
            ..Default::default()
        });
    };

    if !req.auto_download {
        return Ok(ManualSearchOutcome {
            found: true,
            auto_downloaded: Some(false),
            source,
            url: Some(url),
            message: "Manual found online. Set auto_download=true to save automatically."
                .to_string(),
            ..Default::default()
        });
    }

    let stored = match download_pdf(&state.http, &url, state.config.upload.max_bytes).await {
        Ok(bytes) => {
            let filename = format!("{}_{}_{}.pdf", manufacturer, model, req.manual_type);
            create(
                state,
                NewManual {
                    filename,
                    brand: manufacturer.clone(),
                    model: model.clone(),
                    equipment_type: None,
                    manual_type: Some(req.manual_type.clone()),
                    source: SOURCE_WEB_SEARCH,
                    source_url: Some(url.clone()),
                    bytes,
                },
            )
            .await
            .map_err(|e| e.to_string())
        }
        Err(e) => Err(e),
    };

    match stored {
        Ok(manual) => {
            spawn_indexing(state.clone(), manual.id.clone());
            Ok(ManualSearchOutcome {
                found: true,
                auto_downloaded: Some(true),
                manual_id: Some(manual.id),
                source,
                url: Some(url),
                message: "Manual found and saved to library. Indexing started.".to_string(),
                ..Default::default()
            })
        }
        Err(download_error) => Ok(ManualSearchOutcome {
            found: true,
            auto_downloaded: Some(false),
            source,
            url: Some(url),
            download_error: Some(download_error),
            message: "Manual found but auto-download failed. Use the URL to download manually."
                .to_string(),
            ..Default::default()
        }),
    }
}

/// Fetch a PDF, rejecting non-PDF bodies. The body is streamed and the
/// download aborted as soon as it exceeds `max_bytes`.
async fn download_pdf(http: &reqwest::Client, url: &str, max_bytes: usize) -> Result<Vec<u8>, String> {
    let too_large = || format!("Downloaded file exceeds the {} byte upload limit", max_bytes);

    let mut response = http
        .get(url)
        .header("Accept", "application/pdf,*/*")
        .send()
        .await
        .map_err(|e| format!("Request failed: {}", e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(format!("HTTP error {}", status.as_u16()));
    }
    if response
        .content_length()
        .is_some_and(|len| len > max_bytes as u64)
    {
        return Err(too_large());
    }

    let mut bytes = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| format!("Download failed: {}", e))?
    {
        if bytes.len() + chunk.len() > max_bytes {
            return Err(too_large());
        }
        bytes.extend_from_slice(&chunk);
    }

    if !is_pdf(&bytes) {
        return Err("Downloaded file is not a valid PDF".to_string());
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const LIMIT: usize = 1024;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn pdf_body(len: usize) -> Vec<u8> {
        let mut body = b"%PDF-1.4\n".to_vec();
        body.resize(len, b'x');
        body
    }

    #[tokio::test]
    async fn download_accepts_pdf_within_limit() {
        let base = serve(Router::new().route("/ok.pdf", get(|| async { pdf_body(512) }))).await;
        let bytes = download_pdf(&reqwest::Client::new(), &format!("{}/ok.pdf", base), LIMIT)
            .await
            .unwrap();
        assert_eq!(bytes.len(), 512);
    }

    #[tokio::test]
    async fn download_rejects_declared_oversize() {
        let base = serve(
            Router::new()
                .route("/big.pdf", get(|| async { pdf_body(LIMIT * 8) }))
                .route("/page.html", get(|| async { "<html>not a manual</html>" })),
        )
        .await;
        let client = reqwest::Client::new();

        let err = download_pdf(&client, &format!("{}/big.pdf", base), LIMIT)
            .await
            .unwrap_err();
        assert!(err.contains("upload limit"), "{}", err);

        let err = download_pdf(&client, &format!("{}/page.html", base), LIMIT)
            .await
            .unwrap_err();
        assert!(err.contains("not a valid PDF"), "{}", err);

        let err = download_pdf(&client, &format!("{}/missing.pdf", base), LIMIT)
            .await
            .unwrap_err();
        assert_eq!(err, "HTTP error 404");
    }

    #[tokio::test]
    async fn download_stops_undeclared_oversize() {
        // no Content-Length: the body runs until the connection closes
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/pdf\r\nConnection: close\r\n\r\n")
                .await;
            for _ in 0..64 {
                if socket.write_all(&pdf_body(LIMIT)).await.is_err() {
                    break;
                }
            }
        });

        let err = download_pdf(&reqwest::Client::new(), &format!("http://{}/stream.pdf", addr), LIMIT)
            .await
            .unwrap_err();
        assert!(err.contains("upload limit"), "{}", err);
    }
}
