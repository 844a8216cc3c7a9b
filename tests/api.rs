//! HTTP API tests against the full router, with deterministic embedding and
//! language model backends.

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;

use tech_copilot::auth::{self, RegisterRequest, TokenKeys, ROLE_ADMIN, ROLE_TECHNICIAN};
use tech_copilot::config::Config;
use tech_copilot::db;
use tech_copilot::embedding::Embedder;
use tech_copilot::indexing;
use tech_copilot::llm::{Completion, CompletionRequest, LanguageModel, LlmGateway, Provider};
use tech_copilot::manuals::{self, NewManual, SOURCE_UPLOAD};
use tech_copilot::migrate::migrate_pool;
use tech_copilot::server::build_router;
use tech_copilot::state::AppState;

const TROUBLESHOOT_REPLY: &str = r#"Here you go:
```json
{"error_definition": "Low water in boiler", "severity": "medium", "troubleshooting_steps": []}
```"#;

/// Scores texts by a bias term plus keyword counts.
struct KeywordEmbedder;

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword-test"
    }
    fn dims(&self) -> usize {
        3
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let lower = t.to_lowercase();
                vec![
                    0.1,
                    lower.matches("water").count() as f32,
                    lower.matches("heat").count() as f32,
                ]
            })
            .collect())
    }
}

/// Anthropic stand-in that replies with a fixed text and records prompts.
struct ScriptedModel {
    reply: String,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }
    async fn complete(&self, _upstream_model: &str, request: &CompletionRequest) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.clone());
        Ok(Completion {
            text: self.reply.clone(),
            input_tokens: 1200,
            output_tokens: 300,
            model: String::new(),
            provider: Provider::Anthropic,
        })
    }
}

struct TestApp {
    _tmp: TempDir,
    state: AppState,
    app: Router,
    model: Arc<ScriptedModel>,
    admin_token: String,
    tech_token: String,
}

async fn setup_with(llm_configured: bool) -> TestApp {
    setup_configured(llm_configured, |_| {}).await
}

async fn setup_configured(llm_configured: bool, adjust: impl FnOnce(&mut Config)) -> TestApp {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::for_data_dir(tmp.path());
    adjust(&mut config);
    let pool = db::connect(&config).await.unwrap();
    migrate_pool(&pool).await.unwrap();

    let keys = TokenKeys::new(b"api-test-secret-0123456789", 60);
    let model = Arc::new(ScriptedModel {
        reply: TROUBLESHOOT_REPLY.to_string(),
        calls: AtomicUsize::new(0),
        prompts: Mutex::new(Vec::new()),
    });
    let llm = if llm_configured {
        LlmGateway::new().with_client(model.clone())
    } else {
        LlmGateway::new()
    };
    let state = AppState::new(config, pool, keys, Arc::new(KeywordEmbedder), llm).unwrap();

    let admin = auth::create_user(
        &state.pool,
        &RegisterRequest {
            username: "admin".to_string(),
            email: "admin@example.com".to_string(),
            password: "admin-password".to_string(),
            full_name: None,
        },
        ROLE_ADMIN,
    )
    .await
    .unwrap();
    let tech = auth::create_user(
        &state.pool,
        &RegisterRequest {
            username: "tech1".to_string(),
            email: "tech1@example.com".to_string(),
            password: "tech-password".to_string(),
            full_name: Some("Field Tech".to_string()),
        },
        ROLE_TECHNICIAN,
    )
    .await
    .unwrap();

    TestApp {
        admin_token: state.keys.issue(&admin).unwrap(),
        tech_token: state.keys.issue(&tech).unwrap(),
        app: build_router(state.clone()),
        state,
        model,
        _tmp: tmp,
    }
}

async fn setup() -> TestApp {
    setup_with(true).await
}

async fn read_body(response: axum::response::Response) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = read_body(response).await;
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

/// Store a fake PDF for Hobart HL600 and index three pages of text.
async fn indexed_manual(t: &TestApp) -> String {
    let manual = manuals::create(
        &t.state,
        NewManual {
            filename: "hl600-service.pdf".to_string(),
            brand: "Hobart".to_string(),
            model: "HL600".to_string(),
            equipment_type: Some("mixer".to_string()),
            manual_type: None,
            source: SOURCE_UPLOAD,
            source_url: None,
            bytes: b"%PDF-1.4 test manual".to_vec(),
        },
    )
    .await
    .unwrap();

    let pages = vec![
        "ERROR CODES\nE1 indicates low water level in the boiler. Check the water supply valve, \
         the fill solenoid and the water level sensor for scale."
            .to_string(),
        "HEATING SYSTEM\nIf the unit does not heat, check the high limit thermostat, the contactor \
         and the heating element for continuity."
            .to_string(),
        "MAINTENANCE\nDelime the boiler every three months. Inspect door gaskets for wear and \
         replace them when torn or cracked."
            .to_string(),
    ];
    let outcome = indexing::index_pages(&t.state, &manual.id, pages).await.unwrap();
    assert_eq!(outcome.pages, 3);
    assert_eq!(outcome.chunks, 3);
    manual.id
}

fn multipart_upload(fields: &[(&str, &str)], file: &[u8]) -> (String, Vec<u8>) {
    let boundary = "copilot-test-boundary";
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                boundary, name, value
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"manual.pdf\"\r\n\
             Content-Type: application/pdf\r\n\r\n",
            boundary
        )
        .as_bytes(),
    );
    body.extend_from_slice(file);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    (format!("multipart/form-data; boundary={}", boundary), body)
}

// ============ System and auth ============

#[tokio::test]
async fn health_is_public() {
    let t = setup().await;
    let (status, body) = send(&t.app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let t = setup().await;
    let (status, body) = send(&t.app, "GET", "/stats", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "unauthorized");

    let (status, _) = send(&t.app, "GET", "/auth/me", Some("not-a-token"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn register_login_me() {
    let t = setup().await;
    let (status, body) = send(
        &t.app,
        "POST",
        "/auth/register",
        None,
        Some(json!({"username": "newtech", "email": "new@example.com", "password": "longenough"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["role"], "technician");

    let (status, body) = send(
        &t.app,
        "POST",
        "/auth/register",
        None,
        Some(json!({"username": "newtech", "email": "other@example.com", "password": "longenough"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");

    let (status, body) = send(
        &t.app,
        "POST",
        "/auth/login",
        None,
        Some(json!({"username": "newtech", "password": "wrong-password"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["message"], "Incorrect username or password");

    let (status, body) = send(
        &t.app,
        "POST",
        "/auth/login",
        None,
        Some(json!({"username": "newtech", "password": "longenough"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["token_type"], "bearer");
    let token = body["data"]["access_token"].as_str().unwrap().to_string();

    let (status, body) = send(&t.app, "GET", "/auth/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["username"], "newtech");
}

#[tokio::test]
async fn malformed_json_uses_error_envelope() {
    let t = setup().await;
    let (status, body) = send(
        &t.app,
        "POST",
        "/troubleshoot",
        Some(&t.tech_token),
        Some(json!({"error_code": "E1"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

// ============ Manuals ============

#[tokio::test]
async fn upload_requires_admin() {
    let t = setup().await;
    let (content_type, body) =
        multipart_upload(&[("brand", "Vulcan"), ("model", "VC4")], b"%PDF-1.4 tiny");

    let request = |token: &str| {
        Request::builder()
            .method("POST")
            .uri("/manuals/upload")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(header::CONTENT_TYPE, content_type.clone())
            .body(Body::from(body.clone()))
            .unwrap()
    };

    let response = t.app.clone().oneshot(request(&t.tech_token)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = t.app.clone().oneshot(request(&t.admin_token)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = serde_json::from_slice(&read_body(response).await).unwrap();
    assert_eq!(body["data"]["manual"]["brand"], "Vulcan");
    assert_eq!(body["data"]["manual"]["source"], "user_upload");
}

#[tokio::test]
async fn upload_rejects_non_pdf_bytes() {
    let t = setup().await;
    let (content_type, body) =
        multipart_upload(&[("brand", "Vulcan"), ("model", "VC4")], b"GIF89a not a pdf");
    let request = Request::builder()
        .method("POST")
        .uri("/manuals/upload")
        .header(header::AUTHORIZATION, format!("Bearer {}", t.admin_token))
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap();

    let response = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn manual_listing_detail_chunks_and_pdf() {
    let t = setup().await;
    let id = indexed_manual(&t).await;

    let (status, body) = send(&t.app, "GET", "/manuals?brand=hob", Some(&t.tech_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 1);
    assert_eq!(body["data"]["manuals"][0]["indexing_status"], "complete");

    let (status, body) = send(&t.app, "GET", &format!("/manuals/{}", id), Some(&t.tech_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["page_count"], 3);

    let (status, body) = send(
        &t.app,
        "GET",
        &format!("/manuals/{}/chunks?limit=2", id),
        Some(&t.tech_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 3);
    assert_eq!(body["data"]["chunks"].as_array().unwrap().len(), 2);
    assert_eq!(body["data"]["chunks"][0]["section"], "ERROR CODES");

    let request = Request::builder()
        .uri(format!("/manuals/{}/pdf", id))
        .body(Body::empty())
        .unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
    let disposition = response.headers()[header::CONTENT_DISPOSITION].to_str().unwrap().to_string();
    assert!(disposition.contains("Hobart_HL600_service.pdf"), "{}", disposition);
    assert!(read_body(response).await.starts_with(b"%PDF-"));

    let (status, _) = send(&t.app, "GET", "/manuals/missing-id", Some(&t.tech_token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send(&t.app, "GET", "/manuals?brand=_", Some(&t.tech_token), None).await;
    assert_eq!(body["data"]["total"], 0);
}

#[tokio::test]
async fn delete_manual_is_admin_only() {
    let t = setup().await;
    let id = indexed_manual(&t).await;
    let uri = format!("/manuals/{}", id);

    let (status, _) = send(&t.app, "DELETE", &uri, Some(&t.tech_token), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&t.app, "DELETE", &uri, Some(&t.admin_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Manual deleted successfully");

    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM manual_chunks")
        .fetch_one(&t.state.pool)
        .await
        .unwrap();
    assert_eq!(chunks, 0);
}

#[tokio::test]
async fn manual_search_returns_library_copy() {
    let t = setup().await;
    let id = indexed_manual(&t).await;

    let (status, body) = send(
        &t.app,
        "POST",
        "/manuals/search",
        Some(&t.tech_token),
        Some(json!({"manufacturer": "hobart", "model": "hl600"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["found"], true);
    assert_eq!(body["data"]["already_in_library"], true);
    assert_eq!(body["data"]["manual_id"], id.as_str());
    assert_eq!(t.model.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn manual_search_uses_configured_default_model() {
    let t = setup_configured(true, |c| c.llm.default_model = "claude-haiku-4-5".to_string()).await;

    let (status, body) = send(
        &t.app,
        "POST",
        "/manuals/search",
        Some(&t.tech_token),
        Some(json!({"manufacturer": "Vulcan", "model": "VC4"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["found"], false);

    let model: String = sqlx::query_scalar(
        "SELECT model_used FROM api_usage_logs WHERE endpoint = '/manuals/search'",
    )
    .fetch_one(&t.state.pool)
    .await
    .unwrap();
    assert_eq!(model, "claude-haiku-4-5");
}

#[tokio::test]
async fn section_structuring_is_logged_as_usage() {
    let t = setup_configured(true, |c| c.llm.structure_sections = true).await;
    let manual_id = indexed_manual(&t).await;
    assert_eq!(t.model.calls.load(Ordering::SeqCst), 1);

    let sections: Option<String> =
        sqlx::query_scalar("SELECT extracted_sections FROM manuals WHERE id = ?")
            .bind(&manual_id)
            .fetch_one(&t.state.pool)
            .await
            .unwrap();
    assert!(sections.unwrap().contains("Low water in boiler"));

    let (model, prompt_tokens, cost): (String, i64, f64) = sqlx::query_as(
        "SELECT model_used, prompt_tokens, cost_usd FROM api_usage_logs WHERE endpoint = '/manuals/index'",
    )
    .fetch_one(&t.state.pool)
    .await
    .unwrap();
    assert_eq!(model, "claude-sonnet-4-5");
    assert_eq!(prompt_tokens, 1200);
    assert!(cost > 0.0);
}

// ============ RAG ============

#[tokio::test]
async fn rag_without_manual_falls_back() {
    let t = setup().await;
    let (status, body) = send(
        &t.app,
        "POST",
        "/query/rag",
        Some(&t.tech_token),
        Some(json!({"question": "Why is there no heat?", "equipment_model": "X1", "brand": "Acme"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["manual_available"], false);
    assert!(body["data"]["manual_used"].is_null());
    assert!(body["data"]["answer"]
        .as_str()
        .unwrap()
        .ends_with("No indexed manual was found for this model."));
    assert!(body["data"]["sources"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn rag_uses_most_similar_excerpts() {
    let t = setup().await;
    let id = indexed_manual(&t).await;

    let (status, body) = send(
        &t.app,
        "POST",
        "/query/rag",
        Some(&t.tech_token),
        Some(json!({
            "question": "What does low water mean?",
            "equipment_model": " hl600 ",
            "brand": "HOBART",
            "top_k": 2
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    let data = &body["data"];
    assert_eq!(data["manual_available"], true);
    assert_eq!(data["manual_used"]["id"], id.as_str());

    let sources = data["sources"].as_array().unwrap();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0]["page"], 1);
    assert_eq!(sources[0]["section"], "ERROR CODES");
    assert!(sources[0]["excerpt"].as_str().unwrap().chars().count() <= 320);

    let prompts = t.model.prompts.lock().unwrap();
    let prompt = prompts.last().unwrap();
    assert!(prompt.contains("[Excerpt 1] Page 1, Section: ERROR CODES"));
    assert!(prompt.contains("Question: What does low water mean?"));

    let logged: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM api_usage_logs WHERE endpoint = '/query/rag'")
            .fetch_one(&t.state.pool)
            .await
            .unwrap();
    assert_eq!(logged, 1);
}

#[tokio::test]
async fn rag_rejects_short_question() {
    let t = setup().await;
    let (status, _) = send(
        &t.app,
        "POST",
        "/query/rag",
        Some(&t.tech_token),
        Some(json!({"question": "hm", "equipment_model": "X1", "brand": "Acme"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============ Troubleshooting ============

#[tokio::test]
async fn troubleshoot_caches_per_model() {
    let t = setup().await;
    let request = json!({
        "equipment": {"manufacturer": "Hobart", "model": "HL600"},
        "error_code": "E1"
    });

    let (status, body) = send(&t.app, "POST", "/troubleshoot", Some(&t.tech_token), Some(request.clone())).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    let first = &body["data"];
    assert_eq!(first["cache_hit"], false);
    assert_eq!(first["auto_selected"], true);
    assert_eq!(first["model_id"], "claude-haiku-4-5");
    assert_eq!(first["troubleshooting"]["severity"], "medium");
    assert_eq!(first["manual_available"], false);
    assert!(first["cost_usd"].as_f64().unwrap() > 0.0);
    let cache_id = first["cache_id"].as_i64().unwrap();

    // same question, different spelling
    let again = json!({
        "equipment": {"manufacturer": " hobart", "model": "hl600 "},
        "error_code": "e1"
    });
    let (status, body) = send(&t.app, "POST", "/troubleshoot", Some(&t.tech_token), Some(again)).await;
    assert_eq!(status, StatusCode::OK);
    let second = &body["data"];
    assert_eq!(second["cache_hit"], true);
    assert_eq!(second["cache_id"], cache_id);
    assert_eq!(second["times_served"], 1);
    assert_eq!(second["troubleshooting"]["error_definition"], "Low water in boiler");
    assert_eq!(t.model.calls.load(Ordering::SeqCst), 1);

    // an explicit model is a separate cache entry
    let explicit = json!({
        "equipment": {"manufacturer": "Hobart", "model": "HL600"},
        "error_code": "E1",
        "model_id": "claude-sonnet-4-5"
    });
    let (_, body) = send(&t.app, "POST", "/troubleshoot", Some(&t.tech_token), Some(explicit)).await;
    assert_eq!(body["data"]["cache_hit"], false);
    assert_eq!(body["data"]["auto_selected"], false);
    assert_eq!(t.model.calls.load(Ordering::SeqCst), 2);

    let (status, body) = send(
        &t.app,
        "POST",
        "/troubleshoot/feedback",
        Some(&t.tech_token),
        Some(json!({"cache_id": cache_id, "helpful": true, "notes": "worked"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Feedback submitted successfully");

    let (status, _) = send(
        &t.app,
        "POST",
        "/troubleshoot/feedback",
        Some(&t.tech_token),
        Some(json!({"cache_id": 9999, "helpful": false})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&t.app, "GET", "/usage/all?days=7", Some(&t.tech_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["summary"]["total_requests"], 3);
    assert_eq!(body["data"]["summary"]["cache_hits"], 1);
    assert_eq!(body["data"]["by_model"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn troubleshoot_keys_by_answering_model() {
    let t = setup().await;
    let ask = |model_id: &str| {
        json!({
            "equipment": {"manufacturer": "Hobart", "model": "HL600"},
            "error_code": "E1",
            "model_id": model_id
        })
    };

    // only Anthropic is configured, so the gateway answers with its default
    let (status, body) = send(&t.app, "POST", "/troubleshoot", Some(&t.tech_token), Some(ask("gpt-4o"))).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["cache_hit"], false);
    assert_eq!(body["data"]["model_id"], "claude-sonnet-4-5");
    let cache_id = body["data"]["cache_id"].as_i64().unwrap();

    for model_id in ["claude-sonnet-4-5", "gpt-4o"] {
        let (_, body) = send(&t.app, "POST", "/troubleshoot", Some(&t.tech_token), Some(ask(model_id))).await;
        assert_eq!(body["data"]["cache_hit"], true, "{}", model_id);
        assert_eq!(body["data"]["cache_id"], cache_id);
        assert_eq!(body["data"]["model_id"], "claude-sonnet-4-5");
    }
    assert_eq!(t.model.calls.load(Ordering::SeqCst), 1);

    let logged: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT model_used FROM api_usage_logs WHERE endpoint = '/troubleshoot'",
    )
    .fetch_all(&t.state.pool)
    .await
    .unwrap();
    assert_eq!(logged, ["claude-sonnet-4-5"]);
}

#[tokio::test]
async fn troubleshoot_uses_manual_text() {
    let t = setup().await;
    let id = indexed_manual(&t).await;

    let (status, body) = send(
        &t.app,
        "POST",
        "/troubleshoot",
        Some(&t.tech_token),
        Some(json!({
            "equipment": {"manufacturer": "Hobart", "model": "HL600"},
            "symptom": "unit will not heat"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["manual_available"], true);
    assert_eq!(body["data"]["manual_id"], id.as_str());

    let prompts = t.model.prompts.lock().unwrap();
    assert!(prompts.last().unwrap().contains("--- Page 2 ---"));
}

#[tokio::test]
async fn troubleshoot_needs_code_or_symptom() {
    let t = setup().await;
    let (status, body) = send(
        &t.app,
        "POST",
        "/troubleshoot",
        Some(&t.tech_token),
        Some(json!({"equipment": {"manufacturer": "Hobart", "model": "HL600"}, "symptom": "  "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn troubleshoot_upstream_failure_is_logged_not_cached() {
    let t = setup_with(false).await;
    let (status, body) = send(
        &t.app,
        "POST",
        "/troubleshoot",
        Some(&t.tech_token),
        Some(json!({"equipment": {"manufacturer": "Hobart", "model": "HL600"}, "error_code": "E1"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "upstream_error");

    let failures: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM api_usage_logs WHERE status_code = 502")
            .fetch_one(&t.state.pool)
            .await
            .unwrap();
    assert_eq!(failures, 1);
    let cached: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM troubleshooting_cache")
        .fetch_one(&t.state.pool)
        .await
        .unwrap();
    assert_eq!(cached, 0);
}

// ============ Equipment ============

#[tokio::test]
async fn equipment_profile_lifecycle() {
    let t = setup().await;
    let manual_id = indexed_manual(&t).await;

    let (status, body) = send(
        &t.app,
        "POST",
        "/equipment",
        Some(&t.tech_token),
        Some(json!({
            "manufacturer": "Hobart",
            "model": "HL600",
            "serial_number": "SN-42",
            "customer_name": "Main Street Diner",
            "installation_date": "2022-06-01"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    let profile = &body["data"];
    assert_eq!(profile["manual_id"], manual_id.as_str());
    assert_eq!(profile["created_by"], "tech1");
    let id = profile["id"].as_i64().unwrap();

    let (status, _) = send(
        &t.app,
        "POST",
        "/equipment",
        Some(&t.tech_token),
        Some(json!({"manufacturer": "Hobart", "model": "HL600", "serial_number": "SN-42"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(
        &t.app,
        "POST",
        &format!("/equipment/{}/history", id),
        Some(&t.tech_token),
        Some(json!({
            "service_date": "2024-05-02",
            "service_type": "repair",
            "reported_issue": "E1 low water",
            "issue_resolved": true
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);

    let (_, body) = send(&t.app, "GET", &format!("/equipment/{}", id), Some(&t.tech_token), None).await;
    assert_eq!(body["data"]["last_service_date"], "2024-05-02");

    let (status, body) = send(
        &t.app,
        "PUT",
        &format!("/equipment/{}", id),
        Some(&t.tech_token),
        Some(json!({"next_service_due": "2024-11-01", "active": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["active"], false);

    let (_, body) = send(&t.app, "GET", "/equipment", Some(&t.tech_token), None).await;
    assert_eq!(body["data"]["total"], 0);
    let (_, body) = send(&t.app, "GET", "/equipment?active_only=false", Some(&t.tech_token), None).await;
    assert_eq!(body["data"]["total"], 1);

    let (_, body) = send(&t.app, "GET", &format!("/equipment/{}/history", id), Some(&t.tech_token), None).await;
    assert_eq!(body["data"]["total"], 1);

    let (status, _) = send(&t.app, "DELETE", &format!("/equipment/{}", id), Some(&t.tech_token), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&t.app, "GET", &format!("/equipment/{}", id), Some(&t.tech_token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn service_history_rejects_bad_input() {
    let t = setup().await;
    let (_, body) = send(
        &t.app,
        "POST",
        "/equipment",
        Some(&t.tech_token),
        Some(json!({"manufacturer": "Vulcan", "model": "VC4", "serial_number": "SN-7"})),
    )
    .await;
    let uri = format!("/equipment/{}/history", body["data"]["id"].as_i64().unwrap());

    let bad_inputs = [
        json!({"reported_issue": "no heat", "troubleshooting_cache_id": 999999}),
        json!({"reported_issue": "no heat", "repair_time_minutes": -5}),
        json!({"reported_issue": "no heat", "time_on_site_minutes": -1}),
        json!({"reported_issue": "no heat", "parts_replaced": {"part": "gasket"}}),
        json!({"reported_issue": "no heat", "service_type": "overhaul"}),
        json!({"reported_issue": "no heat", "service_date": "yesterday"}),
    ];
    for input in bad_inputs {
        let (status, body) = send(&t.app, "POST", &uri, Some(&t.tech_token), Some(input.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{} -> {}", input, body);
        assert_eq!(body["error"]["code"], "bad_request");
    }

    let (_, body) = send(&t.app, "GET", &uri, Some(&t.tech_token), None).await;
    assert_eq!(body["data"]["total"], 0);

    let (status, _) = send(
        &t.app,
        "POST",
        "/equipment/424242/history",
        Some(&t.tech_token),
        Some(json!({"reported_issue": "no heat"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============ Stats ============

#[tokio::test]
async fn stats_and_manufacturers() {
    let t = setup().await;
    indexed_manual(&t).await;

    let (status, body) = send(&t.app, "GET", "/stats", Some(&t.tech_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["manuals"]["total"], 1);
    assert_eq!(body["data"]["top_manufacturers"][0]["manufacturer"], "Hobart");

    let (_, body) = send(&t.app, "GET", "/manufacturers", Some(&t.tech_token), None).await;
    assert_eq!(body["data"]["manufacturers"], json!(["Hobart"]));
}
