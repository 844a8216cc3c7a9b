//! HTTP API server.
//!
//! # Endpoints
//!
//! | Method | Path | Auth |
//! |--------|------|------|
//! | `POST` | `/auth/register`, `/auth/login` | - |
//! | `GET`  | `/auth/me` | user |
//! | `POST` | `/manuals/upload` (multipart) | admin |
//! | `GET`  | `/manuals`, `/manuals/{id}`, `/manuals/{id}/chunks` | user |
//! | `DELETE` | `/manuals/{id}` | admin |
//! | `GET`  | `/manuals/{id}/pdf` | - |
//! | `POST` | `/manuals/{id}/reindex` | admin |
//! | `POST` | `/manuals/search` | user |
//! | `POST` | `/query/rag` | user |
//! | `POST` | `/troubleshoot`, `/troubleshoot/feedback` | user |
//! | `GET`/`POST` | `/equipment` | user |
//! | `GET`/`PUT`/`DELETE` | `/equipment/{id}` | user |
//! | `GET`/`POST` | `/equipment/{id}/history` | user |
//! | `GET`  | `/usage/summary`, `/usage/by-model`, `/usage/all` | user |
//! | `GET`  | `/health` | - |
//! | `GET`  | `/stats`, `/manufacturers` | user |
//!
//! # Response contract
//!
//! ```json
//! { "success": true, "data": { ... } }
//! { "success": true, "message": "Manual deleted successfully" }
//! { "success": false, "error": { "code": "not_found", "message": "Manual not found" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `forbidden` (403),
//! `not_found` (404), `conflict` (409), `upstream_error` (502), `internal` (500).

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, FromRequest, FromRequestParts, Multipart, Path, Query, Request, State,
    },
    http::{header, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{self, LoginRequest, RegisterRequest, User};
use crate::config::Config;
use crate::equipment::{self, NewProfile, NewServiceRecord, ProfileFilter, ProfileUpdate};
use crate::error::{bad_request, ServiceError, ServiceResult};
use crate::indexing::spawn_indexing;
use crate::manuals::{self, ManualFilter, ManualSearchRequest, NewManual, SOURCE_UPLOAD};
use crate::rag::{self, RagQuery};
use crate::state::AppState;
use crate::storage::sanitize_filename;
use crate::system;
use crate::troubleshoot::{self, FeedbackRequest, TroubleshootRequest};
use crate::usage;

/// Multipart framing on top of the PDF itself.
const UPLOAD_OVERHEAD_BYTES: usize = 1024 * 1024;

/// Start the API server on `[server] bind` and run until the process exits.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let seed = config.auth.seed_admin;
    let state = AppState::from_config(config).await?;

    if seed && auth::seed_admin(&state.pool).await? {
        tracing::info!("created admin user from ADMIN_PASSWORD");
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "API server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// The full route table with CORS, tracing and upload limits applied.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.upload.max_bytes + UPLOAD_OVERHEAD_BYTES;
    let cors = cors_layer(&state.config.server.cors_origins);

    Router::new()
        .route("/auth/register", post(handle_register))
        .route("/auth/login", post(handle_login))
        .route("/auth/me", get(handle_me))
        .route("/manuals", get(handle_list_manuals))
        .route("/manuals/upload", post(handle_upload_manual))
        .route("/manuals/search", post(handle_search_manual))
        .route(
            "/manuals/{id}",
            get(handle_get_manual).delete(handle_delete_manual),
        )
        .route("/manuals/{id}/pdf", get(handle_manual_pdf))
        .route("/manuals/{id}/chunks", get(handle_manual_chunks))
        .route("/manuals/{id}/reindex", post(handle_reindex_manual))
        .route("/query/rag", post(handle_rag_query))
        .route("/troubleshoot", post(handle_troubleshoot))
        .route("/troubleshoot/feedback", post(handle_feedback))
        .route(
            "/equipment",
            get(handle_list_equipment).post(handle_create_equipment),
        )
        .route(
            "/equipment/{id}",
            get(handle_get_equipment)
                .put(handle_update_equipment)
                .delete(handle_delete_equipment),
        )
        .route(
            "/equipment/{id}/history",
            get(handle_list_history).post(handle_add_history),
        )
        .route("/usage/summary", get(handle_usage_summary))
        .route("/usage/by-model", get(handle_usage_by_model))
        .route("/usage/all", get(handle_usage_all))
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .route("/manufacturers", get(handle_manufacturers))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

// ============ Envelopes and errors ============

fn ok<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

fn message(text: &str) -> Json<Value> {
    Json(json!({ "success": true, "message": text }))
}

impl ServiceError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ServiceError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ServiceError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ServiceError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            ServiceError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ServiceError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ServiceError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
            ServiceError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = match &self {
            ServiceError::Internal(e) => {
                tracing::error!(error = %format!("{:#}", e), "request failed");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        let body = Json(json!({
            "success": false,
            "error": { "code": code, "message": message },
        }));

        let mut response = (status, body).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

/// `Json` whose rejections use the error envelope.
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e: JsonRejection| bad_request(e.body_text()))?;
        Ok(ApiJson(value))
    }
}

/// `Query` whose rejections use the error envelope.
pub struct ApiQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e: QueryRejection| bad_request(e.body_text()))?;
        Ok(ApiQuery(value))
    }
}

/// The user behind the request's bearer token.
pub struct CurrentUser(pub User);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                v.strip_prefix("Bearer ")
                    .or_else(|| v.strip_prefix("bearer "))
            })
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ServiceError::Unauthorized("Not authenticated".to_string()))?;

        let user = auth::authenticate(&state.pool, &state.keys, token).await?;
        Ok(CurrentUser(user))
    }
}

/// A [`CurrentUser`] with the admin role.
pub struct AdminUser(pub User);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;
        auth::require_admin(&user)?;
        Ok(AdminUser(user))
    }
}

// ============ Auth ============

async fn handle_register(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> ServiceResult<(StatusCode, Json<Value>)> {
    let user = auth::register(&state.pool, &req).await?;
    Ok((StatusCode::CREATED, ok(user)))
}

async fn handle_login(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<LoginRequest>,
) -> ServiceResult<Json<Value>> {
    let token = auth::login(&state.pool, &state.keys, &req).await?;
    Ok(ok(token))
}

async fn handle_me(CurrentUser(user): CurrentUser) -> Json<Value> {
    ok(user)
}

// ============ Manuals ============

async fn handle_list_manuals(
    State(state): State<AppState>,
    _user: CurrentUser,
    ApiQuery(filter): ApiQuery<ManualFilter>,
) -> ServiceResult<Json<Value>> {
    let manuals = manuals::list(&state.pool, &filter).await?;
    Ok(ok(json!({ "total": manuals.len(), "manuals": manuals })))
}

async fn handle_upload_manual(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    mut multipart: Multipart,
) -> ServiceResult<(StatusCode, Json<Value>)> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut brand = String::new();
    let mut model = String::new();
    let mut equipment_type = None;
    let mut manual_type = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("manual.pdf").to_string();
                let bytes = field.bytes().await.map_err(|e| bad_request(e.body_text()))?;
                file = Some((filename, bytes.to_vec()));
            }
            "brand" | "manufacturer" | "model" | "equipment_type" | "manual_type" => {
                let text = field.text().await.map_err(|e| bad_request(e.body_text()))?;
                match name.as_str() {
                    "brand" | "manufacturer" => brand = text,
                    "model" => model = text,
                    "equipment_type" => equipment_type = Some(text),
                    _ => manual_type = Some(text),
                }
            }
            _ => {}
        }
    }

    let (filename, bytes) = file.ok_or_else(|| bad_request("file is required"))?;
    let manual = manuals::create(
        &state,
        NewManual {
            filename,
            brand,
            model,
            equipment_type,
            manual_type,
            source: SOURCE_UPLOAD,
            source_url: None,
            bytes,
        },
    )
    .await?;
    tracing::info!(manual_id = %manual.id, uploaded_by = %admin.username, "manual uploaded");
    spawn_indexing(state.clone(), manual.id.clone());

    Ok((
        StatusCode::CREATED,
        ok(json!({
            "manual": manual,
            "message": "Manual uploaded. Indexing started in background.",
        })),
    ))
}

async fn handle_get_manual(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> ServiceResult<Json<Value>> {
    Ok(ok(manuals::get_detail(&state.pool, &id).await?))
}

async fn handle_delete_manual(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
) -> ServiceResult<Json<Value>> {
    manuals::delete(&state, &id).await?;
    Ok(message("Manual deleted successfully"))
}

async fn handle_manual_pdf(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ServiceResult<Response> {
    let (manual, bytes) = manuals::read_pdf(&state, &id).await?;
    let download_name = sanitize_filename(
        &format!("{}_{}_{}.pdf", manual.brand, manual.model, manual.manual_type).replace(' ', "_"),
    );
    let disposition = format!("attachment; filename=\"{}\"", download_name);

    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct PageParams {
    #[serde(default = "default_page_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_page_limit() -> i64 {
    50
}

async fn handle_manual_chunks(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
    ApiQuery(page): ApiQuery<PageParams>,
) -> ServiceResult<Json<Value>> {
    Ok(ok(manuals::list_chunks(&state.pool, &id, page.limit, page.offset).await?))
}

async fn handle_reindex_manual(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
) -> ServiceResult<(StatusCode, Json<Value>)> {
    let manual = manuals::find(&state.pool, &id).await?;
    spawn_indexing(state.clone(), manual.id.clone());
    Ok((
        StatusCode::ACCEPTED,
        ok(json!({ "manual_id": manual.id, "message": "Reindexing started in background." })),
    ))
}

async fn handle_search_manual(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ApiJson(req): ApiJson<ManualSearchRequest>,
) -> ServiceResult<Json<Value>> {
    Ok(ok(manuals::search_web(&state, &req, Some(user.user_id)).await?))
}

// ============ Query and troubleshooting ============

async fn handle_rag_query(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ApiJson(query): ApiJson<RagQuery>,
) -> ServiceResult<Json<Value>> {
    Ok(ok(rag::answer(&state, &query, Some(user.user_id)).await?))
}

async fn handle_troubleshoot(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ApiJson(req): ApiJson<TroubleshootRequest>,
) -> ServiceResult<Json<Value>> {
    Ok(ok(troubleshoot::troubleshoot(&state, &req, Some(user.user_id)).await?))
}

async fn handle_feedback(
    State(state): State<AppState>,
    _user: CurrentUser,
    ApiJson(req): ApiJson<FeedbackRequest>,
) -> ServiceResult<Json<Value>> {
    troubleshoot::feedback(&state, &req).await?;
    Ok(message("Feedback submitted successfully"))
}

// ============ Equipment ============

async fn handle_create_equipment(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ApiJson(input): ApiJson<NewProfile>,
) -> ServiceResult<(StatusCode, Json<Value>)> {
    let profile = equipment::create_profile(&state.pool, &input, &user.username).await?;
    Ok((StatusCode::CREATED, ok(profile)))
}

async fn handle_list_equipment(
    State(state): State<AppState>,
    _user: CurrentUser,
    ApiQuery(filter): ApiQuery<ProfileFilter>,
) -> ServiceResult<Json<Value>> {
    Ok(ok(equipment::list_profiles(&state.pool, &filter).await?))
}

async fn handle_get_equipment(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<i64>,
) -> ServiceResult<Json<Value>> {
    Ok(ok(equipment::get_profile(&state.pool, id).await?))
}

async fn handle_update_equipment(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<i64>,
    ApiJson(update): ApiJson<ProfileUpdate>,
) -> ServiceResult<Json<Value>> {
    Ok(ok(equipment::update_profile(&state.pool, id, &update).await?))
}

async fn handle_delete_equipment(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<i64>,
) -> ServiceResult<Json<Value>> {
    equipment::delete_profile(&state.pool, id).await?;
    Ok(message("Equipment profile deleted successfully"))
}

async fn handle_list_history(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<i64>,
) -> ServiceResult<Json<Value>> {
    let records = equipment::list_service_history(&state.pool, id).await?;
    Ok(ok(json!({ "total": records.len(), "history": records })))
}

async fn handle_add_history(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<i64>,
    ApiJson(input): ApiJson<NewServiceRecord>,
) -> ServiceResult<(StatusCode, Json<Value>)> {
    let record = equipment::add_service_record(&state.pool, id, &input).await?;
    Ok((StatusCode::CREATED, ok(record)))
}

// ============ Usage ============

#[derive(Debug, Deserialize)]
struct DaysParam {
    #[serde(default = "default_days")]
    days: i64,
}

fn default_days() -> i64 {
    30
}

async fn handle_usage_summary(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ApiQuery(q): ApiQuery<DaysParam>,
) -> ServiceResult<Json<Value>> {
    Ok(ok(usage::summary(&state.pool, Some(user.user_id), q.days).await?))
}

async fn handle_usage_by_model(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ApiQuery(q): ApiQuery<DaysParam>,
) -> ServiceResult<Json<Value>> {
    Ok(ok(usage::by_model(&state.pool, Some(user.user_id), q.days).await?))
}

async fn handle_usage_all(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ApiQuery(q): ApiQuery<DaysParam>,
) -> ServiceResult<Json<Value>> {
    let summary = usage::summary(&state.pool, Some(user.user_id), q.days).await?;
    let by_model = usage::by_model(&state.pool, Some(user.user_id), q.days).await?;
    Ok(ok(json!({ "summary": summary, "by_model": by_model })))
}

// ============ System ============

async fn handle_health() -> Json<system::Health> {
    Json(system::health())
}

async fn handle_stats(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> ServiceResult<Json<Value>> {
    Ok(ok(system::stats(&state.pool).await?))
}

async fn handle_manufacturers(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> ServiceResult<Json<Value>> {
    Ok(ok(system::manufacturers(&state.pool).await?))
}
