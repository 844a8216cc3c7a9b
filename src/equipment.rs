//! Customer equipment profiles and their service history.
//!
//! Dates (`installation_date`, `last_service_date`, `service_date`, ...)
//! are stored as `YYYY-MM-DD` text so they compare correctly as strings.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::db::{contains_pattern, format_ts_iso, now_ts};
use crate::error::{bad_request, conflict_on_unique, not_found, ServiceError, ServiceResult};
use crate::manuals;

const MAX_IDENT_CHARS: usize = 100;
const MAX_CUSTOMER_CHARS: usize = 200;
const MAX_ERROR_CODES_CHARS: usize = 200;
const SERVICE_TYPES: &[&str] = &["repair", "maintenance", "diagnostic", "installation"];

#[derive(Debug, Clone, Serialize)]
pub struct EquipmentProfile {
    pub id: i64,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub customer_name: Option<String>,
    pub customer_location: Option<String>,
    pub installation_date: Option<String>,
    pub manual_id: Option<String>,
    pub equipment_notes: Option<String>,
    pub active: bool,
    pub last_service_date: Option<String>,
    pub next_service_due: Option<String>,
    pub warranty_expiration: Option<String>,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

const PROFILE_COLUMNS: &str = "id, manufacturer, model, serial_number, customer_name, \
     customer_location, installation_date, manual_id, equipment_notes, active, last_service_date, \
     next_service_due, warranty_expiration, created_by, created_at, updated_at";

fn profile_from_row(row: &SqliteRow) -> EquipmentProfile {
    EquipmentProfile {
        id: row.get("id"),
        manufacturer: row.get("manufacturer"),
        model: row.get("model"),
        serial_number: row.get("serial_number"),
        customer_name: row.get("customer_name"),
        customer_location: row.get("customer_location"),
        installation_date: row.get("installation_date"),
        manual_id: row.get("manual_id"),
        equipment_notes: row.get("equipment_notes"),
        active: row.get::<i64, _>("active") != 0,
        last_service_date: row.get("last_service_date"),
        next_service_due: row.get("next_service_due"),
        warranty_expiration: row.get("warranty_expiration"),
        created_by: row.get("created_by"),
        created_at: format_ts_iso(row.get("created_at")),
        updated_at: format_ts_iso(row.get("updated_at")),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewProfile {
    pub manufacturer: String,
    pub model: String,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub customer_location: Option<String>,
    #[serde(default)]
    pub installation_date: Option<String>,
    #[serde(default)]
    pub equipment_notes: Option<String>,
    #[serde(default)]
    pub warranty_expiration: Option<String>,
}

/// Fields a technician may change after creation. Absent fields are kept.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub customer_location: Option<String>,
    #[serde(default)]
    pub equipment_notes: Option<String>,
    #[serde(default)]
    pub next_service_due: Option<String>,
    #[serde(default)]
    pub warranty_expiration: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileFilter {
    pub manufacturer: Option<String>,
    pub customer_name: Option<String>,
    #[serde(default = "default_active_only")]
    pub active_only: bool,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_active_only() -> bool {
    true
}

fn default_limit() -> i64 {
    50
}

impl Default for ProfileFilter {
    fn default() -> Self {
        Self {
            manufacturer: None,
            customer_name: None,
            active_only: default_active_only(),
            limit: default_limit(),
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfilePage {
    pub profiles: Vec<EquipmentProfile>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

fn optional(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn bounded(name: &str, value: Option<String>, max: usize) -> ServiceResult<Option<String>> {
    match value {
        Some(v) if v.chars().count() > max => Err(bad_request(format!(
            "{} must be at most {} characters",
            name, max
        ))),
        other => Ok(other),
    }
}

fn required(name: &str, value: &str, max: usize) -> ServiceResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(bad_request(format!("{} is required", name)));
    }
    bounded(name, Some(value.to_string()), max).map(|v| v.unwrap_or_default())
}

/// Validate an optional `YYYY-MM-DD` date.
fn date_field(name: &str, value: &Option<String>) -> ServiceResult<Option<String>> {
    let Some(value) = optional(value) else {
        return Ok(None);
    };
    NaiveDate::parse_from_str(&value, "%Y-%m-%d")
        .map(|d| Some(d.format("%Y-%m-%d").to_string()))
        .map_err(|_| bad_request(format!("{} must be a date in YYYY-MM-DD format", name)))
}

pub async fn create_profile(
    pool: &SqlitePool,
    input: &NewProfile,
    created_by: &str,
) -> ServiceResult<EquipmentProfile> {
    let manufacturer = required("manufacturer", &input.manufacturer, MAX_IDENT_CHARS)?;
    let model = required("model", &input.model, MAX_IDENT_CHARS)?;
    let serial_number = bounded("serial_number", optional(&input.serial_number), MAX_IDENT_CHARS)?;
    let customer_name = bounded("customer_name", optional(&input.customer_name), MAX_CUSTOMER_CHARS)?;
    let installation_date = date_field("installation_date", &input.installation_date)?;
    let warranty_expiration = date_field("warranty_expiration", &input.warranty_expiration)?;

    if let Some(serial) = &serial_number {
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM equipment_profiles WHERE serial_number = ?")
                .bind(serial)
                .fetch_optional(pool)
                .await?;
        if existing.is_some() {
            return Err(ServiceError::Conflict(
                "Equipment with this serial number already exists".to_string(),
            ));
        }
    }

    let manual_id = manuals::find_library_manual(pool, &manufacturer, &model)
        .await?
        .map(|m| m.id);

    let now = now_ts();
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO equipment_profiles (
            manufacturer, model, serial_number, customer_name, customer_location,
            installation_date, manual_id, equipment_notes, active, warranty_expiration,
            created_by, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(&manufacturer)
    .bind(&model)
    .bind(&serial_number)
    .bind(&customer_name)
    .bind(optional(&input.customer_location))
    .bind(&installation_date)
    .bind(&manual_id)
    .bind(optional(&input.equipment_notes))
    .bind(&warranty_expiration)
    .bind(created_by)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .map_err(|e| conflict_on_unique(e, "Equipment with this serial number already exists"))?;

    tracing::info!(profile_id = id, manual_id = ?manual_id, "equipment profile created");
    get_profile(pool, id).await
}

pub async fn get_profile(pool: &SqlitePool, id: i64) -> ServiceResult<EquipmentProfile> {
    let sql = format!("SELECT {} FROM equipment_profiles WHERE id = ?", PROFILE_COLUMNS);
    sqlx::query(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .as_ref()
        .map(profile_from_row)
        .ok_or_else(|| not_found("Equipment profile not found"))
}

/// Profiles matching the filter, newest first, with the unpaged total.
pub async fn list_profiles(pool: &SqlitePool, filter: &ProfileFilter) -> ServiceResult<ProfilePage> {
    let limit = filter.limit.clamp(1, 500);
    let offset = filter.offset.max(0);
    let manufacturer = optional(&filter.manufacturer).map(|m| contains_pattern(&m));
    let customer = optional(&filter.customer_name).map(|c| contains_pattern(&c));
    let conditions = "(?1 IS NULL OR lower(manufacturer) LIKE ?1 ESCAPE '\\')
           AND (?2 IS NULL OR lower(customer_name) LIKE ?2 ESCAPE '\\')
           AND (?3 = 0 OR active = 1)";

    let total: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM equipment_profiles WHERE {}",
        conditions
    ))
    .bind(&manufacturer)
    .bind(&customer)
    .bind(filter.active_only)
    .fetch_one(pool)
    .await?;

    let sql = format!(
        "SELECT {} FROM equipment_profiles WHERE {}
         ORDER BY created_at DESC, id DESC
         LIMIT ?4 OFFSET ?5",
        PROFILE_COLUMNS, conditions
    );
    let rows = sqlx::query(&sql)
        .bind(&manufacturer)
        .bind(&customer)
        .bind(filter.active_only)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;

    Ok(ProfilePage {
        profiles: rows.iter().map(profile_from_row).collect(),
        total,
        limit,
        offset,
    })
}

pub async fn update_profile(
    pool: &SqlitePool,
    id: i64,
    update: &ProfileUpdate,
) -> ServiceResult<EquipmentProfile> {
    let customer_name = bounded("customer_name", optional(&update.customer_name), MAX_CUSTOMER_CHARS)?;
    let next_service_due = date_field("next_service_due", &update.next_service_due)?;
    let warranty_expiration = date_field("warranty_expiration", &update.warranty_expiration)?;

    let result = sqlx::query(
        r#"
        UPDATE equipment_profiles
        SET customer_name = COALESCE(?, customer_name),
            customer_location = COALESCE(?, customer_location),
            equipment_notes = COALESCE(?, equipment_notes),
            next_service_due = COALESCE(?, next_service_due),
            warranty_expiration = COALESCE(?, warranty_expiration),
            active = COALESCE(?, active),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&customer_name)
    .bind(optional(&update.customer_location))
    .bind(optional(&update.equipment_notes))
    .bind(&next_service_due)
    .bind(&warranty_expiration)
    .bind(update.active)
    .bind(now_ts())
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(not_found("Equipment profile not found"));
    }
    get_profile(pool, id).await
}

/// Delete a profile; its service history goes with it.
pub async fn delete_profile(pool: &SqlitePool, id: i64) -> ServiceResult<()> {
    let result = sqlx::query("DELETE FROM equipment_profiles WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(not_found("Equipment profile not found"));
    }
    Ok(())
}

// ============ Service history ============

#[derive(Debug, Clone, Serialize)]
pub struct ServiceRecord {
    pub id: i64,
    pub profile_id: i64,
    pub troubleshooting_cache_id: Option<i64>,
    pub service_date: String,
    pub service_type: Option<String>,
    pub reported_issue: String,
    pub error_codes: Option<String>,
    pub diagnosis: Option<String>,
    pub resolution: Option<String>,
    pub parts_replaced: Option<Value>,
    pub time_on_site_minutes: Option<i64>,
    pub troubleshooting_time_minutes: Option<i64>,
    pub repair_time_minutes: Option<i64>,
    pub issue_resolved: Option<bool>,
    pub followup_required: bool,
    pub followup_notes: Option<String>,
    pub technician_name: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewServiceRecord {
    /// Defaults to today (UTC).
    #[serde(default)]
    pub service_date: Option<String>,
    #[serde(default)]
    pub service_type: Option<String>,
    pub reported_issue: String,
    #[serde(default)]
    pub error_codes: Option<String>,
    #[serde(default)]
    pub diagnosis: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub parts_replaced: Option<Value>,
    #[serde(default)]
    pub time_on_site_minutes: Option<i64>,
    #[serde(default)]
    pub troubleshooting_time_minutes: Option<i64>,
    #[serde(default)]
    pub repair_time_minutes: Option<i64>,
    #[serde(default)]
    pub issue_resolved: Option<bool>,
    #[serde(default)]
    pub followup_required: bool,
    #[serde(default)]
    pub followup_notes: Option<String>,
    #[serde(default)]
    pub technician_name: Option<String>,
    #[serde(default)]
    pub troubleshooting_cache_id: Option<i64>,
}

fn record_from_row(row: &SqliteRow) -> ServiceRecord {
    let parts: Option<String> = row.get("parts_replaced");
    ServiceRecord {
        id: row.get("id"),
        profile_id: row.get("profile_id"),
        troubleshooting_cache_id: row.get("troubleshooting_cache_id"),
        service_date: row.get("service_date"),
        service_type: row.get("service_type"),
        reported_issue: row.get("reported_issue"),
        error_codes: row.get("error_codes"),
        diagnosis: row.get("diagnosis"),
        resolution: row.get("resolution"),
        parts_replaced: parts.and_then(|p| serde_json::from_str(&p).ok()),
        time_on_site_minutes: row.get("time_on_site_minutes"),
        troubleshooting_time_minutes: row.get("troubleshooting_time_minutes"),
        repair_time_minutes: row.get("repair_time_minutes"),
        issue_resolved: row.get::<Option<i64>, _>("issue_resolved").map(|v| v != 0),
        followup_required: row.get::<i64, _>("followup_required") != 0,
        followup_notes: row.get("followup_notes"),
        technician_name: row.get("technician_name"),
        created_at: format_ts_iso(row.get("created_at")),
    }
}

fn non_negative(name: &str, value: Option<i64>) -> ServiceResult<Option<i64>> {
    match value {
        Some(v) if v < 0 => Err(bad_request(format!("{} must not be negative", name))),
        other => Ok(other),
    }
}

/// Append a service record and move the profile's `last_service_date`
/// forward when this visit is the latest.
pub async fn add_service_record(
    pool: &SqlitePool,
    profile_id: i64,
    input: &NewServiceRecord,
) -> ServiceResult<ServiceRecord> {
    get_profile(pool, profile_id).await?;

    let reported_issue = required("reported_issue", &input.reported_issue, usize::MAX)?;
    let service_date = date_field("service_date", &input.service_date)?
        .unwrap_or_else(|| chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string());
    let service_type = optional(&input.service_type).map(|t| t.to_lowercase());
    if let Some(t) = &service_type {
        if !SERVICE_TYPES.contains(&t.as_str()) {
            return Err(bad_request(format!(
                "service_type must be one of: {}",
                SERVICE_TYPES.join(", ")
            )));
        }
    }
    let error_codes = bounded("error_codes", optional(&input.error_codes), MAX_ERROR_CODES_CHARS)?;
    let parts_replaced = match &input.parts_replaced {
        Some(Value::Null) | None => None,
        Some(parts @ Value::Array(_)) => Some(parts.to_string()),
        Some(_) => return Err(bad_request("parts_replaced must be a JSON array")),
    };
    let time_on_site = non_negative("time_on_site_minutes", input.time_on_site_minutes)?;
    let troubleshooting_time =
        non_negative("troubleshooting_time_minutes", input.troubleshooting_time_minutes)?;
    let repair_time = non_negative("repair_time_minutes", input.repair_time_minutes)?;

    if let Some(cache_id) = input.troubleshooting_cache_id {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM troubleshooting_cache WHERE id = ?)")
                .bind(cache_id)
                .fetch_one(pool)
                .await?;
        if !exists {
            return Err(bad_request(format!(
                "troubleshooting_cache_id {} does not exist",
                cache_id
            )));
        }
    }

    let mut tx = pool.begin().await?;
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO service_history (
            profile_id, troubleshooting_cache_id, service_date, service_type, reported_issue,
            error_codes, diagnosis, resolution, parts_replaced, time_on_site_minutes,
            troubleshooting_time_minutes, repair_time_minutes, issue_resolved,
            followup_required, followup_notes, technician_name, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(profile_id)
    .bind(input.troubleshooting_cache_id)
    .bind(&service_date)
    .bind(&service_type)
    .bind(&reported_issue)
    .bind(&error_codes)
    .bind(optional(&input.diagnosis))
    .bind(optional(&input.resolution))
    .bind(&parts_replaced)
    .bind(time_on_site)
    .bind(troubleshooting_time)
    .bind(repair_time)
    .bind(input.issue_resolved)
    .bind(input.followup_required)
    .bind(optional(&input.followup_notes))
    .bind(optional(&input.technician_name))
    .bind(now_ts())
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE equipment_profiles
         SET last_service_date = ?1, updated_at = ?2
         WHERE id = ?3 AND (last_service_date IS NULL OR last_service_date < ?1)",
    )
    .bind(&service_date)
    .bind(now_ts())
    .bind(profile_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    let row = sqlx::query("SELECT * FROM service_history WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(record_from_row(&row))
}

/// Service history of a profile, latest visit first.
pub async fn list_service_history(pool: &SqlitePool, profile_id: i64) -> ServiceResult<Vec<ServiceRecord>> {
    get_profile(pool, profile_id).await?;
    let rows = sqlx::query(
        "SELECT * FROM service_history WHERE profile_id = ?
         ORDER BY service_date DESC, id DESC",
    )
    .bind(profile_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(record_from_row).collect())
}

pub async fn count_profiles(pool: &SqlitePool) -> ServiceResult<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM equipment_profiles")
        .fetch_one(pool)
        .await?)
}
