//! User accounts, password hashing, and bearer tokens.
//!
//! Passwords are stored as Argon2 PHC strings. Sessions are stateless
//! HS256 JWTs carrying the username, numeric user id, and role; every
//! authenticated request re-loads the user so deactivated accounts lose
//! access immediately.

use anyhow::anyhow;
use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::config::AuthConfig;
use crate::db::{format_ts_iso, now_ts};
use crate::error::{bad_request, conflict_on_unique, ServiceError, ServiceResult};

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_TECHNICIAN: &str = "technician";
pub const ROLE_READONLY: &str = "readonly";

/// Authenticated user as exposed over the API (never includes the hash).
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub user_id: i64,
    pub username: String,
    pub email: String,
    pub full_name: Option<String>,
    pub role: String,
    #[serde(skip)]
    pub is_active: bool,
    pub last_login: Option<String>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub user: User,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    user_id: i64,
    role: String,
    iat: i64,
    exp: i64,
}

/// Signing material and token lifetime, resolved once at startup.
#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_minutes: i64,
}

impl TokenKeys {
    pub fn new(secret: &[u8], ttl_minutes: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl_minutes,
        }
    }

    /// Read the secret from the environment variable named in config.
    pub fn from_config(config: &AuthConfig) -> anyhow::Result<Self> {
        let secret = std::env::var(&config.jwt_secret_env)
            .map_err(|_| anyhow!("{} environment variable not set", config.jwt_secret_env))?;
        if secret.len() < 16 {
            anyhow::bail!("{} must be at least 16 bytes", config.jwt_secret_env);
        }
        Ok(Self::new(secret.as_bytes(), config.token_ttl_minutes))
    }

    pub fn expires_in_secs(&self) -> i64 {
        self.ttl_minutes * 60
    }

    pub fn issue(&self, user: &User) -> ServiceResult<String> {
        let iat = now_ts();
        let claims = Claims {
            sub: user.username.clone(),
            user_id: user.user_id,
            role: user.role.clone(),
            iat,
            exp: iat + self.expires_in_secs(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| ServiceError::Internal(anyhow!("token signing failed: {}", e)))
    }

    fn verify(&self, token: &str) -> ServiceResult<Claims> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|_| ServiceError::Unauthorized("Could not validate credentials".to_string()))
    }
}

/// Argon2 hashing is CPU-bound, so it runs on the blocking pool.
pub async fn hash_password(password: &str) -> ServiceResult<String> {
    let password = password.to_owned();
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| ServiceError::Internal(anyhow!("password hashing failed: {}", e)))
    })
    .await
    .map_err(|e| ServiceError::Internal(anyhow!("password hashing task failed: {}", e)))?
}

pub async fn verify_password(password: &str, hash: &str) -> bool {
    let (password, hash) = (password.to_owned(), hash.to_owned());
    tokio::task::spawn_blocking(move || match PasswordHash::new(&hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    })
    .await
    .unwrap_or(false)
}

fn validate_username(username: &str) -> ServiceResult<()> {
    let len = username.chars().count();
    if !(3..=100).contains(&len) {
        return Err(bad_request("username must be 3-100 characters"));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(bad_request(
            "username may only contain letters, digits and underscores",
        ));
    }
    Ok(())
}

fn validate_email(email: &str) -> ServiceResult<()> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain
                    .split_once('.')
                    .map(|(host, tld)| !host.is_empty() && !tld.is_empty())
                    .unwrap_or(false)
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(bad_request("email address is invalid"))
    }
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> User {
    let last_login: Option<i64> = row.get("last_login");
    let is_active: i64 = row.get("is_active");
    User {
        user_id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        full_name: row.get("full_name"),
        role: row.get("role"),
        is_active: is_active != 0,
        last_login: last_login.map(format_ts_iso),
    }
}

const USER_COLUMNS: &str = "id, username, email, full_name, role, is_active, last_login";

pub async fn find_user(pool: &SqlitePool, username: &str) -> ServiceResult<Option<User>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM users WHERE username = ?",
        USER_COLUMNS
    ))
    .bind(username)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(row_to_user))
}

/// Insert a user with an explicit role. Used by registration, the CLI,
/// and admin seeding.
pub async fn create_user(
    pool: &SqlitePool,
    req: &RegisterRequest,
    role: &str,
) -> ServiceResult<User> {
    validate_username(&req.username)?;
    validate_email(&req.email)?;
    if req.password.chars().count() < 8 {
        return Err(bad_request("password must be at least 8 characters"));
    }
    if ![ROLE_ADMIN, ROLE_TECHNICIAN, ROLE_READONLY].contains(&role) {
        return Err(bad_request(format!("unknown role: {}", role)));
    }

    let taken: Option<String> =
        sqlx::query_scalar("SELECT username FROM users WHERE username = ? OR email = ?")
            .bind(&req.username)
            .bind(&req.email)
            .fetch_optional(pool)
            .await?;
    if let Some(existing) = taken {
        let what = if existing == req.username {
            "Username"
        } else {
            "Email"
        };
        return Err(ServiceError::Conflict(format!("{} already registered", what)));
    }

    let hash = hash_password(&req.password).await?;
    sqlx::query(
        r#"
        INSERT INTO users (username, email, password_hash, full_name, role, is_active, created_at)
        VALUES (?, ?, ?, ?, ?, 1, ?)
        "#,
    )
    .bind(&req.username)
    .bind(&req.email)
    .bind(&hash)
    .bind(&req.full_name)
    .bind(role)
    .bind(now_ts())
    .execute(pool)
    .await
    .map_err(|e| conflict_on_unique(e, "Username or email already registered"))?;

    tracing::info!(username = %req.username, role, "user created");

    find_user(pool, &req.username)
        .await?
        .ok_or_else(|| ServiceError::Internal(anyhow!("user vanished after insert")))
}

/// Self-service registration always yields a technician.
pub async fn register(pool: &SqlitePool, req: &RegisterRequest) -> ServiceResult<User> {
    create_user(pool, req, ROLE_TECHNICIAN).await
}

pub async fn login(
    pool: &SqlitePool,
    keys: &TokenKeys,
    req: &LoginRequest,
) -> ServiceResult<TokenResponse> {
    let row = sqlx::query(&format!(
        "SELECT {}, password_hash FROM users WHERE username = ?",
        USER_COLUMNS
    ))
    .bind(&req.username)
    .fetch_optional(pool)
    .await?;

    let (mut user, hash) = match row {
        Some(row) => {
            let hash: String = row.get("password_hash");
            (row_to_user(&row), hash)
        }
        None => {
            return Err(ServiceError::Unauthorized(
                "Incorrect username or password".to_string(),
            ))
        }
    };

    if !verify_password(&req.password, &hash).await {
        return Err(ServiceError::Unauthorized(
            "Incorrect username or password".to_string(),
        ));
    }
    if !user.is_active {
        return Err(ServiceError::Forbidden(
            "User account is inactive".to_string(),
        ));
    }

    let now = now_ts();
    sqlx::query("UPDATE users SET last_login = ? WHERE id = ?")
        .bind(now)
        .bind(user.user_id)
        .execute(pool)
        .await?;
    user.last_login = Some(format_ts_iso(now));

    let access_token = keys.issue(&user)?;
    Ok(TokenResponse {
        access_token,
        token_type: "bearer".to_string(),
        expires_in: keys.expires_in_secs(),
        user,
    })
}

/// Resolve a bearer token to an active user.
pub async fn authenticate(
    pool: &SqlitePool,
    keys: &TokenKeys,
    token: &str,
) -> ServiceResult<User> {
    let claims = keys.verify(token)?;
    let user = find_user(pool, &claims.sub)
        .await?
        .filter(|u| u.user_id == claims.user_id)
        .ok_or_else(|| ServiceError::Unauthorized("Could not validate credentials".to_string()))?;
    if !user.is_active {
        return Err(ServiceError::Forbidden(
            "User account is inactive".to_string(),
        ));
    }
    Ok(user)
}

pub fn require_admin(user: &User) -> ServiceResult<()> {
    if user.is_admin() {
        Ok(())
    } else {
        Err(ServiceError::Forbidden(
            "Admin privileges required".to_string(),
        ))
    }
}

pub async fn reset_password(
    pool: &SqlitePool,
    username: &str,
    password: &str,
) -> ServiceResult<()> {
    if password.chars().count() < 8 {
        return Err(bad_request("password must be at least 8 characters"));
    }
    let hash = hash_password(password).await?;
    let result = sqlx::query("UPDATE users SET password_hash = ?, is_active = 1 WHERE username = ?")
        .bind(&hash)
        .bind(username)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ServiceError::NotFound(format!("user not found: {}", username)));
    }
    Ok(())
}

/// Create the `admin` account on startup when `ADMIN_PASSWORD` is set and
/// no such user exists yet. Returns whether a user was created.
pub async fn seed_admin(pool: &SqlitePool) -> ServiceResult<bool> {
    let password = match std::env::var("ADMIN_PASSWORD") {
        Ok(p) => p,
        Err(_) => {
            tracing::debug!("ADMIN_PASSWORD not set; skipping admin seeding");
            return Ok(false);
        }
    };
    if find_user(pool, "admin").await?.is_some() {
        return Ok(false);
    }
    let email = std::env::var("ADMIN_EMAIL").unwrap_or_else(|_| "admin@example.com".to_string());
    let req = RegisterRequest {
        username: "admin".to_string(),
        email,
        password,
        full_name: Some("System Admin".to_string()),
    };
    create_user(pool, &req, ROLE_ADMIN).await?;
    Ok(true)
}
