use std::sync::Once;

use tracing::warn;

pub const SESSION_COOKIE: &str = "jwt";
pub const MIN_PASSWORD_LENGTH: usize = 6;
pub const SUGGESTED_USERS_SAMPLE: usize = 4;
pub const MAX_POST_LENGTH: usize = 5000;
pub const MAX_BIO_LENGTH: usize = 500;
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

pub const USERS_LIST_KEY: &str = "users_list";
pub const FEED_KEY: &str = "feed";
pub const REVOKED_TOKENS_KEY: &str = "revoked_tokens";

const DEV_JWT_SECRET: &str = "plaza-development-secret-change-me";

// === Keys ===

pub fn user_key(id: &str) -> String {
    format!("user:{}", id)
}

pub fn username_key(username: &str) -> String {
    format!("username:{}", username)
}

pub fn email_key(email: &str) -> String {
    format!("email:{}", email)
}

pub fn post_key(id: &str) -> String {
    format!("post:{}", id)
}

pub fn notification_key(id: &str) -> String {
    format!("notification:{}", id)
}

pub fn notifications_key(user_id: &str) -> String {
    format!("notifications:{}", user_id)
}

pub fn image_key(file: &str) -> String {
    format!("image:{}", file)
}

pub fn revoked_token_key(jti: &str) -> String {
    format!("revoked_token:{}", jti)
}

// === Environment ===

pub fn jwt_secret() -> String {
    match std::env::var("PLAZA_JWT_SECRET") {
        Ok(secret) if !secret.is_empty() => secret,
        _ => {
            static WARN: Once = Once::new();
            WARN.call_once(|| warn!("PLAZA_JWT_SECRET not set, using the development secret"));
            DEV_JWT_SECRET.to_string()
        }
    }
}

pub fn session_days() -> i64 {
    std::env::var("PLAZA_SESSION_DAYS")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|days| *days > 0)
        .unwrap_or(15)
}

pub fn is_development() -> bool {
    std::env::var("PLAZA_ENV")
        .map(|v| v.eq_ignore_ascii_case("development"))
        .unwrap_or(false)
}

pub fn bind_addr() -> String {
    std::env::var("PLAZA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string())
}

/// Prefix for hosted image URLs. Empty means URLs are relative (`/images/..`).
pub fn public_url() -> String {
    std::env::var("PLAZA_PUBLIC_URL")
        .map(|v| v.trim_end_matches('/').to_string())
        .unwrap_or_default()
}

pub fn seed_demo() -> bool {
    std::env::var("PLAZA_SEED_DEMO")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}
