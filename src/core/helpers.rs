use std::collections::HashSet;
use std::sync::OnceLock;

use ammonia::Builder;
use anyhow::Context;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::{DateTime, Utc};
use html_escape::decode_html_entities;
use http::StatusCode;
use rand::rngs::OsRng;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use spin_sdk::http::{Request, Response};
use uuid::Uuid;

use crate::core::errors::ApiError;

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

pub fn validate_uuid(id: &str) -> bool {
    Uuid::parse_str(id).is_ok()
}

fn email_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("Regex should compile"))
}

pub fn is_valid_email(email: &str) -> bool {
    email_regex().is_match(email)
}

/// Strips all markup, leaving plain text. Entities ammonia writes on the way
/// out are decoded again, so `&`, `<` and quotes are stored as typed.
pub fn sanitize_text(text: &str) -> String {
    let stripped = Builder::default().tags(HashSet::new()).clean(text).to_string();
    decode_html_entities(&stripped).into_owned()
}

/// Treats `None` and blank strings alike.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub fn parse_json<T: DeserializeOwned>(req: &Request) -> Result<T, ApiError> {
    let body = req.body();
    let body = if body.is_empty() { &b"{}"[..] } else { body };
    serde_json::from_slice(body).map_err(|_| ApiError::bad_request("Invalid JSON body"))
}

/// Extracts a single path segment after `prefix` and URL-decodes it.
pub fn path_param(path: &str, prefix: &str) -> Option<String> {
    let raw = path.strip_prefix(prefix)?;
    if raw.is_empty() || raw.contains('/') {
        return None;
    }
    urlencoding::decode(raw).ok().map(|s| s.into_owned())
}

pub fn require_uuid(id: Option<String>, what: &str) -> Result<String, ApiError> {
    match id {
        Some(id) if validate_uuid(&id) => Ok(id),
        _ => Err(ApiError::bad_request(format!("Invalid {} id", what))),
    }
}

pub fn json_response<T: Serialize + ?Sized>(status: StatusCode, body: &T) -> Result<Response, ApiError> {
    json_response_with_cookie(status, body, None)
}

pub fn json_response_with_cookie<T: Serialize + ?Sized>(
    status: StatusCode,
    body: &T,
    cookie: Option<String>,
) -> Result<Response, ApiError> {
    let bytes = serde_json::to_vec(body).context("encoding response body")?;
    let mut builder = Response::builder();
    builder
        .status(status.as_u16())
        .header("Content-Type", "application/json");
    if let Some(cookie) = cookie {
        builder.header("Set-Cookie", cookie);
    }
    Ok(builder.body(bytes).build())
}

pub fn message(text: &str) -> serde_json::Value {
    serde_json::json!({ "message": text })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_is_salted_and_verifiable() {
        let a = hash_password("secret1").unwrap();
        let b = hash_password("secret1").unwrap();
        assert_ne!(a, "secret1");
        assert_ne!(a, b);
        assert!(verify_password("secret1", &a));
        assert!(!verify_password("secret2", &a));
        assert!(!verify_password("secret1", "not-a-hash"));
    }

    #[test]
    fn email_pattern() {
        assert!(is_valid_email("ann@x.com"));
        assert!(!is_valid_email("ann@x"));
        assert!(!is_valid_email("ann x@x.com"));
        assert!(!is_valid_email("@x.com"));
    }

    #[test]
    fn sanitize_strips_markup() {
        assert_eq!(sanitize_text("hi <script>alert(1)</script>there"), "hi there");
        assert_eq!(sanitize_text("<b>bold</b>"), "bold");
        assert_eq!(sanitize_text("Tom & Jerry"), "Tom & Jerry");
        assert_eq!(sanitize_text("1 < 2 && \"quoted\" it's"), "1 < 2 && \"quoted\" it's");
    }

    #[test]
    fn path_params() {
        assert_eq!(path_param("/users/profile/ann", "/users/profile/").as_deref(), Some("ann"));
        assert_eq!(path_param("/users/profile/a%20b", "/users/profile/").as_deref(), Some("a b"));
        assert_eq!(path_param("/users/profile/", "/users/profile/"), None);
        assert_eq!(path_param("/users/profile/a/b", "/users/profile/"), None);
    }

    #[test]
    fn blank_values_are_ignored() {
        assert_eq!(non_blank(Some("  ".into())), None);
        assert_eq!(non_blank(Some("x".into())).as_deref(), Some("x"));
        assert_eq!(non_blank(None), None);
    }
}
