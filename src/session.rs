//! Session tokens.
//!
//! A session is an HS256-signed JWT carried in the `jwt` cookie (or, for
//! API clients, an `Authorization: Bearer` header). Logging out revokes the
//! token's `jti` so a copied token stops working too.

use chrono::Duration;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use spin_sdk::http::Request;

use crate::config::{
    is_development, jwt_secret, revoked_token_key, session_days, REVOKED_TOKENS_KEY, SESSION_COOKIE,
};
use crate::core::errors::ApiError;
use crate::core::helpers::{new_id, now};
use crate::core::store::DocumentStore;
use crate::models::models::{Claims, RevokedToken};

pub fn issue_token(user_id: &str) -> anyhow::Result<String> {
    let issued = now();
    let claims = Claims {
        sub: user_id.to_string(),
        iat: issued.timestamp(),
        iat_ms: issued.timestamp_millis(),
        exp: (issued + Duration::days(session_days())).timestamp(),
        jti: new_id(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(jwt_secret().as_bytes()),
    )
    .map_err(|e| anyhow::anyhow!("signing session token: {}", e))
}

/// Checks signature and expiry only.
pub fn decode_token(token: &str) -> Option<Claims> {
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret().as_bytes()),
        &validation,
    )
    .ok()
    .map(|data| data.claims)
}

pub fn session_cookie(token: &str) -> String {
    let max_age = session_days() * 24 * 60 * 60;
    let mut cookie = format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Strict",
        SESSION_COOKIE, token, max_age
    );
    if !is_development() {
        cookie.push_str("; Secure");
    }
    cookie
}

pub fn expired_cookie() -> String {
    format!("{}=; Path=/; Max-Age=0; HttpOnly; SameSite=Strict", SESSION_COOKIE)
}

fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}

/// Token from the session cookie, falling back to a bearer header.
pub fn token_from_request(req: &Request) -> Option<String> {
    let from_cookie = req
        .header("cookie")
        .and_then(|h| h.as_str())
        .and_then(|h| cookie_value(h, SESSION_COOKIE))
        .filter(|v| !v.is_empty());
    if let Some(token) = from_cookie {
        return Some(token.to_string());
    }
    req.header("authorization")
        .and_then(|h| h.as_str())
        .and_then(|h| h.strip_prefix("Bearer "))
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

pub fn is_revoked<S: DocumentStore>(store: &S, claims: &Claims) -> anyhow::Result<bool> {
    Ok(store.get(&revoked_token_key(&claims.jti))?.is_some())
}

/// Records `claims` as revoked and drops records whose token has expired,
/// since `decode_token` already rejects those. Returns how many were dropped.
pub fn revoke<S: DocumentStore>(store: &S, claims: &Claims) -> Result<usize, ApiError> {
    let cutoff = now().timestamp();
    store.transaction(|txn| -> Result<usize, ApiError> {
        let records: Vec<RevokedToken> = txn.get_json(REVOKED_TOKENS_KEY)?.unwrap_or_default();
        let (mut live, expired): (Vec<_>, Vec<_>) =
            records.into_iter().partition(|r| r.expires_at > cutoff);
        for record in &expired {
            txn.delete(&revoked_token_key(&record.jti));
        }

        if claims.exp > cutoff && !live.iter().any(|r| r.jti == claims.jti) {
            let record = RevokedToken {
                jti: claims.jti.clone(),
                user_id: claims.sub.clone(),
                expires_at: claims.exp,
            };
            txn.set_json(&revoked_token_key(&record.jti), &record)?;
            live.push(record);
        }
        txn.set_json(REVOKED_TOKENS_KEY, &live)?;
        Ok(expired.len())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryStore;

    #[test]
    fn issued_tokens_decode_to_their_subject() {
        let token = issue_token("user-1").unwrap();
        let claims = decode_token(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn tampered_tokens_are_rejected() {
        let mine: Vec<String> = issue_token("user-1").unwrap().split('.').map(String::from).collect();
        let theirs: Vec<String> = issue_token("user-2").unwrap().split('.').map(String::from).collect();
        let forged = format!("{}.{}.{}", mine[0], theirs[1], mine[2]);
        assert!(decode_token(&forged).is_none());
        assert!(decode_token("garbage").is_none());
    }

    #[test]
    fn cookie_lookup() {
        assert_eq!(cookie_value("a=1; jwt=abc; b=2", "jwt"), Some("abc"));
        assert_eq!(cookie_value("jwt=abc", "jwt"), Some("abc"));
        assert_eq!(cookie_value("xjwt=abc", "jwt"), None);
    }

    #[test]
    fn session_cookie_is_http_only() {
        let cookie = session_cookie("tok");
        assert!(cookie.starts_with("jwt=tok;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(expired_cookie().contains("Max-Age=0"));
    }

    #[test]
    fn revoked_tokens_are_remembered() {
        let store = MemoryStore::new();
        let claims = decode_token(&issue_token("user-1").unwrap()).unwrap();
        assert!(!is_revoked(&store, &claims).unwrap());
        revoke(&store, &claims).unwrap();
        revoke(&store, &claims).unwrap();
        assert!(is_revoked(&store, &claims).unwrap());

        let index: Vec<RevokedToken> = store.get_json(REVOKED_TOKENS_KEY).unwrap().unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn expired_revocations_are_pruned() {
        let store = MemoryStore::new();
        let past = now().timestamp() - 60;
        let stale = Claims {
            sub: "user-1".into(),
            iat: past - 3600,
            iat_ms: (past - 3600) * 1000,
            exp: past,
            jti: new_id(),
        };
        let old = RevokedToken {
            jti: stale.jti.clone(),
            user_id: stale.sub.clone(),
            expires_at: stale.exp,
        };
        store.set_json(&revoked_token_key(&old.jti), &old).unwrap();
        store.set_json(REVOKED_TOKENS_KEY, &vec![old]).unwrap();

        let live = decode_token(&issue_token("user-2").unwrap()).unwrap();
        assert_eq!(revoke(&store, &live).unwrap(), 1);
        assert!(!is_revoked(&store, &stale).unwrap());
        assert!(is_revoked(&store, &live).unwrap());

        // An already-expired token leaves nothing behind.
        let mut expired = stale.clone();
        expired.jti = new_id();
        revoke(&store, &expired).unwrap();
        assert!(!is_revoked(&store, &expired).unwrap());
        let index: Vec<RevokedToken> = store.get_json(REVOKED_TOKENS_KEY).unwrap().unwrap();
        assert_eq!(index.len(), 1);
    }
}
