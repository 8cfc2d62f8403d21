use http::StatusCode;
use serde::Deserialize;
use spin_sdk::http::{Request, Response};
use tracing::info;

use crate::config::{email_key, user_key, username_key, MIN_PASSWORD_LENGTH, USERS_LIST_KEY};
use crate::core::errors::ApiError;
use crate::core::helpers::{
    hash_password, is_valid_email, json_response, json_response_with_cookie, message, new_id, now,
    parse_json, sanitize_text, verify_password,
};
use crate::core::store::DocumentStore;
use crate::models::models::{Claims, PublicUser, User};
use crate::session::{
    decode_token, expired_cookie, is_revoked, issue_token, revoke, session_cookie, token_from_request,
};

const INVALID_CREDENTIALS: &str = "Invalid username or password";

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SignupRequest {
    username: Option<String>,
    full_name: Option<String>,
    email: Option<String>,
    password: Option<String>,
}

#[derive(Deserialize, Default)]
struct LoginRequest {
    username: Option<String>,
    password: Option<String>,
}

fn username_taken() -> ApiError {
    ApiError::conflict("Username is already taken")
}

fn email_taken() -> ApiError {
    ApiError::conflict("Email is already taken")
}

fn check_unique<S: DocumentStore>(store: &S, username: &str, email: &str) -> Result<(), ApiError> {
    if store.get(&username_key(username))?.is_some() {
        return Err(username_taken());
    }
    if store.get(&email_key(email))?.is_some() {
        return Err(email_taken());
    }
    Ok(())
}

/// Creates an account. The returned user carries the password hash; callers
/// hand out `PublicUser` only.
pub fn register<S: DocumentStore>(
    store: &S,
    username: &str,
    full_name: &str,
    email: &str,
    password: &str,
) -> Result<User, ApiError> {
    if [username, full_name, email, password].iter().any(|f| f.trim().is_empty()) {
        return Err(ApiError::bad_request("Please fill up all fields."));
    }
    if !is_valid_email(email) {
        return Err(ApiError::bad_request("Invalid email format"));
    }
    check_unique(store, username, email)?;
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(ApiError::bad_request(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }

    let created = now();
    let user = User {
        id: new_id(),
        username: username.to_string(),
        full_name: sanitize_text(full_name),
        email: email.to_string(),
        password: hash_password(password)?,
        followers: Vec::new(),
        following: Vec::new(),
        profile_img: String::new(),
        cover_img: String::new(),
        bio: String::new(),
        link: String::new(),
        liked_posts: Vec::new(),
        password_changed_at: None,
        created_at: created,
        updated_at: created,
    };

    store.transaction(|txn| -> Result<(), ApiError> {
        // Re-check under the transaction: another signup may have won the race.
        if txn.get(&username_key(&user.username))?.is_some() {
            return Err(username_taken());
        }
        if txn.get(&email_key(&user.email))?.is_some() {
            return Err(email_taken());
        }
        txn.set_json(&user_key(&user.id), &user)?;
        txn.set_json(&username_key(&user.username), &user.id)?;
        txn.set_json(&email_key(&user.email), &user.id)?;

        let mut users: Vec<String> = txn.get_json(USERS_LIST_KEY)?.unwrap_or_default();
        users.push(user.id.clone());
        txn.set_json(USERS_LIST_KEY, &users)?;
        Ok(())
    })?;

    info!(user_id = %user.id, username = %user.username, "account created");
    Ok(user)
}

pub fn find_by_username<S: DocumentStore>(store: &S, username: &str) -> anyhow::Result<Option<User>> {
    match store.get_json::<String>(&username_key(username))? {
        Some(id) => store.get_json(&user_key(&id)),
        None => Ok(None),
    }
}

/// Unknown usernames and wrong passwords fail the same way.
pub fn authenticate<S: DocumentStore>(store: &S, username: &str, password: &str) -> Result<User, ApiError> {
    let user = find_by_username(store, username)?;
    match user {
        Some(user) if verify_password(password, &user.password) => Ok(user),
        _ => Err(ApiError::unauthorized(INVALID_CREDENTIALS)),
    }
}

fn predates_password_change(claims: &Claims, user: &User) -> bool {
    user.password_changed_at
        .is_some_and(|changed| claims.iat_ms < changed.timestamp_millis())
}

/// Resolves the session on a protected route.
pub fn current_user<S: DocumentStore>(store: &S, req: &Request) -> Result<User, ApiError> {
    let invalid = || ApiError::unauthorized("Unauthorized: Invalid token");

    let token = token_from_request(req)
        .ok_or_else(|| ApiError::unauthorized("Unauthorized: No token provided"))?;
    let claims = decode_token(&token).ok_or_else(invalid)?;
    if is_revoked(store, &claims)? {
        return Err(invalid());
    }
    let user: User = store.get_json(&user_key(&claims.sub))?.ok_or_else(invalid)?;
    if predates_password_change(&claims, &user) {
        return Err(invalid());
    }
    Ok(user)
}

// === HTTP Handlers ===

pub fn signup<S: DocumentStore>(store: &S, req: &Request) -> Result<Response, ApiError> {
    let body: SignupRequest = parse_json(req)?;
    let user = register(
        store,
        body.username.as_deref().unwrap_or_default(),
        body.full_name.as_deref().unwrap_or_default(),
        body.email.as_deref().unwrap_or_default(),
        body.password.as_deref().unwrap_or_default(),
    )?;
    let token = issue_token(&user.id)?;
    json_response_with_cookie(
        StatusCode::CREATED,
        &PublicUser::from(&user),
        Some(session_cookie(&token)),
    )
}

pub fn login<S: DocumentStore>(store: &S, req: &Request) -> Result<Response, ApiError> {
    let body: LoginRequest = parse_json(req)?;
    let user = authenticate(
        store,
        body.username.as_deref().unwrap_or_default(),
        body.password.as_deref().unwrap_or_default(),
    )?;
    let token = issue_token(&user.id)?;
    info!(user_id = %user.id, "logged in");
    json_response_with_cookie(
        StatusCode::OK,
        &PublicUser::from(&user),
        Some(session_cookie(&token)),
    )
}

pub fn logout<S: DocumentStore>(store: &S, req: &Request) -> Result<Response, ApiError> {
    if let Some(claims) = token_from_request(req).and_then(|t| decode_token(&t)) {
        let pruned = revoke(store, &claims)?;
        info!(user_id = %claims.sub, pruned, "logged out");
    }
    json_response_with_cookie(
        StatusCode::OK,
        &message("Logged out successfully"),
        Some(expired_cookie()),
    )
}

pub fn me<S: DocumentStore>(store: &S, req: &Request) -> Result<Response, ApiError> {
    let user = current_user(store, req)?;
    json_response(StatusCode::OK, &PublicUser::from(&user))
}
