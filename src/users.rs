use http::StatusCode;
use rand::seq::IteratorRandom;
use serde::Deserialize;
use spin_sdk::http::{Request, Response};
use tracing::info;

use crate::auth::{current_user, find_by_username};
use crate::config::{
    email_key, user_key, username_key, MAX_BIO_LENGTH, MIN_PASSWORD_LENGTH, SUGGESTED_USERS_SAMPLE,
    USERS_LIST_KEY,
};
use crate::core::errors::ApiError;
use crate::core::helpers::{
    hash_password, is_valid_email, json_response, json_response_with_cookie, non_blank, now,
    parse_json, sanitize_text, verify_password,
};
use crate::core::store::DocumentStore;
use crate::images;
use crate::models::models::{PublicUser, User};
use crate::session::{issue_token, session_cookie};

/// Fields a user may change on their own profile. Blank values leave the
/// current value alone.
#[derive(Deserialize, Default, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub current_password: Option<String>,
    pub new_password: Option<String>,
    pub bio: Option<String>,
    pub link: Option<String>,
    pub profile_img: Option<String>,
    pub cover_img: Option<String>,
}

pub struct UpdatedProfile {
    pub user: User,
    pub password_changed: bool,
}

pub fn get_profile<S: DocumentStore>(store: &S, username: &str) -> Result<PublicUser, ApiError> {
    find_by_username(store, username)?
        .map(|u| PublicUser::from(&u))
        .ok_or_else(|| ApiError::not_found("User not found"))
}

/// Up to four users the current user neither is nor follows.
pub fn suggested_users<S: DocumentStore>(store: &S, current: &User) -> Result<Vec<PublicUser>, ApiError> {
    let ids: Vec<String> = store.get_json(USERS_LIST_KEY)?.unwrap_or_default();
    let picked = ids
        .into_iter()
        .filter(|id| id != &current.id && !current.following.contains(id))
        .choose_multiple(&mut rand::thread_rng(), SUGGESTED_USERS_SAMPLE);

    let mut users = Vec::with_capacity(picked.len());
    for id in picked {
        if let Some(u) = store.get_json::<User>(&user_key(&id))? {
            users.push(PublicUser::from(&u));
        }
    }
    Ok(users)
}

/// Applies a profile update. New images are uploaded before anything is
/// saved and old ones are deleted only after the save succeeds.
pub fn update_profile<S: DocumentStore>(
    store: &S,
    user_id: &str,
    update: ProfileUpdate,
) -> Result<UpdatedProfile, ApiError> {
    let current_password = non_blank(update.current_password);
    let new_password = non_blank(update.new_password);
    let username = non_blank(update.username);
    let email = non_blank(update.email);
    let bio = non_blank(update.bio);
    let full_name = non_blank(update.full_name);
    let link = non_blank(update.link);

    let existing: User = store
        .get_json(&user_key(user_id))?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    let new_hash = match (current_password, new_password) {
        (None, None) => None,
        (Some(current), Some(new)) => {
            if !verify_password(&current, &existing.password) {
                return Err(ApiError::unauthorized("Current password is incorrect"));
            }
            if new.chars().count() < MIN_PASSWORD_LENGTH {
                return Err(ApiError::bad_request(format!(
                    "Password must be at least {} characters long",
                    MIN_PASSWORD_LENGTH
                )));
            }
            Some(hash_password(&new)?)
        }
        _ => {
            return Err(ApiError::bad_request(
                "Provide both current and new password fields",
            ))
        }
    };

    if let Some(email) = &email {
        if !is_valid_email(email) {
            return Err(ApiError::bad_request("Invalid email format"));
        }
    }
    if let Some(bio) = &bio {
        if bio.chars().count() > MAX_BIO_LENGTH {
            return Err(ApiError::bad_request("Bio too long (max 500 chars)"));
        }
    }

    let profile_img = match non_blank(update.profile_img) {
        Some(img) => Some(images::upload(store, &img)?),
        None => None,
    };
    let cover_img = match non_blank(update.cover_img) {
        Some(img) => match images::upload(store, &img) {
            Ok(url) => Some(url),
            Err(e) => {
                if let Some(url) = &profile_img {
                    images::destroy_logged(store, url);
                }
                return Err(e);
            }
        },
        None => None,
    };
    let uploaded: Vec<String> = profile_img.iter().chain(cover_img.iter()).cloned().collect();

    let saved = store.transaction(|txn| -> Result<(User, Vec<String>), ApiError> {
        let mut user: User = txn
            .get_json(&user_key(user_id))?
            .ok_or_else(|| ApiError::not_found("User not found"))?;
        let mut replaced = Vec::new();

        if let Some(name) = &username {
            if name != &user.username {
                if txn.get(&username_key(name))?.is_some() {
                    return Err(ApiError::conflict("Username is already taken"));
                }
                txn.delete(&username_key(&user.username));
                txn.set_json(&username_key(name), &user.id)?;
                user.username = name.clone();
            }
        }
        if let Some(email) = &email {
            if email != &user.email {
                if txn.get(&email_key(email))?.is_some() {
                    return Err(ApiError::conflict("Email is already taken"));
                }
                txn.delete(&email_key(&user.email));
                txn.set_json(&email_key(email), &user.id)?;
                user.email = email.clone();
            }
        }
        if let Some(hash) = &new_hash {
            user.password = hash.clone();
            user.password_changed_at = Some(now());
        }
        if let Some(url) = &profile_img {
            replaced.push(std::mem::replace(&mut user.profile_img, url.clone()));
        }
        if let Some(url) = &cover_img {
            replaced.push(std::mem::replace(&mut user.cover_img, url.clone()));
        }
        if let Some(full_name) = &full_name {
            user.full_name = sanitize_text(full_name);
        }
        if let Some(bio) = &bio {
            user.bio = sanitize_text(bio);
        }
        if let Some(link) = &link {
            user.link = link.clone();
        }

        user.updated_at = now();
        txn.set_json(&user_key(&user.id), &user)?;
        Ok((user, replaced))
    });

    let (user, replaced) = match saved {
        Ok(saved) => saved,
        Err(e) => {
            for url in &uploaded {
                images::destroy_logged(store, url);
            }
            return Err(e);
        }
    };
    for url in replaced.iter().filter(|u| !u.is_empty()) {
        images::destroy_logged(store, url);
    }

    Ok(UpdatedProfile {
        user,
        password_changed: new_hash.is_some(),
    })
}

// === HTTP Handlers ===

pub fn handle_get_profile<S: DocumentStore>(
    store: &S,
    req: &Request,
    username: Option<String>,
) -> Result<Response, ApiError> {
    current_user(store, req)?;
    let username = username.ok_or_else(|| ApiError::bad_request("Username required"))?;
    json_response(StatusCode::OK, &get_profile(store, &username)?)
}

pub fn handle_suggested<S: DocumentStore>(store: &S, req: &Request) -> Result<Response, ApiError> {
    let user = current_user(store, req)?;
    json_response(StatusCode::OK, &suggested_users(store, &user)?)
}

pub fn handle_update<S: DocumentStore>(store: &S, req: &Request) -> Result<Response, ApiError> {
    let user = current_user(store, req)?;
    let update: ProfileUpdate = parse_json(req)?;
    let updated = update_profile(store, &user.id, update)?;
    info!(
        user_id = %updated.user.id,
        password_changed = updated.password_changed,
        "profile updated"
    );

    // A password change invalidates older sessions, so hand out a fresh one.
    let cookie = if updated.password_changed {
        Some(session_cookie(&issue_token(&updated.user.id)?))
    } else {
        None
    };
    json_response_with_cookie(StatusCode::OK, &PublicUser::from(&updated.user), cookie)
}
