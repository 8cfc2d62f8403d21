use http::StatusCode;
use serde::Serialize;
use spin_sdk::http::{Request, Response};
use tracing::info;

use crate::auth::current_user;
use crate::config::user_key;
use crate::core::errors::ApiError;
use crate::core::helpers::{json_response, now, require_uuid};
use crate::core::store::DocumentStore;
use crate::models::models::{NotificationType, User};
use crate::notifications;

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FollowOutcome {
    pub following: bool,
    pub current_user_following: usize,
    pub target_user_followers: usize,
}

/// Flips whether `follower_id` follows `target_id`, keeping both users'
/// `following`/`followers` sets in step. Only the follow direction notifies.
pub fn toggle_follow<S: DocumentStore>(
    store: &S,
    follower_id: &str,
    target_id: &str,
) -> Result<FollowOutcome, ApiError> {
    store.transaction(|txn| -> Result<FollowOutcome, ApiError> {
        let not_found = || ApiError::not_found("User not found");
        let mut follower: User = txn.get_json(&user_key(follower_id))?.ok_or_else(not_found)?;
        let mut target: User = txn.get_json(&user_key(target_id))?.ok_or_else(not_found)?;

        if follower.id == target.id {
            return Err(ApiError::bad_request("You cannot follow or unfollow yourself"));
        }

        let now_following = if follower.following.contains(&target.id) {
            follower.following.retain(|id| id != &target.id);
            target.followers.retain(|id| id != &follower.id);
            false
        } else {
            follower.following.push(target.id.clone());
            if !target.followers.contains(&follower.id) {
                target.followers.push(follower.id.clone());
            }
            true
        };

        let updated = now();
        follower.updated_at = updated;
        target.updated_at = updated;
        txn.set_json(&user_key(&follower.id), &follower)?;
        txn.set_json(&user_key(&target.id), &target)?;

        if now_following {
            notifications::push(txn, &follower.id, &target.id, NotificationType::Follow)?;
        }

        Ok(FollowOutcome {
            following: now_following,
            current_user_following: follower.following.len(),
            target_user_followers: target.followers.len(),
        })
    })
}

pub fn get_followings<S: DocumentStore>(store: &S, user_id: &str) -> anyhow::Result<Vec<String>> {
    Ok(store
        .get_json::<User>(&user_key(user_id))?
        .map(|u| u.following)
        .unwrap_or_default())
}

// === HTTP Handlers ===

pub fn handle_follow<S: DocumentStore>(
    store: &S,
    req: &Request,
    target: Option<String>,
) -> Result<Response, ApiError> {
    let user = current_user(store, req)?;
    let target_id = require_uuid(target, "user")?;

    let outcome = toggle_follow(store, &user.id, &target_id)?;
    info!(
        user_id = %user.id,
        target_id = %target_id,
        following = outcome.following,
        "follow toggled"
    );
    json_response(StatusCode::OK, &outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::register;
    use crate::core::store::MemoryStore;
    use crate::notifications::list;

    fn user(store: &MemoryStore, name: &str) -> String {
        register(store, name, "Full Name", &format!("{}@x.com", name), "secret1")
            .unwrap()
            .id
    }

    fn load(store: &MemoryStore, id: &str) -> User {
        store.get_json(&user_key(id)).unwrap().unwrap()
    }

    #[test]
    fn follow_mirrors_both_sets() {
        let store = MemoryStore::new();
        let ann = user(&store, "ann");
        let bob = user(&store, "bob");

        let outcome = toggle_follow(&store, &ann, &bob).unwrap();
        assert_eq!(
            outcome,
            FollowOutcome {
                following: true,
                current_user_following: 1,
                target_user_followers: 1
            }
        );
        assert_eq!(load(&store, &ann).following, vec![bob.clone()]);
        assert_eq!(load(&store, &bob).followers, vec![ann.clone()]);
        assert_eq!(get_followings(&store, &ann).unwrap(), vec![bob]);
    }

    #[test]
    fn double_toggle_restores_state_with_one_notification() {
        let store = MemoryStore::new();
        let ann = user(&store, "ann");
        let bob = user(&store, "bob");

        toggle_follow(&store, &ann, &bob).unwrap();
        let outcome = toggle_follow(&store, &ann, &bob).unwrap();
        assert!(!outcome.following);

        assert!(load(&store, &ann).following.is_empty());
        assert!(load(&store, &bob).followers.is_empty());

        let notes = list(&store, &bob).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].kind, NotificationType::Follow);
        assert!(list(&store, &ann).unwrap().is_empty());
    }

    #[test]
    fn cannot_follow_self() {
        let store = MemoryStore::new();
        let ann = user(&store, "ann");
        let err = toggle_follow(&store, &ann, &ann).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert!(load(&store, &ann).followers.is_empty());
    }

    #[test]
    fn missing_target_is_not_found() {
        let store = MemoryStore::new();
        let ann = user(&store, "ann");
        let ghost = crate::core::helpers::new_id();
        let err = toggle_follow(&store, &ann, &ghost).unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }
}
