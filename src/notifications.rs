use std::collections::HashMap;

use http::StatusCode;
use spin_sdk::http::{Request, Response};
use tracing::info;

use crate::auth::current_user;
use crate::config::{notification_key, notifications_key, user_key};
use crate::core::errors::ApiError;
use crate::core::helpers::{json_response, message, new_id, now};
use crate::core::store::{DocumentStore, Transaction};
use crate::models::models::{Notification, NotificationSender, NotificationType, NotificationView, User};

/// Stages a new notification inside an ongoing transaction.
pub fn push(
    txn: &mut Transaction<'_>,
    from: &str,
    to: &str,
    kind: NotificationType,
) -> anyhow::Result<Notification> {
    let notification = Notification {
        id: new_id(),
        from: from.to_string(),
        to: to.to_string(),
        kind,
        read: false,
        created_at: now(),
    };
    txn.set_json(&notification_key(&notification.id), &notification)?;

    let list_key = notifications_key(to);
    let mut ids: Vec<String> = txn.get_json(&list_key)?.unwrap_or_default();
    ids.insert(0, notification.id.clone());
    txn.set_json(&list_key, &ids)?;

    Ok(notification)
}

fn load_for<S: DocumentStore>(store: &S, user_id: &str) -> anyhow::Result<Vec<Notification>> {
    let ids: Vec<String> = store.get_json(&notifications_key(user_id))?.unwrap_or_default();
    let mut notifications = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(n) = store.get_json::<Notification>(&notification_key(&id))? {
            notifications.push(n);
        }
    }
    notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(notifications)
}

/// Notifications addressed to `user_id`, newest first, as they were before
/// this call marked them read.
pub fn list<S: DocumentStore>(store: &S, user_id: &str) -> Result<Vec<NotificationView>, ApiError> {
    let notifications = load_for(store, user_id)?;

    let mut senders: HashMap<String, Option<NotificationSender>> = HashMap::new();
    let mut views = Vec::with_capacity(notifications.len());
    for n in &notifications {
        if !senders.contains_key(&n.from) {
            let sender = store
                .get_json::<User>(&user_key(&n.from))?
                .map(|u| NotificationSender {
                    id: u.id,
                    username: u.username,
                    profile_img: u.profile_img,
                });
            senders.insert(n.from.clone(), sender);
        }
        views.push(NotificationView {
            id: n.id.clone(),
            from: senders.get(&n.from).cloned().flatten(),
            to: n.to.clone(),
            kind: n.kind,
            read: n.read,
            created_at: n.created_at,
        });
    }

    let unread: Vec<&Notification> = notifications.iter().filter(|n| !n.read).collect();
    if !unread.is_empty() {
        store.transaction(|txn| -> Result<(), ApiError> {
            for n in unread {
                let key = notification_key(&n.id);
                if let Some(mut current) = txn.get_json::<Notification>(&key)? {
                    current.read = true;
                    txn.set_json(&key, &current)?;
                }
            }
            Ok(())
        })?;
    }

    Ok(views)
}

pub fn delete_all<S: DocumentStore>(store: &S, user_id: &str) -> Result<usize, ApiError> {
    store.transaction(|txn| -> Result<usize, ApiError> {
        let list_key = notifications_key(user_id);
        let ids: Vec<String> = txn.get_json(&list_key)?.unwrap_or_default();
        for id in &ids {
            txn.delete(&notification_key(id));
        }
        txn.delete(&list_key);
        Ok(ids.len())
    })
}

// === HTTP Handlers ===

pub fn get_notifications<S: DocumentStore>(store: &S, req: &Request) -> Result<Response, ApiError> {
    let user = current_user(store, req)?;
    let views = list(store, &user.id)?;
    json_response(StatusCode::OK, &views)
}

pub fn delete_notifications<S: DocumentStore>(store: &S, req: &Request) -> Result<Response, ApiError> {
    let user = current_user(store, req)?;
    let removed = delete_all(store, &user.id)?;
    info!(user_id = %user.id, removed, "notifications deleted");
    json_response(StatusCode::OK, &message("Notifications deleted successfully"))
}
