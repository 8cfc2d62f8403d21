//! Social network backend: accounts, posts, likes, comments, follows and
//! notifications over a document store.
//!
//! All routes go through [`route`], which the Spin component (`wasm32`) and
//! the native actix server (`server`) share.

use spin_sdk::http::{Method, Request, Response};
use tracing::debug;

pub mod auth;
pub mod config;
pub mod core;
pub mod follow;
pub mod images;
pub mod models;
pub mod notifications;
pub mod posts;
pub mod session;
pub mod users;

#[cfg(not(target_arch = "wasm32"))]
pub mod server;

use crate::core::errors::ApiError;
use crate::core::helpers::path_param;
use crate::core::store::DocumentStore;

/// Routes are served both bare and under `/api`.
fn normalize(path: &str) -> &str {
    let path = match path.strip_prefix("/api") {
        Some(rest) if rest.starts_with('/') => rest,
        _ => path,
    };
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}

pub fn route<S: DocumentStore>(store: &S, req: Request) -> Response {
    let full_path = req.path().to_string();
    let path = normalize(&full_path);

    let result = match (req.method(), path) {
        (Method::Post, "/auth/signup") => auth::signup(store, &req),
        (Method::Post, "/auth/login") => auth::login(store, &req),
        (Method::Post, "/auth/logout") => auth::logout(store, &req),
        (Method::Get, "/auth/me") => auth::me(store, &req),

        (Method::Get, "/posts/all") => posts::handle_all(store, &req),
        (Method::Get, "/posts/following") => posts::handle_following(store, &req),
        (Method::Post, "/posts/create") => posts::handle_create(store, &req),
        (Method::Get, p) if p.starts_with("/posts/user/") => {
            posts::handle_user_posts(store, &req, path_param(p, "/posts/user/"))
        }
        (Method::Get, p) if p.starts_with("/posts/likes/") => {
            posts::handle_liked(store, &req, path_param(p, "/posts/likes/"))
        }
        (Method::Post, p) if p.starts_with("/posts/like/") => {
            posts::handle_like(store, &req, path_param(p, "/posts/like/"))
        }
        (Method::Post, p) if p.starts_with("/posts/comment/") => {
            posts::handle_comment(store, &req, path_param(p, "/posts/comment/"))
        }
        (Method::Delete, p) if p.starts_with("/posts/") => {
            posts::handle_delete(store, &req, path_param(p, "/posts/"))
        }

        (Method::Get, "/users/suggested") => users::handle_suggested(store, &req),
        (Method::Post, "/users/update") => users::handle_update(store, &req),
        (Method::Get, p) if p.starts_with("/users/profile/") => {
            users::handle_get_profile(store, &req, path_param(p, "/users/profile/"))
        }
        (Method::Post, p) if p.starts_with("/users/follow/") => {
            follow::handle_follow(store, &req, path_param(p, "/users/follow/"))
        }

        (Method::Get, "/notifications") => notifications::get_notifications(store, &req),
        (Method::Delete, "/notifications") => notifications::delete_notifications(store, &req),

        (Method::Get, p) if p.starts_with("/images/") => path_param(p, "/images/")
            .ok_or_else(|| ApiError::not_found("Image not found"))
            .and_then(|file| images::serve(store, &file)),

        _ => Err(ApiError::not_found("No route found")),
    };

    let response = result.unwrap_or_else(Response::from);
    debug!(path = %full_path, status = *response.status(), "request handled");
    response
}

// === Component entrypoint ===
#[cfg(target_arch = "wasm32")]
#[spin_sdk::http_component]
fn handle(req: Request) -> anyhow::Result<Response> {
    let store = crate::core::store::SpinStore::open_default()?;
    Ok(route(&store, req))
}
