use std::collections::HashMap;

use http::StatusCode;
use serde::Deserialize;
use spin_sdk::http::{Request, Response};
use tracing::info;

use crate::auth::{current_user, find_by_username};
use crate::config::{post_key, user_key, FEED_KEY, MAX_POST_LENGTH};
use crate::core::errors::ApiError;
use crate::core::helpers::{
    json_response, message, new_id, non_blank, now, parse_json, require_uuid, sanitize_text,
};
use crate::core::store::DocumentStore;
use crate::follow::get_followings;
use crate::images;
use crate::models::models::{
    Comment, CommentView, NotificationType, Post, PostView, PublicUser, User,
};
use crate::notifications;

#[derive(Deserialize, Default)]
struct CreatePostRequest {
    text: Option<String>,
    img: Option<String>,
}

#[derive(Deserialize, Default)]
struct CommentRequest {
    text: Option<String>,
}

fn post_not_found() -> ApiError {
    ApiError::not_found("Post not found")
}

fn check_length(text: &str) -> Result<(), ApiError> {
    if text.chars().count() > MAX_POST_LENGTH {
        return Err(ApiError::bad_request(format!(
            "Text too long (max {} chars)",
            MAX_POST_LENGTH
        )));
    }
    Ok(())
}

/// Resolves user ids to public profiles, looking each one up once.
struct ProfileCache<'a, S: DocumentStore> {
    store: &'a S,
    seen: HashMap<String, Option<PublicUser>>,
}

impl<'a, S: DocumentStore> ProfileCache<'a, S> {
    fn new(store: &'a S) -> Self {
        ProfileCache {
            store,
            seen: HashMap::new(),
        }
    }

    fn get(&mut self, id: &str) -> anyhow::Result<Option<PublicUser>> {
        if let Some(found) = self.seen.get(id) {
            return Ok(found.clone());
        }
        let profile = self
            .store
            .get_json::<User>(&user_key(id))?
            .map(|u| PublicUser::from(&u));
        self.seen.insert(id.to_string(), profile.clone());
        Ok(profile)
    }

    fn comments(&mut self, comments: &[Comment]) -> anyhow::Result<Vec<CommentView>> {
        comments
            .iter()
            .map(|c| -> anyhow::Result<CommentView> {
                Ok(CommentView {
                    id: c.id.clone(),
                    text: c.text.clone(),
                    user: self.get(&c.user)?,
                    created_at: c.created_at,
                })
            })
            .collect()
    }

    /// Posts whose author no longer resolves are left out.
    fn posts(&mut self, posts: Vec<Post>) -> anyhow::Result<Vec<PostView>> {
        let mut views = Vec::with_capacity(posts.len());
        for post in posts {
            let Some(author) = self.get(&post.user)? else {
                continue;
            };
            views.push(PostView {
                comments: self.comments(&post.comments)?,
                id: post.id,
                user: author,
                text: post.text,
                img: post.img,
                likes: post.likes,
                created_at: post.created_at,
                updated_at: post.updated_at,
            });
        }
        Ok(views)
    }
}

/// Every post in the feed index that matches `keep`, newest first.
fn collect_posts<S, F>(store: &S, mut keep: F) -> anyhow::Result<Vec<Post>>
where
    S: DocumentStore,
    F: FnMut(&Post) -> bool,
{
    let feed: Vec<String> = store.get_json(FEED_KEY)?.unwrap_or_default();
    let mut posts = Vec::new();
    for id in feed {
        if let Some(p) = store.get_json::<Post>(&post_key(&id))? {
            if keep(&p) {
                posts.push(p);
            }
        }
    }
    posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(posts)
}

fn resolve<S: DocumentStore>(store: &S, posts: Vec<Post>) -> Result<Vec<PostView>, ApiError> {
    Ok(ProfileCache::new(store).posts(posts)?)
}

pub fn create_post<S: DocumentStore>(
    store: &S,
    author_id: &str,
    text: Option<String>,
    img: Option<String>,
) -> Result<PostView, ApiError> {
    let text = non_blank(text);
    let img = non_blank(img);
    if text.is_none() && img.is_none() {
        return Err(ApiError::bad_request("A post should contain a text or img"));
    }
    if let Some(text) = &text {
        check_length(text)?;
    }

    let author: User = store
        .get_json(&user_key(author_id))?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    let img = match img {
        Some(img) => Some(images::upload(store, &img)?),
        None => None,
    };

    let created = now();
    let post = Post {
        id: new_id(),
        user: author.id.clone(),
        text: text.map(|t| sanitize_text(&t)),
        img,
        likes: Vec::new(),
        comments: Vec::new(),
        created_at: created,
        updated_at: created,
    };

    let saved = store.transaction(|txn| -> Result<(), ApiError> {
        txn.set_json(&post_key(&post.id), &post)?;
        let mut feed: Vec<String> = txn.get_json(FEED_KEY)?.unwrap_or_default();
        feed.insert(0, post.id.clone());
        txn.set_json(FEED_KEY, &feed)?;
        Ok(())
    });
    if let Err(e) = saved {
        if let Some(url) = &post.img {
            images::destroy_logged(store, url);
        }
        return Err(e);
    }

    info!(post_id = %post.id, user_id = %author.id, "post created");
    Ok(PostView {
        id: post.id,
        user: PublicUser::from(&author),
        text: post.text,
        img: post.img,
        likes: post.likes,
        comments: Vec::new(),
        created_at: post.created_at,
        updated_at: post.updated_at,
    })
}

pub fn all_posts<S: DocumentStore>(store: &S) -> Result<Vec<PostView>, ApiError> {
    resolve(store, collect_posts(store, |_| true)?)
}

pub fn following_posts<S: DocumentStore>(store: &S, user_id: &str) -> Result<Vec<PostView>, ApiError> {
    if store.get(&user_key(user_id))?.is_none() {
        return Err(ApiError::not_found("User not found"));
    }
    let followings = get_followings(store, user_id)?;
    resolve(store, collect_posts(store, |p| followings.contains(&p.user))?)
}

pub fn user_posts<S: DocumentStore>(store: &S, username: &str) -> Result<Vec<PostView>, ApiError> {
    let user = find_by_username(store, username)?.ok_or_else(|| ApiError::not_found("User not found"))?;
    resolve(store, collect_posts(store, |p| p.user == user.id)?)
}

pub fn liked_posts<S: DocumentStore>(store: &S, user_id: &str) -> Result<Vec<PostView>, ApiError> {
    let user: User = store
        .get_json(&user_key(user_id))?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    let mut posts = Vec::with_capacity(user.liked_posts.len());
    for id in &user.liked_posts {
        if let Some(p) = store.get_json::<Post>(&post_key(id))? {
            posts.push(p);
        }
    }
    posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    resolve(store, posts)
}

/// Flips `user_id`'s like on a post, keeping `post.likes` and the user's
/// `likedPosts` in step. Returns the post's like set afterwards.
pub fn toggle_like<S: DocumentStore>(
    store: &S,
    post_id: &str,
    user_id: &str,
) -> Result<(bool, Vec<String>), ApiError> {
    store.transaction(|txn| -> Result<(bool, Vec<String>), ApiError> {
        let mut post: Post = txn.get_json(&post_key(post_id))?.ok_or_else(post_not_found)?;
        let mut user: User = txn
            .get_json(&user_key(user_id))?
            .ok_or_else(|| ApiError::not_found("User not found"))?;

        let liked = if post.likes.contains(&user.id) {
            post.likes.retain(|id| id != &user.id);
            user.liked_posts.retain(|id| id != &post.id);
            false
        } else {
            post.likes.push(user.id.clone());
            if !user.liked_posts.contains(&post.id) {
                user.liked_posts.push(post.id.clone());
            }
            true
        };

        post.updated_at = now();
        txn.set_json(&post_key(&post.id), &post)?;
        txn.set_json(&user_key(&user.id), &user)?;

        if liked {
            notifications::push(txn, &user.id, &post.user, NotificationType::Like)?;
        }
        Ok((liked, post.likes))
    })
}

pub fn add_comment<S: DocumentStore>(
    store: &S,
    post_id: &str,
    user_id: &str,
    text: Option<String>,
) -> Result<Vec<CommentView>, ApiError> {
    let text = non_blank(text).ok_or_else(|| ApiError::bad_request("Comment cannot be empty"))?;
    check_length(&text)?;

    let post = store.transaction(|txn| -> Result<Post, ApiError> {
        let mut post: Post = txn.get_json(&post_key(post_id))?.ok_or_else(post_not_found)?;
        post.comments.push(Comment {
            id: new_id(),
            text: sanitize_text(&text),
            user: user_id.to_string(),
            created_at: now(),
        });
        post.updated_at = now();
        txn.set_json(&post_key(&post.id), &post)?;
        Ok(post)
    })?;

    Ok(ProfileCache::new(store).comments(&post.comments)?)
}

/// Deletes a post owned by `user_id`, then its hosted image. The image delete
/// is best effort and does not undo the post deletion.
pub fn delete_post<S: DocumentStore>(store: &S, post_id: &str, user_id: &str) -> Result<(), ApiError> {
    let post = store.transaction(|txn| -> Result<Post, ApiError> {
        let post: Post = txn.get_json(&post_key(post_id))?.ok_or_else(post_not_found)?;
        if post.user != user_id {
            return Err(ApiError::unauthorized("You cannot delete a post you don't own"));
        }

        txn.delete(&post_key(&post.id));
        let mut feed: Vec<String> = txn.get_json(FEED_KEY)?.unwrap_or_default();
        feed.retain(|id| id != &post.id);
        txn.set_json(FEED_KEY, &feed)?;

        for liker_id in &post.likes {
            if let Some(mut liker) = txn.get_json::<User>(&user_key(liker_id))? {
                liker.liked_posts.retain(|id| id != &post.id);
                txn.set_json(&user_key(liker_id), &liker)?;
            }
        }
        Ok(post)
    })?;

    if let Some(url) = &post.img {
        images::destroy_logged(store, url);
    }
    info!(post_id = %post.id, user_id = %user_id, "post deleted");
    Ok(())
}

// === HTTP Handlers ===

pub fn handle_all<S: DocumentStore>(store: &S, req: &Request) -> Result<Response, ApiError> {
    current_user(store, req)?;
    json_response(StatusCode::OK, &all_posts(store)?)
}

pub fn handle_following<S: DocumentStore>(store: &S, req: &Request) -> Result<Response, ApiError> {
    let user = current_user(store, req)?;
    json_response(StatusCode::OK, &following_posts(store, &user.id)?)
}

pub fn handle_user_posts<S: DocumentStore>(
    store: &S,
    req: &Request,
    username: Option<String>,
) -> Result<Response, ApiError> {
    current_user(store, req)?;
    let username = username.ok_or_else(|| ApiError::bad_request("Username required"))?;
    json_response(StatusCode::OK, &user_posts(store, &username)?)
}

pub fn handle_liked<S: DocumentStore>(
    store: &S,
    req: &Request,
    user_id: Option<String>,
) -> Result<Response, ApiError> {
    current_user(store, req)?;
    let user_id = require_uuid(user_id, "user")?;
    json_response(StatusCode::OK, &liked_posts(store, &user_id)?)
}

pub fn handle_create<S: DocumentStore>(store: &S, req: &Request) -> Result<Response, ApiError> {
    let user = current_user(store, req)?;
    let body: CreatePostRequest = parse_json(req)?;
    let post = create_post(store, &user.id, body.text, body.img)?;
    json_response(StatusCode::CREATED, &post)
}

pub fn handle_like<S: DocumentStore>(
    store: &S,
    req: &Request,
    post_id: Option<String>,
) -> Result<Response, ApiError> {
    let user = current_user(store, req)?;
    let post_id = require_uuid(post_id, "post")?;
    let (liked, likes) = toggle_like(store, &post_id, &user.id)?;
    info!(post_id = %post_id, user_id = %user.id, liked, "like toggled");
    json_response(StatusCode::OK, &likes)
}

pub fn handle_comment<S: DocumentStore>(
    store: &S,
    req: &Request,
    post_id: Option<String>,
) -> Result<Response, ApiError> {
    let user = current_user(store, req)?;
    let post_id = require_uuid(post_id, "post")?;
    let body: CommentRequest = parse_json(req)?;
    let comments = add_comment(store, &post_id, &user.id, body.text)?;
    json_response(StatusCode::OK, &comments)
}

pub fn handle_delete<S: DocumentStore>(
    store: &S,
    req: &Request,
    post_id: Option<String>,
) -> Result<Response, ApiError> {
    let user = current_user(store, req)?;
    let post_id = require_uuid(post_id, "post")?;
    delete_post(store, &post_id, &user.id)?;
    json_response(StatusCode::OK, &message("Post deleted successfully"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::register;
    use crate::core::store::MemoryStore;
    use crate::follow::toggle_follow;
    use crate::notifications::list;

    const PIXEL: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    fn user(store: &MemoryStore, name: &str) -> String {
        register(store, name, "Full Name", &format!("{}@x.com", name), "secret1")
            .unwrap()
            .id
    }

    fn post(store: &MemoryStore, author: &str, text: &str) -> String {
        create_post(store, author, Some(text.to_string()), None).unwrap().id
    }

    fn load_user(store: &MemoryStore, id: &str) -> User {
        store.get_json(&user_key(id)).unwrap().unwrap()
    }

    #[test]
    fn post_needs_text_or_image() {
        let store = MemoryStore::new();
        let ann = user(&store, "ann");
        let err = create_post(&store, &ann, None, Some("  ".into())).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let view = create_post(&store, &ann, Some("hi".into()), None).unwrap();
        assert_eq!(view.text.as_deref(), Some("hi"));
        assert_eq!(view.user.username, "ann");
        assert!(view.img.is_none());
    }

    #[test]
    fn text_with_markup_characters_round_trips() {
        let store = MemoryStore::new();
        let ann = user(&store, "ann");
        let written = "1 < 2 && \"quoted\" it's";
        let id = post(&store, &ann, written);
        add_comment(&store, &id, &ann, Some("a > b".into())).unwrap();

        let all = all_posts(&store).unwrap();
        assert_eq!(all[0].text.as_deref(), Some(written));
        assert_eq!(all[0].comments[0].text, "a > b");

        let markup = create_post(&store, &ann, Some("<b>hi</b> & bye".into()), None).unwrap();
        assert_eq!(markup.text.as_deref(), Some("hi & bye"));
    }

    #[test]
    fn image_posts_store_a_url() {
        let store = MemoryStore::new();
        let ann = user(&store, "ann");
        let view = create_post(&store, &ann, None, Some(PIXEL.into())).unwrap();
        let img = view.img.unwrap();
        assert!(img.starts_with("/images/"));
        assert!(!img.contains("base64"));
    }

    #[test]
    fn feeds_are_newest_first_with_authors_inlined() {
        let store = MemoryStore::new();
        let ann = user(&store, "ann");
        let bob = user(&store, "bob");
        post(&store, &ann, "first");
        post(&store, &bob, "second");
        post(&store, &ann, "third");

        let all = all_posts(&store).unwrap();
        let texts: Vec<_> = all.iter().map(|p| p.text.clone().unwrap()).collect();
        assert_eq!(texts, vec!["third", "second", "first"]);
        assert_eq!(all[1].user.username, "bob");

        let anns = user_posts(&store, "ann").unwrap();
        assert_eq!(anns.len(), 2);
        assert!(anns.iter().all(|p| p.user.id == ann));
        assert!(matches!(user_posts(&store, "nobody"), Err(ApiError::NotFound(_))));
    }

    #[test]
    fn following_feed_only_shows_followed_authors() {
        let store = MemoryStore::new();
        let ann = user(&store, "ann");
        let bob = user(&store, "bob");
        let cat = user(&store, "cat");
        post(&store, &bob, "from bob");
        post(&store, &cat, "from cat");
        post(&store, &ann, "from ann");

        assert!(following_posts(&store, &ann).unwrap().is_empty());
        toggle_follow(&store, &ann, &bob).unwrap();
        let feed = following_posts(&store, &ann).unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].user.id, bob);
    }

    #[test]
    fn double_like_restores_state_with_one_notification() {
        let store = MemoryStore::new();
        let ann = user(&store, "ann");
        let bob = user(&store, "bob");
        let id = post(&store, &ann, "hi");

        let (liked, likes) = toggle_like(&store, &id, &bob).unwrap();
        assert!(liked);
        assert_eq!(likes, vec![bob.clone()]);
        assert_eq!(load_user(&store, &bob).liked_posts, vec![id.clone()]);
        assert_eq!(liked_posts(&store, &bob).unwrap().len(), 1);

        let (liked, likes) = toggle_like(&store, &id, &bob).unwrap();
        assert!(!liked);
        assert!(likes.is_empty());
        assert!(load_user(&store, &bob).liked_posts.is_empty());

        let notes = list(&store, &ann).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].kind, NotificationType::Like);
    }

    #[test]
    fn liking_a_missing_post_is_not_found() {
        let store = MemoryStore::new();
        let bob = user(&store, "bob");
        let err = toggle_like(&store, &new_id(), &bob).unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        assert!(load_user(&store, &bob).liked_posts.is_empty());
    }

    #[test]
    fn comments_append_with_commenter_resolved() {
        let store = MemoryStore::new();
        let ann = user(&store, "ann");
        let bob = user(&store, "bob");
        let id = post(&store, &ann, "hi");

        assert!(matches!(
            add_comment(&store, &id, &bob, Some(" ".into())),
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            add_comment(&store, &new_id(), &bob, Some("hey".into())),
            Err(ApiError::NotFound(_))
        ));

        add_comment(&store, &id, &bob, Some("one".into())).unwrap();
        let comments = add_comment(&store, &id, &ann, Some("two".into())).unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].text, "one");
        assert_eq!(comments[0].user.as_ref().unwrap().username, "bob");
        assert_eq!(comments[1].user.as_ref().unwrap().username, "ann");
    }

    #[test]
    fn only_the_author_can_delete() {
        let store = MemoryStore::new();
        let ann = user(&store, "ann");
        let bob = user(&store, "bob");
        let id = post(&store, &ann, "hi");
        toggle_like(&store, &id, &bob).unwrap();

        let err = delete_post(&store, &id, &bob).unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
        assert_eq!(all_posts(&store).unwrap().len(), 1);

        delete_post(&store, &id, &ann).unwrap();
        assert!(all_posts(&store).unwrap().is_empty());
        assert!(user_posts(&store, "ann").unwrap().is_empty());
        assert!(liked_posts(&store, &bob).unwrap().is_empty());
        assert!(load_user(&store, &bob).liked_posts.is_empty());

        assert!(matches!(delete_post(&store, &id, &ann), Err(ApiError::NotFound(_))));
    }

    #[test]
    fn deleting_a_post_deletes_its_image() {
        let store = MemoryStore::new();
        let ann = user(&store, "ann");
        let view = create_post(&store, &ann, Some("pic".into()), Some(PIXEL.into())).unwrap();
        let file = view.img.unwrap().trim_start_matches("/images/").to_string();
        assert!(images::serve(&store, &file).is_ok());

        delete_post(&store, &view.id, &ann).unwrap();
        assert!(images::serve(&store, &file).is_err());
    }
}
