use crate::auth::{find_by_username, register};
use crate::core::errors::ApiError;
use crate::core::store::DocumentStore;
use crate::follow::{get_followings, toggle_follow};
use crate::models::models::User;
use crate::posts::create_post;

const DEMO_PASSWORD: &str = "password";

struct DemoUser {
    username: &'static str,
    full_name: &'static str,
    bio: &'static str,
    posts: &'static [&'static str],
}

const DEMO_USERS: &[DemoUser] = &[
    DemoUser {
        username: "test",
        full_name: "Test User",
        bio: "Test user bio",
        posts: &["This is my first post on Plaza!"],
    },
    DemoUser {
        username: "alice",
        full_name: "Alice",
        bio: "Hello, I'm Alice!",
        posts: &[
            "Welcome to my board! Excited to share thoughts here.",
            "Just finished an amazing project. Feeling productive today!",
        ],
    },
    DemoUser {
        username: "bob",
        full_name: "Bob",
        bio: "Bob's corner of the internet",
        posts: &["Hey everyone! Just joined Plaza, looking forward to connecting with you all."],
    },
];

fn ensure_user<S: DocumentStore>(store: &S, demo: &DemoUser) -> Result<User, ApiError> {
    if let Some(existing) = find_by_username(store, demo.username)? {
        return Ok(existing);
    }

    let mut user = register(
        store,
        demo.username,
        demo.full_name,
        &format!("{}@example.com", demo.username),
        DEMO_PASSWORD,
    )?;
    user.bio = demo.bio.to_string();
    store.set_json(&crate::config::user_key(&user.id), &user)?;

    for text in demo.posts {
        create_post(store, &user.id, Some(text.to_string()), None)?;
    }
    Ok(user)
}

/// Creates the demo accounts and posts. Safe to call on every start.
pub fn seed_demo_data<S: DocumentStore>(store: &S) -> Result<(), ApiError> {
    let mut users = Vec::with_capacity(DEMO_USERS.len());
    for demo in DEMO_USERS {
        users.push(ensure_user(store, demo)?);
    }

    // "test" follows "bob".
    let test = &users[0];
    let bob = &users[2];
    if !get_followings(store, &test.id)?.contains(&bob.id) {
        toggle_follow(store, &test.id, &bob.id)?;
    }
    Ok(())
}
