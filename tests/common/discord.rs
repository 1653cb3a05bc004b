//! In-memory Discord collaborator.

use async_trait::async_trait;
use dibd::discord::{DiscordApi, DiscordError, Identity};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub struct FakeDiscord {
    posts: Mutex<Vec<(String, String)>>,
    users: Mutex<HashMap<String, Identity>>,
    /// Per-user visible Discord channels; users not listed see everything.
    visibility: Mutex<HashMap<String, Vec<String>>>,
    fail_posts: AtomicBool,
    closed: AtomicBool,
}

#[allow(dead_code)]
impl FakeDiscord {
    pub fn posts(&self) -> Vec<(String, String)> {
        self.posts.lock().clone()
    }

    pub fn posts_to(&self, channel: &str) -> Vec<String> {
        self.posts
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub fn add_user(&self, identity: Identity) {
        self.users.lock().insert(identity.id.clone(), identity);
    }

    pub fn set_visible(&self, user: &str, channels: &[&str]) {
        self.visibility
            .lock()
            .insert(user.to_string(), channels.iter().map(|c| c.to_string()).collect());
    }

    pub fn fail_posts(&self, fail: bool) {
        self.fail_posts.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiscordApi for FakeDiscord {
    async fn user(&self, id: &str) -> Result<Identity, DiscordError> {
        self.users
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| DiscordError::UnknownUser(id.to_string()))
    }

    async fn post_message(&self, channel_id: &str, text: &str) -> Result<(), DiscordError> {
        if self.fail_posts.load(Ordering::SeqCst) {
            return Err(DiscordError::Status {
                status: 500,
                route: format!("/channels/{channel_id}/messages"),
            });
        }
        self.posts
            .lock()
            .push((channel_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn open_dm_channel(&self, user_id: &str) -> Result<String, DiscordError> {
        Ok(format!("dm-{user_id}"))
    }

    async fn visible_channels(
        &self,
        user_id: &str,
        candidates: &[String],
    ) -> Result<Vec<String>, DiscordError> {
        let visibility = self.visibility.lock();
        Ok(match visibility.get(user_id) {
            Some(visible) => candidates
                .iter()
                .filter(|c| visible.contains(c))
                .cloned()
                .collect(),
            None => candidates.to_vec(),
        })
    }

    async fn close(&self) -> Result<(), DiscordError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
