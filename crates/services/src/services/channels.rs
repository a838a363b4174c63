//! Outbound channel dispatch. Channel kinds are a closed enum; every
//! dispatch site is an exhaustive match against the registry, never a
//! dynamic handler probe. The clients themselves live outside this core
//! and are injected.

use std::sync::Arc;

use async_trait::async_trait;
use db::models::queue_item::QueueItemKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("rate limited by provider")]
    RateLimited,
    #[error("provider error: {0}")]
    Provider(String),
    #[error("network error: {0}")]
    Network(String),
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential backend error: {0}")]
    Backend(String),
}

/// Usage/limit bucket for a channel kind.
pub fn action_name(kind: QueueItemKind) -> &'static str {
    match kind {
        QueueItemKind::Reply => "publish_reply",
        QueueItemKind::Post => "publish_post",
        QueueItemKind::Email => "publish_email",
        QueueItemKind::Blog => "publish_blog",
        QueueItemKind::Instagram => "publish_instagram",
    }
}

/// Character budget enforced before send, never after. Long-form channels
/// carry no budget.
pub fn char_budget(kind: QueueItemKind) -> Option<usize> {
    match kind {
        QueueItemKind::Reply | QueueItemKind::Post => Some(280),
        QueueItemKind::Instagram => Some(2200),
        QueueItemKind::Email | QueueItemKind::Blog => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelPayload {
    pub workspace_id: Uuid,
    pub kind: QueueItemKind,
    pub text: String,
    pub thread_key: Option<String>,
    pub author_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelReceipt {
    pub external_id: String,
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait ChannelClient: Send + Sync {
    async fn publish(
        &self,
        access_token: &str,
        payload: &ChannelPayload,
    ) -> Result<ChannelReceipt, ChannelError>;
}

/// Returns a currently valid access token for the workspace's upstream
/// account, or `None` when the credential is absent or beyond renewal.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self, workspace_id: Uuid) -> Result<Option<String>, CredentialError>;
}

/// Injected clients per channel. A kind with no client is a disabled
/// channel and fails admission rather than dispatch.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    short_form: Option<Arc<dyn ChannelClient>>,
    email: Option<Arc<dyn ChannelClient>>,
    blog: Option<Arc<dyn ChannelClient>>,
    instagram: Option<Arc<dyn ChannelClient>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replies and top-level posts share the primary short-form client.
    pub fn with_short_form(mut self, client: Arc<dyn ChannelClient>) -> Self {
        self.short_form = Some(client);
        self
    }

    pub fn with_email(mut self, client: Arc<dyn ChannelClient>) -> Self {
        self.email = Some(client);
        self
    }

    pub fn with_blog(mut self, client: Arc<dyn ChannelClient>) -> Self {
        self.blog = Some(client);
        self
    }

    pub fn with_instagram(mut self, client: Arc<dyn ChannelClient>) -> Self {
        self.instagram = Some(client);
        self
    }

    pub fn client_for(&self, kind: QueueItemKind) -> Option<Arc<dyn ChannelClient>> {
        match kind {
            QueueItemKind::Reply | QueueItemKind::Post => self.short_form.clone(),
            QueueItemKind::Email => self.email.clone(),
            QueueItemKind::Blog => self.blog.clone(),
            QueueItemKind::Instagram => self.instagram.clone(),
        }
    }
}

/// Truncate by character count, not bytes, so a multibyte grapheme near
/// the boundary cannot push the payload over the provider limit.
pub fn truncate_chars(text: &str, budget: usize) -> String {
    if text.chars().count() <= budget {
        return text.to_string();
    }
    text.chars().take(budget).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_counts_chars_not_bytes() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        // 4 two-byte chars, budget 2 chars.
        assert_eq!(truncate_chars("éééé", 2), "éé");
    }

    #[test]
    fn short_form_budget_applies_to_replies_and_posts() {
        assert_eq!(char_budget(QueueItemKind::Reply), Some(280));
        assert_eq!(char_budget(QueueItemKind::Post), Some(280));
        assert_eq!(char_budget(QueueItemKind::Blog), None);
    }

    #[test]
    fn empty_registry_disables_every_kind() {
        let registry = ChannelRegistry::new();
        assert!(registry.client_for(QueueItemKind::Reply).is_none());
        assert!(registry.client_for(QueueItemKind::Email).is_none());
        assert!(registry.client_for(QueueItemKind::Instagram).is_none());
    }
}
