use crate::error::CoreError;
use crate::messaging::ConversationEndpoint;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Resolves a local identity into a conversation-capable endpoint.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn resolve(&self, local_uid: &str) -> Result<Arc<dyn ConversationEndpoint>, CoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    accounts: Arc<Mutex<HashMap<String, Arc<dyn ConversationEndpoint>>>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, local_uid: &str, endpoint: Arc<dyn ConversationEndpoint>) {
        self.accounts
            .lock()
            .await
            .insert(local_uid.to_string(), endpoint);
    }
}

#[async_trait]
impl AccountDirectory for InMemoryDirectory {
    async fn resolve(&self, local_uid: &str) -> Result<Arc<dyn ConversationEndpoint>, CoreError> {
        self.accounts
            .lock()
            .await
            .get(local_uid)
            .cloned()
            .ok_or_else(|| CoreError::Resolution(local_uid.to_string()))
    }
}
