pub mod config;
pub mod conversation;
pub mod directory;
pub mod error;
pub mod event;
pub mod messaging;
pub mod monitor;
pub mod policy;
pub mod progress;
pub mod time;
pub mod timer;
pub mod transfer;

#[cfg(test)]
mod tests;

use config::CoreConfig;
use conversation::ConversationChannel;
use directory::AccountDirectory;
use monitor::TransferListRegistry;
use policy::Policy;
use progress::TransferProgress;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use transfer::TransferService;

/// Wires the collaborators together and caches one conversation channel per
/// identity pair. Creation and reuse only; callers decide when a conversation
/// is no longer referenced.
#[derive(Clone)]
pub struct Core {
    config: CoreConfig,
    policy: Policy,
    directory: Arc<dyn AccountDirectory>,
    transfer_service: Arc<dyn TransferService>,
    transfers: TransferListRegistry,
    conversations: Arc<Mutex<HashMap<(String, String), ConversationChannel>>>,
}

impl Core {
    pub fn init(
        config: CoreConfig,
        policy: Policy,
        directory: Arc<dyn AccountDirectory>,
        transfer_service: Arc<dyn TransferService>,
    ) -> Self {
        let transfers = TransferListRegistry::new(transfer_service.clone(), &policy);
        Self {
            config,
            policy,
            directory,
            transfer_service,
            transfers,
            conversations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn conversation(&self, local_uid: &str, remote_uid: &str) -> ConversationChannel {
        let mut conversations = self.conversations.lock().await;
        conversations
            .entry((local_uid.to_string(), remote_uid.to_string()))
            .or_insert_with(|| {
                ConversationChannel::new(
                    local_uid,
                    remote_uid,
                    self.directory.clone(),
                    &self.config,
                    self.policy.clone(),
                )
            })
            .clone()
    }

    pub async fn release_conversation(&self, local_uid: &str, remote_uid: &str) {
        self.conversations
            .lock()
            .await
            .remove(&(local_uid.to_string(), remote_uid.to_string()));
    }

    pub async fn conversation_count(&self) -> usize {
        self.conversations.lock().await.len()
    }

    /// One-shot send: get-or-create the conversation and queue the message.
    pub async fn send_text(
        &self,
        local_uid: &str,
        remote_uid: &str,
        text: &str,
        event_id: Option<i64>,
    ) -> ConversationChannel {
        let channel = self.conversation(local_uid, remote_uid).await;
        channel.send_message(text, event_id).await;
        channel
    }

    pub fn transfer_progress(&self) -> TransferProgress {
        TransferProgress::new(
            self.transfer_service.clone(),
            self.transfers.clone(),
            self.config.event_capacity,
        )
    }
}
