//! ConversationStore — the persistence collaborator.
//!
//! Durability is delegated entirely to an external store; the engine's
//! in-memory `Conversation` is a cache over it, not the source of truth.
//! The engine persists periodically and on terminal decisions so a crash
//! mid-turn never corrupts durable history.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::StoreError;
use crate::message::{Conversation, ConversationId};

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Persist the full conversation snapshot.
    async fn save(&self, conversation: &Conversation) -> Result<(), StoreError>;

    /// Load a conversation by id, or `None` if it was never saved.
    async fn load(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError>;
}

/// Map-backed store. The reference implementation used by tests and by
/// deployments that accept losing history on restart.
#[derive(Default)]
pub struct InMemoryStore {
    conversations: Mutex<HashMap<ConversationId, Conversation>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.conversations.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn save(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.conversations
            .lock()
            .unwrap()
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn load(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.lock().unwrap().get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let store = InMemoryStore::new();
        let id = ConversationId::from("conv_1");
        let mut conv = Conversation::new(id.clone());
        conv.push(Message::user("hello"));

        store.save(&conv).await.unwrap();
        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.id, id);
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let store = InMemoryStore::new();
        let loaded = store.load(&ConversationId::from("nope")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn save_overwrites_previous_snapshot() {
        let store = InMemoryStore::new();
        let id = ConversationId::from("conv_1");
        let mut conv = Conversation::new(id.clone());

        store.save(&conv).await.unwrap();
        conv.push(Message::user("second"));
        store.save(&conv).await.unwrap();

        assert_eq!(store.len(), 1);
        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 1);
    }
}
