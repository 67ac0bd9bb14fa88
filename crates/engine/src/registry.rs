//! One live engine actor per conversation.
//!
//! The registry is the only place engines are started, so starting the
//! same conversation twice always lands on the same actor. Engines stop
//! themselves when idle; their dead handles stay in the map until a sweep
//! or the next `ensure`, which replaces them with a fresh actor resumed
//! from the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use hivemind_agent::AgentContext;
use hivemind_core::error::{Error, Result};
use hivemind_core::message::{Conversation, ConversationId};
use hivemind_core::store::ConversationStore;

use crate::engine::{Engine, EngineHandle, EngineState};

pub struct EngineRegistry {
    ctx: AgentContext,
    store: Arc<dyn ConversationStore>,
    engines: Mutex<HashMap<ConversationId, EngineHandle>>,
}

impl EngineRegistry {
    pub fn new(ctx: AgentContext, store: Arc<dyn ConversationStore>) -> Self {
        Self {
            ctx,
            store,
            engines: Mutex::new(HashMap::new()),
        }
    }

    /// The live engine for a conversation, started on demand. A stored
    /// conversation resumes with its history; an unknown id starts empty.
    pub async fn ensure(&self, id: &ConversationId) -> Result<EngineHandle> {
        if let Some(handle) = self.engines.lock().unwrap().get(id)
            && handle.is_alive()
        {
            return Ok(handle.clone());
        }

        let conversation = match self.store.load(id).await? {
            Some(existing) => {
                debug!(conversation_id = %id, messages = existing.messages.len(), "Resuming conversation");
                existing
            }
            None => Conversation::new(id.clone()),
        };

        let mut engines = self.engines.lock().unwrap();
        // Re-check under the lock; a racing caller may have spawned first.
        if let Some(handle) = engines.get(id)
            && handle.is_alive()
        {
            return Ok(handle.clone());
        }
        let handle = Engine::spawn(conversation, self.ctx.clone(), self.store.clone());
        engines.insert(id.clone(), handle.clone());
        info!(conversation_id = %id, "Engine registered");
        Ok(handle)
    }

    /// Run one turn, restarting a stopped actor once before giving up.
    pub async fn send_message(
        &self,
        id: &ConversationId,
        content: impl Into<String>,
    ) -> Result<String> {
        let content = content.into();
        let handle = self.ensure(id).await?;
        match handle.send_message(content.clone()).await {
            Err(Error::EngineStopped(_)) => {
                self.engines.lock().unwrap().remove(id);
                let handle = self.ensure(id).await?;
                handle.send_message(content).await
            }
            other => other,
        }
    }

    /// Snapshot a running conversation. Engines that were never started
    /// (or already swept) are not resurrected for a read.
    pub async fn state(&self, id: &ConversationId) -> Result<EngineState> {
        let handle = self
            .engines
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ConversationNotFound(id.to_string()))?;
        handle.state().await
    }

    /// Stop and deregister one engine.
    pub async fn stop(&self, id: &ConversationId) {
        let handle = self.engines.lock().unwrap().remove(id);
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// Drop dead handles and idle rate-limit windows.
    pub fn sweep(&self) {
        self.engines
            .lock()
            .unwrap()
            .retain(|_, handle| handle.is_alive());
        let idle = Duration::from_secs(self.ctx.config.engine.idle_timeout_secs);
        self.ctx.limiter.sweep(idle);
    }

    pub fn live_engines(&self) -> usize {
        self.engines
            .lock()
            .unwrap()
            .values()
            .filter(|handle| handle.is_alive())
            .count()
    }
}
