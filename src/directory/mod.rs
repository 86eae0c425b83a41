mod memory;

pub use memory::{MemoryDirectory, StoredConversation};

use crate::models::{
    Agent, AgentToolBinding, ConversationMeta, IdleCandidate, InboundAttachment, ToolDefinition,
};
use anyhow::Result;
use async_trait::async_trait;

/// Read-only view of the tenant's agent and tool catalog.
///
/// The administrative surface that mutates these records is out of scope;
/// the core only ever reads through this trait.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn agent_by_id(&self, agent_id: &str) -> Result<Option<Agent>>;

    /// Default active agent for a tenant, used when a conversation has no
    /// explicit agent binding.
    async fn default_agent_for_tenant(&self, tenant_id: &str) -> Result<Option<Agent>>;

    /// Enabled tool bindings for an agent, paired with their catalog entries.
    /// Queried fresh at the start of every orchestration run.
    async fn enabled_tools(
        &self,
        agent_id: &str,
    ) -> Result<Vec<(AgentToolBinding, ToolDefinition)>>;
}

/// Conversation metadata surface consumed by the gate, the media
/// preprocessor, and the idle scheduler.
#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn metadata(&self, conversation_id: &str) -> Result<ConversationMeta>;

    /// Most recent inbound attachment, if any.
    async fn latest_inbound_attachment(
        &self,
        conversation_id: &str,
    ) -> Result<Option<InboundAttachment>>;

    /// Agent-controlled conversations whose counterpart spoke last and whose
    /// idle time exceeds the bound agent's threshold. Oldest-idle first,
    /// capped at `batch`. Agents with a zero or absent threshold are never
    /// eligible.
    async fn idle_candidates(&self, batch: usize) -> Result<Vec<IdleCandidate>>;

    /// Flip the conversation's last-message direction to agent-originated so
    /// the next idle scan does not re-select it.
    async fn mark_agent_replied(&self, conversation_id: &str) -> Result<()>;
}
