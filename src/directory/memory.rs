use crate::directory::{AgentDirectory, ConversationDirectory};
use crate::models::{
    Agent, AgentToolBinding, ConversationMeta, IdleCandidate, InboundAttachment, LastDirection,
    ToolDefinition,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

/// One conversation as the in-memory directory tracks it.
#[derive(Debug, Clone)]
pub struct StoredConversation {
    pub tenant_id: String,
    pub inbox_id: String,
    /// Explicit agent binding; `None` falls back to the tenant default.
    pub agent_id: Option<String>,
    pub agent_controlled: bool,
    pub meta: ConversationMeta,
    pub attachment: Option<InboundAttachment>,
}

/// In-memory `AgentDirectory` + `ConversationDirectory`. Backs tests and
/// single-process deployments; production installs swap in their own
/// datastore-backed implementation.
#[derive(Default)]
pub struct MemoryDirectory {
    agents: Mutex<HashMap<String, Agent>>,
    tools: Mutex<HashMap<String, ToolDefinition>>,
    bindings: Mutex<Vec<AgentToolBinding>>,
    conversations: Mutex<HashMap<String, StoredConversation>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_agent(&self, agent: Agent) {
        self.agents
            .lock()
            .expect("agents lock poisoned")
            .insert(agent.id.clone(), agent);
    }

    pub fn insert_tool(&self, tool: ToolDefinition) {
        self.tools
            .lock()
            .expect("tools lock poisoned")
            .insert(tool.key.clone(), tool);
    }

    pub fn insert_binding(&self, binding: AgentToolBinding) {
        self.bindings
            .lock()
            .expect("bindings lock poisoned")
            .push(binding);
    }

    pub fn insert_conversation(&self, conversation_id: &str, record: StoredConversation) {
        self.conversations
            .lock()
            .expect("conversations lock poisoned")
            .insert(conversation_id.to_string(), record);
    }

    fn resolve_agent(&self, record: &StoredConversation) -> Option<Agent> {
        let agents = self.agents.lock().expect("agents lock poisoned");
        if let Some(agent_id) = &record.agent_id {
            return agents.get(agent_id).cloned();
        }
        // Tenant-default binding: an active agent with no inbox restriction.
        agents
            .values()
            .find(|a| a.tenant_id == record.tenant_id && a.active && a.enabled_inbox_ids.is_empty())
            .cloned()
    }
}

#[async_trait]
impl AgentDirectory for MemoryDirectory {
    async fn agent_by_id(&self, agent_id: &str) -> Result<Option<Agent>> {
        Ok(self
            .agents
            .lock()
            .expect("agents lock poisoned")
            .get(agent_id)
            .cloned())
    }

    async fn default_agent_for_tenant(&self, tenant_id: &str) -> Result<Option<Agent>> {
        Ok(self
            .agents
            .lock()
            .expect("agents lock poisoned")
            .values()
            .find(|a| a.tenant_id == tenant_id && a.active)
            .cloned())
    }

    async fn enabled_tools(
        &self,
        agent_id: &str,
    ) -> Result<Vec<(AgentToolBinding, ToolDefinition)>> {
        let bindings = self.bindings.lock().expect("bindings lock poisoned");
        let tools = self.tools.lock().expect("tools lock poisoned");
        Ok(bindings
            .iter()
            .filter(|b| b.agent_id == agent_id && b.enabled)
            .filter_map(|b| tools.get(&b.tool_key).map(|t| (b.clone(), t.clone())))
            .collect())
    }
}

#[async_trait]
impl ConversationDirectory for MemoryDirectory {
    async fn metadata(&self, conversation_id: &str) -> Result<ConversationMeta> {
        self.conversations
            .lock()
            .expect("conversations lock poisoned")
            .get(conversation_id)
            .map(|r| r.meta.clone())
            .with_context(|| format!("Unknown conversation: {}", conversation_id))
    }

    async fn latest_inbound_attachment(
        &self,
        conversation_id: &str,
    ) -> Result<Option<InboundAttachment>> {
        Ok(self
            .conversations
            .lock()
            .expect("conversations lock poisoned")
            .get(conversation_id)
            .and_then(|r| r.attachment.clone()))
    }

    async fn idle_candidates(&self, batch: usize) -> Result<Vec<IdleCandidate>> {
        let now = Utc::now();
        let conversations = self
            .conversations
            .lock()
            .expect("conversations lock poisoned");

        let mut candidates = Vec::new();
        for (conversation_id, record) in conversations.iter() {
            if !record.agent_controlled {
                continue;
            }
            if record.meta.last_direction != LastDirection::Counterpart {
                continue;
            }
            let Some(agent) = self.resolve_agent(record) else {
                continue;
            };
            // Respect explicit inbox bindings on the resolved agent
            if !agent.enabled_inbox_ids.is_empty()
                && !agent.enabled_inbox_ids.contains(&record.inbox_id)
            {
                continue;
            }
            let threshold = match agent.idle_threshold_secs {
                Some(secs) if secs > 0 => secs,
                _ => continue,
            };
            let idle_secs = (now - record.meta.last_message_at).num_seconds().max(0) as u64;
            if idle_secs <= threshold {
                continue;
            }
            candidates.push(IdleCandidate {
                conversation_id: conversation_id.clone(),
                tenant_id: record.tenant_id.clone(),
                agent_id: agent.id.clone(),
                inbox_id: record.inbox_id.clone(),
                idle_secs,
                threshold_secs: threshold,
                counterpart_name: record.meta.counterpart_name.clone(),
            });
        }

        candidates.sort_by(|a, b| b.idle_secs.cmp(&a.idle_secs));
        candidates.truncate(batch);
        Ok(candidates)
    }

    async fn mark_agent_replied(&self, conversation_id: &str) -> Result<()> {
        let mut conversations = self
            .conversations
            .lock()
            .expect("conversations lock poisoned");
        let record = conversations
            .get_mut(conversation_id)
            .with_context(|| format!("Unknown conversation: {}", conversation_id))?;
        record.meta.last_direction = LastDirection::Agent;
        record.meta.last_message_at = Utc::now();
        Ok(())
    }
}
