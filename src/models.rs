use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-tenant automated conversational configuration. Owned by the tenant and
/// mutated only through the administrative surface; read-only inside the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Completion-service binding id. `None` means the agent cannot run.
    #[serde(default)]
    pub provider_binding: Option<String>,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Behavior text prepended to the system turn.
    #[serde(default)]
    pub behavior: String,
    /// Seconds of customer-side silence before a follow-up is eligible.
    /// `None` or `Some(0)` disables idle follow-ups for this agent.
    #[serde(default)]
    pub idle_threshold_secs: Option<u64>,
    /// Inbox allowlist. Empty means the agent may respond in any inbox.
    #[serde(default)]
    pub enabled_inbox_ids: Vec<String>,
    #[serde(default)]
    pub ignore_group_messages: bool,
    #[serde(default)]
    pub transcription_model: Option<String>,
    #[serde(default)]
    pub vision_model: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1024
}

/// Datastore verb a direct-datastore tool is allowed to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DatastoreAction {
    Insert,
    Update,
    Lookup,
}

/// Backend routing for a tool, tagged by handler kind.
///
/// `context_fields` on the datastore variant marks parameters the runtime
/// supplies from server-side context. Those fields must never appear in the
/// model-facing schema; see [`crate::agent::schema::redact`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum HandlerConfig {
    #[serde(rename_all = "camelCase")]
    Datastore {
        table: String,
        action: DatastoreAction,
        #[serde(default)]
        context_fields: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Http {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
    },
    #[serde(rename_all = "camelCase")]
    Workflow { workflow_id: String },
    #[serde(rename_all = "camelCase")]
    RealtimePush { event: String },
}

fn default_http_method() -> String {
    "POST".to_string()
}

impl HandlerConfig {
    /// Fields the runtime injects from execution context rather than model output.
    pub fn context_fields(&self) -> &[String] {
        match self {
            HandlerConfig::Datastore { context_fields, .. } => context_fields,
            _ => &[],
        }
    }
}

/// Catalog entry for a named, schema-described capability the model may
/// invoke. `stored_schema` holds whatever legacy shape the catalog carries;
/// it is normalized per run, never in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Stable identifier used as the function-call name.
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub stored_schema: Value,
    pub handler: HandlerConfig,
}

/// Enablement link between one Agent and one Tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentToolBinding {
    pub agent_id: String,
    pub tool_key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-binding argument overrides, merged over model-supplied arguments
    /// at dispatch time.
    #[serde(default)]
    pub overrides: serde_json::Map<String, Value>,
}

/// One role-tagged unit of dialogue. Insertion order is significant and is
/// preserved exactly as produced by the orchestration loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
    /// Originating call id, set on tool-role turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name, set on tool-role turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Serialized tool-call requests, set on assistant turns that request tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Option<Value>) -> Self {
        let mut turn = Self::new("assistant", content);
        turn.tool_calls = tool_calls;
        turn
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut turn = Self::new("tool", content);
        turn.tool_call_id = Some(tool_call_id.into());
        turn.tool_name = Some(tool_name.into());
        turn
    }

    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_call_id: None,
            tool_name: None,
            tool_calls: None,
            timestamp: Utc::now(),
        }
    }
}

/// Who authored the most recent message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LastDirection {
    /// Counterpart (customer) spoke last.
    Counterpart,
    /// Agent spoke last.
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConversationKind {
    Direct,
    Group,
}

/// Conversation metadata the core reads but never writes (except for the
/// scheduler's direction flip after a successful follow-up).
#[derive(Debug, Clone)]
pub struct ConversationMeta {
    pub kind: ConversationKind,
    pub last_direction: LastDirection,
    pub last_message_at: DateTime<Utc>,
    pub counterpart_name: Option<String>,
}

/// The most recent inbound attachment for a conversation, if any.
#[derive(Debug, Clone)]
pub enum InboundAttachment {
    Audio { url: String },
    Image { url: String },
}

/// Append-only audit entry, written once per attempted tool call regardless
/// of outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationRecord {
    pub id: String,
    pub tool_key: String,
    pub conversation_id: String,
    pub arguments: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Columns touched by direct-datastore handlers. Empty for other kinds.
    #[serde(default)]
    pub touched_columns: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Read-only projection produced by the idle scan. Never persisted.
#[derive(Debug, Clone)]
pub struct IdleCandidate {
    pub conversation_id: String,
    pub tenant_id: String,
    pub agent_id: String,
    pub inbox_id: String,
    pub idle_secs: u64,
    pub threshold_secs: u64,
    pub counterpart_name: Option<String>,
}
