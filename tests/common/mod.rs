// Shared test helpers — not all items used by every test binary.
#![allow(unused)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use concierge::agent::records::{RecordStore, SqliteInvocationLog};
use concierge::agent::{Orchestrator, ToolDispatcher};
use concierge::directory::{MemoryDirectory, StoredConversation};
use concierge::models::{
    Agent, AgentToolBinding, ConversationKind, ConversationMeta, DatastoreAction, HandlerConfig,
    InboundAttachment, LastDirection, ToolDefinition,
};
use concierge::providers::{
    ChatMessage, ChatRequest, CompletionProvider, CompletionResponse, FinishReason,
    ToolCallRequest, ToolSpec, Usage,
};
use concierge::session::FileContextStore;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tempfile::TempDir;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
    pub tools: Option<Vec<ToolSpec>>,
    pub temperature: f32,
    pub max_tokens: u32,
}

pub struct MockCompletionProvider {
    responses: Arc<std::sync::Mutex<VecDeque<CompletionResponse>>>,
    pub calls: Arc<std::sync::Mutex<Vec<RecordedCall>>>,
    pub default_response: String,
}

impl MockCompletionProvider {
    pub fn with_responses(responses: Vec<CompletionResponse>) -> Self {
        Self {
            responses: Arc::new(std::sync::Mutex::new(VecDeque::from(responses))),
            calls: Arc::new(std::sync::Mutex::new(Vec::new())),
            default_response: "Mock reply".to_string(),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionProvider for MockCompletionProvider {
    async fn chat(&self, req: ChatRequest<'_>) -> anyhow::Result<CompletionResponse> {
        self.calls.lock().unwrap().push(RecordedCall {
            messages: req.messages,
            model: req.model.map(|s| s.to_string()),
            tools: req.tools,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
        });

        let response = self.responses.lock().unwrap().pop_front();
        Ok(response.unwrap_or_else(|| text_response(&self.default_response)))
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }
}

// --- Response builders ---

pub fn text_response(content: &str) -> CompletionResponse {
    CompletionResponse {
        content: Some(content.to_string()),
        tool_calls: vec![],
        finish_reason: FinishReason::Stop,
        usage: Some(Usage {
            prompt_tokens: 20,
            completion_tokens: 10,
            total_tokens: 30,
        }),
    }
}

pub fn tool_call_response(calls: Vec<(&str, &str, Value)>) -> CompletionResponse {
    CompletionResponse {
        content: None,
        tool_calls: calls
            .into_iter()
            .map(|(id, name, arguments)| ToolCallRequest {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            })
            .collect(),
        finish_reason: FinishReason::ToolCalls,
        usage: None,
    }
}

// --- Catalog builders ---

pub fn support_agent() -> Agent {
    Agent {
        id: "agent-1".into(),
        tenant_id: "tenant-1".into(),
        name: "Support".into(),
        active: true,
        provider_binding: Some("openai".into()),
        model: "gpt-4o-mini".into(),
        temperature: 0.7,
        max_tokens: 512,
        behavior: "Help customers with their orders.".into(),
        idle_threshold_secs: Some(600),
        enabled_inbox_ids: vec![],
        ignore_group_messages: false,
        transcription_model: None,
        vision_model: None,
    }
}

pub fn direct_conversation(idle_secs: i64) -> StoredConversation {
    StoredConversation {
        tenant_id: "tenant-1".into(),
        inbox_id: "inbox-1".into(),
        agent_id: Some("agent-1".into()),
        agent_controlled: true,
        meta: ConversationMeta {
            kind: ConversationKind::Direct,
            last_direction: LastDirection::Counterpart,
            last_message_at: Utc::now() - Duration::seconds(idle_secs),
            counterpart_name: Some("Dana".into()),
        },
        attachment: None,
    }
}

pub fn order_lookup_tool() -> ToolDefinition {
    ToolDefinition {
        key: "lookup_order".into(),
        name: "Lookup order".into(),
        description: "Find an order by its number".into(),
        stored_schema: json!({
            "type": "object",
            "properties": {"order_number": {"type": "string"}},
            "required": ["order_number"]
        }),
        handler: HandlerConfig::Datastore {
            table: "orders".into(),
            action: DatastoreAction::Lookup,
            context_fields: vec![],
        },
    }
}

pub fn note_update_tool() -> ToolDefinition {
    ToolDefinition {
        key: "update_customer_note".into(),
        name: "Update customer note".into(),
        // Legacy function-wrapper shape, still common in older catalogs
        stored_schema: json!({
            "type": "function",
            "function": {
                "name": "update_customer_note",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "customer_id": {"type": "string"},
                        "note": {"type": "string"}
                    },
                    "required": ["customer_id", "note"]
                }
            }
        }),
        description: "Store a note on the customer record".into(),
        handler: HandlerConfig::Datastore {
            table: "customers".into(),
            action: DatastoreAction::Update,
            context_fields: vec!["customer_id".into()],
        },
    }
}

pub fn enabled_binding(tool_key: &str) -> AgentToolBinding {
    AgentToolBinding {
        agent_id: "agent-1".into(),
        tool_key: tool_key.into(),
        enabled: true,
        overrides: Map::new(),
    }
}

// --- Fixture ---

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub provider: Arc<MockCompletionProvider>,
    pub directory: Arc<MemoryDirectory>,
    pub store: Arc<FileContextStore>,
    pub records: Arc<RecordStore>,
    pub log: Arc<SqliteInvocationLog>,
    _dir: TempDir,
}

/// Full orchestration stack on top of scripted completions, an in-memory
/// catalog, an in-memory datastore, and a temp-dir context store.
pub fn harness(responses: Vec<CompletionResponse>) -> Harness {
    let provider = Arc::new(MockCompletionProvider::with_responses(responses));
    let directory = Arc::new(MemoryDirectory::new());

    let records = Arc::new(RecordStore::open_in_memory().unwrap());
    records
        .execute_batch(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, order_number TEXT, status TEXT);
             INSERT INTO orders (order_number, status) VALUES ('ORD-7', 'shipped');
             CREATE TABLE customers (id INTEGER PRIMARY KEY, customer_id TEXT, note TEXT);
             INSERT INTO customers (customer_id, note) VALUES ('cust-1', '');",
        )
        .unwrap();
    let log = Arc::new(SqliteInvocationLog::open_in_memory().unwrap());
    let dispatcher = Arc::new(ToolDispatcher::new(records.clone(), log.clone(), None, None));

    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileContextStore::new(dir.path()).unwrap());

    let orchestrator = Arc::new(Orchestrator::new(
        provider.clone(),
        directory.clone(),
        directory.clone(),
        store.clone(),
        dispatcher,
        None,
    ));

    Harness {
        orchestrator,
        provider,
        directory,
        store,
        records,
        log,
        _dir: dir,
    }
}
