use crate::agent::dispatch::{DispatchOutcome, ExecutionContext, ToolDispatcher};
use crate::agent::gate::{can_respond, Eligibility};
use crate::agent::locks::ConversationLocks;
use crate::agent::media::MediaPreprocessor;
use crate::agent::schema;
use crate::directory::{AgentDirectory, ConversationDirectory};
use crate::models::{Agent, AgentToolBinding, ConversationTurn, ToolDefinition};
use crate::providers::{
    ChatMessage, ChatRequest, CompletionProvider, ToolCallRequest, ToolSpec, Usage,
};
use crate::session::{capped_window, ContextStore};
use anyhow::Result;
use futures_util::future::join_all;
use serde_json::Map;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound on completion calls within one run. When the model still asks
/// for tools on the final call, the calls are dropped and whatever text came
/// with them becomes the reply.
pub const MAX_TOOL_ITERATIONS: usize = 5;

/// One inbound customer message handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub tenant_id: String,
    pub conversation_id: String,
    pub inbox_id: String,
    /// Explicit agent binding. `None` falls back to the tenant default.
    pub agent_id: Option<String>,
    pub text: String,
    /// Values for context-supplied tool fields (customer id, inbox id, ...).
    pub context_values: Map<String, Value>,
}

/// What one orchestration run produced.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The agent did not respond; the reason is operator-facing.
    Skipped { reason: String },
    Replied(ReplyOutcome),
}

#[derive(Debug, Clone)]
pub struct ReplyOutcome {
    pub reply: String,
    pub usage: Option<Usage>,
    pub agent_id: String,
    pub model: String,
}

/// Drives the bounded tool-calling loop for one conversation at a time.
pub struct Orchestrator {
    provider: Arc<dyn CompletionProvider>,
    agents: Arc<dyn AgentDirectory>,
    conversations: Arc<dyn ConversationDirectory>,
    store: Arc<dyn ContextStore>,
    dispatcher: Arc<ToolDispatcher>,
    media: Option<Arc<MediaPreprocessor>>,
    locks: ConversationLocks,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        agents: Arc<dyn AgentDirectory>,
        conversations: Arc<dyn ConversationDirectory>,
        store: Arc<dyn ContextStore>,
        dispatcher: Arc<ToolDispatcher>,
        media: Option<Arc<MediaPreprocessor>>,
    ) -> Self {
        Self {
            provider,
            agents,
            conversations,
            store,
            dispatcher,
            media,
            locks: ConversationLocks::new(),
        }
    }

    /// Run the full pipeline for one inbound message: resolve the agent,
    /// gate, enrich, loop, persist. At most one run is active per
    /// conversation; concurrent callers for the same conversation queue.
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome> {
        let _guard = self.locks.acquire(&request.conversation_id).await;

        let Some(agent) = self.resolve_agent(&request).await? else {
            return Ok(skip("no active agent for this conversation"));
        };

        if let Eligibility::Denied { reason } = can_respond(
            &agent,
            &request.inbox_id,
            &request.conversation_id,
            self.conversations.as_ref(),
        )
        .await
        {
            info!(
                "agent {} not responding in {}: {}",
                agent.id, request.conversation_id, reason
            );
            return Ok(RunOutcome::Skipped { reason });
        }

        if agent.provider_binding.is_none() {
            return Ok(skip("agent has no completion-service integration"));
        }

        let text = match &self.media {
            Some(media) => {
                media
                    .enrich(
                        &agent,
                        &request.conversation_id,
                        &request.text,
                        self.conversations.as_ref(),
                    )
                    .await
            }
            None => request.text.clone(),
        };

        // A history read failure degrades to an empty window rather than
        // dropping the inbound message.
        let history = match self.store.get(&request.conversation_id).await {
            Ok(turns) => turns,
            Err(e) => {
                warn!(
                    "context read failed for {}, starting empty: {}",
                    request.conversation_id, e
                );
                Vec::new()
            }
        };

        // Enablement is queried fresh on every run so admin changes apply to
        // the next message without a restart.
        let tools = self.agents.enabled_tools(&agent.id).await?;
        let specs = tool_specs(&tools);
        let catalog: HashMap<&str, &(AgentToolBinding, ToolDefinition)> = tools
            .iter()
            .map(|entry| (entry.1.key.as_str(), entry))
            .collect();

        let mut messages = vec![ChatMessage::system(system_prompt(&agent))];
        messages.extend(capped_window(&history).iter().map(turn_to_message));
        messages.push(ChatMessage::user(text.clone()));

        let mut new_turns = vec![ConversationTurn::user(text)];
        let ctx = ExecutionContext {
            tenant_id: request.tenant_id.clone(),
            conversation_id: request.conversation_id.clone(),
            inbox_id: request.inbox_id.clone(),
            context_values: request.context_values.clone(),
        };

        let mut reply = String::new();
        let mut usage = None;

        for iteration in 1..=MAX_TOOL_ITERATIONS {
            let response = self
                .provider
                .chat_with_retry(
                    ChatRequest {
                        messages: messages.clone(),
                        tools: if specs.is_empty() {
                            None
                        } else {
                            Some(specs.clone())
                        },
                        model: Some(&agent.model),
                        max_tokens: agent.max_tokens,
                        temperature: agent.temperature,
                    },
                    None,
                )
                .await?;

            usage = response.usage;
            let content = response.content.clone().unwrap_or_default();

            if !response.wants_tools() {
                reply = content;
                break;
            }

            if iteration == MAX_TOOL_ITERATIONS {
                warn!(
                    "tool budget exhausted in {} with {} pending call(s)",
                    request.conversation_id,
                    response.tool_calls.len()
                );
                reply = content;
                break;
            }

            debug!(
                "iteration {}: {} tool call(s) requested",
                iteration,
                response.tool_calls.len()
            );

            messages.push(ChatMessage::assistant(
                content.clone(),
                Some(response.tool_calls.clone()),
            ));
            new_turns.push(ConversationTurn::assistant(
                content,
                serde_json::to_value(&response.tool_calls).ok(),
            ));

            for (call, outcome) in self.dispatch_all(&response.tool_calls, &catalog, &ctx).await {
                let body = outcome.to_turn_content();
                messages.push(ChatMessage::tool_result(call.id.clone(), body.clone()));
                new_turns.push(ConversationTurn::tool_result(
                    call.id.clone(),
                    call.name.clone(),
                    body,
                ));
            }
        }

        new_turns.push(ConversationTurn::assistant(reply.clone(), None));

        // The reply has already been generated; a persistence failure is
        // logged but must not suppress it.
        if let Err(e) = self
            .store
            .append_many(&request.conversation_id, new_turns)
            .await
        {
            warn!(
                "failed to persist turns for {}: {}",
                request.conversation_id, e
            );
        }

        Ok(RunOutcome::Replied(ReplyOutcome {
            reply,
            usage,
            agent_id: agent.id,
            model: agent.model,
        }))
    }

    async fn resolve_agent(&self, request: &RunRequest) -> Result<Option<Agent>> {
        let agent = match &request.agent_id {
            Some(id) => self.agents.agent_by_id(id).await?,
            None => self.agents.default_agent_for_tenant(&request.tenant_id).await?,
        };
        Ok(agent.filter(|a| a.active))
    }

    /// Execute all calls from one response concurrently, yielding results in
    /// request order so the transcript stays aligned with the call list.
    async fn dispatch_all(
        &self,
        calls: &[ToolCallRequest],
        catalog: &HashMap<&str, &(AgentToolBinding, ToolDefinition)>,
        ctx: &ExecutionContext,
    ) -> Vec<(ToolCallRequest, DispatchOutcome)> {
        let futures = calls.iter().map(|call| async move {
            let outcome = match catalog.get(call.name.as_str()) {
                Some((binding, tool)) => {
                    self.dispatcher
                        .invoke(tool, binding, &call.arguments, ctx)
                        .await
                }
                None => DispatchOutcome::fail(format!(
                    "Tool '{}' not found or not enabled",
                    call.name
                )),
            };
            (call.clone(), outcome)
        });
        join_all(futures).await
    }
}

fn skip(reason: &str) -> RunOutcome {
    RunOutcome::Skipped {
        reason: reason.to_string(),
    }
}

fn system_prompt(agent: &Agent) -> String {
    let mut prompt = format!(
        "You are {}, an automated assistant handling customer conversations for this business.",
        agent.name
    );
    if !agent.behavior.trim().is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(agent.behavior.trim());
    }
    prompt.push_str(
        "\n\nKeep replies concise and grounded in the conversation. \
         Prefer using an available tool over guessing when one matches the request; \
         never invent tool results or customer data. \
         If a tool fails, apologize briefly and help with what you do know. \
         When a response format is requested, apply it only to your final reply, \
         never to tool calls.",
    );
    prompt
}

/// Model-facing tool list: normalized, redacted, keyed by the stable tool key.
fn tool_specs(tools: &[(AgentToolBinding, ToolDefinition)]) -> Vec<ToolSpec> {
    tools
        .iter()
        .map(|(_, tool)| ToolSpec {
            name: tool.key.clone(),
            description: tool.description.clone(),
            parameters: schema::redact(schema::normalize(&tool.stored_schema), &tool.handler),
        })
        .collect()
}

fn turn_to_message(turn: &ConversationTurn) -> ChatMessage {
    let tool_calls = turn
        .tool_calls
        .as_ref()
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    ChatMessage {
        role: turn.role.clone(),
        content: turn.content.clone(),
        tool_calls,
        tool_call_id: turn.tool_call_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::records::{RecordStore, SqliteInvocationLog};
    use crate::directory::{MemoryDirectory, StoredConversation};
    use crate::models::{
        ConversationKind, ConversationMeta, DatastoreAction, HandlerConfig, LastDirection,
    };
    use crate::providers::{CompletionResponse, FinishReason};
    use crate::session::FileContextStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedProvider {
        responses: Mutex<VecDeque<CompletionResponse>>,
        calls: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<CompletionResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        async fn chat(&self, req: ChatRequest<'_>) -> Result<CompletionResponse> {
            self.calls.lock().unwrap().push(req.messages);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("no scripted response left"))
        }

        fn default_model(&self) -> &str {
            "scripted"
        }
    }

    fn text_response(content: &str) -> CompletionResponse {
        CompletionResponse {
            content: Some(content.to_string()),
            tool_calls: vec![],
            finish_reason: FinishReason::Stop,
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
        }
    }

    fn tool_response(name: &str, id: &str, arguments: Value) -> CompletionResponse {
        CompletionResponse {
            content: None,
            tool_calls: vec![ToolCallRequest {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            }],
            finish_reason: FinishReason::ToolCalls,
            usage: None,
        }
    }

    fn agent() -> Agent {
        Agent {
            id: "a1".into(),
            tenant_id: "t1".into(),
            name: "Support".into(),
            active: true,
            provider_binding: Some("openai".into()),
            model: "gpt-4o-mini".into(),
            temperature: 0.7,
            max_tokens: 512,
            behavior: "Answer order questions.".into(),
            idle_threshold_secs: None,
            enabled_inbox_ids: vec![],
            ignore_group_messages: false,
            transcription_model: None,
            vision_model: None,
        }
    }

    fn conversation() -> StoredConversation {
        StoredConversation {
            tenant_id: "t1".into(),
            inbox_id: "inbox-1".into(),
            agent_id: Some("a1".into()),
            agent_controlled: true,
            meta: ConversationMeta {
                kind: ConversationKind::Direct,
                last_direction: LastDirection::Counterpart,
                last_message_at: Utc::now(),
                counterpart_name: Some("Dana".into()),
            },
            attachment: None,
        }
    }

    fn lookup_tool() -> ToolDefinition {
        ToolDefinition {
            key: "lookup_order".into(),
            name: "Lookup order".into(),
            description: "Find an order by number".into(),
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

    struct Fixture {
        orchestrator: Orchestrator,
        provider: Arc<ScriptedProvider>,
        store: Arc<FileContextStore>,
        _dir: tempfile::TempDir,
    }

    fn fixture(responses: Vec<CompletionResponse>, with_tool: bool) -> Fixture {
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert_agent(agent());
        directory.insert_conversation("c1", conversation());
        if with_tool {
            directory.insert_tool(lookup_tool());
            directory.insert_binding(AgentToolBinding {
                agent_id: "a1".into(),
                tool_key: "lookup_order".into(),
                enabled: true,
                overrides: Map::new(),
            });
        }

        let records = Arc::new(RecordStore::open_in_memory().unwrap());
        records
            .execute_batch(
                "CREATE TABLE orders (id INTEGER PRIMARY KEY, order_number TEXT, status TEXT);
                 INSERT INTO orders (order_number, status) VALUES ('ORD-7', 'shipped');",
            )
            .unwrap();
        let log = Arc::new(SqliteInvocationLog::open_in_memory().unwrap());
        let dispatcher = Arc::new(ToolDispatcher::new(records, log, None, None));

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileContextStore::new(dir.path()).unwrap());
        let provider = Arc::new(ScriptedProvider::new(responses));

        let orchestrator = Orchestrator::new(
            provider.clone(),
            directory.clone(),
            directory,
            store.clone(),
            dispatcher,
            None,
        );
        Fixture {
            orchestrator,
            provider,
            store,
            _dir: dir,
        }
    }

    fn request() -> RunRequest {
        RunRequest {
            tenant_id: "t1".into(),
            conversation_id: "c1".into(),
            inbox_id: "inbox-1".into(),
            agent_id: Some("a1".into()),
            text: "where is my order ORD-7?".into(),
            context_values: Map::new(),
        }
    }

    #[tokio::test]
    async fn plain_reply_persists_user_and_assistant_turns() {
        let f = fixture(vec![text_response("It shipped yesterday.")], false);
        let outcome = f.orchestrator.run(request()).await.unwrap();

        let RunOutcome::Replied(reply) = outcome else {
            panic!("expected reply");
        };
        assert_eq!(reply.reply, "It shipped yesterday.");
        assert_eq!(reply.agent_id, "a1");
        assert_eq!(reply.usage.unwrap().total_tokens, 15);

        let turns = f.store.get("c1").await.unwrap();
        let roles: Vec<&str> = turns.iter().map(|t| t.role.as_str()).collect();
        assert_eq!(roles, ["user", "assistant"]);
    }

    #[tokio::test]
    async fn tool_call_round_trip_appends_ordered_turns() {
        let f = fixture(
            vec![
                tool_response("lookup_order", "call_1", json!({"order_number": "ORD-7"})),
                text_response("Order ORD-7 has shipped."),
            ],
            true,
        );
        let outcome = f.orchestrator.run(request()).await.unwrap();

        let RunOutcome::Replied(reply) = outcome else {
            panic!("expected reply");
        };
        assert_eq!(reply.reply, "Order ORD-7 has shipped.");
        assert_eq!(f.provider.call_count(), 2);

        let turns = f.store.get("c1").await.unwrap();
        let roles: Vec<&str> = turns.iter().map(|t| t.role.as_str()).collect();
        assert_eq!(roles, ["user", "assistant", "tool", "assistant"]);
        assert_eq!(turns[2].tool_call_id.as_deref(), Some("call_1"));
        assert!(turns[2].content.contains("shipped"));
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_turn_and_loop_continues() {
        let f = fixture(
            vec![
                tool_response("delete_everything", "call_1", json!({})),
                text_response("I cannot do that."),
            ],
            true,
        );
        let outcome = f.orchestrator.run(request()).await.unwrap();

        let RunOutcome::Replied(reply) = outcome else {
            panic!("expected reply");
        };
        assert_eq!(reply.reply, "I cannot do that.");

        let turns = f.store.get("c1").await.unwrap();
        let tool_turn = turns.iter().find(|t| t.role == "tool").unwrap();
        assert!(tool_turn
            .content
            .contains("Tool 'delete_everything' not found or not enabled"));
    }

    #[tokio::test]
    async fn tool_budget_stops_after_five_completions() {
        let responses = (0..MAX_TOOL_ITERATIONS)
            .map(|i| {
                let mut r = tool_response(
                    "lookup_order",
                    &format!("call_{}", i),
                    json!({"order_number": "ORD-7"}),
                );
                if i == MAX_TOOL_ITERATIONS - 1 {
                    r.content = Some("Partial answer.".into());
                }
                r
            })
            .collect();
        let f = fixture(responses, true);
        let outcome = f.orchestrator.run(request()).await.unwrap();

        let RunOutcome::Replied(reply) = outcome else {
            panic!("expected reply");
        };
        // The fifth response still wants tools; its calls are dropped and its
        // text is used as-is.
        assert_eq!(reply.reply, "Partial answer.");
        assert_eq!(f.provider.call_count(), MAX_TOOL_ITERATIONS);
    }

    #[tokio::test]
    async fn missing_provider_binding_skips_without_completion_call() {
        let f = fixture(vec![text_response("never sent")], false);
        let mut unbound = agent();
        unbound.provider_binding = None;
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert_agent(unbound);
        directory.insert_conversation("c1", conversation());

        let orchestrator = Orchestrator::new(
            f.provider.clone(),
            directory.clone(),
            directory,
            f.store.clone(),
            Arc::new(ToolDispatcher::new(
                Arc::new(RecordStore::open_in_memory().unwrap()),
                Arc::new(SqliteInvocationLog::open_in_memory().unwrap()),
                None,
                None,
            )),
            None,
        );

        let outcome = orchestrator.run(request()).await.unwrap();
        let RunOutcome::Skipped { reason } = outcome else {
            panic!("expected skip");
        };
        assert_eq!(reason, "agent has no completion-service integration");
        assert_eq!(f.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn denied_inbox_skips() {
        let f = fixture(vec![text_response("never sent")], false);
        let mut restricted = agent();
        restricted.enabled_inbox_ids = vec!["inbox-2".into()];
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert_agent(restricted);
        directory.insert_conversation("c1", conversation());

        let orchestrator = Orchestrator::new(
            f.provider.clone(),
            directory.clone(),
            directory,
            f.store.clone(),
            Arc::new(ToolDispatcher::new(
                Arc::new(RecordStore::open_in_memory().unwrap()),
                Arc::new(SqliteInvocationLog::open_in_memory().unwrap()),
                None,
                None,
            )),
            None,
        );

        let outcome = orchestrator.run(request()).await.unwrap();
        let RunOutcome::Skipped { reason } = outcome else {
            panic!("expected skip");
        };
        assert_eq!(reason, "inbox not enabled for this agent");
        assert_eq!(f.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn inactive_agent_skips() {
        let f = fixture(vec![text_response("never sent")], false);
        let mut inactive = agent();
        inactive.active = false;
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert_agent(inactive);
        directory.insert_conversation("c1", conversation());

        let orchestrator = Orchestrator::new(
            f.provider.clone(),
            directory.clone(),
            directory,
            f.store.clone(),
            Arc::new(ToolDispatcher::new(
                Arc::new(RecordStore::open_in_memory().unwrap()),
                Arc::new(SqliteInvocationLog::open_in_memory().unwrap()),
                None,
                None,
            )),
            None,
        );

        let outcome = orchestrator.run(request()).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Skipped { .. }));
        assert_eq!(f.provider.call_count(), 0);
    }
}
