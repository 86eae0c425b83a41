use crate::agent::records::{InvocationLog, RecordStore};
use crate::agent::schema;
use crate::models::{
    AgentToolBinding, DatastoreAction, HandlerConfig, ToolDefinition, ToolInvocationRecord,
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const HTTP_HANDLER_TIMEOUT_SECS: u64 = 30;

/// Server-side identifiers injected into every tool execution. Values for
/// context-supplied fields come from here, never from model output.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub tenant_id: String,
    pub conversation_id: String,
    pub inbox_id: String,
    /// Values for handler `context_fields`, keyed by field name.
    pub context_values: Map<String, Value>,
}

/// Structured result of one tool invocation. The dispatcher always returns
/// one of these; nothing raises past its boundary.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl DispatchOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Serialized form fed back to the model as a tool-role turn.
    pub fn to_turn_content(&self) -> String {
        let value = if self.success {
            json!({"success": true, "data": self.data})
        } else {
            json!({"error": self.error})
        };
        value.to_string()
    }
}

/// Event emitted by realtime-push handlers onto the platform's push channel.
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub event: String,
    pub conversation_id: String,
    pub payload: Value,
}

/// Routes validated tool calls to their backend handler and records every
/// attempt in the invocation log.
pub struct ToolDispatcher {
    records: Arc<RecordStore>,
    log: Arc<dyn InvocationLog>,
    http: reqwest::Client,
    push_tx: Option<tokio::sync::mpsc::Sender<PushEvent>>,
    workflow_url: Option<String>,
}

impl ToolDispatcher {
    pub fn new(
        records: Arc<RecordStore>,
        log: Arc<dyn InvocationLog>,
        push_tx: Option<tokio::sync::mpsc::Sender<PushEvent>>,
        workflow_url: Option<String>,
    ) -> Self {
        Self {
            records,
            log,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(HTTP_HANDLER_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            push_tx,
            workflow_url,
        }
    }

    /// Validate, route, and log one tool call. Always returns an outcome.
    pub async fn invoke(
        &self,
        tool: &ToolDefinition,
        binding: &AgentToolBinding,
        arguments: &Value,
        ctx: &ExecutionContext,
    ) -> DispatchOutcome {
        let model_schema = schema::redact(schema::normalize(&tool.stored_schema), &tool.handler);

        let (outcome, touched) = match validate_arguments(&tool.key, &model_schema, arguments) {
            Err(message) => (DispatchOutcome::fail(message), Vec::new()),
            Ok(args) => {
                let merged = merge_arguments(args, binding, &tool.handler, ctx);
                self.route(tool, &merged, ctx).await
            }
        };

        self.record_attempt(tool, ctx, arguments, &outcome, touched);
        outcome
    }

    async fn route(
        &self,
        tool: &ToolDefinition,
        args: &Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> (DispatchOutcome, Vec<String>) {
        match &tool.handler {
            HandlerConfig::Datastore {
                table,
                action,
                context_fields,
            } => self.route_datastore(table, *action, context_fields, args),
            HandlerConfig::Http { url, method } => {
                (self.route_http(url, method, args).await, Vec::new())
            }
            HandlerConfig::Workflow { workflow_id } => (
                self.route_workflow(workflow_id, args, ctx).await,
                Vec::new(),
            ),
            HandlerConfig::RealtimePush { event } => {
                (self.route_push(event, args, ctx).await, Vec::new())
            }
        }
    }

    /// Direct-datastore handler: exactly the configured table/action, using
    /// only context-injected identifiers plus validated arguments.
    fn route_datastore(
        &self,
        table: &str,
        action: DatastoreAction,
        context_fields: &[String],
        args: &Map<String, Value>,
    ) -> (DispatchOutcome, Vec<String>) {
        let (filters, changes): (Map<String, Value>, Map<String, Value>) = args
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .partition(|(k, _)| context_fields.contains(k));

        let result = match action {
            DatastoreAction::Insert => self.records.insert(table, args),
            DatastoreAction::Update => self.records.update(table, &filters, &changes),
            DatastoreAction::Lookup => self.records.lookup(table, args).map(|v| (v, Vec::new())),
        };

        match result {
            Ok((data, touched)) => (DispatchOutcome::ok(data), touched),
            Err(e) => {
                warn!("datastore handler on {} failed: {}", table, e);
                (DispatchOutcome::fail(e.to_string()), Vec::new())
            }
        }
    }

    async fn route_http(
        &self,
        url: &str,
        method: &str,
        args: &Map<String, Value>,
    ) -> DispatchOutcome {
        let method = match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(m) => m,
            Err(_) => return DispatchOutcome::fail(format!("Invalid HTTP method: {}", method)),
        };
        let response = self
            .http
            .request(method, url)
            .json(&Value::Object(args.clone()))
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                let body: Value = resp.json().await.unwrap_or(Value::Null);
                if status.is_success() {
                    DispatchOutcome::ok(body)
                } else {
                    DispatchOutcome::fail(format!("HTTP handler returned {}: {}", status, body))
                }
            }
            Err(e) => DispatchOutcome::fail(format!("HTTP handler request failed: {}", e)),
        }
    }

    async fn route_workflow(
        &self,
        workflow_id: &str,
        args: &Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> DispatchOutcome {
        let Some(base) = &self.workflow_url else {
            return DispatchOutcome::fail("workflow trigger endpoint not configured");
        };
        let payload = json!({
            "workflowId": workflow_id,
            "conversationId": ctx.conversation_id,
            "tenantId": ctx.tenant_id,
            "arguments": args,
        });
        match self.http.post(base).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                DispatchOutcome::ok(json!({"triggered": workflow_id}))
            }
            Ok(resp) => {
                DispatchOutcome::fail(format!("workflow trigger returned {}", resp.status()))
            }
            Err(e) => DispatchOutcome::fail(format!("workflow trigger failed: {}", e)),
        }
    }

    async fn route_push(
        &self,
        event: &str,
        args: &Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> DispatchOutcome {
        let Some(tx) = &self.push_tx else {
            return DispatchOutcome::fail("realtime push channel not configured");
        };
        let push = PushEvent {
            event: event.to_string(),
            conversation_id: ctx.conversation_id.clone(),
            payload: Value::Object(args.clone()),
        };
        match tx.send(push).await {
            Ok(()) => DispatchOutcome::ok(json!({"pushed": event})),
            Err(_) => DispatchOutcome::fail("realtime push channel closed"),
        }
    }

    /// Append one audit record per attempt. A logging failure must not change
    /// the returned result; it is recorded and swallowed.
    fn record_attempt(
        &self,
        tool: &ToolDefinition,
        ctx: &ExecutionContext,
        arguments: &Value,
        outcome: &DispatchOutcome,
        touched_columns: Vec<String>,
    ) {
        let record = ToolInvocationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            tool_key: tool.key.clone(),
            conversation_id: ctx.conversation_id.clone(),
            arguments: arguments.clone(),
            success: outcome.success,
            result: outcome.data.clone(),
            error: outcome.error.clone(),
            touched_columns,
            created_at: Utc::now(),
        };
        if let Err(e) = self.log.append(&record) {
            warn!("failed to log invocation of {}: {}", tool.key, e);
        } else {
            debug!("logged invocation of {} ({})", tool.key, record.id);
        }
    }
}

/// Check the model's arguments against the redacted schema: required fields
/// must be present with matching types; unknown/extra fields are tolerated.
fn validate_arguments(
    tool_key: &str,
    schema: &Value,
    arguments: &Value,
) -> Result<Map<String, Value>, String> {
    let Some(args) = arguments.as_object() else {
        return Err(format!(
            "Invalid arguments for tool '{}': expected a JSON object",
            tool_key
        ));
    };

    let mut errors = Vec::new();
    if let Some(required) = schema["required"].as_array() {
        for field in required {
            if let Some(field_name) = field.as_str() {
                if args.get(field_name).is_none_or(Value::is_null) {
                    errors.push(format!("missing required parameter '{}'", field_name));
                }
            }
        }
    }

    if let Some(properties) = schema["properties"].as_object() {
        for (field_name, field_schema) in properties {
            if let Some(value) = args.get(field_name) {
                if value.is_null() {
                    continue;
                }
                if let Some(expected_type) = field_schema["type"].as_str() {
                    let type_ok = match expected_type {
                        "string" => value.is_string(),
                        "number" | "integer" => value.is_number(),
                        "boolean" => value.is_boolean(),
                        "array" => value.is_array(),
                        "object" => value.is_object(),
                        _ => true,
                    };
                    if !type_ok {
                        errors.push(format!(
                            "parameter '{}' should be {}",
                            field_name, expected_type
                        ));
                    }
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(args.clone())
    } else {
        Err(format!(
            "Invalid arguments for tool '{}': {}",
            tool_key,
            errors.join("; ")
        ))
    }
}

/// Merge model arguments with binding overrides and context-supplied values.
/// Precedence: context values > binding overrides > model output.
fn merge_arguments(
    mut args: Map<String, Value>,
    binding: &AgentToolBinding,
    handler: &HandlerConfig,
    ctx: &ExecutionContext,
) -> Map<String, Value> {
    for (key, value) in &binding.overrides {
        args.insert(key.clone(), value.clone());
    }
    for field in handler.context_fields() {
        if let Some(value) = ctx.context_values.get(field) {
            args.insert(field.clone(), value.clone());
        }
    }
    args
}
