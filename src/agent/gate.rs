use crate::directory::ConversationDirectory;
use crate::models::{Agent, ConversationKind};
use tracing::warn;

/// Outcome of the pre-response eligibility check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Allowed,
    Denied { reason: String },
}

impl Eligibility {
    fn denied(reason: &str) -> Self {
        Eligibility::Denied {
            reason: reason.to_string(),
        }
    }
}

/// Decide whether an agent may respond in a conversation. Rules are evaluated
/// in order; the first failing rule wins.
///
/// A metadata lookup failure allows the request: denying on an unrelated read
/// failure would silently starve a functioning agent.
pub async fn can_respond(
    agent: &Agent,
    inbox_id: &str,
    conversation_id: &str,
    conversations: &dyn ConversationDirectory,
) -> Eligibility {
    if !agent.enabled_inbox_ids.is_empty()
        && !agent.enabled_inbox_ids.iter().any(|id| id == inbox_id)
    {
        return Eligibility::denied("inbox not enabled for this agent");
    }

    if agent.ignore_group_messages {
        match conversations.metadata(conversation_id).await {
            Ok(meta) if meta.kind == ConversationKind::Group => {
                return Eligibility::denied("agent ignores group messages");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    "conversation lookup failed for {}, allowing response: {}",
                    conversation_id, e
                );
            }
        }
    }

    Eligibility::Allowed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryDirectory, StoredConversation};
    use crate::models::{ConversationMeta, LastDirection};
    use chrono::Utc;

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
            behavior: String::new(),
            idle_threshold_secs: None,
            enabled_inbox_ids: vec![],
            ignore_group_messages: false,
            transcription_model: None,
            vision_model: None,
        }
    }

    fn conversation(kind: ConversationKind) -> StoredConversation {
        StoredConversation {
            tenant_id: "t1".into(),
            inbox_id: "inbox-1".into(),
            agent_id: Some("a1".into()),
            agent_controlled: true,
            meta: ConversationMeta {
                kind,
                last_direction: LastDirection::Counterpart,
                last_message_at: Utc::now(),
                counterpart_name: None,
            },
            attachment: None,
        }
    }

    #[tokio::test]
    async fn empty_allowlist_allows_any_inbox() {
        let dir = MemoryDirectory::new();
        let result = can_respond(&agent(), "inbox-99", "c1", &dir).await;
        assert_eq!(result, Eligibility::Allowed);
    }

    #[tokio::test]
    async fn allowlist_denies_unlisted_inbox() {
        let dir = MemoryDirectory::new();
        let mut agent = agent();
        agent.enabled_inbox_ids = vec!["inbox-1".into(), "inbox-2".into()];

        let result = can_respond(&agent, "inbox-3", "c1", &dir).await;
        assert_eq!(
            result,
            Eligibility::Denied {
                reason: "inbox not enabled for this agent".into()
            }
        );
    }

    #[tokio::test]
    async fn group_suppression_denies_group_conversations() {
        let dir = MemoryDirectory::new();
        dir.insert_conversation("c1", conversation(ConversationKind::Group));
        let mut agent = agent();
        agent.ignore_group_messages = true;

        let result = can_respond(&agent, "inbox-1", "c1", &dir).await;
        assert_eq!(
            result,
            Eligibility::Denied {
                reason: "agent ignores group messages".into()
            }
        );
    }

    #[tokio::test]
    async fn group_suppression_allows_direct_conversations() {
        let dir = MemoryDirectory::new();
        dir.insert_conversation("c1", conversation(ConversationKind::Direct));
        let mut agent = agent();
        agent.ignore_group_messages = true;

        let result = can_respond(&agent, "inbox-1", "c1", &dir).await;
        assert_eq!(result, Eligibility::Allowed);
    }

    #[tokio::test]
    async fn lookup_failure_allows() {
        // Unknown conversation id makes the metadata lookup fail
        let dir = MemoryDirectory::new();
        let mut agent = agent();
        agent.ignore_group_messages = true;

        let result = can_respond(&agent, "inbox-1", "missing", &dir).await;
        assert_eq!(result, Eligibility::Allowed);
    }

    #[tokio::test]
    async fn allowlist_checked_before_group_rule() {
        let dir = MemoryDirectory::new();
        dir.insert_conversation("c1", conversation(ConversationKind::Group));
        let mut agent = agent();
        agent.enabled_inbox_ids = vec!["inbox-1".into()];
        agent.ignore_group_messages = true;

        let result = can_respond(&agent, "inbox-9", "c1", &dir).await;
        assert_eq!(
            result,
            Eligibility::Denied {
                reason: "inbox not enabled for this agent".into()
            }
        );
    }
}
