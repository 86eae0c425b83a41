mod file_store;

pub use file_store::FileContextStore;

use crate::models::ConversationTurn;
use anyhow::Result;
use async_trait::async_trait;

/// Most recent non-system turns resent to the model on each run. Older turns
/// stay in the store but are not part of the assembled request.
pub const CONTEXT_WINDOW_TURNS: usize = 12;

/// Short-term conversation memory contract.
///
/// The store only promises an ordered sequence of role-tagged turns with
/// optional tool metadata. Retention (TTL, eviction) is a store concern.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Ordered turns for a conversation. Unknown conversations yield an
    /// empty sequence.
    async fn get(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>>;

    /// Append turns in the given order, atomically with respect to readers.
    async fn append_many(&self, conversation_id: &str, turns: Vec<ConversationTurn>) -> Result<()>;
}

/// Cap stored history to the most recent [`CONTEXT_WINDOW_TURNS`] non-system
/// turns, preserving order.
pub fn capped_window(turns: &[ConversationTurn]) -> Vec<ConversationTurn> {
    let non_system: Vec<&ConversationTurn> =
        turns.iter().filter(|t| t.role != "system").collect();
    let start = non_system.len().saturating_sub(CONTEXT_WINDOW_TURNS);
    non_system[start..].iter().map(|t| (*t).clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_keeps_most_recent_turns() {
        let mut turns = Vec::new();
        for i in 0..20 {
            turns.push(ConversationTurn::user(format!("msg {}", i)));
        }
        let window = capped_window(&turns);
        assert_eq!(window.len(), CONTEXT_WINDOW_TURNS);
        assert_eq!(window[0].content, "msg 8");
        assert_eq!(window.last().unwrap().content, "msg 19");
    }

    #[test]
    fn window_excludes_system_turns() {
        let turns = vec![
            ConversationTurn::system("policy"),
            ConversationTurn::user("hi"),
            ConversationTurn::assistant("hello", None),
        ];
        let window = capped_window(&turns);
        assert_eq!(window.len(), 2);
        assert!(window.iter().all(|t| t.role != "system"));
    }

    #[test]
    fn window_preserves_order_under_cap() {
        let turns = vec![
            ConversationTurn::user("a"),
            ConversationTurn::assistant("b", None),
            ConversationTurn::tool_result("call_1", "t", "c"),
        ];
        let window = capped_window(&turns);
        let roles: Vec<&str> = window.iter().map(|t| t.role.as_str()).collect();
        assert_eq!(roles, ["user", "assistant", "tool"]);
    }
}
