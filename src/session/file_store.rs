use crate::models::ConversationTurn;
use crate::session::ContextStore;
use crate::utils::{atomic_write, ensure_dir, safe_filename};
use anyhow::{Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use tokio::sync::Mutex;

const MAX_CACHED_CONVERSATIONS: usize = 64;
const MAX_STORED_TURNS: usize = 200;

/// JSONL-per-conversation context store with an LRU read cache.
///
/// Each conversation is one file of newline-delimited turn objects; writes
/// rewrite the whole file via tempfile + rename so readers never observe a
/// partial transcript.
pub struct FileContextStore {
    dir: PathBuf,
    cache: Mutex<LruCache<String, Vec<ConversationTurn>>>,
}

impl FileContextStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = ensure_dir(dir.into())?;
        Ok(Self {
            dir,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_CACHED_CONVERSATIONS)
                    .expect("MAX_CACHED_CONVERSATIONS must be > 0"),
            )),
        })
    }

    fn turn_file(&self, conversation_id: &str) -> PathBuf {
        let safe_key = safe_filename(&conversation_id.replace(':', "_"));
        self.dir.join(format!("{}.jsonl", safe_key))
    }

    fn load(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>> {
        let path = self.turn_file(conversation_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read context file: {}", path.display()))?;

        let mut turns = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let turn: ConversationTurn = serde_json::from_str(line)
                .with_context(|| "Failed to parse context JSON line")?;
            turns.push(turn);
        }

        // Prune on load
        if turns.len() > MAX_STORED_TURNS {
            let drain_count = turns.len() - MAX_STORED_TURNS;
            turns.drain(..drain_count);
        }

        Ok(turns)
    }

    fn save(&self, conversation_id: &str, turns: &[ConversationTurn]) -> Result<()> {
        let path = self.turn_file(conversation_id);
        let mut content = String::new();
        for turn in turns {
            content.push_str(&serde_json::to_string(turn)?);
            content.push('\n');
        }
        atomic_write(&path, &content)
            .with_context(|| format!("Failed to write context file: {}", path.display()))
    }
}

#[async_trait]
impl ContextStore for FileContextStore {
    async fn get(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>> {
        {
            let mut cache = self.cache.lock().await;
            if let Some(turns) = cache.get(conversation_id) {
                return Ok(turns.clone());
            }
        }

        let turns = self.load(conversation_id)?;
        let mut cache = self.cache.lock().await;
        cache.put(conversation_id.to_string(), turns.clone());
        Ok(turns)
    }

    async fn append_many(
        &self,
        conversation_id: &str,
        new_turns: Vec<ConversationTurn>,
    ) -> Result<()> {
        if new_turns.is_empty() {
            return Ok(());
        }

        let mut turns = self.get(conversation_id).await?;
        turns.extend(new_turns);
        if turns.len() > MAX_STORED_TURNS {
            let drain_count = turns.len() - MAX_STORED_TURNS;
            turns.drain(..drain_count);
        }

        self.save(conversation_id, &turns)?;

        let mut cache = self.cache.lock().await;
        cache.put(conversation_id.to_string(), turns);
        Ok(())
    }
}
