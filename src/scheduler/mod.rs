use crate::agent::{Orchestrator, RunOutcome, RunRequest};
use crate::config::SchedulerConfig;
use crate::directory::ConversationDirectory;
use crate::models::IdleCandidate;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Map;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Conversations considered per scan. Anything beyond this waits for the
/// next cycle.
pub const FOLLOW_UP_BATCH: usize = 50;

/// Seam between the scheduler and the orchestration loop, so follow-up
/// behavior can be exercised without a completion service.
#[async_trait]
pub trait FollowUpRunner: Send + Sync {
    async fn run(&self, request: RunRequest) -> Result<RunOutcome>;
}

#[async_trait]
impl FollowUpRunner for Orchestrator {
    async fn run(&self, request: RunRequest) -> Result<RunOutcome> {
        Orchestrator::run(self, request).await
    }
}

/// Periodically re-engages conversations the customer has left idle.
///
/// Candidates are processed one at a time with a mandatory pause between
/// them. The scan is a low-priority background concern and must never land a
/// burst of completion calls at once.
pub struct IdleScheduler {
    runner: Arc<dyn FollowUpRunner>,
    conversations: Arc<dyn ConversationDirectory>,
    config: SchedulerConfig,
    running: Arc<tokio::sync::Mutex<bool>>,
    handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl IdleScheduler {
    pub fn new(
        runner: Arc<dyn FollowUpRunner>,
        conversations: Arc<dyn ConversationDirectory>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            runner,
            conversations,
            config,
            running: Arc::new(tokio::sync::Mutex::new(false)),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        *self.running.lock().await = true;
        let running = self.running.clone();
        let runner = self.runner.clone();
        let conversations = self.conversations.clone();
        let config = self.config.clone();
        let interval = self.config.scan_interval_secs.max(1);

        let handle = tokio::spawn(async move {
            loop {
                if !*running.lock().await {
                    break;
                }

                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                if !*running.lock().await {
                    break;
                }

                match scan_once(runner.as_ref(), conversations.as_ref(), &config).await {
                    Ok(sent) => {
                        if sent > 0 {
                            info!("idle scan sent {} follow-up(s)", sent);
                        }
                    }
                    Err(e) => error!("idle scan failed: {}", e),
                }
            }
        });

        *self.handle.lock().await = Some(handle);
        info!("idle scheduler started (every {}s)", interval);
        Ok(())
    }

    pub async fn stop(&self) {
        *self.running.lock().await = false;
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }

    /// One scan cycle: fetch candidates and nudge each in turn. Exposed for
    /// direct invocation alongside the background loop.
    pub async fn scan_and_follow_up(&self) -> Result<usize> {
        scan_once(
            self.runner.as_ref(),
            self.conversations.as_ref(),
            &self.config,
        )
        .await
    }
}

async fn scan_once(
    runner: &dyn FollowUpRunner,
    conversations: &dyn ConversationDirectory,
    config: &SchedulerConfig,
) -> Result<usize> {
    let candidates = conversations.idle_candidates(FOLLOW_UP_BATCH).await?;
    if candidates.is_empty() {
        return Ok(0);
    }
    debug!("idle scan found {} candidate(s)", candidates.len());

    let mut sent = 0;
    for (index, candidate) in candidates.iter().enumerate() {
        if index > 0 && config.candidate_delay_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(config.candidate_delay_ms))
                .await;
        }

        match follow_up(runner, candidate).await {
            Ok(true) => {
                sent += 1;
                if let Err(e) = conversations
                    .mark_agent_replied(&candidate.conversation_id)
                    .await
                {
                    warn!(
                        "failed to mark follow-up in {}: {}",
                        candidate.conversation_id, e
                    );
                }
            }
            Ok(false) => {}
            Err(e) => {
                // One broken conversation must not stall the rest of the batch
                warn!("follow-up failed in {}: {}", candidate.conversation_id, e);
            }
        }
    }
    Ok(sent)
}

async fn follow_up(runner: &dyn FollowUpRunner, candidate: &IdleCandidate) -> Result<bool> {
    let request = RunRequest {
        tenant_id: candidate.tenant_id.clone(),
        conversation_id: candidate.conversation_id.clone(),
        inbox_id: candidate.inbox_id.clone(),
        agent_id: Some(candidate.agent_id.clone()),
        text: nudge_prompt(candidate),
        context_values: Map::new(),
    };

    match runner.run(request).await? {
        RunOutcome::Replied(reply) if !reply.reply.trim().is_empty() => {
            debug!(
                "followed up in {} after {} idle",
                candidate.conversation_id,
                format_idle(candidate.idle_secs)
            );
            Ok(true)
        }
        RunOutcome::Replied(_) => Ok(false),
        RunOutcome::Skipped { reason } => {
            debug!(
                "follow-up skipped in {}: {}",
                candidate.conversation_id, reason
            );
            Ok(false)
        }
    }
}

/// Synthetic instruction standing in for the customer turn. The orchestration
/// loop treats it like any other inbound message.
fn nudge_prompt(candidate: &IdleCandidate) -> String {
    let who = candidate
        .counterpart_name
        .as_deref()
        .map(|name| format!("The customer ({})", name))
        .unwrap_or_else(|| "The customer".to_string());
    format!(
        "[automated follow-up] {} has not replied for {}. \
         Write one short, friendly message to gently re-engage them. \
         Reference the earlier conversation where it helps, do not repeat \
         yourself, and do not pressure them.",
        who,
        format_idle(candidate.idle_secs)
    )
}

fn format_idle(secs: u64) -> String {
    if secs < 60 {
        "less than a minute".to_string()
    } else if secs < 3600 {
        let minutes = secs / 60;
        if minutes == 1 {
            "1 minute".to_string()
        } else {
            format!("{} minutes", minutes)
        }
    } else {
        let hours = secs / 3600;
        if hours == 1 {
            "1 hour".to_string()
        } else {
            format!("{} hours", hours)
        }
    }
}
