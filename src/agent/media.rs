use crate::directory::ConversationDirectory;
use crate::models::{Agent, InboundAttachment};
use crate::providers::OpenAiProvider;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const FETCH_TIMEOUT_SECS: u64 = 20;

/// Media-to-text capability the preprocessor depends on. Kept as a trait so
/// tests can stub it without network access.
#[async_trait]
pub trait MediaUnderstanding: Send + Sync {
    async fn transcribe_audio(&self, audio: Vec<u8>, file_name: &str, model: &str)
        -> Result<String>;
    async fn describe_image(&self, image: Vec<u8>, media_type: &str, model: &str)
        -> Result<String>;
}

#[async_trait]
impl MediaUnderstanding for OpenAiProvider {
    async fn transcribe_audio(
        &self,
        audio: Vec<u8>,
        file_name: &str,
        model: &str,
    ) -> Result<String> {
        OpenAiProvider::transcribe_audio(self, audio, file_name, model).await
    }

    async fn describe_image(
        &self,
        image: Vec<u8>,
        media_type: &str,
        model: &str,
    ) -> Result<String> {
        OpenAiProvider::describe_image(self, image, media_type, model).await
    }
}

/// Folds the latest inbound attachment into the message text before the
/// orchestration loop sees it. Every failure path degrades to the original
/// text; media enrichment is best effort and never blocks a reply.
pub struct MediaPreprocessor {
    understanding: Arc<dyn MediaUnderstanding>,
    http: reqwest::Client,
}

impl MediaPreprocessor {
    pub fn new(understanding: Arc<dyn MediaUnderstanding>) -> Self {
        Self {
            understanding,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// Return the message text enriched with transcribed audio or an image
    /// description, or the original text unchanged when there is nothing to
    /// enrich or anything fails along the way.
    pub async fn enrich(
        &self,
        agent: &Agent,
        conversation_id: &str,
        text: &str,
        conversations: &dyn ConversationDirectory,
    ) -> String {
        let attachment = match conversations.latest_inbound_attachment(conversation_id).await {
            Ok(Some(attachment)) => attachment,
            Ok(None) => return text.to_string(),
            Err(e) => {
                warn!("attachment lookup failed for {}: {}", conversation_id, e);
                return text.to_string();
            }
        };

        let enrichment = match &attachment {
            InboundAttachment::Audio { url } => self.transcribe(agent, url).await,
            InboundAttachment::Image { url } => self.describe(agent, url).await,
        };

        match enrichment {
            Ok(Some(addition)) => join_text(text, &addition),
            Ok(None) => text.to_string(),
            Err(e) => {
                warn!(
                    "media enrichment failed for {}, using original text: {}",
                    conversation_id, e
                );
                text.to_string()
            }
        }
    }

    async fn transcribe(&self, agent: &Agent, url: &str) -> Result<Option<String>> {
        // No transcription model configured means the capability is off for
        // this agent
        let Some(model) = agent.transcription_model.as_deref() else {
            return Ok(None);
        };
        let bytes = self.fetch(url).await?;
        let transcript = self
            .understanding
            .transcribe_audio(bytes, &file_name_from_url(url, "audio.ogg"), model)
            .await?;
        if transcript.trim().is_empty() {
            return Ok(None);
        }
        debug!("transcribed {} bytes of audio", transcript.len());
        Ok(Some(format!("[Transcribed audio]: {}", transcript.trim())))
    }

    async fn describe(&self, agent: &Agent, url: &str) -> Result<Option<String>> {
        let Some(model) = agent.vision_model.as_deref() else {
            return Ok(None);
        };
        let bytes = self.fetch(url).await?;
        let description = self
            .understanding
            .describe_image(bytes, media_type_from_url(url), model)
            .await?;
        if description.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(format!("[Image description]: {}", description.trim())))
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

fn join_text(original: &str, addition: &str) -> String {
    if original.trim().is_empty() {
        addition.to_string()
    } else {
        format!("{}\n\n{}", original, addition)
    }
}

fn file_name_from_url(url: &str, fallback: &str) -> String {
    url.rsplit('/')
        .next()
        .map(|name| name.split(['?', '#']).next().unwrap_or(name))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| fallback.to_string())
}

fn media_type_from_url(url: &str) -> &'static str {
    let name = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    if name.ends_with(".png") {
        "image/png"
    } else if name.ends_with(".gif") {
        "image/gif"
    } else if name.ends_with(".webp") {
        "image/webp"
    } else {
        "image/jpeg"
    }
}
