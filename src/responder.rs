use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{call_blocking, Conversation, Database};
use crate::error::ChatPilotError;
use crate::llm::CompletionProvider;
use crate::llm_types::{ChatMessage, Role};
use crate::text::preview;

/// Sent when the model returns no content.
pub const FALLBACK_REPLY: &str = "not sure what to say";

const PROFILE_ANALYSIS_PROMPT: &str = "You help screen dating profiles. \
Analyze the profile description and answer with JSON only:\n\
{\"shouldLike\": true/false, \"reason\": \"short reason\", \"suggestedOpener\": \"an opening line if liked\"}\n\
Criteria: an interesting description, a sense of humor, shared interests.";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileVerdict {
    pub should_like: bool,
    pub reason: String,
    #[serde(default)]
    pub suggested_opener: Option<String>,
}

impl ProfileVerdict {
    fn undecided(reason: &str) -> Self {
        Self {
            should_like: true,
            reason: reason.to_string(),
            suggested_opener: None,
        }
    }
}

/// Effective generation settings after the `settings` table is applied.
#[derive(Debug, Clone, PartialEq)]
struct GenerationSettings {
    system_prompt: String,
    temperature: f32,
    max_tokens: u32,
}

struct PreparedContext {
    conversation: Conversation,
    messages: Vec<ChatMessage>,
    settings: GenerationSettings,
}

pub struct AiResponder {
    db: Arc<Database>,
    provider: Arc<dyn CompletionProvider>,
    default_system_prompt: String,
    temperature: f32,
    max_tokens: u32,
    context_messages: usize,
}

impl AiResponder {
    pub fn new(db: Arc<Database>, provider: Arc<dyn CompletionProvider>, config: &Config) -> Self {
        Self {
            db,
            provider,
            default_system_prompt: config.default_system_prompt.clone(),
            temperature: config.ai_temperature,
            max_tokens: config.ai_max_tokens,
            context_messages: config.ai_context_messages,
        }
    }

    /// Generate a reply and persist both sides of the exchange.
    pub async fn respond(
        &self,
        conversation_id: i64,
        user_message: &str,
        prompt_override: Option<&str>,
    ) -> Result<String, ChatPilotError> {
        let reply = self
            .generate_reply(conversation_id, user_message, prompt_override)
            .await?;
        let user_text = user_message.to_string();
        let reply_text = reply.clone();
        call_blocking(self.db.clone(), move |db| {
            db.add_message(conversation_id, Role::User.as_str(), &user_text, None)?;
            db.add_message(conversation_id, Role::Assistant.as_str(), &reply_text, None)
        })
        .await?;
        Ok(reply)
    }

    /// Generate a reply without writing anything.
    ///
    /// Used when the caller has already stored the inbound message; an
    /// identical trailing user message in history is not repeated.
    pub async fn generate_reply(
        &self,
        conversation_id: i64,
        user_message: &str,
        prompt_override: Option<&str>,
    ) -> Result<String, ChatPilotError> {
        let context = self
            .prepare(conversation_id, user_message, prompt_override)
            .await?;
        let reply = self
            .provider
            .complete(
                context.messages,
                context.settings.temperature,
                context.settings.max_tokens,
            )
            .await
            .map_err(|e| ChatPilotError::AiGeneration(e.to_string()))?;

        let reply = if reply.trim().is_empty() {
            warn!(conversation_id, "Empty completion, using fallback reply");
            FALLBACK_REPLY.to_string()
        } else {
            reply
        };
        info!(
            conversation_id,
            account_id = context.conversation.account_id,
            "AI reply: {}",
            preview(&reply, 80)
        );
        Ok(reply)
    }

    async fn prepare(
        &self,
        conversation_id: i64,
        user_message: &str,
        prompt_override: Option<&str>,
    ) -> Result<PreparedContext, ChatPilotError> {
        let limit = self.context_messages;
        let (conversation, account_prompt, history, stored) =
            call_blocking(self.db.clone(), move |db| {
                let conversation = db
                    .get_conversation(conversation_id)?
                    .ok_or(ChatPilotError::ConversationNotFound(conversation_id))?;
                let account_prompt = db
                    .get_account(conversation.account_id)?
                    .and_then(|a| a.system_prompt);
                let history = db.get_recent_messages(conversation_id, limit)?;
                let stored = StoredSettings {
                    system_prompt: db.get_setting("default_system_prompt")?,
                    temperature: db.get_setting("ai_temperature")?,
                    max_tokens: db.get_setting("ai_max_tokens")?,
                };
                Ok((conversation, account_prompt, history, stored))
            })
            .await?;

        let settings = self.resolve_settings(stored);
        let system_prompt = compose_system_prompt(
            prompt_override,
            account_prompt.as_deref(),
            &settings.system_prompt,
            &conversation,
        );

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(system_prompt));
        for entry in &history {
            match Role::parse(&entry.role) {
                Some(Role::System) | None => continue,
                Some(role) => messages.push(ChatMessage {
                    role,
                    content: entry.content.clone(),
                }),
            }
        }
        let already_present = messages
            .last()
            .is_some_and(|m| m.role == Role::User && m.content == user_message);
        if !already_present {
            messages.push(ChatMessage::user(user_message));
        }

        Ok(PreparedContext {
            conversation,
            messages,
            settings,
        })
    }

    fn resolve_settings(&self, stored: StoredSettings) -> GenerationSettings {
        let system_prompt = stored
            .system_prompt
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.default_system_prompt.clone());
        let temperature = stored
            .temperature
            .and_then(|t| t.trim().parse::<f32>().ok())
            .filter(|t| (0.0..=2.0).contains(t))
            .unwrap_or(self.temperature);
        let max_tokens = stored
            .max_tokens
            .and_then(|t| t.trim().parse::<u32>().ok())
            .filter(|t| *t > 0)
            .unwrap_or(self.max_tokens);
        GenerationSettings {
            system_prompt,
            temperature,
            max_tokens,
        }
    }

    /// Ask the model whether a dating profile is worth a like.
    /// Provider or parse failures yield a permissive verdict.
    pub async fn analyze_profile(&self, description: &str) -> ProfileVerdict {
        let messages = vec![
            ChatMessage::system(PROFILE_ANALYSIS_PROMPT),
            ChatMessage::user(format!("Analyze this profile: {description}")),
        ];
        match self.provider.complete(messages, 0.7, 200).await {
            Ok(content) => parse_verdict(&content),
            Err(e) => {
                warn!("Profile analysis failed: {e}");
                ProfileVerdict::undecided("analysis error")
            }
        }
    }
}

struct StoredSettings {
    system_prompt: Option<String>,
    temperature: Option<String>,
    max_tokens: Option<String>,
}

fn compose_system_prompt(
    prompt_override: Option<&str>,
    account_prompt: Option<&str>,
    default_prompt: &str,
    conversation: &Conversation,
) -> String {
    let base = [prompt_override, account_prompt]
        .into_iter()
        .flatten()
        .find(|p| !p.trim().is_empty())
        .unwrap_or(default_prompt);
    let mut prompt = base.to_string();
    if let Some(description) = conversation
        .peer_description
        .as_deref()
        .filter(|d| !d.is_empty())
    {
        prompt.push_str(&format!("\n\nAbout the person you are talking to: {description}"));
    }
    if let Some(name) = conversation
        .peer_first_name
        .as_deref()
        .filter(|n| !n.is_empty())
    {
        prompt.push_str(&format!("\nTheir name: {name}"));
    }
    prompt
}

fn parse_verdict(content: &str) -> ProfileVerdict {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| ProfileVerdict::undecided("unparseable analysis"))
}
