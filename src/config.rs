use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ChatPilotError;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly person chatting casually. \
Keep replies short and natural, like a real text message. Never mention that you are an AI.";

fn default_data_dir() -> String {
    "./chatpilot.data".into()
}
fn default_sessions_dir() -> String {
    "./sessions".into()
}
fn default_worker_command() -> String {
    "python3 telegram_client.py".into()
}
fn default_worker_restart_backoff_ms() -> u64 {
    5000
}
fn default_worker_stop_grace_ms() -> u64 {
    3000
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_ai_temperature() -> f32 {
    0.9
}
fn default_ai_max_tokens() -> u32 {
    150
}
fn default_ai_context_messages() -> usize {
    20
}
fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.into()
}
fn default_event_feed_capacity() -> usize {
    1024
}

fn default_min_delay_ms() -> u64 {
    3000
}
fn default_max_delay_ms() -> u64 {
    8000
}
fn default_actions_per_hour() -> usize {
    30
}
fn default_messages_per_hour() -> usize {
    20
}
fn default_strict() -> bool {
    true
}

/// Rate limits and humanizing delays applied to every automated action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_actions_per_hour")]
    pub actions_per_hour: usize,
    #[serde(default = "default_messages_per_hour")]
    pub messages_per_hour: usize,
    /// Reserve throttle slots atomically instead of check-then-log.
    #[serde(default = "default_strict")]
    pub strict: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            actions_per_hour: default_actions_per_hour(),
            messages_per_hour: default_messages_per_hour(),
            strict: default_strict(),
        }
    }
}

fn default_action_delay_ms() -> u64 {
    1000
}
fn default_repeat_delay_ms() -> u64 {
    2000
}
fn default_recorded_delay_between_ms() -> i64 {
    1000
}
fn default_recorded_action_delay_ms() -> i64 {
    500
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Used when an action's `delay_after_ms` is not positive.
    #[serde(default = "default_action_delay_ms")]
    pub default_action_delay_ms: u64,
    /// Used when a pattern's `delay_between_ms` is not positive.
    #[serde(default = "default_repeat_delay_ms")]
    pub default_repeat_delay_ms: u64,
    #[serde(default = "default_recorded_delay_between_ms")]
    pub recorded_delay_between_ms: i64,
    #[serde(default = "default_recorded_action_delay_ms")]
    pub recorded_action_delay_ms: i64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            default_action_delay_ms: default_action_delay_ms(),
            default_repeat_delay_ms: default_repeat_delay_ms(),
            recorded_delay_between_ms: default_recorded_delay_between_ms(),
            recorded_action_delay_ms: default_recorded_action_delay_ms(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub telegram_bot_token: Option<String>,
    #[serde(default)]
    pub chat_id: Option<i64>,
}

impl NotifierConfig {
    pub fn is_configured(&self) -> bool {
        self.chat_id.is_some()
            && self
                .telegram_bot_token
                .as_deref()
                .is_some_and(|t| !t.trim().is_empty())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: String,
    /// Program and leading args; the session id and sessions dir are appended.
    #[serde(default = "default_worker_command")]
    pub worker_command: String,
    #[serde(default = "default_worker_restart_backoff_ms")]
    pub worker_restart_backoff_ms: u64,
    #[serde(default = "default_worker_stop_grace_ms")]
    pub worker_stop_grace_ms: u64,
    #[serde(default = "default_llm_base_url")]
    pub llm_base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_ai_temperature")]
    pub ai_temperature: f32,
    #[serde(default = "default_ai_max_tokens")]
    pub ai_max_tokens: u32,
    #[serde(default = "default_ai_context_messages")]
    pub ai_context_messages: usize,
    #[serde(default = "default_system_prompt")]
    pub default_system_prompt: String,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub pattern: PatternConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default = "default_event_feed_capacity")]
    pub event_feed_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sessions_dir: default_sessions_dir(),
            worker_command: default_worker_command(),
            worker_restart_backoff_ms: default_worker_restart_backoff_ms(),
            worker_stop_grace_ms: default_worker_stop_grace_ms(),
            llm_base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_model(),
            ai_temperature: default_ai_temperature(),
            ai_max_tokens: default_ai_max_tokens(),
            ai_context_messages: default_ai_context_messages(),
            default_system_prompt: default_system_prompt(),
            safety: SafetyConfig::default(),
            pattern: PatternConfig::default(),
            notifier: NotifierConfig::default(),
            event_feed_capacity: default_event_feed_capacity(),
        }
    }
}

impl Config {
    pub fn data_root_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    /// Directory holding the database and log files.
    pub fn runtime_data_dir(&self) -> String {
        self.data_root_dir()
            .join("runtime")
            .to_string_lossy()
            .to_string()
    }

    pub fn resolve_config_path() -> Result<Option<PathBuf>, ChatPilotError> {
        if let Ok(custom) = std::env::var("CHATPILOT_CONFIG") {
            if std::path::Path::new(&custom).exists() {
                return Ok(Some(PathBuf::from(custom)));
            }
            return Err(ChatPilotError::Config(format!(
                "CHATPILOT_CONFIG points to non-existent file: {custom}"
            )));
        }
        for candidate in ["./chatpilot.config.yaml", "./chatpilot.config.yml"] {
            if std::path::Path::new(candidate).exists() {
                return Ok(Some(PathBuf::from(candidate)));
            }
        }
        Ok(None)
    }

    /// Load from YAML, or fall back to defaults when no file exists.
    pub fn load() -> Result<Self, ChatPilotError> {
        let Some(path) = Self::resolve_config_path()? else {
            let mut config = Config::default();
            config.post_deserialize()?;
            return Ok(config);
        };
        let path_str = path.to_string_lossy().to_string();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ChatPilotError::Config(format!("Failed to read {path_str}: {e}")))?;
        Self::from_yaml(&content)
            .map_err(|e| ChatPilotError::Config(format!("{path_str}: {e}")))
    }

    pub fn from_yaml(content: &str) -> Result<Self, ChatPilotError> {
        let mut config: Config = serde_yaml::from_str(content)
            .map_err(|e| ChatPilotError::Config(format!("Failed to parse config: {e}")))?;
        config.post_deserialize()?;
        Ok(config)
    }

    /// Normalize and validate after deserialization.
    pub(crate) fn post_deserialize(&mut self) -> Result<(), ChatPilotError> {
        self.worker_command = self.worker_command.trim().to_string();
        if self.worker_command.is_empty() {
            return Err(ChatPilotError::Config(
                "worker_command must not be empty".into(),
            ));
        }
        if self.data_dir.trim().is_empty() {
            self.data_dir = default_data_dir();
        }
        if self.sessions_dir.trim().is_empty() {
            self.sessions_dir = default_sessions_dir();
        }
        self.llm_base_url = self.llm_base_url.trim().trim_end_matches('/').to_string();
        if self.llm_base_url.is_empty() {
            self.llm_base_url = default_llm_base_url();
        }
        if self.default_system_prompt.trim().is_empty() {
            self.default_system_prompt = default_system_prompt();
        }
        if !(0.0..=2.0).contains(&self.ai_temperature) {
            return Err(ChatPilotError::Config(format!(
                "ai_temperature must be within [0, 2], got {}",
                self.ai_temperature
            )));
        }
        if self.ai_max_tokens == 0 {
            self.ai_max_tokens = default_ai_max_tokens();
        }
        if self.ai_context_messages == 0 {
            self.ai_context_messages = default_ai_context_messages();
        }
        if self.safety.min_delay_ms > self.safety.max_delay_ms {
            return Err(ChatPilotError::Config(format!(
                "safety.min_delay_ms ({}) exceeds safety.max_delay_ms ({})",
                self.safety.min_delay_ms, self.safety.max_delay_ms
            )));
        }
        if self.safety.actions_per_hour == 0 || self.safety.messages_per_hour == 0 {
            return Err(ChatPilotError::Config(
                "safety hourly limits must be at least 1".into(),
            ));
        }
        if self.event_feed_capacity == 0 {
            self.event_feed_capacity = default_event_feed_capacity();
        }
        Ok(())
    }
}
