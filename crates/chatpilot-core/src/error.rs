use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatPilotError {
    #[error("LLM API error: {0}")]
    LlmApi(String),

    #[error("AI generation failed: {0}")]
    AiGeneration(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Pattern not found: {0}")]
    PatternNotFound(i64),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(i64),

    #[error("Account not found: {0}")]
    AccountNotFound(i64),

    #[error("{kind} limit reached for account {account_id}, wait before continuing")]
    ThrottleExceeded { account_id: i64, kind: String },

    #[error("Action {index} ({action_type}) failed: {reason}")]
    ActionFailed {
        index: usize,
        action_type: String,
        reason: String,
    },

    #[error("Worker for session {0} is not running")]
    WorkerNotRunning(String),

    #[error("Worker {session}: {msg}")]
    Worker { session: String, msg: String },

    #[error("Background task error: {0}")]
    Task(String),
}
