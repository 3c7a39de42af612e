use std::sync::Arc;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{CallbackQuery, InlineKeyboardButton, InlineKeyboardMarkup};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::NotifierConfig;
use crate::db::{call_blocking, Database, LogRecord};

const VIEW_LOG_PREFIX: &str = "view_log:";

/// Operator alerts. Fire-and-forget: implementations log delivery failures
/// and never return them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn alert(&self, title: &str, body: &str, correlation_id: Option<i64>);
}

/// Used when no operator chat is configured; alerts only reach the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn alert(&self, title: &str, body: &str, correlation_id: Option<i64>) {
        info!(correlation_id, "ALERT {title}: {body}");
    }
}

pub struct TelegramNotifier {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramNotifier {
    pub fn new(token: &str, chat_id: i64) -> Self {
        Self {
            bot: Bot::new(token),
            chat_id: ChatId(chat_id),
        }
    }
}

fn alert_text(title: &str, body: &str) -> String {
    format!("{title}\n\n{body}")
}

fn alert_keyboard(log_id: i64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
        "Details",
        format!("{VIEW_LOG_PREFIX}{log_id}"),
    )]])
}

/// Log id carried by a "Details" button press.
pub fn parse_view_log(data: &str) -> Option<i64> {
    data.strip_prefix(VIEW_LOG_PREFIX)?.trim().parse().ok()
}

pub fn log_details_text(record: &LogRecord) -> String {
    format!(
        "Log #{}\n\nLevel: {}\nCategory: {}\nMessage: {}\nData: {}\nTime: {}",
        record.id,
        record.level,
        record.category,
        record.message,
        record.data.as_deref().unwrap_or("none"),
        record.created_at
    )
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn alert(&self, title: &str, body: &str, correlation_id: Option<i64>) {
        let mut request = self.bot.send_message(self.chat_id, alert_text(title, body));
        if let Some(log_id) = correlation_id {
            request = request.reply_markup(alert_keyboard(log_id));
        }
        if let Err(e) = request.await {
            error!("Failed to deliver alert '{title}': {e}");
        }
    }
}

#[derive(Clone, Copy)]
struct OperatorChat(ChatId);

/// Answer "Details" presses on alerts with the stored log row. `None` when no
/// bot is configured.
pub fn spawn_alert_callbacks(
    config: &NotifierConfig,
    db: Arc<Database>,
) -> Option<JoinHandle<()>> {
    if !config.is_configured() {
        return None;
    }
    let token = config.telegram_bot_token.clone()?;
    let chat = OperatorChat(ChatId(config.chat_id?));
    let bot = Bot::new(token);
    Some(tokio::spawn(async move {
        let handler = Update::filter_callback_query().endpoint(handle_callback);
        Dispatcher::builder(bot, handler)
            .default_handler(|_| async {})
            .dependencies(dptree::deps![db, chat])
            .build()
            .dispatch()
            .await;
    }))
}

async fn handle_callback(
    bot: Bot,
    query: CallbackQuery,
    db: Arc<Database>,
    chat: OperatorChat,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    bot.answer_callback_query(query.id.clone()).await?;
    let Some(log_id) = query.data.as_deref().and_then(parse_view_log) else {
        debug!(data = ?query.data, "Ignoring unknown alert callback");
        return Ok(());
    };
    let text = match call_blocking(db, move |db| db.get_log(log_id)).await? {
        Some(record) => log_details_text(&record),
        None => format!("Log #{log_id} not found"),
    };
    bot.send_message(chat.0, text).await?;
    Ok(())
}

pub fn create_notifier(config: &NotifierConfig) -> Arc<dyn Notifier> {
    match (&config.telegram_bot_token, config.chat_id) {
        (Some(token), Some(chat_id)) if config.is_configured() => {
            Arc::new(TelegramNotifier::new(token, chat_id))
        }
        _ => Arc::new(LogNotifier),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_text_layout() {
        assert_eq!(alert_text("Match", "Account: a1"), "Match\n\nAccount: a1");
    }

    #[test]
    fn test_alert_keyboard_round_trips_log_id() {
        let keyboard = alert_keyboard(42);
        let json = serde_json::to_value(&keyboard).unwrap();
        let row = json["inline_keyboard"][0].as_array().unwrap().clone();
        assert_eq!(row.len(), 1);
        let data = row[0]["callback_data"].as_str().unwrap();
        assert_eq!(parse_view_log(data), Some(42));
    }

    #[test]
    fn test_parse_view_log_rejects_other_callbacks() {
        assert_eq!(parse_view_log("view_log: 7"), Some(7));
        assert_eq!(parse_view_log("retry_pattern:7"), None);
        assert_eq!(parse_view_log("view_log:abc"), None);
    }

    #[test]
    fn test_log_details_text() {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .log_event(Some(1), "error", "pattern", "Pattern \"x\" failed", None)
            .unwrap();
        let record = db.get_log(id).unwrap().unwrap();
        let text = log_details_text(&record);
        assert!(text.starts_with(&format!("Log #{id}\n\nLevel: error\nCategory: pattern")));
        assert!(text.contains("Message: Pattern \"x\" failed"));
        assert!(text.contains("Data: none"));
    }

    #[test]
    fn test_callbacks_need_configured_bot() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let config = NotifierConfig {
            telegram_bot_token: Some("123:abc".into()),
            chat_id: None,
        };
        assert!(spawn_alert_callbacks(&config, db).is_none());
    }
}
