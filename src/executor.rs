use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::engine::ActionExecutor;
use crate::error::ChatPilotError;
use crate::patterns::{ActionType, PatternAction};
use crate::protocol::WorkerCommand;
use crate::supervisor::CommandSink;

/// Turns pattern actions into worker commands for one session.
pub struct CommandActionExecutor {
    sink: Arc<dyn CommandSink>,
    session_id: String,
    default_chat: Option<String>,
}

impl CommandActionExecutor {
    pub fn new(sink: Arc<dyn CommandSink>, session_id: &str, default_chat: Option<String>) -> Self {
        Self {
            sink,
            session_id: session_id.to_string(),
            default_chat,
        }
    }

    fn chat_for(&self, action: &PatternAction) -> Result<String, ChatPilotError> {
        action
            .data
            .target_bot
            .clone()
            .filter(|c| !c.trim().is_empty())
            .or_else(|| self.default_chat.clone())
            .ok_or_else(|| ChatPilotError::Worker {
                session: self.session_id.clone(),
                msg: format!("no target chat for {} action", action.action_type),
            })
    }
}

/// The command for `action`, or `None` for actions that never reach the worker.
pub fn command_for(
    action: &PatternAction,
    chat_id: String,
) -> Result<Option<WorkerCommand>, String> {
    let data = &action.data;
    let command = match action.action_type {
        ActionType::Wait => return Ok(None),
        ActionType::Click => match (&data.button_text, &data.callback_data) {
            (Some(text), _) => WorkerCommand::ClickReplyButton {
                chat_id,
                button_text: text.clone(),
            },
            (None, Some(callback)) => WorkerCommand::ClickButton {
                chat_id,
                message_id: data.message_id,
                callback_data: callback.clone(),
            },
            (None, None) => return Err("click action has neither buttonText nor callbackData".into()),
        },
        ActionType::Callback => {
            let Some(callback) = &data.callback_data else {
                return Err("callback action has no callbackData".into());
            };
            WorkerCommand::ClickButton {
                chat_id,
                message_id: data.message_id,
                callback_data: callback.clone(),
            }
        }
        ActionType::Message => {
            let Some(text) = data.message_text.as_ref().filter(|t| !t.is_empty()) else {
                return Err("message action has no messageText".into());
            };
            WorkerCommand::SendMessage {
                chat_id,
                text: text.clone(),
            }
        }
        ActionType::Like => WorkerCommand::Like { chat_id },
        ActionType::Dislike => WorkerCommand::Dislike { chat_id },
        ActionType::NextProfile => WorkerCommand::NextProfile { chat_id },
    };
    Ok(Some(command))
}

#[async_trait]
impl ActionExecutor for CommandActionExecutor {
    async fn execute(&self, action: &PatternAction) -> Result<bool, ChatPilotError> {
        if action.action_type == ActionType::Wait {
            let wait_ms = action.data.wait_ms.unwrap_or(0);
            debug!(session_id = %self.session_id, wait_ms, "Wait action");
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            return Ok(true);
        }

        let chat_id = self.chat_for(action)?;
        let command = match command_for(action, chat_id) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(true),
            Err(reason) => {
                warn!(session_id = %self.session_id, "{reason}");
                return Ok(false);
            }
        };
        self.sink.send_command(&self.session_id, &command).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::ActionData;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, WorkerCommand)>>,
    }

    #[async_trait]
    impl CommandSink for RecordingSink {
        async fn send_command(
            &self,
            session_id: &str,
            command: &WorkerCommand,
        ) -> Result<(), ChatPilotError> {
            self.sent
                .lock()
                .unwrap()
                .push((session_id.to_string(), command.clone()));
            Ok(())
        }
    }

    struct DeadSink;

    #[async_trait]
    impl CommandSink for DeadSink {
        async fn send_command(
            &self,
            session_id: &str,
            _command: &WorkerCommand,
        ) -> Result<(), ChatPilotError> {
            Err(ChatPilotError::WorkerNotRunning(session_id.to_string()))
        }
    }

    fn action(action_type: ActionType, data: ActionData) -> PatternAction {
        PatternAction {
            action_type,
            data,
            sequence_order: 1,
            delay_after_ms: 0,
        }
    }

    #[test]
    fn test_click_prefers_reply_button_text() {
        let a = action(
            ActionType::Click,
            ActionData {
                button_text: Some("Yes".into()),
                callback_data: Some("cb".into()),
                ..Default::default()
            },
        );
        assert_eq!(
            command_for(&a, "7".into()).unwrap(),
            Some(WorkerCommand::ClickReplyButton {
                chat_id: "7".into(),
                button_text: "Yes".into()
            })
        );
    }

    #[test]
    fn test_callback_maps_to_click_button() {
        let a = action(
            ActionType::Callback,
            ActionData {
                callback_data: Some("like_1".into()),
                message_id: Some(44),
                ..Default::default()
            },
        );
        assert_eq!(
            command_for(&a, "7".into()).unwrap(),
            Some(WorkerCommand::ClickButton {
                chat_id: "7".into(),
                message_id: Some(44),
                callback_data: "like_1".into()
            })
        );
    }

    #[test]
    fn test_incomplete_actions_rejected() {
        assert!(command_for(&action(ActionType::Message, ActionData::default()), "1".into()).is_err());
        assert!(command_for(&action(ActionType::Callback, ActionData::default()), "1".into()).is_err());
        assert!(command_for(&action(ActionType::Click, ActionData::default()), "1".into()).is_err());
        assert_eq!(
            command_for(&action(ActionType::Wait, ActionData::default()), "1".into()).unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_execute_uses_target_bot_then_default_chat() {
        let sink = Arc::new(RecordingSink::default());
        let executor = CommandActionExecutor::new(sink.clone(), "acc1", Some("default".into()));

        let targeted = action(
            ActionType::Like,
            ActionData {
                target_bot: Some("bot".into()),
                ..Default::default()
            },
        );
        assert!(executor.execute(&targeted).await.unwrap());
        assert!(executor
            .execute(&action(ActionType::NextProfile, ActionData::default()))
            .await
            .unwrap());

        let sent = sink.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                ("acc1".to_string(), WorkerCommand::Like { chat_id: "bot".into() }),
                (
                    "acc1".to_string(),
                    WorkerCommand::NextProfile {
                        chat_id: "default".into()
                    }
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_execute_without_chat_fails() {
        let executor = CommandActionExecutor::new(Arc::new(RecordingSink::default()), "acc1", None);
        let err = executor
            .execute(&action(ActionType::Like, ActionData::default()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no target chat"));
    }

    #[tokio::test]
    async fn test_execute_reports_dead_worker() {
        let executor = CommandActionExecutor::new(Arc::new(DeadSink), "acc1", Some("c".into()));
        let err = executor
            .execute(&action(ActionType::Dislike, ActionData::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatPilotError::WorkerNotRunning(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_without_sending() {
        let sink = Arc::new(RecordingSink::default());
        let executor = CommandActionExecutor::new(sink.clone(), "acc1", None);
        let wait = action(
            ActionType::Wait,
            ActionData {
                wait_ms: Some(1500),
                ..Default::default()
            },
        );
        let started = tokio::time::Instant::now();
        assert!(executor.execute(&wait).await.unwrap());
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert!(sink.sent.lock().unwrap().is_empty());
    }
}
