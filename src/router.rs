//! Dispatch of decoded worker events.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::db::{call_blocking, Account, AccountUpdate, Database, PeerUpdate, ProfileUpdate};
use crate::engine::PatternEngine;
use crate::error::ChatPilotError;
use crate::llm_types::Role;
use crate::notify::Notifier;
use crate::patterns::{ActionData, ActionType, PatternAction};
use crate::protocol::{
    ButtonClickData, CallbackData, ConnectedData, DialogSyncedData, ErrorData, EventPayload,
    MatchData, MessageData, ProfileData, WorkerCommand, WorkerEvent,
};
use crate::responder::AiResponder;
use crate::supervisor::CommandSink;
use crate::text::preview;
use crate::throttle::{Reservation, SafetyThrottle, ThrottleKind};

pub struct EventRouter {
    db: Arc<Database>,
    commands: Arc<dyn CommandSink>,
    responder: Arc<AiResponder>,
    engine: Arc<PatternEngine>,
    throttle: Arc<SafetyThrottle>,
    notifier: Arc<dyn Notifier>,
    feed: broadcast::Sender<WorkerEvent>,
}

impl EventRouter {
    pub fn new(
        db: Arc<Database>,
        commands: Arc<dyn CommandSink>,
        responder: Arc<AiResponder>,
        engine: Arc<PatternEngine>,
        throttle: Arc<SafetyThrottle>,
        notifier: Arc<dyn Notifier>,
        feed_capacity: usize,
    ) -> Self {
        let (feed, _) = broadcast::channel(feed_capacity.max(1));
        Self {
            db,
            commands,
            responder,
            engine,
            throttle,
            notifier,
            feed,
        }
    }

    /// Every event, before any processing. Lagging subscribers lose events.
    pub fn subscribe_feed(&self) -> broadcast::Receiver<WorkerEvent> {
        self.feed.subscribe()
    }

    /// Consume events until the channel closes. A failing event is logged and skipped.
    pub async fn run(&self, mut events: mpsc::Receiver<WorkerEvent>) {
        while let Some(event) = events.recv().await {
            let session_id = event.session_id.clone();
            let kind = event.payload.kind();
            if let Err(e) = self.handle(event).await {
                error!(session_id = %session_id, kind, "Event handling failed: {e}");
            }
        }
        debug!("Event stream closed");
    }

    pub async fn handle(&self, event: WorkerEvent) -> Result<(), ChatPilotError> {
        let _ = self.feed.send(event.clone());

        let session_id = event.session_id.clone();
        let lookup = session_id.clone();
        let account = call_blocking(self.db.clone(), move |db| db.get_account_by_session(&lookup))
            .await?;
        let Some(account) = account else {
            warn!(session_id = %session_id, kind = event.payload.kind(), "Unknown session");
            return Ok(());
        };

        if self.engine.is_recording(account.id) {
            let delay = self.engine.config().recorded_action_delay_ms;
            if let Some(action) = recorded_action(&event.payload, delay) {
                self.engine.record(account.id, action);
            }
        }

        match event.payload {
            EventPayload::Message(data) => self.on_message(&account, data).await,
            EventPayload::Callback(data) => {
                on_callback(&account, &data);
                Ok(())
            }
            EventPayload::ButtonClick(data) => {
                on_button_click(&account, &data);
                Ok(())
            }
            EventPayload::Profile(data) => self.on_profile(&account, data).await,
            EventPayload::Match(data) => self.on_match(&account, data).await,
            EventPayload::Error(data) => self.on_error(&account, data).await,
            EventPayload::DialogSynced(data) => self.on_dialog_synced(&account, data).await,
            EventPayload::Connected(data) => self.on_connected(&account, data).await,
        }
    }

    async fn on_message(&self, account: &Account, data: MessageData) -> Result<(), ChatPilotError> {
        let account_id = account.id;
        let raw = serde_json::to_string(&data)?;
        let chat_id = data.chat_id.clone();
        let text = data.text.clone();
        let peer = PeerUpdate {
            peer_user_id: data.sender_id.clone(),
            peer_username: data.sender_username.clone(),
            peer_first_name: data.sender_name.clone(),
            ..Default::default()
        };
        let (inbound_chat, inbound_text) = (chat_id.clone(), text.clone());
        let conversation = call_blocking(self.db.clone(), move |db| {
            let conversation = db.upsert_conversation(account_id, &inbound_chat, &peer)?;
            db.add_message(conversation.id, Role::User.as_str(), &inbound_text, Some(&raw))?;
            Ok(conversation)
        })
        .await?;
        debug!(
            session_id = %account.session_id,
            chat_id = %chat_id,
            "Inbound message: {}",
            preview(&text, 80)
        );

        if !(account.ai_enabled && conversation.ai_mode) {
            return Ok(());
        }

        let reservation = if self.throttle.is_strict() {
            match self.throttle.try_reserve(account_id, ThrottleKind::Message) {
                Some(r) => Some(r),
                None => {
                    warn!(account_id, "Message limit reached, skipping AI reply");
                    return Ok(());
                }
            }
        } else {
            if !self
                .throttle
                .can_perform_action(account_id, ThrottleKind::Message)
            {
                warn!(account_id, "Message limit reached, skipping AI reply");
                return Ok(());
            }
            None
        };

        let reply = match self
            .responder
            .generate_reply(conversation.id, &text, None)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                error!(session_id = %account.session_id, "AI error: {e}");
                self.release(reservation);
                return Ok(());
            }
        };

        let command = WorkerCommand::SendMessage {
            chat_id,
            text: reply.clone(),
        };
        if let Err(e) = self
            .commands
            .send_command(&account.session_id, &command)
            .await
        {
            error!(session_id = %account.session_id, "Failed to send AI reply: {e}");
            self.release(reservation);
            return Ok(());
        }
        match reservation {
            Some(r) => self.throttle.commit(r),
            None => self.throttle.log_action(account_id, ThrottleKind::Message),
        }

        let conversation_id = conversation.id;
        call_blocking(self.db.clone(), move |db| {
            db.add_message(conversation_id, Role::Assistant.as_str(), &reply, None)
        })
        .await?;
        info!(session_id = %account.session_id, conversation_id, "AI reply sent");
        Ok(())
    }

    fn release(&self, reservation: Option<Reservation>) {
        if let Some(r) = reservation {
            self.throttle.cancel(r);
        }
    }

    async fn on_profile(&self, account: &Account, data: ProfileData) -> Result<(), ChatPilotError> {
        let Some(target) = data.target_id().map(str::to_string) else {
            warn!(session_id = %account.session_id, "Profile event without user_id or chat_id");
            return Ok(());
        };
        info!(
            session_id = %account.session_id,
            name = data.name.as_deref().unwrap_or("?"),
            age = data.age,
            "New profile"
        );
        let account_id = account.id;
        let update = ProfileUpdate {
            name: data.name,
            age: data.age,
            description: data.description,
            photos: data.photos,
            ..Default::default()
        };
        call_blocking(self.db.clone(), move |db| {
            db.save_dating_profile(account_id, &target, &update)
        })
        .await
    }

    async fn on_match(&self, account: &Account, data: MatchData) -> Result<(), ChatPilotError> {
        let account_id = account.id;
        let target = data.user_id.clone();
        let update = ProfileUpdate {
            name: data.name.clone(),
            matched: Some(true),
            ..Default::default()
        };
        call_blocking(self.db.clone(), move |db| {
            db.save_dating_profile(account_id, &target, &update)
        })
        .await?;

        let name = data.name.as_deref().unwrap_or("Unknown");
        info!(session_id = %account.session_id, name, "New match");
        self.notifier
            .alert(
                "New match!",
                &format!("Account: {}\nName: {name}", account.session_id),
                None,
            )
            .await;
        Ok(())
    }

    async fn on_error(&self, account: &Account, data: ErrorData) -> Result<(), ChatPilotError> {
        let account_id = account.id;
        let message = data.message.clone();
        let details = serde_json::to_string(&data)?;
        call_blocking(self.db.clone(), move |db| {
            db.log_event(Some(account_id), "error", "worker", &message, Some(&details))
        })
        .await?;
        self.notifier
            .alert(
                "Client error",
                &format!("{}: {}", account.session_id, data.message),
                None,
            )
            .await;
        Ok(())
    }

    async fn on_dialog_synced(
        &self,
        account: &Account,
        data: DialogSyncedData,
    ) -> Result<(), ChatPilotError> {
        let name = data
            .name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "Unknown".to_string());
        let peer = PeerUpdate {
            peer_username: Some(name.clone()),
            peer_first_name: Some(name.clone()),
            ..Default::default()
        };
        let account_id = account.id;
        let chat_id = data.chat_id.clone();
        call_blocking(self.db.clone(), move |db| {
            db.upsert_conversation(account_id, &chat_id, &peer)
        })
        .await?;
        debug!(session_id = %account.session_id, chat_id = %data.chat_id, name = %name, "Synced dialog");
        Ok(())
    }

    async fn on_connected(&self, account: &Account, data: ConnectedData) -> Result<(), ChatPilotError> {
        let account_id = account.id;
        let update = AccountUpdate {
            phone: data.phone,
            username: data.username,
            first_name: data.first_name,
            last_name: data.last_name,
            ..Default::default()
        };
        call_blocking(self.db.clone(), move |db| db.update_account(account_id, &update)).await?;
        info!(session_id = %account.session_id, user_id = ?data.user_id, "Worker connected");
        Ok(())
    }
}

fn on_callback(account: &Account, data: &CallbackData) {
    info!(
        session_id = %account.session_id,
        callback = data.callback_data.as_deref().unwrap_or(""),
        "Callback"
    );
}

fn on_button_click(account: &Account, data: &ButtonClickData) {
    debug!(
        session_id = %account.session_id,
        button = data.button_text.as_deref().unwrap_or(""),
        "Button click"
    );
}

/// The pattern action a callback or button click turns into while recording.
fn recorded_action(payload: &EventPayload, delay_after_ms: i64) -> Option<PatternAction> {
    let (action_type, data) = match payload {
        EventPayload::Callback(cb) => (
            ActionType::Callback,
            ActionData {
                callback_data: cb.callback_data.clone(),
                target_bot: cb.chat_id.clone(),
                message_id: cb.message_id,
                ..Default::default()
            },
        ),
        EventPayload::ButtonClick(click) => (
            ActionType::Click,
            ActionData {
                button_text: click.button_text.clone(),
                callback_data: click.callback_data.clone(),
                target_bot: click.chat_id.clone(),
                message_id: click.message_id,
                ..Default::default()
            },
        ),
        _ => return None,
    };
    Some(PatternAction {
        action_type,
        data,
        sequence_order: 0,
        delay_after_ms,
    })
}
