//! Pattern recording and replay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::config::PatternConfig;
use crate::db::{call_blocking, Database};
use crate::error::ChatPilotError;
use crate::notify::Notifier;
use crate::patterns::{NewPattern, Pattern, PatternAction};
use crate::throttle::{SafetyThrottle, ThrottleKind};

/// Performs one pattern action. `Ok(false)` and `Err` both abort the run.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &PatternAction) -> Result<bool, ChatPilotError>;
}

pub struct PatternEngine {
    db: Arc<Database>,
    throttle: Arc<SafetyThrottle>,
    notifier: Arc<dyn Notifier>,
    config: PatternConfig,
    recordings: Mutex<HashMap<i64, Vec<PatternAction>>>,
}

impl PatternEngine {
    pub fn new(
        db: Arc<Database>,
        throttle: Arc<SafetyThrottle>,
        notifier: Arc<dyn Notifier>,
        config: PatternConfig,
    ) -> Self {
        Self {
            db,
            throttle,
            notifier,
            config,
            recordings: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    fn lock_recordings(&self) -> MutexGuard<'_, HashMap<i64, Vec<PatternAction>>> {
        match self.recordings.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ----- recording -----

    /// Open an empty buffer, discarding any unsaved one for the account.
    pub fn start_recording(&self, account_id: i64) {
        self.lock_recordings().insert(account_id, Vec::new());
        info!(account_id, "Started pattern recording");
    }

    /// Append to the open buffer with the next sequence number.
    /// Returns false when the account is not recording.
    pub fn record(&self, account_id: i64, mut action: PatternAction) -> bool {
        let mut recordings = self.lock_recordings();
        let Some(buffer) = recordings.get_mut(&account_id) else {
            warn!(account_id, "No active recording");
            return false;
        };
        action.sequence_order = buffer.len() as i64 + 1;
        info!(
            account_id,
            sequence_order = action.sequence_order,
            action_type = action.action_type.as_str(),
            "Recorded action"
        );
        buffer.push(action);
        true
    }

    pub fn is_recording(&self, account_id: i64) -> bool {
        self.lock_recordings().contains_key(&account_id)
    }

    pub fn peek_recorded_actions(&self, account_id: i64) -> Vec<PatternAction> {
        self.lock_recordings()
            .get(&account_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Persist the buffer as a new pattern. An empty or missing buffer yields `None`.
    pub async fn stop_recording(
        &self,
        account_id: i64,
        name: &str,
        description: Option<&str>,
    ) -> Result<Option<Pattern>, ChatPilotError> {
        let actions = self.lock_recordings().remove(&account_id).unwrap_or_default();
        if actions.is_empty() {
            info!(account_id, "Recording stopped with no actions");
            return Ok(None);
        }

        let count = actions.len();
        let new_pattern = NewPattern {
            name: name.to_string(),
            description: description.map(str::to_string),
            actions,
            repeat_count: 1,
            delay_between_ms: self.config.recorded_delay_between_ms,
        };
        let pattern = call_blocking(self.db.clone(), move |db| {
            let id = db.create_pattern(&new_pattern)?;
            db.get_pattern(id)
        })
        .await?;
        info!(account_id, name, actions = count, "Saved recorded pattern");
        Ok(pattern)
    }

    /// Drop every open buffer; used on shutdown.
    pub fn discard_recordings(&self) {
        self.lock_recordings().clear();
    }

    // ----- execution -----

    /// Run a pattern to completion and return the execution id.
    ///
    /// Any abort marks the execution failed, writes an error log row, alerts
    /// the operator and returns the error. Nothing is retried.
    pub async fn execute(
        &self,
        pattern_id: i64,
        account_id: i64,
        executor: &dyn ActionExecutor,
    ) -> Result<i64, ChatPilotError> {
        let pattern = call_blocking(self.db.clone(), move |db| db.get_pattern(pattern_id))
            .await?
            .ok_or(ChatPilotError::PatternNotFound(pattern_id))?;
        let execution_id = call_blocking(self.db.clone(), move |db| {
            db.create_execution(pattern_id, account_id)
        })
        .await?;
        info!(
            pattern_id,
            account_id,
            execution_id,
            name = %pattern.name,
            "Pattern execution started"
        );

        match self
            .run_actions(&pattern, account_id, execution_id, executor)
            .await
        {
            Ok(()) => {
                self.finish_completed(&pattern, account_id, execution_id)
                    .await?;
                Ok(execution_id)
            }
            Err(e) => {
                self.finish_failed(&pattern, account_id, execution_id, &e)
                    .await;
                Err(e)
            }
        }
    }

    async fn run_actions(
        &self,
        pattern: &Pattern,
        account_id: i64,
        execution_id: i64,
        executor: &dyn ActionExecutor,
    ) -> Result<(), ChatPilotError> {
        let mut actions = pattern.actions.clone();
        actions.sort_by_key(|a| a.sequence_order);
        let repeats = pattern.repeat_count.max(1);

        for repeat in 0..repeats {
            for (i, action) in actions.iter().enumerate() {
                let index = i + 1;
                let reservation = if self.throttle.is_strict() {
                    match self.throttle.try_reserve(account_id, ThrottleKind::Action) {
                        Some(r) => Some(r),
                        None => return Err(throttle_exceeded(account_id)),
                    }
                } else {
                    if !self
                        .throttle
                        .can_perform_action(account_id, ThrottleKind::Action)
                    {
                        return Err(throttle_exceeded(account_id));
                    }
                    None
                };

                let progress = call_blocking(self.db.clone(), move |db| {
                    db.set_execution_progress(execution_id, repeat, index as i64)
                })
                .await;
                if let Err(e) = progress {
                    if let Some(r) = reservation {
                        self.throttle.cancel(r);
                    }
                    return Err(e);
                }

                let failure = match executor.execute(action).await {
                    Ok(true) => None,
                    Ok(false) => Some("executor reported failure".to_string()),
                    Err(e) => Some(e.to_string()),
                };
                if let Some(reason) = failure {
                    if let Some(r) = reservation {
                        self.throttle.cancel(r);
                    }
                    return Err(ChatPilotError::ActionFailed {
                        index,
                        action_type: action.action_type.as_str().to_string(),
                        reason,
                    });
                }

                match reservation {
                    Some(r) => self.throttle.commit(r),
                    None => self.throttle.log_action(account_id, ThrottleKind::Action),
                }

                let base = positive_ms(action.delay_after_ms)
                    .unwrap_or(self.config.default_action_delay_ms);
                tokio::time::sleep(Duration::from_millis(base) + self.throttle.random_delay())
                    .await;
            }

            if repeat + 1 < repeats {
                let base = positive_ms(pattern.delay_between_ms)
                    .unwrap_or(self.config.default_repeat_delay_ms);
                tokio::time::sleep(Duration::from_millis(base) + self.throttle.random_delay())
                    .await;
            }
        }
        Ok(())
    }

    async fn finish_completed(
        &self,
        pattern: &Pattern,
        account_id: i64,
        execution_id: i64,
    ) -> Result<(), ChatPilotError> {
        let message = format!("Pattern \"{}\" completed successfully", pattern.name);
        let data = serde_json::json!({ "pattern_id": pattern.id, "execution_id": execution_id })
            .to_string();
        call_blocking(self.db.clone(), move |db| {
            db.complete_execution(execution_id)?;
            db.log_event(Some(account_id), "info", "pattern", &message, Some(&data))
        })
        .await?;
        self.throttle.log_action(account_id, ThrottleKind::Pattern);
        info!(
            pattern_id = pattern.id,
            account_id, execution_id, "Pattern execution completed"
        );
        Ok(())
    }

    async fn finish_failed(
        &self,
        pattern: &Pattern,
        account_id: i64,
        execution_id: i64,
        cause: &ChatPilotError,
    ) {
        let error_message = cause.to_string();
        error!(
            pattern_id = pattern.id,
            account_id, execution_id, "Pattern execution failed: {error_message}"
        );

        let log_message = format!("Pattern \"{}\" failed: {error_message}", pattern.name);
        let data = serde_json::json!({ "pattern_id": pattern.id, "execution_id": execution_id })
            .to_string();
        let stored_message = error_message.clone();
        let log_id = call_blocking(self.db.clone(), move |db| {
            db.fail_execution(execution_id, &stored_message)?;
            db.log_event(Some(account_id), "error", "pattern", &log_message, Some(&data))
        })
        .await;
        let log_id = match log_id {
            Ok(id) => Some(id),
            Err(e) => {
                error!(execution_id, "Failed to record execution failure: {e}");
                None
            }
        };

        self.notifier
            .alert(
                &format!("Pattern \"{}\" failed", pattern.name),
                &format!("Account: {account_id}\nError: {error_message}"),
                log_id,
            )
            .await;
    }
}

fn throttle_exceeded(account_id: i64) -> ChatPilotError {
    ChatPilotError::ThrottleExceeded {
        account_id,
        kind: ThrottleKind::Action.as_str().to_string(),
    }
}

fn positive_ms(value: i64) -> Option<u64> {
    (value > 0).then_some(value as u64)
}
