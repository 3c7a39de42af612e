use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::accounts::sync_from_sessions;
use crate::config::Config;
use crate::db::{call_blocking, Account, Database};
use crate::engine::PatternEngine;
use crate::error::ChatPilotError;
use crate::executor::CommandActionExecutor;
use crate::llm::{create_provider, CompletionProvider};
use crate::notify::{create_notifier, spawn_alert_callbacks, Notifier};
use crate::protocol::WorkerEvent;
use crate::responder::AiResponder;
use crate::router::EventRouter;
use crate::supervisor::{ProcessSupervisor, SupervisorConfig};
use crate::throttle::{self, SafetyThrottle};

/// Owns every long-lived tracker: worker processes, throttle windows and
/// recording buffers. Several can coexist; nothing is process-global.
pub struct Orchestrator {
    pub config: Config,
    pub db: Arc<Database>,
    pub notifier: Arc<dyn Notifier>,
    pub supervisor: ProcessSupervisor,
    pub throttle: Arc<SafetyThrottle>,
    pub engine: Arc<PatternEngine>,
    pub responder: Arc<AiResponder>,
    pub router: Arc<EventRouter>,
    events: Mutex<Option<mpsc::Receiver<WorkerEvent>>>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Result<Self, ChatPilotError> {
        let db = Arc::new(Database::new(&config.runtime_data_dir())?);
        let notifier = create_notifier(&config.notifier);
        let provider = create_provider(&config);
        Self::from_parts(config, db, notifier, provider)
    }

    pub fn from_parts(
        config: Config,
        db: Arc<Database>,
        notifier: Arc<dyn Notifier>,
        provider: Arc<dyn CompletionProvider>,
    ) -> Result<Self, ChatPilotError> {
        let mut defaults = vec![
            ("default_system_prompt", config.default_system_prompt.clone()),
            ("ai_temperature", config.ai_temperature.to_string()),
            ("ai_max_tokens", config.ai_max_tokens.to_string()),
        ];
        defaults.extend(throttle::default_settings(&config.safety));
        db.seed_settings(&defaults)?;

        let (supervisor, events) =
            ProcessSupervisor::new(SupervisorConfig::from_config(&config), notifier.clone());
        let throttle = Arc::new(SafetyThrottle::new(config.safety.clone(), Some(db.clone())));
        let engine = Arc::new(PatternEngine::new(
            db.clone(),
            throttle.clone(),
            notifier.clone(),
            config.pattern.clone(),
        ));
        let responder = Arc::new(AiResponder::new(db.clone(), provider, &config));
        let router = Arc::new(EventRouter::new(
            db.clone(),
            Arc::new(supervisor.clone()),
            responder.clone(),
            engine.clone(),
            throttle.clone(),
            notifier.clone(),
            config.event_feed_capacity,
        ));

        Ok(Self {
            config,
            db,
            notifier,
            supervisor,
            throttle,
            engine,
            responder,
            router,
            events: Mutex::new(Some(events)),
        })
    }

    /// Start routing worker events. Only the first call spawns a task.
    pub fn spawn_router(&self) -> Option<JoinHandle<()>> {
        let events = match self.events.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }?;
        let router = self.router.clone();
        Some(tokio::spawn(async move { router.run(events).await }))
    }

    pub async fn sync_accounts(&self) -> Result<Vec<Account>, ChatPilotError> {
        sync_from_sessions(self.db.clone(), Path::new(&self.config.sessions_dir)).await
    }

    /// Start workers for active accounts, limited to `only` when non-empty.
    /// Returns how many started.
    pub async fn start_workers(&self, only: &[String]) -> Result<usize, ChatPilotError> {
        let accounts = self.sync_accounts().await?;
        let mut started = 0;
        for account in accounts.iter().filter(|a| a.is_active) {
            if !only.is_empty() && !only.contains(&account.session_id) {
                continue;
            }
            match self.supervisor.start(&account.session_id).await {
                Ok(()) => started += 1,
                Err(e) => error!(session_id = %account.session_id, "Failed to start worker: {e}"),
            }
        }
        info!(started, "Workers started");
        Ok(started)
    }

    /// Run a stored pattern for an account through its worker.
    pub async fn run_pattern(
        &self,
        pattern_id: i64,
        account_id: i64,
        default_chat: Option<String>,
    ) -> Result<i64, ChatPilotError> {
        let account = call_blocking(self.db.clone(), move |db| db.get_account(account_id))
            .await?
            .ok_or(ChatPilotError::AccountNotFound(account_id))?;
        let executor = CommandActionExecutor::new(
            Arc::new(self.supervisor.clone()),
            &account.session_id,
            default_chat,
        );
        self.engine.execute(pattern_id, account_id, &executor).await
    }

    /// Stop every worker and drop throttle windows and recording buffers.
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.supervisor.stop_all().await;
        self.throttle.clear();
        self.engine.discard_recordings();
    }

    pub async fn run_until_ctrl_c(&self, only: &[String]) -> anyhow::Result<()> {
        let router = self.spawn_router();
        let callbacks = spawn_alert_callbacks(&self.config.notifier, self.db.clone());
        let started = self.start_workers(only).await?;
        if started == 0 {
            warn!(
                "No workers started; check sessions_dir ({})",
                self.config.sessions_dir
            );
        }
        tokio::signal::ctrl_c().await?;
        self.shutdown().await;
        for handle in [router, callbacks].into_iter().flatten() {
            handle.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_types::ChatMessage;
    use crate::notify::LogNotifier;
    use crate::patterns::{ActionData, ActionType, PatternAction};
    use async_trait::async_trait;

    struct Silent;

    #[async_trait]
    impl CompletionProvider for Silent {
        async fn complete(
            &self,
            _messages: Vec<ChatMessage>,
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<String, ChatPilotError> {
            Ok(String::new())
        }
    }

    fn orchestrator(sessions_dir: &str) -> Orchestrator {
        let config = Config {
            sessions_dir: sessions_dir.to_string(),
            ..Config::default()
        };
        Orchestrator::from_parts(
            config,
            Arc::new(Database::open_in_memory().unwrap()),
            Arc::new(LogNotifier),
            Arc::new(Silent),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_settings_seeded_without_overwriting() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.set_setting("ai_max_tokens", "42").unwrap();
        let _ = Orchestrator::from_parts(
            Config::default(),
            db.clone(),
            Arc::new(LogNotifier),
            Arc::new(Silent),
        )
        .unwrap();
        assert_eq!(db.get_setting("ai_max_tokens").unwrap().as_deref(), Some("42"));
        assert_eq!(db.get_setting("ai_temperature").unwrap().as_deref(), Some("0.9"));
        assert_eq!(
            db.get_setting(throttle::SETTING_ACTIONS_PER_HOUR).unwrap().as_deref(),
            Some("30")
        );
        assert_eq!(
            db.get_setting(throttle::SETTING_MIN_DELAY).unwrap().as_deref(),
            Some("3000")
        );
    }

    #[tokio::test]
    async fn test_safety_settings_are_live() {
        let orch = orchestrator("./missing");
        assert_eq!(orch.throttle.account_stats(1).messages_limit, 20);
        orch.db
            .set_setting(throttle::SETTING_MESSAGES_PER_HOUR, "5")
            .unwrap();
        assert_eq!(orch.throttle.account_stats(1).messages_limit, 5);
    }

    #[tokio::test]
    async fn test_router_spawns_once() {
        let orch = orchestrator("./missing");
        let handle = orch.spawn_router();
        assert!(handle.is_some());
        assert!(orch.spawn_router().is_none());
        orch.shutdown().await;
        if let Some(h) = handle {
            h.abort();
        }
    }

    #[tokio::test]
    async fn test_instances_are_independent() {
        let a = orchestrator("./missing");
        let b = orchestrator("./missing");
        a.engine.start_recording(1);
        a.throttle.log_action(1, crate::throttle::ThrottleKind::Action);
        assert!(!b.engine.is_recording(1));
        assert_eq!(b.throttle.account_stats(1).actions_last_hour, 0);

        a.shutdown().await;
        assert!(!a.engine.is_recording(1));
        assert_eq!(a.throttle.account_stats(1).actions_last_hour, 0);
    }

    #[tokio::test]
    async fn test_run_pattern_unknown_account() {
        let orch = orchestrator("./missing");
        let err = orch.run_pattern(1, 99, None).await.unwrap_err();
        assert!(matches!(err, ChatPilotError::AccountNotFound(99)));
    }

    #[tokio::test]
    async fn test_run_pattern_without_worker_fails_execution() {
        let orch = orchestrator("./missing");
        let account_id = orch.db.sync_accounts(&["acc1".to_string()]).unwrap()[0].id;
        let pattern_id = orch
            .db
            .create_pattern(&crate::patterns::NewPattern {
                name: "p".into(),
                description: None,
                actions: vec![PatternAction {
                    action_type: ActionType::Like,
                    data: ActionData::default(),
                    sequence_order: 1,
                    delay_after_ms: 0,
                }],
                repeat_count: 1,
                delay_between_ms: 0,
            })
            .unwrap();

        let err = orch
            .run_pattern(pattern_id, account_id, Some("bot".into()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Action 1 (like)"));
        let executions = orch.db.list_executions(Some(account_id), 10).unwrap();
        assert_eq!(executions[0].status.as_str(), "failed");
    }
}
