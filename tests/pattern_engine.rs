//! Pattern playback scenarios against an in-memory database.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chatpilot::config::{PatternConfig, SafetyConfig};
use chatpilot::db::{Database, LogFilter};
use chatpilot::engine::{ActionExecutor, PatternEngine};
use chatpilot::error::ChatPilotError;
use chatpilot::notify::Notifier;
use chatpilot::patterns::{ActionData, ActionType, ExecutionStatus, NewPattern, PatternAction};
use chatpilot::throttle::{SafetyThrottle, ThrottleKind};

#[derive(Default)]
struct RecordingNotifier {
    alerts: Mutex<Vec<(String, String, Option<i64>)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn alert(&self, title: &str, body: &str, correlation_id: Option<i64>) {
        self.alerts
            .lock()
            .unwrap()
            .push((title.to_string(), body.to_string(), correlation_id));
    }
}

/// Succeeds for every call except the 1-based `fail_on` call.
struct ScriptedExecutor {
    calls: Mutex<Vec<ActionType>>,
    fail_on: Option<(usize, bool)>,
}

impl ScriptedExecutor {
    fn ok() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_on: None,
        }
    }

    /// `raise` selects an `Err` instead of `Ok(false)`.
    fn failing_at(call: usize, raise: bool) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_on: Some((call, raise)),
        }
    }

    fn calls(&self) -> Vec<ActionType> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionExecutor for ScriptedExecutor {
    async fn execute(&self, action: &PatternAction) -> Result<bool, ChatPilotError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(action.action_type);
            calls.len()
        };
        match self.fail_on {
            Some((call, true)) if call == n => Err(ChatPilotError::WorkerNotRunning("acc1".into())),
            Some((call, false)) if call == n => Ok(false),
            _ => Ok(true),
        }
    }
}

struct Fixture {
    db: Arc<Database>,
    throttle: Arc<SafetyThrottle>,
    notifier: Arc<RecordingNotifier>,
    engine: PatternEngine,
    account_id: i64,
}

fn fixture(safety: SafetyConfig) -> Fixture {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let account_id = db.sync_accounts(&["acc1".to_string()]).unwrap()[0].id;
    let throttle = Arc::new(SafetyThrottle::new(safety, Some(db.clone())));
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = PatternEngine::new(
        db.clone(),
        throttle.clone(),
        notifier.clone(),
        PatternConfig::default(),
    );
    Fixture {
        db,
        throttle,
        notifier,
        engine,
        account_id,
    }
}

fn action(action_type: ActionType, order: i64, delay_after_ms: i64) -> PatternAction {
    PatternAction {
        action_type,
        data: ActionData {
            message_text: Some("hello".into()),
            ..Default::default()
        },
        sequence_order: order,
        delay_after_ms,
    }
}

/// like(500) then message(1000), twice, 1500 ms between passes.
fn like_then_message(db: &Database) -> i64 {
    db.create_pattern(&NewPattern {
        name: "Like and greet".into(),
        description: None,
        actions: vec![
            action(ActionType::Message, 2, 1000),
            action(ActionType::Like, 1, 500),
        ],
        repeat_count: 2,
        delay_between_ms: 1500,
    })
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_full_run_completes_in_order() {
    let f = fixture(SafetyConfig::default());
    let pattern_id = like_then_message(&f.db);
    let executor = ScriptedExecutor::ok();

    let started = tokio::time::Instant::now();
    let execution_id = f
        .engine
        .execute(pattern_id, f.account_id, &executor)
        .await
        .unwrap();

    assert_eq!(
        executor.calls(),
        vec![
            ActionType::Like,
            ActionType::Message,
            ActionType::Like,
            ActionType::Message
        ]
    );

    let execution = f.db.get_execution(execution_id).unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.current_action, 2);
    assert_eq!(execution.current_repeat, 1);
    assert!(execution.completed_at.is_some());

    let stats = f.throttle.account_stats(f.account_id);
    assert_eq!(stats.actions_last_hour, 4);
    assert_eq!(stats.patterns_last_hour, 1);

    // 4 action pauses + 1 repeat pause, each with at least 3000 ms of jitter.
    assert!(started.elapsed() >= Duration::from_millis(500 + 1000 + 1500 + 500 + 1000 + 5 * 3000));

    let logs = f
        .db
        .list_logs(&LogFilter {
            category: Some("pattern".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].level, "info");
    assert_eq!(logs[0].message, "Pattern \"Like and greet\" completed successfully");
    assert!(f.notifier.alerts.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failure_on_second_action_aborts() {
    let f = fixture(SafetyConfig::default());
    let pattern_id = like_then_message(&f.db);
    let executor = ScriptedExecutor::failing_at(2, false);

    let err = f
        .engine
        .execute(pattern_id, f.account_id, &executor)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatPilotError::ActionFailed { index: 2, .. }));
    assert!(err.to_string().starts_with("Action 2 (message) failed"));
    assert_eq!(executor.calls(), vec![ActionType::Like, ActionType::Message]);

    let execution = &f.db.list_executions(Some(f.account_id), 10).unwrap()[0];
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.current_action, 2);
    assert!(execution
        .error_message
        .as_deref()
        .unwrap()
        .contains("Action 2 (message)"));

    // The failed action gives its throttle slot back.
    assert_eq!(f.throttle.account_stats(f.account_id).actions_last_hour, 1);

    let error_logs = f
        .db
        .list_logs(&LogFilter {
            level: Some("error".into()),
            category: Some("pattern".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(error_logs.len(), 1);
    assert!(error_logs[0]
        .message
        .starts_with("Pattern \"Like and greet\" failed: Action 2 (message)"));

    let alerts = f.notifier.alerts.lock().unwrap().clone();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].1.starts_with(&format!("Account: {}\nError: Action 2", f.account_id)));
    assert_eq!(alerts[0].2, Some(error_logs[0].id));
}

#[tokio::test(start_paused = true)]
async fn test_raised_executor_error_is_annotated() {
    let f = fixture(SafetyConfig::default());
    let pattern_id = like_then_message(&f.db);
    let executor = ScriptedExecutor::failing_at(1, true);

    let err = f
        .engine
        .execute(pattern_id, f.account_id, &executor)
        .await
        .unwrap_err();
    let text = err.to_string();
    assert!(text.starts_with("Action 1 (like) failed"));
    assert!(text.contains("not running"));
    assert_eq!(executor.calls().len(), 1);
    assert_eq!(f.notifier.alerts.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_throttle_ceiling_aborts_run() {
    let f = fixture(SafetyConfig {
        actions_per_hour: 3,
        ..SafetyConfig::default()
    });
    let pattern_id = like_then_message(&f.db);
    let executor = ScriptedExecutor::ok();

    let err = f
        .engine
        .execute(pattern_id, f.account_id, &executor)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatPilotError::ThrottleExceeded { .. }));
    assert_eq!(executor.calls().len(), 3);

    let execution = &f.db.list_executions(Some(f.account_id), 10).unwrap()[0];
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(f.notifier.alerts.lock().unwrap().len(), 1);
    assert!(!f
        .throttle
        .can_perform_action(f.account_id, ThrottleKind::Action));
}

#[tokio::test(start_paused = true)]
async fn test_check_then_log_mode_counts_every_action() {
    let f = fixture(SafetyConfig {
        strict: false,
        ..SafetyConfig::default()
    });
    let pattern_id = like_then_message(&f.db);
    f.engine
        .execute(pattern_id, f.account_id, &ScriptedExecutor::ok())
        .await
        .unwrap();
    assert_eq!(f.throttle.account_stats(f.account_id).actions_last_hour, 4);
}

#[tokio::test(start_paused = true)]
async fn test_non_positive_delays_use_defaults() {
    let f = fixture(SafetyConfig {
        min_delay_ms: 0,
        max_delay_ms: 0,
        ..SafetyConfig::default()
    });
    let pattern_id = f
        .db
        .create_pattern(&NewPattern {
            name: "defaults".into(),
            description: None,
            actions: vec![action(ActionType::NextProfile, 1, 0)],
            repeat_count: 2,
            delay_between_ms: -1,
        })
        .unwrap();

    let started = tokio::time::Instant::now();
    f.engine
        .execute(pattern_id, f.account_id, &ScriptedExecutor::ok())
        .await
        .unwrap();
    let elapsed = started.elapsed();
    // 1000 after each action, 2000 between the passes.
    assert!(elapsed >= Duration::from_millis(4000));
    assert!(elapsed < Duration::from_millis(5000));
}

#[tokio::test]
async fn test_unknown_pattern_creates_nothing() {
    let f = fixture(SafetyConfig::default());
    let err = f
        .engine
        .execute(12345, f.account_id, &ScriptedExecutor::ok())
        .await
        .unwrap_err();
    assert!(matches!(err, ChatPilotError::PatternNotFound(12345)));
    assert!(f.db.list_executions(None, 10).unwrap().is_empty());
    assert!(f.notifier.alerts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_recorded_pattern_replays() {
    let f = fixture(SafetyConfig {
        min_delay_ms: 0,
        max_delay_ms: 0,
        ..SafetyConfig::default()
    });
    f.engine.start_recording(f.account_id);
    for kind in [ActionType::Callback, ActionType::Click, ActionType::Like] {
        assert!(f.engine.record(f.account_id, action(kind, 99, 1)));
    }
    let pattern = f
        .engine
        .stop_recording(f.account_id, "Recorded", None)
        .await
        .unwrap()
        .unwrap();
    let orders: Vec<i64> = pattern.actions.iter().map(|a| a.sequence_order).collect();
    assert_eq!(orders, vec![1, 2, 3]);

    let executor = ScriptedExecutor::ok();
    f.engine
        .execute(pattern.id, f.account_id, &executor)
        .await
        .unwrap();
    assert_eq!(
        executor.calls(),
        vec![ActionType::Callback, ActionType::Click, ActionType::Like]
    );
}
