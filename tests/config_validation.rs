//! Integration tests for configuration loading and validation.

use chatpilot::config::Config;
use chatpilot::error::ChatPilotError;

#[test]
fn test_full_yaml_document() {
    let yaml = r#"
data_dir: /var/lib/chatpilot
sessions_dir: /var/lib/chatpilot/sessions
worker_command: "python3 -u worker.py"
worker_restart_backoff_ms: 2500
llm_base_url: https://api.example.test/openai
api_key: sk-test
model: small-model
ai_temperature: 0.4
ai_max_tokens: 300
safety:
  min_delay_ms: 100
  max_delay_ms: 200
  actions_per_hour: 10
  messages_per_hour: 5
pattern:
  recorded_action_delay_ms: 750
notifier:
  telegram_bot_token: "123:abc"
  chat_id: 42
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.worker_command, "python3 -u worker.py");
    assert_eq!(config.worker_restart_backoff_ms, 2500);
    assert_eq!(config.worker_stop_grace_ms, 3000);
    assert_eq!(config.model, "small-model");
    assert_eq!(config.ai_max_tokens, 300);
    assert_eq!(config.safety.actions_per_hour, 10);
    assert!(config.safety.strict);
    assert_eq!(config.pattern.recorded_action_delay_ms, 750);
    assert_eq!(config.pattern.default_repeat_delay_ms, 2000);
    assert!(config.notifier.is_configured());
    assert_eq!(
        config.runtime_data_dir(),
        std::path::Path::new("/var/lib/chatpilot")
            .join("runtime")
            .to_string_lossy()
            .to_string()
    );
}

#[test]
fn test_empty_document_uses_defaults() {
    let config = Config::from_yaml("{}").unwrap();
    assert_eq!(config.sessions_dir, "./sessions");
    assert_eq!(config.llm_base_url, "https://api.openai.com/v1");
    assert_eq!(config.event_feed_capacity, 1024);
}

#[test]
fn test_zero_values_fall_back() {
    let config =
        Config::from_yaml("ai_max_tokens: 0\nai_context_messages: 0\nevent_feed_capacity: 0\n")
            .unwrap();
    assert_eq!(config.ai_max_tokens, 150);
    assert_eq!(config.ai_context_messages, 20);
    assert_eq!(config.event_feed_capacity, 1024);
}

#[test]
fn test_invalid_documents_are_config_errors() {
    for yaml in [
        "safety: [1, 2]\n",
        "safety:\n  actions_per_hour: 0\n",
        "safety:\n  min_delay_ms: 10\n  max_delay_ms: 5\n",
        "ai_temperature: -1\n",
        "worker_command: ''\n",
    ] {
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(
            matches!(err, ChatPilotError::Config(_)),
            "expected config error for {yaml:?}, got {err}"
        );
    }
}

#[test]
fn test_notifier_needs_token_and_chat() {
    let config = Config::from_yaml("notifier:\n  telegram_bot_token: '123:abc'\n").unwrap();
    assert!(!config.notifier.is_configured());
    let config = Config::from_yaml("notifier:\n  telegram_bot_token: ' '\n  chat_id: 1\n").unwrap();
    assert!(!config.notifier.is_configured());
}
