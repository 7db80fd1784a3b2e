pub mod error;
pub mod load;
pub mod settings;

pub use error::ConfigError;
pub use load::load_settings;
pub use settings::{
    LoggingSettings, ModelConfig, OrchestrationSettings, OrchestratorSettings, PlannerSettings,
    RetrievalSettings, SchedulerSettings,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DomainFilter;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn empty_yaml_uses_documented_defaults() {
        let settings: OrchestrationSettings = serde_yaml::from_str("{}").expect("parse settings");
        assert_eq!(settings.retrieval.top_k_tools, 6);
        assert_eq!(settings.retrieval.top_k_examples, 6);
        assert_eq!(settings.planner.max_parse_retries, 2);
        assert_eq!(settings.orchestrator.max_replans, 2);
        assert_eq!(settings.scheduler.max_concurrency, 4);
        assert_eq!(settings.scheduler.task_timeout_ms, 30_000);
        assert_eq!(settings.scheduler.plan_timeout_ms, 120_000);
        assert_eq!(settings.domain_filter(), DomainFilter::All);
        settings.validate().expect("defaults validate");
    }

    #[test]
    fn full_settings_parse_and_convert_to_scheduler_config() {
        let settings: OrchestrationSettings = serde_yaml::from_str(
            r#"
completion:
  endpoint: http://localhost:8080/v1
  model: planner-model
  api_key_env: PLANGRAPH_TEST_KEY
sub_agent:
  endpoint: http://localhost:8081/v1
  model: writer-model
  context_length: 2048
  tokenizer_path: /models/tokenizer.json
retrieval:
  top_k_tools: 4
  top_k_examples: 3
scheduler:
  max_concurrency: 8
  task_timeout_ms: 1500
  max_retries: 1
  backoff_base_ms: 50
  backoff_max_ms: 400
  plan_timeout_ms: 10000
  grace_period_ms: 250
enabled_domains: [contacts, sms]
custom_instructions: Always sign emails as Sam.
logging:
  path: /tmp/plangraph/events.log
"#,
        )
        .expect("parse settings");
        settings.validate().expect("validate");

        let config = settings.scheduler.to_config();
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.task_timeout, Duration::from_millis(1500));
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.backoff_max, Duration::from_millis(400));
        assert_eq!(config.grace_period, Duration::from_millis(250));

        let sub_agent = settings.sub_agent.as_ref().expect("sub agent");
        assert_eq!(sub_agent.context_length, 2048);
        assert_eq!(
            sub_agent.tokenizer_path,
            Some(PathBuf::from("/models/tokenizer.json"))
        );
        assert_eq!(settings.domain_filter(), DomainFilter::only(["contacts", "sms"]));
        assert_eq!(
            settings.logging.path,
            Some(PathBuf::from("/tmp/plangraph/events.log"))
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_yaml::from_str::<OrchestrationSettings>(
            r#"
scheduler:
  max_concurency: 3
"#,
        )
        .expect_err("typo must fail");
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn validation_rejects_zero_limits_and_inverted_backoff() {
        let mut settings = OrchestrationSettings::default();
        settings.scheduler.max_concurrency = 0;
        match settings.validate().expect_err("zero concurrency") {
            ConfigError::Validation(message) => assert!(message.contains("max_concurrency")),
            other => panic!("unexpected error: {other:?}"),
        }

        let mut settings = OrchestrationSettings::default();
        settings.scheduler.plan_timeout_ms = 0;
        match settings.validate().expect_err("zero timeout") {
            ConfigError::Validation(message) => assert!(message.contains("plan_timeout_ms")),
            other => panic!("unexpected error: {other:?}"),
        }

        let mut settings = OrchestrationSettings::default();
        settings.scheduler.backoff_base_ms = 9_000;
        match settings.validate().expect_err("inverted backoff") {
            ConfigError::Validation(message) => assert!(message.contains("backoff_base_ms")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn validation_rejects_blank_model_identifier() {
        let settings: OrchestrationSettings = serde_yaml::from_str(
            r#"
completion:
  endpoint: http://localhost:8080/v1
  model: "  "
"#,
        )
        .expect("parse settings");
        match settings.validate().expect_err("blank model") {
            ConfigError::Validation(message) => assert!(message.contains("completion.model")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn load_settings_reads_and_validates_a_file() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("plangraph.yaml");
        fs::write(&path, "orchestrator:\n  max_replans: 5\n").expect("write config");
        let settings = load_settings(&path).expect("load settings");
        assert_eq!(settings.orchestrator.max_replans, 5);

        let missing = load_settings(&temp.path().join("missing.yaml")).expect_err("missing file");
        assert!(matches!(missing, ConfigError::Read { .. }));

        fs::write(&path, "scheduler: [").expect("write bad config");
        let bad = load_settings(&path).expect_err("bad yaml");
        assert!(matches!(bad, ConfigError::Parse { .. }));
    }

    #[test]
    fn api_key_is_read_from_the_named_variable() {
        let _guard = ENV_LOCK.lock().expect("env lock");
        let model = ModelConfig {
            endpoint: "http://localhost".to_string(),
            model: "m".to_string(),
            context_length: 1024,
            api_key_env: Some("PLANGRAPH_CONFIG_TEST_KEY".to_string()),
            request_timeout_ms: 1000,
            tokenizer_path: None,
        };
        std::env::set_var("PLANGRAPH_CONFIG_TEST_KEY", "secret");
        assert_eq!(model.api_key().as_deref(), Some("secret"));
        std::env::remove_var("PLANGRAPH_CONFIG_TEST_KEY");
        assert_eq!(model.api_key(), None);
    }
}
