use plangraph::action::{ActionExecutor, FnExecutor};
use plangraph::catalog::{ArgType, CapabilityCatalog, DomainFilter, ToolSpec};
use plangraph::config::{load_settings, ConfigError};
use plangraph::orchestrator::{OrchestrationError, Orchestrator};
use plangraph::retrieval::ExampleStore;
use serde_json::Value;
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

fn contacts_catalog() -> CapabilityCatalog {
    let mut catalog = CapabilityCatalog::new();
    catalog
        .register(
            ToolSpec::new("get_phone_number", "contacts", "Returns a phone number.")
                .with_arg("name", ArgType::String),
        )
        .expect("register");
    catalog
}

#[test]
fn settings_file_builds_an_orchestrator() {
    let temp = tempdir().expect("temp dir");
    let log_path = temp.path().join("events.log");
    let config_path = temp.path().join("plangraph.yaml");
    fs::write(
        &config_path,
        format!(
            "completion:\n  endpoint: http://127.0.0.1:9/v1\n  model: planner\n\
retrieval:\n  top_k_tools: 3\n\
orchestrator:\n  max_replans: 1\n\
enabled_domains: [contacts, writing]\n\
custom_instructions: Keep answers short.\n\
logging:\n  path: {}\n",
            log_path.display()
        ),
    )
    .expect("write config");

    let settings = load_settings(&config_path).expect("load");
    let contacts: Arc<dyn ActionExecutor> =
        Arc::new(FnExecutor::new(|_tool: &str, _args: &[Value]| {
            Ok("+1-555-0100".to_string())
        }));
    let orchestrator = Orchestrator::from_settings(
        &settings,
        contacts_catalog(),
        vec![("contacts".to_string(), contacts)],
        ExampleStore::new(),
    )
    .expect("orchestrator");

    assert_eq!(orchestrator.limits().top_k_tools, 3);
    assert_eq!(orchestrator.limits().max_replans, 1);
    assert_eq!(
        orchestrator.default_domains(),
        &DomainFilter::only(["contacts", "writing"])
    );
    assert_eq!(orchestrator.event_log().path(), Some(log_path.as_path()));
    assert_eq!(orchestrator.catalog().len(), 4);
}

#[test]
fn unreachable_planner_surfaces_a_planning_error() {
    let temp = tempdir().expect("temp dir");
    let config_path = temp.path().join("plangraph.yaml");
    fs::write(
        &config_path,
        "completion:\n  endpoint: http://127.0.0.1:9/v1\n  model: planner\n  request_timeout_ms: 500\n\
planner:\n  max_parse_retries: 0\n",
    )
    .expect("write config");
    let settings = load_settings(&config_path).expect("load");
    let orchestrator =
        Orchestrator::from_settings(&settings, contacts_catalog(), Vec::new(), ExampleStore::new())
            .expect("orchestrator");

    let err = orchestrator
        .run_turn("What is John's number?", &DomainFilter::All, None)
        .expect_err("no server");
    assert!(matches!(
        err,
        OrchestrationError::PlanningExhausted { attempts: 1, .. }
    ));
}

#[test]
fn invalid_settings_are_reported_before_anything_is_built() {
    let temp = tempdir().expect("temp dir");
    let config_path = temp.path().join("plangraph.yaml");
    fs::write(&config_path, "scheduler:\n  max_concurrency: 0\n").expect("write config");
    assert!(matches!(
        load_settings(&config_path),
        Err(ConfigError::Validation(_))
    ));

    fs::write(
        &config_path,
        "completion:\n  endpoint: localhost:8080\n  model: planner\n",
    )
    .expect("write config");
    let settings = load_settings(&config_path).expect("scheme is checked later");
    let err = Orchestrator::from_settings(
        &settings,
        contacts_catalog(),
        Vec::new(),
        ExampleStore::new(),
    )
    .err()
    .expect("bad endpoint");
    assert!(matches!(err, OrchestrationError::Config(ref message) if message.contains("http")));
}
