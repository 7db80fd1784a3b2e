use plangraph::action::{ActionError, ActionRouter, FnExecutor, Tool};
use plangraph::catalog::{ArgType, CapabilityCatalog, CatalogError, DomainFilter, ToolSpec};
use plangraph::graph::TaskError;
use plangraph::retrieval::{
    EmbeddingError, EmbeddingService, ExampleStore, RelevanceRetriever, RetrievalError,
    RetrievalRequest,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Three-keyword embedder so rankings are exact. `down` simulates an outage.
#[derive(Default)]
struct KeywordEmbedder {
    calls: AtomicUsize,
    down: AtomicBool,
}

impl EmbeddingService for KeywordEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Unavailable("embedder offline".to_string()));
        }
        let text = text.to_lowercase();
        let vector = ["phone", "email", "calendar"]
            .iter()
            .map(|keyword| text.matches(keyword).count() as f32)
            .collect::<Vec<_>>();
        if vector.iter().all(|value| *value == 0.0) {
            return Ok(vec![0.1, 0.1, 0.1]);
        }
        Ok(vector)
    }
}

fn catalog() -> CapabilityCatalog {
    let mut catalog = CapabilityCatalog::new();
    for (name, domain, description) in [
        ("get_phone_number", "contacts", "Returns the phone number of a contact."),
        ("get_email_address", "contacts", "Returns the email address of a contact."),
        ("send_sms", "sms", "Texts a phone number."),
        ("send_email", "mail", "Sends an email message."),
        ("create_calendar_event", "calendar", "Creates a calendar event."),
    ] {
        catalog
            .register(ToolSpec::new(name, domain, description).with_arg("value", ArgType::String))
            .expect("register");
    }
    catalog
}

const EXAMPLES: &str = r#"
- query: Text Sid that I am on my way
  plan: |
    1. get_phone_number("Sid")
    2. send_sms([$1], "On my way")
    3. join()<END_OF_PLAN>
- query: Email Nick the agenda
  plan: |
    1. get_email_address("Nick")
    2. send_email([$1], "Agenda", "See attached")
    3. join()<END_OF_PLAN>
- query: Put lunch with Lill in my calendar
  plan: |
    1. create_calendar_event("Lunch with Lill")
    2. join()<END_OF_PLAN>
"#;

struct Clock;

impl Tool for Clock {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("current_time", "system", "Returns the current time.")
    }

    fn invoke(&self, _args: &[Value]) -> Result<String, ActionError> {
        Ok("09:30".to_string())
    }
}

#[test]
fn catalog_rejects_reserved_duplicate_and_malformed_names() {
    let mut catalog = catalog();
    assert!(matches!(
        catalog.register(ToolSpec::new("join", "system", "reserved")),
        Err(CatalogError::InvalidToolName { .. })
    ));
    assert!(matches!(
        catalog.register(ToolSpec::new("send sms", "sms", "space")),
        Err(CatalogError::InvalidToolName { .. })
    ));
    assert_eq!(
        catalog.register(ToolSpec::new("send_sms", "sms", "again")),
        Err(CatalogError::DuplicateTool("send_sms".to_string()))
    );
    assert_eq!(
        catalog.lookup("make_coffee"),
        Err(CatalogError::UnknownTool("make_coffee".to_string()))
    );
    assert_eq!(catalog.len(), 5);
    assert_eq!(
        catalog
            .all(&DomainFilter::only(["contacts"]))
            .iter()
            .map(|spec| spec.name.as_str())
            .collect::<Vec<_>>(),
        vec!["get_phone_number", "get_email_address"]
    );
}

#[test]
fn router_prefers_bound_tools_and_falls_back_to_domain_executors() {
    let mut catalog = catalog();
    catalog.register_tool(Arc::new(Clock)).expect("register clock");
    let mut router = ActionRouter::new(Arc::new(catalog));
    router.bind_executor(
        "contacts",
        Arc::new(FnExecutor::new(|tool: &str, args: &[Value]| {
            Ok(format!("{tool}:{}", args.len()))
        })),
    );

    assert_eq!(
        router.route("current_time", &[], "what time is it", None),
        Ok("09:30".to_string())
    );
    assert_eq!(
        router.route("get_phone_number", &[json!("John")], "q", None),
        Ok("get_phone_number:1".to_string())
    );
    assert_eq!(
        router.route("send_sms", &[], "q", None),
        Err(TaskError::NoExecutor {
            tool: "send_sms".to_string(),
            domain: "sms".to_string(),
        })
    );
    assert_eq!(
        router.route("make_coffee", &[], "q", None),
        Err(TaskError::UnknownTool("make_coffee".to_string()))
    );
}

#[test]
fn example_store_reads_yaml_and_extracts_tools() {
    let store = ExampleStore::from_yaml_str(EXAMPLES).expect("examples");
    assert_eq!(store.len(), 3);
    let first = store.iter().next().expect("first example");
    assert_eq!(first.tools, vec!["get_phone_number", "send_sms"]);
}

#[test]
fn retrieval_ranks_tools_and_examples_by_similarity() {
    let embedder = Arc::new(KeywordEmbedder::default());
    let retriever = RelevanceRetriever::build(
        &catalog(),
        &ExampleStore::from_yaml_str(EXAMPLES).expect("examples"),
        embedder.clone(),
    )
    .expect("retriever");

    let retrieval = retriever
        .retrieve(&RetrievalRequest {
            query: "Send an email to Nick",
            top_k_tools: 2,
            top_k_examples: 1,
            domains: &DomainFilter::All,
        })
        .expect("retrieve");

    assert_eq!(retrieval.tool_names(), vec!["get_email_address", "send_email"]);
    assert_eq!(retrieval.examples.len(), 1);
    assert_eq!(retrieval.examples[0].query, "Email Nick the agenda");
}

#[test]
fn examples_using_disabled_tools_are_never_offered() {
    let retriever = RelevanceRetriever::build(
        &catalog(),
        &ExampleStore::from_yaml_str(EXAMPLES).expect("examples"),
        Arc::new(KeywordEmbedder::default()),
    )
    .expect("retriever");

    let retrieval = retriever
        .retrieve(&RetrievalRequest {
            query: "Text Sid",
            top_k_tools: 6,
            top_k_examples: 6,
            domains: &DomainFilter::only(["contacts", "sms"]),
        })
        .expect("retrieve");

    assert_eq!(
        retrieval.tool_names(),
        vec!["get_phone_number", "get_email_address", "send_sms"]
    );
    let queries = retrieval
        .examples
        .iter()
        .map(|example| example.query.as_str())
        .collect::<Vec<_>>();
    assert_eq!(queries, vec!["Text Sid that I am on my way"]);
}

#[test]
fn small_candidate_sets_still_embed_the_query_once() {
    let embedder = Arc::new(KeywordEmbedder::default());
    let retriever =
        RelevanceRetriever::build(&catalog(), &ExampleStore::new(), embedder.clone())
            .expect("retriever");
    let built = embedder.calls.load(Ordering::SeqCst);
    assert_eq!(built, 5);

    let retrieval = retriever
        .retrieve(&RetrievalRequest {
            query: "anything at all",
            top_k_tools: 10,
            top_k_examples: 10,
            domains: &DomainFilter::All,
        })
        .expect("retrieve");
    assert_eq!(retrieval.tools.len(), 5);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), built + 1);

    assert_eq!(
        retriever
            .retrieve(&RetrievalRequest {
                query: "   ",
                top_k_tools: 1,
                top_k_examples: 1,
                domains: &DomainFilter::All,
            })
            .err(),
        Some(RetrievalError::EmptyQuery)
    );
}

#[test]
fn embedding_outage_is_reported_even_without_ranking() {
    let embedder = Arc::new(KeywordEmbedder::default());
    let retriever =
        RelevanceRetriever::build(&catalog(), &ExampleStore::new(), embedder.clone())
            .expect("retriever");
    embedder.down.store(true, Ordering::SeqCst);

    let err = retriever
        .retrieve(&RetrievalRequest {
            query: "Text Sid",
            top_k_tools: 6,
            top_k_examples: 6,
            domains: &DomainFilter::All,
        })
        .expect_err("embedder is down");
    assert_eq!(
        err,
        RetrievalError::EmbeddingUnavailable(EmbeddingError::Unavailable(
            "embedder offline".to_string()
        ))
    );
}
