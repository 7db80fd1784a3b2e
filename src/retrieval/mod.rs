pub mod embedding;

pub use embedding::{cosine_similarity, EmbeddingError, EmbeddingService, HashingEmbedder};

use crate::catalog::{CapabilityCatalog, DomainFilter, ToolSpec, JOIN_TOOL};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetrievalError {
    #[error("query must be non-empty")]
    EmptyQuery,
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(#[from] EmbeddingError),
    #[error("embedding dimension mismatch for {subject}: expected {expected}, found {found}")]
    DimensionMismatch {
        subject: String,
        expected: usize,
        found: usize,
    },
}

/// A worked query/plan pair shown to the planner as an in-context example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub query: String,
    pub plan: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}

impl Example {
    pub fn new(query: &str, plan: &str) -> Self {
        Self {
            query: query.to_string(),
            plan: plan.to_string(),
            tools: tools_in_plan_text(plan),
            embedding: Vec::new(),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }
}

pub fn tools_in_plan_text(plan: &str) -> Vec<String> {
    static CALL: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(call) = CALL
        .get_or_init(|| Regex::new(r"(?m)^\s*\d+\.\s*([A-Za-z_][A-Za-z0-9_]*)\s*\(").ok())
        .as_ref()
    else {
        return Vec::new();
    };
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for caps in call.captures_iter(plan) {
        let name = &caps[1];
        if name != JOIN_TOOL && seen.insert(name.to_string()) {
            out.push(name.to_string());
        }
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct ExampleStore {
    examples: Vec<Arc<Example>>,
}

impl ExampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mut example: Example) -> Arc<Example> {
        if example.tools.is_empty() {
            example.tools = tools_in_plan_text(&example.plan);
        }
        let example = Arc::new(example);
        self.examples.push(example.clone());
        example
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, serde_yaml::Error> {
        let examples = serde_yaml::from_str::<Vec<Example>>(raw)?;
        let mut store = Self::new();
        for example in examples {
            store.insert(example);
        }
        Ok(store)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Example>> {
        self.examples.iter()
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetrievalRequest<'a> {
    pub query: &'a str,
    pub top_k_tools: usize,
    pub top_k_examples: usize,
    pub domains: &'a DomainFilter,
}

#[derive(Debug, Clone, Default)]
pub struct Retrieval {
    pub tools: Vec<Arc<ToolSpec>>,
    pub examples: Vec<Arc<Example>>,
}

impl Retrieval {
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|spec| spec.name.as_str()).collect()
    }
}

struct Indexed<T> {
    item: Arc<T>,
    vector: Vec<f32>,
}

/// Embedding index over a catalog snapshot and an example store. Tools and
/// examples without a precomputed embedding are embedded once at build time.
pub struct RelevanceRetriever {
    embedder: Arc<dyn EmbeddingService>,
    tools: Vec<Indexed<ToolSpec>>,
    examples: Vec<Indexed<Example>>,
    dimension: Option<usize>,
}

impl RelevanceRetriever {
    pub fn build(
        catalog: &CapabilityCatalog,
        examples: &ExampleStore,
        embedder: Arc<dyn EmbeddingService>,
    ) -> Result<Self, RetrievalError> {
        let mut dimension = None;
        let mut tools = Vec::with_capacity(catalog.len());
        for spec in catalog.all(&DomainFilter::All) {
            let vector = if spec.embedding.is_empty() {
                embedder.embed(&tool_embedding_text(&spec))?
            } else {
                spec.embedding.clone()
            };
            check_dimension(&mut dimension, &format!("tool `{}`", spec.name), &vector)?;
            tools.push(Indexed { item: spec, vector });
        }

        let mut indexed_examples = Vec::with_capacity(examples.len());
        for example in examples.iter() {
            let vector = if example.embedding.is_empty() {
                embedder.embed(&example.query)?
            } else {
                example.embedding.clone()
            };
            check_dimension(
                &mut dimension,
                &format!("example `{}`", example.query),
                &vector,
            )?;
            indexed_examples.push(Indexed {
                item: example.clone(),
                vector,
            });
        }

        Ok(Self {
            embedder,
            tools,
            examples: indexed_examples,
            dimension,
        })
    }

    pub fn retrieve(&self, request: &RetrievalRequest<'_>) -> Result<Retrieval, RetrievalError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(RetrievalError::EmptyQuery);
        }

        let eligible_tools = self
            .tools
            .iter()
            .filter(|entry| request.domains.allows(&entry.item.domain))
            .collect::<Vec<_>>();
        let enabled = eligible_tools
            .iter()
            .map(|entry| entry.item.name.as_str())
            .collect::<BTreeSet<_>>();
        let eligible_examples = self
            .examples
            .iter()
            .filter(|entry| {
                entry
                    .item
                    .tools
                    .iter()
                    .all(|tool| enabled.contains(tool.as_str()))
            })
            .collect::<Vec<_>>();

        let query_vector = self.embedder.embed(query)?;
        if let Some(expected) = self.dimension {
            if query_vector.len() != expected {
                return Err(RetrievalError::DimensionMismatch {
                    subject: "query".to_string(),
                    expected,
                    found: query_vector.len(),
                });
            }
        }

        Ok(Retrieval {
            tools: top_k(&eligible_tools, &query_vector, request.top_k_tools),
            examples: top_k(&eligible_examples, &query_vector, request.top_k_examples),
        })
    }
}

fn tool_embedding_text(spec: &ToolSpec) -> String {
    format!("{} {}", spec.name.replace('_', " "), spec.description)
}

fn check_dimension(
    dimension: &mut Option<usize>,
    subject: &str,
    vector: &[f32],
) -> Result<(), RetrievalError> {
    match dimension {
        Some(expected) if *expected != vector.len() => Err(RetrievalError::DimensionMismatch {
            subject: subject.to_string(),
            expected: *expected,
            found: vector.len(),
        }),
        Some(_) => Ok(()),
        None => {
            *dimension = Some(vector.len());
            Ok(())
        }
    }
}

/// Best `k` candidates by cosine similarity. A set no larger than `k` is
/// returned in registration order without scoring.
fn top_k<T>(candidates: &[&Indexed<T>], query: &[f32], k: usize) -> Vec<Arc<T>> {
    if k == 0 {
        return Vec::new();
    }
    if candidates.len() <= k {
        return candidates
            .iter()
            .take(k)
            .map(|entry| entry.item.clone())
            .collect();
    };

    let mut scored = candidates
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let score = cosine_similarity(query, &entry.vector);
            let score = if score.is_nan() { f32::NEG_INFINITY } else { score };
            (index, score)
        })
        .collect::<Vec<_>>();
    scored.sort_by(|left, right| right.1.total_cmp(&left.1).then(left.0.cmp(&right.0)));
    scored
        .into_iter()
        .take(k)
        .map(|(index, _)| candidates[index].item.clone())
        .collect()
}
