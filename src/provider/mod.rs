pub mod openai;

pub use openai::OpenAiCompatibleClient;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("`{section}.endpoint` must be an http(s) url, found `{endpoint}`")]
    InvalidEndpoint { section: String, endpoint: String },
    #[error("`{section}` expects an api key in environment variable `{variable}`, which is unset")]
    MissingApiKey { section: String, variable: String },
}
