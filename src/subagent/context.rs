use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokenizers::Tokenizer;

pub const DEFAULT_CONTEXT_LENGTH: usize = 4096;
pub const DEFAULT_RESERVED_TOKENS: usize = 500;
const ESTIMATED_CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, thiserror::Error)]
#[error("failed to load tokenizer {path}: {reason}")]
pub struct TokenizerLoadError {
    pub path: String,
    pub reason: String,
}

#[derive(Clone)]
pub enum TokenCounter {
    Estimate { chars_per_token: usize },
    Tokenizer(Arc<Tokenizer>),
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::Estimate {
            chars_per_token: ESTIMATED_CHARS_PER_TOKEN,
        }
    }
}

impl fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Estimate { chars_per_token } => f
                .debug_struct("Estimate")
                .field("chars_per_token", chars_per_token)
                .finish(),
            Self::Tokenizer(_) => f.write_str("Tokenizer"),
        }
    }
}

impl TokenCounter {
    pub fn from_tokenizer_file(path: &Path) -> Result<Self, TokenizerLoadError> {
        let tokenizer = Tokenizer::from_file(path).map_err(|err| TokenizerLoadError {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self::Tokenizer(Arc::new(tokenizer)))
    }

    pub fn count(&self, text: &str) -> usize {
        match self {
            Self::Estimate { chars_per_token } => estimate_tokens(text, *chars_per_token),
            Self::Tokenizer(tokenizer) => match tokenizer.encode(text, false) {
                Ok(encoding) => encoding.get_ids().len(),
                Err(_) => estimate_tokens(text, ESTIMATED_CHARS_PER_TOKEN),
            },
        }
    }

    pub fn truncate(&self, text: &str, max_tokens: usize) -> String {
        match self {
            Self::Estimate { chars_per_token } => {
                truncate_chars(text, max_tokens.saturating_mul((*chars_per_token).max(1)))
            }
            Self::Tokenizer(tokenizer) => {
                let decoded = tokenizer.encode(text, false).and_then(|encoding| {
                    let ids = encoding.get_ids();
                    let keep = ids.len().min(max_tokens);
                    tokenizer.decode(&ids[..keep], true)
                });
                match decoded {
                    Ok(out) => out,
                    Err(_) => truncate_chars(
                        text,
                        max_tokens.saturating_mul(ESTIMATED_CHARS_PER_TOKEN),
                    ),
                }
            }
        }
    }
}

/// Token budget for one sub-agent prompt: the model's context length minus
/// a reserve for the generated output.
#[derive(Debug, Clone)]
pub struct ContextBudget {
    context_length: usize,
    reserved: usize,
    counter: TokenCounter,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_LENGTH, TokenCounter::default())
    }
}

impl ContextBudget {
    pub fn new(context_length: usize, counter: TokenCounter) -> Self {
        Self {
            context_length,
            reserved: DEFAULT_RESERVED_TOKENS.min(context_length / 2),
            counter,
        }
    }

    pub fn with_reserved(mut self, reserved: usize) -> Self {
        self.reserved = reserved;
        self
    }

    pub fn context_length(&self) -> usize {
        self.context_length
    }

    pub fn available_for(&self, fixed: &str) -> usize {
        self.context_length
            .saturating_sub(self.reserved)
            .saturating_sub(self.counter.count(fixed))
    }

    /// Trims `content` from the end until `fixed` and `content` fit.
    pub fn fit(&self, fixed: &str, content: &str) -> String {
        let available = self.available_for(fixed);
        if self.counter.count(content) <= available {
            return content.to_string();
        }
        self.counter.truncate(content, available)
    }
}

fn estimate_tokens(text: &str, chars_per_token: usize) -> usize {
    let chars = text.chars().count();
    chars.div_ceil(chars_per_token.max(1))
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}
