//! Token counting with exact BPE encodings and estimation fallback
//!
//! OpenAI models get exact counts through tiktoken encodings; every other
//! model family is estimated from a chars-per-token table with a small
//! overhead multiplier.

use lru::LruCache;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Mutex, OnceLock};
use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};

/// Per-family estimation factors: (name fragment, chars per token, overhead).
/// Checked in order; first fragment contained in the lowercased model wins.
const ESTIMATION_FACTORS: &[(&str, f32, f32)] = &[
    ("gpt-4o", 4.0, 1.1),
    ("gpt-4", 4.0, 1.1),
    ("gpt-3.5", 4.0, 1.1),
    ("claude", 3.5, 1.15),
    ("llama", 3.8, 1.1),
    ("mistral", 3.8, 1.1),
];

/// Fallback factors for unrecognized models.
const DEFAULT_FACTORS: (f32, f32) = (4.0, 1.15);

/// Static model table: (name, context window, output limit).
const MODEL_LIMITS: &[(&str, u32, u32)] = &[
    ("gpt-3.5-turbo", 16_385, 4_096),
    ("gpt-4", 8_192, 8_192),
    ("gpt-4-32k", 32_768, 8_192),
    ("gpt-4-turbo", 128_000, 4_096),
    ("gpt-4o", 128_000, 16_384),
    ("claude-3-haiku", 200_000, 4_096),
    ("claude-3-sonnet", 200_000, 8_192),
    ("claude-3-opus", 200_000, 8_192),
];

/// Context window for models absent from the table.
const DEFAULT_CONTEXT_WINDOW: u32 = 4_096;

/// Output limit for models absent from the table.
const DEFAULT_OUTPUT_LIMIT: u32 = 4_096;

/// Entries kept in the count cache before eviction.
const CACHE_CAPACITY: usize = 2_048;

static CL100K: OnceLock<CoreBPE> = OnceLock::new();
static O200K: OnceLock<CoreBPE> = OnceLock::new();

fn cl100k() -> &'static CoreBPE {
    CL100K.get_or_init(|| cl100k_base().expect("cl100k_base tokenizer"))
}

fn o200k() -> &'static CoreBPE {
    O200K.get_or_init(|| o200k_base().expect("o200k_base tokenizer"))
}

/// One chat message for message-level counting
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Token counter with a bounded LRU over `(model, text-hash)`
pub struct TokenCounter {
    cache: Mutex<LruCache<(String, u64), u32>>,
    use_exact: bool,
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter {
    /// Create a counter with exact encodings enabled.
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero cache capacity"),
            )),
            use_exact: true,
        }
    }

    /// Create a counter that only estimates (faster, less accurate).
    pub fn estimation_only() -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero cache capacity"),
            )),
            use_exact: false,
        }
    }

    /// Count tokens for `text` under `model`, exact where an encoding
    /// exists, estimated otherwise.
    pub fn count_tokens(&self, text: &str, model: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }

        let key = (model.to_lowercase(), hash_text(text));
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(&count) = cache.get(&key) {
                return count;
            }
        }

        let count = if self.use_exact && is_openai_model(&key.0) {
            self.count_exact(text, &key.0)
        } else {
            estimate(text, &key.0)
        };

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, count);
        }
        count
    }

    fn count_exact(&self, text: &str, model: &str) -> u32 {
        let bpe = if model.starts_with("gpt-4o") || model.starts_with("o1") {
            o200k()
        } else {
            cl100k()
        };
        bpe.encode_ordinary(text).len() as u32
    }

    /// Count tokens for a message list: per-message content and role plus
    /// a per-message overhead (4 for chat-completion models, 3 otherwise)
    /// and a final reply-priming constant.
    pub fn count_messages(&self, messages: &[ChatMessage], model: &str) -> u32 {
        let per_message_overhead = if is_openai_model(&model.to_lowercase()) { 4 } else { 3 };

        let mut total = 0;
        for message in messages {
            total += self.count_tokens(&message.content, model);
            total += self.count_tokens(&message.role, model);
            total += per_message_overhead;
        }

        // Reply priming
        total + 3
    }

    /// Context window size for `model`.
    pub fn context_window(&self, model: &str) -> u32 {
        lookup_limits(model).map_or(DEFAULT_CONTEXT_WINDOW, |(window, _)| window)
    }

    /// Maximum output tokens for `model`.
    pub fn output_limit(&self, model: &str) -> u32 {
        lookup_limits(model).map_or(DEFAULT_OUTPUT_LIMIT, |(_, output)| output)
    }

    /// Whether `text` plus `buffer` response tokens exceeds the window.
    pub fn will_exceed_limit(&self, text: &str, model: &str, buffer: u32) -> bool {
        self.count_tokens(text, model) + buffer > self.context_window(model)
    }

    /// Truncate `text` so it fits in `max_tokens` (or the model window
    /// minus a 500-token buffer). `keep_end` keeps the tail instead of the
    /// head; an ellipsis marks the cut.
    pub fn truncate_to_limit(
        &self,
        text: &str,
        model: &str,
        max_tokens: Option<u32>,
        keep_end: bool,
    ) -> String {
        let limit = max_tokens.unwrap_or_else(|| self.context_window(model).saturating_sub(500));
        let current = self.count_tokens(text, model);
        if current <= limit {
            return text.to_owned();
        }

        // Scale by the observed chars-per-token ratio with a 5% safety margin
        let char_ratio = text.len() as f32 / current.max(1) as f32;
        let target_chars = ((limit as f32 * char_ratio) * 0.95) as usize;
        let target_chars = target_chars.min(text.len());

        if keep_end {
            let start = ceil_char_boundary(text, text.len() - target_chars);
            format!("...{}", &text[start..])
        } else {
            let end = floor_boundary(text, target_chars);
            format!("{}...", &text[..end])
        }
    }

    /// Number of cached counts.
    pub fn cache_stats(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    /// Drop all cached counts.
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }
}

fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

fn is_openai_model(model: &str) -> bool {
    const PREFIXES: &[&str] = &["gpt-", "o1", "text-", "davinci", "curie", "babbage", "ada"];
    PREFIXES.iter().any(|prefix| model.starts_with(prefix))
}

fn lookup_limits(model: &str) -> Option<(u32, u32)> {
    let model = model.to_lowercase();
    MODEL_LIMITS
        .iter()
        .find(|(name, _, _)| *name == model)
        .map(|&(_, window, output)| (window, output))
}

/// Estimate tokens as `len / chars_per_token * overhead` for the model
/// family.
fn estimate(text: &str, model: &str) -> u32 {
    let (chars_per_token, overhead) = ESTIMATION_FACTORS
        .iter()
        .find(|(fragment, _, _)| model.contains(fragment))
        .map_or(DEFAULT_FACTORS, |&(_, cpt, ovh)| (cpt, ovh));

    let base = text.len() as f32 / chars_per_token;
    ((base * overhead) as u32).max(1)
}

fn floor_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}
