//! Dynamic token budgeting for context assembly
//!
//! Computes per-section token allocations from the operation kind and
//! compresses candidate context items into the resulting budget,
//! summarizing or dropping whatever does not fit.

use regex::Regex;
use std::sync::{Arc, OnceLock, RwLock};

use crate::counter::TokenCounter;
use crate::types::{BudgetSection, ContextItem, ContextItemKind, Operation, TokenBudget};

/// Fraction of the context window held back for the reply when no custom
/// budget is given.
const BASE_RESPONSE_RESERVE: f32 = 0.3;

/// Ceiling on the recent-target boost, as a fraction of the total.
const RECENT_TARGET_BOOST: f32 = 0.1;

/// Request for a budgeted context
#[derive(Debug, Clone)]
pub struct BudgetRequest {
    /// Operation kind driving the allocation table
    pub operation: Operation,
    /// File being edited
    pub target_file: Option<String>,
    /// Tokens already consumed by conversation history
    pub conversation_history_length: u32,
    /// Recently modified files
    pub recent_changes: Vec<String>,
    /// Explicit budget override
    pub custom_budget: Option<u32>,
}

impl BudgetRequest {
    /// Request for `operation` with no target and no history.
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            target_file: None,
            conversation_history_length: 0,
            recent_changes: Vec::new(),
            custom_budget: None,
        }
    }
}

/// Model metadata exposed to callers
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub context_limit: u32,
}

/// Per-operation section percentages (of the total) and response reserve.
fn operation_allocations(operation: Operation) -> (&'static [(BudgetSection, f32)], f32) {
    use BudgetSection as S;
    match operation {
        Operation::Generate => (
            &[
                (S::RepositoryOverview, 0.10),
                (S::TargetFile, 0.40),
                (S::Dependencies, 0.30),
                (S::RelatedPatterns, 0.15),
            ],
            0.05,
        ),
        Operation::Fix => (
            &[
                (S::RepositoryOverview, 0.05),
                (S::TargetFile, 0.60),
                (S::Dependencies, 0.20),
                (S::ErrorContext, 0.10),
            ],
            0.05,
        ),
        Operation::Refactor => (
            &[
                (S::RepositoryOverview, 0.10),
                (S::TargetFile, 0.50),
                (S::Dependents, 0.25),
                (S::Patterns, 0.10),
            ],
            0.05,
        ),
        Operation::Explain => (
            &[
                (S::RepositoryOverview, 0.15),
                (S::TargetFile, 0.50),
                (S::Metadata, 0.20),
            ],
            0.15,
        ),
        Operation::Test => (
            &[
                (S::RepositoryOverview, 0.10),
                (S::TargetFile, 0.40),
                (S::ExistingTests, 0.30),
                (S::Patterns, 0.10),
            ],
            0.10,
        ),
        Operation::Document => (
            &[
                (S::RepositoryOverview, 0.10),
                (S::TargetFile, 0.50),
                (S::Documentation, 0.25),
            ],
            0.10,
        ),
    }
}

/// Allocates tokens across context sections for a given model
pub struct TokenBudgeter {
    counter: Arc<TokenCounter>,
    model: RwLock<String>,
}

impl TokenBudgeter {
    /// Create a budgeter counting under `model`.
    pub fn new(counter: Arc<TokenCounter>, model: impl Into<String>) -> Self {
        Self { counter, model: RwLock::new(model.into()) }
    }

    fn model_name(&self) -> String {
        self.model.read().map(|m| m.clone()).unwrap_or_else(|_| "gpt-4".to_owned())
    }

    /// Context window of the active model.
    pub fn context_limit(&self) -> u32 {
        self.counter.context_window(&self.model_name())
    }

    /// Compute the per-section allocation for `request`.
    ///
    /// A custom budget is clamped to the context window; otherwise the
    /// window minus conversation history minus a 30% reply reserve is
    /// used. When the target file was recently modified, up to 10% of the
    /// total shifts from the unallocated remainder into `target_file`.
    pub fn calculate_budget(&self, request: &BudgetRequest) -> TokenBudget {
        let context_limit = self.context_limit();

        let total = match request.custom_budget {
            Some(custom) => custom.min(context_limit),
            None => context_limit
                .saturating_sub(request.conversation_history_length)
                .saturating_sub((context_limit as f32 * BASE_RESPONSE_RESERVE) as u32),
        };

        let (sections, reserve_pct) = operation_allocations(request.operation);
        let reserved = (total as f32 * reserve_pct) as u32;
        let mut budget = TokenBudget::new(total, reserved);

        for &(section, pct) in sections {
            let tokens = (total as f32 * pct) as u32;
            if !budget.allocate(section, tokens) {
                // Not enough left; grant whatever remains
                let remaining = budget.available;
                budget.allocate(section, remaining);
            }
        }

        let target_is_recent = request
            .target_file
            .as_ref()
            .map(|target| request.recent_changes.iter().any(|p| p == target))
            .unwrap_or(false);
        if target_is_recent && budget.allocations.contains_key(&BudgetSection::TargetFile) {
            let boost =
                budget.available.min((budget.total as f32 * RECENT_TARGET_BOOST) as u32);
            budget.allocate(BudgetSection::TargetFile, boost);
        }

        budget
    }

    /// Fit `items` into `budget`.
    ///
    /// Items are taken in importance order (cheapest first among ties) and
    /// charged against their section's allocation; an item that overflows
    /// is summarized if possible and dropped otherwise.
    pub fn compress(&self, items: Vec<ContextItem>, budget: &TokenBudget) -> Vec<ContextItem> {
        let mut sorted = items;
        sorted.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.token_count.cmp(&b.token_count))
        });

        // Context capacity: everything except the response reserve
        let capacity = budget.total.saturating_sub(budget.reserved_response);

        let mut result = Vec::new();
        let mut used_tokens = 0u32;
        let mut section_used: std::collections::BTreeMap<BudgetSection, u32> =
            budget.allocations.keys().map(|&s| (s, 0)).collect();

        for item in sorted {
            let section = allocation_key(item.kind, &item.path);

            if let Some(&used) = section_used.get(&section) {
                let limit = budget.allocation(section);
                if used >= limit {
                    continue;
                }

                let fits_section = used + item.token_count <= limit;
                let fits_total = used_tokens + item.token_count <= capacity;
                if fits_section && fits_total {
                    used_tokens += item.token_count;
                    if let Some(entry) = section_used.get_mut(&section) {
                        *entry += item.token_count;
                    }
                    result.push(item);
                } else if let Some(summary) = self.summarize_item(&item) {
                    let fits_section = used + summary.token_count <= limit;
                    let fits_total = used_tokens + summary.token_count <= capacity;
                    if fits_section && fits_total {
                        used_tokens += summary.token_count;
                        if let Some(entry) = section_used.get_mut(&section) {
                            *entry += summary.token_count;
                        }
                        result.push(summary);
                    }
                }
            } else if used_tokens + item.token_count <= capacity {
                // No allocation for this section; draw from overall capacity
                used_tokens += item.token_count;
                result.push(item);
            }
        }

        result
    }

    /// Signature-only rendition of a file item: imports, function/class
    /// definition lines, and docstring delimiters. Returns `None` for
    /// non-file items or files with no such lines.
    pub fn summarize_item(&self, item: &ContextItem) -> Option<ContextItem> {
        if item.kind != ContextItemKind::File {
            return None;
        }

        let signature = signature_line_pattern();
        let summary_lines: Vec<&str> = item
            .content
            .lines()
            .map(str::trim)
            .filter(|line| signature.is_match(line))
            .collect();

        if summary_lines.is_empty() {
            return None;
        }

        let content = summary_lines.join("\n");
        let token_count = self.counter.count_tokens(&content, &self.model_name());

        let mut summary = ContextItem::new(
            item.path.clone(),
            content,
            item.importance,
            token_count,
            ContextItemKind::Summary,
        );
        summary.metadata.insert("summarized".to_owned(), "true".to_owned());
        summary
            .metadata
            .insert("original_tokens".to_owned(), item.token_count.to_string());
        Some(summary)
    }

    /// Token estimate for `text` under the active model.
    pub fn estimate_tokens(&self, text: &str) -> u32 {
        self.counter.count_tokens(text, &self.model_name())
    }

    /// Name and window of the active model.
    pub fn model_info(&self) -> ModelInfo {
        ModelInfo { name: self.model_name(), context_limit: self.context_limit() }
    }

    /// Switch models, re-resolving the context limit.
    pub fn set_model(&self, model: impl Into<String>) {
        if let Ok(mut guard) = self.model.write() {
            *guard = model.into();
        }
    }
}

/// Section an item charges against: path hints win, then the item kind.
fn allocation_key(kind: ContextItemKind, path: &str) -> BudgetSection {
    let path_lower = path.to_lowercase();
    if path_lower.contains("dependency") || path_lower.contains("import") {
        return BudgetSection::Dependencies;
    }
    if path_lower.contains("target") || path_lower.ends_with('/') {
        return BudgetSection::TargetFile;
    }

    match kind {
        ContextItemKind::File | ContextItemKind::Function | ContextItemKind::Class => {
            BudgetSection::TargetFile
        }
        ContextItemKind::Import => BudgetSection::Dependencies,
        ContextItemKind::Summary => BudgetSection::RepositoryOverview,
        ContextItemKind::Metadata => BudgetSection::Metadata,
    }
}

fn signature_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"^(async\s+def\s|def\s|class\s|import\s|from\s|"""|''')"#)
            .expect("signature line regex")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budgeter() -> TokenBudgeter {
        TokenBudgeter::new(Arc::new(TokenCounter::new()), "gpt-4")
    }

    fn assert_invariant(budget: &TokenBudget) {
        assert_eq!(
            budget.reserved_response + budget.allocated_total() + budget.available,
            budget.total
        );
    }

    #[test]
    fn test_generate_allocation_table() {
        let budgeter = budgeter();
        let mut request = BudgetRequest::new(Operation::Generate);
        request.custom_budget = Some(8000);
        let budget = budgeter.calculate_budget(&request);

        assert_eq!(budget.total, 8000);
        assert_eq!(budget.reserved_response, 400);
        assert_eq!(budget.allocation(BudgetSection::RepositoryOverview), 800);
        assert_eq!(budget.allocation(BudgetSection::TargetFile), 3200);
        assert_eq!(budget.allocation(BudgetSection::Dependencies), 2400);
        assert_eq!(budget.allocation(BudgetSection::RelatedPatterns), 1200);
        assert_invariant(&budget);
    }

    #[test]
    fn test_custom_budget_clamped_to_context_limit() {
        let budgeter = budgeter();
        let mut request = BudgetRequest::new(Operation::Fix);
        request.custom_budget = Some(1_000_000);
        let budget = budgeter.calculate_budget(&request);
        // gpt-4 window
        assert_eq!(budget.total, 8192);
        assert_invariant(&budget);
    }

    #[test]
    fn test_default_budget_reserves_history_and_reply() {
        let budgeter = budgeter();
        let mut request = BudgetRequest::new(Operation::Explain);
        request.conversation_history_length = 1000;
        let budget = budgeter.calculate_budget(&request);
        // 8192 - 1000 - floor(8192 * 0.3)
        assert_eq!(budget.total, 8192 - 1000 - 2457);
        assert_invariant(&budget);
    }

    #[test]
    fn test_recent_target_boost_is_bounded() {
        let budgeter = budgeter();

        // Document leaves 5% of the total unallocated, so the boost draws
        // from that remainder without breaking the budget invariant.
        let mut request = BudgetRequest::new(Operation::Document);
        request.custom_budget = Some(8000);
        request.target_file = Some("main.py".to_owned());
        request.recent_changes = vec!["main.py".to_owned()];
        let boosted = budgeter.calculate_budget(&request);

        request.recent_changes.clear();
        let plain = budgeter.calculate_budget(&request);

        assert!(
            boosted.allocation(BudgetSection::TargetFile)
                > plain.allocation(BudgetSection::TargetFile)
        );
        assert!(
            boosted.allocation(BudgetSection::TargetFile)
                <= plain.allocation(BudgetSection::TargetFile) + 800
        );
        assert_invariant(&boosted);
    }

    #[test]
    fn test_zero_budget() {
        let budgeter = budgeter();
        let mut request = BudgetRequest::new(Operation::Generate);
        request.custom_budget = Some(0);
        let budget = budgeter.calculate_budget(&request);
        assert_eq!(budget.total, 0);
        assert_eq!(budget.available, 0);
        assert_invariant(&budget);

        let items = vec![ContextItem::new(
            "main.py",
            "def main():\n    pass\n",
            0.9,
            10,
            ContextItemKind::File,
        )];
        assert!(budgeter.compress(items, &budget).is_empty());
    }

    #[test]
    fn test_compress_orders_by_importance() {
        let budgeter = budgeter();
        let mut request = BudgetRequest::new(Operation::Generate);
        request.custom_budget = Some(8000);
        let budget = budgeter.calculate_budget(&request);

        let items = vec![
            ContextItem::new("low.py", "x = 1", 0.2, 50, ContextItemKind::File),
            ContextItem::new("high.py", "y = 2", 0.9, 50, ContextItemKind::File),
        ];
        let compressed = budgeter.compress(items, &budget);
        assert_eq!(compressed.len(), 2);
        assert_eq!(compressed[0].path, "high.py");
    }

    #[test]
    fn test_compress_summarizes_oversized_file() {
        let budgeter = budgeter();
        let mut request = BudgetRequest::new(Operation::Fix);
        request.custom_budget = Some(200);
        let budget = budgeter.calculate_budget(&request);

        let body = format!(
            "import os\n\n\ndef visible():\n    pass\n{}",
            "    filler = 1\n".repeat(400)
        );
        let tokens = budgeter.estimate_tokens(&body);
        let items = vec![ContextItem::new("big.py", body, 0.9, tokens, ContextItemKind::File)];

        let compressed = budgeter.compress(items, &budget);
        assert_eq!(compressed.len(), 1);
        assert_eq!(compressed[0].kind, ContextItemKind::Summary);
        assert!(compressed[0].content.contains("def visible():"));
        assert!(!compressed[0].content.contains("filler"));
        assert_eq!(compressed[0].metadata.get("summarized").map(String::as_str), Some("true"));
    }

    #[test]
    fn test_unsummarizable_item_is_dropped() {
        let budgeter = budgeter();
        let mut request = BudgetRequest::new(Operation::Fix);
        request.custom_budget = Some(100);
        let budget = budgeter.calculate_budget(&request);

        // No signature lines at all, far over budget
        let body = "plain text ".repeat(500);
        let tokens = budgeter.estimate_tokens(&body);
        let items = vec![ContextItem::new("notes.py", body, 0.9, tokens, ContextItemKind::File)];
        assert!(budgeter.compress(items, &budget).is_empty());
    }

    #[test]
    fn test_allocation_key_path_hints_win() {
        assert_eq!(
            allocation_key(ContextItemKind::File, "dependency/utils.py"),
            BudgetSection::Dependencies
        );
        assert_eq!(
            allocation_key(ContextItemKind::Summary, "target/main.py"),
            BudgetSection::TargetFile
        );
        assert_eq!(allocation_key(ContextItemKind::File, "main.py"), BudgetSection::TargetFile);
        assert_eq!(
            allocation_key(ContextItemKind::Summary, "overview"),
            BudgetSection::RepositoryOverview
        );
    }

    #[test]
    fn test_set_model_updates_limit() {
        let budgeter = budgeter();
        assert_eq!(budgeter.model_info().context_limit, 8192);
        budgeter.set_model("claude-3-opus");
        let info = budgeter.model_info();
        assert_eq!(info.name, "claude-3-opus");
        assert_eq!(info.context_limit, 200_000);
    }
}
