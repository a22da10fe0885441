//! Context synthesis for edit operations
//!
//! Assembles the token-budgeted excerpt an LLM receives alongside a user
//! prompt. Each operation kind gets its own section ordering; the
//! budgeted path additionally scores candidates and compresses them
//! through the token budgeter.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::budgeter::{BudgetRequest, TokenBudgeter};
use crate::counter::TokenCounter;
use crate::error::Result;
use crate::mapper::RepoMapper;
use crate::scorer::{ImportanceScorer, ScoreContext};
use crate::types::{ContextItem, ContextItemKind, FileNode, Operation, RepositoryMap};

/// Approximate characters per token for excerpt assembly.
const CHARS_PER_TOKEN: usize = 4;

/// Default token budget when a request does not set one.
pub const DEFAULT_TOKEN_BUDGET: u32 = 8000;

/// Request for a context excerpt
#[derive(Debug, Clone)]
pub struct ContextRequest {
    /// Edit intent
    pub operation: Operation,
    /// Repo-relative target file
    pub target_file: Option<String>,
    /// Target function name (qualified or bare)
    pub target_function: Option<String>,
    /// Target class name
    pub target_class: Option<String>,
    /// Explicitly related files
    pub related_files: Vec<String>,
    /// Token budget for the excerpt
    pub token_budget: u32,
    /// Whether test files may enter related context
    pub include_tests: bool,
    /// Whether docstring previews accompany signatures
    pub include_docstrings: bool,
    /// Recently modified files
    pub recent_changes: Vec<String>,
    /// Token-counting profile
    pub model_name: Option<String>,
}

impl ContextRequest {
    /// Request for `operation` with default budget and flags.
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            target_file: None,
            target_function: None,
            target_class: None,
            related_files: Vec::new(),
            token_budget: DEFAULT_TOKEN_BUDGET,
            include_tests: false,
            include_docstrings: true,
            recent_changes: Vec::new(),
            model_name: None,
        }
    }
}

/// Assembled excerpt plus bookkeeping
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContextResult {
    /// The excerpt text
    pub context: String,
    /// Files whose content or signatures made it in
    pub files_included: Vec<String>,
    /// Function names that made it in
    pub functions_included: Vec<String>,
    /// Class names that made it in
    pub classes_included: Vec<String>,
    /// Estimated token cost of `context`
    pub token_estimate: u32,
    /// Whether assembly stopped because the budget ran out
    pub truncated: bool,
}

struct Assembly {
    lines: Vec<String>,
    files: Vec<String>,
    functions: Vec<String>,
    classes: Vec<String>,
    chars: usize,
    char_budget: usize,
}

impl Assembly {
    fn new(token_budget: u32) -> Self {
        Self {
            lines: Vec::new(),
            files: Vec::new(),
            functions: Vec::new(),
            classes: Vec::new(),
            chars: 0,
            char_budget: token_budget as usize * CHARS_PER_TOKEN,
        }
    }

    fn push(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.chars += text.len() + 1;
        self.lines.push(text);
    }

    fn over_budget(&self) -> bool {
        self.chars >= self.char_budget
    }

    fn finish(self) -> ContextResult {
        let context = self.lines.join("\n");
        let token_estimate = (context.len() / CHARS_PER_TOKEN) as u32;
        let truncated = self.chars >= self.char_budget;
        ContextResult {
            context,
            files_included: self.files,
            functions_included: self.functions,
            classes_included: self.classes,
            token_estimate,
            truncated,
        }
    }
}

/// Provides operation-specific code context
pub struct ContextProvider {
    mapper: Arc<RepoMapper>,
    scorer: ImportanceScorer,
    budgeter: TokenBudgeter,
}

impl ContextProvider {
    /// Create a provider over `mapper` with its own scorer and budgeter.
    pub fn new(mapper: Arc<RepoMapper>) -> Self {
        let counter = Arc::new(TokenCounter::new());
        Self {
            scorer: ImportanceScorer::new(Arc::clone(&mapper)),
            budgeter: TokenBudgeter::new(counter, "gpt-4"),
            mapper,
        }
    }

    /// Scorer used for candidate ranking.
    pub fn scorer(&self) -> &ImportanceScorer {
        &self.scorer
    }

    /// Assemble context for `request`, scanning first if needed.
    pub fn get_context(&self, request: &ContextRequest) -> Result<ContextResult> {
        self.mapper.scan(true)?;

        match (&request.operation, &request.target_file) {
            (Operation::Generate, _) => Ok(self.generation_context(request)),
            (Operation::Fix, Some(_)) => Ok(self.fix_context(request)),
            (Operation::Refactor, Some(_)) => Ok(self.refactor_context(request)),
            (Operation::Explain, Some(_)) => Ok(self.explain_context(request)),
            (Operation::Test, Some(_)) => Ok(self.test_context(request)),
            (Operation::Document, Some(_)) => Ok(self.document_context(request)),
            // Target-less requests fall back to the compressed map
            _ => Ok(self.generic_context(request)),
        }
    }

    /// Budgeted path: compute the section budget, gather scored candidate
    /// items, compress them to fit, and render in section order.
    pub fn get_context_with_budgeting(
        &self,
        request: &ContextRequest,
        conversation_history_length: u32,
    ) -> Result<ContextResult> {
        let map = self.mapper.scan(true)?;

        if let Some(ref model) = request.model_name {
            self.budgeter.set_model(model.clone());
        }

        let budget_request = BudgetRequest {
            operation: request.operation,
            target_file: request.target_file.clone(),
            conversation_history_length,
            recent_changes: request.recent_changes.clone(),
            custom_budget: Some(request.token_budget),
        };
        let budget = self.budgeter.calculate_budget(&budget_request);

        let score_ctx = ScoreContext {
            target_file: request.target_file.clone(),
            operation: Some(request.operation),
        };

        let mut candidates = Vec::new();

        // Repository overview
        let overview = project_overview(&map);
        let overview_tokens = self.budgeter.estimate_tokens(&overview);
        candidates.push(ContextItem::new(
            "repository_overview",
            overview,
            0.5,
            overview_tokens,
            ContextItemKind::Summary,
        ));

        // Target file, full text
        let mut rel_target = None;
        if let Some(ref target) = request.target_file {
            let rel = self.mapper.relative_key(target);
            if let Some(content) = self.read_file(&rel) {
                let tokens = self.budgeter.estimate_tokens(&content);
                let importance = self.scorer.score(&rel, Some(&score_ctx));
                candidates.push(ContextItem::new(
                    rel.clone(),
                    content,
                    importance,
                    tokens,
                    ContextItemKind::File,
                ));
            }
            rel_target = Some(rel);
        }

        // Resolved dependencies as signature blocks
        if let Some(ref rel) = rel_target {
            let deps: Vec<String> = map
                .dependency_graph
                .get(rel)
                .map(|deps| deps.iter().cloned().collect())
                .unwrap_or_default();
            for dep in deps {
                if let Some(node) = map.modules.get(&dep) {
                    let content = file_signatures(node, request.include_docstrings);
                    let tokens = self.budgeter.estimate_tokens(&content);
                    let importance = self.scorer.score(&dep, Some(&score_ctx));
                    candidates.push(ContextItem::new(
                        dep.clone(),
                        content,
                        importance,
                        tokens,
                        ContextItemKind::Import,
                    ));
                }
            }
        }

        // Explicitly related files as signature blocks
        for related in &request.related_files {
            let rel = self.mapper.relative_key(related);
            if Some(&rel) == rel_target.as_ref() {
                continue;
            }
            if let Some(node) = map.modules.get(&rel) {
                let content = file_signatures(node, request.include_docstrings);
                let tokens = self.budgeter.estimate_tokens(&content);
                let importance = self.scorer.score(&rel, Some(&score_ctx));
                candidates.push(ContextItem::new(
                    rel,
                    content,
                    importance,
                    tokens,
                    ContextItemKind::Import,
                ));
            }
        }

        // Target metadata for explain requests
        if request.operation == Operation::Explain {
            if let Some(node) = rel_target.as_ref().and_then(|rel| map.modules.get(rel)) {
                let content = file_metadata(node);
                let tokens = self.budgeter.estimate_tokens(&content);
                candidates.push(ContextItem::new(
                    format!("{}#metadata", node.path),
                    content,
                    0.6,
                    tokens,
                    ContextItemKind::Metadata,
                ));
            }
        }

        let candidate_count = candidates.len();
        let kept = self.budgeter.compress(candidates, &budget);
        let truncated = kept.len() < candidate_count;

        // Render in section order: overview, target, dependencies, rest
        let order = [
            ContextItemKind::Summary,
            ContextItemKind::File,
            ContextItemKind::Function,
            ContextItemKind::Class,
            ContextItemKind::Import,
            ContextItemKind::Metadata,
        ];
        let mut sections = Vec::new();
        let mut files = Vec::new();
        let mut functions = BTreeSet::new();
        let mut classes = BTreeSet::new();
        let mut token_estimate = 0;

        for kind in order {
            for item in kept.iter().filter(|item| item.kind == kind) {
                token_estimate += item.token_count;
                match kind {
                    ContextItemKind::Summary => sections.push(item.content.clone()),
                    ContextItemKind::File => {
                        files.push(item.path.clone());
                        if let Some(node) = map.modules.get(&item.path) {
                            functions.extend(node.functions.iter().map(|f| f.name.clone()));
                            classes.extend(node.classes.iter().map(|c| c.name.clone()));
                        }
                        sections.push(format!("FILE: {}\n{}", item.path, item.content));
                    }
                    ContextItemKind::Import => {
                        if !files.contains(&item.path) && map.modules.contains_key(&item.path) {
                            files.push(item.path.clone());
                        }
                        sections.push(format!("RELATED: {}\n{}", item.path, item.content));
                    }
                    _ => sections.push(item.content.clone()),
                }
            }
        }

        Ok(ContextResult {
            context: sections.join("\n\n"),
            files_included: files,
            functions_included: functions.into_iter().collect(),
            classes_included: classes.into_iter().collect(),
            token_estimate,
            truncated,
        })
    }

    fn generation_context(&self, request: &ContextRequest) -> ContextResult {
        let Some(map) = self.mapper.snapshot() else {
            return Assembly::new(request.token_budget).finish();
        };
        let mut out = Assembly::new(request.token_budget);

        out.push(project_overview(&map));

        if let Some(ref target) = request.target_file {
            let rel = self.mapper.relative_key(target);
            if let Some(node) = map.modules.get(&rel) {
                let context = file_context(node, request.include_docstrings);
                if out.chars + context.len() < out.char_budget {
                    out.push(String::new());
                    out.push(context);
                    out.files.push(rel.clone());
                }
            }
        }

        let related = self.related_files(&map, request, out.char_budget.saturating_sub(out.chars));
        if !related.lines.is_empty() {
            out.push(String::new());
            out.push("RELATED CODE:".to_owned());
            for line in related.lines {
                out.push(line);
            }
            out.files.extend(related.files);
            out.functions.extend(related.functions);
        }

        if let Some(patterns) = request
            .target_file
            .as_ref()
            .and_then(|target| code_patterns(&map, &self.mapper.relative_key(target)))
        {
            if out.chars + patterns.len() < out.char_budget {
                out.push(String::new());
                out.push("CODE PATTERNS:".to_owned());
                out.push(patterns);
            }
        }

        out.finish()
    }

    fn fix_context(&self, request: &ContextRequest) -> ContextResult {
        let mut out = Assembly::new(request.token_budget);
        let Some(map) = self.mapper.snapshot() else {
            return out.finish();
        };
        let Some(target) = request.target_file.as_deref() else {
            return out.finish();
        };
        let rel = self.mapper.relative_key(target);

        if let Some(content) = self.read_file(&rel) {
            out.push(format!("FILE TO FIX: {rel}"));
            out.push(format!("```{}", fence_language(&map, &rel)));
            out.push(content);
            out.push("```".to_owned());
            out.files.push(rel.clone());
        }

        if !out.over_budget() {
            if let Some(deps) = dependency_lines(&map, &rel) {
                out.push(String::new());
                out.push("DEPENDENCIES:".to_owned());
                out.push(deps);
            }
        }

        out.finish()
    }

    fn refactor_context(&self, request: &ContextRequest) -> ContextResult {
        let mut out = Assembly::new(request.token_budget);
        let Some(map) = self.mapper.snapshot() else {
            return out.finish();
        };
        let Some(target) = request.target_file.as_deref() else {
            return out.finish();
        };
        let rel = self.mapper.relative_key(target);

        if let Some(content) = self.read_file(&rel) {
            out.push(format!("FILE TO REFACTOR: {rel}"));
            out.push(format!("```{}", fence_language(&map, &rel)));
            out.push(content);
            out.push("```".to_owned());
            out.files.push(rel.clone());
        }

        if !out.over_budget() {
            let dependents = map.dependents_of(&rel);
            if !dependents.is_empty() {
                out.push(String::new());
                out.push("FILES THAT USE THIS CODE:".to_owned());
                for dependent in dependents.iter().take(10) {
                    let lines = map
                        .modules
                        .get(dependent)
                        .map(|node| node.lines_of_code)
                        .unwrap_or(0);
                    out.push(format!("  - {dependent} ({lines} lines)"));
                }
            }
        }

        out.finish()
    }

    fn explain_context(&self, request: &ContextRequest) -> ContextResult {
        let mut out = Assembly::new(request.token_budget);
        let Some(map) = self.mapper.snapshot() else {
            return out.finish();
        };
        let Some(target) = request.target_file.as_deref() else {
            return out.finish();
        };
        let rel = self.mapper.relative_key(target);

        if let Some(content) = self.read_file(&rel) {
            out.push(format!("CODE TO EXPLAIN: {rel}"));
            out.push(format!("```{}", fence_language(&map, &rel)));
            out.push(content);
            out.push("```".to_owned());
            out.files.push(rel.clone());
        }

        if let Some(node) = map.modules.get(&rel) {
            let meta = file_metadata(node);
            if out.chars + meta.len() < out.char_budget {
                out.push(String::new());
                out.push("FILE METADATA:".to_owned());
                out.push(meta);
            }
        }

        out.finish()
    }

    fn test_context(&self, request: &ContextRequest) -> ContextResult {
        let mut out = Assembly::new(request.token_budget);
        let Some(map) = self.mapper.snapshot() else {
            return out.finish();
        };
        let Some(target) = request.target_file.as_deref() else {
            return out.finish();
        };
        let rel = self.mapper.relative_key(target);

        if let Some(content) = self.read_file(&rel) {
            out.push(format!("CODE TO TEST: {rel}"));
            out.push(format!("```{}", fence_language(&map, &rel)));
            out.push(content);
            out.push("```".to_owned());
            out.files.push(rel.clone());
        }

        if !out.over_budget() {
            if let Some(patterns) = test_patterns(&map, out.char_budget.saturating_sub(out.chars))
            {
                out.push(String::new());
                out.push("EXISTING TEST PATTERNS:".to_owned());
                out.push(patterns);
            }
        }

        out.finish()
    }

    fn document_context(&self, request: &ContextRequest) -> ContextResult {
        let mut out = Assembly::new(request.token_budget);
        let Some(map) = self.mapper.snapshot() else {
            return out.finish();
        };
        let Some(target) = request.target_file.as_deref() else {
            return out.finish();
        };
        let rel = self.mapper.relative_key(target);

        if let Some(content) = self.read_file(&rel) {
            out.push(format!("CODE TO DOCUMENT: {rel}"));
            out.push(format!("```{}", fence_language(&map, &rel)));
            out.push(content);
            out.push("```".to_owned());
            out.files.push(rel.clone());
        }

        let guidelines = documentation_patterns();
        if out.chars + guidelines.len() < out.char_budget {
            out.push(String::new());
            out.push("DOCUMENTATION PATTERNS:".to_owned());
            out.push(guidelines);
        }

        out.finish()
    }

    fn generic_context(&self, request: &ContextRequest) -> ContextResult {
        let mut out = Assembly::new(request.token_budget);
        out.push(self.mapper.compress(request.token_budget));
        out.finish()
    }

    fn related_files(
        &self,
        map: &RepositoryMap,
        request: &ContextRequest,
        char_budget: usize,
    ) -> Assembly {
        let mut out = Assembly::new(0);
        out.char_budget = char_budget;

        let mut add_file = |out: &mut Assembly, rel: &str| {
            if out.files.iter().any(|f| f == rel) || out.chars >= out.char_budget {
                return;
            }
            if !request.include_tests && map.test_files.iter().any(|t| t == rel) {
                return;
            }
            if let Some(node) = map.modules.get(rel) {
                let summary = file_summary(node);
                if out.chars + summary.len() < out.char_budget {
                    out.push(summary);
                    out.files.push(rel.to_owned());
                    out.functions.extend(node.functions.iter().map(|f| f.name.clone()));
                }
            }
        };

        for related in &request.related_files {
            let rel = self.mapper.relative_key(related);
            add_file(&mut out, &rel);
        }

        if let Some(ref target) = request.target_file {
            let rel = self.mapper.relative_key(target);
            if let Some(deps) = map.dependency_graph.get(&rel) {
                for dep in deps {
                    add_file(&mut out, dep);
                }
            }
        }

        out
    }

    fn read_file(&self, rel_path: &str) -> Option<String> {
        let path = Path::new(rel_path);
        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.mapper.root().join(path)
        };
        fs::read_to_string(abs).ok()
    }
}

fn project_overview(map: &RepositoryMap) -> String {
    let name = Path::new(&map.root_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| map.root_path.clone());

    let mut lines = vec![
        format!("PROJECT: {name}"),
        format!("FILES: {} | LINES: {}", map.total_files, map.total_lines),
    ];

    if !map.languages.is_empty() {
        let mut langs: Vec<_> = map.languages.iter().collect();
        langs.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let top = langs
            .iter()
            .take(3)
            .map(|(lang, count)| format!("{lang}: {count}"))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("LANGUAGES: {top}"));
    }

    lines.join("\n")
}

/// Signature overview of one file for the plain generation path.
fn file_context(node: &FileNode, include_docstrings: bool) -> String {
    let mut lines = vec![format!("FILE: {} ({} lines)", node.path, node.lines_of_code)];

    if !node.functions.is_empty() {
        lines.push("FUNCTIONS:".to_owned());
        for func in &node.functions {
            lines.push(format!("  - {func}"));
            if include_docstrings {
                if let Some(ref doc) = func.docstring {
                    let preview: String = doc.chars().take(80).collect();
                    lines.push(format!("      {}...", preview.replace('\n', " ")));
                }
            }
        }
    }

    if !node.classes.is_empty() {
        lines.push("CLASSES:".to_owned());
        for cls in &node.classes {
            lines.push(format!("  - {cls}"));
            for method in cls.methods.iter().take(5) {
                lines.push(format!("      - {method}"));
            }
        }
    }

    lines.join("\n")
}

/// Signature block used for dependency and related-file items.
fn file_signatures(node: &FileNode, include_docstrings: bool) -> String {
    let mut lines = vec![file_summary(node)];
    for func in &node.functions {
        lines.push(format!("  - {func}"));
        if include_docstrings {
            if let Some(ref doc) = func.docstring {
                let preview: String = doc.chars().take(80).collect();
                lines.push(format!("      {}", preview.replace('\n', " ")));
            }
        }
    }
    for cls in &node.classes {
        lines.push(format!("  - {cls}"));
    }
    lines.join("\n")
}

/// One-line brief: `name (N lines) F funcs C classes`.
fn file_summary(node: &FileNode) -> String {
    let name = Path::new(&node.path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| node.path.clone());

    let mut parts = vec![name, format!("({} lines)", node.lines_of_code)];
    if !node.functions.is_empty() {
        parts.push(format!("{} funcs", node.functions.len()));
    }
    if !node.classes.is_empty() {
        parts.push(format!("{} classes", node.classes.len()));
    }
    parts.join(" ")
}

fn file_metadata(node: &FileNode) -> String {
    [
        format!("Language: {}", node.language),
        format!("Lines: {}", node.lines_of_code),
        format!("Functions: {}", node.functions.len()),
        format!("Classes: {}", node.classes.len()),
        format!("Type Coverage: {}%", node.type_hints_coverage),
    ]
    .join("\n")
}

/// Resolved in-repo dependencies, falling back to external package roots.
fn dependency_lines(map: &RepositoryMap, rel_path: &str) -> Option<String> {
    let resolved = map.dependency_graph.get(rel_path);
    let lines: Vec<String> = match resolved {
        Some(deps) if !deps.is_empty() => deps.iter().map(|dep| format!("  - {dep}")).collect(),
        _ => map
            .modules
            .get(rel_path)?
            .dependencies
            .iter()
            .map(|dep| format!("  - {dep}"))
            .collect(),
    };
    if lines.is_empty() {
        return None;
    }
    Some(lines.join("\n"))
}

/// Common imports and one class signature from files sharing the
/// target's directory.
fn code_patterns(map: &RepositoryMap, rel_target: &str) -> Option<String> {
    let target_dir = Path::new(rel_target).parent()?.to_string_lossy().to_string();

    let siblings: Vec<&FileNode> = map
        .modules
        .iter()
        .filter(|(path, _)| {
            *path != rel_target
                && Path::new(path)
                    .parent()
                    .map(|p| p.to_string_lossy() == target_dir)
                    .unwrap_or(false)
        })
        .map(|(_, node)| node)
        .collect();

    if siblings.is_empty() {
        return None;
    }

    let mut common_imports = BTreeSet::new();
    let mut common_patterns = Vec::new();
    for node in siblings.iter().take(3) {
        common_imports.extend(node.imports.iter().take(5).cloned());
        if let Some(cls) = node.classes.first() {
            common_patterns.push(cls.to_string());
        }
    }

    let mut lines = Vec::new();
    if !common_imports.is_empty() {
        lines.push("Common imports:".to_owned());
        for import in common_imports.iter().take(5) {
            lines.push(format!("  - {import}"));
        }
    }
    if !common_patterns.is_empty() {
        lines.push("Common patterns:".to_owned());
        for pattern in common_patterns.iter().take(3) {
            lines.push(format!("  - {pattern}"));
        }
    }

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Sampled signatures from up to three test files.
fn test_patterns(map: &RepositoryMap, char_budget: usize) -> Option<String> {
    let mut lines = Vec::new();
    let mut chars = 0;

    for test_file in map.test_files.iter().take(3) {
        let Some(node) = map.modules.get(test_file) else {
            continue;
        };
        if node.functions.is_empty() {
            continue;
        }
        lines.push(format!("From {test_file}:"));
        for func in node.functions.iter().take(3) {
            let line = format!("  - {func}");
            if chars + line.len() >= char_budget {
                break;
            }
            chars += line.len() + 1;
            lines.push(line);
        }
    }

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn documentation_patterns() -> String {
    [
        "Documentation style:",
        "  - Use Google-style docstrings",
        "  - Include Args, Returns, Raises sections",
        "  - Type hints in function signatures",
        "  - Module docstring at file start",
    ]
    .join("\n")
}

fn fence_language(map: &RepositoryMap, rel_path: &str) -> String {
    map.modules
        .get(rel_path)
        .map(|node| node.language.clone())
        .unwrap_or_default()
}
