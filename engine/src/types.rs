//! Core type definitions for the repository intelligence engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Function metadata extracted from the AST
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSignature {
    /// Function name
    pub name: String,
    /// Dotted module path of the containing file
    pub module_path: String,
    /// Repository-relative path of the containing file
    pub file_path: String,
    /// First line of the definition (1-indexed)
    pub line_start: u32,
    /// Last line of the definition (1-indexed)
    pub line_end: u32,
    /// Parameters rendered as `name` or `name: type`
    #[serde(default)]
    pub parameters: Vec<String>,
    /// Return type annotation, if present
    #[serde(default)]
    pub return_type: Option<String>,
    /// Docstring (first string literal in the body)
    #[serde(default)]
    pub docstring: Option<String>,
    /// Cyclomatic complexity (base 1)
    #[serde(default = "default_complexity")]
    pub complexity: u32,
    /// Whether the function is declared async
    #[serde(default)]
    pub is_async: bool,
    /// Whether the function is a class method
    #[serde(default)]
    pub is_method: bool,
    /// Decorator names applied to the function
    #[serde(default)]
    pub decorators: Vec<String>,
}

fn default_complexity() -> u32 {
    1
}

impl fmt::Display for FunctionSignature {
    /// Renders `async name(params) -> ret`, omitting absent parts.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_async {
            write!(f, "async ")?;
        }
        write!(f, "{}({})", self.name, self.parameters.join(", "))?;
        if let Some(ref ret) = self.return_type {
            write!(f, " -> {ret}")?;
        }
        Ok(())
    }
}

/// Class metadata extracted from the AST
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassSignature {
    /// Class name
    pub name: String,
    /// Dotted module path of the containing file
    pub module_path: String,
    /// Repository-relative path of the containing file
    pub file_path: String,
    /// First line of the definition (1-indexed)
    pub line_start: u32,
    /// Last line of the definition (1-indexed)
    pub line_end: u32,
    /// Base class names
    #[serde(default)]
    pub bases: Vec<String>,
    /// Methods in declaration order
    #[serde(default)]
    pub methods: Vec<FunctionSignature>,
    /// Attribute declarations rendered as `name` or `name: type`
    #[serde(default)]
    pub attributes: Vec<String>,
    /// Class docstring
    #[serde(default)]
    pub docstring: Option<String>,
    /// Decorator names applied to the class
    #[serde(default)]
    pub decorators: Vec<String>,
    /// True iff a `dataclass` decorator is present
    #[serde(default)]
    pub is_dataclass: bool,
}

impl fmt::Display for ClassSignature {
    /// Renders `class Name(Base, ...)` or `class Name` without bases.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class {}", self.name)?;
        if !self.bases.is_empty() {
            write!(f, "({})", self.bases.join(", "))?;
        }
        Ok(())
    }
}

/// File-level metadata produced by the analyzer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileNode {
    /// Repository-relative, forward-slash-normalized path
    pub path: String,
    /// Language tag from the extension table
    pub language: String,
    /// Total line count
    #[serde(default)]
    pub lines_of_code: u32,
    /// Top-level functions (methods live on their class)
    #[serde(default)]
    pub functions: Vec<FunctionSignature>,
    /// Top-level classes
    #[serde(default)]
    pub classes: Vec<ClassSignature>,
    /// Flattened dotted import strings
    #[serde(default)]
    pub imports: Vec<String>,
    /// Unresolved dependency roots (external package names)
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Percentage of functions/methods carrying type hints (0-100)
    #[serde(default)]
    pub type_hints_coverage: f32,
    /// True iff the module starts with a docstring
    #[serde(default)]
    pub has_docstring: bool,
    /// ISO-8601 mtime recorded at analysis time
    #[serde(default)]
    pub last_modified: Option<String>,
}

impl FileNode {
    /// Create a minimal node for a file that gets no AST treatment.
    pub fn basic(path: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            language: language.into(),
            lines_of_code: 0,
            functions: Vec::new(),
            classes: Vec::new(),
            imports: Vec::new(),
            dependencies: BTreeSet::new(),
            type_hints_coverage: 0.0,
            has_docstring: false,
            last_modified: None,
        }
    }
}

/// Complete structural map of a repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryMap {
    /// Absolute path to the repository root
    pub root_path: String,
    /// Number of analyzed files (== modules.len())
    #[serde(default)]
    pub total_files: u32,
    /// Sum of per-file line counts
    #[serde(default)]
    pub total_lines: u64,
    /// Language tag -> file count
    #[serde(default)]
    pub languages: BTreeMap<String, u32>,
    /// Repository-relative path -> FileNode
    #[serde(default)]
    pub modules: BTreeMap<String, FileNode>,
    /// Resolved in-repo import edges, path -> set of imported paths
    #[serde(default)]
    pub dependency_graph: BTreeMap<String, BTreeSet<String>>,
    /// Files believed to be program starts
    #[serde(default)]
    pub entry_points: Vec<String>,
    /// Files identified as tests
    #[serde(default)]
    pub test_files: Vec<String>,
    /// ISO-8601 generation timestamp
    pub generated_at: String,
}

impl RepositoryMap {
    /// Create an empty map rooted at `root_path`.
    pub fn new(root_path: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
            total_files: 0,
            total_lines: 0,
            languages: BTreeMap::new(),
            modules: BTreeMap::new(),
            dependency_graph: BTreeMap::new(),
            entry_points: Vec::new(),
            test_files: Vec::new(),
            generated_at: Utc::now().to_rfc3339(),
        }
    }

    /// Files that import `path`, in map order.
    pub fn dependents_of(&self, path: &str) -> Vec<String> {
        self.dependency_graph
            .iter()
            .filter(|(_, deps)| deps.contains(path))
            .map(|(file, _)| file.clone())
            .collect()
    }

    /// Recompute `total_files`, `total_lines`, and the language histogram
    /// from `modules`. Called after any module insertion or removal.
    pub fn refresh_totals(&mut self) {
        self.total_files = self.modules.len() as u32;
        self.total_lines = self.modules.values().map(|n| u64::from(n.lines_of_code)).sum();
        self.languages.clear();
        for node in self.modules.values() {
            *self.languages.entry(node.language.clone()).or_insert(0) += 1;
        }
    }
}

/// Kind of a symbol definition or reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Function,
    Class,
    Method,
    Variable,
    Module,
    Unknown,
}

impl SymbolKind {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Method => "method",
            Self::Variable => "variable",
            Self::Module => "module",
            Self::Unknown => "unknown",
        }
    }
}

/// How a symbol occurrence relates to its definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    Definition,
    Usage,
    Import,
}

/// A symbol occurrence in a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolReference {
    /// Symbol name (possibly qualified)
    pub name: String,
    /// File containing the reference
    pub file_path: String,
    /// Line number (1-indexed)
    pub line: u32,
    /// Column number (1-indexed)
    pub column: u32,
    /// Reference kind
    pub kind: ReferenceKind,
    /// Surrounding context string
    pub context: String,
    /// Kind of the referenced symbol
    pub symbol_kind: SymbolKind,
}

/// Location and shape of a symbol definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    /// Defined symbol (methods are `Class.method`)
    pub symbol: String,
    /// File containing the definition
    pub file_path: String,
    /// Line number (1-indexed)
    pub line: u32,
    /// Column number
    pub column: u32,
    /// Symbol kind
    pub kind: SymbolKind,
    /// Rendered signature, if available
    #[serde(default)]
    pub signature: Option<String>,
    /// Docstring, if available
    #[serde(default)]
    pub docstring: Option<String>,
}

/// Filesystem event kinds the monitor reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

impl FileEventKind {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::Moved => "moved",
        }
    }
}

/// A debounced filesystem event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEvent {
    /// Affected path (destination path for moves)
    pub path: String,
    /// Event kind
    pub kind: FileEventKind,
    /// When the raw event was observed
    pub timestamp: DateTime<Utc>,
    /// Source path, set only for moves
    #[serde(default)]
    pub old_path: Option<String>,
}

impl FileEvent {
    /// Create an event stamped with the current time.
    pub fn now(path: impl Into<String>, kind: FileEventKind) -> Self {
        Self { path: path.into(), kind, timestamp: Utc::now(), old_path: None }
    }
}

/// Cached importance score with its factor breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileImportance {
    /// Scored file
    pub file_path: String,
    /// Final blended score in [0, 1]
    pub score: f32,
    /// Factor name -> subscore
    #[serde(default)]
    pub factors: BTreeMap<String, f32>,
    /// When the score was computed
    pub last_calculated: DateTime<Utc>,
}

/// Edit intents a context request can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Generate,
    Fix,
    Refactor,
    Explain,
    Test,
    Document,
}

impl Operation {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Fix => "fix",
            Self::Refactor => "refactor",
            Self::Explain => "explain",
            Self::Test => "test",
            Self::Document => "document",
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "generate" => Ok(Self::Generate),
            "fix" => Ok(Self::Fix),
            "refactor" => Ok(Self::Refactor),
            "explain" => Ok(Self::Explain),
            "test" => Ok(Self::Test),
            "document" => Ok(Self::Document),
            other => Err(crate::error::EngineError::UnknownOperation(other.to_owned())),
        }
    }
}

/// Named budget sections a context request can allocate into
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetSection {
    RepositoryOverview,
    TargetFile,
    Dependencies,
    Dependents,
    RelatedPatterns,
    ErrorContext,
    Patterns,
    Metadata,
    ExistingTests,
    Documentation,
}

impl BudgetSection {
    /// Get the section name as used in rendered output
    pub fn name(&self) -> &'static str {
        match self {
            Self::RepositoryOverview => "repository_overview",
            Self::TargetFile => "target_file",
            Self::Dependencies => "dependencies",
            Self::Dependents => "dependents",
            Self::RelatedPatterns => "related_patterns",
            Self::ErrorContext => "error_context",
            Self::Patterns => "patterns",
            Self::Metadata => "metadata",
            Self::ExistingTests => "existing_tests",
            Self::Documentation => "documentation",
        }
    }
}

/// Token allocation across context sections.
///
/// Invariant: `reserved_response + allocations.values().sum() + available`
/// equals `total` at all times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBudget {
    /// Total tokens granted to the request
    pub total: u32,
    /// Tokens not yet allocated to any section
    pub available: u32,
    /// Headroom held back for the model's reply
    pub reserved_response: u32,
    /// Section -> granted tokens
    #[serde(default)]
    pub allocations: BTreeMap<BudgetSection, u32>,
}

impl TokenBudget {
    /// Create a budget with `reserved` held back for the response.
    pub fn new(total: u32, reserved: u32) -> Self {
        let reserved = reserved.min(total);
        Self {
            total,
            available: total - reserved,
            reserved_response: reserved,
            allocations: BTreeMap::new(),
        }
    }

    /// Allocate `tokens` to `section` if they fit in `available`.
    /// Returns false (and changes nothing) otherwise.
    pub fn allocate(&mut self, section: BudgetSection, tokens: u32) -> bool {
        if tokens <= self.available {
            *self.allocations.entry(section).or_insert(0) += tokens;
            self.available -= tokens;
            true
        } else {
            false
        }
    }

    /// Tokens granted to `section` (0 if never allocated).
    pub fn allocation(&self, section: BudgetSection) -> u32 {
        self.allocations.get(&section).copied().unwrap_or(0)
    }

    /// Sum of all section allocations.
    pub fn allocated_total(&self) -> u32 {
        self.allocations.values().sum()
    }
}

/// Discriminator for candidate context items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextItemKind {
    File,
    Function,
    Class,
    Import,
    Summary,
    Metadata,
}

/// One candidate inclusion in an assembled context excerpt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    /// Originating path (or a pseudo-path hint)
    pub path: String,
    /// Content to include verbatim
    pub content: String,
    /// Relevance in [0, 1]
    pub importance: f32,
    /// Estimated token cost of `content`
    pub token_count: u32,
    /// Item kind
    pub kind: ContextItemKind,
    /// Free-form annotations (e.g. summarization provenance)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ContextItem {
    /// Create an item with empty metadata.
    pub fn new(
        path: impl Into<String>,
        content: impl Into<String>,
        importance: f32,
        token_count: u32,
        kind: ContextItemKind,
    ) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            importance,
            token_count,
            kind,
            metadata: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_function() -> FunctionSignature {
        FunctionSignature {
            name: "fetch".to_owned(),
            module_path: "pkg.client".to_owned(),
            file_path: "pkg/client.py".to_owned(),
            line_start: 10,
            line_end: 20,
            parameters: vec!["url: str".to_owned(), "retries: int".to_owned()],
            return_type: Some("Response".to_owned()),
            docstring: None,
            complexity: 3,
            is_async: true,
            is_method: false,
            decorators: vec![],
        }
    }

    #[test]
    fn test_function_display() {
        let func = sample_function();
        assert_eq!(func.to_string(), "async fetch(url: str, retries: int) -> Response");
    }

    #[test]
    fn test_class_display() {
        let cls = ClassSignature {
            name: "Client".to_owned(),
            module_path: "pkg.client".to_owned(),
            file_path: "pkg/client.py".to_owned(),
            line_start: 1,
            line_end: 40,
            bases: vec!["Base".to_owned(), "Mixin".to_owned()],
            methods: vec![],
            attributes: vec![],
            docstring: None,
            decorators: vec![],
            is_dataclass: false,
        };
        assert_eq!(cls.to_string(), "class Client(Base, Mixin)");
    }

    #[test]
    fn test_budget_allocation() {
        let mut budget = TokenBudget::new(1000, 100);
        assert_eq!(budget.available, 900);
        assert!(budget.allocate(BudgetSection::TargetFile, 500));
        assert!(!budget.allocate(BudgetSection::Dependencies, 500));
        assert!(budget.allocate(BudgetSection::Dependencies, 400));
        assert_eq!(budget.available, 0);
        assert_eq!(
            budget.reserved_response + budget.allocated_total() + budget.available,
            budget.total
        );
    }

    #[test]
    fn test_repository_map_roundtrip() {
        let mut map = RepositoryMap::new("/tmp/repo");
        let mut node = FileNode::basic("src/main.py", "python");
        node.lines_of_code = 12;
        node.imports.push("utils".to_owned());
        map.modules.insert("src/main.py".to_owned(), node);
        map.dependency_graph
            .insert("src/main.py".to_owned(), BTreeSet::from(["src/utils.py".to_owned()]));
        map.refresh_totals();

        let json = serde_json::to_string(&map).unwrap();
        let restored: RepositoryMap = serde_json::from_str(&json).unwrap();
        assert_eq!(map, restored);
        assert_eq!(restored.total_files, 1);
        assert_eq!(restored.total_lines, 12);
    }

    #[test]
    fn test_file_event_roundtrip() {
        let event = FileEvent {
            path: "a/b.py".to_owned(),
            kind: FileEventKind::Moved,
            timestamp: Utc::now(),
            old_path: Some("a/old.py".to_owned()),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"moved\""));
        let restored: FileEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, restored);
    }

    #[test]
    fn test_dependents_of() {
        let mut map = RepositoryMap::new("/tmp/repo");
        map.dependency_graph.insert("a.py".to_owned(), BTreeSet::from(["c.py".to_owned()]));
        map.dependency_graph.insert("b.py".to_owned(), BTreeSet::from(["c.py".to_owned()]));
        assert_eq!(map.dependents_of("c.py"), vec!["a.py", "b.py"]);
        assert!(map.dependents_of("a.py").is_empty());
    }
}
