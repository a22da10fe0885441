//! Repolens Engine - Repository intelligence for LLM context synthesis
//!
//! This crate continuously maintains a structured map of a source tree
//! and, on demand, synthesizes a token-budgeted contextual excerpt
//! tailored to a specific edit intent, including:
//!
//! - AST-driven analysis of the primary language (functions, classes,
//!   imports, complexity, type-hint coverage)
//! - Repository mapping with parallel scans, an mtime-keyed disk cache,
//!   and an import-resolved dependency graph
//! - Debounced filesystem monitoring with incremental map updates
//! - Multi-factor file importance scoring
//! - Cross-file symbol and reference resolution
//! - Token counting and per-section budget allocation
//!
//! # Example
//!
//! ```rust,ignore
//! use repolens_engine::{ContextProvider, ContextRequest, Operation, RepoMapper};
//! use std::sync::Arc;
//!
//! let mapper = Arc::new(RepoMapper::new("/path/to/repo")?);
//! mapper.scan(true)?;
//!
//! let provider = ContextProvider::new(Arc::clone(&mapper));
//! let mut request = ContextRequest::new(Operation::Fix);
//! request.target_file = Some("src/main.py".to_owned());
//! let result = provider.get_context(&request)?;
//! ```

pub mod analyzer;
pub mod budgeter;
pub mod context;
pub mod counter;
pub mod error;
pub mod mapper;
pub mod monitor;
pub mod resolver;
pub mod scorer;
pub mod types;

pub use analyzer::AstAnalyzer;
pub use budgeter::{BudgetRequest, ModelInfo, TokenBudgeter};
pub use context::{ContextProvider, ContextRequest, ContextResult, DEFAULT_TOKEN_BUDGET};
pub use counter::{ChatMessage, TokenCounter};
pub use error::{EngineError, Result};
pub use mapper::{MapperStats, RepoMapper};
pub use monitor::{FileMonitor, MonitorStatus};
pub use resolver::{ReferenceResolver, ResolverStats};
pub use scorer::{ImportanceScorer, ScoreContext, ScoringWeights};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.chars().any(|c| c.is_ascii_digit()));
    }
}
