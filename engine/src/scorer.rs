//! File importance scoring
//!
//! Blends six weighted per-file signals (recency, inbound dependencies,
//! entry-point heuristics, test coverage, change frequency, and graph
//! centrality) into a [0, 1] score, with additive context boosts for the
//! file being edited.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{EngineError, Result};
use crate::mapper::RepoMapper;
use crate::types::{FileImportance, Operation, RepositoryMap};

/// How long a computed score stays valid.
const CACHE_TTL_MINUTES: i64 = 5;

/// Full recency score inside this window.
const RECENT_DAYS: i64 = 7;

/// Recency decays to zero at this age.
const STALE_DAYS: i64 = 30;

/// Weights for the six scoring factors. Must sum to 1.0 (±0.01).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    pub recency: f32,
    pub dependencies: f32,
    pub entry_points: f32,
    pub test_coverage: f32,
    pub change_frequency: f32,
    pub graph_centrality: f32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            recency: 0.20,
            dependencies: 0.25,
            entry_points: 0.20,
            test_coverage: 0.10,
            change_frequency: 0.15,
            graph_centrality: 0.10,
        }
    }
}

impl ScoringWeights {
    /// Sum of all weights.
    pub fn sum(&self) -> f32 {
        self.recency
            + self.dependencies
            + self.entry_points
            + self.test_coverage
            + self.change_frequency
            + self.graph_centrality
    }
}

/// Request context that shifts scores toward the edit at hand
#[derive(Debug, Clone, Default)]
pub struct ScoreContext {
    /// File being edited
    pub target_file: Option<String>,
    /// Operation kind
    pub operation: Option<Operation>,
}

/// Scores files by relevance to an edit
pub struct ImportanceScorer {
    mapper: Arc<RepoMapper>,
    weights: RwLock<ScoringWeights>,
    cache: Mutex<HashMap<String, FileImportance>>,
}

impl ImportanceScorer {
    /// Create a scorer reading from `mapper` with default weights.
    pub fn new(mapper: Arc<RepoMapper>) -> Self {
        Self {
            mapper,
            weights: RwLock::new(ScoringWeights::default()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Importance of `file_path` in [0, 1]. Unknown files score 0.
    ///
    /// The weighted base score is cached per path for five minutes;
    /// context boosts are applied on top of the cached value so the same
    /// file can score differently under different requests.
    pub fn score(&self, file_path: &str, context: Option<&ScoreContext>) -> f32 {
        let base = self
            .cached_base(file_path)
            .or_else(|| self.compute_base(file_path));

        let Some(base) = base else {
            return 0.0;
        };

        let boosted = match context {
            Some(ctx) => self.apply_context_boost(base, file_path, ctx),
            None => base,
        };
        boosted.min(1.0)
    }

    fn cached_base(&self, file_path: &str) -> Option<f32> {
        let cache = self.cache.lock().ok()?;
        let cached = cache.get(file_path)?;
        let age = Utc::now() - cached.last_calculated;
        (age < Duration::minutes(CACHE_TTL_MINUTES)).then_some(cached.score)
    }

    fn compute_base(&self, file_path: &str) -> Option<f32> {
        let weights = self.weights.read().ok().map(|w| *w)?;

        let (score, factors) = self.mapper.with_map(|map| {
            if !map.modules.contains_key(file_path) {
                return None;
            }

            let mut factors = BTreeMap::new();
            factors.insert("recency".to_owned(), recency_score(map, file_path));
            factors.insert("dependencies".to_owned(), dependency_score(map, file_path));
            factors.insert("entry_points".to_owned(), entry_point_score(map, file_path));
            factors.insert("test_coverage".to_owned(), test_coverage_score(map, file_path));
            factors.insert("change_frequency".to_owned(), change_frequency_score(file_path));
            factors.insert("graph_centrality".to_owned(), centrality_score(map, file_path));

            let score = weights.recency * factors["recency"]
                + weights.dependencies * factors["dependencies"]
                + weights.entry_points * factors["entry_points"]
                + weights.test_coverage * factors["test_coverage"]
                + weights.change_frequency * factors["change_frequency"]
                + weights.graph_centrality * factors["graph_centrality"];

            Some((score.min(1.0), factors))
        })??;

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                file_path.to_owned(),
                FileImportance {
                    file_path: file_path.to_owned(),
                    score,
                    factors,
                    last_calculated: Utc::now(),
                },
            );
        }
        Some(score)
    }

    fn apply_context_boost(&self, base: f32, file_path: &str, ctx: &ScoreContext) -> f32 {
        let mut score = base;

        if let Some(ref target) = ctx.target_file {
            if file_path == target {
                score = (score + 0.3).min(1.0);
            } else {
                let target_dir = Path::new(target).parent();
                let file_dir = Path::new(file_path).parent();
                if target_dir == file_dir {
                    score = (score + 0.1).min(1.0);
                }
            }
        }

        match ctx.operation {
            Some(Operation::Fix) if ctx.target_file.as_deref() == Some(file_path) => {
                score = (score + 0.2).min(1.0);
            }
            Some(Operation::Test) if file_path.contains("test") => {
                score = (score + 0.2).min(1.0);
            }
            Some(Operation::Refactor) => {
                let dep_score = self
                    .mapper
                    .with_map(|map| dependency_score(map, file_path))
                    .unwrap_or(0.0);
                if dep_score > 0.5 {
                    score = (score + 0.15).min(1.0);
                }
            }
            _ => {}
        }

        score
    }

    /// Rank `paths` by score, descending.
    pub fn rank(&self, paths: &[String], context: Option<&ScoreContext>) -> Vec<(String, f32)> {
        let mut scored: Vec<(String, f32)> = paths
            .iter()
            .map(|path| (path.clone(), self.score(path, context)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }

    /// The `limit` most important files in the repository.
    pub fn top_files(&self, limit: usize, context: Option<&ScoreContext>) -> Vec<(String, f32)> {
        let Some(paths) = self
            .mapper
            .with_map(|map| map.modules.keys().cloned().collect::<Vec<_>>())
        else {
            return Vec::new();
        };
        let mut ranked = self.rank(&paths, context);
        ranked.truncate(limit);
        ranked
    }

    /// Per-factor breakdown from the cache, if the file has been scored.
    pub fn importance_factors(&self, file_path: &str) -> Option<BTreeMap<String, f32>> {
        let cache = self.cache.lock().ok()?;
        cache.get(file_path).map(|imp| imp.factors.clone())
    }

    /// Replace the weights. Fails (leaving weights untouched) unless the
    /// new weights sum to 1.0 within ±0.01; success flushes the cache.
    pub fn update_weights(&self, new_weights: ScoringWeights) -> Result<()> {
        let total = new_weights.sum();
        if (total - 1.0).abs() > 0.01 {
            return Err(EngineError::Validation(format!(
                "scoring weights must sum to 1.0, got {total:.3}"
            )));
        }
        if let Ok(mut weights) = self.weights.write() {
            *weights = new_weights;
        }
        self.clear_cache();
        Ok(())
    }

    /// Current weights.
    pub fn weights(&self) -> ScoringWeights {
        self.weights.read().map(|w| *w).unwrap_or_default()
    }

    /// Drop all cached scores.
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }
}

/// 1.0 within the recent window, linear decay to 0 at the stale horizon.
fn recency_score(map: &RepositoryMap, file_path: &str) -> f32 {
    let Some(modified) = map
        .modules
        .get(file_path)
        .and_then(|node| node.last_modified.as_deref())
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
    else {
        return 0.0;
    };

    let age = Utc::now().signed_duration_since(modified.with_timezone(&Utc));
    let days = age.num_days();
    if days <= RECENT_DAYS {
        1.0
    } else if days <= STALE_DAYS {
        (1.0 - (days - RECENT_DAYS) as f32 / (STALE_DAYS - RECENT_DAYS) as f32).max(0.0)
    } else {
        0.0
    }
}

/// Inbound edge count, saturating at 5.
fn dependency_score(map: &RepositoryMap, file_path: &str) -> f32 {
    let dependents = map.dependents_of(file_path).len();
    (dependents as f32 / 5.0).min(1.0)
}

fn entry_point_score(map: &RepositoryMap, file_path: &str) -> f32 {
    if map.entry_points.iter().any(|ep| ep == file_path) {
        return 1.0;
    }

    let stem = Path::new(file_path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if matches!(stem.as_str(), "main" | "cli" | "app" | "index" | "__main__") {
        return 0.8;
    }

    let has_main = map
        .modules
        .get(file_path)
        .map(|node| node.functions.iter().any(|f| f.name == "main"))
        .unwrap_or(false);
    if has_main {
        0.6
    } else {
        0.0
    }
}

/// Test files get a small fixed score; tested files a full one.
fn test_coverage_score(map: &RepositoryMap, file_path: &str) -> f32 {
    if map.test_files.iter().any(|t| t == file_path) {
        return 0.3;
    }

    let path = Path::new(file_path);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let dir = path
        .parent()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default();

    let sibling = if dir.is_empty() {
        format!("test_{name}")
    } else {
        format!("{dir}/test_{name}")
    };
    let in_tests_dir = format!("tests/{name}");

    if map.modules.contains_key(&sibling) || map.modules.contains_key(&in_tests_dir) {
        1.0
    } else {
        0.2
    }
}

/// Heuristic change frequency by path and extension.
fn change_frequency_score(file_path: &str) -> f32 {
    let path = Path::new(file_path);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let dir = path
        .parent()
        .map(|p| p.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    const CONFIG_EXTS: &[&str] = &[".yaml", ".yml", ".json", ".toml", ".ini", ".conf"];
    const DOC_EXTS: &[&str] = &[".md", ".rst", ".txt"];

    if CONFIG_EXTS.iter().any(|ext| name.ends_with(ext)) {
        0.8
    } else if DOC_EXTS.iter().any(|ext| name.ends_with(ext)) || dir.contains("docs") {
        0.6
    } else if ["setup", "ci", "github", ".git"].iter().any(|frag| dir.contains(frag)) {
        0.7
    } else if name.ends_with(".py") {
        0.4
    } else {
        0.2
    }
}

/// Degree centrality: (in + out) / (total files − 1), clipped to [0, 1].
fn centrality_score(map: &RepositoryMap, file_path: &str) -> f32 {
    let total = map.modules.len();
    if total <= 1 {
        return 0.0;
    }

    let outbound = map
        .dependency_graph
        .get(file_path)
        .map(|deps| deps.len())
        .unwrap_or(0);
    let inbound = map.dependents_of(file_path).len();

    ((outbound + inbound) as f32 / (total - 1) as f32).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Arc<RepoMapper>, ImportanceScorer) {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("main.py"),
            "import utils\n\n\ndef main():\n    utils.helper()\n",
        )
        .unwrap();
        fs::write(dir.path().join("utils.py"), "def helper():\n    pass\n").unwrap();
        fs::create_dir_all(dir.path().join("tests")).unwrap();
        fs::write(
            dir.path().join("tests/test_utils.py"),
            "def test_helper():\n    pass\n",
        )
        .unwrap();

        let mapper = Arc::new(RepoMapper::new(dir.path()).unwrap());
        mapper.scan(false).unwrap();
        let scorer = ImportanceScorer::new(Arc::clone(&mapper));
        (dir, mapper, scorer)
    }

    #[test]
    fn test_entry_point_outranks_helper() {
        let (_dir, _mapper, scorer) = fixture();
        let main_score = scorer.score("main.py", None);
        let utils_score = scorer.score("utils.py", None);
        assert!(main_score > utils_score);
        assert!(main_score <= 1.0);
    }

    #[test]
    fn test_unknown_file_scores_zero() {
        let (_dir, _mapper, scorer) = fixture();
        assert_eq!(scorer.score("ghost.py", None), 0.0);
    }

    #[test]
    fn test_top_files_puts_entry_point_first() {
        let (_dir, _mapper, scorer) = fixture();
        let top = scorer.top_files(1, None);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].0, "main.py");
    }

    #[test]
    fn test_target_boost() {
        let (_dir, _mapper, scorer) = fixture();
        let plain = scorer.score("utils.py", None);
        let ctx = ScoreContext {
            target_file: Some("utils.py".to_owned()),
            operation: Some(Operation::Fix),
        };
        let boosted = scorer.score("utils.py", Some(&ctx));
        // +0.3 target boost and +0.2 fix boost, capped at 1.0
        assert!(boosted > plain);
        assert!((boosted - (plain + 0.5).min(1.0)).abs() < 1e-5);
    }

    #[test]
    fn test_test_operation_boosts_test_files() {
        let (_dir, _mapper, scorer) = fixture();
        let ctx = ScoreContext { target_file: None, operation: Some(Operation::Test) };
        let plain = scorer.score("tests/test_utils.py", None);
        let boosted = scorer.score("tests/test_utils.py", Some(&ctx));
        assert!(boosted > plain);
    }

    #[test]
    fn test_update_weights_validation() {
        let (_dir, _mapper, scorer) = fixture();

        let valid = ScoringWeights {
            recency: 0.5,
            dependencies: 0.3,
            entry_points: 0.1,
            test_coverage: 0.05,
            change_frequency: 0.03,
            graph_centrality: 0.02,
        };
        assert!(scorer.update_weights(valid).is_ok());
        assert_eq!(scorer.weights(), valid);

        let invalid = ScoringWeights {
            recency: 0.5,
            dependencies: 0.3,
            entry_points: 0.0,
            test_coverage: 0.0,
            change_frequency: 0.0,
            graph_centrality: 0.0,
        };
        assert!(matches!(scorer.update_weights(invalid), Err(EngineError::Validation(_))));
        // Rejected update leaves the previous weights in place
        assert_eq!(scorer.weights(), valid);
    }

    #[test]
    fn test_factors_cached_after_scoring() {
        let (_dir, _mapper, scorer) = fixture();
        assert!(scorer.importance_factors("main.py").is_none());
        scorer.score("main.py", None);
        let factors = scorer.importance_factors("main.py").unwrap();
        assert!(factors.contains_key("recency"));
        assert!(factors.contains_key("graph_centrality"));
        assert_eq!(factors.len(), 6);
        // Freshly written fixture files are inside the recent window
        assert!((factors["recency"] - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_rank_is_descending() {
        let (_dir, _mapper, scorer) = fixture();
        let paths = vec![
            "utils.py".to_owned(),
            "main.py".to_owned(),
            "tests/test_utils.py".to_owned(),
        ];
        let ranked = scorer.rank(&paths, None);
        assert_eq!(ranked.len(), 3);
        assert!(ranked[0].1 >= ranked[1].1);
        assert!(ranked[1].1 >= ranked[2].1);
    }
}
