//! Repolens CLI - Repository intelligence for LLM context synthesis
//!
//! Scans a source tree into a structured map and synthesizes
//! token-budgeted context excerpts for edit operations.

// CLI tools legitimately use print macros for user output
#![allow(clippy::print_stdout, clippy::print_stderr)]

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use humansize::{format_size, BINARY};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use repolens_engine::{
    ContextProvider, ContextRequest, FileMonitor, Operation, ReferenceResolver, RepoMapper,
};

/// Repolens - repository intelligence for LLMs
#[derive(Parser)]
#[command(
    name = "repolens",
    version,
    about = "Maintain a structured repository map and synthesize LLM context",
    long_about = "Repolens continuously maps a source tree (files, functions, classes,\nimports, cross-file references) and assembles token-budgeted context\nexcerpts tailored to a specific edit intent."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a repository and show statistics
    Scan {
        /// Path to repository (default: current directory)
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Ignore any existing cache and rescan from disk
        #[arg(long)]
        no_cache: bool,

        /// Output the full repository map as JSON
        #[arg(long)]
        json: bool,

        /// Show the per-file breakdown
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print the compressed map representation
    Map {
        /// Path to repository (default: current directory)
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Token budget for the compressed map
        #[arg(short, long, default_value = "8000")]
        budget: u32,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Build a context excerpt for an edit operation
    Context {
        /// Path to repository (default: current directory)
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Operation kind
        #[arg(short, long, value_enum, default_value = "generate")]
        operation: OperationArg,

        /// Target file (repo-relative)
        #[arg(short, long)]
        file: Option<String>,

        /// Token budget for the excerpt
        #[arg(short, long, default_value = "8000")]
        budget: u32,

        /// Model used for token counting
        #[arg(short, long)]
        model: Option<String>,

        /// Use section-level budget allocation
        #[arg(long)]
        budgeted: bool,

        /// Output result metadata as JSON
        #[arg(long)]
        json: bool,
    },

    /// Watch a repository and apply incremental updates
    Watch {
        /// Path to repository (default: current directory)
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Exit after this many events (default: run until interrupted)
        #[arg(long)]
        events: Option<usize>,
    },

    /// Show mapper and symbol-index statistics
    Stats {
        /// Path to repository (default: current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy)]
enum OperationArg {
    Generate,
    Fix,
    Refactor,
    Explain,
    Test,
    Document,
}

impl From<OperationArg> for Operation {
    fn from(arg: OperationArg) -> Self {
        match arg {
            OperationArg::Generate => Self::Generate,
            OperationArg::Fix => Self::Fix,
            OperationArg::Refactor => Self::Refactor,
            OperationArg::Explain => Self::Explain,
            OperationArg::Test => Self::Test,
            OperationArg::Document => Self::Document,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan { path, no_cache, json, verbose } => cmd_scan(&path, no_cache, json, verbose),
        Commands::Map { path, budget, output } => cmd_map(&path, budget, output),
        Commands::Context { path, operation, file, budget, model, budgeted, json } => {
            cmd_context(&path, operation.into(), file, budget, model, budgeted, json)
        }
        Commands::Watch { path, events } => cmd_watch(&path, events),
        Commands::Stats { path } => cmd_stats(&path),
    }
}

fn cmd_scan(path: &PathBuf, no_cache: bool, json: bool, verbose: bool) -> Result<()> {
    let mapper = RepoMapper::new(path).context("open repository")?;

    let started = Instant::now();
    let map = mapper.scan(!no_cache).context("scan repository")?;
    let elapsed = started.elapsed();

    if json {
        println!("{}", serde_json::to_string_pretty(&map)?);
        return Ok(());
    }

    println!("{} {}", "Scanned".green().bold(), map.root_path);
    println!("  Files:   {}", map.total_files);
    println!("  Lines:   {}", map.total_lines);

    let mut langs: Vec<_> = map.languages.iter().collect();
    langs.sort_by(|a, b| b.1.cmp(a.1));
    if !langs.is_empty() {
        let summary = langs
            .iter()
            .take(5)
            .map(|(lang, count)| format!("{lang} ({count})"))
            .collect::<Vec<_>>()
            .join(", ");
        println!("  Languages: {summary}");
    }

    if !map.entry_points.is_empty() {
        println!("  Entry points:");
        for entry in map.entry_points.iter().take(5) {
            println!("    - {entry}");
        }
    }
    println!("  Test files: {}", map.test_files.len());

    if verbose {
        println!();
        for (rel, node) in &map.modules {
            println!(
                "  {rel} [{}] {} lines, {} funcs, {} classes",
                node.language,
                node.lines_of_code,
                node.functions.len(),
                node.classes.len()
            );
        }
    }

    let cache_file = path.join(".vibe_cache/repo_map.json");
    if let Ok(meta) = std::fs::metadata(&cache_file) {
        println!("  Cache:   {} ({})", cache_file.display(), format_size(meta.len(), BINARY));
    }
    println!("  Took:    {elapsed:.2?}");
    Ok(())
}

fn cmd_map(path: &PathBuf, budget: u32, output: Option<PathBuf>) -> Result<()> {
    let mapper = RepoMapper::new(path).context("open repository")?;
    mapper.scan(true).context("scan repository")?;

    let compressed = mapper.compress(budget);
    match output {
        Some(out) => {
            std::fs::write(&out, &compressed)
                .with_context(|| format!("write {}", out.display()))?;
            eprintln!("{} {}", "Wrote".green().bold(), out.display());
        }
        None => println!("{compressed}"),
    }
    Ok(())
}

fn cmd_context(
    path: &PathBuf,
    operation: Operation,
    file: Option<String>,
    budget: u32,
    model: Option<String>,
    budgeted: bool,
    json: bool,
) -> Result<()> {
    let mapper = Arc::new(RepoMapper::new(path).context("open repository")?);
    let provider = ContextProvider::new(Arc::clone(&mapper));

    let mut request = ContextRequest::new(operation);
    request.target_file = file;
    request.token_budget = budget;
    request.model_name = model;

    let result = if budgeted {
        provider.get_context_with_budgeting(&request, 0)?
    } else {
        provider.get_context(&request)?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("{}", result.context);
    eprintln!();
    eprintln!(
        "{} ~{} tokens, {} file(s){}",
        "Context:".cyan().bold(),
        result.token_estimate,
        result.files_included.len(),
        if result.truncated { ", truncated" } else { "" }
    );
    Ok(())
}

fn cmd_watch(path: &PathBuf, events: Option<usize>) -> Result<()> {
    let mapper = Arc::new(RepoMapper::new(path).context("open repository")?);
    mapper.scan(true).context("scan repository")?;

    let monitor = FileMonitor::new(Arc::clone(&mapper));
    monitor
        .start(&[], true)
        .context("start filesystem monitor")?;
    eprintln!("{} {}", "Watching".green().bold(), mapper.root().display());

    let mut seen = 0usize;
    loop {
        if let Some(event) = monitor.wait_for_change(Duration::from_secs(1)) {
            seen += 1;
            let kind = event.kind.name();
            match event.old_path {
                Some(ref old) => println!("[{kind}] {old} -> {}", event.path),
                None => println!("[{kind}] {}", event.path),
            }
            if let Some(limit) = events {
                if seen >= limit {
                    break;
                }
            }
        }
    }

    monitor.stop();
    Ok(())
}

fn cmd_stats(path: &PathBuf) -> Result<()> {
    let mapper = Arc::new(RepoMapper::new(path).context("open repository")?);
    mapper.scan(true).context("scan repository")?;

    let stats = mapper.stats().context("repository not scanned")?;
    println!("{}", "Repository".cyan().bold());
    println!("  Root:         {}", stats.root_path);
    println!("  Files:        {}", stats.total_files);
    println!("  Lines:        {}", stats.total_lines);
    println!("  Entry points: {}", stats.entry_points);
    println!("  Test files:   {}", stats.test_files);
    println!("  Generated at: {}", stats.generated_at);

    let resolver = ReferenceResolver::new(Arc::clone(&mapper));
    resolver.build_indexes().context("build symbol indexes")?;
    let symbols = resolver.statistics();

    println!("{}", "Symbols".cyan().bold());
    println!("  Symbols:      {}", symbols.total_symbols);
    println!("  Definitions:  {}", symbols.total_definitions);
    println!("  References:   {}", symbols.total_references);
    if !symbols.most_referenced.is_empty() {
        println!("  Most referenced:");
        for (name, count) in symbols.most_referenced.iter().take(10) {
            println!("    {count:>4}  {name}");
        }
    }
    Ok(())
}
