//! spp CLI: incremental local full-text search

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use spp_core::search::Definition;
use spp_core::storage::LineSearch;
use spp_core::{Config, Orchestrator, SPP_DIR, Searcher, StatusSink, Storage, discover};
use syntect::easy::HighlightLines;
use syntect::highlighting::ThemeSet;
use syntect::parsing::SyntaxSet;
use syntect::util::{LinesWithEndings, as_24_bit_terminal_escaped};

#[derive(Parser)]
#[command(name = "spp")]
#[command(about = "Incremental local full-text search", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Search query (when no subcommand is given)
    #[arg(trailing_var_arg = true)]
    query: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new .spp workspace
    Init,

    /// Bring the index up to date with the files on disk
    Index,

    /// Show index status and statistics
    Status,

    /// Find lines containing all words of a query
    Search {
        /// Search query
        query: Vec<String>,

        /// Maximum number of matching lines
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Match whole words only
        #[arg(short = 'w', long)]
        words: bool,
    },

    /// Complete a word prefix from the index
    Complete {
        prefix: String,

        /// Maximum number of suggestions
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Show every line where a word occurs as a whole token
    Def { word: String },

    /// Keep the index up to date while files change
    Watch,

    /// Remove index files left behind by older versions
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init) => cmd_init()?,
        Some(Commands::Index) => cmd_index().await?,
        Some(Commands::Status) => cmd_status()?,
        Some(Commands::Search {
            query,
            limit,
            words,
        }) => {
            let query = query.join(" ");
            cmd_search(&query, limit, words)?;
        }
        Some(Commands::Complete { prefix, limit }) => cmd_complete(&prefix, limit)?,
        Some(Commands::Def { word }) => cmd_def(&word)?,
        Some(Commands::Watch) => cmd_watch().await?,
        Some(Commands::Clean) => cmd_clean()?,
        None => {
            if cli.query.is_empty() {
                println!("Usage: spp <query> or spp <command>");
                println!("Run 'spp --help' for more information.");
            } else {
                let query = cli.query.join(" ");
                cmd_search(&query, None, false)?;
            }
        }
    }

    Ok(())
}

fn find_root() -> Result<PathBuf> {
    let cwd = std::env::current_dir()?;
    discover::find_spp_root(&cwd).context("Not in an spp workspace. Run 'spp init' first.")
}

fn open_searcher(root: &Path) -> Result<Searcher> {
    Searcher::open(root).context("Could not open the index. Run 'spp index' first.")
}

/// Turns core progress and messages into terminal output.
#[derive(Default)]
struct TerminalSink {
    bar: Mutex<Option<ProgressBar>>,
}

impl TerminalSink {
    fn with_bar<T>(&self, f: impl FnOnce(&mut Option<ProgressBar>) -> T) -> T {
        let mut bar = self.bar.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut bar)
    }
}

impl StatusSink for TerminalSink {
    fn progress(&self, fraction: Option<f64>) {
        self.with_bar(|bar| match fraction {
            Some(fraction) => {
                let pb = bar.get_or_insert_with(|| {
                    let pb = ProgressBar::new(1000);
                    pb.set_style(
                        ProgressStyle::default_bar()
                            .template("{spinner:.green} [{bar:40.cyan/blue}] {percent:>3}% {msg}")
                            .unwrap_or_else(|_| ProgressStyle::default_bar())
                            .progress_chars("█▓░"),
                    );
                    pb.set_message("Indexing...");
                    pb
                });
                pb.set_position((fraction.clamp(0.0, 1.0) * 1000.0) as u64);
            }
            None => {
                if let Some(pb) = bar.take() {
                    pb.finish_and_clear();
                }
            }
        });
    }

    fn user_error(&self, message: &str) {
        self.with_bar(|bar| match bar {
            Some(pb) => pb.suspend(|| eprintln!("\x1b[31merror:\x1b[0m {message}")),
            None => eprintln!("\x1b[31merror:\x1b[0m {message}"),
        });
    }

    fn info(&self, message: &str) {
        self.with_bar(|bar| match bar {
            Some(pb) => pb.println(message),
            None => eprintln!("{message}"),
        });
    }
}

fn cmd_init() -> Result<()> {
    let cwd = std::env::current_dir()?;
    let spp_dir = cwd.join(SPP_DIR);

    if spp_dir.exists() {
        anyhow::bail!("Already initialized: {} exists", spp_dir.display());
    }

    std::fs::create_dir(&spp_dir)?;

    let config = Config::default();
    config.save(&cwd)?;

    println!("Initialized spp workspace in {}", spp_dir.display());
    println!("Run 'spp index' to index files.");

    Ok(())
}

fn open_orchestrator(root: &Path) -> Result<Orchestrator> {
    let config = Config::load(root).context("Could not load .spp/config.json")?;
    let storage = Storage::open(root, &config).context("Could not open the index")?;
    let sink: Arc<dyn StatusSink> = Arc::new(TerminalSink::default());
    Ok(Orchestrator::new(
        vec![root.to_path_buf()],
        Arc::new(storage),
        config,
        sink,
    )?)
}

async fn cmd_index() -> Result<()> {
    let root = find_root()?;
    let orchestrator = open_orchestrator(&root)?;

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message("Scanning files...");
    pb.enable_steady_tick(std::time::Duration::from_millis(100));

    let stats = orchestrator.scan_now().await;
    pb.finish_and_clear();

    let stats = stats.context("Indexing failed")?;
    let run = stats.run.unwrap_or_default();

    println!("✓ Indexing complete:");
    println!("  Files found:     {}", stats.files);
    println!("  Files queued:    {}", stats.queued);
    println!("  Files indexed:   {}", run.indexed);
    println!("  Binary files:    {}", run.binary);
    println!("  Files skipped:   {}", run.skipped);
    println!("  Files removed:   {}", stats.deleted);
    if run.failed > 0 {
        println!("  Failed writes:   {}", run.failed);
    }
    if stats.run_deferred {
        println!("  (another run is in progress; queued files will be picked up by it)");
    }

    Ok(())
}

fn cmd_status() -> Result<()> {
    let root = find_root()?;
    let config = Config::load(&root)?;

    println!("spp workspace: {}", root.display());
    println!();
    println!("Configuration:");
    println!("  Max file size: {} bytes", config.max_file_size);
    println!("  Batch size:    {} bytes", config.batch_bytes);
    println!("  Word pattern:  {}", config.word_pattern);
    println!("  Excludes:      {}", config.exclude_patterns().len());
    println!();
    println!("Index:");
    match Storage::open_readonly(&root, &config) {
        Ok(storage) => {
            println!("  Location:      {}", storage.path().display());
            println!("  Files indexed: {}", storage.count()?);
            println!("  Unique words:  {}", storage.word_count()?);
        }
        Err(e) => {
            tracing::debug!("status: {}", e);
            println!("  Not built yet. Run 'spp index'.");
        }
    }

    let stale = discover::stale_stores(&root)?;
    if !stale.is_empty() {
        println!();
        println!(
            "{} stale index file(s) from older versions. Run 'spp clean' to remove them.",
            stale.len()
        );
    }

    Ok(())
}

fn cmd_search(query: &str, limit: Option<usize>, words: bool) -> Result<()> {
    let root = find_root()?;
    let config = Config::load(&root)?;
    let limit = limit.unwrap_or(config.search_limit);

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message("Searching...");

    let searcher = open_searcher(&root)?;
    let results = if words {
        searcher.search_words(query, limit)?
    } else {
        searcher.search_with_limit(query, limit)?
    };

    pb.finish_and_clear();

    if results.results.is_empty() {
        println!("No results found for: {}", query);
        return Ok(());
    }

    print_line_search(&results, &root, &SyntaxHighlighter::new());
    Ok(())
}

fn cmd_complete(prefix: &str, limit: Option<usize>) -> Result<()> {
    let root = find_root()?;
    let searcher = open_searcher(&root)?;

    let words = match limit {
        Some(limit) => searcher.autocomplete_with_limit(prefix, limit)?,
        None => searcher.autocomplete(prefix)?,
    };
    for word in words {
        println!("{word}");
    }

    Ok(())
}

fn cmd_def(word: &str) -> Result<()> {
    let root = find_root()?;
    let searcher = open_searcher(&root)?;

    let definitions = searcher.definition_lookup(word)?;
    if definitions.is_empty() {
        println!("No occurrences of: {}", word);
        return Ok(());
    }

    print_definitions(&definitions, &root, &SyntaxHighlighter::new());
    Ok(())
}

async fn cmd_watch() -> Result<()> {
    let root = find_root()?;
    let orchestrator = open_orchestrator(&root)?;
    orchestrator.watch().await?;
    Ok(())
}

fn cmd_clean() -> Result<()> {
    let root = find_root()?;
    let stale = discover::stale_stores(&root)?;

    if stale.is_empty() {
        println!("Nothing to clean.");
        return Ok(());
    }
    for path in &stale {
        std::fs::remove_file(path).with_context(|| format!("Could not remove {}", path.display()))?;
        println!("Removed {}", path.display());
    }

    Ok(())
}

fn display_path<'a>(path: &'a str, root: &Path) -> std::borrow::Cow<'a, str> {
    match Path::new(path).strip_prefix(root) {
        Ok(relative) => relative.to_string_lossy(),
        Err(_) => path.into(),
    }
}

fn extension_of(path: &str) -> &str {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("txt")
}

/// Pretty-print line matches grouped by file, with syntax highlighting.
fn print_line_search(search: &LineSearch, root: &Path, highlighter: &SyntaxHighlighter) {
    for file in &search.results {
        println!("\x1b[1m{}\x1b[0m", display_path(&file.path, root));

        let mut display = String::new();
        for m in &file.matches {
            display.push_str(&format!("{:5} │ {}\n", m.line_number, m.line_text));
        }
        print!("{}", highlighter.highlight(&display, extension_of(&file.path)));
        println!();
    }

    if search.has_more {
        println!(
            "\x1b[2m... more than {} matches, use -n to show more\x1b[0m",
            search.match_count()
        );
    }
}

fn print_definitions(definitions: &[Definition], root: &Path, highlighter: &SyntaxHighlighter) {
    for def in definitions {
        let location = format!(
            "\x1b[1m{}\x1b[0m:\x1b[33m{}\x1b[0m: ",
            display_path(&def.path, root),
            def.line_number
        );
        let code = highlighter.highlight(def.line_text.trim(), extension_of(&def.path));
        println!("{location}{code}");
    }
}

/// Wrapper around syntect for syntax highlighting.
struct SyntaxHighlighter {
    syntax_set: SyntaxSet,
    theme_set: ThemeSet,
}

impl SyntaxHighlighter {
    fn new() -> Self {
        Self {
            syntax_set: SyntaxSet::load_defaults_newlines(),
            theme_set: ThemeSet::load_defaults(),
        }
    }

    fn highlight(&self, code: &str, extension: &str) -> String {
        let syntax = self
            .syntax_set
            .find_syntax_by_extension(extension)
            .unwrap_or_else(|| self.syntax_set.find_syntax_plain_text());

        let Some(theme) = self.theme_set.themes.get("base16-ocean.dark") else {
            return code.to_string();
        };
        let mut highlighter = HighlightLines::new(syntax, theme);

        let mut output = String::new();
        for line in LinesWithEndings::from(code) {
            match highlighter.highlight_line(line, &self.syntax_set) {
                Ok(ranges) => output.push_str(&as_24_bit_terminal_escaped(&ranges[..], false)),
                Err(_) => output.push_str(line),
            }
        }
        output.push_str("\x1b[0m");

        output
    }
}
