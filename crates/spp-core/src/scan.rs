//! File-set reconciliation: enumerate, stat, diff against the index

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use ignore::gitignore::GitignoreBuilder;

use crate::classify::{Classifier, FileMeta};
use crate::queue::{FlightGuard, RunStats};
use crate::storage::IndexedMeta;
use crate::{Config, IndexQueue, Result, SppError, Storage};

/// Compiled exclude globs, matched against root-relative paths.
#[derive(Debug, Clone)]
pub struct ExcludeSet {
    set: GlobSet,
}

impl ExcludeSet {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|source| SppError::Pattern {
                pattern: pattern.clone(),
                source,
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|source| SppError::Pattern {
            pattern: patterns.join(", "),
            source,
        })?;
        Ok(Self { set })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.exclude_patterns())
    }

    /// Whether a root-relative path matches an exclude glob.
    pub fn matches_relative(&self, relative: &Path) -> bool {
        !relative.as_os_str().is_empty() && self.set.is_match(relative)
    }

    /// Whether `path`, or any directory between `root` and it, is excluded.
    ///
    /// Paths outside `root` are never excluded.
    pub fn is_excluded(&self, root: &Path, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(root) else {
            return false;
        };
        relative
            .ancestors()
            .any(|ancestor| self.matches_relative(ancestor))
    }
}

/// Produces the candidate file list for a root.
pub trait FileEnumerator: Send + Sync {
    fn enumerate(
        &self,
        root: &Path,
        excludes: &ExcludeSet,
        ignore_filenames: &[String],
    ) -> Result<Vec<PathBuf>>;
}

/// Directory walk honoring `.gitignore`, `.ignore` and custom ignore files.
#[derive(Debug, Default, Clone, Copy)]
pub struct WalkEnumerator;

impl FileEnumerator for WalkEnumerator {
    fn enumerate(
        &self,
        root: &Path,
        excludes: &ExcludeSet,
        ignore_filenames: &[String],
    ) -> Result<Vec<PathBuf>> {
        let mut builder = WalkBuilder::new(root);
        builder
            .hidden(false)
            .follow_links(true)
            .require_git(false)
            .git_ignore(true)
            .git_exclude(true)
            .git_global(false)
            .ignore(true)
            .parents(true);
        for name in ignore_filenames {
            if name != ".gitignore" && name != ".ignore" {
                builder.add_custom_ignore_filename(name);
            }
        }

        let filter_root = root.to_path_buf();
        let filter_excludes = excludes.clone();
        builder.filter_entry(move |entry| {
            let relative = entry.path().strip_prefix(&filter_root).unwrap_or(entry.path());
            !filter_excludes.matches_relative(relative)
        });

        let mut files = Vec::new();
        for result in builder.build() {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) if is_glob_error(&e) => return Err(SppError::IgnoreSyntax(e.to_string())),
                Err(e) => {
                    tracing::debug!("walk: {}", e);
                    continue;
                }
            };
            if let Some(e) = entry.error() {
                if is_glob_error(e) {
                    return Err(SppError::IgnoreSyntax(e.to_string()));
                }
                tracing::warn!("Problem reading ignore rules: {}", e);
            }
            if entry.file_type().is_some_and(|t| t.is_file()) {
                files.push(entry.into_path());
            }
        }

        files.sort();
        files.dedup();
        Ok(files)
    }
}

/// Ignore file names in increasing precedence, as a walk applies them.
fn ignore_file_names(ignore_filenames: &[String]) -> Vec<&str> {
    let mut names = vec![".gitignore", ".ignore"];
    for name in ignore_filenames {
        if !names.contains(&name.as_str()) {
            names.push(name.as_str());
        }
    }
    names
}

/// Whether the ignore files in the directories from `root` down to `path`
/// exclude it.
///
/// Mirrors the walk: a deeper directory's rules win over a shallower one's,
/// and within a directory custom ignore files win over `.ignore`, which wins
/// over `.gitignore`. Ignore files that fail to parse are skipped here; a
/// scan reports them.
pub fn is_ignored_by_files(
    root: &Path,
    path: &Path,
    is_dir: bool,
    ignore_filenames: &[String],
) -> bool {
    if !path.starts_with(root) || path == root {
        return false;
    }
    let names = ignore_file_names(ignore_filenames);

    for dir in path.ancestors().skip(1).take_while(|dir| dir.starts_with(root)) {
        let mut builder = GitignoreBuilder::new(dir);
        let mut sources = Vec::new();
        if dir == root {
            sources.push(dir.join(".git").join("info").join("exclude"));
        }
        sources.extend(names.iter().map(|name| dir.join(name)));

        let mut found = false;
        for source in sources.iter().filter(|source| source.is_file()) {
            found = true;
            if let Some(e) = builder.add(source) {
                tracing::debug!("ignore rules in {}: {}", source.display(), e);
            }
        }
        if !found {
            continue;
        }

        let rules = match builder.build() {
            Ok(rules) => rules,
            Err(e) => {
                tracing::debug!("ignore rules in {}: {}", dir.display(), e);
                continue;
            }
        };
        let matched = rules.matched_path_or_any_parents(path, is_dir);
        if matched.is_ignore() {
            return true;
        }
        if matched.is_whitelist() {
            return false;
        }
    }
    false
}

fn is_glob_error(err: &ignore::Error) -> bool {
    match err {
        ignore::Error::Glob { .. } => true,
        ignore::Error::Partial(errs) => errs.iter().any(is_glob_error),
        ignore::Error::WithLineNumber { err, .. }
        | ignore::Error::WithPath { err, .. }
        | ignore::Error::WithDepth { err, .. } => is_glob_error(err),
        _ => false,
    }
}

/// What a scan has to do to bring the index in line with the disk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanPlan {
    pub to_index: Vec<FileMeta>,
    pub to_delete: Vec<String>,
}

/// Compare the files on disk with the indexed records.
///
/// A file is (re-)indexed when it is indexable and its mtime differs from the
/// stored one. Records whose file is gone or no longer indexable are deleted.
pub fn diff(current: &[FileMeta], stored: &[IndexedMeta], classifier: &dyn Classifier) -> ScanPlan {
    let stored_mtimes: HashMap<&str, i64> = stored
        .iter()
        .map(|meta| (meta.path.as_str(), meta.mtime))
        .collect();

    let indexable: Vec<&FileMeta> = current
        .iter()
        .filter(|meta| classifier.is_indexable(meta))
        .collect();
    let present: HashSet<&str> = indexable.iter().map(|meta| meta.path.as_str()).collect();

    let to_index = indexable
        .into_iter()
        .filter(|meta| stored_mtimes.get(meta.path.as_str()) != Some(&meta.mtime))
        .cloned()
        .collect();
    let to_delete = stored
        .iter()
        .filter(|meta| !present.contains(meta.path.as_str()))
        .map(|meta| meta.path.clone())
        .collect();

    ScanPlan {
        to_index,
        to_delete,
    }
}

/// Stats from a scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanStats {
    /// Files found on disk
    pub files: usize,
    /// Files handed to the index queue
    pub queued: usize,
    /// Records removed from the index
    pub deleted: usize,
    /// Result of the queue run started by this scan
    pub run: Option<RunStats>,
    /// The queue was busy; queued files wait for the next run
    pub run_deferred: bool,
}

/// Reconciles the index with the file trees under a set of roots.
pub struct Scanner {
    roots: Vec<PathBuf>,
    excludes: ExcludeSet,
    ignore_filenames: Vec<String>,
    enumerator: Arc<dyn FileEnumerator>,
    classifier: Arc<dyn Classifier>,
    storage: Arc<Storage>,
    queue: Arc<IndexQueue>,
    running: AtomicBool,
}

impl Scanner {
    pub fn new(
        roots: Vec<PathBuf>,
        config: &Config,
        storage: Arc<Storage>,
        queue: Arc<IndexQueue>,
        classifier: Arc<dyn Classifier>,
    ) -> Result<Self> {
        Ok(Self {
            roots,
            excludes: ExcludeSet::from_config(config)?,
            ignore_filenames: config.ignore_filenames.clone(),
            enumerator: Arc::new(WalkEnumerator),
            classifier,
            storage,
            queue,
            running: AtomicBool::new(false),
        })
    }

    /// Replace the file enumerator.
    pub fn with_enumerator(mut self, enumerator: Arc<dyn FileEnumerator>) -> Self {
        self.enumerator = enumerator;
        self
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn excludes(&self) -> &ExcludeSet {
        &self.excludes
    }

    /// Whether `path` lies under a root and is excluded there.
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.roots
            .iter()
            .any(|root| path.starts_with(root) && self.excludes.is_excluded(root, path))
    }

    /// Whether a scan would leave `path` out, by exclude glob or ignore file.
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        self.roots.iter().any(|root| {
            path.starts_with(root)
                && (self.excludes.is_excluded(root, path)
                    || is_ignored_by_files(root, path, is_dir, &self.ignore_filenames))
        })
    }

    /// Bring the index in line with the disk, then run the queue.
    ///
    /// Deletions are applied before anything is queued. Nothing is changed
    /// if enumeration fails.
    pub async fn scan(&self, on_progress: impl FnMut(Option<f64>) + Send) -> Result<ScanStats> {
        let _guard = FlightGuard::acquire(&self.running, "scan")?;

        let roots = self.roots.clone();
        let excludes = self.excludes.clone();
        let ignore_filenames = self.ignore_filenames.clone();
        let enumerator = Arc::clone(&self.enumerator);
        let current = tokio::task::spawn_blocking(move || {
            collect_metadata(enumerator.as_ref(), &roots, &excludes, &ignore_filenames)
        })
        .await??;

        let storage = Arc::clone(&self.storage);
        let stored = tokio::task::spawn_blocking(move || storage.all_meta_docs()).await??;

        let plan = diff(&current, &stored, self.classifier.as_ref());
        let mut stats = ScanStats {
            files: current.len(),
            queued: plan.to_index.len(),
            ..ScanStats::default()
        };
        tracing::debug!(
            "scan: {} files, {} stored, {} to index, {} to delete",
            current.len(),
            stored.len(),
            plan.to_index.len(),
            plan.to_delete.len()
        );

        if !plan.to_delete.is_empty() {
            let storage = Arc::clone(&self.storage);
            let to_delete = plan.to_delete;
            stats.deleted =
                tokio::task::spawn_blocking(move || storage.delete_doc_by_path(&to_delete))
                    .await??;
        }

        for meta in plan.to_index {
            self.queue.add(meta);
        }

        match self.queue.run(on_progress).await {
            Ok(run) => stats.run = Some(run),
            Err(SppError::AlreadyRunning(_)) => {
                tracing::debug!("scan: index queue busy, leaving {} files queued", self.queue.len());
                stats.run_deferred = true;
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            "scan: {} files, {} queued, {} deleted",
            stats.files,
            stats.queued,
            stats.deleted
        );
        Ok(stats)
    }
}

/// Enumerate every root and stat the results. Unstattable files are skipped.
fn collect_metadata(
    enumerator: &dyn FileEnumerator,
    roots: &[PathBuf],
    excludes: &ExcludeSet,
    ignore_filenames: &[String],
) -> Result<Vec<FileMeta>> {
    let mut metas = Vec::new();
    for root in roots {
        for path in enumerator.enumerate(root, excludes, ignore_filenames)? {
            match FileMeta::from_path(&path) {
                Ok(meta) => metas.push(meta),
                Err(e) => tracing::debug!("scan: cannot stat {}: {}", path.display(), e),
            }
        }
    }
    Ok(metas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::DefaultClassifier;
    use crate::tokenize::Tokenizer;
    use std::fs;
    use tempfile::TempDir;

    fn meta(path: &str, mtime: i64) -> FileMeta {
        FileMeta {
            path: path.to_string(),
            size: 10,
            mtime,
        }
    }

    fn stored(path: &str, mtime: i64) -> IndexedMeta {
        IndexedMeta {
            path: path.to_string(),
            mtime,
        }
    }

    fn classifier() -> DefaultClassifier {
        DefaultClassifier::new(1024)
    }

    struct Fixture {
        scanner: Scanner,
        storage: Arc<Storage>,
        queue: Arc<IndexQueue>,
        root: TempDir,
        _state: TempDir,
    }

    fn fixture(config: &Config) -> Fixture {
        let root = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let storage = Arc::new(
            Storage::open_at(&state.path().join("index.db"), Tokenizer::default()).unwrap(),
        );
        let classifier: Arc<dyn Classifier> =
            Arc::new(DefaultClassifier::new(config.max_file_size));
        let queue = Arc::new(IndexQueue::new(
            Arc::clone(&storage),
            Arc::clone(&classifier),
            config,
        ));
        let scanner = Scanner::new(
            vec![root.path().to_path_buf()],
            config,
            Arc::clone(&storage),
            Arc::clone(&queue),
            classifier,
        )
        .unwrap();
        Fixture {
            scanner,
            storage,
            queue,
            root,
            _state: state,
        }
    }

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn indexed_paths(storage: &Storage, root: &Path) -> Vec<String> {
        let mut paths: Vec<String> = storage
            .all_meta_docs()
            .unwrap()
            .into_iter()
            .map(|m| {
                Path::new(&m.path)
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        paths.sort();
        paths
    }

    #[test]
    fn test_diff_changed_mtime_is_queued() {
        let plan = diff(&[meta("/r/a.txt", 200)], &[stored("/r/a.txt", 100)], &classifier());
        assert_eq!(plan.to_index, vec![meta("/r/a.txt", 200)]);
        assert!(plan.to_delete.is_empty());
    }

    #[test]
    fn test_diff_same_mtime_is_not_queued() {
        let plan = diff(&[meta("/r/a.txt", 100)], &[stored("/r/a.txt", 100)], &classifier());
        assert_eq!(plan, ScanPlan::default());
    }

    #[test]
    fn test_diff_new_and_removed() {
        let plan = diff(
            &[meta("/r/new.txt", 1), meta("/r/logo.png", 1)],
            &[stored("/r/old.txt", 1)],
            &classifier(),
        );
        assert_eq!(plan.to_index, vec![meta("/r/new.txt", 1)]);
        assert_eq!(plan.to_delete, vec!["/r/old.txt".to_string()]);
    }

    #[test]
    fn test_diff_drops_files_that_became_too_large() {
        let mut big = meta("/r/a.txt", 5);
        big.size = 4096;
        let plan = diff(&[big], &[stored("/r/a.txt", 1)], &classifier());
        assert!(plan.to_index.is_empty());
        assert_eq!(plan.to_delete, vec!["/r/a.txt".to_string()]);
    }

    #[test]
    fn test_exclude_set_matches_ancestors() {
        let excludes = ExcludeSet::from_config(&Config::default()).unwrap();
        let root = Path::new("/repo");
        assert!(excludes.is_excluded(root, Path::new("/repo/node_modules/pkg/index.js")));
        assert!(excludes.is_excluded(root, Path::new("/repo/a/.git/HEAD")));
        assert!(excludes.is_excluded(root, Path::new("/repo/.spp/index-v1.db")));
        assert!(!excludes.is_excluded(root, Path::new("/repo/src/main.rs")));
        assert!(!excludes.is_excluded(root, Path::new("/elsewhere/node_modules/x")));
    }

    #[test]
    fn test_invalid_exclude_pattern() {
        let err = ExcludeSet::new(&["a[".to_string()]).unwrap_err();
        assert!(matches!(err, SppError::Pattern { .. }));
    }

    #[test]
    fn test_walk_honors_ignore_files_and_excludes() {
        let root = TempDir::new().unwrap();
        write(root.path(), "src/main.rs", "fn main() {}");
        write(root.path(), ".gitignore", "target/\n*.log\n");
        write(root.path(), "target/debug/out.txt", "built");
        write(root.path(), "app.log", "noise");
        write(root.path(), "node_modules/pkg/index.js", "module");
        write(root.path(), "docs/.searchignore", "draft.md\n");
        write(root.path(), "docs/draft.md", "wip");
        write(root.path(), "docs/final.md", "done");
        write(root.path(), ".hidden/notes.txt", "hidden but indexed");

        let excludes = ExcludeSet::from_config(&Config::default()).unwrap();
        let ignore_filenames = vec![".gitignore".to_string(), ".searchignore".to_string()];
        let files = WalkEnumerator
            .enumerate(root.path(), &excludes, &ignore_filenames)
            .unwrap();

        let mut relative: Vec<String> = files
            .iter()
            .map(|p| p.strip_prefix(root.path()).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        relative.sort();
        assert_eq!(
            relative,
            vec![
                ".gitignore",
                ".hidden/notes.txt",
                "docs/.searchignore",
                "docs/final.md",
                "src/main.rs",
            ]
        );
    }

    #[tokio::test]
    async fn test_scan_indexes_then_is_idempotent() {
        let fx = fixture(&Config::default());
        write(fx.root.path(), "a.txt", "alpha");
        write(fx.root.path(), "sub/b.md", "beta");
        write(fx.root.path(), "image.png", "not really a png");

        let first = fx.scanner.scan(|_| {}).await.unwrap();
        assert_eq!(first.queued, 2);
        assert_eq!(first.run.unwrap().indexed, 2);
        assert_eq!(indexed_paths(&fx.storage, fx.root.path()), vec!["a.txt", "sub/b.md"]);

        let second = fx.scanner.scan(|_| {}).await.unwrap();
        assert_eq!(second.queued, 0);
        assert_eq!(second.deleted, 0);
        assert!(fx.queue.is_empty());
    }

    #[tokio::test]
    async fn test_scan_removes_deleted_files() {
        let fx = fixture(&Config::default());
        write(fx.root.path(), "a.txt", "alpha");
        write(fx.root.path(), "b.txt", "beta");
        fx.scanner.scan(|_| {}).await.unwrap();

        fs::remove_file(fx.root.path().join("a.txt")).unwrap();
        let stats = fx.scanner.scan(|_| {}).await.unwrap();

        assert_eq!(stats.deleted, 1);
        assert_eq!(indexed_paths(&fx.storage, fx.root.path()), vec!["b.txt"]);
        assert!(fx.storage.find_paths_by_word("alpha", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_is_single_flight() {
        let fx = fixture(&Config::default());
        let _held = FlightGuard::acquire(&fx.scanner.running, "scan").unwrap();

        let err = fx.scanner.scan(|_| {}).await.unwrap_err();
        assert!(matches!(err, SppError::AlreadyRunning("scan")));
    }

    #[tokio::test]
    async fn test_scan_defers_when_queue_busy() {
        let fx = fixture(&Config::default());
        write(fx.root.path(), "a.txt", "alpha");

        let held = fx.queue.hold().unwrap();
        let stats = fx.scanner.scan(|_| {}).await.unwrap();
        assert!(stats.run_deferred);
        assert_eq!(fx.queue.len(), 1);
        drop(held);

        fx.queue.run(|_| {}).await.unwrap();
        assert_eq!(fx.storage.count().unwrap(), 1);
    }

    #[test]
    fn test_ignore_files_follow_walk_precedence() {
        let root = TempDir::new().unwrap();
        let root = root.path();
        write(root, ".gitignore", "target/\n*.log\n");
        write(root, "sub/.gitignore", "!keep.log\n");
        write(root, "docs/.searchignore", "draft*\n");
        let names = vec![".gitignore".to_string(), ".searchignore".to_string()];

        let ignored = |relative: &str, is_dir: bool| {
            is_ignored_by_files(root, &root.join(relative), is_dir, &names)
        };
        assert!(ignored("target/debug/out.txt", false));
        assert!(ignored("target", true));
        assert!(ignored("app.log", false));
        assert!(!ignored("sub/keep.log", false));
        assert!(ignored("sub/other.log", false));
        assert!(ignored("docs/draft-1.md", false));
        assert!(!ignored("draft-1.md", false));
        assert!(!ignored("src/main.rs", false));
        assert!(!is_ignored_by_files(root, Path::new("/elsewhere/app.log"), false, &names));
    }

    #[test]
    fn test_scanner_is_ignored_agrees_with_walk() {
        let fx = fixture(&Config::default());
        write(fx.root.path(), ".gitignore", "build/\n");
        write(fx.root.path(), "build/gen.txt", "generated");
        write(fx.root.path(), "src/lib.txt", "source");

        let walked = WalkEnumerator
            .enumerate(fx.root.path(), fx.scanner.excludes(), &[".gitignore".to_string()])
            .unwrap();
        assert!(walked.iter().all(|p| !p.starts_with(fx.root.path().join("build"))));

        assert!(fx.scanner.is_ignored(&fx.root.path().join("build/gen.txt"), false));
        assert!(fx.scanner.is_ignored(&fx.root.path().join("node_modules/x.js"), false));
        assert!(!fx.scanner.is_ignored(&fx.root.path().join("src/lib.txt"), false));
    }

    #[tokio::test]
    async fn test_bad_ignore_file_fails_without_side_effects() {
        let fx = fixture(&Config::default());
        write(fx.root.path(), "a.txt", "alpha");
        fx.scanner.scan(|_| {}).await.unwrap();

        fs::remove_file(fx.root.path().join("a.txt")).unwrap();
        write(fx.root.path(), "sub/.gitignore", "{unclosed\n");
        write(fx.root.path(), "sub/c.txt", "gamma");

        let err = fx.scanner.scan(|_| {}).await.unwrap_err();
        assert!(matches!(err, SppError::IgnoreSyntax(_)));
        assert!(err.is_user_facing());
        assert_eq!(fx.storage.count().unwrap(), 1);
        assert!(fx.queue.is_empty());
    }
}
