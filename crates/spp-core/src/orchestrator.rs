//! Ties file events, scans and queue runs together
//!
//! Change notifications are coalesced through a [`Debouncer`]: file changes
//! queue the file and schedule a queue run, structural changes (directories,
//! unexplained removals, watcher overflow) schedule a full scan.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::task::JoinHandle;

use crate::classify::{Classifier, DefaultClassifier, FileMeta};
use crate::queue::RunStats;
use crate::scan::ScanStats;
use crate::{Config, IndexQueue, Result, Scanner, Searcher, SppError, Storage};

const SCAN_KEY: &str = "scan";
const RUN_KEY: &str = "run";

/// Receives user-facing progress and messages.
pub trait StatusSink: Send + Sync {
    /// Fraction done, or `None` when the operation finished.
    fn progress(&self, fraction: Option<f64>);

    fn user_error(&self, message: &str);

    fn info(&self, message: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl StatusSink for NullSink {
    fn progress(&self, _fraction: Option<f64>) {}
    fn user_error(&self, _message: &str) {}
    fn info(&self, _message: &str) {}
}

/// Trailing-edge debounce keyed by name.
///
/// Scheduling a key cancels that key's pending timer. Once a timer fires its
/// task runs detached, so later calls never interrupt work already started.
#[derive(Debug, Default)]
pub struct Debouncer {
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay` unless `key` is scheduled again first.
    pub fn debounce<F>(&self, key: &str, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = timers.remove(key) {
            previous.abort();
        }
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(task);
        });
        timers.insert(key.to_string(), timer);
    }

    /// Cancel every pending timer.
    pub fn cancel_all(&self) {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, timer) in timers.drain() {
            timer.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// A change notification for a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Changed(PathBuf),
    Created(PathBuf),
    Removed(PathBuf),
    /// Events were lost; the whole tree must be reconciled
    Rescan,
}

/// Translate a raw watcher event.
pub fn file_events(event: notify::Event) -> Vec<FileEvent> {
    if event.need_rescan() {
        return vec![FileEvent::Rescan];
    }

    let paths = event.paths;
    match event.kind {
        EventKind::Create(_) => paths.into_iter().map(FileEvent::Created).collect(),
        EventKind::Remove(_) => paths.into_iter().map(FileEvent::Removed).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.into_iter().map(FileEvent::Removed).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.into_iter().map(FileEvent::Created).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
            let mut paths = paths.into_iter();
            let (Some(from), Some(to)) = (paths.next(), paths.next()) else {
                return Vec::new();
            };
            vec![FileEvent::Removed(from), FileEvent::Created(to)]
        }
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .into_iter()
            .map(|path| {
                if path.exists() {
                    FileEvent::Created(path)
                } else {
                    FileEvent::Removed(path)
                }
            })
            .collect(),
        EventKind::Modify(_) => paths.into_iter().map(FileEvent::Changed).collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

/// Keeps the index of a set of roots in sync with the disk.
pub struct Orchestrator {
    roots: Vec<PathBuf>,
    config: Config,
    storage: Arc<Storage>,
    classifier: Arc<dyn Classifier>,
    queue: Arc<IndexQueue>,
    scanner: Arc<Scanner>,
    sink: Arc<dyn StatusSink>,
    debouncer: Arc<Debouncer>,
    scheduler: Scheduler,
}

impl Orchestrator {
    pub fn new(
        roots: Vec<PathBuf>,
        storage: Arc<Storage>,
        config: Config,
        sink: Arc<dyn StatusSink>,
    ) -> Result<Self> {
        let classifier: Arc<dyn Classifier> =
            Arc::new(DefaultClassifier::new(config.max_file_size));
        let queue = Arc::new(IndexQueue::new(
            Arc::clone(&storage),
            Arc::clone(&classifier),
            &config,
        ));
        let scanner = Arc::new(Scanner::new(
            roots.clone(),
            &config,
            Arc::clone(&storage),
            Arc::clone(&queue),
            Arc::clone(&classifier),
        )?);

        let debouncer = Arc::new(Debouncer::new());
        let scheduler = Scheduler {
            debouncer: Arc::downgrade(&debouncer),
            scanner: Arc::clone(&scanner),
            queue: Arc::clone(&queue),
            sink: Arc::clone(&sink),
            delay: Duration::from_millis(config.debounce_ms),
        };

        Ok(Self {
            roots,
            config,
            storage,
            classifier,
            queue,
            scanner,
            sink,
            debouncer,
            scheduler,
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn queue(&self) -> &Arc<IndexQueue> {
        &self.queue
    }

    pub fn scanner(&self) -> &Arc<Scanner> {
        &self.scanner
    }

    /// Query surface over the same storage.
    pub fn searcher(&self) -> Searcher {
        Searcher::new(Arc::clone(&self.storage), &self.config)
    }

    /// Scan immediately. Failures are reported through the sink.
    ///
    /// Files the scan could not index because the queue was busy get a
    /// scheduled run.
    pub async fn scan_now(&self) -> Option<ScanStats> {
        let stats = scan_and_report(&self.scanner, self.sink.as_ref()).await;
        self.scheduler.run_if_pending();
        stats
    }

    /// Run the queue immediately. Failures are reported through the sink.
    pub async fn run_queue_now(&self) -> Option<RunStats> {
        let stats = run_and_report(&self.queue, self.sink.as_ref()).await;
        self.scheduler.run_if_pending();
        stats
    }

    /// React to a single change notification.
    ///
    /// Filesystem and storage access happen on the blocking pool.
    pub async fn handle_event(&self, event: FileEvent) {
        match event {
            FileEvent::Changed(path) | FileEvent::Created(path) => {
                let scanner = Arc::clone(&self.scanner);
                let classifier = Arc::clone(&self.classifier);
                let inspected = tokio::task::spawn_blocking(move || {
                    let change = inspect(&scanner, classifier.as_ref(), &path);
                    (path, change)
                })
                .await;
                let (path, change) = match inspected {
                    Ok(inspected) => inspected,
                    Err(e) => {
                        tracing::error!("inspecting a change failed: {}", e);
                        return;
                    }
                };

                match change {
                    Change::Ignored => tracing::trace!("ignoring {}", path.display()),
                    Change::Directory => self.scheduler.scan(),
                    Change::File(meta) => {
                        tracing::debug!("queueing {}", meta.path);
                        self.queue.add(meta);
                        self.scheduler.run();
                    }
                    Change::Gone => {
                        self.remove_path(&path).await;
                    }
                }
            }
            FileEvent::Removed(path) => {
                if self.scanner.is_excluded(&path) {
                    return;
                }
                if self.remove_path(&path).await > 0 {
                    return;
                }
                // a removed directory leaves no record of its own, an ignored
                // path never had one
                let scanner = Arc::clone(&self.scanner);
                let ignored = tokio::task::spawn_blocking(move || {
                    scanner.is_ignored(&path, true) || scanner.is_ignored(&path, false)
                })
                .await
                .unwrap_or(false);
                if !ignored {
                    self.scheduler.scan();
                }
            }
            FileEvent::Rescan => self.scheduler.scan(),
        }
    }

    async fn remove_path(&self, path: &Path) -> usize {
        let storage = Arc::clone(&self.storage);
        let paths = [path.to_string_lossy().to_string()];
        match tokio::task::spawn_blocking(move || storage.delete_doc_by_path(&paths)).await {
            Ok(Ok(removed)) => removed,
            Ok(Err(e)) => {
                report_error(self.sink.as_ref(), &e);
                0
            }
            Err(e) => {
                report_error(self.sink.as_ref(), &SppError::from(e));
                0
            }
        }
    }

    /// Watch all roots and keep the index current until ctrl-c.
    pub async fn watch(&self) -> Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // the receiver only goes away on shutdown
            let _ = tx.send(res);
        })?;
        for root in &self.roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
            tracing::info!("watching {}", root.display());
        }

        self.scan_now().await;
        self.sink.info("Watching for changes (ctrl-c to stop)");

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(Ok(event)) => {
                        for event in file_events(event) {
                            self.handle_event(event).await;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("watcher error: {}", e);
                        self.scheduler.scan();
                    }
                    None => break,
                },
                _ = &mut shutdown => {
                    tracing::info!("shutting down watcher");
                    break;
                }
            }
        }

        self.debouncer.cancel_all();
        Ok(())
    }
}

/// What a created or changed path turned out to be.
enum Change {
    /// Excluded, ignored by an ignore file, or unstattable
    Ignored,
    Directory,
    File(FileMeta),
    /// Vanished or no longer indexable
    Gone,
}

fn inspect(scanner: &Scanner, classifier: &dyn Classifier, path: &Path) -> Change {
    if scanner.is_excluded(path) {
        return Change::Ignored;
    }
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) => {
            tracing::debug!("{} vanished before stat: {}", path.display(), e);
            return Change::Gone;
        }
    };
    if scanner.is_ignored(path, metadata.is_dir()) {
        return Change::Ignored;
    }
    if metadata.is_dir() {
        return Change::Directory;
    }
    match FileMeta::from_path(path) {
        Ok(meta) if classifier.is_indexable(&meta) => Change::File(meta),
        Ok(_) => Change::Gone,
        Err(e) => {
            tracing::debug!("cannot stat {}: {}", path.display(), e);
            Change::Ignored
        }
    }
}

/// Debounced scans and queue runs that re-arm while queued files remain.
#[derive(Clone)]
struct Scheduler {
    debouncer: Weak<Debouncer>,
    scanner: Arc<Scanner>,
    queue: Arc<IndexQueue>,
    sink: Arc<dyn StatusSink>,
    delay: Duration,
}

impl Scheduler {
    fn scan(&self) {
        let Some(debouncer) = self.debouncer.upgrade() else {
            return;
        };
        let this = self.clone();
        debouncer.debounce(SCAN_KEY, self.delay, async move {
            match this.scanner.scan(|fraction| this.sink.progress(fraction)).await {
                Ok(_) => {}
                Err(SppError::AlreadyRunning(what)) => {
                    tracing::debug!("{} in progress, scanning again afterwards", what);
                    this.scan();
                    return;
                }
                Err(e) => {
                    this.sink.progress(None);
                    report_error(this.sink.as_ref(), &e);
                }
            }
            this.run_if_pending();
        });
    }

    fn run(&self) {
        let Some(debouncer) = self.debouncer.upgrade() else {
            return;
        };
        let this = self.clone();
        debouncer.debounce(RUN_KEY, self.delay, async move {
            match this.queue.run(|fraction| this.sink.progress(fraction)).await {
                Ok(_) => {}
                // the queue stays intact, the check below retries
                Err(SppError::AlreadyRunning(what)) => {
                    tracing::debug!("{} busy, running again afterwards", what);
                }
                Err(e) => report_error(this.sink.as_ref(), &e),
            }
            this.run_if_pending();
        });
    }

    /// Schedule a run for files a busy or concurrent run left behind.
    fn run_if_pending(&self) {
        if !self.queue.is_empty() {
            tracing::debug!("{} files still queued, scheduling a run", self.queue.len());
            self.run();
        }
    }
}

fn report_error(sink: &dyn StatusSink, err: &SppError) {
    match err {
        SppError::AlreadyRunning(what) => tracing::error!("{} is already running, request refused", what),
        e if e.is_user_facing() => {
            tracing::warn!("{}", e);
            sink.user_error(&e.to_string());
        }
        e => tracing::error!("{}", e),
    }
}

async fn scan_and_report(scanner: &Scanner, sink: &dyn StatusSink) -> Option<ScanStats> {
    match scanner.scan(|fraction| sink.progress(fraction)).await {
        Ok(stats) => Some(stats),
        Err(e) => {
            sink.progress(None);
            report_error(sink, &e);
            None
        }
    }
}

async fn run_and_report(queue: &IndexQueue, sink: &dyn StatusSink) -> Option<RunStats> {
    match queue.run(|fraction| sink.progress(fraction)).await {
        Ok(stats) => Some(stats),
        Err(e) => {
            report_error(sink, &e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenize::Tokenizer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        errors: Mutex<Vec<String>>,
        finished: AtomicUsize,
    }

    impl StatusSink for RecordingSink {
        fn progress(&self, fraction: Option<f64>) {
            if fraction.is_none() {
                self.finished.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn user_error(&self, message: &str) {
            self.errors.lock().unwrap().push(message.to_string());
        }

        fn info(&self, _message: &str) {}
    }

    struct Fixture {
        orchestrator: Orchestrator,
        sink: Arc<RecordingSink>,
        root: TempDir,
        _state: TempDir,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let storage = Arc::new(
            Storage::open_at(&state.path().join("index.db"), Tokenizer::default()).unwrap(),
        );
        let config = Config {
            debounce_ms: 20,
            ..Config::default()
        };
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = Orchestrator::new(
            vec![root.path().to_path_buf()],
            storage,
            config,
            Arc::clone(&sink) as Arc<dyn StatusSink>,
        )
        .unwrap();
        Fixture {
            orchestrator,
            sink,
            root,
            _state: state,
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        condition()
    }

    #[tokio::test(start_paused = true)]
    async fn test_debouncer_coalesces_per_key() {
        let debouncer = Debouncer::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let a = Arc::clone(&a);
            debouncer.debounce("a", Duration::from_millis(100), async move {
                a.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let b2 = Arc::clone(&b);
        debouncer.debounce("b", Duration::from_millis(100), async move {
            b2.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debouncer_cancel_all() {
        let debouncer = Debouncer::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        debouncer.debounce("a", Duration::from_millis(100), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        debouncer.cancel_all();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_file_events_from_notify() {
        let created = notify::Event::new(EventKind::Create(notify::event::CreateKind::File))
            .add_path(PathBuf::from("/r/a.txt"));
        assert_eq!(file_events(created), vec![FileEvent::Created("/r/a.txt".into())]);

        let renamed = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/r/old.txt"))
            .add_path(PathBuf::from("/r/new.txt"));
        assert_eq!(
            file_events(renamed),
            vec![
                FileEvent::Removed("/r/old.txt".into()),
                FileEvent::Created("/r/new.txt".into()),
            ]
        );

        let rescan = notify::Event::new(EventKind::Other).set_flag(notify::event::Flag::Rescan);
        assert_eq!(file_events(rescan), vec![FileEvent::Rescan]);

        let access = notify::Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/r/a.txt"));
        assert!(file_events(access).is_empty());
    }

    #[tokio::test]
    async fn test_created_file_gets_indexed() {
        let fx = fixture();
        let path = fx.root.path().join("new.txt");
        std::fs::write(&path, "fresh content").unwrap();

        fx.orchestrator.handle_event(FileEvent::Created(path)).await;

        let storage = Arc::clone(fx.orchestrator.storage());
        assert!(eventually(|| storage.find_paths_by_word("fresh", 10).unwrap().len() == 1).await);
    }

    #[tokio::test]
    async fn test_excluded_paths_are_ignored() {
        let fx = fixture();
        let path = fx.root.path().join("node_modules/pkg/index.js");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "module").unwrap();

        fx.orchestrator.handle_event(FileEvent::Created(path)).await;
        assert!(fx.orchestrator.queue().is_empty());
    }

    #[tokio::test]
    async fn test_gitignored_paths_are_ignored() {
        let fx = fixture();
        std::fs::write(fx.root.path().join(".gitignore"), "target/\n").unwrap();
        let path = fx.root.path().join("target/out.txt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "build output").unwrap();

        fx.orchestrator.handle_event(FileEvent::Created(path.clone())).await;
        fx.orchestrator
            .handle_event(FileEvent::Created(fx.root.path().join("target")))
            .await;
        assert!(fx.orchestrator.queue().is_empty());

        // nothing is scheduled either
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fx.orchestrator.storage().count().unwrap(), 0);
        assert_eq!(fx.sink.finished.load(Ordering::SeqCst), 0);

        std::fs::remove_file(&path).unwrap();
        fx.orchestrator.handle_event(FileEvent::Removed(path)).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fx.sink.finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_change_during_busy_run_is_indexed_later() {
        let fx = fixture();
        let path = fx.root.path().join("late.txt");
        std::fs::write(&path, "arrived late").unwrap();

        let held = fx.orchestrator.queue().hold().unwrap();
        fx.orchestrator.handle_event(FileEvent::Created(path)).await;
        // several debounced runs fire and find the queue busy
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fx.orchestrator.queue().len(), 1);
        drop(held);

        let storage = Arc::clone(fx.orchestrator.storage());
        assert!(eventually(|| storage.find_paths_by_word("late", 10).unwrap().len() == 1).await);
        assert!(fx.orchestrator.queue().is_empty());
    }

    #[tokio::test]
    async fn test_deferred_scan_files_get_a_run() {
        let fx = fixture();
        std::fs::write(fx.root.path().join("a.txt"), "deferred words").unwrap();

        let held = fx.orchestrator.queue().hold().unwrap();
        let stats = fx.orchestrator.scan_now().await.unwrap();
        assert!(stats.run_deferred);
        drop(held);

        let storage = Arc::clone(fx.orchestrator.storage());
        assert!(eventually(|| storage.count().unwrap() == 1).await);
    }

    #[tokio::test]
    async fn test_removed_file_leaves_index() {
        let fx = fixture();
        let path = fx.root.path().join("a.txt");
        std::fs::write(&path, "doomed").unwrap();
        fx.orchestrator.scan_now().await.unwrap();
        assert_eq!(fx.orchestrator.storage().count().unwrap(), 1);

        std::fs::remove_file(&path).unwrap();
        fx.orchestrator.handle_event(FileEvent::Removed(path)).await;

        assert_eq!(fx.orchestrator.storage().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_removed_directory_triggers_scan() {
        let fx = fixture();
        let dir = fx.root.path().join("sub");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.txt"), "nested").unwrap();
        fx.orchestrator.scan_now().await.unwrap();

        std::fs::remove_dir_all(&dir).unwrap();
        fx.orchestrator.handle_event(FileEvent::Removed(dir)).await;

        let storage = Arc::clone(fx.orchestrator.storage());
        assert!(eventually(|| storage.count().unwrap() == 0).await);
    }

    #[tokio::test]
    async fn test_scan_errors_reach_the_sink() {
        let fx = fixture();
        let sub = fx.root.path().join("sub");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join(".gitignore"), "{broken\n").unwrap();

        assert!(fx.orchestrator.scan_now().await.is_none());
        let errors = fx.sink.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("ignore file"));
    }

    #[tokio::test]
    async fn test_run_queue_now_reports_completion() {
        let fx = fixture();
        let path = fx.root.path().join("a.txt");
        std::fs::write(&path, "queued").unwrap();
        fx.orchestrator
            .queue()
            .add(FileMeta::from_path(&path).unwrap());

        let stats = fx.orchestrator.run_queue_now().await.unwrap();
        assert_eq!(stats.indexed, 1);
        assert_eq!(fx.sink.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_searcher_sees_scanned_files() {
        let fx = fixture();
        std::fs::write(fx.root.path().join("notes.md"), "remember the milk\n").unwrap();
        fx.orchestrator.scan_now().await.unwrap();

        let searcher = fx.orchestrator.searcher();
        assert_eq!(searcher.search("milk").unwrap().match_count(), 1);
        assert_eq!(searcher.autocomplete("rem").unwrap(), vec!["remember".to_string()]);
    }
}
