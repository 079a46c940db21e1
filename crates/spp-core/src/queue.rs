//! Pending-file queue and the batched read → classify → write pipeline

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;
use tokio::task::JoinSet;

use crate::classify::{Classifier, FileMeta};
use crate::storage::IndexDoc;
use crate::{Config, PROGRESS_INTERVAL, Result, SppError, Storage};

/// Counters from one queue run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    /// Documents written to storage (binary ones included)
    pub indexed: usize,
    /// Documents whose content was binary and stored without text
    pub binary: usize,
    /// Entries that could not be read
    pub skipped: usize,
    /// Documents lost to a failed storage write
    pub failed: usize,
}

/// Marks a single-flight operation as running until dropped.
pub(crate) struct FlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlightGuard<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool, what: &'static str) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SppError::AlreadyRunning(what))?;
        Ok(Self { flag })
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Files waiting to be (re-)indexed, keyed by path.
pub struct IndexQueue {
    pending: Mutex<IndexMap<String, FileMeta>>,
    running: AtomicBool,
    storage: Arc<Storage>,
    classifier: Arc<dyn Classifier>,
    read_group_size: usize,
    batch_bytes: usize,
}

impl IndexQueue {
    pub fn new(storage: Arc<Storage>, classifier: Arc<dyn Classifier>, config: &Config) -> Self {
        Self {
            pending: Mutex::new(IndexMap::new()),
            running: AtomicBool::new(false),
            storage,
            classifier,
            read_group_size: config.read_group_size.max(1),
            batch_bytes: config.batch_bytes,
        }
    }

    fn pending(&self) -> MutexGuard<'_, IndexMap<String, FileMeta>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a file. A later add for the same path replaces the metadata.
    pub fn add(&self, meta: FileMeta) {
        self.pending().insert(meta.path.clone(), meta);
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claim the run flag, failing if a run is in progress.
    pub(crate) fn hold(&self) -> Result<FlightGuard<'_>> {
        FlightGuard::acquire(&self.running, "index queue")
    }

    /// Read, classify and index everything queued when the run starts.
    ///
    /// Files are read `read_group_size` at a time and written in batches of
    /// roughly `batch_bytes` text. Entries added during the run are left for
    /// the next one. `on_progress` receives the dispatched fraction every
    /// `PROGRESS_INTERVAL` entries and `None` once done.
    pub async fn run(&self, mut on_progress: impl FnMut(Option<f64>) + Send) -> Result<RunStats> {
        let _guard = self.hold()?;

        let keys: Vec<String> = self.pending().keys().cloned().collect();
        let total = keys.len();
        tracing::debug!("index queue: {} files to process", total);

        let mut stats = RunStats::default();
        let mut batch: Vec<IndexDoc> = Vec::new();
        let mut batch_size = 0;
        let mut dispatched = 0;

        for group in keys.chunks(self.read_group_size) {
            let mut reads = JoinSet::new();
            for path in group {
                if dispatched % PROGRESS_INTERVAL == 0 {
                    on_progress(Some(dispatched as f64 / total as f64));
                }
                dispatched += 1;

                let Some(meta) = self.pending().shift_remove(path) else {
                    continue;
                };
                let classifier = Arc::clone(&self.classifier);
                reads.spawn(async move {
                    // `None` marks binary content
                    let result = tokio::fs::read(&meta.path).await.map(|bytes| {
                        (!classifier.is_binary_content(&bytes))
                            .then(|| String::from_utf8_lossy(&bytes).into_owned())
                    });
                    (meta, result)
                });
            }

            while let Some(joined) = reads.join_next().await {
                let (meta, result) = match joined {
                    Ok(read) => read,
                    Err(e) => {
                        tracing::warn!("Read task failed: {}", e);
                        stats.skipped += 1;
                        continue;
                    }
                };
                match result {
                    Ok(text) => {
                        let text = text.unwrap_or_else(|| {
                            tracing::debug!("binary content, indexing without text: {}", meta.path);
                            stats.binary += 1;
                            String::new()
                        });
                        batch_size += text.len();
                        batch.push(IndexDoc {
                            path: meta.path,
                            mtime: meta.mtime,
                            text,
                        });
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::IsADirectory
                        ) =>
                    {
                        tracing::debug!("skipping {}: {}", meta.path, e);
                        stats.skipped += 1;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to read {}: {}", meta.path, e);
                        stats.skipped += 1;
                    }
                }
            }

            if batch_size > self.batch_bytes {
                self.flush(&mut batch, &mut stats).await;
                batch_size = 0;
            }
        }
        self.flush(&mut batch, &mut stats).await;

        on_progress(None);
        tracing::info!(
            "index queue: {} indexed ({} binary), {} skipped, {} failed",
            stats.indexed,
            stats.binary,
            stats.skipped,
            stats.failed
        );

        Ok(stats)
    }

    /// Write the batch on a blocking thread. Failures are logged, not returned.
    async fn flush(&self, batch: &mut Vec<IndexDoc>, stats: &mut RunStats) {
        if batch.is_empty() {
            return;
        }
        let docs = std::mem::take(batch);
        let count = docs.len();
        let storage = Arc::clone(&self.storage);

        match tokio::task::spawn_blocking(move || storage.index_docs(&docs)).await {
            Ok(Ok(())) => {
                tracing::debug!("flushed {} documents", count);
                stats.indexed += count;
            }
            Ok(Err(e)) => {
                tracing::error!("Failed to write {} documents to the index: {}", count, e);
                stats.failed += count;
            }
            Err(e) => {
                tracing::error!("Index writer task failed for {} documents: {}", count, e);
                stats.failed += count;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::DefaultClassifier;
    use crate::tokenize::Tokenizer;
    use std::path::Path;
    use tempfile::TempDir;

    fn setup(config: &Config) -> (IndexQueue, Arc<Storage>, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(
            Storage::open_at(&dir.path().join("index.db"), Tokenizer::default()).unwrap(),
        );
        let classifier = Arc::new(DefaultClassifier::new(config.max_file_size));
        let queue = IndexQueue::new(Arc::clone(&storage), classifier, config);
        (queue, storage, dir)
    }

    fn write_file(dir: &Path, name: &str, content: &[u8]) -> FileMeta {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        FileMeta::from_path(&path).unwrap()
    }

    #[tokio::test]
    async fn test_run_indexes_queued_files() {
        let (queue, storage, dir) = setup(&Config::default());
        queue.add(write_file(dir.path(), "a.txt", b"alpha beta"));
        queue.add(write_file(dir.path(), "b.txt", b"beta gamma"));
        assert_eq!(queue.len(), 2);

        let stats = queue.run(|_| {}).await.unwrap();

        assert_eq!(stats.indexed, 2);
        assert!(queue.is_empty());
        assert!(!queue.is_running());
        assert_eq!(storage.count().unwrap(), 2);
        assert_eq!(storage.find_paths_by_word("beta", 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_add_replaces_metadata() {
        let (queue, storage, dir) = setup(&Config::default());
        let mut meta = write_file(dir.path(), "a.txt", b"alpha");
        queue.add(meta.clone());
        meta.mtime = 4242;
        queue.add(meta);
        assert_eq!(queue.len(), 1);

        queue.run(|_| {}).await.unwrap();
        assert_eq!(storage.all_meta_docs().unwrap()[0].mtime, 4242);
    }

    #[tokio::test]
    async fn test_binary_content_recorded_without_text() {
        let (queue, storage, dir) = setup(&Config::default());
        let mut content = b"looks like text".to_vec();
        content.extend([0u8, 1, 2, 3]);
        queue.add(write_file(dir.path(), "blob.unknownext", &content));

        let stats = queue.run(|_| {}).await.unwrap();

        assert_eq!(stats.binary, 1);
        assert_eq!(stats.indexed, 1);
        assert_eq!(storage.count().unwrap(), 1);
        assert_eq!(storage.word_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_files_are_skipped() {
        let (queue, storage, dir) = setup(&Config::default());
        let mut gone = write_file(dir.path(), "gone.txt", b"soon deleted");
        std::fs::remove_file(&gone.path).unwrap();
        gone.mtime += 1;
        queue.add(gone);
        queue.add(write_file(dir.path(), "kept.txt", b"kept"));

        let stats = queue.run(|_| {}).await.unwrap();

        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.indexed, 1);
        assert!(queue.is_empty());
        assert_eq!(storage.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_small_batches_flush_repeatedly() {
        let config = Config {
            batch_bytes: 1,
            read_group_size: 2,
            ..Config::default()
        };
        let (queue, storage, dir) = setup(&config);
        for i in 0..7 {
            queue.add(write_file(dir.path(), &format!("f{i}.txt"), format!("word{i}").as_bytes()));
        }

        let stats = queue.run(|_| {}).await.unwrap();
        assert_eq!(stats.indexed, 7);
        assert_eq!(storage.count().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_progress_reporting() {
        let (queue, _storage, dir) = setup(&Config::default());
        for i in 0..250 {
            queue.add(write_file(dir.path(), &format!("f{i}.txt"), b"x"));
        }

        let mut seen = Vec::new();
        queue.run(|p| seen.push(p)).await.unwrap();

        assert_eq!(seen, vec![Some(0.0), Some(0.4), Some(0.8), None]);
    }

    struct PanickingClassifier;

    impl Classifier for PanickingClassifier {
        fn is_indexable(&self, _meta: &FileMeta) -> bool {
            true
        }

        fn is_binary_content(&self, buf: &[u8]) -> bool {
            assert!(buf != b"boom", "classifier blew up");
            false
        }
    }

    #[tokio::test]
    async fn test_failed_read_task_does_not_abort_run() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(
            Storage::open_at(&dir.path().join("index.db"), Tokenizer::default()).unwrap(),
        );
        let queue = IndexQueue::new(
            Arc::clone(&storage),
            Arc::new(PanickingClassifier),
            &Config::default(),
        );
        queue.add(write_file(dir.path(), "a.txt", b"alpha"));
        queue.add(write_file(dir.path(), "bad.txt", b"boom"));
        queue.add(write_file(dir.path(), "c.txt", b"gamma"));

        let mut finished = false;
        let stats = queue.run(|p| finished = p.is_none()).await.unwrap();

        assert!(finished);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.indexed, 2);
        assert!(queue.is_empty());
        assert_eq!(storage.count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_run_is_single_flight() {
        let (queue, _storage, dir) = setup(&Config::default());
        queue.add(write_file(dir.path(), "a.txt", b"alpha"));

        let _held = queue.hold().unwrap();
        let err = queue.run(|_| {}).await.unwrap_err();

        assert!(matches!(err, SppError::AlreadyRunning("index queue")));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_guard_released_on_drop() {
        let flag = AtomicBool::new(false);
        {
            let _guard = FlightGuard::acquire(&flag, "test").unwrap();
            assert!(FlightGuard::acquire(&flag, "test").is_err());
        }
        assert!(FlightGuard::acquire(&flag, "test").is_ok());
    }
}
