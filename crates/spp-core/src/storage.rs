//! SQLite storage: file records, word postings and two FTS5 indices
//!
//! Layout:
//! - `file(id, path, mtime)`: one row per indexed file
//! - `file_content(file_id, word, word_lower)`: distinct tokens per file,
//!   serving autocomplete and exact word lookup
//! - `word_fts`: contentless word-level FTS5 index keyed by `file.id`
//! - `trigram_fts`: contentless trigram FTS5 index keyed by `file.id`,
//!   serving substring search across word boundaries
//!
//! Deleting a `file` row cascades to all three (foreign key + trigger).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use fs2::FileExt;
use rusqlite::{Connection, ErrorCode, OpenFlags, params};
use serde::{Deserialize, Serialize};

use crate::tokenize::Tokenizer;
use crate::{Config, Result, SppError, discover};

/// Schema for the current `SCHEMA_VERSION`.
const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS file (
        id    INTEGER PRIMARY KEY,
        path  TEXT    NOT NULL UNIQUE,
        mtime INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS file_content (
        file_id    INTEGER NOT NULL REFERENCES file(id) ON DELETE CASCADE,
        word       TEXT    NOT NULL,
        word_lower TEXT    NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_file_content_word       ON file_content(word);
    CREATE INDEX IF NOT EXISTS idx_file_content_word_lower ON file_content(word_lower);
    CREATE INDEX IF NOT EXISTS idx_file_content_file_id    ON file_content(file_id);

    CREATE VIRTUAL TABLE IF NOT EXISTS word_fts USING fts5(
        text,
        content = '',
        contentless_delete = 1
    );

    CREATE VIRTUAL TABLE IF NOT EXISTS trigram_fts USING fts5(
        text,
        tokenize = 'trigram',
        content = '',
        contentless_delete = 1
    );

    CREATE TRIGGER IF NOT EXISTS file_after_delete AFTER DELETE ON file BEGIN
        DELETE FROM word_fts WHERE rowid = old.id;
        DELETE FROM trigram_fts WHERE rowid = old.id;
    END;
";

/// A document handed to the storage for (re-)indexing.
#[derive(Debug, Clone)]
pub struct IndexDoc {
    pub path: String,
    pub mtime: i64,
    /// Full text content; empty for binary files
    pub text: String,
}

/// Stored metadata of an indexed file, without any content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedMeta {
    pub path: String,
    pub mtime: i64,
}

/// A single matching line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineMatch {
    /// 1-indexed line number
    pub line_number: usize,
    pub line_text: String,
}

/// All matching lines of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMatches {
    pub path: String,
    pub matches: Vec<LineMatch>,
}

/// Result of a line-level search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSearch {
    pub results: Vec<FileMatches>,
    /// Whether more matches exist beyond the requested limit
    pub has_more: bool,
}

impl LineSearch {
    /// Total number of matching lines across all files.
    pub fn match_count(&self) -> usize {
        self.results.iter().map(|r| r.matches.len()).sum()
    }
}

/// Storage wrapper around an SQLite database with FTS5.
pub struct Storage {
    conn: Mutex<Connection>,
    tokenizer: Tokenizer,
    path: PathBuf,
    /// Held by writers only
    _lock: Option<StoreLock>,
}

impl Storage {
    /// Initialize or load storage for an spp workspace.
    pub fn open(root: &Path, config: &Config) -> Result<Self> {
        let tokenizer = Tokenizer::new(&config.word_pattern)?;
        Self::open_at(&discover::db_path(root), tokenizer)
    }

    /// Open the database at an explicit path.
    ///
    /// A lock file left behind by a crashed process is cleared. A database
    /// that fails to open as SQLite or fails the integrity check is recreated
    /// from empty; the next scan then re-indexes everything.
    pub fn open_at(db_path: &Path, tokenizer: Tokenizer) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock = StoreLock::acquire(&lock_path(db_path))?;

        let conn = match init_db(db_path) {
            Ok(conn) => conn,
            Err(e) if is_corruption(&e) => {
                tracing::warn!(
                    "Index at {} is corrupt ({}), recreating it",
                    db_path.display(),
                    e
                );
                remove_db_files(db_path)?;
                init_db(db_path).map_err(|e| SppError::Corrupt(e.to_string()))?
            }
            Err(e) if is_busy(&e) => return Err(SppError::Locked(db_path.to_path_buf())),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!("search index: {}", db_path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            tokenizer,
            path: db_path.to_path_buf(),
            _lock: Some(lock),
        })
    }

    /// Open an existing index for queries only.
    ///
    /// Takes no lock, so it works while another process keeps the index up
    /// to date. Fails if the index was never built.
    pub fn open_readonly(root: &Path, config: &Config) -> Result<Self> {
        let tokenizer = Tokenizer::new(&config.word_pattern)?;
        let db_path = discover::db_path(root);
        let conn = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Ok(Self {
            conn: Mutex::new(conn),
            tokenizer,
            path: db_path,
            _lock: None,
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The tokenizer used to derive postings.
    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the records and postings of all `docs` in a single transaction.
    ///
    /// Either the whole batch lands or none of it does.
    pub fn index_docs(&self, docs: &[IndexDoc]) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut delete_file = tx.prepare_cached("DELETE FROM file WHERE path = ?1")?;
            let mut insert_file =
                tx.prepare_cached("INSERT INTO file (path, mtime) VALUES (?1, ?2)")?;
            let mut insert_word = tx.prepare_cached(
                "INSERT INTO file_content (file_id, word, word_lower) VALUES (?1, ?2, ?3)",
            )?;
            let mut insert_word_fts =
                tx.prepare_cached("INSERT INTO word_fts (rowid, text) VALUES (?1, ?2)")?;
            let mut insert_trigram_fts =
                tx.prepare_cached("INSERT INTO trigram_fts (rowid, text) VALUES (?1, ?2)")?;

            for doc in docs {
                delete_file.execute([&doc.path])?;
                insert_file.execute(params![doc.path, doc.mtime])?;
                let file_id = tx.last_insert_rowid();

                if doc.text.is_empty() {
                    continue;
                }
                for word in self.tokenizer.distinct(&doc.text) {
                    insert_word.execute(params![file_id, word, word.to_lowercase()])?;
                }
                insert_word_fts.execute(params![file_id, doc.text])?;
                insert_trigram_fts.execute(params![file_id, doc.text])?;
            }
        }
        tx.commit()?;

        Ok(())
    }

    /// Remove records and all postings for `paths`. Unknown paths are ignored.
    ///
    /// Returns the number of records removed.
    pub fn delete_doc_by_path(&self, paths: &[String]) -> Result<usize> {
        if paths.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut delete_file = tx.prepare_cached("DELETE FROM file WHERE path = ?1")?;
            for path in paths {
                removed += delete_file.execute([path])?;
            }
        }
        tx.commit()?;

        Ok(removed)
    }

    /// List path and mtime of every indexed file.
    pub fn all_meta_docs(&self) -> Result<Vec<IndexedMeta>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached("SELECT path, mtime FROM file")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(IndexedMeta {
                    path: row.get(0)?,
                    mtime: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Tokens starting with `prefix` (case-insensitive), most widespread first.
    ///
    /// Tokens are returned in their original case.
    pub fn autocomplete_word(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        if prefix.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let lower = prefix.to_lowercase();
        // every string starting with `lower` sorts below this bound
        let upper = format!("{lower}\u{10FFFF}");

        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT word FROM file_content
             WHERE word_lower >= ?1 AND word_lower < ?2
             GROUP BY word
             ORDER BY COUNT(*) DESC, word
             LIMIT ?3",
        )?;
        let words = stmt
            .query_map(params![lower, upper, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(words)
    }

    /// Paths of files containing exactly `word` (case-sensitive), newest first.
    pub fn find_paths_by_word(&self, word: &str, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT path FROM file
             WHERE id IN (SELECT file_id FROM file_content WHERE word = ?1)
             ORDER BY mtime DESC, path
             LIMIT ?2",
        )?;
        let paths = stmt
            .query_map(params![word, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(paths)
    }

    /// Find lines containing every whitespace-separated part of `query`.
    ///
    /// With `is_partial`, candidate files come from the trigram index so parts
    /// may match anywhere, including across word boundaries. Otherwise every
    /// part must be a whole word, on the matched lines too. Candidates are
    /// re-read from disk and scanned case-insensitively; at most `limit` lines
    /// are returned in total.
    pub fn find_paths_with_lines_by_word(
        &self,
        query: &str,
        is_partial: bool,
        limit: usize,
    ) -> Result<LineSearch> {
        let sub_words: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        if sub_words.is_empty() || limit == 0 {
            return Ok(LineSearch::default());
        }

        let candidates = if is_partial {
            self.trigram_candidates(&sub_words)?
        } else {
            self.word_candidates(&sub_words)?
        };
        tracing::debug!("{} candidate files for '{}'", candidates.len(), query);

        let whole_words = (!is_partial).then_some(&self.tokenizer);
        Ok(collect_line_matches(candidates, &sub_words, whole_words, limit))
    }

    fn trigram_candidates(&self, sub_words: &[String]) -> Result<Vec<String>> {
        // the trigram tokenizer cannot match anything shorter than three characters
        let long: Vec<&String> = sub_words.iter().filter(|w| w.chars().count() >= 3).collect();

        let conn = self.conn();
        if long.is_empty() {
            // short parts may be punctuation that no token contains, so every
            // file with text is a candidate and the line scan decides
            let mut stmt = conn.prepare_cached(
                "SELECT path FROM file
                 WHERE EXISTS (SELECT 1 FROM file_content WHERE file_content.file_id = file.id)
                 ORDER BY mtime DESC, path",
            )?;
            let paths = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            return Ok(paths);
        }

        let expression = match_expression(long.iter().map(|w| w.as_str()));
        let mut stmt = conn.prepare_cached(
            "SELECT file.path FROM trigram_fts
             JOIN file ON file.id = trigram_fts.rowid
             WHERE trigram_fts MATCH ?1
             ORDER BY trigram_fts.rank",
        )?;
        let paths = stmt
            .query_map([expression], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(paths)
    }

    fn word_candidates(&self, sub_words: &[String]) -> Result<Vec<String>> {
        let expression = match_expression(sub_words.iter().map(String::as_str));

        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT file.path FROM word_fts
             JOIN file ON file.id = word_fts.rowid
             WHERE word_fts MATCH ?1
             ORDER BY word_fts.rank",
        )?;
        let paths = stmt
            .query_map([expression], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(paths)
    }

    /// Number of indexed files.
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM file", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Number of distinct tokens across all files.
    pub fn word_count(&self) -> Result<usize> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT word) FROM file_content",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

/// Open the database, enable WAL + foreign keys, verify it and create the schema.
fn init_db(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;

    conn.pragma_update(None, "journal_mode", "wal")?;
    conn.pragma_update(None, "foreign_keys", "on")?;
    conn.pragma_update(None, "synchronous", "normal")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    let report: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if report != "ok" {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CORRUPT),
            Some(format!("integrity check failed: {report}")),
        ));
    }

    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

fn is_corruption(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn sibling_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn lock_path(db_path: &Path) -> PathBuf {
    sibling_path(db_path, ".lock")
}

fn remove_db_files(db_path: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        match std::fs::remove_file(sibling_path(db_path, suffix)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Build an FTS5 expression requiring every term, each quoted as a phrase.
fn match_expression<'a>(terms: impl Iterator<Item = &'a str>) -> String {
    terms
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Scan candidate files line by line, stopping once `limit` lines matched.
/// Scan candidate files for lines holding every sub-word, case-insensitively.
///
/// With a tokenizer each sub-word must appear as a whole token.
fn collect_line_matches(
    paths: Vec<String>,
    sub_words: &[String],
    whole_words: Option<&Tokenizer>,
    limit: usize,
) -> LineSearch {
    let mut search = LineSearch::default();
    let mut total = 0;

    'files: for path in paths {
        let content = match std::fs::read(&path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::debug!("search: skipping unreadable {}: {}", path, e);
                continue;
            }
        };

        let mut matches = Vec::new();
        for (i, line) in content.lines().enumerate() {
            let lower = line.to_lowercase();
            let matched = match whole_words {
                Some(tokenizer) => sub_words.iter().all(|w| tokenizer.contains_word(&lower, w)),
                None => sub_words.iter().all(|w| lower.contains(w.as_str())),
            };
            if !matched {
                continue;
            }
            if total == limit {
                search.has_more = true;
                if !matches.is_empty() {
                    search.results.push(FileMatches { path, matches });
                }
                break 'files;
            }
            matches.push(LineMatch {
                line_number: i + 1,
                line_text: line.to_string(),
            });
            total += 1;
        }

        if !matches.is_empty() {
            search.results.push(FileMatches { path, matches });
        }
    }

    search
}

/// Exclusive advisory lock held for as long as a `Storage` is open.
///
/// The file is removed on clean shutdown, so finding one that nobody holds
/// means the previous owner crashed.
struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    fn acquire(path: &Path) -> Result<Self> {
        let existed = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
                || e.kind() == std::io::ErrorKind::WouldBlock
            {
                return Err(SppError::Locked(path.to_path_buf()));
            }
            return Err(e.into());
        }

        if existed {
            tracing::warn!(
                "Found a stale index lock at {}. Maybe spp crashed last time? Clearing it.",
                path.display()
            );
        }
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}
