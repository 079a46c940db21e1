//! Query surface: line search, autocomplete and definition lookup

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::storage::LineSearch;
use crate::{Config, Result, Storage};

/// A whole-word occurrence of a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub path: String,
    /// 1-indexed line number
    pub line_number: usize,
    pub line_text: String,
}

/// Searcher for querying the index.
pub struct Searcher {
    storage: Arc<Storage>,
    search_limit: usize,
    autocomplete_limit: usize,
}

impl Searcher {
    pub fn new(storage: Arc<Storage>, config: &Config) -> Self {
        Self {
            storage,
            search_limit: config.search_limit,
            autocomplete_limit: config.autocomplete_limit,
        }
    }

    /// Open a read-only searcher for an spp workspace.
    pub fn open(root: &Path) -> Result<Self> {
        let config = Config::load(root)?;
        let storage = Storage::open_readonly(root, &config)?;
        Ok(Self::new(Arc::new(storage), &config))
    }

    /// Lines containing every part of `query`, anywhere in a word.
    pub fn search(&self, query: &str) -> Result<LineSearch> {
        self.search_with_limit(query, self.search_limit)
    }

    pub fn search_with_limit(&self, query: &str, limit: usize) -> Result<LineSearch> {
        self.storage.find_paths_with_lines_by_word(query, true, limit)
    }

    /// Lines containing every part of `query` as whole words, ignoring case.
    pub fn search_words(&self, query: &str, limit: usize) -> Result<LineSearch> {
        self.storage.find_paths_with_lines_by_word(query, false, limit)
    }

    /// Known tokens starting with `prefix`.
    pub fn autocomplete(&self, prefix: &str) -> Result<Vec<String>> {
        self.autocomplete_with_limit(prefix, self.autocomplete_limit)
    }

    pub fn autocomplete_with_limit(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        self.storage.autocomplete_word(prefix, limit)
    }

    /// Every line, across indexed files, where `word` appears as a token.
    ///
    /// Matching is case-sensitive and respects token boundaries, so looking up
    /// `parse` does not report `parse_args`.
    pub fn definition_lookup(&self, word: &str) -> Result<Vec<Definition>> {
        let word = word.trim();
        if word.is_empty() {
            return Ok(Vec::new());
        }

        let tokenizer = self.storage.tokenizer();
        let mut definitions = Vec::new();
        for path in self.storage.find_paths_by_word(word, self.search_limit)? {
            let content = match std::fs::read(&path) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    tracing::debug!("definition lookup: skipping {}: {}", path, e);
                    continue;
                }
            };
            definitions.extend(
                content
                    .lines()
                    .enumerate()
                    .filter(|(_, line)| tokenizer.contains_word(line, word))
                    .map(|(i, line)| Definition {
                        path: path.clone(),
                        line_number: i + 1,
                        line_text: line.to_string(),
                    }),
            );
        }

        Ok(definitions)
    }
}
