//! Configuration handling for .spp/config.json

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    DEFAULT_AUTOCOMPLETE_LIMIT, DEFAULT_BATCH_BYTES, DEFAULT_DEBOUNCE_MS, DEFAULT_EXCLUDES,
    DEFAULT_IGNORE_FILENAMES, DEFAULT_MAX_FILE_SIZE, DEFAULT_READ_GROUP_SIZE, DEFAULT_SEARCH_LIMIT,
    DEFAULT_WORD_PATTERN, Result, SPP_DIR, discover,
};

/// Configuration stored in .spp/config.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Maximum file size to index (bytes)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Accumulated bytes of read text that trigger a storage flush
    #[serde(default = "default_batch_bytes")]
    pub batch_bytes: usize,

    /// Number of files read concurrently while indexing
    #[serde(default = "default_read_group_size")]
    pub read_group_size: usize,

    /// Quiet period before change notifications trigger a scan or run (ms)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Maximum number of line matches per search
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,

    /// Maximum number of autocomplete suggestions
    #[serde(default = "default_autocomplete_limit")]
    pub autocomplete_limit: usize,

    /// Regex describing one word token
    #[serde(default = "default_word_pattern")]
    pub word_pattern: String,

    /// Ignore files honored per directory, on top of .gitignore/.ignore
    #[serde(default = "default_ignore_filenames")]
    pub ignore_filenames: Vec<String>,

    /// Exclude globs, first source. `true` excludes, `false` re-includes.
    #[serde(default)]
    pub files_exclude: IndexMap<String, bool>,

    /// Exclude globs, second source (overrides `files_exclude`)
    #[serde(default)]
    pub search_exclude: IndexMap<String, bool>,

    /// Exclude globs, third source (overrides both others)
    #[serde(default)]
    pub watcher_exclude: IndexMap<String, bool>,
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

fn default_batch_bytes() -> usize {
    DEFAULT_BATCH_BYTES
}

fn default_read_group_size() -> usize {
    DEFAULT_READ_GROUP_SIZE
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_search_limit() -> usize {
    DEFAULT_SEARCH_LIMIT
}

fn default_autocomplete_limit() -> usize {
    DEFAULT_AUTOCOMPLETE_LIMIT
}

fn default_word_pattern() -> String {
    DEFAULT_WORD_PATTERN.to_string()
}

fn default_ignore_filenames() -> Vec<String> {
    DEFAULT_IGNORE_FILENAMES.iter().map(|s| s.to_string()).collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            batch_bytes: default_batch_bytes(),
            read_group_size: default_read_group_size(),
            debounce_ms: default_debounce_ms(),
            search_limit: default_search_limit(),
            autocomplete_limit: default_autocomplete_limit(),
            word_pattern: default_word_pattern(),
            ignore_filenames: default_ignore_filenames(),
            files_exclude: IndexMap::new(),
            search_exclude: IndexMap::new(),
            watcher_exclude: IndexMap::new(),
        }
    }
}

impl Config {
    /// Load config from the .spp directory.
    pub fn load(root: &Path) -> Result<Self> {
        let path = discover::config_path(root);
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to the .spp directory.
    pub fn save(&self, root: &Path) -> Result<()> {
        let path = discover::config_path(root);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Effective exclude globs.
    ///
    /// Defaults come first, then `files_exclude`, `search_exclude` and
    /// `watcher_exclude` in that order; a later source wins on key collision.
    /// The state directory is always excluded.
    pub fn exclude_patterns(&self) -> Vec<String> {
        let mut merged: IndexMap<String, bool> = DEFAULT_EXCLUDES
            .iter()
            .map(|pattern| (pattern.to_string(), true))
            .collect();

        for source in [&self.files_exclude, &self.search_exclude, &self.watcher_exclude] {
            for (pattern, enabled) in source {
                merged.insert(pattern.clone(), *enabled);
            }
        }
        merged.insert(format!("**/{SPP_DIR}"), true);

        merged
            .into_iter()
            .filter_map(|(pattern, enabled)| enabled.then_some(pattern))
            .collect()
    }
}
