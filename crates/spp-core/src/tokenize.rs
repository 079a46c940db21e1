//! Word tokenization shared by indexing and definition lookup

use indexmap::IndexSet;
use regex::Regex;

use crate::{DEFAULT_WORD_PATTERN, Result, SppError};

/// Splits text into word tokens using a configurable pattern.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    word: Regex,
}

impl Tokenizer {
    /// Compile a tokenizer from a word regex.
    pub fn new(pattern: &str) -> Result<Self> {
        let word = Regex::new(pattern)
            .map_err(|e| SppError::Config(format!("invalid word pattern '{pattern}': {e}")))?;
        Ok(Self { word })
    }

    /// Iterate over every token in `text`, in order, with repetitions.
    pub fn words<'t>(&self, text: &'t str) -> impl Iterator<Item = &'t str> {
        self.word.find_iter(text).map(|m| m.as_str())
    }

    /// Distinct tokens of `text`, case preserved, in order of first appearance.
    pub fn distinct<'t>(&self, text: &'t str) -> IndexSet<&'t str> {
        self.words(text).collect()
    }

    /// Whether `line` contains `word` as a whole token (case-sensitive).
    pub fn contains_word(&self, line: &str, word: &str) -> bool {
        line.contains(word) && self.words(line).any(|w| w == word)
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self {
            word: Regex::new(DEFAULT_WORD_PATTERN).expect("default word pattern is valid"),
        }
    }
}
