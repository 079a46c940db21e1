/// The name of the spp folder (like .git)
pub const SPP_DIR: &str = ".spp";

/// Schema version, embedded in the database file name.
///
/// Bumping this starts a fresh store; older files are left behind untouched.
pub const SCHEMA_VERSION: u32 = 1;

/// Default max file size (1MB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024;

/// Bytes of read text that trigger a storage flush (5MB)
pub const DEFAULT_BATCH_BYTES: usize = 5 * 1024 * 1024;

/// Number of files read concurrently by the index queue
pub const DEFAULT_READ_GROUP_SIZE: usize = 20;

/// Progress is reported every this many dispatched entries
pub const PROGRESS_INTERVAL: usize = 100;

/// Default trailing-edge debounce for change notifications (ms)
pub const DEFAULT_DEBOUNCE_MS: u64 = 1500;

/// Default maximum number of line matches returned by a search
pub const DEFAULT_SEARCH_LIMIT: usize = 200;

/// Default maximum number of autocomplete suggestions
pub const DEFAULT_AUTOCOMPLETE_LIMIT: usize = 20;

/// Default token pattern: runs of Unicode letters, digits and underscores
pub const DEFAULT_WORD_PATTERN: &str = r"[\p{L}\p{N}_]+";

/// Ignore files honored hierarchically in addition to `.gitignore`/`.ignore`
pub const DEFAULT_IGNORE_FILENAMES: &[&str] = &[".gitignore"];

/// Exclude patterns that are always merged in, with the lowest priority.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "**/.DS_Store",
    "**/.git",
    "**/.git/objects/**",
    "**/.git/subtree-cache/**",
    "**/.hg",
    "**/.hg/store/**",
    "**/.svn",
    "**/*.code-search",
    "**/bower_components",
    "**/CVS",
    "**/node_modules",
    "**/node_modules/*/**",
    "**/Thumbs.db",
];
