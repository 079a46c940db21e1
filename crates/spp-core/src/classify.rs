//! Text vs. binary classification
//!
//! Extension tables are consulted first since they are cheap and
//! deterministic. When the extension is unknown, a structural UTF-8 sniff of
//! the start, middle and end of the content decides.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Metadata of a file on disk, produced fresh by every scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Absolute path, used as the unique identifier of the file
    pub path: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification time (unix seconds)
    pub mtime: i64,
}

impl FileMeta {
    /// Stat `path` and build its metadata.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self {
            path: path.to_string_lossy().to_string(),
            size: metadata.len(),
            mtime: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
        })
    }
}

/// Decides which files get indexed and which contents count as binary.
pub trait Classifier: Send + Sync {
    /// Whether a file should be indexed at all, judged from its metadata.
    fn is_indexable(&self, meta: &FileMeta) -> bool;

    /// Whether a buffer read from disk is binary.
    fn is_binary_content(&self, buf: &[u8]) -> bool;
}

/// Extension tables plus content sniffing, with a size ceiling.
#[derive(Debug, Clone)]
pub struct DefaultClassifier {
    max_file_size: u64,
}

impl DefaultClassifier {
    pub fn new(max_file_size: u64) -> Self {
        Self { max_file_size }
    }
}

impl Classifier for DefaultClassifier {
    fn is_indexable(&self, meta: &FileMeta) -> bool {
        is_indexable(meta, self.max_file_size)
    }

    fn is_binary_content(&self, buf: &[u8]) -> bool {
        is_binary_content(buf)
    }
}

/// What an extension table says about a file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    Text,
    Binary,
}

/// Known text file extensions (and bare file names)
const TEXT_EXTENSIONS: &[&str] = &[
    "dockerfile", "makefile", "rakefile",
    "ada", "adb", "ads", "applescript", "as", "ascx", "asm", "asmx", "asp", "aspx", "atom",
    "bas", "bash", "bashrc", "bat", "bbcolors", "bdsgroup", "bdsproj", "bib", "bowerrc",
    "c", "cbl", "cc", "cfc", "cfg", "cfm", "cfml", "cgi", "clj", "cljs", "cls", "cmake", "cmd",
    "cnf", "cob", "coffee", "conf", "cpp", "cpt", "cpy", "crt", "cs", "csh", "cson", "csr",
    "css", "csv", "ctl", "cxx", "dart", "dfm", "diff", "dockerignore", "dof", "dpk", "dproj",
    "dtd", "eco", "editorconfig", "ejs", "el", "emacs", "eml", "ent", "erb", "erl",
    "eslintignore", "eslintrc", "ex", "exs", "f", "f03", "f77", "f90", "f95", "fish", "for",
    "fpp", "frm", "ftn", "gemrc", "gitattributes", "gitconfig", "gitignore", "gitkeep",
    "gitmodules", "go", "gpp", "gradle", "groovy", "groupproj", "grunit", "gtmpl", "gvimrc",
    "h", "haml", "hbs", "hgignore", "hh", "hpp", "hrl", "hs", "hta", "htaccess", "htc", "htm",
    "html", "htpasswd", "hxx", "iced", "inc", "ini", "ino", "int", "irbrc", "itcl",
    "itermcolors", "itk", "jade", "java", "jhtm", "jhtml", "js", "jscsrc", "jshintignore",
    "jshintrc", "json", "json5", "jsonld", "jsp", "jspx", "jsx", "kt", "kts", "ksh", "less",
    "lhs", "lisp", "log", "ls", "lsp", "lua", "m", "mak", "map", "markdown", "master", "md",
    "mdown", "mdwn", "mdx", "metadata", "mht", "mhtml", "mjs", "mk", "mkd", "mkdn", "mkdown",
    "ml", "mli", "mm", "mxml", "nfm", "nfo", "njk", "noon", "npmignore", "npmrc", "nvmrc",
    "ops", "pas", "pasm", "patch", "pbxproj", "pch", "pem", "pg", "php", "php3", "php4",
    "php5", "phpt", "phtml", "pir", "pl", "pm", "pmc", "pod", "pot", "properties", "props",
    "pt", "pug", "py", "r", "rake", "rb", "rdoc", "rdoc_options", "resx", "rhtml", "rjs",
    "rlib", "rmd", "ron", "rs", "rss", "rst", "rtf", "rvmrc", "rxml", "s", "sass", "scala",
    "scm", "scss", "seestyle", "sh", "shtml", "sls", "spec", "sql", "ss", "sss", "st",
    "strings", "sty", "styl", "stylus", "sub", "sublime-build", "sublime-commands",
    "sublime-completions", "sublime-keymap", "sublime-macro", "sublime-menu",
    "sublime-project", "sublime-settings", "sublime-workspace", "sv", "svc", "svelte", "svg",
    "swift", "t", "tcl", "tcsh", "terminal", "tex", "text", "textile", "tg", "tmlanguage",
    "tmtheme", "tmpl", "toml", "tpl", "ts", "tsv", "tsx", "tt", "tt2", "ttml", "txt", "v",
    "vb", "vbs", "vh", "vhd", "vhdl", "vim", "viminfo", "vimrc", "vue", "webapp", "wxml",
    "wxss", "x-php", "xaml", "xht", "xhtml", "xml", "xs", "xsd", "xsl", "xslt", "yaml", "yml",
    "zig", "zsh", "zshrc",
];

/// Known binary file extensions
const BINARY_EXTENSIONS: &[&str] = &[
    "7z", "bin", "bmp", "class", "dds", "dll", "dylib", "eot", "exe", "gif", "gz", "ico",
    "jar", "jpeg", "jpg", "mp3", "mp4", "otf", "pdf", "png", "pyc", "so", "swf", "tar",
    "tga", "ttf", "wasm", "webp", "woff", "woff2", "xz", "zip",
];

/// Classify a path by its extension(s).
///
/// Every dot-separated part of the file name is tried, last first, so that
/// `archive.tar.gz` resolves on `gz` and a bare `Makefile` resolves on its name.
pub fn extension_class(path: &Path) -> Option<ContentClass> {
    let name = path.file_name()?.to_str()?.to_lowercase();

    for part in name.rsplit('.') {
        if TEXT_EXTENSIONS.contains(&part) {
            return Some(ContentClass::Text);
        }
        if BINARY_EXTENSIONS.contains(&part) {
            return Some(ContentClass::Binary);
        }
    }
    None
}

/// Decide binary-ness from the path first, then from the content if given.
///
/// Unknown extensions without content are treated as text.
pub fn is_binary(path: &Path, buf: Option<&[u8]>) -> bool {
    match extension_class(path) {
        Some(class) => class == ContentClass::Binary,
        None => buf.is_some_and(is_binary_content),
    }
}

/// Check whether a file is worth indexing based on its metadata only.
pub fn is_indexable(meta: &FileMeta, max_file_size: u64) -> bool {
    extension_class(Path::new(&meta.path)) != Some(ContentClass::Binary)
        && meta.size > 0
        && meta.size <= max_file_size
}

/// Bytes inspected per sniff window
const SNIFF_WINDOW: usize = 24;

/// Structural UTF-8 sniff at the start, middle and end of `buf`.
///
/// Any control character at or below U+0008, or any byte sequence that is not
/// valid UTF-8, marks the content as binary.
pub fn is_binary_content(buf: &[u8]) -> bool {
    if buf.is_empty() {
        return false;
    }
    let middle = (buf.len() / 2).saturating_sub(SNIFF_WINDOW);
    let end = buf.len().saturating_sub(SNIFF_WINDOW);

    [0, middle, end]
        .into_iter()
        .any(|begin| window_is_binary(buf, begin))
}

fn window_is_binary(buf: &[u8], begin: usize) -> bool {
    let Some(begin) = align_begin(buf, begin) else {
        return true;
    };
    let end = align_end(buf, (begin + SNIFF_WINDOW).min(buf.len()));
    if end > buf.len() {
        // multibyte sequence cut off by the end of the file
        return true;
    }

    String::from_utf8_lossy(&buf[begin..end])
        .chars()
        .any(|c| c == char::REPLACEMENT_CHARACTER || u32::from(c) <= 8)
}

/// Total length of the UTF-8 sequence introduced by `lead`, for multibyte leads.
fn sequence_len(lead: u8) -> Option<usize> {
    match lead {
        0xC0..=0xDF => Some(2),
        0xE0..=0xEF => Some(3),
        0xF0..=0xF7 => Some(4),
        _ => None,
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Move a window start back onto the lead byte of the character it falls in.
fn align_begin(buf: &[u8], pos: usize) -> Option<usize> {
    if pos == 0 || !is_continuation(buf[pos]) {
        return Some(pos);
    }
    (1..=3)
        .rev()
        .filter(|back| *back <= pos)
        .find(|back| sequence_len(buf[pos - back]).is_some_and(|len| len > *back))
        .map(|back| pos - back)
}

/// Extend a window end so it does not split a multibyte character.
///
/// May return a position past the end of `buf`.
fn align_end(buf: &[u8], end: usize) -> usize {
    if end == buf.len() {
        return end;
    }
    (1..=3)
        .rev()
        .filter(|back| *back <= end)
        .find_map(|back| {
            sequence_len(buf[end - back])
                .filter(|len| *len > back)
                .map(|len| end + len - back)
        })
        .unwrap_or(end)
}
