//! Configuration-time watched-file/watched-directory descriptors and the
//! runtime watched-item state they produce.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use glob::Pattern;

use crate::config::Config;
use crate::error::Result;
use crate::format::Format;
use crate::table::Table;

/// Groups the flat `[[files]]` list from configuration into per-directory
/// watch descriptors: every `path` glob is split into a directory and a
/// file-name pattern, and patterns sharing a directory are collected under
/// one [`WatchedDirConfig`].
pub fn build_watch_plan(config: &Config) -> Result<Vec<Arc<WatchedDirConfig>>> {
    let mut by_dir: HashMap<PathBuf, WatchedDirConfig> = HashMap::new();

    for file in &config.files {
        let format = config
            .formats
            .iter()
            .find(|f| f.name == file.format)
            .expect("Config::load already validated this reference")
            .clone();
        let table = config
            .tables
            .iter()
            .find(|t| t.name == file.table)
            .expect("Config::load already validated this reference")
            .clone();

        let path = Path::new(&file.path);
        let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        let pattern = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.path.clone());

        let file_config = Arc::new(WatchedFileConfig::new(
            pattern,
            format,
            table,
            file.discard.clone(),
        )?);

        by_dir
            .entry(dir.clone())
            .or_insert_with(|| WatchedDirConfig::new(dir))
            .push(file_config);
    }

    Ok(by_dir.into_values().map(Arc::new).collect())
}

/// Substitution variables accepted by a `discard` path template.
pub fn substitute_discard_template(template: &str, path: &Path) -> PathBuf {
    let realpath = std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned();
    let dirname = path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let basename = path
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let out = template
        .replace("$REALPATH", &realpath)
        .replace("$DIRNAME", &dirname)
        .replace("$FILENAME", &filename)
        .replace("$BASENAME", &basename)
        .replace("$EXTENSION", &extension);
    PathBuf::from(out)
}

/// Configuration-time binding of a glob file-name pattern to a format,
/// table, and optional discard template.
pub struct WatchedFileConfig {
    pub pattern: Pattern,
    pub pattern_src: String,
    pub format: std::sync::Arc<Format>,
    pub table: std::sync::Arc<Table>,
    pub discard_template: Option<String>,
    /// table-parameter index -> values-regex capture-group index; rows are
    /// emitted in table-parameter order.
    pub param_to_capture: Vec<usize>,
}

impl WatchedFileConfig {
    pub fn new(
        pattern_src: impl Into<String>,
        format: std::sync::Arc<Format>,
        table: std::sync::Arc<Table>,
        discard_template: Option<String>,
    ) -> Result<Self> {
        let pattern_src = pattern_src.into();
        table.validate_against_format(&format)?;
        let param_to_capture = table.param_to_capture_index(&format);
        let pattern = Pattern::new(&pattern_src)?;
        Ok(Self {
            pattern,
            pattern_src,
            format,
            table,
            discard_template,
            param_to_capture,
        })
    }

    pub fn matches_name(&self, filename: &str) -> bool {
        self.pattern.matches(filename)
    }
}

/// A directory plus the ordered, first-match-wins set of watched-file
/// patterns applicable inside it.
pub struct WatchedDirConfig {
    pub path: PathBuf,
    pub files: Vec<std::sync::Arc<WatchedFileConfig>>,
}

impl WatchedDirConfig {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            files: Vec::new(),
        }
    }

    /// First occurrence wins: a pattern already registered for this
    /// directory is not added again.
    pub fn push(&mut self, file: std::sync::Arc<WatchedFileConfig>) {
        if !self.files.iter().any(|f| f.pattern_src == file.pattern_src) {
            self.files.push(file);
        }
    }

    pub fn matching(&self, filename: &str) -> Option<&std::sync::Arc<WatchedFileConfig>> {
        self.files.iter().find(|f| f.matches_name(filename))
    }
}

/// Mutable runtime state exclusively touched by the parser thread after the
/// watcher hands a [`FileItem`] off via a FILE-UPDATE message. Guarded by a
/// `Mutex` for `Send + Sync`, not for contention — exactly one thread ever
/// locks it at a time.
pub struct FileState {
    pub stream: File,
    /// Fixed-size read buffer, `format.maxlength` bytes, with `fill` bytes
    /// of unparsed content at the front.
    pub buffer: Vec<u8>,
    pub fill: usize,
    pub discard: Option<File>,
    /// Only-starts mode: byte offset to resume the next `re_starts` search
    /// from, so a match already consumed as a record boundary isn't
    /// re-found.
    pub starts_search_from: usize,
}

/// Runtime watched-item state for a regular file. The kernel watch
/// descriptor (`wd`) is this item's identity within the watcher's indexes.
pub struct FileItem {
    pub wd: i32,
    pub path: PathBuf,
    pub config: std::sync::Arc<WatchedFileConfig>,
    state: Mutex<FileState>,
}

impl FileItem {
    pub fn new(wd: i32, path: PathBuf, config: std::sync::Arc<WatchedFileConfig>, stream: File) -> Self {
        let buffer = vec![0u8; config.format.maxlength];
        Self {
            wd,
            path,
            config,
            state: Mutex::new(FileState {
                stream,
                buffer,
                fill: 0,
                discard: None,
                starts_search_from: 0,
            }),
        }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut FileState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|poison| poison.into_inner());
        f(&mut guard)
    }
}

/// Runtime watched-item state for a directory.
pub struct DirectoryItem {
    pub wd: i32,
    pub path: PathBuf,
    pub config: std::sync::Arc<WatchedDirConfig>,
}

/// The watcher's indexes hold either variant under one kernel watch
/// descriptor namespace.
pub enum WatchedItem {
    Directory(DirectoryItem),
    File(std::sync::Arc<FileItem>),
}

impl WatchedItem {
    pub fn wd(&self) -> i32 {
        match self {
            WatchedItem::Directory(d) => d.wd,
            WatchedItem::File(f) => f.wd,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            WatchedItem::Directory(d) => &d.path,
            WatchedItem::File(f) => &f.path,
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Arc;

    pub fn make_file_item_for_tests(format: Arc<Format>, table: Arc<Table>) -> FileItem {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("test.log");
        std::fs::write(&path, b"").unwrap();
        let stream = File::open(&path).unwrap();
        let config = Arc::new(
            WatchedFileConfig::new("*.log", format, table, None).expect("valid test config"),
        );
        // Leak the tempdir so the backing file outlives this function; the
        // test process is short-lived so this is not a practical leak.
        std::mem::forget(dir);
        FileItem::new(1, path, config, stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use crate::table::Table;
    use std::sync::Arc;

    #[test]
    fn directory_config_keeps_first_occurrence() {
        let fmt = Arc::new(Format::new("kv", None, None, Some("\n"), r"^(?P<k>\w+)=(?P<v>.*)$").unwrap());
        let table = Arc::new(Table::new("t", "insert into t(k,v) values($k,$v)").unwrap());
        let mut dir = WatchedDirConfig::new(PathBuf::from("/var/log/app"));
        let a = Arc::new(WatchedFileConfig::new("*.log", fmt.clone(), table.clone(), None).unwrap());
        let b = Arc::new(WatchedFileConfig::new("*.log", fmt, table, None).unwrap());
        dir.push(a);
        dir.push(b);
        assert_eq!(dir.files.len(), 1);
    }

    #[test]
    fn substitutes_discard_template_variables() {
        let path = PathBuf::from("/var/log/app/access.log");
        let out = substitute_discard_template("$DIRNAME/$BASENAME.$EXTENSION.discard", &path);
        assert_eq!(out, PathBuf::from("/var/log/app/access.log.discard"));
    }

    #[test]
    fn build_watch_plan_groups_files_sharing_a_directory() {
        let text = r#"
[database]
connection-url = "postgres://localhost/test"

[[formats]]
name = "kv"
ends = "\n"
values = "^(?P<k>\\w+)=(?P<v>.*)$"

[[tables]]
name = "t"
sql = "insert into t(k,v) values($k,$v)"

[[files]]
path = "/var/log/app/access.log"
format = "kv"
table = "t"

[[files]]
path = "/var/log/app/error.log"
format = "kv"
table = "t"

[[files]]
path = "/var/log/other/*.log"
format = "kv"
table = "t"
"#;
        let config = crate::config::Config::parse(text).unwrap();
        let plan = build_watch_plan(&config).unwrap();
        assert_eq!(plan.len(), 2);
        let app_dir = plan
            .iter()
            .find(|d| d.path == PathBuf::from("/var/log/app"))
            .unwrap();
        assert_eq!(app_dir.files.len(), 2);
    }
}
