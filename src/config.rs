//! TOML configuration schema.
//!
//! `serde(deny_unknown_fields)` rejects any unrecognized key at parse
//! time rather than silently ignoring it.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::format::{Format, MIN_MAXLENGTH};
use crate::table::Table;

fn default_facility() -> String {
    "local7".to_string()
}
fn default_level() -> String {
    "info".to_string()
}
fn default_tag() -> String {
    "log2pg".to_string()
}
fn default_retry_interval() -> u64 {
    30_000
}
fn default_max_failed_reconnections() -> u32 {
    3
}
fn default_max_inserts() -> usize {
    1000
}
fn default_max_duration() -> u64 {
    10_000
}
fn default_idle_timeout() -> u64 {
    1000
}
fn default_maxlength() -> usize {
    crate::format::DEFAULT_MAXLENGTH
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SyslogConfig {
    #[serde(default = "default_facility")]
    pub facility: String,
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_tag")]
    pub tag: String,
}

impl Default for SyslogConfig {
    fn default() -> Self {
        Self {
            facility: default_facility(),
            level: default_level(),
            tag: default_tag(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransactionConfig {
    #[serde(default = "default_max_inserts", rename = "max-inserts")]
    pub max_inserts: usize,
    #[serde(default = "default_max_duration", rename = "max-duration")]
    pub max_duration_ms: u64,
    #[serde(default = "default_idle_timeout", rename = "idle-timeout")]
    pub idle_timeout_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_inserts: default_max_inserts(),
            max_duration_ms: default_max_duration(),
            idle_timeout_ms: default_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(rename = "connection-url")]
    pub connection_url: String,
    #[serde(default = "default_retry_interval", rename = "retry-interval")]
    pub retry_interval_ms: u64,
    #[serde(
        default = "default_max_failed_reconnections",
        rename = "max-failed-reconnections"
    )]
    pub max_failed_reconnections: u32,
    #[serde(default)]
    pub transaction: TransactionConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormatConfig {
    pub name: String,
    pub maxlength: Option<usize>,
    pub starts: Option<String>,
    pub ends: Option<String>,
    pub values: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    pub name: String,
    pub sql: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub path: String,
    pub format: String,
    pub table: String,
    pub discard: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RawConfig {
    pub syslog: SyslogConfig,
    pub database: Option<DatabaseConfig>,
    pub formats: Vec<FormatConfig>,
    pub tables: Vec<TableConfig>,
    pub files: Vec<FileConfig>,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            syslog: SyslogConfig::default(),
            database: None,
            formats: Vec::new(),
            tables: Vec::new(),
            files: Vec::new(),
        }
    }
}

/// Fully validated, ready-to-use configuration: formats and tables built
/// into [`Format`]/[`Table`] instances and file entries resolved against
/// them.
pub struct Config {
    pub syslog: SyslogConfig,
    pub database: DatabaseConfig,
    pub formats: Vec<std::sync::Arc<Format>>,
    pub tables: Vec<std::sync::Arc<Table>>,
    pub files: Vec<FileConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(text)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let database = raw
            .database
            .ok_or_else(|| Error::Config("missing required [database] section".to_string()))?;
        if database.connection_url.is_empty() {
            return Err(Error::Config(
                "database.connection-url is required".to_string(),
            ));
        }
        if database.transaction.idle_timeout_ms > database.transaction.max_duration_ms {
            return Err(Error::Config(
                "database.transaction.idle-timeout must be <= max-duration".to_string(),
            ));
        }

        let mut seen_format_names = HashSet::new();
        let mut formats = Vec::with_capacity(raw.formats.len());
        for f in &raw.formats {
            if !seen_format_names.insert(f.name.clone()) {
                return Err(Error::Config(format!("duplicate format name '{}'", f.name)));
            }
            let maxlength = f.maxlength.unwrap_or(crate::format::DEFAULT_MAXLENGTH);
            if maxlength < MIN_MAXLENGTH {
                return Err(Error::Config(format!(
                    "format '{}': maxlength must be >= {MIN_MAXLENGTH}",
                    f.name
                )));
            }
            formats.push(std::sync::Arc::new(Format::new(
                f.name.clone(),
                f.maxlength,
                f.starts.as_deref(),
                f.ends.as_deref(),
                &f.values,
            )?));
        }

        let mut seen_table_names = HashSet::new();
        let mut tables = Vec::with_capacity(raw.tables.len());
        for t in &raw.tables {
            if !seen_table_names.insert(t.name.clone()) {
                return Err(Error::Config(format!("duplicate table name '{}'", t.name)));
            }
            tables.push(std::sync::Arc::new(Table::new(
                t.name.clone(),
                t.sql.clone(),
            )?));
        }

        for file in &raw.files {
            let format = formats
                .iter()
                .find(|f| f.name == file.format)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "file '{}': format '{}' is not defined",
                        file.path, file.format
                    ))
                })?;
            let table = tables.iter().find(|t| t.name == file.table).ok_or_else(|| {
                Error::Config(format!(
                    "file '{}': table '{}' is not defined",
                    file.path, file.table
                ))
            })?;
            table.validate_against_format(format)?;
        }

        Ok(Self {
            syslog: raw.syslog,
            database,
            formats,
            tables,
            files: raw.files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[syslog]
tag = "log2pg-test"

[database]
connection-url = "postgres://localhost/test"

[database.transaction]
max-inserts = 3

[[formats]]
name = "kv"
ends = "\n"
values = "^(?P<k>\\w+)=(?P<v>.*)$"

[[tables]]
name = "t"
sql = "insert into t(k,v) values($k,$v)"

[[files]]
path = "/var/log/app/*.log"
format = "kv"
table = "t"
"#;

    #[test]
    fn parses_minimal_valid_config() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.database.connection_url, "postgres://localhost/test");
        assert_eq!(cfg.database.transaction.max_inserts, 3);
        assert_eq!(cfg.formats.len(), 1);
        assert_eq!(cfg.tables.len(), 1);
        assert_eq!(cfg.files.len(), 1);
    }

    #[test]
    fn rejects_idle_timeout_greater_than_max_duration() {
        let text = SAMPLE.replace(
            "max-inserts = 3",
            "max-inserts = 3\nidle-timeout = 999999",
        );
        let err = Config::parse(&text).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_unresolved_file_format_reference() {
        let text = SAMPLE.replace("format = \"kv\"", "format = \"missing\"");
        let err = Config::parse(&text).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_unknown_keys() {
        let text = SAMPLE.replace("[syslog]", "[syslog]\nbogus = true");
        assert!(Config::parse(&text).is_err());
    }

    #[test]
    fn missing_database_section_is_an_error() {
        let err = Config::parse("[syslog]\ntag = \"x\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
