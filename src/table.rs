//! Named SQL insert targets: `$name`-parameterised templates translated to
//! positional `$1..$N` placeholders.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::format::Format;

pub const MAX_PARAMS: usize = 99;

#[derive(Debug)]
pub struct Table {
    pub name: String,
    /// The original `$name`-parameterised SQL, kept for diagnostics.
    pub sql_template: String,
    /// Distinct parameter names in first-occurrence order.
    pub param_names: Vec<String>,
    /// `sql_template` with every `$name` token replaced by its positional
    /// `$1..$N` placeholder, ready for `Client::prepare`.
    pub positional_sql: String,
}

impl Table {
    pub fn new(name: impl Into<String>, sql_template: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let sql_template = sql_template.into();

        let param_names = extract_param_names(&sql_template);
        if param_names.is_empty() {
            return Err(Error::Config(format!(
                "table '{name}': sql has no $param placeholders"
            )));
        }
        if param_names.len() > MAX_PARAMS {
            return Err(Error::Config(format!(
                "table '{name}': {} distinct parameters exceeds the {MAX_PARAMS} limit",
                param_names.len()
            )));
        }

        let positional_sql = positionalize(&sql_template, &param_names);

        Ok(Self {
            name,
            sql_template,
            param_names,
            positional_sql,
        })
    }

    /// Every table parameter name must appear in its associated format's
    /// capture group list.
    pub fn validate_against_format(&self, format: &Format) -> Result<()> {
        for param in &self.param_names {
            if !format.has_capture(param) {
                return Err(Error::Config(format!(
                    "table '{}': parameter '${}' is not a capture group of format '{}'",
                    self.name, param, format.name
                )));
            }
        }
        Ok(())
    }

    /// Table-parameter index -> values-regex capture-group index, used by
    /// the parser to reorder captured values into table-parameter order.
    pub fn param_to_capture_index(&self, format: &Format) -> Vec<usize> {
        self.param_names
            .iter()
            .map(|param| {
                format
                    .capture_names
                    .iter()
                    .position(|name| name == param)
                    .expect("validate_against_format already checked this")
            })
            .collect()
    }
}

/// Scans `sql` for `$identifier` tokens and returns the distinct names in
/// first-occurrence order.
fn extract_param_names(sql: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
                end += 1;
            }
            if end > start {
                let name = sql[start..end].to_string();
                if seen.insert(name.clone()) {
                    ordered.push(name);
                }
                i = end;
                continue;
            }
        }
        i += 1;
    }
    ordered
}

/// Replaces every `$name` occurrence with its positional `$<index+1>`.
fn positionalize(sql: &str, param_names: &[String]) -> String {
    let mut out = String::with_capacity(sql.len());
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
                end += 1;
            }
            if end > start {
                let name = &sql[start..end];
                let index = param_names.iter().position(|n| n == name).expect(
                    "name was discovered by the same scan that built param_names",
                );
                out.push('$');
                out.push_str(&(index + 1).to_string());
                i = end;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_named_params_to_positional() {
        let table = Table::new("t", "insert into t(k,v) values($k,$v)").unwrap();
        assert_eq!(table.param_names, vec!["k".to_string(), "v".to_string()]);
        assert_eq!(table.positional_sql, "insert into t(k,v) values($1,$2)");
    }

    #[test]
    fn repeated_param_reuses_same_position() {
        let table = Table::new("t", "insert into t(k) values($k) on conflict (k) do update set k = $k")
            .unwrap();
        assert_eq!(table.param_names, vec!["k".to_string()]);
        assert_eq!(
            table.positional_sql,
            "insert into t(k) values($1) on conflict (k) do update set k = $1"
        );
    }

    #[test]
    fn rejects_too_many_params() {
        let names: Vec<String> = (0..100).map(|i| format!("p{i}")).collect();
        let sql = format!(
            "insert into t values({})",
            names
                .iter()
                .map(|n| format!("${n}"))
                .collect::<Vec<_>>()
                .join(",")
        );
        let err = Table::new("t", sql).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn validates_params_are_known_captures() {
        let fmt = Format::new("kv", None, None, Some("\n"), r"^(?P<k>\w+)=(?P<v>.*)$").unwrap();
        let table = Table::new("t", "insert into t(k,x) values($k,$x)").unwrap();
        assert!(table.validate_against_format(&fmt).is_err());
    }
}
