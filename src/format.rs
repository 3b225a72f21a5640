//! Named record shapes: the regexes that segment a file into records and
//! extract named fields from each record.

use regex::Regex;

use crate::error::{Error, Result};

pub const DEFAULT_MAXLENGTH: usize = 10_000;
pub const MIN_MAXLENGTH: usize = 32;

/// Which of `re_starts` / `re_ends` are configured for a format. Set once at
/// construction and then matched as three explicit branches in the parser's
/// segmenter rather than dispatched through a trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentMode {
    Both,
    StartsOnly,
    EndsOnly,
}

#[derive(Debug)]
pub struct Format {
    pub name: String,
    pub maxlength: usize,
    pub re_starts: Option<Regex>,
    pub re_ends: Option<Regex>,
    pub re_values: Regex,
    /// Capture group names from `re_values`, in the order they appear in
    /// the pattern (not alphabetical — `Regex::capture_names()` preserves
    /// declaration order for named groups).
    pub capture_names: Vec<String>,
    pub mode: SegmentMode,
}

impl Format {
    pub fn new(
        name: impl Into<String>,
        maxlength: Option<usize>,
        starts: Option<&str>,
        ends: Option<&str>,
        values: &str,
    ) -> Result<Self> {
        let name = name.into();
        let maxlength = maxlength.unwrap_or(DEFAULT_MAXLENGTH);
        if maxlength < MIN_MAXLENGTH {
            return Err(Error::Config(format!(
                "format '{name}': maxlength must be >= {MIN_MAXLENGTH}, got {maxlength}"
            )));
        }

        let re_starts = starts.map(Regex::new).transpose()?;
        // At least one of starts/ends must be present; if neither is
        // configured, ends defaults to a newline anchor.
        let re_ends = match ends {
            Some(pattern) => Some(Regex::new(pattern)?),
            None if re_starts.is_none() => Some(Regex::new("\n")?),
            None => None,
        };

        let re_values = Regex::new(values)?;
        let capture_names: Vec<String> = re_values
            .capture_names()
            .flatten()
            .map(str::to_string)
            .collect();
        if capture_names.is_empty() {
            return Err(Error::Config(format!(
                "format '{name}': values pattern must contain at least one named capture group"
            )));
        }

        let mode = match (&re_starts, &re_ends) {
            (Some(_), Some(_)) => SegmentMode::Both,
            (Some(_), None) => SegmentMode::StartsOnly,
            (None, Some(_)) => SegmentMode::EndsOnly,
            (None, None) => unreachable!("ends defaults to newline when starts is absent"),
        };

        Ok(Self {
            name,
            maxlength,
            re_starts,
            re_ends,
            re_values,
            capture_names,
            mode,
        })
    }

    pub fn has_capture(&self, name: &str) -> bool {
        self.capture_names.iter().any(|n| n == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_ends_to_newline_when_unset() {
        let fmt = Format::new("kv", None, None, None, r"^(?P<k>\w+)=(?P<v>.*)$").unwrap();
        assert_eq!(fmt.mode, SegmentMode::EndsOnly);
        assert!(fmt.re_ends.unwrap().is_match("\n"));
    }

    #[test]
    fn rejects_maxlength_below_minimum() {
        let err = Format::new("kv", Some(16), None, Some("\n"), r"^(?P<k>\w+)=(?P<v>.*)$")
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_values_without_named_captures() {
        let err = Format::new("kv", None, None, Some("\n"), r"^\w+=.*$").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn capture_names_preserve_declaration_order() {
        let fmt = Format::new(
            "kv",
            None,
            None,
            Some("\n"),
            r"^(?P<v>.*)=(?P<k>\w+)$",
        )
        .unwrap();
        assert_eq!(fmt.capture_names, vec!["v".to_string(), "k".to_string()]);
    }
}
