//! Discard sink: unparseable or overflowed bytes are appended to a
//! per-file, lazily-opened side file instead of being silently dropped.

use std::fs::{File, OpenOptions};
use std::io::Write;

use time::OffsetDateTime;

use crate::error::Result;
use crate::watched::{substitute_discard_template, FileItem};

/// Why a chunk of bytes is being discarded rather than parsed into a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The read buffer filled to its usable capacity (`format.maxlength - 1`
    /// bytes) with no record boundary found; the buffer is reset and its
    /// contents discarded.
    BufferFull,
    /// `re_values` didn't match inside a chunk that `re_starts`/`re_ends`
    /// had already bounded as a record.
    NoMatchPattern,
    /// Bytes between a `re_starts` match and the `re_ends` match that
    /// closes it when the two don't land back to back; only produced in
    /// both-bounds mode, where `re_starts` and `re_ends` are both set.
    InterChunk,
}

impl DiscardReason {
    fn label(self) -> &'static str {
        match self {
            DiscardReason::BufferFull => "BUFFER_FULL",
            DiscardReason::NoMatchPattern => "NO_MATCH_PATTERN",
            DiscardReason::InterChunk => "INTER_CHUNK",
        }
    }
}

/// `YYYY-MM-DD HH:MM:SS`, formatted by hand rather than via a `time`
/// format-description macro (this crate doesn't enable the `macros`
/// feature).
fn format_timestamp(t: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        t.year(),
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

/// Appends `bytes` to `item`'s discard file, opening it on first use if the
/// watched-file descriptor configures a `discard_template`. A descriptor
/// with no template configured makes this a no-op.
pub fn discard(item: &FileItem, reason: DiscardReason, bytes: &[u8]) -> Result<()> {
    let Some(template) = item.config.discard_template.as_deref() else {
        return Ok(());
    };

    item.with_state(|state| -> Result<()> {
        if state.discard.is_none() {
            let path = substitute_discard_template(template, &item.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file: File = OpenOptions::new().create(true).append(true).open(path)?;
            state.discard = Some(file);
        }
        let file = state.discard.as_mut().expect("just opened above");

        let now = OffsetDateTime::now_utc();
        writeln!(
            file,
            "{} - file={}, cause={}",
            format_timestamp(now),
            item.path.display(),
            reason.label(),
        )?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(())
    })
}
