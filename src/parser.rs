//! Per-file read/segment state machine: turns FILE-UPDATE notifications
//! into [`RowTuple`]s on the parser→writer queue.
//!
//! Follows the "lock the shared state, read, release" shape used
//! elsewhere in this crate, with one independently-locked [`FileState`]
//! per watched file — exactly one thread ever touches a given file's
//! state at a time.

use std::io::Read;
use std::sync::Arc;

use regex::Regex;

use crate::discard::{discard, DiscardReason};
use crate::format::{Format, SegmentMode};
use crate::queue::MessageQueue;
use crate::row::RowTuple;
use crate::signals::block_termination_signals_in_current_thread;
use crate::watched::{FileItem, FileState};
use crate::watcher::FileTag;
use crate::Result;

pub struct Parser {
    incoming: Arc<MessageQueue<Arc<FileItem>, FileTag>>,
    outgoing: Arc<MessageQueue<Arc<RowTuple>, ()>>,
}

impl Parser {
    pub fn new(
        incoming: Arc<MessageQueue<Arc<FileItem>, FileTag>>,
        outgoing: Arc<MessageQueue<Arc<RowTuple>, ()>>,
    ) -> Self {
        Self { incoming, outgoing }
    }

    /// Runs until the watcher closes the incoming queue, then closes the
    /// outgoing queue in turn.
    pub fn run(&self) -> Result<()> {
        block_termination_signals_in_current_thread()?;
        while let Some((item, tag)) = self.incoming.pop() {
            if let Err(err) = self.process(&item) {
                log::info!(target: "log2pg::parser", "read error on {}: {err}", item.path.display());
            }
            if tag == FileTag::Close {
                // One final cycle already ran above; the item is now retired.
                log::debug!(target: "log2pg::parser", "closing {}", item.path.display());
            }
        }
        self.outgoing.close();
        Ok(())
    }

    /// Reads until EOF or buffer exhaustion, segmenting after each read.
    /// One byte of the buffer is always held back so a full read never
    /// leaves the buffer looking exactly as full as a `BUFFER_FULL`
    /// discard would; `maxlength` bounds usable capacity at
    /// `maxlength - 1` bytes, matching `segment`'s full check.
    fn process(&self, item: &Arc<FileItem>) -> Result<()> {
        loop {
            let n = item.with_state(|state| -> std::io::Result<usize> {
                let cap = state.buffer.len() - 1;
                if state.fill >= cap {
                    return Ok(0);
                }
                let free = &mut state.buffer[state.fill..cap];
                let n = state.stream.read(free)?;
                state.fill += n;
                Ok(n)
            })?;

            let overflowed = self.segment(item)?;

            // A read of 0 normally means EOF, but a full-buffer discard
            // just freed the whole buffer while bytes may still be
            // waiting in the file; keep reading in that case.
            if n == 0 && !overflowed {
                break;
            }
        }
        Ok(())
    }

    /// Applies the format's segmentation mode repeatedly until no further
    /// record boundary can be found in the current buffer. Each delimited
    /// record is matched against `re_values` and either emitted as a row
    /// or discarded; the unparsed tail is compacted to the front of the
    /// buffer. A `BUFFER_FULL` discard only happens once segmentation has
    /// already failed to find a record boundary in a full buffer — a read
    /// that fills the buffer with nothing but complete records must not
    /// discard them. Returns whether a buffer-full discard happened.
    fn segment(&self, item: &Arc<FileItem>) -> Result<bool> {
        let mut overflowed = false;
        let result: Result<bool> = loop {
            let format = &item.config.format;
            let record = item.with_state(|s| {
                find_record(format, &s.buffer[..s.fill], s.starts_search_from)
            });

            let Some(found) = record else {
                let full = item.with_state(|s| s.fill + 1 >= s.buffer.len());
                if full {
                    let bytes = item.with_state(|s| {
                        let bytes = s.buffer[..s.fill].to_vec();
                        s.fill = 0;
                        s.starts_search_from = 0;
                        bytes
                    });
                    discard(item, DiscardReason::BufferFull, &bytes)?;
                    overflowed = true;
                    continue;
                }
                break Ok(overflowed);
            };

            if let Some((start, end)) = found.inter_chunk {
                if end > start {
                    let bytes = item.with_state(|s| s.buffer[start..end].to_vec());
                    discard(item, DiscardReason::InterChunk, &bytes)?;
                }
            }

            let record_bytes =
                item.with_state(|s| s.buffer[found.value_start..found.value_end].to_vec());
            self.emit_or_discard(item, &record_bytes)?;

            item.with_state(|s| {
                let remaining = s.fill - found.consumed_to;
                s.buffer.copy_within(found.consumed_to..s.fill, 0);
                s.fill = remaining;
                s.starts_search_from = 0;
            });
        };
        result
    }

    fn emit_or_discard(&self, item: &Arc<FileItem>, record: &[u8]) -> Result<()> {
        let format = &item.config.format;
        let Some(captures) = format.re_values.captures(&String::from_utf8_lossy(record)) else {
            discard(item, DiscardReason::NoMatchPattern, record)?;
            return Ok(());
        };

        let mut values = vec![String::new(); format.capture_names.len()];
        for (i, name) in format.capture_names.iter().enumerate() {
            values[i] = captures.name(name).map(|m| m.as_str().to_string()).unwrap_or_default();
        }

        let ordered: Vec<String> = item
            .config
            .param_to_capture
            .iter()
            .map(|&idx| values[idx].clone())
            .collect();

        let row = Arc::new(RowTuple::new(item.clone(), &ordered));
        self.outgoing.push(row, ());
        Ok(())
    }
}

struct FoundRecord {
    /// Span fed to `re_values` — the record terminator is excluded, since
    /// the patterns every format is expected to write anchor their tail
    /// with `$`, which (unlike PCRE2) only matches true end-of-haystack in
    /// this crate's regex engine, never just before a trailing newline.
    value_start: usize,
    value_end: usize,
    /// Buffer offset the next search should resume from / compact to —
    /// past the terminator, unlike `value_end`.
    consumed_to: usize,
    /// Inter-chunk noise to discard, `[start, end)`, only set in `Both` mode.
    inter_chunk: Option<(usize, usize)>,
}

/// Implements the three segmentation modes as explicit branches over
/// [`SegmentMode`], set once at format construction.
fn find_record(format: &Format, buf: &[u8], starts_search_from: usize) -> Option<FoundRecord> {
    match format.mode {
        SegmentMode::Both => find_both(format.re_starts.as_ref().unwrap(), format.re_ends.as_ref().unwrap(), buf),
        SegmentMode::StartsOnly => find_starts_only(format.re_starts.as_ref().unwrap(), buf, starts_search_from),
        SegmentMode::EndsOnly => find_ends_only(format.re_ends.as_ref().unwrap(), buf),
    }
}

fn find_both(re_starts: &Regex, re_ends: &Regex, buf: &[u8]) -> Option<FoundRecord> {
    let text = std::str::from_utf8(buf).ok()?;
    let start_match = re_starts.find(text)?;
    let p1 = start_match.start();
    let end_match = re_ends.find(&text[p1..])?;
    let terminator_start = p1 + end_match.start();
    let p2 = p1 + end_match.end();
    Some(FoundRecord {
        value_start: p1,
        value_end: terminator_start,
        consumed_to: p2,
        inter_chunk: if p1 > 0 { Some((0, p1)) } else { None },
    })
}

/// Only `re_starts` configured: a record runs from one match's start to the
/// next match's start. `search_from` tracks where the next search resumes
/// so the match already consumed as this record's start isn't re-found.
/// There's no terminator to strip here — the next record's start bound is
/// itself content, not a delimiter.
fn find_starts_only(re_starts: &Regex, buf: &[u8], search_from: usize) -> Option<FoundRecord> {
    let text = std::str::from_utf8(buf).ok()?;
    let first = re_starts.find_at(text, search_from.min(text.len()))?;
    let next = re_starts.find_at(text, first.end().max(first.start() + 1))?;
    Some(FoundRecord {
        value_start: first.start(),
        value_end: next.start(),
        consumed_to: next.start(),
        inter_chunk: None,
    })
}

fn find_ends_only(re_ends: &Regex, buf: &[u8]) -> Option<FoundRecord> {
    let text = std::str::from_utf8(buf).ok()?;
    let m = re_ends.find(text)?;
    Some(FoundRecord {
        value_start: 0,
        value_end: m.start(),
        consumed_to: m.end(),
        inter_chunk: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use crate::table::Table;
    use crate::watched::{FileItem, WatchedFileConfig};
    use std::fs::File;
    use std::io::{Seek, SeekFrom, Write};

    fn make_item(dir: &std::path::Path, content: &[u8], fmt: Arc<Format>, table: Arc<Table>) -> Arc<FileItem> {
        let path = dir.join("app.log");
        std::fs::write(&path, content).unwrap();
        let stream = File::open(&path).unwrap();
        let config = Arc::new(WatchedFileConfig::new("*.log", fmt, table, None).unwrap());
        Arc::new(FileItem::new(1, path, config, stream))
    }

    fn run_parser_once(item: &Arc<FileItem>) -> Vec<Vec<String>> {
        let incoming = Arc::new(MessageQueue::<Arc<FileItem>, FileTag>::new(0));
        let outgoing = Arc::new(MessageQueue::<Arc<RowTuple>, ()>::new(0));
        let parser = Parser::new(incoming, outgoing.clone());
        parser.process(item).unwrap();
        parser.segment(item).unwrap();
        outgoing.close();
        let mut rows = Vec::new();
        while let Some((row, _)) = outgoing.pop() {
            rows.push(row.fields().into_iter().map(str::to_string).collect());
        }
        rows
    }

    fn kv_format() -> Arc<Format> {
        Arc::new(Format::new("kv", None, None, Some("\n"), r"^(?P<k>\w+)=(?P<v>.*)$").unwrap())
    }

    fn kv_table() -> Arc<Table> {
        Arc::new(Table::new("t", "insert into t(k,v) values($k,$v)").unwrap())
    }

    #[test]
    fn single_line_emits_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let item = make_item(dir.path(), b"alpha=1\n", kv_format(), kv_table());
        let rows = run_parser_once(&item);
        assert_eq!(rows, vec![vec!["alpha".to_string(), "1".to_string()]]);
    }

    #[test]
    fn two_lines_in_one_update_emit_two_rows_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let item = make_item(dir.path(), b"a=1\nb=2\n", kv_format(), kv_table());
        let rows = run_parser_once(&item);
        assert_eq!(
            rows,
            vec![
                vec!["a".to_string(), "1".to_string()],
                vec!["b".to_string(), "2".to_string()],
            ]
        );
    }

    #[test]
    fn malformed_middle_line_is_discarded_with_no_match_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let template = format!("{}/$FILENAME.discard", dir.path().display());
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"a=1\nnope\nb=2\n").unwrap();
        let stream = File::open(&path).unwrap();
        let config = Arc::new(
            WatchedFileConfig::new("*.log", kv_format(), kv_table(), Some(template)).unwrap(),
        );
        let item = Arc::new(FileItem::new(1, path, config, stream));
        let rows = run_parser_once(&item);
        assert_eq!(
            rows,
            vec![
                vec!["a".to_string(), "1".to_string()],
                vec!["b".to_string(), "2".to_string()],
            ]
        );
        let discard_contents =
            std::fs::read_to_string(dir.path().join("app.log.discard")).unwrap();
        assert!(discard_contents.contains("NO_MATCH_PATTERN"));
        assert!(discard_contents.contains("nope"));
    }

    #[test]
    fn buffer_overflow_discards_and_resets() {
        let fmt = Arc::new(Format::new("kv", Some(64), None, Some("\n"), r"^(?P<k>\w+)=(?P<v>.*)$").unwrap());
        let dir = tempfile::tempdir().unwrap();
        let template = format!("{}/$FILENAME.discard", dir.path().display());
        let path = dir.path().join("app.log");
        let long_line = format!("{}\n", "x".repeat(69));
        std::fs::write(&path, long_line.as_bytes()).unwrap();
        let stream = File::open(&path).unwrap();
        let config = Arc::new(
            WatchedFileConfig::new("*.log", fmt, kv_table(), Some(template)).unwrap(),
        );
        let item = Arc::new(FileItem::new(1, path, config, stream));
        let rows = run_parser_once(&item);
        assert!(rows.is_empty());
        let discard_contents =
            std::fs::read_to_string(dir.path().join("app.log.discard")).unwrap();
        assert!(discard_contents.contains("BUFFER_FULL"));
    }

    #[test]
    fn tail_without_terminator_stays_buffered_for_next_update() {
        let dir = tempfile::tempdir().unwrap();
        let item = make_item(dir.path(), b"a=1\nb=2", kv_format(), kv_table());
        let rows = run_parser_once(&item);
        assert_eq!(rows, vec![vec!["a".to_string(), "1".to_string()]]);
        item.with_state(|s| assert_eq!(&s.buffer[..s.fill], b"b=2"));

        // A later update appends the missing newline; the buffered tail
        // combines with the new bytes into one record.
        item.with_state(|s| {
            s.stream.seek(SeekFrom::End(0)).unwrap();
        });
        let path = dir.path().join("app.log");
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"\n").unwrap();
        let incoming = Arc::new(MessageQueue::<Arc<FileItem>, FileTag>::new(0));
        let outgoing = Arc::new(MessageQueue::<Arc<RowTuple>, ()>::new(0));
        let parser = Parser::new(incoming, outgoing.clone());
        parser.process(&item).unwrap();
        outgoing.close();
        let mut rows2 = Vec::new();
        while let Some((row, _)) = outgoing.pop() {
            rows2.push(row.fields().into_iter().map(str::to_string).collect::<Vec<_>>());
        }
        assert_eq!(rows2, vec![vec!["b".to_string(), "2".to_string()]]);
    }
}
