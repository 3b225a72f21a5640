//! Row tuples: the parser's output, forwarded to the writer.

use std::sync::Arc;

use crate::watched::FileItem;

/// A single extracted record: a reference to the file it came from plus its
/// captured field values, in **table-parameter order**.
///
/// Values are stored as one contiguous, NUL-separated byte run rather than
/// as a `Vec<String>` so that turning a row into database parameters is a
/// single pass of NUL-splitting with zero further copies.
pub struct RowTuple {
    pub item: Arc<FileItem>,
    blob: Box<[u8]>,
    field_count: usize,
}

impl RowTuple {
    pub fn new(item: Arc<FileItem>, values: &[String]) -> Self {
        let mut blob = Vec::with_capacity(values.iter().map(|v| v.len() + 1).sum());
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                blob.push(0);
            }
            blob.extend_from_slice(value.as_bytes());
        }
        Self {
            item,
            blob: blob.into_boxed_slice(),
            field_count: values.len(),
        }
    }

    /// Splits the contiguous blob back into its field values, in the order
    /// they were written (table-parameter order).
    pub fn fields(&self) -> Vec<&str> {
        if self.field_count == 0 {
            return Vec::new();
        }
        self.blob
            .split(|&b| b == 0)
            .map(|bytes| std::str::from_utf8(bytes).expect("values were captured from UTF-8 input"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use crate::table::Table;
    use crate::watched::{test_support::make_file_item_for_tests};

    #[test]
    fn round_trips_field_values() {
        let fmt = Arc::new(Format::new("kv", None, None, Some("\n"), r"^(?P<k>\w+)=(?P<v>.*)$").unwrap());
        let table = Arc::new(Table::new("t", "insert into t(k,v) values($k,$v)").unwrap());
        let item = Arc::new(make_file_item_for_tests(fmt, table));
        let row = RowTuple::new(item, &["alpha".to_string(), "1".to_string()]);
        assert_eq!(row.fields(), vec!["alpha", "1"]);
    }

    #[test]
    fn handles_empty_values() {
        let fmt = Arc::new(Format::new("kv", None, None, Some("\n"), r"^(?P<k>\w*)=(?P<v>.*)$").unwrap());
        let table = Arc::new(Table::new("t", "insert into t(k,v) values($k,$v)").unwrap());
        let item = Arc::new(make_file_item_for_tests(fmt, table));
        let row = RowTuple::new(item, &[String::new(), "1".to_string()]);
        assert_eq!(row.fields(), vec!["", "1"]);
    }
}
