//! Chunk naming and the listing filter used to resume from a chunk name.
//!
//! Chunks are stored as `<schema.table>/part_<8-digit ordinal>.<ext>`. A
//! resumed run hands in one of those names and gets back every chunk at or
//! after it, together with the row count recorded in the object metadata.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::{Error, Result, TableName};

const CHUNK_PREFIX: &str = "part_";
const ORDINAL_WIDTH: usize = 8;

pub fn chunk_file_name(ordinal: usize, file_ext: &str) -> String {
    format!("{}{:0width$}.{}", CHUNK_PREFIX, ordinal, file_ext, width = ORDINAL_WIDTH)
}

pub fn chunk_key(table: &TableName, ordinal: usize, file_ext: &str) -> String {
    format!("{}{}", table_prefix(table), chunk_file_name(ordinal, file_ext))
}

pub fn table_prefix(table: &TableName) -> String {
    format!("{}/", table)
}

/// Split a chunk name (or key) into its ordinal and extension.
pub fn parse_chunk_name(name: &str) -> Result<(usize, &str)> {
    let base = name.rsplit('/').next().unwrap_or(name);
    let invalid = || Error::Metadata(format!("'{}' is not a chunk name", name));

    let rest = base.strip_prefix(CHUNK_PREFIX).ok_or_else(invalid)?;
    if rest.len() <= ORDINAL_WIDTH || !rest.is_char_boundary(ORDINAL_WIDTH) {
        return Err(invalid());
    }
    let (digits, ext) = rest.split_at(ORDINAL_WIDTH);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let ext = ext.strip_prefix('.').filter(|e| !e.is_empty()).ok_or_else(invalid)?;
    let ordinal = digits.parse().map_err(|_| invalid())?;
    Ok((ordinal, ext))
}

/// Name and user metadata of a listed object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectAttrs {
    pub name: String,
    pub metadata: HashMap<String, String>,
}

impl ObjectAttrs {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A chunk selected for resumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedChunk {
    pub key: String,
    pub ordinal: usize,
    pub rows: Option<usize>,
}

/// Keep the chunks at or after `continuation_key`, ordered by ordinal.
///
/// Objects that are not chunks, or that carry a different extension than the
/// continuation key, are skipped. A missing or unreadable row count is logged
/// and reported as unknown.
pub fn filter_from_continuation_point(
    objects: impl IntoIterator<Item = ObjectAttrs>,
    continuation_key: &str,
    rows_key: &str,
) -> Result<Vec<ListedChunk>> {
    let (start, start_ext) = parse_chunk_name(continuation_key)?;

    let mut chunks = Vec::new();
    for object in objects {
        let (ordinal, ext) = match parse_chunk_name(&object.name) {
            Ok(parsed) => parsed,
            Err(_) => {
                debug!(key = %object.name, "skipping non-chunk object");
                continue;
            }
        };
        if ordinal < start || ext != start_ext {
            continue;
        }

        let rows = match object.metadata.get(rows_key) {
            Some(value) => match value.parse::<usize>() {
                Ok(rows) => Some(rows),
                Err(_) => {
                    warn!(key = %object.name, value = %value, "failed to parse row count metadata");
                    None
                }
            },
            None => {
                warn!(key = %object.name, "failed to find metadata for key {}", rows_key);
                None
            }
        };

        chunks.push(ListedChunk {
            key: object.name,
            ordinal,
            rows,
        });
    }

    chunks.sort_by_key(|c| c.ordinal);
    if let Some(pair) = chunks.windows(2).find(|w| w[0].ordinal == w[1].ordinal) {
        return Err(Error::Metadata(format!(
            "duplicate chunk ordinal {} ({} and {})",
            pair[0].ordinal, pair[0].key, pair[1].key
        )));
    }
    if let Some(pair) = chunks.windows(2).find(|w| w[1].ordinal != w[0].ordinal + 1) {
        warn!(after = %pair[0].key, before = %pair[1].key, "gap in chunk ordinals");
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LogBuffer;

    fn objects(metadata: bool) -> Vec<ObjectAttrs> {
        (4..=8)
            .map(|i| {
                let attrs = ObjectAttrs::new(format!("public.inventory/part_{:08}.tar.gz", i));
                if metadata {
                    attrs.with_metadata("numrows", "10")
                } else {
                    attrs
                }
            })
            .collect()
    }

    #[test]
    fn test_chunk_naming() {
        assert_eq!(chunk_file_name(4, "tar.gz"), "part_00000004.tar.gz");
        assert_eq!(
            chunk_key(&TableName::new("public", "inventory"), 12, "csv"),
            "public.inventory/part_00000012.csv"
        );
    }

    #[test]
    fn test_parse_chunk_name() {
        assert_eq!(parse_chunk_name("part_00000004.tar.gz").unwrap(), (4, "tar.gz"));
        assert_eq!(parse_chunk_name("a/b/part_00000123.csv").unwrap(), (123, "csv"));
        assert!(parse_chunk_name("part_0004.csv").is_err());
        assert!(parse_chunk_name("part_0000000x.csv").is_err());
        assert!(parse_chunk_name("part_00000004").is_err());
        assert!(parse_chunk_name("other_00000004.csv").is_err());
    }

    #[test]
    fn test_filter_with_row_counts() {
        let chunks =
            filter_from_continuation_point(objects(true), "part_00000004.tar.gz", "numrows")
                .unwrap();

        assert_eq!(chunks.len(), 5);
        assert_eq!(
            chunks.iter().map(|c| c.ordinal).collect::<Vec<_>>(),
            vec![4, 5, 6, 7, 8]
        );
        assert!(chunks.iter().all(|c| c.rows == Some(10)));
    }

    #[test]
    fn test_filter_skips_earlier_and_foreign_objects() {
        let mut listed = objects(true);
        listed.reverse();
        listed.push(ObjectAttrs::new("public.inventory/part_00000003.tar.gz"));
        listed.push(ObjectAttrs::new("public.inventory/part_00000009.csv"));
        listed.push(ObjectAttrs::new("public.inventory/README"));

        let chunks =
            filter_from_continuation_point(listed, "part_00000006.tar.gz", "numrows").unwrap();
        assert_eq!(
            chunks.iter().map(|c| c.ordinal).collect::<Vec<_>>(),
            vec![6, 7, 8]
        );
    }

    #[test]
    fn test_filter_missing_metadata_is_logged_once_per_object() {
        let logs = LogBuffer::default();
        let chunks = tracing::subscriber::with_default(logs.subscriber(), || {
            filter_from_continuation_point(objects(false), "part_00000004.tar.gz", "numrows")
        })
        .unwrap();

        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.rows.is_none()));
        assert_eq!(logs.contents().matches("failed to find metadata").count(), 5);
    }

    #[test]
    fn test_filter_rejects_duplicates() {
        let mut listed = objects(true);
        listed.push(ObjectAttrs::new("other/part_00000005.tar.gz"));

        assert!(
            filter_from_continuation_point(listed, "part_00000004.tar.gz", "numrows").is_err()
        );
    }

    #[test]
    fn test_filter_rejects_bad_continuation_key() {
        assert!(filter_from_continuation_point(objects(true), "latest", "numrows").is_err());
    }
}
