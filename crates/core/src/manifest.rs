use std::collections::{BTreeMap, HashMap};

use crate::message::Message;
use crate::{Error, Result};

/// One manifest row. `display` is what the saved manifest will report for the
/// field: the literal text value for text fields, the filename for file
/// fields. `expected` is the next chunk index that would extend the on-disk
/// file; it stays 0 for text fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub display: String,
    pub expected: u32,
}

/// In-memory mapping ts -> field -> entry. Pure data structure; callers
/// provide the locking.
#[derive(Debug, Default)]
pub struct ManifestTable {
    entries: HashMap<String, HashMap<String, ManifestEntry>>,
}

impl ManifestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or updates the entry for the message's (ts, field). A
    /// `StreamData` is only valid when its field entry exists and its index
    /// equals `expected`; the coordinator guarantees that by checking
    /// `matched` first, so a mismatch here is a coordinator bug.
    pub fn upsert(&mut self, msg: &Message) -> Result<()> {
        match msg {
            Message::Unary {
                ts,
                field,
                filename,
                bytes,
                ..
            } => {
                let display = match filename {
                    Some(name) => name.clone(),
                    None => String::from_utf8_lossy(bytes).into_owned(),
                };
                self.entries
                    .entry(ts.clone())
                    .or_default()
                    .insert(field.clone(), ManifestEntry { display, expected: 0 });
                Ok(())
            }
            Message::StreamInfo {
                ts,
                field,
                filename,
                ..
            } => {
                self.entries.entry(ts.clone()).or_default().insert(
                    field.clone(),
                    ManifestEntry {
                        display: filename.clone(),
                        expected: 0,
                    },
                );
                Ok(())
            }
            Message::StreamData {
                ts, field, index, ..
            } => {
                match self
                    .entries
                    .get_mut(ts.as_str())
                    .and_then(|fields| fields.get_mut(field.as_str()))
                {
                    Some(entry) if entry.expected == *index => {
                        entry.expected += 1;
                        Ok(())
                    }
                    Some(entry) => Err(Error::MismatchedIndex {
                        ts: ts.clone(),
                        field: field.clone(),
                        index: *index,
                        expected: entry.expected,
                    }),
                    None => Err(Error::MismatchedIndex {
                        ts: ts.clone(),
                        field: field.clone(),
                        index: *index,
                        expected: 0,
                    }),
                }
            }
        }
    }

    /// True when the message may be applied right away: unary and stream-info
    /// always, stream-data only when its field entry exists and the chunk
    /// index is the next expected one.
    pub fn matched(&self, msg: &Message) -> bool {
        match msg {
            Message::Unary { .. } | Message::StreamInfo { .. } => true,
            Message::StreamData {
                ts, field, index, ..
            } => self
                .entries
                .get(ts.as_str())
                .and_then(|fields| fields.get(field.as_str()))
                .is_some_and(|entry| entry.expected == *index),
        }
    }

    pub fn expected(&self, ts: &str, field: &str) -> Option<u32> {
        self.entries
            .get(ts)
            .and_then(|fields| fields.get(field))
            .map(|entry| entry.expected)
    }

    /// Simplified per-ts manifest (field -> display), keyed deterministically
    /// for reproducible JSON output. Absent ts yields an empty map.
    pub fn snapshot(&self, ts: &str) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        if let Some(fields) = self.entries.get(ts) {
            for (field, entry) in fields {
                out.insert(field.clone(), entry.display.clone());
            }
        }
        out
    }

    pub fn forget(&mut self, ts: &str) {
        self.entries.remove(ts);
    }

    pub fn contains_ts(&self, ts: &str) -> bool {
        self.entries.contains_key(ts)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unary_text(ts: &str, field: &str, value: &str) -> Message {
        Message::Unary {
            ts: ts.to_string(),
            field: field.to_string(),
            filename: None,
            bytes: value.as_bytes().to_vec(),
            is_first: false,
            is_last: false,
        }
    }

    fn info(ts: &str, field: &str, filename: &str) -> Message {
        Message::StreamInfo {
            ts: ts.to_string(),
            field: field.to_string(),
            filename: filename.to_string(),
            is_first: true,
        }
    }

    fn data(ts: &str, field: &str, index: u32) -> Message {
        Message::StreamData {
            ts: ts.to_string(),
            field: field.to_string(),
            index,
            bytes: b"x".to_vec(),
            is_last: false,
        }
    }

    #[test]
    fn unary_text_stores_value_as_display() {
        let mut table = ManifestTable::new();
        table.upsert(&unary_text("001", "alice", "azaza")).unwrap();

        assert_eq!(
            table.snapshot("001").get("alice"),
            Some(&"azaza".to_string())
        );
        assert_eq!(table.expected("001", "alice"), Some(0));
    }

    #[test]
    fn unary_file_stores_filename_as_display() {
        let mut table = ManifestTable::new();
        let msg = Message::Unary {
            ts: "004".to_string(),
            field: "bob".to_string(),
            filename: Some("second.txt".to_string()),
            bytes: b"bzbzb".to_vec(),
            is_first: false,
            is_last: false,
        };
        table.upsert(&msg).unwrap();

        assert_eq!(
            table.snapshot("004").get("bob"),
            Some(&"second.txt".to_string())
        );
    }

    #[test]
    fn stream_data_advances_expected_in_order() {
        let mut table = ManifestTable::new();
        table.upsert(&info("005", "alice", "first.txt")).unwrap();

        assert!(table.matched(&data("005", "alice", 0)));
        assert!(!table.matched(&data("005", "alice", 1)));

        table.upsert(&data("005", "alice", 0)).unwrap();
        assert_eq!(table.expected("005", "alice"), Some(1));

        table.upsert(&data("005", "alice", 1)).unwrap();
        assert_eq!(table.expected("005", "alice"), Some(2));
    }

    #[test]
    fn stream_data_upsert_out_of_order_is_an_error() {
        let mut table = ManifestTable::new();
        table.upsert(&info("005", "alice", "first.txt")).unwrap();

        let err = table.upsert(&data("005", "alice", 2)).unwrap_err();
        assert!(matches!(
            err,
            Error::MismatchedIndex {
                index: 2,
                expected: 0,
                ..
            }
        ));

        let err = table.upsert(&data("005", "missing", 0)).unwrap_err();
        assert!(matches!(err, Error::MismatchedIndex { .. }));
    }

    #[test]
    fn snapshot_is_sorted_and_drops_counters() {
        let mut table = ManifestTable::new();
        table.upsert(&unary_text("010", "david", "dzdzd")).unwrap();
        table.upsert(&unary_text("010", "claire", "czczc")).unwrap();
        table.upsert(&info("010", "alice", "first.txt")).unwrap();
        table.upsert(&data("010", "alice", 0)).unwrap();

        let snapshot = table.snapshot("010");
        let keys: Vec<&String> = snapshot.keys().collect();
        assert_eq!(keys, ["alice", "claire", "david"]);
        assert_eq!(snapshot.get("alice"), Some(&"first.txt".to_string()));
    }

    #[test]
    fn snapshot_of_unknown_ts_is_empty() {
        let table = ManifestTable::new();
        assert!(table.snapshot("nope").is_empty());
    }

    #[test]
    fn forget_removes_only_that_ts() {
        let mut table = ManifestTable::new();
        table.upsert(&unary_text("001", "alice", "azaza")).unwrap();
        table.upsert(&unary_text("002", "bob", "bzbzb")).unwrap();

        table.forget("001");
        assert!(!table.contains_ts("001"));
        assert!(table.contains_ts("002"));
        assert!(!table.is_empty());

        table.forget("002");
        assert!(table.is_empty());

        // forgetting an absent ts is a no-op
        table.forget("002");
        assert!(table.is_empty());
    }
}
