use std::collections::HashMap;

use crate::manifest::ManifestTable;
use crate::message::Message;
use crate::{Error, Result};

/// Per-ts holding area for stream chunks that arrived ahead of their
/// predecessors. Each queue stays sorted ascending by chunk index; fields of
/// the same ts share one queue.
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    queues: HashMap<String, Vec<Message>>,
}

// Released slots are overwritten with this before compaction; an empty ts
// never occurs in a real message.
fn sentinel() -> Message {
    Message::StreamData {
        ts: String::new(),
        field: String::new(),
        index: 0,
        bytes: Vec::new(),
        is_last: false,
    }
}

fn is_sentinel(msg: &Message) -> bool {
    msg.ts().is_empty()
}

// Duplicate: same ts, field and index, and the parked payload starts with the
// candidate payload. Prefix equality, not substring containment.
fn duplicate(parked: &Message, candidate: &Message) -> bool {
    parked.ts() == candidate.ts()
        && parked.field() == candidate.field()
        && parked.index() == candidate.index()
        && parked.bytes().starts_with(candidate.bytes())
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a chunk preserving ascending-by-index order for its ts.
    /// Duplicates are discarded. Most arrivals land near the ends of the
    /// queue, so the interior insert-then-sort is the cold path.
    pub fn park(&mut self, msg: Message) {
        let queue = self.queues.entry(msg.ts().to_string()).or_default();

        match queue.len() {
            0 => queue.push(msg),
            1 => {
                if duplicate(&queue[0], &msg) {
                    return;
                }
                if msg.index() >= queue[0].index() {
                    queue.push(msg);
                } else {
                    queue.insert(0, msg);
                }
            }
            _ => {
                if queue.iter().any(|parked| duplicate(parked, &msg)) {
                    return;
                }

                let first = queue[0].index();
                let last = queue[queue.len() - 1].index();

                if first + 1 == last {
                    // Dense queue: only the ends are open.
                    if msg.index() > last {
                        queue.push(msg);
                    } else if msg.index() < first {
                        queue.insert(0, msg);
                    }
                    return;
                }

                if msg.index() > last {
                    queue.push(msg);
                } else if msg.index() < first {
                    queue.insert(0, msg);
                } else if msg.index() + 1 == last {
                    let at = queue.len() - 1;
                    queue.insert(at, msg);
                } else if msg.index() == first + 1 {
                    queue.insert(1, msg);
                } else {
                    queue.push(msg);
                    queue.sort_by_key(|parked| parked.index());
                }
            }
        }
    }

    /// Releases, in queue order, every parked chunk whose field entry in
    /// `table` now expects exactly that index, and compacts the queue.
    /// A ts whose queue fully drains is removed. Draining a buffer with no
    /// parked chunks at all reports `EmptyBuffer`; callers use it only to
    /// short-circuit.
    pub fn drain(&mut self, ts: &str, table: &ManifestTable) -> Result<Vec<Message>> {
        if self.empty() {
            return Err(Error::EmptyBuffer);
        }

        let Some(queue) = self.queues.get_mut(ts) else {
            return Ok(Vec::new());
        };

        let mut released = Vec::new();
        for slot in queue.iter_mut() {
            if table.expected(ts, slot.field()) == Some(slot.index()) {
                released.push(std::mem::replace(slot, sentinel()));
            }
        }
        if released.is_empty() {
            return Ok(released);
        }

        if released.len() == queue.len() {
            self.queues.remove(ts);
            return Ok(released);
        }

        // Cluster the released slots at the front, then cut the prefix.
        queue.sort_by_key(|slot| !is_sentinel(slot));
        let keep_from = queue
            .iter()
            .position(|slot| !is_sentinel(slot))
            .unwrap_or(queue.len());
        queue.drain(..keep_from);

        Ok(released)
    }

    pub fn forget(&mut self, ts: &str) {
        self.queues.remove(ts);
    }

    pub fn contains_ts(&self, ts: &str) -> bool {
        self.queues.get(ts).is_some_and(|queue| !queue.is_empty())
    }

    pub fn empty(&self) -> bool {
        self.queues.values().all(|queue| queue.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(ts: &str, field: &str, index: u32, bytes: &[u8]) -> Message {
        Message::StreamData {
            ts: ts.to_string(),
            field: field.to_string(),
            index,
            bytes: bytes.to_vec(),
            is_last: false,
        }
    }

    fn indices(buffer: &ReorderBuffer, ts: &str) -> Vec<u32> {
        buffer.queues[ts].iter().map(|m| m.index()).collect()
    }

    #[test]
    fn park_into_empty_and_singleton_queues() {
        let mut buffer = ReorderBuffer::new();
        buffer.park(data("q", "f", 5, b"e"));
        assert_eq!(indices(&buffer, "q"), [5]);

        // singleton: larger-or-equal appends, smaller prepends
        buffer.park(data("q", "f", 7, b"g"));
        assert_eq!(indices(&buffer, "q"), [5, 7]);

        let mut buffer = ReorderBuffer::new();
        buffer.park(data("q", "f", 5, b"e"));
        buffer.park(data("q", "f", 3, b"c"));
        assert_eq!(indices(&buffer, "q"), [3, 5]);
    }

    #[test]
    fn park_near_the_ends() {
        let mut buffer = ReorderBuffer::new();
        buffer.park(data("q", "f", 3, b"c"));
        buffer.park(data("q", "f", 7, b"g"));

        // beyond the last element
        buffer.park(data("q", "f", 9, b"i"));
        assert_eq!(indices(&buffer, "q"), [3, 7, 9]);

        // below the first element
        buffer.park(data("q", "f", 1, b"a"));
        assert_eq!(indices(&buffer, "q"), [1, 3, 7, 9]);

        // one below the last element
        buffer.park(data("q", "f", 8, b"h"));
        assert_eq!(indices(&buffer, "q"), [1, 3, 7, 8, 9]);

        // one above the first element
        buffer.park(data("q", "f", 2, b"b"));
        assert_eq!(indices(&buffer, "q"), [1, 2, 3, 7, 8, 9]);
    }

    #[test]
    fn park_interior_falls_back_to_sort() {
        let mut buffer = ReorderBuffer::new();
        buffer.park(data("q", "f", 1, b"a"));
        buffer.park(data("q", "f", 8, b"h"));
        buffer.park(data("q", "f", 4, b"d"));
        assert_eq!(indices(&buffer, "q"), [1, 4, 8]);
    }

    #[test]
    fn park_into_dense_queue_only_extends_the_ends() {
        let mut buffer = ReorderBuffer::new();
        buffer.park(data("q", "f", 4, b"d"));
        buffer.park(data("q", "f", 5, b"e"));

        buffer.park(data("q", "f", 6, b"f"));
        assert_eq!(indices(&buffer, "q"), [4, 5, 6]);

        let mut buffer = ReorderBuffer::new();
        buffer.park(data("q", "f", 4, b"d"));
        buffer.park(data("q", "f", 5, b"e"));
        buffer.park(data("q", "f", 3, b"c"));
        assert_eq!(indices(&buffer, "q"), [3, 4, 5]);
    }

    #[test]
    fn exact_and_prefix_duplicates_are_dropped() {
        let mut buffer = ReorderBuffer::new();
        buffer.park(data("q", "f", 2, b"abcdef"));
        buffer.park(data("q", "f", 2, b"abcdef"));
        assert_eq!(indices(&buffer, "q"), [2]);

        // prefix of an already-parked payload counts as a duplicate
        buffer.park(data("q", "f", 2, b"abc"));
        assert_eq!(indices(&buffer, "q"), [2]);

        // same index but unrelated payload is kept
        buffer.park(data("q", "f", 2, b"zzz"));
        assert_eq!(indices(&buffer, "q"), [2, 2]);

        // same index on another field is not a duplicate
        buffer.park(data("q", "g", 2, b"abcdef"));
        assert_eq!(indices(&buffer, "q").len(), 3);
    }

    #[test]
    fn queues_are_kept_per_ts() {
        let mut buffer = ReorderBuffer::new();
        buffer.park(data("q1", "f", 1, b"a"));
        buffer.park(data("q2", "f", 2, b"b"));
        assert_eq!(indices(&buffer, "q1"), [1]);
        assert_eq!(indices(&buffer, "q2"), [2]);
    }

    #[test]
    fn drain_releases_matching_chunks_and_compacts() {
        let mut table = ManifestTable::new();
        table
            .upsert(&Message::StreamInfo {
                ts: "q".to_string(),
                field: "f".to_string(),
                filename: "first.txt".to_string(),
                is_first: true,
            })
            .unwrap();
        // chunk 0 was written, so the table expects chunk 1 next
        table.upsert(&data("q", "f", 0, b"w")).unwrap();

        let mut buffer = ReorderBuffer::new();
        buffer.park(data("q", "f", 1, b"a"));
        buffer.park(data("q", "f", 3, b"c"));

        let released = buffer.drain("q", &table).unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].index(), 1);
        assert_eq!(indices(&buffer, "q"), [3]);
    }

    #[test]
    fn drain_removes_ts_when_queue_fully_releases() {
        let mut table = ManifestTable::new();
        table
            .upsert(&Message::StreamInfo {
                ts: "q".to_string(),
                field: "f".to_string(),
                filename: "first.txt".to_string(),
                is_first: true,
            })
            .unwrap();
        table.upsert(&data("q", "f", 0, b"w")).unwrap();

        let mut buffer = ReorderBuffer::new();
        buffer.park(data("q", "f", 1, b"a"));

        let released = buffer.drain("q", &table).unwrap();
        assert_eq!(released.len(), 1);
        assert!(!buffer.contains_ts("q"));
        assert!(buffer.empty());
    }

    #[test]
    fn drain_on_empty_buffer_is_an_informational_error() {
        let mut buffer = ReorderBuffer::new();
        let table = ManifestTable::new();
        let err = buffer.drain("q", &table).unwrap_err();
        assert!(matches!(err, Error::EmptyBuffer));
        assert!(err.is_informational());
    }

    #[test]
    fn drain_of_foreign_ts_releases_nothing() {
        let table = ManifestTable::new();
        let mut buffer = ReorderBuffer::new();
        buffer.park(data("other", "f", 1, b"a"));

        let released = buffer.drain("q", &table).unwrap();
        assert!(released.is_empty());
        assert!(buffer.contains_ts("other"));
    }
}
