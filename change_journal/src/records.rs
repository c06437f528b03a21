use crate::record::{JournalRecord, RecordKey};
use log::error;
use sled::IVec;
use std::ops::Range;
use std::sync::Arc;

type Entry = (RecordKey, IVec);

/// Point-in-time view of journal records.
///
/// Holds the still-encoded values taken while the journal lock was held, so iterating is
/// unaffected by later appends or pruning. Records are decoded as they are iterated and
/// every call to [`Records::iter`] starts over.
#[derive(Clone, Debug)]
pub struct Records {
    entries: Arc<Vec<Entry>>,
    /// Window into `entries`, which are always in ascending key order.
    range: Range<usize>,
    descending: bool,
}

impl Records {
    pub(crate) fn new(entries: Vec<Entry>, descending: bool) -> Self {
        let len = entries.len();
        Records {
            entries: Arc::new(entries),
            range: 0..len,
            descending,
        }
    }

    pub fn empty() -> Self {
        Records::new(Vec::new(), false)
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn is_descending(&self) -> bool {
        self.descending
    }

    /// Same records, iterated in the requested order.
    pub fn ordered(mut self, descending: bool) -> Self {
        self.descending = descending;
        self
    }

    /// Records with a key strictly greater than `key`.
    pub fn after(&self, key: RecordKey) -> Records {
        let window = self.window();
        let start = self.range.start + window.partition_point(|(k, _)| *k <= key);
        Records {
            entries: self.entries.clone(),
            range: start..self.range.end,
            descending: self.descending,
        }
    }

    /// Records with a key greater than or equal to `key`.
    pub fn from_key(&self, key: RecordKey) -> Records {
        let window = self.window();
        let start = self.range.start + window.partition_point(|(k, _)| *k < key);
        Records {
            entries: self.entries.clone(),
            range: start..self.range.end,
            descending: self.descending,
        }
    }

    pub fn keys(&self) -> Vec<RecordKey> {
        let keys = self.window().iter().map(|(k, _)| *k);
        if self.descending {
            keys.rev().collect()
        } else {
            keys.collect()
        }
    }

    pub fn iter(&self) -> RecordsIter {
        RecordsIter {
            records: self.clone(),
            front: self.range.start,
            back: self.range.end,
        }
    }

    pub fn to_vec(&self) -> Vec<JournalRecord> {
        self.iter().collect()
    }

    fn window(&self) -> &[Entry] {
        &self.entries[self.range.clone()]
    }

    pub(crate) fn raw(&self) -> impl DoubleEndedIterator<Item = &Entry> {
        self.window().iter()
    }
}

impl Default for Records {
    fn default() -> Self {
        Records::empty()
    }
}

impl IntoIterator for Records {
    type Item = JournalRecord;
    type IntoIter = RecordsIter;

    fn into_iter(self) -> Self::IntoIter {
        let range = self.range.clone();
        RecordsIter {
            records: self,
            front: range.start,
            back: range.end,
        }
    }
}

impl<'a> IntoIterator for &'a Records {
    type Item = JournalRecord;
    type IntoIter = RecordsIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Decodes records of a [`Records`] snapshot one at a time. Undecodable entries are logged
/// and skipped.
pub struct RecordsIter {
    records: Records,
    front: usize,
    back: usize,
}

impl RecordsIter {
    fn next_entry(&mut self) -> Option<&Entry> {
        if self.front >= self.back {
            return None;
        }
        let index = if self.records.descending {
            self.back -= 1;
            self.back
        } else {
            self.front += 1;
            self.front - 1
        };
        self.records.entries.get(index)
    }
}

impl Iterator for RecordsIter {
    type Item = JournalRecord;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((key, bytes)) = self.next_entry() {
            if let Some(record) = decode(*key, bytes) {
                return Some(record);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.back.saturating_sub(self.front)))
    }
}

/// Lazily yields the records authored by one process, in ascending order.
///
/// Only the archived process key is looked at for records that do not match, nothing is
/// collected up front.
pub struct RecordsFor {
    inner: RecordsIter,
    process_key: String,
}

impl RecordsFor {
    pub(crate) fn new(records: Records, process_key: impl Into<String>) -> Self {
        RecordsFor {
            inner: records.ordered(false).into_iter(),
            process_key: process_key.into(),
        }
    }
}

impl Iterator for RecordsFor {
    type Item = JournalRecord;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((key, bytes)) = self.inner.next_entry() {
            let matches = match JournalRecord::inspect(bytes, |archived| {
                archived.change_set.process_key.as_str() == self.process_key
            }) {
                Ok(matches) => matches,
                Err(e) => {
                    error!("journal record {key} cannot be read: {e}");
                    continue;
                }
            };
            if !matches {
                continue;
            }
            if let Some(record) = decode(*key, bytes) {
                return Some(record);
            }
        }
        None
    }
}

fn decode(key: RecordKey, bytes: &[u8]) -> Option<JournalRecord> {
    match JournalRecord::from_archive(bytes) {
        Ok(record) => Some(record.with_created_time(key)),
        Err(e) => {
            error!("journal record {key} cannot be read: {e}");
            None
        }
    }
}
