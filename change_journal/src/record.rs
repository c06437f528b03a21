use crate::common::{aligned, Error};
use change_journal_base::date_time::millis_to_utc;
use change_journal_base::{Change, ChangeSet};
use chrono::{DateTime, Utc};
use rkyv::{check_archived_root, to_bytes, AlignedVec, Archive, Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt::{Display, Formatter};

/// Journal ordering key: creation time in UTC milliseconds plus a sequence used only when
/// several records have to share one millisecond.
#[derive(
    Archive, Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[archive(check_bytes)]
pub struct RecordKey {
    pub millis: i64,
    pub seq: u32,
}

pub const KEY_LEN: usize = 12;

impl RecordKey {
    pub const fn new(millis: i64, seq: u32) -> Self {
        RecordKey { millis, seq }
    }

    /// Smallest key that can exist at `millis`.
    pub const fn first_at(millis: i64) -> Self {
        RecordKey { millis, seq: 0 }
    }

    /// Largest key that can exist at `millis`.
    pub const fn last_at(millis: i64) -> Self {
        RecordKey {
            millis,
            seq: u32::MAX,
        }
    }

    /// Big-endian with the sign bit flipped, so byte order equals key order.
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        let mut bytes = [0u8; KEY_LEN];
        let millis = (self.millis as u64) ^ (1 << 63);
        bytes[..8].copy_from_slice(&millis.to_be_bytes());
        bytes[8..].copy_from_slice(&self.seq.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != KEY_LEN {
            return None;
        }
        let mut millis = [0u8; 8];
        millis.copy_from_slice(&bytes[..8]);
        let mut seq = [0u8; 4];
        seq.copy_from_slice(&bytes[8..]);
        Some(RecordKey {
            millis: (u64::from_be_bytes(millis) ^ (1 << 63)) as i64,
            seq: u32::from_be_bytes(seq),
        })
    }

    pub fn created_time_utc(&self) -> DateTime<Utc> {
        millis_to_utc(self.millis)
    }
}

impl Display for RecordKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.seq == 0 {
            write!(f, "{}", self.millis)
        } else {
            write!(f, "{}.{}", self.millis, self.seq)
        }
    }
}

/// A change set as stored in the journal, keyed by the local time it was appended at.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct JournalRecord {
    key: RecordKey,
    /// Crate-visible so the archived form can be filtered without deserializing.
    pub(crate) change_set: ChangeSet,
}

impl JournalRecord {
    pub fn new(key: RecordKey, change_set: ChangeSet) -> Self {
        JournalRecord { key, change_set }
    }

    /// Record that has not been given its journal key yet, `append` assigns one.
    pub fn unkeyed(change_set: ChangeSet) -> Self {
        JournalRecord {
            key: RecordKey::first_at(0),
            change_set,
        }
    }

    /// Same logical record under another ordering key.
    pub fn with_created_time(mut self, key: RecordKey) -> Self {
        self.key = key;
        self
    }

    pub fn key(&self) -> RecordKey {
        self.key
    }

    pub fn created_time_utc(&self) -> DateTime<Utc> {
        self.key.created_time_utc()
    }

    pub fn change_set(&self) -> &ChangeSet {
        &self.change_set
    }

    pub fn into_change_set(self) -> ChangeSet {
        self.change_set
    }

    pub fn change_set_id(&self) -> &str {
        &self.change_set.id
    }

    pub fn process_key(&self) -> &str {
        &self.change_set.process_key
    }

    pub fn repository_key(&self) -> &str {
        &self.change_set.repository_key
    }

    pub fn user_id(&self) -> &str {
        &self.change_set.user_id
    }

    pub fn user_data(&self) -> &HashMap<String, String> {
        &self.change_set.user_data
    }

    pub fn workspace_name(&self) -> &str {
        &self.change_set.workspace_name
    }

    /// When the original transaction committed, as opposed to when the record was journaled.
    pub fn change_time_utc(&self) -> DateTime<Utc> {
        self.change_set.event_time()
    }

    pub fn changes(&self) -> std::slice::Iter<'_, Change> {
        self.change_set.iter()
    }

    pub fn changed_nodes(&self) -> BTreeSet<&str> {
        self.change_set.changed_nodes()
    }

    pub(crate) fn to_archive(&self) -> Result<AlignedVec, Error> {
        Ok(to_bytes::<_, 256>(self)?)
    }

    pub(crate) fn from_archive(bytes: &[u8]) -> Result<JournalRecord, Error> {
        let buf = aligned(bytes);
        let archived = check_archived_root::<JournalRecord>(&buf)?;
        let record: JournalRecord = archived.deserialize(&mut rkyv::Infallible)?;
        Ok(record)
    }

    /// Runs `f` on the validated archive without deserializing the change set.
    pub(crate) fn inspect<R>(
        bytes: &[u8],
        f: impl FnOnce(&ArchivedJournalRecord) -> R,
    ) -> Result<R, Error> {
        let buf = aligned(bytes);
        let archived = check_archived_root::<JournalRecord>(&buf)?;
        Ok(f(archived))
    }
}

/// Records order by key alone; two records with one key but different payloads are unordered.
impl PartialOrd for JournalRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.key.cmp(&other.key) {
            Ordering::Equal if self.change_set != other.change_set => None,
            ordering => Some(ordering),
        }
    }
}

impl<'a> IntoIterator for &'a JournalRecord {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.change_set.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change_set(process: &str) -> ChangeSet {
        ChangeSet::new(process, "repo", "default", "admin").with_change(Change::NodeChanged {
            key: "n".into(),
            path: "/n".into(),
        })
    }

    #[test]
    fn key_bytes_sort_like_keys() {
        let mut keys = vec![
            RecordKey::new(5, 0),
            RecordKey::new(-3, 0),
            RecordKey::new(5, 2),
            RecordKey::new(0, 0),
            RecordKey::new(i64::MIN, 0),
            RecordKey::new(1_700_000_000_000, 1),
        ];
        let mut by_bytes = keys.clone();
        keys.sort();
        by_bytes.sort_by_key(|k| k.to_bytes());
        assert_eq!(keys, by_bytes);
        for key in keys {
            assert_eq!(RecordKey::from_bytes(&key.to_bytes()), Some(key));
        }
        assert_eq!(RecordKey::from_bytes(b"short"), None);
    }

    #[test]
    fn sentinel_bounds_cover_every_sequence() {
        let k = RecordKey::new(100, 7);
        assert!(RecordKey::first_at(100) <= k);
        assert!(k <= RecordKey::last_at(100));
        assert!(RecordKey::last_at(99) < RecordKey::first_at(100));
    }

    #[test]
    fn ordering_is_by_key_equality_needs_payload() {
        let a = JournalRecord::new(RecordKey::new(1, 0), change_set("p1"));
        let b = JournalRecord::new(RecordKey::new(2, 0), change_set("p1"));
        assert!(a < b);

        let c = a.clone().with_created_time(RecordKey::new(1, 0));
        assert_eq!(a, c);
        assert_eq!(a.partial_cmp(&c), Some(Ordering::Equal));

        let d = JournalRecord::new(RecordKey::new(1, 0), change_set("p2"));
        assert_ne!(a, d);
        assert_eq!(a.partial_cmp(&d), None);
    }

    #[test]
    fn retargeting_keeps_payload() {
        let a = JournalRecord::new(RecordKey::new(1, 0), change_set("p1"));
        let b = a.clone().with_created_time(RecordKey::new(9, 3));
        assert_eq!(b.key(), RecordKey::new(9, 3));
        assert_eq!(b.change_set(), a.change_set());
    }

    #[test]
    fn archive_and_inspect() {
        let record = JournalRecord::new(
            RecordKey::new(1_700_000_000_123, 0),
            change_set("proc-a").with_user_data("origin", "test"),
        );
        let bytes = record.to_archive().unwrap();
        let process = JournalRecord::inspect(&bytes, |a| a.change_set.process_key.as_str().to_string()).unwrap();
        assert_eq!(process, "proc-a");
        assert_eq!(JournalRecord::from_archive(&bytes).unwrap(), record);
        assert!(JournalRecord::from_archive(b"garbage").is_err());
    }
}
