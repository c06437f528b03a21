use crate::common::Error;
use crate::record::JournalRecord;
use crate::records::{Records, RecordsFor};
use change_journal_base::ChangeSet;
use chrono::{DateTime, Local};

/// Receives every change set the repository commits.
pub trait ChangeSetListener: Send + Sync {
    fn notify(&self, change_set: &ChangeSet) -> Result<(), Error>;
}

/// Durable, time-ordered record of the change sets seen by this process.
///
/// Queries never fail: a journal that is not running answers with empty results.
pub trait ChangeJournal: ChangeSetListener {
    fn start(&self) -> Result<(), Error>;

    fn shutdown(&self);

    fn started(&self) -> bool;

    /// Stable identifier of the journal's storage, `None` while stopped.
    fn journal_id(&self) -> Option<String>;

    /// Store records as they are, each under a fresh key.
    fn add_records(&self, records: Vec<JournalRecord>) -> Result<(), Error>;

    /// Removes records created more than `millis` ago and returns how many were removed.
    /// A non-positive window removes nothing.
    fn remove_records_older_than(&self, millis: i64) -> Result<usize, Error>;

    /// Applies the configured retention period.
    fn remove_old_records(&self) -> Result<usize, Error>;

    fn all_records(&self, descending: bool) -> Records;

    fn last_record(&self) -> Option<JournalRecord>;

    fn records_for(&self, process_key: &str) -> RecordsFor;

    /// Records created before `time` (or at it, when `inclusive`).
    fn records_older_than(
        &self,
        time: &DateTime<Local>,
        inclusive: bool,
        descending: bool,
    ) -> Records;

    /// Records created after `time` (or at it, when `inclusive`).
    fn records_newer_than(
        &self,
        time: &DateTime<Local>,
        inclusive: bool,
        descending: bool,
    ) -> Records;

    /// Records the given process has presumably not seen: everything created after the
    /// newest record it authored, or everything if it authored none.
    fn records_delta(&self, process_key: &str, descending: bool) -> Records;
}
