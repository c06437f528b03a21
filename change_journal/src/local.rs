use crate::clock::{Clock, KeyGenerator, SystemClock};
use crate::common::Error;
use crate::config::JournalConfig;
use crate::consts::{ASYNC_FLUSH_EVERY_MS, JOURNAL_ID, META_TREE, RECORDS_TREE, RECORD_FORMAT};
use crate::journal::{ChangeJournal, ChangeSetListener};
use crate::record::{JournalRecord, RecordKey, KEY_LEN};
use crate::records::{Records, RecordsFor};
use change_journal_base::date_time::local_to_utc_millis;
use change_journal_base::{ChangeSet, SimpleVersion};
use chrono::{DateTime, Local};
use log::{debug, error, info, trace, warn};
use sled::{Batch, Db, Tree};
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use uuid::Uuid;

/// Journal kept in a local sled database.
///
/// Appends, pruning and the lifecycle take the write lock. Queries take the read lock just
/// long enough to copy out a [`Records`] snapshot.
pub struct LocalJournal {
    config: JournalConfig,
    clock: Box<dyn Clock>,
    state: RwLock<State>,
}

enum State {
    Stopped,
    Running(Store),
}

struct Store {
    db: Db,
    records: Tree,
    journal_id: String,
    keys: KeyGenerator,
}

impl LocalJournal {
    pub fn new(config: JournalConfig) -> Self {
        Self::with_clock(config, Box::new(SystemClock))
    }

    pub fn with_clock(config: JournalConfig, clock: Box<dyn Clock>) -> Self {
        LocalJournal {
            config,
            clock,
            state: RwLock::new(State::Stopped),
        }
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    /// Stores `records`, giving each one a fresh key. Does nothing while stopped.
    pub fn append(&self, records: Vec<JournalRecord>) -> Result<(), Error> {
        let mut state = self.write_state();
        let State::Running(store) = &mut *state else {
            debug!("journal stopped, dropping {} record(s)", records.len());
            return Ok(());
        };
        for record in records {
            store.commit(record, &self.config)?;
        }
        Ok(())
    }

    fn read_state(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self, lower: Bound<RecordKey>, upper: Bound<RecordKey>) -> Records {
        let state = self.read_state();
        let State::Running(store) = &*state else {
            return Records::empty();
        };
        let range = (key_bound(lower), key_bound(upper));
        let mut entries = Vec::new();
        for item in store.records.range(range) {
            match item {
                Ok((key, value)) => match RecordKey::from_bytes(&key) {
                    Some(key) => entries.push((key, value)),
                    None => error!("journal key {key:?} has unexpected length, skipped"),
                },
                Err(e) => {
                    error!("journal scan failed: {e}");
                    return Records::empty();
                }
            }
        }
        Records::new(entries, false)
    }
}

fn key_bound(bound: Bound<RecordKey>) -> Bound<[u8; KEY_LEN]> {
    match bound {
        Bound::Included(key) => Bound::Included(key.to_bytes()),
        Bound::Excluded(key) => Bound::Excluded(key.to_bytes()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

impl Store {
    fn open(config: &JournalConfig, clock: Box<dyn Clock>) -> Result<Self, Error> {
        let location = config.location.display().to_string();
        Self::open_at(config, clock, &location).map_err(|e| startup_fault(&location, e))
    }

    fn open_at(config: &JournalConfig, clock: Box<dyn Clock>, location: &str) -> Result<Self, Error> {
        let flush_every_ms = if config.async_writes {
            Some(ASYNC_FLUSH_EVERY_MS)
        } else {
            None
        };
        let db = sled::Config::new()
            .path(&config.location)
            .flush_every_ms(flush_every_ms)
            .open()?;
        let meta = db.open_tree(META_TREE)?;
        let records = db.open_tree(RECORDS_TREE)?;

        let expected = SimpleVersion::record_format();
        match meta.get(RECORD_FORMAT)? {
            Some(bytes) => {
                let Some(found) = SimpleVersion::from_bytes(&bytes) else {
                    return Err(Error::Internal("record format entry is malformed".into()));
                };
                if !found.is_readable_by(&expected) {
                    return Err(Error::FormatMismatch { found, expected });
                }
            }
            None => {
                meta.insert(RECORD_FORMAT, &expected.to_bytes())?;
            }
        }

        if !meta.contains_key(JOURNAL_ID)? {
            let uuid = Uuid::new_v4();
            trace!("Created new journal at {location}, id={uuid}");
            meta.insert(JOURNAL_ID, uuid.to_string().as_bytes())?;
        }
        let Some(journal_id) = meta.get(JOURNAL_ID)? else {
            return Err(Error::Internal("journal id is absent".into()));
        };
        let journal_id = String::from_utf8_lossy(&journal_id).into_owned();
        meta.flush()?;

        let mut keys = KeyGenerator::new(clock, config.key_sample_attempts);
        if let Some((last, _)) = records.last()? {
            if let Some(last) = RecordKey::from_bytes(&last) {
                keys.observe(last);
            }
        }

        Ok(Store {
            db,
            records,
            journal_id,
            keys,
        })
    }

    /// Writes one record under a key no other record holds.
    fn commit(&mut self, record: JournalRecord, config: &JournalConfig) -> Result<RecordKey, Error> {
        let mut record = record;
        loop {
            let key = self.keys.next_key();
            record = record.with_created_time(key);
            let bytes = record.to_archive()?;
            let records = &self.records;
            let inserted = insert_durably(
                config.commit_attempts,
                config.commit_backoff(),
                || {
                    let swapped = records.compare_and_swap(
                        key.to_bytes(),
                        None::<&[u8]>,
                        Some(bytes.as_slice()),
                    )?;
                    // An earlier attempt may have landed before its error was reported.
                    Ok(match swapped {
                        Ok(()) => true,
                        Err(taken) => taken.current.as_deref() == Some(bytes.as_slice()),
                    })
                },
                || {
                    if !config.async_writes {
                        records.flush()?;
                    }
                    Ok(())
                },
            )?;
            if inserted {
                trace!(
                    "journaled change set {} from {} as {key}",
                    record.change_set_id(),
                    record.process_key()
                );
                return Ok(key);
            }
            debug!("journal key {key} already taken, picking another");
        }
    }

    fn remove_older_than(&mut self, cutoff: RecordKey) -> Result<usize, Error> {
        let mut batch = Batch::default();
        let mut removed = 0;
        for key in self.records.range(..cutoff.to_bytes()).keys() {
            batch.remove(key?);
            removed += 1;
        }
        if removed > 0 {
            self.records.apply_batch(batch)?;
            self.db.flush()?;
        }
        Ok(removed)
    }
}

fn startup_fault(location: &str, e: Error) -> Error {
    match e {
        Error::Sled(source) => Error::Startup {
            location: location.to_string(),
            source,
        },
        other => other,
    }
}

/// Inserts with `insert`, then makes the insert durable with `flush`. Each step is retried
/// on its own so a failed flush never repeats an insert that already happened.
pub(crate) fn insert_durably(
    attempts: u32,
    backoff: Duration,
    insert: impl FnMut() -> Result<bool, sled::Error>,
    flush: impl FnMut() -> Result<(), sled::Error>,
) -> Result<bool, Error> {
    let inserted = with_retries(attempts, backoff, insert)?;
    if inserted {
        with_retries(attempts, backoff, flush)?;
    }
    Ok(inserted)
}

/// Runs `op` up to `attempts` times, sleeping `backoff` between failures.
pub(crate) fn with_retries<T>(
    attempts: u32,
    backoff: Duration,
    mut op: impl FnMut() -> Result<T, sled::Error>,
) -> Result<T, Error> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!("journal commit attempt {attempt}/{attempts} failed: {e}, retrying");
                std::thread::sleep(backoff);
                attempt += 1;
            }
            Err(source) => return Err(Error::Commit { attempts, source }),
        }
    }
}

impl ChangeSetListener for LocalJournal {
    fn notify(&self, change_set: &ChangeSet) -> Result<(), Error> {
        if change_set.is_empty() || change_set.is_system() {
            return Ok(());
        }
        if !self.started() {
            return Ok(());
        }
        self.append(vec![JournalRecord::unkeyed(change_set.clone())])
    }
}

impl ChangeJournal for LocalJournal {
    fn start(&self) -> Result<(), Error> {
        let mut state = self.write_state();
        if let State::Running(_) = &*state {
            return Ok(());
        }
        let store = Store::open(&self.config, self.clock.clone())?;
        info!(
            "Journal {} started at {}",
            store.journal_id,
            self.config.location.display()
        );
        *state = State::Running(store);
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = self.write_state();
        if let State::Running(store) = std::mem::replace(&mut *state, State::Stopped) {
            if let Err(e) = store.db.flush() {
                error!("Journal {} flush on shutdown failed: {e}", store.journal_id);
            }
            info!("Journal {} stopped", store.journal_id);
        }
    }

    fn started(&self) -> bool {
        matches!(&*self.read_state(), State::Running(_))
    }

    fn journal_id(&self) -> Option<String> {
        match &*self.read_state() {
            State::Running(store) => Some(store.journal_id.clone()),
            State::Stopped => None,
        }
    }

    fn add_records(&self, records: Vec<JournalRecord>) -> Result<(), Error> {
        self.append(records)
    }

    fn remove_records_older_than(&self, millis: i64) -> Result<usize, Error> {
        if millis <= 0 {
            debug!("ignoring retention window of {millis}ms");
            return Ok(0);
        }
        let mut state = self.write_state();
        let State::Running(store) = &mut *state else {
            return Ok(0);
        };
        let cutoff = RecordKey::first_at(store.keys.now_millis().saturating_sub(millis));
        let removed = store.remove_older_than(cutoff)?;
        debug!("removed {removed} journal record(s) older than {cutoff}");
        Ok(removed)
    }

    fn remove_old_records(&self) -> Result<usize, Error> {
        match self.config.retention_millis() {
            Some(millis) => self.remove_records_older_than(millis),
            None => Ok(0),
        }
    }

    fn all_records(&self, descending: bool) -> Records {
        self.snapshot(Bound::Unbounded, Bound::Unbounded)
            .ordered(descending)
    }

    fn last_record(&self) -> Option<JournalRecord> {
        let state = self.read_state();
        let State::Running(store) = &*state else {
            return None;
        };
        let (key, bytes) = match store.records.last() {
            Ok(last) => last?,
            Err(e) => {
                error!("journal scan failed: {e}");
                return None;
            }
        };
        let key = RecordKey::from_bytes(&key)?;
        match JournalRecord::from_archive(&bytes) {
            Ok(record) => Some(record.with_created_time(key)),
            Err(e) => {
                error!("journal record {key} cannot be read: {e}");
                None
            }
        }
    }

    fn records_for(&self, process_key: &str) -> RecordsFor {
        RecordsFor::new(self.all_records(false), process_key)
    }

    fn records_older_than(
        &self,
        time: &DateTime<Local>,
        inclusive: bool,
        descending: bool,
    ) -> Records {
        let millis = local_to_utc_millis(time);
        let upper = if inclusive {
            Bound::Included(RecordKey::last_at(millis))
        } else {
            Bound::Excluded(RecordKey::first_at(millis))
        };
        self.snapshot(Bound::Unbounded, upper).ordered(descending)
    }

    fn records_newer_than(
        &self,
        time: &DateTime<Local>,
        inclusive: bool,
        descending: bool,
    ) -> Records {
        let millis = local_to_utc_millis(time);
        let lower = if inclusive {
            Bound::Included(RecordKey::first_at(millis))
        } else {
            Bound::Excluded(RecordKey::last_at(millis))
        };
        self.snapshot(lower, Bound::Unbounded).ordered(descending)
    }

    fn records_delta(&self, process_key: &str, descending: bool) -> Records {
        let all = self.all_records(false);
        let last_seen = all.raw().rev().find_map(|(key, bytes)| {
            match JournalRecord::inspect(bytes, |archived| {
                archived.change_set.process_key.as_str() == process_key
            }) {
                Ok(true) => Some(*key),
                Ok(false) => None,
                Err(e) => {
                    error!("journal record {key} cannot be read: {e}");
                    None
                }
            }
        });
        match last_seen {
            Some(last_seen) => {
                let delta = all.after(last_seen);
                debug!(
                    "delta for {process_key}: {} record(s) after {last_seen}",
                    delta.len()
                );
                delta.ordered(descending)
            }
            None => {
                debug!(
                    "{process_key} has no records here, delta is all {} record(s)",
                    all.len()
                );
                all.ordered(descending)
            }
        }
    }
}
