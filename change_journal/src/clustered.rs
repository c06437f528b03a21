use crate::cluster::{ClusteringService, MessageConsumer};
use crate::common::Error;
use crate::config::ReconciliationPolicy;
use crate::consts::DELTA_TOPIC;
use crate::delta::DeltaMessage;
use crate::journal::{ChangeJournal, ChangeSetListener};
use crate::local::LocalJournal;
use crate::record::JournalRecord;
use crate::records::{Records, RecordsFor};
use change_journal_base::ChangeSet;
use chrono::{DateTime, Local};
use log::{debug, error, info, trace, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReconciliationState {
    Stopped,
    /// Delta request sent, waiting for peers.
    Reconciling,
    /// Local journal is as complete as the cluster could make it, until the next restart.
    Complete,
}

/// A [`LocalJournal`] that catches up with its peers on start.
///
/// On start every other member is asked for the records this process has not seen. The
/// first non-empty answer is merged (or, with [`ReconciliationPolicy::MergeAll`], every
/// answer), after which [`ClusteredJournal::delta_reconciliation_completed`] turns true.
pub struct ClusteredJournal {
    inner: Arc<Inner>,
}

struct Inner {
    local: LocalJournal,
    clustering: Arc<dyn ClusteringService>,
    rt: Handle,
    reconciliation: Mutex<Reconciliation>,
}

struct Reconciliation {
    state: ReconciliationState,
    expected_responses: usize,
    /// Bumped on every start and shutdown so stale timeouts can tell they are stale.
    generation: u64,
    /// Change sets already present, only tracked for `MergeAll`.
    known_change_sets: HashSet<String>,
}

struct DeltaConsumer {
    inner: Weak<Inner>,
}

impl ClusteredJournal {
    pub fn new(local: LocalJournal, clustering: Arc<dyn ClusteringService>, rt: Handle) -> Self {
        let inner = Arc::new(Inner {
            local,
            clustering,
            rt,
            reconciliation: Mutex::new(Reconciliation {
                state: ReconciliationState::Stopped,
                expected_responses: 0,
                generation: 0,
                known_change_sets: HashSet::new(),
            }),
        });
        let consumer = DeltaConsumer {
            inner: Arc::downgrade(&inner),
        };
        inner
            .clustering
            .add_consumer(DELTA_TOPIC, Arc::new(consumer));
        ClusteredJournal { inner }
    }

    pub fn local(&self) -> &LocalJournal {
        &self.inner.local
    }

    pub fn process_id(&self) -> &str {
        self.inner.clustering.process_id()
    }

    /// True once local records can be trusted to include what the cluster knows.
    pub fn delta_reconciliation_completed(&self) -> bool {
        self.reconciliation_state() == ReconciliationState::Complete
    }

    pub fn reconciliation_state(&self) -> ReconciliationState {
        self.inner.lock().state
    }

    /// Responses still awaited before reconciliation completes on its own.
    pub fn expected_responses(&self) -> usize {
        self.inner.lock().expected_responses
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Reconciliation> {
        self.reconciliation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn me(&self) -> &str {
        self.clustering.process_id()
    }

    fn policy(&self) -> ReconciliationPolicy {
        self.local.config().reconciliation_policy
    }

    fn handle(&self, payload: &[u8]) {
        match DeltaMessage::from_bytes(payload) {
            Ok(DeltaMessage::Request { process_id }) => self.answer(&process_id),
            Ok(DeltaMessage::Response {
                requester_id,
                responder_id,
                records,
            }) => {
                if requester_id == self.me() {
                    self.accept(&responder_id, records);
                }
            }
            Err(e) => warn!("{}: undecodable delta message: {e}", self.me()),
        }
    }

    fn answer(&self, requester: &str) {
        if requester == self.me() {
            trace!("{}: ignoring own delta request", self.me());
            return;
        }
        let records = blocking(|| self.local.records_delta(requester, false).to_vec());
        debug!(
            "{}: answering delta request from {requester} with {} record(s)",
            self.me(),
            records.len()
        );
        let sent = DeltaMessage::response(requester, self.me(), records)
            .to_bytes()
            .and_then(|bytes| self.clustering.send_message(DELTA_TOPIC, &bytes));
        if let Err(e) = sent {
            warn!("{}: delta response to {requester} not sent: {e}", self.me());
        }
    }

    fn accept(&self, responder: &str, records: Vec<JournalRecord>) {
        let mut reconciliation = self.lock();
        if reconciliation.state != ReconciliationState::Reconciling {
            trace!(
                "{}: late delta response from {responder} ignored",
                self.me()
            );
            return;
        }
        reconciliation.expected_responses = reconciliation.expected_responses.saturating_sub(1);
        debug!(
            "{}: delta response from {responder} with {} record(s), {} still expected",
            self.me(),
            records.len(),
            reconciliation.expected_responses
        );

        let merged = match self.policy() {
            ReconciliationPolicy::FirstNonEmpty => self.merge(records) > 0,
            ReconciliationPolicy::MergeAll => {
                let fresh: Vec<JournalRecord> = records
                    .into_iter()
                    .filter(|r| {
                        reconciliation
                            .known_change_sets
                            .insert(r.change_set_id().to_string())
                    })
                    .collect();
                self.merge(fresh);
                false
            }
        };

        if merged || reconciliation.expected_responses == 0 {
            reconciliation.state = ReconciliationState::Complete;
            info!(
                "{}: delta reconciliation complete, last response from {responder}",
                self.me()
            );
        }
    }

    /// Appends `records` and returns how many were stored.
    fn merge(&self, records: Vec<JournalRecord>) -> usize {
        let count = records.len();
        if count == 0 {
            return 0;
        }
        match blocking(|| self.local.append(records)) {
            Ok(()) => count,
            Err(e) => {
                error!("{}: merging {count} delta record(s) failed: {e}", self.me());
                0
            }
        }
    }

    fn force_complete(&self, generation: u64, timeout: Duration) {
        let mut reconciliation = self.lock();
        if reconciliation.generation != generation
            || reconciliation.state != ReconciliationState::Reconciling
        {
            return;
        }
        warn!(
            "{}: {} delta response(s) missing after {timeout:?}, completing reconciliation anyway",
            self.me(),
            reconciliation.expected_responses
        );
        reconciliation.state = ReconciliationState::Complete;
    }

    fn local_change_set_ids(&self) -> HashSet<String> {
        let records = self.local.all_records(false);
        let ids = records
            .raw()
            .filter_map(|(_, bytes)| {
                JournalRecord::inspect(bytes, |archived| archived.change_set.id.as_str().to_owned())
                    .ok()
            })
            .collect();
        ids
    }
}

/// Runs storage work from a delivery task without stalling the runtime's other tasks.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(rt) if rt.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

impl MessageConsumer for DeltaConsumer {
    fn consume(&self, payload: &[u8]) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle(payload);
        }
    }
}

impl ChangeSetListener for ClusteredJournal {
    fn notify(&self, change_set: &ChangeSet) -> Result<(), Error> {
        self.inner.local.notify(change_set)
    }
}

impl ChangeJournal for ClusteredJournal {
    fn start(&self) -> Result<(), Error> {
        let inner = &self.inner;
        inner.local.start()?;

        let mut reconciliation = inner.lock();
        if reconciliation.state != ReconciliationState::Stopped {
            return Ok(());
        }
        reconciliation.generation += 1;
        if !inner.clustering.multiple_members_in_cluster() {
            reconciliation.state = ReconciliationState::Complete;
            info!("{}: only cluster member, nothing to reconcile", inner.me());
            return Ok(());
        }

        reconciliation.expected_responses = inner.clustering.members_in_cluster() - 1;
        reconciliation.state = ReconciliationState::Reconciling;
        reconciliation.known_change_sets = match inner.policy() {
            ReconciliationPolicy::MergeAll => inner.local_change_set_ids(),
            ReconciliationPolicy::FirstNonEmpty => HashSet::new(),
        };
        let generation = reconciliation.generation;
        let expected = reconciliation.expected_responses;
        drop(reconciliation);

        info!(
            "{}: requesting delta from {expected} peer(s)",
            inner.me()
        );
        let sent = DeltaMessage::request(inner.me())
            .to_bytes()
            .and_then(|request| inner.clustering.send_message(DELTA_TOPIC, &request));
        if let Err(e) = sent {
            let mut reconciliation = inner.lock();
            if reconciliation.generation == generation {
                reconciliation.generation += 1;
                reconciliation.state = ReconciliationState::Stopped;
                reconciliation.expected_responses = 0;
                reconciliation.known_change_sets.clear();
            }
            warn!("{}: delta request not sent: {e}", inner.me());
            return Err(e);
        }

        if let Some(timeout) = inner.local.config().reconciliation_timeout() {
            let weak = Arc::downgrade(inner);
            inner.rt.spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    inner.force_complete(generation, timeout);
                }
            });
        }
        Ok(())
    }

    fn shutdown(&self) {
        {
            let mut reconciliation = self.inner.lock();
            reconciliation.generation += 1;
            reconciliation.state = ReconciliationState::Stopped;
            reconciliation.expected_responses = 0;
            reconciliation.known_change_sets.clear();
        }
        self.inner.local.shutdown();
    }

    fn started(&self) -> bool {
        self.inner.local.started()
    }

    fn journal_id(&self) -> Option<String> {
        self.inner.local.journal_id()
    }

    fn add_records(&self, records: Vec<JournalRecord>) -> Result<(), Error> {
        self.inner.local.append(records)
    }

    fn remove_records_older_than(&self, millis: i64) -> Result<usize, Error> {
        self.inner.local.remove_records_older_than(millis)
    }

    fn remove_old_records(&self) -> Result<usize, Error> {
        self.inner.local.remove_old_records()
    }

    fn all_records(&self, descending: bool) -> Records {
        self.inner.local.all_records(descending)
    }

    fn last_record(&self) -> Option<JournalRecord> {
        self.inner.local.last_record()
    }

    fn records_for(&self, process_key: &str) -> RecordsFor {
        self.inner.local.records_for(process_key)
    }

    fn records_older_than(
        &self,
        time: &DateTime<Local>,
        inclusive: bool,
        descending: bool,
    ) -> Records {
        self.inner
            .local
            .records_older_than(time, inclusive, descending)
    }

    fn records_newer_than(
        &self,
        time: &DateTime<Local>,
        inclusive: bool,
        descending: bool,
    ) -> Records {
        self.inner
            .local
            .records_newer_than(time, inclusive, descending)
    }

    fn records_delta(&self, process_key: &str, descending: bool) -> Records {
        self.inner.local.records_delta(process_key, descending)
    }
}
