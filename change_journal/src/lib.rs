pub mod clock;
pub mod cluster;
mod clustered;
mod common;
pub mod config;
mod consts;
pub mod delta;
mod gc;
mod journal;
mod local;
pub mod record;
pub mod records;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::{ClusterMember, ClusteringService, InProcessCluster, MessageConsumer};
pub use clustered::{ClusteredJournal, ReconciliationState};
pub use common::Error;
pub use config::{JournalConfig, ReconciliationPolicy};
pub use consts::DELTA_TOPIC;
pub use gc::JournalGc;
pub use journal::{ChangeJournal, ChangeSetListener};
pub use local::LocalJournal;
pub use record::{JournalRecord, RecordKey};
pub use records::{Records, RecordsFor};

pub use change_journal_base::{Change, ChangeSet, DailyTime, SimpleVersion, SYSTEM_WORKSPACE_NAME};
