use crate::common::Error;
use crate::consts::MILLIS_PER_DAY;
use change_journal_base::DailyTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What a reconciling journal does with the delta responses it receives.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconciliationPolicy {
    /// Merge the first non-empty response and ignore the rest.
    #[default]
    FirstNonEmpty,
    /// Merge every response that arrives before completion, skipping change sets already present.
    MergeAll,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Directory holding the journal database.
    pub location: PathBuf,
    /// Let sled flush in the background instead of after every commit.
    pub async_writes: bool,
    /// Records older than this are removed by the journal GC. Zero or negative keeps everything.
    pub max_days_to_keep_records: i64,
    /// Local time of day the first GC run happens at.
    pub gc_initial_time: DailyTime,
    pub gc_interval_hours: u32,
    /// Attempts made to commit one record before the failure is returned.
    pub commit_attempts: u32,
    pub commit_backoff_ms: u64,
    /// Clock samples taken looking for a fresh millisecond before using a sequence key.
    pub key_sample_attempts: u32,
    /// Reconciliation is declared complete after this long even if peers stay silent.
    pub reconciliation_timeout_ms: Option<u64>,
    pub reconciliation_policy: ReconciliationPolicy,
}

impl Default for JournalConfig {
    fn default() -> Self {
        JournalConfig {
            location: PathBuf::from("journal"),
            async_writes: false,
            max_days_to_keep_records: -1,
            gc_initial_time: DailyTime::midnight(),
            gc_interval_hours: 24,
            commit_attempts: 3,
            commit_backoff_ms: 100,
            key_sample_attempts: 8,
            reconciliation_timeout_ms: Some(60_000),
            reconciliation_policy: ReconciliationPolicy::FirstNonEmpty,
        }
    }
}

impl JournalConfig {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        JournalConfig {
            location: location.into(),
            ..Default::default()
        }
    }

    pub fn from_ron_str(s: &str) -> Result<Self, Error> {
        Ok(ron::from_str(s)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_ron_str(&s)
    }

    pub fn with_async_writes(mut self, async_writes: bool) -> Self {
        self.async_writes = async_writes;
        self
    }

    pub fn with_max_days_to_keep_records(mut self, days: i64) -> Self {
        self.max_days_to_keep_records = days;
        self
    }

    pub fn with_reconciliation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reconciliation_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_reconciliation_policy(mut self, policy: ReconciliationPolicy) -> Self {
        self.reconciliation_policy = policy;
        self
    }

    /// Retention window, `None` when records are kept forever.
    pub fn retention_millis(&self) -> Option<i64> {
        if self.max_days_to_keep_records > 0 {
            Some(self.max_days_to_keep_records.saturating_mul(MILLIS_PER_DAY))
        } else {
            None
        }
    }

    pub fn commit_backoff(&self) -> Duration {
        Duration::from_millis(self.commit_backoff_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.gc_interval_hours.max(1)) * 3600)
    }

    pub fn reconciliation_timeout(&self) -> Option<Duration> {
        self.reconciliation_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_records_forever() {
        let config = JournalConfig::default();
        assert_eq!(config.retention_millis(), None);
        assert!(!config.async_writes);
        assert_eq!(config.gc_interval(), Duration::from_secs(24 * 3600));
        assert_eq!(config.reconciliation_policy, ReconciliationPolicy::FirstNonEmpty);
    }

    #[test]
    fn ron_with_partial_fields() {
        let config = JournalConfig::from_ron_str(
            r#"(
                location: "/var/lib/repo/journal",
                async_writes: true,
                max_days_to_keep_records: 7,
                gc_initial_time: "02:30",
                reconciliation_timeout_ms: None,
                reconciliation_policy: MergeAll,
            )"#,
        )
        .unwrap();
        assert_eq!(config.location, PathBuf::from("/var/lib/repo/journal"));
        assert!(config.async_writes);
        assert_eq!(config.retention_millis(), Some(7 * MILLIS_PER_DAY));
        assert_eq!(config.gc_initial_time, DailyTime::new(2, 30).unwrap());
        assert_eq!(config.reconciliation_timeout(), None);
        assert_eq!(config.reconciliation_policy, ReconciliationPolicy::MergeAll);
        assert_eq!(config.commit_attempts, 3);
    }

    #[test]
    fn bad_time_expression_is_a_config_error() {
        let r = JournalConfig::from_ron_str(r#"(gc_initial_time: "25:00")"#);
        assert!(matches!(r, Err(Error::Config(_))));
    }

    #[test]
    fn zero_days_is_not_a_retention_window() {
        let config = JournalConfig::default().with_max_days_to_keep_records(0);
        assert_eq!(config.retention_millis(), None);
    }
}
