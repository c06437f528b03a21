use crate::config::JournalConfig;
use crate::journal::ChangeJournal;
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Periodically applies the journal's retention period.
///
/// First run is at the configured time of day, then every `gc_interval_hours`. The task is
/// aborted when this handle is stopped or dropped.
pub struct JournalGc {
    join: JoinHandle<()>,
}

impl JournalGc {
    /// Returns `None` when the configuration keeps records forever.
    pub fn spawn(
        journal: Arc<dyn ChangeJournal>,
        config: &JournalConfig,
        rt: &Handle,
    ) -> Option<JournalGc> {
        config.retention_millis()?;
        let initial_delay = config.gc_initial_time.delay_from_now();
        info!(
            "journal gc first run at {} (in {initial_delay:?}), then every {}h",
            config.gc_initial_time, config.gc_interval_hours
        );
        Some(Self::spawn_with(
            journal,
            initial_delay,
            config.gc_interval(),
            rt,
        ))
    }

    pub(crate) fn spawn_with(
        journal: Arc<dyn ChangeJournal>,
        initial_delay: Duration,
        interval: Duration,
        rt: &Handle,
    ) -> JournalGc {
        let join = rt.spawn(async move {
            tokio::time::sleep(initial_delay).await;
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let journal = journal.clone();
                match tokio::task::spawn_blocking(move || journal.remove_old_records()).await {
                    Ok(Ok(removed)) => debug!("journal gc removed {removed} record(s)"),
                    Ok(Err(e)) => error!("journal gc failed: {e}"),
                    Err(e) => error!("journal gc task panicked: {e}"),
                }
            }
        });
        JournalGc { join }
    }

    pub fn stop(&self) {
        self.join.abort();
    }
}

impl Drop for JournalGc {
    fn drop(&mut self) {
        self.join.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::consts::MILLIS_PER_DAY;
    use crate::journal::ChangeSetListener;
    use crate::local::LocalJournal;
    use change_journal_base::{Change, ChangeSet};
    use std::time::Instant;
    use tempfile::TempDir;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn removes_expired_records() {
        let rt = runtime();
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(1_700_000_000_000);
        let config =
            JournalConfig::new(dir.path().join("journal")).with_max_days_to_keep_records(7);
        let journal = Arc::new(LocalJournal::with_clock(config, Box::new(clock.clone())));
        journal.start().unwrap();
        journal
            .notify(
                &ChangeSet::new("p", "repo", "default", "admin").with_change(Change::NodeChanged {
                    key: "n".into(),
                    path: "/n".into(),
                }),
            )
            .unwrap();
        clock.advance(8 * MILLIS_PER_DAY);

        let gc = JournalGc::spawn_with(
            journal.clone(),
            Duration::ZERO,
            Duration::from_millis(10),
            rt.handle(),
        );
        let deadline = Instant::now() + Duration::from_secs(5);
        while !journal.all_records(false).is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        gc.stop();
        assert!(journal.all_records(false).is_empty());
    }

    #[test]
    fn nothing_to_do_without_retention() {
        let rt = runtime();
        let dir = TempDir::new().unwrap();
        let config = JournalConfig::new(dir.path().join("journal"));
        let journal = Arc::new(LocalJournal::new(config.clone()));
        assert!(JournalGc::spawn(journal, &config, rt.handle()).is_none());
    }
}
