use change_journal::{
    Change, ChangeJournal, ChangeSet, ChangeSetListener, Error, JournalConfig, LocalJournal,
};
use tempfile::TempDir;

fn change_set(node: &str) -> ChangeSet {
    ChangeSet::new("p", "repo", "default", "admin").with_change(Change::PropertyChanged {
        key: node.into(),
        path: format!("/{node}"),
        property: "title".into(),
        old_value: "old".into(),
        new_value: "new".into(),
    })
}

#[test]
fn journal_configured_from_file_survives_restart() {
    let dir = TempDir::new().unwrap();
    let journal_dir = dir.path().join("journal");
    let config_path = dir.path().join("journal.ron");
    std::fs::write(
        &config_path,
        format!(
            "(location: {:?}, max_days_to_keep_records: 30, gc_initial_time: \"03:15\")",
            journal_dir.display().to_string()
        ),
    )
    .unwrap();

    let config = JournalConfig::load(&config_path).unwrap();
    assert_eq!(config.location, journal_dir);
    let journal = LocalJournal::new(config.clone());
    journal.start().unwrap();
    let id = journal.journal_id().unwrap();
    journal.notify(&change_set("a")).unwrap();
    journal.notify(&change_set("b")).unwrap();
    journal.shutdown();

    let journal = LocalJournal::new(config);
    journal.start().unwrap();
    assert_eq!(journal.journal_id(), Some(id));
    let records = journal.all_records(true).to_vec();
    assert_eq!(records.len(), 2);
    assert!(records[0].key() > records[1].key());
    assert_eq!(journal.last_record().map(|r| r.key()), Some(records[0].key()));
    assert_eq!(journal.remove_old_records().unwrap(), 0);
}

#[test]
fn missing_config_file_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let r = JournalConfig::load(dir.path().join("absent.ron"));
    assert!(matches!(r, Err(Error::Config(_))));
}
