pub const JOURNAL_ID: &[u8] = b"_journal_id";
pub const RECORD_FORMAT: &[u8] = b"_record_format";

pub const RECORDS_TREE: &str = "records";
pub const META_TREE: &str = "meta";

/// Topic every delta reconciliation message is broadcast on.
pub const DELTA_TOPIC: &str = "journal.delta";

/// Sled flush period when asynchronous writes are enabled.
pub const ASYNC_FLUSH_EVERY_MS: u64 = 500;

pub const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;
