pub mod change_set;
pub mod date_time;
pub mod simple_version;

pub use change_set::{ArchivedChange, ArchivedChangeSet, Change, ChangeSet, SYSTEM_WORKSPACE_NAME};
pub use date_time::{DailyTime, TimeParseError};
pub use simple_version::SimpleVersion;
