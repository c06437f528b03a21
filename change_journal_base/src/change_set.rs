use crate::date_time::millis_to_utc;
use chrono::{DateTime, Utc};
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Workspace holding repository-internal bookkeeping. Its changes are never journaled.
pub const SYSTEM_WORKSPACE_NAME: &str = "system";

/// Atomic bundle of mutations produced by one repository transaction.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct ChangeSet {
    /// Unique per change set, survives being forwarded between journals.
    pub id: String,
    /// Process that authored the changes.
    pub process_key: String,
    pub repository_key: String,
    pub session_id: String,
    pub user_id: String,
    pub user_data: HashMap<String, String>,
    pub workspace_name: String,
    /// When the transaction committed, UTC milliseconds.
    pub timestamp: i64,
    pub changes: Vec<Change>,
}

/// A single mutation. Values are carried as their string form.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Change {
    NodeAdded {
        key: String,
        parent_key: String,
        path: String,
    },
    NodeRemoved {
        key: String,
        parent_key: String,
        path: String,
    },
    NodeMoved {
        key: String,
        old_path: String,
        new_path: String,
    },
    NodeChanged {
        key: String,
        path: String,
    },
    PropertyAdded {
        key: String,
        path: String,
        property: String,
        value: String,
    },
    PropertyChanged {
        key: String,
        path: String,
        property: String,
        old_value: String,
        new_value: String,
    },
    PropertyRemoved {
        key: String,
        path: String,
        property: String,
    },
}

impl Change {
    /// Key of the node this change applies to.
    pub fn node_key(&self) -> &str {
        match self {
            Change::NodeAdded { key, .. }
            | Change::NodeRemoved { key, .. }
            | Change::NodeMoved { key, .. }
            | Change::NodeChanged { key, .. }
            | Change::PropertyAdded { key, .. }
            | Change::PropertyChanged { key, .. }
            | Change::PropertyRemoved { key, .. } => key,
        }
    }

    /// Path of the node after the change.
    pub fn path(&self) -> &str {
        match self {
            Change::NodeMoved { new_path, .. } => new_path,
            Change::NodeAdded { path, .. }
            | Change::NodeRemoved { path, .. }
            | Change::NodeChanged { path, .. }
            | Change::PropertyAdded { path, .. }
            | Change::PropertyChanged { path, .. }
            | Change::PropertyRemoved { path, .. } => path,
        }
    }
}

impl ChangeSet {
    pub fn new(
        process_key: impl Into<String>,
        repository_key: impl Into<String>,
        workspace_name: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        ChangeSet {
            id: Uuid::new_v4().to_string(),
            process_key: process_key.into(),
            repository_key: repository_key.into(),
            session_id: String::new(),
            user_id: user_id.into(),
            user_data: HashMap::new(),
            workspace_name: workspace_name.into(),
            timestamp: Utc::now().timestamp_millis(),
            changes: Vec::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_user_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_data.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_change(mut self, change: Change) -> Self {
        self.changes.push(change);
        self
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.changes.iter()
    }

    pub fn is_system(&self) -> bool {
        self.workspace_name == SYSTEM_WORKSPACE_NAME
    }

    pub fn event_time(&self) -> DateTime<Utc> {
        millis_to_utc(self.timestamp)
    }

    /// Keys of every node touched by this change set.
    pub fn changed_nodes(&self) -> BTreeSet<&str> {
        self.changes.iter().map(Change::node_key).collect()
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn added(key: &str, path: &str) -> Change {
        Change::NodeAdded {
            key: key.into(),
            parent_key: "root".into(),
            path: path.into(),
        }
    }

    #[test]
    fn changed_nodes_are_deduplicated() {
        let cs = ChangeSet::new("p1", "repo", "default", "admin")
            .with_change(added("n1", "/a"))
            .with_change(Change::PropertyAdded {
                key: "n1".into(),
                path: "/a".into(),
                property: "jcr:title".into(),
                value: "A".into(),
            })
            .with_change(added("n2", "/b"));
        assert_eq!(cs.len(), 3);
        assert_eq!(
            cs.changed_nodes().into_iter().collect::<Vec<_>>(),
            vec!["n1", "n2"]
        );
    }

    #[test]
    fn empty_and_system() {
        let cs = ChangeSet::new("p1", "repo", SYSTEM_WORKSPACE_NAME, "admin");
        assert!(cs.is_empty());
        assert!(cs.is_system());
        let cs = ChangeSet::new("p1", "repo", "default", "admin").with_change(added("n", "/n"));
        assert!(!cs.is_empty());
        assert!(!cs.is_system());
    }

    #[test]
    fn moved_node_reports_new_path() {
        let change = Change::NodeMoved {
            key: "n".into(),
            old_path: "/a/n".into(),
            new_path: "/b/n".into(),
        };
        assert_eq!(change.path(), "/b/n");
        assert_eq!(change.node_key(), "n");
    }

    #[test]
    fn ids_are_unique() {
        let a = ChangeSet::new("p", "r", "w", "u");
        let b = ChangeSet::new("p", "r", "w", "u");
        assert_ne!(a.id, b.id);
    }
}
