//! Per-task-name throttling.
//!
//! `throttle_all(until)` from a handler postpones further polling of that
//! task name. The poller consults the table through
//! [`ThrottleTable::filter_candidates`] when building each poll's
//! candidate list; expired entries are cleaned lazily on that pass.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

#[derive(Debug, Default)]
pub struct ThrottleTable {
    until: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl ThrottleTable {
    /// Postpone polling of `task` until the given instant. A later
    /// deadline extends an existing entry; an earlier one is ignored.
    pub fn throttle(&self, task: &str, until: DateTime<Utc>) {
        let mut map = self.until.lock().unwrap();
        let entry = map.entry(task.to_owned()).or_insert(until);
        if until > *entry {
            *entry = until;
        }
    }

    /// Drop throttled names from a poll's candidate list, discarding
    /// expired entries on the way.
    pub fn filter_candidates(&self, candidates: Vec<String>) -> Vec<String> {
        let now = Utc::now();
        let mut map = self.until.lock().unwrap();
        map.retain(|_, until| *until > now);
        candidates
            .into_iter()
            .filter(|task| !map.contains_key(task))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttled_names_are_excluded() {
        let table = ThrottleTable::default();
        table.throttle("b", Utc::now() + chrono::Duration::seconds(60));
        let left = table.filter_candidates(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(left, vec!["a".to_owned(), "c".to_owned()]);
    }

    #[test]
    fn expired_entries_are_cleaned_lazily() {
        let table = ThrottleTable::default();
        table.throttle("t", Utc::now() - chrono::Duration::seconds(1));
        let left = table.filter_candidates(vec!["t".into()]);
        assert_eq!(left, vec!["t".to_owned()]);
        assert!(table.until.lock().unwrap().is_empty());
    }

    #[test]
    fn later_deadline_wins() {
        let table = ThrottleTable::default();
        let near = Utc::now() + chrono::Duration::seconds(1);
        let far = Utc::now() + chrono::Duration::seconds(60);
        table.throttle("t", far);
        table.throttle("t", near);
        assert_eq!(*table.until.lock().unwrap().get("t").unwrap(), far);
        assert!(table.filter_candidates(vec!["t".into()]).is_empty());
    }
}
