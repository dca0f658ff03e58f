//! Due-date index over jobs.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Job ids ordered by due date, ties broken by id.
#[derive(Debug, Default, Clone)]
pub struct DueIndex {
    entries: BTreeSet<(DateTime<Utc>, String)>,
}

impl DueIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, due: DateTime<Utc>, job_id: &str) {
        self.entries.insert((due, job_id.to_string()));
    }

    pub fn remove(&mut self, due: DateTime<Utc>, job_id: &str) {
        self.entries.remove(&(due, job_id.to_string()));
    }

    /// Ids due at or before `now`, earliest first.
    pub fn due_before(&self, now: DateTime<Utc>) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .take_while(move |(due, _)| *due <= now)
            .map(|(_, id)| id.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (DateTime<Utc>, &str)> {
        self.entries.iter().map(|(due, id)| (*due, id.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
