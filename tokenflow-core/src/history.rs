//! Process instance history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessInstanceState {
    #[default]
    Active,
    Suspended,
    Completed,
    Deleted,
}

impl ProcessInstanceState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ProcessInstanceState::Completed | ProcessInstanceState::Deleted
        )
    }
}

/// Outlives the runtime executions of its instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricProcessInstance {
    pub id: String,
    pub definition_key: String,
    pub definition_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_key: Option<String>,
    pub state: ProcessInstanceState,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_reason: Option<String>,
    #[serde(default)]
    pub revision: u64,
}

impl HistoricProcessInstance {
    pub fn started(
        id: impl Into<String>,
        definition_key: impl Into<String>,
        definition_version: u32,
        business_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            definition_key: definition_key.into(),
            definition_version,
            business_key,
            state: ProcessInstanceState::Active,
            start_time: now,
            end_time: None,
            delete_reason: None,
            revision: 0,
        }
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.state = ProcessInstanceState::Completed;
        self.end_time = Some(now);
    }

    pub fn delete(&mut self, reason: Option<String>, now: DateTime<Utc>) {
        self.state = ProcessInstanceState::Deleted;
        self.end_time = Some(now);
        self.delete_reason = reason;
    }
}
