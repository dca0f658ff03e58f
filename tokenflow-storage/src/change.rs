//! Change sets: the unit of atomic commit.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokenflow_core::{Execution, HistoricProcessInstance, Incident, Job};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Execution,
    Job,
    Incident,
    History,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Execution => "execution",
            EntityKind::Job => "job",
            EntityKind::Incident => "incident",
            EntityKind::History => "history",
        })
    }
}

/// A persisted row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "data", rename_all = "snake_case")]
pub enum Entity {
    Execution(Execution),
    Job(Job),
    Incident(Incident),
    History(HistoricProcessInstance),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Execution(_) => EntityKind::Execution,
            Entity::Job(_) => EntityKind::Job,
            Entity::Incident(_) => EntityKind::Incident,
            Entity::History(_) => EntityKind::History,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Entity::Execution(e) => e.id(),
            Entity::Job(e) => e.id(),
            Entity::Incident(e) => e.id(),
            Entity::History(e) => e.id(),
        }
    }

    pub fn revision(&self) -> u64 {
        match self {
            Entity::Execution(e) => e.revision,
            Entity::Job(e) => e.revision,
            Entity::Incident(e) => e.revision,
            Entity::History(e) => e.revision,
        }
    }

    pub(crate) fn set_revision(&mut self, revision: u64) {
        match self {
            Entity::Execution(e) => e.revision = revision,
            Entity::Job(e) => e.revision = revision,
            Entity::Incident(e) => e.revision = revision,
            Entity::History(e) => e.revision = revision,
        }
    }
}

/// Implemented by every entity type the store keeps.
pub trait Record: Clone {
    const KIND: EntityKind;

    fn id(&self) -> &str;
    fn revision(&self) -> u64;
    fn into_entity(self) -> Entity;
}

macro_rules! impl_record {
    ($ty:ty, $kind:ident) => {
        impl Record for $ty {
            const KIND: EntityKind = EntityKind::$kind;

            fn id(&self) -> &str {
                &self.id
            }

            fn revision(&self) -> u64 {
                self.revision
            }

            fn into_entity(self) -> Entity {
                Entity::$kind(self)
            }
        }
    };
}

impl_record!(Execution, Execution);
impl_record!(Job, Job);
impl_record!(Incident, Incident);
impl_record!(HistoricProcessInstance, History);

/// One row-level change.
///
/// `Update` and `Delete` carry the revision the writer read; the commit fails
/// if the stored revision moved on since.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Change {
    Insert {
        entity: Entity,
    },
    Update {
        entity: Entity,
    },
    Delete {
        kind: EntityKind,
        id: String,
        revision: u64,
    },
}

impl Change {
    pub fn kind(&self) -> EntityKind {
        match self {
            Change::Insert { entity } | Change::Update { entity } => entity.kind(),
            Change::Delete { kind, .. } => *kind,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Change::Insert { entity } | Change::Update { entity } => entity.id(),
            Change::Delete { id, .. } => id,
        }
    }
}

/// Changes produced by one command, committed all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    command: String,
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            changes: Vec::new(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn insert<R: Record>(&mut self, record: R) {
        self.push(Change::Insert {
            entity: record.into_entity(),
        });
    }

    pub fn update<R: Record>(&mut self, record: R) {
        self.push(Change::Update {
            entity: record.into_entity(),
        });
    }

    pub fn delete<R: Record>(&mut self, record: &R) {
        self.push(Change::Delete {
            kind: R::KIND,
            id: record.id().to_string(),
            revision: record.revision(),
        });
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn into_changes(self) -> Vec<Change> {
        self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
