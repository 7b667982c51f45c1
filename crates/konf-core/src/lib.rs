//! Core domain model for the Konf event-information platform.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "konf-core";

/// An organizer-owned event. The ingestion pipeline only reads `id` to scope
/// writes and stamps `last_synced_at` after a sync attempt; everything else
/// is managed by the organizer-facing surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub name: String,
    /// Globally unique, URL-safe.
    pub slug: String,
    pub sheets_url: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// One program/agenda entry, fully replaced on every sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramItem {
    /// Position-derived per-sync id (`p1`, `p2`, …); not stable across syncs.
    pub external_id: String,
    pub day: NaiveDate,
    pub starts_at: NaiveTime,
    pub ends_at: Option<NaiveTime>,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    /// Comma-separated free-text labels, normalized to `a, b, c` form.
    pub category: Option<String>,
}

/// One participant-list entry, fully replaced on every sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub external_id: String,
    pub name: String,
    pub company: Option<String>,
}

/// One exhibitor-list entry, fully replaced on every sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exhibitor {
    pub external_id: String,
    pub company_name: String,
    pub stand_number: Option<String>,
}

/// The three independent ingestion pipelines and their destination tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Program,
    Participants,
    Exhibitors,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [
        EntityKind::Program,
        EntityKind::Participants,
        EntityKind::Exhibitors,
    ];

    /// Tab name inside the organizer's spreadsheet.
    pub fn sheet_name(self) -> &'static str {
        match self {
            EntityKind::Program => "Program",
            EntityKind::Participants => "Deltakere",
            EntityKind::Exhibitors => "Utstillere",
        }
    }

    /// Prefix for position-derived external ids.
    pub fn id_prefix(self) -> char {
        match self {
            EntityKind::Program => 'p',
            EntityKind::Participants => 'd',
            EntityKind::Exhibitors => 'u',
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Program => "program",
            EntityKind::Participants => "participants",
            EntityKind::Exhibitors => "exhibitors",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one entity type's sync: rows written plus every error and
/// per-row rejection encountered for that entity type only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityReport {
    pub count: usize,
    pub errors: Vec<String>,
}

/// Aggregate outcome of one sync invocation. Transient, returned to the
/// caller, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub program: EntityReport,
    pub participants: EntityReport,
    pub exhibitors: EntityReport,
}

impl SyncReport {
    pub fn entity(&self, kind: EntityKind) -> &EntityReport {
        match kind {
            EntityKind::Program => &self.program,
            EntityKind::Participants => &self.participants,
            EntityKind::Exhibitors => &self.exhibitors,
        }
    }

    pub fn entity_mut(&mut self, kind: EntityKind) -> &mut EntityReport {
        match kind {
            EntityKind::Program => &mut self.program,
            EntityKind::Participants => &mut self.participants,
            EntityKind::Exhibitors => &mut self.exhibitors,
        }
    }

    pub fn total_count(&self) -> usize {
        self.program.count + self.participants.count + self.exhibitors.count
    }

    pub fn has_errors(&self) -> bool {
        !self.program.errors.is_empty()
            || !self.participants.errors.is_empty()
            || !self.exhibitors.errors.is_empty()
    }
}
