//! Read-time reconciliation of server and local state
//!
//! The merged view is recomputed from the snapshot cache whenever it changes;
//! it never waits on the network.

use crate::models::EntityRecord;
use std::collections::HashSet;

/// A reconciled entity plus its provenance
#[derive(Debug, Clone, PartialEq)]
pub struct MergedEntity {
    pub record: EntityRecord,
    is_offline: bool,
}

impl MergedEntity {
    /// True when the entity has not yet been confirmed by the server
    #[must_use]
    pub const fn is_offline_data(&self) -> bool {
        self.is_offline
    }
}

/// Merge server-confirmed entities with locally pending ones.
///
/// Server entities come first and win id collisions (the offline flag is
/// dropped for a collided id). Tombstoned ids are excluded entirely. Relative
/// input order is preserved otherwise; the first occurrence of an id decides
/// its position.
#[must_use]
pub fn merge_entities(
    server: Vec<EntityRecord>,
    offline: Vec<EntityRecord>,
    tombstones: &HashSet<String>,
) -> Vec<MergedEntity> {
    let mut seen: HashSet<String> = HashSet::with_capacity(server.len() + offline.len());
    let mut merged = Vec::with_capacity(server.len() + offline.len());

    for record in server {
        if record.deleted
            || tombstones.contains(&record.entity_id)
            || !seen.insert(record.entity_id.clone())
        {
            continue;
        }
        merged.push(MergedEntity {
            record,
            is_offline: false,
        });
    }

    for record in offline {
        if record.deleted
            || tombstones.contains(&record.entity_id)
            || !seen.insert(record.entity_id.clone())
        {
            continue;
        }
        merged.push(MergedEntity {
            record,
            is_offline: true,
        });
    }

    merged
}
