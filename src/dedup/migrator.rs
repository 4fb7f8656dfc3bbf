use log::debug;
use rusqlite::Connection;
use serde::Serialize;
use strum::{AsRefStr, Display, IntoEnumIterator};

use crate::containers::Container;
use crate::error::CatMergeError;
use crate::items::Item;
use crate::references::{ReferenceKind, References};

use super::DuplicateGroup;

#[derive(AsRefStr, Display, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReferenceAction {
    /// Rewritten in place to point at the survivor
    Moved,
    /// Folded into the owner's existing survivor reference and deleted
    Merged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceChange {
    pub kind: ReferenceKind,
    pub reference_id: i64,
    pub owner_key: String,
    pub from_item_id: i64,
    pub action: ReferenceAction,
    /// For merges, the survivor reference that absorbed this row
    pub merged_into: Option<i64>,
    /// For merges, the discarded row's column values as JSON
    pub snapshot: Option<String>,
}

/// A loser removed from the catalog, described well enough to find it in a backup
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletedItem {
    pub item_id: i64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityChange {
    pub from_item_id: i64,
    pub fields: Vec<&'static str>,
}

/// Everything that happened to one duplicate group
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupOutcome {
    pub survivor_id: i64,
    pub deleted_ids: Vec<i64>,
    pub deleted: Vec<DeletedItem>,
    pub quality: Vec<QualityChange>,
    pub references: Vec<ReferenceChange>,
}

impl GroupOutcome {
    pub fn moved_count(&self) -> usize {
        self.references
            .iter()
            .filter(|r| r.action == ReferenceAction::Moved)
            .count()
    }

    pub fn merged_count(&self) -> usize {
        self.references
            .iter()
            .filter(|r| r.action == ReferenceAction::Merged)
            .count()
    }
}

pub struct ReferenceMigrator;

impl ReferenceMigrator {
    /// Move or merge every dependent row of each loser onto the survivor, fold
    /// the loser's quality fields into the survivor, then delete the loser.
    ///
    /// Must be called inside a transaction. Fails if the group no longer
    /// matches the database (a member vanished or changed identity) or if any
    /// reference would be left pointing at a deleted item.
    pub fn migrate_group(conn: &Connection, group: &DuplicateGroup) -> Result<GroupOutcome, CatMergeError> {
        let mut survivor = Item::get_by_id(conn, group.survivor_id)?.ok_or_else(|| {
            CatMergeError::Error(format!("Survivor {} no longer exists", group.survivor_id))
        })?;
        let survivor_key = survivor.identity_key();
        if survivor_key != group.identity_key {
            return Err(CatMergeError::Error(format!(
                "Survivor {} changed identity since the plan was built",
                group.survivor_id
            )));
        }

        let mut outcome = GroupOutcome {
            survivor_id: group.survivor_id,
            deleted_ids: Vec::with_capacity(group.loser_ids.len()),
            deleted: Vec::with_capacity(group.loser_ids.len()),
            quality: Vec::new(),
            references: Vec::new(),
        };

        for &loser_id in &group.loser_ids {
            let loser = Item::get_by_id(conn, loser_id)?.ok_or_else(|| {
                CatMergeError::Error(format!("Duplicate {} no longer exists", loser_id))
            })?;
            if loser.identity_key() != survivor_key {
                return Err(CatMergeError::Error(format!(
                    "Duplicate {} changed identity since the plan was built",
                    loser_id
                )));
            }

            for kind in ReferenceKind::iter() {
                for row in References::for_item(conn, kind, loser_id)? {
                    let change = match References::find_for_owner(conn, kind, survivor.item_id(), &row.owner_key)? {
                        None => {
                            References::retarget(conn, kind, row.reference_id, survivor.item_id())?;
                            ReferenceChange {
                                kind,
                                reference_id: row.reference_id,
                                owner_key: row.owner_key,
                                from_item_id: loser_id,
                                action: ReferenceAction::Moved,
                                merged_into: None,
                                snapshot: None,
                            }
                        }
                        Some(existing) => {
                            let snapshot = References::snapshot(conn, kind, row.reference_id)?;
                            References::merge_into(conn, kind, existing, row.reference_id)?;
                            ReferenceChange {
                                kind,
                                reference_id: row.reference_id,
                                owner_key: row.owner_key,
                                from_item_id: loser_id,
                                action: ReferenceAction::Merged,
                                merged_into: Some(existing),
                                snapshot: Some(snapshot),
                            }
                        }
                    };
                    debug!(
                        "{} {} {} from item {} onto {}",
                        change.action, change.kind, change.reference_id, loser_id, survivor.item_id()
                    );
                    outcome.references.push(change);
                }
            }

            let merge = survivor.absorb_quality(&loser);
            if !merge.is_empty() {
                survivor.update_quality(conn)?;
                outcome.quality.push(QualityChange {
                    from_item_id: loser_id,
                    fields: merge.filled,
                });
            }

            let remaining = References::count_for_items(conn, &[loser_id])?;
            if remaining != 0 {
                return Err(CatMergeError::Error(format!(
                    "Duplicate {} still has {} reference(s) after migration",
                    loser_id, remaining
                )));
            }

            Item::delete(conn, loser_id)?;
            outcome.deleted_ids.push(loser_id);
            outcome.deleted.push(DeletedItem {
                item_id: loser_id,
                description: Self::describe(&loser),
            });
        }

        Container::recompute_item_count(conn, survivor_key.container_id)?;

        Ok(outcome)
    }

    fn describe(item: &Item) -> String {
        let mut description = format!(
            "container {} #{} {}",
            item.container_id(),
            item.position_key(),
            item.display_name()
        );
        if !item.variant().is_empty() {
            description.push_str(&format!(" ({})", item.variant()));
        }
        if let Some(image) = item.primary_image() {
            description.push_str(&format!(" image={}", image));
        }
        description
    }
}
