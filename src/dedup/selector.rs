use std::collections::HashSet;

use serde::Serialize;

use crate::items::Item;

/// Ranking of one group member. Field order is comparison order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SurvivorScore {
    pub referenced: bool,
    pub has_primary_image: bool,
    pub quality_fields: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    pub survivor_id: i64,
    pub loser_ids: Vec<i64>,
}

pub struct SurvivorSelector;

impl SurvivorSelector {
    pub fn score(item: &Item, referenced: bool) -> SurvivorScore {
        SurvivorScore {
            referenced,
            has_primary_image: item.has_primary_image(),
            quality_fields: item.quality_field_count(),
        }
    }

    /// Highest score wins; ties go to the lowest id. `None` only for an empty slice.
    pub fn select(members: &[Item], referenced: &HashSet<i64>) -> Option<Selection> {
        let mut best: Option<(SurvivorScore, i64)> = None;

        for item in members {
            let score = Self::score(item, referenced.contains(&item.item_id()));
            let id = item.item_id();
            best = match best {
                Some((best_score, best_id))
                    if best_score > score || (best_score == score && best_id < id) =>
                {
                    Some((best_score, best_id))
                }
                _ => Some((score, id)),
            };
        }

        let (_, survivor_id) = best?;
        let mut loser_ids: Vec<i64> = members
            .iter()
            .map(Item::item_id)
            .filter(|id| *id != survivor_id)
            .collect();
        loser_ids.sort_unstable();

        Some(Selection { survivor_id, loser_ids })
    }
}
