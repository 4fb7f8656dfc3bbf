use std::fmt;

use rusqlite::{named_params, params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::CatMergeError;

/// Category value treated the same as "no category"
pub const DEFAULT_CATEGORY: &str = "base";

/// Separator used when appending one free-text value to another
pub const TEXT_SEPARATOR: &str = " | ";

/// Exact-match identity used to group duplicates
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IdentityKey {
    pub container_id: i64,
    pub position_key: String,
    pub display_name: String,
    pub variant: String,
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/#{} {}", self.container_id, self.position_key, self.display_name)?;
        if !self.variant.is_empty() {
            write!(f, " ({})", self.variant)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Item {
    item_id: i64,
    container_id: i64,
    position_key: String,
    display_name: String,
    variant: String,
    is_parallel: bool,
    primary_image: Option<String>,
    secondary_image: Option<String>,
    category: Option<String>,
    value_estimate: Option<f64>,
    note: Option<String>,
}

/// Names of the quality fields a loser contributed to its survivor
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QualityMerge {
    pub filled: Vec<&'static str>,
}

impl QualityMerge {
    pub fn is_empty(&self) -> bool {
        self.filled.is_empty()
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

impl Item {
    const SELECT_COLUMNS: &str = "item_id, container_id, position_key, display_name, variant, is_parallel, \
        primary_image, secondary_image, category, value_estimate, note";

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Item {
            item_id: row.get(0)?,
            container_id: row.get(1)?,
            position_key: row.get(2)?,
            display_name: row.get(3)?,
            variant: row.get(4)?,
            is_parallel: row.get(5)?,
            primary_image: row.get(6)?,
            secondary_image: row.get(7)?,
            category: row.get(8)?,
            value_estimate: row.get(9)?,
            note: row.get(10)?,
        })
    }

    #[cfg(test)]
    pub fn new_for_test(item_id: i64, container_id: i64, position_key: &str, display_name: &str) -> Self {
        Item {
            item_id,
            container_id,
            position_key: position_key.to_owned(),
            display_name: display_name.to_owned(),
            ..Default::default()
        }
    }

    #[cfg(test)]
    pub fn with_quality(
        mut self,
        primary_image: Option<&str>,
        secondary_image: Option<&str>,
        category: Option<&str>,
        value_estimate: Option<f64>,
        note: Option<&str>,
    ) -> Self {
        self.primary_image = primary_image.map(str::to_owned);
        self.secondary_image = secondary_image.map(str::to_owned);
        self.category = category.map(str::to_owned);
        self.value_estimate = value_estimate;
        self.note = note.map(str::to_owned);
        self
    }

    pub fn item_id(&self) -> i64 { self.item_id }
    pub fn container_id(&self) -> i64 { self.container_id }
    pub fn position_key(&self) -> &str { &self.position_key }
    pub fn display_name(&self) -> &str { &self.display_name }
    pub fn variant(&self) -> &str { &self.variant }
    pub fn is_parallel(&self) -> bool { self.is_parallel }
    pub fn primary_image(&self) -> Option<&str> { self.primary_image.as_deref() }
    pub fn secondary_image(&self) -> Option<&str> { self.secondary_image.as_deref() }
    pub fn category(&self) -> Option<&str> { self.category.as_deref() }
    pub fn value_estimate(&self) -> Option<f64> { self.value_estimate }
    pub fn note(&self) -> Option<&str> { self.note.as_deref() }

    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey {
            container_id: self.container_id,
            position_key: self.position_key.clone(),
            display_name: self.display_name.clone(),
            variant: self.variant.clone(),
        }
    }

    pub fn has_primary_image(&self) -> bool {
        !is_blank(&self.primary_image)
    }

    fn has_category(&self) -> bool {
        match self.category.as_deref().map(str::trim) {
            None | Some("") => false,
            Some(c) => !c.eq_ignore_ascii_case(DEFAULT_CATEGORY),
        }
    }

    /// Count of populated secondary quality fields: secondary image,
    /// non-default category, value estimate, note
    pub fn quality_field_count(&self) -> u8 {
        [
            !is_blank(&self.secondary_image),
            self.has_category(),
            self.value_estimate.is_some(),
            !is_blank(&self.note),
        ]
        .iter()
        .filter(|populated| **populated)
        .count() as u8
    }

    /// Fold a loser's quality fields into this item. Missing fields are filled,
    /// populated fields are never overwritten, and the loser's note is appended
    /// unless it is already contained in this item's note.
    pub fn absorb_quality(&mut self, loser: &Item) -> QualityMerge {
        let mut merge = QualityMerge::default();

        if is_blank(&self.primary_image) && !is_blank(&loser.primary_image) {
            self.primary_image = loser.primary_image.clone();
            merge.filled.push("primary_image");
        }
        if is_blank(&self.secondary_image) && !is_blank(&loser.secondary_image) {
            self.secondary_image = loser.secondary_image.clone();
            merge.filled.push("secondary_image");
        }
        if !self.has_category() && loser.has_category() {
            self.category = loser.category.clone();
            merge.filled.push("category");
        }
        if self.value_estimate.is_none() && loser.value_estimate.is_some() {
            self.value_estimate = loser.value_estimate;
            merge.filled.push("value_estimate");
        }
        if let Some(loser_note) = loser.note.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            match self.note.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
                None => {
                    self.note = Some(loser_note.to_owned());
                    merge.filled.push("note");
                }
                Some(own) if !own.contains(loser_note) => {
                    self.note = Some(format!("{}{}{}", own, TEXT_SEPARATOR, loser_note));
                    merge.filled.push("note");
                }
                Some(_) => {}
            }
        }

        merge
    }

    pub fn get_by_id(conn: &Connection, item_id: i64) -> Result<Option<Self>, CatMergeError> {
        let sql = format!("SELECT {} FROM items WHERE item_id = ?", Self::SELECT_COLUMNS);
        conn.query_row(&sql, [item_id], Self::from_row)
            .optional()
            .map_err(CatMergeError::DatabaseError)
    }

    /// Every item that shares its identity key with at least one other item,
    /// ordered by id. `container_id = None` scans the whole catalog.
    pub fn duplicate_candidates(
        conn: &Connection,
        container_id: Option<i64>,
    ) -> Result<Vec<Self>, CatMergeError> {
        let sql = format!(
            "SELECT {} FROM items
             WHERE (container_id, position_key, display_name, variant) IN (
                 SELECT container_id, position_key, display_name, variant
                 FROM items
                 WHERE (:container_id IS NULL OR container_id = :container_id)
                 GROUP BY container_id, position_key, display_name, variant
                 HAVING COUNT(*) > 1
             )
             ORDER BY item_id ASC",
            Self::SELECT_COLUMNS
        );

        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(named_params! { ":container_id": container_id }, Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub fn for_container(conn: &Connection, container_id: i64) -> Result<Vec<Self>, CatMergeError> {
        let sql = format!(
            "SELECT {} FROM items WHERE container_id = ? ORDER BY item_id ASC",
            Self::SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map([container_id], Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub fn update_quality(&self, conn: &Connection) -> Result<(), CatMergeError> {
        conn.execute(
            "UPDATE items SET
                primary_image = :primary_image,
                secondary_image = :secondary_image,
                category = :category,
                value_estimate = :value_estimate,
                note = :note
             WHERE item_id = :item_id",
            named_params! {
                ":primary_image":   self.primary_image,
                ":secondary_image": self.secondary_image,
                ":category":        self.category,
                ":value_estimate":  self.value_estimate,
                ":note":            self.note,
                ":item_id":         self.item_id,
            },
        )?;
        Ok(())
    }

    /// Move an item to another container. Returns false if the item was not
    /// in `expected_container_id`.
    pub fn set_container(
        conn: &Connection,
        item_id: i64,
        expected_container_id: i64,
        container_id: i64,
        is_parallel: bool,
    ) -> Result<bool, CatMergeError> {
        let rows = conn.execute(
            "UPDATE items SET container_id = ?, is_parallel = ?
             WHERE item_id = ? AND container_id = ?",
            params![container_id, is_parallel, item_id, expected_container_id],
        )?;
        Ok(rows == 1)
    }

    pub fn delete(conn: &Connection, item_id: i64) -> Result<(), CatMergeError> {
        let rows = conn.execute("DELETE FROM items WHERE item_id = ?", [item_id])?;
        if rows != 1 {
            return Err(CatMergeError::Error(format!(
                "Item {} vanished before it could be deleted",
                item_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_quality_field_count() {
        let bare = Item::new_for_test(1, 1, "4", "Charizard");
        assert_eq!(bare.quality_field_count(), 0);

        let base_category = bare.clone().with_quality(None, None, Some("base"), None, Some("  "));
        assert_eq!(base_category.quality_field_count(), 0);

        let rich = bare.with_quality(Some("a.png"), Some("b.png"), Some("holo"), Some(12.5), Some("1st ed"));
        assert_eq!(rich.quality_field_count(), 4);
        assert!(rich.has_primary_image());
    }

    #[test]
    fn test_absorb_quality_fills_only_missing_fields() {
        let mut survivor = Item::new_for_test(1, 1, "4", "Charizard")
            .with_quality(None, Some("keep.png"), None, None, Some("shadowless"));
        let loser = Item::new_for_test(2, 1, "4", "Charizard")
            .with_quality(Some("front.png"), Some("other.png"), Some("holo"), Some(300.0), Some("misprint"));

        let merge = survivor.absorb_quality(&loser);

        assert_eq!(merge.filled, vec!["primary_image", "category", "value_estimate", "note"]);
        assert_eq!(survivor.primary_image(), Some("front.png"));
        assert_eq!(survivor.secondary_image(), Some("keep.png"));
        assert_eq!(survivor.category(), Some("holo"));
        assert_eq!(survivor.value_estimate(), Some(300.0));
        assert_eq!(survivor.note(), Some("shadowless | misprint"));
    }

    #[test]
    fn test_absorb_quality_skips_contained_note() {
        let mut survivor = Item::new_for_test(1, 1, "4", "Charizard")
            .with_quality(None, None, None, None, Some("shadowless 1st edition"));
        let loser = Item::new_for_test(2, 1, "4", "Charizard")
            .with_quality(None, None, None, None, Some("1st edition"));

        assert!(survivor.absorb_quality(&loser).is_empty());
        assert_eq!(survivor.note(), Some("shadowless 1st edition"));
    }

    #[test]
    fn test_duplicate_candidates_scoped_and_unscoped() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let base = fx.container(&conn, "Base Set");
        let jungle = fx.container(&conn, "Jungle");

        let a = fx.item(&conn, base, "4", "Charizard");
        fx.item(&conn, base, "5", "Clefairy");
        let b = fx.item(&conn, base, "4", "Charizard");
        let c = fx.item(&conn, jungle, "1", "Clefable");
        let d = fx.item(&conn, jungle, "1", "Clefable");
        fx.item_variant(&conn, jungle, "1", "Clefable", "reverse holo");

        let all: Vec<i64> = Item::duplicate_candidates(&conn, None)
            .unwrap()
            .iter()
            .map(Item::item_id)
            .collect();
        assert_eq!(all, vec![a, b, c, d]);

        let scoped: Vec<i64> = Item::duplicate_candidates(&conn, Some(base))
            .unwrap()
            .iter()
            .map(Item::item_id)
            .collect();
        assert_eq!(scoped, vec![a, b]);
    }

    #[test]
    fn test_set_container_checks_expected_source() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let src = fx.container(&conn, "Promo");
        let dst = fx.container(&conn, "Base Set");
        let item = fx.item(&conn, src, "7", "Squirtle");

        assert!(!Item::set_container(&conn, item, dst, src, false).unwrap());
        assert!(Item::set_container(&conn, item, src, dst, true).unwrap());

        let moved = Item::get_by_id(&conn, item).unwrap().unwrap();
        assert_eq!(moved.container_id(), dst);
        assert!(moved.is_parallel());
    }
}
