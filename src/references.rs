use std::collections::HashSet;

use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

use crate::error::CatMergeError;
use crate::items::TEXT_SEPARATOR;

/// How two references from the same owner to the same item are combined.
///
/// Every column named here is folded from the loser row into the survivor row;
/// columns not named keep the survivor's value. An empty rule keeps the
/// survivor row untouched and discards the loser row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeRule {
    /// Summed
    pub quantities: &'static [&'static str],
    /// OR-ed
    pub flags: &'static [&'static str],
    /// Appended unless already a substring
    pub notes: &'static [&'static str],
    /// Survivor's value unless it is NULL
    pub scalars: &'static [&'static str],
}

impl MergeRule {
    pub const KEEP_SURVIVOR: MergeRule = MergeRule {
        quantities: &[],
        flags: &[],
        notes: &[],
        scalars: &[],
    };

    pub fn is_keep_survivor(&self) -> bool {
        self.quantities.is_empty()
            && self.flags.is_empty()
            && self.notes.is_empty()
            && self.scalars.is_empty()
    }

    /// `SET` clause folding alias `l` (loser row) into the target row of `table`
    fn set_clause(&self, table: &str) -> String {
        let mut sets = Vec::new();
        for c in self.quantities {
            sets.push(format!("{c} = COALESCE({table}.{c}, 0) + COALESCE(l.{c}, 0)"));
        }
        for c in self.flags {
            sets.push(format!("{c} = ({table}.{c} OR l.{c})"));
        }
        for c in self.notes {
            sets.push(format!(
                "{c} = CASE
                    WHEN l.{c} IS NULL OR trim(l.{c}) = '' THEN {table}.{c}
                    WHEN {table}.{c} IS NULL OR trim({table}.{c}) = '' THEN l.{c}
                    WHEN instr({table}.{c}, l.{c}) > 0 THEN {table}.{c}
                    ELSE {table}.{c} || '{TEXT_SEPARATOR}' || l.{c}
                 END"
            ));
        }
        for c in self.scalars {
            sets.push(format!("{c} = COALESCE({table}.{c}, l.{c})"));
        }
        sets.join(",\n")
    }
}

/// Every table holding a foreign key to `items`.
///
/// Table and column names used in generated SQL come only from this enum;
/// all values are bound parameters.
#[derive(AsRefStr, EnumIter, EnumString, Debug, Display, PartialEq, Eq, Hash, Copy, Clone, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Ownership,
    Wishlist,
    Listing,
    PriceCache,
    PendingImage,
}

impl ReferenceKind {
    pub fn table(&self) -> &'static str {
        match self {
            ReferenceKind::Ownership => "ownerships",
            ReferenceKind::Wishlist => "wishlists",
            ReferenceKind::Listing => "listings",
            ReferenceKind::PriceCache => "price_cache",
            ReferenceKind::PendingImage => "pending_review_images",
        }
    }

    pub fn id_column(&self) -> &'static str {
        match self {
            ReferenceKind::Ownership => "ownership_id",
            ReferenceKind::Wishlist => "wishlist_id",
            ReferenceKind::Listing => "listing_id",
            ReferenceKind::PriceCache => "price_id",
            ReferenceKind::PendingImage => "image_id",
        }
    }

    /// Column identifying who holds the reference
    pub fn owner_column(&self) -> &'static str {
        match self {
            ReferenceKind::Ownership | ReferenceKind::Wishlist => "user_id",
            ReferenceKind::Listing => "seller_id",
            ReferenceKind::PriceCache => "source",
            ReferenceKind::PendingImage => "submitter_id",
        }
    }

    pub fn merge_rule(&self) -> MergeRule {
        match self {
            ReferenceKind::Ownership => MergeRule {
                quantities: &["quantity"],
                flags: &["is_graded", "for_trade"],
                notes: &["notes"],
                scalars: &["purchase_price", "item_condition"],
            },
            ReferenceKind::Wishlist => MergeRule {
                quantities: &["quantity"],
                flags: &["notify_on_price"],
                notes: &["notes"],
                scalars: &["max_price"],
            },
            ReferenceKind::Listing => MergeRule {
                quantities: &["quantity"],
                flags: &["is_active"],
                notes: &["description"],
                scalars: &["asking_price"],
            },
            ReferenceKind::PriceCache => MergeRule {
                quantities: &[],
                flags: &[],
                notes: &[],
                scalars: &["price", "currency", "fetched_at"],
            },
            ReferenceKind::PendingImage => MergeRule::KEEP_SURVIVOR,
        }
    }
}

/// One dependent row pointing at an item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceRow {
    pub kind: ReferenceKind,
    pub reference_id: i64,
    /// Owner value rendered as text (user id, seller id, or price source)
    pub owner_key: String,
}

pub struct References;

impl References {
    /// Ids from `item_ids` that at least one dependent row points at.
    /// One query per reference kind regardless of how many ids are asked about.
    pub fn referenced_item_ids(
        conn: &Connection,
        item_ids: &[i64],
    ) -> Result<HashSet<i64>, CatMergeError> {
        let mut referenced = HashSet::new();
        if item_ids.is_empty() {
            return Ok(referenced);
        }

        // Bind the ids as one JSON array so the statement has a fixed shape
        let ids_json = serde_json::to_string(item_ids)?;

        for kind in ReferenceKind::iter() {
            let sql = format!(
                "SELECT DISTINCT item_id FROM {} WHERE item_id IN (SELECT value FROM json_each(?))",
                kind.table()
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([&ids_json], |row| row.get::<_, i64>(0))?;
            for row in rows {
                referenced.insert(row?);
            }
        }

        Ok(referenced)
    }

    pub fn for_item(
        conn: &Connection,
        kind: ReferenceKind,
        item_id: i64,
    ) -> Result<Vec<ReferenceRow>, CatMergeError> {
        let sql = format!(
            "SELECT {id}, CAST({owner} AS TEXT) FROM {table} WHERE item_id = ? ORDER BY {id} ASC",
            id = kind.id_column(),
            owner = kind.owner_column(),
            table = kind.table(),
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([item_id], |row| {
                Ok(ReferenceRow {
                    kind,
                    reference_id: row.get(0)?,
                    owner_key: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// First row (lowest id) from `owner_key` that already targets `item_id`
    pub fn find_for_owner(
        conn: &Connection,
        kind: ReferenceKind,
        item_id: i64,
        owner_key: &str,
    ) -> Result<Option<i64>, CatMergeError> {
        let sql = format!(
            "SELECT {id} FROM {table} WHERE item_id = ? AND CAST({owner} AS TEXT) = ?
             ORDER BY {id} ASC LIMIT 1",
            id = kind.id_column(),
            owner = kind.owner_column(),
            table = kind.table(),
        );
        let id = conn
            .query_row(&sql, params![item_id, owner_key], |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    /// Point a reference row at a different item
    pub fn retarget(
        conn: &Connection,
        kind: ReferenceKind,
        reference_id: i64,
        item_id: i64,
    ) -> Result<(), CatMergeError> {
        let sql = format!(
            "UPDATE {table} SET item_id = ? WHERE {id} = ?",
            table = kind.table(),
            id = kind.id_column(),
        );
        Self::expect_one(conn.execute(&sql, params![item_id, reference_id])?, kind, reference_id)
    }

    /// Fold `loser_ref` into `survivor_ref` per the kind's merge rule, then delete `loser_ref`
    pub fn merge_into(
        conn: &Connection,
        kind: ReferenceKind,
        survivor_ref: i64,
        loser_ref: i64,
    ) -> Result<(), CatMergeError> {
        let rule = kind.merge_rule();
        let table = kind.table();
        let id = kind.id_column();

        if !rule.is_keep_survivor() {
            let sql = format!(
                "UPDATE {table} SET {sets}
                 FROM {table} AS l
                 WHERE {table}.{id} = ? AND l.{id} = ?",
                sets = rule.set_clause(table),
            );
            Self::expect_one(conn.execute(&sql, params![survivor_ref, loser_ref])?, kind, survivor_ref)?;
        }

        let sql = format!("DELETE FROM {table} WHERE {id} = ?");
        Self::expect_one(conn.execute(&sql, [loser_ref])?, kind, loser_ref)
    }

    /// Total dependent rows pointing at any of `item_ids`
    pub fn count_for_items(conn: &Connection, item_ids: &[i64]) -> Result<i64, CatMergeError> {
        if item_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; item_ids.len()].join(", ");
        let mut total = 0;
        for kind in ReferenceKind::iter() {
            let sql = format!(
                "SELECT COUNT(*) FROM {} WHERE item_id IN ({})",
                kind.table(),
                placeholders
            );
            let count: i64 = conn.query_row(&sql, params_from_iter(item_ids.iter()), |row| row.get(0))?;
            total += count;
        }
        Ok(total)
    }

    /// Column values of one reference row as a JSON object
    pub fn snapshot(conn: &Connection, kind: ReferenceKind, reference_id: i64) -> Result<String, CatMergeError> {
        let sql = format!(
            "SELECT * FROM {table} WHERE {id} = ?",
            table = kind.table(),
            id = kind.id_column(),
        );
        let mut stmt = conn.prepare(&sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(str::to_owned).collect();

        let values = stmt
            .query_row([reference_id], |row| {
                let mut values = serde_json::Map::new();
                for (i, name) in names.iter().enumerate() {
                    let value = match row.get_ref(i)? {
                        ValueRef::Null => serde_json::Value::Null,
                        ValueRef::Integer(v) => v.into(),
                        ValueRef::Real(v) => v.into(),
                        ValueRef::Text(v) => String::from_utf8_lossy(v).into_owned().into(),
                        ValueRef::Blob(v) => hex::encode(v).into(),
                    };
                    values.insert(name.clone(), value);
                }
                Ok(values)
            })
            .optional()?
            .ok_or_else(|| CatMergeError::Error(format!("{} row {} not found", kind, reference_id)))?;

        Ok(serde_json::Value::Object(values).to_string())
    }

    fn expect_one(rows: usize, kind: ReferenceKind, reference_id: i64) -> Result<(), CatMergeError> {
        if rows != 1 {
            return Err(CatMergeError::Error(format!(
                "{} row {} not found (affected {} rows)",
                kind, reference_id, rows
            )));
        }
        Ok(())
    }
}
