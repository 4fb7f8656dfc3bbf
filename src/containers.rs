use rusqlite::{named_params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::CatMergeError;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Container {
    container_id: i64,
    container_name: String,
    is_active: bool,
    is_canonical: bool,
    is_protected: bool,
    forces_parallel: bool,
    item_count: i64,
}

impl Container {
    const SELECT_COLUMNS: &str = "container_id, container_name, is_active, is_canonical, is_protected, forces_parallel, item_count";

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Container {
            container_id: row.get(0)?,
            container_name: row.get(1)?,
            is_active: row.get(2)?,
            is_canonical: row.get(3)?,
            is_protected: row.get(4)?,
            forces_parallel: row.get(5)?,
            item_count: row.get(6)?,
        })
    }

    pub fn get_by_id(conn: &Connection, container_id: i64) -> Result<Option<Self>, CatMergeError> {
        let sql = format!(
            "SELECT {} FROM containers WHERE container_id = ?",
            Self::SELECT_COLUMNS
        );
        conn.query_row(&sql, [container_id], Self::from_row)
            .optional()
            .map_err(CatMergeError::DatabaseError)
    }

    /// Like `get_by_id`, but a missing container is a validation error
    pub fn require(conn: &Connection, container_id: i64) -> Result<Self, CatMergeError> {
        Self::get_by_id(conn, container_id)?.ok_or_else(|| {
            CatMergeError::Validation(format!("Container {} does not exist", container_id))
        })
    }

    pub fn container_id(&self) -> i64 {
        self.container_id
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn is_canonical(&self) -> bool {
        self.is_canonical
    }

    pub fn is_protected(&self) -> bool {
        self.is_protected
    }

    pub fn forces_parallel(&self) -> bool {
        self.forces_parallel
    }

    pub fn item_count(&self) -> i64 {
        self.item_count
    }

    /// Canonical and protected containers are never archived automatically
    pub fn can_auto_archive(&self) -> bool {
        self.is_active && !self.is_canonical && !self.is_protected
    }

    /// Recount the container's items and store the result in the cached column
    pub fn recompute_item_count(conn: &Connection, container_id: i64) -> Result<i64, CatMergeError> {
        let count: i64 = conn.query_row(
            "UPDATE containers
             SET item_count = (SELECT COUNT(*) FROM items WHERE container_id = :container_id)
             WHERE container_id = :container_id
             RETURNING item_count",
            named_params! { ":container_id": container_id },
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn set_active(conn: &Connection, container_id: i64, is_active: bool) -> Result<(), CatMergeError> {
        let rows = conn.execute(
            "UPDATE containers SET is_active = :is_active WHERE container_id = :container_id",
            named_params! {
                ":is_active":       is_active,
                ":container_id":    container_id,
            },
        )?;

        if rows != 1 {
            return Err(CatMergeError::Error(format!(
                "Container {} not found while setting active flag",
                container_id
            )));
        }
        Ok(())
    }
}
