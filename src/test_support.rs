//! In-memory catalog fixture for unit tests.

use rusqlite::{params, Connection};

use crate::database::{Database, DbConnection};

pub struct Fixture {
    db: Database,
}

impl Fixture {
    pub fn new() -> Self {
        Fixture {
            db: Database::open_in_memory().unwrap(),
        }
    }

    /// The pool holds a single connection: take it once per test
    pub fn conn(&self) -> DbConnection {
        self.db.get_connection().unwrap()
    }

    pub fn container(&self, conn: &Connection, name: &str) -> i64 {
        self.container_with(conn, name, false, false, false)
    }

    pub fn container_with(
        &self,
        conn: &Connection,
        name: &str,
        is_canonical: bool,
        is_protected: bool,
        forces_parallel: bool,
    ) -> i64 {
        conn.query_row(
            "INSERT INTO containers (container_name, is_canonical, is_protected, forces_parallel)
             VALUES (?, ?, ?, ?) RETURNING container_id",
            params![name, is_canonical, is_protected, forces_parallel],
            |row| row.get(0),
        )
        .unwrap()
    }

    pub fn item(&self, conn: &Connection, container_id: i64, position_key: &str, name: &str) -> i64 {
        self.item_variant(conn, container_id, position_key, name, "")
    }

    pub fn item_variant(
        &self,
        conn: &Connection,
        container_id: i64,
        position_key: &str,
        name: &str,
        variant: &str,
    ) -> i64 {
        conn.query_row(
            "INSERT INTO items (container_id, position_key, display_name, variant)
             VALUES (?, ?, ?, ?) RETURNING item_id",
            params![container_id, position_key, name, variant],
            |row| row.get(0),
        )
        .unwrap()
    }

    pub fn set_image(&self, conn: &Connection, item_id: i64, image: &str) {
        conn.execute(
            "UPDATE items SET primary_image = ? WHERE item_id = ?",
            params![image, item_id],
        )
        .unwrap();
    }

    pub fn set_parallel(&self, conn: &Connection, item_id: i64, is_parallel: bool) {
        conn.execute(
            "UPDATE items SET is_parallel = ? WHERE item_id = ?",
            params![is_parallel, item_id],
        )
        .unwrap();
    }

    pub fn ownership(
        &self,
        conn: &Connection,
        user_id: i64,
        item_id: i64,
        quantity: i64,
        notes: Option<&str>,
    ) -> i64 {
        conn.query_row(
            "INSERT INTO ownerships (user_id, item_id, quantity, notes)
             VALUES (?, ?, ?, ?) RETURNING ownership_id",
            params![user_id, item_id, quantity, notes],
            |row| row.get(0),
        )
        .unwrap()
    }

    pub fn wishlist(&self, conn: &Connection, user_id: i64, item_id: i64) -> i64 {
        conn.query_row(
            "INSERT INTO wishlists (user_id, item_id) VALUES (?, ?) RETURNING wishlist_id",
            params![user_id, item_id],
            |row| row.get(0),
        )
        .unwrap()
    }

    pub fn listing(&self, conn: &Connection, seller_id: i64, item_id: i64, quantity: i64) -> i64 {
        conn.query_row(
            "INSERT INTO listings (seller_id, item_id, quantity) VALUES (?, ?, ?) RETURNING listing_id",
            params![seller_id, item_id, quantity],
            |row| row.get(0),
        )
        .unwrap()
    }

    pub fn price(&self, conn: &Connection, source: &str, item_id: i64, price: Option<f64>) -> i64 {
        conn.query_row(
            "INSERT INTO price_cache (source, item_id, price, currency, fetched_at)
             VALUES (?, ?, ?, 'USD', 1700000000) RETURNING price_id",
            params![source, item_id, price],
            |row| row.get(0),
        )
        .unwrap()
    }

    pub fn pending_image(&self, conn: &Connection, submitter_id: i64, item_id: i64, image_ref: &str) -> i64 {
        conn.query_row(
            "INSERT INTO pending_review_images (submitter_id, item_id, image_ref, submitted_at)
             VALUES (?, ?, ?, 1700000000) RETURNING image_id",
            params![submitter_id, item_id, image_ref],
            |row| row.get(0),
        )
        .unwrap()
    }

    pub fn item_exists(&self, conn: &Connection, item_id: i64) -> bool {
        conn.query_row("SELECT EXISTS (SELECT 1 FROM items WHERE item_id = ?)", [item_id], |row| {
            row.get(0)
        })
        .unwrap()
    }

    /// Rows per (owner, item) for one reference table
    pub fn owner_count(&self, conn: &Connection, table: &str, owner_column: &str, owner: i64, item_id: i64) -> i64 {
        conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE {owner_column} = ? AND item_id = ?"),
            params![owner, item_id],
            |row| row.get(0),
        )
        .unwrap()
    }
}
