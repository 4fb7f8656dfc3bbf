pub const SCHEMA_VERSION: &str = "3";

pub const CREATE_SCHEMA_SQL: &str = r#"
BEGIN TRANSACTION;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', '3');

-- ========================================
-- Catalog
-- ========================================
CREATE TABLE IF NOT EXISTS containers (
    container_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    container_name  TEXT NOT NULL,
    is_active       BOOLEAN NOT NULL DEFAULT 1,
    is_canonical    BOOLEAN NOT NULL DEFAULT 0,  -- Curated container, never auto-archived
    is_protected    BOOLEAN NOT NULL DEFAULT 0,  -- Operator-protected, never auto-archived
    forces_parallel BOOLEAN NOT NULL DEFAULT 0,  -- Items moved in are flagged as inserts/parallels
    item_count      INTEGER NOT NULL DEFAULT 0   -- Cached count, recomputed by the engine
);

CREATE TABLE IF NOT EXISTS items (
    item_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    container_id    INTEGER NOT NULL,
    position_key    TEXT NOT NULL,               -- e.g. card number
    display_name    TEXT NOT NULL,
    variant         TEXT NOT NULL DEFAULT '',
    is_parallel     BOOLEAN NOT NULL DEFAULT 0,
    primary_image   TEXT,
    secondary_image TEXT,
    category        TEXT,                        -- NULL or 'base' is the default category
    value_estimate  REAL,
    note            TEXT,
    FOREIGN KEY (container_id) REFERENCES containers(container_id)
);

CREATE INDEX IF NOT EXISTS idx_items_identity ON items (container_id, position_key, display_name, variant);
CREATE INDEX IF NOT EXISTS idx_items_position ON items (container_id, position_key);

-- ========================================
-- Dependent references
-- ========================================
-- Every dependent table uses ON DELETE RESTRICT: an item that still has
-- references can never be deleted underneath them.
CREATE TABLE IF NOT EXISTS ownerships (
    ownership_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id         INTEGER NOT NULL,
    item_id         INTEGER NOT NULL,
    quantity        INTEGER NOT NULL DEFAULT 1,
    is_graded       BOOLEAN NOT NULL DEFAULT 0,
    for_trade       BOOLEAN NOT NULL DEFAULT 0,
    notes           TEXT,
    purchase_price  REAL,
    item_condition  TEXT,
    FOREIGN KEY (item_id) REFERENCES items(item_id) ON DELETE RESTRICT
);

CREATE INDEX IF NOT EXISTS idx_ownerships_item_user ON ownerships (item_id, user_id);

CREATE TABLE IF NOT EXISTS wishlists (
    wishlist_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id         INTEGER NOT NULL,
    item_id         INTEGER NOT NULL,
    quantity        INTEGER NOT NULL DEFAULT 1,
    notify_on_price BOOLEAN NOT NULL DEFAULT 0,
    notes           TEXT,
    max_price       REAL,
    FOREIGN KEY (item_id) REFERENCES items(item_id) ON DELETE RESTRICT
);

CREATE INDEX IF NOT EXISTS idx_wishlists_item_user ON wishlists (item_id, user_id);

CREATE TABLE IF NOT EXISTS listings (
    listing_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    seller_id       INTEGER NOT NULL,
    item_id         INTEGER NOT NULL,
    quantity        INTEGER NOT NULL DEFAULT 1,
    is_active       BOOLEAN NOT NULL DEFAULT 1,
    description     TEXT,
    asking_price    REAL,
    FOREIGN KEY (item_id) REFERENCES items(item_id) ON DELETE RESTRICT
);

CREATE INDEX IF NOT EXISTS idx_listings_item_seller ON listings (item_id, seller_id);

CREATE TABLE IF NOT EXISTS price_cache (
    price_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    source          TEXT NOT NULL,
    item_id         INTEGER NOT NULL,
    price           REAL,
    currency        TEXT,
    fetched_at      INTEGER,
    FOREIGN KEY (item_id) REFERENCES items(item_id) ON DELETE RESTRICT
);

CREATE INDEX IF NOT EXISTS idx_price_cache_item_source ON price_cache (item_id, source);

CREATE TABLE IF NOT EXISTS pending_review_images (
    image_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    submitter_id    INTEGER NOT NULL,
    item_id         INTEGER NOT NULL,
    image_ref       TEXT NOT NULL,
    submitted_at    INTEGER NOT NULL,
    FOREIGN KEY (item_id) REFERENCES items(item_id) ON DELETE RESTRICT
);

CREATE INDEX IF NOT EXISTS idx_pending_images_item_submitter ON pending_review_images (item_id, submitter_id);

-- ========================================
-- Audit: container moves (reversible)
-- ========================================
CREATE TABLE IF NOT EXISTS migration_logs (
    migration_log_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    initiator               TEXT NOT NULL,
    source_container_id     INTEGER NOT NULL,
    destination_container_id INTEGER NOT NULL,
    moved_item_count        INTEGER NOT NULL,
    conflict_count          INTEGER NOT NULL,
    source_archived         BOOLEAN NOT NULL,
    status                  TEXT NOT NULL,       -- completed | completed_with_conflicts | rolled_back
    created_at              INTEGER NOT NULL,
    rolled_back_at          INTEGER,
    rolled_back_by          TEXT
);

-- item_id deliberately has no foreign key: audit rows outlive the items they describe
CREATE TABLE IF NOT EXISTS migration_log_items (
    migration_log_item_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    migration_log_id        INTEGER NOT NULL,
    item_id                 INTEGER NOT NULL,
    old_container_id        INTEGER NOT NULL,
    new_container_id        INTEGER NOT NULL,
    old_is_parallel         BOOLEAN NOT NULL,
    new_is_parallel         BOOLEAN NOT NULL,
    FOREIGN KEY (migration_log_id) REFERENCES migration_logs(migration_log_id)
);

CREATE INDEX IF NOT EXISTS idx_migration_log_items_log ON migration_log_items (migration_log_id);

-- ========================================
-- Audit: dedup runs (one-way, recovery record)
-- ========================================
CREATE TABLE IF NOT EXISTS dedup_logs (
    dedup_log_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    initiator           TEXT NOT NULL,
    scope_container_id  INTEGER,                 -- NULL for a whole-catalog run
    planned_groups      INTEGER NOT NULL,
    processed_groups    INTEGER NOT NULL DEFAULT 0,
    deleted_count       INTEGER NOT NULL DEFAULT 0,
    moved_count         INTEGER NOT NULL DEFAULT 0,
    merged_count        INTEGER NOT NULL DEFAULT 0,
    batches_committed   INTEGER NOT NULL DEFAULT 0,
    status              TEXT NOT NULL,           -- in_progress | completed | halted
    failure_detail      TEXT,
    created_at          INTEGER NOT NULL,
    finished_at         INTEGER
);

CREATE TABLE IF NOT EXISTS dedup_log_entries (
    entry_id            INTEGER PRIMARY KEY AUTOINCREMENT,
    dedup_log_id        INTEGER NOT NULL,
    survivor_id         INTEGER NOT NULL,
    item_id             INTEGER NOT NULL,
    action              TEXT NOT NULL,           -- survivor | deleted | quality | moved | merged
    reference_kind      TEXT,
    reference_id        INTEGER,
    owner_key           TEXT,
    detail              TEXT,
    FOREIGN KEY (dedup_log_id) REFERENCES dedup_logs(dedup_log_id)
);

CREATE INDEX IF NOT EXISTS idx_dedup_log_entries_log ON dedup_log_entries (dedup_log_id);

COMMIT;
"#;
