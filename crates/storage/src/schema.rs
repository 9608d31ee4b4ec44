use rusqlite::Connection;
use tracing::info;

use crate::config::StoreConfig;
use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection, config: &StoreConfig) -> Result<(), StorageError> {
    conn.execute_batch(&config.pragmas())?;
    conn.execute_batch(SCHEMA_SQL)?;
    info!(version = SCHEMA_VERSION, "study plan schema ready");
    Ok(())
}

// Timestamps are unix milliseconds. Identifiers are 16-byte UUIDv7 blobs.
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS study_plans (
    study_plan_id BLOB PRIMARY KEY CHECK (length(study_plan_id) = 16),
    master_study_plan_id BLOB REFERENCES study_plans (study_plan_id)
        CHECK (master_study_plan_id IS NULL OR length(master_study_plan_id) = 16),
    name TEXT NOT NULL,
    study_plan_type TEXT NOT NULL,
    course_id TEXT NOT NULL,
    book_id TEXT NOT NULL,
    school_id INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    track_school_progress INTEGER NOT NULL DEFAULT 0,
    grades TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_study_plans_master ON study_plans (master_study_plan_id);
CREATE INDEX IF NOT EXISTS idx_study_plans_book ON study_plans (book_id) WHERE deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS study_plan_items (
    study_plan_item_id BLOB PRIMARY KEY CHECK (length(study_plan_item_id) = 16),
    study_plan_id BLOB NOT NULL REFERENCES study_plans (study_plan_id),
    content_structure TEXT NOT NULL,
    content_structure_flatten TEXT NOT NULL,
    copy_study_plan_item_id BLOB REFERENCES study_plan_items (study_plan_item_id),
    display_order INTEGER NOT NULL DEFAULT 0,
    available_from INTEGER,
    available_to INTEGER,
    start_date INTEGER,
    end_date INTEGER,
    completed_at INTEGER,
    school_date INTEGER,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER,
    CONSTRAINT study_plan_items_content_un UNIQUE (study_plan_id, content_structure_flatten)
);
CREATE INDEX IF NOT EXISTS idx_study_plan_items_copy ON study_plan_items (copy_study_plan_item_id);
";
