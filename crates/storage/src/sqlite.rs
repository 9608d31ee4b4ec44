use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params, params_from_iter};
use tracing::{debug, info, warn};

use studyplan_core::{
    content::ContentStructure,
    ids::*,
    model::{StudyPlan, StudyPlanItem, StudyPlanItemStatus, StudyPlanStatus, StudyPlanType},
};

use crate::config::StoreConfig;
use crate::error::{StorageError, classify};
use crate::traits::{
    CopiedItemUpdate, CopyOutcome, DateUpdate, PlanCopy, Reconciled, StudyPlanStore,
};

const PLAN_COLUMNS: &str = "study_plan_id, master_study_plan_id, name, study_plan_type, course_id, \
    book_id, school_id, status, track_school_progress, grades, created_at, updated_at, deleted_at";

const ITEM_COLUMNS: &str = "study_plan_item_id, study_plan_id, content_structure, \
    content_structure_flatten, copy_study_plan_item_id, display_order, available_from, \
    available_to, start_date, end_date, completed_at, school_date, status, created_at, \
    updated_at, deleted_at";

const ITEM_PLACEHOLDERS: &str = "?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16";

const PLAN_PLACEHOLDERS: &str = "?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13";

fn ts(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn ts_value(at: Option<DateTime<Utc>>) -> Value {
    at.map_or(Value::Null, |t| Value::Integer(ts(t)))
}

fn from_ts(ms: i64, label: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::Serialization(format!("invalid {label} timestamp {ms}")))
}

fn from_ts_opt(ms: Option<i64>, label: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
    ms.map(|ms| from_ts(ms, label)).transpose()
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
}

fn blob(bytes: &[u8; 16]) -> Value {
    Value::Blob(bytes.to_vec())
}

fn plan_values(plan: &StudyPlan) -> Result<Vec<Value>, StorageError> {
    let grades = serde_json::to_string(&plan.grades)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(vec![
        blob(plan.study_plan_id.as_bytes()),
        plan.master_study_plan_id
            .map_or(Value::Null, |m| blob(m.as_bytes())),
        Value::Text(plan.name.clone()),
        Value::Text(plan.study_plan_type.as_str().to_string()),
        Value::Text(plan.course_id.clone()),
        Value::Text(plan.book_id.clone()),
        Value::Integer(i64::from(plan.school_id)),
        Value::Text(plan.status.as_str().to_string()),
        Value::Integer(i64::from(plan.track_school_progress)),
        Value::Text(grades),
        Value::Integer(ts(plan.created_at)),
        Value::Integer(ts(plan.updated_at)),
        ts_value(plan.deleted_at),
    ])
}

fn item_values(item: &StudyPlanItem) -> Result<Vec<Value>, StorageError> {
    Ok(vec![
        blob(item.study_plan_item_id.as_bytes()),
        blob(item.study_plan_id.as_bytes()),
        Value::Text(item.content_structure.to_json()?),
        Value::Text(item.content_key.clone()),
        item.copy_study_plan_item_id
            .map_or(Value::Null, |c| blob(c.as_bytes())),
        Value::Integer(i64::from(item.display_order)),
        ts_value(item.available_from),
        ts_value(item.available_to),
        ts_value(item.start_date),
        ts_value(item.end_date),
        ts_value(item.completed_at),
        ts_value(item.school_date),
        Value::Text(item.status.as_str().to_string()),
        Value::Integer(ts(item.created_at)),
        Value::Integer(ts(item.updated_at)),
        ts_value(item.deleted_at),
    ])
}

fn read_plan(row: &Row) -> Result<StudyPlan, StorageError> {
    let id_bytes: Vec<u8> = row.get(0)?;
    let master_bytes: Option<Vec<u8>> = row.get(1)?;
    let study_plan_type: String = row.get(3)?;
    let status: String = row.get(7)?;
    let grades: String = row.get(9)?;

    Ok(StudyPlan {
        study_plan_id: StudyPlanId::from_slice(&id_bytes)?,
        master_study_plan_id: master_bytes
            .map(|b| StudyPlanId::from_slice(&b))
            .transpose()?,
        name: row.get(2)?,
        study_plan_type: StudyPlanType::parse(&study_plan_type)?,
        course_id: row.get(4)?,
        book_id: row.get(5)?,
        school_id: row.get(6)?,
        status: StudyPlanStatus::parse(&status)?,
        track_school_progress: row.get(8)?,
        grades: serde_json::from_str(&grades)
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        created_at: from_ts(row.get(10)?, "created_at")?,
        updated_at: from_ts(row.get(11)?, "updated_at")?,
        deleted_at: from_ts_opt(row.get(12)?, "deleted_at")?,
    })
}

fn read_item(row: &Row) -> Result<StudyPlanItem, StorageError> {
    let id_bytes: Vec<u8> = row.get(0)?;
    let plan_bytes: Vec<u8> = row.get(1)?;
    let content_structure: String = row.get(2)?;
    let copy_bytes: Option<Vec<u8>> = row.get(4)?;
    let status: String = row.get(12)?;

    Ok(StudyPlanItem {
        study_plan_item_id: StudyPlanItemId::from_slice(&id_bytes)?,
        study_plan_id: StudyPlanId::from_slice(&plan_bytes)?,
        content_structure: ContentStructure::from_json(&content_structure)?,
        content_key: row.get(3)?,
        copy_study_plan_item_id: copy_bytes
            .map(|b| StudyPlanItemId::from_slice(&b))
            .transpose()?,
        display_order: row.get(5)?,
        available_from: from_ts_opt(row.get(6)?, "available_from")?,
        available_to: from_ts_opt(row.get(7)?, "available_to")?,
        start_date: from_ts_opt(row.get(8)?, "start_date")?,
        end_date: from_ts_opt(row.get(9)?, "end_date")?,
        completed_at: from_ts_opt(row.get(10)?, "completed_at")?,
        school_date: from_ts_opt(row.get(11)?, "school_date")?,
        status: StudyPlanItemStatus::parse(&status)?,
        created_at: from_ts(row.get(13)?, "created_at")?,
        updated_at: from_ts(row.get(14)?, "updated_at")?,
        deleted_at: from_ts_opt(row.get(15)?, "deleted_at")?,
    })
}

/// Tunnel a StorageError through rusqlite's error type inside row closures.
fn tunnel(e: StorageError) -> rusqlite::Error {
    match e {
        StorageError::Sqlite(sq) => sq,
        other => rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Blob,
            Box::new(OpaqueStorageError(other.to_string())),
        ),
    }
}

fn query_plans(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<StudyPlan>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let plans = stmt
        .query_map(params, |row| read_plan(row).map_err(tunnel))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(plans)
}

fn query_items(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<StudyPlanItem>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let items = stmt
        .query_map(params, |row| read_item(row).map_err(tunnel))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

fn query_plan_ids(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<StudyPlanId>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let raw = stmt
        .query_map(params, |row| row.get::<_, Vec<u8>>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    raw.iter()
        .map(|b| StudyPlanId::from_slice(b).map_err(StorageError::from))
        .collect()
}

/// Insert a copy of `source` into `target`, or refresh the display order of
/// the copy already there.
fn copy_item_into(
    tx: &Transaction,
    source: &StudyPlanItem,
    target: StudyPlanId,
    now: DateTime<Utc>,
    outcome: &mut CopyOutcome,
) -> Result<(), StorageError> {
    let copy = StudyPlanItem {
        study_plan_item_id: StudyPlanItemId::new(),
        study_plan_id: target,
        copy_study_plan_item_id: Some(source.study_plan_item_id),
        school_date: None,
        created_at: now,
        updated_at: now,
        ..source.clone()
    };

    let sql = format!(
        "INSERT INTO study_plan_items ({ITEM_COLUMNS}) VALUES ({ITEM_PLACEHOLDERS})
         ON CONFLICT (study_plan_id, content_structure_flatten) DO UPDATE SET
            display_order = excluded.display_order
         RETURNING study_plan_item_id"
    );
    let returned: Vec<u8> = tx
        .prepare_cached(&sql)?
        .query_row(params_from_iter(item_values(&copy)?), |row| row.get(0))
        .map_err(|e| {
            classify(e, || {
                format!("copying item {} into plan {target}", source.study_plan_item_id)
            })
        })?;

    if returned.as_slice() == copy.study_plan_item_id.as_bytes() {
        outcome.inserted += 1;
    } else {
        outcome.refreshed += 1;
    }
    Ok(())
}

fn copy_plans_in(tx: &Transaction, source_ids: &[StudyPlanId]) -> Result<Vec<PlanCopy>, StorageError> {
    let sql = format!(
        "INSERT INTO study_plans ({PLAN_COLUMNS})
         SELECT ?1, study_plan_id, name, study_plan_type, course_id, book_id, school_id, status,
                track_school_progress, grades, created_at, updated_at, deleted_at
         FROM study_plans WHERE study_plan_id = ?2"
    );
    let mut stmt = tx.prepare_cached(&sql)?;

    let mut copies = Vec::with_capacity(source_ids.len());
    for source in source_ids {
        let copy = StudyPlanId::new();
        let n = stmt.execute(params![
            copy.as_bytes().as_slice(),
            source.as_bytes().as_slice()
        ])?;
        if n == 0 {
            warn!(%source, requested = source_ids.len(), copied = copies.len(), "plan copy source missing");
            return Err(StorageError::Integrity(format!(
                "copied {} of {} study plans; source {source} does not exist",
                copies.len(),
                source_ids.len()
            )));
        }
        copies.push(PlanCopy {
            source: *source,
            copy,
        });
    }

    Ok(copies)
}

fn copy_items_in(
    tx: &Transaction,
    sources: &[StudyPlanId],
    targets: &[StudyPlanId],
    now: DateTime<Utc>,
) -> Result<CopyOutcome, StorageError> {
    if sources.len() != targets.len() {
        warn!(sources = sources.len(), targets = targets.len(), "item copy cardinality mismatch");
        return Err(StorageError::Integrity(format!(
            "{} source plans but {} target plans",
            sources.len(),
            targets.len()
        )));
    }

    let select = format!(
        "SELECT {ITEM_COLUMNS} FROM study_plan_items
         WHERE study_plan_id = ?1 AND deleted_at IS NULL
         ORDER BY display_order, study_plan_item_id"
    );

    let mut master_of = tx.prepare_cached(
        "SELECT master_study_plan_id FROM study_plans WHERE study_plan_id = ?1",
    )?;

    let mut outcome = CopyOutcome::default();
    for (source, target) in sources.iter().zip(targets) {
        let master: Option<Vec<u8>> = master_of
            .query_row(params![target.as_bytes().as_slice()], |row| row.get(0))
            .optional()?
            .ok_or_else(|| StorageError::NotFound(format!("study plan {target}")))?;
        if master.as_deref() != Some(source.as_bytes().as_slice()) {
            warn!(%source, %target, "item copy target is not a copy of its source");
            return Err(StorageError::Integrity(format!(
                "study plan {target} is not a copy of {source}"
            )));
        }
        let items = query_items(tx, &select, params![source.as_bytes().as_slice()])?;
        for item in &items {
            copy_item_into(tx, item, *target, now, &mut outcome)?;
        }
        debug!(%source, %target, items = items.len(), "copied plan items");
    }
    Ok(outcome)
}

fn execute_per_id<I>(
    tx: &Transaction,
    sql: &str,
    ids: &[I],
    bytes: impl Fn(&I) -> &[u8; 16],
    at: DateTime<Utc>,
) -> Result<usize, StorageError> {
    let mut stmt = tx.prepare_cached(sql)?;
    let mut affected = 0;
    for id in ids {
        affected += stmt.execute(params![ts(at), bytes(id).as_slice()])?;
    }
    Ok(affected)
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        Self::open_with_config(&StoreConfig::at(path))
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::open_with_config(&StoreConfig::in_memory())
    }

    pub fn open_with_config(config: &StoreConfig) -> Result<Self, StorageError> {
        config.validate()?;
        let conn = match &config.path {
            Some(path) => {
                info!(path = %path.display(), "opening study plan store");
                Connection::open(path)?
            }
            None => {
                debug!("opening in-memory study plan store");
                Connection::open_in_memory()?
            }
        };
        crate::schema::init_schema(&conn, config)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn write_tx(&mut self) -> Result<Transaction<'_>, StorageError> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }
}

impl StudyPlanStore for SqliteStore {
    fn sync_items(
        &mut self,
        items: &mut [StudyPlanItem],
    ) -> Result<Reconciled<StudyPlanItemId>, StorageError> {
        let mut result = Reconciled::default();
        if items.is_empty() {
            return Ok(result);
        }

        let tx = self.write_tx()?;
        {
            let sql = format!(
                "INSERT INTO study_plan_items ({ITEM_COLUMNS}) VALUES ({ITEM_PLACEHOLDERS})
                 ON CONFLICT (study_plan_id, content_structure_flatten) DO UPDATE SET
                    display_order = excluded.display_order,
                    status = excluded.status,
                    updated_at = excluded.updated_at
                 RETURNING study_plan_item_id"
            );
            let mut existing = tx.prepare_cached(
                "SELECT study_plan_item_id FROM study_plan_items
                 WHERE study_plan_id = ?1 AND content_structure_flatten = ?2",
            )?;
            let mut stmt = tx.prepare_cached(&sql)?;

            // Candidates are remapped only after commit.
            let mut remaps = Vec::new();
            for (i, item) in items.iter().enumerate() {
                let prior: Option<Vec<u8>> = existing
                    .query_row(
                        params![item.study_plan_id.as_bytes().as_slice(), item.content_key],
                        |row| row.get(0),
                    )
                    .optional()?;
                let returned: Vec<u8> = stmt
                    .query_row(params_from_iter(item_values(item)?), |row| row.get(0))
                    .map_err(|e| {
                        classify(e, || {
                            format!(
                                "study plan item {} ({})",
                                item.study_plan_item_id, item.content_key
                            )
                        })
                    })?;
                let returned = StudyPlanItemId::from_slice(&returned)?;

                match prior {
                    None if returned == item.study_plan_item_id => result.inserted.push(returned),
                    None => {
                        return Err(StorageError::Integrity(format!(
                            "study plan item {} was inserted as {returned}",
                            item.study_plan_item_id
                        )));
                    }
                    Some(_) if returned == item.study_plan_item_id => result.updated.push(returned),
                    Some(_) => {
                        result.remapped.push((item.study_plan_item_id, returned));
                        remaps.push((i, returned));
                    }
                }
            }
            drop(existing);
            drop(stmt);
            tx.commit()?;

            for (i, existing) in remaps {
                items[i].study_plan_item_id = existing;
            }
        }

        debug!(
            candidates = items.len(),
            inserted = result.inserted.len(),
            updated = result.updated.len(),
            remapped = result.remapped.len(),
            "synced study plan items"
        );
        Ok(result)
    }

    fn upsert_items(&mut self, items: &[StudyPlanItem]) -> Result<(), StorageError> {
        if items.is_empty() {
            return Ok(());
        }
        let tx = self.write_tx()?;
        {
            let sql = format!(
                "INSERT INTO study_plan_items ({ITEM_COLUMNS}) VALUES ({ITEM_PLACEHOLDERS})
                 ON CONFLICT (study_plan_item_id) DO UPDATE SET
                    available_from = excluded.available_from,
                    available_to = excluded.available_to,
                    start_date = excluded.start_date,
                    end_date = excluded.end_date,
                    updated_at = excluded.updated_at,
                    content_structure = excluded.content_structure,
                    content_structure_flatten = excluded.content_structure_flatten,
                    display_order = excluded.display_order,
                    status = excluded.status,
                    school_date = COALESCE(excluded.school_date, study_plan_items.school_date)"
            );
            let mut stmt = tx.prepare_cached(&sql)?;
            for item in items {
                stmt.execute(params_from_iter(item_values(item)?))
                    .map_err(|e| {
                        classify(e, || {
                            format!(
                                "study plan item {} ({})",
                                item.study_plan_item_id, item.content_key
                            )
                        })
                    })?;
            }
        }
        tx.commit()?;
        debug!(items = items.len(), "upserted study plan items");
        Ok(())
    }

    fn upsert_plans(&mut self, plans: &[StudyPlan]) -> Result<Reconciled<StudyPlanId>, StorageError> {
        let mut result = Reconciled::default();
        if plans.is_empty() {
            return Ok(result);
        }

        let tx = self.write_tx()?;
        {
            let sql = format!(
                "INSERT INTO study_plans ({PLAN_COLUMNS}) VALUES ({PLAN_PLACEHOLDERS})
                 ON CONFLICT (study_plan_id) DO UPDATE SET
                    name = excluded.name,
                    study_plan_type = excluded.study_plan_type,
                    updated_at = excluded.updated_at,
                    school_id = excluded.school_id,
                    deleted_at = NULL"
            );
            let mut exists = tx.prepare_cached("SELECT 1 FROM study_plans WHERE study_plan_id = ?1")?;
            let mut master_content = tx.prepare_cached(
                "SELECT course_id, book_id FROM study_plans WHERE study_plan_id = ?1",
            )?;
            let mut upsert = tx.prepare_cached(&sql)?;

            for plan in plans {
                if let Some(master) = plan.master_study_plan_id {
                    let (course_id, book_id): (String, String) = master_content
                        .query_row(params![master.as_bytes().as_slice()], |row| {
                            Ok((row.get(0)?, row.get(1)?))
                        })
                        .optional()?
                        .ok_or_else(|| StorageError::NotFound(format!("master study plan {master}")))?;
                    if course_id != plan.course_id || book_id != plan.book_id {
                        warn!(plan = %plan.study_plan_id, %master, "plan content differs from its master");
                        return Err(StorageError::Integrity(format!(
                            "study plan {} has course {}/book {} but its master {master} has {course_id}/{book_id}",
                            plan.study_plan_id, plan.course_id, plan.book_id
                        )));
                    }
                }
                let existed = exists
                    .query_row(params![plan.study_plan_id.as_bytes().as_slice()], |_| Ok(()))
                    .optional()?
                    .is_some();
                upsert
                    .execute(params_from_iter(plan_values(plan)?))
                    .map_err(|e| classify(e, || format!("study plan {}", plan.study_plan_id)))?;
                if existed {
                    result.updated.push(plan.study_plan_id);
                } else {
                    result.inserted.push(plan.study_plan_id);
                }
            }
        }
        tx.commit()?;
        debug!(
            plans = plans.len(),
            inserted = result.inserted.len(),
            "upserted study plans"
        );
        Ok(result)
    }

    fn copy_plans(&mut self, source_ids: &[StudyPlanId]) -> Result<Vec<PlanCopy>, StorageError> {
        if source_ids.is_empty() {
            return Ok(Vec::new());
        }
        let tx = self.write_tx()?;
        let copies = copy_plans_in(&tx, source_ids)?;
        tx.commit()?;
        info!(copies = copies.len(), "copied study plans");
        Ok(copies)
    }

    fn copy_items(
        &mut self,
        sources: &[StudyPlanId],
        targets: &[StudyPlanId],
        now: DateTime<Utc>,
    ) -> Result<CopyOutcome, StorageError> {
        let tx = self.write_tx()?;
        let outcome = copy_items_in(&tx, sources, targets, now)?;
        tx.commit()?;
        Ok(outcome)
    }

    fn copy_plan_trees(
        &mut self,
        source_ids: &[StudyPlanId],
        now: DateTime<Utc>,
    ) -> Result<Vec<PlanCopy>, StorageError> {
        if source_ids.is_empty() {
            return Ok(Vec::new());
        }
        let tx = self.write_tx()?;
        let copies = copy_plans_in(&tx, source_ids)?;
        let sources: Vec<StudyPlanId> = copies.iter().map(|c| c.source).collect();
        let targets: Vec<StudyPlanId> = copies.iter().map(|c| c.copy).collect();
        let outcome = copy_items_in(&tx, &sources, &targets, now)?;
        tx.commit()?;
        info!(
            copies = copies.len(),
            items = outcome.inserted,
            "copied study plan trees"
        );
        Ok(copies)
    }

    fn copy_items_to_dependents(
        &mut self,
        item_ids: &[StudyPlanItemId],
        now: DateTime<Utc>,
    ) -> Result<CopyOutcome, StorageError> {
        let mut outcome = CopyOutcome::default();
        if item_ids.is_empty() {
            return Ok(outcome);
        }

        let tx = self.write_tx()?;
        let select_item = format!(
            "SELECT {ITEM_COLUMNS} FROM study_plan_items
             WHERE study_plan_item_id = ?1 AND deleted_at IS NULL"
        );
        for id in item_ids {
            let item = query_items(&tx, &select_item, params![id.as_bytes().as_slice()])?
                .pop()
                .ok_or_else(|| StorageError::NotFound(format!("study plan item {id}")))?;
            let dependents = query_plan_ids(
                &tx,
                "SELECT study_plan_id FROM study_plans
                 WHERE master_study_plan_id = ?1 AND deleted_at IS NULL
                 ORDER BY study_plan_id",
                params![item.study_plan_id.as_bytes().as_slice()],
            )?;
            for target in dependents {
                copy_item_into(&tx, &item, target, now, &mut outcome)?;
            }
        }
        tx.commit()?;
        debug!(
            items = item_ids.len(),
            inserted = outcome.inserted,
            refreshed = outcome.refreshed,
            "propagated items to dependent plans"
        );
        Ok(outcome)
    }

    fn update_copied_items(
        &mut self,
        updates: &[CopiedItemUpdate],
        now: DateTime<Utc>,
    ) -> Result<Vec<StudyPlanItem>, StorageError> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }

        let tx = self.write_tx()?;
        let mut updated = Vec::with_capacity(updates.len());
        {
            let sql = format!(
                "UPDATE study_plan_items SET
                    available_from = ?1,
                    start_date = ?2,
                    end_date = ?3,
                    available_to = ?4,
                    display_order = ?5,
                    status = ?6,
                    updated_at = ?7,
                    deleted_at = NULL
                 WHERE copy_study_plan_item_id = ?8 AND study_plan_id = ?9
                 RETURNING {ITEM_COLUMNS}"
            );
            let mut stmt = tx.prepare_cached(&sql)?;
            for update in updates {
                let rows = stmt
                    .query_map(
                        params![
                            update.available_from.map(ts),
                            update.start_date.map(ts),
                            update.end_date.map(ts),
                            update.available_to.map(ts),
                            update.display_order,
                            update.status.as_str(),
                            ts(now),
                            update.copy_of.as_bytes().as_slice(),
                            update.study_plan_id.as_bytes().as_slice(),
                        ],
                        |row| read_item(row).map_err(tunnel),
                    )?
                    .collect::<Result<Vec<_>, _>>()?;

                match rows.len() {
                    0 => {
                        return Err(StorageError::NotFound(format!(
                            "copy of study plan item {} in plan {}",
                            update.copy_of, update.study_plan_id
                        )));
                    }
                    1 => updated.extend(rows),
                    n => {
                        warn!(copy_of = %update.copy_of, rows = n, "copied item update hit several rows");
                        return Err(StorageError::Integrity(format!(
                            "{n} copies of study plan item {} in plan {}",
                            update.copy_of, update.study_plan_id
                        )));
                    }
                }
            }
        }
        tx.commit()?;
        debug!(items = updated.len(), "re-activated copied items");
        Ok(updated)
    }

    fn soft_delete_plan_tree(
        &mut self,
        root: StudyPlanId,
        now: DateTime<Utc>,
    ) -> Result<Vec<StudyPlanId>, StorageError> {
        let tx = self.write_tx()?;
        // UNION (not UNION ALL) so a malformed cycle terminates.
        let ids = query_plan_ids(
            &tx,
            "WITH RECURSIVE lineage (study_plan_id) AS (
                SELECT study_plan_id FROM study_plans
                WHERE study_plan_id = ?1 AND master_study_plan_id IS NULL
                UNION
                SELECT sp.study_plan_id
                FROM study_plans sp JOIN lineage l ON sp.master_study_plan_id = l.study_plan_id
            )
            SELECT study_plan_id FROM lineage
            ORDER BY study_plan_id = ?1 DESC, study_plan_id",
            params![root.as_bytes().as_slice()],
        )?;

        execute_per_id(
            &tx,
            "UPDATE study_plans SET deleted_at = COALESCE(deleted_at, ?1) WHERE study_plan_id = ?2",
            &ids,
            |id: &StudyPlanId| id.as_bytes(),
            now,
        )?;
        tx.commit()?;
        info!(%root, plans = ids.len(), "soft-deleted study plan lineage");
        Ok(ids)
    }

    fn find_dependent_plans(&self, master_ids: &[StudyPlanId]) -> Result<Vec<StudyPlanId>, StorageError> {
        if master_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT study_plan_id FROM study_plans
             WHERE master_study_plan_id IN ({}) AND deleted_at IS NULL
             ORDER BY study_plan_id",
            placeholders(master_ids.len())
        );
        query_plan_ids(
            &self.conn,
            &sql,
            params_from_iter(master_ids.iter().map(|id| id.as_bytes().to_vec())),
        )
    }

    fn update_plan_lineage(&mut self, plan: &StudyPlan, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let grades = serde_json::to_string(&plan.grades)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let tx = self.write_tx()?;
        let n = tx.execute(
            "UPDATE study_plans SET
                updated_at = ?1, name = ?2, track_school_progress = ?3, grades = ?4, status = ?5
             WHERE (study_plan_id = ?6 OR master_study_plan_id = ?6) AND deleted_at IS NULL",
            params![
                ts(now),
                plan.name,
                plan.track_school_progress,
                grades,
                plan.status.as_str(),
                plan.study_plan_id.as_bytes().as_slice(),
            ],
        )?;
        if n == 0 {
            return Err(StorageError::NotFound(format!("study plan {}", plan.study_plan_id)));
        }
        tx.commit()?;
        debug!(plan = %plan.study_plan_id, rows = n, "updated plan lineage");
        Ok(n)
    }

    fn update_book_lineage(
        &mut self,
        books: &[(StudyPlanId, String)],
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        if books.is_empty() {
            return Ok(());
        }
        let tx = self.write_tx()?;
        {
            let mut stmt = tx.prepare_cached(
                "WITH RECURSIVE lineage (study_plan_id) AS (
                     SELECT study_plan_id FROM study_plans WHERE study_plan_id = ?3
                     UNION
                     SELECT sp.study_plan_id FROM study_plans sp
                     JOIN lineage l ON sp.master_study_plan_id = l.study_plan_id
                 )
                 UPDATE study_plans SET book_id = ?1, updated_at = ?2
                 WHERE study_plan_id IN (SELECT study_plan_id FROM lineage)",
            )?;
            for (plan_id, book_id) in books {
                let n = stmt.execute(params![book_id, ts(now), plan_id.as_bytes().as_slice()])?;
                if n == 0 {
                    return Err(StorageError::NotFound(format!("study plan {plan_id}")));
                }
                debug!(plan = %plan_id, %book_id, rows = n, "updated book lineage");
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn soft_delete_plans(&mut self, ids: &[StudyPlanId], now: DateTime<Utc>) -> Result<usize, StorageError> {
        let tx = self.write_tx()?;
        let n = execute_per_id(
            &tx,
            "UPDATE study_plans SET deleted_at = ?1 WHERE study_plan_id = ?2 AND deleted_at IS NULL",
            ids,
            |id: &StudyPlanId| id.as_bytes(),
            now,
        )?;
        tx.commit()?;
        Ok(n)
    }

    fn soft_delete_items_by_plans(
        &mut self,
        plan_ids: &[StudyPlanId],
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let tx = self.write_tx()?;
        let n = execute_per_id(
            &tx,
            "UPDATE study_plan_items SET deleted_at = ?1 WHERE study_plan_id = ?2 AND deleted_at IS NULL",
            plan_ids,
            |id: &StudyPlanId| id.as_bytes(),
            now,
        )?;
        tx.commit()?;
        debug!(plans = plan_ids.len(), items = n, "soft-deleted items of plans");
        Ok(n)
    }

    fn soft_delete_items(&mut self, ids: &[StudyPlanItemId], now: DateTime<Utc>) -> Result<usize, StorageError> {
        let tx = self.write_tx()?;
        let n = execute_per_id(
            &tx,
            "UPDATE study_plan_items SET deleted_at = ?1 WHERE study_plan_item_id = ?2 AND deleted_at IS NULL",
            ids,
            |id: &StudyPlanItemId| id.as_bytes(),
            now,
        )?;
        tx.commit()?;
        Ok(n)
    }

    fn set_item_completed(
        &mut self,
        id: StudyPlanItemId,
        completed_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let n = self.conn.execute(
            "UPDATE study_plan_items SET completed_at = ?1, updated_at = ?2
             WHERE study_plan_item_id = ?3 AND deleted_at IS NULL",
            params![completed_at.map(ts), ts(now), id.as_bytes().as_slice()],
        )?;
        if n == 0 {
            return Err(StorageError::NotFound(format!("study plan item {id}")));
        }
        Ok(())
    }

    fn update_items_dates(
        &mut self,
        ids: &[StudyPlanItemId],
        update: DateUpdate,
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        // ?1 updated_at, ?2 start, ?3 end, ?4 item id
        let (set, guard, start, end) = match update {
            DateUpdate::Both { start, end } => (
                "start_date = ?2, end_date = ?3",
                "available_from <= ?2 AND (available_to > ?3 OR available_to IS NULL)",
                Some(start),
                Some(end),
            ),
            DateUpdate::Start(start) => ("start_date = ?2", "available_from <= ?2", Some(start), None),
            DateUpdate::End(end) => (
                "end_date = ?3",
                "(available_to > ?3 OR available_to IS NULL)",
                None,
                Some(end),
            ),
        };
        let sql = format!(
            "UPDATE study_plan_items SET updated_at = ?1, {set}
             WHERE study_plan_item_id = ?4 AND deleted_at IS NULL AND {guard}"
        );

        let tx = self.write_tx()?;
        let mut affected = 0;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for id in ids {
                affected += stmt.execute(params![
                    ts(now),
                    start.map(ts),
                    end.map(ts),
                    id.as_bytes().as_slice()
                ])?;
            }
        }
        tx.commit()?;
        Ok(affected)
    }

    fn update_items_status(
        &mut self,
        ids: &[StudyPlanItemId],
        status: StudyPlanItemStatus,
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let tx = self.write_tx()?;
        let mut affected = 0;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE study_plan_items SET status = ?1, updated_at = ?2
                 WHERE study_plan_item_id = ?3 AND deleted_at IS NULL",
            )?;
            for id in ids {
                affected += stmt.execute(params![status.as_str(), ts(now), id.as_bytes().as_slice()])?;
            }
        }
        tx.commit()?;
        Ok(affected)
    }

    fn update_school_date(
        &mut self,
        ids: &[StudyPlanItemId],
        school_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let tx = self.write_tx()?;
        let mut affected = 0;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE study_plan_items SET school_date = ?1, updated_at = ?2
                 WHERE study_plan_item_id = ?3 AND deleted_at IS NULL",
            )?;
            for id in ids {
                affected += stmt.execute(params![school_date.map(ts), ts(now), id.as_bytes().as_slice()])?;
            }
        }
        tx.commit()?;
        Ok(affected)
    }

    fn get_plan(&self, id: StudyPlanId) -> Result<Option<StudyPlan>, StorageError> {
        let sql = format!("SELECT {PLAN_COLUMNS} FROM study_plans WHERE study_plan_id = ?1");
        Ok(query_plans(&self.conn, &sql, params![id.as_bytes().as_slice()])?.pop())
    }

    fn get_plans(&self, ids: &[StudyPlanId]) -> Result<Vec<StudyPlan>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {PLAN_COLUMNS} FROM study_plans WHERE study_plan_id IN ({}) ORDER BY study_plan_id",
            placeholders(ids.len())
        );
        query_plans(
            &self.conn,
            &sql,
            params_from_iter(ids.iter().map(|id| id.as_bytes().to_vec())),
        )
    }

    fn get_item(&self, id: StudyPlanItemId) -> Result<Option<StudyPlanItem>, StorageError> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM study_plan_items WHERE study_plan_item_id = ?1");
        Ok(query_items(&self.conn, &sql, params![id.as_bytes().as_slice()])?.pop())
    }

    fn get_items(&self, ids: &[StudyPlanItemId]) -> Result<Vec<StudyPlanItem>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM study_plan_items
             WHERE study_plan_item_id IN ({}) AND deleted_at IS NULL
             ORDER BY display_order, study_plan_item_id",
            placeholders(ids.len())
        );
        query_items(
            &self.conn,
            &sql,
            params_from_iter(ids.iter().map(|id| id.as_bytes().to_vec())),
        )
    }

    fn get_items_by_plan(&self, plan_id: StudyPlanId) -> Result<Vec<StudyPlanItem>, StorageError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM study_plan_items WHERE study_plan_id = ?1
             ORDER BY display_order, study_plan_item_id"
        );
        query_items(&self.conn, &sql, params![plan_id.as_bytes().as_slice()])
    }

    fn get_item_copies(&self, id: StudyPlanItemId) -> Result<Vec<StudyPlanItem>, StorageError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM study_plan_items WHERE copy_study_plan_item_id = ?1
             ORDER BY study_plan_id"
        );
        query_items(&self.conn, &sql, params![id.as_bytes().as_slice()])
    }
}

/// Wrapper error type used to tunnel StorageError through rusqlite's error system
/// in query_map closures that must return rusqlite::Error.
#[derive(Debug)]
struct OpaqueStorageError(String);

impl std::fmt::Display for OpaqueStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for OpaqueStorageError {}
