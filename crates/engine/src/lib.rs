pub mod curriculum;
pub mod error;

pub use curriculum::{CurriculumIndex, CurriculumPosition, InMemoryCurriculum, curriculum_order};
pub use error::EngineError;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use studyplan_core::{
    Clock, EffectiveSchedule, SystemClock,
    ids::*,
    model::{StudyPlan, StudyPlanItem, StudyPlanItemStatus},
    resolve,
};
use studyplan_storage::{
    CopiedItemUpdate, CopyOutcome, DateUpdate, PlanCopy, Reconciled, SqliteStore, StorageError,
    StudyPlanStore,
};

/// A master item with the individual plan's override for the same content
/// and the schedule they resolve to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledItem {
    pub master: StudyPlanItem,
    pub individual: Option<StudyPlanItem>,
    pub schedule: EffectiveSchedule,
}

/// Study plan operations over a store, stamped by an injected clock.
pub struct Planner {
    clock: Box<dyn Clock>,
    store: SqliteStore,
}

impl Planner {
    pub fn new(store: SqliteStore) -> Self {
        Self::with_clock(store, Box::new(SystemClock))
    }

    pub fn with_clock(store: SqliteStore, clock: Box<dyn Clock>) -> Self {
        Self { clock, store }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SqliteStore {
        &mut self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn require_plan(&self, id: StudyPlanId) -> Result<StudyPlan, EngineError> {
        self.store.get_plan(id)?.ok_or(EngineError::PlanNotFound(id))
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Reconcile plans by primary key. A re-imported plan is undeleted.
    pub fn sync_plans(&mut self, plans: &[StudyPlan]) -> Result<Reconciled<StudyPlanId>, EngineError> {
        let result = self.store.upsert_plans(plans)?;
        info!(
            plans = plans.len(),
            inserted = result.inserted.len(),
            updated = result.updated.len(),
            "reconciled study plans"
        );
        Ok(result)
    }

    /// Create and persist an active master plan.
    pub fn create_master_plan(
        &mut self,
        name: &str,
        course_id: &str,
        book_id: &str,
    ) -> Result<StudyPlan, EngineError> {
        let plan = StudyPlan::new(
            name,
            studyplan_core::StudyPlanType::Course,
            course_id,
            book_id,
            self.now(),
        );
        self.store.upsert_plans(std::slice::from_ref(&plan))?;
        Ok(plan)
    }

    /// Reconcile items on `(plan, content key)`. Content keys are recomputed
    /// from each item's content structure and both timestamps are stamped
    /// with the clock before the batch is written, so a fresh row starts
    /// untouched. On return every item carries the identifier of the row it
    /// landed on.
    pub fn sync_items(
        &mut self,
        items: &mut [StudyPlanItem],
    ) -> Result<Reconciled<StudyPlanItemId>, EngineError> {
        let now = self.now();
        for item in items.iter_mut() {
            item.refresh_content_key()?;
            item.created_at = now;
            item.updated_at = now;
        }
        let result = self.store.sync_items(items)?;
        info!(
            candidates = items.len(),
            inserted = result.inserted.len(),
            updated = result.updated.len(),
            remapped = result.remapped.len(),
            "reconciled study plan items"
        );
        Ok(result)
    }

    /// Primary-key upsert for callers that already hold row identifiers.
    pub fn upsert_items(&mut self, items: &mut [StudyPlanItem]) -> Result<(), EngineError> {
        let now = self.now();
        for item in items.iter_mut() {
            item.refresh_content_key()?;
            item.updated_at = now;
        }
        self.store.upsert_items(items)?;
        Ok(())
    }

    // ========================================================================
    // Lineage
    // ========================================================================

    /// Not idempotent: every call mints new plans.
    pub fn copy_plans(&mut self, source_ids: &[StudyPlanId]) -> Result<Vec<PlanCopy>, EngineError> {
        Ok(self.store.copy_plans(source_ids)?)
    }

    pub fn copy_items(
        &mut self,
        sources: &[StudyPlanId],
        targets: &[StudyPlanId],
    ) -> Result<CopyOutcome, EngineError> {
        let now = self.now();
        let outcome = self.store.copy_items(sources, targets, now)?;
        info!(
            plans = sources.len(),
            inserted = outcome.inserted,
            refreshed = outcome.refreshed,
            "copied study plan items"
        );
        Ok(outcome)
    }

    /// Copy plans together with their live items.
    pub fn copy_plan_trees(&mut self, source_ids: &[StudyPlanId]) -> Result<Vec<PlanCopy>, EngineError> {
        let now = self.now();
        Ok(self.store.copy_plan_trees(source_ids, now)?)
    }

    /// Fan newly reconciled master items out to every dependent plan.
    pub fn copy_items_to_dependents(
        &mut self,
        item_ids: &[StudyPlanItemId],
    ) -> Result<CopyOutcome, EngineError> {
        let now = self.now();
        Ok(self.store.copy_items_to_dependents(item_ids, now)?)
    }

    /// Re-schedule and undelete copied items. Fails the whole batch if any
    /// update does not hit exactly one copy.
    pub fn reactivate_copied_items(
        &mut self,
        updates: &[CopiedItemUpdate],
    ) -> Result<Vec<StudyPlanItem>, EngineError> {
        let now = self.now();
        let items = self.store.update_copied_items(updates, now)?;
        info!(items = items.len(), "re-activated copied items");
        Ok(items)
    }

    /// Soft-delete a root plan and everything copied from it, directly or
    /// transitively. Items are left alone; see
    /// [`soft_delete_items_by_plans`](Self::soft_delete_items_by_plans).
    pub fn soft_delete_plan_tree(&mut self, root: StudyPlanId) -> Result<Vec<StudyPlanId>, EngineError> {
        let plan = self.require_plan(root)?;
        if !plan.is_master() {
            return Err(EngineError::NotRootPlan(root));
        }
        let now = self.now();
        let ids = self.store.soft_delete_plan_tree(root, now)?;
        debug!(%root, plans = ids.len(), "cascaded soft delete");
        Ok(ids)
    }

    pub fn find_dependent_plans(&self, master_ids: &[StudyPlanId]) -> Result<Vec<StudyPlanId>, EngineError> {
        Ok(self.store.find_dependent_plans(master_ids)?)
    }

    /// Push name, track-school-progress, grades and status onto the plan and
    /// its direct copies.
    pub fn update_plan_lineage(&mut self, plan: &StudyPlan) -> Result<usize, EngineError> {
        let now = self.now();
        match self.store.update_plan_lineage(plan, now) {
            Err(StorageError::NotFound(_)) => Err(EngineError::PlanNotFound(plan.study_plan_id)),
            other => Ok(other?),
        }
    }

    /// Move each plan and every plan descending from it to a new book.
    pub fn update_book_lineage(&mut self, books: &[(StudyPlanId, String)]) -> Result<(), EngineError> {
        let now = self.now();
        Ok(self.store.update_book_lineage(books, now)?)
    }

    pub fn soft_delete_plans(&mut self, ids: &[StudyPlanId]) -> Result<usize, EngineError> {
        let now = self.now();
        Ok(self.store.soft_delete_plans(ids, now)?)
    }

    pub fn soft_delete_items_by_plans(&mut self, plan_ids: &[StudyPlanId]) -> Result<usize, EngineError> {
        let now = self.now();
        Ok(self.store.soft_delete_items_by_plans(plan_ids, now)?)
    }

    pub fn soft_delete_items(&mut self, ids: &[StudyPlanItemId]) -> Result<usize, EngineError> {
        let now = self.now();
        Ok(self.store.soft_delete_items(ids, now)?)
    }

    // ========================================================================
    // Status and dates
    // ========================================================================

    pub fn mark_item_completed(&mut self, id: StudyPlanItemId) -> Result<(), EngineError> {
        let now = self.now();
        self.set_completed(id, Some(now), now)
    }

    pub fn unmark_item_completed(&mut self, id: StudyPlanItemId) -> Result<(), EngineError> {
        let now = self.now();
        self.set_completed(id, None, now)
    }

    fn set_completed(
        &mut self,
        id: StudyPlanItemId,
        completed_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        match self.store.set_item_completed(id, completed_at, now) {
            Err(StorageError::NotFound(_)) => Err(EngineError::ItemNotFound(id)),
            other => Ok(other?),
        }
    }

    /// Items whose availability window would not contain the new dates are
    /// skipped. Returns how many were moved.
    pub fn update_items_start_end(
        &mut self,
        ids: &[StudyPlanItemId],
        update: DateUpdate,
    ) -> Result<usize, EngineError> {
        let now = self.now();
        let moved = self.store.update_items_dates(ids, update, now)?;
        if moved < ids.len() {
            debug!(requested = ids.len(), moved, "some items kept their dates");
        }
        Ok(moved)
    }

    pub fn update_items_status(
        &mut self,
        ids: &[StudyPlanItemId],
        status: StudyPlanItemStatus,
    ) -> Result<usize, EngineError> {
        let now = self.now();
        Ok(self.store.update_items_status(ids, status, now)?)
    }

    pub fn update_school_date(
        &mut self,
        ids: &[StudyPlanItemId],
        school_date: Option<DateTime<Utc>>,
    ) -> Result<usize, EngineError> {
        let now = self.now();
        Ok(self.store.update_school_date(ids, school_date, now)?)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn find_plan(&self, id: StudyPlanId) -> Result<Option<StudyPlan>, EngineError> {
        Ok(self.store.get_plan(id)?)
    }

    pub fn find_plans(&self, ids: &[StudyPlanId]) -> Result<Vec<StudyPlan>, EngineError> {
        Ok(self.store.get_plans(ids)?)
    }

    pub fn find_item(&self, id: StudyPlanItemId) -> Result<Option<StudyPlanItem>, EngineError> {
        Ok(self.store.get_item(id)?)
    }

    /// Every item of the plan, deleted ones included.
    pub fn find_items_by_plan(&self, plan_id: StudyPlanId) -> Result<Vec<StudyPlanItem>, EngineError> {
        Ok(self.store.get_items_by_plan(plan_id)?)
    }

    /// Direct lineage children of an item.
    pub fn item_copies(&self, id: StudyPlanItemId) -> Result<Vec<StudyPlanItem>, EngineError> {
        Ok(self.store.get_item_copies(id)?)
    }

    /// Live items among `ids` in curriculum order. Items whose curriculum
    /// node is gone are left out.
    pub fn find_and_sort_items(
        &self,
        ids: &[StudyPlanItemId],
        curriculum: &dyn CurriculumIndex,
    ) -> Result<Vec<StudyPlanItem>, EngineError> {
        let items = self.store.get_items(ids)?;
        let found = items.len();
        let sorted = curriculum_order(items, curriculum);
        if sorted.len() < found {
            debug!(found, kept = sorted.len(), "dropped items outside the curriculum");
        }
        Ok(sorted)
    }

    /// Effective schedule of every live item in the master of
    /// `individual_plan_id`, overridden by the individual plan's item with
    /// the same content key. A master plan resolves against no overrides.
    pub fn individual_schedule(&self, individual_plan_id: StudyPlanId) -> Result<Vec<ScheduledItem>, EngineError> {
        let plan = self.require_plan(individual_plan_id)?;
        let master_id = plan.master_study_plan_id.unwrap_or(plan.study_plan_id);

        let mut overrides: HashMap<String, StudyPlanItem> = HashMap::new();
        if master_id != individual_plan_id {
            for item in self.store.get_items_by_plan(individual_plan_id)? {
                overrides.insert(item.content_key.clone(), item);
            }
        }

        let scheduled = self
            .store
            .get_items_by_plan(master_id)?
            .into_iter()
            .filter(|m| !m.is_deleted())
            .map(|master| {
                let individual = overrides.remove(&master.content_key);
                let schedule = resolve(&master, individual.as_ref());
                ScheduledItem {
                    master,
                    individual,
                    schedule,
                }
            })
            .collect();
        Ok(scheduled)
    }
}
