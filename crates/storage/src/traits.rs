use chrono::{DateTime, Utc};

use studyplan_core::{
    ids::*,
    model::{StudyPlan, StudyPlanItem, StudyPlanItemStatus},
};

use crate::error::StorageError;

/// Result of reconciling a batch of candidates against existing rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled<Id> {
    /// Candidates that created a new row under their submitted identifier.
    pub inserted: Vec<Id>,
    /// Candidates that updated the existing row carrying their identifier.
    pub updated: Vec<Id>,
    /// `(submitted, existing)` for candidates that landed on an existing row
    /// under a different identifier.
    pub remapped: Vec<(Id, Id)>,
}

impl<Id> Default for Reconciled<Id> {
    fn default() -> Self {
        Self {
            inserted: Vec::new(),
            updated: Vec::new(),
            remapped: Vec::new(),
        }
    }
}

/// A concrete plan created from a source plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanCopy {
    pub source: StudyPlanId,
    pub copy: StudyPlanId,
}

/// Counts from an item copy pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyOutcome {
    /// New rows created.
    pub inserted: usize,
    /// Existing copies whose `display_order` was refreshed.
    pub refreshed: usize,
}

impl CopyOutcome {
    pub fn total(&self) -> usize {
        self.inserted + self.refreshed
    }
}

/// New schedule for the copy of `copy_of` living in `study_plan_id`.
/// Applying it clears the copy's soft-delete marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedItemUpdate {
    pub study_plan_id: StudyPlanId,
    pub copy_of: StudyPlanItemId,
    pub available_from: Option<DateTime<Utc>>,
    pub available_to: Option<DateTime<Utc>>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub display_order: i32,
    pub status: StudyPlanItemStatus,
}

/// Which of start/end date to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateUpdate {
    Both {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    Start(DateTime<Utc>),
    End(DateTime<Utc>),
}

/// Persistence for study plans and their items.
///
/// Every `&mut self` method is one all-or-nothing transaction: if any
/// statement fails nothing is applied and the whole call may be retried
/// (except [`StudyPlanStore::copy_plans`], which mints fresh identifiers).
pub trait StudyPlanStore {
    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Insert each item, or on `(study_plan_id, content_key)` conflict
    /// refresh `display_order`, `status` and `updated_at` of the existing
    /// row. Candidates that hit an existing row get their identifier
    /// rewritten to that row's identifier.
    fn sync_items(
        &mut self,
        items: &mut [StudyPlanItem],
    ) -> Result<Reconciled<StudyPlanItemId>, StorageError>;

    /// Primary-key upsert overwriting schedule fields. A null incoming
    /// `school_date` keeps the stored one.
    fn upsert_items(&mut self, items: &[StudyPlanItem]) -> Result<(), StorageError>;

    /// Primary-key upsert of plans. On conflict only name, type,
    /// `updated_at` and `school_id` change, and the plan is undeleted.
    /// A plan with a master must share the master's course and book.
    fn upsert_plans(&mut self, plans: &[StudyPlan]) -> Result<Reconciled<StudyPlanId>, StorageError>;

    // ------------------------------------------------------------------
    // Lineage
    // ------------------------------------------------------------------

    /// Clone each source plan under a fresh id with `master_study_plan_id`
    /// set to the source. Output order matches `source_ids`.
    fn copy_plans(&mut self, source_ids: &[StudyPlanId]) -> Result<Vec<PlanCopy>, StorageError>;

    /// Copy every live item of `sources[i]` into `targets[i]`, which must be
    /// a direct copy of `sources[i]`.
    fn copy_items(
        &mut self,
        sources: &[StudyPlanId],
        targets: &[StudyPlanId],
        now: DateTime<Utc>,
    ) -> Result<CopyOutcome, StorageError>;

    /// [`copy_plans`](Self::copy_plans) followed by
    /// [`copy_items`](Self::copy_items) in one transaction.
    fn copy_plan_trees(
        &mut self,
        source_ids: &[StudyPlanId],
        now: DateTime<Utc>,
    ) -> Result<Vec<PlanCopy>, StorageError>;

    /// Copy each item into every live plan whose master is the item's plan.
    fn copy_items_to_dependents(
        &mut self,
        item_ids: &[StudyPlanItemId],
        now: DateTime<Utc>,
    ) -> Result<CopyOutcome, StorageError>;

    /// Re-schedule and undelete copied items. Each update must hit exactly
    /// one row.
    fn update_copied_items(
        &mut self,
        updates: &[CopiedItemUpdate],
        now: DateTime<Utc>,
    ) -> Result<Vec<StudyPlanItem>, StorageError>;

    /// Soft-delete a root plan and every plan descending from it. Returns
    /// the affected ids, root first; empty when `root` is missing or has a
    /// master.
    fn soft_delete_plan_tree(
        &mut self,
        root: StudyPlanId,
        now: DateTime<Utc>,
    ) -> Result<Vec<StudyPlanId>, StorageError>;

    /// Live plans whose master is one of `master_ids` (one level).
    fn find_dependent_plans(&self, master_ids: &[StudyPlanId]) -> Result<Vec<StudyPlanId>, StorageError>;

    /// Push name, track-school-progress, grades and status from `plan` onto
    /// itself and its live direct copies. Returns rows affected.
    fn update_plan_lineage(&mut self, plan: &StudyPlan, now: DateTime<Utc>) -> Result<usize, StorageError>;

    /// Re-point each plan and every plan descending from it at a book.
    fn update_book_lineage(
        &mut self,
        books: &[(StudyPlanId, String)],
        now: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    fn soft_delete_plans(&mut self, ids: &[StudyPlanId], now: DateTime<Utc>) -> Result<usize, StorageError>;

    fn soft_delete_items_by_plans(
        &mut self,
        plan_ids: &[StudyPlanId],
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError>;

    fn soft_delete_items(&mut self, ids: &[StudyPlanItemId], now: DateTime<Utc>) -> Result<usize, StorageError>;

    // ------------------------------------------------------------------
    // Status and dates
    // ------------------------------------------------------------------

    /// Set or clear `completed_at` on a live item.
    fn set_item_completed(
        &mut self,
        id: StudyPlanItemId,
        completed_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Move start/end dates, skipping items whose availability window
    /// would not contain them. Returns rows affected.
    fn update_items_dates(
        &mut self,
        ids: &[StudyPlanItemId],
        update: DateUpdate,
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError>;

    fn update_items_status(
        &mut self,
        ids: &[StudyPlanItemId],
        status: StudyPlanItemStatus,
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError>;

    fn update_school_date(
        &mut self,
        ids: &[StudyPlanItemId],
        school_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError>;

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    fn get_plan(&self, id: StudyPlanId) -> Result<Option<StudyPlan>, StorageError>;

    fn get_plans(&self, ids: &[StudyPlanId]) -> Result<Vec<StudyPlan>, StorageError>;

    /// Any item, deleted or not.
    fn get_item(&self, id: StudyPlanItemId) -> Result<Option<StudyPlanItem>, StorageError>;

    /// Live items among `ids`, by display order.
    fn get_items(&self, ids: &[StudyPlanItemId]) -> Result<Vec<StudyPlanItem>, StorageError>;

    /// Every item of a plan including deleted ones, by display order.
    fn get_items_by_plan(&self, plan_id: StudyPlanId) -> Result<Vec<StudyPlanItem>, StorageError>;

    /// Items copied directly from `id`, including deleted ones.
    fn get_item_copies(&self, id: StudyPlanItemId) -> Result<Vec<StudyPlanItem>, StorageError>;
}
