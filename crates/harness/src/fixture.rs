use chrono::{DateTime, Duration, TimeZone, Utc};
use studyplan_core::{
    ContentStructure, ManualClock, StudyPlan, StudyPlanId, StudyPlanItem, StudyPlanType,
};
use studyplan_engine::Planner;
use studyplan_storage::{PlanCopy, SqliteStore, StorageError};

pub const COURSE: &str = "course-1";
pub const BOOK: &str = "book-1";

/// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fixed instant `secs` seconds after 2024-01-01T00:00:00Z.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default() + Duration::seconds(secs)
}

/// A planner over an in-memory store driven by a manual clock.
pub struct TestPlanner {
    pub planner: Planner,
    pub clock: ManualClock,
}

impl TestPlanner {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self::over(SqliteStore::open_in_memory()?))
    }

    pub fn over(store: SqliteStore) -> Self {
        init_tracing();
        let clock = ManualClock::new(at(0));
        Self {
            planner: Planner::with_clock(store, Box::new(clock.clone())),
            clock,
        }
    }

    pub fn advance(&self, secs: i64) {
        self.clock.advance(Duration::seconds(secs));
    }

    /// Persist a master plan for the default course and book.
    pub fn master_plan(&mut self, name: &str) -> Result<StudyPlan, Box<dyn std::error::Error>> {
        Ok(self.planner.create_master_plan(name, COURSE, BOOK)?)
    }

    /// Copy `master` into an individual plan, items included.
    pub fn individual_plan(
        &mut self,
        master: StudyPlanId,
    ) -> Result<StudyPlanId, Box<dyn std::error::Error>> {
        let copies = self.planner.copy_plan_trees(&[master])?;
        let PlanCopy { copy, .. } = copies[0];
        Ok(copy)
    }

    /// Unsaved learning-objective item under chapter `ch-1`, topic `tp-1`.
    pub fn lo_item(&self, plan: StudyPlanId, lo_id: &str, display_order: i32) -> StudyPlanItem {
        self.item(plan, ContentStructure::learning_objective(COURSE, BOOK, "ch-1", "tp-1", lo_id), display_order)
    }

    pub fn item(&self, plan: StudyPlanId, content: ContentStructure, display_order: i32) -> StudyPlanItem {
        match StudyPlanItem::new(plan, content, display_order, self.planner.now()) {
            Ok(item) => item,
            Err(e) => panic!("invalid fixture content: {e}"),
        }
    }

    /// Reconcile `lo_ids` into `plan` in the given order.
    pub fn seed_items(
        &mut self,
        plan: StudyPlanId,
        lo_ids: &[&str],
    ) -> Result<Vec<StudyPlanItem>, Box<dyn std::error::Error>> {
        let mut items: Vec<StudyPlanItem> = lo_ids
            .iter()
            .zip(0..)
            .map(|(lo, order)| self.lo_item(plan, lo, order))
            .collect();
        self.planner.sync_items(&mut items)?;
        Ok(items)
    }

    pub fn individual_type_plan(&self, name: &str) -> StudyPlan {
        StudyPlan::new(name, StudyPlanType::Individual, COURSE, BOOK, self.planner.now())
    }
}
