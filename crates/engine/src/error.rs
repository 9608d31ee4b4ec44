use studyplan_core::{CoreError, StudyPlanId, StudyPlanItemId};
use studyplan_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("study plan not found: {0}")]
    PlanNotFound(StudyPlanId),

    #[error("study plan item not found: {0}")]
    ItemNotFound(StudyPlanItemId),

    #[error("study plan {0} has a master and is not a lineage root")]
    NotRootPlan(StudyPlanId),
}

impl EngineError {
    /// Not-found at any layer.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::PlanNotFound(_) | Self::ItemNotFound(_) | Self::Storage(StorageError::NotFound(_))
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_transient())
    }
}
