pub mod clock;
pub mod content;
pub mod error;
pub mod ids;
pub mod model;
pub mod schedule;

pub use clock::{Clock, ManualClock, SystemClock};
pub use content::{ContentStructure, LearningMaterial};
pub use error::CoreError;
pub use ids::*;
pub use model::{StudyPlan, StudyPlanItem, StudyPlanItemStatus, StudyPlanStatus, StudyPlanType};
pub use schedule::{Authority, EffectiveSchedule, resolve};
