use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::ContentStructure;
use crate::ids::{StudyPlanId, StudyPlanItemId};
use crate::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StudyPlanStatus {
    Active,
    Archived,
}

impl StudyPlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "STUDY_PLAN_STATUS_ACTIVE",
            Self::Archived => "STUDY_PLAN_STATUS_ARCHIVED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "STUDY_PLAN_STATUS_ACTIVE" => Ok(Self::Active),
            "STUDY_PLAN_STATUS_ARCHIVED" => Ok(Self::Archived),
            _ => Err(CoreError::InvalidData(format!("unknown study plan status: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StudyPlanItemStatus {
    Active,
    Archived,
}

impl StudyPlanItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "STUDY_PLAN_ITEM_STATUS_ACTIVE",
            Self::Archived => "STUDY_PLAN_ITEM_STATUS_ARCHIVED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "STUDY_PLAN_ITEM_STATUS_ACTIVE" => Ok(Self::Active),
            "STUDY_PLAN_ITEM_STATUS_ARCHIVED" => Ok(Self::Archived),
            _ => Err(CoreError::InvalidData(format!("unknown study plan item status: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StudyPlanType {
    Course,
    Individual,
}

impl StudyPlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Course => "STUDY_PLAN_TYPE_COURSE",
            Self::Individual => "STUDY_PLAN_TYPE_INDIVIDUAL",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "STUDY_PLAN_TYPE_COURSE" => Ok(Self::Course),
            "STUDY_PLAN_TYPE_INDIVIDUAL" => Ok(Self::Individual),
            _ => Err(CoreError::InvalidData(format!("unknown study plan type: {s}"))),
        }
    }
}

/// A template (no master) or a concrete copy of one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyPlan {
    pub study_plan_id: StudyPlanId,
    pub master_study_plan_id: Option<StudyPlanId>,
    pub name: String,
    pub study_plan_type: StudyPlanType,
    pub course_id: String,
    pub book_id: String,
    pub school_id: i32,
    pub status: StudyPlanStatus,
    pub track_school_progress: bool,
    pub grades: Vec<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl StudyPlan {
    /// An active template plan stamped with `now`.
    pub fn new(
        name: &str,
        study_plan_type: StudyPlanType,
        course_id: &str,
        book_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            study_plan_id: StudyPlanId::new(),
            master_study_plan_id: None,
            name: name.to_string(),
            study_plan_type,
            course_id: course_id.to_string(),
            book_id: book_id.to_string(),
            school_id: 0,
            status: StudyPlanStatus::Active,
            track_school_progress: false,
            grades: Vec::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_master(&self) -> bool {
        self.master_study_plan_id.is_none()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// One learning material scheduled inside a study plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyPlanItem {
    pub study_plan_item_id: StudyPlanItemId,
    pub study_plan_id: StudyPlanId,
    pub content_structure: ContentStructure,
    /// Canonical form of `content_structure`; see [`ContentStructure::content_key`].
    pub content_key: String,
    pub copy_study_plan_item_id: Option<StudyPlanItemId>,
    pub display_order: i32,
    pub available_from: Option<DateTime<Utc>>,
    pub available_to: Option<DateTime<Utc>>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub school_date: Option<DateTime<Utc>>,
    pub status: StudyPlanItemStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl StudyPlanItem {
    /// An active, unscheduled original item with a fresh identifier.
    pub fn new(
        study_plan_id: StudyPlanId,
        content_structure: ContentStructure,
        display_order: i32,
        now: DateTime<Utc>,
    ) -> Result<Self, CoreError> {
        let content_key = content_structure.content_key()?;
        Ok(Self {
            study_plan_item_id: StudyPlanItemId::new(),
            study_plan_id,
            content_structure,
            content_key,
            copy_study_plan_item_id: None,
            display_order,
            available_from: None,
            available_to: None,
            start_date: None,
            end_date: None,
            completed_at: None,
            school_date: None,
            status: StudyPlanItemStatus::Active,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    pub fn with_availability(
        mut self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        self.available_from = from;
        self.available_to = to;
        self
    }

    pub fn with_dates(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    /// Recompute `content_key` after `content_structure` was edited in place.
    pub fn refresh_content_key(&mut self) -> Result<(), CoreError> {
        self.content_key = self.content_structure.content_key()?;
        Ok(())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Last edit after creation, if the row was ever edited.
    pub fn touched_at(&self) -> Option<DateTime<Utc>> {
        (self.updated_at > self.created_at).then_some(self.updated_at)
    }
}
