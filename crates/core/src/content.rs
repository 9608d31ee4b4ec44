//! Curriculum coordinates of a study plan item and their canonical key.
//!
//! The content key is the deduplication column paired with the owning plan
//! in the `(study_plan_id, content_structure_flatten)` uniqueness constraint.

use serde::{Deserialize, Serialize};

use crate::CoreError;

const SEPARATOR: &str = "::";

/// Position of a learning material inside the curriculum tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentStructure {
    #[serde(default)]
    pub course_id: String,
    pub book_id: String,
    pub chapter_id: String,
    pub topic_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lo_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub assignment_id: String,
}

/// The learning material an item schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearningMaterial<'a> {
    LearningObjective(&'a str),
    Assignment(&'a str),
}

impl LearningMaterial<'_> {
    pub fn id(&self) -> &str {
        match self {
            Self::LearningObjective(id) | Self::Assignment(id) => id,
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            Self::LearningObjective(_) => "lo",
            Self::Assignment(_) => "assignment",
        }
    }
}

impl ContentStructure {
    pub fn learning_objective(
        course_id: &str,
        book_id: &str,
        chapter_id: &str,
        topic_id: &str,
        lo_id: &str,
    ) -> Self {
        Self {
            course_id: course_id.to_string(),
            book_id: book_id.to_string(),
            chapter_id: chapter_id.to_string(),
            topic_id: topic_id.to_string(),
            lo_id: lo_id.to_string(),
            assignment_id: String::new(),
        }
    }

    pub fn assignment(
        course_id: &str,
        book_id: &str,
        chapter_id: &str,
        topic_id: &str,
        assignment_id: &str,
    ) -> Self {
        Self {
            course_id: course_id.to_string(),
            book_id: book_id.to_string(),
            chapter_id: chapter_id.to_string(),
            topic_id: topic_id.to_string(),
            lo_id: String::new(),
            assignment_id: assignment_id.to_string(),
        }
    }

    /// A learning objective wins over an assignment when both are set.
    pub fn learning_material(&self) -> Option<LearningMaterial<'_>> {
        if !self.lo_id.is_empty() {
            Some(LearningMaterial::LearningObjective(&self.lo_id))
        } else if !self.assignment_id.is_empty() {
            Some(LearningMaterial::Assignment(&self.assignment_id))
        } else {
            None
        }
    }

    /// Canonical content key, e.g.
    /// `book::B1chapter::C1topic::T1course::K1lo::LO1`.
    ///
    /// Segments are emitted book, chapter, topic, course, material. Every
    /// coordinate except the course must be present and no coordinate may
    /// contain the `::` separator, so distinct coordinates never share a key.
    pub fn content_key(&self) -> Result<String, CoreError> {
        let material = self.learning_material().ok_or_else(|| {
            CoreError::InvalidContentStructure(
                "neither lo_id nor assignment_id is set".to_string(),
            )
        })?;

        let segments = [
            ("book", self.book_id.as_str(), true),
            ("chapter", self.chapter_id.as_str(), true),
            ("topic", self.topic_id.as_str(), true),
            ("course", self.course_id.as_str(), false),
            (material.tag(), material.id(), true),
        ];

        let mut key = String::new();
        for (tag, value, required) in segments {
            if required && value.is_empty() {
                return Err(CoreError::InvalidContentStructure(format!("{tag} is empty")));
            }
            if value.contains(SEPARATOR) {
                return Err(CoreError::InvalidContentStructure(format!(
                    "{tag} {value:?} contains {SEPARATOR:?}"
                )));
            }
            key.push_str(tag);
            key.push_str(SEPARATOR);
            key.push_str(value);
        }
        Ok(key)
    }

    /// Key prefix shared by every item of a book.
    pub fn book_key_prefix(book_id: &str) -> String {
        format!("book{SEPARATOR}{book_id}chapter{SEPARATOR}")
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        serde_json::to_string(self).map_err(|e| CoreError::InvalidData(e.to_string()))
    }

    pub fn from_json(s: &str) -> Result<Self, CoreError> {
        serde_json::from_str(s).map_err(|e| CoreError::InvalidData(e.to_string()))
    }
}
