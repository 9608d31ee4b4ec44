//! Curriculum-ordered retrieval.
//!
//! The curriculum tree (books, chapters, topics, learning materials) lives
//! outside this crate and is reordered independently of study plans. It is
//! consulted through [`CurriculumIndex`], which answers "where does this
//! content sit right now".

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use studyplan_core::{ContentStructure, StudyPlanItem};

/// Current display position of one learning material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CurriculumPosition {
    pub chapter_order: i32,
    pub topic_order: i32,
    pub material_order: i32,
}

pub trait CurriculumIndex {
    /// `None` when any node on the path is missing or soft-deleted.
    fn position(&self, content: &ContentStructure) -> Option<CurriculumPosition>;
}

#[derive(Debug, Default, Clone)]
struct Node {
    order: i32,
    deleted: bool,
}

#[derive(Debug, Clone)]
struct Topic {
    chapter_id: String,
    node: Node,
}

/// Curriculum tree held in memory. Chapters hang off books (a chapter may be
/// shared by several books), topics off a single chapter and learning
/// materials off a single topic, each with its own display order.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCurriculum {
    books: HashMap<String, bool>,
    chapters: HashMap<String, Node>,
    book_chapters: HashSet<(String, String)>,
    topics: HashMap<String, Topic>,
    materials: HashMap<(String, String), Node>,
}

impl InMemoryCurriculum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_book(&mut self, book_id: &str) -> &mut Self {
        self.books.insert(book_id.to_string(), false);
        self
    }

    /// Place a chapter in a book. The chapter's order is shared by every
    /// book it belongs to.
    pub fn set_chapter(&mut self, book_id: &str, chapter_id: &str, order: i32) -> &mut Self {
        self.chapters
            .insert(chapter_id.to_string(), Node { order, deleted: false });
        self.book_chapters
            .insert((book_id.to_string(), chapter_id.to_string()));
        self
    }

    pub fn set_topic(&mut self, chapter_id: &str, topic_id: &str, order: i32) -> &mut Self {
        self.topics.insert(
            topic_id.to_string(),
            Topic {
                chapter_id: chapter_id.to_string(),
                node: Node { order, deleted: false },
            },
        );
        self
    }

    /// Learning objective or assignment, ordered within its topic.
    pub fn set_material(&mut self, topic_id: &str, material_id: &str, order: i32) -> &mut Self {
        self.materials.insert(
            (topic_id.to_string(), material_id.to_string()),
            Node { order, deleted: false },
        );
        self
    }

    pub fn delete_book(&mut self, book_id: &str) {
        if let Some(deleted) = self.books.get_mut(book_id) {
            *deleted = true;
        }
    }

    pub fn delete_chapter(&mut self, chapter_id: &str) {
        if let Some(node) = self.chapters.get_mut(chapter_id) {
            node.deleted = true;
        }
    }

    pub fn delete_topic(&mut self, topic_id: &str) {
        if let Some(topic) = self.topics.get_mut(topic_id) {
            topic.node.deleted = true;
        }
    }

    pub fn delete_material(&mut self, topic_id: &str, material_id: &str) {
        if let Some(node) = self
            .materials
            .get_mut(&(topic_id.to_string(), material_id.to_string()))
        {
            node.deleted = true;
        }
    }
}

fn live(node: &Node) -> Option<i32> {
    (!node.deleted).then_some(node.order)
}

impl CurriculumIndex for InMemoryCurriculum {
    fn position(&self, content: &ContentStructure) -> Option<CurriculumPosition> {
        let material = content.learning_material()?;

        if *self.books.get(&content.book_id)? {
            return None;
        }
        if !self
            .book_chapters
            .contains(&(content.book_id.clone(), content.chapter_id.clone()))
        {
            return None;
        }
        let chapter_order = live(self.chapters.get(&content.chapter_id)?)?;

        let topic = self.topics.get(&content.topic_id)?;
        if topic.chapter_id != content.chapter_id {
            return None;
        }
        let topic_order = live(&topic.node)?;

        let material_order = live(
            self.materials
                .get(&(content.topic_id.clone(), material.id().to_string()))?,
        )?;

        Some(CurriculumPosition {
            chapter_order,
            topic_order,
            material_order,
        })
    }
}

/// Order items by book, then curriculum position. Items without a position
/// are dropped. Ties fall back to the item id so the order is total.
pub fn curriculum_order(items: Vec<StudyPlanItem>, index: &dyn CurriculumIndex) -> Vec<StudyPlanItem> {
    let mut positioned: Vec<(CurriculumPosition, StudyPlanItem)> = items
        .into_iter()
        .filter_map(|item| index.position(&item.content_structure).map(|p| (p, item)))
        .collect();

    positioned.sort_by(|(pa, a), (pb, b)| {
        a.content_structure
            .book_id
            .cmp(&b.content_structure.book_id)
            .then_with(|| pa.cmp(pb))
            .then_with(|| cmp_ids(a, b))
    });
    positioned.into_iter().map(|(_, item)| item).collect()
}

fn cmp_ids(a: &StudyPlanItem, b: &StudyPlanItem) -> Ordering {
    a.study_plan_item_id
        .as_bytes()
        .cmp(b.study_plan_item_id.as_bytes())
}
