use pretty_assertions::assert_eq;
use studyplan_core::{ContentStructure, StudyPlanItemId, StudyPlanItemStatus};
use studyplan_engine::EngineError;
use studyplan_harness::{SharedDatabase, TestPlanner, at};
use studyplan_storage::StorageError;

// ============================================================================
// Item reconciliation
// ============================================================================

#[test]
fn new_candidates_are_inserted_under_their_own_ids() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestPlanner::new()?;
    let plan = t.master_plan("Algebra I")?;
    let mut items = vec![
        t.lo_item(plan.study_plan_id, "lo-1", 0),
        t.lo_item(plan.study_plan_id, "lo-2", 1),
    ];
    let submitted: Vec<StudyPlanItemId> = items.iter().map(|i| i.study_plan_item_id).collect();

    let result = t.planner.sync_items(&mut items)?;

    assert_eq!(result.inserted, submitted);
    assert!(result.remapped.is_empty());
    assert_eq!(t.planner.find_items_by_plan(plan.study_plan_id)?.len(), 2);
    Ok(())
}

#[test]
fn existing_content_key_remaps_candidate_id() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestPlanner::new()?;
    let plan = t.master_plan("Algebra I")?;
    let existing = t.seed_items(plan.study_plan_id, &["lo-1"])?;
    let x = existing[0].study_plan_item_id;

    let mut candidates = vec![t.lo_item(plan.study_plan_id, "lo-1", 5)];
    let y = candidates[0].study_plan_item_id;
    let result = t.planner.sync_items(&mut candidates)?;

    assert!(result.inserted.is_empty());
    assert_eq!(result.remapped, vec![(y, x)]);
    assert_eq!(candidates[0].study_plan_item_id, x);

    let rows = t.planner.find_items_by_plan(plan.study_plan_id)?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].study_plan_item_id, x);
    assert_eq!(rows[0].display_order, 5);
    Ok(())
}

#[test]
fn reapplying_a_batch_inserts_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestPlanner::new()?;
    let plan = t.master_plan("Algebra I")?;
    let first = t.seed_items(plan.study_plan_id, &["lo-1", "lo-2", "lo-3"])?;

    t.advance(30);
    let second = t.seed_items(plan.study_plan_id, &["lo-1", "lo-2", "lo-3"])?;

    let first_ids: Vec<_> = first.iter().map(|i| i.study_plan_item_id).collect();
    let second_ids: Vec<_> = second.iter().map(|i| i.study_plan_item_id).collect();
    assert_eq!(first_ids, second_ids);
    assert_eq!(t.planner.find_items_by_plan(plan.study_plan_id)?.len(), 3);
    Ok(())
}

#[test]
fn resyncing_the_same_batch_reports_updates() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestPlanner::new()?;
    let plan = t.master_plan("Algebra I")?;
    let mut items = vec![
        t.lo_item(plan.study_plan_id, "lo-1", 0),
        t.lo_item(plan.study_plan_id, "lo-2", 1),
    ];
    let ids: Vec<StudyPlanItemId> = items.iter().map(|i| i.study_plan_item_id).collect();

    let first = t.planner.sync_items(&mut items)?;
    assert_eq!(first.inserted, ids);
    assert!(first.updated.is_empty());

    t.advance(30);
    let second = t.planner.sync_items(&mut items)?;

    assert!(second.inserted.is_empty());
    assert!(second.remapped.is_empty());
    assert_eq!(second.updated, ids);
    let rows = t.planner.find_items_by_plan(plan.study_plan_id)?;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.updated_at == at(30)));
    Ok(())
}

#[test]
fn mixed_batch_classifies_each_candidate() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestPlanner::new()?;
    let plan = t.master_plan("Algebra I")?;
    let existing = t.seed_items(plan.study_plan_id, &["lo-1"])?;

    let mut batch = vec![
        t.lo_item(plan.study_plan_id, "lo-1", 0),
        t.lo_item(plan.study_plan_id, "lo-2", 1),
    ];
    let remapped_from = batch[0].study_plan_item_id;
    let fresh = batch[1].study_plan_item_id;
    let result = t.planner.sync_items(&mut batch)?;

    assert_eq!(result.inserted, vec![fresh]);
    assert_eq!(
        result.remapped,
        vec![(remapped_from, existing[0].study_plan_item_id)]
    );
    Ok(())
}

#[test]
fn duplicate_keys_within_one_batch_collapse() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestPlanner::new()?;
    let plan = t.master_plan("Algebra I")?;
    let mut batch = vec![
        t.lo_item(plan.study_plan_id, "lo-1", 0),
        t.lo_item(plan.study_plan_id, "lo-1", 7),
    ];

    let result = t.planner.sync_items(&mut batch)?;

    assert_eq!(result.inserted.len(), 1);
    assert_eq!(result.remapped.len(), 1);
    assert_eq!(batch[0].study_plan_item_id, batch[1].study_plan_item_id);
    let rows = t.planner.find_items_by_plan(plan.study_plan_id)?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].display_order, 7);
    Ok(())
}

#[test]
fn same_key_in_different_plans_is_two_rows() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestPlanner::new()?;
    let a = t.master_plan("Algebra I")?;
    let b = t.master_plan("Algebra II")?;
    let mut batch = vec![
        t.lo_item(a.study_plan_id, "lo-1", 0),
        t.lo_item(b.study_plan_id, "lo-1", 0),
    ];

    let result = t.planner.sync_items(&mut batch)?;

    assert_eq!(result.inserted.len(), 2);
    assert_eq!(batch[0].content_key, batch[1].content_key);
    Ok(())
}

#[test]
fn conflict_refreshes_order_and_status_but_not_schedule() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestPlanner::new()?;
    let plan = t.master_plan("Algebra I")?;
    t.seed_items(plan.study_plan_id, &["lo-1"])?;

    t.advance(60);
    let mut candidate = t
        .lo_item(plan.study_plan_id, "lo-1", 3)
        .with_dates(Some(at(100)), Some(at(200)));
    candidate.status = StudyPlanItemStatus::Archived;
    let mut batch = vec![candidate];
    t.planner.sync_items(&mut batch)?;

    let stored = t
        .planner
        .find_item(batch[0].study_plan_item_id)?
        .ok_or("reconciled row missing")?;
    assert_eq!(stored.display_order, 3);
    assert_eq!(stored.status, StudyPlanItemStatus::Archived);
    assert_eq!(stored.start_date, None);
    assert_eq!(stored.end_date, None);
    assert_eq!(stored.updated_at, at(60));
    assert_eq!(stored.created_at, at(0));
    Ok(())
}

#[test]
fn whole_batch_rolls_back_on_primary_key_collision() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestPlanner::new()?;
    let plan = t.master_plan("Algebra I")?;
    let existing = t.seed_items(plan.study_plan_id, &["lo-1"])?;

    let fresh = t.lo_item(plan.study_plan_id, "lo-2", 1);
    let fresh_id = fresh.study_plan_item_id;
    let mut collide = t.lo_item(plan.study_plan_id, "lo-3", 2);
    collide.study_plan_item_id = existing[0].study_plan_item_id;
    let mut batch = vec![fresh, collide];

    let err = t.planner.sync_items(&mut batch).unwrap_err();

    assert!(matches!(
        err,
        EngineError::Storage(StorageError::ConstraintViolation(_))
    ));
    assert_eq!(t.planner.find_item(fresh_id)?, None);
    assert_eq!(t.planner.find_items_by_plan(plan.study_plan_id)?.len(), 1);
    Ok(())
}

#[test]
fn invalid_content_structure_writes_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestPlanner::new()?;
    let plan = t.master_plan("Algebra I")?;
    let good = t.lo_item(plan.study_plan_id, "lo-1", 0);
    let mut bad = t.lo_item(plan.study_plan_id, "lo-2", 1);
    bad.content_structure = ContentStructure {
        topic_id: String::new(),
        ..bad.content_structure.clone()
    };
    let mut batch = vec![good, bad];

    let err = t.planner.sync_items(&mut batch).unwrap_err();

    assert!(matches!(err, EngineError::Core(_)));
    assert!(t.planner.find_items_by_plan(plan.study_plan_id)?.is_empty());
    Ok(())
}

#[test]
fn empty_batch_is_a_no_op() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestPlanner::new()?;
    let result = t.planner.sync_items(&mut [])?;
    assert!(result.inserted.is_empty());
    assert!(result.remapped.is_empty());
    Ok(())
}

#[test]
fn concurrent_planners_keep_one_row_per_key() -> Result<(), Box<dyn std::error::Error>> {
    let mut db = SharedDatabase::new()?;
    let first = db.open()?;
    let second = db.open()?;

    let plan = db.planner_mut(first).master_plan("Algebra I")?;
    let winner = db.planner_mut(first).seed_items(plan.study_plan_id, &["lo-1"])?;

    let mut late = vec![db.planner(second).lo_item(plan.study_plan_id, "lo-1", 4)];
    let result = db.planner_mut(second).planner.sync_items(&mut late)?;

    assert!(result.inserted.is_empty());
    assert_eq!(late[0].study_plan_item_id, winner[0].study_plan_item_id);
    let rows = db.planner(first).planner.find_items_by_plan(plan.study_plan_id)?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].display_order, 4);
    Ok(())
}

// ============================================================================
// Plan reconciliation
// ============================================================================

#[test]
fn reimported_plan_is_undeleted_with_narrow_update() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestPlanner::new()?;
    let mut plan = t.individual_type_plan("Summer");
    let id = plan.study_plan_id;

    let result = t.planner.sync_plans(std::slice::from_ref(&plan))?;
    assert_eq!(result.inserted, vec![id]);

    t.advance(10);
    t.planner.soft_delete_plans(&[id])?;
    assert!(t.planner.find_plan(id)?.ok_or("plan missing")?.is_deleted());

    t.advance(10);
    plan.name = "Summer term".to_string();
    plan.book_id = "book-2".to_string();
    plan.school_id = 42;
    plan.updated_at = t.planner.now();
    let result = t.planner.sync_plans(std::slice::from_ref(&plan))?;

    assert!(result.inserted.is_empty());
    assert!(result.remapped.is_empty());
    assert_eq!(result.updated, vec![id]);
    let stored = t.planner.find_plan(id)?.ok_or("plan missing")?;
    assert_eq!(stored.name, "Summer term");
    assert_eq!(stored.school_id, 42);
    assert_eq!(stored.book_id, "book-1");
    assert_eq!(stored.updated_at, at(20));
    assert_eq!(stored.deleted_at, None);
    Ok(())
}

#[test]
fn copy_must_match_its_master_book() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestPlanner::new()?;
    let master = t.master_plan("Algebra I")?;
    let mut copy = t.individual_type_plan("Algebra I");
    copy.master_study_plan_id = Some(master.study_plan_id);
    copy.book_id = "book-2".to_string();

    let err = t.planner.sync_plans(std::slice::from_ref(&copy)).unwrap_err();

    assert!(matches!(err, EngineError::Storage(StorageError::Integrity(_))));
    assert_eq!(t.planner.find_plan(copy.study_plan_id)?, None);

    copy.master_study_plan_id = Some(studyplan_core::StudyPlanId::new());
    let err = t.planner.sync_plans(std::slice::from_ref(&copy)).unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}

#[test]
fn stale_candidate_lands_untouched() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestPlanner::new()?;
    let plan = t.master_plan("Algebra I")?;
    let mut items = vec![t.lo_item(plan.study_plan_id, "lo-1", 0)];
    assert_eq!(items[0].created_at, at(0));

    t.advance(20);
    t.planner.sync_items(&mut items)?;

    let stored = t.planner.find_items_by_plan(plan.study_plan_id)?;
    assert_eq!(stored[0].created_at, at(20));
    assert_eq!(stored[0].updated_at, at(20));
    assert_eq!(stored[0].touched_at(), None);
    Ok(())
}
