//! Override resolution between a master item and an individual copy.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{StudyPlanItem, StudyPlanItemStatus};

/// Which side of the pair decided the effective status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Authority {
    Master,
    Override,
}

/// Read-time schedule of a master item after applying an individual override.
/// Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveSchedule {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub available_from: Option<DateTime<Utc>>,
    pub available_to: Option<DateTime<Utc>>,
    pub status: StudyPlanItemStatus,
    pub authority: Authority,
}

impl EffectiveSchedule {
    pub fn is_active(&self) -> bool {
        self.status == StudyPlanItemStatus::Active
    }

    /// Whether `at` falls inside the availability window. Open ends are unbounded.
    pub fn is_available_at(&self, at: DateTime<Utc>) -> bool {
        self.available_from.is_none_or(|from| from <= at)
            && self.available_to.is_none_or(|to| at <= to)
    }
}

/// Resolve the effective schedule of `master` given an optional override.
///
/// Dates are overridden field by field: a non-null override value wins,
/// a null one falls back to the master. A soft-deleted override counts as
/// absent.
///
/// Status follows a recency rule. The override is authoritative only while
/// its own status is active, it was edited after creation, and that edit is
/// at or after the master's last update (a tie goes to the override).
/// Otherwise the master decides. An archived override therefore never hides
/// an item, and an unrelated metadata edit on either side can flip which
/// side is authoritative.
pub fn resolve(master: &StudyPlanItem, individual: Option<&StudyPlanItem>) -> EffectiveSchedule {
    let Some(individual) = individual.filter(|o| !o.is_deleted()) else {
        return EffectiveSchedule {
            start_date: master.start_date,
            end_date: master.end_date,
            available_from: master.available_from,
            available_to: master.available_to,
            status: master.status,
            authority: Authority::Master,
        };
    };

    let authority = match individual.touched_at() {
        Some(touched)
            if individual.status == StudyPlanItemStatus::Active && touched >= master.updated_at =>
        {
            Authority::Override
        }
        _ => Authority::Master,
    };
    let status = match authority {
        Authority::Master => master.status,
        Authority::Override => individual.status,
    };

    EffectiveSchedule {
        start_date: individual.start_date.or(master.start_date),
        end_date: individual.end_date.or(master.end_date),
        available_from: individual.available_from.or(master.available_from),
        available_to: individual.available_to.or(master.available_to),
        status,
        authority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentStructure;
    use crate::ids::StudyPlanId;
    use chrono::Duration;

    fn at(day: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap() + Duration::days(day)
    }

    fn item(created: DateTime<Utc>) -> StudyPlanItem {
        let cs = ContentStructure::learning_objective("k", "b1", "c1", "t1", "lo1");
        StudyPlanItem::new(StudyPlanId::new(), cs, 0, created).unwrap()
    }

    #[test]
    fn master_only() {
        let m = item(at(0)).with_dates(Some(at(1)), Some(at(2)));
        let eff = resolve(&m, None);
        assert_eq!(eff.start_date, Some(at(1)));
        assert_eq!(eff.end_date, Some(at(2)));
        assert_eq!(eff.authority, Authority::Master);
        assert!(eff.is_active());
    }

    #[test]
    fn override_fields_fall_back_independently() {
        let m = item(at(0)).with_dates(Some(at(1)), Some(at(2)));
        let o = item(at(0)).with_dates(None, Some(at(3)));
        let eff = resolve(&m, Some(&o));
        assert_eq!(eff.start_date, Some(at(1)));
        assert_eq!(eff.end_date, Some(at(3)));
    }

    #[test]
    fn null_end_date_inherits_from_master() {
        let m = item(at(0))
            .with_dates(Some(at(1)), Some(at(2)))
            .with_availability(Some(at(0)), Some(at(9)));
        let o = item(at(0))
            .with_dates(Some(at(4)), None)
            .with_availability(Some(at(3)), Some(at(8)));
        let eff = resolve(&m, Some(&o));
        assert_eq!(eff.end_date, Some(at(2)));
        assert_eq!(eff.start_date, Some(at(4)));
        assert_eq!(eff.available_from, Some(at(3)));
        assert_eq!(eff.available_to, Some(at(8)));
    }

    #[test]
    fn untouched_override_defers_to_master_status() {
        let m = item(at(0));
        let mut o = item(at(1));
        o.status = StudyPlanItemStatus::Archived;
        let eff = resolve(&m, Some(&o));
        assert_eq!(eff.authority, Authority::Master);
        assert!(eff.is_active());
    }

    #[test]
    fn recently_touched_active_override_decides_status() {
        let mut m = item(at(0));
        m.updated_at = at(1);
        m.status = StudyPlanItemStatus::Archived;
        let mut o = item(at(0));
        o.updated_at = at(2);
        let eff = resolve(&m, Some(&o));
        assert_eq!(eff.authority, Authority::Override);
        assert!(eff.is_active());
    }

    #[test]
    fn archived_override_never_takes_authority() {
        let mut m = item(at(0));
        m.updated_at = at(1);
        let mut o = item(at(0)).with_dates(Some(at(4)), None);
        o.updated_at = at(2);
        o.status = StudyPlanItemStatus::Archived;
        let eff = resolve(&m, Some(&o));
        assert_eq!(eff.authority, Authority::Master);
        assert!(eff.is_active());
        assert_eq!(eff.start_date, Some(at(4)));
    }

    #[test]
    fn tie_goes_to_override() {
        let mut m = item(at(0));
        m.updated_at = at(2);
        m.status = StudyPlanItemStatus::Archived;
        let mut o = item(at(0));
        o.updated_at = at(2);
        let eff = resolve(&m, Some(&o));
        assert_eq!(eff.authority, Authority::Override);
        assert!(eff.is_active());
    }

    #[test]
    fn later_master_update_flips_authority_back() {
        let mut m = item(at(0));
        m.updated_at = at(3);
        m.status = StudyPlanItemStatus::Archived;
        let mut o = item(at(0));
        o.updated_at = at(2);
        let eff = resolve(&m, Some(&o));
        assert_eq!(eff.authority, Authority::Master);
        assert!(!eff.is_active());
    }

    #[test]
    fn deleted_override_is_ignored() {
        let m = item(at(0)).with_dates(Some(at(1)), Some(at(2)));
        let mut o = item(at(0)).with_dates(Some(at(5)), Some(at(6)));
        o.deleted_at = Some(at(1));
        let eff = resolve(&m, Some(&o));
        assert_eq!(eff.start_date, Some(at(1)));
        assert_eq!(eff.authority, Authority::Master);
    }

    #[test]
    fn availability_window_is_inclusive_and_open_ended() {
        let m = item(at(0)).with_availability(Some(at(1)), None);
        let eff = resolve(&m, None);
        assert!(!eff.is_available_at(at(0)));
        assert!(eff.is_available_at(at(1)));
        assert!(eff.is_available_at(at(100)));
    }
}
