//! Hourly / daily / weekly retention over snapshot history.
//!
//! Snapshots are walked newest first and each tier claims snapshots the previous tiers left:
//!
//! * hourly: the newest `hourly` snapshots younger than 24 hours;
//! * daily: the newest remaining snapshot of each calendar day, for `daily` distinct days;
//! * weekly: the newest remaining snapshot of each ISO week, for `weekly` distinct weeks.
//!
//! The newest snapshot, and the newest snapshot that is not corrupt, are kept whatever the
//! policy says. Corrupt snapshots never fill a tier slot, so they cannot push a usable snapshot
//! out of retention.

use crate::backup::result_error::result::Result;
use crate::backup::snapshot::{snapshot_files, SnapshotId, SnapshotInfo};
use bon::Builder;
use chrono::{Datelike, IsoWeek, NaiveDate, NaiveDateTime, TimeDelta};
use getset::CopyGetters;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use validator::Validate;

static DEFAULT_HOURLY: u32 = 24;
static DEFAULT_DAILY: u32 = 7;
static DEFAULT_WEEKLY: u32 = 4;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Validate, Builder, PartialEq, Eq, CopyGetters)]
#[serde(deny_unknown_fields)]
#[getset(get_copy = "pub")]
pub struct RetentionPolicy {
    #[serde(default = "default_hourly")]
    #[builder(default = DEFAULT_HOURLY)]
    #[validate(range(max = 10000))]
    hourly: u32,
    #[serde(default = "default_daily")]
    #[builder(default = DEFAULT_DAILY)]
    #[validate(range(max = 10000))]
    daily: u32,
    #[serde(default = "default_weekly")]
    #[builder(default = DEFAULT_WEEKLY)]
    #[validate(range(max = 10000))]
    weekly: u32,
}

fn default_hourly() -> u32 {
    DEFAULT_HOURLY
}

fn default_daily() -> u32 {
    DEFAULT_DAILY
}

fn default_weekly() -> u32 {
    DEFAULT_WEEKLY
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Anything that carries the id, and therefore the timestamp, of a snapshot.
pub trait Retainable {
    fn snapshot_id(&self) -> &SnapshotId;

    fn is_corrupt(&self) -> bool {
        false
    }
}

impl Retainable for SnapshotId {
    fn snapshot_id(&self) -> &SnapshotId {
        self
    }
}

impl Retainable for SnapshotInfo {
    fn snapshot_id(&self) -> &SnapshotId {
        self.id()
    }

    fn is_corrupt(&self) -> bool {
        SnapshotInfo::is_corrupt(self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetentionPlan<T> {
    /// Newest first.
    pub keep: Vec<T>,
    /// Oldest first.
    pub delete: Vec<T>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub deleted: Vec<SnapshotId>,
    pub failed: Vec<(SnapshotId, String)>,
    pub bytes_reclaimed: u64,
}

/// Claims at most `limit` distinct buckets, one eligible snapshot per bucket, newest first.
fn claim_buckets<K, F>(
    times: &[NaiveDateTime],
    eligible: &[bool],
    kept: &mut [bool],
    limit: u32,
    bucket: F,
) where
    K: Eq + std::hash::Hash,
    F: Fn(&NaiveDateTime) -> K,
{
    let mut seen = HashSet::new();
    for (i, t) in times.iter().enumerate() {
        if seen.len() >= limit as usize {
            break;
        }
        if kept[i] || !eligible[i] {
            continue;
        }
        if seen.insert(bucket(t)) {
            kept[i] = true;
        }
    }
}

fn day(t: &NaiveDateTime) -> NaiveDate {
    t.date()
}

fn iso_week(t: &NaiveDateTime) -> IsoWeek {
    t.iso_week()
}

impl RetentionPolicy {
    /// Splits `snapshots` into those to keep and those to delete at local time `now`.
    pub fn plan<T, I>(&self, snapshots: I, now: NaiveDateTime) -> RetentionPlan<T>
    where
        T: Retainable,
        I: IntoIterator<Item = T>,
    {
        let sorted = snapshots
            .into_iter()
            .sorted_by(|a, b| b.snapshot_id().cmp(a.snapshot_id()))
            .collect_vec();
        let times = sorted
            .iter()
            .map(|s| s.snapshot_id().timestamp())
            .collect_vec();
        let eligible = sorted.iter().map(|s| !s.is_corrupt()).collect_vec();
        let mut kept = vec![false; sorted.len()];
        if let Some(newest) = kept.first_mut() {
            *newest = true;
        }
        if let Some(newest_complete) = eligible.iter().position(|e| *e) {
            kept[newest_complete] = true;
        }

        let hour_window = TimeDelta::hours(24);
        let mut hourly = 0;
        for (i, t) in times.iter().enumerate() {
            if hourly >= self.hourly {
                break;
            }
            if !eligible[i] {
                continue;
            }
            let age = (now - *t).max(TimeDelta::zero());
            if age < hour_window {
                kept[i] = true;
                hourly += 1;
            }
        }

        claim_buckets(&times, &eligible, &mut kept, self.daily, day);
        claim_buckets(&times, &eligible, &mut kept, self.weekly, iso_week);

        let (keep, mut delete): (Vec<_>, Vec<_>) = sorted
            .into_iter()
            .zip(kept)
            .partition_map(|(s, k)| {
                if k {
                    itertools::Either::Left(s)
                } else {
                    itertools::Either::Right(s)
                }
            });
        delete.reverse();
        RetentionPlan { keep, delete }
    }
}

/// Bytes of files held by no other link, i.e. freed by deleting this snapshot.
fn exclusive_bytes(snapshot: &SnapshotInfo) -> u64 {
    snapshot_files(snapshot.path())
        .filter_map(|r| r.ok())
        .filter(|f| f.metadata.nlink() == 1)
        .map(|f| f.metadata.len())
        .sum()
}

/// Deletes the planned snapshots oldest first. One failed deletion does not stop the others.
pub fn apply(plan: &RetentionPlan<SnapshotInfo>) -> Result<PruneReport> {
    let mut report = PruneReport::default();
    for snapshot in &plan.delete {
        let bytes = exclusive_bytes(snapshot);
        tracing::info!("Removing out of retention snapshot {:?}", snapshot.path());
        match std::fs::remove_dir_all(snapshot.path()) {
            Ok(_) => {
                report.bytes_reclaimed += bytes;
                report.deleted.push(snapshot.id().clone());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                report.deleted.push(snapshot.id().clone());
            }
            Err(e) => {
                tracing::warn!("Failed to remove snapshot {}: {}", snapshot.id(), e);
                report.failed.push((snapshot.id().clone(), e.to_string()));
            }
        }
    }
    if !report.deleted.is_empty() {
        tracing::info!(
            "Pruned {} snapshots, reclaimed about {} bytes",
            report.deleted.len(),
            report.bytes_reclaimed
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::snapshot::{SnapshotStatus, SnapshotStore};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn id(t: NaiveDateTime) -> SnapshotId {
        SnapshotId::parse(t.format("%Y-%m-%d-%H%M%S").to_string()).unwrap()
    }

    fn ids(v: &[SnapshotId]) -> Vec<String> {
        v.iter().map(|i| i.to_string()).collect()
    }

    fn policy(hourly: u32, daily: u32, weekly: u32) -> RetentionPolicy {
        RetentionPolicy::builder()
            .hourly(hourly)
            .daily(daily)
            .weekly(weekly)
            .build()
    }

    #[test]
    fn test_newest_always_kept() {
        let now = at(2024, 5, 10, 12, 0);
        let snaps = vec![id(at(2024, 1, 1, 0, 0)), id(at(2023, 1, 1, 0, 0))];
        let plan = policy(0, 0, 0).plan(snaps, now);
        assert_eq!(ids(&plan.keep), vec!["2024-01-01-000000"]);
        assert_eq!(ids(&plan.delete), vec!["2023-01-01-000000"]);

        let empty: RetentionPlan<SnapshotId> = policy(0, 0, 0).plan(vec![], now);
        assert!(empty.keep.is_empty() && empty.delete.is_empty());
    }

    #[test]
    fn test_newest_never_deleted_for_any_policy() {
        let now = at(2024, 5, 10, 12, 0);
        let snaps = (0..60)
            .map(|i| id(at(2024, 5, 10, 11, 0) - TimeDelta::hours(i * 7)))
            .collect_vec();
        let newest = snaps[0].clone();
        for h in 0..3 {
            for d in 0..3 {
                for w in 0..3 {
                    let plan = policy(h, d, w).plan(snaps.clone(), now);
                    assert!(!plan.delete.contains(&newest));
                    assert_eq!(plan.keep[0], newest);
                    assert_eq!(plan.keep.len() + plan.delete.len(), snaps.len());
                }
            }
        }
    }

    fn store_with(dir: &TempDir, snapshots: &[(NaiveDateTime, bool)]) -> SnapshotStore {
        let store = SnapshotStore::new(dir.path());
        for (t, corrupt) in snapshots {
            std::fs::create_dir(store.path_of(&id(*t))).unwrap();
            if *corrupt {
                let info = store.get(id(*t).as_str()).unwrap();
                store.mark_status(&info, SnapshotStatus::Corrupt).unwrap();
            }
        }
        store
    }

    #[test]
    fn test_corrupt_newest_keeps_newest_complete() {
        let dir = TempDir::new().unwrap();
        let store = store_with(
            &dir,
            &[
                (at(2024, 5, 10, 11, 0), true),
                (at(2024, 5, 10, 10, 0), false),
                (at(2024, 5, 10, 9, 0), false),
            ],
        );
        let now = at(2024, 5, 10, 12, 0);

        for p in [policy(0, 0, 0), policy(1, 0, 0)] {
            let plan = p.plan(store.list().unwrap(), now);
            let keep = plan.keep.iter().map(|s| s.id().clone()).collect_vec();
            let delete = plan.delete.iter().map(|s| s.id().clone()).collect_vec();
            assert_eq!(ids(&keep), vec!["2024-05-10-110000", "2024-05-10-100000"]);
            assert_eq!(ids(&delete), vec!["2024-05-10-090000"]);
        }

        let plan = policy(2, 0, 0).plan(store.list().unwrap(), now);
        assert_eq!(plan.keep.len(), 3);
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn test_corrupt_snapshots_do_not_fill_slots() {
        let dir = TempDir::new().unwrap();
        let store = store_with(
            &dir,
            &[
                (at(2024, 5, 10, 11, 0), false),
                (at(2024, 5, 9, 20, 0), true),
                (at(2024, 5, 9, 8, 0), false),
                (at(2024, 5, 8, 8, 0), true),
            ],
        );

        let plan = policy(0, 2, 0).plan(store.list().unwrap(), at(2024, 5, 10, 12, 0));
        let keep = plan.keep.iter().map(|s| s.id().clone()).collect_vec();
        let delete = plan.delete.iter().map(|s| s.id().clone()).collect_vec();
        assert_eq!(ids(&keep), vec!["2024-05-10-110000", "2024-05-09-080000"]);
        assert_eq!(ids(&delete), vec!["2024-05-08-080000", "2024-05-09-200000"]);
    }

    #[test]
    fn test_hourly_window_is_24_hours() {
        let now = at(2024, 5, 10, 12, 0);
        let snaps = vec![
            id(at(2024, 5, 10, 11, 0)),
            id(at(2024, 5, 9, 12, 1)),
            id(at(2024, 5, 9, 12, 0)),
        ];
        let plan = policy(10, 0, 0).plan(snaps, now);
        assert_eq!(
            ids(&plan.keep),
            vec!["2024-05-10-110000", "2024-05-09-120100"]
        );
        assert_eq!(ids(&plan.delete), vec!["2024-05-09-120000"]);
    }

    #[test]
    fn test_hourly_limit() {
        let now = at(2024, 5, 10, 12, 0);
        let snaps = (1..=5).map(|h| id(at(2024, 5, 10, h, 0))).collect_vec();
        let plan = policy(2, 0, 0).plan(snaps, now);
        assert_eq!(
            ids(&plan.keep),
            vec!["2024-05-10-050000", "2024-05-10-040000"]
        );
        assert_eq!(
            ids(&plan.delete),
            vec!["2024-05-10-010000", "2024-05-10-020000", "2024-05-10-030000"]
        );
    }

    #[test]
    fn test_daily_buckets_cross_midnight() {
        let now = at(2024, 5, 20, 12, 0);
        let snaps = vec![
            id(at(2024, 5, 12, 0, 1)),
            id(at(2024, 5, 11, 23, 59)),
            id(at(2024, 5, 11, 8, 0)),
            id(at(2024, 5, 10, 23, 0)),
        ];
        let plan = policy(0, 3, 0).plan(snaps, now);
        // The newest is kept outside the daily tier, so its day is not used up.
        assert_eq!(
            ids(&plan.keep),
            vec!["2024-05-12-000100", "2024-05-11-235900", "2024-05-10-230000"]
        );
        assert_eq!(ids(&plan.delete), vec!["2024-05-11-080000"]);
    }

    #[test]
    fn test_same_day_keeps_most_recent() {
        let now = at(2024, 5, 20, 12, 0);
        let snaps = vec![
            id(at(2024, 5, 15, 9, 0)),
            id(at(2024, 5, 15, 18, 0)),
            id(at(2024, 5, 15, 12, 0)),
            id(at(2024, 5, 16, 12, 0)),
        ];
        let plan = policy(0, 2, 0).plan(snaps, now);
        assert_eq!(
            ids(&plan.keep),
            vec!["2024-05-16-120000", "2024-05-15-180000"]
        );
        assert_eq!(
            ids(&plan.delete),
            vec!["2024-05-15-090000", "2024-05-15-120000"]
        );
    }

    #[test]
    fn test_weekly_buckets_start_monday() {
        // 2024-05-12 is a Sunday, 2024-05-13 a Monday.
        let now = at(2024, 6, 30, 12, 0);
        let snaps = vec![
            id(at(2024, 5, 20, 10, 0)),
            id(at(2024, 5, 13, 0, 30)),
            id(at(2024, 5, 12, 23, 30)),
            id(at(2024, 5, 8, 10, 0)),
            id(at(2024, 5, 1, 10, 0)),
        ];
        let plan = policy(0, 0, 3).plan(snaps, now);
        assert_eq!(
            ids(&plan.keep),
            vec![
                "2024-05-20-100000",
                "2024-05-13-003000",
                "2024-05-12-233000",
                "2024-05-01-100000",
            ]
        );
        assert_eq!(ids(&plan.delete), vec!["2024-05-08-100000"]);
    }

    #[test]
    fn test_tiers_take_from_what_is_left() {
        let now = at(2024, 5, 10, 12, 0);
        let snaps = vec![
            id(at(2024, 5, 10, 11, 0)),
            id(at(2024, 5, 10, 10, 0)),
            id(at(2024, 5, 9, 9, 0)),
            id(at(2024, 5, 8, 9, 0)),
            id(at(2024, 5, 7, 9, 0)),
            id(at(2024, 4, 20, 9, 0)),
        ];
        let plan = policy(2, 2, 1).plan(snaps, now);
        assert_eq!(
            ids(&plan.keep),
            vec![
                "2024-05-10-110000",
                "2024-05-10-100000",
                "2024-05-09-090000",
                "2024-05-08-090000",
                "2024-05-07-090000",
            ]
        );
        assert_eq!(ids(&plan.delete), vec!["2024-04-20-090000"]);
    }

    #[test]
    fn test_collision_suffix_sorts_after_base() {
        let now = at(2024, 5, 20, 12, 0);
        let base = SnapshotId::parse("2024-05-15-120000").unwrap();
        let suffixed = SnapshotId::parse("2024-05-15-120000-01").unwrap();
        let plan = policy(0, 0, 0).plan(vec![base.clone(), suffixed.clone()], now);
        assert_eq!(plan.keep, vec![suffixed]);
        assert_eq!(plan.delete, vec![base]);
    }

    #[test]
    fn test_apply_counts_exclusive_bytes_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        let old = id(at(2024, 5, 1, 0, 0));
        let new = id(at(2024, 5, 2, 0, 0));
        for s in [&old, &new] {
            std::fs::create_dir_all(store.path_of(s).join("app")).unwrap();
        }
        std::fs::write(store.path_of(&old).join("app/shared"), "shared").unwrap();
        std::fs::hard_link(
            store.path_of(&old).join("app/shared"),
            store.path_of(&new).join("app/shared"),
        )
        .unwrap();
        std::fs::write(store.path_of(&old).join("app/own"), "1234567").unwrap();

        let plan = policy(0, 0, 0).plan(store.list().unwrap(), at(2024, 5, 3, 0, 0));
        assert_eq!(plan.delete.len(), 1);

        let report = apply(&plan).unwrap();
        assert_eq!(report.deleted, vec![old.clone()]);
        assert_eq!(report.bytes_reclaimed, 7);
        assert!(!store.path_of(&old).exists());
        assert_eq!(
            std::fs::read_to_string(store.path_of(&new).join("app/shared")).unwrap(),
            "shared"
        );

        let again = apply(&plan).unwrap();
        assert_eq!(again.deleted, vec![old]);
        assert!(again.failed.is_empty());
        assert_eq!(again.bytes_reclaimed, 0);
    }

    #[test]
    fn test_policy_from_yaml_defaults() {
        let policy: RetentionPolicy = serde_yml::from_str("daily: 3").unwrap();
        assert_eq!((policy.hourly(), policy.daily(), policy.weekly()), (24, 3, 4));
    }
}
