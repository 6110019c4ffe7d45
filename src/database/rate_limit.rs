use diesel::prelude::*;

use super::{Db, DbResult};
use crate::schema::rate_limit_counters;

pub const WINDOW_MS: i64 = 60_000;

/// Start of the fixed minute window containing `now_ms`.
pub fn window_start(now_ms: i64) -> i64 {
    now_ms - now_ms.rem_euclid(WINDOW_MS)
}

#[derive(Debug, PartialEq, Eq)]
pub enum RateDecision {
    Admitted { count: i64 },
    /// `retry_after` is the unix-second start of the next window.
    Rejected { retry_after: i64 },
}

/// Counts one request against the key's current minute window, admitting only
/// while the stored count stays below `ceiling`. Both steps are single
/// statements, so two concurrent requests can never both observe "one below
/// the limit" and slip through. The stored count never exceeds the ceiling.
pub fn check_and_increment(
    db: &Db,
    api_key_id: &str,
    ceiling: i64,
    now_ms: i64,
) -> DbResult<RateDecision> {
    let start = window_start(now_ms);
    let retry_after = (start + WINDOW_MS) / 1000;

    if ceiling <= 0 {
        return Ok(RateDecision::Rejected { retry_after });
    }

    let conn = &mut db.conn()?;

    let inserted = diesel::insert_into(rate_limit_counters::table)
        .values((
            rate_limit_counters::api_key_id.eq(api_key_id),
            rate_limit_counters::window_start.eq(start),
            rate_limit_counters::request_count.eq(1_i64),
        ))
        .on_conflict_do_nothing()
        .execute(conn)?;
    if inserted == 1 {
        return Ok(RateDecision::Admitted { count: 1 });
    }

    // Row exists: conditional increment. Zero affected rows means the window
    // is already at the ceiling.
    let updated: Option<i64> = diesel::update(
        rate_limit_counters::table.filter(
            rate_limit_counters::api_key_id
                .eq(api_key_id)
                .and(rate_limit_counters::window_start.eq(start))
                .and(rate_limit_counters::request_count.lt(ceiling)),
        ),
    )
    .set(rate_limit_counters::request_count.eq(rate_limit_counters::request_count + 1))
    .returning(rate_limit_counters::request_count)
    .get_result::<i64>(conn)
    .optional()?;

    match updated {
        Some(count) => Ok(RateDecision::Admitted { count }),
        None => Ok(RateDecision::Rejected { retry_after }),
    }
}

/// Drops counters from windows that ended before `older_than_ms`. Expired
/// windows are never resurrected, so this is purely hygiene.
pub fn prune(db: &Db, older_than_ms: i64) -> DbResult<usize> {
    let conn = &mut db.conn()?;
    Ok(diesel::delete(
        rate_limit_counters::table.filter(rate_limit_counters::window_start.lt(older_than_ms)),
    )
    .execute(conn)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::test_db;

    const NOW: i64 = 1_756_000_000_000;

    #[test]
    fn window_start_truncates_to_minute() {
        assert_eq!(window_start(0), 0);
        assert_eq!(window_start(59_999), 0);
        assert_eq!(window_start(60_000), 60_000);
        assert_eq!(window_start(61_500), 60_000);
    }

    #[test]
    fn admits_up_to_ceiling_then_rejects_with_next_window() {
        let (db, _dir) = test_db();
        for i in 1..=10 {
            let decision = check_and_increment(&db, "key-1", 10, NOW).unwrap();
            assert_eq!(decision, RateDecision::Admitted { count: i });
        }

        let decision = check_and_increment(&db, "key-1", 10, NOW).unwrap();
        let expected_retry = (window_start(NOW) + WINDOW_MS) / 1000;
        assert_eq!(
            decision,
            RateDecision::Rejected {
                retry_after: expected_retry
            }
        );
    }

    #[test]
    fn stored_count_never_exceeds_ceiling() {
        let (db, _dir) = test_db();
        for _ in 0..20 {
            let _ = check_and_increment(&db, "key-1", 5, NOW).unwrap();
        }
        // A fresh admission attempt still sees the window at the ceiling.
        assert!(matches!(
            check_and_increment(&db, "key-1", 5, NOW).unwrap(),
            RateDecision::Rejected { .. }
        ));
    }

    #[test]
    fn new_window_resets_the_counter() {
        let (db, _dir) = test_db();
        for _ in 0..3 {
            check_and_increment(&db, "key-1", 3, NOW).unwrap();
        }
        assert!(matches!(
            check_and_increment(&db, "key-1", 3, NOW).unwrap(),
            RateDecision::Rejected { .. }
        ));

        let next_window = NOW + WINDOW_MS;
        assert_eq!(
            check_and_increment(&db, "key-1", 3, next_window).unwrap(),
            RateDecision::Admitted { count: 1 }
        );
    }

    #[test]
    fn keys_do_not_share_windows() {
        let (db, _dir) = test_db();
        check_and_increment(&db, "key-1", 1, NOW).unwrap();
        assert!(matches!(
            check_and_increment(&db, "key-1", 1, NOW).unwrap(),
            RateDecision::Rejected { .. }
        ));
        assert_eq!(
            check_and_increment(&db, "key-2", 1, NOW).unwrap(),
            RateDecision::Admitted { count: 1 }
        );
    }

    #[test]
    fn concurrent_admissions_respect_the_ceiling_exactly() {
        let (db, _dir) = test_db();
        let ceiling = 7;

        let admitted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let db = db.clone();
                    scope.spawn(move || {
                        matches!(
                            check_and_increment(&db, "key-1", ceiling, NOW).unwrap(),
                            RateDecision::Admitted { .. }
                        )
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|&admitted| admitted)
                .count()
        });

        assert_eq!(admitted as i64, ceiling);
        // No over-admitted request left a trace either.
        assert!(matches!(
            check_and_increment(&db, "key-1", ceiling, NOW).unwrap(),
            RateDecision::Rejected { .. }
        ));
    }

    #[test]
    fn zero_ceiling_rejects_without_writing() {
        let (db, _dir) = test_db();
        assert!(matches!(
            check_and_increment(&db, "key-1", 0, NOW).unwrap(),
            RateDecision::Rejected { .. }
        ));
    }

    #[test]
    fn prune_removes_only_stale_windows() {
        let (db, _dir) = test_db();
        check_and_increment(&db, "key-1", 5, NOW).unwrap();
        check_and_increment(&db, "key-1", 5, NOW + WINDOW_MS).unwrap();

        let removed = prune(&db, window_start(NOW + WINDOW_MS)).unwrap();
        assert_eq!(removed, 1);
    }
}
