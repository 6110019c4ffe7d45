use chrono::Utc;

use crate::database::api_key::ResolvedKey;
use crate::database::rate_limit::{check_and_increment, RateDecision};
use crate::database::usage::{current_period_key, UsageWindow};
use crate::database::Db;
use crate::error::ApiError;

/// Gate every dispatch behind the caller's tier: the per-key minute rate
/// first, then the owner's monthly token quota. The quota check happens
/// before dispatch, so the last admitted request may overshoot the monthly
/// allowance by its own token count; mid-stream cutoffs are deliberately not
/// attempted.
pub fn admit(db: &Db, caller: &ResolvedKey) -> Result<(), ApiError> {
    let now_ms = Utc::now().timestamp_millis();
    match check_and_increment(db, &caller.key_id, caller.tier.requests_per_minute, now_ms)? {
        RateDecision::Admitted { .. } => {}
        RateDecision::Rejected { retry_after } => {
            return Err(ApiError::RateLimited { retry_after });
        }
    }

    if let Some(limit) = caller.tier.tokens_per_month {
        let used = UsageWindow::get(db, &caller.owner_id, &current_period_key())?
            .map(|window| window.total_tokens)
            .unwrap_or(0);
        if used >= limit {
            return Err(ApiError::QuotaExceeded);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tier::SubscriptionTier;
    use crate::database::test_support::test_db;
    use crate::database::usage::UsageDelta;

    fn caller(owner: &str, key: &str, tokens_per_month: Option<i64>, rpm: i64) -> ResolvedKey {
        ResolvedKey {
            key_id: key.to_string(),
            owner_id: owner.to_string(),
            tier: SubscriptionTier {
                name: "test".to_string(),
                tokens_per_month,
                requests_per_minute: rpm,
            },
        }
    }

    #[test]
    fn admits_within_rate_and_quota() {
        let (db, _dir) = test_db();
        let caller = caller("owner-1", "key-1", Some(1000), 5);
        assert!(admit(&db, &caller).is_ok());
    }

    #[test]
    fn rate_ceiling_rejects_with_retry_after() {
        let (db, _dir) = test_db();
        let caller = caller("owner-1", "key-1", None, 2);
        admit(&db, &caller).unwrap();
        admit(&db, &caller).unwrap();

        let err = admit(&db, &caller).unwrap_err();
        assert!(matches!(err, ApiError::RateLimited { retry_after } if retry_after > 0));
    }

    #[test]
    fn exhausted_quota_rejects() {
        let (db, _dir) = test_db();
        let caller = caller("owner-1", "key-1", Some(100), 10);
        UsageWindow::apply(
            &db,
            "owner-1",
            &current_period_key(),
            UsageDelta {
                tokens: 100,
                requests: 1,
                cost_micro: 0,
            },
        )
        .unwrap();

        let err = admit(&db, &caller).unwrap_err();
        assert!(matches!(err, ApiError::QuotaExceeded));
    }

    #[test]
    fn last_request_under_quota_is_admitted() {
        let (db, _dir) = test_db();
        let caller = caller("owner-1", "key-1", Some(100), 10);
        UsageWindow::apply(
            &db,
            "owner-1",
            &current_period_key(),
            UsageDelta {
                tokens: 99,
                requests: 1,
                cost_micro: 0,
            },
        )
        .unwrap();

        // One token of headroom still admits; the overshoot lands on the
        // next admission check instead.
        assert!(admit(&db, &caller).is_ok());
    }

    #[test]
    fn unlimited_tier_ignores_usage() {
        let (db, _dir) = test_db();
        let caller = caller("owner-1", "key-1", None, 10);
        UsageWindow::apply(
            &db,
            "owner-1",
            &current_period_key(),
            UsageDelta {
                tokens: 10_000_000,
                requests: 1,
                cost_micro: 0,
            },
        )
        .unwrap();

        assert!(admit(&db, &caller).is_ok());
    }

    #[test]
    fn rate_rejection_precedes_quota_rejection() {
        let (db, _dir) = test_db();
        let caller = caller("owner-1", "key-1", Some(1), 1);
        UsageWindow::apply(
            &db,
            "owner-1",
            &current_period_key(),
            UsageDelta {
                tokens: 5,
                requests: 1,
                cost_micro: 0,
            },
        )
        .unwrap();

        // First call consumes the rate window and reports the quota breach.
        assert!(matches!(admit(&db, &caller).unwrap_err(), ApiError::QuotaExceeded));
        // Second call never reaches the quota check.
        assert!(matches!(
            admit(&db, &caller).unwrap_err(),
            ApiError::RateLimited { .. }
        ));
    }
}
