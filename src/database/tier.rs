use chrono::Utc;
use diesel::prelude::*;
use serde::Serialize;

use super::{Db, DbResult};
use crate::schema::{subscription_tiers, subscriptions};

/// Reference data: named subscription levels. Changed by administrative
/// action only, never on the hot path.
#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = subscription_tiers)]
pub struct SubscriptionTier {
    pub name: String,
    /// None means the monthly token allowance is unbounded.
    pub tokens_per_month: Option<i64>,
    pub requests_per_minute: i64,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = subscriptions)]
pub struct Subscription {
    pub owner_id: String,
    pub tier_name: String,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

pub const DEFAULT_TIER: &str = "free";

impl SubscriptionTier {
    pub fn by_name(db: &Db, name: &str) -> DbResult<Option<SubscriptionTier>> {
        let conn = &mut db.conn()?;
        Ok(subscription_tiers::table
            .find(name)
            .select(SubscriptionTier::as_select())
            .first::<SubscriptionTier>(conn)
            .optional()?)
    }

    /// Effective tier for an owner: the active subscription's tier, or the
    /// free tier when no subscription row exists.
    pub fn for_owner(db: &Db, owner_id: &str) -> DbResult<SubscriptionTier> {
        let conn = &mut db.conn()?;
        let tier = subscriptions::table
            .inner_join(
                subscription_tiers::table
                    .on(subscription_tiers::name.eq(subscriptions::tier_name)),
            )
            .filter(
                subscriptions::owner_id
                    .eq(owner_id)
                    .and(subscriptions::status.eq("active")),
            )
            .select(SubscriptionTier::as_select())
            .first::<SubscriptionTier>(conn)
            .optional()?;

        match tier {
            Some(tier) => Ok(tier),
            None => {
                let fallback = subscription_tiers::table
                    .find(DEFAULT_TIER)
                    .select(SubscriptionTier::as_select())
                    .first::<SubscriptionTier>(conn)?;
                Ok(fallback)
            }
        }
    }
}

impl Subscription {
    /// Upserts the owner's subscription to the named tier.
    pub fn assign(db: &Db, owner_id: &str, tier_name: &str) -> DbResult<()> {
        let now = Utc::now().timestamp_millis();
        let conn = &mut db.conn()?;
        diesel::insert_into(subscriptions::table)
            .values((
                subscriptions::owner_id.eq(owner_id),
                subscriptions::tier_name.eq(tier_name),
                subscriptions::status.eq("active"),
                subscriptions::created_at.eq(now),
                subscriptions::updated_at.eq(now),
            ))
            .on_conflict(subscriptions::owner_id)
            .do_update()
            .set((
                subscriptions::tier_name.eq(tier_name),
                subscriptions::status.eq("active"),
                subscriptions::updated_at.eq(now),
            ))
            .execute(conn)?;
        Ok(())
    }
}
