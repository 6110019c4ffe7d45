use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use super::{Db, DbResult};
use crate::schema::usage_windows;

/// Per-owner, per-calendar-month aggregate used for quota enforcement and
/// billing.
#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = usage_windows)]
pub struct UsageWindow {
    pub owner_id: String,
    pub period_key: String,
    pub total_tokens: i64,
    pub total_requests: i64,
    pub total_cost_micro: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UsageDelta {
    pub tokens: i64,
    pub requests: i64,
    pub cost_micro: i64,
}

/// Calendar-month key, e.g. "2025-11".
pub fn period_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

pub fn current_period_key() -> String {
    period_key(Utc::now())
}

impl UsageWindow {
    pub fn get(db: &Db, owner_id: &str, period: &str) -> DbResult<Option<UsageWindow>> {
        let conn = &mut db.conn()?;
        Ok(usage_windows::table
            .find((owner_id, period))
            .select(UsageWindow::as_select())
            .first::<UsageWindow>(conn)
            .optional()?)
    }

    /// Additively folds `delta` into the owner's window for `period`. A single
    /// upsert statement, so concurrent requests cannot lose increments.
    pub fn apply(db: &Db, owner_id: &str, period: &str, delta: UsageDelta) -> DbResult<()> {
        let conn = &mut db.conn()?;
        diesel::insert_into(usage_windows::table)
            .values((
                usage_windows::owner_id.eq(owner_id),
                usage_windows::period_key.eq(period),
                usage_windows::total_tokens.eq(delta.tokens),
                usage_windows::total_requests.eq(delta.requests),
                usage_windows::total_cost_micro.eq(delta.cost_micro),
            ))
            .on_conflict((usage_windows::owner_id, usage_windows::period_key))
            .do_update()
            .set((
                usage_windows::total_tokens.eq(usage_windows::total_tokens + delta.tokens),
                usage_windows::total_requests.eq(usage_windows::total_requests + delta.requests),
                usage_windows::total_cost_micro
                    .eq(usage_windows::total_cost_micro + delta.cost_micro),
            ))
            .execute(conn)?;
        Ok(())
    }
}
