use diesel::prelude::*;
use serde::Serialize;

use super::{Db, DbResult};
use crate::schema::request_records;

/// One immutable ledger row per completed or failed request. The sole source
/// of truth for analytics and billing disputes.
#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize)]
#[diesel(table_name = request_records)]
pub struct RequestRecord {
    pub id: String,
    pub owner_id: String,
    pub api_key_id: Option<String>,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost_micro: i64,
    pub http_status: i32,
    pub latency_ms: i64,
    pub is_streaming: bool,
    pub status: String,
    pub created_at: i64,
}

impl RequestRecord {
    pub fn insert(db: &Db, record: &RequestRecord) -> DbResult<()> {
        let conn = &mut db.conn()?;
        diesel::insert_into(request_records::table)
            .values(record)
            .execute(conn)?;
        Ok(())
    }

    pub fn list_for_owner(db: &Db, owner_id: &str, limit: i64) -> DbResult<Vec<RequestRecord>> {
        let conn = &mut db.conn()?;
        Ok(request_records::table
            .filter(request_records::owner_id.eq(owner_id))
            .order(request_records::created_at.desc())
            .limit(limit)
            .select(RequestRecord::as_select())
            .load::<RequestRecord>(conn)?)
    }
}
