use chrono::Utc;
use diesel::prelude::*;
use rand::{distr::Alphanumeric, rng, Rng};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{tier::SubscriptionTier, Db, DbResult};
use crate::error::ApiError;
use crate::schema::api_keys;

pub const SECRET_SCHEME: &str = "tg_";
const SECRET_RANDOM_LEN: usize = 48;
const PREFIX_DISPLAY_LEN: usize = 8;

/// Stored credential record. The raw secret is never persisted; only its
/// SHA-256 hash and a short display prefix survive creation.
#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = api_keys)]
pub struct ApiKey {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub prefix: String,
    pub is_active: bool,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = api_keys)]
struct NewApiKey<'a> {
    id: &'a str,
    owner_id: &'a str,
    name: &'a str,
    secret_hash: &'a str,
    prefix: &'a str,
    is_active: bool,
    created_at: i64,
}

/// Identity resolved from a raw secret, with the caller's effective tier.
#[derive(Debug, Clone)]
pub struct ResolvedKey {
    pub key_id: String,
    pub owner_id: String,
    pub tier: SubscriptionTier,
}

pub fn hash_secret(raw_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl ApiKey {
    /// Generates a fresh key for `owner_id` and returns the record together
    /// with the raw secret. The raw secret is shown to the owner exactly once.
    pub fn create(db: &Db, owner_id: &str, name: &str) -> DbResult<(ApiKey, String)> {
        let random_part: String = rng()
            .sample_iter(&Alphanumeric)
            .take(SECRET_RANDOM_LEN)
            .map(char::from)
            .collect();
        let raw_secret = format!("{}{}", SECRET_SCHEME, random_part);
        let secret_hash = hash_secret(&raw_secret);
        let prefix: String = raw_secret.chars().take(PREFIX_DISPLAY_LEN).collect();
        let id = Uuid::new_v4().to_string();

        let new_key = NewApiKey {
            id: &id,
            owner_id,
            name,
            secret_hash: &secret_hash,
            prefix: &prefix,
            is_active: true,
            created_at: Utc::now().timestamp_millis(),
        };

        let conn = &mut db.conn()?;
        let inserted = diesel::insert_into(api_keys::table)
            .values(&new_key)
            .returning(ApiKey::as_returning())
            .get_result::<ApiKey>(conn)?;
        Ok((inserted, raw_secret))
    }

    /// Hashes the raw secret and looks the record up by hash. Revoked keys
    /// fail exactly like absent ones.
    pub fn resolve(db: &Db, raw_secret: &str) -> DbResult<Option<ResolvedKey>> {
        let secret_hash = hash_secret(raw_secret);
        let conn = &mut db.conn()?;
        let found = api_keys::table
            .filter(
                api_keys::secret_hash
                    .eq(&secret_hash)
                    .and(api_keys::is_active.eq(true)),
            )
            .select(ApiKey::as_select())
            .first::<ApiKey>(conn)
            .optional()?;

        let Some(key) = found else {
            return Ok(None);
        };
        let tier = SubscriptionTier::for_owner(db, &key.owner_id)?;
        Ok(Some(ResolvedKey {
            key_id: key.id,
            owner_id: key.owner_id,
            tier,
        }))
    }

    /// Records key usage for dashboard freshness. Best-effort: callers are
    /// expected to spawn this off the critical path.
    pub fn touch(db: &Db, key_id: &str) -> DbResult<()> {
        let conn = &mut db.conn()?;
        diesel::update(api_keys::table.find(key_id))
            .set(api_keys::last_used_at.eq(Some(Utc::now().timestamp_millis())))
            .execute(conn)?;
        Ok(())
    }

    /// Soft-deletes the key. Revocation only succeeds for the owning caller;
    /// anyone else gets Forbidden without mutation.
    pub fn revoke(db: &Db, key_id: &str, owner_id: &str) -> DbResult<()> {
        let conn = &mut db.conn()?;
        let affected = diesel::update(
            api_keys::table.filter(api_keys::id.eq(key_id).and(api_keys::owner_id.eq(owner_id))),
        )
        .set(api_keys::is_active.eq(false))
        .execute(conn)?;

        if affected == 0 {
            let exists = api_keys::table
                .find(key_id)
                .count()
                .get_result::<i64>(conn)?;
            if exists > 0 {
                return Err(ApiError::Forbidden(
                    "api key belongs to a different owner".to_string(),
                ));
            }
            return Err(ApiError::NotFound("api key not found".to_string()));
        }
        Ok(())
    }

    pub fn list_for_owner(db: &Db, owner_id: &str) -> DbResult<Vec<ApiKey>> {
        let conn = &mut db.conn()?;
        Ok(api_keys::table
            .filter(api_keys::owner_id.eq(owner_id))
            .order(api_keys::created_at.desc())
            .select(ApiKey::as_select())
            .load::<ApiKey>(conn)?)
    }
}
