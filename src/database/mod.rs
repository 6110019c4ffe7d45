use std::{fs::File, path::Path};

use diesel::{
    connection::SimpleConnection,
    r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection},
    Connection, SqliteConnection,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::error::ApiError;

pub mod api_key;
pub mod rate_limit;
pub mod request_record;
pub mod tier;
pub mod usage;

pub type DbResult<T> = Result<T, ApiError>;
pub type DbConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Debug, Clone, Copy)]
struct SqlitePragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA busy_timeout = 5000; PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Connection pool over the single SQLite store shared by counters, usage
/// windows and the request ledger.
#[derive(Clone)]
pub struct Db {
    pool: Pool<ConnectionManager<SqliteConnection>>,
}

impl Db {
    pub fn connect(db_url: &str) -> Result<Self, ApiError> {
        let db_path = Path::new(db_url);
        if !db_path.exists() {
            if let Some(parent_dir) = db_path.parent() {
                if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                    std::fs::create_dir_all(parent_dir).map_err(|e| {
                        ApiError::Internal(format!("failed to create database directory: {}", e))
                    })?;
                }
            }
            File::create(db_path).map_err(|e| {
                ApiError::Internal(format!("failed to create database file: {}", e))
            })?;
        }

        let mut connection = SqliteConnection::establish(db_url).map_err(|e| {
            ApiError::Internal(format!("failed to establish migration connection: {}", e))
        })?;
        connection
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| ApiError::Internal(format!("failed to run migrations: {}", e)))?;

        let manager = ConnectionManager::<SqliteConnection>::new(db_url);
        let pool = Pool::builder()
            .test_on_check_out(true)
            .max_size(5)
            .connection_customizer(Box::new(SqlitePragmas))
            .build(manager)
            .map_err(|e| ApiError::Internal(format!("failed to create pool: {}", e)))?;

        Ok(Self { pool })
    }

    pub fn conn(&self) -> DbResult<DbConnection> {
        Ok(self.pool.get()?)
    }
}
