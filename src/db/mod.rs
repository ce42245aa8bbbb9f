//! Database pool initialization.
//!
//! SYSTEM CONTEXT
//! ==============
//! The CLI uses this module to create the shared SQLx pool for the Postgres
//! store adapter. The schema belongs to the hosted backend; nothing here
//! creates or migrates tables.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::env_parse;

const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

/// Initialize the `PostgreSQL` connection pool.
///
/// Pool size comes from `DB_MAX_CONNECTIONS` (default 5). Each open
/// realtime subscription holds one extra dedicated connection outside the
/// pool.
///
/// # Errors
///
/// Returns an error if the connection fails.
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS).max(1))
        .connect(database_url)
        .await
}
