//! # Postgres based CVR store
//!
//! This postgres-based backend implements the `CvrStore` trait defined in
//! `rowsync-core`.
//!
//! ## Design Decisions
//!
//! ### Version columns
//!
//! CVR versions are a `(state, minor)` pair. Both halves are stored as
//! separate columns (`*_state VARCHAR`, `*_minor BIGINT`) instead of one
//! rendered cookie so that range predicates used by catch-up reads stay
//! sargable: the state token encoding is lexicographically ordered, so
//! `(state, minor)` tuple comparisons in SQL agree with the in-memory
//! ordering.
//!
//! ### Soft deletes
//!
//! Clients, queries, desires and rows are never deleted by the syncer; they
//! are tombstoned with `deleted = true` (rows: `ref_counts IS NULL`) and the
//! patch version of their removal. Catch-up replay after reconnect depends on
//! these tombstones, so retention is the CVR's lifetime. The instance row is
//! dropped only by out-of-band expiry of the whole group.
//!
//! ### Ownership lease
//!
//! The instance row doubles as the fencing lease: `(owner, granted_at)` names
//! the only process allowed to flush. `load` claims the lease iff the stored
//! `granted_at` precedes the caller's connection time; `flush` re-verifies the
//! lease inside its transaction. A process observing a foreign lease must
//! terminate its syncer for that group.
//!
//! ### Atomic Transactions
//!
//! Operations on this gateway each open one transaction; partial visibility of
//! a flush is never possible. Within a transaction the instance row is read
//! first and all verification happens against it, which serializes competing
//! flushes on the row lock.

use diesel::ConnectionError;
use diesel_async::{
    pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager},
    AsyncPgConnection,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use rowsync_core::storage::StorageError;
use tracing::info;

mod cvr;
mod orm;
mod schema;

pub use cvr::PgCvrStore;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations/");

pub(crate) struct PostgresError(StorageError);

impl From<diesel::result::Error> for PostgresError {
    fn from(value: diesel::result::Error) -> Self {
        PostgresError(StorageError::Unexpected(format!("DieselError: {}", value)))
    }
}

impl From<PostgresError> for StorageError {
    fn from(value: PostgresError) -> Self {
        value.0
    }
}

impl From<StorageError> for PostgresError {
    fn from(value: StorageError) -> Self {
        PostgresError(value)
    }
}

/// Establishes a connection pool to the database and runs pending migrations.
///
/// # Arguments
///
/// - `db_url`: URL of the database to connect to.
///
/// # Returns
///
/// A deadpool pool of `AsyncPgConnection`s, or a `StorageError` if the pool
/// could not be created.
pub async fn connect(db_url: &str) -> Result<Pool<AsyncPgConnection>, StorageError> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(db_url);
    let pool = Pool::builder(config)
        .build()
        .map_err(|err| StorageError::Unexpected(format!("{}", err)))?;
    run_migrations(db_url)?;
    Ok(pool)
}

fn run_migrations(db_url: &str) -> Result<(), StorageError> {
    use diesel::Connection;
    info!("Upgrading database...");
    let mut conn = diesel::PgConnection::establish(db_url)
        .map_err(|err: ConnectionError| StorageError::Unexpected(err.to_string()))?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| StorageError::Unexpected(format!("migrations failed: {}", err)))?;
    Ok(())
}

pub mod testing {
    //! # Reusable components to write tests against the DB.
    //!
    //! Tests using [`run_against_db`] commit real data and have to run
    //! serially against a migrated database named by `DATABASE_URL`. They are
    //! `#[ignore]`d in the default suite; the same semantics are exercised
    //! against the in-memory store.
    use diesel::sql_query;
    use diesel_async::{
        pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager},
        AsyncPgConnection, RunQueryDsl,
    };
    use std::future::Future;

    async fn setup_pool() -> Pool<AsyncPgConnection> {
        let database_url =
            std::env::var("DATABASE_URL").expect("Database URL must be set for testing");
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        Pool::builder(config).build().unwrap()
    }

    async fn teardown(conn: &mut AsyncPgConnection) {
        let tables = vec![
            "cvr_rows_version",
            "cvr_rows",
            "cvr_desires",
            "cvr_queries",
            "cvr_clients",
            "cvr_instances",
        ];
        for t in tables.iter() {
            sql_query(format!("DELETE FROM {};", t))
                .execute(conn)
                .await
                .unwrap_or_else(|_| panic!("Error truncating {} table", t));
        }
    }

    /// Run tests that require committing data to the db.
    ///
    /// The method passes a connection pool to the test function, catches any
    /// panics and purges all CVR tables so the next test starts from a clean
    /// slate.
    pub async fn run_against_db<F, Fut>(test_f: F)
    where
        F: FnOnce(Pool<AsyncPgConnection>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let connection_pool = setup_pool().await;
        let inner_pool = connection_pool.clone();
        let res = tokio::spawn(async move {
            test_f(inner_pool).await;
        })
        .await;

        let mut connection = connection_pool
            .get()
            .await
            .expect("Failed to get a connection from the pool");

        teardown(&mut connection).await;
        res.unwrap();
    }
}
