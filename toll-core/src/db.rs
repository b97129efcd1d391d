use std::path::Path;

use anyhow::{Context, Result};
use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness};

/// Write-ahead logging plus a busy timeout so concurrent wallet
/// transactions queue on SQLite's write lock instead of erroring.
#[derive(Debug)]
struct Pragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for Pragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000; PRAGMA foreign_keys = ON;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<ConnectionManager<SqliteConnection>>,
}

impl Database {
    pub fn new(data_dir: &Path, migrations: EmbeddedMigrations, max_size: u32) -> Result<Self> {
        let file_path = data_dir.join("toll_data.sqlite").display().to_string();

        let pool = Pool::builder()
            .max_size(max_size)
            .connection_customizer(Box::new(Pragmas))
            .build(ConnectionManager::<SqliteConnection>::new(&file_path))
            .context("Error creating connection pool")?;

        let mut conn = pool.get().context("Failed to get connection for migrations")?;

        conn.run_pending_migrations(migrations)
            .map_err(|e| anyhow::anyhow!("Database migration failed: {}", e))?;

        Ok(Database { pool })
    }

    pub async fn get_connection(&self) -> PooledConnection<ConnectionManager<SqliteConnection>> {
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || pool.get().expect("Failed to get connection from pool"))
            .await
            .expect("Failed to join task")
    }
}
