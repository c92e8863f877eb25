//! Forward-only migrations of the tickets schema.
//!
//! Every migration is a list of SQL statements. Applied migrations are tracked in
//! `_tickets_migrations` together with a checksum of their statements, so editing a
//! migration that already ran is reported instead of silently diverging.
//!
//! ```rust,ignore
//! let applied = Migrator::new(pool).run().await?;
//! ```
//!
//! New migrations go in a new `mXXX_description.rs` file and at the end of `MIGRATIONS`.

mod m001_create_outbox_table;
mod m002_create_broker_tables;
mod m003_create_data_lake_table;
mod m004_create_ops_bookings_table;
mod m005_create_processed_messages_table;

use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgExecutor, PgPool};
use std::collections::HashMap;

const MIGRATIONS: &[Migration] = &[
    m001_create_outbox_table::CREATE_OUTBOX_TABLE,
    m002_create_broker_tables::CREATE_BROKER_TABLES,
    m003_create_data_lake_table::CREATE_DATA_LAKE_TABLE,
    m004_create_ops_bookings_table::CREATE_OPS_BOOKINGS_TABLE,
    m005_create_processed_messages_table::CREATE_PROCESSED_MESSAGES_TABLE,
];

/// Serialises migration runs of replicas starting at the same time.
const MIGRATION_LOCK_KEY: i64 = 0x7469_636b_6574_73;

/// Errors raised while migrating.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// The database could not be reached or the tracking table could not be used.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The statements of an applied migration changed since it ran.
    #[error("Migration {version} ({name}) changed after it was applied: expected checksum {expected}, found {found}")]
    ChecksumMismatch {
        /// Version of the migration.
        version: i64,
        /// Its name.
        name: String,
        /// Checksum recorded when it ran.
        expected: String,
        /// Checksum of the statements in this build.
        found: String,
    },

    /// A statement of a migration failed. Nothing of the run was committed.
    #[error("Migration {version} ({name}) failed: {source}")]
    Failed {
        /// Version of the migration.
        version: i64,
        /// Its name.
        name: &'static str,
        /// The failing statement's error.
        #[source]
        source: sqlx::Error,
    },
}

/// One schema change.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Unique, increasing version.
    pub version: i64,
    /// Name recorded in the tracking table.
    pub name: &'static str,
    /// Statements, executed in order.
    pub statements: &'static [&'static str],
}

impl Migration {
    /// Hex SHA-256 of the version, the name and every statement.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_le_bytes());
        hasher.update(self.name.as_bytes());
        for statement in self.statements {
            hasher.update(statement.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// A migration recorded in the tracking table.
#[derive(Debug, Clone, FromRow)]
pub struct AppliedMigration {
    /// Version.
    pub version: i64,
    /// Name.
    pub name: String,
    /// When it ran.
    pub applied_at: chrono::DateTime<chrono::Utc>,
    /// Checksum of its statements when it ran.
    pub checksum: String,
}

/// Applies the tickets schema.
#[derive(Debug, Clone)]
pub struct Migrator {
    pool: PgPool,
}

impl Migrator {
    /// Creates a migrator over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies every pending migration and returns their names, in order.
    ///
    /// The whole run is one transaction holding an advisory lock: concurrent replicas
    /// wait for each other, and a failing migration leaves the schema untouched.
    pub async fn run(&self) -> Result<Vec<&'static str>, MigrationError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        create_tracking_table(&mut *tx).await?;

        let applied = applied_migrations(&mut *tx).await?;
        let pending = pending_migrations(&applied)?;

        let mut names = Vec::with_capacity(pending.len());
        for migration in pending {
            for statement in migration.statements {
                sqlx::query(*statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(|source| MigrationError::Failed {
                        version: migration.version,
                        name: migration.name,
                        source,
                    })?;
            }
            sqlx::query(
                "INSERT INTO _tickets_migrations (version, name, checksum) VALUES ($1, $2, $3)",
            )
            .bind(migration.version)
            .bind(migration.name)
            .bind(migration.checksum())
            .execute(&mut *tx)
            .await?;

            info!("Applied migration {:03} {}", migration.version, migration.name);
            names.push(migration.name);
        }

        tx.commit().await?;
        Ok(names)
    }

    /// Names of the migrations this build would apply.
    pub async fn pending(&self) -> Result<Vec<&'static str>, MigrationError> {
        let applied = self.applied().await?;
        Ok(pending_migrations(&applied)?
            .into_iter()
            .map(|migration| migration.name)
            .collect())
    }

    /// Migrations recorded in the tracking table, oldest first.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        create_tracking_table(&self.pool).await?;
        applied_migrations(&self.pool).await
    }
}

async fn create_tracking_table<'e>(executor: impl PgExecutor<'e>) -> Result<(), MigrationError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _tickets_migrations (
            version BIGINT PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            checksum VARCHAR(64) NOT NULL
        )
        "#,
    )
    .execute(executor)
    .await?;
    Ok(())
}

async fn applied_migrations<'e>(
    executor: impl PgExecutor<'e>,
) -> Result<Vec<AppliedMigration>, MigrationError> {
    Ok(sqlx::query_as(
        "SELECT version, name, applied_at, checksum FROM _tickets_migrations ORDER BY version",
    )
    .fetch_all(executor)
    .await?)
}

/// Checks the applied migrations against this build and returns the ones left to run.
fn pending_migrations(
    applied: &[AppliedMigration],
) -> Result<Vec<&'static Migration>, MigrationError> {
    let recorded: HashMap<i64, &AppliedMigration> =
        applied.iter().map(|row| (row.version, row)).collect();

    let mut pending = Vec::new();
    for migration in MIGRATIONS {
        match recorded.get(&migration.version) {
            Some(row) => {
                let found = migration.checksum();
                if row.checksum != found {
                    return Err(MigrationError::ChecksumMismatch {
                        version: row.version,
                        name: row.name.clone(),
                        expected: row.checksum.clone(),
                        found,
                    });
                }
                debug!("Migration {:03} {} already applied", row.version, row.name);
            }
            None => pending.push(migration),
        }
    }

    for row in applied {
        if !MIGRATIONS.iter().any(|m| m.version == row.version) {
            warn!(
                "Schema has migration {:03} {} unknown to this build",
                row.version, row.name
            );
        }
    }
    Ok(pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn recorded(migration: &Migration, checksum: String) -> AppliedMigration {
        AppliedMigration {
            version: migration.version,
            name: migration.name.to_string(),
            applied_at: Utc::now(),
            checksum,
        }
    }

    #[test]
    fn versions_increase_and_names_are_unique() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
        let mut names: Vec<&str> = MIGRATIONS.iter().map(|m| m.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), MIGRATIONS.len());
    }

    #[test]
    fn checksum_covers_the_statements() {
        let original = MIGRATIONS[0];
        let edited = Migration {
            statements: &["CREATE TABLE tickets_outbox (sequence BIGINT)"],
            ..original
        };
        assert_eq!(original.checksum(), original.checksum());
        assert_ne!(original.checksum(), edited.checksum());
        assert_ne!(MIGRATIONS[0].checksum(), MIGRATIONS[1].checksum());
    }

    #[test]
    fn only_unrecorded_migrations_are_pending() {
        let applied = vec![recorded(&MIGRATIONS[0], MIGRATIONS[0].checksum())];
        let pending = pending_migrations(&applied).unwrap();
        assert_eq!(pending.len(), MIGRATIONS.len() - 1);
        assert_eq!(pending[0].version, MIGRATIONS[1].version);
    }

    #[test]
    fn edited_migration_is_reported() {
        let applied = vec![recorded(&MIGRATIONS[0], "stale".to_string())];
        let err = pending_migrations(&applied).unwrap_err();
        assert!(matches!(
            err,
            MigrationError::ChecksumMismatch { version: 1, ref expected, .. } if expected == "stale"
        ));
    }
}
