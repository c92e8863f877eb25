//! # Tickets postgres backends

#![deny(missing_docs)]

/// The broker, with offsets per consumer group and `LISTEN/NOTIFY` wake-ups
pub mod broker;

/// The data lake archive
pub mod data_lake;

/// The processed-message ledger
pub mod ledger;

/// Database migrations for the tickets schema
pub mod migrations;

/// The operations read model
pub mod ops_booking;

/// The transactional outbox
pub mod outbox;

pub use broker::{PgBroker, PgBrokerConfig};
pub use data_lake::PgDataLake;
pub use ledger::PgProcessedMessages;
pub use migrations::{AppliedMigration, Migration, MigrationError, Migrator};
pub use ops_booking::PgOpsBookings;
pub use outbox::{PgOutbox, PgTransaction};
