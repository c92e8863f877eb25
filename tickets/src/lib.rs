//! # Tickets
//!
//! Facade over the ticketing pipeline crates, plus the [`Service`](service::Service) that
//! runs a forwarder and a router under one shutdown signal.

#![deny(missing_docs)]

pub mod config;
pub mod service;

#[cfg(feature = "postgres")]
pub mod pg;

#[cfg(feature = "derive")]
/// Proc-macros for the `tickets` crate.
pub mod derive {
    //! Contains proc-macros for the `tickets` crate.
    pub use tickets_derive::*;
}

#[cfg(feature = "in-memory")]
/// In-memory backends.
pub mod mem {
    //! Brokers and stores that live in process memory.
    pub use tickets_mem::*;
}

pub mod prelude {
    //! The prelude module for the `tickets` crate.
    pub use tickets_core::prelude::*;

    pub use super::config::{ConfigError, ServiceConfig};
    pub use super::service::{LogAlerts, Service, ServiceError};

    #[cfg(feature = "in-memory")]
    pub use super::mem::*;
    #[cfg(feature = "postgres")]
    pub use tickets_pg::{
        Migrator, PgBroker, PgBrokerConfig, PgDataLake, PgOpsBookings, PgOutbox,
        PgProcessedMessages, PgTransaction,
    };
}
