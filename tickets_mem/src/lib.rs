//! # Tickets memory store
//!
//! In-memory implementations of the tickets storage and broker backends, primarily for
//! testing.
//!
//! Everything lives behind `Arc<Mutex<..>>`, so clones share state. The broker keeps one
//! log per topic and one position per `(consumer group, topic)`, which is enough to
//! exercise redelivery, ordering and independent consumer groups without a database:
//!
//! ```ignore
//! use tickets_mem::{InMemoryBroker, InMemoryOutbox};
//! use tickets_core::prelude::*;
//!
//! let broker = Arc::new(InMemoryBroker::new());
//! let outbox = Arc::new(InMemoryOutbox::new());
//!
//! let mut tx = outbox.begin().await?;
//! OutboxEventBus::new(&*outbox).publish(&mut tx, &event).await?;
//! tx.commit().await?;
//!
//! Forwarder::new(outbox, broker.clone(), ForwarderConfig::default())
//!     .forward_batch()
//!     .await?;
//! ```

#![deny(missing_docs)]

mod broker;
mod collaborators;
mod data_lake;
mod ledger;
mod ops_booking;
mod outbox;

pub use broker::*;
pub use collaborators::*;
pub use data_lake::*;
pub use ledger::*;
pub use ops_booking::*;
pub use outbox::*;
