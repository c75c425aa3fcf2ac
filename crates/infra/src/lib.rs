//! Infrastructure layer: event store, catalog, configuration, the
//! inventory engine and its background workers.

pub mod catalog;
pub mod config;
pub mod engine;
pub mod event_store;
pub mod workers;

pub use catalog::{Catalog, InMemoryCatalog};
pub use config::EngineConfig;
pub use engine::{
    CountEntry, DirectExit, EngineError, EngineResult, ExitOutcome, InventoryEngine, PickOutcome,
    ReceiptRequest, Reception, ReceptionOutcome, ReservationRequest, StockAlert, SweepReport,
    TransferRequest,
};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore, StoredEvent};
pub use workers::{ReservationSweeper, WorkerHandle};

mod integration_tests;
