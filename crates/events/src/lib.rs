//! Event plumbing for the inventory core: the `Event` contract, stream
//! identities, envelopes and the post-commit publication bus.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod stream;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use stream::StreamId;
