//! Conductor Bus
//!
//! A thin publish/subscribe layer and the orchestration operations built on
//! it: starting a run, dispatching a planned task set and applying a patch
//! and retrying.
//!
//! The [`Transport`] trait hides the broker. [`InMemoryTransport`] runs in
//! process; `NatsTransport` (feature `nats`) talks to a NATS server. Subject
//! grammar follows NATS on both.

mod bus;
mod error;
mod memory;
pub mod messages;
#[cfg(feature = "nats")]
mod nats;
pub mod subject;
mod transport;

pub use bus::{
  DispatchOutcome, DispatchedTask, MessageBus, MessageHandler, RetryOutcome, UndeliveredTask,
};
pub use error::BusError;
pub use memory::InMemoryTransport;
#[cfg(feature = "nats")]
pub use nats::NatsTransport;
pub use transport::{Message, MessageStream, Transport};
