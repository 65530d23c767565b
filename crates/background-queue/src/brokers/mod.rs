//! Broker implementations behind [`crate::Queue`].
//!
//! - [`InProcessQueue`] delivers within one process, competing consumers, no redelivery
//! - [`SynchronousQueue`] makes publish wait for every subscriber, for tests
//! - [`DurableQueue`] delivers through managed cloud queues with retries and dead lettering
//! - [`NoopQueue`] discards everything

pub mod durable;
pub mod in_process;
pub mod noop;
pub mod synchronous;

pub use durable::{BroadcastTopic, Broadcaster, DurableConfig, DurableQueue, ProvisionedQueue};
pub use in_process::InProcessQueue;
pub use noop::NoopQueue;
pub use synchronous::SynchronousQueue;
