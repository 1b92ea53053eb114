//! Blocking-to-reactive row streaming
//!
//! One invocation of [`StreamTemplate::stream`] wires three pieces together:
//!
//! - a [`RowProducer`] that runs the blocking scan on a scheduler thread,
//!   mapping rows and pushing them into a bounded queue
//! - a [`Session`] holding that queue and the once-set closed state
//! - a [`RowStream`] that yields the rows to an async consumer
//!
//! Backpressure comes from the queue bound: a producer that cannot enqueue
//! within the buffer timeout gives up and closes the stream with
//! [`ClosureReason::ConsumerTimeout`](crate::error::ClosureReason).

mod generator;
mod item;
mod producer;
mod session;
mod subscriber;
mod template;

pub use generator::{CancelHandle, RowStream};
pub use item::Item;
pub use producer::RowProducer;
pub use session::{SendOutcome, Session, SessionCloser, SessionConsumer, SessionProducer};
pub use subscriber::{Demand, Subscriber};
pub use template::{StreamOptions, StreamTemplate, DEFAULT_BUFFER_TIMEOUT, DEFAULT_QUEUE_SIZE};
