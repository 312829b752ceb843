//! `robohub-middleware` – shared state between the hub and its workers.
//!
//! # Modules
//!
//! - [`value_store`] – [`ValueStore`]: latest reading per sensor label,
//!   written by the serial ingester or an injected feed and read by plugin
//!   capability calls.
//! - [`bus`] – [`CommandBus`]: multi-producer, single-consumer FIFO that
//!   carries plugin commands to the event dispatcher.

pub mod bus;
pub mod value_store;

pub use bus::{CommandBus, CommandReceiver, CommandSender, Envelope};
pub use value_store::ValueStore;
