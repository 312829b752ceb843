//! `robohub-hal` – the hardware side of the hub.
//!
//! # Modules
//!
//! - [`transport`] – [`TransportCodec`][transport::TransportCodec] and
//!   [`FrameBuffer`][transport::FrameBuffer]: newline-delimited framing,
//!   inbound JSON sensor frames, outbound comma-joined actuator frames.
//! - [`link`] – [`SerialLink`][link::SerialLink]: non-blocking byte link to
//!   the board, with a real serial-port driver and an in-memory stand-in.

pub mod link;
pub mod transport;

pub use link::{MemoryLink, SerialLink, SerialPortLink};
pub use transport::{FrameBuffer, LightTransform, TransportCodec};
