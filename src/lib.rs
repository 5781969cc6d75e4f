//! # Conduit
//!
//! A modular communication substrate for embedded and multi-process
//! applications: variable-length messages between addressable endpoints
//! over heterogeneous transports, with optional framing, CRC integrity,
//! ordered reliable delivery and shared-memory broadcast.
//!
//! ## Layers
//!
//! - **Binary primitives**: [`frame`] (32-byte wire header + CRC),
//!   [`tlv`], [`crc`], [`ringbuf`] (SPSC byte FIFO)
//! - **Reliable delivery**: [`reliable`] — sliding-window ARQ with
//!   cumulative ACKs, timeout retransmission and in-order delivery
//! - **Shared memory**: [`shm`] — single-writer / multi-reader broadcast
//!   rings with per-reader cursors in a named region
//! - **Pipeline**: [`pipeline`] — the four-stage composition of
//!   [`link::Link`], [`transport::Transport`], [`message::Message`] and
//!   [`service::Service`]
//!
//! ## Quick start
//!
//! ```rust
//! use conduit::prelude::*;
//!
//! let (a, b) = LoopbackLink::pair(16);
//! let mut tx = conduit::pipeline::builder(a)
//!     .transport(CrcLengthPrefixed::default())
//!     .message(RawBytes::new())
//!     .service(Direct);
//! let mut rx = conduit::pipeline::builder(b)
//!     .transport(CrcLengthPrefixed::default())
//!     .message(RawBytes::new())
//!     .service(Direct);
//!
//! tx.send(EndpointId::new(0, 0, 1), &b"hello".to_vec());
//! rx.process_one(&mut |msg| assert_eq!(msg, b"hello"));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod crc;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod link;
pub mod message;
pub mod pipeline;
pub mod pool;
pub mod reliable;
pub mod ringbuf;
pub mod service;
pub mod shm;
pub mod tlv;
pub mod transport;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::endpoint::EndpointId;
    pub use crate::error::{Error, Result};
    pub use crate::frame::{FrameFlags, FrameHeader};
    pub use crate::link::{Link, LinkStats, LoopbackLink, SharedMemoryLink};
    pub use crate::message::{Message, RawBytes, Typed, TypedPayload};
    pub use crate::pipeline::{builder, Pipeline, StopHandle};
    pub use crate::reliable::ReliableContext;
    pub use crate::service::{Async, Direct, Router, Service};
    pub use crate::shm::{BroadcastRing, RegionConfig};
    pub use crate::transport::{Chain, CrcLengthPrefixed, LengthPrefixed, PassThrough, Transport};
}

pub use error::{Error, Result};
