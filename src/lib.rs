//! A streaming library over RDMA: a connection-oriented, reliable,
//! one-directional byte-region stream on top of verbs-level primitives
//! (queue pairs, completion queues, memory regions, connection manager),
//! built atop the [`rdma-sys`] crate.
//!
//! Applications pair a connector with a listener, establish a session with a
//! declared direction ([`Direction::Send`] or [`Direction::Receive`]),
//! register or lease buffer regions, and exchange variable-sized messages.
//! An application-level credit protocol announces the receiver's posted
//! buffer capacities to the sender, so an oversize send fails locally and
//! deterministically at queue time instead of tearing down the connection.
//!
//! # Example
//!
//! The sending half of a stream (the receiving peer mirrors this with
//! [`create_listener`], [`accept`], and [`acquire_received_region`] /
//! [`release_received_buffer_region`]):
//!
//! ```no_run
//! fn sender() -> rrstream::Result<()> {
//!     let session = rrstream::create_connector("", 0)?;
//!     rrstream::connect(session, rrstream::Direction::Send, "192.168.1.10", 50001, 5000)?;
//!     rrstream::configure_buffers(session, 4096, 4)?;
//!
//!     let mut region = rrstream::acquire_send_region(session, 1000)?;
//!     let payload = b"hello";
//!     // SAFETY: the region window is ours until the buffer is queued.
//!     unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), region.buffer, payload.len()) };
//!     region.used_size = payload.len();
//!     rrstream::queue_buffer_region(session, &region, None)?;
//!
//!     rrstream::close_session(session, 0)
//! }
//! ```
//!
//! [`rdma-sys`]: https://docs.rs/rdma-sys/latest/rdma_sys/

#[cfg(not(target_os = "linux"))]
compile_error!("`rrstream` currently only supports Linux");

mod access;
mod addr;
mod api;
mod buffer;
mod cm;
mod enumerate;
mod error;
mod fifo;
mod mem;
mod queue;
mod registry;
mod session;
mod wire;

pub use api::*;
pub use buffer::{CallbackData, CompletionFn};
pub use error::{
    clear_last_error, get_last_error, get_last_error_string, last_error_string, Error, ErrorKind,
    Result,
};
pub use registry::{SessionHandle, CLOSE_FLAG_DEFER_WHILE_USER_BUFFERS_OUTSTANDING};
pub use session::{
    Direction, PropertyValue, PROP_CONNECTED, PROP_CONNECTION_DATA, PROP_NUM_OPENED_SESSIONS,
    PROP_NUM_PENDING_DESTRUCTION_SESSIONS, PROP_QUEUED_BUFFERS, PROP_USER_BUFFERS,
    PROP_USE_RX_POLLING,
};

/// Address-family filters for [`enumerate`].
pub use addr::{AF_INET6_FILTER, AF_INET_FILTER, AF_UNSPEC_FILTER};
