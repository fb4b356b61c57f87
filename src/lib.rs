//! LightIPC - low-latency inter-process communication on the same host.
//!
//! This crate bundles the pieces cooperating processes need on a POSIX-class
//! system:
//!
//! - [`ByteBuffer`]: a positional binary codec used as the wire format for
//!   every higher layer. Values append in order and read back in the same
//!   order; variable-length shapes carry a 32-bit count prefix.
//! - [`Semaphore`] and [`SharedMemory`]: kernel-named resources with
//!   owner/non-owner roles. A shared memory region pairs with a semaphore of
//!   the same name, and [`SharedLock`] brackets typed access to the mapping.
//! - [`MessageQueue`]: a bounded named FIFO with blocking and timed
//!   send/receive plus first-arrival notification.
//! - [`SocketServer`] / [`SocketClient`]: a framed request/response and
//!   notification protocol over a crossed pair of unix datagram sockets,
//!   with a background receive loop on each side.
//!
//! # Example
//!
//! ```rust,ignore
//! use lightipc::{ByteBuffer, SocketClient};
//!
//! let client = SocketClient::new("/tmp/app.sock");
//! let mut request = ByteBuffer::new();
//! request.append("hello");
//!
//! let mut response = ByteBuffer::new();
//! client.send_receive(&request, &mut response)?;
//! let echoed: String = response.value()?;
//! ```
//!
//! # Concurrency
//!
//! There is no async runtime. Blocking operations (semaphore wait, queue
//! send/receive, socket receive) run on plain OS threads; background loops
//! are [`worker::Worker`] threads stopped cooperatively.

pub mod buffer;
pub mod config;
pub mod error;
pub mod queue;
pub mod semaphore;
pub mod shm;
pub mod socket;
pub mod worker;

pub use buffer::{ByteBuffer, Decode, Encode};
pub use error::{IpcError, Result};
pub use queue::MessageQueue;
pub use semaphore::Semaphore;
pub use shm::{Plain, SharedLock, SharedMemory, SharedMemoryContext};
pub use socket::{
    MessageKind, NotifyHandler, RequestHandler, SocketClient, SocketEndpoint, SocketServer,
};
pub use worker::{StopToken, Worker};
