//! Framed messaging over crossed unix datagram sockets.
//!
//! Two endpoints share a base path `P`. The owner sends on `P.tx` and
//! receives on `P.rx`; the non-owner does the reverse, so every datagram
//! flows owner to non-owner or back. One logical message is an 8-byte
//! protocol header (magic + body size), one application header datagram
//! (at most 512 bytes, opening with a 32-bit message type tag), and the
//! body in 1024-byte chunks.
//!
//! [`SocketServer`] runs a receive loop that dispatches requests to a
//! [`RequestHandler`] and can push [`MessageKind::Notify`] updates;
//! [`SocketClient`] pairs a synchronous [`SocketClient::send_receive`] with
//! a background receive loop that hands responses over through a condition
//! variable and delivers notifications to a [`NotifyHandler`].

mod client;
mod endpoint;
mod server;

pub use client::SocketClient;
pub use endpoint::SocketEndpoint;
pub use server::SocketServer;

use crate::buffer::ByteBuffer;
use crate::error::IpcError;

/// Role of a framed message, carried as the first `u32` of the application
/// header. Unknown tags are discarded on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageKind {
    /// Request from client, or its response from the server.
    Request = 0,
    /// Asynchronous server-to-client notification.
    Notify = 1,
    /// Ping initiated by the client; answered with `"OK"`.
    ClientPing = 2,
    /// Ping initiated by the server; no response expected.
    ServerPing = 3,
}

impl MessageKind {
    /// The wire tag for this kind.
    pub fn tag(self) -> u32 {
        self as u32
    }

    /// Decode a wire tag; unknown values yield `None`.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(MessageKind::Request),
            1 => Some(MessageKind::Notify),
            2 => Some(MessageKind::ClientPing),
            3 => Some(MessageKind::ServerPing),
            _ => None,
        }
    }
}

/// Server-side request dispatch.
///
/// `received` runs on the server's receive thread; whatever it writes into
/// `response` is sent back under the original request's header.
pub trait RequestHandler: Send + Sync {
    /// Handle one request, filling in the response body.
    fn received(&self, request: &mut ByteBuffer, response: &mut ByteBuffer);

    /// A message failed to decode; the loop continues after this.
    fn receive_error(&self, _error: &IpcError) {}

    /// A response failed to send.
    fn response_error(&self, _error: &IpcError) {}
}

/// Client-side sink for server notifications.
///
/// Runs on the client's receive thread. Calling
/// [`SocketClient::send_receive`] from inside `notify` would deadlock on
/// the client's send mutex; hand the update off to another thread instead.
pub trait NotifyHandler: Send + Sync {
    fn notify(&self, update: ByteBuffer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind_tags_roundtrip() {
        for kind in [
            MessageKind::Request,
            MessageKind::Notify,
            MessageKind::ClientPing,
            MessageKind::ServerPing,
        ] {
            assert_eq!(MessageKind::from_tag(kind.tag()), Some(kind));
        }
    }

    #[test]
    fn test_unknown_tags_rejected() {
        assert_eq!(MessageKind::from_tag(4), None);
        assert_eq!(MessageKind::from_tag(u32::MAX), None);
    }
}
