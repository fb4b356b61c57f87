//! Socket server: background receive loop and request dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use super::endpoint::SocketEndpoint;
use super::{MessageKind, RequestHandler};
use crate::buffer::ByteBuffer;
use crate::error::{IpcError, Result};
use crate::worker::{StopToken, Worker};

/// Owner-side endpoint with a request/response loop.
///
/// The server binds the owner side of the crossed pair at construction.
/// [`start`] spawns the receive loop; each request is dispatched to the
/// registered [`RequestHandler`] and its response sent back under the
/// request's own header, so the message type tag round-trips. Outbound
/// sends (responses, [`notify`], [`ping`]) share one mutex, keeping the
/// datagrams of one framed message contiguous on the wire.
///
/// [`start`]: SocketServer::start
/// [`notify`]: SocketServer::notify
/// [`ping`]: SocketServer::ping
pub struct SocketServer {
    shared: Arc<ServerShared>,
    worker: Mutex<Option<Worker>>,
}

struct ServerShared {
    endpoint: SocketEndpoint,
    send_lock: Mutex<()>,
    receiver: RwLock<Option<Arc<dyn RequestHandler>>>,
    active: AtomicBool,
}

impl SocketServer {
    /// Create the server and open its socket.
    ///
    /// An open failure is logged and leaves the endpoint closed; `send`
    /// paths then report the socket as closed.
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        let shared = Arc::new(ServerShared {
            endpoint: SocketEndpoint::new(path, true),
            send_lock: Mutex::new(()),
            receiver: RwLock::new(None),
            active: AtomicBool::new(false),
        });
        if let Err(e) = shared.endpoint.open_socket() {
            error!("server socket open error [{}]", e);
        }
        Self {
            shared,
            worker: Mutex::new(None),
        }
    }

    /// The underlying endpoint, e.g. for adjusting the body size limit.
    pub fn endpoint(&self) -> &SocketEndpoint {
        &self.shared.endpoint
    }

    /// Register the request handler. Requests arriving with no handler
    /// registered are answered with an empty response body.
    pub fn set_receiver(&self, receiver: Arc<dyn RequestHandler>) {
        *self.shared.receiver.write() = Some(receiver);
    }

    /// True while the receive loop is running.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Spawn the receive loop. No-op when already active.
    ///
    /// With `block` set the call parks until [`stop`] ends the loop.
    ///
    /// [`stop`]: SocketServer::stop
    pub fn start(&self, block: bool) {
        if self.shared.active.swap(true, Ordering::SeqCst) {
            return;
        }

        let shared = self.shared.clone();
        match Worker::spawn("receiveThread", move |token| Self::run(shared, token)) {
            Ok(worker) => *self.worker.lock() = Some(worker),
            Err(e) => {
                self.shared.active.store(false, Ordering::SeqCst);
                error!("server worker spawn error [{}]", e);
                return;
            }
        }

        if block {
            while self
                .worker
                .lock()
                .as_ref()
                .map_or(false, |worker| worker.is_active())
            {
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }

    /// Stop the receive loop and wait for it to exit. No-op when idle.
    pub fn stop(&self) {
        self.shared.active.store(false, Ordering::SeqCst);
        let mut slot = self.worker.lock();
        if let Some(worker) = slot.as_mut() {
            worker.stop();
            self.shared.endpoint.wake_receiver();
            worker.join();
        }
        *slot = None;
    }

    /// Push an asynchronous update to the client.
    pub fn notify(&self, update: &ByteBuffer) -> Result<()> {
        let _send = self.shared.send_lock.lock();
        let mut header = ByteBuffer::new();
        header.append(&MessageKind::Notify.tag());
        self.shared.endpoint.send(&header, update)
    }

    /// Send a server-initiated ping; the client discards it silently.
    pub fn ping(&self) -> Result<()> {
        let _send = self.shared.send_lock.lock();
        let mut header = ByteBuffer::new();
        header.append(&MessageKind::ServerPing.tag());
        let mut body = ByteBuffer::new();
        body.append("PING");
        self.shared.endpoint.send(&header, &body)
    }

    fn run(shared: Arc<ServerShared>, token: StopToken) {
        debug!("server receive loop running");
        while shared.active.load(Ordering::SeqCst) && !token.is_stopped() {
            let (mut header, mut request) = match shared.endpoint.receive() {
                Ok(message) => message,
                Err(e) => {
                    if !shared.active.load(Ordering::SeqCst) || token.is_stopped() {
                        break;
                    }
                    if matches!(e, IpcError::SocketClosed) {
                        // Nothing to wait on anymore.
                        break;
                    }
                    if let Some(receiver) = shared.receiver.read().clone() {
                        receiver.receive_error(&e);
                    }
                    continue;
                }
            };
            if !shared.active.load(Ordering::SeqCst) {
                break;
            }

            let tag = match header.value::<u32>() {
                Ok(tag) => tag,
                Err(e) => {
                    if let Some(receiver) = shared.receiver.read().clone() {
                        receiver.receive_error(&e);
                    }
                    continue;
                }
            };

            let mut response = ByteBuffer::new();
            if tag == MessageKind::ClientPing.tag() {
                header.set_position(0);
                response.append("OK");
            } else if let Some(receiver) = shared.receiver.read().clone() {
                receiver.received(&mut request, &mut response);
            }

            {
                let _send = shared.send_lock.lock();
                if let Err(e) = shared.endpoint.send(&header, &response) {
                    if tag != MessageKind::ClientPing.tag() {
                        if let Some(receiver) = shared.receiver.read().clone() {
                            receiver.response_error(&e);
                        }
                    }
                }
            }
        }
        shared.active.store(false, Ordering::SeqCst);
        debug!("server receive loop ended");
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.stop();
        self.shared.endpoint.close_socket();
    }
}
