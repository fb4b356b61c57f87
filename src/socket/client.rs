//! Socket client: synchronous request/response over a background receiver.
//!
//! # Thread Safety
//!
//! One send mutex serializes [`SocketClient::send_receive`] callers, so a
//! single request is in flight at a time. The background worker deposits
//! each reply into a single response slot guarded by a mutex and condition
//! variable; the waiting caller holds that mutex from before the send until
//! the reply lands, which is what keeps a fast reply from racing the slot
//! reset.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error};

use super::endpoint::SocketEndpoint;
use super::{MessageKind, NotifyHandler};
use crate::buffer::ByteBuffer;
use crate::error::{IpcError, Result};
use crate::worker::{StopToken, Worker};

/// Non-owner endpoint pairing synchronous requests with a receive loop.
///
/// Construction opens the socket and starts the worker; drop stops the
/// worker and closes the socket. Server notifications are delivered to the
/// registered [`NotifyHandler`] on the worker thread.
pub struct SocketClient {
    shared: Arc<ClientShared>,
    worker: Mutex<Option<Worker>>,
}

struct ClientShared {
    endpoint: SocketEndpoint,
    send_lock: Mutex<()>,
    active: AtomicBool,
    slot: Mutex<ResponseSlot>,
    arrived: Condvar,
    notify: RwLock<Option<Arc<dyn NotifyHandler>>>,
}

#[derive(Default)]
struct ResponseSlot {
    arrived: bool,
    error: Option<IpcError>,
    header: ByteBuffer,
    body: ByteBuffer,
}

impl ResponseSlot {
    fn clear(&mut self) {
        self.arrived = false;
        self.error = None;
        self.header.clear();
        self.body.clear();
    }
}

impl SocketClient {
    /// Create the client, open its socket, and start the receive loop.
    ///
    /// Failures are logged; a client without an open socket reports
    /// `SocketClosed` from [`send_receive`].
    ///
    /// [`send_receive`]: SocketClient::send_receive
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        let shared = Arc::new(ClientShared {
            endpoint: SocketEndpoint::new(path, false),
            send_lock: Mutex::new(()),
            active: AtomicBool::new(true),
            slot: Mutex::new(ResponseSlot::default()),
            arrived: Condvar::new(),
            notify: RwLock::new(None),
        });
        if let Err(e) = shared.endpoint.open_socket() {
            error!("client socket open error [{}]", e);
        }

        let worker_shared = shared.clone();
        let worker = match Worker::spawn("responseThread", move |token| {
            Self::run(worker_shared, token)
        }) {
            Ok(worker) => Some(worker),
            Err(e) => {
                shared.active.store(false, Ordering::SeqCst);
                error!("client worker spawn error [{}]", e);
                None
            }
        };

        Self {
            shared,
            worker: Mutex::new(worker),
        }
    }

    /// The underlying endpoint, e.g. for adjusting the body size limit.
    pub fn endpoint(&self) -> &SocketEndpoint {
        &self.shared.endpoint
    }

    /// Register the receiver for server notifications.
    ///
    /// The callback runs on the client's worker thread and must not call
    /// [`send_receive`] on this client; that would deadlock on the send
    /// mutex. Hand the update off to another thread when a follow-up
    /// request is needed.
    ///
    /// [`send_receive`]: SocketClient::send_receive
    pub fn set_notify_receiver(&self, receiver: Arc<dyn NotifyHandler>) {
        *self.shared.notify.write() = Some(receiver);
    }

    /// Send `request` and block until the matching response lands in
    /// `response`.
    ///
    /// Returns `Inactive` when the worker stops while waiting, or the
    /// receive error the worker captured for this exchange.
    pub fn send_receive(&self, request: &ByteBuffer, response: &mut ByteBuffer) -> Result<()> {
        self.exchange(request, response, MessageKind::Request)
    }

    /// Round-trip a ping; the server answers without involving its handler.
    pub fn ping(&self) -> Result<()> {
        let mut request = ByteBuffer::new();
        request.append("PING");
        let mut response = ByteBuffer::new();
        self.exchange(&request, &mut response, MessageKind::ClientPing)
    }

    fn exchange(
        &self,
        request: &ByteBuffer,
        response: &mut ByteBuffer,
        kind: MessageKind,
    ) -> Result<()> {
        if !self.shared.endpoint.is_open() {
            return Err(IpcError::SocketClosed);
        }

        let _send = self.shared.send_lock.lock();
        // Taken before the send and held across the wait, so the worker
        // cannot deposit a reply between the slot reset and the wait.
        let mut slot = self.shared.slot.lock();
        slot.clear();

        let mut header = ByteBuffer::new();
        header.append(&kind.tag());
        self.shared.endpoint.send(&header, request)?;

        while !slot.arrived && self.shared.active.load(Ordering::SeqCst) {
            self.shared.arrived.wait(&mut slot);
        }

        if !self.shared.active.load(Ordering::SeqCst) {
            return Err(IpcError::Inactive);
        }
        if let Some(error) = slot.error.take() {
            slot.clear();
            return Err(error);
        }

        let tag = match slot.header.value::<u32>() {
            Ok(tag) => tag,
            Err(e) => {
                slot.clear();
                return Err(e);
            }
        };
        if matches!(
            MessageKind::from_tag(tag),
            Some(MessageKind::Request | MessageKind::ClientPing)
        ) {
            *response = std::mem::take(&mut slot.body);
        }

        slot.clear();
        Ok(())
    }

    fn run(shared: Arc<ClientShared>, token: StopToken) {
        debug!("client receive loop running");
        while shared.active.load(Ordering::SeqCst) && !token.is_stopped() {
            let (mut header, body) = match shared.endpoint.receive() {
                Ok(message) => message,
                Err(e) => {
                    if !shared.active.load(Ordering::SeqCst) || token.is_stopped() {
                        break;
                    }
                    if matches!(e, IpcError::SocketClosed) {
                        break;
                    }
                    Self::deposit_error(&shared, e);
                    continue;
                }
            };
            if !shared.active.load(Ordering::SeqCst) {
                break;
            }

            let tag = match header.value::<u32>() {
                Ok(tag) => tag,
                Err(e) => {
                    Self::deposit_error(&shared, e);
                    continue;
                }
            };
            header.set_position(0);

            match MessageKind::from_tag(tag) {
                Some(MessageKind::Request | MessageKind::ClientPing) => {
                    let mut slot = shared.slot.lock();
                    slot.arrived = true;
                    slot.header = header;
                    slot.body = body;
                    shared.arrived.notify_one();
                }
                Some(MessageKind::Notify) => {
                    // Delivered outside the response lock; the handler may
                    // take its time without stalling a waiting caller.
                    if let Some(receiver) = shared.notify.read().clone() {
                        receiver.notify(body);
                    }
                }
                Some(MessageKind::ServerPing) | None => {}
            }
        }
        shared.active.store(false, Ordering::SeqCst);
        // Taking the slot lock orders the store against a caller that is
        // between its predicate check and the wait.
        drop(shared.slot.lock());
        shared.arrived.notify_all();
        debug!("client receive loop ended");
    }

    fn deposit_error(shared: &ClientShared, error: IpcError) {
        let mut slot = shared.slot.lock();
        slot.error = Some(error);
        slot.arrived = true;
        shared.arrived.notify_one();
    }

    fn shutdown(&self) {
        self.shared.active.store(false, Ordering::SeqCst);
        drop(self.shared.slot.lock());
        self.shared.arrived.notify_all();
        let mut slot = self.worker.lock();
        if let Some(worker) = slot.as_mut() {
            worker.stop();
            self.shared.endpoint.wake_receiver();
            worker.join();
        }
        *slot = None;
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.shutdown();
        self.shared.endpoint.close_socket();
    }
}
