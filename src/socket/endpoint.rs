//! Datagram endpoint: socket lifecycle and message framing.

use std::fs;
use std::net::Shutdown;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::buffer::ByteBuffer;
use crate::config::ProtocolConfig;
use crate::error::{IpcError, Result};

/// One side of a crossed datagram pair.
///
/// For a base path `P` the owner sends to `P.tx` and binds `P.rx`; the
/// non-owner sends to `P.rx` and binds `P.tx`. The receive-side path is
/// unlinked before bind and again on close, so a crashed predecessor never
/// blocks a restart.
pub struct SocketEndpoint {
    path: PathBuf,
    is_owner: bool,
    limit: AtomicU32,
    state: Mutex<Option<Arc<Sockets>>>,
}

struct Sockets {
    tx: UnixDatagram,
    tx_path: PathBuf,
    rx: UnixDatagram,
    rx_path: PathBuf,
}

impl SocketEndpoint {
    /// Create a closed endpoint for `path`; call [`open_socket`] to bind.
    ///
    /// [`open_socket`]: SocketEndpoint::open_socket
    pub fn new(path: impl Into<PathBuf>, is_owner: bool) -> Self {
        Self {
            path: path.into(),
            is_owner,
            limit: AtomicU32::new(ProtocolConfig::DEFAULT_BODY_LIMIT),
            state: Mutex::new(None),
        }
    }

    /// The endpoint's base path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True for the side that binds `P.rx`.
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// True while both sockets are open.
    pub fn is_open(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Create both sockets and bind the receive side. No-op when open.
    pub fn open_socket(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Ok(());
        }

        let (tx_suffix, rx_suffix) = if self.is_owner {
            (".tx", ".rx")
        } else {
            (".rx", ".tx")
        };
        let tx_path = suffixed(&self.path, tx_suffix);
        let rx_path = suffixed(&self.path, rx_suffix);

        let tx = UnixDatagram::unbound().map_err(|source| IpcError::Os {
            context: "open socket error",
            source,
        })?;

        let _ = fs::remove_file(&rx_path);
        let rx = UnixDatagram::bind(&rx_path).map_err(|source| IpcError::Os {
            context: "open socket error",
            source,
        })?;

        debug!("socket endpoint open [{}]", rx_path.display());
        *state = Some(Arc::new(Sockets {
            tx,
            tx_path,
            rx,
            rx_path,
        }));
        Ok(())
    }

    /// Close both sockets and unlink the receive path.
    ///
    /// A receive blocked on this endpoint wakes with an error. No-op when
    /// already closed; [`open_socket`] works again afterwards.
    ///
    /// [`open_socket`]: SocketEndpoint::open_socket
    pub fn close_socket(&self) {
        let Some(sockets) = self.state.lock().take() else {
            return;
        };
        let _ = sockets.rx.shutdown(Shutdown::Both);
        let _ = fs::remove_file(&sockets.rx_path);
        debug!("socket endpoint closed [{}]", sockets.rx_path.display());
    }

    /// Body size limit in bytes; 0 disables the check.
    pub fn limit_size(&self) -> u32 {
        self.limit.load(Ordering::Relaxed)
    }

    /// Set the body size limit; 0 disables the check.
    pub fn set_limit_size(&self, limit: u32) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    /// Send one framed message: protocol header, application header, body
    /// chunks. No retry; the first failure surfaces the OS error.
    ///
    /// Callers that interleave senders must serialize calls themselves, or
    /// chunks of two messages can interleave on the wire; the server and
    /// client wrap this in their send mutex.
    pub fn send(&self, header: &ByteBuffer, body: &ByteBuffer) -> Result<()> {
        let sockets = self.sockets()?;

        if header.size() > ProtocolConfig::MAX_HEADER_SIZE {
            return Err(IpcError::HeaderTooBig(header.size()));
        }
        let size = body.size();
        let limit = self.limit_size();
        if limit > 0 && (limit as usize) < size {
            return Err(IpcError::BodyTooBig { size, limit });
        }

        let mut protocol = [0u8; ProtocolConfig::PROTOCOL_HEADER_SIZE];
        protocol[..4].copy_from_slice(&ProtocolConfig::MAGIC);
        protocol[4..].copy_from_slice(&(size as u32).to_le_bytes());

        let sent = sockets
            .tx
            .send_to(&protocol, &sockets.tx_path)
            .map_err(|source| IpcError::Os {
                context: "send protocol header error",
                source,
            })?;
        if sent != protocol.len() {
            return Err(IpcError::ShortFrame {
                context: "send protocol header error",
                expected: protocol.len(),
                got: sent,
            });
        }

        let sent = sockets
            .tx
            .send_to(header.data(), &sockets.tx_path)
            .map_err(|source| IpcError::Os {
                context: "send application header error",
                source,
            })?;
        if sent != header.size() {
            return Err(IpcError::ShortFrame {
                context: "send application header error",
                expected: header.size(),
                got: sent,
            });
        }

        let data = body.data();
        let mut offset = 0;
        while offset < size {
            let chunk = (size - offset).min(ProtocolConfig::CHUNK_SIZE);
            let sent = sockets
                .tx
                .send_to(&data[offset..offset + chunk], &sockets.tx_path)
                .map_err(|source| IpcError::Os {
                    context: "send body error",
                    source,
                })?;
            offset += sent;
        }

        Ok(())
    }

    /// Receive one framed message, blocking until the protocol header
    /// arrives.
    ///
    /// Body gathering mirrors the sender's chunk arithmetic, so each `recv`
    /// asks for exactly the datagram size the sender used; the scheme
    /// relies on datagram boundaries being preserved, which AF_UNIX
    /// guarantees on the same host. A zero-length read mid-message means
    /// the socket was shut down and fails the call.
    pub fn receive(&self) -> Result<(ByteBuffer, ByteBuffer)> {
        let sockets = self.sockets()?;

        let mut frame = [0u8; ProtocolConfig::CHUNK_SIZE];
        let len = sockets
            .rx
            .recv(&mut frame)
            .map_err(|source| IpcError::Os {
                context: "receive protocol header error",
                source,
            })?;
        if len != ProtocolConfig::PROTOCOL_HEADER_SIZE {
            return Err(IpcError::ShortFrame {
                context: "receive protocol header error",
                expected: ProtocolConfig::PROTOCOL_HEADER_SIZE,
                got: len,
            });
        }
        if frame[..4] != ProtocolConfig::MAGIC {
            let mut magic = [0u8; 4];
            magic.copy_from_slice(&frame[..4]);
            return Err(IpcError::InvalidMagic {
                found: u32::from_be_bytes(magic),
            });
        }

        let mut declared = [0u8; 4];
        declared.copy_from_slice(&frame[4..8]);
        let size = u32::from_le_bytes(declared) as usize;
        let limit = self.limit_size();
        if limit > 0 && (limit as usize) < size {
            return Err(IpcError::BodyTooBig { size, limit });
        }

        let len = sockets
            .rx
            .recv(&mut frame)
            .map_err(|source| IpcError::Os {
                context: "receive application header error",
                source,
            })?;
        if len > ProtocolConfig::MAX_HEADER_SIZE {
            return Err(IpcError::HeaderTooBig(len));
        }
        let header = ByteBuffer::from_bytes(&frame[..len]);

        let mut heap = Vec::new();
        let body_buf: &mut [u8] = if size <= ProtocolConfig::CHUNK_SIZE {
            &mut frame[..size]
        } else {
            heap.resize(size, 0);
            &mut heap[..]
        };

        let mut gathered = 0;
        while gathered < size {
            let want = (size - gathered).min(ProtocolConfig::CHUNK_SIZE);
            let got = sockets
                .rx
                .recv(&mut body_buf[gathered..gathered + want])
                .map_err(|source| IpcError::Os {
                    context: "receive body error",
                    source,
                })?;
            if got == 0 {
                return Err(IpcError::ShortFrame {
                    context: "receive body error",
                    expected: want,
                    got: 0,
                });
            }
            gathered += got;
        }

        let body = ByteBuffer::from_bytes(&body_buf[..size]);
        Ok((header, body))
    }

    /// Wake a receiver blocked in [`receive`] with a zero-byte datagram.
    ///
    /// The receive fails with a short-frame error and the socket stays
    /// usable, so a stopped loop can be restarted later.
    ///
    /// [`receive`]: SocketEndpoint::receive
    pub fn wake_receiver(&self) {
        let Some(sockets) = self.state.lock().clone() else {
            return;
        };
        if let Ok(probe) = UnixDatagram::unbound() {
            let _ = probe.send_to(&[], &sockets.rx_path);
        }
    }

    fn sockets(&self) -> Result<Arc<Sockets>> {
        self.state.lock().clone().ok_or(IpcError::SocketClosed)
    }
}

impl Drop for SocketEndpoint {
    fn drop(&mut self) {
        self.close_socket();
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut full = path.as_os_str().to_os_string();
    full.push(suffix);
    PathBuf::from(full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn pair(dir: &tempfile::TempDir) -> (SocketEndpoint, SocketEndpoint) {
        let base = dir.path().join("endpoint.sock");
        let owner = SocketEndpoint::new(&base, true);
        let peer = SocketEndpoint::new(&base, false);
        owner.open_socket().unwrap();
        peer.open_socket().unwrap();
        (owner, peer)
    }

    fn roundtrip(size: usize) {
        let dir = tempfile::tempdir().unwrap();
        let (owner, peer) = pair(&dir);

        let mut body = vec![0u8; size];
        rand::thread_rng().fill_bytes(&mut body);

        let mut header = ByteBuffer::new();
        header.append(&0u32).append(&0xABCDu16);
        let body = ByteBuffer::from_bytes(&body);

        owner.send(&header, &body).unwrap();
        let (got_header, got_body) = peer.receive().unwrap();
        assert_eq!(got_header.data(), header.data());
        assert_eq!(got_body.data(), body.data());
    }

    #[test]
    fn test_roundtrip_empty_body() {
        roundtrip(0);
    }

    #[test]
    fn test_roundtrip_single_chunk_boundary() {
        roundtrip(1024);
    }

    #[test]
    fn test_roundtrip_three_chunks() {
        roundtrip(3072);
    }

    #[test]
    fn test_roundtrip_fragmented_random_body() {
        roundtrip(4096);
    }

    #[test]
    fn test_both_directions_cross() {
        let dir = tempfile::tempdir().unwrap();
        let (owner, peer) = pair(&dir);

        let mut header = ByteBuffer::new();
        header.append(&1u32);
        let mut body = ByteBuffer::new();
        body.append("to-peer");
        owner.send(&header, &body).unwrap();
        let (_, got) = peer.receive().unwrap();
        assert_eq!(got.data(), body.data());

        let mut reply = ByteBuffer::new();
        reply.append("to-owner");
        peer.send(&header, &reply).unwrap();
        let (_, got) = owner.receive().unwrap();
        assert_eq!(got.data(), reply.data());
    }

    #[test]
    fn test_send_on_closed_socket_fails() {
        let endpoint = SocketEndpoint::new("/tmp/lightipc-never-opened.sock", true);
        let header = ByteBuffer::new();
        let body = ByteBuffer::new();
        assert!(matches!(
            endpoint.send(&header, &body),
            Err(IpcError::SocketClosed)
        ));
        assert!(matches!(endpoint.receive(), Err(IpcError::SocketClosed)));
    }

    #[test]
    fn test_oversize_header_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (owner, _peer) = pair(&dir);

        let header = ByteBuffer::from_bytes(&vec![0u8; 513]);
        let body = ByteBuffer::new();
        assert!(matches!(
            owner.send(&header, &body),
            Err(IpcError::HeaderTooBig(513))
        ));
    }

    #[test]
    fn test_oversize_body_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (owner, _peer) = pair(&dir);
        owner.set_limit_size(16);

        let header = ByteBuffer::new();
        let body = ByteBuffer::from_bytes(&[0u8; 17]);
        assert!(matches!(
            owner.send(&header, &body),
            Err(IpcError::BodyTooBig { size: 17, limit: 16 })
        ));
    }

    #[test]
    fn test_zero_limit_disables_check() {
        let dir = tempfile::tempdir().unwrap();
        let (owner, peer) = pair(&dir);
        owner.set_limit_size(0);
        peer.set_limit_size(0);

        let header = ByteBuffer::new();
        let body = ByteBuffer::from_bytes(&[7u8; 2048]);
        owner.send(&header, &body).unwrap();
        let (_, got) = peer.receive().unwrap();
        assert_eq!(got.data(), body.data());
    }

    #[test]
    fn test_invalid_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (owner, _peer) = pair(&dir);

        let raw = UnixDatagram::unbound().unwrap();
        let rx_path = suffixed(&dir.path().join("endpoint.sock"), ".rx");
        raw.send_to(&[0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 0], &rx_path)
            .unwrap();

        match owner.receive() {
            Err(IpcError::InvalidMagic { found }) => assert_eq!(found, 0xDEADBEEF),
            other => panic!("expected InvalidMagic, got {other:?}"),
        }
    }

    #[test]
    fn test_short_protocol_header_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (owner, _peer) = pair(&dir);

        let raw = UnixDatagram::unbound().unwrap();
        let rx_path = suffixed(&dir.path().join("endpoint.sock"), ".rx");
        raw.send_to(&[0xDE, 0xAD], &rx_path).unwrap();

        assert!(matches!(
            owner.receive(),
            Err(IpcError::ShortFrame { got: 2, .. })
        ));
    }

    #[test]
    fn test_wake_receiver_unblocks() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("endpoint.sock");
        let owner = Arc::new(SocketEndpoint::new(&base, true));
        owner.open_socket().unwrap();

        let receiver = owner.clone();
        let handle = std::thread::spawn(move || receiver.receive());

        std::thread::sleep(std::time::Duration::from_millis(100));
        owner.wake_receiver();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(IpcError::ShortFrame { got: 0, .. })));
    }

    #[test]
    fn test_reopen_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let (owner, peer) = pair(&dir);

        owner.close_socket();
        assert!(!owner.is_open());
        owner.open_socket().unwrap();

        let mut header = ByteBuffer::new();
        header.append(&2u32);
        let mut body = ByteBuffer::new();
        body.append("again");
        owner.send(&header, &body).unwrap();
        let (_, got) = peer.receive().unwrap();
        assert_eq!(got.data(), body.data());
    }
}
