//! Bounded named message queues.
//!
//! [`MessageQueue`] wraps a POSIX message queue: a kernel-named, bounded
//! FIFO of byte messages with blocking and timed send/receive. The owner
//! creates the queue (after unlinking any stale one) and unlinks it on
//! drop; non-owners open and close only their descriptor.
//!
//! First-arrival notification uses `mq_notify` with a thread callback. The
//! kernel cancels a registration each time it fires, so the callback
//! re-registers itself before running the user handler; a message must
//! drain the queue for the next notification to fire.
//!
//! On Linux the queues are visible in a virtual filesystem:
//!
//! ```text
//! # mkdir /dev/mqueue          (usually mounted already)
//! # cat /dev/mqueue/<name>
//! ```

use std::collections::HashMap;
use std::ffi::CString;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::buffer::ByteBuffer;
use crate::config::QueueConfig;
use crate::error::{validate_name, IpcError, Result};

const RESOURCE: &str = "message queue";
const INERT: libc::mqd_t = -1;

/// A bounded named FIFO of byte messages.
pub struct MessageQueue {
    name: String,
    is_owner: bool,
    mq: libc::mqd_t,
    max_messages: libc::c_long,
    max_message_size: libc::c_long,
    notify_token: Mutex<Option<usize>>,
}

// mqd_t is a descriptor; the mq_* calls are thread-safe.
unsafe impl Send for MessageQueue {}
unsafe impl Sync for MessageQueue {}

impl MessageQueue {
    /// Probe whether a queue named `name` currently exists.
    pub fn exists(name: &str) -> Result<()> {
        validate_name(RESOURCE, name)?;
        let named = name_cstring(name)?;

        let mq = unsafe { libc::mq_open(named.as_ptr(), libc::O_RDONLY) };
        if mq == INERT {
            return Err(IpcError::last_os("message queue open error"));
        }
        unsafe { libc::mq_close(mq) };
        Ok(())
    }

    /// Open an existing queue as a non-owner.
    pub fn open(name: &str) -> Self {
        Self::init(name, false, 0, 0)
    }

    /// Create the queue as its owner, unlinking any stale one first.
    ///
    /// Zero for either bound selects the default (10 messages of 8192
    /// bytes).
    pub fn create(name: &str, max_messages: i64, max_message_size: i64) -> Self {
        Self::init(name, true, max_messages, max_message_size)
    }

    fn init(name: &str, is_owner: bool, max_messages: i64, max_message_size: i64) -> Self {
        let mut queue = Self {
            name: name.to_string(),
            is_owner,
            mq: INERT,
            max_messages: -1,
            max_message_size: -1,
            notify_token: Mutex::new(None),
        };

        let named = match validate_name(RESOURCE, name).and_then(|_| name_cstring(name)) {
            Ok(named) => named,
            Err(e) => {
                error!("message queue creation error [{}]", e);
                return queue;
            }
        };

        if is_owner {
            unsafe { libc::mq_unlink(named.as_ptr()) };
        }

        let mq = unsafe {
            if is_owner {
                let mut attr: libc::mq_attr = std::mem::zeroed();
                attr.mq_maxmsg = if max_messages > 0 {
                    max_messages as libc::c_long
                } else {
                    QueueConfig::DEFAULT_MAX_MESSAGES
                };
                attr.mq_msgsize = if max_message_size > 0 {
                    max_message_size as libc::c_long
                } else {
                    QueueConfig::DEFAULT_MESSAGE_SIZE
                };
                libc::mq_open(
                    named.as_ptr(),
                    libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                    (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
                    &mut attr as *mut libc::mq_attr,
                )
            } else {
                libc::mq_open(named.as_ptr(), libc::O_RDWR)
            }
        };

        if mq == INERT {
            error!(
                "message queue creation error [{}]",
                std::io::Error::last_os_error()
            );
            return queue;
        }
        queue.mq = mq;

        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        if unsafe { libc::mq_getattr(mq, &mut attr) } == -1 {
            error!(
                "message queue attribute error [{}]",
                std::io::Error::last_os_error()
            );
            return queue;
        }
        queue.max_messages = attr.mq_maxmsg;
        queue.max_message_size = attr.mq_msgsize;
        queue
    }

    /// The queue's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue capacity in messages, -1 when inert.
    pub fn max_message_count(&self) -> i64 {
        self.max_messages as i64
    }

    /// Per-message size cap in bytes, -1 when inert.
    pub fn max_message_size(&self) -> i64 {
        self.max_message_size as i64
    }

    /// Messages currently queued, -1 when inert or on attribute failure.
    pub fn current_message_count(&self) -> i64 {
        if self.mq == INERT {
            return -1;
        }
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        if unsafe { libc::mq_getattr(self.mq, &mut attr) } == -1 {
            return -1;
        }
        attr.mq_curmsgs as i64
    }

    /// Discard every queued message without blocking.
    pub fn clear(&self) {
        if self.current_message_count() <= 0 {
            return;
        }
        let Ok(mut scratch) = self.receive_scratch() else {
            return;
        };
        let immediate = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        loop {
            let received = unsafe {
                libc::mq_timedreceive(
                    self.mq,
                    scratch.as_mut_ptr() as *mut libc::c_char,
                    scratch.len(),
                    ptr::null_mut(),
                    &immediate,
                )
            };
            if received == -1 {
                return;
            }
        }
    }

    /// Send a message, blocking while the queue is full.
    pub fn send(&self, message: &ByteBuffer) -> Result<()> {
        self.timed_send(message, 0)
    }

    /// Send a message, waiting at most `millis` (0 blocks indefinitely).
    pub fn timed_send(&self, message: &ByteBuffer, millis: u64) -> Result<()> {
        if self.mq == INERT {
            return Err(self.not_found());
        }

        let ret = if millis == 0 {
            unsafe {
                libc::mq_send(
                    self.mq,
                    message.data().as_ptr() as *const libc::c_char,
                    message.size(),
                    QueueConfig::SEND_PRIORITY,
                )
            }
        } else {
            let deadline = abs_timeout(millis);
            unsafe {
                libc::mq_timedsend(
                    self.mq,
                    message.data().as_ptr() as *const libc::c_char,
                    message.size(),
                    QueueConfig::SEND_PRIORITY,
                    &deadline,
                )
            }
        };

        if ret == -1 {
            return Err(IpcError::last_os("message queue send error"));
        }
        Ok(())
    }

    /// Receive one message, blocking while the queue is empty.
    pub fn receive(&self) -> Result<ByteBuffer> {
        self.timed_receive(0)
    }

    /// Receive one message, waiting at most `millis` (0 blocks indefinitely).
    pub fn timed_receive(&self, millis: u64) -> Result<ByteBuffer> {
        let mut scratch = self.receive_scratch()?;
        let mut priority: libc::c_uint = 0;

        let received = if millis == 0 {
            unsafe {
                libc::mq_receive(
                    self.mq,
                    scratch.as_mut_ptr() as *mut libc::c_char,
                    scratch.len(),
                    &mut priority,
                )
            }
        } else {
            let deadline = abs_timeout(millis);
            unsafe {
                libc::mq_timedreceive(
                    self.mq,
                    scratch.as_mut_ptr() as *mut libc::c_char,
                    scratch.len(),
                    &mut priority,
                    &deadline,
                )
            }
        };

        if received == -1 {
            return Err(IpcError::last_os("message queue receive error"));
        }
        scratch.truncate(received as usize);
        Ok(ByteBuffer::from(scratch))
    }

    /// Drain every currently queued message without blocking.
    pub fn receive_all(&self) -> Result<Vec<ByteBuffer>> {
        let mut scratch = self.receive_scratch()?;
        let immediate = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        let mut messages = Vec::new();
        loop {
            let received = unsafe {
                libc::mq_timedreceive(
                    self.mq,
                    scratch.as_mut_ptr() as *mut libc::c_char,
                    scratch.len(),
                    ptr::null_mut(),
                    &immediate,
                )
            };
            if received == -1 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ETIMEDOUT) {
                    return Ok(messages);
                }
                return Err(IpcError::Os {
                    context: "message queue receive error",
                    source: err,
                });
            }
            messages.push(ByteBuffer::from_bytes(&scratch[..received as usize]));
        }
    }

    /// Register (or with `None`, cancel) a first-arrival notification.
    ///
    /// The handler runs on a kernel-spawned thread each time a message
    /// lands on a previously empty queue. It must not block for long and
    /// typically drains the queue; the registration is re-armed before the
    /// handler is invoked.
    pub fn set_notify(&self, handler: Option<Box<dyn Fn() + Send + Sync>>) -> Result<()> {
        if self.mq == INERT {
            return Err(self.not_found());
        }

        let mut slot = self.notify_token.lock();
        if let Some(token) = slot.take() {
            notify_registry().lock().remove(&token);
            unsafe { libc::mq_notify(self.mq, ptr::null()) };
        }

        let Some(handler) = handler else {
            return Ok(());
        };

        let token = NEXT_NOTIFY_TOKEN.fetch_add(1, Ordering::Relaxed);
        notify_registry().lock().insert(
            token,
            NotifyEntry {
                mq: self.mq,
                handler: Arc::from(handler),
            },
        );

        if let Err(source) = register_notify(self.mq, token) {
            notify_registry().lock().remove(&token);
            return Err(IpcError::Os {
                context: "message queue notify error",
                source,
            });
        }
        *slot = Some(token);
        Ok(())
    }

    fn receive_scratch(&self) -> Result<Vec<u8>> {
        if self.mq == INERT {
            return Err(self.not_found());
        }
        if self.max_message_size < 0 {
            return Err(IpcError::Os {
                context: "message queue receive error",
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "invalid message size",
                ),
            });
        }
        Ok(vec![0u8; self.max_message_size as usize])
    }

    fn not_found(&self) -> IpcError {
        IpcError::NotFound {
            resource: RESOURCE,
            name: self.name.clone(),
        }
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        if self.mq == INERT {
            return;
        }
        if let Some(token) = self.notify_token.lock().take() {
            notify_registry().lock().remove(&token);
        }
        unsafe { libc::mq_close(self.mq) };
        if self.is_owner {
            if let Ok(named) = name_cstring(&self.name) {
                unsafe { libc::mq_unlink(named.as_ptr()) };
            }
        }
    }
}

fn name_cstring(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| IpcError::InvalidName {
        resource: RESOURCE,
        name: name.to_string(),
        reason: "embedded nul byte",
    })
}

fn abs_timeout(millis: u64) -> libc::timespec {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let deadline = now + Duration::from_millis(millis);
    libc::timespec {
        tv_sec: deadline.as_secs() as libc::time_t,
        tv_nsec: deadline.subsec_nanos() as libc::c_long,
    }
}

// Notification plumbing. The kernel invokes a C callback on its own thread;
// the callback must never touch a freed handler, so registrations live in a
// process-wide registry keyed by token and the sigevent carries the token,
// not a pointer. Dropping the queue (or re-registering) removes the entry
// and an in-flight callback finds nothing.

struct NotifyEntry {
    mq: libc::mqd_t,
    handler: Arc<dyn Fn() + Send + Sync>,
}

static NEXT_NOTIFY_TOKEN: AtomicUsize = AtomicUsize::new(1);

fn notify_registry() -> &'static Mutex<HashMap<usize, NotifyEntry>> {
    static REGISTRY: OnceLock<Mutex<HashMap<usize, NotifyEntry>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// glibc's `struct sigevent` for the SIGEV_THREAD case. `libc`'s portable
/// definition omits the thread-callback member on some targets, so the
/// layout is declared here: sigval (8), signo (4), notify (4), then the
/// thread function and attribute pointers, padded to 64 bytes.
#[repr(C)]
struct SigEventThread {
    sigev_value: *mut libc::c_void,
    sigev_signo: libc::c_int,
    sigev_notify: libc::c_int,
    sigev_notify_function: Option<extern "C" fn(*mut libc::c_void)>,
    sigev_notify_attributes: *mut libc::c_void,
    pad: [libc::c_long; 4],
}

// `union sigval` is pointer-sized and passed in one register, so the
// callback may take it as a raw pointer directly.
extern "C" fn notify_trampoline(value: *mut libc::c_void) {
    let token = value as usize;
    let entry = {
        let registry = notify_registry().lock();
        registry.get(&token).map(|e| (e.mq, e.handler.clone()))
    };
    let Some((mq, handler)) = entry else {
        return;
    };
    // Re-arm first: the kernel dropped the registration when it fired.
    if register_notify(mq, token).is_err() {
        warn!("message queue notification re-registration failed");
    }
    handler();
}

fn register_notify(mq: libc::mqd_t, token: usize) -> std::io::Result<()> {
    let event = SigEventThread {
        sigev_value: token as *mut libc::c_void,
        sigev_signo: 0,
        sigev_notify: libc::SIGEV_THREAD,
        sigev_notify_function: Some(notify_trampoline),
        sigev_notify_attributes: ptr::null_mut(),
        pad: [0; 4],
    };
    let ret = unsafe {
        libc::mq_notify(
            mq,
            &event as *const SigEventThread as *const libc::sigevent,
        )
    };
    if ret == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    fn unique(tag: &str) -> String {
        format!("/lightipc-test-mq-{}-{}", tag, std::process::id())
    }

    #[test]
    fn test_sigevent_layout_matches_glibc() {
        assert_eq!(std::mem::size_of::<SigEventThread>(), 64);
        assert_eq!(
            std::mem::size_of::<SigEventThread>(),
            std::mem::size_of::<libc::sigevent>()
        );
    }

    #[test]
    fn test_exists_tracks_owner_lifetime() {
        let name = unique("exists");
        assert!(MessageQueue::exists(&name).is_err());
        {
            let _owner = MessageQueue::create(&name, 4, 128);
            assert!(MessageQueue::exists(&name).is_ok());
        }
        assert!(MessageQueue::exists(&name).is_err());
    }

    #[test]
    fn test_invalid_name_is_inert() {
        let queue = MessageQueue::create("no-slash", 0, 0);
        assert_eq!(queue.max_message_count(), -1);
        let mut message = ByteBuffer::new();
        message.append(&1u32);
        assert!(matches!(
            queue.send(&message),
            Err(IpcError::NotFound { .. })
        ));
        assert!(matches!(queue.receive(), Err(IpcError::NotFound { .. })));
    }

    #[test]
    fn test_default_attributes() {
        let queue = MessageQueue::create(&unique("defaults"), 0, 0);
        assert_eq!(queue.max_message_count(), 10);
        assert_eq!(queue.max_message_size(), 8192);
        assert_eq!(queue.current_message_count(), 0);
    }

    #[test]
    fn test_send_receive_roundtrip() {
        let queue = MessageQueue::create(&unique("roundtrip"), 4, 256);

        let mut message = ByteBuffer::new();
        message.append(&0xC0FFEEu32).append("beans");
        queue.send(&message).unwrap();
        assert_eq!(queue.current_message_count(), 1);

        let mut received = queue.receive().unwrap();
        assert_eq!(received.value::<u32>().unwrap(), 0xC0FFEE);
        assert_eq!(received.value::<String>().unwrap(), "beans");
        assert_eq!(queue.current_message_count(), 0);
    }

    #[test]
    fn test_owner_and_non_owner_pair() {
        let name = unique("pair");
        let owner = MessageQueue::create(&name, 4, 128);
        let opener = MessageQueue::open(&name);
        assert_eq!(opener.max_message_size(), 128);

        let mut message = ByteBuffer::new();
        message.append(&7i32);
        opener.send(&message).unwrap();

        let mut received = owner.receive().unwrap();
        assert_eq!(received.value::<i32>().unwrap(), 7);
    }

    #[test]
    fn test_timed_receive_times_out() {
        let queue = MessageQueue::create(&unique("timeout"), 4, 128);

        let start = Instant::now();
        let result = queue.timed_receive(50);
        assert!(result.is_err());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_timed_send_times_out_when_full() {
        let queue = MessageQueue::create(&unique("full"), 1, 64);
        let mut message = ByteBuffer::new();
        message.append(&1u8);

        queue.send(&message).unwrap();
        assert!(queue.timed_send(&message, 50).is_err());
    }

    #[test]
    fn test_receive_all_drains_in_order() {
        let queue = MessageQueue::create(&unique("drain"), 8, 64);
        for i in 0..3u32 {
            let mut message = ByteBuffer::new();
            message.append(&i);
            queue.send(&message).unwrap();
        }

        let mut drained = queue.receive_all().unwrap();
        assert_eq!(drained.len(), 3);
        for (i, message) in drained.iter_mut().enumerate() {
            assert_eq!(message.value::<u32>().unwrap(), i as u32);
        }
        assert!(queue.receive_all().unwrap().is_empty());
    }

    #[test]
    fn test_clear_empties_queue() {
        let queue = MessageQueue::create(&unique("clear"), 8, 64);
        let mut message = ByteBuffer::new();
        message.append(&9u8);
        queue.send(&message).unwrap();
        queue.send(&message).unwrap();

        queue.clear();
        assert_eq!(queue.current_message_count(), 0);
    }

    #[test]
    fn test_first_arrival_notification() {
        let queue = MessageQueue::create(&unique("notify"), 4, 64);
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        queue
            .set_notify(Some(Box::new(move || {
                flag.store(true, Ordering::SeqCst);
            })))
            .unwrap();

        let mut message = ByteBuffer::new();
        message.append(&1u8);
        queue.send(&message).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !fired.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "notification never fired");
            std::thread::sleep(Duration::from_millis(10));
        }

        // Re-armed by the trampoline: drain, send again, fires again.
        queue.clear();
        fired.store(false, Ordering::SeqCst);
        queue.send(&message).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !fired.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "re-armed notification never fired");
            std::thread::sleep(Duration::from_millis(10));
        }

        queue.set_notify(None).unwrap();
    }
}
