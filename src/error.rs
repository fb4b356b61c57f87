//! Error types for LightIPC.
//!
//! Every fallible operation returns [`Result`]. Constructors of kernel-named
//! resources are the one exception: they log the failure and leave the handle
//! inert, so later operations report [`IpcError::NotFound`] instead.

use thiserror::Error;

/// Main error type for LightIPC operations.
#[derive(Debug, Error)]
pub enum IpcError {
    /// A kernel resource name was empty or missing its `/` prefix.
    #[error("{resource} invalid name [{reason}: {name:?}]")]
    InvalidName {
        resource: &'static str,
        name: String,
        reason: &'static str,
    },

    /// An OS call failed; carries the underlying system error text.
    #[error("{context} [{source}]")]
    Os {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Operation on a socket that is not open.
    #[error("socket error [socket closed]")]
    SocketClosed,

    /// Application header over the 512 byte cap.
    #[error("application header too big [{0} bytes, limit 512]")]
    HeaderTooBig(usize),

    /// Body over the configured size limit.
    #[error("body too big [{size} bytes, limit {limit}]")]
    BodyTooBig { size: usize, limit: u32 },

    /// Protocol header magic did not match `DE AD C0 DE`.
    #[error("receive protocol header error [invalid hexspeak:0x{found:08X}]")]
    InvalidMagic { found: u32 },

    /// A datagram had the wrong length where an exact frame was required.
    #[error("{context} [short datagram: expected {expected} bytes, got {got}]")]
    ShortFrame {
        context: &'static str,
        expected: usize,
        got: usize,
    },

    /// A response was awaited while the client worker was stopped.
    #[error("currently inactive")]
    Inactive,

    /// Operation on an inert handle whose kernel resource was never opened.
    #[error("{resource} not found [{name}]")]
    NotFound {
        resource: &'static str,
        name: String,
    },

    /// A buffer read would pass the end of the data.
    #[error("byte buffer exhausted [requested {requested} bytes, {remaining} remaining]")]
    BufferExhausted { requested: usize, remaining: usize },

    /// A decoded count prefix was negative.
    #[error("byte buffer value error [negative count: {0}]")]
    NegativeCount(i32),

    /// Decoded string bytes were not valid UTF-8.
    #[error("byte buffer value error [invalid utf-8]")]
    InvalidUtf8,

    /// A typed view was requested on a region smaller than the type.
    #[error("shared memory region too small [need {need} bytes, have {have}]")]
    RegionTooSmall { need: usize, have: usize },
}

/// Result type alias for LightIPC operations.
pub type Result<T> = std::result::Result<T, IpcError>;

/// Check a kernel resource name: non-empty, leading `/`.
pub(crate) fn validate_name(resource: &'static str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(IpcError::InvalidName {
            resource,
            name: name.to_string(),
            reason: "empty name",
        });
    }
    if !name.starts_with('/') {
        return Err(IpcError::InvalidName {
            resource,
            name: name.to_string(),
            reason: "it does not begin with '/'",
        });
    }
    Ok(())
}

impl IpcError {
    /// Wrap the current OS error with a call-site context.
    pub(crate) fn last_os(context: &'static str) -> Self {
        IpcError::Os {
            context,
            source: std::io::Error::last_os_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IpcError::InvalidMagic { found: 0xDEADBEEF };
        assert_eq!(
            err.to_string(),
            "receive protocol header error [invalid hexspeak:0xDEADBEEF]"
        );

        let err = IpcError::HeaderTooBig(513);
        assert!(err.to_string().contains("too big"));

        let err = IpcError::Inactive;
        assert_eq!(err.to_string(), "currently inactive");
    }

    #[test]
    fn test_validate_name_accepts_slash_prefixed() {
        assert!(validate_name("semaphore", "/ok").is_ok());
    }

    #[test]
    fn test_validate_name_rejects_empty() {
        let err = validate_name("semaphore", "").unwrap_err();
        assert!(err.to_string().contains("empty name"));
    }

    #[test]
    fn test_validate_name_rejects_missing_slash() {
        let err = validate_name("shared memory", "no-slash").unwrap_err();
        assert!(err.to_string().contains("does not begin with '/'"));
    }

    #[test]
    fn test_os_error_carries_system_text() {
        let err = IpcError::Os {
            context: "open socket error",
            source: std::io::Error::from_raw_os_error(libc::ENOENT),
        };
        let text = err.to_string();
        assert!(text.starts_with("open socket error ["));
        assert!(text.len() > "open socket error []".len());
    }
}
