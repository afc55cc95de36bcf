//! dmacap error types.

use thiserror::Error;

/// Result alias used across every dmacap crate.
pub type Result<T> = std::result::Result<T, DmacapError>;

#[derive(Debug, Error)]
pub enum DmacapError {
    /// A session is already active on the device.
    #[error("device busy: a session is already active")]
    Busy,

    /// A DMA channel (or other bounded resource) could not be acquired.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(&'static str),

    /// Buffer allocation failed.
    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),

    /// Copy to or from caller memory failed.
    #[error("bad address copying to or from caller memory")]
    Fault,

    /// Hardware or OS reported a transfer error (negative errno).
    #[error("device error: errno {0}")]
    Device(i32),

    /// A completion moved fewer bytes than requested.
    #[error("short completion: asked for {requested}, got {transferred}")]
    ShortCompletion { requested: usize, transferred: usize },

    /// The producer lapped the consumer; at least `lost` bytes are gone.
    #[error("ring overrun: at least {lost} bytes lost")]
    Overrun { lost: u64 },

    /// Operation on a session that has been closed.
    #[error("session closed")]
    SessionClosed,

    /// A bounded wait expired.
    #[error("timed out")]
    TimedOut,

    /// Configuration rejected by validation.
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),

    /// Completion queue cannot take another submission.
    #[error("completion queue full")]
    QueueFull,

    /// I/O on files, pipes or the device node.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The external filter process failed.
    #[error("filter process failed: {0}")]
    Filter(String),
}

impl DmacapError {
    /// Build an error from a negative errno completion result.
    ///
    /// `EOVERFLOW` is how a session read reports an overrun through
    /// `read(2)`; the byte count does not survive the errno, so `lost` is 0
    /// here and the driver's own log carries the figure.
    pub fn from_errno(res: i64) -> Self {
        let errno = res.unsigned_abs().min(i32::MAX as u64) as i32;
        match errno {
            libc::EOVERFLOW => Self::Overrun { lost: 0 },
            _ => Self::Device(errno),
        }
    }

    /// Transfer failures: explicit errno or short completion.
    pub fn is_device_error(&self) -> bool {
        matches!(self, Self::Device(_) | Self::ShortCompletion { .. })
    }

    /// Open-time contention: busy session or exhausted channel.
    pub fn is_resource_unavailable(&self) -> bool {
        matches!(self, Self::Busy | Self::ResourceUnavailable(_))
    }

    /// Closest errno for callers speaking the read(2)/write(2) dialect.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Busy => libc::EBUSY,
            Self::ResourceUnavailable(_) => libc::EAGAIN,
            Self::OutOfMemory(_) => libc::ENOMEM,
            Self::Fault => libc::EFAULT,
            Self::Device(e) => *e,
            Self::ShortCompletion { .. } => libc::EIO,
            Self::Overrun { .. } => libc::EOVERFLOW,
            Self::SessionClosed => libc::EBADF,
            Self::TimedOut => libc::ETIMEDOUT,
            Self::InvalidConfig(_) => libc::EINVAL,
            Self::QueueFull => libc::EBUSY,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::Filter(_) => libc::EPIPE,
        }
    }
}

impl From<DmacapError> for std::io::Error {
    fn from(e: DmacapError) -> Self {
        match e {
            DmacapError::Io(inner) => inner,
            DmacapError::TimedOut => std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"),
            other => std::io::Error::from_raw_os_error(other.errno()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = DmacapError::ShortCompletion { requested: 4096, transferred: 100 };
        assert_eq!(format!("{}", e), "short completion: asked for 4096, got 100");

        let e = DmacapError::Overrun { lost: 8 };
        assert_eq!(format!("{}", e), "ring overrun: at least 8 bytes lost");
    }

    #[test]
    fn test_classification() {
        assert!(DmacapError::Device(5).is_device_error());
        assert!(DmacapError::ShortCompletion { requested: 2, transferred: 1 }.is_device_error());
        assert!(!DmacapError::Busy.is_device_error());

        assert!(DmacapError::Busy.is_resource_unavailable());
        assert!(DmacapError::ResourceUnavailable("rx channel").is_resource_unavailable());
        assert!(!DmacapError::Fault.is_resource_unavailable());
    }

    #[test]
    fn test_from_errno() {
        let e = DmacapError::from_errno(-(libc::EIO as i64));
        assert!(matches!(e, DmacapError::Device(code) if code == libc::EIO));

        // an overrun survives the trip through errno, minus its count
        let errno = DmacapError::Overrun { lost: 24 }.errno();
        let e = DmacapError::from_errno(-(errno as i64));
        assert!(matches!(e, DmacapError::Overrun { lost: 0 }));
    }

    #[test]
    fn test_io_conversion_keeps_errno() {
        let io: std::io::Error = DmacapError::Busy.into();
        assert_eq!(io.raw_os_error(), Some(libc::EBUSY));

        let io: std::io::Error = DmacapError::TimedOut.into();
        assert_eq!(io.kind(), std::io::ErrorKind::TimedOut);
    }
}
