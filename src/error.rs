//! Error kinds, source-location capture, and the per-thread last-error store.

use std::cell::Cell;
use std::panic::Location;

use thiserror::Error;

/// The closed set of error kinds the library can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("Operation timed out.")]
    Timeout,
    #[error("The specified session could not be found.")]
    InvalidSession,
    #[error("Invalid argument.")]
    InvalidArgument,
    #[error("Invalid operation.")]
    InvalidOperation,
    #[error("No buffers queued.")]
    NoBuffersQueued,
    #[error("Operating system error.")]
    OperatingSystemError,
    #[error("The provided size was invalid.")]
    InvalidSize,
    #[error("Out of memory.")]
    OutOfMemory,
    #[error("An internal error occurred.")]
    InternalError,
    #[error("Invalid address.")]
    InvalidAddress,
    #[error("Operation cancelled.")]
    OperationCancelled,
    #[error("Invalid property.")]
    InvalidProperty,
    #[error("Session not configured.")]
    SessionNotConfigured,
    #[error("Not connected.")]
    NotConnected,
    #[error("Unable to connect.")]
    UnableToConnect,
    #[error("Already configured.")]
    AlreadyConfigured,
    #[error("Disconnected.")]
    Disconnected,
    #[error("Blocking buffer operation already in progress.")]
    BufferWaitInProgress,
    #[error("Current session is already connected.")]
    AlreadyConnected,
    #[error("Specified direction is invalid.")]
    InvalidDirection,
    #[error("Incompatible protocol.")]
    IncompatibleProtocol,
    #[error("Incompatible version.")]
    IncompatibleVersion,
    #[error("Connection refused.")]
    ConnectionRefused,
    #[error("Writing a read-only property is not permitted.")]
    ReadOnlyProperty,
    #[error("Reading a write-only property is not permitted.")]
    WriteOnlyProperty,
    #[error("The current operation is not supported.")]
    OperationNotSupported,
    #[error("The requested address is already in use.")]
    AddressInUse,
    #[error("The Send buffer is too large.")]
    SendTooLargeForRecvBuffer,
}

/// An error with its kind, an optional OS/verbs subcode, and the source
/// location where it was raised.
///
/// The type is `Copy` on purpose: completion callbacks receive it by value
/// and the sticky queue status stores it without allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind} [{file}:{line}]")]
pub struct Error {
    kind: ErrorKind,
    subcode: i32,
    file: &'static str,
    line: u32,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Raise an error of the given kind at the caller's source location.
    #[track_caller]
    pub fn new(kind: ErrorKind) -> Self {
        let loc = Location::caller();
        Error {
            kind,
            subcode: 0,
            file: loc.file(),
            line: loc.line(),
        }
    }

    /// Raise an error carrying a numeric OS/verbs subcode.
    #[track_caller]
    pub fn with_subcode(kind: ErrorKind, subcode: i32) -> Self {
        let loc = Location::caller();
        Error {
            kind,
            subcode,
            file: loc.file(),
            line: loc.line(),
        }
    }

    /// Translate an OS `errno` value, keeping it as the subcode.
    #[track_caller]
    pub fn from_os(errno: i32) -> Self {
        Self::with_subcode(os_error_kind(errno), errno)
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub fn subcode(&self) -> i32 {
        self.subcode
    }

    #[inline]
    pub fn file(&self) -> &'static str {
        self.file
    }

    #[inline]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Multi-line elaboration used by [`get_last_error_string`]:
    /// description, optional subcode, then the raising location.
    pub fn detailed_string(&self) -> String {
        let mut out = self.kind.to_string();
        if self.subcode != 0 {
            out.push_str(&format!("\nSubcode: {}", self.subcode));
        }
        out.push_str(&format!("\nLocation: {}:{}\n", self.file, self.line));
        out
    }
}

/// Map an OS `errno` to an error kind. Unknown values fall back to
/// [`ErrorKind::OperatingSystemError`]; the raw value is preserved in the
/// subcode by [`Error::from_os`].
pub(crate) fn os_error_kind(errno: i32) -> ErrorKind {
    match errno {
        libc::EINVAL => ErrorKind::InvalidArgument,
        libc::ETIMEDOUT => ErrorKind::Timeout,
        libc::ENOMEM => ErrorKind::OutOfMemory,
        libc::ECANCELED => ErrorKind::OperationCancelled,
        libc::ECONNREFUSED => ErrorKind::UnableToConnect,
        libc::ECONNABORTED => ErrorKind::Disconnected,
        libc::ENETUNREACH => ErrorKind::UnableToConnect,
        libc::EADDRNOTAVAIL => ErrorKind::InvalidAddress,
        libc::EADDRINUSE => ErrorKind::AddressInUse,
        _ => ErrorKind::OperatingSystemError,
    }
}

/// Map a verbs work-completion status to an error kind. Only the local
/// length error has a distinct mapping; everything else is an opaque
/// provider failure whose raw status rides in the subcode.
pub(crate) fn wc_error_kind(status: u32) -> ErrorKind {
    match status {
        rdma_sys::ibv_wc_status::IBV_WC_LOC_LEN_ERR => ErrorKind::InvalidSize,
        _ => ErrorKind::OperatingSystemError,
    }
}

thread_local! {
    static LAST_ERROR: Cell<Option<Error>> = const { Cell::new(None) };
}

/// Record the outcome of an API call in the thread-local last-error slot.
/// Success clears the slot.
pub(crate) fn record_last_error<T>(result: Result<T>) -> Result<T> {
    LAST_ERROR.with(|slot| match &result {
        Ok(_) => slot.set(None),
        Err(e) => slot.set(Some(*e)),
    });
    result
}

/// The last error recorded on this thread, if any.
pub fn get_last_error() -> Option<Error> {
    LAST_ERROR.with(|slot| slot.get())
}

/// Clear the thread-local last-error record.
pub fn clear_last_error() {
    LAST_ERROR.with(|slot| slot.set(None));
}

/// The formatted elaboration of the last error on this thread, or an empty
/// string when the last call succeeded.
pub fn last_error_string() -> String {
    match get_last_error() {
        Some(e) => e.detailed_string(),
        None => String::new(),
    }
}

/// Copy the last-error elaboration into a caller-provided byte buffer as a
/// NUL-terminated string. Fails with [`ErrorKind::InvalidSize`] when the
/// buffer cannot hold the full text plus the terminating NUL.
pub fn get_last_error_string(buffer: &mut [u8]) -> Result<()> {
    let text = last_error_string();
    if buffer.len() <= text.len() {
        return Err(Error::new(ErrorKind::InvalidSize));
    }
    buffer[..text.len()].copy_from_slice(text.as_bytes());
    buffer[text.len()] = 0;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_is_captured() {
        let err = Error::new(ErrorKind::Timeout);
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.subcode(), 0);
        assert!(err.file().ends_with("error.rs"));
        assert!(err.line() > 0);
    }

    #[test]
    fn os_translation() {
        assert_eq!(os_error_kind(libc::EINVAL), ErrorKind::InvalidArgument);
        assert_eq!(os_error_kind(libc::EADDRINUSE), ErrorKind::AddressInUse);
        assert_eq!(os_error_kind(12345), ErrorKind::OperatingSystemError);
        let err = Error::from_os(libc::ECONNREFUSED);
        assert_eq!(err.kind(), ErrorKind::UnableToConnect);
        assert_eq!(err.subcode(), libc::ECONNREFUSED);
    }

    #[test]
    fn last_error_roundtrip() {
        clear_last_error();
        assert_eq!(last_error_string(), "");

        let failed: Result<()> = Err(Error::new(ErrorKind::InvalidAddress));
        let _ = record_last_error(failed);
        let recorded = get_last_error().expect("error should be recorded");
        assert_eq!(recorded.kind(), ErrorKind::InvalidAddress);

        let text = last_error_string();
        assert!(text.starts_with("Invalid address."));
        assert!(text.contains("Location: "));
        assert!(text.ends_with('\n'));

        // Success clears the record.
        let _ = record_last_error(Ok(()));
        assert!(get_last_error().is_none());
    }

    #[test]
    fn error_string_subcode_line() {
        let err = Error::with_subcode(ErrorKind::OperatingSystemError, 110);
        let text = err.detailed_string();
        assert!(text.contains("\nSubcode: 110"));
        assert!(text.contains("\nLocation: "));
    }

    #[test]
    fn error_string_buffer_too_small() {
        let failed: Result<()> = Err(Error::new(ErrorKind::Timeout));
        let _ = record_last_error(failed);

        let mut tiny = [0u8; 4];
        let err = get_last_error_string(&mut tiny).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSize);

        let mut big = [0u8; 256];
        get_last_error_string(&mut big).unwrap();
        let len = big.iter().position(|&b| b == 0).unwrap();
        let text = std::str::from_utf8(&big[..len]).unwrap();
        assert!(text.starts_with("Operation timed out."));
    }
}
