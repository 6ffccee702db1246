//! The flat, handle-based session API.
//!
//! Every function resolves its handle through the process-wide registry
//! (acquiring the session's access gate for the duration of the call) and
//! records its outcome in the thread-local last-error slot, retrievable via
//! [`crate::get_last_error`] / [`crate::get_last_error_string`].

use std::mem;
use std::sync::Arc;

use crate::addr::Address;
use crate::buffer::CallbackData;
use crate::error::{record_last_error, Error, ErrorKind, Result};
use crate::registry::{registry, SessionHandle};
use crate::session::{
    Connector, Direction, Listener, PropertyValue, Session, PROP_CONNECTION_DATA,
    PROP_NUM_OPENED_SESSIONS, PROP_NUM_PENDING_DESTRUCTION_SESSIONS,
};

/// A leased buffer region. `buffer .. buffer + buffer_size` is the window
/// the application may touch while it holds the region; `used_size` is the
/// meaningful byte count (set by the library on receive, by the caller on
/// send). The two internal words tie the region back to its session and
/// buffer and are validated on every entry.
///
/// The struct is padded to a fixed 64 bytes for forward compatibility.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BufferRegion {
    pub buffer: *mut u8,
    pub buffer_size: usize,
    pub used_size: usize,
    internal_session: u64,
    internal_buffer: u64,
    _reserved: [u8; 24],
}

const _: () = assert!(mem::size_of::<BufferRegion>() == 64);

impl BufferRegion {
    fn new(session: SessionHandle, index: usize, ptr: *mut u8, capacity: usize, used: usize) -> Self {
        BufferRegion {
            buffer: ptr,
            buffer_size: capacity,
            used_size: used,
            internal_session: session.0,
            // Offset by one so a zeroed struct never validates.
            internal_buffer: index as u64 + 1,
            _reserved: [0; 24],
        }
    }

    /// Validate the region belongs to `session` and recover the buffer
    /// index it names.
    fn index_for(&self, session: SessionHandle) -> Result<usize> {
        if self.internal_session == 0 || self.internal_buffer == 0 {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }
        if self.internal_session != session.0 {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }
        Ok((self.internal_buffer - 1) as usize)
    }
}

fn lookup(session: SessionHandle) -> Result<crate::registry::SessionRef> {
    registry().lookup(session, true, false)
}

/// List local RDMA-capable interface addresses, filtered by address family
/// (0 = any, 4 = IPv4, 6 = IPv6).
pub fn enumerate(filter_address_family: i32) -> Result<Vec<String>> {
    record_last_error(crate::enumerate::enumerate(filter_address_family))
}

/// Create a connector session bound to a local address; an empty address
/// means "any".
pub fn create_connector(local_address: &str, local_port: u16) -> Result<SessionHandle> {
    record_last_error((|| {
        let local = Address::parse(local_address, local_port)?;
        let connector: Arc<dyn Session> = Arc::new(Connector::new(&local)?);
        Ok(registry().register(connector))
    })())
}

/// Create a listener session bound to a local address.
pub fn create_listener(local_address: &str, local_port: u16) -> Result<SessionHandle> {
    record_last_error((|| {
        let local = Address::parse(local_address, local_port)?;
        let listener: Arc<dyn Session> = Arc::new(Listener::new(&local)?);
        Ok(registry().register(listener))
    })())
}

/// Connect to a listening peer with the declared data direction. Connector
/// sessions are single-use; see [`crate::Direction`] for the handshake
/// agreement the two sides must satisfy.
pub fn connect(
    session: SessionHandle,
    direction: Direction,
    remote_address: &str,
    remote_port: u16,
    timeout_ms: i32,
) -> Result<()> {
    record_last_error((|| {
        if direction == Direction::Unknown {
            return Err(Error::new(ErrorKind::InvalidDirection));
        }
        let remote = Address::parse(remote_address, remote_port)?;
        if remote.is_unspecified() {
            return Err(Error::new(ErrorKind::InvalidAddress));
        }
        let session_ref = lookup(session)?;
        session_ref.session().connect(direction, remote, timeout_ms)
    })())
}

/// Accept one incoming connection, producing a fresh connected session.
pub fn accept(
    session: SessionHandle,
    direction: Direction,
    timeout_ms: i32,
) -> Result<SessionHandle> {
    record_last_error((|| {
        if direction == Direction::Unknown {
            return Err(Error::new(ErrorKind::InvalidDirection));
        }
        let session_ref = lookup(session)?;
        let connected = session_ref.session().accept(direction, timeout_ms)?;
        Ok(registry().register(connected))
    })())
}

/// Cancel every in-flight operation on the session. Non-blocking and
/// idempotent; the session stays open.
pub fn abort_session(session: SessionHandle) -> Result<()> {
    record_last_error((|| {
        let session_ref = lookup(session)?;
        session_ref.session().cancel();
        Ok(())
    })())
}

/// Close the session. With
/// [`crate::CLOSE_FLAG_DEFER_WHILE_USER_BUFFERS_OUTSTANDING`] the session is
/// parked until the application returns every held region to idle.
pub fn close_session(session: SessionHandle, flags: u32) -> Result<()> {
    record_last_error(registry().destroy(session, flags))
}

/// Configure the session's transfer pool: `max_concurrent_transactions`
/// internally-allocated buffers of `max_transaction_size` bytes. Exactly
/// one configure call per connected session.
pub fn configure_buffers(
    session: SessionHandle,
    max_transaction_size: usize,
    max_concurrent_transactions: usize,
) -> Result<()> {
    record_last_error((|| {
        let session_ref = lookup(session)?;
        session_ref
            .session()
            .configure_buffers(max_transaction_size, max_concurrent_transactions)
    })())
}

/// Configure the session over a caller-owned buffer, leased as
/// `max_concurrent_transactions` overlapping sub-ranges.
///
/// # Safety
///
/// `buffer .. buffer + buffer_size` must be valid, writable, and outlive
/// the session.
pub unsafe fn configure_external_buffer(
    session: SessionHandle,
    buffer: *mut u8,
    buffer_size: usize,
    max_concurrent_transactions: usize,
) -> Result<()> {
    record_last_error((|| {
        if buffer.is_null() {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }
        let session_ref = lookup(session)?;
        session_ref
            .session()
            .configure_external_buffer(buffer, buffer_size, max_concurrent_transactions)
    })())
}

/// Acquire an idle region to fill for sending. Blocks up to `timeout_ms`
/// (0 polls, -1 waits forever).
pub fn acquire_send_region(session: SessionHandle, timeout_ms: i32) -> Result<BufferRegion> {
    record_last_error((|| {
        let session_ref = lookup(session)?;
        let view = session_ref.session().acquire_send_region(timeout_ms)?;
        Ok(BufferRegion::new(session, view.index, view.ptr, view.capacity, view.capacity))
    })())
}

/// Acquire the oldest completed receive region. Blocks up to `timeout_ms`.
pub fn acquire_received_region(session: SessionHandle, timeout_ms: i32) -> Result<BufferRegion> {
    record_last_error((|| {
        let session_ref = lookup(session)?;
        let view = session_ref.session().acquire_received_region(timeout_ms)?;
        Ok(BufferRegion::new(session, view.index, view.ptr, view.capacity, view.used))
    })())
}

/// Queue a user-held region: submits `used_size` bytes on the send side,
/// re-posts the buffer on the receive side. The optional callback fires on
/// completion with the region's two context words.
pub fn queue_buffer_region(
    session: SessionHandle,
    region: &BufferRegion,
    callback: Option<CallbackData>,
) -> Result<()> {
    record_last_error((|| {
        let index = region.index_for(session)?;
        let session_ref = lookup(session)?;
        session_ref.session().set_region_used(index, region.used_size)?;
        session_ref.session().queue_region(index, callback)
    })())
}

/// Return a consumed receive region to the provider, announcing a fresh
/// credit to the peer. If the session has disconnected the region reverts
/// to idle silently, so a wait-process-release loop ends cleanly.
pub fn release_received_buffer_region(
    session: SessionHandle,
    region: &BufferRegion,
) -> Result<()> {
    record_last_error((|| {
        let index = region.index_for(session)?;
        let session_ref = lookup(session)?;
        session_ref.session().release_received_region(index)
    })())
}

/// Return any user-held region to idle without queueing it. Valid on a
/// session parked in the deferred-close table; returning the last region
/// completes the deferred destruction.
pub fn release_user_buffer_region_to_idle(
    session: SessionHandle,
    region: &BufferRegion,
) -> Result<()> {
    record_last_error((|| {
        let index = region.index_for(session)?;
        let session_ref = registry().lookup(session, true, true)?;
        session_ref.session().release_region_to_idle(index)?;
        if session_ref.destruction_pending() {
            registry().finish_deferred_if_ready(session_ref, session);
        }
        Ok(())
    })())
}

/// Queue a sub-range of the configured external buffer, waiting up to
/// `timeout_ms` for a lease slot.
///
/// # Safety
///
/// `pointer_within_buffer .. + size` must lie inside the buffer passed to
/// [`configure_external_buffer`].
pub unsafe fn queue_external_buffer_region(
    session: SessionHandle,
    pointer_within_buffer: *mut u8,
    size: usize,
    callback: Option<CallbackData>,
    timeout_ms: i32,
) -> Result<()> {
    record_last_error((|| {
        if pointer_within_buffer.is_null() {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }
        let session_ref = lookup(session)?;
        session_ref
            .session()
            .queue_external_region(pointer_within_buffer, size, callback, timeout_ms)
    })())
}

/// The session's local address and port.
pub fn get_local_address(session: SessionHandle) -> Result<(String, u16)> {
    record_last_error((|| {
        let session_ref = lookup(session)?;
        let address = session_ref.session().local_address()?;
        Ok((address.addr_string()?, address.port()))
    })())
}

/// The connected peer's address and port.
pub fn get_remote_address(session: SessionHandle) -> Result<(String, u16)> {
    record_last_error((|| {
        let session_ref = lookup(session)?;
        let address = session_ref.session().remote_address()?;
        Ok((address.addr_string()?, address.port()))
    })())
}

/// Read a property into `value` if provided; either way the payload size is
/// returned. Global properties ignore the session handle.
pub fn get_property(
    session: SessionHandle,
    property_id: u32,
    value: Option<&mut [u8]>,
) -> Result<usize> {
    record_last_error((|| {
        let payload = match property_id {
            PROP_CONNECTION_DATA => return Err(Error::new(ErrorKind::WriteOnlyProperty)),
            PROP_NUM_OPENED_SESSIONS => PropertyValue::from_u64(registry().open_count()),
            PROP_NUM_PENDING_DESTRUCTION_SESSIONS => {
                PropertyValue::from_u64(registry().deferred_close_count())
            }
            _ => {
                let session_ref = lookup(session)?;
                session_ref.session().get_property(property_id)?
            }
        };
        payload.copy_to(value)
    })())
}

/// Write a property.
pub fn set_property(session: SessionHandle, property_id: u32, value: &[u8]) -> Result<()> {
    record_last_error((|| {
        let session_ref = lookup(session)?;
        session_ref.session().set_property(property_id, value)
    })())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_validation() {
        let handle = SessionHandle(7);
        let region = BufferRegion::new(handle, 3, std::ptr::null_mut(), 64, 64);
        assert_eq!(region.index_for(handle).unwrap(), 3);

        // Wrong session.
        assert_eq!(
            region.index_for(SessionHandle(8)).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        // A zeroed region never validates.
        // SAFETY: BufferRegion is plain-old-data.
        let zeroed: BufferRegion = unsafe { mem::zeroed() };
        assert_eq!(
            zeroed.index_for(handle).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn invalid_handles_are_rejected() {
        assert_eq!(
            abort_session(SessionHandle::INVALID).unwrap_err().kind(),
            ErrorKind::InvalidSession
        );
        assert_eq!(
            close_session(SessionHandle(u64::MAX), 0).unwrap_err().kind(),
            ErrorKind::InvalidSession
        );
        // Failures populate the thread-local last error.
        assert_eq!(
            crate::get_last_error().unwrap().kind(),
            ErrorKind::InvalidSession
        );
    }

    #[test]
    fn global_properties_do_not_need_a_session() {
        let mut value = [0u8; 8];
        let size = get_property(
            SessionHandle::INVALID,
            PROP_NUM_OPENED_SESSIONS,
            Some(&mut value),
        )
        .unwrap();
        assert_eq!(size, 8);

        assert_eq!(
            get_property(SessionHandle::INVALID, PROP_CONNECTION_DATA, None)
                .unwrap_err()
                .kind(),
            ErrorKind::WriteOnlyProperty
        );
    }

    #[test]
    fn connect_validates_arguments() {
        assert_eq!(
            connect(SessionHandle(1), Direction::Unknown, "127.0.0.1", 1, 0)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidDirection
        );
        assert_eq!(
            connect(SessionHandle(1), Direction::Send, "", 1, 0)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidAddress
        );
    }
}
