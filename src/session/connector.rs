//! The connector session variant.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::access::AccessManager;
use crate::addr::Address;
use crate::buffer::{CallbackData, RegionView};
use crate::cm::events;
use crate::error::{Error, ErrorKind, Result};
use crate::session::{ConnectedSession, Direction, PropertyValue, Session};

/// A connector owns an unconnected session bound to a local address and
/// drives it through at most one connect.
///
/// A connector is single-use: after a successful connect further attempts
/// fail with AlreadyConnected, and after a failed connect the provider
/// rejects the reused identifier (typically with InvalidArgument).
pub(crate) struct Connector {
    session: ConnectedSession,
    ever_connected: AtomicBool,
    connect_in_progress: AtomicBool,
}

impl Connector {
    pub fn new(local: &Address) -> Result<Self> {
        Ok(Connector {
            session: ConnectedSession::new_unconnected(local)?,
            ever_connected: AtomicBool::new(false),
            connect_in_progress: AtomicBool::new(false),
        })
    }
}

impl Session for Connector {
    fn access(&self) -> &AccessManager {
        self.session.access_manager()
    }

    fn connect(&self, direction: Direction, remote: Address, timeout_ms: i32) -> Result<()> {
        if self.ever_connected.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::AlreadyConnected));
        }
        if self.connect_in_progress.swap(true, Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::InvalidOperation));
        }
        let result = self.session.connect_impl(direction, remote, timeout_ms);
        if result.is_ok() {
            self.ever_connected.store(true, Ordering::SeqCst);
        }
        self.connect_in_progress.store(false, Ordering::SeqCst);
        result
    }

    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    fn cancel(&self) {
        // Unblock a connect stuck waiting for resolution or establishment,
        // then cancel the streaming side.
        events::manager().abort_waits(self.session.cm_raw());
        self.session.cancel();
    }

    fn get_property(&self, property_id: u32) -> Result<PropertyValue> {
        self.session.get_property(property_id)
    }

    fn set_property(&self, property_id: u32, value: &[u8]) -> Result<()> {
        self.session.set_property(property_id, value)
    }

    fn local_address(&self) -> Result<Address> {
        self.session.local_address()
    }

    fn remote_address(&self) -> Result<Address> {
        self.session.remote_address()
    }

    fn configure_buffers(&self, max_transaction_size: usize, max_concurrent: usize) -> Result<()> {
        self.session.configure_buffers(max_transaction_size, max_concurrent)
    }

    fn configure_external_buffer(
        &self,
        buffer: *mut u8,
        size: usize,
        max_concurrent: usize,
    ) -> Result<()> {
        self.session.configure_external_buffer(buffer, size, max_concurrent)
    }

    fn acquire_send_region(&self, timeout_ms: i32) -> Result<RegionView> {
        self.session.acquire_send_region(timeout_ms)
    }

    fn acquire_received_region(&self, timeout_ms: i32) -> Result<RegionView> {
        self.session.acquire_received_region(timeout_ms)
    }

    fn set_region_used(&self, index: usize, used: usize) -> Result<()> {
        self.session.set_region_used(index, used)
    }

    fn queue_region(&self, index: usize, callback: Option<CallbackData>) -> Result<()> {
        self.session.queue_region(index, callback)
    }

    fn queue_external_region(
        &self,
        ptr: *mut u8,
        size: usize,
        callback: Option<CallbackData>,
        timeout_ms: i32,
    ) -> Result<()> {
        self.session.queue_external_region(ptr, size, callback, timeout_ms)
    }

    fn release_received_region(&self, index: usize) -> Result<()> {
        self.session.release_received_region(index)
    }

    fn release_region_to_idle(&self, index: usize) -> Result<()> {
        self.session.release_region_to_idle(index)
    }

    fn deferred_destruction_ready(&self) -> bool {
        self.session.deferred_destruction_ready()
    }
}
