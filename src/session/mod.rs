//! Session variants, the polymorphic session surface, and typed properties.

mod connected;
mod connector;
mod listener;

pub(crate) use connected::ConnectedSession;
pub(crate) use connector::Connector;
pub(crate) use listener::Listener;

use std::sync::Arc;

use crate::access::AccessManager;
use crate::addr::Address;
use crate::buffer::{CallbackData, RegionView};
use crate::error::{Error, ErrorKind, Result};

/// Direction of a connected session's data stream, fixed at connect/accept.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send = 0x00,
    Receive = 0x01,
    Unknown = 0xFF,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Send => Direction::Receive,
            Direction::Receive => Direction::Send,
            Direction::Unknown => Direction::Unknown,
        }
    }
}

impl TryFrom<u32> for Direction {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0x00 => Ok(Direction::Send),
            0x01 => Ok(Direction::Receive),
            _ => Err(Error::new(ErrorKind::InvalidDirection)),
        }
    }
}

/// Session-level properties.
pub const PROP_QUEUED_BUFFERS: u32 = 0x100;
pub const PROP_CONNECTED: u32 = 0x101;
pub const PROP_USER_BUFFERS: u32 = 0x102;
pub const PROP_USE_RX_POLLING: u32 = 0x103;

/// Global properties (testing surface).
pub const PROP_NUM_OPENED_SESSIONS: u32 = 0x200;
pub const PROP_NUM_PENDING_DESTRUCTION_SESSIONS: u32 = 0x201;
pub const PROP_CONNECTION_DATA: u32 = 0x202;

/// Self-describing property payload. Carries the raw bytes of a typed value
/// and validates the caller's buffer size when copied out.
#[derive(Debug, Clone, Default)]
pub struct PropertyValue {
    data: Vec<u8>,
}

impl PropertyValue {
    pub(crate) fn from_u64(value: u64) -> Self {
        PropertyValue {
            data: value.to_ne_bytes().to_vec(),
        }
    }

    pub(crate) fn from_bool(value: bool) -> Self {
        PropertyValue {
            data: vec![value as u8],
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.data.clone().try_into().ok().map(u64::from_ne_bytes)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.data.as_slice() {
            [b] => Some(*b != 0),
            _ => None,
        }
    }

    /// Copy the payload into `out` if provided, validating its size; either
    /// way, return the payload size.
    pub fn copy_to(&self, out: Option<&mut [u8]>) -> Result<usize> {
        if let Some(out) = out {
            if out.len() < self.data.len() {
                return Err(Error::new(ErrorKind::InvalidSize));
            }
            out[..self.data.len()].copy_from_slice(&self.data);
        }
        Ok(self.data.len())
    }
}

/// The polymorphic session surface. Variants override what they support;
/// everything else fails with InvalidOperation (or InvalidProperty for
/// property reads), matching the flat API's error contract.
pub(crate) trait Session: Send + Sync {
    fn access(&self) -> &AccessManager;

    fn connect(&self, _direction: Direction, _remote: Address, _timeout_ms: i32) -> Result<()> {
        Err(Error::new(ErrorKind::InvalidOperation))
    }

    fn accept(&self, _direction: Direction, _timeout_ms: i32) -> Result<Arc<dyn Session>> {
        Err(Error::new(ErrorKind::InvalidOperation))
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn cancel(&self) {}

    fn get_property(&self, _property_id: u32) -> Result<PropertyValue> {
        Err(Error::new(ErrorKind::InvalidProperty))
    }

    fn set_property(&self, _property_id: u32, _value: &[u8]) -> Result<()> {
        Err(Error::new(ErrorKind::InvalidOperation))
    }

    fn local_address(&self) -> Result<Address> {
        Err(Error::new(ErrorKind::InvalidOperation))
    }

    fn remote_address(&self) -> Result<Address> {
        Err(Error::new(ErrorKind::InvalidOperation))
    }

    fn configure_buffers(&self, _max_transaction_size: usize, _max_concurrent: usize) -> Result<()> {
        Err(Error::new(ErrorKind::InvalidOperation))
    }

    fn configure_external_buffer(
        &self,
        _buffer: *mut u8,
        _size: usize,
        _max_concurrent: usize,
    ) -> Result<()> {
        Err(Error::new(ErrorKind::InvalidOperation))
    }

    fn acquire_send_region(&self, _timeout_ms: i32) -> Result<RegionView> {
        Err(Error::new(ErrorKind::InvalidOperation))
    }

    fn acquire_received_region(&self, _timeout_ms: i32) -> Result<RegionView> {
        Err(Error::new(ErrorKind::InvalidOperation))
    }

    fn set_region_used(&self, _index: usize, _used: usize) -> Result<()> {
        Err(Error::new(ErrorKind::InvalidOperation))
    }

    fn queue_region(&self, _index: usize, _callback: Option<CallbackData>) -> Result<()> {
        Err(Error::new(ErrorKind::InvalidOperation))
    }

    fn queue_external_region(
        &self,
        _ptr: *mut u8,
        _size: usize,
        _callback: Option<CallbackData>,
        _timeout_ms: i32,
    ) -> Result<()> {
        Err(Error::new(ErrorKind::InvalidOperation))
    }

    /// Re-queue a received region, falling back to Idle when disconnected.
    fn release_received_region(&self, _index: usize) -> Result<()> {
        Err(Error::new(ErrorKind::InvalidOperation))
    }

    /// Return a user-held region to Idle without re-queueing. Valid even on
    /// a session parked in the deferred-close table.
    fn release_region_to_idle(&self, _index: usize) -> Result<()> {
        Err(Error::new(ErrorKind::InvalidOperation))
    }

    fn deferred_destruction_ready(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_conversions() {
        assert_eq!(Direction::try_from(0).unwrap(), Direction::Send);
        assert_eq!(Direction::try_from(1).unwrap(), Direction::Receive);
        assert_eq!(
            Direction::try_from(7).unwrap_err().kind(),
            ErrorKind::InvalidDirection
        );
        assert_eq!(Direction::Send.opposite(), Direction::Receive);
        assert_eq!(Direction::Receive.opposite(), Direction::Send);
    }

    #[test]
    fn property_value_copy_out() {
        let value = PropertyValue::from_u64(42);
        assert_eq!(value.copy_to(None).unwrap(), 8);
        assert_eq!(value.as_u64(), Some(42));

        let mut exact = [0u8; 8];
        assert_eq!(value.copy_to(Some(&mut exact)).unwrap(), 8);
        assert_eq!(u64::from_ne_bytes(exact), 42);

        let mut small = [0u8; 4];
        assert_eq!(
            value.copy_to(Some(&mut small)).unwrap_err().kind(),
            ErrorKind::InvalidSize
        );

        let flag = PropertyValue::from_bool(true);
        assert_eq!(flag.as_bool(), Some(true));
        assert_eq!(flag.bytes(), &[1]);
    }
}
