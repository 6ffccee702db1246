//! The listener session variant.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rdma_sys::*;

use crate::access::{AccessManager, SuspendGuard};
use crate::addr::Address;
use crate::cm::{events, CmId};
use crate::error::{Error, ErrorKind, Result};
use crate::session::{ConnectedSession, Direction, PropertyValue, Session, PROP_CONNECTION_DATA};

/// A listener binds and listens on a local address; every accepted
/// connection becomes a fresh connected session. The listener itself never
/// transitions into a connected state.
pub(crate) struct Listener {
    access: AccessManager,
    cm: CmId,
    local_address: Address,
    connection_data: Mutex<Vec<u8>>,
    accept_in_progress: AtomicBool,
}

impl Listener {
    pub fn new(local: &Address) -> Result<Self> {
        let cm = CmId::create_bound(local)?;
        cm.listen()?;
        let local_address = cm.local_address();
        Ok(Listener {
            access: AccessManager::new(),
            cm,
            local_address,
            connection_data: Mutex::new(Vec::new()),
            accept_in_progress: AtomicBool::new(false),
        })
    }
}

impl Session for Listener {
    fn access(&self) -> &AccessManager {
        &self.access
    }

    fn accept(&self, direction: Direction, timeout_ms: i32) -> Result<Arc<dyn Session>> {
        if self.accept_in_progress.swap(true, Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::InvalidOperation));
        }
        let result = (|| -> Result<Arc<dyn Session>> {
            let _suspend = SuspendGuard::new(&self.access);
            let event = events::manager().wait_for_event(self.cm.raw(), timeout_ms)?;
            if event.event_type != rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST {
                return Err(Error::new(ErrorKind::UnableToConnect));
            }
            let incoming = event
                .incoming_id
                .ok_or_else(|| Error::new(ErrorKind::InternalError))?;
            let outbound = self.connection_data.lock().unwrap().clone();
            let session = ConnectedSession::accept_incoming(
                direction,
                incoming,
                &event.private_data,
                outbound,
            )?;
            Ok(Arc::new(session))
        })();
        self.accept_in_progress.store(false, Ordering::SeqCst);
        result
    }

    fn cancel(&self) {
        events::manager().abort_waits(self.cm.raw());
    }

    fn set_property(&self, property_id: u32, value: &[u8]) -> Result<()> {
        match property_id {
            PROP_CONNECTION_DATA => {
                *self.connection_data.lock().unwrap() = value.to_vec();
                Ok(())
            }
            _ => Err(Error::new(ErrorKind::ReadOnlyProperty)),
        }
    }

    fn get_property(&self, _property_id: u32) -> Result<PropertyValue> {
        Err(Error::new(ErrorKind::InvalidProperty))
    }

    fn local_address(&self) -> Result<Address> {
        Ok(self.local_address)
    }

    fn remote_address(&self) -> Result<Address> {
        Ok(Address::unspecified())
    }
}
