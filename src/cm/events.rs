//! Process-wide CM event channel and the per-connection event queues.
//!
//! One detached dispatcher thread drains the singleton event channel and
//! fans events out to per-connection queues keyed by the CM identifier.
//! There is no good way to abort the blocking channel read, so the thread is
//! detached and released at process exit, mirroring the channel's own
//! lifetime.

use std::collections::{HashMap, VecDeque};
use std::ptr::{self, NonNull};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use rdma_sys::*;

use crate::cm::poller::last_errno;
use crate::error::{Error, ErrorKind, Result};

/// A connection-manager event, copied out of the provider's event structure
/// before it is acknowledged.
#[derive(Debug)]
pub(crate) struct CmEvent {
    pub event_type: rdma_cm_event_type::Type,
    /// The provider-created identifier of an incoming connection; only set
    /// for connect requests on a listener.
    pub incoming_id: Option<NonNull<rdma_cm_id>>,
    /// The peer's private-data blob, possibly padded by the transport.
    pub private_data: Vec<u8>,
}

// The raw incoming identifier is handed to exactly one accept path.
unsafe impl Send for CmEvent {}

struct QueueState {
    events: VecDeque<CmEvent>,
    aborted: bool,
}

/// Per-connection event queue. Only one thread waits on a given connection
/// at a time.
pub(crate) struct ConnectionQueue {
    state: Mutex<QueueState>,
    more_events: Condvar,
}

impl ConnectionQueue {
    fn new() -> Self {
        ConnectionQueue {
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                aborted: false,
            }),
            more_events: Condvar::new(),
        }
    }

    /// Wait for the next event. Cancellation surfaces as OperationCancelled.
    pub fn wait(&self, timeout_ms: i32) -> Result<CmEvent> {
        match self.wait_inner(timeout_ms)? {
            Some(event) => Ok(event),
            None => Err(Error::new(ErrorKind::OperationCancelled)),
        }
    }

    /// Wait for the next event, reporting cancellation as `Ok(None)`. Used
    /// by paths that expect to be cancelled without treating it as an error.
    pub fn wait_cancellable(&self, timeout_ms: i32) -> Result<Option<CmEvent>> {
        self.wait_inner(timeout_ms)
    }

    fn wait_inner(&self, timeout_ms: i32) -> Result<Option<CmEvent>> {
        let mut state = self.state.lock().unwrap();
        let deadline = if timeout_ms < 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
        };
        while !state.aborted && state.events.is_empty() {
            match deadline {
                None => state = self.more_events.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::new(ErrorKind::Timeout));
                    }
                    let (guard, _) = self
                        .more_events
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    state = guard;
                }
            }
        }
        if state.aborted {
            return Ok(None);
        }
        Ok(state.events.pop_front())
    }

    fn signal(&self, event: CmEvent) {
        let mut state = self.state.lock().unwrap();
        state.events.push_back(event);
        self.more_events.notify_one();
    }

    fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        state.aborted = true;
        self.more_events.notify_one();
    }
}

#[derive(Default)]
pub(crate) struct EventManager {
    queues: Mutex<HashMap<usize, Arc<ConnectionQueue>>>,
}

impl EventManager {
    pub fn register(&self, id: *mut rdma_cm_id) {
        let mut queues = self.queues.lock().unwrap();
        let previous = queues.insert(id as usize, Arc::new(ConnectionQueue::new()));
        debug_assert!(previous.is_none());
    }

    pub fn unregister(&self, id: *mut rdma_cm_id) {
        self.queues.lock().unwrap().remove(&(id as usize));
    }

    pub fn queue_for(&self, id: *mut rdma_cm_id) -> Result<Arc<ConnectionQueue>> {
        self.queues
            .lock()
            .unwrap()
            .get(&(id as usize))
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::InternalError))
    }

    pub fn wait_for_event(&self, id: *mut rdma_cm_id, timeout_ms: i32) -> Result<CmEvent> {
        self.queue_for(id)?.wait(timeout_ms)
    }

    pub fn abort_waits(&self, id: *mut rdma_cm_id) {
        if let Ok(queue) = self.queue_for(id) {
            queue.cancel();
        }
    }

    fn dispatch(&self, event: *mut rdma_cm_event) {
        // SAFETY: the dispatcher owns the event until it is acknowledged.
        unsafe {
            let event_type = (*event).event;
            let is_connect_request = event_type == rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST;
            // Connect requests carry the new connection's identifier; the
            // owning queue is the listener's.
            let key = if is_connect_request {
                (*event).listen_id
            } else {
                (*event).id
            };

            let conn = (*event).param.conn;
            let mut private_data = Vec::new();
            if !conn.private_data.is_null() && conn.private_data_len > 0 {
                let bytes = std::slice::from_raw_parts(
                    conn.private_data as *const u8,
                    conn.private_data_len as usize,
                );
                private_data.extend_from_slice(bytes);
            }

            let cm_event = CmEvent {
                event_type,
                incoming_id: if is_connect_request {
                    NonNull::new((*event).id)
                } else {
                    None
                },
                private_data,
            };

            match self.queue_for(key) {
                Ok(queue) => queue.signal(cm_event),
                Err(_) => log::warn!(
                    "rrstream: event {} for unknown connection {:p}",
                    event_type,
                    key
                ),
            }
        }
    }
}

struct ChannelPtr(*mut rdma_event_channel);
unsafe impl Send for ChannelPtr {}
unsafe impl Sync for ChannelPtr {}

static EVENT_MANAGER: OnceLock<EventManager> = OnceLock::new();
static EVENT_CHANNEL: Mutex<Option<ChannelPtr>> = Mutex::new(None);

pub(crate) fn manager() -> &'static EventManager {
    EVENT_MANAGER.get_or_init(EventManager::default)
}

/// The singleton event channel, created (with its dispatcher thread) on
/// first use. Creation fails when no RDMA devices are present; the failure
/// is not cached so a later call can retry.
pub(crate) fn channel() -> Result<*mut rdma_event_channel> {
    let mut guard = EVENT_CHANNEL.lock().unwrap();
    if let Some(channel) = &*guard {
        return Ok(channel.0);
    }

    // SAFETY: FFI.
    let raw = unsafe { rdma_create_event_channel() };
    if raw.is_null() {
        return Err(Error::from_os(last_errno()));
    }

    let for_thread = ChannelPtr(raw);
    let spawned = thread::Builder::new()
        .name("EventHandler".to_owned())
        .spawn(move || event_channel_loop(for_thread));
    match spawned {
        // Detached on purpose: the blocking channel read cannot be aborted,
        // so process exit reclaims the thread along with the channel.
        Ok(_handle) => {}
        Err(_) => {
            // SAFETY: channel was created above and never shared.
            unsafe { rdma_destroy_event_channel(raw) };
            return Err(Error::new(ErrorKind::OutOfMemory));
        }
    }

    *guard = Some(ChannelPtr(raw));
    Ok(raw)
}

fn event_channel_loop(channel: ChannelPtr) {
    loop {
        let mut event: *mut rdma_cm_event = ptr::null_mut();
        // SAFETY: FFI; blocks until an event arrives.
        let ret = unsafe { rdma_get_cm_event(channel.0, &mut event) };
        if ret != 0 {
            log::error!("rrstream: event channel read failed (errno {})", last_errno());
            break;
        }
        manager().dispatch(event);
        // SAFETY: every retrieved event is acknowledged exactly once.
        unsafe { rdma_ack_cm_event(event) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_wait_timeout_and_cancel() {
        let queue = ConnectionQueue::new();
        assert_eq!(queue.wait(20).unwrap_err().kind(), ErrorKind::Timeout);

        queue.signal(CmEvent {
            event_type: 0,
            incoming_id: None,
            private_data: vec![1, 2, 3],
        });
        let event = queue.wait(0).unwrap();
        assert_eq!(event.private_data, vec![1, 2, 3]);

        queue.cancel();
        assert_eq!(
            queue.wait(1000).unwrap_err().kind(),
            ErrorKind::OperationCancelled
        );
        assert!(queue.wait_cancellable(1000).unwrap().is_none());
    }

    #[test]
    fn cancel_wakes_blocked_waiter() {
        let queue = Arc::new(ConnectionQueue::new());
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait(-1))
        };
        thread::sleep(Duration::from_millis(20));
        queue.cancel();
        assert_eq!(
            waiter.join().unwrap().unwrap_err().kind(),
            ErrorKind::OperationCancelled
        );
    }

    #[test]
    fn manager_register_lookup() {
        let manager = EventManager::default();
        let fake = 0x1000 as *mut rdma_cm_id;
        assert!(manager.queue_for(fake).is_err());
        manager.register(fake);
        assert!(manager.queue_for(fake).is_ok());
        manager.abort_waits(fake);
        assert_eq!(
            manager.wait_for_event(fake, 100).unwrap_err().kind(),
            ErrorKind::OperationCancelled
        );
        manager.unregister(fake);
        assert!(manager.queue_for(fake).is_err());
    }
}
