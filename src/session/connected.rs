//! The connected streaming session: wires the queue pair and completion
//! channels to the transfer and credit buffer queues, and runs the worker
//! threads that couple provider completions back to application buffers.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rdma_sys::*;

use crate::access::{AccessManager, SuspendGuard};
use crate::addr::Address;
use crate::buffer::{CallbackData, RegionView};
use crate::cm::{events, CmId, FdPoller};
use crate::error::{wc_error_kind, Error, ErrorKind, Result};
use crate::mem::MemoryRegion;
use crate::queue::{BufferQueue, IgnoreCredits, PostDescriptor, QueueEndpoint};
use crate::session::{
    Direction, PropertyValue, Session, PROP_CONNECTED, PROP_CONNECTION_DATA, PROP_QUEUED_BUFFERS,
    PROP_USER_BUFFERS, PROP_USE_RX_POLLING,
};
use crate::wire;

/// The accept-side handshake completion is not the wait for an incoming
/// connection; a connect request already brought us here and `rdma_accept`
/// only finishes the exchange with the remote side.
const ESTABLISH_TIMEOUT_MS: i32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferOwnership {
    Unknown,
    Internal,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferType {
    Unknown,
    Single,
    Multiple,
}

struct CoreState {
    connection_data: Vec<u8>,
    use_polling: bool,
    auto_queue_rx: bool,
    ownership: BufferOwnership,
    buffer_type: BufferType,
    local_address: Address,
    remote_address: Address,
}

/// The transfer queue plus credits that arrived before configure; guarded
/// by one mutex because credit arrival races with configuration.
struct TransferSlot {
    queue: Option<Arc<BufferQueue>>,
    pending_credits: VecDeque<u64>,
}

/// State shared between the session object and its worker threads.
pub(crate) struct SessionCore {
    cm: CmId,
    poller: FdPoller,
    connected: AtomicBool,
    closing: AtomicBool,
    buffer_wait_in_progress: AtomicBool,
    direction: AtomicU32,
    state: Mutex<CoreState>,
    credit_queue: Mutex<Option<Arc<BufferQueue>>>,
    transfer: Mutex<TransferSlot>,
}

impl SessionCore {
    fn new(cm: CmId) -> Result<Self> {
        let local_address = cm.local_address();
        Ok(SessionCore {
            cm,
            poller: FdPoller::new()?,
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            buffer_wait_in_progress: AtomicBool::new(false),
            direction: AtomicU32::new(Direction::Unknown as u32),
            state: Mutex::new(CoreState {
                connection_data: Vec::new(),
                use_polling: false,
                auto_queue_rx: false,
                ownership: BufferOwnership::Unknown,
                buffer_type: BufferType::Unknown,
                local_address,
                remote_address: Address::unspecified(),
            }),
            credit_queue: Mutex::new(None),
            transfer: Mutex::new(TransferSlot {
                queue: None,
                pending_credits: VecDeque::new(),
            }),
        })
    }

    fn data_direction(&self) -> Direction {
        match self.direction.load(Ordering::SeqCst) {
            0x00 => Direction::Send,
            0x01 => Direction::Receive,
            _ => Direction::Unknown,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn transfer_queue(&self) -> Result<Arc<BufferQueue>> {
        self.transfer
            .lock()
            .unwrap()
            .queue
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::SessionNotConfigured))
    }

    fn credit_queue(&self) -> Result<Arc<BufferQueue>> {
        self.credit_queue
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::InternalError))
    }

    /// The queue whose buffers complete on the given verbs direction: the
    /// transfer queue for the data direction, the credit queue otherwise.
    fn queue_for_cq(&self, verbs_direction: Direction) -> Result<Arc<BufferQueue>> {
        if verbs_direction == self.data_direction() {
            self.transfer_queue()
        } else {
            self.credit_queue()
        }
    }

    /// Credits arrive asynchronously and may precede configuration; stage
    /// them until the transfer queue exists, then apply in arrival order.
    fn add_credit(&self, buffer_size: u64) -> Result<()> {
        let mut slot = self.transfer.lock().unwrap();
        match &slot.queue {
            Some(queue) => {
                let queue = queue.clone();
                queue.add_credit(buffer_size)
            }
            None => {
                slot.pending_credits.push_back(buffer_size);
                Ok(())
            }
        }
    }

    /// Idempotent across the local-close and remote-disconnect paths; the
    /// queues latch whichever error arrived first.
    fn handle_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let slot = self.transfer.lock().unwrap();
        if let Some(queue) = &slot.queue {
            queue.abort(Error::new(ErrorKind::Disconnected));
        }
        if let Some(queue) = &*self.credit_queue.lock().unwrap() {
            queue.abort(Error::new(ErrorKind::Disconnected));
        }
    }

    fn check_transfer_status(&self) -> Result<()> {
        if let Ok(queue) = self.transfer_queue() {
            if let Some(status) = queue.queue_status() {
                return Err(status);
            }
        }
        Ok(())
    }

    /// Announce freshly posted receive capacity to the peer through the
    /// auxiliary queue. At most one message's worth per call.
    fn send_credit_update(&self, buffer_lengths: &[u64]) -> Result<()> {
        debug_assert!(buffer_lengths.len() <= wire::MAX_CREDITS_PER_MESSAGE);
        let aux = self.credit_queue()?;
        let index = aux.acquire_idle(-1)?;
        let view = aux.buffer_view(index)?;
        // SAFETY: the buffer is in the User set; nothing else touches it.
        let payload = unsafe { std::slice::from_raw_parts_mut(view.ptr, view.capacity) };
        let written = wire::encode_credits(buffer_lengths, payload);
        aux.set_used(index, written)?;
        aux.queue(index, IgnoreCredits::Yes)
    }

    /// Couple one work completion back to its buffer queue.
    fn dispatch_completion(&self, wc: &ibv_wc, verbs_direction: Direction) -> Result<()> {
        let queue = self.queue_for_cq(verbs_direction)?;
        let completion_error = if wc.status != ibv_wc_status::IBV_WC_SUCCESS {
            Some(Error::with_subcode(
                wc_error_kind(wc.status),
                wc.status as i32,
            ))
        } else {
            None
        };
        let bytes_transferred = match wc.opcode {
            ibv_wc_opcode::IBV_WC_RECV => Some(wc.byte_len as usize),
            ibv_wc_opcode::IBV_WC_SEND => {
                if completion_error.is_some() {
                    Some(0)
                } else {
                    None
                }
            }
            _ => return Err(Error::new(ErrorKind::InternalError)),
        };
        queue.handle_completion(wc.wr_id as usize, completion_error, bytes_transferred)
    }

    /// Block until one completion arrives on the given completion queue.
    /// The completion-channel fd is multiplexed with the session's
    /// cancellation pipe, so teardown can always interrupt the wait.
    fn poll_cq_blocking(&self, verbs_direction: Direction) -> Result<ibv_wc> {
        loop {
            if let Some(wc) = self.cm.poll_cq_once(verbs_direction)? {
                return Ok(wc);
            }
            self.cm.request_cq_notification(verbs_direction)?;
            if let Some(wc) = self.cm.poll_cq_once(verbs_direction)? {
                return Ok(wc);
            }
            let fd = self.cm.comp_channel_fd(verbs_direction);
            if !self.poller.poll_on_fd(fd, -1)? {
                return Err(Error::new(ErrorKind::OperationCancelled));
            }
            self.cm.take_cq_event(verbs_direction)?;
        }
    }
}

impl QueueEndpoint for SessionCore {
    fn submit(&self, direction: Direction, desc: PostDescriptor) -> Result<()> {
        self.cm.post(direction, desc)
    }

    fn register_memory(&self, addr: *mut u8, len: usize) -> Result<MemoryRegion> {
        // SAFETY: the identifier is alive for the core's lifetime and the
        // owning queue keeps the memory alive past its work requests.
        unsafe { MemoryRegion::register(self.cm.raw(), addr, len) }
    }

    /// Non-blocking receive-completion spin driven on the caller's thread.
    /// Dispatches exactly one completion; surfaces the transfer queue's
    /// sticky status so a disconnect ends the spin.
    fn poll_for_receive(&self, timeout_ms: i32) -> Result<()> {
        let start = Instant::now();
        loop {
            if let Some(wc) = self.cm.poll_cq_once(Direction::Receive)? {
                return self.dispatch_completion(&wc, Direction::Receive);
            }
            self.check_transfer_status()?;
            if timeout_ms >= 0 && start.elapsed() > Duration::from_millis(timeout_ms as u64) {
                return Err(Error::new(ErrorKind::Timeout));
            }
            std::hint::spin_loop();
        }
    }
}

/// Guard for the one-blocking-buffer-wait-per-session rule: sets the
/// in-progress flag, then suspends the calling thread's access stack so a
/// concurrent close can proceed. Both are undone on drop.
struct BufferWaitGuard<'a> {
    core: &'a SessionCore,
    _suspend: SuspendGuard<'a>,
}

impl<'a> BufferWaitGuard<'a> {
    fn new(core: &'a SessionCore, access: &'a AccessManager) -> Result<Self> {
        if core.buffer_wait_in_progress.swap(true, Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::BufferWaitInProgress));
        }
        Ok(BufferWaitGuard {
            core,
            _suspend: SuspendGuard::new(access),
        })
    }
}

impl Drop for BufferWaitGuard<'_> {
    fn drop(&mut self) {
        self.core.buffer_wait_in_progress.store(false, Ordering::SeqCst);
    }
}

pub(crate) struct ConnectedSession {
    access: AccessManager,
    core: Arc<SessionCore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectedSession {
    /// An unconnected session bound to `local`; the connector drives it
    /// through `connect_impl`.
    pub fn new_unconnected(local: &Address) -> Result<Self> {
        let cm = CmId::create_bound(local)?;
        Ok(ConnectedSession {
            access: AccessManager::new(),
            core: Arc::new(SessionCore::new(cm)?),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Build a session around an incoming connection request: create the
    /// queue pair and credit queue, validate the connector's handshake blob
    /// (rejecting with the blob echoed back on mismatch), accept, and wait
    /// for establishment.
    pub fn accept_incoming(
        direction: Direction,
        incoming: NonNull<rdma_cm_id>,
        connection_data_in: &[u8],
        connection_data_out: Vec<u8>,
    ) -> Result<Self> {
        let cm = CmId::from_accepted(incoming);
        let session = ConnectedSession {
            access: AccessManager::new(),
            core: Arc::new(SessionCore::new(cm)?),
            workers: Mutex::new(Vec::new()),
        };
        session.core.state.lock().unwrap().connection_data = connection_data_out;

        let result = (|| -> Result<()> {
            session.pre_connect(direction)?;
            if let Err(err) = wire::validate_connection_data(connection_data_in, direction) {
                let _ = session.core.cm.reject(connection_data_in);
                return Err(err);
            }
            let outbound = session.core.state.lock().unwrap().connection_data.clone();
            session.core.cm.accept(&outbound)?;
            let event = events::manager()
                .wait_for_event(session.core.cm.raw(), ESTABLISH_TIMEOUT_MS)?;
            if event.event_type != rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED {
                return Err(Error::new(ErrorKind::UnableToConnect));
            }
            session.post_connect()
        })();

        match result {
            Ok(()) => Ok(session),
            Err(err) => {
                // Worker threads may already be running; tear down fully.
                session.destroy();
                Err(err)
            }
        }
    }

    pub fn access_manager(&self) -> &AccessManager {
        &self.access
    }

    /// The raw CM identifier, for event-wait cancellation by the connector.
    pub fn cm_raw(&self) -> *mut rdma_cm_id {
        self.core.cm.raw()
    }

    /// Resolve, route, connect, and validate the peer's handshake blob.
    /// The caller (the connector) enforces single-use semantics.
    pub fn connect_impl(
        &self,
        direction: Direction,
        remote: Address,
        timeout_ms: i32,
    ) -> Result<()> {
        let core = &self.core;

        let result = (|| -> Result<()> {
            let _suspend = SuspendGuard::new(&self.access);

            let local = core.state.lock().unwrap().local_address;
            let src = if local.is_unspecified() { None } else { Some(&local) };
            core.cm.resolve_addr(src, &remote, timeout_ms)?;
            // The resolve timeout is enforced by the CM timer, which
            // delivers an error event rather than blocking forever.
            let event = events::manager().wait_for_event(core.cm.raw(), -1)?;
            if event.event_type != rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED {
                return Err(Error::with_subcode(
                    ErrorKind::UnableToConnect,
                    event.event_type as i32,
                ));
            }

            core.cm.resolve_route(timeout_ms)?;
            let event = events::manager().wait_for_event(core.cm.raw(), -1)?;
            if event.event_type != rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED {
                return Err(Error::with_subcode(
                    ErrorKind::UnableToConnect,
                    event.event_type as i32,
                ));
            }

            // The device is only known once the route is resolved (the
            // connector may have been bound to the wildcard address), so the
            // queue pair and credit queue are created here. The credit
            // receives are still pre-posted before the connection is
            // offered, so no credit message can be lost.
            self.pre_connect(direction)?;

            let outbound = core.state.lock().unwrap().connection_data.clone();
            core.cm.connect(&outbound)?;
            let event = events::manager().wait_for_event(core.cm.raw(), timeout_ms)?;
            if event.event_type != rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED {
                let kind = if event.event_type == rdma_cm_event_type::RDMA_CM_EVENT_REJECTED {
                    ErrorKind::ConnectionRefused
                } else {
                    ErrorKind::UnableToConnect
                };
                return Err(Error::with_subcode(kind, event.event_type as i32));
            }
            wire::validate_connection_data(&event.private_data, direction)?;
            Ok(())
        })();

        match result {
            Ok(()) => self.post_connect(),
            Err(err) => {
                self.cancel_session();
                core.cm.destroy_qp();
                Err(err)
            }
        }
    }

    /// Create the queue pair and the auxiliary credit queue. The data-send
    /// side pre-posts every credit message and starts the ack handler that
    /// decodes arriving credits.
    fn pre_connect(&self, direction: Direction) -> Result<()> {
        let core = &self.core;
        core.direction.store(direction as u32, Ordering::SeqCst);
        {
            let mut state = core.state.lock().unwrap();
            if state.connection_data.is_empty() {
                state.connection_data = wire::encode_connection_data(direction);
            }
        }
        core.cm.create_qp()?;

        let endpoint: Arc<dyn QueueEndpoint> = core.clone();
        let aux = BufferQueue::new_multiple(
            &endpoint,
            direction.opposite(),
            wire::NUM_CREDIT_BUFFERS,
            wire::CREDIT_MESSAGE_SIZE,
            false,
        )?;
        *core.credit_queue.lock().unwrap() = Some(aux.clone());

        if direction == Direction::Send {
            for _ in 0..aux.buffer_count() {
                let index = aux.acquire_idle(0)?;
                aux.queue(index, IgnoreCredits::Yes)?;
            }
            self.spawn_worker("AckHandler", {
                let core = core.clone();
                move || credit_decoder_loop(core)
            })?;
        }
        Ok(())
    }

    /// Cache addresses, mark connected, and start the connection-change
    /// watcher plus the auxiliary-direction completion dispatcher. The
    /// ack side always starts at connect time because the peer may
    /// configure (and start announcing credits) before we do.
    fn post_connect(&self) -> Result<()> {
        let core = &self.core;
        {
            let mut state = core.state.lock().unwrap();
            state.local_address = core.cm.local_address();
            state.remote_address = core.cm.peer_address();
        }
        core.connected.store(true, Ordering::SeqCst);

        self.spawn_worker("ConnHandler", {
            let core = core.clone();
            move || connection_watcher_loop(core)
        })?;

        let aux_direction = core.data_direction().opposite();
        let name = if aux_direction == Direction::Receive {
            "AckRecvHandler"
        } else {
            "AckSendHandler"
        };
        self.spawn_worker(name, {
            let core = core.clone();
            move || completion_loop(core, aux_direction)
        })?;
        Ok(())
    }

    /// Start the data-direction dispatcher and, on the receive side with an
    /// internal pool, post every buffer and announce the capacity in
    /// credit-message-sized chunks.
    fn post_configure(&self) -> Result<()> {
        let core = &self.core;
        let direction = core.data_direction();
        let use_polling = core.state.lock().unwrap().use_polling;

        if direction == Direction::Receive {
            if !use_polling {
                self.spawn_worker("RecvHandler", {
                    let core = core.clone();
                    move || completion_loop(core, Direction::Receive)
                })?;
            }
        } else {
            self.spawn_worker("SendHandler", {
                let core = core.clone();
                move || completion_loop(core, Direction::Send)
            })?;
        }

        let auto_queue_rx = core.state.lock().unwrap().auto_queue_rx;
        if direction == Direction::Receive && auto_queue_rx {
            let queue = core.transfer_queue()?;
            let count = queue.buffer_count();
            let mut lengths = Vec::with_capacity(count);
            for _ in 0..count {
                let index = queue.acquire_idle(0)?;
                lengths.push(queue.capacity_of(index)? as u64);
                self.queue_recv_buffer(index, false)?;
            }
            for chunk in lengths.chunks(wire::MAX_CREDITS_PER_MESSAGE) {
                core.send_credit_update(chunk)?;
            }
        }
        Ok(())
    }

    fn spawn_worker<F>(&self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(body)
            .map_err(|_| Error::new(ErrorKind::OutOfMemory))?;
        self.workers.lock().unwrap().push(handle);
        Ok(())
    }

    /// Hand a user-held buffer back to the provider. Receive buffers also
    /// announce their capacity to the peer as a fresh credit.
    fn requeue(&self, index: usize) -> Result<()> {
        let core = &self.core;
        if !core.is_connected() {
            return Err(Error::new(ErrorKind::Disconnected));
        }
        if core.data_direction() == Direction::Receive {
            self.queue_recv_buffer(index, true)
        } else {
            core.transfer_queue()?.queue(index, IgnoreCredits::No)
        }
    }

    fn queue_recv_buffer(&self, index: usize, send_credit_update: bool) -> Result<()> {
        debug_assert_eq!(self.core.data_direction(), Direction::Receive);
        let queue = self.core.transfer_queue()?;
        queue.queue(index, IgnoreCredits::No)?;
        if send_credit_update {
            let length = queue.capacity_of(index)? as u64;
            self.core.send_credit_update(&[length])?;
        }
        Ok(())
    }

    fn cancel_session(&self) {
        if let Ok(queue) = self.core.credit_queue() {
            queue.abort(Error::new(ErrorKind::OperationCancelled));
        }
        if let Ok(queue) = self.core.transfer_queue() {
            queue.abort(Error::new(ErrorKind::OperationCancelled));
        }
    }

    /// Full teardown: disconnect, deliver cancellation to every blocked
    /// worker (poller pipe, event-queue abort, queue abort), join the
    /// workers, then let the identifier drop destroy QP and event queue.
    fn destroy(&self) {
        let core = &self.core;
        if core.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        core.cm.disconnect();
        core.poller.cancel();
        events::manager().abort_waits(core.cm.raw());
        core.handle_disconnect();
        self.cancel_session();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for ConnectedSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Session for ConnectedSession {
    fn access(&self) -> &AccessManager {
        &self.access
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    fn cancel(&self) {
        self.cancel_session();
    }

    fn get_property(&self, property_id: u32) -> Result<PropertyValue> {
        match property_id {
            PROP_QUEUED_BUFFERS => {
                Ok(PropertyValue::from_u64(self.core.transfer_queue()?.queued_buffer_count()))
            }
            PROP_USER_BUFFERS => {
                Ok(PropertyValue::from_u64(self.core.transfer_queue()?.user_buffer_count()))
            }
            PROP_CONNECTED => Ok(PropertyValue::from_bool(self.core.is_connected())),
            PROP_USE_RX_POLLING => {
                Ok(PropertyValue::from_bool(self.core.state.lock().unwrap().use_polling))
            }
            _ => Err(Error::new(ErrorKind::InvalidProperty)),
        }
    }

    fn set_property(&self, property_id: u32, value: &[u8]) -> Result<()> {
        match property_id {
            PROP_CONNECTION_DATA => {
                self.core.state.lock().unwrap().connection_data = value.to_vec();
                Ok(())
            }
            PROP_USE_RX_POLLING => {
                let [flag] = value else {
                    return Err(Error::new(ErrorKind::InvalidArgument));
                };
                let use_polling = *flag != 0;
                // Only before configure, on a connected receive session.
                let configured = self.core.transfer.lock().unwrap().queue.is_some();
                if !self.core.is_connected() || configured {
                    return Err(Error::new(ErrorKind::AlreadyConfigured));
                }
                if use_polling && self.core.data_direction() != Direction::Receive {
                    return Err(Error::new(ErrorKind::OperationNotSupported));
                }
                self.core.state.lock().unwrap().use_polling = use_polling;
                Ok(())
            }
            PROP_QUEUED_BUFFERS | PROP_USER_BUFFERS | PROP_CONNECTED => {
                Err(Error::new(ErrorKind::ReadOnlyProperty))
            }
            _ => Err(Error::new(ErrorKind::InvalidProperty)),
        }
    }

    fn local_address(&self) -> Result<Address> {
        Ok(self.core.state.lock().unwrap().local_address)
    }

    fn remote_address(&self) -> Result<Address> {
        Ok(self.core.state.lock().unwrap().remote_address)
    }

    fn configure_buffers(&self, max_transaction_size: usize, max_concurrent: usize) -> Result<()> {
        {
            let mut slot = self.core.transfer.lock().unwrap();
            if slot.queue.is_some() {
                return Err(Error::new(ErrorKind::AlreadyConfigured));
            }
            if !self.core.is_connected() {
                return Err(Error::new(ErrorKind::NotConnected));
            }
            let use_polling = {
                let mut state = self.core.state.lock().unwrap();
                state.ownership = BufferOwnership::Internal;
                state.buffer_type = BufferType::Multiple;
                state.auto_queue_rx = true;
                state.use_polling
            };
            let endpoint: Arc<dyn QueueEndpoint> = self.core.clone();
            let queue = BufferQueue::new_multiple(
                &endpoint,
                self.core.data_direction(),
                max_concurrent,
                max_transaction_size,
                use_polling,
            )?;
            while let Some(credit) = slot.pending_credits.pop_front() {
                queue.add_credit(credit)?;
            }
            slot.queue = Some(queue);
        }
        self.post_configure()
    }

    fn configure_external_buffer(
        &self,
        buffer: *mut u8,
        size: usize,
        max_concurrent: usize,
    ) -> Result<()> {
        {
            let mut slot = self.core.transfer.lock().unwrap();
            if slot.queue.is_some() {
                return Err(Error::new(ErrorKind::AlreadyConfigured));
            }
            let use_polling = {
                let mut state = self.core.state.lock().unwrap();
                if state.use_polling {
                    return Err(Error::new(ErrorKind::OperationNotSupported));
                }
                state.ownership = BufferOwnership::External;
                state.buffer_type = BufferType::Single;
                state.use_polling
            };
            let endpoint: Arc<dyn QueueEndpoint> = self.core.clone();
            let queue = BufferQueue::new_single(
                &endpoint,
                self.core.data_direction(),
                buffer,
                size,
                max_concurrent,
                use_polling,
            )?;
            while let Some(credit) = slot.pending_credits.pop_front() {
                queue.add_credit(credit)?;
            }
            slot.queue = Some(queue);
        }
        self.post_configure()
    }

    fn acquire_send_region(&self, timeout_ms: i32) -> Result<RegionView> {
        {
            let state = self.core.state.lock().unwrap();
            if self.core.data_direction() == Direction::Receive && state.auto_queue_rx {
                return Err(Error::new(ErrorKind::InvalidOperation));
            }
            if state.ownership == BufferOwnership::External {
                return Err(Error::new(ErrorKind::InvalidOperation));
            }
        }
        let queue = self.core.transfer_queue()?;
        let _wait = BufferWaitGuard::new(&self.core, &self.access)?;
        let index = queue.acquire_idle(timeout_ms)?;
        let view = queue.buffer_view(index)?;
        // A fresh send region starts out declared full.
        Ok(RegionView {
            used: view.capacity,
            ..view
        })
    }

    fn acquire_received_region(&self, timeout_ms: i32) -> Result<RegionView> {
        let queue = self.core.transfer_queue()?;
        let _wait = BufferWaitGuard::new(&self.core, &self.access)?;
        let index = queue.acquire_completed(timeout_ms)?;
        queue.buffer_view(index)
    }

    fn set_region_used(&self, index: usize, used: usize) -> Result<()> {
        self.core.transfer_queue()?.set_used(index, used)
    }

    fn queue_region(&self, index: usize, callback: Option<CallbackData>) -> Result<()> {
        if self.core.state.lock().unwrap().ownership == BufferOwnership::External {
            return Err(Error::new(ErrorKind::InvalidOperation));
        }
        self.core.transfer_queue()?.set_callback(index, callback)?;
        self.requeue(index)
    }

    fn queue_external_region(
        &self,
        ptr: *mut u8,
        size: usize,
        callback: Option<CallbackData>,
        timeout_ms: i32,
    ) -> Result<()> {
        let queue = self.core.transfer_queue()?;
        // Held to the end: queueing may block on the credit queue, and the
        // access gate must stay suspended across any such wait.
        let _wait = BufferWaitGuard::new(&self.core, &self.access)?;
        let index = queue.acquire_idle(timeout_ms)?;
        {
            let state = self.core.state.lock().unwrap();
            if state.buffer_type != BufferType::Single
                || state.ownership != BufferOwnership::External
            {
                return Err(Error::new(ErrorKind::InvalidOperation));
            }
        }
        queue.set_external_region(index, ptr, size)?;
        queue.set_callback(index, callback)?;
        self.requeue(index)
    }

    fn release_received_region(&self, index: usize) -> Result<()> {
        match self.requeue(index) {
            // A release racing a disconnect reverts to Idle silently so a
            // wait-process-release loop ends cleanly; the next blocking
            // wait surfaces the error instead.
            Err(err) if err.kind() == ErrorKind::Disconnected => {
                self.core.transfer_queue()?.release(index)
            }
            other => other,
        }
    }

    fn release_region_to_idle(&self, index: usize) -> Result<()> {
        self.core.transfer_queue()?.release(index)
    }

    fn deferred_destruction_ready(&self) -> bool {
        match self.core.transfer_queue() {
            Ok(queue) => !queue.has_user_buffers(),
            Err(_) => true,
        }
    }
}

fn completion_loop(core: Arc<SessionCore>, verbs_direction: Direction) {
    if core.cm.set_cq_channels_nonblocking().is_err() {
        return;
    }
    while core.is_connected() {
        let wc = match core.poll_cq_blocking(verbs_direction) {
            Ok(wc) => wc,
            Err(_) => break,
        };
        if core.dispatch_completion(&wc, verbs_direction).is_err() {
            // Queue-level failures are latched in the sticky status; the
            // dispatcher itself just winds down.
            break;
        }
    }
}

fn connection_watcher_loop(core: Arc<SessionCore>) {
    let queue = match events::manager().queue_for(core.cm.raw()) {
        Ok(queue) => queue,
        Err(_) => return,
    };
    loop {
        match queue.wait_cancellable(-1) {
            Ok(Some(event)) => {
                if event.event_type == rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED {
                    core.handle_disconnect();
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
}

/// Data-send side: decode every completed credit message into transfer
/// credits and re-post it. Exits silently once the session winds down.
fn credit_decoder_loop(core: Arc<SessionCore>) {
    let queue = match core.credit_queue() {
        Ok(queue) => queue,
        Err(_) => return,
    };
    while !core.is_closing() {
        let index = match queue.acquire_completed(-1) {
            Ok(index) => index,
            Err(_) => break,
        };
        let view = match queue.buffer_view(index) {
            Ok(view) => view,
            Err(_) => break,
        };
        // SAFETY: the buffer is in the User set until re-queued below.
        let payload = unsafe { std::slice::from_raw_parts(view.ptr, view.used) };
        for credit in wire::decode_credits(payload) {
            if core.add_credit(credit).is_err() {
                return;
            }
        }
        if queue.queue(index, IgnoreCredits::Yes).is_err() {
            break;
        }
    }
}
