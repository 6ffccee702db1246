//! Per-direction buffer state machine over a fixed pool of buffers.
//!
//! Every buffer lives in exactly one of five states: Idle, User (held by the
//! application), Queued (posted to the provider), WaitingCredit (send parked
//! until the peer announces capacity), or Completed (received data awaiting
//! the application). The pool is an arena owned by the queue; all external
//! references are by index.
//!
//! The queue lock covers bookkeeping only. Provider submissions are
//! collected under the lock and posted after it is released, and completion
//! callbacks always fire outside the lock so they may re-enter the API.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crate::buffer::{CallbackData, RegionView};
use crate::error::{Error, ErrorKind, Result};
use crate::fifo::CircularFifo;
use crate::mem::{AlignedBuf, MemoryRegion, MrToken};
use crate::session::Direction;

/// Whether a send-direction queue consumes an application-level credit.
/// The auxiliary credit queue itself always ignores credits; its flow
/// control is bounded by its fixed pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IgnoreCredits {
    Yes,
    No,
}

/// Everything the provider needs to post one work request.
pub(crate) struct PostDescriptor {
    pub wr_id: u64,
    pub addr: *mut u8,
    pub len: usize,
    pub mr: MrToken,
}

// Raw pointers refer to arena memory owned by the queue; the descriptor is
// consumed synchronously by the posting call.
unsafe impl Send for PostDescriptor {}

/// The seam between the queue and its connection: work-request submission,
/// memory registration, and polled receive dispatch.
pub(crate) trait QueueEndpoint: Send + Sync {
    fn submit(&self, direction: Direction, desc: PostDescriptor) -> Result<()>;
    fn register_memory(&self, addr: *mut u8, len: usize) -> Result<MemoryRegion>;
    fn poll_for_receive(&self, timeout_ms: i32) -> Result<()>;
}

struct Buffer {
    ptr: *mut u8,
    capacity: usize,
    used: usize,
    mr_token: MrToken,
    callback: Option<CallbackData>,
    user_linked: bool,
    // Keep-alive for internally allocated pools; dropped with the arena.
    _alloc: Option<AlignedBuf>,
    _region: Option<MemoryRegion>,
}

struct Inner {
    buffers: Vec<Buffer>,
    idle: CircularFifo<usize>,
    queued: CircularFifo<usize>,
    completed: CircularFifo<usize>,
    waiting_credits: CircularFifo<usize>,
    user_count: usize,
    credits: VecDeque<u64>,
    status: Option<Error>,
    aborted: bool,
    // Registration shared by all overlapped buffers of a single-buffer pool.
    _shared_region: Option<MemoryRegion>,
}

// Buffer pointers are arena-owned; the Mutex provides the synchronization.
unsafe impl Send for Inner {}

pub(crate) struct BufferQueue {
    direction: Direction,
    use_polling: bool,
    put_back_to_idle: bool,
    endpoint: Weak<dyn QueueEndpoint>,
    inner: Mutex<Inner>,
    idle_available: Condvar,
    completed_available: Condvar,
}

impl BufferQueue {
    /// Pool of `num_buffers` distinct internally-allocated buffers of
    /// `buffer_size` bytes, each registered individually.
    pub fn new_multiple(
        endpoint: &Arc<dyn QueueEndpoint>,
        direction: Direction,
        num_buffers: usize,
        buffer_size: usize,
        use_polling: bool,
    ) -> Result<Arc<Self>> {
        if use_polling && direction == Direction::Send {
            return Err(Error::new(ErrorKind::InvalidOperation));
        }
        if num_buffers == 0 {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }

        let mut inner = Inner::with_capacity(num_buffers);
        for index in 0..num_buffers {
            let alloc = AlignedBuf::new(buffer_size)?;
            let region = endpoint.register_memory(alloc.as_ptr(), buffer_size)?;
            inner.buffers.push(Buffer {
                ptr: alloc.as_ptr(),
                capacity: buffer_size,
                used: 0,
                mr_token: region.token(),
                callback: None,
                user_linked: false,
                _alloc: Some(alloc),
                _region: Some(region),
            });
            inner.idle.push(index);
        }

        Ok(Arc::new(BufferQueue {
            direction,
            use_polling,
            put_back_to_idle: direction == Direction::Send,
            endpoint: Arc::downgrade(endpoint),
            inner: Mutex::new(inner),
            idle_available: Condvar::new(),
            completed_available: Condvar::new(),
        }))
    }

    /// One externally-owned registered buffer leased as `num_overlapped`
    /// sub-ranges. Completed buffers always return straight to Idle; the
    /// caller learns about data through the completion callback.
    pub fn new_single(
        endpoint: &Arc<dyn QueueEndpoint>,
        direction: Direction,
        buffer: *mut u8,
        buffer_size: usize,
        num_overlapped: usize,
        use_polling: bool,
    ) -> Result<Arc<Self>> {
        if use_polling {
            return Err(Error::new(ErrorKind::InvalidOperation));
        }
        if num_overlapped == 0 || buffer.is_null() {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }

        let region = endpoint.register_memory(buffer, buffer_size)?;
        let mut inner = Inner::with_capacity(num_overlapped);
        for index in 0..num_overlapped {
            inner.buffers.push(Buffer {
                ptr: buffer,
                capacity: 0,
                used: 0,
                mr_token: region.token(),
                callback: None,
                user_linked: false,
                _alloc: None,
                _region: None,
            });
            inner.idle.push(index);
        }
        inner._shared_region = Some(region);

        Ok(Arc::new(BufferQueue {
            direction,
            use_polling: false,
            put_back_to_idle: true,
            endpoint: Arc::downgrade(endpoint),
            inner: Mutex::new(inner),
            idle_available: Condvar::new(),
            completed_available: Condvar::new(),
        }))
    }

    pub fn buffer_count(&self) -> usize {
        self.inner.lock().unwrap().buffers.len()
    }

    pub fn queue_status(&self) -> Option<Error> {
        self.inner.lock().unwrap().status
    }

    pub fn has_user_buffers(&self) -> bool {
        self.inner.lock().unwrap().user_count > 0
    }

    /// |Queued| + |WaitingCredit|, the QueuedBuffers property.
    pub fn queued_buffer_count(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        (inner.queued.len() + inner.waiting_credits.len()) as u64
    }

    /// |User|, the UserBuffers property.
    pub fn user_buffer_count(&self) -> u64 {
        self.inner.lock().unwrap().user_count as u64
    }

    /// Snapshot of a buffer's window for handing to the application or for
    /// decoding an auxiliary message. The buffer should be in the User set.
    pub fn buffer_view(&self, index: usize) -> Result<RegionView> {
        let inner = self.inner.lock().unwrap();
        let buffer = inner.get(index)?;
        Ok(RegionView {
            index,
            ptr: buffer.ptr,
            capacity: buffer.capacity,
            used: buffer.used,
        })
    }

    pub fn capacity_of(&self, index: usize) -> Result<usize> {
        Ok(self.inner.lock().unwrap().get(index)?.capacity)
    }

    /// Set the byte count a user-held buffer will submit.
    pub fn set_used(&self, index: usize, used: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let buffer = inner.get_mut(index)?;
        if used > buffer.capacity {
            return Err(Error::new(ErrorKind::InvalidSize));
        }
        buffer.used = used;
        Ok(())
    }

    pub fn set_callback(&self, index: usize, callback: Option<CallbackData>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.get_mut(index)?.callback = callback;
        Ok(())
    }

    /// Point an overlapped lease at a sub-range of the shared external
    /// buffer. The submitted size defaults to the full lease.
    pub fn set_external_region(&self, index: usize, ptr: *mut u8, size: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let buffer = inner.get_mut(index)?;
        buffer.ptr = ptr;
        buffer.capacity = size;
        buffer.used = size;
        Ok(())
    }

    /// Take a buffer from Idle into the User set, blocking up to
    /// `timeout_ms` (0 polls, -1 waits forever). Any sticky status fails the
    /// acquire even if idle buffers remain.
    pub fn acquire_idle(&self, timeout_ms: i32) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let deadline = deadline_for(timeout_ms);
        while inner.idle.is_empty() && inner.status.is_none() {
            let (guard, timed_out) = wait_step(&self.idle_available, inner, timeout_ms, deadline);
            inner = guard;
            if timed_out {
                break;
            }
        }
        if let Some(status) = inner.status {
            return Err(status);
        }
        let index = match inner.idle.pop() {
            Some(index) => index,
            None => return Err(Error::new(ErrorKind::Timeout)),
        };
        inner.link_user(index);
        Ok(index)
    }

    /// Take a completed buffer into the User set. Completed buffers drain
    /// before any sticky status is surfaced; NoBuffersQueued fires when
    /// nothing is in flight at call time.
    pub fn acquire_completed(&self, timeout_ms: i32) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if self.put_back_to_idle {
            return Err(Error::new(ErrorKind::InvalidOperation));
        }
        if inner.completed.is_empty() && inner.status.is_none() {
            if inner.queued.is_empty() && inner.waiting_credits.is_empty() {
                return Err(Error::new(ErrorKind::NoBuffersQueued));
            }
            if self.use_polling {
                // Drive completion dispatch on the caller thread without
                // holding the queue lock; the dispatch path re-enters
                // handle_completion which takes it.
                drop(inner);
                let endpoint = self.endpoint()?;
                endpoint.poll_for_receive(timeout_ms)?;
                inner = self.inner.lock().unwrap();
            } else {
                let deadline = deadline_for(timeout_ms);
                while inner.completed.is_empty() && inner.status.is_none() {
                    let (guard, timed_out) =
                        wait_step(&self.completed_available, inner, timeout_ms, deadline);
                    inner = guard;
                    if timed_out {
                        break;
                    }
                }
            }
        }
        if inner.completed.is_empty() {
            if let Some(status) = inner.status {
                return Err(status);
            }
            return Err(Error::new(ErrorKind::Timeout));
        }
        let index = inner.completed.pop().unwrap();
        inner.link_user(index);
        Ok(index)
    }

    /// Move a user-held buffer toward the provider. On the send path a
    /// credit is consumed (or the buffer parks in WaitingCredit); an
    /// oversize submission latches SendTooLargeForRecvBuffer and fails.
    pub fn queue(&self, index: usize, ignore_credits: IgnoreCredits) -> Result<()> {
        let submit = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(status) = inner.status {
                return Err(status);
            }
            if !inner.get(index)?.user_linked {
                return Err(Error::new(ErrorKind::InvalidOperation));
            }

            let submit;
            if self.direction == Direction::Send && ignore_credits == IgnoreCredits::No {
                if let Some(&credit) = inner.credits.front() {
                    if inner.buffers[index].used as u64 > credit {
                        let err = Error::new(ErrorKind::SendTooLargeForRecvBuffer);
                        inner.status.get_or_insert(err);
                        return Err(err);
                    }
                    inner.queued.push(index);
                    inner.credits.pop_front();
                    submit = Some(inner.descriptor(index, self.direction));
                } else {
                    inner.waiting_credits.push(index);
                    submit = None;
                }
            } else {
                inner.queued.push(index);
                submit = Some(inner.descriptor(index, self.direction));
            }
            inner.unlink_user(index);
            submit
        };

        if let Some(desc) = submit {
            self.endpoint()?.submit(self.direction, desc)?;
        }
        Ok(())
    }

    /// Record one credit from the peer and drain the oldest parked buffer if
    /// any. Errors (oversize parked send, submission failure) latch into the
    /// sticky status and propagate.
    pub fn add_credit(&self, buffer_size: u64) -> Result<()> {
        let submit = {
            let mut inner = self.inner.lock().unwrap();
            inner.credits.push_back(buffer_size);
            if let Some(&index) = inner.waiting_credits.front() {
                let credit = *inner.credits.front().unwrap();
                if inner.buffers[index].used as u64 > credit {
                    let err = Error::new(ErrorKind::SendTooLargeForRecvBuffer);
                    inner.status.get_or_insert(err);
                    return Err(err);
                }
                inner.waiting_credits.pop();
                inner.queued.push(index);
                inner.credits.pop_front();
                Some(inner.descriptor(index, self.direction))
            } else {
                None
            }
        };

        if let Some(desc) = submit {
            self.endpoint()?.submit(self.direction, desc).map_err(|err| {
                let mut inner = self.inner.lock().unwrap();
                inner.status.get_or_insert(err);
                err
            })?;
        }
        Ok(())
    }

    /// Return a user-held buffer to Idle without queueing it.
    pub fn release(&self, index: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.get(index)?.user_linked {
            return Err(Error::new(ErrorKind::InvalidOperation));
        }
        inner.unlink_user(index);
        inner.idle.push(index);
        self.idle_available.notify_all();
        Ok(())
    }

    /// Couple a provider work completion back to its buffer. Completions
    /// arrive in FIFO submission order; `bytes_transferred` of None means
    /// "the submitted size" (successful sends). Swallowed after abort.
    pub fn handle_completion(
        &self,
        index: usize,
        completion_error: Option<Error>,
        bytes_transferred: Option<usize>,
    ) -> Result<()> {
        let callback;
        let completed_bytes;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.aborted {
                return Ok(());
            }
            if inner.queued.front() != Some(&index) {
                return Err(Error::new(ErrorKind::InternalError));
            }
            inner.queued.pop();

            let buffer = inner.get_mut(index)?;
            let bytes = bytes_transferred.unwrap_or(buffer.used);
            buffer.used = bytes;
            callback = buffer.callback.take();
            completed_bytes = bytes;

            if self.put_back_to_idle {
                inner.idle.push(index);
                self.idle_available.notify_all();
            } else {
                inner.completed.push(index);
                self.completed_available.notify_all();
            }
            if let Some(err) = completion_error {
                inner.status.get_or_insert(err);
            }
        }
        if let Some(callback) = callback {
            callback.call(completion_error.map_or(Ok(()), Err), completed_bytes);
        }
        Ok(())
    }

    /// Latch `error` (first error wins), drain Queued and WaitingCredit back
    /// to Idle firing their callbacks with the abort error and zero bytes,
    /// and wake every waiter. Completed buffers are left for graceful drain.
    /// Idempotent.
    pub fn abort(&self, error: Error) {
        let mut callbacks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.aborted {
                return;
            }
            inner.aborted = true;
            inner.status.get_or_insert(error);
            while let Some(index) = inner.queued.pop() {
                if let Some(callback) = inner.buffers[index].callback.take() {
                    callbacks.push(callback);
                }
                inner.idle.push(index);
            }
            while let Some(index) = inner.waiting_credits.pop() {
                if let Some(callback) = inner.buffers[index].callback.take() {
                    callbacks.push(callback);
                }
                inner.idle.push(index);
            }
            self.completed_available.notify_all();
            self.idle_available.notify_all();
        }
        for callback in callbacks {
            callback.call(Err(error), 0);
        }
    }

    fn endpoint(&self) -> Result<Arc<dyn QueueEndpoint>> {
        self.endpoint
            .upgrade()
            .ok_or_else(|| Error::new(ErrorKind::Disconnected))
    }
}

impl Inner {
    fn with_capacity(num_buffers: usize) -> Self {
        Inner {
            buffers: Vec::with_capacity(num_buffers),
            idle: CircularFifo::with_capacity(num_buffers),
            queued: CircularFifo::with_capacity(num_buffers),
            completed: CircularFifo::with_capacity(num_buffers),
            waiting_credits: CircularFifo::with_capacity(num_buffers),
            user_count: 0,
            credits: VecDeque::new(),
            status: None,
            aborted: false,
            _shared_region: None,
        }
    }

    #[track_caller]
    fn get(&self, index: usize) -> Result<&Buffer> {
        self.buffers
            .get(index)
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument))
    }

    #[track_caller]
    fn get_mut(&mut self, index: usize) -> Result<&mut Buffer> {
        self.buffers
            .get_mut(index)
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument))
    }

    fn link_user(&mut self, index: usize) {
        debug_assert!(!self.buffers[index].user_linked);
        self.buffers[index].user_linked = true;
        self.user_count += 1;
    }

    fn unlink_user(&mut self, index: usize) {
        debug_assert!(self.buffers[index].user_linked);
        self.buffers[index].user_linked = false;
        self.user_count -= 1;
    }

    fn descriptor(&self, index: usize, direction: Direction) -> PostDescriptor {
        let buffer = &self.buffers[index];
        PostDescriptor {
            wr_id: index as u64,
            addr: buffer.ptr,
            len: if direction == Direction::Send {
                buffer.used
            } else {
                buffer.capacity
            },
            mr: buffer.mr_token,
        }
    }
}

fn deadline_for(timeout_ms: i32) -> Option<Instant> {
    if timeout_ms < 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
    }
}

/// One bounded condition wait. Returns the reacquired guard and whether the
/// deadline has passed. Infinite waits never report a timeout, so spurious
/// wakeups just loop.
fn wait_step<'a>(
    cond: &Condvar,
    guard: MutexGuard<'a, Inner>,
    timeout_ms: i32,
    deadline: Option<Instant>,
) -> (MutexGuard<'a, Inner>, bool) {
    if timeout_ms < 0 {
        (cond.wait(guard).unwrap(), false)
    } else {
        let deadline = deadline.unwrap();
        let now = Instant::now();
        if now >= deadline {
            return (guard, true);
        }
        let (guard, _) = cond.wait_timeout(guard, deadline - now).unwrap();
        (guard, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockEndpoint {
        posted: Mutex<Vec<(Direction, u64, usize)>>,
        fail_submit: AtomicBool,
    }

    impl MockEndpoint {
        fn new() -> Arc<Self> {
            Arc::new(MockEndpoint {
                posted: Mutex::new(Vec::new()),
                fail_submit: AtomicBool::new(false),
            })
        }

        fn posted(&self) -> Vec<(Direction, u64, usize)> {
            self.posted.lock().unwrap().clone()
        }
    }

    impl QueueEndpoint for MockEndpoint {
        fn submit(&self, direction: Direction, desc: PostDescriptor) -> Result<()> {
            if self.fail_submit.load(Ordering::SeqCst) {
                return Err(Error::new(ErrorKind::OperatingSystemError));
            }
            self.posted.lock().unwrap().push((direction, desc.wr_id, desc.len));
            Ok(())
        }

        fn register_memory(&self, _addr: *mut u8, _len: usize) -> Result<MemoryRegion> {
            Ok(MemoryRegion::unregistered())
        }

        fn poll_for_receive(&self, _timeout_ms: i32) -> Result<()> {
            Ok(())
        }
    }

    fn send_queue(endpoint: &Arc<MockEndpoint>, n: usize, size: usize) -> Arc<BufferQueue> {
        let ep: Arc<dyn QueueEndpoint> = endpoint.clone();
        BufferQueue::new_multiple(&ep, Direction::Send, n, size, false).unwrap()
    }

    fn recv_queue(endpoint: &Arc<MockEndpoint>, n: usize, size: usize) -> Arc<BufferQueue> {
        let ep: Arc<dyn QueueEndpoint> = endpoint.clone();
        BufferQueue::new_multiple(&ep, Direction::Receive, n, size, false).unwrap()
    }

    /// Per-test completion record, addressed through the callback's opaque
    /// context word exactly the way an application would.
    #[derive(Default)]
    struct CallbackRecord {
        calls: AtomicUsize,
        bytes: AtomicUsize,
        failures: AtomicUsize,
    }

    fn recording_callback(ctx1: usize, _ctx2: usize, status: Result<()>, bytes: usize) {
        // SAFETY: ctx1 carries the address of a CallbackRecord the test
        // keeps alive for the queue's lifetime.
        let record = unsafe { &*(ctx1 as *const CallbackRecord) };
        record.calls.fetch_add(1, Ordering::SeqCst);
        record.bytes.store(bytes, Ordering::SeqCst);
        if status.is_err() {
            record.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn callback(record: &CallbackRecord) -> CallbackData {
        CallbackData {
            function: recording_callback,
            context1: record as *const CallbackRecord as usize,
            context2: 0,
        }
    }

    #[test]
    fn send_parks_without_credit_then_drains() {
        let ep = MockEndpoint::new();
        let queue = send_queue(&ep, 2, 128);

        let idx = queue.acquire_idle(0).unwrap();
        queue.set_used(idx, 100).unwrap();
        queue.queue(idx, IgnoreCredits::No).unwrap();
        // Parked: nothing posted yet.
        assert!(ep.posted().is_empty());
        assert_eq!(queue.queued_buffer_count(), 1);

        queue.add_credit(128).unwrap();
        let posted = ep.posted();
        assert_eq!(posted, vec![(Direction::Send, idx as u64, 100)]);
    }

    #[test]
    fn send_with_available_credit_posts_immediately() {
        let ep = MockEndpoint::new();
        let queue = send_queue(&ep, 1, 64);
        queue.add_credit(64).unwrap();

        let idx = queue.acquire_idle(0).unwrap();
        queue.set_used(idx, 64).unwrap();
        queue.queue(idx, IgnoreCredits::No).unwrap();
        assert_eq!(ep.posted().len(), 1);

        // Credit consumed: completing and re-queueing parks again.
        queue.handle_completion(idx, None, None).unwrap();
        let idx = queue.acquire_idle(0).unwrap();
        queue.queue(idx, IgnoreCredits::No).unwrap();
        assert_eq!(ep.posted().len(), 1);
    }

    #[test]
    fn oversize_send_latches_sticky_status() {
        let ep = MockEndpoint::new();
        let queue = send_queue(&ep, 2, 100);
        queue.add_credit(50).unwrap();

        let idx = queue.acquire_idle(0).unwrap();
        queue.set_used(idx, 100).unwrap();
        let err = queue.queue(idx, IgnoreCredits::No).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SendTooLargeForRecvBuffer);

        // Sticky: every later operation surfaces the first error.
        assert_eq!(
            queue.acquire_idle(0).unwrap_err().kind(),
            ErrorKind::SendTooLargeForRecvBuffer
        );
        let second = queue.queue(idx, IgnoreCredits::No).unwrap_err();
        assert_eq!(second.kind(), ErrorKind::SendTooLargeForRecvBuffer);
    }

    #[test]
    fn oversize_parked_send_latches_on_credit_arrival() {
        let ep = MockEndpoint::new();
        let queue = send_queue(&ep, 1, 100);

        let idx = queue.acquire_idle(0).unwrap();
        queue.set_used(idx, 100).unwrap();
        queue.queue(idx, IgnoreCredits::No).unwrap();

        let err = queue.add_credit(10).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SendTooLargeForRecvBuffer);
        assert_eq!(
            queue.queue_status().unwrap().kind(),
            ErrorKind::SendTooLargeForRecvBuffer
        );
    }

    #[test]
    fn receive_flow_completion_and_release() {
        let ep = MockEndpoint::new();
        let queue = recv_queue(&ep, 2, 256);

        let idx = queue.acquire_idle(0).unwrap();
        queue.queue(idx, IgnoreCredits::No).unwrap();
        assert_eq!(ep.posted(), vec![(Direction::Receive, idx as u64, 256)]);

        queue.handle_completion(idx, None, Some(77)).unwrap();
        let got = queue.acquire_completed(0).unwrap();
        assert_eq!(got, idx);
        let view = queue.buffer_view(got).unwrap();
        assert_eq!(view.used, 77);
        assert_eq!(view.capacity, 256);

        queue.release(got).unwrap();
        assert!(!queue.has_user_buffers());
        // Released buffers are idle again, not completed.
        assert_eq!(
            queue.acquire_completed(0).unwrap_err().kind(),
            ErrorKind::NoBuffersQueued
        );
    }

    #[test]
    fn acquire_completed_entry_errors() {
        let ep = MockEndpoint::new();
        let recv = recv_queue(&ep, 1, 64);
        assert_eq!(
            recv.acquire_completed(0).unwrap_err().kind(),
            ErrorKind::NoBuffersQueued
        );

        let send = send_queue(&ep, 1, 64);
        assert_eq!(
            send.acquire_completed(0).unwrap_err().kind(),
            ErrorKind::InvalidOperation
        );
    }

    #[test]
    fn acquire_idle_timeout_and_poll() {
        let ep = MockEndpoint::new();
        let queue = send_queue(&ep, 1, 64);
        let idx = queue.acquire_idle(0).unwrap();
        // Pool exhausted: poll fails immediately, short wait times out.
        assert_eq!(queue.acquire_idle(0).unwrap_err().kind(), ErrorKind::Timeout);
        let start = Instant::now();
        assert_eq!(queue.acquire_idle(30).unwrap_err().kind(), ErrorKind::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(25));
        queue.release(idx).unwrap();
    }

    #[test]
    fn completion_in_fifo_order_enforced() {
        let ep = MockEndpoint::new();
        let queue = recv_queue(&ep, 2, 64);
        let a = queue.acquire_idle(0).unwrap();
        let b = queue.acquire_idle(0).unwrap();
        queue.queue(a, IgnoreCredits::No).unwrap();
        queue.queue(b, IgnoreCredits::No).unwrap();

        let err = queue.handle_completion(b, None, Some(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalError);
        queue.handle_completion(a, None, Some(1)).unwrap();
        queue.handle_completion(b, None, Some(1)).unwrap();
    }

    #[test]
    fn abort_drains_and_fires_callbacks() {
        let record = CallbackRecord::default();
        let ep = MockEndpoint::new();
        let queue = recv_queue(&ep, 3, 64);

        let a = queue.acquire_idle(0).unwrap();
        queue.set_callback(a, Some(callback(&record))).unwrap();
        queue.queue(a, IgnoreCredits::No).unwrap();

        queue.abort(Error::new(ErrorKind::Disconnected));
        assert_eq!(record.calls.load(Ordering::SeqCst), 1);
        assert_eq!(record.bytes.load(Ordering::SeqCst), 0);
        assert_eq!(record.failures.load(Ordering::SeqCst), 1);

        // Repeat abort is harmless and does not overwrite the first error.
        queue.abort(Error::new(ErrorKind::OperationCancelled));
        assert_eq!(record.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.queue_status().unwrap().kind(), ErrorKind::Disconnected);

        assert_eq!(
            queue.acquire_idle(0).unwrap_err().kind(),
            ErrorKind::Disconnected
        );
    }

    #[test]
    fn completed_buffers_drain_after_abort() {
        let ep = MockEndpoint::new();
        let queue = recv_queue(&ep, 2, 64);
        let a = queue.acquire_idle(0).unwrap();
        let b = queue.acquire_idle(0).unwrap();
        queue.queue(a, IgnoreCredits::No).unwrap();
        queue.queue(b, IgnoreCredits::No).unwrap();
        queue.handle_completion(a, None, Some(10)).unwrap();

        queue.abort(Error::new(ErrorKind::Disconnected));

        // The already-completed buffer is handed out before the error.
        let got = queue.acquire_completed(0).unwrap();
        assert_eq!(got, a);
        assert_eq!(
            queue.acquire_completed(0).unwrap_err().kind(),
            ErrorKind::Disconnected
        );
    }

    #[test]
    fn completions_after_abort_are_swallowed() {
        let ep = MockEndpoint::new();
        let queue = recv_queue(&ep, 1, 64);
        let a = queue.acquire_idle(0).unwrap();
        queue.queue(a, IgnoreCredits::No).unwrap();
        queue.abort(Error::new(ErrorKind::OperationCancelled));
        // A late provider completion for the drained buffer is ignored.
        queue.handle_completion(a, None, Some(5)).unwrap();
        assert_eq!(
            queue.acquire_completed(0).unwrap_err().kind(),
            ErrorKind::OperationCancelled
        );
    }

    #[test]
    fn send_completion_reports_submitted_bytes() {
        let record = CallbackRecord::default();
        let ep = MockEndpoint::new();
        let queue = send_queue(&ep, 1, 128);
        queue.add_credit(128).unwrap();

        let idx = queue.acquire_idle(0).unwrap();
        queue.set_used(idx, 42).unwrap();
        queue.set_callback(idx, Some(callback(&record))).unwrap();
        queue.queue(idx, IgnoreCredits::No).unwrap();

        queue.handle_completion(idx, None, None).unwrap();
        assert_eq!(record.calls.load(Ordering::SeqCst), 1);
        assert_eq!(record.bytes.load(Ordering::SeqCst), 42);
        assert_eq!(record.failures.load(Ordering::SeqCst), 0);

        // Back to idle, ready for reuse; the callback was consumed.
        assert_eq!(queue.acquire_idle(0).unwrap(), idx);
        queue.release(idx).unwrap();
        queue.add_credit(128).unwrap();
        let idx = queue.acquire_idle(0).unwrap();
        queue.queue(idx, IgnoreCredits::No).unwrap();
        queue.handle_completion(idx, None, None).unwrap();
        assert_eq!(record.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_requires_user_state() {
        let ep = MockEndpoint::new();
        let queue = recv_queue(&ep, 1, 64);
        assert_eq!(queue.release(0).unwrap_err().kind(), ErrorKind::InvalidOperation);
        assert_eq!(queue.release(99).unwrap_err().kind(), ErrorKind::InvalidArgument);

        let idx = queue.acquire_idle(0).unwrap();
        queue.queue(idx, IgnoreCredits::No).unwrap();
        // No longer user-held once queued.
        assert_eq!(queue.release(idx).unwrap_err().kind(), ErrorKind::InvalidOperation);
    }

    #[test]
    fn set_used_validates_capacity() {
        let ep = MockEndpoint::new();
        let queue = send_queue(&ep, 1, 10);
        let idx = queue.acquire_idle(0).unwrap();
        queue.set_used(idx, 10).unwrap();
        assert_eq!(
            queue.set_used(idx, 11).unwrap_err().kind(),
            ErrorKind::InvalidSize
        );
        queue.release(idx).unwrap();
    }

    #[test]
    fn submit_failure_in_add_credit_latches() {
        let ep = MockEndpoint::new();
        let queue = send_queue(&ep, 1, 64);
        let idx = queue.acquire_idle(0).unwrap();
        queue.set_used(idx, 8).unwrap();
        queue.queue(idx, IgnoreCredits::No).unwrap();

        ep.fail_submit.store(true, Ordering::SeqCst);
        let err = queue.add_credit(64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OperatingSystemError);
        assert_eq!(
            queue.queue_status().unwrap().kind(),
            ErrorKind::OperatingSystemError
        );
    }

    #[test]
    fn single_buffer_pool_leases_subranges() {
        let ep = MockEndpoint::new();
        let dyn_ep: Arc<dyn QueueEndpoint> = ep.clone();
        let mut backing = vec![0u8; 1024];
        let queue = BufferQueue::new_single(
            &dyn_ep,
            Direction::Receive,
            backing.as_mut_ptr(),
            backing.len(),
            1,
            false,
        )
        .unwrap();

        // Single-buffer pools complete straight back to idle.
        assert_eq!(
            queue.acquire_completed(0).unwrap_err().kind(),
            ErrorKind::InvalidOperation
        );

        let idx = queue.acquire_idle(0).unwrap();
        // SAFETY: offset stays inside the backing allocation.
        let lease_ptr = unsafe { backing.as_mut_ptr().add(100) };
        queue.set_external_region(idx, lease_ptr, 300).unwrap();
        queue.queue(idx, IgnoreCredits::No).unwrap();
        assert_eq!(ep.posted(), vec![(Direction::Receive, idx as u64, 300)]);

        queue.handle_completion(idx, None, Some(300)).unwrap();
        // Back to idle immediately.
        assert_eq!(queue.acquire_idle(0).unwrap(), idx);
    }

    #[test]
    fn blocked_acquire_wakes_on_completion() {
        let ep = MockEndpoint::new();
        let queue = recv_queue(&ep, 1, 64);
        let idx = queue.acquire_idle(0).unwrap();
        queue.queue(idx, IgnoreCredits::No).unwrap();

        let waiter = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.acquire_completed(5000))
        };
        std::thread::sleep(Duration::from_millis(30));
        queue.handle_completion(idx, None, Some(9)).unwrap();
        let got = waiter.join().unwrap().unwrap();
        assert_eq!(got, idx);
    }
}
