//! Per-session reentrant readers-writer gate with suspend/resume and an
//! independent reference count.
//!
//! The gate is an explicit state machine over per-thread request nodes; it
//! does not map onto any standard-library primitive. A node records how many
//! shared and exclusive accesses its thread holds and in which order (a
//! nesting bit-stack), so releases unwind in LIFO order and report the mode
//! they released. Waiting threads queue on a FIFO pending list; a thread
//! woken from the pending head is re-admitted at high priority so it cannot
//! lose its place to a newcomer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorKind, Result};

const MAX_NEST_LEVEL: u32 = 32;

const HIGH_PRIORITY: u8 = 1 << 0;
const DIFFERENT_THREAD: u8 = 1 << 1;

/// Manual- or auto-reset event, the wait/signal primitive behind both the
/// per-node wakeups and the all-references-released gate.
struct Event {
    auto_reset: bool,
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    fn new(auto_reset: bool, signalled_initially: bool) -> Self {
        Event {
            auto_reset,
            signalled: Mutex::new(signalled_initially),
            cond: Condvar::new(),
        }
    }

    /// Wait until signalled. `timeout_ms` of -1 waits forever; otherwise the
    /// wait fails with [`ErrorKind::Timeout`] once the deadline passes.
    fn wait(&self, timeout_ms: i32) -> Result<()> {
        let mut signalled = self.signalled.lock().unwrap();
        if timeout_ms < 0 {
            while !*signalled {
                signalled = self.cond.wait(signalled).unwrap();
            }
        } else {
            let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
            while !*signalled {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::new(ErrorKind::Timeout));
                }
                let (guard, _) = self.cond.wait_timeout(signalled, deadline - now).unwrap();
                signalled = guard;
            }
        }
        if self.auto_reset {
            *signalled = false;
        }
        Ok(())
    }

    fn set(&self) {
        let mut signalled = self.signalled.lock().unwrap();
        *signalled = true;
        self.cond.notify_all();
    }

    fn reset(&self) {
        *self.signalled.lock().unwrap() = false;
    }
}

/// One thread's accesses: counts per mode plus the acquisition order.
struct Node {
    tid: ThreadId,
    shared: u32,
    exclusive: u32,
    // Bit-stack of acquisition modes, LSB = most recent; 1 = shared.
    nesting: u64,
    signal: Arc<Event>,
}

impl Node {
    fn new(tid: ThreadId, exclusive: bool) -> Self {
        let mut node = Node {
            tid,
            shared: 0,
            exclusive: 0,
            nesting: 0,
            signal: Arc::new(Event::new(true, false)),
        };
        node.add(exclusive);
        node
    }

    fn add(&mut self, exclusive: bool) {
        assert!(self.shared + self.exclusive < MAX_NEST_LEVEL, "access nesting too deep");
        if exclusive {
            self.exclusive += 1;
            self.nesting <<= 1;
        } else {
            self.shared += 1;
            self.nesting = (self.nesting << 1) | 1;
        }
    }

    /// Remove the most recent access; returns true if it was exclusive.
    fn remove_last(&mut self) -> bool {
        let was_shared = self.nesting & 1 != 0;
        if was_shared {
            self.shared -= 1;
        } else {
            self.exclusive -= 1;
        }
        self.nesting >>= 1;
        !was_shared
    }

    #[inline]
    fn count(&self) -> u32 {
        self.shared + self.exclusive
    }
}

#[derive(Default)]
struct State {
    active: Vec<Node>,
    pending: VecDeque<Node>,
    suspended: Vec<Node>,
}

impl State {
    fn position(list: &[Node], tid: ThreadId) -> Option<usize> {
        list.iter().position(|n| n.tid == tid)
    }

    fn active_count(&self) -> u32 {
        self.active.iter().map(Node::count).sum()
    }

    fn active_exclusive(&self) -> u32 {
        self.active.iter().map(|n| n.exclusive).sum()
    }

    #[cfg(test)]
    fn active_shared(&self) -> u32 {
        self.active.iter().map(|n| n.shared).sum()
    }
}

pub struct AccessManager {
    state: Mutex<State>,
    refcount: AtomicU32,
    all_refs_released: Event,
}

impl Default for AccessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessManager {
    pub fn new() -> Self {
        AccessManager {
            state: Mutex::new(State::default()),
            refcount: AtomicU32::new(0),
            all_refs_released: Event::new(false, true),
        }
    }

    /// Add one access for the calling thread. Nesting is legal in any mix of
    /// modes; every `acquire` must be paired with a `release`.
    pub fn acquire(&self, exclusive: bool) {
        self.inc_ref();
        let tid = thread::current().id();
        let mut state = self.state.lock().unwrap();

        let node = match State::position(&state.active, tid) {
            Some(pos) => {
                if !exclusive {
                    // Shared stacks onto an active request unconditionally.
                    state.active[pos].add(false);
                    return;
                }
                if state.active[pos].exclusive > 0 {
                    // Already exclusive; just deepen.
                    state.active[pos].add(true);
                    return;
                }
                // Upgrade: pull our request out so the admission check only
                // sees other threads, then re-admit with the exclusive added.
                let mut node = state.active.remove(pos);
                node.add(true);
                node
            }
            None => Node::new(tid, exclusive),
        };

        if let Some(wait) = Self::satisfy(&mut state, node, 0) {
            drop(state);
            // Infinite wait; only timed waits can fail.
            let _ = wait.wait(-1);
            let mut state = self.state.lock().unwrap();
            debug_assert!(State::position(&state.active, tid).is_some());
            if let Some(head) = state.pending.pop_front() {
                Self::satisfy(&mut state, head, HIGH_PRIORITY | DIFFERENT_THREAD);
            }
        }
    }

    /// Release the calling thread's most recent access and wake the next
    /// pending request. Returns true if the released access was exclusive.
    pub fn release(&self) -> bool {
        let was_exclusive;
        {
            let tid = thread::current().id();
            let mut state = self.state.lock().unwrap();
            let pos = State::position(&state.active, tid)
                .expect("release() without a matching acquire()");
            let mut node = state.active.remove(pos);
            was_exclusive = node.remove_last();
            if node.count() > 0 {
                state.active.insert(0, node);
            }
            if let Some(head) = state.pending.pop_front() {
                Self::satisfy(&mut state, head, HIGH_PRIORITY | DIFFERENT_THREAD);
            }
        }
        self.dec_ref();
        was_exclusive
    }

    /// Park the calling thread's entire access stack on a side list and let
    /// the next pending request run. Used around every blocking I/O wait so
    /// a concurrent close can get exclusive access.
    pub fn suspend(&self) {
        let tid = thread::current().id();
        let mut state = self.state.lock().unwrap();
        let pos = State::position(&state.active, tid)
            .expect("suspend() without a matching acquire()");
        let node = state.active.remove(pos);
        state.suspended.push(node);
        if let Some(head) = state.pending.pop_front() {
            Self::satisfy(&mut state, head, HIGH_PRIORITY | DIFFERENT_THREAD);
        }
    }

    /// Re-acquire the full stack parked by `suspend`, queueing behind any
    /// pending requests.
    pub fn resume(&self) {
        let tid = thread::current().id();
        let mut state = self.state.lock().unwrap();
        let Some(pos) = State::position(&state.suspended, tid) else {
            return;
        };
        let node = state.suspended.remove(pos);
        if let Some(wait) = Self::satisfy(&mut state, node, 0) {
            drop(state);
            let _ = wait.wait(-1);
            let mut state = self.state.lock().unwrap();
            debug_assert!(State::position(&state.active, tid).is_some());
            if let Some(head) = state.pending.pop_front() {
                Self::satisfy(&mut state, head, HIGH_PRIORITY | DIFFERENT_THREAD);
            }
        }
    }

    /// Try to admit `node`. Admission requires: no other thread holds
    /// exclusive access; an exclusive request sees no active access at all;
    /// and, unless the request is high priority, nothing is already pending.
    ///
    /// If the request cannot be admitted it is queued (head for high
    /// priority, tail otherwise, after giving the current head a chance) and
    /// `Some(event)` is returned for a same-thread caller to wait on. For a
    /// different thread's request, admission signals that thread instead.
    fn satisfy(state: &mut State, node: Node, flags: u8) -> Option<Arc<Event>> {
        let high_priority = flags & HIGH_PRIORITY != 0;
        let different_thread = flags & DIFFERENT_THREAD != 0;

        let admissible = (high_priority || state.pending.is_empty())
            && state.active_exclusive() == 0
            && !(node.exclusive > 0 && state.active_count() > 0);

        if admissible {
            let signal = node.signal.clone();
            state.active.insert(0, node);
            if different_thread {
                signal.set();
            }
            None
        } else {
            let signal = node.signal.clone();
            if high_priority {
                state.pending.push_front(node);
            } else {
                // The displaced head keeps its place in line: re-admit it at
                // high priority before queueing ourselves at the tail.
                if let Some(head) = state.pending.pop_front() {
                    Self::satisfy(state, head, HIGH_PRIORITY | DIFFERENT_THREAD);
                }
                state.pending.push_back(node);
            }
            if different_thread {
                None
            } else {
                Some(signal)
            }
        }
    }

    /// Add a reference without acquiring access. Exposed for look-up paths
    /// that must pin the resource while dropping their own table lock before
    /// acquiring access.
    pub fn inc_ref(&self) {
        if self.refcount.fetch_add(1, Ordering::SeqCst) == 0 {
            self.all_refs_released.reset();
        }
    }

    /// Drop a reference added by `inc_ref` (or internally by `acquire`).
    pub fn dec_ref(&self) {
        let prev = self.refcount.fetch_sub(1, Ordering::SeqCst);
        assert!(prev != 0, "reference count underflow");
        if prev == 1 {
            self.all_refs_released.set();
        }
    }

    /// Block until the reference count reaches zero. This does not prevent
    /// new references afterwards; the caller must arrange that (the registry
    /// removes the session from its tables first).
    pub fn wait_for_all_references_released(&self, timeout_ms: i32) -> Result<()> {
        self.all_refs_released.wait(timeout_ms)
    }

    // Introspection used by the unit tests.

    #[cfg(test)]
    pub fn has_exclusive_access(&self) -> bool {
        let state = self.state.lock().unwrap();
        match State::position(&state.active, thread::current().id()) {
            Some(pos) => state.active[pos].exclusive > 0,
            None => false,
        }
    }

    #[cfg(test)]
    pub fn has_shared_access(&self) -> bool {
        let state = self.state.lock().unwrap();
        match State::position(&state.active, thread::current().id()) {
            Some(pos) => state.active[pos].exclusive == 0 && state.active[pos].shared > 0,
            None => false,
        }
    }

    #[cfg(test)]
    pub fn ref_count(&self) -> u32 {
        self.refcount.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn active_count(&self) -> u32 {
        self.state.lock().unwrap().active_count()
    }

    #[cfg(test)]
    pub fn active_shared_count(&self) -> u32 {
        self.state.lock().unwrap().active_shared()
    }

    #[cfg(test)]
    pub fn active_exclusive_count(&self) -> u32 {
        self.state.lock().unwrap().active_exclusive()
    }
}

/// Scoped suspension of the calling thread's access stack; resumes on drop.
pub(crate) struct SuspendGuard<'a> {
    manager: &'a AccessManager,
}

impl<'a> SuspendGuard<'a> {
    pub fn new(manager: &'a AccessManager) -> Self {
        manager.suspend();
        SuspendGuard { manager }
    }
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.manager.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;

    #[test]
    fn sanity_single_thread() {
        let am = AccessManager::new();

        am.acquire(true);
        assert_eq!(am.ref_count(), 1);
        assert_eq!(am.active_count(), 1);
        assert_eq!(am.active_exclusive_count(), 1);
        assert!(am.has_exclusive_access());
        assert!(!am.has_shared_access());
        assert!(am.release());
        assert_eq!(am.ref_count(), 0);
        assert_eq!(am.active_count(), 0);

        am.acquire(false);
        assert!(am.has_shared_access());
        assert!(!am.has_exclusive_access());
        assert!(!am.release());
    }

    #[test]
    fn recursive_mixed_unwinds_lifo() {
        let am = AccessManager::new();

        // shared, exclusive, shared: releases report shared, exclusive, shared.
        am.acquire(false);
        am.acquire(true);
        am.acquire(false);
        assert_eq!(am.ref_count(), 3);
        assert_eq!(am.active_shared_count(), 2);
        assert_eq!(am.active_exclusive_count(), 1);
        assert!(am.has_exclusive_access());

        assert!(!am.release());
        assert!(am.release());
        assert!(!am.release());
        assert_eq!(am.ref_count(), 0);
        assert!(!am.has_shared_access());
    }

    #[test]
    fn shared_then_promote() {
        let am = AccessManager::new();
        am.acquire(false);
        assert!(!am.has_exclusive_access());
        am.acquire(true);
        assert!(am.has_exclusive_access());
        assert_eq!(am.active_count(), 2);
        assert!(am.release());
        assert!(am.has_shared_access());
        assert!(!am.release());
    }

    #[test]
    fn concurrent_shared_allowed() {
        let am = Arc::new(AccessManager::new());
        am.acquire(false);

        let am2 = am.clone();
        let handle = thread::spawn(move || {
            am2.acquire(false);
            let got_both = am2.active_shared_count() == 2;
            am2.release();
            got_both
        });
        assert!(handle.join().unwrap());
        am.release();
    }

    #[test]
    fn exclusive_blocks_until_release() {
        let am = Arc::new(AccessManager::new());
        am.acquire(false);

        let acquired = Arc::new(AtomicBool::new(false));
        let am2 = am.clone();
        let acquired2 = acquired.clone();
        let handle = thread::spawn(move || {
            am2.acquire(true);
            acquired2.store(true, Ordering::SeqCst);
            am2.release();
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        am.release();
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn suspend_admits_waiting_writer() {
        let am = Arc::new(AccessManager::new());
        am.acquire(false);

        let (started_tx, started_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let am2 = am.clone();
        let handle = thread::spawn(move || {
            started_tx.send(()).unwrap();
            am2.acquire(true);
            done_tx.send(()).unwrap();
            // Hold it briefly so resume() has to wait its turn.
            thread::sleep(Duration::from_millis(20));
            am2.release();
        });

        started_rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        // The writer is parked until we suspend our shared access.
        assert!(done_rx.try_recv().is_err());

        am.suspend();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        am.resume();
        assert!(am.has_shared_access());

        handle.join().unwrap();
        am.release();
        assert_eq!(am.ref_count(), 0);
    }

    #[test]
    fn refcount_wait_times_out_then_succeeds() {
        let am = Arc::new(AccessManager::new());
        am.acquire(false);

        let err = am.wait_for_all_references_released(50).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let am2 = am.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            am2.release();
        });
        am.wait_for_all_references_released(5000).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn pending_reference_without_access() {
        let am = AccessManager::new();
        am.inc_ref();
        assert_eq!(am.ref_count(), 1);
        assert_eq!(am.active_count(), 0);
        let err = am.wait_for_all_references_released(10).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        am.dec_ref();
        am.wait_for_all_references_released(10).unwrap();
    }

    #[test]
    fn suspend_guard_restores_stack() {
        let am = AccessManager::new();
        am.acquire(false);
        am.acquire(true);
        {
            let _guard = SuspendGuard::new(&am);
            assert_eq!(am.active_count(), 0);
            // The refcount still pins the resource while suspended.
            assert_eq!(am.ref_count(), 2);
        }
        assert!(am.has_exclusive_access());
        am.release();
        am.release();
    }
}
