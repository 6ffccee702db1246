//! Process-wide session registry: handle allocation, look-up with access
//! acquisition, and (deferred) destruction.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{Error, ErrorKind, Result};
use crate::session::Session;

/// Opaque session handle. Handles are monotonically increasing non-zero
/// integers, never reused within a process lifetime; zero is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionHandle(pub u64);

impl SessionHandle {
    pub const INVALID: SessionHandle = SessionHandle(0);
}

/// Close flag: park the session in the deferred-close table while the
/// application still holds buffer regions.
pub const CLOSE_FLAG_DEFER_WHILE_USER_BUFFERS_OUTSTANDING: u32 = 0x01;

/// An access-managed reference to a session: acquires on construction,
/// releases on drop. Holding one pins the session's access refcount.
pub(crate) struct SessionRef {
    session: Option<Arc<dyn Session>>,
    destruction_pending: bool,
}

impl std::fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRef")
            .field("session", &self.session.as_ref().map(|_| "<dyn Session>"))
            .field("destruction_pending", &self.destruction_pending)
            .finish()
    }
}

impl SessionRef {
    fn acquire(session: Arc<dyn Session>, exclusive: bool, destruction_pending: bool) -> Self {
        session.access().acquire(exclusive);
        SessionRef {
            session: Some(session),
            destruction_pending,
        }
    }

    pub fn session(&self) -> &dyn Session {
        self.session
            .as_deref()
            .expect("session reference already released")
    }

    /// True when the session lives in the deferred-close table.
    pub fn destruction_pending(&self) -> bool {
        self.destruction_pending
    }

    /// Release the access, wait for every other reference to drain, then
    /// drop the shared pointer (destroying the session if it was the last).
    fn release_and_wait_for_all_refs(mut self) {
        let session = self.session.take().expect("session reference already released");
        session.access().release();
        let _ = session.access().wait_for_all_references_released(-1);
    }

    /// Release the access but keep the shared pointer alive.
    fn into_session_released(mut self) -> Arc<dyn Session> {
        let session = self.session.take().expect("session reference already released");
        session.access().release();
        session
    }
}

impl Drop for SessionRef {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.access().release();
        }
    }
}

#[derive(Default)]
struct Tables {
    open: BTreeMap<u64, Arc<dyn Session>>,
    deferred_close: BTreeMap<u64, Arc<dyn Session>>,
    next_handle: u64,
}

#[derive(Default)]
pub(crate) struct Registry {
    tables: Mutex<Tables>,
}

impl Registry {
    pub fn register(&self, session: Arc<dyn Session>) -> SessionHandle {
        let mut tables = self.tables.lock().unwrap();
        tables.next_handle += 1;
        let handle = SessionHandle(tables.next_handle);
        tables.open.insert(handle.0, session);
        handle
    }

    /// Look up a session and acquire access on it. The access is acquired
    /// under the registry lock so the session cannot disappear in between;
    /// the registry lock is released before returning, so callers never
    /// hold it across session-level waits.
    pub fn lookup(
        &self,
        handle: SessionHandle,
        exclusive: bool,
        check_deferred: bool,
    ) -> Result<SessionRef> {
        let tables = self.tables.lock().unwrap();
        if let Some(session) = tables.open.get(&handle.0) {
            return Ok(SessionRef::acquire(session.clone(), exclusive, false));
        }
        if check_deferred {
            if let Some(session) = tables.deferred_close.get(&handle.0) {
                return Ok(SessionRef::acquire(session.clone(), exclusive, true));
            }
        }
        Err(Error::new(ErrorKind::InvalidSession))
    }

    /// Close a session: remove it from the open table, optionally park it
    /// in the deferred-close table while user buffers are outstanding,
    /// cancel all in-flight operations, and (unless deferred) drain the
    /// access refcount and drop the last shared pointer.
    pub fn destroy(&self, handle: SessionHandle, flags: u32) -> Result<()> {
        let (session_ref, deferred) = {
            let mut tables = self.tables.lock().unwrap();
            let session = tables
                .open
                .remove(&handle.0)
                .ok_or_else(|| Error::new(ErrorKind::InvalidSession))?;
            let session_ref = SessionRef::acquire(session.clone(), true, false);

            let mut deferred = false;
            if flags & CLOSE_FLAG_DEFER_WHILE_USER_BUFFERS_OUTSTANDING != 0
                && !session.deferred_destruction_ready()
            {
                tables.deferred_close.insert(handle.0, session);
                deferred = true;
            }
            (session_ref, deferred)
        };

        session_ref.session().cancel();

        if !deferred {
            session_ref.release_and_wait_for_all_refs();
        }
        Ok(())
    }

    /// Complete a deferred close once its condition is met. Called on the
    /// release-to-idle path with the caller's own reference, which is
    /// consumed either way.
    ///
    /// The caller's access is released before the registry lock is taken:
    /// look-ups acquire access while holding the registry lock, so holding
    /// access here while waiting for that lock would invert the order and
    /// let two concurrent releases on the same session deadlock.
    pub fn finish_deferred_if_ready(&self, session_ref: SessionRef, handle: SessionHandle) {
        debug_assert!(session_ref.destruction_pending());
        let session = session_ref.into_session_released();
        let removed = {
            let mut tables = self.tables.lock().unwrap();
            if session.deferred_destruction_ready() {
                tables.deferred_close.remove(&handle.0)
            } else {
                None
            }
        };
        if removed.is_some() {
            drop(removed);
            let _ = session.access().wait_for_all_references_released(-1);
        }
    }

    pub fn open_count(&self) -> u64 {
        self.tables.lock().unwrap().open.len() as u64
    }

    pub fn deferred_close_count(&self) -> u64 {
        self.tables.lock().unwrap().deferred_close.len() as u64
    }
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// The lazily initialised process-wide registry. Never torn down; process
/// exit releases it.
pub(crate) fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessManager;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubSession {
        access: AccessManager,
        ready: AtomicBool,
        cancelled: AtomicUsize,
    }

    impl StubSession {
        fn new(ready: bool) -> Arc<Self> {
            Arc::new(StubSession {
                access: AccessManager::new(),
                ready: AtomicBool::new(ready),
                cancelled: AtomicUsize::new(0),
            })
        }
    }

    impl Session for StubSession {
        fn access(&self) -> &AccessManager {
            &self.access
        }

        fn cancel(&self) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }

        fn deferred_destruction_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn register_lookup_destroy() {
        let registry = Registry::default();
        let stub = StubSession::new(true);
        let handle = registry.register(stub.clone());
        assert_ne!(handle, SessionHandle::INVALID);
        assert_eq!(registry.open_count(), 1);

        {
            let found = registry.lookup(handle, true, false).unwrap();
            assert!(!found.destruction_pending());
            assert!(found.session().deferred_destruction_ready());
        }

        registry.destroy(handle, 0).unwrap();
        assert_eq!(registry.open_count(), 0);
        assert_eq!(stub.cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(
            registry.lookup(handle, true, false).unwrap_err().kind(),
            ErrorKind::InvalidSession
        );
        assert_eq!(
            registry.destroy(handle, 0).unwrap_err().kind(),
            ErrorKind::InvalidSession
        );
    }

    #[test]
    fn handles_are_monotonic_and_unique() {
        let registry = Registry::default();
        let a = registry.register(StubSession::new(true));
        let b = registry.register(StubSession::new(true));
        registry.destroy(a, 0).unwrap();
        let c = registry.register(StubSession::new(true));
        assert!(a.0 < b.0 && b.0 < c.0);
    }

    #[test]
    fn deferred_close_lifecycle() {
        let registry = Registry::default();
        let stub = StubSession::new(false);
        let handle = registry.register(stub.clone());

        registry
            .destroy(handle, CLOSE_FLAG_DEFER_WHILE_USER_BUFFERS_OUTSTANDING)
            .unwrap();
        assert_eq!(registry.open_count(), 0);
        assert_eq!(registry.deferred_close_count(), 1);
        assert_eq!(stub.cancelled.load(Ordering::SeqCst), 1);

        // Only deferred-aware look-ups still find it.
        assert!(registry.lookup(handle, true, false).is_err());
        let found = registry.lookup(handle, true, true).unwrap();
        assert!(found.destruction_pending());

        // Not ready yet: the check keeps it parked.
        registry.finish_deferred_if_ready(found, handle);
        assert_eq!(registry.deferred_close_count(), 1);

        stub.ready.store(true, Ordering::SeqCst);
        let found = registry.lookup(handle, true, true).unwrap();
        registry.finish_deferred_if_ready(found, handle);
        assert_eq!(registry.deferred_close_count(), 0);
    }

    #[test]
    fn destroy_without_defer_flag_ignores_outstanding_buffers() {
        let registry = Registry::default();
        let handle = registry.register(StubSession::new(false));
        registry.destroy(handle, 0).unwrap();
        assert_eq!(registry.open_count(), 0);
        assert_eq!(registry.deferred_close_count(), 0);
    }
}
