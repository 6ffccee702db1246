//! Ownership wrapper around a CM identifier and its queue pair.
//!
//! A `CmId` owns the identifier, its per-connection event queue
//! registration, and (once created) the queue pair. Work-request posting,
//! completion-queue polling, and completion-channel plumbing all go through
//! it; everything is released in the right order on drop.

use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};

use rdma_sys::*;

use crate::addr::Address;
use crate::cm::events;
use crate::cm::poller::last_errno;
use crate::error::{Error, Result};
use crate::queue::PostDescriptor;
use crate::session::Direction;

/// Queue-pair depth for each work queue. Bounds the number of concurrently
/// queued requests per direction; there are few practical applications for
/// more.
const MAX_WORK_REQUESTS: u32 = 1024;

fn check_cm(ret: libc::c_int) -> Result<()> {
    if ret == -1 {
        return Err(Error::from_os(last_errno()));
    }
    Ok(())
}

/// `ibv_post_*`/`ibv_req_notify_cq` return the error number directly.
fn check_ibv(ret: libc::c_int) -> Result<()> {
    if ret != 0 {
        return Err(Error::from_os(ret));
    }
    Ok(())
}

pub(crate) struct CmId {
    id: NonNull<rdma_cm_id>,
    created_qp: AtomicBool,
}

// The identifier is driven from multiple session worker threads; the
// provider synchronizes its own structures and our mutable state is atomic.
unsafe impl Send for CmId {}
unsafe impl Sync for CmId {}

impl CmId {
    /// Create an identifier on the singleton event channel, register its
    /// event queue, and bind it to `local` (unspecified means any).
    pub fn create_bound(local: &Address) -> Result<Self> {
        let channel = events::channel()?;
        let mut raw: *mut rdma_cm_id = ptr::null_mut();
        // SAFETY: FFI; out-pointer is valid.
        check_cm(unsafe {
            rdma_create_id(channel, &mut raw, ptr::null_mut(), rdma_port_space::RDMA_PS_TCP)
        })?;
        let id = NonNull::new(raw).ok_or_else(|| Error::from_os(last_errno()))?;
        events::manager().register(id.as_ptr());
        let cm = CmId {
            id,
            created_qp: AtomicBool::new(false),
        };

        let mut local = *local;
        // SAFETY: FFI; the sockaddr lives across the call.
        check_cm(unsafe { rdma_bind_addr(cm.raw(), local.as_sockaddr_mut() as *mut _) })?;
        Ok(cm)
    }

    /// Adopt the provider-created identifier of an incoming connection and
    /// register its event queue.
    pub fn from_accepted(raw: NonNull<rdma_cm_id>) -> Self {
        events::manager().register(raw.as_ptr());
        CmId {
            id: raw,
            created_qp: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn raw(&self) -> *mut rdma_cm_id {
        self.id.as_ptr()
    }

    pub fn listen(&self) -> Result<()> {
        // SAFETY: FFI.
        check_cm(unsafe { rdma_listen(self.raw(), -1) })
    }

    pub fn resolve_addr(
        &self,
        src: Option<&Address>,
        dst: &Address,
        timeout_ms: i32,
    ) -> Result<()> {
        let mut src = src.copied();
        let mut dst = *dst;
        let src_ptr = match src.as_mut() {
            Some(addr) => addr.as_sockaddr_mut(),
            None => ptr::null_mut(),
        };
        // SAFETY: FFI; sockaddrs live across the call.
        check_cm(unsafe {
            rdma_resolve_addr(
                self.raw(),
                src_ptr as *mut _,
                dst.as_sockaddr_mut() as *mut _,
                timeout_ms,
            )
        })
    }

    pub fn resolve_route(&self, timeout_ms: i32) -> Result<()> {
        // SAFETY: FFI.
        check_cm(unsafe { rdma_resolve_route(self.raw(), timeout_ms) })
    }

    fn conn_param(private_data: &[u8]) -> rdma_conn_param {
        // SAFETY: POD; zero is a valid baseline.
        let mut param: rdma_conn_param = unsafe { mem::zeroed() };
        param.private_data = private_data.as_ptr() as *const libc::c_void;
        param.private_data_len = private_data.len() as u8;
        param.retry_count = 10;
        param.rnr_retry_count = 10;
        param
    }

    pub fn connect(&self, private_data: &[u8]) -> Result<()> {
        let mut param = Self::conn_param(private_data);
        // SAFETY: FFI; param and its private data live across the call.
        check_cm(unsafe { rdma_connect(self.raw(), &mut param) })
    }

    pub fn accept(&self, private_data: &[u8]) -> Result<()> {
        let mut param = Self::conn_param(private_data);
        // SAFETY: FFI.
        check_cm(unsafe { rdma_accept(self.raw(), &mut param) })
    }

    /// Reject an incoming connection, echoing `private_data` back to the
    /// connector for diagnostics.
    pub fn reject(&self, private_data: &[u8]) -> Result<()> {
        // SAFETY: FFI.
        check_cm(unsafe {
            rdma_reject(
                self.raw(),
                private_data.as_ptr() as *const libc::c_void,
                private_data.len() as u8,
            )
        })
    }

    pub fn disconnect(&self) {
        // SAFETY: FFI; failure means the connection is already down.
        unsafe {
            let _ = rdma_disconnect(self.raw());
        }
    }

    /// Create the reliable-connected queue pair: 1024 work requests per
    /// direction, one scatter/gather element per request.
    pub fn create_qp(&self) -> Result<()> {
        debug_assert!(!self.created_qp.load(Ordering::SeqCst));
        // SAFETY: POD init.
        let mut attr: ibv_qp_init_attr = unsafe { mem::zeroed() };
        attr.cap.max_send_wr = MAX_WORK_REQUESTS;
        attr.cap.max_recv_wr = MAX_WORK_REQUESTS;
        attr.cap.max_send_sge = 1;
        attr.cap.max_recv_sge = 1;
        attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        attr.qp_context = self.raw() as *mut libc::c_void;
        // SAFETY: FFI; null pd selects the identifier's default domain.
        check_cm(unsafe { rdma_create_qp(self.raw(), ptr::null_mut(), &mut attr) })?;
        self.created_qp.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn destroy_qp(&self) {
        if self.created_qp.swap(false, Ordering::SeqCst) {
            // SAFETY: QP was created by us and not destroyed yet.
            unsafe { rdma_destroy_qp(self.raw()) };
        }
    }

    pub fn post(&self, direction: Direction, desc: PostDescriptor) -> Result<()> {
        // SAFETY: reading fields of live provider structures.
        let (qp, lkey) = unsafe {
            let qp = (*self.raw()).qp;
            (qp, (*desc.mr).lkey)
        };
        let mut sge = ibv_sge {
            addr: desc.addr as u64,
            length: desc.len as u32,
            lkey,
        };
        let mut bad_wr_send: *mut ibv_send_wr = ptr::null_mut();
        let mut bad_wr_recv: *mut ibv_recv_wr = ptr::null_mut();
        let ret = match direction {
            Direction::Send => {
                // SAFETY: POD init.
                let mut wr: ibv_send_wr = unsafe { mem::zeroed() };
                wr.wr_id = desc.wr_id;
                wr.sg_list = &mut sge;
                wr.num_sge = 1;
                wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
                wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
                // SAFETY: FFI; wr and sge live across the call.
                unsafe { ibv_post_send(qp, &mut wr, &mut bad_wr_send) }
            }
            _ => {
                let mut wr = ibv_recv_wr {
                    wr_id: desc.wr_id,
                    next: ptr::null_mut(),
                    sg_list: &mut sge,
                    num_sge: 1,
                };
                // SAFETY: FFI; wr and sge live across the call.
                unsafe { ibv_post_recv(qp, &mut wr, &mut bad_wr_recv) }
            }
        };
        check_ibv(ret)
    }

    fn cq(&self, direction: Direction) -> *mut ibv_cq {
        // SAFETY: fields of a live identifier with a created QP.
        unsafe {
            match direction {
                Direction::Send => (*self.raw()).send_cq,
                _ => (*self.raw()).recv_cq,
            }
        }
    }

    fn comp_channel(&self, direction: Direction) -> *mut ibv_comp_channel {
        // SAFETY: fields of a live identifier with a created QP.
        unsafe {
            match direction {
                Direction::Send => (*self.raw()).send_cq_channel,
                _ => (*self.raw()).recv_cq_channel,
            }
        }
    }

    pub fn comp_channel_fd(&self, direction: Direction) -> libc::c_int {
        // SAFETY: completion channels exist once the QP is created.
        unsafe { (*self.comp_channel(direction)).fd }
    }

    /// Switch both completion channels to non-blocking so the dispatcher
    /// threads can multiplex them with the cancellation pipe.
    pub fn set_cq_channels_nonblocking(&self) -> Result<()> {
        for direction in [Direction::Send, Direction::Receive] {
            let fd = self.comp_channel_fd(direction);
            // SAFETY: FFI on an owned fd.
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                check_cm(flags)?;
                check_cm(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
            }
        }
        Ok(())
    }

    /// One non-blocking completion-queue poll.
    pub fn poll_cq_once(&self, direction: Direction) -> Result<Option<ibv_wc>> {
        // SAFETY: POD init; filled by the provider on success.
        let mut wc: ibv_wc = unsafe { mem::zeroed() };
        // SAFETY: FFI.
        let ret = unsafe { ibv_poll_cq(self.cq(direction), 1, &mut wc) };
        if ret < 0 {
            return Err(Error::from_os(-ret));
        }
        Ok((ret > 0).then_some(wc))
    }

    pub fn request_cq_notification(&self, direction: Direction) -> Result<()> {
        // SAFETY: FFI.
        check_ibv(unsafe { ibv_req_notify_cq(self.cq(direction), 0) })
    }

    /// Consume and acknowledge one completion-channel readiness event.
    pub fn take_cq_event(&self, direction: Direction) -> Result<()> {
        let mut event_cq: *mut ibv_cq = ptr::null_mut();
        let mut context: *mut libc::c_void = ptr::null_mut();
        // SAFETY: FFI; channel fd is readable when called.
        check_cm(unsafe { ibv_get_cq_event(self.comp_channel(direction), &mut event_cq, &mut context) })?;
        debug_assert_eq!(event_cq, self.cq(direction));
        // SAFETY: exactly one event retrieved above.
        unsafe { ibv_ack_cq_events(event_cq, 1) };
        Ok(())
    }

    pub fn local_address(&self) -> Address {
        // SAFETY: FFI; the returned sockaddr lives inside the identifier.
        unsafe { Address::from_raw(rdma_get_local_addr(&*self.raw()) as *const libc::sockaddr) }
    }

    pub fn peer_address(&self) -> Address {
        // SAFETY: FFI; the returned sockaddr lives inside the identifier.
        unsafe { Address::from_raw(rdma_get_peer_addr(&*self.raw()) as *const libc::sockaddr) }
    }
}

impl Drop for CmId {
    fn drop(&mut self) {
        self.destroy_qp();
        events::manager().unregister(self.raw());
        // SAFETY: identifier owned by us, QP and event queue already gone.
        unsafe { rdma_destroy_id(self.raw()) };
    }
}
