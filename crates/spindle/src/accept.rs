//! Accepting connections, including the kernel's multishot variant.
//!
//! With multishot accept, one standing submission produces a completion
//! per incoming connection. Each completion pushes a raw fd into a
//! per-server FIFO; `accept`/`accept_loop` pop from the FIFO when one is
//! registered for the socket. Tearing the FIFO down closes any fds still
//! queued so nothing leaks between the kernel and the application.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use io_uring::types::Fd;
use io_uring::{cqueue, opcode};

use spindle_core::{Error, Interrupt, Resume, Result, sdebug};
use spindle_fiber::Fiber;

use crate::Inner;
use crate::backend::{USER_DATA_NONE, err_from_resume};
use crate::store::{MULTISHOT, OpCtx, OpKind};

/// FIFO of accepted-but-unclaimed fds for one listening socket, plus the
/// fibers waiting for them.
#[derive(Default)]
pub(crate) struct AcceptQueue {
    items: RefCell<VecDeque<i32>>,
    waiters: RefCell<VecDeque<Rc<Fiber>>>,
}

impl AcceptQueue {
    fn push(&self, rt: &Inner, value: i32) {
        self.items.borrow_mut().push_back(value);
        let waiter = self.waiters.borrow_mut().pop_front();
        if let Some(fiber) = waiter {
            rt.schedule(&fiber, Resume::Unit, false);
        }
    }

    fn shift(&self, rt: &Inner) -> Result<i32> {
        loop {
            if let Some(value) = self.items.borrow_mut().pop_front() {
                return Ok(value);
            }
            let cur = rt.current();
            self.waiters.borrow_mut().push_back(cur.clone());
            if let Err(e) = rt.await_switch().check() {
                // Interrupted: a stale waiter entry would earn us a
                // spurious wake later.
                self.waiters.borrow_mut().retain(|f| !Rc::ptr_eq(f, &cur));
                return Err(e);
            }
        }
    }

    /// Close anything still enqueued and fail any fiber still waiting.
    fn teardown(&self, rt: &Inner) {
        self.close_queued();
        let waiters: Vec<_> = self.waiters.borrow_mut().drain(..).collect();
        for fiber in waiters {
            rt.schedule(&fiber, Resume::Interrupt(Interrupt::Raise(Error::Cancelled)), false);
        }
    }

    /// Close accepted fds nobody claimed.
    pub(crate) fn close_queued(&self) {
        for fd in self.items.borrow_mut().drain(..) {
            if fd >= 0 {
                unsafe { libc::close(fd) };
            }
        }
    }
}

impl Inner {
    /// Accept one connection. Pops from the multishot FIFO when one is
    /// registered for this socket, otherwise submits a single ACCEPT.
    pub(crate) fn accept(&self, server_fd: RawFd) -> Result<OwnedFd> {
        let queue = self.accept_queues.borrow().get(&server_fd).cloned();
        if let Some(queue) = queue {
            let fd = queue.shift(self)?;
            if fd < 0 {
                return Err(Error::from_raw(fd));
            }
            return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
        }
        self.accept_once(server_fd)
    }

    fn accept_once(&self, server_fd: RawFd) -> Result<OwnedFd> {
        let ctx = self.store.acquire(OpKind::Accept, Some(self.current()));
        let entry = opcode::Accept::new(Fd(server_fd), std::ptr::null_mut(), std::ptr::null_mut())
            .build()
            .user_data(ctx.id() as u64);

        let (result, resume) = self.submit_op(&ctx, entry)?;
        let completed = self.store.release(&ctx);
        if !completed {
            return Err(err_from_resume(resume));
        }

        if result < 0 {
            return Err(Error::from_raw(result));
        }
        Ok(unsafe { OwnedFd::from_raw_fd(result) })
    }

    /// Accept connections forever, handing each to `step`. Returns when
    /// `step` fails or the fiber is interrupted.
    pub(crate) fn accept_loop(
        &self,
        server_fd: RawFd,
        step: &mut dyn FnMut(OwnedFd) -> Result<()>,
    ) -> Result<()> {
        loop {
            let socket = self.accept(server_fd)?;
            step(socket)?;
        }
    }

    /// Run `body` with a standing multishot ACCEPT on the socket. Accepted
    /// fds flow into the per-server FIFO that `accept`/`accept_loop`
    /// consume. On exit the submission is cancelled and the FIFO is torn
    /// down, closing unclaimed fds.
    pub(crate) fn multishot_accept<T>(
        &self,
        server_fd: RawFd,
        body: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        if !self.multishot_supported {
            return Err(Error::Unsupported("multishot accept"));
        }

        let queue = Rc::new(AcceptQueue::default());
        self.accept_queues.borrow_mut().insert(server_fd, queue);

        let ctx = self.store.acquire(OpKind::MultishotAccept, None);
        ctx.set_ref_count(MULTISHOT);
        // The resume slot remembers which server this context feeds.
        ctx.set_resume(Resume::Value(server_fd as i64));
        let entry = opcode::AcceptMulti::new(Fd(server_fd))
            .build()
            .user_data(ctx.id() as u64);
        if let Err(e) = self.push_sqe(entry) {
            self.store.dispose(&ctx);
            self.remove_accept_queue(server_fd);
            return Err(e);
        }
        self.op_count.set(self.op_count.get() + 1);
        self.defer_submit();

        let result = body();

        // Cleanup runs on success and failure alike. Skip the cancel when
        // the kernel already retired the context (the id may have been
        // recycled by then).
        if ctx.ref_count() == MULTISHOT {
            let cancel = opcode::AsyncCancel::new(ctx.id() as u64)
                .build()
                .user_data(USER_DATA_NONE);
            if self.push_sqe(cancel).is_ok() {
                self.defer_submit();
            }
        }
        self.remove_accept_queue(server_fd);

        result
    }

    /// Completion handler for multishot contexts. As long as the kernel
    /// reports MORE, the context stays armed; each completion feeds one
    /// result into the server's FIFO.
    pub(crate) fn handle_multishot_completion(&self, ctx: &Rc<OpCtx>, res: i32, flags: u32) {
        debug_assert_eq!(ctx.kind(), OpKind::MultishotAccept);
        let server_fd = match ctx.wake_value() {
            Resume::Value(fd) => fd as RawFd,
            _ => {
                self.store.release_multishot(ctx);
                return;
            }
        };

        if res == -libc::ECANCELED {
            self.store.release_multishot(ctx);
            self.remove_accept_queue(server_fd);
            return;
        }

        if !cqueue::more(flags) {
            sdebug!("multishot accept on fd {} retired by kernel", server_fd);
            self.store.release_multishot(ctx);
        }
        let queue = self.accept_queues.borrow().get(&server_fd).cloned();
        if let Some(queue) = queue {
            queue.push(self, res);
        } else if res >= 0 {
            // FIFO already gone: do not leak the accepted connection.
            unsafe { libc::close(res) };
        }
    }

    fn remove_accept_queue(&self, server_fd: RawFd) {
        let queue = self.accept_queues.borrow_mut().remove(&server_fd);
        if let Some(queue) = queue {
            queue.teardown(self);
        }
    }

    /// Tear down every registered FIFO (post-fork, shutdown).
    pub(crate) fn teardown_accept_queues(&self) {
        let fds: Vec<RawFd> = self.accept_queues.borrow().keys().copied().collect();
        for fd in fds {
            self.remove_accept_queue(fd);
        }
    }
}
