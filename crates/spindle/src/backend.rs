//! Ring management: setup, submission discipline, completion reaping.
//!
//! Submission is deferred by default: SQEs accumulate and are flushed when
//! the pending count reaches the prepared limit, or right before the
//! blocking wait. The blocking wait inside `poll(true)` is the only place
//! the OS thread sleeps; it is released by a completion, a signal, or an
//! external wakeup through the runtime's eventfd.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use io_uring::types::Fd;
use io_uring::{IoUring, opcode, squeue};

use spindle_core::{sdebug, swarn};
use spindle_core::{Buffer, Error, Resume, Result};

use crate::Inner;
use crate::store::{MULTISHOT, OpCtx, OpKind};

/// SQE user_data for submissions with no context (cancels, wake NOPs).
pub(crate) const USER_DATA_NONE: u64 = u64::MAX;

/// `wakeup_ctx` value when no wakeup poll is armed.
pub(crate) const NO_WAKEUP_CTX: u32 = u32::MAX;

/// Smallest ring the backend will settle for when ENOMEM pushes back.
const MIN_RING_ENTRIES: u32 = 64;

impl Inner {
    /// Set up the ring: prefer SUBMIT_ALL | COOP_TASKRUN, fall back to no
    /// flags on kernels that reject them, and halve the depth on ENOMEM.
    pub(crate) fn build_ring(entries: u32) -> Result<(IoUring, u32)> {
        let mut entries = entries.max(MIN_RING_ENTRIES);
        let mut with_flags = true;
        loop {
            let built = if with_flags {
                IoUring::builder()
                    .setup_submit_all()
                    .setup_coop_taskrun()
                    .build(entries)
            } else {
                IoUring::builder().build(entries)
            };
            match built {
                Ok(ring) => return Ok((ring, entries)),
                Err(e) => match e.raw_os_error() {
                    Some(code) if code == libc::EINVAL && with_flags => {
                        with_flags = false;
                    }
                    Some(code) if code == libc::ENOMEM && entries > MIN_RING_ENTRIES => {
                        entries /= 2;
                    }
                    _ => return Err(e.into()),
                },
            }
        }
    }

    /// Queue one SQE. If the submission queue is full, flush deferred
    /// entries; if it is still full, snooze until completions drain.
    pub(crate) fn push_sqe(&self, entry: squeue::Entry) -> Result<()> {
        loop {
            let pushed = {
                let mut ring = self.ring.borrow_mut();
                let mut sq = ring.submission();
                unsafe { sq.push(&entry).is_ok() }
            };
            if pushed {
                return Ok(());
            }
            if self.pending_sqes.get() > 0 {
                self.immediate_submit()?;
            } else {
                self.snooze()?;
            }
        }
    }

    /// Flush everything queued to the kernel now.
    pub(crate) fn immediate_submit(&self) -> Result<usize> {
        self.pending_sqes.set(0);
        loop {
            let res = self.ring.borrow().submit();
            match res {
                Ok(n) => return Ok(n),
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Count one deferred SQE, flushing when the prepared limit is hit.
    pub(crate) fn defer_submit(&self) {
        self.pending_sqes.set(self.pending_sqes.get() + 1);
        if self.pending_sqes.get() >= self.prepared_limit.get() {
            if let Err(e) = self.immediate_submit() {
                swarn!("deferred submit failed: {}", e);
            }
        }
    }

    /// The scheduler's idle pump. When blocking, releases the OS thread
    /// until at least one completion arrives, then drains all ready
    /// completions.
    pub(crate) fn poll(&self, blocking: bool) {
        self.poll_count.set(self.poll_count.get() + 1);
        if blocking {
            self.wait_for_completion();
        } else if self.pending_sqes.get() > 0 {
            if let Err(e) = self.immediate_submit() {
                swarn!("submit failed: {}", e);
            }
        }
        self.drain_completions();
    }

    fn wait_for_completion(&self) {
        self.arm_wakeup();
        loop {
            self.pending_sqes.set(0);
            self.currently_polling.store(true, Ordering::Release);
            let res = self.ring.borrow().submit_and_wait(1);
            self.currently_polling.store(false, Ordering::Release);
            match res {
                Ok(_) => return,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => {
                    // A signal interrupted the wait. With runnable fibers we
                    // return to the scheduler; otherwise restart the wait.
                    if !self.runqueue.is_empty() {
                        return;
                    }
                }
                Err(e) => {
                    swarn!("ring wait failed: {}", e);
                    return;
                }
            }
        }
    }

    /// Drain and dispatch every ready completion, in ring order.
    pub(crate) fn drain_completions(&self) {
        let mut overflow_checked = false;
        loop {
            let batch: Vec<(u64, i32, u32)> = {
                let mut ring = self.ring.borrow_mut();
                ring.completion()
                    .map(|cqe| (cqe.user_data(), cqe.result(), cqe.flags()))
                    .collect()
            };
            if batch.is_empty() {
                let overflow = {
                    let mut ring = self.ring.borrow_mut();
                    ring.completion().overflow()
                };
                if overflow > 0 && !overflow_checked {
                    overflow_checked = true;
                    // Enter the kernel once to flush overflowed CQEs into
                    // the ring; the wait is satisfied by the flush itself.
                    let _ = self.ring.borrow().submit_and_wait(1);
                    continue;
                }
                return;
            }
            for (user_data, res, flags) in batch {
                self.dispatch_completion(user_data, res, flags);
            }
        }
    }

    /// Map one completion back to its context and wake the owner.
    fn dispatch_completion(&self, user_data: u64, res: i32, flags: u32) {
        if user_data == USER_DATA_NONE {
            return;
        }
        let Some(ctx) = self.store.get(user_data as u32) else {
            swarn!("completion for unknown context {}", user_data);
            return;
        };

        if ctx.ref_count() == MULTISHOT {
            ctx.set_result(res);
            self.handle_multishot_completion(&ctx, res, flags);
            return;
        }

        if ctx.id() == self.wakeup_ctx.get() {
            self.handle_wakeup_completion(&ctx);
            return;
        }

        // Chains funnel several completions into one context; the owner
        // sees the accumulated byte count, or the first failure.
        if ctx.kind() == OpKind::Chain {
            let prev = ctx.result();
            if prev >= 0 && res >= 0 {
                ctx.set_result(prev.saturating_add(res));
            } else if prev >= 0 {
                ctx.set_result(res);
            }
            // A later -ECANCELED never masks the first failure.
        } else {
            ctx.set_result(res);
        }

        if ctx.ref_count() == 2 {
            // Owner still awaiting: wake it. A fiber that was interrupted
            // mid-op has already detached (cleared the owner), so a late
            // -ECANCELED lands here only when the owner really is waiting
            // for it; deliver it like any other result.
            if let Some(owner) = ctx.owner() {
                self.schedule(&owner, ctx.wake_value(), false);
            }
        }
        self.store.release(&ctx);
    }

    /// Queue an SQE under `ctx`, defer-submit, and suspend until the
    /// completion (or an interruption) resumes us. Handles the
    /// cancellation protocol: an interrupt observed while the op is still
    /// in flight detaches the fiber and submits an async-cancel; the
    /// context and its attached buffers stay alive until the kernel
    /// delivers the cancellation completion.
    pub(crate) fn submit_op(&self, ctx: &Rc<OpCtx>, entry: squeue::Entry) -> Result<(i32, Resume)> {
        if let Err(e) = self.push_sqe(entry) {
            self.store.dispose(ctx);
            return Err(e);
        }
        self.op_count.set(self.op_count.get() + 1);
        self.defer_submit();

        let resume = self.await_switch();

        if ctx.ref_count() > 1 {
            // Not completed: the resume was an interruption. Cancel the
            // in-flight op; the context now outlives this call.
            ctx.set_result(-libc::ECANCELED);
            ctx.clear_owner();
            self.cancel_op(ctx);
            if let Err(e) = self.immediate_submit() {
                swarn!("cancel submit failed: {}", e);
            }
        }
        Ok((ctx.result(), resume))
    }

    /// Queue an async-cancel targeting `ctx`. Ownerless: its completion
    /// carries no context.
    pub(crate) fn cancel_op(&self, ctx: &Rc<OpCtx>) {
        let sqe = opcode::AsyncCancel::new(ctx.id() as u64)
            .build()
            .user_data(USER_DATA_NONE);
        if let Err(e) = self.push_sqe(sqe) {
            swarn!("failed to queue cancel for context {}: {}", ctx.id(), e);
        }
    }

    // ── Wakeup ──

    /// Keep a POLL armed on the wakeup eventfd while blocking, so an
    /// external thread can force the wait to return.
    fn arm_wakeup(&self) {
        if self.wakeup_ctx.get() != NO_WAKEUP_CTX {
            return;
        }
        let ctx = self.store.acquire(OpKind::Poll, None);
        // Fire-and-forget: single kernel share, nobody awaits it.
        ctx.set_ref_count(1);
        let sqe = opcode::PollAdd::new(Fd(self.wakeup_fd.as_raw_fd()), libc::POLLIN as u32)
            .build()
            .user_data(ctx.id() as u64);
        let pushed = {
            let mut ring = self.ring.borrow_mut();
            let mut sq = ring.submission();
            unsafe { sq.push(&sqe).is_ok() }
        };
        if pushed {
            self.pending_sqes.set(self.pending_sqes.get() + 1);
            self.wakeup_ctx.set(ctx.id());
        } else {
            // Queue full right before a blocking wait means a flush is
            // imminent anyway; try again next time around.
            self.store.dispose(&ctx);
        }
    }

    fn handle_wakeup_completion(&self, ctx: &Rc<OpCtx>) {
        self.wakeup_ctx.set(NO_WAKEUP_CTX);
        let mut drain = 0u64;
        unsafe {
            libc::read(
                self.wakeup_fd.as_raw_fd(),
                &mut drain as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
        self.store.release(ctx);
        sdebug!("woken externally");
    }

    pub(crate) fn wakeup_handle(&self) -> WakeupHandle {
        WakeupHandle {
            fd: Arc::clone(&self.wakeup_fd),
            polling: Arc::clone(&self.currently_polling),
        }
    }

    // ── Idle tasks ──

    /// Runs before each blocking wait. Periodic maintenance sheds cached
    /// fiber stacks and pool slack; the user hook runs every time. Neither
    /// may block.
    pub(crate) fn run_idle_tasks(&self) {
        if let Some(period) = self.idle_period.get() {
            let now = Instant::now();
            if now.duration_since(self.idle_last.get()) >= period {
                self.idle_last.set(now);
                self.stacks.trim();
                self.store.trim();
            }
        }
        let hook = self.idle_hook.borrow_mut().take();
        if let Some(mut hook) = hook {
            hook();
            let mut slot = self.idle_hook.borrow_mut();
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }

    // ── Fork support ──

    /// Tear down and re-create the ring after fork. In-flight contexts and
    /// queued fibers belong to the parent and are discarded.
    pub(crate) fn post_fork(&self) -> Result<()> {
        let (ring, limit) = Self::build_ring(self.cfg.ring_entries)?;
        *self.ring.borrow_mut() = ring;
        self.prepared_limit.set(limit);
        self.pending_sqes.set(0);
        self.wakeup_ctx.set(NO_WAKEUP_CTX);
        self.runqueue.clear();
        self.store.reset();
        *self.event_ctx.borrow_mut() = None;
        let event_fd = self.event_fd.replace(-1);
        if event_fd != -1 {
            unsafe { libc::close(event_fd) };
        }
        self.teardown_accept_queues();
        Ok(())
    }

    pub(crate) fn stats(&self) -> Stats {
        Stats {
            op_count: self.op_count.get(),
            poll_count: self.poll_count.get(),
            switch_count: self.switch_count.get(),
            pending_sqes: self.pending_sqes.get(),
            runqueue_len: self.runqueue.len(),
            free_contexts: self.store.free_count(),
            context_capacity: self.store.capacity(),
        }
    }
}

/// Create the wakeup eventfd at runtime construction.
pub(crate) fn create_eventfd() -> Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(Error::Os(unsafe { *libc::__errno_location() }));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Thread-safe handle that forces a parked runtime's blocking ring wait to
/// return. Cheap no-op when the runtime is not currently parked.
#[derive(Clone)]
pub struct WakeupHandle {
    fd: Arc<OwnedFd>,
    polling: Arc<AtomicBool>,
}

impl WakeupHandle {
    /// Returns true when a wake was actually posted.
    pub fn wake(&self) -> bool {
        if !self.polling.load(Ordering::Acquire) {
            return false;
        }
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN means the counter is saturated: a wake is already pending.
        ret >= 0 || unsafe { *libc::__errno_location() } == libc::EAGAIN
    }
}

/// Runtime counters.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub op_count: u64,
    pub poll_count: u64,
    pub switch_count: u64,
    pub pending_sqes: u32,
    pub runqueue_len: usize,
    pub free_contexts: usize,
    pub context_capacity: usize,
}

/// An interrupt observed while an op was in flight, converted for the
/// caller. A non-interrupt resume on the not-completed path would be a
/// runtime bug; surface it as a cancellation rather than panicking.
pub(crate) fn err_from_resume(resume: Resume) -> Error {
    match resume.check() {
        Err(e) => e,
        Ok(_) => {
            swarn!("op interrupted without an interrupt value");
            Error::Cancelled
        }
    }
}

/// Copy a plain struct into a pinned buffer so the kernel can read it
/// after the submitting frame is gone.
pub(crate) fn pin_raw<T: Copy>(value: &T) -> Buffer {
    let bytes = unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    };
    Buffer::from(bytes)
}

/// Copy a slice of plain structs into a pinned buffer.
pub(crate) fn pin_raw_slice<T: Copy>(values: &[T]) -> Buffer {
    let bytes = unsafe {
        std::slice::from_raw_parts(values.as_ptr() as *const u8, std::mem::size_of_val(values))
    };
    Buffer::from(bytes)
}
