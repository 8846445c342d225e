//! Ring-backed time: sleep, drift-corrected periodic loops, and the
//! per-op timeout scope.
//!
//! A timeout scope submits a TIMEOUT SQE whose completion, if it fires
//! first, resumes the owning fiber with a token-stamped sentinel. The
//! innermost scope whose token matches consumes the sentinel; everything
//! else propagates unchanged.

use std::rc::Rc;
use std::time::{Duration, Instant};

use io_uring::{opcode, types};

use spindle_core::{Error, Interrupt, Resume, Result, Token};

use crate::Inner;
use crate::backend::pin_raw;
use crate::store::{OpCtx, OpKind};

fn timespec_of(duration: Duration) -> types::Timespec {
    types::Timespec::new()
        .sec(duration.as_secs())
        .nsec(duration.subsec_nanos())
}

impl Inner {
    /// Queue a TIMEOUT SQE owned by the current fiber, delivering `wake`
    /// when it fires. The timespec is pinned to the context so the kernel
    /// can read it whenever the deferred submit happens; the wake value is
    /// stored before the SQE can reach the kernel.
    fn prep_timeout(&self, duration: Duration, wake: Resume) -> Result<Rc<OpCtx>> {
        let ts = timespec_of(duration);
        let ts_buf = pin_raw(&ts);
        let (ts_ptr, _) = ts_buf.as_ptr_len();

        let ctx = self.store.acquire(OpKind::Timeout, Some(self.current()));
        ctx.attach_buffer(ts_buf);
        ctx.set_resume(wake);
        let entry = opcode::Timeout::new(ts_ptr as *const types::Timespec)
            .build()
            .user_data(ctx.id() as u64);
        if let Err(e) = self.push_sqe(entry) {
            self.store.dispose(&ctx);
            return Err(e);
        }
        self.op_count.set(self.op_count.get() + 1);
        Ok(ctx)
    }

    /// Submit a timeout and suspend on it. Returns whether the context
    /// fully completed along with the raw resume value.
    fn timeout_and_await(&self, duration: Duration) -> Result<(bool, Resume)> {
        let ctx = self.prep_timeout(duration, Resume::Unit)?;
        self.defer_submit();

        let resume = self.await_switch();
        if ctx.ref_count() > 1 {
            ctx.set_result(-libc::ECANCELED);
            ctx.clear_owner();
            self.cancel_op(&ctx);
            let _ = self.immediate_submit();
        }
        let completed = self.store.release(&ctx);
        Ok((completed, resume))
    }

    /// Suspend the current fiber for `duration`.
    pub(crate) fn sleep(&self, duration: Duration) -> Result<()> {
        let (_completed, resume) = self.timeout_and_await(duration)?;
        resume.check()?;
        Ok(())
    }

    /// Call `step` every `interval`, correcting for drift. Ticks the loop
    /// falls behind on are collapsed into the next future deadline, never
    /// replayed.
    pub(crate) fn timer_loop(
        &self,
        interval: Duration,
        step: &mut dyn FnMut() -> Result<()>,
    ) -> Result<()> {
        let interval_ns = interval.as_nanos().max(1) as u64;
        let epoch = Instant::now();
        let mut next_ns: u64 = 0;

        loop {
            let now_ns = epoch.elapsed().as_nanos() as u64;
            if next_ns == 0 {
                next_ns = now_ns + interval_ns;
            }
            if next_ns > now_ns {
                let (completed, resume) =
                    self.timeout_and_await(Duration::from_nanos(next_ns - now_ns))?;
                resume.check()?;
                if !completed {
                    // Woken by something other than the timer; bow out.
                    return Ok(());
                }
            } else {
                self.snooze()?;
            }

            step()?;

            loop {
                next_ns += interval_ns;
                if next_ns > now_ns {
                    break;
                }
            }
        }
    }

    /// Run `body` under a deadline enforced by a ring timeout. If the
    /// deadline fires first the sentinel is translated per the caller's
    /// policy: a supplied exception is raised, else a supplied move-on
    /// value is returned, else the timeout error propagates verbatim.
    pub(crate) fn timeout_scope<T>(
        &self,
        duration: Duration,
        exception: Option<Error>,
        move_on: Option<T>,
        body: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let token = Token::new();
        let sentinel = Resume::Interrupt(Interrupt::Timeout(token));
        let ctx = self.prep_timeout(duration, sentinel)?;
        self.defer_submit();

        let result = body();

        // Cleanup on all exit paths: cancel the timer if it is still
        // pending, drop our share, and retract a sentinel that fired after
        // the block already finished.
        let cur = self.current();
        if ctx.ref_count() == 2 {
            ctx.clear_owner();
            ctx.set_result(-libc::ECANCELED);
            self.cancel_op(&ctx);
            let _ = self.immediate_submit();
        }
        self.store.release(&ctx);
        self.runqueue.delete_if(&cur, |value| {
            matches!(value, Resume::Interrupt(Interrupt::Timeout(t)) if *t == token)
        });

        match result {
            Err(Error::Timeout(t)) if t == token => match exception {
                Some(e) => Err(e),
                None => match move_on {
                    Some(value) => Ok(value),
                    None => Err(Error::Timeout(token)),
                },
            },
            other => other,
        }
    }
}
