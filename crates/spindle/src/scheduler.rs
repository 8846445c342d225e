//! Fiber switching and scheduling.
//!
//! Strictly single-threaded cooperative: exactly one fiber executes at any
//! instant, and every suspension point is explicit. `switch_fiber` picks
//! the next runnable fiber and transfers directly to it; when the run
//! queue is empty it pumps the ring until a completion makes some fiber
//! runnable again.

use std::rc::Rc;

use spindle_core::{sdebug, swarn};
use spindle_core::{Error, Interrupt, Resume, Result};
use spindle_fiber::{self as fiber, Fiber, FiberState};

use crate::Inner;
use crate::Runtime;

impl Inner {
    pub(crate) fn current(&self) -> Rc<Fiber> {
        self.current.borrow().clone()
    }

    /// Mark a fiber runnable with the value it will be resumed with.
    /// No-op for dead fibers and for fibers already in the queue. Parked
    /// fibers stash the value for delivery on unpark.
    pub(crate) fn schedule(&self, fiber: &Rc<Fiber>, value: Resume, prioritize: bool) {
        if !fiber.is_alive() {
            return;
        }
        if fiber.is_parked() {
            fiber.stash_pending(value);
            return;
        }
        fiber.set_state(FiberState::Runnable);
        self.runqueue.push(fiber.clone(), value, prioritize);
    }

    /// Remove a fiber from the run queue without resuming it.
    pub(crate) fn unschedule(&self, fiber: &Rc<Fiber>) {
        self.runqueue.delete(fiber);
    }

    /// Transfer to the next runnable fiber, polling the ring while the
    /// queue is empty. Returns when the calling fiber is switched back in.
    pub(crate) fn switch_fiber(&self) {
        let next = loop {
            if let Some((fiber, value)) = self.runqueue.pop() {
                if !fiber.is_alive() {
                    continue;
                }
                fiber.set_resume(value);
                break fiber;
            }
            self.run_idle_tasks();
            self.poll(true);
        };

        self.switch_count.set(self.switch_count.get() + 1);
        let prev = self.current();
        if Rc::ptr_eq(&prev, &next) {
            next.set_state(FiberState::Running);
            return;
        }

        next.set_state(FiberState::Running);
        *self.current.borrow_mut() = next.clone();
        // Safety: prev is the fiber executing right now and next holds a
        // valid saved context (initialized at spawn or saved by an earlier
        // switch).
        unsafe { fiber::transfer(&prev, &next) };

        // prev is running again; free stacks of fibers that died meanwhile.
        self.reap_retired();
    }

    /// Yield without self-scheduling: only an external schedule resumes us.
    pub(crate) fn await_switch(&self) -> Resume {
        let cur = self.current();
        cur.set_state(FiberState::Waiting);
        self.switch_fiber();
        cur.take_resume()
    }

    /// Mark the current fiber runnable (at the tail) and yield.
    pub(crate) fn snooze(&self) -> Result<()> {
        let cur = self.current();
        self.schedule(&cur, Resume::Unit, false);
        self.switch_fiber();
        cur.take_resume().check()?;
        Ok(())
    }

    /// Yield until some other actor schedules us; interrupts re-raise.
    pub(crate) fn suspend(&self) -> Result<Resume> {
        self.await_switch().check()
    }

    pub(crate) fn spawn(
        self: &Rc<Self>,
        f: impl FnOnce(&Runtime) -> Result<()> + 'static,
    ) -> Result<Rc<Fiber>> {
        let stack = self.stacks.acquire()?;
        let inner = Rc::clone(self);
        let entry = Box::new(move || {
            // A dying fiber may have transferred straight here.
            inner.reap_retired();
            let rt = Runtime { inner: Rc::clone(&inner) };
            match f(&rt) {
                Ok(()) => {}
                Err(Error::Cancelled) => {
                    sdebug!("{} cancelled", inner.current().id())
                }
                Err(e) => swarn!("{} exited with error: {}", inner.current().id(), e),
            }
            inner.terminate_current();
        });

        let fiber = Fiber::new(stack, entry);
        self.fibers.borrow_mut().insert(fiber.id(), fiber.clone());
        self.schedule(&fiber, Resume::Unit, false);
        Ok(fiber)
    }

    /// Final act of every spawned fiber. Never returns.
    pub(crate) fn terminate_current(&self) -> ! {
        let cur = self.current();
        cur.set_state(FiberState::Dead);
        self.fibers.borrow_mut().remove(&cur.id());
        self.runqueue.delete(&cur);
        // The stack is still in use until the switch below completes; the
        // next fiber to run reaps it.
        self.retired.borrow_mut().push(cur);

        if self.fibers.borrow().is_empty() {
            if let Some(watcher) = self.watcher.borrow_mut().take() {
                self.schedule(&watcher, Resume::Unit, false);
            }
        }

        self.switch_fiber();
        unreachable!("dead fiber resumed");
    }

    pub(crate) fn reap_retired(&self) {
        let retired: Vec<Rc<Fiber>> = self.retired.borrow_mut().drain(..).collect();
        for fiber in retired {
            if let Some(stack) = fiber.take_stack() {
                self.stacks.release(stack);
            }
        }
    }

    /// Drive the runtime from the root fiber until all spawned fibers have
    /// terminated.
    pub(crate) fn run(&self) -> Result<()> {
        debug_assert!(
            Rc::ptr_eq(&self.current(), &self.root),
            "run() must be called from the root fiber"
        );
        loop {
            self.reap_retired();
            if self.fibers.borrow().is_empty() {
                return Ok(());
            }
            *self.watcher.borrow_mut() = Some(self.root.clone());
            self.await_switch().check()?;
        }
    }

    /// Park a fiber: resumes aimed at it are stashed until unpark.
    pub(crate) fn park(&self, fiber: &Rc<Fiber>) {
        fiber.set_parked(true);
        self.runqueue.delete(fiber);
    }

    pub(crate) fn unpark(&self, fiber: &Rc<Fiber>) {
        fiber.set_parked(false);
        if let Some(value) = fiber.take_pending() {
            self.schedule(fiber, value, false);
        }
    }

    /// Deliver a cancellation: schedule the fiber with an exception-carrying
    /// resume, ahead of ordinary wake-ups. If the fiber is mid-operation the
    /// backend submits an async-cancel when it observes the interrupt.
    pub(crate) fn cancel_fiber(&self, fiber: &Rc<Fiber>, err: Error) {
        self.schedule(fiber, Resume::Interrupt(Interrupt::Raise(err)), true);
    }
}
