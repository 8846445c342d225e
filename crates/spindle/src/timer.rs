//! Shared-granularity timer.
//!
//! One tick fiber wakes every `resolution` and walks a map of
//! {fiber -> timeout record}, scheduling every fiber whose deadline has
//! arrived. Many sleepers and deadlines multiplex onto that single tick,
//! trading precision for a constant number of kernel timers. Records are
//! removed on every exit path of the scope that created them; recurring
//! records collapse missed ticks into the next future deadline.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use spindle_core::{Error, Interrupt, Resume, Result, Token};
use spindle_fiber::{Fiber, FiberId};

use crate::{FiberHandle, Inner, Runtime};

struct TimeoutRecord {
    fiber: Rc<Fiber>,
    deadline: Instant,
    interval: Duration,
    recurring: bool,
    fire: Resume,
}

struct TimerInner {
    rt: Rc<Inner>,
    resolution: Duration,
    records: RefCell<HashMap<FiberId, TimeoutRecord>>,
    tick_fiber: RefCell<Option<Rc<Fiber>>>,
}

impl TimerInner {
    fn insert(&self, fiber: Rc<Fiber>, deadline: Instant, interval: Duration, recurring: bool, fire: Resume) {
        let id = fiber.id();
        self.records
            .borrow_mut()
            .insert(id, TimeoutRecord { fiber, deadline, interval, recurring, fire });
    }

    fn remove(&self, id: FiberId) {
        self.records.borrow_mut().remove(&id);
    }

    fn tick(&self) {
        let now = Instant::now();
        let mut due: Vec<(Rc<Fiber>, Resume)> = Vec::new();
        {
            let mut records = self.records.borrow_mut();
            for record in records.values_mut() {
                if record.deadline > now {
                    continue;
                }
                due.push((record.fiber.clone(), record.fire.clone()));
                if record.recurring {
                    // Collapse missed ticks: advance by whole intervals
                    // until strictly in the future.
                    while record.deadline <= now {
                        record.deadline += record.interval;
                    }
                }
            }
        }
        for (fiber, fire) in due {
            self.rt.schedule(&fiber, fire, false);
        }
    }
}

/// Handle to a shared-granularity timer. Clones share the tick fiber and
/// the record map. Dropping the last handle retires the tick fiber at its
/// next tick; [`Timer::stop`] retires it immediately.
#[derive(Clone)]
pub struct Timer {
    inner: Rc<TimerInner>,
}

impl Timer {
    /// Start a timer ticking at the runtime's configured resolution.
    pub fn new(rt: &Runtime) -> Result<Timer> {
        Self::with_resolution(rt, rt.inner.cfg.timer_resolution)
    }

    pub fn with_resolution(rt: &Runtime, resolution: Duration) -> Result<Timer> {
        let inner = Rc::new(TimerInner {
            rt: Rc::clone(&rt.inner),
            resolution,
            records: RefCell::new(HashMap::new()),
            tick_fiber: RefCell::new(None),
        });

        let weak = Rc::downgrade(&inner);
        let fiber = rt.inner.spawn(move |rt| {
            loop {
                rt.inner.sleep(resolution)?;
                match weak.upgrade() {
                    Some(timer) => timer.tick(),
                    None => return Ok(()),
                }
            }
        })?;
        *inner.tick_fiber.borrow_mut() = Some(fiber);

        Ok(Timer { inner })
    }

    /// Suspend the current fiber until roughly `duration` from now,
    /// rounded up to the next tick.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let rt = &self.inner.rt;
        let cur = rt.current();
        self.inner.insert(
            cur.clone(),
            Instant::now() + duration,
            duration,
            false,
            Resume::Unit,
        );
        let result = rt.suspend();
        self.inner.remove(cur.id());
        result.map(|_| ())
    }

    /// Spawn a fiber that runs `body` after `duration`.
    pub fn after(
        &self,
        duration: Duration,
        body: impl FnOnce(&Runtime) -> Result<()> + 'static,
    ) -> Result<FiberHandle> {
        let timer = self.clone();
        let rt = Runtime { inner: Rc::clone(&self.inner.rt) };
        rt.spawn(move |rt| {
            timer.sleep(duration)?;
            body(rt)
        })
    }

    /// Run `step` once per `interval` until it fails or the fiber is
    /// cancelled. Ticks are never lost or doubled; when the loop falls
    /// behind, missed ticks collapse into the next one.
    pub fn every(&self, interval: Duration, mut step: impl FnMut() -> Result<()>) -> Result<()> {
        let rt = &self.inner.rt;
        let cur = rt.current();
        self.inner.insert(
            cur.clone(),
            Instant::now() + interval,
            interval,
            true,
            Resume::Unit,
        );
        let result = loop {
            if let Err(e) = rt.suspend() {
                break Err(e);
            }
            if let Err(e) = step() {
                break Err(e);
            }
        };
        self.inner.remove(cur.id());
        result
    }

    /// Run `body` under a deadline; if it expires first, the body is
    /// interrupted and [`Error::Cancelled`] is raised to the caller.
    pub fn cancel_after<T>(
        &self,
        duration: Duration,
        body: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        self.deadline_scope(duration, None, body)
    }

    /// `cancel_after` with a caller-supplied error to raise instead.
    pub fn cancel_after_with<T>(
        &self,
        duration: Duration,
        exception: Error,
        body: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        self.deadline_scope(duration, Some(exception), body)
    }

    /// Run `body` under a deadline; if it expires first, return `value`
    /// instead of an error.
    pub fn move_on_after<T>(
        &self,
        duration: Duration,
        value: T,
        body: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        match self.token_scope(duration, body) {
            (Err(Error::Timeout(t)), token) if t == token => Ok(value),
            (other, _) => other,
        }
    }

    fn deadline_scope<T>(
        &self,
        duration: Duration,
        exception: Option<Error>,
        body: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        match self.token_scope(duration, body) {
            (Err(Error::Timeout(t)), token) if t == token => {
                Err(exception.unwrap_or(Error::Cancelled))
            }
            (other, _) => other,
        }
    }

    /// Common deadline plumbing: arm a token-stamped record around `body`,
    /// guarantee removal, and retract a sentinel that fired after the body
    /// had already finished.
    fn token_scope<T>(
        &self,
        duration: Duration,
        body: impl FnOnce() -> Result<T>,
    ) -> (Result<T>, Token) {
        let rt = &self.inner.rt;
        let cur = rt.current();
        let token = Token::new();
        self.inner.insert(
            cur.clone(),
            Instant::now() + duration,
            duration,
            false,
            Resume::Interrupt(Interrupt::Timeout(token)),
        );
        let result = body();
        self.inner.remove(cur.id());
        rt.runqueue.delete_if(&cur, |value| {
            matches!(value, Resume::Interrupt(Interrupt::Timeout(t)) if *t == token)
        });
        (result, token)
    }

    /// Re-arm the current fiber's record to `now + interval`. Silent no-op
    /// when the fiber has no record.
    pub fn reset(&self) {
        let cur = self.inner.rt.current();
        if let Some(record) = self.inner.records.borrow_mut().get_mut(&cur.id()) {
            record.deadline = Instant::now() + record.interval;
        }
    }

    /// Number of armed records.
    pub fn active(&self) -> usize {
        self.inner.records.borrow().len()
    }

    pub fn resolution(&self) -> Duration {
        self.inner.resolution
    }

    /// Retire the tick fiber now instead of at its next tick.
    pub fn stop(&self) {
        if let Some(fiber) = self.inner.tick_fiber.borrow_mut().take() {
            self.inner.rt.cancel_fiber(&fiber, Error::Cancelled);
        }
    }
}
