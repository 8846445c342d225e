//! The run queue: fibers that are ready to run, in resume order.
//!
//! Single-threaded; the runtime is the only client. Each entry pairs a
//! fiber with the resume value it will observe. The fiber's `scheduled`
//! flag keeps any fiber from appearing twice.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use spindle_core::Resume;
use spindle_fiber::Fiber;

pub struct RunQueue {
    queue: RefCell<VecDeque<(Rc<Fiber>, Resume)>>,
}

impl RunQueue {
    pub fn new() -> Self {
        RunQueue { queue: RefCell::new(VecDeque::new()) }
    }

    /// Append (or prepend, when prioritized) a fiber. No-op if the fiber is
    /// already scheduled; the earlier resume value wins.
    pub fn push(&self, fiber: Rc<Fiber>, value: Resume, prioritize: bool) {
        if fiber.is_scheduled() {
            return;
        }
        fiber.set_scheduled(true);
        let mut q = self.queue.borrow_mut();
        if prioritize {
            q.push_front((fiber, value));
        } else {
            q.push_back((fiber, value));
        }
    }

    /// Pop the next runnable fiber, clearing its scheduled flag.
    pub fn pop(&self) -> Option<(Rc<Fiber>, Resume)> {
        let entry = self.queue.borrow_mut().pop_front();
        if let Some((fiber, _)) = &entry {
            fiber.set_scheduled(false);
        }
        entry
    }

    /// Remove a fiber if queued. Used by cancellation and unschedule.
    pub fn delete(&self, fiber: &Rc<Fiber>) -> bool {
        let mut q = self.queue.borrow_mut();
        let before = q.len();
        q.retain(|(f, _)| !Rc::ptr_eq(f, fiber));
        let removed = q.len() != before;
        if removed {
            fiber.set_scheduled(false);
        }
        removed
    }

    /// Remove a fiber's entry only when its pending resume matches `pred`.
    /// Lets a timeout scope retract a sentinel that fired after the scope
    /// already finished.
    pub fn delete_if(&self, fiber: &Rc<Fiber>, pred: impl Fn(&Resume) -> bool) -> bool {
        let mut q = self.queue.borrow_mut();
        let before = q.len();
        q.retain(|(f, v)| !(Rc::ptr_eq(f, fiber) && pred(v)));
        let removed = q.len() != before;
        if removed {
            fiber.set_scheduled(false);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    pub fn clear(&self) {
        let mut q = self.queue.borrow_mut();
        for (fiber, _) in q.drain(..) {
            fiber.set_scheduled(false);
        }
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}
