//! # spindle-fiber - cooperative execution contexts
//!
//! The fiber abstraction consumed by the spindle runtime: per-fiber mmap'd
//! stacks with guard pages, a callee-saved register record, and a voluntary
//! context switch in hand-written assembly.
//!
//! A [`Fiber`] is inert data. All scheduling policy (who runs next, how
//! resume values are produced) lives in the runtime crate; this crate only
//! knows how to create, switch to, and tear down execution contexts.

pub mod arch;
pub mod stack;

use std::cell::{Cell, RefCell, UnsafeCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use spindle_core::Resume;

use arch::SavedRegs;
pub use stack::{Stack, StackPool, DEFAULT_STACK_SIZE};

/// Identity of one fiber within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        FiberId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FiberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fiber-{}", self.0)
    }
}

/// Lifecycle state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Suspended, not in the run queue.
    Waiting,
    /// In (or headed for) the run queue.
    Runnable,
    /// Currently executing.
    Running,
    /// Finished or cancelled past the point of resumption.
    Dead,
}

/// One cooperative execution context.
///
/// Fibers are reference-counted and single-threaded; interior mutability is
/// all `Cell`/`RefCell`. The register record is switched through raw
/// pointers by [`transfer`], which is why it sits in an `UnsafeCell`.
pub struct Fiber {
    id: FiberId,
    state: Cell<FiberState>,
    scheduled: Cell<bool>,
    parked: Cell<bool>,
    resume: RefCell<Resume>,
    /// Resume stashed while the fiber is parked; delivered on unpark.
    pending: RefCell<Option<Resume>>,
    regs: UnsafeCell<SavedRegs>,
    stack: RefCell<Option<Stack>>,
    entry: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl Fiber {
    /// The calling thread's own context, wrapped as a fiber. It has no
    /// owned stack; switching away saves into its register record like any
    /// other fiber.
    pub fn root() -> Rc<Fiber> {
        Rc::new(Fiber {
            id: FiberId::next(),
            state: Cell::new(FiberState::Running),
            scheduled: Cell::new(false),
            parked: Cell::new(false),
            resume: RefCell::new(Resume::Unit),
            pending: RefCell::new(None),
            regs: UnsafeCell::new(SavedRegs::zeroed()),
            stack: RefCell::new(None),
            entry: RefCell::new(None),
        })
    }

    /// Create a fiber that will run `entry` on `stack` when first switched
    /// to. The entry closure must not return; it must switch away for the
    /// last time instead (the runtime's termination path does this).
    pub fn new(stack: Stack, entry: Box<dyn FnOnce()>) -> Rc<Fiber> {
        let fiber = Rc::new(Fiber {
            id: FiberId::next(),
            state: Cell::new(FiberState::Waiting),
            scheduled: Cell::new(false),
            parked: Cell::new(false),
            resume: RefCell::new(Resume::Unit),
            pending: RefCell::new(None),
            regs: UnsafeCell::new(SavedRegs::zeroed()),
            stack: RefCell::new(Some(stack)),
            entry: RefCell::new(Some(entry)),
        });

        let top = fiber.stack.borrow().as_ref().map(|s| s.top()).unwrap();
        unsafe {
            arch::init_context(
                fiber.regs.get(),
                top,
                fiber_entry as usize,
                Rc::as_ptr(&fiber) as usize,
            );
        }
        fiber
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        self.state.get()
    }

    #[inline]
    pub fn set_state(&self, state: FiberState) {
        self.state.set(state);
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.state.get() != FiberState::Dead
    }

    #[inline]
    pub fn is_scheduled(&self) -> bool {
        self.scheduled.get()
    }

    #[inline]
    pub fn set_scheduled(&self, v: bool) {
        self.scheduled.set(v);
    }

    #[inline]
    pub fn is_parked(&self) -> bool {
        self.parked.get()
    }

    #[inline]
    pub fn set_parked(&self, v: bool) {
        self.parked.set(v);
    }

    /// Store the value the fiber will observe at its suspension point.
    pub fn set_resume(&self, value: Resume) {
        *self.resume.borrow_mut() = value;
    }

    /// Consume the stored resume value.
    pub fn take_resume(&self) -> Resume {
        std::mem::take(&mut *self.resume.borrow_mut())
    }

    /// Stash a resume that arrived while parked.
    pub fn stash_pending(&self, value: Resume) {
        *self.pending.borrow_mut() = Some(value);
    }

    pub fn take_pending(&self) -> Option<Resume> {
        self.pending.borrow_mut().take()
    }

    /// Reclaim the stack of a dead fiber for pooling.
    pub fn take_stack(&self) -> Option<Stack> {
        self.stack.borrow_mut().take()
    }

    #[inline]
    pub fn regs_ptr(&self) -> *mut SavedRegs {
        self.regs.get()
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("scheduled", &self.scheduled.get())
            .finish()
    }
}

/// Switch from `prev` to `next`. Returns when something switches back to
/// `prev`.
///
/// # Safety
///
/// `next` must hold a valid saved context (freshly initialized or saved by
/// an earlier switch), and `prev` must be the fiber currently executing on
/// this thread.
pub unsafe fn transfer(prev: &Fiber, next: &Fiber) {
    unsafe { arch::context_switch(prev.regs_ptr(), next.regs_ptr()) }
}

/// First frame of every spawned fiber: runs the boxed entry closure.
extern "C" fn fiber_entry(arg: usize) {
    let fiber = unsafe { &*(arg as *const Fiber) };
    let entry = fiber
        .entry
        .borrow_mut()
        .take()
        .expect("fiber entry closure missing");
    entry();
    unreachable!("fiber entry closure returned");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_ids_unique() {
        let a = Fiber::root();
        let b = Fiber::root();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_resume_slot() {
        let f = Fiber::root();
        f.set_resume(Resume::Value(7));
        assert_eq!(f.take_resume(), Resume::Value(7));
        assert_eq!(f.take_resume(), Resume::Unit);
    }

    #[cfg(target_arch = "x86_64")]
    mod switch {
        use super::super::arch::{self, SavedRegs};
        use super::super::stack::Stack;

        struct SwitchCtx {
            main: SavedRegs,
            fiber: SavedRegs,
            hits: u32,
        }

        extern "C" fn bounce(arg: usize) {
            let ctx = unsafe { &mut *(arg as *mut SwitchCtx) };
            ctx.hits += 1;
            unsafe { arch::context_switch(&mut ctx.fiber, &ctx.main) };
            unreachable!();
        }

        #[test]
        fn test_switch_roundtrip() {
            let stack = Stack::allocate(64 * 1024).unwrap();
            let mut ctx = SwitchCtx {
                main: SavedRegs::zeroed(),
                fiber: SavedRegs::zeroed(),
                hits: 0,
            };
            let ctx_ptr: *mut SwitchCtx = &mut ctx;
            unsafe {
                arch::init_context(
                    &raw mut (*ctx_ptr).fiber,
                    stack.top(),
                    bounce as usize,
                    ctx_ptr as usize,
                );
                arch::context_switch(&raw mut (*ctx_ptr).main, &raw const (*ctx_ptr).fiber);
            }
            assert_eq!(ctx.hits, 1);
        }
    }
}
