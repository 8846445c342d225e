//! Op contexts: per-operation control blocks correlating ring submissions
//! with their completions.
//!
//! Contexts live in a typed pool with a fixed initial capacity and doubling
//! growth. The context's slab id doubles as the SQE `user_data`, so a
//! completion maps back to its context without raw pointers. A context is
//! returned to the free list only when its ref count reaches zero; a
//! partially completed op (fiber interrupted mid-flight) keeps the context
//! and its attached buffers alive until the kernel delivers the
//! cancellation completion.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use spindle_core::{Buffer, Resume};
use spindle_fiber::Fiber;

/// Ref count sentinel for contexts that may complete many times.
pub const MULTISHOT: i32 = -1;

/// What was submitted under this context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Poll,
    Read,
    Write,
    Writev,
    Recv,
    RecvMsg,
    Send,
    SendMsg,
    Accept,
    MultishotAccept,
    Connect,
    Splice,
    Timeout,
    Chain,
    Close,
}

pub struct OpCtx {
    id: u32,
    kind: Cell<OpKind>,
    ref_count: Cell<i32>,
    result: Cell<i32>,
    fiber: RefCell<Option<Rc<Fiber>>>,
    /// Value delivered to the owner on completion. Defaults to `Unit`;
    /// timeout scopes store their sentinel here, multishot accept stores
    /// the server fd.
    resume: RefCell<Resume>,
    /// Fast path for the common 0-1 buffer case.
    buffer0: RefCell<Option<Buffer>>,
    /// Spill for chains.
    buffers: RefCell<Vec<Buffer>>,
}

impl OpCtx {
    fn new(id: u32) -> Rc<OpCtx> {
        Rc::new(OpCtx {
            id,
            kind: Cell::new(OpKind::Poll),
            ref_count: Cell::new(0),
            result: Cell::new(0),
            fiber: RefCell::new(None),
            resume: RefCell::new(Resume::Unit),
            buffer0: RefCell::new(None),
            buffers: RefCell::new(Vec::new()),
        })
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> OpKind {
        self.kind.get()
    }

    #[inline]
    pub fn ref_count(&self) -> i32 {
        self.ref_count.get()
    }

    #[inline]
    pub fn set_ref_count(&self, rc: i32) {
        self.ref_count.set(rc);
    }

    #[inline]
    pub fn incr_ref(&self) {
        self.ref_count.set(self.ref_count.get() + 1);
    }

    #[inline]
    pub fn result(&self) -> i32 {
        self.result.get()
    }

    #[inline]
    pub fn set_result(&self, res: i32) {
        self.result.set(res);
    }

    pub fn owner(&self) -> Option<Rc<Fiber>> {
        self.fiber.borrow().clone()
    }

    pub fn clear_owner(&self) {
        *self.fiber.borrow_mut() = None;
    }

    pub fn set_resume(&self, value: Resume) {
        *self.resume.borrow_mut() = value;
    }

    /// The value the owner is woken with.
    pub fn wake_value(&self) -> Resume {
        self.resume.borrow().clone()
    }

    /// Pin a buffer until this context is released.
    pub fn attach_buffer(&self, buf: Buffer) {
        let mut b0 = self.buffer0.borrow_mut();
        if b0.is_none() {
            *b0 = Some(buf);
        } else {
            self.buffers.borrow_mut().push(buf);
        }
    }

    pub fn attached_buffers(&self) -> usize {
        self.buffer0.borrow().is_some() as usize + self.buffers.borrow().len()
    }

    fn reset(&self, kind: OpKind, owner: Option<Rc<Fiber>>) {
        self.kind.set(kind);
        self.ref_count.set(2);
        self.result.set(0);
        *self.fiber.borrow_mut() = owner;
        *self.resume.borrow_mut() = Resume::Unit;
    }

    fn clear(&self) {
        *self.fiber.borrow_mut() = None;
        *self.resume.borrow_mut() = Resume::Unit;
        *self.buffer0.borrow_mut() = None;
        self.buffers.borrow_mut().clear();
    }
}

pub struct ContextStore {
    entries: RefCell<Vec<Rc<OpCtx>>>,
    free: RefCell<Vec<u32>>,
}

impl ContextStore {
    pub fn new(initial_capacity: usize) -> Self {
        let store = ContextStore {
            entries: RefCell::new(Vec::with_capacity(initial_capacity)),
            free: RefCell::new(Vec::with_capacity(initial_capacity)),
        };
        store.grow(initial_capacity);
        store
    }

    fn grow(&self, count: usize) {
        let mut entries = self.entries.borrow_mut();
        let mut free = self.free.borrow_mut();
        for _ in 0..count {
            let id = entries.len() as u32;
            entries.push(OpCtx::new(id));
            free.push(id);
        }
    }

    /// Take a context for a fresh submission. Ref count starts at 2: one
    /// share for the in-flight submission, one for the awaiting fiber.
    pub fn acquire(&self, kind: OpKind, owner: Option<Rc<Fiber>>) -> Rc<OpCtx> {
        let popped = self.free.borrow_mut().pop();
        let id = match popped {
            Some(id) => id,
            None => {
                let cap = self.entries.borrow().len().max(1);
                self.grow(cap);
                self.free.borrow_mut().pop().unwrap()
            }
        };
        let ctx = self.entries.borrow()[id as usize].clone();
        ctx.reset(kind, owner);
        ctx
    }

    pub fn get(&self, id: u32) -> Option<Rc<OpCtx>> {
        self.entries.borrow().get(id as usize).cloned()
    }

    /// Drop one share. Returns true when the count reached zero and the
    /// context (with its attached buffers) went back to the free list.
    pub fn release(&self, ctx: &Rc<OpCtx>) -> bool {
        let rc = ctx.ref_count.get() - 1;
        ctx.ref_count.set(rc);
        debug_assert!(rc >= 0, "op context over-released");
        if rc > 0 {
            return false;
        }
        ctx.clear();
        self.free.borrow_mut().push(ctx.id);
        true
    }

    /// Free a multishot context outright (its ref count is the MULTISHOT
    /// sentinel, not a share count).
    pub fn release_multishot(&self, ctx: &Rc<OpCtx>) {
        debug_assert_eq!(ctx.ref_count.get(), MULTISHOT);
        ctx.ref_count.set(0);
        ctx.clear();
        self.free.borrow_mut().push(ctx.id);
    }

    /// Throw away a context whose SQE never reached the ring.
    pub fn dispose(&self, ctx: &Rc<OpCtx>) {
        ctx.ref_count.set(0);
        ctx.clear();
        self.free.borrow_mut().push(ctx.id);
    }

    pub fn free_count(&self) -> usize {
        self.free.borrow().len()
    }

    pub fn capacity(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Shed excess free-list capacity. Idle maintenance calls this.
    pub fn trim(&self) {
        self.free.borrow_mut().shrink_to_fit();
    }

    /// Forget every outstanding share and mark all contexts free. Only
    /// valid when no submission can complete anymore (post-fork).
    pub fn reset(&self) {
        let entries = self.entries.borrow();
        let mut free = self.free.borrow_mut();
        free.clear();
        for ctx in entries.iter() {
            ctx.ref_count.set(0);
            ctx.clear();
            free.push(ctx.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_cycle() {
        let store = ContextStore::new(4);
        assert_eq!(store.free_count(), 4);

        let ctx = store.acquire(OpKind::Read, None);
        assert_eq!(ctx.ref_count(), 2);
        assert_eq!(ctx.kind(), OpKind::Read);
        assert_eq!(store.free_count(), 3);

        assert!(!store.release(&ctx));
        assert!(store.release(&ctx));
        assert_eq!(store.free_count(), 4);
    }

    #[test]
    fn test_growth_doubles() {
        let store = ContextStore::new(2);
        let a = store.acquire(OpKind::Read, None);
        let b = store.acquire(OpKind::Write, None);
        assert_eq!(store.free_count(), 0);

        let c = store.acquire(OpKind::Send, None);
        assert_eq!(store.capacity(), 4);

        for ctx in [&a, &b, &c] {
            store.release(ctx);
            store.release(ctx);
        }
        assert_eq!(store.free_count(), store.capacity());
    }

    #[test]
    fn test_ids_are_stable_user_data() {
        let store = ContextStore::new(2);
        let ctx = store.acquire(OpKind::Poll, None);
        let id = ctx.id();
        let looked_up = store.get(id).unwrap();
        assert!(Rc::ptr_eq(&ctx, &looked_up));
    }

    #[test]
    fn test_buffers_released_with_context() {
        let store = ContextStore::new(2);
        let ctx = store.acquire(OpKind::Writev, None);
        ctx.attach_buffer(Buffer::from("a"));
        ctx.attach_buffer(Buffer::from("b"));
        ctx.attach_buffer(Buffer::from("c"));
        assert_eq!(ctx.attached_buffers(), 3);

        store.release(&ctx);
        assert_eq!(ctx.attached_buffers(), 3, "kept while a share remains");
        store.release(&ctx);
        assert_eq!(ctx.attached_buffers(), 0);
    }

    #[test]
    fn test_partial_release_keeps_context_out_of_pool() {
        let store = ContextStore::new(2);
        let ctx = store.acquire(OpKind::Read, None);
        assert!(!store.release(&ctx));
        // still held by the (simulated) kernel share
        assert_eq!(store.free_count(), 1);
        assert!(store.release(&ctx));
        assert_eq!(store.free_count(), 2);
    }

    #[test]
    fn test_multishot_release() {
        let store = ContextStore::new(2);
        let ctx = store.acquire(OpKind::MultishotAccept, None);
        ctx.set_ref_count(MULTISHOT);
        store.release_multishot(&ctx);
        assert_eq!(store.free_count(), 2);
    }

    #[test]
    fn test_dispose_unsubmitted() {
        let store = ContextStore::new(2);
        let ctx = store.acquire(OpKind::Chain, None);
        ctx.attach_buffer(Buffer::from("x"));
        store.dispose(&ctx);
        assert_eq!(store.free_count(), 2);
        assert_eq!(ctx.attached_buffers(), 0);
    }
}
