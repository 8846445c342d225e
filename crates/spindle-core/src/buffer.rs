//! Shared byte buffers handed to ring operations.
//!
//! A `Buffer` is a cheaply clonable handle to one heap allocation. Ring
//! operations read from or write into the allocation by raw pointer while
//! the owning fiber is suspended; a clone attached to an op context keeps
//! the allocation alive until the kernel is done with it, including the
//! cancellation path where the fiber has already unwound.

use std::cell::{Ref, RefCell};
use std::rc::Rc;

#[derive(Clone, Default)]
pub struct Buffer {
    inner: Rc<RefCell<Vec<u8>>>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Buffer { inner: Rc::new(RefCell::new(Vec::with_capacity(cap))) }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.inner.borrow_mut().clear();
    }

    pub fn truncate(&self, len: usize) {
        self.inner.borrow_mut().truncate(len);
    }

    /// Borrow the underlying bytes for inspection.
    pub fn bytes(&self) -> Ref<'_, Vec<u8>> {
        self.inner.borrow()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.borrow().clone()
    }

    pub fn push_slice(&self, data: &[u8]) {
        self.inner.borrow_mut().extend_from_slice(data);
    }

    /// Two handles to the same allocation?
    pub fn same_allocation(&self, other: &Buffer) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of live handles to this allocation (including this one).
    /// Lets tests observe that a pinned buffer was let go.
    pub fn handle_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    /// Base pointer and current length, for write-side ops. The pointer is
    /// only valid until the buffer is grown.
    pub fn as_ptr_len(&self) -> (*const u8, usize) {
        let v = self.inner.borrow();
        (v.as_ptr(), v.len())
    }

    /// Prepare a read window of `maxlen` bytes starting at `pos`: content
    /// past `pos` is dropped and capacity is reserved for the incoming
    /// bytes. Returns the write pointer for the kernel. The spare tail is
    /// uninitialized until [`Buffer::commit`] is called.
    pub fn read_window(&self, pos: usize, maxlen: usize) -> *mut u8 {
        let mut v = self.inner.borrow_mut();
        let pos = pos.min(v.len());
        v.truncate(pos);
        v.reserve(maxlen);
        unsafe { v.as_mut_ptr().add(pos) }
    }

    /// Set the logical length after the kernel filled the window.
    ///
    /// # Safety
    ///
    /// The first `len` bytes of the allocation must be initialized and
    /// `len` must not exceed the reserved capacity.
    pub unsafe fn commit(&self, len: usize) {
        let mut v = self.inner.borrow_mut();
        debug_assert!(len <= v.capacity());
        unsafe { v.set_len(len) };
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(v: Vec<u8>) -> Self {
        Buffer { inner: Rc::new(RefCell::new(v)) }
    }
}

impl From<&[u8]> for Buffer {
    fn from(s: &[u8]) -> Self {
        Buffer::from(s.to_vec())
    }
}

impl From<&str> for Buffer {
    fn from(s: &str) -> Self {
        Buffer::from(s.as_bytes().to_vec())
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let v = self.inner.borrow();
        write!(f, "Buffer({} bytes)", v.len())
    }
}
