//! # spindle - a fiber runtime on io_uring
//!
//! Straight-line, blocking-looking code that runs concurrently on a single
//! OS thread. Each fiber owns a real stack and yields at explicit
//! suspension points: any I/O call, `snooze`, `suspend`, or a timer wait.
//! All I/O goes through one io_uring instance; the only place the thread
//! blocks is the ring's wait-for-completion call.
//!
//! ## Quick start
//!
//! ```ignore
//! use spindle::{Buffer, Runtime};
//!
//! fn main() -> spindle::Result<()> {
//!     let rt = Runtime::new()?;
//!     let listener = std::net::TcpListener::bind("127.0.0.1:4000").unwrap();
//!
//!     rt.spawn(move |rt| {
//!         rt.accept_loop(&listener, |client: std::net::TcpStream| {
//!             rt.spawn(move |rt| {
//!                 rt.read_loop(&client, 8192, |data| {
//!                     rt.write(&client, &Buffer::from(data)).map(|_| ())
//!                 })
//!             })
//!             .map(|_| ())
//!         })
//!     })?;
//!
//!     rt.run()
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Application fibers                  │
//! │        read/write/accept/splice/sleep/timeout ...       │
//! └─────────────────────────────────────────────────────────┘
//!                │ suspend                    ▲ resume(value)
//!                ▼                            │
//! ┌──────────────────────┐      ┌─────────────────────────┐
//! │      Scheduler       │◄────►│        Run queue        │
//! │  switch_fiber/snooze │      │  (fiber, resume) FIFO   │
//! └──────────────────────┘      └─────────────────────────┘
//!                │ poll when idle             ▲ completions
//!                ▼                            │
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Ring backend                       │
//! │   op contexts ── SQEs ──► io_uring ──► CQEs ── wakeups  │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod accept;
pub mod backend;
pub mod chain;
pub mod config;
pub mod ops;
pub mod runqueue;
pub mod scheduler;
pub mod splice;
pub mod store;
pub mod timeout;
pub mod timer;

#[cfg(test)]
mod tests;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use io_uring::IoUring;

pub use spindle_core::{Buffer, Error, Interrupt, Resume, Result, Token};
pub use spindle_core::{sdebug, serror, sinfo, strace, swarn};
pub use spindle_fiber::{FiberId, FiberState};

pub use backend::{Stats, WakeupHandle};
pub use chain::ChainOp;
pub use config::Config;
pub use ops::MsgInfo;
pub use splice::ChunkMarker;
pub use timer::Timer;

use spindle_fiber::{Fiber, StackPool};

use accept::AcceptQueue;
use backend::NO_WAKEUP_CTX;
use runqueue::RunQueue;
use store::{ContextStore, OpCtx};

/// Contexts preallocated at startup; the pool doubles as needed.
const INITIAL_CONTEXTS: usize = 32;

/// Shared state of one runtime: the ring, the context store, the run
/// queue, and the fiber registry. Strictly single-threaded; the only
/// cross-thread surface is the wakeup eventfd.
pub(crate) struct Inner {
    pub(crate) cfg: Config,

    // Ring backend
    pub(crate) ring: RefCell<IoUring>,
    pub(crate) prepared_limit: Cell<u32>,
    pub(crate) pending_sqes: Cell<u32>,
    pub(crate) currently_polling: Arc<AtomicBool>,
    pub(crate) multishot_supported: bool,

    // Op contexts and scheduling
    pub(crate) store: ContextStore,
    pub(crate) runqueue: RunQueue,

    // Fibers
    pub(crate) fibers: RefCell<HashMap<FiberId, Rc<Fiber>>>,
    pub(crate) current: RefCell<Rc<Fiber>>,
    pub(crate) root: Rc<Fiber>,
    pub(crate) stacks: StackPool,
    pub(crate) retired: RefCell<Vec<Rc<Fiber>>>,
    pub(crate) watcher: RefCell<Option<Rc<Fiber>>>,

    // wait_event parking
    pub(crate) event_fd: Cell<RawFd>,
    pub(crate) event_ctx: RefCell<Option<Rc<OpCtx>>>,

    // External wakeup
    pub(crate) wakeup_fd: Arc<OwnedFd>,
    pub(crate) wakeup_ctx: Cell<u32>,

    // Multishot accept FIFOs, keyed by server fd
    pub(crate) accept_queues: RefCell<HashMap<RawFd, Rc<AcceptQueue>>>,

    // Idle maintenance
    pub(crate) idle_period: Cell<Option<Duration>>,
    pub(crate) idle_last: Cell<Instant>,
    pub(crate) idle_hook: RefCell<Option<Box<dyn FnMut()>>>,

    // Counters
    pub(crate) op_count: Cell<u64>,
    pub(crate) poll_count: Cell<u64>,
    pub(crate) switch_count: Cell<u64>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let event_fd = self.event_fd.replace(-1);
        if event_fd != -1 {
            unsafe { libc::close(event_fd) };
        }
        // Close accepted-but-unclaimed fds so teardown leaks nothing.
        for queue in self.accept_queues.borrow().values() {
            queue.close_queued();
        }
    }
}

/// Handle to the runtime. Cheap to clone; all clones drive the same
/// scheduler and ring. Not `Send` - the runtime is one-thread-only by
/// design (use [`Runtime::wakeup_handle`] from other threads).
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Rc<Inner>,
}

impl Runtime {
    pub fn new() -> Result<Runtime> {
        Self::with_config(Config::from_env())
    }

    pub fn with_config(cfg: Config) -> Result<Runtime> {
        cfg.validate().map_err(Error::Arg)?;

        let (ring, limit) = Inner::build_ring(cfg.ring_entries)?;

        let mut probe = io_uring::Probe::new();
        let multishot_supported = ring.submitter().register_probe(&mut probe).is_ok()
            && probe.is_supported(io_uring::opcode::AcceptMulti::CODE);

        let wakeup_fd = Arc::new(backend::create_eventfd()?);
        let root = Fiber::root();
        let stacks = StackPool::new(cfg.stack_size);

        let inner = Rc::new(Inner {
            ring: RefCell::new(ring),
            prepared_limit: Cell::new(limit),
            pending_sqes: Cell::new(0),
            currently_polling: Arc::new(AtomicBool::new(false)),
            multishot_supported,
            store: ContextStore::new(INITIAL_CONTEXTS),
            runqueue: RunQueue::new(),
            fibers: RefCell::new(HashMap::new()),
            current: RefCell::new(root.clone()),
            root,
            stacks,
            retired: RefCell::new(Vec::new()),
            watcher: RefCell::new(None),
            event_fd: Cell::new(-1),
            event_ctx: RefCell::new(None),
            wakeup_fd,
            wakeup_ctx: Cell::new(NO_WAKEUP_CTX),
            accept_queues: RefCell::new(HashMap::new()),
            idle_period: Cell::new(cfg.idle_period),
            idle_last: Cell::new(Instant::now()),
            idle_hook: RefCell::new(None),
            op_count: Cell::new(0),
            poll_count: Cell::new(0),
            switch_count: Cell::new(0),
            cfg,
        });

        Ok(Runtime { inner })
    }

    // ── Scheduling ──

    /// Start a fiber. It becomes runnable immediately and first runs at
    /// the next switch point.
    pub fn spawn(
        &self,
        body: impl FnOnce(&Runtime) -> Result<()> + 'static,
    ) -> Result<FiberHandle> {
        let fiber = self.inner.spawn(body)?;
        Ok(FiberHandle { fiber, inner: Rc::clone(&self.inner) })
    }

    /// Drive the runtime from the calling (root) fiber until every
    /// spawned fiber has terminated.
    pub fn run(&self) -> Result<()> {
        self.inner.run()
    }

    /// Let other runnable fibers go first; resumes after one queue pass.
    pub fn snooze(&self) -> Result<()> {
        self.inner.snooze()
    }

    /// Yield without self-scheduling. Resumes only when another fiber (or
    /// a timer/completion) schedules this one; returns the delivered
    /// value.
    pub fn suspend(&self) -> Result<Resume> {
        self.inner.suspend()
    }

    pub fn current_fiber(&self) -> FiberId {
        self.inner.current().id()
    }

    pub fn park_fiber(&self, handle: &FiberHandle) {
        self.inner.park(&handle.fiber);
    }

    pub fn unpark_fiber(&self, handle: &FiberHandle) {
        self.inner.unpark(&handle.fiber);
    }

    // ── Byte I/O ──

    /// Read up to `maxlen` bytes into `buf` at `pos`; with `to_eof`, read
    /// to end of stream in `maxlen` chunks. `Ok(None)` means EOF with
    /// nothing transferred.
    pub fn read(
        &self,
        io: &impl AsRawFd,
        buf: &Buffer,
        maxlen: usize,
        to_eof: bool,
        pos: usize,
    ) -> Result<Option<usize>> {
        self.inner.read(io.as_raw_fd(), buf, maxlen, to_eof, pos)
    }

    /// Invoke `step` per chunk read, until EOF.
    pub fn read_loop(
        &self,
        io: &impl AsRawFd,
        maxlen: usize,
        mut step: impl FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        self.inner.read_loop(io.as_raw_fd(), maxlen, &mut step)
    }

    /// Feed chunks read from `io` to a receiver until EOF.
    pub fn feed_loop<R>(
        &self,
        io: &impl AsRawFd,
        receiver: &mut R,
        mut step: impl FnMut(&mut R, &[u8]) -> Result<()>,
    ) -> Result<()> {
        self.inner
            .read_loop(io.as_raw_fd(), 8192, &mut |chunk| step(receiver, chunk))
    }

    /// Write all of `buf`.
    pub fn write(&self, io: &impl AsRawFd, buf: &Buffer) -> Result<usize> {
        self.inner.write(io.as_raw_fd(), buf)
    }

    /// Gathered write of all buffers, equivalent on the wire to writing
    /// their concatenation.
    pub fn writev(&self, io: &impl AsRawFd, bufs: &[Buffer]) -> Result<usize> {
        self.inner.writev(io.as_raw_fd(), bufs)
    }

    pub fn recv(
        &self,
        io: &impl AsRawFd,
        buf: &Buffer,
        maxlen: usize,
        pos: usize,
    ) -> Result<Option<usize>> {
        self.inner.recv(io.as_raw_fd(), buf, maxlen, pos)
    }

    pub fn recv_loop(
        &self,
        io: &impl AsRawFd,
        maxlen: usize,
        mut step: impl FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        self.inner.recv_loop(io.as_raw_fd(), maxlen, &mut step)
    }

    pub fn recv_feed_loop<R>(
        &self,
        io: &impl AsRawFd,
        receiver: &mut R,
        mut step: impl FnMut(&mut R, &[u8]) -> Result<()>,
    ) -> Result<()> {
        self.inner
            .recv_loop(io.as_raw_fd(), 8192, &mut |chunk| step(receiver, chunk))
    }

    pub fn recvmsg(
        &self,
        io: &impl AsRawFd,
        buf: &Buffer,
        maxlen: usize,
        pos: usize,
        flags: i32,
    ) -> Result<Option<MsgInfo>> {
        self.inner.recvmsg(io.as_raw_fd(), buf, maxlen, pos, flags)
    }

    pub fn send(&self, io: &impl AsRawFd, buf: &Buffer, flags: i32) -> Result<usize> {
        self.inner.send(io.as_raw_fd(), buf, flags)
    }

    pub fn sendmsg(
        &self,
        io: &impl AsRawFd,
        buf: &Buffer,
        flags: i32,
        dest: Option<SocketAddr>,
    ) -> Result<usize> {
        self.inner.sendmsg(io.as_raw_fd(), buf, flags, dest)
    }

    // ── Sockets ──

    /// Accept one connection, wrapped as any `From<OwnedFd>` type
    /// (`std::net::TcpStream`, `UnixStream`, or a custom wrapper).
    pub fn accept<T: From<OwnedFd>>(&self, server: &impl AsRawFd) -> Result<T> {
        self.inner.accept(server.as_raw_fd()).map(T::from)
    }

    /// Accept connections forever, handing each to `step`.
    pub fn accept_loop<T: From<OwnedFd>>(
        &self,
        server: &impl AsRawFd,
        mut step: impl FnMut(T) -> Result<()>,
    ) -> Result<()> {
        self.inner
            .accept_loop(server.as_raw_fd(), &mut |fd| step(T::from(fd)))
    }

    /// Run `body` with a standing multishot accept armed on `server`;
    /// `accept`/`accept_loop` inside the body pop from its FIFO.
    pub fn multishot_accept<T>(
        &self,
        server: &impl AsRawFd,
        body: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        self.inner.multishot_accept(server.as_raw_fd(), body)
    }

    /// Resolve and connect a socket through the ring.
    pub fn connect(&self, sock: &impl AsRawFd, host: &str, port: u16) -> Result<()> {
        self.inner.connect(sock.as_raw_fd(), host, port)
    }

    // ── Kernel-side copies ──

    /// Splice up to `maxlen` bytes; negative `maxlen` splices to EOF.
    pub fn splice(&self, src: &impl AsRawFd, dst: &impl AsRawFd, maxlen: i32) -> Result<usize> {
        self.inner.splice(src.as_raw_fd(), dst.as_raw_fd(), maxlen)
    }

    /// Stream `src` to `dst` through an internal pipe until EOF.
    pub fn double_splice(&self, src: &impl AsRawFd, dst: &impl AsRawFd) -> Result<usize> {
        self.inner.double_splice(src.as_raw_fd(), dst.as_raw_fd())
    }

    /// Duplicate pipe content without consuming it.
    pub fn tee(&self, src: &impl AsRawFd, dst: &impl AsRawFd, maxlen: u32) -> Result<usize> {
        self.inner.tee(src.as_raw_fd(), dst.as_raw_fd(), maxlen)
    }

    /// Framed streaming with optional stream/chunk prefixes and suffixes.
    #[allow(clippy::too_many_arguments)]
    pub fn splice_chunks(
        &self,
        src: &impl AsRawFd,
        dst: &impl AsRawFd,
        prefix: Option<&Buffer>,
        postfix: Option<&Buffer>,
        chunk_prefix: Option<&ChunkMarker>,
        chunk_postfix: Option<&ChunkMarker>,
        chunk_size: usize,
    ) -> Result<usize> {
        self.inner.splice_chunks(
            src.as_raw_fd(),
            dst.as_raw_fd(),
            prefix,
            postfix,
            chunk_prefix,
            chunk_postfix,
            chunk_size,
        )
    }

    /// Execute write/send/splice ops as one kernel-linked sequence.
    pub fn chain(&self, ops: &[ChainOp]) -> Result<i64> {
        self.inner.chain(ops)
    }

    // ── Time ──

    /// Suspend for `duration` (ring-timer precision).
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.inner.sleep(duration)
    }

    /// Call `step` every `interval` with drift correction.
    pub fn timer_loop(
        &self,
        interval: Duration,
        mut step: impl FnMut() -> Result<()>,
    ) -> Result<()> {
        self.inner.timer_loop(interval, &mut step)
    }

    /// Run `body` under a ring-enforced deadline. On expiry: raise
    /// `exception` if given, else return `move_on` if given, else
    /// propagate [`Error::Timeout`].
    pub fn timeout<T>(
        &self,
        duration: Duration,
        exception: Option<Error>,
        move_on: Option<T>,
        body: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        self.inner.timeout_scope(duration, exception, move_on, body)
    }

    // ── Waiting ──

    /// Suspend until the fd is readable (or writable).
    pub fn wait_io(&self, io: &impl AsRawFd, write: bool) -> Result<()> {
        self.inner.wait_io(io.as_raw_fd(), write)
    }

    /// Block until some other fiber schedules this one. With `raise`,
    /// interrupt-carrying resumes become errors; otherwise the raw resume
    /// is returned.
    pub fn wait_event(&self, raise: bool) -> Result<Resume> {
        self.inner.wait_event(raise)
    }

    /// Wait for a child process without blocking the thread. Returns
    /// `(pid, exit_status)`.
    pub fn waitpid(&self, pid: i32) -> Result<(i32, i32)> {
        self.inner.waitpid(pid)
    }

    /// Close an fd through the ring. Takes ownership; the kernel owns the
    /// close from here even if the result reports an error.
    pub fn close_fd(&self, fd: OwnedFd) -> Result<()> {
        self.inner.close_fd(fd.into_raw_fd())
    }

    // ── Control ──

    /// A `Send + Sync` handle other threads can use to interrupt this
    /// runtime's blocking ring wait.
    pub fn wakeup_handle(&self) -> WakeupHandle {
        self.inner.wakeup_handle()
    }

    /// Re-create the ring and reset in-flight state after `fork()`.
    pub fn post_fork(&self) -> Result<()> {
        self.inner.post_fork()
    }

    pub fn stats(&self) -> Stats {
        self.inner.stats()
    }

    /// Enable periodic idle maintenance (stack/context pool trimming).
    pub fn set_idle_period(&self, period: Option<Duration>) {
        self.inner.idle_period.set(period);
        self.inner.idle_last.set(Instant::now());
    }

    /// Register a hook run before each blocking wait. Must not block.
    pub fn set_idle_hook(&self, hook: impl FnMut() + 'static) {
        *self.inner.idle_hook.borrow_mut() = Some(Box::new(hook));
    }
}

/// Handle to a spawned fiber.
pub struct FiberHandle {
    fiber: Rc<Fiber>,
    inner: Rc<Inner>,
}

impl FiberHandle {
    pub fn id(&self) -> FiberId {
        self.fiber.id()
    }

    pub fn is_alive(&self) -> bool {
        self.fiber.is_alive()
    }

    /// Deliver a cancellation. If the fiber is mid-operation, the op is
    /// cancelled in the kernel as well; neither the context nor its
    /// buffers are released until the kernel confirms.
    pub fn cancel(&self) {
        self.inner.cancel_fiber(&self.fiber, Error::Cancelled);
    }

    /// Deliver a caller-chosen error instead of the generic cancellation.
    pub fn raise(&self, err: Error) {
        self.inner.cancel_fiber(&self.fiber, err);
    }

    /// Schedule a plain wake (pairs with [`Runtime::suspend`]).
    pub fn schedule(&self) {
        self.inner.schedule(&self.fiber, Resume::Unit, false);
    }

    /// Schedule a wake carrying an integer payload.
    pub fn schedule_value(&self, value: i64) {
        self.inner.schedule(&self.fiber, Resume::Value(value), false);
    }

    /// Remove a pending wake from the run queue without resuming.
    pub fn unschedule(&self) {
        self.inner.unschedule(&self.fiber);
    }
}
