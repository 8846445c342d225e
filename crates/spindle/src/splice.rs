//! Kernel-side byte shoveling: splice, tee, and the pipe-backed variants.
//!
//! `double_splice` and `splice_chunks` move data between two arbitrary fds
//! through an internal pipe. The pipe ends are owned by a guard that closes
//! them on every exit path.

use std::cell::Cell;
use std::os::fd::RawFd;
use std::rc::Rc;

use io_uring::types::Fd;
use io_uring::{opcode, squeue};

use spindle_core::{Buffer, Error, Result};

use crate::Inner;
use crate::backend::err_from_resume;
use crate::store::{OpCtx, OpKind};

/// Pipe page-pair used by the double-splice paths.
const PIPE_CHUNK: u32 = 1 << 16;

/// Per-chunk decoration for `splice_chunks`: either fixed bytes or a
/// closure fed the chunk length (framed protocols render a length header).
pub enum ChunkMarker {
    Fixed(Buffer),
    Dynamic(Box<dyn Fn(usize) -> Buffer>),
}

impl ChunkMarker {
    fn render(&self, chunk_len: usize) -> Buffer {
        match self {
            ChunkMarker::Fixed(buf) => buf.clone(),
            ChunkMarker::Dynamic(f) => f(chunk_len),
        }
    }
}

/// Internal pipe whose ends are closed on drop, whatever path exits.
struct PipePair {
    read: Cell<RawFd>,
    write: Cell<RawFd>,
}

impl PipePair {
    fn new() -> Result<PipePair> {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if ret != 0 {
            return Err(Error::Os(crate::ops::errno()));
        }
        Ok(PipePair { read: Cell::new(fds[0]), write: Cell::new(fds[1]) })
    }

    fn read_fd(&self) -> RawFd {
        self.read.get()
    }

    fn write_fd(&self) -> RawFd {
        self.write.get()
    }

    /// Close the write end early so the read side observes EOF.
    fn close_write(&self) {
        let fd = self.write.replace(-1);
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
    }
}

impl Drop for PipePair {
    fn drop(&mut self) {
        for cell in [&self.read, &self.write] {
            let fd = cell.replace(-1);
            if fd >= 0 {
                unsafe { libc::close(fd) };
            }
        }
    }
}

/// A group of SQEs linked into one context, awaited as a unit. Used by
/// `splice_chunks` to run write/splice/write sequences with a single
/// bookkeeping record.
struct OpGroup {
    ctx: Rc<OpCtx>,
    entries: Vec<squeue::Entry>,
    buffers: Vec<Buffer>,
}

impl Inner {
    /// Move up to `maxlen` bytes from `src` to `dst` inside the kernel.
    /// Negative `maxlen` means splice to EOF, looping chunk by chunk.
    pub(crate) fn splice(&self, src: RawFd, dst: RawFd, maxlen: i32) -> Result<usize> {
        let to_eof = maxlen < 0;
        let chunk = maxlen.unsigned_abs();
        let mut total = 0usize;

        loop {
            let ctx = self.store.acquire(OpKind::Splice, Some(self.current()));
            let entry = opcode::Splice::new(Fd(src), -1, Fd(dst), -1, chunk)
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
            total += result as usize;
            if result == 0 || !to_eof {
                return Ok(total);
            }
        }
    }

    /// Duplicate up to `maxlen` bytes from one pipe to another without
    /// consuming them.
    pub(crate) fn tee(&self, src: RawFd, dst: RawFd, maxlen: u32) -> Result<usize> {
        let ctx = self.store.acquire(OpKind::Splice, Some(self.current()));
        let entry = opcode::Tee::new(Fd(src), Fd(dst), maxlen)
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
        Ok(result as usize)
    }

    /// Stream `src` to `dst` through an internal pipe, keeping a splice in
    /// flight on both pipe ends at once.
    pub(crate) fn double_splice(&self, src: RawFd, dst: RawFd) -> Result<usize> {
        let pipe = PipePair::new()?;
        let mut ctx_in: Option<Rc<OpCtx>> = Some(self.pipe_splice(src, pipe.write_fd())?);
        let mut ctx_out: Option<Rc<OpCtx>> = match self.pipe_splice(pipe.read_fd(), dst) {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                self.abandon_splices([ctx_in.take(), None]);
                return Err(e);
            }
        };
        let mut total = 0usize;

        loop {
            let resume = self.await_switch();

            let both_in_flight = ctx_in.as_ref().is_some_and(|c| c.ref_count() == 2)
                && ctx_out.as_ref().is_some_and(|c| c.ref_count() == 2);
            if resume.is_interrupt() || both_in_flight {
                self.abandon_splices([ctx_in.take(), ctx_out.take()]);
                resume.check()?;
                return Ok(total);
            }

            if let Some(ctx) = &ctx_in {
                if ctx.ref_count() == 1 {
                    let res = ctx.result();
                    self.store.release(ctx);
                    if res < 0 {
                        self.abandon_splices([ctx_out.take(), None]);
                        return Err(Error::from_raw(res));
                    }
                    if res == 0 {
                        // Source drained: EOF the pipe so the out-splice ends.
                        pipe.close_write();
                        ctx_in = None;
                    } else {
                        match self.pipe_splice(src, pipe.write_fd()) {
                            Ok(ctx) => ctx_in = Some(ctx),
                            Err(e) => {
                                self.abandon_splices([ctx_out.take(), None]);
                                return Err(e);
                            }
                        }
                    }
                }
            }

            if let Some(ctx) = &ctx_out {
                if ctx.ref_count() == 1 {
                    let res = ctx.result();
                    self.store.release(ctx);
                    if res < 0 {
                        self.abandon_splices([ctx_in.take(), None]);
                        return Err(Error::from_raw(res));
                    }
                    if res == 0 {
                        break;
                    }
                    total += res as usize;
                    match self.pipe_splice(pipe.read_fd(), dst) {
                        Ok(ctx) => ctx_out = Some(ctx),
                        Err(e) => {
                            self.abandon_splices([ctx_in.take(), None]);
                            return Err(e);
                        }
                    }
                }
            }
        }
        Ok(total)
    }

    /// Queue one splice owned by the current fiber, without awaiting it.
    fn pipe_splice(&self, src: RawFd, dst: RawFd) -> Result<Rc<OpCtx>> {
        let ctx = self.store.acquire(OpKind::Splice, Some(self.current()));
        let entry = opcode::Splice::new(Fd(src), -1, Fd(dst), -1, PIPE_CHUNK)
            .build()
            .user_data(ctx.id() as u64);
        if let Err(e) = self.push_sqe(entry) {
            self.store.dispose(&ctx);
            return Err(e);
        }
        self.op_count.set(self.op_count.get() + 1);
        self.defer_submit();
        Ok(ctx)
    }

    /// Detach and cancel still-live splice contexts. A context whose
    /// completion already landed is simply released; cancelling it could
    /// target a recycled id.
    fn abandon_splices(&self, ctxs: [Option<Rc<OpCtx>>; 2]) {
        for ctx in ctxs.into_iter().flatten() {
            ctx.clear_owner();
            if !self.store.release(&ctx) {
                ctx.set_result(-libc::ECANCELED);
                self.cancel_op(&ctx);
            }
        }
        let _ = self.immediate_submit();
    }

    /// Framed streaming: an optional stream prefix, then per chunk an
    /// optional marker, the chunk bytes (spliced through an internal
    /// pipe), and an optional trailing marker, then a stream postfix. The
    /// whole sequence runs as linked SQE groups that reuse one context per
    /// group to keep bookkeeping flat.
    pub(crate) fn splice_chunks(
        &self,
        src: RawFd,
        dst: RawFd,
        prefix: Option<&Buffer>,
        postfix: Option<&Buffer>,
        chunk_prefix: Option<&ChunkMarker>,
        chunk_postfix: Option<&ChunkMarker>,
        chunk_size: usize,
    ) -> Result<usize> {
        if chunk_size == 0 {
            return Err(Error::Arg("splice_chunks chunk_size must be positive"));
        }
        let pipe = PipePair::new()?;
        let mut group: Option<OpGroup> = None;
        let mut total = 0usize;

        if let Some(p) = prefix {
            self.group_write(&mut group, dst, p);
        }

        loop {
            self.group_splice(&mut group, src, pipe.write_fd(), chunk_size as u32);
            let chunk_len = self.group_await(&mut group)?;
            if chunk_len < 0 {
                return Err(Error::from_raw(chunk_len));
            }
            if chunk_len == 0 {
                break;
            }
            total += chunk_len as usize;

            if let Some(marker) = chunk_prefix {
                let rendered = marker.render(chunk_len as usize);
                self.group_write(&mut group, dst, &rendered);
            }
            self.group_splice(&mut group, pipe.read_fd(), dst, chunk_len as u32);
            if let Some(marker) = chunk_postfix {
                let rendered = marker.render(chunk_len as usize);
                self.group_write(&mut group, dst, &rendered);
            }
        }

        if let Some(p) = postfix {
            self.group_write(&mut group, dst, p);
        }
        if group.is_some() {
            let res = self.group_await(&mut group)?;
            if res < 0 {
                return Err(Error::from_raw(res));
            }
        }
        Ok(total)
    }

    fn group_write(&self, group: &mut Option<OpGroup>, fd: RawFd, buf: &Buffer) {
        let (ptr, len) = buf.as_ptr_len();
        let entry = opcode::Write::new(Fd(fd), ptr, len as u32).offset(0).build();
        self.group_add(group, OpKind::Write, entry, Some(buf.clone()));
    }

    fn group_splice(&self, group: &mut Option<OpGroup>, src: RawFd, dst: RawFd, len: u32) {
        let entry = opcode::Splice::new(Fd(src), -1, Fd(dst), -1, len).build();
        self.group_add(group, OpKind::Splice, entry, None);
    }

    fn group_add(
        &self,
        group: &mut Option<OpGroup>,
        kind: OpKind,
        entry: squeue::Entry,
        buffer: Option<Buffer>,
    ) {
        match group {
            Some(g) => {
                g.ctx.incr_ref();
                g.entries.push(entry);
                if let Some(b) = buffer {
                    g.buffers.push(b);
                }
            }
            None => {
                let ctx = self.store.acquire(kind, Some(self.current()));
                *group = Some(OpGroup {
                    ctx,
                    entries: vec![entry],
                    buffers: buffer.into_iter().collect(),
                });
            }
        }
    }

    /// Push the group's SQEs (linked head-to-tail), await the last
    /// completion, and release the context. Returns the final op's result.
    fn group_await(&self, group: &mut Option<OpGroup>) -> Result<i32> {
        let g = group.take().expect("awaiting an empty op group");
        let count = g.entries.len();

        for (i, entry) in g.entries.into_iter().enumerate() {
            let mut entry = entry.user_data(g.ctx.id() as u64);
            if i != count - 1 {
                entry = entry.flags(squeue::Flags::IO_LINK);
            }
            if let Err(e) = self.push_sqe(entry) {
                if i == 0 {
                    self.store.dispose(&g.ctx);
                } else {
                    // Linked prefix already queued: disown and cancel it.
                    g.ctx.clear_owner();
                    g.ctx.set_ref_count(i as i32);
                    g.ctx.set_result(-libc::ECANCELED);
                    self.cancel_op(&g.ctx);
                    let _ = self.immediate_submit();
                }
                return Err(e);
            }
            self.op_count.set(self.op_count.get() + 1);
        }
        self.defer_submit();

        let resume = self.await_switch();
        let result = g.ctx.result();
        let completed = self.store.release(&g.ctx);
        if !completed {
            for buf in g.buffers {
                g.ctx.attach_buffer(buf);
            }
            g.ctx.clear_owner();
            g.ctx.set_result(-libc::ECANCELED);
            self.cancel_op(&g.ctx);
            let _ = self.immediate_submit();
            return Err(err_from_resume(resume));
        }
        Ok(result)
    }
}
