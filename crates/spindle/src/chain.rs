//! Linked operation chains.
//!
//! A chain links a short sequence of write/send/splice SQEs with the
//! kernel's IO_LINK flag so they execute in order, without interleaving
//! from other submissions to the same fds. All entries share one context;
//! the awaiting fiber is woken by the final completion with the
//! accumulated byte count. Argument validation happens before anything is
//! queued, so a malformed chain submits nothing.

use std::os::fd::{AsRawFd, RawFd};

use io_uring::types::Fd;
use io_uring::{opcode, squeue};

use spindle_core::{Buffer, Error, Result};

use crate::Inner;
use crate::backend::err_from_resume;
use crate::store::{OpCtx, OpKind};

/// One link of a chain.
pub enum ChainOp {
    Write { fd: RawFd, buf: Buffer },
    Send { fd: RawFd, buf: Buffer, flags: i32 },
    Splice { src: RawFd, dst: RawFd, maxlen: i32 },
}

impl ChainOp {
    pub fn write(io: &impl AsRawFd, buf: impl Into<Buffer>) -> ChainOp {
        ChainOp::Write { fd: io.as_raw_fd(), buf: buf.into() }
    }

    pub fn send(io: &impl AsRawFd, buf: impl Into<Buffer>, flags: i32) -> ChainOp {
        ChainOp::Send { fd: io.as_raw_fd(), buf: buf.into(), flags }
    }

    pub fn splice(src: &impl AsRawFd, dst: &impl AsRawFd, maxlen: i32) -> ChainOp {
        ChainOp::Splice { src: src.as_raw_fd(), dst: dst.as_raw_fd(), maxlen }
    }

    fn validate(&self) -> Result<()> {
        match self {
            ChainOp::Splice { maxlen, .. } if *maxlen <= 0 => {
                Err(Error::Arg("chain splice requires a positive maxlen"))
            }
            _ => Ok(()),
        }
    }

    fn prep(&self) -> squeue::Entry {
        match self {
            ChainOp::Write { fd, buf } => {
                let (ptr, len) = buf.as_ptr_len();
                opcode::Write::new(Fd(*fd), ptr, len as u32).offset(0).build()
            }
            ChainOp::Send { fd, buf, flags } => {
                let (ptr, len) = buf.as_ptr_len();
                opcode::Send::new(Fd(*fd), ptr, len as u32).flags(*flags).build()
            }
            ChainOp::Splice { src, dst, maxlen } => {
                opcode::Splice::new(Fd(*src), -1, Fd(*dst), -1, *maxlen as u32).build()
            }
        }
    }

    fn attach_to(&self, ctx: &OpCtx) {
        match self {
            ChainOp::Write { buf, .. } | ChainOp::Send { buf, .. } => {
                ctx.attach_buffer(buf.clone())
            }
            ChainOp::Splice { .. } => {}
        }
    }
}

impl Inner {
    /// Execute the ops as one linked sequence. Returns the total bytes
    /// moved across all links.
    pub(crate) fn chain(&self, ops: &[ChainOp]) -> Result<i64> {
        if ops.is_empty() {
            return Ok(0);
        }
        for op in ops {
            op.validate()?;
        }

        let ctx = self.store.acquire(OpKind::Chain, Some(self.current()));
        let count = ops.len();
        // One share per link plus the awaiting fiber's, set before anything
        // can complete so an early completion cannot retire the context.
        ctx.set_ref_count(count as i32 + 1);

        for (i, op) in ops.iter().enumerate() {
            let mut entry = op.prep().user_data(ctx.id() as u64);
            if i != count - 1 {
                entry = entry.flags(squeue::Flags::IO_LINK);
            }
            if let Err(e) = self.push_sqe(entry) {
                if i == 0 {
                    self.store.dispose(&ctx);
                } else {
                    // A linked prefix is already queued: disown the context
                    // and cancel the partial chain.
                    ctx.clear_owner();
                    ctx.set_ref_count(i as i32);
                    ctx.set_result(-libc::ECANCELED);
                    self.cancel_op(&ctx);
                    let _ = self.immediate_submit();
                }
                return Err(e);
            }
        }

        self.op_count.set(self.op_count.get() + count as u64);
        self.defer_submit();

        let resume = self.await_switch();
        let result = ctx.result();
        let completed = self.store.release(&ctx);
        if !completed {
            for op in ops {
                op.attach_to(&ctx);
            }
            ctx.clear_owner();
            ctx.set_result(-libc::ECANCELED);
            self.cancel_op(&ctx);
            let _ = self.immediate_submit();
            return Err(err_from_resume(resume));
        }

        if result < 0 {
            return Err(Error::from_raw(result));
        }
        Ok(result as i64)
    }
}
