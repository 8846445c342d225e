//! The operation catalogue: byte I/O, socket messaging, fd readiness.
//!
//! Every op follows the same shape as the submission discipline requires:
//! acquire a context, queue the SQE, defer-submit, suspend. On a normal
//! completion the context is released in full and the kernel result is
//! interpreted; on interruption the context keeps the caller's buffers
//! alive until the cancellation completion arrives, and the interrupt is
//! surfaced as an error.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::RawFd;

use io_uring::opcode;
use io_uring::types::Fd;

use spindle_core::{Buffer, Error, Resume, Result};

use crate::Inner;
use crate::backend::{err_from_resume, pin_raw};
use crate::store::OpKind;

/// Result of one `recvmsg`.
#[derive(Debug, Clone)]
pub struct MsgInfo {
    /// Bytes received into the buffer.
    pub len: usize,
    /// Sender address, when the socket provides one.
    pub addr: Option<SocketAddr>,
    /// Kernel `msg_flags` of the received message.
    pub flags: i32,
}

impl Inner {
    /// Read up to `maxlen` bytes into `buf` at `pos`. With `to_eof`, keeps
    /// reading in `maxlen`-sized chunks until end of stream. Returns the
    /// total transferred, or `None` when the source was already at EOF.
    pub(crate) fn read(
        &self,
        fd: RawFd,
        buf: &Buffer,
        maxlen: usize,
        to_eof: bool,
        pos: usize,
    ) -> Result<Option<usize>> {
        if maxlen == 0 {
            return Ok(None);
        }
        let mut pos = pos.min(buf.len());
        let mut total = 0usize;

        loop {
            let ptr = buf.read_window(pos, maxlen);
            let ctx = self.store.acquire(OpKind::Read, Some(self.current()));
            let entry = opcode::Read::new(Fd(fd), ptr, maxlen as u32)
                .offset(u64::MAX)
                .build()
                .user_data(ctx.id() as u64);

            let (result, resume) = self.submit_op(&ctx, entry)?;
            let completed = self.store.release(&ctx);
            if !completed {
                ctx.attach_buffer(buf.clone());
                return Err(err_from_resume(resume));
            }

            if result < 0 {
                return Err(Error::from_raw(result));
            }
            if result == 0 {
                break; // EOF
            }
            let n = result as usize;
            unsafe { buf.commit(pos + n) };
            total += n;
            pos += n;
            if !to_eof {
                break;
            }
        }

        if total == 0 { Ok(None) } else { Ok(Some(total)) }
    }

    /// Invoke `step` once per chunk until EOF.
    pub(crate) fn read_loop(
        &self,
        fd: RawFd,
        maxlen: usize,
        step: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        let chunk = Buffer::with_capacity(maxlen);
        loop {
            match self.read(fd, &chunk, maxlen, false, 0)? {
                None => return Ok(()),
                Some(n) => step(&chunk.bytes()[..n])?,
            }
        }
    }

    /// Write the whole of `buf`, resubmitting on partial writes.
    pub(crate) fn write(&self, fd: RawFd, buf: &Buffer) -> Result<usize> {
        let (base, len) = buf.as_ptr_len();
        let mut written = 0usize;

        while written < len {
            let ctx = self.store.acquire(OpKind::Write, Some(self.current()));
            let entry = opcode::Write::new(
                Fd(fd),
                unsafe { base.add(written) },
                (len - written) as u32,
            )
            .offset(u64::MAX)
            .build()
            .user_data(ctx.id() as u64);

            let (result, resume) = self.submit_op(&ctx, entry)?;
            let completed = self.store.release(&ctx);
            if !completed {
                ctx.attach_buffer(buf.clone());
                return Err(err_from_resume(resume));
            }

            if result < 0 {
                return Err(Error::from_raw(result));
            }
            written += result as usize;
        }
        Ok(len)
    }

    /// Gathered write: indistinguishable on the wire from writing the
    /// concatenation of `bufs`.
    pub(crate) fn writev(&self, fd: RawFd, bufs: &[Buffer]) -> Result<usize> {
        // (addr, len) spans, advanced as the kernel consumes bytes.
        let mut spans: Vec<(usize, usize)> = bufs
            .iter()
            .map(|b| {
                let (p, l) = b.as_ptr_len();
                (p as usize, l)
            })
            .collect();
        let total: usize = spans.iter().map(|(_, l)| l).sum();
        let mut written = 0usize;
        let mut first = 0usize;

        while written < total {
            let iov: Vec<libc::iovec> = spans[first..]
                .iter()
                .map(|&(addr, len)| libc::iovec {
                    iov_base: addr as *mut libc::c_void,
                    iov_len: len,
                })
                .collect();
            let iov_buf = crate::backend::pin_raw_slice(&iov);
            let (iov_ptr, _) = iov_buf.as_ptr_len();

            let ctx = self.store.acquire(OpKind::Writev, Some(self.current()));
            let entry = opcode::Writev::new(
                Fd(fd),
                iov_ptr as *const libc::iovec,
                iov.len() as u32,
            )
            .offset(u64::MAX)
            .build()
            .user_data(ctx.id() as u64);

            let (result, resume) = self.submit_op(&ctx, entry)?;
            let completed = self.store.release(&ctx);
            if !completed {
                ctx.attach_buffer(iov_buf);
                for b in bufs {
                    ctx.attach_buffer(b.clone());
                }
                return Err(err_from_resume(resume));
            }

            if result < 0 {
                return Err(Error::from_raw(result));
            }
            written += result as usize;

            let mut n = result as usize;
            while n > 0 {
                let (addr, len) = spans[first];
                if n < len {
                    spans[first] = (addr + n, len - n);
                    n = 0;
                } else {
                    n -= len;
                    first += 1;
                }
            }
        }
        Ok(total)
    }

    /// Receive once into `buf` at `pos`. `None` on a zero-byte read.
    pub(crate) fn recv(
        &self,
        fd: RawFd,
        buf: &Buffer,
        maxlen: usize,
        pos: usize,
    ) -> Result<Option<usize>> {
        if maxlen == 0 {
            return Ok(None);
        }
        let pos = pos.min(buf.len());
        let ptr = buf.read_window(pos, maxlen);

        let ctx = self.store.acquire(OpKind::Recv, Some(self.current()));
        let entry = opcode::Recv::new(Fd(fd), ptr, maxlen as u32)
            .build()
            .user_data(ctx.id() as u64);

        let (result, resume) = self.submit_op(&ctx, entry)?;
        let completed = self.store.release(&ctx);
        if !completed {
            ctx.attach_buffer(buf.clone());
            return Err(err_from_resume(resume));
        }

        if result < 0 {
            return Err(Error::from_raw(result));
        }
        if result == 0 {
            return Ok(None);
        }
        let n = result as usize;
        unsafe { buf.commit(pos + n) };
        Ok(Some(n))
    }

    /// Invoke `step` once per received chunk until the peer shuts down.
    pub(crate) fn recv_loop(
        &self,
        fd: RawFd,
        maxlen: usize,
        step: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        let chunk = Buffer::with_capacity(maxlen);
        loop {
            match self.recv(fd, &chunk, maxlen, 0)? {
                None => return Ok(()),
                Some(n) => step(&chunk.bytes()[..n])?,
            }
        }
    }

    /// Receive one message with its sender address. Header and name
    /// storage are heap-pinned so a late completion after cancellation
    /// cannot touch a dead stack frame.
    pub(crate) fn recvmsg(
        &self,
        fd: RawFd,
        buf: &Buffer,
        maxlen: usize,
        pos: usize,
        flags: i32,
    ) -> Result<Option<MsgInfo>> {
        if maxlen == 0 {
            return Ok(None);
        }
        let pos = pos.min(buf.len());
        let data_ptr = buf.read_window(pos, maxlen);

        let name_buf = Buffer::from(vec![0u8; 128]);
        let (name_ptr, name_len) = name_buf.as_ptr_len();

        let iov = libc::iovec { iov_base: data_ptr as *mut libc::c_void, iov_len: maxlen };
        let iov_buf = pin_raw(&iov);
        let (iov_ptr, _) = iov_buf.as_ptr_len();

        let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
        hdr.msg_name = name_ptr as *mut libc::c_void;
        hdr.msg_namelen = name_len as libc::socklen_t;
        hdr.msg_iov = iov_ptr as *mut libc::iovec;
        hdr.msg_iovlen = 1;
        let hdr_buf = pin_raw(&hdr);
        let (hdr_ptr, _) = hdr_buf.as_ptr_len();

        let ctx = self.store.acquire(OpKind::RecvMsg, Some(self.current()));
        let entry = opcode::RecvMsg::new(Fd(fd), hdr_ptr as *mut libc::msghdr)
            .flags(flags as u32)
            .build()
            .user_data(ctx.id() as u64);

        let (result, resume) = self.submit_op(&ctx, entry)?;
        let completed = self.store.release(&ctx);
        if !completed {
            ctx.attach_buffer(buf.clone());
            ctx.attach_buffer(name_buf);
            ctx.attach_buffer(iov_buf);
            ctx.attach_buffer(hdr_buf);
            return Err(err_from_resume(resume));
        }

        if result < 0 {
            return Err(Error::from_raw(result));
        }
        if result == 0 {
            return Ok(None);
        }
        let n = result as usize;
        unsafe { buf.commit(pos + n) };

        let hdr_out: libc::msghdr = unsafe { std::ptr::read(hdr_ptr as *const libc::msghdr) };
        let addr = sockaddr_parse(&name_buf.bytes(), hdr_out.msg_namelen as usize);
        Ok(Some(MsgInfo { len: n, addr, flags: hdr_out.msg_flags }))
    }

    /// Send the whole of `buf` with the given socket flags.
    pub(crate) fn send(&self, fd: RawFd, buf: &Buffer, flags: i32) -> Result<usize> {
        let (base, len) = buf.as_ptr_len();
        let mut sent = 0usize;

        while sent < len {
            let ctx = self.store.acquire(OpKind::Send, Some(self.current()));
            let entry = opcode::Send::new(Fd(fd), unsafe { base.add(sent) }, (len - sent) as u32)
                .flags(flags)
                .build()
                .user_data(ctx.id() as u64);

            let (result, resume) = self.submit_op(&ctx, entry)?;
            let completed = self.store.release(&ctx);
            if !completed {
                ctx.attach_buffer(buf.clone());
                return Err(err_from_resume(resume));
            }

            if result < 0 {
                return Err(Error::from_raw(result));
            }
            sent += result as usize;
        }
        Ok(len)
    }

    /// Send the whole of `buf` as one or more messages, optionally to an
    /// explicit destination (datagram sockets).
    pub(crate) fn sendmsg(
        &self,
        fd: RawFd,
        buf: &Buffer,
        flags: i32,
        dest: Option<SocketAddr>,
    ) -> Result<usize> {
        let (base, len) = buf.as_ptr_len();
        let name = dest.as_ref().map(sockaddr_from);
        let mut sent = 0usize;

        while sent < len {
            let iov = libc::iovec {
                iov_base: unsafe { base.add(sent) } as *mut libc::c_void,
                iov_len: len - sent,
            };
            let iov_buf = pin_raw(&iov);
            let (iov_ptr, _) = iov_buf.as_ptr_len();

            let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
            if let Some((name_buf, name_len)) = &name {
                let (name_ptr, _) = name_buf.as_ptr_len();
                hdr.msg_name = name_ptr as *mut libc::c_void;
                hdr.msg_namelen = *name_len;
            }
            hdr.msg_iov = iov_ptr as *mut libc::iovec;
            hdr.msg_iovlen = 1;
            let hdr_buf = pin_raw(&hdr);
            let (hdr_ptr, _) = hdr_buf.as_ptr_len();

            let ctx = self.store.acquire(OpKind::SendMsg, Some(self.current()));
            let entry = opcode::SendMsg::new(Fd(fd), hdr_ptr as *const libc::msghdr)
                .flags(flags as u32)
                .build()
                .user_data(ctx.id() as u64);

            let (result, resume) = self.submit_op(&ctx, entry)?;
            let completed = self.store.release(&ctx);
            if !completed {
                ctx.attach_buffer(buf.clone());
                ctx.attach_buffer(iov_buf);
                ctx.attach_buffer(hdr_buf);
                if let Some((name_buf, _)) = name {
                    ctx.attach_buffer(name_buf);
                }
                return Err(err_from_resume(resume));
            }

            if result < 0 {
                return Err(Error::from_raw(result));
            }
            sent += result as usize;
        }
        Ok(len)
    }

    /// Resolve `host:port` and connect the socket through the ring.
    pub(crate) fn connect(&self, fd: RawFd, host: &str, port: u16) -> Result<()> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(Error::from)?
            .next()
            .ok_or(Error::Arg("host resolved to no addresses"))?;
        let (addr_buf, addr_len) = sockaddr_from(&addr);
        let (addr_ptr, _) = addr_buf.as_ptr_len();

        let ctx = self.store.acquire(OpKind::Connect, Some(self.current()));
        let entry = opcode::Connect::new(Fd(fd), addr_ptr as *const libc::sockaddr, addr_len)
            .build()
            .user_data(ctx.id() as u64);

        let (result, resume) = self.submit_op(&ctx, entry)?;
        let completed = self.store.release(&ctx);
        if !completed {
            ctx.attach_buffer(addr_buf);
            return Err(err_from_resume(resume));
        }

        if result < 0 {
            return Err(Error::from_raw(result));
        }
        Ok(())
    }

    /// POLL the fd for readability or writability; the raw resume value is
    /// returned for callers that multiplex on it.
    pub(crate) fn wait_fd(&self, fd: RawFd, write: bool) -> Resume {
        let interest = if write { libc::POLLOUT } else { libc::POLLIN };
        let ctx = self.store.acquire(OpKind::Poll, Some(self.current()));
        let entry = opcode::PollAdd::new(Fd(fd), interest as u32)
            .build()
            .user_data(ctx.id() as u64);

        let resume = match self.submit_op(&ctx, entry) {
            Ok((_, resume)) => resume,
            Err(e) => Resume::Interrupt(spindle_core::Interrupt::Raise(e)),
        };
        self.store.release(&ctx);
        resume
    }

    pub(crate) fn wait_io(&self, fd: RawFd, write: bool) -> Result<()> {
        self.wait_fd(fd, write).check()?;
        Ok(())
    }

    /// Block the fiber until something schedules it. Backed by a POLL on a
    /// never-signalled eventfd so the ring always has a pending op to wait
    /// on; the poll is shared and ref-counted across all blocked fibers,
    /// and the last one out cancels it.
    pub(crate) fn wait_event(&self, raise: bool) -> Result<Resume> {
        if self.event_fd.get() == -1 {
            let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
            if fd == -1 {
                return Err(Error::Os(errno()));
            }
            self.event_fd.set(fd);
        }

        let existing = self.event_ctx.borrow().clone();
        let ctx = match existing {
            Some(ctx) => {
                ctx.incr_ref();
                ctx
            }
            None => {
                let ctx = self.store.acquire(OpKind::Poll, Some(self.current()));
                *self.event_ctx.borrow_mut() = Some(ctx.clone());
                let entry = opcode::PollAdd::new(Fd(self.event_fd.get()), libc::POLLIN as u32)
                    .build()
                    .user_data(ctx.id() as u64);
                if let Err(e) = self.push_sqe(entry) {
                    *self.event_ctx.borrow_mut() = None;
                    self.store.dispose(&ctx);
                    return Err(e);
                }
                self.op_count.set(self.op_count.get() + 1);
                self.defer_submit();
                ctx
            }
        };

        let resume = self.await_switch();
        self.store.release(&ctx);

        if ctx.ref_count() == 1 {
            // Last blocked fiber: retire the standing poll. The remaining
            // share is dropped when the cancellation completion arrives.
            self.cancel_op(&ctx);
            let _ = self.immediate_submit();
            *self.event_ctx.borrow_mut() = None;
        }

        if raise {
            return resume.check();
        }
        Ok(resume)
    }

    /// Wait for a child to exit without blocking the thread: poll a pidfd
    /// through the ring, then reap with WNOHANG. Falls back to a plain
    /// blocking wait on kernels without pidfd_open.
    pub(crate) fn waitpid(&self, pid: i32) -> Result<(i32, i32)> {
        let pidfd = unsafe {
            libc::syscall(libc::SYS_pidfd_open, pid as libc::c_long, 0 as libc::c_long)
        } as RawFd;
        if pidfd >= 0 {
            let resume = self.wait_fd(pidfd, false);
            unsafe { libc::close(pidfd) };
            resume.check()?;

            let mut status: libc::c_int = 0;
            let ret = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            if ret < 0 {
                let e = errno();
                if e == libc::ECHILD {
                    // Already reaped elsewhere.
                    return Ok((pid, 0));
                }
                return Err(Error::Os(e));
            }
            return Ok((ret, libc::WEXITSTATUS(status)));
        }

        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret < 0 {
            return Err(Error::Os(errno()));
        }
        Ok((ret, libc::WEXITSTATUS(status)))
    }

    /// Asynchronously close an fd the caller hands off to the runtime.
    pub(crate) fn close_fd(&self, fd: RawFd) -> Result<()> {
        let ctx = self.store.acquire(OpKind::Close, Some(self.current()));
        let entry = opcode::Close::new(Fd(fd)).build().user_data(ctx.id() as u64);

        let (result, resume) = self.submit_op(&ctx, entry)?;
        let completed = self.store.release(&ctx);
        if !completed {
            return Err(err_from_resume(resume));
        }
        if result < 0 {
            return Err(Error::from_raw(result));
        }
        Ok(())
    }
}

#[inline]
pub(crate) fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// Encode a socket address into a pinned buffer the kernel can read while
/// the op is in flight.
pub(crate) fn sockaddr_from(addr: &SocketAddr) -> (Buffer, libc::socklen_t) {
    match addr {
        SocketAddr::V4(a) => {
            let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(a.ip().octets());
            (pin_raw(&sin), std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(a) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_addr.s6_addr = a.ip().octets();
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_scope_id = a.scope_id();
            (pin_raw(&sin6), std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Decode a kernel-written sockaddr.
pub(crate) fn sockaddr_parse(bytes: &[u8], len: usize) -> Option<SocketAddr> {
    if len < std::mem::size_of::<libc::sa_family_t>() {
        return None;
    }
    let family = u16::from_ne_bytes([bytes[0], bytes[1]]) as i32;
    match family {
        libc::AF_INET if len >= std::mem::size_of::<libc::sockaddr_in>() => {
            let sin: libc::sockaddr_in =
                unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const _) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 if len >= std::mem::size_of::<libc::sockaddr_in6>() => {
            let sin6: libc::sockaddr_in6 =
                unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const _) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_roundtrip_v4() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let (buf, len) = sockaddr_from(&addr);
        let parsed = sockaddr_parse(&buf.bytes(), len as usize).unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn test_sockaddr_roundtrip_v6() {
        let addr: SocketAddr = "[::1]:9090".parse().unwrap();
        let (buf, len) = sockaddr_from(&addr);
        let parsed = sockaddr_parse(&buf.bytes(), len as usize).unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn test_sockaddr_parse_rejects_short() {
        assert!(sockaddr_parse(&[0u8; 1], 1).is_none());
        assert!(sockaddr_parse(&[0u8; 4], 4).is_none());
    }
}
